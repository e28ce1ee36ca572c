use std::io::{self, Write};

use serde::Serialize;

use crate::engine::{ProgressEvent, ProgressSink};
use crate::pipeline::{ResultSeries, ValueKind};
use crate::query::{RankedEntry, SearchHit};
use crate::queue::DrainReport;

#[derive(Debug, Clone, Serialize)]
pub struct SeriesPoint {
    pub date: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SeriesOutput {
    pub full_code: String,
    pub name: String,
    pub kind: String,
    pub scanned: usize,
    pub loaded: usize,
    pub shown: usize,
    pub points: Vec<SeriesPoint>,
}

impl SeriesOutput {
    pub fn new(series: &ResultSeries, kind: ValueKind) -> Self {
        Self {
            full_code: series.full_code.clone(),
            name: series.name.clone(),
            kind: kind.to_string(),
            scanned: series.scanned,
            loaded: series.loaded,
            shown: series.shown,
            points: series
                .values()
                .map(|(date, value)| SeriesPoint {
                    date: date.to_string(),
                    value,
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportOutput {
    pub items_run: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl From<&DrainReport> for ReportOutput {
    fn from(report: &DrainReport) -> Self {
        Self {
            items_run: report.items_run,
            errors: report.errors.clone(),
            warnings: report.warnings.clone(),
        }
    }
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_series(series: &SeriesOutput) -> io::Result<()> {
        Self::print_json(series)
    }

    pub fn print_search(hits: &[SearchHit]) -> io::Result<()> {
        Self::print_json(&hits)
    }

    pub fn print_rank(entries: &[RankedEntry]) -> io::Result<()> {
        Self::print_json(&entries)
    }

    pub fn print_report(report: &DrainReport) -> io::Result<()> {
        Self::print_json(&ReportOutput::from(report))
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

pub struct StderrProgress;

impl ProgressSink for StderrProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => eprintln!("{}", event.message),
        }
    }
}
