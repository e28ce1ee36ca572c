use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use chrono::{Datelike, NaiveDateTime, NaiveTime, TimeDelta};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};

use crate::domain::DateKey;
use crate::error::EpiError;
use crate::pipeline::{DateWindow, ValueKind};
use crate::query::{self, SeriesRequest};
use crate::tree::EntityTree;

pub const PROBE_MIN_VALUES: usize = 25;
pub const PROBE_MIN_PEAK: f64 = 2.0;

pub trait Transport: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, EpiError>;
}

#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, EpiError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("epitrend/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| EpiError::DownloadHttp(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| EpiError::DownloadHttp(err.to_string()))?;
        Ok(Self { client })
    }

    fn send_with_retries(&self, url: &str) -> Result<reqwest::blocking::Response, EpiError> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            match self.client.get(url).send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(EpiError::DownloadHttp(err.to_string()));
                }
            }
        }
    }
}

impl Transport for HttpTransport {
    fn fetch(&self, url: &str) -> Result<Vec<u8>, EpiError> {
        let response = self.send_with_retries(url)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "request failed".to_string());
            return Err(EpiError::DownloadStatus { status, message });
        }
        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| EpiError::DownloadHttp(err.to_string()))
    }
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateState {
    #[serde(default)]
    pub datasets: BTreeMap<String, NaiveDateTime>,
}

impl UpdateState {
    pub fn last_success(&self, dataset: &str) -> Option<NaiveDateTime> {
        self.datasets.get(dataset).copied()
    }

    pub fn record_success(&mut self, dataset: &str, at: NaiveDateTime) {
        self.datasets.insert(dataset.to_string(), at);
    }
}

pub fn is_update_due(last: Option<NaiveDateTime>, now: NaiveDateTime, publish: NaiveTime) -> bool {
    let Some(last) = last else {
        return true;
    };
    let published_today = now.date().and_time(publish);
    let latest = if now >= published_today {
        published_today
    } else {
        published_today - TimeDelta::days(1)
    };
    last < latest
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReport {
    pub values: usize,
    pub peak: f64,
}

impl ProbeReport {
    pub fn passed(&self) -> bool {
        self.values >= PROBE_MIN_VALUES && self.peak >= PROBE_MIN_PEAK
    }
}

pub fn prior_month(today: DateKey) -> DateWindow {
    let date = today.date();
    let this_month = DateKey::from_ymd(date.year(), date.month(), 1);
    let previous = match date.month() {
        1 => DateKey::from_ymd(date.year() - 1, 12, 1),
        month => DateKey::from_ymd(date.year(), month - 1, 1),
    };
    DateWindow::new(previous, this_month)
}

pub fn sanity_probe(
    tree: &EntityTree,
    reference: &str,
    today: DateKey,
) -> Result<ProbeReport, EpiError> {
    let request = SeriesRequest {
        window: prior_month(today),
        ..SeriesRequest::new(ValueKind::NewCases)
    };
    let series = query::series(tree, reference, &request, today)?;
    let peak = series.min_max().map(|(_, max)| max).unwrap_or(0.0);
    Ok(ProbeReport {
        values: series.records.len(),
        peak,
    })
}
