use std::collections::BTreeMap;
use std::fmt;
use std::ops::BitOr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::domain::{DateKey, SourceFields};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ValueFlags(u32);

impl ValueFlags {
    pub const NEW: ValueFlags = ValueFlags(0x0001);
    pub const CURRENT: ValueFlags = ValueFlags(0x0002);
    pub const DEATHS: ValueFlags = ValueFlags(0x0004);
    pub const PREP_AVERAGE_7: ValueFlags = ValueFlags(0x0010);
    pub const GROWTH_5: ValueFlags = ValueFlags(0x0020);
    pub const GROWTH_7: ValueFlags = ValueFlags(0x0040);
    pub const SUM_7: ValueFlags = ValueFlags(0x0080);
    pub const AVERAGE_7: ValueFlags = ValueFlags(0x0100);
    pub const AVERAGE_7_CENTERED: ValueFlags = ValueFlags(0x0200);
    pub const PER_100K: ValueFlags = ValueFlags(0x0400);
    pub const PER_1M: ValueFlags = ValueFlags(0x0800);
    pub const ROUND_0: ValueFlags = ValueFlags(0x1000);
    pub const ROUND_1: ValueFlags = ValueFlags(0x2000);
    pub const ROUND_2: ValueFlags = ValueFlags(0x4000);

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn contains(self, other: ValueFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ValueFlags {
    type Output = ValueFlags;

    fn bitor(self, rhs: ValueFlags) -> ValueFlags {
        ValueFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AverageWindow {
    Backward,
    Centered,
}

impl AverageWindow {
    fn bounds(self) -> (i64, i64) {
        match self {
            AverageWindow::Backward => (-6, 0),
            AverageWindow::Centered => (-3, 3),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SourceSelect(SourceFields),
    MovingAverage {
        window: AverageWindow,
        preparatory: bool,
    },
    GrowthCoefficient {
        offset: i64,
    },
    Sum {
        window: i64,
    },
    Normalize {
        base: u64,
    },
    Round {
        digits: u8,
    },
}

impl Stage {
    pub fn rank(&self) -> u8 {
        match self {
            Stage::SourceSelect(_) => 0,
            Stage::MovingAverage {
                preparatory: true, ..
            } => 1,
            Stage::GrowthCoefficient { .. } => 2,
            Stage::Sum { .. } => 3,
            Stage::MovingAverage {
                preparatory: false,
                ..
            } => 4,
            Stage::Normalize { .. } => 5,
            Stage::Round { .. } => 6,
        }
    }
}

/// Half-open date range `[begin, end)`; an absent bound is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateWindow {
    pub begin: Option<DateKey>,
    pub end: Option<DateKey>,
}

impl DateWindow {
    pub fn new(begin: Option<DateKey>, end: Option<DateKey>) -> Self {
        Self { begin, end }
    }

    pub fn contains(&self, date: DateKey) -> bool {
        self.begin.is_none_or(|begin| date >= begin) && self.end.is_none_or(|end| date < end)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineContext {
    pub population: u64,
    pub today: DateKey,
    pub last_trusted: Option<DateKey>,
    pub window: DateWindow,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResultRecord {
    pub raw: f64,
    pub value: f64,
    pub scratch: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ResultSeries {
    pub full_code: String,
    pub name: String,
    pub records: BTreeMap<DateKey, ResultRecord>,
    pub scanned: usize,
    pub loaded: usize,
    pub shown: usize,
}

impl ResultSeries {
    pub fn values(&self) -> impl Iterator<Item = (DateKey, f64)> + '_ {
        self.records.iter().map(|(date, record)| (*date, record.value))
    }

    pub fn min_max(&self) -> Option<(f64, f64)> {
        self.records.values().fold(None, |acc, record| {
            Some(match acc {
                None => (record.value, record.value),
                Some((min, max)) => (min.min(record.value), max.max(record.value)),
            })
        })
    }

    fn window_values(&self, date: DateKey, (lo, hi): (i64, i64)) -> impl Iterator<Item = f64> + '_ {
        self.records
            .range(date.add_days(lo)..=date.add_days(hi))
            .map(|(_, record)| record.value)
    }

    fn commit_scratch(&mut self) {
        for record in self.records.values_mut() {
            record.value = record.scratch;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Stages come out in the fixed evaluation order. Conflicting bits settle
    /// by that order: 5-day growth over 7-day, backward average over
    /// centered, per-100K over per-1M, coarsest rounding first.
    pub fn from_flags(flags: ValueFlags) -> Self {
        let mut stages = vec![Stage::SourceSelect(SourceFields {
            new_count: flags.contains(ValueFlags::NEW),
            current_count: flags.contains(ValueFlags::CURRENT),
            deaths: flags.contains(ValueFlags::DEATHS),
        })];

        if flags.contains(ValueFlags::PREP_AVERAGE_7) {
            stages.push(Stage::MovingAverage {
                window: AverageWindow::Backward,
                preparatory: true,
            });
        }
        if flags.contains(ValueFlags::GROWTH_5) {
            stages.push(Stage::GrowthCoefficient { offset: 5 });
        } else if flags.contains(ValueFlags::GROWTH_7) {
            stages.push(Stage::GrowthCoefficient { offset: 7 });
        }
        if flags.contains(ValueFlags::SUM_7) {
            stages.push(Stage::Sum { window: 7 });
        }
        if flags.contains(ValueFlags::AVERAGE_7) {
            stages.push(Stage::MovingAverage {
                window: AverageWindow::Backward,
                preparatory: false,
            });
        } else if flags.contains(ValueFlags::AVERAGE_7_CENTERED) {
            stages.push(Stage::MovingAverage {
                window: AverageWindow::Centered,
                preparatory: false,
            });
        }
        if flags.contains(ValueFlags::PER_100K) {
            stages.push(Stage::Normalize { base: 100_000 });
        } else if flags.contains(ValueFlags::PER_1M) {
            stages.push(Stage::Normalize { base: 1_000_000 });
        }
        if flags.contains(ValueFlags::ROUND_0) {
            stages.push(Stage::Round { digits: 0 });
        } else if flags.contains(ValueFlags::ROUND_1) {
            stages.push(Stage::Round { digits: 1 });
        } else if flags.contains(ValueFlags::ROUND_2) {
            stages.push(Stage::Round { digits: 2 });
        }
        Self { stages }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn source(&self) -> SourceFields {
        self.stages
            .iter()
            .find_map(|stage| match stage {
                Stage::SourceSelect(fields) => Some(*fields),
                _ => None,
            })
            .unwrap_or_default()
    }

    pub fn run(&self, raw: &BTreeMap<DateKey, i64>, context: &PipelineContext) -> ResultSeries {
        let mut series = ResultSeries {
            scanned: raw.len(),
            ..ResultSeries::default()
        };
        let yesterday = context.today.add_days(-1);
        let limit = match context.last_trusted {
            Some(trusted) => trusted.min(yesterday),
            None => yesterday,
        };
        for (date, value) in raw.range(..=limit) {
            let value = *value as f64;
            series.records.insert(
                *date,
                ResultRecord {
                    raw: value,
                    value,
                    scratch: 0.0,
                },
            );
        }
        series.loaded = series.records.len();

        for stage in &self.stages {
            match *stage {
                Stage::SourceSelect(_) => {}
                Stage::MovingAverage { window, .. } => moving_average(&mut series, window),
                Stage::GrowthCoefficient { offset } => growth_coefficient(&mut series, offset),
                Stage::Sum { window } => trailing_sum(&mut series, window, limit),
                Stage::Normalize { base } => normalize(&mut series, base, context.population),
                Stage::Round { digits } => round(&mut series, digits),
            }
        }

        series.records.retain(|date, _| {
            context.window.contains(*date)
                && *date < context.today
                && context.last_trusted.is_none_or(|trusted| *date <= trusted)
        });
        series.shown = series.records.len();
        series
    }
}

fn moving_average(series: &mut ResultSeries, window: AverageWindow) {
    let dates: Vec<DateKey> = series.records.keys().copied().collect();
    for date in dates {
        let (sum, count) = series
            .window_values(date, window.bounds())
            .fold((0.0, 0usize), |(sum, count), value| (sum + value, count + 1));
        if let Some(record) = series.records.get_mut(&date) {
            record.scratch = if count == 0 { 0.0 } else { sum / count as f64 };
        }
    }
    series.commit_scratch();
}

/// `value[d] / value[d - offset]`; days without a usable base carry the
/// last valid ratio forward, days before the first valid ratio are dropped.
fn growth_coefficient(series: &mut ResultSeries, offset: i64) {
    let dates: Vec<DateKey> = series.records.keys().copied().collect();
    let mut last_ratio: Option<f64> = None;
    let mut ratios = Vec::with_capacity(dates.len());
    for date in &dates {
        let base = series
            .records
            .get(&date.add_days(-offset))
            .map(|record| record.value);
        let current = series.records.get(date).map(|record| record.value);
        let ratio = match (base, current) {
            (Some(base), Some(current)) if base > 0.0 => {
                let ratio = current / base;
                last_ratio = Some(ratio);
                Some(ratio)
            }
            _ => last_ratio,
        };
        ratios.push((*date, ratio));
    }
    for (date, ratio) in ratios {
        match ratio {
            Some(ratio) => {
                if let Some(record) = series.records.get_mut(&date) {
                    record.value = ratio;
                }
            }
            None => {
                series.records.remove(&date);
            }
        }
    }
}

/// Sum over `[d - window + 1, d]` for every day from the first record up
/// to `limit`, missing days counting as zero.
fn trailing_sum(series: &mut ResultSeries, window: i64, limit: DateKey) {
    let Some(first) = series.records.keys().next().copied() else {
        return;
    };
    let mut summed = BTreeMap::new();
    let mut day = first;
    while day <= limit {
        let total: f64 = series.window_values(day, (1 - window, 0)).sum();
        let raw = series.records.get(&day).map_or(0.0, |record| record.raw);
        summed.insert(
            day,
            ResultRecord {
                raw,
                value: total,
                scratch: 0.0,
            },
        );
        day = day.add_days(1);
    }
    series.records = summed;
}

pub fn relative_to(value: f64, base: u64, population: u64) -> f64 {
    value * base as f64 / population as f64
}

fn normalize(series: &mut ResultSeries, base: u64, population: u64) {
    if population == 0 {
        series.records.clear();
        return;
    }
    for record in series.records.values_mut() {
        record.value = relative_to(record.value, base, population);
    }
}

fn round(series: &mut ResultSeries, digits: u8) {
    let factor = 10f64.powi(i32::from(digits));
    for record in series.records.values_mut() {
        record.value = (record.value * factor).round() / factor;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ValueKind {
    NewCases,
    NewCasesAvg7,
    NewCasesPer100k,
    NewCasesAvg7Per100k,
    NewCasesSum7Per100k,
    Growth5,
    Growth7,
    ActiveCases,
    ActivePer100k,
    Deaths,
    DeathsAvg7,
    DeathsSum7Per1m,
}

impl ValueKind {
    pub fn flags(self) -> ValueFlags {
        use ValueFlags as F;
        match self {
            ValueKind::NewCases => F::NEW,
            ValueKind::NewCasesAvg7 => F::NEW | F::AVERAGE_7 | F::ROUND_1,
            ValueKind::NewCasesPer100k => F::NEW | F::PER_100K | F::ROUND_1,
            ValueKind::NewCasesAvg7Per100k => F::NEW | F::AVERAGE_7 | F::PER_100K | F::ROUND_2,
            ValueKind::NewCasesSum7Per100k => F::NEW | F::SUM_7 | F::PER_100K | F::ROUND_1,
            ValueKind::Growth5 => F::NEW | F::PREP_AVERAGE_7 | F::GROWTH_5 | F::ROUND_2,
            ValueKind::Growth7 => F::NEW | F::PREP_AVERAGE_7 | F::GROWTH_7 | F::ROUND_2,
            ValueKind::ActiveCases => F::CURRENT,
            ValueKind::ActivePer100k => F::CURRENT | F::PER_100K | F::ROUND_1,
            ValueKind::Deaths => F::DEATHS,
            ValueKind::DeathsAvg7 => F::DEATHS | F::AVERAGE_7_CENTERED | F::ROUND_2,
            ValueKind::DeathsSum7Per1m => F::DEATHS | F::SUM_7 | F::PER_1M | F::ROUND_1,
        }
    }

    pub fn pipeline(self) -> Pipeline {
        Pipeline::from_flags(self.flags())
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_possible_value() {
            Some(value) => write!(f, "{}", value.get_name()),
            None => write!(f, "{self:?}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(index: i64) -> DateKey {
        DateKey::from_day_index(index).unwrap()
    }

    fn context(today: i64, trusted: i64) -> PipelineContext {
        PipelineContext {
            population: 1_000,
            today: day(today),
            last_trusted: Some(day(trusted)),
            window: DateWindow::default(),
        }
    }

    #[test]
    fn conflicting_bits_resolve_by_order() {
        let pipeline = Pipeline::from_flags(
            ValueFlags::NEW
                | ValueFlags::GROWTH_5
                | ValueFlags::GROWTH_7
                | ValueFlags::AVERAGE_7
                | ValueFlags::AVERAGE_7_CENTERED
                | ValueFlags::PER_100K
                | ValueFlags::PER_1M
                | ValueFlags::ROUND_0
                | ValueFlags::ROUND_2,
        );
        assert_eq!(
            pipeline.stages()[1..],
            [
                Stage::GrowthCoefficient { offset: 5 },
                Stage::MovingAverage {
                    window: AverageWindow::Backward,
                    preparatory: false
                },
                Stage::Normalize { base: 100_000 },
                Stage::Round { digits: 0 },
            ]
        );
    }

    #[test]
    fn constant_series_has_unit_growth() {
        let raw: BTreeMap<DateKey, i64> = (0..40).map(|i| (day(i), 12)).collect();
        let series = ValueKind::Growth5.pipeline().run(&raw, &context(60, 39));
        assert_eq!(series.shown, 35);
        assert!(series.values().all(|(_, value)| (value - 1.0).abs() < 1e-9));
    }

    #[test]
    fn single_observation_trailing_sum() {
        let raw = BTreeMap::from([(day(10), 9)]);
        let pipeline = Pipeline::from_flags(ValueFlags::NEW | ValueFlags::SUM_7);
        let series = pipeline.run(&raw, &context(40, 20));
        for offset in 0..7 {
            assert_eq!(series.records[&day(10 + offset)].value, 9.0);
        }
        for offset in 7..=10 {
            assert_eq!(series.records[&day(10 + offset)].value, 0.0);
        }
    }

    #[test]
    fn per_100k_uses_population() {
        assert_eq!(relative_to(10.0, 100_000, 1_000), 1_000.0);
        let raw = BTreeMap::from([(day(0), 10)]);
        let series = ValueKind::NewCasesPer100k.pipeline().run(&raw, &context(5, 0));
        assert_eq!(series.values().collect::<Vec<_>>(), vec![(day(0), 1_000.0)]);
    }

    #[test]
    fn today_and_untrusted_days_are_hidden() {
        let raw: BTreeMap<DateKey, i64> = (0..10).map(|i| (day(i), 1)).collect();
        let series = ValueKind::NewCases.pipeline().run(&raw, &context(8, 5));
        assert_eq!(series.records.keys().last(), Some(&day(5)));
        let series = ValueKind::NewCases.pipeline().run(&raw, &context(4, 9));
        assert_eq!(series.records.keys().last(), Some(&day(3)));
    }

    #[test]
    fn centered_average_uses_both_sides() {
        let raw: BTreeMap<DateKey, i64> = (0..7).map(|i| (day(i), i)).collect();
        let pipeline = Pipeline::from_flags(ValueFlags::NEW | ValueFlags::AVERAGE_7_CENTERED);
        let series = pipeline.run(&raw, &context(30, 6));
        assert_eq!(series.records[&day(3)].value, 3.0);
        assert_eq!(series.records[&day(0)].value, 1.5);
    }
}
