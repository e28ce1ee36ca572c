use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, TimeDelta};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::EpiError;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum EntityLevel {
    World,
    Country,
    Region,
    District,
    #[value(name = "subdistrict")]
    SubDistrict,
    Municipality,
    Settlement,
}

impl EntityLevel {
    pub const ALL: [EntityLevel; 7] = [
        EntityLevel::World,
        EntityLevel::Country,
        EntityLevel::Region,
        EntityLevel::District,
        EntityLevel::SubDistrict,
        EntityLevel::Municipality,
        EntityLevel::Settlement,
    ];

    pub fn depth(self) -> usize {
        self as usize
    }

    pub fn from_depth(depth: usize) -> Option<Self> {
        Self::ALL.get(depth).copied()
    }

    pub fn child(self) -> Option<Self> {
        Self::from_depth(self.depth() + 1)
    }

    pub fn tag(self) -> char {
        match self {
            EntityLevel::World => 'W',
            EntityLevel::Country => 'Z',
            EntityLevel::Region => 'K',
            EntityLevel::District => 'O',
            EntityLevel::SubDistrict => 'M',
            EntityLevel::Municipality => 'B',
            EntityLevel::Settlement => 'V',
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|level| tag.len() == 1 && tag.starts_with(level.tag()))
    }

    pub fn name(self) -> &'static str {
        match self {
            EntityLevel::World => "world",
            EntityLevel::Country => "country",
            EntityLevel::Region => "region",
            EntityLevel::District => "district",
            EntityLevel::SubDistrict => "subdistrict",
            EntityLevel::Municipality => "municipality",
            EntityLevel::Settlement => "settlement",
        }
    }
}

impl fmt::Display for EntityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for EntityLevel {
    type Err = EpiError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_lowercase();
        Self::ALL
            .into_iter()
            .find(|level| level.name() == normalized)
            .ok_or_else(|| EpiError::InvalidLevel(value.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Population {
    male: u64,
    male_adult: u64,
    female: u64,
    female_adult: u64,
}

impl Population {
    pub fn new(male: u64, male_adult: u64, female: u64, female_adult: u64) -> Self {
        Self {
            male,
            male_adult,
            female,
            female_adult,
        }
    }

    pub fn male(&self) -> u64 {
        self.male
    }

    pub fn male_adult(&self) -> u64 {
        self.male_adult
    }

    pub fn female(&self) -> u64 {
        self.female
    }

    pub fn female_adult(&self) -> u64 {
        self.female_adult
    }

    pub fn total(&self) -> u64 {
        self.male + self.female
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Add for Population {
    type Output = Population;

    fn add(self, rhs: Population) -> Population {
        Population {
            male: self.male + rhs.male,
            male_adult: self.male_adult + rhs.male_adult,
            female: self.female + rhs.female,
            female_adult: self.female_adult + rhs.female_adult,
        }
    }
}

impl Sum for Population {
    fn sum<I: Iterator<Item = Population>>(iter: I) -> Self {
        iter.fold(Population::default(), Add::add)
    }
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(2019, 1, 1).unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateKey(NaiveDate);

impl DateKey {
    pub fn from_date(date: NaiveDate) -> Self {
        Self(date)
    }

    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    pub fn from_key(key: u32) -> Option<Self> {
        Self::from_ymd((key / 10_000) as i32, key / 100 % 100, key % 100)
    }

    pub fn from_day_index(index: i64) -> Option<Self> {
        epoch()
            .checked_add_signed(TimeDelta::try_days(index)?)
            .map(Self)
    }

    pub fn key(self) -> u32 {
        self.0.year() as u32 * 10_000 + self.0.month() * 100 + self.0.day()
    }

    pub fn day_index(self) -> i64 {
        (self.0 - epoch()).num_days()
    }

    pub fn date(self) -> NaiveDate {
        self.0
    }

    pub fn add_days(self, days: i64) -> Self {
        TimeDelta::try_days(days)
            .and_then(|delta| self.0.checked_add_signed(delta))
            .map(Self)
            .unwrap_or(if days < 0 {
                Self(NaiveDate::MIN)
            } else {
                Self(NaiveDate::MAX)
            })
    }

    pub fn parse(text: &str) -> Result<Self, EpiError> {
        let trimmed = text.trim().trim_matches('"');
        let all_digits = !trimmed.is_empty() && trimmed.chars().all(|ch| ch.is_ascii_digit());
        let parsed = if trimmed.len() == 10 && trimmed.as_bytes().get(4) == Some(&b'-') {
            NaiveDate::parse_from_str(trimmed, "%Y-%m-%d").ok().map(Self)
        } else if trimmed.len() == 8 && all_digits {
            NaiveDate::parse_from_str(trimmed, "%Y%m%d").ok().map(Self)
        } else if trimmed.len() <= 5 && all_digits {
            trimmed
                .parse::<i64>()
                .ok()
                .and_then(Self::from_day_index)
        } else {
            None
        };
        parsed.ok_or_else(|| EpiError::InvalidDate(text.to_string()))
    }
}

impl fmt::Display for DateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

impl FromStr for DateKey {
    type Err = EpiError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::parse(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SourceFields {
    pub new_count: bool,
    pub current_count: bool,
    pub deaths: bool,
}

impl SourceFields {
    pub const NEW: SourceFields = SourceFields {
        new_count: true,
        current_count: false,
        deaths: false,
    };
    pub const CURRENT: SourceFields = SourceFields {
        new_count: false,
        current_count: true,
        deaths: false,
    };
    pub const DEATHS: SourceFields = SourceFields {
        new_count: false,
        current_count: false,
        deaths: true,
    };
    pub const CASES: SourceFields = SourceFields {
        new_count: true,
        current_count: true,
        deaths: false,
    };

    pub fn is_empty(&self) -> bool {
        !(self.new_count || self.current_count || self.deaths)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub new_count: i64,
    pub current_count: i64,
    pub deaths: i64,
}

impl Observation {
    pub fn accumulate(&mut self, other: Observation) {
        self.new_count += other.new_count;
        self.current_count += other.current_count;
        self.deaths += other.deaths;
    }

    pub fn select(&self, fields: SourceFields) -> i64 {
        let mut total = 0;
        if fields.new_count {
            total += self.new_count;
        }
        if fields.current_count {
            total += self.current_count;
        }
        if fields.deaths {
            total += self.deaths;
        }
        total
    }

    pub fn clear_fields(&mut self, fields: SourceFields) {
        if fields.new_count {
            self.new_count = 0;
        }
        if fields.current_count {
            self.current_count = 0;
        }
        if fields.deaths {
            self.deaths = 0;
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Structure,
    Data,
    Pack,
    Cases,
    Population,
    Mortality,
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ContentKind::Structure => "structure",
            ContentKind::Data => "data",
            ContentKind::Pack => "pack",
            ContentKind::Cases => "cases",
            ContentKind::Population => "population",
            ContentKind::Mortality => "mortality",
        };
        write!(f, "{label}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    Structure,
    Data,
    Pack,
}

impl SaveFormat {
    pub fn content_kind(self) -> ContentKind {
        match self {
            SaveFormat::Structure => ContentKind::Structure,
            SaveFormat::Data => ContentKind::Data,
            SaveFormat::Pack => ContentKind::Pack,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum BackupMode {
    None,
    Daily,
    EverySave,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn date_key_encoding() {
        let key = DateKey::from_ymd(2020, 3, 1).unwrap();
        assert_eq!(key.key(), 20200301);
        assert_eq!(DateKey::from_key(20200301), Some(key));
        assert_eq!(key.to_string(), "2020-03-01");
    }

    #[test]
    fn parse_all_date_forms() {
        let expected = DateKey::from_ymd(2019, 1, 11).unwrap();
        assert_eq!(DateKey::parse("2019-01-11").unwrap(), expected);
        assert_eq!(DateKey::parse("20190111").unwrap(), expected);
        assert_eq!(DateKey::parse("10").unwrap(), expected);
        assert!(DateKey::parse("2019/01/11").is_err());
        assert!(DateKey::parse("").is_err());
    }

    #[test]
    fn level_tags_round_trip() {
        for level in EntityLevel::ALL {
            assert_eq!(EntityLevel::from_tag(&level.tag().to_string()), Some(level));
        }
        assert_eq!(EntityLevel::from_tag("I"), None);
        assert_eq!(EntityLevel::Settlement.child(), None);
        assert_eq!(
            EntityLevel::District.child(),
            Some(EntityLevel::SubDistrict)
        );
    }

    #[test]
    fn population_sums_elementwise() {
        let total: Population = [Population::new(1, 2, 3, 4), Population::new(10, 20, 30, 40)]
            .into_iter()
            .sum();
        assert_eq!(total, Population::new(11, 22, 33, 44));
        assert_eq!(total.total(), 44);
    }
}
