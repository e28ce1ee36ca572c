use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::{NaiveDate, NaiveTime};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::domain::{BackupMode, ContentKind, DateKey, SourceFields};
use crate::error::EpiError;

pub const DEFAULT_CONFIG_FILE: &str = "epitrend.json";
pub const DEFAULT_PUBLISH_TIME: &str = "08:00";
pub const DEFAULT_REFERENCE_DISTRICT: &str = "CZ.CZ010.CZ0100";
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 80;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub publish_time: Option<String>,
    #[serde(default)]
    pub reference_district: Option<String>,
    #[serde(default)]
    pub backup_mode: Option<BackupMode>,
    #[serde(default)]
    pub progress_interval_ms: Option<u64>,
    #[serde(default)]
    pub today: Option<String>,
    #[serde(default)]
    pub datasets: Option<Vec<Dataset>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Cases,
    Mortality,
}

impl DatasetKind {
    pub fn fields(self) -> SourceFields {
        match self {
            DatasetKind::Cases => SourceFields::CASES,
            DatasetKind::Mortality => SourceFields::DEATHS,
        }
    }

    pub fn content_kind(self) -> ContentKind {
        match self {
            DatasetKind::Cases => ContentKind::Cases,
            DatasetKind::Mortality => ContentKind::Mortality,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Dataset {
    pub name: String,
    pub url: String,
    pub min_bytes: u64,
    pub kind: DatasetKind,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub data_dir: Utf8PathBuf,
    pub publish_time: NaiveTime,
    pub reference_district: Option<String>,
    pub backup_mode: BackupMode,
    pub progress_interval: Duration,
    pub today: Option<DateKey>,
    pub datasets: Vec<Dataset>,
}

impl ResolvedConfig {
    pub fn today(&self) -> DateKey {
        self.today
            .unwrap_or_else(|| DateKey::from_date(chrono::Local::now().date_naive()))
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, EpiError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Self::resolve_config(Config::default());
        }
        if !config_path.exists() {
            return Err(EpiError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| EpiError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| EpiError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, EpiError> {
        let data_dir = match config.data_dir {
            Some(dir) => Utf8PathBuf::from(dir),
            None => default_data_dir()?,
        };

        let publish_text = config
            .publish_time
            .unwrap_or_else(|| DEFAULT_PUBLISH_TIME.to_string());
        let publish_time = NaiveTime::parse_from_str(&publish_text, "%H:%M")
            .map_err(|err| EpiError::ConfigParse(format!("publish_time {publish_text}: {err}")))?;

        let today = config
            .today
            .map(|text| {
                NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                    .map(DateKey::from_date)
                    .map_err(|err| EpiError::ConfigParse(format!("today {text}: {err}")))
            })
            .transpose()?;

        let reference_district = match config.reference_district {
            Some(code) if code.trim().is_empty() => None,
            Some(code) => Some(code),
            None => Some(DEFAULT_REFERENCE_DISTRICT.to_string()),
        };

        Ok(ResolvedConfig {
            data_dir,
            publish_time,
            reference_district,
            backup_mode: config.backup_mode.unwrap_or(BackupMode::Daily),
            progress_interval: Duration::from_millis(
                config
                    .progress_interval_ms
                    .unwrap_or(DEFAULT_PROGRESS_INTERVAL_MS),
            ),
            today,
            datasets: config.datasets.unwrap_or_else(default_datasets),
        })
    }
}

fn default_data_dir() -> Result<Utf8PathBuf, EpiError> {
    ProjectDirs::from("", "", "epitrend")
        .and_then(|dirs| Utf8PathBuf::from_path_buf(dirs.data_dir().to_path_buf()).ok())
        .ok_or_else(|| EpiError::Filesystem("unable to resolve data directory".to_string()))
}

pub fn default_datasets() -> Vec<Dataset> {
    vec![
        Dataset {
            name: "cases".to_string(),
            url: "https://onemocneni-aktualne.mzcr.cz/api/v2/covid-19/obce.csv".to_string(),
            min_bytes: 50_000_000,
            kind: DatasetKind::Cases,
        },
        Dataset {
            name: "mortality".to_string(),
            url: "https://onemocneni-aktualne.mzcr.cz/api/v2/covid-19/umrti.csv".to_string(),
            min_bytes: 500_000,
            kind: DatasetKind::Mortality,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_every_field() {
        let config = Config {
            data_dir: Some("/tmp/epitrend".to_string()),
            ..Config::default()
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.data_dir, Utf8PathBuf::from("/tmp/epitrend"));
        assert_eq!(resolved.publish_time, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
        assert_eq!(resolved.backup_mode, BackupMode::Daily);
        assert_eq!(resolved.progress_interval, Duration::from_millis(80));
        assert_eq!(resolved.datasets.len(), 2);
        assert_eq!(
            resolved.reference_district.as_deref(),
            Some(DEFAULT_REFERENCE_DISTRICT)
        );
    }

    #[test]
    fn blank_reference_disables_probe() {
        let config = Config {
            data_dir: Some("/tmp/epitrend".to_string()),
            reference_district: Some(String::new()),
            ..Config::default()
        };
        let resolved = ConfigLoader::resolve_config(config).unwrap();
        assert_eq!(resolved.reference_district, None);
    }
}
