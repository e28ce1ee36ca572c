use std::time::Duration;

use assert_matches::assert_matches;
use chrono::NaiveTime;

use epitrend::config::{Config, ConfigLoader, DatasetKind};
use epitrend::domain::{BackupMode, DateKey, SourceFields};
use epitrend::error::EpiError;

#[test]
fn parse_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("epitrend.json");
    std::fs::write(
        &path,
        r#"{
            "data_dir": "/srv/epitrend",
            "publish_time": "06:30",
            "backup_mode": "every_save",
            "progress_interval_ms": 250,
            "today": "2021-05-04",
            "datasets": [
                {"name": "deaths", "url": "https://example.org/d.csv", "min_bytes": 10, "kind": "mortality"}
            ]
        }"#,
    )
    .unwrap();

    let resolved = ConfigLoader::resolve(path.to_str()).unwrap();
    assert_eq!(resolved.data_dir.as_str(), "/srv/epitrend");
    assert_eq!(resolved.publish_time, NaiveTime::from_hms_opt(6, 30, 0).unwrap());
    assert_eq!(resolved.backup_mode, BackupMode::EverySave);
    assert_eq!(resolved.progress_interval, Duration::from_millis(250));
    assert_eq!(resolved.today(), DateKey::from_ymd(2021, 5, 4).unwrap());
    assert_eq!(resolved.datasets.len(), 1);
    assert_eq!(resolved.datasets[0].kind, DatasetKind::Mortality);
    assert_eq!(resolved.datasets[0].kind.fields(), SourceFields::DEATHS);
}

#[test]
fn explicit_missing_config_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nope.json");
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, EpiError::MissingConfig);
}

#[test]
fn malformed_values_are_rejected() {
    let err = ConfigLoader::resolve_config(Config {
        data_dir: Some("/tmp".to_string()),
        publish_time: Some("8 o'clock".to_string()),
        ..Config::default()
    })
    .unwrap_err();
    assert_matches!(err, EpiError::ConfigParse(_));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("epitrend.json");
    std::fs::write(&path, "{ not json").unwrap();
    let err = ConfigLoader::resolve(path.to_str()).unwrap_err();
    assert_matches!(err, EpiError::ConfigParse(_));
}
