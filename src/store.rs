use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;
use tempfile::Builder;

use crate::domain::{BackupMode, ContentKind, SaveFormat};
use crate::error::EpiError;
use crate::web::UpdateState;

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn snapshot_path(&self) -> Utf8PathBuf {
        self.root.join("snapshot.pack")
    }

    pub fn structure_path(&self) -> Utf8PathBuf {
        self.root.join("structure.txt")
    }

    pub fn data_path(&self) -> Utf8PathBuf {
        self.root.join("data.txt")
    }

    pub fn population_path(&self) -> Utf8PathBuf {
        self.root.join("population.csv")
    }

    pub fn update_state_path(&self) -> Utf8PathBuf {
        self.root.join("update-state.json")
    }

    pub fn last_download_path(&self) -> Utf8PathBuf {
        self.root.join("last-download.csv")
    }

    pub fn backups_dir(&self) -> Utf8PathBuf {
        self.root.join("backups")
    }

    pub fn save_path(&self, format: SaveFormat) -> Utf8PathBuf {
        match format {
            SaveFormat::Pack => self.snapshot_path(),
            SaveFormat::Structure => self.structure_path(),
            SaveFormat::Data => self.data_path(),
        }
    }

    pub fn initial_files(&self) -> Vec<(Utf8PathBuf, ContentKind)> {
        let snapshot = self.snapshot_path();
        if snapshot.as_std_path().exists() {
            return vec![(snapshot, ContentKind::Pack)];
        }
        [
            (self.structure_path(), ContentKind::Structure),
            (self.population_path(), ContentKind::Population),
            (self.data_path(), ContentKind::Data),
        ]
        .into_iter()
        .filter(|(path, _)| path.as_std_path().exists())
        .collect()
    }

    pub fn ensure_root(&self) -> Result<(), EpiError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| EpiError::Filesystem(err.to_string()))
    }

    pub fn read_update_state(&self) -> Result<UpdateState, EpiError> {
        let path = self.update_state_path();
        if !path.as_std_path().exists() {
            return Ok(UpdateState::default());
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| EpiError::Filesystem(err.to_string()))?;
        serde_json::from_str(&content).map_err(|err| EpiError::Filesystem(err.to_string()))
    }

    pub fn write_update_state(&self, state: &UpdateState) -> Result<(), EpiError> {
        let content = serde_json::to_vec_pretty(state)
            .map_err(|err| EpiError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(&self.update_state_path(), &content)
    }

    pub fn write_last_download(&self, content: &[u8]) -> Result<(), EpiError> {
        Self::write_bytes_atomic(&self.last_download_path(), content)
    }

    pub fn backup_snapshot(
        &self,
        source: &Utf8Path,
        mode: BackupMode,
        now: NaiveDateTime,
    ) -> Result<Option<Utf8PathBuf>, EpiError> {
        let name = match mode {
            BackupMode::None => return Ok(None),
            BackupMode::Daily => format!("snapshot-{}.pack", now.format("%Y%m%d")),
            BackupMode::EverySave => format!("snapshot-{}.pack", now.format("%Y%m%d-%H%M%S")),
        };
        let dest = self.backups_dir().join(name);
        Self::copy_file_atomic(source, &dest)?;
        Ok(Some(dest))
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), EpiError> {
        let parent = path
            .parent()
            .ok_or_else(|| EpiError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| EpiError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix("epitrend-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| EpiError::Filesystem(err.to_string()))?;
        std::io::Write::write_all(&mut temp, content)
            .map_err(|err| EpiError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| EpiError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn copy_file_atomic(source: &Utf8Path, dest: &Utf8Path) -> Result<(), EpiError> {
        let parent = dest
            .parent()
            .ok_or_else(|| EpiError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| EpiError::Filesystem(err.to_string()))?;
        let temp = Builder::new()
            .prefix("epitrend-copy")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| EpiError::Filesystem(err.to_string()))?;
        fs::copy(source.as_std_path(), temp.path())
            .map_err(|err| EpiError::Filesystem(err.to_string()))?;
        temp.persist(dest.as_std_path())
            .map_err(|err| EpiError::Filesystem(err.to_string()))?;
        Ok(())
    }
}
