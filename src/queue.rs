use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};

use crate::config::Dataset;
use crate::domain::{ContentKind, SaveFormat};
use crate::error::EpiError;

#[derive(Debug)]
pub enum TaskAction {
    ClearAll,
    LoadInitial,
    LoadFile {
        path: PathBuf,
        expected: Option<ContentKind>,
    },
    LoadContent {
        label: String,
        bytes: Vec<u8>,
        expected: Option<ContentKind>,
    },
    DownloadUpdate {
        force: bool,
    },
    DownloadUrl(Dataset),
    DownloadDone {
        dataset: Dataset,
        outcome: Result<Vec<u8>, EpiError>,
    },
    SaveFile {
        path: PathBuf,
        format: SaveFormat,
        backup: bool,
    },
}

impl TaskAction {
    fn medium(&self) -> Medium {
        match self {
            TaskAction::LoadFile { .. } | TaskAction::SaveFile { .. } => Medium::File,
            TaskAction::LoadContent { .. } | TaskAction::DownloadDone { .. } => Medium::Buffer,
            TaskAction::DownloadUrl(_) | TaskAction::DownloadUpdate { .. } => Medium::Url,
            TaskAction::ClearAll | TaskAction::LoadInitial => Medium::None,
        }
    }
}

impl fmt::Display for TaskAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskAction::ClearAll => write!(f, "clear all"),
            TaskAction::LoadInitial => write!(f, "initial load"),
            TaskAction::LoadFile { path, .. } => write!(f, "load {}", path.display()),
            TaskAction::LoadContent { label, .. } => write!(f, "load {label}"),
            TaskAction::DownloadUpdate { .. } => write!(f, "update check"),
            TaskAction::DownloadUrl(dataset) => write!(f, "download {}", dataset.name),
            TaskAction::DownloadDone { dataset, .. } => write!(f, "apply {}", dataset.name),
            TaskAction::SaveFile { path, .. } => write!(f, "save {}", path.display()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Medium {
    None,
    File,
    Buffer,
    Url,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    None,
    Open,
    Loading,
    Loaded,
    Saving,
    Saved,
    WebDownloading,
    WebDownloaded,
    Invalid,
}

impl OperationState {
    fn allows(self, next: OperationState) -> bool {
        use OperationState::*;
        matches!(
            (self, next),
            (None, Open)
                | (Open, Loading)
                | (Loading, Loaded)
                | (None, Saving)
                | (Saving, Saved)
                | (None, WebDownloading)
                | (WebDownloading, WebDownloaded)
                | (_, Invalid)
        )
    }
}

#[derive(Debug, Clone)]
pub struct FileOperation {
    pub medium: Medium,
    pub kind: Option<ContentKind>,
    pub length: u64,
    pub position: u64,
    pub records: usize,
    pub started: Option<DateTime<Local>>,
    pub finished: Option<DateTime<Local>>,
    state: OperationState,
}

impl FileOperation {
    pub fn new(medium: Medium) -> Self {
        Self {
            medium,
            kind: None,
            length: 0,
            position: 0,
            records: 0,
            started: None,
            finished: None,
            state: OperationState::None,
        }
    }

    pub fn state(&self) -> OperationState {
        self.state
    }

    pub fn advance(&mut self, next: OperationState) -> Result<(), EpiError> {
        if !self.state.allows(next) {
            let from = self.state;
            self.state = OperationState::Invalid;
            return Err(EpiError::InvalidTransition(format!("{from:?} -> {next:?}")));
        }
        match next {
            OperationState::Open | OperationState::Saving | OperationState::WebDownloading => {
                self.started = Some(Local::now());
            }
            OperationState::Loaded | OperationState::Saved | OperationState::WebDownloaded => {
                self.finished = Some(Local::now());
            }
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    pub fn elapsed(&self) -> Option<Duration> {
        let started = self.started?;
        let end = self.finished.unwrap_or_else(Local::now);
        (end - started).to_std().ok()
    }

    pub fn describe(&self, label: &str) -> String {
        match self.state {
            OperationState::Loaded | OperationState::Saved | OperationState::WebDownloaded => {
                let kind = self
                    .kind
                    .map(|kind| kind.to_string())
                    .unwrap_or_else(|| "content".to_string());
                format!(
                    "{label}: {} {kind} records, {} bytes",
                    self.records, self.length
                )
            }
            _ if self.length > 0 => format!(
                "{label}: {} records, {}% of {} bytes",
                self.records,
                (self.position.saturating_mul(100) / self.length).min(100),
                self.length
            ),
            _ => format!("{label}: {} records, {} bytes", self.records, self.position),
        }
    }
}

#[derive(Debug)]
pub struct TaskItem {
    pub action: TaskAction,
    pub operation: FileOperation,
}

impl TaskItem {
    pub fn new(action: TaskAction) -> Self {
        let operation = FileOperation::new(action.medium());
        Self { action, operation }
    }
}

impl From<TaskAction> for TaskItem {
    fn from(action: TaskAction) -> Self {
        Self::new(action)
    }
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    items: VecDeque<TaskItem>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dequeue(&mut self) -> Option<TaskItem> {
        self.items.pop_front()
    }

    pub fn insert_front(&mut self, items: Vec<TaskItem>) {
        for item in items.into_iter().rev() {
            self.items.push_front(item);
        }
    }

    pub fn append(&mut self, items: Vec<TaskItem>) {
        self.items.extend(items);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub items_run: usize,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl DrainReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.warnings.is_empty()
    }

    pub fn message(&self) -> Option<String> {
        if self.is_clean() {
            return None;
        }
        let lines: Vec<&str> = self
            .errors
            .iter()
            .chain(self.warnings.iter())
            .map(String::as_str)
            .collect();
        Some(lines.join("\n"))
    }
}

#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last: Option<Instant>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self) -> bool {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn insert_front_keeps_order() {
        let mut queue = TaskQueue::new();
        queue.append(vec![TaskAction::ClearAll.into()]);
        queue.insert_front(vec![
            TaskAction::LoadInitial.into(),
            TaskAction::DownloadUpdate { force: false }.into(),
        ]);
        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
            .map(|item| item.action.to_string())
            .collect();
        assert_eq!(order, vec!["initial load", "update check", "clear all"]);
    }

    #[test]
    fn load_path_transitions() {
        let mut operation = FileOperation::new(Medium::File);
        operation.advance(OperationState::Open).unwrap();
        operation.advance(OperationState::Loading).unwrap();
        operation.advance(OperationState::Loaded).unwrap();
        assert_eq!(operation.state(), OperationState::Loaded);
        assert!(operation.finished.is_some());
    }

    #[test]
    fn progress_tracks_position_until_loaded() {
        let mut operation = FileOperation::new(Medium::Buffer);
        operation.advance(OperationState::Open).unwrap();
        operation.length = 400;
        operation.advance(OperationState::Loading).unwrap();
        operation.position = 100;
        operation.records = 12;
        assert_eq!(operation.describe("cases"), "cases: 12 records, 25% of 400 bytes");

        operation.kind = Some(ContentKind::Cases);
        operation.position = 400;
        operation.records = 40;
        operation.advance(OperationState::Loaded).unwrap();
        assert_eq!(operation.describe("cases"), "cases: 40 cases records, 400 bytes");
        assert!(operation.elapsed().is_some());
    }

    #[test]
    fn illegal_transition_invalidates() {
        let mut operation = FileOperation::new(Medium::File);
        operation.advance(OperationState::Saving).unwrap();
        assert_matches!(
            operation.advance(OperationState::Loaded),
            Err(EpiError::InvalidTransition(_))
        );
        assert_eq!(operation.state(), OperationState::Invalid);
    }

    #[test]
    fn report_message_lists_errors_first() {
        let report = DrainReport {
            items_run: 2,
            errors: vec!["bad header".to_string()],
            warnings: vec!["3 rows skipped".to_string()],
        };
        assert_eq!(report.message().unwrap(), "bad header\n3 rows skipped");
        assert_eq!(DrainReport::default().message(), None);
    }

    #[test]
    fn throttle_blocks_bursts() {
        let mut throttle = Throttle::new(Duration::from_secs(60));
        assert!(throttle.ready());
        assert!(!throttle.ready());
        let mut open = Throttle::new(Duration::ZERO);
        assert!(open.ready());
        assert!(open.ready());
    }
}
