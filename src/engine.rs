use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use camino::Utf8PathBuf;
use chrono::Local;
use tracing::{debug, info, warn};

use crate::codec::{self, LoadSummary};
use crate::config::{Dataset, DatasetKind, ResolvedConfig};
use crate::domain::{ContentKind, DateKey, EntityLevel, SaveFormat};
use crate::error::EpiError;
use crate::pipeline::ResultSeries;
use crate::query::{self, RankedEntry, SearchHit, SeriesRequest};
use crate::queue::{
    DrainReport, FileOperation, Medium, OperationState, TaskAction, TaskItem, TaskQueue, Throttle,
};
use crate::store::Store;
use crate::stream::{self, OpenedStream, StreamWriter};
use crate::tree::{ClearMode, EntityTree};
use crate::web::{self, Transport, UpdateState};

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn event(&self, _event: ProgressEvent) {}
}

enum EngineMessage {
    Enqueue(Vec<TaskItem>),
    DownloadFinished {
        dataset: Dataset,
        outcome: Result<Vec<u8>, EpiError>,
    },
    Shutdown,
}

enum Flow {
    Continue,
    Suspend,
}

pub struct Engine {
    tree: Arc<Mutex<EntityTree>>,
    sender: Sender<EngineMessage>,
    reports: Mutex<Receiver<DrainReport>>,
    handle: Option<JoinHandle<()>>,
    store: Store,
    today: DateKey,
}

impl Engine {
    pub fn start(
        config: ResolvedConfig,
        store: Store,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, EpiError> {
        store.ensure_root()?;
        let update_state = store.read_update_state()?;
        let tree = Arc::new(Mutex::new(EntityTree::new()));
        let (sender, receiver) = mpsc::channel();
        let (report_tx, report_rx) = mpsc::channel();
        let today = config.today();

        let worker = Worker {
            tree: Arc::clone(&tree),
            store: store.clone(),
            config,
            transport,
            sink,
            sender: sender.clone(),
            reports: report_tx,
            queue: TaskQueue::new(),
            report: DrainReport::default(),
            suspended: false,
            update_state,
            today,
        };
        let handle = thread::Builder::new()
            .name("epitrend-queue".to_string())
            .spawn(move || worker.run(receiver))
            .map_err(|err| EpiError::Worker(err.to_string()))?;

        Ok(Self {
            tree,
            sender,
            reports: Mutex::new(report_rx),
            handle: Some(handle),
            store,
            today,
        })
    }

    pub fn today(&self) -> DateKey {
        self.today
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn run(&self, actions: Vec<TaskAction>) -> Result<DrainReport, EpiError> {
        let reports = self
            .reports
            .lock()
            .map_err(|err| EpiError::Worker(err.to_string()))?;
        let items = actions.into_iter().map(TaskItem::new).collect();
        self.sender
            .send(EngineMessage::Enqueue(items))
            .map_err(|err| EpiError::Worker(err.to_string()))?;
        reports
            .recv()
            .map_err(|err| EpiError::Worker(err.to_string()))
    }

    pub fn clear_all(&self) -> Result<DrainReport, EpiError> {
        self.run(vec![TaskAction::ClearAll])
    }

    pub fn load_initial(&self) -> Result<DrainReport, EpiError> {
        self.run(vec![TaskAction::LoadInitial])
    }

    pub fn load_files(&self, paths: &[PathBuf]) -> Result<DrainReport, EpiError> {
        self.run(
            paths
                .iter()
                .map(|path| TaskAction::LoadFile {
                    path: path.clone(),
                    expected: None,
                })
                .collect(),
        )
    }

    pub fn load_content(
        &self,
        label: &str,
        bytes: Vec<u8>,
        expected: Option<ContentKind>,
    ) -> Result<DrainReport, EpiError> {
        self.run(vec![TaskAction::LoadContent {
            label: label.to_string(),
            bytes,
            expected,
        }])
    }

    pub fn download_update(&self, force: bool) -> Result<DrainReport, EpiError> {
        self.run(vec![TaskAction::DownloadUpdate { force }])
    }

    pub fn save(&self, path: Option<&Path>, format: SaveFormat) -> Result<DrainReport, EpiError> {
        let (path, backup) = match path {
            Some(path) => (path.to_path_buf(), false),
            None => (
                self.store.save_path(format).into_std_path_buf(),
                format == SaveFormat::Pack,
            ),
        };
        self.run(vec![TaskAction::SaveFile {
            path,
            format,
            backup,
        }])
    }

    pub fn with_tree<R>(&self, f: impl FnOnce(&EntityTree) -> R) -> Result<R, EpiError> {
        let tree = self
            .tree
            .lock()
            .map_err(|err| EpiError::Worker(err.to_string()))?;
        Ok(f(&tree))
    }

    pub fn series(
        &self,
        full_code: &str,
        request: &SeriesRequest,
    ) -> Result<ResultSeries, EpiError> {
        self.with_tree(|tree| query::series(tree, full_code, request, self.today))?
    }

    pub fn search(&self, text: &str) -> Result<Vec<SearchHit>, EpiError> {
        self.with_tree(|tree| query::search_entities(tree, text))?
    }

    pub fn ranked(
        &self,
        full_code: &str,
        level: EntityLevel,
        highest: usize,
        lowest: usize,
        request: &SeriesRequest,
    ) -> Result<Vec<RankedEntry>, EpiError> {
        self.with_tree(|tree| {
            query::ranked_analytics(tree, full_code, level, highest, lowest, request, self.today)
        })?
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.sender.send(EngineMessage::Shutdown);
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

struct Worker {
    tree: Arc<Mutex<EntityTree>>,
    store: Store,
    config: ResolvedConfig,
    transport: Arc<dyn Transport>,
    sink: Arc<dyn ProgressSink>,
    sender: Sender<EngineMessage>,
    reports: Sender<DrainReport>,
    queue: TaskQueue,
    report: DrainReport,
    suspended: bool,
    update_state: UpdateState,
    today: DateKey,
}

impl Worker {
    fn run(mut self, receiver: Receiver<EngineMessage>) {
        for message in receiver {
            match message {
                EngineMessage::Enqueue(items) => {
                    self.queue.append(items);
                    if !self.suspended {
                        self.drain();
                    }
                }
                EngineMessage::DownloadFinished { dataset, outcome } => {
                    self.suspended = false;
                    self.queue.insert_front(vec![TaskItem::new(
                        TaskAction::DownloadDone { dataset, outcome },
                    )]);
                    self.drain();
                }
                EngineMessage::Shutdown => break,
            }
        }
    }

    fn drain(&mut self) {
        while let Some(item) = self.queue.dequeue() {
            self.report.items_run += 1;
            let label = item.action.to_string();
            debug!(item = %label, "running queue item");
            match self.execute(item) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Suspend) => {
                    self.suspended = true;
                    return;
                }
                Err(err) if err.is_fatal_format() => {
                    warn!(item = %label, error = %err, "queue item aborted");
                    self.report.errors.push(format!("{label}: {err}"));
                }
                Err(err) => {
                    warn!(item = %label, error = %err, "queue item failed");
                    self.report.warnings.push(format!("{label} failed: {err}"));
                }
            }
        }
        let report = std::mem::take(&mut self.report);
        info!(
            items = report.items_run,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "queue drained"
        );
        let _ = self.reports.send(report);
    }

    fn lock_tree(&self) -> Result<MutexGuard<'_, EntityTree>, EpiError> {
        self.tree
            .lock()
            .map_err(|err| EpiError::Worker(err.to_string()))
    }

    fn execute(&mut self, item: TaskItem) -> Result<Flow, EpiError> {
        let TaskItem {
            action,
            mut operation,
        } = item;
        match action {
            TaskAction::ClearAll => {
                let mut tree = self.lock_tree()?;
                let root = tree.root();
                tree.clear(root, ClearMode::Structure)?;
                info!("tree cleared");
            }
            TaskAction::LoadInitial => {
                let files = self.store.initial_files();
                if files.is_empty() {
                    info!(dir = %self.store.root(), "no local data to load");
                }
                let items = files
                    .into_iter()
                    .map(|(path, kind)| {
                        TaskItem::new(TaskAction::LoadFile {
                            path: path.into_std_path_buf(),
                            expected: Some(kind),
                        })
                    })
                    .collect();
                self.queue.insert_front(items);
            }
            TaskAction::LoadFile { path, expected } => {
                operation.advance(OperationState::Open)?;
                let opened = stream::open_file(&path)?;
                self.load(opened, expected, &path.display().to_string(), &mut operation)?;
            }
            TaskAction::LoadContent {
                label,
                bytes,
                expected,
            } => {
                operation.advance(OperationState::Open)?;
                let opened = stream::open_bytes(bytes, &label)?;
                self.load(opened, expected, &label, &mut operation)?;
            }
            TaskAction::DownloadUpdate { force } => {
                let now = Local::now().naive_local();
                let due: Vec<TaskItem> = self
                    .config
                    .datasets
                    .iter()
                    .filter(|dataset| {
                        force
                            || web::is_update_due(
                                self.update_state.last_success(&dataset.name),
                                now,
                                self.config.publish_time,
                            )
                    })
                    .map(|dataset| TaskItem::new(TaskAction::DownloadUrl(dataset.clone())))
                    .collect();
                if due.is_empty() {
                    info!("all datasets are up to date");
                }
                self.queue.insert_front(due);
            }
            TaskAction::DownloadUrl(dataset) => {
                operation.advance(OperationState::WebDownloading)?;
                info!(dataset = %dataset.name, url = %dataset.url, "download started");
                let transport = Arc::clone(&self.transport);
                let sender = self.sender.clone();
                thread::Builder::new()
                    .name(format!("epitrend-download-{}", dataset.name))
                    .spawn(move || {
                        let outcome =
                            panic::catch_unwind(AssertUnwindSafe(|| transport.fetch(&dataset.url)))
                                .unwrap_or_else(|payload| {
                                    Err(EpiError::DownloadHttp(panic_message(payload.as_ref())))
                                });
                        let _ = sender.send(EngineMessage::DownloadFinished { dataset, outcome });
                    })
                    .map_err(|err| EpiError::Worker(err.to_string()))?;
                return Ok(Flow::Suspend);
            }
            TaskAction::DownloadDone { dataset, outcome } => {
                operation.advance(OperationState::WebDownloading)?;
                let bytes = outcome?;
                operation.kind = Some(dataset.kind.content_kind());
                operation.length = bytes.len() as u64;
                operation.position = operation.length;
                operation.advance(OperationState::WebDownloaded)?;
                self.sink.event(ProgressEvent {
                    message: operation.describe(&format!("download {}", dataset.name)),
                    elapsed: operation.elapsed(),
                });
                self.apply_download(&dataset, bytes)?;
            }
            TaskAction::SaveFile {
                path,
                format,
                backup,
            } => {
                operation.advance(OperationState::Saving)?;
                operation.kind = Some(format.content_kind());
                self.save(&path, format, backup, &mut operation)?;
            }
        }
        Ok(Flow::Continue)
    }

    fn load(
        &mut self,
        opened: OpenedStream,
        expected: Option<ContentKind>,
        label: &str,
        operation: &mut FileOperation,
    ) -> Result<LoadSummary, EpiError> {
        let OpenedStream {
            reader,
            length,
            consumed,
            ..
        } = opened;
        operation.length = length;
        operation.advance(OperationState::Loading)?;

        let sink = Arc::clone(&self.sink);
        let mut throttle = Throttle::new(self.config.progress_interval);
        let summary = {
            let mut progress = |records: usize| {
                operation.position = consumed.load(Ordering::Relaxed);
                operation.records = records;
                if throttle.ready() {
                    sink.event(ProgressEvent {
                        message: operation.describe(label),
                        elapsed: operation.elapsed(),
                    });
                }
            };
            let mut tree = self.lock_tree()?;
            codec::load_stream(&mut tree, reader, expected, self.today, &mut progress)
        }
        .map_err(|err| match err {
            EpiError::UnknownFormat(message) => {
                EpiError::UnknownFormat(format!("{label}: {message}"))
            }
            EpiError::InputRead { message, .. } => EpiError::InputRead {
                path: label.to_string(),
                message,
            },
            other => other,
        })?;

        operation.kind = Some(summary.dialect.content_kind());
        operation.records = summary.stats.records;
        operation.position = consumed.load(Ordering::Relaxed);
        operation.advance(OperationState::Loaded)?;
        self.sink.event(ProgressEvent {
            message: operation.describe(label),
            elapsed: operation.elapsed(),
        });
        info!(
            source = label,
            kind = %summary.dialect.content_kind(),
            records = summary.stats.records,
            entities = summary.stats.entities,
            "load finished"
        );
        if summary.stats.malformed > 0 || summary.stats.not_final > 0 {
            debug!(
                source = label,
                malformed = summary.stats.malformed,
                not_final = summary.stats.not_final,
                "rows skipped"
            );
        }
        self.report.warnings.extend(summary.stats.warnings(label));
        Ok(summary)
    }

    fn apply_download(&mut self, dataset: &Dataset, bytes: Vec<u8>) -> Result<(), EpiError> {
        let size = bytes.len() as u64;
        if size < dataset.min_bytes {
            warn!(dataset = %dataset.name, size, "download below size threshold");
            self.report.warnings.push(format!(
                "{}: downloaded {size} bytes, expected at least {}; update discarded",
                dataset.name, dataset.min_bytes
            ));
            return Ok(());
        }
        self.store.write_last_download(&bytes)?;

        self.lock_tree()?.clear_fields(dataset.kind.fields());
        let label = format!("download {}", dataset.name);
        let opened = stream::open_bytes(bytes, &label)?;
        let mut operation = FileOperation::new(Medium::Buffer);
        operation.advance(OperationState::Open)?;
        let expected = Some(dataset.kind.content_kind());
        if let Err(err) = self.load(opened, expected, &label, &mut operation) {
            self.rollback(format!("{}: downloaded data unusable ({err})", dataset.name));
            return Ok(());
        }

        if dataset.kind == DatasetKind::Cases
            && let Some(reference) = self.config.reference_district.clone()
        {
            let probe = web::sanity_probe(&*self.lock_tree()?, &reference, self.today);
            let failure = match probe {
                Ok(report) if report.passed() => None,
                Ok(report) => Some(format!(
                    "{} daily values with peak {} for {reference} in the previous month",
                    report.values, report.peak
                )),
                Err(err) => Some(err.to_string()),
            };
            if let Some(reason) = failure {
                self.rollback(format!(
                    "{}: sanity check failed ({reason}); previous data restored",
                    dataset.name
                ));
                return Ok(());
            }
        }

        self.update_state
            .record_success(&dataset.name, Local::now().naive_local());
        self.store.write_update_state(&self.update_state)?;
        info!(dataset = %dataset.name, "update applied");
        self.queue.insert_front(vec![TaskItem::new(TaskAction::SaveFile {
            path: self.store.snapshot_path().into_std_path_buf(),
            format: SaveFormat::Pack,
            backup: true,
        })]);
        Ok(())
    }

    fn rollback(&mut self, message: String) {
        warn!(reason = %message, "rolling back update");
        self.report.warnings.push(message);
        self.queue.insert_front(vec![
            TaskItem::new(TaskAction::ClearAll),
            TaskItem::new(TaskAction::LoadInitial),
        ]);
    }

    fn save(
        &mut self,
        path: &Path,
        format: SaveFormat,
        backup: bool,
        operation: &mut FileOperation,
    ) -> Result<(), EpiError> {
        let mut writer = StreamWriter::new(Vec::new(), stream::extension_wants_gzip(path));
        let lines = {
            let tree = self.lock_tree()?;
            codec::write_native(&tree, format, self.today, &mut writer)?
        };
        let bytes = writer
            .finish()
            .map_err(|err| EpiError::Filesystem(err.to_string()))?;
        let target = Utf8PathBuf::from_path_buf(path.to_path_buf())
            .map_err(|_| EpiError::Filesystem(format!("invalid path {}", path.display())))?;
        Store::write_bytes_atomic(&target, &bytes)?;
        operation.records = lines;
        operation.length = bytes.len() as u64;
        operation.position = operation.length;
        operation.advance(OperationState::Saved)?;
        if backup
            && let Some(copy) = self.store.backup_snapshot(
                &target,
                self.config.backup_mode,
                Local::now().naive_local(),
            )?
        {
            debug!(backup = %copy, "snapshot backed up");
        }
        self.sink.event(ProgressEvent {
            message: operation.describe(target.as_str()),
            elapsed: operation.elapsed(),
        });
        info!(path = %target, lines, "saved");
        Ok(())
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|text| text.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("transport panicked: {detail}")
}
