use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use tracing::{debug, error, info, warn};

use crate::config::{Config, ConfigContext};
use crate::domain::RunDescriptor;
use crate::error::UploadError;
use crate::protocol::{UploadOutcome, Uploader};
use crate::transport::HttpTransport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    CreateRun { path: PathBuf, run: RunDescriptor },
    Upload { path: PathBuf, run: RunDescriptor },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct TaskSender {
    tx: Sender<Task>,
}

impl TaskSender {
    pub fn submit(&self, task: Task) -> Result<(), UploadError> {
        self.tx.send(task).map_err(|_| UploadError::QueueClosed)
    }

    pub fn shutdown(&self) -> Result<(), UploadError> {
        self.submit(Task::Shutdown)
    }
}

#[derive(Debug)]
pub struct TaskReceiver {
    rx: Receiver<Task>,
}

impl TaskReceiver {
    pub fn next(&self) -> Option<Task> {
        match self.rx.recv() {
            Ok(Task::Shutdown) | Err(_) => None,
            Ok(task) => Some(task),
        }
    }
}

pub fn task_queue() -> (TaskSender, TaskReceiver) {
    let (tx, rx) = mpsc::channel();
    (TaskSender { tx }, TaskReceiver { rx })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub runs_created: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct Worker<T: HttpTransport> {
    uploader: Uploader<T>,
    tasks: TaskReceiver,
    context: Option<Arc<ConfigContext>>,
    updates: Option<Receiver<Arc<Config>>>,
    unapplied: Option<Arc<Config>>,
}

impl<T: HttpTransport> Worker<T> {
    pub fn new(uploader: Uploader<T>, tasks: TaskReceiver) -> Self {
        Self {
            uploader,
            tasks,
            context: None,
            updates: None,
            unapplied: None,
        }
    }

    pub fn with_config(mut self, context: Arc<ConfigContext>) -> Self {
        self.updates = Some(context.subscribe());
        self.context = Some(context);
        self
    }

    pub fn uploader(&mut self) -> &mut Uploader<T> {
        &mut self.uploader
    }

    pub fn has_unapplied_config(&self) -> bool {
        self.unapplied.is_some()
    }

    pub fn run(&mut self) -> WorkerReport {
        info!("upload worker started");
        let mut report = WorkerReport::default();
        while let Some(task) = self.tasks.next() {
            self.refresh_config();
            self.execute(task, &mut report);
        }
        info!(
            runs_created = report.runs_created,
            uploaded = report.uploaded,
            skipped = report.skipped,
            failed = report.failed,
            "upload worker stopped"
        );
        report
    }

    fn refresh_config(&mut self) {
        if let Some(context) = &self.context {
            if let Err(err) = context.reload() {
                warn!(error = %err, "config reload failed, keeping previous settings");
            }
        }
        let Some(updates) = &self.updates else {
            return;
        };
        // A config that failed to apply stays pending until a newer one
        // arrives or it applies cleanly.
        let mut latest = self.unapplied.take();
        loop {
            match updates.try_recv() {
                Ok(config) => latest = Some(config),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if let Some(config) = latest {
            match self.uploader.apply_config(&config) {
                Ok(()) => info!("config change applied"),
                Err(err) => {
                    error!(error = %err, "failed to apply config change, retrying before next task");
                    self.unapplied = Some(config);
                }
            }
        }
    }

    fn execute(&mut self, task: Task, report: &mut WorkerReport) {
        match task {
            Task::CreateRun { path, run } => {
                info!(path = %path.display(), local_run = %run.id, "initiate run creation");
                match self.uploader.create_run(&run) {
                    Ok(mapping) => {
                        debug!(remote_run = %mapping.remote, "run ready");
                        report.runs_created += 1;
                    }
                    Err(err) => {
                        error!(path = %path.display(), error = %err, "run creation failed");
                        report.failed += 1;
                    }
                }
            }
            Task::Upload { path, run } => {
                info!(path = %path.display(), "initiate upload");
                match self.uploader.upload(&path, &run) {
                    Ok(UploadOutcome::Uploaded { .. }) => report.uploaded += 1,
                    Ok(UploadOutcome::SkippedCapReached | UploadOutcome::SkippedQuota) => {
                        report.skipped += 1
                    }
                    Err(err) => {
                        error!(path = %path.display(), error = %err, "failed to upload file");
                        report.failed += 1;
                    }
                }
            }
            Task::Shutdown => {}
        }
    }
}
