use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::domain::DataFormat;
use crate::error::UploadError;
use crate::queue::{Task, TaskSender};
use crate::resolver::{InstrumentSource, RunResolver};

// Run output directories sit at <data>/<experiment>/<sample>/<run>.
pub const RUN_DIRECTORY_DEPTH: usize = 3;
const REUPLOAD_PREFIX: &str = "reup";
// Dedup state is kept for this many of the most recently active runs.
pub const TRACKED_RUNS: usize = 16;

pub struct EventHandler<S: InstrumentSource> {
    root: PathBuf,
    resolver: RunResolver<S>,
    tasks: TaskSender,
    seen: HashMap<PathBuf, HashSet<PathBuf>>,
    runs: VecDeque<PathBuf>,
}

impl<S: InstrumentSource> EventHandler<S> {
    pub fn new(root: &Path, resolver: RunResolver<S>, tasks: TaskSender) -> Self {
        Self {
            root: root.components().collect(),
            resolver,
            tasks,
            seen: HashMap::new(),
            runs: VecDeque::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn handle_event(&mut self, event: Event) {
        match event.kind {
            EventKind::Create(kind) => {
                for path in &event.paths {
                    let is_dir = match kind {
                        CreateKind::Folder => true,
                        CreateKind::File => false,
                        _ => path.is_dir(),
                    };
                    self.on_created(path, is_dir);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
                if let Some(dest) = event.paths.first() {
                    self.on_moved(dest, dest.is_dir());
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => {
                for path in event.paths.iter().filter(|path| path.exists()) {
                    self.on_moved(path, path.is_dir());
                }
            }
            // Backends that pair renames report the destination as `To` as well.
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {}
            _ => {}
        }
    }

    pub fn on_created(&mut self, path: &Path, is_dir: bool) {
        debug!(path = %path.display(), is_dir, "created");
        if is_dir {
            self.handle_directory(path);
        } else {
            self.handle_file(path);
        }
    }

    pub fn on_moved(&mut self, dest: &Path, is_dir: bool) {
        debug!(path = %dest.display(), is_dir, "moved");
        self.on_created(dest, is_dir);
    }

    fn handle_directory(&mut self, path: &Path) {
        let path: PathBuf = path.components().collect();
        if path.ancestors().nth(RUN_DIRECTORY_DEPTH) != Some(self.root.as_path()) {
            return;
        }
        let Some(run) = self.resolver.resolve_directory(&path) else {
            warn!(path = %path.display(), "no run found for new directory");
            return;
        };
        info!(path = %path.display(), local_run = %run.id, "run directory detected");
        self.enqueue(Task::CreateRun { path, run });
    }

    fn handle_file(&mut self, path: &Path) {
        if DataFormat::from_path(path).is_none() {
            return;
        }
        let path: PathBuf = path.components().collect();
        if !self.remember(&path) && !is_reupload(&path) {
            debug!(path = %path.display(), "already queued, ignoring");
            return;
        }
        let Some(run) = self.resolver.resolve(&path) else {
            warn!(path = %path.display(), "no run found for file");
            return;
        };
        info!(path = %path.display(), local_run = %run.id, "file queued for upload");
        self.enqueue(Task::Upload { path, run });
    }

    fn remember(&mut self, path: &Path) -> bool {
        let run = path
            .ancestors()
            .nth(2)
            .unwrap_or(path)
            .to_path_buf();
        if let Some(position) = self.runs.iter().position(|known| *known == run) {
            self.runs.remove(position);
        }
        self.runs.push_back(run.clone());
        while self.runs.len() > TRACKED_RUNS {
            if let Some(evicted) = self.runs.pop_front() {
                debug!(run = %evicted.display(), "dropping dedup state");
                self.seen.remove(&evicted);
            }
        }
        self.seen.entry(run).or_default().insert(path.to_path_buf())
    }

    fn enqueue(&self, task: Task) {
        if let Err(err) = self.tasks.submit(task) {
            warn!(error = %err, "task dropped");
        }
    }
}

fn is_reupload(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.starts_with(REUPLOAD_PREFIX))
        .unwrap_or(false)
}

pub struct Monitor {
    watcher: RecommendedWatcher,
    thread: JoinHandle<()>,
}

impl Monitor {
    pub fn start<S>(mut handler: EventHandler<S>) -> Result<Self, UploadError>
    where
        S: InstrumentSource + 'static,
    {
        let root = handler.root().to_path_buf();
        let (tx, rx) = mpsc::channel::<Result<Event, notify::Error>>();
        let mut watcher = RecommendedWatcher::new(tx, notify::Config::default())
            .map_err(|err| UploadError::Watch(err.to_string()))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|err| UploadError::Watch(format!("{}: {err}", root.display())))?;

        let thread = thread::Builder::new()
            .name("file-events".to_string())
            .spawn(move || {
                for event in rx {
                    match event {
                        Ok(event) => handler.handle_event(event),
                        Err(err) => warn!(error = %err, "watch error"),
                    }
                }
                debug!("event thread finished");
            })
            .map_err(|err| UploadError::Watch(err.to_string()))?;
        info!(path = %root.display(), "monitoring started");
        Ok(Self { watcher, thread })
    }

    pub fn stop(self) {
        let Monitor { watcher, thread } = self;
        drop(watcher);
        if thread.join().is_err() {
            warn!("event thread panicked");
        }
        info!("monitoring stopped");
    }
}
