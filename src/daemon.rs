use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::config::ConfigContext;
use crate::error::UploadError;
use crate::protocol::{UploadSettings, Uploader};
use crate::queue::{TaskSender, Worker, WorkerReport, task_queue};
use crate::resolver::{InstrumentSource, RunResolver};
use crate::session::{Credentials, SessionClient};
use crate::store::RunStore;
use crate::transport::HttpTransport;
use crate::watch::{EventHandler, Monitor};

type MonitorSlot = Arc<Mutex<Option<Monitor>>>;

pub struct Daemon<T: HttpTransport, S: InstrumentSource> {
    worker: Worker<T>,
    tasks: TaskSender,
    handler: Option<EventHandler<S>>,
    monitor: MonitorSlot,
}

#[derive(Clone)]
pub struct ShutdownHandle {
    tasks: TaskSender,
    monitor: MonitorSlot,
}

impl ShutdownHandle {
    pub fn trigger(&self) {
        info!("termination requested");
        let monitor = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(monitor) = monitor {
            monitor.stop();
        }
        if let Err(err) = self.tasks.shutdown() {
            warn!(error = %err, "worker already stopped");
        }
    }
}

impl<T, S> Daemon<T, S>
where
    T: HttpTransport,
    S: InstrumentSource + 'static,
{
    pub fn new(context: Arc<ConfigContext>, transport: T, source: S) -> Result<Self, UploadError> {
        let config = context.current();
        let store = RunStore::open(&config.local.runid_db, false)?;
        let client = SessionClient::new(transport, Credentials::from(&config.cloud));
        let uploader = Uploader::new(client, store, UploadSettings::from_config(&config.local));

        let (tasks, receiver) = task_queue();
        let worker = Worker::new(uploader, receiver).with_config(Arc::clone(&context));
        let resolver = RunResolver::new(source, Arc::clone(&context));
        let handler = EventHandler::new(config.local.data.as_std_path(), resolver, tasks.clone());

        Ok(Self {
            worker,
            tasks,
            handler: Some(handler),
            monitor: Arc::new(Mutex::new(None)),
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tasks: self.tasks.clone(),
            monitor: Arc::clone(&self.monitor),
        }
    }

    pub fn run(mut self) -> Result<WorkerReport, UploadError> {
        if let Some(handler) = self.handler.take() {
            let monitor = Monitor::start(handler)?;
            *self
                .monitor
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(monitor);
        }
        // The daemon keeps a sender of its own; the sentinel is the only
        // way out of the worker loop.
        let report = self.worker.run();

        let leftover = self
            .monitor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(monitor) = leftover {
            monitor.stop();
        }
        info!("daemon terminated");
        Ok(report)
    }
}
