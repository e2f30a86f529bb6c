use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind};

use mlst_upload::config::{CloudConfig, Config, ConfigContext, LocalConfig};
use mlst_upload::daemon::Daemon;
use mlst_upload::domain::RunDescriptor;
use mlst_upload::error::UploadError;
use mlst_upload::protocol::{UploadSettings, Uploader};
use mlst_upload::queue::{Task, TaskReceiver, Worker, WorkerReport, task_queue};
use mlst_upload::resolver::{NoInstrument, RunResolver, fallback_descriptor};
use mlst_upload::session::{Credentials, SessionClient};
use mlst_upload::store::RunStore;
use mlst_upload::transport::{HttpRequest, HttpResponse, HttpTransport, Method};
use mlst_upload::watch::{EventHandler, TRACKED_RUNS};

#[derive(Default)]
struct MockCloud {
    requests: Mutex<Vec<HttpRequest>>,
    login_failures: Mutex<usize>,
}

impl MockCloud {
    fn rejecting_logins(count: usize) -> Self {
        Self {
            login_failures: Mutex::new(count),
            ..Self::default()
        }
    }

    fn reported_names(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|req| req.method == Method::Put && req.endpoint.starts_with("rest/upload/"))
            .filter_map(|req| req.form_value("name").map(str::to_string))
            .collect()
    }
}

impl HttpTransport for MockCloud {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, UploadError> {
        self.requests.lock().unwrap().push(request.clone());
        let action = request.form_value("action").unwrap_or_default();
        let response = match (request.method, request.endpoint.as_str()) {
            (Method::Post, "rest/session/init") => {
                HttpResponse::new(200, r#"{"id":"1a2b3c","hash":"00ff"}"#)
            }
            (Method::Post, "rest/session/login") => {
                let mut failures = self.login_failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    HttpResponse::new(401, "")
                } else {
                    HttpResponse::new(202, "")
                }
            }
            (_, "rest/session/login") => HttpResponse::new(202, ""),
            (Method::Post, "rest/run") => HttpResponse::new(200, r#"{"id":"7"}"#),
            (Method::Post, "cgi-bin/createrun.py") if action == "upload" => {
                HttpResponse::new(200, "tok")
            }
            (Method::Post, "cgi-bin/upload.py") => HttpResponse::new(200, "stored.pod5"),
            _ => HttpResponse::new(200, "ok"),
        };
        Ok(response)
    }
}

fn config(root: &Path) -> Config {
    Config {
        cloud: CloudConfig {
            user: "alice".to_string(),
            password: "secret".to_string(),
            website_server: "https://web.example.org".to_string(),
            upload_server: "https://files.example.org".to_string(),
            attempt: 1,
        },
        local: LocalConfig {
            data: Utf8PathBuf::from_path_buf(root.join("data")).unwrap(),
            runid_db: Utf8PathBuf::from_path_buf(root.join("db").join("run.db")).unwrap(),
            ..LocalConfig::default()
        },
    }
}

fn settings() -> UploadSettings {
    UploadSettings {
        initial_delay: Duration::ZERO,
        poll_interval: Duration::ZERO,
        ..UploadSettings::default()
    }
}

fn uploader(config: &Config) -> Uploader<MockCloud> {
    uploader_with(config, MockCloud::default())
}

fn uploader_with(config: &Config, cloud: MockCloud) -> Uploader<MockCloud> {
    let client = SessionClient::new(cloud, Credentials::from(&config.cloud));
    let store = RunStore::open(&config.local.runid_db, false).unwrap();
    Uploader::new(client, store, settings())
}

fn data_file(root: &Path, name: &str) -> PathBuf {
    let dir = root.join("data/exp/sample/run/pod5");
    fs::create_dir_all(&dir).unwrap();
    let path = dir.join(name);
    fs::write(&path, b"signal").unwrap();
    path
}

fn run_for(path: &Path) -> RunDescriptor {
    fallback_descriptor(path, "alice")
}

fn drain(rx: &TaskReceiver) -> Vec<Task> {
    let mut tasks = Vec::new();
    while let Some(task) = rx.next() {
        tasks.push(task);
    }
    tasks
}

#[test]
fn worker_survives_failures_in_order() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(temp.path());
    let broken = data_file(temp.path(), "notes.txt");
    let first = data_file(temp.path(), "a.pod5");
    let second = data_file(temp.path(), "b.pod5");

    let (tx, rx) = task_queue();
    for path in [&broken, &first, &second] {
        tx.submit(Task::Upload {
            path: path.clone(),
            run: run_for(path),
        })
        .unwrap();
    }
    tx.shutdown().unwrap();

    let mut worker = Worker::new(uploader(&config), rx);
    let report = worker.run();

    assert_eq!(
        report,
        WorkerReport {
            runs_created: 0,
            uploaded: 2,
            skipped: 0,
            failed: 1,
        }
    );
    assert_eq!(
        worker.uploader().client().transport().reported_names(),
        vec!["a.pod5".to_string(), "b.pod5".to_string()]
    );
}

#[test]
fn tasks_queued_before_shutdown_still_run() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(temp.path());
    let path = data_file(temp.path(), "a.pod5");

    let (tx, rx) = task_queue();
    tx.submit(Task::CreateRun {
        path: path.clone(),
        run: run_for(&path),
    })
    .unwrap();
    tx.shutdown().unwrap();
    tx.submit(Task::Upload {
        path: path.clone(),
        run: run_for(&path),
    })
    .unwrap();

    let report = Worker::new(uploader(&config), rx).run();

    assert_eq!(report.runs_created, 1);
    assert_eq!(report.uploaded, 0);
}

#[test]
fn submit_fails_once_worker_is_gone() {
    let (tx, rx) = task_queue();
    drop(rx);
    assert_matches!(tx.shutdown(), Err(UploadError::QueueClosed));
}

#[test]
fn config_changes_apply_between_tasks() {
    let temp = tempfile::tempdir().unwrap();
    let base = config(temp.path());
    let context = Arc::new(ConfigContext::from_config(base.clone()).unwrap());
    let first = data_file(temp.path(), "a.pod5");
    let second = data_file(temp.path(), "b.pod5");

    let (tx, rx) = task_queue();
    for path in [&first, &second] {
        tx.submit(Task::Upload {
            path: path.clone(),
            run: run_for(path),
        })
        .unwrap();
    }
    tx.shutdown().unwrap();

    let mut worker = Worker::new(uploader(&base), rx).with_config(Arc::clone(&context));
    let mut capped = base.clone();
    capped.local.max_data = Some(1);
    context.replace(capped).unwrap();

    let report = worker.run();

    assert_eq!(worker.uploader().settings().max_data, Some(1));
    assert_eq!(report.uploaded, 1);
    assert_eq!(report.skipped, 1);
}

#[test]
fn failed_config_change_keeps_previous_store() {
    let temp = tempfile::tempdir().unwrap();
    let base = config(temp.path());
    let context = Arc::new(ConfigContext::from_config(base.clone()).unwrap());
    let first = data_file(temp.path(), "a.pod5");
    let second = data_file(temp.path(), "b.pod5");
    fs::write(temp.path().join("blocker"), b"").unwrap();

    let (tx, rx) = task_queue();
    for path in [&first, &second] {
        tx.submit(Task::Upload {
            path: path.clone(),
            run: run_for(path),
        })
        .unwrap();
    }
    tx.shutdown().unwrap();

    let mut worker = Worker::new(uploader(&base), rx).with_config(Arc::clone(&context));
    let mut broken = base.clone();
    broken.local.runid_db =
        Utf8PathBuf::from_path_buf(temp.path().join("blocker").join("run.db")).unwrap();
    broken.local.max_data = Some(1);
    context.replace(broken).unwrap();

    let report = worker.run();

    assert_eq!(report.uploaded, 2);
    assert!(worker.has_unapplied_config());
    assert_eq!(worker.uploader().settings().max_data, None);
    assert_eq!(
        worker.uploader().store().path(),
        Some(base.local.runid_db.as_path())
    );
    let local = run_for(&first).id;
    assert_eq!(
        worker.uploader().store().get(local.as_str()).unwrap().unwrap().uploaded,
        2
    );
}

#[test]
fn credential_failure_drops_only_that_task() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(temp.path());
    let first = data_file(temp.path(), "a.pod5");
    let second = data_file(temp.path(), "b.pod5");

    let (tx, rx) = task_queue();
    for path in [&first, &second] {
        tx.submit(Task::Upload {
            path: path.clone(),
            run: run_for(path),
        })
        .unwrap();
    }
    tx.shutdown().unwrap();

    let mut worker = Worker::new(uploader_with(&config, MockCloud::rejecting_logins(1)), rx);
    let report = worker.run();

    assert_eq!(report.failed, 1);
    assert_eq!(report.uploaded, 1);
    assert_eq!(
        worker.uploader().client().transport().reported_names(),
        vec!["b.pod5".to_string()]
    );
}

#[test]
fn handler_queues_data_files_once() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(temp.path());
    let context = Arc::new(ConfigContext::from_config(config.clone()).unwrap());
    let root = config.local.data.as_std_path();
    let (tx, rx) = task_queue();
    let mut handler = EventHandler::new(root, RunResolver::new(NoInstrument, context), tx);

    let file = root.join("exp/sample/run/pod5/a.pod5");
    handler.on_created(&file, false);
    handler.on_created(&file, false);
    handler.on_created(&root.join("exp/sample/run/report.json"), false);
    handler.handle_event(
        Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To)))
            .add_path(root.join("exp/sample/run/pod5/b.pod5")),
    );
    drop(handler);

    let tasks = drain(&rx);
    assert_eq!(tasks.len(), 2);
    assert_matches!(&tasks[0], Task::Upload { path, .. } if path.ends_with("a.pod5"));
    assert_matches!(&tasks[1], Task::Upload { path, .. } if path.ends_with("b.pod5"));
}

#[test]
fn rename_sequence_queues_destination_once() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(temp.path());
    let context = Arc::new(ConfigContext::from_config(config.clone()).unwrap());
    let root = config.local.data.as_std_path();
    let (tx, rx) = task_queue();
    let mut handler = EventHandler::new(root, RunResolver::new(NoInstrument, context), tx);

    let renames = [
        (root.join("exp/sample/run/pod5/a.pod5"), root.join("exp/sample/run/pod5/reup_a.pod5")),
        (root.join("exp/sample/tmp"), root.join("exp/sample/run")),
    ];
    fs::create_dir_all(&renames[1].1).unwrap();
    for (from, to) in &renames {
        handler.handle_event(
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::From))).add_path(from.clone()),
        );
        handler.handle_event(
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::To))).add_path(to.clone()),
        );
        handler.handle_event(
            Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
                .add_path(from.clone())
                .add_path(to.clone()),
        );
    }
    drop(handler);

    let tasks = drain(&rx);
    assert_eq!(tasks.len(), 2);
    assert_matches!(&tasks[0], Task::Upload { path, .. } if path.ends_with("reup_a.pod5"));
    assert_matches!(&tasks[1], Task::CreateRun { path, .. } if path.ends_with("exp/sample/run"));
}

#[test]
fn dedup_forgets_least_recent_runs() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(temp.path());
    let context = Arc::new(ConfigContext::from_config(config.clone()).unwrap());
    let root = config.local.data.as_std_path();
    let (tx, rx) = task_queue();
    let mut handler = EventHandler::new(root, RunResolver::new(NoInstrument, context), tx);

    let files: Vec<PathBuf> = (0..=TRACKED_RUNS)
        .map(|run| root.join(format!("exp/sample/run{run}/pod5/a.pod5")))
        .collect();
    for file in &files {
        handler.on_created(file, false);
    }
    handler.on_created(&files[0], false);
    handler.on_created(&files[TRACKED_RUNS], false);
    drop(handler);

    let tasks = drain(&rx);
    assert_eq!(tasks.len(), files.len() + 1);
    assert_matches!(tasks.last(), Some(Task::Upload { path, .. }) if *path == files[0]);
}

#[test]
fn reupload_prefix_bypasses_dedup() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(temp.path());
    let context = Arc::new(ConfigContext::from_config(config.clone()).unwrap());
    let root = config.local.data.as_std_path();
    let (tx, rx) = task_queue();
    let mut handler = EventHandler::new(root, RunResolver::new(NoInstrument, context), tx);

    let file = root.join("exp/sample/run/pod5/reup_a.pod5");
    handler.on_created(&file, false);
    handler.on_created(&file, false);
    drop(handler);

    assert_eq!(drain(&rx).len(), 2);
}

#[test]
fn only_run_depth_directories_create_runs() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(temp.path());
    let context = Arc::new(ConfigContext::from_config(config.clone()).unwrap());
    let root = config.local.data.as_std_path();
    let (tx, rx) = task_queue();
    let mut handler = EventHandler::new(root, RunResolver::new(NoInstrument, context), tx);

    handler.on_created(&root.join("exp"), true);
    handler.on_created(&root.join("exp/sample"), true);
    handler.handle_event(
        Event::new(EventKind::Create(CreateKind::Folder)).add_path(root.join("exp/sample/run")),
    );
    handler.on_created(&root.join("exp/sample/run/pod5"), true);
    drop(handler);

    let tasks = drain(&rx);
    assert_eq!(tasks.len(), 1);
    assert_matches!(
        &tasks[0],
        Task::CreateRun { path, run } if path.ends_with("exp/sample/run") && run.name == "exp"
    );
}

#[test]
fn daemon_stops_on_shutdown() {
    let temp = tempfile::tempdir().unwrap();
    let config = config(temp.path());
    fs::create_dir_all(config.local.data.as_std_path()).unwrap();
    let context = Arc::new(ConfigContext::from_config(config).unwrap());

    let daemon = Daemon::new(context, MockCloud::default(), NoInstrument).unwrap();
    daemon.shutdown_handle().trigger();
    let report = daemon.run().unwrap();

    assert_eq!(report, WorkerReport::default());
}
