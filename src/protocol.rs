use std::collections::HashSet;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::path::Path;
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{Config, LocalConfig};
use crate::domain::{DataFormat, RunDescriptor};
use crate::error::UploadError;
use crate::session::{Credentials, SessionClient, scalar_text};
use crate::store::{RunMapping, RunStore};
use crate::transport::{HttpTransport, Method, Part};

pub const CHUNK_SIZE: usize = 2 * 1024 * 1024;

const RUN_ENDPOINT: &str = "rest/run";
const REPORT_ENDPOINT: &str = "rest/upload";
const CREATE_RUN_ENDPOINT: &str = "cgi-bin/createrun.py";
const UPLOAD_ENDPOINT: &str = "cgi-bin/upload.py";
const SUBMIT_ENDPOINT: &str = "cgi-bin/submitfast5.py";
const FINALIZING: &str = "finalizing";
const REPORT_CATEGORY: &str = "fast5";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSettings {
    pub chunk_size: usize,
    // Pause before the first chunk so the producer can finish writing.
    pub initial_delay: Duration,
    pub poll_interval: Duration,
    pub max_finalize_polls: u32,
    pub max_data: Option<u64>,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            initial_delay: Duration::from_millis(500),
            poll_interval: Duration::from_secs(3),
            max_finalize_polls: 200,
            max_data: None,
        }
    }
}

impl UploadSettings {
    pub fn from_config(local: &LocalConfig) -> Self {
        Self {
            max_data: local.max_data_cap(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    NeedRun,
    RunReady,
    TokenAcquired,
    Streaming,
    Closing,
    Finalizing,
    Reported,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Uploaded { uploaded: u64 },
    SkippedCapReached,
    SkippedQuota,
}

#[derive(Debug, Deserialize)]
struct CreatedRun {
    id: Value,
}

struct Progress<'a> {
    path: &'a Path,
    state: UploadState,
}

impl Progress<'_> {
    fn advance(&mut self, next: UploadState) {
        debug!(path = %self.path.display(), from = ?self.state, to = ?next, "upload state");
        self.state = next;
    }
}

pub struct Uploader<T: HttpTransport> {
    client: SessionClient<T>,
    store: RunStore,
    settings: UploadSettings,
    // Remote runs whose raw-data container could not be created yet.
    pending_containers: HashSet<String>,
}

impl<T: HttpTransport> Uploader<T> {
    pub fn new(client: SessionClient<T>, store: RunStore, settings: UploadSettings) -> Self {
        Self {
            client,
            store,
            settings,
            pending_containers: HashSet::new(),
        }
    }

    pub fn client(&self) -> &SessionClient<T> {
        &self.client
    }

    pub fn store(&mut self) -> &mut RunStore {
        &mut self.store
    }

    pub fn settings(&self) -> &UploadSettings {
        &self.settings
    }

    pub fn pending_containers(&self) -> usize {
        self.pending_containers.len()
    }

    pub fn apply_config(&mut self, config: &Config) -> Result<(), UploadError> {
        self.store.reload(&config.local.runid_db)?;
        self.client.reconfigure(Credentials::from(&config.cloud));
        self.settings.max_data = config.local.max_data_cap();
        Ok(())
    }

    pub fn create_run(&mut self, run: &RunDescriptor) -> Result<RunMapping, UploadError> {
        if let Some(mapping) = self.store.get(run.id.as_str())? {
            debug!(local_run = %run.id, remote_run = %mapping.remote, "run already known");
            return Ok(mapping);
        }
        let mut api = self.client.scoped()?;
        let remote = create_remote_run(&mut api, &mut self.store, &mut self.pending_containers, run)?;
        Ok(RunMapping {
            remote,
            uploaded: 0,
        })
    }

    pub fn upload(&mut self, path: &Path, run: &RunDescriptor) -> Result<UploadOutcome, UploadError> {
        let mut progress = Progress {
            path,
            state: UploadState::NeedRun,
        };
        let result = self.run_protocol(&mut progress, run);
        if let Err(err) = &result {
            warn!(path = %path.display(), state = ?progress.state, error = %err, "upload aborted");
        }
        result
    }

    fn run_protocol(
        &mut self,
        progress: &mut Progress<'_>,
        run: &RunDescriptor,
    ) -> Result<UploadOutcome, UploadError> {
        let path = progress.path;
        let format = DataFormat::from_path(path).ok_or_else(|| {
            UploadError::Filesystem(format!("not a data file: {}", path.display()))
        })?;
        let source_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mapping = self.store.get(run.id.as_str())?;
        if let (Some(mapping), Some(max)) = (&mapping, self.settings.max_data) {
            if mapping.uploaded >= max {
                info!(path = %path.display(), uploaded = mapping.uploaded, "max file number reached, skipping");
                return Ok(UploadOutcome::SkippedCapReached);
            }
        }

        let mut api = self.client.scoped()?;
        let remote = match mapping {
            Some(mapping) => mapping.remote,
            None => create_remote_run(&mut api, &mut self.store, &mut self.pending_containers, run)?,
        };
        if self.pending_containers.contains(&remote) {
            match create_container(&mut api, &remote) {
                Ok(()) => {
                    info!(remote_run = %remote, "raw-data container created on retry");
                    self.pending_containers.remove(&remote);
                }
                Err(err) => warn!(remote_run = %remote, error = %err, "raw-data container still missing"),
            }
        }
        progress.advance(UploadState::RunReady);

        let token = match acquire_upload_token(&mut api, &remote) {
            Ok(token) => token,
            Err(UploadError::QuotaExceeded(_)) => {
                info!(path = %path.display(), remote_run = %remote, "upload server quota exceeded, skipping");
                return Ok(UploadOutcome::SkippedQuota);
            }
            Err(err) => return Err(err),
        };
        progress.advance(UploadState::TokenAcquired);

        progress.advance(UploadState::Streaming);
        stream_file(&api, &token, path, &self.settings)?;

        progress.advance(UploadState::Closing);
        let status = close_upload(&api, &token, format)?;

        progress.advance(UploadState::Finalizing);
        let finalized = await_finalized(&api, &token, status, &self.settings)?;
        progress.advance(UploadState::Reported);

        report_upload(&mut api, &remote, &token, &finalized, &source_name)?;
        submit_pipeline(&mut api, &remote, &token, run)?;
        drop(api);

        let uploaded = self.store.increment(run.id.as_str())?;
        progress.advance(UploadState::Done);
        info!(path = %path.display(), remote_run = %remote, uploaded, "file uploaded");
        Ok(UploadOutcome::Uploaded { uploaded })
    }
}

fn create_remote_run<T: HttpTransport>(
    api: &mut SessionClient<T>,
    store: &mut RunStore,
    pending: &mut HashSet<String>,
    run: &RunDescriptor,
) -> Result<String, UploadError> {
    info!(local_run = %run.id, name = %run.name, "new run found, creating run");
    let request = api
        .web(Method::Post, RUN_ENDPOINT)
        .header("Accept", "application/json")
        .form([("name", run.name.as_str())])
        .non_idempotent();
    let created: CreatedRun = api
        .request(request)?
        .ensure_success(RUN_ENDPOINT)?
        .json(RUN_ENDPOINT)?;
    let remote = scalar_text(&created.id).ok_or_else(|| UploadError::RemotePayload {
        endpoint: RUN_ENDPOINT.to_string(),
        message: "run id missing".to_string(),
    })?;
    store.create(run.id.as_str(), &remote)?;

    // The local mapping stays; the container is retried before the next
    // token request for this run.
    if let Err(err) = create_container(api, &remote) {
        warn!(remote_run = %remote, error = %err, "raw-data container creation failed");
        pending.insert(remote.clone());
    }
    Ok(remote)
}

fn create_container<T: HttpTransport>(
    api: &mut SessionClient<T>,
    remote: &str,
) -> Result<(), UploadError> {
    let session = live_token(api)?;
    let request = api.file(Method::Post, CREATE_RUN_ENDPOINT).form([
        ("session", session.as_str()),
        ("id", remote),
        ("action", "create"),
        ("type", "rawdata"),
    ]);
    api.request_file(request)?
        .ensure_success(CREATE_RUN_ENDPOINT)?;
    Ok(())
}

fn acquire_upload_token<T: HttpTransport>(
    api: &mut SessionClient<T>,
    remote: &str,
) -> Result<String, UploadError> {
    let session = live_token(api)?;
    let request = api.file(Method::Post, CREATE_RUN_ENDPOINT).form([
        ("session", session.as_str()),
        ("id", remote),
        ("action", "upload"),
    ]);
    let response = api.request_file(request)?;
    if response.status == 429 {
        return Err(UploadError::QuotaExceeded(remote.to_string()));
    }
    let token = response.ensure_success(CREATE_RUN_ENDPOINT)?.text();
    if token.is_empty() {
        return Err(UploadError::RemotePayload {
            endpoint: CREATE_RUN_ENDPOINT.to_string(),
            message: "empty upload token".to_string(),
        });
    }
    Ok(token)
}

fn stream_file<T: HttpTransport>(
    api: &SessionClient<T>,
    token: &str,
    path: &Path,
    settings: &UploadSettings,
) -> Result<u64, UploadError> {
    thread::sleep(settings.initial_delay);
    let mut file = File::open(path)
        .map_err(|err| UploadError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut buffer = vec![0u8; settings.chunk_size.max(1)];
    let mut offset = 0u64;
    let mut chunks = 0u64;
    loop {
        let read = read_chunk(&mut file, &mut buffer)
            .map_err(|err| UploadError::Filesystem(format!("read {}: {err}", path.display())))?;
        if read == 0 {
            break;
        }
        let end = offset + read as u64;
        let request = api.file(Method::Put, UPLOAD_ENDPOINT).multipart(vec![
            Part::Bytes {
                name: "file".to_string(),
                file_name: "blob".to_string(),
                mime: "application/octet-stream".to_string(),
                data: buffer[..read].to_vec(),
            },
            Part::Text {
                name: "range".to_string(),
                value: format!("{offset}-{end}"),
            },
            Part::Text {
                name: "session".to_string(),
                value: token.to_string(),
            },
        ]);
        api.request_file(request)?.ensure_success(UPLOAD_ENDPOINT)?;
        offset = end;
        chunks += 1;
    }
    debug!(path = %path.display(), chunks, bytes = offset, "file streamed");
    Ok(chunks)
}

fn read_chunk(file: &mut File, buffer: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match file.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(read) => filled += read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

fn close_upload<T: HttpTransport>(
    api: &SessionClient<T>,
    token: &str,
    format: DataFormat,
) -> Result<String, UploadError> {
    let request = api.file(Method::Post, UPLOAD_ENDPOINT).form([
        ("session", token),
        ("action", "close"),
        ("format", format.as_str()),
    ]);
    Ok(api.request_file(request)?.ensure_success(UPLOAD_ENDPOINT)?.text())
}

fn await_finalized<T: HttpTransport>(
    api: &SessionClient<T>,
    token: &str,
    mut status: String,
    settings: &UploadSettings,
) -> Result<String, UploadError> {
    let mut polls = 0u32;
    while status.eq_ignore_ascii_case(FINALIZING) {
        if polls >= settings.max_finalize_polls {
            return Err(UploadError::FinalizeTimeout { attempts: polls });
        }
        thread::sleep(settings.poll_interval);
        let request = api
            .file(Method::Post, UPLOAD_ENDPOINT)
            .form([("session", token), ("action", "finalize")]);
        status = api.request_file(request)?.ensure_success(UPLOAD_ENDPOINT)?.text();
        polls += 1;
    }
    if status.is_empty() {
        return Err(UploadError::RemotePayload {
            endpoint: UPLOAD_ENDPOINT.to_string(),
            message: "empty finalized file name".to_string(),
        });
    }
    debug!(polls, file = %status, "upload finalized");
    Ok(status)
}

fn report_upload<T: HttpTransport>(
    api: &mut SessionClient<T>,
    remote: &str,
    token: &str,
    finalized: &str,
    source_name: &str,
) -> Result<(), UploadError> {
    let endpoint = format!("{REPORT_ENDPOINT}/{remote}/{token}");
    let request = api.web(Method::Put, &endpoint).form([
        ("barcode", REPORT_CATEGORY),
        ("file", finalized),
        ("name", source_name),
    ]);
    api.request(request)?.ensure_success(&endpoint)?;
    Ok(())
}

fn submit_pipeline<T: HttpTransport>(
    api: &mut SessionClient<T>,
    remote: &str,
    token: &str,
    run: &RunDescriptor,
) -> Result<(), UploadError> {
    let session = live_token(api)?;
    let request = api.file(Method::Post, SUBMIT_ENDPOINT).form([
        ("session", session.as_str()),
        ("upload", token),
        ("id", remote),
        ("flowcell", run.flowcell.as_str()),
        ("kit", run.kit.as_str()),
        ("barcode", run.barcode_kit.as_str()),
    ]);
    api.request_file(request)?.ensure_success(SUBMIT_ENDPOINT)?;
    Ok(())
}

fn live_token<T: HttpTransport>(api: &mut SessionClient<T>) -> Result<String, UploadError> {
    if api.token().is_none() || api.is_expired() {
        api.login()?;
    }
    api.token()
        .map(str::to_string)
        .ok_or_else(|| UploadError::Credential("no session token".to_string()))
}
