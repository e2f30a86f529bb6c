use std::ops::{Deref, DerefMut};
use std::time::{Duration, Instant};

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::{info, warn};

use crate::config::CloudConfig;
use crate::domain::VersionInfo;
use crate::error::UploadError;
use crate::transport::{HttpRequest, HttpResponse, HttpTransport, Method};

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_TIMEOUT: Duration = Duration::from_secs(3600);

const SESSION_INIT: &str = "rest/session/init";
const SESSION_LOGIN: &str = "rest/session/login";
const WEB_INFO: &str = "rest/info";
const FILE_VERSION: &str = "cgi-bin/version.py";

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: String,
    pub website_server: String,
    pub upload_server: String,
    pub retries: u32,
}

impl From<&CloudConfig> for Credentials {
    fn from(cloud: &CloudConfig) -> Self {
        Self {
            user: cloud.user.clone(),
            password: cloud.password.clone(),
            website_server: cloud.website_server.clone(),
            upload_server: cloud.upload_server.clone(),
            retries: cloud.attempt,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("website_server", &self.website_server)
            .field("upload_server", &self.upload_server)
            .field("retries", &self.retries)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct SessionInit {
    id: Value,
    hash: String,
}

// HMAC-SHA256 of the password keyed by the salt, then of that digest keyed
// by the session id zero-padded to 12 hex digits.
pub fn hash_password(password: &str, salt: &str, session: &str) -> Result<String, UploadError> {
    let salt_key = hex::decode(salt)
        .map_err(|err| UploadError::Credential(format!("invalid login salt: {err}")))?;
    let session_key = hex::decode(format!("{session:0>12}"))
        .map_err(|err| UploadError::Credential(format!("invalid session id: {err}")))?;

    let mut salted = HmacSha256::new_from_slice(&salt_key)
        .map_err(|err| UploadError::Credential(err.to_string()))?;
    salted.update(password.as_bytes());
    let salted = salted.finalize().into_bytes();

    let mut session_pass = HmacSha256::new_from_slice(&session_key)
        .map_err(|err| UploadError::Credential(err.to_string()))?;
    session_pass.update(&salted);
    Ok(hex::encode(session_pass.finalize().into_bytes()))
}

pub(crate) fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.trim().is_empty() => Some(text.trim().to_string()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

pub struct SessionClient<T: HttpTransport> {
    transport: T,
    credentials: Credentials,
    token: Option<String>,
    issued_at: Option<Instant>,
    timeout: Duration,
}

impl<T: HttpTransport> SessionClient<T> {
    pub fn new(transport: T, credentials: Credentials) -> Self {
        Self {
            transport,
            credentials,
            token: None,
            issued_at: None,
            timeout: SESSION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn reconfigure(&mut self, credentials: Credentials) {
        if credentials == self.credentials {
            return;
        }
        self.logout();
        self.credentials = credentials;
        info!(user = %self.credentials.user, "session credentials updated");
    }

    pub fn is_expired(&self) -> bool {
        self.issued_at
            .map(|issued| issued.elapsed() > self.timeout)
            .unwrap_or(true)
    }

    pub fn login(&mut self) -> Result<(), UploadError> {
        if self.credentials.user.is_empty() || self.credentials.password.is_empty() {
            return Err(UploadError::Credential("login info not set".to_string()));
        }
        let init = HttpRequest::new(Method::Post, &self.credentials.website_server, SESSION_INIT)
            .header("Accept", "application/json")
            .form([("name", self.credentials.user.as_str())])
            .retries(self.credentials.retries);
        let response = self.transport.send(&init)?;
        if response.status != 200 {
            return Err(UploadError::Credential(format!(
                "server maintenance (session init returned {})",
                response.status
            )));
        }
        let data: SessionInit = response.json(SESSION_INIT)?;
        let session_id = scalar_text(&data.id).ok_or_else(|| UploadError::RemotePayload {
            endpoint: SESSION_INIT.to_string(),
            message: "missing session id".to_string(),
        })?;
        let pass = hash_password(&self.credentials.password, &data.hash, &session_id)?;

        let login = HttpRequest::new(Method::Post, &self.credentials.website_server, SESSION_LOGIN)
            .form([("id", session_id.as_str()), ("pass", pass.as_str())])
            .retries(self.credentials.retries);
        let response = self.transport.send(&login)?;
        if response.status != 202 {
            return Err(UploadError::Credential(format!(
                "login failed with status {}",
                response.status
            )));
        }
        self.token = Some(session_id);
        self.issued_at = Some(Instant::now());
        info!(user = %self.credentials.user, "login successful");
        Ok(())
    }

    pub fn logout(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        self.issued_at = None;
        let request =
            HttpRequest::new(Method::Delete, &self.credentials.website_server, SESSION_LOGIN)
                .query("id", &token);
        match self.transport.send(&request) {
            Ok(response) if response.status == 202 => info!("logout successful"),
            Ok(response) => warn!(status = response.status, "logout failed"),
            Err(err) => warn!(error = %err, "logout failed"),
        }
    }

    pub fn scoped(&mut self) -> Result<SessionGuard<'_, T>, UploadError> {
        self.login()?;
        Ok(SessionGuard { client: self })
    }

    pub fn web(&self, method: Method, endpoint: &str) -> HttpRequest {
        HttpRequest::new(method, &self.credentials.website_server, endpoint)
            .retries(self.credentials.retries)
    }

    pub fn file(&self, method: Method, endpoint: &str) -> HttpRequest {
        HttpRequest::new(method, &self.credentials.upload_server, endpoint)
            .header("Origin", &self.credentials.website_server)
            .retries(self.credentials.retries)
    }

    pub fn request(&mut self, request: HttpRequest) -> Result<HttpResponse, UploadError> {
        if self.token.is_none() || self.is_expired() {
            if self.token.is_some() {
                info!("session token expired, refreshing");
            }
            self.login()?;
        }
        let token = self
            .token
            .as_deref()
            .ok_or_else(|| UploadError::Credential("no session token".to_string()))?;
        let request = request.header("Cookie", &format!("SessionID={token}"));
        self.transport.send(&request)
    }

    pub fn request_file(&self, request: HttpRequest) -> Result<HttpResponse, UploadError> {
        self.transport.send(&request)
    }

    pub fn web_version(&mut self) -> Result<VersionInfo, UploadError> {
        let request = self
            .web(Method::Get, WEB_INFO)
            .header("Accept", "application/json");
        self.request(request)?
            .ensure_success(WEB_INFO)?
            .json(WEB_INFO)
    }

    pub fn file_version(&self) -> Result<VersionInfo, UploadError> {
        let request = self
            .file(Method::Get, FILE_VERSION)
            .header("Accept", "application/json");
        self.request_file(request)?
            .ensure_success(FILE_VERSION)?
            .json(FILE_VERSION)
    }
}

pub struct SessionGuard<'a, T: HttpTransport> {
    client: &'a mut SessionClient<T>,
}

impl<T: HttpTransport> Deref for SessionGuard<'_, T> {
    type Target = SessionClient<T>;

    fn deref(&self) -> &Self::Target {
        self.client
    }
}

impl<T: HttpTransport> DerefMut for SessionGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.client
    }
}

impl<T: HttpTransport> Drop for SessionGuard<'_, T> {
    fn drop(&mut self) {
        self.client.logout();
    }
}
