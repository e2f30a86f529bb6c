use std::fmt;
use std::thread;
use std::time::Duration;

use reqwest::blocking::multipart;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::UploadError;

pub fn user_agent() -> String {
    format!("mlstverse/{} (mlstupload)", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    Text {
        name: String,
        value: String,
    },
    Bytes {
        name: String,
        file_name: String,
        mime: String,
        data: Vec<u8>,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RequestBody {
    #[default]
    Empty,
    Form(Vec<(String, String)>),
    Multipart(Vec<Part>),
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub endpoint: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub idempotent: bool,
    pub retries: u32,
}

impl HttpRequest {
    pub fn new(method: Method, base: &str, endpoint: &str) -> Self {
        Self {
            method,
            endpoint: endpoint.to_string(),
            url: join_url(base, endpoint),
            headers: Vec::new(),
            query: Vec::new(),
            body: RequestBody::Empty,
            idempotent: true,
            retries: 0,
        }
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn query(mut self, name: &str, value: &str) -> Self {
        self.query.push((name.to_string(), value.to_string()));
        self
    }

    pub fn form<K: Into<String>, V: Into<String>>(
        mut self,
        pairs: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        self.body = RequestBody::Form(
            pairs
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        );
        self
    }

    pub fn multipart(mut self, parts: Vec<Part>) -> Self {
        self.body = RequestBody::Multipart(parts);
        self
    }

    pub fn non_idempotent(mut self) -> Self {
        self.idempotent = false;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn form_value(&self, name: &str) -> Option<&str> {
        match &self.body {
            RequestBody::Form(pairs) => pairs
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str()),
            RequestBody::Multipart(parts) => parts.iter().find_map(|part| match part {
                Part::Text { name: key, value } if key == name => Some(value.as_str()),
                _ => None,
            }),
            RequestBody::Empty => None,
        }
    }

    fn effective_retries(&self) -> u32 {
        if self.idempotent { self.retries } else { 0 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).trim().to_string()
    }

    pub fn json<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, UploadError> {
        serde_json::from_slice(&self.body).map_err(|err| UploadError::RemotePayload {
            endpoint: endpoint.to_string(),
            message: err.to_string(),
        })
    }

    pub fn ensure_success(self, endpoint: &str) -> Result<Self, UploadError> {
        if self.is_success() {
            return Ok(self);
        }
        Err(UploadError::RemoteStatus {
            endpoint: endpoint.to_string(),
            status: self.status,
            message: self.text(),
        })
    }
}

pub trait HttpTransport: Send + Sync {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, UploadError>;
}

#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
}

impl ReqwestTransport {
    pub fn new() -> Result<Self, UploadError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&user_agent()).map_err(|err| UploadError::Http(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|err| UploadError::Http(err.to_string()))?;
        Ok(Self { client })
    }

    fn build(&self, request: &HttpRequest) -> Result<RequestBuilder, UploadError> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
        };
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Form(pairs) => builder.form(pairs),
            RequestBody::Multipart(parts) => builder.multipart(multipart_form(parts)?),
        };
        Ok(builder)
    }

    fn send_with_retries<F>(&self, retries: u32, mut make_req: F) -> Result<Response, UploadError>
    where
        F: FnMut() -> Result<RequestBuilder, UploadError>,
    {
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0u32;
        loop {
            let response = make_req()?.send();
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < retries && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < retries && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        thread::sleep(Duration::from_millis(delay));
                        attempt += 1;
                        continue;
                    }
                    return Err(UploadError::Http(err.to_string()));
                }
            }
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn send(&self, request: &HttpRequest) -> Result<HttpResponse, UploadError> {
        debug!(method = %request.method, url = %request.url, "sending request");
        let response =
            self.send_with_retries(request.effective_retries(), || self.build(request))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .map_err(|err| UploadError::Http(err.to_string()))?;
        Ok(HttpResponse::new(status, body.to_vec()))
    }
}

fn multipart_form(parts: &[Part]) -> Result<multipart::Form, UploadError> {
    let mut form = multipart::Form::new();
    for part in parts {
        form = match part {
            Part::Text { name, value } => form.text(name.clone(), value.clone()),
            Part::Bytes {
                name,
                file_name,
                mime,
                data,
            } => {
                let body = multipart::Part::bytes(data.clone())
                    .file_name(file_name.clone())
                    .mime_str(mime)
                    .map_err(|err| UploadError::Http(err.to_string()))?;
                form.part(name.clone(), body)
            }
        };
    }
    Ok(form)
}

pub fn join_url(base: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

// 429 is the file service's quota signal, not a transient failure.
fn is_retryable_status(status: u16) -> bool {
    matches!(status, 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}
