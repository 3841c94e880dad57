use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use anyhow::Context;
use reqwest::{Method, RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const MAX_ERROR_BODY_BYTES: usize = 4 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("{method} {path} returned {status}: {body}")]
    Status {
        method: Method,
        path: String,
        status: u16,
        body: String,
    },
    #[error("{method} {path}: {source}")]
    Transport {
        method: Method,
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("stream {path}: {source}")]
    Stream {
        path: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[error("invalid control url: {0}")]
    Url(String),
}

impl ControlError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ControlError::Status { status, .. } => Some(*status),
            ControlError::Transport { source, .. } => source.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ControlError::Transport { source, .. } if source.is_timeout())
    }
}

/// Body of `POST /flowforge/command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum LifecycleCommand {
    Start,
    Stop,
    Restart,
    Logout { token: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentCommand {
    Start,
    Stop,
}

impl AgentCommand {
    fn as_str(self) -> &'static str {
        match self {
            AgentCommand::Start => "start",
            AgentCommand::Stop => "stop",
        }
    }
}

/// `GET /flowforge/info` response; only `id` is interpreted.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct InstanceInfo {
    pub id: String,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct UploadEntry {
    /// Path relative to the upload target directory.
    pub path: String,
    pub contents: Vec<u8>,
}

/// Wraps a bare resource list as `{meta, resources, count}`; anything else
/// passes through.
pub fn normalize_resources(v: Value) -> Value {
    match v {
        Value::Array(items) => {
            let count = items.len();
            serde_json::json!({
                "meta": {},
                "resources": items,
                "count": count,
            })
        }
        other => other,
    }
}

/// HTTP client for control endpoints on this host.
#[derive(Debug, Clone)]
pub struct ControlClient {
    http: reqwest::Client,
    host: String,
    calls: Arc<AtomicU64>,
}

impl ControlClient {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_host("127.0.0.1")
    }

    pub fn with_host(host: impl Into<String>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("localfs-driver/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()
            .context("build control http client")?;
        Ok(Self {
            http,
            host: host.into(),
            calls: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Number of network calls (HTTP and stream) issued so far.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub(crate) fn count_call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn url(&self, scheme: &str, port: u16, segments: &[&str]) -> Result<Url, ControlError> {
        let raw = format!("{scheme}://{}:{port}/", self.host);
        let mut url = Url::parse(&raw).map_err(|e| ControlError::Url(format!("{raw}: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ControlError::Url(raw.clone()))?
            .clear()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http.request(method, url)
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<reqwest::Response, ControlError> {
        let path = url.path().to_string();
        self.count_call();
        let resp = build(self.request(method.clone(), url))
            .send()
            .await
            .map_err(|source| ControlError::Transport {
                method: method.clone(),
                path: path.clone(),
                source,
            })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let mut body = resp.text().await.unwrap_or_default();
        if body.len() > MAX_ERROR_BODY_BYTES {
            let mut end = MAX_ERROR_BODY_BYTES;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Err(ControlError::Status {
            method,
            path,
            status: status.as_u16(),
            body,
        })
    }

    async fn json(
        &self,
        method: Method,
        url: Url,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<Value, ControlError> {
        let path = url.path().to_string();
        let resp = self.send(method.clone(), url, build).await?;
        let bytes = resp.bytes().await.map_err(|source| ControlError::Transport {
            method,
            path,
            source,
        })?;
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        }))
    }

    pub async fn info(
        &self,
        control_port: u16,
        timeout: Option<Duration>,
    ) -> Result<InstanceInfo, ControlError> {
        let url = self.url("http", control_port, &["flowforge", "info"])?;
        let path = url.path().to_string();
        let resp = self
            .send(Method::GET, url, |r| match timeout {
                Some(t) => r.timeout(t),
                None => r,
            })
            .await?;
        resp.json::<InstanceInfo>()
            .await
            .map_err(|source| ControlError::Transport {
                method: Method::GET,
                path,
                source,
            })
    }

    pub async fn command(
        &self,
        control_port: u16,
        cmd: &LifecycleCommand,
    ) -> Result<(), ControlError> {
        let url = self.url("http", control_port, &["flowforge", "command"])?;
        self.send(Method::POST, url, |r| r.json(cmd)).await?;
        Ok(())
    }

    pub async fn logs(&self, control_port: u16) -> Result<Value, ControlError> {
        let url = self.url("http", control_port, &["flowforge", "logs"])?;
        self.json(Method::GET, url, |r| r).await
    }

    pub async fn resources(&self, control_port: u16) -> Result<Value, ControlError> {
        let url = self.url("http", control_port, &["flowforge", "resources"])?;
        Ok(normalize_resources(self.json(Method::GET, url, |r| r).await?))
    }

    fn file_url(&self, control_port: u16, path: &str) -> Result<Url, ControlError> {
        self.url("http", control_port, &["flowforge", "files", "_", path])
    }

    pub async fn list_files(&self, control_port: u16, path: &str) -> Result<Value, ControlError> {
        let url = self.file_url(control_port, path)?;
        self.json(Method::GET, url, |r| r).await
    }

    pub async fn create_file(
        &self,
        control_port: u16,
        path: &str,
        contents: Vec<u8>,
    ) -> Result<Value, ControlError> {
        let url = self.file_url(control_port, path)?;
        self.json(Method::POST, url, |r| {
            r.header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(contents)
        })
        .await
    }

    pub async fn update_file(
        &self,
        control_port: u16,
        path: &str,
        update: &Value,
    ) -> Result<Value, ControlError> {
        let url = self.file_url(control_port, path)?;
        self.json(Method::PUT, url, |r| r.json(update)).await
    }

    pub async fn delete_file(&self, control_port: u16, path: &str) -> Result<(), ControlError> {
        let url = self.file_url(control_port, path)?;
        self.send(Method::DELETE, url, |r| r).await?;
        Ok(())
    }

    pub async fn create_directory(
        &self,
        control_port: u16,
        path: &str,
        name: &str,
    ) -> Result<Value, ControlError> {
        let url = self.file_url(control_port, path)?;
        let body = serde_json::json!({ "path": name });
        self.json(Method::POST, url, |r| r.json(&body)).await
    }

    /// Uploads every entry under `path`, one request per file, stopping at
    /// the first failure.
    pub async fn upload_directory(
        &self,
        control_port: u16,
        path: &str,
        entries: Vec<UploadEntry>,
    ) -> Result<usize, ControlError> {
        let base = path.trim_end_matches('/');
        let mut uploaded = 0;
        for entry in entries {
            let rel = entry.path.trim_start_matches('/');
            let target = if base.is_empty() {
                rel.to_string()
            } else {
                format!("{base}/{rel}")
            };
            self.create_file(control_port, &target, entry.contents).await?;
            uploaded += 1;
        }
        Ok(uploaded)
    }

    pub async fn agent_health(
        &self,
        port: u16,
        timeout: Option<Duration>,
    ) -> Result<Value, ControlError> {
        let url = self.url("http", port, &["healthz"])?;
        self.json(Method::GET, url, |r| match timeout {
            Some(t) => r.timeout(t),
            None => r,
        })
        .await
    }

    pub async fn agent_status(&self, port: u16) -> Result<Value, ControlError> {
        let url = self.url("http", port, &["api", "v1", "status"])?;
        self.json(Method::GET, url, |r| r).await
    }

    pub async fn agent_command(&self, port: u16, cmd: AgentCommand) -> Result<(), ControlError> {
        let url = self.url("http", port, &["api", "v1", "commands", cmd.as_str()])?;
        self.send(Method::POST, url, |r| r).await?;
        Ok(())
    }
}
