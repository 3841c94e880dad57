use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::Context;
use localfs_process::{AgentId, DesiredState, InstanceId, StackRef};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{io::AsyncWriteExt, sync::Mutex};

use crate::stack::StackProperties;

pub const SETTING_PORT: &str = "port";
pub const SETTING_PATH: &str = "path";
pub const SETTING_PID: &str = "pid";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub state: DesiredState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<StackRef>,
    /// Secret the launcher uses to encrypt flow credentials.
    #[serde(default)]
    pub credential_secret: String,
}

/// What the reconciler needs to know about an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceSummary {
    pub id: InstanceId,
    pub state: DesiredState,
    pub stack: Option<StackRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRecord {
    pub name: StackRef,
    #[serde(default)]
    pub properties: StackProperties,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: AgentId,
    pub team_id: String,
    #[serde(default)]
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Desired run state.
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerCredentials {
    pub url: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokens {
    pub client_id: String,
    pub client_secret: String,
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<BrokerCredentials>,
}

#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    async fn list_instances(&self) -> anyhow::Result<Vec<InstanceSummary>>;
    async fn list_broker_agents(&self) -> anyhow::Result<Vec<AgentRecord>>;
    async fn get_instance(&self, id: &InstanceId) -> anyhow::Result<Option<InstanceRecord>>;
    async fn save_instance(&self, record: &InstanceRecord) -> anyhow::Result<()>;
    async fn get_setting(&self, id: &InstanceId, key: &str) -> anyhow::Result<Option<Value>>;
    async fn set_setting(&self, id: &InstanceId, key: &str, value: Value) -> anyhow::Result<()>;
    async fn delete_setting(&self, id: &InstanceId, key: &str) -> anyhow::Result<()>;
    async fn get_stack(&self, stack: &StackRef) -> anyhow::Result<Option<StackRecord>>;
    /// Issues a fresh bearer token for the instance.
    async fn refresh_auth_tokens(&self, id: &InstanceId) -> anyhow::Result<AuthTokens>;
    async fn get_agent(&self, id: &AgentId) -> anyhow::Result<Option<AgentRecord>>;
    async fn save_agent(&self, record: &AgentRecord) -> anyhow::Result<()>;
}

/// Typed view over the `port`/`path`/`pid` settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceSettings {
    pub port: Option<u16>,
    pub path: Option<PathBuf>,
    pub pid: Option<u32>,
}

impl InstanceSettings {
    pub async fn load(repo: &dyn Repository, id: &InstanceId) -> anyhow::Result<Self> {
        let port = repo
            .get_setting(id, SETTING_PORT)
            .await?
            .and_then(|v| v.as_u64())
            .and_then(|v| u16::try_from(v).ok());
        let path = repo
            .get_setting(id, SETTING_PATH)
            .await?
            .and_then(|v| v.as_str().map(PathBuf::from));
        let pid = repo
            .get_setting(id, SETTING_PID)
            .await?
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok());
        Ok(Self { port, path, pid })
    }

    pub async fn store(&self, repo: &dyn Repository, id: &InstanceId) -> anyhow::Result<()> {
        if let Some(port) = self.port {
            repo.set_setting(id, SETTING_PORT, Value::from(port)).await?;
        }
        if let Some(path) = &self.path {
            repo.set_setting(id, SETTING_PATH, Value::from(path.display().to_string()))
                .await?;
        }
        if let Some(pid) = self.pid {
            repo.set_setting(id, SETTING_PID, Value::from(pid)).await?;
        }
        Ok(())
    }

    /// Drops all three settings so nothing treats the instance as placed.
    pub async fn clear(repo: &dyn Repository, id: &InstanceId) -> anyhow::Result<()> {
        for key in [SETTING_PORT, SETTING_PATH, SETTING_PID] {
            repo.delete_setting(id, key).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoredCredentials {
    client_id: String,
    client_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    broker: Option<BrokerCredentials>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    instances: BTreeMap<InstanceId, InstanceRecord>,
    #[serde(default)]
    settings: BTreeMap<InstanceId, BTreeMap<String, Value>>,
    #[serde(default)]
    credentials: BTreeMap<InstanceId, StoredCredentials>,
    #[serde(default)]
    stacks: BTreeMap<String, StackRecord>,
    #[serde(default)]
    agents: BTreeMap<AgentId, AgentRecord>,
}

/// Repository kept in memory and, when opened from a path, mirrored to a
/// JSON snapshot after every write.
#[derive(Debug, Default)]
pub struct JsonRepository {
    path: Option<PathBuf>,
    inner: Mutex<Snapshot>,
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

async fn write_snapshot(path: &Path, snapshot: &Snapshot) -> anyhow::Result<()> {
    if let Some(dir) = path.parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .context("create repository dir")?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(snapshot).context("serialize repository")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .context("create repository tmp file")?;
    f.write_all(&data).await.context("write repository tmp file")?;
    f.flush().await.ok();
    tokio::fs::rename(&tmp, path)
        .await
        .context("persist repository")?;
    Ok(())
}

impl JsonRepository {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub async fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Snapshot::default(),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };
        Ok(Self {
            path: Some(path),
            inner: Mutex::new(snapshot),
        })
    }

    async fn persist(&self, snapshot: &Snapshot) -> anyhow::Result<()> {
        match &self.path {
            Some(path) => write_snapshot(path, snapshot).await,
            None => Ok(()),
        }
    }

    pub async fn insert_instance(&self, record: InstanceRecord) -> anyhow::Result<()> {
        let mut snap = self.inner.lock().await;
        snap.instances.insert(record.id.clone(), record);
        self.persist(&snap).await
    }

    pub async fn insert_stack(&self, record: StackRecord) -> anyhow::Result<()> {
        let mut snap = self.inner.lock().await;
        snap.stacks.insert(record.name.0.clone(), record);
        self.persist(&snap).await
    }

    pub async fn set_broker_credentials(
        &self,
        id: &InstanceId,
        broker: BrokerCredentials,
    ) -> anyhow::Result<()> {
        let mut snap = self.inner.lock().await;
        snap.credentials.entry(id.clone()).or_default().broker = Some(broker);
        self.persist(&snap).await
    }
}

#[async_trait::async_trait]
impl Repository for JsonRepository {
    async fn list_instances(&self) -> anyhow::Result<Vec<InstanceSummary>> {
        let snap = self.inner.lock().await;
        Ok(snap
            .instances
            .values()
            .map(|r| InstanceSummary {
                id: r.id.clone(),
                state: r.state,
                stack: r.stack.clone(),
            })
            .collect())
    }

    async fn list_broker_agents(&self) -> anyhow::Result<Vec<AgentRecord>> {
        Ok(self.inner.lock().await.agents.values().cloned().collect())
    }

    async fn get_instance(&self, id: &InstanceId) -> anyhow::Result<Option<InstanceRecord>> {
        Ok(self.inner.lock().await.instances.get(id).cloned())
    }

    async fn save_instance(&self, record: &InstanceRecord) -> anyhow::Result<()> {
        self.insert_instance(record.clone()).await
    }

    async fn get_setting(&self, id: &InstanceId, key: &str) -> anyhow::Result<Option<Value>> {
        let snap = self.inner.lock().await;
        Ok(snap.settings.get(id).and_then(|m| m.get(key)).cloned())
    }

    async fn set_setting(&self, id: &InstanceId, key: &str, value: Value) -> anyhow::Result<()> {
        let mut snap = self.inner.lock().await;
        snap.settings
            .entry(id.clone())
            .or_default()
            .insert(key.to_string(), value);
        self.persist(&snap).await
    }

    async fn delete_setting(&self, id: &InstanceId, key: &str) -> anyhow::Result<()> {
        let mut snap = self.inner.lock().await;
        let removed = snap
            .settings
            .get_mut(id)
            .and_then(|m| m.remove(key))
            .is_some();
        if removed {
            self.persist(&snap).await?;
        }
        Ok(())
    }

    async fn get_stack(&self, stack: &StackRef) -> anyhow::Result<Option<StackRecord>> {
        Ok(self.inner.lock().await.stacks.get(&stack.0).cloned())
    }

    async fn refresh_auth_tokens(&self, id: &InstanceId) -> anyhow::Result<AuthTokens> {
        let mut snap = self.inner.lock().await;
        if !snap.instances.contains_key(id) {
            anyhow::bail!("unknown instance: {id}");
        }
        let creds = snap.credentials.entry(id.clone()).or_default();
        if creds.client_id.is_empty() {
            creds.client_id = format!("ffp_{}", random_hex(8));
            creds.client_secret = random_hex(32);
        }
        let token = format!("ffpt_{}", random_hex(32));
        creds.token = Some(token.clone());
        let tokens = AuthTokens {
            client_id: creds.client_id.clone(),
            client_secret: creds.client_secret.clone(),
            token,
            broker: creds.broker.clone(),
        };
        self.persist(&snap).await?;
        Ok(tokens)
    }

    async fn get_agent(&self, id: &AgentId) -> anyhow::Result<Option<AgentRecord>> {
        Ok(self.inner.lock().await.agents.get(id).cloned())
    }

    async fn save_agent(&self, record: &AgentRecord) -> anyhow::Result<()> {
        let mut snap = self.inner.lock().await;
        snap.agents.insert(record.id.clone(), record.clone());
        self.persist(&snap).await
    }
}
