use std::{
    collections::BTreeMap,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::Context;
use localfs_process::{DesiredState, InstanceId, ObservedState, ProcessKey};
use serde::Serialize;
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use crate::{
    config::DriverConfig,
    control::{ControlClient, InstanceInfo, LifecycleCommand, UploadEntry},
    error::DriverError,
    layout,
    port_alloc::PortPool,
    reconcile::{PassReport, Reconciler},
    relay::{self, RelayEnd, StreamMessage},
    repository::{InstanceSettings, InstanceSummary, Repository},
    stack::{self, StackSchema},
    supervisor::{ProcessSupervisor, control_port},
    tracker::StateTracker,
};

/// Everything the driver shares between its public calls and the
/// reconciliation timer. Built once in [`LocalDriver::init`].
pub struct DriverContext {
    pub(crate) config: DriverConfig,
    pub(crate) repo: Arc<dyn Repository>,
    pub(crate) tracker: StateTracker,
    pub(crate) supervisor: ProcessSupervisor,
    pub(crate) control: ControlClient,
    instance_ports: Mutex<PortPool>,
    agent_ports: Mutex<PortPool>,
    fatal: watch::Sender<Option<String>>,
}

impl DriverContext {
    pub(crate) fn instance_ports(&self) -> MutexGuard<'_, PortPool> {
        self.instance_ports.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn agent_ports(&self) -> MutexGuard<'_, PortPool> {
        self.agent_ports.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Publishes an unrecoverable condition to whoever hosts the driver.
    pub(crate) fn raise_fatal(&self, err: &DriverError) {
        tracing::error!(error = %err, "unrecoverable driver error");
        self.fatal.send_replace(Some(err.to_string()));
    }

    pub(crate) fn note_error(&self, err: &DriverError) {
        if err.is_fatal() {
            self.raise_fatal(err);
        }
    }

    /// Control port of a tracked process. Fails without touching the network
    /// when the key is unknown.
    pub(crate) fn tracked_port(&self, key: &ProcessKey) -> Result<u16, DriverError> {
        let tracked = self
            .tracker
            .get(key)
            .ok_or_else(|| DriverError::NotTracked(key.clone()))?;
        tracked.port.ok_or_else(|| DriverError::NoPort(key.clone()))
    }

    fn instance_control_port(&self, id: &InstanceId) -> Result<u16, DriverError> {
        let key = ProcessKey::Instance(id.clone());
        let port = self.tracked_port(&key)?;
        control_port(port).ok_or(DriverError::NoPort(key))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceDetails {
    pub state: ObservedState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<InstanceInfo>,
}

/// Settings handed to the launcher on request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LauncherSettings {
    #[serde(rename = "projectID")]
    pub instance_id: InstanceId,
    pub root_dir: PathBuf,
    pub user_dir: String,
    pub port: Option<u16>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub env: BTreeMap<String, String>,
}

fn instance_url(base_url: &str, port: u16) -> anyhow::Result<String> {
    let mut url = reqwest::Url::parse(base_url).with_context(|| format!("parse base url {base_url}"))?;
    url.set_port(Some(port))
        .map_err(|_| anyhow::anyhow!("base url {base_url} cannot carry a port"))?;
    Ok(url.to_string())
}

/// Runs instances (and broker agents) as local child processes.
#[derive(Clone)]
pub struct LocalDriver {
    pub(crate) ctx: Arc<DriverContext>,
    timer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LocalDriver {
    /// Prepares directories, rebuilds in-memory state from the repository and
    /// starts the reconciliation timer.
    pub async fn init(
        config: DriverConfig,
        repo: Arc<dyn Repository>,
    ) -> Result<(Self, StackSchema), DriverError> {
        layout::ensure_root(&config.projects_root()).await?;
        layout::ensure_root(&config.agents_root()).await?;
        layout::ensure_root(&config.stacks_dir()).await?;

        let (fatal, _) = watch::channel(None);
        let ctx = Arc::new(DriverContext {
            instance_ports: Mutex::new(PortPool::new(config.start_port)),
            agent_ports: Mutex::new(PortPool::new(config.agent_start_port)),
            control: ControlClient::new()?,
            supervisor: ProcessSupervisor::new(),
            tracker: StateTracker::new(),
            repo,
            config,
            fatal,
        });

        let instances = ctx.repo.list_instances().await.context("list instances")?;
        for s in &instances {
            let settings = InstanceSettings::load(ctx.repo.as_ref(), &s.id).await?;
            if let Some(port) = settings.port {
                ctx.instance_ports().claim(port);
            }
            ctx.tracker
                .seed(ProcessKey::Instance(s.id.clone()), settings.port);
        }
        let agents = ctx.repo.list_broker_agents().await.context("list broker agents")?;
        for a in &agents {
            if let Some(port) = a.port {
                ctx.agent_ports().claim(port);
            }
            ctx.tracker.seed(ProcessKey::Agent(a.id.clone()), a.port);
        }
        tracing::info!(
            instances = instances.len(),
            agents = agents.len(),
            root = %ctx.config.projects_root().display(),
            "local driver initialised"
        );

        let driver = Self {
            ctx,
            timer: Arc::new(Mutex::new(None)),
        };
        let handle = Reconciler::new(driver.ctx.clone()).spawn();
        *driver.timer.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok((driver, stack::stack_schema()))
    }

    pub fn config(&self) -> &DriverConfig {
        &self.ctx.config
    }

    /// Flips to `Some(reason)` when the driver hits an unrecoverable error.
    pub fn fatal(&self) -> watch::Receiver<Option<String>> {
        self.ctx.fatal.subscribe()
    }

    /// Stops the reconciliation timer. Children keep running.
    pub fn shutdown(&self) {
        if let Some(handle) = self.timer.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
        tracing::info!("local driver shut down");
    }

    /// Runs one reconciliation pass immediately.
    pub async fn reconcile_now(&self) -> PassReport {
        Reconciler::new(self.ctx.clone()).run_pass().await
    }

    pub fn observed_state(&self, key: &ProcessKey) -> Option<ObservedState> {
        self.ctx.tracker.state(key)
    }

    /// Places and spawns the instance. A port persisted from an earlier run is
    /// kept; a fresh one is reserved only for an instance that never had one.
    /// Creating an instance that is already running is a no-op.
    pub async fn create(&self, id: &InstanceId, options: CreateOptions) -> Result<(), DriverError> {
        let ctx = &self.ctx;
        let mut record = ctx
            .repo
            .get_instance(id)
            .await?
            .ok_or_else(|| DriverError::UnknownInstance(id.clone()))?;
        let key = ProcessKey::Instance(id.clone());
        if ctx.tracker.state(&key) == Some(ObservedState::Started) {
            tracing::debug!(instance = %id, "create: already running");
            return Ok(());
        }

        let settings = InstanceSettings::load(ctx.repo.as_ref(), id).await?;
        let dir = match settings.path {
            Some(path) => {
                tokio::fs::create_dir_all(&path)
                    .await
                    .with_context(|| format!("create {}", path.display()))?;
                path
            }
            None => layout::ensure_instance_dir(&ctx.config.projects_root(), id.as_str()).await?,
        };

        let (port, fresh) = match settings.port {
            Some(port) => {
                ctx.instance_ports().claim(port);
                (port, false)
            }
            None => (ctx.instance_ports().reserve()?, true),
        };
        ctx.tracker.set_state(&key, ObservedState::Starting);

        let result: Result<u32, DriverError> = async {
            let pid = ctx
                .supervisor
                .spawn_instance(&ctx.config, ctx.repo.as_ref(), &record, &dir, port, &options.env)
                .await?;
            InstanceSettings {
                port: Some(port),
                path: Some(dir.clone()),
                pid: Some(pid),
            }
            .store(ctx.repo.as_ref(), id)
            .await?;
            record.url = Some(instance_url(&ctx.config.base_url, port)?);
            ctx.repo.save_instance(&record).await?;
            Ok(pid)
        }
        .await;

        match result {
            Ok(pid) => {
                ctx.tracker.record_spawn(&key, pid, port, Some(dir));
                tracing::info!(instance = %id, pid, port, "instance created");
                Ok(())
            }
            Err(e) => {
                if fresh {
                    ctx.instance_ports().release(port);
                    ctx.tracker.remove(&key);
                } else {
                    ctx.tracker.seed(key.clone(), Some(port));
                    ctx.tracker.set_state(&key, ObservedState::Unknown);
                }
                ctx.note_error(&e);
                Err(e)
            }
        }
    }

    /// Stops the process, schedules the directory for deletion and forgets the
    /// instance, including its persisted placement.
    pub async fn remove(&self, id: &InstanceId) -> Result<(), DriverError> {
        let ctx = &self.ctx;
        let key = ProcessKey::Instance(id.clone());
        let settings = InstanceSettings::load(ctx.repo.as_ref(), id).await?;
        let tracked = ctx.tracker.get(&key).unwrap_or_default();

        let pid = settings.pid.or(tracked.pid);
        ctx.supervisor.stop(&key, pid).await;

        let dir = settings
            .path
            .or(tracked.dir)
            .unwrap_or_else(|| layout::instance_dir(&ctx.config.projects_root(), id.as_str()));
        layout::schedule_removal(dir, ctx.config.remove_delay);

        InstanceSettings::clear(ctx.repo.as_ref(), id).await?;
        if let Some(port) = settings.port.or(tracked.port) {
            ctx.instance_ports().release(port);
        }
        ctx.tracker.remove(&key);
        tracing::info!(instance = %id, ?pid, "instance removed");
        Ok(())
    }

    /// Cached state; only a `started` instance is probed live.
    pub async fn details(&self, id: &InstanceId) -> Result<InstanceDetails, DriverError> {
        let key = ProcessKey::Instance(id.clone());
        let tracked = self
            .ctx
            .tracker
            .get(&key)
            .ok_or_else(|| DriverError::NotTracked(key.clone()))?;
        if tracked.state != ObservedState::Started {
            return Ok(InstanceDetails {
                state: tracked.state,
                info: None,
            });
        }
        let cport = self.ctx.instance_control_port(id)?;
        let info = match self.ctx.control.info(cport, None).await {
            Ok(info) => Some(info),
            Err(e) => {
                tracing::debug!(instance = %id, error = %e, "info probe failed");
                None
            }
        };
        Ok(InstanceDetails {
            state: tracked.state,
            info,
        })
    }

    pub async fn settings(&self, id: &InstanceId) -> Result<LauncherSettings, DriverError> {
        let settings = InstanceSettings::load(self.ctx.repo.as_ref(), id).await?;
        let mut env = BTreeMap::new();
        env.insert(
            "NODE_PATH".to_string(),
            self.ctx
                .config
                .home
                .join("app")
                .join("node_modules")
                .display()
                .to_string(),
        );
        Ok(LauncherSettings {
            instance_id: id.clone(),
            root_dir: self.ctx.config.projects_root(),
            user_dir: id.0.clone(),
            port: settings.port,
            env,
        })
    }

    pub async fn list(&self) -> Result<Vec<InstanceSummary>, DriverError> {
        Ok(self.ctx.repo.list_instances().await?)
    }

    async fn set_desired(&self, id: &InstanceId, state: DesiredState) -> Result<(), DriverError> {
        if let Some(mut record) = self.ctx.repo.get_instance(id).await?
            && record.state != state
        {
            record.state = state;
            self.ctx.repo.save_instance(&record).await?;
        }
        Ok(())
    }

    pub async fn start(&self, id: &InstanceId) -> Result<(), DriverError> {
        let cport = self.ctx.instance_control_port(id)?;
        self.ctx.control.command(cport, &LifecycleCommand::Start).await?;
        self.ctx
            .tracker
            .set_state(&ProcessKey::Instance(id.clone()), ObservedState::Starting);
        self.set_desired(id, DesiredState::Running).await
    }

    /// Suspends the instance. Reconciliation leaves it alone afterwards.
    pub async fn stop(&self, id: &InstanceId) -> Result<(), DriverError> {
        let cport = self.ctx.instance_control_port(id)?;
        self.ctx.control.command(cport, &LifecycleCommand::Stop).await?;
        self.ctx
            .tracker
            .set_state(&ProcessKey::Instance(id.clone()), ObservedState::Suspended);
        self.set_desired(id, DesiredState::Suspended).await
    }

    pub async fn restart(&self, id: &InstanceId) -> Result<(), DriverError> {
        let cport = self.ctx.instance_control_port(id)?;
        self.ctx.control.command(cport, &LifecycleCommand::Restart).await?;
        self.ctx
            .tracker
            .set_state(&ProcessKey::Instance(id.clone()), ObservedState::Starting);
        self.set_desired(id, DesiredState::Running).await
    }

    pub async fn logout(&self, id: &InstanceId, token: &str) -> Result<(), DriverError> {
        let cport = self.ctx.instance_control_port(id)?;
        let cmd = LifecycleCommand::Logout {
            token: token.to_string(),
        };
        self.ctx.control.command(cport, &cmd).await?;
        Ok(())
    }

    pub async fn logs(&self, id: &InstanceId) -> Result<Value, DriverError> {
        let cport = self.ctx.instance_control_port(id)?;
        Ok(self.ctx.control.logs(cport).await?)
    }

    pub async fn resources(&self, id: &InstanceId) -> Result<Value, DriverError> {
        let cport = self.ctx.instance_control_port(id)?;
        Ok(self.ctx.control.resources(cport).await?)
    }

    /// Relays the live resource stream into `sink` until either side closes.
    pub async fn resources_stream(
        &self,
        id: &InstanceId,
        sink: mpsc::Sender<StreamMessage>,
    ) -> Result<JoinHandle<RelayEnd>, DriverError> {
        let cport = self.ctx.instance_control_port(id)?;
        Ok(relay::resources_stream(&self.ctx.control, cport, sink).await?)
    }

    pub async fn list_files(&self, id: &InstanceId, path: &str) -> Result<Value, DriverError> {
        let cport = self.ctx.instance_control_port(id)?;
        Ok(self.ctx.control.list_files(cport, path).await?)
    }

    pub async fn create_file(
        &self,
        id: &InstanceId,
        path: &str,
        contents: Vec<u8>,
    ) -> Result<Value, DriverError> {
        let cport = self.ctx.instance_control_port(id)?;
        Ok(self.ctx.control.create_file(cport, path, contents).await?)
    }

    pub async fn update_file(
        &self,
        id: &InstanceId,
        path: &str,
        update: &Value,
    ) -> Result<Value, DriverError> {
        let cport = self.ctx.instance_control_port(id)?;
        Ok(self.ctx.control.update_file(cport, path, update).await?)
    }

    pub async fn delete_file(&self, id: &InstanceId, path: &str) -> Result<(), DriverError> {
        let cport = self.ctx.instance_control_port(id)?;
        Ok(self.ctx.control.delete_file(cport, path).await?)
    }

    pub async fn create_directory(
        &self,
        id: &InstanceId,
        path: &str,
        name: &str,
    ) -> Result<Value, DriverError> {
        let cport = self.ctx.instance_control_port(id)?;
        Ok(self.ctx.control.create_directory(cport, path, name).await?)
    }

    pub async fn upload_directory(
        &self,
        id: &InstanceId,
        path: &str,
        entries: Vec<UploadEntry>,
    ) -> Result<usize, DriverError> {
        let cport = self.ctx.instance_control_port(id)?;
        Ok(self.ctx.control.upload_directory(cport, path, entries).await?)
    }
}
