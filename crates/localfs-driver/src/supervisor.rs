use std::{
    collections::{BTreeMap, HashMap},
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::Context;
use localfs_process::{InstanceId, ProcessKey};
use tokio::process::Command;

use crate::{
    config::{DriverConfig, INSTANCE_LAUNCHER},
    error::DriverError,
    layout,
    repository::{AuthTokens, InstanceRecord, Repository, StackRecord},
    stack,
};

/// Offset between an instance's public port and its control endpoint.
pub const CONTROL_PORT_OFFSET: u16 = 1000;

pub fn control_port(port: u16) -> Option<u16> {
    port.checked_add(CONTROL_PORT_OFFSET)
}

/// Everything needed to launch one detached child.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub key: ProcessKey,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: PathBuf,
    pub log_path: PathBuf,
}

#[derive(Debug)]
struct LogHandles {
    _out: std::fs::File,
    _err: std::fs::File,
}

/// Spawns and signals supervised children and owns their log descriptors.
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    handles: Arc<Mutex<HashMap<ProcessKey, LogHandles>>>,
}

/// First `<dir>/<rel>` that exists, in search order.
pub async fn resolve_launcher(search_dirs: &[PathBuf], rel: &str) -> Result<PathBuf, DriverError> {
    for dir in search_dirs {
        let candidate = dir.join(rel);
        if tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return Ok(candidate);
        }
    }
    Err(DriverError::LauncherNotFound {
        rel: rel.to_string(),
        searched: search_dirs.to_vec(),
    })
}

/// Host `PATH` with the optional extra directory appended.
pub fn extended_path(host: Option<OsString>, extra: Option<&Path>) -> String {
    let mut parts: Vec<PathBuf> = host
        .as_deref()
        .map(|p| std::env::split_paths(p).collect())
        .unwrap_or_default();
    if let Some(extra) = extra {
        parts.push(extra.to_path_buf());
    }
    std::env::join_paths(parts)
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Environment for an instance launcher. `extra` is applied first so the
/// driver-owned variables always win.
pub fn instance_env(
    cfg: &DriverConfig,
    record: &InstanceRecord,
    tokens: &AuthTokens,
    stack: Option<&StackRecord>,
    extra: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = extra.clone();

    env.insert("FORGE_CLIENT_ID".into(), tokens.client_id.clone());
    env.insert("FORGE_CLIENT_SECRET".into(), tokens.client_secret.clone());
    env.insert("FORGE_URL".into(), cfg.base_url.clone());
    env.insert("FORGE_TEAM_ID".into(), record.team_id.clone());
    env.insert("FORGE_PROJECT_ID".into(), record.id.0.clone());
    env.insert("FORGE_PROJECT_TOKEN".into(), tokens.token.clone());
    if !record.credential_secret.is_empty() {
        env.insert("FORGE_NR_SECRET".into(), record.credential_secret.clone());
    }
    if let Some(broker) = &tokens.broker {
        env.insert("FORGE_BROKER_URL".into(), broker.url.clone());
        env.insert("FORGE_BROKER_USERNAME".into(), broker.username.clone());
        env.insert("FORGE_BROKER_PASSWORD".into(), broker.password.clone());
    }
    if let Some(tier) = &cfg.license_type {
        env.insert("FORGE_LICENSE_TYPE".into(), tier.clone());
    }
    if let Some(ca) = &cfg.extra_ca_certs {
        env.insert("NODE_EXTRA_CA_CERTS".into(), ca.display().to_string());
    }
    if let Some(version) = stack.and_then(|s| s.properties.nodered.as_deref()) {
        env.insert(
            "FORGE_NR_PATH".into(),
            stack::stack_path(&cfg.stacks_dir(), version)
                .display()
                .to_string(),
        );
    }
    env.insert(
        "PATH".into(),
        extended_path(std::env::var_os("PATH"), cfg.node_path.as_deref()),
    );
    env
}

pub fn instance_args(launcher: &Path, port: u16, base_url: &str, id: &InstanceId) -> Vec<String> {
    let control = control_port(port).unwrap_or(port);
    vec![
        launcher.display().to_string(),
        "-p".to_string(),
        control.to_string(),
        "--forgeURL".to_string(),
        base_url.to_string(),
        "--project".to_string(),
        id.0.clone(),
    ]
}

async fn open_append(path: &Path) -> std::io::Result<std::fs::File> {
    let f = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    Ok(f.into_std().await)
}

#[cfg(unix)]
async fn signal_terminate(pid: u32) {
    let Some(pid) = i32::try_from(pid).ok().filter(|p| *p > 0) else {
        return;
    };
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == -1 {
        let e = std::io::Error::last_os_error();
        tracing::debug!(pid, error = %e, "terminate signal not delivered");
    }
}

#[cfg(windows)]
async fn signal_terminate(pid: u32) {
    let pid = pid.to_string();
    if let Err(e) = crate::exec::run("taskkill", ["/pid", pid.as_str(), "/T", "/F"]).await {
        tracing::debug!(pid = %pid, error = %e, "taskkill failed");
    }
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> MutexGuard<'_, HashMap<ProcessKey, LogHandles>> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Starts the child detached and returns its pid without waiting for it
    /// to become healthy.
    pub async fn launch(&self, spec: LaunchSpec) -> anyhow::Result<u32> {
        let out = open_append(&spec.log_path)
            .await
            .with_context(|| format!("open log {}", spec.log_path.display()))?;
        let err = open_append(&spec.log_path)
            .await
            .with_context(|| format!("open log {}", spec.log_path.display()))?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env_clear()
            .envs(&spec.env)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out.try_clone().context("dup stdout log")?))
            .stderr(Stdio::from(err.try_clone().context("dup stderr log")?));

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so the child outlives the driver.
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }
        #[cfg(windows)]
        {
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP | CREATE_NO_WINDOW);
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("spawn {} (cwd {})", spec.program.display(), spec.cwd.display()))?;
        let pid = child
            .id()
            .ok_or_else(|| anyhow::anyhow!("child for {} exited before reporting a pid", spec.key))?;
        drop(child);

        // Replacing an old record closes the descriptors from a previous run.
        self.handles().insert(spec.key.clone(), LogHandles { _out: out, _err: err });
        tracing::debug!(key = %spec.key, pid, log = %spec.log_path.display(), "launched");
        Ok(pid)
    }

    /// Sends a termination signal (if a pid is known) and closes the log
    /// descriptors. A process that is already gone is not an error.
    /// Returns whether descriptors were registered.
    pub async fn stop(&self, key: &ProcessKey, pid: Option<u32>) -> bool {
        if let Some(pid) = pid {
            signal_terminate(pid).await;
        }
        self.close_handles(key)
    }

    pub fn close_handles(&self, key: &ProcessKey) -> bool {
        self.handles().remove(key).is_some()
    }

    pub fn has_handles(&self, key: &ProcessKey) -> bool {
        self.handles().contains_key(key)
    }

    /// Spawns the launcher for one instance. Credentials are refreshed on
    /// every call.
    pub async fn spawn_instance(
        &self,
        cfg: &DriverConfig,
        repo: &dyn Repository,
        record: &InstanceRecord,
        dir: &Path,
        port: u16,
        extra_env: &BTreeMap<String, String>,
    ) -> Result<u32, DriverError> {
        let tokens = repo
            .refresh_auth_tokens(&record.id)
            .await
            .context("refresh auth tokens")?;
        let stack = match &record.stack {
            Some(s) => repo.get_stack(s).await.context("load stack")?,
            None => None,
        };
        if let Some(s) = &stack {
            tracing::debug!(instance = %record.id, stack = %s.name.0, properties = ?s.properties, "stack info");
            if let Err(fields) = s.properties.validate() {
                return Err(anyhow::anyhow!(
                    "stack {} has invalid properties: {fields:?}",
                    s.name.0
                )
                .into());
            }
        }

        let launcher = resolve_launcher(&cfg.module_paths, INSTANCE_LAUNCHER).await?;
        let spec = LaunchSpec {
            key: ProcessKey::Instance(record.id.clone()),
            program: cfg.node_bin.clone(),
            args: instance_args(&launcher, port, &cfg.base_url, &record.id),
            env: instance_env(cfg, record, &tokens, stack.as_ref(), extra_env),
            cwd: dir.to_path_buf(),
            log_path: layout::log_path(dir),
        };
        let pid = self.launch(spec).await?;
        tracing::info!(instance = %record.id, pid, port, dir = %dir.display(), "instance launched");
        Ok(pid)
    }
}
