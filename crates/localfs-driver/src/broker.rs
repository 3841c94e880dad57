use std::{collections::BTreeMap, path::Path};

use localfs_process::{AgentId, ObservedState, ProcessKey};
use serde_json::Value;

use crate::{
    config::{AGENT_LAUNCHER, DriverConfig},
    control::AgentCommand,
    driver::{DriverContext, LocalDriver},
    error::DriverError,
    layout,
    repository::AgentRecord,
    supervisor::{LaunchSpec, extended_path, resolve_launcher},
};

pub fn agent_env(cfg: &DriverConfig, record: &AgentRecord, port: u16) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("FORGE_URL".into(), cfg.base_url.clone());
    env.insert("FORGE_TEAM_ID".into(), record.team_id.clone());
    env.insert("FORGE_TEAM_TOKEN".into(), record.token.clone());
    env.insert("FORGE_PORT".into(), port.to_string());
    if let Some(ca) = &cfg.extra_ca_certs {
        env.insert("NODE_EXTRA_CA_CERTS".into(), ca.display().to_string());
    }
    env.insert(
        "PATH".into(),
        extended_path(std::env::var_os("PATH"), cfg.node_path.as_deref()),
    );
    env
}

pub fn agent_log_path(agents_root: &Path, id: &AgentId) -> std::path::PathBuf {
    agents_root.join(format!("{}.log", id.as_str()))
}

/// Spawns the agent, allocating a port on first start. The record is updated
/// and persisted with the port and pid.
pub(crate) async fn spawn_agent(
    ctx: &DriverContext,
    record: &mut AgentRecord,
) -> Result<u32, DriverError> {
    let (port, fresh) = match record.port {
        Some(port) => {
            ctx.agent_ports().claim(port);
            (port, false)
        }
        None => (ctx.agent_ports().reserve()?, true),
    };

    let result: Result<u32, DriverError> = async {
        let launcher = resolve_launcher(&ctx.config.module_paths, AGENT_LAUNCHER).await?;
        let root = ctx.config.agents_root();
        layout::ensure_root(&root).await?;
        let spec = LaunchSpec {
            key: ProcessKey::Agent(record.id.clone()),
            program: ctx.config.node_bin.clone(),
            args: vec![launcher.display().to_string()],
            env: agent_env(&ctx.config, record, port),
            log_path: agent_log_path(&root, &record.id),
            cwd: root,
        };
        let pid = ctx.supervisor.launch(spec).await?;
        record.port = Some(port);
        record.pid = Some(pid);
        ctx.repo.save_agent(record).await?;
        Ok(pid)
    }
    .await;

    match result {
        Ok(pid) => {
            ctx.tracker
                .record_spawn(&ProcessKey::Agent(record.id.clone()), pid, port, None);
            tracing::info!(agent = %record.id, team = %record.team_id, pid, port, "broker agent launched");
            Ok(pid)
        }
        Err(e) => {
            if fresh {
                ctx.agent_ports().release(port);
            }
            ctx.note_error(&e);
            Err(e)
        }
    }
}

impl LocalDriver {
    async fn agent_record(&self, id: &AgentId) -> Result<AgentRecord, DriverError> {
        self.ctx
            .repo
            .get_agent(id)
            .await?
            .ok_or_else(|| DriverError::UnknownAgent(id.clone()))
    }

    async fn set_agent_running(&self, record: &mut AgentRecord, running: bool) -> Result<(), DriverError> {
        if record.running != running {
            record.running = running;
            self.ctx.repo.save_agent(record).await?;
        }
        Ok(())
    }

    /// Spawns the agent on first start; afterwards asks the running agent to
    /// start, falling back to a spawn when nothing answers on its port.
    pub async fn start_agent(&self, id: &AgentId) -> Result<(), DriverError> {
        let mut record = self.agent_record(id).await?;
        let key = ProcessKey::Agent(id.clone());

        match record.port {
            None => {
                spawn_agent(&self.ctx, &mut record).await?;
            }
            Some(_) => {
                let port = self.ctx.tracked_port(&key)?;
                match self.ctx.control.agent_command(port, AgentCommand::Start).await {
                    Ok(()) => {
                        self.ctx.tracker.set_state(&key, ObservedState::Starting);
                    }
                    Err(e) if e.status().is_none() => {
                        tracing::info!(agent = %id, port, error = %e, "agent not reachable; spawning");
                        spawn_agent(&self.ctx, &mut record).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        self.set_agent_running(&mut record, true).await
    }

    pub async fn stop_agent(&self, id: &AgentId) -> Result<(), DriverError> {
        let key = ProcessKey::Agent(id.clone());
        let port = self.ctx.tracked_port(&key)?;
        self.ctx.control.agent_command(port, AgentCommand::Stop).await?;
        self.ctx.tracker.set_state(&key, ObservedState::Suspended);
        let mut record = self.agent_record(id).await?;
        self.set_agent_running(&mut record, false).await
    }

    pub async fn restart_agent(&self, id: &AgentId) -> Result<(), DriverError> {
        let key = ProcessKey::Agent(id.clone());
        let port = self.ctx.tracked_port(&key)?;
        self.ctx.control.agent_command(port, AgentCommand::Stop).await?;
        self.ctx.control.agent_command(port, AgentCommand::Start).await?;
        self.ctx.tracker.set_state(&key, ObservedState::Starting);
        let mut record = self.agent_record(id).await?;
        self.set_agent_running(&mut record, true).await
    }

    pub async fn agent_status(&self, id: &AgentId) -> Result<Value, DriverError> {
        let port = self.ctx.tracked_port(&ProcessKey::Agent(id.clone()))?;
        Ok(self.ctx.control.agent_status(port).await?)
    }

    /// Terminates the agent and gives its port back to the pool.
    pub async fn remove_agent(&self, id: &AgentId) -> Result<(), DriverError> {
        let key = ProcessKey::Agent(id.clone());
        let mut record = self.agent_record(id).await?;
        let tracked = self.ctx.tracker.get(&key).unwrap_or_default();

        let pid = record.pid.or(tracked.pid);
        self.ctx.supervisor.stop(&key, pid).await;
        if let Some(port) = record.port.or(tracked.port) {
            self.ctx.agent_ports().release(port);
        }
        self.ctx.tracker.remove(&key);

        record.port = None;
        record.pid = None;
        record.running = false;
        self.ctx.repo.save_agent(&record).await?;
        tracing::info!(agent = %id, ?pid, "broker agent removed");
        Ok(())
    }
}
