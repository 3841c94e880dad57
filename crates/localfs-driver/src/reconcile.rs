use std::sync::Arc;

use futures_util::future::join_all;
use localfs_process::{AgentId, DesiredState, InstanceId, ObservedState, ProcessKey};
use tokio::task::JoinHandle;

use crate::{
    broker,
    driver::DriverContext,
    layout,
    repository::{AgentRecord, InstanceSettings, InstanceSummary},
    supervisor::control_port,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Suspended,
    NotRunning,
    NoPort,
    /// Another task is already deciding for this id.
    InFlight,
}

/// What one pass decided for one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Skipped { reason: SkipReason },
    Healthy,
    IdentityMismatch { reported: String },
    Respawned { pid: u32 },
    Failed { error: String },
}

#[derive(Debug, Clone, Default)]
pub struct PassReport {
    pub outcomes: Vec<(ProcessKey, ReconcileOutcome)>,
}

impl PassReport {
    pub fn get(&self, key: &ProcessKey) -> Option<&ReconcileOutcome> {
        self.outcomes.iter().find(|(k, _)| k == key).map(|(_, o)| o)
    }

    pub fn respawned(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| matches!(o, ReconcileOutcome::Respawned { .. }))
            .count()
    }
}

fn skipped(reason: SkipReason) -> ReconcileOutcome {
    ReconcileOutcome::Skipped { reason }
}

fn failed(err: impl std::fmt::Display) -> ReconcileOutcome {
    ReconcileOutcome::Failed {
        error: err.to_string(),
    }
}

/// Periodically audits every known instance and broker agent against a live
/// probe and respawns whatever does not answer.
#[derive(Clone)]
pub struct Reconciler {
    ctx: Arc<DriverContext>,
}

impl Reconciler {
    pub fn new(ctx: Arc<DriverContext>) -> Self {
        Self { ctx }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            tokio::time::sleep(self.ctx.config.reconcile_delay).await;
            loop {
                let report = self.run_pass().await;
                tracing::debug!(
                    checked = report.outcomes.len(),
                    respawned = report.respawned(),
                    "reconcile pass done"
                );
                tokio::time::sleep(self.ctx.config.reconcile_interval).await;
            }
        })
    }

    pub async fn run_pass(&self) -> PassReport {
        let instances = match self.ctx.repo.list_instances().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "reconcile: list instances failed");
                Vec::new()
            }
        };
        let agents = match self.ctx.repo.list_broker_agents().await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "reconcile: list broker agents failed");
                Vec::new()
            }
        };

        let instance_checks = instances.into_iter().map(|s| {
            let key = ProcessKey::Instance(s.id.clone());
            async move { (key, self.check_instance(s).await) }
        });
        let agent_checks = agents.into_iter().map(|a| {
            let key = ProcessKey::Agent(a.id.clone());
            async move { (key, self.check_agent(a).await) }
        });

        let (mut outcomes, agent_outcomes) =
            futures_util::join!(join_all(instance_checks), join_all(agent_checks));
        outcomes.extend(agent_outcomes);
        PassReport { outcomes }
    }

    async fn check_instance(&self, summary: InstanceSummary) -> ReconcileOutcome {
        let ctx = &self.ctx;
        let id = summary.id;
        let key = ProcessKey::Instance(id.clone());
        let Some(_lease) = ctx.tracker.try_lease(&key) else {
            return skipped(SkipReason::InFlight);
        };

        if ctx.tracker.state(&key) == Some(ObservedState::Suspended) {
            return skipped(SkipReason::Suspended);
        }
        if summary.state == DesiredState::Suspended {
            ctx.tracker.set_state(&key, ObservedState::Suspended);
            return skipped(SkipReason::Suspended);
        }

        let settings = match InstanceSettings::load(ctx.repo.as_ref(), &id).await {
            Ok(s) => s,
            Err(e) => return failed(e),
        };
        let Some(port) = settings.port else {
            return skipped(SkipReason::NoPort);
        };
        ctx.tracker.seed(key.clone(), Some(port));
        ctx.instance_ports().claim(port);

        let dir = match settings.path {
            Some(path) => match tokio::fs::create_dir_all(&path).await {
                Ok(()) => path,
                Err(e) => return failed(e),
            },
            None => match layout::ensure_instance_dir(&ctx.config.projects_root(), id.as_str()).await {
                Ok(dir) => dir,
                Err(e) => return failed(e),
            },
        };
        let Some(cport) = control_port(port) else {
            return skipped(SkipReason::NoPort);
        };

        match ctx.control.info(cport, Some(ctx.config.probe_timeout)).await {
            Ok(info) if info.id == id.as_str() => {
                ctx.tracker.set_state(&key, ObservedState::Started);
                ReconcileOutcome::Healthy
            }
            Ok(info) => {
                tracing::warn!(
                    instance = %id,
                    port,
                    reported = %info.id,
                    "control port answers for a different instance"
                );
                ReconcileOutcome::IdentityMismatch { reported: info.id }
            }
            Err(e) => {
                tracing::info!(
                    instance = %id,
                    port,
                    timeout = e.is_timeout(),
                    error = %e,
                    "instance not responding; respawning"
                );
                self.respawn_instance(&id, &key, port, dir).await
            }
        }
    }

    async fn respawn_instance(
        &self,
        id: &InstanceId,
        key: &ProcessKey,
        port: u16,
        dir: std::path::PathBuf,
    ) -> ReconcileOutcome {
        let ctx = &self.ctx;
        let record = match ctx.repo.get_instance(id).await {
            Ok(Some(r)) => r,
            Ok(None) => return failed(format!("instance {id} vanished from the repository")),
            Err(e) => return failed(e),
        };
        let pid = match ctx
            .supervisor
            .spawn_instance(
                &ctx.config,
                ctx.repo.as_ref(),
                &record,
                &dir,
                port,
                &Default::default(),
            )
            .await
        {
            Ok(pid) => pid,
            Err(e) => {
                ctx.note_error(&e);
                tracing::warn!(instance = %id, error = %e, "respawn failed");
                return failed(e);
            }
        };
        let settings = InstanceSettings {
            port: Some(port),
            path: Some(dir.clone()),
            pid: Some(pid),
        };
        if let Err(e) = settings.store(ctx.repo.as_ref(), id).await {
            tracing::warn!(instance = %id, error = %e, "persisting respawned pid failed");
        }
        ctx.tracker.record_spawn(key, pid, port, Some(dir));
        ReconcileOutcome::Respawned { pid }
    }

    async fn check_agent(&self, mut record: AgentRecord) -> ReconcileOutcome {
        let ctx = &self.ctx;
        let id: AgentId = record.id.clone();
        let key = ProcessKey::Agent(id.clone());
        let Some(_lease) = ctx.tracker.try_lease(&key) else {
            return skipped(SkipReason::InFlight);
        };
        ctx.tracker.seed(key.clone(), record.port);
        if !record.running {
            return skipped(SkipReason::NotRunning);
        }

        if let Some(port) = record.port {
            ctx.agent_ports().claim(port);
            match ctx.control.agent_health(port, Some(ctx.config.probe_timeout)).await {
                Ok(health) => {
                    let reported = health.get("id").and_then(|v| v.as_str());
                    return match reported {
                        Some(r) if r != id.as_str() => {
                            tracing::warn!(agent = %id, port, reported = %r, "agent port answers for a different agent");
                            ReconcileOutcome::IdentityMismatch {
                                reported: r.to_string(),
                            }
                        }
                        _ => {
                            ctx.tracker.set_state(&key, ObservedState::Started);
                            ReconcileOutcome::Healthy
                        }
                    };
                }
                Err(e) => {
                    tracing::info!(agent = %id, port, error = %e, "broker agent not responding; respawning");
                }
            }
        }

        match broker::spawn_agent(ctx, &mut record).await {
            Ok(pid) => ReconcileOutcome::Respawned { pid },
            Err(e) => {
                tracing::warn!(agent = %id, error = %e, "agent respawn failed");
                failed(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::driver::{
        LocalDriver,
        tests::{repo_with_instance, test_config},
    };
    use crate::repository::{JsonRepository, Repository};
    use crate::test_support::{FakeEndpoint, SilentEndpoint};

    #[tokio::test]
    async fn matching_info_marks_started() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = FakeEndpoint::start("a").await;
        let repo = repo_with_instance("a", fake.port()).await;
        let (driver, _) = LocalDriver::init(test_config(tmp.path()), repo).await.unwrap();
        let key = ProcessKey::Instance(InstanceId::from("a"));
        assert_eq!(driver.observed_state(&key), Some(ObservedState::Unknown));

        let report = driver.reconcile_now().await;
        assert_eq!(report.get(&key), Some(&ReconcileOutcome::Healthy));
        assert_eq!(driver.observed_state(&key), Some(ObservedState::Started));
        assert!(tmp.path().join("var/projects/a/package.json").exists());
        driver.shutdown();
    }

    #[tokio::test]
    async fn suspended_instances_are_never_queried_or_spawned() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = FakeEndpoint::start("a").await;
        let repo = repo_with_instance("a", fake.port()).await;
        let (driver, _) = LocalDriver::init(test_config(tmp.path()), repo).await.unwrap();
        let id = InstanceId::from("a");
        let key = ProcessKey::Instance(id.clone());

        driver.reconcile_now().await;
        assert_eq!(driver.observed_state(&key), Some(ObservedState::Started));
        driver.stop(&id).await.unwrap();
        let hits = fake.info_hits();

        let report = driver.reconcile_now().await;
        assert_eq!(
            report.get(&key),
            Some(&ReconcileOutcome::Skipped {
                reason: SkipReason::Suspended
            })
        );
        assert_eq!(fake.info_hits(), hits);
        assert_eq!(report.respawned(), 0);
        assert_eq!(driver.observed_state(&key), Some(ObservedState::Suspended));
        driver.shutdown();
    }

    #[tokio::test]
    async fn desired_suspended_is_skipped_without_a_query() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = FakeEndpoint::start("a").await;
        let repo = repo_with_instance("a", fake.port()).await;
        let mut rec = repo
            .get_instance(&InstanceId::from("a"))
            .await
            .unwrap()
            .unwrap();
        rec.state = DesiredState::Suspended;
        repo.save_instance(&rec).await.unwrap();
        let (driver, _) = LocalDriver::init(test_config(tmp.path()), repo).await.unwrap();

        let report = driver.reconcile_now().await;
        let key = ProcessKey::Instance(InstanceId::from("a"));
        assert!(matches!(report.get(&key), Some(ReconcileOutcome::Skipped { .. })));
        assert_eq!(fake.info_hits(), 0);
        assert_eq!(driver.observed_state(&key), Some(ObservedState::Suspended));
        driver.shutdown();
    }

    #[tokio::test]
    async fn identity_mismatch_is_only_logged() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = FakeEndpoint::start("someone-else").await;
        let repo = repo_with_instance("a", fake.port()).await;
        let (driver, _) = LocalDriver::init(test_config(tmp.path()), repo).await.unwrap();
        let key = ProcessKey::Instance(InstanceId::from("a"));

        let report = driver.reconcile_now().await;
        assert_eq!(
            report.get(&key),
            Some(&ReconcileOutcome::IdentityMismatch {
                reported: "someone-else".into()
            })
        );
        assert_eq!(driver.observed_state(&key), Some(ObservedState::Unknown));
        assert!(!driver.ctx.supervisor.has_handles(&key));
        driver.shutdown();
    }

    #[tokio::test]
    async fn held_lease_skips_the_id() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = FakeEndpoint::start("a").await;
        let repo = repo_with_instance("a", fake.port()).await;
        let (driver, _) = LocalDriver::init(test_config(tmp.path()), repo).await.unwrap();
        let key = ProcessKey::Instance(InstanceId::from("a"));

        let lease = driver.ctx.tracker.try_lease(&key).unwrap();
        let report = driver.reconcile_now().await;
        assert_eq!(
            report.get(&key),
            Some(&ReconcileOutcome::Skipped {
                reason: SkipReason::InFlight
            })
        );
        drop(lease);
        let report = driver.reconcile_now().await;
        assert_eq!(report.get(&key), Some(&ReconcileOutcome::Healthy));
        driver.shutdown();
    }

    #[tokio::test]
    async fn stopped_agents_are_left_alone() {
        let tmp = tempfile::tempdir().unwrap();
        let fake = FakeEndpoint::start("ag").await;
        let repo = Arc::new(JsonRepository::in_memory());
        repo.save_agent(&AgentRecord {
            id: AgentId::from("ag"),
            team_id: "t".into(),
            token: "tok".into(),
            port: Some(fake.port()),
            pid: None,
            running: false,
        })
        .await
        .unwrap();
        let (driver, _) = LocalDriver::init(test_config(tmp.path()), repo.clone())
            .await
            .unwrap();
        let key = ProcessKey::Agent(AgentId::from("ag"));

        let report = driver.reconcile_now().await;
        assert_eq!(
            report.get(&key),
            Some(&ReconcileOutcome::Skipped {
                reason: SkipReason::NotRunning
            })
        );
        assert_eq!(fake.info_hits(), 0);

        let mut rec = repo.get_agent(&AgentId::from("ag")).await.unwrap().unwrap();
        rec.running = true;
        repo.save_agent(&rec).await.unwrap();
        let report = driver.reconcile_now().await;
        assert_eq!(report.get(&key), Some(&ReconcileOutcome::Healthy));
        assert_eq!(driver.observed_state(&key), Some(ObservedState::Started));

        fake.set_id("other");
        let report = driver.reconcile_now().await;
        assert!(matches!(
            report.get(&key),
            Some(ReconcileOutcome::IdentityMismatch { .. })
        ));
        driver.shutdown();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_instance_is_respawned_with_a_new_pid() {
        let tmp = tempfile::tempdir().unwrap();
        crate::test_support::install_fake_launcher(tmp.path(), crate::config::INSTANCE_LAUNCHER);
        let repo = Arc::new(JsonRepository::in_memory());
        repo.insert_instance(crate::driver::tests::record("a"))
            .await
            .unwrap();
        let mut cfg = test_config(tmp.path());
        cfg.start_port = FakeEndpoint::unused_instance_port();
        let (driver, _) = LocalDriver::init(cfg, repo.clone()).await.unwrap();
        let id = InstanceId::from("a");
        let key = ProcessKey::Instance(id.clone());

        driver
            .create(&id, crate::driver::CreateOptions::default())
            .await
            .unwrap();
        let before = driver.ctx.tracker.get(&key).unwrap();
        let port = before.port.unwrap();
        let _silent = SilentEndpoint::start_on(port + 1000).await;

        let report = driver.reconcile_now().await;
        let Some(ReconcileOutcome::Respawned { pid }) = report.get(&key).cloned() else {
            panic!("expected a respawn, got {:?}", report.get(&key));
        };
        assert_ne!(Some(pid), before.pid);
        let after = driver.ctx.tracker.get(&key).unwrap();
        assert_eq!(after.state, ObservedState::Started);
        assert_eq!(after.pid, Some(pid));
        assert_eq!(after.port, Some(port));
        let settings = InstanceSettings::load(repo.as_ref(), &id).await.unwrap();
        assert_eq!(settings.pid, Some(pid));

        if let Some(old) = before.pid {
            driver.ctx.supervisor.stop(&key, Some(old)).await;
        }
        driver.remove(&id).await.unwrap();
        driver.shutdown();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn down_agent_is_respawned_on_its_port() {
        let tmp = tempfile::tempdir().unwrap();
        crate::test_support::install_fake_launcher(tmp.path(), crate::config::AGENT_LAUNCHER);
        let port = FakeEndpoint::unused_port();
        let repo = Arc::new(JsonRepository::in_memory());
        repo.save_agent(&AgentRecord {
            id: AgentId::from("ag"),
            team_id: "t".into(),
            token: "tok".into(),
            port: Some(port),
            pid: None,
            running: true,
        })
        .await
        .unwrap();
        let (driver, _) = LocalDriver::init(test_config(tmp.path()), repo.clone())
            .await
            .unwrap();
        let id = AgentId::from("ag");
        let key = ProcessKey::Agent(id.clone());

        let report = driver.reconcile_now().await;
        let Some(ReconcileOutcome::Respawned { pid }) = report.get(&key).cloned() else {
            panic!("expected a respawn, got {:?}", report.get(&key));
        };
        let tracked = driver.ctx.tracker.get(&key).unwrap();
        assert_eq!(tracked.state, ObservedState::Started);
        assert_eq!(tracked.pid, Some(pid));
        assert_eq!(tracked.port, Some(port));
        let stored = repo.get_agent(&id).await.unwrap().unwrap();
        assert_eq!(stored.port, Some(port));
        assert_eq!(stored.pid, Some(pid));
        assert!(driver.ctx.supervisor.has_handles(&key));
        assert!(driver.ctx.instance_ports().is_empty());

        driver.remove_agent(&id).await.unwrap();
        driver.shutdown();
    }

    #[tokio::test]
    async fn missing_launcher_during_respawn_raises_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let control = FakeEndpoint::unused_instance_port() + 1000;
        let repo = repo_with_instance("a", control).await;
        let (driver, _) = LocalDriver::init(test_config(tmp.path()), repo).await.unwrap();
        let fatal = driver.fatal();

        let report = driver.reconcile_now().await;
        let key = ProcessKey::Instance(InstanceId::from("a"));
        assert!(matches!(report.get(&key), Some(ReconcileOutcome::Failed { .. })));
        assert!(fatal.borrow().is_some());
        driver.shutdown();
    }
}
