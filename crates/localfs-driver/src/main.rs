use std::sync::Arc;

use localfs_driver::{DriverConfig, JsonRepository, LocalDriver, stack};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = DriverConfig::from_env();
    tracing::info!(
        home = %config.home.display(),
        base_url = %config.base_url,
        start_port = config.start_port,
        agent_start_port = config.agent_start_port,
        "localfs-driver starting"
    );

    let repo = Arc::new(JsonRepository::open(config.repository_path()).await?);
    let (driver, _schema) = LocalDriver::init(config, repo).await?;
    match stack::installed_stacks(&driver.config().stacks_dir()).await {
        Ok(stacks) => {
            let names: Vec<String> = stacks.iter().map(|v| v.to_string()).collect();
            tracing::info!(stacks = ?names, "installed stacks");
        }
        Err(e) => tracing::warn!(error = %e, "listing installed stacks failed"),
    }

    let mut fatal = driver.fatal();
    let reason = tokio::select! {
        _ = tokio::signal::ctrl_c() => None,
        changed = fatal.wait_for(|v| v.is_some()) => changed.ok().and_then(|v| v.clone()),
    };
    driver.shutdown();

    if let Some(reason) = reason {
        anyhow::bail!("driver stopped: {reason}");
    }
    Ok(())
}
