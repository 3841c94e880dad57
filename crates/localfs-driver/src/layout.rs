use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

pub const PACKAGE_JSON: &str = "package.json";
pub const LOG_FILE: &str = "out.log";

const PACKAGE_DESCRIPTOR: &str = r#"{
    "name": "node-red-project",
    "description": "A Node-RED Project",
    "version": "0.0.1",
    "private": true
}
"#;

pub async fn ensure_root(root: &Path) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(root)
        .await
        .with_context(|| format!("create root dir {}", root.display()))
}

pub fn instance_dir(root: &Path, id: &str) -> PathBuf {
    root.join(id)
}

pub fn log_path(dir: &Path) -> PathBuf {
    dir.join(LOG_FILE)
}

/// Creates the working directory for an instance. Re-running on an existing
/// directory only fills in whatever is missing; it never rewrites the
/// package descriptor.
pub async fn ensure_instance_dir(root: &Path, id: &str) -> anyhow::Result<PathBuf> {
    let dir = instance_dir(root, id);
    let fresh = tokio::fs::metadata(&dir).await.is_err();
    if fresh {
        tracing::info!(dir = %dir.display(), "creating instance dir");
    }

    for sub in ["node_modules", "storage"] {
        tokio::fs::create_dir_all(dir.join(sub))
            .await
            .with_context(|| format!("create {sub} under {}", dir.display()))?;
    }

    let pkg = dir.join(PACKAGE_JSON);
    if tokio::fs::metadata(&pkg).await.is_err() {
        tokio::fs::write(&pkg, PACKAGE_DESCRIPTOR)
            .await
            .with_context(|| format!("write {}", pkg.display()))?;
    }

    Ok(dir)
}

/// Deletes `path` after `delay` on a background task. Failures are logged.
pub fn schedule_removal(path: PathBuf, delay: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        match tokio::fs::remove_dir_all(&path).await {
            Ok(()) => tracing::debug!(dir = %path.display(), "removed instance dir"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(dir = %path.display(), error = %e, "failed to remove instance dir")
            }
        }
    })
}
