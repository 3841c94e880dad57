use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};

pub const INSTANCE_LAUNCHER: &str = "@flowforge/nr-launcher/index.js";
pub const AGENT_LAUNCHER: &str = "@flowfuse/mqtt-schema-agent/index.js";

const DEFAULT_START_PORT: u16 = 7880;
const DEFAULT_AGENT_START_PORT: u16 = 10880;

/// Source of configuration variables; the process environment in production.
type Lookup<'a> = &'a dyn Fn(&str) -> Option<OsString>;

fn var_string(get: Lookup<'_>, name: &str) -> Option<String> {
    get(name)
        .and_then(|v| v.into_string().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn var_u64(get: Lookup<'_>, name: &str) -> Option<u64> {
    var_string(get, name).and_then(|v| v.parse::<u64>().ok())
}

fn var_u16(get: Lookup<'_>, name: &str) -> Option<u16> {
    var_string(get, name).and_then(|v| v.parse::<u16>().ok())
}

fn var_ms(get: Lookup<'_>, name: &str, default: u64, min: u64, max: u64) -> Duration {
    Duration::from_millis(var_u64(get, name).map(|v| v.clamp(min, max)).unwrap_or(default))
}

#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub home: PathBuf,
    pub base_url: String,
    pub start_port: u16,
    pub agent_start_port: u16,
    pub node_path: Option<PathBuf>,
    pub extra_ca_certs: Option<PathBuf>,
    pub license_type: Option<String>,
    pub node_bin: PathBuf,
    pub module_paths: Vec<PathBuf>,
    pub reconcile_delay: Duration,
    pub reconcile_interval: Duration,
    pub probe_timeout: Duration,
    pub remove_delay: Duration,
}

impl DriverConfig {
    /// Defaults rooted at `home`, ignoring the environment.
    pub fn with_home(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let module_paths = default_module_paths(&home);
        Self {
            home,
            base_url: "http://localhost:3000".to_string(),
            start_port: DEFAULT_START_PORT,
            agent_start_port: DEFAULT_AGENT_START_PORT,
            node_path: None,
            extra_ca_certs: None,
            license_type: None,
            node_bin: PathBuf::from("node"),
            module_paths,
            reconcile_delay: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(1),
            remove_delay: Duration::from_secs(5),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(&|name: &str| std::env::var_os(name))
    }

    fn from_lookup(get: Lookup<'_>) -> Self {
        let home = var_string(get, "LOCALFS_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        let mut cfg = Self::with_home(home);

        if let Some(v) = var_string(get, "LOCALFS_BASE_URL") {
            cfg.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = var_u16(get, "LOCALFS_START_PORT").filter(|v| *v >= 1024) {
            cfg.start_port = v;
        }
        if let Some(v) = var_u16(get, "LOCALFS_AGENT_START_PORT").filter(|v| *v >= 1024) {
            cfg.agent_start_port = v;
        }
        cfg.node_path = var_string(get, "LOCALFS_NODE_PATH").map(PathBuf::from);
        cfg.extra_ca_certs = var_string(get, "LOCALFS_EXTRA_CA_CERTS").map(PathBuf::from);
        cfg.license_type = var_string(get, "LOCALFS_LICENSE_TYPE");
        if let Some(v) = var_string(get, "LOCALFS_NODE_BIN") {
            cfg.node_bin = PathBuf::from(v);
        }
        if let Some(raw) = get("LOCALFS_MODULE_PATHS") {
            let paths: Vec<PathBuf> = std::env::split_paths(&raw)
                .filter(|p| !p.as_os_str().is_empty())
                .collect();
            if !paths.is_empty() {
                cfg.module_paths = paths;
            }
        }
        cfg.reconcile_delay = var_ms(get, "LOCALFS_RECONCILE_DELAY_MS", 1000, 0, 60_000);
        cfg.reconcile_interval =
            var_ms(get, "LOCALFS_RECONCILE_INTERVAL_MS", 60_000, 1000, 60 * 60 * 1000);
        cfg.probe_timeout = var_ms(get, "LOCALFS_PROBE_TIMEOUT_MS", 1000, 100, 30_000);
        cfg.remove_delay = var_ms(get, "LOCALFS_REMOVE_DELAY_MS", 5000, 0, 10 * 60 * 1000);
        cfg
    }

    pub fn projects_root(&self) -> PathBuf {
        self.home.join("var").join("projects")
    }

    pub fn stacks_dir(&self) -> PathBuf {
        self.home.join("var").join("stacks")
    }

    pub fn agents_root(&self) -> PathBuf {
        self.home.join("var").join("agents")
    }

    pub fn repository_path(&self) -> PathBuf {
        self.home.join("var").join("localfs.json")
    }
}

/// Candidate module-resolution directories, most specific first.
fn default_module_paths(home: &Path) -> Vec<PathBuf> {
    let mut out = vec![
        home.join("node_modules"),
        home.join("app").join("node_modules"),
    ];
    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors() {
            let candidate = dir.join("node_modules");
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        }
    }
    out
}
