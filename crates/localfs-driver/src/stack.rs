use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::OnceLock,
};

use regex::Regex;
use serde::{Deserialize, Serialize};

const NODERED_PATTERN: &str =
    r"^(0|[1-9]\d*)(\.(0|[1-9]\d*|x|\*)(\.(0|[1-9]\d*|x|\*))?)?$";
const MEMORY_PATTERN: &str = r"^[1-9]\d*$";

/// Properties a stack may set for this driver.
///
/// `memory` is informational; the launcher reads it through its own settings
/// endpoint. `nodered` selects the installed runtime under the stacks dir.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodered: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PropertySchema {
    pub label: &'static str,
    pub validate: &'static str,
    #[serde(rename = "invalidMessage")]
    pub invalid_message: &'static str,
}

#[derive(Debug, Clone, Serialize)]
pub struct StackSchema {
    pub properties: BTreeMap<&'static str, PropertySchema>,
}

pub fn stack_schema() -> StackSchema {
    let mut properties = BTreeMap::new();
    properties.insert(
        "nodered",
        PropertySchema {
            label: "Node-RED Version",
            validate: NODERED_PATTERN,
            invalid_message: "Invalid version number - expected x.y.z",
        },
    );
    properties.insert(
        "memory",
        PropertySchema {
            label: "Memory (MB)",
            validate: MEMORY_PATTERN,
            invalid_message: "Invalid value - must be a number",
        },
    );
    StackSchema { properties }
}

fn nodered_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(NODERED_PATTERN).expect("nodered pattern compiles"))
}

fn memory_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(MEMORY_PATTERN).expect("memory pattern compiles"))
}

impl StackProperties {
    /// Field name -> message for every property that fails the schema.
    pub fn validate(&self) -> Result<(), BTreeMap<String, String>> {
        let mut errors = BTreeMap::new();
        if let Some(v) = &self.nodered
            && !nodered_re().is_match(v)
        {
            errors.insert(
                "nodered".to_string(),
                "Invalid version number - expected x.y.z".to_string(),
            );
        }
        if let Some(v) = &self.memory
            && !memory_re().is_match(v)
        {
            errors.insert(
                "memory".to_string(),
                "Invalid value - must be a number".to_string(),
            );
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Where the runtime for `version` is expected to be installed.
pub fn stack_path(stacks_dir: &Path, version: &str) -> PathBuf {
    stacks_dir.join(version)
}

/// Installed stacks, i.e. subdirectories whose name is a semantic version.
pub async fn installed_stacks(stacks_dir: &Path) -> anyhow::Result<Vec<semver::Version>> {
    let mut out = Vec::new();
    let mut rd = match tokio::fs::read_dir(stacks_dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    while let Some(entry) = rd.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if let Ok(v) = semver::Version::parse(name) {
            out.push(v);
        }
    }
    out.sort();
    Ok(out)
}
