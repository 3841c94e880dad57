use std::fmt;

/// Opaque instance identifier as stored by the platform.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct InstanceId(pub String);

impl InstanceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Identifier of a per-team broker agent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Key for anything the driver supervises. Instances and agents live in
/// separate namespaces so equal raw ids never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ProcessKey {
    Instance(InstanceId),
    Agent(AgentId),
}

impl ProcessKey {
    pub fn raw_id(&self) -> &str {
        match self {
            ProcessKey::Instance(id) => id.as_str(),
            ProcessKey::Agent(id) => id.as_str(),
        }
    }

    pub fn class(&self) -> &'static str {
        match self {
            ProcessKey::Instance(_) => "instance",
            ProcessKey::Agent(_) => "agent",
        }
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class(), self.raw_id())
    }
}

impl From<InstanceId> for ProcessKey {
    fn from(value: InstanceId) -> Self {
        ProcessKey::Instance(value)
    }
}

impl From<AgentId> for ProcessKey {
    fn from(value: AgentId) -> Self {
        ProcessKey::Agent(value)
    }
}

/// Driver-local view of a supervised process. Never persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservedState {
    #[default]
    Unknown,
    Starting,
    Started,
    Suspended,
}

impl ObservedState {
    pub fn as_str(self) -> &'static str {
        match self {
            ObservedState::Unknown => "unknown",
            ObservedState::Starting => "starting",
            ObservedState::Started => "started",
            ObservedState::Suspended => "suspended",
        }
    }
}

/// Repository-recorded intent for an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DesiredState {
    #[default]
    Running,
    Suspended,
}

/// Name of the stack an instance runs on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct StackRef(pub String);
