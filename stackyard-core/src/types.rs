//! Domain types for provisioned units.
//!
//! All path fields use `PathBuf`; never `&str` or `String` for filesystem paths.
//! All types are serializable/deserializable via serde + serde_yaml.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Identifier of a stack or agent row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(pub Uuid);

impl UnitId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UnitId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl From<Uuid> for UnitId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for UnitId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Registry key of an agent: `<stack_id>__<agent_id>`.
///
/// Hyphenated UUIDs never contain `__`, so distinct (stack, agent) pairs never
/// map to the same key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogicalId(pub String);

impl LogicalId {
    pub const SEPARATOR: &'static str = "__";

    pub fn for_agent(stack_id: UnitId, agent_id: UnitId) -> Self {
        Self(format!("{stack_id}{}{agent_id}", Self::SEPARATOR))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for LogicalId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for LogicalId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Stack,
    Agent,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Stack => write!(f, "stack"),
            UnitKind::Agent => write!(f, "agent"),
        }
    }
}

/// Lifecycle status of a unit.
///
/// `Creating -> Ready | Failed` and `Deleting -> (row removed) | Failed` are
/// the only lifecycle-task transitions; the request boundary moves settled
/// rows into `Creating` or `Deleting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Creating,
    Ready,
    Failed,
    Deleting,
}

impl UnitStatus {
    /// A lifecycle task owns the row while it is in one of these states.
    pub fn is_in_flight(self) -> bool {
        matches!(self, UnitStatus::Creating | UnitStatus::Deleting)
    }

    pub fn is_settled(self) -> bool {
        !self.is_in_flight()
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitStatus::Creating => write!(f, "creating"),
            UnitStatus::Ready => write!(f, "ready"),
            UnitStatus::Failed => write!(f, "failed"),
            UnitStatus::Deleting => write!(f, "deleting"),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// Handles to the side effects a unit owns outside the status store.
///
/// Partially populated while `Creating` or after `Failed`; side effects may
/// outlive a failed unit.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExternalRefs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Stack root or the agent's extracted code directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logical_id: Option<LogicalId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ui_url: Option<String>,
}

/// A stack or agent row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: UnitId,
    pub kind: UnitKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<UnitId>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub status: UnitStatus,
    #[serde(default)]
    pub refs: ExternalRefs,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Unit {
    /// New stack row in `Creating`, namespace already assigned.
    pub fn new_stack(name: impl Into<String>, description: Option<String>) -> Self {
        let id = UnitId::new();
        let now = Utc::now();
        Self {
            id,
            kind: UnitKind::Stack,
            parent_id: None,
            name: name.into(),
            description,
            status: UnitStatus::Creating,
            refs: ExternalRefs {
                namespace: Some(namespace_for(id)),
                ..ExternalRefs::default()
            },
            created_at: now,
            updated_at: now,
        }
    }

    /// New agent row in `Creating` under `stack_id`.
    pub fn new_agent(stack_id: UnitId, name: impl Into<String>, description: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: UnitId::new(),
            kind: UnitKind::Agent,
            parent_id: Some(stack_id),
            name: name.into(),
            description,
            status: UnitStatus::Creating,
            refs: ExternalRefs::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_stack(&self) -> bool {
        self.kind == UnitKind::Stack
    }

    pub fn is_agent(&self) -> bool {
        self.kind == UnitKind::Agent
    }

    /// Set `status` and bump `updated_at`.
    pub fn mark(&mut self, status: UnitStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    /// Whether every external handle a `Ready` unit of this kind must carry is set.
    pub fn refs_complete(&self) -> bool {
        match self.kind {
            UnitKind::Stack => self.refs.namespace.is_some() && self.refs.disk_path.is_some(),
            UnitKind::Agent => {
                self.parent_id.is_some()
                    && self.refs.disk_path.is_some()
                    && self.refs.logical_id.is_some()
                    && self.refs.api_url.is_some()
                    && self.refs.ui_url.is_some()
            }
        }
    }
}

/// Compute namespace name for a stack: `stack-<id>`.
pub fn namespace_for(stack_id: UnitId) -> String {
    format!("stack-{stack_id}")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
