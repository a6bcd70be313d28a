//! On-disk layout of provisioned code.
//!
//! ```text
//! <platform_root>/
//!   stacks/
//!     <stack_id>/
//!       agents/
//!         <agent_id>/
//!           agent.zip     (copied upload)
//!           extracted/    (archive contents)
//! ```
//!
//! Every function here is pure; nothing touches the filesystem.

use std::path::{Path, PathBuf};

use stackyard_core::{LogicalId, UnitId};

pub const ARCHIVE_FILE: &str = "agent.zip";
pub const EXTRACTED_DIR: &str = "extracted";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/stacks/<stack_id>`
    pub fn stack_dir(&self, stack: UnitId) -> PathBuf {
        self.root.join("stacks").join(stack.to_string())
    }

    /// `<root>/stacks/<stack_id>/agents`: the stack's storage root.
    pub fn stack_agents_dir(&self, stack: UnitId) -> PathBuf {
        self.stack_dir(stack).join("agents")
    }

    /// `<root>/stacks/<stack_id>/agents/<agent_id>`
    pub fn agent_dir(&self, stack: UnitId, agent: UnitId) -> PathBuf {
        self.stack_agents_dir(stack).join(agent.to_string())
    }

    pub fn agent_archive(&self, stack: UnitId, agent: UnitId) -> PathBuf {
        self.agent_dir(stack, agent).join(ARCHIVE_FILE)
    }

    pub fn extracted_dir(&self, stack: UnitId, agent: UnitId) -> PathBuf {
        self.agent_dir(stack, agent).join(EXTRACTED_DIR)
    }

    /// Absolute path where the entry file must exist for `slug`.
    pub fn entry_point(&self, stack: UnitId, agent: UnitId, slug: &str, entry_file: &str) -> PathBuf {
        self.extracted_dir(stack, agent).join(slug).join(entry_file)
    }
}

/// Registry code path as the runtime resolves it:
/// `<prefix>/<stack_id>/agents/<agent_id>/extracted/<slug>/<entry_file>:<symbol>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodePath {
    pub logical_id: LogicalId,
    pub value: String,
}

impl CodePath {
    pub fn new(
        prefix: &str,
        stack: UnitId,
        agent: UnitId,
        slug: &str,
        entry_file: &str,
        symbol: &str,
    ) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            logical_id: LogicalId::for_agent(stack, agent),
            value: format!(
                "{prefix}/{stack}/agents/{agent}/{EXTRACTED_DIR}/{slug}/{entry_file}:{symbol}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_paths_nest_under_stack() {
        let layout = StorageLayout::new("/var/agent-platform");
        let stack = UnitId::new();
        let agent = UnitId::new();
        assert_eq!(
            layout.agent_archive(stack, agent),
            PathBuf::from(format!("/var/agent-platform/stacks/{stack}/agents/{agent}/agent.zip"))
        );
        assert!(layout.extracted_dir(stack, agent).starts_with(layout.stack_dir(stack)));
        assert!(layout
            .entry_point(stack, agent, "support", "graph.py")
            .ends_with("extracted/support/graph.py"));
    }

    #[test]
    fn code_path_matches_runtime_convention() {
        let stack = UnitId::new();
        let agent = UnitId::new();
        let code = CodePath::new("./graphs/", stack, agent, "support", "graph.py", "graph");
        assert_eq!(
            code.value,
            format!("./graphs/{stack}/agents/{agent}/extracted/support/graph.py:graph")
        );
        assert_eq!(code.logical_id, LogicalId::for_agent(stack, agent));
    }
}
