use std::collections::HashMap;
use std::fmt;

use facet::Facet;

use super::vm::VmStatus;

/// Machine state captured when the snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Facet)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum SnapshotState {
    Running,
    Stopped,
    Paused,
    /// Discovered by a sync; VBoxManage's listing does not report it.
    #[default]
    Unknown,
}

impl SnapshotState {
    pub fn as_vm_status(self) -> VmStatus {
        match self {
            SnapshotState::Running => VmStatus::Running,
            SnapshotState::Stopped => VmStatus::Stopped,
            SnapshotState::Paused => VmStatus::Paused,
            SnapshotState::Unknown => VmStatus::Unknown,
        }
    }
}

impl From<VmStatus> for SnapshotState {
    fn from(status: VmStatus) -> Self {
        match status {
            VmStatus::Running => SnapshotState::Running,
            VmStatus::Paused => SnapshotState::Paused,
            VmStatus::Stopped | VmStatus::Saved => SnapshotState::Stopped,
            VmStatus::Unknown => SnapshotState::Unknown,
        }
    }
}

impl fmt::Display for SnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_vm_status().fmt(f)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Facet)]
#[facet(default)]
pub struct Snapshot {
    pub id: String,
    pub vm_id: String,
    /// Unique per machine.
    pub name: String,
    pub description: String,
    pub parent_id: Option<String>,
    pub vm_state: SnapshotState,
    pub is_auto: bool,
    pub restore_count: u32,
    pub last_restored: Option<u64>,
    pub tags: Vec<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotUpdate {
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// Arena view over one machine's snapshots, indexed by id.
///
/// Parent links that point outside the arena are treated as roots.
pub struct SnapshotTree<'a> {
    nodes: Vec<&'a Snapshot>,
    index: HashMap<&'a str, usize>,
    children: Vec<Vec<usize>>,
}

impl<'a> SnapshotTree<'a> {
    pub fn new(snapshots: &'a [Snapshot]) -> Self {
        let nodes: Vec<&Snapshot> = snapshots.iter().collect();
        let index: HashMap<&str, usize> = nodes
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        let mut children = vec![Vec::new(); nodes.len()];
        for (i, snap) in nodes.iter().enumerate() {
            if let Some(&parent) = snap.parent_id.as_deref().and_then(|p| index.get(p)) {
                if parent != i {
                    children[parent].push(i);
                }
            }
        }
        Self {
            nodes,
            index,
            children,
        }
    }

    pub fn get(&self, id: &str) -> Option<&'a Snapshot> {
        self.index.get(id).map(|&i| self.nodes[i])
    }

    pub fn children_of(&self, id: &str) -> Vec<&'a Snapshot> {
        self.index
            .get(id)
            .map(|&i| self.children[i].iter().map(|&c| self.nodes[c]).collect())
            .unwrap_or_default()
    }

    /// The snapshot and all its descendants, deepest first, so removing in
    /// order never leaves a child without its parent mid-way.
    pub fn subtree_leaves_first(&self, id: &str) -> Vec<&'a Snapshot> {
        let Some(&root) = self.index.get(id) else {
            return Vec::new();
        };
        let mut order = Vec::new();
        let mut visited = vec![false; self.nodes.len()];
        let mut stack = vec![(root, false)];
        while let Some((node, expanded)) = stack.pop() {
            if expanded {
                order.push(self.nodes[node]);
                continue;
            }
            if visited[node] {
                continue;
            }
            visited[node] = true;
            stack.push((node, true));
            for &child in &self.children[node] {
                if !visited[child] {
                    stack.push((child, false));
                }
            }
        }
        order
    }
}
