// src/relay_tree.rs
//
// The Relay Tree Manager: one capacity-scored tree per room, mapping socket
// identities to parent/child relay relationships.
//
//   tier 0        host (root)
//   tier 1        ┌────┴────┐
//              relay A    relay B     each serving ≤ capacity children
//   tier 2     ┌──┴──┐       │
//             ...   ...     ...       depth capped at MAX_TIER
//
// Parent selection is a pure function over an immutable snapshot of the
// tree (id, tier, free-slot triples in insertion order); the mutation is
// applied by the tree itself afterwards.  Every operation is synchronous
// and side-effect-free on failure — callers fall back to a direct host
// connection on NO_CAPACITY, and nothing here retries.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ErrorCode;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Maximum depth of the relay tree.  Enforced at insertion and reassignment;
/// never violated afterwards.
pub const MAX_TIER: u32 = 3;

/// Capacity assigned when the device class is unknown.
pub const DEFAULT_CAPACITY: u32 = 3;

// ─── Device classing ────────────────────────────────────────────────────────

/// Client-reported device/network class, as sent with `join-room-relay`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceInfo {
    /// "mobile" | "tablet" | "desktop" ...
    pub device_type: Option<String>,
    /// "cellular" | "wifi" | "4g" | "ethernet" | "wired" ...
    pub connection_type: Option<String>,
    /// Reported downlink bandwidth in Mbit/s.
    pub downlink: Option<f64>,
}

/// Derive a relay capacity from the reported device class.
///
/// Mobile devices and cellular connections never serve as relay parents;
/// wired connections get the full host-grade fan-out; wifi/4G scales with
/// the reported downlink; anything unknown gets a conservative default.
pub fn capacity_for(device: &DeviceInfo) -> u32 {
    let device_type = device.device_type.as_deref().unwrap_or("").to_lowercase();
    let connection = device
        .connection_type
        .as_deref()
        .unwrap_or("")
        .to_lowercase();

    if device_type == "mobile" || connection == "cellular" {
        return 0;
    }

    match connection.as_str() {
        "ethernet" | "wired" => 10,
        "wifi" | "4g" => match device.downlink {
            Some(mbps) if mbps >= 50.0 => 5,
            Some(mbps) if mbps >= 20.0 => 4,
            Some(mbps) if mbps >= 10.0 => 3,
            Some(_) => 2,
            None => 3,
        },
        _ => DEFAULT_CAPACITY,
    }
}

// ─── Nodes ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TreeNode {
    pub socket_id: String,
    pub capacity: u32,
    pub children: HashSet<String>,
    pub parent: Option<String>,
    pub tier: u32,
}

impl TreeNode {
    pub fn free_slots(&self) -> u32 {
        self.capacity.saturating_sub(self.children.len() as u32)
    }
}

/// A successful attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    pub parent_id: String,
    pub tier: u32,
    pub capacity: u32,
}

// ─── Pure parent selection ──────────────────────────────────────────────────

/// Immutable snapshot row used by the selection function.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub socket_id: String,
    pub tier: u32,
    pub free_slots: u32,
}

/// Pick the best parent among `candidates`: maximize
/// `(1000 − tier×100) + free_slots×10` over nodes with free slots and
/// `tier <= max_parent_tier`.  Ties break to the first maximal candidate,
/// so the caller's iteration order is part of the contract.
pub fn best_parent(candidates: &[Candidate], max_parent_tier: u32) -> Option<&Candidate> {
    let mut best: Option<(&Candidate, i64)> = None;
    for candidate in candidates {
        if candidate.free_slots == 0 || candidate.tier > max_parent_tier {
            continue;
        }
        let score = (1000 - i64::from(candidate.tier) * 100) + i64::from(candidate.free_slots) * 10;
        match best {
            Some((_, top)) if top >= score => {}
            _ => best = Some((candidate, score)),
        }
    }
    best.map(|(candidate, _)| candidate)
}

// ─── RelayTree ──────────────────────────────────────────────────────────────

/// The per-room tree.  `order` preserves insertion order so snapshots (and
/// therefore tie-breaks) are stable.
#[derive(Debug)]
pub struct RelayTree {
    pub root: String,
    nodes: HashMap<String, TreeNode>,
    order: Vec<String>,
}

impl RelayTree {
    pub fn new(host_id: &str, host_capacity: u32) -> Self {
        let root = TreeNode {
            socket_id: host_id.to_string(),
            capacity: host_capacity,
            children: HashSet::new(),
            parent: None,
            tier: 0,
        };
        Self {
            root: host_id.to_string(),
            nodes: HashMap::from([(host_id.to_string(), root)]),
            order: vec![host_id.to_string()],
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, node_id: &str) -> bool {
        self.nodes.contains_key(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&TreeNode> {
        self.nodes.get(node_id)
    }

    /// Snapshot of every node, in insertion order.
    fn candidates(&self) -> Vec<Candidate> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(|node| Candidate {
                socket_id: node.socket_id.clone(),
                tier: node.tier,
                free_slots: node.free_slots(),
            })
            .collect()
    }

    /// Attach a new node under the best available parent.
    pub fn insert(&mut self, node_id: &str, capacity: u32) -> Result<Placement, ErrorCode> {
        // A parent at MAX_TIER would put the child past the depth cap.
        let candidates = self.candidates();
        let parent_id = best_parent(&candidates, MAX_TIER - 1)
            .map(|c| c.socket_id.clone())
            .ok_or(ErrorCode::NoCapacity)?;

        let parent_tier = match self.nodes.get_mut(&parent_id) {
            Some(parent) => {
                parent.children.insert(node_id.to_string());
                parent.tier
            }
            None => return Err(ErrorCode::NoCapacity),
        };

        let tier = parent_tier + 1;
        self.nodes.insert(
            node_id.to_string(),
            TreeNode {
                socket_id: node_id.to_string(),
                capacity,
                children: HashSet::new(),
                parent: Some(parent_id.clone()),
                tier,
            },
        );
        self.order.push(node_id.to_string());

        debug!(node = %node_id, parent = %parent_id, tier, "relay node attached");
        Ok(Placement {
            parent_id,
            tier,
            capacity,
        })
    }

    /// Detach `node_id` and delete it.  Returns its former children — the
    /// orphan list — in stable insertion order.  The orphans keep their own
    /// subtrees and stay in the tree, parentless, until reassigned.
    pub fn remove(&mut self, node_id: &str) -> Vec<String> {
        let Some(node) = self.nodes.remove(node_id) else {
            return Vec::new();
        };
        self.order.retain(|id| id != node_id);

        if let Some(parent_id) = &node.parent {
            if let Some(parent) = self.nodes.get_mut(parent_id) {
                parent.children.remove(node_id);
            }
        }

        let orphans: Vec<String> = self
            .order
            .iter()
            .filter(|id| node.children.contains(*id))
            .cloned()
            .collect();
        for orphan_id in &orphans {
            if let Some(orphan) = self.nodes.get_mut(orphan_id) {
                orphan.parent = None;
            }
        }
        orphans
    }

    /// Re-run parent selection for each orphan, in the given order, against
    /// the current (already-mutated) tree.  No global reoptimization: a
    /// success reattaches just that orphan (its subtree follows, re-tiered);
    /// a failure leaves it unassigned for the caller to report.
    pub fn reassign_orphans(&mut self, orphans: &[String]) -> Vec<(String, Option<Placement>)> {
        orphans
            .iter()
            .map(|orphan_id| (orphan_id.clone(), self.reassign(orphan_id)))
            .collect()
    }

    fn reassign(&mut self, orphan_id: &str) -> Option<Placement> {
        let orphan = self.nodes.get(orphan_id)?;
        let capacity = orphan.capacity;

        // The orphan may carry a subtree: the chosen parent must leave room
        // for the whole chain below the depth cap, and nothing inside the
        // subtree may become its own ancestor.
        let subtree = self.subtree_ids(orphan_id);
        let depth = self.subtree_depth(orphan_id);
        let max_parent_tier = (MAX_TIER - 1).checked_sub(depth)?;

        let candidates: Vec<Candidate> = self
            .candidates()
            .into_iter()
            .filter(|c| !subtree.contains(&c.socket_id))
            .collect();
        let parent_id = best_parent(&candidates, max_parent_tier)?.socket_id.clone();

        let parent_tier = {
            let parent = self.nodes.get_mut(&parent_id)?;
            parent.children.insert(orphan_id.to_string());
            parent.tier
        };

        let tier = parent_tier + 1;
        if let Some(orphan) = self.nodes.get_mut(orphan_id) {
            orphan.parent = Some(parent_id.clone());
        }
        self.retier(orphan_id, tier);

        debug!(node = %orphan_id, parent = %parent_id, tier, "orphan reassigned");
        Some(Placement {
            parent_id,
            tier,
            capacity,
        })
    }

    /// Set `node_id`'s tier and propagate `parent.tier + 1` down its
    /// subtree.
    fn retier(&mut self, node_id: &str, tier: u32) {
        let mut stack = vec![(node_id.to_string(), tier)];
        while let Some((id, tier)) = stack.pop() {
            if let Some(node) = self.nodes.get_mut(&id) {
                node.tier = tier;
                stack.extend(node.children.iter().map(|child| (child.clone(), tier + 1)));
            }
        }
    }

    /// Every id in `node_id`'s subtree, itself included.
    fn subtree_ids(&self, node_id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![node_id.to_string()];
        while let Some(id) = stack.pop() {
            if let Some(node) = self.nodes.get(&id) {
                stack.extend(node.children.iter().cloned());
            }
            seen.insert(id);
        }
        seen
    }

    /// Longest chain length strictly below `node_id` (0 for a leaf).
    fn subtree_depth(&self, node_id: &str) -> u32 {
        let Some(node) = self.nodes.get(node_id) else {
            return 0;
        };
        node.children
            .iter()
            .map(|child| 1 + self.subtree_depth(child))
            .max()
            .unwrap_or(0)
    }
}

// ─── RelayTreeManager ───────────────────────────────────────────────────────

/// All live trees, keyed by normalized room name.
pub struct RelayTreeManager {
    trees: Mutex<HashMap<String, RelayTree>>,
    host_capacity: u32,
}

impl RelayTreeManager {
    pub fn new(host_capacity: u32) -> Self {
        Self {
            trees: Mutex::new(HashMap::new()),
            host_capacity,
        }
    }

    /// Create the tree for `room` rooted at `host_id`, replacing any tree
    /// rooted at a different (stale) host.
    pub fn ensure_root(&self, room: &str, host_id: &str) {
        let mut trees = self.trees.lock().expect("tree mutex poisoned");
        match trees.get(room) {
            Some(tree) if tree.root == host_id => {}
            _ => {
                trees.insert(room.to_string(), RelayTree::new(host_id, self.host_capacity));
                info!(room = %room, host = %host_id, "relay tree rooted");
            }
        }
    }

    /// Attach `node_id` to the room's tree.  `NO_CAPACITY` when the room has
    /// no tree or no eligible parent; the caller falls back to a direct host
    /// connection.
    pub fn insert(
        &self,
        room: &str,
        node_id: &str,
        device: &DeviceInfo,
    ) -> Result<Placement, ErrorCode> {
        let capacity = capacity_for(device);
        let mut trees = self.trees.lock().expect("tree mutex poisoned");
        let tree = trees.get_mut(room).ok_or(ErrorCode::NoCapacity)?;
        tree.insert(node_id, capacity)
    }

    /// Remove `node_id`, returning its orphaned children.  Removing the root
    /// tears the whole tree down and returns every remaining node, so each
    /// one gets told to renegotiate.
    pub fn remove(&self, room: &str, node_id: &str) -> Vec<String> {
        let mut trees = self.trees.lock().expect("tree mutex poisoned");
        let Some(tree) = trees.get_mut(room) else {
            return Vec::new();
        };

        if tree.root == node_id {
            let survivors: Vec<String> = tree
                .order
                .iter()
                .filter(|id| *id != node_id)
                .cloned()
                .collect();
            trees.remove(room);
            info!(room = %room, "relay tree destroyed (root removed)");
            return survivors;
        }

        if !tree.contains(node_id) {
            return Vec::new();
        }
        tree.remove(node_id)
    }

    /// Reassign orphans against the current tree.  With no tree left, every
    /// orphan is reported unassigned.
    pub fn reassign_orphans(
        &self,
        room: &str,
        orphans: &[String],
    ) -> Vec<(String, Option<Placement>)> {
        let mut trees = self.trees.lock().expect("tree mutex poisoned");
        match trees.get_mut(room) {
            Some(tree) => tree.reassign_orphans(orphans),
            None => orphans.iter().map(|id| (id.clone(), None)).collect(),
        }
    }

    /// Drop the room's tree entirely (room session ended).
    pub fn destroy(&self, room: &str) {
        let mut trees = self.trees.lock().expect("tree mutex poisoned");
        if trees.remove(room).is_some() {
            info!(room = %room, "relay tree destroyed");
        }
    }

    pub fn contains(&self, room: &str, node_id: &str) -> bool {
        let trees = self.trees.lock().expect("tree mutex poisoned");
        trees.get(room).map(|t| t.contains(node_id)).unwrap_or(false)
    }

    pub fn active_trees(&self) -> usize {
        self.trees.lock().expect("tree mutex poisoned").len()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
