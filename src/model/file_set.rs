//! Per-repository file index with maintained global and need views.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, RwLock};

use crate::core::{FLAG_DELETED, FileInfo, LamportClock, NodeId, RepoId};

/// The per-repository index: one file map per node plus derived views.
///
/// `global` holds the per-name winner across all nodes (highest version,
/// node id as tiebreak, invalid entries excluded). `need` holds, per
/// node, the files whose global winner is newer than that node's copy.
/// Both are maintained on every mutation rather than recomputed on read.
///
/// All methods synchronize internally; the `with_*` iterators run under
/// the internal read lock and therefore observe a consistent snapshot.
pub struct FileSet {
    repo: RepoId,
    /// Stands in for [`NodeId::LOCAL`] when breaking version ties, so
    /// every node in the cluster ranks the same copies the same way.
    local_id: NodeId,
    clock: Arc<LamportClock>,
    state: RwLock<SetState>,
}

#[derive(Default)]
struct SetState {
    files: BTreeMap<NodeId, BTreeMap<String, FileInfo>>,
    global: BTreeMap<String, FileInfo>,
    need: BTreeMap<NodeId, BTreeMap<String, FileInfo>>,
    changes: BTreeMap<NodeId, u64>,
}

impl FileSet {
    /// `nodes` is the share group; need maps for these nodes exist from
    /// the start so completion reporting works before first contact.
    pub fn new(repo: RepoId, local_id: NodeId, nodes: &[NodeId], clock: Arc<LamportClock>) -> Self {
        let mut state = SetState::default();
        state.register(NodeId::LOCAL);
        for node in nodes {
            state.register(*node);
        }
        Self {
            repo,
            local_id,
            clock,
            state: RwLock::new(state),
        }
    }

    pub fn repo(&self) -> &RepoId {
        &self.repo
    }

    /// Atomically replace `node`'s entire map with `files`.
    pub fn replace(&self, node: NodeId, files: Vec<FileInfo>) {
        for f in &files {
            self.clock.tick(f.version);
        }
        let mut map = BTreeMap::new();
        for f in files {
            map.insert(f.name.clone(), f);
        }
        let mut state = self.state.write().expect("file set lock poisoned");
        state.install(node, map, self.local_id);
    }

    /// Replace `node`'s map with `files`, retaining any name previously
    /// present but now missing as a deletion with a fresh version. Used
    /// for the local scanner sweep, which is authoritative about what is
    /// on disk but knows nothing about what used to be.
    pub fn replace_with_delete(&self, node: NodeId, files: Vec<FileInfo>) {
        for f in &files {
            self.clock.tick(f.version);
        }
        let mut map = BTreeMap::new();
        for f in files {
            map.insert(f.name.clone(), f);
        }
        let mut state = self.state.write().expect("file set lock poisoned");
        state.register(node);
        let old = std::mem::take(state.files.get_mut(&node).expect("registered node"));
        for (name, mut prior) in old {
            if map.contains_key(&name) {
                continue;
            }
            if !prior.is_deleted() {
                prior.flags |= FLAG_DELETED;
                prior.blocks = Vec::new();
                prior.version = self.clock.tick(prior.version);
            }
            map.insert(name, prior);
        }
        state.install(node, map, self.local_id);
    }

    /// Merge `files` into `node`'s map. An incoming entry replaces the
    /// stored one when its version is at least as new; older entries are
    /// dropped.
    pub fn update(&self, node: NodeId, files: Vec<FileInfo>) {
        for f in &files {
            self.clock.tick(f.version);
        }
        let mut state = self.state.write().expect("file set lock poisoned");
        state.register(node);
        let map = state.files.get_mut(&node).expect("registered node");
        let mut touched = Vec::new();
        for f in files {
            let stale = map.get(&f.name).is_some_and(|old| f.version < old.version);
            if stale {
                continue;
            }
            touched.push(f.name.clone());
            map.insert(f.name.clone(), f);
        }
        for name in &touched {
            state.refresh_name(name, self.local_id);
        }
        state.bump(node);
    }

    /// The stored entry, or the zero FileInfo (empty name) when absent.
    pub fn get(&self, node: NodeId, name: &str) -> FileInfo {
        let state = self.state.read().expect("file set lock poisoned");
        state
            .files
            .get(&node)
            .and_then(|m| m.get(name))
            .cloned()
            .unwrap_or_default()
    }

    /// The global winner for `name`, or the zero FileInfo.
    pub fn get_global(&self, name: &str) -> FileInfo {
        let state = self.state.read().expect("file set lock poisoned");
        state.global.get(name).cloned().unwrap_or_default()
    }

    /// Visit `node`'s own entries in name order until `visit` returns
    /// false.
    pub fn with_have(&self, node: NodeId, mut visit: impl FnMut(&FileInfo) -> bool) {
        let state = self.state.read().expect("file set lock poisoned");
        if let Some(map) = state.files.get(&node) {
            for f in map.values() {
                if !visit(f) {
                    break;
                }
            }
        }
    }

    /// Visit the global view in name order until `visit` returns false.
    pub fn with_global(&self, mut visit: impl FnMut(&FileInfo) -> bool) {
        let state = self.state.read().expect("file set lock poisoned");
        for f in state.global.values() {
            if !visit(f) {
                break;
            }
        }
    }

    /// Visit the files `node` must fetch to match the global view.
    pub fn with_need(&self, node: NodeId, mut visit: impl FnMut(&FileInfo) -> bool) {
        let state = self.state.read().expect("file set lock poisoned");
        if let Some(map) = state.need.get(&node) {
            for f in map.values() {
                if !visit(f) {
                    break;
                }
            }
        }
    }

    /// Monotonic mutation counter for `node`'s map.
    pub fn changes(&self, node: NodeId) -> u64 {
        let state = self.state.read().expect("file set lock poisoned");
        state.changes.get(&node).copied().unwrap_or(0)
    }
}

impl SetState {
    fn register(&mut self, node: NodeId) {
        self.files.entry(node).or_default();
        self.need.entry(node).or_default();
        self.changes.entry(node).or_insert(0);
    }

    fn bump(&mut self, node: NodeId) {
        *self.changes.entry(node).or_insert(0) += 1;
    }

    fn install(&mut self, node: NodeId, map: BTreeMap<String, FileInfo>, local_id: NodeId) {
        self.register(node);
        let old = std::mem::replace(self.files.get_mut(&node).expect("registered node"), map);
        let mut touched: BTreeSet<String> = old.into_keys().collect();
        touched.extend(self.files[&node].keys().cloned());
        for name in &touched {
            self.refresh_name(name, local_id);
        }
        self.bump(node);
    }

    /// Recompute the global winner for `name` and the per-node need
    /// entries that depend on it.
    fn refresh_name(&mut self, name: &str, local_id: NodeId) {
        let mut winner: Option<(NodeId, FileInfo)> = None;
        for (node, map) in &self.files {
            let Some(f) = map.get(name) else { continue };
            if f.is_invalid() {
                continue;
            }
            let id = if *node == NodeId::LOCAL { local_id } else { *node };
            let better = match &winner {
                None => true,
                Some((best_id, best)) => {
                    f.version > best.version || (f.version == best.version && id > *best_id)
                }
            };
            if better {
                winner = Some((id, f.clone()));
            }
        }

        let global = winner.map(|(_, f)| f);
        match &global {
            Some(g) => {
                self.global.insert(name.to_string(), g.clone());
            }
            None => {
                self.global.remove(name);
            }
        }

        let nodes: Vec<NodeId> = self.need.keys().copied().collect();
        for node in nodes {
            let have = self.files.get(&node).and_then(|m| m.get(name));
            let needed = match &global {
                None => false,
                Some(g) => {
                    let have_version = have.map(|h| h.version).unwrap_or(0);
                    g.version > have_version && !(g.is_deleted() && have.is_none())
                }
            };
            let need = self.need.get_mut(&node).expect("registered node");
            if needed {
                need.insert(
                    name.to_string(),
                    global.clone().expect("needed implies a winner"),
                );
            } else {
                need.remove(name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::core::FLAG_INVALID;

    fn node(seed: u8) -> NodeId {
        NodeId::new([seed; 32])
    }

    fn file(name: &str, version: u64) -> FileInfo {
        FileInfo {
            name: name.into(),
            version,
            ..FileInfo::default()
        }
    }

    fn set() -> FileSet {
        FileSet::new(
            RepoId::parse("r").unwrap(),
            node(1),
            &[node(1), node(2), node(3)],
            Arc::new(LamportClock::new()),
        )
    }

    fn need_names(fs: &FileSet, n: NodeId) -> Vec<String> {
        let mut names = Vec::new();
        fs.with_need(n, |f| {
            names.push(f.name.clone());
            true
        });
        names
    }

    #[test]
    fn highest_version_wins_globally() {
        let fs = set();
        fs.replace(NodeId::LOCAL, vec![file("a", 2)]);
        fs.replace(node(2), vec![file("a", 5)]);
        assert_eq!(fs.get_global("a").version, 5);
    }

    #[test]
    fn version_tie_breaks_by_node_id() {
        let fs = set();
        let mut ours = file("a", 5);
        ours.modified = 100;
        let mut theirs = file("a", 5);
        theirs.modified = 200;

        // The local node is id 1, the peer id 2; the peer wins the tie.
        fs.replace(NodeId::LOCAL, vec![ours]);
        fs.replace(node(2), vec![theirs]);
        assert_eq!(fs.get_global("a").modified, 200);
    }

    #[test]
    fn invalid_entries_are_excluded_from_global() {
        let fs = set();
        let mut hot = file("a", 9);
        hot.flags |= FLAG_INVALID;
        fs.replace(NodeId::LOCAL, vec![hot]);
        fs.replace(node(2), vec![file("a", 3)]);
        assert_eq!(fs.get_global("a").version, 3);
        assert!(fs.get_global("a").name == "a");
    }

    #[test]
    fn need_tracks_missing_and_stale_files() {
        let fs = set();
        fs.replace(node(2), vec![file("a", 4), file("b", 1)]);
        fs.replace(NodeId::LOCAL, vec![file("a", 2)]);

        assert_eq!(need_names(&fs, NodeId::LOCAL), vec!["a", "b"]);

        // Catching up empties the need set.
        fs.update(NodeId::LOCAL, vec![file("a", 4), file("b", 1)]);
        assert!(need_names(&fs, NodeId::LOCAL).is_empty());
    }

    #[test]
    fn deletions_are_not_needed_by_nodes_that_never_had_the_file() {
        let fs = set();
        let mut gone = file("a", 7);
        gone.flags |= FLAG_DELETED;
        fs.replace(node(2), vec![gone]);

        // This node never had "a": nothing to do.
        assert!(need_names(&fs, NodeId::LOCAL).is_empty());

        // A node holding a stale copy must still learn of the deletion.
        fs.replace(node(3), vec![file("a", 3)]);
        assert_eq!(need_names(&fs, node(3)), vec!["a"]);
    }

    #[test]
    fn update_drops_older_versions() {
        let fs = set();
        fs.replace(node(2), vec![file("a", 5)]);
        fs.update(node(2), vec![file("a", 3)]);
        assert_eq!(fs.get(node(2), "a").version, 5);

        fs.update(node(2), vec![file("a", 6)]);
        assert_eq!(fs.get(node(2), "a").version, 6);
    }

    #[test]
    fn replace_with_delete_tombstones_vanished_names() {
        let clock = Arc::new(LamportClock::new());
        let fs = FileSet::new(
            RepoId::parse("r").unwrap(),
            node(1),
            &[node(1), node(2)],
            Arc::clone(&clock),
        );
        fs.replace_with_delete(NodeId::LOCAL, vec![file("keep", 1), file("drop", 2)]);
        fs.replace_with_delete(NodeId::LOCAL, vec![file("keep", 1)]);

        let dropped = fs.get(NodeId::LOCAL, "drop");
        assert!(dropped.is_deleted());
        assert!(dropped.blocks.is_empty());
        assert!(dropped.version > 2);

        // A further sweep leaves the tombstone's version alone.
        let version = dropped.version;
        fs.replace_with_delete(NodeId::LOCAL, vec![file("keep", 1)]);
        assert_eq!(fs.get(NodeId::LOCAL, "drop").version, version);
    }

    #[test]
    fn changes_counts_every_mutation() {
        let fs = set();
        assert_eq!(fs.changes(NodeId::LOCAL), 0);
        fs.replace(NodeId::LOCAL, vec![file("a", 1)]);
        fs.update(NodeId::LOCAL, vec![file("a", 2)]);
        fs.replace(NodeId::LOCAL, Vec::new());
        assert_eq!(fs.changes(NodeId::LOCAL), 3);
        assert_eq!(fs.changes(node(2)), 0);
    }

    #[test]
    fn get_returns_zero_file_for_absent_names() {
        let fs = set();
        let zero = fs.get(node(2), "nope");
        assert!(zero.name.is_empty());
        assert_eq!(zero.version, 0);
    }

    #[test]
    fn iteration_stops_when_visitor_returns_false() {
        let fs = set();
        fs.replace(
            NodeId::LOCAL,
            vec![file("a", 1), file("b", 2), file("c", 3)],
        );
        let mut seen = 0;
        fs.with_have(NodeId::LOCAL, |_| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);
    }

    proptest! {
        /// The maintained global view always equals the brute-force
        /// winner: highest version, largest node id on ties, invalid
        /// entries skipped.
        #[test]
        fn global_matches_brute_force(entries in proptest::collection::vec(
            (1u8..4, 0usize..3, 1u64..6, proptest::bool::ANY),
            0..24,
        )) {
            let names = ["a", "b", "c"];
            let fs = set();
            let mut expect: BTreeMap<String, (u64, NodeId)> = BTreeMap::new();

            for (seed, name_ix, version, invalid) in entries {
                let peer = node(seed);
                let mut f = file(names[name_ix], version);
                if invalid {
                    f.flags |= FLAG_INVALID;
                }
                // Mirror the merge rule for the expectation.
                fs.update(peer, vec![f.clone()]);
                let winner = fs.get(peer, names[name_ix]);
                if !winner.is_invalid() {
                    let candidate = (winner.version, peer);
                    let slot = expect.entry(names[name_ix].to_string()).or_insert(candidate);
                    if candidate > *slot {
                        *slot = candidate;
                    }
                } else {
                    expect.remove(names[name_ix]);
                    // Another node may still hold a valid copy; rebuild.
                    for other in [node(1), node(2), node(3)] {
                        let held = fs.get(other, names[name_ix]);
                        if !held.name.is_empty() && !held.is_invalid() {
                            let candidate = (held.version, other);
                            let slot = expect
                                .entry(names[name_ix].to_string())
                                .or_insert(candidate);
                            if candidate > *slot {
                                *slot = candidate;
                            }
                        }
                    }
                }
            }

            for name in names {
                let global = fs.get_global(name);
                match expect.get(name) {
                    Some((version, _)) => prop_assert_eq!(global.version, *version),
                    None => prop_assert!(global.name.is_empty()),
                }
            }
        }
    }
}
