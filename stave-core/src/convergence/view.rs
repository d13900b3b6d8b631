//! Cluster view and version selection
//!
//! Pure decision rules over a node's local candidates, its served version
//! and the versions its siblings publish.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use crate::version::Version;

/// Published version of every node under a dataset
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ClusterView {
    nodes: BTreeMap<String, Option<Version>>,
}

impl ClusterView {
    /// Create an empty view
    pub fn new() -> Self {
        Self::default()
    }

    /// Record what `node` publishes
    pub fn insert(&mut self, node: impl Into<String>, version: Option<Version>) {
        self.nodes.insert(node.into(), version);
    }

    /// True if `node` has an entry, even an empty one
    pub fn contains(&self, node: &str) -> bool {
        self.nodes.contains_key(node)
    }

    /// What `node` publishes; `None` if absent or publishing nothing
    pub fn published(&self, node: &str) -> Option<&Version> {
        self.nodes.get(node).and_then(Option::as_ref)
    }

    /// Number of nodes present
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if no node is present
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Iterate over nodes and their published versions
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Version>)> {
        self.nodes.iter().map(|(node, v)| (node.as_str(), v.as_ref()))
    }

    /// Versions published by every node except `me`
    pub fn published_by_others(&self, me: &str) -> BTreeSet<&Version> {
        self.iter()
            .filter(|(node, _)| *node != me)
            .filter_map(|(_, version)| version)
            .collect()
    }
}

/// Local candidates strictly newer than `served`, newest first.
///
/// The first one that loads becomes the target; anything at or below the
/// served version is never considered.
pub fn upgrade_candidates(candidates: &BTreeSet<Version>, served: Option<&Version>) -> Vec<Version> {
    candidates
        .iter()
        .rev()
        .filter(|v| served.map_or(true, |served| *v > served))
        .cloned()
        .collect()
}

/// Local candidates already published by a sibling, newest first
pub fn join_candidates(candidates: &BTreeSet<Version>, view: &ClusterView, me: &str) -> Vec<Version> {
    let published = view.published_by_others(me);
    candidates
        .iter()
        .rev()
        .filter(|v| published.contains(v))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn versions(names: &[&str]) -> BTreeSet<Version> {
        names.iter().map(|n| Version::from(*n)).collect()
    }

    #[test]
    fn test_upgrade_candidates_never_regress() {
        let local = versions(&["v1", "v2"]);
        let served = Version::from("v3");
        assert!(upgrade_candidates(&local, Some(&served)).is_empty());

        let local = versions(&["v1", "v2", "v3", "v10"]);
        let served = Version::from("v2");
        assert_eq!(
            upgrade_candidates(&local, Some(&served)),
            vec![Version::from("v10"), Version::from("v3")]
        );
        assert_eq!(upgrade_candidates(&local, None).len(), 4);
    }

    #[test]
    fn test_join_candidates_only_published_by_siblings() {
        let mut view = ClusterView::new();
        view.insert("a:1", Some(Version::from("v3")));
        view.insert("b:1", None);
        view.insert("me:1", Some(Version::from("v4")));

        let local = versions(&["v2", "v3", "v4"]);
        assert_eq!(join_candidates(&local, &view, "me:1"), vec![Version::from("v3")]);
        assert!(join_candidates(&versions(&["v1"]), &view, "me:1").is_empty());
    }

    #[test]
    fn test_view_lookup() {
        let mut view = ClusterView::new();
        view.insert("a:1", None);
        assert!(view.contains("a:1"));
        assert_eq!(view.published("a:1"), None);
        assert!(!view.contains("b:1"));
        assert_eq!(view.len(), 1);
    }
}
