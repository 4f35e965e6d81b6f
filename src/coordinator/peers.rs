//! Known-peer bookkeeping for the coordinator mesh
//!
//! Peers are normalized base URLs. The set is seeded from configuration and
//! grows through gossip: sync pulls, peers-list pulls, and join pushes.

use std::collections::BTreeSet;

use crate::common::utils::normalize_base_url;

/// Mutable set of peer base URLs, never containing this node's own URL
#[derive(Debug)]
pub struct PeerSet {
    self_url: Option<String>,
    peers: BTreeSet<String>,
}

impl PeerSet {
    pub fn new(self_url: Option<&str>, seeds: &[String]) -> Self {
        let self_url = self_url.and_then(normalize_base_url);
        let mut set = Self {
            self_url,
            peers: BTreeSet::new(),
        };
        for seed in seeds {
            set.add(seed);
        }
        set
    }

    /// Add a peer URL; returns true if it was new. Unparseable URLs and the
    /// node's own URL are ignored.
    pub fn add(&mut self, raw: &str) -> bool {
        let Some(url) = normalize_base_url(raw) else {
            return false;
        };
        if Some(&url) == self.self_url.as_ref() {
            return false;
        }
        self.peers.insert(url)
    }

    pub fn contains(&self, raw: &str) -> bool {
        normalize_base_url(raw)
            .map(|url| self.peers.contains(&url))
            .unwrap_or(false)
    }

    pub fn list(&self) -> Vec<String> {
        self.peers.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn self_url(&self) -> Option<&str> {
        self.self_url.as_deref()
    }
}
