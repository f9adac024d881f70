//! Consistent-hash ring over the upstream membership.
//!
//! The ring is keyed by metric *name*, not the full identity tuple, so a
//! logical metric's global view lives on one node even across tag fan-out.
//! Membership changes rebuild the whole ring and publish it with an atomic
//! pointer swap; readers grab an immutable snapshot and are never blocked
//! by a rebuild.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tracing::warn;

use crate::metrics::stable_hash64;

/// Virtual tokens per member.
pub const DEFAULT_VNODES: usize = 160;

/// Seed for token points and lookup hashes. Every router in the cluster
/// must agree on it, so it is a crate constant.
const RING_SEED: u64 = 0x7361_6d6f_7661_7252;

/// One immutable ring generation.
#[derive(Debug, Default)]
pub struct RingSnapshot {
    members: Vec<String>,
    /// `(token point, index into members)`, sorted by point.
    tokens: Vec<(u64, u32)>,
}

impl RingSnapshot {
    fn build(mut members: Vec<String>, vnodes: usize) -> Self {
        members.sort_unstable();
        members.dedup();
        let mut tokens = Vec::with_capacity(members.len() * vnodes);
        for (index, member) in members.iter().enumerate() {
            #[allow(clippy::cast_possible_truncation)]
            for vnode in 0..vnodes {
                let point = stable_hash64(&format!("{member}#{vnode}"), RING_SEED);
                tokens.push((point, index as u32));
            }
        }
        tokens.sort_unstable();
        Self { members, tokens }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    /// The member owning the smallest token ≥ `hash(name)`, wrapping to the
    /// first token. Pure: the same name always maps to the same member
    /// within one snapshot.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&str> {
        if self.tokens.is_empty() {
            return None;
        }
        let point = stable_hash64(name, RING_SEED);
        let mut index = self.tokens.partition_point(|&(token, _)| token < point);
        if index == self.tokens.len() {
            index = 0;
        }
        let (_, member_index) = self.tokens[index];
        Some(self.members[member_index as usize].as_str())
    }

    #[must_use]
    pub fn members(&self) -> &[String] {
        &self.members
    }
}

/// Shared ring with lock-free reads against membership rebuilds.
pub struct HashRing {
    state: ArcSwap<RingSnapshot>,
    vnodes: usize,
}

impl Default for HashRing {
    fn default() -> Self {
        Self::new(DEFAULT_VNODES)
    }
}

impl HashRing {
    #[must_use]
    pub fn new(vnodes: usize) -> Self {
        Self {
            state: ArcSwap::from_pointee(RingSnapshot::default()),
            vnodes: vnodes.max(1),
        }
    }

    /// Captures the current snapshot; hold it across a stream to route
    /// every message of the stream against one membership generation.
    #[must_use]
    pub fn snapshot(&self) -> Arc<RingSnapshot> {
        self.state.load_full()
    }

    /// Routes a metric name against the current snapshot.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<String> {
        self.state.load().lookup(name).map(str::to_owned)
    }

    /// Current membership, sorted and deduplicated.
    #[must_use]
    pub fn members(&self) -> Vec<String> {
        self.state.load().members().to_vec()
    }

    /// Atomically replaces the ring with one built from `members`.
    ///
    /// An empty list is ignored and the previous ring retained: an empty
    /// discovery response is indistinguishable from a backend hiccup, and
    /// routing to nowhere loses a full interval of partials.
    pub fn set_members(&self, members: Vec<String>) -> bool {
        if members.is_empty() {
            warn!("ignoring empty membership update; keeping previous ring");
            return false;
        }
        let snapshot = RingSnapshot::build(members, self.vnodes);
        self.state.store(Arc::new(snapshot));
        true
    }
}
