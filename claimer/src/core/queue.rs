//! Work queue for one run, with base-game expansion and a cycle guard.
//!
//! Offers are processed in catalog order. An offer that reports
//! `requires-base-game` may be expanded once into `[base, offer]`; a second
//! request for the same offer (or a self-referencing base) is refused so the
//! queue always drains.

use std::collections::{HashSet, VecDeque};

use crate::core::types::Offer;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// Base queued first (unless already resolved), dependent retried after it.
    Queued,
    /// Offer was already expanded or its base is itself; resolve terminally.
    Exhausted,
}

#[derive(Debug, Clone, Default)]
pub struct ClaimQueue {
    pending: VecDeque<Offer>,
    expanded: HashSet<String>,
    resolved: HashSet<String>,
}

impl ClaimQueue {
    pub fn new(offers: Vec<Offer>) -> Self {
        Self {
            pending: offers.into(),
            ..Self::default()
        }
    }

    /// Next offer that has not been resolved during this run.
    pub fn next_offer(&mut self) -> Option<Offer> {
        while let Some(offer) = self.pending.pop_front() {
            if !self.resolved.contains(&offer.id) {
                return Some(offer);
            }
        }
        None
    }

    /// Record that `id` reached a terminal state this run.
    pub fn mark_resolved(&mut self, id: &str) {
        self.resolved.insert(id.to_string());
    }

    pub fn is_resolved(&self, id: &str) -> bool {
        self.resolved.contains(id)
    }

    /// True if `id` may still be expanded into `[base, offer]`.
    pub fn can_expand(&self, id: &str) -> bool {
        !self.expanded.contains(id)
    }

    /// Queue `base` ahead of a retry of `dependent`.
    pub fn requeue_after_base(&mut self, dependent: Offer, mut base: Offer) -> Requeue {
        if base.id == dependent.id || !self.expanded.insert(dependent.id.clone()) {
            return Requeue::Exhausted;
        }
        let base_pending = !self.resolved.contains(&base.id);
        self.pending.push_front(dependent.clone());
        if base_pending {
            base.base_of = Some(dependent.id);
            self.pending.push_front(base);
        }
        Requeue::Queued
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }
}
