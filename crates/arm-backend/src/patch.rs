//! Direct-link patch lists (§3, §4.4, §8 Scenario D).
//!
//! A patch site lives inside some owning block's compiled code and is, at
//! any moment, either *pending* (still jumping to the dispatcher fallback,
//! waiting on its target location to be compiled) or *applied* (rewritten
//! to jump straight into the target's code). Both lists are keyed by the
//! target location, not the owner, since that's the direction compilation
//! needs to walk ("after compiling a block for L, walk the pending list
//! for L").
//!
//! Neither backend literally patches machine-code bytes through this type
//! — a compiled block, native or interpreted, always returns to the shared
//! dispatch loop between blocks, which re-checks the block cache for
//! whatever location the guest landed on (DESIGN.md). This type is the
//! backend-agnostic bookkeeping both share: which owners are linked to
//! which targets, so invalidation can find and revert them even though the
//! "link" itself is just a cache hit rather than a rewritten jump.

use std::collections::HashMap;

/// One patch site: the block that contains it, keyed by its own location
/// so invalidation can tell the owner to re-check its outgoing link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchSite {
    pub owner: u64,
}

#[derive(Default)]
pub struct PatchLists {
    pending: HashMap<u64, Vec<PatchSite>>,
    applied: HashMap<u64, Vec<PatchSite>>,
}

impl PatchLists {
    pub fn new() -> PatchLists {
        PatchLists::default()
    }

    /// Registers `owner`'s outgoing direct link to `target` as pending
    /// (target not yet compiled).
    pub fn register_pending(&mut self, target: u64, owner: u64) {
        self.pending.entry(target).or_default().push(PatchSite { owner });
    }

    /// Moves every pending site for `target` to applied, returning the
    /// owners that just got linked (the caller patches/links each one).
    pub fn apply(&mut self, target: u64) -> Vec<u64> {
        let Some(sites) = self.pending.remove(&target) else { return Vec::new() };
        let owners: Vec<u64> = sites.iter().map(|site| site.owner).collect();
        self.applied.entry(target).or_default().extend(sites);
        owners
    }

    /// Reverts every applied site for `target` back to pending (the
    /// caller re-links each owner's site to jump to the epilog), used when
    /// `target` itself is invalidated.
    pub fn revert(&mut self, target: u64) -> Vec<u64> {
        let Some(sites) = self.applied.remove(&target) else { return Vec::new() };
        let owners: Vec<u64> = sites.iter().map(|site| site.owner).collect();
        self.pending.entry(target).or_default().extend(sites);
        owners
    }

    /// Drops every site owned by `owner` from every target's lists —
    /// called when `owner` itself is invalidated, so a stale owner key
    /// never gets relinked.
    pub fn forget_owner(&mut self, owner: u64) {
        for sites in self.pending.values_mut() {
            sites.retain(|site| site.owner != owner);
        }
        for sites in self.applied.values_mut() {
            sites.retain(|site| site.owner != owner);
        }
    }

    pub fn is_applied(&self, target: u64, owner: u64) -> bool {
        self.applied.get(&target).is_some_and(|sites| sites.iter().any(|site| site.owner == owner))
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.applied.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_moves_pending_sites_to_applied() {
        let mut patches = PatchLists::new();
        patches.register_pending(10, 1);
        patches.register_pending(10, 2);

        let linked = patches.apply(10);
        assert_eq!(linked, vec![1, 2]);
        assert!(patches.is_applied(10, 1));
        assert!(patches.is_applied(10, 2));
    }

    #[test]
    fn revert_moves_applied_sites_back_to_pending() {
        let mut patches = PatchLists::new();
        patches.register_pending(10, 1);
        patches.apply(10);

        let reverted = patches.revert(10);
        assert_eq!(reverted, vec![1]);
        assert!(!patches.is_applied(10, 1));

        let relinked = patches.apply(10);
        assert_eq!(relinked, vec![1]);
    }

    #[test]
    fn forget_owner_removes_it_from_every_list() {
        let mut patches = PatchLists::new();
        patches.register_pending(10, 1);
        patches.register_pending(20, 1);
        patches.apply(10);

        patches.forget_owner(1);
        assert!(!patches.is_applied(10, 1));
        assert_eq!(patches.apply(20), Vec::<u64>::new());
    }
}
