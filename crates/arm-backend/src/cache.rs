//! The three-level sparse block cache (§3: "memory proportional to blocks
//! actually used").
//!
//! `LocationRef::to_u64` packs PC in the low 32 bits and mode/thumb in the
//! high 32 bits, but only the high 6 bits of that top word are ever
//! non-zero (5-bit mode plus the T bit), so the meaningful key is 38 bits
//! wide. Three levels split it 13/13/12: level 0 and level 1 index into
//! `Box<[Option<Box<[...]>>]>` arrays allocated lazily on first use by a
//! key in their range, and level 2 is the leaf array actually holding `T`.

const LEVEL0_BITS: u32 = 13;
const LEVEL1_BITS: u32 = 13;
const LEVEL2_BITS: u32 = 12;

const LEVEL2_SIZE: usize = 1 << LEVEL2_BITS;
const LEVEL1_SIZE: usize = 1 << LEVEL1_BITS;
const LEVEL0_SIZE: usize = 1 << LEVEL0_BITS;

const LEVEL1_SHIFT: u32 = LEVEL2_BITS;
const LEVEL0_SHIFT: u32 = LEVEL2_BITS + LEVEL1_BITS;

const LEVEL2_MASK: u64 = (1 << LEVEL2_BITS) - 1;
const LEVEL1_MASK: u64 = (1 << LEVEL1_BITS) - 1;
const LEVEL0_MASK: u64 = (1 << LEVEL0_BITS) - 1;

type Leaf<T> = Box<[Option<T>; LEVEL2_SIZE]>;
type Mid<T> = Box<[Option<Leaf<T>>; LEVEL1_SIZE]>;

fn split(key: u64) -> (usize, usize, usize) {
    let l2 = (key & LEVEL2_MASK) as usize;
    let l1 = ((key >> LEVEL1_SHIFT) & LEVEL1_MASK) as usize;
    let l0 = ((key >> LEVEL0_SHIFT) & LEVEL0_MASK) as usize;
    (l0, l1, l2)
}

fn new_leaf<T>() -> Leaf<T> {
    Box::new(std::array::from_fn(|_| None))
}

/// A sparse array from a 38-bit packed [`arm_state::LocationRef`] key to a
/// `T` (compiled-block metadata). `get`/`insert`/`remove` by exact key;
/// `retain` walks every occupied slot for range invalidation.
pub struct BlockCache<T> {
    top: Vec<Option<Mid<T>>>,
}

impl<T> BlockCache<T> {
    pub fn new() -> BlockCache<T> {
        let mut top = Vec::with_capacity(LEVEL0_SIZE);
        top.resize_with(LEVEL0_SIZE, || None);
        BlockCache { top }
    }

    pub fn get(&self, key: u64) -> Option<&T> {
        let (l0, l1, l2) = split(key);
        self.top[l0].as_ref()?[l1].as_ref()?[l2].as_ref()
    }

    pub fn get_mut(&mut self, key: u64) -> Option<&mut T> {
        let (l0, l1, l2) = split(key);
        self.top[l0].as_mut()?[l1].as_mut()?[l2].as_mut()
    }

    pub fn insert(&mut self, key: u64, value: T) {
        let (l0, l1, l2) = split(key);
        let mid = self.top[l0].get_or_insert_with(|| Box::new(std::array::from_fn(|_| None)));
        let leaf = mid[l1].get_or_insert_with(new_leaf);
        leaf[l2] = Some(value);
    }

    pub fn remove(&mut self, key: u64) -> Option<T> {
        let (l0, l1, l2) = split(key);
        self.top[l0].as_mut()?[l1].as_mut()?[l2].take()
    }

    /// Drops every entry for which `keep` returns false, calling `on_remove`
    /// with the key and value first. Used by range/full invalidation.
    pub fn retain(&mut self, mut keep: impl FnMut(u64, &T) -> bool, mut on_remove: impl FnMut(u64, T)) {
        for (l0, mid) in self.top.iter_mut().enumerate() {
            let Some(mid) = mid else { continue };
            for (l1, leaf) in mid.iter_mut().enumerate() {
                let Some(leaf) = leaf else { continue };
                for (l2, slot) in leaf.iter_mut().enumerate() {
                    let Some(value) = slot else { continue };
                    let key = ((l0 as u64) << LEVEL0_SHIFT) | ((l1 as u64) << LEVEL1_SHIFT) | (l2 as u64);
                    if !keep(key, value) {
                        on_remove(key, slot.take().unwrap());
                    }
                }
            }
        }
    }

    pub fn clear(&mut self) {
        for slot in self.top.iter_mut() {
            *slot = None;
        }
    }
}

impl<T> Default for BlockCache<T> {
    fn default() -> BlockCache<T> {
        BlockCache::new()
    }
}

#[cfg(test)]
mod tests {
    use arm_state::{LocationRef, Mode};

    use super::*;

    #[test]
    fn insert_then_get_round_trips() {
        let mut cache = BlockCache::new();
        let key = LocationRef::new(0x0800_1234, Mode::Irq, true).to_u64();
        cache.insert(key, 42u32);
        assert_eq!(cache.get(key), Some(&42));
    }

    #[test]
    fn missing_key_is_none() {
        let cache: BlockCache<u32> = BlockCache::new();
        let key = LocationRef::new(4, Mode::User, false).to_u64();
        assert_eq!(cache.get(key), None);
    }

    #[test]
    fn remove_clears_the_slot() {
        let mut cache = BlockCache::new();
        let key = LocationRef::new(0x1000, Mode::Supervisor, false).to_u64();
        cache.insert(key, 7u32);
        assert_eq!(cache.remove(key), Some(7));
        assert_eq!(cache.get(key), None);
    }

    #[test]
    fn retain_drops_entries_outside_a_pc_range() {
        let mut cache = BlockCache::new();
        let inside = LocationRef::new(0x2000, Mode::User, false);
        let outside = LocationRef::new(0x9000, Mode::User, false);
        cache.insert(inside.to_u64(), 1u32);
        cache.insert(outside.to_u64(), 2u32);

        let mut removed = Vec::new();
        cache.retain(
            |key, _| {
                let pc = LocationRef::from_u64(key).pc();
                (0x1000..0x3000).contains(&pc)
            },
            |key, value| removed.push((key, value)),
        );

        assert_eq!(cache.get(inside.to_u64()), None);
        assert_eq!(cache.get(outside.to_u64()), Some(&2));
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].1, 1);
    }

    #[test]
    fn distinct_modes_at_the_same_pc_do_not_collide() {
        let mut cache = BlockCache::new();
        let arm = LocationRef::new(0x4000, Mode::User, false);
        let thumb = LocationRef::new(0x4000, Mode::User, true);
        cache.insert(arm.to_u64(), 1u32);
        cache.insert(thumb.to_u64(), 2u32);
        assert_eq!(cache.get(arm.to_u64()), Some(&1));
        assert_eq!(cache.get(thumb.to_u64()), Some(&2));
    }
}
