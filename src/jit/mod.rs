//! Basic-block recompiler (C7, spec.md §4.7). The block graph — coverage lists,
//! hash buckets, per-page trees — is a multiply-connected pointer graph in the
//! original; per spec.md §9 ("pointer graphs become arenas") it is represented
//! here as an indexed arena with generation-tagged handles, so a stale
//! [`BlockId`] from before an eviction can never alias a newer block in the same
//! slot.

pub mod emitter;

use crate::error::ResourceExhausted;
use emitter::Emitter;
use std::collections::{BTreeMap, HashMap};

pub const BLOCK_CODE_CAP: usize = 1760;
pub const MAX_BLOCKS: usize = 4096;

/// A handle into the block arena: slot index plus a generation counter. Per
/// spec.md §9, this replaces the original's raw pointers so a dangling
/// reference to an evicted block can be detected rather than aliasing whatever
/// now occupies that slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BlockId {
    index: u32,
    generation: u32,
}

impl BlockId {
    pub fn new(index: u32, generation: u32) -> Self {
        BlockId { index, generation }
    }
}

/// Guest-side addressing context a block was emitted under; blocks are only
/// interchangeable across lookups when this matches (spec.md §4.7 lookup order:
/// "exact physical start and environment").
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct BlockEnv {
    pub use32: bool,
    pub stack32: bool,
}

/// An immutable, emitted basic block (spec.md §3 "code block").
#[derive(Clone)]
pub struct Block {
    pub phys_start: u32,
    pub phys_end: u32,
    pub virt_start: u32,
    pub env: BlockEnv,
    pub fpu_entered: bool,
    pub mmx_entered: bool,
    pub tos_known: bool,
    /// The two (at most) physical pages this block's bytes span.
    pub pages: [Option<u32>; 2],
    /// Per covered page, which 64-byte granules the block's bytes occupy.
    pub page_masks: [u64; 2],
    pub cycle_cost: i64,
    /// Host-emitted code. With the portable interpreter backend this is the
    /// pre-decoded instruction stream; a native backend would store machine
    /// code bytes instead (see [`emitter::Emitter`]).
    pub code: Vec<u8>,
}

struct Slot {
    block: Option<Block>,
    generation: u32,
}

/// Bounded arena of emitted blocks plus the hash/tree lookup structures used to
/// find them (spec.md §4.7 lookup order).
pub struct BlockStore {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    /// Hash table keyed on the low bits of the physical start address.
    hash: HashMap<(u32, BlockEnv), Vec<BlockId>>,
    /// Per-page binary search tree keyed on physical start, used to satisfy
    /// cross-CS aliasing lookups (spec.md §4.7 step 2). `BTreeMap` stands in for
    /// a hand-rolled tree, per spec.md §9's recommendation to prefer a standard
    /// BST over the fragile original deletion path.
    per_page_tree: HashMap<u32, BTreeMap<u32, Vec<BlockId>>>,
    lru_clock: u64,
    last_used: HashMap<u32, u64>,
}

impl BlockStore {
    pub fn new() -> Self {
        BlockStore {
            slots: Vec::new(),
            free_list: Vec::new(),
            hash: HashMap::new(),
            per_page_tree: HashMap::new(),
            lru_clock: 0,
            last_used: HashMap::new(),
        }
    }

    pub fn lookup(&mut self, phys_start: u32, env: BlockEnv) -> Option<BlockId> {
        if let Some(ids) = self.hash.get(&(phys_start, env)) {
            for &id in ids {
                if let Some(block) = self.get(id) {
                    if block.phys_start == phys_start && block.env == env {
                        self.touch(id);
                        return Some(id);
                    }
                }
            }
        }
        let page = phys_start >> crate::memory::PAGE_SHIFT;
        if let Some(tree) = self.per_page_tree.get(&page) {
            if let Some(ids) = tree.get(&phys_start) {
                for &id in ids {
                    if let Some(block) = self.get(id) {
                        if block.env == env {
                            self.touch(id);
                            return Some(id);
                        }
                    }
                }
            }
        }
        None
    }

    fn touch(&mut self, id: BlockId) {
        self.lru_clock += 1;
        self.last_used.insert(id.index, self.lru_clock);
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.block.as_ref())
    }

    /// Inserts a newly emitted block, evicting the least-recently-used block if
    /// the arena is full (spec.md §4.7 "Eviction... when the global block pool
    /// is exhausted (LRU)").
    pub fn insert(&mut self, block: Block, env: BlockEnv) -> Result<BlockId, ResourceExhausted> {
        let index = if let Some(index) = self.free_list.pop() {
            index
        } else if self.slots.len() < MAX_BLOCKS {
            self.slots.push(Slot {
                block: None,
                generation: 0,
            });
            (self.slots.len() - 1) as u32
        } else {
            let victim = self.lru_victim().ok_or(ResourceExhausted::BlockArenaExhausted)?;
            self.evict(victim);
            victim.index
        };
        let generation = self.slots[index as usize].generation + 1;
        let id = BlockId::new(index, generation);
        let phys_start = block.phys_start;
        let page = phys_start >> crate::memory::PAGE_SHIFT;
        self.slots[index as usize] = Slot {
            block: Some(block),
            generation,
        };
        self.hash.entry((phys_start, env)).or_default().push(id);
        self.per_page_tree
            .entry(page)
            .or_default()
            .entry(phys_start)
            .or_default()
            .push(id);
        self.touch(id);
        Ok(id)
    }

    fn lru_victim(&self) -> Option<BlockId> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.block.as_ref().map(|b| (i as u32, b, s.generation)))
            .min_by_key(|(i, _, _)| self.last_used.get(i).copied().unwrap_or(0))
            .map(|(i, _, g)| BlockId::new(i, g))
    }

    /// Removes a block from every index it is reachable from: the hash table,
    /// the per-page tree, and (by the caller, via the page table) its coverage
    /// lists — returning its slot to the free list.
    pub fn evict(&mut self, id: BlockId) {
        let block = match self.get(id).cloned() {
            Some(b) => b,
            None => return,
        };
        let env = block.env;
        if let Some(ids) = self.hash.get_mut(&(block.phys_start, env)) {
            ids.retain(|&x| x != id);
        }
        let page = block.phys_start >> crate::memory::PAGE_SHIFT;
        if let Some(tree) = self.per_page_tree.get_mut(&page) {
            if let Some(ids) = tree.get_mut(&block.phys_start) {
                ids.retain(|&x| x != id);
            }
        }
        if let Some(slot) = self.slots.get_mut(id.index as usize) {
            slot.block = None;
        }
        self.last_used.remove(&id.index);
        self.free_list.push(id.index);
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.block.is_some()).count()
    }
}

impl Default for BlockStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The generic, backend-agnostic block builder. It decides where a block ends
/// (control-flow change, page boundary, or the code-size cap) and hands the
/// guest bytes to whichever [`Emitter`] the caller configured — a native-code
/// backend or the portable interpreter fallback (spec.md §9 "host JIT is
/// replaceable").
pub struct BlockBuilder<'a, E: Emitter> {
    pub emitter: &'a mut E,
}

impl<'a, E: Emitter> BlockBuilder<'a, E> {
    pub fn new(emitter: &'a mut E) -> Self {
        BlockBuilder { emitter }
    }

    /// Terminates a block when the emitted-code buffer is close to its cap, per
    /// spec.md §4.7 ("reaching the host-code buffer threshold... also
    /// terminates").
    pub fn should_terminate_for_size(&self, emitted_len: usize) -> bool {
        emitted_len >= BLOCK_CODE_CAP
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_block(phys_start: u32) -> Block {
        Block {
            phys_start,
            phys_end: phys_start + 16,
            virt_start: phys_start,
            env: BlockEnv {
                use32: true,
                stack32: true,
            },
            fpu_entered: false,
            mmx_entered: false,
            tos_known: true,
            pages: [Some(phys_start >> crate::memory::PAGE_SHIFT), None],
            page_masks: [0xff, 0],
            cycle_cost: 4,
            code: Vec::new(),
        }
    }

    #[test]
    fn lookup_finds_inserted_block_by_hash() {
        let mut store = BlockStore::new();
        let env = BlockEnv {
            use32: true,
            stack32: true,
        };
        let id = store.insert(dummy_block(0x1000), env).unwrap();
        assert_eq!(store.lookup(0x1000, env), Some(id));
    }

    #[test]
    fn eviction_removes_from_every_index() {
        let mut store = BlockStore::new();
        let env = BlockEnv {
            use32: true,
            stack32: true,
        };
        let id = store.insert(dummy_block(0x2000), env).unwrap();
        store.evict(id);
        assert_eq!(store.lookup(0x2000, env), None);
        assert!(store.get(id).is_none());
    }

    #[test]
    fn stale_block_id_does_not_alias_new_occupant() {
        let mut store = BlockStore::new();
        let env = BlockEnv {
            use32: true,
            stack32: true,
        };
        let old = store.insert(dummy_block(0x3000), env).unwrap();
        store.evict(old);
        let new = store.insert(dummy_block(0x4000), env).unwrap();
        assert_eq!(old.index, new.index);
        assert_ne!(old.generation, new.generation);
        assert!(store.get(old).is_none());
        assert!(store.get(new).is_some());
    }
}
