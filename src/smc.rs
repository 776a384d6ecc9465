//! Self-modifying-code tracking (C5, spec.md §4.5). A page carrying compiled
//! blocks (`PageFlags::CODE_COVERED`) accumulates a dirty-granule bitmap as the
//! guest writes to it; [`check_flush`] is the *only* place that bitmap is
//! cleared, and it is also the only place a covered block is evicted for
//! writing underneath it. Anything else that touched the mask would make the
//! granule-dirty invariant unenforceable (spec.md §9).

use crate::jit::BlockStore;
use crate::memory::MemoryMap;

/// Intersects a just-emitted block's granule mask against the page's dirty
/// mask before the block is trusted to run (spec.md §8 scenario 1: a write
/// landing in a block's own byte range between emission and first execution
/// must not be missed). Returns `true` if the block's bytes have already been
/// modified and it must be discarded rather than entered.
pub fn dirty_since_emit(memory: &MemoryMap, page_no: u32, block_mask: u64) -> bool {
    memory
        .page(page_no)
        .map(|p| p.dirty_mask & block_mask != 0)
        .unwrap_or(false)
}

/// Called once per scheduler tick (or before re-entering a block) for every
/// page carrying coverage. Evicts every block whose granule range intersects
/// the page's dirty mask, then clears the mask — the single, centralized
/// place dirty state is retired (spec.md §4.5: "the dirty mask is cleared only
/// here, never by the write path itself").
pub fn check_flush(memory: &mut MemoryMap, blocks: &mut BlockStore, page_no: u32) {
    let (dirty, coverage) = match memory.page(page_no) {
        Some(p) if p.dirty_mask != 0 => (p.dirty_mask, p.coverage.clone()),
        _ => return,
    };

    for block_id in coverage {
        if let Some(block) = blocks.get(block_id) {
            let page_slot = block.pages.iter().position(|p| *p == Some(page_no));
            let intersects = page_slot
                .map(|slot| block.page_masks[slot] & dirty != 0)
                .unwrap_or(true);
            if intersects {
                for page in block.pages.iter().flatten() {
                    memory.remove_from_coverage(*page, block_id);
                }
                blocks.evict(block_id);
            }
        }
    }

    memory.page_mut(page_no).dirty_mask = 0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::{Block, BlockEnv};
    use crate::memory::OpSize;

    fn env() -> BlockEnv {
        BlockEnv {
            use32: true,
            stack32: true,
        }
    }

    fn block_on_page(page_no: u32, mask: u64) -> Block {
        Block {
            phys_start: page_no << crate::memory::PAGE_SHIFT,
            phys_end: (page_no << crate::memory::PAGE_SHIFT) + 16,
            virt_start: page_no << crate::memory::PAGE_SHIFT,
            env: env(),
            fpu_entered: false,
            mmx_entered: false,
            tos_known: true,
            pages: [Some(page_no), None],
            page_masks: [mask, 0],
            cycle_cost: 4,
            code: Vec::new(),
        }
    }

    #[test]
    fn write_inside_covered_granule_evicts_block_on_flush() {
        let mut memory = MemoryMap::new(0x10000);
        let mut blocks = BlockStore::new();
        let id = blocks.insert(block_on_page(0, 0b1), env()).unwrap();
        memory.mark_code_covered(0, id);

        memory.write_phys(0, OpSize::Byte, 0x90);
        assert!(memory.page(0).unwrap().dirty_mask & 0b1 != 0);

        check_flush(&mut memory, &mut blocks, 0);

        assert!(blocks.get(id).is_none());
        assert_eq!(memory.page(0).unwrap().dirty_mask, 0);
    }

    #[test]
    fn write_outside_covered_granule_survives_flush() {
        let mut memory = MemoryMap::new(0x10000);
        let mut blocks = BlockStore::new();
        let id = blocks.insert(block_on_page(0, 0b1), env()).unwrap();
        memory.mark_code_covered(0, id);

        // Write to granule 1, while the block only covers granule 0.
        memory.write_phys(crate::memory::GRANULE_SIZE, OpSize::Byte, 0x90);
        check_flush(&mut memory, &mut blocks, 0);

        assert!(blocks.get(id).is_some());
        assert_eq!(memory.page(0).unwrap().dirty_mask, 0);
    }
}
