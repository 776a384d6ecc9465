//! Boot/reset orchestrator (C11, spec.md §4.11). A deterministic ladder:
//! architectural state to its power-on values, TLBs and the block arena
//! invalidated before anything can execute stale translations or code, then
//! every device reset in the order it was registered, then the CPU released
//! to fetch at the reset vector.

use crate::cpu::{Cpu, SegmentRegister, Segment, CR0_ET};
use crate::devices::Device;
use crate::jit::BlockStore;
use crate::tlb::Tlb;

/// Real-mode reset vector: CS selector 0xf000 (base 0xffff0000 is truncated to
/// 20 address lines as 0xf0000 on real hardware), IP 0xfff0 — the classic PC
/// "jump to the top of the BIOS ROM" reset entry point.
pub const RESET_CS_SELECTOR: u16 = 0xf000;
pub const RESET_CS_BASE: u32 = 0xf0000;
pub const RESET_EIP: u32 = 0xfff0;

/// Resets one CPU to its power-on architectural state (spec.md §4.11: "zero
/// every general and segment register; CR0 to its ET-only reset value; CS:EIP
/// to the reset vector").
pub fn reset_cpu(cpu: &mut Cpu) {
    *cpu = Cpu::new();
    cpu.cr0 = CR0_ET;
    cpu.load_segment(
        SegmentRegister::Cs,
        Segment {
            base: RESET_CS_BASE,
            limit_low: 0xffff,
            limit_high: 0,
            access: 0x9b,
            selector: RESET_CS_SELECTOR,
            checked: true,
        },
    );
    cpu.eip = RESET_EIP;
}

/// Runs the full cold-reset ladder: CPU state, then TLB/block-arena
/// invalidation (so nothing stale survives into the new CPU context), then
/// every device's `reset()` in the order given, matching spec.md §4.11's
/// "devices are reset in their registration order, not an inferred dependency
/// order."
pub fn cold_reset(cpu: &mut Cpu, tlb: &mut Tlb, blocks: &mut BlockStore, devices: &mut [Box<dyn Device>]) {
    reset_cpu(cpu);
    tlb.invalidate_all();
    *blocks = BlockStore::new();
    for device in devices.iter_mut() {
        device.reset();
    }
}

/// A warm reset (spec.md §4.11: triggered via keyboard controller output port
/// or CMOS shutdown byte) skips re-deriving NVRAM's stored configuration —
/// the CPU and caches are reset exactly as in a cold reset, but devices that
/// distinguish warm from cold (NVRAM battery-backed state) are not reset here;
/// callers reset only the devices that should lose state on a warm boot.
pub fn warm_reset(cpu: &mut Cpu, tlb: &mut Tlb, blocks: &mut BlockStore) {
    reset_cpu(cpu);
    tlb.invalidate_all();
    *blocks = BlockStore::new();
}
