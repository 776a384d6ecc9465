//! The host back-end abstraction (spec.md §9: "host JIT is replaceable"). The
//! generic block builder only ever calls through this trait, so a portable
//! interpreter-only build is possible and the SMC invariants hold regardless of
//! which backend is in use.
//!
//! Only [`InterpretBackend`] is provided here. A native code-emitting backend
//! (register allocation, call-site offsets for GPF/exit stubs) is host-specific
//! per spec.md §4.7/§9 and out of this delivery's scope — see DESIGN.md.

use crate::cpu::Cpu;
use crate::decoder::DecodedInstruction;
use crate::error::GuestFault;
use crate::interpreter;
use crate::io::IoMap;
use crate::memory::MemoryMap;
use crate::tlb::Tlb;

/// Operations the generic block builder needs from a host back-end. A real
/// native-code emitter would translate each call into host instructions; the
/// interpreter fallback just executes the guest instruction directly.
pub trait Emitter {
    /// Emits (or, for the interpreter backend, immediately executes) one
    /// decoded instruction as part of the block currently being built.
    fn emit_instruction(
        &mut self,
        cpu: &mut Cpu,
        memory: &mut MemoryMap,
        io: &mut IoMap,
        tlb: &mut Tlb,
        instruction: &DecodedInstruction,
    ) -> Result<(), GuestFault>;

    /// Emits the timing-model cycle debit for one instruction (spec.md §4.8).
    fn emit_timing(&mut self, cpu: &mut Cpu, cost: i64);
}

/// Executes guest instructions directly rather than emitting native code. This
/// is the backend used by the portable build and by every test in this crate;
/// a native backend plugs in behind the same trait without the generic block
/// builder or the SMC/TLB invariants changing.
#[derive(Default)]
pub struct InterpretBackend;

impl Emitter for InterpretBackend {
    fn emit_instruction(
        &mut self,
        cpu: &mut Cpu,
        memory: &mut MemoryMap,
        io: &mut IoMap,
        tlb: &mut Tlb,
        instruction: &DecodedInstruction,
    ) -> Result<(), GuestFault> {
        interpreter::execute(cpu, memory, io, tlb, instruction)
    }

    fn emit_timing(&mut self, cpu: &mut Cpu, cost: i64) {
        cpu.cycles_remaining -= cost;
    }
}
