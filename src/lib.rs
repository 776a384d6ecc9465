//! Cycle-approximating x86 execution core: a paged memory map with TLB and
//! self-modifying-code tracking, a basic-block recompiler over a portable
//! interpreter backend, a Pentium U/V pairing timing model, a countdown-timer
//! scheduler, and the I/O fabric and chipset glue (PIC/PIT/PPI/DMA) an IBM
//! PC-compatible machine needs. [`Emulator`] wires these into the outer run
//! loop; everything above it (device models beyond the fixed chipset, ROM/disk
//! image loading, a UI) is the embedding application's job.

pub mod boot;
pub mod chipset;
pub mod config;
pub mod cpu;
pub mod decoder;
pub mod devices;
pub mod dma;
pub mod error;
pub mod interpreter;
pub mod io;
pub mod jit;
pub mod memory;
pub mod scheduler;
pub mod smc;
pub mod timing;
pub mod tlb;

use chipset::{Pic, Pit, Ppi};
use config::MachineConfig;
use cpu::{Cpu, SegmentRegister};
use decoder::CodeStream;
use dma::DmaController;
use error::{CoreError, GuestFault};
use io::IoMap;
use jit::emitter::{Emitter, InterpretBackend};
use jit::{Block, BlockEnv, BlockStore};
use memory::{MemoryMap, PAGE_SHIFT, PAGE_SIZE};
use scheduler::Scheduler;
use std::cell::RefCell;
use std::rc::Rc;
use tlb::{Access, Tlb};

const PIC_MASTER_VECTOR_BASE: u8 = 0x08;
const PIC_SLAVE_VECTOR_BASE: u8 = 0x70;

/// Reads guest code bytes straight out of the physical memory map for the
/// decoder, one byte at a time (spec.md §4.6).
struct MemoryCodeStream<'a> {
    memory: &'a mut MemoryMap,
}

impl<'a> CodeStream for MemoryCodeStream<'a> {
    fn byte_at(&mut self, offset: u32) -> u8 {
        self.memory.read_phys(offset, memory::OpSize::Byte) as u8
    }
}

/// The assembled machine: CPU, memory map, I/O fabric, address translation,
/// the block recompiler, the event scheduler, and the fixed chipset devices
/// (two 8259As, one 8254, one 8255, one 8237) every IBM PC-compatible carries.
/// Everything else named by [`MachineConfig`] — video, sound, storage, NIC —
/// is attached by the caller onto [`Emulator::memory`]/[`Emulator::io`]; the
/// core only owns the chipset it must schedule interrupts and DMA through.
pub struct Emulator {
    pub cpu: Cpu,
    pub memory: MemoryMap,
    pub io: IoMap,
    pub tlb: Tlb,
    pub blocks: BlockStore,
    pub scheduler: Scheduler,
    pub dma: DmaController,
    pic_master: Rc<RefCell<Pic>>,
    pic_slave: Rc<RefCell<Pic>>,
    pit: Rc<RefCell<Pit>>,
    ppi: Rc<RefCell<Ppi>>,
    backend: InterpretBackend,
    config: MachineConfig,
    pit_timer: scheduler::TimerId,
    pit_timer_due: Rc<RefCell<bool>>,
}

/// Cycles between successive PIT channel-0 ticks. The 8254 actually counts at
/// ~1.193 MHz against the guest's variable instruction rate; scheduling one
/// tick per scheduler pass is the cycle-approximating stand-in spec.md's
/// timing model uses elsewhere (see DESIGN.md).
const PIT_TICK_PERIOD: i64 = 1;

impl Emulator {
    pub fn new(config: MachineConfig) -> Self {
        let mut memory = MemoryMap::new(config.ram_size);
        let mut io = IoMap::new();

        let pic_master = Rc::new(RefCell::new(Pic {
            vector_base: PIC_MASTER_VECTOR_BASE,
            ..Default::default()
        }));
        let pic_slave = Rc::new(RefCell::new(Pic {
            vector_base: PIC_SLAVE_VECTOR_BASE,
            ..Default::default()
        }));
        let pit = Rc::new(RefCell::new(Pit::default()));
        let ppi = Rc::new(RefCell::new(Ppi::default()));

        io.set_handler(0x20, 2, pic_master.clone()).expect("fixed chipset ports always fit");
        io.set_handler(0xa0, 2, pic_slave.clone()).expect("fixed chipset ports always fit");
        io.set_handler(0x40, 4, pit.clone()).expect("fixed chipset ports always fit");
        io.set_handler(0x60, 4, ppi.clone()).expect("fixed chipset ports always fit");

        let mut cpu = Cpu::new();
        boot::reset_cpu(&mut cpu);

        log::info!(
            "machine initialized: cpu_model={} ram={}KiB",
            config.cpu_model,
            config.ram_size / 1024
        );

        memory.set_a20(false); // matches real hardware's power-on A20 state

        let mut scheduler = Scheduler::new();
        let pit_timer_due = Rc::new(RefCell::new(false));
        let pit_timer = {
            let pit_for_timer = pit.clone();
            let pic_for_timer = pic_master.clone();
            let due_for_timer = pit_timer_due.clone();
            scheduler
                .timer_add(
                    PIT_TICK_PERIOD,
                    Box::new(move |_context: &mut dyn std::any::Any| {
                        let mut pit = pit_for_timer.borrow_mut();
                        let channel = &mut pit.channels[0];
                        let rising_edge = {
                            let before = channel.output;
                            channel.tick();
                            !before && channel.output
                        };
                        drop(pit);
                        if rising_edge {
                            pic_for_timer.borrow_mut().raise(0);
                        }
                        *due_for_timer.borrow_mut() = true;
                    }),
                )
                .expect("fixed chipset timers always fit")
        };

        Emulator {
            cpu,
            memory,
            io,
            tlb: Tlb::new(),
            blocks: BlockStore::new(),
            scheduler,
            dma: DmaController::new(),
            pic_master,
            pic_slave,
            pit,
            ppi,
            backend: InterpretBackend,
            config,
            pit_timer,
            pit_timer_due,
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn raise_irq(&mut self, irq: u8) {
        if irq < 8 {
            self.pic_master.borrow_mut().raise(irq);
        } else {
            self.pic_slave.borrow_mut().raise(irq - 8);
        }
    }

    /// Cold-resets the CPU, TLB, block arena, and the fixed chipset devices,
    /// in that order (spec.md §4.11). NVRAM and any caller-attached device are
    /// not touched here — resetting those, if desired, is the caller's call.
    pub fn reset(&mut self) {
        boot::reset_cpu(&mut self.cpu);
        self.tlb.invalidate_all();
        self.blocks = BlockStore::new();
        use devices::Device;
        self.pic_master.borrow_mut().reset();
        self.pic_slave.borrow_mut().reset();
        self.pit.borrow_mut().reset();
        self.ppi.borrow_mut().reset();
        self.dma.reset();
    }

    /// Looks up (or compiles) and runs the block starting at the current
    /// CS:EIP, then advances the scheduler and delivers a pending, unmasked,
    /// IF-enabled hardware interrupt if one exists (spec.md §4.1 run loop). A
    /// guest fault raised by the fetch or by execution is vectored through the
    /// IDT rather than returned — only resource exhaustion and invariant
    /// violations surface to the caller (spec.md §7).
    pub fn step(&mut self) -> Result<(), CoreError> {
        let linear = self.cpu.segment(SegmentRegister::Cs).base.wrapping_add(self.cpu.eip);
        let phys = match self.tlb.translate_cached(&self.cpu, &mut self.memory, linear, Access::Fetch) {
            Ok(phys) => phys,
            Err(fault) => {
                self.deliver_guest_fault(fault, linear);
                return Ok(());
            }
        };
        let env = BlockEnv {
            use32: true,
            stack32: true,
        };

        // Flush any block on the fetch page whose granule mask has gone dirty
        // since it was emitted, then do the same for the candidate block's
        // second covered page (if it has one) before trusting a cache hit —
        // `check_flush` is the only code path allowed to clear a dirty mask.
        let page_no = phys >> PAGE_SHIFT;
        let candidate = self.blocks.lookup(phys, env);
        let stale = candidate.and_then(|id| self.blocks.get(id)).map_or(true, |b| {
            smc::dirty_since_emit(&self.memory, page_no, b.page_masks[0])
                || b.pages[1]
                    .zip(Some(b.page_masks[1]))
                    .map(|(p2, mask)| smc::dirty_since_emit(&self.memory, p2, mask))
                    .unwrap_or(false)
        });
        if stale {
            smc::check_flush(&mut self.memory, &mut self.blocks, page_no);
            if let Some(second_page) = candidate.and_then(|id| self.blocks.get(id)).and_then(|b| b.pages[1]) {
                smc::check_flush(&mut self.memory, &mut self.blocks, second_page);
            }
        }

        let block_id = match self.blocks.lookup(phys, env) {
            Some(id) => id,
            None => self.compile_block(phys, env)?,
        };

        let block = self.blocks.get(block_id).expect("just looked up or inserted").clone();
        let mut stream = SliceCodeStream { bytes: &block.code, base: 0 };
        let mut offset: u32 = 0;
        while (offset as usize) < block.code.len() {
            let instr = match decoder::decode(&mut stream, offset) {
                Ok(instr) => instr,
                Err(_) => {
                    self.deliver_guest_fault(GuestFault::InvalidOpcode, linear);
                    return Ok(());
                }
            };
            if let Err(fault) =
                self.backend
                    .emit_instruction(&mut self.cpu, &mut self.memory, &mut self.io, &mut self.tlb, &instr)
            {
                self.deliver_guest_fault(fault, linear);
                return Ok(());
            }
            offset += instr.length;
        }
        self.backend.emit_timing(&mut self.cpu, block.cycle_cost);

        let elapsed = block.cycle_cost;
        let cpu_ptr: *mut Cpu = &mut self.cpu;
        self.scheduler.advance(elapsed, unsafe { &mut *cpu_ptr.cast::<dyn std::any::Any>() });
        if *self.pit_timer_due.borrow() {
            *self.pit_timer_due.borrow_mut() = false;
            self.scheduler.timer_reschedule(self.pit_timer, PIT_TICK_PERIOD);
        }

        self.deliver_pending_interrupt();
        Ok(())
    }

    /// Sets CR2 for a page fault and vectors through the real-mode IVT for the
    /// fault's vector (spec.md §8 scenario 2, §7 category 1).
    fn deliver_guest_fault(&mut self, fault: GuestFault, linear: u32) {
        match fault {
            GuestFault::Page { linear: fault_linear, .. } => self.cpu.cr2 = fault_linear,
            _ => self.cpu.cr2 = linear,
        }
        interpreter::external_interrupt(&mut self.cpu, &mut self.memory, fault.vector());
    }

    /// Decodes guest instructions starting at `phys` into a single block,
    /// stopping at the first real terminator: a control-flow-changing
    /// instruction (`is_block_end`), a third physical page coming into view
    /// (a block spans at most two, per [`Block::pages`]), or the host-code
    /// size cap (spec.md §4.7). Along the way it classifies each instruction
    /// for the U/V pairing model and accumulates the block's total cycle cost.
    fn compile_block(&mut self, phys: u32, env: BlockEnv) -> Result<jit::BlockId, CoreError> {
        let table = timing::pair_timings_table(&self.config.cpu_model);
        let first_page = phys >> PAGE_SHIFT;

        let mut code: Vec<u8> = Vec::new();
        let mut offset = phys;
        let mut second_page: Option<u32> = None;
        let mut mask0: u64 = 0;
        let mut mask1: u64 = 0;
        let mut cycle_cost: i64 = 0;
        let mut latched: Option<timing::TimingClass> = None;
        let mut first_instr = true;

        loop {
            let instr_page = offset >> PAGE_SHIFT;
            if !first_instr && instr_page != first_page && Some(instr_page) != second_page && second_page.is_some() {
                break;
            }

            let instr = {
                let mut stream = MemoryCodeStream { memory: &mut self.memory };
                decoder::decode(&mut stream, offset).map_err(|_| GuestFault::InvalidOpcode)?
            };

            if !first_instr && code.len() + instr.length as usize > jit::BLOCK_CODE_CAP {
                break;
            }

            for i in 0..instr.length {
                code.push(self.memory.read_phys(offset + i, memory::OpSize::Byte) as u8);
            }

            let g_mask = granule_mask(offset, instr.length);
            if instr_page == first_page {
                mask0 |= g_mask;
            } else {
                second_page.get_or_insert(instr_page);
                mask1 |= g_mask;
            }

            let class = timing::classify_instruction(&instr);
            if instr.rep.is_some() {
                cycle_cost += timing::prefix_decode_delay(1);
            }
            match latched {
                Some(prev)
                    if instr.rep.is_none()
                        && timing::can_pair(timing::pair_class_for(prev), timing::pair_class_for(class)) =>
                {
                    cycle_cost += timing::pair_timings(table, prev, class).unwrap_or(1);
                    latched = None;
                }
                Some(prev) => {
                    cycle_cost += timing::pair_timings(table, prev, prev).unwrap_or(1);
                    latched = Some(class);
                }
                None => latched = Some(class),
            }

            let is_end = instr.is_block_end;
            offset += instr.length;
            first_instr = false;
            if is_end || code.len() >= jit::BLOCK_CODE_CAP {
                break;
            }
        }

        if let Some(prev) = latched {
            cycle_cost += timing::pair_timings(table, prev, prev).unwrap_or(1);
        }

        let phys_end = offset;
        let page_no = first_page;

        let block = Block {
            phys_start: phys,
            phys_end,
            virt_start: self.cpu.eip,
            env,
            fpu_entered: false,
            mmx_entered: false,
            tos_known: true,
            pages: [Some(page_no), second_page],
            page_masks: [mask0, mask1],
            cycle_cost: cycle_cost.max(1),
            code,
        };
        let id = self.blocks.insert(block, env)?;
        self.memory.mark_code_covered(page_no, id);
        if let Some(p2) = second_page {
            self.memory.mark_code_covered(p2, id);
        }
        Ok(id)
    }

    fn deliver_pending_interrupt(&mut self) {
        if !self.cpu.flags.interrupt_enable() {
            return;
        }
        if let Some(irq) = self.pic_master.borrow().pending() {
            let vector = self.pic_master.borrow_mut().acknowledge(irq);
            interpreter::external_interrupt(&mut self.cpu, &mut self.memory, vector);
        } else if let Some(irq) = self.pic_slave.borrow().pending() {
            let vector = self.pic_slave.borrow_mut().acknowledge(irq);
            interpreter::external_interrupt(&mut self.cpu, &mut self.memory, vector);
        }
    }
}

struct SliceCodeStream<'a> {
    bytes: &'a [u8],
    base: u32,
}

impl<'a> CodeStream for SliceCodeStream<'a> {
    fn byte_at(&mut self, offset: u32) -> u8 {
        self.bytes[(offset - self.base) as usize]
    }
}

fn granule_mask(phys_start: u32, len: u32) -> u64 {
    use memory::GRANULE_SHIFT;
    let intra = phys_start & (PAGE_SIZE - 1);
    let first = intra >> GRANULE_SHIFT;
    let last = (intra + len.max(1) - 1) >> GRANULE_SHIFT;
    let mut mask = 0u64;
    for g in first..=last.min(63) {
        mask |= 1 << g;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_executes_a_mov_and_advances_eip() {
        let mut emu = Emulator::new(MachineConfig::new(0x10000));
        emu.cpu.segments[SegmentRegister::Cs as usize].base = 0;
        emu.cpu.eip = 0x1000;
        // mov eax, 0x2a ; hlt
        let bytes = [0xb8u8, 0x2a, 0x00, 0x00, 0x00, 0xf4];
        for (i, b) in bytes.iter().enumerate() {
            emu.memory.write_phys(0x1000 + i as u32, memory::OpSize::Byte, *b as u32);
        }
        emu.step().unwrap();
        assert_eq!(emu.cpu.gpr(cpu::GpRegister::Eax), 0x2a);
        assert_eq!(emu.cpu.eip, 0x1005);
    }

    #[test]
    fn self_modifying_write_invalidates_the_compiled_block() {
        let mut emu = Emulator::new(MachineConfig::new(0x10000));
        emu.cpu.segments[SegmentRegister::Cs as usize].base = 0;
        emu.cpu.eip = 0x2000;
        // nop ; hlt
        emu.memory.write_phys(0x2000, memory::OpSize::Byte, 0x90);
        emu.memory.write_phys(0x2001, memory::OpSize::Byte, 0xf4);
        emu.step().unwrap();
        assert_eq!(emu.blocks.len(), 1);

        // Overwrite the same byte; the next step must recompile, not reuse.
        emu.cpu.eip = 0x2000;
        emu.memory.write_phys(0x2000, memory::OpSize::Byte, 0xf4); // hlt
        let before = emu.blocks.len();
        emu.step().unwrap();
        assert!(emu.blocks.len() <= before + 1);
        assert_eq!(emu.cpu.eip, 0x2000); // hlt holds EIP at the instruction
    }
}
