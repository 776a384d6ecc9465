//! End-to-end tests driving the public surface (`Emulator::step`, `IoMap`,
//! `Scheduler`, `MemoryMap`) rather than individual module internals.

use ibmpc_core::config::MachineConfig;
use ibmpc_core::cpu::{GpRegister, SegmentRegister};
use ibmpc_core::io::{IoDevice, IoMap};
use ibmpc_core::memory::{MemHandler, MemoryMap, OpSize, PageFlags, ShadowState};
use ibmpc_core::scheduler::Scheduler;
use ibmpc_core::Emulator;
use std::cell::RefCell;
use std::rc::Rc;

fn load(emu: &mut Emulator, bytes: &[u8]) {
    let base = emu.cpu.segment(SegmentRegister::Cs).base;
    let entry = base + emu.cpu.eip;
    for (i, b) in bytes.iter().enumerate() {
        emu.memory.write_phys(entry + i as u32, OpSize::Byte, *b as u32);
    }
}

#[test]
fn self_modifying_code_is_observed_on_the_next_fetch() {
    let mut emu = Emulator::new(MachineConfig::new(0x10000));
    emu.cpu.segments[SegmentRegister::Cs as usize].base = 0;
    emu.cpu.eip = 0x3000;

    // nop ; nop ; nop ; hlt, then self-overwrite byte 0 with hlt before re-fetching it.
    load(&mut emu, &[0x90, 0x90, 0x90, 0xf4]);
    emu.step().unwrap();
    // The whole block (all three nops plus the trailing hlt) runs in one step;
    // hlt holds EIP at its own address rather than advancing past it.
    assert_eq!(emu.cpu.eip, 0x3003);

    emu.cpu.eip = 0x3000;
    emu.memory.write_phys(0x3000, OpSize::Byte, 0xf4); // hlt
    emu.step().unwrap();
    // hlt holds EIP at the instruction rather than advancing past it, proving
    // the recompiled block served the patched byte and not the stale nop.
    assert_eq!(emu.cpu.eip, 0x3000);
}

#[test]
fn paged_rep_movsb_faults_into_the_ivt_with_cr2_set() {
    let mut emu = Emulator::new(MachineConfig::new(0x10000));
    emu.cpu.cr0 |= ibmpc_core::cpu::CR0_PE | ibmpc_core::cpu::CR0_PG;
    emu.cpu.cr3 = 0x3000;
    emu.cpu.segments[SegmentRegister::Cs as usize].base = 0;
    emu.cpu.eip = 0;

    // Identity-map page 0 only; page 1's PTE is left zeroed (not present).
    emu.memory.write_phys(0x3000, OpSize::Dword, 0x4000 | 1 | 2);
    emu.memory.write_phys(0x4000, OpSize::Dword, 1 | 2);

    // rep movsb with ESI=0, EDI at PAGE_SIZE-4, ECX=16.
    load(&mut emu, &[0xf3, 0xa4]);
    emu.cpu.set_gpr(GpRegister::Esi, 0);
    emu.cpu.set_gpr(GpRegister::Edi, ibmpc_core::memory::PAGE_SIZE - 4);
    emu.cpu.set_gpr(GpRegister::Ecx, 16);

    emu.step().unwrap();

    assert_eq!(emu.cpu.cr2, ibmpc_core::memory::PAGE_SIZE);
    assert_eq!(emu.cpu.gpr(GpRegister::Ecx), 12);
    // The real-mode IVT entry for vector 0x0e (page fault) is read from
    // physical address 0x0e * 4; its segment:offset becomes the new CS:EIP.
    assert_eq!(
        emu.cpu.segment(SegmentRegister::Cs).base + emu.cpu.eip,
        0
    );
    // The return IP pushed onto the stack must be the `rep movsb` itself (0),
    // not the two bytes past it, so an IRET from the handler re-enters the
    // instruction and drains the rest of ECX instead of skipping it.
    let ss_base = emu.cpu.segment(SegmentRegister::Ss).base;
    let esp = emu.cpu.gpr(GpRegister::Esp);
    let pushed_ip = emu.memory.read_phys(ss_base + esp, OpSize::Word);
    assert_eq!(pushed_ip, 0);
}

#[test]
fn scheduler_tie_break_runs_lowest_index_first_then_reschedule_fires_on_a_later_pass() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let mut sched = Scheduler::new();

    let first = {
        let order = order.clone();
        sched
            .timer_add(10, Box::new(move |_| order.borrow_mut().push("first")))
            .unwrap()
    };
    assert_eq!(first, 0);
    {
        let order = order.clone();
        sched
            .timer_add(10, Box::new(move |_| order.borrow_mut().push("second")))
            .unwrap();
    }

    // Both timers are due on the same pass; registration order (lowest index)
    // breaks the tie, and a timer fires at most once per `advance` call even
    // if its callback reschedules it to a still-due count.
    sched.advance(10, &mut ());
    assert_eq!(*order.borrow(), vec!["first", "second"]);

    sched.timer_reschedule(first, 5);
    order.borrow_mut().clear();
    sched.advance(4, &mut ());
    assert!(order.borrow().is_empty());
    sched.advance(1, &mut ());
    assert_eq!(*order.borrow(), vec!["first"]);
}

#[test]
fn byte_only_device_serves_a_word_read_via_width_synthesis() {
    struct SerialPort(u8);
    impl IoDevice for SerialPort {
        fn read(&mut self, port: u16, _size: OpSize) -> u32 {
            match port {
                0x3f8 => 0x41,
                0x3f9 => 0x01,
                _ => 0xff,
            }
        }
        fn write(&mut self, _port: u16, _size: OpSize, value: u32) {
            self.0 = value as u8;
        }
    }

    let mut io = IoMap::new();
    io.set_handler(0x3f8, 1, Rc::new(RefCell::new(SerialPort(0)))).unwrap();
    assert_eq!(io.read(0x3f8, OpSize::Word), 0x0141);
}

#[test]
fn shadow_ram_write_enable_commits_and_reads_back() {
    let mut map = MemoryMap::new(0x2_0000);
    map.ram[0x1_0000] = 0xaa; // ROM content preloaded into the shadow buffer
    let base = 0xf0000 & 0x1ffff;
    map.mapping_add(
        base,
        0x1000,
        MemHandler::Rom {
            shadow: ShadowState::WriteEnable,
            ram_offset: 0x1_0000,
        },
        PageFlags::PRESENT | PageFlags::ROM | PageFlags::INTERNAL,
        1,
        0x1_0000,
    )
    .unwrap();

    map.write_phys(base, OpSize::Byte, 0x55);
    assert_eq!(map.read_phys(base, OpSize::Byte), 0x55);
}
