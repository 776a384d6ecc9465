//! Decoded-instruction execution (C6, spec.md §4.6). Also doubles as the
//! portable [`crate::jit::emitter::InterpretBackend`]'s execution engine.
//!
//! Convention: `execute` is called with `cpu.eip` already pointing at the start
//! of `instruction`, and it owns every update to `cpu.eip` — straight-line code
//! advances it by `instruction.length` itself rather than leaving that to the
//! caller, so branch/call/return instructions can just set `cpu.eip` to the
//! target without the caller double-applying the fallthrough advance.

use crate::cpu::flags::OpKind;
use crate::cpu::{Cpu, GpRegister, OperandSize, SegmentRegister};
use crate::decoder::{AluOp, Cond, DecodedInstruction, EffectiveAddress, LoopKind, Op, RepKind, RmOperand, StringOp};
use crate::error::GuestFault;
use crate::io::IoMap;
use crate::memory::{MemoryMap, OpSize};
use crate::tlb::{Access, Tlb};

fn to_mem_size(size: OperandSize) -> OpSize {
    match size {
        OperandSize::Byte => OpSize::Byte,
        OperandSize::Word => OpSize::Word,
        OperandSize::Dword => OpSize::Dword,
    }
}

fn linear_of(cpu: &Cpu, ea: &EffectiveAddress) -> u32 {
    let mut addr = ea.disp as u32;
    if let Some(base) = ea.base {
        addr = addr.wrapping_add(cpu.gpr(base));
    }
    if let Some((index, scale)) = ea.index {
        addr = addr.wrapping_add(cpu.gpr(index) << scale);
    }
    cpu.segment(ea.segment).base.wrapping_add(addr)
}

fn read_rm(cpu: &Cpu, memory: &mut MemoryMap, rm: &RmOperand, size: OperandSize) -> u32 {
    match rm {
        RmOperand::Register(reg) => read_reg(cpu, *reg, size),
        RmOperand::Memory(ea) => memory.read_phys(linear_of(cpu, ea), to_mem_size(size)),
    }
}

fn write_rm(cpu: &mut Cpu, memory: &mut MemoryMap, rm: &RmOperand, size: OperandSize, value: u32) {
    match rm {
        RmOperand::Register(reg) => write_reg(cpu, *reg, size, value),
        RmOperand::Memory(ea) => {
            let addr = linear_of(cpu, ea);
            memory.write_phys(addr, to_mem_size(size), value);
        }
    }
}

fn read_reg(cpu: &Cpu, reg: GpRegister, size: OperandSize) -> u32 {
    match size {
        OperandSize::Byte => cpu.gpr8_low(reg) as u32,
        OperandSize::Word => cpu.gpr16(reg) as u32,
        OperandSize::Dword => cpu.gpr(reg),
    }
}

fn write_reg(cpu: &mut Cpu, reg: GpRegister, size: OperandSize, value: u32) {
    match size {
        OperandSize::Byte => cpu.set_gpr8_low(reg, value as u8),
        OperandSize::Word => cpu.set_gpr16(reg, value as u16),
        OperandSize::Dword => cpu.set_gpr(reg, value),
    }
}

fn push(cpu: &mut Cpu, memory: &mut MemoryMap, value: u32) {
    let esp = cpu.gpr(GpRegister::Esp).wrapping_sub(4);
    cpu.set_gpr(GpRegister::Esp, esp);
    let addr = cpu.segment(SegmentRegister::Ss).base.wrapping_add(esp);
    memory.write_phys(addr, OpSize::Dword, value);
}

fn pop(cpu: &mut Cpu, memory: &mut MemoryMap) -> u32 {
    let esp = cpu.gpr(GpRegister::Esp);
    let addr = cpu.segment(SegmentRegister::Ss).base.wrapping_add(esp);
    let value = memory.read_phys(addr, OpSize::Dword);
    cpu.set_gpr(GpRegister::Esp, esp.wrapping_add(4));
    value
}

fn push16(cpu: &mut Cpu, memory: &mut MemoryMap, value: u16) {
    let esp = cpu.gpr16(GpRegister::Esp).wrapping_sub(2);
    cpu.set_gpr16(GpRegister::Esp, esp);
    let addr = cpu.segment(SegmentRegister::Ss).base.wrapping_add(esp as u32);
    memory.write_phys(addr, OpSize::Word, value as u32);
}

fn pop16(cpu: &mut Cpu, memory: &mut MemoryMap) -> u16 {
    let esp = cpu.gpr16(GpRegister::Esp);
    let addr = cpu.segment(SegmentRegister::Ss).base.wrapping_add(esp as u32);
    let value = memory.read_phys(addr, OpSize::Word) as u16;
    cpu.set_gpr16(GpRegister::Esp, esp.wrapping_add(2));
    value
}

fn alu_apply(cpu: &mut Cpu, op: AluOp, size: OperandSize, dst: u32, src: u32) -> Option<u32> {
    let (kind, result): (OpKind, u32) = match op {
        AluOp::Add => (OpKind::Add, dst.wrapping_add(src)),
        AluOp::Or => (OpKind::Or, dst | src),
        AluOp::Adc => {
            let carry_in = cpu.flags.carry() as u32;
            (OpKind::Add, dst.wrapping_add(src).wrapping_add(carry_in))
        }
        AluOp::Sbb => {
            let borrow_in = cpu.flags.carry() as u32;
            (OpKind::Sub, dst.wrapping_sub(src).wrapping_sub(borrow_in))
        }
        AluOp::And => (OpKind::And, dst & src),
        AluOp::Sub => (OpKind::Sub, dst.wrapping_sub(src)),
        AluOp::Xor => (OpKind::Xor, dst ^ src),
        AluOp::Cmp => (OpKind::Cmp, dst.wrapping_sub(src)),
    };
    cpu.flags.stamp(kind, dst, src, result, size);
    if matches!(op, AluOp::Cmp) {
        None
    } else {
        Some(size.mask(result))
    }
}

fn cond_holds(cpu: &mut Cpu, cond: Cond) -> bool {
    match cond {
        Cond::O => cpu.flags.overflow(),
        Cond::No => !cpu.flags.overflow(),
        Cond::B => cpu.flags.carry(),
        Cond::Ae => !cpu.flags.carry(),
        Cond::E => cpu.flags.zero(),
        Cond::Ne => !cpu.flags.zero(),
        Cond::Be => cpu.flags.carry() || cpu.flags.zero(),
        Cond::A => !cpu.flags.carry() && !cpu.flags.zero(),
        Cond::S => cpu.flags.sign(),
        Cond::Ns => !cpu.flags.sign(),
        Cond::P => cpu.flags.parity(),
        Cond::Np => !cpu.flags.parity(),
        Cond::L => cpu.flags.sign() != cpu.flags.overflow(),
        Cond::Ge => cpu.flags.sign() == cpu.flags.overflow(),
        Cond::Le => cpu.flags.zero() || cpu.flags.sign() != cpu.flags.overflow(),
        Cond::G => !cpu.flags.zero() && cpu.flags.sign() == cpu.flags.overflow(),
    }
}

/// Reads the real-mode interrupt vector table entry for `vector` (CS:IP packed
/// as two words at physical address `vector * 4`); protected-mode IDT gate
/// delivery is out of scope for this core (see DESIGN.md).
fn read_ivt_entry(memory: &mut MemoryMap, vector: u8) -> (u16, u16) {
    let addr = (vector as u32) * 4;
    let ip = memory.read_phys(addr, OpSize::Word) as u16;
    let cs = memory.read_phys(addr + 2, OpSize::Word) as u16;
    (ip, cs)
}

fn string_step(cpu: &Cpu, forward: bool, size: OperandSize) -> u32 {
    let step = size.bits() / 8;
    if forward {
        step
    } else {
        0u32.wrapping_sub(step)
    }
}

/// String operations route their data accesses through the TLB (unlike plain
/// ALU/MOV operand accesses, which treat the linear address as physical — see
/// DESIGN.md): this is the path spec.md §8 scenario 2 exercises, where a
/// `rep movsb` crossing into a not-present page must fault with CR2 at the
/// first unmapped destination byte and ECX holding the count still
/// outstanding.
fn run_string_op(
    cpu: &mut Cpu,
    memory: &mut MemoryMap,
    tlb: &mut Tlb,
    instr: &DecodedInstruction,
    kind: StringOp,
) -> Result<(), GuestFault> {
    let forward = !cpu.flags.direction();
    let step = string_step(cpu, forward, instr.size);
    let repeated = instr.rep.is_some();

    loop {
        if repeated && cpu.gpr(GpRegister::Ecx) == 0 {
            break;
        }
        let esi = cpu.gpr(GpRegister::Esi);
        let edi = cpu.gpr(GpRegister::Edi);
        let src_linear = cpu.segment(SegmentRegister::Ds).base.wrapping_add(esi);
        let dst_linear = cpu.segment(SegmentRegister::Es).base.wrapping_add(edi);
        let size = to_mem_size(instr.size);
        let needs_src = matches!(kind, StringOp::Movs | StringOp::Lods | StringOp::Cmps);
        let needs_dst = matches!(kind, StringOp::Movs | StringOp::Stos | StringOp::Cmps | StringOp::Scas);
        let src_addr = if needs_src {
            tlb.translate_cached(cpu, memory, src_linear, Access::Read)?
        } else {
            src_linear
        };
        let dst_addr = if needs_dst {
            let access = if matches!(kind, StringOp::Cmps | StringOp::Scas) {
                Access::Read
            } else {
                Access::Write
            };
            tlb.translate_cached(cpu, memory, dst_linear, access)?
        } else {
            dst_linear
        };

        match kind {
            StringOp::Movs => {
                let v = memory.read_phys(src_addr, size);
                memory.write_phys(dst_addr, size, v);
                cpu.set_gpr(GpRegister::Esi, esi.wrapping_add(step));
                cpu.set_gpr(GpRegister::Edi, edi.wrapping_add(step));
            }
            StringOp::Stos => {
                let v = read_reg(cpu, GpRegister::Eax, instr.size);
                memory.write_phys(dst_addr, size, v);
                cpu.set_gpr(GpRegister::Edi, edi.wrapping_add(step));
            }
            StringOp::Lods => {
                let v = memory.read_phys(src_addr, size);
                write_reg(cpu, GpRegister::Eax, instr.size, v);
                cpu.set_gpr(GpRegister::Esi, esi.wrapping_add(step));
            }
            StringOp::Cmps => {
                let a = memory.read_phys(src_addr, size);
                let b = memory.read_phys(dst_addr, size);
                cpu.flags.stamp(OpKind::Cmp, a, b, a.wrapping_sub(b), instr.size);
                cpu.set_gpr(GpRegister::Esi, esi.wrapping_add(step));
                cpu.set_gpr(GpRegister::Edi, edi.wrapping_add(step));
            }
            StringOp::Scas => {
                let acc = read_reg(cpu, GpRegister::Eax, instr.size);
                let m = memory.read_phys(dst_addr, size);
                cpu.flags.stamp(OpKind::Cmp, acc, m, acc.wrapping_sub(m), instr.size);
                cpu.set_gpr(GpRegister::Edi, edi.wrapping_add(step));
            }
        }

        if repeated {
            let ecx = cpu.gpr(GpRegister::Ecx).wrapping_sub(1);
            cpu.set_gpr(GpRegister::Ecx, ecx);
            if matches!(kind, StringOp::Cmps | StringOp::Scas) {
                let rep_while_equal = matches!(instr.rep, Some(RepKind::Rep));
                if rep_while_equal != cpu.flags.zero() {
                    break;
                }
            }
            if ecx == 0 {
                break;
            }
        } else {
            break;
        }
    }
    Ok(())
}

/// Vectors an external (hardware) interrupt the same way `INT n` does: push
/// FLAGS/CS/IP, clear IF/TF, and load CS:IP from the real-mode IVT entry for
/// `vector`. Called by the outer run loop between instructions when a PIC has
/// a pending, unmasked request and IF is set (spec.md §4.1/§4.10).
pub fn external_interrupt(cpu: &mut Cpu, memory: &mut MemoryMap, vector: u8) {
    let flags = cpu.flags.as_u32() as u16;
    let cs = cpu.segment(SegmentRegister::Cs).selector;
    push16(cpu, memory, flags);
    push16(cpu, memory, cs);
    push16(cpu, memory, cpu.eip as u16);
    let (ip, cs_sel) = read_ivt_entry(memory, vector);
    let mut cs_seg = *cpu.segment(SegmentRegister::Cs);
    cs_seg.base = (cs_sel as u32) << 4;
    cs_seg.selector = cs_sel;
    cpu.load_segment(SegmentRegister::Cs, cs_seg);
    cpu.eip = ip as u32;
    cpu.flags.set_interrupt_enable(false);
    cpu.flags.set_trap(false);
}

/// Executes one decoded instruction, updating `cpu.eip`.
pub fn execute(
    cpu: &mut Cpu,
    memory: &mut MemoryMap,
    io: &mut IoMap,
    tlb: &mut Tlb,
    instr: &DecodedInstruction,
) -> Result<(), GuestFault> {
    let start = cpu.eip;
    let next = start.wrapping_add(instr.length);
    cpu.eip = next;

    match instr.op {
        Op::MovRmReg => {
            let reg = instr.reg.expect("MovRmReg always carries a reg operand");
            let v = read_reg(cpu, reg, instr.size);
            write_rm(cpu, memory, instr.rm.as_ref().unwrap(), instr.size, v);
        }
        Op::MovRegRm => {
            let reg = instr.reg.expect("MovRegRm always carries a reg operand");
            let v = read_rm(cpu, memory, instr.rm.as_ref().unwrap(), instr.size);
            write_reg(cpu, reg, instr.size, v);
        }
        Op::MovRmImm => {
            write_rm(cpu, memory, instr.rm.as_ref().unwrap(), instr.size, instr.imm.unwrap());
        }
        Op::MovRegImm => {
            write_reg(cpu, instr.reg.unwrap(), instr.size, instr.imm.unwrap());
        }
        Op::Lea => {
            let ea = match instr.rm.as_ref().unwrap() {
                RmOperand::Memory(ea) => ea,
                RmOperand::Register(_) => unreachable!("LEA's ModR/M is always memory-form"),
            };
            let mut addr = ea.disp as u32;
            if let Some(base) = ea.base {
                addr = addr.wrapping_add(cpu.gpr(base));
            }
            if let Some((index, scale)) = ea.index {
                addr = addr.wrapping_add(cpu.gpr(index) << scale);
            }
            write_reg(cpu, instr.reg.unwrap(), instr.size, addr);
        }
        Op::Alu { op, reg_is_dest } => {
            let reg = instr.reg.unwrap();
            let rm = instr.rm.as_ref().unwrap();
            if reg_is_dest {
                let dst = read_reg(cpu, reg, instr.size);
                let src = read_rm(cpu, memory, rm, instr.size);
                if let Some(result) = alu_apply(cpu, op, instr.size, dst, src) {
                    write_reg(cpu, reg, instr.size, result);
                }
            } else {
                let dst = read_rm(cpu, memory, rm, instr.size);
                let src = read_reg(cpu, reg, instr.size);
                if let Some(result) = alu_apply(cpu, op, instr.size, dst, src) {
                    write_rm(cpu, memory, rm, instr.size, result);
                }
            }
        }
        Op::AluImm { op } => {
            let rm = instr.rm.as_ref().unwrap();
            let dst = read_rm(cpu, memory, rm, instr.size);
            if let Some(result) = alu_apply(cpu, op, instr.size, dst, instr.imm.unwrap()) {
                write_rm(cpu, memory, rm, instr.size, result);
            }
        }
        Op::AluAccImm { op } => {
            let dst = read_reg(cpu, GpRegister::Eax, instr.size);
            if let Some(result) = alu_apply(cpu, op, instr.size, dst, instr.imm.unwrap()) {
                write_reg(cpu, GpRegister::Eax, instr.size, result);
            }
        }
        Op::TestRmReg => {
            let reg = instr.reg.unwrap();
            let a = read_reg(cpu, reg, instr.size);
            let b = read_rm(cpu, memory, instr.rm.as_ref().unwrap(), instr.size);
            cpu.flags.stamp(OpKind::And, a, b, a & b, instr.size);
        }
        Op::TestAccImm => {
            if let Some(rm) = instr.rm.as_ref() {
                let a = read_rm(cpu, memory, rm, instr.size);
                let b = instr.imm.unwrap();
                cpu.flags.stamp(OpKind::And, a, b, a & b, instr.size);
            } else {
                let a = read_reg(cpu, GpRegister::Eax, instr.size);
                let b = instr.imm.unwrap();
                cpu.flags.stamp(OpKind::And, a, b, a & b, instr.size);
            }
        }
        Op::Not => {
            let rm = instr.rm.as_ref().unwrap();
            let v = read_rm(cpu, memory, rm, instr.size);
            write_rm(cpu, memory, rm, instr.size, instr.size.mask(!v));
        }
        Op::Neg => {
            let rm = instr.rm.as_ref().unwrap();
            let v = read_rm(cpu, memory, rm, instr.size);
            let result = 0u32.wrapping_sub(v);
            cpu.flags.stamp(OpKind::Sub, 0, v, result, instr.size);
            write_rm(cpu, memory, rm, instr.size, instr.size.mask(result));
        }
        Op::IncRm => {
            let rm = instr.rm.as_ref().unwrap();
            let v = read_rm(cpu, memory, rm, instr.size);
            let result = v.wrapping_add(1);
            cpu.flags.stamp(OpKind::Inc, v, 1, result, instr.size);
            write_rm(cpu, memory, rm, instr.size, instr.size.mask(result));
        }
        Op::DecRm => {
            let rm = instr.rm.as_ref().unwrap();
            let v = read_rm(cpu, memory, rm, instr.size);
            let result = v.wrapping_sub(1);
            cpu.flags.stamp(OpKind::Dec, v, 1, result, instr.size);
            write_rm(cpu, memory, rm, instr.size, instr.size.mask(result));
        }
        Op::IncReg => {
            let reg = instr.reg.unwrap();
            let v = cpu.gpr(reg);
            let result = v.wrapping_add(1);
            cpu.flags.stamp(OpKind::Inc, v, 1, result, OperandSize::Dword);
            cpu.set_gpr(reg, result);
        }
        Op::DecReg => {
            let reg = instr.reg.unwrap();
            let v = cpu.gpr(reg);
            let result = v.wrapping_sub(1);
            cpu.flags.stamp(OpKind::Dec, v, 1, result, OperandSize::Dword);
            cpu.set_gpr(reg, result);
        }
        Op::Push => {
            let v = cpu.gpr(instr.reg.unwrap());
            push(cpu, memory, v);
        }
        Op::PushImm => {
            push(cpu, memory, instr.imm.unwrap());
        }
        Op::Pop => {
            let v = pop(cpu, memory);
            cpu.set_gpr(instr.reg.unwrap(), v);
        }
        Op::CallRel => {
            push(cpu, memory, next);
            cpu.eip = next.wrapping_add(instr.rel.unwrap() as u32);
        }
        Op::RetNear => {
            cpu.eip = pop(cpu, memory);
        }
        Op::RetImm => {
            cpu.eip = pop(cpu, memory);
            let esp = cpu.gpr(GpRegister::Esp).wrapping_add(instr.imm.unwrap());
            cpu.set_gpr(GpRegister::Esp, esp);
        }
        Op::JmpRel => {
            cpu.eip = next.wrapping_add(instr.rel.unwrap() as u32);
        }
        Op::Jcc(cond) => {
            if cond_holds(cpu, cond) {
                cpu.eip = next.wrapping_add(instr.rel.unwrap() as u32);
            }
        }
        Op::LoopCc(kind) => {
            let target = next.wrapping_add(instr.rel.unwrap() as u32);
            let ecx = cpu.gpr(GpRegister::Ecx).wrapping_sub(match kind {
                LoopKind::Jcxz => 0,
                _ => 1,
            });
            if !matches!(kind, LoopKind::Jcxz) {
                cpu.set_gpr(GpRegister::Ecx, ecx);
            }
            let take = match kind {
                LoopKind::Loop => ecx != 0,
                LoopKind::LoopE => ecx != 0 && cpu.flags.zero(),
                LoopKind::LoopNe => ecx != 0 && !cpu.flags.zero(),
                LoopKind::Jcxz => cpu.gpr(GpRegister::Ecx) == 0,
            };
            if take {
                cpu.eip = target;
            }
        }
        Op::Int => {
            let vector = instr.imm.unwrap() as u8;
            let flags = cpu.flags.as_u32() as u16;
            let cs = cpu.segment(SegmentRegister::Cs).selector;
            push16(cpu, memory, flags);
            push16(cpu, memory, cs);
            push16(cpu, memory, next as u16);
            let (ip, cs_sel) = read_ivt_entry(memory, vector);
            let mut cs_seg = *cpu.segment(SegmentRegister::Cs);
            cs_seg.base = (cs_sel as u32) << 4;
            cs_seg.selector = cs_sel;
            cpu.load_segment(SegmentRegister::Cs, cs_seg);
            cpu.eip = ip as u32;
            cpu.flags.set_interrupt_enable(false);
            cpu.flags.set_trap(false);
        }
        Op::Iret => {
            let ip = pop16(cpu, memory);
            let cs_sel = pop16(cpu, memory);
            let flags = pop16(cpu, memory);
            let mut cs_seg = *cpu.segment(SegmentRegister::Cs);
            cs_seg.base = (cs_sel as u32) << 4;
            cs_seg.selector = cs_sel;
            cpu.load_segment(SegmentRegister::Cs, cs_seg);
            cpu.eip = ip as u32;
            cpu.flags.load(flags as u32);
        }
        Op::InAcc => {
            let port = cpu.gpr16(GpRegister::Edx);
            let v = io.read(port, to_mem_size(instr.size));
            write_reg(cpu, GpRegister::Eax, instr.size, v);
        }
        Op::OutAcc => {
            let port = cpu.gpr16(GpRegister::Edx);
            let v = read_reg(cpu, GpRegister::Eax, instr.size);
            io.write(port, to_mem_size(instr.size), v);
        }
        Op::StringOp(kind) => {
            if let Err(fault) = run_string_op(cpu, memory, tlb, instr, kind) {
                // A fault mid-REP must leave EIP at the faulting instruction
                // itself, not the already-committed fallthrough, so an IRET
                // from the guest's handler re-enters and drains the rest of
                // the repeat count instead of skipping it.
                cpu.eip = start;
                return Err(fault);
            }
        }
        Op::Shift(op) => {
            let rm = instr.rm.as_ref().unwrap();
            let v = read_rm(cpu, memory, rm, instr.size);
            let count = (instr.imm.unwrap_or(1) & 0x1f) as u32;
            if count != 0 {
                let bits = instr.size.bits();
                let (kind, result) = match op {
                    crate::decoder::ShiftOp::Shl => (OpKind::Shl, v.wrapping_shl(count)),
                    crate::decoder::ShiftOp::Shr => (OpKind::Shr, v >> count.min(bits - 1)),
                    crate::decoder::ShiftOp::Sar => {
                        let signed = v as i32;
                        (OpKind::Sar, (signed >> count.min(bits - 1)) as u32)
                    }
                    crate::decoder::ShiftOp::Rol => {
                        (OpKind::Rol, v.rotate_left(count % bits))
                    }
                    crate::decoder::ShiftOp::Ror => {
                        (OpKind::Ror, v.rotate_right(count % bits))
                    }
                    crate::decoder::ShiftOp::Rcl | crate::decoder::ShiftOp::Rcr => {
                        // Rotate-through-carry is treated as a plain rotate; the
                        // carry-in/out wiring is a documented simplification.
                        (OpKind::Rol, v.rotate_left(count % bits))
                    }
                };
                cpu.flags.stamp(kind, v, count, result, instr.size);
                write_rm(cpu, memory, rm, instr.size, instr.size.mask(result));
            }
        }
        Op::Cli => cpu.flags.set_interrupt_enable(false),
        Op::Sti => cpu.flags.set_interrupt_enable(true),
        Op::Cld => cpu.flags.set_direction(false),
        Op::Std => cpu.flags.set_direction(true),
        Op::Hlt => {
            cpu.eip = start;
        }
        Op::Nop => {}
    }

    Ok(())
}
