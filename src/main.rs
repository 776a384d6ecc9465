use ibmpc_core::config::MachineConfig;
use ibmpc_core::cpu::{GpRegister, SegmentRegister};
use ibmpc_core::memory::OpSize;
use ibmpc_core::Emulator;

fn main() {
    env_logger::init();

    let mut config = MachineConfig::new(16 * 1024 * 1024);
    config.cpu_model = "pentium".to_string();
    config.machine_id = "generic-pentium".to_string();

    let mut emu = Emulator::new(config);
    log::info!(
        "cpu reset to {:#06x}:{:#06x}",
        emu.cpu.segment(SegmentRegister::Cs).selector,
        emu.cpu.eip
    );

    // A minimal smoke program at the reset vector: mov eax,0x1234 ; hlt.
    let base = emu.cpu.segment(SegmentRegister::Cs).base;
    let entry = base + emu.cpu.eip;
    let program: [u8; 6] = [0xb8, 0x34, 0x12, 0x00, 0x00, 0xf4];
    for (i, byte) in program.iter().enumerate() {
        emu.memory.write_phys(entry + i as u32, OpSize::Byte, *byte as u32);
    }

    for _ in 0..2 {
        if let Err(err) = emu.step() {
            log::error!("step failed: {err}");
            break;
        }
    }

    log::info!("eax = {:#010x}", emu.cpu.gpr(GpRegister::Eax));
}
