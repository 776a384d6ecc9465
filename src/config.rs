//! The configuration surface the core requires from its caller (spec.md §6). The
//! core treats every field as an opaque identifier; it never parses a config file
//! or constructs a device from these values itself — that is the collaborator's
//! job.

/// Opaque machine configuration handed to [`crate::Emulator::new`]. Every field is
/// a plain identifier string or count; the core does not interpret them beyond
/// sizing RAM and picking the timing model table for `cpu_model`.
#[derive(Clone, Debug, Default)]
pub struct MachineConfig {
    /// Selects the timing-model table (see [`crate::timing`]). Recognized values
    /// are opaque to everything except the timing-model constructor.
    pub cpu_model: String,
    /// Identifies the machine/chipset preset; consumed only by the boot
    /// orchestrator's collaborator, not by this crate.
    pub machine_id: String,
    /// Guest RAM size in bytes. Must be a multiple of 4 KiB.
    pub ram_size: usize,
    pub video_card_id: String,
    pub sound_card_id: String,
    pub storage_devices: Vec<String>,
    pub nic_id: String,
}

impl MachineConfig {
    pub fn new(ram_size: usize) -> Self {
        Self {
            ram_size,
            ..Default::default()
        }
    }
}
