//! I/O port fabric (C2, spec.md §4.2). Mirrors the memory map's stack-semantics
//! registration (`mapping_add`/`mapping_remove` in [`crate::memory`]): a later
//! `set_handler` for a port range shadows an earlier one, and removing it
//! restores whatever was registered before. Ports with no handler read back
//! the conventional open-bus pattern (all ones) and discard writes.

use crate::error::ResourceExhausted;
use crate::memory::OpSize;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

pub trait IoDevice {
    fn read(&mut self, port: u16, size: OpSize) -> u32;
    fn write(&mut self, port: u16, size: OpSize, value: u32);
}

#[derive(Clone)]
struct PortRegistration {
    id: u32,
    base: u16,
    count: u16,
    device: Rc<RefCell<dyn IoDevice>>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct IoHandle(u32);

const MAX_REGISTRATIONS: usize = 512;

/// Dispatch table for the guest's 16-bit I/O address space. Registrations are
/// kept as a priority stack per port rather than a flat array (spec.md §4.2:
/// "the most recently registered handler covering a port wins; removing it
/// uncovers whichever handler was registered before").
pub struct IoMap {
    registrations: Vec<PortRegistration>,
    next_id: u32,
}

impl IoMap {
    pub fn new() -> Self {
        IoMap {
            registrations: Vec::new(),
            next_id: 1,
        }
    }

    pub fn set_handler(
        &mut self,
        base: u16,
        count: u16,
        device: Rc<RefCell<dyn IoDevice>>,
    ) -> Result<IoHandle, ResourceExhausted> {
        if self.registrations.len() >= MAX_REGISTRATIONS {
            return Err(ResourceExhausted::IoHandlerStackFull { base, count });
        }
        let id = self.next_id;
        self.next_id += 1;
        self.registrations.push(PortRegistration {
            id,
            base,
            count,
            device,
        });
        Ok(IoHandle(id))
    }

    pub fn remove_handler(&mut self, handle: IoHandle) {
        self.registrations.retain(|r| r.id != handle.0);
    }

    fn covering(&self, port: u16) -> Option<&PortRegistration> {
        self.registrations
            .iter()
            .rev()
            .find(|r| port >= r.base && (port as u32) < r.base as u32 + r.count as u32)
    }

    /// Reads `size` bytes starting at `port`. A single handler spanning the
    /// whole access is called directly; otherwise the access is synthesized a
    /// byte at a time and little-endian composed (spec.md §4.2 "width
    /// synthesis" — lets a device that only registers byte-wide handlers still
    /// serve a word or dword access).
    pub fn read(&mut self, port: u16, size: OpSize) -> u32 {
        if let Some(reg) = self.covering(port) {
            if (port as u32) + size.bytes() <= reg.base as u32 + reg.count as u32 {
                return reg.device.borrow_mut().read(port, size);
            }
        }
        let n = size.bytes();
        let mut bytes = [0xffu8; 4];
        for i in 0..n {
            let p = port.wrapping_add(i as u16);
            bytes[i as usize] = self
                .covering(p)
                .map(|reg| reg.device.borrow_mut().read(p, OpSize::Byte) as u8)
                .unwrap_or(0xff);
        }
        u32::from_le_bytes(bytes)
    }

    pub fn write(&mut self, port: u16, size: OpSize, value: u32) {
        if let Some(reg) = self.covering(port) {
            if (port as u32) + size.bytes() <= reg.base as u32 + reg.count as u32 {
                reg.device.borrow_mut().write(port, size, value);
                return;
            }
        }
        let n = size.bytes();
        let bytes = value.to_le_bytes();
        for i in 0..n {
            let p = port.wrapping_add(i as u16);
            if let Some(reg) = self.covering(p) {
                reg.device.borrow_mut().write(p, OpSize::Byte, bytes[i as usize] as u32);
            }
        }
    }
}

impl Default for IoMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Latch(u32);
    impl IoDevice for Latch {
        fn read(&mut self, _port: u16, _size: OpSize) -> u32 {
            self.0
        }
        fn write(&mut self, _port: u16, _size: OpSize, value: u32) {
            self.0 = value;
        }
    }

    #[test]
    fn unmapped_port_reads_open_bus() {
        let mut io = IoMap::new();
        assert_eq!(io.read(0x3f8, OpSize::Byte), 0xff);
    }

    #[test]
    fn later_handler_shadows_earlier_and_removal_restores() {
        let mut io = IoMap::new();
        let a = io.set_handler(0x60, 1, Rc::new(RefCell::new(Latch(0xaa)))).unwrap();
        let b = io.set_handler(0x60, 1, Rc::new(RefCell::new(Latch(0xbb)))).unwrap();
        assert_eq!(io.read(0x60, OpSize::Byte), 0xbb);
        io.remove_handler(b);
        assert_eq!(io.read(0x60, OpSize::Byte), 0xaa);
        io.remove_handler(a);
        assert_eq!(io.read(0x60, OpSize::Byte), 0xff);
    }

    #[test]
    fn byte_handler_serves_word_access_via_synthesis() {
        let mut io = IoMap::new();
        io.set_handler(0x200, 1, Rc::new(RefCell::new(Latch(0x12)))).unwrap();
        io.set_handler(0x201, 1, Rc::new(RefCell::new(Latch(0x34)))).unwrap();
        assert_eq!(io.read(0x200, OpSize::Word), 0x3412);
    }
}
