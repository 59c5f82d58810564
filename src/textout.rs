//! The textout module contains a write-only character monitor. Bytes
//! stored to the `DATA` register queue in a bounded buffer which the
//! embedding UI drains for display.

use std::collections::VecDeque;

use crate::periph::{Param, Peripheral, PeriphKind, RegAccess, RegDesc};

/// Offset of the write-only data register.
pub const TEXTOUT_DATA: u64 = 0x0;

/// Id of the buffer-size parameter.
pub const TEXTOUT_BUFFER_SIZE: u32 = 0;

const DEFAULT_CAPACITY: u32 = 1024;
const MAX_CAPACITY: u32 = 10000;

const REGS: [RegDesc; 1] = [RegDesc {
    name: "DATA",
    access: RegAccess::W,
    bits: 8,
    offset: TEXTOUT_DATA,
    exported: true,
}];

pub struct TextOut {
    buffer: VecDeque<u8>,
    capacity: u32,
}

impl TextOut {
    pub fn new() -> Self {
        Self {
            buffer: VecDeque::new(),
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Drain everything written since the last call, in arrival order.
    pub fn take_output(&mut self) -> Vec<u8> {
        self.buffer.drain(..).collect()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Peripheral for TextOut {
    fn kind(&self) -> PeriphKind {
        PeriphKind::TextOut
    }

    fn base_name(&self) -> &'static str {
        "Monitor"
    }

    fn byte_size(&self) -> u64 {
        0x4
    }

    fn registers(&self) -> &[RegDesc] {
        &REGS
    }

    fn io_read(&mut self, _offset: u64, _size: u32) -> u64 {
        0
    }

    fn io_read_const(&self, _offset: u64, _size: u32) -> u64 {
        0
    }

    fn io_write(&mut self, offset: u64, value: u64, _size: u32) {
        if offset == TEXTOUT_DATA {
            // Discard the oldest byte when full.
            if self.buffer.len() >= self.capacity as usize {
                self.buffer.pop_front();
            }
            self.buffer.push_back(value as u8);
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
    }

    fn supports_interrupts(&self) -> bool {
        true
    }

    fn interrupt_pending(&self) -> bool {
        // Ready for more output once the buffer has been drained.
        self.buffer.is_empty()
    }

    fn parameters(&self) -> Vec<Param> {
        vec![Param {
            id: TEXTOUT_BUFFER_SIZE,
            name: "Buffer size",
            value: self.capacity,
            min: 1,
            max: MAX_CAPACITY,
        }]
    }

    fn set_parameter(&mut self, id: u32, value: u32) {
        if id == TEXTOUT_BUFFER_SIZE {
            self.capacity = value.max(1).min(MAX_CAPACITY);
            self.buffer.clear();
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_queue_in_order() {
        let mut out = TextOut::new();
        out.io_write(TEXTOUT_DATA, b'h' as u64, 8);
        out.io_write(TEXTOUT_DATA, b'i' as u64, 8);
        assert!(!out.interrupt_pending());
        assert_eq!(out.take_output(), b"hi");
        assert!(out.interrupt_pending());
    }

    #[test]
    fn full_buffer_drops_oldest() {
        let mut out = TextOut::new();
        out.set_parameter(TEXTOUT_BUFFER_SIZE, 2);
        for &c in b"abc" {
            out.io_write(TEXTOUT_DATA, c as u64, 8);
        }
        assert_eq!(out.take_output(), b"bc");
    }

    #[test]
    fn reads_return_zero() {
        let mut out = TextOut::new();
        out.io_write(TEXTOUT_DATA, b'x' as u64, 8);
        assert_eq!(out.io_read(TEXTOUT_DATA, 8), 0);
        assert_eq!(out.io_read_const(TEXTOUT_DATA, 8), 0);
    }
}
