//! The periph module contains the capability contract every memory-mapped
//! device implements, the register-table descriptors published to the
//! symbol exporter, and the closed set of device kinds the registry can
//! instantiate.

use std::any::Any;

use crate::dpad::DPad;
use crate::keyboard::Keyboard;
use crate::ledmatrix::LedMatrix;
use crate::plic::Plic;
use crate::switches::Switches;
use crate::textout::TextOut;

/// Access mode of a named sub-register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegAccess {
    R,
    W,
    RW,
}

/// One named sub-register in a peripheral's register table.
#[derive(Debug, Clone)]
pub struct RegDesc {
    pub name: &'static str,
    pub access: RegAccess,
    /// Width of the register in bits.
    pub bits: u32,
    /// Offset of the register relative to the peripheral's base address.
    pub offset: u64,
    /// Whether the register is emitted to the assembler symbol set.
    pub exported: bool,
}

/// A user-tunable device parameter (buffer sizes, matrix dimensions, ...).
#[derive(Debug, Clone)]
pub struct Param {
    pub id: u32,
    pub name: &'static str,
    pub value: u32,
    pub min: u32,
    pub max: u32,
}

/// An additional named constant a device exports to the assembler beyond
/// its register table.
#[derive(Debug, Clone)]
pub struct ExtraSymbol {
    pub name: &'static str,
    pub value: u64,
}

/// The closed set of device kinds available to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeriphKind {
    LedMatrix,
    Switches,
    DPad,
    Plic,
    Keyboard,
    TextOut,
}

impl PeriphKind {
    pub const ALL: [PeriphKind; 6] = [
        PeriphKind::LedMatrix,
        PeriphKind::Switches,
        PeriphKind::DPad,
        PeriphKind::Plic,
        PeriphKind::Keyboard,
        PeriphKind::TextOut,
    ];

    /// Human-readable name shown by the embedding UI.
    pub fn title(self) -> &'static str {
        match self {
            PeriphKind::LedMatrix => "LED Matrix",
            PeriphKind::Switches => "Switches",
            PeriphKind::DPad => "D-Pad",
            PeriphKind::Plic => "PLIC",
            PeriphKind::Keyboard => "Keyboard",
            PeriphKind::TextOut => "Text out",
        }
    }

    pub(crate) fn construct(self) -> Box<dyn Peripheral> {
        match self {
            PeriphKind::LedMatrix => Box::new(LedMatrix::new()),
            PeriphKind::Switches => Box::new(Switches::new()),
            PeriphKind::DPad => Box::new(DPad::new()),
            PeriphKind::Plic => Box::new(Plic::new()),
            PeriphKind::Keyboard => Box::new(Keyboard::new()),
            PeriphKind::TextOut => Box::new(TextOut::new()),
        }
    }
}

/// The capability contract a memory-mapped device implements.
///
/// A device exposes its addressable byte size, a table of named
/// sub-registers, register access in three flavors and a reset operation.
/// Interrupt-capable devices additionally implement
/// [`Peripheral::interrupt_pending`], a side-effect-free predicate; the
/// interrupt controller, not the device, records edge/level state.
pub trait Peripheral: Any {
    fn kind(&self) -> PeriphKind;

    /// Name the device's assembler symbols are derived from, shared by
    /// every instance of the kind.
    fn base_name(&self) -> &'static str;

    /// Size of the device's register window in bytes.
    fn byte_size(&self) -> u64;

    fn registers(&self) -> &[RegDesc];

    /// Register read as performed by the processor. May have side effects
    /// such as popping a FIFO.
    fn io_read(&mut self, offset: u64, size: u32) -> u64;

    /// Register read without side effects, for inspection and debugging.
    fn io_read_const(&self, offset: u64, size: u32) -> u64;

    fn io_write(&mut self, offset: u64, value: u64, size: u32);

    fn reset(&mut self);

    fn supports_interrupts(&self) -> bool {
        false
    }

    /// Whether the device is currently requesting an interrupt. Must be
    /// free of side effects; only the controller latches requests.
    fn interrupt_pending(&self) -> bool {
        false
    }

    fn extra_symbols(&self) -> Vec<ExtraSymbol> {
        Vec::new()
    }

    fn parameters(&self) -> Vec<Param> {
        Vec::new()
    }

    fn set_parameter(&mut self, _id: u32, _value: u32) {}

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
