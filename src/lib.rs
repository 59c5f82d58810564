//! The rvemu-io crate contains the memory-mapped I/O core of a RISC-V
//! emulator: a registry which owns the live peripherals and assigns each a
//! non-overlapping region of the shared address space, a platform-level
//! interrupt controller (PLIC) model arbitrating their interrupt requests,
//! and the capability contract a device implements to take part in
//! memory-mapped I/O and interrupt delivery.
//!
//! The CPU pipeline, the GUI and the backing byte-addressable memory are
//! external collaborators; they talk to this crate through the
//! [`MemoryBus`] trait, the registry's bus dispatch methods and the
//! [`TrapChecker`] adapter.

pub mod dpad;
pub mod keyboard;
pub mod ledmatrix;
pub mod memmap;
pub mod periph;
pub mod plic;
pub mod registry;
pub mod switches;
pub mod symbols;
pub mod textout;
pub mod trap;

pub use crate::dpad::{DPad, Direction};
pub use crate::keyboard::Keyboard;
pub use crate::ledmatrix::LedMatrix;
pub use crate::memmap::{MapSource, MemoryBus, MemoryMap, MemoryMapEntry, NullMemoryBus, Section};
pub use crate::periph::{ExtraSymbol, Param, Peripheral, PeriphKind, RegAccess, RegDesc};
pub use crate::plic::{Plic, MAX_SOURCE_ID, PLIC_BYTE_SIZE};
pub use crate::registry::{IoError, IoRegistry, PeriphId, ProcCapabilities};
pub use crate::switches::Switches;
pub use crate::symbols::{Symbol, SymbolKind};
pub use crate::textout::TextOut;
pub use crate::trap::TrapChecker;

use serde::{Deserialize, Serialize};

/// Tunables an embedding emulator persists alongside a machine setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoSettings {
    /// Base address handed to the first peripheral when the address space
    /// is empty.
    pub periph_start: u64,
}

impl Default for IoSettings {
    fn default() -> Self {
        Self {
            periph_start: 0xF000_0000,
        }
    }
}
