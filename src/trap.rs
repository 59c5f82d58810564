//! The trap module contains the adapter through which the CPU's trap
//! evaluation observes the interrupt controller. The adapter holds a
//! non-owning handle to the controller; the registry installs it when a
//! controller is created and clears it when the controller is removed.

use crate::registry::{IoRegistry, PeriphId};

pub struct TrapChecker {
    plic: Option<PeriphId>,
}

impl TrapChecker {
    pub fn new() -> Self {
        Self { plic: None }
    }

    pub(crate) fn set_plic(&mut self, plic: Option<PeriphId>) {
        self.plic = plic;
    }

    /// Handle of the live controller, if any.
    pub fn plic(&self) -> Option<PeriphId> {
        self.plic
    }

    /// True when the controller has an enabled, pending source above its
    /// threshold. Polls every registered source as a side effect.
    pub fn external_interrupts(&self, registry: &mut IoRegistry) -> bool {
        if self.plic.is_none() {
            return false;
        }
        registry.has_pending_interrupt()
    }
}

impl Default for TrapChecker {
    fn default() -> Self {
        Self::new()
    }
}
