//! The registry module contains the peripheral registry and address-space
//! manager. The registry owns every live peripheral, assigns each a
//! non-overlapping base address in the shared address space, allocates
//! globally-unique interrupt source ids, and manages the lifecycle of the
//! single interrupt controller and its source subscriptions.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fmt;
use std::rc::Rc;

use log::{debug, warn};

use crate::memmap::{MapSource, MemoryBus, MemoryMap, MemoryMapEntry, Section};
use crate::periph::{Peripheral, PeriphKind};
use crate::plic::{Plic, MAX_SOURCE_ID};
use crate::symbols::{self, Symbol};
use crate::trap::TrapChecker;
use crate::IoSettings;

/// Opaque handle to a live peripheral. Never reused within a registry's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeriphId(u32);

impl fmt::Display for PeriphId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What the active CPU model is capable of.
#[derive(Debug, Clone, Copy)]
pub struct ProcCapabilities {
    pub supports_interrupts: bool,
}

impl Default for ProcCapabilities {
    fn default() -> Self {
        Self {
            supports_interrupts: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The requested configuration cannot be built: a second interrupt
    /// controller, an interrupt-capable device without a controller, or a
    /// CPU model without interrupt support.
    Unsupported(&'static str),
    UnknownPeripheral(PeriphId),
    /// A bus access outside every mapped peripheral region.
    UnmappedAddress(u64),
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IoError::Unsupported(reason) => write!(f, "unsupported configuration: {}", reason),
            IoError::UnknownPeripheral(id) => write!(f, "unknown peripheral {}", id),
            IoError::UnmappedAddress(addr) => write!(f, "unmapped I/O address {:#x}", addr),
        }
    }
}

impl std::error::Error for IoError {}

struct PeriphEntry {
    id: PeriphId,
    /// Per-kind instance number, used to derive the display name.
    instance: u32,
    dev: Box<dyn Peripheral>,
    global_irq: Option<u16>,
    mapping: Option<MemoryMapEntry>,
}

impl PeriphEntry {
    fn name(&self) -> String {
        format!("{}{}", self.dev.base_name(), self.instance)
    }
}

/// The peripheral registry and address-space manager.
///
/// Peripherals are kept in creation order; the full re-layout performed
/// after a device resize walks that order, so the resulting addresses are
/// deterministic across runs.
pub struct IoRegistry {
    settings: IoSettings,
    proc_caps: ProcCapabilities,
    mem: Box<dyn MemoryBus>,
    periphs: Vec<PeriphEntry>,
    plic: Option<PeriphId>,
    used_global_ids: BTreeSet<u16>,
    next_handle: u32,
    memory_map: MemoryMap,
    program: Vec<Section>,
    symbols: Vec<(Symbol, u64)>,
    header: String,
    trap: Option<Rc<RefCell<TrapChecker>>>,
    on_map_changed: Option<Box<dyn FnMut(&MemoryMap)>>,
}

impl IoRegistry {
    pub fn new(settings: IoSettings, mem: Box<dyn MemoryBus>) -> Self {
        let mut registry = Self {
            settings,
            proc_caps: ProcCapabilities::default(),
            mem,
            periphs: Vec::new(),
            plic: None,
            used_global_ids: BTreeSet::new(),
            next_handle: 0,
            memory_map: MemoryMap::new(),
            program: Vec::new(),
            symbols: Vec::new(),
            header: String::new(),
            trap: None,
            on_map_changed: None,
        };
        registry.refresh_memory_map();
        registry
    }

    /// Construct a peripheral of `kind`, register it, and assign it a base
    /// address. `forced_instance` pins the per-kind instance number when a
    /// saved machine is being restored; otherwise the lowest unused one is
    /// taken.
    ///
    /// Fails with [`IoError::Unsupported`] before any state is touched if
    /// a second controller is requested, the active CPU model lacks
    /// interrupt support, or an interrupt-capable device is requested
    /// while no controller exists.
    pub fn create_peripheral(
        &mut self,
        kind: PeriphKind,
        forced_instance: Option<u32>,
    ) -> Result<PeriphId, IoError> {
        if kind == PeriphKind::Plic {
            if !self.proc_caps.supports_interrupts {
                warn!("registry: rejected PLIC, the CPU model lacks interrupt support");
                return Err(IoError::Unsupported(
                    "the active CPU model does not support interrupts",
                ));
            }
            if self.plic.is_some() {
                warn!("registry: rejected PLIC, a controller already exists");
                return Err(IoError::Unsupported("an interrupt controller already exists"));
            }
        }

        let dev = kind.construct();
        if kind != PeriphKind::Plic && dev.supports_interrupts() && self.plic.is_none() {
            warn!(
                "registry: rejected {}, no interrupt controller to deliver its requests",
                kind.title()
            );
            return Err(IoError::Unsupported(
                "an interrupt-capable device requires an interrupt controller",
            ));
        }

        let id = PeriphId(self.next_handle);
        self.next_handle += 1;
        let instance = forced_instance.unwrap_or_else(|| self.next_instance_id(kind));

        let mut entry = PeriphEntry {
            id,
            instance,
            dev,
            global_irq: None,
            mapping: None,
        };
        debug!("registry: creating {}", entry.name());

        let gid = if kind != PeriphKind::Plic && entry.dev.supports_interrupts() {
            let gid = self.next_global_id();
            entry.global_irq = Some(gid);
            Some(gid)
        } else {
            None
        };

        self.periphs.push(entry);

        if kind == PeriphKind::Plic {
            self.plic = Some(id);
            self.connect_sources_to_plic();
            if let Some(tc) = &self.trap {
                tc.borrow_mut().set_plic(Some(id));
            }
        } else if let Some(gid) = gid {
            if let Some(plic) = self.plic_device_mut() {
                plic.register_source(gid);
            }
        }

        let idx = self.periphs.len() - 1;
        self.assign_base_address_at(idx);
        self.refresh_memory_map();
        Ok(id)
    }

    /// Remove a peripheral. Removing the controller first clears the trap
    /// adapter's back-reference, then releases every source subscription
    /// and global id, so no dependent ever observes a half-removed
    /// controller. Unknown handles fail without mutation.
    pub fn remove_peripheral(&mut self, id: PeriphId) -> Result<(), IoError> {
        let idx = self.index_of(id).ok_or(IoError::UnknownPeripheral(id))?;
        debug!("registry: removing {}", self.periphs[idx].name());

        if self.plic == Some(id) {
            if let Some(tc) = &self.trap {
                tc.borrow_mut().set_plic(None);
            }
            self.plic = None;
            self.release_all_sources();
        } else if let Some(gid) = self.periphs[idx].global_irq.take() {
            if let Some(plic) = self.plic_device_mut() {
                plic.unregister_source(gid);
            }
            self.used_global_ids.remove(&gid);
        }

        if let Some(mapping) = self.periphs[idx].mapping.take() {
            self.mem.remove_io_region(mapping.base, mapping.size);
        }
        self.periphs.remove(idx);
        self.refresh_memory_map();
        Ok(())
    }

    /// Assign `id` a fresh base address: any existing mapping is
    /// unregistered, then the region is placed at the end of the currently
    /// mapped peripheral regions (a bump allocation; interior gaps left by
    /// removed peripherals are only reclaimed by a full re-layout).
    pub fn assign_base_address(&mut self, id: PeriphId) -> Result<u64, IoError> {
        let idx = self.index_of(id).ok_or(IoError::UnknownPeripheral(id))?;
        Ok(self.assign_base_address_at(idx))
    }

    fn assign_base_address_at(&mut self, idx: usize) -> u64 {
        if let Some(mapping) = self.periphs[idx].mapping.take() {
            self.mem.remove_io_region(mapping.base, mapping.size);
        }
        let base = self.next_peripheral_address();
        let mapping = MemoryMapEntry {
            base,
            size: self.periphs[idx].dev.byte_size(),
            name: self.periphs[idx].name(),
            source: MapSource::Peripheral,
        };
        debug!(
            "registry: {} mapped at {:#x}..{:#x}",
            mapping.name,
            mapping.base,
            mapping.end()
        );
        self.mem.add_io_region(&mapping);
        self.periphs[idx].mapping = Some(mapping);
        base
    }

    /// End of the highest currently mapped peripheral region, or the
    /// configured start address when nothing is mapped.
    fn next_peripheral_address(&self) -> u64 {
        self.periphs
            .iter()
            .filter_map(|e| e.mapping.as_ref().map(|m| m.end()))
            .max()
            .unwrap_or(self.settings.periph_start)
    }

    /// Unregister every mapping and re-assign all of them in creation
    /// order. Performed whenever a device's byte size changes, since a
    /// resize invalidates every address placed after it.
    pub fn reassign_all_base_addresses(&mut self) {
        debug!("registry: re-laying out the peripheral address space");
        for idx in 0..self.periphs.len() {
            if let Some(mapping) = self.periphs[idx].mapping.take() {
                self.mem.remove_io_region(mapping.base, mapping.size);
            }
        }
        for idx in 0..self.periphs.len() {
            self.assign_base_address_at(idx);
        }
        self.refresh_memory_map();
    }

    /// Rebuild the merged memory map (peripheral regions plus program
    /// sections), regenerate the assembler symbol set and header, and fire
    /// the change notification.
    pub fn refresh_memory_map(&mut self) {
        self.memory_map.clear();
        for entry in &self.periphs {
            if let Some(mapping) = &entry.mapping {
                self.memory_map.insert(mapping.base, mapping.clone());
            }
        }
        for section in &self.program {
            self.memory_map.insert(
                section.addr,
                MemoryMapEntry {
                    base: section.addr,
                    size: section.size,
                    name: section.name.clone(),
                    source: MapSource::ProgramSection,
                },
            );
        }
        self.update_symbols();
        if let Some(on_map_changed) = &mut self.on_map_changed {
            on_map_changed(&self.memory_map);
        }
    }

    /// Allocate the lowest unused global interrupt id. Exhaustion of the
    /// 1023-source id space is an unrecoverable configuration error.
    pub fn next_global_id(&mut self) -> u16 {
        for cand in 1..=MAX_SOURCE_ID {
            if !self.used_global_ids.contains(&cand) {
                self.used_global_ids.insert(cand);
                return cand;
            }
        }
        panic!("interrupt source ids exhausted (1..=1023 all in use)");
    }

    /// Install the program-section snapshot reported by the program
    /// loader.
    pub fn set_program(&mut self, sections: Vec<Section>) {
        self.program = sections;
        self.refresh_memory_map();
    }

    /// Switch to a new CPU model. The controller does not survive the
    /// switch (the new model may not support interrupts at all); the
    /// remaining mappings are re-registered with the backing memory.
    pub fn set_processor(&mut self, caps: ProcCapabilities) {
        debug!(
            "registry: processor changed (interrupts: {})",
            caps.supports_interrupts
        );
        self.proc_caps = caps;
        if let Some(plic_id) = self.plic {
            self.remove_peripheral(plic_id).ok();
        }
        let regions: Vec<MemoryMapEntry> = self
            .periphs
            .iter()
            .filter_map(|e| e.mapping.clone())
            .collect();
        for region in &regions {
            self.mem.add_io_region(region);
        }
        self.refresh_memory_map();
    }

    /// Reset every live peripheral.
    pub fn reset(&mut self) {
        for entry in self.periphs.iter_mut() {
            entry.dev.reset();
        }
    }

    /// Forward a parameter change to a device. If the device's byte size
    /// changed, every base address after it is stale, so the whole address
    /// space is re-laid out.
    pub fn set_parameter(&mut self, id: PeriphId, param: u32, value: u32) -> Result<(), IoError> {
        let idx = self.index_of(id).ok_or(IoError::UnknownPeripheral(id))?;
        let before = self.periphs[idx].dev.byte_size();
        self.periphs[idx].dev.set_parameter(param, value);
        if self.periphs[idx].dev.byte_size() != before {
            debug!("registry: {} resized", self.periphs[idx].name());
            self.reassign_all_base_addresses();
        }
        Ok(())
    }

    /// Route a bus read to the mapped peripheral. May have device side
    /// effects (FIFO pops, interrupt claims).
    pub fn io_read(&mut self, addr: u64, size: u32) -> Result<u64, IoError> {
        for entry in self.periphs.iter_mut() {
            if let Some(mapping) = &entry.mapping {
                if mapping.contains(addr) {
                    let offset = addr - mapping.base;
                    return Ok(entry.dev.io_read(offset, size));
                }
            }
        }
        Err(IoError::UnmappedAddress(addr))
    }

    /// Route a bus read without side effects, for inspection.
    pub fn io_read_const(&self, addr: u64, size: u32) -> Result<u64, IoError> {
        for entry in &self.periphs {
            if let Some(mapping) = &entry.mapping {
                if mapping.contains(addr) {
                    let offset = addr - mapping.base;
                    return Ok(entry.dev.io_read_const(offset, size));
                }
            }
        }
        Err(IoError::UnmappedAddress(addr))
    }

    pub fn io_write(&mut self, addr: u64, value: u64, size: u32) -> Result<(), IoError> {
        for entry in self.periphs.iter_mut() {
            if let Some(mapping) = &entry.mapping {
                if mapping.contains(addr) {
                    let offset = addr - mapping.base;
                    entry.dev.io_write(offset, value, size);
                    return Ok(());
                }
            }
        }
        Err(IoError::UnmappedAddress(addr))
    }

    /// Poll every registered source into the controller's pending bitmap,
    /// then report whether any source qualifies for a claim. Must be
    /// called before [`IoRegistry::claim_interrupt`] within the same
    /// evaluation step; the claim scan relies on the bitmap this method
    /// refreshes.
    pub fn has_pending_interrupt(&mut self) -> bool {
        if self.plic.is_none() {
            return false;
        }
        let samples: Vec<(u16, bool)> = self
            .periphs
            .iter()
            .filter_map(|e| e.global_irq.map(|gid| (gid, e.dev.interrupt_pending())))
            .collect();
        match self.plic_device_mut() {
            Some(plic) => {
                plic.refresh_pending(samples);
                plic.has_pending()
            }
            None => false,
        }
    }

    /// Claim the highest-priority pending source; 0 when none qualifies
    /// or no controller exists. Does not re-poll device predicates.
    pub fn claim_interrupt(&mut self) -> u16 {
        match self.plic_device_mut() {
            Some(plic) => plic.claim(),
            None => 0,
        }
    }

    pub fn complete_interrupt(&mut self, source: u16) {
        if let Some(plic) = self.plic_device_mut() {
            plic.complete(source);
        }
    }

    /// Install the trap-evaluation adapter. The registry keeps it in sync
    /// with the controller's lifecycle from here on.
    pub fn attach_trap_checker(&mut self, trap: Rc<RefCell<TrapChecker>>) {
        trap.borrow_mut().set_plic(self.plic);
        self.trap = Some(trap);
    }

    /// Callback fired after every memory-map rebuild, consumed by the
    /// GUI/assembler collaborators.
    pub fn on_memory_map_changed(&mut self, callback: Box<dyn FnMut(&MemoryMap)>) {
        self.on_map_changed = Some(callback);
    }

    pub fn memory_map(&self) -> &MemoryMap {
        &self.memory_map
    }

    pub fn assembler_symbols(&self) -> &[(Symbol, u64)] {
        &self.symbols
    }

    /// The generated C header collecting every exported symbol.
    pub fn header_text(&self) -> &str {
        &self.header
    }

    pub fn settings(&self) -> &IoSettings {
        &self.settings
    }

    /// DMA handle into the backing byte-addressable memory.
    pub fn memory_mut(&mut self) -> &mut dyn MemoryBus {
        self.mem.as_mut()
    }

    pub fn peripherals(&self) -> impl Iterator<Item = PeriphId> + '_ {
        self.periphs.iter().map(|e| e.id)
    }

    pub fn peripheral(&self, id: PeriphId) -> Option<&dyn Peripheral> {
        self.entry(id).map(|e| e.dev.as_ref())
    }

    pub fn peripheral_mut(&mut self, id: PeriphId) -> Option<&mut dyn Peripheral> {
        let idx = self.index_of(id)?;
        Some(self.periphs[idx].dev.as_mut())
    }

    pub fn name_of(&self, id: PeriphId) -> Option<String> {
        self.entry(id).map(|e| e.name())
    }

    pub fn mapping(&self, id: PeriphId) -> Option<&MemoryMapEntry> {
        self.entry(id).and_then(|e| e.mapping.as_ref())
    }

    pub fn global_irq(&self, id: PeriphId) -> Option<u16> {
        self.entry(id).and_then(|e| e.global_irq)
    }

    pub fn plic_id(&self) -> Option<PeriphId> {
        self.plic
    }

    pub fn plic_device(&self) -> Option<&Plic> {
        let id = self.plic?;
        self.entry(id)?.dev.as_any().downcast_ref::<Plic>()
    }

    pub fn plic_device_mut(&mut self) -> Option<&mut Plic> {
        let id = self.plic?;
        let idx = self.index_of(id)?;
        self.periphs[idx].dev.as_any_mut().downcast_mut::<Plic>()
    }

    fn entry(&self, id: PeriphId) -> Option<&PeriphEntry> {
        self.periphs.iter().find(|e| e.id == id)
    }

    fn index_of(&self, id: PeriphId) -> Option<usize> {
        self.periphs.iter().position(|e| e.id == id)
    }

    /// Lowest instance number unused among live devices of `kind`.
    fn next_instance_id(&self, kind: PeriphKind) -> u32 {
        let used: BTreeSet<u32> = self
            .periphs
            .iter()
            .filter(|e| e.dev.kind() == kind)
            .map(|e| e.instance)
            .collect();
        let mut n = 0;
        while used.contains(&n) {
            n += 1;
        }
        n
    }

    /// Subscribe every interrupt-capable peripheral to a newly created
    /// controller, allocating fresh global ids where needed.
    fn connect_sources_to_plic(&mut self) {
        let mut gids = Vec::new();
        for idx in 0..self.periphs.len() {
            if self.periphs[idx].dev.kind() == PeriphKind::Plic {
                continue;
            }
            if !self.periphs[idx].dev.supports_interrupts() {
                continue;
            }
            let gid = match self.periphs[idx].global_irq {
                Some(gid) => gid,
                None => {
                    let gid = self.next_global_id();
                    self.periphs[idx].global_irq = Some(gid);
                    gid
                }
            };
            gids.push(gid);
        }
        if let Some(plic) = self.plic_device_mut() {
            for gid in gids {
                plic.register_source(gid);
            }
        }
    }

    /// Drop every source subscription and return all global ids to the
    /// pool. Used when the controller goes away.
    fn release_all_sources(&mut self) {
        for entry in self.periphs.iter_mut() {
            if let Some(gid) = entry.global_irq.take() {
                self.used_global_ids.remove(&gid);
            }
        }
    }

    fn update_symbols(&mut self) {
        let mut groups = Vec::new();
        for entry in &self.periphs {
            if let Some(mapping) = &entry.mapping {
                let periph_name = symbols::c_name(&entry.name());
                let group =
                    symbols::symbols_for_peripheral(&periph_name, mapping, entry.dev.as_ref());
                groups.push((periph_name, group));
            }
        }
        self.symbols = groups.iter().flat_map(|(_, g)| g.clone()).collect();
        self.header = symbols::header_text(&groups);
    }
}
