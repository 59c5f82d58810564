//! The plic module contains the platform-level interrupt controller
//! (PLIC) model. The controller owns per-source priority, pending and
//! enable state plus a threshold register for a single target context,
//! and arbitrates among its registered sources through the claim/complete
//! protocol.

use std::collections::BTreeSet;
use std::convert::TryFrom;

use log::trace;

use crate::periph::{Peripheral, PeriphKind, RegAccess, RegDesc};

/// Number of interrupt source slots. Source 0 is reserved and never used.
pub const PLIC_NSOURCES: usize = 1024;
/// Number of 32-bit words in the pending and enable bitmaps.
pub const PLIC_WORDS: usize = PLIC_NSOURCES / 32;
/// Highest usable source id.
pub const MAX_SOURCE_ID: u16 = (PLIC_NSOURCES - 1) as u16;

/// The offset of the per-source priority words, one per source id.
pub const PLIC_PRIORITY: u64 = 0x000000;
/// The offset of the pending bitmap, 32 sources per word.
pub const PLIC_PENDING: u64 = 0x001000;
/// The offset of the enable bitmap, 32 sources per word.
pub const PLIC_ENABLE: u64 = 0x002000;
/// The offset of the threshold register.
pub const PLIC_THRESHOLD: u64 = 0x200000;
/// The offset of the claim/complete register. Reading it claims the
/// highest-priority pending source; writing it completes the written id.
pub const PLIC_CLAIM: u64 = 0x200004;
/// Total size of the controller's register window in bytes.
pub const PLIC_BYTE_SIZE: u64 = 0x200008;

const REGS: [RegDesc; 5] = [
    RegDesc {
        name: "PRIO",
        access: RegAccess::RW,
        bits: 32,
        offset: PLIC_PRIORITY,
        exported: false,
    },
    RegDesc {
        name: "PEND_0",
        access: RegAccess::R,
        bits: 32,
        offset: PLIC_PENDING,
        exported: false,
    },
    RegDesc {
        name: "ENABLE_0",
        access: RegAccess::RW,
        bits: 32,
        offset: PLIC_ENABLE,
        exported: false,
    },
    RegDesc {
        name: "THRESH",
        access: RegAccess::RW,
        bits: 32,
        offset: PLIC_THRESHOLD,
        exported: true,
    },
    RegDesc {
        name: "CLAIM",
        access: RegAccess::RW,
        bits: 32,
        offset: PLIC_CLAIM,
        exported: true,
    },
];

fn word_bit(id: u16) -> (usize, u32) {
    ((id / 32) as usize, 1 << (id % 32))
}

/// The platform-level interrupt controller, context 0 only.
pub struct Plic {
    priority: Vec<u32>,
    pending: [u32; PLIC_WORDS],
    enabled: [u32; PLIC_WORDS],
    threshold: u32,
    /// Sources claimed but not yet completed.
    served: BTreeSet<u16>,
    /// Source ids currently bound to a live peripheral. Wiring, not
    /// register state; survives `reset`.
    sources: BTreeSet<u16>,
}

impl Plic {
    pub fn new() -> Self {
        Self {
            priority: vec![0; PLIC_NSOURCES],
            pending: [0; PLIC_WORDS],
            enabled: [0; PLIC_WORDS],
            threshold: 0,
            served: BTreeSet::new(),
            sources: BTreeSet::new(),
        }
    }

    /// Bind a source id to a live peripheral. Maintained exclusively by
    /// the registry.
    pub fn register_source(&mut self, id: u16) {
        debug_assert!(id >= 1 && id <= MAX_SOURCE_ID);
        self.sources.insert(id);
    }

    pub fn unregister_source(&mut self, id: u16) {
        self.sources.remove(&id);
    }

    pub fn is_registered(&self, id: u16) -> bool {
        self.sources.contains(&id)
    }

    pub fn registered_sources(&self) -> impl Iterator<Item = u16> + '_ {
        self.sources.iter().copied()
    }

    /// Latch the polled interrupt lines into the pending bitmap. A
    /// pending bit, once set, stays set until claimed; the poll only ever
    /// sets bits, so a transient high-to-low transition does not erase a
    /// recorded request.
    pub fn refresh_pending<I>(&mut self, samples: I)
    where
        I: IntoIterator<Item = (u16, bool)>,
    {
        for (id, level) in samples {
            if level && self.sources.contains(&id) {
                let (w, b) = word_bit(id);
                self.pending[w] |= b;
            }
        }
    }

    /// True if any source is enabled, pending and above the threshold.
    pub fn has_pending(&self) -> bool {
        for id in 1..PLIC_NSOURCES as u16 {
            let (w, b) = word_bit(id);
            let pen = self.pending[w] & b != 0;
            let ena = self.enabled[w] & b != 0;
            if ena && pen && self.priority[id as usize] > self.threshold {
                return true;
            }
        }
        false
    }

    /// Select the enabled, pending source with the strictly highest
    /// priority above the threshold; equal priorities resolve to the
    /// lowest source id. Returns 0 if no source qualifies. A non-zero
    /// result clears the source's pending bit and marks it served.
    pub fn claim(&mut self) -> u16 {
        let best = self.claim_const();
        if best != 0 {
            let (w, b) = word_bit(best);
            self.pending[w] &= !b;
            self.served.insert(best);
            trace!("plic: claimed source {}", best);
        }
        best
    }

    /// The arbitration scan without the claim side effects.
    pub fn claim_const(&self) -> u16 {
        let mut best_prio = 0;
        let mut best_src = 0;
        for id in 1..PLIC_NSOURCES as u16 {
            let (w, b) = word_bit(id);
            let pen = self.pending[w] & b != 0;
            let ena = self.enabled[w] & b != 0;
            let prio = self.priority[id as usize];
            if ena && pen && prio > self.threshold && prio > best_prio {
                best_prio = prio;
                best_src = id;
            }
        }
        best_src
    }

    /// Signal that handling of `id` finished. No-op if the source is not
    /// currently served; pending and enable bits are untouched.
    pub fn complete(&mut self, id: u16) {
        if self.served.remove(&id) {
            trace!("plic: completed source {}", id);
        }
    }

    pub fn is_served(&self, id: u16) -> bool {
        self.served.contains(&id)
    }

    pub fn priority(&self, id: u16) -> u32 {
        self.priority[id as usize]
    }

    pub fn set_priority(&mut self, id: u16, prio: u32) {
        self.priority[id as usize] = prio;
    }

    pub fn is_enabled(&self, id: u16) -> bool {
        let (w, b) = word_bit(id);
        self.enabled[w] & b != 0
    }

    pub fn set_enabled(&mut self, id: u16, on: bool) {
        let (w, b) = word_bit(id);
        if on {
            self.enabled[w] |= b;
        } else {
            self.enabled[w] &= !b;
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn set_threshold(&mut self, threshold: u32) {
        self.threshold = threshold;
    }

    pub fn is_pending(&self, id: u16) -> bool {
        let (w, b) = word_bit(id);
        self.pending[w] & b != 0
    }
}

impl Peripheral for Plic {
    fn kind(&self) -> PeriphKind {
        PeriphKind::Plic
    }

    fn base_name(&self) -> &'static str {
        "PLIC"
    }

    fn byte_size(&self) -> u64 {
        PLIC_BYTE_SIZE
    }

    fn registers(&self) -> &[RegDesc] {
        &REGS
    }

    fn io_read(&mut self, offset: u64, size: u32) -> u64 {
        if offset == PLIC_CLAIM {
            return self.claim() as u64;
        }
        self.io_read_const(offset, size)
    }

    fn io_read_const(&self, offset: u64, _size: u32) -> u64 {
        if offset < PLIC_PENDING {
            let id = ((offset - PLIC_PRIORITY) >> 2) as usize;
            self.priority[id] as u64
        } else if offset < PLIC_ENABLE {
            let word = ((offset - PLIC_PENDING) >> 2) as usize;
            if word < PLIC_WORDS {
                self.pending[word] as u64
            } else {
                0
            }
        } else if offset < PLIC_THRESHOLD {
            let word = ((offset - PLIC_ENABLE) >> 2) as usize;
            if word < PLIC_WORDS {
                self.enabled[word] as u64
            } else {
                0
            }
        } else if offset == PLIC_THRESHOLD {
            self.threshold as u64
        } else if offset == PLIC_CLAIM {
            self.claim_const() as u64
        } else {
            0
        }
    }

    fn io_write(&mut self, offset: u64, value: u64, _size: u32) {
        if offset < PLIC_PENDING {
            let id = ((offset - PLIC_PRIORITY) >> 2) as usize;
            self.priority[id] = value as u32;
        } else if offset < PLIC_ENABLE {
            // pending bitmap is read-only
        } else if offset < PLIC_THRESHOLD {
            let word = ((offset - PLIC_ENABLE) >> 2) as usize;
            if word < PLIC_WORDS {
                self.enabled[word] = value as u32;
            }
        } else if offset == PLIC_THRESHOLD {
            self.threshold = value as u32;
        } else if offset == PLIC_CLAIM {
            if let Ok(id) = u16::try_from(value) {
                self.complete(id);
            }
        }
    }

    fn reset(&mut self) {
        for p in self.priority.iter_mut() {
            *p = 0;
        }
        self.pending = [0; PLIC_WORDS];
        self.enabled = [0; PLIC_WORDS];
        self.threshold = 0;
        self.served.clear();
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

    fn armed(id: u16, prio: u32) -> Plic {
        let mut plic = Plic::new();
        plic.register_source(id);
        plic.set_priority(id, prio);
        plic.set_enabled(id, true);
        plic
    }

    #[test]
    fn claim_requires_enabled_pending_above_threshold() {
        let mut plic = armed(1, 5);
        // Not yet pending.
        assert!(!plic.has_pending());
        assert_eq!(plic.claim(), 0);

        plic.refresh_pending(vec![(1, true)]);
        assert!(plic.has_pending());

        // Disabled source is never claimed.
        plic.set_enabled(1, false);
        assert!(!plic.has_pending());
        assert_eq!(plic.claim(), 0);
        plic.set_enabled(1, true);

        // Priority equal to the threshold does not qualify.
        plic.set_threshold(5);
        assert!(!plic.has_pending());
        assert_eq!(plic.claim(), 0);

        plic.set_threshold(4);
        assert_eq!(plic.claim(), 1);
    }

    #[test]
    fn claim_clears_pending_and_marks_served() {
        let mut plic = armed(3, 2);
        plic.refresh_pending(vec![(3, true)]);
        assert_eq!(plic.claim(), 3);
        assert!(plic.is_served(3));
        assert!(!plic.is_pending(3));
        // Pending was cleared, so a second immediate claim yields nothing.
        assert_eq!(plic.claim(), 0);
    }

    #[test]
    fn highest_priority_wins_ties_to_lowest_id() {
        let mut plic = Plic::new();
        for &(id, prio) in &[(2u16, 3u32), (5, 7), (9, 7), (12, 1)] {
            plic.register_source(id);
            plic.set_priority(id, prio);
            plic.set_enabled(id, true);
            plic.refresh_pending(vec![(id, true)]);
        }
        // 5 and 9 share the maximal priority; the lower id wins.
        assert_eq!(plic.claim(), 5);
        assert_eq!(plic.claim(), 9);
        assert_eq!(plic.claim(), 2);
        assert_eq!(plic.claim(), 12);
        assert_eq!(plic.claim(), 0);
    }

    #[test]
    fn complete_then_reassert() {
        let mut plic = armed(1, 5);
        plic.refresh_pending(vec![(1, true)]);
        assert_eq!(plic.claim(), 1);
        plic.complete(1);
        assert!(!plic.is_served(1));
        // Completed but not re-asserted: not claimable.
        assert_eq!(plic.claim(), 0);
        // The peripheral still holds its line; the next poll re-latches.
        plic.refresh_pending(vec![(1, true)]);
        assert!(plic.has_pending());
        assert_eq!(plic.claim(), 1);
    }

    #[test]
    fn reassert_between_claim_and_complete() {
        // Pending and served are independent; a source may become pending
        // again before its previous claim is completed.
        let mut plic = armed(1, 5);
        plic.refresh_pending(vec![(1, true)]);
        assert_eq!(plic.claim(), 1);
        plic.refresh_pending(vec![(1, true)]);
        assert!(plic.is_served(1));
        assert!(plic.is_pending(1));
        assert_eq!(plic.claim(), 1);
    }

    #[test]
    fn poll_never_clears_recorded_requests() {
        let mut plic = armed(7, 1);
        plic.refresh_pending(vec![(7, true)]);
        // The line dropped before the next poll; the request stays latched.
        plic.refresh_pending(vec![(7, false)]);
        assert!(plic.is_pending(7));
    }

    #[test]
    fn unregistered_sources_are_not_latched() {
        let mut plic = Plic::new();
        plic.refresh_pending(vec![(4, true)]);
        assert!(!plic.is_pending(4));

        plic.register_source(4);
        assert_eq!(plic.registered_sources().collect::<Vec<_>>(), vec![4]);
        plic.refresh_pending(vec![(4, true)]);
        assert!(plic.is_pending(4));
        plic.unregister_source(4);
        assert_eq!(plic.registered_sources().count(), 0);
    }

    #[test]
    fn register_window() {
        let mut plic = armed(1, 6);
        plic.refresh_pending(vec![(1, true)]);

        // Priority word for source 1.
        assert_eq!(plic.io_read_const(PLIC_PRIORITY + 4, 32), 6);
        plic.io_write(PLIC_PRIORITY + 4, 9, 32);
        assert_eq!(plic.priority(1), 9);

        // Pending word 0 has bit 1 set and ignores writes.
        assert_eq!(plic.io_read_const(PLIC_PENDING, 32), 1 << 1);
        plic.io_write(PLIC_PENDING, 0, 32);
        assert_eq!(plic.io_read_const(PLIC_PENDING, 32), 1 << 1);

        // Enable word 0.
        assert_eq!(plic.io_read_const(PLIC_ENABLE, 32), 1 << 1);
        plic.io_write(PLIC_ENABLE, 0xFFFF_FFFF, 32);
        assert!(plic.is_enabled(31));

        // Threshold.
        plic.io_write(PLIC_THRESHOLD, 3, 32);
        assert_eq!(plic.io_read_const(PLIC_THRESHOLD, 32), 3);

        // Claim via register read, complete via register write.
        assert_eq!(plic.io_read(PLIC_CLAIM, 32), 1);
        assert!(plic.is_served(1));
        plic.io_write(PLIC_CLAIM, 1, 32);
        assert!(!plic.is_served(1));
    }

    #[test]
    fn const_read_of_claim_register_has_no_side_effects() {
        let mut plic = armed(1, 5);
        plic.refresh_pending(vec![(1, true)]);
        assert_eq!(plic.io_read_const(PLIC_CLAIM, 32), 1);
        assert!(plic.is_pending(1));
        assert!(!plic.is_served(1));
    }

    #[test]
    fn out_of_range_offsets_read_zero_and_ignore_writes() {
        let mut plic = Plic::new();
        assert_eq!(plic.io_read(PLIC_BYTE_SIZE, 32), 0);
        assert_eq!(plic.io_read(0x123456, 32), 0);
        plic.io_write(0x123456, 0xdead, 32);
        assert!(!plic.has_pending());
    }

    #[test]
    fn reset_clears_register_state_but_keeps_wiring() {
        let mut plic = armed(1, 5);
        plic.refresh_pending(vec![(1, true)]);
        plic.set_threshold(2);
        plic.claim();
        plic.reset();
        assert_eq!(plic.priority(1), 0);
        assert!(!plic.is_pending(1));
        assert!(!plic.is_enabled(1));
        assert_eq!(plic.threshold(), 0);
        assert!(!plic.is_served(1));
        assert!(plic.is_registered(1));
    }
}
