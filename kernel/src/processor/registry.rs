//! Processor registry
//!
//! Explicit `CpuId -> ProcessorState` table built once at bring-up. There
//! is no ambient "current processor" global; callers hold a reference to
//! their own entry and pass it down. Cross-CPU access is limited to the
//! mailbox on each entry.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::arch::CpuId;
use crate::processor::ProcessorState;

pub struct ProcessorRegistry {
    cpus: Vec<ProcessorState>,
    /// How many CPUs have completed bring-up.
    online: AtomicUsize,
}

impl ProcessorRegistry {
    /// Allocate state for `count` CPUs. Zero CPUs is a boot-time
    /// misconfiguration and fatal.
    pub(crate) fn new(count: usize) -> Self {
        assert!(count > 0, "processor registry needs at least one CPU");
        let cpus = (0..count)
            .map(|i| ProcessorState::new(CpuId(i as u32)))
            .collect();
        Self {
            cpus,
            online: AtomicUsize::new(0),
        }
    }

    pub fn len(&self) -> usize {
        self.cpus.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cpus.is_empty()
    }

    /// Look up a CPU's state. An unknown id is fatal: ids are assigned at
    /// boot and never change.
    pub fn get(&self, id: CpuId) -> &ProcessorState {
        self.cpus
            .get(id.as_usize())
            .unwrap_or_else(|| panic!("no such processor: {}", id))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessorState> {
        self.cpus.iter()
    }

    /// Count a CPU as online. Called once per CPU at the end of bring-up.
    pub(crate) fn mark_online(&self, id: CpuId) -> usize {
        debug_assert!(id.as_usize() < self.cpus.len());
        self.online.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Total processors that have come online so far.
    pub fn online(&self) -> usize {
        self.online.load(Ordering::Acquire)
    }
}
