//! Admission control for concurrently active VMs.
//!
//! A reservation is represented by an [`AdmissionSlot`] guard. The slot is
//! released when the guard is dropped, so a slot's lifetime follows whoever
//! owns it: the provisioning pipeline while it runs, then the VM's registry
//! record until deprovisioning removes it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Hard ceiling on concurrently active VMs.
#[derive(Debug, Clone)]
pub struct AdmissionController {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    max: usize,
    reserved: AtomicUsize,
}

impl AdmissionController {
    /// Create a controller allowing `max` concurrent reservations.
    pub fn new(max: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max,
                reserved: AtomicUsize::new(0),
            }),
        }
    }

    /// Reserve a slot if one is free.
    ///
    /// The check and the increment are a single atomic step, so concurrent
    /// callers can never push the count past the ceiling.
    pub fn try_reserve(&self) -> Option<AdmissionSlot> {
        let max = self.inner.max;
        self.inner
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| AdmissionSlot {
                controller: self.clone(),
            })
    }

    /// Reserve a slot regardless of the ceiling.
    ///
    /// Only used when re-adopting VMs that survived an agent restart: they
    /// already occupy the host, so refusing them would just hide them.
    pub(crate) fn force_reserve(&self) -> AdmissionSlot {
        self.inner.reserved.fetch_add(1, Ordering::AcqRel);
        AdmissionSlot {
            controller: self.clone(),
        }
    }

    /// Release one slot, never going below zero.
    fn release(&self) {
        let _ = self
            .inner
            .reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Number of slots currently held.
    pub fn reserved(&self) -> usize {
        self.inner.reserved.load(Ordering::Acquire)
    }

    /// Number of slots currently free.
    pub fn available(&self) -> usize {
        self.inner.max.saturating_sub(self.reserved())
    }

    /// Configured ceiling.
    pub fn max(&self) -> usize {
        self.inner.max
    }
}

/// A held admission slot. Dropping it releases the slot.
#[derive(Debug)]
pub struct AdmissionSlot {
    controller: AdmissionController,
}

impl Drop for AdmissionSlot {
    fn drop(&mut self) {
        self.controller.release();
    }
}
