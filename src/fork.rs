//! `ForkGuard`: the RAII snapshot/restore primitive behind an in-block
//! fork region (§4.7 steps 3-4).
//!
//! Only the two cached-state tables are snapshotted, not constraint
//! records — constraints reset between ops regardless, so carrying them
//! across a fork would be pure overhead (see the fork-snapshot design
//! note).

use crate::cache::{BankCache, BankSnapshot};
use crate::emitter::Emitter;

/// Owns a point-in-time copy of both banks' cached-state tables, taken at
/// a fork region's head. Dropping the guard simply frees the snapshot;
/// restoring into the live caches is an explicit call the coordinator
/// makes at each barrier, not something `Drop` does on its own.
pub struct ForkGuard {
    gpr: BankSnapshot,
    fpr: BankSnapshot,
}

impl ForkGuard {
    /// Snapshot both banks at the current instant.
    pub fn capture<E: Emitter>(gpr: &BankCache<E>, fpr: &BankCache<E>) -> Self {
        Self { gpr: gpr.snapshot(), fpr: fpr.snapshot() }
    }

    /// Restore both banks to the captured snapshot.
    pub fn restore<E: Emitter>(&self, gpr: &BankCache<E>, fpr: &BankCache<E>) {
        gpr.restore(&self.gpr);
        fpr.restore(&self.fpr);
    }
}
