//! `RegisterAllocator`: the top-level facade (§6) the recompiler actually
//! holds — one `BankCache` per bank, the injected emitter, and the
//! in-block-branch coordinator.

use std::cell::RefCell;
use std::rc::Rc;

use crate::analysis::AnalyzedOp;
use crate::bank::{AbiKind, Bank};
use crate::branch::{BranchCoordinator, CoordinatorState};
use crate::cache::{BankCache, FlushMode};
use crate::emitter::Emitter;
use crate::error::Result;
use crate::fork::ForkGuard;
use crate::handles::exclusive::ExclusiveHandle;
use crate::handles::operand::OperandHandle;
use crate::location::OperandLocation;
use crate::reg::{PregId, XregId};
use crate::revert::{self, RevertableSet};
use crate::state::constraint::Mode;

/// The recompiler's one allocator instance for a block. Owns both banks'
/// caches, the shared emitter, and the branch coordinator driving
/// fork/join regions.
pub struct RegisterAllocator<E: Emitter> {
    gpr: BankCache<E>,
    fpr: BankCache<E>,
    emitter: Rc<RefCell<E>>,
    coordinator: BranchCoordinator<E>,
}

impl<E: Emitter> RegisterAllocator<E> {
    /// Build a fresh allocator for the given ABI, with `emitter` already
    /// injected (callers that need to defer emitter construction can pass
    /// a placeholder and call `set_emitter` before the first realize).
    pub fn new(abi: AbiKind, emitter: E) -> Self {
        let emitter = Rc::new(RefCell::new(emitter));
        let gpr = BankCache::new(Bank::Gpr, abi, emitter.clone());
        let fpr = BankCache::new(Bank::Fpr, abi, emitter.clone());
        let coordinator = BranchCoordinator::new(gpr.clone(), fpr.clone(), emitter.clone());
        Self { gpr, fpr, emitter, coordinator }
    }

    /// `Start()`: reset all tables to block-begin state. Offsets follow a
    /// flat 8-byte stride per preg; the recompiler's real PPC state-block
    /// layout (out of scope here) is expected to use the same shape.
    pub fn start(&mut self) {
        self.gpr.start(|i| (i * 8) as u32);
        self.fpr.start(|i| (i * 16) as u32);
    }

    /// `SetEmitter(e)`: replace the injected code writer in place. Every
    /// outstanding `BankCache`/coordinator clone shares the same
    /// `Rc<RefCell<E>>`, so this is visible to all of them immediately.
    pub fn set_emitter(&mut self, emitter: E) {
        *self.emitter.borrow_mut() = emitter;
    }

    fn cache(&self, bank: Bank) -> &BankCache<E> {
        match bank {
            Bank::Gpr => &self.gpr,
            Bank::Fpr => &self.fpr,
        }
    }

    pub fn use_handle(&self, bank: Bank, preg: PregId, mode: Mode) -> Result<OperandHandle<E>> {
        OperandHandle::use_handle(self.cache(bank).inner.clone(), preg, mode)
    }

    pub fn use_no_imm(&self, bank: Bank, preg: PregId, mode: Mode) -> Result<OperandHandle<E>> {
        OperandHandle::use_no_imm(self.cache(bank).inner.clone(), preg, mode)
    }

    pub fn bind_or_imm(&self, bank: Bank, preg: PregId, mode: Mode) -> Result<OperandHandle<E>> {
        OperandHandle::bind_or_imm(self.cache(bank).inner.clone(), preg, mode)
    }

    pub fn bind(&self, bank: Bank, preg: PregId, mode: Mode) -> Result<OperandHandle<E>> {
        OperandHandle::bind(self.cache(bank).inner.clone(), preg, mode)
    }

    pub fn revertable_bind(&self, bank: Bank, preg: PregId, mode: Mode) -> Result<OperandHandle<E>> {
        OperandHandle::revertable_bind(self.cache(bank).inner.clone(), preg, mode)
    }

    /// `Scratch()` / `Scratch(xreg)`.
    pub fn scratch(&self, bank: Bank, requested: Option<XregId>) -> Result<ExclusiveHandle<E>> {
        ExclusiveHandle::scratch(self.cache(bank).inner.clone(), requested)
    }

    pub fn discard(&self, bank: Bank, set: &[PregId]) -> Result<()> {
        self.cache(bank).discard(set)
    }

    pub fn flush(&self, bank: Bank, set: &[PregId], mode: FlushMode) -> Result<()> {
        self.cache(bank).flush(set, mode)
    }

    pub fn reset(&self, bank: Bank, set: &[PregId]) -> Result<()> {
        self.cache(bank).reset(set)
    }

    pub fn preload(&self, bank: Bank, set: &[PregId]) -> Result<()> {
        self.cache(bank).preload(set)
    }

    /// `Fork()` → `ForkGuard`, driven manually (outside the automatic
    /// per-op coordinator) for callers that manage their own region.
    pub fn fork(&self) -> ForkGuard {
        ForkGuard::capture(&self.gpr, &self.fpr)
    }

    pub fn fix_host_registers(&self, bank: Bank, set: &[PregId]) -> Result<()> {
        self.cache(bank).fix(set)
    }

    pub fn unfix_host_registers(&self, bank: Bank) {
        self.cache(bank).unfix_all()
    }

    pub fn commit(&self) {
        revert::commit(&self.gpr, &self.fpr)
    }

    pub fn revert(&self) {
        revert::revert(&self.gpr, &self.fpr)
    }

    pub fn registers_revertable(&self) -> RevertableSet {
        revert::registers_revertable(&self.gpr, &self.fpr)
    }

    pub fn is_imm(&self, preg: PregId) -> bool {
        self.gpr.is_imm(preg)
    }

    pub fn imm32(&self, preg: PregId) -> Option<u32> {
        self.gpr.imm32(preg)
    }

    /// `SetGPR(p, v)`: feed a constant-propagated literal into the GPR
    /// bank, per §6's `ConstProp` interface table. FPRs never carry
    /// immediates, so this only ever touches the GPR bank's cache.
    pub fn set_gpr(&self, preg: PregId, value: u32) -> Result<()> {
        self.gpr.set_gpr(preg, value)
    }

    /// `ClearGPR(p)`.
    pub fn clear_gpr(&self, preg: PregId) {
        self.gpr.clear_gpr(preg)
    }

    pub fn is_bound(&self, bank: Bank, preg: PregId) -> bool {
        self.cache(bank).is_bound(preg)
    }

    /// `R(p)`: preg `p`'s current location in the GPR bank.
    pub fn r(&self, preg: PregId) -> Result<OperandLocation> {
        self.gpr.physical_location(preg)
    }

    /// `RX(p)`: preg `p`'s current location in the FPR bank.
    pub fn rx(&self, preg: PregId) -> Result<OperandLocation> {
        self.fpr.physical_location(preg)
    }

    /// `RegistersInUse()`: every host register, across both banks, whose
    /// content must survive a call.
    pub fn registers_in_use(&self) -> Vec<XregId> {
        let mut v = self.gpr.registers_in_use();
        v.extend(self.fpr.registers_in_use());
        v
    }

    /// `SanityCheck()`: the conjunction of §8's invariants.
    pub fn sanity_check(&self) -> bool {
        self.gpr.sanity_check().is_empty() && self.fpr.sanity_check().is_empty()
    }

    /// A structured diagnostic listing every specific invariant violation
    /// found, rather than a bare boolean (supplemented for debug-build
    /// diagnostics per the error-handling design).
    pub fn sanity_report(&self) -> Vec<String> {
        let mut report = self.gpr.sanity_check();
        report.extend(self.fpr.sanity_check());
        report
    }

    /// Drive the automatic fork/join coordinator through op `index`. Call
    /// once per op, before taking handles for it. This also keeps both
    /// banks' lookahead state current (see `set_ops`/`begin_instruction`
    /// below), so a caller driving the coordinator every op does not need
    /// to call those separately.
    pub fn step_branch_coordinator(&mut self, ops: &[AnalyzedOp], index: usize) -> Result<()> {
        self.coordinator.step(ops, index)
    }

    /// Install the analyzed op stream the §4.4 spill heuristic's lookahead
    /// scans. For blocks with no in-block branches at all, a caller that
    /// never calls `step_branch_coordinator` still needs this (and
    /// `begin_instruction` below) to get lookahead-driven spill scores
    /// rather than the constant-only dirty-bit term.
    pub fn set_ops(&self, ops: &[AnalyzedOp]) {
        self.gpr.set_ops(ops.to_vec());
        self.fpr.set_ops(ops.to_vec());
    }

    /// Advance the "current instruction" pointer both banks' spill
    /// heuristics read for their lookahead scan. Call once per op, before
    /// taking handles for it.
    pub fn begin_instruction(&self, index: usize) {
        self.gpr.begin_instruction(index);
        self.fpr.begin_instruction(index);
    }

    pub fn coordinator_state(&self) -> CoordinatorState {
        self.coordinator.state()
    }

    pub fn register_fixup(&mut self, target_index: usize, fixup_id: u32) {
        self.coordinator.register_fixup(target_index, fixup_id)
    }
}
