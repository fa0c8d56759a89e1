//! The in-block-branch coordinator (§4.7): region selection, fix/unfix,
//! fork/barrier handling, and the Idle/Active state machine.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use strum::Display;

use crate::analysis::{AnalyzedOp, Direction};
use crate::bank::Bank;
use crate::cache::BankCache;
use crate::consts::MAX_PRELOADABLE_REGISTERS;
use crate::emitter::Emitter;
use crate::error::Result;
use crate::fork::ForkGuard;
use crate::reg::PregId;

/// The coordinator's two states (§4.7 state machine table).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// No in-block-branch region is open.
    Idle,
    /// A region is open: bindings are fixed and a fork snapshot is held.
    Active,
}

/// A selected in-block-branch region: which op ends it, which pregs are
/// pinned across it, and where its barriers are.
struct RegionPlan {
    end_index: usize,
    gpr_fixed: Vec<PregId>,
    fpr_fixed: Vec<PregId>,
    barriers: BTreeSet<usize>,
    flush_unused_on_entry: bool,
}

/// §4.7 step 1: greedily extend a region from `start`, folding in every
/// compatible in-block branch found while walking forward, stopping the
/// first time a candidate would overflow either bank's preload budget.
fn plan_region(ops: &[AnalyzedOp], start: usize) -> Option<RegionPlan> {
    let mut end = start;
    let mut gpr_set: BTreeSet<PregId> = BTreeSet::new();
    let mut fpr_set: BTreeSet<PregId> = BTreeSet::new();
    let mut barriers = BTreeSet::new();
    let mut flush_unused_on_entry = false;
    let mut found_any = false;

    for (i, op) in ops.iter().enumerate().skip(start) {
        let Some(branch) = op.branch else { continue };
        if branch.direction == Direction::Outside {
            continue;
        }

        let mut candidate_gpr = gpr_set.clone();
        let mut candidate_fpr = fpr_set.clone();
        candidate_gpr.extend(op.bank_refs(Bank::Gpr));
        candidate_fpr.extend(op.bank_refs(Bank::Fpr));
        if candidate_gpr.len() > MAX_PRELOADABLE_REGISTERS || candidate_fpr.len() > MAX_PRELOADABLE_REGISTERS {
            break;
        }

        gpr_set = candidate_gpr;
        fpr_set = candidate_fpr;
        found_any = true;
        flush_unused_on_entry |= branch.contains_flush_and_continue;

        let reach = match branch.direction {
            Direction::Forward => branch.branch_to,
            Direction::Backward => i + 1,
            Direction::Outside => unreachable!(),
        };
        end = end.max(reach);
        barriers.insert(branch.branch_to.min(ops.len().saturating_sub(1)));
    }

    if !found_any {
        return None;
    }

    Some(RegionPlan {
        end_index: end,
        gpr_fixed: gpr_set.into_iter().collect(),
        fpr_fixed: fpr_set.into_iter().collect(),
        barriers,
        flush_unused_on_entry,
    })
}

/// Drives both banks' caches through an in-block-branch region: fixing
/// pregs at entry, restoring the fork snapshot at every barrier, and
/// unfixing/flushing at exit. Also batches `SUB [downcount]` emission
/// between barriers.
pub struct BranchCoordinator<E: Emitter> {
    gpr: BankCache<E>,
    fpr: BankCache<E>,
    emitter: Rc<RefCell<E>>,
    state: CoordinatorState,
    plan: Option<RegionPlan>,
    fork: Option<ForkGuard>,
    cycles_since_barrier: u32,
    /// Forward-branch fixups registered by the caller, keyed by the target
    /// op index they patch to once that index is reached as a barrier.
    fixups: HashMap<usize, u32>,
}

impl<E: Emitter> BranchCoordinator<E> {
    pub fn new(gpr: BankCache<E>, fpr: BankCache<E>, emitter: Rc<RefCell<E>>) -> Self {
        Self {
            gpr,
            fpr,
            emitter,
            state: CoordinatorState::Idle,
            plan: None,
            fork: None,
            cycles_since_barrier: 0,
            fixups: HashMap::new(),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Register a forward-branch fixup site; patched when the coordinator
    /// reaches `target_index` as a barrier.
    pub fn register_fixup(&mut self, target_index: usize, fixup_id: u32) {
        self.fixups.insert(target_index, fixup_id);
    }

    /// Drive the coordinator through op `index` (call once per op, before
    /// taking handles for it).
    #[tracing::instrument(skip(self, ops))]
    pub fn step(&mut self, ops: &[AnalyzedOp], index: usize) -> Result<()> {
        // Keep both banks' lookahead state current every op, not just while
        // a region is Active: the §4.4 spill heuristic's "distance to next
        // use" term depends on `Inner::ops`/`current_index` regardless of
        // whether the coordinator itself has anything to do this op.
        self.gpr.set_ops(ops.to_vec());
        self.gpr.begin_instruction(index);
        self.fpr.set_ops(ops.to_vec());
        self.fpr.begin_instruction(index);

        self.cycles_since_barrier += ops[index].cycles;

        match self.state {
            CoordinatorState::Idle => {
                if let Some(plan) = plan_region(ops, index) {
                    self.enter_region(plan)?;
                }
            }
            CoordinatorState::Active => {
                let end = self.plan.as_ref().expect("Active implies a plan").end_index;
                if index >= end {
                    self.exit_region(ops, index)?;
                    // Re-run Idle's transition for this same op: a new
                    // region may begin exactly where the old one ended.
                    if let Some(plan) = plan_region(ops, index) {
                        self.enter_region(plan)?;
                    }
                } else if self.plan.as_ref().expect("checked above").barriers.contains(&index) {
                    self.barrier(ops, index);
                }
            }
        }
        Ok(())
    }

    fn enter_region(&mut self, plan: RegionPlan) -> Result<()> {
        self.gpr.fix(&plan.gpr_fixed)?;
        self.fpr.fix(&plan.fpr_fixed)?;

        if plan.flush_unused_on_entry {
            let unused_gpr: Vec<PregId> = (0..crate::consts::PREG_COUNT)
                .map(|i| PregId::new(i as u8))
                .filter(|p| !plan.gpr_fixed.contains(p) && self.gpr.is_bound(*p))
                .collect();
            let unused_fpr: Vec<PregId> = (0..crate::consts::PREG_COUNT)
                .map(|i| PregId::new(i as u8))
                .filter(|p| !plan.fpr_fixed.contains(p) && self.fpr.is_bound(*p))
                .collect();
            self.gpr.flush(&unused_gpr, crate::cache::FlushMode::Full)?;
            self.fpr.flush(&unused_fpr, crate::cache::FlushMode::Full)?;
        }

        self.fork = Some(ForkGuard::capture(&self.gpr, &self.fpr));
        self.cycles_since_barrier = 0;
        self.state = CoordinatorState::Active;
        self.plan = Some(plan);
        Ok(())
    }

    fn barrier(&mut self, ops: &[AnalyzedOp], index: usize) {
        let guard = self.fork.as_ref().expect("Active state always carries a fork guard");
        guard.restore(&self.gpr, &self.fpr);

        self.emitter.borrow_mut().emit_sub_downcount(self.cycles_since_barrier);
        self.cycles_since_barrier = 0;

        let op = &ops[index];
        self.gpr.mark_dirty(&op.bank_refs(Bank::Gpr));
        self.fpr.mark_dirty(&op.bank_refs(Bank::Fpr));

        if let Some(fixup_id) = self.fixups.remove(&index) {
            self.emitter.borrow_mut().patch_fixup(fixup_id);
        }
        tracing::trace!(index, "fork barrier restored");
    }

    fn exit_region(&mut self, ops: &[AnalyzedOp], index: usize) -> Result<()> {
        if self.cycles_since_barrier > 0 {
            self.emitter.borrow_mut().emit_sub_downcount(self.cycles_since_barrier);
            self.cycles_since_barrier = 0;
        }

        self.gpr.unfix_all();
        self.fpr.unfix_all();

        let op = &ops[index];
        let gpr_keep = op.gpr_in_use.clone();
        let fpr_keep = op.fpr_in_use.clone();
        let gpr_flush: Vec<PregId> = (0..crate::consts::PREG_COUNT)
            .map(|i| PregId::new(i as u8))
            .filter(|p| !gpr_keep.contains(p) && self.gpr.is_bound(*p))
            .collect();
        let fpr_flush: Vec<PregId> = (0..crate::consts::PREG_COUNT)
            .map(|i| PregId::new(i as u8))
            .filter(|p| !fpr_keep.contains(p) && self.fpr.is_bound(*p))
            .collect();
        self.gpr.flush(&gpr_flush, crate::cache::FlushMode::Full)?;
        self.fpr.flush(&fpr_flush, crate::cache::FlushMode::Full)?;

        self.fork = None;
        self.plan = None;
        self.state = CoordinatorState::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{BranchInfo, Direction as Dir};
    use crate::bank::AbiKind;
    use crate::emitter::{EmittedOp, RecordingEmitter};

    fn op(cycles: u32) -> AnalyzedOp {
        AnalyzedOp { cycles, ..Default::default() }
    }

    fn coordinator() -> (BranchCoordinator<RecordingEmitter>, Rc<RefCell<RecordingEmitter>>) {
        let emitter = Rc::new(RefCell::new(RecordingEmitter::new()));
        let gpr = BankCache::new(Bank::Gpr, AbiKind::SysV, emitter.clone());
        let fpr = BankCache::new(Bank::Fpr, AbiKind::SysV, emitter.clone());
        (BranchCoordinator::new(gpr, fpr, emitter.clone()), emitter)
    }

    #[test]
    fn idle_stays_idle_on_plain_ops() {
        let (mut coord, _e) = coordinator();
        let ops = vec![op(1), op(1), op(1)];
        for i in 0..ops.len() {
            coord.step(&ops, i).unwrap();
            assert_eq!(coord.state(), CoordinatorState::Idle);
        }
    }

    #[test]
    fn s5_fork_barrier_restores_and_patches_fixup() {
        let (mut coord, emitter) = coordinator();

        let r3 = PregId::new(3);
        {
            let mut h = OperandHandle::bind(coord_gpr_inner(&coord), r3, Mode::Write).unwrap();
            h.realize().unwrap();
        }

        let mut ops = vec![op(1); 21];
        ops[10].branch = Some(BranchInfo {
            address_i: 10,
            branch_to: 15,
            direction: Dir::Forward,
            contains_flush_and_continue: false,
        });
        ops[15].is_branch_target = true;
        // A second, farther-reaching branch keeps the region open past the
        // index-15 barrier so the barrier fires instead of an immediate exit.
        ops[12].branch = Some(BranchInfo {
            address_i: 12,
            branch_to: 20,
            direction: Dir::Forward,
            contains_flush_and_continue: false,
        });

        coord.register_fixup(15, 42);
        coord.step(&ops, 10).unwrap();
        assert_eq!(coord.state(), CoordinatorState::Active);

        for i in 11..15 {
            coord.step(&ops, i).unwrap();
        }
        coord.step(&ops, 15).unwrap();

        assert!(emitter
            .borrow()
            .log()
            .iter()
            .any(|e| matches!(e, EmittedOp::PatchFixup { fixup_id: 42 })));
        assert!(emitter
            .borrow()
            .log()
            .iter()
            .any(|e| matches!(e, EmittedOp::SubDowncount { .. })));
    }

    use crate::handles::operand::OperandHandle;
    use crate::state::constraint::Mode;

    fn coord_gpr_inner(coord: &BranchCoordinator<RecordingEmitter>) -> crate::cache::Shared<RecordingEmitter> {
        coord.gpr.inner.clone()
    }

    #[rstest::rstest]
    #[case(PregId::new(3))]
    #[case(PregId::new(9))]
    #[case(PregId::new(20))]
    fn barrier_restores_the_bound_preg_from_fork_entry(#[case] preg: PregId) {
        let (mut coord, _emitter) = coordinator();
        {
            let mut h = OperandHandle::bind(coord_gpr_inner(&coord), preg, Mode::Write).unwrap();
            h.realize().unwrap();
        }
        let bound_xreg = coord.gpr.physical_location(preg).unwrap();

        let mut ops = vec![op(1); 16];
        ops[5].branch = Some(BranchInfo {
            address_i: 5,
            branch_to: 10,
            direction: Dir::Forward,
            contains_flush_and_continue: false,
        });
        ops[10].is_branch_target = true;
        ops[7].branch = Some(BranchInfo {
            address_i: 7,
            branch_to: 15,
            direction: Dir::Forward,
            contains_flush_and_continue: false,
        });

        coord.step(&ops, 5).unwrap();
        assert_eq!(coord.state(), CoordinatorState::Active);
        for i in 6..=10 {
            coord.step(&ops, i).unwrap();
        }

        assert_eq!(coord.gpr.physical_location(preg).unwrap(), bound_xreg);
        assert!(coord.gpr.is_bound(preg));
    }
}
