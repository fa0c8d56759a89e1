//! Minimal interface types for the (out-of-scope) block analyzer and
//! constant-propagation pass. The analyzer itself — the component that
//! walks guest bytecode and produces this annotated stream — is an
//! external collaborator; only the shape it hands to the allocator lives
//! here.

use smallvec::SmallVec;
use strum::Display;

use crate::bank::Bank;
use crate::reg::PregId;

/// A preg list sized for the common case (an instruction rarely references
/// more than a handful of guest registers at once).
pub type PregSet = SmallVec<[PregId; 4]>;

/// Direction of an in-block branch relative to the op it is recorded on,
/// per §4.7 step 1.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Target is later in the block.
    Forward,
    /// Target is earlier in the block.
    Backward,
    /// Target is outside the current block (not eligible for fork/join).
    Outside,
}

/// One in-block branch candidate from the analyzer's `BranchInfo` list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchInfo {
    /// Index of the branch instruction within the block's op stream.
    pub address_i: usize,
    /// Index of the branch target within the block's op stream (only
    /// meaningful when `direction != Outside`).
    pub branch_to: usize,
    /// Where the target sits relative to this branch.
    pub direction: Direction,
    /// Whether any op in this branch's region contains a
    /// flush-and-continue hint (forces an unused-preg flush on `Fix`) or a
    /// fallback-to-interpreter instruction.
    pub contains_flush_and_continue: bool,
}

/// Per-op register footprint and metadata the analyzer attaches to every
/// instruction in the block, as consumed by the allocator (§6).
#[derive(Debug, Clone, Default)]
pub struct AnalyzedOp {
    /// GPR pregs read by this op.
    pub regs_in: PregSet,
    /// GPR pregs written by this op.
    pub regs_out: PregSet,
    /// FPR pregs read by this op.
    pub fregs_in: PregSet,
    /// FPR pregs written by this op.
    pub fregs_out: PregSet,
    /// GPR pregs that must remain resident in a host register across this
    /// op regardless of flush boundaries.
    pub gpr_in_use: PregSet,
    /// FPR pregs that must remain resident in a host register across this
    /// op regardless of flush boundaries.
    pub fpr_in_use: PregSet,
    /// GPR pregs whose current value is dead after this op and may be
    /// discarded rather than flushed.
    pub gpr_discardable: PregSet,
    /// FPR pregs whose current value is dead after this op and may be
    /// discarded rather than flushed.
    pub fpr_discardable: PregSet,
    /// Estimated host cycles this op consumes, for downcount batching.
    pub cycles: u32,
    /// Present when this op is itself a branch the coordinator may fold
    /// into a fork region.
    pub branch: Option<BranchInfo>,
    /// Whether this op is a target of some in-block branch (a potential
    /// barrier site).
    pub is_branch_target: bool,
}

impl AnalyzedOp {
    /// Every preg in this bank this op reads or writes, combined — the
    /// shape both the spill heuristic's lookahead and the "is this preg
    /// used by the current instruction" check need.
    pub fn bank_refs(&self, bank: Bank) -> PregSet {
        let (ins, outs) = match bank {
            Bank::Gpr => (&self.regs_in, &self.regs_out),
            Bank::Fpr => (&self.fregs_in, &self.fregs_out),
        };
        ins.iter().chain(outs.iter()).copied().collect()
    }

    /// Pregs in this bank that must stay resident across this op.
    pub fn bank_in_use(&self, bank: Bank) -> &[PregId] {
        match bank {
            Bank::Gpr => &self.gpr_in_use,
            Bank::Fpr => &self.fpr_in_use,
        }
    }

    /// Pregs in this bank whose value is dead after this op.
    pub fn bank_discardable(&self, bank: Bank) -> &[PregId] {
        match bank {
            Bank::Gpr => &self.gpr_discardable,
            Bank::Fpr => &self.fpr_discardable,
        }
    }
}

/// Constant-propagation snapshot interface (GPR bank only; FPRs never
/// carry immediates). The analyzer's const-prop pass (out of scope)
/// implements this; the allocator only ever reads through it.
pub trait ConstProp {
    /// Whether `preg` currently has a known literal value.
    fn has_gpr(&self, preg: PregId) -> bool;

    /// The known literal value for `preg`. Caller must have checked
    /// `has_gpr` first.
    fn get_gpr(&self, preg: PregId) -> u32;

    /// Record a known literal value for `preg`.
    fn set_gpr(&mut self, preg: PregId, value: u32);

    /// Clear any known literal for `preg`.
    fn clear_gpr(&mut self, preg: PregId);
}

/// A plain in-memory `ConstProp` implementation, standing in for the
/// analyzer's real constant-propagation pass in tests and in callers that
/// don't need cross-op propagation beyond what the allocator itself
/// tracks.
#[derive(Debug, Clone, Default)]
pub struct ConstPropTable {
    values: [Option<u32>; crate::consts::PREG_COUNT],
}

impl ConstProp for ConstPropTable {
    fn has_gpr(&self, preg: PregId) -> bool {
        self.values[preg.index()].is_some()
    }

    fn get_gpr(&self, preg: PregId) -> u32 {
        self.values[preg.index()].expect("has_gpr checked by caller")
    }

    fn set_gpr(&mut self, preg: PregId, value: u32) {
        self.values[preg.index()] = Some(value);
    }

    fn clear_gpr(&mut self, preg: PregId) {
        self.values[preg.index()] = None;
    }
}
