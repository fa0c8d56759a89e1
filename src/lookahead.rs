//! Distance-to-next-use scan feeding the spill heuristic (§4.4).

use crate::analysis::{AnalyzedOp, PregSet};
use crate::consts::LOOKAHEAD_CAP;
use crate::reg::PregId;

/// For `preg`, scan `ops[from..]` (capped at `LOOKAHEAD_CAP` instructions)
/// and count how many *other* pregs are referenced (read or written, same
/// bank) before `preg` itself is referenced again. This count is the
/// proxy for "distance to next use" the clobber-score formula consumes:
/// the more distinct other pregs show up first, the further away `preg`'s
/// next use is assumed to be, and the cheaper it is to spill.
///
/// `refs` must yield, for each op, the set of pregs (in this bank) it
/// reads or writes — callers pass a closure rather than this module
/// reaching into `AnalyzedOp` directly, since GPR and FPR callers read
/// different fields of the same `AnalyzedOp`.
pub fn distance_to_next_use(
    preg: PregId,
    ops: &[AnalyzedOp],
    from: usize,
    refs: impl Fn(&AnalyzedOp) -> PregSet,
) -> usize {
    let mut seen_other = std::collections::HashSet::new();
    let end = (from + LOOKAHEAD_CAP).min(ops.len());
    for op in &ops[from..end] {
        let this_op_refs = refs(op);
        if this_op_refs.contains(&preg) {
            break;
        }
        for other in this_op_refs {
            seen_other.insert(other);
        }
    }
    seen_other.len()
}
