//! Allocator error variants.
//!
//! Every variant here is an invariant violation (see the error handling
//! design): a bug in the recompiler driving the allocator, never a
//! recoverable or user-facing condition. There is no retry path; callers
//! abort the compilation and fall back to the interpreter for the block.

use derive_more::Display;

use crate::bank::Bank;
use crate::reg::{PregId, XregId};

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, AllocatorError>;

/// Fatal invariant violations raised by the allocator.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorError {
    /// A second handle on an already-realized preg asked for a location or
    /// revertability incompatible with the recorded constraint.
    #[display(fmt = "constraint conflict on preg {_0:?}")]
    ConstraintConflict(PregId),

    /// A handle's operand was read before `realize` committed a location.
    #[display(fmt = "handle for preg {_0:?} used before realize")]
    UnrealizedHandle(PregId),

    /// Attempted to bind a preg that is already bound to a different xreg
    /// without going through the realize/rebind path.
    #[display(fmt = "preg {_0:?} already bound to {_1:?}")]
    DoubleBind(PregId, XregId),

    /// `Flush` was requested over a set containing a locked preg.
    #[display(fmt = "preg {_0:?} is locked during flush")]
    LockedDuringFlush(PregId),

    /// `Flush` was requested while a preg in the set is under a revertable
    /// transaction.
    #[display(fmt = "preg {_0:?} is revertable during flush")]
    RevertableDuringFlush(PregId),

    /// `Reset` was requested on a preg still bound to a host register.
    #[display(fmt = "preg {_0:?} is bound to {_1:?} during reset")]
    ResetOfBoundRegister(PregId, XregId),

    /// No allocatable host register could be freed: every candidate is
    /// locked or revertable.
    #[display(fmt = "out of host registers")]
    OutOfRegisters,

    /// `Discard` or `Reset` was requested on a preg that is locked or
    /// revertable.
    #[display(fmt = "preg {_0:?} is locked or revertable")]
    LockedOrRevertable(PregId),

    /// `SetGPR` was requested on a preg currently bound to a host
    /// register: the live binding already committed a location `GetGPR`
    /// would then disagree with.
    #[display(fmt = "preg {_0:?} is bound to {_1:?} during SetGPR")]
    SetGprOnBoundRegister(PregId, XregId),

    /// `SetGPR`/`ClearGPR` was requested on a bank that never carries
    /// constant-propagated immediates (the FPR bank).
    #[display(fmt = "bank {_0} does not carry constant-propagated immediates")]
    ImmediateUnsupportedOnBank(Bank),
}

impl std::error::Error for AllocatorError {}
