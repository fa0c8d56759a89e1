//! The xreg-scoped exclusive handle backing `Scratch()` (§6).

use crate::cache::Shared;
use crate::emitter::Emitter;
use crate::error::Result;
use crate::reg::XregId;

/// A scoped, move-only lock on a host register, independent of any guest
/// preg binding. Used for temporaries the emitter needs mid-op (address
/// computation, multi-instruction sequences) that must not be chosen as a
/// spill victim while held.
pub struct ExclusiveHandle<E: Emitter> {
    inner: Shared<E>,
    xreg: XregId,
}

impl<E: Emitter> ExclusiveHandle<E> {
    /// Lock `requested`, or any free register if `None`, spilling if
    /// necessary. Fails with `OutOfRegisters` if none can be freed.
    pub fn scratch(inner: Shared<E>, requested: Option<XregId>) -> Result<Self> {
        let xreg = inner.borrow_mut().lock_scratch_xreg(requested)?;
        Ok(Self { inner, xreg })
    }

    /// The xreg this handle holds locked.
    pub fn xreg(&self) -> XregId {
        self.xreg
    }
}

impl<E: Emitter> Drop for ExclusiveHandle<E> {
    fn drop(&mut self) {
        self.inner.borrow_mut().release_xreg_lock(self.xreg);
    }
}
