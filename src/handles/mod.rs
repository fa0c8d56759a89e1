//! Move-only RAII handles: the operand handle (preg-scoped) and the
//! exclusive handle (xreg-scoped, used by `Scratch`).

pub mod exclusive;
pub mod operand;
