//! Operand locations: the tagged sum type a realized handle resolves to.

use strum::Display;

use crate::reg::XregId;

/// A memory operand addressing a preg's slot in the PowerPC register-file
/// state block. Offsets are relative to the base pointer the emitter (out
/// of scope) keeps resident in a reserved host register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MemOperand {
    /// Byte offset of this preg's slot within the PPC state block.
    pub offset: u32,
}

impl MemOperand {
    /// Build the default memory operand for a preg at the given slot.
    pub const fn new(offset: u32) -> Self {
        Self { offset }
    }
}

/// Where a realized operand concretely lives: a bound host register, an
/// immediate literal (GPR bank only), or a memory operand into the guest
/// state block. Modeled as an explicit sum type rather than a trait object
/// or further polymorphism, per the tagged-operand design note.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandLocation {
    /// Bound to a host register.
    Host(XregId),
    /// A known 32-bit literal, not occupying any host location.
    Immediate(u32),
    /// Resides only in the guest state block.
    Memory(MemOperand),
}

/// The terminal stamp on a `Constraint` recording which location shape a
/// preg was realized to. `Unset` until the first `realize` call for the
/// current lock scope.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Default)]
pub enum RealizedAt {
    /// Not yet realized in the current lock scope.
    #[default]
    Unset,
    /// Realized to a bound host register.
    Bound,
    /// Realized as an immediate literal.
    Imm,
    /// Realized as a bare memory operand.
    Mem,
}
