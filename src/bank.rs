//! Register banks and their fixed host-register allocation orders.

use strum::{Display, EnumIter};

use crate::reg::XregId;

/// Which guest register file a cache instance tracks. GPRs and FPRs are
/// fully independent: separate preg tables, separate xreg tables, separate
/// allocation orders, and only the GPR bank carries constant-propagated
/// immediates.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum Bank {
    /// General-purpose integer registers.
    Gpr,
    /// Floating-point / paired-single registers.
    Fpr,
}

impl Bank {
    /// Whether this bank ever carries a constant-propagated immediate.
    /// FPRs never do (see the data model: "FPRs never carry immediates").
    pub fn supports_immediate(self) -> bool {
        matches!(self, Bank::Gpr)
    }
}

/// Calling convention affecting the GPR allocation order. The FPR order is
/// ABI-independent (XMM6-15 preferred over XMM2-5 on both).
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum AbiKind {
    /// System V AMD64 ABI (Linux/macOS).
    SysV,
    /// Microsoft x64 calling convention.
    Windows,
}

/// Fixed, linearly-scanned allocation order for a bank: the order in which
/// `GetFreeXReg` considers candidate host registers when more than one is
/// free, and the tie-break order when spilling.
///
/// This is a priority list, not a graph-coloring order: the allocator
/// always picks the first free (or, failing that, lowest-scoring) entry by
/// walking this slice front to back.
pub fn allocation_order(bank: Bank, abi: AbiKind) -> &'static [XregId] {
    match bank {
        Bank::Gpr => match abi {
            // Callee-saved first: a binding taken early in a block often
            // lives across a helper call this recompiler itself emits (the
            // slow-path C++ fallback), and a callee-saved host register
            // survives that call for free. R12 leads both orders.
            AbiKind::SysV => &SYSV_GPR_ORDER,
            AbiKind::Windows => &WINDOWS_GPR_ORDER,
        },
        Bank::Fpr => &FPR_ORDER,
    }
}

// x86_64 general-purpose register ids, in the numbering the emitter (out of
// scope) assigns: 0=RAX 1=RCX 2=RDX 3=RBX 4=RSP 5=RBP 6=RSI 7=RDI 8-15=R8-R15.
// RSP (4) and RBP (5) are never allocatable. Three more physical registers
// are reserved for this recompiler's own fixed roles (the PPC state-block
// base pointer, the memory base pointer, and the downcount scratch register)
// regardless of ABI: R13, R14, R15. That leaves 11 allocatable GPRs on
// either ABI, callee-saved first, starting with R12.
static SYSV_GPR_ORDER: [XregId; 11] = [
    XregId::new(12), // R12 (callee-saved)
    XregId::new(3),  // RBX (callee-saved)
    XregId::new(0),  // RAX
    XregId::new(1),  // RCX
    XregId::new(2),  // RDX
    XregId::new(6),  // RSI
    XregId::new(7),  // RDI
    XregId::new(8),  // R8
    XregId::new(9),  // R9
    XregId::new(10), // R10
    XregId::new(11), // R11
];

static WINDOWS_GPR_ORDER: [XregId; 11] = [
    XregId::new(12), // R12 (callee-saved)
    XregId::new(3),  // RBX (callee-saved)
    XregId::new(6),  // RSI (callee-saved on Windows)
    XregId::new(7),  // RDI (callee-saved on Windows)
    XregId::new(0),  // RAX
    XregId::new(1),  // RCX
    XregId::new(2),  // RDX
    XregId::new(8),  // R8
    XregId::new(9),  // R9
    XregId::new(10), // R10
    XregId::new(11), // R11
];

static FPR_ORDER: [XregId; 14] = [
    XregId::new(6),  // XMM6
    XregId::new(7),  // XMM7
    XregId::new(8),  // XMM8
    XregId::new(9),  // XMM9
    XregId::new(10), // XMM10
    XregId::new(11), // XMM11
    XregId::new(12), // XMM12
    XregId::new(13), // XMM13
    XregId::new(14), // XMM14
    XregId::new(15), // XMM15
    XregId::new(2),  // XMM2
    XregId::new(3),  // XMM3
    XregId::new(4),  // XMM4
    XregId::new(5),  // XMM5
];
