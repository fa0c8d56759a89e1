//! End-to-end scenarios driving `RegisterAllocator` the way the recompiler
//! would, one instruction at a time.

use ppc_jit_regalloc::allocator::RegisterAllocator;
use ppc_jit_regalloc::bank::{AbiKind, Bank};
use ppc_jit_regalloc::cache::FlushMode;
use ppc_jit_regalloc::emitter::RecordingEmitter;
use ppc_jit_regalloc::location::OperandLocation;
use ppc_jit_regalloc::reg::{PregId, XregId};
use ppc_jit_regalloc::state::constraint::Mode;

#[test]
fn s1_immediate_materialization_on_write() {
    let mut a = RegisterAllocator::new(AbiKind::SysV, RecordingEmitter::new());
    a.start();

    let r3 = PregId::new(3);
    {
        let mut h = a.bind(Bank::Gpr, r3, Mode::Write).unwrap();
        let loc = h.realize().unwrap();
        assert_eq!(loc, OperandLocation::Host(XregId::new(12))); // R12, first SysV
    }

    assert!(a.is_bound(Bank::Gpr, r3));
    assert!(!a.is_imm(r3));
}

#[test]
fn s2_reuse_without_reload() {
    let mut a = RegisterAllocator::new(AbiKind::SysV, RecordingEmitter::new());
    a.start();
    let r3 = PregId::new(3);
    {
        let mut h = a.bind(Bank::Gpr, r3, Mode::Write).unwrap();
        h.realize().unwrap();
    }

    let mut h = a.use_handle(Bank::Gpr, r3, Mode::Read).unwrap();
    let loc = h.realize().unwrap();
    assert_eq!(loc, OperandLocation::Host(XregId::new(12))); // still R12: no reload
}

#[test]
fn s3_spill_under_pressure() {
    let mut a = RegisterAllocator::new(AbiKind::SysV, RecordingEmitter::new());
    a.start();

    let order_len = ppc_jit_regalloc::bank::allocation_order(Bank::Gpr, AbiKind::SysV).len();
    let mut handles = Vec::new();
    for i in 0..order_len {
        let p = PregId::new(i as u8);
        let mut h = a.bind(Bank::Gpr, p, Mode::Write).unwrap();
        h.realize().unwrap();
        handles.push(h);
    }
    drop(handles);

    let r_extra = PregId::new(20);
    let mut h = a.bind(Bank::Gpr, r_extra, Mode::Write).unwrap();
    h.realize().unwrap();
    assert!(a.is_bound(Bank::Gpr, r_extra));
}

#[test]
fn s4_revertable_load_then_revert() {
    let mut a = RegisterAllocator::new(AbiKind::SysV, RecordingEmitter::new());
    a.start();

    let r5 = PregId::new(5);
    {
        let mut h = a.revertable_bind(Bank::Gpr, r5, Mode::Write).unwrap();
        h.realize().unwrap();
    }
    assert!(!a.registers_revertable().gpr.is_empty());

    a.revert();

    assert!(a.registers_revertable().gpr.is_empty());
    assert!(!a.is_bound(Bank::Gpr, r5));
}

#[test]
fn s6_flush_with_maintain_state() {
    let mut a = RegisterAllocator::new(AbiKind::SysV, RecordingEmitter::new());
    a.start();

    let r3 = PregId::new(3);
    let r4 = PregId::new(4);
    for p in [r3, r4] {
        let mut h = a.bind(Bank::Gpr, p, Mode::Write).unwrap();
        h.realize().unwrap();
    }

    a.flush(Bank::Gpr, &[r3, r4], FlushMode::MaintainState).unwrap();

    assert!(a.is_bound(Bank::Gpr, r3));
    assert!(a.is_bound(Bank::Gpr, r4));
}

#[test]
fn full_flush_reestablishes_block_start_invariant() {
    let mut a = RegisterAllocator::new(AbiKind::SysV, RecordingEmitter::new());
    a.start();
    let r3 = PregId::new(3);
    {
        let mut h = a.bind(Bank::Gpr, r3, Mode::Write).unwrap();
        h.realize().unwrap();
    }
    let all: Vec<PregId> = (0..32).map(PregId::new).collect();
    a.flush(Bank::Gpr, &all, FlushMode::Full).unwrap();
    a.flush(Bank::Fpr, &all, FlushMode::Full).unwrap();

    assert!(a.sanity_check());
    for p in &all {
        assert!(!a.is_bound(Bank::Gpr, *p));
    }
}

#[test]
fn bind_upgrade_from_mem_does_not_double_lock() {
    let mut a = RegisterAllocator::new(AbiKind::SysV, RecordingEmitter::new());
    a.start();
    let r7 = PregId::new(7);

    // The first handle realizes to Mem and is kept alive (not dropped):
    // the second Bind handle joins the *same* lock scope, which is the
    // §8 boundary case ("a second Bind on a preg whose existing
    // realization is Mem must upgrade to Bound").
    let mut h1 = a.use_handle(Bank::Gpr, r7, Mode::Read).unwrap();
    let first_loc = h1.realize().unwrap();
    assert_eq!(first_loc, OperandLocation::Memory(ppc_jit_regalloc::location::MemOperand::new(56)));

    let mut h2 = a.bind(Bank::Gpr, r7, Mode::Write).unwrap();
    let upgraded = h2.realize().unwrap();
    assert!(matches!(upgraded, OperandLocation::Host(_)));
    assert!(a.is_bound(Bank::Gpr, r7));
    // h1's own view of the location must reflect the upgrade too: both
    // handles share one accumulated constraint on the same preg.
    assert_eq!(h1.location().unwrap(), upgraded);
}
