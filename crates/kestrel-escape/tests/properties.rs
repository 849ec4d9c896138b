//! Invariant and boundary-behaviour checks over the public entry points.

mod common;

use common::*;
use kestrel_dfir::{Callee, IrId, Lifetime};
use kestrel_escape::{EscapeConfig, EscapeError, FunctionSummary, SummaryKind, SummaryNode};
use rustc_hash::FxHashMap;

// ---------------------------------------------------------------------------
// Output-map invariants
// ---------------------------------------------------------------------------

/// Every allocation site appears in the map exactly once, with one of the
/// two emitted lifetimes.
#[test]
fn every_allocation_site_is_mapped_once() {
    let mut tm = TestModule::new();
    let mut f = FnBuilder::new(0);
    let a = f.new_object(ANY_TY, &[], 1, Callee::External(ANY_INIT));
    let _ = f.variable(&[a]);
    let b = f.new_object(ANY_TY, &[], 2, Callee::External(ANY_INIT));
    let vb = f.variable(&[b]);
    f.ret(vb);
    tm.install("f", f);

    let mut g = FnBuilder::new(1);
    let len = g.int(4);
    g.new_object(INT_ARRAY_TY, &[len], 3, Callee::External(INT_ARRAY_INIT));
    tm.install("g", g);

    let (lifetimes, _) = tm.run();
    assert_eq!(lifetimes.len(), 3);
    for ir in [1, 2, 3] {
        let lifetime = lifetimes[&IrId(ir)];
        assert!(
            lifetime == Lifetime::Stack || lifetime == Lifetime::Global,
            "emitted lifetime must collapse, got {lifetime}"
        );
    }
}

/// The map must be empty at entry.
#[test]
fn stale_lifetime_map_is_rejected() {
    let tm = TestModule::new();
    let mut lifetimes = FxHashMap::default();
    lifetimes.insert(IrId(99), Lifetime::Global);
    let result = kestrel_escape::compute_lifetimes(
        &tm.context,
        &tm.module,
        &tm.external,
        &tm.call_graph,
        &mut lifetimes,
    );
    assert!(matches!(result, Err(EscapeError::LifetimesNotEmpty(1))));
}

/// Summary well-formedness: drain indices in range, edges sorted and unique.
#[test]
fn summaries_are_well_formed() {
    let mut tm = TestModule::new();
    let mut f = FnBuilder::new(2);
    let p0 = f.param(0);
    let p1 = f.param(1);
    let v = f.variable(&[p0, p1]);
    let x = f.new_object(ANY_TY, &[], 4, Callee::External(ANY_INIT));
    f.field_write(Some(v), field(7, "next"), x);
    f.ret(v);
    tm.install("f", f);

    for summary in tm.summaries().values() {
        let in_range = |node: &SummaryNode| match node.kind {
            SummaryKind::Drain(k) => k < summary.num_drains(),
            _ => true,
        };
        for edge in summary.edges() {
            assert!(in_range(&edge.from) && in_range(&edge.to), "{summary}");
        }
        for node in summary.escapes() {
            assert!(in_range(node), "{summary}");
        }
        let mut sorted = summary.edges().to_vec();
        sorted.sort();
        sorted.dedup();
        assert_eq!(summary.edges(), sorted.as_slice(), "{summary}");
    }
}

// ---------------------------------------------------------------------------
// Stack-array budget
// ---------------------------------------------------------------------------

/// Three arrays of 32 012 bytes each: two fit the 65 536-byte frame budget,
/// the third is forced to the heap.
#[test]
fn frame_budget_caps_stack_arrays() {
    let mut tm = TestModule::new();
    let mut f = FnBuilder::new(0);
    for ir in [10, 11, 12] {
        let len = f.int(8000);
        let a = f.new_object(INT_ARRAY_TY, &[len], ir, Callee::External(INT_ARRAY_INIT));
        let _ = f.variable(&[a]);
    }
    tm.install("f", f);

    let (lifetimes, stats) = tm.run();
    let stack = [10, 11, 12]
        .iter()
        .filter(|&&ir| lifetimes[&IrId(ir)] == Lifetime::Stack)
        .count();
    assert_eq!(stack, 2);
    assert_eq!(stats.stack_allocations, 2);
    assert_eq!(stats.heap_allocations, 1);
    // 2 * (8 + 4 + 4 * 8000) = 64 024 <= 65 536; a third would overflow.
}

/// An array whose length is not a compile-time constant can never be
/// budgeted and is forced to the heap.
#[test]
fn unsized_array_is_forced_to_heap() {
    let mut tm = TestModule::new();
    let mut f = FnBuilder::new(1);
    let n = f.param(0);
    let a = f.new_object(INT_ARRAY_TY, &[n], 20, Callee::External(INT_ARRAY_INIT));
    let _ = f.variable(&[a]);
    tm.install("f", f);

    let (lifetimes, _) = tm.run();
    assert_eq!(lifetimes[&IrId(20)], Lifetime::Global);
}

// ---------------------------------------------------------------------------
// Forced-heap propagation
// ---------------------------------------------------------------------------

/// A budget-rejected array drags everything stored in it to the heap.
#[test]
fn forcing_propagates_to_stored_values() {
    let mut tm = TestModule::new();
    let mut f = FnBuilder::new(0);
    let big_len = f.int(9000);
    let big = f.new_object(REF_ARRAY_TY, &[big_len], 30, Callee::External(REF_ARRAY_INIT));
    let vb = f.variable(&[big]);
    let small_len = f.int(10);
    let small = f.new_object(INT_ARRAY_TY, &[small_len], 31, Callee::External(INT_ARRAY_INIT));
    let vs = f.variable(&[small]);
    f.array_write(vb, vs);
    tm.install("f", f);

    // 8 + 4 + 8 * 9000 = 72 012 > 65 536: rejected on its own.
    let (lifetimes, _) = tm.run();
    assert_eq!(lifetimes[&IrId(30)], Lifetime::Global);
    assert_eq!(
        lifetimes[&IrId(31)],
        Lifetime::Global,
        "heap residency must propagate into stored values"
    );

    // The experimental non-propagating configuration keeps the small array
    // on the stack.
    let config = EscapeConfig {
        propagate_forced_to_heap: false,
        ..EscapeConfig::default()
    };
    let (lifetimes, _) = tm.run_with_config(&config);
    assert_eq!(lifetimes[&IrId(30)], Lifetime::Global);
    assert_eq!(lifetimes[&IrId(31)], Lifetime::Stack);
}

/// Escape flows through annotated constructor edges: publishing the pair
/// publishes its contents.
#[test]
fn annotated_constructor_edges_propagate_escape() {
    let mut tm = TestModule::new();
    let mut f = FnBuilder::new(0);
    let a = f.new_object(ANY_TY, &[], 40, Callee::External(ANY_INIT));
    let va = f.variable(&[a]);
    let b = f.new_object(ANY_TY, &[], 41, Callee::External(ANY_INIT));
    let vb = f.variable(&[b]);
    let pair = f.new_object(PAIR_TY, &[va, vb], 42, Callee::External(PAIR_INIT));
    let vp = f.variable(&[pair]);
    f.field_write(None, field(900, "shared"), vp);
    tm.install("f", f);

    let (lifetimes, _) = tm.run();
    for ir in [40, 41, 42] {
        assert_eq!(lifetimes[&IrId(ir)], Lifetime::Global, "ir {ir}");
    }
}

// ---------------------------------------------------------------------------
// Boundary behaviours
// ---------------------------------------------------------------------------

/// An empty body yields the optimistic summary.
#[test]
fn empty_body_yields_optimistic_summary() {
    let mut tm = TestModule::new();
    let f = FnBuilder::new(0);
    let f_id = tm.install("f", f);
    let summaries = tm.summaries();
    assert_eq!(summaries[&f_id], FunctionSummary::optimistic());
}

/// Storing every parameter into a global escapes them all.
#[test]
fn globally_stored_parameters_escape() {
    let mut tm = TestModule::new();
    let mut f = FnBuilder::new(2);
    let p0 = f.param(0);
    let p1 = f.param(1);
    f.field_write(None, field(800, "g0"), p0);
    f.field_write(None, field(801, "g1"), p1);
    let f_id = tm.install("f", f);

    let summaries = tm.summaries();
    let summary = &summaries[&f_id];
    for index in 0..2 {
        assert!(
            summary.escapes().contains(&SummaryNode::param(index)),
            "parameter {index} must escape: {summary}"
        );
    }
}

/// A thrown allocation escapes.
#[test]
fn thrown_allocation_is_global() {
    let mut tm = TestModule::new();
    let mut f = FnBuilder::new(0);
    let e = f.new_object(ANY_TY, &[], 50, Callee::External(ANY_INIT));
    let v = f.variable(&[e]);
    f.throw(v);
    tm.install("f", f);

    let (lifetimes, _) = tm.run();
    assert_eq!(lifetimes[&IrId(50)], Lifetime::Global);
}

/// Passing an allocation to an unannotated external function or through a
/// virtual call site pessimizes it.
#[test]
fn opaque_and_virtual_callees_are_pessimistic() {
    let mut tm = TestModule::new();
    let mut f = FnBuilder::new(0);
    let a = f.new_object(ANY_TY, &[], 60, Callee::External(ANY_INIT));
    let va = f.variable(&[a]);
    f.call(Callee::External(OPAQUE_FN), &[va], 61);
    tm.install("f", f);

    let mut g = FnBuilder::new(0);
    let b = g.new_object(ANY_TY, &[], 62, Callee::External(ANY_INIT));
    let vb = g.variable(&[b]);
    g.call(Callee::Virtual, &[vb], 63);
    tm.install("g", g);

    let (lifetimes, _) = tm.run();
    assert_eq!(lifetimes[&IrId(60)], Lifetime::Global);
    assert_eq!(lifetimes[&IrId(62)], Lifetime::Global);
}

/// A singleton access other than `Nothing` models a global read; the read
/// value contaminates whatever it is stored into.
#[test]
fn singleton_escapes_but_nothing_does_not() {
    let mut tm = TestModule::new();
    let mut f = FnBuilder::new(0);
    let s = f.singleton(ANY_TY);
    let a = f.new_object(ANY_TY, &[], 70, Callee::External(ANY_INIT));
    let v = f.variable(&[a]);
    f.field_write(Some(s), field(20, "owner"), v);
    tm.install("f", f);

    let mut g = FnBuilder::new(0);
    g.singleton(NOTHING_TY);
    let b = g.new_object(ANY_TY, &[], 71, Callee::External(ANY_INIT));
    let _ = g.variable(&[b]);
    tm.install("g", g);

    let (lifetimes, _) = tm.run();
    assert_eq!(lifetimes[&IrId(70)], Lifetime::Global);
    assert_eq!(lifetimes[&IrId(71)], Lifetime::Stack);
}

/// A summary endpoint that cannot be mapped at the call site drops its edge
/// and surfaces in the statistics instead of corrupting the graph.
#[test]
fn unmappable_call_edges_are_counted() {
    let mut tm = TestModule::new();
    // Annotated with an edge P0 -> P1, but called with a single argument.
    tm.external.publish_function(
        2000,
        kestrel_dfir::FunctionSymbol::new("kfun:kotlin.collections.copyInto", 2)
            .with_annotations(0, vec![0x10, 0, 0]),
    );
    let mut f = FnBuilder::new(0);
    let a = f.new_object(ANY_TY, &[], 80, Callee::External(ANY_INIT));
    let va = f.variable(&[a]);
    f.call(Callee::External(2000), &[va], 81);
    tm.install("f", f);

    let (_, stats) = tm.run();
    assert_eq!(stats.dropped_call_edges, 1);
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

/// Two runs over the same inputs produce identical outputs.
#[test]
fn analysis_is_idempotent() {
    let mut tm = TestModule::new();
    let f_id = tm.declare("f", 1);
    let mut f = FnBuilder::new(1);
    let x = f.param(0);
    let r = f.call(Callee::Local(f_id), &[x], 90);
    let g = f.field_read(Some(r), field(500, "g"), 91);
    f.field_write(None, field(600, "cache"), g);
    let len = f.int(16);
    let a = f.new_object(INT_ARRAY_TY, &[len], 92, Callee::External(INT_ARRAY_INIT));
    let _ = f.variable(&[a]);
    tm.set_body(f_id, f);

    let (first, first_stats) = tm.run();
    let (second, second_stats) = tm.run();
    assert_eq!(first, second);
    assert_eq!(first_stats, second_stats);
    assert_eq!(tm.summaries(), tm.summaries());
}
