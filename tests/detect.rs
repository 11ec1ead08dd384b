mod common;

use common::{domain, eval, eval_pred, iters};
use iter_affine::expr::{and_of, floordiv, floormod, ge, lt, var};
use iter_affine::{
    detect_iter_map, normalize_iter_map_to_expr, Analyzer, DiagKind, DiagSink, IterSource,
    IterSplitExpr, IterSumExpr, PrimExpr, Range,
};

fn structured_args(sum: &IterSumExpr) -> Vec<IterSplitExpr> {
    assert_eq!(sum.args.len(), 1, "detected sums are single fused splits");
    match sum.args[0].source.source() {
        IterSource::Sum(inner) => inner.args.clone(),
        IterSource::Value(_) => panic!("fused mark should wrap a structured sum"),
    }
}

#[test]
fn div_mod_split_is_bijective() {
    let ana = Analyzer::new();
    let mut diag = DiagSink::new();
    let input = iters(&[("x", 8), ("y", 6)]);
    let indices = [
        floordiv(var("x"), PrimExpr::Int(4)),
        floormod(var("x"), PrimExpr::Int(4)),
        var("y"),
    ];
    let res = detect_iter_map(&indices, &input, &PrimExpr::Bool(true), true, &ana, &mut diag);
    assert_eq!(res.len(), 3);
    assert!(diag.is_empty());

    for sum in &res {
        assert_eq!(sum.args.len(), 1);
        assert!(sum.args[0].scale.is_one());
        assert!(sum.base.is_zero());
    }
    assert_eq!(res[0].args[0].extent, PrimExpr::Int(2));
    assert_eq!(res[1].args[0].extent, PrimExpr::Int(4));
    assert_eq!(res[2].args[0].extent, PrimExpr::Int(6));

    // x / 4 carves the outer slice, x % 4 the inner one, of one shared mark
    let outer = structured_args(&res[0]);
    let inner = structured_args(&res[1]);
    assert_eq!(outer.len(), 1);
    assert_eq!(outer[0].lower_factor, PrimExpr::Int(4));
    assert_eq!(outer[0].extent, PrimExpr::Int(2));
    assert_eq!(inner[0].lower_factor, PrimExpr::Int(1));
    assert_eq!(inner[0].extent, PrimExpr::Int(4));
    assert!(outer[0].source.same_as(&inner[0].source));
    assert!(!outer[0].source.same_as(&structured_args(&res[2])[0].source));
}

#[test]
fn overlapping_splits_fail_bijective_check() {
    let ana = Analyzer::new();
    let mut diag = DiagSink::new();
    let input = iters(&[("x", 8), ("y", 6)]);
    let indices = [var("x"), var("x") + 1, var("y")];
    let res = detect_iter_map(&indices, &input, &PrimExpr::Bool(true), true, &ana, &mut diag);
    assert!(res.is_empty());
    assert!(diag.has_kind(DiagKind::IncompleteSplit));
    assert!(diag.has_kind(DiagKind::NotIndependent));
    assert!(diag.unresolved_count() > 0);
}

#[test]
fn uncovered_input_fails_only_bijective_mode() {
    let ana = Analyzer::new();
    let input = iters(&[("x", 8), ("y", 6)]);
    let indices = [
        floordiv(var("x"), PrimExpr::Int(4)),
        floormod(var("x"), PrimExpr::Int(4)),
    ];

    let mut diag = DiagSink::new();
    let res = detect_iter_map(&indices, &input, &PrimExpr::Bool(true), true, &ana, &mut diag);
    assert!(res.is_empty());
    assert!(diag.has_kind(DiagKind::UncoveredMark));

    let mut diag = DiagSink::new();
    let res = detect_iter_map(&indices, &input, &PrimExpr::Bool(true), false, &ana, &mut diag);
    assert_eq!(res.len(), 2);
    assert!(diag.is_empty());
}

#[test]
fn indivisible_extent_fails() {
    let ana = Analyzer::new();
    let mut diag = DiagSink::new();
    let input = iters(&[("x", 8)]);
    let indices = [floordiv(var("x"), PrimExpr::Int(3))];
    let res = detect_iter_map(&indices, &input, &PrimExpr::Bool(true), false, &ana, &mut diag);
    assert!(res.is_empty());
    assert!(diag.has_kind(DiagKind::NotDivisible));
}

#[test]
fn predicate_bounds_fuse_nested_group() {
    let ana = Analyzer::new();
    let mut diag = DiagSink::new();
    let input = iters(&[("i", 4), ("j", 5), ("k", 2)]);
    let index = var("i") * 9 + var("j") * 2 + var("k");
    let pred = lt(var("j") * 2 + var("k"), PrimExpr::Int(9));
    let res = detect_iter_map(
        &[index.clone()],
        &input,
        &pred,
        true,
        &ana,
        &mut diag,
    );
    assert_eq!(res.len(), 1);
    assert!(diag.is_empty());

    let sum = &res[0];
    assert_eq!(sum.args.len(), 1);
    assert!(sum.base.is_zero());
    assert_eq!(sum.args[0].source.extent(), PrimExpr::Int(36));

    // the fused source combines i with the predicate-bounded inner group
    let parts = structured_args(sum);
    assert_eq!(parts.len(), 2);
    assert_eq!(parts[0].scale, PrimExpr::Int(9));
    assert!(parts[1].scale.is_one());
    assert_eq!(parts[1].source.extent(), PrimExpr::Int(9));

    // semantic equivalence over the constrained domain
    let normalized = normalize_iter_map_to_expr(sum, &ana);
    for env in domain(&[("i", 4), ("j", 5), ("k", 2)]) {
        if !eval_pred(&pred, &env) {
            continue;
        }
        assert_eq!(eval(&index, &env), eval(&normalized, &env));
    }
}

#[test]
fn lower_bounded_predicate_shifts_base() {
    let ana = Analyzer::new();
    let mut diag = DiagSink::new();
    let input = iters(&[("i", 4), ("j", 5), ("k", 2)]);
    let index = var("i") * 8 + var("j") * 2 + var("k");
    let inner = var("j") * 2 + var("k");
    let pred = and_of(
        ge(inner.clone(), PrimExpr::Int(1)),
        lt(inner, PrimExpr::Int(9)),
    );
    let res = detect_iter_map(
        &[index.clone()],
        &input,
        &pred,
        true,
        &ana,
        &mut diag,
    );
    assert_eq!(res.len(), 1);
    assert!(diag.is_empty());

    let sum = &res[0];
    // the inner group's lower bound surfaces as the outer base offset
    assert_eq!(sum.base, PrimExpr::Int(1));
    assert_eq!(sum.args[0].source.extent(), PrimExpr::Int(32));
    let parts = structured_args(sum);
    assert_eq!(parts.len(), 2);
    let inner_mark = &parts[1].source;
    assert_eq!(inner_mark.extent(), PrimExpr::Int(8));
    let IterSource::Sum(inner_sum) = inner_mark.source() else {
        panic!("inner mark should wrap the bounded group");
    };
    assert_eq!(inner_sum.base, PrimExpr::Int(-1));

    let normalized = normalize_iter_map_to_expr(sum, &ana);
    let pred = and_of(
        ge(var("j") * 2 + var("k"), PrimExpr::Int(1)),
        lt(var("j") * 2 + var("k"), PrimExpr::Int(9)),
    );
    for env in domain(&[("i", 4), ("j", 5), ("k", 2)]) {
        if !eval_pred(&pred, &env) {
            continue;
        }
        assert_eq!(eval(&index, &env), eval(&normalized, &env));
    }
}

#[test]
fn shifted_ranges_keep_semantics() {
    let ana = Analyzer::new();
    let mut diag = DiagSink::new();
    let input = vec![(
        "x".to_string(),
        Range::new(PrimExpr::Int(2), PrimExpr::Int(4)),
    )];
    let index = var("x") * 3;
    let res = detect_iter_map(
        &[index.clone()],
        &input,
        &PrimExpr::Bool(true),
        true,
        &ana,
        &mut diag,
    );
    assert_eq!(res.len(), 1);
    // base carries min*scale, the mark ranges over x - 2
    assert_eq!(res[0].base, PrimExpr::Int(6));
    let normalized = normalize_iter_map_to_expr(&res[0], &ana);
    for x in 2..6 {
        let env = std::collections::HashMap::from([("x", x)]);
        assert_eq!(eval(&index, &env), eval(&normalized, &env));
    }
}

#[test]
fn singleton_ranges_become_constants() {
    let ana = Analyzer::new();
    let mut diag = DiagSink::new();
    let input = vec![
        ("x".to_string(), Range::from_extent(8)),
        ("s".to_string(), Range::new(PrimExpr::Int(3), PrimExpr::Int(1))),
    ];
    let indices = [var("x") + var("s")];
    let res = detect_iter_map(&indices, &input, &PrimExpr::Bool(true), true, &ana, &mut diag);
    assert_eq!(res.len(), 1);
    assert_eq!(res[0].base, PrimExpr::Int(3));
}

#[test]
fn self_referential_ranges_fail_sanity_check() {
    let ana = Analyzer::new();
    let mut diag = DiagSink::new();
    let input = vec![("x".to_string(), Range::new(PrimExpr::Int(0), var("x")))];
    let res = detect_iter_map(
        &[var("x")],
        &input,
        &PrimExpr::Bool(true),
        false,
        &ana,
        &mut diag,
    );
    assert!(res.is_empty());
    assert!(diag.has_kind(DiagKind::SanityFailed));
}

#[test]
fn non_comparison_predicate_is_rejected() {
    let ana = Analyzer::new();
    let mut diag = DiagSink::new();
    let input = iters(&[("x", 8)]);
    let res = detect_iter_map(&[var("x")], &input, &var("x"), false, &ana, &mut diag);
    assert!(res.is_empty());
    assert!(diag.has_kind(DiagKind::BadPredicate));
}

#[test]
fn coverage_products_chain_per_mark() {
    // x in [0, 24) split three ways: lower factors must chain 1 -> 2 -> 12
    let ana = Analyzer::new();
    let mut diag = DiagSink::new();
    let input = iters(&[("x", 24)]);
    let indices = [
        floordiv(var("x"), PrimExpr::Int(12)),
        floormod(floordiv(var("x"), PrimExpr::Int(2)), PrimExpr::Int(6)),
        floormod(var("x"), PrimExpr::Int(2)),
    ];
    let res = detect_iter_map(&indices, &input, &PrimExpr::Bool(true), true, &ana, &mut diag);
    assert_eq!(res.len(), 3);

    let mut splits: Vec<_> = res.iter().map(|s| structured_args(s)[0].clone()).collect();
    splits.sort_by_key(|s| s.lower_factor.as_int().unwrap());
    let mut product = 1;
    for s in &splits {
        assert_eq!(s.lower_factor.as_int().unwrap(), product);
        product *= s.extent.as_int().unwrap();
    }
    assert_eq!(product, 24);
}

#[test]
fn skipped_slice_allowed_without_bijectivity() {
    // leave out the middle slice (x / 2) % 6 of x in [0, 24)
    let ana = Analyzer::new();
    let input = iters(&[("x", 24)]);
    let indices = [
        floordiv(var("x"), PrimExpr::Int(12)),
        floormod(var("x"), PrimExpr::Int(2)),
    ];

    let mut diag = DiagSink::new();
    let res = detect_iter_map(&indices, &input, &PrimExpr::Bool(true), false, &ana, &mut diag);
    assert_eq!(res.len(), 2);

    let mut diag = DiagSink::new();
    let res = detect_iter_map(&indices, &input, &PrimExpr::Bool(true), true, &ana, &mut diag);
    assert!(res.is_empty());
    assert!(diag.has_kind(DiagKind::IncompleteSplit));
}

#[test]
fn overlapping_predicate_groups_are_rejected() {
    // i3*4 + i2 < 15 groups {i3, i2}; i3*4 + i5 < 15 groups {i3, i5}: both
    // claim the i3 term without either group containing the other
    let ana = Analyzer::new();
    let mut diag = DiagSink::new();
    let input = iters(&[("i2", 4), ("i3", 5), ("i5", 4)]);
    let index = var("i3") * 4 + var("i2");
    let pred = and_of(
        lt(var("i3") * 4 + var("i2"), PrimExpr::Int(15)),
        lt(var("i3") * 4 + var("i5"), PrimExpr::Int(15)),
    );
    let res = detect_iter_map(&[index], &input, &pred, false, &ana, &mut diag);
    assert!(res.is_empty());
    assert!(diag.has_kind(DiagKind::OverlappingConstraints));
}
