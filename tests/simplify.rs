mod common;

use common::{domain, eval, eval_pred, iters};
use iter_affine::expr::{floordiv, floormod, lt, var};
use iter_affine::{iter_map_simplify, PrimExpr, Range};

#[test]
fn div_mod_recombination_round_trips() {
    let input = iters(&[("x", 8)]);
    let index = floordiv(var("x"), PrimExpr::Int(4)) * 4 + floormod(var("x"), PrimExpr::Int(4));
    let res = iter_map_simplify(&[index.clone()], &input, &PrimExpr::Bool(true), false);
    assert_eq!(res.len(), 1);
    for env in domain(&[("x", 8)]) {
        assert_eq!(eval(&res[0], &env), eval(&index, &env));
        assert_eq!(eval(&res[0], &env), env["x"]);
    }
}

#[test]
fn outermost_slice_drops_redundant_modulo() {
    let input = iters(&[("x", 8)]);
    let index = floordiv(var("x"), PrimExpr::Int(4));
    let res = iter_map_simplify(&[index], &input, &PrimExpr::Bool(true), false);
    assert_eq!(res, vec![floordiv(var("x"), PrimExpr::Int(4))]);
}

#[test]
fn failed_detection_returns_inputs_unchanged() {
    let input = iters(&[("x", 8)]);
    let index = floordiv(var("x"), PrimExpr::Int(3));
    let res = iter_map_simplify(&[index.clone()], &input, &PrimExpr::Bool(true), false);
    assert_eq!(res, vec![index]);
}

#[test]
fn sanity_violation_returns_inputs_unchanged() {
    let input = vec![("x".to_string(), Range::new(PrimExpr::Int(0), var("x")))];
    let index = var("x") + 1;
    let res = iter_map_simplify(&[index.clone()], &input, &PrimExpr::Bool(true), false);
    assert_eq!(res, vec![index]);
}

#[test]
fn fused_index_round_trips_under_predicate() {
    let input = iters(&[("i", 4), ("j", 5), ("k", 2)]);
    let index = var("i") * 9 + var("j") * 2 + var("k");
    let pred = lt(var("j") * 2 + var("k"), PrimExpr::Int(9));
    let res = iter_map_simplify(&[index.clone()], &input, &pred, true);
    assert_eq!(res.len(), 1);
    for env in domain(&[("i", 4), ("j", 5), ("k", 2)]) {
        if !eval_pred(&pred, &env) {
            continue;
        }
        assert_eq!(eval(&res[0], &env), eval(&index, &env));
    }
}

#[test]
fn scaled_index_round_trips() {
    // smallest constant scale is 3, so the fused mark is stored relative to it
    let input = iters(&[("x", 8)]);
    let index = var("x") * 3;
    let res = iter_map_simplify(&[index.clone()], &input, &PrimExpr::Bool(true), true);
    assert_eq!(res.len(), 1);
    for env in domain(&[("x", 8)]) {
        assert_eq!(eval(&res[0], &env), eval(&index, &env));
    }
}
