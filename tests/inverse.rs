mod common;

use common::{domain, eval, eval_pred, iters};
use iter_affine::expr::{floordiv, floormod, lt, var};
use iter_affine::{detect_iter_map, inverse_affine_iter_map, Analyzer, DiagSink, PrimExpr};
use std::collections::HashMap;

#[test]
fn inverse_recovers_split_variables() {
    let ana = Analyzer::new();
    let mut diag = DiagSink::new();
    let input = iters(&[("x", 8), ("y", 6)]);
    let indices = [
        floordiv(var("x"), PrimExpr::Int(4)),
        floormod(var("x"), PrimExpr::Int(4)),
        var("y"),
    ];
    let maps = detect_iter_map(&indices, &input, &PrimExpr::Bool(true), true, &ana, &mut diag);
    assert_eq!(maps.len(), 3);

    let outputs = [var("o0"), var("o1"), var("o2")];
    let inverse = inverse_affine_iter_map(&maps, &outputs, &ana);
    assert_eq!(inverse.len(), 2);

    // x comes back as o0*4 + o1, y as o2
    for env in domain(&[("x", 8), ("y", 6)]) {
        let mut out_env: HashMap<&str, i64> = HashMap::new();
        out_env.insert("o0", eval(&indices[0], &env));
        out_env.insert("o1", eval(&indices[1], &env));
        out_env.insert("o2", eval(&indices[2], &env));
        assert_eq!(eval(&inverse["x"], &out_env), env["x"]);
        assert_eq!(eval(&inverse["y"], &out_env), env["y"]);
    }
}

#[test]
fn inverse_descends_into_fused_marks() {
    let ana = Analyzer::new();
    let mut diag = DiagSink::new();
    let input = iters(&[("i", 4), ("j", 5), ("k", 2)]);
    let index = var("i") * 9 + var("j") * 2 + var("k");
    let pred = lt(var("j") * 2 + var("k"), PrimExpr::Int(9));
    let maps = detect_iter_map(&[index.clone()], &input, &pred, true, &ana, &mut diag);
    assert_eq!(maps.len(), 1);

    let outputs = [var("o")];
    let inverse = inverse_affine_iter_map(&maps, &outputs, &ana);
    assert_eq!(inverse.len(), 3);

    for env in domain(&[("i", 4), ("j", 5), ("k", 2)]) {
        if !eval_pred(&pred, &env) {
            continue;
        }
        let out_env = HashMap::from([("o", eval(&index, &env))]);
        assert_eq!(eval(&inverse["i"], &out_env), env["i"]);
        assert_eq!(eval(&inverse["j"], &out_env), env["j"]);
        assert_eq!(eval(&inverse["k"], &out_env), env["k"]);
    }
}

#[test]
fn inverse_distinguishes_output_permutations() {
    let ana = Analyzer::new();
    let mut diag = DiagSink::new();
    let input = iters(&[("x", 6), ("y", 4)]);
    let indices = [var("y"), var("x")];
    let maps = detect_iter_map(&indices, &input, &PrimExpr::Bool(true), true, &ana, &mut diag);
    assert_eq!(maps.len(), 2);

    let outputs = [var("o0"), var("o1")];
    let inverse = inverse_affine_iter_map(&maps, &outputs, &ana);
    for env in domain(&[("x", 6), ("y", 4)]) {
        let out_env = HashMap::from([("o0", env["y"]), ("o1", env["x"])]);
        assert_eq!(eval(&inverse["x"], &out_env), env["x"]);
        assert_eq!(eval(&inverse["y"], &out_env), env["y"]);
    }
}
