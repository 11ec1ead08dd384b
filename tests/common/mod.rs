#![allow(dead_code)]

use iter_affine::expr::{floordiv_i64, floormod_i64};
use iter_affine::{BinOp, PrimExpr, Range, VarId};
use std::collections::HashMap;

/// Evaluate an expression under a concrete assignment. Booleans evaluate to
/// 0/1 so predicates can share the integer path.
pub fn eval(e: &PrimExpr, env: &HashMap<&str, i64>) -> i64 {
    match e {
        PrimExpr::Int(v) => *v,
        PrimExpr::Bool(b) => *b as i64,
        PrimExpr::Var(name) => *env
            .get(name.as_str())
            .unwrap_or_else(|| panic!("unbound variable {} in test env", name)),
        PrimExpr::Binary { op, lhs, rhs } => {
            let a = eval(lhs, env);
            let b = eval(rhs, env);
            match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::FloorDiv => floordiv_i64(a, b),
                BinOp::FloorMod => floormod_i64(a, b),
                BinOp::Min => a.min(b),
                BinOp::Max => a.max(b),
                BinOp::Lt => (a < b) as i64,
                BinOp::Le => (a <= b) as i64,
                BinOp::Gt => (a > b) as i64,
                BinOp::Ge => (a >= b) as i64,
                BinOp::Eq => (a == b) as i64,
                BinOp::And => ((a != 0) && (b != 0)) as i64,
            }
        }
    }
}

pub fn eval_pred(e: &PrimExpr, env: &HashMap<&str, i64>) -> bool {
    eval(e, env) != 0
}

/// Zero-based input iterators from `(name, extent)` pairs.
pub fn iters(dims: &[(&str, i64)]) -> Vec<(VarId, Range)> {
    dims.iter()
        .map(|(name, extent)| (name.to_string(), Range::from_extent(*extent)))
        .collect()
}

/// Every assignment of the given zero-based domains, as name -> value maps.
pub fn domain<'a>(dims: &[(&'a str, i64)]) -> Vec<HashMap<&'a str, i64>> {
    let mut envs = vec![HashMap::new()];
    for (name, extent) in dims {
        let mut next = Vec::new();
        for env in &envs {
            for v in 0..*extent {
                let mut e = env.clone();
                e.insert(*name, v);
                next.push(e);
            }
        }
        envs = next;
    }
    envs
}
