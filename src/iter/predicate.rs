use crate::analyzer::Analyzer;
use crate::expr::{BinOp, PrimExpr, Range, VarId};
use rustc_hash::FxHashSet;

/// A predicate-derived range fact on an iterator expression:
/// `lower_bound <= iter < upper_bound`, either side optional.
#[derive(Debug, Clone)]
pub struct IterConstraint {
    pub iter: PrimExpr,
    /// Inclusive lower bound.
    pub lower_bound: Option<PrimExpr>,
    /// Exclusive upper bound.
    pub upper_bound: Option<PrimExpr>,
    /// Node count of `iter`; constraints are rewritten small-to-large so
    /// inner groups are fused before the expressions enclosing them.
    pub size: usize,
}

/// Input ranges must not reference the iterators they bind.
pub fn iter_range_sanity_check(input_iters: &[(VarId, Range)]) -> bool {
    let keys: FxHashSet<&str> = input_iters.iter().map(|(v, _)| v.as_str()).collect();
    let uses_key = |name: &str| keys.contains(name);
    for (_, rng) in input_iters {
        if rng.min.uses_var(&uses_key) || rng.extent.uses_var(&uses_key) {
            return false;
        }
    }
    true
}

fn comparison_parts(e: &PrimExpr) -> Option<(BinOp, &PrimExpr, &PrimExpr)> {
    match e {
        PrimExpr::Binary { op, lhs, rhs }
            if matches!(op, BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge) =>
        {
            Some((*op, lhs.as_ref(), rhs.as_ref()))
        }
        _ => None,
    }
}

/// Break a conjunction of integer comparisons into per-iterator bound
/// constraints. Returns an empty list when the predicate does not decompose;
/// the caller distinguishes that from a literal `true` predicate.
pub fn match_bound_constraints(
    pred: &PrimExpr,
    input_iters: &[(VarId, Range)],
    analyzer: &Analyzer,
) -> Vec<IterConstraint> {
    let iter_names: FxHashSet<&str> = input_iters.iter().map(|(v, _)| v.as_str()).collect();
    let uses_itervar = |name: &str| iter_names.contains(name);

    let mut result = Vec::new();
    let mut pred = pred.clone();
    loop {
        // peel one comparison off the conjunction
        let (op, lhs, rhs, rest) = match &pred {
            PrimExpr::Binary {
                op: BinOp::And,
                lhs,
                rhs,
            } => {
                if let Some((op, a, b)) = comparison_parts(rhs) {
                    (op, a.clone(), b.clone(), Some(lhs.as_ref().clone()))
                } else if let Some((op, a, b)) = comparison_parts(lhs) {
                    (op, a.clone(), b.clone(), Some(rhs.as_ref().clone()))
                } else {
                    return Vec::new();
                }
            }
            other => {
                if let Some((op, a, b)) = comparison_parts(other) {
                    (op, a.clone(), b.clone(), None)
                } else {
                    return Vec::new();
                }
            }
        };

        let (is_greater, is_equal) = match op {
            BinOp::Lt => (false, false),
            BinOp::Le => (false, true),
            BinOp::Gt => (true, false),
            _ => (true, true),
        };

        // only comparisons among integer expressions qualify
        if lhs.is_boolean_valued() || rhs.is_boolean_valued() {
            return Vec::new();
        }

        let mut lhs_expr = lhs;
        let mut rhs_expr = rhs;
        let bound_at_left;
        if lhs_expr.as_int().is_some() || !lhs_expr.uses_var(&uses_itervar) {
            bound_at_left = true;
        } else if rhs_expr.as_int().is_some() || !rhs_expr.uses_var(&uses_itervar) {
            bound_at_left = false;
        } else {
            // both sides mention iterators: shuffle iterator-bearing addends
            // to the left and iterator-free ones to the right through the
            // top-level +/- spine, then let the analyzer tidy both sides
            bound_at_left = false;
            let sum_parts = lhs_expr - rhs_expr;
            let mut iter_side = PrimExpr::Int(0);
            let mut free_side = PrimExpr::Int(0);
            extract_parts(
                &sum_parts,
                true,
                &uses_itervar,
                &mut iter_side,
                &mut free_side,
            );
            lhs_expr = analyzer.simplify(&iter_side);
            rhs_expr = analyzer.simplify(&free_side);
        }

        let (iter, lower_bound, upper_bound) = match (is_greater, bound_at_left) {
            // bound > iter
            (true, true) => {
                let upper = if is_equal { lhs_expr + 1 } else { lhs_expr };
                (rhs_expr, None, Some(upper))
            }
            // iter > bound
            (true, false) => {
                let lower = if is_equal { rhs_expr } else { rhs_expr + 1 };
                (lhs_expr, Some(lower), None)
            }
            // bound < iter
            (false, true) => {
                let lower = if is_equal { lhs_expr } else { lhs_expr + 1 };
                (rhs_expr, Some(lower), None)
            }
            // iter < bound
            (false, false) => {
                let upper = if is_equal { rhs_expr + 1 } else { rhs_expr };
                (lhs_expr, None, Some(upper))
            }
        };

        result.push(IterConstraint {
            iter,
            lower_bound,
            upper_bound,
            size: 0,
        });
        match rest {
            Some(r) => pred = r,
            None => break,
        }
    }
    result
}

/// Walk the top-level +/- spine, moving iterator-bearing parts into
/// `iter_side` and iterator-free parts (negated) into `free_side`.
fn extract_parts(
    part: &PrimExpr,
    sign: bool,
    uses_itervar: &impl Fn(&str) -> bool,
    iter_side: &mut PrimExpr,
    free_side: &mut PrimExpr,
) {
    match part {
        PrimExpr::Binary {
            op: BinOp::Add,
            lhs,
            rhs,
        } => {
            extract_parts(lhs, sign, uses_itervar, iter_side, free_side);
            extract_parts(rhs, sign, uses_itervar, iter_side, free_side);
        }
        PrimExpr::Binary {
            op: BinOp::Sub,
            lhs,
            rhs,
        } => {
            extract_parts(lhs, sign, uses_itervar, iter_side, free_side);
            extract_parts(rhs, !sign, uses_itervar, iter_side, free_side);
        }
        _ => {
            if part.uses_var(uses_itervar) {
                *iter_side = if sign {
                    iter_side.clone() + part.clone()
                } else {
                    iter_side.clone() - part.clone()
                };
            } else {
                *free_side = if sign {
                    free_side.clone() - part.clone()
                } else {
                    free_side.clone() + part.clone()
                };
            }
        }
    }
}
