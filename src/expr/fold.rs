use crate::expr::def::{binary, BinOp, PrimExpr};

/// Floor division, rounding toward negative infinity.
pub fn floordiv_i64(a: i64, b: i64) -> i64 {
    let q = a / b;
    let r = a % b;
    if r != 0 && (r < 0) != (b < 0) {
        q - 1
    } else {
        q
    }
}

/// Floor modulo; the result has the sign of `b`.
pub fn floormod_i64(a: i64, b: i64) -> i64 {
    a - floordiv_i64(a, b) * b
}

/// Fold a binary node whose operands are both literals.
///
/// Division by a zero constant never folds; the unfolded node is left for a
/// later failure path to report.
pub fn try_const_fold(op: BinOp, lhs: &PrimExpr, rhs: &PrimExpr) -> Option<PrimExpr> {
    if let (PrimExpr::Int(a), PrimExpr::Int(b)) = (lhs, rhs) {
        let (a, b) = (*a, *b);
        let v = match op {
            BinOp::Add => PrimExpr::Int(a + b),
            BinOp::Sub => PrimExpr::Int(a - b),
            BinOp::Mul => PrimExpr::Int(a * b),
            BinOp::FloorDiv if b != 0 => PrimExpr::Int(floordiv_i64(a, b)),
            BinOp::FloorMod if b != 0 => PrimExpr::Int(floormod_i64(a, b)),
            BinOp::FloorDiv | BinOp::FloorMod => return None,
            BinOp::Min => PrimExpr::Int(a.min(b)),
            BinOp::Max => PrimExpr::Int(a.max(b)),
            BinOp::Lt => PrimExpr::Bool(a < b),
            BinOp::Le => PrimExpr::Bool(a <= b),
            BinOp::Gt => PrimExpr::Bool(a > b),
            BinOp::Ge => PrimExpr::Bool(a >= b),
            BinOp::Eq => PrimExpr::Bool(a == b),
            BinOp::And => return None,
        };
        return Some(v);
    }
    if let (PrimExpr::Bool(a), PrimExpr::Bool(b)) = (lhs, rhs) {
        if op == BinOp::And {
            return Some(PrimExpr::Bool(*a && *b));
        }
    }
    None
}

/// Addition that folds literal operands and drops zeros.
pub fn fold_add(lhs: PrimExpr, rhs: PrimExpr) -> PrimExpr {
    if lhs.is_zero() {
        return rhs;
    }
    if rhs.is_zero() {
        return lhs;
    }
    try_const_fold(BinOp::Add, &lhs, &rhs).unwrap_or_else(|| binary(BinOp::Add, lhs, rhs))
}

/// Subtraction that folds literal operands and drops a zero right side.
pub fn fold_sub(lhs: PrimExpr, rhs: PrimExpr) -> PrimExpr {
    if rhs.is_zero() {
        return lhs;
    }
    try_const_fold(BinOp::Sub, &lhs, &rhs).unwrap_or_else(|| binary(BinOp::Sub, lhs, rhs))
}

pub fn fold_neg(e: PrimExpr) -> PrimExpr {
    match e {
        PrimExpr::Int(v) => PrimExpr::Int(-v),
        other => fold_sub(PrimExpr::Int(0), other),
    }
}

/// Multiplication that folds literals and the 0/1 neutral cases.
pub fn fold_mul(lhs: PrimExpr, rhs: PrimExpr) -> PrimExpr {
    if lhs.is_zero() || rhs.is_zero() {
        return PrimExpr::Int(0);
    }
    if lhs.is_one() {
        return rhs;
    }
    if rhs.is_one() {
        return lhs;
    }
    try_const_fold(BinOp::Mul, &lhs, &rhs).unwrap_or_else(|| binary(BinOp::Mul, lhs, rhs))
}

/// Floor division that folds literals and division by one.
pub fn fold_floordiv(lhs: PrimExpr, rhs: PrimExpr) -> PrimExpr {
    if rhs.is_one() {
        return lhs;
    }
    try_const_fold(BinOp::FloorDiv, &lhs, &rhs).unwrap_or_else(|| binary(BinOp::FloorDiv, lhs, rhs))
}

/// Conjunction that drops a literal `true` side.
pub fn fold_and(lhs: PrimExpr, rhs: PrimExpr) -> PrimExpr {
    if lhs.is_true() {
        return rhs;
    }
    if rhs.is_true() {
        return lhs;
    }
    binary(BinOp::And, lhs, rhs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::def::var;

    #[test]
    fn floor_semantics_on_negatives() {
        assert_eq!(floordiv_i64(-1, 4), -1);
        assert_eq!(floormod_i64(-1, 4), 3);
        assert_eq!(floordiv_i64(7, -2), -4);
        assert_eq!(floormod_i64(7, -2), -1);
        assert_eq!(floordiv_i64(8, 4), 2);
    }

    #[test]
    fn builders_fold_neutral_elements() {
        let x = var("x");
        assert_eq!(fold_add(PrimExpr::Int(0), x.clone()), x);
        assert_eq!(fold_mul(x.clone(), PrimExpr::Int(1)), x);
        assert_eq!(fold_mul(x.clone(), PrimExpr::Int(0)), PrimExpr::Int(0));
        assert_eq!(fold_floordiv(x.clone(), PrimExpr::Int(1)), x);
        assert_eq!(
            fold_add(PrimExpr::Int(2), PrimExpr::Int(3)),
            PrimExpr::Int(5)
        );
    }

    #[test]
    fn division_by_zero_never_folds() {
        assert!(try_const_fold(BinOp::FloorDiv, &PrimExpr::Int(4), &PrimExpr::Int(0)).is_none());
        assert!(try_const_fold(BinOp::FloorMod, &PrimExpr::Int(4), &PrimExpr::Int(0)).is_none());
    }
}
