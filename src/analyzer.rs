use crate::expr::{binary, try_const_fold, BinOp, PrimExpr};
use crate::expr::{floormod_i64, fold_add, fold_mul, fold_sub};
use std::collections::BTreeMap;

/// Symbolic integer analyzer.
///
/// Sound but incomplete: `can_prove*` may answer `false` for true facts, but
/// never `true` for false ones. The engine treats every negative answer as
/// "unknown" and fails the corresponding rewrite.
#[derive(Debug, Default)]
pub struct Analyzer;

/// A linear combination of non-linear atoms plus a constant.
///
/// Atoms are whatever simplified subtrees cannot be decomposed further
/// (variables, floordiv/floormod/min/max nodes, products of two symbols).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct LinForm {
    terms: BTreeMap<PrimExpr, i64>,
    konst: i64,
}

impl LinForm {
    fn konst(v: i64) -> Self {
        Self {
            terms: BTreeMap::new(),
            konst: v,
        }
    }

    fn atom(e: PrimExpr) -> Self {
        let mut terms = BTreeMap::new();
        terms.insert(e, 1);
        Self { terms, konst: 0 }
    }

    /// Decompose an already-simplified expression over `+`, `-` and
    /// multiplication by constants.
    fn of(e: &PrimExpr) -> Self {
        match e {
            PrimExpr::Int(v) => Self::konst(*v),
            PrimExpr::Binary { op, lhs, rhs } => match op {
                BinOp::Add => Self::of(lhs).combine(&Self::of(rhs), 1),
                BinOp::Sub => Self::of(lhs).combine(&Self::of(rhs), -1),
                BinOp::Mul => {
                    let l = Self::of(lhs);
                    let r = Self::of(rhs);
                    if l.terms.is_empty() {
                        r.scaled(l.konst)
                    } else if r.terms.is_empty() {
                        l.scaled(r.konst)
                    } else {
                        Self::atom(e.clone())
                    }
                }
                _ => Self::atom(e.clone()),
            },
            _ => Self::atom(e.clone()),
        }
    }

    fn combine(mut self, other: &Self, sign: i64) -> Self {
        for (atom, coef) in &other.terms {
            let slot = self.terms.entry(atom.clone()).or_insert(0);
            *slot += coef * sign;
            if *slot == 0 {
                self.terms.remove(atom);
            }
        }
        self.konst += other.konst * sign;
        self
    }

    fn scaled(mut self, factor: i64) -> Self {
        if factor == 0 {
            return Self::konst(0);
        }
        for coef in self.terms.values_mut() {
            *coef *= factor;
        }
        self.konst *= factor;
        self
    }

    fn is_zero(&self) -> bool {
        self.terms.is_empty() && self.konst == 0
    }

    fn divisible_by(&self, c: i64) -> bool {
        c != 0
            && self.konst % c == 0
            && self.terms.values().all(|coef| coef % c == 0)
    }

    /// Rebuild a canonical expression: terms in atom order, constant last.
    fn rebuild(&self) -> PrimExpr {
        let mut acc: Option<PrimExpr> = None;
        for (atom, &coef) in &self.terms {
            if coef == 0 {
                continue;
            }
            acc = Some(match acc {
                None => term_expr(atom, coef),
                Some(cur) => {
                    if coef > 0 {
                        fold_add(cur, term_expr(atom, coef))
                    } else {
                        fold_sub(cur, term_expr(atom, -coef))
                    }
                }
            });
        }
        match acc {
            None => PrimExpr::Int(self.konst),
            Some(a) if self.konst == 0 => a,
            Some(a) if self.konst > 0 => fold_add(a, PrimExpr::Int(self.konst)),
            Some(a) => fold_sub(a, PrimExpr::Int(-self.konst)),
        }
    }
}

fn term_expr(atom: &PrimExpr, coef: i64) -> PrimExpr {
    if coef == 1 {
        atom.clone()
    } else {
        fold_mul(atom.clone(), PrimExpr::Int(coef))
    }
}

impl Analyzer {
    pub fn new() -> Self {
        Analyzer
    }

    /// Bottom-up canonicalization: constant folding, neutral elements,
    /// re-association of linear `+/-/*const` trees, and divisibility-aware
    /// floordiv/floormod reduction.
    pub fn simplify(&self, e: &PrimExpr) -> PrimExpr {
        match e {
            PrimExpr::Int(_) | PrimExpr::Bool(_) | PrimExpr::Var(_) => e.clone(),
            PrimExpr::Binary { op, lhs, rhs } => {
                let a = self.simplify(lhs);
                let b = self.simplify(rhs);
                if let Some(folded) = try_const_fold(*op, &a, &b) {
                    return folded;
                }
                match op {
                    BinOp::Add | BinOp::Sub | BinOp::Mul => {
                        LinForm::of(&binary(*op, a, b)).rebuild()
                    }
                    BinOp::FloorDiv => {
                        if b.is_one() {
                            return a;
                        }
                        if let Some(c) = b.as_int() {
                            let form = LinForm::of(&a);
                            if form.divisible_by(c) {
                                // (c*m) / c == m for any integer-valued m
                                let mut quotient = form;
                                for coef in quotient.terms.values_mut() {
                                    *coef /= c;
                                }
                                quotient.konst /= c;
                                return quotient.rebuild();
                            }
                        }
                        binary(BinOp::FloorDiv, a, b)
                    }
                    BinOp::FloorMod => {
                        if b.is_one() {
                            return PrimExpr::Int(0);
                        }
                        if let Some(c) = b.as_int() {
                            if c != 0 {
                                let form = LinForm::of(&a);
                                if form.terms.values().all(|coef| coef % c == 0) {
                                    // every term vanishes mod c
                                    return PrimExpr::Int(floormod_i64(form.konst, c));
                                }
                            }
                        }
                        binary(BinOp::FloorMod, a, b)
                    }
                    BinOp::Min | BinOp::Max => {
                        if a == b {
                            return a;
                        }
                        binary(*op, a, b)
                    }
                    BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq => {
                        let diff = LinForm::of(&a).combine(&LinForm::of(&b), -1);
                        if diff.terms.is_empty() {
                            let d = diff.konst;
                            return PrimExpr::Bool(match op {
                                BinOp::Lt => d < 0,
                                BinOp::Le => d <= 0,
                                BinOp::Gt => d > 0,
                                BinOp::Ge => d >= 0,
                                _ => d == 0,
                            });
                        }
                        binary(*op, a, b)
                    }
                    BinOp::And => {
                        if a == PrimExpr::Bool(false) || b == PrimExpr::Bool(false) {
                            return PrimExpr::Bool(false);
                        }
                        if a.is_true() {
                            return b;
                        }
                        if b.is_true() {
                            return a;
                        }
                        binary(BinOp::And, a, b)
                    }
                }
            }
        }
    }

    /// Is the boolean expression provably true under integer semantics?
    pub fn can_prove(&self, e: &PrimExpr) -> bool {
        self.simplify(e).is_true()
    }

    /// Are the two integer expressions provably equal?
    pub fn can_prove_equal(&self, a: &PrimExpr, b: &PrimExpr) -> bool {
        if a == b {
            return true;
        }
        self.simplify(&binary(BinOp::Sub, a.clone(), b.clone()))
            .is_zero()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{eq_of, floordiv, floormod, lt, var};

    #[test]
    fn linear_cancellation() {
        let ana = Analyzer::new();
        let i = var("i");
        let j = var("j");
        let a = i.clone() * 9 + j.clone() * 2;
        let b = j * 2 + i * 9;
        assert!(ana.can_prove_equal(&a, &b));
        assert!(ana.simplify(&(a.clone() - a)).is_zero());
    }

    #[test]
    fn floormod_divisible_terms_vanish() {
        let ana = Analyzer::new();
        let x = var("x");
        let e = floormod(x.clone() * 4 + 6, PrimExpr::Int(2));
        assert_eq!(ana.simplify(&e), PrimExpr::Int(0));
        let odd = floormod(x * 4 + 3, PrimExpr::Int(2));
        assert_eq!(ana.simplify(&odd), PrimExpr::Int(1));
    }

    #[test]
    fn floordiv_pulls_out_common_factor() {
        let ana = Analyzer::new();
        let x = var("x");
        let e = floordiv(x.clone() * 4, PrimExpr::Int(2));
        assert_eq!(ana.simplify(&e), x * 2);
    }

    #[test]
    fn comparisons_fold_on_constant_difference() {
        let ana = Analyzer::new();
        let x = var("x");
        assert!(ana.can_prove(&lt(x.clone(), x.clone() + 1)));
        assert!(!ana.can_prove(&lt(x.clone() + 1, x.clone())));
        assert!(ana.can_prove(&eq_of(
            floormod(x.clone() * 8, PrimExpr::Int(4)),
            PrimExpr::Int(0)
        )));
        // unknown stays unknown
        assert!(!ana.can_prove(&lt(x, PrimExpr::Int(4))));
    }

    #[test]
    fn no_fold_on_zero_divisor() {
        let ana = Analyzer::new();
        let e = floordiv(PrimExpr::Int(4), PrimExpr::Int(0));
        assert_eq!(ana.simplify(&e), e);
    }
}
