use crate::analyzer::Analyzer;
use crate::diag::{Diag, DiagKind, DiagSink};
use crate::expr::{
    binary, eq_of, floordiv, floormod, fold_add, fold_floordiv, fold_mul, fold_neg, fold_sub,
    max_of, min_of, try_const_fold, BinOp, PrimExpr, Range, VarId,
};
use crate::iter::def::{
    split_equal, CanonExpr, IterMark, IterSource, IterSplitExpr, IterSumExpr, SplitCollector,
    SumKey,
};
use crate::iter::predicate::{iter_range_sanity_check, match_bound_constraints};
use rustc_hash::FxHashMap;

/// A fused mark together with the offset its flattened form is shifted by.
#[derive(Debug, Clone)]
struct MarkAndOffset {
    mark: IterMark,
    offset: PrimExpr,
}

/// Rewrites host expressions into canonical iteration-map sums.
///
/// One rewriter serves one detector invocation; all session tables live here
/// and are dropped on return.
pub struct IterMapRewriter<'a> {
    analyzer: &'a Analyzer,
    diag: &'a mut DiagSink,
    /// Input variable -> its iteration-map binding.
    var_map: FxHashMap<VarId, CanonExpr>,
    /// Marks minted for each non-singleton input variable, in binding order.
    input_marks: Vec<IterMark>,
    /// Flattened form -> fused mark plus offset.
    sum_fuse_map: FxHashMap<SumKey, MarkAndOffset>,
    /// Structured form -> its flattened form.
    flattened_map: FxHashMap<SumKey, IterSumExpr>,
    /// Flattened forms that appeared inside bound predicates, in rewrite
    /// order (complexity-ascending).
    constrained_iters_flattened: Vec<IterSumExpr>,
}

impl<'a> IterMapRewriter<'a> {
    pub fn new(
        analyzer: &'a Analyzer,
        input_iters: &[(VarId, Range)],
        diag: &'a mut DiagSink,
    ) -> Self {
        let mut var_map = FxHashMap::default();
        let mut input_marks = Vec::new();
        for (var, rng) in input_iters {
            if rng.extent.is_one() {
                // singleton domain: the variable is the constant min
                var_map.insert(
                    var.clone(),
                    CanonExpr::Sum(IterSumExpr::constant(rng.min.clone())),
                );
            } else if rng.min.is_zero() {
                let mark = IterMark::new(
                    IterSource::Value(PrimExpr::Var(var.clone())),
                    rng.extent.clone(),
                );
                var_map.insert(var.clone(), CanonExpr::Split(IterSplitExpr::whole(mark.clone())));
                input_marks.push(mark);
            } else {
                // shift so the mark's domain starts at zero
                let shifted = PrimExpr::Var(var.clone()) - rng.min.clone();
                let mark = IterMark::new(IterSource::Value(shifted), rng.extent.clone());
                let sum = IterSumExpr::new(
                    vec![IterSplitExpr::whole(mark.clone())],
                    rng.min.clone(),
                );
                var_map.insert(var.clone(), CanonExpr::Sum(sum));
                input_marks.push(mark);
            }
        }
        Self {
            analyzer,
            diag,
            var_map,
            input_marks,
            sum_fuse_map: FxHashMap::default(),
            flattened_map: FxHashMap::default(),
            constrained_iters_flattened: Vec::new(),
        }
    }

    pub fn unresolved_count(&self) -> usize {
        self.diag.unresolved_count()
    }

    fn fail(&mut self, kind: DiagKind, msg: String) {
        self.diag.fail(Diag::new(kind, msg));
    }

    fn emit(&mut self, kind: DiagKind, msg: String) {
        self.diag.emit(Diag::new(kind, msg));
    }

    /// Canonicalize one index expression into a fused sum plus offset.
    pub fn rewrite(&mut self, expr: &PrimExpr) -> IterSumExpr {
        let sum = self.visit(expr).into_sum();
        self.normalize_to_iter_with_offset(sum)
    }

    /// Canonicalize a constraint expression and fold its predicate-induced
    /// bounds into the fused mark.
    pub fn rewrite_iter_constraint(
        &mut self,
        expr: &PrimExpr,
        lower: Option<PrimExpr>,
        upper: Option<PrimExpr>,
    ) -> IterSumExpr {
        let sum = self.visit(expr).into_sum();
        self.normalize_to_iter_on_bound(sum, lower, upper)
    }

    // ---- expression canonicalizer ------------------------------------

    fn visit(&mut self, expr: &PrimExpr) -> CanonExpr {
        match expr {
            PrimExpr::Var(name) => match self.var_map.get(name) {
                Some(bound) => bound.clone(),
                None => CanonExpr::Plain(expr.clone()),
            },
            PrimExpr::Binary { op, lhs, rhs } => match op {
                BinOp::Add => self.visit_add_sub(lhs, rhs, 1),
                BinOp::Sub => self.visit_add_sub(lhs, rhs, -1),
                BinOp::Mul => self.visit_mul(expr, lhs, rhs),
                BinOp::FloorDiv => self.visit_floordiv(expr, lhs, rhs),
                BinOp::FloorMod => self.visit_floormod(expr, lhs, rhs),
                _ => self.visit_fallback(expr, *op, lhs, rhs),
            },
            _ => CanonExpr::Plain(expr.clone()),
        }
    }

    /// Nodes outside the affine fragment: rebuild them, but an iteration-map
    /// value surfacing here has no affine reading and fails the rewrite.
    fn visit_fallback(
        &mut self,
        orig: &PrimExpr,
        op: BinOp,
        lhs: &PrimExpr,
        rhs: &PrimExpr,
    ) -> CanonExpr {
        let a = self.visit(lhs);
        let b = self.visit(rhs);
        if a.is_iter() || b.is_iter() {
            self.fail(
                DiagKind::NonAffine,
                format!("iterator appears under non-affine operator in {}", orig),
            );
            return CanonExpr::Plain(orig.clone());
        }
        let (CanonExpr::Plain(a), CanonExpr::Plain(b)) = (a, b) else {
            unreachable!()
        };
        CanonExpr::Plain(binary(op, a, b))
    }

    fn visit_add_sub(&mut self, lhs: &PrimExpr, rhs: &PrimExpr, sign: i64) -> CanonExpr {
        let op = if sign > 0 { BinOp::Add } else { BinOp::Sub };
        let a = self.visit(lhs);
        let b = self.visit(rhs);

        if let (CanonExpr::Plain(x), CanonExpr::Plain(y)) = (&a, &b) {
            if let Some(folded) = try_const_fold(op, x, y) {
                return CanonExpr::Plain(folded);
            }
            return CanonExpr::Plain(binary(op, x.clone(), y.clone()));
        }

        let mut ret = a.into_sum();
        match b {
            CanonExpr::Plain(e) => {
                ret.base = if sign > 0 {
                    fold_add(ret.base, e)
                } else {
                    fold_sub(ret.base, e)
                };
            }
            CanonExpr::Split(split) => Self::add_to_lhs(&mut ret, split, sign),
            CanonExpr::Sum(sum) => Self::add_sum_to_lhs(&mut ret, &sum, sign),
        }
        CanonExpr::Sum(ret)
    }

    fn visit_mul(&mut self, orig: &PrimExpr, lhs: &PrimExpr, rhs: &PrimExpr) -> CanonExpr {
        let a = self.visit(lhs);
        let b = self.visit(rhs);

        if let (CanonExpr::Plain(x), CanonExpr::Plain(y)) = (&a, &b) {
            if let Some(folded) = try_const_fold(BinOp::Mul, x, y) {
                return CanonExpr::Plain(folded);
            }
            return CanonExpr::Plain(binary(BinOp::Mul, x.clone(), y.clone()));
        }

        if a.is_iter() && b.is_iter() {
            self.fail(
                DiagKind::NonAffine,
                format!("cannot multiply two iterators in {}", orig),
            );
            return CanonExpr::Plain(orig.clone());
        }

        let (iter, plain) = if a.is_iter() { (a, b) } else { (b, a) };
        let CanonExpr::Plain(factor) = plain else {
            unreachable!()
        };
        match iter {
            CanonExpr::Sum(mut sum) => {
                Self::mul_to_lhs(&mut sum, &factor);
                CanonExpr::Sum(sum)
            }
            CanonExpr::Split(mut split) => {
                split.scale = fold_mul(split.scale, factor);
                CanonExpr::Split(split)
            }
            CanonExpr::Plain(_) => unreachable!(),
        }
    }

    fn visit_floordiv(&mut self, orig: &PrimExpr, lhs: &PrimExpr, rhs: &PrimExpr) -> CanonExpr {
        let a = self.visit(lhs);
        let b = self.visit(rhs);

        if let (CanonExpr::Plain(x), CanonExpr::Plain(y)) = (&a, &b) {
            if let Some(folded) = try_const_fold(BinOp::FloorDiv, x, y) {
                return CanonExpr::Plain(folded);
            }
            return CanonExpr::Plain(binary(BinOp::FloorDiv, x.clone(), y.clone()));
        }

        let CanonExpr::Plain(divisor) = b else {
            self.fail(
                DiagKind::CannotDivideByIterator,
                format!("cannot divide by an iterator in {}", orig),
            );
            return CanonExpr::Plain(orig.clone());
        };

        match a {
            CanonExpr::Sum(sum) => match self.try_fuse_iters(&sum) {
                Some(fused) => {
                    if !fused.base.is_zero() {
                        self.fail(
                            DiagKind::CannotDivSumWithBase,
                            format!("cannot floordiv a fused sum with nonzero base: {}", sum),
                        );
                        return CanonExpr::Plain(orig.clone());
                    }
                    let split = fused.args.into_iter().next().expect("fused sum has one arg");
                    self.split_floordiv_const(split, divisor, orig)
                }
                None => {
                    self.fail(DiagKind::FuseFailed, format!("cannot fuse {}", sum));
                    CanonExpr::Plain(orig.clone())
                }
            },
            CanonExpr::Split(split) => self.split_floordiv_const(split, divisor, orig),
            CanonExpr::Plain(_) => unreachable!(),
        }
    }

    fn split_floordiv_const(
        &mut self,
        mut lhs: IterSplitExpr,
        mut rhs: PrimExpr,
        orig: &PrimExpr,
    ) -> CanonExpr {
        // floordiv(x*scale, rhs)
        if rhs.is_one() {
            return CanonExpr::Split(lhs);
        }
        if !lhs.scale.is_one() {
            if self.can_prove_divisible(&lhs.scale, &rhs) {
                // floordiv(x*c1*c2, c2) = x*c1
                lhs.scale = fold_floordiv(lhs.scale, rhs);
                return CanonExpr::Split(lhs);
            }
            if self.can_prove_divisible(&rhs, &lhs.scale) {
                // floordiv(x*c1, c1*c2) = floordiv(x, c2)
                rhs = fold_floordiv(rhs, lhs.scale.clone());
                lhs.scale = PrimExpr::Int(1);
            } else {
                self.fail(
                    DiagKind::NotDivisible,
                    format!(
                        "cannot prove floordiv divisor {} compatible with scale {} in {}",
                        rhs, lhs.scale, orig
                    ),
                );
                return CanonExpr::Plain(orig.clone());
            }
        }

        // now scale == 1, x = floormod(floordiv(iter, lower_factor), extent)
        if self.can_prove_divisible(&lhs.extent, &rhs) {
            // carve off the lower rhs elements into the lower factor
            lhs.lower_factor = fold_mul(lhs.lower_factor, rhs.clone());
            lhs.extent = self.analyzer.simplify(&floordiv(lhs.extent, rhs));
            CanonExpr::Split(lhs)
        } else {
            self.fail(
                DiagKind::NotDivisible,
                format!(
                    "cannot prove extent {} divisible by floordiv divisor {} in {}",
                    lhs.extent, rhs, orig
                ),
            );
            CanonExpr::Plain(orig.clone())
        }
    }

    fn visit_floormod(&mut self, orig: &PrimExpr, lhs: &PrimExpr, rhs: &PrimExpr) -> CanonExpr {
        let a = self.visit(lhs);
        let b = self.visit(rhs);

        if let (CanonExpr::Plain(x), CanonExpr::Plain(y)) = (&a, &b) {
            if let Some(folded) = try_const_fold(BinOp::FloorMod, x, y) {
                return CanonExpr::Plain(folded);
            }
            return CanonExpr::Plain(binary(BinOp::FloorMod, x.clone(), y.clone()));
        }

        let CanonExpr::Plain(divisor) = b else {
            self.fail(
                DiagKind::CannotDivideByIterator,
                format!("cannot take modulo by an iterator in {}", orig),
            );
            return CanonExpr::Plain(orig.clone());
        };

        match a {
            CanonExpr::Sum(sum) => match self.try_fuse_iters(&sum) {
                Some(fused) => {
                    if !fused.base.is_zero() {
                        self.fail(
                            DiagKind::CannotDivSumWithBase,
                            format!("cannot floormod a fused sum with nonzero base: {}", sum),
                        );
                        return CanonExpr::Plain(orig.clone());
                    }
                    let split = fused.args.into_iter().next().expect("fused sum has one arg");
                    self.split_floormod_const(split, divisor, orig)
                }
                None => {
                    self.fail(DiagKind::FuseFailed, format!("cannot fuse {}", sum));
                    CanonExpr::Plain(orig.clone())
                }
            },
            CanonExpr::Split(split) => self.split_floormod_const(split, divisor, orig),
            CanonExpr::Plain(_) => unreachable!(),
        }
    }

    fn split_floormod_const(
        &mut self,
        mut lhs: IterSplitExpr,
        mut rhs: PrimExpr,
        orig: &PrimExpr,
    ) -> CanonExpr {
        // floormod(x*scale, rhs)
        if rhs.is_one() {
            return CanonExpr::Plain(PrimExpr::Int(0));
        }
        if !lhs.scale.is_one() {
            if self.can_prove_divisible(&lhs.scale, &rhs) {
                // floormod(x*c1*c2, c1) = 0
                return CanonExpr::Plain(PrimExpr::Int(0));
            }
            if self.can_prove_divisible(&rhs, &lhs.scale) {
                // floormod(x*c1, c1*c2) = floormod(x, c2)*c1
                rhs = fold_floordiv(rhs, lhs.scale.clone());
            } else {
                self.fail(
                    DiagKind::NotDivisible,
                    format!(
                        "cannot prove floormod divisor {} compatible with scale {} in {}",
                        rhs, lhs.scale, orig
                    ),
                );
                return CanonExpr::Plain(orig.clone());
            }
        }

        // floormod(x, rhs) where x = floormod(floordiv(iter, lower_factor), extent)
        if self.can_prove_divisible(&lhs.extent, &rhs) {
            // keep only the lower rhs elements
            lhs.extent = rhs;
            CanonExpr::Split(lhs)
        } else {
            self.fail(
                DiagKind::NotDivisible,
                format!(
                    "cannot prove extent {} divisible by floormod divisor {} in {}",
                    lhs.extent, rhs, orig
                ),
            );
            CanonExpr::Plain(orig.clone())
        }
    }

    /// Scales inside stored flattened/structured forms are kept relative to
    /// the base scale, so a fused mark's source ranges over `[0, extent)`.
    fn relative_scale(&self, scale: &PrimExpr, base_scale: i64) -> PrimExpr {
        self.analyzer
            .simplify(&fold_floordiv(scale.clone(), PrimExpr::Int(base_scale)))
    }

    fn can_prove_divisible(&self, lhs: &PrimExpr, rhs: &PrimExpr) -> bool {
        if let (Some(a), Some(b)) = (lhs.as_int(), rhs.as_int()) {
            return b != 0 && a % b == 0;
        }
        self.analyzer.can_prove_equal(lhs, rhs)
            || self
                .analyzer
                .can_prove(&eq_of(floormod(lhs.clone(), rhs.clone()), PrimExpr::Int(0)))
    }

    // ---- canonical sum arithmetic ------------------------------------

    /// Merge a split into a sum; like terms (same mark identity, lower
    /// factor and extent) combine by adding or subtracting scales.
    fn add_to_lhs(sum: &mut IterSumExpr, mut rhs: IterSplitExpr, sign: i64) {
        for arg in sum.args.iter_mut() {
            if arg.source.same_as(&rhs.source)
                && arg.lower_factor == rhs.lower_factor
                && arg.extent == rhs.extent
            {
                rhs.scale = if sign > 0 {
                    fold_add(arg.scale.clone(), rhs.scale)
                } else {
                    fold_sub(arg.scale.clone(), rhs.scale)
                };
                *arg = rhs;
                return;
            }
        }
        if sign < 0 {
            rhs.scale = fold_neg(rhs.scale);
        }
        sum.args.push(rhs);
    }

    fn add_sum_to_lhs(sum: &mut IterSumExpr, rhs: &IterSumExpr, sign: i64) {
        for arg in &rhs.args {
            Self::add_to_lhs(sum, arg.clone(), sign);
        }
        sum.base = if sign > 0 {
            fold_add(sum.base.clone(), rhs.base.clone())
        } else {
            fold_sub(sum.base.clone(), rhs.base.clone())
        };
    }

    fn mul_to_lhs(sum: &mut IterSumExpr, factor: &PrimExpr) {
        for arg in sum.args.iter_mut() {
            arg.scale = fold_mul(arg.scale.clone(), factor.clone());
        }
        sum.base = fold_mul(sum.base.clone(), factor.clone());
    }

    // ---- fuser --------------------------------------------------------

    /// Try to rewrite `x1*c1 + x2*c2 + ... + xn*cn + base` as a single split
    /// of a fused mark times the smallest constant scale.
    ///
    /// Emits context diagnostics on failure but leaves the unresolved count
    /// to the caller, which decides how the failure surfaces.
    fn try_fuse_iters(&mut self, expr: &IterSumExpr) -> Option<IterSumExpr> {
        let args = &expr.args;
        let mut visited = vec![false; args.len()];
        let mut flattened_iters: Vec<IterSplitExpr> = Vec::new();
        let mut grouped_iters: Vec<IterSplitExpr> = Vec::new();

        // step 0: the term with the smallest constant scale anchors the walk
        let mut base_scale: Option<i64> = None;
        let mut base_index = 0;
        for (i, arg) in args.iter().enumerate() {
            if let Some(c) = arg.scale.as_int() {
                if base_scale.map_or(true, |best| c < best) {
                    base_scale = Some(c);
                    base_index = i;
                }
            }
        }
        let Some(base_scale) = base_scale else {
            self.emit(
                DiagKind::FuseFailed,
                format!("no term with a constant scale in {}", expr),
            );
            return None;
        };

        let mut expected_extra_base = PrimExpr::Int(0);
        let mut expected_scale = PrimExpr::Int(base_scale);
        let mut i = 0;
        while i < args.len() {
            // find an unvisited term carrying the expected scale
            let start = if i == 0 { base_index } else { 0 };
            let mut j = start;
            while j < args.len() {
                if !visited[j] && self.analyzer.can_prove_equal(&args[j].scale, &expected_scale) {
                    break;
                }
                j += 1;
            }
            if j == args.len() {
                self.emit(
                    DiagKind::FuseFailed,
                    format!("no term with expected scale {} in {}", expected_scale, expr),
                );
                return None;
            }

            // the longest recorded constraint whose innermost term matches
            // args[j] takes the whole group at once
            let mut constraint_to_match: Option<IterSumExpr> = None;
            for cons in &self.constrained_iters_flattened {
                if let Some(last) = cons.args.last() {
                    if split_equal(&args[j], last, false)
                        && constraint_to_match
                            .as_ref()
                            .map_or(true, |m| m.args.len() < cons.args.len())
                    {
                        constraint_to_match = Some(cons.clone());
                    }
                }
            }

            if let Some(cons) = constraint_to_match {
                // consume the constraint's terms inner-to-outer, requiring the
                // scales to replay the constraint's internal structure at the
                // current expected scale
                for cons_arg in cons.args.iter().rev() {
                    let mut k = 0;
                    while k < args.len() {
                        if !visited[k]
                            && split_equal(&args[k], cons_arg, false)
                            && self.analyzer.can_prove_equal(
                                &fold_mul(cons_arg.scale.clone(), expected_scale.clone()),
                                &args[k].scale,
                            )
                        {
                            break;
                        }
                        k += 1;
                    }
                    if k == args.len() {
                        self.emit(
                            DiagKind::FuseFailed,
                            format!("no term of {} matches constraint {}", expr, cons),
                        );
                        return None;
                    }
                    visited[k] = true;
                    let mut flat = args[k].clone();
                    flat.scale = self.relative_scale(&flat.scale, base_scale);
                    flattened_iters.push(flat);
                }
                let rec = match self.sum_fuse_map.get(&SumKey::of(&cons)).cloned() {
                    Some(rec) => rec,
                    None => {
                        self.emit(
                            DiagKind::FuseFailed,
                            format!("constraint {} has no fusion record", cons),
                        );
                        return None;
                    }
                };
                let group_scale = self.relative_scale(&expected_scale, base_scale);
                grouped_iters.push(IterSplitExpr::with_scale(rec.mark.clone(), group_scale));
                expected_extra_base = fold_add(
                    expected_extra_base,
                    fold_mul(rec.offset.clone(), expected_scale.clone()),
                );
                expected_scale = fold_mul(expected_scale, rec.mark.extent());
                i += cons.args.len();
            } else {
                visited[j] = true;
                let mut arg = args[j].clone();
                arg.scale = self.relative_scale(&arg.scale, base_scale);
                flattened_iters.push(arg.clone());
                grouped_iters.push(arg);
                expected_scale = fold_mul(expected_scale, args[j].extent.clone());
                i += 1;
            }
        }

        // both forms keep splits from outermost to innermost
        let flattened_form = IterSumExpr::new(
            flattened_iters.iter().rev().cloned().collect(),
            PrimExpr::Int(0),
        );
        let structured_form = IterSumExpr::new(
            grouped_iters.iter().rev().cloned().collect(),
            PrimExpr::Int(0),
        );

        if let Some(rec) = self.sum_fuse_map.get(&SumKey::of(&flattened_form)).cloned() {
            // reuse of an existing fusion must agree on the offset
            if !self.analyzer.can_prove_equal(
                &expected_extra_base,
                &fold_mul(rec.offset.clone(), PrimExpr::Int(base_scale)),
            ) {
                self.emit(
                    DiagKind::InconsistentOffset,
                    format!(
                        "offset {} conflicts with recorded fusion of {}",
                        expected_extra_base, flattened_form
                    ),
                );
                return None;
            }
            Some(IterSumExpr::new(
                vec![IterSplitExpr::with_scale(rec.mark, PrimExpr::Int(base_scale))],
                fold_add(expr.base.clone(), expected_extra_base),
            ))
        } else {
            let extent = self
                .analyzer
                .simplify(&floordiv(expected_scale, PrimExpr::Int(base_scale)));
            let mark = IterMark::new(IterSource::Sum(structured_form.clone()), extent);
            self.sum_fuse_map.insert(
                SumKey::of(&flattened_form),
                MarkAndOffset {
                    mark: mark.clone(),
                    offset: PrimExpr::Int(0),
                },
            );
            self.flattened_map
                .insert(SumKey::of(&structured_form), flattened_form);
            Some(IterSumExpr::new(
                vec![IterSplitExpr::with_scale(mark, PrimExpr::Int(base_scale))],
                fold_add(expr.base.clone(), expected_extra_base),
            ))
        }
    }

    fn normalize_to_iter_with_offset(&mut self, expr: IterSumExpr) -> IterSumExpr {
        if expr.args.is_empty() {
            return expr;
        }
        match self.try_fuse_iters(&expr) {
            Some(fused) => fused,
            None => {
                self.fail(
                    DiagKind::FuseFailed,
                    format!("cannot normalize {} to a fused iterator", expr),
                );
                expr
            }
        }
    }

    // ---- constraint normalizer ---------------------------------------

    /// Normalize a constraint sum to a single fused split and tighten the
    /// fused mark to the predicate-induced `[min, max)` window.
    fn normalize_to_iter_on_bound(
        &mut self,
        mut expr: IterSumExpr,
        lower: Option<PrimExpr>,
        upper: Option<PrimExpr>,
    ) -> IterSumExpr {
        let base = expr.base.clone();
        let mut lower = lower;
        let mut upper = upper;
        if !base.is_zero() {
            expr.base = PrimExpr::Int(0);
            lower = lower.map(|l| fold_sub(l, base.clone()));
            upper = upper.map(|u| fold_sub(u, base.clone()));
        }
        if expr.args.is_empty() {
            return expr;
        }

        let fused = match self.try_fuse_iters(&expr) {
            Some(f) => f,
            None => {
                self.fail(
                    DiagKind::UnnormalizablePredicate,
                    format!("constraint {} does not fuse to a single iterator", expr),
                );
                return expr;
            }
        };
        let split = fused.args[0].clone();
        if !split.scale.is_one() {
            self.fail(
                DiagKind::UnnormalizablePredicate,
                format!("constraint {} does not fuse at scale 1", expr),
            );
            return expr;
        }

        let IterSource::Sum(mut structured_form) = split.source.source() else {
            self.fail(
                DiagKind::UnnormalizablePredicate,
                format!("fused constraint {} has no structured form", expr),
            );
            return expr;
        };
        let Some(flattened_form) = self
            .flattened_map
            .get(&SumKey::of(&structured_form))
            .cloned()
        else {
            self.fail(
                DiagKind::UnnormalizablePredicate,
                format!("no flattened record for constraint {}", expr),
            );
            return expr;
        };
        let Some(rec) = self.sum_fuse_map.get(&SumKey::of(&flattened_form)).cloned() else {
            self.fail(
                DiagKind::UnnormalizablePredicate,
                format!("no fusion record for constraint {}", expr),
            );
            return expr;
        };
        let mark = rec.mark;

        let mut iter_min = rec.offset;
        let mut iter_max = fold_add(iter_min.clone(), mark.extent());
        if let Some(l) = lower {
            iter_min = self.analyzer.simplify(&max_of(l, iter_min));
        }
        if let Some(u) = upper {
            iter_max = self.analyzer.simplify(&min_of(u, iter_max));
        }
        if !iter_min.is_zero() {
            // the structured form is re-based so the mark's domain starts at
            // zero again; its table entry moves with it
            self.flattened_map.remove(&SumKey::of(&structured_form));
            structured_form.base = fold_neg(iter_min.clone());
            mark.set_source(IterSource::Sum(structured_form.clone()));
            self.flattened_map
                .insert(SumKey::of(&structured_form), flattened_form.clone());
        }
        mark.set_extent(
            self.analyzer
                .simplify(&fold_sub(iter_max, iter_min.clone())),
        );
        self.sum_fuse_map.insert(
            SumKey::of(&flattened_form),
            MarkAndOffset {
                mark,
                offset: iter_min.clone(),
            },
        );
        self.constrained_iters_flattened.push(flattened_form);

        expr.args = vec![split];
        expr.base = fold_add(base, iter_min);
        expr
    }

    /// Flattened forms of two recorded constraints must be related by
    /// inclusion or be disjoint; sharing only part of their terms is
    /// unsupported.
    pub fn check_constraints(&self) -> bool {
        for i in 0..self.constrained_iters_flattened.len() {
            for j in (i + 1)..self.constrained_iters_flattened.len() {
                // state: 0 = start, -1 = disjoint so far, 1 = inclusion so far
                let mut state = 0;
                for arg1 in &self.constrained_iters_flattened[i].args {
                    let found = self.constrained_iters_flattened[j]
                        .args
                        .iter()
                        .any(|arg2| split_equal(arg1, arg2, true));
                    if state == 0 {
                        state = if found { 1 } else { -1 };
                    } else if (state == -1 && found) || (state == 1 && !found) {
                        return false;
                    }
                }
            }
        }
        true
    }

    // ---- coverage checker --------------------------------------------

    /// Check that every mark reachable from the final sums is tiled by its
    /// split references; in bijective mode additionally require every input
    /// mark to be used.
    pub fn check_mapping(&mut self, bindings: &[IterSumExpr], require_bijective: bool) -> bool {
        let mut collector = SplitCollector::default();
        collector.collect(bindings);
        for mark in collector.visited.clone() {
            let splits = collector.splits_of(&mark).to_vec();
            if self
                .try_normalize_splits(&mark, &splits, require_bijective)
                .is_empty()
            {
                self.emit(
                    DiagKind::UncoveredMark,
                    format!("cannot normalize the splits of {}", mark),
                );
                return false;
            }
        }
        if require_bijective {
            for mark in self.input_marks.clone() {
                if !collector.was_visited(&mark) {
                    self.emit(
                        DiagKind::UncoveredMark,
                        format!("input iterator {} is not covered by the mapping", mark),
                    );
                    return false;
                }
            }
        }
        true
    }

    /// Walk the splits of `mark` from the innermost slice outward, adopting
    /// one split per round. Returns the adopted splits outermost-first, or
    /// empty when the mark cannot be tiled.
    fn try_normalize_splits(
        &mut self,
        mark: &IterMark,
        splits: &[IterSplitExpr],
        require_bijective: bool,
    ) -> Vec<IterSplitExpr> {
        let mut used = vec![false; splits.len()];
        let mut iters: Vec<IterSplitExpr> = Vec::new();
        let mut expected_lower_factor = PrimExpr::Int(1);

        for _ in 0..splits.len() {
            let mut j = 0;
            while j < splits.len() {
                if !used[j]
                    && self
                        .analyzer
                        .can_prove_equal(&splits[j].lower_factor, &expected_lower_factor)
                {
                    break;
                }
                j += 1;
            }
            if j == splits.len() {
                if require_bijective {
                    self.emit(
                        DiagKind::IncompleteSplit,
                        format!(
                            "no split of {} with lower factor {} in bijective checking",
                            mark, expected_lower_factor
                        ),
                    );
                    return Vec::new();
                }
                // a slice may be skipped when bijectivity is not required,
                // provided every remaining split sits above the gap
                match self.search_skip_lower_factor(splits, &used, &expected_lower_factor) {
                    Some(idx) => j = idx,
                    None => {
                        self.emit(
                            DiagKind::IncompleteSplit,
                            format!(
                                "no split of {} skipping lower factor {}",
                                mark, expected_lower_factor
                            ),
                        );
                        return Vec::new();
                    }
                }
            }
            used[j] = true;
            iters.push(splits[j].clone());
            expected_lower_factor = fold_mul(
                splits[j].lower_factor.clone(),
                splits[j].extent.clone(),
            );
        }

        // bijective: the walked product must equal the mark extent exactly;
        // otherwise it must divide it
        let extent = mark.extent();
        let covered = if require_bijective {
            self.analyzer
                .can_prove_equal(&expected_lower_factor, &extent)
        } else {
            self.can_prove_divisible(&extent, &expected_lower_factor)
        };
        if !covered {
            self.emit(
                DiagKind::UncoveredMark,
                format!(
                    "extent of {} is not compatible with covered product {}",
                    mark, expected_lower_factor
                ),
            );
            return Vec::new();
        }
        iters.reverse();
        iters
    }

    /// Among the unused splits, pick the one with the smallest lower factor
    /// divisible by `expected`; every other unused split must be divisible
    /// too. Equal lower factors resolve to the later position.
    fn search_skip_lower_factor(
        &self,
        splits: &[IterSplitExpr],
        used: &[bool],
        expected: &PrimExpr,
    ) -> Option<usize> {
        let mut res: Option<usize> = None;
        for i in 0..splits.len() {
            if used[i] {
                continue;
            }
            if !self.can_prove_divisible(&splits[i].lower_factor, expected) {
                return None;
            }
            res = match res {
                None => Some(i),
                Some(r) => {
                    if self.can_prove_divisible(&splits[r].lower_factor, &splits[i].lower_factor) {
                        Some(i)
                    } else {
                        Some(r)
                    }
                }
            };
        }
        res
    }
}

/// Detect whether `indices` form an affine iteration map over `input_iters`
/// under `predicate`, and return one canonical sum per index.
///
/// On any failure the result is empty and the sink carries at least one
/// diagnostic; partial successes are never surfaced.
pub fn detect_iter_map(
    indices: &[PrimExpr],
    input_iters: &[(VarId, Range)],
    predicate: &PrimExpr,
    require_bijective: bool,
    analyzer: &Analyzer,
    diag: &mut DiagSink,
) -> Vec<IterSumExpr> {
    if !iter_range_sanity_check(input_iters) {
        diag.fail(Diag::new(
            DiagKind::SanityFailed,
            "input iterator ranges reference their own keys",
        ));
        return Vec::new();
    }

    let mut constraints = match_bound_constraints(predicate, input_iters, analyzer);
    if !predicate.is_true() && constraints.is_empty() {
        diag.fail(Diag::new(
            DiagKind::BadPredicate,
            format!("cannot collect constraints from predicate {}", predicate),
        ));
        return Vec::new();
    }

    // rewrite small constraints first so nested groups exist before the
    // expressions that contain them
    for c in constraints.iter_mut() {
        c.size = c.iter.complexity();
    }
    constraints.sort_by_key(|c| c.size);

    let mut rewriter = IterMapRewriter::new(analyzer, input_iters, diag);
    for c in &constraints {
        rewriter.rewrite_iter_constraint(&c.iter, c.lower_bound.clone(), c.upper_bound.clone());
        if rewriter.unresolved_count() != 0 {
            return Vec::new();
        }
    }
    if !rewriter.check_constraints() {
        rewriter.fail(
            DiagKind::OverlappingConstraints,
            format!("illegal iteration constraints in {}", predicate),
        );
        return Vec::new();
    }

    let mut results = Vec::with_capacity(indices.len());
    for index in indices {
        results.push(rewriter.rewrite(index));
        if rewriter.unresolved_count() != 0 {
            return Vec::new();
        }
    }

    if !rewriter.check_mapping(&results, require_bijective) {
        rewriter.fail(
            DiagKind::NotIndependent,
            "iterators are not independent".to_string(),
        );
        return Vec::new();
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::var;

    fn simple_iters() -> Vec<(VarId, Range)> {
        vec![("x".to_string(), Range::from_extent(8))]
    }

    #[test]
    fn like_terms_merge_in_sums() {
        let ana = Analyzer::new();
        let mut sink = DiagSink::new();
        let iters = simple_iters();
        let mut rw = IterMapRewriter::new(&ana, &iters, &mut sink);
        // x*3 + x => single split with scale 4
        let canon = rw.visit(&(var("x") * 3 + var("x")));
        let CanonExpr::Sum(sum) = canon else {
            panic!("expected a sum");
        };
        assert_eq!(sum.args.len(), 1);
        assert_eq!(sum.args[0].scale, PrimExpr::Int(4));
    }

    #[test]
    fn scaled_split_divides_exactly() {
        let ana = Analyzer::new();
        let mut sink = DiagSink::new();
        let iters = simple_iters();
        let mut rw = IterMapRewriter::new(&ana, &iters, &mut sink);
        // (x*6) / 3 => x*2
        let canon = rw.visit(&floordiv(var("x") * 6, PrimExpr::Int(3)));
        let CanonExpr::Split(split) = canon else {
            panic!("expected a split");
        };
        assert_eq!(split.scale, PrimExpr::Int(2));
        assert_eq!(sink.unresolved_count(), 0);
    }

    #[test]
    fn scaled_floormod_vanishes() {
        let ana = Analyzer::new();
        let mut sink = DiagSink::new();
        let iters = simple_iters();
        let mut rw = IterMapRewriter::new(&ana, &iters, &mut sink);
        // (x*6) % 3 => 0
        let canon = rw.visit(&floormod(var("x") * 6, PrimExpr::Int(3)));
        let CanonExpr::Plain(e) = canon else {
            panic!("expected a plain expression");
        };
        assert!(e.is_zero());
    }

    #[test]
    fn indivisible_extent_is_reported() {
        let ana = Analyzer::new();
        let mut sink = DiagSink::new();
        let iters = simple_iters();
        let mut rw = IterMapRewriter::new(&ana, &iters, &mut sink);
        let canon = rw.visit(&floordiv(var("x"), PrimExpr::Int(3)));
        assert!(matches!(canon, CanonExpr::Plain(_)));
        assert!(sink.has_kind(DiagKind::NotDivisible));
        assert_eq!(sink.unresolved_count(), 1);
    }

    #[test]
    fn multiplying_iterators_is_non_affine() {
        let ana = Analyzer::new();
        let mut sink = DiagSink::new();
        let iters = vec![
            ("x".to_string(), Range::from_extent(8)),
            ("y".to_string(), Range::from_extent(6)),
        ];
        let mut rw = IterMapRewriter::new(&ana, &iters, &mut sink);
        rw.visit(&(var("x") * var("y")));
        assert!(sink.has_kind(DiagKind::NonAffine));
    }

    #[test]
    fn unbound_variables_pass_through() {
        let ana = Analyzer::new();
        let mut sink = DiagSink::new();
        let iters = simple_iters();
        let mut rw = IterMapRewriter::new(&ana, &iters, &mut sink);
        let canon = rw.visit(&(var("x") * var("n")));
        // n is not an input iterator, so it scales the split
        let CanonExpr::Split(split) = canon else {
            panic!("expected a split");
        };
        assert_eq!(split.scale, var("n"));
    }
}
