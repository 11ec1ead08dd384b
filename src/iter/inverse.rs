use crate::analyzer::Analyzer;
use crate::expr::{floormod, fold_add, fold_floordiv, fold_mul, fold_sub, BinOp, PrimExpr, VarId};
use crate::iter::def::{IterMark, IterSource, IterSplitExpr, IterSumExpr};
use rustc_hash::{FxHashMap, FxHashSet};

/// Back-propagates output values through a detected iteration map to recover
/// each input variable.
struct InverseIterMapBuilder<'a> {
    analyzer: &'a Analyzer,
    /// Accumulated back-propagated value per mark identity.
    backprop: FxHashMap<IterMark, PrimExpr>,
    inverse: FxHashMap<VarId, PrimExpr>,
}

impl<'a> InverseIterMapBuilder<'a> {
    fn new(analyzer: &'a Analyzer) -> Self {
        Self {
            analyzer,
            backprop: FxHashMap::default(),
            inverse: FxHashMap::default(),
        }
    }

    fn run(mut self, iter_map: &[IterSumExpr], outputs: &[PrimExpr]) -> FxHashMap<VarId, PrimExpr> {
        debug_assert_eq!(iter_map.len(), outputs.len());

        // marks in reverse post-order: every split referencing a mark is
        // handled before the mark's own source is descended into
        let order = Self::mark_topo_order(iter_map);

        for (sum, output) in iter_map.iter().zip(outputs.iter()) {
            self.propagate_sum(sum, output.clone());
        }
        for mark in &order {
            let Some(value) = self.backprop.get(mark).cloned() else {
                continue;
            };
            match mark.source() {
                IterSource::Sum(sum) => self.propagate_sum(&sum, value),
                IterSource::Value(e) => self.record_var(&e, value),
            }
        }
        self.inverse
    }

    fn mark_topo_order(iter_map: &[IterSumExpr]) -> Vec<IterMark> {
        let mut visited: FxHashSet<IterMark> = FxHashSet::default();
        let mut post: Vec<IterMark> = Vec::new();
        fn dfs(mark: &IterMark, visited: &mut FxHashSet<IterMark>, post: &mut Vec<IterMark>) {
            if !visited.insert(mark.clone()) {
                return;
            }
            if let IterSource::Sum(sum) = mark.source() {
                for arg in &sum.args {
                    dfs(&arg.source, visited, post);
                }
            }
            post.push(mark.clone());
        }
        for sum in iter_map {
            for arg in &sum.args {
                dfs(&arg.source, &mut visited, &mut post);
            }
        }
        post.reverse();
        post
    }

    fn propagate_sum(&mut self, sum: &IterSumExpr, value: PrimExpr) {
        if sum.args.is_empty() {
            return;
        }
        let input = fold_sub(value, sum.base.clone());

        // a single component receives the whole value
        if sum.args.len() == 1 {
            self.propagate_split(&sum.args[0], input);
            return;
        }

        // multiple components: the stored sum must hold the fuse pattern
        // (descending lower-factor products, scale = product of inner
        // extents), then each component recovers its own digit
        self.check_fuse_pattern(sum);
        for split in &sum.args {
            let digit = floormod(
                fold_floordiv(input.clone(), split.scale.clone()),
                split.extent.clone(),
            );
            self.propagate_split(split, digit);
        }
    }

    fn propagate_split(&mut self, split: &IterSplitExpr, value: PrimExpr) {
        let input = fold_mul(value, split.lower_factor.clone());
        let slot = self
            .backprop
            .entry(split.source.clone())
            .or_insert(PrimExpr::Int(0));
        *slot = fold_add(slot.clone(), input);
    }

    fn record_var(&mut self, source: &PrimExpr, value: PrimExpr) {
        // a shifted source `v - min` recovers `v = value + min`
        let (name, offset) = match source {
            PrimExpr::Var(name) => (name.clone(), None),
            PrimExpr::Binary {
                op: BinOp::Sub,
                lhs,
                rhs,
            } => match (lhs.as_ref(), rhs.as_ref()) {
                (PrimExpr::Var(name), min) => (name.clone(), Some(min.clone())),
                _ => return,
            },
            _ => return,
        };
        match self.inverse.get(&name).cloned() {
            Some(existing) => {
                self.inverse.insert(name, fold_add(existing, value));
            }
            None => {
                let value = match offset {
                    Some(min) => fold_add(value, min),
                    None => value,
                };
                self.inverse.insert(name, value);
            }
        }
    }

    /// Detection emits fused sums outermost-first with positional scales;
    /// the inverse relies on that shape.
    fn check_fuse_pattern(&self, sum: &IterSumExpr) {
        debug_assert!(!sum.args.is_empty());
        let mut expected_scale = sum.args[sum.args.len() - 1].scale.clone();
        for split in sum.args.iter().rev() {
            debug_assert!(
                self.analyzer.can_prove_equal(&split.scale, &expected_scale),
                "stored sum violates the fuse pattern"
            );
            expected_scale = fold_mul(expected_scale, split.extent.clone());
        }
    }
}

/// Compute, for each input variable of a (bijective) iteration map, the
/// expression recovering its value from the outputs.
pub fn inverse_affine_iter_map(
    iter_map: &[IterSumExpr],
    outputs: &[PrimExpr],
    analyzer: &Analyzer,
) -> FxHashMap<VarId, PrimExpr> {
    InverseIterMapBuilder::new(analyzer).run(iter_map, outputs)
}
