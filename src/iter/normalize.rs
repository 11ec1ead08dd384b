use crate::analyzer::Analyzer;
use crate::diag::DiagSink;
use crate::expr::{eq_of, floormod, fold_add, fold_floordiv, fold_mul, PrimExpr, Range, VarId};
use crate::iter::def::{IterSource, IterSplitExpr, IterSumExpr};
use crate::iter::rewrite::detect_iter_map;

/// Converts iteration-map expressions back to ordinary integer expressions.
pub struct IterMapNormalizer<'a> {
    analyzer: &'a Analyzer,
}

impl<'a> IterMapNormalizer<'a> {
    pub fn new(analyzer: &'a Analyzer) -> Self {
        Self { analyzer }
    }

    pub fn convert_sum(&self, sum: &IterSumExpr) -> PrimExpr {
        let mut res = PrimExpr::Int(0);
        for arg in &sum.args {
            res = fold_add(res, self.convert_split(arg));
        }
        fold_add(res, sum.base.clone())
    }

    pub fn convert_split(&self, split: &IterSplitExpr) -> PrimExpr {
        let source = match split.source.source() {
            IterSource::Value(e) => e,
            IterSource::Sum(sum) => self.convert_sum(&sum),
        };
        let mark_extent = split.source.extent();
        if split.lower_factor.is_one()
            && self
                .analyzer
                .can_prove(&eq_of(split.extent.clone(), mark_extent.clone()))
        {
            // the split covers the whole mark
            fold_mul(source, split.scale.clone())
        } else if self.analyzer.can_prove(&eq_of(
            mark_extent,
            fold_mul(split.lower_factor.clone(), split.extent.clone()),
        )) {
            // outermost slice: the modulo is redundant
            fold_mul(
                fold_floordiv(source, split.lower_factor.clone()),
                split.scale.clone(),
            )
        } else {
            fold_mul(
                floormod(
                    fold_floordiv(source, split.lower_factor.clone()),
                    split.extent.clone(),
                ),
                split.scale.clone(),
            )
        }
    }
}

/// Convert one iteration-map sum into an equivalent ordinary expression.
pub fn normalize_iter_map_to_expr(expr: &IterSumExpr, analyzer: &Analyzer) -> PrimExpr {
    IterMapNormalizer::new(analyzer).convert_sum(expr)
}

/// Simplify index expressions through iteration-map detection.
///
/// Returns the inputs unchanged when detection fails.
pub fn iter_map_simplify(
    indices: &[PrimExpr],
    input_iters: &[(VarId, Range)],
    predicate: &PrimExpr,
    require_bijective: bool,
) -> Vec<PrimExpr> {
    let analyzer = Analyzer::new();
    let mut diag = DiagSink::new();
    let rewritten = detect_iter_map(
        indices,
        input_iters,
        predicate,
        require_bijective,
        &analyzer,
        &mut diag,
    );
    if rewritten.is_empty() {
        return indices.to_vec();
    }
    let converter = IterMapNormalizer::new(&analyzer);
    rewritten.iter().map(|e| converter.convert_sum(e)).collect()
}
