use crate::analyzer::Analyzer;
use crate::diag::{Diag, DiagKind, DiagSink};
use crate::expr::{fold_add, fold_and, fold_floordiv, fold_mul, lt, PrimExpr, Range, VarId};
use crate::iter::def::{IterMark, IterSource, IterSplitExpr, IterSumExpr, SplitCollector};
use crate::iter::normalize::IterMapNormalizer;
use crate::iter::rewrite::detect_iter_map;
use rustc_hash::{FxHashMap, FxHashSet};

/// Result of dividing the input iterators of an iteration map into an outer
/// and an inner subspace: one `(outer_mark, inner_mark)` pair per index, and
/// the predicates each subspace must respect when a mark is only partially
/// consumed.
#[derive(Debug)]
pub struct SubspaceDivision {
    pub pairs: Vec<(IterMark, IterMark)>,
    pub outer_pred: PrimExpr,
    pub inner_pred: PrimExpr,
}

/// Either of the two iteration-map node kinds, as carried through division.
#[derive(Debug, Clone)]
enum IterPart {
    Split(IterSplitExpr),
    Sum(IterSumExpr),
}

impl IterPart {
    fn empty_sum() -> Self {
        Self::Sum(IterSumExpr::constant(PrimExpr::Int(0)))
    }

    fn into_sum(self) -> IterSumExpr {
        match self {
            Self::Sum(s) => s,
            Self::Split(sp) => IterSumExpr::new(vec![sp], PrimExpr::Int(0)),
        }
    }
}

/// Message-passing carrier: denotes `outer * inner_extent + inner`.
#[derive(Debug, Clone)]
struct DivisionResult {
    outer: IterPart,
    outer_extent: PrimExpr,
    inner: IterPart,
    inner_extent: PrimExpr,
}

impl DivisionResult {
    fn new(outer: IterPart, outer_extent: PrimExpr, inner: IterPart, inner_extent: PrimExpr) -> Self {
        Self {
            outer,
            outer_extent,
            inner,
            inner_extent,
        }
    }

    fn whole_inner(iter: IterPart, extent: PrimExpr) -> Self {
        Self::new(IterPart::empty_sum(), PrimExpr::Int(1), iter, extent)
    }

    fn whole_outer(iter: IterPart, extent: PrimExpr) -> Self {
        Self::new(iter, extent, IterPart::empty_sum(), PrimExpr::Int(1))
    }

    /// Everything lives in the outer subspace.
    fn is_outer(&self) -> bool {
        self.inner_extent.is_one()
    }

    /// Everything lives in the inner subspace.
    fn is_inner(&self) -> bool {
        self.outer_extent.is_one()
    }

    fn outer_as_split(&self) -> IterSplitExpr {
        Self::as_split(&self.outer, &self.outer_extent)
    }

    fn inner_as_split(&self) -> IterSplitExpr {
        Self::as_split(&self.inner, &self.inner_extent)
    }

    fn as_split(part: &IterPart, extent: &PrimExpr) -> IterSplitExpr {
        match part {
            IterPart::Split(sp) => sp.clone(),
            IterPart::Sum(sum) => IterSplitExpr::whole(IterMark::new(
                IterSource::Sum(sum.clone()),
                extent.clone(),
            )),
        }
    }
}

/// Split lookup key: mark identity plus the split's shape.
#[derive(Clone, PartialEq, Eq, Hash)]
struct SplitKey {
    mark: IterMark,
    lower_factor: PrimExpr,
    extent: PrimExpr,
    scale: PrimExpr,
}

impl SplitKey {
    fn of(split: &IterSplitExpr) -> Self {
        Self {
            mark: split.source.clone(),
            lower_factor: split.lower_factor.clone(),
            extent: split.extent.clone(),
            scale: split.scale.clone(),
        }
    }
}

struct SubspaceDivider<'a> {
    analyzer: &'a Analyzer,
    diag: &'a mut DiagSink,
    collector: SplitCollector,
    sub_iters: FxHashSet<VarId>,
    /// Division result per split; all splits of a mark are computed when the
    /// first of them is encountered.
    split_map: FxHashMap<SplitKey, DivisionResult>,
    outer_preds: PrimExpr,
    inner_preds: PrimExpr,
}

impl<'a> SubspaceDivider<'a> {
    fn new(
        analyzer: &'a Analyzer,
        collector: SplitCollector,
        sub_iters: FxHashSet<VarId>,
        diag: &'a mut DiagSink,
    ) -> Self {
        Self {
            analyzer,
            diag,
            collector,
            sub_iters,
            split_map: FxHashMap::default(),
            outer_preds: PrimExpr::Bool(true),
            inner_preds: PrimExpr::Bool(true),
        }
    }

    fn fail(&mut self, kind: DiagKind, msg: String) -> DivisionResult {
        self.diag.fail(Diag::new(kind, msg));
        DivisionResult::new(
            IterPart::empty_sum(),
            PrimExpr::Int(0),
            IterPart::empty_sum(),
            PrimExpr::Int(0),
        )
    }

    fn divide_sum(&mut self, expr: &IterSumExpr, mark_extent: &PrimExpr) -> DivisionResult {
        if expr.args.is_empty() {
            // a bare offset belongs to the inner space
            return DivisionResult::new(
                IterPart::empty_sum(),
                PrimExpr::Int(1),
                IterPart::Sum(IterSumExpr::constant(expr.base.clone())),
                PrimExpr::Int(1),
            );
        }
        if expr.args.len() == 1 {
            // arg + base: if arg = Y*E(X)+X then arg + base = Y*E(X) + (X + base)
            if !expr.args[0].scale.is_one() {
                return self.fail(
                    DiagKind::FuseFailed,
                    format!("expected split scale 1, got {}", expr.args[0].scale),
                );
            }
            let mut res = self.divide_split(&expr.args[0]);
            if !expr.base.is_zero() {
                res = Self::add_base(res, expr.base.clone());
            }
            return res;
        }

        // arg1 + ... + argn + base divides only if contiguous outer splits
        // are followed by contiguous inner splits (checked inner to outer)
        let mut extent = PrimExpr::Int(1);
        let mut outer_args: Vec<IterSplitExpr> = Vec::new();
        let mut inner_args: Vec<IterSplitExpr> = Vec::new();
        let mut inner = true;
        let mut scale_is_one = false;
        for arg in expr.args.iter().rev() {
            if arg.scale.is_one() {
                scale_is_one = true;
            }
            let arg_division = self.divide_split(arg);
            let new_arg;
            if arg_division.is_inner() {
                if !inner {
                    return self.fail(
                        DiagKind::FuseFailed,
                        format!("inner iterator above an outer one in {}", expr),
                    );
                }
                new_arg = arg_division.inner_as_split();
                inner_args.push(new_arg.clone());
            } else if arg_division.is_outer() {
                new_arg = arg_division.outer_as_split();
                outer_args.push(new_arg.clone());
                inner = false;
            } else {
                return self.fail(
                    DiagKind::FuseFailed,
                    format!("division of {} is neither inner nor outer", arg),
                );
            }
            extent = fold_mul(extent, new_arg.extent.clone());
        }
        if !scale_is_one {
            return self.fail(
                DiagKind::FuseFailed,
                format!("no unit-scale component in {}", expr),
            );
        }

        let need_predicate = !self.analyzer.can_prove_equal(&extent, mark_extent);
        let outer_mark = Self::mark_from_args_and_base(&outer_args, PrimExpr::Int(0));
        let inner_mark = Self::mark_from_args_and_base(&inner_args, expr.base.clone());
        let IterSource::Sum(outer_source) = outer_mark.source() else {
            unreachable!()
        };
        let IterSource::Sum(inner_source) = inner_mark.source() else {
            unreachable!()
        };
        if need_predicate {
            // a partially consumed mark cannot straddle the subspaces; the
            // surviving side gets the residual bound as a predicate
            let converter = IterMapNormalizer::new(self.analyzer);
            if inner_args.is_empty() {
                let bound = lt(converter.convert_sum(&outer_source), mark_extent.clone());
                self.outer_preds = fold_and(self.outer_preds.clone(), bound);
                return DivisionResult::whole_outer(IterPart::Sum(outer_source), mark_extent.clone());
            } else if outer_args.is_empty() {
                let bound = lt(converter.convert_sum(&inner_source), mark_extent.clone());
                self.inner_preds = fold_and(self.inner_preds.clone(), bound);
                return DivisionResult::whole_inner(IterPart::Sum(inner_source), mark_extent.clone());
            }
            return self.fail(
                DiagKind::FuseFailed,
                format!("mixed division of {} needs a predicate", expr),
            );
        }
        DivisionResult::new(
            IterPart::Sum(outer_source),
            outer_mark.extent(),
            IterPart::Sum(inner_source),
            inner_mark.extent(),
        )
    }

    fn add_base(division: DivisionResult, base: PrimExpr) -> DivisionResult {
        let mut res = division;
        let inner_sum = match res.inner {
            IterPart::Split(sp) => IterSumExpr::new(vec![sp], base),
            IterPart::Sum(sum) => {
                let new_base = fold_add(sum.base.clone(), base);
                IterSumExpr::new(sum.args, new_base)
            }
        };
        res.inner = IterPart::Sum(inner_sum);
        res
    }

    /// Rebuild a mark from splits sorted inner to outer, rescaling each to
    /// its positional weight.
    fn mark_from_args_and_base(args: &[IterSplitExpr], base: PrimExpr) -> IterMark {
        let mut res: Vec<IterSplitExpr> = Vec::with_capacity(args.len());
        let mut extent = PrimExpr::Int(1);
        for it in args {
            let mut arg = it.clone();
            arg.scale = extent.clone();
            extent = fold_mul(extent, arg.extent.clone());
            res.push(arg);
        }
        res.reverse();
        IterMark::new(IterSource::Sum(IterSumExpr::new(res, base)), extent)
    }

    fn divide_split(&mut self, expr: &IterSplitExpr) -> DivisionResult {
        if let Some(res) = self.split_map.get(&SplitKey::of(expr)).cloned() {
            return res;
        }
        let splits = self.collector.splits_of(&expr.source).to_vec();
        match expr.source.source() {
            IterSource::Value(source) => {
                let PrimExpr::Var(name) = source else {
                    return self.fail(
                        DiagKind::NonAffine,
                        format!("source of {} is neither a variable nor a fused sum", expr),
                    );
                };
                // a variable's splits all live on its side of the partition
                let inner = self.sub_iters.contains(&name);
                for split in &splits {
                    let res = if inner {
                        DivisionResult::whole_inner(
                            IterPart::Split(split.clone()),
                            split.extent.clone(),
                        )
                    } else {
                        DivisionResult::whole_outer(
                            IterPart::Split(split.clone()),
                            split.extent.clone(),
                        )
                    };
                    self.split_map.insert(SplitKey::of(split), res);
                }
            }
            IterSource::Sum(sum) => {
                // divide the fused source, then find the boundary where its
                // splits change sides
                let mark_division = self.divide_sum(&sum, &expr.source.extent());
                if splits.len() == 1 {
                    return mark_division;
                }
                let outer_mark = IterMark::new(
                    IterSource::Sum(mark_division.outer.clone().into_sum()),
                    mark_division.outer_extent.clone(),
                );
                let inner_mark = IterMark::new(
                    IterSource::Sum(mark_division.inner.clone().into_sum()),
                    mark_division.inner_extent.clone(),
                );
                let mut encountered_boundary = mark_division.is_outer();
                let mut used = vec![false; splits.len()];
                let mut inner_iters: Vec<IterSplitExpr> = Vec::new();
                let mut outer_iters: Vec<IterSplitExpr> = Vec::new();
                let mut expected_lower_factor = PrimExpr::Int(1);
                for _ in 0..splits.len() {
                    let mut j = 0;
                    while j < splits.len() {
                        if !used[j]
                            && self.analyzer.can_prove_equal(
                                &splits[j].lower_factor,
                                &expected_lower_factor,
                            )
                        {
                            break;
                        }
                        j += 1;
                    }
                    if j == splits.len() {
                        return self.fail(
                            DiagKind::IncompleteSplit,
                            format!(
                                "no split of {} with lower factor {}",
                                expr.source, expected_lower_factor
                            ),
                        );
                    }
                    used[j] = true;
                    if !encountered_boundary {
                        inner_iters.push(splits[j].clone());
                    } else {
                        outer_iters.push(splits[j].clone());
                    }
                    expected_lower_factor =
                        fold_mul(expected_lower_factor, splits[j].extent.clone());
                    if self
                        .analyzer
                        .can_prove_equal(&expected_lower_factor, &mark_division.inner_extent)
                    {
                        encountered_boundary = true;
                    }
                }
                if !encountered_boundary {
                    return self.fail(
                        DiagKind::IncompleteSplit,
                        format!("no inner/outer boundary among the splits of {}", expr.source),
                    );
                }
                for inner_iter in &inner_iters {
                    let mut new_iter = inner_iter.clone();
                    new_iter.source = inner_mark.clone();
                    self.split_map.insert(
                        SplitKey::of(inner_iter),
                        DivisionResult::whole_inner(
                            IterPart::Split(new_iter),
                            inner_iter.extent.clone(),
                        ),
                    );
                }
                for outer_iter in &outer_iters {
                    let mut new_iter = outer_iter.clone();
                    new_iter.source = outer_mark.clone();
                    new_iter.lower_factor = self.analyzer.simplify(&fold_floordiv(
                        outer_iter.lower_factor.clone(),
                        outer_iters[0].lower_factor.clone(),
                    ));
                    self.split_map.insert(
                        SplitKey::of(outer_iter),
                        DivisionResult::whole_outer(
                            IterPart::Split(new_iter),
                            outer_iter.extent.clone(),
                        ),
                    );
                }
            }
        }
        match self.split_map.get(&SplitKey::of(expr)).cloned() {
            Some(res) => res,
            None => self.fail(
                DiagKind::IncompleteSplit,
                format!("{} was not assigned to either subspace", expr),
            ),
        }
    }
}

/// Divide each index into `outer * inner_extent + inner` with the variables
/// in `sub_iters` forming the inner subspace.
///
/// Returns `None` (with diagnostics) when detection or division fails.
pub fn subspace_divide(
    indices: &[PrimExpr],
    input_iters: &[(VarId, Range)],
    sub_iters: &[VarId],
    predicate: &PrimExpr,
    require_bijective: bool,
    analyzer: &Analyzer,
    diag: &mut DiagSink,
) -> Option<SubspaceDivision> {
    let maps = detect_iter_map(
        indices,
        input_iters,
        predicate,
        require_bijective,
        analyzer,
        diag,
    );
    if maps.is_empty() {
        return None;
    }

    let mut collector = SplitCollector::default();
    collector.collect(&maps);
    let sub_set: FxHashSet<VarId> = sub_iters.iter().cloned().collect();
    let mut divider = SubspaceDivider::new(analyzer, collector, sub_set, diag);

    let mut pairs = Vec::with_capacity(maps.len());
    for expr in &maps {
        let res = divider.divide_sum(expr, &PrimExpr::Int(0));
        if divider.diag.unresolved_count() != 0 {
            return None;
        }
        pairs.push((
            IterMark::new(IterSource::Sum(res.outer.into_sum()), res.outer_extent),
            IterMark::new(IterSource::Sum(res.inner.into_sum()), res.inner_extent),
        ));
    }
    Some(SubspaceDivision {
        pairs,
        outer_pred: divider.outer_preds,
        inner_pred: divider.inner_preds,
    })
}
