use crate::expr::PrimExpr;
use rustc_hash::{FxHashMap, FxHashSet};
use std::cell::RefCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// What an [`IterMark`] ranges over.
#[derive(Debug, Clone)]
pub enum IterSource {
    /// A fresh input variable, possibly shifted by its range minimum
    /// (`v - min`), so the mark's own domain starts at zero.
    Value(PrimExpr),
    /// A previously fused group of splits.
    Sum(IterSumExpr),
}

#[derive(Debug)]
struct IterMarkData {
    source: IterSource,
    extent: PrimExpr,
}

/// An opaque iterator range `[0, extent)`.
///
/// Marks are shared handles: equality and hashing are by identity, never by
/// content. Tightening a mark's extent or source through one handle is
/// observed by every split that shares it, which is what constraint
/// normalization relies on.
#[derive(Debug, Clone)]
pub struct IterMark(Rc<RefCell<IterMarkData>>);

impl IterMark {
    pub fn new(source: IterSource, extent: PrimExpr) -> Self {
        Self(Rc::new(RefCell::new(IterMarkData { source, extent })))
    }

    pub fn source(&self) -> IterSource {
        self.0.borrow().source.clone()
    }

    pub fn extent(&self) -> PrimExpr {
        self.0.borrow().extent.clone()
    }

    pub fn set_source(&self, source: IterSource) {
        self.0.borrow_mut().source = source;
    }

    pub fn set_extent(&self, extent: PrimExpr) {
        self.0.borrow_mut().extent = extent;
    }

    pub fn same_as(&self, other: &IterMark) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for IterMark {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for IterMark {}

impl Hash for IterMark {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

impl fmt::Display for IterMark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.0.borrow();
        match &data.source {
            IterSource::Value(e) => write!(f, "IterMark({}, extent={})", e, data.extent),
            IterSource::Sum(s) => write!(f, "IterMark({}, extent={})", s, data.extent),
        }
    }
}

/// A contiguous sub-range of a mark, scaled into the output:
/// `floormod(floordiv(source, lower_factor), extent) * scale`.
#[derive(Debug, Clone)]
pub struct IterSplitExpr {
    pub source: IterMark,
    pub lower_factor: PrimExpr,
    pub extent: PrimExpr,
    pub scale: PrimExpr,
}

impl IterSplitExpr {
    /// The whole-mark split: `lower_factor = 1`, `extent = source.extent`,
    /// `scale = 1`.
    pub fn whole(source: IterMark) -> Self {
        let extent = source.extent();
        Self {
            source,
            lower_factor: PrimExpr::Int(1),
            extent,
            scale: PrimExpr::Int(1),
        }
    }

    /// The whole-mark split at a given scale.
    pub fn with_scale(source: IterMark, scale: PrimExpr) -> Self {
        let extent = source.extent();
        Self {
            source,
            lower_factor: PrimExpr::Int(1),
            extent,
            scale,
        }
    }

    pub fn new(source: IterMark, lower_factor: PrimExpr, extent: PrimExpr, scale: PrimExpr) -> Self {
        Self {
            source,
            lower_factor,
            extent,
            scale,
        }
    }
}

impl fmt::Display for IterSplitExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "IterSplit({}, lower_factor={}, extent={}, scale={})",
            self.source, self.lower_factor, self.extent, self.scale
        )
    }
}

/// An affine combination of splits plus an iterator-free base offset.
#[derive(Debug, Clone)]
pub struct IterSumExpr {
    pub args: Vec<IterSplitExpr>,
    pub base: PrimExpr,
}

impl IterSumExpr {
    pub fn new(args: Vec<IterSplitExpr>, base: PrimExpr) -> Self {
        Self { args, base }
    }

    /// A sum with no iterator content at all.
    pub fn constant(base: PrimExpr) -> Self {
        Self {
            args: Vec::new(),
            base,
        }
    }
}

impl fmt::Display for IterSumExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IterSum([")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", arg)?;
        }
        write!(f, "], base={})", self.base)
    }
}

/// Structural equality of two splits: same mark identity, same lower factor
/// and extent, and (unless `check_scale` is false) the same scale.
pub fn split_equal(lhs: &IterSplitExpr, rhs: &IterSplitExpr, check_scale: bool) -> bool {
    if !lhs.source.same_as(&rhs.source) {
        return false;
    }
    if lhs.lower_factor != rhs.lower_factor {
        return false;
    }
    if check_scale && lhs.scale != rhs.scale {
        return false;
    }
    lhs.extent == rhs.extent
}

/// Hash/equality key for sum-indexed session tables.
///
/// Keys compare each arg's `(mark identity, lower_factor, extent)` plus the
/// base; scales are intentionally excluded so sums that differ only in their
/// scales resolve to the same fusion record.
#[derive(Debug, Clone)]
pub struct SumKey(IterSumExpr);

impl SumKey {
    pub fn of(sum: &IterSumExpr) -> Self {
        Self(sum.clone())
    }
}

impl PartialEq for SumKey {
    fn eq(&self, other: &Self) -> bool {
        if self.0.args.len() != other.0.args.len() {
            return false;
        }
        if self.0.base != other.0.base {
            return false;
        }
        self.0
            .args
            .iter()
            .zip(other.0.args.iter())
            .all(|(a, b)| split_equal(a, b, false))
    }
}

impl Eq for SumKey {}

impl Hash for SumKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.args.len().hash(state);
        for arg in &self.0.args {
            arg.source.hash(state);
            arg.lower_factor.hash(state);
            arg.extent.hash(state);
        }
        self.0.base.hash(state);
    }
}

/// The canonicalizer's working value: either an ordinary expression with no
/// iteration-map content, or one of the two iteration-map node kinds.
#[derive(Debug, Clone)]
pub enum CanonExpr {
    Plain(PrimExpr),
    Split(IterSplitExpr),
    Sum(IterSumExpr),
}

impl CanonExpr {
    pub fn is_iter(&self) -> bool {
        !matches!(self, Self::Plain(_))
    }

    /// Promote to a sum: a split becomes a one-term sum with zero base, a
    /// plain expression a zero-term sum carrying it as the base.
    pub fn into_sum(self) -> IterSumExpr {
        match self {
            Self::Sum(s) => s,
            Self::Split(sp) => IterSumExpr::new(vec![sp], PrimExpr::Int(0)),
            Self::Plain(e) => IterSumExpr::constant(e),
        }
    }
}

/// Collects, for every mark reachable from a set of sums (directly or through
/// nested fused sources), the splits that reference it.
///
/// First-visit order is preserved so later walks and diagnostics are
/// deterministic.
#[derive(Debug, Default)]
pub struct SplitCollector {
    pub visited: Vec<IterMark>,
    seen: FxHashSet<IterMark>,
    pub mark2splits: FxHashMap<IterMark, Vec<IterSplitExpr>>,
}

impl SplitCollector {
    pub fn collect(&mut self, sums: &[IterSumExpr]) {
        for sum in sums {
            for split in &sum.args {
                self.collect_mark(&split.source);
                self.mark2splits
                    .entry(split.source.clone())
                    .or_default()
                    .push(split.clone());
            }
        }
    }

    fn collect_mark(&mut self, mark: &IterMark) {
        if !self.seen.insert(mark.clone()) {
            return;
        }
        self.visited.push(mark.clone());
        if let IterSource::Sum(sum) = mark.source() {
            for split in &sum.args {
                self.collect_mark(&split.source);
                self.mark2splits
                    .entry(split.source.clone())
                    .or_default()
                    .push(split.clone());
            }
        }
    }

    pub fn was_visited(&self, mark: &IterMark) -> bool {
        self.seen.contains(mark)
    }

    pub fn splits_of(&self, mark: &IterMark) -> &[IterSplitExpr] {
        self.mark2splits.get(mark).map(Vec::as_slice).unwrap_or(&[])
    }
}
