pub mod def;
pub mod inverse;
pub mod normalize;
pub mod predicate;
pub mod rewrite;
pub mod subspace;

pub use def::*;
pub use inverse::inverse_affine_iter_map;
pub use normalize::{iter_map_simplify, normalize_iter_map_to_expr, IterMapNormalizer};
pub use predicate::{iter_range_sanity_check, match_bound_constraints, IterConstraint};
pub use rewrite::detect_iter_map;
pub use subspace::{subspace_divide, SubspaceDivision};
