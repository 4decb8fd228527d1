//! Declarative value shaping: the transform algebra applied to single
//! values, and the response mapper that reshapes raw tool responses
//! before they are bound to flow variables.

pub mod mapper;
pub mod transform;

pub use mapper::{apply_mapping, matches_filter};
pub use transform::apply_transform;
