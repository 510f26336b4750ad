//! Three layered shape types describing call and method signatures.
//!
//! `ResolutionShape` describes a method as written (possibly with optional
//! parameters); `PlainShape` describes its single concrete call signature
//! after stub synthesis has collapsed it; `CallShape` describes the
//! signature observed at one call site. See §4.1.

mod call_shape;
mod plain_shape;
mod resolution_shape;
mod selector;

pub use call_shape::CallShape;
pub use plain_shape::PlainShape;
pub use resolution_shape::ResolutionShape;
pub use selector::{DispatchSelector, Selector};

/// A parameter name, as written in source. Front-end symbol interning is
/// out of scope for this crate; plain `String`s are enough to implement
/// the shape algebra and keep selector maps deterministic.
pub type Name = String;
