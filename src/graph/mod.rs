//! Embedded dataflow execution engine
//!
//! A deliberately small, synchronous engine the interop layer marshals
//! against: a mutable operation DAG ([`Graph`]), a runtime context bound to
//! it ([`Session`]) and dense tensor values ([`Tensor`]). The op set is
//! closed; graphs travel between processes as serializable [`GraphDef`]s.

mod autodiff;
pub mod builder;
mod def;
mod handle;
mod session;
mod tensor;

pub use def::{GraphDef, OpDef, OpKind, OptimizerSpec, VarInit};
pub use handle::{shapes_compatible, Graph};
pub use session::{Runner, Session};
pub use tensor::{DType, Tensor};
