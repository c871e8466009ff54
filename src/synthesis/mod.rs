//! Function synthesis: candidate scalar functions over packet fields

pub mod expr;
pub mod generator;
pub mod scalar;

pub use expr::{extract, initial_set, BinaryOp, Composition, Expr, PacketFunction, UnaryOp};
pub use generator::{select_function, FunctionSynthesizer, DEFAULT_BINARY_OPS, DEFAULT_UNARY_OPS};
pub use scalar::{Scalar, Width};
