//! Expression language used by script guards and `{{ }}` templates.
//!
//! The grammar is deliberately small: literals, dotted variable paths,
//! arithmetic, comparison, logical operators, a ternary and a fixed set of
//! helper functions. Evaluation has no side effects.

mod eval;
pub mod functions;
mod lexer;
mod parser;
pub mod template;
mod value;

pub use eval::{evaluate, evaluate_guard, Scope};
pub use parser::{parse, BinaryOp, Expr, UnaryOp};
pub use template::{render, render_typed, render_value};
pub use value::Value;
