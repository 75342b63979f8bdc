//! Installation coordinator: the engine's public operations.

mod builder;
mod core;
mod guard;
mod operations;
mod source;

pub use builder::EngineBuilder;
pub use core::{Engine, RunningApp};
pub use source::{fetch, Fetched, SourceLocation};
