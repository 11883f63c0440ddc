//! Rill Compiler - MIR subsystem
//!
//! Mid-level intermediate representation and optimization pipeline for the
//! Rill compiler. The front-end (lexer, parser, type checker) hands this
//! crate a typed input tree ([`tir`]); the builder lowers it to SSA MIR
//! ([`mir`]), the pass manager optimizes it, and the partitioner splits the
//! result into codegen units with stable fingerprints for incremental
//! object caching ([`codegen`]).

pub mod codegen;
pub mod error;
pub mod mir;
pub mod tir;

pub use error::{CompileError, Diagnostic, Result, Severity};
pub use tir::Span;
