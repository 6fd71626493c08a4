//! Just-ahead-of-time compiler and evaluator for scalar expression scripts.
//!
//! This crate compiles a small script language — named inputs, parameters,
//! constants and output expressions — into a dense bytecode program over a
//! flat memory plane, then evaluates that program many times: one point at a
//! time, or over a fixed-width lane vector with shared subexpressions
//! computed once.
//!
//! The pipeline: source text → syntax trees (one per output) → a shared,
//! canonicalised term graph → algebraic rewriting (constant folding,
//! associative flattening, cancellation, power fusion, deduplication) →
//! depth-scheduled bytecode with instruction-level CSE and SINCOS fusion →
//! a scalar or lane-vector [`Executable`].
//!
//! # Example
//!
//! ```rust
//! use exprvm::{Compiler, SIN, COS};
//!
//! let mut compiler = Compiler::new();
//! compiler.add_function("sin", SIN).unwrap();
//! compiler.add_function("cos", COS).unwrap();
//! compiler.add_source_script(
//!     "param k = 2\n\
//!      input x\n\
//!      output y = k * sin(x) * sin(x)",
//! ).unwrap();
//!
//! let program = compiler.compile().unwrap();
//! let mut executable = program.make_scalar_executable();
//! executable.write(program.input_address("x").unwrap(), 0.5);
//! executable.run();
//!
//! let y = executable.read(program.output_address("y").unwrap());
//! assert!((y - 2.0 * 0.5f64.sin().powi(2)).abs() < 1e-15);
//! ```
//!
//! A [`Program`] is immutable and shareable across threads; each concurrent
//! evaluator owns its own [`Executable`] (see [`Program::evaluate_batch`]
//! for the compile-once / evaluate-everywhere pattern).

pub use compiler::{Compiler, Visibility};
pub use errors::{CompileError, ParseError};
pub use program::{
    Address, Executable, Program, Real, RealFunction, Vector, Word, COS, SCRATCHPAD_ADDRESS, SIN,
};

pub mod prelude {
    pub use crate::ast::Expression;
    pub use crate::compiler::{Compiler, Visibility};
    pub use crate::errors::{CompileError, ParseError};
    pub use crate::program::{Executable, Program, Real, Vector, COS, SIN};
    pub use crate::render::{disassemble, stringify_expression, Notation};
}

/// Syntax tree nodes and parsed expressions.
pub mod ast;
/// Depth-layer scheduling and instruction emission.
pub mod codegen;
/// The compiler front-end API.
pub mod compiler;
/// Error types for parsing and compilation.
pub mod errors;
/// The shared term graph.
pub mod graph;
/// Expression and script parsers.
pub mod parser;
/// Compiled programs and their executables.
pub mod program;
/// Expression stringifiers and the program disassembler.
pub mod render;
/// The algebraic rewrite pipeline.
pub mod rewrite;
/// Named symbols and the lexicon.
pub mod symbols;
/// The tokenizer.
pub mod tokens;
