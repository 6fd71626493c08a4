//! Error types for the exprvm crate.
//!
//! Two error families cover the whole pipeline:
//!
//! - `ParseError`: a syntax failure, carrying the 0-based character position
//!   of the offending token. Positions are local to the parsed text; the
//!   script parser re-bases them to the full script.
//! - `CompileError`: every post-parse failure — duplicate names, invalid
//!   expressions surfacing during graph construction, code generation
//!   invariant breaches, and address lookups on the finished program.
//!
//! Arithmetic failures at evaluation time (division by zero, `pow` on a
//! negative base with a fractional exponent) are never intercepted: results
//! become IEEE-754 NaN/Inf and flow through subsequent instructions.

use thiserror::Error;

/// A syntax error produced by the tokenizer-driven parsers.
///
/// `position` is a 0-based character index into the parsed input. When a
/// script line fails, the script parser adds the line's offset so that the
/// position refers to the whole script.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ParseError {
    /// Human-readable description of the failure.
    pub message: String,
    /// 0-based character index of the failure in the parsed input.
    pub position: usize,
}

impl ParseError {
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }

    /// Returns a copy of this error with `offset` added to its position.
    ///
    /// Used by the script parser to map line-local positions to script-global
    /// ones.
    pub fn offset_by(&self, offset: usize) -> Self {
        Self {
            message: self.message.clone(),
            position: self.position + offset,
        }
    }
}

/// Post-parse failures: semantic errors, code generation invariant breaches
/// and program address lookups.
#[derive(Error, Debug)]
pub enum CompileError {
    /// A name was registered twice in the symbol table.
    #[error("Duplicate symbol '{0}'")]
    DuplicateSymbol(String),
    /// Two output expressions share a name.
    #[error("Duplicate output symbol '{0}'")]
    DuplicateOutput(String),
    /// An expression failed to parse; surfaces when the expression is walked.
    #[error("{message} at character {position}")]
    InvalidExpression { message: String, position: usize },
    /// A value symbol of an unexpected kind reached the graph builder.
    #[error("Unhandled value symbol kind '{0}'")]
    UnhandledSymbol(String),
    /// Wraps any failure while building one output's subgraph.
    #[error("Output '{name}': {source}")]
    Output {
        name: String,
        #[source]
        source: Box<CompileError>,
    },
    /// A term was assigned two different memory addresses.
    #[error("Code generation failed -- ambiguous memory mapping")]
    AmbiguousMemoryMapping,
    /// An instruction operand refers to a term with no assigned address.
    #[error("Code generation failed -- missing memory mapping")]
    MissingMemoryMapping,
    /// A non-terminal term was scheduled into the data section.
    #[error("Code generation failed -- code present in the data section")]
    CodeInDataSection,
    /// A terminal term was scheduled into the code section.
    #[error("Code generation failed -- data present in the code section")]
    DataInCodeSection,
    /// The generated memory layout violates the address-space invariants.
    #[error("Code generation failed -- invalid memory layout")]
    InvalidMemoryLayout,
    /// Address lookup for an input name the program does not know.
    #[error("Unknown input '{0}'")]
    UnknownInput(String),
    /// Address lookup for an output name the program does not know.
    #[error("Unknown output '{0}'")]
    UnknownOutput(String),
    /// A name was expected to denote a parameter but does not.
    #[error("Unknown parameter '{0}'")]
    UnknownParameter(String),
    /// A batch evaluation point has the wrong number of values.
    #[error("Invalid input length: expected {expected}, got {got}")]
    InvalidInputLength { expected: usize, got: usize },
    /// A script line failed to parse.
    #[error("{} at character {}", .0.message, .0.position + 1)]
    Parse(#[from] ParseError),
}
