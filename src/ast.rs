//! Syntax tree produced by the expression parser.
//!
//! Every node carries two byte spans into the parsed text: the *inner* span
//! covers the token representing the node itself (an operator sign, a
//! literal, an identifier), the *outer* span covers the whole source range of
//! the subtree. Spans drive diagnostics and the disassembly comments of
//! compiled programs; they never affect semantics.
//!
//! An [`Expression`] owns the parsed text together with either the tree or
//! the parse error. Parse failures are lazy: they surface only when the tree
//! is actually walked, wrapped as a [`CompileError`].

use std::rc::Rc;

use crate::errors::{CompileError, ParseError};
use crate::program::Real;
use crate::symbols::Symbol;

/// A half-open byte range into the parsed source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// The source text covered by this span.
    pub fn text<'a>(&self, source: &'a str) -> &'a str {
        &source[self.start.min(source.len())..self.end.min(source.len())]
    }
}

/// Unary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOperator {
    /// `+x` — the identity.
    Plus,
    /// `-x` — the negation.
    Minus,
}

/// Binary operator kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    /// `x + y`
    Plus,
    /// `x - y`
    Minus,
    /// `x * y`
    Asterisk,
    /// `x / y`
    Slash,
    /// `x ^ y`
    Caret,
}

/// The payload of a syntax tree node.
#[derive(Debug, Clone)]
pub enum NodeKind {
    /// A numeric literal.
    Literal(Real),
    /// A reference to a value symbol (constant, parameter, variable or named
    /// expression).
    Value(Rc<Symbol>),
    /// A call to a unary function symbol.
    Function {
        symbol: Rc<Symbol>,
        argument: Box<Node>,
    },
    /// A unary operator application.
    Unary {
        operator: UnaryOperator,
        operand: Box<Node>,
    },
    /// A binary operator application.
    Binary {
        operator: BinaryOperator,
        left: Box<Node>,
        right: Box<Node>,
    },
}

/// A syntax tree node with its source spans.
#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    inner: Span,
    outer: Span,
}

impl Node {
    pub fn new(kind: NodeKind, inner: Span, outer: Span) -> Self {
        Self { kind, inner, outer }
    }

    /// The span of the token representing this node.
    pub fn inner_span(&self) -> Span {
        self.inner
    }

    /// The span of the full source range covered by this subtree.
    pub fn outer_span(&self) -> Span {
        self.outer
    }

    pub(crate) fn set_outer_span(&mut self, outer: Span) {
        self.outer = outer;
    }

    /// Structural equality, ignoring spans.
    ///
    /// Symbols compare by name, literals by value.
    pub fn structurally_equals(&self, other: &Node) -> bool {
        match (&self.kind, &other.kind) {
            (NodeKind::Literal(a), NodeKind::Literal(b)) => a == b,
            (NodeKind::Value(a), NodeKind::Value(b)) => a.name() == b.name(),
            (
                NodeKind::Function {
                    symbol: a,
                    argument: x,
                },
                NodeKind::Function {
                    symbol: b,
                    argument: y,
                },
            ) => a.name() == b.name() && x.structurally_equals(y),
            (
                NodeKind::Unary {
                    operator: a,
                    operand: x,
                },
                NodeKind::Unary {
                    operator: b,
                    operand: y,
                },
            ) => a == b && x.structurally_equals(y),
            (
                NodeKind::Binary {
                    operator: a,
                    left: la,
                    right: ra,
                },
                NodeKind::Binary {
                    operator: b,
                    left: lb,
                    right: rb,
                },
            ) => a == b && la.structurally_equals(lb) && ra.structurally_equals(rb),
            _ => false,
        }
    }
}

#[derive(Debug)]
struct ExpressionData {
    input: String,
    root: Result<Node, ParseError>,
}

/// A parsed expression: the source text plus either its tree or the error.
///
/// Cloning is cheap (shared data). The error, if any, is reported lazily:
/// [`Expression::root`] converts it into a [`CompileError`] naming the
/// failure position, which the compiler then wraps with the output's name.
#[derive(Debug, Clone)]
pub struct Expression {
    data: Rc<ExpressionData>,
}

impl Expression {
    pub(crate) fn new(input: String, root: Result<Node, ParseError>) -> Self {
        Self {
            data: Rc::new(ExpressionData { input, root }),
        }
    }

    /// The source text this expression was parsed from.
    pub fn input(&self) -> &str {
        &self.data.input
    }

    /// `true` when parsing succeeded.
    pub fn is_valid(&self) -> bool {
        self.data.root.is_ok()
    }

    /// The parse error, if parsing failed.
    pub fn error(&self) -> Option<&ParseError> {
        self.data.root.as_ref().err()
    }

    /// The syntax tree root.
    ///
    /// # Errors
    /// Materialises the stored parse error as a
    /// [`CompileError::InvalidExpression`] whose position is 1-based, ready
    /// for display.
    pub fn root(&self) -> Result<&Node, CompileError> {
        self.data.root.as_ref().map_err(|error| {
            CompileError::InvalidExpression {
                message: error.message.clone(),
                position: error.position + 1,
            }
        })
    }
}
