//! Recursive-descent parsers for expressions and scripts.
//!
//! The expression grammar, lowest to highest precedence:
//!
//! ```text
//! sum:     product (('+'|'-') product)*
//! product: sign (('*'|'/') sign)*
//! sign:    ('+'|'-')? power
//! power:   atom ('^' atom)*
//! atom:    IDENTIFIER | IDENTIFIER '(' sum ')' | NUMBER
//!        | '(' sum ')' | '[' sum ']'
//! ```
//!
//! Binary operators are left-associative; unary signs do not stack (`--x` is
//! rejected). Brackets and parentheses are interchangeable. Identifiers
//! resolve against a [`Lexicon`] at parse time: value symbols become value
//! nodes, function symbols require a parenthesised argument, and unknown
//! names fail immediately.
//!
//! The script grammar is line-oriented; `#` starts a comment. Each line is
//! one of:
//!
//! ```text
//! const <name> = <number>
//! param <name> [= <number>]
//! input <name>
//! output <name> = <expression>
//! <name> = <expression>
//! ```
//!
//! The last form declares a *symbolic* expression: usable by later
//! expressions but not emitted as a program output.

use crate::ast::{BinaryOperator, Expression, Node, NodeKind, Span, UnaryOperator};
use crate::compiler::{Compiler, Visibility};
use crate::errors::{CompileError, ParseError};
use crate::symbols::Lexicon;
use crate::tokens::{Token, TokenKind, Tokenizer};

/// A one-token-lookahead cursor over the token stream.
struct Cursor<'a> {
    tokenizer: Tokenizer<'a>,
    next: Token<'a>,
    last: Token<'a>,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        let mut tokenizer = Tokenizer::new(input);
        let next = tokenizer.next_token();
        let last = Token {
            kind: TokenKind::EndOfInput,
            text: "",
            position: 0,
            value: 0.0,
        };
        Self {
            tokenizer,
            next,
            last,
        }
    }

    /// Consumes the next token if it has the given kind.
    fn accept(&mut self, kind: TokenKind) -> bool {
        if self.next.kind == kind {
            self.last = self.next;
            self.next = self.tokenizer.next_token();
            true
        } else {
            false
        }
    }

    /// Consumes the next token of the given kind or fails.
    fn expect(&mut self, kind: TokenKind, message: Option<&str>) -> Result<(), ParseError> {
        if self.accept(kind) {
            Ok(())
        } else {
            match message {
                Some(message) => Err(ParseError::new(message, self.next.position)),
                None => Err(self.unexpected()),
            }
        }
    }

    fn unexpected(&self) -> ParseError {
        if self.next.kind == TokenKind::EndOfInput {
            ParseError::new("Unexpected end of input", self.next.position)
        } else {
            ParseError::new(format!("Unexpected '{}'", self.next.text), self.next.position)
        }
    }

    /// The span of a single token.
    fn token_span(token: &Token<'a>) -> Span {
        Span::new(token.position, token.position + token.text.len())
    }

    /// The span from a start token through the last consumed token.
    fn span_from(&self, start: &Token<'a>) -> Span {
        Span::new(start.position, self.last.position + self.last.text.len())
    }
}

/// Parses a single expression against a lexicon.
pub struct ExpressionParser<'a> {
    lexicon: &'a Lexicon,
}

impl<'a> ExpressionParser<'a> {
    pub fn new(lexicon: &'a Lexicon) -> Self {
        Self { lexicon }
    }

    /// Parses `input` into a syntax tree.
    ///
    /// # Errors
    /// The first syntax failure, with its character position.
    pub fn parse_to_tree(&self, input: &str) -> Result<Node, ParseError> {
        let mut cursor = Cursor::new(input);
        let node = self.parse_sum(&mut cursor)?;
        cursor.expect(TokenKind::EndOfInput, None)?;
        Ok(node)
    }

    /// Parses `input` into an [`Expression`], storing any parse error for
    /// lazy surfacing.
    pub fn parse_to_expression(&self, input: &str) -> Expression {
        Expression::new(input.to_string(), self.parse_to_tree(input))
    }

    /// Parses one left-associative binary level.
    fn parse_binary_level(
        &self,
        cursor: &mut Cursor<'a>,
        mapping: &[(TokenKind, BinaryOperator)],
        next: fn(&Self, &mut Cursor<'a>) -> Result<Node, ParseError>,
    ) -> Result<Node, ParseError> {
        let start = cursor.next;
        let mut prefix = next(self, cursor)?;
        'infix: loop {
            let inner = cursor.next;
            for (kind, operator) in mapping {
                if cursor.accept(*kind) {
                    let postfix = next(self, cursor)?;
                    let outer = cursor.span_from(&start);
                    prefix = Node::new(
                        NodeKind::Binary {
                            operator: *operator,
                            left: Box::new(prefix),
                            right: Box::new(postfix),
                        },
                        Cursor::token_span(&inner),
                        outer,
                    );
                    continue 'infix;
                }
            }
            return Ok(prefix);
        }
    }

    /// Lowest precedence: `+` and `-`.
    fn parse_sum(&self, cursor: &mut Cursor<'a>) -> Result<Node, ParseError> {
        self.parse_binary_level(
            cursor,
            &[
                (TokenKind::Plus, BinaryOperator::Plus),
                (TokenKind::Minus, BinaryOperator::Minus),
            ],
            Self::parse_product,
        )
    }

    /// `*` and `/`.
    fn parse_product(&self, cursor: &mut Cursor<'a>) -> Result<Node, ParseError> {
        self.parse_binary_level(
            cursor,
            &[
                (TokenKind::Asterisk, BinaryOperator::Asterisk),
                (TokenKind::Slash, BinaryOperator::Slash),
            ],
            Self::parse_sign,
        )
    }

    /// A single optional unary sign; signs do not stack.
    fn parse_sign(&self, cursor: &mut Cursor<'a>) -> Result<Node, ParseError> {
        let start = cursor.next;
        for (kind, operator) in [
            (TokenKind::Plus, UnaryOperator::Plus),
            (TokenKind::Minus, UnaryOperator::Minus),
        ] {
            if cursor.accept(kind) {
                let operand = self.parse_power(cursor)?;
                let outer = cursor.span_from(&start);
                return Ok(Node::new(
                    NodeKind::Unary {
                        operator,
                        operand: Box::new(operand),
                    },
                    Cursor::token_span(&start),
                    outer,
                ));
            }
        }
        self.parse_power(cursor)
    }

    /// The binary `^` operator.
    fn parse_power(&self, cursor: &mut Cursor<'a>) -> Result<Node, ParseError> {
        self.parse_binary_level(
            cursor,
            &[(TokenKind::Caret, BinaryOperator::Caret)],
            Self::parse_atom,
        )
    }

    /// Highest precedence: identifiers, calls, numbers and groups.
    fn parse_atom(&self, cursor: &mut Cursor<'a>) -> Result<Node, ParseError> {
        let start = cursor.next;
        if cursor.accept(TokenKind::Identifier) {
            let name = cursor.last;
            return match self.lexicon.find(name.text) {
                Some(symbol) if symbol.is_value() => Ok(Node::new(
                    NodeKind::Value(symbol),
                    Cursor::token_span(&name),
                    Cursor::token_span(&name),
                )),
                Some(symbol) => {
                    cursor.expect(TokenKind::ParenthesisLeft, Some("Expected '('"))?;
                    let argument = self.parse_sum(cursor)?;
                    cursor.expect(TokenKind::ParenthesisRight, Some("Expected ')'"))?;
                    let outer = cursor.span_from(&start);
                    Ok(Node::new(
                        NodeKind::Function {
                            symbol,
                            argument: Box::new(argument),
                        },
                        Cursor::token_span(&name),
                        outer,
                    ))
                }
                None => Err(ParseError::new(
                    format!("Unknown symbol '{}'", name.text),
                    name.position,
                )),
            };
        }
        if cursor.accept(TokenKind::Number) {
            let number = cursor.last;
            return Ok(Node::new(
                NodeKind::Literal(number.value),
                Cursor::token_span(&number),
                Cursor::token_span(&number),
            ));
        }
        for (open, close, message) in [
            (
                TokenKind::ParenthesisLeft,
                TokenKind::ParenthesisRight,
                "Expected ')'",
            ),
            (TokenKind::BracketLeft, TokenKind::BracketRight, "Expected ']'"),
        ] {
            if cursor.accept(open) {
                let mut node = self.parse_sum(cursor)?;
                cursor.expect(close, Some(message))?;
                node.set_outer_span(cursor.span_from(&start));
                return Ok(node);
            }
        }
        Err(cursor.unexpected())
    }
}

/// Parses a whole script into a compiler, line by line.
///
/// Parse errors carry script-global positions.
pub fn parse_script(compiler: &mut Compiler, input: &str) -> Result<(), CompileError> {
    let mut start = 0;
    loop {
        let rest = &input[start..];
        let (line, next) = match rest.find('\n') {
            Some(index) => (&rest[..index], Some(start + index + 1)),
            None => (rest, None),
        };
        parse_script_line(compiler, line).map_err(|error| match error {
            CompileError::Parse(parse) => CompileError::Parse(parse.offset_by(start)),
            other => other,
        })?;
        match next {
            Some(position) => start = position,
            None => return Ok(()),
        }
    }
}

/// Parses a single script line (without its trailing newline).
pub fn parse_script_line(compiler: &mut Compiler, line: &str) -> Result<(), CompileError> {
    let line = &line[..line.find('#').unwrap_or(line.len())];
    let mut cursor = Cursor::new(line);
    if !cursor.accept(TokenKind::Identifier) {
        cursor.expect(TokenKind::EndOfInput, None)?;
        return Ok(());
    }
    match cursor.last.text {
        "const" => {
            cursor.expect(TokenKind::Identifier, None)?;
            let name = cursor.last.text.to_string();
            cursor.expect(TokenKind::Equals, None)?;
            cursor.expect(TokenKind::Number, None)?;
            compiler.add_constant(&name, cursor.last.value)?;
            cursor.expect(TokenKind::EndOfInput, None)?;
        }
        "param" => {
            cursor.expect(TokenKind::Identifier, None)?;
            let name = cursor.last.text.to_string();
            let mut value = 0.0;
            if cursor.accept(TokenKind::Equals) {
                cursor.expect(TokenKind::Number, None)?;
                value = cursor.last.value;
            }
            compiler.add_parameter(&name, value)?;
            cursor.expect(TokenKind::EndOfInput, None)?;
        }
        "input" => {
            cursor.expect(TokenKind::Identifier, None)?;
            compiler.add_variable(cursor.last.text)?;
            cursor.expect(TokenKind::EndOfInput, None)?;
        }
        _ => {
            let (name, visibility) = if cursor.last.text == "output" {
                cursor.expect(TokenKind::Identifier, None)?;
                (cursor.last.text.to_string(), Visibility::Public)
            } else {
                (cursor.last.text.to_string(), Visibility::Symbolic)
            };
            cursor.expect(TokenKind::Equals, None)?;
            let offset = cursor.last.position + cursor.last.text.len();
            let expression = compiler.add_expression(&name, &line[offset..], visibility)?;
            if let Some(error) = expression.error() {
                return Err(CompileError::Parse(error.offset_by(offset)));
            }
        }
    }
    Ok(())
}
