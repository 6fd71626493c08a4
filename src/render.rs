//! Human-facing rendering: expression stringifiers and the program
//! disassembler.

use itertools::Itertools;

use crate::ast::{BinaryOperator, Expression, Node, NodeKind};
use crate::program::{Address, Instruction, Program};
use crate::symbols::Symbol;

/// The notation used when stringifying an expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notation {
    /// The infix (algebraic) notation. Re-parsing the result yields a
    /// structurally identical tree.
    Infix,
    /// The prefix (Polish) notation.
    Prefix,
    /// The postfix (reverse Polish) notation.
    Postfix,
}

/// Stringifies an expression, or a one-line error description when it failed
/// to parse.
pub fn stringify_expression(expression: &Expression, notation: Notation) -> String {
    match expression.root() {
        Ok(node) => stringify_node(node, expression.input(), notation),
        Err(error) => format!("*** Error: {error}."),
    }
}

/// Stringifies a syntax tree; `source` is the text it was parsed from.
pub fn stringify_node(node: &Node, source: &str, notation: Notation) -> String {
    let mut result = String::new();
    match notation {
        Notation::Infix => render_infix(node, source, &mut result),
        _ => render_affix(node, source, notation, &mut result),
    }
    result
}

/// Signed operator priority: the magnitude orders precedence, the sign marks
/// associativity (negative operators need parentheses around equal-priority
/// right operands).
fn priority(node: &Node) -> i32 {
    if let NodeKind::Binary { operator, .. } = &node.kind {
        match operator {
            BinaryOperator::Caret => -1,
            BinaryOperator::Slash => -2,
            BinaryOperator::Asterisk => 2,
            BinaryOperator::Minus => -3,
            BinaryOperator::Plus => 3,
        }
    } else {
        0
    }
}

fn symbol_name(symbol: &Symbol) -> &str {
    symbol.name()
}

fn render_infix(node: &Node, source: &str, out: &mut String) {
    match &node.kind {
        NodeKind::Literal(_) => out.push_str(node.inner_span().text(source)),
        NodeKind::Value(symbol) => out.push_str(symbol_name(symbol)),
        NodeKind::Function { symbol, argument } => {
            out.push_str(symbol_name(symbol));
            out.push('(');
            render_infix(argument, source, out);
            out.push(')');
        }
        NodeKind::Unary { operand, .. } => {
            out.push_str(node.inner_span().text(source));
            let needs_parentheses = priority(operand).abs() >= 3;
            if needs_parentheses {
                out.push('(');
            }
            render_infix(operand, source, out);
            if needs_parentheses {
                out.push(')');
            }
        }
        NodeKind::Binary { left, right, .. } => {
            let own = priority(node);
            let needs_left = priority(left).abs() > own.abs();
            let right_priority = priority(right);
            let needs_right = right_priority.abs() > own.abs()
                || (right_priority.abs() == own.abs() && own < 0);
            if needs_left {
                out.push('(');
            }
            render_infix(left, source, out);
            if needs_left {
                out.push(')');
            }
            out.push(' ');
            out.push_str(node.inner_span().text(source));
            out.push(' ');
            if needs_right {
                out.push('(');
            }
            render_infix(right, source, out);
            if needs_right {
                out.push(')');
            }
        }
    }
}

fn render_affix(node: &Node, source: &str, notation: Notation, out: &mut String) {
    let push = |out: &mut String, text: &str| {
        if !out.is_empty() {
            out.push(' ');
        }
        out.push_str(text);
    };
    match &node.kind {
        NodeKind::Literal(_) => push(out, node.inner_span().text(source)),
        NodeKind::Value(symbol) => push(out, symbol_name(symbol)),
        NodeKind::Function { symbol, argument } => {
            if notation == Notation::Prefix {
                push(out, symbol_name(symbol));
            }
            render_affix(argument, source, notation, out);
            if notation == Notation::Postfix {
                push(out, symbol_name(symbol));
            }
        }
        NodeKind::Unary { operand, .. } => {
            let sign = format!("u{}", node.inner_span().text(source));
            if notation == Notation::Prefix {
                push(out, &sign);
            }
            render_affix(operand, source, notation, out);
            if notation == Notation::Postfix {
                push(out, &sign);
            }
        }
        NodeKind::Binary { left, right, .. } => {
            if notation == Notation::Prefix {
                push(out, node.inner_span().text(source));
            }
            render_affix(left, source, notation, out);
            render_affix(right, source, notation, out);
            if notation == Notation::Postfix {
                push(out, node.inner_span().text(source));
            }
        }
    }
}

/// Renders a program as an address-annotated assembly listing.
///
/// The `.data` section lists one word per address (constants printed,
/// runtime-written slots as `?`); the `.start` section lists the
/// instructions. Program comments appear as `; ...` suffixes.
pub fn disassemble(program: &Program) -> String {
    let mut rows: Vec<[String; 4]> = Vec::new();
    let format_address = |address: Address| format!("[{address:04}]");
    let comment = |address: Address| {
        program
            .comments()
            .get(&address)
            .map(|text| format!("; {text}"))
            .unwrap_or_default()
    };

    let constants = program.constants();
    let code = program.instructions();

    rows.push([format_address(0), ".data".to_string(), String::new(), String::new()]);
    for address in 0..code.memory_offset {
        let constant_index = address.checked_sub(constants.memory_offset);
        let value = match constant_index {
            Some(index) if (index as usize) < constants.values.len() => {
                format!("{}", constants.values[index as usize])
            }
            _ => "?".to_string(),
        };
        rows.push([
            format_address(address),
            " word".to_string(),
            value,
            comment(address),
        ]);
    }
    rows.push([
        format_address(code.memory_offset),
        ".start".to_string(),
        String::new(),
        String::new(),
    ]);
    for (index, instruction) in code.ops.iter().enumerate() {
        let address = code.memory_offset + index as Address;
        let (mnemonic, arguments) = match *instruction {
            Instruction::Nop => ("nop", String::new()),
            Instruction::Add { source, operand } => (
                "add",
                format!("{}, {}", format_address(source), format_address(operand)),
            ),
            Instruction::AddImm { immediate, operand } => {
                ("add", format!("{immediate}, {}", format_address(operand)))
            }
            Instruction::Subtract { source, operand } => (
                "sub",
                format!("{}, {}", format_address(source), format_address(operand)),
            ),
            Instruction::SubtractImm { immediate, operand } => {
                ("sub", format!("{immediate}, {}", format_address(operand)))
            }
            Instruction::Multiply { source, operand } => (
                "mul",
                format!("{}, {}", format_address(source), format_address(operand)),
            ),
            Instruction::MultiplyImm { immediate, operand } => {
                ("mul", format!("{immediate}, {}", format_address(operand)))
            }
            Instruction::Divide { source, operand } => (
                "div",
                format!("{}, {}", format_address(source), format_address(operand)),
            ),
            Instruction::DivideImm { immediate, operand } => {
                ("div", format!("{immediate}, {}", format_address(operand)))
            }
            Instruction::Power { source, operand } => (
                "pow",
                format!("{}, {}", format_address(source), format_address(operand)),
            ),
            Instruction::Call { function, operand } => (
                "call",
                format!("{:#x}, {}", function as usize, format_address(operand)),
            ),
            Instruction::SinCos { target, operand } => (
                "sincos",
                format!("${target:+}, {}", format_address(operand)),
            ),
        };
        rows.push([
            format_address(address),
            format!(" {mnemonic}"),
            arguments,
            comment(address),
        ]);
    }

    let widths: Vec<usize> = (0..4)
        .map(|column| rows.iter().map(|row| row[column].len()).max().unwrap_or(0))
        .collect();
    rows.iter()
        .map(|row| {
            let line = row
                .iter()
                .zip(&widths)
                .map(|(cell, &width)| format!("{cell:<width$}"))
                .join("  ");
            line.trim_end().to_string()
        })
        .join("\n")
}
