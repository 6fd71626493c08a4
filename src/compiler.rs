//! The compiler front-end: symbol registration, expression management and
//! the compile driver.
//!
//! Typical use:
//!
//! ```
//! use exprvm::{Compiler, SIN};
//!
//! let mut compiler = Compiler::new();
//! compiler.add_function("sin", SIN).unwrap();
//! compiler.add_source_script("input x\noutput y = 2*x + 1").unwrap();
//!
//! let program = compiler.compile().unwrap();
//! let mut executable = program.make_scalar_executable();
//! executable.write(program.input_address("x").unwrap(), 1.0);
//! executable.run();
//! assert_eq!(executable.read(program.output_address("y").unwrap()), 3.0);
//! ```
//!
//! Compilation is a pure pipeline over the registered state: syntax trees
//! are walked into a term graph (one output at a time, each failure wrapped
//! with the output's name), the rewrite pipeline canonicalises the graph,
//! and the code generator produces the [`Program`]. Nothing is committed to
//! the compiler by a failed `compile`.

use std::cell::Cell;
use std::rc::Rc;

use itertools::Itertools;

use crate::ast::{Expression, Node, NodeKind, UnaryOperator};
use crate::codegen;
use crate::errors::CompileError;
use crate::graph::{Term, TermRef};
use crate::parser::{parse_script, ExpressionParser};
use crate::program::{Program, Real, RealFunction};
use crate::rewrite::Pipeline;
use crate::symbols::{Lexicon, Symbol};

/// How an added expression participates in compilation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// Emitted as a program output and visible to later expressions.
    Public,
    /// Emitted as a program output but not visible to later expressions.
    Private,
    /// Visible to later expressions but not emitted.
    Symbolic,
}

/// Collects symbols and output expressions, then compiles them into a
/// [`Program`].
#[derive(Default)]
pub struct Compiler {
    symbols: Lexicon,
    outputs: Vec<Rc<Symbol>>,
}

impl Compiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named constant.
    pub fn add_constant(&mut self, name: &str, value: Real) -> Result<(), CompileError> {
        self.symbols.add(Rc::new(Symbol::Constant {
            name: name.to_string(),
            value,
        }))
    }

    /// Registers a unary host function.
    pub fn add_function(&mut self, name: &str, function: RealFunction) -> Result<(), CompileError> {
        self.symbols.add(Rc::new(Symbol::Function {
            name: name.to_string(),
            function,
        }))
    }

    /// Registers a parameter: a constant that can be updated between
    /// compilations with [`Compiler::set_parameter`].
    pub fn add_parameter(&mut self, name: &str, value: Real) -> Result<(), CompileError> {
        self.symbols.add(Rc::new(Symbol::Parameter {
            name: name.to_string(),
            value: Cell::new(value),
        }))
    }

    /// Updates a parameter's value; already-parsed expressions see the new
    /// value at the next [`Compiler::compile`].
    pub fn set_parameter(&mut self, name: &str, value: Real) -> Result<(), CompileError> {
        match self.symbols.find(name).as_deref() {
            Some(Symbol::Parameter { value: cell, .. }) => {
                cell.set(value);
                Ok(())
            }
            _ => Err(CompileError::UnknownParameter(name.to_string())),
        }
    }

    /// Registers a runtime input variable.
    pub fn add_variable(&mut self, name: &str) -> Result<(), CompileError> {
        self.symbols.add(Rc::new(Symbol::Variable {
            name: name.to_string(),
        }))
    }

    /// Parses and registers a named expression.
    ///
    /// The returned [`Expression`] reports parse failures lazily; duplicate
    /// names fail immediately.
    pub fn add_expression(
        &mut self,
        name: &str,
        text: &str,
        visibility: Visibility,
    ) -> Result<Expression, CompileError> {
        let expression = ExpressionParser::new(&self.symbols).parse_to_expression(text);
        let symbol = Rc::new(Symbol::Expression {
            name: name.to_string(),
            expression: expression.clone(),
        });
        if visibility != Visibility::Private {
            self.symbols.add(symbol.clone())?;
        }
        if visibility != Visibility::Symbolic {
            if self.outputs.iter().any(|output| output.name() == name) {
                return Err(CompileError::DuplicateOutput(name.to_string()));
            }
            self.outputs.push(symbol);
        }
        Ok(expression)
    }

    /// Parses a whole script (see the grammar in [`crate::parser`]).
    pub fn add_source_script(&mut self, input: &str) -> Result<(), CompileError> {
        parse_script(self, input)
    }

    /// The declared input variable names, sorted.
    pub fn inputs(&self) -> Vec<String> {
        self.symbols
            .iter()
            .filter_map(|symbol| match symbol.as_ref() {
                Symbol::Variable { name } => Some(name.clone()),
                _ => None,
            })
            .sorted()
            .collect()
    }

    /// The declared parameters and their current values, sorted by name.
    pub fn parameters(&self) -> Vec<(String, Real)> {
        self.symbols
            .iter()
            .filter_map(|symbol| match symbol.as_ref() {
                Symbol::Parameter { name, value } => Some((name.clone(), value.get())),
                _ => None,
            })
            .sorted_by(|a, b| a.0.cmp(&b.0))
            .collect()
    }

    /// The output expressions in registration order.
    pub fn outputs(&self) -> Vec<(String, Expression)> {
        self.outputs
            .iter()
            .filter_map(|symbol| match symbol.as_ref() {
                Symbol::Expression { name, expression } => {
                    Some((name.clone(), expression.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Compiles the registered outputs into a program.
    ///
    /// # Errors
    /// Any stored parse error (wrapped with its output's name) or code
    /// generation failure. The compiler itself is left untouched.
    pub fn compile(&self) -> Result<Program, CompileError> {
        let graph = self.make_graph()?;
        let rewritten = Pipeline::new().run(&graph);
        self.compile_graph(&rewritten)
    }

    /// Builds the term graph for the registered outputs.
    pub fn make_graph(&self) -> Result<TermRef, CompileError> {
        let mut outputs = Vec::new();
        for symbol in &self.outputs {
            if let Symbol::Expression { name, expression } = symbol.as_ref() {
                let term = build_output(name, expression).map_err(|error| {
                    CompileError::Output {
                        name: name.clone(),
                        source: Box::new(error),
                    }
                })?;
                outputs.push(term);
            }
        }
        Ok(Term::sequence(outputs))
    }

    /// Generates a program from an already-rewritten graph.
    pub fn compile_graph(&self, graph: &TermRef) -> Result<Program, CompileError> {
        codegen::generate(graph, &self.symbols)
    }
}

fn build_output(name: &str, expression: &Expression) -> Result<TermRef, CompileError> {
    let root = expression.root()?;
    let term = build_term(root, expression.input())?;
    Ok(Term::output(name, term))
}

/// Walks a syntax tree into graph terms.
///
/// Constants and parameters become constant terms (parameters are frozen at
/// compile time), variables become inputs, and named expressions are inlined
/// by recursing into their own trees. Negation is represented as
/// multiplication by -1 rather than subtraction from 0.
fn build_term(node: &Node, source: &str) -> Result<TermRef, CompileError> {
    let term = match &node.kind {
        NodeKind::Literal(value) => Term::constant(*value),
        NodeKind::Value(symbol) => match symbol.as_ref() {
            Symbol::Constant { value, .. } => Term::constant(*value),
            Symbol::Parameter { value, .. } => Term::constant(value.get()),
            Symbol::Variable { name } => Term::input(name.clone()),
            Symbol::Expression { expression, .. } => {
                let root = expression.root()?;
                build_term(root, expression.input())?
            }
            Symbol::Function { name, .. } => {
                return Err(CompileError::UnhandledSymbol(name.clone()))
            }
        },
        NodeKind::Function { symbol, argument } => match symbol.as_ref() {
            Symbol::Function { function, .. } => {
                Term::unary_function(*function, build_term(argument, source)?)
            }
            other => return Err(CompileError::UnhandledSymbol(other.name().to_string())),
        },
        NodeKind::Unary { operator, operand } => {
            let operand = build_term(operand, source)?;
            match operator {
                UnaryOperator::Plus => operand,
                UnaryOperator::Minus => Term::multiplication_with_constant(
                    Some(Term::constant(-1.0)),
                    vec![operand],
                    vec![],
                ),
            }
        }
        NodeKind::Binary {
            operator,
            left,
            right,
        } => {
            let left = build_term(left, source)?;
            let right = build_term(right, source)?;
            use crate::ast::BinaryOperator::*;
            match operator {
                Plus => Term::addition(vec![left, right], vec![]),
                Minus => Term::addition(vec![left], vec![right]),
                Asterisk => Term::multiplication(vec![left, right], vec![]),
                Slash => Term::multiplication(vec![left], vec![right]),
                Caret => Term::exponentiation(left, right),
            }
        }
    };
    term.annotate(node.outer_span().text(source));
    Ok(term)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::{Instruction, Vector, COS, SIN};

    fn compile(script: &str) -> Program {
        let mut compiler = Compiler::new();
        compiler.add_function("sin", SIN).unwrap();
        compiler.add_function("cos", COS).unwrap();
        compiler.add_function("sqrt", Real::sqrt).unwrap();
        compiler.add_source_script(script).unwrap();
        compiler.compile().unwrap()
    }

    fn run_scalar(program: &Program, inputs: &[(&str, Real)], output: &str) -> Real {
        let mut executable = program.make_scalar_executable();
        for (name, value) in inputs {
            executable.write(program.input_address(name).unwrap(), *value);
        }
        executable.run();
        executable.read(program.output_address(output).unwrap())
    }

    #[test]
    fn additive_identity_binds_the_output_to_the_input_word() {
        let program = compile("input x\noutput y = x + 0");
        assert_eq!(
            program.output_address("y").unwrap(),
            program.input_address("x").unwrap()
        );
        assert!(program.instructions().ops.is_empty());
    }

    #[test]
    fn self_cancellation_binds_the_output_to_a_zero_constant() {
        let program = compile("input x\noutput y = x - x");
        assert!(program.instructions().ops.is_empty());
        assert_eq!(program.constants().values, vec![0.0]);
        assert_eq!(run_scalar(&program, &[("x", 7.0)], "y"), 0.0);
    }

    #[test]
    fn fourth_power_compiles_to_two_squarings() {
        let program = compile("input x\noutput y = x*x*x*x");
        let input = program.input_address("x").unwrap();
        let offset = program.instructions().memory_offset;
        assert_eq!(
            program.instructions().ops,
            vec![
                Instruction::Multiply {
                    source: input,
                    operand: input
                },
                Instruction::Multiply {
                    source: offset,
                    operand: offset
                },
            ]
        );
        assert_eq!(run_scalar(&program, &[("x", 3.0)], "y"), 81.0);
    }

    #[test]
    fn sine_and_cosine_share_one_sincos_instruction() {
        let program = compile("input x\noutput s = sin(x)\noutput c = cos(x)");
        let ops = &program.instructions().ops;
        assert_eq!(ops.len(), 2);
        let Instruction::SinCos { target, .. } = ops[0] else {
            panic!("expected a fused sincos");
        };
        assert!(matches!(ops[1], Instruction::Nop));
        let sine = program.output_address("s").unwrap();
        let cosine = program.output_address("c").unwrap();
        assert_eq!(cosine as isize - sine as isize, target);
        assert_eq!(run_scalar(&program, &[("x", 0.5)], "s"), 0.5f64.sin());
        assert_eq!(run_scalar(&program, &[("x", 0.5)], "c"), 0.5f64.cos());
    }

    #[test]
    fn nested_constant_arithmetic_folds_to_a_constant_output() {
        let program = compile("param k=3\ninput x\noutput y = (x+2)-(x-(1+k))");
        assert!(program.instructions().ops.is_empty());
        assert_eq!(program.constants().values, vec![6.0]);
        assert_eq!(run_scalar(&program, &[("x", 123.0)], "y"), 6.0);
    }

    #[test]
    fn squared_sum_evaluates_over_vector_lanes() {
        let program = compile("input x\noutput y = (x+1)*(x+1)");
        let mut executable = program.make_vector_executable();
        executable.write(
            program.input_address("x").unwrap(),
            Vector::new([0.0, 1.0, 2.0, 3.0]),
        );
        executable.run();
        let result = executable.read(program.output_address("y").unwrap());
        assert_eq!(result, Vector::new([1.0, 4.0, 9.0, 16.0]));
    }

    #[test]
    fn evaluation_matches_a_direct_implementation() {
        let program = compile(
            "param a = 0.75\n\
             input x\n\
             input y\n\
             output f = a*x^3 - 2*x*y + sqrt(y) / [y + 1]",
        );
        let direct = |x: Real, y: Real| 0.75 * x.powi(3) - 2.0 * x * y + y.sqrt() / (y + 1.0);
        for i in 0..20 {
            let x = -2.0 + 0.2 * Real::from(i);
            let y = 0.5 + 0.1 * Real::from(i);
            let result = run_scalar(&program, &[("x", x), ("y", y)], "f");
            assert!((result - direct(x, y)).abs() < 1e-12);
        }
    }

    #[test]
    fn symbolic_expressions_are_usable_but_not_emitted() {
        let program = compile(
            "input r\n\
             area = r * r\n\
             output doubled = 2 * area",
        );
        assert!(program.output_address("area").is_err());
        assert_eq!(run_scalar(&program, &[("r", 3.0)], "doubled"), 18.0);
    }

    #[test]
    fn private_expressions_are_emitted_but_not_visible() {
        let mut compiler = Compiler::new();
        compiler.add_variable("x").unwrap();
        compiler
            .add_expression("hidden", "x * 2", Visibility::Private)
            .unwrap();
        let program = compiler.compile().unwrap();
        assert!(program.output_address("hidden").is_ok());

        // The private name does not resolve in later expressions.
        let expression = compiler
            .add_expression("y", "hidden + 1", Visibility::Public)
            .unwrap();
        assert!(!expression.is_valid());
        assert_eq!(
            expression.error().unwrap().message,
            "Unknown symbol 'hidden'"
        );
    }

    #[test]
    fn duplicate_symbols_and_outputs_are_rejected() {
        let mut compiler = Compiler::new();
        compiler.add_variable("x").unwrap();
        let error = compiler.add_constant("x", 1.0).unwrap_err();
        assert_eq!(error.to_string(), "Duplicate symbol 'x'");

        let mut compiler = Compiler::new();
        compiler.add_variable("x").unwrap();
        compiler
            .add_expression("y", "x", Visibility::Private)
            .unwrap();
        let error = compiler
            .add_expression("y", "x + 1", Visibility::Private)
            .unwrap_err();
        assert_eq!(error.to_string(), "Duplicate output symbol 'y'");
    }

    #[test]
    fn unused_inputs_resolve_to_the_scratchpad() {
        let program = compile("input x\ninput unused\noutput y = x * 2");
        assert_eq!(program.input_address("unused").unwrap(), 0);
    }

    #[test]
    fn parameters_are_updatable_between_compilations() {
        let mut compiler = Compiler::new();
        compiler.add_source_script("param k = 2\ninput x\noutput y = k * x").unwrap();
        let program = compiler.compile().unwrap();
        assert_eq!(run_scalar(&program, &[("x", 10.0)], "y"), 20.0);

        compiler.set_parameter("k", 5.0).unwrap();
        let program = compiler.compile().unwrap();
        assert_eq!(run_scalar(&program, &[("x", 10.0)], "y"), 50.0);

        assert!(matches!(
            compiler.set_parameter("x", 1.0),
            Err(CompileError::UnknownParameter(_))
        ));
    }

    #[test]
    fn script_errors_carry_global_positions() {
        let mut compiler = Compiler::new();
        let error = compiler
            .add_source_script("input x\noutput y = x +")
            .unwrap_err();
        let CompileError::Parse(parse) = error else {
            panic!("expected a parse error");
        };
        // The failure sits at the end of the second line.
        assert_eq!(parse.position, 22);
        assert_eq!(parse.message, "Unexpected end of input");
    }

    #[test]
    fn invalid_expressions_surface_with_the_output_name() {
        let mut compiler = Compiler::new();
        compiler.add_variable("x").unwrap();
        compiler
            .add_expression("y", "x + q", Visibility::Public)
            .unwrap();
        let error = compiler.compile().unwrap_err();
        assert_eq!(
            error.to_string(),
            "Output 'y': Unknown symbol 'q' at character 5"
        );
    }

    #[test]
    fn comment_lines_and_blank_lines_are_ignored() {
        let program = compile(
            "# heading comment\n\
             \n\
             input x   # trailing comment\n\
             output y = x * x  # another\n",
        );
        assert_eq!(run_scalar(&program, &[("x", 4.0)], "y"), 16.0);
    }

    #[test]
    fn accessors_list_the_registered_state() {
        let mut compiler = Compiler::new();
        compiler
            .add_source_script("param b = 1\nparam a = 2\ninput v\ninput u\noutput y = u + v")
            .unwrap();
        assert_eq!(compiler.inputs(), vec!["u".to_string(), "v".to_string()]);
        assert_eq!(
            compiler.parameters(),
            vec![("a".to_string(), 2.0), ("b".to_string(), 1.0)]
        );
        let outputs = compiler.outputs();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].0, "y");
        assert_eq!(outputs[0].1.input(), " u + v");
    }

    #[test]
    fn named_expressions_inline_transitively() {
        let program = compile(
            "param m = 2\n\
             input t\n\
             speed = m * t\n\
             energy = speed * speed\n\
             output e = energy + 1",
        );
        assert_eq!(run_scalar(&program, &[("t", 3.0)], "e"), 37.0);
    }
}
