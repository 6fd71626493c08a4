//! Compiled programs and their executables.
//!
//! A [`Program`] is a linear instruction list plus a memory layout over a
//! flat plane of words, laid out low to high as: scratchpad (address 0),
//! input words, constant words, then one word per instruction. Instruction
//! `i` writes the word at `instructions.memory_offset + i`; depth-layered
//! code generation guarantees that every operand lives at a lower address,
//! so straight-line execution is correct.
//!
//! A program is immutable and freely shareable across threads. Evaluation
//! happens through an [`Executable`], which owns a mutable memory plane of
//! either scalar words or fixed-width lane vectors; an executable must not be
//! shared between concurrent evaluators. The usual pattern is: compile once,
//! instantiate one executable per worker.

use std::collections::HashMap;
use std::ops::{Add, Div, Index, IndexMut, Mul, Sub};
use std::ptr;

use rayon::prelude::*;

use crate::errors::CompileError;

/// The numeric type of the expression language.
pub type Real = f64;

/// A unary host function.
pub type RealFunction = fn(Real) -> Real;

/// An index into an executable's memory plane.
pub type Address = u32;

/// Memory slot 0: receives dead writes, backs unused inputs.
pub const SCRATCHPAD_ADDRESS: Address = 0;

/// The host sine; registering this function enables SINCOS fusion.
pub static SIN: RealFunction = Real::sin;

/// The host cosine; registering this function enables SINCOS fusion.
pub static COS: RealFunction = Real::cos;

/// The constant words of a program.
#[derive(Debug, Clone)]
pub struct Constants {
    /// First address of the constant segment.
    pub memory_offset: Address,
    /// Constant values, one word each, in segment order.
    pub values: Vec<Real>,
}

/// The code segment of a program.
#[derive(Debug, Clone)]
pub struct Instructions {
    /// First address of the code segment; instruction `i` writes
    /// `memory_offset + i`.
    pub memory_offset: Address,
    pub ops: Vec<Instruction>,
}

/// A single instruction.
///
/// `operand` always addresses a memory word; the second field is a source
/// address, an immediate, a function pointer or a signed instruction-index
/// displacement, depending on the opcode.
#[derive(Debug, Clone, Copy)]
pub enum Instruction {
    /// Preserves its output slot.
    Nop,
    /// `slot = mem[source] + mem[operand]`
    Add { source: Address, operand: Address },
    /// `slot = immediate + mem[operand]`
    AddImm { immediate: Real, operand: Address },
    /// `slot = mem[source] - mem[operand]`
    Subtract { source: Address, operand: Address },
    /// `slot = immediate - mem[operand]`
    SubtractImm { immediate: Real, operand: Address },
    /// `slot = mem[source] * mem[operand]`
    Multiply { source: Address, operand: Address },
    /// `slot = immediate * mem[operand]`
    MultiplyImm { immediate: Real, operand: Address },
    /// `slot = mem[source] / mem[operand]`
    Divide { source: Address, operand: Address },
    /// `slot = immediate / mem[operand]`
    DivideImm { immediate: Real, operand: Address },
    /// `slot = pow(mem[source], mem[operand])`
    Power { source: Address, operand: Address },
    /// `slot = function(mem[operand])`
    Call {
        function: RealFunction,
        operand: Address,
    },
    /// `slot = sin(mem[operand])`; the slot `target` instructions away
    /// receives `cos(mem[operand])`.
    SinCos { target: isize, operand: Address },
}

/// Byte-wise instruction equality, used by the emission-level CSE.
///
/// `Nop` never compares equal, so placeholders are never deduplicated;
/// `Call` compares the function's address.
impl PartialEq for Instruction {
    fn eq(&self, other: &Self) -> bool {
        use Instruction::*;
        match (self, other) {
            (Nop, Nop) => false,
            (
                Add {
                    source: a,
                    operand: b,
                },
                Add {
                    source: c,
                    operand: d,
                },
            )
            | (
                Subtract {
                    source: a,
                    operand: b,
                },
                Subtract {
                    source: c,
                    operand: d,
                },
            )
            | (
                Multiply {
                    source: a,
                    operand: b,
                },
                Multiply {
                    source: c,
                    operand: d,
                },
            )
            | (
                Divide {
                    source: a,
                    operand: b,
                },
                Divide {
                    source: c,
                    operand: d,
                },
            )
            | (
                Power {
                    source: a,
                    operand: b,
                },
                Power {
                    source: c,
                    operand: d,
                },
            ) => a == c && b == d,
            (
                AddImm {
                    immediate: a,
                    operand: b,
                },
                AddImm {
                    immediate: c,
                    operand: d,
                },
            )
            | (
                SubtractImm {
                    immediate: a,
                    operand: b,
                },
                SubtractImm {
                    immediate: c,
                    operand: d,
                },
            )
            | (
                MultiplyImm {
                    immediate: a,
                    operand: b,
                },
                MultiplyImm {
                    immediate: c,
                    operand: d,
                },
            )
            | (
                DivideImm {
                    immediate: a,
                    operand: b,
                },
                DivideImm {
                    immediate: c,
                    operand: d,
                },
            ) => a == c && b == d,
            (
                Call {
                    function: f,
                    operand: a,
                },
                Call {
                    function: g,
                    operand: b,
                },
            ) => ptr::fn_addr_eq(*f, *g) && a == b,
            (
                SinCos {
                    target: s,
                    operand: a,
                },
                SinCos {
                    target: t,
                    operand: b,
                },
            ) => s == t && a == b,
            _ => false,
        }
    }
}

/// A memory word: either a scalar or a fixed-width lane vector.
///
/// The interpreter is generic over the word type; `+ - * /` use the word's
/// elementwise operators, while powers and host-function calls apply the
/// scalar function per lane.
pub trait Word:
    Copy
    + Send
    + Sync
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
{
    /// A word with every lane set to `value`.
    fn splat(value: Real) -> Self;
    /// Applies a scalar function to every lane.
    fn map(self, function: RealFunction) -> Self;
    /// Combines two words lane by lane through a scalar function.
    fn combine(self, other: Self, function: fn(Real, Real) -> Real) -> Self;
}

impl Word for Real {
    fn splat(value: Real) -> Self {
        value
    }

    fn map(self, function: RealFunction) -> Self {
        function(self)
    }

    fn combine(self, other: Self, function: fn(Real, Real) -> Real) -> Self {
        function(self, other)
    }
}

/// A fixed-width vector of scalars, evaluated elementwise.
///
/// Lanes are independent: the usual use is evaluating one point per lane,
/// e.g. a base point plus finite-difference offsets.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vector([Real; Vector::LANES]);

impl Vector {
    /// Number of lanes per vector word.
    pub const LANES: usize = 4;

    pub fn new(lanes: [Real; Self::LANES]) -> Self {
        Self(lanes)
    }

    pub fn lanes(&self) -> &[Real; Self::LANES] {
        &self.0
    }
}

impl Default for Vector {
    fn default() -> Self {
        Self::splat(0.0)
    }
}

impl From<[Real; Vector::LANES]> for Vector {
    fn from(lanes: [Real; Vector::LANES]) -> Self {
        Self(lanes)
    }
}

impl Index<usize> for Vector {
    type Output = Real;

    fn index(&self, lane: usize) -> &Real {
        &self.0[lane]
    }
}

impl IndexMut<usize> for Vector {
    fn index_mut(&mut self, lane: usize) -> &mut Real {
        &mut self.0[lane]
    }
}

macro_rules! vector_operator {
    ($trait:ident, $method:ident, $operator:tt) => {
        impl $trait for Vector {
            type Output = Vector;

            fn $method(self, other: Vector) -> Vector {
                let mut result = self;
                for lane in 0..Vector::LANES {
                    result.0[lane] = self.0[lane] $operator other.0[lane];
                }
                result
            }
        }
    };
}

vector_operator!(Add, add, +);
vector_operator!(Sub, sub, -);
vector_operator!(Mul, mul, *);
vector_operator!(Div, div, /);

impl Word for Vector {
    fn splat(value: Real) -> Self {
        Self([value; Self::LANES])
    }

    fn map(self, function: RealFunction) -> Self {
        let mut result = self;
        for lane in 0..Self::LANES {
            result.0[lane] = function(self.0[lane]);
        }
        result
    }

    fn combine(self, other: Self, function: fn(Real, Real) -> Real) -> Self {
        let mut result = self;
        for lane in 0..Self::LANES {
            result.0[lane] = function(self.0[lane], other.0[lane]);
        }
        result
    }
}

/// A compiled program: instruction list plus memory layout.
#[derive(Debug, Clone)]
pub struct Program {
    inputs: HashMap<String, Address>,
    outputs: HashMap<String, Address>,
    constants: Constants,
    instructions: Instructions,
    comments: HashMap<Address, String>,
}

impl Program {
    /// Assembles a program, checking the address-space invariants: the
    /// constant segment overlaps neither the scratchpad nor the code
    /// segment, no input maps into the constants or past the code segment
    /// start, and no output maps to the scratchpad.
    pub(crate) fn new(
        inputs: HashMap<String, Address>,
        outputs: HashMap<String, Address>,
        constants: Constants,
        instructions: Instructions,
        comments: HashMap<Address, String>,
    ) -> Result<Self, CompileError> {
        let constant_range =
            constants.memory_offset..constants.memory_offset + constants.values.len() as Address;
        if !constants.values.is_empty()
            && (constants.memory_offset <= SCRATCHPAD_ADDRESS
                || constant_range.end > instructions.memory_offset)
        {
            return Err(CompileError::InvalidMemoryLayout);
        }
        if inputs.values().any(|address| {
            *address >= instructions.memory_offset || constant_range.contains(address)
        }) {
            return Err(CompileError::InvalidMemoryLayout);
        }
        if outputs.values().any(|address| *address == SCRATCHPAD_ADDRESS) {
            return Err(CompileError::InvalidMemoryLayout);
        }
        Ok(Self {
            inputs,
            outputs,
            constants,
            instructions,
            comments,
        })
    }

    /// Input name to address mapping.
    pub fn inputs(&self) -> &HashMap<String, Address> {
        &self.inputs
    }

    /// Output name to address mapping.
    pub fn outputs(&self) -> &HashMap<String, Address> {
        &self.outputs
    }

    pub fn constants(&self) -> &Constants {
        &self.constants
    }

    pub fn instructions(&self) -> &Instructions {
        &self.instructions
    }

    /// Disassembly annotations per address.
    pub fn comments(&self) -> &HashMap<Address, String> {
        &self.comments
    }

    /// The address of an input word.
    ///
    /// # Errors
    /// [`CompileError::UnknownInput`] when the program has no such input.
    pub fn input_address(&self, name: &str) -> Result<Address, CompileError> {
        self.inputs
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::UnknownInput(name.to_string()))
    }

    /// The address of an output word.
    ///
    /// # Errors
    /// [`CompileError::UnknownOutput`] when the program has no such output.
    pub fn output_address(&self, name: &str) -> Result<Address, CompileError> {
        self.outputs
            .get(name)
            .copied()
            .ok_or_else(|| CompileError::UnknownOutput(name.to_string()))
    }

    fn make_executable<W: Word>(&self) -> Executable<W> {
        let code_offset = self.instructions.memory_offset as usize;
        let mut memory = vec![W::splat(0.0); code_offset + self.instructions.ops.len()];
        for (index, value) in self.constants.values.iter().enumerate() {
            memory[self.constants.memory_offset as usize + index] = W::splat(*value);
        }
        Executable {
            memory,
            code_offset,
            ops: self.instructions.ops.clone(),
        }
    }

    /// Instantiates a scalar executable.
    pub fn make_scalar_executable(&self) -> Executable<Real> {
        self.make_executable()
    }

    /// Instantiates a lane-vector executable.
    pub fn make_vector_executable(&self) -> Executable<Vector> {
        self.make_executable()
    }

    /// Evaluates the program at many points in parallel.
    ///
    /// Each rayon worker owns its own scalar executable; the program itself
    /// is only read. `points` are value tuples matching `inputs` in order;
    /// the result rows match `outputs` in order.
    ///
    /// # Errors
    /// Unknown input/output names, or a point whose length does not match
    /// `inputs`.
    pub fn evaluate_batch(
        &self,
        inputs: &[&str],
        outputs: &[&str],
        points: &[Vec<Real>],
    ) -> Result<Vec<Vec<Real>>, CompileError> {
        let input_addresses: Vec<Address> = inputs
            .iter()
            .map(|name| self.input_address(name))
            .collect::<Result<_, _>>()?;
        let output_addresses: Vec<Address> = outputs
            .iter()
            .map(|name| self.output_address(name))
            .collect::<Result<_, _>>()?;
        for point in points {
            if point.len() != input_addresses.len() {
                return Err(CompileError::InvalidInputLength {
                    expected: input_addresses.len(),
                    got: point.len(),
                });
            }
        }
        Ok(points
            .par_iter()
            .map_init(
                || self.make_scalar_executable(),
                |executable, point| {
                    for (address, value) in input_addresses.iter().zip(point) {
                        executable.write(*address, *value);
                    }
                    executable.run();
                    output_addresses
                        .iter()
                        .map(|address| executable.read(*address))
                        .collect()
                },
            )
            .collect())
    }
}

/// An instantiated program: a private, mutable memory plane plus the
/// instruction list.
///
/// Callers write input words (addresses from [`Program::input_address`]),
/// call [`Executable::run`], then read output words. Not shareable between
/// concurrent evaluators; instantiate one per worker instead.
#[derive(Debug, Clone)]
pub struct Executable<W: Word> {
    memory: Vec<W>,
    code_offset: usize,
    ops: Vec<Instruction>,
}

impl<W: Word> Executable<W> {
    /// The memory plane.
    pub fn memory(&self) -> &[W] {
        &self.memory
    }

    /// Mutable access to the memory plane, for writing inputs.
    pub fn memory_mut(&mut self) -> &mut [W] {
        &mut self.memory
    }

    /// Reads the word at `address`.
    pub fn read(&self, address: Address) -> W {
        self.memory[address as usize]
    }

    /// Writes the word at `address`.
    pub fn write(&mut self, address: Address, value: W) {
        self.memory[address as usize] = value;
    }

    /// Executes the instruction list once.
    ///
    /// Instruction `i` writes the slot at `code_offset + i`; `Nop` preserves
    /// its slot; `SinCos` additionally writes the cosine into the slot
    /// `target` instructions away.
    pub fn run(&mut self) {
        for index in 0..self.ops.len() {
            let instruction = self.ops[index];
            let output = self.code_offset + index;
            let value = match instruction {
                Instruction::Nop => continue,
                Instruction::Add { source, operand } => {
                    self.memory[source as usize] + self.memory[operand as usize]
                }
                Instruction::AddImm { immediate, operand } => {
                    W::splat(immediate) + self.memory[operand as usize]
                }
                Instruction::Subtract { source, operand } => {
                    self.memory[source as usize] - self.memory[operand as usize]
                }
                Instruction::SubtractImm { immediate, operand } => {
                    W::splat(immediate) - self.memory[operand as usize]
                }
                Instruction::Multiply { source, operand } => {
                    self.memory[source as usize] * self.memory[operand as usize]
                }
                Instruction::MultiplyImm { immediate, operand } => {
                    W::splat(immediate) * self.memory[operand as usize]
                }
                Instruction::Divide { source, operand } => {
                    self.memory[source as usize] / self.memory[operand as usize]
                }
                Instruction::DivideImm { immediate, operand } => {
                    W::splat(immediate) / self.memory[operand as usize]
                }
                Instruction::Power { source, operand } => self.memory[source as usize]
                    .combine(self.memory[operand as usize], Real::powf),
                Instruction::Call { function, operand } => {
                    self.memory[operand as usize].map(function)
                }
                Instruction::SinCos { target, operand } => {
                    let argument = self.memory[operand as usize];
                    let extra = (output as isize + target) as usize;
                    self.memory[extra] = argument.map(COS);
                    argument.map(SIN)
                }
            };
            self.memory[output] = value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_segments() -> (Constants, Instructions) {
        (
            Constants {
                memory_offset: 2,
                values: Vec::new(),
            },
            Instructions {
                memory_offset: 2,
                ops: Vec::new(),
            },
        )
    }

    #[test]
    fn outputs_may_not_map_to_the_scratchpad() {
        let (constants, instructions) = empty_segments();
        let outputs: HashMap<String, Address> =
            [("y".to_string(), SCRATCHPAD_ADDRESS)].into_iter().collect();
        let result = Program::new(
            HashMap::new(),
            outputs,
            constants,
            instructions,
            HashMap::new(),
        );
        assert!(matches!(result, Err(CompileError::InvalidMemoryLayout)));
    }

    #[test]
    fn inputs_may_not_map_into_the_code_segment() {
        let (constants, instructions) = empty_segments();
        let inputs: HashMap<String, Address> = [("x".to_string(), 5)].into_iter().collect();
        let result = Program::new(
            inputs,
            HashMap::new(),
            constants,
            instructions,
            HashMap::new(),
        );
        assert!(matches!(result, Err(CompileError::InvalidMemoryLayout)));
    }

    #[test]
    fn constants_may_not_overlap_the_code_segment() {
        let constants = Constants {
            memory_offset: 1,
            values: vec![1.0, 2.0],
        };
        let instructions = Instructions {
            memory_offset: 2,
            ops: Vec::new(),
        };
        let result = Program::new(
            HashMap::new(),
            HashMap::new(),
            constants,
            instructions,
            HashMap::new(),
        );
        assert!(matches!(result, Err(CompileError::InvalidMemoryLayout)));
    }

    #[test]
    fn nops_never_compare_equal() {
        assert_ne!(Instruction::Nop, Instruction::Nop);
        assert_eq!(
            Instruction::Add {
                source: 1,
                operand: 2
            },
            Instruction::Add {
                source: 1,
                operand: 2
            }
        );
        assert_ne!(
            Instruction::Add {
                source: 1,
                operand: 2
            },
            Instruction::Subtract {
                source: 1,
                operand: 2
            }
        );
    }

    #[test]
    fn call_instructions_compare_by_function_address() {
        let sin_call = Instruction::Call {
            function: SIN,
            operand: 1,
        };
        let cos_call = Instruction::Call {
            function: COS,
            operand: 1,
        };
        assert_ne!(sin_call, cos_call);
        assert_eq!(
            sin_call,
            Instruction::Call {
                function: SIN,
                operand: 1
            }
        );
    }

    fn arithmetic_program() -> Program {
        // x at 1, constant 10 at 2, code at 3:
        //   [3] = 2.5 * mem[1]
        //   [4] = mem[3] + mem[2]
        //   y = [4]  ->  2.5 * x + 10
        let inputs: HashMap<String, Address> = [("x".to_string(), 1)].into_iter().collect();
        let outputs: HashMap<String, Address> = [("y".to_string(), 4)].into_iter().collect();
        let constants = Constants {
            memory_offset: 2,
            values: vec![10.0],
        };
        let instructions = Instructions {
            memory_offset: 3,
            ops: vec![
                Instruction::MultiplyImm {
                    immediate: 2.5,
                    operand: 1,
                },
                Instruction::Add {
                    source: 3,
                    operand: 2,
                },
            ],
        };
        Program::new(inputs, outputs, constants, instructions, HashMap::new()).unwrap()
    }

    #[test]
    fn scalar_execution_computes_the_expression() {
        let program = arithmetic_program();
        let mut executable = program.make_scalar_executable();
        executable.write(program.input_address("x").unwrap(), 4.0);
        executable.run();
        assert_eq!(executable.read(program.output_address("y").unwrap()), 20.0);
    }

    #[test]
    fn vector_lanes_agree_with_scalar_evaluation() {
        let program = arithmetic_program();
        let x = program.input_address("x").unwrap();
        let y = program.output_address("y").unwrap();

        let lanes = [0.0, 1.0, 2.0, 3.0];
        let mut vector_executable = program.make_vector_executable();
        vector_executable.write(x, Vector::new(lanes));
        vector_executable.run();
        let vector_result = vector_executable.read(y);

        for (lane, value) in lanes.iter().enumerate() {
            let mut scalar_executable = program.make_scalar_executable();
            scalar_executable.write(x, *value);
            scalar_executable.run();
            assert_eq!(vector_result[lane], scalar_executable.read(y));
        }
    }

    #[test]
    fn sincos_writes_both_slots() {
        let inputs: HashMap<String, Address> = [("x".to_string(), 1)].into_iter().collect();
        let outputs: HashMap<String, Address> =
            [("s".to_string(), 2), ("c".to_string(), 3)].into_iter().collect();
        let constants = Constants {
            memory_offset: 2,
            values: Vec::new(),
        };
        let instructions = Instructions {
            memory_offset: 2,
            ops: vec![
                Instruction::SinCos {
                    target: 1,
                    operand: 1,
                },
                Instruction::Nop,
            ],
        };
        let program =
            Program::new(inputs, outputs, constants, instructions, HashMap::new()).unwrap();
        let mut executable = program.make_scalar_executable();
        executable.write(1, 0.5);
        executable.run();
        assert_eq!(executable.read(2), 0.5f64.sin());
        assert_eq!(executable.read(3), 0.5f64.cos());
    }

    #[test]
    fn division_by_zero_propagates_infinity() {
        let inputs: HashMap<String, Address> = [("x".to_string(), 1)].into_iter().collect();
        let outputs: HashMap<String, Address> = [("y".to_string(), 2)].into_iter().collect();
        let constants = Constants {
            memory_offset: 2,
            values: Vec::new(),
        };
        let instructions = Instructions {
            memory_offset: 2,
            ops: vec![Instruction::DivideImm {
                immediate: 1.0,
                operand: 1,
            }],
        };
        let program =
            Program::new(inputs, outputs, constants, instructions, HashMap::new()).unwrap();
        let mut executable = program.make_scalar_executable();
        executable.write(1, 0.0);
        executable.run();
        assert_eq!(executable.read(2), Real::INFINITY);
    }

    #[test]
    fn batch_evaluation_matches_sequential_runs() {
        let program = arithmetic_program();
        let points: Vec<Vec<Real>> = (0..64).map(|i| vec![i as Real * 0.5]).collect();
        let results = program
            .evaluate_batch(&["x"], &["y"], &points)
            .unwrap();
        for (point, row) in points.iter().zip(&results) {
            assert_eq!(row, &vec![2.5 * point[0] + 10.0]);
        }
    }

    #[test]
    fn batch_evaluation_rejects_mismatched_points() {
        let program = arithmetic_program();
        let error = program
            .evaluate_batch(&["x"], &["y"], &[vec![1.0, 2.0]])
            .unwrap_err();
        assert_eq!(error.to_string(), "Invalid input length: expected 1, got 2");
    }

    #[test]
    fn unknown_names_are_reported() {
        let program = arithmetic_program();
        assert!(matches!(
            program.input_address("q"),
            Err(CompileError::UnknownInput(_))
        ));
        assert!(matches!(
            program.output_address("q"),
            Err(CompileError::UnknownOutput(_))
        ));
    }
}
