//! Code generation: from a term graph to a [`Program`].
//!
//! The generator gathers every unique term reachable from the root, buckets
//! them by depth and sorts each bucket by term kind so emission is
//! deterministic. Depth level 0 becomes the data section (inputs first, then
//! constants); every higher level emits into the code section in ascending
//! order, which guarantees that all operands of an instruction live at lower
//! addresses than the instruction's own slot.
//!
//! Emission deduplicates at the instruction level: a byte-equal instruction
//! that already exists is reused instead of re-emitted. A final pass fuses
//! `sin`/`cos` call pairs sharing an argument into a single SINCOS
//! instruction plus a NOP.

use std::collections::{HashMap, HashSet};
use std::ptr;

use itertools::Itertools;

use crate::errors::CompileError;
use crate::graph::{GroupKind, GroupOperation, TermId, TermKind, TermRef};
use crate::program::{
    Address, Constants, Instruction, Instructions, Program, Real, COS, SCRATCHPAD_ADDRESS, SIN,
};
use crate::symbols::{Lexicon, Symbol};

/// Generates a [`Program`] from the graph under `root`.
///
/// `symbols` supplies the public symbol table; declared variables that no
/// output references are mapped to the scratchpad so their addresses still
/// resolve.
pub fn generate(root: &TermRef, symbols: &Lexicon) -> Result<Program, CompileError> {
    CodeGenerator::new(root).generate(symbols)
}

struct CodeGenerator {
    levels: Vec<Vec<TermRef>>,
    unique: HashSet<TermId>,
    memory_map: HashMap<TermId, Address>,
    inputs: HashMap<String, Address>,
    outputs: HashMap<String, Address>,
    constants: Constants,
    instructions: Instructions,
    comments: HashMap<Address, String>,
}

/// Sort ordinal for the stable per-level kind sort.
fn ordinal(term: &TermRef) -> u8 {
    match term.kind() {
        TermKind::Constant(_) => 0,
        TermKind::Input(_) => 1,
        TermKind::Output { .. } => 2,
        TermKind::UnaryFunction { .. } => 3,
        TermKind::Group(operation) => match operation.kind() {
            GroupKind::Addition => 4,
            GroupKind::Multiplication => 5,
        },
        TermKind::Exponentiation { .. } => 6,
        TermKind::Squaring(_) => 7,
        TermKind::Sequence(_) => 8,
    }
}

impl CodeGenerator {
    fn new(root: &TermRef) -> Self {
        let mut generator = Self {
            levels: Vec::new(),
            unique: HashSet::new(),
            memory_map: HashMap::new(),
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            constants: Constants {
                memory_offset: 1,
                values: Vec::new(),
            },
            instructions: Instructions {
                memory_offset: 1,
                ops: Vec::new(),
            },
            comments: HashMap::new(),
        };
        generator.gather(root);
        generator
    }

    /// Collects every unique reachable term into its depth bucket.
    ///
    /// The sequence root is traversed but not scheduled; group operation
    /// constants are excluded because they are emitted as immediates.
    fn gather(&mut self, term: &TermRef) {
        if let TermKind::Sequence(terms) = term.kind() {
            for term in terms {
                self.gather(term);
            }
            return;
        }
        if !self.unique.insert(TermId::of(term)) {
            return;
        }
        let depth = term.depth();
        if self.levels.len() <= depth {
            self.levels.resize(depth + 1, Vec::new());
        }
        self.levels[depth].push(term.clone());
        match term.kind() {
            TermKind::Constant(_) | TermKind::Input(_) => {}
            TermKind::Output { term, .. } => self.gather(term),
            TermKind::UnaryFunction { argument, .. } => self.gather(argument),
            TermKind::Group(operation) => {
                for term in operation.positive() {
                    self.gather(term);
                }
                for term in operation.negative() {
                    self.gather(term);
                }
            }
            TermKind::Exponentiation { base, exponent } => {
                self.gather(base);
                self.gather(exponent);
            }
            TermKind::Squaring(base) => self.gather(base),
            TermKind::Sequence(_) => unreachable!("handled above"),
        }
    }

    fn generate(mut self, symbols: &Lexicon) -> Result<Program, CompileError> {
        self.add_comment(SCRATCHPAD_ADDRESS, "scratch-pad");
        let levels = std::mem::take(&mut self.levels);
        for (depth, mut terms) in levels.into_iter().enumerate() {
            terms.sort_by_key(ordinal);
            if depth == 0 {
                self.generate_data_section(&terms)?;
            } else {
                self.generate_code_section(&terms)?;
            }
        }
        self.generate_intrinsics();
        // Variables never referenced by any output still resolve: they map
        // to the scratchpad.
        for symbol in symbols
            .iter()
            .sorted_by_key(|symbol| symbol.name().to_string())
        {
            if let Symbol::Variable { name } = symbol.as_ref() {
                if !self.inputs.contains_key(name) {
                    self.inputs.insert(name.clone(), SCRATCHPAD_ADDRESS);
                    self.add_comment(SCRATCHPAD_ADDRESS, &format!("'{name}'"));
                }
            }
        }
        Program::new(
            self.inputs,
            self.outputs,
            self.constants,
            self.instructions,
            self.comments,
        )
    }

    fn generate_data_section(&mut self, terms: &[TermRef]) -> Result<(), CompileError> {
        let mut constant_count: Address = 0;
        let mut input_count: Address = 0;
        for term in terms {
            match term.kind() {
                TermKind::Constant(_) => constant_count += 1,
                TermKind::Input(_) => input_count += 1,
                _ => return Err(CompileError::CodeInDataSection),
            }
        }
        let variable_section: Address = 1;
        let constant_section = variable_section + input_count;
        let code_section = constant_section + constant_count;
        for term in terms {
            match term.kind() {
                TermKind::Constant(value) => {
                    let address = constant_section + self.constants.values.len() as Address;
                    self.constants.values.push(*value);
                    if !self.comments.contains_key(&address) {
                        self.add_comment(address, "constant");
                    }
                    self.map_to_memory(term, address)?;
                }
                TermKind::Input(name) => {
                    let next = variable_section + self.inputs.len() as Address;
                    let address = *self.inputs.entry(name.clone()).or_insert(next);
                    if !self.comments.contains_key(&address) {
                        self.add_comment(address, "input");
                    }
                    self.map_to_memory(term, address)?;
                }
                _ => unreachable!("checked above"),
            }
        }
        self.constants.memory_offset = constant_section;
        self.instructions.memory_offset = code_section;
        Ok(())
    }

    fn generate_code_section(&mut self, terms: &[TermRef]) -> Result<(), CompileError> {
        for term in terms {
            match term.kind() {
                TermKind::Output { name, term: child } => {
                    // Outputs emit nothing: the name binds to the child's slot.
                    let address = self.address_of(child)?;
                    self.outputs.insert(name.clone(), address);
                    self.map_to_memory(term, address)?;
                }
                TermKind::UnaryFunction { function, argument } => {
                    let operand = self.address_of(argument)?;
                    self.emit(
                        Instruction::Call {
                            function: *function,
                            operand,
                        },
                        Some(term),
                    )?;
                }
                TermKind::Group(operation) => match operation.kind() {
                    GroupKind::Addition => self.emit_group(
                        term,
                        operation.clone(),
                        |immediate, operand| Instruction::AddImm { immediate, operand },
                        |source, operand| Instruction::Add { source, operand },
                        |immediate, operand| Instruction::SubtractImm { immediate, operand },
                        |source, operand| Instruction::Subtract { source, operand },
                    )?,
                    GroupKind::Multiplication => self.emit_group(
                        term,
                        operation.clone(),
                        |immediate, operand| Instruction::MultiplyImm { immediate, operand },
                        |source, operand| Instruction::Multiply { source, operand },
                        |immediate, operand| Instruction::DivideImm { immediate, operand },
                        |source, operand| Instruction::Divide { source, operand },
                    )?,
                },
                TermKind::Exponentiation { base, exponent } => {
                    let source = self.address_of(base)?;
                    let operand = self.address_of(exponent)?;
                    self.emit(Instruction::Power { source, operand }, Some(term))?;
                }
                TermKind::Squaring(base) => {
                    let address = self.address_of(base)?;
                    self.emit(
                        Instruction::Multiply {
                            source: address,
                            operand: address,
                        },
                        Some(term),
                    )?;
                }
                TermKind::Constant(_) | TermKind::Input(_) | TermKind::Sequence(_) => {
                    return Err(CompileError::DataInCodeSection)
                }
            }
        }
        Ok(())
    }

    /// Emits the instruction run for one group operation.
    ///
    /// The first child either pairs with the constant in an `_IMM`
    /// instruction (when the constant is not the identity) or becomes the
    /// accumulator directly with the operation left pending; every further
    /// child combines with the accumulator, switching to the inverse opcodes
    /// for the negative list. A still-pending operation after the last child
    /// (the single-child case) folds the constant in with an `_IMM`
    /// instruction.
    fn emit_group(
        &mut self,
        term: &TermRef,
        operation: GroupOperation,
        initial_positive: fn(Real, Address) -> Instruction,
        sequential_positive: fn(Address, Address) -> Instruction,
        initial_negative: fn(Real, Address) -> Instruction,
        sequential_negative: fn(Address, Address) -> Instruction,
    ) -> Result<(), CompileError> {
        let constant = operation.constant_value();
        let needs_constant = constant != operation.kind().identity();
        let mut last_address: Option<Address> = None;
        let mut pending: Option<fn(Real, Address) -> Instruction> = None;

        let sides = [
            (operation.positive(), initial_positive, sequential_positive),
            (operation.negative(), initial_negative, sequential_negative),
        ];
        for (terms, initial, sequential) in sides {
            for child in terms {
                let address = self.address_of(child)?;
                if let Some(accumulator) = last_address {
                    last_address = Some(self.emit(sequential(accumulator, address), None)?);
                    pending = None;
                } else if needs_constant {
                    last_address = Some(self.emit(initial(constant, address), None)?);
                } else {
                    last_address = Some(address);
                    pending = Some(initial);
                }
            }
        }
        let mut accumulator = last_address.ok_or(CompileError::MissingMemoryMapping)?;
        if let Some(initial) = pending {
            accumulator = self.emit(initial(constant, accumulator), None)?;
        }
        self.map_to_memory(term, accumulator)
    }

    /// Emits an instruction, reusing a byte-equal one when present.
    fn emit(
        &mut self,
        instruction: Instruction,
        emitter: Option<&TermRef>,
    ) -> Result<Address, CompileError> {
        let index = match self
            .instructions
            .ops
            .iter()
            .position(|existing| *existing == instruction)
        {
            Some(index) => index,
            None => {
                self.instructions.ops.push(instruction);
                self.instructions.ops.len() - 1
            }
        };
        let address = self.instructions.memory_offset + index as Address;
        if let Some(term) = emitter {
            self.map_to_memory(term, address)?;
        }
        Ok(address)
    }

    /// Fuses `sin`/`cos` call pairs over one argument into SINCOS + NOP.
    fn generate_intrinsics(&mut self) {
        #[derive(Default)]
        struct Candidates {
            sin: Option<usize>,
            cos: Option<usize>,
        }
        let mut candidates: HashMap<Address, Candidates> = HashMap::new();
        for (index, instruction) in self.instructions.ops.iter().enumerate() {
            if let Instruction::Call { function, operand } = instruction {
                if ptr::fn_addr_eq(*function, SIN) {
                    candidates.entry(*operand).or_default().sin = Some(index);
                }
                if ptr::fn_addr_eq(*function, COS) {
                    candidates.entry(*operand).or_default().cos = Some(index);
                }
            }
        }
        for (operand, candidate) in candidates {
            if let (Some(sin_index), Some(cos_index)) = (candidate.sin, candidate.cos) {
                self.instructions.ops[sin_index] = Instruction::SinCos {
                    target: cos_index as isize - sin_index as isize,
                    operand,
                };
                self.instructions.ops[cos_index] = Instruction::Nop;
            }
        }
    }

    fn map_to_memory(&mut self, term: &TermRef, address: Address) -> Result<(), CompileError> {
        if self.memory_map.insert(TermId::of(term), address).is_some() {
            return Err(CompileError::AmbiguousMemoryMapping);
        }
        if let TermKind::Output { name, .. } = term.kind() {
            self.add_comment(address, &format!("'{name}'"));
        } else if let Some(source) = term.source() {
            self.add_comment(address, &format!("'{source}'"));
        }
        Ok(())
    }

    fn address_of(&self, term: &TermRef) -> Result<Address, CompileError> {
        self.memory_map
            .get(&TermId::of(term))
            .copied()
            .ok_or(CompileError::MissingMemoryMapping)
    }

    fn add_comment(&mut self, address: Address, comment: &str) {
        let entry = self.comments.entry(address).or_default();
        if !entry.is_empty() {
            entry.push_str(", ");
        }
        entry.push_str(comment);
    }
}
