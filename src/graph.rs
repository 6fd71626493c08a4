//! The shared term graph built from syntax trees.
//!
//! Terms are immutable, reference-counted nodes forming a DAG: the rewrite
//! pipeline deliberately shares structurally identical subtrees. Two derived
//! attributes are computed lazily and cached on first read:
//!
//! - `depth` — the longest path to a leaf, used by the code generator as a
//!   topological layering key;
//! - `key` — a canonical structural fingerprint, equal exactly for terms that
//!   are structurally equivalent modulo the commutativity of the group
//!   operations.
//!
//! Addition and multiplication share one representation: an abelian
//! [`GroupOperation`] with an identity element, an optional null element, a
//! constant term and signed child lists. Negation, subtraction and division
//! are expressed through the negative list rather than dedicated nodes.
//!
//! A term optionally carries the source text of the syntax node it
//! originated from. The reference is write-once (first write wins) and only
//! feeds diagnostics, never semantics.

use std::cell::OnceCell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::program::{Real, RealFunction};

/// A shared handle to a term.
pub type TermRef = Rc<Term>;

/// Distinguishes the two group operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Addition,
    Multiplication,
}

impl GroupKind {
    /// The identity element (0 for addition, 1 for multiplication).
    pub fn identity(&self) -> Real {
        match self {
            GroupKind::Addition => 0.0,
            GroupKind::Multiplication => 1.0,
        }
    }

    /// The absorbing element, if the operation has one.
    pub fn null_element(&self) -> Option<Real> {
        match self {
            GroupKind::Addition => None,
            GroupKind::Multiplication => Some(0.0),
        }
    }

    /// Applies the operation to two values.
    pub fn apply(&self, left: Real, right: Real) -> Real {
        match self {
            GroupKind::Addition => left + right,
            GroupKind::Multiplication => left * right,
        }
    }

    /// Applies the inverse operation to two values.
    pub fn apply_inverse(&self, left: Real, right: Real) -> Real {
        match self {
            GroupKind::Addition => left - right,
            GroupKind::Multiplication => left / right,
        }
    }

    /// The operator signs used in structural keys: (positive, negative).
    pub fn signs(&self) -> (&'static str, &'static str) {
        match self {
            GroupKind::Addition => ("+", "-"),
            GroupKind::Multiplication => ("*", "/"),
        }
    }
}

/// An abelian group operation over a constant and signed child lists.
///
/// The constant carries the folded-together constant contribution; when it
/// equals the identity it is semantically absent. Children in the negative
/// list enter through the inverse operation (subtraction, division).
#[derive(Debug, Clone)]
pub struct GroupOperation {
    kind: GroupKind,
    constant: TermRef,
    positive: Vec<TermRef>,
    negative: Vec<TermRef>,
}

impl GroupOperation {
    /// Builds a group operation.
    ///
    /// `constant` must be a [`TermKind::Constant`]; anything else falls back
    /// to the identity element.
    pub fn new(
        kind: GroupKind,
        constant: Option<TermRef>,
        positive: Vec<TermRef>,
        negative: Vec<TermRef>,
    ) -> Self {
        let constant = constant
            .filter(|term| matches!(term.kind(), TermKind::Constant(_)))
            .unwrap_or_else(|| Term::constant(kind.identity()));
        Self {
            kind,
            constant,
            positive,
            negative,
        }
    }

    pub fn kind(&self) -> GroupKind {
        self.kind
    }

    /// The constant term (always a [`TermKind::Constant`]).
    pub fn constant(&self) -> &TermRef {
        &self.constant
    }

    /// The folded constant value.
    pub fn constant_value(&self) -> Real {
        match self.constant.kind() {
            TermKind::Constant(value) => *value,
            _ => unreachable!("group constant is always a constant term"),
        }
    }

    pub fn positive(&self) -> &[TermRef] {
        &self.positive
    }

    pub fn negative(&self) -> &[TermRef] {
        &self.negative
    }
}

/// The payload of a term.
#[derive(Debug, Clone)]
pub enum TermKind {
    /// The graph root: an unordered collection of output terms.
    Sequence(Vec<TermRef>),
    /// A real constant. `-0` is canonicalised to `+0` on construction.
    Constant(Real),
    /// A runtime input, identified by name.
    Input(String),
    /// A labelled sink binding a name to a term.
    Output { name: String, term: TermRef },
    /// A unary host function application.
    UnaryFunction {
        function: RealFunction,
        argument: TermRef,
    },
    /// Addition or multiplication.
    Group(GroupOperation),
    /// A general power.
    Exponentiation { base: TermRef, exponent: TermRef },
    /// A square, produced by rewriting only.
    Squaring(TermRef),
}

/// A node of the term graph. See the module docs.
#[derive(Debug)]
pub struct Term {
    kind: TermKind,
    depth: OnceCell<usize>,
    key: OnceCell<String>,
    source: OnceCell<String>,
}

impl Term {
    fn make(kind: TermKind) -> TermRef {
        Rc::new(Term {
            kind,
            depth: OnceCell::new(),
            key: OnceCell::new(),
            source: OnceCell::new(),
        })
    }

    pub fn sequence(terms: Vec<TermRef>) -> TermRef {
        Self::make(TermKind::Sequence(terms))
    }

    pub fn constant(value: Real) -> TermRef {
        // Canonicalise -0 to +0 so the structural keys agree.
        let value = if value == 0.0 { 0.0 } else { value };
        Self::make(TermKind::Constant(value))
    }

    pub fn input(name: impl Into<String>) -> TermRef {
        Self::make(TermKind::Input(name.into()))
    }

    pub fn output(name: impl Into<String>, term: TermRef) -> TermRef {
        Self::make(TermKind::Output {
            name: name.into(),
            term,
        })
    }

    pub fn unary_function(function: RealFunction, argument: TermRef) -> TermRef {
        Self::make(TermKind::UnaryFunction { function, argument })
    }

    pub fn addition(positive: Vec<TermRef>, negative: Vec<TermRef>) -> TermRef {
        Self::addition_with_constant(None, positive, negative)
    }

    pub fn addition_with_constant(
        constant: Option<TermRef>,
        positive: Vec<TermRef>,
        negative: Vec<TermRef>,
    ) -> TermRef {
        Self::make(TermKind::Group(GroupOperation::new(
            GroupKind::Addition,
            constant,
            positive,
            negative,
        )))
    }

    pub fn multiplication(positive: Vec<TermRef>, negative: Vec<TermRef>) -> TermRef {
        Self::multiplication_with_constant(None, positive, negative)
    }

    pub fn multiplication_with_constant(
        constant: Option<TermRef>,
        positive: Vec<TermRef>,
        negative: Vec<TermRef>,
    ) -> TermRef {
        Self::make(TermKind::Group(GroupOperation::new(
            GroupKind::Multiplication,
            constant,
            positive,
            negative,
        )))
    }

    pub fn group(kind: GroupKind, operation: GroupOperation) -> TermRef {
        debug_assert!(operation.kind() == kind);
        Self::make(TermKind::Group(operation))
    }

    pub fn exponentiation(base: TermRef, exponent: TermRef) -> TermRef {
        Self::make(TermKind::Exponentiation { base, exponent })
    }

    pub fn squaring(base: TermRef) -> TermRef {
        Self::make(TermKind::Squaring(base))
    }

    pub fn kind(&self) -> &TermKind {
        &self.kind
    }

    /// The constant value, if this term is a constant.
    pub fn as_constant(&self) -> Option<Real> {
        match &self.kind {
            TermKind::Constant(value) => Some(*value),
            _ => None,
        }
    }

    /// The group operation, if this term is one.
    pub fn as_group(&self) -> Option<&GroupOperation> {
        match &self.kind {
            TermKind::Group(operation) => Some(operation),
            _ => None,
        }
    }

    /// The source text of the syntax node this term originated from.
    pub fn source(&self) -> Option<&str> {
        self.source.get().map(String::as_str)
    }

    /// Attaches a source back-reference. The first write wins.
    pub fn annotate(&self, source: impl Into<String>) {
        let _ = self.source.set(source.into());
    }

    /// The longest path from this term to its deepest leaf.
    ///
    /// Terminals have depth 0; every other term is one deeper than its
    /// deepest operand (for group operations, the constant term counts as an
    /// operand). Computed on first read and cached.
    pub fn depth(&self) -> usize {
        *self.depth.get_or_init(|| match &self.kind {
            TermKind::Constant(_) | TermKind::Input(_) => 0,
            TermKind::Sequence(terms) => terms
                .iter()
                .map(|term| term.depth())
                .max()
                .map_or(0, |depth| depth + 1),
            TermKind::Output { term, .. } => 1 + term.depth(),
            TermKind::UnaryFunction { argument, .. } => 1 + argument.depth(),
            TermKind::Group(operation) => {
                let mut depth = operation.constant().depth();
                for term in operation.positive().iter().chain(operation.negative()) {
                    depth = depth.max(term.depth());
                }
                1 + depth
            }
            TermKind::Exponentiation { base, exponent } => 1 + base.depth().max(exponent.depth()),
            TermKind::Squaring(base) => 1 + base.depth(),
        })
    }

    /// The canonical structural fingerprint of this term.
    ///
    /// Keys are equal exactly for structurally equivalent terms modulo the
    /// commutativity of group operations: signed child keys are sorted before
    /// joining. Computed on first read and cached.
    pub fn key(&self) -> &str {
        self.key.get_or_init(|| match &self.kind {
            TermKind::Constant(value) => format!("{value}"),
            TermKind::Input(name) => name.clone(),
            TermKind::Output { name, term } => format!("{}[{}]", name, term.key()),
            TermKind::UnaryFunction { function, argument } => {
                format!("{:#x}({})", *function as usize, argument.key())
            }
            TermKind::Sequence(terms) => {
                let mut keys: Vec<&str> = terms.iter().map(|term| term.key()).collect();
                keys.sort_unstable();
                keys.join("|")
            }
            TermKind::Group(operation) => {
                fn sorted_keys(terms: &[TermRef]) -> Vec<&str> {
                    let mut keys: Vec<&str> = terms.iter().map(|term| term.key()).collect();
                    keys.sort_unstable();
                    keys
                }
                let (positive_sign, negative_sign) = operation.kind().signs();
                let mut result = operation.constant().key().to_string();
                for key in sorted_keys(operation.positive()) {
                    result.push_str(&format!("{positive_sign}({key})"));
                }
                for key in sorted_keys(operation.negative()) {
                    result.push_str(&format!("{negative_sign}({key})"));
                }
                result
            }
            TermKind::Exponentiation { base, exponent } => {
                format!("({})^({})", base.key(), exponent.key())
            }
            TermKind::Squaring(base) => format!("({})^2", base.key()),
        })
    }

    /// Evaluates this term to a constant, if it is one.
    ///
    /// Group operations are constant when they have no children (their
    /// constant term), or when the constant equals the operation's null
    /// element (which absorbs everything else). A power with a constant zero
    /// base evaluates to 1. Inputs, outputs and sequences are never constant.
    pub fn evaluate_constant(&self) -> Option<Real> {
        match &self.kind {
            TermKind::Constant(value) => Some(*value),
            TermKind::Input(_) | TermKind::Output { .. } | TermKind::Sequence(_) => None,
            TermKind::UnaryFunction { function, argument } => {
                argument.evaluate_constant().map(|value| function(value))
            }
            TermKind::Group(operation) => {
                if operation.positive().is_empty() && operation.negative().is_empty() {
                    Some(operation.constant_value())
                } else if operation.kind().null_element() == Some(operation.constant_value()) {
                    operation.kind().null_element()
                } else {
                    None
                }
            }
            TermKind::Exponentiation { base, exponent } => {
                let base = base.evaluate_constant()?;
                if base == 0.0 {
                    return Some(1.0);
                }
                exponent.evaluate_constant().map(|value| base.powf(value))
            }
            TermKind::Squaring(base) => base.evaluate_constant().map(|value| value * value),
        }
    }
}

/// An identity-keyed handle to a term, usable as a hash map key.
///
/// Hashing and equality go by pointer identity, not structure; the handle
/// keeps its term alive, so a map keyed by [`TermId`] can never observe an
/// address being recycled.
#[derive(Debug, Clone)]
pub struct TermId(TermRef);

impl TermId {
    pub fn of(term: &TermRef) -> Self {
        Self(term.clone())
    }

    pub fn term(&self) -> &TermRef {
        &self.0
    }
}

impl PartialEq for TermId {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TermId {}

impl Hash for TermId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as usize).hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminals_have_depth_zero() {
        assert_eq!(Term::constant(4.0).depth(), 0);
        assert_eq!(Term::input("x").depth(), 0);
    }

    #[test]
    fn depth_is_one_past_the_deepest_operand() {
        let x = Term::input("x");
        let sum = Term::addition(vec![x.clone(), Term::constant(1.0)], vec![]);
        assert_eq!(sum.depth(), 1);
        let square = Term::squaring(sum.clone());
        assert_eq!(square.depth(), 2);
        let output = Term::output("y", square.clone());
        assert_eq!(output.depth(), 3);
        let root = Term::sequence(vec![output]);
        assert_eq!(root.depth(), 4);
    }

    #[test]
    fn keys_are_commutative_for_group_operations() {
        let a = Term::input("a");
        let b = Term::input("b");
        let left = Term::addition(vec![a.clone(), b.clone()], vec![]);
        let right = Term::addition(vec![b.clone(), a.clone()], vec![]);
        assert_eq!(left.key(), right.key());
    }

    #[test]
    fn keys_distinguish_sign_and_operation() {
        let a = Term::input("a");
        let b = Term::input("b");
        let difference = Term::addition(vec![a.clone()], vec![b.clone()]);
        let reversed = Term::addition(vec![b.clone()], vec![a.clone()]);
        assert_ne!(difference.key(), reversed.key());
        let sum = Term::addition(vec![a.clone(), b.clone()], vec![]);
        let product = Term::multiplication(vec![a, b], vec![]);
        assert_ne!(sum.key(), product.key());
    }

    #[test]
    fn negative_zero_is_canonicalised() {
        assert_eq!(Term::constant(-0.0).key(), Term::constant(0.0).key());
        assert!(Term::constant(-0.0).as_constant().unwrap().is_sign_positive());
    }

    #[test]
    fn group_operations_fold_to_their_constant_or_null() {
        let empty = Term::addition_with_constant(Some(Term::constant(5.0)), vec![], vec![]);
        assert_eq!(empty.evaluate_constant(), Some(5.0));

        let x = Term::input("x");
        let zero_product =
            Term::multiplication_with_constant(Some(Term::constant(0.0)), vec![x.clone()], vec![]);
        assert_eq!(zero_product.evaluate_constant(), Some(0.0));

        let live = Term::addition(vec![x], vec![]);
        assert_eq!(live.evaluate_constant(), None);
    }

    #[test]
    fn power_with_constant_zero_base_is_one() {
        let x = Term::input("x");
        let power = Term::exponentiation(Term::constant(0.0), x);
        assert_eq!(power.evaluate_constant(), Some(1.0));
    }

    #[test]
    fn constant_powers_fold() {
        let power = Term::exponentiation(Term::constant(2.0), Term::constant(10.0));
        assert_eq!(power.evaluate_constant(), Some(1024.0));
        let square = Term::squaring(Term::constant(-3.0));
        assert_eq!(square.evaluate_constant(), Some(9.0));
    }

    #[test]
    fn source_annotations_are_write_once() {
        let term = Term::input("x");
        term.annotate("first");
        term.annotate("second");
        assert_eq!(term.source(), Some("first"));
    }

    #[test]
    fn term_ids_compare_by_identity() {
        let a = Term::input("x");
        let b = Term::input("x");
        assert_eq!(a.key(), b.key());
        assert_ne!(TermId::of(&a), TermId::of(&b));
        assert_eq!(TermId::of(&a), TermId::of(&a.clone()));
    }
}
