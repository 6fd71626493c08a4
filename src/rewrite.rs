//! The algebraic rewrite pipeline over the term graph.
//!
//! [`Pipeline::run`] rewrites a graph bottom-up into a canonical, maximally
//! shared form. Per term, the passes run in this order:
//!
//! 1. **Grouping** — associative flattening: nested sequences are spliced,
//!    and a group operation absorbs constant children into its constant and
//!    splices same-kind children (sign-swapped when they come in through the
//!    negative list).
//! 2. **Reduction** — cancellation of terms appearing with both signs,
//!    collapse of single-child identity groups, fusion of repeated terms
//!    (`n` addends into a multiplication by `n`, `n` factors into a power),
//!    sign normalisation of negative multiplications, and expansion of
//!    integer powers into squaring chains.
//! 3. **Constant folding** — any term that evaluates to a constant is
//!    replaced by that constant.
//! 4. **Merge** — structurally identical terms (by key) coalesce into one
//!    shared instance: global common-subexpression elimination.
//!
//! Grouping runs before reduction so that one pass suffices: flattening
//! exposes the occurrences that cancellation then eliminates. When fusion
//! fires, the rebuilt operation is re-reduced for the same reason.
//!
//! Results are memoised by input term *identity* (not key): every subtree is
//! rewritten at most once per run. Two structurally identical inputs arrive
//! at distinct outputs which the merge step then coalesces.
//!
//! Two optional passes can be enabled: [`Pipeline::with_renames`] rewrites
//! input/output names through a mapping, and
//! [`Pipeline::with_trigonometric_identities`] rewrites `sin(x)^2` into
//! `1 - cos(x)^2` (and vice versa) once the sibling square has been seen.

use std::collections::HashMap;
use std::ptr;
use std::rc::{Rc, Weak};

use crate::graph::{GroupKind, GroupOperation, Term, TermId, TermKind, TermRef};
use crate::program::{Real, COS, SIN};

#[derive(Default)]
struct TrigCache {
    squared_sines: HashMap<TermId, TermRef>,
    squared_cosines: HashMap<TermId, TermRef>,
}

/// The rewrite pipeline. See the module docs.
///
/// A pipeline instance accumulates its merge cache across [`Pipeline::run`]
/// calls, so graphs rewritten by the same instance share terms with each
/// other. The per-run memo table is cleared on entry.
#[derive(Default)]
pub struct Pipeline {
    memo: HashMap<TermId, TermRef>,
    merged: HashMap<String, Weak<Term>>,
    renames: HashMap<String, String>,
    trig: Option<TrigCache>,
}

impl Pipeline {
    /// The default pipeline: grouping, reduction, constant folding, merge.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enables input/output renaming through the given mapping.
    pub fn with_renames(mut self, renames: HashMap<String, String>) -> Self {
        self.renames = renames;
        self
    }

    /// Enables the `sin²+cos²` rewrite.
    pub fn with_trigonometric_identities(mut self) -> Self {
        self.trig = Some(TrigCache::default());
        self
    }

    /// Rewrites the graph under `root` and returns the new root.
    pub fn run(&mut self, root: &TermRef) -> TermRef {
        self.memo.clear();
        self.transform(root)
    }

    /// Transforms one term, memoised by input identity.
    fn transform(&mut self, term: &TermRef) -> TermRef {
        if let Some(result) = self.memo.get(&TermId::of(term)) {
            return result.clone();
        }
        let result = self.rewrite(term);
        if let Some(source) = term.source() {
            // Carry the source annotation forward; the first write wins.
            result.annotate(source);
        }
        let result = self.coalesce(result);
        self.memo.insert(TermId::of(term), result.clone());
        result
    }

    /// Constant folding followed by the merge step.
    fn coalesce(&mut self, term: TermRef) -> TermRef {
        let term = match term.evaluate_constant() {
            Some(value) if term.as_constant().is_none() => {
                let constant = Term::constant(value);
                if let Some(source) = term.source() {
                    constant.annotate(source);
                }
                constant
            }
            _ => term,
        };
        let key = term.key().to_string();
        if let Some(cached) = self.merged.get(&key).and_then(Weak::upgrade) {
            if let Some(source) = term.source() {
                cached.annotate(source);
            }
            return cached;
        }
        self.merged.insert(key, Rc::downgrade(&term));
        term
    }

    fn rewrite(&mut self, term: &TermRef) -> TermRef {
        match term.kind() {
            TermKind::Constant(_) => term.clone(),
            TermKind::Input(name) => match self.renames.get(name) {
                Some(renamed) => Term::input(renamed.clone()),
                None => term.clone(),
            },
            TermKind::Output { name, term: child } => {
                let name = self.renames.get(name).unwrap_or(name).clone();
                let child = self.transform(child);
                Term::output(name, child)
            }
            TermKind::UnaryFunction { function, argument } => {
                let argument = self.transform(argument);
                Term::unary_function(*function, argument)
            }
            TermKind::Sequence(terms) => self.flatten_sequence(terms),
            TermKind::Group(operation) => {
                let grouped = self.group(operation);
                match grouped.kind() {
                    GroupKind::Addition => self.reduce(grouped),
                    GroupKind::Multiplication => self.reduce_multiplication(grouped),
                }
            }
            TermKind::Exponentiation { base, exponent } => {
                let base = self.transform(base);
                let exponent = self.transform(exponent);
                if let Some(value) = exponent.evaluate_constant() {
                    let integer = value as i32;
                    // Exact cast-and-compare; no epsilon.
                    if f64::from(integer) == value {
                        return self.transform(&expand_exponent(&base, integer));
                    }
                }
                Term::exponentiation(base, exponent)
            }
            TermKind::Squaring(base) => {
                let base = self.transform(base);
                self.rewrite_squaring(base)
            }
        }
    }

    /// Splices nested sequences flat and drops repeated children.
    fn flatten_sequence(&mut self, terms: &[TermRef]) -> TermRef {
        let mut flattened = Vec::new();
        let mut seen: Vec<TermId> = Vec::new();
        let mut push = |flattened: &mut Vec<TermRef>, term: TermRef| {
            let id = TermId::of(&term);
            if !seen.contains(&id) {
                seen.push(id);
                flattened.push(term);
            }
        };
        for term in terms {
            let transformed = self.transform(term);
            if let TermKind::Sequence(nested) = transformed.kind() {
                for term in nested {
                    push(&mut flattened, term.clone());
                }
            } else {
                push(&mut flattened, transformed);
            }
        }
        Term::sequence(flattened)
    }

    /// The grouping pass: folds constant children into the running constant
    /// and splices same-kind children, swapping signs for those spliced from
    /// the negative side.
    fn group(&mut self, operation: &GroupOperation) -> GroupOperation {
        let kind = operation.kind();
        let mut constant = operation.constant_value();
        let mut positive = Vec::new();
        let mut negative = Vec::new();
        for term in operation.positive() {
            let transformed = self.transform(term);
            if let Some(value) = transformed.as_constant() {
                constant = kind.apply(constant, value);
            } else if let Some(sibling) =
                transformed.as_group().filter(|group| group.kind() == kind)
            {
                constant = kind.apply(constant, sibling.constant_value());
                positive.extend_from_slice(sibling.positive());
                negative.extend_from_slice(sibling.negative());
            } else {
                positive.push(transformed);
            }
        }
        for term in operation.negative() {
            let transformed = self.transform(term);
            if let Some(value) = transformed.as_constant() {
                constant = kind.apply_inverse(constant, value);
            } else if let Some(sibling) =
                transformed.as_group().filter(|group| group.kind() == kind)
            {
                constant = kind.apply_inverse(constant, sibling.constant_value());
                positive.extend_from_slice(sibling.negative());
                negative.extend_from_slice(sibling.positive());
            } else {
                negative.push(transformed);
            }
        }
        let constant = self.transform(&Term::constant(constant));
        GroupOperation::new(kind, Some(constant), positive, negative)
    }

    /// Sign normalisation for multiplications, then reduction.
    ///
    /// A negative constant factor is pulled into a uniquely-held addition
    /// child when one exists: the addition's signs flip along with the
    /// constant's, canonicalising `-K·x·(a-b)` as `K·x·(b-a)`.
    fn reduce_multiplication(&mut self, operation: GroupOperation) -> TermRef {
        if operation.constant_value() < 0.0 {
            let invertible = |term: &TermRef| {
                matches!(term.kind(), TermKind::Group(group) if group.kind() == GroupKind::Addition)
                    && Rc::strong_count(term) == UNIQUELY_HELD
            };
            let candidate = operation
                .positive()
                .iter()
                .position(&invertible)
                .map(|index| (true, index))
                .or_else(|| {
                    operation
                        .negative()
                        .iter()
                        .position(&invertible)
                        .map(|index| (false, index))
                });
            if let Some((in_positive, index)) = candidate {
                let mut positive = operation.positive().to_vec();
                let mut negative = operation.negative().to_vec();
                let slot = if in_positive {
                    &mut positive[index]
                } else {
                    &mut negative[index]
                };
                let (sum_constant, sum_positive, sum_negative) = {
                    let sum = slot.as_group().expect("candidate is an addition");
                    (
                        sum.constant_value(),
                        sum.positive().to_vec(),
                        sum.negative().to_vec(),
                    )
                };
                let inverted_constant = self.transform(&Term::constant(-sum_constant));
                let inverse = Term::addition_with_constant(
                    Some(inverted_constant),
                    sum_negative,
                    sum_positive,
                );
                *slot = self.transform(&inverse);
                let negated = self.transform(&Term::constant(-operation.constant_value()));
                let rebuilt = GroupOperation::new(
                    GroupKind::Multiplication,
                    Some(negated),
                    positive,
                    negative,
                );
                return self.reduce_multiplication(rebuilt);
            }
        }
        self.reduce(operation)
    }

    /// The reduction pass over a grouped operation.
    fn reduce(&mut self, operation: GroupOperation) -> TermRef {
        let kind = operation.kind();
        if kind.null_element() == Some(operation.constant_value()) {
            return self.transform(&operation.constant().clone());
        }
        let mut weights: Vec<(TermRef, i32)> = Vec::new();
        let mut accumulate = |term: &TermRef, sign: i32| {
            if let Some(entry) = weights.iter_mut().find(|(t, _)| Rc::ptr_eq(t, term)) {
                entry.1 += sign;
            } else {
                weights.push((term.clone(), sign));
            }
        };
        for term in operation.positive() {
            accumulate(term, 1);
        }
        for term in operation.negative() {
            accumulate(term, -1);
        }
        weights.retain(|(_, weight)| *weight != 0);
        if weights.len() == 1
            && weights[0].1 == 1
            && operation.constant_value() == kind.identity()
        {
            return weights[0].0.clone();
        }
        let mut positive = Vec::new();
        let mut negative = Vec::new();
        let mut fused_any = false;
        for (term, weight) in &weights {
            let count = weight.unsigned_abs();
            let bucket = if *weight > 0 {
                &mut positive
            } else {
                &mut negative
            };
            if count > 1 {
                if let Some(fused) = fuse(kind, term, count) {
                    let fused = self.transform(&fused);
                    bucket.push(fused);
                    fused_any = true;
                    continue;
                }
            }
            for _ in 0..count {
                bucket.push(term.clone());
            }
        }
        if fused_any {
            // Fusion can collide with an existing entry or leave a
            // single-child shell; re-reducing restores the invariants.
            let rebuilt = GroupOperation::new(
                kind,
                Some(operation.constant().clone()),
                positive,
                negative,
            );
            return self.reduce(rebuilt);
        }
        sort_by_key(&mut positive);
        sort_by_key(&mut negative);
        Term::group(
            kind,
            GroupOperation::new(kind, Some(operation.constant().clone()), positive, negative),
        )
    }

    /// The trigonometric-identity hook for squared sines and cosines.
    fn rewrite_squaring(&mut self, base: TermRef) -> TermRef {
        if self.trig.is_some() {
            if let TermKind::UnaryFunction { function, argument } = base.kind() {
                let argument = argument.clone();
                if ptr::fn_addr_eq(*function, SIN) {
                    return self.squared_trig(base, argument, true);
                }
                if ptr::fn_addr_eq(*function, COS) {
                    return self.squared_trig(base, argument, false);
                }
            }
        }
        Term::squaring(base)
    }

    fn squared_trig(&mut self, base: TermRef, argument: TermRef, is_sine: bool) -> TermRef {
        let argument_id = TermId::of(&argument);
        let sibling_squared = {
            let cache = self.trig.as_ref().expect("trig pass is enabled");
            let sibling = if is_sine {
                &cache.squared_cosines
            } else {
                &cache.squared_sines
            };
            sibling.get(&argument_id).cloned()
        };
        if let Some(other_squared) = sibling_squared {
            let difference = Term::addition_with_constant(
                Some(Term::constant(1.0)),
                vec![],
                vec![other_squared],
            );
            return self.transform(&difference);
        }
        let squared = self.coalesce(Term::squaring(base));
        let cache = self.trig.as_mut().expect("trig pass is enabled");
        let own = if is_sine {
            &mut cache.squared_sines
        } else {
            &mut cache.squared_cosines
        };
        own.insert(argument_id, squared.clone());
        squared
    }
}

/// Strong count of a term held only by its parent's child list plus the
/// pipeline memo table. Such a term has no other owner in the graph, so it is
/// safe to invert in place of sharing.
const UNIQUELY_HELD: usize = 2;

/// Fuses `count` identical children into a single term: repeated addends
/// become a multiplication by `count`, repeated factors a power.
fn fuse(kind: GroupKind, term: &TermRef, count: u32) -> Option<TermRef> {
    match kind {
        GroupKind::Addition => Some(Term::multiplication_with_constant(
            Some(Term::constant(Real::from(count))),
            vec![term.clone()],
            vec![],
        )),
        GroupKind::Multiplication => Some(Term::exponentiation(
            term.clone(),
            Term::constant(Real::from(count)),
        )),
    }
}

/// Expands an integer power into a product of a squaring chain: the binary
/// decomposition of `|n|` selects which repeated squares to keep, and a
/// negative exponent routes them through the negative (division) list.
fn expand_exponent(base: &TermRef, exponent: i32) -> TermRef {
    let mut positive = Vec::new();
    let mut negative = Vec::new();
    let mut current = base.clone();
    let mut bits = exponent.unsigned_abs();
    while bits > 0 {
        if bits & 1 == 1 {
            if exponent > 0 {
                positive.push(current.clone());
            } else {
                negative.push(current.clone());
            }
        }
        bits >>= 1;
        if bits > 0 {
            current = Term::squaring(current);
        }
    }
    Term::multiplication(positive, negative)
}

/// Sorts a child bucket for stable output: shorter keys first, then
/// lexicographic.
fn sort_by_key(terms: &mut [TermRef]) {
    terms.sort_by(|a, b| {
        a.key()
            .len()
            .cmp(&b.key().len())
            .then_with(|| a.key().cmp(b.key()))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(term: &TermRef) -> TermRef {
        Pipeline::new().run(term)
    }

    #[test]
    fn pure_constant_trees_fold_to_constants() {
        // (1 + 2) * 4
        let sum = Term::addition(vec![Term::constant(1.0), Term::constant(2.0)], vec![]);
        let product = Term::multiplication(vec![sum, Term::constant(4.0)], vec![]);
        let result = transform(&product);
        assert_eq!(result.as_constant(), Some(12.0));
    }

    #[test]
    fn additive_identity_collapses_to_the_term() {
        let x = Term::input("x");
        let sum = Term::addition(vec![x.clone(), Term::constant(0.0)], vec![]);
        let result = transform(&sum);
        assert!(Rc::ptr_eq(&result, &x));
    }

    #[test]
    fn self_cancellation_folds_to_zero() {
        let x = Term::input("x");
        let difference = Term::addition(vec![x.clone()], vec![x]);
        let result = transform(&difference);
        assert_eq!(result.as_constant(), Some(0.0));
    }

    #[test]
    fn zero_constant_absorbs_a_multiplication() {
        let x = Term::input("x");
        let product =
            Term::multiplication_with_constant(Some(Term::constant(0.0)), vec![x], vec![]);
        assert_eq!(transform(&product).as_constant(), Some(0.0));
    }

    #[test]
    fn repeated_factors_fuse_into_squarings() {
        let x = Term::input("x");
        let product = Term::multiplication(vec![x.clone(), x.clone()], vec![]);
        let result = transform(&product);
        match result.kind() {
            TermKind::Squaring(base) => assert!(Rc::ptr_eq(base, &x)),
            other => panic!("expected a squaring, got {other:?}"),
        }
    }

    #[test]
    fn fourth_power_becomes_a_squaring_chain() {
        let x = Term::input("x");
        let power = Term::exponentiation(x.clone(), Term::constant(4.0));
        let result = transform(&power);
        assert_eq!(result.key(), "((x)^2)^2");
    }

    #[test]
    fn fractional_exponents_are_left_alone() {
        let x = Term::input("x");
        let power = Term::exponentiation(x, Term::constant(2.5));
        let result = transform(&power);
        assert!(matches!(result.kind(), TermKind::Exponentiation { .. }));
    }

    #[test]
    fn negative_exponents_divide() {
        let x = Term::input("x");
        let power = Term::exponentiation(x, Term::constant(-2.0));
        let result = transform(&power);
        let operation = result.as_group().expect("a multiplication");
        assert_eq!(operation.kind(), GroupKind::Multiplication);
        assert!(operation.positive().is_empty());
        assert_eq!(operation.negative().len(), 1);
        assert_eq!(operation.negative()[0].key(), "(x)^2");
    }

    #[test]
    fn structurally_equal_subtrees_merge() {
        let make_sum = || {
            Term::addition(
                vec![Term::input("a"), Term::input("b")],
                vec![],
            )
        };
        let product = Term::multiplication(vec![make_sum()], vec![make_sum()]);
        let result = transform(&product);
        // a+b over a+b cancels entirely once both sides share one instance.
        assert_eq!(result.as_constant(), Some(1.0));
    }

    #[test]
    fn grouped_constants_cancel_across_nesting() {
        // (x + 2) - (x - (1 + 3)) == 6
        let x = Term::input("x");
        let left = Term::addition(vec![x.clone(), Term::constant(2.0)], vec![]);
        let inner = Term::addition(vec![Term::constant(1.0), Term::constant(3.0)], vec![]);
        let right = Term::addition(vec![x], vec![inner]);
        let difference = Term::addition(vec![left], vec![right]);
        assert_eq!(transform(&difference).as_constant(), Some(6.0));
    }

    #[test]
    fn negative_constants_invert_uniquely_held_additions() {
        // -2 * (a - b)  ->  2 * (b - a)
        let difference = Term::addition(vec![Term::input("a")], vec![Term::input("b")]);
        let product = Term::multiplication_with_constant(
            Some(Term::constant(-2.0)),
            vec![difference],
            vec![],
        );
        let result = transform(&product);
        assert_eq!(result.key(), "2*(0+(b)-(a))");
    }

    #[test]
    fn reduction_buckets_are_sorted_by_key() {
        let long = Term::unary_function(Real::sqrt, Term::input("a"));
        let short = Term::input("z");
        let sum = Term::addition(vec![long, short], vec![]);
        let result = transform(&sum);
        let operation = result.as_group().unwrap();
        assert_eq!(operation.positive()[0].key(), "z");
    }

    #[test]
    fn memoisation_returns_the_same_result_for_the_same_input() {
        let x = Term::input("x");
        let sum = Term::addition(vec![x.clone(), x], vec![]);
        let mut pipeline = Pipeline::new();
        let first = pipeline.run(&sum);
        let second = pipeline.run(&sum);
        assert!(Rc::ptr_eq(&first, &second));
    }

    #[test]
    fn merge_is_idempotent_and_keys_are_unique() {
        use std::collections::HashMap;
        let a = Term::input("a");
        let sum1 = Term::addition(vec![a.clone(), Term::input("b")], vec![]);
        let sum2 = Term::addition(vec![Term::input("b"), a], vec![]);
        let root = Term::sequence(vec![
            Term::output("u", sum1),
            Term::output("v", sum2),
        ]);
        let mut pipeline = Pipeline::new();
        let once = pipeline.run(&root);
        let twice = pipeline.run(&once);
        assert!(Rc::ptr_eq(&once, &twice));

        // No two distinct terms in the merged graph share a key.
        let mut by_key: HashMap<String, TermRef> = HashMap::new();
        fn walk(term: &TermRef, by_key: &mut HashMap<String, TermRef>) {
            if let Some(existing) = by_key.get(term.key()) {
                assert!(Rc::ptr_eq(existing, term));
            } else {
                by_key.insert(term.key().to_string(), term.clone());
            }
            match term.kind() {
                TermKind::Sequence(terms) => terms.iter().for_each(|t| walk(t, by_key)),
                TermKind::Output { term, .. } => walk(term, by_key),
                TermKind::UnaryFunction { argument, .. } => walk(argument, by_key),
                TermKind::Group(op) => {
                    op.positive().iter().for_each(|t| walk(t, by_key));
                    op.negative().iter().for_each(|t| walk(t, by_key));
                }
                TermKind::Exponentiation { base, exponent } => {
                    walk(base, by_key);
                    walk(exponent, by_key);
                }
                TermKind::Squaring(base) => walk(base, by_key),
                _ => {}
            }
        }
        walk(&once, &mut by_key);

        // Both outputs now share one addition instance.
        if let TermKind::Sequence(outputs) = once.kind() {
            let children: Vec<_> = outputs
                .iter()
                .map(|output| match output.kind() {
                    TermKind::Output { term, .. } => term.clone(),
                    _ => panic!("expected outputs"),
                })
                .collect();
            assert!(Rc::ptr_eq(&children[0], &children[1]));
        } else {
            panic!("expected a sequence root");
        }
    }

    #[test]
    fn nested_sequences_flatten_and_deduplicate() {
        let x = Term::input("x");
        let first = Term::output("y", x.clone());
        let second = Term::output("z", x);
        let inner = Term::sequence(vec![first.clone(), second]);
        let root = Term::sequence(vec![inner, first]);
        let result = transform(&root);
        match result.kind() {
            TermKind::Sequence(terms) => assert_eq!(terms.len(), 2),
            other => panic!("expected a sequence, got {other:?}"),
        }
    }

    #[test]
    fn renaming_rewrites_inputs_and_outputs() {
        let renames: HashMap<String, String> =
            [("x".to_string(), "u".to_string())].into_iter().collect();
        let root = Term::output("x", Term::input("x"));
        let result = Pipeline::new().with_renames(renames).run(&root);
        match result.kind() {
            TermKind::Output { name, term } => {
                assert_eq!(name, "u");
                assert!(matches!(term.kind(), TermKind::Input(n) if n == "u"));
            }
            other => panic!("expected an output, got {other:?}"),
        }
    }

    #[test]
    fn squared_sine_and_cosine_of_one_argument_fold_to_one() {
        let x = Term::input("x");
        let sine = Term::squaring(Term::unary_function(SIN, x.clone()));
        let cosine = Term::squaring(Term::unary_function(COS, x));
        let sum = Term::addition(vec![sine, cosine], vec![]);
        let result = Pipeline::new().with_trigonometric_identities().run(&sum);
        assert_eq!(result.as_constant(), Some(1.0));
    }

    #[test]
    fn trig_identity_leaves_single_squares_alone() {
        let x = Term::input("x");
        let sine = Term::squaring(Term::unary_function(SIN, x));
        let result = Pipeline::new().with_trigonometric_identities().run(&sine);
        assert!(matches!(result.kind(), TermKind::Squaring(_)));
    }
}
