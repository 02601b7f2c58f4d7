//! Resolution planner: orders a compound query into atomic steps.
//!
//! The cost model is a handful of weighted signals per selectable atom;
//! planning then greedily takes the best-priority atom **adjacent** to the
//! already-bound variable set, so joins stay connected whenever the query
//! allows it. When nothing adjacent remains the query has decomposed into
//! independent components and the best disconnected atom is taken instead —
//! a degraded but never fatal situation.
//!
//! Step construction groups consecutive non-rule-resolvable atoms into one
//! retrievable batch; every rule-resolvable atom opens its own concludable
//! step. Id and constant-value predicates are attached to **every** step
//! using their variable (they prune wherever they apply); `!=` atoms and
//! variable-to-variable comparisons become post-join filters since their
//! operands may be bound on either side of a join.
//!
//! Identical input yields an identical plan: every choice ties-breaks on
//! atom insertion order.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use syllog_kb::TypeIndex;

use crate::error::ConstructionError;
use crate::pattern::{Atom, AtomicQuery, Query, ValueOperand, Var};
use crate::rule::RuleIndex;
use crate::unify::{atom_hash, Equivalence};

/// Weight per id-substituted variable of the atom.
const W_SUBSTITUTED: i32 = 8;
/// Weight for being a relation atom.
const W_RELATION: i32 = 2;
/// Penalty for a fully generic type atom (untyped relation, meta type).
const W_GENERIC_TYPE: i32 = -10;
/// Penalty for carrying a variable (non-constant) comparison; these must
/// resolve last.
const W_VAR_PREDICATE: i32 = -10;
/// Weight per specific (constant) value predicate on the atom's variables.
const W_SPECIFIC_VALUE: i32 = 3;
/// Penalty when an equivalent atom occurs elsewhere in the same query.
const W_RECURSIVE: i32 = -5;

/// Names treated as fully generic when they appear in an isa atom.
const META_TYPES: [&str; 4] = ["thing", "entity", "relation", "attribute"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Lookup-only: no rule can produce any of its atoms.
    Retrievable,
    /// A single rule-resolvable atom plus constraints.
    Concludable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub query: Query,
    pub kind: StepKind,
}

impl PlanStep {
    pub fn variables(&self) -> BTreeSet<Var> {
        self.query.variables()
    }

    /// The atomic view of a concludable step.
    pub fn atomic(&self) -> Result<AtomicQuery, ConstructionError> {
        AtomicQuery::try_new(self.query.clone())
    }
}

/// An ordered decomposition of a compound query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolutionPlan {
    pub steps: Vec<PlanStep>,
    /// Applied after the full join: `!=` atoms and variable comparisons.
    pub post_filters: Vec<Atom>,
}

/// Decompose `query` into an ordered list of atomic steps.
pub fn plan(
    query: &Query,
    rules: &RuleIndex,
    schema: &TypeIndex,
) -> Result<ResolutionPlan, ConstructionError> {
    let atoms = query.atoms();

    let mut selectable: Vec<usize> = Vec::new();
    let mut attachable: Vec<usize> = Vec::new();
    let mut post: Vec<usize> = Vec::new();
    for (i, atom) in atoms.iter().enumerate() {
        match atom {
            _ if atom.is_selectable() => selectable.push(i),
            Atom::Id(_) => attachable.push(i),
            Atom::Value(v) => match v.rhs {
                ValueOperand::Const(_) => attachable.push(i),
                ValueOperand::Var(_) => post.push(i),
            },
            Atom::Neq(_) => post.push(i),
            _ => {}
        }
    }

    if selectable.is_empty() {
        return Err(ConstructionError::NoSelectableAtom {
            query: query.to_string(),
        });
    }

    let id_vars: BTreeSet<Var> = query.id_constraints().into_keys().collect();
    let priorities: Vec<i32> = selectable
        .iter()
        .map(|&i| atom_priority(atoms, i, &id_vars, &post))
        .collect();

    // Greedy adjacency expansion over the selectable atoms.
    let mut ordered: Vec<usize> = Vec::new();
    let mut bound: BTreeSet<Var> = id_vars;
    let mut remaining: Vec<usize> = (0..selectable.len()).collect();
    while !remaining.is_empty() {
        let adjacent: Vec<usize> = remaining
            .iter()
            .copied()
            .filter(|&k| {
                atoms[selectable[k]]
                    .variables()
                    .iter()
                    .any(|v| bound.contains(*v))
            })
            .collect();
        let pool = if adjacent.is_empty() {
            if !ordered.is_empty() {
                tracing::debug!(
                    "query decomposes into independent components: {query}"
                );
            }
            remaining.clone()
        } else {
            adjacent
        };
        let pick = pool
            .into_iter()
            .max_by_key(|&k| (priorities[k], Reverse(selectable[k])))
            .expect("pool is non-empty");
        remaining.retain(|&k| k != pick);
        let idx = selectable[pick];
        bound.extend(atoms[idx].variables().into_iter().cloned());
        ordered.push(idx);
    }

    // Fold the ordering into steps, batching consecutive retrievables.
    let mut groups: Vec<(StepKind, Vec<usize>)> = Vec::new();
    for idx in ordered {
        let resolvable = rules.resolvable(&atoms[idx], schema);
        if resolvable {
            groups.push((StepKind::Concludable, vec![idx]));
        } else {
            match groups.last_mut() {
                Some((StepKind::Retrievable, batch)) => batch.push(idx),
                _ => groups.push((StepKind::Retrievable, vec![idx])),
            }
        }
    }

    let mut steps = Vec::with_capacity(groups.len());
    for (kind, members) in groups {
        let step_vars: BTreeSet<Var> = members
            .iter()
            .flat_map(|&i| atoms[i].variables())
            .cloned()
            .collect();
        let mut step_atoms: Vec<Atom> = members.iter().map(|&i| atoms[i].clone()).collect();
        for &c in &attachable {
            let uses_step_var = atoms[c].variables().iter().all(|v| step_vars.contains(*v));
            if uses_step_var {
                step_atoms.push(atoms[c].clone());
            }
        }
        let step_query = Query::new(step_atoms);
        if kind == StepKind::Concludable {
            // One selectable atom by construction; anything else is a
            // decomposition bug and must fail loudly.
            AtomicQuery::try_new(step_query.clone())?;
        }
        steps.push(PlanStep {
            query: step_query,
            kind,
        });
    }

    // Constraints whose variable no selectable atom binds degrade to
    // post-join filters; an unbound operand rejects the answer there.
    let step_var_union: BTreeSet<Var> = steps.iter().flat_map(|s| s.variables()).collect();
    let mut post_filters: Vec<Atom> = post.iter().map(|&i| atoms[i].clone()).collect();
    for &c in &attachable {
        if !atoms[c].variables().iter().all(|v| step_var_union.contains(*v)) {
            post_filters.push(atoms[c].clone());
        }
    }

    Ok(ResolutionPlan {
        steps,
        post_filters,
    })
}

fn atom_priority(atoms: &[Atom], idx: usize, id_vars: &BTreeSet<Var>, post: &[usize]) -> i32 {
    let atom = &atoms[idx];
    let vars: BTreeSet<&Var> = atom.variables().into_iter().collect();
    let mut priority = 0;

    priority += W_SUBSTITUTED * vars.iter().filter(|v| id_vars.contains(**v)).count() as i32;

    match atom {
        Atom::Relation(rel) => {
            priority += W_RELATION;
            if rel.type_name.is_none() {
                priority += W_GENERIC_TYPE;
            }
        }
        Atom::Isa(isa) => {
            if META_TYPES.contains(&isa.type_name.as_str()) {
                priority += W_GENERIC_TYPE;
            }
        }
        Atom::Has(has) => {
            if matches!(has.value, crate::pattern::HasValue::Const(_)) {
                priority += W_SPECIFIC_VALUE;
            }
        }
        _ => {}
    }

    for other in atoms.iter().enumerate().filter(|(j, _)| *j != idx) {
        if let Atom::Value(v) = other.1 {
            if matches!(v.rhs, ValueOperand::Const(_)) && vars.contains(&v.var) {
                priority += W_SPECIFIC_VALUE;
            }
        }
    }

    // Variable comparisons force the atom late.
    let in_var_predicate = post.iter().any(|&j| match &atoms[j] {
        Atom::Value(v) => {
            vars.contains(&v.var)
                || matches!(&v.rhs, ValueOperand::Var(rv) if vars.contains(rv))
        }
        _ => false,
    });
    if in_var_predicate {
        priority += W_VAR_PREDICATE;
    }

    // Prefer resolving one of several equivalent atoms once.
    let recursive = atoms.iter().enumerate().any(|(j, other)| {
        j != idx
            && other.is_selectable()
            && atom_hash(other, Equivalence::Structural) == atom_hash(atom, Equivalence::Structural)
    });
    if recursive {
        priority += W_RECURSIVE;
    }

    priority
}
