//! Answers and their provenance.
//!
//! A [`ConceptMap`] binds pattern variables to concepts. Equality and
//! hashing cover the **bindings only**: two derivations of the same binding
//! are one answer as far as deduplication and the fixpoint's "no new
//! answers" check are concerned, whatever their explanations say.
//!
//! The [`Explanation`] tree records how a binding came to be: a base-fact
//! lookup, a join of partial answers, or a rule application holding the
//! rule label, the head unifier that was applied and the inner answers the
//! body consumed. Joining two answers *unions* their child sets; it never
//! overwrites one side's provenance with the other's.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use syllog_kb::{ThingId, Value};

use crate::pattern::Var;

/// What a variable can be bound to.
///
/// `Value` bindings arise from rule conclusions whose attribute value has no
/// stored canonical instance yet; materialization turns them into things.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concept {
    Thing(ThingId),
    Value(Value),
}

impl Concept {
    pub fn thing(&self) -> Option<ThingId> {
        match self {
            Concept::Thing(id) => Some(*id),
            Concept::Value(_) => None,
        }
    }
}

impl std::fmt::Display for Concept {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Concept::Thing(id) => write!(f, "{id}"),
            Concept::Value(v) => write!(f, "{v}"),
        }
    }
}

/// Provenance of an answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Explanation {
    /// A base fact read from storage.
    Lookup,
    /// Produced by joining the inner answers.
    Join { inner: Vec<ConceptMap> },
    /// Concluded by a rule from the inner (body) answers.
    Rule {
        rule: String,
        /// Head-variable to goal-variable pairs of the unifier applied.
        unifier: Vec<(Var, Var)>,
        inner: Vec<ConceptMap>,
    },
}

impl Explanation {
    pub fn is_lookup(&self) -> bool {
        matches!(self, Explanation::Lookup)
    }

    pub fn inner(&self) -> &[ConceptMap] {
        match self {
            Explanation::Lookup => &[],
            Explanation::Join { inner } | Explanation::Rule { inner, .. } => inner,
        }
    }
}

/// An immutable variable-to-concept binding with provenance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConceptMap {
    map: BTreeMap<Var, Concept>,
    explanation: Explanation,
}

impl ConceptMap {
    pub fn empty() -> Self {
        Self {
            map: BTreeMap::new(),
            explanation: Explanation::Lookup,
        }
    }

    pub fn from_bindings(
        bindings: impl IntoIterator<Item = (Var, Concept)>,
        explanation: Explanation,
    ) -> Self {
        Self {
            map: bindings.into_iter().collect(),
            explanation,
        }
    }

    pub fn get(&self, var: &Var) -> Option<&Concept> {
        self.map.get(var)
    }

    pub fn contains(&self, var: &Var) -> bool {
        self.map.contains_key(var)
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Var, &Concept)> {
        self.map.iter()
    }

    pub fn explanation(&self) -> &Explanation {
        &self.explanation
    }

    pub fn with_explanation(mut self, explanation: Explanation) -> Self {
        self.explanation = explanation;
        self
    }

    /// Add one binding. An existing disagreeing binding wins `None`.
    pub fn bind(&self, var: Var, concept: Concept) -> Option<ConceptMap> {
        match self.map.get(&var) {
            Some(existing) if *existing != concept => None,
            _ => {
                let mut out = self.clone();
                out.map.insert(var, concept);
                Some(out)
            }
        }
    }

    /// Keep only the given variables. Provenance is retained.
    pub fn project(&self, vars: &std::collections::BTreeSet<Var>) -> ConceptMap {
        ConceptMap {
            map: self
                .map
                .iter()
                .filter(|(v, _)| vars.contains(*v))
                .map(|(v, c)| (v.clone(), c.clone()))
                .collect(),
            explanation: self.explanation.clone(),
        }
    }

    /// Merge two answers. Shared variables must agree on their concepts;
    /// explanations are unioned into a join node.
    pub fn merge(&self, other: &ConceptMap) -> Option<ConceptMap> {
        for (var, concept) in &other.map {
            if let Some(existing) = self.map.get(var) {
                if existing != concept {
                    return None;
                }
            }
        }

        if self.map.is_empty() {
            return Some(other.clone());
        }
        if other.map.is_empty() {
            return Some(self.clone());
        }

        let mut map = self.map.clone();
        map.extend(other.map.iter().map(|(v, c)| (v.clone(), c.clone())));

        let mut inner: Vec<ConceptMap> = Vec::new();
        for side in [self, other] {
            match side.explanation() {
                Explanation::Join { inner: children } => {
                    for child in children {
                        if !inner.iter().any(|c| c == child) {
                            inner.push(child.clone());
                        }
                    }
                }
                _ => {
                    if !inner.iter().any(|c| c == side) {
                        inner.push(side.clone());
                    }
                }
            }
        }

        Some(ConceptMap {
            map,
            explanation: Explanation::Join { inner },
        })
    }
}

impl PartialEq for ConceptMap {
    fn eq(&self, other: &Self) -> bool {
        self.map == other.map
    }
}

impl Eq for ConceptMap {}

impl std::hash::Hash for ConceptMap {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.map.hash(state);
    }
}

impl std::fmt::Display for ConceptMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (var, concept)) in self.map.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{var} -> {concept}")?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn binding(pairs: &[(&str, u32)]) -> ConceptMap {
        ConceptMap::from_bindings(
            pairs
                .iter()
                .map(|(v, id)| (Var::named(*v), Concept::Thing(ThingId::new(*id)))),
            Explanation::Lookup,
        )
    }

    #[test]
    fn merge_requires_agreement_on_shared_variables() {
        let a = binding(&[("x", 1), ("y", 2)]);
        let b = binding(&[("y", 2), ("z", 3)]);
        let c = binding(&[("y", 9)]);

        let merged = a.merge(&b).unwrap();
        assert_eq!(merged.len(), 3);
        assert!(a.merge(&c).is_none());
    }

    #[test]
    fn merge_unions_explanation_children() {
        let a = binding(&[("x", 1)]);
        let b = binding(&[("y", 2)]);
        let ab = a.merge(&b).unwrap();
        assert_eq!(ab.explanation().inner().len(), 2);

        // Joining an already-joined answer extends, rather than nests.
        let c = binding(&[("z", 3)]);
        let abc = ab.merge(&c).unwrap();
        assert_eq!(abc.explanation().inner().len(), 3);
    }

    #[test]
    fn equality_ignores_explanations() {
        let a = binding(&[("x", 1)]);
        let b = a.clone().with_explanation(Explanation::Rule {
            rule: "r".into(),
            unifier: vec![],
            inner: vec![],
        });
        assert_eq!(a, b);
    }

    #[test]
    fn projection_keeps_provenance() {
        let a = binding(&[("x", 1), ("y", 2)]);
        let vars: BTreeSet<Var> = [Var::named("x")].into_iter().collect();
        let p = a.project(&vars);
        assert_eq!(p.len(), 1);
        assert!(p.explanation().is_lookup());
    }
}
