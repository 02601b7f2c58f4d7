//! Inference rules and the applicability index.
//!
//! A [`Rule`] concludes its head atom for every answer of its body query.
//! Validation happens once, at construction: the head must be a selectable
//! atom and every head variable that carries data (players, owner, value)
//! must be bound by the body. The relation/attribute instance variable of
//! the head is exempt — it names the *derived* thing.
//!
//! [`RuleIndex::applicable`] returns the rules whose head can produce a
//! goal atom, in resolution-priority order: fewer-premise bodies first,
//! label as the deterministic tie-break.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use syllog_kb::TypeIndex;

use crate::error::ConstructionError;
use crate::pattern::{Atom, HasValue, Query, Var};
use crate::unify::{unify_atoms, MultiUnifier};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    label: String,
    when: Query,
    then: Atom,
}

impl Rule {
    pub fn new(label: impl Into<String>, when: Query, then: Atom) -> Result<Self, ConstructionError> {
        let label = label.into();
        if when.is_empty() {
            return Err(ConstructionError::EmptyRuleBody { rule: label });
        }
        if !then.is_selectable() {
            return Err(ConstructionError::NonSelectableRuleHead {
                rule: label,
                head: then.to_string(),
            });
        }

        let body_vars = when.variables();
        for var in head_data_vars(&then) {
            if !body_vars.contains(&var) {
                return Err(ConstructionError::UnboundHeadVariable {
                    rule: label,
                    var: var.name().to_string(),
                });
            }
        }

        Ok(Self { label, when, then })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn when(&self) -> &Query {
        &self.when
    }

    pub fn then(&self) -> &Atom {
        &self.then
    }
}

/// Head variables that must be bound by the body. The head's own instance
/// variable (relation var, or a has head's attribute var when the value is
/// constant) is produced, not consumed.
fn head_data_vars(head: &Atom) -> BTreeSet<Var> {
    match head {
        Atom::Isa(a) => [a.thing.clone()].into_iter().collect(),
        Atom::Relation(a) => a.players.iter().map(|p| p.player.clone()).collect(),
        Atom::Has(a) => {
            let mut out: BTreeSet<Var> = [a.owner.clone()].into_iter().collect();
            if let HasValue::Var(v) = &a.value {
                out.insert(v.clone());
            }
            out
        }
        _ => BTreeSet::new(),
    }
}

/// All rules, sorted by resolution priority.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleIndex {
    rules: Vec<Rule>,
}

impl RuleIndex {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(mut rules: Vec<Rule>) -> Result<Self, ConstructionError> {
        let mut labels: BTreeSet<&str> = BTreeSet::new();
        for rule in &rules {
            if !labels.insert(rule.label()) {
                return Err(ConstructionError::DuplicateRuleLabel(
                    rule.label().to_string(),
                ));
            }
        }
        // Fewer premises resolve first; labels break ties deterministically.
        rules.sort_by(|a, b| {
            (a.when.atoms().len(), a.label.as_str()).cmp(&(b.when.atoms().len(), b.label.as_str()))
        });
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter()
    }

    pub fn by_label(&self, label: &str) -> Option<&Rule> {
        self.rules.iter().find(|r| r.label == label)
    }

    /// Rules able to produce `goal`, with their head unifiers, in priority
    /// order.
    pub fn applicable(&self, goal: &Atom, schema: &TypeIndex) -> Vec<(&Rule, MultiUnifier)> {
        self.rules
            .iter()
            .filter_map(|rule| {
                let mu = unify_atoms(&rule.then, goal, schema);
                (!mu.is_empty()).then_some((rule, mu))
            })
            .collect()
    }

    /// Whether any rule head can produce this atom.
    pub fn resolvable(&self, atom: &Atom, schema: &TypeIndex) -> bool {
        atom.is_selectable()
            && self
                .rules
                .iter()
                .any(|rule| !unify_atoms(&rule.then, atom, schema).is_empty())
    }
}
