//! Materialization: writing rule-derived answers back as concrete facts.
//!
//! Given fully-resolved answers, the materializer walks their explanation
//! trees (explicit stack, innermost conclusions processed too) and
//! re-derives concrete graph elements for every `Rule` node:
//!
//! - a relation head inserts one relation instance per schema-valid
//!   role assignment — explicit roles are kept, unassigned players
//!   enumerate the relation type's declared role set;
//! - a `has` head inserts the canonical attribute instance and the
//!   ownership edge;
//! - an `isa` head re-types nothing: a thing's type is fixed at insert, so
//!   there is no fact to write.
//!
//! Every insert is idempotent: relation instances are looked up first,
//! attribute instances are canonical per value, ownership edges dedupe in
//! the store. Only genuinely new things are reported.

use syllog_kb::ThingId;

use crate::answer::{Concept, ConceptMap, Explanation};
use crate::error::ResolutionError;
use crate::pattern::{Atom, HasValue, RelationAtom};
use crate::rule::RuleIndex;
use crate::store::{GraphStoreMut, StoreError};
use crate::unify::Unifier;

pub struct Materializer<'a> {
    rules: &'a RuleIndex,
}

impl<'a> Materializer<'a> {
    pub fn new(rules: &'a RuleIndex) -> Self {
        Self { rules }
    }

    /// Persist every rule conclusion reachable from `answers`. Returns the
    /// things that were actually created.
    pub fn materialize<S: GraphStoreMut + ?Sized>(
        &self,
        store: &mut S,
        answers: &[ConceptMap],
    ) -> Result<Vec<ThingId>, ResolutionError> {
        let mut created = Vec::new();
        let mut stack: Vec<ConceptMap> = answers.to_vec();

        while let Some(answer) = stack.pop() {
            for inner in answer.explanation().inner() {
                stack.push(inner.clone());
            }
            let Explanation::Rule { rule, unifier, .. } = answer.explanation() else {
                continue;
            };
            let Some(rule_decl) = self.rules.by_label(rule) else {
                tracing::warn!("skipping materialization of unknown rule `{rule}`");
                continue;
            };
            let head_to_answer = Unifier::from_pairs(unifier.iter().cloned());
            self.persist_head(store, rule, rule_decl.then(), &head_to_answer, &answer)
                .map_err(|source| ResolutionError::Materialization {
                    rule: rule.clone(),
                    source,
                })?
                .into_iter()
                .for_each(|id| created.push(id));
        }

        created.sort();
        created.dedup();
        Ok(created)
    }

    fn persist_head<S: GraphStoreMut + ?Sized>(
        &self,
        store: &mut S,
        rule: &str,
        head: &Atom,
        head_to_answer: &Unifier,
        answer: &ConceptMap,
    ) -> Result<Vec<ThingId>, StoreError> {
        match head {
            Atom::Relation(rel) => self.persist_relation(store, rule, rel, head_to_answer, answer),
            Atom::Has(has) => {
                let owner_var = head_to_answer.apply_var(&has.owner);
                let Some(Concept::Thing(owner)) = answer.get(&owner_var) else {
                    return Ok(Vec::new());
                };
                let value = match &has.value {
                    HasValue::Const(v) => Some(v.clone()),
                    HasValue::Var(v) => {
                        let value_var = head_to_answer.apply_var(v);
                        match answer.get(&value_var) {
                            Some(Concept::Value(v)) => Some(v.clone()),
                            Some(Concept::Thing(id)) => store.attribute_value(*id)?,
                            None => None,
                        }
                    }
                };
                let Some(value) = value else {
                    return Ok(Vec::new());
                };

                let existing = store.attribute_by_value(&has.attribute_type, &value)?;
                let attr = match existing {
                    Some(attr) => attr,
                    None => store.insert_attribute(&has.attribute_type, value)?,
                };
                store.insert_has(*owner, attr)?;
                Ok(if existing.is_none() { vec![attr] } else { Vec::new() })
            }
            // A thing's type is fixed at insert time; isa conclusions stay
            // virtual.
            Atom::Isa(_) => Ok(Vec::new()),
            _ => Ok(Vec::new()),
        }
    }

    fn persist_relation<S: GraphStoreMut + ?Sized>(
        &self,
        store: &mut S,
        rule: &str,
        rel: &RelationAtom,
        head_to_answer: &Unifier,
        answer: &ConceptMap,
    ) -> Result<Vec<ThingId>, StoreError> {
        let Some(type_name) = rel.type_name.as_deref() else {
            tracing::warn!("rule `{rule}` concludes an untyped relation; nothing to insert");
            return Ok(Vec::new());
        };

        // Fixed pairs from explicitly-assigned roles; open slots collect the
        // players whose role the pattern leaves unassigned.
        let mut fixed: Vec<(String, ThingId)> = Vec::new();
        let mut open: Vec<ThingId> = Vec::new();
        for p in &rel.players {
            let player_var = head_to_answer.apply_var(&p.player);
            let Some(Concept::Thing(player)) = answer.get(&player_var) else {
                // An unbound or value-bound player cannot be a role player.
                return Ok(Vec::new());
            };
            match &p.role {
                Some(role) => fixed.push((role.clone(), *player)),
                None => open.push(*player),
            }
        }

        let declared = store.schema().roles_of(type_name)?;
        let mut assignments: Vec<Vec<(String, ThingId)>> = vec![fixed];
        for player in open {
            let mut next = Vec::new();
            for base in &assignments {
                for role in &declared {
                    let mut candidate = base.clone();
                    candidate.push((role.clone(), player));
                    next.push(candidate);
                }
            }
            assignments = next;
        }

        let mut created = Vec::new();
        for pairs in assignments {
            if pairs.is_empty() {
                continue;
            }
            if store.relation_exists(type_name, &pairs)? {
                continue;
            }
            created.push(store.insert_relation(type_name, &pairs)?);
        }
        Ok(created)
    }
}
