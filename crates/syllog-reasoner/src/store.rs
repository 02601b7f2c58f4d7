//! Storage seam and base-fact retrieval.
//!
//! The resolver consumes storage through [`GraphStore`]: primitive,
//! deterministic scans plus the schema handle. [`syllog_kb::KnowledgeGraph`]
//! is the in-memory implementation; tests substitute failing stores to
//! exercise error scoping.
//!
//! [`retrieve`] answers one plan step directly from storage: id predicates
//! bind first, selectable atoms expand candidates in plan order, value
//! predicates filter once their operands are bound. Every produced answer
//! carries a `Lookup` explanation.

use ahash::AHashSet;
use thiserror::Error;

use syllog_kb::{KnowledgeGraph, SchemaError, ThingId, TypeIndex, Value};

use crate::answer::{Concept, ConceptMap, Explanation};
use crate::pattern::{
    Atom, HasValue, Query, RelationAtom, ValueOperand, Var,
};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// Read surface the resolver needs from a knowledge base.
///
/// `things_of_type` and friends always include subtypes; direct-type-only
/// scans are not something resolution ever wants.
pub trait GraphStore {
    fn schema(&self) -> &TypeIndex;

    fn contains(&self, thing: ThingId) -> Result<bool, StoreError>;
    fn type_of(&self, thing: ThingId) -> Result<Option<String>, StoreError>;
    fn things_of_type(&self, type_name: &str) -> Result<Vec<ThingId>, StoreError>;

    fn attribute_value(&self, thing: ThingId) -> Result<Option<Value>, StoreError>;
    fn attribute_by_value(
        &self,
        type_name: &str,
        value: &Value,
    ) -> Result<Option<ThingId>, StoreError>;
    fn attributes_of(&self, owner: ThingId, type_name: &str) -> Result<Vec<ThingId>, StoreError>;
    fn owners_of(&self, attribute: ThingId) -> Result<Vec<ThingId>, StoreError>;

    fn relations_of_type(&self, type_name: &str) -> Result<Vec<ThingId>, StoreError>;
    fn players(&self, relation: ThingId) -> Result<Vec<(String, ThingId)>, StoreError>;
    fn relations_with_player(
        &self,
        player: ThingId,
        role: Option<&str>,
    ) -> Result<Vec<ThingId>, StoreError>;
    fn relation_exists(
        &self,
        type_name: &str,
        players: &[(String, ThingId)],
    ) -> Result<bool, StoreError>;
}

/// Write surface used by the materializer.
pub trait GraphStoreMut: GraphStore {
    fn insert_entity(&mut self, type_name: &str) -> Result<ThingId, StoreError>;
    fn insert_attribute(&mut self, type_name: &str, value: Value) -> Result<ThingId, StoreError>;
    fn insert_has(&mut self, owner: ThingId, attribute: ThingId) -> Result<(), StoreError>;
    fn insert_relation(
        &mut self,
        type_name: &str,
        players: &[(String, ThingId)],
    ) -> Result<ThingId, StoreError>;
}

impl GraphStore for KnowledgeGraph {
    fn schema(&self) -> &TypeIndex {
        KnowledgeGraph::schema(self)
    }

    fn contains(&self, thing: ThingId) -> Result<bool, StoreError> {
        Ok(KnowledgeGraph::contains(self, thing))
    }

    fn type_of(&self, thing: ThingId) -> Result<Option<String>, StoreError> {
        Ok(self.type_name_of(thing))
    }

    fn things_of_type(&self, type_name: &str) -> Result<Vec<ThingId>, StoreError> {
        Ok(KnowledgeGraph::things_of_type(self, type_name, true)
            .iter()
            .map(ThingId::new)
            .collect())
    }

    fn attribute_value(&self, thing: ThingId) -> Result<Option<Value>, StoreError> {
        Ok(KnowledgeGraph::attribute_value(self, thing).cloned())
    }

    fn attribute_by_value(
        &self,
        type_name: &str,
        value: &Value,
    ) -> Result<Option<ThingId>, StoreError> {
        Ok(KnowledgeGraph::attribute_by_value(self, type_name, value))
    }

    fn attributes_of(&self, owner: ThingId, type_name: &str) -> Result<Vec<ThingId>, StoreError> {
        Ok(KnowledgeGraph::attributes_of(self, owner, Some(type_name)))
    }

    fn owners_of(&self, attribute: ThingId) -> Result<Vec<ThingId>, StoreError> {
        Ok(KnowledgeGraph::owners_of(self, attribute))
    }

    fn relations_of_type(&self, type_name: &str) -> Result<Vec<ThingId>, StoreError> {
        Ok(KnowledgeGraph::relations_of_type(self, type_name, true)
            .iter()
            .map(ThingId::new)
            .collect())
    }

    fn players(&self, relation: ThingId) -> Result<Vec<(String, ThingId)>, StoreError> {
        Ok(KnowledgeGraph::players(self, relation))
    }

    fn relations_with_player(
        &self,
        player: ThingId,
        role: Option<&str>,
    ) -> Result<Vec<ThingId>, StoreError> {
        Ok(KnowledgeGraph::relations_with_player(self, player, role))
    }

    fn relation_exists(
        &self,
        type_name: &str,
        players: &[(String, ThingId)],
    ) -> Result<bool, StoreError> {
        let borrowed: Vec<(&str, ThingId)> =
            players.iter().map(|(r, p)| (r.as_str(), *p)).collect();
        Ok(KnowledgeGraph::relation_exists(self, type_name, &borrowed))
    }
}

impl GraphStoreMut for KnowledgeGraph {
    fn insert_entity(&mut self, type_name: &str) -> Result<ThingId, StoreError> {
        Ok(KnowledgeGraph::insert_entity(self, type_name)?)
    }

    fn insert_attribute(&mut self, type_name: &str, value: Value) -> Result<ThingId, StoreError> {
        Ok(KnowledgeGraph::insert_attribute(self, type_name, value)?)
    }

    fn insert_has(&mut self, owner: ThingId, attribute: ThingId) -> Result<(), StoreError> {
        Ok(KnowledgeGraph::insert_has(self, owner, attribute)?)
    }

    fn insert_relation(
        &mut self,
        type_name: &str,
        players: &[(String, ThingId)],
    ) -> Result<ThingId, StoreError> {
        let borrowed: Vec<(&str, ThingId)> =
            players.iter().map(|(r, p)| (r.as_str(), *p)).collect();
        Ok(KnowledgeGraph::insert_relation(self, type_name, &borrowed)?)
    }
}

// ============================================================================
// Base-fact retrieval
// ============================================================================

/// Resolve the value an operand variable stands for, if bound.
pub(crate) fn bound_value<S: GraphStore + ?Sized>(
    store: &S,
    binding: &ConceptMap,
    var: &Var,
) -> Result<Option<Value>, StoreError> {
    match binding.get(var) {
        Some(Concept::Value(v)) => Ok(Some(v.clone())),
        Some(Concept::Thing(id)) => store.attribute_value(*id),
        None => Ok(None),
    }
}

/// Evaluate a filter atom (`Value` or `Neq`) against a binding.
///
/// A filter whose operands are not all bound rejects the answer; the
/// planner only defers filters it could not anchor to a binding step.
pub(crate) fn passes_filter<S: GraphStore + ?Sized>(
    store: &S,
    binding: &ConceptMap,
    atom: &Atom,
) -> Result<bool, StoreError> {
    match atom {
        Atom::Value(v) => {
            let Some(lhs) = bound_value(store, binding, &v.var)? else {
                return Ok(false);
            };
            let rhs = match &v.rhs {
                ValueOperand::Const(c) => Some(c.clone()),
                ValueOperand::Var(rv) => bound_value(store, binding, rv)?,
            };
            let Some(rhs) = rhs else {
                return Ok(false);
            };
            Ok(lhs.compare(&rhs).map(|ord| v.cmp.test(ord)).unwrap_or(false))
        }
        Atom::Neq(n) => match (binding.get(&n.left), binding.get(&n.right)) {
            (Some(a), Some(b)) => Ok(a != b),
            _ => Ok(false),
        },
        _ => Ok(true),
    }
}

/// Answer one plan step directly from storage.
pub(crate) fn retrieve<S: GraphStore + ?Sized>(
    store: &S,
    query: &Query,
    seed: &ConceptMap,
) -> Result<Vec<ConceptMap>, StoreError> {
    let mut partials = vec![seed.clone().with_explanation(Explanation::Lookup)];

    // Id predicates ground their variables before anything expands.
    for (var, id) in query.id_constraints() {
        if !store.contains(id)? {
            return Ok(Vec::new());
        }
        partials = partials
            .into_iter()
            .filter_map(|p| p.bind(var.clone(), Concept::Thing(id)))
            .collect();
        if partials.is_empty() {
            return Ok(Vec::new());
        }
    }

    for atom in query.atoms() {
        if !atom.is_selectable() {
            continue;
        }
        let mut next: Vec<ConceptMap> = Vec::new();
        for partial in &partials {
            expand_atom(store, atom, partial, &mut next)?;
        }
        partials = next;
        if partials.is_empty() {
            return Ok(Vec::new());
        }
    }

    for atom in query.atoms() {
        if matches!(atom, Atom::Value(_)) {
            let mut kept = Vec::with_capacity(partials.len());
            for p in partials {
                if passes_filter(store, &p, atom)? {
                    kept.push(p);
                }
            }
            partials = kept;
        }
    }

    // Distinct answers only; expansion order can produce repeats when roles
    // admit several assignments onto the same players.
    let mut seen: AHashSet<ConceptMap> = AHashSet::new();
    let mut out = Vec::new();
    for p in partials {
        if seen.insert(p.clone()) {
            out.push(p);
        }
    }
    Ok(out)
}

fn expand_atom<S: GraphStore + ?Sized>(
    store: &S,
    atom: &Atom,
    partial: &ConceptMap,
    out: &mut Vec<ConceptMap>,
) -> Result<(), StoreError> {
    match atom {
        Atom::Isa(isa) => match partial.get(&isa.thing) {
            Some(Concept::Thing(id)) => {
                if let Some(actual) = store.type_of(*id)? {
                    if store.schema().is_subtype(&actual, &isa.type_name) {
                        out.push(partial.clone());
                    }
                }
            }
            Some(Concept::Value(_)) => {}
            None => {
                for id in store.things_of_type(&isa.type_name)? {
                    if let Some(bound) = partial.bind(isa.thing.clone(), Concept::Thing(id)) {
                        out.push(bound);
                    }
                }
            }
        },
        Atom::Has(has) => expand_has(store, has, partial, out)?,
        Atom::Relation(rel) => expand_relation(store, rel, partial, out)?,
        _ => out.push(partial.clone()),
    }
    Ok(())
}

fn expand_has<S: GraphStore + ?Sized>(
    store: &S,
    has: &crate::pattern::HasAtom,
    partial: &ConceptMap,
    out: &mut Vec<ConceptMap>,
) -> Result<(), StoreError> {
    // Normalize to a set of candidate attribute instances.
    let candidates: Vec<ThingId> = match &has.value {
        HasValue::Const(v) => store
            .attribute_by_value(&has.attribute_type, v)?
            .into_iter()
            .collect(),
        HasValue::Var(vv) => match partial.get(vv) {
            Some(Concept::Thing(id)) => {
                let ok = store
                    .type_of(*id)?
                    .map(|t| store.schema().is_subtype(&t, &has.attribute_type))
                    .unwrap_or(false);
                if ok {
                    vec![*id]
                } else {
                    Vec::new()
                }
            }
            Some(Concept::Value(v)) => store
                .attribute_by_value(&has.attribute_type, v)?
                .into_iter()
                .collect(),
            None => match partial.get(&has.owner) {
                Some(Concept::Thing(owner)) => store.attributes_of(*owner, &has.attribute_type)?,
                _ => store.things_of_type(&has.attribute_type)?,
            },
        },
    };

    for attr in candidates {
        let with_value = match &has.value {
            HasValue::Var(vv) => partial.bind(vv.clone(), Concept::Thing(attr)),
            HasValue::Const(_) => Some(partial.clone()),
        };
        let Some(with_value) = with_value else {
            continue;
        };
        match with_value.get(&has.owner) {
            Some(Concept::Thing(owner)) => {
                if store.owners_of(attr)?.contains(owner) {
                    out.push(with_value);
                }
            }
            Some(Concept::Value(_)) => {}
            None => {
                for owner in store.owners_of(attr)? {
                    if let Some(bound) = with_value.bind(has.owner.clone(), Concept::Thing(owner)) {
                        out.push(bound);
                    }
                }
            }
        }
    }
    Ok(())
}

fn expand_relation<S: GraphStore + ?Sized>(
    store: &S,
    rel: &RelationAtom,
    partial: &ConceptMap,
    out: &mut Vec<ConceptMap>,
) -> Result<(), StoreError> {
    let type_ok = |store: &S, candidate: ThingId| -> Result<bool, StoreError> {
        match &rel.type_name {
            None => Ok(true),
            Some(ty) => Ok(store
                .type_of(candidate)?
                .map(|t| store.schema().is_subtype(&t, ty))
                .unwrap_or(false)),
        }
    };

    let anchor = rel.players.iter().find_map(|p| match partial.get(&p.player) {
        Some(Concept::Thing(id)) => Some((*id, p.role.as_deref())),
        _ => None,
    });
    let candidates: Vec<ThingId> = if let Some(Concept::Thing(id)) = partial.get(&rel.relation) {
        vec![*id]
    } else if let Some((pid, role)) = anchor {
        store.relations_with_player(pid, role)?
    } else if let Some(ty) = &rel.type_name {
        store.relations_of_type(ty)?
    } else {
        tracing::warn!("unanchored untyped relation atom matches nothing: {rel:?}");
        return Ok(());
    };

    for candidate in candidates {
        if !type_ok(store, candidate)? {
            continue;
        }
        let Some(seeded) = partial.bind(rel.relation.clone(), Concept::Thing(candidate)) else {
            continue;
        };
        let actual = store.players(candidate)?;
        assign_pattern_players(&rel.players, &actual, 0, &mut vec![false; actual.len()], &seeded, out);
    }
    Ok(())
}

/// Injectively match pattern players onto a relation's actual role-player
/// pairs, respecting declared roles and existing bindings.
fn assign_pattern_players(
    pattern: &[crate::pattern::RolePlayer],
    actual: &[(String, ThingId)],
    idx: usize,
    used: &mut Vec<bool>,
    partial: &ConceptMap,
    out: &mut Vec<ConceptMap>,
) {
    if idx == pattern.len() {
        if !out.contains(partial) {
            out.push(partial.clone());
        }
        return;
    }
    let slot = &pattern[idx];
    for (j, (role, player)) in actual.iter().enumerate() {
        if used[j] {
            continue;
        }
        if let Some(wanted) = &slot.role {
            if wanted != role {
                continue;
            }
        }
        let Some(bound) = partial.bind(slot.player.clone(), Concept::Thing(*player)) else {
            continue;
        };
        used[j] = true;
        assign_pattern_players(pattern, actual, idx + 1, used, &bound, out);
        used[j] = false;
    }
}
