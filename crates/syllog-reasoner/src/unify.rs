//! Unification and equivalence over patterns.
//!
//! Two notions of equivalence, kept strictly apart:
//!
//! - **Alpha**: equal up to variable renaming only. Id-predicate values must
//!   match. This keys the answer cache.
//! - **Structural**: additionally ignores *which* concrete ids the id
//!   predicates carry. This groups cache entries into shape buckets and
//!   gates rule-applicability pre-checks.
//!
//! Query hashes are an order-independent fold of per-atom hashes (wrapping
//! sum), so `{a; b}` and `{b; a}` hash alike; equality then attempts an
//! any-to-any matching of atoms under a consistent variable bijection.
//!
//! A [`Unifier`] maps one frame's variables into another's. Rule-head
//! unification ([`unify_atoms`]) is deliberately looser than equivalence:
//! a head whose type lies at or below the goal's type matches, and it may
//! yield several alternatives — a [`MultiUnifier`] — when role assignment
//! is ambiguous.

use std::collections::BTreeMap;
use std::hash::{BuildHasher, Hash, Hasher};

use serde::{Deserialize, Serialize};

use syllog_kb::TypeIndex;

use crate::answer::ConceptMap;
use crate::pattern::{Atom, HasValue, Query, ValueOperand, Var};

/// Which equivalence notion an operation runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Equivalence {
    Alpha,
    Structural,
}

// Fixed seeds: hashes are compared within one process only, but tests rely
// on declaration order never mattering.
fn build_hasher() -> impl Hasher {
    ahash::RandomState::with_seeds(11, 23, 47, 97).build_hasher()
}

/// Variable-name-free hash of a single atom.
pub fn atom_hash(atom: &Atom, eq: Equivalence) -> u64 {
    let mut h = build_hasher();
    match atom {
        Atom::Isa(a) => {
            0u8.hash(&mut h);
            a.type_name.hash(&mut h);
        }
        Atom::Relation(a) => {
            1u8.hash(&mut h);
            a.type_name.hash(&mut h);
            a.players.len().hash(&mut h);
            // Role multiset, order-independent.
            let mut roles: u64 = 0;
            for p in &a.players {
                let mut rh = build_hasher();
                p.role.hash(&mut rh);
                roles = roles.wrapping_add(rh.finish());
            }
            roles.hash(&mut h);
        }
        Atom::Has(a) => {
            2u8.hash(&mut h);
            a.attribute_type.hash(&mut h);
            match &a.value {
                HasValue::Const(v) => {
                    true.hash(&mut h);
                    v.hash(&mut h);
                }
                HasValue::Var(_) => false.hash(&mut h),
            }
        }
        Atom::Id(a) => {
            3u8.hash(&mut h);
            if eq == Equivalence::Alpha {
                a.id.hash(&mut h);
            }
        }
        Atom::Value(a) => {
            4u8.hash(&mut h);
            a.cmp.hash(&mut h);
            match &a.rhs {
                ValueOperand::Const(v) => {
                    true.hash(&mut h);
                    v.hash(&mut h);
                }
                ValueOperand::Var(_) => false.hash(&mut h),
            }
        }
        Atom::Neq(_) => {
            5u8.hash(&mut h);
        }
    }
    h.finish()
}

/// Order-independent hash of a query's atoms.
pub fn query_hash(query: &Query, eq: Equivalence) -> u64 {
    let mut acc: u64 = 0;
    for atom in query.atoms() {
        acc = acc.wrapping_add(atom_hash(atom, eq));
    }
    acc ^ (query.atoms().len() as u64)
}

// ============================================================================
// Unifiers
// ============================================================================

/// A variable correspondence from one frame into another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unifier {
    map: BTreeMap<Var, Var>,
}

impl Unifier {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (Var, Var)>) -> Self {
        Self {
            map: pairs.into_iter().collect(),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.map.iter().all(|(a, b)| a == b)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn pairs(&self) -> Vec<(Var, Var)> {
        self.map
            .iter()
            .map(|(a, b)| (a.clone(), b.clone()))
            .collect()
    }

    pub fn apply_var(&self, var: &Var) -> Var {
        self.map.get(var).cloned().unwrap_or_else(|| var.clone())
    }

    pub fn apply_query(&self, query: &Query) -> Query {
        query.rename(&self.map)
    }

    /// Translate an answer into the target frame.
    ///
    /// Variables outside the domain are dropped (projection); a
    /// non-injective unifier whose collapsed variables disagree on their
    /// concepts yields `None`.
    pub fn apply_answer(&self, answer: &ConceptMap) -> Option<ConceptMap> {
        let mut out = ConceptMap::empty().with_explanation(answer.explanation().clone());
        for (var, concept) in answer.iter() {
            let Some(target) = self.map.get(var) else {
                continue;
            };
            out = out.bind(target.clone(), concept.clone())?;
        }
        Some(out)
    }

    /// The inverse correspondence; `None` when not injective.
    pub fn invert(&self) -> Option<Unifier> {
        let mut map = BTreeMap::new();
        for (from, to) in &self.map {
            if map.insert(to.clone(), from.clone()).is_some() {
                return None;
            }
        }
        Some(Unifier { map })
    }

    /// `self` then `other`: the correspondence sending `v` through both.
    pub fn compose(&self, other: &Unifier) -> Unifier {
        let mut map: BTreeMap<Var, Var> = self
            .map
            .iter()
            .map(|(from, to)| (from.clone(), other.apply_var(to)))
            .collect();
        for (from, to) in &other.map {
            map.entry(from.clone()).or_insert_with(|| to.clone());
        }
        Unifier { map }
    }
}

/// Alternative unifiers for one head/goal pair. Empty means "not unifiable".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiUnifier {
    options: Vec<Unifier>,
}

impl MultiUnifier {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn singleton(unifier: Unifier) -> Self {
        Self {
            options: vec![unifier],
        }
    }

    pub fn push_distinct(&mut self, unifier: Unifier) {
        if !self.options.contains(&unifier) {
            self.options.push(unifier);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.options.is_empty()
    }

    pub fn len(&self) -> usize {
        self.options.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Unifier> {
        self.options.iter()
    }
}

// ============================================================================
// Query equivalence
// ============================================================================

type VarMaps = (BTreeMap<Var, Var>, BTreeMap<Var, Var>);

fn bind_pair(maps: &VarMaps, from: &Var, to: &Var) -> Option<VarMaps> {
    let (fwd, bwd) = maps;
    if let Some(existing) = fwd.get(from) {
        return (existing == to).then(|| maps.clone());
    }
    if bwd.contains_key(to) {
        return None;
    }
    let mut out = maps.clone();
    out.0.insert(from.clone(), to.clone());
    out.1.insert(to.clone(), from.clone());
    Some(out)
}

/// All variable-bijection extensions under which `a` matches `b`.
fn atom_match_options(a: &Atom, b: &Atom, eq: Equivalence, maps: &VarMaps) -> Vec<VarMaps> {
    match (a, b) {
        (Atom::Isa(x), Atom::Isa(y)) => {
            if x.type_name != y.type_name {
                return Vec::new();
            }
            bind_pair(maps, &x.thing, &y.thing).into_iter().collect()
        }
        (Atom::Id(x), Atom::Id(y)) => {
            if eq == Equivalence::Alpha && x.id != y.id {
                return Vec::new();
            }
            bind_pair(maps, &x.var, &y.var).into_iter().collect()
        }
        (Atom::Has(x), Atom::Has(y)) => {
            if x.attribute_type != y.attribute_type {
                return Vec::new();
            }
            let Some(with_owner) = bind_pair(maps, &x.owner, &y.owner) else {
                return Vec::new();
            };
            match (&x.value, &y.value) {
                (HasValue::Const(u), HasValue::Const(v)) if u == v => vec![with_owner],
                (HasValue::Var(u), HasValue::Var(v)) => {
                    bind_pair(&with_owner, u, v).into_iter().collect()
                }
                _ => Vec::new(),
            }
        }
        (Atom::Value(x), Atom::Value(y)) => {
            if x.cmp != y.cmp {
                return Vec::new();
            }
            let Some(with_var) = bind_pair(maps, &x.var, &y.var) else {
                return Vec::new();
            };
            match (&x.rhs, &y.rhs) {
                (ValueOperand::Const(u), ValueOperand::Const(v)) if u == v => vec![with_var],
                (ValueOperand::Var(u), ValueOperand::Var(v)) => {
                    bind_pair(&with_var, u, v).into_iter().collect()
                }
                _ => Vec::new(),
            }
        }
        (Atom::Neq(x), Atom::Neq(y)) => {
            // != is symmetric: both orientations are candidate matches.
            let mut out = Vec::new();
            if let Some(m) = bind_pair(maps, &x.left, &y.left)
                .and_then(|m| bind_pair(&m, &x.right, &y.right))
            {
                out.push(m);
            }
            if let Some(m) = bind_pair(maps, &x.left, &y.right)
                .and_then(|m| bind_pair(&m, &x.right, &y.left))
            {
                if !out.contains(&m) {
                    out.push(m);
                }
            }
            out
        }
        (Atom::Relation(x), Atom::Relation(y)) => {
            if x.type_name != y.type_name || x.players.len() != y.players.len() {
                return Vec::new();
            }
            let Some(with_rel) = bind_pair(maps, &x.relation, &y.relation) else {
                return Vec::new();
            };
            // Injective role-respecting assignment of x's players onto y's.
            let mut results = Vec::new();
            let mut used = vec![false; y.players.len()];
            assign_players(x, y, 0, &mut used, &with_rel, &mut results);
            results
        }
        _ => Vec::new(),
    }
}

fn assign_players(
    x: &crate::pattern::RelationAtom,
    y: &crate::pattern::RelationAtom,
    idx: usize,
    used: &mut Vec<bool>,
    maps: &VarMaps,
    results: &mut Vec<VarMaps>,
) {
    if idx == x.players.len() {
        if !results.contains(maps) {
            results.push(maps.clone());
        }
        return;
    }
    let xp = &x.players[idx];
    for (j, yp) in y.players.iter().enumerate() {
        if used[j] || xp.role != yp.role {
            continue;
        }
        if let Some(next) = bind_pair(maps, &xp.player, &yp.player) {
            used[j] = true;
            assign_players(x, y, idx + 1, used, &next, results);
            used[j] = false;
        }
    }
}

fn match_queries(
    from: &[Atom],
    to: &[Atom],
    eq: Equivalence,
    idx: usize,
    used: &mut Vec<bool>,
    maps: &VarMaps,
) -> Option<VarMaps> {
    if idx == from.len() {
        return Some(maps.clone());
    }
    let a = &from[idx];
    let a_hash = atom_hash(a, eq);
    for (j, b) in to.iter().enumerate() {
        if used[j] || atom_hash(b, eq) != a_hash {
            continue;
        }
        for next in atom_match_options(a, b, eq, maps) {
            used[j] = true;
            if let Some(found) = match_queries(from, to, eq, idx + 1, used, &next) {
                used[j] = false;
                return Some(found);
            }
            used[j] = false;
        }
    }
    None
}

/// A variable bijection sending `from` onto `to`, if they are equivalent.
///
/// Equivalence is a property of the conjunctions; which variables a caller
/// selects for output does not split equivalence classes. The returned
/// unifier translates `from`-frame queries and answers into the `to` frame.
pub fn unify_queries(from: &Query, to: &Query, eq: Equivalence) -> Option<Unifier> {
    if from.atoms().len() != to.atoms().len() {
        return None;
    }
    if query_hash(from, eq) != query_hash(to, eq) {
        return None;
    }
    let mut used = vec![false; to.atoms().len()];
    let maps = (BTreeMap::new(), BTreeMap::new());
    let (fwd, _bwd) = match_queries(from.atoms(), to.atoms(), eq, 0, &mut used, &maps)?;
    Some(Unifier { map: fwd })
}

/// Whether two queries are equivalent under `eq`.
pub fn equivalent(a: &Query, b: &Query, eq: Equivalence) -> bool {
    unify_queries(a, b, eq).is_some()
}

// ============================================================================
// Rule-head unification
// ============================================================================

fn relation_types_compatible(
    head_ty: &Option<String>,
    goal_ty: &Option<String>,
    schema: &TypeIndex,
) -> bool {
    match (head_ty, goal_ty) {
        // Conclusions are instances of the head type, so they satisfy the
        // goal only when the head type lies at or below the goal type.
        (Some(h), Some(g)) => schema.is_subtype(h, g),
        // An untyped goal accepts any typed head; an untyped head concludes
        // nothing usable.
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn assign_goal_players(
    goal: &crate::pattern::RelationAtom,
    head: &crate::pattern::RelationAtom,
    idx: usize,
    used: &mut Vec<bool>,
    map: &BTreeMap<Var, Var>,
    out: &mut MultiUnifier,
) {
    if idx == goal.players.len() {
        out.push_distinct(Unifier { map: map.clone() });
        return;
    }
    let gp = &goal.players[idx];
    for (j, hp) in head.players.iter().enumerate() {
        if used[j] {
            continue;
        }
        let role_ok = match (&gp.role, &hp.role) {
            (None, _) => true,
            (Some(g), Some(h)) => g == h,
            (Some(_), None) => false,
        };
        if !role_ok {
            continue;
        }
        // Head-frame maps are forward-functional, not necessarily injective:
        // a goal repeating one variable across players is fine.
        if let Some(existing) = map.get(&hp.player) {
            if existing != &gp.player {
                continue;
            }
        }
        let mut next = map.clone();
        next.insert(hp.player.clone(), gp.player.clone());
        used[j] = true;
        assign_goal_players(goal, head, idx + 1, used, &next, out);
        used[j] = false;
    }
}

/// Unify a rule head with a goal atom.
///
/// The result maps **head-frame** variables to **goal-frame** variables; an
/// empty [`MultiUnifier`] means the rule cannot produce this atom. The head
/// type must lie at or below the goal type, since conclusions are instances
/// of the head type. Ambiguous role assignment yields several alternatives.
pub fn unify_atoms(head: &Atom, goal: &Atom, schema: &TypeIndex) -> MultiUnifier {
    match (head, goal) {
        (Atom::Isa(h), Atom::Isa(g)) => {
            if !schema.is_subtype(&h.type_name, &g.type_name) {
                return MultiUnifier::empty();
            }
            MultiUnifier::singleton(Unifier::from_pairs([(h.thing.clone(), g.thing.clone())]))
        }
        (Atom::Has(h), Atom::Has(g)) => {
            if !schema.is_subtype(&h.attribute_type, &g.attribute_type) {
                return MultiUnifier::empty();
            }
            let mut pairs = vec![(h.owner.clone(), g.owner.clone())];
            match (&h.value, &g.value) {
                (HasValue::Const(hv), HasValue::Const(gv)) => {
                    if hv != gv {
                        return MultiUnifier::empty();
                    }
                }
                (HasValue::Var(hv), HasValue::Var(gv)) => {
                    pairs.push((hv.clone(), gv.clone()));
                }
                // A constant on one side only is reconciled when the
                // conclusion is merged with the goal's constraints.
                _ => {}
            }
            MultiUnifier::singleton(Unifier::from_pairs(pairs))
        }
        (Atom::Relation(h), Atom::Relation(g)) => {
            if !relation_types_compatible(&h.type_name, &g.type_name, schema) {
                return MultiUnifier::empty();
            }
            if g.players.len() > h.players.len() {
                return MultiUnifier::empty();
            }
            let mut out = MultiUnifier::empty();
            let mut used = vec![false; h.players.len()];
            let mut seed = BTreeMap::new();
            seed.insert(h.relation.clone(), g.relation.clone());
            assign_goal_players(g, h, 0, &mut used, &seed, &mut out);
            out
        }
        _ => MultiUnifier::empty(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{Comparator, RelationAtom, RolePlayer};
    use syllog_kb::{ThingId, Value, ValueKind};

    fn schema() -> TypeIndex {
        let mut s = TypeIndex::new();
        s.define_entity_type("person", None).unwrap();
        s.define_entity_type("child", Some("person")).unwrap();
        s.define_relation_type("friendship", None, &["friend"])
            .unwrap();
        s.define_relation_type("parentship", None, &["parent", "offspring"])
            .unwrap();
        s.define_attribute_type("name", None, ValueKind::String)
            .unwrap();
        s
    }

    #[test]
    fn query_hash_ignores_atom_order_and_names() {
        let q1 = Query::new(vec![
            Atom::isa("x", "person"),
            Atom::has_value("x", "name", Value::String("Ann".into())),
        ]);
        let q2 = Query::new(vec![
            Atom::has_value("p", "name", Value::String("Ann".into())),
            Atom::isa("p", "person"),
        ]);
        assert_eq!(
            query_hash(&q1, Equivalence::Alpha),
            query_hash(&q2, Equivalence::Alpha)
        );
        assert!(equivalent(&q1, &q2, Equivalence::Alpha));
    }

    #[test]
    fn alpha_distinguishes_ids_structural_does_not() {
        let q1 = Query::new(vec![
            Atom::isa("x", "person"),
            Atom::id("x", ThingId::new(1)),
        ]);
        let q2 = Query::new(vec![
            Atom::isa("y", "person"),
            Atom::id("y", ThingId::new(2)),
        ]);
        assert!(!equivalent(&q1, &q2, Equivalence::Alpha));
        assert!(equivalent(&q1, &q2, Equivalence::Structural));
    }

    #[test]
    fn unifier_round_trips_queries() {
        let q1 = Query::new(vec![Atom::relation(
            "r",
            "parentship",
            &[("parent", "a"), ("offspring", "b")],
        )]);
        let q2 = Query::new(vec![Atom::relation(
            "s",
            "parentship",
            &[("parent", "p"), ("offspring", "q")],
        )]);
        let u = unify_queries(&q1, &q2, Equivalence::Alpha).unwrap();
        assert!(equivalent(&u.apply_query(&q1), &q2, Equivalence::Alpha));

        let back = u.invert().unwrap();
        assert!(equivalent(&back.apply_query(&q2), &q1, Equivalence::Alpha));
    }

    #[test]
    fn symmetric_roles_produce_a_multi_unifier() {
        let head = Atom::Relation(RelationAtom {
            relation: Var::named("hr"),
            type_name: Some("friendship".into()),
            players: vec![
                RolePlayer {
                    role: Some("friend".into()),
                    player: Var::named("h1"),
                },
                RolePlayer {
                    role: Some("friend".into()),
                    player: Var::named("h2"),
                },
            ],
        });
        let goal = Atom::Relation(RelationAtom {
            relation: Var::named("gr"),
            type_name: Some("friendship".into()),
            players: vec![
                RolePlayer {
                    role: Some("friend".into()),
                    player: Var::named("x"),
                },
                RolePlayer {
                    role: Some("friend".into()),
                    player: Var::named("y"),
                },
            ],
        });
        let mu = unify_atoms(&head, &goal, &schema());
        assert_eq!(mu.len(), 2);
    }

    #[test]
    fn incompatible_types_do_not_unify() {
        let head = Atom::isa("h", "friendship");
        let goal = Atom::isa("g", "person");
        assert!(unify_atoms(&head, &goal, &schema()).is_empty());

        // A head concluding the subtype satisfies a supertype goal.
        let head = Atom::isa("h", "child");
        let goal = Atom::isa("g", "person");
        assert_eq!(unify_atoms(&head, &goal, &schema()).len(), 1);

        // A head concluding only the supertype cannot answer a subtype goal.
        let head = Atom::isa("h", "person");
        let goal = Atom::isa("g", "child");
        assert!(unify_atoms(&head, &goal, &schema()).is_empty());
    }

    #[test]
    fn value_predicates_participate_in_equivalence() {
        let q1 = Query::new(vec![
            Atom::has_var("x", "name", "n"),
            Atom::value("n", Comparator::Gt, Value::Long(3)),
        ]);
        let q2 = Query::new(vec![
            Atom::has_var("y", "name", "m"),
            Atom::value("m", Comparator::Gt, Value::Long(3)),
        ]);
        let q3 = Query::new(vec![
            Atom::has_var("y", "name", "m"),
            Atom::value("m", Comparator::Lt, Value::Long(3)),
        ]);
        assert!(equivalent(&q1, &q2, Equivalence::Alpha));
        assert!(!equivalent(&q1, &q3, Equivalence::Alpha));
    }
}
