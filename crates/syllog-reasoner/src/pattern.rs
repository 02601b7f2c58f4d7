//! Pattern model: atoms, queries and atomic queries.
//!
//! A [`Query`] is an immutable conjunction of [`Atom`]s over one variable
//! namespace. Atoms form a *closed* tagged set; everything that operates
//! across atom kinds (unification, planning, retrieval) is a function over
//! the enum, so the mutual Query/Atom/Unifier references stay acyclic.
//!
//! An [`AtomicQuery`] is the planner's unit of resolution: exactly one
//! selectable atom (isa / relation / has) plus its supporting constraints
//! (ids, value predicates). Building one from anything else is a
//! [`ConstructionError`], decided at construction rather than discovered
//! mid-resolution.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use syllog_kb::{ThingId, Value};

use crate::error::ConstructionError;

// ============================================================================
// Variables
// ============================================================================

/// A pattern variable, e.g. `$x`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Var(String);

impl Var {
    pub fn named(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// Anonymous variables (leading underscore) join like any other but are
    /// excluded from a query's default selection.
    pub fn is_anonymous(&self) -> bool {
        self.0.starts_with('_')
    }
}

impl std::fmt::Display for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// A fresh variable based on `hint` that collides with nothing in `taken`.
pub(crate) fn fresh_var(hint: &str, taken: &BTreeSet<Var>) -> Var {
    let mut n = 0usize;
    loop {
        let candidate = Var(format!("{hint}_{n}"));
        if !taken.contains(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

// ============================================================================
// Atoms
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparator {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparator {
    pub fn test(self, ordering: std::cmp::Ordering) -> bool {
        use std::cmp::Ordering::*;
        match self {
            Comparator::Eq => ordering == Equal,
            Comparator::Neq => ordering != Equal,
            Comparator::Lt => ordering == Less,
            Comparator::Le => ordering != Greater,
            Comparator::Gt => ordering == Greater,
            Comparator::Ge => ordering != Less,
        }
    }
}

impl std::fmt::Display for Comparator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Comparator::Eq => "==",
            Comparator::Neq => "!=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        };
        write!(f, "{s}")
    }
}

/// One role slot of a relation atom. The role may be left unassigned; the
/// unifier and the materializer then enumerate schema-valid assignments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RolePlayer {
    pub role: Option<String>,
    pub player: Var,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IsaAtom {
    pub thing: Var,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationAtom {
    /// The relation instance variable. Usually anonymous but always present,
    /// so provenance and materialization have something to hang on to.
    pub relation: Var,
    pub type_name: Option<String>,
    pub players: Vec<RolePlayer>,
}

/// Value slot of a `has` atom.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HasValue {
    Var(Var),
    Const(Value),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HasAtom {
    pub owner: Var,
    pub attribute_type: String,
    pub value: HasValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdAtom {
    pub var: Var,
    pub id: ThingId,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueOperand {
    Const(Value),
    Var(Var),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueAtom {
    pub var: Var,
    pub cmp: Comparator,
    pub rhs: ValueOperand,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NeqAtom {
    pub left: Var,
    pub right: Var,
}

/// One constraint of a conjunctive pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Atom {
    Isa(IsaAtom),
    Relation(RelationAtom),
    Has(HasAtom),
    Id(IdAtom),
    Value(ValueAtom),
    Neq(NeqAtom),
}

impl Atom {
    pub fn isa(thing: &str, type_name: &str) -> Self {
        Atom::Isa(IsaAtom {
            thing: Var::named(thing),
            type_name: type_name.to_string(),
        })
    }

    pub fn relation(relation: &str, type_name: &str, players: &[(&str, &str)]) -> Self {
        Atom::Relation(RelationAtom {
            relation: Var::named(relation),
            type_name: Some(type_name.to_string()),
            players: players
                .iter()
                .map(|(role, player)| RolePlayer {
                    role: Some(role.to_string()),
                    player: Var::named(*player),
                })
                .collect(),
        })
    }

    pub fn has_value(owner: &str, attribute_type: &str, value: Value) -> Self {
        Atom::Has(HasAtom {
            owner: Var::named(owner),
            attribute_type: attribute_type.to_string(),
            value: HasValue::Const(value),
        })
    }

    pub fn has_var(owner: &str, attribute_type: &str, value: &str) -> Self {
        Atom::Has(HasAtom {
            owner: Var::named(owner),
            attribute_type: attribute_type.to_string(),
            value: HasValue::Var(Var::named(value)),
        })
    }

    pub fn id(var: &str, id: ThingId) -> Self {
        Atom::Id(IdAtom {
            var: Var::named(var),
            id,
        })
    }

    pub fn value(var: &str, cmp: Comparator, value: Value) -> Self {
        Atom::Value(ValueAtom {
            var: Var::named(var),
            cmp,
            rhs: ValueOperand::Const(value),
        })
    }

    pub fn neq(left: &str, right: &str) -> Self {
        Atom::Neq(NeqAtom {
            left: Var::named(left),
            right: Var::named(right),
        })
    }

    /// Whether this atom shapes the answer (isa / relation / has), as
    /// opposed to constraining other atoms' variables.
    pub fn is_selectable(&self) -> bool {
        matches!(self, Atom::Isa(_) | Atom::Relation(_) | Atom::Has(_))
    }

    /// Variables in occurrence order, duplicates preserved.
    pub fn variables(&self) -> Vec<&Var> {
        match self {
            Atom::Isa(a) => vec![&a.thing],
            Atom::Relation(a) => {
                let mut out = vec![&a.relation];
                out.extend(a.players.iter().map(|p| &p.player));
                out
            }
            Atom::Has(a) => {
                let mut out = vec![&a.owner];
                if let HasValue::Var(v) = &a.value {
                    out.push(v);
                }
                out
            }
            Atom::Id(a) => vec![&a.var],
            Atom::Value(a) => {
                let mut out = vec![&a.var];
                if let ValueOperand::Var(v) = &a.rhs {
                    out.push(v);
                }
                out
            }
            Atom::Neq(a) => vec![&a.left, &a.right],
        }
    }

    /// Apply a variable mapping simultaneously: every occurrence is looked
    /// up in `map` independently, so swaps need no intermediate names.
    pub fn rename(&self, map: &BTreeMap<Var, Var>) -> Atom {
        let sub = |v: &Var| map.get(v).cloned().unwrap_or_else(|| v.clone());
        match self {
            Atom::Isa(a) => Atom::Isa(IsaAtom {
                thing: sub(&a.thing),
                type_name: a.type_name.clone(),
            }),
            Atom::Relation(a) => Atom::Relation(RelationAtom {
                relation: sub(&a.relation),
                type_name: a.type_name.clone(),
                players: a
                    .players
                    .iter()
                    .map(|p| RolePlayer {
                        role: p.role.clone(),
                        player: sub(&p.player),
                    })
                    .collect(),
            }),
            Atom::Has(a) => Atom::Has(HasAtom {
                owner: sub(&a.owner),
                attribute_type: a.attribute_type.clone(),
                value: match &a.value {
                    HasValue::Var(v) => HasValue::Var(sub(v)),
                    HasValue::Const(c) => HasValue::Const(c.clone()),
                },
            }),
            Atom::Id(a) => Atom::Id(IdAtom {
                var: sub(&a.var),
                id: a.id,
            }),
            Atom::Value(a) => Atom::Value(ValueAtom {
                var: sub(&a.var),
                cmp: a.cmp,
                rhs: match &a.rhs {
                    ValueOperand::Var(v) => ValueOperand::Var(sub(v)),
                    ValueOperand::Const(c) => ValueOperand::Const(c.clone()),
                },
            }),
            Atom::Neq(a) => Atom::Neq(NeqAtom {
                left: sub(&a.left),
                right: sub(&a.right),
            }),
        }
    }
}

impl std::fmt::Display for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Atom::Isa(a) => write!(f, "{} isa {}", a.thing, a.type_name),
            Atom::Relation(a) => {
                write!(f, "{} (", a.relation)?;
                for (i, p) in a.players.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match &p.role {
                        Some(role) => write!(f, "{role}: {}", p.player)?,
                        None => write!(f, "{}", p.player)?,
                    }
                }
                write!(f, ")")?;
                if let Some(ty) = &a.type_name {
                    write!(f, " isa {ty}")?;
                }
                Ok(())
            }
            Atom::Has(a) => match &a.value {
                HasValue::Var(v) => write!(f, "{} has {} {v}", a.owner, a.attribute_type),
                HasValue::Const(c) => write!(f, "{} has {} {c}", a.owner, a.attribute_type),
            },
            Atom::Id(a) => write!(f, "{} id {}", a.var, a.id),
            Atom::Value(a) => match &a.rhs {
                ValueOperand::Var(v) => write!(f, "{} {} {v}", a.var, a.cmp),
                ValueOperand::Const(c) => write!(f, "{} {} {c}", a.var, a.cmp),
            },
            Atom::Neq(a) => write!(f, "{} != {}", a.left, a.right),
        }
    }
}

// ============================================================================
// Queries
// ============================================================================

/// An immutable conjunction of atoms over a shared variable namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Query {
    atoms: Vec<Atom>,
    selected: BTreeSet<Var>,
}

impl Query {
    /// Build a query selecting every non-anonymous variable.
    pub fn new(atoms: Vec<Atom>) -> Self {
        let selected = atoms
            .iter()
            .flat_map(|a| a.variables())
            .filter(|v| !v.is_anonymous())
            .cloned()
            .collect();
        Self { atoms, selected }
    }

    /// Restrict the output variables. Unknown variables are ignored.
    pub fn with_select(mut self, vars: impl IntoIterator<Item = Var>) -> Self {
        let known = self.variables();
        self.selected = vars.into_iter().filter(|v| known.contains(v)).collect();
        self
    }

    pub fn atoms(&self) -> &[Atom] {
        &self.atoms
    }

    pub fn is_empty(&self) -> bool {
        self.atoms.is_empty()
    }

    pub fn variables(&self) -> BTreeSet<Var> {
        self.atoms
            .iter()
            .flat_map(|a| a.variables())
            .cloned()
            .collect()
    }

    pub fn selected(&self) -> &BTreeSet<Var> {
        &self.selected
    }

    /// The conjunction with `!=` atoms removed.
    pub fn positive_part(&self) -> Query {
        let atoms: Vec<Atom> = self
            .atoms
            .iter()
            .filter(|a| !matches!(a, Atom::Neq(_)))
            .cloned()
            .collect();
        Query {
            atoms,
            selected: self.selected.clone(),
        }
    }

    pub fn neq_atoms(&self) -> Vec<&NeqAtom> {
        self.atoms
            .iter()
            .filter_map(|a| match a {
                Atom::Neq(n) => Some(n),
                _ => None,
            })
            .collect()
    }

    /// Id predicates per variable.
    pub fn id_constraints(&self) -> BTreeMap<Var, ThingId> {
        self.atoms
            .iter()
            .filter_map(|a| match a {
                Atom::Id(i) => Some((i.var.clone(), i.id)),
                _ => None,
            })
            .collect()
    }

    /// Every variable is pinned by an id predicate.
    pub fn is_fully_bound(&self) -> bool {
        let ids = self.id_constraints();
        self.variables().iter().all(|v| ids.contains_key(v))
    }

    /// Rename variables simultaneously, avoiding accidental capture.
    ///
    /// If the mapping sends `$a` to `$b` while `$b` also occurs in the query
    /// and is not itself remapped, `$b` is first moved to a fresh name.
    /// Swaps (`$a -> $b`, `$b -> $a`) need no such repair since application
    /// is simultaneous.
    pub fn rename(&self, mapping: &BTreeMap<Var, Var>) -> Query {
        let ours = self.variables();
        let mut map: BTreeMap<Var, Var> = mapping
            .iter()
            .filter(|(from, _)| ours.contains(*from))
            .map(|(from, to)| (from.clone(), to.clone()))
            .collect();

        let range: BTreeSet<Var> = map.values().cloned().collect();
        let mut taken: BTreeSet<Var> = ours.union(&range).cloned().collect();
        for v in &ours {
            if !map.contains_key(v) && range.contains(v) {
                let fresh = fresh_var(v.name(), &taken);
                taken.insert(fresh.clone());
                map.insert(v.clone(), fresh);
            }
        }

        let atoms = self.atoms.iter().map(|a| a.rename(&map)).collect();
        let selected = self
            .selected
            .iter()
            .map(|v| map.get(v).cloned().unwrap_or_else(|| v.clone()))
            .collect();
        Query { atoms, selected }
    }

    /// Indexes of the selectable atoms.
    pub fn selectable_indices(&self) -> Vec<usize> {
        self.atoms
            .iter()
            .enumerate()
            .filter(|(_, a)| a.is_selectable())
            .map(|(i, _)| i)
            .collect()
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{ ")?;
        for atom in &self.atoms {
            write!(f, "{atom}; ")?;
        }
        write!(f, "}}")
    }
}

// ============================================================================
// Atomic queries
// ============================================================================

/// A query with exactly one selectable atom plus its constraints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AtomicQuery {
    query: Query,
    head_index: usize,
}

impl AtomicQuery {
    pub fn try_new(query: Query) -> Result<Self, ConstructionError> {
        let selectable = query.selectable_indices();
        match selectable.len() {
            0 => Err(ConstructionError::NoSelectableAtom {
                query: query.to_string(),
            }),
            1 => Ok(Self {
                query,
                head_index: selectable[0],
            }),
            n => Err(ConstructionError::MultipleSelectableAtoms {
                count: n,
                query: query.to_string(),
            }),
        }
    }

    /// The single selectable atom.
    pub fn head(&self) -> &Atom {
        &self.query.atoms[self.head_index]
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Non-selectable supporting atoms.
    pub fn constraints(&self) -> impl Iterator<Item = &Atom> {
        let head = self.head_index;
        self.query
            .atoms
            .iter()
            .enumerate()
            .filter(move |(i, _)| *i != head)
            .map(|(_, a)| a)
    }

    pub fn rename(&self, mapping: &BTreeMap<Var, Var>) -> AtomicQuery {
        AtomicQuery {
            query: self.query.rename(mapping),
            head_index: self.head_index,
        }
    }
}

impl std::fmt::Display for AtomicQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.query)
    }
}
