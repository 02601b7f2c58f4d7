//! In-memory typed graph store.
//!
//! Everything is a **thing** with a `u32` id and an interned type symbol:
//! entities, relation instances and attribute instances share one id space.
//! Storage is columnar where it pays off (type column + per-type bitmaps)
//! and edge-indexed where the resolver joins:
//!
//! - ownership edges `owner -has-> attribute`, indexed both directions;
//! - role-player edges `relation -(role)-> player`, with a `(player, role)`
//!   backward index for player-anchored lookups.
//!
//! Attribute instances are canonical per `(type, value)`: inserting the same
//! value twice yields the same thing id. This keeps `has` joins cheap and
//! makes materialized inserts naturally idempotent.
//!
//! All read APIs are deterministic: bitmaps iterate ascending, edge lists
//! preserve insertion order, and derived vectors are sorted where they are
//! assembled from hash maps.

use ahash::{AHashMap, AHashSet};
use roaring::RoaringBitmap;

use crate::schema::{SchemaError, TypeIndex, TypeKind};
use crate::{Sym, SymbolTable, ThingId, Value};

/// A relation instance's role-player pairs, in insertion order.
#[derive(Debug, Clone, Default)]
struct RolePlayers {
    pairs: Vec<(Sym, ThingId)>,
}

#[derive(Debug)]
pub struct KnowledgeGraph {
    symbols: SymbolTable,
    schema: TypeIndex,

    /// Type column: thing id -> type symbol.
    types: Vec<Sym>,
    /// Per-type bitmap of thing ids (direct type only; subtype closure is
    /// resolved through the schema at query time).
    type_index: AHashMap<Sym, RoaringBitmap>,

    /// Attribute instance -> value.
    attr_values: AHashMap<ThingId, Value>,
    /// Canonical attribute instance per (type, value).
    attr_by_value: AHashMap<(Sym, Value), ThingId>,

    /// Ownership edges, both directions, insertion-ordered.
    has_forward: AHashMap<ThingId, Vec<ThingId>>,
    has_backward: AHashMap<ThingId, Vec<ThingId>>,
    has_edges: AHashSet<(ThingId, ThingId)>,

    /// Relation instance -> role players.
    role_players: AHashMap<ThingId, RolePlayers>,
    /// (player, role) -> relation ids.
    player_index: AHashMap<(ThingId, Sym), Vec<ThingId>>,
    /// player -> relation ids (any role).
    player_any_index: AHashMap<ThingId, Vec<ThingId>>,
}

impl KnowledgeGraph {
    pub fn new(schema: TypeIndex) -> Self {
        Self {
            symbols: SymbolTable::new(),
            schema,
            types: Vec::new(),
            type_index: AHashMap::new(),
            attr_values: AHashMap::new(),
            attr_by_value: AHashMap::new(),
            has_forward: AHashMap::new(),
            has_backward: AHashMap::new(),
            has_edges: AHashSet::new(),
            role_players: AHashMap::new(),
            player_index: AHashMap::new(),
            player_any_index: AHashMap::new(),
        }
    }

    pub fn schema(&self) -> &TypeIndex {
        &self.schema
    }

    pub fn thing_count(&self) -> usize {
        self.types.len()
    }

    pub fn contains(&self, thing: ThingId) -> bool {
        (thing.raw() as usize) < self.types.len()
    }

    fn add_thing(&mut self, type_sym: Sym) -> ThingId {
        let id = ThingId::new(self.types.len() as u32);
        self.types.push(type_sym);
        self.type_index
            .entry(type_sym)
            .or_insert_with(RoaringBitmap::new)
            .insert(id.raw());
        id
    }

    // ------------------------------------------------------------------
    // Inserts (schema-validated)
    // ------------------------------------------------------------------

    pub fn insert_entity(&mut self, type_name: &str) -> Result<ThingId, SchemaError> {
        self.schema.expect_kind(type_name, TypeKind::Entity)?;
        let sym = self.symbols.intern(type_name);
        Ok(self.add_thing(sym))
    }

    /// Insert (or fetch) the canonical attribute instance for a value.
    pub fn insert_attribute(
        &mut self,
        type_name: &str,
        value: Value,
    ) -> Result<ThingId, SchemaError> {
        self.schema.expect_kind(type_name, TypeKind::Attribute)?;
        let expected = self
            .schema
            .value_kind_of(type_name)
            .ok_or_else(|| SchemaError::UnknownType(type_name.to_string()))?;
        if value.kind() != expected {
            return Err(SchemaError::ValueKindMismatch {
                attribute: type_name.to_string(),
                expected,
                actual: value.kind(),
            });
        }

        let sym = self.symbols.intern(type_name);
        if let Some(&existing) = self.attr_by_value.get(&(sym, value.clone())) {
            return Ok(existing);
        }
        let id = self.add_thing(sym);
        self.attr_values.insert(id, value.clone());
        self.attr_by_value.insert((sym, value), id);
        Ok(id)
    }

    /// Attach an attribute instance to an owner. Idempotent.
    pub fn insert_has(&mut self, owner: ThingId, attribute: ThingId) -> Result<(), SchemaError> {
        let owner_ty = self
            .type_name_of(owner)
            .ok_or_else(|| SchemaError::UnknownThing(format!("{owner}")))?;
        let attr_ty = self
            .type_name_of(attribute)
            .ok_or_else(|| SchemaError::UnknownThing(format!("{attribute}")))?;
        self.schema.expect_kind(&attr_ty, TypeKind::Attribute)?;
        if !self.schema.owns(&owner_ty, &attr_ty) {
            return Err(SchemaError::UndeclaredOwnership {
                owner: owner_ty,
                attribute: attr_ty,
            });
        }

        if self.has_edges.insert((owner, attribute)) {
            self.has_forward.entry(owner).or_default().push(attribute);
            self.has_backward.entry(attribute).or_default().push(owner);
        }
        Ok(())
    }

    /// Insert a relation instance with explicit role-player pairs.
    pub fn insert_relation(
        &mut self,
        type_name: &str,
        players: &[(&str, ThingId)],
    ) -> Result<ThingId, SchemaError> {
        self.schema.expect_kind(type_name, TypeKind::Relation)?;
        for (role, player) in players {
            if !self.schema.declares_role(type_name, role) {
                return Err(SchemaError::UndeclaredRole {
                    relation: type_name.to_string(),
                    role: role.to_string(),
                });
            }
            if !self.contains(*player) {
                return Err(SchemaError::UnknownThing(format!("{player}")));
            }
        }

        let sym = self.symbols.intern(type_name);
        let id = self.add_thing(sym);
        let mut pairs = Vec::with_capacity(players.len());
        for (role, player) in players {
            let role_sym = self.symbols.intern(role);
            pairs.push((role_sym, *player));
            self.player_index
                .entry((*player, role_sym))
                .or_default()
                .push(id);
            self.player_any_index.entry(*player).or_default().push(id);
        }
        self.role_players.insert(id, RolePlayers { pairs });
        Ok(id)
    }

    /// Whether a relation instance of exactly this type with exactly these
    /// role-player pairs (as a multiset) already exists.
    pub fn relation_exists(&self, type_name: &str, players: &[(&str, ThingId)]) -> bool {
        let Some(type_sym) = self.symbols.id_of(type_name) else {
            return false;
        };
        let Some((first_role, first_player)) = players.first() else {
            return false;
        };
        let Some(first_role_sym) = self.symbols.id_of(first_role) else {
            return false;
        };

        let mut wanted: Vec<(Sym, ThingId)> = Vec::with_capacity(players.len());
        for (role, player) in players {
            let Some(role_sym) = self.symbols.id_of(role) else {
                return false;
            };
            wanted.push((role_sym, *player));
        }
        wanted.sort();

        let Some(candidates) = self.player_index.get(&(*first_player, first_role_sym)) else {
            return false;
        };
        candidates.iter().any(|&rel| {
            if self.types.get(rel.raw() as usize) != Some(&type_sym) {
                return false;
            }
            let Some(rp) = self.role_players.get(&rel) else {
                return false;
            };
            let mut actual = rp.pairs.clone();
            actual.sort();
            actual == wanted
        })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    pub fn type_name_of(&self, thing: ThingId) -> Option<String> {
        let sym = self.types.get(thing.raw() as usize)?;
        self.symbols.lookup(*sym)
    }

    /// Things whose direct type is `type_name`, or any of its subtypes.
    pub fn things_of_type(&self, type_name: &str, include_subtypes: bool) -> RoaringBitmap {
        let mut out = RoaringBitmap::new();
        if include_subtypes {
            for sub in self.schema.subtypes_of(type_name) {
                if let Some(sym) = self.symbols.id_of(&sub) {
                    if let Some(ids) = self.type_index.get(&sym) {
                        out |= ids;
                    }
                }
            }
        } else if let Some(sym) = self.symbols.id_of(type_name) {
            if let Some(ids) = self.type_index.get(&sym) {
                out |= ids;
            }
        }
        out
    }

    pub fn attribute_value(&self, thing: ThingId) -> Option<&Value> {
        self.attr_values.get(&thing)
    }

    /// Canonical attribute instance for `(type, value)`, if stored. Checks
    /// subtypes of `type_name` as well.
    pub fn attribute_by_value(&self, type_name: &str, value: &Value) -> Option<ThingId> {
        for sub in self.schema.subtypes_of(type_name) {
            let Some(sym) = self.symbols.id_of(&sub) else {
                continue;
            };
            if let Some(&id) = self.attr_by_value.get(&(sym, value.clone())) {
                return Some(id);
            }
        }
        None
    }

    /// Attribute instances owned by `owner`, optionally narrowed to an
    /// attribute type (and its subtypes).
    pub fn attributes_of(&self, owner: ThingId, attr_type: Option<&str>) -> Vec<ThingId> {
        let Some(attrs) = self.has_forward.get(&owner) else {
            return Vec::new();
        };
        match attr_type {
            None => attrs.clone(),
            Some(ty) => attrs
                .iter()
                .copied()
                .filter(|a| {
                    self.type_name_of(*a)
                        .map(|t| self.schema.is_subtype(&t, ty))
                        .unwrap_or(false)
                })
                .collect(),
        }
    }

    pub fn owners_of(&self, attribute: ThingId) -> Vec<ThingId> {
        self.has_backward
            .get(&attribute)
            .cloned()
            .unwrap_or_default()
    }

    pub fn has_edge(&self, owner: ThingId, attribute: ThingId) -> bool {
        self.has_edges.contains(&(owner, attribute))
    }

    /// Relation instances of a type (and optionally its subtypes).
    pub fn relations_of_type(&self, type_name: &str, include_subtypes: bool) -> RoaringBitmap {
        self.things_of_type(type_name, include_subtypes)
    }

    /// Role-player pairs of a relation instance, in insertion order.
    pub fn players(&self, relation: ThingId) -> Vec<(String, ThingId)> {
        let Some(rp) = self.role_players.get(&relation) else {
            return Vec::new();
        };
        rp.pairs
            .iter()
            .filter_map(|(role, player)| self.symbols.lookup(*role).map(|r| (r, *player)))
            .collect()
    }

    /// Relations in which `player` participates, optionally under a role.
    pub fn relations_with_player(&self, player: ThingId, role: Option<&str>) -> Vec<ThingId> {
        let ids = match role {
            Some(role) => {
                let Some(role_sym) = self.symbols.id_of(role) else {
                    return Vec::new();
                };
                self.player_index.get(&(player, role_sym))
            }
            None => self.player_any_index.get(&player),
        };
        let mut out = ids.cloned().unwrap_or_default();
        out.sort();
        out.dedup();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ValueKind;

    fn graph() -> KnowledgeGraph {
        let mut schema = TypeIndex::new();
        schema.define_entity_type("person", None).unwrap();
        schema
            .define_attribute_type("name", None, ValueKind::String)
            .unwrap();
        schema.define_owns("person", "name").unwrap();
        schema
            .define_relation_type("employment", None, &["employee", "employer"])
            .unwrap();
        schema.define_entity_type("company", None).unwrap();
        KnowledgeGraph::new(schema)
    }

    #[test]
    fn attributes_are_canonical_per_value() {
        let mut g = graph();
        let a = g
            .insert_attribute("name", Value::String("Ann".into()))
            .unwrap();
        let b = g
            .insert_attribute("name", Value::String("Ann".into()))
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(
            g.attribute_by_value("name", &Value::String("Ann".into())),
            Some(a)
        );
    }

    #[test]
    fn relation_existence_is_a_multiset_check() {
        let mut g = graph();
        let p = g.insert_entity("person").unwrap();
        let c = g.insert_entity("company").unwrap();
        g.insert_relation("employment", &[("employee", p), ("employer", c)])
            .unwrap();

        assert!(g.relation_exists("employment", &[("employee", p), ("employer", c)]));
        // Pair order must not matter.
        assert!(g.relation_exists("employment", &[("employer", c), ("employee", p)]));
        assert!(!g.relation_exists("employment", &[("employee", c), ("employer", p)]));
    }

    #[test]
    fn undeclared_roles_and_ownership_are_rejected() {
        let mut g = graph();
        let p = g.insert_entity("person").unwrap();
        let c = g.insert_entity("company").unwrap();
        let err = g
            .insert_relation("employment", &[("boss", c), ("employee", p)])
            .unwrap_err();
        assert!(matches!(err, SchemaError::UndeclaredRole { .. }));

        let name = g
            .insert_attribute("name", Value::String("Acme".into()))
            .unwrap();
        let err = g.insert_has(c, name).unwrap_err();
        assert!(matches!(err, SchemaError::UndeclaredOwnership { .. }));
    }
}
