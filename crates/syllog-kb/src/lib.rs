//! Syllog knowledge-base substrate.
//!
//! This crate holds everything the resolver consumes but does not own:
//!
//! - **Symbol interning**: type names, role names and attribute keys are
//!   stored once and referenced by a compact `u32` id ([`Sym`]).
//! - **Schema index** ([`schema::TypeIndex`]): type kinds, declared
//!   supertypes, relation role sets and attribute ownership.
//! - **Typed graph store** ([`store::KnowledgeGraph`]): an in-memory,
//!   schema-validated store of entities, relation instances and attribute
//!   instances, with the index structures the resolver's lookups lean on.
//!
//! The store is deliberately a *single logical knowledge base*: no
//! transactions, no durability, no wire format. Those live behind other
//! layers; the resolver only needs deterministic lookups and idempotent
//! inserts.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

pub mod schema;
pub mod store;

pub use schema::{SchemaError, TypeIndex, TypeKind};
pub use store::KnowledgeGraph;

// ============================================================================
// Symbol Interning
// ============================================================================

/// Interned symbol id (4 bytes instead of 24+ for String).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct Sym(u32);

impl Sym {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

/// Symbol table: maps names to compact ids.
#[derive(Debug)]
pub struct SymbolTable {
    str_to_id: DashMap<String, Sym>,
    id_to_str: DashMap<Sym, String>,
    next_id: AtomicU32,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self {
            str_to_id: DashMap::new(),
            id_to_str: DashMap::new(),
            next_id: AtomicU32::new(0),
        }
    }

    /// Intern a name, returning its id.
    pub fn intern(&self, s: &str) -> Sym {
        if let Some(id) = self.str_to_id.get(s) {
            return *id;
        }

        let id = Sym(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.str_to_id.insert(s.to_string(), id);
        self.id_to_str.insert(id, s.to_string());
        id
    }

    /// Look up an existing id for a name without inserting.
    pub fn id_of(&self, s: &str) -> Option<Sym> {
        self.str_to_id.get(s).map(|id| *id)
    }

    /// Look up a name by id.
    pub fn lookup(&self, id: Sym) -> Option<String> {
        self.id_to_str.get(&id).map(|s| s.clone())
    }
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Things
// ============================================================================

/// Id of a stored thing (entity, relation instance or attribute instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ThingId(u32);

impl ThingId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for ThingId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ============================================================================
// Values
// ============================================================================

/// Kind of value an attribute type carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Long,
    Double,
    Boolean,
}

impl std::fmt::Display for ValueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueKind::String => write!(f, "string"),
            ValueKind::Long => write!(f, "long"),
            ValueKind::Double => write!(f, "double"),
            ValueKind::Boolean => write!(f, "boolean"),
        }
    }
}

/// A concrete attribute value.
///
/// Equality and hashing treat `Double` by bit representation so values can
/// key the canonical-attribute index; ordered comparison goes through
/// [`Value::compare`], which also admits Long/Double cross-comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Value {
    String(String),
    Long(i64),
    Double(f64),
    Boolean(bool),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::String(_) => ValueKind::String,
            Value::Long(_) => ValueKind::Long,
            Value::Double(_) => ValueKind::Double,
            Value::Boolean(_) => ValueKind::Boolean,
        }
    }

    /// Ordered comparison. `None` when the kinds are incomparable.
    ///
    /// Numeric values compare across `Long`/`Double`; all other kinds only
    /// compare against themselves.
    pub fn compare(&self, other: &Value) -> Option<std::cmp::Ordering> {
        match (self, other) {
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Long(a), Value::Long(b)) => Some(a.cmp(b)),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Long(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
            (Value::Double(a), Value::Long(b)) => a.partial_cmp(&(*b as f64)),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Long(a), Value::Long(b)) => a == b,
            (Value::Double(a), Value::Double(b)) => a.to_bits() == b.to_bits(),
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::String(s) => s.hash(state),
            Value::Long(n) => n.hash(state),
            Value::Double(d) => d.to_bits().hash(state),
            Value::Boolean(b) => b.hash(state),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::String(s) => write!(f, "\"{s}\""),
            Value::Long(n) => write!(f, "{n}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::Boolean(b) => write!(f, "{b}"),
        }
    }
}
