//! Schema index: the type metadata the resolver consumes.
//!
//! The resolver never defines types; it only asks questions of an already
//! built [`TypeIndex`]:
//!
//! - type kinds (entity / relation / attribute) and subtyping,
//! - the role set of a relation type (own roles plus inherited ones),
//! - which attribute types an owner type may carry, and their value kinds.
//!
//! Indexes are keyed by type name. Definition order matters only in that a
//! supertype must exist before its subtypes; this keeps the supertype graph
//! acyclic by construction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ValueKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeKind {
    Entity,
    Relation,
    Attribute,
}

impl std::fmt::Display for TypeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TypeKind::Entity => write!(f, "entity"),
            TypeKind::Relation => write!(f, "relation"),
            TypeKind::Attribute => write!(f, "attribute"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unknown type `{0}`")]
    UnknownType(String),

    #[error("unknown thing `{0}`")]
    UnknownThing(String),

    #[error("type `{0}` is already defined")]
    DuplicateType(String),

    #[error("type `{name}` is {actual}, expected {expected}")]
    KindMismatch {
        name: String,
        actual: TypeKind,
        expected: TypeKind,
    },

    #[error("role `{role}` is not declared on relation type `{relation}`")]
    UndeclaredRole { relation: String, role: String },

    #[error("type `{owner}` does not own attribute type `{attribute}`")]
    UndeclaredOwnership { owner: String, attribute: String },

    #[error("attribute type `{attribute}` carries {expected} values, got {actual}")]
    ValueKindMismatch {
        attribute: String,
        expected: ValueKind,
        actual: ValueKind,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeInfo {
    pub name: String,
    pub kind: TypeKind,
    pub supertype: Option<String>,
    /// Roles declared directly on this type (relation kinds only).
    pub roles: Vec<String>,
    /// Attribute types owned directly by this type.
    pub owns: Vec<String>,
    /// Value kind (attribute kinds only).
    pub value_kind: Option<ValueKind>,
}

/// Index over all defined types.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TypeIndex {
    types: HashMap<String, TypeInfo>,
    /// Direct subtypes, for transitive `subtypes_of` walks.
    children: HashMap<String, Vec<String>>,
}

impl TypeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define_entity_type(
        &mut self,
        name: &str,
        supertype: Option<&str>,
    ) -> Result<(), SchemaError> {
        self.define(name, TypeKind::Entity, supertype, Vec::new(), None)
    }

    pub fn define_relation_type(
        &mut self,
        name: &str,
        supertype: Option<&str>,
        roles: &[&str],
    ) -> Result<(), SchemaError> {
        self.define(
            name,
            TypeKind::Relation,
            supertype,
            roles.iter().map(|r| r.to_string()).collect(),
            None,
        )
    }

    pub fn define_attribute_type(
        &mut self,
        name: &str,
        supertype: Option<&str>,
        value_kind: ValueKind,
    ) -> Result<(), SchemaError> {
        self.define(name, TypeKind::Attribute, supertype, Vec::new(), Some(value_kind))
    }

    /// Declare that `owner` things may carry `attribute` instances.
    pub fn define_owns(&mut self, owner: &str, attribute: &str) -> Result<(), SchemaError> {
        self.expect_kind(attribute, TypeKind::Attribute)?;
        let info = self
            .types
            .get_mut(owner)
            .ok_or_else(|| SchemaError::UnknownType(owner.to_string()))?;
        if !info.owns.iter().any(|a| a == attribute) {
            info.owns.push(attribute.to_string());
        }
        Ok(())
    }

    fn define(
        &mut self,
        name: &str,
        kind: TypeKind,
        supertype: Option<&str>,
        roles: Vec<String>,
        value_kind: Option<ValueKind>,
    ) -> Result<(), SchemaError> {
        if self.types.contains_key(name) {
            return Err(SchemaError::DuplicateType(name.to_string()));
        }
        if let Some(sup) = supertype {
            self.expect_kind(sup, kind)?;
        }
        self.types.insert(
            name.to_string(),
            TypeInfo {
                name: name.to_string(),
                kind,
                supertype: supertype.map(str::to_string),
                roles,
                owns: Vec::new(),
                value_kind,
            },
        );
        if let Some(sup) = supertype {
            self.children
                .entry(sup.to_string())
                .or_default()
                .push(name.to_string());
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TypeInfo> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<TypeKind> {
        self.types.get(name).map(|t| t.kind)
    }

    pub fn expect_kind(&self, name: &str, expected: TypeKind) -> Result<&TypeInfo, SchemaError> {
        let info = self
            .types
            .get(name)
            .ok_or_else(|| SchemaError::UnknownType(name.to_string()))?;
        if info.kind != expected {
            return Err(SchemaError::KindMismatch {
                name: name.to_string(),
                actual: info.kind,
                expected,
            });
        }
        Ok(info)
    }

    /// Reflexive, transitive subtype check along declared supertype edges.
    pub fn is_subtype(&self, sub: &str, sup: &str) -> bool {
        if sub == sup {
            return self.types.contains_key(sub);
        }
        let mut current = sub;
        while let Some(info) = self.types.get(current) {
            match info.supertype.as_deref() {
                Some(parent) if parent == sup => return true,
                Some(parent) => current = parent,
                None => return false,
            }
        }
        false
    }

    /// Two types are compatible when one is a subtype of the other.
    pub fn compatible(&self, a: &str, b: &str) -> bool {
        self.is_subtype(a, b) || self.is_subtype(b, a)
    }

    /// Transitive subtypes including `name` itself, sorted for determinism.
    pub fn subtypes_of(&self, name: &str) -> Vec<String> {
        let mut out = Vec::new();
        if !self.types.contains_key(name) {
            return out;
        }
        let mut stack = vec![name.to_string()];
        while let Some(ty) = stack.pop() {
            if let Some(kids) = self.children.get(&ty) {
                stack.extend(kids.iter().cloned());
            }
            out.push(ty);
        }
        out.sort();
        out.dedup();
        out
    }

    /// Role set of a relation type: inherited roles first, then own
    /// declarations, deduplicated.
    pub fn roles_of(&self, relation: &str) -> Result<Vec<String>, SchemaError> {
        let info = self.expect_kind(relation, TypeKind::Relation)?;
        let mut chain = Vec::new();
        let mut current = Some(info);
        while let Some(ty) = current {
            chain.push(ty);
            current = ty.supertype.as_deref().and_then(|s| self.types.get(s));
        }
        let mut out: Vec<String> = Vec::new();
        for ty in chain.iter().rev() {
            for role in &ty.roles {
                if !out.iter().any(|r| r == role) {
                    out.push(role.clone());
                }
            }
        }
        Ok(out)
    }

    pub fn declares_role(&self, relation: &str, role: &str) -> bool {
        self.roles_of(relation)
            .map(|roles| roles.iter().any(|r| r == role))
            .unwrap_or(false)
    }

    /// Whether `owner` (or one of its supertypes) owns `attribute` (or one of
    /// its supertypes).
    pub fn owns(&self, owner: &str, attribute: &str) -> bool {
        let mut current = self.types.get(owner);
        while let Some(info) = current {
            if info
                .owns
                .iter()
                .any(|a| self.is_subtype(attribute, a))
            {
                return true;
            }
            current = info.supertype.as_deref().and_then(|s| self.types.get(s));
        }
        false
    }

    /// Value kind of an attribute type, walking up to the declaring ancestor.
    pub fn value_kind_of(&self, attribute: &str) -> Option<ValueKind> {
        let mut current = self.types.get(attribute)?;
        loop {
            if let Some(kind) = current.value_kind {
                return Some(kind);
            }
            current = self.types.get(current.supertype.as_deref()?)?;
        }
    }

    /// All type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family_schema() -> TypeIndex {
        let mut schema = TypeIndex::new();
        schema.define_entity_type("person", None).unwrap();
        schema.define_entity_type("child", Some("person")).unwrap();
        schema
            .define_relation_type("kinship", None, &["member"])
            .unwrap();
        schema
            .define_relation_type("parentship", Some("kinship"), &["parent", "offspring"])
            .unwrap();
        schema
            .define_attribute_type("name", None, ValueKind::String)
            .unwrap();
        schema.define_owns("person", "name").unwrap();
        schema
    }

    #[test]
    fn subtyping_is_reflexive_and_transitive() {
        let schema = family_schema();
        assert!(schema.is_subtype("person", "person"));
        assert!(schema.is_subtype("child", "person"));
        assert!(!schema.is_subtype("person", "child"));
        assert!(schema.compatible("person", "child"));
        assert!(!schema.is_subtype("ghost", "ghost"));
    }

    #[test]
    fn roles_include_inherited_declarations() {
        let schema = family_schema();
        let roles = schema.roles_of("parentship").unwrap();
        assert_eq!(roles, vec!["member", "parent", "offspring"]);
        assert!(schema.declares_role("parentship", "member"));
        assert!(!schema.declares_role("kinship", "parent"));
    }

    #[test]
    fn ownership_respects_supertypes() {
        let schema = family_schema();
        assert!(schema.owns("person", "name"));
        assert!(schema.owns("child", "name"));
        assert!(!schema.owns("kinship", "name"));
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let mut schema = family_schema();
        let err = schema.define_entity_type("person", None).unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateType(_)));
        let err = schema
            .define_entity_type("pet", Some("kinship"))
            .unwrap_err();
        assert!(matches!(err, SchemaError::KindMismatch { .. }));
    }
}
