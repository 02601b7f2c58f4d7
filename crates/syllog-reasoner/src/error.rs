//! Error taxonomy of the resolver.
//!
//! Three families, with very different lifecycles:
//!
//! - [`ConstructionError`]: a pattern that cannot be an atomic query, or a
//!   rule whose head/body do not line up. Fatal, rejected at construction,
//!   never retried.
//! - [`ResolutionError`]: terminal failures of a `resolve()` call. Storage
//!   failures carry the pattern fragment they interrupted; a cache
//!   inconsistency means the equivalence classes collapsed and indicates a
//!   resolver bug, not a user error.
//! - Unification failure is *not* an error: a rule/atom pair that admits no
//!   consistent variable correspondence simply contributes nothing, so those
//!   paths return `Option`/empty instead.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum ConstructionError {
    #[error("query has no selectable atom: {query}")]
    NoSelectableAtom { query: String },

    #[error("query has {count} selectable atoms, expected exactly one: {query}")]
    MultipleSelectableAtoms { count: usize, query: String },

    #[error("rule `{rule}` has an empty body")]
    EmptyRuleBody { rule: String },

    #[error("rule `{rule}` head must be a selectable atom, got: {head}")]
    NonSelectableRuleHead { rule: String, head: String },

    #[error("rule `{rule}` head variable `{var}` is not bound by the body")]
    UnboundHeadVariable { rule: String, var: String },

    #[error("duplicate rule label `{0}`")]
    DuplicateRuleLabel(String),
}

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),

    #[error("storage failure while resolving `{fragment}`")]
    Storage {
        fragment: String,
        #[source]
        source: StoreError,
    },

    #[error("answer cache holds conflicting canonical entries for `{fragment}`")]
    CacheInconsistency { fragment: String },

    #[error("materialization failed for rule `{rule}`")]
    Materialization {
        rule: String,
        #[source]
        source: StoreError,
    },
}
