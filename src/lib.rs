//! Umbrella crate: the knowledge-base substrate and the resolution core
//! under one roof.
//!
//! Most users want [`syllog_reasoner::Reasoner`] over a
//! [`syllog_kb::KnowledgeGraph`]; see the member crates for the details.

pub use syllog_kb as kb;
pub use syllog_reasoner as reasoner;

pub use syllog_kb::{KnowledgeGraph, ThingId, TypeIndex, Value, ValueKind};
pub use syllog_reasoner::{
    Atom, ConceptMap, Explanation, Query, Reasoner, ResolveOptions, Rule, RuleIndex, Var,
};
