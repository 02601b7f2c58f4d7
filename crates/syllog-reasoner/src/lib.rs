//! Syllog resolution core: rule-driven answering of conjunctive patterns
//! over a typed knowledge graph.
//!
//! Given a pattern query and a set of schema-defined inference rules, the
//! resolver yields every variable binding that is either stored directly or
//! derivable by chaining rules, without recursing forever on cyclic rule
//! sets and without recomputing equivalent subgoals, and records how each
//! answer was derived.
//!
//! ## Pipeline
//!
//! - [`pattern`]: atoms, queries, atomic queries.
//! - [`unify`]: alpha/structural equivalence, unifiers.
//! - [`plan`]: cost-based decomposition into an ordered step list.
//! - [`cache`]: per-call answer memoization keyed by equivalence class.
//! - [`resolve`]: the fixpoint executor over storage and rules.
//! - [`answer`]: concept maps and explanation trees.
//! - [`materialize`]: optional write-back of derived facts.
//!
//! Storage and schema metadata are external collaborators reached through
//! [`store::GraphStore`]; `syllog-kb` provides the in-memory implementation.
//!
//! ## Example
//!
//! ```
//! use syllog_kb::{KnowledgeGraph, TypeIndex, Value, ValueKind};
//! use syllog_reasoner::{Atom, Query, Reasoner, RuleIndex};
//!
//! let mut schema = TypeIndex::new();
//! schema.define_entity_type("person", None).unwrap();
//! schema.define_attribute_type("name", None, ValueKind::String).unwrap();
//! schema.define_owns("person", "name").unwrap();
//!
//! let mut graph = KnowledgeGraph::new(schema);
//! let ann = graph.insert_entity("person").unwrap();
//! let name = graph.insert_attribute("name", Value::String("Ann".into())).unwrap();
//! graph.insert_has(ann, name).unwrap();
//!
//! let reasoner = Reasoner::new(RuleIndex::empty());
//! let query = Query::new(vec![
//!     Atom::isa("x", "person"),
//!     Atom::has_value("x", "name", Value::String("Ann".into())),
//! ]);
//! let answers = reasoner.resolve_all(&graph, &query).unwrap();
//! assert_eq!(answers.len(), 1);
//! ```

pub mod answer;
pub mod cache;
pub mod error;
pub mod materialize;
pub mod pattern;
pub mod plan;
pub mod resolve;
pub mod rule;
pub mod store;
pub mod unify;

pub use answer::{Concept, ConceptMap, Explanation};
pub use error::{ConstructionError, ResolutionError};
pub use materialize::Materializer;
pub use pattern::{Atom, AtomicQuery, Comparator, HasValue, Query, Var};
pub use plan::{ResolutionPlan, StepKind};
pub use resolve::{resolve, resolve_all, AnswerIter};
pub use rule::{Rule, RuleIndex};
pub use store::{GraphStore, GraphStoreMut, StoreError};
pub use unify::{Equivalence, MultiUnifier, Unifier};

use syllog_kb::ThingId;

/// Options for a single resolution call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Persist rule-derived facts back into the store after resolution.
    pub materialize: bool,
}

/// Facade binding a rule set to the resolution entry points.
#[derive(Debug)]
pub struct Reasoner {
    rules: RuleIndex,
}

impl Reasoner {
    pub fn new(rules: RuleIndex) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleIndex {
        &self.rules
    }

    /// Lazily resolve; answers stream out pass by pass.
    pub fn resolve<'a, S: GraphStore + ?Sized>(
        &'a self,
        store: &'a S,
        query: &Query,
    ) -> Result<AnswerIter<'a, S>, ResolutionError> {
        resolve::resolve(store, &self.rules, query)
    }

    /// Resolve to completion and collect every answer.
    pub fn resolve_all<S: GraphStore + ?Sized>(
        &self,
        store: &S,
        query: &Query,
    ) -> Result<Vec<ConceptMap>, ResolutionError> {
        resolve::resolve_all(store, &self.rules, query)
    }

    /// Resolve to completion; optionally materialize derived facts.
    ///
    /// Materialization runs after resolution so the store is never mutated
    /// under a live answer stream. Returns the answers and the things the
    /// materializer created.
    pub fn resolve_with<S: GraphStoreMut>(
        &self,
        store: &mut S,
        query: &Query,
        options: ResolveOptions,
    ) -> Result<(Vec<ConceptMap>, Vec<ThingId>), ResolutionError> {
        let answers = resolve::resolve_all(&*store, &self.rules, query)?;
        let created = if options.materialize {
            Materializer::new(&self.rules).materialize(store, &answers)?
        } else {
            Vec::new()
        };
        Ok((answers, created))
    }

    /// The provenance tree of an answer.
    pub fn explain<'m>(&self, answer: &'m ConceptMap) -> &'m Explanation {
        answer.explanation()
    }
}
