//! Memoized answers per structurally-equivalent query shape.
//!
//! Entries are keyed by **alpha** equivalence: the first query of a class to
//! arrive becomes the canonical representative, and every later answer or
//! lookup is translated through a variable bijection between the caller's
//! frame and the canonical frame. A secondary **structural** index groups
//! alpha entries that differ only in id-predicate values into one shape
//! bucket (`$x id #1` and `$y id #2` are distinct entries, same bucket).
//!
//! At most one canonical entry may exist per alpha class within one
//! `resolve()` call; two would double-count answers during the fixpoint
//! loop, so finding a second match is surfaced as
//! [`ResolutionError::CacheInconsistency`] rather than papered over.
//!
//! The cache lives inside a per-call resolution context and dies with it;
//! cross-request caching is a storage-layer concern.

use ahash::{AHashMap, AHashSet};

use crate::answer::ConceptMap;
use crate::error::ResolutionError;
use crate::pattern::Query;
use crate::unify::{equivalent, query_hash, unify_queries, Equivalence, Unifier};

#[derive(Debug)]
struct CacheEntry {
    canonical: Query,
    answers: Vec<ConceptMap>,
    seen: AHashSet<ConceptMap>,
}

/// Entry handle, stable for the lifetime of one cache.
pub type EntryId = usize;

#[derive(Debug, Default)]
pub struct AnswerCache {
    entries: Vec<CacheEntry>,
    alpha_index: AHashMap<u64, Vec<EntryId>>,
    structural_index: AHashMap<u64, Vec<EntryId>>,
}

impl AnswerCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn total_answers(&self) -> usize {
        self.entries.iter().map(|e| e.answers.len()).sum()
    }

    fn find(&self, query: &Query) -> Result<Option<EntryId>, ResolutionError> {
        let hash = query_hash(query, Equivalence::Alpha);
        let Some(bucket) = self.alpha_index.get(&hash) else {
            return Ok(None);
        };
        let matches: Vec<EntryId> = bucket
            .iter()
            .copied()
            .filter(|&e| equivalent(&self.entries[e].canonical, query, Equivalence::Alpha))
            .collect();
        match matches.len() {
            0 => Ok(None),
            1 => Ok(Some(matches[0])),
            _ => Err(ResolutionError::CacheInconsistency {
                fragment: query.to_string(),
            }),
        }
    }

    /// The canonical entry for `query`'s alpha class, created on first use.
    pub fn entry_of(&mut self, query: &Query) -> Result<EntryId, ResolutionError> {
        if let Some(found) = self.find(query)? {
            return Ok(found);
        }
        let id = self.entries.len();
        self.alpha_index
            .entry(query_hash(query, Equivalence::Alpha))
            .or_default()
            .push(id);
        self.structural_index
            .entry(query_hash(query, Equivalence::Structural))
            .or_default()
            .push(id);
        self.entries.push(CacheEntry {
            canonical: query.clone(),
            answers: Vec::new(),
            seen: AHashSet::new(),
        });
        Ok(id)
    }

    pub fn canonical(&self, entry: EntryId) -> &Query {
        &self.entries[entry].canonical
    }

    /// Answers accumulated for an entry, in record order.
    pub fn answers(&self, entry: EntryId) -> &[ConceptMap] {
        &self.entries[entry].answers
    }

    pub fn answer_count(&self, entry: EntryId) -> usize {
        self.entries[entry].answers.len()
    }

    /// Record an answer already expressed in the canonical frame.
    /// Returns whether it was new.
    pub fn record_canonical(&mut self, entry: EntryId, answer: ConceptMap) -> bool {
        let slot = &mut self.entries[entry];
        if slot.seen.contains(&answer) {
            return false;
        }
        slot.seen.insert(answer.clone());
        slot.answers.push(answer);
        true
    }

    /// Record an answer under the caller's query frame.
    pub fn record(&mut self, query: &Query, answer: ConceptMap) -> Result<bool, ResolutionError> {
        let entry = self.entry_of(query)?;
        let canonical = &self.entries[entry].canonical;
        let to_canonical = unify_queries(query, canonical, Equivalence::Alpha)
            .expect("entry was found by alpha equivalence");
        let Some(translated) = to_canonical.apply_answer(&answer) else {
            return Ok(false);
        };
        Ok(self.record_canonical(entry, translated))
    }

    /// Answers for any alpha-equivalent entry, translated into the caller's
    /// frame, together with the canonical-to-caller unifier used.
    #[allow(clippy::type_complexity)]
    pub fn get(
        &self,
        query: &Query,
    ) -> Result<Option<(Vec<ConceptMap>, Unifier)>, ResolutionError> {
        let Some(entry) = self.find(query)? else {
            return Ok(None);
        };
        let canonical = &self.entries[entry].canonical;
        let from_canonical = unify_queries(canonical, query, Equivalence::Alpha)
            .expect("entry was found by alpha equivalence");
        let answers = self.entries[entry]
            .answers
            .iter()
            .filter_map(|a| from_canonical.apply_answer(a))
            .collect();
        Ok(Some((answers, from_canonical)))
    }

    /// Entries structurally equivalent to `query` (the shape bucket).
    pub fn shape_bucket(&self, query: &Query) -> Vec<EntryId> {
        let hash = query_hash(query, Equivalence::Structural);
        let Some(bucket) = self.structural_index.get(&hash) else {
            return Vec::new();
        };
        bucket
            .iter()
            .copied()
            .filter(|&e| equivalent(&self.entries[e].canonical, query, Equivalence::Structural))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::answer::{Concept, Explanation};
    use crate::pattern::{Atom, Var};
    use syllog_kb::ThingId;

    fn person_query(var: &str) -> Query {
        Query::new(vec![Atom::isa(var, "person")])
    }

    fn answer(var: &str, id: u32) -> ConceptMap {
        ConceptMap::from_bindings(
            [(Var::named(var), Concept::Thing(ThingId::new(id)))],
            Explanation::Lookup,
        )
    }

    #[test]
    fn answers_translate_between_alpha_equivalent_frames() {
        let mut cache = AnswerCache::new();
        cache.record(&person_query("x"), answer("x", 4)).unwrap();

        let (answers, unifier) = cache.get(&person_query("y")).unwrap().unwrap();
        assert_eq!(answers.len(), 1);
        assert_eq!(
            answers[0].get(&Var::named("y")),
            Some(&Concept::Thing(ThingId::new(4)))
        );
        assert_eq!(unifier.apply_var(&Var::named("x")), Var::named("y"));
    }

    #[test]
    fn one_canonical_entry_per_alpha_class() {
        let mut cache = AnswerCache::new();
        let a = cache.entry_of(&person_query("x")).unwrap();
        let b = cache.entry_of(&person_query("other")).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn id_variants_share_a_shape_bucket_but_not_answers() {
        let mut cache = AnswerCache::new();
        let q1 = Query::new(vec![
            Atom::isa("x", "person"),
            Atom::id("x", ThingId::new(1)),
        ]);
        let q2 = Query::new(vec![
            Atom::isa("x", "person"),
            Atom::id("x", ThingId::new(2)),
        ]);
        let e1 = cache.entry_of(&q1).unwrap();
        let e2 = cache.entry_of(&q2).unwrap();
        assert_ne!(e1, e2);

        let bucket = cache.shape_bucket(&q1);
        assert!(bucket.contains(&e1) && bucket.contains(&e2));

        cache.record(&q1, answer("x", 1)).unwrap();
        assert!(cache.get(&q2).unwrap().unwrap().0.is_empty());
    }

    #[test]
    fn duplicate_answers_are_not_double_counted() {
        let mut cache = AnswerCache::new();
        assert!(cache.record(&person_query("x"), answer("x", 4)).unwrap());
        // Same binding through another frame is the same answer.
        assert!(!cache.record(&person_query("z"), answer("z", 4)).unwrap());
        assert_eq!(cache.total_answers(), 1);
    }
}
