//! Resolution executor: memoized backward chaining to a fixpoint.
//!
//! One [`ResolutionContext`] lives for exactly one `resolve()` call. It owns
//! the answer cache, the table of discovered subgoals (the visited set) and
//! the pass counter; nothing here is process-global.
//!
//! ## Shape of the computation
//!
//! Subgoal discovery is a worklist: the top-level plan's steps become goals;
//! every rule applicable to a concludable goal contributes its body plan's
//! steps as further goals. Discovery is memoized per alpha-equivalence
//! class, which terminates cyclic and mutually-recursive rule sets — a goal
//! re-derived along a cycle lands on its existing cache entry instead of
//! recursing.
//!
//! Each **pass** then works the goal table:
//!
//! 1. *Retrievable* goals answer from storage, tagged `Lookup`.
//! 2. *Concludable* goals run each applicable rule: the body join produces
//!    candidate answers, each projected through a head unifier into the
//!    goal frame and recorded with a `Rule` explanation (a *conclusion*).
//! 3. The *compound* top-level join combines step answers left-to-right and
//!    applies `!=`/variable-comparison filters last.
//!
//! Joins are driven by an explicit stack of partial-answer frames, so host
//! stack depth never tracks rule recursion depth. Passes repeat until one
//! records zero new distinct answers; re-joins are **differential** — only
//! answers a step gained since the previous evaluation are recombined with
//! its siblings' full sets, which is equivalent to a full re-join under the
//! answer dedup but much cheaper on recursive rule sets.
//!
//! A goal that is fully id-bound and already has a lookup answer skips rule
//! expansion. A storage failure on a top-level (required) step fails the
//! resolve with the offending fragment; inside a rule branch it merely
//! excludes that branch.

use std::collections::{BTreeSet, VecDeque};

use ahash::AHashSet;

use crate::answer::{Concept, ConceptMap, Explanation};
use crate::cache::{AnswerCache, EntryId};
use crate::error::ResolutionError;
use crate::pattern::{Atom, AtomicQuery, HasValue, Query, Var};
use crate::plan::{self, ResolutionPlan, StepKind};
use crate::rule::RuleIndex;
use crate::store::{bound_value, passes_filter, retrieve, GraphStore, StoreError};
use crate::unify::{unify_queries, Equivalence, MultiUnifier, Unifier};

use syllog_kb::ThingId;

type GoalId = usize;

/// One plan step wired to its canonical cache entry.
#[derive(Debug, Clone)]
struct StepRef {
    goal: GoalId,
    entry: EntryId,
    /// Canonical-frame answers into this plan's frame.
    from_canonical: Unifier,
}

/// A join over cached step answers, evaluated differentially.
#[derive(Debug, Clone)]
struct JoinPlan {
    steps: Vec<StepRef>,
    post_filters: Vec<Atom>,
    /// Per-step answer counts at the previous evaluation.
    marks: Vec<usize>,
    evaluated: bool,
}

/// A rule wired to a concludable goal.
#[derive(Debug, Clone)]
struct AppliedRule {
    label: String,
    head: Atom,
    /// Head-frame to goal-canonical-frame alternatives.
    unifiers: MultiUnifier,
    body: JoinPlan,
}

/// A discovered subgoal: one canonical atomic (or batch) query.
#[derive(Debug)]
struct Goal {
    entry: EntryId,
    kind: StepKind,
    /// Part of the top-level plan; its storage failures are terminal.
    required: bool,
    retrieved: bool,
    expanded: bool,
    /// Set when a storage failure excluded this subgoal.
    failed: Option<String>,
    /// The goal's selectable atom, fixed at expansion time.
    head: Option<Atom>,
    rules: Vec<AppliedRule>,
}

/// Per-call resolution state: cache, goal table, pass counter.
pub struct ResolutionContext<'a, S: GraphStore + ?Sized> {
    store: &'a S,
    rules: &'a RuleIndex,
    cache: AnswerCache,
    goals: Vec<Goal>,
    goal_by_entry: ahash::AHashMap<EntryId, GoalId>,
    pass: usize,
}

impl<'a, S: GraphStore + ?Sized> ResolutionContext<'a, S> {
    fn new(store: &'a S, rules: &'a RuleIndex) -> Self {
        Self {
            store,
            rules,
            cache: AnswerCache::new(),
            goals: Vec::new(),
            goal_by_entry: ahash::AHashMap::new(),
            pass: 0,
        }
    }

    pub fn pass_count(&self) -> usize {
        self.pass
    }

    pub fn cache(&self) -> &AnswerCache {
        &self.cache
    }

    /// Wire a plan's steps into the goal table, creating goals on first
    /// sight of each alpha class.
    fn intern_plan(
        &mut self,
        plan: &ResolutionPlan,
        required: bool,
    ) -> Result<JoinPlan, ResolutionError> {
        let mut steps = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let entry = self.cache.entry_of(&step.query)?;
            let goal = match self.goal_by_entry.get(&entry) {
                Some(&g) => {
                    if required {
                        self.goals[g].required = true;
                    }
                    g
                }
                None => {
                    let g = self.goals.len();
                    self.goals.push(Goal {
                        entry,
                        kind: step.kind,
                        required,
                        retrieved: false,
                        expanded: step.kind == StepKind::Retrievable,
                        failed: None,
                        head: None,
                        rules: Vec::new(),
                    });
                    self.goal_by_entry.insert(entry, g);
                    g
                }
            };
            let from_canonical =
                unify_queries(self.cache.canonical(entry), &step.query, Equivalence::Alpha)
                    .expect("step query is alpha-equivalent to its canonical entry");
            steps.push(StepRef {
                goal,
                entry,
                from_canonical,
            });
        }
        Ok(JoinPlan {
            marks: vec![0; steps.len()],
            steps,
            post_filters: plan.post_filters.clone(),
            evaluated: false,
        })
    }

    /// One full resolution pass. Returns the number of new distinct answers
    /// recorded anywhere in the cache.
    fn run_pass(&mut self) -> Result<usize, ResolutionError> {
        self.pass += 1;
        let mut added = 0usize;

        // Stage A: retrieve and expand until the goal table is closed.
        loop {
            let mut progressed = false;

            for gid in 0..self.goals.len() {
                if self.goals[gid].retrieved || self.goals[gid].failed.is_some() {
                    continue;
                }
                progressed = true;
                let entry = self.goals[gid].entry;
                let canonical = self.cache.canonical(entry).clone();
                match retrieve(self.store, &canonical, &ConceptMap::empty()) {
                    Ok(rows) => {
                        for row in rows {
                            if self.cache.record_canonical(entry, row) {
                                added += 1;
                            }
                        }
                        self.goals[gid].retrieved = true;
                    }
                    Err(source) => {
                        if self.goals[gid].required {
                            return Err(ResolutionError::Storage {
                                fragment: canonical.to_string(),
                                source,
                            });
                        }
                        tracing::warn!(
                            "excluding failed subgoal `{canonical}` from rule expansion: {source}"
                        );
                        self.goals[gid].failed = Some(canonical.to_string());
                        self.goals[gid].retrieved = true;
                    }
                }
            }

            for gid in 0..self.goals.len() {
                let goal = &self.goals[gid];
                if goal.expanded || !goal.retrieved || goal.failed.is_some() {
                    continue;
                }
                progressed = true;
                let entry = goal.entry;
                let canonical = self.cache.canonical(entry).clone();

                // Fully ground goals with a base-fact answer need no rules.
                if canonical.is_fully_bound() && self.cache.answer_count(entry) > 0 {
                    self.goals[gid].expanded = true;
                    continue;
                }

                let atomic = AtomicQuery::try_new(canonical.clone())?;
                let head = atomic.head().clone();
                let mut applied = Vec::new();
                for (rule, unifiers) in self.rules.applicable(&head, self.store.schema()) {
                    let body_plan = plan::plan(rule.when(), self.rules, self.store.schema())?;
                    let body = self.intern_plan(&body_plan, false)?;
                    applied.push(AppliedRule {
                        label: rule.label().to_string(),
                        head: rule.then().clone(),
                        unifiers,
                        body,
                    });
                }
                self.goals[gid].head = Some(head);
                self.goals[gid].rules = applied;
                self.goals[gid].expanded = true;
            }

            if !progressed {
                break;
            }
        }

        // Stage B: conclusions for every concludable goal.
        for gid in 0..self.goals.len() {
            if self.goals[gid].kind != StepKind::Concludable
                || self.goals[gid].failed.is_some()
                || self.goals[gid].rules.is_empty()
            {
                continue;
            }
            let entry = self.goals[gid].entry;
            let canonical = self.cache.canonical(entry).clone();
            let goal_head = match &self.goals[gid].head {
                Some(h) => h.clone(),
                None => continue,
            };

            let mut rules = std::mem::take(&mut self.goals[gid].rules);
            for ar in &mut rules {
                let evaluated = match eval_join(&self.cache, self.store, &self.goals, &ar.body) {
                    Ok(result) => result,
                    Err(source) => {
                        tracing::warn!(
                            "excluding rule `{}` for `{canonical}`: {source}",
                            ar.label
                        );
                        continue;
                    }
                };
                let Some((body_answers, marks)) = evaluated else {
                    continue;
                };
                ar.body.marks = marks;
                ar.body.evaluated = true;

                for body_answer in &body_answers {
                    let conclusions =
                        match conclude(self.store, &canonical, &goal_head, ar, body_answer) {
                            Ok(c) => c,
                            Err(source) => {
                                tracing::warn!(
                                    "dropping conclusion of rule `{}`: {source}",
                                    ar.label
                                );
                                continue;
                            }
                        };
                    for conclusion in conclusions {
                        if self.cache.record_canonical(entry, conclusion) {
                            added += 1;
                        }
                    }
                }
            }
            self.goals[gid].rules = rules;
        }

        tracing::debug!(
            pass = self.pass,
            added,
            goals = self.goals.len(),
            cached = self.cache.total_answers(),
            "resolution pass complete"
        );
        Ok(added)
    }
}

// ============================================================================
// Joins (explicit work stack)
// ============================================================================

/// A pending compound-join frame: the next step to satisfy and the partial
/// answer accumulated so far.
struct JoinFrame {
    step: usize,
    partial: ConceptMap,
}

/// Evaluate a join plan against the cache.
///
/// Returns `None` when one of the steps was excluded by a storage failure.
/// Otherwise yields the distinct results that involve at least one answer
/// newer than the plan's marks (everything, on first evaluation), plus the
/// updated marks.
fn eval_join<S: GraphStore + ?Sized>(
    cache: &AnswerCache,
    store: &S,
    goals: &[Goal],
    jp: &JoinPlan,
) -> Result<Option<(Vec<ConceptMap>, Vec<usize>)>, StoreError> {
    if jp.steps.iter().any(|s| goals[s.goal].failed.is_some()) {
        return Ok(None);
    }
    let counts: Vec<usize> = jp.steps.iter().map(|s| cache.answer_count(s.entry)).collect();

    let mut seen: AHashSet<ConceptMap> = AHashSet::new();
    let mut out: Vec<ConceptMap> = Vec::new();

    let mut run = |delta_at: Option<usize>| -> Result<(), StoreError> {
        let mut stack = vec![JoinFrame {
            step: 0,
            partial: ConceptMap::empty(),
        }];
        while let Some(frame) = stack.pop() {
            if frame.step == jp.steps.len() {
                let mut keep = true;
                for filter in &jp.post_filters {
                    if !passes_filter(store, &frame.partial, filter)? {
                        keep = false;
                        break;
                    }
                }
                if keep && seen.insert(frame.partial.clone()) {
                    out.push(frame.partial);
                }
                continue;
            }
            let sref = &jp.steps[frame.step];
            let answers = cache.answers(sref.entry);
            let slice = match delta_at {
                Some(d) if d == frame.step => &answers[jp.marks[frame.step]..counts[frame.step]],
                _ => &answers[..counts[frame.step]],
            };
            for answer in slice {
                let Some(translated) = sref.from_canonical.apply_answer(answer) else {
                    continue;
                };
                if let Some(merged) = frame.partial.merge(&translated) {
                    stack.push(JoinFrame {
                        step: frame.step + 1,
                        partial: merged,
                    });
                }
            }
        }
        Ok(())
    };

    if !jp.evaluated {
        run(None)?;
    } else {
        for d in 0..jp.steps.len() {
            if counts[d] > jp.marks[d] {
                run(Some(d))?;
            }
        }
    }

    Ok(Some((out, counts)))
}

// ============================================================================
// Conclusions
// ============================================================================

/// Locate a stored relation instance with exactly these role-player pairs.
fn find_stored_relation<S: GraphStore + ?Sized>(
    store: &S,
    type_name: &str,
    pairs: &[(String, ThingId)],
) -> Result<Option<ThingId>, StoreError> {
    let Some((role, player)) = pairs.first() else {
        return Ok(None);
    };
    let mut wanted: Vec<(String, ThingId)> = pairs.to_vec();
    wanted.sort();
    for candidate in store.relations_with_player(*player, Some(role.as_str()))? {
        let type_ok = store
            .type_of(candidate)?
            .map(|t| t == type_name)
            .unwrap_or(false);
        if !type_ok {
            continue;
        }
        let mut actual = store.players(candidate)?;
        actual.sort();
        if actual == wanted {
            return Ok(Some(candidate));
        }
    }
    Ok(None)
}

/// Turn one rule-body answer into conclusions for a goal, one per viable
/// head unifier.
fn conclude<S: GraphStore + ?Sized>(
    store: &S,
    goal_canonical: &Query,
    goal_head: &Atom,
    ar: &AppliedRule,
    body_answer: &ConceptMap,
) -> Result<Vec<ConceptMap>, StoreError> {
    let mut out = Vec::new();

    'unifiers: for unifier in ar.unifiers.iter() {
        let Some(mut projected) = unifier.apply_answer(body_answer) else {
            continue;
        };

        // Head-kind specific reconciliation between what the rule produced
        // and what the goal asked for.
        match (&ar.head, goal_head) {
            (Atom::Has(h), Atom::Has(g)) => {
                let produced = match &h.value {
                    HasValue::Const(v) => Some(v.clone()),
                    HasValue::Var(hv) => bound_value(store, body_answer, hv)?,
                };
                let Some(produced) = produced else {
                    continue;
                };
                match &g.value {
                    HasValue::Const(gv) => {
                        if *gv != produced {
                            continue;
                        }
                    }
                    HasValue::Var(gv) => {
                        if !projected.contains(gv) {
                            let concept = match store
                                .attribute_by_value(&h.attribute_type, &produced)?
                            {
                                Some(attr) => Concept::Thing(attr),
                                None => Concept::Value(produced.clone()),
                            };
                            let Some(bound) = projected.bind(gv.clone(), concept) else {
                                continue;
                            };
                            projected = bound;
                        }
                    }
                }
            }
            (Atom::Relation(h), Atom::Relation(g)) => {
                // Bind the goal's relation variable when the derived
                // instance already exists in storage (e.g. materialized by
                // an earlier call); otherwise it stays unbound until
                // materialization.
                if !projected.contains(&g.relation) {
                    let mut pairs: Vec<(String, ThingId)> = Vec::new();
                    let mut complete = !g.players.is_empty();
                    for p in &g.players {
                        let (Some(role), Some(Concept::Thing(id))) =
                            (&p.role, projected.get(&p.player))
                        else {
                            complete = false;
                            break;
                        };
                        pairs.push((role.clone(), *id));
                    }
                    if complete {
                        let derived_type = h.type_name.as_deref().or(g.type_name.as_deref());
                        if let Some(ty) = derived_type {
                            if let Some(stored) = find_stored_relation(store, ty, &pairs)? {
                                let Some(bound) =
                                    projected.bind(g.relation.clone(), Concept::Thing(stored))
                                else {
                                    continue;
                                };
                                projected = bound;
                            }
                        }
                    }
                }
            }
            _ => {}
        }

        // The goal's own constraints gate the conclusion.
        for (var, id) in goal_canonical.id_constraints() {
            match projected.get(&var) {
                Some(Concept::Thing(t)) if *t == id => {}
                Some(_) => continue 'unifiers,
                None => {
                    let Some(bound) = projected.bind(var, Concept::Thing(id)) else {
                        continue 'unifiers;
                    };
                    projected = bound;
                }
            }
        }
        for atom in goal_canonical.atoms() {
            if matches!(atom, Atom::Value(_)) && !passes_filter(store, &projected, atom)? {
                continue 'unifiers;
            }
        }

        out.push(projected.with_explanation(Explanation::Rule {
            rule: ar.label.clone(),
            unifier: unifier.pairs(),
            inner: vec![body_answer.clone()],
        }));
    }

    Ok(out)
}

// ============================================================================
// Public surface
// ============================================================================

/// Lazily resolved answers, pass by pass. Dropping the iterator tears down
/// the whole pending subgoal tree (the context owns all of it); ceasing to
/// pull is cancellation.
pub struct AnswerIter<'a, S: GraphStore + ?Sized> {
    ctx: ResolutionContext<'a, S>,
    top: JoinPlan,
    selected: BTreeSet<Var>,
    fragment: String,
    delivered: AHashSet<ConceptMap>,
    pending: VecDeque<ConceptMap>,
    done: bool,
}

impl<'a, S: GraphStore + ?Sized> AnswerIter<'a, S> {
    /// Passes run so far; useful for termination assertions.
    pub fn passes(&self) -> usize {
        self.ctx.pass_count()
    }
}

impl<'a, S: GraphStore + ?Sized> Iterator for AnswerIter<'a, S> {
    type Item = Result<ConceptMap, ResolutionError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(answer) = self.pending.pop_front() {
                return Some(Ok(answer));
            }
            if self.done {
                return None;
            }

            let added = match self.ctx.run_pass() {
                Ok(n) => n,
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            };

            match eval_join(&self.ctx.cache, self.ctx.store, &self.ctx.goals, &self.top) {
                Ok(Some((rows, marks))) => {
                    self.top.marks = marks;
                    self.top.evaluated = true;
                    for row in rows {
                        // A derived answer that leaves a selected variable
                        // unbound (an unmaterialized instance) has no answer
                        // shape to deliver.
                        if !self.selected.iter().all(|v| row.contains(v)) {
                            continue;
                        }
                        let shaped = row.project(&self.selected);
                        if self.delivered.insert(shaped.clone()) {
                            self.pending.push_back(shaped);
                        }
                    }
                }
                Ok(None) => {
                    self.done = true;
                }
                Err(source) => {
                    self.done = true;
                    return Some(Err(ResolutionError::Storage {
                        fragment: self.fragment.clone(),
                        source,
                    }));
                }
            }

            if added == 0 {
                // Quiescent: the pass discovered nothing new anywhere.
                self.done = true;
            }
        }
    }
}

/// Resolve a compound query: every answer either stored or derivable by
/// rules, deduplicated, with provenance attached.
pub fn resolve<'a, S: GraphStore + ?Sized>(
    store: &'a S,
    rules: &'a RuleIndex,
    query: &Query,
) -> Result<AnswerIter<'a, S>, ResolutionError> {
    let top_plan = plan::plan(query, rules, store.schema())?;
    let mut ctx = ResolutionContext::new(store, rules);
    let top = ctx.intern_plan(&top_plan, true)?;
    Ok(AnswerIter {
        ctx,
        top,
        selected: query.selected().clone(),
        fragment: query.to_string(),
        delivered: AHashSet::new(),
        pending: VecDeque::new(),
        done: false,
    })
}

/// Eagerly collect every answer of [`resolve`].
pub fn resolve_all<S: GraphStore + ?Sized>(
    store: &S,
    rules: &RuleIndex,
    query: &Query,
) -> Result<Vec<ConceptMap>, ResolutionError> {
    resolve(store, rules, query)?.collect()
}
