use std::collections::BTreeMap;

use proptest::prelude::*;

use syllog_kb::{ThingId, Value};
use syllog_reasoner::unify::{equivalent, query_hash, unify_queries};
use syllog_reasoner::{Atom, Equivalence, Query, Var};

const VARS: [&str; 5] = ["a", "b", "c", "d", "e"];

fn var_name() -> impl Strategy<Value = &'static str> {
    proptest::sample::select(&VARS[..])
}

fn atom() -> impl Strategy<Value = Atom> {
    prop_oneof![
        (var_name(), proptest::sample::select(&["person", "company"][..]))
            .prop_map(|(v, ty)| Atom::isa(v, ty)),
        (var_name(), var_name(), var_name()).prop_map(|(r, x, y)| {
            Atom::relation(r, "bond", &[("src", x), ("dst", y)])
        }),
        (var_name(), "[a-c]{1,3}").prop_map(|(v, s)| {
            Atom::has_value(v, "name", Value::String(s))
        }),
        (var_name(), 0u32..4).prop_map(|(v, id)| Atom::id(v, ThingId::new(id))),
    ]
}

fn query() -> impl Strategy<Value = Query> {
    proptest::collection::vec(atom(), 1..5).prop_map(Query::new)
}

/// A bijective renaming over the whole variable pool.
fn permutation() -> impl Strategy<Value = BTreeMap<Var, Var>> {
    Just(VARS.to_vec()).prop_shuffle().prop_map(|shuffled| {
        VARS.iter()
            .zip(shuffled)
            .map(|(from, to)| (Var::named(*from), Var::named(to)))
            .collect()
    })
}

proptest! {
    /// Atom declaration order never changes a query's identity.
    #[test]
    fn hash_and_equivalence_ignore_atom_order(atoms in proptest::collection::vec(atom(), 1..5)) {
        let shuffled = {
            let mut rev = atoms.clone();
            rev.reverse();
            rev
        };
        let q1 = Query::new(atoms);
        let q2 = Query::new(shuffled);
        prop_assert_eq!(
            query_hash(&q1, Equivalence::Alpha),
            query_hash(&q2, Equivalence::Alpha)
        );
        prop_assert_eq!(
            query_hash(&q1, Equivalence::Structural),
            query_hash(&q2, Equivalence::Structural)
        );
        prop_assert!(equivalent(&q1, &q2, Equivalence::Alpha));
        prop_assert!(equivalent(&q1, &q2, Equivalence::Structural));
    }

    /// Renaming by a bijection and renaming back is the identity up to
    /// alpha-equivalence.
    #[test]
    fn rename_then_invert_is_identity(q in query(), perm in permutation()) {
        let renamed = q.rename(&perm);
        let inverse: BTreeMap<Var, Var> =
            perm.iter().map(|(from, to)| (to.clone(), from.clone())).collect();
        let back = renamed.rename(&inverse);
        prop_assert!(equivalent(&q, &back, Equivalence::Alpha));
        prop_assert!(equivalent(&q, &renamed, Equivalence::Alpha));
    }

    /// A unifier produced between equivalent queries actually maps one onto
    /// the other, and inverts cleanly.
    #[test]
    fn unifiers_translate_between_frames(q in query(), perm in permutation()) {
        let target = q.rename(&perm);
        let unifier = unify_queries(&q, &target, Equivalence::Alpha)
            .expect("renamed query stays alpha-equivalent");
        prop_assert!(equivalent(&unifier.apply_query(&q), &target, Equivalence::Alpha));

        let back = unifier.invert().expect("bijections invert");
        prop_assert!(equivalent(&back.apply_query(&target), &q, Equivalence::Alpha));
    }

    /// Structural equivalence is coarser than alpha: forgetting id values
    /// never separates queries that alpha considers equal.
    #[test]
    fn structural_is_coarser_than_alpha(q1 in query(), q2 in query()) {
        if equivalent(&q1, &q2, Equivalence::Alpha) {
            prop_assert!(equivalent(&q1, &q2, Equivalence::Structural));
        }
    }
}
