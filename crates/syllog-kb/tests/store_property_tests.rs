use proptest::prelude::*;

use syllog_kb::{KnowledgeGraph, TypeIndex, Value, ValueKind};

fn scored_schema() -> TypeIndex {
    let mut schema = TypeIndex::new();
    schema.define_entity_type("node", None).unwrap();
    schema.define_entity_type("leaf", Some("node")).unwrap();
    schema
        .define_attribute_type("score", None, ValueKind::Long)
        .unwrap();
    schema.define_owns("node", "score").unwrap();
    schema
}

proptest! {
    /// Attribute instances are canonical: however often a value is inserted,
    /// one thing per distinct value exists and lookups return it.
    #[test]
    fn attribute_instances_are_canonical(values in proptest::collection::vec(-8i64..8, 1..40)) {
        let mut g = KnowledgeGraph::new(scored_schema());
        let mut firsts = std::collections::HashMap::new();
        for v in &values {
            let id = g.insert_attribute("score", Value::Long(*v)).unwrap();
            let prior = firsts.entry(*v).or_insert(id);
            prop_assert_eq!(*prior, id);
            prop_assert_eq!(g.attribute_by_value("score", &Value::Long(*v)), Some(id));
        }
        let distinct: std::collections::HashSet<_> = values.iter().collect();
        prop_assert_eq!(g.thing_count(), distinct.len());
    }

    /// The subtype-closed type scan equals the union of the direct scans.
    #[test]
    fn type_closure_is_the_union_of_direct_scans(kinds in proptest::collection::vec(any::<bool>(), 1..30)) {
        let mut g = KnowledgeGraph::new(scored_schema());
        for is_leaf in &kinds {
            let ty = if *is_leaf { "leaf" } else { "node" };
            g.insert_entity(ty).unwrap();
        }
        let direct_node = g.things_of_type("node", false);
        let direct_leaf = g.things_of_type("leaf", false);
        let closed = g.things_of_type("node", true);
        prop_assert_eq!(closed.len(), direct_node.len() + direct_leaf.len());
        prop_assert_eq!(closed, direct_node | direct_leaf);
    }

    /// Ownership stays symmetric between the forward and backward indexes.
    #[test]
    fn ownership_indexes_agree(edges in proptest::collection::vec((0u32..6, -4i64..4), 0..30)) {
        let mut g = KnowledgeGraph::new(scored_schema());
        let owners: Vec<_> = (0..6).map(|_| g.insert_entity("node").unwrap()).collect();
        for (owner_idx, value) in &edges {
            let attr = g.insert_attribute("score", Value::Long(*value)).unwrap();
            g.insert_has(owners[*owner_idx as usize], attr).unwrap();
        }
        for owner in &owners {
            for attr in g.attributes_of(*owner, Some("score")) {
                prop_assert!(g.owners_of(attr).contains(owner));
                prop_assert!(g.has_edge(*owner, attr));
            }
        }
    }
}
