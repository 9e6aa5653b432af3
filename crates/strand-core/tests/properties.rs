//! Property-based read-your-writes checks

use std::collections::HashMap;

use proptest::prelude::*;
use strand_core::testing::setup_test_store;
use strand_core::{PropertyValue, StoreTransaction};

#[derive(Debug, Clone)]
enum Op {
    Add(i32),
    Change(usize, i32),
    Remove(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        any::<i32>().prop_map(Op::Add),
        (any::<usize>(), any::<i32>()).prop_map(|(i, v)| Op::Change(i, v)),
        any::<usize>().prop_map(Op::Remove),
    ]
}

fn visible(tx: &StoreTransaction, node: u64) -> HashMap<u64, PropertyValue> {
    tx.node_load_properties(node, false)
        .unwrap()
        .into_iter()
        .map(|(id, p)| (id, p.value.unwrap()))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_reads_follow_writes(ops in prop::collection::vec(op(), 1..24)) {
        let (store, _ctx) = setup_test_store().unwrap();

        let mut tx = store.begin();
        let key = tx.create_property_key("v").unwrap();
        let node = tx.allocate_node_id().unwrap();
        tx.create_node(node).unwrap();
        let mut model: Vec<(u64, PropertyValue)> = Vec::new();
        for value in [PropertyValue::Int(100), PropertyValue::Long(200)] {
            let prop = tx.node_add_property(node, key, value.clone()).unwrap();
            model.push((prop.id, value));
        }
        tx.prepare().unwrap();
        tx.commit().unwrap();

        let mut tx = store.begin();
        for op in ops {
            match op {
                Op::Add(v) => {
                    let prop = tx.node_add_property(node, key, v).unwrap();
                    model.push((prop.id, PropertyValue::Int(v)));
                }
                Op::Change(i, v) if !model.is_empty() => {
                    let index = i % model.len();
                    tx.node_change_property(node, model[index].0, v).unwrap();
                    model[index].1 = PropertyValue::Int(v);
                }
                Op::Remove(i) if !model.is_empty() => {
                    let index = i % model.len();
                    tx.node_remove_property(node, model[index].0).unwrap();
                    model.remove(index);
                }
                _ => {}
            }
            let expected: HashMap<u64, PropertyValue> = model.iter().cloned().collect();
            prop_assert_eq!(visible(&tx, node), expected);
        }
        tx.prepare().unwrap();
        tx.commit().unwrap();

        let expected: HashMap<u64, PropertyValue> = model.into_iter().collect();
        prop_assert_eq!(visible(&store.begin(), node), expected);
    }
}
