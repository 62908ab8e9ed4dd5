//! Property tests: the store against a `HashMap` model.

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use tierstore::config::StoreConfig;
use tierstore::pool::{BoundedPool, PoolAccessor, PoolRegion};
use tierstore::tier::MemoryTier;
use tierstore::{DefaultComparator, Element, FactoryId, StoreParts, TierFactory, TieredStore};

#[derive(Debug, Clone)]
enum Op {
    Put(u16, u32),
    PutIfAbsent(u16, u32),
    Remove(u16),
    Replace(u16, u32),
    ReplaceIf(u16, u32, u32),
    Get(u16),
    Spill(u16),
    FaultIn(u16),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u16..64, any::<u32>()).prop_map(|(k, v)| Op::Put(k, v)),
        (0u16..64, any::<u32>()).prop_map(|(k, v)| Op::PutIfAbsent(k, v)),
        (0u16..64).prop_map(Op::Remove),
        (0u16..64, any::<u32>()).prop_map(|(k, v)| Op::Replace(k, v)),
        (0u16..64, 0u32..4, any::<u32>()).prop_map(|(k, old, v)| Op::ReplaceIf(k, old, v)),
        (0u16..64).prop_map(Op::Get),
        (0u16..64).prop_map(Op::Spill),
        (0u16..64).prop_map(Op::FaultIn),
    ]
}

fn element(key: u16, value: u32) -> Element<u16, u32> {
    Element::with_size(key, value, 4)
}

fn tiered_store(segments: usize) -> TieredStore<u16, u32> {
    let tier = TierFactory::new(
        FactoryId::new(1),
        Arc::new(MemoryTier::<u16, u32>::new()),
        Arc::new(BoundedPool::unbounded(PoolRegion::OnDisk)),
    )
    .unwrap();
    let parts = StoreParts::new().with_tier(Arc::new(tier));
    let config = StoreConfig::new()
        .with_segments(segments)
        .with_initial_capacity(1);
    TieredStore::init_with_parts(config, parts, None).unwrap()
}

proptest! {
    #[cfg_attr(miri, ignore)]
    #[test]
    fn prop_store_matches_model(
        segments in 1usize..8,
        ops in prop::collection::vec(op_strategy(), 0..200)
    ) {
        let store = tiered_store(segments);
        let mut model: HashMap<u16, u32> = HashMap::new();

        for op in ops {
            match op {
                Op::Put(k, v) => {
                    let previous = store.put(element(k, v)).unwrap().map(|e| *e.value());
                    prop_assert_eq!(previous, model.insert(k, v));
                }
                Op::PutIfAbsent(k, v) => {
                    let kept = store.put_if_absent(element(k, v)).unwrap().map(|e| *e.value());
                    prop_assert_eq!(kept, model.get(&k).copied());
                    model.entry(k).or_insert(v);
                }
                Op::Remove(k) => {
                    let removed = store.remove(&k).unwrap().map(|e| *e.value());
                    prop_assert_eq!(removed, model.remove(&k));
                }
                Op::Replace(k, v) => {
                    let previous = store.replace(element(k, v)).unwrap().map(|e| *e.value());
                    let expected = model.get_mut(&k).map(|slot| std::mem::replace(slot, v));
                    prop_assert_eq!(previous, expected);
                }
                Op::ReplaceIf(k, old, v) => {
                    let swapped = store
                        .replace_element(&element(k, old), element(k, v), &DefaultComparator)
                        .unwrap();
                    let expected = model.get(&k) == Some(&old);
                    if expected {
                        model.insert(k, v);
                    }
                    prop_assert_eq!(swapped, expected);
                }
                Op::Get(k) => {
                    let value = store.get(&k).unwrap().map(|e| *e.value());
                    prop_assert_eq!(value, model.get(&k).copied());
                }
                Op::Spill(k) => {
                    store.spill(&k).unwrap();
                }
                Op::FaultIn(k) => {
                    store.fault_in(&k).unwrap();
                }
            }
            prop_assert_eq!(store.size(), model.len());
        }

        prop_assert_eq!(store.on_heap_count() + store.on_disk_count(), model.len());
        let mut keys = store.keys();
        keys.sort_unstable();
        let mut expected: Vec<u16> = model.keys().copied().collect();
        expected.sort_unstable();
        prop_assert_eq!(keys, expected);
    }

    #[cfg_attr(miri, ignore)]
    #[test]
    fn prop_bounded_store_never_exceeds_max(
        segments in 1usize..16,
        max_size in 1usize..32,
        keys in prop::collection::vec(0u16..256, 0..300)
    ) {
        let config = StoreConfig::new()
            .with_segments(segments)
            .with_max_size(max_size)
            .with_max_eviction_rounds(max_size);
        let store: TieredStore<u16, u32> = TieredStore::init(config, None).unwrap();
        for k in keys {
            store.put(element(k, u32::from(k))).unwrap();
            prop_assert!(store.size() <= max_size);
            prop_assert!(store.contains_key(&k));
            prop_assert_eq!(store.heap_pool().size(), store.size() as u64 * 4);
        }
    }
}
