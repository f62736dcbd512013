use std::collections::HashMap;

use foldhash::fast::FixedState;
use proptest::prelude::*;
use proptest_derive::Arbitrary;

use crate::BrimMap;

/// Actions to test against both implementations
#[derive(Arbitrary, Debug, Clone)]
enum Action {
    Put(Key, u64),
    Get(Key),
    Remove(Key),
}

/// Wrapper for key generation with a collision-heavy strategy
#[derive(Debug, Clone)]
struct Key(u64);

impl Arbitrary for Key {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        prop_oneof![
            // Tiny range: forces updates, removals of present keys, and
            // re-insertion over tombstones.
            (0u64..64).prop_map(Key),
            // Mid range: exercises growth and window contention.
            (0u64..4096).prop_map(Key),
            // Full range: mostly-absent probes.
            any::<u64>().prop_map(Key),
        ]
        .boxed()
    }
}

/// Test harness that executes actions against BrimMap and a HashMap model
struct Test {
    map: BrimMap<u64, u64>,
    model: HashMap<u64, u64>,
}

impl Test {
    fn new(grow_at_percent: u8) -> Self {
        Test {
            map: BrimMap::with_config(FixedState::with_seed(0xB1B), grow_at_percent),
            model: HashMap::new(),
        }
    }

    fn execute(&mut self, action: Action) {
        match action {
            Action::Put(key, value) => {
                let map_result = self.map.put(key.0, value).expect("allocation failed");
                let model_result = self.model.insert(key.0, value);
                assert_eq!(
                    map_result, model_result,
                    "put mismatch: key={}, value={}",
                    key.0, value
                );
            }
            Action::Get(key) => {
                assert_eq!(
                    self.map.get(&key.0),
                    self.model.get(&key.0),
                    "get mismatch: key={}",
                    key.0
                );
            }
            Action::Remove(key) => {
                assert_eq!(
                    self.map.remove(&key.0),
                    self.model.remove(&key.0),
                    "remove mismatch: key={}",
                    key.0
                );
            }
        }
        assert_eq!(self.map.len(), self.model.len(), "length mismatch");
        assert_eq!(self.map.is_empty(), self.model.is_empty());
    }

    fn finish(self) {
        for (k, v) in &self.model {
            assert_eq!(self.map.get(k), Some(v), "missing key {k} at end");
        }
        assert_eq!(self.map.iter().count(), self.model.len());
        self.map.assert_invariants();
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 256,
        failure_persistence: None,
        ..ProptestConfig::default()
    })]

    #[test]
    fn proptest_vs_hashmap(
        grow_at_percent in 1u8..=100,
        actions in prop::collection::vec(any::<Action>(), 1..128),
    ) {
        let mut test = Test::new(grow_at_percent);
        for action in actions {
            test.execute(action);
        }
        test.finish();
    }
}
