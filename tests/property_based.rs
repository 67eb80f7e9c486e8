//! Property-based tests for the aggregation invariants.
//!
//! For any sequence of parsed stacks: per-table sample counts must add up,
//! functions are credited once per stack, and stack identity is the
//! address sequence alone.

use std::collections::{HashMap, HashSet};

use proptest::prelude::*;

use reloj::aggregator::{Aggregator, MAX_ROOT_DEPTH};
use reloj::backtrace::{ParsedStack, StackFrame};

/// A small address alphabet so random stacks actually collide.
fn arb_stack() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(1u64..6, 1..8)
}

fn arb_stacks() -> impl Strategy<Value = Vec<Vec<u64>>> {
    prop::collection::vec(arb_stack(), 0..40)
}

fn parsed(addresses: &[u64], name_of: impl Fn(u64) -> String) -> ParsedStack {
    ParsedStack {
        thread: "main".to_string(),
        frames: addresses
            .iter()
            .map(|&address| StackFrame {
                address,
                function: name_of(address),
                file: String::new(),
                line: -1,
            })
            .collect(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_stack_counts_sum_to_samples_submitted(stacks in arb_stacks()) {
        let mut aggregator = Aggregator::new();
        for addresses in &stacks {
            aggregator.record(&parsed(addresses, |a| format!("fn_{a}")));
        }

        prop_assert_eq!(aggregator.total_samples(), stacks.len() as u64);
        let sum: u64 = aggregator.stacks().iter().map(|s| s.samples).sum();
        prop_assert_eq!(sum, stacks.len() as u64);

        let distinct: HashSet<&Vec<u64>> = stacks.iter().collect();
        prop_assert_eq!(aggregator.unique_stacks(), distinct.len());
    }

    #[test]
    fn prop_root_counts_match_stacks_deep_enough(stacks in arb_stacks()) {
        let mut aggregator = Aggregator::new();
        for addresses in &stacks {
            aggregator.record(&parsed(addresses, |a| format!("fn_{a}")));
        }

        for depth in 1..MAX_ROOT_DEPTH {
            let sum: u64 = aggregator.roots_at(depth).iter().map(|s| s.samples).sum();
            let deep_enough = stacks.iter().filter(|s| s.len() > depth).count() as u64;
            prop_assert_eq!(sum, deep_enough);
        }
    }

    #[test]
    fn prop_functions_are_credited_once_per_stack(stacks in arb_stacks()) {
        let mut aggregator = Aggregator::new();
        for addresses in &stacks {
            aggregator.record(&parsed(addresses, |a| format!("fn_{a}")));
        }

        // recompute independently: a function's count is the number of
        // stacks it appears in, regardless of recursion
        let mut expected: HashMap<String, u64> = HashMap::new();
        for addresses in &stacks {
            let names: HashSet<String> =
                addresses.iter().map(|a| format!("fn_{a}")).collect();
            for name in names {
                *expected.entry(name).or_insert(0) += 1;
            }
        }

        let actual: HashMap<String, u64> = aggregator
            .functions()
            .iter()
            .map(|f| (f.name.clone(), f.samples))
            .collect();
        prop_assert_eq!(actual, expected);
    }

    #[test]
    fn prop_identity_ignores_symbolization(stacks in arb_stacks()) {
        let mut with_names = Aggregator::new();
        let mut renamed = Aggregator::new();
        for addresses in &stacks {
            with_names.record(&parsed(addresses, |a| format!("fn_{a}")));
            renamed.record(&parsed(addresses, |a| format!("other_{a}")));
        }
        prop_assert_eq!(with_names.unique_stacks(), renamed.unique_stacks());

        let counts = |agg: &Aggregator| -> Vec<u64> {
            agg.stacks().iter().map(|s| s.samples).collect()
        };
        prop_assert_eq!(counts(&with_names), counts(&renamed));
    }

    #[test]
    fn prop_ranked_stacks_descend_with_cold_tail(stacks in arb_stacks()) {
        let mut aggregator = Aggregator::new();
        for addresses in &stacks {
            aggregator.record(&parsed(addresses, |a| format!("fn_{a}")));
        }

        let ranked = aggregator.ranked_stacks();
        for pair in ranked.windows(2) {
            prop_assert!(pair[0].samples >= pair[1].samples);
        }
        prop_assert_eq!(ranked.len(), aggregator.unique_stacks());
    }
}
