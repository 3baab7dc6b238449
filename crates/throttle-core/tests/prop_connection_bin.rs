//! Property tests: connection bin counters stay consistent under any sequence
//! of grants, returns and destroys.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::collection::vec;
use proptest::prelude::*;
use throttle_core::bins::{ConnectionBin, PooledDecision};
use throttle_core::{BinSet, ConnectionSource, Deadline, LocalServiceRegistry, ThrottleError};

#[derive(Debug, Clone, Copy)]
enum Op {
    /// Ask for a connection without blocking; commit or undo a creation grant.
    Acquire { commit: bool },
    ReturnToPool,
    Destroy,
    CheckPooled { accept: bool },
    SetMax(u32),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => any::<bool>().prop_map(|commit| Op::Acquire { commit }),
        2 => Just(Op::ReturnToPool),
        2 => Just(Op::Destroy),
        1 => any::<bool>().prop_map(|accept| Op::CheckPooled { accept }),
        1 => (1u32..5).prop_map(Op::SetMax),
    ]
}

/// Connections the caller holds outside the pool, and connections pooled.
#[derive(Debug, Default)]
struct Model {
    held: u32,
    pooled: u32,
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn counters_are_conserved(max in 1u32..5, ops in vec(op(), 1..80)) {
        let bin = ConnectionBin::new(Arc::new(LocalServiceRegistry::new()), "g", "h", max).unwrap();
        let pool = AtomicUsize::new(0);
        let mut model = Model::default();
        let mut max = max;

        for op in ops {
            match op {
                Op::Acquire { commit } => {
                    let now = Deadline::after(Duration::ZERO);
                    match bin.wait_connection_available(&pool, Some(&now)) {
                        Ok(ConnectionSource::FromPool) => {
                            model.pooled -= 1;
                            model.held += 1;
                        }
                        Ok(ConnectionSource::FromCreation) => {
                            prop_assert_eq!(model.pooled, 0);
                            if commit {
                                bin.note_connection_creation();
                                model.held += 1;
                            } else {
                                bin.undo_reservation(ConnectionSource::FromCreation, &pool);
                            }
                        }
                        Ok(ConnectionSource::FromNowhere) => prop_assert!(false, "bin is alive"),
                        Err(e) => {
                            prop_assert!(matches!(e, ThrottleError::TimedOut));
                            prop_assert_eq!(model.pooled, 0);
                            prop_assert!(model.held >= max);
                        }
                    }
                }
                Op::ReturnToPool if model.held > 0 => {
                    bin.note_connection_returned_to_pool(&pool);
                    model.held -= 1;
                    model.pooled += 1;
                }
                Op::Destroy if model.held > 0 => {
                    bin.note_connection_destroyed();
                    model.held -= 1;
                }
                Op::CheckPooled { accept } => match bin.should_pooled_connection_be_destroyed(&pool) {
                    PooledDecision::PoolEmpty => prop_assert_eq!(model.pooled, 0),
                    PooledDecision::Destroy | PooledDecision::WithinBounds => {
                        if accept {
                            bin.note_connection_destroyed();
                            model.pooled -= 1;
                        } else {
                            bin.undo_pooled_connection_decision(&pool);
                        }
                    }
                },
                Op::SetMax(m) => {
                    bin.update_max_active_connections(m);
                    max = m;
                }
                Op::ReturnToPool | Op::Destroy => {}
            }

            let stats = bin.stats();
            prop_assert_eq!(stats.reserved, 0);
            prop_assert_eq!(stats.in_use, model.held + model.pooled);
            prop_assert_eq!(pool.load(Ordering::Acquire), model.pooled as usize);
            prop_assert_eq!(stats.referencing_pools, u32::from(model.pooled > 0));
            prop_assert_eq!(stats.local_max, max);
        }
    }

    #[test]
    fn bin_sets_ignore_order_and_duplicates(names in vec("[a-d]{1,2}", 0..8)) {
        let forward = BinSet::new(names.iter().cloned());
        let backward = BinSet::new(names.iter().rev().cloned());
        prop_assert_eq!(&forward, &backward);

        let slice = forward.as_slice();
        prop_assert!(slice.windows(2).all(|w| w[0] < w[1]));
        for n in &names {
            prop_assert!(slice.contains(n));
        }
    }
}
