// (c) Meta Platforms, Inc. and affiliates. Confidential and proprietary.

//! Macros for generating simulator-based test suites

#[macro_export]
macro_rules! gen_test {
    // Tests that accept a fixture.
    // We assume tests:
    //  - use run_test_* naming,
    //  - return Result<T> for some T, and
    //  - are exported from the scenarios module.
    ($test_name:ident, $suffix:ident, $fixture:ty) => {
        paste::paste! {
            #[test]
            fn [<$test_name _ $suffix>]() {
                use $crate::fixtures::SpikeTestFixture;
                use $crate::fixtures::SimulatorFixture;
                use rand::Rng;
                let seed: u64 = rand::thread_rng().r#gen();
                let simulator = $crate::simulator::Simulator::new(seed);
                let fixture = <$fixture as SimulatorFixture>::new(simulator);
                let env_rc = fixture.get_env();
                let handle = env_rc.spawn(async move {
                    $crate::scenarios::[<run_ $test_name>](&fixture).await
                });
                env_rc.run();
                $crate::futures::executor::block_on(handle).expect("Test scenario should complete successfully").unwrap();
            }
        }
    };
    // Tests that create fixtures internally.
    // Same assumptions as above.
    ($test_name:ident, $suffix:ident, $fixture:ty, no_fixture) => {
        paste::paste! {
            #[test]
            fn [<$test_name _ $suffix>]() {
                $crate::scenarios::[<run_ $test_name>]::<$fixture>().unwrap();
            }
        }
    };
}

/// Macro to generate the store, lock and strategy suites for a store backend.
///
/// # Usage
/// ```ignore
/// spike_store_tests!(InMemoryStoreFixture, in_memory);
/// ```
///
/// This generates test functions like:
/// - `test_watch_detects_concurrent_write_in_memory`
/// - `test_lock_reentrancy_in_memory`
/// - `test_locked_never_oversells_in_memory`
#[macro_export]
macro_rules! spike_store_tests {
    ($fixture:ty, $suffix:ident) => {
        $crate::gen_test!(test_get_set, $suffix, $fixture);
        $crate::gen_test!(test_exec_commits_queued_ops, $suffix, $fixture);
        $crate::gen_test!(test_watch_detects_concurrent_write, $suffix, $fixture);
        $crate::gen_test!(test_discard_applies_nothing, $suffix, $fixture);
        $crate::gen_test!(test_transaction_protocol_errors, $suffix, $fixture);
        $crate::gen_test!(test_lease_exclusion, $suffix, $fixture);

        $crate::gen_test!(test_lock_reentrancy, $suffix, $fixture);
        $crate::gen_test!(test_lock_wait_timeout, $suffix, $fixture);
        $crate::gen_test!(test_waiter_acquires_after_release, $suffix, $fixture);
        $crate::gen_test!(test_explicit_lease_expires, $suffix, $fixture);
        $crate::gen_test!(test_watchdog_extends_lease, $suffix, $fixture);
        $crate::gen_test!(test_dropped_guard_releases, $suffix, $fixture);
        $crate::gen_test!(test_release_without_hold, $suffix, $fixture);

        $crate::gen_test!(test_locked_never_oversells, $suffix, $fixture);
        $crate::gen_test!(test_locked_reentrant_depth, $suffix, $fixture);
        $crate::gen_test!(test_locked_timeout_outcome, $suffix, $fixture);
        $crate::gen_test!(test_optimistic_never_oversells, $suffix, $fixture);
        $crate::gen_test!(test_optimistic_abort_keeps_concurrent_write, $suffix, $fixture);
        $crate::gen_test!(test_direct_matches_watched, $suffix, $fixture);
        $crate::gen_test!(test_strategies_reject_bad_counter, $suffix, $fixture);
    };
}

/// Macro to generate the RPC-level suite for a fixture that also implements
/// `SpikeServiceFixture`.
#[macro_export]
macro_rules! spike_service_tests {
    ($fixture:ty, $suffix:ident) => {
        $crate::gen_test!(test_initialize_and_status, $suffix, $fixture);
        $crate::gen_test!(test_locked_burst_sells_out, $suffix, $fixture);
        $crate::gen_test!(test_every_strategy_decrements, $suffix, $fixture);
        $crate::gen_test!(test_sold_out_is_not_an_error, $suffix, $fixture);
        $crate::gen_test!(test_reinitialize_resets_successes, $suffix, $fixture);
        $crate::gen_test!(test_reduce_rejects_unspecified_strategy, $suffix, $fixture);
        $crate::gen_test!(test_status_before_initialize, $suffix, $fixture);
    };
}
