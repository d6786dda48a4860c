//! Stress tests for concurrent routing slips.
//!
//! Many slips share the same hosts, publisher and tracker here; each one must
//! still run and unwind in isolation.

#[cfg(test)]
mod stress_tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use tokio::sync::broadcast::error::RecvError;

    use crate::builder::RoutingSlipBuilder;
    use crate::config::Config;
    use crate::core::{Address, TrackingNumber};
    use crate::engine::{EngineBuilder, EngineHandle};
    use crate::events::{RoutingSlipCompleted, RoutingSlipEvent};
    use crate::slip::RoutingSlip;
    use crate::state::RoutingSlipState;
    use crate::subscription::{EventKind, RoutingSlipEvents};
    use crate::testing::{CallKind, CallLog, EventCollector, ScriptedActivity};
    use crate::tracker::RoutingSlipTracker;
    use crate::transport::InMemoryTransport;
    use crate::variables::Variables;

    // ==========================================================================
    // Helpers
    // ==========================================================================

    fn slip_of(handle: &EngineHandle, names: &[&str]) -> RoutingSlip {
        let mut builder = RoutingSlipBuilder::default();
        for name in names {
            builder.add_activity(*name, handle.execute_address(name).unwrap());
        }
        builder.build().unwrap()
    }

    async fn start(builder: EngineBuilder) -> Arc<EngineHandle> {
        Arc::new(builder.build().unwrap().start().await.unwrap())
    }

    fn completed(tracking_number: TrackingNumber) -> RoutingSlipEvent {
        RoutingSlipEvent::Completed(RoutingSlipCompleted {
            tracking_number,
            timestamp: Utc::now(),
            duration: Duration::from_millis(1),
            variables: Variables::new(),
        })
    }

    // ==========================================================================
    // TEST: Concurrent slips each reach their own terminal state
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_slips_complete_or_fault_independently() {
        let calls = CallLog::new();
        let handle = start(
            EngineBuilder::new()
                .with_activity("A", ScriptedActivity::new("A", &calls))
                .with_activity("B", ScriptedActivity::new("B", &calls))
                .with_execute_activity("Fail", ScriptedActivity::new("Fail", &calls).faulting()),
        )
        .await;

        let mut tasks = Vec::new();
        for i in 0..200 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                let faulting = i % 3 == 0;
                let names: &[&str] = if faulting {
                    &["A", "B", "Fail"]
                } else {
                    &["A", "B"]
                };
                let instance = handle
                    .execute_and_await_timeout(slip_of(&handle, names), Duration::from_secs(10))
                    .await
                    .unwrap();
                (faulting, instance)
            }));
        }

        let mut faulted = 0;
        for task in tasks {
            let (faulting, instance) = task.await.unwrap();
            if faulting {
                faulted += 1;
                assert_eq!(instance.state, RoutingSlipState::Faulted);
                assert_eq!(instance.completed, vec!["A", "B"]);
                assert_eq!(instance.compensated, vec!["B", "A"]);
                let compensated: Vec<String> = calls
                    .for_slip(instance.tracking_number)
                    .into_iter()
                    .filter(|call| call.kind == CallKind::Compensate)
                    .map(|call| call.activity)
                    .collect();
                assert_eq!(compensated, vec!["B", "A"], "slip unwound someone else's log");
            } else {
                assert_eq!(instance.state, RoutingSlipState::Completed);
                assert_eq!(instance.completed, vec!["A", "B"]);
                assert!(instance.compensated.is_empty());
            }
        }

        assert_eq!(faulted, 67);
        assert!(
            handle.tracker().is_empty(),
            "awaited slips should not stay tracked, {} left",
            handle.tracker().len()
        );
        handle.abort();
    }

    // ==========================================================================
    // TEST: A host limited to one message at a time drains its queue
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_single_concurrency_host_processes_every_slip() {
        let calls = CallLog::new();
        let config = Config {
            host_concurrency: 1,
            ..Config::default()
        };
        let handle = start(
            EngineBuilder::new()
                .with_config(config)
                .with_activity(
                    "Slow",
                    ScriptedActivity::new("Slow", &calls).with_delay(Duration::from_millis(2)),
                )
                .with_activity("Fast", ScriptedActivity::new("Fast", &calls)),
        )
        .await;

        let mut tasks = Vec::new();
        for _ in 0..50 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle
                    .execute_and_await_timeout(
                        slip_of(&handle, &["Slow", "Fast"]),
                        Duration::from_secs(10),
                    )
                    .await
            }));
        }

        for task in tasks {
            let instance = task.await.unwrap().unwrap();
            assert_eq!(instance.state, RoutingSlipState::Completed);
        }
        assert_eq!(calls.len(), 100);
        handle.abort();
    }

    // ==========================================================================
    // TEST: Events of one slip stay in step order under load
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_slip_event_order_under_load() {
        let transport = InMemoryTransport::shared();
        let observer = Address::endpoint("loopback://localhost", "observer").unwrap();
        let collector = EventCollector::connect(transport.as_ref(), observer.clone())
            .await
            .unwrap();
        let calls = CallLog::new();
        let handle = start(
            EngineBuilder::new()
                .with_transport(transport.clone())
                .with_activity(
                    "A",
                    ScriptedActivity::new("A", &calls)
                        .with_delay(Duration::from_millis(fastrand::u64(0..3))),
                )
                .with_activity("B", ScriptedActivity::new("B", &calls))
                .with_execute_activity("Fail", ScriptedActivity::new("Fail", &calls).faulting()),
        )
        .await;

        let mut tracking_numbers = Vec::new();
        for i in 0..50 {
            let mut builder = RoutingSlipBuilder::default();
            builder.add_activity("A", handle.execute_address("A").unwrap());
            builder.add_activity("B", handle.execute_address("B").unwrap());
            if i % 2 == 1 {
                builder.add_activity("Fail", handle.execute_address("Fail").unwrap());
            }
            builder.add_subscription(observer.clone(), RoutingSlipEvents::ALL);
            let slip = builder.build().unwrap();
            tracking_numbers.push((i % 2 == 1, slip.tracking_number()));
            handle.execute(slip).await.unwrap();
        }

        for (faulting, tracking_number) in tracking_numbers {
            collector
                .wait_for_terminal(tracking_number, Duration::from_secs(10))
                .await
                .unwrap();
            let kinds: Vec<EventKind> = collector
                .events_for(tracking_number)
                .iter()
                .map(RoutingSlipEvent::kind)
                .collect();
            let expected = if faulting {
                vec![
                    EventKind::ActivityCompleted,
                    EventKind::ActivityCompleted,
                    EventKind::ActivityFaulted,
                    EventKind::ActivityCompensated,
                    EventKind::ActivityCompensated,
                    EventKind::Faulted,
                ]
            } else {
                vec![
                    EventKind::ActivityCompleted,
                    EventKind::ActivityCompleted,
                    EventKind::Completed,
                ]
            };
            assert_eq!(kinds, expected, "events out of order for {tracking_number}");
        }
        handle.abort();
    }

    // ==========================================================================
    // TEST: A lagging bus receiver does not stall awaited slips
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_lagging_bus_receiver_does_not_block_tracking() {
        let calls = CallLog::new();
        let config = Config {
            event_bus_capacity: 2,
            ..Config::default()
        };
        let handle = start(
            EngineBuilder::new()
                .with_config(config)
                .with_activity("A", ScriptedActivity::new("A", &calls))
                .with_activity("B", ScriptedActivity::new("B", &calls)),
        )
        .await;

        // Never read until the end
        let mut idle = handle.bus().subscribe();

        for _ in 0..20 {
            let instance = handle
                .execute_and_await_timeout(slip_of(&handle, &["A", "B"]), Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(instance.state, RoutingSlipState::Completed);
        }

        assert!(matches!(idle.recv().await, Err(RecvError::Lagged(_))));
        handle.abort();
    }

    // ==========================================================================
    // TEST: Terminal notification racing the waiter is never lost
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tracker_terminal_notification_race() {
        let tracker = Arc::new(RoutingSlipTracker::new());
        let finished = Arc::new(AtomicUsize::new(0));

        for _ in 0..500 {
            let tracking_number = TrackingNumber::new();
            tracker.register(tracking_number);

            let observer = {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    if fastrand::bool() {
                        tokio::task::yield_now().await;
                    }
                    tracker.observe(&completed(tracking_number));
                })
            };

            let instance = tracker
                .wait_for_terminal(tracking_number, Duration::from_secs(2))
                .await
                .unwrap();
            assert_eq!(instance.state, RoutingSlipState::Completed);
            finished.fetch_add(1, Ordering::SeqCst);

            observer.await.unwrap();
            tracker.forget(tracking_number);
        }

        assert_eq!(finished.load(Ordering::SeqCst), 500);
        assert!(tracker.is_empty());
    }

    // ==========================================================================
    // TEST: Many waiters on one slip are all released
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_many_waiters_released_by_one_terminal_event() {
        let tracker = Arc::new(RoutingSlipTracker::new());
        let tracking_number = TrackingNumber::new();
        tracker.register(tracking_number);

        let mut waiters = Vec::new();
        for _ in 0..32 {
            let tracker = tracker.clone();
            waiters.push(tokio::spawn(async move {
                tracker
                    .wait_for_terminal(tracking_number, Duration::from_secs(5))
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.observe(&completed(tracking_number));

        for waiter in waiters {
            let instance = waiter.await.unwrap().unwrap();
            assert_eq!(instance.state, RoutingSlipState::Completed);
        }
    }
}
