//! Saga Transaction Tests
//! Step ordering, reverse compensation, timeouts and aborts

use orchestration_core::resilience::{CircuitBreaker, CircuitBreakerOptions, CircuitState};
use orchestration_core::transaction::{
    SagaTransaction, TransactionError, TransactionEvent, TransactionOptions, TransactionState,
    TransactionStep,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[cfg(test)]
mod saga_tests {
    use super::*;

    type Journal = Arc<Mutex<Vec<String>>>;

    fn journal() -> Journal {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn entries(journal: &Journal) -> Vec<String> {
        journal.lock().unwrap().clone()
    }

    /// Step that succeeds and whose compensation appends `undo-<name>`.
    fn reversible(name: &str, journal: &Journal) -> TransactionStep {
        let undo_name = format!("undo-{}", name);
        let undo_journal = journal.clone();
        let output = name.to_string();
        TransactionStep::new(name, move || {
            let output = output.clone();
            async move { Ok(output) }
        })
        .with_compensation(move || {
            undo_journal.lock().unwrap().push(undo_name.clone());
            async { Ok(()) }
        })
    }

    fn failing(name: &str) -> TransactionStep {
        TransactionStep::new(name, || async { Err::<(), _>(anyhow::anyhow!("insert rejected")) })
            .retryable(false)
    }

    #[tokio::test]
    async fn test_compensates_in_reverse_order() {
        let journal = journal();
        let tx = SagaTransaction::new(TransactionOptions::default());
        tx.add_step(reversible("a", &journal))
            .unwrap()
            .add_step(reversible("b", &journal))
            .unwrap()
            .add_step(failing("c"))
            .unwrap();

        let result = tx.execute().await;

        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("c"));
        assert!(result.compensated);
        assert_eq!(result.error.unwrap().to_string(), "insert rejected");
        assert_eq!(entries(&journal), vec!["undo-b", "undo-a"]);
        assert_eq!(tx.state(), TransactionState::RolledBack);
        assert_eq!(tx.executed_steps(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failing_compensator_does_not_block_others() {
        let journal = journal();
        let tx = SagaTransaction::new(TransactionOptions::default());
        tx.add_step(reversible("a", &journal)).unwrap();
        tx.add_step(
            TransactionStep::new("b", || async { Ok(()) })
                .with_compensation(|| async { Err(anyhow::anyhow!("undo failed")) }),
        )
        .unwrap();
        tx.add_step(reversible("c", &journal)).unwrap();
        tx.add_step(failing("d")).unwrap();

        let result = tx.execute().await;

        assert!(!result.success);
        assert!(!result.compensated);
        assert_eq!(entries(&journal), vec!["undo-c", "undo-a"]);
        assert_eq!(tx.state(), TransactionState::Failed);
    }

    #[tokio::test]
    async fn test_step_without_compensation_is_skipped() {
        let deleted = Arc::new(AtomicU32::new(0));
        let counter = deleted.clone();

        let tx = SagaTransaction::new(TransactionOptions::default());
        tx.add_step(
            TransactionStep::new("create-product", || async { Ok("product-1") }).with_compensation(
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(()) }
                },
            ),
        )
        .unwrap();
        tx.add_step(failing("create-inventory")).unwrap();

        let result = tx.execute().await;

        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("create-inventory"));
        assert!(result.compensated);
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Receipt {
        sale_id: u32,
        total_cents: u64,
    }

    #[tokio::test]
    async fn test_result_is_last_step_output() {
        let tx = SagaTransaction::new(TransactionOptions::default());
        tx.add_step(TransactionStep::new("reserve", || async { Ok(1u32) }))
            .unwrap()
            .add_step(TransactionStep::new("charge", || async {
                Ok(Receipt {
                    sale_id: 9,
                    total_cents: 1250,
                })
            }))
            .unwrap();

        let result = tx.execute().await;

        assert!(result.success);
        assert!(result.error.is_none());
        assert_eq!(
            result.data_as::<Receipt>().unwrap(),
            Receipt {
                sale_id: 9,
                total_cents: 1250
            }
        );
        assert_eq!(tx.state(), TransactionState::Committed);
    }

    #[tokio::test]
    async fn test_empty_saga_commits() {
        let tx = SagaTransaction::new(TransactionOptions::default());
        let result = tx.execute().await;
        assert!(result.success);
        assert!(result.data.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_compensates_executed_steps() {
        let journal = journal();
        let tx = SagaTransaction::new(TransactionOptions {
            timeout: Some(Duration::from_millis(500)),
            ..TransactionOptions::default()
        });
        tx.add_step(reversible("a", &journal)).unwrap();
        tx.add_step(TransactionStep::new("stuck", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }))
        .unwrap();

        let result = tx.execute().await;

        assert!(!result.success);
        assert_eq!(result.failed_step.as_deref(), Some("stuck"));
        assert!(result.compensated);
        assert!(matches!(
            result.error.unwrap().downcast_ref::<TransactionError>(),
            Some(TransactionError::Timeout { .. })
        ));
        assert_eq!(entries(&journal), vec!["undo-a"]);
        assert_eq!(tx.state(), TransactionState::RolledBack);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_without_compensation() {
        let journal = journal();
        let tx = SagaTransaction::new(TransactionOptions {
            timeout: Some(Duration::from_millis(500)),
            compensate_on_timeout: false,
            ..TransactionOptions::default()
        });
        tx.add_step(reversible("a", &journal)).unwrap();
        tx.add_step(TransactionStep::new("stuck", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }))
        .unwrap();

        let result = tx.execute().await;

        assert!(!result.success);
        assert!(!result.compensated);
        assert!(entries(&journal).is_empty());
        assert_eq!(tx.state(), TransactionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_compensates_and_fails() {
        let journal = journal();
        let tx = Arc::new(SagaTransaction::new(TransactionOptions {
            timeout: None,
            ..TransactionOptions::default()
        }));
        tx.add_step(reversible("a", &journal)).unwrap();
        tx.add_step(TransactionStep::new("long", || async {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(())
        }))
        .unwrap();

        let running = tx.clone();
        let handle = tokio::spawn(async move { running.execute().await });

        while tx.executed_steps().is_empty() {
            tokio::task::yield_now().await;
        }
        tx.abort("shutdown").await;

        let result = handle.await.unwrap();
        assert!(!result.success);
        assert!(result.compensated);
        assert!(matches!(
            result.error.unwrap().downcast_ref::<TransactionError>(),
            Some(TransactionError::Aborted { .. })
        ));
        assert_eq!(entries(&journal), vec!["undo-a"]);
        assert_eq!(tx.state(), TransactionState::Failed);
    }

    #[tokio::test]
    async fn test_abort_before_execute_is_noop() {
        let tx = SagaTransaction::new(TransactionOptions::default());
        tx.abort("nothing to do").await;
        assert_eq!(tx.state(), TransactionState::Pending);
    }

    #[tokio::test]
    async fn test_event_sequence() {
        let journal = journal();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();

        let tx = SagaTransaction::with_id("tx-events", TransactionOptions::default());
        tx.on(move |event| sink.lock().unwrap().push(event.clone()));
        tx.add_step(reversible("a", &journal)).unwrap();
        tx.add_step(failing("b")).unwrap();

        tx.execute().await;

        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 8);
        assert_eq!(events[0], TransactionEvent::Started);
        assert_eq!(events[1], TransactionEvent::StepStart { step: "a".into() });
        assert_eq!(events[2], TransactionEvent::StepComplete { step: "a".into() });
        assert_eq!(events[3], TransactionEvent::StepStart { step: "b".into() });
        assert_eq!(
            events[4],
            TransactionEvent::StepFail {
                step: "b".into(),
                error: "insert rejected".into(),
                attempts: 1,
            }
        );
        assert_eq!(events[5], TransactionEvent::CompensateStart { step: "a".into() });
        assert_eq!(events[6], TransactionEvent::CompensateComplete { step: "a".into() });
        assert_eq!(
            events[7],
            TransactionEvent::Failed {
                state: TransactionState::RolledBack,
                error: "insert rejected".into(),
            }
        );
        assert_eq!(tx.id(), "tx-events");
    }

    #[tokio::test]
    async fn test_terminal_event_emitted_once() {
        let failures = Arc::new(AtomicU32::new(0));
        let counter = failures.clone();

        let tx = SagaTransaction::new(TransactionOptions::default());
        tx.on(move |event| {
            if let TransactionEvent::Failed { state, .. } = event {
                assert_eq!(*state, TransactionState::RolledBack);
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        tx.add_step(failing("only")).unwrap();

        tx.execute().await;
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    fn stalled(name: &str) -> TransactionStep {
        TransactionStep::new(name, || async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_execution_can_be_aborted() {
        let journal = journal();
        let tx = SagaTransaction::new(TransactionOptions {
            timeout: None,
            ..TransactionOptions::default()
        });
        tx.add_step(reversible("create", &journal)).unwrap();
        tx.add_step(stalled("slow")).unwrap();

        let dropped = tokio::time::timeout(Duration::from_millis(50), tx.execute()).await;
        assert!(dropped.is_err());
        assert_eq!(tx.state(), TransactionState::Running);

        tx.abort("shutdown").await;
        assert_eq!(entries(&journal), vec!["undo-create"]);
        assert_eq!(tx.state(), TransactionState::Failed);

        // finished, so a second abort does nothing
        tx.abort("shutdown").await;
        assert_eq!(entries(&journal), vec!["undo-create"]);
        assert!(!tx.execute().await.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_resumes_interrupted_rollback() {
        let journal = journal();
        let slow_undo = journal.clone();
        let tx = SagaTransaction::new(TransactionOptions::default());
        tx.add_step(reversible("a", &journal)).unwrap();
        tx.add_step(
            TransactionStep::new("b", || async { Ok(()) }).with_compensation(move || {
                slow_undo.lock().unwrap().push("undo-b".to_string());
                async {
                    tokio::time::sleep(Duration::from_secs(10)).await;
                    Ok(())
                }
            }),
        )
        .unwrap();
        tx.add_step(failing("c")).unwrap();

        let dropped = tokio::time::timeout(Duration::from_millis(50), tx.execute()).await;
        assert!(dropped.is_err());
        assert_eq!(tx.state(), TransactionState::RollingBack);

        tx.abort("shutdown").await;
        assert_eq!(entries(&journal), vec!["undo-b", "undo-a"]);
        assert_eq!(tx.state(), TransactionState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_frees_half_open_breaker() {
        let breaker = Arc::new(CircuitBreaker::new(
            "warehouse",
            CircuitBreakerOptions {
                timeout_ms: 5_000,
                max_half_open_requests: 1,
                ..CircuitBreakerOptions::default()
            },
        ));
        breaker.trip().await;
        tokio::time::sleep(Duration::from_millis(breaker.options().sleep_window_ms)).await;

        let tx = SagaTransaction::new(TransactionOptions {
            timeout: Some(Duration::from_millis(100)),
            ..TransactionOptions::default()
        });
        let guarded = breaker.clone();
        tx.add_step(
            TransactionStep::new("reserve-stock", move || {
                let breaker = guarded.clone();
                async move {
                    breaker
                        .execute(|| async {
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            Ok(())
                        })
                        .await
                }
            })
            .retryable(false),
        )
        .unwrap();

        let result = tx.execute().await;
        assert!(!result.success);
        assert!(matches!(
            result.error.unwrap().downcast_ref::<TransactionError>(),
            Some(TransactionError::Timeout { .. })
        ));
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        let recovered: anyhow::Result<u32> = breaker.execute(|| async { Ok(7) }).await;
        assert_eq!(recovered.unwrap(), 7);
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }
}
