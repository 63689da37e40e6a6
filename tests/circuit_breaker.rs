//! Circuit breaker integration tests
//!
//! Exercises the full breaker lifecycle through the resilience manager:
//! closed -> open on threshold, fast-fail while open, half-open probe after
//! the recovery timeout, and close again on consecutive successes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crucible::components::ComponentError;
use crucible::resilience::{
    BreakerConfig, CircuitState, ResilienceConfig, ResilienceManager,
};
use crucible::EngineError;

fn manager() -> Arc<ResilienceManager> {
    Arc::new(ResilienceManager::new(ResilienceConfig {
        breaker: BreakerConfig {
            failure_threshold: 3,
            success_threshold: 2,
            recovery_timeout_ms: 50,
        },
        ..Default::default()
    }))
}

async fn failing_call(manager: &ResilienceManager) -> Result<Value, EngineError> {
    manager
        .execute_with_resilience("llm", "generate", Duration::from_secs(1), || async {
            Err::<Value, _>(ComponentError::Connection("refused".to_string()))
        })
        .await
}

#[tokio::test]
async fn test_breaker_lifecycle_with_threshold_three() {
    let manager = manager();

    // Three consecutive failures flip CLOSED -> OPEN.
    for i in 0..3 {
        let result = failing_call(&manager).await;
        assert!(result.is_err(), "call {} should fail", i);
    }
    assert_eq!(manager.breaker_state("llm"), Some(CircuitState::Open));

    // A call made immediately after is rejected without invoking the
    // underlying function.
    let invoked = Arc::new(AtomicU32::new(0));
    let counter = invoked.clone();
    let result = manager
        .execute_with_resilience("llm", "generate", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!("should not run"))
            }
        })
        .await;
    assert!(matches!(result, Err(EngineError::CircuitOpen { .. })));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    // After the recovery timeout one probe call is permitted.
    tokio::time::sleep(Duration::from_millis(80)).await;
    let result = manager
        .execute_with_resilience("llm", "generate", Duration::from_secs(1), || async {
            Ok(json!("probe"))
        })
        .await;
    assert!(result.is_ok());
    assert_eq!(manager.breaker_state("llm"), Some(CircuitState::HalfOpen));

    // success_threshold consecutive successes return to CLOSED.
    let result = manager
        .execute_with_resilience("llm", "generate", Duration::from_secs(1), || async {
            Ok(json!("stable"))
        })
        .await;
    assert!(result.is_ok());
    assert_eq!(manager.breaker_state("llm"), Some(CircuitState::Closed));
}

#[tokio::test]
async fn test_half_open_failure_reopens_immediately() {
    let manager = manager();

    for _ in 0..3 {
        let _ = failing_call(&manager).await;
    }
    tokio::time::sleep(Duration::from_millis(80)).await;

    // The probe fails: straight back to OPEN.
    let _ = failing_call(&manager).await;
    assert_eq!(manager.breaker_state("llm"), Some(CircuitState::Open));

    let result = failing_call(&manager).await;
    assert!(matches!(result, Err(EngineError::CircuitOpen { .. })));
}

#[tokio::test]
async fn test_breakers_are_per_component() {
    let manager = manager();

    for _ in 0..3 {
        let _ = failing_call(&manager).await;
    }
    assert_eq!(manager.breaker_state("llm"), Some(CircuitState::Open));

    // A different component is unaffected.
    let result = manager
        .execute_with_resilience("evaluator", "score", Duration::from_secs(1), || async {
            Ok(json!(0.9))
        })
        .await;
    assert!(result.is_ok());
    assert_eq!(
        manager.breaker_state("evaluator"),
        Some(CircuitState::Closed)
    );
}

#[tokio::test]
async fn test_shared_state_across_concurrent_callers() {
    let manager = manager();

    // Eight concurrent failing callers of the same component share one
    // breaker; it must end up open.
    let mut handles = Vec::new();
    for _ in 0..8 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            let _ = failing_call(&manager).await;
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(manager.breaker_state("llm"), Some(CircuitState::Open));
    let status = manager.status();
    assert!(status["llm"].failure_count >= 3);
}
