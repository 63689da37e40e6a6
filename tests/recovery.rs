//! Recovery manager integration tests
//!
//! Verifies retry counts and backoff pacing, fallback handling, and the
//! recovery statistics surface.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use crucible::components::ComponentError;
use crucible::recovery::{
    FallbackHandler, RecoveryAction, RecoveryManager, RecoveryStrategy,
};
use crucible::EngineError;

fn internal(msg: &str) -> EngineError {
    EngineError::Component(ComponentError::Internal(msg.to_string()))
}

#[tokio::test]
async fn test_exponential_backoff_pacing() {
    // max_retries=3, initial_delay=0.1s, backoff_factor=2: a function
    // failing twice then succeeding is invoked exactly 3 times with
    // pre-jitter delays [0.1, 0.2].
    let manager = RecoveryManager::bare();
    let strategy = RecoveryStrategy {
        max_retries: 3,
        initial_delay: Duration::from_millis(100),
        backoff_factor: 2.0,
        jitter: false,
        actions: vec![RecoveryAction::Retry],
    };

    let invocations: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
    let log = invocations.clone();

    let result = manager
        .execute_with_recovery("llm", "generate", &strategy, move || {
            let log = log.clone();
            async move {
                let mut log = log.lock().unwrap();
                log.push(Instant::now());
                if log.len() < 3 {
                    Err(internal("transient"))
                } else {
                    Ok(json!("third time lucky"))
                }
            }
        })
        .await;

    assert!(result.is_ok());

    let invocations = invocations.lock().unwrap();
    assert_eq!(invocations.len(), 3, "invoked exactly 3 times");

    let gap1 = invocations[1] - invocations[0];
    let gap2 = invocations[2] - invocations[1];
    assert!(gap1 >= Duration::from_millis(95), "first delay was {:?}", gap1);
    assert!(gap1 < Duration::from_millis(500), "first delay was {:?}", gap1);
    assert!(gap2 >= Duration::from_millis(190), "second delay was {:?}", gap2);
    assert!(gap2 < Duration::from_millis(800), "second delay was {:?}", gap2);
}

#[tokio::test]
async fn test_statistics_accumulate() {
    let manager = RecoveryManager::bare();
    let strategy = RecoveryStrategy {
        max_retries: 2,
        initial_delay: Duration::from_millis(1),
        actions: vec![RecoveryAction::Retry],
        ..Default::default()
    };

    // One clean success.
    let _ = manager
        .execute_with_recovery("a", "op", &strategy, || async { Ok(json!(1)) })
        .await;

    // One exhausted failure (1 initial + 2 retries).
    let _ = manager
        .execute_with_recovery("a", "op", &strategy, || async {
            Err::<Value, _>(internal("down"))
        })
        .await;

    let stats = manager.statistics();
    assert_eq!(stats.total_attempts, 4);
    assert_eq!(stats.successful_attempts, 1);
    assert_eq!(stats.retries, 2);
}

struct CachedAnswer;

#[async_trait]
impl FallbackHandler for CachedAnswer {
    async fn handle(
        &self,
        _component: &str,
        _operation: &str,
        _error: &EngineError,
    ) -> Result<Value, ComponentError> {
        Ok(json!({"source": "cache"}))
    }
}

#[tokio::test]
async fn test_fallback_handler_rescues_exhausted_retries() {
    let manager = RecoveryManager::bare();
    manager.register_fallback("llm", "generate", Arc::new(CachedAnswer));

    let strategy = RecoveryStrategy {
        max_retries: 1,
        initial_delay: Duration::from_millis(1),
        actions: vec![RecoveryAction::Retry, RecoveryAction::Fallback],
        ..Default::default()
    };

    let result = manager
        .execute_with_recovery("llm", "generate", &strategy, || async {
            Err::<Value, _>(internal("model offline"))
        })
        .await
        .unwrap();

    assert_eq!(result["source"], "cache");
}

#[tokio::test]
async fn test_fallback_only_registered_for_exact_operation() {
    let manager = RecoveryManager::bare();
    manager.register_fallback("llm", "generate", Arc::new(CachedAnswer));

    let strategy = RecoveryStrategy {
        max_retries: 0,
        actions: vec![RecoveryAction::Fallback],
        ..Default::default()
    };

    // Different operation: no handler, the original error surfaces.
    let result = manager
        .execute_with_recovery("llm", "mutate", &strategy, || async {
            Err::<Value, _>(internal("the original"))
        })
        .await;

    match result {
        Err(EngineError::Component(ComponentError::Internal(msg))) => {
            assert_eq!(msg, "the original");
        }
        other => panic!("expected original error, got {:?}", other),
    }
}
