//! Fallback Resolver Tests
//! Layered recovery order, cached strategies and aggregate failures

use orchestration_core::resilience::{with_fallback, FallbackChain, FallbackOptions, TtlCache};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
mod fallback_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_cached_strategy_reused_within_ttl() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let chain = FallbackChain::new().add_cached(
            "price-lookup",
            move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move { Ok(format!("price-v{}", n)) }
            },
            Duration::from_millis(500),
            "price:42",
        );

        assert_eq!(chain.execute().await.unwrap(), "price-v0");
        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(chain.execute().await.unwrap(), "price-v0");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(chain.execute().await.unwrap(), "price-v1");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_chain_falls_through_to_default() {
        let chain = FallbackChain::new()
            .add("primary", || async { Err(anyhow::anyhow!("primary down")) })
            .add("replica", || async { Err(anyhow::anyhow!("replica down")) })
            .add_default(Vec::<String>::new());

        assert!(chain.execute().await.unwrap().is_empty());
        assert_eq!(chain.len(), 3);
    }

    #[tokio::test]
    async fn test_chain_aggregates_every_failure() {
        let chain: FallbackChain<u32> = FallbackChain::new()
            .add("primary", || async { Err(anyhow::anyhow!("primary down")) })
            .add("replica", || async { Err(anyhow::anyhow!("replica down")) });

        let err = chain.execute().await.unwrap_err();

        assert_eq!(err.errors.len(), 2);
        assert_eq!(err.errors[0].to_string(), "strategy 'primary' failed");
        assert_eq!(err.errors[1].root_cause().to_string(), "replica down");
        assert!(err.message.contains("2"));
    }

    #[tokio::test]
    async fn test_success_populates_cache_for_later_failures() {
        let store = Arc::new(TtlCache::new());
        let options = FallbackOptions::new().cache(
            store.clone(),
            || "employee:7".to_string(),
            Duration::from_secs(30),
        );

        let fresh = with_fallback(|| async { Ok("Ada".to_string()) }, &options)
            .await
            .unwrap();
        assert_eq!(fresh, "Ada");
        assert_eq!(store.get("employee:7").as_deref(), Some("Ada"));

        let recovered = with_fallback(|| async { Err(anyhow::anyhow!("connection reset")) }, &options)
            .await
            .unwrap();
        assert_eq!(recovered, "Ada");
    }

    #[tokio::test]
    async fn test_failing_sources_are_skipped_in_order() {
        let options = FallbackOptions::new()
            .degraded(|| async { Err(anyhow::anyhow!("degraded down")) })
            .fallback_factory(|| async { Ok(10u32) })
            .fallback_value(99u32);

        let value = with_fallback(|| async { Err(anyhow::anyhow!("primary down")) }, &options)
            .await
            .unwrap();
        assert_eq!(value, 10);
    }

    #[tokio::test]
    async fn test_original_error_when_nothing_recovers() {
        let options = FallbackOptions::new()
            .degraded(|| async { Err::<u32, _>(anyhow::anyhow!("degraded down")) });

        let err = with_fallback(|| async { Err(anyhow::anyhow!("primary down")) }, &options)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "primary down");
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_timeout_uses_fallback_value() {
        let options = FallbackOptions::new()
            .timeout(Duration::from_millis(50))
            .fallback_value("stale".to_string());

        let value = with_fallback(
            || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok("fresh".to_string())
            },
            &options,
        )
        .await
        .unwrap();
        assert_eq!(value, "stale");
    }
}
