//! Per-provider concurrency limit and retry around a [`GenerationService`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use autonews_shared::{
    AutoNewsError, Classification, GenerationSettings, Result, RetryPolicy, retry_with_quota,
};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::generation::GenerationService;

/// One semaphore per provider label, shared by every throttled service that
/// uses the same registry.
#[derive(Clone)]
pub struct ProviderLimits {
    permits: usize,
    semaphores: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl ProviderLimits {
    pub fn new(permits: usize) -> Self {
        Self {
            permits: permits.max(1),
            semaphores: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn semaphore(&self, provider: &str) -> Arc<Semaphore> {
        let mut map = self
            .semaphores
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        map.entry(provider.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.permits)))
            .clone()
    }

    async fn acquire(&self, provider: &str) -> Result<OwnedSemaphorePermit> {
        self.semaphore(provider)
            .acquire_owned()
            .await
            .map_err(|e| AutoNewsError::Generation(format!("provider limiter closed: {e}")))
    }
}

/// Wraps a generation service with the provider's concurrency limit, retry
/// for transient failures and a longer backoff for quota rejections.
pub struct Throttled {
    inner: Arc<dyn GenerationService>,
    limits: ProviderLimits,
    retry: RetryPolicy,
    quota: RetryPolicy,
}

impl Throttled {
    pub fn new(inner: Arc<dyn GenerationService>, settings: &GenerationSettings) -> Self {
        Self::with_limits(inner, ProviderLimits::new(settings.max_concurrency), settings)
    }

    pub fn with_limits(
        inner: Arc<dyn GenerationService>,
        limits: ProviderLimits,
        settings: &GenerationSettings,
    ) -> Self {
        let initial = Duration::from_millis(settings.backoff_initial_ms);
        let quota_initial = Duration::from_millis(settings.quota_backoff_initial_ms);
        Self {
            inner,
            limits,
            retry: RetryPolicy {
                max_attempts: settings.max_attempts.max(1),
                initial_interval: initial,
                max_interval: initial * 16,
            },
            quota: RetryPolicy {
                max_attempts: settings.max_attempts.max(1),
                initial_interval: quota_initial,
                max_interval: quota_initial * 8,
            },
        }
    }

    /// Replace both retry schedules.
    pub fn with_policies(mut self, retry: RetryPolicy, quota: RetryPolicy) -> Self {
        self.retry = retry;
        self.quota = quota;
        self
    }

    /// Each attempt takes its own provider permit, so a call sleeping out a
    /// backoff does not hold a slot.
    async fn run<T, F, Fut>(&self, label: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let provider = self.inner.provider();
        retry_with_quota(&self.retry, Some(&self.quota), label, || {
            let call = op();
            async move {
                let _permit = self.limits.acquire(provider).await?;
                debug!(provider, label, "generation permit acquired");
                call.await
            }
        })
        .await
    }
}

#[async_trait]
impl GenerationService for Throttled {
    async fn summarize(
        &self,
        text: &str,
        max_length: usize,
        target_language: Option<&str>,
    ) -> Result<String> {
        self.run("summarize", || self.inner.summarize(text, max_length, target_language))
            .await
    }

    async fn classify_and_score(&self, text: &str) -> Result<Classification> {
        self.run("classify", || self.inner.classify_and_score(text)).await
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.run("embed", || self.inner.embed(text)).await
    }

    fn provider(&self) -> &str {
        self.inner.provider()
    }

    fn model(&self) -> &str {
        self.inner.model()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Fails with a quota error `failures` times, then succeeds. Tracks the
    /// highest number of concurrent calls.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Flaky {
        fn new(failures: usize) -> Self {
            Self {
                failures,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl GenerationService for Flaky {
        async fn summarize(&self, _: &str, _: usize, _: Option<&str>) -> Result<String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(AutoNewsError::QuotaExceeded("429".into()))
            } else {
                Ok("summary".into())
            }
        }

        async fn classify_and_score(&self, _: &str) -> Result<Classification> {
            Err(AutoNewsError::parse("bad json"))
        }

        async fn embed(&self, _: &str) -> Result<Vec<f32>> {
            Ok(vec![1.0])
        }

        fn provider(&self) -> &str {
            "test"
        }

        fn model(&self) -> &str {
            "m"
        }
    }

    fn fast() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(1),
            max_interval: Duration::from_millis(2),
        }
    }

    fn throttled(inner: Arc<Flaky>, permits: usize) -> Throttled {
        let settings = GenerationSettings {
            max_concurrency: permits,
            ..GenerationSettings::default()
        };
        Throttled::new(inner, &settings).with_policies(fast(), fast())
    }

    #[tokio::test]
    async fn quota_errors_are_retried() {
        let inner = Arc::new(Flaky::new(2));
        let service = throttled(inner.clone(), 2);
        assert_eq!(service.summarize("t", 10, None).await.unwrap(), "summary");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn quota_exhaustion_surfaces() {
        let inner = Arc::new(Flaky::new(10));
        let service = throttled(inner.clone(), 2);
        let err = service.summarize("t", 10, None).await.unwrap_err();
        assert!(err.is_quota());
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn parse_errors_are_not_retried() {
        let inner = Arc::new(Flaky::new(0));
        let service = throttled(inner, 2);
        let err = service.classify_and_score("t").await.unwrap_err();
        assert!(matches!(err, AutoNewsError::Parse { .. }));
    }

    #[tokio::test]
    async fn concurrency_is_bounded_per_provider() {
        let inner = Arc::new(Flaky::new(0));
        let service = Arc::new(throttled(inner.clone(), 2));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..6 {
            let service = service.clone();
            tasks.spawn(async move { service.summarize("t", 10, None).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }
        assert!(inner.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn backoff_sleep_releases_the_provider_slot() {
        let inner = Arc::new(Flaky::new(1));
        let slow_quota = RetryPolicy {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_millis(500),
        };
        let settings = GenerationSettings {
            max_concurrency: 1,
            ..GenerationSettings::default()
        };
        let service = Arc::new(Throttled::new(inner.clone(), &settings).with_policies(fast(), slow_quota));

        let waiting = {
            let service = service.clone();
            tokio::spawn(async move { service.summarize("first", 10, None).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = tokio::time::Instant::now();
        assert_eq!(service.summarize("second", 10, None).await.unwrap(), "summary");
        assert!(started.elapsed() < Duration::from_millis(300));

        assert_eq!(waiting.await.unwrap().unwrap(), "summary");
        assert_eq!(inner.calls.load(Ordering::SeqCst), 3);
    }
}
