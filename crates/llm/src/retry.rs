use async_trait::async_trait;
use healmate_common::{Result, RetryPolicy, with_retry};

use crate::client::{LlmClient, LlmRequest, LlmResponse};

/// Wraps a client so transient provider failures are retried under the
/// language-model [`RetryPolicy`].
pub struct RetryingClient<T: LlmClient> {
    inner: T,
    policy: RetryPolicy,
}

impl<T: LlmClient> RetryingClient<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl<T: LlmClient> LlmClient for RetryingClient<T> {
    async fn complete(&self, request: LlmRequest) -> Result<LlmResponse> {
        with_retry(&self.policy, "llm.complete", || {
            self.inner.complete(request.clone())
        })
        .await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use healmate_common::HealmateError;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyClient {
        calls: AtomicU32,
        failures: u32,
        error: fn() -> HealmateError,
    }

    #[async_trait]
    impl LlmClient for FlakyClient {
        async fn complete(&self, _request: LlmRequest) -> Result<LlmResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err((self.error)());
            }
            Ok(LlmResponse {
                content: "ok".to_string(),
                model: "flaky".to_string(),
                usage: None,
                finish_reason: None,
            })
        }
        fn model_name(&self) -> &str {
            "flaky"
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_from_single_upstream_failure() {
        let client = RetryingClient::new(
            FlakyClient {
                calls: AtomicU32::new(0),
                failures: 1,
                error: || HealmateError::upstream("openai", "502"),
            },
            RetryPolicy::llm(),
        );
        let response = client.complete(LlmRequest::default()).await.unwrap();
        assert_eq!(response.content, "ok");
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_upstream_budget() {
        let client = RetryingClient::new(
            FlakyClient {
                calls: AtomicU32::new(0),
                failures: 10,
                error: || HealmateError::upstream("openai", "503"),
            },
            RetryPolicy::llm(),
        );
        assert!(client.complete(LlmRequest::default()).await.is_err());
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn config_errors_are_not_retried() {
        let client = RetryingClient::new(
            FlakyClient {
                calls: AtomicU32::new(0),
                failures: 10,
                error: || HealmateError::Config("401".to_string()),
            },
            RetryPolicy::llm(),
        );
        assert!(client.complete(LlmRequest::default()).await.is_err());
        assert_eq!(client.inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.model_name(), "flaky");
    }
}
