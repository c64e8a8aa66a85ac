//! Model router with ordered adapter fallback.
//!
//! A logical model id maps to an ordered list of adapter bindings. The router
//! tries them in order:
//!
//! - configuration errors (unknown adapter, missing credentials) skip to the
//!   next adapter immediately
//! - transient errors (timeout, rate limit, overload, transport) are retried
//!   on the same adapter with the step's backoff, then fall through
//! - any other error falls through without a retry
//!
//! Only when every adapter has been tried does the caller see
//! `RouterError::AllAdaptersExhausted`, carrying every attempt made.

use std::sync::Arc;
use std::time::Duration;

use tracing::Instrument;

use flowbench_types::model::{AdapterError, ModelRequest, ModelResponse};
use flowbench_types::workflow::RetryPolicy;

use super::registry::{AdapterRegistry, ModelTable};

/// One failed adapter call.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterAttempt {
    pub adapter: String,
    /// 1-based attempt number on this adapter.
    pub attempt: u32,
    pub error: AdapterError,
}

impl std::fmt::Display for AdapterAttempt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}: {}", self.adapter, self.attempt, self.error)
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RouterError {
    #[error("unknown model '{0}'")]
    UnknownModel(String),

    #[error("all adapters exhausted for model '{model}': {}", format_attempts(attempts))]
    AllAdaptersExhausted {
        model: String,
        attempts: Vec<AdapterAttempt>,
    },
}

impl RouterError {
    /// Whether a later retry of the whole route might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RouterError::UnknownModel(_) => false,
            RouterError::AllAdaptersExhausted { attempts, .. } => {
                attempts.iter().any(|a| a.error.is_transient())
            }
        }
    }
}

fn format_attempts(attempts: &[AdapterAttempt]) -> String {
    if attempts.is_empty() {
        return "no attempts made".to_string();
    }
    attempts
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A successful routed call.
#[derive(Debug, Clone)]
pub struct Routed {
    pub response: ModelResponse,
    /// Adapter that produced the response.
    pub adapter: String,
    /// Failed attempts that preceded the success.
    pub failed_attempts: Vec<AdapterAttempt>,
}

/// Resolves logical model ids and walks their adapter chains.
#[derive(Clone)]
pub struct ModelRouter {
    models: Arc<ModelTable>,
    adapters: Arc<AdapterRegistry>,
}

impl ModelRouter {
    pub fn new(models: Arc<ModelTable>, adapters: Arc<AdapterRegistry>) -> Self {
        Self { models, adapters }
    }

    pub fn models(&self) -> &ModelTable {
        &self.models
    }

    pub fn adapters(&self) -> &AdapterRegistry {
        &self.adapters
    }

    /// Route `request` for `model` through its adapter chain.
    ///
    /// `policy` bounds attempts per adapter for transient errors; `timeout`
    /// bounds each single call.
    pub async fn route(
        &self,
        model: &str,
        request: &ModelRequest,
        policy: &RetryPolicy,
        timeout: Duration,
    ) -> Result<Routed, RouterError> {
        let spec = self
            .models
            .get(model)
            .ok_or_else(|| RouterError::UnknownModel(model.to_string()))?;

        let mut failed: Vec<AdapterAttempt> = Vec::new();

        for binding in &spec.adapters {
            let Some(adapter) = self.adapters.get(&binding.adapter) else {
                tracing::warn!(
                    model,
                    adapter = %binding.adapter,
                    "Adapter not registered, trying next in chain"
                );
                failed.push(AdapterAttempt {
                    adapter: binding.adapter.clone(),
                    attempt: 1,
                    error: AdapterError::Configuration(format!(
                        "adapter '{}' is not registered",
                        binding.adapter
                    )),
                });
                continue;
            };

            let mut attempt = 0;
            loop {
                attempt += 1;
                let span = tracing::info_span!(
                    "gen_ai.chat",
                    gen_ai.provider.name = %binding.adapter,
                    gen_ai.request.model = %binding.model,
                    gen_ai.request.max_tokens = ?request.max_tokens,
                    flowbench.model.name = model,
                    attempt,
                );
                let call = adapter.invoke(&binding.model, request, timeout).instrument(span);
                let result = match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(AdapterError::Timeout(timeout.as_millis() as u64)),
                };

                match result {
                    Ok(response) => {
                        if !failed.is_empty() {
                            tracing::info!(
                                model,
                                adapter = %binding.adapter,
                                failed = failed.len(),
                                "Served by fallback adapter"
                            );
                        }
                        return Ok(Routed {
                            response,
                            adapter: binding.adapter.clone(),
                            failed_attempts: failed,
                        });
                    }
                    Err(err) => {
                        let retry = err.is_transient() && policy.allows_retry(attempt);
                        let delay = retry.then(|| retry_delay(policy, attempt, &err));
                        if err.is_configuration() || !retry {
                            tracing::warn!(
                                model,
                                adapter = %binding.adapter,
                                attempt,
                                error = %err,
                                "Adapter failed, trying next in chain"
                            );
                        } else {
                            tracing::debug!(
                                model,
                                adapter = %binding.adapter,
                                attempt,
                                error = %err,
                                "Transient adapter error, retrying"
                            );
                        }
                        failed.push(AdapterAttempt {
                            adapter: binding.adapter.clone(),
                            attempt,
                            error: err,
                        });
                        match delay {
                            Some(delay) => tokio::time::sleep(delay).await,
                            None => break,
                        }
                    }
                }
            }
        }

        Err(RouterError::AllAdaptersExhausted {
            model: model.to_string(),
            attempts: failed,
        })
    }
}

/// Backoff delay, stretched to a rate limit's `retry_after` hint.
fn retry_delay(policy: &RetryPolicy, attempt: u32, err: &AdapterError) -> Duration {
    let base = policy.delay_for(attempt);
    match err {
        AdapterError::RateLimited {
            retry_after_ms: Some(ms),
        } => base.max(Duration::from_millis(*ms)),
        _ => base,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use flowbench_types::model::{AdapterBinding, ModelSpec};
    use flowbench_types::workflow::Backoff;

    use super::super::adapter::ModelAdapter;
    use super::super::box_adapter::BoxModelAdapter;
    use super::*;

    /// Adapter that replays scripted results; repeats the last one.
    struct ScriptedAdapter {
        name: String,
        script: Mutex<VecDeque<Result<String, AdapterError>>>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedAdapter {
        fn new(name: &str, script: Vec<Result<&str, AdapterError>>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let adapter = Self {
                name: name.to_string(),
                script: Mutex::new(
                    script
                        .into_iter()
                        .map(|r| r.map(str::to_string))
                        .collect(),
                ),
                calls: calls.clone(),
            };
            (adapter, calls)
        }
    }

    impl ModelAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            &self.name
        }

        async fn invoke(
            &self,
            model: &str,
            _request: &ModelRequest,
            _timeout: Duration,
        ) -> Result<ModelResponse, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.len() > 1 {
                    script.pop_front()
                } else {
                    script.front().cloned()
                }
            };
            match next {
                Some(Ok(content)) => Ok(ModelResponse {
                    content,
                    model: model.to_string(),
                    usage: None,
                }),
                Some(Err(err)) => Err(err),
                None => Err(AdapterError::InvalidResponse("empty script".into())),
            }
        }
    }

    fn router(chain: &[&str], adapters: Vec<ScriptedAdapter>) -> ModelRouter {
        let spec = ModelSpec {
            name: "fast".to_string(),
            adapters: chain
                .iter()
                .map(|a| AdapterBinding {
                    adapter: a.to_string(),
                    model: format!("{a}-model"),
                    cost: Default::default(),
                    latency: Default::default(),
                })
                .collect(),
        };
        let mut registry = AdapterRegistry::new();
        for adapter in adapters {
            registry.register(BoxModelAdapter::new(adapter));
        }
        ModelRouter::new(
            Arc::new(ModelTable::new(vec![spec]).unwrap()),
            Arc::new(registry),
        )
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::None,
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_primary_serves_request() {
        let (primary, primary_calls) = ScriptedAdapter::new("local", vec![Ok("hi")]);
        let (secondary, secondary_calls) = ScriptedAdapter::new("remote", vec![Ok("unused")]);
        let router = router(&["local", "remote"], vec![primary, secondary]);

        let routed = router
            .route("fast", &ModelRequest::new("p"), &policy(3), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(routed.adapter, "local");
        assert_eq!(routed.response.content, "hi");
        assert_eq!(routed.response.model, "local-model");
        assert!(routed.failed_attempts.is_empty());
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(secondary_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_credentials_skip_without_retry() {
        let (primary, primary_calls) = ScriptedAdapter::new(
            "remote",
            vec![Err(AdapterError::MissingCredentials("OPENAI_API_KEY".into()))],
        );
        let (secondary, _) = ScriptedAdapter::new("local", vec![Ok("fallback")]);
        let router = router(&["remote", "local"], vec![primary, secondary]);

        let routed = router
            .route("fast", &ModelRequest::new("p"), &policy(3), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(routed.adapter, "local");
        assert_eq!(primary_calls.load(Ordering::SeqCst), 1);
        assert_eq!(routed.failed_attempts.len(), 1);
    }

    #[tokio::test]
    async fn test_transient_error_retries_same_adapter() {
        let (primary, calls) = ScriptedAdapter::new(
            "local",
            vec![
                Err(AdapterError::Overloaded("busy".into())),
                Err(AdapterError::RateLimited {
                    retry_after_ms: Some(1),
                }),
                Ok("third time"),
            ],
        );
        let router = router(&["local"], vec![primary]);

        let routed = router
            .route("fast", &ModelRequest::new("p"), &policy(3), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(routed.response.content, "third time");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(routed.failed_attempts.len(), 2);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_falls_through() {
        let (primary, primary_calls) = ScriptedAdapter::new(
            "local",
            vec![Err(AdapterError::Transport("connection refused".into()))],
        );
        let (secondary, _) = ScriptedAdapter::new("remote", vec![Ok("ok")]);
        let router = router(&["local", "remote"], vec![primary, secondary]);

        let routed = router
            .route("fast", &ModelRequest::new("p"), &policy(2), TIMEOUT)
            .await
            .unwrap();
        assert_eq!(routed.adapter, "remote");
        assert_eq!(primary_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_all_adapters_exhausted_lists_every_attempt() {
        let (a, _) = ScriptedAdapter::new("a", vec![Err(AdapterError::Timeout(10))]);
        let (b, _) = ScriptedAdapter::new("b", vec![Err(AdapterError::Rejected("400".into()))]);
        // "ghost" is bound but never registered.
        let router = router(&["a", "ghost", "b"], vec![a, b]);

        let err = router
            .route("fast", &ModelRequest::new("p"), &policy(2), TIMEOUT)
            .await
            .unwrap_err();
        let RouterError::AllAdaptersExhausted { attempts, .. } = &err else {
            panic!("expected exhaustion, got {err:?}");
        };
        let names: Vec<&str> = attempts.iter().map(|a| a.adapter.as_str()).collect();
        assert_eq!(names, vec!["a", "a", "ghost", "b"]);
        assert!(err.is_transient());
        let msg = err.to_string();
        assert!(msg.contains("ghost#1"), "got: {msg}");
        assert!(msg.contains("400"), "got: {msg}");
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let router = router(&["a"], vec![]);
        let err = router
            .route("slow", &ModelRequest::new("p"), &policy(1), TIMEOUT)
            .await
            .unwrap_err();
        assert_eq!(err, RouterError::UnknownModel("slow".into()));
        assert!(!err.is_transient());
    }

    struct HangingAdapter;

    impl ModelAdapter for HangingAdapter {
        fn name(&self) -> &str {
            "hang"
        }

        async fn invoke(
            &self,
            _model: &str,
            _request: &ModelRequest,
            _timeout: Duration,
        ) -> Result<ModelResponse, AdapterError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(AdapterError::Transport("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_router_enforces_timeout() {
        let spec = ModelSpec {
            name: "fast".into(),
            adapters: vec![AdapterBinding {
                adapter: "hang".into(),
                model: "m".into(),
                cost: Default::default(),
                latency: Default::default(),
            }],
        };
        let mut registry = AdapterRegistry::new();
        registry.register(BoxModelAdapter::new(HangingAdapter));
        let router = ModelRouter::new(
            Arc::new(ModelTable::new(vec![spec]).unwrap()),
            Arc::new(registry),
        );

        let err = router
            .route(
                "fast",
                &ModelRequest::new("p"),
                &policy(1),
                Duration::from_millis(20),
            )
            .await
            .unwrap_err();
        let RouterError::AllAdaptersExhausted { attempts, .. } = err else {
            panic!("expected exhaustion");
        };
        assert_eq!(attempts[0].error, AdapterError::Timeout(20));
    }
}
