//! Virtual-model router: provider chain with per-provider cooldown
//! duration.

use std::{collections::HashMap, future::Future};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::{config::VirtualModelConfig, error::GatewayError};

/// Provider string -> absolute cooldown expiry. "In cooldown" means the
/// expiry is still in the future; entries are cleared lazily on
/// observation.
#[derive(Debug, Default)]
pub struct CooldownMap {
    expiries: DashMap<String, DateTime<Utc>>,
}

impl CooldownMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_cooldown(&self, provider: &str) -> bool {
        let Some(entry) = self.expiries.get(provider) else {
            return false;
        };
        let expiry = *entry;
        drop(entry);
        if expiry > Utc::now() {
            true
        } else {
            self.expiries.remove(provider);
            false
        }
    }

    pub fn set(&self, provider: &str, cooldown_minutes: u64) {
        self.expiries.insert(
            provider.to_string(),
            Utc::now() + chrono::Duration::minutes(cooldown_minutes as i64),
        );
    }

    pub fn reset(&self) {
        self.expiries.clear();
    }

    pub fn snapshot(&self) -> HashMap<String, DateTime<Utc>> {
        self.expiries
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect()
    }
}

/// Resolves a caller-visible virtual model name to an ordered chain of
/// provider strings and runs each candidate in turn, skipping providers
/// currently in cooldown.
#[derive(Debug, Default)]
pub struct VirtualModelRouter {
    pub cooldowns: CooldownMap,
}

impl VirtualModelRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `run_candidate` performs the full agent loop for one provider
    /// candidate (payload already carries the candidate model and no
    /// `fallbacks`). Returns the winning provider string alongside its
    /// response, or `all_providers_failed` once every candidate is
    /// skipped or exhausted.
    pub async fn run<F, Fut, T>(
        &self,
        vm: &VirtualModelConfig,
        mut run_candidate: F,
    ) -> Result<(String, T), GatewayError>
    where
        F: FnMut(String) -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut last_error: Option<GatewayError> = None;

        for candidate in &vm.chain {
            if self.cooldowns.is_in_cooldown(candidate) {
                continue;
            }

            match run_candidate(candidate.clone()).await {
                Ok(value) => return Ok((candidate.clone(), value)),
                Err(e) if vm.retry_on.contains(&e.status) => {
                    self.cooldowns.set(candidate, vm.cooldown_minutes);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        let last = last_error.unwrap_or_else(|| {
            GatewayError::service_unavailable("virtual model chain has no usable candidates")
        });
        Err(GatewayError::all_providers_failed(last))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vm(chain: &[&str], retry_on: &[u16]) -> VirtualModelConfig {
        VirtualModelConfig {
            name: "brain".to_string(),
            chain: chain.iter().map(|s| s.to_string()).collect(),
            cooldown_minutes: 5,
            retry_on: retry_on.to_vec(),
        }
    }

    #[tokio::test]
    async fn first_success_wins() {
        let router = VirtualModelRouter::new();
        let model = vm(&["a", "b"], &[429, 500]);
        let (provider, value) = router
            .run(&model, |candidate| async move { Ok::<_, GatewayError>(candidate) })
            .await
            .unwrap();
        assert_eq!(provider, "a");
        assert_eq!(value, "a");
    }

    #[tokio::test]
    async fn retryable_failure_advances_and_sets_cooldown() {
        let router = VirtualModelRouter::new();
        let model = vm(&["a", "b"], &[429]);
        let (provider, _) = router
            .run(&model, |candidate| async move {
                if candidate == "a" {
                    Err(GatewayError::rate_limit_exceeded("limited"))
                } else {
                    Ok(candidate)
                }
            })
            .await
            .unwrap();
        assert_eq!(provider, "b");
        assert!(router.cooldowns.is_in_cooldown("a"));
        assert!(!router.cooldowns.is_in_cooldown("b"));
    }

    #[tokio::test]
    async fn non_retryable_failure_aborts_immediately() {
        let router = VirtualModelRouter::new();
        let model = vm(&["a", "b"], &[429]);
        let mut calls = 0;
        let result = router
            .run(&model, |_candidate| {
                calls += 1;
                async move { Err::<String, _>(GatewayError::internal_error("boom")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn all_candidates_exhausted_reports_all_providers_failed() {
        let router = VirtualModelRouter::new();
        let model = vm(&["a"], &[500]);
        let result = router
            .run(&model, |_candidate| async move {
                Err::<String, _>(GatewayError::new(500, "upstream_error", "down"))
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.error_type, "all_providers_failed");
    }

    #[test]
    fn cooldown_503_is_not_in_default_retry_on() {
        let model = vm(&["a"], &[429, 500]);
        assert!(model.retry_on.contains(&429));
        assert!(model.retry_on.contains(&500));
        assert!(!model.retry_on.contains(&503));
    }
}
