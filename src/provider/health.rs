//! Post-deployment health supervision.
//!
//! Polls the provider's health query for a set of resources and reports
//! failure once any of them is unhealthy for a number of consecutive polls.

use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Provider, ResourceHealth};

/// Outcome of a supervision run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthVerdict {
    /// No resource failed for long enough within the allotted checks.
    Stable,
    /// A resource kept failing.
    Failing {
        /// Resource that failed.
        resource_id: String,
        /// Last failure reason.
        reason: String,
        /// Consecutive failed checks observed.
        consecutive: u32,
    },
}

/// Health monitor over a provider.
pub struct HealthMonitor<'a> {
    /// Provider to query.
    provider: &'a dyn Provider,
    /// Consecutive failed checks that count as sustained failure.
    failure_threshold: u32,
    /// Delay between polling rounds.
    interval: Duration,
    /// Polling rounds before declaring the deployment stable.
    max_checks: u32,
}

impl std::fmt::Debug for HealthMonitor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("provider", &self.provider.name())
            .field("failure_threshold", &self.failure_threshold)
            .field("interval", &self.interval)
            .field("max_checks", &self.max_checks)
            .finish()
    }
}

impl<'a> HealthMonitor<'a> {
    /// Creates a new monitor.
    #[must_use]
    pub fn new(
        provider: &'a dyn Provider,
        failure_threshold: u32,
        interval: Duration,
        max_checks: u32,
    ) -> Self {
        Self {
            provider,
            failure_threshold: failure_threshold.max(1),
            interval,
            max_checks: max_checks.max(1),
        }
    }

    /// Polls every `(resource_id, provider_id)` target until one fails
    /// `failure_threshold` times in a row or `max_checks` rounds pass.
    ///
    /// A health query that errors counts as a failed check.
    pub async fn watch(&self, targets: &[(String, String)]) -> HealthVerdict {
        if targets.is_empty() {
            return HealthVerdict::Stable;
        }

        info!(
            "Watching {} resource(s) for up to {} health checks",
            targets.len(),
            self.max_checks
        );

        let mut failures: HashMap<&str, u32> = HashMap::new();

        for round in 1..=self.max_checks {
            if round > 1 {
                tokio::time::sleep(self.interval).await;
            }

            for (resource_id, provider_id) in targets {
                let reason = match self.provider.health(provider_id).await {
                    Ok(ResourceHealth::Unhealthy { reason }) => Some(reason),
                    Ok(ResourceHealth::Healthy | ResourceHealth::Pending) => None,
                    Err(e) => Some(format!("health query failed: {e}")),
                };

                let count = failures.entry(resource_id.as_str()).or_insert(0);
                match reason {
                    Some(reason) => {
                        *count += 1;
                        warn!(
                            "{resource_id} unhealthy ({count}/{}): {reason}",
                            self.failure_threshold
                        );
                        if *count >= self.failure_threshold {
                            return HealthVerdict::Failing {
                                resource_id: resource_id.clone(),
                                reason,
                                consecutive: *count,
                            };
                        }
                    }
                    None => {
                        debug!("{resource_id} healthy on check {round}");
                        *count = 0;
                    }
                }
            }
        }

        info!("Deployment stable after {} health checks", self.max_checks);
        HealthVerdict::Stable
    }
}

impl HealthVerdict {
    /// Returns true if the verdict calls for a rollback.
    #[must_use]
    pub const fn is_failing(&self) -> bool {
        matches!(self, Self::Failing { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use crate::provider::MockProvider;
    use mockall::predicate::eq;
    use mockall::Sequence;

    fn targets() -> Vec<(String, String)> {
        vec![(String::from("service"), String::from("service-1"))]
    }

    fn unhealthy() -> ResourceHealth {
        ResourceHealth::Unhealthy { reason: String::from("tasks stopping") }
    }

    #[tokio::test]
    async fn test_sustained_failure_detected() {
        let mut provider = MockProvider::new();
        provider
            .expect_health()
            .with(eq("service-1"))
            .times(3)
            .returning(|_| Ok(unhealthy()));

        let monitor = HealthMonitor::new(&provider, 3, Duration::ZERO, 10);
        let verdict = monitor.watch(&targets()).await;
        assert_eq!(
            verdict,
            HealthVerdict::Failing {
                resource_id: String::from("service"),
                reason: String::from("tasks stopping"),
                consecutive: 3,
            }
        );
    }

    #[tokio::test]
    async fn test_recovery_resets_counter() {
        let mut provider = MockProvider::new();
        let mut seq = Sequence::new();
        for health in [unhealthy(), unhealthy(), ResourceHealth::Healthy, unhealthy()] {
            provider
                .expect_health()
                .times(1)
                .in_sequence(&mut seq)
                .returning(move |_| Ok(health.clone()));
        }

        let monitor = HealthMonitor::new(&provider, 3, Duration::ZERO, 4);
        assert_eq!(monitor.watch(&targets()).await, HealthVerdict::Stable);
    }

    #[tokio::test]
    async fn test_query_errors_count_as_failures() {
        let mut provider = MockProvider::new();
        provider
            .expect_health()
            .times(2)
            .returning(|id| Err(ProviderError::NotFound { provider_id: id.to_string() }));

        let monitor = HealthMonitor::new(&provider, 2, Duration::ZERO, 5);
        assert!(monitor.watch(&targets()).await.is_failing());
    }

    #[tokio::test]
    async fn test_no_targets_is_stable() {
        let provider = MockProvider::new();
        let monitor = HealthMonitor::new(&provider, 1, Duration::ZERO, 1);
        assert_eq!(monitor.watch(&[]).await, HealthVerdict::Stable);
    }
}
