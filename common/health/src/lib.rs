use std::collections::HashMap;
use std::fmt::Display;
use std::ops::Add;
use std::sync::{Arc, PoisonError, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use tokio::runtime;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Health reporting for messaging channels.
///
/// Every incoming or outgoing channel registers itself as a component and
/// reports through its `HealthHandle`. On top of component liveness, the
/// registry keeps the application failures reported by mediators: a
/// processing method whose stream terminated with an error makes the whole
/// registry unhealthy, because the channel it was draining is stopped.
///
/// The overall status is computed on read:
///   - any reported application failure makes the registry unhealthy
///   - with `HealthStrategy::All`, every component must be healthy
///   - with `HealthStrategy::Any`, at least one component must be healthy
///   - a component that did not report before its deadline is `Stalled`

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if the registry is healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
    /// Application failures reported by processing methods, keyed by method
    pub failures: HashMap<String, String>,
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code based on the overall health status,
    /// and prints each component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy, with the reason given by the component
    Unhealthy(String),
    /// Automatically set when the HealthyUntil deadline is reached
    Stalled,
}

impl ComponentStatus {
    /// Returns true if the component is currently healthy (i.e., has a valid HealthyUntil status)
    pub fn is_healthy(&self) -> bool {
        match self {
            ComponentStatus::HealthyUntil(until) => until.gt(&time::OffsetDateTime::now_utc()),
            _ => false,
        }
    }
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    pub fn component(&self) -> &str {
        &self.component
    }

    /// Asynchronously report healthy, returns when the message is queued.
    /// Must be called more frequently than the configured deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    /// Asynchronously report the component as unhealthy.
    pub async fn report_unhealthy(&self, reason: impl Display) {
        self.report_status(ComponentStatus::Unhealthy(reason.to_string()))
            .await
    }

    /// Asynchronously report component status, returns when the message is queued.
    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }

    /// Synchronously report as healthy, returns when the message is queued.
    /// Must be called more frequently than the configured deadline.
    pub fn report_healthy_blocking(&self) {
        self.report_status_blocking(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    /// Synchronously report component status, returns when the message is queued.
    pub fn report_status_blocking(&self, status: ComponentStatus) {
        // Don't block inside an async context, spawn instead
        if let Ok(h) = runtime::Handle::try_current() {
            let m = self.clone();
            h.spawn(async move { m.report_status(status).await });
        } else {
            let message = HealthMessage {
                component: self.component.clone(),
                status,
            };
            if let Err(err) = self.sender.blocking_send(message) {
                warn!("failed to report health status: {}", err)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum HealthStrategy {
    /// All components must be healthy for the registry to be healthy
    All,
    /// At least one component must be healthy for the registry to be healthy
    Any,
}

impl std::str::FromStr for HealthStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "all" => Ok(HealthStrategy::All),
            "any" => Ok(HealthStrategy::Any),
            _ => Err(format!("Unknown Health Strategy: {s}, must be ALL or ANY")),
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    strategy: HealthStrategy,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    failures: Arc<RwLock<HashMap<String, String>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self::new_with_strategy(name, HealthStrategy::All)
    }

    pub fn new_with_strategy(name: &str, strategy: HealthStrategy) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            strategy,
            components: Default::default(),
            failures: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let mut map = components.write().unwrap_or_else(PoisonError::into_inner);
                drop(map.insert(message.component, message.status));
            }
        });

        registry
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers a new component in the registry. The returned handle should be passed
    /// to the component, to allow it to frequently report its health status.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Records that a processing method failed terminally. The registry stays
    /// unhealthy until the failure is cleared.
    pub fn report_application_failure(&self, method: &str, cause: &dyn Display) {
        error!(method, "application failure reported: {cause}");
        let mut failures = self
            .failures
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        drop(failures.insert(method.to_owned(), cause.to_string()));
    }

    /// Forgets a previously reported application failure, e.g. after the
    /// method's channel was rebuilt.
    pub fn clear_application_failure(&self, method: &str) {
        let mut failures = self
            .failures
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        drop(failures.remove(method));
    }

    /// Returns the overall process status, computed from the status of all the components
    /// currently registered. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let failures = self
            .failures
            .read()
            .unwrap_or_else(PoisonError::into_inner);

        let result = HealthStatus {
            // unhealthy if no component has registered yet or if we're using the "Any" strategy
            // "All" defaults to true and is set to false if any healthcheck fails
            // "Any" defaults to false and is set to true if any healthcheck passes
            healthy: !components.is_empty() && self.strategy == HealthStrategy::All,
            components: Default::default(),
            failures: failures.clone(),
        };
        let now = time::OffsetDateTime::now_utc();

        let mut result = components
            .iter()
            .fold(result, |mut result, (name, status)| {
                match status {
                    ComponentStatus::HealthyUntil(until) => {
                        if until.gt(&now) {
                            if self.strategy == HealthStrategy::Any {
                                result.healthy = true;
                            }
                            drop(result.components.insert(name.clone(), status.clone()))
                        } else {
                            if self.strategy == HealthStrategy::All {
                                result.healthy = false;
                            }
                            drop(
                                result
                                    .components
                                    .insert(name.clone(), ComponentStatus::Stalled),
                            )
                        }
                    }
                    _ => {
                        if self.strategy == HealthStrategy::All {
                            result.healthy = false;
                        }
                        drop(result.components.insert(name.clone(), status.clone()))
                    }
                }
                result
            });
        if !result.failures.is_empty() {
            result.healthy = false;
        }
        match result.healthy {
            true => info!("{} health check ok", self.name),
            false => warn!(
                "{} health check failed: {:?} {:?}",
                self.name, result.components, result.failures
            ),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use crate::{ComponentStatus, HealthRegistry, HealthStatus, HealthStrategy};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use std::ops::{Add, Sub};
    use std::time::Duration;
    use time::OffsetDateTime;

    async fn assert_or_retry<F>(check: F)
    where
        F: Fn() -> bool,
    {
        let deadline = OffsetDateTime::now_utc().add(time::Duration::seconds(5));
        while !check() && OffsetDateTime::now_utc().lt(&deadline) {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(check())
    }

    #[tokio::test]
    async fn defaults_to_unhealthy() {
        let registry = HealthRegistry::new("channels");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn channel_goes_healthy_then_unhealthy_with_reason() {
        let registry = HealthRegistry::new("channels");

        let handle = registry
            .register("orders".to_string(), Duration::from_secs(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 1).await;
        assert_eq!(
            registry.get_status().components.get("orders"),
            Some(&ComponentStatus::Starting)
        );

        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        handle.report_unhealthy("nack all - [3, 4, 5]").await;
        assert_or_retry(|| !registry.get_status().healthy).await;
        assert_eq!(
            registry.get_status().components.get("orders"),
            Some(&ComponentStatus::Unhealthy("nack all - [3, 4, 5]".to_string()))
        );
    }

    #[tokio::test]
    async fn stale_channel_is_stalled() {
        let registry = HealthRegistry::new("channels");
        let handle = registry
            .register("orders".to_string(), Duration::from_secs(30))
            .await;

        handle
            .report_status(ComponentStatus::HealthyUntil(
                OffsetDateTime::now_utc().sub(time::Duration::seconds(1)),
            ))
            .await;
        assert_or_retry(|| {
            registry.get_status().components.get("orders") == Some(&ComponentStatus::Stalled)
        })
        .await;
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn application_failure_overrides_healthy_channels() {
        let registry = HealthRegistry::new("channels");
        let handle = registry
            .register("orders".to_string(), Duration::from_secs(30))
            .await;
        handle.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        registry.report_application_failure("OrderBean#process", &"boom");
        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.failures.get("OrderBean#process"),
            Some(&"boom".to_string())
        );

        registry.clear_application_failure("OrderBean#process");
        assert!(registry.get_status().healthy);
    }

    #[tokio::test]
    async fn any_strategy() {
        let registry = HealthRegistry::new_with_strategy("channels", HealthStrategy::Any);
        let handle1 = registry
            .register("one".to_string(), Duration::from_secs(30))
            .await;
        let handle2 = registry
            .register("two".to_string(), Duration::from_secs(30))
            .await;
        assert_or_retry(|| registry.get_status().components.len() == 2).await;
        assert!(!registry.get_status().healthy);

        handle1.report_healthy().await;
        assert_or_retry(|| registry.get_status().healthy).await;

        handle2.report_unhealthy("stopped").await;
        assert_or_retry(|| {
            registry.get_status().components.get("two")
                == Some(&ComponentStatus::Unhealthy("stopped".to_string()))
        })
        .await;
        assert!(registry.get_status().healthy);

        handle1.report_unhealthy("stopped").await;
        assert_or_retry(|| !registry.get_status().healthy).await;
    }

    #[tokio::test]
    async fn into_response() {
        let nok = HealthStatus::default().into_response();
        assert_eq!(nok.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let ok = HealthStatus {
            healthy: true,
            ..Default::default()
        }
        .into_response();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[test]
    fn health_strategy_from_str() {
        assert_eq!(
            "ALL".parse::<HealthStrategy>().unwrap(),
            HealthStrategy::All
        );
        assert_eq!(
            "any".parse::<HealthStrategy>().unwrap(),
            HealthStrategy::Any
        );
        assert!("invalid".parse::<HealthStrategy>().is_err());
    }
}
