//! Liveness reporting for the event sources.
//!
//! Each source gets a [`HealthHandle`] and reports after every poll cycle. The
//! process is live while every registered source has reported within its
//! deadline; a source stuck on a hung call shows up as `Stalled`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use tracing::warn;

/// Sentinel: source registered but hasn't reported yet.
const HEALTH_STARTING: i64 = 0;

#[derive(Default, Debug)]
pub struct HealthStatus {
    /// True if every registered source is healthy
    pub healthy: bool,
    pub components: BTreeMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComponentStatus {
    Starting,
    HealthyUntil(DateTime<Utc>),
    Stalled,
}

#[derive(Clone)]
pub struct HealthHandle {
    deadline: Duration,
    healthy_until_ms: Arc<AtomicI64>,
}

impl HealthHandle {
    /// Must be called more often than the registered deadline.
    pub fn report_healthy(&self) {
        let until = Utc::now().timestamp_millis().saturating_add(
            i64::try_from(self.deadline.as_millis()).unwrap_or(i64::MAX),
        );
        self.healthy_until_ms.store(until, Ordering::Relaxed);
    }

    /// How often to report while blocked, so the deadline is never missed.
    pub fn report_interval(&self) -> Duration {
        (self.deadline / 2).max(Duration::from_millis(1))
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<BTreeMap<String, Arc<AtomicI64>>>>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a component. Registering the same name twice replaces the first entry.
    pub fn register(&self, component: &str, deadline: Duration) -> HealthHandle {
        let healthy_until_ms = Arc::new(AtomicI64::new(HEALTH_STARTING));
        match self.components.write() {
            Ok(mut components) => {
                components.insert(component.to_owned(), healthy_until_ms.clone());
            }
            Err(_) => warn!("poisoned {} health registry lock", self.name),
        }
        HealthHandle {
            deadline,
            healthy_until_ms,
        }
    }

    /// Overall status of the registered components. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("poisoned {} health registry lock", self.name);
            return HealthStatus::default();
        };

        let now = Utc::now().timestamp_millis();
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: BTreeMap::new(),
        };
        for (name, healthy_until_ms) in components.iter() {
            let until = healthy_until_ms.load(Ordering::Relaxed);
            let component = if until == HEALTH_STARTING {
                ComponentStatus::Starting
            } else if until > now {
                DateTime::from_timestamp_millis(until)
                    .map_or(ComponentStatus::Stalled, ComponentStatus::HealthyUntil)
            } else {
                ComponentStatus::Stalled
            };
            if !matches!(component, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), component);
        }

        if !status.healthy {
            warn!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}
