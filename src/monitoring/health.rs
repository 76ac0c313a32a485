use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub checks: Vec<ComponentHealth>,
}

/// Component health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
}

impl ComponentHealth {
    pub fn new(name: &str, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
        }
    }
}

impl HealthCheckResult {
    /// Fold component checks into an overall status; the worst component wins
    pub fn from_components(checks: Vec<ComponentHealth>) -> Self {
        let mut overall_status = HealthStatus::Healthy;
        let mut messages = Vec::new();

        for component in &checks {
            match component.status {
                HealthStatus::Unhealthy => {
                    overall_status = HealthStatus::Unhealthy;
                    messages.push(format!("{}: {}", component.name, component.message));
                }
                HealthStatus::Degraded => {
                    if overall_status == HealthStatus::Healthy {
                        overall_status = HealthStatus::Degraded;
                    }
                    messages.push(format!("{}: {}", component.name, component.message));
                }
                HealthStatus::Healthy => {}
            }
        }

        let message = if messages.is_empty() {
            "All systems operational".to_string()
        } else {
            messages.join("; ")
        };

        Self {
            status: overall_status,
            message,
            timestamp: Utc::now(),
            checks,
        }
    }
}
