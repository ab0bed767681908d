//! Fleet health report.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::fleet::PoolUsage;
use crate::instance::{GatewayStatus, GatewaySummary};

/// Pool utilisation above which a pool is reported degraded, in percent.
const POOL_DEGRADED_PERCENT: u64 = 90;

/// Overall health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    /// All gateways healthy.
    Healthy,
    /// Gateways still starting, or pools nearly full.
    Degraded,
    /// At least one gateway down or a pool exhausted.
    Unhealthy,
    /// Nothing to report.
    Unknown,
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Result of a single check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    /// Component checked (`gateway:<follower_id>`, `pool:port`, ...).
    pub component: String,

    /// Health state.
    pub state: HealthState,

    /// Human-readable message.
    pub message: Option<String>,

    /// When the underlying observation was made.
    pub checked_at: Option<DateTime<Utc>>,

    /// Additional details.
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,
}

impl HealthCheck {
    fn with_state(component: impl Into<String>, state: HealthState, message: Option<String>) -> Self {
        Self {
            component: component.into(),
            state,
            message,
            checked_at: None,
            details: HashMap::new(),
        }
    }

    /// Create a healthy check result.
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self::with_state(component, HealthState::Healthy, None)
    }

    /// Create a degraded check result.
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_state(component, HealthState::Degraded, Some(message.into()))
    }

    /// Create an unhealthy check result.
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::with_state(component, HealthState::Unhealthy, Some(message.into()))
    }

    /// Add a detail.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.insert(key.into(), v);
        }
        self
    }

    /// Set the observation time.
    #[must_use]
    pub fn at(mut self, checked_at: Option<DateTime<Utc>>) -> Self {
        self.checked_at = checked_at;
        self
    }
}

/// Overall health status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Overall state.
    pub state: HealthState,

    /// When this status was computed.
    pub checked_at: DateTime<Utc>,

    /// Individual check results.
    pub checks: Vec<HealthCheck>,

    /// Manager uptime.
    pub uptime_secs: u64,

    /// Crate version.
    pub version: String,
}

impl HealthStatus {
    /// Create a status from check results.
    #[must_use]
    pub fn from_checks(checks: Vec<HealthCheck>, uptime: Duration) -> Self {
        Self {
            state: Self::aggregate_state(&checks),
            checked_at: Utc::now(),
            checks,
            uptime_secs: uptime.as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    fn aggregate_state(checks: &[HealthCheck]) -> HealthState {
        if checks.is_empty() {
            return HealthState::Unknown;
        }

        let has_unhealthy = checks.iter().any(|c| c.state == HealthState::Unhealthy);
        let has_degraded = checks
            .iter()
            .any(|c| matches!(c.state, HealthState::Degraded | HealthState::Unknown));

        if has_unhealthy {
            HealthState::Unhealthy
        } else if has_degraded {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    /// Whether everything is healthy.
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == HealthState::Healthy
    }

    /// Unhealthy checks.
    #[must_use]
    pub fn unhealthy_checks(&self) -> Vec<&HealthCheck> {
        self.checks
            .iter()
            .filter(|c| c.state == HealthState::Unhealthy)
            .collect()
    }
}

fn gateway_check(follower_id: &str, summary: &GatewaySummary) -> HealthCheck {
    let component = format!("gateway:{follower_id}");
    let check = match summary.status {
        GatewayStatus::Running => HealthCheck::healthy(component),
        GatewayStatus::Starting => HealthCheck::degraded(component, "starting"),
        GatewayStatus::Error => HealthCheck::unhealthy(
            component,
            summary.last_error.clone().unwrap_or_else(|| "error".to_string()),
        ),
        GatewayStatus::Stopped => HealthCheck::degraded(component, "stopping"),
    };
    check
        .at(summary.last_checked_at)
        .with_detail("host_port", summary.host_port)
        .with_detail("client_id", summary.client_id)
        .with_detail("connected", summary.connected)
}

fn pool_check(name: &str, in_use: usize, capacity: u64) -> HealthCheck {
    let component = format!("pool:{name}");
    let used = u64::try_from(in_use).unwrap_or(u64::MAX);
    let check = if capacity > 0 && used >= capacity {
        HealthCheck::unhealthy(component, format!("{name} pool exhausted"))
    } else if used.saturating_mul(100) > capacity.saturating_mul(POOL_DEGRADED_PERCENT) {
        HealthCheck::degraded(component, format!("{name} pool above {POOL_DEGRADED_PERCENT}%"))
    } else {
        HealthCheck::healthy(component)
    };
    check.with_detail("in_use", used).with_detail("capacity", capacity)
}

/// Build the fleet report from gateway summaries and pool usage.
#[must_use]
pub fn fleet_health(
    gateways: &BTreeMap<String, GatewaySummary>,
    pools: &PoolUsage,
    uptime: Duration,
) -> HealthStatus {
    let mut checks: Vec<HealthCheck> = gateways
        .iter()
        .map(|(id, summary)| gateway_check(id, summary))
        .collect();
    checks.push(pool_check("port", pools.ports.len(), pools.port_capacity));
    checks.push(pool_check("client_id", pools.client_ids.len(), pools.client_id_capacity));
    HealthStatus::from_checks(checks, uptime)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(status: GatewayStatus) -> GatewaySummary {
        GatewaySummary {
            status,
            host_port: 4100,
            client_id: 1,
            container_name: "ibgw-f".into(),
            container_id: "c".into(),
            connected: status == GatewayStatus::Running,
            last_checked_at: None,
            last_error: (status == GatewayStatus::Error).then(|| "container is exited".to_string()),
        }
    }

    fn pools(ports: usize, capacity: u64) -> PoolUsage {
        PoolUsage {
            ports: (4100u16..).take(ports).collect(),
            port_capacity: capacity,
            client_ids: vec![1],
            client_id_capacity: 999,
        }
    }

    #[test]
    fn all_running_is_healthy() {
        let gateways = BTreeMap::from([
            ("a".to_string(), summary(GatewayStatus::Running)),
            ("b".to_string(), summary(GatewayStatus::Running)),
        ]);
        let status = fleet_health(&gateways, &pools(2, 100), Duration::from_secs(5));
        assert!(status.is_healthy());
        assert_eq!(status.checks.len(), 4);
        assert_eq!(status.uptime_secs, 5);
    }

    #[test]
    fn starting_degrades_error_fails() {
        let gateways = BTreeMap::from([
            ("a".to_string(), summary(GatewayStatus::Running)),
            ("b".to_string(), summary(GatewayStatus::Starting)),
        ]);
        let status = fleet_health(&gateways, &pools(2, 100), Duration::ZERO);
        assert_eq!(status.state, HealthState::Degraded);

        let gateways = BTreeMap::from([("c".to_string(), summary(GatewayStatus::Error))]);
        let status = fleet_health(&gateways, &pools(1, 100), Duration::ZERO);
        assert_eq!(status.state, HealthState::Unhealthy);
        let failing = status.unhealthy_checks();
        assert_eq!(failing[0].component, "gateway:c");
        assert_eq!(failing[0].message.as_deref(), Some("container is exited"));
    }

    #[test]
    fn pool_pressure() {
        let empty = BTreeMap::new();
        assert_eq!(
            fleet_health(&empty, &pools(95, 100), Duration::ZERO).state,
            HealthState::Degraded
        );
        let status = fleet_health(&empty, &pools(10, 10), Duration::ZERO);
        assert_eq!(status.state, HealthState::Unhealthy);
        assert_eq!(status.unhealthy_checks()[0].component, "pool:port");
    }

    #[test]
    fn state_display() {
        assert_eq!(HealthState::Healthy.to_string(), "healthy");
        assert_eq!(HealthState::Unknown.to_string(), "unknown");
        assert_eq!(
            HealthStatus::from_checks(Vec::new(), Duration::ZERO).state,
            HealthState::Unknown
        );
    }
}
