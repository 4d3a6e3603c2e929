//! Aggregated health snapshot.
//!
//! Health never errors: an unconfigured or unreachable backend is a
//! structured status, not an exception.

use serde::Serialize;

use valet_core::EngineHealth;

/// Everything `GET /health/summary` reports about the routing core.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Per-engine readiness, local first.
    pub engines: Vec<EngineHealth>,

    /// Routing-policy summary.
    pub routing: RoutingSummary,

    /// Session-cache occupancy.
    pub sessions: SessionStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingSummary {
    pub fallback_enabled: bool,
    pub busy_policy: String,
    pub heavy_configured: bool,
    pub local_model: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub active_sessions: usize,
    pub max_sessions: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use valet_core::EngineStatus;

    #[test]
    fn snapshot_serializes() {
        let snapshot = HealthSnapshot {
            engines: vec![EngineHealth {
                name: "local".into(),
                status: EngineStatus::Cold,
                model: Some("tinyllama".into()),
                detail: None,
            }],
            routing: RoutingSummary {
                fallback_enabled: true,
                busy_policy: "queue".into(),
                heavy_configured: false,
                local_model: "tinyllama".into(),
            },
            sessions: SessionStats {
                active_sessions: 2,
                max_sessions: 64,
            },
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains(r#""status":"cold""#));
        assert!(json.contains(r#""heavy_configured":false"#));
    }
}
