//! Routing decision types.
//!
//! `RouteClass` is the coarse cost category the classifier assigns to a
//! request; `Tier` is the backend capability level it maps to. The mapping
//! is a fixed, total lookup — never configuration-dependent.

use serde::{Deserialize, Serialize};

use crate::device::DeviceCommand;

/// Coarse cost category for an incoming request.
///
/// The derive order is a total ordering of expected cost, not of
/// semantics: a `DirectCommand` is cheaper to answer than `Hard`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RouteClass {
    /// A structured device command ("turn on the lights")
    DirectCommand,
    /// Short/simple factual requests
    Trivial,
    /// Everyday conversational requests
    Normal,
    /// Multi-step, research, or long-form requests
    Hard,
}

impl std::fmt::Display for RouteClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DirectCommand => "direct_command",
            Self::Trivial => "trivial",
            Self::Normal => "normal",
            Self::Hard => "hard",
        };
        write!(f, "{s}")
    }
}

/// A backend capability level, mapped 1:1 from `RouteClass`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Cheapest tier — direct commands and trivial questions
    Router,
    /// The everyday baseline engine
    Primary,
    /// The expensive escalation tier
    Heavy,
}

impl Tier {
    /// The fixed class→tier lookup table. Total over all four classes.
    pub fn for_class(class: RouteClass) -> Tier {
        match class {
            RouteClass::DirectCommand => Tier::Router,
            RouteClass::Trivial => Tier::Router,
            RouteClass::Normal => Tier::Primary,
            RouteClass::Hard => Tier::Heavy,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Router => "router",
            Self::Primary => "primary",
            Self::Heavy => "heavy",
        };
        write!(f, "{s}")
    }
}

/// The classifier's verdict for one request. Immutable, produced once
/// per request, never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDecision {
    /// The assigned cost category
    pub class: RouteClass,

    /// Rule confidence in [0, 1]
    pub confidence: f32,

    /// Which rule fired, in human-readable form
    pub rationale: String,

    /// Structured command, when the device grammar matched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_command: Option<DeviceCommand>,
}

impl RouteDecision {
    /// A decision with no device command attached.
    pub fn new(class: RouteClass, confidence: f32, rationale: impl Into<String>) -> Self {
        Self {
            class,
            confidence,
            rationale: rationale.into(),
            device_command: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_lookup_is_total() {
        assert_eq!(Tier::for_class(RouteClass::DirectCommand), Tier::Router);
        assert_eq!(Tier::for_class(RouteClass::Trivial), Tier::Router);
        assert_eq!(Tier::for_class(RouteClass::Normal), Tier::Primary);
        assert_eq!(Tier::for_class(RouteClass::Hard), Tier::Heavy);
    }

    #[test]
    fn class_ordering_tracks_expected_cost() {
        assert!(RouteClass::DirectCommand < RouteClass::Trivial);
        assert!(RouteClass::Trivial < RouteClass::Normal);
        assert!(RouteClass::Normal < RouteClass::Hard);
    }

    #[test]
    fn decision_serialization() {
        let decision = RouteDecision::new(RouteClass::Hard, 0.9, "complexity keyword");
        let json = serde_json::to_string(&decision).unwrap();
        assert!(json.contains(r#""class":"hard""#));
        assert!(json.contains("complexity keyword"));
        // no device command, field omitted
        assert!(!json.contains("device_command"));
    }
}
