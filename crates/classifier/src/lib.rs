//! Request classification for Valet.
//!
//! `classify` is a pure, total function from request text to a
//! `RouteDecision`: no I/O, no state, same input always yields the same
//! output. The decision carries a coarse cost class, a fixed confidence,
//! a human-readable rationale, and (for device commands) the extracted
//! structured command. The dispatcher maps the class to a tier; nothing
//! here touches engines or sessions.

mod grammar;
mod rules;

pub use grammar::parse_device_command;
pub use rules::{Rule, RULES};

use valet_core::RouteDecision;

/// Classify request text into a routing decision.
///
/// Matching is case-insensitive and ignores surrounding whitespace.
/// Always returns a decision; the cascade ends in an unconditional
/// default rule.
pub fn classify(text: &str) -> RouteDecision {
    let normalized = text.trim().to_lowercase();
    for rule in RULES {
        if let Some(decision) = (rule.apply)(&normalized) {
            return decision;
        }
    }
    // The cascade is total by construction; this is unreachable but we
    // return a conservative decision rather than panic.
    RouteDecision::new(
        valet_core::RouteClass::Normal,
        0.6,
        "no specific pattern matched".to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use valet_core::{RouteClass, Tier};

    #[test]
    fn device_commands_classify_high_confidence() {
        for text in ["turn on the lights", "lock the doors", "set temperature to 72"] {
            let d = classify(text);
            assert_eq!(d.class, RouteClass::DirectCommand, "{text}");
            assert!(d.confidence > 0.8, "{text}");
            assert!(d.device_command.is_some(), "{text}");
        }
    }

    #[test]
    fn short_inputs_are_trivial() {
        assert_eq!(classify("hi").class, RouteClass::Trivial);
        assert_eq!(classify("").class, RouteClass::Trivial);
        assert_eq!(classify("   ").class, RouteClass::Trivial);
    }

    #[test]
    fn long_inputs_are_hard() {
        let text = "please summarize everything we discussed about the garden renovation, \
                    including the choices for the patio surface, the lighting layout along \
                    the north fence, and the irrigation schedule we settled on for summer";
        assert!(text.len() > 200);
        assert_eq!(classify(text).class, RouteClass::Hard);
    }

    #[test]
    fn arithmetic_is_trivial_with_rationale() {
        let d = classify("calculate 15 + 27");
        assert_eq!(d.class, RouteClass::Trivial);
        assert!(d.rationale.contains("calculation"), "{}", d.rationale);
    }

    #[test]
    fn factual_questions_are_trivial() {
        assert_eq!(classify("What is the capital of France").class, RouteClass::Trivial);
        assert_eq!(classify("who's the president").class, RouteClass::Trivial);
    }

    #[test]
    fn how_it_works_is_hard() {
        assert_eq!(
            classify("how does garbage collection work").class,
            RouteClass::Hard
        );
    }

    #[test]
    fn default_is_normal() {
        let d = classify("tell me about your weekend plans sometime");
        assert_eq!(d.class, RouteClass::Normal);
        assert_eq!(d.confidence, 0.6);
    }

    #[test]
    fn classification_is_deterministic() {
        let a = classify("write a quick function to sort a list");
        let b = classify("write a quick function to sort a list");
        assert_eq!(a.class, b.class);
        assert_eq!(a.confidence, b.confidence);
        assert_eq!(a.rationale, b.rationale);
    }

    #[test]
    fn case_and_whitespace_insensitive() {
        let a = classify("  TURN ON THE LIGHTS  ");
        assert_eq!(a.class, RouteClass::DirectCommand);
    }

    #[test]
    fn every_class_maps_to_a_tier() {
        assert_eq!(Tier::for_class(RouteClass::DirectCommand), Tier::Router);
        assert_eq!(Tier::for_class(RouteClass::Trivial), Tier::Router);
        assert_eq!(Tier::for_class(RouteClass::Normal), Tier::Primary);
        assert_eq!(Tier::for_class(RouteClass::Hard), Tier::Heavy);
    }
}
