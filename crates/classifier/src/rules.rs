//! The ordered rule cascade.
//!
//! Classification is a priority list, not a vote: rules are evaluated
//! top to bottom and the first match wins. Cheap, unambiguous patterns
//! (device commands) come first because misrouting them triggers the
//! wrong side effect; the length and keyword heuristics below them
//! approximate how much model capability a request needs.

use valet_core::{RouteClass, RouteDecision};

use crate::grammar::parse_device_command;

/// One entry in the cascade.
pub struct Rule {
    /// Short name, used in logs and the decision rationale.
    pub name: &'static str,
    /// Returns a decision iff the rule matches `text` (trimmed, lowercased).
    pub apply: fn(&str) -> Option<RouteDecision>,
}

/// The cascade, in evaluation order. The final rule always matches.
pub const RULES: &[Rule] = &[
    Rule {
        name: "device_grammar",
        apply: device_grammar,
    },
    Rule {
        name: "command_keyword",
        apply: command_keyword,
    },
    Rule {
        name: "complexity_keyword",
        apply: complexity_keyword,
    },
    Rule {
        name: "very_short",
        apply: very_short,
    },
    Rule {
        name: "very_long",
        apply: very_long,
    },
    Rule {
        name: "factual_question",
        apply: factual_question,
    },
    Rule {
        name: "how_it_works",
        apply: how_it_works,
    },
    Rule {
        name: "technical",
        apply: technical,
    },
    Rule {
        name: "arithmetic",
        apply: arithmetic,
    },
    Rule {
        name: "default",
        apply: default_rule,
    },
];

// ── Rule predicates ──────────────────────────────────────────────────

fn device_grammar(text: &str) -> Option<RouteDecision> {
    let command = parse_device_command(text)?;
    let mut decision = RouteDecision::new(
        RouteClass::DirectCommand,
        0.95,
        format!("device command: {} {}", command.action, command.target),
    );
    decision.device_command = Some(command);
    Some(decision)
}

const COMMAND_KEYWORDS: &[&str] = &[
    "open ",
    "close ",
    "launch ",
    "mute",
    "unmute",
    "stop the music",
    "shut down",
    "restart",
    "next track",
    "previous track",
];

fn command_keyword(text: &str) -> Option<RouteDecision> {
    let hit = COMMAND_KEYWORDS.iter().find(|k| text.contains(*k))?;
    Some(RouteDecision::new(
        RouteClass::DirectCommand,
        0.9,
        format!("command keyword: {}", hit.trim()),
    ))
}

const COMPLEXITY_KEYWORDS: &[&str] = &[
    "step by step",
    "in depth",
    "comprehensive",
    "research",
    "analyze",
    "analyse",
    "architecture",
    "compare and contrast",
    "pros and cons",
    "trade-off",
    "tradeoff",
];

fn complexity_keyword(text: &str) -> Option<RouteDecision> {
    let hit = COMPLEXITY_KEYWORDS.iter().find(|k| text.contains(*k))?;
    Some(RouteDecision::new(
        RouteClass::Hard,
        0.9,
        format!("complexity keyword: {hit}"),
    ))
}

fn very_short(text: &str) -> Option<RouteDecision> {
    (text.len() < 10).then(|| {
        RouteDecision::new(
            RouteClass::Trivial,
            0.7,
            format!("very short input ({} chars)", text.len()),
        )
    })
}

fn very_long(text: &str) -> Option<RouteDecision> {
    (text.len() > 200).then(|| {
        RouteDecision::new(
            RouteClass::Hard,
            0.8,
            format!("long input ({} chars)", text.len()),
        )
    })
}

const FACTUAL_PREFIXES: &[&str] = &[
    "what is ", "what's ", "who is ", "who's ", "when is ", "when's ", "where is ", "where's ",
];

fn factual_question(text: &str) -> Option<RouteDecision> {
    let has_question_word = ["what", "who", "when", "where"]
        .iter()
        .any(|w| text.contains(w));
    let prefix = FACTUAL_PREFIXES.iter().find(|p| text.starts_with(*p))?;
    (has_question_word).then(|| {
        RouteDecision::new(
            RouteClass::Trivial,
            0.8,
            format!("simple factual question ({})", prefix.trim()),
        )
    })
}

fn how_it_works(text: &str) -> Option<RouteDecision> {
    if !text.contains("how") {
        return None;
    }
    let hit = ["work", "implement", "design"]
        .iter()
        .find(|k| text.contains(*k))?;
    Some(RouteDecision::new(
        RouteClass::Hard,
        0.8,
        format!("explanation request (how + {hit})"),
    ))
}

const TECHNICAL_KEYWORDS: &[&str] = &["code", "function", "class", "algorithm", "implement", "debug"];
const SIMPLICITY_QUALIFIERS: &[&str] = &["simple", "basic", "quick"];

fn technical(text: &str) -> Option<RouteDecision> {
    let hit = TECHNICAL_KEYWORDS.iter().find(|k| text.contains(*k))?;
    let decision = if SIMPLICITY_QUALIFIERS.iter().any(|q| text.contains(q)) {
        RouteDecision::new(
            RouteClass::Normal,
            0.7,
            format!("technical but qualified simple ({hit})"),
        )
    } else {
        RouteDecision::new(RouteClass::Hard, 0.8, format!("technical request ({hit})"))
    };
    Some(decision)
}

fn arithmetic(text: &str) -> Option<RouteDecision> {
    let has_digit = text.chars().any(|c| c.is_ascii_digit());
    let has_cue = text.contains("calculate")
        || text.contains("compute")
        || text.chars().any(|c| matches!(c, '+' | '-' | '*' | '/' | '%'));
    (has_digit && has_cue).then(|| {
        RouteDecision::new(RouteClass::Trivial, 0.8, "simple calculation".to_string())
    })
}

fn default_rule(_text: &str) -> Option<RouteDecision> {
    Some(RouteDecision::new(
        RouteClass::Normal,
        0.6,
        "no specific pattern matched".to_string(),
    ))
}
