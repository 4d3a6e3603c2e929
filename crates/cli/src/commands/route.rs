//! `valet route` — show the routing decision for a prompt.
//!
//! A debugging aid: runs the classifier only, no engines, no session
//! state, no network.

use valet_classifier::classify;
use valet_core::Tier;

pub fn run(prompt: &str) -> Result<(), Box<dyn std::error::Error>> {
    let decision = classify(prompt);
    let tier = Tier::for_class(decision.class);

    let report = serde_json::json!({
        "class": decision.class,
        "confidence": decision.confidence,
        "rationale": decision.rationale,
        "tier": tier,
        "device_command": decision.device_command,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
