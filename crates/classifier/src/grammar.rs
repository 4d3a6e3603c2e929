//! Device-command grammar.
//!
//! A small fixed grammar of home-automation verbs, matched against
//! lowercased trimmed input. Extraction is best-effort: a parse either
//! yields a full structured command or nothing, never a partial one.

use valet_core::{DeviceAction, DeviceCommand};

/// Verb phrases checked in order; longer phrases first so "turn on"
/// is not shadowed by a bare "on".
const VERB_PHRASES: &[(&str, DeviceAction)] = &[
    ("turn on", DeviceAction::TurnOn),
    ("switch on", DeviceAction::TurnOn),
    ("turn off", DeviceAction::TurnOff),
    ("switch off", DeviceAction::TurnOff),
    ("brighten", DeviceAction::Brighten),
    ("dim", DeviceAction::Dim),
    ("unlock", DeviceAction::Unlock),
    ("lock", DeviceAction::Lock),
    ("disarm", DeviceAction::Disarm),
    ("arm", DeviceAction::Arm),
    ("play", DeviceAction::Play),
    ("pause", DeviceAction::Pause),
];

/// Try to extract a structured device command from free text.
///
/// `text` must already be trimmed and lowercased.
pub fn parse_device_command(text: &str) -> Option<DeviceCommand> {
    // Numeric set-verbs first: they carry a value argument.
    if let Some(cmd) = parse_set_command(text) {
        return Some(cmd);
    }

    for (phrase, action) in VERB_PHRASES {
        if let Some(rest) = strip_verb(text, phrase) {
            let target = clean_target(rest);
            if target.is_empty() && needs_target(*action) {
                continue;
            }
            return Some(DeviceCommand {
                action: *action,
                target,
                value: None,
            });
        }
    }

    None
}

/// "set volume to 40" / "set the temperature to 72" style commands.
fn parse_set_command(text: &str) -> Option<DeviceCommand> {
    let rest = strip_verb(text, "set")?;
    let rest = rest.trim_start();

    let (action, target) = if let Some(r) = rest.strip_prefix("the ") {
        split_set_noun(r)?
    } else {
        split_set_noun(rest)?
    };

    let value = extract_number(text)?;
    Some(DeviceCommand {
        action,
        target: target.into(),
        value: Some(value),
    })
}

fn split_set_noun(rest: &str) -> Option<(DeviceAction, &'static str)> {
    if rest.starts_with("volume") {
        Some((DeviceAction::SetVolume, "volume"))
    } else if rest.starts_with("temperature") || rest.starts_with("thermostat") {
        Some((DeviceAction::SetTemperature, "thermostat"))
    } else {
        None
    }
}

/// Match `phrase` at the start of `text` or after a leading politeness
/// filler ("please ", "can you ", "could you "), requiring a word
/// boundary after the verb.
fn strip_verb<'a>(text: &'a str, phrase: &str) -> Option<&'a str> {
    let candidates = [
        text,
        text.strip_prefix("please ").unwrap_or(text),
        text.strip_prefix("can you ").unwrap_or(text),
        text.strip_prefix("could you ").unwrap_or(text),
    ];
    for candidate in candidates {
        let candidate = candidate.strip_prefix("please ").unwrap_or(candidate);
        if let Some(rest) = candidate.strip_prefix(phrase) {
            if rest.is_empty() || rest.starts_with(' ') {
                return Some(rest);
            }
        }
    }
    None
}

/// Strip articles and trailing punctuation from the target phrase.
fn clean_target(rest: &str) -> String {
    let rest = rest.trim().trim_end_matches(['.', '!', '?']);
    let rest = rest.strip_prefix("the ").unwrap_or(rest);
    let rest = rest.strip_prefix("my ").unwrap_or(rest);
    rest.trim().to_string()
}

/// Verbs that are meaningless without a target.
fn needs_target(action: DeviceAction) -> bool {
    !matches!(action, DeviceAction::Play | DeviceAction::Pause)
}

/// First number in the text, if any.
fn extract_number(text: &str) -> Option<f32> {
    let mut start = None;
    for (i, c) in text.char_indices() {
        if c.is_ascii_digit() || (c == '.' && start.is_some()) {
            if start.is_none() {
                start = Some(i);
            }
        } else if let Some(s) = start {
            return text[s..i].parse().ok();
        }
    }
    start.and_then(|s| text[s..].parse().ok())
}
