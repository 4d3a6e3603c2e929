//! `valet health` — print the aggregated health snapshot.

use std::path::Path;
use std::sync::Arc;

pub async fn run(config: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let policy = Arc::new(super::load_policy(config)?);
    let dispatcher = super::build_dispatcher(policy)?;
    let snapshot = dispatcher.health().await;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
