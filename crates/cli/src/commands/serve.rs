//! `valet serve` — start the HTTP gateway.

use std::path::Path;
use std::sync::Arc;

use tracing::info;
use valet_gateway::GatewayState;

pub async fn run(
    port_override: Option<u16>,
    config: Option<&Path>,
) -> Result<(), Box<dyn std::error::Error>> {
    let policy = Arc::new(super::load_policy(config)?);
    let host = policy.gateway.host.clone();
    let port = port_override.unwrap_or(policy.gateway.port);

    info!(
        local_model = %policy.local_model,
        heavy = policy.heavy.is_configured(),
        fallback = policy.fallback_enabled,
        "Starting Valet"
    );

    let dispatcher = super::build_dispatcher(policy)?;
    let state = GatewayState::new(dispatcher);
    valet_gateway::serve(state, &host, port).await
}
