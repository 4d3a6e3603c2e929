//! CLI subcommands.

pub mod health;
pub mod route;
pub mod serve;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use valet_config::PolicyConfig;
use valet_dispatch::TierDispatcher;
use valet_session::TranscriptStore;

/// Load policy from an explicit path, or the default location with env
/// overrides applied.
pub fn load_policy(path: Option<&Path>) -> Result<PolicyConfig, valet_config::ConfigError> {
    match path {
        Some(path) => PolicyConfig::load_from(path),
        None => PolicyConfig::load(),
    }
}

/// Assemble the dispatcher from policy: local engine, optional heavy
/// engine, transcript store. No device backend is wired in-process;
/// device automation is an external collaborator.
pub fn build_dispatcher(
    policy: Arc<PolicyConfig>,
) -> Result<Arc<TierDispatcher>, Box<dyn std::error::Error>> {
    #[cfg(not(feature = "local"))]
    {
        let _ = &policy;
        return Err(
            "this build has no local inference support; rebuild with the 'local' feature".into(),
        );
    }

    #[cfg(feature = "local")]
    {
        let local = Arc::new(valet_engines::LocalEngine::new(
            &policy.local_model,
            policy.session.max_contexts,
        ));

        let heavy: Option<Arc<dyn valet_core::GenerationEngine>> = match &policy.heavy.endpoint {
            Some(endpoint) => Some(Arc::new(valet_engines::HeavyEngine::new(
                endpoint.clone(),
                policy.heavy.api_key.clone(),
            )?)),
            None => None,
        };

        let transcripts = Arc::new(TranscriptStore::new(
            policy.session.max_sessions,
            Duration::from_secs(policy.session.session_timeout_secs),
            &policy.persona,
        ));

        Ok(Arc::new(TierDispatcher::new(
            policy, local, heavy, None, transcripts,
        )))
    }
}
