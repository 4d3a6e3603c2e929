//! The tier dispatcher.
//!
//! One pipeline per request: classify, try the device stage, resolve
//! the tier, select an engine, stream, and relay. The relay task owns
//! the session permit, so the session unlocks on every exit path
//! including the caller dropping the stream mid-generation.
//!
//! Fallback is bounded: at most one retry, always against the local
//! engine, only when policy enables it and the failing tier is not
//! already `primary`. The retry's own failure propagates unmodified.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use valet_classifier::classify;
use valet_config::{BusyPolicy, PolicyConfig};
use valet_core::{
    DeviceActions, EngineError, EngineHealth, EngineStatus, Error, EventStream, GenerationEngine,
    GenerationEvent, GenerationParams, Message, RouteClass, RouteDecision, SessionId, Tier,
};
use valet_session::{SessionGate, SessionPermit, TranscriptStore};

use crate::health::{HealthSnapshot, RoutingSummary, SessionStats};

/// Outcome of the device-command stage. Failure is not an error here:
/// anything short of a confirmed execution falls through to generation.
enum DeviceOutcome {
    /// The command ran; carry the confirmation text to the caller.
    Handled(String),
    /// Not a device command, no backend, or execution failed.
    Fallthrough,
}

pub struct TierDispatcher {
    policy: Arc<PolicyConfig>,
    local: Arc<dyn GenerationEngine>,
    heavy: Option<Arc<dyn GenerationEngine>>,
    device: Option<Arc<dyn DeviceActions>>,
    transcripts: Arc<TranscriptStore>,
    gate: SessionGate,
}

impl TierDispatcher {
    pub fn new(
        policy: Arc<PolicyConfig>,
        local: Arc<dyn GenerationEngine>,
        heavy: Option<Arc<dyn GenerationEngine>>,
        device: Option<Arc<dyn DeviceActions>>,
        transcripts: Arc<TranscriptStore>,
    ) -> Self {
        Self {
            policy,
            local,
            heavy,
            device,
            transcripts,
            gate: SessionGate::new(),
        }
    }

    /// Route and stream one request.
    ///
    /// The returned stream obeys the event protocol: at most one
    /// `First`, zero or more `Token`, exactly one terminal `Done` on
    /// success. Engine failures arrive as `Err` items on the stream;
    /// failures before the stream starts return `Err` here.
    pub async fn generate(
        &self,
        session_id: &SessionId,
        prompt: &str,
        caller_params: Option<GenerationParams>,
    ) -> Result<EventStream, Error> {
        let permit = match self.policy.session.busy_policy {
            BusyPolicy::Queue => self.gate.acquire(session_id).await,
            BusyPolicy::Reject => self.gate.try_acquire(session_id)?,
        };

        let decision = classify(prompt);
        let tier = Tier::for_class(decision.class);
        if self.policy.log_routing_decisions {
            info!(
                session_id = %session_id,
                class = %decision.class,
                confidence = decision.confidence,
                tier = %tier,
                rationale = %decision.rationale,
                "Routing decision"
            );
        }

        if let DeviceOutcome::Handled(text) = self.device_stage(&decision).await {
            self.transcripts.append_user(session_id, prompt).await;
            self.transcripts.append_assistant(session_id, &text).await;
            return Ok(synthesized_stream(text, permit));
        }

        let defaults = self.policy.tiers.get(tier).params();
        let merged = caller_params.unwrap_or_default().merged_over(&defaults);

        let session = self.transcripts.append_user(session_id, prompt).await;
        let messages = session.messages;

        let engine = self.engine_for(tier);
        let mut fallback = self.fallback_engine(tier);

        let stream = match engine.stream(session_id, &messages, &merged).await {
            Ok(stream) => stream,
            Err(e) => match fallback.take() {
                Some(local) => {
                    warn!(
                        engine = engine.name(),
                        error = %e,
                        "Engine call failed, retrying on local"
                    );
                    local.stream(session_id, &messages, &merged).await?
                }
                None => return Err(e.into()),
            },
        };

        Ok(self.relay(stream, session_id.clone(), messages, merged, fallback, permit))
    }

    /// Health snapshot. Never errors: unconfigured and unreachable
    /// backends report structured statuses.
    pub async fn health(&self) -> HealthSnapshot {
        let mut engines = vec![self.local.health().await];
        match &self.heavy {
            Some(heavy) => engines.push(heavy.health().await),
            None => engines.push(EngineHealth {
                name: "heavy".into(),
                status: EngineStatus::NotConfigured,
                model: None,
                detail: Some("no heavy endpoint in policy".into()),
            }),
        }

        HealthSnapshot {
            engines,
            routing: RoutingSummary {
                fallback_enabled: self.policy.fallback_enabled,
                busy_policy: match self.policy.session.busy_policy {
                    BusyPolicy::Queue => "queue".into(),
                    BusyPolicy::Reject => "reject".into(),
                },
                heavy_configured: self.heavy.is_some(),
                local_model: self.policy.local_model.clone(),
            },
            sessions: SessionStats {
                active_sessions: self.transcripts.len().await,
                max_sessions: self.policy.session.max_sessions,
            },
        }
    }

    /// Reset a session's transcript. The generation context, if any,
    /// stays warm; the two lifetimes are independent.
    pub async fn clear_session(&self, session_id: &SessionId) -> bool {
        self.transcripts.reset(session_id).await
    }

    /// Heavy tier gets the heavy engine only when one is configured;
    /// everything else runs locally.
    fn engine_for(&self, tier: Tier) -> Arc<dyn GenerationEngine> {
        match (tier, &self.heavy) {
            (Tier::Heavy, Some(heavy)) => heavy.clone(),
            _ => self.local.clone(),
        }
    }

    /// The single permitted retry target, or None when policy disables
    /// fallback or the tier is already primary.
    fn fallback_engine(&self, tier: Tier) -> Option<Arc<dyn GenerationEngine>> {
        if self.policy.fallback_enabled && tier != Tier::Primary {
            Some(self.local.clone())
        } else {
            None
        }
    }

    async fn device_stage(&self, decision: &RouteDecision) -> DeviceOutcome {
        if decision.class != RouteClass::DirectCommand {
            return DeviceOutcome::Fallthrough;
        }
        let Some(command) = &decision.device_command else {
            return DeviceOutcome::Fallthrough;
        };
        let Some(device) = &self.device else {
            debug!("No device backend configured, falling through to generation");
            return DeviceOutcome::Fallthrough;
        };

        match device.execute(command).await {
            Ok(text) => {
                info!(action = %command.action, target = %command.target, "Device command handled");
                DeviceOutcome::Handled(text)
            }
            Err(e) => {
                warn!(
                    action = %command.action,
                    error = %e,
                    "Device command failed, falling through to generation"
                );
                DeviceOutcome::Fallthrough
            }
        }
    }

    /// Forward engine events to the caller, normalizing the protocol:
    /// duplicate `First`s are suppressed, the assistant turn is appended
    /// to the transcript when `Done` arrives, and a mid-stream failure
    /// before any token flowed may switch to the fallback engine once.
    fn relay(
        &self,
        mut stream: EventStream,
        session_id: SessionId,
        messages: Vec<Message>,
        params: GenerationParams,
        mut fallback: Option<Arc<dyn GenerationEngine>>,
        permit: SessionPermit,
    ) -> EventStream {
        let (tx, rx) = mpsc::channel(64);
        let transcripts = self.transcripts.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let mut collected = String::new();
            let mut first_relayed = false;
            let mut token_relayed = false;

            loop {
                match stream.recv().await {
                    Some(Ok(GenerationEvent::First { ms })) => {
                        if first_relayed {
                            continue;
                        }
                        first_relayed = true;
                        if tx.send(Ok(GenerationEvent::First { ms })).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(GenerationEvent::Token { text })) => {
                        collected.push_str(&text);
                        token_relayed = true;
                        if tx.send(Ok(GenerationEvent::Token { text })).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(GenerationEvent::Done)) => {
                        if !collected.is_empty() {
                            transcripts.append_assistant(&session_id, &collected).await;
                        }
                        let _ = tx.send(Ok(GenerationEvent::Done)).await;
                        return;
                    }
                    Some(Err(e)) => {
                        if let Some(local) = fallback.take() {
                            if !token_relayed {
                                warn!(error = %e, "Stream failed before first token, retrying on local");
                                match local.stream(&session_id, &messages, &params).await {
                                    Ok(retry) => {
                                        stream = retry;
                                        collected.clear();
                                        continue;
                                    }
                                    Err(retry_err) => {
                                        let _ = tx.send(Err(retry_err)).await;
                                        return;
                                    }
                                }
                            }
                        }
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                    None => {
                        // Engines terminate with Done; a bare close is a
                        // broken stream.
                        let _ = tx
                            .send(Err(EngineError::StreamInterrupted(
                                "engine stream ended without done".into(),
                            )))
                            .await;
                        return;
                    }
                }
            }
        });

        rx
    }
}

/// The three-event stream for a handled device command.
fn synthesized_stream(text: String, permit: SessionPermit) -> EventStream {
    let (tx, rx) = mpsc::channel(4);
    tokio::spawn(async move {
        let _permit = permit;
        let _ = tx.send(Ok(GenerationEvent::First { ms: 0 })).await;
        let _ = tx.send(Ok(GenerationEvent::Token { text })).await;
        let _ = tx.send(Ok(GenerationEvent::Done)).await;
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use valet_core::{DeviceCommand, DeviceError};

    // ── Stubs ──────────────────────────────────────────────────────────

    enum StubBehavior {
        /// Emit first + these tokens + done.
        Succeed(Vec<&'static str>),
        /// Fail the stream() call itself.
        FailCall,
        /// Open the stream, then yield an error before any token.
        FailMidStream,
        /// Open the stream and hold it for a while before finishing.
        Slow(Duration),
    }

    struct StubEngine {
        label: &'static str,
        behavior: StubBehavior,
        calls: AtomicUsize,
    }

    impl StubEngine {
        fn new(label: &'static str, behavior: StubBehavior) -> Arc<Self> {
            Arc::new(Self {
                label,
                behavior,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl GenerationEngine for StubEngine {
        fn name(&self) -> &str {
            self.label
        }

        async fn stream(
            &self,
            _session_id: &SessionId,
            _messages: &[Message],
            _params: &GenerationParams,
        ) -> Result<EventStream, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                StubBehavior::FailCall => {
                    Err(EngineError::Network("connection refused".into()))
                }
                StubBehavior::Succeed(tokens) => {
                    let tokens: Vec<String> = tokens.iter().map(|t| t.to_string()).collect();
                    let (tx, rx) = mpsc::channel(16);
                    tokio::spawn(async move {
                        let _ = tx.send(Ok(GenerationEvent::First { ms: 3 })).await;
                        for text in tokens {
                            let _ = tx.send(Ok(GenerationEvent::Token { text })).await;
                        }
                        let _ = tx.send(Ok(GenerationEvent::Done)).await;
                    });
                    Ok(rx)
                }
                StubBehavior::FailMidStream => {
                    let (tx, rx) = mpsc::channel(4);
                    tokio::spawn(async move {
                        let _ = tx
                            .send(Err(EngineError::StreamInterrupted("connection reset".into())))
                            .await;
                    });
                    Ok(rx)
                }
                StubBehavior::Slow(delay) => {
                    let delay = *delay;
                    let (tx, rx) = mpsc::channel(4);
                    tokio::spawn(async move {
                        let _ = tx.send(Ok(GenerationEvent::First { ms: 1 })).await;
                        tokio::time::sleep(delay).await;
                        let _ = tx
                            .send(Ok(GenerationEvent::Token { text: "ok".into() }))
                            .await;
                        let _ = tx.send(Ok(GenerationEvent::Done)).await;
                    });
                    Ok(rx)
                }
            }
        }

        async fn health(&self) -> EngineHealth {
            EngineHealth {
                name: self.label.into(),
                status: EngineStatus::Ready,
                model: None,
                detail: None,
            }
        }
    }

    struct StubDevice {
        fail: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DeviceActions for StubDevice {
        fn name(&self) -> &str {
            "stub-device"
        }

        async fn execute(&self, command: &DeviceCommand) -> Result<String, DeviceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(DeviceError::ExecutionFailed {
                    command: command.target.clone(),
                    reason: "hub offline".into(),
                })
            } else {
                Ok(format!("Done: {} {}", command.action, command.target))
            }
        }
    }

    // ── Helpers ────────────────────────────────────────────────────────

    fn transcripts() -> Arc<TranscriptStore> {
        Arc::new(TranscriptStore::new(
            16,
            Duration::from_secs(1800),
            "You are a test assistant.",
        ))
    }

    fn dispatcher(
        policy: PolicyConfig,
        local: Arc<StubEngine>,
        heavy: Option<Arc<StubEngine>>,
        device: Option<Arc<StubDevice>>,
    ) -> TierDispatcher {
        TierDispatcher::new(
            Arc::new(policy),
            local,
            heavy.map(|h| h as Arc<dyn GenerationEngine>),
            device.map(|d| d as Arc<dyn DeviceActions>),
            transcripts(),
        )
    }

    async fn collect(mut stream: EventStream) -> Vec<Result<GenerationEvent, EngineError>> {
        let mut events = Vec::new();
        while let Some(event) = stream.recv().await {
            events.push(event);
        }
        events
    }

    fn assert_protocol(events: &[Result<GenerationEvent, EngineError>]) {
        let types: Vec<&str> = events
            .iter()
            .map(|e| match e {
                Ok(ev) => ev.event_type(),
                Err(_) => "error",
            })
            .collect();
        let done_count = types.iter().filter(|t| **t == "done").count();
        assert_eq!(done_count, 1, "exactly one done: {types:?}");
        assert_eq!(*types.last().unwrap(), "done", "done is terminal: {types:?}");
        let first_count = types.iter().filter(|t| **t == "first").count();
        assert!(first_count <= 1, "at most one first: {types:?}");
        if first_count == 1 {
            assert_eq!(types[0], "first", "first precedes tokens: {types:?}");
        }
    }

    const HARD_PROMPT: &str = "implement a lock-free concurrent queue";
    const NORMAL_PROMPT: &str = "tell me about your favorite season and moods";

    // ── Tests ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn successful_stream_obeys_protocol_and_appends_transcript() {
        let local = StubEngine::new("local", StubBehavior::Succeed(vec!["As", " you", " wish"]));
        let d = dispatcher(PolicyConfig::default(), local.clone(), None, None);
        let id = SessionId::from("s1");

        let stream = d.generate(&id, NORMAL_PROMPT, None).await.unwrap();
        let events = collect(stream).await;
        assert_protocol(&events);

        let messages = d.transcripts.messages(&id).await.unwrap();
        let last = messages.last().unwrap();
        assert_eq!(last.content, "As you wish");
    }

    #[tokio::test]
    async fn hard_prompt_falls_back_to_local_exactly_once() {
        let local = StubEngine::new("local", StubBehavior::Succeed(vec!["ok"]));
        let heavy = StubEngine::new("heavy", StubBehavior::FailCall);
        let d = dispatcher(
            PolicyConfig::default(),
            local.clone(),
            Some(heavy.clone()),
            None,
        );

        let stream = d
            .generate(&SessionId::from("s1"), HARD_PROMPT, None)
            .await
            .unwrap();
        let events = collect(stream).await;
        assert_protocol(&events);
        assert_eq!(heavy.calls(), 1);
        assert_eq!(local.calls(), 1);
    }

    #[tokio::test]
    async fn fallback_disabled_propagates_original_error() {
        let local = StubEngine::new("local", StubBehavior::Succeed(vec!["ok"]));
        let heavy = StubEngine::new("heavy", StubBehavior::FailCall);
        let mut policy = PolicyConfig::default();
        policy.fallback_enabled = false;
        let d = dispatcher(policy, local.clone(), Some(heavy.clone()), None);

        let result = d.generate(&SessionId::from("s1"), HARD_PROMPT, None).await;
        assert!(matches!(
            result,
            Err(Error::Engine(EngineError::Network(_)))
        ));
        assert_eq!(heavy.calls(), 1);
        assert_eq!(local.calls(), 0);
    }

    #[tokio::test]
    async fn primary_tier_never_retries() {
        let local = StubEngine::new("local", StubBehavior::FailCall);
        let d = dispatcher(PolicyConfig::default(), local.clone(), None, None);

        let result = d.generate(&SessionId::from("s1"), NORMAL_PROMPT, None).await;
        assert!(result.is_err());
        assert_eq!(local.calls(), 1);
    }

    #[tokio::test]
    async fn midstream_failure_before_tokens_retries_on_local() {
        let local = StubEngine::new("local", StubBehavior::Succeed(vec!["recovered"]));
        let heavy = StubEngine::new("heavy", StubBehavior::FailMidStream);
        let d = dispatcher(
            PolicyConfig::default(),
            local.clone(),
            Some(heavy.clone()),
            None,
        );

        let stream = d
            .generate(&SessionId::from("s1"), HARD_PROMPT, None)
            .await
            .unwrap();
        let events = collect(stream).await;
        assert_protocol(&events);
        assert_eq!(local.calls(), 1);

        let has_recovered = events.iter().any(|e| {
            matches!(e, Ok(GenerationEvent::Token { text }) if text == "recovered")
        });
        assert!(has_recovered);
    }

    #[tokio::test]
    async fn device_command_short_circuits_generation() {
        let local = StubEngine::new("local", StubBehavior::Succeed(vec!["ok"]));
        let device = Arc::new(StubDevice {
            fail: false,
            calls: AtomicUsize::new(0),
        });
        let d = dispatcher(PolicyConfig::default(), local.clone(), None, Some(device.clone()));
        let id = SessionId::from("s1");

        let stream = d.generate(&id, "turn on the lights", None).await.unwrap();
        let events = collect(stream).await;
        assert_protocol(&events);
        assert_eq!(events.len(), 3); // first, token, done
        assert_eq!(device.calls.load(Ordering::SeqCst), 1);
        assert_eq!(local.calls(), 0);

        let messages = d.transcripts.messages(&id).await.unwrap();
        assert!(messages.last().unwrap().content.contains("turn_on"));
    }

    #[tokio::test]
    async fn device_failure_falls_through_to_generation() {
        let local = StubEngine::new("local", StubBehavior::Succeed(vec!["ok"]));
        let device = Arc::new(StubDevice {
            fail: true,
            calls: AtomicUsize::new(0),
        });
        let d = dispatcher(PolicyConfig::default(), local.clone(), None, Some(device.clone()));

        let stream = d
            .generate(&SessionId::from("s1"), "turn on the lights", None)
            .await
            .unwrap();
        let events = collect(stream).await;
        assert_protocol(&events);
        assert_eq!(device.calls.load(Ordering::SeqCst), 1);
        assert_eq!(local.calls(), 1); // device error never surfaced
    }

    #[tokio::test]
    async fn no_device_backend_falls_through() {
        let local = StubEngine::new("local", StubBehavior::Succeed(vec!["ok"]));
        let d = dispatcher(PolicyConfig::default(), local.clone(), None, None);

        let stream = d
            .generate(&SessionId::from("s1"), "lock the doors", None)
            .await
            .unwrap();
        collect(stream).await;
        assert_eq!(local.calls(), 1);
    }

    #[tokio::test]
    async fn reject_policy_fails_second_concurrent_call() {
        let local = StubEngine::new("local", StubBehavior::Slow(Duration::from_millis(100)));
        let mut policy = PolicyConfig::default();
        policy.session.busy_policy = valet_config::BusyPolicy::Reject;
        let d = Arc::new(dispatcher(policy, local.clone(), None, None));
        let id = SessionId::from("s1");

        let first = d.generate(&id, NORMAL_PROMPT, None).await.unwrap();
        let second = d.generate(&id, NORMAL_PROMPT, None).await;
        assert!(matches!(
            second,
            Err(Error::Session(valet_core::SessionError::Busy(_)))
        ));

        // After the first stream drains, the session opens up again.
        collect(first).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(d.generate(&id, NORMAL_PROMPT, None).await.is_ok());
    }

    #[tokio::test]
    async fn queue_policy_serializes_same_session_calls() {
        let local = StubEngine::new("local", StubBehavior::Slow(Duration::from_millis(50)));
        let d = Arc::new(dispatcher(PolicyConfig::default(), local.clone(), None, None));
        let id = SessionId::from("s1");

        let first = d.generate(&id, NORMAL_PROMPT, None).await.unwrap();

        let second = {
            let d = d.clone();
            let id = id.clone();
            tokio::spawn(async move {
                let stream = d.generate(&id, NORMAL_PROMPT, None).await.unwrap();
                collect(stream).await
            })
        };

        let first_events = collect(first).await;
        assert_protocol(&first_events);
        let second_events = second.await.unwrap();
        assert_protocol(&second_events);
        assert_eq!(local.calls(), 2);
    }

    #[tokio::test]
    async fn dropping_the_stream_releases_the_session() {
        let local = StubEngine::new("local", StubBehavior::Slow(Duration::from_millis(200)));
        let mut policy = PolicyConfig::default();
        policy.session.busy_policy = valet_config::BusyPolicy::Reject;
        let d = dispatcher(policy, local.clone(), None, None);
        let id = SessionId::from("s1");

        let stream = d.generate(&id, NORMAL_PROMPT, None).await.unwrap();
        drop(stream); // caller disconnected mid-generation

        // The relay task notices the closed channel and drops the
        // permit; the session must become available again.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(d.generate(&id, NORMAL_PROMPT, None).await.is_ok());
    }

    #[tokio::test]
    async fn distinct_sessions_generate_concurrently() {
        let local = StubEngine::new("local", StubBehavior::Slow(Duration::from_millis(50)));
        let mut policy = PolicyConfig::default();
        policy.session.busy_policy = valet_config::BusyPolicy::Reject;
        let d = dispatcher(policy, local.clone(), None, None);

        let a = d.generate(&SessionId::from("a"), NORMAL_PROMPT, None).await;
        let b = d.generate(&SessionId::from("b"), NORMAL_PROMPT, None).await;
        assert!(a.is_ok());
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn caller_params_win_over_tier_defaults() {
        let local = StubEngine::new("local", StubBehavior::Succeed(vec!["ok"]));
        let d = dispatcher(PolicyConfig::default(), local.clone(), None, None);

        let caller = GenerationParams {
            max_tokens: Some(32),
            ..Default::default()
        };
        let stream = d
            .generate(&SessionId::from("s1"), NORMAL_PROMPT, Some(caller))
            .await
            .unwrap();
        collect(stream).await;
        assert_eq!(local.calls(), 1);
    }

    #[tokio::test]
    async fn health_reports_unconfigured_heavy() {
        let local = StubEngine::new("local", StubBehavior::Succeed(vec![]));
        let d = dispatcher(PolicyConfig::default(), local, None, None);
        let snapshot = d.health().await;
        assert_eq!(snapshot.engines.len(), 2);
        assert_eq!(snapshot.engines[1].status, EngineStatus::NotConfigured);
        assert!(!snapshot.routing.heavy_configured);
        assert!(snapshot.routing.fallback_enabled);
    }

    #[tokio::test]
    async fn clear_session_resets_transcript() {
        let local = StubEngine::new("local", StubBehavior::Succeed(vec!["hi"]));
        let d = dispatcher(PolicyConfig::default(), local, None, None);
        let id = SessionId::from("s1");

        let stream = d.generate(&id, NORMAL_PROMPT, None).await.unwrap();
        collect(stream).await;
        assert!(d.clear_session(&id).await);
        assert!(d.transcripts.messages(&id).await.is_none());
    }
}
