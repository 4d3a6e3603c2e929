//! Local engine: on-device inference via Candle.
//!
//! Runs GGUF-quantized models with no network and no API keys. This is
//! the baseline engine every tier can fall back to, so it is always
//! constructed; the model itself loads lazily on first request.
//!
//! Per-session state is split in two:
//! - the shared [`ModelFiles`] (gguf path, tokenizer, chat template),
//!   resolved once per process;
//! - a per-session [`SessionContext`] holding its own `ModelWeights`
//!   instance, whose KV cache is the warmed state that makes follow-up
//!   turns cheap. Contexts live in a small FIFO registry and are
//!   rebuilt transparently after eviction.
//!
//! Tokens stream out as they are sampled; `First` carries the measured
//! time-to-first-token.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::LogitsProcessor;
use candle_transformers::models::quantized_llama as qlm;
use tokenizers::Tokenizer;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use valet_core::{
    EngineError, EngineHealth, EngineStatus, EventStream, GenerationEngine, GenerationEvent,
    GenerationParams, Message, Role, SessionId,
};
use valet_session::{ContextEntry, ContextRegistry};

// ── Model presets ──────────────────────────────────────────────────────

/// Friendly aliases resolving to HuggingFace repos + filenames.
struct ModelPreset {
    repo: &'static str,
    gguf_file: &'static str,
    tokenizer_repo: &'static str,
    chat_template: ChatTemplate,
}

#[derive(Debug, Clone, Copy)]
enum ChatTemplate {
    /// `<|system|>\n...</s>\n<|user|>\n...</s>\n<|assistant|>\n`
    TinyLlama,
    /// `<|im_start|>role\n...<|im_end|>\n`
    ChatML,
}

fn resolve_preset(alias: &str) -> Option<ModelPreset> {
    match alias.to_lowercase().as_str() {
        "tinyllama" | "tiny-llama" | "tinyllama-1.1b" => Some(ModelPreset {
            repo: "TheBloke/TinyLlama-1.1B-Chat-v1.0-GGUF",
            gguf_file: "tinyllama-1.1b-chat-v1.0.Q4_K_M.gguf",
            tokenizer_repo: "TinyLlama/TinyLlama-1.1B-Chat-v1.0",
            chat_template: ChatTemplate::TinyLlama,
        }),
        "smollm" | "smollm:135m" | "smollm-135m" => Some(ModelPreset {
            repo: "TheBloke/SmolLM-135M-Instruct-GGUF",
            gguf_file: "smollm-135m-instruct.Q4_K_M.gguf",
            tokenizer_repo: "HuggingFaceTB/SmolLM-135M-Instruct",
            chat_template: ChatTemplate::ChatML,
        }),
        "smollm:360m" | "smollm-360m" => Some(ModelPreset {
            repo: "TheBloke/SmolLM-360M-Instruct-GGUF",
            gguf_file: "smollm-360m-instruct.Q4_K_M.gguf",
            tokenizer_repo: "HuggingFaceTB/SmolLM-360M-Instruct",
            chat_template: ChatTemplate::ChatML,
        }),
        "qwen:0.5b" | "qwen-0.5b" | "qwen2-0.5b" => Some(ModelPreset {
            repo: "Qwen/Qwen2-0.5B-Instruct-GGUF",
            gguf_file: "qwen2-0_5b-instruct-q4_k_m.gguf",
            tokenizer_repo: "Qwen/Qwen2-0.5B-Instruct",
            chat_template: ChatTemplate::ChatML,
        }),
        "qwen:1.5b" | "qwen-1.5b" | "qwen2-1.5b" => Some(ModelPreset {
            repo: "Qwen/Qwen2-1.5B-Instruct-GGUF",
            gguf_file: "qwen2-1_5b-instruct-q4_k_m.gguf",
            tokenizer_repo: "Qwen/Qwen2-1.5B-Instruct",
            chat_template: ChatTemplate::ChatML,
        }),
        "phi2" | "phi-2" => Some(ModelPreset {
            repo: "TheBloke/phi-2-GGUF",
            gguf_file: "phi-2.Q4_K_M.gguf",
            tokenizer_repo: "microsoft/phi-2",
            chat_template: ChatTemplate::ChatML,
        }),
        _ => None,
    }
}

/// Preset aliases, for error messages and `valet health`.
pub fn known_presets() -> Vec<&'static str> {
    vec![
        "tinyllama",
        "smollm:135m",
        "smollm:360m",
        "qwen:0.5b",
        "qwen:1.5b",
        "phi2",
    ]
}

// ── Shared model files ─────────────────────────────────────────────────

/// Everything that is loaded once per process and shared read-only
/// across sessions. The weights themselves are per-session.
struct ModelFiles {
    model_path: PathBuf,
    tokenizer: Tokenizer,
    device: Device,
    chat_template: ChatTemplate,
    eos_token_id: u32,
}

impl ModelFiles {
    fn resolve(model_name: &str) -> Result<Self, EngineError> {
        let device = Device::Cpu;

        if Path::new(model_name).exists() && model_name.ends_with(".gguf") {
            return Self::resolve_from_path(Path::new(model_name), device);
        }

        let preset = resolve_preset(model_name).ok_or_else(|| {
            EngineError::ModelNotFound(format!(
                "Unknown local model '{}'. Available presets: {}. \
                 Or provide a path to a .gguf file.",
                model_name,
                known_presets().join(", ")
            ))
        })?;

        info!(
            model = model_name,
            repo = preset.repo,
            file = preset.gguf_file,
            "Downloading/resolving local model"
        );

        // VALET_MODEL_DIR redirects the download cache; otherwise hf-hub
        // uses its standard location (honoring HF_HOME).
        let api = match std::env::var_os("VALET_MODEL_DIR") {
            Some(dir) => hf_hub::api::sync::ApiBuilder::new()
                .with_cache_dir(PathBuf::from(dir))
                .build(),
            None => hf_hub::api::sync::Api::new(),
        }
        .map_err(|e| {
            EngineError::Network(format!("Failed to initialize HuggingFace Hub API: {e}"))
        })?;

        let model_path = api
            .model(preset.repo.to_string())
            .get(preset.gguf_file)
            .map_err(|e| {
                EngineError::Network(format!(
                    "Failed to download model '{}' from '{}': {e}",
                    preset.gguf_file, preset.repo
                ))
            })?;

        let tokenizer_path = api
            .model(preset.tokenizer_repo.to_string())
            .get("tokenizer.json")
            .map_err(|e| {
                EngineError::Network(format!(
                    "Failed to download tokenizer from '{}': {e}",
                    preset.tokenizer_repo
                ))
            })?;

        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EngineError::NotConfigured(format!("Failed to load tokenizer: {e}")))?;

        let eos_token_id = resolve_eos(&tokenizer);
        info!(path = %model_path.display(), eos_token_id, "Local model files ready");

        Ok(Self {
            model_path,
            tokenizer,
            device,
            chat_template: preset.chat_template,
            eos_token_id,
        })
    }

    fn resolve_from_path(path: &Path, device: Device) -> Result<Self, EngineError> {
        info!(path = %path.display(), "Using local GGUF model");

        let tokenizer_path = path.with_file_name("tokenizer.json");
        if !tokenizer_path.exists() {
            return Err(EngineError::NotConfigured(format!(
                "No tokenizer.json found next to {}",
                path.display()
            )));
        }
        let tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| EngineError::NotConfigured(format!("Failed to load tokenizer: {e}")))?;
        let eos_token_id = resolve_eos(&tokenizer);

        Ok(Self {
            model_path: path.to_path_buf(),
            tokenizer,
            device,
            chat_template: ChatTemplate::ChatML,
            eos_token_id,
        })
    }

    /// Format the transcript with this model's chat template.
    fn format_prompt(&self, messages: &[Message]) -> String {
        match self.chat_template {
            ChatTemplate::TinyLlama => format_tinyllama(messages),
            ChatTemplate::ChatML => format_chatml(messages),
        }
    }
}

fn resolve_eos(tokenizer: &Tokenizer) -> u32 {
    tokenizer
        .token_to_id("</s>")
        .or_else(|| tokenizer.token_to_id("<|endoftext|>"))
        .or_else(|| tokenizer.token_to_id("<|im_end|>"))
        .or_else(|| tokenizer.token_to_id("<|eot_id|>"))
        .unwrap_or(2)
}

fn format_tinyllama(messages: &[Message]) -> String {
    let mut prompt = String::new();
    for msg in messages {
        let tag = match msg.role {
            Role::System => "<|system|>",
            Role::User => "<|user|>",
            Role::Assistant => "<|assistant|>",
        };
        prompt.push_str(tag);
        prompt.push('\n');
        prompt.push_str(&msg.content);
        prompt.push_str("</s>\n");
    }
    prompt.push_str("<|assistant|>\n");
    prompt
}

fn format_chatml(messages: &[Message]) -> String {
    let mut prompt = String::new();
    for msg in messages {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        prompt.push_str("<|im_start|>");
        prompt.push_str(role);
        prompt.push('\n');
        prompt.push_str(&msg.content);
        prompt.push_str("<|im_end|>\n");
    }
    prompt.push_str("<|im_start|>assistant\n");
    prompt
}

// ── Per-session generation context ─────────────────────────────────────

/// The expensive per-session state: a dedicated `ModelWeights` instance
/// whose internal KV cache holds the session's warmed attention state.
struct SessionContext {
    model: qlm::ModelWeights,
}

/// Cheap handle derived from the context: what has been fed so far.
#[derive(Default)]
struct DecodeState {
    /// Tokens already in the KV cache, prompt and generated alike.
    tokens: Vec<u32>,
    /// Next decode position.
    index_pos: usize,
}

fn load_weights(path: &Path, device: &Device) -> Result<qlm::ModelWeights, EngineError> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| EngineError::NotConfigured(format!("Failed to open model file: {e}")))?;
    let gguf = gguf_file::Content::read(&mut file)
        .map_err(|e| EngineError::NotConfigured(format!("Failed to parse GGUF file: {e}")))?;
    qlm::ModelWeights::from_gguf(gguf, &mut file, device)
        .map_err(|e| EngineError::NotConfigured(format!("Failed to load model weights: {e}")))
}

// ── Local engine ───────────────────────────────────────────────────────

pub struct LocalEngine {
    model_name: String,
    files: Mutex<Option<Arc<ModelFiles>>>,
    contexts: ContextRegistry<SessionContext, DecodeState>,
}

impl LocalEngine {
    /// `model_name` is a preset alias (`"tinyllama"`, `"qwen:0.5b"`) or
    /// a path to a `.gguf` file. Files resolve lazily on first request.
    pub fn new(model_name: &str, max_contexts: usize) -> Self {
        Self {
            model_name: model_name.to_string(),
            files: Mutex::new(None),
            contexts: ContextRegistry::new(max_contexts),
        }
    }

    /// Drop all per-session contexts (shutdown path).
    pub async fn clear_contexts(&self) {
        self.contexts.clear().await;
    }

    async fn ensure_files(&self) -> Result<Arc<ModelFiles>, EngineError> {
        let mut files = self.files.lock().await;
        if let Some(f) = files.as_ref() {
            return Ok(f.clone());
        }
        info!(model = %self.model_name, "Resolving local model on first request");
        let name = self.model_name.clone();
        let loaded = tokio::task::spawn_blocking(move || ModelFiles::resolve(&name))
            .await
            .map_err(|e| EngineError::Inference(format!("Model resolve task failed: {e}")))??;
        let loaded = Arc::new(loaded);
        *files = Some(loaded.clone());
        Ok(loaded)
    }
}

#[async_trait]
impl GenerationEngine for LocalEngine {
    fn name(&self) -> &str {
        "local"
    }

    async fn stream(
        &self,
        session_id: &SessionId,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<EventStream, EngineError> {
        let files = self.ensure_files().await?;

        let entry: ContextEntry<SessionContext, DecodeState> = {
            let files = files.clone();
            self.contexts
                .get_or_create(
                    session_id,
                    move || async move {
                        let loaded = tokio::task::spawn_blocking(move || {
                            load_weights(&files.model_path, &files.device)
                        })
                        .await
                        .map_err(|e| {
                            EngineError::Inference(format!("Weight loading task failed: {e}"))
                        })??;
                        Ok(SessionContext { model: loaded })
                    },
                    |_ctx| Ok(DecodeState::default()),
                )
                .await?
        };

        let prompt = files.format_prompt(messages);
        let max_tokens = params.max_tokens.unwrap_or(256);
        let context_window = params.context_window.unwrap_or(2048);
        let temperature = params.temperature.unwrap_or(0.7);

        let (tx, rx) = mpsc::channel(32);
        let started = Instant::now();
        debug!(session_id = %session_id, max_tokens, temperature, "Starting local generation");

        tokio::task::spawn_blocking(move || {
            let mut guard = entry.blocking_lock();
            let (context, state) = &mut *guard;
            let result = run_generation(
                &files,
                context,
                state,
                &prompt,
                max_tokens,
                context_window,
                temperature,
                &tx,
                started,
            );
            if let Err(e) = result {
                warn!(error = %e, "Local generation failed");
                let _ = tx.blocking_send(Err(e));
            }
        });

        Ok(rx)
    }

    async fn health(&self) -> EngineHealth {
        let loaded = self.files.lock().await.is_some();
        EngineHealth {
            name: "local".into(),
            status: if loaded {
                EngineStatus::Ready
            } else {
                EngineStatus::Cold
            },
            model: Some(self.model_name.clone()),
            detail: Some(if loaded {
                format!("candle/cpu, {} cached contexts", self.contexts.len().await)
            } else {
                "model loads on first request".to_string()
            }),
        }
    }
}

/// Tokenize, feed the unseen part of the prompt, then sample token by
/// token, streaming each decoded piece as it appears. Runs on a
/// blocking thread; Candle CPU inference is compute-bound.
#[allow(clippy::too_many_arguments)]
fn run_generation(
    files: &ModelFiles,
    context: &mut SessionContext,
    state: &mut DecodeState,
    prompt: &str,
    max_tokens: u32,
    context_window: u32,
    temperature: f32,
    tx: &mpsc::Sender<Result<GenerationEvent, EngineError>>,
    started: Instant,
) -> Result<(), EngineError> {
    let encoding = files
        .tokenizer
        .encode(prompt, true)
        .map_err(|e| EngineError::Inference(format!("Tokenization failed: {e}")))?;
    let prompt_ids: Vec<u32> = encoding.get_ids().to_vec();

    // Warm-cache reuse: if this prompt extends what the KV cache has
    // already seen, feed only the new suffix. Otherwise the cache is
    // stale (transcript diverged) and the weights are rebuilt fresh.
    let new_ids: Vec<u32> = if state.tokens.len() <= prompt_ids.len()
        && prompt_ids[..state.tokens.len()] == state.tokens[..]
    {
        prompt_ids[state.tokens.len()..].to_vec()
    } else {
        debug!("Prompt diverged from cached context, rebuilding");
        context.model = load_weights(&files.model_path, &files.device)?;
        state.tokens.clear();
        state.index_pos = 0;
        prompt_ids.clone()
    };

    let budget = context_window.saturating_sub(prompt_ids.len() as u32);
    let max_tokens = max_tokens.min(budget.max(1));

    let mut logits_processor = if temperature <= 0.0 {
        LogitsProcessor::new(42, None, None)
    } else {
        LogitsProcessor::new(42, Some(temperature as f64), None)
    };

    // Feed the prompt suffix in one forward pass.
    let mut last_logits = if new_ids.is_empty() {
        None
    } else {
        let input = Tensor::new(new_ids.as_slice(), &files.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(map_candle_err)?;
        let logits = context
            .model
            .forward(&input, state.index_pos)
            .map_err(map_candle_err)?;
        state.index_pos += new_ids.len();
        Some(logits)
    };
    state.tokens = prompt_ids;

    let mut generated: Vec<u32> = Vec::new();
    let mut emitted = String::new();
    let mut first_sent = false;

    for _ in 0..max_tokens {
        let logits = match last_logits.take() {
            Some(l) => l,
            None => break,
        };
        let logits = last_position(&logits)?;
        let next_token = logits_processor.sample(&logits).map_err(map_candle_err)?;

        if next_token == files.eos_token_id {
            break;
        }
        generated.push(next_token);
        state.tokens.push(next_token);

        if !first_sent {
            first_sent = true;
            let ms = started.elapsed().as_millis() as u64;
            if tx.blocking_send(Ok(GenerationEvent::First { ms })).is_err() {
                return Ok(()); // caller went away
            }
        }

        // Decode the whole tail and emit only what is new; BPE merges
        // mean a single token is not always valid UTF-8 on its own.
        let decoded = files
            .tokenizer
            .decode(&generated, true)
            .map_err(|e| EngineError::Inference(format!("Detokenization failed: {e}")))?;
        if decoded.len() > emitted.len() && decoded.is_char_boundary(emitted.len()) {
            let piece = decoded[emitted.len()..].to_string();
            emitted = decoded;
            if !piece.is_empty()
                && tx
                    .blocking_send(Ok(GenerationEvent::Token { text: piece }))
                    .is_err()
            {
                return Ok(());
            }
        }

        let input = Tensor::new(&[next_token][..], &files.device)
            .and_then(|t| t.unsqueeze(0))
            .map_err(map_candle_err)?;
        last_logits = Some(
            context
                .model
                .forward(&input, state.index_pos)
                .map_err(map_candle_err)?,
        );
        state.index_pos += 1;
    }

    debug!(
        completion_tokens = generated.len(),
        output_len = emitted.len(),
        "Local generation complete"
    );
    let _ = tx.blocking_send(Ok(GenerationEvent::Done));
    Ok(())
}

/// Logits for the final position, whatever shape the model returned.
fn last_position(logits: &Tensor) -> Result<Tensor, EngineError> {
    let logits = logits.squeeze(0).map_err(map_candle_err)?;
    if logits.rank() > 1 {
        let last = logits.dim(0).map_err(map_candle_err)? - 1;
        logits.get(last).map_err(map_candle_err)
    } else {
        Ok(logits)
    }
}

fn map_candle_err(e: candle_core::Error) -> EngineError {
    EngineError::Inference(format!("Candle inference error: {e}"))
}
