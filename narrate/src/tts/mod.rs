//! TTS backend trait and types.

#[cfg(feature = "python")]
pub mod kyutai;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use thiserror::Error;

/// Default voice for the Kyutai DSM TTS voice repository.
pub const DEFAULT_VOICE: &str = "expresso/ex03-ex01_happy_001_channel1_334s.wav";

/// Errors raised by a TTS engine. Any of them fails only the chunk being processed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("TTS engine unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to load TTS model: {0}")]
    Load(String),

    #[error("Synthesis failed: {0}")]
    Synthesis(String),

    #[error("Engine task failed: {0}")]
    Task(String),
}

/// Audio produced for one chunk of text.
#[derive(Debug, Clone, PartialEq)]
pub struct Synthesis {
    /// Mono PCM samples in [-1, 1]
    pub samples: Vec<f32>,
    /// Sample rate in Hz
    pub sample_rate: u32,
}

/// Settings used to load the TTS model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Model repository (None = engine default)
    pub hf_repo: Option<String>,
    /// Voice repository (None = engine default)
    pub voice_repo: Option<String>,
    /// Quantization bits for the model weights
    pub quantize: Option<u32>,
    /// Device hint: "auto", "cuda", "cpu", ...
    pub device: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hf_repo: None,
            voice_repo: None,
            quantize: None,
            device: "auto".to_string(),
        }
    }
}

/// Inference backend variants the engine can run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// PyTorch (`moshi` package), CUDA or CPU
    PyTorch,
    /// Apple MLX (`moshi_mlx` package)
    Mlx,
}

impl BackendKind {
    /// Pick a backend from the packages that are installed.
    ///
    /// MLX is preferred on macOS when available; PyTorch everywhere else.
    pub fn select(is_macos: bool, has_mlx: bool, has_torch: bool) -> Option<Self> {
        if is_macos && has_mlx {
            Some(BackendKind::Mlx)
        } else if has_torch {
            Some(BackendKind::PyTorch)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::PyTorch => "pytorch",
            BackendKind::Mlx => "mlx",
        }
    }
}

/// TTS backend trait - all TTS engines implement this.
///
/// Implementations acquire whatever model state they need for a single call and
/// release it before returning; nothing is cached between chunks.
#[async_trait]
pub trait TtsBackend: Send + Sync {
    /// Synthesize `text` with `voice`.
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Synthesis, EngineError>;

    /// Short description of the engine for logs.
    fn describe(&self) -> String;
}

/// Create the TTS backend, probing the environment for the backend variant.
#[cfg(feature = "python")]
pub fn create_backend(config: EngineConfig) -> Result<Box<dyn TtsBackend>, EngineError> {
    Ok(Box::new(kyutai::KyutaiBackend::new(config)?))
}

/// Create the TTS backend, probing the environment for the backend variant.
#[cfg(not(feature = "python"))]
pub fn create_backend(_config: EngineConfig) -> Result<Box<dyn TtsBackend>, EngineError> {
    Err(EngineError::Unavailable(
        "narrate was built without the `python` feature".to_string(),
    ))
}
