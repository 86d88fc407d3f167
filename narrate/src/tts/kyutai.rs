//! Kyutai DSM TTS backend using PyO3 to embed Python.
//!
//! The model is loaded from scratch for every chunk and torn down afterwards.
//! Long conversions otherwise accumulate accelerator memory until the process dies.

use super::{BackendKind, EngineConfig, EngineError, Synthesis, TtsBackend};
use async_trait::async_trait;
use log::{debug, warn};
use pyo3::basic::CompareOp;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList, PySlice};

/// Sampling temperature used for generation.
const TEMPERATURE: f64 = 0.6;

/// Number of audio codebooks generated by the PyTorch model.
const N_Q: usize = 32;

/// Fixed MLX random seed so reruns of a chunk sound alike.
const MLX_SEED: u64 = 299_792_458;

/// Classifier-free guidance coefficient the PyTorch model was distilled with.
const TORCH_CFG_COEF: f64 = 2.0;

/// Kyutai TTS backend.
#[derive(Debug, Clone)]
pub struct KyutaiBackend {
    kind: BackendKind,
    config: EngineConfig,
    /// Resolved device ("cuda", "cpu", "mps", or "mlx")
    device: String,
}

impl KyutaiBackend {
    /// Probe the Python environment and create the backend.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        let kind = BackendKind::probe()?;
        let device = match kind {
            BackendKind::Mlx => "mlx".to_string(),
            BackendKind::PyTorch => resolve_torch_device(&config.device)?,
        };

        debug!("Kyutai backend: {} on {}", kind.as_str(), device);

        Ok(Self {
            kind,
            config,
            device,
        })
    }

    fn synthesize_sync(&self, text: &str, voice: &str) -> Result<Synthesis, EngineError> {
        Python::with_gil(|py| match self.kind {
            BackendKind::PyTorch => self.generate_torch(py, text, voice),
            BackendKind::Mlx => self.generate_mlx(py, text, voice),
        })
    }

    /// Model repository, falling back to the package default.
    fn repo(
        &self,
        tts: &Bound<'_, PyModule>,
        configured: Option<&str>,
        default_attr: &str,
    ) -> PyResult<String> {
        match configured {
            Some(repo) => Ok(repo.to_string()),
            None => tts.getattr(default_attr)?.extract(),
        }
    }

    fn generate_torch(
        &self,
        py: Python<'_>,
        text: &str,
        voice: &str,
    ) -> Result<Synthesis, EngineError> {
        let _release = ReleaseOnDrop::new(py, self.kind);
        let model = self.load_torch(py).map_err(load_err)?;

        decode_torch(py, &model, text, voice).map_err(synthesis_err)
    }

    fn load_torch<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyAny>> {
        let loaders = py.import("moshi.models.loaders")?;
        let tts = py.import("moshi.models.tts")?;

        let hf_repo = self.repo(&tts, self.config.hf_repo.as_deref(), "DEFAULT_DSM_TTS_REPO")?;
        let checkpoint_info = loaders
            .getattr("CheckpointInfo")?
            .call_method1("from_hf_repo", (hf_repo,))?;

        let kwargs = PyDict::new(py);
        kwargs.set_item("n_q", N_Q)?;
        kwargs.set_item("temp", TEMPERATURE)?;
        kwargs.set_item("device", &self.device)?;
        if let Some(voice_repo) = &self.config.voice_repo {
            kwargs.set_item("voice_repo", voice_repo)?;
        }

        tts.getattr("TTSModel")?
            .call_method("from_checkpoint_info", (checkpoint_info,), Some(&kwargs))
    }

    fn generate_mlx(
        &self,
        py: Python<'_>,
        text: &str,
        voice: &str,
    ) -> Result<Synthesis, EngineError> {
        let _release = ReleaseOnDrop::new(py, self.kind);
        let (model, cfg) = self.load_mlx(py).map_err(load_err)?;

        decode_mlx(py, &model, &cfg, text, voice).map_err(synthesis_err)
    }

    fn load_mlx<'py>(&self, py: Python<'py>) -> PyResult<(Bound<'py, PyAny>, MlxConditioning)> {
        let mx = py.import("mlx.core")?;
        let nn = py.import("mlx.nn")?;
        let sentencepiece = py.import("sentencepiece")?;
        let models = py.import("moshi_mlx.models")?;
        let tts = py.import("moshi_mlx.models.tts")?;
        let hf_get = py.import("moshi_mlx.utils.loaders")?.getattr("hf_get")?;
        let json = py.import("json")?;
        let builtins = py.import("builtins")?;

        mx.getattr("random")?.call_method1("seed", (MLX_SEED,))?;

        let hf_repo = self.repo(&tts, self.config.hf_repo.as_deref(), "DEFAULT_DSM_TTS_REPO")?;
        let voice_repo = self.repo(
            &tts,
            self.config.voice_repo.as_deref(),
            "DEFAULT_DSM_TTS_VOICE_REPO",
        )?;

        let config_path = hf_get.call1(("config.json", hf_repo.as_str()))?;
        let config_text = builtins
            .call_method1("open", (config_path.str()?,))?
            .call_method0("read")?;
        let raw_config = json.call_method1("loads", (config_text,))?;

        let mimi_weights = hf_get.call1((raw_config.get_item("mimi_name")?, hf_repo.as_str()))?;
        let moshi_name = raw_config.call_method1("get", ("moshi_name", "model.safetensors"))?;
        let moshi_weights = hf_get.call1((moshi_name, hf_repo.as_str()))?;
        let tokenizer = hf_get.call1((raw_config.get_item("tokenizer_name")?, hf_repo.as_str()))?;

        let lm_config = models
            .getattr("LmConfig")?
            .call_method1("from_config_dict", (&raw_config,))?;
        let model = models.getattr("Lm")?.call1((&lm_config,))?;
        model.call_method1("set_dtype", (mx.getattr("bfloat16")?,))?;

        let strict = PyDict::new(py);
        strict.set_item("strict", true)?;
        model.call_method(
            "load_pytorch_weights",
            (moshi_weights.str()?, &lm_config),
            Some(&strict),
        )?;

        if let Some(bits) = self.config.quantize {
            let bits_kwargs = PyDict::new(py);
            bits_kwargs.set_item("bits", bits)?;
            nn.call_method("quantize", (model.getattr("depformer")?,), Some(&bits_kwargs))?;
            let layers = model.getattr("transformer")?.getattr("layers")?;
            for layer in layers.extract::<Vec<Bound<'py, PyAny>>>()? {
                nn.call_method("quantize", (layer.getattr("self_attn")?,), Some(&bits_kwargs))?;
                nn.call_method("quantize", (layer.getattr("gating")?,), Some(&bits_kwargs))?;
            }
        }

        let text_tokenizer = sentencepiece
            .getattr("SentencePieceProcessor")?
            .call1((tokenizer.str()?,))?;

        let codebooks = lm_config.getattr("generated_codebooks")?;
        let audio_tokenizer = models
            .getattr("mimi")?
            .getattr("Mimi")?
            .call1((models.call_method1("mimi_202407", (codebooks,))?,))?;
        audio_tokenizer.call_method(
            "load_pytorch_weights",
            (mimi_weights.str()?,),
            Some(&strict),
        )?;

        let kwargs = PyDict::new(py);
        kwargs.set_item("voice_repo", voice_repo)?;
        kwargs.set_item("temp", TEMPERATURE)?;
        kwargs.set_item("cfg_coef", 1)?;
        kwargs.set_item("max_padding", 8)?;
        kwargs.set_item("initial_padding", 2)?;
        kwargs.set_item("final_padding", 2)?;
        kwargs.set_item("padding_bonus", 0)?;
        kwargs.set_item("raw_config", &raw_config)?;
        let tts_model = tts
            .getattr("TTSModel")?
            .call((model, audio_tokenizer, text_tokenizer), Some(&kwargs))?;

        // Models distilled with CFG take the coefficient as a conditioning attribute
        let cfg = if tts_model.getattr("valid_cfg_conditionings")?.is_truthy()? {
            let coef: f64 = tts_model.getattr("cfg_coef")?.extract()?;
            tts_model.setattr("cfg_coef", 1.0)?;
            MlxConditioning {
                cfg_coef: Some(coef),
                cfg_is_no_text: false,
                cfg_is_no_prefix: false,
            }
        } else {
            MlxConditioning {
                cfg_coef: None,
                cfg_is_no_text: true,
                cfg_is_no_prefix: true,
            }
        };

        Ok((tts_model, cfg))
    }
}

/// Conditioning flags for the MLX model.
struct MlxConditioning {
    cfg_coef: Option<f64>,
    cfg_is_no_text: bool,
    cfg_is_no_prefix: bool,
}

/// Releases accelerator memory when dropped.
///
/// Declare it before the model binding: locals drop in reverse order, so the
/// model reference is gone by the time the collector runs.
struct ReleaseOnDrop<'py> {
    py: Python<'py>,
    kind: BackendKind,
}

impl<'py> ReleaseOnDrop<'py> {
    fn new(py: Python<'py>, kind: BackendKind) -> Self {
        Self { py, kind }
    }

    fn release(&self) -> PyResult<()> {
        self.py.import("gc")?.call_method0("collect")?;

        match self.kind {
            BackendKind::PyTorch => {
                let cuda = self.py.import("torch")?.getattr("cuda")?;
                if cuda.call_method0("is_available")?.is_truthy()? {
                    cuda.call_method0("empty_cache")?;
                }
            }
            BackendKind::Mlx => {
                let mx = self.py.import("mlx.core")?;
                if mx.hasattr("clear_cache")? {
                    mx.call_method0("clear_cache")?;
                }
            }
        }
        Ok(())
    }
}

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        match self.release() {
            Ok(()) => debug!("Released TTS model"),
            Err(e) => warn!("Failed to release TTS model memory: {}", e),
        }
    }
}

/// Generate and decode one chunk with the PyTorch model.
fn decode_torch(
    py: Python<'_>,
    model: &Bound<'_, PyAny>,
    text: &str,
    voice: &str,
) -> PyResult<Synthesis> {
    let torch = py.import("torch")?;
    let np = py.import("numpy")?;

    let script_kwargs = PyDict::new(py);
    script_kwargs.set_item("padding_between", 1)?;
    let entries = model.call_method("prepare_script", (vec![text],), Some(&script_kwargs))?;

    let voice_path = model.call_method1("get_voice_path", (voice,))?;
    let cond_kwargs = PyDict::new(py);
    cond_kwargs.set_item("cfg_coef", TORCH_CFG_COEF)?;
    let attributes =
        model.call_method("make_condition_attributes", (vec![voice_path],), Some(&cond_kwargs))?;

    let result = model.call_method1("generate", (vec![entries], vec![attributes]))?;

    let mimi = model.getattr("mimi")?;
    let sample_rate = mimi.getattr("sample_rate")?.extract::<f64>()? as u32;
    let delay_steps: usize = model.getattr("delay_steps")?.extract()?;
    let frames = result.getattr("frames")?.extract::<Vec<Bound<'_, PyAny>>>()?;

    torch.call_method1("set_grad_enabled", (false,))?;
    let streaming = mimi.call_method1("streaming", (1,))?;
    streaming.call_method0("__enter__")?;

    let decoded = (|| -> PyResult<Vec<f32>> {
        let mut samples = Vec::new();
        // frame[:, 1:, :] drops the text stream
        let audio_codes = (
            PySlice::full(py),
            PySlice::new(py, 1, isize::MAX, 1),
            PySlice::full(py),
        );
        for frame in frames.iter().skip(delay_steps) {
            let pcm = mimi.call_method1("decode", (frame.get_item(audio_codes.clone())?,))?;
            let pcm = pcm.call_method0("cpu")?.call_method0("numpy")?.get_item((0, 0))?;
            let pcm = np.call_method1("clip", (pcm, -1.0, 1.0))?;
            samples.extend(pcm.call_method0("tolist")?.extract::<Vec<f32>>()?);
        }
        Ok(samples)
    })();

    streaming.call_method1("__exit__", (py.None(), py.None(), py.None()))?;

    Ok(Synthesis {
        samples: decoded?,
        sample_rate,
    })
}

/// Generate and decode one chunk with the MLX model.
fn decode_mlx(
    py: Python<'_>,
    model: &Bound<'_, PyAny>,
    cfg: &MlxConditioning,
    text: &str,
    voice: &str,
) -> PyResult<Synthesis> {
    let mx = py.import("mlx.core")?;
    let np = py.import("numpy")?;

    let entries = vec![model.call_method1("prepare_script", (vec![text],))?];

    let voices = if model.getattr("multi_speaker")?.is_truthy()? {
        vec![model.call_method1("get_voice_path", (voice,))?]
    } else {
        Vec::new()
    };
    let attributes =
        vec![model.call_method1("make_condition_attributes", (voices, cfg.cfg_coef))?];

    // Frames are collected during generation and decoded afterwards, in order
    let frames = PyList::empty(py);
    let gen_kwargs = PyDict::new(py);
    gen_kwargs.set_item("cfg_is_no_prefix", cfg.cfg_is_no_prefix)?;
    gen_kwargs.set_item("cfg_is_no_text", cfg.cfg_is_no_text)?;
    gen_kwargs.set_item("on_frame", frames.getattr("append")?)?;
    model.call_method("generate", (entries, attributes), Some(&gen_kwargs))?;

    let mimi = model.getattr("mimi")?;
    let sample_rate = mimi.getattr("sample_rate")?.extract::<f64>()? as u32;

    let mut samples = Vec::new();
    let expand = (PySlice::full(py), PySlice::full(py), py.None().into_bound(py));
    for frame in frames.iter() {
        // Padding frames carry -1 tokens
        if frame
            .rich_compare(-1, CompareOp::Eq)?
            .call_method0("any")?
            .is_truthy()?
        {
            continue;
        }
        let pcm = mimi.call_method1("decode_step", (frame.get_item(expand.clone())?,))?;
        let pcm = mx.call_method1("clip", (pcm.get_item((0, 0))?, -1.0, 1.0))?;
        let pcm = np.call_method1("array", (pcm,))?;
        samples.extend(pcm.call_method0("tolist")?.extract::<Vec<f32>>()?);
    }

    Ok(Synthesis {
        samples,
        sample_rate,
    })
}

impl BackendKind {
    /// Pick the backend variant from the installed Python packages.
    pub fn probe() -> Result<Self, EngineError> {
        Python::with_gil(|py| {
            let util = py
                .import("importlib.util")
                .map_err(|e| EngineError::Unavailable(e.to_string()))?;
            let installed = |name: &str| {
                util.call_method1("find_spec", (name,))
                    .map(|spec| !spec.is_none())
                    .unwrap_or(false)
            };

            let has_mlx = installed("mlx") && installed("moshi_mlx");
            let has_torch = installed("torch") && installed("moshi");

            BackendKind::select(cfg!(target_os = "macos"), has_mlx, has_torch).ok_or_else(|| {
                EngineError::Unavailable(
                    "neither `moshi` (PyTorch) nor `moshi_mlx` is installed in the Python environment"
                        .to_string(),
                )
            })
        })
    }
}

/// Resolve "auto" to cuda when available, cpu otherwise.
fn resolve_torch_device(device: &str) -> Result<String, EngineError> {
    if device != "auto" {
        return Ok(device.to_string());
    }

    Python::with_gil(|py| -> PyResult<String> {
        let cuda = py.import("torch")?.getattr("cuda")?;
        if cuda.call_method0("is_available")?.is_truthy()? {
            Ok("cuda".to_string())
        } else {
            Ok("cpu".to_string())
        }
    })
    .map_err(|e| EngineError::Unavailable(e.to_string()))
}

fn load_err(e: PyErr) -> EngineError {
    EngineError::Load(e.to_string())
}

fn synthesis_err(e: PyErr) -> EngineError {
    EngineError::Synthesis(e.to_string())
}

#[async_trait]
impl TtsBackend for KyutaiBackend {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<Synthesis, EngineError> {
        let backend = self.clone();
        let text = text.to_string();
        let voice = voice.to_string();

        // Run in a blocking task to not block the tokio runtime
        tokio::task::spawn_blocking(move || backend.synthesize_sync(&text, &voice))
            .await
            .map_err(|e| EngineError::Task(e.to_string()))?
    }

    fn describe(&self) -> String {
        format!("kyutai ({}, {})", self.kind.as_str(), self.device)
    }
}
