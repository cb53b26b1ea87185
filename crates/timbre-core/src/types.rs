//! Shared types for the timbre conversion server.
//!
//! Kept free of tokio and axum so the CLI and downstream consumers can use the
//! request and response shapes without pulling in the engine.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use serde::{Deserialize, Serialize};

// ─── Service configuration ─────────────────────────────────────────────────

/// Extension used for every file staged into the engine's raw directory.
pub const TEMP_FILE_EXTENSION: &str = ".wav";

/// Filename prefix of a character's generator checkpoint (`G_<step>.pth`).
pub const MODEL_FILE_PREFIX: &str = "G_";

pub const CONFIG_FILE_NAME: &str = "config.json";
pub const SPEAKER_FILE_NAME: &str = "speaker.json";

pub const DEFAULT_PORT: u16 = 6575;

/// Filesystem layout and limits of one architecture installation.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Installation root holding the architecture, models, venvs and cache.
    pub root_dir: PathBuf,
    /// Architecture name, also the name of its directory under `root_dir`.
    pub architecture: String,
    /// Kill the engine after this long. `None` waits forever.
    pub engine_timeout: Option<Duration>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("/root/hay_say"),
            architecture: "so_vits_svc_3".into(),
            engine_timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}

impl ServiceConfig {
    pub fn architecture_root(&self) -> PathBuf {
        self.root_dir.join(&self.architecture)
    }

    /// Single-slot directory the engine reads input clips from.
    pub fn raw_dir(&self) -> PathBuf {
        self.architecture_root().join("raw")
    }

    /// Single-slot directory the engine writes converted clips to.
    pub fn results_dir(&self) -> PathBuf {
        self.architecture_root().join("results")
    }

    pub fn template_path(&self) -> PathBuf {
        self.architecture_root().join("inference_main_template.py")
    }

    pub fn working_script_path(&self) -> PathBuf {
        self.architecture_root().join("inference_main.py")
    }

    pub fn python_executable(&self) -> PathBuf {
        self.root_dir
            .join(".venvs")
            .join(&self.architecture)
            .join("bin")
            .join("python")
    }

    pub fn characters_dir(&self) -> PathBuf {
        self.root_dir
            .join("models")
            .join(&self.architecture)
            .join("characters")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root_dir.join("audio_cache")
    }
}

// ─── Cache keys ────────────────────────────────────────────────────────────

/// Cache stage a clip is read from or written to: clients upload into
/// `Preprocessed`, conversions write to `Output`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Preprocessed,
    Output,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Preprocessed => "preprocessed",
            Stage::Output => "output",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Conversion types ──────────────────────────────────────────────────────

/// Accelerator selector as sent by clients: either `"0"` or `0`.
/// An empty string selects the CPU.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GpuId {
    Index(i64),
    Name(String),
}

impl GpuId {
    pub fn is_cpu(&self) -> bool {
        matches!(self, GpuId::Name(s) if s.is_empty())
    }
}

impl fmt::Display for GpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuId::Index(i) => write!(f, "{i}"),
            GpuId::Name(s) => f.write_str(s),
        }
    }
}

/// A validated `/generate` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionRequest {
    pub input_audio_id: String,
    pub architecture: Option<String>,
    pub character: String,
    pub pitch_shift: i64,
    pub output_audio_id: String,
    pub gpu_id: GpuId,
    pub session_id: Option<String>,
}

/// Files and speaker that back one character, resolved per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacterProfile {
    pub model_path: PathBuf,
    pub config_path: PathBuf,
    pub speaker: String,
}

// ─── Responses ─────────────────────────────────────────────────────────────

/// Body of every `/generate` response. The message is base64 so raw error
/// text with quotes or braces cannot break the JSON envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub message: String,
}

impl GenerateResponse {
    pub fn encode(message: &str) -> Self {
        Self {
            message: base64::engine::general_purpose::STANDARD.encode(message.as_bytes()),
        }
    }

    pub fn decode(&self) -> Result<String, String> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(self.message.as_bytes())
            .map_err(|e| format!("message is not base64: {e}"))?;
        String::from_utf8(bytes).map_err(|e| format!("message is not UTF-8: {e}"))
    }
}

/// One accelerator as reported by `/gpu-info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub name: String,
    pub memory_total_mib: Option<u64>,
}
