//! Conversion pipeline: the `/generate` request handler.
//!
//! ```text
//! body → validate → [lock] → template capture → resolve character
//!      → require input → render script → stage input → run engine
//!      → collect output → clean up → [unlock] → Outcome
//! ```
//!
//! The working script and the raw/results directories are single global
//! slots, so one lock serializes every request from template capture through
//! cleanup. Validation happens before the lock and before any file is touched.

use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;

use axum::http::StatusCode;
use tokio::sync::Mutex;
use tracing::{info, warn};

use timbre_core::request;
use timbre_core::script::ScriptParams;
use timbre_core::types::{ConversionRequest, GpuInfo, ServiceConfig};

use crate::bridge::CacheBridge;
use crate::cache::AudioCache;
use crate::character::CharacterResolver;
use crate::error::{ConversionError, error_chain};
use crate::executor::EngineRunner;
use crate::hardware::HardwareSelector;
use crate::template::ScriptTemplater;

/// Result of one `/generate` call, ready to be encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    BadInput(String),
    Failed(String),
}

impl Outcome {
    pub fn status(&self) -> StatusCode {
        match self {
            Outcome::Success => StatusCode::OK,
            Outcome::BadInput(_) => StatusCode::BAD_REQUEST,
            Outcome::Failed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Outcome::Success => "",
            Outcome::BadInput(m) | Outcome::Failed(m) => m,
        }
    }
}

struct Inner {
    config: ServiceConfig,
    resolver: CharacterResolver,
    templater: ScriptTemplater,
    bridge: CacheBridge,
    runner: EngineRunner,
    hardware: Arc<dyn HardwareSelector>,
    lock: Mutex<()>,
}

/// Cloneable handle to the conversion pipeline.
#[derive(Clone)]
pub struct ConversionService {
    inner: Arc<Inner>,
}

impl ConversionService {
    pub fn new(
        config: ServiceConfig,
        cache: Arc<dyn AudioCache>,
        hardware: Arc<dyn HardwareSelector>,
    ) -> Self {
        let inner = Inner {
            resolver: CharacterResolver::new(config.characters_dir()),
            templater: ScriptTemplater::new(config.template_path(), config.working_script_path()),
            bridge: CacheBridge::new(cache, config.raw_dir(), config.results_dir()),
            runner: EngineRunner::new(
                config.python_executable(),
                config.working_script_path(),
                config.architecture_root(),
                config.engine_timeout,
            ),
            hardware,
            config,
            lock: Mutex::new(()),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Create the engine's raw and results directories.
    pub async fn prepare(&self) -> std::io::Result<()> {
        self.inner.bridge.prepare().await
    }

    /// Handle a raw `/generate` body.
    ///
    /// The conversion runs on its own task holding the lock, so a caller that
    /// stops waiting (a dropped connection) neither kills the engine nor skips
    /// cleanup.
    pub async fn generate(&self, body: &[u8]) -> Outcome {
        let req = match request::parse_body(body) {
            Ok(req) => req,
            Err(e) => {
                info!("rejected /generate body: {e}");
                return Outcome::BadInput(e.to_string());
            }
        };

        let service = self.clone();
        match tokio::spawn(async move { service.run_exclusive(req).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!("conversion task failed: {e}");
                Outcome::Failed(format!("conversion task failed: {e}"))
            }
        }
    }

    async fn run_exclusive(&self, req: ConversionRequest) -> Outcome {
        let _guard = self.inner.lock.lock().await;
        info!(
            "converting {} with {} (pitch {}, gpu {:?}, session {:?}) -> {}",
            req.input_audio_id,
            req.character,
            req.pitch_shift,
            req.gpu_id.to_string(),
            req.session_id,
            req.output_audio_id
        );
        let started = std::time::Instant::now();

        match self.convert(&req).await {
            Ok(()) => match self.inner.bridge.clean_up().await {
                Ok(()) => {
                    info!("converted {} in {:?}", req.output_audio_id, started.elapsed());
                    Outcome::Success
                }
                Err(e) => {
                    let err = ConversionError::from(e);
                    warn!("conversion succeeded but cleanup failed: {err}");
                    Outcome::Failed(self.diagnostic_message(&err).await)
                }
            },
            Err(err) => {
                warn!("conversion failed after {:?}: {err}", started.elapsed());
                let mut message = match &err {
                    ConversionError::BadInput(_) => error_chain(&err),
                    _ => self.diagnostic_message(&err).await,
                };
                if let Err(cleanup) = self.inner.bridge.clean_up().await {
                    let _ = write!(message, "\n\nCleanup also failed: {cleanup}");
                }
                match &err {
                    ConversionError::BadInput(_) => Outcome::BadInput(message),
                    _ => Outcome::Failed(message),
                }
            }
        }
    }

    /// Accelerators visible to the hardware selector.
    pub async fn gpu_info(&self) -> Result<Vec<GpuInfo>, String> {
        let hardware = self.inner.hardware.clone();
        tokio::task::spawn_blocking(move || hardware.gpu_info())
            .await
            .map_err(|e| format!("gpu enumeration task failed: {e}"))?
    }

    async fn convert(&self, req: &ConversionRequest) -> Result<(), ConversionError> {
        let inner = &self.inner;
        let session = req.session_id.as_deref();

        if let Some(arch) = &req.architecture {
            if arch != &inner.config.architecture {
                warn!(
                    "request names architecture {arch:?}; this server runs {:?}",
                    inner.config.architecture
                );
            }
        }

        inner.templater.ensure_template().await?;
        let profile = inner.resolver.resolve(&req.character).await?;
        inner.bridge.require_input(session, &req.input_audio_id).await?;
        inner
            .templater
            .render(&ScriptParams {
                model_path: &profile.model_path,
                config_path: &profile.config_path,
                input_audio_id: &req.input_audio_id,
                pitch_shift: req.pitch_shift,
                speaker: &profile.speaker,
            })
            .await?;

        inner.bridge.stage_input(session, &req.input_audio_id).await?;
        let env = inner.hardware.environment(&req.gpu_id);
        inner.runner.run(&env).await?;
        inner.bridge.collect_output(session, &req.output_audio_id).await
    }

    /// Error chain plus a listing of the architecture root and any temporary
    /// files still present, for operators reading a 500.
    async fn diagnostic_message(&self, err: &ConversionError) -> String {
        let mut message = error_chain(err);
        let root = self.inner.config.architecture_root();

        let _ = write!(message, "\n\nContents of {}:\n", root.display());
        message.push_str(&list_dir(&root).await);

        let temp = self.inner.bridge.temp_files().await;
        if !temp.is_empty() {
            message.push_str("\nTemporary files present:\n");
            for path in temp {
                let _ = writeln!(message, "  {}", path.display());
            }
        }
        message
    }
}

async fn list_dir(dir: &Path) -> String {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) => return format!("  (could not list directory: {e})\n"),
    };
    let mut names = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let mut name = entry.file_name().to_string_lossy().into_owned();
        if entry.file_type().await.is_ok_and(|t| t.is_dir()) {
            name.push('/');
        }
        names.push(name);
    }
    names.sort();
    names.iter().map(|n| format!("  {n}\n")).collect()
}

#[cfg(all(test, unix))]
pub(crate) mod tests {
    use super::*;
    use crate::cache::FileCache;
    use crate::hardware::CudaSelector;
    use std::time::Duration;
    use timbre_core::audio::{AudioClip, encode_wav};
    use timbre_core::types::{GenerateResponse, Stage};

    /// A shell "engine": the five declarations are harmless command-not-found
    /// lines for `/bin/sh`; the tail copies the staged clip into `results/`.
    pub(crate) const SHELL_ENGINE: &str = "\
model_path = \"logs/G_0.pth\"
config_path = \"configs/config.json\"
clean_names = [\"src\"]
trans = [0]
spk_list = ['nyaru']
for f in raw/*.wav; do cp \"$f\" \"results/$(basename \"$f\" .wav)_converted.wav\"; done
";

    pub(crate) struct Harness {
        pub dir: tempfile::TempDir,
        pub config: ServiceConfig,
        pub cache: Arc<FileCache>,
        pub service: ConversionService,
    }

    pub(crate) async fn harness(engine: &str) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = ServiceConfig {
            root_dir: dir.path().to_path_buf(),
            architecture: "so_vits_svc_3".into(),
            engine_timeout: Some(Duration::from_secs(20)),
        };

        std::fs::create_dir_all(config.architecture_root()).unwrap();
        std::fs::write(config.working_script_path(), engine).unwrap();

        let python = config.python_executable();
        std::fs::create_dir_all(python.parent().unwrap()).unwrap();
        std::os::unix::fs::symlink("/bin/sh", &python).unwrap();

        let alice = config.characters_dir().join("alice");
        std::fs::create_dir_all(&alice).unwrap();
        std::fs::write(alice.join("G_2000.pth"), b"").unwrap();
        std::fs::write(alice.join("config.json"), r#"{"spk": {"alice_main": 0}}"#).unwrap();

        let cache = Arc::new(FileCache::new(config.cache_dir()));
        let service = ConversionService::new(
            config.clone(),
            cache.clone(),
            Arc::new(CudaSelector::default()),
        );
        service.prepare().await.unwrap();

        Harness {
            dir,
            config,
            cache,
            service,
        }
    }

    pub(crate) fn body(pitch: serde_json::Value) -> Vec<u8> {
        serde_json::json!({
            "Inputs": {"User Audio": "clip1"},
            "Options": {"Character": "alice", "Pitch Shift": pitch},
            "Output File": "out1",
            "GPU ID": "0",
            "Session ID": "s1"
        })
        .to_string()
        .into_bytes()
    }

    fn seed_input(h: &Harness) {
        h.cache
            .write(
                Stage::Preprocessed,
                Some("s1"),
                "clip1",
                &AudioClip::mono(vec![0.1, 0.2, 0.3], 44100),
            )
            .unwrap();
    }

    fn raw_and_results_empty(h: &Harness) -> bool {
        std::fs::read_dir(h.config.raw_dir()).unwrap().next().is_none()
            && std::fs::read_dir(h.config.results_dir()).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn end_to_end_conversion() {
        let h = harness(SHELL_ENGINE).await;
        seed_input(&h);

        let outcome = h.service.generate(&body(serde_json::json!(-3))).await;
        assert_eq!(outcome, Outcome::Success, "{}", outcome.message());
        assert_eq!(GenerateResponse::encode(outcome.message()).message, "");

        let script = std::fs::read_to_string(h.config.working_script_path()).unwrap();
        assert!(script.contains("trans = [-3]\n"));
        assert!(script.contains("clean_names = [\"clip1.wav\"]\n"));
        assert!(script.contains("spk_list = [\"alice_main\"]\n"));
        let model = h.config.characters_dir().join("alice/G_2000.pth");
        assert!(script.contains(&format!("model_path = \"{}\"\n", model.display())));

        let out = h.cache.read(Stage::Output, Some("s1"), "out1").unwrap();
        assert_eq!(out.sample_rate, 44100);
        assert_eq!(out.frames(), 3);
        assert!(raw_and_results_empty(&h));

        assert_eq!(
            std::fs::read_to_string(h.config.template_path()).unwrap(),
            SHELL_ENGINE
        );
    }

    #[tokio::test]
    async fn missing_input_is_a_500_and_leaves_no_raw_file() {
        let h = harness(SHELL_ENGINE).await;

        let outcome = h.service.generate(&body(serde_json::json!(-3))).await;
        assert_eq!(outcome.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(outcome.message().starts_with("Input audio not found!"), "{}", outcome.message());
        assert!(outcome.message().contains("Contents of"), "{}", outcome.message());
        assert!(raw_and_results_empty(&h));
    }

    #[tokio::test]
    async fn non_integer_pitch_is_rejected_before_any_write() {
        let h = harness(SHELL_ENGINE).await;
        seed_input(&h);

        let outcome = h.service.generate(&body(serde_json::json!("abc"))).await;
        assert_eq!(outcome.status(), StatusCode::BAD_REQUEST);
        assert!(outcome.message().contains("Pitch Shift"), "{}", outcome.message());
        assert!(!h.config.template_path().exists());
        assert_eq!(
            std::fs::read_to_string(h.config.working_script_path()).unwrap(),
            SHELL_ENGINE
        );
    }

    #[tokio::test]
    async fn engine_without_output_is_a_500() {
        let h = harness(&SHELL_ENGINE.replace("for f in", "exit 1\nfor f in")).await;
        seed_input(&h);

        let outcome = h.service.generate(&body(serde_json::json!(0))).await;
        assert_eq!(outcome.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let msg = outcome.message();
        assert!(msg.starts_with("No output file was produced!"), "{msg}");
        assert!(raw_and_results_empty(&h));
    }

    #[tokio::test]
    async fn unknown_character_is_a_500_with_directory_listing() {
        let h = harness(SHELL_ENGINE).await;
        seed_input(&h);
        let body = String::from_utf8(body(serde_json::json!(0)))
            .unwrap()
            .replace("alice", "bob");

        let outcome = h.service.generate(body.as_bytes()).await;
        assert_eq!(outcome.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let msg = outcome.message();
        assert!(msg.starts_with("Character \"bob\" not found!"), "{msg}");
        assert!(msg.contains("  inference_main.py\n"), "{msg}");
        assert!(msg.contains("  raw/\n"), "{msg}");
    }

    #[tokio::test]
    async fn stale_results_are_cleaned_and_retry_succeeds() {
        let h = harness(SHELL_ENGINE).await;
        seed_input(&h);
        let stale = encode_wav(&AudioClip::mono(vec![0.0; 4], 8000)).unwrap();
        std::fs::write(h.config.results_dir().join("old.wav"), &stale).unwrap();

        let outcome = h.service.generate(&body(serde_json::json!(1))).await;
        assert_eq!(outcome.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(outcome.message().contains("Please try generating your output again."));
        assert!(raw_and_results_empty(&h));

        let outcome = h.service.generate(&body(serde_json::json!(1))).await;
        assert_eq!(outcome, Outcome::Success, "{}", outcome.message());
    }

    #[tokio::test]
    async fn engine_timeout_is_reported() {
        let h = harness(SHELL_ENGINE).await;
        seed_input(&h);
        let mut config = h.config.clone();
        config.engine_timeout = Some(Duration::from_millis(200));
        std::fs::write(
            config.working_script_path(),
            SHELL_ENGINE.replace("for f in", "sleep 5\nfor f in"),
        )
        .unwrap();
        let service =
            ConversionService::new(config, h.cache.clone(), Arc::new(CudaSelector::default()));

        let outcome = service.generate(&body(serde_json::json!(0))).await;
        assert_eq!(outcome.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(outcome.message().starts_with("engine did not finish"), "{}", outcome.message());
        assert!(raw_and_results_empty(&h));
    }

    #[tokio::test]
    async fn concurrent_requests_are_serialized() {
        let h = harness(SHELL_ENGINE).await;
        seed_input(&h);

        let (first, second) = (body(serde_json::json!(1)), body(serde_json::json!(2)));
        let (a, b) = tokio::join!(h.service.generate(&first), h.service.generate(&second));
        assert_eq!(a, Outcome::Success, "{}", a.message());
        assert_eq!(b, Outcome::Success, "{}", b.message());
    }

    #[tokio::test]
    async fn abandoned_request_still_cleans_up() {
        let h = harness(&SHELL_ENGINE.replace("for f in", "sleep 1\nfor f in")).await;
        seed_input(&h);

        let payload = body(serde_json::json!(0));
        let abandoned =
            tokio::time::timeout(Duration::from_millis(300), h.service.generate(&payload)).await;
        assert!(abandoned.is_err());
        assert_eq!(
            std::fs::read_dir(h.config.raw_dir()).unwrap().count(),
            1,
            "input should still be staged while the engine runs"
        );

        // The detached conversion holds the lock until it has cleaned up.
        let _guard = h.service.inner.lock.lock().await;
        assert!(raw_and_results_empty(&h));
        assert!(h.cache.contains(Stage::Output, Some("s1"), "out1").unwrap());
    }

    /// A directory in `raw/` survives `remove_file`, so cleanup reports it.
    fn block_cleanup(h: &Harness) {
        let stuck = h.config.raw_dir().join("stuck");
        std::fs::create_dir(&stuck).unwrap();
        std::fs::write(stuck.join("leftover.wav"), b"x").unwrap();
    }

    #[tokio::test]
    async fn cleanup_failure_after_success_is_a_500() {
        let h = harness(SHELL_ENGINE).await;
        seed_input(&h);
        block_cleanup(&h);

        let outcome = h.service.generate(&body(serde_json::json!(0))).await;
        assert_eq!(outcome.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let msg = outcome.message();
        assert!(msg.starts_with("failed to remove 1 temporary file(s)"), "{msg}");
        assert!(msg.contains("stuck"), "{msg}");
        assert!(h.cache.contains(Stage::Output, Some("s1"), "out1").unwrap());
    }

    #[tokio::test]
    async fn cleanup_failure_after_error_is_appended() {
        let h = harness(SHELL_ENGINE).await;
        block_cleanup(&h);

        let outcome = h.service.generate(&body(serde_json::json!(0))).await;
        assert_eq!(outcome.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let msg = outcome.message();
        assert!(msg.starts_with("Input audio not found!"), "{msg}");
        assert!(msg.contains("\n\nCleanup also failed: failed to remove 1"), "{msg}");
    }
}
