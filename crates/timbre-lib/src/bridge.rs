//! Cache bridge: moves clips between the shared cache and the engine's
//! single-slot `raw` and `results` directories.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use timbre_core::script::staged_file_name;
use timbre_core::types::Stage;
use timbre_core::audio::{decode_audio, encode_wav};

use crate::cache::AudioCache;
use crate::error::{CleanupError, ConversionError};

#[derive(Clone)]
pub struct CacheBridge {
    cache: Arc<dyn AudioCache>,
    raw_dir: PathBuf,
    results_dir: PathBuf,
}

impl CacheBridge {
    pub fn new(
        cache: Arc<dyn AudioCache>,
        raw_dir: impl Into<PathBuf>,
        results_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cache,
            raw_dir: raw_dir.into(),
            results_dir: results_dir.into(),
        }
    }

    pub fn raw_dir(&self) -> &Path {
        &self.raw_dir
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    /// Create the raw and results directories if they are missing.
    pub async fn prepare(&self) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.raw_dir).await?;
        tokio::fs::create_dir_all(&self.results_dir).await
    }

    /// Fail unless `input_id` is present in the preprocessed stage.
    pub async fn require_input(
        &self,
        session: Option<&str>,
        input_id: &str,
    ) -> Result<(), ConversionError> {
        let cache = self.cache.clone();
        let (s, id) = (session.map(str::to_owned), input_id.to_owned());
        let found =
            blocking(move || cache.contains(Stage::Preprocessed, s.as_deref(), &id)).await??;
        if found {
            Ok(())
        } else {
            Err(ConversionError::processing(format!(
                "Input audio not found! Expected a file named \"{input_id}\" in the Preprocess cache."
            )))
        }
    }

    /// Copy a preprocessed clip into the raw directory under its staged name.
    pub async fn stage_input(
        &self,
        session: Option<&str>,
        input_id: &str,
    ) -> Result<PathBuf, ConversionError> {
        let cache = self.cache.clone();
        let (s, id) = (session.map(str::to_owned), input_id.to_owned());
        let clip = blocking(move || cache.read(Stage::Preprocessed, s.as_deref(), &id)).await??;

        let target = self.raw_dir.join(staged_file_name(input_id));
        let encoded = encode_wav(&clip).map_err(|e| {
            ConversionError::processing_caused_by(format!("failed to encode {input_id}"), e)
        })?;
        tokio::fs::write(&target, encoded).await.map_err(|e| {
            ConversionError::io(
                format!(
                    "Unable to copy file from the audio cache to {}",
                    self.raw_dir.display()
                ),
                e,
            )
        })?;
        tracing::debug!(
            "staged {input_id} ({} frames @ {} Hz) at {}",
            clip.frames(),
            clip.sample_rate,
            target.display()
        );
        Ok(target)
    }

    /// Move the engine's single output file into the output stage.
    ///
    /// More than one file means an earlier run was not cleaned up; the
    /// directories are cleaned and the caller is asked to retry.
    pub async fn collect_output(
        &self,
        session: Option<&str>,
        output_id: &str,
    ) -> Result<(), ConversionError> {
        let mut files = list_files(&self.results_dir).await.map_err(|e| {
            ConversionError::io(format!("failed to list {}", self.results_dir.display()), e)
        })?;

        let source = match files.len() {
            0 => {
                return Err(ConversionError::processing(format!(
                    "No output file was produced! Expected file to appear in {}",
                    self.results_dir.display()
                )));
            }
            1 => files.remove(0),
            n => {
                tracing::warn!(
                    "{n} files in {}; an earlier run left stale output",
                    self.results_dir.display()
                );
                let message = format!(
                    "More than one file was found in {}! That directory should be cleaned every time output is generated. ",
                    self.results_dir.display()
                );
                return Err(match self.clean_up().await {
                    Ok(()) => ConversionError::processing(format!(
                        "{message}The directory has now been cleaned. Please try generating your output again."
                    )),
                    Err(e) => ConversionError::processing_caused_by(
                        format!(
                            "{message}An attempt was made to clean the directory to correct this situation, but the operation failed."
                        ),
                        e,
                    ),
                });
            }
        };

        let bytes = tokio::fs::read(&source)
            .await
            .map_err(|e| ConversionError::io(format!("failed to read {}", source.display()), e))?;
        let extension = source.extension().and_then(|e| e.to_str());
        let clip = decode_audio(bytes, extension).map_err(|e| {
            ConversionError::processing_caused_by(
                format!("engine output {} is not readable audio", source.display()),
                e,
            )
        })?;

        let cache = self.cache.clone();
        let (s, id) = (session.map(str::to_owned), output_id.to_owned());
        blocking(move || cache.write(Stage::Output, s.as_deref(), &id, &clip)).await??;

        tokio::fs::remove_file(&source)
            .await
            .map_err(|e| ConversionError::io(format!("failed to remove {}", source.display()), e))?;
        Ok(())
    }

    /// Every file currently in the raw and results directories.
    pub async fn temp_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        for dir in [&self.results_dir, &self.raw_dir] {
            match list_files(dir).await {
                Ok(found) => files.extend(found),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!("failed to list {}: {e}", dir.display()),
            }
        }
        files
    }

    /// Remove every temporary file, attempting all of them before reporting.
    pub async fn clean_up(&self) -> Result<(), CleanupError> {
        let mut failures = Vec::new();
        for path in self.temp_files().await {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("failed to remove {}: {e}", path.display());
                    failures.push((path, e));
                }
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupError { failures })
        }
    }
}

async fn list_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        files.push(entry.path());
    }
    files.sort();
    Ok(files)
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> T + Send + 'static,
) -> Result<T, ConversionError> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ConversionError::processing_caused_by("cache task failed", e))
}
