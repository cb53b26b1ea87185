//! Shared audio cache keyed by (stage, session, id).
//!
//! [`AudioCache`] is the seam other cache backends plug into; [`FileCache`]
//! stores each clip as a WAV file under
//! `<root>/<session or "no-session">/<stage>/<id>.wav`.

use std::path::{Path, PathBuf};

use timbre_core::audio::{AudioClip, AudioError, decode_audio, encode_wav};
use timbre_core::types::Stage;

const NO_SESSION_DIR: &str = "no-session";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("\"{id}\" was not found in the {stage} cache")]
    NotFound { stage: Stage, id: String },

    #[error("{0:?} cannot be used as a cache key")]
    InvalidKey(String),

    #[error("cache I/O failed for {}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cached audio at {} is unreadable", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: AudioError,
    },

    #[error("clip for {} could not be encoded", .path.display())]
    Encode {
        path: PathBuf,
        #[source]
        source: AudioError,
    },
}

/// Audio storage shared with the rest of the conversion stack.
///
/// Implementations are synchronous; async callers go through
/// `spawn_blocking`.
pub trait AudioCache: Send + Sync {
    fn contains(&self, stage: Stage, session: Option<&str>, id: &str) -> Result<bool, CacheError>;

    fn read(&self, stage: Stage, session: Option<&str>, id: &str) -> Result<AudioClip, CacheError>;

    fn write(
        &self,
        stage: Stage,
        session: Option<&str>,
        id: &str,
        clip: &AudioClip,
    ) -> Result<(), CacheError>;
}

/// Filesystem-backed [`AudioCache`].
#[derive(Debug, Clone)]
pub struct FileCache {
    root: PathBuf,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, stage: Stage, session: Option<&str>, id: &str) -> Result<PathBuf, CacheError> {
        let session_dir = match session {
            Some(s) if !s.is_empty() => key_component(s)?,
            _ => NO_SESSION_DIR,
        };
        let file = format!("{}.wav", key_component(id)?);
        Ok(self.root.join(session_dir).join(stage.as_str()).join(file))
    }
}

impl AudioCache for FileCache {
    fn contains(&self, stage: Stage, session: Option<&str>, id: &str) -> Result<bool, CacheError> {
        Ok(self.path(stage, session, id)?.is_file())
    }

    fn read(&self, stage: Stage, session: Option<&str>, id: &str) -> Result<AudioClip, CacheError> {
        let path = self.path(stage, session, id)?;
        let bytes = match std::fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CacheError::NotFound {
                    stage,
                    id: id.to_string(),
                });
            }
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        decode_audio(bytes, Some("wav")).map_err(|source| CacheError::Decode { path, source })
    }

    fn write(
        &self,
        stage: Stage,
        session: Option<&str>,
        id: &str,
        clip: &AudioClip,
    ) -> Result<(), CacheError> {
        let path = self.path(stage, session, id)?;
        let encoded = encode_wav(clip).map_err(|source| CacheError::Encode {
            path: path.clone(),
            source,
        })?;
        let io_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| CacheError::Io { path, source }
        };

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(io_err(dir))?;
        }
        // Readers never see a half-written clip.
        let partial = path.with_extension("wav.partial");
        std::fs::write(&partial, encoded).map_err(io_err(&partial))?;
        std::fs::rename(&partial, &path).map_err(io_err(&path))?;
        tracing::debug!("cached {stage}/{id} at {}", path.display());
        Ok(())
    }
}

/// A key must name exactly one path component.
fn key_component(value: &str) -> Result<&str, CacheError> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains(['/', '\\', '\0'])
    {
        return Err(CacheError::InvalidKey(value.to_string()));
    }
    Ok(value)
}
