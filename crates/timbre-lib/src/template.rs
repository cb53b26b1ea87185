//! Entry-script template store.
//!
//! The first request copies the engine's untouched entry script to a template
//! file. Every render reads that template and overwrites the working script, so
//! a working script left truncated or stale by a crash is rebuilt on the next
//! request. Both files are written via a sibling `.partial` file and a rename.

use std::path::{Path, PathBuf};

use timbre_core::script::{self, ScriptParams};

use crate::error::ConversionError;

#[derive(Debug, Clone)]
pub struct ScriptTemplater {
    template_path: PathBuf,
    working_path: PathBuf,
}

impl ScriptTemplater {
    pub fn new(template_path: impl Into<PathBuf>, working_path: impl Into<PathBuf>) -> Self {
        Self {
            template_path: template_path.into(),
            working_path: working_path.into(),
        }
    }

    pub fn template_path(&self) -> &Path {
        &self.template_path
    }

    pub fn working_path(&self) -> &Path {
        &self.working_path
    }

    /// Capture the template from the working script if none exists yet.
    ///
    /// Returns `true` when this call performed the capture. An existing
    /// template is never rewritten.
    pub async fn ensure_template(&self) -> Result<bool, ConversionError> {
        if tokio::fs::try_exists(&self.template_path)
            .await
            .map_err(|e| self.io_err("failed to check for", &self.template_path, e))?
        {
            return Ok(false);
        }

        let content = tokio::fs::read(&self.working_path)
            .await
            .map_err(|e| self.io_err("failed to read entry script", &self.working_path, e))?;
        write_atomic(&self.template_path, &content)
            .await
            .map_err(|e| self.io_err("failed to write template", &self.template_path, e))?;

        tracing::info!(
            "captured entry script template at {}",
            self.template_path.display()
        );
        Ok(true)
    }

    /// Render the template with `params` into the working script.
    pub async fn render(&self, params: &ScriptParams<'_>) -> Result<(), ConversionError> {
        let template = tokio::fs::read_to_string(&self.template_path)
            .await
            .map_err(|e| self.io_err("failed to read template", &self.template_path, e))?;

        let content = script::render(&template, params).map_err(|e| {
            ConversionError::Configuration(format!("{e} ({})", self.template_path.display()))
        })?;

        write_atomic(&self.working_path, content.as_bytes())
            .await
            .map_err(|e| self.io_err("failed to write entry script", &self.working_path, e))?;

        tracing::debug!(
            "rendered {} (trans={}, speaker={})",
            self.working_path.display(),
            params.pitch_shift,
            params.speaker
        );
        Ok(())
    }

    fn io_err(&self, what: &str, path: &Path, source: std::io::Error) -> ConversionError {
        ConversionError::io(format!("{what} {}", path.display()), source)
    }
}

async fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    let partial = PathBuf::from(partial);

    tokio::fs::write(&partial, content).await?;
    tokio::fs::rename(&partial, path).await
}
