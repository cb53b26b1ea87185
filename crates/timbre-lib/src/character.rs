//! Character resolution: character name to model file, config file and speaker.
//!
//! The character directory is re-read on every request so checkpoints can be
//! swapped out-of-band without restarting the server.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Map, Value};

use timbre_core::types::{
    CONFIG_FILE_NAME, CharacterProfile, MODEL_FILE_PREFIX, SPEAKER_FILE_NAME,
};

use crate::error::ConversionError;

#[derive(Deserialize)]
struct ModelConfig {
    spk: Map<String, Value>,
}

#[derive(Deserialize)]
struct SpeakerSelector {
    speaker: String,
}

#[derive(Debug, Clone)]
pub struct CharacterResolver {
    characters_dir: PathBuf,
}

impl CharacterResolver {
    pub fn new(characters_dir: impl Into<PathBuf>) -> Self {
        Self {
            characters_dir: characters_dir.into(),
        }
    }

    pub fn character_dir(&self, character: &str) -> PathBuf {
        self.characters_dir.join(character)
    }

    pub async fn resolve(&self, character: &str) -> Result<CharacterProfile, ConversionError> {
        let dir = self.character_dir(character);
        if !tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(ConversionError::Configuration(format!(
                "Character \"{character}\" not found! Expected a directory at {}",
                dir.display()
            )));
        }

        let model_path = find_model(&dir).await?;
        let config_path = find_config(&dir).await?;
        let speaker = select_speaker(&dir, &config_path).await?;

        tracing::debug!(
            "resolved character {character}: model={} speaker={speaker}",
            model_path.display()
        );

        Ok(CharacterProfile {
            model_path,
            config_path,
            speaker,
        })
    }
}

async fn find_model(dir: &Path) -> Result<PathBuf, ConversionError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| ConversionError::io(format!("failed to list {}", dir.display()), e))?;

    let mut candidates = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ConversionError::io(format!("failed to list {}", dir.display()), e))?
    {
        if entry.file_name().to_string_lossy().starts_with(MODEL_FILE_PREFIX) {
            candidates.push(entry.path());
        }
    }

    match candidates.len() {
        0 => Err(ConversionError::Configuration(format!(
            "Model file was not found! Expected a file with the name {MODEL_FILE_PREFIX}<number>.pth in {}",
            dir.display()
        ))),
        1 => Ok(candidates.remove(0)),
        _ => Err(ConversionError::Configuration(format!(
            "Too many model files found! Expected only one file with the name {MODEL_FILE_PREFIX}<number>.pth in {}",
            dir.display()
        ))),
    }
}

async fn find_config(dir: &Path) -> Result<PathBuf, ConversionError> {
    let path = dir.join(CONFIG_FILE_NAME);
    if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
        Ok(path)
    } else {
        Err(ConversionError::Configuration(format!(
            "Config file not found! Expecting a file with the name {CONFIG_FILE_NAME} in {}",
            dir.display()
        )))
    }
}

async fn select_speaker(dir: &Path, config_path: &Path) -> Result<String, ConversionError> {
    let config: ModelConfig = read_json(config_path).await?;
    let speakers: Vec<&String> = config.spk.keys().collect();

    match speakers.as_slice() {
        [] => Err(ConversionError::Configuration(format!(
            "{} declares no speakers in \"spk\"",
            config_path.display()
        ))),
        [only] => Ok((*only).clone()),
        _ => {
            let selected = read_selector(dir).await?;
            if config.spk.contains_key(&selected) {
                Ok(selected)
            } else {
                Err(ConversionError::Configuration(format!(
                    "The key \"{selected}\", from {SPEAKER_FILE_NAME}, not found in {CONFIG_FILE_NAME}. Expecting one of: {speakers:?}"
                )))
            }
        }
    }
}

async fn read_selector(dir: &Path) -> Result<String, ConversionError> {
    let path = dir.join(SPEAKER_FILE_NAME);
    if !tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
        return Err(ConversionError::Configuration(format!(
            "{SPEAKER_FILE_NAME} not found! If {CONFIG_FILE_NAME} has more than one speaker, then you must add a \
             {SPEAKER_FILE_NAME} file to the character folder which specifies the desired speaker. The contents of \
             {SPEAKER_FILE_NAME} should be a single entry in the following format: {{\"speaker\": <desired speaker name>}}"
        )));
    }
    let selector: SpeakerSelector = read_json(&path).await?;
    Ok(selector.speaker)
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConversionError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| ConversionError::io(format!("failed to read {}", path.display()), e))?;
    serde_json::from_str(&text).map_err(|e| {
        ConversionError::Configuration(format!("{} is malformed: {e}", path.display()))
    })
}
