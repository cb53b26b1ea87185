//! Entry-script parameterization.
//!
//! The engine is configured only through five top-level assignments in its
//! entry script. Rendering replaces the first line that starts with each
//! declaration and passes every other byte through unchanged, so rendering the
//! same template with the same parameters always yields the same script.
//!
//! Pure functions, no I/O.

use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

use regex::{NoExpand, Regex};

use crate::types::TEMP_FILE_EXTENSION;

// Anchored at line start; `[^\r\n]*` keeps CRLF line endings intact.
static RE_MODEL_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^model_path = [^\r\n]*").unwrap());
static RE_CONFIG_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^config_path = [^\r\n]*").unwrap());
static RE_CLEAN_NAMES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^clean_names = [^\r\n]*").unwrap());
static RE_TRANS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^trans = [^\r\n]*").unwrap());
static RE_SPK_LIST: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^spk_list = [^\r\n]*").unwrap());

/// One of the parameter lines the engine's entry script must declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Declaration {
    ModelPath,
    ConfigPath,
    CleanNames,
    Trans,
    SpkList,
}

impl Declaration {
    pub const ALL: [Declaration; 5] = [
        Declaration::ModelPath,
        Declaration::ConfigPath,
        Declaration::CleanNames,
        Declaration::Trans,
        Declaration::SpkList,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Declaration::ModelPath => "model_path",
            Declaration::ConfigPath => "config_path",
            Declaration::CleanNames => "clean_names",
            Declaration::Trans => "trans",
            Declaration::SpkList => "spk_list",
        }
    }

    fn pattern(self) -> &'static Regex {
        match self {
            Declaration::ModelPath => &*RE_MODEL_PATH,
            Declaration::ConfigPath => &*RE_CONFIG_PATH,
            Declaration::CleanNames => &*RE_CLEAN_NAMES,
            Declaration::Trans => &*RE_TRANS,
            Declaration::SpkList => &*RE_SPK_LIST,
        }
    }
}

/// Values substituted into the entry script for one conversion.
#[derive(Debug, Clone)]
pub struct ScriptParams<'a> {
    pub model_path: &'a Path,
    pub config_path: &'a Path,
    pub input_audio_id: &'a str,
    pub pitch_shift: i64,
    pub speaker: &'a str,
}

impl ScriptParams<'_> {
    /// The full replacement line for a declaration.
    pub fn line(&self, decl: Declaration) -> String {
        match decl {
            Declaration::ModelPath => {
                format!("model_path = {}", quote(&self.model_path.to_string_lossy()))
            }
            Declaration::ConfigPath => {
                format!("config_path = {}", quote(&self.config_path.to_string_lossy()))
            }
            Declaration::CleanNames => format!(
                "clean_names = [{}]",
                quote(&staged_file_name(self.input_audio_id))
            ),
            Declaration::Trans => format!("trans = [{}]", self.pitch_shift),
            Declaration::SpkList => format!("spk_list = [{}]", quote(self.speaker)),
        }
    }
}

/// Declarations the template did not contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingDeclarations(pub Vec<Declaration>);

impl fmt::Display for MissingDeclarations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.0.iter().map(|d| format!("`{} = `", d.name())).collect();
        write!(
            f,
            "entry script template has no line starting with {}",
            names.join(", ")
        )
    }
}

impl std::error::Error for MissingDeclarations {}

/// Render a working script from the pristine template.
///
/// Fails if any of the five declarations is absent, since the engine would
/// then silently run with whatever value the template hard-codes.
pub fn render(template: &str, params: &ScriptParams<'_>) -> Result<String, MissingDeclarations> {
    let missing: Vec<_> = Declaration::ALL
        .into_iter()
        .filter(|d| !d.pattern().is_match(template))
        .collect();
    if !missing.is_empty() {
        return Err(MissingDeclarations(missing));
    }

    let mut content = template.to_string();
    for decl in Declaration::ALL {
        let line = params.line(decl);
        content = decl.pattern().replace(&content, NoExpand(&line)).into_owned();
    }
    Ok(content)
}

/// Name of the file an input clip is staged under in the raw directory.
pub fn staged_file_name(input_audio_id: &str) -> String {
    format!("{input_audio_id}{TEMP_FILE_EXTENSION}")
}

/// Double-quoted string literal, valid in the engine's script language.
fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}
