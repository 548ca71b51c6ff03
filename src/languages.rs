//! Language configuration for compilation and execution

use std::collections::HashMap;
use std::sync::OnceLock;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Language tags accepted on the submission wire.
///
/// The integer codes are the wire representation and must stay stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Language {
    C = 1,
    Cpp11 = 2,
    Cpp17 = 3,
    Java = 4,
    Python = 5,
    PyPy = 6,
}

impl Language {
    /// Key of this language in the configuration table.
    pub fn tag(&self) -> &'static str {
        match self {
            Language::C => "c",
            Language::Cpp11 => "cpp11",
            Language::Cpp17 => "cpp17",
            Language::Java => "java",
            Language::Python => "python",
            Language::PyPy => "pypy",
        }
    }
}

impl From<Language> for u8 {
    fn from(language: Language) -> u8 {
        language as u8
    }
}

impl TryFrom<u8> for Language {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Language::C),
            2 => Ok(Language::Cpp11),
            3 => Ok(Language::Cpp17),
            4 => Ok(Language::Java),
            5 => Ok(Language::Python),
            6 => Ok(Language::PyPy),
            other => Err(format!("unsupported language code: {}", other)),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.tag())
    }
}

/// Configuration for a supported programming language
#[derive(Debug, Clone)]
pub struct LanguageConfig {
    /// Name the source file is staged under (e.g., "Main.cpp")
    pub source_filename: String,
    /// Name of the compiled artifact (e.g., "Main")
    pub compiled_filename: String,
    /// Whether a compile step runs before the testcases
    pub need_compile: bool,
    /// Compile command (empty when not needed)
    pub compile_cmd: Vec<String>,
    /// Run command
    pub run_cmd: Vec<String>,
    /// Time limit multiplier applied before handing limits to the sandbox
    pub time_factor: u64,
    /// Memory limit multiplier applied before handing limits to the sandbox
    pub memory_factor: u64,
}

impl LanguageConfig {
    /// Scale a submission time limit (ms) into the sandbox CPU limit (ns).
    pub fn cpu_limit_ns(&self, time_limit_ms: u64) -> u64 {
        time_limit_ms * self.time_factor * 1_000_000
    }

    /// Scale a submission memory limit (KiB) into the sandbox limit (bytes).
    pub fn memory_limit_bytes(&self, memory_limit_kib: u64) -> u64 {
        memory_limit_kib * self.memory_factor * 1024
    }
}

/// Raw TOML configuration for a language
#[derive(Debug, Deserialize)]
struct RawLanguageConfig {
    source_file: String,
    #[serde(default)]
    compiled_file: Option<String>,
    #[serde(default)]
    compile_command: Option<Vec<String>>,
    run_command: Vec<String>,
    #[serde(default = "default_factor")]
    time_factor: u64,
    #[serde(default = "default_factor")]
    memory_factor: u64,
}

fn default_factor() -> u64 {
    1
}

/// Global language configurations
static LANGUAGES: OnceLock<HashMap<String, LanguageConfig>> = OnceLock::new();

/// Initialize the language table from the packaged TOML file.
///
/// Fails if called twice or if the table contains a duplicate tag.
pub fn init_languages() -> anyhow::Result<()> {
    let content = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/files/languages.toml"));
    let languages = parse_languages(content)?;
    LANGUAGES
        .set(languages)
        .map_err(|_| anyhow::anyhow!("Languages already initialized"))?;
    Ok(())
}

fn parse_languages(content: &str) -> anyhow::Result<HashMap<String, LanguageConfig>> {
    let raw_configs: HashMap<String, RawLanguageConfig> = toml::from_str(content)?;

    let mut languages = HashMap::new();
    for (name, raw) in raw_configs {
        let need_compile = raw.compile_command.is_some();
        let compiled_filename = match raw.compiled_file {
            Some(filename) => filename,
            None if need_compile => {
                anyhow::bail!("Language '{}' compiles but names no compiled_file", name)
            }
            // Interpreted directly from the staged source.
            None => raw.source_file.clone(),
        };
        let config = LanguageConfig {
            source_filename: raw.source_file,
            compiled_filename,
            need_compile,
            compile_cmd: raw.compile_command.unwrap_or_default(),
            run_cmd: raw.run_command,
            time_factor: raw.time_factor,
            memory_factor: raw.memory_factor,
        };
        register(&mut languages, &name.to_lowercase(), config)?;
    }
    Ok(languages)
}

fn register(
    languages: &mut HashMap<String, LanguageConfig>,
    tag: &str,
    config: LanguageConfig,
) -> anyhow::Result<()> {
    if languages.insert(tag.to_string(), config).is_some() {
        anyhow::bail!("Language '{}' is already registered", tag);
    }
    Ok(())
}

/// Get the configuration for a language; fails on an unknown tag or an
/// uninitialized table.
pub fn get_language_config(language: Language) -> anyhow::Result<LanguageConfig> {
    let languages = LANGUAGES.get().context("Language table not initialized")?;
    languages
        .get(language.tag())
        .cloned()
        .with_context(|| format!("Language '{}' is not registered", language))
}
