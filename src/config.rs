//! Configuration for the corpus tools. Everything has a default so a config file only needs to
//! mention the values it wants to change, and the binaries can run without one at all.
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub normaliser: NormaliserConfig,
    pub dispatcher: DispatcherConfig,
    pub metadata: MetadataConfig,
}

/// Letters that survive character-set filtering. Digits, whitespace and `. , ! ? -` are always
/// allowed on top of these.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alphabet {
    /// The whole Cyrillic block, U+0400 to U+04FF
    #[default]
    Cyrillic,
    /// Only the letters of the modern Bulgarian alphabet (plus `ѝ`)
    Bulgarian,
    /// Cyrillic block and ASCII letters
    CyrillicLatin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormaliserConfig {
    /// Shortest sentence (in characters) kept in the corpus
    pub min_len: usize,
    /// Longest sentence (in characters) kept in the corpus
    pub max_len: usize,
    /// Split over-long sentences at word boundaries instead of dropping them
    pub split_long_sentences: bool,
    pub alphabet: Alphabet,
    /// Regular expressions for references and abbreviations that are deleted outright
    pub remove_patterns: Vec<String>,
    /// Individual noise characters that are deleted before anything else runs
    pub remove_chars: String,
}

impl Default for NormaliserConfig {
    fn default() -> Self {
        Self {
            min_len: 10,
            max_len: 150,
            split_long_sentences: false,
            alphabet: Alphabet::default(),
            remove_patterns: vec![
                r"Бел\.\s?(пр|ред|авт)\.".to_string(),
                r"\bг-(н|жа|ца)\b".to_string(),
                r"\b\d+\.".to_string(),
            ],
            remove_chars: "*—_„“[]…".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Maximum number of jobs in flight at once
    pub workers: usize,
    /// Requests allowed per window, `0` disables rate limiting
    pub rate_limit: usize,
    pub window_secs: f64,
    /// Recoverable failures tolerated before a job is marked as failed
    pub max_retries: u32,
    /// Back-off used when a rate limit error doesn't say how long to wait
    pub fallback_delay_secs: f64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 24,
            rate_limit: 500,
            window_secs: 60.0,
            max_retries: 5,
            fallback_delay_secs: 10.0,
        }
    }
}

impl DispatcherConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs_f64(self.window_secs)
    }

    pub fn fallback_delay(&self) -> Duration {
        Duration::from_secs_f64(self.fallback_delay_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetadataConfig {
    pub delimiter: char,
    /// Write and expect a header row
    pub header: bool,
    /// Include the speaker column, the legacy layout is just `path, sentence`
    pub speaker_column: bool,
    pub speaker: String,
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            delimiter: ',',
            header: true,
            speaker_column: true,
            speaker: "1".to_string(),
        }
    }
}

impl Config {
    /// Loads the config from a TOML file, or the defaults if no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => {
                let contents = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config {}", path.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let n = &self.normaliser;
        if n.min_len == 0 || n.min_len > n.max_len {
            anyhow::bail!(
                "normaliser.min_len ({}) must be non-zero and no greater than normaliser.max_len ({})",
                n.min_len,
                n.max_len
            );
        }
        let d = &self.dispatcher;
        if d.workers == 0 {
            anyhow::bail!("dispatcher.workers must be at least 1");
        }
        if !(d.window_secs.is_finite() && d.window_secs > 0.0) {
            anyhow::bail!("dispatcher.window_secs must be a positive number of seconds");
        }
        if !(d.fallback_delay_secs.is_finite() && d.fallback_delay_secs >= 0.0) {
            anyhow::bail!("dispatcher.fallback_delay_secs can't be negative");
        }
        if !self.metadata.delimiter.is_ascii() {
            anyhow::bail!(
                "metadata.delimiter '{}' must be a single ASCII character",
                self.metadata.delimiter
            );
        }
        Ok(())
    }
}
