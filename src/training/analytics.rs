//! Does some analytics on datasets. The character inventory is what the training framework needs
//! for its character set config, the length histogram is mainly to sanity check the corpus
//! bounds.
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::info;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Analytics {
    pub sentences: usize,
    /// Every distinct character, sorted
    pub unique_chars: String,
    /// Distinct characters that are lowercase
    pub lower_chars: String,
    /// Distinct characters after forcing everything to lowercase
    pub forced_lower_chars: String,
    /// Sentence length in characters to number of sentences with that length
    pub sentence_lengths: BTreeMap<usize, usize>,
}

#[derive(Debug, Default)]
pub struct AnalyticsGenerator {
    chars: BTreeSet<char>,
    sentence_lengths: BTreeMap<usize, usize>,
    sentences: usize,
    /// Sentences longer than this are logged
    long_sentence: Option<usize>,
}

impl AnalyticsGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn_above(mut self, length: usize) -> Self {
        self.long_sentence = Some(length);
        self
    }

    pub fn push_sentence(&mut self, sentence: &str) {
        let mut sentence_len = 0;
        for c in sentence.chars() {
            self.chars.insert(c);
            sentence_len += 1;
        }
        self.sentences += 1;
        *self.sentence_lengths.entry(sentence_len).or_default() += 1;
        if self.long_sentence.is_some_and(|x| sentence_len > x) {
            info!("Very long sentence found: '{}'", sentence);
        }
    }

    pub fn generate_report(&self) -> Analytics {
        let lower_chars = self.chars.iter().filter(|c| c.is_lowercase()).collect();
        let forced_lower_chars = self
            .chars
            .iter()
            .flat_map(|c| c.to_lowercase())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        Analytics {
            sentences: self.sentences,
            unique_chars: self.chars.iter().collect(),
            lower_chars,
            forced_lower_chars,
            sentence_lengths: self.sentence_lengths.clone(),
        }
    }
}
