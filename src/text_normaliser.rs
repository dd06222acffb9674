//! Text cleanup that runs before sentence segmentation. Each stage is a plain function from
//! string to string so they can be tested on their own, `Normaliser` just strings them together
//! with the configured patterns and alphabet.
//!
//! The cleanup is lossy on purpose. Characters outside the allowed set are deleted rather than
//! transliterated so a stray Latin word or a symbol the TTS model has never seen simply
//! disappears. This can glue two words together if the deleted character separated them, we
//! accept that rather than guessing at a replacement.
use crate::config::{Alphabet, NormaliserConfig};
use anyhow::Context;
use once_cell::sync::OnceCell;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

/// Punctuation that survives character filtering
pub const ALLOWED_PUNCTUATION: &[char] = &['.', ',', '!', '?', '-'];

/// Punctuation that ends a sentence
pub const TERMINAL_PUNCTUATION: &[char] = &['.', '!', '?'];

#[inline]
pub fn is_terminal(c: char) -> bool {
    TERMINAL_PUNCTUATION.contains(&c)
}

impl Alphabet {
    pub fn contains_letter(&self, c: char) -> bool {
        let cyrillic = ('\u{0400}'..='\u{04FF}').contains(&c);
        match self {
            Self::Cyrillic => cyrillic,
            Self::Bulgarian => {
                (('А'..='я').contains(&c) && !matches!(c, 'Ы' | 'ы' | 'Э' | 'э'))
                    || c == 'Ѝ'
                    || c == 'ѝ'
            }
            Self::CyrillicLatin => cyrillic || c.is_ascii_alphabetic(),
        }
    }

    /// Whether the character is part of the allowed set: letters of the alphabet, whitespace,
    /// ASCII digits and `ALLOWED_PUNCTUATION`.
    pub fn allows(&self, c: char) -> bool {
        c.is_whitespace()
            || c.is_ascii_digit()
            || ALLOWED_PUNCTUATION.contains(&c)
            || self.contains_letter(c)
    }
}

#[derive(Debug, Clone)]
pub struct Normaliser {
    alphabet: Alphabet,
    remove_patterns: Vec<Regex>,
    remove_chars: Vec<char>,
}

impl Normaliser {
    pub fn new(config: &NormaliserConfig) -> anyhow::Result<Self> {
        let remove_patterns = config
            .remove_patterns
            .iter()
            .map(|p| Regex::new(p).with_context(|| format!("Invalid removal pattern: {}", p)))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            alphabet: config.alphabet,
            remove_patterns,
            remove_chars: config.remove_chars.chars().collect(),
        })
    }

    /// Runs every cleanup stage, the output is ready to be split into sentences.
    ///
    /// Deleting a character can expose a new match for a removal pattern (`X5.` loses the `X` and
    /// becomes a numbered item marker) so the stages are repeated until the text stops changing.
    /// Every pass that changes anything either deletes a non-whitespace character or only
    /// touches whitespace, which settles in one more pass, so this terminates.
    pub fn normalise(&self, x: &str) -> String {
        let mut s = unicode_normalise(x);
        loop {
            let next = self.clean_pass(&s);
            if next == s {
                return s;
            }
            s = next;
        }
    }

    fn clean_pass(&self, x: &str) -> String {
        let s = strip_noise(x, &self.remove_patterns, &self.remove_chars);
        let s = collapse_whitespace(&s);
        let s = retain_allowed(&s, self.alphabet);
        // Deleted characters can leave a double space behind
        let s = collapse_whitespace(&s);
        space_after_terminals(s.trim())
    }
}

/// Canonical composition, so `и` followed by a combining breve compares equal to `й`.
pub fn unicode_normalise(x: &str) -> String {
    x.nfc().collect()
}

/// Deletes noise characters, then every match of the reference/abbreviation patterns.
pub fn strip_noise(x: &str, patterns: &[Regex], chars: &[char]) -> String {
    let mut s: String = x.chars().filter(|c| !chars.contains(c)).collect();
    for pattern in patterns {
        if let std::borrow::Cow::Owned(replaced) = pattern.replace_all(&s, "") {
            s = replaced;
        }
    }
    s
}

pub fn collapse_whitespace(x: &str) -> String {
    static WHITESPACE: OnceCell<Regex> = OnceCell::new();
    let whitespace = WHITESPACE.get_or_init(|| Regex::new(r"\s+").unwrap());

    whitespace.replace_all(x, " ").into_owned()
}

pub fn retain_allowed(x: &str, alphabet: Alphabet) -> String {
    let mut s = x.to_string();
    s.retain(|c| alphabet.allows(c));
    s
}

/// Makes sure every sentence end is followed by a space. Runs of terminal punctuation (`?!`,
/// `...`) are kept together and a full stop between two digits is left alone so decimals aren't
/// split apart.
pub fn space_after_terminals(x: &str) -> String {
    let chars = x.chars().collect::<Vec<_>>();
    let mut s = String::with_capacity(x.len() + 8);
    for (i, c) in chars.iter().copied().enumerate() {
        s.push(c);
        if !is_terminal(c) {
            continue;
        }
        match chars.get(i + 1) {
            None => {}
            Some(next) if next.is_whitespace() || is_terminal(*next) => {}
            Some(next)
                if c == '.'
                    && next.is_ascii_digit()
                    && i > 0
                    && chars[i - 1].is_ascii_digit() => {}
            Some(_) => s.push(' '),
        }
    }
    s
}
