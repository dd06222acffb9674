//! Splitting normalised text into sentences suitable for a TTS corpus. The splitter is a
//! heuristic, any terminal punctuation followed by whitespace is a boundary. Abbreviations need to
//! be removed by the normaliser beforehand or they'll end a sentence early.
use crate::config::NormaliserConfig;
use crate::text_normaliser::{is_terminal, ALLOWED_PUNCTUATION};
use once_cell::sync::OnceCell;
use regex::Regex;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Sentence {
    pub text: String,
    /// Length in characters (not bytes)
    pub length: usize,
    /// File the sentence was taken from
    pub source_id: String,
}

impl Sentence {
    pub fn new(text: impl Into<String>, source_id: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            length: text.chars().count(),
            text,
            source_id: source_id.into(),
        }
    }
}

/// Splits after every run of terminal punctuation that's followed by whitespace. The punctuation
/// stays at the end of the sentence it closes.
pub fn split_sentences(x: &str) -> Vec<&str> {
    static BOUNDARY: OnceCell<Regex> = OnceCell::new();
    let boundary = BOUNDARY.get_or_init(|| Regex::new(r"[.!?]\s+").unwrap());

    let mut res = vec![];
    let mut last = 0;
    for m in boundary.find_iter(x) {
        let end = m.start() + 1;
        if !x[last..end].trim().is_empty() {
            res.push(&x[last..end]);
        }
        last = m.end();
    }
    if !x[last..].trim().is_empty() {
        res.push(&x[last..]);
    }
    res
}

/// Removes spaces and punctuation left dangling at the start of a sentence, e.g. the `, ` left
/// behind when a reference was deleted.
pub fn strip_stray(x: &str) -> &str {
    x.trim_start_matches(|c: char| c.is_whitespace() || ALLOWED_PUNCTUATION.contains(&c))
        .trim_end()
}

/// An orphan is a line with only one to three letters on it, optionally closed by terminal
/// punctuation. These come out of bad splits and mean nothing on their own.
pub fn is_orphan(x: &str) -> bool {
    let letters = x.trim_end_matches(is_terminal);
    let count = letters.chars().count();
    (1..=3).contains(&count) && letters.chars().all(char::is_alphabetic)
}

/// Appends every orphan line onto the line before it. An orphan with nothing before it is left
/// alone.
pub fn merge_orphans(lines: Vec<String>) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(lines.len());
    for line in lines {
        match merged.last_mut() {
            Some(prev) if is_orphan(&line) => {
                prev.push(' ');
                prev.push_str(&line);
            }
            _ => merged.push(line),
        }
    }
    merged
}

/// Breaks a long sentence into lines of at most `max_len` characters at word boundaries. A line
/// is never left holding a single word because of a split, so a very long word can still exceed
/// the limit.
pub fn split_at_word_boundaries(x: &str, max_len: usize) -> Vec<String> {
    let mut lines = vec![];
    let mut current: Vec<&str> = vec![];
    let mut current_len = 0;

    for word in x.split_whitespace() {
        let word_len = word.chars().count();
        // Spaces between the words already on the line plus the one before this word
        if current_len + current.len() + word_len > max_len && current.len() > 1 {
            lines.push(current.join(" "));
            current.clear();
            current_len = 0;
        }
        current.push(word);
        current_len += word_len;
    }
    if !current.is_empty() {
        lines.push(current.join(" "));
    }
    lines
}

/// Turns normalised text into sentences within the length bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segmenter {
    pub min_len: usize,
    pub max_len: usize,
    /// Split over-long sentences at word boundaries rather than dropping them
    pub split_long: bool,
}

impl Segmenter {
    pub fn new(config: &NormaliserConfig) -> Self {
        Self {
            min_len: config.min_len,
            max_len: config.max_len,
            split_long: config.split_long_sentences,
        }
    }

    pub fn in_bounds(&self, length: usize) -> bool {
        (self.min_len..=self.max_len).contains(&length)
    }

    pub fn segment(&self, normalised: &str, source_id: &str) -> Vec<Sentence> {
        let mut lines = vec![];
        for raw in split_sentences(normalised) {
            let sentence = strip_stray(raw);
            if sentence.is_empty() {
                continue;
            }
            if self.split_long && sentence.chars().count() > self.max_len {
                lines.extend(split_at_word_boundaries(sentence, self.max_len));
            } else {
                lines.push(sentence.to_string());
            }
        }

        let lines = merge_orphans(lines);
        let total = lines.len();
        let sentences = lines
            .into_iter()
            .map(|x| Sentence::new(x, source_id))
            .filter(|x| self.in_bounds(x.length))
            .collect::<Vec<_>>();
        if sentences.len() < total {
            debug!(
                "{}: dropped {} of {} sentences outside {}..={} characters",
                source_id,
                total - sentences.len(),
                total,
                self.min_len,
                self.max_len
            );
        }
        sentences
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segmenter(min_len: usize, max_len: usize) -> Segmenter {
        Segmenter {
            min_len,
            max_len,
            split_long: false,
        }
    }

    fn texts(sentences: &[Sentence]) -> Vec<&str> {
        sentences.iter().map(|x| x.text.as_str()).collect()
    }

    #[test]
    fn punctuation_stays_attached() {
        assert_eq!(
            split_sentences("Той отиде на пазара. Тя купи ябълки!"),
            vec!["Той отиде на пазара.", "Тя купи ябълки!"]
        );
        assert_eq!(
            split_sentences("Наистина ли?! Да... Добре"),
            vec!["Наистина ли?!", "Да...", "Добре"]
        );
        assert_eq!(split_sentences("  "), Vec::<&str>::new());
    }

    #[test]
    fn segments_example() {
        let sentences = segmenter(10, 150).segment("Той отиде на пазара. Тя купи ябълки!", "a.txt");
        assert_eq!(texts(&sentences), vec!["Той отиде на пазара.", "Тя купи ябълки!"]);
        assert_eq!(sentences[0].length, 20);
        assert_eq!(sentences[1].source_id, "a.txt");
    }

    #[test]
    fn drops_rather_than_truncates() {
        let long = format!("{}.", "дълго ".repeat(30).trim());
        let text = format!("Кратко. {} Това е нормално изречение.", long);
        let sentences = segmenter(10, 150).segment(&text, "x");
        assert_eq!(texts(&sentences), vec!["Това е нормално изречение."]);
        for s in &sentences {
            assert!((10..=150).contains(&s.length));
        }
    }

    #[test]
    fn strips_leading_punctuation() {
        assert_eq!(strip_stray(" , - Начало на изречение. "), "Начало на изречение.");
        let sentences = segmenter(5, 150).segment("Първо. , - второ изречение.", "x");
        assert_eq!(texts(&sentences), vec!["Първо.", "второ изречение."]);
    }

    #[test]
    fn orphans_are_merged() {
        assert!(is_orphan("Да."));
        assert!(is_orphan("и"));
        assert!(!is_orphan("Край."));
        assert!(!is_orphan("12."));
        assert!(!is_orphan("."));

        let merged = merge_orphans(vec![
            "Той каза нещо.".to_string(),
            "Да.".to_string(),
            "Не".to_string(),
            "Следващо изречение.".to_string(),
        ]);
        assert_eq!(merged, vec!["Той каза нещо. Да. Не", "Следващо изречение."]);

        let sentences = segmenter(10, 150).segment("Той каза нещо. Да. Край на главата.", "x");
        assert_eq!(texts(&sentences), vec!["Той каза нещо. Да.", "Край на главата."]);
    }

    #[test]
    fn word_boundary_splitting() {
        let lines = split_at_word_boundaries("аа бб вв гг дд", 5);
        assert_eq!(lines, vec!["аа бб", "вв гг", "дд"]);
        for line in &lines {
            assert!(line.chars().count() <= 5);
        }
        // A lone word is never split off
        let lines = split_at_word_boundaries("дългадума кратка", 5);
        assert_eq!(lines, vec!["дългадума кратка"]);

        let splitting = Segmenter {
            min_len: 3,
            max_len: 12,
            split_long: true,
        };
        let sentences = splitting.segment("едно две три четири пет шест.", "x");
        assert_eq!(texts(&sentences), vec!["едно две три", "четири пет", "шест."]);
    }
}
