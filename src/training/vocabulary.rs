//! Word lists used to improve the vocabulary coverage of the corpus. Words from a dictionary that
//! never appear in the corpus are fed to sentence generation so the model gets to hear them.
//!
//! Dictionaries come either as a plain list with one word per line or as the SQL dump of a
//! dictionary database, where each word is the first string in a row tuple like
//! `(1234, 'дума', ...)`.
use once_cell::sync::OnceCell;
use regex::Regex;
use std::collections::{BTreeSet, HashSet};
use std::fs;
use std::io::{self, prelude::*};
use std::path::Path;
use unicode_segmentation::UnicodeSegmentation;

/// An ordered, de-duplicated list of words
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WordList {
    words: Vec<String>,
    seen: HashSet<String>,
}

impl WordList {
    /// Opens a word list with one word per line
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = fs::File::open(path)?;
        let reader = io::BufReader::new(file);
        Self::from_reader(reader)
    }

    pub fn from_reader(reader: impl BufRead) -> io::Result<Self> {
        let mut list = Self::default();
        for line in reader.lines() {
            list.push(line?.trim());
        }
        Ok(list)
    }

    /// Extracts the words from a dictionary SQL dump.
    pub fn from_sql_dump(mut reader: impl Read) -> io::Result<Self> {
        static ROW: OnceCell<Regex> = OnceCell::new();
        let row = ROW.get_or_init(|| Regex::new(r"\(\s*\d+\s*,\s*'([^']+)'").unwrap());

        let mut dump = String::new();
        reader.read_to_string(&mut dump)?;
        let mut list = Self::default();
        for caps in row.captures_iter(&dump) {
            list.push(&caps[1]);
        }
        Ok(list)
    }

    /// Adds a word if it isn't empty or already present
    pub fn push(&mut self, word: &str) {
        if !word.is_empty() && !self.seen.contains(word) {
            self.seen.insert(word.to_string());
            self.words.push(word.to_string());
        }
    }

    /// Adds all the words of `other` that we don't have yet
    pub fn merge(&mut self, other: WordList) {
        for word in other.words {
            self.push(&word);
        }
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    pub fn as_slice(&self) -> &[String] {
        &self.words
    }

    /// Words that don't appear in `corpus`, compared case insensitively. Keeps the list order.
    pub fn missing_from(&self, corpus: &BTreeSet<String>) -> Vec<&str> {
        self.words
            .iter()
            .filter(|x| !corpus.contains(&x.to_lowercase()))
            .map(|x| x.as_str())
            .collect()
    }
}

/// Every distinct word in a corpus, lowercased.
pub fn corpus_words(reader: impl BufRead) -> io::Result<BTreeSet<String>> {
    let mut words = BTreeSet::new();
    for line in reader.lines() {
        let line = line?;
        for word in line.unicode_words() {
            words.insert(word.to_lowercase());
        }
    }
    Ok(words)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_dump_words() {
        let dump = "INSERT INTO `word` VALUES (1, 'ябълка', 'noun'),( 2 ,'круша', NULL),\n\
            (3, 'ябълка', 'noun'), ('x', 'не');";
        let list = WordList::from_sql_dump(dump.as_bytes()).unwrap();
        assert_eq!(list.as_slice(), ["ябълка", "круша"]);
    }

    #[test]
    fn word_list_and_merge() {
        let mut base = WordList::from_reader(io::Cursor::new("котка\n\n куче \nкотка\n")).unwrap();
        assert_eq!(base.len(), 2);
        base.merge(WordList::from_reader(io::Cursor::new("куче\nптица")).unwrap());
        assert_eq!(base.as_slice(), ["котка", "куче", "птица"]);
    }

    #[test]
    fn words_missing_from_corpus() {
        let corpus = corpus_words(io::Cursor::new("Котката спи.\nКучето лае, а котката бяга!")).unwrap();
        assert!(corpus.contains("котката"));
        assert!(corpus.contains("а"));

        let list = WordList::from_reader(io::Cursor::new("Котката\nптица\nлае\nсмях")).unwrap();
        assert_eq!(list.missing_from(&corpus), vec!["птица", "смях"]);
    }
}
