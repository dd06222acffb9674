//! Turns a directory of extracted book texts into a sentence corpus. Each document is cleaned on
//! its own (there's no state shared between documents) so they're spread over a few threads, one
//! cleaned file is written per input and then everything is concatenated into a single corpus
//! file along with some generated sentences to get numbers into the training data.
use crate::config::NormaliserConfig;
use crate::sentences::{Segmenter, Sentence};
use crate::text_normaliser::Normaliser;
use anyhow::Context;
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, info, warn};

#[derive(thiserror::Error, Debug)]
pub enum CorpusError {
    #[error("Malformed input {}: {source}", .path.display())]
    MalformedInput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Failed to write {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Text of a single source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument {
    pub source_id: String,
    pub content: String,
}

impl RawDocument {
    pub fn new(source_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            content: content.into(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, CorpusError> {
        let content = fs::read_to_string(path).map_err(|source| CorpusError::MalformedInput {
            path: path.to_path_buf(),
            source,
        })?;
        let source_id = path
            .file_name()
            .map(|x| x.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self::new(source_id, content))
    }
}

/// Normaliser and segmenter configured together.
#[derive(Debug, Clone)]
pub struct CorpusPipeline {
    normaliser: Normaliser,
    segmenter: Segmenter,
}

impl CorpusPipeline {
    pub fn new(config: &NormaliserConfig) -> anyhow::Result<Self> {
        Ok(Self {
            normaliser: Normaliser::new(config)?,
            segmenter: Segmenter::new(config),
        })
    }

    pub fn normaliser(&self) -> &Normaliser {
        &self.normaliser
    }

    pub fn segmenter(&self) -> &Segmenter {
        &self.segmenter
    }

    pub fn process_text(&self, text: &str, source_id: &str) -> Vec<Sentence> {
        let normalised = self.normaliser.normalise(text);
        self.segmenter.segment(&normalised, source_id)
    }

    pub fn process(&self, document: &RawDocument) -> Vec<Sentence> {
        self.process_text(&document.content, &document.source_id)
    }
}

#[derive(Debug, Clone)]
pub struct CleanedDocument {
    pub source_id: String,
    /// Where the cleaned sentences were written
    pub output: PathBuf,
    pub sentences: Vec<Sentence>,
}

#[derive(Debug, Default)]
pub struct CleanSummary {
    /// Cleaned documents in file name order
    pub documents: Vec<CleanedDocument>,
    /// Inputs that couldn't be processed
    pub skipped: Vec<PathBuf>,
}

impl CleanSummary {
    pub fn sentence_count(&self) -> usize {
        self.documents.iter().map(|x| x.sentences.len()).sum()
    }

    pub fn sentences(&self) -> impl Iterator<Item = &Sentence> {
        self.documents.iter().flat_map(|x| x.sentences.iter())
    }
}

/// Name of the cleaned output for an input file, `book.txt` becomes `book_clean.txt`.
pub fn cleaned_file_name(input: &Path) -> String {
    let stem = input
        .file_stem()
        .map(|x| x.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("{}_clean.txt", stem)
}

/// Writes one line per item, every line newline terminated.
pub fn write_lines<'a>(path: &Path, lines: impl IntoIterator<Item = &'a str>) -> io::Result<usize> {
    let mut writer = BufWriter::new(File::create(path)?);
    let mut count = 0;
    for line in lines {
        writeln!(writer, "{}", line)?;
        count += 1;
    }
    writer.flush()?;
    Ok(count)
}

fn clean_file(
    pipeline: &CorpusPipeline,
    input: &Path,
    output_dir: &Path,
) -> Result<CleanedDocument, CorpusError> {
    let document = RawDocument::load(input)?;
    let sentences = pipeline.process(&document);
    let output = output_dir.join(cleaned_file_name(input));
    write_lines(&output, sentences.iter().map(|x| x.text.as_str())).map_err(|source| {
        CorpusError::Write {
            path: output.clone(),
            source,
        }
    })?;
    Ok(CleanedDocument {
        source_id: document.source_id,
        output,
        sentences,
    })
}

/// Cleans every `.txt` file in `input_dir` into `output_dir`. Inputs that can't be read or
/// written are logged and skipped, only a missing input directory or an output directory that
/// can't be created fails the whole batch.
pub fn clean_directory(
    pipeline: &CorpusPipeline,
    input_dir: &Path,
    output_dir: &Path,
) -> anyhow::Result<CleanSummary> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create output directory {}", output_dir.display()))?;

    let mut inputs = fs::read_dir(input_dir)
        .with_context(|| format!("Failed to read input directory {}", input_dir.display()))?
        .filter_map(|entry| entry.ok().map(|x| x.path()))
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "txt"))
        .collect::<Vec<_>>();
    inputs.sort();

    let threads = thread::available_parallelism()
        .map(|x| x.get())
        .unwrap_or(1)
        .clamp(1, inputs.len().max(1));
    info!("Cleaning {} files with {} threads", inputs.len(), threads);

    let next = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel();
    let mut results = BTreeMap::new();
    thread::scope(|s| {
        for _ in 0..threads {
            let tx = tx.clone();
            let next = &next;
            let inputs = &inputs;
            s.spawn(move || loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                let Some(input) = inputs.get(i) else {
                    break;
                };
                let _ = tx.send((i, clean_file(pipeline, input, output_dir)));
            });
        }
        drop(tx);
        for (i, result) in rx {
            results.insert(i, result);
        }
    });

    let mut summary = CleanSummary::default();
    for (i, result) in results {
        match result {
            Ok(document) => {
                info!(
                    "Processed {} -> {} ({} sentences)",
                    document.source_id,
                    document.output.display(),
                    document.sentences.len()
                );
                summary.documents.push(document);
            }
            Err(e) => {
                warn!("Skipping input: {}", e);
                summary.skipped.push(inputs[i].clone());
            }
        }
    }
    Ok(summary)
}

/// Writes every cleaned sentence followed by the filler sentences into one corpus file.
pub fn write_combined(path: &Path, summary: &CleanSummary, fillers: &[String]) -> io::Result<usize> {
    let count = write_lines(
        path,
        summary
            .sentences()
            .map(|x| x.text.as_str())
            .chain(fillers.iter().map(|x| x.as_str())),
    )?;
    debug!("Wrote {} lines to {}", count, path.display());
    Ok(count)
}

const MONTHS: &[&str] = &[
    "януари",
    "февруари",
    "март",
    "април",
    "май",
    "юни",
    "юли",
    "август",
    "септември",
    "октомври",
    "ноември",
    "декември",
];

const NUMERIC_TEMPLATES: &[&str] = &[
    "Цената на билета е {n} лева.",
    "В залата имаше {n} души.",
    "Влакът тръгва в {h} часа и {m} минути.",
    "Това се случи през {y} година.",
    "Книгата има {n} страници.",
    "Температурата навън е {t} градуса.",
    "Разстоянието до града е {n} километра.",
    "Тя е родена на {d} {month} {y} година.",
    "Мачът завърши {s} на {s2}.",
    "Курсът на еврото е {c} лева.",
    "Сградата е висока {n} метра и има {f} етажа.",
];

fn fill_template(template: &str, rng: &mut impl Rng) -> String {
    let mut s = template.to_string();
    let month = MONTHS.choose(rng).copied().unwrap_or("януари");
    let replacements = [
        ("{n}", rng.gen_range(2..=9999).to_string()),
        ("{h}", rng.gen_range(0..=23).to_string()),
        ("{m}", rng.gen_range(2..=59).to_string()),
        ("{y}", rng.gen_range(1800..=2024).to_string()),
        ("{d}", rng.gen_range(1..=28).to_string()),
        ("{t}", rng.gen_range(-20..=40).to_string()),
        ("{s}", rng.gen_range(0..=9).to_string()),
        ("{s2}", rng.gen_range(0..=9).to_string()),
        ("{f}", rng.gen_range(2..=60).to_string()),
        (
            "{c}",
            format!("{},{:02}", rng.gen_range(0..=3), rng.gen_range(0..=99)),
        ),
        ("{month}", month.to_string()),
    ];
    for (placeholder, value) in replacements {
        s = s.replace(placeholder, &value);
    }
    s
}

/// Templated sentences full of numbers, years and dates so the model sees digits in context.
pub fn numeric_sentences(count: usize, rng: &mut impl Rng) -> Vec<String> {
    let mut sentences = Vec::with_capacity(count);
    for _ in 0..count {
        if let Some(template) = NUMERIC_TEMPLATES.choose(rng) {
            sentences.push(fill_template(template, rng));
        }
    }
    sentences
}
