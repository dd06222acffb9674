//! Bulk speech synthesis of the corpus, one job per sentence.
//!
//! Sentence `n` (counting from 1) is always written to `sentence{n}.wav` in the output directory,
//! so a rerun can tell which sentences are already done just by looking for the file. Existing
//! files are never regenerated and the metadata file is only ever appended to, which makes it
//! safe to restart a run that was killed part way through.
use crate::config::MetadataConfig;
use crate::dispatch::{Clock, Dispatcher, Job};
use crate::services::{JobError, SpeechSynthesiser};
use crate::training::{Dataset, Entry, MetadataFormat, MetadataWriter};
use anyhow::Context;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const DEFAULT_METADATA_FILE: &str = "metadata.csv";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesisJob {
    pub sentence: String,
    pub file_name: String,
}

pub fn audio_file_name(index: usize) -> String {
    format!("sentence{}.wav", index)
}

#[derive(Debug, Clone)]
pub struct SynthesisOptions {
    pub output_dir: PathBuf,
    /// Metadata file name, relative to the output directory
    pub metadata_file: String,
    pub format: MetadataFormat,
    pub speaker: String,
}

impl SynthesisOptions {
    pub fn new(output_dir: impl Into<PathBuf>, metadata: &MetadataConfig) -> Self {
        Self {
            output_dir: output_dir.into(),
            metadata_file: DEFAULT_METADATA_FILE.to_string(),
            format: metadata.into(),
            speaker: metadata.speaker.clone(),
        }
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.output_dir.join(&self.metadata_file)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SynthesisSummary {
    /// Sentences synthesised in this run
    pub synthesised: usize,
    /// Sentences whose audio already existed
    pub skipped: usize,
    /// Existing audio files that were missing from the metadata and got a row added
    pub recovered: usize,
    pub failed: usize,
}

/// Reads the sentences to synthesise, one per line. Blank lines are ignored.
pub fn load_sentences(path: &Path) -> anyhow::Result<Vec<String>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Could not read sentences from {}", path.display()))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(str::to_string)
        .collect())
}

/// Writes next to the destination first so a half written file never looks finished.
fn write_audio(path: &Path, audio: &[u8]) -> io::Result<()> {
    let partial = path.with_extension("wav.part");
    fs::write(&partial, audio)?;
    fs::rename(&partial, path)
}

pub fn synthesise_corpus<C: Clock, S: SpeechSynthesiser>(
    dispatcher: &Dispatcher<C>,
    synthesiser: &S,
    sentences: &[String],
    options: &SynthesisOptions,
) -> anyhow::Result<SynthesisSummary> {
    fs::create_dir_all(&options.output_dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            options.output_dir.display()
        )
    })?;

    let metadata_path = options.metadata_path();
    let recorded: HashSet<String> = if metadata_path.exists() {
        Dataset::load(&metadata_path, &options.format)?
            .entries
            .into_iter()
            .map(|x| x.path)
            .collect()
    } else {
        HashSet::new()
    };

    let entry = |job: &SynthesisJob| Entry {
        path: job.file_name.clone(),
        sentence: job.sentence.clone(),
        speaker: Some(options.speaker.clone()),
    };

    let mut summary = SynthesisSummary::default();
    let mut records = BTreeMap::new();
    let mut jobs = vec![];
    for (i, sentence) in sentences.iter().enumerate() {
        let index = i + 1;
        let job = SynthesisJob {
            sentence: sentence.clone(),
            file_name: audio_file_name(index),
        };
        if options.output_dir.join(&job.file_name).exists() {
            info!("Skipping existing file: {}", job.file_name);
            summary.skipped += 1;
            if !recorded.contains(&job.file_name) {
                records.insert(index, entry(&job));
                summary.recovered += 1;
            }
            continue;
        }
        jobs.push(Job::new(index, job));
    }

    let output_dir = options.output_dir.as_path();
    let report = dispatcher.run(jobs, |job: &SynthesisJob| {
        let audio = synthesiser.synthesise(&job.sentence)?;
        write_audio(&output_dir.join(&job.file_name), &audio)
            .map_err(|e| JobError::Fatal(format!("Failed to write {}: {}", job.file_name, e)))?;
        Ok(())
    });
    report.log_summary();

    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(()) => {
                summary.synthesised += 1;
                records.insert(outcome.id, entry(&outcome.payload));
            }
            Err(e) => {
                summary.failed += 1;
                warn!(
                    "No audio for sentence {} \"{}\": {}",
                    outcome.id, outcome.payload.sentence, e
                );
            }
        }
    }

    let mut writer = MetadataWriter::open_append(&metadata_path, options.format)?;
    for record in records.values() {
        // A row can outlive its audio file if the file was deleted by hand
        if !recorded.contains(&record.path) {
            writer.write(record)?;
        }
    }
    writer.finish()?;
    info!("Metadata file updated: {}", metadata_path.display());

    Ok(summary)
}
