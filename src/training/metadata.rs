//! Reading and writing the metadata file that pairs audio files with their transcripts. The
//! training framework expects `path, sentence, speaker` with a header row, older runs produced a
//! headerless `path|sentence` so the delimiter, header and speaker column are all configurable.
use crate::config::MetadataConfig;
use crate::text_normaliser::Normaliser;
use anyhow::Context;
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use tracing::{error, info};

pub const HEADER: [&str; 3] = ["path", "sentence", "speaker"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataFormat {
    pub delimiter: u8,
    pub header: bool,
    pub speaker_column: bool,
}

impl Default for MetadataFormat {
    fn default() -> Self {
        (&MetadataConfig::default()).into()
    }
}

impl From<&MetadataConfig> for MetadataFormat {
    fn from(config: &MetadataConfig) -> Self {
        Self {
            delimiter: config.delimiter as u8,
            header: config.header,
            speaker_column: config.speaker_column,
        }
    }
}

impl MetadataFormat {
    /// The headerless, pipe separated two column layout of the first synthesis runs
    pub fn legacy() -> Self {
        Self {
            delimiter: b'|',
            header: false,
            speaker_column: false,
        }
    }
}

/// One line of metadata, for a synthesis job this is its result record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    /// Audio file path relative to the metadata file
    pub path: String,
    pub sentence: String,
    pub speaker: Option<String>,
}

impl Entry {
    fn to_record(&self, format: &MetadataFormat) -> Vec<&str> {
        let mut record = vec![self.path.as_str(), self.sentence.as_str()];
        if format.speaker_column {
            record.push(self.speaker.as_deref().unwrap_or_default());
        }
        record
    }
}

pub struct Dataset {
    pub entries: Vec<Entry>,
}

impl Dataset {
    /// Loads a metadata file. Rows without at least a path and a sentence are logged and skipped.
    pub fn load(p: impl AsRef<Path>, format: &MetadataFormat) -> anyhow::Result<Self> {
        let p = p.as_ref();
        let f = File::open(p).with_context(|| format!("Failed to open {}", p.display()))?;
        Self::from_reader(io::BufReader::new(f), format)
    }

    pub fn from_reader(reader: impl io::Read, format: &MetadataFormat) -> anyhow::Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(format.header)
            .delimiter(format.delimiter)
            .flexible(true)
            .from_reader(reader);

        let mut entries = vec![];

        for (i, result) in rdr.records().enumerate() {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    error!("Malformed record {}: {}", i, e);
                    continue;
                }
            };
            match (record.get(0), record.get(1)) {
                (Some(path), Some(sentence)) if !path.trim().is_empty() => {
                    entries.push(Entry {
                        path: path.to_string(),
                        sentence: sentence.to_string(),
                        speaker: record
                            .get(2)
                            .filter(|x| !x.is_empty())
                            .map(|x| x.to_string()),
                    });
                }
                _ => error!("Incomplete record: {:?}", record),
            }
        }
        Ok(Self { entries })
    }

    /// Validates there's nothing wrong with the dataset. Will log any errors it finds and return
    /// false
    pub fn validate(&self, normaliser: &Normaliser) -> bool {
        info!("Validating dataset");
        let mut ids = HashSet::new();
        let mut success = true;
        for entry in &self.entries {
            if entry.sentence.trim().is_empty() {
                error!("Transcript for {} is empty", entry.path);
                success = false;
            } else if normaliser.normalise(&entry.sentence).is_empty() {
                error!(
                    "{} transcript '{}' normalises to an empty string",
                    entry.path, entry.sentence
                );
                success = false;
            }
            if !ids.insert(entry.path.as_str()) {
                error!("Duplicate ID: {}", entry.path);
                success = false;
            }
        }
        info!("Validation complete");
        success
    }
}

/// Appends entries to a metadata file, creating it (with a header if the format has one) when it
/// doesn't exist yet.
pub struct MetadataWriter {
    writer: csv::Writer<File>,
    format: MetadataFormat,
}

impl MetadataWriter {
    pub fn open_append(p: impl AsRef<Path>, format: MetadataFormat) -> anyhow::Result<Self> {
        let p = p.as_ref();
        let is_new = !p.exists() || p.metadata().map(|x| x.len() == 0).unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(p)
            .with_context(|| format!("Failed to open {} for appending", p.display()))?;
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .delimiter(format.delimiter)
            .from_writer(file);
        if is_new && format.header {
            if format.speaker_column {
                writer.write_record(HEADER)?;
            } else {
                writer.write_record(&HEADER[..2])?;
            }
        }
        Ok(Self { writer, format })
    }

    pub fn write(&mut self, entry: &Entry) -> anyhow::Result<()> {
        self.writer.write_record(entry.to_record(&self.format))?;
        Ok(())
    }

    pub fn finish(mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Rewrites a legacy two column metadata file with a speaker column added to every row.
pub fn add_speaker_column(
    input: &Path,
    input_format: &MetadataFormat,
    output: &Path,
    output_format: MetadataFormat,
    speaker: &str,
) -> anyhow::Result<usize> {
    let dataset = Dataset::load(input, input_format)?;
    if output.exists() {
        anyhow::bail!("{} already exists, refusing to overwrite it", output.display());
    }
    let output_format = MetadataFormat {
        speaker_column: true,
        ..output_format
    };
    let mut writer = MetadataWriter::open_append(output, output_format)?;
    for entry in &dataset.entries {
        writer.write(&Entry {
            speaker: Some(speaker.to_string()),
            ..entry.clone()
        })?;
    }
    writer.finish()?;
    Ok(dataset.entries.len())
}
