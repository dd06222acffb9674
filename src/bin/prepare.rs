use bg_tts::training::*;
use bg_tts::Config;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Parser, Debug)]
pub struct Args {
    /// TOML config file, defaults are used for anything it doesn't set
    #[clap(long, short, global = true)]
    config: Option<PathBuf>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Cleans extracted texts into per-file corpora and one combined corpus
    Clean {
        /// Directory of extracted `.txt` files
        #[clap(long, default_value = "extracted_texts")]
        input: PathBuf,
        /// Where the `_clean.txt` files are written
        #[clap(long, default_value = "processed_texts")]
        output: PathBuf,
        /// Combined corpus, one sentence per line
        #[clap(long, default_value = "data/sentences.txt")]
        combined: PathBuf,
        /// Number of generated sentences with numbers to append to the combined corpus
        #[clap(long, default_value_t = 0)]
        fillers: usize,
        #[clap(long)]
        seed: Option<u64>,
        #[clap(long)]
        min_len: Option<usize>,
        #[clap(long)]
        max_len: Option<usize>,
        /// Split over-long sentences at word boundaries instead of dropping them
        #[clap(long)]
        split_long: bool,
    },
    /// Reports the characters and sentence lengths in a metadata file or corpus
    Inventory {
        /// Metadata file, the sentence column is analysed
        #[clap(long, conflicts_with = "corpus", required_unless_present = "corpus")]
        meta_file: Option<PathBuf>,
        /// Corpus file with one sentence per line
        #[clap(long)]
        corpus: Option<PathBuf>,
        #[clap(long, default_value = "analysis.json")]
        output: PathBuf,
    },
    /// Lists dictionary words that never appear in the corpus
    MissingWords {
        /// Word list with one word per line, or an SQL dump with `--sql`. Repeat to combine
        /// several dictionaries.
        #[clap(long, required = true)]
        dictionary: Vec<PathBuf>,
        #[clap(long)]
        sql: bool,
        #[clap(long, default_value = "data/sentences.txt")]
        corpus: PathBuf,
        #[clap(long, default_value = "missing_words.txt")]
        output: PathBuf,
    },
    /// Adds a speaker column to a legacy `path|sentence` metadata file
    UpgradeMetadata {
        input: PathBuf,
        output: PathBuf,
        #[clap(long, default_value = "|")]
        input_delimiter: char,
        /// Speaker id, defaults to the one in the config
        #[clap(long)]
        speaker: Option<String>,
    },
    /// Removes the lines of failed jobs from a generated sentence file
    StripFailed {
        input: PathBuf,
        output: PathBuf,
        /// Remove every failure, not just jobs that ran out of retries
        #[clap(long)]
        all_errors: bool,
    },
}

fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
        _ => Ok(()),
    }
}

fn main() -> anyhow::Result<()> {
    bg_tts::setup_logging();
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;

    match args.command {
        Command::Clean {
            input,
            output,
            combined,
            fillers,
            seed,
            min_len,
            max_len,
            split_long,
        } => {
            if let Some(min_len) = min_len {
                config.normaliser.min_len = min_len;
            }
            if let Some(max_len) = max_len {
                config.normaliser.max_len = max_len;
            }
            config.normaliser.split_long_sentences |= split_long;
            config.validate()?;

            let pipeline = CorpusPipeline::new(&config.normaliser)?;
            let summary = clean_directory(&pipeline, &input, &output)?;
            if !summary.skipped.is_empty() {
                warn!("{} files were skipped", summary.skipped.len());
            }

            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let fillers = numeric_sentences(fillers, &mut rng);
            create_parent(&combined)?;
            let lines = write_combined(&combined, &summary, &fillers)?;
            info!(
                "Processing complete! {} sentences from {} files and {} fillers saved to {}",
                summary.sentence_count(),
                summary.documents.len(),
                fillers.len(),
                combined.display()
            );
            debug_assert_eq!(lines, summary.sentence_count() + fillers.len());
        }
        Command::Inventory {
            meta_file,
            corpus,
            output,
        } => {
            let sentences: Vec<String> = match (meta_file, corpus) {
                (Some(meta_file), _) => {
                    let dataset = Dataset::load(&meta_file, &(&config.metadata).into())?;
                    let pipeline = CorpusPipeline::new(&config.normaliser)?;
                    if !dataset.validate(pipeline.normaliser()) {
                        warn!("{} has problems, see above", meta_file.display());
                    }
                    dataset.entries.into_iter().map(|x| x.sentence).collect()
                }
                (None, Some(corpus)) => fs::read_to_string(&corpus)?
                    .lines()
                    .map(str::to_string)
                    .collect(),
                (None, None) => anyhow::bail!("Either --meta-file or --corpus is required"),
            };

            let mut analytics = AnalyticsGenerator::new().warn_above(config.normaliser.max_len);
            for sentence in &sentences {
                analytics.push_sentence(sentence);
            }
            let report = analytics.generate_report();

            println!(" > Number of unique characters: {}", report.unique_chars.chars().count());
            println!(" > Unique characters: {}", report.unique_chars);
            println!(" > Unique lower characters: {}", report.lower_chars);
            println!(
                " > Unique all forced to lower characters: {}",
                report.forced_lower_chars
            );

            let report = serde_json::to_string_pretty(&report)?;
            fs::write(&output, report)?;
        }
        Command::MissingWords {
            dictionary,
            sql,
            corpus,
            output,
        } => {
            let mut words = WordList::default();
            for dictionary in &dictionary {
                info!("Extracting words from {}", dictionary.display());
                let list = if sql {
                    WordList::from_sql_dump(File::open(dictionary)?)?
                } else {
                    WordList::open(dictionary)?
                };
                words.merge(list);
            }
            info!("Extracted {} words", words.len());

            let corpus_words = corpus_words(BufReader::new(File::open(&corpus)?))?;
            info!("Corpus contains {} unique words", corpus_words.len());

            let missing = words.missing_from(&corpus_words);
            info!("Found {} words missing in the corpus", missing.len());
            create_parent(&output)?;
            write_lines(&output, missing)?;
            info!("Missing words have been saved to {}", output.display());
        }
        Command::UpgradeMetadata {
            input,
            output,
            input_delimiter,
            speaker,
        } => {
            if !input_delimiter.is_ascii() {
                anyhow::bail!("Delimiter must be a single ASCII character");
            }
            let input_format = MetadataFormat {
                delimiter: input_delimiter as u8,
                ..MetadataFormat::legacy()
            };
            let speaker = speaker.unwrap_or_else(|| config.metadata.speaker.clone());
            let count = add_speaker_column(
                &input,
                &input_format,
                &output,
                (&config.metadata).into(),
                &speaker,
            )?;
            info!("Wrote {} rows to {}", count, output.display());
        }
        Command::StripFailed {
            input,
            output,
            all_errors,
        } => {
            let reader = BufReader::new(File::open(&input)?);
            let writer = BufWriter::new(File::create(&output)?);
            let removed = bg_tts::generation::strip_failed(reader, writer, all_errors)?;
            info!(
                "Removed {} failed lines, cleaned data has been saved to {}",
                removed,
                output.display()
            );
        }
    }
    Ok(())
}
