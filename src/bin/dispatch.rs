use bg_tts::dispatch::Dispatcher;
use bg_tts::generation::*;
use bg_tts::services::CommandService;
use bg_tts::synthesis::*;
use bg_tts::training::WordList;
use bg_tts::Config;
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::path::PathBuf;
use std::time::Instant;
use tracing::info;

#[derive(Parser, Debug)]
pub struct Args {
    /// TOML config file, defaults are used for anything it doesn't set
    #[clap(long, short, global = true)]
    config: Option<PathBuf>,
    /// Maximum number of requests in flight
    #[clap(long, global = true)]
    workers: Option<usize>,
    /// Requests allowed per rate limit window, 0 disables the limit
    #[clap(long, global = true)]
    rate_limit: Option<usize>,
    #[clap(long, global = true)]
    max_retries: Option<u32>,
    #[clap(subcommand)]
    command: Command,
}

/// The external program a job talks to. It gets the request on stdin and answers on stdout.
#[derive(clap::Args, Debug)]
struct ServiceArgs {
    #[clap(long)]
    program: PathBuf,
    /// Argument passed to the program, repeat for more than one
    #[clap(long = "arg", allow_hyphen_values = true)]
    args: Vec<String>,
}

impl ServiceArgs {
    fn service(self) -> CommandService {
        CommandService::new(self.program, self.args)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Synthesises one audio file per corpus sentence and appends them to the metadata file
    Synthesise {
        #[clap(long, default_value = "data/sentences.txt")]
        input: PathBuf,
        #[clap(long, default_value = "output_audio")]
        output_dir: PathBuf,
        /// Metadata file name inside the output directory
        #[clap(long, default_value = DEFAULT_METADATA_FILE)]
        metadata_file: String,
        #[clap(flatten)]
        service: ServiceArgs,
    },
    /// Generates sentences that use words from a dictionary
    Generate {
        #[clap(long, default_value = "data/missing_words.txt")]
        words: PathBuf,
        /// Number of sentences to generate
        #[clap(long, default_value_t = 10000)]
        count: usize,
        #[clap(long, default_value_t = DEFAULT_WORDS_PER_PROMPT)]
        words_per_prompt: usize,
        #[clap(long, default_value = "data/generated_sentences.txt")]
        output: PathBuf,
        #[clap(long)]
        seed: Option<u64>,
        #[clap(flatten)]
        service: ServiceArgs,
    },
}

fn main() -> anyhow::Result<()> {
    bg_tts::setup_logging();
    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(workers) = args.workers {
        config.dispatcher.workers = workers;
    }
    if let Some(rate_limit) = args.rate_limit {
        config.dispatcher.rate_limit = rate_limit;
    }
    if let Some(max_retries) = args.max_retries {
        config.dispatcher.max_retries = max_retries;
    }
    config.validate()?;

    let dispatcher = Dispatcher::from_config(&config.dispatcher);
    let start = Instant::now();

    match args.command {
        Command::Synthesise {
            input,
            output_dir,
            metadata_file,
            service,
        } => {
            let sentences = load_sentences(&input)?;
            info!("Loaded {} sentences from {}", sentences.len(), input.display());
            let mut options = SynthesisOptions::new(output_dir, &config.metadata);
            options.metadata_file = metadata_file;

            let summary = synthesise_corpus(&dispatcher, &service.service(), &sentences, &options)?;
            info!(
                "Synthesised {}, skipped {} existing ({} added to metadata), {} failed",
                summary.synthesised, summary.skipped, summary.recovered, summary.failed
            );
        }
        Command::Generate {
            words,
            count,
            words_per_prompt,
            output,
            seed,
            service,
        } => {
            let dictionary = WordList::open(&words)?;
            info!("Loaded {} words from {}", dictionary.len(), words.display());
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            };
            let jobs = sample_jobs(&dictionary, count, words_per_prompt, &mut rng)?;

            let report = generate_sentences(&dispatcher, &service.service(), jobs);
            report.log_summary();
            write_sentences(&output, &report)?;
            info!("Generated sentences saved to {}", output.display());
        }
    }
    info!("Finished in {:.2}s", start.elapsed().as_secs_f32());
    Ok(())
}
