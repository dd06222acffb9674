//! Sentence generation from a dictionary. Each job picks a handful of random words and asks a
//! language model for one short Bulgarian sentence using all of them. The sentences are written
//! one per line in job order, a job that failed writes its error in place of the sentence so line
//! numbers still line up with job ids. `strip_failed` removes those lines afterwards.
use crate::dispatch::{Clock, DispatchReport, Dispatcher, Job, JobFailure};
use crate::services::SentenceGenerator;
use crate::text_normaliser::collapse_whitespace;
use crate::training::WordList;
use rand::seq::SliceRandom;
use rand::Rng;
use std::fs::File;
use std::io::{self, prelude::*, BufWriter};
use std::path::Path;
use tracing::info;

pub const DEFAULT_WORDS_PER_PROMPT: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationJob {
    pub words: Vec<String>,
}

impl GenerationJob {
    pub fn prompt(&self) -> String {
        build_prompt(&self.words)
    }
}

pub fn build_prompt(words: &[String]) -> String {
    format!(
        "Напиши едно кратко изречение на български език, в което се използват следните думи:\n\
        {}\n\nМоля, включи всички изброени думи в изречението.",
        words.join(", ")
    )
}

/// Draws `count` jobs, each with `words_per_prompt` distinct words from the dictionary.
pub fn sample_jobs(
    dictionary: &WordList,
    count: usize,
    words_per_prompt: usize,
    rng: &mut impl Rng,
) -> anyhow::Result<Vec<Job<GenerationJob>>> {
    if words_per_prompt == 0 || dictionary.len() < words_per_prompt {
        anyhow::bail!(
            "Need at least {} words to build a prompt, dictionary has {}",
            words_per_prompt.max(1),
            dictionary.len()
        );
    }
    let mut jobs = Vec::with_capacity(count);
    for id in 0..count {
        let words = dictionary
            .as_slice()
            .choose_multiple(rng, words_per_prompt)
            .cloned()
            .collect();
        jobs.push(Job::new(id, GenerationJob { words }));
    }
    Ok(jobs)
}

pub fn generate_sentences<C: Clock, G: SentenceGenerator>(
    dispatcher: &Dispatcher<C>,
    generator: &G,
    jobs: Vec<Job<GenerationJob>>,
) -> DispatchReport<GenerationJob, String> {
    let report = dispatcher.run(jobs, |job: &GenerationJob| {
        let sentence = generator.generate(&job.prompt())?;
        // Models like to add line breaks, the output has to stay one sentence per line
        Ok(collapse_whitespace(sentence.trim()))
    });
    for outcome in &report.outcomes {
        if let Ok(sentence) = &outcome.result {
            info!("Sample {}: {:?} => {}", outcome.id, outcome.payload.words, sentence);
        }
    }
    report
}

/// Writes one line per job in job order, failed jobs get their error text. Errors often carry a
/// service's multi-line stderr, it's folded onto one line so line `n` is always job `n`.
pub fn write_sentences(
    path: &Path,
    report: &DispatchReport<GenerationJob, String>,
) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    for outcome in &report.outcomes {
        match &outcome.result {
            Ok(sentence) => writeln!(writer, "{}", sentence)?,
            Err(e) => writeln!(writer, "{}", collapse_whitespace(e.to_string().trim()))?,
        }
    }
    writer.flush()
}

/// Copies `reader` to `writer` without the lines left by failed jobs. By default only jobs that
/// ran out of retries are dropped, `all_errors` removes every failure. Returns the number of lines
/// removed.
pub fn strip_failed(reader: impl BufRead, mut writer: impl Write, all_errors: bool) -> io::Result<usize> {
    let exceeded = JobFailure::ExceededRetries(0).to_string();
    let exceeded_prefix = exceeded
        .split_once(" after ")
        .map(|(prefix, _)| prefix)
        .unwrap_or(exceeded.as_str());
    let error_prefix = "Error: ";

    let mut removed = 0;
    for line in reader.lines() {
        let line = line?;
        let failed = if all_errors {
            line.starts_with(error_prefix)
        } else {
            line.starts_with(exceeded_prefix)
        };
        if failed {
            removed += 1;
        } else {
            writeln!(writer, "{}", line)?;
        }
    }
    writer.flush()?;
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{DispatcherSettings, RateWindow};
    use crate::services::JobError;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    struct EchoModel;

    impl SentenceGenerator for EchoModel {
        fn generate(&self, prompt: &str) -> Result<String, JobError> {
            let words = prompt.lines().nth(1).unwrap_or_default();
            if words.contains("грешка") {
                return Err(JobError::Fatal("content filtered".to_string()));
            }
            Ok(format!("  {}.\n", words.replace(", ", " ")))
        }
    }

    fn dictionary() -> WordList {
        WordList::from_reader(io::Cursor::new("слънце\nморе\nпясък\nвятър\nлодка\nчайка\nгрешка")).unwrap()
    }

    #[test]
    fn prompt_lists_words() {
        let prompt = build_prompt(&["котка".to_string(), "мляко".to_string()]);
        assert!(prompt.contains("котка, мляко"));
        assert!(prompt.starts_with("Напиши едно кратко изречение"));
    }

    #[test]
    fn sampled_words_are_distinct() {
        let mut rng = StdRng::seed_from_u64(42);
        let jobs = sample_jobs(&dictionary(), 50, 6, &mut rng).unwrap();
        assert_eq!(jobs.len(), 50);
        for (i, job) in jobs.iter().enumerate() {
            assert_eq!(job.id, i);
            let unique = job.payload.words.iter().collect::<HashSet<_>>();
            assert_eq!(unique.len(), 6);
        }
        assert!(sample_jobs(&dictionary(), 1, 8, &mut rng).is_err());
    }

    #[test]
    fn writes_in_job_order() {
        let dispatcher = Dispatcher::new(
            DispatcherSettings {
                workers: 4,
                max_retries: 3,
                fallback_delay: Duration::ZERO,
            },
            Arc::new(RateWindow::unlimited()),
        );
        let jobs = vec![
            Job::new(0, GenerationJob { words: vec!["слънце".into(), "море".into()] }),
            Job::new(1, GenerationJob { words: vec!["грешка".into()] }),
            Job::new(2, GenerationJob { words: vec!["лодка".into(), "чайка".into()] }),
        ];

        let report = generate_sentences(&dispatcher, &EchoModel, jobs);
        assert_eq!(report.completed(), 2);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generated.txt");
        write_sentences(&path, &report).unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "слънце море.\nError: content filtered\nлодка чайка.\n"
        );
    }

    struct NoisyModel;

    impl SentenceGenerator for NoisyModel {
        fn generate(&self, prompt: &str) -> Result<String, JobError> {
            if prompt.contains("грешка") {
                Err(JobError::from_message("Invalid request\nline two of stderr\n"))
            } else {
                Ok("Добро изречение.".to_string())
            }
        }
    }

    #[test]
    fn multi_line_errors_take_one_line() {
        let dispatcher = Dispatcher::new(
            DispatcherSettings {
                workers: 2,
                max_retries: 3,
                fallback_delay: Duration::ZERO,
            },
            Arc::new(RateWindow::unlimited()),
        );
        let jobs = vec![
            Job::new(0, GenerationJob { words: vec!["грешка".into()] }),
            Job::new(1, GenerationJob { words: vec!["море".into()] }),
        ];
        let report = generate_sentences(&dispatcher, &NoisyModel, jobs);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("generated.txt");
        write_sentences(&path, &report).unwrap();
        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(
            written,
            "Error: Invalid request line two of stderr\nДобро изречение.\n"
        );

        let mut out = vec![];
        let removed = strip_failed(written.as_bytes(), &mut out, true).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(String::from_utf8(out).unwrap(), "Добро изречение.\n");
    }

    #[test]
    fn strips_failed_lines() {
        let input = "Първо изречение.\n\
            Error: Rate limit exceeded after 5 retries.\n\
            Error: content filtered\n\
            Последно изречение.\n";

        let mut out = vec![];
        let removed = strip_failed(input.as_bytes(), &mut out, false).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Първо изречение.\nError: content filtered\nПоследно изречение.\n"
        );

        let mut out = vec![];
        let removed = strip_failed(input.as_bytes(), &mut out, true).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "Първо изречение.\nПоследно изречение.\n"
        );
    }
}
