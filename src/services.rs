//! The external services jobs are dispatched to. Speech synthesis and sentence generation are
//! both hosted APIs, here they're traits so the dispatcher can be driven by anything: the
//! binaries use `CommandService` which hands each request to a user supplied program, tests use
//! in-memory mocks.
use once_cell::sync::OnceCell;
use regex::Regex;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::debug;

/// Failure of a single request to an external service.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum JobError {
    /// The service is throttling us, worth retrying after a wait
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    /// Something that may go away on its own (timeouts, overloaded upstream). Treated like a rate
    /// limit by the dispatcher.
    #[error("transient service error: {0}")]
    Transient(String),
    /// Retrying won't help
    #[error("{0}")]
    Fatal(String),
}

impl JobError {
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Classifies an error message from a service that only reports errors as text. Messages
    /// mentioning rate limits become `RateLimited` with the wait parsed out of "try again in
    /// 1.5s" style hints, obviously transient messages become `Transient`, the rest are fatal.
    pub fn from_message(message: &str) -> Self {
        static RETRY_IN: OnceCell<Regex> = OnceCell::new();
        let retry_in = RETRY_IN.get_or_init(|| {
            Regex::new(r"(?i)try again in ([0-9]+(?:\.[0-9]+)?)\s*(ms|s)\b").unwrap()
        });

        let lower = message.to_lowercase();
        if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
        {
            let retry_after = retry_in.captures(message).and_then(|caps| {
                let value = caps[1].parse::<f64>().ok()?;
                let secs = if caps[2].eq_ignore_ascii_case("ms") {
                    value / 1000.0
                } else {
                    value
                };
                Duration::try_from_secs_f64(secs).ok()
            });
            Self::RateLimited { retry_after }
        } else if [
            "timed out",
            "timeout",
            "temporarily unavailable",
            "503",
            "connection reset",
        ]
        .iter()
        .any(|x| lower.contains(x))
        {
            Self::Transient(message.trim().to_string())
        } else {
            Self::Fatal(message.trim().to_string())
        }
    }
}

/// Turns text into audio, the returned bytes are written to disk as-is.
pub trait SpeechSynthesiser: Send + Sync {
    fn synthesise(&self, text: &str) -> Result<Vec<u8>, JobError>;
}

/// Asks a language model to respond to a prompt.
pub trait SentenceGenerator: Send + Sync {
    fn generate(&self, prompt: &str) -> Result<String, JobError>;
}

/// Runs a program once per request. The request text goes to stdin and the response is read from
/// stdout. A non-zero exit code is a failure and stderr is classified with
/// `JobError::from_message`.
#[derive(Debug, Clone)]
pub struct CommandService {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandService {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn run(&self, input: &str) -> Result<Vec<u8>, JobError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                JobError::Fatal(format!("Failed to start {}: {}", self.program.display(), e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            match stdin.write_all(input.as_bytes()) {
                // The program exited without reading its input, its exit status says what happened
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
                Err(e) => {
                    return Err(JobError::Transient(format!("Failed to write request: {}", e)))
                }
                Ok(()) => {}
            }
        }
        let output = child
            .wait_with_output()
            .map_err(|e| JobError::Transient(format!("Failed to read response: {}", e)))?;

        if output.status.success() {
            debug!("{} returned {} bytes", self.program.display(), output.stdout.len());
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!("{} exited with {}", self.program.display(), output.status)
            } else {
                stderr.into_owned()
            };
            Err(JobError::from_message(&message))
        }
    }
}

impl SpeechSynthesiser for CommandService {
    fn synthesise(&self, text: &str) -> Result<Vec<u8>, JobError> {
        let audio = self.run(text)?;
        if audio.is_empty() {
            return Err(JobError::Fatal("Service returned no audio".to_string()));
        }
        Ok(audio)
    }
}

impl SentenceGenerator for CommandService {
    fn generate(&self, prompt: &str) -> Result<String, JobError> {
        let out = self.run(prompt)?;
        let text = String::from_utf8(out)
            .map_err(|e| JobError::Fatal(format!("Response isn't valid UTF-8: {}", e)))?;
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_retry_hint() {
        let e = JobError::from_message(
            "Error code: 429 - Rate limit reached for gpt-4o-mini. Please try again in 1.5s.",
        );
        assert_eq!(
            e,
            JobError::RateLimited {
                retry_after: Some(Duration::from_millis(1500))
            }
        );
        assert_eq!(e.retry_after(), Some(Duration::from_millis(1500)));

        let e = JobError::from_message("rate limit exceeded, try again in 250ms");
        assert_eq!(e.retry_after(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn rate_limit_without_hint() {
        let e = JobError::from_message("Too Many Requests");
        assert_eq!(e, JobError::RateLimited { retry_after: None });
        assert!(e.is_recoverable());
    }

    #[test]
    fn classifies_other_errors() {
        let e = JobError::from_message("upstream request timed out\n");
        assert_eq!(e, JobError::Transient("upstream request timed out".to_string()));
        assert!(e.is_recoverable());
        assert_eq!(e.retry_after(), None);

        let e = JobError::from_message("Invalid API key provided");
        assert_eq!(e, JobError::Fatal("Invalid API key provided".to_string()));
        assert!(!e.is_recoverable());
    }

    #[cfg(unix)]
    #[test]
    fn command_round_trip() {
        let service = CommandService::new("cat", vec![]);
        assert_eq!(service.generate("  Здравей, свят!\n").unwrap(), "Здравей, свят!");
        assert_eq!(service.synthesise("аудио").unwrap(), "аудио".as_bytes());

        let failing = CommandService::new(
            "sh",
            vec![
                "-c".to_string(),
                "echo 'Rate limit reached. Please try again in 2s.' >&2; exit 1".to_string(),
            ],
        );
        assert_eq!(
            failing.generate("x"),
            Err(JobError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            })
        );

        let missing = CommandService::new("/definitely/not/a/program", vec![]);
        assert!(matches!(missing.generate("x"), Err(JobError::Fatal(_))));
    }
}
