//! Runs many independent jobs against a rate limited external service.
//!
//! A fixed pool of worker threads pulls job ids from a shared backlog. Before each request a
//! worker checks in with the `RateWindow`, recoverable failures are retried in place after a
//! back-off and everything else fails the job straight away. Workers report what they're doing
//! over a channel to the calling thread, which owns the per-job state and logs progress in the
//! order jobs finish. Once every job has settled the outcomes are handed back sorted by job id so
//! whatever gets written to disk is in submission order.
//!
//! There's no timeout on a job. A request that never returns ties up its worker forever, the
//! other workers carry on with the rest of the backlog but `run` won't return.
pub mod rate_limit;

pub use rate_limit::*;

use crate::config::DispatcherConfig;
use crate::services::JobError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub type JobId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job<P> {
    /// Position of the job in the submission order
    pub id: JobId,
    pub payload: P,
}

impl<P> Job<P> {
    pub fn new(id: JobId, payload: P) -> Self {
        Self { id, payload }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    InFlight,
    /// Waiting out a back-off before the next attempt
    Retrying,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why a job ended up failed. The `Display` output is what gets written in place of a result for
/// failed jobs so the two cases can be told apart afterwards.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum JobFailure {
    #[error("Error: {0}")]
    Fatal(String),
    #[error("Error: Rate limit exceeded after {0} retries.")]
    ExceededRetries(u32),
}

#[derive(Debug)]
pub struct JobOutcome<P, T> {
    pub id: JobId,
    pub payload: P,
    /// Number of times the service was called for this job
    pub attempts: u32,
    pub result: Result<T, JobFailure>,
}

/// Outcomes of a dispatch run, sorted by job id.
#[derive(Debug)]
pub struct DispatchReport<P, T> {
    pub outcomes: Vec<JobOutcome<P, T>>,
}

impl<P, T> DispatchReport<P, T> {
    pub fn completed(&self) -> usize {
        self.outcomes.iter().filter(|x| x.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.len() - self.completed()
    }

    pub fn exceeded_retries(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|x| matches!(x.result, Err(JobFailure::ExceededRetries(_))))
            .count()
    }

    pub fn log_summary(&self) {
        info!(
            "{} jobs completed, {} failed ({} exceeded retries)",
            self.completed(),
            self.failed(),
            self.exceeded_retries()
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherSettings {
    /// Maximum number of jobs in flight
    pub workers: usize,
    /// Recoverable failures allowed before a job fails
    pub max_retries: u32,
    /// Back-off when the service doesn't say how long to wait
    pub fallback_delay: Duration,
}

impl From<&DispatcherConfig> for DispatcherSettings {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            workers: config.workers,
            max_retries: config.max_retries,
            fallback_delay: config.fallback_delay(),
        }
    }
}

enum Event<T> {
    Started {
        id: JobId,
        attempt: u32,
    },
    Retrying {
        id: JobId,
        failures: u32,
        wait: Duration,
        error: JobError,
    },
    Finished {
        id: JobId,
        attempts: u32,
        result: Result<T, JobFailure>,
    },
}

/// What the collecting thread knows about a job
struct JobContext<T> {
    state: JobState,
    attempts: u32,
    result: Option<Result<T, JobFailure>>,
}

impl<T> JobContext<T> {
    fn pending() -> Self {
        Self {
            state: JobState::Pending,
            attempts: 0,
            result: None,
        }
    }
}

pub struct Dispatcher<C: Clock = SystemClock> {
    settings: DispatcherSettings,
    rate: Arc<RateWindow<C>>,
}

impl Dispatcher<SystemClock> {
    pub fn from_config(config: &DispatcherConfig) -> Self {
        Self::new(
            config.into(),
            Arc::new(RateWindow::new(config.rate_limit, config.window())),
        )
    }
}

impl<C: Clock> Dispatcher<C> {
    pub fn new(settings: DispatcherSettings, rate: Arc<RateWindow<C>>) -> Self {
        Self { settings, rate }
    }

    /// Runs `work` once per job (plus retries) and waits for all of them to settle. Failures are
    /// captured in the outcomes, nothing a single job does stops the others.
    pub fn run<P, T, F>(&self, jobs: impl IntoIterator<Item = Job<P>>, work: F) -> DispatchReport<P, T>
    where
        P: Send + Sync,
        T: Send,
        F: Fn(&P) -> Result<T, JobError> + Sync,
    {
        let mut payloads = BTreeMap::new();
        let mut contexts = BTreeMap::new();
        let mut backlog = VecDeque::new();
        for job in jobs {
            if payloads.contains_key(&job.id) {
                warn!("Job {} submitted twice, ignoring the duplicate", job.id);
                continue;
            }
            backlog.push_back(job.id);
            contexts.insert(job.id, JobContext::pending());
            payloads.insert(job.id, job.payload);
        }

        let total = backlog.len();
        let workers = self.settings.workers.clamp(1, total.max(1));
        match self.rate.limit() {
            Some(limit) => info!(
                "Dispatching {} jobs to {} workers, at most {} requests per window",
                total, workers, limit
            ),
            None => info!("Dispatching {} jobs to {} workers", total, workers),
        }

        let backlog = Mutex::new(backlog);
        let (tx, rx) = mpsc::channel();
        thread::scope(|s| {
            for _ in 0..workers {
                let tx = tx.clone();
                let backlog = &backlog;
                let payloads = &payloads;
                let work = &work;
                s.spawn(move || loop {
                    let next = backlog.lock().pop_front();
                    let Some(id) = next else {
                        break;
                    };
                    if let Some(payload) = payloads.get(&id) {
                        self.run_job(id, payload, work, &tx);
                    }
                });
            }
            drop(tx);

            let mut settled = 0;
            for event in rx {
                self.record(&mut contexts, event, &mut settled, total);
            }
        });

        let outcomes = payloads
            .into_iter()
            .map(|(id, payload)| {
                let (attempts, result) = match contexts.remove(&id) {
                    Some(JobContext {
                        attempts,
                        result: Some(result),
                        ..
                    }) => (attempts, result),
                    Some(ctx) => (
                        ctx.attempts,
                        Err(JobFailure::Fatal("Job never reported a result".to_string())),
                    ),
                    None => (
                        0,
                        Err(JobFailure::Fatal("Job never reported a result".to_string())),
                    ),
                };
                JobOutcome {
                    id,
                    payload,
                    attempts,
                    result,
                }
            })
            .collect();

        DispatchReport { outcomes }
    }

    fn run_job<P, T, F>(&self, id: JobId, payload: &P, work: &F, events: &mpsc::Sender<Event<T>>)
    where
        F: Fn(&P) -> Result<T, JobError>,
    {
        let mut attempt = 0;
        let mut failures = 0;
        let result = loop {
            let waited = self.rate.acquire();
            if !waited.is_zero() {
                debug!(
                    "Job {} held back {:?} by the rate limit ({} requests in window)",
                    id,
                    waited,
                    self.rate.in_window()
                );
            }
            attempt += 1;
            let _ = events.send(Event::Started { id, attempt });

            match work(payload) {
                Ok(x) => break Ok(x),
                Err(e) if !e.is_recoverable() => break Err(JobFailure::Fatal(e.to_string())),
                Err(e) => {
                    failures += 1;
                    if failures >= self.settings.max_retries {
                        break Err(JobFailure::ExceededRetries(self.settings.max_retries));
                    }
                    let wait = e.retry_after().unwrap_or(self.settings.fallback_delay);
                    let _ = events.send(Event::Retrying {
                        id,
                        failures,
                        wait,
                        error: e,
                    });
                    self.rate.clock().sleep(wait);
                }
            }
        };
        let _ = events.send(Event::Finished {
            id,
            attempts: attempt,
            result,
        });
    }

    fn record<T>(
        &self,
        contexts: &mut BTreeMap<JobId, JobContext<T>>,
        event: Event<T>,
        settled: &mut usize,
        total: usize,
    ) {
        let id = match &event {
            Event::Started { id, .. } | Event::Retrying { id, .. } | Event::Finished { id, .. } => {
                *id
            }
        };
        let Some(ctx) = contexts.get_mut(&id) else {
            error!("Event for unknown job {}", id);
            return;
        };
        if ctx.state.is_terminal() {
            error!("Job {} already finished, ignoring further updates", id);
            return;
        }

        match event {
            Event::Started { attempt, .. } => {
                ctx.state = JobState::InFlight;
                ctx.attempts = attempt;
                debug!("Job {} started (attempt {})", id, attempt);
            }
            Event::Retrying {
                failures,
                wait,
                error,
                ..
            } => {
                ctx.state = JobState::Retrying;
                warn!(
                    "Job {}: {}. Waiting {:.1}s (retry {}/{})",
                    id,
                    error,
                    wait.as_secs_f32(),
                    failures,
                    self.settings.max_retries
                );
            }
            Event::Finished {
                attempts, result, ..
            } => {
                *settled += 1;
                ctx.attempts = attempts;
                match &result {
                    Ok(_) => {
                        ctx.state = JobState::Completed;
                        info!("[{}/{}] Job {} completed", settled, total, id);
                    }
                    Err(e) => {
                        ctx.state = JobState::Failed;
                        error!("[{}/{}] Job {} failed: {}", settled, total, id, e);
                    }
                }
                ctx.result = Some(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::rate_limit::tests::FakeClock;
    use super::*;
    use rand::Rng;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    fn settings(workers: usize) -> DispatcherSettings {
        DispatcherSettings {
            workers,
            max_retries: 5,
            fallback_delay: Duration::from_secs(10),
        }
    }

    fn fake_dispatcher(workers: usize, limit: usize, window: Duration) -> (Dispatcher<FakeClock>, FakeClock) {
        let clock = FakeClock::new();
        let rate = Arc::new(RateWindow::with_clock(limit, window, clock.clone()));
        (Dispatcher::new(settings(workers), rate), clock)
    }

    #[test]
    fn outcomes_in_submission_order() {
        let dispatcher = Dispatcher::new(settings(8), Arc::new(RateWindow::unlimited()));
        let jobs = (0..24).map(|i| Job::new(i, i * 10));

        let report = dispatcher.run(jobs, |x: &usize| {
            let delay = rand::thread_rng().gen_range(0..=500);
            thread::sleep(Duration::from_millis(delay));
            Ok(x + 1)
        });

        assert_eq!(report.completed(), 24);
        assert_eq!(report.failed(), 0);
        for (i, outcome) in report.outcomes.iter().enumerate() {
            assert_eq!(outcome.id, i);
            assert_eq!(outcome.result, Ok(i * 10 + 1));
            assert_eq!(outcome.attempts, 1);
        }
    }

    #[test]
    fn in_flight_is_bounded() {
        let dispatcher = Dispatcher::new(settings(3), Arc::new(RateWindow::unlimited()));
        let in_flight = AtomicUsize::new(0);
        let most = AtomicUsize::new(0);

        let report = dispatcher.run((0..20).map(|i| Job::new(i, ())), |_| {
            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            most.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(report.completed(), 20);
        assert!(most.load(Ordering::SeqCst) <= 3);
    }

    #[test]
    fn retries_after_advertised_wait() {
        let (dispatcher, clock) = fake_dispatcher(1, 0, Duration::ZERO);
        let calls = AtomicU32::new(0);

        let report = dispatcher.run([Job::new(0, "изречение")], |x: &&str| {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(JobError::RateLimited {
                    retry_after: Some(Duration::from_secs(7)),
                })
            } else {
                Ok(x.to_uppercase())
            }
        });

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.result, Ok("ИЗРЕЧЕНИЕ".to_string()));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(clock.elapsed(), Duration::from_secs(14));
    }

    #[test]
    fn gives_up_after_max_retries() {
        let (dispatcher, clock) = fake_dispatcher(2, 0, Duration::ZERO);

        let report = dispatcher.run([Job::new(0, ())], |_| -> Result<(), JobError> {
            Err(JobError::Transient("overloaded".to_string()))
        });

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.result, Err(JobFailure::ExceededRetries(5)));
        assert_eq!(outcome.attempts, 5);
        // Fallback back-off between each attempt, none after the last
        assert_eq!(clock.elapsed(), Duration::from_secs(40));
        assert_eq!(report.exceeded_retries(), 1);
        assert_eq!(
            JobFailure::ExceededRetries(5).to_string(),
            "Error: Rate limit exceeded after 5 retries."
        );
    }

    #[test]
    fn fatal_errors_are_not_retried() {
        let (dispatcher, clock) = fake_dispatcher(4, 0, Duration::ZERO);
        let calls = AtomicU32::new(0);

        let report = dispatcher.run((0..4).map(|i| Job::new(i, i)), |x: &usize| {
            if *x == 2 {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(JobError::Fatal("invalid voice".to_string()))
            } else {
                Ok(*x)
            }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(clock.elapsed(), Duration::ZERO);
        assert_eq!(report.completed(), 3);
        assert_eq!(report.exceeded_retries(), 0);
        assert_eq!(
            report.outcomes[2].result,
            Err(JobFailure::Fatal("invalid voice".to_string()))
        );
        assert_eq!(
            report.outcomes[2].result.as_ref().unwrap_err().to_string(),
            "Error: invalid voice"
        );
    }

    #[test]
    fn rate_limit_spreads_requests() {
        let (dispatcher, clock) = fake_dispatcher(1, 2, Duration::from_secs(10));

        let report = dispatcher.run((0..5).map(|i| Job::new(i, ())), |_| Ok(()));

        assert_eq!(report.completed(), 5);
        assert_eq!(clock.elapsed(), Duration::from_secs(20));
    }

    #[test]
    fn duplicate_ids_run_once() {
        let dispatcher = Dispatcher::new(settings(2), Arc::new(RateWindow::unlimited()));
        let calls = AtomicU32::new(0);

        let report = dispatcher.run([Job::new(1, "а"), Job::new(1, "б"), Job::new(0, "в")], |x| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(x.to_string())
        });

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let results = report
            .outcomes
            .iter()
            .map(|x| (x.id, x.result.clone().unwrap()))
            .collect::<Vec<_>>();
        assert_eq!(results, vec![(0, "в".to_string()), (1, "а".to_string())]);
    }

    #[test]
    fn no_jobs() {
        let dispatcher = Dispatcher::new(settings(4), Arc::new(RateWindow::unlimited()));
        let report = dispatcher.run(Vec::<Job<()>>::new(), |_| Ok(()));
        assert!(report.outcomes.is_empty());
        assert_eq!(report.failed(), 0);
    }
}
