use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use rand::Rng;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::{interval_at, sleep, timeout, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::metrics::Metrics;

pub const RECALC_JOB: &str = "recalc";
pub const CONTROL_JOB: &str = "control";
pub const TELEMETRY_JOB: &str = "telemetry";
pub const COUNTERS_JOB: &str = "counters";

const RECALC_JITTER_CAP: Duration = Duration::from_secs(15);
const DEFAULT_JITTER_CAP: Duration = Duration::from_secs(2);

type JobFn = Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One named periodic job.
#[derive(Clone)]
pub struct JobSpec {
    pub name: &'static str,
    pub interval: Duration,
    pub jitter_cap: Duration,
    run: JobFn,
}

impl JobSpec {
    pub fn new<F, Fut>(name: &'static str, interval: Duration, run: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let jitter_cap = if name == RECALC_JOB {
            RECALC_JITTER_CAP
        } else {
            DEFAULT_JITTER_CAP
        };
        Self {
            name,
            interval,
            jitter_cap,
            run: Arc::new(move || run().boxed()),
        }
    }
}

/// The fixed job set driven by the scheduler.
#[derive(Clone)]
pub struct JobSet {
    pub recalc: JobSpec,
    pub control: JobSpec,
    pub telemetry: Option<JobSpec>,
    pub counters: Option<JobSpec>,
}

impl JobSet {
    fn periodic(&self) -> impl Iterator<Item = &JobSpec> {
        [Some(&self.recalc), Some(&self.control), self.telemetry.as_ref(), self.counters.as_ref()]
            .into_iter()
            .flatten()
    }
}

/// Task status tracking
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskStatus {
    pub interval_secs: u64,
    pub running: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_duration_ms: Option<u64>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub misfire_count: u64,
    pub coalesced_count: u64,
}

/// Upper bound of the random delay added to each firing: a tenth of the
/// interval, capped, and always below the interval itself.
pub fn jitter_for(interval: Duration, cap: Duration) -> Duration {
    (interval / 10)
        .min(cap)
        .min(interval.saturating_sub(Duration::from_millis(1)))
}

struct Running {
    token: CancellationToken,
    tracker: TaskTracker,
}

#[derive(Clone)]
struct Shared {
    statuses: Arc<RwLock<HashMap<&'static str, TaskStatus>>>,
    metrics: Arc<Metrics>,
}

/// Periodic job scheduler.
///
/// Every job runs in its own loop task. A per-name run guard, kept across
/// reschedules, guarantees at most one instance of a job at a time; firings
/// that find the guard taken are coalesced away.
pub struct Scheduler {
    running: Mutex<Option<Running>>,
    guards: parking_lot::Mutex<HashMap<&'static str, Arc<Mutex<()>>>>,
    shared: Shared,
    jitter_enabled: bool,
}

impl Scheduler {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            running: Mutex::new(None),
            guards: parking_lot::Mutex::new(HashMap::new()),
            shared: Shared {
                statuses: Arc::new(RwLock::new(HashMap::new())),
                metrics,
            },
            jitter_enabled: true,
        }
    }

    /// Disables the per-firing random delay, for deterministic timing.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_enabled = false;
        self
    }

    fn guard(&self, name: &'static str) -> Arc<Mutex<()>> {
        self.guards
            .lock()
            .entry(name)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Runs `recalc` once inline, then starts all periodic loops. Calling it
    /// while already running replaces the jobs like [`Scheduler::reschedule`].
    pub async fn start(&self, jobs: JobSet) {
        let permit = self.guard(RECALC_JOB).lock_owned().await;
        run_job(jobs.recalc.clone(), permit, self.shared.clone()).await;

        let mut running = self.running.lock().await;
        if let Some(old) = running.take() {
            old.token.cancel();
            old.tracker.close();
        }
        let current = Running {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        };
        self.spawn_loops(&current, &jobs);
        *running = Some(current);
        info!(jobs = jobs.periodic().count(), "scheduler started");
    }

    /// Swaps every job for the new set. Old loops are cancelled before new
    /// ones start; in-flight runs finish and still hold their run guard.
    /// No-op when the scheduler is not running.
    pub async fn reschedule(&self, jobs: JobSet) {
        let mut running = self.running.lock().await;
        let Some(current) = running.as_mut() else {
            debug!("reschedule ignored, scheduler not running");
            return;
        };
        current.token.cancel();
        current.token = CancellationToken::new();
        {
            let mut statuses = self.shared.statuses.write();
            let keep: Vec<&'static str> = jobs.periodic().map(|j| j.name).collect();
            statuses.retain(|name, _| keep.contains(name));
        }
        self.spawn_loops(current, &jobs);
        info!(jobs = jobs.periodic().count(), "scheduler rescheduled");
    }

    /// Stops all loops and waits at most `grace` for in-flight runs.
    pub async fn shutdown(&self, grace: Duration) {
        let Some(current) = self.running.lock().await.take() else {
            return;
        };
        current.token.cancel();
        current.tracker.close();
        if timeout(grace, current.tracker.wait()).await.is_err() {
            warn!(grace_secs = grace.as_secs_f64(), "jobs still running at shutdown, not waiting further");
        } else {
            info!("scheduler stopped");
        }
    }

    /// Runs `fut` under the run guard of `name`, waiting for any in-flight
    /// run of that job first.
    pub async fn run_exclusive<F: Future>(&self, name: &'static str, fut: F) -> F::Output {
        let _permit = self.guard(name).lock_owned().await;
        fut.await
    }

    pub fn status(&self) -> BTreeMap<String, TaskStatus> {
        self.shared
            .statuses
            .read()
            .iter()
            .map(|(name, status)| (name.to_string(), status.clone()))
            .collect()
    }

    pub fn job_status(&self, name: &str) -> Option<TaskStatus> {
        self.shared.statuses.read().get(name).cloned()
    }

    fn spawn_loops(&self, current: &Running, jobs: &JobSet) {
        for spec in jobs.periodic() {
            let jitter = if self.jitter_enabled {
                jitter_for(spec.interval, spec.jitter_cap)
            } else {
                Duration::ZERO
            };
            self.shared
                .statuses
                .write()
                .entry(spec.name)
                .or_default()
                .interval_secs = spec.interval.as_secs();

            current.tracker.spawn(job_loop(
                spec.clone(),
                jitter,
                self.guard(spec.name),
                current.token.clone(),
                current.tracker.clone(),
                self.shared.clone(),
            ));
        }
    }
}

async fn job_loop(
    spec: JobSpec,
    jitter: Duration,
    guard: Arc<Mutex<()>>,
    token: CancellationToken,
    tracker: TaskTracker,
    shared: Shared,
) {
    let period = spec.interval.max(Duration::from_millis(1));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        let scheduled = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            at = ticker.tick() => at,
        };

        let lateness = Instant::now().saturating_duration_since(scheduled);
        if lateness > period + jitter {
            shared.metrics.scheduler_misfires();
            if let Some(s) = shared.statuses.write().get_mut(spec.name) {
                s.misfire_count += 1;
            }
            warn!(job = spec.name, lateness_ms = lateness.as_millis() as u64, "job misfired");
        }

        if !jitter.is_zero() {
            let delay_ms = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = sleep(Duration::from_millis(delay_ms)) => {}
            }
        }
        if token.is_cancelled() {
            break;
        }

        match guard.clone().try_lock_owned() {
            Ok(permit) => {
                tracker.spawn(run_job(spec.clone(), permit, shared.clone()));
            }
            Err(_) => {
                shared.metrics.scheduler_coalesced();
                if let Some(s) = shared.statuses.write().get_mut(spec.name) {
                    s.coalesced_count += 1;
                }
                debug!(job = spec.name, "previous run still active, firing coalesced");
            }
        }
    }
    debug!(job = spec.name, "job loop stopped");
}

async fn run_job(spec: JobSpec, _permit: OwnedMutexGuard<()>, shared: Shared) {
    let started_at = Utc::now();
    let started = Instant::now();
    {
        let mut statuses = shared.statuses.write();
        let s = statuses.entry(spec.name).or_default();
        s.running = true;
        s.last_run = Some(started_at);
        s.run_count += 1;
    }

    let outcome = AssertUnwindSafe((spec.run)()).catch_unwind().await;
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let mut statuses = shared.statuses.write();
    let s = statuses.entry(spec.name).or_default();
    s.running = false;
    s.last_duration_ms = Some(elapsed_ms);
    match outcome {
        Ok(Ok(())) => {
            s.last_success = Some(started_at);
            s.success_count += 1;
            s.last_error = None;
        }
        Ok(Err(e)) => {
            s.error_count += 1;
            s.last_error = Some(format!("{e:#}"));
            warn!(job = spec.name, error = %e, "job failed");
        }
        Err(_) => {
            s.error_count += 1;
            s.last_error = Some("job panicked".to_string());
            error!(job = spec.name, "job panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting(name: &'static str, secs: u64, counter: Arc<AtomicUsize>) -> JobSpec {
        JobSpec::new(name, Duration::from_secs(secs), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    fn jobs(recalc: JobSpec, control: JobSpec) -> JobSet {
        JobSet {
            recalc,
            control,
            telemetry: None,
            counters: None,
        }
    }

    fn scheduler() -> Scheduler {
        Scheduler::new(Arc::new(Metrics::new())).without_jitter()
    }

    #[tokio::test(start_paused = true)]
    async fn start_runs_recalc_before_returning() {
        let recalc = Arc::new(AtomicUsize::new(0));
        let control = Arc::new(AtomicUsize::new(0));
        let s = scheduler();

        s.start(jobs(counting(RECALC_JOB, 300, recalc.clone()), counting(CONTROL_JOB, 10, control.clone())))
            .await;

        assert_eq!(recalc.load(Ordering::SeqCst), 1);
        assert_eq!(control.load(Ordering::SeqCst), 0);
        assert_eq!(s.job_status(RECALC_JOB).unwrap().success_count, 1);
        s.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn jobs_fire_on_their_interval() {
        let recalc = Arc::new(AtomicUsize::new(0));
        let control = Arc::new(AtomicUsize::new(0));
        let s = scheduler();
        s.start(jobs(counting(RECALC_JOB, 300, recalc.clone()), counting(CONTROL_JOB, 10, control.clone())))
            .await;

        sleep(Duration::from_secs(35)).await;
        assert_eq!(control.load(Ordering::SeqCst), 3);
        assert_eq!(recalc.load(Ordering::SeqCst), 1);
        s.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn slow_job_never_overlaps_itself() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (active.clone(), peak.clone());
        let slow = JobSpec::new(CONTROL_JOB, Duration::from_secs(10), move || {
            let (a, p) = (a.clone(), p.clone());
            async move {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                sleep(Duration::from_secs(25)).await;
                a.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let s = scheduler();
        s.start(jobs(counting(RECALC_JOB, 300, Arc::default()), slow)).await;
        sleep(Duration::from_secs(100)).await;

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        let status = s.job_status(CONTROL_JOB).unwrap();
        assert!(status.coalesced_count > 0);
        assert!(status.run_count >= 3);
        s.shutdown(Duration::from_secs(30)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_old_jobs() {
        let old = Arc::new(AtomicUsize::new(0));
        let new = Arc::new(AtomicUsize::new(0));
        let s = scheduler();
        s.start(jobs(counting(RECALC_JOB, 300, Arc::default()), counting(CONTROL_JOB, 10, old.clone())))
            .await;
        sleep(Duration::from_secs(25)).await;
        assert_eq!(old.load(Ordering::SeqCst), 2);

        s.reschedule(jobs(counting(RECALC_JOB, 300, Arc::default()), counting(CONTROL_JOB, 60, new.clone())))
            .await;
        sleep(Duration::from_secs(65)).await;

        assert_eq!(old.load(Ordering::SeqCst), 2);
        assert_eq!(new.load(Ordering::SeqCst), 1);
        assert_eq!(s.job_status(CONTROL_JOB).unwrap().interval_secs, 60);
        s.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_before_start_is_ignored() {
        let s = scheduler();
        s.reschedule(jobs(counting(RECALC_JOB, 300, Arc::default()), counting(CONTROL_JOB, 10, Arc::default())))
            .await;
        assert!(!s.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_future_firings() {
        let control = Arc::new(AtomicUsize::new(0));
        let s = scheduler();
        s.start(jobs(counting(RECALC_JOB, 300, Arc::default()), counting(CONTROL_JOB, 10, control.clone())))
            .await;
        sleep(Duration::from_secs(15)).await;
        s.shutdown(Duration::from_secs(1)).await;

        let seen = control.load(Ordering::SeqCst);
        sleep(Duration::from_secs(100)).await;
        assert_eq!(control.load(Ordering::SeqCst), seen);
        assert!(!s.is_running().await);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_and_panicking_jobs_keep_the_loop_alive() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let flaky = JobSpec::new(CONTROL_JOB, Duration::from_secs(10), move || {
            let c = c.clone();
            async move {
                match c.fetch_add(1, Ordering::SeqCst) {
                    0 => panic!("boom"),
                    1 => anyhow::bail!("provider down"),
                    _ => Ok(()),
                }
            }
        });

        let s = scheduler();
        s.start(jobs(counting(RECALC_JOB, 300, Arc::default()), flaky)).await;
        sleep(Duration::from_secs(35)).await;

        let status = s.job_status(CONTROL_JOB).unwrap();
        assert_eq!(status.run_count, 3);
        assert_eq!(status.error_count, 2);
        assert_eq!(status.success_count, 1);
        assert!(status.last_error.is_none());
        s.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_loop_counts_a_misfire_and_catches_up_once() {
        let control = Arc::new(AtomicUsize::new(0));
        let metrics = Arc::new(Metrics::new());
        let s = Scheduler::new(metrics.clone()).without_jitter();
        s.start(jobs(counting(RECALC_JOB, 300, Arc::default()), counting(CONTROL_JOB, 10, control.clone())))
            .await;
        sleep(Duration::from_secs(1)).await;

        // jump past three firings without letting the loop observe them
        tokio::time::advance(Duration::from_secs(35)).await;
        sleep(Duration::from_secs(1)).await;

        assert_eq!(control.load(Ordering::SeqCst), 1);
        assert_eq!(s.job_status(CONTROL_JOB).unwrap().misfire_count, 1);
        assert_eq!(metrics.snapshot().scheduler_misfires, 1);

        // back on schedule at t=40s
        sleep(Duration::from_secs(5)).await;
        assert_eq!(control.load(Ordering::SeqCst), 2);
        assert_eq!(s.job_status(CONTROL_JOB).unwrap().misfire_count, 1);
        s.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn jittered_firings_stay_inside_the_window() {
        let fired = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let f = fired.clone();
        let control = JobSpec::new(CONTROL_JOB, Duration::from_secs(10), move || {
            let f = f.clone();
            async move {
                f.lock().push(Instant::now());
                Ok(())
            }
        });
        let jitter = jitter_for(control.interval, control.jitter_cap);
        assert_eq!(jitter, Duration::from_secs(1));

        let s = Scheduler::new(Arc::new(Metrics::new()));
        let origin = Instant::now();
        s.start(jobs(counting(RECALC_JOB, 300, Arc::default()), control)).await;
        sleep(Duration::from_secs(35)).await;

        let fired = fired.lock().clone();
        assert_eq!(fired.len(), 3);
        for (k, at) in fired.iter().enumerate() {
            let due = Duration::from_secs(10 * (k as u64 + 1));
            let offset = at.duration_since(origin);
            assert!(offset >= due && offset <= due + jitter, "firing {k} at {offset:?}");
        }
        assert_eq!(s.job_status(CONTROL_JOB).unwrap().misfire_count, 0);
        s.shutdown(Duration::from_secs(1)).await;
    }

    #[rstest]
    #[case(300, 15, 15)]
    #[case(60, 15, 6)]
    #[case(10, 2, 1)]
    #[case(1, 2, 0)]
    fn jitter_is_bounded(#[case] interval: u64, #[case] cap: u64, #[case] expected: u64) {
        let jitter = jitter_for(Duration::from_secs(interval), Duration::from_secs(cap));
        assert!(jitter < Duration::from_secs(interval));
        assert_eq!(jitter.as_secs(), expected);
    }

    #[rstest]
    #[case(1, Duration::ZERO)]
    #[case(5, Duration::from_micros(500))]
    fn sub_second_intervals_get_proportional_jitter(#[case] interval_ms: u64, #[case] expected: Duration) {
        let jitter = jitter_for(Duration::from_millis(interval_ms), DEFAULT_JITTER_CAP);
        assert_eq!(jitter, expected);
    }

    mod jitter_bounds {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn jitter_never_exceeds_its_bounds(interval_ms in 1u64..2_000_000, cap_ms in 0u64..30_000) {
                let interval = Duration::from_millis(interval_ms);
                let cap = Duration::from_millis(cap_ms);
                let jitter = jitter_for(interval, cap);
                prop_assert!(jitter < interval);
                prop_assert!(jitter <= cap);
                prop_assert!(jitter <= interval / 10);
            }
        }
    }
}
