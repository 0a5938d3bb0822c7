//! Background sampling of a single power source.

use crate::config::MonitorConfig;
use crate::error::{PowerError, Result};
use crate::metrics::{
    data::{MonitorState, PowerDomain, Reading},
    integrator::CounterIntegrator,
    statistics::PowerStatistics,
    traits::{PowerSource, ReadSemantics},
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Append-only reading sequence shared between a monitor and its sampling task.
///
/// The sampling task is the only writer; the monitor only takes copies.
#[derive(Debug, Clone, Default)]
pub struct ReadingLog {
    inner: Arc<Mutex<Vec<Reading>>>,
}

impl ReadingLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Reading>> {
        // a panic while holding the lock cannot leave a half-written Vec
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, reading: Reading) {
        self.lock().push(reading);
    }

    /// Copy of every reading recorded so far, in recording order.
    pub fn snapshot(&self) -> Vec<Reading> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn statistics(&self) -> PowerStatistics {
        PowerStatistics::from_readings(&self.lock())
    }
}

struct SamplingTask {
    cancel: CancellationToken,
    handle: JoinHandle<Box<dyn PowerSource>>,
}

/// Samples one [`PowerSource`] on a background task.
///
/// ```rust,no_run
/// use power_profiling::{Monitor, MonitorConfig, RaplConfig, RaplSource};
///
/// # async fn capture() -> power_profiling::Result<()> {
/// let source = RaplSource::new(RaplConfig::default())?;
/// let mut monitor = Monitor::new(source, MonitorConfig::new(100))?;
///
/// monitor.start().await;
/// // ... run the workload ...
/// let readings = monitor.stop().await;
/// println!("{} readings, {:.1} J", readings.len(), monitor.statistics().total_energy_joules);
/// # Ok(())
/// # }
/// ```
pub struct Monitor {
    name: &'static str,
    domain: PowerDomain,
    config: MonitorConfig,
    /// Per-read deadline declared by the source
    read_timeout: Option<Duration>,
    /// `None` while the sampling task owns the source
    source: Option<Box<dyn PowerSource>>,
    log: ReadingLog,
    task: Option<SamplingTask>,
}

impl Monitor {
    /// Create an idle monitor for `source`.
    pub fn new<S: PowerSource>(source: S, config: MonitorConfig) -> Result<Self> {
        Self::from_boxed(Box::new(source), config)
    }

    /// Create an idle monitor for an already boxed source.
    pub fn from_boxed(source: Box<dyn PowerSource>, config: MonitorConfig) -> Result<Self> {
        config.validate()?;
        info!(
            "Initializing {} monitor ({}) with {}ms interval",
            source.domain(),
            source.name(),
            config.interval_ms
        );

        Ok(Self {
            name: source.name(),
            domain: source.domain(),
            config,
            read_timeout: source.read_timeout(),
            source: Some(source),
            log: ReadingLog::new(),
            task: None,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn domain(&self) -> PowerDomain {
        self.domain
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start sampling. Does nothing if the monitor is already running.
    pub async fn start(&mut self) {
        if self.is_running() {
            warn!("{} monitor is already running", self.name);
            return;
        }

        // a task that ended on its own (e.g. acquire failed) still holds the source
        if let Some(task) = self.task.take() {
            self.reap(task.handle).await;
        }

        let Some(source) = self.source.take() else {
            error!(
                "{} monitor cannot start: its source was lost when a previous run was aborted",
                self.name
            );
            return;
        };

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_sampler(
            source,
            self.config.clone(),
            self.log.clone(),
            cancel.clone(),
        ));
        self.task = Some(SamplingTask { cancel, handle });
        info!("{} monitor started", self.name);
    }

    /// Stop sampling and return every reading recorded so far.
    ///
    /// An in-flight retry sequence runs to completion. Waits at most
    /// [`MonitorConfig::stop_timeout`] for the sampling task to observe the
    /// stop signal; after that the task is aborted. Calling this on
    /// an idle monitor returns the existing readings.
    pub async fn stop(&mut self) -> Vec<Reading> {
        match self.task.take() {
            Some(task) => {
                task.cancel.cancel();
                let timeout = self.config.stop_timeout(self.read_timeout);
                let mut handle = task.handle;

                match tokio::time::timeout(timeout, &mut handle).await {
                    Ok(joined) => self.restore(joined),
                    Err(_) => {
                        warn!(
                            "{} monitor did not stop within {:?}, aborting sampling task",
                            self.name, timeout
                        );
                        handle.abort();
                        // wait for the abort so no write can land after we return
                        self.restore(handle.await);
                    }
                }

                info!(
                    "{} monitor stopped, collected {} readings",
                    self.name,
                    self.log.len()
                );
            }
            None => warn!("{} monitor is not running", self.name),
        }

        self.log.snapshot()
    }

    /// Whether a sampling task is active.
    pub fn is_running(&self) -> bool {
        self.task
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    pub fn state(&self) -> MonitorState {
        if self.is_running() {
            MonitorState::Running
        } else {
            MonitorState::Idle
        }
    }

    /// Statistics over the readings recorded so far.
    pub fn statistics(&self) -> PowerStatistics {
        self.log.statistics()
    }

    /// Copy of the readings recorded so far, without stopping.
    pub fn readings(&self) -> Vec<Reading> {
        self.log.snapshot()
    }

    /// Drop all recorded readings.
    pub fn clear(&mut self) {
        self.log.clear();
    }

    async fn reap(&mut self, handle: JoinHandle<Box<dyn PowerSource>>) {
        self.restore(handle.await);
    }

    fn restore(&mut self, joined: std::result::Result<Box<dyn PowerSource>, tokio::task::JoinError>) {
        match joined {
            Ok(source) => self.source = Some(source),
            Err(err) if err.is_cancelled() => {
                warn!("{} sampling task was aborted, source dropped", self.name)
            }
            Err(err) => error!("{} sampling task failed: {}", self.name, err),
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.cancel.cancel();
        }
    }
}

/// Per-tick state of a sampling loop: retry policy plus optional counter integration.
pub(crate) struct Sampler {
    max_retries: u32,
    retry_delay: Duration,
    integrator: Option<CounterIntegrator>,
}

impl Sampler {
    pub(crate) fn new(config: &MonitorConfig, semantics: ReadSemantics) -> Self {
        let integrator = match semantics {
            ReadSemantics::Instantaneous => None,
            ReadSemantics::CumulativeEnergy { max_range_joules } => Some(
                CounterIntegrator::new(max_range_joules)
                    .with_max_plausible_watts(config.max_plausible_watts),
            ),
        };

        Self {
            max_retries: config.max_retries,
            retry_delay: config.retry_delay(),
            integrator,
        }
    }

    /// Run one tick. `None` means the tick contributes no reading.
    pub(crate) async fn tick(&mut self, source: &mut dyn PowerSource) -> Option<Reading> {
        let raw = read_with_retry(source, self.max_retries, self.retry_delay).await?;

        let watts = match self.integrator.as_mut() {
            None => raw,
            Some(integrator) => match integrator.integrate(raw, Instant::now()) {
                Ok(Some(watts)) => watts,
                Ok(None) => {
                    debug!("{}: first counter sample, waiting for the next tick", source.name());
                    return None;
                }
                Err(err) => {
                    warn!("{}: skipping tick: {}", source.name(), err);
                    return None;
                }
            },
        };

        debug!("{}: recorded {:.2}W", source.name(), watts);
        Some(Reading::now(watts, source.metadata()))
    }
}

/// Read `source` up to `max_retries` times, pausing `retry_delay` between
/// failed attempts. Non-finite values and reads exceeding the source's
/// [`read_timeout`](PowerSource::read_timeout) count as failures.
pub(crate) async fn read_with_retry(
    source: &mut dyn PowerSource,
    max_retries: u32,
    retry_delay: Duration,
) -> Option<f64> {
    let attempts = max_retries.max(1);

    for attempt in 1..=attempts {
        let outcome = match source.read_timeout() {
            Some(deadline) => tokio::time::timeout(deadline, source.read())
                .await
                .unwrap_or_else(|_| Err(PowerError::timeout("power read", deadline))),
            None => source.read().await,
        };

        match outcome {
            Ok(value) if value.is_finite() => return Some(value),
            Ok(value) => debug!(
                "{}: attempt {}/{} returned non-finite value {}",
                source.name(),
                attempt,
                attempts,
                value
            ),
            Err(err) => debug!(
                "{}: attempt {}/{} failed: {}",
                source.name(),
                attempt,
                attempts,
                err
            ),
        }

        if attempt < attempts {
            tokio::time::sleep(retry_delay).await;
        }
    }

    warn!(
        "{}: no reading after {} attempts, skipping tick",
        source.name(),
        attempts
    );
    None
}

async fn run_sampler(
    mut source: Box<dyn PowerSource>,
    config: MonitorConfig,
    log: ReadingLog,
    cancel: CancellationToken,
) -> Box<dyn PowerSource> {
    if let Err(err) = source.acquire().await {
        error!("{}: failed to open source: {}", source.name(), err);
        source.release().await;
        return source;
    }

    debug!("{}: sampling loop started", source.name());
    let mut sampler = Sampler::new(&config, source.semantics());
    let interval = config.interval();

    while !cancel.is_cancelled() {
        if let Some(reading) = sampler.tick(source.as_mut()).await {
            log.append(reading);
        }
        tokio::time::sleep(interval).await;
    }

    source.release().await;
    debug!("{}: sampling loop stopped", source.name());
    source
}
