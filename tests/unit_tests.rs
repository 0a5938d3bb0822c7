use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use power_profiling::{
    error::PowerError,
    metrics::integrator::{compute_power, CounterSample},
    sources::nvidia_smi::total_power_draw,
    CaptureRecord, DatabaseConfig, Metadata, MetricRow, MetricTable, Monitor, MonitorConfig,
    MonitorState, OutOfBandClient, OutOfBandConfig, PowerDatabase, PowerDomain, PowerSource,
    PowerStatistics, QueryParams, QueryShape, ReadSemantics, Reading, Result, SshConfig,
};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Counts lifecycle calls so tests can see how many sampling tasks ran.
#[derive(Default)]
struct Counters {
    acquires: AtomicUsize,
    releases: AtomicUsize,
    reads: AtomicUsize,
}

/// Constant-power source that fails the first `failures_per_tick` reads of every tick.
struct FlakySource {
    watts: f64,
    failures_per_tick: usize,
    failed_in_row: usize,
    counters: Arc<Counters>,
}

impl FlakySource {
    fn new(watts: f64, failures_per_tick: usize) -> (Self, Arc<Counters>) {
        let counters = Arc::new(Counters::default());
        let source = Self {
            watts,
            failures_per_tick,
            failed_in_row: 0,
            counters: counters.clone(),
        };
        (source, counters)
    }
}

#[async_trait]
impl PowerSource for FlakySource {
    fn name(&self) -> &'static str {
        "flaky"
    }

    fn domain(&self) -> PowerDomain {
        PowerDomain::Gpu
    }

    fn semantics(&self) -> ReadSemantics {
        ReadSemantics::Instantaneous
    }

    async fn read(&mut self) -> Result<f64> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        if self.failed_in_row < self.failures_per_tick {
            self.failed_in_row += 1;
            return Err(PowerError::read_error("flaky", "injected failure"));
        }
        self.failed_in_row = 0;
        Ok(self.watts)
    }

    fn metadata(&self) -> Metadata {
        let mut metadata = Metadata::new();
        metadata.insert("monitor_type".to_string(), "flaky".into());
        metadata
    }

    async fn acquire(&mut self) -> Result<()> {
        self.counters.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Energy counter that grows at a fixed rate in real time.
struct RampCounter {
    started: Instant,
    watts: f64,
}

#[async_trait]
impl PowerSource for RampCounter {
    fn name(&self) -> &'static str {
        "ramp"
    }

    fn domain(&self) -> PowerDomain {
        PowerDomain::Cpu
    }

    fn semantics(&self) -> ReadSemantics {
        ReadSemantics::CumulativeEnergy {
            max_range_joules: None,
        }
    }

    async fn read(&mut self) -> Result<f64> {
        Ok(self.started.elapsed().as_secs_f64() * self.watts)
    }

    fn metadata(&self) -> Metadata {
        Metadata::new()
    }
}

fn fast_config() -> MonitorConfig {
    MonitorConfig::new(10).with_retry_delay_ms(1)
}

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
}

/// Test that stopping a monitor that never started yields nothing
#[tokio::test]
async fn test_stop_before_start() {
    let (source, counters) = FlakySource::new(50.0, 0);
    let mut monitor = Monitor::new(source, fast_config()).unwrap();

    assert_eq!(monitor.state(), MonitorState::Idle);
    assert!(monitor.stop().await.is_empty());
    assert_eq!(counters.acquires.load(Ordering::SeqCst), 0);
    assert_eq!(monitor.statistics(), PowerStatistics::default());
}

/// Test that a second start while running does not spawn another task
#[tokio::test]
async fn test_double_start_runs_one_task() {
    let (source, counters) = FlakySource::new(50.0, 0);
    let mut monitor = Monitor::new(source, fast_config()).unwrap();

    monitor.start().await;
    monitor.start().await;
    assert!(monitor.is_running());
    tokio::time::sleep(Duration::from_millis(60)).await;
    let readings = monitor.stop().await;

    assert!(!monitor.is_running());
    assert!(!readings.is_empty());
    assert_eq!(counters.acquires.load(Ordering::SeqCst), 1);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
}

/// Test that max_retries - 1 failures per tick still yields one reading per tick
#[tokio::test]
async fn test_retry_recovers_within_budget() {
    let (source, counters) = FlakySource::new(75.0, 2);
    let mut monitor = Monitor::new(source, fast_config().with_max_retries(3)).unwrap();

    monitor.start().await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    let readings = monitor.stop().await;

    assert!(!readings.is_empty());
    assert!(readings.iter().all(|r| r.power_watts() == 75.0));
    // every recorded tick cost exactly three reads
    assert!(counters.reads.load(Ordering::SeqCst) >= readings.len() * 3);
}

/// Test that an exhausted retry budget skips the tick without recording zero
#[tokio::test]
async fn test_retry_exhaustion_records_nothing() {
    let (source, counters) = FlakySource::new(75.0, usize::MAX);
    let mut monitor = Monitor::new(source, fast_config().with_max_retries(3)).unwrap();

    monitor.start().await;
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(monitor.is_running());
    let readings = monitor.stop().await;

    assert!(readings.is_empty());
    assert!(counters.reads.load(Ordering::SeqCst) >= 3);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 1);
}

/// Source whose every read takes longer than the default stop grace.
struct SlowSource {
    delay: Duration,
    counters: Arc<Counters>,
}

#[async_trait]
impl PowerSource for SlowSource {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn domain(&self) -> PowerDomain {
        PowerDomain::System
    }

    fn semantics(&self) -> ReadSemantics {
        ReadSemantics::Instantaneous
    }

    async fn read(&mut self) -> Result<f64> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(310.0)
    }

    fn metadata(&self) -> Metadata {
        Metadata::new()
    }

    fn read_timeout(&self) -> Option<Duration> {
        Some(Duration::from_secs(2))
    }

    async fn acquire(&mut self) -> Result<()> {
        self.counters.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }
}

/// Test that stopping during a slow read waits for it and keeps the source
#[tokio::test]
async fn test_stop_waits_for_slow_read() {
    let counters = Arc::new(Counters::default());
    let source = SlowSource {
        delay: Duration::from_millis(1500),
        counters: counters.clone(),
    };
    let mut monitor = Monitor::new(source, MonitorConfig::default()).unwrap();

    monitor.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let readings = monitor.stop().await;

    assert_eq!(readings.len(), 1);
    assert_eq!(readings[0].power_watts(), 310.0);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 1);

    // the source came back, so the monitor can run again
    monitor.start().await;
    assert!(monitor.is_running());
    monitor.stop().await;
    assert_eq!(counters.acquires.load(Ordering::SeqCst), 2);
    assert_eq!(counters.releases.load(Ordering::SeqCst), 2);
}

/// Test restart keeps earlier readings until cleared
#[tokio::test]
async fn test_restart_accumulates_until_clear() {
    let (source, counters) = FlakySource::new(20.0, 0);
    let mut monitor = Monitor::new(source, fast_config()).unwrap();

    monitor.start().await;
    tokio::time::sleep(Duration::from_millis(40)).await;
    let first = monitor.stop().await.len();

    monitor.start().await;
    tokio::time::sleep(Duration::from_millis(40)).await;
    let second = monitor.stop().await.len();

    assert!(first > 0);
    assert!(second > first);
    assert_eq!(counters.acquires.load(Ordering::SeqCst), 2);

    monitor.clear();
    assert!(monitor.readings().is_empty());
}

/// Test that a cumulative source is differentiated and the first tick only warms up
#[tokio::test]
async fn test_cumulative_source_is_integrated() {
    let source = RampCounter {
        started: Instant::now(),
        watts: 100.0,
    };
    let mut monitor = Monitor::new(source, MonitorConfig::new(20)).unwrap();
    assert_eq!(monitor.domain(), PowerDomain::Cpu);

    monitor.start().await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    let readings = monitor.stop().await;

    assert!(!readings.is_empty());
    for reading in &readings {
        assert!(
            (50.0..200.0).contains(&reading.power_watts()),
            "integrated power {} too far from 100 W",
            reading.power_watts()
        );
    }
}

/// Test counter wraparound with a known range
#[test]
fn test_counter_wraparound() {
    let t0 = Instant::now();
    let previous = CounterSample {
        raw_joules: 900.0,
        captured_at: t0,
    };
    let current = CounterSample {
        raw_joules: 50.0,
        captured_at: t0 + Duration::from_secs(1),
    };

    assert_eq!(compute_power(&previous, &current, Some(1000.0), 10_000.0).unwrap(), 150.0);
    assert!(compute_power(&previous, &current, None, 10_000.0).is_err());
}

/// Test the statistics aggregator on evenly spaced readings
#[test]
fn test_statistics_over_readings() {
    let readings: Vec<Reading> = [10.0, 20.0, 30.0]
        .iter()
        .enumerate()
        .map(|(i, &w)| Reading::at(ts(0) + ChronoDuration::seconds(i as i64), w, Metadata::new()))
        .collect();

    let stats = PowerStatistics::from_readings(&readings);
    assert_eq!(stats.min_watts, 10.0);
    assert_eq!(stats.max_watts, 30.0);
    assert_eq!(stats.mean_watts, 20.0);
    assert_eq!(stats.duration_seconds, 2.0);
    assert_eq!(stats.total_energy_joules, 40.0);
    assert_eq!(stats.sample_count, 3);

    assert!(PowerStatistics::from_readings(&readings[..1]).is_empty());
}

/// Test GPU device-set summation tolerates absent devices
#[test]
fn test_gpu_device_set() {
    let selected: BTreeSet<u32> = [0, 2].into_iter().collect();
    let output = "0, 100.0 W\n1, 150.0 W\n";
    assert_eq!(total_power_draw(output, &selected).unwrap(), 100.0);
}

/// Test the capture record JSON layout
#[test]
fn test_capture_record_serialization() {
    let mut record = CaptureRecord::new();
    let mut metadata = Metadata::new();
    metadata.insert("monitor_type".to_string(), "intel_rapl".into());
    record.set_domain(PowerDomain::Cpu, vec![Reading::at(ts(0), 42.0, metadata)]);
    record.finish();

    let json = serde_json::to_string(&record).expect("Should serialize");
    let parsed: CaptureRecord = serde_json::from_str(&json).expect("Should deserialize");
    assert_eq!(parsed.run_id, record.run_id);
    assert_eq!(parsed.domain(PowerDomain::Cpu)[0].power_watts(), 42.0);

    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["cpu_power"][0]["timestamp"], "2023-11-14T22:13:20Z");
    assert_eq!(value["cpu_power"][0]["metadata"]["monitor_type"], "intel_rapl");
    assert!(value["gpu_power"].as_array().unwrap().is_empty());
}

/// Test that an invalid monitor configuration is rejected
#[test]
fn test_invalid_monitor_config() {
    let (source, _) = FlakySource::new(1.0, 0);
    let result = Monitor::new(source, MonitorConfig::new(0));
    assert!(matches!(result, Err(PowerError::Config(_))));
}

/// Database stub that ignores the requested bounds
struct StaticDatabase {
    rows: Vec<MetricRow>,
}

#[async_trait]
impl PowerDatabase for StaticDatabase {
    async fn connect(&mut self, _: &DatabaseConfig, _: &SshConfig) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) {}

    async fn query(
        &mut self,
        _table: MetricTable,
        _node_id: Option<&str>,
        _shape: QueryShape,
    ) -> Result<Vec<MetricRow>> {
        Ok(self.rows.clone())
    }

    async fn tables(&mut self) -> Result<Vec<String>> {
        Ok(vec![MetricTable::ComputePower.to_string()])
    }
}

fn oob_client() -> OutOfBandClient<StaticDatabase> {
    let rows = (0..20)
        .map(|i| MetricRow {
            node_id: "rpc-91-1".to_string(),
            timestamp: ts(i * 60),
            value: 400.0 + i as f64,
            sensor: None,
        })
        .collect();

    OutOfBandClient::new(
        StaticDatabase { rows },
        OutOfBandConfig::new(
            DatabaseConfig::new("db", "telemetry", "reader", "pw"),
            SshConfig::new("login", "user", "/tmp/id_ed25519"),
        ),
    )
}

/// Test out-of-band queries require a session
#[test]
fn test_out_of_band_not_connected() {
    let mut client = oob_client();
    let result = tokio_test::block_on(client.fetch_compute_power(&QueryParams::default()));
    assert!(matches!(result, Err(PowerError::NotConnected)));
}

/// Test out-of-band range and limit are enforced on returned rows
#[tokio::test]
async fn test_out_of_band_range_and_limit() {
    let mut client = oob_client();
    let params = QueryParams::default()
        .for_node("rpc-91-1")
        .between(ts(300), ts(900))
        .with_limit(4);

    let rows = client
        .with_session(|c| Box::pin(async move { c.fetch_compute_power(&params).await }))
        .await
        .unwrap();

    assert_eq!(rows.len(), 4);
    assert!(rows.iter().all(|r| r.timestamp >= ts(300) && r.timestamp <= ts(900)));
    assert!(!client.is_connected());
}
