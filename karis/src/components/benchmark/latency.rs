use crate::{
    components::benchmark::correlator::{Correlator, Generation, LatencyRecord},
    devices::{
        hardware::relay_board::RelayBoard,
        software::broker::{BrokerConnection, CommandPublisher},
    },
    error::KarisError,
    logging::write_records,
    utils::{
        settings::{from_yaml_file, resolve_relative},
        time::Timestamp,
    },
};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsStr,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, warn};

/// Column names of the latency csv, in field order of [`LatencyRecord`].
pub const LATENCY_CSV_HEADER: [&str; 5] =
    ["timestamp", "period", "relay_id", "state", "latency_ms"];

/// Configuration for the latency benchmark. The relay board itself is
/// described in its own device config file.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone)]
pub struct LatencyBenchmarkConfig {
    /// Path to the relay board config, relative to this file.
    device_config_file: PathBuf,
    /// Number of batches to run.
    iterations: u32,
    /// Pause between the end of one batch and the next dispatch, in milliseconds.
    wait_between_ms: u64,
    /// How long each batch waits for acknowledgments, in milliseconds.
    ack_timeout_ms: u64,
    /// Where the csv results are written.
    output_path: PathBuf,
}

impl LatencyBenchmarkConfig {
    /// Latency benchmark configuration with 10 batches, 3 seconds between
    /// batches and a 5 second acknowledgment timeout.
    ///
    /// * `device_config_file`: path to the relay board config.
    /// * `output_path`: csv destination.
    pub fn new<F, O>(device_config_file: F, output_path: O) -> Self
    where
        F: AsRef<OsStr>,
        O: AsRef<OsStr>,
    {
        Self {
            device_config_file: (&device_config_file).into(),
            iterations: 10,
            wait_between_ms: 3000,
            ack_timeout_ms: 5000,
            output_path: (&output_path).into(),
        }
    }

    /// Set the number of batches.
    ///
    /// * `iterations`: batches to run.
    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the pause between batches.
    ///
    /// * `wait_between_ms`: milliseconds.
    pub fn with_wait_between(mut self, wait_between_ms: u64) -> Self {
        self.wait_between_ms = wait_between_ms;
        self
    }

    /// Set the acknowledgment timeout.
    ///
    /// * `ack_timeout_ms`: milliseconds.
    pub fn with_ack_timeout(mut self, ack_timeout_ms: u64) -> Self {
        self.ack_timeout_ms = ack_timeout_ms;
        self
    }

    /// Override where the results are written.
    ///
    /// * `output_path`: csv destination.
    pub fn with_output_path<O: AsRef<OsStr>>(mut self, output_path: O) -> Self {
        self.output_path = (&output_path).into();
        self
    }

    /// Read the config from a yaml file. The device config path is
    /// resolved relative to the file.
    ///
    /// * `filepath`: path to config.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, KarisError> {
        let mut config = from_yaml_file::<Self, _>(&filepath)?;
        config.device_config_file = resolve_relative(&filepath, &config.device_config_file);
        if config.ack_timeout_ms == 0 {
            return Err(KarisError::InvalidConfig(String::from(
                "ack_timeout_ms must be greater than zero",
            )));
        }
        Ok(config)
    }
}

/// Stage of a single batch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BatchState {
    /// Targets drawn and the command handed to the broker.
    Dispatched,
    /// Waiting for every relay to acknowledge or the timeout.
    Waiting,
    /// Every relay has a record.
    Resolved,
}

/// Summary of one finished batch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Batch sequence number.
    pub generation: Generation,
    /// Relays that acknowledged in time.
    pub acknowledged: usize,
    /// Relays that never acknowledged.
    pub timed_out: usize,
}

/// Component that measures how long the relay board takes to report a
/// commanded state change, relay by relay.
pub struct LatencyBenchmark {
    /// Board under test.
    board: RelayBoard,
    /// Number of batches to run.
    iterations: u32,
    /// Pause between batches.
    wait_between: Duration,
    /// Acknowledgment window for each batch.
    ack_timeout: Duration,
    /// Csv destination.
    output_path: PathBuf,
    /// Shared with the broker event loop, which feeds it status reports.
    correlator: Arc<Correlator>,
}

impl LatencyBenchmark {
    /// Create a benchmark for `board` using the timing in `config`.
    ///
    /// * `board`: relay board under test.
    /// * `config`: benchmark parameters.
    pub fn new(board: RelayBoard, config: &LatencyBenchmarkConfig) -> Self {
        Self {
            board,
            iterations: config.iterations,
            wait_between: Duration::from_millis(config.wait_between_ms),
            ack_timeout: Duration::from_millis(config.ack_timeout_ms),
            output_path: config.output_path.clone(),
            correlator: Arc::new(Correlator::new()),
        }
    }

    /// Create the benchmark and its relay board from config files.
    ///
    /// * `filepath`: path to the benchmark config.
    pub fn from_config_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, KarisError> {
        let config = LatencyBenchmarkConfig::from_file(filepath)?;
        Self::from_config(&config)
    }

    /// Create the benchmark from an already loaded config.
    ///
    /// * `config`: benchmark parameters.
    pub fn from_config(config: &LatencyBenchmarkConfig) -> Result<Self, KarisError> {
        let board = RelayBoard::from_config_file(&config.device_config_file)?;
        Ok(Self::new(board, config))
    }

    /// Board under test.
    pub fn board(&self) -> &RelayBoard {
        &self.board
    }

    /// Correlator fed by the status topic.
    pub fn correlator(&self) -> Arc<Correlator> {
        self.correlator.clone()
    }
}

/// Unit struct for adding controlling behaviour to the latency benchmark.
pub struct LatencyBenchmarkController;

impl LatencyBenchmarkController {
    /// Connect to the broker, run every batch, disconnect and save the
    /// results. Only a failed connection or a failed write is an error.
    ///
    /// * `benchmark`: component
    pub async fn start(benchmark: LatencyBenchmark) -> Result<Vec<LatencyRecord>, KarisError> {
        let board = benchmark.board();
        let connection = BrokerConnection::connect(
            board.broker(),
            &board.client_id("latency"),
            &board.status_topic(),
            benchmark.correlator(),
        )
        .await?;

        let mut rng = StdRng::from_entropy();
        let outcomes = Self::run(&benchmark, &connection, &mut rng).await;
        connection.disconnect().await;

        let records = benchmark.correlator.take_records();
        write_records(&benchmark.output_path, &LATENCY_CSV_HEADER, &records)?;

        let acknowledged: usize = outcomes.iter().map(|o| o.acknowledged).sum();
        let timed_out: usize = outcomes.iter().map(|o| o.timed_out).sum();
        info!(
            batches = outcomes.len(),
            acknowledged, timed_out, "Latency benchmark finished"
        );
        Ok(records)
    }

    /// Run every batch against `publisher`. Batches never overlap, the next
    /// one is only dispatched once the previous one is resolved.
    ///
    /// * `benchmark`: component
    /// * `publisher`: where commands are sent.
    /// * `rng`: source of the random relay targets.
    pub async fn run<P, R>(
        benchmark: &LatencyBenchmark,
        publisher: &P,
        rng: &mut R,
    ) -> Vec<BatchOutcome>
    where
        P: CommandPublisher + ?Sized,
        R: Rng + ?Sized,
    {
        let mut outcomes = Vec::with_capacity(benchmark.iterations as usize);
        for iteration in 1..=benchmark.iterations {
            info!(iteration, of = benchmark.iterations, "Starting batch");
            let outcome = Self::run_batch(benchmark, publisher, rng).await;
            info!(
                generation = outcome.generation,
                acknowledged = outcome.acknowledged,
                timed_out = outcome.timed_out,
                "Batch resolved"
            );
            outcomes.push(outcome);

            if iteration < benchmark.iterations {
                tokio::time::sleep(benchmark.wait_between).await;
            }
        }
        outcomes
    }

    /// Dispatch one command and wait until every relay has a record.
    ///
    /// * `benchmark`: component
    /// * `publisher`: where the command is sent.
    /// * `rng`: source of the random relay targets.
    pub async fn run_batch<P, R>(
        benchmark: &LatencyBenchmark,
        publisher: &P,
        rng: &mut R,
    ) -> BatchOutcome
    where
        P: CommandPublisher + ?Sized,
        R: Rng + ?Sized,
    {
        let correlator = &benchmark.correlator;
        let command = benchmark.board.random_command(rng);
        let relay_count = command.relays.len();
        let payload = serde_json::to_vec(&command);

        // Start the clock as late as possible, right before the publish.
        let generation = correlator.record_dispatch(&command, Timestamp::now());
        let published = match payload {
            Ok(payload) => {
                publisher
                    .publish(&benchmark.board.control_topic(), payload)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        debug!(generation, state = ?BatchState::Dispatched, targets = %command.summary());
        if let Err(e) = published {
            warn!(generation, error = %e, "Failed to publish command, batch will time out");
        }

        debug!(generation, state = ?BatchState::Waiting);
        let timed_out = if correlator.wait_resolved(benchmark.ack_timeout).await {
            0
        } else {
            correlator.sweep_timeouts(Timestamp::now()).len()
        };
        debug!(generation, state = ?BatchState::Resolved);

        BatchOutcome {
            generation,
            acknowledged: relay_count - timed_out,
            timed_out,
        }
    }
}
