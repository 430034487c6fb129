use crate::{
    devices::{
        hardware::relay_board::RelayBoard,
        software::broker::{BrokerConnection, CommandPublisher, StatusHandler},
    },
    error::KarisError,
    logging::write_records,
    utils::{
        settings::{from_yaml_file, resolve_relative},
        time::{local_timestamp, TimePeriod},
    },
};
use chrono::{DateTime, Local};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{
    ffi::OsStr,
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{info, warn};

/// Column names of the stress test csv, in field order of [`CommandRecord`].
pub const STRESS_CSV_HEADER: [&str; 5] = [
    "command_index",
    "timestamp_sent",
    "period",
    "payload_sent",
    "target_states_summary",
];

/// Configuration for the stress test.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone)]
pub struct StressBenchmarkConfig {
    /// Path to the relay board config, relative to this file.
    device_config_file: PathBuf,
    /// Number of commands to send.
    num_commands: u32,
    /// Pause after each command, in milliseconds.
    send_interval_ms: u64,
    /// Where the log of sent commands is written.
    output_path: PathBuf,
}

impl StressBenchmarkConfig {
    /// Stress test configuration sending 50 commands, one every 500 ms.
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
            num_commands: 50,
            send_interval_ms: 500,
            output_path: (&output_path).into(),
        }
    }

    /// Set the number of commands.
    ///
    /// * `num_commands`: commands to send.
    pub fn with_num_commands(mut self, num_commands: u32) -> Self {
        self.num_commands = num_commands;
        self
    }

    /// Set the pause after each command.
    ///
    /// * `send_interval_ms`: milliseconds.
    pub fn with_send_interval(mut self, send_interval_ms: u64) -> Self {
        self.send_interval_ms = send_interval_ms;
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
        Ok(config)
    }
}

/// One command sent during the stress test.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct CommandRecord {
    /// Position of the command in the run, from 1.
    pub command_index: u32,
    /// When the command was handed to the broker.
    #[serde(serialize_with = "local_timestamp")]
    pub timestamp_sent: DateTime<Local>,
    /// Time of day label for `timestamp_sent`.
    pub period: TimePeriod,
    /// Json exactly as published.
    pub payload_sent: String,
    /// Target states, i.e. `{1: true, 2: false}`.
    pub target_states_summary: String,
}

/// Logs everything the board reports during a stress test. Reports do
/// not influence the send loop, they are only counted.
#[derive(Default)]
pub struct StatusObserver {
    received: AtomicUsize,
}

impl StatusObserver {
    /// Number of status messages seen so far.
    pub fn received(&self) -> usize {
        self.received.load(Ordering::Relaxed)
    }
}

impl StatusHandler for StatusObserver {
    fn handle_status(&self, topic: &str, payload: &[u8]) {
        self.received.fetch_add(1, Ordering::Relaxed);
        info!(topic, payload = %String::from_utf8_lossy(payload), "Status received");
    }
}

/// Component that floods the control topic with random commands.
pub struct StressBenchmark {
    /// Board under test.
    board: RelayBoard,
    /// Number of commands to send.
    num_commands: u32,
    /// Pause after each command.
    send_interval: Duration,
    /// Csv destination.
    output_path: PathBuf,
    /// Receives the status topic while the test runs.
    observer: Arc<StatusObserver>,
}

impl StressBenchmark {
    /// Create a stress test for `board`.
    ///
    /// * `board`: relay board under test.
    /// * `config`: test parameters.
    pub fn new(board: RelayBoard, config: &StressBenchmarkConfig) -> Self {
        Self {
            board,
            num_commands: config.num_commands,
            send_interval: Duration::from_millis(config.send_interval_ms),
            output_path: config.output_path.clone(),
            observer: Arc::new(StatusObserver::default()),
        }
    }

    /// Create the stress test and its relay board from config files.
    ///
    /// * `filepath`: path to the stress test config.
    pub fn from_config_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, KarisError> {
        let config = StressBenchmarkConfig::from_file(filepath)?;
        Self::from_config(&config)
    }

    /// Create the stress test from an already loaded config.
    ///
    /// * `config`: test parameters.
    pub fn from_config(config: &StressBenchmarkConfig) -> Result<Self, KarisError> {
        let board = RelayBoard::from_config_file(&config.device_config_file)?;
        Ok(Self::new(board, config))
    }

    /// Board under test.
    pub fn board(&self) -> &RelayBoard {
        &self.board
    }

    /// Observer attached to the status topic.
    pub fn observer(&self) -> Arc<StatusObserver> {
        self.observer.clone()
    }
}

/// Unit struct for adding controlling behaviour to the stress test.
pub struct StressBenchmarkController;

impl StressBenchmarkController {
    /// Connect to the broker, send every command, disconnect and save the
    /// log of sent commands.
    ///
    /// * `benchmark`: component
    pub async fn start(benchmark: StressBenchmark) -> Result<Vec<CommandRecord>, KarisError> {
        let board = benchmark.board();
        let connection = BrokerConnection::connect(
            board.broker(),
            &board.client_id("stress"),
            &board.status_topic(),
            benchmark.observer(),
        )
        .await?;

        info!(
            commands = benchmark.num_commands,
            interval_ms = benchmark.send_interval.as_millis() as u64,
            "Starting stress test"
        );
        let mut rng = StdRng::from_entropy();
        let records = Self::run(&benchmark, &connection, &mut rng).await;
        connection.disconnect().await;

        write_records(&benchmark.output_path, &STRESS_CSV_HEADER, &records)?;
        info!(
            sent = records.len(),
            status_received = benchmark.observer.received(),
            "Stress test finished"
        );
        Ok(records)
    }

    /// Send every command through `publisher`. A failed publish is logged
    /// and still recorded, the run carries on.
    ///
    /// * `benchmark`: component
    /// * `publisher`: where commands are sent.
    /// * `rng`: source of the random relay targets.
    pub async fn run<P, R>(
        benchmark: &StressBenchmark,
        publisher: &P,
        rng: &mut R,
    ) -> Vec<CommandRecord>
    where
        P: CommandPublisher + ?Sized,
        R: Rng + ?Sized,
    {
        let topic = benchmark.board.control_topic();
        let mut records = Vec::with_capacity(benchmark.num_commands as usize);

        for command_index in 1..=benchmark.num_commands {
            let command = benchmark.board.random_command(rng);
            let payload_sent = match serde_json::to_string(&command) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(command_index, error = %e, "Failed to encode command, skipping");
                    continue;
                }
            };

            let timestamp_sent = Local::now();
            match publisher
                .publish(&topic, payload_sent.clone().into_bytes())
                .await
            {
                Ok(()) => info!(
                    command_index,
                    of = benchmark.num_commands,
                    sent_at = %timestamp_sent.format("%H:%M:%S%.3f"),
                    "Command published"
                ),
                Err(e) => warn!(command_index, error = %e, "Failed to publish command"),
            }

            records.push(CommandRecord {
                command_index,
                timestamp_sent,
                period: TimePeriod::of(&timestamp_sent),
                payload_sent,
                target_states_summary: command.summary(),
            });

            tokio::time::sleep(benchmark.send_interval).await;
        }
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        devices::hardware::relay_board::{BrokerConfig, RelayBoardConfig},
        messages::control::relay::RelayControlMessage,
        test_file_path,
        utils::time::TIMESTAMP_FORMAT,
    };
    use async_trait::async_trait;
    use serial_test::serial;
    use std::{path::Path, sync::Mutex};

    /// Collects every published payload, optionally failing every other one.
    #[derive(Default)]
    struct RecordingPublisher {
        payloads: Mutex<Vec<(String, Vec<u8>)>>,
        fail_even: bool,
    }

    #[async_trait]
    impl CommandPublisher for RecordingPublisher {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), KarisError> {
            let mut payloads = self.payloads.lock().unwrap();
            payloads.push((topic.to_owned(), payload));
            if self.fail_even && payloads.len() % 2 == 0 {
                return Err(KarisError::InvalidConfig(String::from("broker offline")));
            }
            Ok(())
        }
    }

    fn benchmark(num_commands: u32) -> StressBenchmark {
        let board_config = RelayBoardConfig::new(
            String::from("esp32_6relay"),
            String::from("abc"),
            BrokerConfig::new(String::from("localhost"), 1883),
        )
        .add_relay(1)
        .add_relay(2)
        .add_relay(3);
        let config = StressBenchmarkConfig::new("unused.yaml", "stress.csv")
            .with_num_commands(num_commands)
            .with_send_interval(5);
        StressBenchmark::new(RelayBoard::new(board_config), &config)
    }

    #[tokio::test]
    async fn test_every_command_is_published_and_recorded() {
        let benchmark = benchmark(4);
        let publisher = RecordingPublisher::default();
        let mut rng = StdRng::seed_from_u64(9);

        let records = StressBenchmarkController::run(&benchmark, &publisher, &mut rng).await;

        let payloads = publisher.payloads.lock().unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(payloads.len(), 4);
        for (record, (topic, payload)) in records.iter().zip(payloads.iter()) {
            assert_eq!(topic, "irrigation/esp32_6relay/control");
            assert_eq!(record.payload_sent.as_bytes(), payload.as_slice());
            let command: RelayControlMessage = serde_json::from_slice(payload).unwrap();
            assert_eq!(record.target_states_summary, command.summary());
            assert_eq!(record.period, TimePeriod::of(&record.timestamp_sent));
        }
        let indices: Vec<u32> = records.iter().map(|r| r.command_index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_publish_failures_do_not_stop_the_run() {
        let benchmark = benchmark(5);
        let publisher = RecordingPublisher {
            fail_even: true,
            ..Default::default()
        };
        let mut rng = StdRng::seed_from_u64(10);

        let records = StressBenchmarkController::run(&benchmark, &publisher, &mut rng).await;

        assert_eq!(records.len(), 5);
    }

    #[test]
    fn test_observer_counts_status_messages() {
        let observer = StatusObserver::default();
        observer.handle_status("irrigation/esp32_6relay/status", br#"{"relays": []}"#);
        observer.handle_status("irrigation/esp32_6relay/status", b"\xff not utf8");
        assert_eq!(observer.received(), 2);
    }

    #[test]
    #[serial]
    fn test_read_stress_config_file() {
        let read_config = StressBenchmarkConfig::from_file(test_file_path!(
            "/config/components/benchmark/stress.yaml"
        ))
        .expect("Failed to read stress config");

        let expected = StressBenchmarkConfig::new(
            Path::new(env!("CARGO_MANIFEST_DIR"))
                .join("config/components/benchmark/../../devices/esp32_6relay.yaml"),
            "stress_test_commands_sent_log.csv",
        );
        assert_eq!(read_config, expected, "Failed to read stress config");

        let benchmark =
            StressBenchmark::from_config(&read_config).expect("Failed to build stress test");
        assert_eq!(benchmark.board().relay_ids(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    #[serial]
    fn test_write_command_records_csv() {
        let path = std::env::temp_dir().join(format!(
            "karis_stress_{}.csv",
            uuid::Uuid::new_v4().simple()
        ));
        let record = CommandRecord {
            command_index: 1,
            timestamp_sent: Local::now(),
            period: TimePeriod::Morning,
            payload_sent: String::from(r#"{"api_key":"abc","relays":[{"id":1,"state":true}]}"#),
            target_states_summary: String::from("{1: true}"),
        };

        write_records(&path, &STRESS_CSV_HEADER, &[record.clone()]).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        let expected = format!(
            "command_index,timestamp_sent,period,payload_sent,target_states_summary\n\
             1,{},morning,\"{{\"\"api_key\"\":\"\"abc\"\",\"\"relays\"\":[{{\"\"id\"\":1,\"\"state\"\":true}}]}}\",{{1: true}}\n",
            record.timestamp_sent.format(TIMESTAMP_FORMAT)
        );
        assert_eq!(written, expected);
        std::fs::remove_file(path).ok();
    }
}
