use crate::{
    error::KarisError,
    messages::control::relay::{RelayControlMessage, RelayId},
    utils::settings::from_yaml_file,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeSet, ffi::OsStr};
use uuid::Uuid;

/// Keep alive interval used when the config does not set one.
pub const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

/// All topics for a device hang off this root, followed by the device id.
const TOPIC_ROOT: &str = "irrigation";

fn default_keep_alive() -> u64 {
    DEFAULT_KEEP_ALIVE_SECS
}

/// Address of the MQTT broker the relay board reports to.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone)]
pub struct BrokerConfig {
    /// Host name or IP address of the broker.
    pub host: String,
    /// TCP port, usually 1883.
    pub port: u16,
    /// MQTT keep alive in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

impl BrokerConfig {
    /// Broker configuration with the default keep alive.
    ///
    /// * `host`: broker host.
    /// * `port`: broker port.
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            keep_alive_secs: DEFAULT_KEEP_ALIVE_SECS,
        }
    }
}

/// Configuration for a single relay board. One file per physical
/// device; the benchmark configs point at it by path.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone)]
pub struct RelayBoardConfig {
    /// Device id as flashed into the firmware, used to derive the topics.
    device_id: String,
    /// Api key the firmware checks on every control message.
    api_key: String,
    /// Broker the device is connected to.
    broker: BrokerConfig,
    /// Relays to exercise, numbered from 1.
    relay_ids: BTreeSet<RelayId>,
    /// Optional duration in milliseconds attached to ON commands. The
    /// firmware switches the relay back off once it expires.
    on_duration_ms: Option<u64>,
}

impl RelayBoardConfig {
    /// Relay board configuration with no relays.
    ///
    /// * `device_id`: id of the device, i.e. esp32_6relay.
    /// * `api_key`: api key for control messages.
    /// * `broker`: broker the device is connected to.
    pub fn new(device_id: String, api_key: String, broker: BrokerConfig) -> Self {
        Self {
            device_id,
            api_key,
            broker,
            relay_ids: BTreeSet::new(),
            on_duration_ms: None,
        }
    }

    /// Add a relay to the set exercised by the benchmarks.
    ///
    /// * `relay_id`: relay channel, from 1.
    pub fn add_relay(mut self, relay_id: RelayId) -> Self {
        self.relay_ids.insert(relay_id);
        self
    }

    /// Attach a duration to every ON command.
    ///
    /// * `on_duration_ms`: milliseconds before the firmware turns the relay off.
    pub fn with_on_duration(mut self, on_duration_ms: u64) -> Self {
        self.on_duration_ms = Some(on_duration_ms);
        self
    }

    /// Create a new `RelayBoardConfig` by reading parameters stored in a file.
    ///
    /// * `filepath`: filepath to the stored parameters.
    pub fn from_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, KarisError> {
        let config = from_yaml_file::<Self, F>(filepath)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the config describes a device that can be commanded.
    pub fn validate(&self) -> Result<(), KarisError> {
        if self.device_id.is_empty() {
            return Err(KarisError::InvalidConfig(String::from("device_id is empty")));
        }
        if self.relay_ids.is_empty() {
            return Err(KarisError::InvalidConfig(String::from(
                "at least one relay id is required",
            )));
        }
        if self.relay_ids.contains(&0) {
            return Err(KarisError::InvalidConfig(String::from(
                "relay ids are numbered from 1",
            )));
        }
        Ok(())
    }
}

/// Wrapper around the relay board configuration that knows how the
/// firmware lays out its topics and what a control message looks like.
pub struct RelayBoard {
    /// Unique identifier for this run against the board, used in the client id.
    uuid: Uuid,
    /// Config used to create the board.
    config: RelayBoardConfig,
}

impl RelayBoard {
    /// Create a new board by consuming a `RelayBoardConfig`.
    ///
    /// * `config`: Set of config parameters.
    pub fn new(config: RelayBoardConfig) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            config,
        }
    }

    /// Create a new board by reading the config parameters from a file.
    ///
    /// * `filepath`: path to config file.
    pub fn from_config_file<F: AsRef<OsStr>>(filepath: F) -> Result<Self, KarisError> {
        Ok(Self::new(RelayBoardConfig::from_file(filepath)?))
    }

    /// Device id of the board.
    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    /// Topic the board listens to for commands.
    pub fn control_topic(&self) -> String {
        format!("{TOPIC_ROOT}/{}/control", self.config.device_id)
    }

    /// Topic the board publishes relay states on.
    pub fn status_topic(&self) -> String {
        format!("{TOPIC_ROOT}/{}/status", self.config.device_id)
    }

    /// Broker the board is connected to.
    pub fn broker(&self) -> &BrokerConfig {
        &self.config.broker
    }

    /// Relays under test in ascending order.
    pub fn relay_ids(&self) -> Vec<RelayId> {
        self.config.relay_ids.iter().copied().collect()
    }

    /// MQTT client id for a tool talking to this board. Ids must be unique
    /// per broker so the run uuid is appended.
    ///
    /// * `tool`: short name of the tool, i.e. latency.
    pub fn client_id(&self, tool: &str) -> String {
        let uuid = self.uuid.simple().to_string();
        format!("karis_{tool}_{}", &uuid[..8])
    }

    /// Build a control message with a random target for every relay under test.
    ///
    /// * `rng`: random source.
    pub fn random_command<R: Rng + ?Sized>(&self, rng: &mut R) -> RelayControlMessage {
        RelayControlMessage::randomised(
            &self.config.api_key,
            &self.relay_ids(),
            self.config.on_duration_ms,
            rng,
        )
    }
}
