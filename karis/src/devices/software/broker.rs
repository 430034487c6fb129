use crate::{devices::hardware::relay_board::BrokerConfig, error::KarisError};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, QoS,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Capacity of the request queue between the client and the event loop.
const REQUEST_CAPACITY: usize = 64;
/// Pause before polling again after the event loop reports an error, the
/// next poll makes rumqttc reconnect.
const RECONNECT_DELAY: Duration = Duration::from_secs(1);
/// Time allowed for the event loop to flush the disconnect.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives every message published on the subscribed status topic.
/// Called from the event loop task, one message at a time, so
/// implementations must return quickly and never block on I/O.
pub trait StatusHandler: Send + Sync {
    /// Handle a single inbound message.
    ///
    /// * `topic`: topic the message arrived on.
    /// * `payload`: raw message bytes.
    fn handle_status(&self, topic: &str, payload: &[u8]);
}

/// Anything able to publish a payload to a topic. Implemented by the
/// broker connection and by in memory fakes in the tests.
#[async_trait]
pub trait CommandPublisher: Send + Sync {
    /// Publish `payload` on `topic`.
    ///
    /// * `topic`: destination topic.
    /// * `payload`: encoded message.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), KarisError>;
}

/// Live connection to the broker. The rumqttc event loop is driven by a
/// spawned task which forwards status messages to the registered handler.
pub struct BrokerConnection {
    /// Handle used to queue requests for the event loop.
    client: AsyncClient,
    /// Set before disconnecting so the event loop stops retrying.
    stop_signal: Arc<AtomicBool>,
    /// The spawned event loop task.
    join_handle: Option<JoinHandle<()>>,
}

impl BrokerConnection {
    /// Connect to the broker and subscribe to the status topic. Returns
    /// once the broker has acknowledged the connection, any failure before
    /// that point is returned as an error.
    ///
    /// * `config`: broker address.
    /// * `client_id`: MQTT client id, unique per broker.
    /// * `status_topic`: topic forwarded to `handler`.
    /// * `handler`: receives status messages.
    pub async fn connect(
        config: &BrokerConfig,
        client_id: &str,
        status_topic: &str,
        handler: Arc<dyn StatusHandler>,
    ) -> Result<Self, KarisError> {
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

        let (client, mut event_loop) = AsyncClient::new(options, REQUEST_CAPACITY);

        info!(host = %config.host, port = config.port, client_id, "Connecting to broker");
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code == ConnectReturnCode::Success {
                        break;
                    }
                    return Err(KarisError::ConnectionRefused {
                        host: config.host.clone(),
                        port: config.port,
                        code: ack.code,
                    });
                }
                Ok(_) => continue,
                Err(ConnectionError::ConnectionRefused(code)) => {
                    return Err(KarisError::ConnectionRefused {
                        host: config.host.clone(),
                        port: config.port,
                        code,
                    });
                }
                Err(source) => {
                    return Err(KarisError::Connection {
                        host: config.host.clone(),
                        port: config.port,
                        source,
                    });
                }
            }
        }
        info!("Connected to broker");

        client.subscribe(status_topic, QoS::AtMostOnce).await?;
        info!(topic = status_topic, "Subscribed to status topic");

        let stop_signal = Arc::new(AtomicBool::new(false));
        let join_handle = tokio::spawn(run_event_loop(
            event_loop,
            client.clone(),
            status_topic.to_owned(),
            handler,
            stop_signal.clone(),
        ));

        Ok(Self {
            client,
            stop_signal,
            join_handle: Some(join_handle),
        })
    }

    /// Send a disconnect to the broker and wait for the event loop to stop.
    pub async fn disconnect(mut self) {
        self.stop_signal.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.disconnect().await {
            warn!(error = %e, "Failed to queue disconnect");
        }
        if let Some(mut handle) = self.join_handle.take() {
            if tokio::time::timeout(DISCONNECT_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                warn!("Event loop did not stop after disconnect, aborting");
                handle.abort();
            }
        }
        info!("Disconnected from broker");
    }
}

impl Drop for BrokerConnection {
    fn drop(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl CommandPublisher for BrokerConnection {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), KarisError> {
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await?;
        Ok(())
    }
}

/// Drive the event loop until a disconnect is sent. Errors are logged and
/// the loop keeps polling, which lets rumqttc reconnect on its own.
///
/// * `event_loop`: rumqttc event loop for the connection.
/// * `client`: used to subscribe again after a reconnect.
/// * `status_topic`: only messages on this topic reach the handler.
/// * `handler`: receives status messages.
/// * `stop_signal`: set when the connection is being closed.
async fn run_event_loop(
    mut event_loop: EventLoop,
    client: AsyncClient,
    status_topic: String,
    handler: Arc<dyn StatusHandler>,
    stop_signal: Arc<AtomicBool>,
) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                if publish.topic == status_topic {
                    handler.handle_status(&publish.topic, &publish.payload);
                } else {
                    trace!(topic = %publish.topic, "Ignoring message on unexpected topic");
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                // Sessions are clean so subscriptions are lost on reconnect.
                info!("Reconnected to broker");
                if let Err(e) = client.try_subscribe(status_topic.clone(), QoS::AtMostOnce) {
                    warn!(error = %e, "Failed to subscribe after reconnect");
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                debug!(pkid = ack.pkid, "Subscription acknowledged");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent, stopping event loop");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if stop_signal.load(Ordering::SeqCst) {
                    break;
                }
                warn!(error = %e, "Broker connection error, retrying");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    /// CONNACK with return code 5, not authorized.
    const REFUSED_CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x05];

    #[derive(Default)]
    struct Recorder {
        payloads: Mutex<Vec<Vec<u8>>>,
    }

    impl StatusHandler for Recorder {
        fn handle_status(&self, _topic: &str, payload: &[u8]) {
            if let Ok(mut payloads) = self.payloads.lock() {
                payloads.push(payload.to_vec());
            }
        }
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_an_error() {
        let config = BrokerConfig::new(String::from("127.0.0.1"), 1);

        let result = BrokerConnection::connect(
            &config,
            "karis_test_unreachable",
            "irrigation/test/status",
            Arc::new(Recorder::default()),
        )
        .await;

        match result {
            Err(KarisError::Connection { host, port, .. }) => {
                assert_eq!(host, "127.0.0.1");
                assert_eq!(port, 1);
            }
            Err(e) => panic!("Unexpected error {e}"),
            Ok(_) => panic!("Connecting to a closed port should fail"),
        }
    }

    #[tokio::test]
    async fn test_refused_connack_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buffer = [0u8; 256];
            let _ = socket.read(&mut buffer).await;
            socket.write_all(&REFUSED_CONNACK).await.unwrap();
            // Hold the socket until the client hangs up.
            let _ = socket.read(&mut buffer).await;
        });
        let config = BrokerConfig::new(String::from("127.0.0.1"), port);

        let result = BrokerConnection::connect(
            &config,
            "karis_test_refused",
            "irrigation/test/status",
            Arc::new(Recorder::default()),
        )
        .await;

        assert!(
            matches!(
                result,
                Err(KarisError::ConnectionRefused {
                    code: ConnectReturnCode::NotAuthorized,
                    ..
                })
            ),
            "Refused CONNACK should be reported as a refusal"
        );
    }

    /// Requires the broker in the device config to be reachable.
    #[cfg(feature = "hardware_test")]
    #[tokio::test]
    async fn test_receives_own_publish_on_status_topic() {
        use crate::{devices::hardware::relay_board::RelayBoard, test_file_path};

        let board =
            RelayBoard::from_config_file(test_file_path!("/config/devices/esp32_6relay.yaml"))
                .unwrap();
        let recorder = Arc::new(Recorder::default());
        let topic = format!("{}/{}", board.status_topic(), board.client_id("hw_test"));
        let connection =
            BrokerConnection::connect(board.broker(), &board.client_id("hw_test"), &topic, recorder.clone())
                .await
                .unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        connection
            .publish(&topic, br#"{"relays": []}"#.to_vec())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(2)).await;
        connection.disconnect().await;

        assert_eq!(recorder.payloads.lock().unwrap().len(), 1);
    }
}
