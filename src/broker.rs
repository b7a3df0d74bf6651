use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

/// The uplink to the external message broker.
///
/// `service` pumps the client's own event loop and must be called
/// regularly; it never blocks beyond draining whatever is ready.
/// `connected` reflects the link state as of the last `connect`/`service`.
#[async_trait]
pub trait BrokerLink: Send + 'static {
    async fn connect(&mut self, client_id: &str) -> Result<()>;
    async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()>;
    fn connected(&self) -> bool;
    async fn service(&mut self) -> Result<()>;
}

/// Generates a broker client id with a short random suffix, so a rebooted
/// gateway never collides with its previous half-open session.
pub fn client_id(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &suffix[..4])
}

#[cfg(feature = "mqtt")]
pub use mqtt::MqttLink;

#[cfg(feature = "mqtt")]
mod mqtt {
    use super::BrokerLink;
    use crate::error::{GatewayError, Result};
    use async_trait::async_trait;
    use bytes::Bytes;
    use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS};
    use tokio::time::{self, Duration, Instant};
    use tracing::{debug, warn};

    const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    const KEEP_ALIVE: Duration = Duration::from_secs(30);
    /// Upper bound on events drained per `service` call; the rest waits for
    /// the next tick.
    const SERVICE_EVENTS_PER_CALL: usize = 16;

    /// MQTT-backed broker link over rumqttc.
    ///
    /// Publishes at QoS 0 to match the at-most-once contract of the rest of
    /// the pipeline. The client and its event loop are rebuilt on every
    /// `connect`, dropping any half-open previous session.
    pub struct MqttLink {
        host: String,
        port: u16,
        client: Option<AsyncClient>,
        eventloop: Option<EventLoop>,
        connected: bool,
    }

    impl MqttLink {
        pub fn new(host: impl Into<String>, port: u16) -> Self {
            Self { host: host.into(), port, client: None, eventloop: None, connected: false }
        }

        fn disconnect(&mut self) {
            self.client = None;
            self.eventloop = None;
            self.connected = false;
        }
    }

    #[async_trait]
    impl BrokerLink for MqttLink {
        async fn connect(&mut self, client_id: &str) -> Result<()> {
            self.disconnect();
            let mut options = MqttOptions::new(client_id, &self.host, self.port);
            options.set_keep_alive(KEEP_ALIVE);
            let (client, mut eventloop) = AsyncClient::new(options, 16);

            let deadline = Instant::now() + CONNECT_TIMEOUT;
            loop {
                let event = match time::timeout_at(deadline, eventloop.poll()).await {
                    Ok(Ok(event)) => event,
                    Ok(Err(e)) => return Err(GatewayError::Broker(e.to_string())),
                    Err(_) => return Err(GatewayError::Broker("connect timed out".to_string())),
                };
                if let Event::Incoming(Packet::ConnAck(ack)) = event {
                    if ack.code == ConnectReturnCode::Success {
                        self.client = Some(client);
                        self.eventloop = Some(eventloop);
                        self.connected = true;
                        return Ok(());
                    }
                    return Err(GatewayError::Broker(format!("connection refused: {:?}", ack.code)));
                }
            }
        }

        async fn publish(&mut self, topic: &str, payload: Bytes) -> Result<()> {
            let client = self
                .client
                .as_ref()
                .ok_or_else(|| GatewayError::Broker("not connected".to_string()))?;
            client
                .publish(topic, QoS::AtMostOnce, false, payload)
                .await
                .map_err(|e| GatewayError::Broker(e.to_string()))
        }

        fn connected(&self) -> bool {
            self.connected
        }

        async fn service(&mut self) -> Result<()> {
            let Some(eventloop) = self.eventloop.as_mut() else {
                return Ok(());
            };
            for _ in 0..SERVICE_EVENTS_PER_CALL {
                match time::timeout(Duration::ZERO, eventloop.poll()).await {
                    Ok(Ok(event)) => {
                        if let Event::Incoming(Packet::Disconnect) = event {
                            debug!("broker sent disconnect");
                            self.disconnect();
                            return Ok(());
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(error = %e, "broker event loop failed");
                        self.disconnect();
                        return Err(GatewayError::Broker(e.to_string()));
                    }
                    // Nothing ready; the connection is simply quiet.
                    Err(_) => return Ok(()),
                }
            }
            Ok(())
        }
    }
}
