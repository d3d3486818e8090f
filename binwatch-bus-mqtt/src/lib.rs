//! MQTT transport for binwatch built on `rumqttc`.
//!
//! [`MqttBus`] publishes with at-least-once delivery. [`MqttEventLoop`]
//! drives the connection, re-subscribes on every reconnect, and hands
//! inbound publishes to the caller as [`RawMessage`]s.

use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet, Publish, QoS,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use binwatch_core::ports::{BusPublisher, PublishError};
use binwatch_core::wire::{INBOUND_FILTERS, PRESENCE_TOPIC, RawMessage};

const ONLINE: &[u8] = b"online";
const OFFLINE: &[u8] = b"offline";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
/// Broker connection settings.
pub struct MqttSettings {
    /// Broker host name or address.
    pub host: String,
    /// Broker TCP port.
    pub port: u16,
    /// Client identifier; kept stable so the broker can resume the session.
    pub client_id: String,
    /// Optional user name; used only together with a password.
    pub username: Option<String>,
    /// Optional password.
    pub password: Option<String>,
    /// Keep-alive interval in seconds.
    pub keep_alive_secs: u64,
    /// Capacity of the client request queue.
    pub request_capacity: usize,
    /// Pause after a connection error before polling again, in milliseconds.
    pub reconnect_delay_ms: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 1883,
            client_id: "binwatch".to_owned(),
            username: None,
            password: None,
            keep_alive_secs: 30,
            request_capacity: 64,
            reconnect_delay_ms: 2_000,
        }
    }
}

impl MqttSettings {
    /// Client options including the retained offline last will.
    #[must_use]
    pub fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(Duration::from_secs(self.keep_alive_secs.max(5)));
        options.set_clean_session(false);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        options.set_last_will(LastWill::new(
            PRESENCE_TOPIC,
            OFFLINE.to_vec(),
            QoS::AtLeastOnce,
            true,
        ));
        options
    }
}

#[derive(Clone)]
/// Publishing half of the MQTT connection.
pub struct MqttBus {
    client: AsyncClient,
}

impl MqttBus {
    /// Create the client and its event loop. No I/O happens until the
    /// event loop is run.
    #[must_use]
    pub fn connect(settings: &MqttSettings) -> (Self, MqttEventLoop) {
        let (client, eventloop) =
            AsyncClient::new(settings.options(), settings.request_capacity.max(1));
        let event_loop = MqttEventLoop {
            client: client.clone(),
            eventloop,
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
        };
        (Self { client }, event_loop)
    }

    /// Publish the retained presence marker.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Bus`] when the request cannot be queued.
    pub async fn announce(&self, online: bool) -> Result<(), PublishError> {
        let payload = if online { ONLINE } else { OFFLINE };
        self.publish(PRESENCE_TOPIC, payload.to_vec(), true).await
    }

    /// Ask the broker to close the connection.
    ///
    /// # Errors
    ///
    /// Returns [`PublishError::Bus`] when the request cannot be queued.
    pub async fn disconnect(&self) -> Result<(), PublishError> {
        self.client.disconnect().await.map_err(bus_error)
    }
}

#[async_trait]
impl BusPublisher for MqttBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), PublishError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, retain, payload)
            .await
            .map_err(bus_error)
    }
}

/// Connection driver. Must be polled for any publish to reach the broker.
pub struct MqttEventLoop {
    client: AsyncClient,
    eventloop: EventLoop,
    reconnect_delay: Duration,
}

impl MqttEventLoop {
    /// Poll the connection until `cancel` fires or a requested disconnect
    /// has been sent, forwarding inbound publishes to `sink`.
    ///
    /// The sink is unbounded so that a slow consumer never stalls the loop
    /// that also carries outbound publishes.
    pub async fn run(self, sink: mpsc::UnboundedSender<RawMessage>, cancel: CancellationToken) {
        let Self {
            client,
            mut eventloop,
            reconnect_delay,
        } = self;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if sink.send(to_raw(&publish)).is_err() {
                            debug!("inbound consumer gone, stopping event loop");
                            break;
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => on_connected(&client).await,
                    Ok(Event::Incoming(Packet::Disconnect)) => warn!("mqtt disconnected by broker"),
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        error!(error = %err, "mqtt connection error");
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = sleep(reconnect_delay) => {}
                        }
                    }
                },
            }
        }
        info!("mqtt event loop stopped");
    }
}

/// Subscriptions do not survive a lost session, so they are renewed on
/// every connection acknowledgement.
async fn on_connected(client: &AsyncClient) {
    info!("mqtt connected");
    for filter in INBOUND_FILTERS {
        if let Err(err) = client.subscribe(filter, QoS::AtLeastOnce).await {
            error!(filter, error = %err, "subscribe failed");
        }
    }
    if let Err(err) = client
        .publish(PRESENCE_TOPIC, QoS::AtLeastOnce, true, ONLINE.to_vec())
        .await
    {
        warn!(error = %err, "presence announcement failed");
    }
}

/// Convert an inbound publish into the engine's message form.
#[must_use]
pub fn to_raw(publish: &Publish) -> RawMessage {
    RawMessage::new(publish.topic.clone(), publish.payload.to_vec())
}

fn bus_error(err: rumqttc::ClientError) -> PublishError {
    PublishError::Bus(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_carry_retained_offline_will() {
        let settings = MqttSettings {
            host: "broker.local".to_owned(),
            port: 8883,
            ..MqttSettings::default()
        };
        let options = settings.options();

        assert_eq!(options.broker_address(), ("broker.local".to_owned(), 8883));
        assert_eq!(options.keep_alive(), Duration::from_secs(30));
        assert!(!options.clean_session(), "session must survive reconnects");

        let will = options.last_will().expect("last will configured");
        assert_eq!(will.topic, PRESENCE_TOPIC);
        assert_eq!(will.message.as_ref(), OFFLINE);
        assert!(will.retain, "presence must be retained");
    }

    #[test]
    fn credentials_require_both_parts() {
        let partial = MqttSettings {
            username: Some("ops".to_owned()),
            ..MqttSettings::default()
        };
        assert_eq!(partial.options().credentials(), None);

        let full = MqttSettings {
            password: Some("secret".to_owned()),
            ..partial
        };
        assert_eq!(
            full.options().credentials(),
            Some(("ops".to_owned(), "secret".to_owned()))
        );
    }

    #[test]
    fn keep_alive_has_a_floor() {
        let settings = MqttSettings {
            keep_alive_secs: 0,
            ..MqttSettings::default()
        };
        assert_eq!(settings.options().keep_alive(), Duration::from_secs(5));
    }

    #[test]
    fn inbound_publish_becomes_raw_message() {
        let publish = Publish::new("bins/B1/fill", QoS::AtLeastOnce, b"{}".to_vec());
        let raw = to_raw(&publish);

        assert_eq!(raw, RawMessage::new("bins/B1/fill", b"{}".to_vec()));
    }

    #[tokio::test]
    async fn publishes_are_queued_on_the_client() {
        let (bus, _event_loop) = MqttBus::connect(&MqttSettings::default());
        bus.publish("bins/B1/status", b"{}".to_vec(), true)
            .await
            .expect("request queued while offline");
        bus.announce(true).await.expect("presence queued");
    }
}
