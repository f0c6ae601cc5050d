use nubo::message::Message;

use rumqttc::v5::{AsyncClient, mqttbytes::QoS};

use tracing::{debug, error};

/// A publish/subscribe connection with the platform.
pub trait Transport: Send + Sync {
    /// Publishes a message.
    ///
    /// Returns `false` when the message could not be handed to the
    /// connection.
    fn publish(&self, message: Message) -> bool;

    /// Subscribes to a set of channel patterns.
    ///
    /// Returns `false` when at least one subscription failed.
    fn subscribe(&self, patterns: &[String]) -> bool;
}

/// A [`Transport`] over an `MQTT` v5 client.
///
/// Requests are queued on the client without waiting, so the transport can
/// be used from any thread.
#[derive(Debug, Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    qos: QoS,
}

impl MqttTransport {
    /// Creates a [`MqttTransport`] publishing and subscribing with
    /// at-least-once delivery.
    #[must_use]
    #[inline]
    pub fn new(client: AsyncClient) -> Self {
        Self {
            client,
            qos: QoS::AtLeastOnce,
        }
    }

    /// Sets the quality of service of publishes and subscriptions.
    #[must_use]
    #[inline]
    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }
}

impl Transport for MqttTransport {
    fn publish(&self, message: Message) -> bool {
        let Message { channel, payload } = message;
        debug!("Publishing {} bytes on `{channel}`", payload.len());

        match self.client.try_publish(channel.as_str(), self.qos, false, payload) {
            Ok(()) => true,
            Err(e) => {
                error!("Impossible to publish on `{channel}`: {e}");
                false
            }
        }
    }

    fn subscribe(&self, patterns: &[String]) -> bool {
        let mut subscribed = true;
        for pattern in patterns {
            if let Err(e) = self.client.try_subscribe(pattern.as_str(), self.qos) {
                error!("Impossible to subscribe to `{pattern}`: {e}");
                subscribed = false;
            }
        }
        subscribed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;

    use nubo::message::Message;

    use super::Transport;

    // A transport recording every outbound message.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) published: Mutex<Vec<Message>>,
        pub(crate) subscriptions: Mutex<Vec<String>>,
    }

    impl RecordingTransport {
        // Returns the JSON payloads published on a channel.
        pub(crate) fn published_on(&self, channel: &str) -> Vec<serde_json::Value> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .filter(|message| message.channel == channel)
                .map(|message| serde_json::from_slice(&message.payload).unwrap())
                .collect()
        }

        pub(crate) fn clear(&self) {
            self.published.lock().unwrap().clear();
        }
    }

    impl Transport for RecordingTransport {
        fn publish(&self, message: Message) -> bool {
            self.published.lock().unwrap().push(message);
            true
        }

        fn subscribe(&self, patterns: &[String]) -> bool {
            self.subscriptions
                .lock()
                .unwrap()
                .extend(patterns.iter().cloned());
            true
        }
    }

    #[test]
    fn recording_transport() {
        let transport = RecordingTransport::default();

        assert!(transport.publish(Message::new("a/b", b"{\"x\":1}".as_slice())));
        assert!(transport.publish(Message::new("a/c", b"2".as_slice())));
        assert!(transport.subscribe(&["a/#".into()]));

        assert_eq!(
            transport.published_on("a/b"),
            vec![serde_json::json!({ "x": 1 })]
        );
        assert_eq!(*transport.subscriptions.lock().unwrap(), ["a/#"]);
    }
}
