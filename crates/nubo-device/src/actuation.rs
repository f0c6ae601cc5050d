use std::sync::Arc;

use nubo::actuator::{ActuationRequest, ActuatorStatus};
use nubo::channel::Channels;
use nubo::message::{Capability, Command, Message, decode_for};

use tracing::{debug, error, warn};

use crate::router::MessageListener;
use crate::transport::Transport;

/// Applies the values requested by the platform to the device actuators.
pub trait ActuationHandler: Send + Sync {
    /// Sets the actuator identified by `reference` to `value`.
    fn handle_actuation(&self, reference: &str, value: &str);
}

impl<F> ActuationHandler for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn handle_actuation(&self, reference: &str, value: &str) {
        self(reference, value);
    }
}

/// Reads the current status of the device actuators.
pub trait ActuatorStatusProvider: Send + Sync {
    /// Returns the status of the actuator identified by `reference`.
    fn actuator_status(&self, reference: &str) -> ActuatorStatus;
}

impl<F> ActuatorStatusProvider for F
where
    F: Fn(&str) -> ActuatorStatus + Send + Sync,
{
    fn actuator_status(&self, reference: &str) -> ActuatorStatus {
        self(reference)
    }
}

/// Handles the actuation requests of the platform.
///
/// A set request is applied through the [`ActuationHandler`], then the
/// actuator status is published. A status request only publishes the status.
pub struct ActuationListener {
    channels: Channels,
    handler: Arc<dyn ActuationHandler>,
    provider: Arc<dyn ActuatorStatusProvider>,
    transport: Arc<dyn Transport>,
}

impl std::fmt::Debug for ActuationListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActuationListener")
            .field("device_key", &self.channels.device_key())
            .finish_non_exhaustive()
    }
}

impl ActuationListener {
    /// Creates an [`ActuationListener`].
    #[must_use]
    #[inline]
    pub fn new(
        channels: Channels,
        handler: Arc<dyn ActuationHandler>,
        provider: Arc<dyn ActuatorStatusProvider>,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            channels,
            handler,
            provider,
            transport,
        }
    }

    /// Returns the channel patterns the listener listens to.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        vec![self.channels.actuation_pattern()]
    }

    /// Publishes the current status of an actuator.
    pub fn publish_status(&self, reference: &str) {
        let status = self.provider.actuator_status(reference);
        debug!("Actuator `{reference}` is {:?}", status.status);

        match Message::json(self.channels.actuator_status(reference), &status) {
            Ok(message) => {
                if !self.transport.publish(message) {
                    warn!("Status of actuator `{reference}` not published");
                }
            }
            Err(e) => error!("Impossible to encode the status of `{reference}`: {e}"),
        }
    }
}

impl MessageListener for ActuationListener {
    fn message_received(&self, message: Message) {
        let Some(Command::Actuation(command)) =
            decode_for(Capability::Actuation, &self.channels, &message)
        else {
            warn!("Unable to handle the message on `{}`", message.channel);
            return;
        };

        if let ActuationRequest::Set { value } = &command.request {
            debug!("Setting actuator `{}` to `{value}`", command.reference);
            self.handler.handle_actuation(&command.reference, value);
        }

        self.publish_status(&command.reference);
    }
}
