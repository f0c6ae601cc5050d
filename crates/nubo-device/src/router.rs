use std::sync::{Arc, Mutex, MutexGuard, Weak};

use nubo::channel::matches;
use nubo::message::Message;

use tracing::{debug, warn};

use crate::executor::CommandExecutor;

/// A receiver of the messages delivered by a [`Router`].
pub trait MessageListener: Send + Sync {
    /// Handles a message whose channel matches one of the listener patterns.
    ///
    /// It is always invoked on the executor worker.
    fn message_received(&self, message: Message);
}

struct Registration {
    pattern: String,
    listener: Weak<dyn MessageListener>,
}

#[derive(Default)]
struct Table {
    registrations: Vec<Registration>,
    subscriptions: Vec<String>,
}

/// Routes inbound messages to the registered [`MessageListener`]s.
///
/// Patterns are tried in registration order and the first one matching a
/// channel selects the listener. Listeners are held weakly: a dropped
/// listener silently stops receiving messages.
pub struct Router {
    table: Mutex<Table>,
    executor: CommandExecutor,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("subscriptions", &self.subscriptions())
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Creates a [`Router`] running the listeners on the given
    /// [`CommandExecutor`].
    #[must_use]
    #[inline]
    pub fn new(executor: CommandExecutor) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            executor,
        }
    }

    /// Registers a listener for a set of channel patterns.
    pub fn register<L, I, S>(&self, listener: &Arc<L>, patterns: I)
    where
        L: MessageListener + 'static,
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let weak = Arc::downgrade(listener);
        let weak: Weak<dyn MessageListener> = weak;

        let mut table = self.lock();
        for pattern in patterns {
            let pattern = pattern.into();
            if !table.subscriptions.contains(&pattern) {
                table.subscriptions.push(pattern.clone());
            }
            table.registrations.push(Registration {
                pattern,
                listener: Weak::clone(&weak),
            });
        }
    }

    /// Returns the de-duplicated union of all registered patterns.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock().subscriptions.clone()
    }

    /// Delivers an inbound message to the listener of the first matching
    /// pattern.
    ///
    /// Returns `false` when no pattern matches or the executor rejected the
    /// delivery.
    pub fn deliver(&self, channel: &str, payload: &[u8]) -> bool {
        let listener = {
            let table = self.lock();
            table
                .registrations
                .iter()
                .find(|registration| matches(&registration.pattern, channel))
                .map(|registration| Weak::clone(&registration.listener))
        };

        let Some(listener) = listener else {
            debug!("No listener for channel `{channel}`, message dropped");
            return false;
        };

        let message = Message::new(channel, payload);
        self.executor.submit(move || match listener.upgrade() {
            Some(listener) => listener.message_received(message),
            None => debug!("Listener for `{}` is gone", message.channel),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        match self.table.lock() {
            Ok(table) => table,
            Err(poisoned) => {
                warn!("Router table poisoned, recovering it");
                poisoned.into_inner()
            }
        }
    }
}
