use std::sync::{Arc, Mutex};
use std::time::Duration;

use nubo::channel::Channels;

use rumqttc::v5::{AsyncClient, Event, EventLoop, MqttOptions, mqttbytes::v5::Packet};

use tokio::task::JoinHandle;

use tokio_util::sync::CancellationToken;

use tracing::{debug, error, info, warn};

use crate::actuation::{ActuationHandler, ActuationListener, ActuatorStatusProvider};
use crate::error::{Error, ErrorKind, Result};
use crate::executor::{CommandExecutor, StopPolicy};
use crate::files::{FileManagement, FileManager};
use crate::repository::{FileRepository, InMemoryFileRepository};
use crate::router::Router;
use crate::transport::{MqttTransport, Transport};

// The capacity of the bounded channel between the client and its event loop.
const REQUESTS_CAPACITY: usize = 64;

// Time to wait before polling the event loop again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(2);

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 1883;
const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// A builder of [`Connector`]s.
///
/// Only the device key is mandatory. File management and actuation are
/// disabled unless configured.
pub struct ConnectorBuilder {
    device_key: String,
    password: Option<String>,
    host: String,
    port: u16,
    keep_alive: Duration,
    file_management: Option<FileManagement>,
    repository: Option<Arc<dyn FileRepository>>,
    stop_policy: StopPolicy,
    actuation: Option<(Arc<dyn ActuationHandler>, Arc<dyn ActuatorStatusProvider>)>,
}

impl std::fmt::Debug for ConnectorBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorBuilder")
            .field("device_key", &self.device_key)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("keep_alive", &self.keep_alive)
            .field("file_management", &self.file_management)
            .field("stop_policy", &self.stop_policy)
            .field("actuation", &self.actuation.is_some())
            .finish_non_exhaustive()
    }
}

impl ConnectorBuilder {
    /// Creates a [`ConnectorBuilder`] for the given device key.
    #[must_use]
    #[inline]
    pub fn new(device_key: impl Into<String>) -> Self {
        Self {
            device_key: device_key.into(),
            password: None,
            host: DEFAULT_HOST.into(),
            port: DEFAULT_PORT,
            keep_alive: DEFAULT_KEEP_ALIVE,
            file_management: None,
            repository: None,
            stop_policy: StopPolicy::default(),
            actuation: None,
        }
    }

    /// Sets the device password.
    #[must_use]
    #[inline]
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Sets the broker host.
    #[must_use]
    #[inline]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the broker port.
    #[must_use]
    #[inline]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the interval of the keep-alive pings sent to an idle broker.
    #[must_use]
    #[inline]
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Enables file management with the given [`FileManagement`] settings.
    #[must_use]
    #[inline]
    pub fn file_management(mut self, file_management: FileManagement) -> Self {
        self.file_management = Some(file_management);
        self
    }

    /// Sets the [`FileRepository`] of the stored files.
    ///
    /// File records are kept in memory when no repository is set.
    #[must_use]
    #[inline]
    pub fn file_repository(mut self, repository: Arc<dyn FileRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Sets the [`StopPolicy`] applied to the pending commands on disconnection.
    #[must_use]
    #[inline]
    pub fn stop_policy(mut self, stop_policy: StopPolicy) -> Self {
        self.stop_policy = stop_policy;
        self
    }

    /// Enables actuation with the given handler and status provider.
    #[must_use]
    #[inline]
    pub fn actuation(
        mut self,
        handler: Arc<dyn ActuationHandler>,
        provider: Arc<dyn ActuatorStatusProvider>,
    ) -> Self {
        self.actuation = Some((handler, provider));
        self
    }

    /// Builds the [`Connector`].
    ///
    /// # Errors
    ///
    /// Fails when the command executor cannot be started, or when the file
    /// management service cannot be initialized.
    pub fn build(self) -> Result<Connector> {
        let channels = Channels::new(self.device_key.as_str());
        let executor = CommandExecutor::with_policy(self.stop_policy)?;

        let mut options = MqttOptions::new(self.device_key.as_str(), self.host.as_str(), self.port);
        let _ = options.set_keep_alive(self.keep_alive);
        if let Some(password) = self.password {
            let _ = options.set_credentials(self.device_key.as_str(), password);
        }

        let (client, eventloop) = AsyncClient::new(options, REQUESTS_CAPACITY);
        let mqtt = Arc::new(MqttTransport::new(client.clone()));
        let transport: Arc<dyn Transport> = mqtt;

        let router = Arc::new(Router::new(executor.clone()));

        let file_manager = match self.file_management {
            Some(settings) => {
                let repository = match self.repository {
                    Some(repository) => repository,
                    None => {
                        let repository: Arc<dyn FileRepository> =
                            Arc::new(InMemoryFileRepository::new());
                        repository
                    }
                };

                let manager = FileManager::new(
                    channels.clone(),
                    settings,
                    executor.clone(),
                    Arc::clone(&transport),
                    repository,
                )?;
                router.register(&manager, manager.channels());
                info!("File management enabled in `{}`", manager.directory().display());
                Some(manager)
            }
            None => None,
        };

        let actuation = self.actuation.map(|(handler, provider)| {
            let listener = Arc::new(ActuationListener::new(
                channels.clone(),
                handler,
                provider,
                Arc::clone(&transport),
            ));
            router.register(&listener, listener.channels());
            listener
        });

        Ok(Connector {
            channels,
            executor,
            router,
            transport,
            client,
            eventloop: Mutex::new(Some(eventloop)),
            file_manager,
            actuation,
            cancellation_token: CancellationToken::new(),
            task: Mutex::new(None),
        })
    }
}

/// The connection of a device with its cloud platform.
///
/// Every inbound message is routed to the service listening on its channel,
/// and all services run on a single command executor, so commands are
/// handled one at a time in arrival order.
pub struct Connector {
    channels: Channels,
    executor: CommandExecutor,
    router: Arc<Router>,
    transport: Arc<dyn Transport>,
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    file_manager: Option<Arc<FileManager>>,
    actuation: Option<Arc<ActuationListener>>,
    cancellation_token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("device_key", &self.channels.device_key())
            .field("subscriptions", &self.router.subscriptions())
            .finish_non_exhaustive()
    }
}

impl Connector {
    /// Returns the device channels.
    #[must_use]
    #[inline]
    pub fn channels(&self) -> &Channels {
        &self.channels
    }

    /// Returns the channel patterns the device subscribes to.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.router.subscriptions()
    }

    /// Returns the [`Router`] of the inbound messages.
    #[must_use]
    #[inline]
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Returns the [`FileManager`], when file management is enabled.
    #[must_use]
    #[inline]
    pub fn file_manager(&self) -> Option<&Arc<FileManager>> {
        self.file_manager.as_ref()
    }

    /// Starts the connection with the broker.
    ///
    /// The connection runs as a task of the current `tokio` runtime. On
    /// every successful connection the device subscribes to its channels
    /// and publishes its file list.
    ///
    /// # Errors
    ///
    /// Fails when called outside a `tokio` runtime or when the connector
    /// has already been started.
    pub fn connect(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|e| {
            Error::new(
                ErrorKind::Transport,
                format!("A tokio runtime is needed to connect: {e}"),
            )
        })?;

        let eventloop = lock(&self.eventloop).take().ok_or_else(|| {
            Error::new(ErrorKind::Transport, "The connector has already been started")
        })?;

        let task = runtime.spawn(run_event_loop(
            eventloop,
            Arc::clone(&self.router),
            Arc::clone(&self.transport),
            self.file_manager.clone(),
            self.cancellation_token.clone(),
        ));
        *lock(&self.task) = Some(task);

        Ok(())
    }

    /// Publishes the list of stored files.
    pub fn publish_file_list(&self) {
        match &self.file_manager {
            Some(manager) => manager.publish_file_list(),
            None => warn!("File management disabled, no file list to publish"),
        }
    }

    /// Publishes the current status of an actuator.
    pub fn publish_actuator_status(&self, reference: &str) {
        let Some(actuation) = self.actuation.clone() else {
            warn!("Actuation disabled, no status for `{reference}`");
            return;
        };

        let reference = reference.to_string();
        if !self
            .executor
            .submit(move || actuation.publish_status(&reference))
        {
            warn!("Connector stopped, actuator status not published");
        }
    }

    /// Closes the connection and stops the command executor.
    ///
    /// Pending commands are run or discarded according to the configured
    /// [`StopPolicy`].
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnection request not sent: {e}");
        }
        self.cancellation_token.cancel();

        let task = lock(&self.task).take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            error!("Connection task terminated abnormally: {e}");
        }

        let executor = self.executor.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || executor.stop()).await {
            error!("Impossible to stop the command executor: {e}");
        }
        info!("Disconnected");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    router: Arc<Router>,
    transport: Arc<dyn Transport>,
    file_manager: Option<Arc<FileManager>>,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            // Use the cancellation token to stop the loop
            () = cancellation_token.cancelled() => { break; }
            // Poll the `MQTT` event coming from the network
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("Connected to the broker");
                    if !transport.subscribe(&router.subscriptions()) {
                        warn!("Some subscriptions failed");
                    }
                    if let Some(manager) = &file_manager {
                        manager.publish_file_list();
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    match std::str::from_utf8(&publish.topic) {
                        Ok(channel) => {
                            let _ = router.deliver(channel, &publish.payload);
                        }
                        Err(e) => warn!("Message with an invalid channel, discard it: {e}"),
                    }
                }
                Ok(event) => debug!("Event ignored: {event:?}"),
                Err(e) => {
                    error!("Connection lost: {e}");
                    tokio::select! {
                        () = cancellation_token.cancelled() => { break; }
                        () = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }
    }
    debug!("Connection task stopped");
}
