//! Ledger device session.
//!
//! One task owns the transport channel. Attach/disconnect notifications,
//! status polls, the disconnect grace deadline and sign requests are all turns
//! of the same `select!` loop, so device operations never overlap. The
//! current [`ConnectionStep`] is published on a `watch` channel.
//!
//! Channel exchanges block until the device answers (a sign request waits on
//! the user), so they run on the blocking pool while the task awaits them.

use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::app::{AppResponse, StacksApp};
use crate::domain::{ConfirmedAddress, ConnectionStep, DerivationPath, DeviceDescriptor, MessageSignature};
use crate::ports::{
    DeviceChannel, DeviceTransportPort, HardwareSignerPort, ListenerHandle, PortError,
    TransportEvent, TransportEventSink,
};
use crate::state_machine::connection_step_for_status;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often the open channel is queried for app state.
    pub poll_interval: Duration,
    /// How long after a disconnect the step is forced to `Disconnected`.
    pub disconnect_grace: Duration,
    pub derivation_path: DerivationPath,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            disconnect_grace: Duration::from_millis(1_000),
            derivation_path: DerivationPath::stacks_default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no device connected")]
    NoDevice,
    #[error("device error [{code:#06x}] {message}")]
    Device { code: u16, message: String },
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("device session closed")]
    Closed,
}

impl From<SessionError> for PortError {
    fn from(value: SessionError) -> Self {
        match value {
            SessionError::NoDevice => PortError::NotFound("no device connected".to_owned()),
            SessionError::Device { code, message } => PortError::Device { code, message },
            SessionError::Port(inner) => inner,
            SessionError::Closed => PortError::Transport("device session closed".to_owned()),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum SessionCommand {
    ConfirmAddress { reply: Reply<ConfirmedAddress> },
    Sign { payload: Vec<u8>, reply: Reply<MessageSignature> },
    Shutdown,
}

/// Owner of the session task. Dropping it (and every handle) tears the session down.
pub struct DeviceSession {
    handle: DeviceSessionHandle,
    task: JoinHandle<()>,
}

impl DeviceSession {
    /// Subscribes to attach events and starts the session task on the current runtime.
    pub fn spawn<T: DeviceTransportPort>(
        transport: T,
        config: SessionConfig,
    ) -> Result<Self, PortError> {
        let (sink, events) = mpsc::unbounded_channel();
        let listener = transport.listen(sink.clone())?;
        let (commands_tx, commands_rx) = mpsc::channel(8);
        let (steps_tx, steps_rx) = watch::channel(ConnectionStep::Disconnected);

        let actor = SessionActor {
            transport,
            config,
            sink,
            listener: Some(listener),
            app: None,
            disconnect_deadline: None,
            steps: steps_tx,
        };
        debug!("device session started, listening for attach");
        let task = tokio::spawn(actor.run(commands_rx, events));

        Ok(Self {
            handle: DeviceSessionHandle {
                commands: commands_tx,
                steps: steps_rx,
            },
            task,
        })
    }

    pub fn handle(&self) -> DeviceSessionHandle {
        self.handle.clone()
    }

    /// Cancels the attach subscription, closes any open channel and waits for the task.
    pub async fn shutdown(self) {
        let _ = self.handle.commands.send(SessionCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "device session task ended abnormally");
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeviceSessionHandle {
    commands: mpsc::Sender<SessionCommand>,
    steps: watch::Receiver<ConnectionStep>,
}

impl DeviceSessionHandle {
    pub fn step(&self) -> ConnectionStep {
        *self.steps.borrow()
    }

    pub fn steps(&self) -> watch::Receiver<ConnectionStep> {
        self.steps.clone()
    }

    /// Shows the address on the device and returns its public key.
    pub async fn confirm_address(&self) -> Result<ConfirmedAddress, SessionError> {
        self.request(|reply| SessionCommand::ConfirmAddress { reply })
            .await
    }

    pub async fn sign(&self, payload: Vec<u8>) -> Result<MessageSignature, SessionError> {
        self.request(|reply| SessionCommand::Sign { payload, reply })
            .await
    }

    async fn request<R>(
        &self,
        command: impl FnOnce(Reply<R>) -> SessionCommand,
    ) -> Result<R, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .await
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }
}

impl HardwareSignerPort for DeviceSessionHandle {
    async fn confirm_public_key(&self) -> Result<ConfirmedAddress, PortError> {
        Ok(self.confirm_address().await?)
    }

    async fn sign_transaction(&self, serialized_tx: Vec<u8>) -> Result<MessageSignature, PortError> {
        Ok(self.sign(serialized_tx).await?)
    }
}

struct SessionActor<T: DeviceTransportPort> {
    transport: T,
    config: SessionConfig,
    sink: TransportEventSink,
    // `Some` while waiting for an attach.
    listener: Option<ListenerHandle>,
    app: Option<StacksApp<T::Channel>>,
    disconnect_deadline: Option<Instant>,
    steps: watch::Sender<ConnectionStep>,
}

impl<T: DeviceTransportPort> SessionActor<T> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<SessionCommand>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        let mut poll = time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.disconnect_deadline;
            tokio::select! {
                command = commands.recv() => match command {
                    Some(SessionCommand::ConfirmAddress { reply }) => {
                        let _ = reply.send(self.confirm_address().await);
                    }
                    Some(SessionCommand::Sign { payload, reply }) => {
                        let _ = reply.send(self.sign(payload).await);
                    }
                    Some(SessionCommand::Shutdown) | None => break,
                },
                Some(event) = events.recv() => match event {
                    TransportEvent::Attached(descriptor) => self.on_attach(descriptor),
                    TransportEvent::Disconnected(descriptor) => self.on_disconnect(&descriptor),
                },
                _ = poll.tick() => self.poll_status().await,
                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_disconnect_deadline();
                }
            }
        }

        self.teardown();
    }

    fn on_attach(&mut self, descriptor: DeviceDescriptor) {
        if self.app.is_some() || self.listener.is_none() {
            debug!(%descriptor, "ignoring attach, channel already open");
            return;
        }
        debug!(%descriptor, "device attached");
        self.disconnect_deadline = None;
        if let Some(listener) = self.listener.take() {
            listener.unsubscribe();
        }
        match self.transport.open(&descriptor, self.sink.clone()) {
            Ok(channel) => {
                info!(%descriptor, "device channel opened");
                self.app = Some(StacksApp::new(channel));
            }
            Err(e) => {
                warn!(%descriptor, error = %e, "failed to open device channel");
                self.resubscribe();
            }
        }
    }

    fn on_disconnect(&mut self, descriptor: &DeviceDescriptor) {
        let owned = self
            .app
            .as_ref()
            .is_some_and(|app| app.channel().descriptor() == descriptor);
        if !owned {
            trace!(%descriptor, "disconnect for a channel we do not own");
            return;
        }
        if let Some(app) = self.app.take() {
            let mut channel = app.into_channel();
            channel.close();
        }
        info!(
            %descriptor,
            grace_ms = self.config.disconnect_grace.as_millis() as u64,
            "device disconnected"
        );
        self.disconnect_deadline = Some(Instant::now() + self.config.disconnect_grace);
        self.resubscribe();
    }

    fn on_disconnect_deadline(&mut self) {
        self.disconnect_deadline = None;
        info!("no reattach within grace period, marking device disconnected");
        self.steps.send_replace(ConnectionStep::Disconnected);
    }

    fn resubscribe(&mut self) {
        if self.listener.is_some() {
            return;
        }
        match self.transport.listen(self.sink.clone()) {
            Ok(listener) => self.listener = Some(listener),
            Err(e) => warn!(error = %e, "failed to resubscribe to attach events"),
        }
    }

    // The transport only notices a vanished device on the next request, so
    // probing here is what surfaces the disconnect.
    async fn poll_status(&mut self) {
        if self.app.is_none()
            || self.listener.is_some()
            || *self.steps.borrow() == ConnectionStep::HasAddress
        {
            return;
        }
        trace!("polling device");
        match self.with_app(|app, _| app.get_version()).await {
            Ok(response) => {
                if let Some(step) = connection_step_for_status(response.return_code) {
                    self.set_step(step);
                }
            }
            Err(e) => trace!(error = %e, "poll failed"),
        }
    }

    async fn confirm_address(&mut self) -> Result<ConfirmedAddress, SessionError> {
        let response = self
            .with_app(|app, path| {
                app.get_version()?;
                app.show_address_and_pubkey(path)
            })
            .await?;
        if !response.is_ok() {
            return Err(refused("address confirmation", &response));
        }
        let confirmed = response.into_result()?;
        debug!(address = %confirmed.address, "device confirmed address");
        self.set_step(ConnectionStep::HasAddress);
        Ok(confirmed)
    }

    async fn sign(&mut self, payload: Vec<u8>) -> Result<MessageSignature, SessionError> {
        let response = self
            .with_app(move |app, path| app.sign(path, &payload))
            .await?;
        if !response.is_ok() {
            return Err(refused("signing", &response));
        }
        let signed = response.into_result()?;
        debug!(signature = %signed.signature_compact.to_hex(), "device signed transaction");
        Ok(signed.signature_compact)
    }

    /// Runs `op` against the open channel on the blocking pool. The app is
    /// moved out for the duration and put back afterwards. A disconnect error
    /// releases the channel.
    async fn with_app<R, F>(&mut self, op: F) -> Result<R, SessionError>
    where
        R: Send + 'static,
        F: FnOnce(&mut StacksApp<T::Channel>, &DerivationPath) -> Result<R, PortError>
            + Send
            + 'static,
    {
        let mut app = self.app.take().ok_or(SessionError::NoDevice)?;
        let path = self.config.derivation_path.clone();
        let (app, result) = task::spawn_blocking(move || {
            let result = op(&mut app, &path);
            (app, result)
        })
        .await
        .map_err(|e| PortError::Transport(format!("device exchange task failed: {e}")))?;

        let descriptor = app.channel().descriptor().clone();
        self.app = Some(app);
        match result {
            Ok(value) => Ok(value),
            Err(PortError::Disconnected(reason)) => {
                self.on_disconnect(&descriptor);
                Err(PortError::Disconnected(reason).into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn set_step(&self, step: ConnectionStep) {
        self.steps.send_if_modified(|current| {
            if *current == step {
                return false;
            }
            debug!(from = ?*current, to = ?step, "connection step");
            *current = step;
            true
        });
    }

    fn teardown(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.unsubscribe();
        }
        if let Some(app) = self.app.take() {
            let mut channel = app.into_channel();
            channel.close();
        }
        info!("device session closed");
    }
}

fn refused<R>(what: &str, response: &AppResponse<R>) -> SessionError {
    warn!(
        code = response.return_code,
        message = response.error_message,
        "device refused {what}"
    );
    SessionError::Device {
        code: response.return_code,
        message: response.error_message.to_owned(),
    }
}
