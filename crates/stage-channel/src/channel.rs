//! Control channel: the handle the orchestrator holds for one stage.
//!
//! Lifecycle:
//! 1. `new` builds the channel (Created)
//! 2. `start` spawns the reactor thread and blocks until the socket is bound
//!    (Starting, then Ready)
//! 3. the stage connects and asks for its stdio (Active)
//! 4. `close` stops the reactor, joins it and takes its output (Stopping,
//!    then Closed)
//!
//! The captured output is only reachable once the reactor thread has been
//! joined, so there is never a reader racing the reactor's appends.

use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

use crate::broker::DescriptorBroker;
use crate::dispatch::Dispatcher;
use crate::reactor::{self, ReactorHandle, ReactorSetup};
use crate::sink::OutputSink;

/// Channel lifecycle. Transitions only ever move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ChannelState {
    Created = 0,
    Starting = 1,
    Ready = 2,
    Active = 3,
    Stopping = 4,
    Closed = 5,
}

impl ChannelState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Starting,
            2 => Self::Ready,
            3 => Self::Active,
            4 => Self::Stopping,
            _ => Self::Closed,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Active => "active",
            Self::Stopping => "stopping",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// State shared between the owning thread and the reactor.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ChannelState::Created as u8))
    }

    pub(crate) fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Move forward to `to`; a request to move backwards is ignored.
    pub(crate) fn advance(&self, to: ChannelState) {
        self.0.fetch_max(to as u8, Ordering::SeqCst);
    }

    /// Ready -> Active, once, from the reactor.
    pub(crate) fn mark_active(&self) {
        let _ = self.0.compare_exchange(
            ChannelState::Ready as u8,
            ChannelState::Active as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to bind control socket {path}: {source}")]
    Bind { path: PathBuf, source: io::Error },
    #[error("failed to start reactor: {0}")]
    Reactor(#[source] io::Error),
    #[error("reactor thread panicked")]
    ReactorPanicked,
    #[error("cannot {op} a channel that is {state}")]
    InvalidState {
        op: &'static str,
        state: ChannelState,
    },
}

/// Everything a channel needs before it starts.
pub struct ChannelConfig {
    socket_path: PathBuf,
    input: serde_json::Value,
    interactive: bool,
    mirror: Option<Box<dyn Write + Send>>,
    dispatcher: Option<Dispatcher>,
}

impl ChannelConfig {
    /// `socket_path` must be unique to this stage invocation.
    pub fn new(socket_path: impl Into<PathBuf>, input: serde_json::Value) -> Self {
        Self {
            socket_path: socket_path.into(),
            input,
            interactive: false,
            mirror: None,
            dispatcher: None,
        }
    }

    /// Like [`ChannelConfig::new`], serializing any payload type.
    pub fn with_payload<T: Serialize>(
        socket_path: impl Into<PathBuf>,
        payload: &T,
    ) -> serde_json::Result<Self> {
        Ok(Self::new(socket_path, serde_json::to_value(payload)?))
    }

    /// Mirror stage output live as it is captured.
    pub fn with_interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Where interactive output goes; defaults to our stdout.
    pub fn with_mirror(mut self, mirror: Box<dyn Write + Send>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Replace the default method table (`setup-stdio` only).
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    fn into_setup(self, state: Arc<StateCell>) -> ReactorSetup {
        let sink = match (self.interactive, self.mirror) {
            (true, Some(mirror)) => OutputSink::mirrored(mirror),
            (true, None) => OutputSink::mirrored(Box::new(io::stdout())),
            (false, _) => OutputSink::new(),
        };

        ReactorSetup {
            socket_path: self.socket_path,
            broker: DescriptorBroker::new(self.input),
            dispatcher: self.dispatcher.unwrap_or_default(),
            sink,
            state,
        }
    }
}

/// Host end of a stage's control socket.
pub struct ControlChannel {
    socket_path: PathBuf,
    state: Arc<StateCell>,
    config: Option<ChannelConfig>,
    reactor: Option<ReactorHandle>,
    bound: bool,
    output: Option<String>,
}

impl ControlChannel {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            state: Arc::new(StateCell::new()),
            config: Some(config),
            reactor: None,
            bound: false,
            output: None,
        }
    }

    /// Build and start in one go.
    pub fn open(config: ChannelConfig) -> Result<Self, ChannelError> {
        let mut channel = Self::new(config);
        channel.start()?;
        Ok(channel)
    }

    /// Start the reactor and wait until the socket accepts connections.
    ///
    /// Blocks the calling thread until the reactor has bound the socket (or
    /// failed to). Must not be called from inside an async runtime.
    pub fn start(&mut self) -> Result<(), ChannelError> {
        let Some(config) = self.config.take() else {
            return Err(ChannelError::InvalidState {
                op: "start",
                state: self.state(),
            });
        };

        self.state.advance(ChannelState::Starting);
        tracing::debug!(socket = %self.socket_path.display(), "Starting control channel");

        match reactor::spawn(config.into_setup(Arc::clone(&self.state))) {
            Ok(handle) => {
                self.reactor = Some(handle);
                self.bound = true;
                self.state.advance(ChannelState::Ready);
                tracing::debug!(socket = %self.socket_path.display(), "Control channel ready");
                Ok(())
            }
            Err(e) => {
                self.output = Some(String::new());
                self.state.advance(ChannelState::Closed);
                Err(e)
            }
        }
    }

    /// Stop the reactor, join it and keep its output.
    ///
    /// Safe to call any number of times; only the first call does anything.
    pub fn close(&mut self) -> Result<(), ChannelError> {
        if self.state() == ChannelState::Closed {
            return Ok(());
        }

        self.state.advance(ChannelState::Stopping);
        self.config = None;

        let result = match self.reactor.take().map(ReactorHandle::shutdown) {
            Some(Ok(sink)) => {
                self.output = Some(sink.into_string());
                Ok(())
            }
            Some(Err(e)) => {
                self.output = Some(String::new());
                Err(e)
            }
            None => {
                self.output = Some(String::new());
                Ok(())
            }
        };

        if self.bound {
            self.remove_socket();
        }
        self.state.advance(ChannelState::Closed);
        tracing::debug!(socket = %self.socket_path.display(), "Control channel closed");
        result
    }

    /// Everything the stage wrote, available once the channel is closed.
    pub fn output(&self) -> Option<&str> {
        match self.state() {
            ChannelState::Closed => self.output.as_deref(),
            _ => None,
        }
    }

    /// Close and hand back the captured output.
    pub fn into_output(mut self) -> Result<String, ChannelError> {
        self.close()?;
        Ok(self.output.take().unwrap_or_default())
    }

    pub fn state(&self) -> ChannelState {
        self.state.get()
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Open a channel, run `f` while it is live, then close it.
    ///
    /// The channel is closed on every exit path out of `f`, panics included.
    pub fn run<F, R>(config: ChannelConfig, f: F) -> Result<(R, String), ChannelError>
    where
        F: FnOnce(&ControlChannel) -> R,
    {
        let channel = Self::open(config)?;
        let result = f(&channel);
        let output = channel.into_output()?;
        Ok((result, output))
    }

    fn remove_socket(&self) {
        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(
                    socket = %self.socket_path.display(),
                    error = %e,
                    "Failed to remove control socket"
                );
            }
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "Failed to close control channel");
        }
    }
}
