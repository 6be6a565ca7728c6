//! stage-channel: host-side control channel for sandboxed build stages.
//!
//! The orchestrator opens a [`ControlChannel`] on a fresh socket path, launches
//! the stage with that path, and closes the channel when the stage exits. In
//! between, the stage connects, asks for `setup-stdio`, and receives its input
//! payload as stdin and a pipe for stdout/stderr; everything written to that
//! pipe is captured and available from [`ControlChannel::output`] once closed.

pub mod bls;
pub mod bridge;
mod broker;
pub mod channel;
pub mod client;
pub mod dispatch;
pub mod inputs;
pub mod logging;
mod reactor;
pub mod sink;

pub use bls::{BlsError, options_append};
pub use broker::{BrokerError, DescriptorBroker, OutputPipe};
pub use channel::{ChannelConfig, ChannelError, ChannelState, ControlChannel};
pub use client::{ClientError, StageClient, StageStdio, setup_stdio};
pub use dispatch::{DispatchContext, DispatchError, Dispatcher, MethodHandler, SetupStdio};
pub use inputs::{InputProvider, MapReply, StoreClient, with_mapped};
pub use logging::init_tracing;
pub use sink::OutputSink;
