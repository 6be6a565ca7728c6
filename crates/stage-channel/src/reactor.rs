//! Reactor thread: a single-threaded event loop owning the control socket
//! and the read end of the stage output pipe.
//!
//! The loop runs on a tokio current-thread runtime on its own OS thread, so
//! readiness comes from epoll and every event is handled on that one thread:
//! - listener readable: accept, read one request (per-connection task)
//! - request decoded: dispatch on the loop itself, register any output pipe,
//!   then send the reply (per-connection task)
//! - output pipe readable: read one chunk into the sink
//! - stop signal from the owning thread: final drain, then return the sink
//!
//! The owning thread talks to the loop through exactly two oneshots: the
//! readiness signal (bind result) and the stop signal.

use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;

use tokio::net::unix::pipe;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};

use crate::bridge::protocol::{Reply, Request};
use crate::bridge::transport::FdStream;
use crate::broker::DescriptorBroker;
use crate::channel::{ChannelError, StateCell};
use crate::dispatch::{DispatchContext, Dispatcher};
use crate::sink::{OutputSink, READ_CHUNK_SIZE};

/// Everything the reactor takes ownership of when it starts.
pub(crate) struct ReactorSetup {
    pub socket_path: PathBuf,
    pub broker: DescriptorBroker,
    pub dispatcher: Dispatcher,
    pub sink: OutputSink,
    pub state: Arc<StateCell>,
}

/// Owning-thread handle to a running reactor.
pub(crate) struct ReactorHandle {
    stop: Option<oneshot::Sender<()>>,
    thread: JoinHandle<OutputSink>,
}

impl ReactorHandle {
    /// Ask the loop to stop, wait for the thread and take back the sink.
    pub fn shutdown(mut self) -> Result<OutputSink, ChannelError> {
        if let Some(stop) = self.stop.take() {
            // Err means the loop already exited on its own.
            let _ = stop.send(());
        }
        self.thread.join().map_err(|_| ChannelError::ReactorPanicked)
    }
}

/// Spawn the reactor thread and block until its socket is listening.
pub(crate) fn spawn(setup: ReactorSetup) -> Result<ReactorHandle, ChannelError> {
    let (ready_tx, ready_rx) = oneshot::channel::<Result<(), ChannelError>>();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    let thread = std::thread::Builder::new()
        .name("stage-reactor".to_string())
        .spawn(move || run(setup, ready_tx, stop_rx))
        .map_err(ChannelError::Reactor)?;

    match ready_rx.blocking_recv() {
        Ok(Ok(())) => Ok(ReactorHandle {
            stop: Some(stop_tx),
            thread,
        }),
        Ok(Err(e)) => {
            let _ = thread.join();
            Err(e)
        }
        Err(_) => {
            // The thread went away without signalling: it panicked.
            let _ = thread.join();
            Err(ChannelError::ReactorPanicked)
        }
    }
}

fn run(
    setup: ReactorSetup,
    ready: oneshot::Sender<Result<(), ChannelError>>,
    stop: oneshot::Receiver<()>,
) -> OutputSink {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build reactor runtime");
            let _ = ready.send(Err(ChannelError::Reactor(e)));
            return setup.sink;
        }
    };

    runtime.block_on(Reactor::new(setup).run(ready, stop))
}

/// A request read off a connection, waiting to be dispatched on the loop.
struct Incoming {
    stream: FdStream,
    request: Request,
    fds: Vec<OwnedFd>,
}

struct Reactor {
    socket_path: PathBuf,
    broker: DescriptorBroker,
    dispatcher: Dispatcher,
    sink: OutputSink,
    state: Arc<StateCell>,
    output: Option<pipe::Receiver>,
}

impl Reactor {
    fn new(setup: ReactorSetup) -> Self {
        Self {
            socket_path: setup.socket_path,
            broker: setup.broker,
            dispatcher: setup.dispatcher,
            sink: setup.sink,
            state: setup.state,
            output: None,
        }
    }

    async fn run(
        mut self,
        ready: oneshot::Sender<Result<(), ChannelError>>,
        mut stop: oneshot::Receiver<()>,
    ) -> OutputSink {
        let listener = match UnixListener::bind(&self.socket_path) {
            Ok(listener) => listener,
            Err(e) => {
                tracing::debug!(socket = %self.socket_path.display(), error = %e, "Bind failed");
                let _ = ready.send(Err(ChannelError::Bind {
                    path: self.socket_path.clone(),
                    source: e,
                }));
                return self.sink;
            }
        };
        tracing::debug!(socket = %self.socket_path.display(), "Listening");

        if ready.send(Ok(())).is_err() {
            tracing::warn!("Owner went away before the channel was ready");
            return self.sink;
        }

        let (incoming_tx, mut incoming_rx) = mpsc::unbounded_channel::<Incoming>();

        loop {
            tokio::select! {
                biased;

                _ = &mut stop => {
                    tracing::debug!("Stop requested");
                    break;
                }

                res = output_readable(&self.output) => {
                    self.on_output_ready(res);
                }

                Some(incoming) = incoming_rx.recv() => {
                    self.on_request(incoming);
                }

                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        tracing::trace!("Accepted stage connection");
                        tokio::spawn(read_request(stream, incoming_tx.clone()));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Accept failed");
                    }
                },
            }
        }

        drop(listener);
        self.final_drain();
        self.sink
    }

    fn on_request(&mut self, incoming: Incoming) {
        let Incoming {
            stream,
            request,
            fds,
        } = incoming;
        self.state.mark_active();

        let (result, output) = {
            let mut ctx = DispatchContext::new(&mut self.broker);
            let result = self.dispatcher.dispatch(&request, fds, &mut ctx);
            (result, ctx.take_output())
        };

        if let Some(read) = output {
            self.register_output(read);
        }

        match result {
            Ok(Some(reply)) => {
                tokio::spawn(send_reply(stream, request.method, reply));
            }
            Ok(None) => {
                tracing::trace!(method = %request.method, "No reply for request");
            }
            Err(e) => {
                tracing::error!(method = %request.method, error = %e, "Request failed");
            }
        }
    }

    fn register_output(&mut self, read: OwnedFd) {
        match pipe::Receiver::from_owned_fd(read) {
            Ok(receiver) => {
                tracing::debug!("Watching stage output");
                self.output = Some(receiver);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to watch output pipe");
            }
        }
    }

    fn on_output_ready(&mut self, ready: io::Result<()>) {
        let Some(receiver) = self.output.as_ref() else {
            return;
        };

        let mut buf = [0u8; READ_CHUNK_SIZE];
        match ready.and_then(|()| receiver.try_read(&mut buf)) {
            Ok(0) => {
                tracing::debug!("Stage closed its output");
                self.output = None;
            }
            Ok(n) => {
                tracing::trace!(bytes = n, "Captured output");
                self.sink.push(&buf[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                tracing::warn!(error = %e, "Output pipe read failed, no longer watching it");
                self.output = None;
            }
        }
    }

    /// Pick up whatever a finished stage left in the pipe, then close it.
    fn final_drain(&mut self) {
        let Some(receiver) = self.output.take() else {
            return;
        };

        let res = receiver
            .into_nonblocking_fd()
            .and_then(|fd| self.sink.drain_nonblocking(File::from(fd)));
        match res {
            Ok(n) => tracing::trace!(bytes = n, "Final drain"),
            Err(e) => tracing::warn!(error = %e, "Final drain of output pipe failed"),
        }
    }
}

async fn output_readable(output: &Option<pipe::Receiver>) -> io::Result<()> {
    match output {
        Some(receiver) => receiver.readable().await,
        None => std::future::pending().await,
    }
}

async fn read_request(stream: UnixStream, tx: mpsc::UnboundedSender<Incoming>) {
    let mut stream = FdStream::new(stream);
    match stream.recv::<Request>().await {
        Ok(Some((request, fds))) => {
            tracing::trace!(method = %request.method, fds = fds.len(), "Received request");
            let _ = tx.send(Incoming {
                stream,
                request,
                fds,
            });
        }
        Ok(None) => {
            tracing::trace!("Connection closed without a request");
        }
        Err(e) => {
            tracing::warn!(error = %e, "Dropping malformed request");
        }
    }
}

async fn send_reply(stream: FdStream, method: String, reply: Reply) {
    let Reply { body, fds } = reply;
    let count = fds.len();
    match stream.send(body, fds).await {
        Ok(()) => tracing::debug!(%method, fds = count, "Sent reply"),
        Err(e) => tracing::error!(%method, error = %e, "Failed to send reply"),
    }
}
