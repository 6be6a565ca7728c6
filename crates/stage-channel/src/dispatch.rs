//! Request dispatch for the control socket.
//!
//! Handlers are registered by method name. A request whose method has no
//! handler is dropped without a reply; that is the normal path for methods a
//! newer stage knows about and this host does not.

use std::collections::HashMap;
use std::os::fd::OwnedFd;

use crate::bridge::protocol::{Method, Reply, Request, StdioReply};
use crate::broker::{BrokerError, DescriptorBroker};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Per-request view of the channel state a handler may touch.
///
/// Lives on the reactor thread only.
pub struct DispatchContext<'a> {
    broker: &'a mut DescriptorBroker,
    output: Option<OwnedFd>,
}

impl<'a> DispatchContext<'a> {
    pub fn new(broker: &'a mut DescriptorBroker) -> Self {
        Self {
            broker,
            output: None,
        }
    }

    pub fn broker(&mut self) -> &mut DescriptorBroker {
        &mut *self.broker
    }

    /// Hand the read end of an output pipe to the reactor for draining.
    pub fn register_output(&mut self, read: OwnedFd) {
        self.output = Some(read);
    }

    pub fn take_output(&mut self) -> Option<OwnedFd> {
        self.output.take()
    }
}

/// Handles one method.
///
/// `fds` are the descriptors that arrived with the request; anything the
/// handler does not keep is closed when it returns.
pub trait MethodHandler: Send {
    fn handle(
        &self,
        request: &Request,
        fds: Vec<OwnedFd>,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<Option<Reply>, DispatchError>;
}

/// `setup-stdio`: input file on 0, combined output pipe on 1 and 2.
pub struct SetupStdio;

impl MethodHandler for SetupStdio {
    fn handle(
        &self,
        _request: &Request,
        _fds: Vec<OwnedFd>,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<Option<Reply>, DispatchError> {
        let stdin = ctx.broker().prepare_input()?;
        let pipe = ctx.broker().prepare_output()?;
        let stderr = pipe.write.try_clone().map_err(BrokerError::Io)?;

        let reply = Reply::new(StdioReply::standard(), vec![stdin, pipe.write, stderr])?;
        ctx.register_output(pipe.read);
        Ok(Some(reply))
    }
}

/// Method name to handler table.
pub struct Dispatcher {
    handlers: HashMap<String, Box<dyn MethodHandler>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        let mut dispatcher = Self::empty();
        dispatcher.register(Method::SetupStdio.as_str(), SetupStdio);
        dispatcher
    }
}

impl Dispatcher {
    /// A dispatcher that answers nothing.
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for `method`, returning any handler it replaces.
    pub fn register(
        &mut self,
        method: impl Into<String>,
        handler: impl MethodHandler + 'static,
    ) -> Option<Box<dyn MethodHandler>> {
        self.handlers.insert(method.into(), Box::new(handler))
    }

    pub fn handles(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn dispatch(
        &self,
        request: &Request,
        fds: Vec<OwnedFd>,
        ctx: &mut DispatchContext<'_>,
    ) -> Result<Option<Reply>, DispatchError> {
        match self.handlers.get(&request.method) {
            Some(handler) => {
                tracing::debug!(method = %request.method, fds = fds.len(), "Dispatching request");
                handler.handle(request, fds, ctx)
            }
            None => {
                tracing::debug!(method = %request.method, "No handler for method, ignoring");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs::File;
    use std::io::{Read, Write};

    #[test]
    fn setup_stdio_reply_has_three_descriptors() {
        let mut broker = DescriptorBroker::new(json!({"x": 1}));
        let mut ctx = DispatchContext::new(&mut broker);

        let reply = Dispatcher::default()
            .dispatch(&Request::new("setup-stdio"), Vec::new(), &mut ctx)
            .unwrap()
            .unwrap();

        assert_eq!(reply.fds.len(), 3);
        assert_eq!(
            serde_json::from_value::<StdioReply>(reply.body).unwrap(),
            StdioReply::standard()
        );
        assert!(ctx.take_output().is_some());
    }

    #[test]
    fn stdout_and_stderr_share_one_pipe() {
        let mut broker = DescriptorBroker::new(json!(null));
        let mut ctx = DispatchContext::new(&mut broker);

        let reply = SetupStdio
            .handle(&Request::new("setup-stdio"), Vec::new(), &mut ctx)
            .unwrap()
            .unwrap();
        let read = ctx.take_output().unwrap();

        let mut fds = reply.fds.into_iter();
        let mut stdin = File::from(fds.next().unwrap());
        let mut stdout = File::from(fds.next().unwrap());
        let mut stderr = File::from(fds.next().unwrap());
        stdout.write_all(b"out ").unwrap();
        stderr.write_all(b"err").unwrap();
        drop((stdout, stderr));

        let mut combined = String::new();
        File::from(read).read_to_string(&mut combined).unwrap();
        assert_eq!(combined, "out err");

        let mut input = String::new();
        stdin.read_to_string(&mut input).unwrap();
        assert_eq!(input, "null");
    }

    #[test]
    fn unknown_method_gets_no_reply() {
        let mut broker = DescriptorBroker::new(json!({}));
        let mut ctx = DispatchContext::new(&mut broker);

        let reply = Dispatcher::default()
            .dispatch(&Request::new("add-mount"), Vec::new(), &mut ctx)
            .unwrap();

        assert!(reply.is_none());
        assert!(ctx.take_output().is_none());
    }

    #[test]
    fn second_setup_stdio_is_refused() {
        let mut broker = DescriptorBroker::new(json!({}));
        let dispatcher = Dispatcher::default();
        let req = Request::new("setup-stdio");

        {
            let mut ctx = DispatchContext::new(&mut broker);
            dispatcher.dispatch(&req, Vec::new(), &mut ctx).unwrap();
        }

        let mut ctx = DispatchContext::new(&mut broker);
        let err = dispatcher.dispatch(&req, Vec::new(), &mut ctx).unwrap_err();
        assert!(matches!(
            err,
            DispatchError::Broker(BrokerError::OutputAlreadyIssued)
        ));
    }

    struct Echo;

    impl MethodHandler for Echo {
        fn handle(
            &self,
            request: &Request,
            fds: Vec<OwnedFd>,
            _ctx: &mut DispatchContext<'_>,
        ) -> Result<Option<Reply>, DispatchError> {
            Ok(Some(Reply::new(&request.fields, fds)?))
        }
    }

    #[test]
    fn registered_methods_extend_the_table() {
        let mut dispatcher = Dispatcher::default();
        assert!(dispatcher.register("echo", Echo).is_none());
        assert!(dispatcher.handles("echo"));
        assert!(dispatcher.handles("setup-stdio"));

        let mut broker = DescriptorBroker::new(json!({}));
        let mut ctx = DispatchContext::new(&mut broker);
        let req = Request::new("echo").with_field("ping", json!(1));
        let reply = dispatcher
            .dispatch(&req, Vec::new(), &mut ctx)
            .unwrap()
            .unwrap();

        assert_eq!(reply.body, json!({"ping": 1}));
    }

    #[test]
    fn empty_dispatcher_answers_nothing() {
        let dispatcher = Dispatcher::empty();
        assert!(!dispatcher.handles("setup-stdio"));
    }
}
