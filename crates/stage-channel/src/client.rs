//! Stage side of the control socket.
//!
//! A sandboxed stage is given the socket path at launch. It connects, sends a
//! single request and receives the reply together with any descriptors.

use std::fs::File;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;

use crate::bridge::protocol::{Method, Request, StdioReply};
use crate::bridge::transport::{read_message, write_message};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {path}: {source}")]
    Connect { path: PathBuf, source: io::Error },
    #[error("control socket: {0}")]
    Io(#[from] io::Error),
    #[error("reply names {role} at index {index} but only {received} descriptors arrived")]
    MissingDescriptor {
        role: &'static str,
        index: usize,
        received: usize,
    },
}

/// The descriptors a stage should install as 0, 1 and 2.
#[derive(Debug)]
pub struct StageStdio {
    pub stdin: File,
    pub stdout: File,
    pub stderr: File,
}

/// One connection to the host. Each connection carries one request.
pub struct StageClient {
    stream: UnixStream,
}

impl StageClient {
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|source| ClientError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self { stream })
    }

    /// Send `request`, transferring `fds` along with it.
    pub fn send(&self, request: &Request, fds: Vec<OwnedFd>) -> Result<(), ClientError> {
        write_message(&self.stream, request, fds)?;
        Ok(())
    }

    /// Wait for the reply. Fails with `UnexpectedEof` if the host dropped the
    /// request without answering.
    pub fn receive<T: DeserializeOwned>(&self) -> Result<(T, Vec<OwnedFd>), ClientError> {
        Ok(read_message(&self.stream)?)
    }

    /// Request and unpack the stage's stdio descriptors.
    pub fn setup_stdio(self) -> Result<StageStdio, ClientError> {
        self.send(&Request::from(Method::SetupStdio), Vec::new())?;
        let (reply, fds): (StdioReply, _) = self.receive()?;

        let received = fds.len();
        let mut slots: Vec<Option<OwnedFd>> = fds.into_iter().map(Some).collect();
        let mut take = |role: &'static str, index: usize| -> Result<File, ClientError> {
            match slots.get_mut(index).and_then(Option::take) {
                Some(fd) => Ok(File::from(fd)),
                None => Err(ClientError::MissingDescriptor {
                    role,
                    index,
                    received,
                }),
            }
        };

        Ok(StageStdio {
            stdin: take("stdin", reply.stdin)?,
            stdout: take("stdout", reply.stdout)?,
            stderr: take("stderr", reply.stderr)?,
        })
    }
}

/// Connect to `path` and fetch stdio in one call.
pub fn setup_stdio(path: impl AsRef<Path>) -> Result<StageStdio, ClientError> {
    StageClient::connect(path)?.setup_stdio()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::DescriptorBroker;
    use serde_json::json;
    use std::io::{Read, Write};
    use std::thread::JoinHandle;

    fn serve_once(reply: StdioReply, fds: Vec<OwnedFd>) -> (StageClient, JoinHandle<Request>) {
        let (host, stage) = UnixStream::pair().unwrap();
        let handle = std::thread::spawn(move || {
            let (req, _): (Request, _) = read_message(&host).unwrap();
            write_message(&host, reply, fds).unwrap();
            req
        });
        (StageClient { stream: stage }, handle)
    }

    #[test]
    fn setup_stdio_maps_roles_to_descriptors() {
        let input_fd = DescriptorBroker::new(json!({})).prepare_input().unwrap();
        let (read, write) = nix::unistd::pipe().unwrap();
        let write2 = write.try_clone().unwrap();

        let (client, host) = serve_once(StdioReply::standard(), vec![input_fd, write, write2]);
        let mut stdio = client.setup_stdio().unwrap();
        assert_eq!(host.join().unwrap().method, "setup-stdio");

        let mut text = String::new();
        stdio.stdin.read_to_string(&mut text).unwrap();
        assert_eq!(text, "{}");

        stdio.stdout.write_all(b"a").unwrap();
        stdio.stderr.write_all(b"b").unwrap();
        drop(stdio);

        let mut out = String::new();
        File::from(read).read_to_string(&mut out).unwrap();
        assert_eq!(out, "ab");
    }

    #[test]
    fn missing_descriptor_is_reported() {
        let fd = OwnedFd::from(tempfile::tempfile().unwrap());
        let (client, host) = serve_once(StdioReply::standard(), vec![fd]);

        let err = client.setup_stdio().unwrap_err();
        host.join().unwrap();
        assert!(matches!(
            err,
            ClientError::MissingDescriptor {
                role: "stdout",
                index: 1,
                received: 1
            }
        ));
    }

    #[test]
    fn connect_to_missing_socket_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = StageClient::connect(dir.path().join("nope.sock"))
            .err()
            .unwrap();
        assert!(matches!(err, ClientError::Connect { .. }));
    }
}
