//! Descriptor passing over Unix stream sockets.
//!
//! Frames from `codec` are written with `sendmsg(2)`; descriptors go along as
//! `SCM_RIGHTS` ancillary data on the first segment of the frame. On receipt
//! the kernel installs fresh descriptors in our table (opened `CLOEXEC`), which
//! we wrap in `OwnedFd` straight away so nothing can leak them.
//!
//! Two flavours share the same syscall helpers:
//! - [`FdStream`]: async, for the reactor thread (tokio readiness).
//! - [`read_message`] / [`write_message`]: blocking, for the stage side.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{ControlMessage, ControlMessageOwned, MsgFlags, recvmsg, sendmsg};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::Interest;
use tokio::net::UnixStream;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::Decoder;

use super::codec::{JsonCodec, encode_frame};

/// Upper bound on descriptors accepted with a single message.
pub const MAX_FDS_PER_MESSAGE: usize = 16;

const RECV_CHUNK_SIZE: usize = 4096;

/// One `sendmsg` call. `fds` are attached only if non-empty.
///
/// Returns the number of payload bytes the kernel accepted.
pub fn send_some(sock: RawFd, data: &[u8], fds: &[RawFd]) -> io::Result<usize> {
    let iov = [IoSlice::new(data)];
    let rights = [ControlMessage::ScmRights(fds)];
    let cmsgs: &[ControlMessage<'_>] = if fds.is_empty() { &[] } else { &rights };

    Ok(sendmsg::<()>(sock, &iov, cmsgs, MsgFlags::MSG_NOSIGNAL, None)?)
}

/// One `recvmsg` call. Received descriptors are appended to `fds`.
///
/// Returns the number of payload bytes read; 0 means the peer closed.
pub fn recv_some(sock: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut cmsg_buf = nix::cmsg_space!([RawFd; MAX_FDS_PER_MESSAGE]);
    let mut iov = [IoSliceMut::new(buf)];
    let msg = recvmsg::<()>(
        sock,
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;

    // Take ownership before anything else can fail.
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(raw) = cmsg {
            // SAFETY: the kernel just installed these descriptors for us and
            // nothing else refers to them yet.
            fds.extend(raw.into_iter().map(|fd| unsafe { OwnedFd::from_raw_fd(fd) }));
        }
    }

    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "ancillary data truncated",
        ));
    }
    if fds.len() > MAX_FDS_PER_MESSAGE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("too many descriptors: {}", fds.len()),
        ));
    }

    Ok(msg.bytes)
}

fn eof_mid_frame() -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-frame")
}

/// Async message stream over an accepted connection.
pub struct FdStream {
    stream: UnixStream,
    buf: BytesMut,
}

impl FdStream {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
        }
    }

    /// Receive one message and every descriptor that came with it.
    ///
    /// `Ok(None)` means the peer closed the connection without sending anything.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> io::Result<Option<(T, Vec<OwnedFd>)>> {
        let mut codec = JsonCodec::<T>::new();
        let mut fds = Vec::new();
        let mut chunk = [0u8; RECV_CHUNK_SIZE];
        let sock = self.stream.as_raw_fd();

        loop {
            if let Some(item) = codec.decode(&mut self.buf)? {
                return Ok(Some((item, fds)));
            }

            let n = self
                .stream
                .async_io(Interest::READABLE, || recv_some(sock, &mut chunk, &mut fds))
                .await?;
            if n == 0 {
                if self.buf.is_empty() && fds.is_empty() {
                    return Ok(None);
                }
                return Err(eof_mid_frame());
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Send one message, transferring `fds` to the peer.
    ///
    /// The descriptors are consumed: our copies are closed when this returns,
    /// whether or not the send succeeded.
    pub async fn send<T: Serialize>(&self, item: T, fds: Vec<OwnedFd>) -> io::Result<()> {
        let frame = encode_frame(item)?;
        let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
        let sock = self.stream.as_raw_fd();

        let mut sent = 0;
        while sent < frame.len() {
            let attach: &[RawFd] = if sent == 0 { &raw } else { &[] };
            let rest = &frame[sent..];
            let n = self
                .stream
                .async_io(Interest::WRITABLE, || send_some(sock, rest, attach))
                .await?;
            sent += n;
        }

        tracing::trace!(bytes = frame.len(), fds = fds.len(), "Sent frame");
        Ok(())
    }
}

/// Blocking receive of one message on a blocking socket.
pub fn read_message<T: DeserializeOwned>(
    sock: &impl AsRawFd,
) -> io::Result<(T, Vec<OwnedFd>)> {
    let mut codec = JsonCodec::<T>::new();
    let mut buf = BytesMut::new();
    let mut fds = Vec::new();
    let mut chunk = [0u8; RECV_CHUNK_SIZE];

    loop {
        if let Some(item) = codec.decode(&mut buf)? {
            return Ok((item, fds));
        }

        let n = match recv_some(sock.as_raw_fd(), &mut chunk, &mut fds) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Err(eof_mid_frame());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Blocking send of one message on a blocking socket.
pub fn write_message<T: Serialize>(
    sock: &impl AsRawFd,
    item: T,
    fds: Vec<OwnedFd>,
) -> io::Result<()> {
    let frame = encode_frame(item)?;
    let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();

    let mut sent = 0;
    while sent < frame.len() {
        let attach: &[RawFd] = if sent == 0 { &raw } else { &[] };
        match send_some(sock.as_raw_fd(), &frame[sent..], attach) {
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{Request, StdioReply};
    use std::fs::File;
    use std::io::{Read, Seek, SeekFrom, Write};
    use std::os::unix::net::UnixStream as StdUnixStream;

    fn file_with(contents: &str) -> File {
        let mut f = tempfile::tempfile().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f.seek(SeekFrom::Start(0)).unwrap();
        f
    }

    #[test]
    fn blocking_roundtrip_transfers_descriptors() {
        let (a, b) = StdUnixStream::pair().unwrap();
        let fds = vec![OwnedFd::from(file_with("first")), OwnedFd::from(file_with("second"))];

        write_message(&a, StdioReply::standard(), fds).unwrap();
        let (reply, received): (StdioReply, _) = read_message(&b).unwrap();

        assert_eq!(reply, StdioReply::standard());
        assert_eq!(received.len(), 2);

        let mut text = String::new();
        File::from(received.into_iter().nth(1).unwrap())
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "second");
    }

    #[test]
    fn message_without_descriptors() {
        let (a, b) = StdUnixStream::pair().unwrap();

        write_message(&a, Request::new("setup-stdio"), Vec::new()).unwrap();
        let (req, fds): (Request, _) = read_message(&b).unwrap();

        assert_eq!(req.method, "setup-stdio");
        assert!(fds.is_empty());
    }

    #[test]
    fn read_fails_when_peer_closes_early() {
        let (a, b) = StdUnixStream::pair().unwrap();
        drop(a);

        let err = read_message::<Request>(&b).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn async_stream_receives_request_and_sends_reply() {
        let (host, stage) = StdUnixStream::pair().unwrap();
        host.set_nonblocking(true).unwrap();
        let mut host = FdStream::new(UnixStream::from_std(host).unwrap());

        let stage = std::thread::spawn(move || {
            write_message(&stage, Request::new("setup-stdio"), Vec::new()).unwrap();
            read_message::<StdioReply>(&stage).unwrap()
        });

        let (req, fds) = host.recv::<Request>().await.unwrap().unwrap();
        assert_eq!(req.method, "setup-stdio");
        assert!(fds.is_empty());

        let out = OwnedFd::from(file_with("payload"));
        let dup = out.try_clone().unwrap();
        host.send(StdioReply::standard(), vec![out, dup])
            .await
            .unwrap();

        let (reply, fds) = stage.join().unwrap();
        assert_eq!(reply, StdioReply::standard());
        assert_eq!(fds.len(), 2);
    }

    #[tokio::test]
    async fn async_recv_reports_clean_close() {
        let (host, stage) = StdUnixStream::pair().unwrap();
        host.set_nonblocking(true).unwrap();
        let mut host = FdStream::new(UnixStream::from_std(host).unwrap());
        drop(stage);

        assert!(host.recv::<Request>().await.unwrap().is_none());
    }
}
