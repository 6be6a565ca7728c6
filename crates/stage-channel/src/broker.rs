//! Descriptor broker: manufactures the descriptors handed to a stage.
//!
//! - stdin: the JSON-encoded input payload in an anonymous file, reopened
//!   read-only so the stage starts reading at offset 0.
//! - stdout/stderr: the write end of a single pipe whose read end goes to the
//!   reactor. Both roles share it, so the stage produces one combined stream.
//!
//! Everything is returned as `OwnedFd`; whoever holds one closes it on drop.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, OwnedFd};

use nix::fcntl::OFlag;
use nix::unistd::pipe2;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("input file: {0}")]
    Io(#[from] io::Error),
    #[error("failed to encode input payload: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("pipe failed: {0}")]
    Pipe(#[from] nix::Error),
    #[error("output pipe already handed out")]
    OutputAlreadyIssued,
}

/// Both ends of the stage output pipe.
#[derive(Debug)]
pub struct OutputPipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

/// Produces the stdio descriptors for one channel.
#[derive(Debug)]
pub struct DescriptorBroker {
    input: serde_json::Value,
    output_issued: bool,
}

impl DescriptorBroker {
    pub fn new(input: serde_json::Value) -> Self {
        Self {
            input,
            output_issued: false,
        }
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    /// Write the payload to an anonymous file and return a fresh read-only
    /// descriptor for it, positioned at the start.
    ///
    /// The write handle is dropped before returning; the anonymous file lives
    /// on through the returned descriptor alone.
    pub fn prepare_input(&self) -> Result<OwnedFd, BrokerError> {
        let mut file = tempfile::tempfile()?;
        serde_json::to_writer(&mut file, &self.input)?;
        file.flush()?;

        // Reopening through /proc yields a new open file description with its
        // own offset (0), unlike dup() which would share the EOF cursor.
        let reader = File::open(format!("/proc/self/fd/{}", file.as_raw_fd()))?;

        tracing::trace!(
            write_fd = file.as_raw_fd(),
            read_fd = reader.as_raw_fd(),
            "Prepared input file"
        );
        Ok(OwnedFd::from(reader))
    }

    /// Create the single output pipe for this channel.
    pub fn prepare_output(&mut self) -> Result<OutputPipe, BrokerError> {
        if self.output_issued {
            return Err(BrokerError::OutputAlreadyIssued);
        }

        let (read, write) = pipe2(OFlag::O_CLOEXEC)?;
        self.output_issued = true;

        tracing::trace!(
            read_fd = read.as_raw_fd(),
            write_fd = write.as_raw_fd(),
            "Created output pipe"
        );
        Ok(OutputPipe { read, write })
    }
}
