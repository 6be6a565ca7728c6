//! Wire message types for the stage control socket.
//!
//! A stage sends one [`Request`] per connection. The host answers with a
//! [`Reply`] whose body names descriptor roles by their index in the ancillary
//! data that accompanies it.

use std::fmt;
use std::os::fd::OwnedFd;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Methods the host knows how to answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    /// Hand the stage its stdin (input payload) and combined stdout/stderr.
    SetupStdio,
}

impl Method {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SetupStdio => "setup-stdio",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request envelope: a method name plus whatever fields that method takes.
///
/// Fields stay opaque until the handler for `method` asks for them via
/// [`Request::payload`], so unknown methods still decode cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// The typed method, if this is one the host recognizes.
    pub fn known_method(&self) -> Option<Method> {
        serde_json::from_value(serde_json::Value::String(self.method.clone())).ok()
    }

    /// Decode the method-specific fields into a typed payload.
    pub fn payload<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(serde_json::Value::Object(self.fields.clone()))
    }
}

impl From<Method> for Request {
    fn from(method: Method) -> Self {
        Self::new(method.as_str())
    }
}

/// A reply body together with the descriptors sent alongside it.
///
/// The descriptors are owned: sending the reply consumes them, and the local
/// copies are closed once the kernel has duplicated them into the peer.
#[derive(Debug)]
pub struct Reply {
    pub body: serde_json::Value,
    pub fds: Vec<OwnedFd>,
}

impl Reply {
    pub fn new<T: Serialize>(body: T, fds: Vec<OwnedFd>) -> serde_json::Result<Self> {
        Ok(Self {
            body: serde_json::to_value(body)?,
            fds,
        })
    }
}

/// Body of the `setup-stdio` reply: role name to descriptor index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StdioReply {
    pub stdin: usize,
    pub stdout: usize,
    pub stderr: usize,
}

impl StdioReply {
    /// Input at 0, output write end at 1 and again at 2.
    pub const fn standard() -> Self {
        Self {
            stdin: 0,
            stdout: 1,
            stderr: 2,
        }
    }

    pub fn max_index(&self) -> usize {
        self.stdin.max(self.stdout).max(self.stderr)
    }
}
