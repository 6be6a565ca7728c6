//! Wire layer for the stage control socket.
//!
//! - **protocol**: Request envelope, method tags, reply bodies
//! - **codec**: length-delimited JSON framing
//! - **transport**: `SCM_RIGHTS` descriptor passing, async and blocking

pub mod codec;
pub mod protocol;
pub mod transport;
