//! Client side of the AMQP 0-9-1 wire format, limited to what a publishing
//! relay needs: connection handshake, channels, confirms, exchange RPCs,
//! basic.publish and the ack/nack frames coming back.

pub mod frame;
pub mod method;

pub use frame::{Frame, publish_frames};
pub use method::{FieldTable, Method};

use thiserror::Error;

/// Sent by the client before the first frame
pub const PROTOCOL_HEADER: &[u8; 8] = b"AMQP\x00\x00\x09\x01";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Incomplete")]
    Incomplete,
    #[error("Invalid frame: {0}")]
    Invalid(String),
}
