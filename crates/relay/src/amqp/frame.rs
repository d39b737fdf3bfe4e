use crate::amqp::FrameError;
use crate::amqp::method::{self, Method};
use crate::types::check_name;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

pub const FRAME_METHOD: u8 = 1;
pub const FRAME_HEADER: u8 = 2;
pub const FRAME_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;
pub const FRAME_END: u8 = 0xCE;

/// type (1) + channel (2) + size (4)
const FRAME_HEADER_LEN: usize = 7;

/// Bytes of framing around every payload: header plus end octet
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_LEN + 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Method {
        channel: u16,
        method: Method,
    },
    /// Content header; properties are neither sent nor interpreted
    Header {
        channel: u16,
        class_id: u16,
        body_size: u64,
    },
    Body {
        channel: u16,
        payload: Bytes,
    },
    Heartbeat,
}

impl Frame {
    pub fn method(channel: u16, method: Method) -> Self {
        Frame::Method { channel, method }
    }

    /// Parse one frame from the buffer
    ///
    /// Returns `Incomplete` without consuming anything useful when the
    /// buffer does not yet hold the whole frame; the caller only advances
    /// its read buffer by `buf.position()` on success. A frame larger than
    /// `frame_max`, framing included, is invalid.
    pub fn parse(buf: &mut Cursor<&[u8]>, frame_max: u32) -> Result<Frame, FrameError> {
        if buf.remaining() < FRAME_HEADER_LEN {
            return Err(FrameError::Incomplete);
        }

        let frame_type = buf.get_u8();
        let channel = buf.get_u16();
        let size = buf.get_u32() as usize;

        if size + FRAME_OVERHEAD > frame_max as usize {
            return Err(FrameError::Invalid(format!(
                "frame of {} bytes exceeds frame_max {}",
                size + FRAME_OVERHEAD,
                frame_max
            )));
        }

        if buf.remaining() < size + 1 {
            return Err(FrameError::Incomplete);
        }

        let mut payload = Bytes::copy_from_slice(&buf.chunk()[..size]);
        buf.advance(size);

        if buf.get_u8() != FRAME_END {
            return Err(FrameError::Invalid("missing frame end octet".to_string()));
        }

        match frame_type {
            FRAME_METHOD => Ok(Frame::Method {
                channel,
                method: Method::decode(payload)?,
            }),
            FRAME_HEADER => {
                let class_id = method::take_u16(&mut payload)?;
                let _weight = method::take_u16(&mut payload)?;
                let body_size = method::take_u64(&mut payload)?;
                Ok(Frame::Header {
                    channel,
                    class_id,
                    body_size,
                })
            }
            FRAME_BODY => Ok(Frame::Body { channel, payload }),
            FRAME_HEARTBEAT => Ok(Frame::Heartbeat),
            other => Err(FrameError::Invalid(format!("unknown frame type {}", other))),
        }
    }

    /// Serialize the frame to buffer
    pub fn serialize(&self, buf: &mut BytesMut) {
        let mut payload = BytesMut::new();
        let (frame_type, channel) = match self {
            Frame::Method { channel, method } => {
                method.encode(&mut payload);
                (FRAME_METHOD, *channel)
            }
            Frame::Header {
                channel,
                class_id,
                body_size,
            } => {
                payload.put_u16(*class_id);
                payload.put_u16(0);
                payload.put_u64(*body_size);
                // property flags: none set
                payload.put_u16(0);
                (FRAME_HEADER, *channel)
            }
            Frame::Body { channel, payload: body } => {
                payload.put(body.as_ref());
                (FRAME_BODY, *channel)
            }
            Frame::Heartbeat => (FRAME_HEARTBEAT, 0),
        };

        buf.put_u8(frame_type);
        buf.put_u16(channel);
        buf.put_u32(payload.len() as u32);
        buf.put(payload);
        buf.put_u8(FRAME_END);
    }
}

/// Frames for one basic.publish: method, content header, body chunks
///
/// Bodies larger than the negotiated frame size are split so that no frame
/// exceeds `frame_max`. Names too long for a short string are refused.
pub fn publish_frames(
    channel: u16,
    exchange: &str,
    routing_key: &str,
    payload: &Bytes,
    frame_max: u32,
) -> Result<Vec<Frame>, FrameError> {
    check_name("exchange", exchange).map_err(|e| FrameError::Invalid(e.to_string()))?;
    check_name("routing key", routing_key).map_err(|e| FrameError::Invalid(e.to_string()))?;

    let mut frames = vec![
        Frame::method(
            channel,
            Method::BasicPublish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                mandatory: false,
                immediate: false,
            },
        ),
        Frame::Header {
            channel,
            class_id: method::BASIC,
            body_size: payload.len() as u64,
        },
    ];

    let chunk = (frame_max as usize).saturating_sub(FRAME_OVERHEAD).max(1);
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + chunk).min(payload.len());
        frames.push(Frame::Body {
            channel,
            payload: payload.slice(offset..end),
        });
        offset = end;
    }

    Ok(frames)
}
