use crate::amqp::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const CONNECTION: u16 = 10;
pub const CHANNEL: u16 = 20;
pub const EXCHANGE: u16 = 40;
pub const BASIC: u16 = 60;
pub const CONFIRM: u16 = 85;

/// Reply code the broker uses for a refused login
pub const ACCESS_REFUSED: u16 = 403;
pub const REPLY_SUCCESS: u16 = 200;

/// Encoded AMQP field table, kept as raw bytes
///
/// Nothing here needs to look inside the broker's tables, so they are only
/// carried around. Outgoing tables are built from string pairs.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldTable(pub Bytes);

impl FieldTable {
    pub fn from_strings(entries: &[(&str, &str)]) -> Self {
        let mut buf = BytesMut::new();
        for (key, value) in entries {
            put_short_str(&mut buf, key);
            buf.put_u8(b'S');
            put_long_str(&mut buf, value.as_bytes());
        }
        FieldTable(buf.freeze())
    }
}

/// The subset of AMQP 0-9-1 methods the relay sends or expects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: FieldTable,
        mechanisms: Bytes,
        locales: Bytes,
    },
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        response: Bytes,
        locale: String,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        vhost: String,
    },
    ConnectionOpenOk,
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,
    ChannelOpen,
    ChannelOpenOk,
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,
    ExchangeDeclare {
        exchange: String,
        kind: String,
        passive: bool,
        durable: bool,
    },
    ExchangeDeclareOk,
    ExchangeDelete {
        exchange: String,
        if_unused: bool,
    },
    ExchangeDeleteOk,
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicNack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
    ConfirmSelect {
        nowait: bool,
    },
    ConfirmSelectOk,
    /// A method this client does not know, kept so it can be reported
    Other {
        class_id: u16,
        method_id: u16,
    },
}

impl Method {
    pub fn id(&self) -> (u16, u16) {
        match self {
            Method::ConnectionStart { .. } => (CONNECTION, 10),
            Method::ConnectionStartOk { .. } => (CONNECTION, 11),
            Method::ConnectionTune { .. } => (CONNECTION, 30),
            Method::ConnectionTuneOk { .. } => (CONNECTION, 31),
            Method::ConnectionOpen { .. } => (CONNECTION, 40),
            Method::ConnectionOpenOk => (CONNECTION, 41),
            Method::ConnectionClose { .. } => (CONNECTION, 50),
            Method::ConnectionCloseOk => (CONNECTION, 51),
            Method::ChannelOpen => (CHANNEL, 10),
            Method::ChannelOpenOk => (CHANNEL, 11),
            Method::ChannelClose { .. } => (CHANNEL, 40),
            Method::ChannelCloseOk => (CHANNEL, 41),
            Method::ExchangeDeclare { .. } => (EXCHANGE, 10),
            Method::ExchangeDeclareOk => (EXCHANGE, 11),
            Method::ExchangeDelete { .. } => (EXCHANGE, 20),
            Method::ExchangeDeleteOk => (EXCHANGE, 21),
            Method::BasicPublish { .. } => (BASIC, 40),
            Method::BasicAck { .. } => (BASIC, 80),
            Method::BasicNack { .. } => (BASIC, 120),
            Method::ConfirmSelect { .. } => (CONFIRM, 10),
            Method::ConfirmSelectOk => (CONFIRM, 11),
            Method::Other {
                class_id,
                method_id,
            } => (*class_id, *method_id),
        }
    }

    /// Decode a method frame payload (class id, method id, arguments)
    pub fn decode(mut payload: Bytes) -> Result<Method, FrameError> {
        let class_id = take_u16(&mut payload)?;
        let method_id = take_u16(&mut payload)?;
        let buf = &mut payload;

        let method = match (class_id, method_id) {
            (CONNECTION, 10) => Method::ConnectionStart {
                version_major: take_u8(buf)?,
                version_minor: take_u8(buf)?,
                server_properties: FieldTable(take_long_bytes(buf)?),
                mechanisms: take_long_bytes(buf)?,
                locales: take_long_bytes(buf)?,
            },
            (CONNECTION, 11) => Method::ConnectionStartOk {
                client_properties: FieldTable(take_long_bytes(buf)?),
                mechanism: take_short_str(buf)?,
                response: take_long_bytes(buf)?,
                locale: take_short_str(buf)?,
            },
            (CONNECTION, 30) => Method::ConnectionTune {
                channel_max: take_u16(buf)?,
                frame_max: take_u32(buf)?,
                heartbeat: take_u16(buf)?,
            },
            (CONNECTION, 31) => Method::ConnectionTuneOk {
                channel_max: take_u16(buf)?,
                frame_max: take_u32(buf)?,
                heartbeat: take_u16(buf)?,
            },
            (CONNECTION, 40) => {
                let vhost = take_short_str(buf)?;
                take_short_str(buf)?;
                take_u8(buf)?;
                Method::ConnectionOpen { vhost }
            }
            (CONNECTION, 41) => Method::ConnectionOpenOk,
            (CONNECTION, 50) => Method::ConnectionClose {
                reply_code: take_u16(buf)?,
                reply_text: take_short_str(buf)?,
                class_id: take_u16(buf)?,
                method_id: take_u16(buf)?,
            },
            (CONNECTION, 51) => Method::ConnectionCloseOk,
            (CHANNEL, 10) => Method::ChannelOpen,
            (CHANNEL, 11) => Method::ChannelOpenOk,
            (CHANNEL, 40) => Method::ChannelClose {
                reply_code: take_u16(buf)?,
                reply_text: take_short_str(buf)?,
                class_id: take_u16(buf)?,
                method_id: take_u16(buf)?,
            },
            (CHANNEL, 41) => Method::ChannelCloseOk,
            (EXCHANGE, 10) => {
                take_u16(buf)?;
                let exchange = take_short_str(buf)?;
                let kind = take_short_str(buf)?;
                let bits = take_u8(buf)?;
                Method::ExchangeDeclare {
                    exchange,
                    kind,
                    passive: bits & 0x01 != 0,
                    durable: bits & 0x02 != 0,
                }
            }
            (EXCHANGE, 11) => Method::ExchangeDeclareOk,
            (EXCHANGE, 20) => {
                take_u16(buf)?;
                let exchange = take_short_str(buf)?;
                let bits = take_u8(buf)?;
                Method::ExchangeDelete {
                    exchange,
                    if_unused: bits & 0x01 != 0,
                }
            }
            (EXCHANGE, 21) => Method::ExchangeDeleteOk,
            (BASIC, 40) => {
                take_u16(buf)?;
                let exchange = take_short_str(buf)?;
                let routing_key = take_short_str(buf)?;
                let bits = take_u8(buf)?;
                Method::BasicPublish {
                    exchange,
                    routing_key,
                    mandatory: bits & 0x01 != 0,
                    immediate: bits & 0x02 != 0,
                }
            }
            (BASIC, 80) => {
                let delivery_tag = take_u64(buf)?;
                let bits = take_u8(buf)?;
                Method::BasicAck {
                    delivery_tag,
                    multiple: bits & 0x01 != 0,
                }
            }
            (BASIC, 120) => {
                let delivery_tag = take_u64(buf)?;
                let bits = take_u8(buf)?;
                Method::BasicNack {
                    delivery_tag,
                    multiple: bits & 0x01 != 0,
                    requeue: bits & 0x02 != 0,
                }
            }
            (CONFIRM, 10) => Method::ConfirmSelect {
                nowait: take_u8(buf)? & 0x01 != 0,
            },
            (CONFIRM, 11) => Method::ConfirmSelectOk,
            (class_id, method_id) => Method::Other {
                class_id,
                method_id,
            },
        };

        Ok(method)
    }

    /// Encode class id, method id and arguments
    pub fn encode(&self, buf: &mut BytesMut) {
        let (class_id, method_id) = self.id();
        buf.put_u16(class_id);
        buf.put_u16(method_id);

        match self {
            Method::ConnectionStart {
                version_major,
                version_minor,
                server_properties,
                mechanisms,
                locales,
            } => {
                buf.put_u8(*version_major);
                buf.put_u8(*version_minor);
                put_long_str(buf, &server_properties.0);
                put_long_str(buf, mechanisms);
                put_long_str(buf, locales);
            }
            Method::ConnectionStartOk {
                client_properties,
                mechanism,
                response,
                locale,
            } => {
                put_long_str(buf, &client_properties.0);
                put_short_str(buf, mechanism);
                put_long_str(buf, response);
                put_short_str(buf, locale);
            }
            Method::ConnectionTune {
                channel_max,
                frame_max,
                heartbeat,
            }
            | Method::ConnectionTuneOk {
                channel_max,
                frame_max,
                heartbeat,
            } => {
                buf.put_u16(*channel_max);
                buf.put_u32(*frame_max);
                buf.put_u16(*heartbeat);
            }
            Method::ConnectionOpen { vhost } => {
                put_short_str(buf, vhost);
                put_short_str(buf, "");
                buf.put_u8(0);
            }
            Method::ConnectionOpenOk => put_short_str(buf, ""),
            Method::ConnectionClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            }
            | Method::ChannelClose {
                reply_code,
                reply_text,
                class_id,
                method_id,
            } => {
                buf.put_u16(*reply_code);
                put_short_str(buf, reply_text);
                buf.put_u16(*class_id);
                buf.put_u16(*method_id);
            }
            Method::ChannelOpen => put_short_str(buf, ""),
            Method::ChannelOpenOk => put_long_str(buf, b""),
            Method::ExchangeDeclare {
                exchange,
                kind,
                passive,
                durable,
            } => {
                buf.put_u16(0);
                put_short_str(buf, exchange);
                put_short_str(buf, kind);
                buf.put_u8(u8::from(*passive) | (u8::from(*durable) << 1));
                put_long_str(buf, b"");
            }
            Method::ExchangeDelete {
                exchange,
                if_unused,
            } => {
                buf.put_u16(0);
                put_short_str(buf, exchange);
                buf.put_u8(u8::from(*if_unused));
            }
            Method::BasicPublish {
                exchange,
                routing_key,
                mandatory,
                immediate,
            } => {
                buf.put_u16(0);
                put_short_str(buf, exchange);
                put_short_str(buf, routing_key);
                buf.put_u8(u8::from(*mandatory) | (u8::from(*immediate) << 1));
            }
            Method::BasicAck {
                delivery_tag,
                multiple,
            } => {
                buf.put_u64(*delivery_tag);
                buf.put_u8(u8::from(*multiple));
            }
            Method::BasicNack {
                delivery_tag,
                multiple,
                requeue,
            } => {
                buf.put_u64(*delivery_tag);
                buf.put_u8(u8::from(*multiple) | (u8::from(*requeue) << 1));
            }
            Method::ConfirmSelect { nowait } => buf.put_u8(u8::from(*nowait)),
            Method::ConnectionCloseOk
            | Method::ChannelCloseOk
            | Method::ExchangeDeclareOk
            | Method::ExchangeDeleteOk
            | Method::ConfirmSelectOk
            | Method::Other { .. } => {}
        }
    }
}

/// SASL PLAIN response: `\0user\0password`
pub fn plain_credentials(user: &str, password: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(user.len() + password.len() + 2);
    buf.put_u8(0);
    buf.put(user.as_bytes());
    buf.put_u8(0);
    buf.put(password.as_bytes());
    buf.freeze()
}

/// Names are checked with `types::check_name` before they get this far
fn put_short_str(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u8::MAX as usize, "{} byte short string", s.len());
    buf.put_u8(s.len() as u8);
    buf.put(s.as_bytes());
}

fn put_long_str(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put(bytes);
}

fn need(buf: &Bytes, n: usize) -> Result<(), FrameError> {
    if buf.remaining() < n {
        return Err(FrameError::Invalid("truncated method arguments".to_string()));
    }
    Ok(())
}

fn take_u8(buf: &mut Bytes) -> Result<u8, FrameError> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn take_u16(buf: &mut Bytes) -> Result<u16, FrameError> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn take_u32(buf: &mut Bytes) -> Result<u32, FrameError> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

pub(crate) fn take_u64(buf: &mut Bytes) -> Result<u64, FrameError> {
    need(buf, 8)?;
    Ok(buf.get_u64())
}

fn take_short_str(buf: &mut Bytes) -> Result<String, FrameError> {
    let len = take_u8(buf)? as usize;
    need(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| FrameError::Invalid("short string is not utf-8".to_string()))
}

fn take_long_bytes(buf: &mut Bytes) -> Result<Bytes, FrameError> {
    let len = take_u32(buf)? as usize;
    need(buf, len)?;
    Ok(buf.split_to(len))
}
