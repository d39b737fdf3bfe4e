use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::{self, Cursor};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid protocol")]
    InvalidProtocol,
    #[error("Incomplete")]
    Incomplete,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Array(Vec<RespValue>),
    Null,
}

impl RespValue {
    pub fn ok() -> Self {
        RespValue::SimpleString("OK".to_string())
    }

    pub fn error(msg: impl Into<String>) -> Self {
        RespValue::Error(format!("ERR {}", msg.into()))
    }

    /// Parse RESP value from buffer
    pub fn parse(buf: &mut Cursor<&[u8]>) -> Result<RespValue, RespError> {
        if !buf.has_remaining() {
            return Err(RespError::Incomplete);
        }

        match buf.get_u8() {
            b'+' => Ok(RespValue::SimpleString(read_string(buf)?)),
            b'-' => Ok(RespValue::Error(read_string(buf)?)),
            b':' => Ok(RespValue::Integer(read_number(buf)?)),
            b'$' => {
                let len = read_number(buf)?;
                if len == -1 {
                    return Ok(RespValue::Null);
                }
                let len = usize::try_from(len).map_err(|_| RespError::InvalidProtocol)?;

                if buf.remaining() < len + 2 {
                    return Err(RespError::Incomplete);
                }

                let data = Bytes::copy_from_slice(&buf.chunk()[..len]);
                buf.advance(len);

                if buf.get_u8() != b'\r' || buf.get_u8() != b'\n' {
                    return Err(RespError::InvalidProtocol);
                }

                Ok(RespValue::BulkString(data))
            }
            b'*' => {
                let count = read_number(buf)?;
                if count == -1 {
                    return Ok(RespValue::Null);
                }
                let count = usize::try_from(count).map_err(|_| RespError::InvalidProtocol)?;

                // elements are at least 3 bytes each; cap the preallocation
                let mut array = Vec::with_capacity(count.min(buf.remaining() / 3));
                for _ in 0..count {
                    array.push(RespValue::parse(buf)?);
                }

                Ok(RespValue::Array(array))
            }
            _ => Err(RespError::InvalidProtocol),
        }
    }

    /// Serialize RESP value to buffer
    pub fn serialize(&self, buf: &mut BytesMut) {
        match self {
            RespValue::SimpleString(s) => {
                buf.put_u8(b'+');
                buf.put(s.as_bytes());
                buf.put(&b"\r\n"[..]);
            }
            RespValue::Error(s) => {
                buf.put_u8(b'-');
                buf.put(s.as_bytes());
                buf.put(&b"\r\n"[..]);
            }
            RespValue::Integer(n) => {
                buf.put_u8(b':');
                buf.put(n.to_string().as_bytes());
                buf.put(&b"\r\n"[..]);
            }
            RespValue::BulkString(data) => {
                buf.put_u8(b'$');
                buf.put(data.len().to_string().as_bytes());
                buf.put(&b"\r\n"[..]);
                buf.put(data.as_ref());
                buf.put(&b"\r\n"[..]);
            }
            RespValue::Array(arr) => {
                buf.put_u8(b'*');
                buf.put(arr.len().to_string().as_bytes());
                buf.put(&b"\r\n"[..]);
                for val in arr {
                    val.serialize(buf);
                }
            }
            RespValue::Null => {
                buf.put(&b"$-1\r\n"[..]);
            }
        }
    }

    /// Raw bytes of a bulk or simple string, or the decimal text of an integer
    pub fn as_bytes(&self) -> Option<Bytes> {
        match self {
            RespValue::BulkString(data) => Some(data.clone()),
            RespValue::SimpleString(s) => Some(Bytes::copy_from_slice(s.as_bytes())),
            RespValue::Integer(n) => Some(Bytes::from(n.to_string())),
            _ => None,
        }
    }

    /// Elements of an array of string-like values (a client request)
    pub fn as_request(&self) -> Option<Vec<Bytes>> {
        match self {
            RespValue::Array(arr) => arr.iter().map(RespValue::as_bytes).collect(),
            _ => None,
        }
    }
}

fn read_line<'a>(buf: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], RespError> {
    let start = buf.position() as usize;
    let data: &'a [u8] = buf.get_ref();
    let slice = &data[start..];

    match slice.windows(2).position(|w| w == b"\r\n") {
        Some(i) => {
            buf.advance(i + 2);
            Ok(&slice[..i])
        }
        None => Err(RespError::Incomplete),
    }
}

fn read_string(buf: &mut Cursor<&[u8]>) -> Result<String, RespError> {
    Ok(String::from_utf8_lossy(read_line(buf)?).to_string())
}

fn read_number(buf: &mut Cursor<&[u8]>) -> Result<i64, RespError> {
    std::str::from_utf8(read_line(buf)?)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or(RespError::InvalidProtocol)
}
