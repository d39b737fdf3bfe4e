use crate::network::Backend;
use crate::resp::{RespError, RespValue};
use crate::sequencer::{RelayError, Sequencer};
use crate::types::Rpc;
use bytes::{Buf, Bytes, BytesMut};
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Version every request must carry as its first element
pub const PROTOCOL_VERSION: &str = "100";

/// Client-facing RESP server
///
/// Requests are arrays `[version, action, args...]`:
/// `PUBLISH exchange routing_key payload`, `RPC action args...`, `PING`, `STATS`.
pub struct ApiServer<B: Backend> {
    sequencer: Arc<Sequencer<B>>,
}

impl<B: Backend + 'static> ApiServer<B> {
    pub fn new(sequencer: Arc<Sequencer<B>>) -> Self {
        Self { sequencer }
    }

    /// Accept clients on an already bound listener
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        info!("API server listening on {}", listener.local_addr()?);
        loop {
            let (socket, addr) = listener.accept().await?;
            debug!("New connection from {}", addr);

            let sequencer = Arc::clone(&self.sequencer);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(socket, sequencer).await {
                    error!("Connection error: {}", e);
                }
            });
        }
    }
}

async fn handle_connection<B: Backend>(
    mut socket: TcpStream,
    sequencer: Arc<Sequencer<B>>,
) -> Result<(), RespError> {
    let mut buffer = BytesMut::with_capacity(4096);

    loop {
        let n = socket.read_buf(&mut buffer).await?;
        if n == 0 {
            debug!("Connection closed");
            return Ok(());
        }

        // pipelined requests may share one read
        loop {
            let mut cursor = Cursor::new(&buffer[..]);
            let response = match RespValue::parse(&mut cursor) {
                Ok(value) => {
                    let pos = cursor.position() as usize;
                    buffer.advance(pos);
                    process_request(&sequencer, value).await
                }
                Err(RespError::Incomplete) => break,
                Err(e) => {
                    warn!("Protocol error: {}", e);
                    write_response(&mut socket, &RespValue::error("malformed request")).await?;
                    return Ok(());
                }
            };

            write_response(&mut socket, &response).await?;
        }
    }
}

async fn write_response(socket: &mut TcpStream, response: &RespValue) -> Result<(), RespError> {
    let mut response_buf = BytesMut::new();
    response.serialize(&mut response_buf);
    socket.write_all(&response_buf).await?;
    Ok(())
}

async fn process_request<B: Backend>(sequencer: &Sequencer<B>, value: RespValue) -> RespValue {
    let parts = match value.as_request() {
        Some(parts) if parts.len() >= 2 => parts,
        _ => return RespValue::error("malformed request"),
    };

    if parts[0].as_ref() != PROTOCOL_VERSION.as_bytes() {
        debug!(
            "rejecting request with version {}",
            String::from_utf8_lossy(&parts[0])
        );
        return RespValue::error("unsupported version");
    }

    let action = String::from_utf8_lossy(&parts[1]).to_uppercase();
    let args = &parts[2..];

    match action.as_str() {
        "PUBLISH" => cmd_publish(sequencer, args).await,
        "RPC" => cmd_rpc(sequencer, args).await,
        "PING" => RespValue::SimpleString("PONG".to_string()),
        "STATS" => cmd_stats(sequencer).await,
        other => {
            debug!("unsupported action {}", other);
            RespValue::error("method not supported")
        }
    }
}

async fn cmd_publish<B: Backend>(sequencer: &Sequencer<B>, args: &[Bytes]) -> RespValue {
    let (exchange, routing_key, payload) = match args {
        [exchange, routing_key, payload] => (exchange, routing_key, payload.clone()),
        [_, _] => return RespValue::error("no payload provided"),
        _ => return RespValue::error("malformed request"),
    };

    let (Ok(exchange), Ok(routing_key)) = (
        std::str::from_utf8(exchange),
        std::str::from_utf8(routing_key),
    ) else {
        return RespValue::error("malformed request");
    };

    match sequencer.publish(exchange, routing_key, payload).await {
        Ok(sequence) => RespValue::Integer(sequence as i64),
        // durable already; goes out with the next replay
        Err(RelayError::Unsent { sequence, .. }) => RespValue::Integer(sequence as i64),
        Err(e @ RelayError::Invalid(_)) => RespValue::error(e.to_string()),
        Err(e) => {
            error!("PUBLISH to {}/{} failed: {}", exchange, routing_key, e);
            RespValue::error("publishing failed")
        }
    }
}

async fn cmd_rpc<B: Backend>(sequencer: &Sequencer<B>, args: &[Bytes]) -> RespValue {
    let Some((action, rest)) = args.split_first() else {
        return RespValue::error("malformed request");
    };

    let words: Vec<String> = rest
        .iter()
        .map(|arg| String::from_utf8_lossy(arg).to_string())
        .collect();
    let words: Vec<&str> = words.iter().map(String::as_str).collect();

    let rpc = match Rpc::parse(&String::from_utf8_lossy(action), &words) {
        Ok(rpc) => rpc,
        Err(e) => {
            debug!("bad rpc request: {}", e);
            return RespValue::error("malformed request");
        }
    };

    match sequencer.rpc(rpc).await {
        Ok(()) => RespValue::ok(),
        Err(RelayError::Broker(e @ crate::broker::BrokerError::Rpc { .. })) => {
            RespValue::error(e.to_string())
        }
        Err(e) => RespValue::error(format!("rpc failed: {}", e)),
    }
}

async fn cmd_stats<B: Backend>(sequencer: &Sequencer<B>) -> RespValue {
    match sequencer.staged_count().await {
        Ok(staged) => {
            let stats = serde_json::json!({ "staged": staged });
            RespValue::BulkString(Bytes::from(stats.to_string()))
        }
        Err(e) => {
            error!("STATS failed: {}", e);
            RespValue::error("stats unavailable")
        }
    }
}
