#![allow(dead_code)]

//! Scripted AMQP broker for driving the client over real sockets

use bytes::{Buf, Bytes, BytesMut};
use relay::amqp::method::EXCHANGE;
use relay::amqp::{FieldTable, Frame, FrameError, Method};
use relay::config::{BrokerConfig, StorageConfig};
use relay::storage::SqliteStore;
use std::io::Cursor;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

/// A message as the broker saw it
#[derive(Debug, Clone, PartialEq)]
pub struct Received {
    pub connection: usize,
    pub tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Acknowledge each publish as soon as its body is complete
    pub auto_ack: bool,
    /// Hang up after connection.start-ok like a broker refusing the login
    pub reject_login: bool,
    /// Answer exchange.declare of this exchange with channel.close(code, text)
    pub refuse_declare: Option<(String, u16, String)>,
    /// Leave exchange methods unanswered
    pub ignore_rpcs: bool,
    /// Heartbeat interval offered in connection.tune
    pub heartbeat: u16,
    /// Accept the protocol header, then never answer
    pub stall_handshake: bool,
}

enum Control {
    Acks { tags: Vec<u64>, multiple: bool },
    Raw(Bytes),
    Hangup,
}

pub struct MockBroker {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Received>>>,
    connections: Arc<Mutex<Vec<mpsc::UnboundedSender<Control>>>>,
}

impl MockBroker {
    pub async fn start(behavior: Behavior) -> MockBroker {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(Mutex::new(Vec::new()));

        let accept_received = Arc::clone(&received);
        let accept_connections = Arc::clone(&connections);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let (tx, rx) = mpsc::unbounded_channel();
                let connection = {
                    let mut connections = accept_connections.lock().unwrap();
                    connections.push(tx);
                    connections.len()
                };
                tokio::spawn(session(
                    stream,
                    connection,
                    behavior.clone(),
                    Arc::clone(&accept_received),
                    rx,
                ));
            }
        });

        MockBroker {
            addr,
            received,
            connections,
        }
    }

    pub fn config(&self) -> BrokerConfig {
        BrokerConfig {
            host: "127.0.0.1".to_string(),
            port: self.addr.port(),
            vhost: "/".to_string(),
            user: "guest".to_string(),
            password: "guest".to_string(),
            heartbeat_secs: 0,
            connect_timeout_ms: 2000,
            rpc_timeout_ms: 2000,
        }
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Acknowledge tags on the latest connection, all in a single write
    pub fn send_acks(&self, tags: &[u64], multiple: bool) {
        self.control(Control::Acks {
            tags: tags.to_vec(),
            multiple,
        });
    }

    pub fn send_frame(&self, frame: Frame) {
        let mut buf = BytesMut::new();
        frame.serialize(&mut buf);
        self.control(Control::Raw(buf.freeze()));
    }

    pub fn send_raw(&self, bytes: &'static [u8]) {
        self.control(Control::Raw(Bytes::from_static(bytes)));
    }

    /// Drop the latest connection without a close handshake
    pub fn hang_up(&self) {
        self.control(Control::Hangup);
    }

    fn control(&self, control: Control) {
        let connections = self.connections.lock().unwrap();
        let latest = connections.last().expect("no client connected");
        let _ = latest.send(control);
    }

    pub async fn wait_for_received(&self, count: usize) -> Vec<Received> {
        wait_until(|| self.received.lock().unwrap().len() >= count).await;
        self.received()
    }
}

/// Poll `condition` every 10ms for up to five seconds
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

pub fn open_store(dir: &Path) -> Arc<SqliteStore> {
    let config = StorageConfig {
        db_path: dir.join("staged.db"),
        sqlite_cache_size: 1000,
        sqlite_busy_timeout: 5000,
        synchronous: "FULL".to_string(),
    };
    Arc::new(SqliteStore::open(&config.db_path, &config).unwrap())
}

const FRAME_MAX: u32 = 131_072;

#[derive(Default)]
struct FrameReader {
    buf: BytesMut,
}

impl FrameReader {
    /// Next frame, or None once the peer is gone or sent garbage
    async fn next(&mut self, stream: &mut TcpStream) -> Option<Frame> {
        loop {
            let parsed = {
                let mut cursor = Cursor::new(&self.buf[..]);
                Frame::parse(&mut cursor, FRAME_MAX).map(|frame| (frame, cursor.position() as usize))
            };
            match parsed {
                Ok((frame, consumed)) => {
                    self.buf.advance(consumed);
                    return Some(frame);
                }
                Err(FrameError::Incomplete) => {}
                Err(FrameError::Invalid(_)) => return None,
            }

            match stream.read_buf(&mut self.buf).await {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }
}

async fn send(stream: &mut TcpStream, channel: u16, method: Method) -> bool {
    let mut buf = BytesMut::new();
    Frame::method(channel, method).serialize(&mut buf);
    stream.write_all(&buf).await.is_ok()
}

async fn expect(reader: &mut FrameReader, stream: &mut TcpStream) -> Option<Method> {
    loop {
        match reader.next(stream).await? {
            Frame::Method { method, .. } => return Some(method),
            Frame::Heartbeat => continue,
            _ => return None,
        }
    }
}

enum Event {
    Frame(Option<Frame>),
    Control(Option<Control>),
}

struct Content {
    exchange: String,
    routing_key: String,
    size: u64,
    body: BytesMut,
}

async fn session(
    mut stream: TcpStream,
    connection: usize,
    behavior: Behavior,
    received: Arc<Mutex<Vec<Received>>>,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let mut header = [0u8; 8];
    if stream.read_exact(&mut header).await.is_err() || &header != b"AMQP\x00\x00\x09\x01" {
        return;
    }
    if behavior.stall_handshake {
        // hold the socket open until told to hang up
        let _ = control.recv().await;
        return;
    }

    let mut reader = FrameReader::default();
    let start = Method::ConnectionStart {
        version_major: 0,
        version_minor: 9,
        server_properties: FieldTable::from_strings(&[("product", "mock")]),
        mechanisms: Bytes::from_static(b"PLAIN"),
        locales: Bytes::from_static(b"en_US"),
    };
    if !send(&mut stream, 0, start).await {
        return;
    }
    let Some(Method::ConnectionStartOk { .. }) = expect(&mut reader, &mut stream).await else {
        return;
    };
    if behavior.reject_login {
        return;
    }

    let tune = Method::ConnectionTune {
        channel_max: 2047,
        frame_max: FRAME_MAX,
        heartbeat: behavior.heartbeat,
    };
    if !send(&mut stream, 0, tune).await {
        return;
    }
    let Some(Method::ConnectionTuneOk { .. }) = expect(&mut reader, &mut stream).await else {
        return;
    };
    let Some(Method::ConnectionOpen { .. }) = expect(&mut reader, &mut stream).await else {
        return;
    };
    if !send(&mut stream, 0, Method::ConnectionOpenOk).await {
        return;
    }

    let mut next_tag = 0;
    let mut content: Option<Content> = None;

    loop {
        let event = tokio::select! {
            frame = reader.next(&mut stream) => Event::Frame(frame),
            control = control.recv() => Event::Control(control),
        };

        let frame = match event {
            Event::Frame(Some(frame)) => frame,
            Event::Frame(None) | Event::Control(None) | Event::Control(Some(Control::Hangup)) => {
                return;
            }
            Event::Control(Some(Control::Acks { tags, multiple })) => {
                let mut buf = BytesMut::new();
                for delivery_tag in tags {
                    Frame::method(
                        1,
                        Method::BasicAck {
                            delivery_tag,
                            multiple,
                        },
                    )
                    .serialize(&mut buf);
                }
                if stream.write_all(&buf).await.is_err() {
                    return;
                }
                continue;
            }
            Event::Control(Some(Control::Raw(bytes))) => {
                if stream.write_all(&bytes).await.is_err() {
                    return;
                }
                continue;
            }
        };

        let (channel, reply) = match frame {
            Frame::Heartbeat => continue,
            Frame::Method { channel, method } => match method {
                Method::ChannelOpen => (channel, Some(Method::ChannelOpenOk)),
                Method::ConfirmSelect { .. } => (channel, Some(Method::ConfirmSelectOk)),
                Method::ExchangeDeclare { exchange, .. } => match &behavior.refuse_declare {
                    Some((name, code, text)) if *name == exchange => (
                        channel,
                        Some(Method::ChannelClose {
                            reply_code: *code,
                            reply_text: text.clone(),
                            class_id: EXCHANGE,
                            method_id: 10,
                        }),
                    ),
                    _ if behavior.ignore_rpcs => continue,
                    _ => (channel, Some(Method::ExchangeDeclareOk)),
                },
                Method::ExchangeDelete { .. } if behavior.ignore_rpcs => continue,
                Method::ExchangeDelete { .. } => (channel, Some(Method::ExchangeDeleteOk)),
                Method::ChannelClose { .. } => (channel, Some(Method::ChannelCloseOk)),
                Method::ConnectionClose { .. } => {
                    let _ = send(&mut stream, 0, Method::ConnectionCloseOk).await;
                    return;
                }
                Method::BasicPublish {
                    exchange,
                    routing_key,
                    ..
                } => {
                    content = Some(Content {
                        exchange,
                        routing_key,
                        size: 0,
                        body: BytesMut::new(),
                    });
                    continue;
                }
                _ => continue,
            },
            Frame::Header {
                channel, body_size, ..
            } => {
                if let Some(content) = content.as_mut() {
                    content.size = body_size;
                }
                (channel, None)
            }
            Frame::Body { channel, payload } => {
                if let Some(content) = content.as_mut() {
                    content.body.extend_from_slice(&payload);
                }
                (channel, None)
            }
        };

        if let Some(method) = reply {
            if !send(&mut stream, channel, method).await {
                return;
            }
            continue;
        }

        let complete = content
            .as_ref()
            .is_some_and(|c| c.body.len() as u64 == c.size);
        if !complete {
            continue;
        }
        if let Some(done) = content.take() {
            next_tag += 1;
            received.lock().unwrap().push(Received {
                connection,
                tag: next_tag,
                exchange: done.exchange,
                routing_key: done.routing_key,
                payload: done.body.freeze(),
            });
            if behavior.auto_ack {
                let ack = Method::BasicAck {
                    delivery_tag: next_tag,
                    multiple: false,
                };
                if !send(&mut stream, channel, ack).await {
                    return;
                }
            }
        }
    }
}
