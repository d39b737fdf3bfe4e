use crate::amqp::method::{self, plain_credentials};
use crate::amqp::{FieldTable, Frame, FrameError, Method, PROTOCOL_HEADER, publish_frames};
use crate::broker::{BrokerError, MESSAGE_CHANNEL, METHOD_CHANNEL};
use crate::config::BrokerConfig;
use crate::types::{ConnectionState, DeliveryTag, Rpc, check_name};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::{BTreeSet, VecDeque};
use std::io::{self, Cursor};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, trace, warn};

/// Largest frame this client accepts, whatever the broker offers
const CLIENT_FRAME_MAX: u32 = 131_072;

/// Completion slot for an rpc waiting on the method channel
pub type RpcReply = oneshot::Sender<Result<(), BrokerError>>;

/// Everything decoded from the socket in one drain
#[derive(Debug, Default)]
pub struct Inbound {
    /// Confirmed delivery tags, `multiple` acks already expanded
    pub acks: Vec<DeliveryTag>,
    /// Tags the broker refused; their records stay staged
    pub nacks: Vec<DeliveryTag>,
    /// Set when the broker closed the connection or the socket hit EOF
    pub closed: Option<String>,
}

/// An open AMQP connection with a confirm-mode message channel and a
/// method channel
pub struct Connection {
    stream: TcpStream,
    read_buf: BytesMut,
    frame_max: u32,
    heartbeat: Option<Duration>,
    last_recv: Instant,
    next_tag: DeliveryTag,
    unconfirmed: BTreeSet<DeliveryTag>,
    pending_rpcs: VecDeque<RpcReply>,
    reopening_method_channel: bool,
}

impl Connection {
    /// Connect, log in, open both channels and enable publisher confirms
    ///
    /// Intermediate states are published on `state`; the caller marks the
    /// connection running once it has stored it.
    pub async fn open(
        config: &BrokerConfig,
        state: &watch::Sender<ConnectionState>,
    ) -> Result<Connection, BrokerError> {
        check_name("vhost", &config.vhost)?;
        state.send_replace(ConnectionState::Connecting);
        debug!("connecting to broker at {}", config.addr());

        let stream = TcpStream::connect(config.addr())
            .await
            .map_err(|e| BrokerError::Connect(format!("{}: {}", config.addr(), e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        let mut conn = Connection {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            frame_max: CLIENT_FRAME_MAX,
            heartbeat: None,
            last_recv: Instant::now(),
            next_tag: 1,
            unconfirmed: BTreeSet::new(),
            pending_rpcs: VecDeque::new(),
            reopening_method_channel: false,
        };

        conn.stream
            .write_all(PROTOCOL_HEADER)
            .await
            .map_err(|e| BrokerError::Connect(e.to_string()))?;

        conn.login(config).await?;

        conn.open_channel(MESSAGE_CHANNEL).await?;
        conn.open_channel(METHOD_CHANNEL).await?;
        state.send_replace(ConnectionState::ChannelsOpen);

        conn.send(Frame::method(
            MESSAGE_CHANNEL,
            Method::ConfirmSelect { nowait: false },
        ))
        .await?;
        conn.expect(MESSAGE_CHANNEL, "confirm.select", |m| {
            matches!(m, Method::ConfirmSelectOk)
        })
        .await
        .map_err(refused("confirm.select"))?;
        state.send_replace(ConnectionState::ConfirmMode);

        info!(
            "connected to {} (frame_max {}, heartbeat {:?})",
            config.addr(),
            conn.frame_max,
            conn.heartbeat
        );
        Ok(conn)
    }

    async fn login(&mut self, config: &BrokerConfig) -> Result<(), BrokerError> {
        self.expect(0, "connection.start", |m| {
            matches!(m, Method::ConnectionStart { .. })
        })
        .await
        .map_err(refused("connection.start"))?;

        self.send(Frame::method(
            0,
            Method::ConnectionStartOk {
                client_properties: FieldTable::from_strings(&[
                    ("product", env!("CARGO_PKG_NAME")),
                    ("version", env!("CARGO_PKG_VERSION")),
                ]),
                mechanism: "PLAIN".to_string(),
                response: plain_credentials(&config.user, &config.password),
                locale: "en_US".to_string(),
            },
        ))
        .await?;

        // A broker refusing the credentials either sends connection.close
        // or drops the socket without a word.
        let (channel_max, frame_max, heartbeat) = match self.read_frame().await {
            Ok(Frame::Method {
                method:
                    Method::ConnectionTune {
                        channel_max,
                        frame_max,
                        heartbeat,
                    },
                ..
            }) => (channel_max, frame_max, heartbeat),
            Ok(Frame::Method {
                method:
                    Method::ConnectionClose {
                        reply_code,
                        reply_text,
                        ..
                    },
                ..
            }) => return Err(BrokerError::Auth(format!("{} {}", reply_code, reply_text))),
            Ok(other) => return Err(unexpected("connection.tune", &other)),
            Err(BrokerError::ConnectionLost(_)) => {
                return Err(BrokerError::Auth(
                    "broker closed the connection during login".to_string(),
                ));
            }
            Err(e) => return Err(e),
        };

        if channel_max != 0 && channel_max < METHOD_CHANNEL {
            return Err(BrokerError::Protocol(format!(
                "broker allows only {} channel(s)",
                channel_max
            )));
        }

        self.frame_max = match frame_max {
            0 => CLIENT_FRAME_MAX,
            n => n.min(CLIENT_FRAME_MAX),
        };
        let heartbeat = negotiate_heartbeat(config.heartbeat_secs, heartbeat);
        self.heartbeat = (heartbeat > 0).then(|| Duration::from_secs(u64::from(heartbeat)));

        self.send(Frame::method(
            0,
            Method::ConnectionTuneOk {
                channel_max,
                frame_max: self.frame_max,
                heartbeat,
            },
        ))
        .await?;

        self.send(Frame::method(
            0,
            Method::ConnectionOpen {
                vhost: config.vhost.clone(),
            },
        ))
        .await?;

        match self
            .expect(0, "connection.open", |m| {
                matches!(m, Method::ConnectionOpenOk)
            })
            .await
        {
            Err(BrokerError::Rpc { code, text }) if code == method::ACCESS_REFUSED => {
                Err(BrokerError::Auth(format!("vhost {}: {}", config.vhost, text)))
            }
            other => other.map(|_| ()).map_err(refused("connection.open")),
        }
    }

    async fn open_channel(&mut self, channel: u16) -> Result<(), BrokerError> {
        self.send(Frame::method(channel, Method::ChannelOpen)).await?;
        self.expect(channel, "channel.open", |m| matches!(m, Method::ChannelOpenOk))
            .await
            .map(|_| ())
            .map_err(refused("channel.open"))
    }

    /// Read until a method matching `want` arrives on `channel`
    ///
    /// Used only while setting up, before anything else can be in flight.
    /// A close from the broker is returned as `Rpc` with its reply code.
    async fn expect<F>(&mut self, channel: u16, context: &str, want: F) -> Result<Method, BrokerError>
    where
        F: Fn(&Method) -> bool,
    {
        loop {
            match self.read_frame().await? {
                Frame::Heartbeat => continue,
                Frame::Method {
                    method:
                        Method::ConnectionClose {
                            reply_code,
                            reply_text,
                            ..
                        },
                    ..
                }
                | Frame::Method {
                    method:
                        Method::ChannelClose {
                            reply_code,
                            reply_text,
                            ..
                        },
                    ..
                } => {
                    warn!("{}: broker closed with {} {}", context, reply_code, reply_text);
                    return Err(BrokerError::Rpc {
                        code: reply_code,
                        text: reply_text,
                    });
                }
                Frame::Method { channel: ch, method } if ch == channel && want(&method) => {
                    return Ok(method);
                }
                other => return Err(unexpected(context, &other)),
            }
        }
    }

    /// Wait for one complete frame
    async fn read_frame(&mut self) -> Result<Frame, BrokerError> {
        loop {
            if let Some(frame) = self.parse_buffered()? {
                return Ok(frame);
            }

            match self.stream.read_buf(&mut self.read_buf).await {
                Ok(0) => {
                    return Err(BrokerError::ConnectionLost(
                        "connection closed by broker".to_string(),
                    ));
                }
                Ok(_) => {}
                Err(e) => return Err(BrokerError::ConnectionLost(e.to_string())),
            }
        }
    }

    fn parse_buffered(&mut self) -> Result<Option<Frame>, BrokerError> {
        let parsed = {
            let mut cursor = Cursor::new(&self.read_buf[..]);
            Frame::parse(&mut cursor, self.frame_max).map(|frame| (frame, cursor.position() as usize))
        };

        match parsed {
            Ok((frame, consumed)) => {
                self.read_buf.advance(consumed);
                self.last_recv = Instant::now();
                Ok(Some(frame))
            }
            Err(FrameError::Incomplete) => Ok(None),
            Err(FrameError::Invalid(msg)) => Err(BrokerError::Protocol(msg)),
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), BrokerError> {
        let mut buf = BytesMut::new();
        frame.serialize(&mut buf);
        self.write(&buf).await
    }

    async fn write(&mut self, buf: &[u8]) -> Result<(), BrokerError> {
        self.stream
            .write_all(buf)
            .await
            .map_err(|e| BrokerError::ConnectionLost(e.to_string()))
    }

    /// Wait until the socket has something to read
    pub async fn readable(&self) -> io::Result<()> {
        self.stream.readable().await
    }

    /// Send one message on the message channel and return its delivery tag
    ///
    /// Tags count up from 1 on every new connection.
    pub async fn publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        payload: &Bytes,
    ) -> Result<DeliveryTag, BrokerError> {
        if self.heartbeat_expired() {
            return Err(BrokerError::ConnectionLost(
                "broker missed its heartbeats".to_string(),
            ));
        }

        let frames = publish_frames(MESSAGE_CHANNEL, exchange, routing_key, payload, self.frame_max)
            .map_err(|e| BrokerError::Invalid(e.to_string()))?;

        let tag = self.next_tag;
        let mut buf = BytesMut::with_capacity(payload.len() + 128);
        for frame in frames {
            frame.serialize(&mut buf);
        }
        self.write(&buf).await?;

        trace!("published message {} of size {}", tag, payload.len());
        self.next_tag += 1;
        self.unconfirmed.insert(tag);
        Ok(tag)
    }

    /// Issue a synchronous method on the method channel
    ///
    /// The reply slot completes once the broker answers; replies arrive in
    /// request order.
    pub async fn rpc(&mut self, rpc: &Rpc, reply: RpcReply) -> Result<(), BrokerError> {
        if let Err(e) = rpc.check() {
            let _ = reply.send(Err(e.into()));
            return Ok(());
        }

        let method = match rpc {
            Rpc::ExchangeDeclare { exchange, kind } => Method::ExchangeDeclare {
                exchange: exchange.clone(),
                kind: kind.clone(),
                passive: false,
                durable: true,
            },
            Rpc::ExchangeDelete { exchange } => Method::ExchangeDelete {
                exchange: exchange.clone(),
                if_unused: false,
            },
        };

        self.send(Frame::method(METHOD_CHANNEL, method)).await?;
        debug!("sent {}", rpc);
        self.pending_rpcs.push_back(reply);
        Ok(())
    }

    /// Drain everything the socket holds without waiting for more
    ///
    /// All complete frames are handled; acknowledgments that arrived
    /// together come back in one batch. Only malformed or unexpected
    /// traffic is an error.
    pub async fn poll_acks(&mut self) -> Result<Inbound, BrokerError> {
        let mut inbound = Inbound::default();

        let lost = match self.fill() {
            Ok(true) => Some("connection closed by broker".to_string()),
            Ok(false) => None,
            Err(e) => Some(e.to_string()),
        };

        while inbound.closed.is_none() {
            match self.parse_buffered()? {
                Some(frame) => self.dispatch(frame, &mut inbound).await?,
                None => break,
            }
        }

        if inbound.closed.is_none() {
            inbound.closed = lost;
        }
        Ok(inbound)
    }

    /// Read until the socket would block. Returns true on EOF.
    fn fill(&mut self) -> io::Result<bool> {
        loop {
            self.read_buf.reserve(4096);
            match self.stream.try_read_buf(&mut self.read_buf) {
                Ok(0) => return Ok(true),
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame, inbound: &mut Inbound) -> Result<(), BrokerError> {
        let (channel, method) = match frame {
            Frame::Heartbeat => return Ok(()),
            Frame::Method { channel, method } => (channel, method),
            other => return Err(unexpected("basic.ack", &other)),
        };

        match (channel, method) {
            (
                MESSAGE_CHANNEL,
                Method::BasicAck {
                    delivery_tag,
                    multiple,
                },
            ) => {
                inbound.acks.extend(self.settle(delivery_tag, multiple));
            }
            (
                MESSAGE_CHANNEL,
                Method::BasicNack {
                    delivery_tag,
                    multiple,
                    ..
                },
            ) => {
                inbound.nacks.extend(self.settle(delivery_tag, multiple));
            }
            (
                MESSAGE_CHANNEL,
                Method::ChannelClose {
                    reply_code,
                    reply_text,
                    ..
                },
            ) => {
                // Without the message channel nothing more can be confirmed
                inbound.closed = Some(format!(
                    "message channel closed by broker: {} {}",
                    reply_code, reply_text
                ));
            }
            (
                METHOD_CHANNEL,
                Method::ChannelClose {
                    reply_code,
                    reply_text,
                    ..
                },
            ) => {
                warn!("method channel closed: {} {}", reply_code, reply_text);
                // Methods pipelined behind the failed one are discarded
                for reply in self.pending_rpcs.drain(..) {
                    let _ = reply.send(Err(BrokerError::Rpc {
                        code: reply_code,
                        text: reply_text.clone(),
                    }));
                }
                self.send(Frame::method(METHOD_CHANNEL, Method::ChannelCloseOk))
                    .await?;
                self.send(Frame::method(METHOD_CHANNEL, Method::ChannelOpen))
                    .await?;
                self.reopening_method_channel = true;
            }
            (METHOD_CHANNEL, Method::ChannelOpenOk) if self.reopening_method_channel => {
                debug!("method channel reopened");
                self.reopening_method_channel = false;
            }
            (METHOD_CHANNEL, Method::ExchangeDeclareOk | Method::ExchangeDeleteOk) => {
                match self.pending_rpcs.pop_front() {
                    Some(reply) => {
                        let _ = reply.send(Ok(()));
                    }
                    None => {
                        return Err(BrokerError::Protocol(
                            "rpc reply with no request outstanding".to_string(),
                        ));
                    }
                }
            }
            (
                0,
                Method::ConnectionClose {
                    reply_code,
                    reply_text,
                    ..
                },
            ) => {
                let _ = self.send(Frame::method(0, Method::ConnectionCloseOk)).await;
                inbound.closed = Some(format!(
                    "broker closed the connection: {} {}",
                    reply_code, reply_text
                ));
            }
            (channel, method) => {
                return Err(unexpected(
                    "basic.ack",
                    &Frame::Method { channel, method },
                ));
            }
        }

        Ok(())
    }

    /// Remove settled tags from the unconfirmed set, expanding `multiple`
    fn settle(&mut self, delivery_tag: DeliveryTag, multiple: bool) -> Vec<DeliveryTag> {
        if multiple {
            let rest = self.unconfirmed.split_off(&(delivery_tag + 1));
            let settled = std::mem::replace(&mut self.unconfirmed, rest);
            settled.into_iter().collect()
        } else if self.unconfirmed.remove(&delivery_tag) {
            vec![delivery_tag]
        } else {
            trace!("ignoring repeated ack for {}", delivery_tag);
            Vec::new()
        }
    }

    /// Delivery tags sent on this connection and not yet settled
    pub fn unconfirmed(&self) -> usize {
        self.unconfirmed.len()
    }

    pub fn heartbeat(&self) -> Option<Duration> {
        self.heartbeat
    }

    /// True once nothing was heard from the broker for two intervals
    pub fn heartbeat_expired(&self) -> bool {
        match self.heartbeat {
            Some(interval) => self.last_recv.elapsed() > interval * 2,
            None => false,
        }
    }

    pub async fn send_heartbeat(&mut self) -> Result<(), BrokerError> {
        self.send(Frame::Heartbeat).await
    }

    /// Close both channels and the connection, waiting briefly for the
    /// broker to confirm
    pub async fn close(mut self) {
        let mut buf = BytesMut::new();
        for channel in [MESSAGE_CHANNEL, METHOD_CHANNEL] {
            Frame::method(channel, close_method()).serialize(&mut buf);
        }
        Frame::method(0, Method::ConnectionClose {
            reply_code: method::REPLY_SUCCESS,
            reply_text: "Goodbye".to_string(),
            class_id: 0,
            method_id: 0,
        })
        .serialize(&mut buf);

        if let Err(e) = self.write(&buf).await {
            debug!("closing an already broken connection: {}", e);
            return;
        }

        let wait_for_close_ok = async {
            loop {
                match self.read_frame().await {
                    Ok(Frame::Method {
                        method: Method::ConnectionCloseOk,
                        ..
                    }) => return,
                    Ok(_) => continue,
                    Err(_) => return,
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(1), wait_for_close_ok)
            .await
            .is_err()
        {
            warn!("broker did not confirm connection.close");
        }
    }
}

fn close_method() -> Method {
    Method::ChannelClose {
        reply_code: method::REPLY_SUCCESS,
        reply_text: "Goodbye".to_string(),
        class_id: 0,
        method_id: 0,
    }
}

/// The broker's offer wins unless both sides ask for heartbeats, then the
/// shorter interval is used. Zero from the client disables them.
fn negotiate_heartbeat(requested: u16, offered: u16) -> u16 {
    match (requested, offered) {
        (0, _) => 0,
        (requested, 0) => requested,
        (requested, offered) => requested.min(offered),
    }
}

/// During setup a close from the broker is a protocol failure, not an rpc error
fn refused(context: &'static str) -> impl Fn(BrokerError) -> BrokerError {
    move |e| match e {
        BrokerError::Rpc { code, text } => {
            BrokerError::Protocol(format!("{} refused: {} {}", context, code, text))
        }
        other => other,
    }
}

fn unexpected(expected: &str, frame: &Frame) -> BrokerError {
    let got = match frame {
        Frame::Method { channel, method } => {
            let (class_id, method_id) = method.id();
            format!("method {}.{} on channel {}", class_id, method_id, channel)
        }
        Frame::Header { channel, .. } => format!("content header on channel {}", channel),
        Frame::Body { channel, .. } => format!("content body on channel {}", channel),
        Frame::Heartbeat => "heartbeat".to_string(),
    };
    error!("expected {} but got {}", expected, got);
    BrokerError::Protocol(format!("expected {}, got {}", expected, got))
}
