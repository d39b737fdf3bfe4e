use crate::broker::connection::{Connection, RpcReply};
use crate::broker::{BrokerError, BrokerEvent};
use crate::config::BrokerConfig;
use crate::types::{ConnectionState, DeliveryTag, Epoch, Rpc, check_name};
use bytes::Bytes;
use std::future;
use std::io;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const REQUEST_QUEUE_DEPTH: usize = 1024;

enum Request {
    Connect {
        reply: oneshot::Sender<Result<Epoch, BrokerError>>,
    },
    Publish {
        exchange: String,
        routing_key: String,
        payload: Bytes,
        reply: oneshot::Sender<Result<DeliveryTag, BrokerError>>,
    },
    Rpc {
        rpc: Rpc,
        reply: RpcReply,
    },
    /// Drop the connection, reported as a loss
    Disconnect { reason: String },
}

/// Cloneable front end of the broker actor
#[derive(Clone)]
pub struct BrokerHandle {
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ConnectionState>,
    rpc_timeout: Duration,
}

impl BrokerHandle {
    /// Establish the connection if it is not already running
    ///
    /// Returns the epoch of the running connection; acks are reported
    /// under it.
    pub async fn connect(&self) -> Result<Epoch, BrokerError> {
        let (reply, rx) = oneshot::channel();
        self.request(Request::Connect { reply }).await?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }

    /// Send a message on the message channel, returning its delivery tag
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Bytes,
    ) -> Result<DeliveryTag, BrokerError> {
        check_name("exchange", exchange)?;
        check_name("routing key", routing_key)?;

        let (reply, rx) = oneshot::channel();
        self.request(Request::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            reply,
        })
        .await?;
        rx.await.map_err(|_| BrokerError::Closed)?
    }

    /// Run a synchronous method and wait for the broker's answer
    ///
    /// A broker that does not answer within the rpc timeout is presumed
    /// gone: the connection is torn down and reported as lost.
    pub async fn rpc(&self, rpc: Rpc) -> Result<(), BrokerError> {
        rpc.check()?;

        let (reply, rx) = oneshot::channel();
        let action = rpc.action();
        self.request(Request::Rpc { rpc, reply }).await?;

        match tokio::time::timeout(self.rpc_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BrokerError::ConnectionLost(
                "connection dropped before the rpc was answered".to_string(),
            )),
            Err(_) => {
                warn!("{} not answered within {:?}", action, self.rpc_timeout);
                let _ = self
                    .request(Request::Disconnect {
                        reason: format!("{} timed out", action),
                    })
                    .await;
                Err(BrokerError::Timeout(action.to_string()))
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Wait until the connection reaches `want`
    pub async fn wait_for_state(&self, want: ConnectionState) -> Result<(), BrokerError> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == want)
            .await
            .map(|_| ())
            .map_err(|_| BrokerError::Closed)
    }

    async fn request(&self, request: Request) -> Result<(), BrokerError> {
        self.requests
            .send(request)
            .await
            .map_err(|_| BrokerError::Closed)
    }
}

/// Owner side of the broker actor task
pub struct BrokerActor {
    handle: BrokerHandle,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl BrokerActor {
    /// Start the actor task and wait until it is ready for requests
    ///
    /// The actor starts disconnected; call [`BrokerHandle::connect`].
    pub async fn spawn(
        config: BrokerConfig,
    ) -> Result<(BrokerActor, mpsc::UnboundedReceiver<BrokerEvent>), BrokerError> {
        let (requests_tx, requests_rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        let handle = BrokerHandle {
            requests: requests_tx,
            state: state_rx,
            rpc_timeout: config.rpc_timeout(),
        };

        let actor = Actor {
            config,
            epoch: 0,
            conn: None,
            heartbeat: None,
            state: state_tx,
            events: events_tx,
        };
        let task = tokio::spawn(actor.run(requests_rx, shutdown_rx, ready_tx));

        ready_rx.await.map_err(|_| BrokerError::Closed)?;

        Ok((
            BrokerActor {
                handle,
                shutdown: shutdown_tx,
                task,
            },
            events_rx,
        ))
    }

    pub fn handle(&self) -> BrokerHandle {
        self.handle.clone()
    }

    /// Close the connection and wait for the task to finish
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!("broker actor task failed: {}", e);
        }
    }
}

enum Wake {
    Shutdown,
    Request(Option<Request>),
    Readable(io::Result<()>),
    Heartbeat,
}

struct Actor {
    config: BrokerConfig,
    /// Bumped on every successful connect
    epoch: Epoch,
    conn: Option<Connection>,
    heartbeat: Option<Interval>,
    state: watch::Sender<ConnectionState>,
    events: mpsc::UnboundedSender<BrokerEvent>,
}

impl Actor {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        mut shutdown: oneshot::Receiver<()>,
        ready: oneshot::Sender<()>,
    ) {
        debug!("broker actor started");
        let _ = ready.send(());

        loop {
            let wake = tokio::select! {
                _ = &mut shutdown => Wake::Shutdown,
                request = requests.recv() => Wake::Request(request),
                readable = readable(&self.conn) => Wake::Readable(readable),
                _ = tick(&mut self.heartbeat) => Wake::Heartbeat,
            };

            let keep_running = match wake {
                Wake::Shutdown | Wake::Request(None) => false,
                Wake::Request(Some(request)) => self.handle_request(request, &mut shutdown).await,
                Wake::Readable(Ok(())) => self.drain().await,
                Wake::Readable(Err(e)) => {
                    self.connection_lost(e.to_string());
                    true
                }
                Wake::Heartbeat => {
                    self.keep_alive().await;
                    true
                }
            };

            if !keep_running {
                break;
            }
        }

        self.state.send_replace(ConnectionState::Closing);
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
        self.state.send_replace(ConnectionState::Closed);
        info!("broker actor stopped");
    }

    /// Serve one request; false when shutdown arrived meanwhile
    async fn handle_request(
        &mut self,
        request: Request,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> bool {
        match request {
            Request::Connect { reply } => {
                // the handshake can stall; stay responsive to shutdown
                tokio::select! {
                    result = self.connect() => {
                        let _ = reply.send(result);
                    }
                    _ = shutdown => {
                        info!("shutdown requested while connecting");
                        let _ = reply.send(Err(BrokerError::Closed));
                        return false;
                    }
                }
            }
            Request::Publish {
                exchange,
                routing_key,
                payload,
                reply,
            } => {
                let Some(conn) = self.conn.as_mut() else {
                    let _ = reply.send(Err(not_connected()));
                    return true;
                };
                match conn.publish(&exchange, &routing_key, &payload).await {
                    Ok(tag) => {
                        let _ = reply.send(Ok(tag));
                    }
                    Err(e @ BrokerError::Invalid(_)) => {
                        let _ = reply.send(Err(e));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e.clone()));
                        self.connection_lost(e.to_string());
                    }
                }
            }
            Request::Rpc { rpc, reply } => {
                let Some(conn) = self.conn.as_mut() else {
                    let _ = reply.send(Err(not_connected()));
                    return true;
                };
                if let Err(e) = conn.rpc(&rpc, reply).await {
                    self.connection_lost(e.to_string());
                }
            }
            Request::Disconnect { reason } => {
                if self.conn.is_some() {
                    self.connection_lost(reason);
                }
            }
        }
        true
    }

    async fn connect(&mut self) -> Result<Epoch, BrokerError> {
        if self.conn.is_some() {
            return Ok(self.epoch);
        }

        let timeout = self.config.connect_timeout();
        let opened = tokio::time::timeout(timeout, Connection::open(&self.config, &self.state)).await;
        let conn = match opened {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                warn!("connecting to broker failed: {}", e);
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(e);
            }
            Err(_) => {
                warn!("connecting to broker timed out after {:?}", timeout);
                self.state.send_replace(ConnectionState::Disconnected);
                return Err(BrokerError::Timeout("connect".to_string()));
            }
        };

        self.heartbeat = conn.heartbeat().map(|period| {
            let mut interval = tokio::time::interval(period / 2);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        self.conn = Some(conn);
        self.epoch += 1;
        self.state.send_replace(ConnectionState::Running);
        debug!("broker connection {} running", self.epoch);
        Ok(self.epoch)
    }

    /// Handle everything that arrived; false when the actor must stop
    async fn drain(&mut self) -> bool {
        let Some(conn) = self.conn.as_mut() else {
            return true;
        };

        match conn.poll_acks().await {
            Ok(inbound) => {
                if !inbound.nacks.is_empty() {
                    error!(
                        "broker rejected {} message(s): {:?}",
                        inbound.nacks.len(),
                        inbound.nacks
                    );
                }
                if !inbound.acks.is_empty() {
                    let _ = self.events.send(BrokerEvent::Acked {
                        epoch: self.epoch,
                        tags: inbound.acks,
                    });
                }
                if let Some(reason) = inbound.closed {
                    self.connection_lost(reason);
                }
                true
            }
            Err(BrokerError::ConnectionLost(reason)) => {
                self.connection_lost(reason);
                true
            }
            Err(e) => {
                error!("fatal broker error: {}", e);
                let _ = self.events.send(BrokerEvent::Fatal(e));
                false
            }
        }
    }

    async fn keep_alive(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };

        if conn.heartbeat_expired() {
            self.connection_lost("broker missed its heartbeats".to_string());
            return;
        }
        if let Err(e) = conn.send_heartbeat().await {
            self.connection_lost(e.to_string());
        }
    }

    fn connection_lost(&mut self, reason: String) {
        if let Some(conn) = self.conn.take() {
            warn!(
                "lost broker connection with {} unconfirmed message(s): {}",
                conn.unconfirmed(),
                reason
            );
        }
        self.heartbeat = None;
        self.state.send_replace(ConnectionState::Disconnected);
        let _ = self.events.send(BrokerEvent::ConnectionLost);
    }
}

fn not_connected() -> BrokerError {
    BrokerError::ConnectionLost("not connected".to_string())
}

async fn readable(conn: &Option<Connection>) -> io::Result<()> {
    match conn {
        Some(conn) => conn.readable().await,
        None => future::pending().await,
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}
