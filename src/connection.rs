//! Per-endpoint connection task.
//!
//! Each endpoint gets exactly one tokio task owning all of its mutable
//! state: the socket, the FIFO request queue, the reassembly buffer, and
//! the three timers (per-request timeout, watchdog, reconnect backoff).
//! The manager talks to the task over an mpsc command channel and each
//! request completes through its own oneshot, so no locks guard the
//! queue or timers.
//!
//! Traffic discipline is strict single-flight: the head-of-queue frame is
//! written and no further bytes go out until that head is resolved by a
//! reply, a timeout, or connection teardown. Responses are matched to the
//! head in FIFO order and additionally verified against the transaction
//! id and unit id the head carried; a mismatch means the stream can no
//! longer be trusted and forces a reconnect.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::codec::{self, Frame, FrameBuffer, ResponsePayload};
use crate::error::{LinkError, LinkResult};
use crate::listener::ErrorListeners;
use crate::manager::{EndpointId, LinkConfig};
use crate::protocol::Request;
use crate::util;

const COMMAND_CHANNEL_CAPACITY: usize = 64;
const CHUNK_CHANNEL_CAPACITY: usize = 32;
const READ_BUFFER_SIZE: usize = 512;

/// Connection state of a single endpoint. `Suspended` is entered by
/// explicit request or after too many consecutive failed reconnects, and
/// left only through an explicit resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Suspended,
}

/// Reconnect delay after `attempts` consecutive failures.
pub fn backoff_delay(base_ms: u64, cap_ms: u64, attempts: u32) -> Duration {
    let factor = 1u64 << attempts.min(16);
    Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
}

#[derive(Debug)]
pub(crate) enum Command {
    Send {
        request: Request,
        reply: oneshot::Sender<LinkResult<ResponsePayload>>,
    },
    Suspend {
        done: oneshot::Sender<()>,
    },
    Resume {
        done: oneshot::Sender<()>,
    },
    Close {
        done: oneshot::Sender<()>,
    },
}

/// Manager-side handle to a running connection task.
#[derive(Debug, Clone)]
pub(crate) struct ConnectionHandle {
    pub commands: mpsc::Sender<Command>,
    pub suspended: Arc<AtomicBool>,
}

impl ConnectionHandle {
    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }
}

/// Spawn the connection task for an endpoint.
pub(crate) fn spawn(
    endpoint: EndpointId,
    config: LinkConfig,
    listeners: ErrorListeners,
) -> ConnectionHandle {
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    let suspended = Arc::new(AtomicBool::new(false));
    let connection = Connection {
        endpoint,
        config,
        listeners,
        commands: rx,
        suspended: suspended.clone(),
        queue: VecDeque::new(),
        link: None,
        state: ConnectionState::Disconnected,
        attempts: 0,
        reconnect_at: None,
        watchdog_at: None,
    };
    tokio::spawn(connection.run());
    ConnectionHandle {
        commands: tx,
        suspended,
    }
}

/// One queued request. `written` flips when its bytes hit the socket;
/// only the head of the queue is ever written.
struct Pending {
    request: Request,
    frame: Frame,
    reply: oneshot::Sender<LinkResult<ResponsePayload>>,
    deadline: Instant,
    written: bool,
}

/// Live socket state for one connection generation. Destroyed whole on
/// any failure, taking the partial reassembly buffer with it.
struct Link {
    writer: OwnedWriteHalf,
    chunks: mpsc::Receiver<LinkResult<Vec<u8>>>,
    buffer: FrameBuffer,
    reader: JoinHandle<()>,
}

struct Connection {
    endpoint: EndpointId,
    config: LinkConfig,
    listeners: ErrorListeners,
    commands: mpsc::Receiver<Command>,
    suspended: Arc<AtomicBool>,
    queue: VecDeque<Pending>,
    link: Option<Link>,
    state: ConnectionState,
    attempts: u32,
    reconnect_at: Option<Instant>,
    watchdog_at: Option<Instant>,
}

impl Connection {
    async fn run(mut self) {
        loop {
            let now = Instant::now();
            // FIFO plus equal timeouts means the head always expires first.
            let head_deadline = self.queue.front().map(|pending| pending.deadline);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Send { request, reply }) => {
                        self.handle_send(request, reply).await;
                    }
                    Some(Command::Suspend { done }) => {
                        self.enter_suspended("endpoint suspended");
                        let _ = done.send(());
                    }
                    Some(Command::Resume { done }) => {
                        self.handle_resume().await;
                        let _ = done.send(());
                    }
                    Some(Command::Close { done }) => {
                        self.shutdown();
                        let _ = done.send(());
                        return;
                    }
                    None => {
                        self.shutdown();
                        return;
                    }
                },
                chunk = recv_chunk(&mut self.link) => {
                    self.handle_chunk(chunk).await;
                }
                _ = sleep_until(head_deadline.unwrap_or(now)), if head_deadline.is_some() => {
                    self.handle_request_timeout();
                }
                _ = sleep_until(self.watchdog_at.unwrap_or(now)), if self.watchdog_at.is_some() => {
                    warn!(endpoint = %self.endpoint, "watchdog expired, forcing reconnect");
                    let error = LinkError::transport(format!(
                        "no data received for {}ms",
                        self.config.watchdog_timeout.as_millis()
                    ));
                    self.handle_failure(error);
                }
                _ = sleep_until(self.reconnect_at.unwrap_or(now)), if self.reconnect_at.is_some() => {
                    self.reconnect_at = None;
                    self.try_connect().await;
                }
            }
        }
    }

    async fn handle_send(
        &mut self,
        request: Request,
        reply: oneshot::Sender<LinkResult<ResponsePayload>>,
    ) {
        if self.state == ConnectionState::Suspended {
            let _ = reply.send(Err(LinkError::closed("endpoint suspended")));
            return;
        }

        let frame = match codec::encode_request(&request) {
            Ok(frame) => frame,
            Err(error) => {
                let _ = reply.send(Err(error));
                return;
            }
        };

        self.queue.push_back(Pending {
            request,
            frame,
            reply,
            deadline: Instant::now() + self.config.response_timeout,
            written: false,
        });

        match self.state {
            ConnectionState::Connected => self.pump().await,
            ConnectionState::Disconnected if self.reconnect_at.is_none() => {
                // Lazy open on first demand.
                self.try_connect().await;
            }
            // Queued; flushed once the pending reconnect lands.
            _ => {}
        }
    }

    async fn try_connect(&mut self) {
        self.state = ConnectionState::Connecting;
        info!(endpoint = %self.endpoint, attempts = self.attempts, "connecting");

        let connect = TcpStream::connect((self.endpoint.host.as_str(), self.endpoint.port));
        match timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                let (read_half, writer) = stream.into_split();
                let (chunk_tx, chunks) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
                let reader = spawn_reader(read_half, chunk_tx);
                self.link = Some(Link {
                    writer,
                    chunks,
                    buffer: FrameBuffer::new(),
                    reader,
                });
                self.state = ConnectionState::Connected;
                self.attempts = 0;
                self.watchdog_at = Some(Instant::now() + self.config.watchdog_timeout);
                info!(endpoint = %self.endpoint, "connected");
                self.pump().await;
            }
            Ok(Err(error)) => self.connect_failed(error.into()),
            Err(_) => self.connect_failed(LinkError::timeout(
                "connect",
                self.config.connect_timeout.as_millis() as u64,
            )),
        }
    }

    fn connect_failed(&mut self, error: LinkError) {
        self.state = ConnectionState::Disconnected;
        self.destroy_link();
        self.attempts += 1;
        warn!(
            endpoint = %self.endpoint,
            attempts = self.attempts,
            error = %error,
            "connect failed"
        );
        self.drain_queue(&error);
        self.listeners.notify(&self.endpoint, &error);

        if self.attempts >= self.config.max_reconnect_attempts {
            self.enter_suspended("suspended after repeated connect failures");
        } else {
            self.schedule_reconnect();
        }
    }

    /// Disconnect handling: socket error, peer close, watchdog expiry, or
    /// a response-correlation failure all land here.
    fn handle_failure(&mut self, error: LinkError) {
        self.destroy_link();
        self.watchdog_at = None;
        self.drain_queue(&error);
        self.listeners.notify(&self.endpoint, &error);

        if self.state == ConnectionState::Suspended {
            return;
        }
        self.state = ConnectionState::Disconnected;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        if self.reconnect_at.is_some() || self.state == ConnectionState::Suspended {
            return;
        }
        // Attempt k (counted from 0) waits base * 2^k before retrying.
        let delay = backoff_delay(
            self.config.backoff_base_ms,
            self.config.backoff_cap_ms,
            self.attempts.saturating_sub(1),
        );
        debug!(
            endpoint = %self.endpoint,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );
        self.reconnect_at = Some(Instant::now() + delay);
    }

    fn handle_request_timeout(&mut self) {
        let error = LinkError::timeout(
            "request",
            self.config.response_timeout.as_millis() as u64,
        );
        if let Some(head) = self.queue.pop_front() {
            let _ = head.reply.send(Err(error.clone()));
        }
        // An unanswered request means the link itself is unhealthy.
        self.handle_failure(error);
    }

    async fn handle_chunk(&mut self, chunk: LinkResult<Vec<u8>>) {
        let bytes = match chunk {
            Ok(bytes) => bytes,
            Err(error) => {
                self.handle_failure(error);
                return;
            }
        };

        util::log_packet("RX", &self.endpoint.to_string(), &bytes);
        self.watchdog_at = Some(Instant::now() + self.config.watchdog_timeout);

        let Some(link) = self.link.as_mut() else {
            return;
        };
        link.buffer.push(&bytes);

        loop {
            let frame = match self.link.as_mut() {
                Some(link) => link.buffer.take_frame(),
                None => return,
            };
            match frame {
                Ok(Some(frame)) => {
                    if !self.resolve_frame(frame) {
                        return;
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    self.handle_failure(error);
                    return;
                }
            }
        }
        self.pump().await;
    }

    /// Complete the head request with a received frame. Returns false if
    /// the frame forced a disconnect.
    fn resolve_frame(&mut self, frame: Frame) -> bool {
        let head = match self.queue.front() {
            Some(head) if head.written => self.queue.pop_front(),
            _ => None,
        };
        let Some(head) = head else {
            let error = LinkError::transport("response received with no request in flight");
            self.handle_failure(error);
            return false;
        };

        if frame.transaction_id() != head.frame.transaction_id()
            || frame.unit_id() != head.request.unit_id
        {
            let error = LinkError::transport(format!(
                "response correlation mismatch: sent tid {} unit {}, got tid {} unit {}",
                head.frame.transaction_id(),
                head.request.unit_id,
                frame.transaction_id(),
                frame.unit_id()
            ));
            let _ = head.reply.send(Err(error.clone()));
            self.handle_failure(error);
            return false;
        }

        // Exceptions and malformed bodies fail the request only; the
        // stream framing is still intact. A malformed body from a live
        // device is a transport fault to the caller, not an encode error.
        let result = codec::decode_response(&frame, &head.request).map_err(|error| match error {
            LinkError::Frame { message } => LinkError::transport(message),
            other => other,
        });
        let _ = head.reply.send(result);
        true
    }

    /// Write the head-of-queue frame if nothing is in flight.
    async fn pump(&mut self) {
        if self.state != ConnectionState::Connected {
            return;
        }
        let bytes = match self.queue.front_mut() {
            Some(head) if !head.written => {
                head.written = true;
                head.frame.as_bytes().to_vec()
            }
            _ => return,
        };

        util::log_packet("TX", &self.endpoint.to_string(), &bytes);
        let result = match self.link.as_mut() {
            Some(link) => link.writer.write_all(&bytes).await,
            None => return,
        };
        if let Err(error) = result {
            self.handle_failure(error.into());
        }
    }

    fn enter_suspended(&mut self, reason: &str) {
        warn!(endpoint = %self.endpoint, reason, "endpoint suspended");
        self.state = ConnectionState::Suspended;
        self.suspended.store(true, Ordering::SeqCst);
        self.destroy_link();
        self.watchdog_at = None;
        self.reconnect_at = None;
        self.drain_queue(&LinkError::closed(reason));
    }

    async fn handle_resume(&mut self) {
        if self.state != ConnectionState::Suspended {
            return;
        }
        info!(endpoint = %self.endpoint, "endpoint resumed");
        self.suspended.store(false, Ordering::SeqCst);
        self.state = ConnectionState::Disconnected;
        self.attempts = 0;
        self.try_connect().await;
    }

    fn shutdown(&mut self) {
        self.destroy_link();
        self.watchdog_at = None;
        self.reconnect_at = None;
        self.drain_queue(&LinkError::closed("connection closed"));
    }

    fn destroy_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.reader.abort();
        }
    }

    fn drain_queue(&mut self, error: &LinkError) {
        for pending in self.queue.drain(..) {
            let _ = pending.reply.send(Err(error.clone()));
        }
    }
}

async fn recv_chunk(link: &mut Option<Link>) -> LinkResult<Vec<u8>> {
    match link {
        Some(link) => match link.chunks.recv().await {
            Some(result) => result,
            None => Err(LinkError::transport("socket reader stopped")),
        },
        None => std::future::pending().await,
    }
}

fn spawn_reader(
    mut read_half: OwnedReadHalf,
    chunks: mpsc::Sender<LinkResult<Vec<u8>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    let _ = chunks
                        .send(Err(LinkError::transport("connection closed by peer")))
                        .await;
                    break;
                }
                Ok(n) => {
                    if chunks.send(Ok(buf[..n].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(error) => {
                    let _ = chunks.send(Err(error.into())).await;
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_from_base() {
        assert_eq!(backoff_delay(2000, 30000, 0), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2000, 30000, 1), Duration::from_millis(4000));
        assert_eq!(backoff_delay(2000, 30000, 2), Duration::from_millis(8000));
        assert_eq!(backoff_delay(2000, 30000, 3), Duration::from_millis(16000));
    }

    #[test]
    fn test_backoff_caps() {
        assert_eq!(backoff_delay(2000, 30000, 4), Duration::from_millis(30000));
        assert_eq!(backoff_delay(2000, 30000, 10), Duration::from_millis(30000));
        assert_eq!(backoff_delay(2000, 30000, 63), Duration::from_millis(30000));
    }

    #[test]
    fn test_backoff_is_monotonic() {
        let mut previous = Duration::ZERO;
        for attempts in 0..12 {
            let delay = backoff_delay(2000, 30000, attempts);
            assert!(delay >= previous);
            previous = delay;
        }
    }
}
