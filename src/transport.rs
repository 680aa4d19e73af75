//! Duplex channel between the host and the running test binary.
//!
//! The host listens; the test binary connects back to the address it was
//! given on its command line. Once connected, both directions carry
//! newline-delimited JSON (see [`crate::protocol`]).
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────── EventChannel ─────────────┐
//!  send() ──►│ command queue ──► writer task ──► socket write half
//!            │                                       │
//!  next_event() ◄── event queue ◄── reader task ◄── socket read half
//!            └───────────────────────────────────────┘
//! ```
//!
//! The two tasks are independent: a queued command is written even while
//! inbound events are waiting to be consumed. Malformed inbound lines are
//! logged and dropped; an I/O error on the socket is delivered in-order as
//! the last item of the event sequence.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{LifecycleEvent, RemoteCommand};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The listening socket could not be opened.
    #[error("Failed to listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// The test binary never connected.
    #[error("Test binary did not connect within {0:?}")]
    AcceptTimeout(Duration),

    /// The connection broke.
    #[error("Connection lost: {0}")]
    Io(#[from] std::io::Error),

    /// The remote side hung up in the middle of a run.
    #[error("Connection closed by the test binary")]
    ConnectionClosed,

    /// The channel was already closed.
    #[error("Channel closed")]
    Closed,
}

const EVENT_QUEUE: usize = 256;

/// Listening socket waiting for the test binary.
pub struct EventListener {
    listener: TcpListener,
}

impl EventListener {
    pub async fn bind(addr: &str) -> TransportResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Waits for the first connection.
    pub async fn accept(&self, timeout: Duration) -> TransportResult<EventChannel> {
        let (stream, peer) = tokio::time::timeout(timeout, self.listener.accept())
            .await
            .map_err(|_| TransportError::AcceptTimeout(timeout))??;
        debug!("Test binary connected from {}", peer);
        stream.set_nodelay(true)?;
        Ok(EventChannel::from_stream(stream))
    }
}

/// A connected duplex channel.
///
/// Finite and not restartable: once the remote side closes or
/// [`close`](Self::close) is called, [`next_event`](Self::next_event)
/// returns `None`.
#[derive(Debug)]
pub struct EventChannel {
    commands: Option<mpsc::UnboundedSender<RemoteCommand>>,
    events: mpsc::Receiver<TransportResult<LifecycleEvent>>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    closed: bool,
}

impl EventChannel {
    /// Wraps any byte stream, typically a `TcpStream`.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
        let token = CancellationToken::new();

        let tasks = vec![
            tokio::spawn(read_events(read_half, event_tx, token.clone())),
            tokio::spawn(write_commands(write_half, command_rx, token.clone())),
        ];

        Self {
            commands: Some(command_tx),
            events: event_rx,
            token,
            tasks,
            closed: false,
        }
    }

    /// Queues a command for the remote runner without waiting for it to be written.
    pub fn send(&self, command: RemoteCommand) -> TransportResult<()> {
        let sender = self.commands.as_ref().ok_or(TransportError::Closed)?;
        sender.send(command).map_err(|_| TransportError::Closed)
    }

    /// The next inbound event, in emission order.
    pub async fn next_event(&mut self) -> Option<TransportResult<LifecycleEvent>> {
        self.events.recv().await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Stops both tasks and releases the socket. Safe to call repeatedly.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        // Dropping the sender lets the writer flush what is already queued.
        self.commands = None;
        let writer_grace = Duration::from_millis(500);
        if let Some(writer) = self.tasks.pop() {
            let abort = writer.abort_handle();
            if tokio::time::timeout(writer_grace, writer).await.is_err() {
                abort.abort();
            }
        }
        self.token.cancel();
        for task in self.tasks.drain(..) {
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(1), task).await.is_err() {
                warn!("Transport reader did not stop, aborting");
                abort.abort();
            }
        }
        self.events.close();
    }
}

async fn read_events<R>(
    reader: R,
    events: mpsc::Sender<TransportResult<LifecycleEvent>>,
    token: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match LifecycleEvent::decode(line) {
                    Ok(event) => {
                        if events.send(Ok(event)).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping malformed message: {} ({})", e, line),
                }
            }
            Ok(None) => {
                debug!("Test binary closed the connection");
                break;
            }
            Err(e) => {
                let _ = events.send(Err(TransportError::Io(e))).await;
                break;
            }
        }
    }
}

async fn write_commands<W>(
    mut writer: W,
    mut commands: mpsc::UnboundedReceiver<RemoteCommand>,
    token: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let command = tokio::select! {
            _ = token.cancelled() => break,
            command = commands.recv() => command,
        };
        let Some(command) = command else { break };
        let mut line = command.encode();
        debug!("-> {}", line);
        line.push('\n');
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            warn!("Failed to send command: {}", e);
            break;
        }
        if let Err(e) = writer.flush().await {
            warn!("Failed to flush command: {}", e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Description;
    use tokio::io::{AsyncReadExt, duplex};

    #[tokio::test]
    async fn test_events_in_order_and_malformed_dropped() {
        let (host, mut remote) = duplex(4096);
        let mut channel = EventChannel::from_stream(host);

        let started = LifecycleEvent::Started(Description::test("com.example.FooTest", "testA"));
        let finished = LifecycleEvent::Finished(Description::test("com.example.FooTest", "testA"));
        let payload = format!(
            "{}\nnot json\n{{\"resultType\":99}}\n\n{}\n",
            started.encode(),
            finished.encode()
        );
        remote.write_all(payload.as_bytes()).await.unwrap();
        drop(remote);

        assert_eq!(channel.next_event().await.unwrap().unwrap(), started);
        assert_eq!(channel.next_event().await.unwrap().unwrap(), finished);
        assert!(channel.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_command_follows_scripted_exchange() {
        let started = LifecycleEvent::RunStarted(Description::new("com.example.FooTest"));
        let stream = tokio_test::io::Builder::new()
            .read(format!("{}\n", started.encode()).as_bytes())
            .write(b"{\"command\":\"terminate\"}\n")
            .build();
        let mut channel = EventChannel::from_stream(stream);

        assert_eq!(channel.next_event().await.unwrap().unwrap(), started);
        channel.send(RemoteCommand::Terminate).unwrap();
        assert!(channel.next_event().await.is_none());
        channel.close().await;
    }

    #[tokio::test]
    async fn test_send_does_not_wait_for_events() {
        let (host, mut remote) = duplex(4096);
        let mut channel = EventChannel::from_stream(host);

        channel
            .send(RemoteCommand::Run {
                tests: vec!["com.example.FooTest".to_string()],
            })
            .unwrap();
        channel.send(RemoteCommand::Terminate).unwrap();

        let mut buf = vec![0u8; 256];
        let mut received = String::new();
        while received.matches('\n').count() < 2 {
            let n = remote.read(&mut buf).await.unwrap();
            assert!(n > 0);
            received.push_str(std::str::from_utf8(&buf[..n]).unwrap());
        }
        let lines: Vec<&str> = received.lines().collect();
        assert_eq!(lines[0], r#"{"command":"run","tests":["com.example.FooTest"]}"#);
        assert_eq!(lines[1], r#"{"command":"terminate"}"#);

        channel.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (host, _remote) = duplex(64);
        let mut channel = EventChannel::from_stream(host);
        channel.close().await;
        channel.close().await;
        assert!(channel.is_closed());
        assert!(matches!(
            channel.send(RemoteCommand::Terminate),
            Err(TransportError::Closed)
        ));
        assert!(channel.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_accept_over_tcp() {
        let listener = EventListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            let event = LifecycleEvent::Ignored(Description::test("a.B", "skipped"));
            let line = format!("{}\n", event.encode());
            stream.write_all(line.as_bytes()).await.unwrap();
        });

        let mut channel = listener.accept(Duration::from_secs(5)).await.unwrap();
        let event = channel.next_event().await.unwrap().unwrap();
        assert!(matches!(event, LifecycleEvent::Ignored(_)));
        client.await.unwrap();
        channel.close().await;
    }

    #[tokio::test]
    async fn test_accept_timeout() {
        let listener = EventListener::bind("127.0.0.1:0").await.unwrap();
        let err = listener.accept(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, TransportError::AcceptTimeout(_)));
    }
}
