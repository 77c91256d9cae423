//! Connection transport over one duplex socket.
//!
//! A [`Transport`] starts in [`ConnectionState::Connecting`], moves to
//! [`ConnectionState::Open`] once a socket is attached and ends in
//! [`ConnectionState::Closed`]. Messages sent while connecting are queued and
//! flushed in order when the socket opens; sending after close fails with
//! [`KartonError::ConnectionClosed`].

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub mod memory;

use crate::protocol::{decode_frame, encode_frame, Frame, Message};
use crate::{KartonError, KartonResult};

/// Lifecycle of a transport; transitions only move forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

type MessageListener = dyn Fn(&Message) + Send + Sync;
type OpenListener = dyn Fn() + Send + Sync;
type CloseListener = dyn Fn(&str) + Send + Sync;
type ErrorListener = dyn Fn(&KartonError) + Send + Sync;

/// Listeners of one event kind, invoked in registration order
struct Listeners<L: ?Sized> {
    entries: Mutex<BTreeMap<u64, Arc<L>>>,
}

impl<L: ?Sized> Listeners<L> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Arc<L>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn insert(&self, id: u64, listener: Arc<L>) {
        self.lock().insert(id, listener);
    }

    fn remove(&self, id: u64) -> bool {
        self.lock().remove(&id).is_some()
    }

    /// Copy out the listeners so none are called with the lock held
    fn snapshot(&self) -> Vec<Arc<L>> {
        self.lock().values().cloned().collect()
    }

    fn clear(&self) {
        self.lock().clear();
    }
}

#[derive(Debug, Clone, Copy)]
enum Event {
    Message,
    Open,
    Close,
    Error,
}

/// Handle returned by listener registration
///
/// Dropping the handle keeps the listener registered; call [`ListenerHandle::remove`]
/// to deregister it.
#[must_use = "dropping the handle keeps the listener registered forever"]
pub struct ListenerHandle {
    transport: Weak<TransportInner>,
    event: Event,
    id: u64,
}

impl ListenerHandle {
    /// Deregister the listener. Returns false if it was already gone.
    pub fn remove(self) -> bool {
        match self.transport.upgrade() {
            Some(inner) => match self.event {
                Event::Message => inner.on_message.remove(self.id),
                Event::Open => inner.on_open.remove(self.id),
                Event::Close => inner.on_close.remove(self.id),
                Event::Error => inner.on_error.remove(self.id),
            },
            None => false,
        }
    }
}

struct Link {
    state: ConnectionState,
    queue: VecDeque<Frame>,
    writer: Option<mpsc::UnboundedSender<Frame>>,
    reader: Option<JoinHandle<()>>,
}

struct TransportInner {
    id: String,
    link: Mutex<Link>,
    state_tx: watch::Sender<ConnectionState>,
    next_listener_id: AtomicU64,
    on_message: Listeners<MessageListener>,
    on_open: Listeners<OpenListener>,
    on_close: Listeners<CloseListener>,
    on_error: Listeners<ErrorListener>,
}

impl TransportInner {
    fn lock_link(&self) -> MutexGuard<'_, Link> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> u64 {
        self.next_listener_id.fetch_add(1, Ordering::Relaxed)
    }

    fn emit_message(&self, message: &Message) {
        for listener in self.on_message.snapshot() {
            listener(message);
        }
    }

    fn emit_error(&self, error: &KartonError) {
        for listener in self.on_error.snapshot() {
            listener(error);
        }
    }
}

/// Event-based wrapper around one duplex socket
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Transport {
    /// Create a transport that is still waiting for its socket
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Self {
            inner: Arc::new(TransportInner {
                id: Uuid::new_v4().to_string(),
                link: Mutex::new(Link {
                    state: ConnectionState::Connecting,
                    queue: VecDeque::new(),
                    writer: None,
                    reader: None,
                }),
                state_tx,
                next_listener_id: AtomicU64::new(0),
                on_message: Listeners::new(),
                on_open: Listeners::new(),
                on_close: Listeners::new(),
                on_error: Listeners::new(),
            }),
        }
    }

    /// Create a transport over an already open socket
    pub fn open<Si, St, E>(sink: Si, stream: St) -> KartonResult<Self>
    where
        Si: Sink<Frame> + Send + 'static,
        Si::Error: fmt::Display + Send,
        St: Stream<Item = Result<Frame, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let transport = Self::new();
        transport.attach(sink, stream)?;
        Ok(transport)
    }

    /// Unique id of this transport, used in logs
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Current lifecycle state
    pub fn state(&self) -> ConnectionState {
        self.inner.lock_link().state
    }

    /// Whether the socket is attached and not yet closed
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Wait until the transport is closed
    pub async fn closed(&self) {
        let mut state_rx = self.inner.state_tx.subscribe();
        let _ = state_rx
            .wait_for(|state| *state == ConnectionState::Closed)
            .await;
    }

    /// Attach the socket halves and open the transport.
    ///
    /// Queued messages are handed to the writer in FIFO order before the
    /// transport is marked open, then open listeners fire, then inbound frames
    /// start flowing. Fails with [`KartonError::ConnectionClosed`] if the
    /// transport is no longer connecting.
    pub fn attach<Si, St, E>(&self, sink: Si, stream: St) -> KartonResult<()>
    where
        Si: Sink<Frame> + Send + 'static,
        Si::Error: fmt::Display + Send,
        St: Stream<Item = Result<Frame, E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        {
            let mut link = self.inner.lock_link();
            if link.state != ConnectionState::Connecting {
                warn!(
                    "Refusing to attach socket to transport {} in state {:?}",
                    self.inner.id, link.state
                );
                return Err(KartonError::ConnectionClosed);
            }

            let flushed = link.queue.len();
            for frame in link.queue.drain(..) {
                // The receiver is held right here, so this cannot fail
                let _ = writer_tx.send(frame);
            }
            link.writer = Some(writer_tx);
            link.state = ConnectionState::Open;

            if flushed > 0 {
                debug!(
                    "Flushed {} queued frames on transport {}",
                    flushed, self.inner.id
                );
            }
        }

        tokio::spawn(write_loop(Arc::downgrade(&self.inner), sink, writer_rx));
        self.inner.state_tx.send_replace(ConnectionState::Open);
        info!("Transport {} open", self.inner.id);

        for listener in self.inner.on_open.snapshot() {
            listener();
        }

        let reader = tokio::spawn(read_loop(self.clone(), stream));
        let mut link = self.inner.lock_link();
        if link.state == ConnectionState::Closed {
            reader.abort();
        } else {
            link.reader = Some(reader);
        }
        Ok(())
    }

    /// Send a message, queueing it while the transport is still connecting
    pub fn send(&self, message: &Message) -> KartonResult<()> {
        let frame = encode_frame(message)?;
        let mut link = self.inner.lock_link();
        match link.state {
            ConnectionState::Connecting => {
                link.queue.push_back(frame);
                debug!(
                    "Queued {} on connecting transport {} ({} pending)",
                    message.kind(),
                    self.inner.id,
                    link.queue.len()
                );
                Ok(())
            }
            ConnectionState::Open => match &link.writer {
                Some(writer) => writer
                    .send(frame)
                    .map_err(|_| KartonError::ConnectionClosed),
                None => Err(KartonError::ConnectionClosed),
            },
            ConnectionState::Closed => Err(KartonError::ConnectionClosed),
        }
    }

    /// Close the transport. Calling it again has no effect.
    pub fn close(&self, reason: impl Into<String>) {
        self.shutdown(reason.into(), true);
    }

    fn shutdown(&self, reason: String, notify_peer: bool) {
        let (writer, reader, dropped) = {
            let mut link = self.inner.lock_link();
            if link.state == ConnectionState::Closed {
                return;
            }
            link.state = ConnectionState::Closed;
            let dropped = link.queue.len();
            link.queue.clear();
            (link.writer.take(), link.reader.take(), dropped)
        };

        if let Some(writer) = writer {
            if notify_peer {
                let _ = writer.send(Frame::Close(Some(reason.clone())));
            }
        }
        if let Some(reader) = reader {
            reader.abort();
        }
        if dropped > 0 {
            debug!(
                "Dropped {} queued frames on transport {}",
                dropped, self.inner.id
            );
        }

        self.inner.state_tx.send_replace(ConnectionState::Closed);
        info!("Transport {} closed ({})", self.inner.id, reason);

        for listener in self.inner.on_close.snapshot() {
            listener(&reason);
        }

        // Nothing fires after close; releasing listeners breaks Arc cycles with their owners
        self.inner.on_message.clear();
        self.inner.on_open.clear();
        self.inner.on_close.clear();
        self.inner.on_error.clear();
    }

    /// Register a listener for decoded inbound messages
    pub fn on_message(&self, listener: impl Fn(&Message) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.inner.next_id();
        self.inner.on_message.insert(id, Arc::new(listener));
        self.handle(Event::Message, id)
    }

    /// Register a listener fired once the socket is attached
    pub fn on_open(&self, listener: impl Fn() + Send + Sync + 'static) -> ListenerHandle {
        let id = self.inner.next_id();
        self.inner.on_open.insert(id, Arc::new(listener));
        self.handle(Event::Open, id)
    }

    /// The listener receives the close reason
    pub fn on_close(&self, listener: impl Fn(&str) + Send + Sync + 'static) -> ListenerHandle {
        let id = self.inner.next_id();
        self.inner.on_close.insert(id, Arc::new(listener));
        self.handle(Event::Close, id)
    }

    /// Socket errors and malformed frames. Neither closes the transport;
    /// a failed write is reported here and then closes it.
    pub fn on_error(
        &self,
        listener: impl Fn(&KartonError) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.inner.next_id();
        self.inner.on_error.insert(id, Arc::new(listener));
        self.handle(Event::Error, id)
    }

    fn handle(&self, event: Event, id: u64) -> ListenerHandle {
        ListenerHandle {
            transport: Arc::downgrade(&self.inner),
            event,
            id,
        }
    }
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

async fn write_loop<Si>(
    transport: Weak<TransportInner>,
    sink: Si,
    mut frames: mpsc::UnboundedReceiver<Frame>,
) where
    Si: Sink<Frame> + Send,
    Si::Error: fmt::Display + Send,
{
    futures_util::pin_mut!(sink);

    while let Some(frame) = frames.recv().await {
        let closing = matches!(frame, Frame::Close(_));
        if let Err(e) = sink.send(frame).await {
            if closing {
                break;
            }
            // A dead writer leaves nothing to send through, so the transport closes
            if let Some(inner) = transport.upgrade() {
                error!("Failed to write frame on transport {}: {}", inner.id, e);
                let error = KartonError::WebSocket(e.to_string());
                inner.emit_error(&error);
                Transport { inner }.shutdown(format!("write failed: {}", error), false);
            }
            return;
        }
        if closing {
            break;
        }
    }

    let _ = sink.close().await;
    debug!("Writer task ended");
}

async fn read_loop<St, E>(transport: Transport, stream: St)
where
    St: Stream<Item = Result<Frame, E>> + Send,
    E: fmt::Display + Send,
{
    futures_util::pin_mut!(stream);
    let mut reason = "socket closed".to_string();

    while let Some(item) = stream.next().await {
        match item {
            Ok(Frame::Close(close_reason)) => {
                reason = close_reason.unwrap_or_else(|| "closed by peer".to_string());
                break;
            }
            Ok(frame) => match decode_frame(&frame) {
                Ok(message) => {
                    debug!(
                        "Received {} on transport {}",
                        message.kind(),
                        transport.inner.id
                    );
                    transport.inner.emit_message(&message);
                }
                Err(e) => {
                    warn!(
                        "Dropping malformed frame on transport {}: {}",
                        transport.inner.id, e
                    );
                    transport.inner.emit_error(&e);
                }
            },
            Err(e) => {
                let error = KartonError::WebSocket(e.to_string());
                warn!("Socket error on transport {}: {}", transport.inner.id, e);
                transport.inner.emit_error(&error);
            }
        }
    }

    debug!("Reader task ended for transport {}", transport.inner.id);
    transport.shutdown(reason, false);
}

#[cfg(test)]
mod tests {
    use super::memory::duplex;
    use super::*;
    use crate::protocol::{encode_frame, Value};
    use std::sync::atomic::AtomicUsize;
    use tokio::time::{timeout, Duration};

    fn sync_message(n: i32) -> Message {
        Message::StateSync {
            state: Value::from(n),
        }
    }

    fn channel_listener(
        transport: &Transport,
    ) -> (ListenerHandle, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = transport.on_message(move |message| {
            let _ = tx.send(message.clone());
        });
        (handle, rx)
    }

    #[tokio::test]
    async fn test_queued_messages_flush_in_order_exactly_once() {
        let transport = Transport::new();
        assert_eq!(transport.state(), ConnectionState::Connecting);

        for n in 0..3 {
            transport.send(&sync_message(n)).unwrap();
        }

        let (local, mut remote) = duplex();
        let (sink, stream) = local.split();
        transport.attach(sink, stream).unwrap();
        assert!(transport.is_open());

        transport.send(&sync_message(3)).unwrap();

        for n in 0..4 {
            let frame = timeout(Duration::from_secs(1), remote.recv())
                .await
                .expect("Should receive frame")
                .expect("Should have frame");
            assert_eq!(decode_frame(&frame).unwrap(), sync_message(n));
        }

        let extra = timeout(Duration::from_millis(50), remote.recv()).await;
        assert!(extra.is_err(), "Queued frames must not be sent twice");
    }

    #[tokio::test]
    async fn test_open_listener_fires_after_flush() {
        let transport = Transport::new();
        transport.send(&sync_message(1)).unwrap();

        let opened = Arc::new(AtomicUsize::new(0));
        let opened_clone = opened.clone();
        let _handle = transport.on_open(move || {
            opened_clone.fetch_add(1, Ordering::SeqCst);
        });

        let (local, _remote) = duplex();
        let (sink, stream) = local.split();
        transport.attach(sink, stream).unwrap();

        assert_eq!(opened.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (local, _remote) = duplex();
        let (sink, stream) = local.split();
        let transport = Transport::open(sink, stream).unwrap();

        transport.close("done");
        assert_eq!(transport.state(), ConnectionState::Closed);

        let err = transport.send(&sync_message(1)).unwrap_err();
        assert!(matches!(err, KartonError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let transport = Transport::new();
        let closes = Arc::new(Mutex::new(Vec::new()));
        let closes_clone = closes.clone();
        let _handle = transport.on_close(move |reason| {
            closes_clone.lock().unwrap().push(reason.to_string());
        });

        transport.send(&sync_message(1)).unwrap();
        transport.close("first");
        transport.close("second");

        assert_eq!(*closes.lock().unwrap(), vec!["first".to_string()]);

        // A closed transport never opens again
        let (local, _remote) = duplex();
        let (sink, stream) = local.split();
        assert!(matches!(
            transport.attach(sink, stream),
            Err(KartonError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_listeners_run_in_registration_order_and_can_be_removed() {
        let (local, remote) = duplex();
        let (sink, stream) = local.split();
        let transport = Transport::open(sink, stream).unwrap();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let first_calls = calls.clone();
        let first = transport.on_message(move |_| first_calls.lock().unwrap().push("first"));
        let second_calls = calls.clone();
        let _second = transport.on_message(move |_| second_calls.lock().unwrap().push("second"));
        let (_third, mut rx) = channel_listener(&transport);

        remote.send(encode_frame(&sync_message(1)).unwrap()).unwrap();
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);

        assert!(first.remove());
        remote.send(encode_frame(&sync_message(2)).unwrap()).unwrap();
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second", "second"]);
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped_and_connection_stays_open() {
        let (local, remote) = duplex();
        let (sink, stream) = local.split();
        let transport = Transport::open(sink, stream).unwrap();

        let errors = Arc::new(AtomicUsize::new(0));
        let errors_clone = errors.clone();
        let _errors = transport.on_error(move |error| {
            assert!(matches!(error, KartonError::MalformedMessage { .. }));
            errors_clone.fetch_add(1, Ordering::SeqCst);
        });
        let (_messages, mut rx) = channel_listener(&transport);

        remote.send(Frame::Text("{\"type\":".to_string())).unwrap();
        remote.send(encode_frame(&sync_message(7)).unwrap()).unwrap();

        let message = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("Should receive message")
            .expect("Should have message");
        assert_eq!(message, sync_message(7));
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_peer_close_reports_reason() {
        let (local, remote) = duplex();
        let (sink, stream) = local.split();
        let transport = Transport::open(sink, stream).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _handle = transport.on_close(move |reason| {
            let _ = tx.send(reason.to_string());
        });

        remote.send(Frame::Close(Some("bye".to_string()))).unwrap();

        let reason = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("Should observe close")
            .expect("Should have reason");
        assert_eq!(reason, "bye");
        timeout(Duration::from_secs(1), transport.closed())
            .await
            .expect("closed() should resolve");
    }

    #[tokio::test]
    async fn test_explicit_close_notifies_peer() {
        let (local, mut remote) = duplex();
        let (sink, stream) = local.split();
        let transport = Transport::open(sink, stream).unwrap();

        transport.close("shutting down");

        let frame = timeout(Duration::from_secs(1), remote.recv())
            .await
            .expect("Should receive close frame")
            .expect("Should have frame");
        assert_eq!(frame, Frame::Close(Some("shutting down".to_string())));
    }

    #[tokio::test]
    async fn test_socket_error_is_reported_and_connection_stays_open() {
        let (local, _remote) = duplex();
        let (sink, _) = local.split();
        let inbound = futures_util::stream::iter(vec![
            Err(KartonError::WebSocket("connection reset".to_string())),
            Ok(encode_frame(&sync_message(5)).unwrap()),
        ])
        .chain(futures_util::stream::pending());

        let transport = Transport::new();
        let errors = Arc::new(Mutex::new(Vec::new()));
        let errors_clone = errors.clone();
        let _errors = transport.on_error(move |error| {
            errors_clone.lock().unwrap().push(error.to_string());
        });
        let (_messages, mut rx) = channel_listener(&transport);
        transport.attach(sink, inbound).unwrap();

        let message = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("Should receive message")
            .expect("Should have message");
        assert_eq!(message, sync_message(5));
        assert_eq!(errors.lock().unwrap().len(), 1);
        assert!(errors.lock().unwrap()[0].contains("connection reset"));
        assert!(transport.is_open());
    }

    #[tokio::test]
    async fn test_write_failure_is_reported_and_closes() {
        let broken = futures_util::sink::unfold((), |_, _frame: Frame| async {
            Err::<(), _>(KartonError::WebSocket("broken pipe".to_string()))
        });
        let inbound = futures_util::stream::pending::<KartonResult<Frame>>();
        let transport = Transport::open(broken, inbound).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _errors = transport.on_error(move |error| {
            let _ = tx.send(error.to_string());
        });

        transport.send(&sync_message(1)).unwrap();

        let reported = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("Should report write failure")
            .expect("Should have error");
        assert!(reported.contains("broken pipe"));
        timeout(Duration::from_secs(1), transport.closed())
            .await
            .expect("Write failure should close the transport");
        assert!(matches!(
            transport.send(&sync_message(2)),
            Err(KartonError::ConnectionClosed)
        ));
    }
}
