//! Read-loop state machine shared by every object source.
//!
//! A [`Listener`] moves between two states:
//!
//! ```text
//!            start()               stop()
//! Stopped ───────────▶ Started ───────────▶ Stopped
//! ```
//!
//! While started, a reader task reads one object per iteration, classifies
//! it and queues a [`ListenerEvent`]. A separate dispatcher task hands the
//! queued events to the observers, so slow observers never hold up reading
//! and events are observed in the order they were read.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use canopy_protocol::{Packet, PacketKind};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::traits::{ListenerObserver, ObjectSource, TransportError};

/// What one read produced.
#[derive(Debug, Clone)]
pub enum ListenerEvent {
    /// A routable packet: message, subscribe or unsubscribe.
    Message(Arc<Packet>),
    /// A meta (ACK/NACK) packet.
    Meta(Arc<Packet>),
    /// An error packet sent by the peer.
    Error(Arc<Packet>),
    /// Input that could not be decoded; reading goes on.
    InvalidData(Arc<TransportError>),
    /// The source produced a null object.
    Null,
    /// The source failed; the read loop has ended.
    Exception(Arc<TransportError>),
}

impl ListenerEvent {
    /// Classify a successfully read object.
    #[must_use]
    pub fn classify(object: Option<Packet>) -> Self {
        let Some(packet) = object else {
            return ListenerEvent::Null;
        };
        match packet.kind() {
            PacketKind::Meta => ListenerEvent::Meta(Arc::new(packet)),
            PacketKind::Error => ListenerEvent::Error(Arc::new(packet)),
            PacketKind::Message | PacketKind::Subscribe | PacketKind::Unsubscribe => {
                ListenerEvent::Message(Arc::new(packet))
            }
        }
    }

    /// The packet carried by the event, if any.
    #[must_use]
    pub fn packet(&self) -> Option<&Arc<Packet>> {
        match self {
            ListenerEvent::Message(p) | ListenerEvent::Meta(p) | ListenerEvent::Error(p) => Some(p),
            _ => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            ListenerEvent::Message(_) => "message",
            ListenerEvent::Meta(_) => "meta",
            ListenerEvent::Error(_) => "error",
            ListenerEvent::InvalidData(_) => "invalid-data",
            ListenerEvent::Null => "null",
            ListenerEvent::Exception(_) => "exception",
        }
    }
}

/// Identifies an observer added to a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

type ObserverList = RwLock<Vec<(ObserverId, Arc<dyn ListenerObserver>)>>;

struct Shared {
    running: AtomicBool,
    observers: ObserverList,
    next_observer: AtomicU64,
}

struct Running<S> {
    shutdown: watch::Sender<bool>,
    reader: JoinHandle<S>,
}

enum State<S> {
    Stopped(S),
    Started(Running<S>),
    /// The reader task panicked and took the source with it.
    Lost,
}

/// Drives an [`ObjectSource`] and raises events to observers.
pub struct Listener<S: ObjectSource> {
    shared: Arc<Shared>,
    state: Mutex<State<S>>,
}

impl<S: ObjectSource> Listener<S> {
    /// Create a stopped listener over a source.
    #[must_use]
    pub fn new(source: S) -> Self {
        Self {
            shared: Arc::new(Shared {
                running: AtomicBool::new(false),
                observers: RwLock::new(Vec::new()),
                next_observer: AtomicU64::new(1),
            }),
            state: Mutex::new(State::Stopped(source)),
        }
    }

    /// Add an observer.
    pub fn add_observer(&self, observer: impl ListenerObserver) -> ObserverId {
        let id = ObserverId(self.shared.next_observer.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut observers) = self.shared.observers.write() {
            observers.push((id, Arc::new(observer)));
        }
        id
    }

    /// Remove an observer. Returns `false` if it was not present.
    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let Ok(mut observers) = self.shared.observers.write() else {
            return false;
        };
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() < before
    }

    /// Number of observers.
    #[must_use]
    pub fn observer_count(&self) -> usize {
        self.shared.observers.read().map(|o| o.len()).unwrap_or(0)
    }

    /// Whether the read loop is running.
    ///
    /// Turns `false` as soon as the loop ends, including after an exception,
    /// even before [`stop`](Self::stop) is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Start the read loop.
    ///
    /// Returns once the reader task is alive. Returns `Ok(false)` if the
    /// listener was already started.
    ///
    /// # Errors
    ///
    /// Returns an error if an earlier reader task panicked and the source is
    /// gone.
    pub async fn start(&self) -> Result<bool, TransportError> {
        let mut state = self.state.lock().await;
        let source = match std::mem::replace(&mut *state, State::Lost) {
            State::Stopped(source) => source,
            State::Lost => return Err(TransportError::Other("listener source lost".into())),
            started @ State::Started(_) => {
                *state = started;
                return Ok(false);
            }
        };

        let (shutdown, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (alive_tx, alive_rx) = oneshot::channel();
        let name = source.name();

        self.shared.running.store(true, Ordering::Release);
        tokio::spawn(dispatch_loop(events_rx, Arc::clone(&self.shared)));
        let reader = tokio::spawn(read_loop(
            source,
            Arc::clone(&self.shared),
            shutdown_rx,
            events_tx,
            alive_tx,
        ));
        *state = State::Started(Running { shutdown, reader });
        drop(state);

        // Only fails if the reader died before reporting in; stop() finds out.
        let _ = alive_rx.await;
        debug!(source = name, "Listener started");
        Ok(true)
    }

    /// Stop the read loop and wait for the reader task to finish.
    ///
    /// Events already queued are still dispatched. Returns `false` if the
    /// listener was not started.
    pub async fn stop(&self) -> bool {
        let mut state = self.state.lock().await;
        let running = match std::mem::replace(&mut *state, State::Lost) {
            State::Started(running) => running,
            other => {
                *state = other;
                return false;
            }
        };

        self.shared.running.store(false, Ordering::Release);
        let _ = running.shutdown.send(true);
        match running.reader.await {
            Ok(source) => {
                debug!(source = source.name(), "Listener stopped");
                *state = State::Stopped(source);
            }
            Err(e) => error!("Listener reader task failed: {}", e),
        }
        true
    }
}

impl<S: ObjectSource> Drop for Listener<S> {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let State::Started(running) = self.state.get_mut() {
            let _ = running.shutdown.send(true);
        }
    }
}

impl<S: ObjectSource> fmt::Debug for Listener<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("running", &self.is_running())
            .field("observers", &self.observer_count())
            .finish()
    }
}

async fn read_loop<S: ObjectSource>(
    mut source: S,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
    events: mpsc::UnboundedSender<ListenerEvent>,
    alive: oneshot::Sender<()>,
) -> S {
    let _ = alive.send(());

    while shared.running.load(Ordering::Acquire) {
        let result = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            result = source.read_object() => result,
        };

        let (event, fatal) = match result {
            Ok(object) => (ListenerEvent::classify(object), false),
            Err(e) if e.is_invalid_data() => (ListenerEvent::InvalidData(Arc::new(e)), false),
            Err(e) => (ListenerEvent::Exception(Arc::new(e)), true),
        };
        trace!(source = source.name(), event = event.label(), "Read");
        let _ = events.send(event);
        if fatal {
            break;
        }
    }

    shared.running.store(false, Ordering::Release);
    source.on_stop().await;
    source
}

async fn dispatch_loop(mut events: mpsc::UnboundedReceiver<ListenerEvent>, shared: Arc<Shared>) {
    while let Some(event) = events.recv().await {
        let observers: Vec<Arc<dyn ListenerObserver>> = match shared.observers.read() {
            Ok(observers) => observers.iter().map(|(_, o)| Arc::clone(o)).collect(),
            Err(_) => return,
        };
        for observer in observers {
            observer.on_event(&event);
        }
    }
}
