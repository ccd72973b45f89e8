//! Per-feed connection lifecycle.
//!
//! A [`FeedConnection`] owns the current stream for one feed of one bed and
//! runs the dial/reconnect state machine:
//!
//! ```text
//! Connecting -> Connected -> (write/dial failure) -> AwaitingRetry -> Connecting -> ...
//! ```
//!
//! The current handle is published through a `watch` channel so the writer
//! and drain tasks always see the latest connection. Reconnection is requested
//! through a coalescing [`ReconnectSignal`]; any number of failures reported
//! while a retry cycle is pending collapse into that one cycle.

use crate::frame::FrameWriter;
use crate::message::BedId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinSet;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const SHORT_RETRY_DELAY_S: u64 = 30;
const SHORT_RETRY_ATTEMPTS: u32 = 5;
const LONG_RETRY_DELAY_S: u64 = 60;
// Rate limit before the vital-wave feed will consume a reconnect request
const VITAL_WAVE_PRE_WAIT_S: u64 = 60;

const DIAL_TIMEOUT: Duration = Duration::from_secs(10);
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const DRAIN_BUFFER_SIZE: usize = 1024;
pub const OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Any bidirectional byte stream usable as a hub connection.
pub trait HubStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> HubStream for T {}

pub type BoxedStream = Box<dyn HubStream>;

/// Opens new connections to the hub.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self) -> io::Result<BoxedStream>;
}

/// Dials the hub over TCP.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    address: String,
}

impl TcpDialer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        let stream = time::timeout(DIAL_TIMEOUT, TcpStream::connect(&self.address))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "dial timed out"))??;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeedKind {
    VitalWave,
    Alarm,
}

impl FeedKind {
    pub fn name(self) -> &'static str {
        match self {
            FeedKind::VitalWave => "vital-wave",
            FeedKind::Alarm => "alarm",
        }
    }
}

impl fmt::Display for FeedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedState {
    Connecting,
    Connected,
    AwaitingRetry,
    Closed,
}

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to dial {feed} feed: {source}")]
    Dial {
        feed: FeedKind,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {feed} frame: {source}")]
    Write {
        feed: FeedKind,
        #[source]
        source: io::Error,
    },
    #[error("{0} feed has no open connection")]
    NotConnected(FeedKind),
}

/// Bounds of the reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Wait before consuming each pending reconnect request.
    pub pre_wait: Duration,
    /// Delay after each of the first `short_attempts` failed dials.
    pub short_delay: Duration,
    pub short_attempts: u32,
    /// Delay after every later failed dial.
    pub long_delay: Duration,
    /// Give up a cycle after this many dials. `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    pub fn vital_wave() -> Self {
        Self {
            pre_wait: Duration::from_secs(VITAL_WAVE_PRE_WAIT_S),
            ..Self::alarm()
        }
    }

    pub fn alarm() -> Self {
        Self {
            pre_wait: Duration::ZERO,
            short_delay: Duration::from_secs(SHORT_RETRY_DELAY_S),
            short_attempts: SHORT_RETRY_ATTEMPTS,
            long_delay: Duration::from_secs(LONG_RETRY_DELAY_S),
            max_attempts: None,
        }
    }

    pub fn for_feed(kind: FeedKind) -> Self {
        match kind {
            FeedKind::VitalWave => Self::vital_wave(),
            FeedKind::Alarm => Self::alarm(),
        }
    }

    /// Wait after failed dial number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if attempt <= self.short_attempts {
            self.short_delay
        } else {
            self.long_delay
        }
    }
}

/// Single-slot, coalescing reconnect request.
///
/// Raising never blocks. A raise made before anyone waits is kept until
/// consumed, and raises made while one is pending are dropped.
#[derive(Debug, Default)]
pub struct ReconnectSignal {
    pending: AtomicBool,
    notify: Notify,
    accepted: AtomicU64,
}

impl ReconnectSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if this raise started a new request.
    pub fn raise(&self) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.accepted.fetch_add(1, Ordering::Relaxed);
        self.notify.notify_one();
        true
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Resolves once a request is pending. Does not clear it.
    pub async fn wait(&self) {
        loop {
            if self.is_pending() {
                return;
            }
            self.notify.notified().await;
        }
    }

    pub fn clear(&self) {
        self.pending.store(false, Ordering::Release);
    }

    /// Number of raises that started a new request.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }
}

/// One open stream for a feed, tagged with the generation that produced it.
pub struct ConnectionHandle {
    feed: FeedKind,
    generation: u64,
    writer: Mutex<WriteHalf<BoxedStream>>,
    reader: Mutex<ReadHalf<BoxedStream>>,
}

impl ConnectionHandle {
    fn new(feed: FeedKind, generation: u64, stream: BoxedStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            feed,
            generation,
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    async fn write_frame(&self, frame_writer: &FrameWriter, body: &[u8]) -> io::Result<usize> {
        let mut writer = self.writer.lock().await;
        time::timeout(WRITE_TIMEOUT, frame_writer.write(&mut *writer, body))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "frame write timed out"))?
    }

    async fn shutdown(&self) {
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("feed", &self.feed)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Snapshot of a feed's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedStats {
    pub dial_attempts: u64,
    pub dial_failures: u64,
    pub reconnects: u64,
    pub reconnect_requests: u64,
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub write_failures: u64,
    pub bytes_drained: u64,
}

impl FeedStats {
    pub fn merge(&mut self, other: &FeedStats) {
        self.dial_attempts += other.dial_attempts;
        self.dial_failures += other.dial_failures;
        self.reconnects += other.reconnects;
        self.reconnect_requests += other.reconnect_requests;
        self.frames_sent += other.frames_sent;
        self.frames_dropped += other.frames_dropped;
        self.write_failures += other.write_failures;
        self.bytes_drained += other.bytes_drained;
    }
}

#[derive(Debug, Default)]
struct FeedCounters {
    dial_attempts: AtomicU64,
    dial_failures: AtomicU64,
    reconnects: AtomicU64,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
    write_failures: AtomicU64,
    bytes_drained: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct FeedShared {
    bed: BedId,
    kind: FeedKind,
    dialer: Arc<dyn Dialer>,
    policy: RetryPolicy,
    frame_writer: FrameWriter,
    current: watch::Sender<Option<Arc<ConnectionHandle>>>,
    state: watch::Sender<FeedState>,
    signal: ReconnectSignal,
    // Set when the request came from a failed dial, which counts as attempt 1
    dial_failed: AtomicBool,
    next_generation: AtomicU64,
    live_generation: AtomicU64,
    counters: FeedCounters,
}

/// Connection manager for one feed of one bed.
#[derive(Clone)]
pub struct FeedConnection {
    shared: Arc<FeedShared>,
}

impl FeedConnection {
    pub fn new(bed: BedId, kind: FeedKind, dialer: Arc<dyn Dialer>, policy: RetryPolicy) -> Self {
        let (current, _) = watch::channel(None);
        let (state, _) = watch::channel(FeedState::Connecting);
        Self {
            shared: Arc::new(FeedShared {
                bed,
                kind,
                dialer,
                policy,
                frame_writer: FrameWriter::new(),
                current,
                state,
                signal: ReconnectSignal::new(),
                dial_failed: AtomicBool::new(false),
                next_generation: AtomicU64::new(1),
                live_generation: AtomicU64::new(0),
                counters: FeedCounters::default(),
            }),
        }
    }

    pub fn bed(&self) -> &BedId {
        &self.shared.bed
    }

    pub fn kind(&self) -> FeedKind {
        self.shared.kind
    }

    pub fn state(&self) -> FeedState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<FeedState> {
        self.shared.state.subscribe()
    }

    /// The handle writers should use right now.
    pub fn current(&self) -> Option<Arc<ConnectionHandle>> {
        self.shared.current.borrow().clone()
    }

    pub fn watch_current(&self) -> watch::Receiver<Option<Arc<ConnectionHandle>>> {
        self.shared.current.subscribe()
    }

    pub fn signal(&self) -> &ReconnectSignal {
        &self.shared.signal
    }

    pub fn stats(&self) -> FeedStats {
        let c = &self.shared.counters;
        FeedStats {
            dial_attempts: c.dial_attempts.load(Ordering::Relaxed),
            dial_failures: c.dial_failures.load(Ordering::Relaxed),
            reconnects: c.reconnects.load(Ordering::Relaxed),
            reconnect_requests: self.shared.signal.accepted(),
            frames_sent: c.frames_sent.load(Ordering::Relaxed),
            frames_dropped: c.frames_dropped.load(Ordering::Relaxed),
            write_failures: c.write_failures.load(Ordering::Relaxed),
            bytes_drained: c.bytes_drained.load(Ordering::Relaxed),
        }
    }

    fn set_state(&self, state: FeedState) {
        self.shared.state.send_if_modified(|current| {
            if *current == state || *current == FeedState::Closed {
                return false;
            }
            *current = state;
            true
        });
    }

    /// Attempt a single dial. On failure the feed moves to `AwaitingRetry`
    /// and a reconnect is requested.
    pub async fn connect(&self) -> Result<Arc<ConnectionHandle>, FeedError> {
        match self.dial_and_publish().await {
            Ok(handle) => {
                info!(bed = %self.shared.bed, feed = %self.shared.kind, "feed connected");
                Ok(handle)
            }
            Err(e) => {
                warn!(bed = %self.shared.bed, feed = %self.shared.kind, "failed to make connection: {}", e);
                self.shared.dial_failed.store(true, Ordering::Release);
                self.shared.signal.raise();
                Err(e)
            }
        }
    }

    async fn dial_and_publish(&self) -> Result<Arc<ConnectionHandle>, FeedError> {
        let shared = &self.shared;
        self.set_state(FeedState::Connecting);
        bump(&shared.counters.dial_attempts);

        let stream = match shared.dialer.dial().await {
            Ok(stream) => stream,
            Err(source) => {
                bump(&shared.counters.dial_failures);
                self.set_state(FeedState::AwaitingRetry);
                return Err(FeedError::Dial {
                    feed: shared.kind,
                    source,
                });
            }
        };

        let generation = shared.next_generation.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ConnectionHandle::new(shared.kind, generation, stream));

        // Failures tagged with older generations are ignored from here on
        shared.live_generation.store(generation, Ordering::Release);
        self.set_state(FeedState::Connected);
        shared.signal.clear();

        if let Some(previous) = shared.current.send_replace(Some(Arc::clone(&handle))) {
            previous.shutdown().await;
        }

        Ok(handle)
    }

    /// Report that a write failed on the handle of `generation` (or that no
    /// handle was available). Returns `true` if a new reconnect request was
    /// started.
    pub fn report_failure(&self, generation: Option<u64>) -> bool {
        let shared = &self.shared;
        match generation {
            Some(generation) => {
                if generation != shared.live_generation.load(Ordering::Acquire) {
                    return false;
                }
                // A cycle already dialing keeps its Connecting state
                shared.state.send_if_modified(|state| {
                    if *state != FeedState::Connected {
                        return false;
                    }
                    *state = FeedState::AwaitingRetry;
                    true
                });
                shared.signal.raise()
            }
            // Only restart retries that were given up; an initial dial in
            // flight must not be doubled
            None if self.state() == FeedState::AwaitingRetry => shared.signal.raise(),
            None => false,
        }
    }

    /// Frame `body` and write it to the current handle.
    pub async fn write_body(&self, body: &[u8]) -> Result<usize, FeedError> {
        let shared = &self.shared;
        let Some(handle) = self.current() else {
            bump(&shared.counters.frames_dropped);
            self.report_failure(None);
            return Err(FeedError::NotConnected(shared.kind));
        };

        match handle.write_frame(&shared.frame_writer, body).await {
            Ok(written) => {
                bump(&shared.counters.frames_sent);
                Ok(written)
            }
            Err(source) => {
                bump(&shared.counters.write_failures);
                if self.report_failure(Some(handle.generation())) {
                    warn!(
                        bed = %shared.bed,
                        feed = %shared.kind,
                        "error writing message, connection may have been lost: {}",
                        source
                    );
                } else {
                    debug!(bed = %shared.bed, feed = %shared.kind, "write failed while reconnect pending: {}", source);
                }
                Err(FeedError::Write {
                    feed: shared.kind,
                    source,
                })
            }
        }
    }

    /// Serve reconnect requests until cancelled.
    pub async fn run_retry_loop(&self, cancel: CancellationToken) {
        let pre_wait = self.shared.policy.pre_wait;
        loop {
            if !pre_wait.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = time::sleep(pre_wait) => {}
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.shared.signal.wait() => {}
            }

            let first_attempt = if self.shared.dial_failed.swap(false, Ordering::AcqRel) {
                2
            } else {
                1
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = self.reconnect_cycle_from(first_attempt, pre_wait) => {}
            }
        }
    }

    /// Dial until one attempt succeeds or the policy's attempt cap is hit.
    pub async fn reconnect_cycle(&self) -> bool {
        self.reconnect_cycle_from(1, Duration::ZERO).await
    }

    /// Run a cycle whose earlier attempts already happened. `waited` is the
    /// time already spent since the last of them.
    async fn reconnect_cycle_from(&self, first_attempt: u32, waited: Duration) -> bool {
        let shared = &self.shared;
        let policy = shared.policy;
        let mut attempt = first_attempt.max(1);

        if policy.max_attempts.is_some_and(|max| attempt > max) {
            shared.signal.clear();
            return false;
        }

        if attempt > 1 {
            let remaining = policy.delay_after(attempt - 1).saturating_sub(waited);
            if !remaining.is_zero() {
                time::sleep(remaining).await;
            }
        }

        loop {
            info!(bed = %shared.bed, feed = %shared.kind, attempt, "attempting to reconnect feed");
            match self.dial_and_publish().await {
                Ok(_) => {
                    bump(&shared.counters.reconnects);
                    info!(bed = %shared.bed, feed = %shared.kind, attempt, "successfully reconnected feed");
                    return true;
                }
                Err(e) => debug!(bed = %shared.bed, feed = %shared.kind, attempt, "reconnect failed: {}", e),
            }

            if policy.max_attempts.is_some_and(|max| attempt >= max) {
                warn!(bed = %shared.bed, feed = %shared.kind, attempt, "giving up reconnect cycle");
                shared.signal.clear();
                return false;
            }

            time::sleep(policy.delay_after(attempt)).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Sole writer of this feed's stream: frames queued bodies in order.
    pub async fn run_writer(&self, mut outbound: mpsc::Receiver<Vec<u8>>, cancel: CancellationToken) {
        loop {
            let body = tokio::select! {
                _ = cancel.cancelled() => return,
                body = outbound.recv() => match body {
                    Some(body) => body,
                    None => return,
                },
            };
            // Failures are reported inside; the next message goes out regardless
            let _ = self.write_body(&body).await;
        }
    }

    /// Read and discard whatever the hub sends on the current handle.
    pub async fn run_drain(&self, cancel: CancellationToken) {
        let mut current = self.watch_current();
        let mut buf = vec![0u8; DRAIN_BUFFER_SIZE];

        loop {
            let handle = current.borrow_and_update().clone();
            if let Some(handle) = handle {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    changed = current.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        continue;
                    }
                    () = self.drain_handle(&handle, &mut buf) => {}
                }
            }

            // No handle, or this one hit EOF: wait for the next publish
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = current.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn drain_handle(&self, handle: &ConnectionHandle, buf: &mut [u8]) {
        let mut reader = handle.reader.lock().await;
        loop {
            match reader.read(buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    self.shared
                        .counters
                        .bytes_drained
                        .fetch_add(n as u64, Ordering::Relaxed);
                }
            }
        }
    }

    /// Spawn the connect/retry, writer and drain tasks for this feed and
    /// return the queue producers submit bodies to.
    pub fn spawn(&self, tasks: &mut JoinSet<()>, cancel: &CancellationToken) -> FeedSender {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

        let feed = self.clone();
        let token = cancel.clone();
        tasks.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = feed.connect() => {}
            }
            feed.run_retry_loop(token).await;
        });

        let feed = self.clone();
        let token = cancel.clone();
        tasks.spawn(async move { feed.run_writer(rx, token).await });

        let feed = self.clone();
        let token = cancel.clone();
        tasks.spawn(async move { feed.run_drain(token).await });

        FeedSender {
            feed: self.clone(),
            tx,
        }
    }

    /// Close the current connection. The feed stays closed afterwards.
    pub async fn close(&self) {
        let previous = self.shared.current.send_replace(None);
        self.shared.state.send_replace(FeedState::Closed);
        if let Some(handle) = previous {
            handle.shutdown().await;
            debug!(bed = %self.shared.bed, feed = %self.shared.kind, generation = handle.generation(), "closed connection");
        }
    }
}

impl fmt::Debug for FeedConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedConnection")
            .field("bed", &self.shared.bed)
            .field("kind", &self.shared.kind)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Producer side of a feed's outbound queue.
#[derive(Debug, Clone)]
pub struct FeedSender {
    feed: FeedConnection,
    tx: mpsc::Sender<Vec<u8>>,
}

impl FeedSender {
    /// Queue a body for the writer. A full queue drops the message.
    pub fn submit(&self, body: impl Into<Vec<u8>>) -> bool {
        match self.tx.try_send(body.into()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                bump(&self.feed.shared.counters.frames_dropped);
                debug!(bed = %self.feed.bed(), feed = %self.feed.kind(), "outbound queue full, dropping message");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}
