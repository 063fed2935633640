//! Terminal connection and response correlation.
//!
//! The transport is half-duplex: a command is written, then the terminal
//! answers once. [`VipaConnection`] owns the write half and a background
//! reader task; the reader reassembles replies and hands them to the
//! [`ResponseCorrelator`].
//!
//! # Response Slots
//!
//! The correlator holds one slot per [`ResponseKind`]. Before a command is
//! written the caller subscribes the slot its reply will arrive in and
//! receives a [`PendingReply`]. A slot that is still subscribed rejects a
//! second subscription with [`HardwareError::SlotBusy`], so a reply can
//! never resolve a completion that belongs to another command.
//!
//! A call that times out or is abandoned leaves its slot subscribed.
//! [`ResponseCorrelator::cancel_handlers`] resolves every such stale slot
//! with [`Completion::Cancelled`] and clears all slots; it must run before the
//! next exchange.
//!
//! ```text
//! subscribe(kind) -> write frames -> reader task -> deliver(reply) -> PendingReply resolves
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, trace, warn};

use dal_core::constants::{CANCEL_HANDLER_BACKOFF_MS, CONTACTLESS_NODE_ADDRESS};
use dal_protocol::{ResponseAssembler, Tlv, TlvCodec, VipaCodec, VipaCommand, VipaResponse, VipaStatus};

use crate::error::{HardwareError, Result};
use crate::types::ResponseKind;

/// Parsed body of a reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyBody {
    Tags(Vec<Tlv>),
    Raw(Bytes),
    Contactless { tags: Vec<Tlv>, pcb: u8 },
}

impl ReplyBody {
    /// TLV nodes of a tagged or contactless reply, empty for raw replies.
    pub fn tags(&self) -> &[Tlv] {
        match self {
            Self::Tags(tags) | Self::Contactless { tags, .. } => tags,
            Self::Raw(_) => &[],
        }
    }
}

/// A reply delivered to a subscribed slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceReply {
    pub status: VipaStatus,
    pub status_word: u16,
    pub body: ReplyBody,
}

impl DeviceReply {
    pub fn tags(&self) -> &[Tlv] {
        self.body.tags()
    }

    /// Fail with [`HardwareError::DeviceStatus`] unless the status is success.
    pub fn ensure_success(self) -> Result<Self> {
        if self.status.is_success() {
            Ok(self)
        } else {
            Err(HardwareError::device_status(self.status_word))
        }
    }
}

/// How a pending reply was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Reply(DeviceReply),
    /// Force-resolved by `cancel_handlers`.
    Cancelled,
}

struct PendingSlot {
    id: u64,
    sender: oneshot::Sender<Completion>,
}

#[derive(Default)]
struct Slots {
    tagged: Option<PendingSlot>,
    raw: Option<PendingSlot>,
    contactless: Option<PendingSlot>,
}

impl Slots {
    fn get_mut(&mut self, kind: ResponseKind) -> &mut Option<PendingSlot> {
        match kind {
            ResponseKind::Tagged => &mut self.tagged,
            ResponseKind::Raw => &mut self.raw,
            ResponseKind::Contactless => &mut self.contactless,
        }
    }

    fn take_all(&mut self) -> Vec<(ResponseKind, PendingSlot)> {
        ResponseKind::ALL
            .into_iter()
            .filter_map(|kind| self.get_mut(kind).take().map(|slot| (kind, slot)))
            .collect()
    }

    /// Slot a reply from `nad` belongs to. Contactless replies go only to the
    /// contactless slot; others prefer tagged over raw.
    fn route(&self, nad: u8) -> Option<ResponseKind> {
        if nad == CONTACTLESS_NODE_ADDRESS {
            return self.contactless.as_ref().map(|_| ResponseKind::Contactless);
        }
        if self.tagged.is_some() {
            Some(ResponseKind::Tagged)
        } else if self.raw.is_some() {
            Some(ResponseKind::Raw)
        } else {
            None
        }
    }
}

/// Handle to a subscribed slot.
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    kind: ResponseKind,
    receiver: oneshot::Receiver<Completion>,
}

impl PendingReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> ResponseKind {
        self.kind
    }

    /// Wait for the reply.
    ///
    /// # Errors
    ///
    /// Returns `HardwareError::Disconnected` if the connection closed before
    /// the slot was resolved.
    pub async fn wait(self) -> Result<Completion> {
        self.receiver
            .await
            .map_err(|_| HardwareError::disconnected("connection closed while awaiting reply"))
    }
}

/// Single-slot-per-kind completion registry.
pub struct ResponseCorrelator {
    slots: Mutex<Slots>,
    next_id: AtomicU64,
    codec: TlvCodec,
}

impl Default for ResponseCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ResponseCorrelator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCorrelator")
            .field("subscribed", &self.subscribed())
            .finish()
    }
}

impl ResponseCorrelator {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            next_id: AtomicU64::new(1),
            codec: TlvCodec::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a fresh completion in the slot for `kind`.
    ///
    /// # Errors
    ///
    /// Returns `HardwareError::SlotBusy` if the slot is still subscribed.
    pub fn subscribe(&self, kind: ResponseKind) -> Result<PendingReply> {
        let mut slots = self.lock();
        let slot = slots.get_mut(kind);
        if slot.is_some() {
            return Err(HardwareError::SlotBusy { kind });
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = oneshot::channel();
        *slot = Some(PendingSlot { id, sender });
        trace!(%kind, id, "Subscribed response slot");
        Ok(PendingReply { id, kind, receiver })
    }

    /// Remove the subscription `id` from `kind` if it is still there.
    pub fn unsubscribe(&self, kind: ResponseKind, id: u64) {
        let mut slots = self.lock();
        let slot = slots.get_mut(kind);
        if slot.as_ref().is_some_and(|s| s.id == id) {
            *slot = None;
        }
    }

    pub fn is_subscribed(&self, kind: ResponseKind) -> bool {
        self.lock().get_mut(kind).is_some()
    }

    /// Kinds with an outstanding completion.
    pub fn subscribed(&self) -> Vec<ResponseKind> {
        let mut slots = self.lock();
        ResponseKind::ALL
            .into_iter()
            .filter(|kind| slots.get_mut(*kind).is_some())
            .collect()
    }

    /// Resolve the matching slot with `response`. Returns `false` when no slot
    /// is subscribed for it or the waiter is gone.
    pub fn deliver(&self, response: VipaResponse) -> bool {
        let (kind, pending) = {
            let mut slots = self.lock();
            let Some(kind) = slots.route(response.nad) else {
                warn!(
                    nad = response.nad,
                    status = %response.status(),
                    "Unsolicited reply dropped"
                );
                return false;
            };
            match slots.get_mut(kind).take() {
                Some(pending) => (kind, pending),
                None => return false,
            }
        };

        let body = match kind {
            ResponseKind::Tagged => ReplyBody::Tags(self.codec.decode_lenient(&response.data)),
            ResponseKind::Raw => ReplyBody::Raw(response.data.clone()),
            ResponseKind::Contactless => ReplyBody::Contactless {
                tags: self.codec.decode_lenient(&response.data),
                pcb: response.pcb,
            },
        };
        let reply = DeviceReply {
            status: response.status(),
            status_word: response.status_word,
            body,
        };

        debug!(%kind, id = pending.id, status = %reply.status, "Resolved response slot");
        if pending.sender.send(Completion::Reply(reply)).is_err() {
            debug!(%kind, id = pending.id, "Reply arrived after waiter left");
            return false;
        }
        true
    }

    /// Force-resolve every subscribed slot as cancelled and clear all slots.
    ///
    /// Makes up to `retries + 1` passes with a short backoff between them.
    /// Returns the number of waiters that received the cancellation.
    pub async fn cancel_handlers(&self, retries: u32) -> usize {
        let mut resolved = 0;
        let mut attempt = 0;
        loop {
            let stale = self.lock().take_all();
            if stale.is_empty() {
                break;
            }
            for (kind, pending) in stale {
                debug!(%kind, id = pending.id, attempt, "Cancelling stale response slot");
                if pending.sender.send(Completion::Cancelled).is_ok() {
                    resolved += 1;
                }
            }
            if attempt >= retries {
                break;
            }
            attempt += 1;
            tokio::time::sleep(Duration::from_millis(CANCEL_HANDLER_BACKOFF_MS)).await;
        }
        self.lock().take_all();
        resolved
    }

    /// Drop every slot without resolving it; waiters see a disconnect.
    pub fn close(&self) {
        let dropped = self.lock().take_all();
        if !dropped.is_empty() {
            debug!(count = dropped.len(), "Dropping response slots on close");
        }
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type SharedWriter = Arc<tokio::sync::Mutex<FramedWrite<BoxedWriter, VipaCodec>>>;

/// Live connection to one terminal.
pub struct VipaConnection {
    name: String,
    writer: SharedWriter,
    correlator: Arc<ResponseCorrelator>,
    connected: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl std::fmt::Debug for VipaConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VipaConnection")
            .field("name", &self.name)
            .field("connected", &self.is_connected())
            .field("correlator", &self.correlator)
            .finish()
    }
}

impl VipaConnection {
    /// Split `stream` and start the reader task.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn open<S>(name: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let name = name.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let correlator = Arc::new(ResponseCorrelator::new());
        let connected = Arc::new(AtomicBool::new(true));

        let reader = tokio::spawn(read_loop(
            name.clone(),
            read_half,
            Arc::clone(&correlator),
            Arc::clone(&connected),
        ));

        let writer: BoxedWriter = Box::new(write_half);
        Self {
            name,
            writer: Arc::new(tokio::sync::Mutex::new(FramedWrite::new(
                writer,
                VipaCodec::new(),
            ))),
            correlator,
            connected,
            reader,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn correlator(&self) -> &ResponseCorrelator {
        &self.correlator
    }

    /// Reclaim the channel from any stale call.
    pub async fn cancel_handlers(&self, retries: u32) -> usize {
        self.correlator.cancel_handlers(retries).await
    }

    /// Write every frame of `command` as one uninterrupted sequence.
    ///
    /// The frames are written on their own task, so a caller that is
    /// aborted mid-chain still leaves the whole chain on the link.
    ///
    /// # Errors
    ///
    /// Returns `HardwareError::Disconnected` when the reader has stopped,
    /// or the transport's write error.
    pub async fn send(&self, command: &VipaCommand) -> Result<()> {
        if !self.is_connected() {
            return Err(HardwareError::disconnected(&self.name));
        }
        let frames = command.frames();
        debug!(
            device = %self.name,
            command = %command.command(),
            frames = frames.len(),
            "Sending command"
        );

        let writer = Arc::clone(&self.writer);
        let write = tokio::spawn(async move {
            let mut writer = writer.lock().await;
            for frame in frames {
                writer.feed(frame).await?;
            }
            writer.flush().await?;
            Ok::<_, HardwareError>(())
        });
        match write.await {
            Ok(result) => result,
            Err(e) => Err(HardwareError::aborted(e.to_string())),
        }
    }

    /// Subscribe `kind`, send `command` and wait for the reply.
    ///
    /// With `timeout` set, a missing reply fails with
    /// `HardwareError::Timeout` and leaves the slot subscribed until the
    /// next `cancel_handlers`.
    ///
    /// # Errors
    ///
    /// Returns `HardwareError::SlotBusy` when a previous call of the same
    /// kind was not reclaimed, plus the errors of [`VipaConnection::send`].
    pub async fn exchange(
        &self,
        command: &VipaCommand,
        kind: ResponseKind,
        timeout: Option<Duration>,
    ) -> Result<Completion> {
        let pending = self.correlator.subscribe(kind)?;
        let id = pending.id();
        if let Err(e) = self.send(command).await {
            self.correlator.unsubscribe(kind, id);
            return Err(e);
        }

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, pending.wait()).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(
                        device = %self.name,
                        command = %command.command(),
                        timeout_ms = limit.as_millis() as u64,
                        "No reply from device"
                    );
                    Err(HardwareError::timeout(limit))
                }
            },
            None => pending.wait().await,
        }
    }

    /// Stop the reader and fail every outstanding wait.
    pub fn close(&self) {
        self.reader.abort();
        self.connected.store(false, Ordering::Release);
        self.correlator.close();
    }
}

impl Drop for VipaConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(
    name: String,
    reader: R,
    correlator: Arc<ResponseCorrelator>,
    connected: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut packets = FramedRead::new(reader, VipaCodec::new());
    let mut assembler = ResponseAssembler::new();

    while let Some(next) = packets.next().await {
        let packet = match next {
            Ok(packet) => packet,
            Err(e) => {
                warn!(device = %name, error = %e, "Transport decode failed");
                break;
            }
        };
        match assembler.push(packet) {
            Ok(Some(response)) => {
                correlator.deliver(response);
            }
            Ok(None) => {}
            Err(e) => warn!(device = %name, error = %e, "Discarding malformed reply"),
        }
    }

    debug!(device = %name, "Reader stopped");
    connected.store(false, Ordering::Release);
    correlator.close();
}
