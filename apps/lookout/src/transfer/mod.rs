//! Chunked clip upload over the reliable channel with high/low watermark
//! backpressure.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use relay_proto::{ChannelControl, FileAnnouncement};
use thiserror::Error;

use crate::config::TransferLimits;
use crate::telemetry::{self, Measure};

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("reliable channel closed")]
    ChannelClosed,
    #[error("chunk of {size} bytes exceeds the negotiated maximum of {max}")]
    ChunkTooLarge { size: usize, max: usize },
    #[error("refusing to send an empty payload")]
    Empty,
    #[error("channel send failed: {0}")]
    Channel(String),
    #[error("failed to encode announcement: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Ordered, reliable message pipe bound to one peer session.
#[async_trait]
pub trait ReliableChannel: Send + Sync {
    fn label(&self) -> &str;

    fn is_open(&self) -> bool;

    async fn buffered_amount(&self) -> usize;

    /// Threshold at or below which the channel reports `BufferedAmountLow`.
    async fn set_low_water_mark(&self, threshold: usize);

    async fn send_text(&self, text: String) -> Result<(), TransferError>;

    async fn send_bytes(&self, data: Bytes) -> Result<(), TransferError>;

    async fn close(&self);
}

/// Reads `a=max-message-size` from a remote description. A missing line, or
/// the `0` meaning "unlimited", falls back to the local maximum.
pub fn negotiated_max_message_size(remote_sdp: &str, local_max: usize) -> usize {
    let remote = remote_sdp.lines().find_map(|line| {
        line.trim()
            .strip_prefix("a=max-message-size:")
            .and_then(|value| value.trim().parse::<usize>().ok())
    });
    match remote {
        Some(0) | None => local_max,
        Some(remote) => remote.min(local_max),
    }
}

pub fn chunk_size_for(max_message_size: usize, cap: usize) -> usize {
    max_message_size.min(cap).max(1)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermarks {
    pub low: usize,
    pub high: usize,
}

impl Watermarks {
    /// `low` is one chunk. `high` is the job size, capped by `max_buffered`
    /// and kept above `low` so a paused job always sees a low-water crossing.
    pub fn for_job(chunk_size: usize, total_size: u64, max_buffered: usize) -> Self {
        let total = usize::try_from(total_size).unwrap_or(usize::MAX);
        Self {
            low: chunk_size,
            high: total.min(max_buffered).max(chunk_size + 1),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferJob {
    name: String,
    mime: String,
    source: Bytes,
    total_size: u64,
    chunk_size: u32,
    bytes_queued: u64,
}

impl TransferJob {
    pub fn new(
        name: impl Into<String>,
        mime: impl Into<String>,
        source: Bytes,
    ) -> Result<Self, TransferError> {
        if source.is_empty() {
            return Err(TransferError::Empty);
        }
        Ok(Self {
            name: name.into(),
            mime: mime.into(),
            total_size: source.len() as u64,
            source,
            chunk_size: 0,
            bytes_queued: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mime(&self) -> &str {
        &self.mime
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    pub fn bytes_queued(&self) -> u64 {
        self.bytes_queued
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_queued >= self.total_size
    }

    pub fn announcement(&self) -> ChannelControl {
        ChannelControl::SendFile {
            file: FileAnnouncement {
                mime: self.mime.clone(),
                size: self.total_size,
                name: self.name.clone(),
            },
        }
    }

    fn start(&mut self, chunk_size: usize, max_message_size: usize) -> Result<(), TransferError> {
        if chunk_size > max_message_size {
            return Err(TransferError::ChunkTooLarge {
                size: chunk_size,
                max: max_message_size,
            });
        }
        self.chunk_size = u32::try_from(chunk_size).map_err(|_| TransferError::ChunkTooLarge {
            size: chunk_size,
            max: u32::MAX as usize,
        })?;
        Ok(())
    }

    /// Next window of the source; advances the cursor.
    fn next_chunk(&mut self) -> Option<Bytes> {
        if self.is_complete() || self.chunk_size == 0 {
            return None;
        }
        let start = self.bytes_queued as usize;
        let end = (start + self.chunk_size as usize).min(self.source.len());
        self.bytes_queued = end as u64;
        Some(self.source.slice(start..end))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferState {
    /// Waiting for an open channel.
    Waiting,
    Sending,
    /// Paused at the high watermark.
    Paused,
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub id: u64,
    pub name: String,
    pub total_size: u64,
    pub bytes_queued: u64,
    pub state: TransferState,
}

struct ActiveTransfer {
    id: u64,
    job: TransferJob,
    watermarks: Watermarks,
    paused: bool,
    paused_at: Option<Instant>,
}

impl ActiveTransfer {
    fn progress(&self, state: TransferState) -> TransferProgress {
        progress_of(self.id, &self.job, state)
    }
}

fn progress_of(id: u64, job: &TransferJob, state: TransferState) -> TransferProgress {
    TransferProgress {
        id,
        name: job.name.clone(),
        total_size: job.total_size,
        bytes_queued: job.bytes_queued,
        state,
    }
}

/// FIFO of clip uploads. Jobs outlive sessions: they wait until a channel is
/// attached, and only the job in flight fails when its channel closes.
pub struct TransferQueue {
    limits: TransferLimits,
    channel: Option<Arc<dyn ReliableChannel>>,
    max_message_size: usize,
    waiting: VecDeque<(u64, TransferJob)>,
    active: Option<ActiveTransfer>,
    next_id: u64,
}

impl TransferQueue {
    pub fn new(limits: TransferLimits) -> Self {
        Self {
            limits,
            channel: None,
            max_message_size: limits.local_max_message_size,
            waiting: VecDeque::new(),
            active: None,
            next_id: 1,
        }
    }

    pub fn has_channel(&self) -> bool {
        self.channel.is_some()
    }

    pub fn waiting(&self) -> usize {
        self.waiting.len()
    }

    pub fn active(&self) -> Option<TransferProgress> {
        self.active.as_ref().map(|active| {
            let state = if active.paused {
                TransferState::Paused
            } else {
                TransferState::Sending
            };
            active.progress(state)
        })
    }

    pub fn chunk_size(&self) -> usize {
        chunk_size_for(self.max_message_size, self.limits.chunk_cap)
    }

    pub async fn attach(
        &mut self,
        channel: Arc<dyn ReliableChannel>,
        max_message_size: usize,
    ) -> Vec<TransferProgress> {
        tracing::debug!(
            target = "transfer",
            label = channel.label(),
            max_message_size,
            "reliable channel attached"
        );
        self.channel = Some(channel);
        self.max_message_size = max_message_size;
        self.pump().await
    }

    pub async fn enqueue(&mut self, job: TransferJob) -> Vec<TransferProgress> {
        let id = self.next_id;
        self.next_id += 1;
        let mut updates = vec![progress_of(id, &job, TransferState::Waiting)];
        self.waiting.push_back((id, job));
        updates.extend(self.pump().await);
        updates
    }

    /// The channel drained to its low watermark.
    pub async fn on_buffered_amount_low(&mut self) -> Vec<TransferProgress> {
        let (Some(channel), Some(active)) = (&self.channel, &mut self.active) else {
            return Vec::new();
        };
        if !active.paused {
            return Vec::new();
        }
        let buffered = channel.buffered_amount().await;
        if buffered > active.watermarks.low {
            return Vec::new();
        }
        active.paused = false;
        if let Some(at) = active.paused_at.take() {
            telemetry::elapsed(Measure::TransferPaused, at.elapsed());
        }
        tracing::trace!(target = "transfer", buffered, "resuming at low watermark");
        self.pump().await
    }

    /// Fails the job in flight. Waiting jobs stay queued for the next channel.
    pub fn on_channel_closed(&mut self) -> Vec<TransferProgress> {
        self.channel = None;
        match self.active.take() {
            Some(active) => {
                tracing::warn!(
                    target = "transfer",
                    name = %active.job.name,
                    queued = active.job.bytes_queued,
                    total = active.job.total_size,
                    "channel closed mid-transfer"
                );
                vec![active.progress(TransferState::Failed(
                    TransferError::ChannelClosed.to_string(),
                ))]
            }
            None => Vec::new(),
        }
    }

    /// Sends as much as the watermarks allow.
    pub async fn pump(&mut self) -> Vec<TransferProgress> {
        let mut updates = Vec::new();
        loop {
            let channel = match &self.channel {
                Some(channel) if channel.is_open() => Arc::clone(channel),
                _ => return updates,
            };

            let mut active = match self.active.take() {
                Some(active) => active,
                None => match self.start_next(channel.as_ref()).await {
                    Some(Ok(active)) => {
                        updates.push(active.progress(TransferState::Sending));
                        active
                    }
                    Some(Err(failed)) => {
                        updates.push(failed);
                        continue;
                    }
                    None => return updates,
                },
            };

            if active.paused {
                self.active = Some(active);
                return updates;
            }

            match send_until_high(channel.as_ref(), &mut active).await {
                Ok(true) => {
                    tracing::debug!(
                        target = "transfer",
                        name = %active.job.name,
                        size = active.job.total_size,
                        "transfer fully queued"
                    );
                    updates.push(active.progress(TransferState::Completed));
                }
                Ok(false) => {
                    active.paused = true;
                    active.paused_at = Some(Instant::now());
                    updates.push(active.progress(TransferState::Paused));
                    self.active = Some(active);
                    return updates;
                }
                Err(err) => {
                    tracing::warn!(target = "transfer", name = %active.job.name, error = %err, "transfer aborted");
                    updates.push(active.progress(TransferState::Failed(err.to_string())));
                }
            }
        }
    }

    async fn start_next(
        &mut self,
        channel: &dyn ReliableChannel,
    ) -> Option<Result<ActiveTransfer, TransferProgress>> {
        let (id, mut job) = self.waiting.pop_front()?;
        let chunk_size = self.chunk_size();
        let watermarks = Watermarks::for_job(chunk_size, job.total_size, self.limits.max_buffered);

        let started = announce(
            channel,
            &mut job,
            chunk_size,
            self.max_message_size,
            watermarks,
        )
        .await;

        Some(match started {
            Ok(()) => {
                tracing::debug!(
                    target = "transfer",
                    name = %job.name,
                    size = job.total_size,
                    chunk_size,
                    low = watermarks.low,
                    high = watermarks.high,
                    "transfer announced"
                );
                Ok(ActiveTransfer {
                    id,
                    job,
                    watermarks,
                    paused: false,
                    paused_at: None,
                })
            }
            Err(err) => Err(progress_of(id, &job, TransferState::Failed(err.to_string()))),
        })
    }
}

async fn announce(
    channel: &dyn ReliableChannel,
    job: &mut TransferJob,
    chunk_size: usize,
    max_message_size: usize,
    watermarks: Watermarks,
) -> Result<(), TransferError> {
    job.start(chunk_size, max_message_size)?;
    channel.set_low_water_mark(watermarks.low).await;
    let text = job.announcement().to_text()?;
    channel.send_text(text).await
}

/// Returns `Ok(true)` when the job is fully queued, `Ok(false)` when the
/// channel buffer reached the high watermark.
async fn send_until_high(
    channel: &dyn ReliableChannel,
    active: &mut ActiveTransfer,
) -> Result<bool, TransferError> {
    while !active.job.is_complete() {
        if !channel.is_open() {
            return Err(TransferError::ChannelClosed);
        }
        if channel.buffered_amount().await >= active.watermarks.high {
            return Ok(false);
        }
        let Some(chunk) = active.job.next_chunk() else {
            break;
        };
        let len = chunk.len();
        channel.send_bytes(chunk).await?;
        telemetry::bytes(Measure::ChunkSent, len);
    }
    Ok(true)
}
