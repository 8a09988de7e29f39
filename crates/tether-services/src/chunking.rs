//! Chunking of oversized envelopes and reassembly at the recipient.
//!
//! A chunk carries a slice of the complete, already armed packet under a
//! copy of its public header. Only the head chunk (`chunk_no == 0`) knows
//! the total count. Relays forward chunks as they are; only the recipient
//! reassembles.
//!
//! Reassembly state is kept per message id and discarded on completion,
//! on a size violation, or once the transfer timeout has elapsed.

use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tether_core::wire::{ChunkPosition, PublicHeader, CHUNK_HEADER_OVERHEAD};
use tether_core::{Envelope, Nonce, PublicKey, WireError};

use crate::clock::SharedClock;
use crate::error::PipelineError;
use crate::pipeline::{Action, Address, Message, NodeEvent, Stage};

/// Split `envelope` into chunks whose encoded size fits `mtu`.
///
/// An envelope that already fits is returned unchanged.
pub fn chunk(envelope: Envelope, mtu: usize) -> Result<Vec<Envelope>, PipelineError> {
    let size = envelope.encoded_len();
    if size <= mtu {
        return Ok(vec![envelope]);
    }
    let slice_len = mtu
        .checked_sub(CHUNK_HEADER_OVERHEAD)
        .filter(|len| *len > 0)
        .ok_or(PipelineError::MessageTooLarge { size, max: mtu })?;
    let total = size.div_ceil(slice_len);
    let total_chunks = u16::try_from(total).map_err(|_| PipelineError::MessageTooLarge {
        size,
        max: slice_len * usize::from(u16::MAX),
    })?;

    let packet = envelope.encode();
    let header = envelope.header();
    let chunks = (0..total_chunks)
        .map(|chunk_no| {
            let start = usize::from(chunk_no) * slice_len;
            let end = (start + slice_len).min(size);
            let position = if chunk_no == 0 {
                ChunkPosition::Head { total_chunks }
            } else {
                ChunkPosition::Follow { chunk_no }
            };
            Envelope::chunk(header, position, packet.slice(start..end))
        })
        .collect();
    Ok(chunks)
}

// ── Reassembly ────────────────────────────────────────────────────────────────

struct ReassemblyBuffer {
    created_ms: u64,
    /// Known once the head chunk has arrived.
    total: Option<u16>,
    chunks: BTreeMap<u16, Bytes>,
    bytes: usize,
    sender: PublicKey,
    recipient: PublicKey,
}

impl ReassemblyBuffer {
    fn new(now: u64, header: &PublicHeader) -> Self {
        Self {
            created_ms: now,
            total: None,
            chunks: BTreeMap::new(),
            bytes: 0,
            sender: header.sender,
            recipient: header.recipient,
        }
    }

    fn is_complete(&self) -> bool {
        self.total
            .is_some_and(|total| self.chunks.len() == usize::from(total))
    }

    fn concat(&self) -> Bytes {
        let mut packet = BytesMut::with_capacity(self.bytes);
        for slice in self.chunks.values() {
            packet.extend_from_slice(slice);
        }
        packet.freeze()
    }
}

enum Progress {
    Pending,
    Complete(Bytes),
    Failed(PipelineError),
}

/// Per-id reassembly buffers.
pub struct ChunkAssembler {
    max_content_length: usize,
    timeout_ms: u64,
    clock: SharedClock,
    buffers: DashMap<Nonce, ReassemblyBuffer>,
}

impl ChunkAssembler {
    pub fn new(max_content_length: usize, timeout_ms: u64, clock: SharedClock) -> Self {
        Self {
            max_content_length,
            timeout_ms,
            clock,
            buffers: DashMap::new(),
        }
    }

    /// Add a chunk. Returns the composed envelope once every chunk is in.
    pub fn reassemble(&self, chunk: Envelope) -> Result<Option<Envelope>, PipelineError> {
        let position = chunk
            .chunk_position()
            .ok_or(WireError::InvalidMessageFormat("not a chunk".to_string()))?;
        let slice = chunk
            .chunk_payload()
            .cloned()
            .ok_or(WireError::InvalidMessageFormat("not a chunk".to_string()))?;
        let id = chunk.id();
        let now = self.clock.now_ms();

        let progress = {
            let mut buffer = self
                .buffers
                .entry(id)
                .or_insert_with(|| ReassemblyBuffer::new(now, chunk.header()));
            if now.saturating_sub(buffer.created_ms) >= self.timeout_ms {
                tracing::debug!(%id, "composed message transfer timed out, restarting");
                *buffer = ReassemblyBuffer::new(now, chunk.header());
            }
            self.add(&mut buffer, &chunk, position, slice)
        };

        match progress {
            Progress::Pending => Ok(None),
            Progress::Failed(e) => {
                self.buffers.remove(&id);
                Err(e)
            }
            Progress::Complete(packet) => {
                self.buffers.remove(&id);
                let composed = Envelope::decode(packet)?;
                if composed.id() != id || composed.is_chunk() {
                    return Err(WireError::InvalidMessageFormat(
                        "reassembled packet does not match its chunks".to_string(),
                    )
                    .into());
                }
                tracing::trace!(%id, "composed message reassembled");
                Ok(Some(composed))
            }
        }
    }

    fn add(
        &self,
        buffer: &mut ReassemblyBuffer,
        chunk: &Envelope,
        position: ChunkPosition,
        slice: Bytes,
    ) -> Progress {
        let header = chunk.header();
        if header.sender != buffer.sender || header.recipient != buffer.recipient {
            tracing::debug!(id = %header.id, peer = %header.sender, "chunk does not belong to this message, ignored");
            return Progress::Pending;
        }
        let chunk_no = position.chunk_no();
        if buffer.chunks.contains_key(&chunk_no) {
            return Progress::Pending;
        }

        if let Some(total) = position.total_chunks() {
            // every chunk but the last is as long as the head
            let implied = (usize::from(total) - 1) * slice.len() + 1;
            if implied > self.max_content_length {
                return Progress::Failed(PipelineError::MessageTooLarge {
                    size: implied,
                    max: self.max_content_length,
                });
            }
            buffer.total = Some(total);
        }
        if let Some(total) = buffer.total {
            if let Some(highest) = buffer.chunks.keys().next_back() {
                if *highest >= total {
                    return Progress::Failed(invalid("chunk number out of range"));
                }
            }
            if chunk_no >= total {
                return Progress::Failed(invalid("chunk number out of range"));
            }
        }

        let size = buffer.bytes + slice.len();
        if size > self.max_content_length {
            return Progress::Failed(PipelineError::MessageTooLarge {
                size,
                max: self.max_content_length,
            });
        }
        buffer.bytes = size;
        buffer.chunks.insert(chunk_no, slice);

        if buffer.is_complete() {
            Progress::Complete(buffer.concat())
        } else {
            Progress::Pending
        }
    }

    /// Drop buffers whose transfer timeout has elapsed.
    pub fn evict_expired(&self) {
        let now = self.clock.now_ms();
        self.buffers.retain(|id, buffer| {
            let alive = now.saturating_sub(buffer.created_ms) < self.timeout_ms;
            if !alive {
                tracing::debug!(%id, chunks = buffer.chunks.len(), "incomplete composed message discarded");
            }
            alive
        });
    }

    pub fn pending(&self) -> usize {
        self.buffers.len()
    }

    pub fn clear(&self) {
        self.buffers.clear();
    }
}

fn invalid(reason: &str) -> PipelineError {
    WireError::InvalidMessageFormat(reason.to_string()).into()
}

// ── Stage ─────────────────────────────────────────────────────────────────────

pub struct ChunkingStage {
    me: PublicKey,
    mtu: usize,
    max_content_length: usize,
    assembler: ChunkAssembler,
}

impl ChunkingStage {
    pub fn new(me: PublicKey, mtu: usize, assembler: ChunkAssembler) -> Self {
        Self {
            me,
            mtu,
            max_content_length: assembler.max_content_length,
            assembler,
        }
    }

    pub fn assembler(&self) -> &ChunkAssembler {
        &self.assembler
    }
}

impl Stage for ChunkingStage {
    fn name(&self) -> &'static str {
        "chunking"
    }

    fn on_inbound(&self, from: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        match message {
            Message::Envelope(envelope) if envelope.is_chunk() && envelope.recipient() == self.me => {
                match self.assembler.reassemble(envelope)? {
                    Some(composed) => Ok(vec![Action::inbound(from, composed)]),
                    None => Ok(Vec::new()),
                }
            }
            other => Ok(vec![Action::Inbound { from, message: other }]),
        }
    }

    fn on_outbound(&self, to: Address, message: Message) -> Result<Vec<Action>, PipelineError> {
        match message {
            Message::Envelope(envelope) if envelope.sender() == self.me && !envelope.is_chunk() => {
                let size = envelope.encoded_len();
                if size > self.max_content_length {
                    tracing::debug!(%to, size, "message exceeds max content length, dropped");
                    return Err(PipelineError::MessageTooLarge {
                        size,
                        max: self.max_content_length,
                    });
                }
                Ok(chunk(envelope, self.mtu)?
                    .into_iter()
                    .map(|piece| Action::outbound(to, piece))
                    .collect())
            }
            other => Ok(vec![Action::Outbound { to, message: other }]),
        }
    }

    fn on_tick(&self) -> Result<Vec<Action>, PipelineError> {
        self.assembler.evict_expired();
        Ok(Vec::new())
    }

    fn on_event(&self, event: NodeEvent) -> Result<Vec<Action>, PipelineError> {
        if event.is_shutdown() {
            self.assembler.clear();
        }
        Ok(Vec::new())
    }
}
