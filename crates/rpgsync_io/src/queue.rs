//! Outbound packet queue and the batching flush protocol.
//!
//! A flush drains the queue in two partitions: first every
//! [`PacketClass::Immediate`] packet, then every [`PacketClass::Deferred`]
//! packet, each in the order it was queued. Packets of different classes are
//! never put into the same batch.
//!
//! Within a partition, packets are joined with [`MSG_DELIM`] into batches of
//! at most [`MAX_BATCH_LEN`] bytes.

use {
    crate::packet::{MSG_DELIM, PacketClass, QueuedPacket},
    bytes::Bytes,
    core::num::Saturating,
    std::collections::VecDeque,
    tracing::{trace, warn},
};

/// Default maximum length in bytes of a single batch, not counting the
/// authentication header.
pub const MAX_BATCH_LEN: usize = 4088;

/// How much of the queue a single flush drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushMode {
    /// Send every queued packet.
    #[default]
    Drain,
    /// Send only the first batch and keep the rest queued.
    ///
    /// This hands control back to the caller's event loop after every batch,
    /// so a large backlog cannot hold back control messages queued later.
    FirstBatch,
}

/// Counts of what a flush sent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushStats {
    /// Number of batches handed to the sender.
    pub batches: Saturating<usize>,
    /// Number of packets contained in those batches.
    pub packets: Saturating<usize>,
    /// Total byte length of those batches.
    pub bytes: Saturating<usize>,
}

/// FIFO of encoded packets waiting to be flushed.
#[derive(Debug, Clone)]
pub struct PacketQueue {
    packets: VecDeque<QueuedPacket>,
    max_batch_len: usize,
}

impl Default for PacketQueue {
    fn default() -> Self {
        Self::new(MAX_BATCH_LEN)
    }
}

impl PacketQueue {
    /// Creates an empty queue producing batches of at most `max_batch_len`
    /// bytes.
    #[must_use]
    pub const fn new(max_batch_len: usize) -> Self {
        Self {
            packets: VecDeque::new(),
            max_batch_len,
        }
    }

    /// Maximum length of a batch produced by this queue.
    #[must_use]
    pub const fn max_batch_len(&self) -> usize {
        self.max_batch_len
    }

    /// Appends a packet to the back of the queue.
    pub fn push(&mut self, packet: QueuedPacket) {
        self.packets.push_back(packet);
    }

    /// Number of packets waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// Returns `true` if no packets are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    /// Drops every waiting packet.
    pub fn clear(&mut self) {
        self.packets.clear();
    }

    /// Drains the queue into `send`, one call per batch.
    ///
    /// In [`FlushMode::FirstBatch`] this returns after the first call to
    /// `send`, leaving the remaining packets queued. Their partition order is
    /// preserved for the next flush.
    pub fn flush(&mut self, mode: FlushMode, mut send: impl FnMut(Bytes)) -> FlushStats {
        // stable partition: immediates keep their relative order at the front
        if self
            .packets
            .iter()
            .any(|packet| packet.class() == PacketClass::Deferred)
        {
            let (immediate, deferred): (VecDeque<_>, VecDeque<_>) = self
                .packets
                .drain(..)
                .partition(|packet| packet.class() == PacketClass::Immediate);
            self.packets = immediate;
            self.packets.extend(deferred);
        }

        let mut stats = FlushStats::default();
        while let Some((batch, num_packets)) = self.next_batch() {
            stats.batches += 1;
            stats.packets += num_packets;
            stats.bytes += batch.len();
            send(batch);

            if mode == FlushMode::FirstBatch {
                break;
            }
        }

        trace!(
            batches = stats.batches.0,
            packets = stats.packets.0,
            bytes = stats.bytes.0,
            left = self.packets.len(),
            "Flushed packet queue",
        );
        stats
    }

    /// Pops packets of the front packet's class until the batch is full.
    fn next_batch(&mut self) -> Option<(Bytes, usize)> {
        let first = self.packets.pop_front()?;
        let class = first.class();

        let first_len = first.payload().len();
        if first_len > self.max_batch_len {
            warn!(
                "Packet of {first_len} bytes exceeds the batch limit of {} bytes, sending it alone",
                self.max_batch_len
            );
            return Some((first.payload().clone(), 1));
        }

        let mut batch = Vec::with_capacity(self.max_batch_len);
        batch.extend_from_slice(first.payload());
        let mut num_packets = 1;

        while let Some(next) = self.packets.front() {
            if next.class() != class {
                break;
            }
            if batch.len() + MSG_DELIM.len() + next.payload().len() > self.max_batch_len {
                break;
            }

            batch.extend_from_slice(MSG_DELIM.as_bytes());
            batch.extend_from_slice(next.payload());
            num_packets += 1;
            self.packets.pop_front();
        }

        Some((Bytes::from(batch), num_packets))
    }
}
