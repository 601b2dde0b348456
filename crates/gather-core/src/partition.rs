//! Range partitioning — splits one file across every responding sender.
//!
//! The file `[0, file_size)` is cut into N contiguous ranges, one per sender,
//! in discovery-response order. All ranges but the last are
//! `file_size / N` bytes; the last absorbs the remainder.

use std::collections::HashSet;
use std::net::SocketAddr;

use crate::wire::{ByteRange, SenderId};

/// A sender that answered discovery, as described by its ACK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderDescriptor {
    pub id: SenderId,
    /// Source address of the ACK datagram.
    pub addr: SocketAddr,
    pub filename: String,
    pub file_size: u64,
}

/// One contiguous range bound to one sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAssignment {
    pub sender_id: SenderId,
    pub addr: SocketAddr,
    pub filename: String,
    pub range: ByteRange,
}

/// Partition the file across `senders`, preserving their order.
///
/// The first sender's reported size is taken as the size of the file.
/// Returns an empty vector when there are no senders.
pub fn assign(senders: &[SenderDescriptor]) -> Vec<ChunkAssignment> {
    let Some(first) = senders.first() else {
        return Vec::new();
    };

    let file_size = first.file_size;
    let count = senders.len() as u64;
    let chunk_size = file_size / count;

    senders
        .iter()
        .enumerate()
        .map(|(i, sender)| {
            let i = i as u64;
            let start = i * chunk_size;
            let end = if i == count - 1 {
                file_size
            } else {
                (i + 1) * chunk_size
            };
            ChunkAssignment {
                sender_id: sender.id,
                addr: sender.addr,
                filename: sender.filename.clone(),
                range: ByteRange { start, end },
            }
        })
        .collect()
}

/// Keep the first ACK for each sender ID, in arrival order.
pub fn dedup_senders(senders: Vec<SenderDescriptor>) -> Vec<SenderDescriptor> {
    let mut seen = HashSet::new();
    senders
        .into_iter()
        .filter(|s| seen.insert(s.id))
        .collect()
}

/// Senders whose reported size disagrees with the first sender's.
pub fn size_disagreements(senders: &[SenderDescriptor]) -> Vec<&SenderDescriptor> {
    let Some(first) = senders.first() else {
        return Vec::new();
    };
    senders
        .iter()
        .filter(|s| s.file_size != first.file_size)
        .collect()
}
