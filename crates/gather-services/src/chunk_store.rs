//! Chunk store — holds received ranges until the whole file is present.
//!
//! Built from the assignment list, owned by the receiver for one transfer.
//! Chunks are keyed by sender ID; a second delivery from the same sender
//! replaces the first. Assembly walks the assigned ranges in file order,
//! which is ascending sender ID whenever IDs 0..N-1 answered discovery in
//! that order.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use bytes::Bytes;

use gather_core::wire::{ByteRange, ChunkPayload, SenderId, MAX_CHUNK_HEADER};
use gather_core::ChunkAssignment;

/// What `insert` did with an accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// First delivery for this sender.
    New,
    /// Overwrote an earlier delivery from the same sender.
    Replaced,
}

/// Reasons an incoming chunk is not stored.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("chunk from sender {0}, which has no assignment")]
    UnexpectedSender(SenderId),

    #[error("sender {sender_id} sent {actual:?}, expected {expected:?}")]
    WrongFile {
        sender_id: SenderId,
        expected: String,
        actual: String,
    },

    #[error("sender {sender_id} sent range {actual}, assigned {expected}")]
    RangeMismatch {
        sender_id: SenderId,
        expected: ByteRange,
        actual: ByteRange,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AssemblyError {
    #[error("missing chunks from senders {0:?}")]
    Incomplete(Vec<SenderId>),

    #[error("assigned ranges leave a gap or overlap at byte {0}")]
    Discontiguous(u64),
}

pub struct ChunkStore {
    filename: String,
    file_size: u64,
    assigned: BTreeMap<SenderId, ByteRange>,
    chunks: BTreeMap<SenderId, Bytes>,
}

impl ChunkStore {
    pub fn new(filename: impl Into<String>, assignments: &[ChunkAssignment]) -> Self {
        let assigned: BTreeMap<_, _> = assignments
            .iter()
            .map(|a| (a.sender_id, a.range))
            .collect();
        let file_size = assigned.values().map(|r| r.end).max().unwrap_or(0);
        Self {
            filename: filename.into(),
            file_size,
            assigned,
            chunks: BTreeMap::new(),
        }
    }

    /// Largest CHUNK frame any assigned sender can legitimately send.
    pub fn max_frame_len(&self) -> usize {
        let longest = self.assigned.values().map(ByteRange::len).max().unwrap_or(0);
        usize::try_from(longest)
            .unwrap_or(usize::MAX)
            .saturating_add(4 + MAX_CHUNK_HEADER)
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Number of distinct senders whose chunk has arrived.
    pub fn received(&self) -> usize {
        self.chunks.len()
    }

    /// Number of chunks the transfer needs.
    pub fn expected(&self) -> usize {
        self.assigned.len()
    }

    pub fn is_complete(&self) -> bool {
        self.received() == self.expected()
    }

    /// Senders that have an assignment but no chunk yet, ascending.
    pub fn missing(&self) -> Vec<SenderId> {
        self.assigned
            .keys()
            .filter(|id| !self.chunks.contains_key(id))
            .copied()
            .collect()
    }

    /// Store a chunk after checking it against its assignment.
    pub fn insert(&mut self, chunk: ChunkPayload) -> Result<InsertOutcome, StoreError> {
        let expected = *self
            .assigned
            .get(&chunk.sender_id)
            .ok_or(StoreError::UnexpectedSender(chunk.sender_id))?;

        if chunk.filename != self.filename {
            return Err(StoreError::WrongFile {
                sender_id: chunk.sender_id,
                expected: self.filename.clone(),
                actual: chunk.filename,
            });
        }
        if chunk.range != expected {
            return Err(StoreError::RangeMismatch {
                sender_id: chunk.sender_id,
                expected,
                actual: chunk.range,
            });
        }

        match self.chunks.insert(chunk.sender_id, chunk.data) {
            Some(_) => Ok(InsertOutcome::Replaced),
            None => Ok(InsertOutcome::New),
        }
    }

    /// Concatenate every chunk in file order.
    pub fn assemble(&self) -> Result<Vec<u8>, AssemblyError> {
        let missing = self.missing();
        if !missing.is_empty() {
            return Err(AssemblyError::Incomplete(missing));
        }

        let mut ordered: Vec<(&SenderId, &ByteRange)> = self.assigned.iter().collect();
        ordered.sort_by_key(|(id, range)| (range.start, range.end, **id));

        let mut out = Vec::with_capacity(self.file_size as usize);
        let mut cursor = 0u64;
        for (id, range) in ordered {
            if range.start != cursor {
                return Err(AssemblyError::Discontiguous(cursor));
            }
            if let Some(data) = self.chunks.get(id) {
                out.extend_from_slice(data);
            }
            cursor = range.end;
        }
        if cursor != self.file_size {
            return Err(AssemblyError::Discontiguous(cursor));
        }
        Ok(out)
    }

    /// Assemble and write to `output_dir/<filename>`, creating the directory.
    pub async fn write_to(&self, output_dir: &Path) -> Result<PathBuf> {
        let data = self.assemble()?;

        tokio::fs::create_dir_all(output_dir)
            .await
            .with_context(|| format!("failed to create output dir: {}", output_dir.display()))?;

        let output_path = output_dir.join(&self.filename);
        tokio::fs::write(&output_path, &data)
            .await
            .with_context(|| format!("failed to write {}", output_path.display()))?;

        tracing::info!(
            filename = %self.filename,
            bytes = data.len(),
            chunks = self.chunks.len(),
            path = %output_path.display(),
            "file assembled"
        );

        Ok(output_path)
    }
}
