//! Chunked writes for payloads larger than one attribute write.
//!
//! A single write carries at most `mtu - ATT_WRITE_HEADER_LEN` bytes. Larger
//! payloads are split into consecutive chunks which are written strictly in
//! offset order, each one only after the previous chunk's completion has been
//! observed. The first failing chunk aborts the rest; the caller must redo the
//! whole write.

use std::future::Future;

use bytes::Bytes;
use tracing::{debug, warn};

use gattlink_types::ATT_WRITE_HEADER_LEN;

use crate::error::{Error, Result};

/// Payload bytes that fit in one write at the given MTU.
///
/// Never less than one byte, so a degenerate MTU still makes progress.
pub fn usable_chunk_size(mtu: u16) -> usize {
    usize::from(mtu)
        .saturating_sub(ATT_WRITE_HEADER_LEN)
        .max(1)
}

/// One planned write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position in the sequence.
    pub index: usize,
    /// Total number of chunks in the sequence.
    pub count: usize,
    /// Byte offset of this chunk in the payload.
    pub offset: usize,
    /// Length of this chunk.
    pub len: usize,
}

impl Chunk {
    pub fn is_last(&self) -> bool {
        self.index + 1 == self.count
    }
}

/// Split `len` payload bytes into chunks of at most `chunk_size`.
///
/// Returns `ceil(len / chunk_size)` chunks with offsets ascending by
/// `chunk_size`. An empty payload still produces one empty chunk, so a
/// zero-length write reaches the peer.
pub fn plan_chunks(len: usize, chunk_size: usize) -> Vec<Chunk> {
    let chunk_size = chunk_size.max(1);
    let count = len.div_ceil(chunk_size).max(1);
    (0..count)
        .map(|index| {
            let offset = index * chunk_size;
            Chunk {
                index,
                count,
                offset,
                len: chunk_size.min(len - offset.min(len)),
            }
        })
        .collect()
}

/// Summary of a completed chunked write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkedWriteReport {
    /// Number of writes issued.
    pub chunks: usize,
    /// Total payload bytes written.
    pub bytes: usize,
    /// Chunk size used.
    pub chunk_size: usize,
}

/// Drives the chunks of one payload through a single-outstanding write slot.
#[derive(Debug, Clone, Copy)]
pub struct ChunkedWriteEngine {
    chunk_size: usize,
}

impl ChunkedWriteEngine {
    /// Engine for a link with the given negotiated MTU.
    pub fn for_mtu(mtu: u16) -> Self {
        Self {
            chunk_size: usable_chunk_size(mtu),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Whether `len` bytes need more than one write.
    pub fn needs_chunking(&self, len: usize) -> bool {
        len > self.chunk_size
    }

    pub fn plan(&self, len: usize) -> Vec<Chunk> {
        plan_chunks(len, self.chunk_size)
    }

    /// Write `payload` chunk by chunk using `write_chunk`.
    ///
    /// `write_chunk` must not return until the peer has acknowledged the
    /// chunk. On the first failure the remaining chunks are not issued and
    /// the failure is wrapped in [`Error::ChunkedWrite`].
    pub async fn write<F, Fut>(&self, payload: Bytes, mut write_chunk: F) -> Result<ChunkedWriteReport>
    where
        F: FnMut(Chunk, Bytes) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let plan = self.plan(payload.len());
        let chunks = plan.len();
        debug!(
            bytes = payload.len(),
            chunks,
            chunk_size = self.chunk_size,
            "Starting chunked write"
        );

        for chunk in plan {
            let data = payload.slice(chunk.offset..chunk.offset + chunk.len);
            if let Err(e) = write_chunk(chunk, data).await {
                warn!(
                    chunk = chunk.index + 1,
                    chunks,
                    offset = chunk.offset,
                    error = %e,
                    "Chunked write aborted"
                );
                return Err(Error::ChunkedWrite {
                    chunk: chunk.index + 1,
                    chunks,
                    offset: chunk.offset,
                    source: Box::new(e),
                });
            }
        }

        Ok(ChunkedWriteReport {
            chunks,
            bytes: payload.len(),
            chunk_size: self.chunk_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gattlink_types::GattStatus;

    use crate::operation::OperationKind;

    #[test]
    fn test_usable_chunk_size() {
        assert_eq!(usable_chunk_size(23), 20);
        assert_eq!(usable_chunk_size(185), 182);
        assert_eq!(usable_chunk_size(517), 514);
        assert_eq!(usable_chunk_size(2), 1);
    }

    #[test]
    fn test_plan_600_bytes_at_mtu_185() {
        let plan = ChunkedWriteEngine::for_mtu(185).plan(600);
        let offsets: Vec<usize> = plan.iter().map(|c| c.offset).collect();
        assert_eq!(offsets, vec![0, 182, 364, 546]);
        assert_eq!(plan[3].len, 54);
        assert!(plan[3].is_last());
    }

    #[test]
    fn test_plan_empty_payload() {
        let plan = plan_chunks(0, 20);
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].len, 0);
    }

    #[tokio::test]
    async fn test_write_issues_chunks_in_order() {
        let engine = ChunkedWriteEngine::for_mtu(185);
        let payload: Bytes = (0..600u32).map(|i| i as u8).collect::<Vec<_>>().into();

        let mut seen = Vec::new();
        let report = engine
            .write(payload.clone(), |chunk, data| {
                seen.push((chunk.offset, data));
                async { Ok(()) }
            })
            .await
            .unwrap();

        assert_eq!(report.chunks, 4);
        assert_eq!(report.bytes, 600);
        let joined: Vec<u8> = seen.iter().flat_map(|(_, d)| d.iter().copied()).collect();
        assert_eq!(joined, payload.to_vec());
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_chunks() {
        let engine = ChunkedWriteEngine::for_mtu(23);
        let mut issued = Vec::new();

        let err = engine
            .write(Bytes::from(vec![0u8; 100]), |chunk, _| {
                issued.push(chunk.index);
                let fail = chunk.index == 1;
                async move {
                    if fail {
                        Err(Error::operation(
                            OperationKind::WriteCharacteristic,
                            None,
                            GattStatus::WRITE_NOT_PERMITTED,
                        ))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap_err();

        assert_eq!(issued, vec![0, 1]);
        match err {
            Error::ChunkedWrite {
                chunk,
                chunks,
                offset,
                ..
            } => {
                assert_eq!(chunk, 2);
                assert_eq!(chunks, 5);
                assert_eq!(offset, 20);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn plan_covers_payload_exactly(len in 1usize..4096, mtu in 23u16..=517) {
            let size = usable_chunk_size(mtu);
            let plan = plan_chunks(len, size);

            prop_assert_eq!(plan.len(), len.div_ceil(size));
            prop_assert_eq!(plan.iter().map(|c| c.len).sum::<usize>(), len);

            for (i, chunk) in plan.iter().enumerate() {
                prop_assert_eq!(chunk.index, i);
                prop_assert_eq!(chunk.offset, i * size);
                prop_assert!(chunk.len <= size);
                prop_assert!(chunk.len > 0);
            }
        }
    }
}
