//! Content-defined chunking.
//!
//! Chunk boundaries are found with a Rabin-style rolling hash over a sliding
//! window, not the FastCDC polynomial — see [`find_boundaries`] for the
//! exact recurrence.

use async_stream::try_stream;
use bytes::{BufMut, Bytes, BytesMut};
use futures::stream::Stream;
use tokio::io::AsyncRead;

use crate::io::read_chunk_async;

/// Window size of the rolling hash, in bytes.
const WINDOW_SIZE: usize = 48;

/// Multiplier used by the rolling hash recurrence.
const PRIME: u64 = 3;

/// Mask applied to the rolling hash to test for a chunk boundary.
///
/// `(1 << 13) - 1` targets an average chunk size around 4 MiB.
const MODULUS: u64 = (1 << 13) - 1;

/// Finds chunk boundary offsets (exclusive end positions) within `data`.
///
/// Mirrors the reference rolling-hash recurrence: for `i >= WINDOW_SIZE`,
/// the oldest byte is subtracted out (scaled by `PRIME^WINDOW_SIZE`) as the
/// newest byte is folded in; below that the hash just accumulates. A
/// boundary is cut once `i >= min_size` and either the low bits of the hash
/// match `MODULUS`, or the chunk has grown to `max_size` without a natural
/// cut. The final boundary is always `data.len()`.
pub fn find_boundaries(data: &[u8], min_size: usize, max_size: usize) -> Vec<usize> {
    if data.len() < min_size {
        return vec![data.len()];
    }

    let prime_pow_window = PRIME.wrapping_pow(WINDOW_SIZE as u32);

    let mut boundaries = Vec::new();
    let mut hash_val: u64 = 0;

    for (i, &byte) in data.iter().enumerate() {
        if i >= WINDOW_SIZE {
            let dropped = data[i - WINDOW_SIZE] as u64;
            hash_val = hash_val
                .wrapping_mul(PRIME)
                .wrapping_add(byte as u64)
                .wrapping_sub(dropped.wrapping_mul(prime_pow_window));
        } else {
            hash_val = hash_val.wrapping_mul(PRIME).wrapping_add(byte as u64);
        }

        if i >= min_size {
            let last = boundaries.last().copied().unwrap_or(0);
            if (hash_val & MODULUS) == MODULUS {
                boundaries.push(i + 1);
            } else if i - last >= max_size {
                boundaries.push(i + 1);
            }
        }
    }

    if boundaries.last().copied() != Some(data.len()) {
        boundaries.push(data.len());
    }

    boundaries
}

/// Splits a stream into content-defined chunks.
///
/// Reads up to `max_size` bytes at a time, cuts it into sub-chunks with
/// [`find_boundaries`], and carries any leftover unconsumed tail into the
/// next read — the same buffer-refill shape used for FastCDC-backed
/// chunking, just with the bespoke rolling hash in place of that crate.
pub fn chunk_stream<R>(
    mut stream: R,
    min_size: usize,
    avg_size: usize,
    max_size: usize,
) -> impl Stream<Item = std::io::Result<Bytes>>
where
    R: AsyncRead + Unpin + Send,
{
    let _ = avg_size; // folded into MODULUS; kept for API parity with callers

    let s = try_stream! {
        let mut buf = BytesMut::with_capacity(max_size);

        loop {
            let read = read_chunk_async(&mut stream, buf).await?;

            if read.is_empty() {
                break;
            }

            let boundaries = find_boundaries(&read, min_size, max_size);
            let mut consumed = 0;

            for boundary in &boundaries {
                let slice = read.slice(consumed..*boundary);
                consumed = *boundary;
                yield slice;
            }

            let at_eof = read.len() < max_size;
            if at_eof {
                break;
            }

            buf = BytesMut::with_capacity(max_size);
            if consumed < read.len() {
                buf.put_slice(&read[consumed..]);
            }
        }
    };

    Box::pin(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Cursor;

    use futures::StreamExt;

    use crate::testing::get_fake_data;

    #[test]
    fn test_find_boundaries_short_input() {
        let data = vec![0u8; 100];
        let boundaries = find_boundaries(&data, 2 * 1024 * 1024, 8 * 1024 * 1024);
        assert_eq!(boundaries, vec![100]);
    }

    #[test]
    fn test_find_boundaries_forces_max_cut() {
        // Highly compressible input defeats the rolling-hash boundary test
        // (the low bits stay constant), so every cut should land at max_size.
        let data = vec![7u8; 9 * 1024 * 1024];
        let boundaries = find_boundaries(&data, 2 * 1024 * 1024, 4 * 1024 * 1024);
        assert!(boundaries.windows(2).all(|w| w[1] - w[0] <= 4 * 1024 * 1024));
        assert_eq!(*boundaries.last().unwrap(), data.len());
    }

    /// Chunks and reconstructs a file, verifying byte-for-byte fidelity.
    #[tokio::test]
    async fn test_chunking_reconstructs() {
        async fn case(size: usize) {
            let test_file = get_fake_data(size);
            let mut reconstructed_file = Vec::new();

            let cursor = Cursor::new(&test_file);
            let mut chunks = chunk_stream(cursor, 64 * 1024, 128 * 1024, 256 * 1024);

            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.unwrap();
                reconstructed_file.extend(chunk);
            }

            assert_eq!(reconstructed_file, test_file);
        }

        case(1024 * 1024 - 1).await;
        case(1024 * 1024).await;
        case(1024 * 1024 + 1).await;
    }

    #[tokio::test]
    async fn test_chunking_respects_max_size() {
        let test_file = get_fake_data(4 * 1024 * 1024);
        let cursor = Cursor::new(&test_file);
        let mut chunks = chunk_stream(cursor, 64 * 1024, 128 * 1024, 256 * 1024);

        while let Some(chunk) = chunks.next().await {
            let chunk = chunk.unwrap();
            assert!(chunk.len() <= 256 * 1024);
        }
    }
}
