//! Accumulates incoming chunks of arbitrary size and allows reading exact-length byte sequences
//!  across chunk boundaries.
//!
//! If a single buffered chunk satisfies a request, the result shares that chunk's memory (this
//!  is the common case when chunks are aligned with frame boundaries). Only reads that span
//!  several chunks copy into a freshly allocated buffer.

use std::collections::VecDeque;
use anyhow::bail;
use bytes::{BufMut, Bytes, BytesMut};

#[derive(Default)]
pub struct ChunkStream {
    chunks: VecDeque<Bytes>,
    total_len: usize,
}

impl ChunkStream {
    pub fn new() -> ChunkStream {
        Default::default()
    }

    /// total number of buffered bytes
    pub fn len(&self) -> usize {
        self.total_len
    }

    pub fn is_empty(&self) -> bool {
        self.total_len == 0
    }

    pub fn accept_chunk(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        self.total_len += chunk.len();
        self.chunks.push_back(chunk);
    }

    /// Returns exactly `n` bytes from the front, consuming them
    pub fn read(&mut self, n: usize) -> anyhow::Result<Bytes> {
        self.check_available(n)?;

        if n == 0 {
            return Ok(Bytes::new());
        }

        self.total_len -= n;

        let first = self.chunks.front_mut()
            .expect("non-zero total length implies a buffered chunk");
        if first.len() == n {
            return Ok(self.chunks.pop_front()
                .expect("front chunk was just inspected"));
        }
        if first.len() > n {
            return Ok(first.split_to(n));
        }

        let mut result = BytesMut::with_capacity(n);
        while result.len() < n {
            let remaining = n - result.len();
            let chunk = self.chunks.front_mut()
                .expect("total length was checked, so there must be enough chunks");

            if chunk.len() <= remaining {
                result.put_slice(&chunk[..]);
                self.chunks.pop_front();
            }
            else {
                result.put_slice(&chunk.split_to(remaining));
            }
        }
        Ok(result.freeze())
    }

    /// Returns exactly `n` bytes from the front without consuming them
    pub fn peek(&self, n: usize) -> anyhow::Result<Bytes> {
        self.check_available(n)?;

        if n == 0 {
            return Ok(Bytes::new());
        }

        let first = self.chunks.front()
            .expect("non-zero total length implies a buffered chunk");
        if first.len() >= n {
            return Ok(first.slice(..n));
        }

        let mut result = BytesMut::with_capacity(n);
        for chunk in &self.chunks {
            let remaining = n - result.len();
            if chunk.len() >= remaining {
                result.put_slice(&chunk[..remaining]);
                break;
            }
            result.put_slice(chunk);
        }
        Ok(result.freeze())
    }

    /// drains everything that is buffered
    pub fn read_all(&mut self) -> Bytes {
        let n = self.total_len;
        self.read(n)
            .expect("reading the buffered length is always possible")
    }

    fn check_available(&self, n: usize) -> anyhow::Result<()> {
        if n > self.total_len {
            bail!("insufficient data: requested {} bytes, only {} buffered", n, self.total_len);
        }
        Ok(())
    }
}
