//! Connection-lifetime receive buffer.
//!
//! A single byte region owned for the whole connection, holding bytes
//! prefetched from the stream but not yet consumed by the receive engine.
//! The live region is `[offset, offset + count)`; refilling first shifts it
//! down to offset 0 so header reads always fit contiguously.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{frame::MAX_HEADER_SIZE, Result, WebSocketError};

pub(crate) struct ReceiveBuffer {
    data: Box<[u8]>,
    offset: usize,
    count: usize,
}

impl ReceiveBuffer {
    /// Allocates a buffer of `size` bytes, raised to [`MAX_HEADER_SIZE`] so
    /// any frame header fits.
    pub(crate) fn new(size: usize) -> Self {
        Self {
            data: vec![0; size.max(MAX_HEADER_SIZE)].into_boxed_slice(),
            offset: 0,
            count: 0,
        }
    }

    /// Wraps a caller-supplied buffer, used exactly (no sub-range). The
    /// caller has already validated its length.
    pub(crate) fn from_external(data: Box<[u8]>) -> Self {
        debug_assert!(data.len() >= MAX_HEADER_SIZE);
        Self {
            data,
            offset: 0,
            count: 0,
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    /// Buffered bytes not yet consumed.
    pub(crate) fn available(&self) -> &[u8] {
        &self.data[self.offset..self.offset + self.count]
    }

    /// Mutable view of the buffered bytes, for in-place unmasking before the
    /// copy to the caller.
    pub(crate) fn available_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.offset..self.offset + self.count]
    }

    /// Marks `n` buffered bytes as consumed.
    pub(crate) fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.count);
        self.offset += n;
        self.count -= n;
        if self.count == 0 {
            self.offset = 0;
        }
    }

    /// Ensures at least `min` bytes are buffered, reading from `stream` as
    /// needed. `min` never exceeds the capacity (headers are the largest
    /// prefetch).
    ///
    /// Returns `Ok(false)` only when `allow_graceful_eof` is set and the
    /// stream ended cleanly with nothing buffered — the message-boundary
    /// case during header prefetch. End-of-stream anywhere else is
    /// [`WebSocketError::ConnectionClosedPrematurely`].
    pub(crate) async fn ensure_at_least<S>(
        &mut self,
        stream: &mut S,
        min: usize,
        allow_graceful_eof: bool,
    ) -> Result<bool>
    where
        S: AsyncRead + Unpin,
    {
        if self.count >= min {
            return Ok(true);
        }
        debug_assert!(min <= self.data.len());

        // Shift the live region down so the tail is contiguous free space.
        if self.offset > 0 {
            self.data.copy_within(self.offset..self.offset + self.count, 0);
            self.offset = 0;
        }

        while self.count < min {
            let n = stream.read(&mut self.data[self.count..]).await?;
            if n == 0 {
                if allow_graceful_eof && self.count == 0 {
                    return Ok(false);
                }
                return Err(WebSocketError::ConnectionClosedPrematurely);
            }
            self.count += n;
        }

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_ensure_reads_until_minimum() {
        let (mut near, mut far) = tokio::io::duplex(64);
        far.write_all(&[1, 2, 3, 4, 5]).await.unwrap();

        let mut buf = ReceiveBuffer::new(16);
        assert!(buf.ensure_at_least(&mut near, 2, false).await.unwrap());
        assert!(buf.count() >= 2);
        assert_eq!(&buf.available()[..2], &[1, 2]);
    }

    #[tokio::test]
    async fn test_consume_and_compact() {
        let (mut near, mut far) = tokio::io::duplex(64);
        far.write_all(&[1, 2, 3, 4, 5, 6, 7, 8]).await.unwrap();

        let mut buf = ReceiveBuffer::new(16);
        assert!(buf.ensure_at_least(&mut near, 8, false).await.unwrap());
        buf.consume(6);
        assert_eq!(buf.available(), &[7, 8]);

        // The next refill shifts [7, 8] to the front before reading.
        far.write_all(&[9, 10, 11, 12]).await.unwrap();
        assert!(buf.ensure_at_least(&mut near, 5, false).await.unwrap());
        assert_eq!(&buf.available()[..5], &[7, 8, 9, 10, 11]);
    }

    #[tokio::test]
    async fn test_graceful_eof_at_boundary() {
        let (mut near, far) = tokio::io::duplex(64);
        drop(far);

        let mut buf = ReceiveBuffer::new(16);
        assert!(!buf.ensure_at_least(&mut near, 2, true).await.unwrap());
    }

    #[tokio::test]
    async fn test_eof_mid_prefetch_is_premature() {
        let (mut near, mut far) = tokio::io::duplex(64);
        far.write_all(&[0x81]).await.unwrap();
        drop(far);

        let mut buf = ReceiveBuffer::new(16);
        // One byte buffered: even the graceful flag does not forgive EOF here.
        let err = buf.ensure_at_least(&mut near, 2, true).await.unwrap_err();
        assert!(matches!(err, WebSocketError::ConnectionClosedPrematurely));
    }

    #[tokio::test]
    async fn test_eof_without_graceful_flag() {
        let (mut near, far) = tokio::io::duplex(64);
        drop(far);

        let mut buf = ReceiveBuffer::new(16);
        let err = buf.ensure_at_least(&mut near, 1, false).await.unwrap_err();
        assert!(matches!(err, WebSocketError::ConnectionClosedPrematurely));
    }

    #[tokio::test]
    async fn test_minimum_capacity_fits_any_header() {
        let buf = ReceiveBuffer::new(1);
        assert!(buf.data.len() >= MAX_HEADER_SIZE);
    }
}
