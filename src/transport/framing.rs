//! Terminator-delimited stream framing
//!
//! Bytes arrive in arbitrary chunks. `FrameBuffer` accumulates them and yields
//! every complete segment (terminator excluded) in arrival order, keeping any
//! trailing partial segment for the next read. A peer that never sends the
//! terminator overflows the buffer instead of growing it without bound.

use thiserror::Error;

/// Unterminated bytes held before the stream is considered foreign
pub const MAX_PENDING_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{pending} bytes without a message terminator (limit {limit})")]
pub struct FrameOverflow {
    pub pending: usize,
    pub limit: usize,
}

/// Accumulation buffer for one connection's inbound byte stream.
#[derive(Debug)]
pub struct FrameBuffer {
    terminator: &'static [u8],
    buf: Vec<u8>,
    limit: usize,
}

impl FrameBuffer {
    pub fn new(terminator: &'static [u8]) -> Self {
        Self::with_limit(terminator, MAX_PENDING_BYTES)
    }

    pub fn with_limit(terminator: &'static [u8], limit: usize) -> Self {
        debug_assert!(!terminator.is_empty(), "terminator must not be empty");
        Self {
            terminator,
            buf: Vec::with_capacity(1024),
            limit,
        }
    }

    /// Append a chunk and drain every complete frame it finishes.
    ///
    /// Fails once the retained partial segment exceeds the limit; the buffer
    /// is unusable afterwards.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Vec<u8>>, FrameOverflow> {
        self.buf.extend_from_slice(chunk);

        let mut frames = Vec::new();
        let mut start = 0;
        while let Some(pos) = find(&self.buf[start..], self.terminator) {
            frames.push(self.buf[start..start + pos].to_vec());
            start += pos + self.terminator.len();
        }
        self.buf.drain(..start);

        if self.buf.len() > self.limit {
            return Err(FrameOverflow {
                pending: self.buf.len(),
                limit: self.limit,
            });
        }
        Ok(frames)
    }

    /// Bytes held back waiting for a terminator.
    pub fn pending(&self) -> &[u8] {
        &self.buf
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_multiple_frames_in_one_chunk() {
        let mut fb = FrameBuffer::new(b"\r\n");
        let frames = fb.push(b"{\"id\":1}\r\n{\"id\":2}\r\n").unwrap();
        assert_eq!(frames, vec![b"{\"id\":1}".to_vec(), b"{\"id\":2}".to_vec()]);
        assert!(fb.pending().is_empty());
    }

    #[test]
    fn retains_trailing_partial_segment() {
        let mut fb = FrameBuffer::new(b"\r\n");
        assert!(fb.push(b"{\"id\":1,").unwrap().is_empty());
        assert_eq!(fb.pending(), b"{\"id\":1,");

        let frames = fb.push(b"\"result\":\"OK\"}\r\n{\"id\"").unwrap();
        assert_eq!(frames, vec![b"{\"id\":1,\"result\":\"OK\"}".to_vec()]);
        assert_eq!(fb.pending(), b"{\"id\"");
    }

    #[test]
    fn terminator_split_across_reads() {
        let mut fb = FrameBuffer::new(b"\r\n");
        assert!(fb.push(b"OK\r").unwrap().is_empty());
        assert_eq!(fb.push(b"\nERR\r\n").unwrap(), vec![b"OK".to_vec(), b"ERR".to_vec()]);
    }

    #[test]
    fn empty_segments_are_emitted() {
        // Back-to-back terminators still delimit a (blank) message
        let mut fb = FrameBuffer::new(b"\r");
        assert_eq!(fb.push(b"a\r\rb\r").unwrap(), vec![b"a".to_vec(), vec![], b"b".to_vec()]);
    }

    #[test]
    fn byte_at_a_time_preserves_order() {
        let mut fb = FrameBuffer::new(b"\r\n");
        let mut frames = Vec::new();
        for byte in b"one\r\ntwo\r\nthree\r\n" {
            frames.extend(fb.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(
            frames,
            vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]
        );
    }

    #[test]
    fn unterminated_stream_overflows_at_limit() {
        let mut fb = FrameBuffer::with_limit(b"\r", 8);
        assert_eq!(fb.push(b"OK\r12345678").unwrap(), vec![b"OK".to_vec()]);
        assert_eq!(fb.pending().len(), 8);

        let err = fb.push(b"9").unwrap_err();
        assert_eq!(err, FrameOverflow { pending: 9, limit: 8 });
    }

    #[test]
    fn completed_frames_release_their_bytes() {
        // Long traffic is fine as long as messages keep terminating
        let mut fb = FrameBuffer::with_limit(b"\r", 8);
        for _ in 0..100 {
            assert_eq!(fb.push(b"1234567\r").unwrap().len(), 1);
        }
        assert!(fb.pending().is_empty());
    }
}
