//! Reassembles notification chunks into complete adapter replies.

use smallvec::SmallVec;

/// Prompt the adapter prints once it is ready for the next command
pub const PROMPT: u8 = b'>';

/// Typical replies fit inline; multi-frame ones spill to the heap.
pub type ReplyBuffer = SmallVec<[u8; 64]>;

#[derive(Debug, Default)]
pub struct ResponseFramer {
    buffer: ReplyBuffer,
}

impl ResponseFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk. Returns the whole reply, prompt included, once the
    /// buffer holds a prompt; the buffer is then empty again.
    pub fn push(&mut self, chunk: &[u8]) -> Option<ReplyBuffer> {
        self.buffer.extend_from_slice(chunk);
        if self.buffer.contains(&PROMPT) {
            Some(std::mem::take(&mut self.buffer))
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
