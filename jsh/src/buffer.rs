use std::collections::VecDeque;

/// FIFO queue of byte chunks.
///
/// Chunks are appended whole and consumed from the head; `offset` tracks how
/// much of the head chunk has already been handed out.
#[derive(Debug, Default)]
pub struct Buffer {
    chunks: VecDeque<Vec<u8>>,
    size: usize,
    offset: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Buffer::default()
    }

    /// Append a chunk, taking ownership of it.
    pub fn add(&mut self, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        self.size += data.len();
        self.chunks.push_back(data);
    }

    pub fn add_slice(&mut self, data: &[u8]) {
        self.add(data.to_vec());
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Copy up to `dst.len()` bytes into `dst`, consuming them.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let mut read = 0;
        while read < dst.len() {
            let Some(front) = self.chunks.front() else {
                break;
            };
            let available = &front[self.offset..];
            let n = available.len().min(dst.len() - read);
            dst[read..read + n].copy_from_slice(&available[..n]);
            read += n;
            self.offset += n;
            if self.offset == front.len() {
                self.chunks.pop_front();
                self.offset = 0;
            }
        }
        self.size -= read;
        read
    }

    /// Drain everything. A single untouched chunk is returned without copying.
    pub fn read_all(&mut self) -> Vec<u8> {
        if self.chunks.len() == 1 && self.offset == 0 {
            self.size = 0;
            return self.chunks.pop_front().unwrap_or_default();
        }
        let mut data = vec![0; self.size];
        let n = self.read(&mut data);
        data.truncate(n);
        data
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
        self.offset = 0;
    }
}
