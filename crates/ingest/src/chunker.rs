use std::sync::Arc;

use sluice_core::Record;

/// An immutable, bounded slice of the file handed to one chunk task.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Position in submission order, from 0.
    pub seq: usize,
    pub header: Arc<[String]>,
    pub rows: Vec<Vec<String>>,
}

impl Chunk {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Zip each row with the header. Rows whose width does not match the
    /// header are dropped; the second value is how many.
    pub fn records(&self) -> (Vec<Record>, usize) {
        let mut skipped = 0;
        let records = self
            .rows
            .iter()
            .filter_map(|row| {
                if row.len() != self.header.len() {
                    skipped += 1;
                    return None;
                }
                Some(
                    self.header
                        .iter()
                        .cloned()
                        .zip(row.iter().cloned())
                        .collect::<Record>(),
                )
            })
            .collect();
        (records, skipped)
    }
}

/// Collects rows and cuts a [`Chunk`] every `chunk_size` rows.
pub struct Chunker {
    header: Arc<[String]>,
    chunk_size: usize,
    buffer: Vec<Vec<String>>,
    next_seq: usize,
}

impl Chunker {
    pub fn new(header: Arc<[String]>, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            header,
            chunk_size,
            buffer: Vec::with_capacity(chunk_size),
            next_seq: 0,
        }
    }

    /// Add a row. Returns a chunk when the buffer is full.
    pub fn push(&mut self, row: Vec<String>) -> Option<Chunk> {
        self.buffer.push(row);
        if self.buffer.len() >= self.chunk_size {
            self.cut()
        } else {
            None
        }
    }

    /// The trailing partial chunk, if any rows are buffered.
    pub fn finish(&mut self) -> Option<Chunk> {
        self.cut()
    }

    /// Rows currently buffered.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Chunks cut so far.
    pub fn emitted(&self) -> usize {
        self.next_seq
    }

    fn cut(&mut self) -> Option<Chunk> {
        if self.buffer.is_empty() {
            return None;
        }
        let rows = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.chunk_size));
        let chunk = Chunk {
            seq: self.next_seq,
            header: self.header.clone(),
            rows,
        };
        self.next_seq += 1;
        Some(chunk)
    }
}
