//! Delimited record reader over a byte stream.
//!
//! Records are framed at `\n` outside quoted fields, so a quoted cell may
//! span lines. A quote only opens a field when it is the field's first
//! byte, the same rule the `csv` crate applies, so a stray `"` inside an
//! unquoted cell is literal. Each framed record is then split by the `csv`
//! crate, which handles quoting, doubled quotes and the delimiter.

use bytes::BytesMut;
use futures::StreamExt;

use sluice_storage::{ByteStream, StorageError};

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawRecord {
    Row(Vec<String>),
    /// An empty line.
    Blank,
    /// A record the parser could not split (bad quoting, invalid UTF-8).
    Malformed { record: u64, reason: String },
}

/// Framing state at the current scan position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    FieldStart,
    Unquoted,
    Quoted,
    /// A quote seen inside a quoted field: either the closing quote or the
    /// first half of an escaped `""`.
    QuoteInQuoted,
}

pub struct RecordReader {
    stream: ByteStream,
    buf: BytesMut,
    /// Bytes of `buf` already scanned for a terminator.
    scanned: usize,
    scan: Scan,
    bom_checked: bool,
    delimiter: u8,
    records: u64,
    eof: bool,
}

impl RecordReader {
    pub fn new(stream: ByteStream, delimiter: u8) -> Self {
        Self {
            stream,
            buf: BytesMut::new(),
            scanned: 0,
            scan: Scan::FieldStart,
            bom_checked: false,
            delimiter,
            records: 0,
            eof: false,
        }
    }

    /// Records framed so far, blank ones included.
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Next record, or `None` at end of stream.
    pub async fn next_record(&mut self) -> Result<Option<RawRecord>, StorageError> {
        loop {
            if self.bom_checked || self.strip_bom() {
                if let Some(frame) = self.take_frame() {
                    return Ok(Some(self.parse(&frame)));
                }
                if self.eof {
                    if self.buf.is_empty() {
                        return Ok(None);
                    }
                    let frame = self.buf.split();
                    self.scanned = 0;
                    self.scan = Scan::FieldStart;
                    return Ok(Some(self.parse(&frame)));
                }
            }
            match self.stream.next().await {
                Some(Ok(bytes)) => self.buf.extend_from_slice(&bytes),
                Some(Err(e)) => return Err(e),
                None => self.eof = true,
            }
        }
    }

    /// Drop a leading BOM. `false` while too few bytes have arrived to tell.
    fn strip_bom(&mut self) -> bool {
        if !self.eof && self.buf.len() < UTF8_BOM.len() && UTF8_BOM.starts_with(&self.buf) {
            return false;
        }
        if self.buf.starts_with(UTF8_BOM) {
            let _ = self.buf.split_to(UTF8_BOM.len());
        }
        self.bom_checked = true;
        true
    }

    fn take_frame(&mut self) -> Option<BytesMut> {
        for i in self.scanned..self.buf.len() {
            let byte = self.buf[i];
            self.scan = match (self.scan, byte) {
                (Scan::Quoted, b'"') => Scan::QuoteInQuoted,
                (Scan::Quoted, _) => Scan::Quoted,
                (Scan::FieldStart | Scan::QuoteInQuoted, b'"') => Scan::Quoted,
                (_, b'\n') => {
                    self.scan = Scan::FieldStart;
                    self.scanned = 0;
                    return Some(self.buf.split_to(i + 1));
                }
                (_, b) if b == self.delimiter => Scan::FieldStart,
                _ => Scan::Unquoted,
            };
        }
        self.scanned = self.buf.len();
        None
    }

    fn parse(&mut self, frame: &[u8]) -> RawRecord {
        self.records += 1;

        let mut line = frame;
        while let Some((last, rest)) = line.split_last() {
            if *last == b'\n' || *last == b'\r' {
                line = rest;
            } else {
                break;
            }
        }
        if line.is_empty() {
            return RawRecord::Blank;
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .delimiter(self.delimiter)
            .terminator(csv::Terminator::Any(b'\n'))
            .buffer_capacity(line.len().max(64))
            .from_reader(line);
        let mut record = csv::StringRecord::new();
        match reader.read_record(&mut record) {
            Ok(true) => RawRecord::Row(record.iter().map(str::to_string).collect()),
            Ok(false) => RawRecord::Blank,
            Err(e) => RawRecord::Malformed {
                record: self.records,
                reason: e.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::stream;

    fn stream_of(parts: &[&'static [u8]]) -> ByteStream {
        let items: Vec<Result<Bytes, StorageError>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        stream::iter(items).boxed()
    }

    async fn read_all(parts: &[&'static [u8]], delimiter: u8) -> Vec<RawRecord> {
        let mut reader = RecordReader::new(stream_of(parts), delimiter);
        let mut out = Vec::new();
        while let Some(r) = reader.next_record().await.unwrap() {
            out.push(r);
        }
        out
    }

    fn row(cells: &[&str]) -> RawRecord {
        RawRecord::Row(cells.iter().map(|c| c.to_string()).collect())
    }

    #[tokio::test]
    async fn reads_simple_rows() {
        let records = read_all(&[b"a,b\nx,1\ny,2\n"], b',').await;
        assert_eq!(records, vec![row(&["a", "b"]), row(&["x", "1"]), row(&["y", "2"])]);
    }

    #[tokio::test]
    async fn records_split_across_stream_chunks() {
        let records = read_all(&[b"a,", b"b\nx", b",1\r\ny,2"], b',').await;
        assert_eq!(records, vec![row(&["a", "b"]), row(&["x", "1"]), row(&["y", "2"])]);
    }

    #[tokio::test]
    async fn quoted_cells_keep_delimiters_and_newlines() {
        let records = read_all(&[b"a,b\n\"x,\ny\",\"say \"\"hi\"\"\"\n"], b',').await;
        assert_eq!(records[1], row(&["x,\ny", "say \"hi\""]));
    }

    #[tokio::test]
    async fn blank_lines_and_bom() {
        let records = read_all(&[b"\xEF\xBB\xBFa\tb\n\n1\t2\n"], b'\t').await;
        assert_eq!(records, vec![row(&["a", "b"]), RawRecord::Blank, row(&["1", "2"])]);
    }

    #[tokio::test]
    async fn invalid_utf8_is_malformed() {
        let records = read_all(&[b"a,b\n\xFF\xFE,1\nz,3\n"], b',').await;
        assert!(matches!(records[1], RawRecord::Malformed { record: 2, .. }));
        assert_eq!(records[2], row(&["z", "3"]));
    }

    #[tokio::test]
    async fn stray_quote_inside_cell_is_literal() {
        let records = read_all(&[b"a,b\n5\" pipe,1\ny,2\nz,3\n"], b',').await;
        assert_eq!(
            records,
            vec![row(&["a", "b"]), row(&["5\" pipe", "1"]), row(&["y", "2"]), row(&["z", "3"])]
        );
    }

    #[tokio::test]
    async fn text_after_closing_quote_stays_in_record() {
        let records = read_all(&[b"a,b\n\"x\"y,1\nz,\"q\"\"\n\"\n"], b',').await;
        assert_eq!(records, vec![row(&["a", "b"]), row(&["xy", "1"]), row(&["z", "q\"\n"])]);
    }

    #[tokio::test]
    async fn bare_carriage_return_does_not_split_record() {
        let records = read_all(&[b"a,b\nx\ry,1\n"], b',').await;
        assert_eq!(records, vec![row(&["a", "b"]), row(&["x\ry", "1"])]);
    }

    #[tokio::test]
    async fn bom_split_across_stream_chunks() {
        let records = read_all(&[b"\xEF", b"\xBB\xBF\"a\nb\",c\n1,2\n"], b',').await;
        assert_eq!(records, vec![row(&["a\nb", "c"]), row(&["1", "2"])]);
    }

    #[tokio::test]
    async fn stream_error_is_returned() {
        let items: Vec<Result<Bytes, StorageError>> = vec![
            Ok(Bytes::from_static(b"a,b\n")),
            Err(StorageError::Other("connection reset".into())),
        ];
        let mut reader = RecordReader::new(stream::iter(items).boxed(), b',');
        assert_eq!(reader.next_record().await.unwrap(), Some(row(&["a", "b"])));
        assert!(reader.next_record().await.is_err());
    }

    #[tokio::test]
    async fn empty_stream_has_no_records() {
        assert!(read_all(&[], b',').await.is_empty());
    }
}
