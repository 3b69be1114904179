//! Incremental decoder for the relay's `text/event-stream` body.

use crate::error::ClientError;

/// Upper bound on one unterminated record.
pub const DEFAULT_MAX_RECORD: usize = 1024 * 1024;

/// Splits a chunked SSE byte stream into the `data` payloads of complete
/// records.
///
/// Records end at a blank line and may span any number of chunks. Comment
/// lines (keep-alives) and fields other than `data` are skipped; a record
/// with several `data` lines yields them joined by `\n`.
#[derive(Debug)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already searched for a record terminator.
    scanned: usize,
    max_record: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_record(DEFAULT_MAX_RECORD)
    }
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_record(max_record: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_record,
        }
    }

    /// Feed one chunk and return every record it completed.
    ///
    /// Fails once more than `max_record` bytes are buffered without a
    /// terminator; the partial record is discarded.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, ClientError> {
        self.buffer.extend(chunk.iter().copied().filter(|b| *b != b'\r'));

        let mut records = Vec::new();
        // Back up one byte so a terminator split across chunks is found.
        while let Some(pos) = find_blank_line(&self.buffer, self.scanned.saturating_sub(1)) {
            let raw: Vec<u8> = self.buffer.drain(..pos + 2).collect();
            self.scanned = 0;
            let text = String::from_utf8_lossy(&raw[..pos]);
            if let Some(data) = parse_record(&text) {
                records.push(data);
            }
        }
        self.scanned = self.buffer.len();

        if self.buffer.len() > self.max_record {
            self.buffer.clear();
            self.scanned = 0;
            return Err(ClientError::RecordTooLarge {
                limit: self.max_record,
            });
        }
        Ok(records)
    }

    /// Bytes held back waiting for the end of a record.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

fn find_blank_line(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| from + pos)
}

/// Collect the `data` field of one record, or `None` if it carried none.
pub fn parse_record(record: &str) -> Option<String> {
    let mut data: Option<String> = None;
    for line in record.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        if field != "data" {
            continue;
        }
        match &mut data {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(value);
            }
            None => data = Some(value.to_string()),
        }
    }
    data
}
