//! Fixed-window chunking of a decoded stream.
//!
//! The reader pulls `chunk_bytes` of fresh data at a time and hands out only
//! the prefix made of whole records; the unconsumed tail is carried into the
//! next window. A record longer than a window keeps growing the buffer until
//! it is complete, so no record is ever cut.

use std::io::Read as _;
use std::path::Path;

use memchr::{memchr_iter, memrchr};

use crate::decompress::DecodedInput;
use crate::error::{CountError, Result};

/// Where record boundaries fall in a byte buffer.
pub trait Framing {
    /// Length of the longest prefix of `buf` that holds only whole records.
    fn complete_prefix(&self, buf: &[u8]) -> usize;

    /// Whether a non-empty tail left at end of input is one whole record that
    /// merely lacks its final newline.
    fn accepts_tail(&self, tail: &[u8]) -> bool;
}

/// One record per line (classifier reports).
#[derive(Debug, Clone, Copy, Default)]
pub struct LineFraming;

impl Framing for LineFraming {
    fn complete_prefix(&self, buf: &[u8]) -> usize {
        memrchr(b'\n', buf).map_or(0, |pos| pos + 1)
    }

    fn accepts_tail(&self, _tail: &[u8]) -> bool {
        true
    }
}

/// Four lines per record (FASTQ).
#[derive(Debug, Clone, Copy, Default)]
pub struct FastqFraming;

impl FastqFraming {
    const LINES_PER_RECORD: usize = 4;

    /// Offset of the first line of `buf` that is not blank.
    fn skip_blank_lines(buf: &[u8]) -> usize {
        let mut start = 0;
        for pos in memchr_iter(b'\n', buf) {
            if !buf[start..pos].trim_ascii().is_empty() {
                break;
            }
            start = pos + 1;
        }
        start
    }
}

impl Framing for FastqFraming {
    /// Blank lines between records belong to no record and are not counted.
    fn complete_prefix(&self, buf: &[u8]) -> usize {
        let mut cut = 0;
        let mut start = 0;
        let mut lines = 0;
        for pos in memchr_iter(b'\n', buf) {
            let line = &buf[start..pos];
            start = pos + 1;
            if lines % Self::LINES_PER_RECORD == 0 && line.trim_ascii().is_empty() {
                continue;
            }
            lines += 1;
            if lines % Self::LINES_PER_RECORD == 0 {
                cut = pos + 1;
            }
        }
        cut
    }

    fn accepts_tail(&self, tail: &[u8]) -> bool {
        let tail = &tail[Self::skip_blank_lines(tail)..];
        let newlines = memchr_iter(b'\n', tail).count();
        let last = match memrchr(b'\n', tail) {
            Some(pos) => &tail[pos + 1..],
            None => tail,
        };
        newlines == Self::LINES_PER_RECORD - 1 && !last.trim_ascii().is_empty()
    }
}

/// A run of whole records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub data: Vec<u8>,
    /// 1-based line number of the first line in `data`.
    pub first_line: u64,
}

impl Chunk {
    pub fn lines(&self) -> ChunkLines<'_> {
        ChunkLines {
            rest: &self.data,
            line: self.first_line,
        }
    }
}

/// Lines of a chunk with their line numbers; `\r\n` endings are trimmed.
pub struct ChunkLines<'c> {
    rest: &'c [u8],
    line: u64,
}

impl<'c> Iterator for ChunkLines<'c> {
    type Item = (u64, &'c [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        let (mut line, rest) = match memchr::memchr(b'\n', self.rest) {
            Some(pos) => (&self.rest[..pos], &self.rest[pos + 1..]),
            None => (self.rest, &self.rest[self.rest.len()..]),
        };
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        self.rest = rest;
        let number = self.line;
        self.line += 1;
        Some((number, line))
    }
}

/// Lazy, finite, non-restartable sequence of [`Chunk`]s over one input.
pub struct ChunkReader<'a, F> {
    input: DecodedInput<'a>,
    framing: F,
    chunk_bytes: usize,
    carry: Vec<u8>,
    next_line: u64,
    eof: bool,
}

impl<'a, F: Framing> ChunkReader<'a, F> {
    pub fn new(input: DecodedInput<'a>, framing: F, chunk_bytes: usize) -> Self {
        Self {
            input,
            framing,
            chunk_bytes: chunk_bytes.max(1),
            carry: Vec::new(),
            next_line: 1,
            eof: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.input.path
    }

    /// Appends one window of fresh bytes to `buf`.
    fn fill_window(&mut self, buf: &mut Vec<u8>) -> Result<()> {
        let want = self.chunk_bytes as u64;
        let read = (&mut self.input.reader).take(want).read_to_end(buf);
        let got = read.map_err(|e| self.input.read_error(e))?;
        if (got as u64) < want {
            self.eof = true;
        }
        Ok(())
    }

    fn emit(&mut self, data: Vec<u8>) -> Chunk {
        let chunk = Chunk {
            first_line: self.next_line,
            data,
        };
        self.next_line += memchr_iter(b'\n', &chunk.data).count() as u64;
        chunk
    }

    pub fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        let mut buf = std::mem::take(&mut self.carry);
        loop {
            if !self.eof {
                self.fill_window(&mut buf)?;
            }

            let cut = self.framing.complete_prefix(&buf);
            if cut > 0 {
                self.carry = buf.split_off(cut);
                return Ok(Some(self.emit(buf)));
            }
            if !self.eof {
                // a single record wider than the window
                continue;
            }

            if buf.trim_ascii().is_empty() {
                return Ok(None);
            }
            if self.framing.accepts_tail(&buf) {
                return Ok(Some(self.emit(buf)));
            }
            return Err(CountError::TruncatedInput {
                path: self.input.path.clone(),
                line: self.next_line + memchr_iter(b'\n', &buf).count() as u64,
            });
        }
    }
}

impl<F: Framing> Iterator for ChunkReader<'_, F> {
    type Item = Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => None,
            Err(e) => {
                // nothing sensible follows a failed read
                self.eof = true;
                self.carry.clear();
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decompress::{decode_stream, default_backend};

    fn chunks<F: Framing>(data: &[u8], framing: F, window: usize) -> Result<Vec<Chunk>> {
        let input = decode_stream(Path::new("mem"), data, default_backend())?;
        ChunkReader::new(input, framing, window).collect()
    }

    const FASTQ: &[u8] = b"@r1\nACGT\n+\nIIII\n@r2 extra\nGGCCAA\n+\nIIIIII\n@r3\nTT\n+\nII\n";

    #[test]
    fn test_fastq_prefix_stops_at_record_boundary() {
        let f = FastqFraming;
        assert_eq!(f.complete_prefix(b"@r1\nACGT\n+\nII"), 0);
        assert_eq!(f.complete_prefix(b"@r1\nACGT\n+\nIIII\n@r2\n"), 16);
    }

    #[test]
    fn test_fastq_tail_without_final_newline() {
        let f = FastqFraming;
        assert!(f.accepts_tail(b"@r1\nACGT\n+\nIIII"));
        assert!(!f.accepts_tail(b"@r1\nACGT\n+\n"));
        assert!(!f.accepts_tail(b"@r1\nACGT"));
    }

    #[test]
    fn test_tiny_windows_reassemble_records() {
        let whole = chunks(FASTQ, FastqFraming, 1 << 20).unwrap();
        assert_eq!(whole.len(), 1);
        for window in [1, 3, 7, 16, 17] {
            let parts = chunks(FASTQ, FastqFraming, window).unwrap();
            let joined: Vec<u8> = parts.iter().flat_map(|c| c.data.clone()).collect();
            assert_eq!(joined, FASTQ, "window {window}");
            for c in &parts {
                assert_eq!(memchr_iter(b'\n', &c.data).count() % 4, 0);
            }
        }
    }

    #[test]
    fn test_first_line_numbers_advance() {
        let parts = chunks(FASTQ, FastqFraming, 16).unwrap();
        let firsts: Vec<u64> = parts.iter().map(|c| c.first_line).collect();
        assert_eq!(firsts, vec![1, 5, 9]);
    }

    #[test]
    fn test_fastq_eof_mid_record_is_truncated() {
        let err = chunks(b"@r1\nACGT\n+\nIIII\n@r2\nAC", FastqFraming, 8).unwrap_err();
        match err {
            CountError::TruncatedInput { line, .. } => assert_eq!(line, 6),
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_blank_lines_between_records_are_not_counted() {
        let f = FastqFraming;
        let data = b"@r1\nACGT\n+\nIIII\n\n@r2\nGG\n+\nII\n";
        assert_eq!(f.complete_prefix(data), data.len());
        // a blank line after a whole record is not enough to close the next one
        assert_eq!(f.complete_prefix(b"@r1\nACGT\n+\nIIII\n\n@r2\nGG\n+\n"), 16);
        // inside a record an empty line is an empty sequence or quality
        assert_eq!(f.complete_prefix(b"@r1\n\n+\n\n"), 8);
        assert!(f.accepts_tail(b"\n\n@r3\nAC\n+\nII"));
    }

    #[test]
    fn test_blank_separated_records_survive_tiny_windows() {
        let data = b"@r1\nACGT\n+\nIIII\n\n@r2\nGGCCAA\n+\nIIIIII\n\n\n@r3\nTT\n+\nII";
        for window in [1, 3, 16, 1 << 20] {
            let parts = chunks(data, FastqFraming, window).unwrap();
            let joined: Vec<u8> = parts.iter().flat_map(|c| c.data.clone()).collect();
            assert_eq!(joined, data, "window {window}");
        }
    }

    #[test]
    fn test_trailing_blank_lines_ignored() {
        let parts = chunks(b"@r1\nACGT\n+\nIIII\n\n\n", FastqFraming, 4).unwrap();
        assert_eq!(parts.len(), 1);
    }

    #[test]
    fn test_line_framing_keeps_unterminated_last_line() {
        let parts = chunks(b"a\nbb\nccc", LineFraming, 2).unwrap();
        let lines: Vec<(u64, Vec<u8>)> = parts
            .iter()
            .flat_map(|c| c.lines().map(|(n, l)| (n, l.to_vec())).collect::<Vec<_>>())
            .collect();
        assert_eq!(
            lines,
            vec![(1, b"a".to_vec()), (2, b"bb".to_vec()), (3, b"ccc".to_vec())]
        );
    }

    #[test]
    fn test_crlf_trimmed() {
        let chunk = Chunk {
            data: b"x\r\ny\r\n".to_vec(),
            first_line: 10,
        };
        let lines: Vec<_> = chunk.lines().collect();
        assert_eq!(lines, vec![(10, &b"x"[..]), (11, &b"y"[..])]);
    }

    #[test]
    fn test_empty_input_has_no_chunks() {
        assert!(chunks(b"", LineFraming, 8).unwrap().is_empty());
    }
}
