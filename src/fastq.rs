use std::path::Path;

use crate::config::Mate;
use crate::decompress::{open_input, DecompressBackend};
use crate::error::{CountError, Result};
use crate::reader::{Chunk, ChunkLines, ChunkReader, FastqFraming};
use crate::types::Read;

/// FASTQ records of one chunk, parsed lazily.
///
/// Every attempt consumes exactly four lines, so after a malformed record the
/// iterator is positioned at the next record and a lenient caller can keep
/// going.
pub struct FastqRecords<'c> {
    path: &'c Path,
    lines: ChunkLines<'c>,
}

impl<'c> FastqRecords<'c> {
    pub fn new(path: &'c Path, chunk: &'c Chunk) -> Self {
        Self {
            path,
            lines: chunk.lines(),
        }
    }

    fn parse_record(&mut self, header_no: u64, header: &[u8]) -> Result<Read> {
        let path = self.path;
        let seq = self.lines.next();
        let sep = self.lines.next();
        let qual = self.lines.next();

        let Some(header_str) = header.strip_prefix(b"@") else {
            return Err(CountError::malformed(
                path,
                header_no,
                "record header does not start with '@'",
            ));
        };
        if !header_str.is_ascii() {
            return Err(CountError::malformed(path, header_no, "record header is not ASCII"));
        }
        let header_str = std::str::from_utf8(header_str)
            .map_err(|_| CountError::malformed(path, header_no, "record header is not ASCII"))?;
        let id = header_str
            .split(|c: char| c == ' ' || c == '\t')
            .next()
            .unwrap_or("");
        if id.is_empty() {
            return Err(CountError::malformed(path, header_no, "empty read identifier"));
        }

        let Some((seq_no, seq)) = seq else {
            return Err(CountError::malformed(
                path,
                header_no + 1,
                "unexpected end of input: missing sequence line",
            ));
        };
        let Some((sep_no, sep)) = sep else {
            return Err(CountError::malformed(
                path,
                seq_no + 1,
                "unexpected end of input: missing '+' separator",
            ));
        };
        if !seq.is_ascii() {
            return Err(CountError::malformed(path, seq_no, "sequence line is not ASCII"));
        }
        if !sep.starts_with(b"+") {
            return Err(CountError::malformed(
                path,
                sep_no,
                "separator line does not start with '+'",
            ));
        }
        let Some((qual_no, qual)) = qual else {
            return Err(CountError::malformed(
                path,
                sep_no + 1,
                "unexpected end of input: missing quality line",
            ));
        };
        if qual.len() != seq.len() {
            return Err(CountError::malformed(
                path,
                qual_no,
                format!(
                    "quality length {} differs from sequence length {}",
                    qual.len(),
                    seq.len()
                ),
            ));
        }

        Ok(Read {
            id: id.to_string(),
            header: header_str.to_string(),
            sequence: seq.to_vec(),
            quality: qual.to_vec(),
        })
    }
}

impl Iterator for FastqRecords<'_> {
    /// The header line number and the parsed record.
    type Item = Result<(u64, Read)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (header_no, header) = self.lines.next()?;
            // blank lines between records
            if header.trim_ascii().is_empty() {
                continue;
            }
            return Some(self.parse_record(header_no, header).map(|read| (header_no, read)));
        }
    }
}

/// Pull-based reader over one FASTQ file, one item per record attempt.
///
/// A chunk is parsed as a whole when the previous one runs out. After a read
/// failure the reader yields that error and then ends.
pub struct FastqReader {
    chunks: ChunkReader<'static, FastqFraming>,
    pending: std::vec::IntoIter<Result<(u64, Read)>>,
}

impl FastqReader {
    pub fn open(path: &Path, chunk_bytes: usize, backend: &dyn DecompressBackend) -> Result<Self> {
        let input = open_input(path, backend)?;
        Ok(Self {
            chunks: ChunkReader::new(input, FastqFraming, chunk_bytes),
            pending: Vec::new().into_iter(),
        })
    }
}

impl Iterator for FastqReader {
    type Item = Result<(u64, Read)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.pending.next() {
                return Some(item);
            }
            let chunk = match self.chunks.next()? {
                Ok(chunk) => chunk,
                Err(e) => return Some(Err(e)),
            };
            let records: Vec<_> = FastqRecords::new(self.chunks.path(), &chunk).collect();
            self.pending = records.into_iter();
        }
    }
}

/// Streams every read of a FASTQ file (plain or gzip/bgzip) into `on_read`,
/// in file order.
///
/// With `lenient`, malformed records are skipped with a warning; the number
/// skipped is returned.
pub fn stream_fastq<F>(
    path: &Path,
    chunk_bytes: usize,
    lenient: bool,
    backend: &dyn DecompressBackend,
    mut on_read: F,
) -> Result<u64>
where
    F: FnMut(Read) -> Result<()>,
{
    let mut skipped = 0u64;
    for record in FastqReader::open(path, chunk_bytes, backend)? {
        match record {
            Ok((_, read)) => on_read(read)?,
            Err(e) if lenient && e.is_skippable() => {
                log::warn!("skipping record: {e}");
                skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(skipped)
}

/// Read id with a trailing `/1` or `/2` mate marker removed.
fn mate_base(id: &str) -> &str {
    id.strip_suffix("/1")
        .or_else(|| id.strip_suffix("/2"))
        .unwrap_or(id)
}

/// Streams the mates of two FASTQ files in lockstep. Each pair reaches
/// `on_pair` as one [`Read`]: the id both mates share (without `/1`, `/2`
/// markers) with the header and sequence of `tag_mate`.
///
/// Mates with different ids, or one file ending before the other, fail the
/// call. With `lenient`, a pair where either mate is malformed is skipped as a
/// whole; the number of skipped pairs is returned.
pub fn stream_fastq_pairs<F>(
    paths: (&Path, &Path),
    chunk_bytes: usize,
    lenient: bool,
    tag_mate: Mate,
    backend: &dyn DecompressBackend,
    mut on_pair: F,
) -> Result<u64>
where
    F: FnMut(Read) -> Result<()>,
{
    let mut read1 = FastqReader::open(paths.0, chunk_bytes, backend)?;
    let mut read2 = FastqReader::open(paths.1, chunk_bytes, backend)?;
    let unpaired = |detail: String| CountError::UnpairedMates {
        read1: paths.0.to_path_buf(),
        read2: paths.1.to_path_buf(),
        detail,
    };
    let mut skipped = 0u64;

    loop {
        let (a, b) = match (read1.next(), read2.next()) {
            (None, None) => break,
            (Some(Ok((line, _))), None) => {
                return Err(unpaired(format!("read2 ended before the read1 record at line {line}")))
            }
            (None, Some(Ok((line, _)))) => {
                return Err(unpaired(format!("read1 ended before the read2 record at line {line}")))
            }
            (Some(Err(e)), None) | (None, Some(Err(e))) => return Err(e),
            (Some(a), Some(b)) => (a, b),
        };
        let (line, mate1, mate2) = match (a, b) {
            (Ok((line, mate1)), Ok((_, mate2))) => (line, mate1, mate2),
            (Err(e1), Err(e2)) if e1.is_skippable() && !e2.is_skippable() => return Err(e2),
            (Err(e), _) | (_, Err(e)) if lenient && e.is_skippable() => {
                log::warn!("skipping pair: {e}");
                skipped += 1;
                continue;
            }
            (Err(e), _) | (_, Err(e)) => return Err(e),
        };

        let id = mate_base(&mate1.id);
        if id != mate_base(&mate2.id) {
            return Err(unpaired(format!(
                "record at line {line}: read1 '{}' vs read2 '{}'",
                mate1.id, mate2.id
            )));
        }
        let id = id.to_string();
        let mut pair = match tag_mate {
            Mate::Read1 => mate1,
            Mate::Read2 => mate2,
        };
        pair.id = id;
        on_pair(pair)?;
    }

    Ok(skipped)
}
