//! Per-read classifier report parsing.
//!
//! One tab-delimited line per read (or read pair):
//!
//! ```text
//! C   <read_id>   <taxon>   <length>   <lineage>
//! U   <read_id>   0         <length>  [<lineage>]
//! ```
//!
//! `taxon` is a bare id or the `Name (taxid N)` form. `length` is `N` or
//! `N1|N2` for pairs. `lineage` is `rank__name` segments joined by `|`.

use std::path::Path;

use crate::decompress::{open_input, DecompressBackend};
use crate::error::{CountError, Result};
use crate::reader::{Chunk, ChunkLines, ChunkReader, LineFraming};
use crate::types::{Classification, ReportLine};

const TAXID_PREFIX: &str = "(taxid ";

fn parse_u64(path: &Path, line: u64, what: &str, field: &str) -> Result<u64> {
    field
        .trim()
        .parse::<u64>()
        .map_err(|_| CountError::malformed(path, line, format!("{what} '{field}' is not an integer")))
}

fn parse_taxon(path: &Path, line: u64, field: &str) -> Result<u64> {
    if let Some(start) = field.rfind(TAXID_PREFIX) {
        let rest = &field[start + TAXID_PREFIX.len()..];
        let Some(end) = rest.find(')') else {
            return Err(CountError::malformed(
                path,
                line,
                format!("taxon '{field}' has an unclosed '(taxid'"),
            ));
        };
        return parse_u64(path, line, "taxon id", &rest[..end]);
    }
    parse_u64(path, line, "taxon id", field)
}

/// Returns `(summed length, number of mates)`.
fn parse_length(path: &Path, line: u64, field: &str) -> Result<(u64, u64)> {
    let mut total = 0u64;
    let mut parts = 0u64;
    for part in field.split('|') {
        total += parse_u64(path, line, "read length", part)?;
        parts += 1;
    }
    Ok((total, parts))
}

/// Splits `d__Bacteria|g__Escherichia` into rank labels and taxon names.
pub fn split_lineage(field: &str) -> (Vec<String>, Vec<String>) {
    let field = field.trim();
    if field.is_empty() {
        return (Vec::new(), Vec::new());
    }
    field
        .split('|')
        .map(|segment| match segment.split_once("__") {
            Some((rank, name)) => (rank.to_string(), name.to_string()),
            None => (String::new(), segment.to_string()),
        })
        .unzip()
}

/// Parses one report line. Blank lines yield `None`.
pub fn parse_report_line(path: &Path, line_no: u64, line: &[u8]) -> Result<Option<ReportLine>> {
    if line.trim_ascii().is_empty() {
        return Ok(None);
    }
    let line = std::str::from_utf8(line)
        .map_err(|_| CountError::malformed(path, line_no, "report line is not UTF-8"))?;
    let fields: Vec<&str> = line.split('\t').collect();

    match fields[0] {
        "C" => {
            if fields.len() != 5 {
                return Err(CountError::malformed(
                    path,
                    line_no,
                    format!("classified line has {} fields, expected 5", fields.len()),
                ));
            }
            let read_id = fields[1].trim();
            if read_id.is_empty() {
                return Err(CountError::malformed(path, line_no, "empty read identifier"));
            }
            let taxon_id = parse_taxon(path, line_no, fields[2])?;
            let (read_length, total_reads) = parse_length(path, line_no, fields[3])?;
            let (rank_path, taxon_path) = split_lineage(fields[4]);
            Ok(Some(ReportLine::Classified(Classification {
                read_id: read_id.to_string(),
                taxon_id,
                rank_path,
                taxon_path,
                total_reads,
                read_length,
            })))
        }
        "U" => {
            if fields.len() != 4 && fields.len() != 5 {
                return Err(CountError::malformed(
                    path,
                    line_no,
                    format!("unclassified line has {} fields, expected 4 or 5", fields.len()),
                ));
            }
            Ok(Some(ReportLine::Unclassified {
                read_id: fields[1].trim().to_string(),
            }))
        }
        other => Err(CountError::malformed(
            path,
            line_no,
            format!("unknown classification flag '{other}'"),
        )),
    }
}

/// Report lines of one chunk, tagged with their line numbers.
pub struct ReportLines<'c> {
    path: &'c Path,
    lines: ChunkLines<'c>,
}

impl<'c> ReportLines<'c> {
    pub fn new(path: &'c Path, chunk: &'c Chunk) -> Self {
        Self {
            path,
            lines: chunk.lines(),
        }
    }
}

impl Iterator for ReportLines<'_> {
    type Item = Result<(u64, ReportLine)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (line_no, line) = self.lines.next()?;
            match parse_report_line(self.path, line_no, line) {
                Ok(Some(parsed)) => return Some(Ok((line_no, parsed))),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

/// Streams every parsed line of a report file into `on_line` together with
/// its line number. Returns the number of malformed lines skipped under
/// `lenient`.
pub fn stream_report<F>(
    path: &Path,
    chunk_bytes: usize,
    lenient: bool,
    backend: &dyn DecompressBackend,
    mut on_line: F,
) -> Result<u64>
where
    F: FnMut(u64, ReportLine) -> Result<()>,
{
    let input = open_input(path, backend)?;
    let mut skipped = 0u64;

    for chunk in ChunkReader::new(input, LineFraming, chunk_bytes) {
        let chunk = chunk?;
        for line in ReportLines::new(path, &chunk) {
            match line {
                Ok((line_no, parsed)) => on_line(line_no, parsed)?,
                Err(e) if lenient && e.is_skippable() => {
                    log::warn!("skipping report line: {e}");
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    Ok(skipped)
}
