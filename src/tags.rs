//! Barcode/UMI tag extraction.
//!
//! All barcode patterns are compiled once per call into one Aho-Corasick
//! automaton, so an exact lookup costs time linear in the searched text no
//! matter how large the whitelist is. The barcode reported for a read is always
//! the whitelist pattern, so reads corrected under a mismatch tolerance land
//! in the same bucket as exact hits. The UMI is the `umi_length` bytes that
//! follow the barcode.
//!
//! Suffix anchoring is an anchored prefix search over the reversed text with
//! an automaton built from reversed patterns.
//!
//! A non-zero tolerance only comes into play when no exact hit exists. The
//! fallback accepts barcodes within that many edits (substitutions, insertions
//! or deletions), so the matched span may be shorter or longer than the
//! pattern; the UMI then starts right after the matched span.

use aho_corasick::{AhoCorasick, Anchored, Input, MatchKind, StartKind};

use crate::config::{AnchorPosition, BarcodeSpec, TagSource};
use crate::error::{CountError, Result};
use crate::types::Read;

/// A resolved tag. `pattern` indexes the barcode pattern list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagMatch<'t> {
    pub pattern: usize,
    pub umi: &'t [u8],
    /// Edit distance between the matched span and the pattern.
    pub edits: usize,
}

pub struct TagExtractor {
    spec: BarcodeSpec,
    automaton: AhoCorasick,
}

impl TagExtractor {
    pub fn new(spec: &BarcodeSpec) -> Result<Self> {
        spec.validate()?;
        let reversed = spec.anchor_position == AnchorPosition::Suffix;
        let patterns: Vec<Vec<u8>> = spec
            .patterns
            .iter()
            .map(|p| {
                let mut bytes = p.as_bytes().to_vec();
                if reversed {
                    bytes.reverse();
                }
                bytes
            })
            .collect();
        let automaton = AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostFirst)
            .start_kind(StartKind::Both)
            .build(&patterns)
            .map_err(|e| CountError::config(format!("cannot compile barcode patterns: {e}")))?;

        log::debug!(
            "compiled {} barcode patterns ({:?} anchor, {} edits allowed)",
            spec.patterns.len(),
            spec.anchor_position,
            spec.mismatch_tolerance
        );
        Ok(Self {
            spec: spec.clone(),
            automaton,
        })
    }

    pub fn pattern(&self, index: usize) -> &str {
        &self.spec.patterns[index]
    }

    /// The text a read's tag is searched in.
    pub fn source<'r>(&self, read: &'r Read) -> &'r [u8] {
        match self.spec.tag_source {
            TagSource::Sequence => &read.sequence,
            TagSource::Header => read.header.as_bytes(),
        }
    }

    /// First tag in `read` under the anchor policy, or `None`.
    ///
    /// `scratch` is reused across calls for the reversed text of suffix
    /// searches.
    pub fn extract<'r>(&self, read: &'r Read, scratch: &mut Vec<u8>) -> Option<TagMatch<'r>> {
        let text = self.source(read);
        if let Some(hit) = self.exact(text, scratch) {
            return Some(hit);
        }
        if self.spec.mismatch_tolerance > 0 {
            return self.approximate(text);
        }
        None
    }

    fn exact<'t>(&self, text: &'t [u8], scratch: &mut Vec<u8>) -> Option<TagMatch<'t>> {
        let umi_len = self.spec.umi_length;
        match self.spec.anchor_position {
            AnchorPosition::Prefix => {
                let m = self
                    .automaton
                    .find(Input::new(text).anchored(Anchored::Yes))?;
                self.with_umi(text, m.pattern().as_usize(), m.end(), 0)
            }
            AnchorPosition::Suffix => {
                let region_end = text.len().checked_sub(umi_len)?;
                scratch.clear();
                scratch.extend(text[..region_end].iter().rev());
                let m = self
                    .automaton
                    .find(Input::new(scratch.as_slice()).anchored(Anchored::Yes))?;
                Some(TagMatch {
                    pattern: m.pattern().as_usize(),
                    umi: &text[region_end..],
                    edits: 0,
                })
            }
            AnchorPosition::Anywhere => {
                let m = self.automaton.find(text)?;
                self.with_umi(text, m.pattern().as_usize(), m.end(), 0)
            }
        }
    }

    fn with_umi<'t>(
        &self,
        text: &'t [u8],
        pattern: usize,
        barcode_end: usize,
        edits: usize,
    ) -> Option<TagMatch<'t>> {
        let umi = text.get(barcode_end..barcode_end + self.spec.umi_length)?;
        Some(TagMatch {
            pattern,
            umi,
            edits,
        })
    }

    /// Start offsets a barcode of length `len` may occupy.
    fn candidate_starts(&self, text_len: usize, len: usize) -> std::ops::Range<usize> {
        let Some(room) = text_len.checked_sub(len + self.spec.umi_length) else {
            return 0..0;
        };
        match self.spec.anchor_position {
            AnchorPosition::Prefix => 0..1,
            AnchorPosition::Suffix => room..room + 1,
            AnchorPosition::Anywhere => 0..room + 1,
        }
    }

    /// Bounded edit-distance search over every span the anchor allows.
    ///
    /// Lowest distance wins, then the earliest start. For one pattern, a span
    /// as long as the pattern is preferred, then the shorter span. Two
    /// different patterns tied on distance and start make the read ambiguous.
    fn approximate<'t>(&self, text: &'t [u8]) -> Option<TagMatch<'t>> {
        let limit = self.spec.mismatch_tolerance;
        let mut rows = EditRows::default();
        let mut best: Option<Candidate> = None;
        let mut ambiguous = false;

        for (pattern, p) in self.spec.patterns.iter().enumerate() {
            let p = p.as_bytes();
            let min_len = p.len().saturating_sub(limit).max(1);
            for len in min_len..=p.len() + limit {
                for start in self.candidate_starts(text.len(), len) {
                    let window = &text[start..start + len];
                    let Some(dist) = rows.distance_within(window, p, limit) else {
                        continue;
                    };
                    let found = Candidate {
                        dist,
                        start,
                        len,
                        pattern,
                        stretch: len.abs_diff(p.len()),
                    };
                    match best {
                        None => best = Some(found),
                        Some(b) if (found.dist, found.start) < (b.dist, b.start) => {
                            ambiguous = false;
                            best = Some(found);
                        }
                        Some(b) if (found.dist, found.start) == (b.dist, b.start) => {
                            if found.pattern != b.pattern {
                                ambiguous = true;
                            } else if (found.stretch, found.len) < (b.stretch, b.len) {
                                best = Some(found);
                            }
                        }
                        Some(_) => {}
                    }
                }
            }
        }

        let best = best?;
        if ambiguous {
            return None;
        }
        self.with_umi(text, best.pattern, best.start + best.len, best.dist)
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    dist: usize,
    start: usize,
    len: usize,
    pattern: usize,
    /// How far the span length is from the pattern length.
    stretch: usize,
}

/// Two reusable rows of the Levenshtein table.
#[derive(Debug, Default)]
struct EditRows {
    prev: Vec<usize>,
    cur: Vec<usize>,
}

impl EditRows {
    /// Levenshtein distance of `a` and `b` if it is at most `limit`. Gives up
    /// as soon as a whole row exceeds the limit.
    fn distance_within(&mut self, a: &[u8], b: &[u8], limit: usize) -> Option<usize> {
        if a.len().abs_diff(b.len()) > limit {
            return None;
        }
        self.prev.clear();
        self.prev.extend(0..=b.len());
        self.cur.clear();
        self.cur.resize(b.len() + 1, 0);

        for (i, &x) in a.iter().enumerate() {
            self.cur[0] = i + 1;
            let mut row_min = self.cur[0];
            for (j, &y) in b.iter().enumerate() {
                let substitute = self.prev[j] + usize::from(x != y);
                let delete = self.prev[j + 1] + 1;
                let insert = self.cur[j] + 1;
                self.cur[j + 1] = substitute.min(delete).min(insert);
                row_min = row_min.min(self.cur[j + 1]);
            }
            if row_min > limit {
                return None;
            }
            std::mem::swap(&mut self.prev, &mut self.cur);
        }

        let dist = self.prev[b.len()];
        (dist <= limit).then_some(dist)
    }
}
