//! Read-id → classification index, built from report batches.
//!
//! Workers each fill an [`IndexFragment`]; fragments are merged and frozen
//! into a [`ClassificationIndex`] before any read is looked at. When a read id
//! appears on several report lines, the line that comes first in file order
//! wins no matter which worker saw it.

use ahash::{AHashMap, AHashSet};
use aho_corasick::AhoCorasick;
use rayon::prelude::*;

use crate::batch::Batch;
use crate::error::{CountError, Result};
use crate::types::{Classification, Diagnostics, ReportLine, TaxonSummary};

/// Where a report line came from: `(file index, line number)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Origin {
    pub file_index: u32,
    pub line: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Lineage {
    pub rank_path: Vec<String>,
    pub taxon_path: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    taxon_id: u64,
    total_reads: u64,
    origin: Origin,
}

/// Report line tallies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportTally {
    pub lines: u64,
    pub unclassified: u64,
    pub filtered: u64,
}

impl ReportTally {
    fn add(&mut self, other: &ReportTally) {
        self.lines += other.lines;
        self.unclassified += other.unclassified;
        self.filtered += other.filtered;
    }
}

/// Keeps or drops classifications before they are indexed.
pub struct ReportFilter {
    include: Option<AHashSet<u64>>,
    exclude: Option<AhoCorasick>,
}

impl ReportFilter {
    pub fn new(include_taxa: Option<&[u64]>, exclude_lineage: &[String]) -> Result<Self> {
        let include = include_taxa.map(|ids| ids.iter().copied().collect());
        let exclude = if exclude_lineage.is_empty() {
            None
        } else {
            Some(AhoCorasick::new(exclude_lineage).map_err(|e| {
                CountError::config(format!("cannot compile exclude_lineage: {e}"))
            })?)
        };
        Ok(Self { include, exclude })
    }

    /// Accepts everything.
    pub fn none() -> Self {
        Self {
            include: None,
            exclude: None,
        }
    }

    pub fn accepts(&self, c: &Classification) -> bool {
        if let Some(include) = &self.include {
            if !include.contains(&c.taxon_id) {
                return false;
            }
        }
        if let Some(exclude) = &self.exclude {
            if c.taxon_path.iter().any(|name| exclude.is_match(name)) {
                return false;
            }
        }
        true
    }
}

/// One worker's share of the index.
#[derive(Debug, Default)]
pub struct IndexFragment {
    entries: AHashMap<String, Entry>,
    lineages: AHashMap<u64, (Origin, Lineage)>,
    duplicates: u64,
    tally: ReportTally,
}

impl IndexFragment {
    /// Records one accepted classification.
    pub fn insert(&mut self, origin: Origin, c: Classification) {
        let entry = Entry {
            taxon_id: c.taxon_id,
            total_reads: c.total_reads,
            origin,
        };
        match self.entries.get_mut(&c.read_id) {
            Some(existing) => {
                self.duplicates += 1;
                if origin < existing.origin {
                    *existing = entry;
                }
            }
            None => {
                self.entries.insert(c.read_id, entry);
            }
        }
        let lineage = Lineage {
            rank_path: c.rank_path,
            taxon_path: c.taxon_path,
        };
        keep_earliest(&mut self.lineages, c.taxon_id, origin, lineage);
    }

    /// Folds `other` into `self`. Associative and commutative.
    pub fn merge(mut self, mut other: IndexFragment) -> IndexFragment {
        if other.entries.len() > self.entries.len() {
            std::mem::swap(&mut self, &mut other);
        }
        self.duplicates += other.duplicates;
        self.tally.add(&other.tally);
        self.entries.reserve(other.entries.len());
        for (read_id, entry) in other.entries {
            match self.entries.get_mut(&read_id) {
                Some(existing) => {
                    self.duplicates += 1;
                    if entry.origin < existing.origin {
                        *existing = entry;
                    }
                }
                None => {
                    self.entries.insert(read_id, entry);
                }
            }
        }
        for (taxon_id, (origin, lineage)) in other.lineages {
            keep_earliest(&mut self.lineages, taxon_id, origin, lineage);
        }
        self
    }
}

fn keep_earliest(
    lineages: &mut AHashMap<u64, (Origin, Lineage)>,
    taxon_id: u64,
    origin: Origin,
    lineage: Lineage,
) {
    match lineages.get_mut(&taxon_id) {
        Some(existing) if origin < existing.0 => *existing = (origin, lineage),
        Some(_) => {}
        None => {
            lineages.insert(taxon_id, (origin, lineage));
        }
    }
}

/// Worker-side processing of report batches.
pub struct ReportWorker<'f> {
    filter: &'f ReportFilter,
}

impl<'f> ReportWorker<'f> {
    pub fn new(filter: &'f ReportFilter) -> Self {
        Self { filter }
    }

    pub fn process(&self, fragment: &mut IndexFragment, batch: Batch<(u64, ReportLine)>) -> Result<()> {
        let file_index = batch.file_index;
        for (line, parsed) in batch.records {
            fragment.tally.lines += 1;
            match parsed {
                ReportLine::Unclassified { .. } => fragment.tally.unclassified += 1,
                ReportLine::Classified(c) if !self.filter.accepts(&c) => fragment.tally.filtered += 1,
                ReportLine::Classified(c) => fragment.insert(Origin { file_index, line }, c),
            }
        }
        Ok(())
    }
}

/// The frozen index. Every read id owns a dense slot so hits can be tracked
/// in a bitset.
#[derive(Debug, Default)]
pub struct ClassificationIndex {
    slots: AHashMap<String, u32>,
    taxa: Vec<u64>,
    reads: Vec<u64>,
    lineages: AHashMap<u64, Lineage>,
    duplicates: u64,
    tally: ReportTally,
}

impl ClassificationIndex {
    /// Merges worker fragments and assigns slots in read-id order.
    pub fn from_fragments(fragments: Vec<IndexFragment>) -> Result<Self> {
        let merged = fragments
            .into_par_iter()
            .reduce(IndexFragment::default, IndexFragment::merge);

        if merged.entries.len() > u32::MAX as usize {
            return Err(CountError::InternalFault(format!(
                "{} classifications exceed the index capacity",
                merged.entries.len()
            )));
        }

        let mut entries: Vec<(String, Entry)> = merged.entries.into_iter().collect();
        entries.par_sort_unstable_by(|a, b| a.0.cmp(&b.0));

        let mut slots = AHashMap::with_capacity(entries.len());
        let mut taxa = Vec::with_capacity(entries.len());
        let mut reads = Vec::with_capacity(entries.len());
        for (slot, (read_id, entry)) in entries.into_iter().enumerate() {
            slots.insert(read_id, slot as u32);
            taxa.push(entry.taxon_id);
            reads.push(entry.total_reads);
        }
        let lineages = merged
            .lineages
            .into_iter()
            .map(|(taxon_id, (_, lineage))| (taxon_id, lineage))
            .collect();

        log::debug!(
            "indexed {} classifications ({} duplicate ids)",
            taxa.len(),
            merged.duplicates
        );
        Ok(Self {
            slots,
            taxa,
            reads,
            lineages,
            duplicates: merged.duplicates,
            tally: merged.tally,
        })
    }

    /// The slot and taxon of `read_id`, if it was classified.
    pub fn lookup(&self, read_id: &str) -> Option<(u32, u64)> {
        let slot = *self.slots.get(read_id)?;
        Some((slot, self.taxa[slot as usize]))
    }

    pub fn len(&self) -> usize {
        self.taxa.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taxa.is_empty()
    }

    pub fn lineage(&self, taxon_id: u64) -> Option<&Lineage> {
        self.lineages.get(&taxon_id)
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn tally(&self) -> &ReportTally {
        &self.tally
    }

    /// Copies the report-side counters into `diag`.
    pub fn fill_diagnostics(&self, diag: &mut Diagnostics) {
        diag.report_lines = self.tally.lines;
        diag.report_lines_unclassified = self.tally.unclassified;
        diag.classifications_filtered = self.tally.filtered;
        diag.classifications_indexed = self.len() as u64;
        diag.duplicate_classifications = self.duplicates;
    }

    /// Per-taxon classification totals, sorted by taxon id.
    pub fn taxon_summary(&self) -> Vec<TaxonSummary> {
        let mut per_taxon: AHashMap<u64, (u64, u64)> = AHashMap::new();
        for (taxon_id, reads) in self.taxa.iter().zip(&self.reads) {
            let totals = per_taxon.entry(*taxon_id).or_insert((0, 0));
            totals.0 += 1;
            totals.1 += reads;
        }
        let mut summary: Vec<TaxonSummary> = per_taxon
            .into_iter()
            .map(|(taxon_id, (classifications, reads))| {
                let lineage = self.lineage(taxon_id).cloned().unwrap_or_default();
                TaxonSummary {
                    taxon_id,
                    classifications,
                    reads,
                    rank_path: lineage.rank_path,
                    taxon_path: lineage.taxon_path,
                }
            })
            .collect();
        summary.sort_unstable_by_key(|t| t.taxon_id);
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classified(read_id: &str, taxon_id: u64, lineage: &str) -> ReportLine {
        let (rank_path, taxon_path) = crate::report::split_lineage(lineage);
        ReportLine::Classified(Classification {
            read_id: read_id.into(),
            taxon_id,
            rank_path,
            taxon_path,
            total_reads: 1,
            read_length: 100,
        })
    }

    fn batch(file_index: u32, lines: Vec<(u64, ReportLine)>) -> Batch<(u64, ReportLine)> {
        Batch {
            file_index,
            records: lines,
        }
    }

    fn fragment(filter: &ReportFilter, b: Batch<(u64, ReportLine)>) -> IndexFragment {
        let mut frag = IndexFragment::default();
        ReportWorker::new(filter).process(&mut frag, b).unwrap();
        frag
    }

    #[test]
    fn test_earliest_duplicate_wins_regardless_of_fragment_order() {
        let filter = ReportFilter::none();
        let early = || fragment(&filter, batch(0, vec![(5, classified("r1", 10, "g__A"))]));
        let late = || fragment(&filter, batch(1, vec![(1, classified("r1", 20, "g__B"))]));

        for frags in [vec![early(), late()], vec![late(), early()]] {
            let index = ClassificationIndex::from_fragments(frags).unwrap();
            assert_eq!(index.len(), 1);
            assert_eq!(index.lookup("r1").map(|(_, t)| t), Some(10));
            assert_eq!(index.duplicates(), 1);
        }
    }

    #[test]
    fn test_lineage_taken_from_earliest_line() {
        let filter = ReportFilter::none();
        let frags = vec![
            fragment(&filter, batch(0, vec![(9, classified("r2", 7, "g__Late"))])),
            fragment(&filter, batch(0, vec![(2, classified("r1", 7, "g__Early"))])),
        ];
        let index = ClassificationIndex::from_fragments(frags).unwrap();
        assert_eq!(index.lineage(7).unwrap().taxon_path, vec!["Early"]);
    }

    #[test]
    fn test_filters_and_tallies() {
        let filter = ReportFilter::new(Some(&[1u64, 2][..]), &["Homo".to_string()]).unwrap();
        let frag = fragment(
            &filter,
            batch(
                0,
                vec![
                    (1, classified("a", 1, "g__Escherichia")),
                    (2, classified("b", 2, "g__Homo|s__Homo sapiens")),
                    (3, classified("c", 3, "g__Other")),
                    (4, ReportLine::Unclassified { read_id: "d".into() }),
                ],
            ),
        );
        let index = ClassificationIndex::from_fragments(vec![frag]).unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.lookup("a").is_some());
        assert_eq!(index.tally().lines, 4);
        assert_eq!(index.tally().filtered, 2);
        assert_eq!(index.tally().unclassified, 1);

        let mut diag = Diagnostics::default();
        index.fill_diagnostics(&mut diag);
        assert_eq!(diag.classifications_indexed, 1);
        assert_eq!(diag.classifications_filtered, 2);
    }

    #[test]
    fn test_slots_are_dense_and_summary_sorted() {
        let filter = ReportFilter::none();
        let frag = fragment(
            &filter,
            batch(
                0,
                vec![
                    (1, classified("z", 9, "s__Nine")),
                    (2, classified("y", 3, "s__Three")),
                    (3, classified("x", 9, "s__Nine")),
                ],
            ),
        );
        let index = ClassificationIndex::from_fragments(vec![frag]).unwrap();
        let mut slots: Vec<u32> = ["x", "y", "z"]
            .iter()
            .map(|id| index.lookup(id).unwrap().0)
            .collect();
        slots.sort_unstable();
        assert_eq!(slots, vec![0, 1, 2]);

        let summary = index.taxon_summary();
        assert_eq!(summary.iter().map(|t| t.taxon_id).collect::<Vec<_>>(), vec![3, 9]);
        assert_eq!(summary[1].classifications, 2);
        assert_eq!(summary[1].taxon_path, vec!["Nine"]);
    }

    #[test]
    fn test_empty_fragments() {
        let index = ClassificationIndex::from_fragments(Vec::new()).unwrap();
        assert!(index.is_empty());
        assert!(index.lookup("r1").is_none());
        assert!(index.taxon_summary().is_empty());
    }
}
