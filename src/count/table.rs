//! Count tables and the final merge.
//!
//! Workers increment raw read counts per [`CountKey`]. Tables merge by key-wise
//! addition, which is associative and commutative, so the merged table does
//! not depend on how batches were spread over workers. Deduplication and UMI
//! conflict resolution only happen in [`CountTable::finalize`], after every
//! worker's contribution has been added.

use std::collections::BTreeMap;

use ahash::AHashMap;
use rayon::prelude::*;

use crate::config::UmiConflict;
use crate::count::index::ClassificationIndex;
use crate::types::{CountKey, CountRow, TaxonTotal};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountTable {
    counts: AHashMap<CountKey, u64>,
}

/// Tallies produced while finalizing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FinalizeTally {
    pub duplicates_collapsed: u64,
    pub conflicting_umis: u64,
}

/// Rows and totals in canonical order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalTable {
    pub rows: Vec<CountRow>,
    pub taxa: Vec<TaxonTotal>,
    pub tally: FinalizeTally,
}

impl CountTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, taxon_id: u64, barcode: u32, umi: &[u8]) {
        self.add(CountKey::new(taxon_id, barcode, umi), 1);
    }

    pub fn add(&mut self, key: CountKey, n: u64) {
        *self.counts.entry(key).or_insert(0) += n;
    }

    pub fn get(&self, key: &CountKey) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Adds every bucket of `other` into `self`.
    pub fn merge(mut self, mut other: CountTable) -> CountTable {
        if other.counts.len() > self.counts.len() {
            std::mem::swap(&mut self, &mut other);
        }
        self.counts.reserve(other.counts.len());
        for (key, n) in other.counts {
            *self.counts.entry(key).or_insert(0) += n;
        }
        self
    }

    /// Parallel reduction of worker tables.
    pub fn merge_all(tables: Vec<CountTable>) -> CountTable {
        tables
            .into_par_iter()
            .reduce(CountTable::default, CountTable::merge)
    }

    /// Resolves pattern indices to barcode text and produces sorted rows and
    /// per-taxon totals.
    ///
    /// With `dedup`, every surviving bucket reports a count of 1 and UMIs seen
    /// with several taxa are resolved by `conflict`.
    pub fn finalize(
        self,
        patterns: &[String],
        dedup: bool,
        conflict: UmiConflict,
        index: &ClassificationIndex,
    ) -> FinalTable {
        let mut tally = FinalizeTally::default();

        let buckets: Vec<(CountKey, u64)> = if dedup {
            resolve_conflicts(self.counts, conflict, &mut tally)
        } else {
            self.counts.into_iter().collect()
        };

        let mut rows: Vec<CountRow> = buckets
            .into_par_iter()
            .map(|(key, reads)| CountRow {
                taxon_id: key.taxon_id,
                barcode: patterns
                    .get(key.barcode as usize)
                    .cloned()
                    .unwrap_or_default(),
                // records are ASCII-checked when parsed
                umi: String::from_utf8_lossy(&key.umi).into_owned(),
                count: if dedup { 1 } else { reads },
                reads,
            })
            .collect();
        rows.par_sort_unstable_by(|a, b| {
            (a.taxon_id, &a.barcode, &a.umi).cmp(&(b.taxon_id, &b.barcode, &b.umi))
        });
        if dedup {
            tally.duplicates_collapsed = rows.iter().map(|r| r.reads - 1).sum();
        }

        let taxa = taxon_totals(&rows, index);
        FinalTable { rows, taxa, tally }
    }
}

/// Applies the UMI conflict policy to raw buckets.
fn resolve_conflicts(
    counts: AHashMap<CountKey, u64>,
    conflict: UmiConflict,
    tally: &mut FinalizeTally,
) -> Vec<(CountKey, u64)> {
    if conflict == UmiConflict::KeepAll {
        return counts.into_iter().collect();
    }

    // (barcode, umi) -> [(taxon, reads)]
    let mut molecules: AHashMap<(u32, Vec<u8>), Vec<(u64, u64)>> = AHashMap::new();
    for (key, reads) in counts {
        molecules
            .entry((key.barcode, key.umi))
            .or_default()
            .push((key.taxon_id, reads));
    }

    let mut out = Vec::with_capacity(molecules.len());
    for ((barcode, umi), mut taxa) in molecules {
        if taxa.len() == 1 {
            let (taxon_id, reads) = taxa[0];
            out.push((CountKey { taxon_id, barcode, umi }, reads));
            continue;
        }
        match conflict {
            UmiConflict::Discard => {
                tally.conflicting_umis += taxa.len() as u64;
            }
            UmiConflict::Majority => {
                // most reads first, then the lowest taxon id
                taxa.sort_unstable_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
                tally.conflicting_umis += taxa.len() as u64 - 1;
                let (taxon_id, reads) = taxa[0];
                out.push((CountKey { taxon_id, barcode, umi }, reads));
            }
            UmiConflict::KeepAll => {
                for (taxon_id, reads) in taxa {
                    out.push((
                        CountKey {
                            taxon_id,
                            barcode,
                            umi: umi.clone(),
                        },
                        reads,
                    ));
                }
            }
        }
    }
    out
}

/// Sums sorted rows per taxon.
fn taxon_totals(rows: &[CountRow], index: &ClassificationIndex) -> Vec<TaxonTotal> {
    let mut totals: BTreeMap<u64, (u64, u64, Vec<&str>)> = BTreeMap::new();
    for row in rows {
        let entry = totals.entry(row.taxon_id).or_insert((0, 0, Vec::new()));
        entry.0 += row.count;
        entry.1 += row.reads;
        if entry.2.last() != Some(&row.barcode.as_str()) {
            entry.2.push(&row.barcode);
        }
    }

    totals
        .into_iter()
        .map(|(taxon_id, (count, reads, barcodes))| {
            let lineage = index.lineage(taxon_id).cloned().unwrap_or_default();
            TaxonTotal {
                taxon_id,
                count,
                reads,
                barcodes: barcodes.len() as u64,
                rank_path: lineage.rank_path,
                taxon_path: lineage.taxon_path,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns() -> Vec<String> {
        vec!["AAAA".into(), "CCCC".into()]
    }

    fn table(entries: &[(u64, u32, &str, u64)]) -> CountTable {
        let mut t = CountTable::new();
        for &(taxon, barcode, umi, n) in entries {
            t.add(CountKey::new(taxon, barcode, umi.as_bytes()), n);
        }
        t
    }

    fn finalize(t: CountTable, dedup: bool, conflict: UmiConflict) -> FinalTable {
        t.finalize(&patterns(), dedup, conflict, &ClassificationIndex::default())
    }

    #[test]
    fn test_merge_is_associative_and_commutative() {
        let a = table(&[(1, 0, "U1", 2), (2, 1, "U2", 1)]);
        let b = table(&[(1, 0, "U1", 3)]);
        let c = table(&[(2, 1, "U2", 4), (3, 0, "", 1)]);

        let left = a.clone().merge(b.clone()).merge(c.clone());
        let right = a.clone().merge(b.clone().merge(c.clone()));
        let swapped = c.clone().merge(a.clone()).merge(b.clone());
        assert_eq!(left, right);
        assert_eq!(left, swapped);
        assert_eq!(left.get(&CountKey::new(1, 0, b"U1")), 5);
        assert_eq!(left.get(&CountKey::new(2, 1, b"U2")), 5);
        assert_eq!(left.len(), 3);
        assert_eq!(CountTable::merge_all(vec![a, b, c]), left);
    }

    #[test]
    fn test_merge_with_empty_is_noop() {
        let a = table(&[(1, 0, "U1", 2)]);
        assert_eq!(a.clone().merge(CountTable::new()), a);
        assert_eq!(CountTable::new().merge(a.clone()), a);
        assert!(CountTable::merge_all(Vec::new()).is_empty());
    }

    #[test]
    fn test_finalize_sorts_by_taxon_barcode_umi() {
        let t = table(&[(9, 1, "B", 1), (9, 0, "Z", 1), (2, 1, "A", 1), (9, 0, "A", 1)]);
        let out = finalize(t, false, UmiConflict::KeepAll);
        let keys: Vec<(u64, &str, &str)> = out
            .rows
            .iter()
            .map(|r| (r.taxon_id, r.barcode.as_str(), r.umi.as_str()))
            .collect();
        assert_eq!(
            keys,
            vec![(2, "CCCC", "A"), (9, "AAAA", "A"), (9, "AAAA", "Z"), (9, "CCCC", "B")]
        );
        assert_eq!(out.taxa.len(), 2);
        assert_eq!(out.taxa[1].barcodes, 2);
        assert_eq!(out.taxa[1].count, 3);
    }

    #[test]
    fn test_dedup_collapses_to_presence() {
        let t = table(&[(9606, 0, "UMI1", 2), (9606, 0, "UMI2", 1)]);
        let raw = finalize(t.clone(), false, UmiConflict::KeepAll);
        assert_eq!(raw.rows[0].count, 2);
        assert_eq!(raw.taxa[0].count, 3);

        let dedup = finalize(t, true, UmiConflict::KeepAll);
        assert_eq!(dedup.rows[0].count, 1);
        assert_eq!(dedup.rows[0].reads, 2);
        assert_eq!(dedup.taxa[0].count, 2);
        assert_eq!(dedup.taxa[0].reads, 3);
        assert_eq!(dedup.tally.duplicates_collapsed, 1);
    }

    #[test]
    fn test_conflict_policies() {
        let t = table(&[(5, 0, "U1", 3), (3, 0, "U1", 1), (7, 0, "U2", 1)]);

        let keep = finalize(t.clone(), true, UmiConflict::KeepAll);
        assert_eq!(keep.rows.len(), 3);
        assert_eq!(keep.tally.conflicting_umis, 0);

        let majority = finalize(t.clone(), true, UmiConflict::Majority);
        let taxa: Vec<u64> = majority.rows.iter().map(|r| r.taxon_id).collect();
        assert_eq!(taxa, vec![5, 7]);
        assert_eq!(majority.tally.conflicting_umis, 1);

        let discard = finalize(t, true, UmiConflict::Discard);
        assert_eq!(discard.rows.len(), 1);
        assert_eq!(discard.rows[0].taxon_id, 7);
        assert_eq!(discard.tally.conflicting_umis, 2);
    }

    #[test]
    fn test_majority_tie_goes_to_lowest_taxon() {
        let t = table(&[(8, 1, "U", 2), (4, 1, "U", 2)]);
        let out = finalize(t, true, UmiConflict::Majority);
        assert_eq!(out.rows.len(), 1);
        assert_eq!(out.rows[0].taxon_id, 4);
    }

    #[test]
    fn test_conflict_policy_ignored_without_dedup() {
        let t = table(&[(5, 0, "U1", 3), (3, 0, "U1", 1)]);
        let out = finalize(t, false, UmiConflict::Discard);
        assert_eq!(out.rows.len(), 2);
        assert_eq!(out.tally, FinalizeTally::default());
    }
}
