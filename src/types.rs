use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One FASTQ record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Read {
    /// Header text up to the first whitespace, without the leading '@'.
    pub id: String,
    /// Full header line without the leading '@'.
    pub header: String,
    pub sequence: Vec<u8>,
    pub quality: Vec<u8>,
}

/// A classified report line: the taxonomic assignment of one read (or pair).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub read_id: String,
    pub taxon_id: u64,
    pub rank_path: Vec<String>,
    pub taxon_path: Vec<String>,
    /// Reads this line stands for (2 for a paired `len1|len2` length field).
    pub total_reads: u64,
    pub read_length: u64,
}

/// A parsed classifier report line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportLine {
    Classified(Classification),
    Unclassified { read_id: String },
}

/// One aggregation bucket. `barcode` indexes the call's pattern list so the
/// hot path never copies barcode text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CountKey {
    pub taxon_id: u64,
    pub barcode: u32,
    pub umi: Vec<u8>,
}

impl CountKey {
    pub fn new(taxon_id: u64, barcode: u32, umi: &[u8]) -> Self {
        Self {
            taxon_id,
            barcode,
            umi: umi.to_vec(),
        }
    }
}

/// One output row of the final count table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRow {
    pub taxon_id: u64,
    pub barcode: String,
    pub umi: String,
    /// Reported count (1 per bucket when deduplicating).
    pub count: u64,
    /// Raw reads that landed in the bucket.
    pub reads: u64,
}

/// Per-taxon totals derived from the count rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonTotal {
    pub taxon_id: u64,
    pub count: u64,
    pub reads: u64,
    pub barcodes: u64,
    pub rank_path: Vec<String>,
    pub taxon_path: Vec<String>,
}

/// Join misses, skips and other tallies. None of these are errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub reads_processed: u64,
    pub reads_without_tag: u64,
    pub reads_unclassified: u64,
    pub report_lines: u64,
    pub report_lines_unclassified: u64,
    pub classifications_indexed: u64,
    pub classifications_filtered: u64,
    pub classifications_unmatched: u64,
    pub duplicate_classifications: u64,
    pub duplicates_collapsed: u64,
    pub conflicting_umis: u64,
    pub records_skipped: u64,
    pub batches_processed: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stage_millis: BTreeMap<String, u64>,
}

/// Classifications indexed for one taxon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxonSummary {
    pub taxon_id: u64,
    /// Distinct read identifiers assigned to the taxon.
    pub classifications: u64,
    /// Reads those identifiers stand for (pairs count twice).
    pub reads: u64,
    pub rank_path: Vec<String>,
    pub taxon_path: Vec<String>,
}

/// Successful payload of an `index_report` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSummary {
    pub taxa: Vec<TaxonSummary>,
    pub diagnostics: Diagnostics,
}

/// Successful payload of a `count_taxa` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountReport {
    pub dedup: bool,
    pub rows: Vec<CountRow>,
    pub taxa: Vec<TaxonTotal>,
    pub diagnostics: Diagnostics,
}

impl CountReport {
    /// Tab-separated count table, header first, rows in canonical order.
    pub fn to_tsv(&self) -> String {
        let mut out = String::with_capacity(32 + self.rows.len() * 32);
        out.push_str("taxon_id\tbarcode\tumi\tcount\treads\n");
        for row in &self.rows {
            out.push_str(&format!(
                "{}\t{}\t{}\t{}\t{}\n",
                row.taxon_id, row.barcode, row.umi, row.count, row.reads
            ));
        }
        out
    }

    /// Looks up the reported count of one bucket.
    pub fn count_of(&self, barcode: &str, umi: &str, taxon_id: u64) -> Option<u64> {
        self.rows
            .iter()
            .find(|r| r.taxon_id == taxon_id && r.barcode == barcode && r.umi == umi)
            .map(|r| r.count)
    }
}
