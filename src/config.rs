//! Call configuration.
//!
//! A [`CallConfig`] is deserialized from the JSON argument record a host passes
//! across the bridge. Unknown keys are rejected, defaults mirror the batch and
//! chunk sizes the engine was tuned for, and [`CallConfig::validate`] runs before
//! any file is opened.

use std::path::PathBuf;

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::error::{CountError, Result};

pub const DEFAULT_READ_BATCH_SIZE: usize = 256;
pub const DEFAULT_REPORT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_BYTES: usize = 8 * 1024 * 1024;
/// Queue slots per worker when `queue_capacity` is not given.
pub const QUEUE_SLOTS_PER_WORKER: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnchorPosition {
    Prefix,
    Suffix,
    #[default]
    Anywhere,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagSource {
    #[default]
    Sequence,
    Header,
}

/// Which mate of a read pair carries the barcode and UMI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mate {
    #[default]
    Read1,
    Read2,
}

/// How a `(barcode, umi)` pair observed with several taxa is resolved when
/// deduplicating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UmiConflict {
    /// Every taxon keeps its own observation.
    #[default]
    KeepAll,
    /// Only the taxon with the most reads; ties go to the lowest taxon id.
    Majority,
    /// The UMI is dropped entirely.
    Discard,
}

/// Tag matching rules, immutable for the lifetime of a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarcodeSpec {
    pub patterns: Vec<String>,
    pub anchor_position: AnchorPosition,
    pub mismatch_tolerance: usize,
    pub umi_length: usize,
    pub tag_source: TagSource,
}

impl BarcodeSpec {
    pub fn validate(&self) -> Result<()> {
        if self.patterns.is_empty() {
            return Err(CountError::config("barcode pattern set is empty"));
        }
        if let Some(pos) = self.patterns.iter().position(|p| p.is_empty()) {
            return Err(CountError::config(format!(
                "barcode pattern #{} is empty",
                pos + 1
            )));
        }
        let mut seen = AHashSet::with_capacity(self.patterns.len());
        if let Some(dup) = self.patterns.iter().find(|p| !seen.insert(p.as_str())) {
            return Err(CountError::config(format!(
                "barcode pattern '{dup}' is listed more than once"
            )));
        }
        let shortest = self.patterns.iter().map(String::len).min().unwrap_or(0);
        if self.mismatch_tolerance >= shortest {
            return Err(CountError::config(format!(
                "mismatch_tolerance {} must be smaller than the shortest pattern ({} bases)",
                self.mismatch_tolerance, shortest
            )));
        }
        Ok(())
    }
}

fn default_read_batch_size() -> usize {
    DEFAULT_READ_BATCH_SIZE
}

fn default_report_batch_size() -> usize {
    DEFAULT_REPORT_BATCH_SIZE
}

fn default_chunk_bytes() -> usize {
    DEFAULT_CHUNK_BYTES
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// The argument record of an `index_report` call, and the report half of a
/// [`CallConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    pub report_paths: Vec<PathBuf>,
    #[serde(default = "default_report_batch_size")]
    pub report_batch_size: usize,
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
    #[serde(default)]
    pub worker_count: Option<usize>,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub include_taxa: Option<Vec<u64>>,
    #[serde(default)]
    pub exclude_lineage: Vec<String>,
    #[serde(default)]
    pub lenient: bool,
    #[serde(default)]
    pub progress: bool,
}

impl ReportConfig {
    pub fn new(report_paths: Vec<PathBuf>) -> Self {
        Self {
            report_paths,
            report_batch_size: DEFAULT_REPORT_BATCH_SIZE,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            worker_count: None,
            queue_capacity: None,
            include_taxa: None,
            exclude_lineage: Vec::new(),
            lenient: false,
            progress: false,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CountError::config(format!("bad arguments: {e}")))
    }

    pub fn workers(&self) -> usize {
        self.worker_count.unwrap_or_else(default_workers)
    }

    pub fn queue_slots(&self) -> usize {
        self.queue_capacity
            .unwrap_or_else(|| QUEUE_SLOTS_PER_WORKER * self.workers())
    }

    pub fn validate(&self) -> Result<()> {
        if self.report_paths.is_empty() {
            return Err(CountError::config("report_paths is empty"));
        }
        if self.report_batch_size == 0 {
            return Err(CountError::config("report_batch_size must be positive"));
        }
        validate_shared(self.chunk_bytes, self.worker_count, self.queue_capacity)?;
        if self.exclude_lineage.iter().any(String::is_empty) {
            return Err(CountError::config("exclude_lineage contains an empty pattern"));
        }
        Ok(())
    }
}

fn validate_shared(
    chunk_bytes: usize,
    worker_count: Option<usize>,
    queue_capacity: Option<usize>,
) -> Result<()> {
    if chunk_bytes == 0 {
        return Err(CountError::config("chunk_bytes must be positive"));
    }
    if worker_count == Some(0) {
        return Err(CountError::config("worker_count must be positive"));
    }
    if queue_capacity == Some(0) {
        return Err(CountError::config("queue_capacity must be positive"));
    }
    Ok(())
}

/// The structured argument record of a `count_taxa` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CallConfig {
    #[serde(default)]
    pub input_paths: Vec<PathBuf>,
    /// `[read1, read2]` files read in lockstep, one count per pair.
    #[serde(default)]
    pub input_pairs: Vec<[PathBuf; 2]>,
    #[serde(default)]
    pub tag_mate: Mate,
    pub report_paths: Vec<PathBuf>,
    pub barcode_patterns: Vec<String>,
    #[serde(default)]
    pub anchor_position: AnchorPosition,
    #[serde(default)]
    pub mismatch_tolerance: usize,
    #[serde(default)]
    pub umi_length: usize,
    #[serde(default)]
    pub tag_source: TagSource,
    #[serde(default)]
    pub dedup: bool,
    #[serde(default)]
    pub umi_conflict: UmiConflict,
    #[serde(default = "default_read_batch_size")]
    pub read_batch_size: usize,
    #[serde(default = "default_report_batch_size")]
    pub report_batch_size: usize,
    #[serde(default = "default_chunk_bytes")]
    pub chunk_bytes: usize,
    #[serde(default)]
    pub worker_count: Option<usize>,
    #[serde(default)]
    pub queue_capacity: Option<usize>,
    #[serde(default)]
    pub include_taxa: Option<Vec<u64>>,
    #[serde(default)]
    pub exclude_lineage: Vec<String>,
    #[serde(default)]
    pub lenient: bool,
    #[serde(default)]
    pub progress: bool,
}

impl CallConfig {
    /// A configuration with every optional knob at its default.
    pub fn new(
        input_paths: Vec<PathBuf>,
        report_paths: Vec<PathBuf>,
        barcode_patterns: Vec<String>,
    ) -> Self {
        Self {
            input_paths,
            input_pairs: Vec::new(),
            tag_mate: Mate::default(),
            report_paths,
            barcode_patterns,
            anchor_position: AnchorPosition::default(),
            mismatch_tolerance: 0,
            umi_length: 0,
            tag_source: TagSource::default(),
            dedup: false,
            umi_conflict: UmiConflict::default(),
            read_batch_size: DEFAULT_READ_BATCH_SIZE,
            report_batch_size: DEFAULT_REPORT_BATCH_SIZE,
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            worker_count: None,
            queue_capacity: None,
            include_taxa: None,
            exclude_lineage: Vec::new(),
            lenient: false,
            progress: false,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| CountError::config(format!("bad arguments: {e}")))
    }

    pub fn barcode_spec(&self) -> BarcodeSpec {
        BarcodeSpec {
            patterns: self.barcode_patterns.clone(),
            anchor_position: self.anchor_position,
            mismatch_tolerance: self.mismatch_tolerance,
            umi_length: self.umi_length,
            tag_source: self.tag_source,
        }
    }

    /// The report-indexing half of this call.
    pub fn report_config(&self) -> ReportConfig {
        ReportConfig {
            report_paths: self.report_paths.clone(),
            report_batch_size: self.report_batch_size,
            chunk_bytes: self.chunk_bytes,
            worker_count: self.worker_count,
            queue_capacity: self.queue_capacity,
            include_taxa: self.include_taxa.clone(),
            exclude_lineage: self.exclude_lineage.clone(),
            lenient: self.lenient,
            progress: self.progress,
        }
    }

    pub fn workers(&self) -> usize {
        self.worker_count.unwrap_or_else(default_workers)
    }

    pub fn queue_slots(&self) -> usize {
        self.queue_capacity
            .unwrap_or_else(|| QUEUE_SLOTS_PER_WORKER * self.workers())
    }

    /// Checks everything that can be checked without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        if self.input_paths.is_empty() && self.input_pairs.is_empty() {
            return Err(CountError::config("input_paths and input_pairs are both empty"));
        }
        self.report_config().validate()?;
        self.barcode_spec().validate()?;
        if self.read_batch_size == 0 {
            return Err(CountError::config("read_batch_size must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> CallConfig {
        CallConfig::new(
            vec![PathBuf::from("r.fq")],
            vec![PathBuf::from("k.txt")],
            vec!["AAAA".into()],
        )
    }

    #[test]
    fn test_json_defaults() {
        let cfg = CallConfig::from_json(
            r#"{"input_paths":["a.fq.gz"],"report_paths":["a.kraken"],"barcode_patterns":["ACGT"]}"#,
        )
        .unwrap();
        assert_eq!(cfg.read_batch_size, 256);
        assert_eq!(cfg.report_batch_size, 1000);
        assert_eq!(cfg.chunk_bytes, 8 * 1024 * 1024);
        assert_eq!(cfg.anchor_position, AnchorPosition::Anywhere);
        assert_eq!(cfg.umi_conflict, UmiConflict::KeepAll);
        assert!(!cfg.dedup);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_json_enums_snake_case() {
        let cfg = CallConfig::from_json(
            r#"{"input_paths":["a"],"report_paths":["b"],"barcode_patterns":["ACGT"],
                "anchor_position":"suffix","tag_source":"header","umi_conflict":"majority"}"#,
        )
        .unwrap();
        assert_eq!(cfg.anchor_position, AnchorPosition::Suffix);
        assert_eq!(cfg.tag_source, TagSource::Header);
        assert_eq!(cfg.umi_conflict, UmiConflict::Majority);
    }

    #[test]
    fn test_unknown_key_is_config_error() {
        let err = CallConfig::from_json(
            r#"{"input_paths":["a"],"report_paths":["b"],"barcode_patterns":["A"],"bogus":1}"#,
        )
        .unwrap_err();
        assert!(matches!(err, CountError::Config(_)));
        assert!(err.to_string().contains("bogus"));
    }

    #[test]
    fn test_empty_pattern_set_rejected() {
        let mut cfg = minimal();
        cfg.barcode_patterns.clear();
        assert!(matches!(cfg.validate(), Err(CountError::Config(_))));
        cfg.barcode_patterns = vec!["AC".into(), String::new()];
        assert!(cfg.validate().unwrap_err().to_string().contains("#2"));
    }

    #[test]
    fn test_duplicate_pattern_rejected() {
        let mut cfg = minimal();
        cfg.mismatch_tolerance = 1;
        cfg.barcode_patterns = vec!["AAAA".into(), "CCCC".into(), "AAAA".into()];
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, CountError::Config(_)));
        assert!(err.to_string().contains("'AAAA' is listed more than once"));
    }

    #[test]
    fn test_pairs_alone_are_enough_input() {
        let cfg = CallConfig::from_json(
            r#"{"input_pairs":[["r_1.fq.gz","r_2.fq.gz"]],"tag_mate":"read2",
                "report_paths":["k.txt"],"barcode_patterns":["ACGT"]}"#,
        )
        .unwrap();
        assert_eq!(cfg.tag_mate, Mate::Read2);
        assert_eq!(cfg.input_pairs[0][1], PathBuf::from("r_2.fq.gz"));
        assert!(cfg.validate().is_ok());

        let mut none = minimal();
        none.input_paths.clear();
        assert!(none.validate().unwrap_err().to_string().contains("both empty"));
    }

    #[test]
    fn test_tolerance_bounded_by_shortest_pattern() {
        let mut cfg = minimal();
        cfg.mismatch_tolerance = 4;
        assert!(cfg.validate().is_err());
        cfg.mismatch_tolerance = 3;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_zero_sizes_rejected() {
        let mut cfg = minimal();
        cfg.read_batch_size = 0;
        assert!(cfg.validate().is_err());
        let mut cfg = minimal();
        cfg.worker_count = Some(0);
        assert!(cfg.validate().is_err());
        let mut cfg = minimal();
        cfg.chunk_bytes = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_report_config_json_and_split() {
        let cfg = ReportConfig::from_json(r#"{"report_paths":["k.txt"],"include_taxa":[562]}"#).unwrap();
        assert_eq!(cfg.report_batch_size, 1000);
        assert_eq!(cfg.include_taxa, Some(vec![562]));
        assert!(cfg.validate().is_ok());
        assert!(ReportConfig::from_json(r#"{"report_paths":["k"],"input_paths":["r"]}"#).is_err());

        let mut call = minimal();
        call.exclude_lineage = vec![String::new()];
        assert!(call.report_config().validate().is_err());
        assert!(call.validate().is_err());
    }

    #[test]
    fn test_queue_slots_follow_workers() {
        let mut cfg = minimal();
        cfg.worker_count = Some(3);
        assert_eq!(cfg.queue_slots(), 6);
        cfg.queue_capacity = Some(1);
        assert_eq!(cfg.queue_slots(), 1);
    }
}
