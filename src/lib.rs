// src/lib.rs
pub mod batch;
pub mod bridge;
pub mod config;
pub mod count;
pub mod decompress;
pub mod error;
pub mod fastq;
pub mod logging;
pub mod pipeline;
pub mod progress;
pub mod reader;
pub mod report;
pub mod tags;
pub mod types;

use std::collections::BTreeMap;

use crate::batch::Batcher;
use crate::count::{ClassificationIndex, CountTable, HitSet, IndexFragment, ReadState, ReadTally};
use crate::count::{ReadWorker, ReportFilter, ReportWorker};
use crate::decompress::{default_backend, DecompressBackend};
use crate::fastq::{stream_fastq, stream_fastq_pairs};
use crate::pipeline::{run_pipeline, PipelineOptions};
use crate::progress::time_stage;
use crate::report::stream_report;
use crate::tags::TagExtractor;

pub use crate::bridge::{call, ResultEnvelope};
pub use crate::config::{BarcodeSpec, CallConfig, ReportConfig};
pub use crate::error::{CountError, Result};
pub use crate::types::{CountReport, CountRow, Diagnostics, IndexSummary, TaxonTotal};

/// Runs the report files through the worker pool and freezes the merged index.
fn build_index(
    cfg: &ReportConfig,
    backend: &dyn DecompressBackend,
    diag: &mut Diagnostics,
) -> Result<ClassificationIndex> {
    let filter = ReportFilter::new(cfg.include_taxa.as_deref(), &cfg.exclude_lineage)?;
    let worker = ReportWorker::new(&filter);
    let opts = PipelineOptions {
        label: "reports",
        workers: cfg.workers(),
        queue_capacity: cfg.queue_slots(),
        progress: cfg.progress,
    };

    let mut skipped = 0u64;
    let (fragments, stats) = run_pipeline(
        &opts,
        IndexFragment::default,
        |fragment, batch| worker.process(fragment, batch),
        |sink| {
            for (file_index, path) in cfg.report_paths.iter().enumerate() {
                log::info!("indexing {}", path.display());
                let mut batcher = Batcher::new(cfg.report_batch_size, file_index as u32);
                skipped += stream_report(path, cfg.chunk_bytes, cfg.lenient, backend, |line_no, line| {
                    sink.send_opt(batcher.push((line_no, line)))
                })?;
                sink.send_opt(batcher.finish())?;
            }
            Ok(())
        },
    )?;

    let index = ClassificationIndex::from_fragments(fragments)?;
    index.fill_diagnostics(diag);
    diag.records_skipped += skipped;
    diag.batches_processed += stats.batches_processed;
    log::info!(
        "indexed {} classifications from {} report lines",
        index.len(),
        diag.report_lines
    );
    Ok(index)
}

/// Folds the per-worker read states into one table, hit set and tally.
fn merge_read_states(states: Vec<ReadState>) -> (CountTable, HitSet, ReadTally) {
    let mut tables = Vec::with_capacity(states.len());
    let mut hits = HitSet::default();
    let mut tally = ReadTally::default();
    for state in states {
        hits = hits.union(&state.hits);
        tally.add(&state.tally);
        tables.push(state.table);
    }
    (CountTable::merge_all(tables), hits, tally)
}

/// Indexes classifier reports only and summarizes them per taxon.
pub fn index_reports(cfg: &ReportConfig) -> Result<IndexSummary> {
    cfg.validate()?;
    let mut diagnostics = Diagnostics::default();
    let mut timings = BTreeMap::new();
    let index = time_stage(&mut timings, "index", || {
        build_index(cfg, default_backend(), &mut diagnostics)
    })?;
    diagnostics.stage_millis = timings;
    Ok(IndexSummary {
        taxa: index.taxon_summary(),
        diagnostics,
    })
}

/// Counts reads per `(barcode, umi, taxon)` by joining tagged reads against
/// classifier reports.
///
/// The call is atomic: either every input is read and the full report comes
/// back, or the first fatal error is returned and nothing else.
pub fn count_taxa(cfg: &CallConfig) -> Result<CountReport> {
    cfg.validate()?;
    let backend = default_backend();
    let tags = TagExtractor::new(&cfg.barcode_spec())?;

    let mut diag = Diagnostics::default();
    let mut timings = BTreeMap::new();

    // 1. Classification index
    let report_cfg = cfg.report_config();
    let index = time_stage(&mut timings, "index", || build_index(&report_cfg, backend, &mut diag))?;

    // 2. Reads
    let worker = ReadWorker::new(&index, &tags);
    let opts = PipelineOptions {
        label: "reads",
        workers: cfg.workers(),
        queue_capacity: cfg.queue_slots(),
        progress: cfg.progress,
    };
    let mut skipped = 0u64;
    let (states, stats) = time_stage(&mut timings, "reads", || {
        run_pipeline(
            &opts,
            || worker.new_state(),
            |state, batch| worker.process(state, batch),
            |sink| {
                for (file_index, path) in cfg.input_paths.iter().enumerate() {
                    log::info!("reading {}", path.display());
                    let mut batcher = Batcher::new(cfg.read_batch_size, file_index as u32);
                    skipped += stream_fastq(path, cfg.chunk_bytes, cfg.lenient, backend, |read| {
                        sink.send_opt(batcher.push(read))
                    })?;
                    sink.send_opt(batcher.finish())?;
                }
                for (n, [read1, read2]) in cfg.input_pairs.iter().enumerate() {
                    log::info!("reading pairs {} + {}", read1.display(), read2.display());
                    let file_index = (cfg.input_paths.len() + n) as u32;
                    let mut batcher = Batcher::new(cfg.read_batch_size, file_index);
                    skipped += stream_fastq_pairs(
                        (read1.as_path(), read2.as_path()),
                        cfg.chunk_bytes,
                        cfg.lenient,
                        cfg.tag_mate,
                        backend,
                        |pair| sink.send_opt(batcher.push(pair)),
                    )?;
                    sink.send_opt(batcher.finish())?;
                }
                Ok(())
            },
        )
    })?;

    // 3. Merge and finalize
    let (table, hits, tally) = time_stage(&mut timings, "merge", || merge_read_states(states));
    let finished = time_stage(&mut timings, "finalize", || {
        table.finalize(&cfg.barcode_patterns, cfg.dedup, cfg.umi_conflict, &index)
    });

    diag.reads_processed = tally.processed;
    diag.reads_without_tag = tally.without_tag;
    diag.reads_unclassified = tally.unclassified;
    diag.classifications_unmatched = index.len() as u64 - hits.count();
    diag.duplicates_collapsed = finished.tally.duplicates_collapsed;
    diag.conflicting_umis = finished.tally.conflicting_umis;
    diag.records_skipped += skipped;
    diag.batches_processed += stats.batches_processed;
    diag.stage_millis = timings;

    log::info!(
        "counted {} reads into {} buckets across {} taxa",
        diag.reads_processed,
        finished.rows.len(),
        finished.taxa.len()
    );
    if diag.reads_without_tag > 0 || diag.reads_unclassified > 0 {
        log::info!(
            "{} reads without a tag, {} reads without a classification, {} classifications never matched",
            diag.reads_without_tag,
            diag.reads_unclassified,
            diag.classifications_unmatched
        );
    }

    Ok(CountReport {
        dedup: cfg.dedup,
        rows: finished.rows,
        taxa: finished.taxa,
        diagnostics: diag,
    })
}
