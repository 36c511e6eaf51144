//! Fixed worker pool fed through a bounded queue.
//!
//! The producer (reader, parser and batcher) runs on the calling thread and
//! blocks on `send` once the queue holds `queue_capacity` batches, so memory
//! stays bounded when workers fall behind. Every worker owns its state for the
//! whole run and hands it back at the end; nothing is shared mutably between
//! workers.
//!
//! The first failure anywhere (an error returned by a worker or the producer,
//! or a panic caught at the worker boundary) is kept, the queue is closed,
//! workers drain whatever is still queued without processing it, and the
//! pipeline returns that single error.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crossbeam_channel::{bounded, Sender};

use crate::batch::Batch;
use crate::error::{CountError, FirstErrorCapture, Result};
use crate::progress::ProgressReporter;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub label: &'static str,
    pub workers: usize,
    pub queue_capacity: usize,
    pub progress: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub batches_processed: u64,
    /// Most batches ever observed waiting in the queue.
    pub queue_high_water: usize,
}

/// The producer's handle on the queue.
pub struct BatchSink<'p, T> {
    tx: Sender<Batch<T>>,
    cancel: &'p AtomicBool,
    high_water: usize,
}

impl<T> BatchSink<'_, T> {
    /// Queues a batch, blocking while the queue is full.
    ///
    /// Fails once the pipeline has been cancelled so the producer stops
    /// reading; that error never outranks the one that caused the cancel.
    pub fn send(&mut self, batch: Batch<T>) -> Result<()> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(CountError::InternalFault(
                "pipeline cancelled after an earlier failure".to_string(),
            ));
        }
        self.tx
            .send(batch)
            .map_err(|_| CountError::InternalFault("all workers exited early".to_string()))?;
        self.high_water = self.high_water.max(self.tx.len());
        Ok(())
    }

    /// Sends `batch` if there is one.
    pub fn send_opt(&mut self, batch: Option<Batch<T>>) -> Result<()> {
        match batch {
            Some(batch) => self.send(batch),
            None => Ok(()),
        }
    }
}

/// Runs `produce` against a pool of `opts.workers` threads.
///
/// Each worker starts from `init()` and applies `work` to every batch it
/// receives. On success the worker states are returned (in worker order, which
/// carries no meaning) together with queue statistics.
pub fn run_pipeline<T, S, I, W, P>(
    opts: &PipelineOptions,
    init: I,
    work: W,
    produce: P,
) -> Result<(Vec<S>, PipelineStats)>
where
    T: Send,
    S: Send,
    I: Fn() -> S + Sync,
    W: Fn(&mut S, Batch<T>) -> Result<()> + Sync,
    P: FnOnce(&mut BatchSink<'_, T>) -> Result<()>,
{
    let workers = opts.workers.max(1);
    let (tx, rx) = bounded::<Batch<T>>(opts.queue_capacity.max(1));
    let errors = FirstErrorCapture::new();
    let cancel = AtomicBool::new(false);
    let processed = AtomicU64::new(0);
    let progress = ProgressReporter::new(opts.label, opts.progress);

    let fail = |err: CountError| {
        if errors.store(err) {
            log::debug!("{}: cancelling pipeline after first failure", opts.label);
        }
        cancel.store(true, Ordering::SeqCst);
    };

    log::debug!(
        "{}: starting {} workers, queue capacity {}",
        opts.label,
        workers,
        opts.queue_capacity
    );

    let (states, high_water) = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .map(|worker_id| {
                let rx = rx.clone();
                let (init, work, fail) = (&init, &work, &fail);
                let (cancel, processed, progress) = (&cancel, &processed, &progress);
                scope.spawn(move || {
                    let mut state = init();
                    for batch in rx.iter() {
                        if cancel.load(Ordering::SeqCst) {
                            continue;
                        }
                        let records = batch.records.len() as u64;
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| work(&mut state, batch)));
                        match outcome {
                            Ok(Ok(())) => {
                                processed.fetch_add(1, Ordering::Relaxed);
                                progress.batch_done(records);
                            }
                            Ok(Err(e)) => fail(e),
                            Err(payload) => fail(CountError::from_panic(
                                &format!("{} worker {}", opts.label, worker_id),
                                payload,
                            )),
                        }
                    }
                    state
                })
            })
            .collect();
        drop(rx);

        let mut sink = BatchSink {
            tx,
            cancel: &cancel,
            high_water: 0,
        };
        match panic::catch_unwind(AssertUnwindSafe(|| produce(&mut sink))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => fail(e),
            Err(payload) => fail(CountError::from_panic(
                &format!("{} producer", opts.label),
                payload,
            )),
        }
        let high_water = sink.high_water;
        // closing the queue lets workers run out
        drop(sink);

        let mut states = Vec::with_capacity(workers);
        for (worker_id, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(state) => states.push(state),
                Err(payload) => fail(CountError::from_panic(
                    &format!("{} worker {}", opts.label, worker_id),
                    payload,
                )),
            }
        }
        (states, high_water)
    });
    progress.finish();

    if let Some(err) = errors.take() {
        log::debug!("{}: failed: {}", opts.label, err);
        return Err(err);
    }

    let stats = PipelineStats {
        batches_processed: processed.load(Ordering::Relaxed),
        queue_high_water: high_water,
    };
    log::info!(
        "{}: {} batches, queue peaked at {} of {}",
        opts.label,
        stats.batches_processed,
        stats.queue_high_water,
        opts.queue_capacity.max(1)
    );
    Ok((states, stats))
}
