//! Bounded-concurrency parser pool.
//!
//! A fixed set of worker threads pulls decode jobs from a FIFO queue, so at
//! most `capacity` decodes run at once while further submissions wait their
//! turn instead of being rejected. Results are collected on the tick thread
//! via [`drain_results`](ParserPool::drain_results).

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::JoinHandle;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashMap;
use popstream_lod::LodRange;
use tracing::{debug, trace, warn};

use crate::decoder::PopDecoder;
use crate::error::DecodeError;
use crate::geometry::{GeometryDelta, StreamHeader, StreamId};

/// Identifies one submitted job; results carry it back.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(pub u64);

/// What a job decodes.
#[derive(Clone, Debug)]
pub enum ParseKind {
    /// A header-only load.
    Header,
    /// The blocks of `range`, described by `header`.
    Levels {
        /// Header of the stream the blocks belong to.
        header: Arc<StreamHeader>,
        /// Levels contained in the job's bytes.
        range: LodRange,
    },
}

/// Fetched bytes waiting to be decoded.
#[derive(Clone, Debug)]
pub struct ParseJob {
    /// Ticket returned with the result.
    pub ticket: Ticket,
    /// Stream the bytes belong to.
    pub stream: StreamId,
    /// What the bytes contain.
    pub kind: ParseKind,
    /// The fetched bytes.
    pub bytes: Vec<u8>,
}

/// Successful decode output.
#[derive(Clone, Debug)]
pub enum ParsedPayload {
    Header(StreamHeader),
    Levels(Vec<GeometryDelta>),
}

/// A finished job.
#[derive(Debug)]
pub struct ParseResult {
    pub ticket: Ticket,
    pub stream: StreamId,
    pub outcome: Result<ParsedPayload, DecodeError>,
    /// Decode time in microseconds (for profiling).
    pub decode_time_us: u64,
}

struct QueuedJob {
    job: ParseJob,
    cancelled: Arc<AtomicBool>,
}

#[derive(Default)]
struct PoolCounters {
    queued: AtomicUsize,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

/// Fixed-size pool of decode workers.
pub struct ParserPool {
    /// Sender for submitting jobs; `None` after shutdown.
    job_sender: Option<Sender<QueuedJob>>,
    /// Receiver for collecting results on the tick thread.
    result_receiver: Receiver<ParseResult>,
    workers: Vec<JoinHandle<()>>,
    capacity: usize,
    counters: Arc<PoolCounters>,
    /// Cancellation flag and owning stream of every queued or running job.
    jobs: Arc<DashMap<Ticket, (StreamId, Arc<AtomicBool>)>>,
}

impl ParserPool {
    /// Spawn `capacity` workers (at least one) sharing `decoder`.
    pub fn new(capacity: usize, decoder: Arc<dyn PopDecoder>) -> std::io::Result<Self> {
        let capacity = capacity.max(1);
        let (job_tx, job_rx) = crossbeam_channel::unbounded::<QueuedJob>();
        let (result_tx, result_rx) = crossbeam_channel::unbounded();
        let counters = Arc::new(PoolCounters::default());
        let jobs: Arc<DashMap<Ticket, (StreamId, Arc<AtomicBool>)>> = Arc::new(DashMap::new());

        let mut workers = Vec::with_capacity(capacity);
        for index in 0..capacity {
            let rx = job_rx.clone();
            let tx = result_tx.clone();
            let decoder = Arc::clone(&decoder);
            let counters = Arc::clone(&counters);
            let jobs = Arc::clone(&jobs);

            let handle = std::thread::Builder::new()
                .name(format!("pop-parser-{index}"))
                .spawn(move || {
                    while let Ok(queued) = rx.recv() {
                        counters.queued.fetch_sub(1, Ordering::SeqCst);
                        let ticket = queued.job.ticket;

                        // Skip work for streams closed while the job was queued.
                        if queued.cancelled.load(Ordering::Relaxed) {
                            jobs.remove(&ticket);
                            continue;
                        }

                        let active = counters.active.fetch_add(1, Ordering::SeqCst) + 1;
                        counters.peak_active.fetch_max(active, Ordering::SeqCst);

                        let start = Instant::now();
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                            run_job(decoder.as_ref(), &queued.job)
                        }))
                        .unwrap_or_else(|payload| {
                            let message = panic_message(payload.as_ref());
                            warn!("Decoder panicked on ticket {}: {message}", ticket.0);
                            Err(DecodeError::DecoderPanicked(message))
                        });
                        let decode_time_us = start.elapsed().as_micros() as u64;
                        trace!("Decoded ticket {} in {decode_time_us} us", ticket.0);

                        counters.active.fetch_sub(1, Ordering::SeqCst);
                        jobs.remove(&ticket);

                        if queued.cancelled.load(Ordering::Relaxed) {
                            continue;
                        }
                        let _ = tx.send(ParseResult {
                            ticket,
                            stream: queued.job.stream,
                            outcome,
                            decode_time_us,
                        });
                    }
                })?;
            workers.push(handle);
        }

        debug!("Parser pool started with {capacity} workers");
        Ok(Self {
            job_sender: Some(job_tx),
            result_receiver: result_rx,
            workers,
            capacity,
            counters,
            jobs,
        })
    }

    /// Queue a job. Jobs beyond capacity wait in FIFO order.
    ///
    /// Returns `Err(job)` only after [`shutdown`](Self::shutdown).
    #[allow(clippy::result_large_err)]
    pub fn submit(&self, job: ParseJob) -> Result<(), ParseJob> {
        let Some(sender) = &self.job_sender else {
            return Err(job);
        };
        let cancelled = Arc::new(AtomicBool::new(false));
        self.jobs
            .insert(job.ticket, (job.stream, Arc::clone(&cancelled)));
        self.counters.queued.fetch_add(1, Ordering::SeqCst);

        sender.send(QueuedJob { job, cancelled }).map_err(|e| {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            let job = e.into_inner().job;
            self.jobs.remove(&job.ticket);
            job
        })
    }

    /// Drop every queued or running job of `stream`. Running decodes finish
    /// but their results are discarded. Returns the number of jobs affected.
    pub fn cancel_stream(&self, stream: StreamId) -> usize {
        let mut cancelled = 0;
        self.jobs.retain(|_, (owner, flag)| {
            if *owner == stream {
                flag.store(true, Ordering::Relaxed);
                cancelled += 1;
                false
            } else {
                true
            }
        });
        if cancelled > 0 {
            debug!("Cancelled {cancelled} decode jobs of {stream}");
        }
        cancelled
    }

    /// Drain all finished jobs. Call once per tick.
    pub fn drain_results(&self) -> Vec<ParseResult> {
        self.result_receiver.try_iter().collect()
    }

    /// Maximum number of concurrent decodes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Decodes running right now.
    pub fn active_count(&self) -> usize {
        self.counters.active.load(Ordering::SeqCst)
    }

    /// Jobs waiting for a free worker.
    pub fn queued_count(&self) -> usize {
        self.counters.queued.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent decodes observed so far.
    pub fn peak_active(&self) -> usize {
        self.counters.peak_active.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs and join the workers once the queue is drained.
    pub fn shutdown(&mut self) {
        if self.job_sender.take().is_some() {
            debug!("Shutting down parser pool");
        }
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for ParserPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn run_job(decoder: &dyn PopDecoder, job: &ParseJob) -> Result<ParsedPayload, DecodeError> {
    match &job.kind {
        ParseKind::Header => decoder.parse_header(&job.bytes).map(ParsedPayload::Header),
        ParseKind::Levels { header, range } => decoder
            .decode(header, *range, &job.bytes)
            .map(ParsedPayload::Levels),
    }
}
