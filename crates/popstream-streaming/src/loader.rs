//! Loader interface for byte-range fetches, plus an in-memory implementation.
//!
//! Loads are fire-and-forget: the extension queues them and the loader
//! reports completion through a [`LoadSink`] whenever it is done, from any
//! thread. Completions are consumed at the start of the next tick.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use crossbeam_channel::Sender;

use crate::error::FetchError;

/// Identifies one queued load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoadHandle(pub u64);

/// Per-request load options. Cloning yields an independent snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadOptions {
    seek_offset: u64,
    seeked_length: Option<u64>,
}

impl LoadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start reading at `offset` bytes into the resource.
    pub fn seek_offset(mut self, offset: u64) -> Self {
        self.seek_offset = offset;
        self
    }

    /// Read only `length` bytes (a partial load).
    pub fn seeked_length(mut self, length: u64) -> Self {
        self.seeked_length = Some(length);
        self
    }

    pub fn offset(&self) -> u64 {
        self.seek_offset
    }

    pub fn length(&self) -> Option<u64> {
        self.seeked_length
    }

    /// Byte range covered by these options within a resource of `len` bytes.
    pub fn byte_range(&self, len: u64) -> Range<u64> {
        let end = self
            .seeked_length
            .map_or(len, |l| self.seek_offset.saturating_add(l));
        self.seek_offset..end
    }
}

/// Outcome of a load, delivered to the extension.
#[derive(Debug)]
pub enum LoadEvent {
    Complete { handle: LoadHandle, bytes: Vec<u8> },
    Failed { handle: LoadHandle, error: FetchError },
}

/// Completion channel handed to the loader with every queued load.
#[derive(Clone, Debug)]
pub struct LoadSink {
    sender: Sender<LoadEvent>,
}

impl LoadSink {
    pub(crate) fn new(sender: Sender<LoadEvent>) -> Self {
        Self { sender }
    }

    /// Report the loaded bytes. Ignored if the extension is gone.
    pub fn complete(&self, handle: LoadHandle, bytes: Vec<u8>) {
        let _ = self.sender.send(LoadEvent::Complete { handle, bytes });
    }

    /// Report a failed load. Ignored if the extension is gone.
    pub fn fail(&self, handle: LoadHandle, error: FetchError) {
        let _ = self.sender.send(LoadEvent::Failed { handle, error });
    }
}

/// External byte-range loader.
pub trait Loader: Send + Sync {
    /// Queue a read of `resource` as described by `options`. The result must
    /// eventually be reported through `sink`, or never if the load is lost.
    fn queue(&self, handle: LoadHandle, resource: &str, options: LoadOptions, sink: LoadSink);

    /// Start processing everything queued since the last call.
    fn load(&self);
}

/// A load recorded by [`MemoryLoader`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoadRecord {
    pub handle: LoadHandle,
    pub resource: String,
    pub options: LoadOptions,
}

struct QueuedLoad {
    record: LoadRecord,
    sink: LoadSink,
}

/// Serves byte ranges of in-memory resources.
///
/// In immediate mode every `load()` call completes all queued reads. In
/// manual mode reads stay pending until released one by one or flushed,
/// which lets callers control arrival order.
pub struct MemoryLoader {
    resources: RwLock<HashMap<String, Arc<[u8]>>>,
    queued: Mutex<Vec<QueuedLoad>>,
    history: Mutex<Vec<LoadRecord>>,
    manual: bool,
}

impl MemoryLoader {
    /// A loader that completes reads on every `load()` call.
    pub fn new() -> Self {
        Self::with_mode(false)
    }

    /// A loader whose reads complete only when released explicitly.
    pub fn manual() -> Self {
        Self::with_mode(true)
    }

    fn with_mode(manual: bool) -> Self {
        Self {
            resources: RwLock::new(HashMap::new()),
            queued: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            manual,
        }
    }

    /// Register (or replace) a resource.
    pub fn insert(&self, resource: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource.into(), bytes.into());
    }

    /// Handles of reads that have not completed yet, in queue order.
    pub fn pending(&self) -> Vec<LoadHandle> {
        lock(&self.queued).iter().map(|q| q.record.handle).collect()
    }

    /// Every read ever queued, in queue order.
    pub fn history(&self) -> Vec<LoadRecord> {
        lock(&self.history).clone()
    }

    /// Complete one pending read. Returns `false` if it is not pending.
    pub fn release(&self, handle: LoadHandle) -> bool {
        let load = {
            let mut queued = lock(&self.queued);
            let Some(pos) = queued.iter().position(|q| q.record.handle == handle) else {
                return false;
            };
            queued.remove(pos)
        };
        self.serve(load);
        true
    }

    /// Fail one pending read with `error`.
    pub fn fail(&self, handle: LoadHandle, error: FetchError) -> bool {
        let mut queued = lock(&self.queued);
        let Some(pos) = queued.iter().position(|q| q.record.handle == handle) else {
            return false;
        };
        let load = queued.remove(pos);
        load.sink.fail(handle, error);
        true
    }

    /// Forget a pending read without ever answering it.
    pub fn drop_pending(&self, handle: LoadHandle) -> bool {
        let mut queued = lock(&self.queued);
        let before = queued.len();
        queued.retain(|q| q.record.handle != handle);
        queued.len() != before
    }

    /// Complete every pending read.
    pub fn flush(&self) {
        let loads = std::mem::take(&mut *lock(&self.queued));
        for load in loads {
            self.serve(load);
        }
    }

    fn serve(&self, load: QueuedLoad) {
        let QueuedLoad { record, sink } = load;
        let data = self
            .resources
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&record.resource)
            .cloned();
        let Some(data) = data else {
            sink.fail(record.handle, FetchError::NotFound(record.resource));
            return;
        };

        let len = data.len() as u64;
        let range = record.options.byte_range(len);
        if range.start > range.end || range.end > len {
            sink.fail(
                record.handle,
                FetchError::OutOfRange {
                    start: range.start,
                    end: range.end,
                    len,
                },
            );
            return;
        }
        sink.complete(
            record.handle,
            data[range.start as usize..range.end as usize].to_vec(),
        );
    }
}

impl Default for MemoryLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl Loader for MemoryLoader {
    fn queue(&self, handle: LoadHandle, resource: &str, options: LoadOptions, sink: LoadSink) {
        let record = LoadRecord {
            handle,
            resource: resource.to_string(),
            options,
        };
        lock(&self.history).push(record.clone());
        lock(&self.queued).push(QueuedLoad { record, sink });
    }

    fn load(&self) {
        if !self.manual {
            self.flush();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (LoadSink, crossbeam_channel::Receiver<LoadEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (LoadSink::new(tx), rx)
    }

    fn loader(manual: bool) -> MemoryLoader {
        let loader = if manual { MemoryLoader::manual() } else { MemoryLoader::new() };
        loader.insert("mesh", (0u8..100).collect::<Vec<_>>());
        loader
    }

    #[test]
    fn test_serves_requested_range() {
        let loader = loader(false);
        let (sink, rx) = sink();
        loader.queue(
            LoadHandle(1),
            "mesh",
            LoadOptions::new().seek_offset(10).seeked_length(5),
            sink,
        );
        loader.load();

        match rx.try_recv().unwrap() {
            LoadEvent::Complete { handle, bytes } => {
                assert_eq!(handle, LoadHandle(1));
                assert_eq!(bytes, vec![10, 11, 12, 13, 14]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_partial_header_load() {
        let loader = loader(false);
        let (sink, rx) = sink();
        loader.queue(LoadHandle(1), "mesh", LoadOptions::new().seeked_length(8), sink);
        loader.load();
        assert!(matches!(
            rx.try_recv().unwrap(),
            LoadEvent::Complete { bytes, .. } if bytes.len() == 8
        ));
    }

    #[test]
    fn test_missing_resource_and_bad_range_fail() {
        let loader = loader(false);
        let (sink, rx) = sink();
        loader.queue(LoadHandle(1), "nope", LoadOptions::new(), sink.clone());
        loader.queue(
            LoadHandle(2),
            "mesh",
            LoadOptions::new().seek_offset(90).seeked_length(20),
            sink,
        );
        loader.load();

        let events: Vec<_> = rx.try_iter().collect();
        assert!(matches!(
            &events[0],
            LoadEvent::Failed { error: FetchError::NotFound(_), .. }
        ));
        assert!(matches!(
            &events[1],
            LoadEvent::Failed { error: FetchError::OutOfRange { end: 110, .. }, .. }
        ));
    }

    #[test]
    fn test_manual_mode_releases_in_chosen_order() {
        let loader = loader(true);
        let (sink, rx) = sink();
        for h in 1..=3 {
            loader.queue(
                LoadHandle(h),
                "mesh",
                LoadOptions::new().seek_offset(h).seeked_length(1),
                sink.clone(),
            );
        }
        loader.load();
        assert!(rx.try_recv().is_err(), "manual loader must not complete on load()");
        assert_eq!(loader.pending(), vec![LoadHandle(1), LoadHandle(2), LoadHandle(3)]);

        assert!(loader.release(LoadHandle(3)));
        assert!(loader.drop_pending(LoadHandle(2)));
        loader.flush();

        let handles: Vec<_> = rx
            .try_iter()
            .map(|e| match e {
                LoadEvent::Complete { handle, .. } | LoadEvent::Failed { handle, .. } => handle,
            })
            .collect();
        assert_eq!(handles, vec![LoadHandle(3), LoadHandle(1)]);
        assert_eq!(loader.history().len(), 3);
    }

    /// Cloned options are independent snapshots.
    #[test]
    fn test_options_clone_is_independent() {
        let base = LoadOptions::new().seeked_length(64);
        let derived = base.clone().seek_offset(128);
        assert_eq!(base.offset(), 0);
        assert_eq!(derived.offset(), 128);
        assert_eq!(derived.byte_range(1000), 128..192);
        assert_eq!(LoadOptions::new().byte_range(50), 0..50);
    }
}
