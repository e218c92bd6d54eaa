//! Camera context and the frame source seam.
//!
//! `Camera` is constructed once before serving and shared by reference with
//! every handler. Its mutex is the single ownership token for the driver's
//! buffer pool: at most one frame buffer is outstanding process-wide, and
//! an acquisition never interleaves with another handler's.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use crate::error::{CamError, Result};
use crate::frame::{FrameBuffer, FrameGuard};

const LOCK_POLL: Duration = Duration::from_millis(5);

/// A camera driver, or anything that behaves like one.
///
/// `acquire` blocks until the driver fills a buffer or faults. Every buffer
/// it returns must come back through `release` exactly once; `Camera`
/// guarantees that for its callers.
pub trait FrameSource: Send {
    fn acquire(&mut self) -> Result<FrameBuffer>;

    fn release(&mut self, frame: FrameBuffer);

    /// Short human-readable description for logs.
    fn describe(&self) -> String;

    fn is_healthy(&self) -> bool {
        true
    }
}

/// Acquisition counters.
#[derive(Debug, Default)]
pub struct CameraStats {
    acquired: AtomicU64,
    released: AtomicU64,
    failed: AtomicU64,
}

impl CameraStats {
    pub(crate) fn record_release(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    pub fn acquired(&self) -> u64 {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::SeqCst)
    }

    /// Buffers currently held by a guard (0 or 1).
    pub fn outstanding(&self) -> u64 {
        self.acquired().saturating_sub(self.released())
    }
}

pub struct Camera {
    source: Mutex<Box<dyn FrameSource>>,
    stats: CameraStats,
    description: String,
}

impl Camera {
    pub fn new(source: Box<dyn FrameSource>) -> Self {
        let description = source.describe();
        Self {
            source: Mutex::new(source),
            stats: CameraStats::default(),
            description,
        }
    }

    /// Acquire one frame. The returned guard releases it on drop.
    ///
    /// Blocks while another handler holds a frame.
    pub fn acquire(&self) -> Result<FrameGuard<'_>> {
        let source = self
            .source
            .lock()
            .map_err(|_| CamError::unavailable("camera lock poisoned"))?;
        self.acquire_locked(source)
    }

    /// Like `acquire`, but gives up with `CamError::Busy` once another
    /// handler has held the camera for `wait`. A frame holder can be parked
    /// on a slow client, so request handlers use this form.
    pub fn acquire_timeout(&self, wait: Duration) -> Result<FrameGuard<'_>> {
        let deadline = Instant::now() + wait;
        loop {
            match self.source.try_lock() {
                Ok(source) => return self.acquire_locked(source),
                Err(TryLockError::Poisoned(_)) => {
                    return Err(CamError::unavailable("camera lock poisoned"))
                }
                Err(TryLockError::WouldBlock) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CamError::Busy(wait));
                    }
                    std::thread::sleep(LOCK_POLL.min(deadline - now));
                }
            }
        }
    }

    fn acquire_locked<'a>(
        &'a self,
        mut source: MutexGuard<'a, Box<dyn FrameSource>>,
    ) -> Result<FrameGuard<'a>> {
        match source.acquire() {
            Ok(frame) => {
                self.stats.acquired.fetch_add(1, Ordering::SeqCst);
                Ok(FrameGuard::new(source, &self.stats, frame))
            }
            Err(err) => {
                self.stats.failed.fetch_add(1, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    /// Run `f` against one frame and release it afterwards, whatever `f` returns.
    pub fn with_frame<T>(&self, f: impl FnOnce(&FrameBuffer) -> T) -> Result<T> {
        let frame = self.acquire()?;
        Ok(f(&frame))
    }

    pub fn stats(&self) -> &CameraStats {
        &self.stats
    }

    pub fn describe(&self) -> &str {
        &self.description
    }

    pub fn is_healthy(&self) -> bool {
        match self.source.try_lock() {
            Ok(source) => source.is_healthy(),
            // Busy means a handler is mid-frame, which is healthy.
            Err(TryLockError::WouldBlock) => true,
            Err(TryLockError::Poisoned(_)) => false,
        }
    }
}

impl std::fmt::Debug for Camera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Camera")
            .field("source", &self.description)
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Ownership events observed by a `ScriptedSource`.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum Event {
        Acquire(u64),
        Release(u64),
        Fail,
    }

    /// Source that serves a fixed list of payloads, then fails.
    pub struct ScriptedSource {
        payloads: Vec<Vec<u8>>,
        next: usize,
        pub log: Arc<Mutex<Vec<Event>>>,
    }

    impl ScriptedSource {
        pub fn new(payloads: Vec<Vec<u8>>) -> Self {
            Self {
                payloads,
                next: 0,
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl FrameSource for ScriptedSource {
        fn acquire(&mut self) -> Result<FrameBuffer> {
            let Some(payload) = self.payloads.get(self.next).cloned() else {
                self.log.lock().unwrap().push(Event::Fail);
                return Err(CamError::unavailable("script exhausted"));
            };
            self.next += 1;
            let seq = self.next as u64;
            self.log.lock().unwrap().push(Event::Acquire(seq));
            FrameBuffer::new_jpeg(payload, 2, 2, seq)
        }

        fn release(&mut self, frame: FrameBuffer) {
            self.log.lock().unwrap().push(Event::Release(frame.sequence));
        }

        fn describe(&self) -> String {
            "scripted".to_string()
        }
    }

    pub fn jpeg(len: usize) -> Vec<u8> {
        let mut data = vec![0x42; len.max(4)];
        data[0] = 0xFF;
        data[1] = 0xD8;
        data
    }
}
