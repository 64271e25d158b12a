// SPDX-License-Identifier: MIT OR Apache-2.0

//! Timed presentation queue.
//!
//! Callers submit (surface, clip, earliest-time) tasks from any thread; a
//! dedicated worker per queue orders them by (earliest time, submission
//! order) and hands each buffer to the display device no earlier than its
//! eligible time. The submitting side retains the surface's buffer slot, so
//! a queued or visible buffer can never be reclaimed or mutated in place;
//! the render pipeline forks instead.
//!
//! The worker blocks on `recv_timeout` with the next deadline as the bound.
//! There is no spin loop, and no lock is held across a device call.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::buffer::PixelBuffer;
use crate::cache::CacheHandle;
use crate::clock;
use crate::context::DriverContext;
use crate::display::{DisplayDevice, FrameHandoff};
use crate::error::{Result, SurfaceError};
use crate::geometry::{min_nz, Color, Rect};
use crate::surface::{Surface, SurfaceId};

/// Upper bound on one worker wait, so a shutdown or flush sent while the
/// queue is idle is noticed promptly.
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

enum Task {
    Present(PresentTask),
    Flush,
    Shutdown,
}

struct PresentTask {
    seq: u64,
    earliest_ns: u64,
    surface: Arc<Surface>,
    /// Buffer snapshot at submission; `None` presents the empty layer.
    buffer: Option<(CacheHandle, Arc<PixelBuffer>)>,
    generation: Option<u64>,
    clip_width: u32,
    clip_height: u32,
}

/// Min-heap ordering: earliest eligible time first, submission order on ties.
struct Pending(PresentTask);

impl Pending {
    fn key(&self) -> (u64, u64) {
        (self.0.earliest_ns, self.0.seq)
    }
}

impl PartialEq for Pending {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Pending {}

impl PartialOrd for Pending {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Pending {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.key().cmp(&self.key())
    }
}

/// A timed hand-off pipeline onto one display device.
pub struct PresentationQueue {
    ctx: Arc<DriverContext>,
    sender: Sender<Task>,
    worker: Option<JoinHandle<()>>,
    background: Mutex<Color>,
    seq: AtomicU64,
}

impl PresentationQueue {
    /// Create a queue and spawn its worker thread.
    pub fn new(ctx: Arc<DriverContext>, device: Box<dyn DisplayDevice>) -> Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let worker_ctx = Arc::clone(&ctx);
        let worker = std::thread::Builder::new()
            .name("presentation-queue".into())
            .spawn(move || {
                Worker {
                    ctx: worker_ctx,
                    device,
                    receiver,
                    pending: BinaryHeap::new(),
                    visible: None,
                }
                .run()
            })
            .map_err(|e| SurfaceError::Resources(format!("queue worker spawn failed: {e}")))?;
        Ok(Self {
            ctx,
            sender,
            worker: Some(worker),
            background: Mutex::new(Color::TRANSPARENT),
            seq: AtomicU64::new(0),
        })
    }

    /// Submit a surface for display no earlier than `earliest_ns`.
    ///
    /// The surface transitions to `Queued` and its current buffer slot is
    /// retained until the frame is retired or flushed. Zero clip dimensions
    /// mean "no clip".
    pub fn display(
        &self,
        id: SurfaceId,
        clip_width: u32,
        clip_height: u32,
        earliest_ns: u64,
    ) -> Result<()> {
        let surface = self.ctx.surface(id)?;
        let buffer = surface.buffer();
        let generation = buffer.as_ref().map(|(_, b)| b.generation());
        if let Some((handle, _)) = &buffer {
            self.ctx.cache().retain(*handle);
        }
        surface.mark_queued();

        let task = PresentTask {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            earliest_ns,
            surface,
            buffer,
            generation,
            clip_width,
            clip_height,
        };
        trace!(surface = id.raw(), earliest_ns, "presentation queued");
        self.send(Task::Present(task))
    }

    /// Discard all pending tasks without displaying them. Their surfaces
    /// return to `Idle` and their buffer references are released.
    pub fn flush(&self) -> Result<()> {
        self.send(Task::Flush)
    }

    pub fn set_background_color(&self, color: Color) {
        *self.background.lock() = color;
    }

    pub fn background_color(&self) -> Color {
        *self.background.lock()
    }

    /// The queue's notion of "now", in nanoseconds.
    pub fn current_time(&self) -> u64 {
        clock::now_ns()
    }

    /// Stop the worker: pending tasks are flushed, the visible frame is
    /// retired, and the thread is joined. Also runs on `Drop`.
    pub fn destroy(&mut self) {
        let _ = self.sender.send(Task::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("presentation worker panicked");
            }
        }
    }

    fn send(&self, task: Task) -> Result<()> {
        self.sender.send(task).map_err(|e| {
            // Roll back the enqueue bookkeeping if the worker is gone.
            if let Task::Present(task) = e.into_inner() {
                if let Some((handle, _)) = task.buffer {
                    self.ctx.cache().release(handle);
                }
                task.surface.mark_idle();
            }
            SurfaceError::Display("presentation worker is not running".into())
        })
    }
}

impl Drop for PresentationQueue {
    fn drop(&mut self) {
        self.destroy();
    }
}

struct VisibleFrame {
    surface: Arc<Surface>,
    handle: Option<CacheHandle>,
    generation: Option<u64>,
}

struct Worker {
    ctx: Arc<DriverContext>,
    device: Box<dyn DisplayDevice>,
    receiver: Receiver<Task>,
    pending: BinaryHeap<Pending>,
    visible: Option<VisibleFrame>,
}

impl Worker {
    fn run(mut self) {
        loop {
            let timeout = match self.pending.peek() {
                Some(next) => clock::until(next.0.earliest_ns).min(POLL_INTERVAL),
                None => POLL_INTERVAL,
            };
            match self.receiver.recv_timeout(timeout) {
                Ok(Task::Present(task)) => self.pending.push(Pending(task)),
                Ok(Task::Flush) => self.drain(),
                Ok(Task::Shutdown) => break,
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.pump();
        }
        self.drain();
        self.retire_visible();
        debug!("presentation worker stopped");
    }

    /// Display every task whose eligible time has arrived.
    fn pump(&mut self) {
        while self
            .pending
            .peek()
            .is_some_and(|next| next.0.earliest_ns <= clock::now_ns())
        {
            if let Some(next) = self.pending.pop() {
                self.present(next.0);
            }
        }
    }

    fn present(&mut self, task: PresentTask) {
        let coalesce = self
            .visible
            .as_ref()
            .is_some_and(|vis| vis.generation == task.generation);

        if coalesce {
            // Content already on screen: skip the device round-trip, only
            // the status bookkeeping advances.
            trace!(generation = ?task.generation, "presentation coalesced");
        } else {
            self.hand_off(&task);
        }

        self.retire_visible();
        task.surface.mark_visible(clock::now_ns());
        self.visible = Some(VisibleFrame {
            surface: task.surface,
            handle: task.buffer.map(|(handle, _)| handle),
            generation: task.generation,
        });
    }

    /// Drive the device for one frame. Device failures are soft: the frame
    /// is dropped with a warning and the queue keeps running.
    fn hand_off(&mut self, task: &PresentTask) {
        match &task.buffer {
            Some((_, buffer)) => {
                // No upcoming write: settle any stale recycled content now.
                buffer.clear_if_needed(&Rect::default());
                if buffer.take_needs_flush() {
                    trace!("buffer flushed for scan-out");
                }
                let dirty = buffer.status().dirty;
                let outcome = if dirty.is_empty() {
                    self.device.close_layer()
                } else {
                    let frame = FrameHandoff {
                        buffer: Arc::clone(buffer),
                        generation: buffer.generation(),
                        src_rect: dirty,
                        screen_rect: Rect::new(
                            0,
                            0,
                            min_nz(task.clip_width, buffer.width()),
                            min_nz(task.clip_height, buffer.height()),
                        ),
                    };
                    self.device.set_layer(&frame)
                };
                if let Err(e) = outcome {
                    warn!(error = %e, "display hand-off failed");
                }
            }
            None => {
                if let Err(e) = self.device.close_layer() {
                    warn!(error = %e, "display close failed");
                }
            }
        }
        if let Err(e) = self.device.wait_vsync() {
            warn!(error = %e, "vsync wait failed");
        }
    }

    /// Previous visible frame leaves the screen: wake idle waiters and give
    /// back its buffer reference.
    fn retire_visible(&mut self) {
        if let Some(vis) = self.visible.take() {
            vis.surface.mark_idle();
            if let Some(handle) = vis.handle {
                self.ctx.cache().release(handle);
            }
        }
    }

    /// Discard all pending tasks without hand-offs.
    fn drain(&mut self) {
        let dropped = self.pending.len();
        while let Some(next) = self.pending.pop() {
            let task = next.0;
            task.surface.mark_idle();
            if let Some((handle, _)) = task.buffer {
                self.ctx.cache().release(handle);
            }
        }
        if dropped > 0 {
            debug!(dropped, "pending presentations flushed");
        }
    }
}
