//! Commit tokens: grouping of the frames one logical operation touched, and the
//! barrier the flush task uses to take a consistent cut of dirty frames.
//!
//! A writer holds a [`CommitToken`] while it mutates frames; every mutation
//! stamps the row with the token id and registers the frame in the pool's
//! dirty table. The flush task takes a [`FlushToken`] through
//! [`TokenPool::acquire_exclusive`]: it closes the gate for new tokens, spins
//! until the live tokens drain, takes the next id as the sync barrier and moves
//! the dirty table into its cut. Writers that run while the cut is being
//! written preserve pre-barrier rows in each frame's snapshot overlay.

use std::{
    collections::HashSet,
    sync::{
        atomic::{fence, AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    thread::{self, ThreadId},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
    error::{FrameError, Result},
    frame::FrameId,
};

/// A frame as seen by the flush protocol.
pub trait FlushFrame: Send + Sync {
    fn frame_id(&self) -> FrameId;

    /// The frame is part of the cut taken at `barrier`.
    fn begin_flush(&self, barrier: i64);

    /// Byte image as of `barrier`. With `live` set, the current rows are used as is.
    fn serialize_at(&self, barrier: i64, live: bool) -> Result<Vec<u8>>;

    /// The cut taken at `barrier` is done; `written` tells whether the image reached disk.
    fn finish_flush(&self, barrier: i64, written: bool);
}

struct PoolShared {
    next_id: AtomicI64,
    live: DashMap<ThreadId, i64>,
    gate_closed: AtomicBool,
    exclusive_held: AtomicBool,
    barrier: AtomicI64,
    dirty: DashMap<FrameId, Arc<dyn FlushFrame>>,
    exclusive_row_locking: bool,
}

impl PoolShared {
    fn spin_until(&self, mut done: impl FnMut() -> bool) {
        let mut spins = 0u32;
        while !done() {
            if spins < 64 {
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
            spins = spins.saturating_add(1);
        }
    }
}

/// Process-wide pool of live commit tokens plus the dirty-frame table.
#[derive(Clone)]
pub struct TokenPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for TokenPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenPool")
            .field("live", &self.shared.live.len())
            .field("dirty", &self.shared.dirty.len())
            .field("barrier", &self.barrier())
            .finish()
    }
}

impl TokenPool {
    pub fn new(exclusive_row_locking: bool) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                next_id: AtomicI64::new(1),
                live: DashMap::new(),
                gate_closed: AtomicBool::new(false),
                exclusive_held: AtomicBool::new(false),
                barrier: AtomicI64::new(0),
                dirty: DashMap::new(),
                exclusive_row_locking,
            }),
        }
    }

    /// Acquire a token for the calling thread. Tokens are not reentrant.
    pub fn acquire(&self) -> Result<CommitToken> {
        let shared = &self.shared;
        let thread = thread::current().id();
        if shared.live.contains_key(&thread) {
            return Err(FrameError::TokenAlreadyExists);
        }
        loop {
            shared.spin_until(|| !shared.gate_closed.load(Ordering::SeqCst));
            shared.live.insert(thread, 0);
            fence(Ordering::SeqCst);
            if !shared.gate_closed.load(Ordering::SeqCst) {
                break;
            }
            // Lost the race against a flush closing the gate; back off until it reopens.
            shared.live.remove(&thread);
        }
        let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
        shared.live.insert(thread, id);
        trace!(token = id, "commit token acquired");
        Ok(CommitToken {
            id,
            thread,
            shared: Arc::clone(shared),
            touched: Mutex::new(HashSet::new()),
        })
    }

    /// Close the gate, wait for every live token to finish, and take the
    /// current dirty frames as the cut of a new flush.
    pub fn acquire_exclusive(&self) -> Result<FlushToken> {
        let shared = &self.shared;
        if shared.live.contains_key(&thread::current().id()) {
            return Err(FrameError::TokenAlreadyExists);
        }
        shared.spin_until(|| {
            shared
                .exclusive_held
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        });
        shared.gate_closed.store(true, Ordering::SeqCst);
        fence(Ordering::SeqCst);
        debug!(live = shared.live.len(), "waiting for live commit tokens to drain");
        shared.spin_until(|| shared.live.is_empty());

        let barrier = shared.next_id.fetch_add(1, Ordering::SeqCst);
        shared.barrier.store(barrier, Ordering::SeqCst);

        let ids: Vec<FrameId> = shared.dirty.iter().map(|entry| *entry.key()).collect();
        let mut frames = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some((_, frame)) = shared.dirty.remove(&id) {
                frame.begin_flush(barrier);
                frames.push(frame);
            }
        }
        if !shared.exclusive_row_locking {
            shared.gate_closed.store(false, Ordering::SeqCst);
        }
        debug!(barrier, frames = frames.len(), "flush cut taken");
        Ok(FlushToken {
            barrier,
            shared: Arc::clone(shared),
            frames,
            finished: false,
        })
    }

    /// The active sync barrier, if a flush is in progress.
    pub fn barrier(&self) -> Option<i64> {
        match self.shared.barrier.load(Ordering::SeqCst) {
            0 => None,
            barrier => Some(barrier),
        }
    }

    pub fn exclusive_row_locking(&self) -> bool {
        self.shared.exclusive_row_locking
    }

    pub fn live_tokens(&self) -> usize {
        self.shared.live.len()
    }

    pub fn dirty_frames(&self) -> usize {
        self.shared.dirty.len()
    }

    pub fn is_dirty(&self, frame: FrameId) -> bool {
        self.shared.dirty.contains_key(&frame)
    }
}

/// Groups the frames mutated by one logical operation on one thread.
pub struct CommitToken {
    id: i64,
    thread: ThreadId,
    shared: Arc<PoolShared>,
    touched: Mutex<HashSet<FrameId>>,
}

impl std::fmt::Debug for CommitToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitToken").field("id", &self.id).finish()
    }
}

impl CommitToken {
    pub fn id(&self) -> i64 {
        self.id
    }

    /// Record `frame` as dirty since the last flush.
    pub fn register(&self, frame: Arc<dyn FlushFrame>) {
        let id = frame.frame_id();
        self.touched.lock().insert(id);
        self.shared.dirty.insert(id, frame);
    }

    pub fn touched(&self) -> Vec<FrameId> {
        self.touched.lock().iter().copied().collect()
    }

    /// Finish the logical operation. The touched frames stay in the dirty table
    /// and become part of the next flush cut.
    pub fn commit(self) -> usize {
        let touched = self.touched.lock().len();
        trace!(token = self.id, frames = touched, "commit token committed");
        touched
    }
}

impl Drop for CommitToken {
    fn drop(&mut self) {
        self.shared.live.remove(&self.thread);
    }
}

/// The flush task's exclusive token: the barrier id and the frames of the cut.
pub struct FlushToken {
    barrier: i64,
    shared: Arc<PoolShared>,
    frames: Vec<Arc<dyn FlushFrame>>,
    finished: bool,
}

impl std::fmt::Debug for FlushToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushToken")
            .field("barrier", &self.barrier)
            .field("frames", &self.frames.len())
            .finish()
    }
}

impl FlushToken {
    pub fn barrier(&self) -> i64 {
        self.barrier
    }

    pub fn frames(&self) -> &[Arc<dyn FlushFrame>] {
        &self.frames
    }

    pub fn exclusive_row_locking(&self) -> bool {
        self.shared.exclusive_row_locking
    }

    /// Mark every frame of the cut flush-safe, drop their snapshot overlays and
    /// release the barrier.
    pub fn commit(mut self) {
        for frame in &self.frames {
            frame.finish_flush(self.barrier, true);
        }
        self.release();
        debug!(barrier = self.barrier, frames = self.frames.len(), "flush committed");
    }

    fn release(&mut self) {
        self.finished = true;
        self.shared.barrier.store(0, Ordering::SeqCst);
        self.shared.gate_closed.store(false, Ordering::SeqCst);
        self.shared.exclusive_held.store(false, Ordering::SeqCst);
    }
}

impl Drop for FlushToken {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // The flush failed part way: hand the cut back to the dirty table.
        for frame in &self.frames {
            frame.finish_flush(self.barrier, false);
            self.shared
                .dirty
                .entry(frame.frame_id())
                .or_insert_with(|| Arc::clone(frame));
        }
        self.release();
        debug!(barrier = self.barrier, "flush abandoned, cut returned to dirty table");
    }
}
