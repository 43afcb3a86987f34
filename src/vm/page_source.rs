//! Page Sources and Pager Requests
//!
//! Based on the Mach external memory object protocol.
//!
//! A page source supplies the initial contents of a pager-backed root
//! object. The protocol mirrors data_request / data_supply:
//! 1. A fault that finds no page asks the root's source via `get_page`
//! 2. The source queues a request packet and answers `ShouldWait`
//! 3. The faulting thread drops the tree lock and waits on its request
//! 4. The pager supplies pages into the object; the source is told via
//!    `on_pages_supplied` and completes every overlapping waiter
//! 5. `close` is sent once the object is destroyed
//!
//! Requests may batch: a commit collects adjacent missing offsets into one
//! request and sends it with `finalize_request`.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use spin::{Mutex, Once};

use super::vm_error::{VmError, VmResult};
use super::vm_page::{PageNum, PAGE_SIZE};

/// Run once per turn of a pager wait in place of the spin hint
static WAIT_HOOK: Once<fn()> = Once::new();

/// Install the pager wait hook; the first caller wins
///
/// A hosted environment passes its scheduler's yield so waiting threads
/// give up the CPU to the pager.
pub fn set_wait_hook(hook: fn()) {
    WAIT_HOOK.call_once(|| hook);
}

// ============================================================================
// Page Source Contract
// ============================================================================

/// Provider of initial page contents for a root object
pub trait PageSource: Send + Sync {
    /// Ask for the page at `offset`
    ///
    /// A synchronous source returns a freshly allocated page, which the
    /// object takes ownership of. An asynchronous source records the offset
    /// in `request` and returns `ShouldWait`. A detached source returns
    /// `NotFound`.
    fn get_page(&self, offset: u64, request: &mut PageRequest) -> VmResult<PageNum>;

    /// Pages in `[offset, offset + len)` are now resident, or no longer
    /// needed because the object shrank
    fn on_pages_supplied(&self, offset: u64, len: u64);

    /// Send a batched request; `ShouldWait` if the caller must wait
    fn finalize_request(&self, request: &mut PageRequest) -> VmResult<()>;

    /// The owning object is gone
    fn close(&self);
}

// ============================================================================
// Page Requests
// ============================================================================

/// Completion shared between a waiter and the pager
#[derive(Debug, Default)]
pub struct Completion {
    done: AtomicBool,
    failed: Mutex<Option<VmError>>,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wake the waiter
    pub fn signal(&self, status: VmResult<()>) {
        if let Err(err) = status {
            *self.failed.lock() = Some(err);
        }
        self.done.store(true, Ordering::Release);
    }

    pub fn is_signaled(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    fn status(&self) -> VmResult<()> {
        match *self.failed.lock() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Request state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Nothing recorded
    Idle,
    /// Collecting adjacent offsets
    Batching,
    /// Handed to the source; waiting is possible
    Sent,
}

/// Wait token for an outstanding page request
///
/// Owned by the faulting thread. Dropping it while the request is in
/// flight is allowed; the source completes into nothing.
#[derive(Debug)]
pub struct PageRequest {
    offset: u64,
    len: u64,
    allow_batching: bool,
    state: RequestState,
    completion: Option<Arc<Completion>>,
}

impl PageRequest {
    /// Single-page request
    pub fn new() -> Self {
        Self {
            offset: 0,
            len: 0,
            allow_batching: false,
            state: RequestState::Idle,
            completion: None,
        }
    }

    /// Request that may collect a run of adjacent offsets
    pub fn new_batching() -> Self {
        Self {
            allow_batching: true,
            ..Self::new()
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn allows_batching(&self) -> bool {
        self.allow_batching
    }

    /// Still accepting offsets?
    pub fn is_batch_open(&self) -> bool {
        self.allow_batching && self.state == RequestState::Batching
    }

    /// Recorded range
    pub fn range(&self) -> (u64, u64) {
        (self.offset, self.len)
    }

    /// End of the recorded range
    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// Start recording at `offset`
    pub fn init(&mut self, offset: u64) {
        self.offset = offset;
        self.len = PAGE_SIZE as u64;
        self.state = RequestState::Batching;
        self.completion = None;
    }

    /// Extend the recorded range by one page
    pub fn extend(&mut self) {
        debug_assert_eq!(self.state, RequestState::Batching);
        self.len += PAGE_SIZE as u64;
    }

    /// Mark as sent, attaching the completion the source will signal
    pub fn mark_sent(&mut self, completion: Arc<Completion>) {
        self.completion = Some(completion);
        self.state = RequestState::Sent;
    }

    /// Block until the source completes the request
    ///
    /// Must be called without any tree lock held. Returns the pager's
    /// verdict; the request is reset for reuse either way.
    pub fn wait(&mut self) -> VmResult<()> {
        let completion = match self.completion.take() {
            Some(completion) => completion,
            None => {
                self.reset();
                return Ok(());
            }
        };
        while !completion.is_signaled() {
            match WAIT_HOOK.get() {
                Some(hook) => hook(),
                None => core::hint::spin_loop(),
            }
        }
        self.reset();
        completion.status()
    }

    fn reset(&mut self) {
        self.offset = 0;
        self.len = 0;
        self.state = RequestState::Idle;
        self.completion = None;
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Pager Source
// ============================================================================

/// Pager lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerState {
    /// Serving requests
    Ready,
    /// Pager went away; faults resolve per the miss policy
    Detached,
    /// Owning object destroyed
    Closed,
}

/// Message queued for the pager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagerPacket {
    /// Supply `[offset, offset + length)`
    DataRequest { offset: u64, length: u64 },
    /// The object is gone; no further requests will arrive
    Complete,
}

#[derive(Debug)]
struct OutstandingRequest {
    offset: u64,
    length: u64,
    completion: Arc<Completion>,
}

impl OutstandingRequest {
    fn overlaps(&self, offset: u64, len: u64) -> bool {
        offset < self.offset + self.length && self.offset < offset.saturating_add(len)
    }
}

#[derive(Debug)]
struct PagerInner {
    state: PagerState,
    outstanding: Vec<OutstandingRequest>,
    packets: VecDeque<PagerPacket>,
}

/// Pager statistics
#[derive(Debug, Default)]
pub struct PagerStats {
    pub data_requests: AtomicU64,
    pub data_supplies: AtomicU64,
    pub abandoned: AtomicU64,
}

/// Page source backed by an external pager
///
/// The pager drains request packets with [`PagerSource::next_packet`] and
/// answers by supplying pages to the object.
#[derive(Debug)]
pub struct PagerSource {
    inner: Mutex<PagerInner>,
    stats: PagerStats,
}

impl PagerSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PagerInner {
                state: PagerState::Ready,
                outstanding: Vec::new(),
                packets: VecDeque::new(),
            }),
            stats: PagerStats::default(),
        })
    }

    pub fn state(&self) -> PagerState {
        self.inner.lock().state
    }

    /// Next queued packet for the pager
    pub fn next_packet(&self) -> Option<PagerPacket> {
        self.inner.lock().packets.pop_front()
    }

    /// Requests sent but not yet completed
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding.len()
    }

    pub fn stats(&self) -> &PagerStats {
        &self.stats
    }

    /// The pager is going away
    ///
    /// Every outstanding waiter is woken and refaults; further misses see
    /// `NotFound`.
    pub fn detach(&self) {
        let mut inner = self.inner.lock();
        if inner.state == PagerState::Ready {
            inner.state = PagerState::Detached;
        }
        for req in inner.outstanding.drain(..) {
            req.completion.signal(Ok(()));
        }
        log::debug!("pager source detached");
    }

    /// The pager cannot satisfy `[offset, offset + len)`
    pub fn fail_range(&self, offset: u64, len: u64, err: VmError) {
        self.complete_overlapping(offset, len, Err(err));
    }

    fn send(&self, inner: &mut PagerInner, request: &mut PageRequest) {
        let (offset, length) = request.range();
        let completion = Completion::new();

        // Waiters whose token was dropped are no longer interesting
        let before = inner.outstanding.len();
        inner
            .outstanding
            .retain(|req| Arc::strong_count(&req.completion) > 1);
        let abandoned = before - inner.outstanding.len();
        if abandoned > 0 {
            self.stats
                .abandoned
                .fetch_add(abandoned as u64, Ordering::Relaxed);
        }

        inner.outstanding.push(OutstandingRequest {
            offset,
            length,
            completion: completion.clone(),
        });
        inner
            .packets
            .push_back(PagerPacket::DataRequest { offset, length });
        self.stats.data_requests.fetch_add(1, Ordering::Relaxed);
        request.mark_sent(completion);
        log::trace!("pager request {:#x}+{:#x}", offset, length);
    }

    fn complete_overlapping(&self, offset: u64, len: u64, status: VmResult<()>) {
        let mut inner = self.inner.lock();
        inner.outstanding.retain(|req| {
            if req.overlaps(offset, len) {
                req.completion.signal(status);
                false
            } else {
                true
            }
        });
    }
}

impl PageSource for PagerSource {
    fn get_page(&self, offset: u64, request: &mut PageRequest) -> VmResult<PageNum> {
        let mut inner = self.inner.lock();
        if inner.state != PagerState::Ready {
            return Err(VmError::NotFound);
        }

        if !request.allows_batching() {
            request.init(offset);
            self.send(&mut inner, request);
            return Err(VmError::ShouldWait);
        }

        match request.state() {
            RequestState::Idle => request.init(offset),
            RequestState::Batching if request.end() == offset => request.extend(),
            // Not adjacent: flush what we have, the caller retries this offset
            RequestState::Batching => self.send(&mut inner, request),
            RequestState::Sent => {}
        }
        Err(VmError::ShouldWait)
    }

    fn on_pages_supplied(&self, offset: u64, len: u64) {
        self.stats.data_supplies.fetch_add(1, Ordering::Relaxed);
        self.complete_overlapping(offset, len, Ok(()));
    }

    fn finalize_request(&self, request: &mut PageRequest) -> VmResult<()> {
        match request.state() {
            RequestState::Idle => Ok(()),
            RequestState::Sent => Err(VmError::ShouldWait),
            RequestState::Batching => {
                let mut inner = self.inner.lock();
                if inner.state != PagerState::Ready {
                    request.reset();
                    return Err(VmError::NotFound);
                }
                self.send(&mut inner, request);
                Err(VmError::ShouldWait)
            }
        }
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        inner.state = PagerState::Closed;
        for req in inner.outstanding.drain(..) {
            req.completion.signal(Err(VmError::BadState));
        }
        inner.packets.push_back(PagerPacket::Complete);
    }
}
