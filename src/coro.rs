//! Cooperative coroutine runtime.
//!
//! Each client thread runs up to [`crate::config::MAX_CORO_NUM`] workers as
//! local futures on a single-thread executor, multiplexed over one
//! transport queue. A worker yields in exactly two places: after posting a
//! signaled verb (resumed when the completion carrying its work id is
//! polled) and while waiting on a local-lock ticket (resumed when its
//! predicate turns true). The master tick drains at most one completion
//! and then services at most one predicate waiter, re-queuing it if the
//! predicate still fails — so neither source can starve the other.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::dsm::Dsm;
use crate::transport::WrId;

type Predicate = Box<dyn Fn() -> bool>;

struct BusyWaiter {
    coro_id: u16,
    pred: Predicate,
    ready: Rc<Cell<bool>>,
    waker: Waker,
}

/// Per-thread resume bookkeeping shared by the master and its workers.
#[derive(Default)]
pub struct CoroRuntime {
    completed: RefCell<HashMap<WrId, usize>>,
    wakers: RefCell<HashMap<WrId, Waker>>,
    busy: RefCell<VecDeque<BusyWaiter>>,
}

impl CoroRuntime {
    pub fn new() -> Rc<Self> {
        Rc::new(Self::default())
    }

    /// Record a polled completion and resume the coroutine it names.
    pub fn complete(&self, wr: WrId) {
        *self.completed.borrow_mut().entry(wr).or_insert(0) += 1;
        if let Some(w) = self.wakers.borrow_mut().remove(&wr) {
            w.wake();
        }
    }

    /// One master tick: at most one completion, then one busy waiter.
    /// Returns whether anything was resumed.
    pub fn tick(&self, dsm: &Dsm) -> bool {
        let mut progressed = false;
        if let Some(id) = dsm.poll_once() {
            self.complete(id);
            progressed = true;
        }
        let waiter = self.busy.borrow_mut().pop_front();
        if let Some(w) = waiter {
            if (w.pred)() {
                w.ready.set(true);
                w.waker.wake();
                progressed = true;
            } else {
                self.busy.borrow_mut().push_back(w);
            }
        }
        progressed
    }

    pub fn pending_waiters(&self) -> usize {
        self.busy.borrow().len()
    }
}

/// Handle identifying one coroutine to the verbs it posts.
#[derive(Clone)]
pub struct CoroSink {
    coro_id: u16,
    rt: Rc<CoroRuntime>,
}

impl CoroSink {
    pub fn new(coro_id: u16, rt: Rc<CoroRuntime>) -> Self {
        Self { coro_id, rt }
    }

    pub fn coro_id(&self) -> u16 {
        self.coro_id
    }

    /// The work id this coroutine's signaled verbs carry.
    pub fn wr_id(&self) -> WrId {
        self.coro_id as WrId
    }

    /// Suspend until the completion carrying `wr` is polled.
    pub(crate) fn wait_wr(&self, wr: WrId) -> WrWait {
        WrWait { rt: self.rt.clone(), wr }
    }

    /// Suspend until the master finds `pred` true.
    pub(crate) fn wait_until(&self, pred: impl Fn() -> bool + 'static) -> PredicateWait {
        PredicateWait {
            rt: self.rt.clone(),
            coro_id: self.coro_id,
            pred: Some(Box::new(pred)),
            ready: Rc::new(Cell::new(false)),
            queued: false,
        }
    }

    /// Give the master one turn; cooperative backoff under contention.
    pub(crate) fn yield_once(&self) -> PredicateWait {
        self.wait_until(|| true)
    }
}

pub(crate) struct WrWait {
    rt: Rc<CoroRuntime>,
    wr: WrId,
}

impl Future for WrWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        let mut completed = this.rt.completed.borrow_mut();
        match completed.get_mut(&this.wr) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Poll::Ready(())
            }
            _ => {
                this.rt
                    .wakers
                    .borrow_mut()
                    .insert(this.wr, cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

pub(crate) struct PredicateWait {
    rt: Rc<CoroRuntime>,
    coro_id: u16,
    pred: Option<Predicate>,
    ready: Rc<Cell<bool>>,
    queued: bool,
}

impl Future for PredicateWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        if this.ready.get() {
            return Poll::Ready(());
        }
        if !this.queued {
            let pred = this.pred.take().unwrap_or_else(|| Box::new(|| true));
            this.rt.busy.borrow_mut().push_back(BusyWaiter {
                coro_id: this.coro_id,
                pred,
                ready: this.ready.clone(),
                waker: cx.waker().clone(),
            });
            this.queued = true;
        }
        Poll::Pending
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<CoroRuntime>>> = RefCell::new(None);
}

/// Install the runtime driving the current thread's workers; returns the
/// previous one so callers can restore it.
pub(crate) fn set_current(rt: Option<Rc<CoroRuntime>>) -> Option<Rc<CoroRuntime>> {
    CURRENT.with(|c| std::mem::replace(&mut *c.borrow_mut(), rt))
}

/// Route a completion that a synchronous poll drained but does not own to
/// the coroutine runtime of this thread, if one is active.
pub(crate) fn deliver_foreign(wr: WrId) {
    CURRENT.with(|c| {
        if let Some(rt) = &*c.borrow() {
            rt.complete(wr);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::executor::LocalPool;
    use futures::task::LocalSpawnExt;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[test]
    fn predicate_waiters_resume_when_true() {
        let rt = CoroRuntime::new();
        let sink = CoroSink::new(0, rt.clone());
        let flag = Arc::new(AtomicBool::new(false));
        let done = Rc::new(Cell::new(false));

        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        {
            let flag = flag.clone();
            let done = done.clone();
            spawner
                .spawn_local(async move {
                    sink.wait_until(move || flag.load(Ordering::Relaxed)).await;
                    done.set(true);
                })
                .unwrap();
        }

        pool.run_until_stalled();
        assert!(!done.get());
        assert_eq!(rt.pending_waiters(), 1);

        // predicate still false: waiter is re-queued, not woken
        let waiter = rt.busy.borrow_mut().pop_front().unwrap();
        assert!(!(waiter.pred)());
        rt.busy.borrow_mut().push_back(waiter);

        flag.store(true, Ordering::Relaxed);
        let waiter = rt.busy.borrow_mut().pop_front().unwrap();
        assert!((waiter.pred)());
        waiter.ready.set(true);
        waiter.waker.wake();
        pool.run_until_stalled();
        assert!(done.get());
    }

    #[test]
    fn completions_resume_by_work_id() {
        let rt = CoroRuntime::new();
        let done = Rc::new(Cell::new(0u32));

        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        for coro_id in 0..2u16 {
            let sink = CoroSink::new(coro_id, rt.clone());
            let done = done.clone();
            spawner
                .spawn_local(async move {
                    sink.wait_wr(sink.wr_id()).await;
                    done.set(done.get() + 1);
                })
                .unwrap();
        }
        pool.run_until_stalled();
        assert_eq!(done.get(), 0);

        rt.complete(1);
        pool.run_until_stalled();
        assert_eq!(done.get(), 1);

        rt.complete(0);
        pool.run_until_stalled();
        assert_eq!(done.get(), 2);
    }

    #[test]
    fn early_completion_is_not_lost() {
        let rt = CoroRuntime::new();
        rt.complete(4);
        let sink = CoroSink::new(4, rt.clone());
        let mut pool = LocalPool::new();
        let spawner = pool.spawner();
        let done = Rc::new(Cell::new(false));
        {
            let done = done.clone();
            spawner
                .spawn_local(async move {
                    sink.wait_wr(4).await;
                    done.set(true);
                })
                .unwrap();
        }
        pool.run_until_stalled();
        assert!(done.get());
    }
}
