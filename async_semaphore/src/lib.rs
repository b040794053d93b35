#![deny(unused_must_use)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
  clippy::all,
  clippy::default_trait_access,
  clippy::expl_impl_clone_on_copy,
  clippy::if_not_else,
  clippy::needless_continue,
  clippy::single_match_else,
  clippy::unseparated_literal_suffix,
  clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
  clippy::len_without_is_empty,
  clippy::redundant_field_names,
  clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]
// Arc<Mutex> can be more clear than needing to grok Orderings:
#![allow(clippy::mutex_atomic)]


use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

/// A waiter parked in the queue. Holds the Waker to resume it, and (once woken with a permit)
/// the id it was handed off.
struct Waiter {
  state: Mutex<WaiterState>,
}

#[derive(Default)]
struct WaiterState {
  waker: Option<Waker>,
  granted_id: Option<usize>,
}

struct Inner {
  waiters: VecDeque<Arc<Waiter>>,
  // Ids not currently held by any Permit, smallest first.
  available_ids: BinaryHeap<Reverse<usize>>,
}

impl Inner {
  /// Release `id` back to the semaphore: hand it directly to the oldest waiter if one exists
  /// (preserving FIFO order), otherwise return it to the pool of available ids.
  fn release(inner: &Arc<Mutex<Inner>>, id: usize) {
    let waiter = {
      let mut locked = inner.lock();
      match locked.waiters.pop_front() {
        Some(waiter) => Some(waiter),
        None => {
          locked.available_ids.push(Reverse(id));
          None
        }
      }
    };
    if let Some(waiter) = waiter {
      let waker = {
        let mut state = waiter.state.lock();
        state.granted_id = Some(id);
        state.waker.take()
      };
      if let Some(waker) = waker {
        waker.wake();
      }
    }
  }
}

///
/// A semaphore with a fixed number of permits, each identified by a stable numeric id in
/// `1..=permits`. Acquirers are served in FIFO order; an id is handed directly from the
/// releasing Permit to the oldest waiter rather than round-tripping through the pool, so a
/// released id is reused as soon as there is anyone waiting for it.
///
#[derive(Clone)]
pub struct AsyncSemaphore {
  inner: Arc<Mutex<Inner>>,
}

impl AsyncSemaphore {
  pub fn new(permits: usize) -> AsyncSemaphore {
    AsyncSemaphore {
      inner: Arc::new(Mutex::new(Inner {
        waiters: VecDeque::new(),
        available_ids: (1..=permits).map(Reverse).collect(),
      })),
    }
  }

  ///
  /// Runs the given id-accepting Future-creating function (and the Future it returns) under the
  /// semaphore, releasing the acquired slot once the Future completes (or is dropped).
  ///
  pub fn with_acquired<F, B, O>(&self, f: F) -> impl Future<Output = O>
  where
    F: FnOnce(usize) -> B + Send + 'static,
    B: Future<Output = O> + Send + 'static,
  {
    let acquire = self.acquire();
    async move {
      let permit = acquire.await;
      f(permit.id).await
    }
  }

  ///
  /// Acquire a Permit, waiting until one is available. The returned Future removes itself from
  /// the wait queue if it is dropped before acquiring.
  ///
  pub fn acquire(&self) -> PermitFuture {
    PermitFuture {
      inner: self.inner.clone(),
      waiter: None,
    }
  }

  /// The number of tasks currently waiting (not yet holding a permit).
  pub fn num_waiters(&self) -> usize {
    self.inner.lock().waiters.len()
  }
}

///
/// A held slot in the semaphore, identified by `id`. Releases the slot back to the semaphore
/// (directly to the oldest waiter, if any) when dropped.
///
pub struct Permit {
  id: usize,
  inner: Arc<Mutex<Inner>>,
}

impl Drop for Permit {
  fn drop(&mut self) {
    Inner::release(&self.inner, self.id);
  }
}

pub struct PermitFuture {
  inner: Arc<Mutex<Inner>>,
  waiter: Option<Arc<Waiter>>,
}

impl Future for PermitFuture {
  type Output = Permit;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Permit> {
    let this = self.get_mut();

    if let Some(waiter) = &this.waiter {
      let mut state = waiter.state.lock();
      return match state.granted_id {
        Some(id) => {
          drop(state);
          this.waiter = None;
          Poll::Ready(Permit {
            id,
            inner: this.inner.clone(),
          })
        }
        None => {
          state.waker = Some(cx.waker().clone());
          Poll::Pending
        }
      };
    }

    let mut inner = this.inner.lock();
    if let Some(Reverse(id)) = inner.available_ids.pop() {
      drop(inner);
      Poll::Ready(Permit {
        id,
        inner: this.inner.clone(),
      })
    } else {
      let waiter = Arc::new(Waiter {
        state: Mutex::new(WaiterState {
          waker: Some(cx.waker().clone()),
          granted_id: None,
        }),
      });
      inner.waiters.push_back(waiter.clone());
      drop(inner);
      this.waiter = Some(waiter);
      Poll::Pending
    }
  }
}

impl Drop for PermitFuture {
  fn drop(&mut self) {
    let Some(waiter) = self.waiter.take() else {
      return;
    };
    // If a permit was already granted to this waiter (it raced with being dropped before being
    // polled again), pass it on rather than leaking the slot.
    let granted_id = waiter.state.lock().granted_id;
    if let Some(id) = granted_id {
      Inner::release(&self.inner, id);
      return;
    }
    let mut inner = self.inner.lock();
    inner.waiters.retain(|w| !Arc::ptr_eq(w, &waiter));
  }
}
