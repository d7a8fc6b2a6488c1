//
// future.rs -- reusable, lock-free single-assignment completion future
//
// Copyright (c) 2019-2024 Jeff Garzik
//
// This file is part of the zb-map software project covered under
// the MIT License.  For the full license text, please see the LICENSE
// file in the root directory of this project.
// SPDX-License-Identifier: MIT

//! `CompletableFuture<T, E>` is the synchronisation primitive shared across
//! the wider system the map is embedded in. The CAS state machine and waiter
//! queue follow common lock-free idioms: cache-line-aware atomics with
//! explicit `Acquire`/`Release` discipline, and a waiter queue built directly
//! from `crossbeam-queue`'s `ArrayQueue`/`SegQueue` -- a bounded ring with
//! unbounded overflow.

use std::cell::{Cell, UnsafeCell};
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::{ArrayQueue, SegQueue};

use crate::error::Error;
use crate::Result;

const AWAITING: u8 = 0;
const COMPLETING: u8 = 1;
const COMPLETED: u8 = 2;
const COMPLETED_EXCEPTIONALLY: u8 = 3;
const CLOSED: u8 = 4;

const WAITER_RING_CAPACITY: usize = 32;

fn is_terminal(state: u8) -> bool {
    matches!(state, COMPLETED | COMPLETED_EXCEPTIONALLY | CLOSED)
}

thread_local! {
    static ACTOR_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Marks (or unmarks) the calling thread as an actor-scheduler worker.
/// `get()`/`get_timeout()` reject blocking calls from such threads with
/// [`Error::BlockingNotPermitted`]. The actor scheduler itself lives outside
/// this crate; this is the minimal hook a caller-supplied scheduler needs to
/// participate in that contract.
pub fn mark_current_thread_as_actor(is_actor: bool) {
    ACTOR_THREAD.with(|c| c.set(is_actor));
}

fn is_actor_thread() -> bool {
    ACTOR_THREAD.with(|c| c.get())
}

/// A terminal outcome observed by a blocking `get()`/`get_timeout()` call.
#[derive(Debug, Clone)]
pub enum Outcome<T, E> {
    Value(T),
    Failed { message: String, cause: Option<E> },
    Closed,
    TimedOut,
}

/// Terminal outcome delivered to a waiter's callback (see [`CompletableFuture::block`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Completed,
    CompletedExceptionally,
    Closed,
}

fn wait_outcome_for(state: u8) -> WaitOutcome {
    match state {
        COMPLETED => WaitOutcome::Completed,
        COMPLETED_EXCEPTIONALLY => WaitOutcome::CompletedExceptionally,
        CLOSED => WaitOutcome::Closed,
        _ => unreachable!("wait_outcome_for called on non-terminal state"),
    }
}

/// A waiter's callback, invoked at most once with the terminal outcome.
pub type Waiter = Box<dyn FnOnce(WaitOutcome) + Send>;

/// A reusable, single-writer completion future.
///
/// Created `closed`; call [`CompletableFuture::reset`] before the next round
/// of `complete`/`completeExceptionally`. Safe to share across threads:
/// state transitions are lock-free compare-and-swap, and the waiter queue is
/// a bounded lock-free ring with unbounded overflow.
pub struct CompletableFuture<T, E> {
    state: AtomicU8,
    value: UnsafeCell<Option<T>>,
    failure: UnsafeCell<Option<(String, Option<E>)>>,
    waiters: ArrayQueue<Waiter>,
    overflow: SegQueue<Waiter>,
}

// SAFETY: `value`/`failure` are only written while transitioning
// awaiting -> completing (exclusive access guaranteed by a successful CAS),
// and only read after observing a `Release`-published terminal state, so
// access is synchronized through `state` even though the cells themselves
// are not `Sync` on their own.
unsafe impl<T: Send, E: Send> Send for CompletableFuture<T, E> {}
unsafe impl<T: Send, E: Send> Sync for CompletableFuture<T, E> {}

impl<T, E> Default for CompletableFuture<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> CompletableFuture<T, E> {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(CLOSED),
            value: UnsafeCell::new(None),
            failure: UnsafeCell::new(None),
            waiters: ArrayQueue::new(WAITER_RING_CAPACITY),
            overflow: SegQueue::new(),
        }
    }

    /// Explicit `closed -> awaiting` reset, clearing any previous result.
    /// Not itself required to be atomic (only `awaiting -> completing` and
    /// `any -> closed` are CAS transitions); callers own the future
    /// exclusively between rounds.
    pub fn reset(&self) {
        unsafe {
            *self.value.get() = None;
            *self.failure.get() = None;
        }
        self.state.store(AWAITING, Ordering::Release);
    }

    /// Atomic CAS `awaiting -> completing`; on success, publishes `value`
    /// and drains waiters. Fails with [`Error::AlreadyCompleted`] if the
    /// future was not `awaiting`.
    pub fn complete(&self, value: T) -> Result<()> {
        self.state
            .compare_exchange(AWAITING, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::AlreadyCompleted)?;

        unsafe {
            *self.value.get() = Some(value);
        }
        self.state.store(COMPLETED, Ordering::Release);
        self.drain_waiters();
        Ok(())
    }

    /// Symmetric to [`CompletableFuture::complete`]; resulting state is
    /// `completed-exceptionally`.
    pub fn complete_exceptionally(&self, message: impl Into<String>, cause: Option<E>) -> Result<()> {
        self.state
            .compare_exchange(AWAITING, COMPLETING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::AlreadyCompleted)?;

        unsafe {
            *self.failure.get() = Some((message.into(), cause));
        }
        self.state.store(COMPLETED_EXCEPTIONALLY, Ordering::Release);
        self.drain_waiters();
        Ok(())
    }

    /// Enqueues `waiter` to run exactly once with the terminal outcome.
    /// Returns whether the future was still pending at enqueue time. If the
    /// future has already reached a terminal state, the waiter is invoked
    /// immediately from this call (never lost).
    pub fn block(&self, waiter: Waiter) -> bool {
        let state = self.state.load(Ordering::Acquire);
        if is_terminal(state) {
            waiter(wait_outcome_for(state));
            return false;
        }

        if let Err(waiter) = self.waiters.push(waiter) {
            self.overflow.push(waiter);
        }

        // A completion may have published between our load and our push;
        // re-check and drain ourselves so the waiter we just enqueued is
        // never stranded.
        if is_terminal(self.state.load(Ordering::Acquire)) {
            self.drain_waiters();
        }
        true
    }

    fn drain_waiters(&self) {
        let state = self.state.load(Ordering::Acquire);
        if !is_terminal(state) {
            return;
        }
        let outcome = wait_outcome_for(state);
        while let Some(waiter) = self.waiters.pop() {
            waiter(outcome);
        }
        while let Some(waiter) = self.overflow.pop() {
            waiter(outcome);
        }
    }

    /// Atomic swap to `closed`. Idempotent: if the future wasn't already
    /// closed, clears fields and drains waiters (they observe `Closed`,
    /// which counts as completion for cancellation purposes).
    pub fn close(&self) {
        let previous = self.state.swap(CLOSED, Ordering::AcqRel);
        if previous != CLOSED {
            unsafe {
                *self.value.get() = None;
                *self.failure.get() = None;
            }
            self.drain_waiters();
        }
    }

    /// Always fails: cancellation is not supported by design.
    pub fn cancel(&self) -> Result<()> {
        Err(Error::Unsupported)
    }
}

impl<T: Clone, E: Clone> CompletableFuture<T, E> {
    /// Blocks (spin-yielding) until the future reaches a terminal state.
    /// Fails with [`Error::BlockingNotPermitted`] when called from a thread
    /// marked via [`mark_current_thread_as_actor`].
    pub fn get(&self) -> Result<Outcome<T, E>> {
        self.get_timeout(None)
    }

    /// As [`CompletableFuture::get`], but returns `Outcome::TimedOut`
    /// instead of blocking forever once `timeout` elapses.
    pub fn get_timeout(&self, timeout: Option<Duration>) -> Result<Outcome<T, E>> {
        if is_actor_thread() {
            return Err(Error::BlockingNotPermitted);
        }

        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            let state = self.state.load(Ordering::Acquire);
            match state {
                COMPLETED => {
                    let value = unsafe { (*self.value.get()).clone() };
                    return Ok(Outcome::Value(value.expect("completed future missing value")));
                }
                COMPLETED_EXCEPTIONALLY => {
                    let (message, cause) =
                        unsafe { (*self.failure.get()).clone() }.expect("completed-exceptionally future missing failure");
                    return Ok(Outcome::Failed { message, cause });
                }
                CLOSED => return Ok(Outcome::Closed),
                _ => {
                    if let Some(deadline) = deadline {
                        if Instant::now() >= deadline {
                            return Ok(Outcome::TimedOut);
                        }
                    }
                    std::thread::yield_now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    #[test]
    fn reset_then_complete_then_get_returns_value() {
        let fut: CompletableFuture<i32, String> = CompletableFuture::new();
        fut.reset();
        fut.complete(42).unwrap();
        match fut.get().unwrap() {
            Outcome::Value(v) => assert_eq!(v, 42),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn complete_twice_fails_already_completed() {
        let fut: CompletableFuture<i32, String> = CompletableFuture::new();
        fut.reset();
        fut.complete(1).unwrap();
        assert!(matches!(fut.complete(2), Err(Error::AlreadyCompleted)));
    }

    #[test]
    fn get_on_actor_thread_rejected() {
        mark_current_thread_as_actor(true);
        let fut: CompletableFuture<i32, String> = CompletableFuture::new();
        fut.reset();
        fut.complete(1).unwrap();
        assert!(matches!(fut.get(), Err(Error::BlockingNotPermitted)));
        mark_current_thread_as_actor(false);
    }

    #[test]
    fn get_timeout_elapses_while_pending() {
        let fut: CompletableFuture<i32, String> = CompletableFuture::new();
        fut.reset();
        let outcome = fut.get_timeout(Some(Duration::from_millis(10))).unwrap();
        assert!(matches!(outcome, Outcome::TimedOut));
    }

    #[test]
    fn cancel_always_unsupported() {
        let fut: CompletableFuture<i32, String> = CompletableFuture::new();
        assert!(matches!(fut.cancel(), Err(Error::Unsupported)));
    }

    // Two threads race `complete`; exactly one wins, and every waiter
    // enqueued before completion sees `completed` exactly once.
    #[test]
    fn concurrent_complete_exactly_one_wins_all_waiters_notified() {
        let fut: Arc<CompletableFuture<i32, String>> = Arc::new(CompletableFuture::new());
        fut.reset();

        let notified = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let notified = Arc::clone(&notified);
            fut.block(Box::new(move |outcome| {
                assert_eq!(outcome, WaitOutcome::Completed);
                notified.fetch_add(1, AtomicOrdering::SeqCst);
            }));
        }

        let fut_a = Arc::clone(&fut);
        let fut_b = Arc::clone(&fut);
        let a = std::thread::spawn(move || fut_a.complete(1));
        let b = std::thread::spawn(move || fut_b.complete(2));

        let results = [a.join().unwrap(), b.join().unwrap()];
        let oks = results.iter().filter(|r| r.is_ok()).count();
        let already = results
            .iter()
            .filter(|r| matches!(r, Err(Error::AlreadyCompleted)))
            .count();
        assert_eq!(oks, 1);
        assert_eq!(already, 1);
        assert_eq!(notified.load(AtomicOrdering::SeqCst), 8);
    }

    // A waiter enqueues after `complete` has published; `block` returns
    // `false` but still invokes the callback.
    #[test]
    fn late_waiter_after_publish_gets_invoked_and_reports_not_pending() {
        let fut: CompletableFuture<i32, String> = CompletableFuture::new();
        fut.reset();
        fut.complete(7).unwrap();

        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked2 = Arc::clone(&invoked);
        let was_pending = fut.block(Box::new(move |outcome| {
            assert_eq!(outcome, WaitOutcome::Completed);
            invoked2.fetch_add(1, AtomicOrdering::SeqCst);
        }));

        assert!(!was_pending);
        assert_eq!(invoked.load(AtomicOrdering::SeqCst), 1);
    }

    #[test]
    fn close_drains_waiters_as_closed_outcome() {
        let fut: CompletableFuture<i32, String> = CompletableFuture::new();
        fut.reset();

        let invoked = Arc::new(AtomicUsize::new(0));
        let invoked2 = Arc::clone(&invoked);
        fut.block(Box::new(move |outcome| {
            assert_eq!(outcome, WaitOutcome::Closed);
            invoked2.fetch_add(1, AtomicOrdering::SeqCst);
        }));

        fut.close();
        assert_eq!(invoked.load(AtomicOrdering::SeqCst), 1);

        // idempotent: closing again does not re-drain or panic
        fut.close();
    }
}
