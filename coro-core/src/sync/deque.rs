//! Deque — a bounded, double-ended, closable channel.
//!
//! The internal bookkeeping lock is a plain [`parking_lot::Mutex`], never
//! held across a suspension point; waiting is layered on top of the same
//! address-keyed sleep the condition variable uses, with one address for
//! push-side waiters and one for pop-side.

use std::collections::VecDeque;
use std::time::Instant;

use parking_lot::Mutex;

use crate::coroutine::sleep::{self, Addr, SleepOutcome};
use crate::error::CoreError;

/// Returned by a push when it cannot be completed, carrying the item back
/// so the caller doesn't lose it.
#[derive(Debug)]
pub enum PushError<T> {
    Full(T),
    Closed(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    Empty,
    Closed,
}

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
    push_waiters: usize,
    pop_waiters: usize,
}

pub struct Deque<T> {
    max_size: usize,
    state: Mutex<Inner<T>>,
    push_addr: Addr,
    pop_addr: Addr,
}

enum Side {
    Front,
    Back,
}

impl<T> Deque<T> {
    pub fn new(max_size: usize) -> Self {
        assert!(max_size > 0, "Deque capacity must be positive");
        Self {
            max_size,
            state: Mutex::new(Inner {
                items: VecDeque::new(),
                closed: false,
                push_waiters: 0,
                pop_waiters: 0,
            }),
            push_addr: sleep::fresh_addr(),
            pop_addr: sleep::fresh_addr(),
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Wakes all waiters on both sides with `CLOSED`; subsequent pushes
    /// fail, pops keep succeeding until the queue drains and then fail too.
    pub fn close(&self) {
        {
            let mut inner = self.state.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
        }
        sleep::cancel_sleep_by_addr(self.push_addr, usize::MAX);
        sleep::cancel_sleep_by_addr(self.pop_addr, usize::MAX);
    }

    /// Permitted only while closed.
    pub fn reopen(&self) -> Result<(), CoreError> {
        let mut inner = self.state.lock();
        if !inner.closed {
            return Err(CoreError::invalid_input("reopen() called on a deque that isn't closed"));
        }
        inner.closed = false;
        Ok(())
    }

    fn notify_after_push(&self) {
        let (count, waiters) = {
            let inner = self.state.lock();
            (inner.items.len(), inner.pop_waiters)
        };
        sleep::cancel_sleep_by_addr(self.pop_addr, count.min(waiters));
    }

    fn notify_after_pop(&self) {
        let (free, waiters) = {
            let inner = self.state.lock();
            (self.max_size.saturating_sub(inner.items.len()), inner.push_waiters)
        };
        sleep::cancel_sleep_by_addr(self.push_addr, free.min(waiters));
    }

    fn try_push_side(&self, item: T, side: Side, force: bool) -> Result<(), PushError<T>> {
        let mut inner = self.state.lock();
        if inner.closed {
            return Err(PushError::Closed(item));
        }
        if !force && inner.items.len() >= self.max_size {
            return Err(PushError::Full(item));
        }
        match side {
            Side::Front => inner.items.push_front(item),
            Side::Back => inner.items.push_back(item),
        }
        drop(inner);
        self.notify_after_push();
        Ok(())
    }

    pub fn try_push_back(&self, item: T) -> Result<(), PushError<T>> {
        self.try_push_side(item, Side::Back, false)
    }

    pub fn try_push_front(&self, item: T) -> Result<(), PushError<T>> {
        self.try_push_side(item, Side::Front, false)
    }

    pub fn force_push_back(&self, item: T) -> Result<(), PushError<T>> {
        self.try_push_side(item, Side::Back, true)
    }

    pub fn force_push_front(&self, item: T) -> Result<(), PushError<T>> {
        self.try_push_side(item, Side::Front, true)
    }

    async fn push_side(&self, mut item: T, side: Side, deadline: Option<Instant>) -> Result<(), PushError<T>> {
        loop {
            match self.try_push_side(item, side_copy(&side), false) {
                Ok(()) => {
                    crate::coroutine::guard_yield().await;
                    return Ok(());
                }
                Err(PushError::Closed(returned)) => return Err(PushError::Closed(returned)),
                Err(PushError::Full(returned)) => item = returned,
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(PushError::Full(item));
                }
            }
            {
                let mut inner = self.state.lock();
                inner.push_waiters += 1;
            }
            let outcome = sleep::sleep(self.push_addr, deadline, false).await;
            {
                let mut inner = self.state.lock();
                inner.push_waiters = inner.push_waiters.saturating_sub(1);
            }
            match outcome {
                SleepOutcome::Success => return Err(PushError::Full(item)),
                SleepOutcome::Aborted => return Err(PushError::Full(item)),
                SleepOutcome::Canceled => continue,
            }
        }
    }

    pub async fn push_back(&self, item: T) -> Result<(), PushError<T>> {
        self.push_side(item, Side::Back, None).await
    }

    pub async fn push_front(&self, item: T) -> Result<(), PushError<T>> {
        self.push_side(item, Side::Front, None).await
    }

    pub async fn try_push_back_for(&self, item: T, deadline: Instant) -> Result<(), PushError<T>> {
        self.push_side(item, Side::Back, Some(deadline)).await
    }

    pub async fn try_push_front_for(&self, item: T, deadline: Instant) -> Result<(), PushError<T>> {
        self.push_side(item, Side::Front, Some(deadline)).await
    }

    fn try_pop_side(&self, side: Side) -> Result<T, PopError> {
        let mut inner = self.state.lock();
        let popped = match side {
            Side::Front => inner.items.pop_front(),
            Side::Back => inner.items.pop_back(),
        };
        match popped {
            Some(item) => {
                drop(inner);
                self.notify_after_pop();
                Ok(item)
            }
            None if inner.closed => Err(PopError::Closed),
            None => Err(PopError::Empty),
        }
    }

    pub fn try_pop_front(&self) -> Result<T, PopError> {
        self.try_pop_side(Side::Front)
    }

    pub fn try_pop_back(&self) -> Result<T, PopError> {
        self.try_pop_side(Side::Back)
    }

    async fn pop_side(&self, side: Side, deadline: Option<Instant>) -> Result<T, PopError> {
        loop {
            match self.try_pop_side(side_copy(&side)) {
                Ok(item) => {
                    crate::coroutine::guard_yield().await;
                    return Ok(item);
                }
                Err(PopError::Closed) => return Err(PopError::Closed),
                Err(PopError::Empty) => {}
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return Err(PopError::Empty);
                }
            }
            {
                let mut inner = self.state.lock();
                inner.pop_waiters += 1;
            }
            let outcome = sleep::sleep(self.pop_addr, deadline, false).await;
            {
                let mut inner = self.state.lock();
                inner.pop_waiters = inner.pop_waiters.saturating_sub(1);
            }
            match outcome {
                SleepOutcome::Success => return Err(PopError::Empty),
                SleepOutcome::Aborted => return Err(PopError::Empty),
                SleepOutcome::Canceled => continue,
            }
        }
    }

    pub async fn pop_front(&self) -> Result<T, PopError> {
        self.pop_side(Side::Front, None).await
    }

    pub async fn pop_back(&self) -> Result<T, PopError> {
        self.pop_side(Side::Back, None).await
    }

    pub async fn try_pop_front_for(&self, deadline: Instant) -> Result<T, PopError> {
        self.pop_side(Side::Front, Some(deadline)).await
    }

    pub async fn try_pop_back_for(&self, deadline: Instant) -> Result<T, PopError> {
        self.pop_side(Side::Back, Some(deadline)).await
    }

    /// Pushes `items` to the back atomically iff at least `items.len()`
    /// slots are free; otherwise pushes nothing and returns the vector back.
    pub fn try_push_range_back(&self, items: Vec<T>) -> Result<(), Vec<T>> {
        let mut inner = self.state.lock();
        if inner.closed || self.max_size - inner.items.len() < items.len() {
            return Err(items);
        }
        inner.items.extend(items);
        drop(inner);
        self.notify_after_push();
        Ok(())
    }

    /// Pops up to `want` elements from the front atomically iff at least
    /// `want` elements are present.
    pub fn try_pop_range_front(&self, want: usize) -> Result<Vec<T>, PopError> {
        let mut inner = self.state.lock();
        if inner.items.len() < want {
            return Err(if inner.closed && inner.items.is_empty() {
                PopError::Closed
            } else {
                PopError::Empty
            });
        }
        let drained: Vec<T> = inner.items.drain(0..want).collect();
        drop(inner);
        self.notify_after_pop();
        Ok(drained)
    }
}

fn side_copy(side: &Side) -> Side {
    match side {
        Side::Front => Side::Front,
        Side::Back => Side::Back,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_capacity_front_back_ordering() {
        let deque: Deque<i32> = Deque::new(3);
        deque.try_push_back(1).unwrap();
        deque.try_push_back(2).unwrap();
        deque.try_push_back(3).unwrap();
        assert!(matches!(deque.try_push_back(4), Err(PushError::Full(4))));
        assert_eq!(deque.try_pop_front().unwrap(), 1);
        deque.try_push_back(4).unwrap();
        assert_eq!(deque.try_pop_front().unwrap(), 2);
        assert_eq!(deque.try_pop_front().unwrap(), 3);
        assert_eq!(deque.try_pop_front().unwrap(), 4);
    }

    #[tokio::test]
    async fn close_drains_then_reports_closed() {
        let deque: Deque<i32> = Deque::new(2);
        deque.try_push_back(10).unwrap();
        deque.close();
        assert!(matches!(deque.try_push_back(1), Err(PushError::Closed(1))));
        assert_eq!(deque.pop_front().await.unwrap(), 10);
        assert_eq!(deque.pop_front().await.unwrap_err(), PopError::Closed);
    }

    #[tokio::test]
    async fn blocking_push_wakes_on_pop() {
        let deque = std::sync::Arc::new(Deque::new(1));
        deque.try_push_back(1).unwrap();
        let d2 = std::sync::Arc::clone(&deque);
        let pusher = tokio::spawn(async move { d2.push_back(2).await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(deque.try_pop_front().unwrap(), 1);
        pusher.await.unwrap().unwrap();
        assert_eq!(deque.try_pop_front().unwrap(), 2);
    }

    #[test]
    fn size_invariant_never_exceeds_capacity() {
        let deque: Deque<i32> = Deque::new(4);
        for i in 0..10 {
            let _ = deque.try_push_back(i);
            assert!(deque.len() <= deque.max_size());
        }
    }
}
