//! Counting fence: `add` before handing out work, `done` per finished
//! item, `wait` until the count returns to zero.

use std::sync::{Condvar, Mutex};

#[derive(Default)]
pub struct WaitGroup {
    count: Mutex<usize>,
    zero: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `n` outstanding items.
    pub fn add(&self, n: usize) {
        *self.count.lock().unwrap() += n;
    }

    /// Mark one item finished.
    pub fn done(&self) {
        let mut count = self.count.lock().unwrap();
        debug_assert!(*count > 0, "WaitGroup::done called more often than add");
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    /// Block until every added item is done.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count != 0 {
            count = self.zero.wait(count).unwrap();
        }
    }

    /// Outstanding items right now.
    pub fn count(&self) -> usize {
        *self.count.lock().unwrap()
    }
}
