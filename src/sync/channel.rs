//! Closable MPMC work channel.
//!
//! A thin layer over `crossbeam_channel` that adds an explicit `close()`:
//! once closed, blocked senders and receivers wake up, sends fail, and
//! receivers drain whatever is still queued before reporting `Closed`.

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::{self as channel, Receiver, Sender, TrySendError, select};

use crate::core::error::Error;
use crate::core::types::Result;

pub struct WorkChannel<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
    /// Dropped on close; receivers of `shutdown_rx` then wake with a disconnect.
    shutdown_tx: Mutex<Option<Sender<()>>>,
    shutdown_rx: Receiver<()>,
    closed: AtomicBool,
}

impl<T> WorkChannel<T> {
    /// Create a channel holding at most `capacity` items. Zero means unbounded.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = if capacity == 0 {
            channel::unbounded()
        } else {
            channel::bounded(capacity)
        };
        let (shutdown_tx, shutdown_rx) = channel::bounded(0);
        Self {
            tx,
            rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            shutdown_rx,
            closed: AtomicBool::new(false),
        }
    }

    /// Send, blocking while the channel is full. Fails with `Closed` if the
    /// channel is or becomes closed before the value is queued.
    pub fn send(&self, value: T) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        select! {
            send(self.tx, value) -> res => res.map_err(|_| Error::Closed),
            recv(self.shutdown_rx) -> _ => Err(Error::Closed),
        }
    }

    /// Send every value in order, blocking as needed.
    pub fn send_many<I: IntoIterator<Item = T>>(&self, values: I) -> Result<()> {
        for value in values {
            self.send(value)?;
        }
        Ok(())
    }

    /// Non-blocking send. Hands the value back when full or closed.
    pub fn try_send(&self, value: T) -> std::result::Result<(), TrySendError<T>> {
        if self.is_closed() {
            return Err(TrySendError::Disconnected(value));
        }
        self.tx.try_send(value)
    }

    /// Receive the next value, blocking until one arrives. Returns `Closed`
    /// only once the channel is closed and empty.
    pub fn receive(&self) -> Result<T> {
        loop {
            if let Ok(value) = self.rx.try_recv() {
                return Ok(value);
            }
            if self.is_closed() {
                return Err(Error::Closed);
            }
            select! {
                recv(self.rx) -> msg => return msg.map_err(|_| Error::Closed),
                recv(self.shutdown_rx) -> _ => continue,
            }
        }
    }

    /// Take everything currently queued without blocking.
    pub fn drain(&self) -> Vec<T> {
        self.rx.try_iter().collect()
    }

    /// Close the channel and wake all blocked senders and receivers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown_tx.lock().unwrap().take();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let ch = WorkChannel::new(8);
        ch.send_many([1, 2, 3]).unwrap();
        assert_eq!(ch.len(), 3);
        assert_eq!(ch.receive().unwrap(), 1);
        assert_eq!(ch.receive().unwrap(), 2);
        assert_eq!(ch.receive().unwrap(), 3);
        assert!(ch.is_empty());
    }

    #[test]
    fn test_try_send_full() {
        let ch = WorkChannel::new(1);
        ch.try_send(1).unwrap();
        assert!(matches!(ch.try_send(2), Err(TrySendError::Full(2))));
    }

    #[test]
    fn test_close_drains_then_reports_closed() {
        let ch = WorkChannel::new(0);
        ch.send(7).unwrap();
        ch.close();
        assert!(matches!(ch.send(8), Err(Error::Closed)));
        assert!(matches!(ch.try_send(9), Err(TrySendError::Disconnected(9))));
        assert_eq!(ch.receive().unwrap(), 7);
        assert!(matches!(ch.receive(), Err(Error::Closed)));
    }

    #[test]
    fn test_close_wakes_blocked_receivers() {
        let ch = Arc::new(WorkChannel::<u32>::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ch = ch.clone();
                thread::spawn(move || ch.receive())
            })
            .collect();
        thread::sleep(Duration::from_millis(20));
        ch.close();
        for h in handles {
            assert!(matches!(h.join().unwrap(), Err(Error::Closed)));
        }
    }

    #[test]
    fn test_close_wakes_blocked_sender() {
        let ch = Arc::new(WorkChannel::new(1));
        ch.send(0u32).unwrap();
        let sender = {
            let ch = ch.clone();
            thread::spawn(move || ch.send(1))
        };
        thread::sleep(Duration::from_millis(20));
        ch.close();
        assert!(matches!(sender.join().unwrap(), Err(Error::Closed)));
    }

    #[test]
    fn test_mpmc_delivers_everything_once() {
        let ch = Arc::new(WorkChannel::new(16));
        let producers: Vec<_> = (0..4u32)
            .map(|p| {
                let ch = ch.clone();
                thread::spawn(move || {
                    for i in 0..250 {
                        ch.send(p * 1000 + i).unwrap();
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let ch = ch.clone();
                thread::spawn(move || {
                    let mut got = Vec::new();
                    while let Ok(v) = ch.receive() {
                        got.push(v);
                    }
                    got
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        while !ch.is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        ch.close();
        let mut all: Vec<u32> = consumers.into_iter().flat_map(|c| c.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all.len(), 1000);
        all.dedup();
        assert_eq!(all.len(), 1000);
    }

    #[test]
    fn test_drain() {
        let ch = WorkChannel::new(0);
        ch.send_many(0..5).unwrap();
        assert_eq!(ch.drain(), vec![0, 1, 2, 3, 4]);
        assert!(ch.is_empty());
    }
}
