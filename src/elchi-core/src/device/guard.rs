// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Per-device transport serialization.
//!
//! Every physical link is owned by exactly one `TransportGuard`. A device
//! call takes the guard for one logical exchange (write a command, read the
//! reply) and the lock is dropped on every exit path, including panics.

use std::sync::{Mutex, MutexGuard};

use tracing::warn;

use crate::device::response::DeviceResult;

pub struct TransportGuard<T> {
    label: String,
    transport: Mutex<T>,
}

impl<T> TransportGuard<T> {
    pub fn new(label: impl Into<String>, transport: T) -> Self {
        Self {
            label: label.into(),
            transport: Mutex::new(transport),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Run one exchange with exclusive access to the transport.
    ///
    /// `f` must not call back into the same guard; the lock is not
    /// reentrant.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> DeviceResult<R>) -> DeviceResult<R> {
        let mut transport = self.lock();
        f(&mut transport)
    }

    /// A panic inside an earlier exchange leaves the lock poisoned; the
    /// transport itself is still usable, so keep serving.
    fn lock(&self) -> MutexGuard<'_, T> {
        self.transport.lock().unwrap_or_else(|poisoned| {
            warn!("{}: recovering transport lock after a panic", self.label);
            self.transport.clear_poison();
            poisoned.into_inner()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use crate::device::response::DeviceError;

    #[test]
    fn test_concurrent_exchanges_never_overlap() {
        let guard = Arc::new(TransportGuard::new("test", ()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let guard = Arc::clone(&guard);
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..10 {
                        guard
                            .with(|_| {
                                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                thread::sleep(Duration::from_millis(1));
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                Ok(())
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_error_releases_lock() {
        let guard = TransportGuard::new("test", 0u32);
        let res: DeviceResult<()> = guard.with(|_| Err(DeviceError::transport("no reply")));
        assert!(res.is_err());
        let value = guard
            .with(|n| {
                *n += 1;
                Ok(*n)
            })
            .unwrap();
        assert_eq!(value, 1);
    }

    #[test]
    fn test_exchange_after_panic_still_works() {
        let guard = Arc::new(TransportGuard::new("psu", 0u32));
        let g = Arc::clone(&guard);
        let joined = thread::spawn(move || {
            let _ = g.with(|n| -> DeviceResult<()> {
                *n = 7;
                panic!("driver bug")
            });
        })
        .join();
        assert!(joined.is_err());

        for _ in 0..3 {
            let value = guard
                .with(|n| {
                    *n += 1;
                    Ok(*n)
                })
                .unwrap();
            assert!(value > 7);
        }
        assert_eq!(guard.with(|n| Ok(*n)).unwrap(), 10);
    }
}
