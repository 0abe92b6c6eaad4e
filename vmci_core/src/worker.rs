// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Delayed-work scheduler backing deferred datagram dispatch and event
//! delivery.
//!
//! Jobs are plain `FnOnce` closures run on a small pool of worker threads
//! with no registry lock held. Admission is bounded: once the number of
//! outstanding jobs reaches the configured limit, `submit` fails immediately
//! instead of queuing without bound.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::error::Result;
use crate::error::VmciError;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkQueue {
    tx: Mutex<Option<mpsc::Sender<Job>>>,
    pending: Arc<AtomicUsize>,
    limit: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkQueue {
    /// Starts `num_workers` threads named `<name>-N`. `limit` caps the
    /// number of submitted-but-not-finished jobs.
    pub fn new(name: &str, num_workers: usize, limit: usize) -> WorkQueue {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(num_workers);
        for n in 0..num_workers.max(1) {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("{}-{}", name, n))
                .spawn(move || loop {
                    // Hold the receiver lock only for the dequeue so jobs
                    // run concurrently across workers.
                    let job = match rx.lock().recv() {
                        Ok(job) => job,
                        Err(_) => break,
                    };
                    job();
                })
                .expect("failed to spawn worker thread");
            workers.push(handle);
        }
        WorkQueue {
            tx: Mutex::new(Some(tx)),
            pending: Arc::new(AtomicUsize::new(0)),
            limit,
            workers: Mutex::new(workers),
        }
    }

    /// Number of jobs submitted but not yet completed.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Schedules `job` to run on a worker thread, failing with `NoMem` when
    /// the admission limit is reached and `Unavailable` after shutdown.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, job: F) -> Result<()> {
        let prev = self.pending.fetch_add(1, Ordering::SeqCst);
        if prev >= self.limit {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(VmciError::NoMem);
        }
        let pending = self.pending.clone();
        let wrapped: Job = Box::new(move || {
            job();
            pending.fetch_sub(1, Ordering::SeqCst);
        });
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => match tx.send(wrapped) {
                Ok(()) => Ok(()),
                Err(_) => {
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                    Err(VmciError::Unavailable)
                }
            },
            None => {
                self.pending.fetch_sub(1, Ordering::SeqCst);
                Err(VmciError::Unavailable)
            }
        }
    }

    /// Stops accepting work and joins the worker threads. Already-submitted
    /// jobs run to completion first.
    pub fn shutdown(&self) {
        // Dropping the sender makes the workers' recv() fail once the
        // channel drains.
        self.tx.lock().take();
        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            if handle.join().is_err() {
                log::error!("vmci worker thread panicked");
            }
        }
    }
}

impl Drop for WorkQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::sync::Barrier;

    use super::*;

    #[test]
    fn runs_jobs() {
        let wq = WorkQueue::new("test", 2, 16);
        let count = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        for _ in 0..4 {
            let count = count.clone();
            let done_tx = done_tx.clone();
            wq.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
                done_tx.send(()).unwrap();
            })
            .unwrap();
        }
        for _ in 0..4 {
            done_rx.recv().unwrap();
        }
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn admission_limit() {
        let wq = WorkQueue::new("test", 1, 2);
        let gate = Arc::new(Barrier::new(2));
        let release = Arc::new(Barrier::new(2));
        {
            let gate = gate.clone();
            let release = release.clone();
            wq.submit(move || {
                gate.wait();
                release.wait();
            })
            .unwrap();
        }
        gate.wait();
        // Worker is blocked on the first job; one slot remains.
        wq.submit(|| {}).unwrap();
        assert_eq!(wq.submit(|| {}), Err(VmciError::NoMem));
        release.wait();
    }

    #[test]
    fn submit_after_shutdown() {
        let wq = WorkQueue::new("test", 1, 4);
        wq.shutdown();
        assert_eq!(wq.submit(|| {}), Err(VmciError::Unavailable));
    }
}
