//! Exclusion between staging writers and the flusher of the upload heap.
//!
//! Any number of writers may hold the gate open at once. A flush closes it: new writers
//! wait until the flush ends, and the flush itself waits until every writer that was
//! already inside has left. Writers are never preempted.

use crate::{RendererError, RendererResult};
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct GateState {
    writers: usize,
    flushing: bool,
    epoch: u64,
}

/// A many-writers / single-flusher barrier with a flush generation counter.
#[derive(Debug, Default)]
pub struct FlushGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl FlushGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> RendererResult<MutexGuard<'_, GateState>> {
        self.state
            .lock()
            .map_err(|e| RendererError::Init(format!("Flush gate poisoned: {e}")))
    }

    fn wait_while<'a, F>(
        &'a self,
        guard: MutexGuard<'a, GateState>,
        condition: F,
    ) -> RendererResult<MutexGuard<'a, GateState>>
    where
        F: FnMut(&mut GateState) -> bool,
    {
        self.changed
            .wait_while(guard, condition)
            .map_err(|e| RendererError::Init(format!("Flush gate poisoned: {e}")))
    }

    /// Block until no flush is running.
    pub fn wait_for_flush(&self) -> RendererResult<()> {
        let guard = self.lock()?;
        self.wait_while(guard, |state| state.flushing)?;
        Ok(())
    }

    /// Register a writer, waiting for a running flush to end first.
    ///
    /// Returns the flush epoch the writer entered in.
    pub fn enter(&self) -> RendererResult<u64> {
        let guard = self.lock()?;
        let mut state = self.wait_while(guard, |state| state.flushing)?;
        state.writers += 1;
        Ok(state.epoch)
    }

    /// Unregister a writer.
    pub fn leave(&self) -> RendererResult<()> {
        let mut state = self.lock()?;
        debug_assert!(state.writers > 0, "flush gate left more times than entered");
        state.writers = state.writers.saturating_sub(1);
        if state.writers == 0 {
            self.changed.notify_all();
        }
        Ok(())
    }

    /// Start a flush.
    ///
    /// Waits for a concurrent flush to end, closes the gate to new writers, then waits
    /// until the writers already inside have left.
    pub fn begin_flush(&self) -> RendererResult<()> {
        let guard = self.lock()?;
        let mut state = self.wait_while(guard, |state| state.flushing)?;
        state.flushing = true;
        let _state = self.wait_while(state, |state| state.writers > 0)?;
        Ok(())
    }

    /// End a flush, bump the epoch and let waiting writers in.
    pub fn end_flush(&self) -> RendererResult<()> {
        let mut state = self.lock()?;
        debug_assert!(state.flushing, "end_flush without begin_flush");
        state.flushing = false;
        state.epoch += 1;
        self.changed.notify_all();
        Ok(())
    }

    /// Number of completed flushes.
    pub fn epoch(&self) -> RendererResult<u64> {
        Ok(self.lock()?.epoch)
    }

    /// Number of writers currently inside.
    pub fn writers(&self) -> RendererResult<usize> {
        Ok(self.lock()?.writers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            mpsc, Arc, Barrier,
        },
        thread,
        time::Duration,
    };

    #[test]
    fn writers_share_the_gate() {
        let gate = FlushGate::new();
        assert_eq!(gate.enter().unwrap(), 0);
        assert_eq!(gate.enter().unwrap(), 0);
        assert_eq!(gate.writers().unwrap(), 2);
        gate.leave().unwrap();
        gate.leave().unwrap();
        assert_eq!(gate.writers().unwrap(), 0);
    }

    #[test]
    fn flush_bumps_the_epoch() {
        let gate = FlushGate::new();
        gate.begin_flush().unwrap();
        gate.end_flush().unwrap();
        assert_eq!(gate.epoch().unwrap(), 1);
        assert_eq!(gate.enter().unwrap(), 1);
        gate.leave().unwrap();
    }

    #[test]
    fn flush_waits_for_every_open_writer() {
        const WRITERS: usize = 4;
        let gate = Arc::new(FlushGate::new());
        let open = Arc::new(AtomicUsize::new(0));
        let all_entered = Arc::new(Barrier::new(WRITERS + 1));
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(std::sync::Mutex::new(release_rx));

        let writers: Vec<_> = (0..WRITERS)
            .map(|_| {
                let gate = gate.clone();
                let open = open.clone();
                let all_entered = all_entered.clone();
                let release_rx = release_rx.clone();
                thread::spawn(move || {
                    gate.enter().unwrap();
                    open.fetch_add(1, Ordering::SeqCst);
                    all_entered.wait();
                    release_rx.lock().unwrap().recv().unwrap();
                    open.fetch_sub(1, Ordering::SeqCst);
                    gate.leave().unwrap();
                })
            })
            .collect();

        all_entered.wait();

        let flushed = Arc::new(AtomicBool::new(false));
        let flusher = {
            let gate = gate.clone();
            let open = open.clone();
            let flushed = flushed.clone();
            thread::spawn(move || {
                gate.begin_flush().unwrap();
                assert_eq!(open.load(Ordering::SeqCst), 0, "flush ran with open writers");
                flushed.store(true, Ordering::SeqCst);
                gate.end_flush().unwrap();
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!flushed.load(Ordering::SeqCst));

        for _ in 0..WRITERS {
            release_tx.send(()).unwrap();
        }
        for writer in writers {
            writer.join().unwrap();
        }
        flusher.join().unwrap();
        assert!(flushed.load(Ordering::SeqCst));
        assert_eq!(gate.epoch().unwrap(), 1);
    }

    #[test]
    fn writers_wait_for_a_running_flush() {
        let gate = Arc::new(FlushGate::new());
        gate.begin_flush().unwrap();

        let entered = Arc::new(AtomicBool::new(false));
        let writer = {
            let gate = gate.clone();
            let entered = entered.clone();
            thread::spawn(move || {
                let epoch = gate.enter().unwrap();
                entered.store(true, Ordering::SeqCst);
                gate.leave().unwrap();
                epoch
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));

        gate.end_flush().unwrap();
        assert_eq!(writer.join().unwrap(), 1);
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn concurrent_flushes_are_serialized() {
        let gate = Arc::new(FlushGate::new());
        let inside = Arc::new(AtomicUsize::new(0));

        let flushers: Vec<_> = (0..4)
            .map(|_| {
                let gate = gate.clone();
                let inside = inside.clone();
                thread::spawn(move || {
                    for _ in 0..25 {
                        gate.begin_flush().unwrap();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        inside.fetch_sub(1, Ordering::SeqCst);
                        gate.end_flush().unwrap();
                    }
                })
            })
            .collect();

        for flusher in flushers {
            flusher.join().unwrap();
        }
        assert_eq!(gate.epoch().unwrap(), 100);
    }
}
