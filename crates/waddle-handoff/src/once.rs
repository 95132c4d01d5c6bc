//! Run-once guard that remembers its result.
//!
//! Late and concurrent callers block until the first run finishes, then get a
//! clone of its result. A failed run is remembered too: it is never retried.

use std::sync::{Condvar, Mutex, PoisonError};

enum State<T> {
    NotStarted,
    InProgress,
    Done(T),
}

pub(crate) struct OnceGuard<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

impl<T: Clone> OnceGuard<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(State::NotStarted),
            done: Condvar::new(),
        }
    }

    /// Run `f` if no caller has yet, otherwise wait for and return the stored result.
    pub(crate) fn run(&self, f: impl FnOnce() -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        loop {
            match &*state {
                State::Done(result) => return result.clone(),
                State::InProgress => {
                    state = self
                        .done
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                State::NotStarted => break,
            }
        }
        *state = State::InProgress;
        drop(state);

        let reset = ResetOnPanic(self);
        let result = f();
        std::mem::forget(reset);

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = State::Done(result.clone());
        self.done.notify_all();
        result
    }
}

/// Hands the step back to waiting callers if the running closure panics.
struct ResetOnPanic<'a, T>(&'a OnceGuard<T>);

impl<T> Drop for ResetOnPanic<'_, T> {
    fn drop(&mut self) {
        let mut state = self.0.state.lock().unwrap_or_else(PoisonError::into_inner);
        *state = State::NotStarted;
        self.0.done.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Barrier};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_runs_once_and_replays() {
        let guard = OnceGuard::new();
        let calls = AtomicUsize::new(0);

        let first: Result<u32, String> = guard.run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("boom".to_string())
        });
        let second = guard.run(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(7)
        });

        assert_eq!(first, Err("boom".to_string()));
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_run_is_retried() {
        let guard: OnceGuard<u32> = OnceGuard::new();
        let panicked = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            guard.run(|| panic!("first run fails"))
        }));
        assert!(panicked.is_err());
        assert_eq!(guard.run(|| 3), 3);
    }

    #[test]
    fn test_concurrent_callers_share_one_run() {
        let guard = Arc::new(OnceGuard::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let guard = Arc::clone(&guard);
                let calls = Arc::clone(&calls);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    guard.run(|| {
                        calls.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(50));
                        i
                    })
                })
            })
            .collect();

        let results: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(results.windows(2).all(|w| w[0] == w[1]));
    }
}
