use std::sync::atomic::{AtomicBool, Ordering};

/// Re-entrancy guard for the shutdown path.
///
/// `{false, false}` at start, `{true, false}` once the first trigger wins
/// [`ShutdownState::try_begin`], `{true, true}` after [`ShutdownState::complete`].
#[derive(Debug, Default)]
pub struct ShutdownState {
    in_progress: AtomicBool,
    completed: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownSnapshot {
    pub in_progress: bool,
    pub completed: bool,
}

impl ShutdownState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-and-set. Exactly one caller ever gets `true`.
    pub fn try_begin(&self) -> bool {
        self.in_progress
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn complete(&self) {
        self.completed.store(true, Ordering::Release);
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ShutdownSnapshot {
        ShutdownSnapshot {
            in_progress: self.in_progress.load(Ordering::Acquire),
            completed: self.completed.load(Ordering::Acquire),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_lifecycle_of_flags() {
        let state = ShutdownState::new();
        assert_eq!(
            state.snapshot(),
            ShutdownSnapshot {
                in_progress: false,
                completed: false
            }
        );

        assert!(state.try_begin());
        assert!(!state.try_begin());
        assert_eq!(
            state.snapshot(),
            ShutdownSnapshot {
                in_progress: true,
                completed: false
            }
        );

        state.complete();
        assert_eq!(
            state.snapshot(),
            ShutdownSnapshot {
                in_progress: true,
                completed: true
            }
        );
    }

    #[test]
    fn test_single_winner_across_threads() {
        let state = Arc::new(ShutdownState::new());
        let winners: usize = (0..16)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || state.try_begin())
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(winners, 1);
    }
}
