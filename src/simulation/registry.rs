//! Registry of running simulations and their cancellation flags.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::StartupError;

/// Shared cancellation flag of one simulation run.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Sets the flag and reports whether this call was the one that set it.
    pub fn cancel_once(&self) -> bool {
        !self.0.swap(true, Ordering::SeqCst)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    fn same_run(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Simulation id → cancellation flag. Every operation holds the lock for
/// its whole check-and-update.
#[derive(Debug, Default)]
pub struct SimulationRegistry {
    runs: Mutex<HashMap<i64, CancellationToken>>,
}

impl SimulationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id`. An entry that was already cancelled is replaced; a live one is an error.
    pub fn register(&self, id: i64) -> Result<CancellationToken, StartupError> {
        let mut runs = self.runs.lock();
        if runs.get(&id).is_some_and(|token| !token.is_cancelled()) {
            return Err(StartupError::AlreadyRunning(id));
        }
        let token = CancellationToken::new();
        runs.insert(id, token.clone());
        Ok(token)
    }

    /// Flags `id` for cancellation. Unknown ids are ignored.
    pub fn cancel(&self, id: i64) -> bool {
        match self.runs.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Flags every registered run and returns how many there were.
    pub fn cancel_all(&self) -> usize {
        let runs = self.runs.lock();
        runs.values().for_each(CancellationToken::cancel);
        runs.len()
    }

    /// Removes `id` if it still belongs to the run holding `token`.
    pub fn deregister(&self, id: i64, token: &CancellationToken) -> bool {
        let mut runs = self.runs.lock();
        if runs.get(&id).is_some_and(|registered| registered.same_run(token)) {
            runs.remove(&id);
            true
        } else {
            false
        }
    }

    pub fn contains(&self, id: i64) -> bool {
        self.runs.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.runs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_id_cannot_be_registered_twice() {
        let registry = SimulationRegistry::new();
        let _token = registry.register(1).unwrap();
        assert!(matches!(registry.register(1), Err(StartupError::AlreadyRunning(1))));
    }

    #[test]
    fn cancelled_id_can_be_reused() {
        let registry = SimulationRegistry::new();
        let first = registry.register(1).unwrap();
        assert!(registry.cancel(1));
        let second = registry.register(1).unwrap();
        assert!(!second.is_cancelled());

        // the stale run must not remove its successor
        assert!(!registry.deregister(1, &first));
        assert!(registry.contains(1));
        assert!(registry.deregister(1, &second));
        assert!(registry.is_empty());
    }

    #[test]
    fn cancelling_unknown_id_is_harmless() {
        let registry = SimulationRegistry::new();
        assert!(!registry.cancel(42));
        assert!(registry.is_empty());
    }

    #[test]
    fn cancel_all_flags_every_run() {
        let registry = SimulationRegistry::new();
        let tokens: Vec<_> = (0..3).map(|id| registry.register(id).unwrap()).collect();
        assert_eq!(registry.cancel_all(), 3);
        assert!(tokens.iter().all(CancellationToken::is_cancelled));
    }

    #[test]
    fn cancel_once_reports_first_caller() {
        let token = CancellationToken::new();
        assert!(token.cancel_once());
        assert!(!token.cancel_once());
        assert!(token.is_cancelled());
    }
}
