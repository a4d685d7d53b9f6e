//! Per-key failure budget.
//!
//! A key's count only goes up on failure and only drops back to zero on a
//! successful pass. Elapsed time never resets it: with exponential backoff
//! the later retries are minutes apart, and a time window would forgive a
//! key that has never once succeeded.

use std::collections::HashMap;
use std::hash::Hash;

/// Verdict on a failed pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryVerdict {
    /// Requeue with backoff. `attempts` counts the failures so far.
    Retry { attempts: u32 },
    /// The budget is spent. Stays this way until the key succeeds once.
    Exhausted { attempts: u32 },
}

impl RetryVerdict {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Retry { attempts } | Self::Exhausted { attempts } => *attempts,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self, Self::Exhausted { .. })
    }
}

/// Consecutive failures per key against an optional limit.
#[derive(Debug, Clone)]
pub struct RetryTracker<T> {
    max_retries: Option<u32>,
    consecutive: HashMap<T, u32>,
}

impl<T: Eq + Hash + Clone> RetryTracker<T> {
    /// `max_retries` is the number of retries allowed after the first
    /// failure; `None` never exhausts.
    pub fn new(max_retries: Option<u32>) -> Self {
        Self {
            max_retries,
            consecutive: HashMap::new(),
        }
    }

    pub fn record_failure(&mut self, key: &T) -> RetryVerdict {
        let count = self.consecutive.entry(key.clone()).or_insert(0);
        *count = count.saturating_add(1);
        let attempts = *count;
        match self.max_retries {
            Some(max) if attempts > max => RetryVerdict::Exhausted { attempts },
            _ => RetryVerdict::Retry { attempts },
        }
    }

    pub fn record_success(&mut self, key: &T) {
        self.consecutive.remove(key);
    }

    pub fn attempts(&self, key: &T) -> u32 {
        self.consecutive.get(key).copied().unwrap_or(0)
    }

    pub fn is_exhausted(&self, key: &T) -> bool {
        self.max_retries
            .is_some_and(|max| self.attempts(key) > max)
    }

    pub fn len(&self) -> usize {
        self.consecutive.len()
    }

    pub fn is_empty(&self) -> bool {
        self.consecutive.is_empty()
    }
}
