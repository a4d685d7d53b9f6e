//! Picking which surplus dependents to remove.

/// How costly a dependent is to remove. Cheaper classes go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DrainPriority {
    /// Already going away.
    Terminating,
    /// Finished, successfully or not.
    Terminal,
    /// Never placed anywhere.
    Unscheduled,
    /// Placed but not running yet.
    Pending,
    Running,
}

/// The `count` cheapest candidates to remove.
///
/// `key` ranks each candidate by its [`DrainPriority`] and a tie-break of
/// the caller's choosing, so the result never depends on input order as
/// long as the tie-break is unique.
pub fn select_for_drain<T, K, F>(mut candidates: Vec<T>, count: usize, key: F) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> (DrainPriority, K),
{
    candidates.sort_by_cached_key(|c| key(c));
    candidates.truncate(count);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::Reverse;

    #[test]
    fn test_cheapest_class_first() {
        let candidates = vec![
            ("running", DrainPriority::Running),
            ("unscheduled", DrainPriority::Unscheduled),
            ("pending", DrainPriority::Pending),
            ("terminating", DrainPriority::Terminating),
        ];
        let picked: Vec<_> = select_for_drain(candidates, 3, |(name, p)| (*p, *name))
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(picked, vec!["terminating", "unscheduled", "pending"]);
    }

    #[test]
    fn test_tie_break_ignores_input_order() {
        // (name, age): the youngest of one class goes first.
        let forward = vec![("a", 30), ("b", 10), ("c", 20)];
        let mut backward = forward.clone();
        backward.reverse();
        let key =
            |(name, age): &(&'static str, u32)| (DrainPriority::Running, (*age, Reverse(*name)));

        assert_eq!(select_for_drain(forward, 2, key), vec![("b", 10), ("c", 20)]);
        assert_eq!(select_for_drain(backward, 2, key), vec![("b", 10), ("c", 20)]);
    }

    #[test]
    fn test_count_larger_than_input() {
        let picked = select_for_drain(vec![1, 2], 5, |n| (DrainPriority::Pending, *n));
        assert_eq!(picked, vec![1, 2]);
    }
}
