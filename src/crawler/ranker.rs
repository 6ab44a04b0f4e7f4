use std::cmp::Ordering;

use crate::crawler::task::Task;

/// Comparison used to order tasks; `Ordering::Less` sorts first
pub type TaskComparator = Box<dyn Fn(&Task, &Task) -> Ordering + Send + Sync>;

/// Dispatch weight of a task at `now` (unix seconds).
///
/// The weight is `log2(wait) + priority`, with the wait floored at one
/// second. Doubling the wait adds exactly one point, so one point of
/// priority is worth twice the staleness.
pub fn weight(task: &Task, now: i64) -> f64 {
    let wait = now.saturating_sub(task.last_crawl_time).max(1);
    (wait as f64).log2() + f64::from(task.priority)
}

/// Orders waiting tasks so the heaviest are dispatched first
pub struct Ranker {
    /// Reference timestamp for weights
    now: i64,

    /// Override for the default descending-weight order
    comparator: Option<TaskComparator>,
}

impl Ranker {
    /// Create a ranker using the default weight order
    pub fn new(now: i64) -> Self {
        Self {
            now,
            comparator: None,
        }
    }

    /// Create a ranker with a custom comparison function
    pub fn with_comparator(now: i64, comparator: TaskComparator) -> Self {
        Self {
            now,
            comparator: Some(comparator),
        }
    }

    /// Sort tasks in place, descending by weight.
    ///
    /// The sort is stable, so tasks of equal weight keep their input order.
    pub fn rank(&self, tasks: &mut [Task]) {
        match &self.comparator {
            Some(compare) => tasks.sort_by(|a, b| compare(a, b)),
            None => {
                let now = self.now;
                tasks.sort_by(|a, b| {
                    weight(b, now)
                        .partial_cmp(&weight(a, now))
                        .unwrap_or(Ordering::Equal)
                });
            }
        }
    }
}
