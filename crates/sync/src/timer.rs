// Scheduled, cancellable tasks in virtual time.
//
// Nothing here sleeps: the owner asks for the tasks that are due at a given
// `now`. Tests drive time by passing increasing timestamps.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

#[derive(Debug)]
pub struct TimerQueue<T> {
    // Keyed by (deadline, id) so equal deadlines fire in scheduling order.
    entries: BTreeMap<(DateTime<Utc>, TimerId), T>,
    deadlines: BTreeMap<TimerId, DateTime<Utc>>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self { entries: BTreeMap::new(), deadlines: BTreeMap::new(), next_id: 0 }
    }
}

impl<T> TimerQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule(&mut self, deadline: DateTime<Utc>, task: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.entries.insert((deadline, id), task);
        self.deadlines.insert(id, deadline);
        id
    }

    /// Cancel a scheduled task. Returns the task if it had not fired yet.
    pub fn cancel(&mut self, id: TimerId) -> Option<T> {
        let deadline = self.deadlines.remove(&id)?;
        self.entries.remove(&(deadline, id))
    }

    pub fn is_scheduled(&self, id: TimerId) -> bool {
        self.deadlines.contains_key(&id)
    }

    /// Remove and return every task with `deadline <= now`, earliest first.
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<(TimerId, T)> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let ((_, id), task) = entry.remove_entry();
            self.deadlines.remove(&id);
            due.push((id, task));
        }
        due
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.entries.keys().next().map(|(deadline, _)| *deadline)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.deadlines.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().expect("valid timestamp")
            + Duration::seconds(secs)
    }

    #[test]
    fn pops_only_due_tasks_in_deadline_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(t(10), "ten");
        timers.schedule(t(5), "five");
        timers.schedule(t(30), "thirty");

        let due: Vec<_> = timers.pop_due(t(10)).into_iter().map(|(_, task)| task).collect();
        assert_eq!(due, vec!["five", "ten"]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.next_deadline(), Some(t(30)));
    }

    #[test]
    fn equal_deadlines_fire_in_scheduling_order() {
        let mut timers = TimerQueue::new();
        timers.schedule(t(1), 1);
        timers.schedule(t(1), 2);
        timers.schedule(t(1), 3);
        let due: Vec<_> = timers.pop_due(t(1)).into_iter().map(|(_, task)| task).collect();
        assert_eq!(due, vec![1, 2, 3]);
    }

    #[test]
    fn cancelled_tasks_never_fire() {
        let mut timers = TimerQueue::new();
        let id = timers.schedule(t(5), "rollback");
        assert!(timers.is_scheduled(id));
        assert_eq!(timers.cancel(id), Some("rollback"));
        assert!(!timers.is_scheduled(id));
        assert!(timers.pop_due(t(60)).is_empty());
        assert_eq!(timers.cancel(id), None);
    }

    #[test]
    fn fired_tasks_cannot_be_cancelled() {
        let mut timers = TimerQueue::new();
        let id = timers.schedule(t(1), ());
        assert_eq!(timers.pop_due(t(2)).len(), 1);
        assert_eq!(timers.cancel(id), None);
        assert!(timers.is_empty());
    }
}
