// src/models/compute_plan.rs

//! Compute plans and their aggregate task counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::common::Metadata;
use crate::models::task::TaskStatus;

/// Compute plan lifecycle.
///
/// `empty -> waiting -> doing -> done`; `failed` and `canceled` are reachable
/// from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputePlanStatus {
    Empty,
    Waiting,
    Doing,
    Done,
    Failed,
    Canceled,
}

impl ComputePlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ComputePlanStatus::Done | ComputePlanStatus::Failed | ComputePlanStatus::Canceled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputePlan {
    pub key: String,
    pub name: String,
    #[serde(default)]
    pub tag: String,
    pub owner: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub status: ComputePlanStatus,
    pub task_count: u32,
    pub todo_count: u32,
    pub doing_count: u32,
    pub done_count: u32,
    pub canceled_count: u32,
    pub failed_count: u32,
    pub creation_date: DateTime<Utc>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub estimated_end_date: Option<DateTime<Utc>>,
    /// Seconds between `start_date` and `end_date`.
    #[serde(default)]
    pub duration: Option<i64>,
    #[serde(default)]
    pub delete_intermediary_models: bool,
}

impl ComputePlan {
    /// A fresh plan with no tasks.
    pub fn new(key: String, name: String, owner: String, now: DateTime<Utc>) -> Self {
        Self {
            key,
            name,
            tag: String::new(),
            owner,
            metadata: Metadata::new(),
            status: ComputePlanStatus::Empty,
            task_count: 0,
            todo_count: 0,
            doing_count: 0,
            done_count: 0,
            canceled_count: 0,
            failed_count: 0,
            creation_date: now,
            start_date: None,
            end_date: None,
            estimated_end_date: None,
            duration: None,
            delete_intermediary_models: false,
        }
    }

    /// `todo + doing + done + canceled + failed == task_count`.
    pub fn counters_consistent(&self) -> bool {
        self.todo_count + self.doing_count + self.done_count + self.canceled_count + self.failed_count
            == self.task_count
    }

    /// Register `count` newly created (waiting) tasks.
    pub fn add_tasks(&mut self, count: u32, now: DateTime<Utc>) {
        self.task_count += count;
        self.todo_count += count;
        self.refresh_status(now);
    }

    /// Move one task's contribution from the `from` counter to the `to` counter.
    pub fn record_transition(&mut self, from: TaskStatus, to: TaskStatus, now: DateTime<Utc>) {
        let source = self.counter_mut(from);
        *source = source.saturating_sub(1);
        *self.counter_mut(to) += 1;

        if to == TaskStatus::Doing && self.start_date.is_none() {
            self.start_date = Some(now);
        }
        self.refresh_status(now);
    }

    /// Mark the plan canceled. Only tasks that have not started are affected by
    /// the caller; this records the plan-level terminal state.
    pub fn cancel(&mut self, now: DateTime<Utc>) {
        self.status = ComputePlanStatus::Canceled;
        self.end_date.get_or_insert(now);
        self.update_duration();
    }

    /// Recompute `status` (and derived dates) from the counters.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) {
        if self.status == ComputePlanStatus::Canceled {
            return;
        }

        let status = if self.task_count == 0 {
            ComputePlanStatus::Empty
        } else if self.failed_count > 0 {
            ComputePlanStatus::Failed
        } else if self.done_count == self.task_count {
            ComputePlanStatus::Done
        } else if self.canceled_count > 0 && self.todo_count + self.doing_count == 0 {
            ComputePlanStatus::Canceled
        } else if self.doing_count > 0 || self.done_count > 0 {
            ComputePlanStatus::Doing
        } else {
            ComputePlanStatus::Waiting
        };
        self.status = status;

        if status.is_terminal() {
            self.end_date.get_or_insert(now);
            self.estimated_end_date = self.end_date;
            self.update_duration();
        } else {
            self.end_date = None;
            self.duration = None;
            self.estimated_end_date = self.estimate_end(now);
        }
    }

    /// Linear extrapolation from the average time per finished task.
    fn estimate_end(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = self.start_date?;
        if self.done_count == 0 {
            return None;
        }
        let elapsed = now - start;
        let per_task = elapsed / self.done_count as i32;
        Some(start + per_task * self.task_count as i32)
    }

    fn update_duration(&mut self) {
        self.duration = match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => Some((end - start).num_seconds()),
            _ => None,
        };
    }

    fn counter_mut(&mut self, status: TaskStatus) -> &mut u32 {
        match status {
            TaskStatus::Waiting => &mut self.todo_count,
            TaskStatus::Doing => &mut self.doing_count,
            TaskStatus::Done => &mut self.done_count,
            TaskStatus::Failed => &mut self.failed_count,
            TaskStatus::Canceled => &mut self.canceled_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> ComputePlan {
        ComputePlan::new("cp".into(), "plan".into(), "org".into(), Utc::now())
    }

    #[test]
    fn new_plan_is_empty() {
        let p = plan();
        assert_eq!(p.status, ComputePlanStatus::Empty);
        assert!(p.counters_consistent());
    }

    #[test]
    fn plan_goes_through_waiting_doing_done() {
        let mut p = plan();
        let now = Utc::now();
        p.add_tasks(2, now);
        assert_eq!(p.status, ComputePlanStatus::Waiting);

        p.record_transition(TaskStatus::Waiting, TaskStatus::Doing, now);
        assert_eq!(p.status, ComputePlanStatus::Doing);
        assert!(p.start_date.is_some());

        p.record_transition(TaskStatus::Doing, TaskStatus::Done, now);
        assert_eq!(p.status, ComputePlanStatus::Doing);
        assert!(p.end_date.is_none());

        p.record_transition(TaskStatus::Waiting, TaskStatus::Doing, now);
        p.record_transition(TaskStatus::Doing, TaskStatus::Done, now);
        assert_eq!(p.status, ComputePlanStatus::Done);
        assert!(p.end_date.is_some());
        assert_eq!(p.duration, Some(0));
        assert!(p.counters_consistent());
    }

    #[test]
    fn failure_marks_plan_failed() {
        let mut p = plan();
        let now = Utc::now();
        p.add_tasks(3, now);
        p.record_transition(TaskStatus::Waiting, TaskStatus::Doing, now);
        p.record_transition(TaskStatus::Doing, TaskStatus::Failed, now);
        p.record_transition(TaskStatus::Waiting, TaskStatus::Canceled, now);
        p.record_transition(TaskStatus::Waiting, TaskStatus::Canceled, now);
        assert_eq!(p.status, ComputePlanStatus::Failed);
        assert!(p.counters_consistent());
    }

    proptest::proptest! {
        #[test]
        fn counters_stay_consistent_under_any_transitions(
            task_count in 1u32..20,
            ops in proptest::collection::vec((0usize..20, 0u8..3), 0..80),
        ) {
            let now = Utc::now();
            let mut p = plan();
            p.add_tasks(task_count, now);
            let mut statuses = vec![TaskStatus::Waiting; task_count as usize];

            for (idx, choice) in ops {
                let idx = idx % statuses.len();
                let from = statuses[idx];
                let to = match (from, choice) {
                    (TaskStatus::Waiting, 0 | 1) => TaskStatus::Doing,
                    (TaskStatus::Waiting, _) => TaskStatus::Canceled,
                    (TaskStatus::Doing, 0 | 1) => TaskStatus::Done,
                    (TaskStatus::Doing, _) => TaskStatus::Failed,
                    _ => continue,
                };
                p.record_transition(from, to, now);
                statuses[idx] = to;

                proptest::prop_assert!(p.counters_consistent());
                proptest::prop_assert_eq!(
                    p.status == ComputePlanStatus::Done,
                    p.done_count == p.task_count
                );
            }
        }
    }

    #[test]
    fn canceled_plan_stays_canceled() {
        let mut p = plan();
        let now = Utc::now();
        p.add_tasks(1, now);
        p.cancel(now);
        p.record_transition(TaskStatus::Waiting, TaskStatus::Canceled, now);
        assert_eq!(p.status, ComputePlanStatus::Canceled);
        assert!(p.counters_consistent());
    }
}
