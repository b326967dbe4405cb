//! Counters and limit enforcement for one task.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Mutable counters tracked across a task.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCounters {
    /// Actions actually dispatched (successes and failures; noops excluded).
    pub ops: u32,
    pub noops: u32,
    pub failures: u32,
    /// Length of the current trailing run of non-successes.
    pub failure_or_noop_streak: u32,
}

impl TaskCounters {
    pub fn record_success(&mut self) {
        self.ops += 1;
        self.failure_or_noop_streak = 0;
    }

    pub fn record_failure(&mut self) {
        self.ops += 1;
        self.failures += 1;
        self.failure_or_noop_streak += 1;
    }

    pub fn record_noop(&mut self) {
        self.noops += 1;
        self.failure_or_noop_streak += 1;
    }
}

impl fmt::Display for TaskCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ops={} noops={} failures={} streak={}",
            self.ops, self.noops, self.failures, self.failure_or_noop_streak
        )
    }
}

/// Configured ceilings for the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitSet {
    pub max_ops: u32,
    pub max_noops: u32,
    pub max_failures: u32,
    pub max_failure_or_noop_streak: u32,
}

/// The first limit a counter update pushed past its ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitBreach {
    FailureOrNoopStreak(u32),
    Failures(u32),
    Ops(u32),
    Noops(u32),
}

impl LimitBreach {
    /// Termination reason naming the specific limit.
    pub fn reason(&self) -> String {
        match self {
            Self::FailureOrNoopStreak(n) => {
                format!("exceeded limit of {n} consecutive failures or noops")
            }
            Self::Failures(n) => format!("exceeded limit of {n} failed actions"),
            Self::Ops(n) => format!("exceeded limit of {n} operations"),
            Self::Noops(n) => format!("exceeded limit of {n} noop decisions"),
        }
    }
}

/// Check counters after a completed action. Order matters: the streak limit
/// wins over failures, which wins over ops.
pub fn check_after_action(counters: &TaskCounters, limits: &LimitSet) -> Option<LimitBreach> {
    if counters.failure_or_noop_streak > limits.max_failure_or_noop_streak {
        return Some(LimitBreach::FailureOrNoopStreak(
            limits.max_failure_or_noop_streak,
        ));
    }
    if counters.failures > limits.max_failures {
        return Some(LimitBreach::Failures(limits.max_failures));
    }
    if counters.ops > limits.max_ops {
        return Some(LimitBreach::Ops(limits.max_ops));
    }
    None
}

/// Check counters after a noop inside the reprompting loop. Only the
/// noop-related limits apply here.
pub fn check_after_noop(counters: &TaskCounters, limits: &LimitSet) -> Option<LimitBreach> {
    if counters.failure_or_noop_streak > limits.max_failure_or_noop_streak {
        return Some(LimitBreach::FailureOrNoopStreak(
            limits.max_failure_or_noop_streak,
        ));
    }
    if counters.noops > limits.max_noops {
        return Some(LimitBreach::Noops(limits.max_noops));
    }
    None
}
