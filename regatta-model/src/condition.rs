use serde::{Deserialize, Serialize};

/// Where a task (or instance) currently is in its lifecycle.
///
/// `UnreachableInactive` and `Scheduled` only ever appear at the instance
/// level; the offer layer never reports them for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Error,
    Failed,
    Gone,
    Dropped,
    Unreachable,
    UnreachableInactive,
    Killing,
    Starting,
    Staging,
    Unknown,
    Provisioned,
    Running,
    Finished,
    Killed,
    Scheduled,
}

impl Condition {
    /// Position in the severity order used by the multi-task reducer.
    /// Lower rank wins.
    fn severity_rank(self) -> u8 {
        match self {
            Condition::Error => 0,
            Condition::Failed => 1,
            Condition::Gone => 2,
            Condition::Dropped => 3,
            Condition::Unreachable => 4,
            Condition::UnreachableInactive => 5,
            Condition::Killing => 6,
            Condition::Starting => 7,
            Condition::Staging => 8,
            Condition::Unknown => 9,
            Condition::Provisioned => 10,
            Condition::Running => 11,
            Condition::Finished => 12,
            Condition::Killed => 13,
            Condition::Scheduled => 14,
        }
    }

    /// The conditions nothing ever comes back from. `UnreachableInactive`
    /// deliberately is not in this set; it is only *treated* as terminal by
    /// the scale loop.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Condition::Error
                | Condition::Failed
                | Condition::Finished
                | Condition::Killed
                | Condition::Gone
                | Condition::Dropped
                | Condition::Unknown
        )
    }

    /// Conditions that count toward a run spec's live capacity.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Condition::Provisioned
                | Condition::Staging
                | Condition::Starting
                | Condition::Running
                | Condition::Unreachable
                | Condition::Killing
        )
    }

    /// Terminal or abandoned by the agent: no kill request is worth sending.
    pub fn is_terminal_or_unreachable(self) -> bool {
        self.is_terminal() || matches!(self, Condition::Unreachable | Condition::UnreachableInactive)
    }
}

/// Reduce a non-empty set of task conditions to the instance condition:
/// the most severe condition wins. An empty set reduces to `Unknown`.
pub fn reduce_conditions<I>(conditions: I) -> Condition
where
    I: IntoIterator<Item = Condition>,
{
    conditions
        .into_iter()
        .min_by_key(|c| c.severity_rank())
        .unwrap_or(Condition::Unknown)
}

/// Aggregate task health reports into an instance-level verdict.
///
/// Takes `(condition, healthy)` per task. A running-but-unhealthy task makes
/// the instance unhealthy; a task that is neither running nor finished makes
/// the verdict unknown; otherwise a positive report from a running task makes
/// the instance healthy.
pub fn aggregate_health<I>(tasks: I) -> Option<bool>
where
    I: IntoIterator<Item = (Condition, Option<bool>)>,
{
    let mut any_positive = false;
    let mut all_settled = true;
    for (condition, healthy) in tasks {
        if condition == Condition::Running {
            match healthy {
                Some(false) => return Some(false),
                Some(true) => any_positive = true,
                None => {}
            }
        } else if condition != Condition::Finished {
            all_settled = false;
        }
    }
    if all_settled && any_positive {
        Some(true)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_severe_condition_wins() {
        let reduced = reduce_conditions([Condition::Running, Condition::Staging, Condition::Failed]);
        assert_eq!(reduced, Condition::Failed);

        let reduced = reduce_conditions([Condition::Running, Condition::Killed]);
        assert_eq!(reduced, Condition::Running);

        let reduced = reduce_conditions([Condition::Finished, Condition::Killed]);
        assert_eq!(reduced, Condition::Finished);
    }

    #[test]
    fn test_empty_reduces_to_unknown() {
        assert_eq!(reduce_conditions([]), Condition::Unknown);
    }

    #[test]
    fn test_unreachable_outranks_running_states() {
        let reduced = reduce_conditions([
            Condition::Running,
            Condition::Unreachable,
            Condition::Starting,
        ]);
        assert_eq!(reduced, Condition::Unreachable);
    }

    #[test]
    fn test_terminal_set() {
        for c in [
            Condition::Error,
            Condition::Failed,
            Condition::Finished,
            Condition::Killed,
            Condition::Gone,
            Condition::Dropped,
            Condition::Unknown,
        ] {
            assert!(c.is_terminal(), "{c:?} should be terminal");
        }
        for c in [
            Condition::Running,
            Condition::Unreachable,
            Condition::UnreachableInactive,
            Condition::Provisioned,
            Condition::Scheduled,
        ] {
            assert!(!c.is_terminal(), "{c:?} should not be terminal");
        }
    }

    #[test]
    fn test_health_unhealthy_running_task_dominates() {
        let verdict = aggregate_health([
            (Condition::Running, Some(true)),
            (Condition::Running, Some(false)),
        ]);
        assert_eq!(verdict, Some(false));
    }

    #[test]
    fn test_health_unknown_while_tasks_still_settling() {
        let verdict = aggregate_health([
            (Condition::Running, Some(true)),
            (Condition::Staging, None),
        ]);
        assert_eq!(verdict, None);
    }

    #[test]
    fn test_health_positive_when_running_and_finished_only() {
        let verdict = aggregate_health([
            (Condition::Running, Some(true)),
            (Condition::Finished, None),
        ]);
        assert_eq!(verdict, Some(true));
    }

    #[test]
    fn test_health_none_without_any_report() {
        let verdict = aggregate_health([(Condition::Running, None), (Condition::Finished, None)]);
        assert_eq!(verdict, None);
    }
}
