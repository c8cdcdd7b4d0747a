//! Unit tests for gabbro-types.

use test_case::test_case;

use crate::{
    ErrorKind, ExecutionFailure, QueryId, QueryState, ResourceGroupId, StageId, StageState, TaskId,
};

// ============================================================================
// Id Display
// ============================================================================

#[test]
fn query_id_display_roundtrip() {
    let id = QueryId::new("20260801_104500_00042_gabbro");
    assert_eq!(id.to_string(), "20260801_104500_00042_gabbro");
    assert_eq!(id.as_str(), "20260801_104500_00042_gabbro");
}

#[test]
fn stage_and_task_id_display_nest() {
    let stage = StageId::new(QueryId::from("q1"), 3);
    assert_eq!(stage.to_string(), "q1.3");

    let task = TaskId::new(stage, 7, 1);
    assert_eq!(task.to_string(), "q1.3.7.1");
}

#[test]
fn resource_group_id_display_is_dotted() {
    let id = ResourceGroupId::new(vec!["global".into(), "adhoc".into()]);
    assert_eq!(id.to_string(), "global.adhoc");
}

#[test]
#[should_panic(expected = "resource group id must be non-empty")]
fn empty_resource_group_id_panics() {
    let _ = ResourceGroupId::new(vec![]);
}

// ============================================================================
// State Ordering
// ============================================================================

#[test]
fn query_states_order_by_phase() {
    assert!(QueryState::Queued < QueryState::WaitingForResources);
    assert!(QueryState::WaitingForResources < QueryState::Dispatching);
    assert!(QueryState::Dispatching < QueryState::Planning);
    assert!(QueryState::Planning < QueryState::Starting);
    assert!(QueryState::Starting < QueryState::Running);
    assert!(QueryState::Running < QueryState::Finishing);
    assert!(QueryState::Finishing < QueryState::Finished);
}

#[test_case(QueryState::Queued, false)]
#[test_case(QueryState::Running, false)]
#[test_case(QueryState::Recovering, false)]
#[test_case(QueryState::Finishing, false)]
#[test_case(QueryState::Finished, true)]
#[test_case(QueryState::Failed, true)]
fn query_state_terminality(state: QueryState, terminal: bool) {
    assert_eq!(state.is_terminal(), terminal);
    assert_eq!(state.is_done(), terminal);
}

#[test_case(StageState::Planned, false, false)]
#[test_case(StageState::Scheduling, false, false)]
#[test_case(StageState::Running, false, true)]
#[test_case(StageState::Recovering, false, false)]
#[test_case(StageState::Finished, true, true)]
#[test_case(StageState::Failed, true, true)]
fn stage_state_predicates(state: StageState, done: bool, running_or_done: bool) {
    assert_eq!(state.is_done(), done);
    assert_eq!(state.is_running_or_done(), running_or_done);
}

#[test]
fn query_state_serde_is_screaming_snake() {
    let json = serde_json::to_string(&QueryState::WaitingForResources).unwrap();
    assert_eq!(json, "\"WAITING_FOR_RESOURCES\"");
    let back: QueryState = serde_json::from_str(&json).unwrap();
    assert_eq!(back, QueryState::WaitingForResources);
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn user_canceled_failure_is_discriminated_by_kind() {
    let failure = ExecutionFailure::user_canceled();
    assert!(failure.is_user_canceled());
    assert_eq!(failure.code.kind, ErrorKind::UserCanceled);
    assert_eq!(failure.to_string(), "USER_CANCELED: Query was canceled by user");
}

#[test]
fn internal_failure_is_not_user_canceled() {
    let failure = ExecutionFailure::internal("stage scheduler panicked");
    assert!(!failure.is_user_canceled());
    assert_eq!(failure.code.kind, ErrorKind::Internal);
}
