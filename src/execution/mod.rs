// Order lifecycle: state machine plus the venue-facing executor
pub mod executor;
pub mod position_manager;

pub use executor::{ExecutionAction, ExecutionDecision, Executor, ManageOutcome, OpenOutcome};
pub use position_manager::{
    EntryOrderKind, ManagementConfig, PartialClose, PartialCloseAction, PartialStage, Position,
    PositionState, PositionStateMachine, SyncOutcome, TransitionError,
};
