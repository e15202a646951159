pub mod audit;
pub mod clock;
pub mod config;
pub mod domain;
pub mod engine;
pub mod errors;
pub mod notify;
pub mod predicate;
pub mod scheduler;
pub mod selector;
pub mod store;
pub mod targets;

#[cfg(test)]
mod testing;

pub use audit::{ApprovalHistoryEntry, HistoryAction, HistoryEntryId, HistoryKey, HistoryView};
pub use clock::{Clock, ManualClock, SystemClock};
pub use domain::actor::{Actor, ActorId};
pub use domain::report::{
    ReportId, ReportSnapshot, ReportWorkflowState, SelectionCriteria, WorkflowStatus,
};
pub use domain::workflow::{
    EscalationPolicy, ReturnPolicy, WorkflowConditions, WorkflowDefinition, WorkflowDraft,
    WorkflowId, WorkflowPatch, WorkflowStep,
};
pub use engine::{
    EngineSettings, SlaFiring, TransitionOutcome, WorkflowEngine, WorkflowStatusView,
};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use notify::{
    EscalationNotice, EscalationNotifier, NotifyError, RecordingNotifier, TracingNotifier,
};
pub use predicate::{Condition, Predicate, PredicateContext};
pub use scheduler::{SchedulerSettings, SlaScheduler, TickReport};
pub use selector::{Selection, SelectionReason, WorkflowSelector};
pub use store::{
    CommitOutcome, InMemoryWorkflowStore, Page, PageRequest, ReviewCursor, StoreError,
    WorkflowStore,
};
pub use targets::{
    ActorSet, Directory, DirectoryError, ResolutionError, StaticDirectory, StepTarget,
    TargetResolver,
};
