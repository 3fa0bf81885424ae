pub mod config;
pub mod events;
pub mod interpolate;
pub mod types;

pub use config::Config;
pub use events::{
    Event, EventPayload, EventType, PlanCompletedPayload, PlanCreatedPayload, PlanStepRef,
    RunRecoveredPayload, TaskCompletedPayload, TaskFailedPayload, TaskReadyPayload,
    WorkloadTriggerPayload,
};
pub use interpolate::{interpolate_string, interpolate_value, stringify_params};
pub use types::{
    AlertRecord, AlertSource, AlertTrigger, Id, InputParam, InputType, ManifestStep,
    MissedExecutionPolicy, OutputFormat, OutputKind, OutputRecord, PromptOutput, RunManifest,
    RunStatus, RunSummary, ScheduleRecord, StepDef, StepStatus, ValidationError, WorkerKind,
    WorkloadDefinition, WorkloadShape,
};
