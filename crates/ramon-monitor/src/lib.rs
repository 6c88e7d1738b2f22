pub mod dispatcher;
pub mod engine;
pub mod model;
pub mod pipeline;

pub use dispatcher::{ActionDispatcher, DispatchSummary, ProcessSpawner, SpawnRequest, TokioSpawner};
pub use engine::{EngineParts, MonitorEngine};
pub use model::{Action, BuildContext, Condition, ExecCommand, Monitor, NotifyAction};
pub use pipeline::{ConditionPipeline, PipelineOutcome};
