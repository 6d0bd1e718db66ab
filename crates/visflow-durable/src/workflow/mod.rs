//! Stage graphs, context propagation and the workflow runner

mod context;
mod graph;
mod runner;
mod stage;

pub use context::{Context, ContextError};
pub use graph::{GraphError, StageGraph};
pub use runner::{
    assemble_context, AssemblyError, StageStatus, SubmitError, WorkflowRunner, WorkflowState,
    WorkflowSubmission, WorkflowView,
};
pub use stage::{StageDef, StageEnvelope, StageRetry};
