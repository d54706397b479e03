pub mod dispatch;
pub mod engine;
pub mod graph;
pub mod lifecycle;
pub mod retention;
pub mod worker;

pub use dispatch::LocalDispatcher;
pub use engine::Engine;
pub use graph::{build, ExecutableGraph, Interpreter, WorkflowRun, WorkflowState};
pub use lifecycle::{ExecutionDetail, ExecutionLogSink, LifecycleManager};
pub use retention::RetentionSweeper;
pub use worker::{Worker, WorkerPool};
