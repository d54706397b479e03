//! Workflow graph: builder and interpreter.
//!
//! A workflow's declared steps become tagged [`Node`]s wired in declaration
//! order. Non-conditional nodes get an implicit edge to the next declared
//! step (the last one to the terminal marker); conditional nodes pick one of
//! their two named branches at run time. The [`Interpreter`] walks the graph
//! from the first step, threading a [`WorkflowState`] through each node.

pub mod builder;
pub mod edge;
pub mod interpreter;
pub mod node;
pub mod state;

pub use builder::{build, ExecutableGraph};
pub use edge::{evaluate_condition, Edge};
pub use interpreter::{Interpreter, WorkflowRun};
pub use node::{ConditionalStep, Node, ParallelStep, SingleAgentStep};
pub use state::{resolve_path, WorkflowState};
