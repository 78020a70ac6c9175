//! skyhost ops - operations, their registry and the pipeline that runs them

pub mod operation;
pub mod ops;
pub mod pipeline;
pub mod registry;

pub use operation::{CreateOperation, FnFactory, Operation, OperationFactory, OperationResult};
pub use pipeline::{OperationProcess, OperationTask, PipelineReport, VARIABLE_ROOT_DIR};
pub use registry::OperationRegistry;
