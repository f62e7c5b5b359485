pub mod context;
pub mod pipeline;
pub mod stage;

pub use context::{error_response, PipelineContext};
pub use pipeline::{Pipeline, PipelineDeps};
pub use stage::{Stage, StageOutcome};
