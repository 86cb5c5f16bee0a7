pub mod ids;

pub use ids::{LeaseId, PipelineId, RunId, SchoolId};
