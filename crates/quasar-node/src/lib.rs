pub mod executor;
pub mod planner;

pub use executor::{ExecutionReport, ReplicaExecutor, ServingEndpoint};
pub use planner::ReplicaPlanner;
