//! Run state for BDD test executions.
//!
//! Two halves share this crate:
//!
//! - scoped variables: a per-batch [`Variables`] store with step, story,
//!   scenario and batch overlays, a small path language
//!   (`name[0].field:default`) and a forward channel to later batches;
//! - status aggregation: an execution tree per story that rolls step
//!   outcomes up into scenario and story statuses, counts them, and tracks
//!   the worst status of the whole run for the process exit code.
//!
//! [`DefaultPlanRunner`] replays a recorded [`RunPlan`] through both.

pub mod config;
pub mod context;
pub mod factory;
pub mod model;
pub mod path;
pub mod plan;
pub mod properties;
pub mod runner;
pub mod scope;
pub mod statistics;
pub mod status;
pub mod tracker;
pub mod value;
pub mod variables;

pub use config::*;
pub use context::VariableContext;
pub use factory::VariablesFactory;
pub use model::*;
pub use path::{resolve, Accessor, PathError, PathExpression};
pub use plan::*;
pub use runner::*;
pub use scope::VariableScope;
pub use statistics::{StatisticsReporter, StoryRun};
pub use status::*;
pub use tracker::{ExitCode, RunStatusTracker};
pub use value::{Record, VariableValue};
pub use variables::{VariableError, VariableMap, Variables, WorkerId};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
