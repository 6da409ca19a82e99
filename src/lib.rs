//! drydock: resource graph reconciliation engine.
//!
//! Takes declared resources (networks, containers, sidecars, clusters, jobs,
//! ingresses and friends), orders them by explicit and implicit
//! dependencies, and drives create/destroy calls through pluggable
//! providers: level by level, with bounded parallelism inside a level and
//! incremental state so a failed or interrupted run resumes cleanly.
//!
//! ```no_run
//! # async fn run(registry: drydock::ProviderRegistry) -> Result<(), drydock::EngineError> {
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let config = drydock::EngineConfig::new(".drydock");
//! let blueprint = drydock::core::parser::parse_blueprint_file(std::path::Path::new("stack.yaml"))?;
//! let cancel = CancellationToken::new();
//! drydock::core::executor::cancel_on_interrupt(cancel.clone());
//! let report = drydock::apply(&config, Arc::new(registry), &blueprint.resources, cancel).await?;
//! println!("{} created, {} unchanged", report.created(), report.unchanged);
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod providers;
pub mod tripwire;

pub use crate::core::config::EngineConfig;
pub use crate::core::error::EngineError;
pub use crate::core::executor::{apply, destroy, Scheduler};
pub use crate::core::resolver::build_graph;
pub use crate::core::state::StateStore;
pub use crate::core::types::{
    Declaration, Resource, ResourceGraph, ResourceRef, ResourceStatus, ResourceType, RunReport,
};
pub use crate::providers::{Provider, ProviderRegistry};
