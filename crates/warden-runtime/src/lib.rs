//! Policy execution runtime.
//!
//! Binds the policy DSL from `warden-policy` to a live cloud client: the
//! resource manager drives enumerate → augment → cache, the policy runs
//! filter → act under a scoped execution context, modes decide where
//! candidates come from, and collections load whole policy files and run
//! them with partial-failure semantics.

pub mod collection;
pub mod manager;
pub mod modes;
pub mod output;
pub mod policy;

pub use collection::{CollectionResult, PolicyCollection, PolicyOutcome};
pub use manager::ResourceManager;
pub use modes::{Compliance, Mode, Verdict};
pub use output::{render_csv, report_rows};
pub use policy::{Policy, PolicyData, PolicyRunResult, RunOptions, expand_variables};
