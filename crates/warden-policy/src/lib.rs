//! Policy DSL for the Warden engine.
//!
//! This crate owns the vocabulary a policy document is written in: the
//! value matcher, the filter and action plugin registries, the provider
//! model that binds them to resource types, and the JSON-schema assembly
//! and validation for the whole document. Executing policies against a
//! cloud lives in `warden-runtime`; this crate is purely about building
//! and checking the pieces.

pub mod actions;
pub mod filters;
pub mod provider;
pub mod schema;
pub mod value;

pub use actions::{
    Action, ActionBuildCtx, ActionContext, ActionExecutor, ActionPlugin, ActionRegistry,
    ActionResult, CloudOpAction, base_action_registry, build_action, build_action_chain,
};
pub use filters::{
    Filter, FilterBuildCtx, FilterContext, FilterPlugin, FilterRegistry, base_filter_registry,
    build_filter, build_filter_chain, normalize_filter,
};
pub use provider::{Provider, ResourcePlugin};
pub use schema::{build_schema, normalize_policies, validate_document};
pub use value::{Op, ValueMatch, ValueType};
