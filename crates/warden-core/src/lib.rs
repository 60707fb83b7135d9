//! # warden-core
//!
//! Core types for the Warden policy engine:
//!
//! - the dynamic resource model with engine annotations
//! - resource-type descriptors (enumeration, detail and tag metadata)
//! - plugin registries with lifecycle subscribers
//! - the advisory cross-policy enumeration cache
//! - the per-run execution context (output dir, metrics, API counters)
//! - the `CloudClient` / `SessionFactory` boundary contracts
//! - the shared error taxonomy

pub mod cache;
pub mod client;
pub mod context;
pub mod error;
pub mod event;
pub mod registry;
pub mod resource;

pub use cache::{Cache, CacheKey};
pub use client::{CloudClient, PageIter, SessionFactory, StaticCloudClient, StaticSessionFactory};
pub use context::{ApiStats, Clock, ExecutionContext, LogSink, MetricsSink};
pub use error::{CloudError, PolicyError, ValidationIssue};
pub use event::Event;
pub use registry::{Registry, RegistryEvent};
pub use resource::{
    ANNOTATION_PREFIX, DetailSpec, EnumSpec, MATCHED_FILTERS, Resource, ResourceTypeDef,
};
