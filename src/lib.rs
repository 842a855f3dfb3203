//! Nested sampling with random-walk and normalizing-flow proposals.
//!
//! Start with [`sampler::NestedSampler`] and [`config::NestedSamplerConfig`].

pub mod archive;
pub mod config;
pub mod core;
mod dev_tools;
pub mod error;
pub mod evidence;
pub mod flow;
pub mod likelihood;
pub mod live;
pub mod point;
pub mod posterior;
pub mod proposal;
pub mod sampler;
pub mod stats;

pub use config::{FlowKind, NestedSamplerConfig};
pub use error::{NestError, RunFailure};
pub use likelihood::{IdentityTransform, LogLikelihood, PriorTransform};
pub use sampler::{NestedResult, NestedSampler, RunSummary, StopHandle, StopReason};
