//! # fargate_rds
//!
//! Declares one deployment topology (a VPC, a Postgres instance, a containerized
//! web application behind an application load balancer, a TLS certificate, DNS
//! and a media bucket) and synthesizes it into a CloudFormation template.
//!
//! Resources are plain `serde_json` values collected in an explicit [`Stack`].
//! Each module under [`resources`] adds one layer and hands back the logical ids
//! the next layer refers to; [`topology::synthesize`] wires them together.

#![forbid(unsafe_code)]

pub mod asset;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod regions;
pub mod resources;
pub mod stack;
pub mod topology;

pub use config::TopologyConfig;
pub use context::SynthContext;
pub use error::{Result, SynthError};
pub use stack::{ProvisioningPlan, Stack};
pub use topology::synthesize;
