//! lbsync-operator: converges Kubernetes LoadBalancer Services into an
//! external load-balancer controller

pub mod backend;
pub mod cache;
pub mod config;
pub mod controllers;
pub mod engine;
pub mod fullsync;
pub mod graph;
pub mod health;
pub mod keys;
pub mod leader;
pub mod metrics;
pub mod retry;
pub mod status;
pub mod workqueue;

pub use config::{LbSyncConfig, LbSyncConfigSpec};
