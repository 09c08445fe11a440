//! Desired-state graphs
//!
//! [`builder`] translates cluster resources into [`ModelGraph`]s kept in the
//! [`GraphStore`]; the convergence engine reads them back by model key.

pub mod builder;
pub mod node;
pub mod store;

pub use builder::{BuildError, ClusterView, GraphBuilder};
pub use node::{
    checksum_of, routes_checksum, ChildNode, L4PolicySetNode, L4RuleNode, Listener, ModelGraph,
    NetworkProfile, PoolNode, PoolServer, RootNode, ServiceRef, StaticRouteNode, VipNode,
    VirtualServiceNode, VrfNode,
};
pub use store::{GraphStore, ModelSlot, SaveOutcome};
