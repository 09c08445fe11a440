//! Node watcher feeding the VRF static routes

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::runtime::reflector::store::Writer;
use kube::{Api, Client};

use super::{watch, Dispatcher, ResourceChange};

fn node_change(node: &Node) -> Option<ResourceChange> {
    Some(ResourceChange::Node {
        name: node.metadata.name.clone()?,
    })
}

pub async fn run(client: Client, writer: Writer<Node>, dispatcher: Arc<Dispatcher>) {
    watch(Api::<Node>::all(client), writer, dispatcher, node_change).await;
}
