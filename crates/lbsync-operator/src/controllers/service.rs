//! Service and Endpoints watchers
//!
//! Both kinds map to the same ingestion key, so a change in either rebuilds
//! the Service's whole model.

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Endpoints, Service};
use kube::runtime::reflector::store::Writer;
use kube::{Api, Client, ResourceExt};

use super::{watch, Dispatcher, ResourceChange};

fn service_change(service: &Service) -> Option<ResourceChange> {
    Some(ResourceChange::Service {
        namespace: service.namespace()?,
        name: service.metadata.name.clone()?,
    })
}

fn endpoints_change(endpoints: &Endpoints) -> Option<ResourceChange> {
    Some(ResourceChange::Endpoints {
        namespace: endpoints.namespace()?,
        name: endpoints.metadata.name.clone()?,
    })
}

pub async fn run_services(client: Client, writer: Writer<Service>, dispatcher: Arc<Dispatcher>) {
    watch(Api::<Service>::all(client), writer, dispatcher, service_change).await;
}

pub async fn run_endpoints(client: Client, writer: Writer<Endpoints>, dispatcher: Arc<Dispatcher>) {
    watch(Api::<Endpoints>::all(client), writer, dispatcher, endpoints_change).await;
}
