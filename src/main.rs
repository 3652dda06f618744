pub mod finalizer;
pub mod ingress;
pub mod owned;
pub mod pvc;
pub mod service;
pub mod status;
pub mod unit_types;
pub mod workload;

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::networking::v1 as networkingv1;
use kube::{
    api::{Api, ListParams},
    runtime::controller::{Action, Controller},
    Client, CustomResourceExt,
};
use std::{env, sync::Arc};
use thiserror::Error;
use tokio::time::Duration;
use tracing::*;

use crate::finalizer::FinalizerOutcome;
use crate::unit_types::Unit;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to get Unit: {0}")]
    UnitGetFailed(#[source] kube::Error),
    #[error("Failed to update Unit finalizers: {0}")]
    FinalizerUpdateFailed(#[source] kube::Error),
    #[error("Failed to reconcile Deployment: {0}")]
    ReconcileDeploymentFailed(#[source] kube::Error),
    #[error("Failed to reconcile StatefulSet: {0}")]
    ReconcileStatefulSetFailed(#[source] kube::Error),
    #[error("Failed to reconcile Service: {0}")]
    ReconcileServiceFailed(#[source] kube::Error),
    #[error("Failed to reconcile Ingress: {0}")]
    ReconcileIngressFailed(#[source] kube::Error),
    #[error("Failed to reconcile PVC: {0}")]
    ReconcilePvcFailed(#[source] kube::Error),
    #[error("Failed to update Unit status: {0}")]
    StatusUpdateFailed(#[source] kube::Error),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
    #[error("Reconcile Unit {namespace}/{name} failed for: {failures}")]
    OwnedResourcesFailed {
        namespace: String,
        name: String,
        failures: String,
    },
}

// Data we want access to in error/reconcile calls
struct Data {
    client: Client,
}

/// One level-triggered convergence pass over a single Unit key.
///
/// All faults funnel into the returned `Result`; the controller runtime turns
/// an `Err` into a re-queue through `error_policy`, so the loop itself never
/// dies. A failing owned resource is recorded and its siblings still get
/// their turn.
async fn reconcile(unit_from_cache: Arc<Unit>, ctx: Arc<Data>) -> Result<Action, Error> {
    let client = &ctx.client;

    let name = unit_from_cache
        .metadata
        .name
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let namespace = unit_from_cache
        .metadata
        .namespace
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let units_api = Api::<Unit>::namespaced(client.clone(), namespace);

    // Work from a fresh copy, not the watch cache.
    let mut unit = match units_api.get_opt(name).await.map_err(Error::UnitGetFailed)? {
        Some(unit) => unit,
        None => {
            // Already gone; owned resources are garbage collected through
            // their owner references.
            info!("Unit {}/{} not found, end reconcile", namespace, name);
            return Ok(Action::await_change());
        }
    };

    // The finalizer token must be persisted before anything gets created, and
    // a terminating Unit gets no convergence at all.
    if finalizer::finalizer_step(&mut unit, &units_api).await? == FinalizerOutcome::Terminating {
        return Ok(Action::await_change());
    }

    let own_resources = owned::own_resources(&unit);

    // Apply every owned resource; one failing variant must not block the rest.
    let mut failures: Vec<String> = Vec::new();
    for resource in &own_resources {
        if let Err(e) = resource.apply(&unit, client).await {
            error!(
                "Apply {} for Unit {}/{} failed: {}",
                resource.kind(),
                namespace,
                name,
                e
            );
            failures.push(format!("{}: {}", resource.kind(), e));
        }
    }

    // Reflect observed state into a working copy, same isolation rules.
    let mut updated = unit.clone();
    for resource in &own_resources {
        if let Err(e) = resource.reflect_status(&mut updated, client).await {
            error!(
                "Reflect {} status for Unit {}/{} failed: {}",
                resource.kind(),
                namespace,
                name,
                e
            );
            failures.push(format!("{} status: {}", resource.kind(), e));
        }
    }

    // A status persist failure is logged but does not fail the pass; the next
    // event converges it again.
    if let Err(e) = status::persist_if_changed(&unit, &mut updated, &units_api).await {
        error!("Unable to update Unit {}/{} status: {}", namespace, name, e);
    }

    if failures.is_empty() {
        info!("Reconcile Unit {}/{} success", namespace, name);
        Ok(Action::requeue(Duration::from_secs(300)))
    } else {
        Err(Error::OwnedResourcesFailed {
            namespace: namespace.clone(),
            name: name.clone(),
            failures: failures.join("; "),
        })
    }
}

/// The controller triggers this on reconcile errors, with the actual error
/// value in hand.
fn error_policy(_unit: Arc<Unit>, error: &Error, _ctx: Arc<Data>) -> Action {
    warn!("Reconcile failed due to error: {}", error);
    Action::requeue(Duration::from_secs(10))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    let cmd = args.get(1).map(String::as_str).unwrap_or("");
    if cmd == "export" {
        info!("exporting custom resource definition");
        println!("{}", serde_yaml::to_string(&Unit::crd())?);
    } else if cmd == "run" {
        info!("running unit-controller");
        let client = Client::try_default().await?;
        let units = Api::<Unit>::all(client.clone());

        // Owned-resource events re-queue the owning Unit's key.
        Controller::new(units, ListParams::default())
            .owns(
                Api::<appsv1::Deployment>::all(client.clone()),
                ListParams::default(),
            )
            .owns(
                Api::<appsv1::StatefulSet>::all(client.clone()),
                ListParams::default(),
            )
            .owns(
                Api::<corev1::Service>::all(client.clone()),
                ListParams::default(),
            )
            .owns(
                Api::<networkingv1::Ingress>::all(client.clone()),
                ListParams::default(),
            )
            .owns(
                Api::<corev1::PersistentVolumeClaim>::all(client.clone()),
                ListParams::default(),
            )
            .shutdown_on_signal()
            .run(reconcile, error_policy, Arc::new(Data { client }))
            .for_each(|res| async move {
                match res {
                    Ok(o) => info!("reconciled {:?}", o),
                    Err(e) => warn!("reconcile failed: {}", e),
                }
            })
            .await;
        info!("controller terminated");
    } else {
        warn!("wrong command; please use \"export\" or \"run\"");
    }
    Ok(())
}
