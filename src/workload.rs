use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::*;

use crate::owned::{is_already_exists, owned_object_meta};
use crate::unit_types::Unit;
use crate::Error;

/// Name of the env var holding the pod's own name (downward API).
pub const POD_NAME_ENV: &str = "POD_NAME";
/// Name of the env var holding the owning Unit's name.
pub const APP_NAME_ENV: &str = "APPNAME";

/// The workload half of an owned-resource set: a Unit materializes as exactly
/// one of these, picked by `spec.category`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnWorkload {
    Deployment,
    StatefulSet,
}

impl OwnWorkload {
    pub fn kind(&self) -> &'static str {
        match self {
            OwnWorkload::Deployment => "Deployment",
            OwnWorkload::StatefulSet => "StatefulSet",
        }
    }
}

/// Strip any caller-supplied copies of the two identity env vars from the
/// primary container, then append the injected pair, so the result carries
/// exactly one of each no matter what the template declared.
fn inject_identity_env(
    template: &mut corev1::PodTemplateSpec,
    unit_name: &str,
) -> Result<(), Error> {
    let pod_spec = template
        .spec
        .as_mut()
        .ok_or(Error::MissingObjectKey(".spec.template.spec"))?;
    let container = pod_spec
        .containers
        .get_mut(0)
        .ok_or(Error::MissingObjectKey(".spec.template.spec.containers"))?;

    let mut envs: Vec<corev1::EnvVar> = container
        .env
        .take()
        .unwrap_or_default()
        .into_iter()
        .filter(|e| e.name != POD_NAME_ENV && e.name != APP_NAME_ENV)
        .collect();

    envs.push(corev1::EnvVar {
        name: POD_NAME_ENV.to_string(),
        value_from: Some(corev1::EnvVarSource {
            field_ref: Some(corev1::ObjectFieldSelector {
                api_version: Some("v1".to_string()),
                field_path: "metadata.name".to_string(),
            }),
            ..corev1::EnvVarSource::default()
        }),
        ..corev1::EnvVar::default()
    });
    envs.push(corev1::EnvVar {
        name: APP_NAME_ENV.to_string(),
        value: Some(unit_name.to_string()),
        ..corev1::EnvVar::default()
    });

    container.env = Some(envs);
    Ok(())
}

/// Pod template shared by both workload kinds: labels pinned to the Unit's
/// selector, identity env vars injected.
fn workload_pod_template(unit: &Unit) -> Result<corev1::PodTemplateSpec, Error> {
    let unit_name = unit
        .metadata
        .name
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    let selector = unit.selector();

    let mut template = unit.spec.template.clone();
    let mut template_meta = template.metadata.take().unwrap_or_default();
    template_meta.labels = selector.match_labels;
    template.metadata = Some(template_meta);

    inject_identity_env(&mut template, unit_name)?;
    Ok(template)
}

pub fn deployment_build(unit: &Unit) -> Result<appsv1::Deployment, Error> {
    Ok(appsv1::Deployment {
        metadata: owned_object_meta(unit),
        spec: Some(appsv1::DeploymentSpec {
            replicas: Some(unit.replicas()),
            selector: unit.selector(),
            template: workload_pod_template(unit)?,
            ..appsv1::DeploymentSpec::default()
        }),
        ..appsv1::Deployment::default()
    })
}

pub fn statefulset_build(unit: &Unit) -> Result<appsv1::StatefulSet, Error> {
    let unit_name = unit
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;
    Ok(appsv1::StatefulSet {
        metadata: owned_object_meta(unit),
        spec: Some(appsv1::StatefulSetSpec {
            replicas: Some(unit.replicas()),
            selector: unit.selector(),
            template: workload_pod_template(unit)?,
            // governing headless service shares the Unit's name
            service_name: unit_name,
            ..appsv1::StatefulSetSpec::default()
        }),
        ..appsv1::StatefulSet::default()
    })
}

pub fn deployment_needs_update(
    desired: &appsv1::Deployment,
    observed: &appsv1::Deployment,
) -> bool {
    desired.spec != observed.spec
}

pub fn statefulset_needs_update(
    desired: &appsv1::StatefulSet,
    observed: &appsv1::StatefulSet,
) -> bool {
    desired.spec != observed.spec
}

pub async fn workload_apply(
    workload: &OwnWorkload,
    unit: &Unit,
    client: &Client,
) -> Result<(), Error> {
    match workload {
        OwnWorkload::Deployment => deployment_apply(unit, client).await,
        OwnWorkload::StatefulSet => statefulset_apply(unit, client).await,
    }
}

async fn deployment_apply(unit: &Unit, client: &Client) -> Result<(), Error> {
    let namespace = unit
        .metadata
        .namespace
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api = Api::<appsv1::Deployment>::namespaced(client.clone(), namespace);

    let desired = deployment_build(unit)?;
    let name = desired
        .metadata
        .name
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;

    let observed = api
        .get_opt(name)
        .await
        .map_err(Error::ReconcileDeploymentFailed)?;
    match observed {
        None => {
            info!("Create Deployment: {}/{}", namespace, name);
            match api.create(&PostParams::default(), &desired).await {
                Err(e) if is_already_exists(&e) => Ok(()),
                Err(e) => Err(Error::ReconcileDeploymentFailed(e)),
                Ok(_) => Ok(()),
            }
        }
        Some(found) => {
            if deployment_needs_update(&desired, &found) {
                info!("Update Deployment: {}/{}", namespace, name);
                let updated = appsv1::Deployment {
                    spec: desired.spec,
                    ..found
                };
                api.replace(name, &PostParams::default(), &updated)
                    .await
                    .map_err(Error::ReconcileDeploymentFailed)?;
            }
            Ok(())
        }
    }
}

async fn statefulset_apply(unit: &Unit, client: &Client) -> Result<(), Error> {
    let namespace = unit
        .metadata
        .namespace
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api = Api::<appsv1::StatefulSet>::namespaced(client.clone(), namespace);

    let desired = statefulset_build(unit)?;
    let name = desired
        .metadata
        .name
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;

    let observed = api
        .get_opt(name)
        .await
        .map_err(Error::ReconcileStatefulSetFailed)?;
    match observed {
        None => {
            info!("Create StatefulSet: {}/{}", namespace, name);
            match api.create(&PostParams::default(), &desired).await {
                Err(e) if is_already_exists(&e) => Ok(()),
                Err(e) => Err(Error::ReconcileStatefulSetFailed(e)),
                Ok(_) => Ok(()),
            }
        }
        Some(found) => {
            if statefulset_needs_update(&desired, &found) {
                info!("Update StatefulSet: {}/{}", namespace, name);
                let updated = appsv1::StatefulSet {
                    spec: desired.spec,
                    ..found
                };
                api.replace(name, &PostParams::default(), &updated)
                    .await
                    .map_err(Error::ReconcileStatefulSetFailed)?;
            }
            Ok(())
        }
    }
}

/// Human-readable selector string for the status subresource, e.g. `app=demo`.
fn selector_string(unit: &Unit) -> String {
    unit.selector()
        .match_labels
        .unwrap_or_default()
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Mirror the observed workload status into the Unit, along with the
/// top-level replica count and selector string used by the scale subresource.
pub async fn workload_reflect_status(
    workload: &OwnWorkload,
    unit: &mut Unit,
    client: &Client,
) -> Result<(), Error> {
    let namespace = unit
        .metadata
        .namespace
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let name = unit
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;

    let selector = selector_string(unit);
    unit.status.get_or_insert_with(Default::default).selector = selector;

    match workload {
        OwnWorkload::Deployment => {
            let api = Api::<appsv1::Deployment>::namespaced(client.clone(), &namespace);
            let found = match api
                .get_opt(&name)
                .await
                .map_err(Error::ReconcileDeploymentFailed)?
            {
                Some(found) => found,
                None => {
                    debug!("Deployment {}/{} not observed yet", namespace, name);
                    return Ok(());
                }
            };
            let status = unit.status.get_or_insert_with(Default::default);
            status.replicas = found.status.as_ref().and_then(|s| s.replicas);
            status.deployment = found.status;
        }
        OwnWorkload::StatefulSet => {
            let api = Api::<appsv1::StatefulSet>::namespaced(client.clone(), &namespace);
            let found = match api
                .get_opt(&name)
                .await
                .map_err(Error::ReconcileStatefulSetFailed)?
            {
                Some(found) => found,
                None => {
                    debug!("StatefulSet {}/{} not observed yet", namespace, name);
                    return Ok(());
                }
            };
            let status = unit.status.get_or_insert_with(Default::default);
            status.replicas = found.status.as_ref().map(|s| s.replicas);
            status.stateful_set = found.status;
        }
    }
    Ok(())
}
