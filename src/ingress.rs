use k8s_openapi::api::networking::v1 as networkingv1;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::*;

use crate::owned::{is_already_exists, owned_object_meta};
use crate::unit_types::{OwnIngress, Unit};
use crate::Error;

/// One rule per declared domain. Units only carry plain HTTP traffic, so
/// every rule is pinned to path `/` and the port-80 backend of the Service
/// that shares the Unit's name.
pub fn ingress_build(own: &OwnIngress, unit: &Unit) -> networkingv1::Ingress {
    let unit_name = unit.metadata.name.clone().unwrap_or_default();

    let rules: Vec<networkingv1::IngressRule> = own
        .domains
        .iter()
        .map(|domain| networkingv1::IngressRule {
            host: Some(domain.clone()),
            http: Some(networkingv1::HTTPIngressRuleValue {
                paths: vec![networkingv1::HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                    backend: networkingv1::IngressBackend {
                        service: Some(networkingv1::IngressServiceBackend {
                            name: unit_name.clone(),
                            port: Some(networkingv1::ServiceBackendPort {
                                number: Some(80),
                                ..networkingv1::ServiceBackendPort::default()
                            }),
                        }),
                        ..networkingv1::IngressBackend::default()
                    },
                }],
            }),
        })
        .collect();

    networkingv1::Ingress {
        metadata: owned_object_meta(unit),
        spec: Some(networkingv1::IngressSpec {
            rules: Some(rules),
            ..networkingv1::IngressSpec::default()
        }),
        ..networkingv1::Ingress::default()
    }
}

pub fn ingress_needs_update(
    desired: &networkingv1::Ingress,
    observed: &networkingv1::Ingress,
) -> bool {
    let desired_rules = desired.spec.as_ref().and_then(|s| s.rules.as_ref());
    let observed_rules = observed.spec.as_ref().and_then(|s| s.rules.as_ref());
    desired_rules != observed_rules
}

pub async fn ingress_apply(own: &OwnIngress, unit: &Unit, client: &Client) -> Result<(), Error> {
    let namespace = unit
        .metadata
        .namespace
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api = Api::<networkingv1::Ingress>::namespaced(client.clone(), namespace);

    let desired = ingress_build(own, unit);
    let name = desired
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;

    let observed = api
        .get_opt(&name)
        .await
        .map_err(Error::ReconcileIngressFailed)?;
    match observed {
        None => {
            info!("Create Ingress: {}/{}", namespace, name);
            match api.create(&PostParams::default(), &desired).await {
                Err(e) if is_already_exists(&e) => Ok(()),
                Err(e) => Err(Error::ReconcileIngressFailed(e)),
                Ok(_) => Ok(()),
            }
        }
        Some(found) => {
            if ingress_needs_update(&desired, &found) {
                info!("Update Ingress: {}/{}", namespace, name);
                let updated = networkingv1::Ingress {
                    spec: desired.spec,
                    ..found
                };
                api.replace(&name, &PostParams::default(), &updated)
                    .await
                    .map_err(Error::ReconcileIngressFailed)?;
            }
            Ok(())
        }
    }
}

pub async fn ingress_reflect_status(unit: &mut Unit, client: &Client) -> Result<(), Error> {
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

    let api = Api::<networkingv1::Ingress>::namespaced(client.clone(), &namespace);
    let found = match api
        .get_opt(&name)
        .await
        .map_err(Error::ReconcileIngressFailed)?
    {
        Some(found) => found,
        None => {
            debug!("Ingress {}/{} not observed yet", namespace, name);
            return Ok(());
        }
    };

    let status = unit.status.get_or_insert_with(Default::default);
    status
        .relation_resource_status
        .get_or_insert_with(Default::default)
        .ingress = found.spec.and_then(|s| s.rules);
    Ok(())
}
