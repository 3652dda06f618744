use std::collections::BTreeMap;

use k8s_openapi::api::core::v1 as corev1;
use kube::api::{Api, PostParams};
use kube::Client;
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{timeout, Duration};
use tracing::*;

use crate::owned::{is_already_exists, owned_object_meta};
use crate::unit_types::{
    OwnService, ServicePortStatus, Unit, UnitRelationEndpointStatus, UnitRelationServiceStatus,
};
use crate::Error;

/// Upper bound on one port probe; reconcile must never hang on a dead port.
const PROBE_TIMEOUT: Duration = Duration::from_millis(100);

pub fn service_build(own: &OwnService, unit: &Unit) -> corev1::Service {
    let unit_name = unit.metadata.name.clone().unwrap_or_default();
    corev1::Service {
        metadata: owned_object_meta(unit),
        spec: Some(corev1::ServiceSpec {
            ports: Some(own.ports.clone()),
            type_: Some("ClusterIP".to_string()),
            cluster_ip: own.cluster_ip.clone(),
            // selector is not caller-configurable
            selector: Some(BTreeMap::from([("app".to_string(), unit_name)])),
            ..corev1::ServiceSpec::default()
        }),
        ..corev1::Service::default()
    }
}

/// The platform assigns the cluster IP and session affinity after creation;
/// copy them into the candidate so they never show up as a diff. The copy is
/// unconditional: clusterIP is immutable once assigned, so an update carrying
/// a different declared IP would only be rejected by the API server.
pub fn carry_forward_platform_fields(desired: &mut corev1::Service, observed: &corev1::Service) {
    let observed_spec = match &observed.spec {
        Some(spec) => spec,
        None => return,
    };
    if let Some(spec) = desired.spec.as_mut() {
        spec.cluster_ip = observed_spec.cluster_ip.clone();
        spec.cluster_ips = observed_spec.cluster_ips.clone();
        spec.session_affinity = observed_spec.session_affinity.clone();
    }
}

pub fn service_needs_update(desired: &corev1::Service, observed: &corev1::Service) -> bool {
    desired.spec != observed.spec
}

pub async fn service_apply(own: &OwnService, unit: &Unit, client: &Client) -> Result<(), Error> {
    let namespace = unit
        .metadata
        .namespace
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api = Api::<corev1::Service>::namespaced(client.clone(), namespace);

    let mut desired = service_build(own, unit);
    let name = desired
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;

    let observed = api
        .get_opt(&name)
        .await
        .map_err(Error::ReconcileServiceFailed)?;
    match observed {
        None => {
            info!("Create Service: {}/{}", namespace, name);
            match api.create(&PostParams::default(), &desired).await {
                Err(e) if is_already_exists(&e) => Ok(()),
                Err(e) => Err(Error::ReconcileServiceFailed(e)),
                Ok(_) => Ok(()),
            }
        }
        Some(found) => {
            carry_forward_platform_fields(&mut desired, &found);
            if service_needs_update(&desired, &found) {
                info!("Update Service: {}/{}", namespace, name);
                let updated = corev1::Service {
                    spec: desired.spec,
                    ..found
                };
                api.replace(&name, &PostParams::default(), &updated)
                    .await
                    .map_err(Error::ReconcileServiceFailed)?;
            }
            Ok(())
        }
    }
}

/// Short-timeout reachability check against one declared port. Any failure
/// (unresolvable address, refused, timed out) just means unhealthy.
pub async fn probe_port(addr: &str, port: i32, protocol: &str) -> bool {
    let sock = format!("{}:{}", addr, port);
    match protocol.to_ascii_uppercase().as_str() {
        "UDP" => matches!(
            timeout(PROBE_TIMEOUT, async {
                UdpSocket::bind("0.0.0.0:0").await?.connect(&sock).await
            })
            .await,
            Ok(Ok(()))
        ),
        // TCP is the default protocol when none is declared
        _ => matches!(
            timeout(PROBE_TIMEOUT, TcpStream::connect(&sock)).await,
            Ok(Ok(_))
        ),
    }
}

/// Reflect the observed Service into the Unit status: per-port health from an
/// active probe, plus member triples from the sibling Endpoints object when
/// one exists.
pub async fn service_reflect_status(unit: &mut Unit, client: &Client) -> Result<(), Error> {
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

    let svc_api = Api::<corev1::Service>::namespaced(client.clone(), &namespace);
    let found = match svc_api
        .get_opt(&name)
        .await
        .map_err(Error::ReconcileServiceFailed)?
    {
        Some(found) => found,
        None => {
            debug!("Service {}/{} not observed yet", namespace, name);
            return Ok(());
        }
    };
    let found_spec = found.spec.unwrap_or_default();
    let cluster_ip = found_spec.cluster_ip.clone().unwrap_or_default();

    let mut ports_status = Vec::new();
    for port in found_spec.ports.clone().unwrap_or_default() {
        let protocol = port.protocol.clone().unwrap_or_else(|| "TCP".to_string());
        let health = probe_port(&cluster_ip, port.port, &protocol).await;
        if !health {
            debug!(
                "Service {}/{} port {} failed the reachability probe",
                namespace, name, port.port
            );
        }
        ports_status.push(ServicePortStatus {
            service_port: port,
            health,
        });
    }

    let status = unit.status.get_or_insert_with(Default::default);
    let relation = status
        .relation_resource_status
        .get_or_insert_with(Default::default);
    relation.service = Some(UnitRelationServiceStatus {
        type_: found_spec.type_,
        cluster_ip: found_spec.cluster_ip,
        ports: ports_status,
        session_affinity: found_spec.session_affinity,
    });

    // Endpoints shares the Service's name; absence just means no members yet.
    let ep_api = Api::<corev1::Endpoints>::namespaced(client.clone(), &namespace);
    if let Some(endpoints) = ep_api
        .get_opt(&name)
        .await
        .map_err(Error::ReconcileServiceFailed)?
    {
        let mut members = Vec::new();
        for subset in endpoints.subsets.unwrap_or_default() {
            for address in subset.addresses.unwrap_or_default() {
                members.push(UnitRelationEndpointStatus {
                    pod_name: address.hostname.unwrap_or_default(),
                    pod_ip: address.ip,
                    node_name: address.node_name.unwrap_or_default(),
                });
            }
        }
        if !members.is_empty() {
            relation.endpoint = Some(members);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit_types::fixtures;

    #[test]
    fn selector_is_forced_to_app_name() {
        let unit = fixtures::service_unit();
        let own = unit.spec.relation_resource.service.clone().unwrap();
        let svc = service_build(&own, &unit);
        let spec = svc.spec.unwrap();
        assert_eq!(
            spec.selector,
            Some(BTreeMap::from([("app".to_string(), "demo".to_string())]))
        );
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(spec.cluster_ip, None);
    }

    #[test]
    fn fixed_cluster_ip_is_honored() {
        let unit = fixtures::service_unit();
        let mut own = unit.spec.relation_resource.service.clone().unwrap();
        own.cluster_ip = Some("10.0.0.9".to_string());
        let svc = service_build(&own, &unit);
        assert_eq!(svc.spec.unwrap().cluster_ip.as_deref(), Some("10.0.0.9"));
    }

    #[test]
    fn platform_assigned_address_does_not_trigger_update() {
        let unit = fixtures::service_unit();
        let own = unit.spec.relation_resource.service.clone().unwrap();

        // what the store hands back after creation: address and affinity set
        let mut observed = service_build(&own, &unit);
        {
            let spec = observed.spec.as_mut().unwrap();
            spec.cluster_ip = Some("10.0.0.5".to_string());
            spec.cluster_ips = Some(vec!["10.0.0.5".to_string()]);
            spec.session_affinity = Some("None".to_string());
        }

        let mut desired = service_build(&own, &unit);
        carry_forward_platform_fields(&mut desired, &observed);
        assert!(!service_needs_update(&desired, &observed));
    }

    #[test]
    fn assigned_address_wins_over_declared_fixed_ip() {
        // IP declared only after the Service was created with an assigned
        // one; clusterIP is immutable, so no update may be issued
        let unit = fixtures::service_unit();
        let own = unit.spec.relation_resource.service.clone().unwrap();

        let mut observed = service_build(&own, &unit);
        observed.spec.as_mut().unwrap().cluster_ip = Some("10.0.0.5".to_string());

        let mut declared = own.clone();
        declared.cluster_ip = Some("10.0.0.9".to_string());
        let mut desired = service_build(&declared, &unit);
        carry_forward_platform_fields(&mut desired, &observed);
        assert!(!service_needs_update(&desired, &observed));
    }

    #[test]
    fn declared_port_change_is_detected() {
        let unit = fixtures::service_unit();
        let own = unit.spec.relation_resource.service.clone().unwrap();
        let observed = service_build(&own, &unit);

        let mut changed = own.clone();
        changed.ports[0].port = 8080;
        let mut desired = service_build(&changed, &unit);
        carry_forward_platform_fields(&mut desired, &observed);
        assert!(service_needs_update(&desired, &observed));
    }

    #[tokio::test]
    async fn tcp_probe_reaches_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe_port("127.0.0.1", i32::from(port), "TCP").await);
    }

    #[tokio::test]
    async fn tcp_probe_fails_closed_port() {
        // bind-then-drop leaves the port closed
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!probe_port("127.0.0.1", i32::from(port), "TCP").await);
    }

    #[tokio::test]
    async fn udp_probe_is_connectionless() {
        assert!(probe_port("127.0.0.1", 9, "UDP").await);
    }

    #[tokio::test]
    async fn probe_tolerates_garbage_address() {
        assert!(!probe_port("", 80, "TCP").await);
    }
}
