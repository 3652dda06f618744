use k8s_openapi::api::core::v1 as corev1;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::*;

use crate::owned::{is_already_exists, owned_object_meta};
use crate::unit_types::{OwnPvc, Unit};
use crate::Error;

/// The claim spec is the caller's, passed through untouched; only identity
/// and ownership come from the Unit.
pub fn pvc_build(own: &OwnPvc, unit: &Unit) -> corev1::PersistentVolumeClaim {
    corev1::PersistentVolumeClaim {
        metadata: owned_object_meta(unit),
        spec: Some(own.spec.clone()),
        ..corev1::PersistentVolumeClaim::default()
    }
}

pub fn pvc_needs_update(
    desired: &corev1::PersistentVolumeClaim,
    observed: &corev1::PersistentVolumeClaim,
) -> bool {
    desired.spec != observed.spec
}

pub async fn pvc_apply(own: &OwnPvc, unit: &Unit, client: &Client) -> Result<(), Error> {
    let namespace = unit
        .metadata
        .namespace
        .as_ref()
        .ok_or(Error::MissingObjectKey(".metadata.namespace"))?;
    let api = Api::<corev1::PersistentVolumeClaim>::namespaced(client.clone(), namespace);

    let desired = pvc_build(own, unit);
    let name = desired
        .metadata
        .name
        .clone()
        .ok_or(Error::MissingObjectKey(".metadata.name"))?;

    let observed = api.get_opt(&name).await.map_err(Error::ReconcilePvcFailed)?;
    match observed {
        None => {
            info!("Create PVC: {}/{}", namespace, name);
            match api.create(&PostParams::default(), &desired).await {
                Err(e) if is_already_exists(&e) => Ok(()),
                Err(e) => Err(Error::ReconcilePvcFailed(e)),
                Ok(_) => Ok(()),
            }
        }
        Some(found) => {
            if pvc_needs_update(&desired, &found) {
                info!("Update PVC: {}/{}", namespace, name);
                let updated = corev1::PersistentVolumeClaim {
                    spec: desired.spec,
                    ..found
                };
                api.replace(&name, &PostParams::default(), &updated)
                    .await
                    .map_err(Error::ReconcilePvcFailed)?;
            }
            Ok(())
        }
    }
}

pub async fn pvc_reflect_status(unit: &mut Unit, client: &Client) -> Result<(), Error> {
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

    let api = Api::<corev1::PersistentVolumeClaim>::namespaced(client.clone(), &namespace);
    let found = match api.get_opt(&name).await.map_err(Error::ReconcilePvcFailed)? {
        Some(found) => found,
        None => {
            debug!("PVC {}/{} not observed yet", namespace, name);
            return Ok(());
        }
    };

    let status = unit.status.get_or_insert_with(Default::default);
    status
        .relation_resource_status
        .get_or_insert_with(Default::default)
        .pvc = found.status;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit_types::{fixtures, UnitCategory};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use std::collections::BTreeMap;

    fn claim_spec(storage: &str) -> corev1::PersistentVolumeClaimSpec {
        corev1::PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(corev1::ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.to_string()),
                )])),
                ..corev1::ResourceRequirements::default()
            }),
            ..corev1::PersistentVolumeClaimSpec::default()
        }
    }

    #[test]
    fn claim_spec_passes_through() {
        let unit = fixtures::unit(UnitCategory::Deployment);
        let own = OwnPvc {
            spec: claim_spec("10Gi"),
        };
        let pvc = pvc_build(&own, &unit);
        assert_eq!(pvc.metadata.name.as_deref(), Some("demo"));
        assert_eq!(pvc.spec, Some(own.spec));
    }

    #[test]
    fn unchanged_claim_does_not_update() {
        let unit = fixtures::unit(UnitCategory::Deployment);
        let own = OwnPvc {
            spec: claim_spec("10Gi"),
        };
        let observed = pvc_build(&own, &unit);
        let desired = pvc_build(&own, &unit);
        assert!(!pvc_needs_update(&desired, &observed));
    }

    #[test]
    fn resized_claim_is_detected() {
        let unit = fixtures::unit(UnitCategory::Deployment);
        let observed = pvc_build(
            &OwnPvc {
                spec: claim_spec("10Gi"),
            },
            &unit,
        );
        let desired = pvc_build(
            &OwnPvc {
                spec: claim_spec("20Gi"),
            },
            &unit,
        );
        assert!(pvc_needs_update(&desired, &observed));
    }
}
