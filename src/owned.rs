use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::Client;
use kube_core::Resource;

use crate::unit_types::{OwnIngress, OwnPvc, OwnService, Unit, UnitCategory};
use crate::workload::OwnWorkload;
use crate::{ingress, pvc, service, workload, Error};

/// The closed set of resource kinds a Unit can own. Resolved once per
/// reconcile pass by [`own_resources`]; every variant supports the same four
/// operations (build, exists, apply, reflect status).
pub enum OwnedResource {
    Workload(OwnWorkload),
    Service(OwnService),
    Ingress(OwnIngress),
    Pvc(OwnPvc),
}

impl OwnedResource {
    pub fn kind(&self) -> &'static str {
        match self {
            OwnedResource::Workload(w) => w.kind(),
            OwnedResource::Service(_) => "Service",
            OwnedResource::Ingress(_) => "Ingress",
            OwnedResource::Pvc(_) => "PersistentVolumeClaim",
        }
    }

    /// Idempotent create-or-update of this resource for the given Unit.
    pub async fn apply(&self, unit: &Unit, client: &Client) -> Result<(), Error> {
        match self {
            OwnedResource::Workload(w) => workload::workload_apply(w, unit, client).await,
            OwnedResource::Service(s) => service::service_apply(s, unit, client).await,
            OwnedResource::Ingress(i) => ingress::ingress_apply(i, unit, client).await,
            OwnedResource::Pvc(p) => pvc::pvc_apply(p, unit, client).await,
        }
    }

    /// Merge this resource's observed state into the Unit's status. Does not
    /// persist anything; that is the status aggregator's job.
    pub async fn reflect_status(&self, unit: &mut Unit, client: &Client) -> Result<(), Error> {
        match self {
            OwnedResource::Workload(w) => workload::workload_reflect_status(w, unit, client).await,
            OwnedResource::Service(_) => service::service_reflect_status(unit, client).await,
            OwnedResource::Ingress(_) => ingress::ingress_reflect_status(unit, client).await,
            OwnedResource::Pvc(_) => pvc::pvc_reflect_status(unit, client).await,
        }
    }
}

/// Derive the owned-resource set from the Unit spec: exactly one workload
/// picked by category, then Service / Ingress / PVC when declared. The order
/// fixes the apply order so logs stay deterministic.
pub fn own_resources(unit: &Unit) -> Vec<OwnedResource> {
    let workload = match unit.spec.category {
        UnitCategory::Deployment => OwnWorkload::Deployment,
        UnitCategory::StatefulSet => OwnWorkload::StatefulSet,
    };
    let mut resources = vec![OwnedResource::Workload(workload)];

    let relation = &unit.spec.relation_resource;
    if let Some(svc) = &relation.service {
        resources.push(OwnedResource::Service(svc.clone()));
    }
    if let Some(ing) = &relation.ingress {
        resources.push(OwnedResource::Ingress(ing.clone()));
    }
    if let Some(pvc) = &relation.pvc {
        resources.push(OwnedResource::Pvc(pvc.clone()));
    }
    resources
}

/// Metadata every owned resource starts from: identity inherited from the
/// Unit plus the controller owner reference that makes the platform cascade
/// the delete.
pub fn owned_object_meta(unit: &Unit) -> metav1::ObjectMeta {
    metav1::ObjectMeta {
        name: unit.metadata.name.clone(),
        namespace: unit.metadata.namespace.clone(),
        labels: unit.metadata.labels.clone(),
        owner_references: unit.controller_owner_ref(&()).map(|oref| vec![oref]),
        ..metav1::ObjectMeta::default()
    }
}

/// A racing create losing to another writer is a benign outcome; the next
/// pass will diff against whatever won.
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(
        err,
        kube_client::Error::Api(kube_core::ErrorResponse { ref reason, .. })
            if reason == "AlreadyExists"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit_types::fixtures;
    use crate::unit_types::{OwnIngress, OwnPvc};
    use k8s_openapi::api::core::v1 as corev1;

    #[test]
    fn bare_unit_owns_exactly_one_workload() {
        let unit = fixtures::unit(UnitCategory::Deployment);
        let resources = own_resources(&unit);
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].kind(), "Deployment");
    }

    #[test]
    fn stateful_category_selects_statefulset() {
        let unit = fixtures::unit(UnitCategory::StatefulSet);
        let resources = own_resources(&unit);
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].kind(), "StatefulSet");
    }

    #[test]
    fn relation_resources_append_in_stable_order() {
        let mut unit = fixtures::service_unit();
        unit.spec.relation_resource.ingress = Some(OwnIngress {
            domains: vec!["demo.example.com".to_string()],
        });
        unit.spec.relation_resource.pvc = Some(OwnPvc {
            spec: corev1::PersistentVolumeClaimSpec::default(),
        });
        let kinds: Vec<&str> = own_resources(&unit).iter().map(|r| r.kind()).collect();
        assert_eq!(
            kinds,
            vec!["Deployment", "Service", "Ingress", "PersistentVolumeClaim"]
        );
    }

    #[test]
    fn owned_meta_links_back_to_unit() {
        let unit = fixtures::unit(UnitCategory::Deployment);
        let meta = owned_object_meta(&unit);
        assert_eq!(meta.name.as_deref(), Some("demo"));
        assert_eq!(meta.namespace.as_deref(), Some("default"));
        let owner = &meta.owner_references.expect("owner reference")[0];
        assert_eq!(owner.kind, "Unit");
        assert_eq!(owner.name, "demo");
        assert_eq!(owner.controller, Some(true));
    }
}
