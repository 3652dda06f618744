use k8s_openapi::api::apps::v1 as appsv1;
use k8s_openapi::api::core::v1 as corev1;
use k8s_openapi::api::networking::v1 as networkingv1;
use k8s_openapi::apimachinery::pkg::apis::meta::v1 as metav1;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The workload kind a Unit materializes as. Anything outside these two
/// literals is rejected at deserialization, so the owned-resource-set builder
/// never has to fall back to a default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum UnitCategory {
    Deployment,
    StatefulSet,
}

/// Sub-specs for the optional resources a Unit owns next to its workload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct UnitRelationResourceSpec {
    #[serde(rename = "serviceInfo", skip_serializing_if = "Option::is_none")]
    pub service: Option<OwnService>,
    #[serde(rename = "pvcInfo", skip_serializing_if = "Option::is_none")]
    pub pvc: Option<OwnPvc>,
    #[serde(rename = "ingressInfo", skip_serializing_if = "Option::is_none")]
    pub ingress: Option<OwnIngress>,
}

/// Caller-declared Service ports and an optional fixed cluster IP. Selector
/// and type are not configurable; the controller forces them.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct OwnService {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<corev1::ServicePort>,
    #[serde(rename = "clusterIP", skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
}

/// One Ingress rule is generated per declared domain.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct OwnIngress {
    #[serde(rename = "domain")]
    pub domains: Vec<String>,
}

/// PersistentVolumeClaim spec, passed through untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct OwnPvc {
    pub spec: corev1::PersistentVolumeClaimSpec,
}

/// UnitSpec defines the desired state of a Unit.
///
/// `replicas` and `selector` are filled by the admission mutating webhook
/// before this controller ever sees the object; `category` is validated
/// there as well.
#[derive(CustomResource, Debug, Clone, Deserialize, Serialize, JsonSchema)]
#[kube(group = "custom.my.crd.com", version = "v1", kind = "Unit")]
#[kube(status = "UnitStatus", shortname = "unit", namespaced)]
pub struct UnitSpec {
    pub category: UnitCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<metav1::LabelSelector>,
    pub template: corev1::PodTemplateSpec,
    #[serde(rename = "relationResource", default)]
    pub relation_resource: UnitRelationResourceSpec,
}

/// A Service port together with the result of its reachability probe.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct ServicePortStatus {
    #[serde(rename = "servicePort")]
    pub service_port: corev1::ServicePort,
    #[serde(default)]
    pub health: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct UnitRelationServiceStatus {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(rename = "clusterIP", skip_serializing_if = "Option::is_none")]
    pub cluster_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<ServicePortStatus>,
    #[serde(rename = "sessionAffinity", skip_serializing_if = "Option::is_none")]
    pub session_affinity: Option<String>,
}

/// One Endpoints member: which pod, at which address, on which node.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct UnitRelationEndpointStatus {
    #[serde(rename = "podName")]
    pub pod_name: String,
    #[serde(rename = "podIP")]
    pub pod_ip: String,
    #[serde(rename = "nodeName")]
    pub node_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct UnitRelationResourceStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<UnitRelationServiceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ingress: Option<Vec<networkingv1::IngressRule>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<Vec<UnitRelationEndpointStatus>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pvc: Option<corev1::PersistentVolumeClaimStatus>,
}

/// UnitStatus defines the observed state of a Unit. The base workload status
/// is mirrored verbatim from the owned Deployment or StatefulSet.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
pub struct UnitStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default)]
    pub selector: String,
    #[serde(rename = "lastUpdateTime", skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<metav1::Time>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment: Option<appsv1::DeploymentStatus>,
    #[serde(rename = "statefulSet", skip_serializing_if = "Option::is_none")]
    pub stateful_set: Option<appsv1::StatefulSetStatus>,
    #[serde(
        rename = "relationResourceStatus",
        skip_serializing_if = "Option::is_none"
    )]
    pub relation_resource_status: Option<UnitRelationResourceStatus>,
}

impl Unit {
    /// Selector the workload uses, falling back to the `{app: name}` default
    /// the admission webhook would have filled in.
    pub fn selector(&self) -> metav1::LabelSelector {
        self.spec.selector.clone().unwrap_or_else(|| {
            metav1::LabelSelector {
                match_labels: Some(std::collections::BTreeMap::from([(
                    "app".to_string(),
                    self.metadata.name.clone().unwrap_or_default(),
                )])),
                ..metav1::LabelSelector::default()
            }
        })
    }

    pub fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1)
    }
}

#[cfg(test)]
pub mod fixtures {
    use super::*;
    use std::collections::BTreeMap;

    /// A defaulted Unit the way it looks after admission: replicas and
    /// selector filled, one container, a uid so owner references resolve.
    pub fn unit(category: UnitCategory) -> Unit {
        let labels = BTreeMap::from([("app".to_string(), "demo".to_string())]);
        let mut unit = Unit::new(
            "demo",
            UnitSpec {
                category,
                replicas: Some(3),
                selector: Some(metav1::LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..metav1::LabelSelector::default()
                }),
                template: corev1::PodTemplateSpec {
                    metadata: Some(metav1::ObjectMeta {
                        labels: Some(labels.clone()),
                        ..metav1::ObjectMeta::default()
                    }),
                    spec: Some(corev1::PodSpec {
                        containers: vec![corev1::Container {
                            name: "app".to_string(),
                            image: Some("nginx:1.25".to_string()),
                            env: Some(vec![
                                corev1::EnvVar {
                                    name: "FOO".to_string(),
                                    value: Some("bar".to_string()),
                                    ..corev1::EnvVar::default()
                                },
                                // stale copy that injection must strip
                                corev1::EnvVar {
                                    name: "POD_NAME".to_string(),
                                    value: Some("stale".to_string()),
                                    ..corev1::EnvVar::default()
                                },
                            ]),
                            ..corev1::Container::default()
                        }],
                        ..corev1::PodSpec::default()
                    }),
                },
                relation_resource: UnitRelationResourceSpec::default(),
            },
        );
        unit.metadata.namespace = Some("default".to_string());
        unit.metadata.uid = Some("f2a9c0de-8d3b-4b2e-9e61-000000000001".to_string());
        unit.metadata.labels = Some(labels);
        unit
    }

    pub fn service_unit() -> Unit {
        let mut u = unit(UnitCategory::Deployment);
        u.spec.relation_resource.service = Some(OwnService {
            ports: vec![corev1::ServicePort {
                port: 80,
                ..corev1::ServicePort::default()
            }],
            cluster_ip: None,
        });
        u
    }
}
