//! Cluster-API objects of `Cluster` environments
//!
//! A cluster environment is a Cluster-API cluster whose control plane is hosted
//! by Kamaji and whose workers are KubeVirt VMs bootstrapped with kubeadm.

use super::virtual_machines::{disk_target, resource_requirements};
use crate::crd::{
    CapiClusterSpec, ClusterTemplate, Environment, Instance, KamajiControlPlaneSpec,
    KubeadmConfigTemplateSpec, KubevirtMachineTemplateSpec, MachineDeploymentSpec, ObjectRef,
};
use crate::error::{OperatorError, Result};
use k8s_openapi::api::apps::v1::DeploymentSpec;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, PodSpec, PodTemplateSpec, ServicePort, ServiceSpec,
};
use k8s_openapi::api::rbac::v1::{PolicyRule, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use serde_json::json;
use std::collections::BTreeMap;

pub const POD_SUBNET: &str = "10.243.0.0/16";
pub const SERVICE_SUBNET: &str = "10.95.0.0/16";

pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";
const MANAGED_BY_ANNOTATION: &str = "cluster.x-k8s.io/managed-by";
const MANAGED_BY_KAMAJI: &str = "kamaji";

const INFRASTRUCTURE_API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1alpha1";
const CONTROL_PLANE_API_VERSION: &str = "controlplane.cluster.x-k8s.io/v1alpha1";
const BOOTSTRAP_API_VERSION: &str = "bootstrap.cluster.x-k8s.io/v1beta1";

const WORKER_VOLUME_NAME: &str = "containervolume";

pub const VISUALIZER_IMAGE: &str = "docker.io/kuohandong/cluster_gui:latest";
const VISUALIZER_CONTAINER_PORT: i32 = 8082;
const VISUALIZER_SERVICE_PORT: i32 = 8081;
const VISUALIZER_APP_LABEL: &str = "app";

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const CAPI_API_GROUPS: &[&str] = &[
    "cluster.x-k8s.io",
    "bootstrap.cluster.x-k8s.io",
    "addons.cluster.x-k8s.io",
    "infrastructure.cluster.x-k8s.io",
    "controlplane.cluster.x-k8s.io",
    "ipam.cluster.x-k8s.io",
    "runtime.cluster.x-k8s.io",
];

/// Names of the objects making up the cluster `<c>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNames {
    pub cluster: String,
    pub infrastructure: String,
    pub control_plane: String,
    pub machine_deployment: String,
    pub worker_template: String,
    pub bootstrap_template: String,
    /// Deployment, Service and ServiceAccount of the cluster GUI
    pub visualizer: String,
}

impl ClusterNames {
    pub fn new(cluster: &ClusterTemplate) -> Self {
        let base = &cluster.name;
        Self {
            cluster: format!("{}-cluster", base),
            infrastructure: format!("{}-infra", base),
            control_plane: format!("{}-control-plane", base),
            machine_deployment: format!("{}-md", base),
            worker_template: format!("{}-md-worker", base),
            bootstrap_template: format!("{}-md-bootstrap", base),
            visualizer: format!("{}-visualizer", base),
        }
    }

    /// Name of the cluster-scoped RBAC objects of the GUI, unique across
    /// namespaces.
    pub fn visualizer_rbac(&self, namespace: &str) -> String {
        format!("{}-{}", namespace, self.visualizer)
    }

    /// Location of the kubeconfig secret Cluster-API writes for the cluster.
    pub fn kubeconfig_location(&self, namespace: &str) -> String {
        format!("{}/{}-kubeconfig", namespace, self.cluster)
    }
}

/// The cluster section of a `Cluster` environment.
pub fn cluster_template(environment: &Environment) -> Result<&ClusterTemplate> {
    environment.cluster.as_ref().ok_or_else(|| {
        OperatorError::Configuration(format!(
            "cluster environment {} has no cluster section",
            environment.name
        ))
    })
}

fn object_ref(api_version: &str, kind: &str, name: &str, instance: &Instance) -> ObjectRef {
    ObjectRef {
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        name: name.to_string(),
        namespace: instance.metadata.namespace.clone().unwrap_or_default(),
    }
}

pub fn cluster_spec(instance: &Instance, names: &ClusterNames) -> CapiClusterSpec {
    CapiClusterSpec {
        cluster_network: Some(json!({
            "pods": {"cidrBlocks": [POD_SUBNET]},
            "services": {"cidrBlocks": [SERVICE_SUBNET]},
        })),
        infrastructure_ref: Some(object_ref(
            INFRASTRUCTURE_API_VERSION,
            "KubevirtCluster",
            &names.infrastructure,
            instance,
        )),
        control_plane_ref: Some(object_ref(
            CONTROL_PLANE_API_VERSION,
            "KamajiControlPlane",
            &names.control_plane,
            instance,
        )),
        ..Default::default()
    }
}

/// Annotations of the KubevirtCluster, marking it as externally managed.
pub fn infrastructure_annotations(current: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    let mut annotations = current.cloned().unwrap_or_default();
    annotations.insert(MANAGED_BY_ANNOTATION.to_string(), MANAGED_BY_KAMAJI.to_string());
    annotations
}

/// Control plane spec. Replicas are applied separately on every pass.
pub fn control_plane_spec(cluster: &ClusterTemplate, host: &str) -> KamajiControlPlaneSpec {
    let mut cert_sans = vec![host.to_string(), "ingress.local".to_string()];
    if let Some(net) = &cluster.cluster_net {
        cert_sans.push(net.cert_san.clone());
    }
    let extra = BTreeMap::from([
        ("dataStoreName".to_string(), json!("default")),
        ("addons".to_string(), json!({"coreDNS": {}, "kubeProxy": {}})),
        (
            "kubelet".to_string(),
            json!({
                "cgroupfs": "systemd",
                "preferredAddressTypes": ["InternalIP", "ExternalIP"],
            }),
        ),
        (
            "network".to_string(),
            json!({"serviceType": cluster.service_type, "certSANs": cert_sans}),
        ),
    ]);
    KamajiControlPlaneSpec {
        replicas: Some(cluster.control_plane.replicas),
        version: cluster.version.clone(),
        extra,
    }
}

/// MachineDeployment spec. Replicas are applied separately on every pass.
pub fn machine_deployment_spec(
    instance: &Instance,
    cluster: &ClusterTemplate,
    names: &ClusterNames,
) -> MachineDeploymentSpec {
    let bootstrap = object_ref(
        BOOTSTRAP_API_VERSION,
        "KubeadmConfigTemplate",
        &names.bootstrap_template,
        instance,
    );
    let infrastructure = object_ref(
        INFRASTRUCTURE_API_VERSION,
        "KubevirtMachineTemplate",
        &names.worker_template,
        instance,
    );
    MachineDeploymentSpec {
        cluster_name: names.cluster.clone(),
        replicas: Some(cluster.machine_deployment.replicas),
        template: json!({
            "spec": {
                "clusterName": names.cluster,
                "version": cluster.version,
                "bootstrap": {"configRef": bootstrap},
                "infrastructureRef": infrastructure,
            }
        }),
        ..Default::default()
    }
}

/// Template of the worker VMs, booting the environment image.
pub fn worker_template_spec(environment: &Environment) -> Result<KubevirtMachineTemplateSpec> {
    let domain = json!({
        "cpu": {"cores": environment.resources.cpu},
        "memory": {"guest": environment.resources.memory},
        "resources": resource_requirements(environment)?,
        "devices": {
            "networkInterfaceMultiqueue": true,
            "disks": [disk_target(WORKER_VOLUME_NAME)],
        },
    });
    Ok(KubevirtMachineTemplateSpec {
        template: json!({
            "spec": {
                "bootstrapCheckSpec": {"checkStrategy": "ssh"},
                "virtualMachineTemplate": {
                    "spec": {
                        "runStrategy": "Always",
                        "template": {
                            "spec": {
                                "domain": domain,
                                "volumes": [{
                                    "name": WORKER_VOLUME_NAME,
                                    "containerDisk": {"image": environment.image},
                                }],
                                "evictionStrategy": "External",
                            }
                        }
                    }
                }
            }
        }),
        ..Default::default()
    })
}

pub fn bootstrap_template_spec() -> KubeadmConfigTemplateSpec {
    KubeadmConfigTemplateSpec {
        template: json!({
            "spec": {"joinConfiguration": {"nodeRegistration": {"kubeletExtraArgs": {}}}}
        }),
        ..Default::default()
    }
}

/// Label binding the worker template to its cluster, on top of `current`.
pub fn worker_template_labels(
    current: Option<&BTreeMap<String, String>>,
    names: &ClusterNames,
) -> BTreeMap<String, String> {
    let mut labels = current.cloned().unwrap_or_default();
    labels.insert(CLUSTER_NAME_LABEL.to_string(), names.cluster.clone());
    labels
}

fn visualizer_selector(names: &ClusterNames) -> BTreeMap<String, String> {
    BTreeMap::from([(VISUALIZER_APP_LABEL.to_string(), names.visualizer.clone())])
}

/// Labels of the GUI objects: the selector label on top of `current`.
pub fn visualizer_labels(
    current: Option<&BTreeMap<String, String>>,
    names: &ClusterNames,
) -> BTreeMap<String, String> {
    let mut labels = current.cloned().unwrap_or_default();
    labels.extend(visualizer_selector(names));
    labels
}

/// Deployment of the GUI showing the Cluster-API objects of the cluster.
pub fn visualizer_deployment_spec(instance: &Instance, names: &ClusterNames) -> DeploymentSpec {
    let namespace = instance.metadata.namespace.clone().unwrap_or_default();
    DeploymentSpec {
        replicas: Some(1),
        revision_history_limit: Some(10),
        selector: LabelSelector {
            match_labels: Some(visualizer_selector(names)),
            ..Default::default()
        },
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(visualizer_selector(names)),
                ..Default::default()
            }),
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "capi-visualizer".to_string(),
                    image: Some(VISUALIZER_IMAGE.to_string()),
                    image_pull_policy: Some("Always".to_string()),
                    ports: Some(vec![ContainerPort {
                        container_port: VISUALIZER_CONTAINER_PORT,
                        ..Default::default()
                    }]),
                    args: Some(vec![
                        format!("-cluster-name={}", names.cluster),
                        format!("-namespace={}", namespace),
                    ]),
                    ..Default::default()
                }],
                service_account_name: Some(names.visualizer.clone()),
                ..Default::default()
            }),
        },
        ..Default::default()
    }
}

pub fn visualizer_service_spec(names: &ClusterNames) -> ServiceSpec {
    ServiceSpec {
        type_: Some("ClusterIP".to_string()),
        selector: Some(visualizer_selector(names)),
        ports: Some(vec![ServicePort {
            name: Some("https".to_string()),
            port: VISUALIZER_SERVICE_PORT,
            target_port: Some(IntOrString::Int(VISUALIZER_CONTAINER_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        ..Default::default()
    }
}

fn rule(api_groups: &[&str], resources: &[&str], verbs: &[&str]) -> PolicyRule {
    let owned = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    PolicyRule {
        api_groups: Some(owned(api_groups)),
        resources: Some(owned(resources)),
        verbs: owned(verbs),
        ..Default::default()
    }
}

/// Permissions of the GUI: read access everywhere, full access to the
/// Cluster-API groups.
pub fn visualizer_rules() -> Vec<PolicyRule> {
    const READ: &[&str] = &["get", "list", "watch"];
    vec![
        rule(&[""], &["*"], READ),
        rule(&["apiextensions.k8s.io"], &["customresourcedefinitions"], READ),
        rule(CAPI_API_GROUPS, &["*"], &["*"]),
        rule(&["*"], &["*"], READ),
        PolicyRule {
            non_resource_urls: Some(vec!["*".to_string()]),
            verbs: vec!["*".to_string()],
            ..Default::default()
        },
    ]
}

/// Binding of the GUI service account to its cluster role.
pub fn visualizer_role_binding(names: &ClusterNames, namespace: &str) -> (RoleRef, Vec<Subject>) {
    let role_ref = RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: "ClusterRole".to_string(),
        name: names.visualizer_rbac(namespace),
    };
    let subject = Subject {
        kind: "ServiceAccount".to_string(),
        name: names.visualizer.clone(),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    };
    (role_ref, vec![subject])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use crate::crd::{ClusterNetwork, EnvironmentType, ReplicaSettings};
    use crate::resources::testing::{environment, instance};

    fn nested<'a>(value: &'a Value, path: &[&str]) -> &'a Value {
        path.iter().fold(value, |v, key| &v[*key])
    }

    fn cluster_environment() -> Environment {
        let mut env = environment(EnvironmentType::Cluster);
        env.cluster = Some(ClusterTemplate {
            name: "k8s".to_string(),
            version: "v1.31.0".to_string(),
            service_type: "NodePort".to_string(),
            cluster_net: Some(ClusterNetwork {
                cert_san: "k8s.example.com".to_string(),
                nginx_target_port: String::new(),
            }),
            control_plane: ReplicaSettings { replicas: 1 },
            machine_deployment: ReplicaSettings { replicas: 2 },
        });
        env
    }

    #[test]
    fn test_names_and_kubeconfig_location() {
        let env = cluster_environment();
        let names = ClusterNames::new(cluster_template(&env).unwrap());
        assert_eq!(names.cluster, "k8s-cluster");
        assert_eq!(names.worker_template, "k8s-md-worker");
        assert_eq!(names.bootstrap_template, "k8s-md-bootstrap");
        assert_eq!(
            names.kubeconfig_location("tenant-s123456"),
            "tenant-s123456/k8s-cluster-kubeconfig"
        );
    }

    #[test]
    fn test_missing_cluster_section() {
        assert!(cluster_template(&environment(EnvironmentType::Cluster)).is_err());
    }

    #[test]
    fn test_cluster_spec_references() {
        let env = cluster_environment();
        let names = ClusterNames::new(cluster_template(&env).unwrap());
        let spec = cluster_spec(&instance("lab"), &names);
        let infra = spec.infrastructure_ref.unwrap();
        assert_eq!(infra.kind, "KubevirtCluster");
        assert_eq!(infra.name, "k8s-infra");
        assert_eq!(infra.namespace, "tenant-s123456");
        assert_eq!(spec.control_plane_ref.unwrap().name, "k8s-control-plane");
        assert_eq!(
            nested(spec.cluster_network.as_ref().unwrap(), &["pods", "cidrBlocks"])[0],
            POD_SUBNET
        );
    }

    #[test]
    fn test_control_plane_cert_sans() {
        let env = cluster_environment();
        let spec = control_plane_spec(cluster_template(&env).unwrap(), "labs.example.com");
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.extra["network"]["certSANs"],
            json!(["labs.example.com", "ingress.local", "k8s.example.com"])
        );
        assert_eq!(spec.extra["dataStoreName"], "default");
    }

    #[test]
    fn test_machine_deployment_and_workers() {
        let env = cluster_environment();
        let cluster = cluster_template(&env).unwrap();
        let names = ClusterNames::new(cluster);
        let md = machine_deployment_spec(&instance("lab"), cluster, &names);
        assert_eq!(md.replicas, Some(2));
        assert_eq!(
            nested(&md.template, &["spec", "bootstrap", "configRef", "kind"]),
            "KubeadmConfigTemplate"
        );

        let worker = worker_template_spec(&env).unwrap();
        let vm = nested(&worker.template, &["spec", "virtualMachineTemplate", "spec"]);
        assert_eq!(vm["runStrategy"], "Always");
        assert_eq!(
            nested(vm, &["template", "spec", "volumes"])[0]["containerDisk"]["image"],
            "registry.example.com/lab/ubuntu:22.04"
        );
        assert_eq!(
            worker_template_labels(None, &names)[CLUSTER_NAME_LABEL],
            "k8s-cluster"
        );
    }

    #[test]
    fn test_visualizer_objects() {
        let env = cluster_environment();
        let names = ClusterNames::new(cluster_template(&env).unwrap());
        assert_eq!(names.visualizer, "k8s-visualizer");
        assert_eq!(names.visualizer_rbac("tenant-s123456"), "tenant-s123456-k8s-visualizer");

        let deployment = visualizer_deployment_spec(&instance("lab"), &names);
        let pod = deployment.template.spec.unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("k8s-visualizer"));
        assert_eq!(
            pod.containers[0].args.clone().unwrap(),
            vec!["-cluster-name=k8s-cluster", "-namespace=tenant-s123456"]
        );
        assert_eq!(
            deployment.selector.match_labels,
            visualizer_service_spec(&names).selector
        );

        let (role_ref, subjects) = visualizer_role_binding(&names, "tenant-s123456");
        assert_eq!(role_ref.name, "tenant-s123456-k8s-visualizer");
        assert_eq!(subjects[0].namespace.as_deref(), Some("tenant-s123456"));

        let rules = visualizer_rules();
        assert_eq!(rules.len(), 5);
        assert_eq!(rules[2].verbs, vec!["*"]);
        assert!(rules[4].resources.is_none());
    }
}
