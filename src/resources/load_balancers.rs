//! LoadBalancer Service and NetworkPolicy backing the public exposure of an instance

use super::labels::{instance_object_labels, instance_selector_labels, LABEL_COMPONENT_KEY, LABEL_INSTANCE_KEY};
use super::object_name_with_suffix;
use crate::config::PublicExposureConfig;
use crate::crd::{Instance, PublicServicePort};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::networking::v1::{
    NetworkPolicyIngressRule, NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

/// First port handed out to requests asking for automatic assignment
pub const BASE_PORT_FOR_AUTOMATIC_ASSIGNMENT: i32 = 49152;
pub const MAX_PORT: i32 = 65535;

pub const LABEL_PUBLIC_EXPOSURE_VALUE: &str = "pe";
pub const SERVICE_TYPE_LOAD_BALANCER: &str = "LoadBalancer";

const NETWORK_POLICY_NAME_PREFIX: &str = "crownlabs-allow-publicexposure-ingress-traffic-";

pub const MESSAGE_PROVISIONING: &str = "Provisioning public exposure: allocating IP and ports";
pub const MESSAGE_SERVICE_FAILED: &str =
    "Failed to create or update the LoadBalancer service, contact the administrator.";
pub const MESSAGE_NETWORK_POLICY_FAILED: &str =
    "Failed to enforce the network policy, contact the administrator.";
pub const MESSAGE_READY: &str = "Public exposure completed successfully.";
pub const MESSAGE_NO_IP_AVAILABLE: &str = "No available IP can support all requested ports.";

pub fn load_balancer_service_name(instance: &Instance) -> String {
    object_name_with_suffix(instance, LABEL_PUBLIC_EXPOSURE_VALUE)
}

pub fn network_policy_name(instance: &Instance) -> String {
    format!(
        "{}{}",
        NETWORK_POLICY_NAME_PREFIX,
        instance.metadata.name.as_deref().unwrap_or_default()
    )
}

/// Spec of the LoadBalancer service publishing the given (already assigned) ports.
pub fn load_balancer_spec(instance: &Instance, ports: &[PublicServicePort]) -> ServiceSpec {
    ServiceSpec {
        type_: Some(SERVICE_TYPE_LOAD_BALANCER.to_string()),
        selector: Some(instance_selector_labels(instance)),
        ports: Some(
            ports
                .iter()
                .map(|p| ServicePort {
                    name: Some(p.name.clone()),
                    port: p.port,
                    target_port: Some(IntOrString::Int(p.target_port)),
                    protocol: Some(p.normalized_protocol().to_string()),
                    ..Default::default()
                })
                .collect(),
        ),
        ..Default::default()
    }
}

/// Common annotations plus the one pinning the external IP.
pub fn load_balancer_annotations(external_ip: &str, config: &PublicExposureConfig) -> BTreeMap<String, String> {
    let mut annotations = config.common_annotations.clone();
    annotations.insert(config.ip_annotation_key.clone(), external_ip.to_string());
    annotations
}

/// Discovery labels of the public exposure services.
pub fn load_balancer_labels() -> BTreeMap<String, String> {
    BTreeMap::from([(
        LABEL_COMPONENT_KEY.to_string(),
        LABEL_PUBLIC_EXPOSURE_VALUE.to_string(),
    )])
}

/// Ports currently published by `service`, in the form recorded in the status.
pub fn public_ports_from_service(service: &Service) -> Vec<PublicServicePort> {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|p| PublicServicePort {
                    name: p.name.clone().unwrap_or_default(),
                    port: p.port,
                    target_port: match &p.target_port {
                        Some(IntOrString::Int(port)) => *port,
                        Some(IntOrString::String(port)) => port.parse().unwrap_or_default(),
                        None => p.port,
                    },
                    protocol: p.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// External IP recorded on `service` under the configured annotation key.
pub fn service_external_ip<'a>(service: &'a Service, config: &PublicExposureConfig) -> &'a str {
    service
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(&config.ip_annotation_key))
        .map(String::as_str)
        .unwrap_or_default()
}

/// Labels of the allow-list policy, merged on top of `current`.
pub fn network_policy_labels(
    current: Option<&BTreeMap<String, String>>,
    instance: &Instance,
) -> BTreeMap<String, String> {
    instance_object_labels(current, instance)
}

/// Allow-list admitting traffic to the target ports recorded in the status.
pub fn network_policy_spec(instance: &Instance) -> NetworkPolicySpec {
    let ports = instance
        .status
        .as_ref()
        .and_then(|s| s.public_exposure.as_ref())
        .map(|pe| {
            pe.ports
                .iter()
                .map(|p| NetworkPolicyPort {
                    port: Some(IntOrString::Int(p.target_port)),
                    protocol: Some(p.normalized_protocol().to_string()),
                    ..Default::default()
                })
                .collect()
        })
        .unwrap_or_default();

    NetworkPolicySpec {
        pod_selector: LabelSelector {
            match_labels: Some(BTreeMap::from([(
                LABEL_INSTANCE_KEY.to_string(),
                instance.metadata.name.clone().unwrap_or_default(),
            )])),
            ..Default::default()
        },
        ingress: Some(vec![NetworkPolicyIngressRule {
            ports: Some(ports),
            ..Default::default()
        }]),
        policy_types: Some(vec!["Ingress".to_string()]),
        ..Default::default()
    }
}
