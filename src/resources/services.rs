//! ClusterIP Service exposing an environment inside the cluster

use super::labels::instance_selector_labels;
use crate::crd::{Environment, EnvironmentMode, EnvironmentType, Instance};
use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

pub const SSH_PORT: i32 = 22;
pub const GUI_PORT: i32 = 6080;
pub const MY_DRIVE_PORT: i32 = 8080;
pub const XVNC_PORT: i32 = 5900;
pub const METRICS_PORT: i32 = 9090;

pub const SSH_PORT_NAME: &str = "ssh";
pub const GUI_PORT_NAME: &str = "gui";
pub const MY_DRIVE_PORT_NAME: &str = "mydrive";
pub const XVNC_PORT_NAME: &str = "xvnc";
pub const METRICS_PORT_NAME: &str = "metrics";

/// Spec of the service in front of the environment workload.
pub fn service_spec(instance: &Instance, environment: &Environment) -> ServiceSpec {
    let mut ports = Vec::new();

    // No SSH daemon runs in container environments.
    if environment.is_vm_like() {
        ports.push(tcp_port(SSH_PORT_NAME, SSH_PORT));
    }
    if environment.gui_enabled {
        ports.push(tcp_port(GUI_PORT_NAME, GUI_PORT));
    }
    if environment.is_container_like() && environment.mode == EnvironmentMode::Standard {
        ports.push(tcp_port(MY_DRIVE_PORT_NAME, MY_DRIVE_PORT));
    }
    if environment.environment_type == EnvironmentType::Container {
        ports.push(tcp_port(METRICS_PORT_NAME, METRICS_PORT));
    }

    ServiceSpec {
        type_: Some("ClusterIP".to_string()),
        selector: Some(instance_selector_labels(instance)),
        ports: Some(ports),
        ..Default::default()
    }
}

// Target ports are numeric: KubeVirt does not resolve named ports.
fn tcp_port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        protocol: Some("TCP".to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}
