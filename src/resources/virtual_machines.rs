//! KubeVirt VirtualMachine and VirtualMachineInstance specs
//!
//! Persistent environments are backed by a VirtualMachine whose root disk is a
//! DataVolume imported once from the environment image. Ephemeral ones run a
//! standalone VirtualMachineInstance booting from a container disk.

use super::labels::instance_selector_labels;
use super::object_name;
use super::services::{GUI_PORT, SSH_PORT};
use crate::crd::{
    Environment, EnvironmentMode, EnvironmentType, Instance, TemplateMetadata,
    VirtualMachineInstanceSpec, VirtualMachineInstanceTemplate, VirtualMachineSpec,
};
use crate::error::{OperatorError, Result};
use serde_json::{json, Value};

const URL_DOCKER_PREFIX: &str = "docker://";
const REGISTRY_CREDENTIALS_SECRET_NAME: &str = "registry-credentials";
const CDI_SECRET_NAME: &str = "registry-credentials-cdi";

const VOLUME_ROOT_NAME: &str = "root";
const VOLUME_CLOUD_INIT_NAME: &str = "cloud-init";
const VIRTIO_DISK_BUS: &str = "virtio";

const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 60;

/// Reservation added on top of the guest resources for the hypervisor
const CPU_HYPERVISOR_OVERHEAD_MILLIS: u64 = 500;
const MEMORY_HYPERVISOR_OVERHEAD_BYTES: u64 = 500_000_000;

/// Spec of the VirtualMachine of a persistent environment. `running` is
/// re-applied on every pass by the caller.
pub fn virtual_machine_spec(instance: &Instance, environment: &Environment) -> Result<VirtualMachineSpec> {
    Ok(VirtualMachineSpec {
        running: Some(instance.spec.running),
        template: Some(VirtualMachineInstanceTemplate {
            metadata: Some(TemplateMetadata {
                labels: instance_selector_labels(instance),
            }),
            spec: virtual_machine_instance_spec(instance, environment)?,
        }),
        data_volume_templates: vec![data_volume_template(&object_name(instance), environment)?],
        ..Default::default()
    })
}

/// Spec of a VirtualMachineInstance, shared by both VM flavors.
pub fn virtual_machine_instance_spec(
    instance: &Instance,
    environment: &Environment,
) -> Result<VirtualMachineInstanceSpec> {
    Ok(VirtualMachineInstanceSpec {
        domain: domain(environment)?,
        volumes: volumes(instance, environment),
        networks: vec![json!({"name": "default", "pod": {}})],
        readiness_probe: Some(readiness_probe(environment)),
        termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECONDS),
        ..Default::default()
    })
}

/// CPU and memory requests and limits of a VM, hypervisor overhead included.
pub fn resource_requirements(environment: &Environment) -> Result<Value> {
    let memory = memory_with_overhead(&environment.resources.memory)?;
    Ok(json!({
        "requests": {"cpu": cpu_requests(environment), "memory": memory},
        "limits": {"cpu": cpu_limits(environment), "memory": memory},
    }))
}

fn domain(environment: &Environment) -> Result<Value> {
    let mut disks = vec![disk_target(VOLUME_ROOT_NAME)];
    if environment.mode == EnvironmentMode::Standard {
        disks.push(disk_target(VOLUME_CLOUD_INIT_NAME));
    }
    Ok(json!({
        "cpu": {"cores": environment.resources.cpu},
        "memory": {"guest": environment.resources.memory},
        "resources": resource_requirements(environment)?,
        "devices": {
            "disks": disks,
            "interfaces": [{"name": "default", "bridge": {}}],
        },
    }))
}

fn volumes(instance: &Instance, environment: &Environment) -> Vec<Value> {
    let name = object_name(instance);
    let root = if environment.persistent {
        json!({"name": VOLUME_ROOT_NAME, "dataVolume": {"name": name}})
    } else {
        json!({
            "name": VOLUME_ROOT_NAME,
            "containerDisk": {
                "image": environment.image,
                "imagePullSecret": REGISTRY_CREDENTIALS_SECRET_NAME,
                "imagePullPolicy": "IfNotPresent",
            },
        })
    };
    let mut volumes = vec![root];
    if environment.mode == EnvironmentMode::Standard {
        volumes.push(json!({
            "name": VOLUME_CLOUD_INIT_NAME,
            "cloudInitNoCloud": {"userDataSecretRef": {"name": name}},
        }));
    }
    volumes
}

pub fn disk_target(name: &str) -> Value {
    json!({"name": name, "disk": {"bus": VIRTIO_DISK_BUS}})
}

fn readiness_probe(environment: &Environment) -> Value {
    let port = if environment.gui_enabled { GUI_PORT } else { SSH_PORT };
    json!({
        "initialDelaySeconds": 10,
        "periodSeconds": 2,
        "failureThreshold": 5,
        "successThreshold": 2,
        "tcpSocket": {"port": port},
    })
}

fn data_volume_template(name: &str, environment: &Environment) -> Result<Value> {
    let disk = environment.resources.disk.as_deref().ok_or_else(|| {
        OperatorError::Configuration(format!(
            "persistent environment {} does not declare a disk size",
            environment.name
        ))
    })?;
    let source = if environment.environment_type == EnvironmentType::CloudVm {
        json!({"http": {"url": environment.image}})
    } else {
        json!({
            "registry": {
                "url": format!("{}{}", URL_DOCKER_PREFIX, environment.image),
                "secretRef": CDI_SECRET_NAME,
            }
        })
    };
    Ok(json!({
        "metadata": {"name": name},
        "spec": {
            "source": source,
            "pvc": {
                "accessModes": ["ReadWriteOnce"],
                "resources": {"requests": {"storage": disk}},
            },
        },
    }))
}

fn cpu_requests(environment: &Environment) -> String {
    let millis = 10 * environment.resources.cpu * environment.resources.reserved_cpu_percentage;
    format!("{}m", millis)
}

fn cpu_limits(environment: &Environment) -> String {
    let millis = u64::from(environment.resources.cpu) * 1000 + CPU_HYPERVISOR_OVERHEAD_MILLIS;
    format!("{}m", millis)
}

fn memory_with_overhead(memory: &str) -> Result<String> {
    let bytes = quantity_bytes(memory)
        .ok_or_else(|| OperatorError::Configuration(format!("invalid memory quantity {:?}", memory)))?;
    Ok((bytes + MEMORY_HYPERVISOR_OVERHEAD_BYTES).to_string())
}

/// Parses a (non-fractional) memory quantity into bytes.
fn quantity_bytes(quantity: &str) -> Option<u64> {
    const SUFFIXES: &[(&str, u64)] = &[
        ("Ki", 1 << 10),
        ("Mi", 1 << 20),
        ("Gi", 1 << 30),
        ("Ti", 1 << 40),
        ("k", 1_000),
        ("M", 1_000_000),
        ("G", 1_000_000_000),
        ("T", 1_000_000_000_000),
    ];
    let quantity = quantity.trim();
    let (digits, multiplier) = SUFFIXES
        .iter()
        .find_map(|(suffix, multiplier)| {
            quantity.strip_suffix(suffix).map(|digits| (digits, *multiplier))
        })
        .unwrap_or((quantity, 1));
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}
