//! Deployment and PersistentVolumeClaim of container environments
//!
//! A container environment runs the application next to a websockify and an
//! X+VNC sidecar providing the graphical desktop. Standard environments also
//! get a file-browser sidecar ("MyDrive") serving the content volume.

use super::ingresses::my_drive_path;
use super::labels::instance_selector_labels;
use super::nfs::NfsMountInfo;
use super::object_name;
use super::services::{
    GUI_PORT, GUI_PORT_NAME, MY_DRIVE_PORT, MY_DRIVE_PORT_NAME, XVNC_PORT, XVNC_PORT_NAME,
};
use crate::config::ContainerImages;
use crate::crd::{Environment, EnvironmentMode, Instance};
use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource,
    HTTPGetAction, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, PodSecurityContext,
    PodSpec, PodTemplateSpec, Probe, ResourceFieldSelector, ResourceRequirements, SecurityContext,
    TCPSocketAction, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

pub const WEBSOCKIFY_NAME: &str = "websockify";
pub const XVNC_NAME: &str = "xvnc";
pub const MY_DRIVE_NAME: &str = "mydrive";
pub const CONTENT_DOWNLOADER_NAME: &str = "content-downloader";

/// Default path of the content volume, also used by the downloader
pub const MY_DRIVE_DEFAULT_MOUNT_PATH: &str = "/mydrive";
const MY_DRIVE_DB_PATH: &str = "/tmp/database.db";
const HEALTHZ_ENDPOINT: &str = "/healthz";

/// UID and GID of every container process
pub const CROWNLABS_USER_ID: i64 = 1010;
const TERMINATION_GRACE_PERIOD_SECONDS: i64 = 10;

/// Spec of the claim backing persistent container environments.
pub fn pvc_spec(environment: &Environment) -> PersistentVolumeClaimSpec {
    let requests = environment
        .resources
        .disk
        .as_ref()
        .map(|disk| BTreeMap::from([("storage".to_string(), Quantity(disk.clone()))]));
    PersistentVolumeClaimSpec {
        access_modes: Some(vec!["ReadWriteOnce".to_string()]),
        storage_class_name: (!environment.storage_class_name.is_empty())
            .then(|| environment.storage_class_name.clone()),
        resources: Some(VolumeResourceRequirements {
            requests,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Number of replicas of the deployment.
///
/// Non-persistent deployments are never scaled down once created, since that
/// would lose the (ephemeral) user data.
pub fn replicas(instance: &Instance, environment: &Environment, is_new: bool) -> i32 {
    if (!is_new && !environment.persistent) || instance.spec.running {
        1
    } else {
        0
    }
}

/// Full deployment spec, without replicas.
pub fn deployment_spec(
    instance: &Instance,
    environment: &Environment,
    mounts: &[NfsMountInfo],
    images: &ContainerImages,
) -> DeploymentSpec {
    let selector = instance_selector_labels(instance);
    DeploymentSpec {
        selector: LabelSelector {
            match_labels: Some(selector.clone()),
            ..Default::default()
        },
        strategy: Some(DeploymentStrategy {
            type_: Some("Recreate".to_string()),
            rolling_update: None,
        }),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(selector),
                ..Default::default()
            }),
            spec: Some(pod_spec(instance, environment, mounts, images)),
        },
        ..Default::default()
    }
}

fn pod_spec(
    instance: &Instance,
    environment: &Environment,
    mounts: &[NfsMountInfo],
    images: &ContainerImages,
) -> PodSpec {
    let drive_mount_path = my_drive_mount_path(environment);

    let mut containers = vec![
        websockify_container(images),
        xvnc_container(images),
        app_container(environment, &drive_mount_path, mounts),
    ];
    if environment.mode == EnvironmentMode::Standard {
        containers.push(my_drive_container(instance, images, &drive_mount_path));
    }

    let mut volumes = container_volumes(instance, environment);
    volumes.extend(mounts.iter().map(NfsMountInfo::pod_volume));

    PodSpec {
        containers,
        init_containers: init_containers(environment, images),
        volumes: (!volumes.is_empty()).then_some(volumes),
        security_context: Some(PodSecurityContext {
            run_as_user: Some(CROWNLABS_USER_ID),
            run_as_group: Some(CROWNLABS_USER_ID),
            fs_group: Some(CROWNLABS_USER_ID),
            run_as_non_root: Some(true),
            ..Default::default()
        }),
        automount_service_account_token: Some(false),
        termination_grace_period_seconds: Some(TERMINATION_GRACE_PERIOD_SECONDS),
        ..Default::default()
    }
}

fn websockify_container(images: &ContainerImages) -> Container {
    let mut container = generic_container(WEBSOCKIFY_NAME, images.websockify());
    container.resources = Some(fixed_resources("10m", "100m", "30Mi", "100Mi"));
    container.ports = Some(vec![tcp_port(GUI_PORT_NAME, GUI_PORT)]);
    container.env = Some(vec![EnvVar {
        name: "WS_PORT".to_string(),
        value: Some(GUI_PORT.to_string()),
        ..Default::default()
    }]);
    container.readiness_probe = Some(tcp_probe(GUI_PORT_NAME));
    container
}

fn xvnc_container(images: &ContainerImages) -> Container {
    let mut container = generic_container(XVNC_NAME, images.xvnc());
    container.resources = Some(fixed_resources("50m", "250m", "200Mi", "600Mi"));
    container.ports = Some(vec![tcp_port(XVNC_PORT_NAME, XVNC_PORT)]);
    container.readiness_probe = Some(tcp_probe(XVNC_PORT_NAME));
    container
}

fn my_drive_container(instance: &Instance, images: &ContainerImages, mount_path: &str) -> Container {
    let mut container = generic_container(MY_DRIVE_NAME, images.mydrive_image_and_tag.clone());
    container.resources = Some(fixed_resources("10m", "250m", "100Mi", "500Mi"));
    container.ports = Some(vec![tcp_port(MY_DRIVE_PORT_NAME, MY_DRIVE_PORT)]);
    container.readiness_probe = Some(Probe {
        http_get: Some(HTTPGetAction {
            path: Some(HEALTHZ_ENDPOINT.to_string()),
            port: IntOrString::String(MY_DRIVE_PORT_NAME.to_string()),
            ..Default::default()
        }),
        ..probe_timings()
    });
    container.volume_mounts = Some(vec![volume_mount(MY_DRIVE_NAME, mount_path)]);
    container.args = Some(vec![
        format!("--port={}", MY_DRIVE_PORT),
        format!("--root={}", mount_path),
        "--noauth=true".to_string(),
        format!("--database={}", MY_DRIVE_DB_PATH),
        format!("--baseurl={}", my_drive_path(instance)),
    ]);
    container
}

fn app_container(environment: &Environment, mount_path: &str, mounts: &[NfsMountInfo]) -> Container {
    let mut container = generic_container(&environment.name, environment.image.clone());
    container.resources = Some(environment_resources(environment));
    container.env = Some(vec![
        resource_env_var(&environment.name, "CROWNLABS_CPU_REQUESTS", "requests.cpu"),
        resource_env_var(&environment.name, "CROWNLABS_CPU_LIMITS", "limits.cpu"),
    ]);

    let mut volume_mounts = Vec::new();
    if needs_container_volume(environment) {
        volume_mounts.push(volume_mount(MY_DRIVE_NAME, mount_path));
    }
    volume_mounts.extend(mounts.iter().map(NfsMountInfo::pod_volume_mount));
    container.volume_mounts = (!volume_mounts.is_empty()).then_some(volume_mounts);

    if let Some(options) = &environment.container_startup_options {
        if !options.startup_args.is_empty() {
            container.args = Some(options.startup_args.clone());
        }
    }
    container
}

fn init_containers(environment: &Environment, images: &ContainerImages) -> Option<Vec<Container>> {
    let origin = init_container_source(environment)?;
    let mut downloader = generic_container(CONTENT_DOWNLOADER_NAME, images.content_downloader());
    downloader.resources = Some(fixed_resources("500m", "1", "256Mi", "1024Mi"));
    downloader.volume_mounts = Some(vec![volume_mount(MY_DRIVE_NAME, MY_DRIVE_DEFAULT_MOUNT_PATH)]);
    downloader.env = Some(vec![
        EnvVar {
            name: "SOURCE_ARCHIVE".to_string(),
            value: Some(origin.to_string()),
            ..Default::default()
        },
        EnvVar {
            name: "DESTINATION_PATH".to_string(),
            value: Some(MY_DRIVE_DEFAULT_MOUNT_PATH.to_string()),
            ..Default::default()
        },
    ]);
    Some(vec![downloader])
}

fn container_volumes(instance: &Instance, environment: &Environment) -> Vec<Volume> {
    if !needs_container_volume(environment) {
        return Vec::new();
    }
    let volume = if environment.persistent {
        Volume {
            name: MY_DRIVE_NAME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: object_name(instance),
                read_only: None,
            }),
            ..Default::default()
        }
    } else {
        Volume {
            name: MY_DRIVE_NAME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }
    };
    vec![volume]
}

/// Whether the environment needs the content volume.
pub fn needs_container_volume(environment: &Environment) -> bool {
    environment.mode == EnvironmentMode::Standard
        || environment.persistent
        || init_container_source(environment).is_some()
}

/// Archive to pre-populate the content volume with, if any.
pub fn init_container_source(environment: &Environment) -> Option<&str> {
    environment
        .container_startup_options
        .as_ref()
        .map(|o| o.source_archive_url.as_str())
        .filter(|url| !url.is_empty())
}

/// Where the content volume is mounted inside the application container.
pub fn my_drive_mount_path(environment: &Environment) -> String {
    environment
        .container_startup_options
        .as_ref()
        .map(|o| o.content_path.as_str())
        .filter(|path| !path.is_empty())
        .unwrap_or(MY_DRIVE_DEFAULT_MOUNT_PATH)
        .to_string()
}

fn generic_container(name: &str, image: String) -> Container {
    Container {
        name: name.to_string(),
        image: Some(image),
        security_context: Some(SecurityContext {
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                add: None,
            }),
            privileged: Some(false),
            allow_privilege_escalation: Some(false),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn environment_resources(environment: &Environment) -> ResourceRequirements {
    let cpu_request_millis =
        environment.resources.cpu * environment.resources.reserved_cpu_percentage * 10;
    let memory = Quantity(environment.resources.memory.clone());
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(format!("{}m", cpu_request_millis))),
            ("memory".to_string(), memory.clone()),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(environment.resources.cpu.to_string())),
            ("memory".to_string(), memory),
        ])),
        ..Default::default()
    }
}

fn fixed_resources(cpu_request: &str, cpu_limit: &str, mem_request: &str, mem_limit: &str) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu_request.to_string())),
            ("memory".to_string(), Quantity(mem_request.to_string())),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu_limit.to_string())),
            ("memory".to_string(), Quantity(mem_limit.to_string())),
        ])),
        ..Default::default()
    }
}

fn resource_env_var(container: &str, name: &str, resource: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            resource_field_ref: Some(ResourceFieldSelector {
                container_name: Some(container.to_string()),
                resource: resource.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn tcp_port(name: &str, port: i32) -> ContainerPort {
    ContainerPort {
        name: Some(name.to_string()),
        container_port: port,
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

fn volume_mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

fn tcp_probe(port_name: &str) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::String(port_name.to_string()),
            host: None,
        }),
        ..probe_timings()
    }
}

fn probe_timings() -> Probe {
    Probe {
        initial_delay_seconds: Some(10),
        period_seconds: Some(2),
        success_threshold: Some(2),
        failure_threshold: Some(5),
        ..Default::default()
    }
}
