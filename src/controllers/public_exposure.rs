//! Public exposure of an instance through a shared pool of external IPs
//!
//! Each instance asking for public ports gets a LoadBalancer service pinned
//! to one IP of the configured pool, plus a NetworkPolicy admitting traffic
//! to the exposed target ports. The allocation is rebuilt from the services
//! already in the cluster on every attempt and relies on the store's
//! optimistic concurrency when two instances race for the same port.

use super::{EnvironmentScope, InstanceReconciler};
use crate::config::PublicExposureConfig;
use crate::crd::{Instance, PublicExposurePhase, PublicExposureStatus, PublicServicePort};
use crate::error::{OperatorError, Result};
use crate::events::EventSink;
use crate::resources::load_balancers::{
    load_balancer_annotations, load_balancer_labels, load_balancer_service_name,
    load_balancer_spec, network_policy_labels, network_policy_name, network_policy_spec,
    public_ports_from_service, service_external_ip, BASE_PORT_FOR_AUTOMATIC_ASSIGNMENT, MAX_PORT,
    MESSAGE_NETWORK_POLICY_FAILED, MESSAGE_NO_IP_AVAILABLE, MESSAGE_PROVISIONING, MESSAGE_READY,
    MESSAGE_SERVICE_FAILED, SERVICE_TYPE_LOAD_BALANCER,
};
use crate::resources::labels::instance_object_labels;
use crate::resources::set_controller_reference;
use crate::store::{create_or_update, ObjectStore};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use tracing::{debug, error, info, warn};

/// Ports already claimed on each external IP
pub type UsedPortsByIp = BTreeMap<String, BTreeSet<i32>>;

/// Rejects requests with two entries on the same target port, or two
/// entries asking for the same explicit port.
pub fn validate_request(ports: &[PublicServicePort]) -> Result<()> {
    let mut target_ports = HashSet::new();
    let mut requested_ports = HashSet::new();

    for port in ports {
        if !target_ports.insert(port.target_port) {
            return Err(OperatorError::InvalidPublicExposure(format!(
                "duplicate desired targetPort {} found in public exposure request",
                port.target_port
            )));
        }
        if port.port != 0 && !requested_ports.insert(port.port) {
            return Err(OperatorError::InvalidPublicExposure(format!(
                "duplicate requested port {} found in public exposure request",
                port.port
            )));
        }
    }
    Ok(())
}

fn port_key(port: &PublicServicePort) -> (&str, i32, &str) {
    (port.name.as_str(), port.target_port, port.normalized_protocol())
}

/// Whether the published ports no longer satisfy the request.
///
/// `recorded` are the ports in the instance status, `published` those of the
/// live service. Both must carry exactly the requested (name, targetPort,
/// protocol) entries; explicit ports must match, automatic ones must come
/// from the automatic range.
pub fn needs_service_update(
    requested: &[PublicServicePort],
    recorded: &[PublicServicePort],
    published: &[PublicServicePort],
) -> bool {
    let wanted: HashSet<_> = requested.iter().map(port_key).collect();
    let matches = |ports: &[PublicServicePort]| {
        let actual: HashSet<_> = ports.iter().map(port_key).collect();
        ports.len() == wanted.len() && actual == wanted
    };
    if !matches(recorded) || !matches(published) {
        return true;
    }

    let assigned = |ports: &[PublicServicePort], wanted: &PublicServicePort| {
        ports
            .iter()
            .filter(|p| port_key(p) == port_key(wanted))
            .map(|p| p.port)
            .collect::<Vec<_>>()
    };
    requested.iter().any(|wanted| {
        [recorded, published].into_iter().any(|ports| {
            let current = assigned(ports, wanted);
            if wanted.port != 0 {
                !current.contains(&wanted.port)
            } else {
                current.iter().any(|p| *p < BASE_PORT_FOR_AUTOMATIC_ASSIGNMENT)
            }
        })
    })
}

/// Collects the ports claimed by the public exposure services, skipping the
/// one identified by `exclude_name` in `exclude_namespace`.
pub fn used_ports_by_ip(
    services: &[Service],
    exclude_name: &str,
    exclude_namespace: &str,
    config: &PublicExposureConfig,
) -> UsedPortsByIp {
    let mut used = UsedPortsByIp::new();
    for service in services {
        let spec = match service.spec.as_ref() {
            Some(spec) if spec.type_.as_deref() == Some(SERVICE_TYPE_LOAD_BALANCER) => spec,
            _ => continue,
        };
        if service.name_any() == exclude_name
            && service.namespace().as_deref() == Some(exclude_namespace)
        {
            continue;
        }
        let ip = service_external_ip(service, config);
        if ip.is_empty() {
            continue;
        }
        let ports = used.entry(ip.to_string()).or_default();
        for port in spec.ports.iter().flatten() {
            ports.insert(port.port);
        }
    }
    used
}

/// Candidate IPs: those of the pool already hosting some port first, then
/// the unused ones, each group sorted.
pub fn build_prioritized_ip_pool(pool: &[String], used: &UsedPortsByIp) -> Vec<String> {
    let (mut in_use, mut free): (Vec<String>, Vec<String>) =
        pool.iter().cloned().partition(|ip| used.contains_key(ip));
    in_use.sort();
    free.sort();
    in_use.extend(free);
    in_use
}

/// Moves `preferred` to the front, keeping the order of the rest.
fn prefer_ip(mut pool: Vec<String>, preferred: &str) -> Vec<String> {
    if let Some(index) = pool.iter().position(|ip| ip == preferred) {
        let ip = pool.remove(index);
        pool.insert(0, ip);
    }
    pool
}

/// Assigns every requested port on `in_use`, explicit ones first.
fn try_assign_ports(
    requested: &[PublicServicePort],
    mut in_use: BTreeSet<i32>,
) -> Option<Vec<PublicServicePort>> {
    let (explicit, automatic): (Vec<_>, Vec<_>) = requested.iter().partition(|p| p.port != 0);
    let mut assigned = Vec::with_capacity(requested.len());

    for port in explicit {
        if !in_use.insert(port.port) {
            return None;
        }
        assigned.push(PublicServicePort {
            protocol: port.normalized_protocol().to_string(),
            ..port.clone()
        });
    }
    for port in automatic {
        let free = (BASE_PORT_FOR_AUTOMATIC_ASSIGNMENT..=MAX_PORT).find(|p| !in_use.contains(p))?;
        in_use.insert(free);
        assigned.push(PublicServicePort {
            port: free,
            protocol: port.normalized_protocol().to_string(),
            ..port.clone()
        });
    }
    Some(assigned)
}

/// Picks the first IP of the pool able to host every requested port.
///
/// `current_ip`, when part of the pool, is tried first.
pub fn find_best_ip_and_assign_ports(
    pool: &[String],
    requested: &[PublicServicePort],
    used: &UsedPortsByIp,
    current_ip: &str,
) -> Result<(String, Vec<PublicServicePort>)> {
    let candidates = prefer_ip(build_prioritized_ip_pool(pool, used), current_ip);
    debug!(pool = ?candidates, "evaluating IP pool");

    for ip in candidates {
        let in_use = used.get(&ip).cloned().unwrap_or_default();
        match try_assign_ports(requested, in_use) {
            Some(ports) => return Ok((ip, ports)),
            None => debug!(ip = %ip, "IP cannot host the requested ports"),
        }
    }
    Err(OperatorError::AllocationExhausted(
        "no available IP can support all requested ports".to_string(),
    ))
}

fn set_public_exposure_status(instance: &mut Instance, phase: PublicExposurePhase, message: &str) {
    let status = instance
        .status_mut()
        .public_exposure
        .get_or_insert_with(PublicExposureStatus::default);
    status.phase = phase;
    status.message = message.to_string();
}

impl<S: ObjectStore, E: EventSink> InstanceReconciler<S, E> {
    /// Publishes the requested ports while the template allows it and the
    /// instance runs, and withdraws them otherwise.
    pub(super) async fn enforce_public_exposure(
        &self,
        instance: &mut Instance,
        scope: &EnvironmentScope<'_>,
    ) -> Result<()> {
        let requested = instance.requested_ports().to_vec();
        if scope.template.spec.allow_public_exposure && instance.spec.running && !requested.is_empty() {
            self.enforce_public_exposure_presence(instance, &requested).await
        } else {
            self.enforce_public_exposure_absence(instance).await
        }
    }

    async fn enforce_public_exposure_presence(
        &self,
        instance: &mut Instance,
        requested: &[PublicServicePort],
    ) -> Result<()> {
        set_public_exposure_status(instance, PublicExposurePhase::Provisioning, MESSAGE_PROVISIONING);

        if let Err(e) = validate_request(requested) {
            warn!(error = %e, "invalid public exposure request");
            set_public_exposure_status(instance, PublicExposurePhase::Error, &e.to_string());
            return Ok(());
        }

        let service = match self.enforce_load_balancer(instance, requested).await {
            Ok(service) => service,
            Err(e) => {
                error!(error = %e, "failed to enforce the public exposure service");
                let message = match e {
                    OperatorError::AllocationExhausted(_) => MESSAGE_NO_IP_AVAILABLE,
                    _ => MESSAGE_SERVICE_FAILED,
                };
                set_public_exposure_status(instance, PublicExposurePhase::Error, message);
                return Err(e);
            }
        };

        let cfg = &self.config.public_exposure;
        let external_ip = service_external_ip(&service, cfg).to_string();
        let ports = public_ports_from_service(&service);
        if let Some(status) = instance.status_mut().public_exposure.as_mut() {
            status.external_ip = external_ip.clone();
            status.ports = ports;
        }

        if let Err(e) = self.enforce_network_policy_presence(instance).await {
            error!(error = %e, "failed to enforce the public exposure network policy");
            set_public_exposure_status(instance, PublicExposurePhase::Error, MESSAGE_NETWORK_POLICY_FAILED);
            return Err(e);
        }

        set_public_exposure_status(instance, PublicExposurePhase::Ready, MESSAGE_READY);
        info!(external_ip = %external_ip, "public exposure enforced");
        Ok(())
    }

    /// Creates or updates the LoadBalancer service, allocating a new IP and
    /// ports only when the current ones no longer match the request.
    async fn enforce_load_balancer(
        &self,
        instance: &Instance,
        requested: &[PublicServicePort],
    ) -> Result<Service> {
        let cfg = &self.config.public_exposure;
        let namespace = instance.namespace().unwrap_or_default();
        let name = load_balancer_service_name(instance);

        let existing = self.store.get::<Service>(Some(&namespace), &name).await?;
        let current_ip = existing
            .as_ref()
            .map(|svc| service_external_ip(svc, cfg))
            .filter(|ip| cfg.contains(ip))
            .unwrap_or_default()
            .to_string();

        let recorded = instance
            .status
            .as_ref()
            .and_then(|s| s.public_exposure.as_ref())
            .map(|pe| pe.ports.clone())
            .unwrap_or_default();
        let up_to_date = !current_ip.is_empty()
            && existing.as_ref().is_some_and(|svc| {
                !needs_service_update(requested, &recorded, &public_ports_from_service(svc))
            });

        let allocation = if up_to_date {
            debug!(service = %name, "public exposure service already in desired state");
            None
        } else {
            let services = self
                .store
                .list::<Service>(None, &load_balancer_labels())
                .await?;
            let used = used_ports_by_ip(&services, &name, &namespace, cfg);
            let pool: Vec<String> = cfg.ip_pool.iter().map(ToString::to_string).collect();
            let (ip, ports) = find_best_ip_and_assign_ports(&pool, requested, &used, &current_ip)?;
            info!(ip = %ip, ports = ?ports, "allocated public exposure");
            Some((ip, ports))
        };

        let (service, _) = create_or_update(
            &self.store,
            Service {
                metadata: ObjectMeta {
                    name: Some(name),
                    namespace: Some(namespace),
                    ..Default::default()
                },
                ..Default::default()
            },
            |svc: &mut Service, _| {
                if let Some((ip, ports)) = &allocation {
                    let desired = load_balancer_spec(instance, ports);
                    let spec = svc.spec.get_or_insert_with(Default::default);
                    spec.type_ = desired.type_;
                    spec.selector = desired.selector;
                    spec.ports = desired.ports;

                    svc.metadata.annotations = Some(load_balancer_annotations(ip, cfg));
                }
                let mut labels = instance_object_labels(svc.metadata.labels.as_ref(), instance);
                labels.extend(load_balancer_labels());
                svc.metadata.labels = Some(labels);
                set_controller_reference(&mut svc.metadata, instance);
                Ok(())
            },
        )
        .await?;
        Ok(service)
    }

    async fn enforce_network_policy_presence(&self, instance: &Instance) -> Result<()> {
        create_or_update(
            &self.store,
            NetworkPolicy {
                metadata: ObjectMeta {
                    name: Some(network_policy_name(instance)),
                    namespace: instance.namespace(),
                    ..Default::default()
                },
                ..Default::default()
            },
            |policy: &mut NetworkPolicy, _| {
                policy.spec = Some(network_policy_spec(instance));
                policy.metadata.labels =
                    Some(network_policy_labels(policy.metadata.labels.as_ref(), instance));
                set_controller_reference(&mut policy.metadata, instance);
                Ok(())
            },
        )
        .await?;
        Ok(())
    }

    async fn enforce_public_exposure_absence(&self, instance: &mut Instance) -> Result<()> {
        let namespace = instance.namespace();
        self.enforce_object_absence::<Service>(namespace.as_deref(), &load_balancer_service_name(instance))
            .await?;
        self.enforce_object_absence::<NetworkPolicy>(namespace.as_deref(), &network_policy_name(instance))
            .await?;
        if let Some(status) = instance.status.as_mut() {
            status.public_exposure = None;
        }
        Ok(())
    }
}

/// LoadBalancer services as other instances leave them in the cluster.
#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::controllers::testing::config;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};

    pub fn load_balancer(ns: &str, name: &str, ip: &str, ports: &[i32]) -> Service {
        let cfg = config().public_exposure;
        Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(ns.to_string()),
                labels: Some(load_balancer_labels()),
                annotations: Some(load_balancer_annotations(ip, &cfg)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some(SERVICE_TYPE_LOAD_BALANCER.to_string()),
                ports: Some(
                    ports
                        .iter()
                        .map(|p| ServicePort {
                            port: *p,
                            ..Default::default()
                        })
                        .collect(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
