//! Instance reconciliation
//!
//! A pass re-reads the Instance, resolves its Template and Tenant, keeps the
//! Instance labels in sync, enforces every environment and finally persists
//! the status accumulated along the way, whether the pass succeeded or not.

use super::{error_policy, reconcile, Controller, EnvironmentKind, EnvironmentScope};
use crate::config::ReconcilerConfig;
use crate::crd::{
    EnvironmentPhase, Instance, Template, Tenant, VirtualMachine, VirtualMachineInstance,
};
use crate::error::{OperatorError, Result};
use crate::events::{
    EventSink, KubeEventSink, REASON_ENVIRONMENT_ENFORCEMENT_FAILED, REASON_TEMPLATE_NOT_FOUND,
    REASON_TENANT_NOT_FOUND,
};
use crate::metrics::{InstanceMetrics, ReadyLabels};
use crate::resources::labels::{instance_labels, instance_selector_labels, LABEL_INSTANCE_KEY};
use crate::resources::random_pretty_name;
use crate::store::{KubeStore, ObjectStore, StoreObject};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::Api;
use kube::runtime::controller::{self, Action, Controller as KubeController};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Periodic resync of healthy instances
const RESYNC_PERIOD: Duration = Duration::from_secs(3600);

/// Instances taking longer than this to become ready are not observed
const INITIAL_READY_OBSERVATION_LIMIT: Duration = Duration::from_secs(30 * 60);

/// Node selector entry added by KubeVirt, not meaningful to users
const SCHEDULABLE_NODE_SELECTOR_KEY: &str = "kubevirt.io/schedulable";

/// Reconciles Instances against an [`ObjectStore`].
pub struct InstanceReconciler<S, E> {
    pub(super) store: S,
    pub(super) events: E,
    metrics: InstanceMetrics,
    pub(super) config: ReconcilerConfig,
}

impl<S: ObjectStore, E: EventSink> InstanceReconciler<S, E> {
    pub fn new(store: S, events: E, metrics: InstanceMetrics, config: ReconcilerConfig) -> Self {
        Self {
            store,
            events,
            metrics,
            config,
        }
    }

    /// Runs a reconciliation pass of the Instance `namespace/name`.
    pub async fn reconcile(&self, namespace: &str, name: &str) -> Result<Action> {
        let Some(mut instance) = self.store.get::<Instance>(Some(namespace), name).await? else {
            debug!("instance no longer exists");
            return Ok(Action::await_change());
        };

        if !self.namespace_whitelisted(namespace).await? {
            debug!("namespace not whitelisted, skipping");
            return Ok(Action::await_change());
        }

        debug!("reconciling instance");
        let original = instance.clone();
        let timeout = self.config.reconcile_timeout;
        let outcome = match tokio::time::timeout(timeout, self.enforce_instance(&mut instance)).await {
            Ok(result) => result,
            Err(_) => Err(OperatorError::Timeout(timeout)),
        };

        if let Err(e) = &outcome {
            error!(error = %e, "failed to reconcile instance");
            if e.forces_creation_loop_backoff() {
                instance.status_mut().phase = EnvironmentPhase::CreationLoopBackoff;
            }
        }

        if instance.status != original.status {
            let patch = json!({ "status": instance.status });
            if let Err(e) = self
                .store
                .patch_status::<Instance>(Some(namespace), name, &patch)
                .await
            {
                error!(error = %e, "failed to update the instance status");
                outcome?;
                return Err(e);
            }
            debug!("instance status updated");
        }

        outcome.map(|_| Action::requeue(RESYNC_PERIOD))
    }

    async fn namespace_whitelisted(&self, namespace: &str) -> Result<bool> {
        let whitelist = &self.config.namespace_whitelist;
        if whitelist.is_empty() {
            return Ok(true);
        }
        let Some(ns) = self.store.get::<Namespace>(None, namespace).await? else {
            return Ok(false);
        };
        let labels = ns.labels();
        Ok(whitelist.iter().all(|(k, v)| labels.get(k) == Some(v)))
    }

    async fn enforce_instance(&self, instance: &mut Instance) -> Result<()> {
        let template_ref = instance.spec.template.clone();
        let template_namespace = if template_ref.namespace.is_empty() {
            instance.namespace().unwrap_or_default()
        } else {
            template_ref.namespace.clone()
        };
        let template: Template = self
            .fetch_dependency(
                instance,
                Some(&template_namespace),
                &template_ref.name,
                REASON_TEMPLATE_NOT_FOUND,
                format!("instance template {}/{} not found in cluster", template_namespace, template_ref.name),
            )
            .await?;

        let tenant_name = instance.spec.tenant.name.clone();
        let tenant: Tenant = self
            .fetch_dependency(
                instance,
                None,
                &tenant_name,
                REASON_TENANT_NOT_FOUND,
                format!("instance tenant {} not found in cluster", tenant_name),
            )
            .await?;

        self.enforce_instance_labels(instance, &template).await?;
        self.enforce_environments(instance, &template, &tenant).await?;
        self.enforce_schedule_status(instance).await;
        Ok(())
    }

    /// Retrieves an object the instance depends on, emitting `reason` when
    /// it cannot be read.
    async fn fetch_dependency<K: StoreObject>(
        &self,
        instance: &Instance,
        namespace: Option<&str>,
        name: &str,
        reason: &str,
        note: String,
    ) -> Result<K> {
        let err = match self.store.get::<K>(namespace, name).await {
            Ok(Some(obj)) => return Ok(obj),
            Ok(None) => OperatorError::MissingDependency(note.clone()),
            Err(e) => e,
        };
        error!(error = %err, kind = %K::kind(&()), name = %name, "failed to retrieve instance dependency");
        self.events.warn(instance, reason, note).await;
        Err(err)
    }

    /// Patches the instance labels and pretty name when they are out of date.
    async fn enforce_instance_labels(&self, instance: &mut Instance, template: &Template) -> Result<()> {
        let (labels, update) = instance_labels(instance.metadata.labels.as_ref(), template);
        let pretty_name = instance.spec.pretty_name.is_empty().then(random_pretty_name);
        if !update && pretty_name.is_none() {
            return Ok(());
        }

        let mut patch = json!({ "metadata": { "labels": labels } });
        if let Some(pretty_name) = &pretty_name {
            patch["spec"] = json!({ "prettyName": pretty_name });
        }
        let name = instance.name_any();
        let patched: Instance = self
            .store
            .patch(instance.namespace().as_deref(), &name, &patch)
            .await?;
        info!(pretty_name = %patched.spec.pretty_name, "instance labels updated");
        instance.metadata = patched.metadata;
        instance.spec.pretty_name = patched.spec.pretty_name;
        Ok(())
    }

    async fn enforce_environments(
        &self,
        instance: &mut Instance,
        template: &Template,
        tenant: &Tenant,
    ) -> Result<()> {
        for (index, environment) in template.spec.environment_list.iter().enumerate() {
            if index > 0 {
                error!(
                    environment = %environment.name,
                    "instances with multiple environments are not supported, ignoring"
                );
                break;
            }

            let scope = EnvironmentScope {
                template,
                tenant,
                environment,
                index,
            };
            if let Err(e) = self.enforce_environment(instance, &scope).await {
                error!(error = %e, environment = %environment.name, "failed to enforce environment");
                self.events
                    .warn(
                        instance,
                        REASON_ENVIRONMENT_ENFORCEMENT_FAILED,
                        format!("failed to enforce environment {}", environment.name),
                    )
                    .await;
                return Err(e);
            }
            self.record_initial_ready_time(instance, &scope);
        }
        Ok(())
    }

    async fn enforce_environment(&self, instance: &mut Instance, scope: &EnvironmentScope<'_>) -> Result<()> {
        match EnvironmentKind::of(scope.environment) {
            EnvironmentKind::Container => self.enforce_container_environment(instance, scope).await,
            EnvironmentKind::VirtualMachine => self.enforce_vm_environment(instance, scope).await,
            EnvironmentKind::Cluster => self.enforce_cluster_environment(instance, scope).await,
        }
    }

    /// Sets `initialReadyTime` the first time the instance is seen ready.
    fn record_initial_ready_time(&self, instance: &mut Instance, scope: &EnvironmentScope<'_>) {
        if instance.phase() != EnvironmentPhase::Ready {
            return;
        }
        let Some(created) = instance.metadata.creation_timestamp.clone() else {
            return;
        };
        let status = instance.status_mut();
        if !status.initial_ready_time.is_empty() {
            return;
        }

        let elapsed = (Utc::now() - created.0).to_std().unwrap_or_default();
        let elapsed = Duration::from_secs(elapsed.as_secs());
        status.initial_ready_time = format_duration(elapsed);
        info!(initial_ready_time = %status.initial_ready_time, "instance ready for the first time");

        if elapsed <= INITIAL_READY_OBSERVATION_LIMIT {
            let labels = ReadyLabels {
                workspace: scope.template.spec.workspace_ref.name.clone(),
                template: scope.template.name_any(),
                environment: scope.environment.name.clone(),
                environment_type: scope.environment.environment_type.to_string(),
                persistent: scope.environment.persistent,
            };
            self.metrics.observe_initial_ready(&labels, elapsed);
        }
    }

    /// Records where the instance workload got scheduled. Failures are only logged.
    async fn enforce_schedule_status(&self, instance: &mut Instance) {
        if !instance.spec.running {
            let status = instance.status_mut();
            status.node_name.clear();
            status.node_selector = None;
            return;
        }

        let selector = instance_selector_labels(instance);
        let pods = match self
            .store
            .list::<Pod>(instance.namespace().as_deref(), &selector)
            .await
        {
            Ok(pods) => pods,
            Err(e) => {
                warn!(error = %e, "failed to retrieve the instance pods");
                return;
            }
        };
        let Some(spec) = pods.into_iter().next().and_then(|pod| pod.spec) else {
            return;
        };

        let node_selector = spec.node_selector.map(|mut selector| {
            selector.remove(SCHEDULABLE_NODE_SELECTOR_KEY);
            selector
        });
        let status = instance.status_mut();
        status.node_name = spec.node_name.unwrap_or_default();
        status.node_selector = node_selector.filter(|s| !s.is_empty());
    }
}

/// Formats a whole-second duration as `1h2m3s`, `2m5s` or `7s`.
fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs % 3600 / 60, secs % 60);
    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// Watches Instances and the workloads they own.
pub struct InstanceController {
    client: Client,
    namespace: Option<String>,
    reconciler: Arc<InstanceReconciler<KubeStore, KubeEventSink>>,
}

impl InstanceController {
    /// Create a new instance controller, watching `namespace` or the whole cluster
    pub fn new(
        client: Client,
        namespace: Option<String>,
        reconciler: InstanceReconciler<KubeStore, KubeEventSink>,
    ) -> Self {
        Self {
            client,
            namespace,
            reconciler: Arc::new(reconciler),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
    {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl Controller for InstanceController {
    async fn run(&self) -> Result<()> {
        info!(namespace = self.namespace.as_deref().unwrap_or("*"), "Starting Instance controller");

        let concurrency = self.reconciler.config.max_concurrent_reconciles;
        KubeController::new(self.api::<Instance>(), watcher::Config::default())
            .owns(self.api::<Deployment>(), watcher::Config::default())
            .owns(self.api::<VirtualMachine>(), watcher::Config::default())
            .watches(
                self.api::<VirtualMachineInstance>(),
                watcher::Config::default(),
                |vmi: VirtualMachineInstance| {
                    let name = vmi.labels().get(LABEL_INSTANCE_KEY)?;
                    let namespace = vmi.namespace()?;
                    Some(ObjectRef::<Instance>::new(name).within(&namespace))
                },
            )
            .with_config(controller::Config::default().concurrency(concurrency))
            .shutdown_on_signal()
            .run(
                reconcile::<KubeStore, KubeEventSink>,
                error_policy::<KubeStore, KubeEventSink>,
                Arc::clone(&self.reconciler),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!("Reconciled instance: {}", obj.name);
                    }
                    Err(e) => {
                        warn!("Reconciliation failed: {}", e);
                    }
                }
            })
            .await;

        info!("Instance controller stopped");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "instance"
    }
}
