//! Controllers of the Instance operator
//!
//! [`InstanceReconciler`] drives a single Instance towards its desired state,
//! dispatching to one enforcer per environment kind. [`InstanceController`]
//! feeds it from the `kube::runtime` watch loop.

mod cluster;
mod container;
mod exposition;
mod instance;
mod mounts;
pub mod phase;
pub mod public_exposure;
mod virtual_machine;

pub use instance::{InstanceController, InstanceReconciler};

use crate::crd::{Environment, EnvironmentPhase, EnvironmentType, Instance, Template, Tenant};
use crate::error::{OperatorError, Result};
use crate::events::EventSink;
use crate::store::ObjectStore;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, Instrument};

/// Base requeue delay after a failed pass
const ERROR_REQUEUE: Duration = Duration::from_secs(30);
/// Base requeue delay after an optimistic-concurrency conflict
const CONFLICT_REQUEUE: Duration = Duration::from_secs(2);

/// Common trait for all controllers
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    /// Start the controller's reconciliation loop
    async fn run(&self) -> Result<()>;

    /// Get the controller name for logging
    fn name(&self) -> &'static str;
}

/// Objects an environment is enforced against, resolved once per pass.
#[derive(Debug, Clone, Copy)]
pub struct EnvironmentScope<'a> {
    pub template: &'a Template,
    pub tenant: &'a Tenant,
    pub environment: &'a Environment,
    /// Position of the environment in the template, and of its status slot
    pub index: usize,
}

/// Enforcer selected for an environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentKind {
    Container,
    VirtualMachine,
    Cluster,
}

impl EnvironmentKind {
    pub fn of(environment: &Environment) -> Self {
        match environment.environment_type {
            EnvironmentType::Container | EnvironmentType::Standalone => EnvironmentKind::Container,
            EnvironmentType::VirtualMachine | EnvironmentType::CloudVm => EnvironmentKind::VirtualMachine,
            EnvironmentType::Cluster => EnvironmentKind::Cluster,
        }
    }
}

/// Records `phase` on the instance, logging transitions.
fn update_phase(instance: &mut Instance, phase: EnvironmentPhase) {
    let status = instance.status_mut();
    if status.phase != phase {
        info!(previous = %status.phase, current = %phase, "phase changed");
        status.phase = phase;
    }
}

/// Entry point of the watch loop.
pub async fn reconcile<S, E>(
    instance: Arc<Instance>,
    reconciler: Arc<InstanceReconciler<S, E>>,
) -> Result<Action>
where
    S: ObjectStore,
    E: EventSink,
{
    let namespace = instance.namespace().unwrap_or_default();
    let name = instance.name_any();
    let span = info_span!("instance", namespace = %namespace, name = %name);
    reconciler.reconcile(&namespace, &name).instrument(span).await
}

/// Requeue policy of failed passes: a base delay plus up to 50% of jitter.
pub fn error_policy<S, E>(
    _instance: Arc<Instance>,
    error: &OperatorError,
    _reconciler: Arc<InstanceReconciler<S, E>>,
) -> Action {
    let base = if error.is_conflict() {
        CONFLICT_REQUEUE
    } else {
        ERROR_REQUEUE
    };
    Action::requeue(with_jitter(base))
}

fn with_jitter(base: Duration) -> Duration {
    let max_jitter = u64::try_from(base.as_millis() / 2).unwrap_or(u64::MAX);
    base + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter))
}

/// Reconciler wired to the in-memory store, shared by the enforcer tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::InstanceReconciler;
    use crate::config::{PublicExposureConfig, ReconcilerConfig, DEFAULT_IP_ANNOTATION_KEY};
    use crate::events::testing::RecordingSink;
    use crate::metrics::InstanceMetrics;
    use crate::store::memory::MemoryStore;
    use prometheus::Registry;

    pub type TestReconciler = InstanceReconciler<MemoryStore, RecordingSink>;

    pub fn config() -> ReconcilerConfig {
        ReconcilerConfig {
            public_exposure: PublicExposureConfig::from_raw(
                "10.0.0.1,10.0.0.2",
                "metallb.universe.tf/allow-shared-ip=pe",
                DEFAULT_IP_ANNOTATION_KEY,
            )
            .unwrap(),
            ..Default::default()
        }
    }

    pub fn reconciler() -> TestReconciler {
        reconciler_with(config())
    }

    pub fn reconciler_with(config: ReconcilerConfig) -> TestReconciler {
        let metrics = InstanceMetrics::new(&Registry::new()).unwrap();
        InstanceReconciler::new(MemoryStore::new(), RecordingSink::default(), metrics, config)
    }
}
