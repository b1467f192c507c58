//! Container and Standalone environments, backed by a Deployment

use super::{update_phase, EnvironmentScope, InstanceReconciler};
use crate::controllers::phase::phase_from_deployment;
use crate::crd::{EnvironmentPhase, Instance};
use crate::error::Result;
use crate::events::EventSink;
use crate::resources::containers::{deployment_spec, pvc_spec, replicas};
use crate::resources::labels::instance_object_labels;
use crate::resources::{object_meta, set_controller_reference};
use crate::store::{create_or_update, ObjectStore};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use tracing::debug;

impl<S: ObjectStore, E: EventSink> InstanceReconciler<S, E> {
    pub(super) async fn enforce_container_environment(
        &self,
        instance: &mut Instance,
        scope: &EnvironmentScope<'_>,
    ) -> Result<()> {
        let environment = scope.environment;
        self.enforce_exposition(instance, scope).await?;

        let current: &Instance = instance;
        if environment.persistent {
            create_or_update(
                &self.store,
                PersistentVolumeClaim {
                    metadata: object_meta(current),
                    ..Default::default()
                },
                |pvc: &mut PersistentVolumeClaim, is_new| {
                    if is_new {
                        pvc.spec = Some(pvc_spec(environment));
                    }
                    pvc.metadata.labels =
                        Some(instance_object_labels(pvc.metadata.labels.as_ref(), current));
                    set_controller_reference(&mut pvc.metadata, current);
                    Ok(())
                },
            )
            .await?;
        }

        let mounts = self.nfs_mounts(current, environment).await?;
        let images = &self.config.container_images;
        let (deployment, _) = create_or_update(
            &self.store,
            Deployment {
                metadata: object_meta(current),
                ..Default::default()
            },
            |deployment: &mut Deployment, is_new| {
                if is_new {
                    deployment.spec = Some(deployment_spec(current, environment, &mounts, images));
                }
                let spec = deployment.spec.get_or_insert_with(Default::default);
                spec.replicas = Some(replicas(current, environment, is_new));
                deployment.metadata.labels =
                    Some(instance_object_labels(deployment.metadata.labels.as_ref(), current));
                set_controller_reference(&mut deployment.metadata, current);
                Ok(())
            },
        )
        .await?;

        let phase = if !instance.spec.running && !environment.persistent {
            EnvironmentPhase::Off
        } else {
            phase_from_deployment(&deployment)
        };
        debug!(phase = %phase, "container environment enforced");
        update_phase(instance, phase);

        // allocation failures leave the workload and its phase untouched
        self.enforce_public_exposure(instance, scope).await
    }
}
