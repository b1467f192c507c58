//! Service and Ingresses exposing an environment inside the cluster

use super::{EnvironmentScope, InstanceReconciler};
use crate::crd::{EnvironmentMode, EnvironmentStatus, EnvironmentType, Instance};
use crate::error::Result;
use crate::events::EventSink;
use crate::resources::ingresses::{
    authentication_annotations, gui_annotations, gui_path, gui_status_url, host_name,
    ingress_spec, my_drive_annotations, my_drive_path, my_drive_status_url,
    INGRESS_GUI_NAME_SUFFIX, INGRESS_MY_DRIVE_NAME_SUFFIX,
};
use crate::resources::labels::{instance_object_labels, monitorable_service_labels};
use crate::resources::services::{service_spec, GUI_PORT_NAME, MY_DRIVE_PORT_NAME};
use crate::resources::{
    object_meta, object_meta_with_suffix, object_name, object_name_with_suffix,
    set_controller_reference,
};
use crate::store::{create_or_update, ObjectStore, StoreObject};
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use tracing::debug;

/// Status slot of the `index`-th environment, created if missing.
fn environment_status(instance: &mut Instance, index: usize) -> &mut EnvironmentStatus {
    let environments = &mut instance.status_mut().environments;
    if environments.len() <= index {
        environments.resize_with(index + 1, EnvironmentStatus::default);
    }
    &mut environments[index]
}

impl<S: ObjectStore, E: EventSink> InstanceReconciler<S, E> {
    /// Exposes the environment inside the cluster while the instance runs
    /// and withdraws it otherwise.
    pub(super) async fn enforce_exposition(
        &self,
        instance: &mut Instance,
        scope: &EnvironmentScope<'_>,
    ) -> Result<()> {
        if instance.spec.running {
            self.enforce_exposition_presence(instance, scope).await
        } else {
            self.enforce_exposition_absence(instance, scope).await
        }
    }

    async fn enforce_exposition_presence(
        &self,
        instance: &mut Instance,
        scope: &EnvironmentScope<'_>,
    ) -> Result<()> {
        let environment = scope.environment;
        let current: &Instance = instance;

        let (service, _) = create_or_update(
            &self.store,
            Service {
                metadata: object_meta(current),
                ..Default::default()
            },
            |svc: &mut Service, is_new| {
                if is_new {
                    svc.spec = Some(service_spec(current, environment));
                }
                let labels = instance_object_labels(svc.metadata.labels.as_ref(), current);
                svc.metadata.labels = Some(match environment.environment_type {
                    EnvironmentType::Container => monitorable_service_labels(labels),
                    _ => labels,
                });
                set_controller_reference(&mut svc.metadata, current);
                Ok(())
            },
        )
        .await?;
        let cluster_ip = service
            .spec
            .and_then(|spec| spec.cluster_ip)
            .unwrap_or_default();
        environment_status(instance, scope.index).ip = cluster_ip;

        if environment.is_vm_like() && !environment.gui_enabled {
            return Ok(());
        }

        let current: &Instance = instance;
        let urls = &self.config.service_urls;
        let host = host_name(&urls.website_base_url, environment.mode);
        let standard = environment.mode == EnvironmentMode::Standard;
        let service_name = object_name(current);

        let path = gui_path(current);
        create_or_update(
            &self.store,
            Ingress {
                metadata: object_meta_with_suffix(current, INGRESS_GUI_NAME_SUFFIX),
                ..Default::default()
            },
            |ingress: &mut Ingress, is_new| {
                if is_new {
                    ingress.spec = Some(ingress_spec(&host, &path, &service_name, GUI_PORT_NAME));
                }
                let annotations = gui_annotations(ingress.metadata.annotations.as_ref(), &path);
                ingress.metadata.annotations = Some(if standard {
                    authentication_annotations(annotations, &urls.instances_auth_url)
                } else {
                    annotations
                });
                ingress.metadata.labels =
                    Some(instance_object_labels(ingress.metadata.labels.as_ref(), current));
                set_controller_reference(&mut ingress.metadata, current);
                Ok(())
            },
        )
        .await?;
        let url = gui_status_url(&host, current);
        instance.status_mut().url = url;

        if environment.is_vm_like() || !standard {
            return Ok(());
        }

        let current: &Instance = instance;
        let path = my_drive_path(current);
        create_or_update(
            &self.store,
            Ingress {
                metadata: object_meta_with_suffix(current, INGRESS_MY_DRIVE_NAME_SUFFIX),
                ..Default::default()
            },
            |ingress: &mut Ingress, is_new| {
                if is_new {
                    ingress.spec = Some(ingress_spec(&host, &path, &service_name, MY_DRIVE_PORT_NAME));
                }
                let annotations = my_drive_annotations(ingress.metadata.annotations.as_ref());
                ingress.metadata.annotations =
                    Some(authentication_annotations(annotations, &urls.instances_auth_url));
                ingress.metadata.labels =
                    Some(instance_object_labels(ingress.metadata.labels.as_ref(), current));
                set_controller_reference(&mut ingress.metadata, current);
                Ok(())
            },
        )
        .await?;
        let url = my_drive_status_url(&host, current);
        instance.status_mut().my_drive_url = url;
        Ok(())
    }

    async fn enforce_exposition_absence(
        &self,
        instance: &mut Instance,
        scope: &EnvironmentScope<'_>,
    ) -> Result<()> {
        environment_status(instance, scope.index).ip.clear();
        let status = instance.status_mut();
        status.url.clear();
        status.my_drive_url.clear();

        let namespace = instance.namespace();
        let namespace = namespace.as_deref();
        self.enforce_object_absence::<Service>(namespace, &object_name(instance))
            .await?;
        self.enforce_object_absence::<Ingress>(
            namespace,
            &object_name_with_suffix(instance, INGRESS_GUI_NAME_SUFFIX),
        )
        .await?;
        self.enforce_object_absence::<Ingress>(
            namespace,
            &object_name_with_suffix(instance, INGRESS_MY_DRIVE_NAME_SUFFIX),
        )
        .await
    }

    /// Deletes the object if present.
    pub(super) async fn enforce_object_absence<K: StoreObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<()> {
        if self.store.delete::<K>(namespace, name).await? {
            debug!(kind = %K::kind(&()), name = %name, "object correctly removed");
        } else {
            debug!(kind = %K::kind(&()), name = %name, "object already removed");
        }
        Ok(())
    }
}
