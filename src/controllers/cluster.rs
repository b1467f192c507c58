//! Cluster environments, backed by Cluster-API objects
//!
//! The cluster, its KubeVirt infrastructure, the Kamaji control plane and the
//! worker MachineDeployment (with its machine and bootstrap templates) are
//! owned by the instance, as is the GUI showing them. The GUI cluster role and
//! its binding are cluster scoped and only carry the instance labels. The
//! phase is left to the Cluster-API controllers.

use super::{EnvironmentScope, InstanceReconciler};
use crate::crd::{
    CapiCluster, Instance, KamajiControlPlane, KubeadmConfigTemplate, KubevirtCluster,
    KubevirtMachineTemplate, MachineDeployment, Template,
};
use crate::error::Result;
use crate::events::EventSink;
use crate::resources::clusters::{
    bootstrap_template_spec, cluster_spec, cluster_template, control_plane_spec,
    infrastructure_annotations, machine_deployment_spec, visualizer_deployment_spec,
    visualizer_labels, visualizer_role_binding, visualizer_rules, visualizer_service_spec,
    worker_template_labels, worker_template_spec, ClusterNames,
};
use crate::resources::ingresses::host_name;
use crate::resources::labels::instance_object_labels;
use crate::resources::set_controller_reference;
use crate::store::{create_or_update, ObjectStore, StoreObject};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServiceAccount};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::info;

impl<S: ObjectStore, E: EventSink> InstanceReconciler<S, E> {
    pub(super) async fn enforce_cluster_environment(
        &self,
        instance: &mut Instance,
        scope: &EnvironmentScope<'_>,
    ) -> Result<()> {
        let environment = scope.environment;
        let cluster = cluster_template(environment)?;
        let names = ClusterNames::new(cluster);
        let host = host_name(&self.config.service_urls.website_base_url, environment.mode);
        let current: &Instance = instance;

        self.enforce_cluster_object(
            current,
            CapiCluster::new(&names.cluster, Default::default()),
            |obj: &mut CapiCluster, is_new| {
                if is_new {
                    obj.spec = cluster_spec(current, &names);
                }
                Ok(())
            },
        )
        .await?;

        self.enforce_cluster_object(
            current,
            KubevirtCluster::new(&names.infrastructure, Default::default()),
            |obj: &mut KubevirtCluster, _| {
                obj.metadata.annotations = Some(infrastructure_annotations(obj.metadata.annotations.as_ref()));
                Ok(())
            },
        )
        .await?;

        self.enforce_cluster_object(
            current,
            KamajiControlPlane::new(&names.control_plane, Default::default()),
            |obj: &mut KamajiControlPlane, is_new| {
                if is_new {
                    obj.spec = control_plane_spec(cluster, &host);
                }
                obj.spec.replicas = Some(cluster.control_plane.replicas);
                Ok(())
            },
        )
        .await?;

        self.enforce_cluster_object(
            current,
            MachineDeployment::new(&names.machine_deployment, Default::default()),
            |obj: &mut MachineDeployment, is_new| {
                if is_new {
                    obj.spec = machine_deployment_spec(current, cluster, &names);
                }
                obj.spec.replicas = Some(cluster.machine_deployment.replicas);
                Ok(())
            },
        )
        .await?;

        self.enforce_cluster_object(
            current,
            KubevirtMachineTemplate::new(&names.worker_template, Default::default()),
            |obj: &mut KubevirtMachineTemplate, is_new| {
                if is_new {
                    obj.spec = worker_template_spec(environment)?;
                }
                obj.metadata.labels = Some(worker_template_labels(obj.metadata.labels.as_ref(), &names));
                Ok(())
            },
        )
        .await?;

        self.enforce_cluster_object(
            current,
            KubeadmConfigTemplate::new(&names.bootstrap_template, Default::default()),
            |obj: &mut KubeadmConfigTemplate, is_new| {
                if is_new {
                    obj.spec = bootstrap_template_spec();
                }
                Ok(())
            },
        )
        .await?;

        self.enforce_visualizer(current, &names).await?;

        let location = names.kubeconfig_location(&current.namespace().unwrap_or_default());
        self.enforce_kubeconfig_location(scope.template, &location).await
    }

    /// GUI of the cluster: its service account with read access to the
    /// cluster objects, the Deployment and the Service in front of it.
    async fn enforce_visualizer(&self, instance: &Instance, names: &ClusterNames) -> Result<()> {
        let namespace = instance.namespace().unwrap_or_default();
        let rbac_name = names.visualizer_rbac(&namespace);

        self.enforce_cluster_object(instance, named::<ServiceAccount>(&names.visualizer), |_, _| Ok(()))
            .await?;

        self.enforce_cluster_scoped(instance, named::<ClusterRole>(&rbac_name), |obj: &mut ClusterRole, is_new| {
            if is_new {
                obj.rules = Some(visualizer_rules());
            }
        })
        .await?;

        self.enforce_cluster_scoped(
            instance,
            named::<ClusterRoleBinding>(&rbac_name),
            |obj: &mut ClusterRoleBinding, is_new| {
                if is_new {
                    let (role_ref, subjects) = visualizer_role_binding(names, &namespace);
                    obj.role_ref = role_ref;
                    obj.subjects = Some(subjects);
                }
            },
        )
        .await?;

        self.enforce_cluster_object(instance, named::<Deployment>(&names.visualizer), |obj: &mut Deployment, is_new| {
            if is_new {
                obj.spec = Some(visualizer_deployment_spec(instance, names));
            }
            obj.metadata.labels = Some(visualizer_labels(obj.metadata.labels.as_ref(), names));
            Ok(())
        })
        .await?;

        self.enforce_cluster_object(instance, named::<Service>(&names.visualizer), |obj: &mut Service, is_new| {
            if is_new {
                obj.spec = Some(visualizer_service_spec(names));
            }
            obj.metadata.labels = Some(visualizer_labels(obj.metadata.labels.as_ref(), names));
            Ok(())
        })
        .await
    }

    /// Creates or updates a cluster-scoped object of the cluster. A namespaced
    /// instance cannot own it, so it is only labelled.
    async fn enforce_cluster_scoped<K, F>(&self, instance: &Instance, seed: K, mutate: F) -> Result<()>
    where
        K: StoreObject,
        F: FnOnce(&mut K, bool) + Send,
    {
        create_or_update(&self.store, seed, |obj: &mut K, is_new| {
            mutate(obj, is_new);
            let meta = obj.meta_mut();
            meta.labels = Some(instance_object_labels(meta.labels.as_ref(), instance));
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Creates or updates an object of the cluster in the instance namespace,
    /// labelled and owned by the instance.
    async fn enforce_cluster_object<K, F>(&self, instance: &Instance, mut seed: K, mutate: F) -> Result<()>
    where
        K: StoreObject,
        F: FnOnce(&mut K, bool) -> Result<()> + Send,
    {
        seed.meta_mut().namespace = instance.namespace();
        create_or_update(&self.store, seed, |obj: &mut K, is_new| {
            mutate(obj, is_new)?;
            let meta = obj.meta_mut();
            meta.labels = Some(instance_object_labels(meta.labels.as_ref(), instance));
            set_controller_reference(meta, instance);
            Ok(())
        })
        .await?;
        Ok(())
    }

    /// Records on the template where the cluster kubeconfig can be found.
    async fn enforce_kubeconfig_location(&self, template: &Template, location: &str) -> Result<()> {
        let recorded = template
            .status
            .as_ref()
            .map(|s| s.kubeconfig_location.as_str())
            .unwrap_or_default();
        if recorded == location {
            return Ok(());
        }
        self.store
            .patch_status::<Template>(
                template.namespace().as_deref(),
                &template.name_any(),
                &json!({"status": {"kubeconfigLocation": location}}),
            )
            .await?;
        info!(location = %location, "kubeconfig location recorded on template");
        Ok(())
    }
}

fn named<K: Resource + Default>(name: &str) -> K {
    let mut obj = K::default();
    *obj.meta_mut() = ObjectMeta {
        name: Some(name.to_string()),
        ..Default::default()
    };
    obj
}

#[cfg(test)]
mod tests {
    use crate::controllers::testing::{reconciler, TestReconciler};
    use crate::controllers::EnvironmentScope;
    use crate::crd::{
        CapiCluster, ClusterTemplate, EnvironmentPhase, EnvironmentType, Instance,
        KamajiControlPlane, KubeadmConfigTemplate, KubevirtCluster, KubevirtMachineTemplate,
        MachineDeployment, ReplicaSettings, Template,
    };
    use crate::resources::clusters::CLUSTER_NAME_LABEL;
    use crate::resources::testing::{environment, instance, template, tenant};
    use crate::store::ObjectStore;
    use k8s_openapi::api::apps::v1::Deployment;
    use k8s_openapi::api::core::v1::{Service, ServiceAccount};
    use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
    use kube::ResourceExt;

    const NS: Option<&str> = Some("tenant-s123456");

    fn cluster_template_of(workers: i32) -> Template {
        let mut env = environment(EnvironmentType::Cluster);
        env.cluster = Some(ClusterTemplate {
            name: "k8s".to_string(),
            version: "v1.31.0".to_string(),
            service_type: "NodePort".to_string(),
            machine_deployment: ReplicaSettings { replicas: workers },
            ..Default::default()
        });
        template(vec![env])
    }

    async fn enforce(r: &TestReconciler, inst: &mut Instance, tmpl: &Template) {
        let owner = tenant("s123456", &[]);
        let scope = EnvironmentScope {
            template: tmpl,
            tenant: &owner,
            environment: &tmpl.spec.environment_list[0],
            index: 0,
        };
        r.enforce_cluster_environment(inst, &scope).await.unwrap();
    }

    #[tokio::test]
    async fn test_cluster_objects_are_created() {
        let r = reconciler();
        let tmpl = r.store.insert(cluster_template_of(2)).await;
        let mut inst = instance("lab");
        enforce(&r, &mut inst, &tmpl).await;

        let cluster: CapiCluster = r.store.get(NS, "k8s-cluster").await.unwrap().unwrap();
        assert_eq!(cluster.owner_references()[0].name, "lab");
        assert_eq!(
            cluster.spec.control_plane_ref.unwrap().name,
            "k8s-control-plane"
        );

        let infra: KubevirtCluster = r.store.get(NS, "k8s-infra").await.unwrap().unwrap();
        assert_eq!(infra.annotations()["cluster.x-k8s.io/managed-by"], "kamaji");

        let control_plane: KamajiControlPlane =
            r.store.get(NS, "k8s-control-plane").await.unwrap().unwrap();
        assert_eq!(control_plane.spec.version, "v1.31.0");

        let workers: MachineDeployment = r.store.get(NS, "k8s-md").await.unwrap().unwrap();
        assert_eq!(workers.spec.replicas, Some(2));

        let machine: KubevirtMachineTemplate = r.store.get(NS, "k8s-md-worker").await.unwrap().unwrap();
        assert_eq!(machine.labels()[CLUSTER_NAME_LABEL], "k8s-cluster");
        assert!(r.store.contains::<KubeadmConfigTemplate>(NS, "k8s-md-bootstrap").await);

        let stored: Template = r.store.get(Some("workspace-netlab"), "ubuntu").await.unwrap().unwrap();
        assert_eq!(
            stored.status.unwrap().kubeconfig_location,
            "tenant-s123456/k8s-cluster-kubeconfig"
        );
        assert_eq!(inst.phase(), EnvironmentPhase::Unset);
    }

    #[tokio::test]
    async fn test_visualizer_is_deployed_with_its_permissions() {
        let r = reconciler();
        let tmpl = r.store.insert(cluster_template_of(1)).await;
        let mut inst = instance("lab");
        enforce(&r, &mut inst, &tmpl).await;

        assert!(r.store.contains::<ServiceAccount>(NS, "k8s-visualizer").await);
        let deployment: Deployment = r.store.get(NS, "k8s-visualizer").await.unwrap().unwrap();
        assert_eq!(deployment.owner_references()[0].name, "lab");
        assert_eq!(deployment.labels()["app"], "k8s-visualizer");
        let service: Service = r.store.get(NS, "k8s-visualizer").await.unwrap().unwrap();
        assert_eq!(service.spec.unwrap().type_.as_deref(), Some("ClusterIP"));

        let role: ClusterRole = r
            .store
            .get(None, "tenant-s123456-k8s-visualizer")
            .await
            .unwrap()
            .unwrap();
        assert!(role.owner_references().is_empty());
        assert_eq!(role.labels()["crownlabs.polito.it/instance"], "lab");
        let binding: ClusterRoleBinding = r
            .store
            .get(None, "tenant-s123456-k8s-visualizer")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(binding.role_ref.name, role.name_any());
        let subject = binding.subjects.unwrap().remove(0);
        assert_eq!(subject.name, "k8s-visualizer");
        assert_eq!(subject.namespace.as_deref(), NS);

        enforce(&r, &mut inst, &tmpl).await;
        assert_eq!(r.store.replaces::<Deployment>(), 0);
        assert_eq!(r.store.replaces::<Service>(), 0);
        assert_eq!(r.store.replaces::<ClusterRole>(), 0);
        assert_eq!(r.store.replaces::<ClusterRoleBinding>(), 0);
        assert_eq!(r.store.creates::<ClusterRole>(), 1);
    }

    #[tokio::test]
    async fn test_worker_replicas_follow_template() {
        let r = reconciler();
        let mut inst = instance("lab");
        let tmpl = r.store.insert(cluster_template_of(1)).await;
        enforce(&r, &mut inst, &tmpl).await;

        let tmpl: Template = r.store.get(Some("workspace-netlab"), "ubuntu").await.unwrap().unwrap();
        let mut scaled = tmpl.clone();
        if let Some(cluster) = scaled.spec.environment_list[0].cluster.as_mut() {
            cluster.machine_deployment.replicas = 3;
        }
        enforce(&r, &mut inst, &scaled).await;

        let workers: MachineDeployment = r.store.get(NS, "k8s-md").await.unwrap().unwrap();
        assert_eq!(workers.spec.replicas, Some(3));
        assert_eq!(r.store.replaces::<MachineDeployment>(), 1);
        assert_eq!(r.store.replaces::<CapiCluster>(), 0);
    }

    #[tokio::test]
    async fn test_missing_cluster_section_fails() {
        let r = reconciler();
        let tmpl = template(vec![environment(EnvironmentType::Cluster)]);
        let owner = tenant("s123456", &[]);
        let scope = EnvironmentScope {
            template: &tmpl,
            tenant: &owner,
            environment: &tmpl.spec.environment_list[0],
            index: 0,
        };
        let mut inst = instance("lab");
        assert!(r.enforce_cluster_environment(&mut inst, &scope).await.is_err());
        assert!(!r.store.contains::<CapiCluster>(NS, "k8s-cluster").await);
    }
}
