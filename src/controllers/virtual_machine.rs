//! VirtualMachine and CloudVM environments, backed by KubeVirt
//!
//! Persistent environments own a VirtualMachine whose `running` flag follows
//! the instance. Ephemeral ones own a standalone VirtualMachineInstance that
//! is created while running and never deleted, since that would lose the
//! guest disk: stopping only withdraws the exposition.

use super::{update_phase, EnvironmentScope, InstanceReconciler};
use crate::controllers::phase::{phase_from_virtual_machine, phase_from_virtual_machine_instance};
use crate::crd::{
    EnvironmentMode, EnvironmentPhase, Instance, VirtualMachine, VirtualMachineInstance,
};
use crate::error::Result;
use crate::events::EventSink;
use crate::resources::cloud_init::secret_data;
use crate::resources::labels::instance_object_labels;
use crate::resources::virtual_machines::{virtual_machine_instance_spec, virtual_machine_spec};
use crate::resources::{object_meta, object_name, set_controller_reference};
use crate::store::{create_or_update, ObjectStore};
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::ResourceExt;
use tracing::debug;

const SECRET_TYPE_OPAQUE: &str = "Opaque";

impl<S: ObjectStore, E: EventSink> InstanceReconciler<S, E> {
    pub(super) async fn enforce_vm_environment(
        &self,
        instance: &mut Instance,
        scope: &EnvironmentScope<'_>,
    ) -> Result<()> {
        if scope.environment.mode == EnvironmentMode::Standard {
            self.enforce_cloud_init_secret(instance, scope).await?;
        }

        self.enforce_exposition(instance, scope).await?;

        let phase = if scope.environment.persistent {
            self.enforce_virtual_machine(instance, scope).await?
        } else {
            self.enforce_virtual_machine_instance(instance, scope).await?
        };
        update_phase(instance, phase);

        self.enforce_public_exposure(instance, scope).await
    }

    /// Secret carrying the cloud-init user data: SSH keys and NFS mounts.
    async fn enforce_cloud_init_secret(&self, instance: &Instance, scope: &EnvironmentScope<'_>) -> Result<()> {
        let public_keys = self.public_keys(scope.tenant, scope.template).await?;
        let mounts = self.nfs_mounts(instance, scope.environment).await?;
        let data = secret_data(&public_keys, &mounts)?;

        let (_, outcome) = create_or_update(
            &self.store,
            Secret {
                metadata: object_meta(instance),
                ..Default::default()
            },
            |secret: &mut Secret, _| {
                secret.data = Some(data.into_iter().map(|(k, v)| (k, ByteString(v))).collect());
                secret.type_ = Some(SECRET_TYPE_OPAQUE.to_string());
                secret.metadata.labels =
                    Some(instance_object_labels(secret.metadata.labels.as_ref(), instance));
                set_controller_reference(&mut secret.metadata, instance);
                Ok(())
            },
        )
        .await?;
        debug!(keys = public_keys.len(), mounts = mounts.len(), result = outcome.as_str(), "cloud-init secret enforced");
        Ok(())
    }

    async fn enforce_virtual_machine(
        &self,
        instance: &Instance,
        scope: &EnvironmentScope<'_>,
    ) -> Result<EnvironmentPhase> {
        let environment = scope.environment;
        let (vm, _) = create_or_update(
            &self.store,
            VirtualMachine {
                metadata: object_meta(instance),
                spec: Default::default(),
                status: None,
            },
            |vm: &mut VirtualMachine, is_new| {
                // changing the spec later would restart the guest
                if is_new {
                    vm.spec = virtual_machine_spec(instance, environment)?;
                }
                vm.spec.running = Some(instance.spec.running);
                vm.metadata.labels = Some(instance_object_labels(vm.metadata.labels.as_ref(), instance));
                set_controller_reference(&mut vm.metadata, instance);
                Ok(())
            },
        )
        .await?;

        // same name as the VM, needed to detect quota failures while starting
        let vmi = self
            .store
            .get::<VirtualMachineInstance>(instance.namespace().as_deref(), &object_name(instance))
            .await?;
        if vmi.is_none() {
            debug!("virtual machine instance not present");
        }
        Ok(phase_from_virtual_machine(&vm, vmi.as_ref()))
    }

    async fn enforce_virtual_machine_instance(
        &self,
        instance: &Instance,
        scope: &EnvironmentScope<'_>,
    ) -> Result<EnvironmentPhase> {
        if !instance.spec.running {
            return Ok(EnvironmentPhase::Off);
        }

        let environment = scope.environment;
        let (vmi, _) = create_or_update(
            &self.store,
            VirtualMachineInstance {
                metadata: object_meta(instance),
                spec: Default::default(),
                status: None,
            },
            |vmi: &mut VirtualMachineInstance, is_new| {
                if is_new {
                    vmi.spec = virtual_machine_instance_spec(instance, environment)?;
                }
                vmi.metadata.labels = Some(instance_object_labels(vmi.metadata.labels.as_ref(), instance));
                set_controller_reference(&mut vmi.metadata, instance);
                Ok(())
            },
        )
        .await?;
        Ok(phase_from_virtual_machine_instance(&vmi))
    }
}

#[cfg(test)]
mod tests {
    use crate::controllers::testing::{reconciler, TestReconciler};
    use crate::controllers::EnvironmentScope;
    use crate::crd::{
        Environment, EnvironmentMode, EnvironmentPhase, EnvironmentType, Instance, VirtualMachine,
        VirtualMachineInstance, VirtualMachineInstanceStatus, VirtualMachineStatus,
    };
    use crate::resources::cloud_init::USER_DATA_KEY;
    use crate::resources::testing::{environment, instance, template, tenant};
    use crate::store::ObjectStore;
    use k8s_openapi::api::core::v1::{Secret, Service};
    use k8s_openapi::api::networking::v1::Ingress;
    use kube::ResourceExt;

    const NS: Option<&str> = Some("tenant-s123456");

    async fn enforce(r: &TestReconciler, inst: &mut Instance, env: Environment) {
        let tmpl = template(vec![env]);
        let owner = tenant("s123456", &["ssh-ed25519 OWNER"]);
        let scope = EnvironmentScope {
            template: &tmpl,
            tenant: &owner,
            environment: &tmpl.spec.environment_list[0],
            index: 0,
        };
        r.enforce_vm_environment(inst, &scope).await.unwrap();
    }

    fn persistent_vm() -> Environment {
        let mut env = environment(EnvironmentType::VirtualMachine);
        env.persistent = true;
        env.resources.disk = Some("20Gi".to_string());
        env
    }

    #[tokio::test]
    async fn test_cloud_init_secret() {
        let r = reconciler();
        let mut inst = instance("lab");
        enforce(&r, &mut inst, environment(EnvironmentType::VirtualMachine)).await;

        let secret: Secret = r.store.get(NS, "lab").await.unwrap().unwrap();
        assert_eq!(secret.type_.as_deref(), Some("Opaque"));
        let data = secret.data.unwrap();
        let user_data = &data[USER_DATA_KEY];
        assert!(String::from_utf8_lossy(&user_data.0).contains("ssh-ed25519 OWNER"));
        assert_eq!(secret.metadata.owner_references.unwrap()[0].name, "lab");
    }

    #[tokio::test]
    async fn test_exam_vm_has_no_secret() {
        let r = reconciler();
        let mut inst = instance("lab");
        let mut env = environment(EnvironmentType::VirtualMachine);
        env.mode = EnvironmentMode::Exam;
        enforce(&r, &mut inst, env).await;
        assert!(!r.store.contains::<Secret>(NS, "lab").await);
        assert!(r.store.contains::<VirtualMachineInstance>(NS, "lab").await);
    }

    #[tokio::test]
    async fn test_persistent_vm_follows_running_flag() {
        let r = reconciler();
        let mut inst = instance("lab");
        enforce(&r, &mut inst, persistent_vm()).await;

        let vm: VirtualMachine = r.store.get(NS, "lab").await.unwrap().unwrap();
        assert_eq!(vm.spec.running, Some(true));
        assert_eq!(vm.labels()["crownlabs.polito.it/instance"], "lab");
        assert_eq!(inst.phase(), EnvironmentPhase::Unset);

        let mut vm = vm;
        vm.status = Some(VirtualMachineStatus {
            printable_status: "Stopped".to_string(),
            ready: false,
        });
        r.store.insert(vm).await;

        inst.spec.running = false;
        enforce(&r, &mut inst, persistent_vm()).await;
        let vm: VirtualMachine = r.store.get(NS, "lab").await.unwrap().unwrap();
        assert_eq!(vm.spec.running, Some(false));
        assert!(vm.spec.template.is_some());
        assert_eq!(inst.phase(), EnvironmentPhase::Off);
        assert!(!r.store.contains::<Service>(NS, "lab").await);
        assert_eq!(r.store.creates::<VirtualMachine>(), 1);
    }

    #[tokio::test]
    async fn test_ephemeral_vmi() {
        let r = reconciler();
        let mut inst = instance("lab");
        enforce(&r, &mut inst, environment(EnvironmentType::VirtualMachine)).await;
        assert!(!r.store.contains::<VirtualMachine>(NS, "lab").await);

        let mut vmi: VirtualMachineInstance = r.store.get(NS, "lab").await.unwrap().unwrap();
        vmi.status = Some(VirtualMachineInstanceStatus {
            phase: "Scheduling".to_string(),
            conditions: Vec::new(),
        });
        r.store.insert(vmi).await;
        enforce(&r, &mut inst, environment(EnvironmentType::VirtualMachine)).await;
        assert_eq!(inst.phase(), EnvironmentPhase::Starting);

        // stopping leaves the VMI in place
        inst.spec.running = false;
        enforce(&r, &mut inst, environment(EnvironmentType::VirtualMachine)).await;
        assert_eq!(inst.phase(), EnvironmentPhase::Off);
        assert!(r.store.contains::<VirtualMachineInstance>(NS, "lab").await);
        assert!(!r.store.contains::<Service>(NS, "lab").await);
    }

    #[tokio::test]
    async fn test_second_pass_is_idempotent() {
        for env in [persistent_vm(), environment(EnvironmentType::VirtualMachine)] {
            let r = reconciler();
            let mut inst = instance("lab");
            enforce(&r, &mut inst, env.clone()).await;
            enforce(&r, &mut inst, env).await;

            assert_eq!(r.store.replaces::<VirtualMachine>(), 0);
            assert_eq!(r.store.replaces::<VirtualMachineInstance>(), 0);
            assert_eq!(r.store.replaces::<Secret>(), 0);
            assert_eq!(r.store.replaces::<Service>(), 0);
            assert_eq!(r.store.replaces::<Ingress>(), 0);
            assert_eq!(r.store.creates::<Secret>(), 1);
        }
    }
}
