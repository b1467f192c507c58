//! Instance Kubernetes Operator
//!
//! Reconciles `Instance` resources into the workloads of a virtual lab:
//! containers, virtual machines or whole Kubernetes clusters, together with
//! their in-cluster exposition and an optional public exposure through
//! LoadBalancer services.
//!
//! ## Custom Resources
//!
//! - `Instance`: a running copy of a template environment, owned by a tenant
//! - `Template`: the environments an instance can be created from (read only)
//! - `Tenant`: the owner of an instance, providing its SSH keys (read only)
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: crownlabs.polito.it/v1alpha2
//! kind: Instance
//! metadata:
//!   name: lab
//!   namespace: tenant-s123456
//! spec:
//!   running: true
//!   template.crownlabs.polito.it/TemplateRef:
//!     name: ubuntu
//!     namespace: workspace-netlab
//!   tenant.crownlabs.polito.it/TenantRef:
//!     name: s123456
//! ```

pub mod conditions;
pub mod config;
pub mod controllers;
pub mod crd;
pub mod error;
pub mod events;
pub mod leader_election;
pub mod metrics;
pub mod resources;
pub mod server;
pub mod store;

pub use config::ReconcilerConfig;
pub use controllers::{InstanceController, InstanceReconciler};
pub use crd::{Instance, InstanceSpec, InstanceStatus, Template, Tenant};
pub use error::{OperatorError, Result};
