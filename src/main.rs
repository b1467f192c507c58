//! Instance Kubernetes Operator
//!
//! This operator turns Instances into containers, virtual machines and
//! clusters, and exposes them inside and outside the cluster.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig)
//! instance-operator --website-base-url crownlabs.example.com
//!
//! # Run with custom log level
//! RUST_LOG=debug instance-operator
//! ```

use clap::Parser;
use instance_operator::config::{
    parse_annotations, ContainerImages, PublicExposureConfig, ReconcilerConfig, ServiceUrls,
    DEFAULT_IP_ANNOTATION_KEY,
};
use instance_operator::controllers::Controller;
use instance_operator::events::KubeEventSink;
use instance_operator::leader_election::{self, LeaderElector};
use instance_operator::metrics::InstanceMetrics;
use instance_operator::server::{self, Readiness};
use instance_operator::store::KubeStore;
use instance_operator::{InstanceController, InstanceReconciler};
use kube::Client;
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Instance Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "instance-operator")]
#[command(version, about = "Kubernetes Operator for virtual-lab Instances")]
struct Args {
    /// Enable leader election for HA deployments
    #[arg(long, default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, default_value = "")]
    leader_election_namespace: String,

    /// Namespace to watch (empty for all namespaces)
    #[arg(long, default_value = "")]
    namespace: String,

    /// Metrics bind address
    #[arg(long, default_value = "0.0.0.0:8080")]
    metrics_bind_address: SocketAddr,

    /// Health probe bind address
    #[arg(long, default_value = "0.0.0.0:8081")]
    health_probe_bind_address: SocketAddr,

    /// Host the environment GUIs are published at
    #[arg(long, env = "WEBSITE_BASE_URL", default_value = "crownlabs.example.com")]
    website_base_url: String,

    /// Authentication endpoint protecting the standard-mode ingresses
    #[arg(
        long,
        env = "INSTANCES_AUTH_URL",
        default_value = "https://crownlabs.example.com/app/instances/auth"
    )]
    instances_auth_url: String,

    /// Tag of the helper container images
    #[arg(long, default_value = "latest")]
    container_env_sidecars_tag: String,

    /// Image of the VNC server of container environments
    #[arg(long, default_value = "crownlabs/tigervnc")]
    container_env_x_vnc_img: String,

    /// Image of the websockify proxy of container environments
    #[arg(long, default_value = "crownlabs/websockify")]
    container_env_websockify_img: String,

    /// Image and tag of the MyDrive file browser
    #[arg(long, default_value = "filebrowser/filebrowser:v2.27.0")]
    container_env_filebrowser_img_tag: String,

    /// Image of the init container downloading the environment content
    #[arg(long, default_value = "crownlabs/content-downloader")]
    container_env_content_downloader_img: String,

    /// Comma separated IPs and ranges (`a-b` or CIDR) usable for public exposure
    #[arg(long, env = "PUBLIC_EXPOSURE_IP_POOL", default_value = "")]
    public_exposure_ip_pool: String,

    /// Annotations (`key=value,...`) added to every LoadBalancer service
    #[arg(long, default_value = "")]
    public_exposure_annotations: String,

    /// Annotation carrying the IP assigned to a LoadBalancer service
    #[arg(long, default_value = DEFAULT_IP_ANNOTATION_KEY)]
    public_exposure_ip_annotation_key: String,

    /// Labels (`key=value,...`) a namespace must carry for its instances to be reconciled
    #[arg(long, default_value = "")]
    namespace_whitelist: String,

    /// Number of instances reconciled concurrently
    #[arg(long, default_value = "8")]
    max_concurrent_reconciles: u16,

    /// Upper bound of a single reconciliation pass, in seconds
    #[arg(long, default_value = "30")]
    reconcile_timeout_secs: u64,
}

impl Args {
    fn reconciler_config(&self) -> anyhow::Result<ReconcilerConfig> {
        Ok(ReconcilerConfig {
            service_urls: ServiceUrls {
                website_base_url: self.website_base_url.clone(),
                instances_auth_url: self.instances_auth_url.clone(),
            },
            container_images: ContainerImages {
                images_tag: self.container_env_sidecars_tag.clone(),
                xvnc_image: self.container_env_x_vnc_img.clone(),
                websockify_image: self.container_env_websockify_img.clone(),
                mydrive_image_and_tag: self.container_env_filebrowser_img_tag.clone(),
                content_downloader_image: self.container_env_content_downloader_img.clone(),
            },
            public_exposure: PublicExposureConfig::from_raw(
                &self.public_exposure_ip_pool,
                &self.public_exposure_annotations,
                &self.public_exposure_ip_annotation_key,
            )?,
            namespace_whitelist: parse_annotations(&self.namespace_whitelist)?,
            max_concurrent_reconciles: self.max_concurrent_reconciles.max(1),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let args = Args::parse();
    let config = args.reconciler_config()?;

    info!("Starting Instance Kubernetes Operator");
    info!("Leader election: {}", args.leader_election);
    info!(
        "Watching namespace: {}",
        if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        }
    );
    info!(
        pool_size = config.public_exposure.ip_pool.len(),
        "Public exposure IP pool loaded"
    );

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    // Probes and metrics are served before the lease is acquired, so that
    // standby replicas report healthy
    let registry = Registry::new();
    let metrics = InstanceMetrics::new(&registry)?;
    let readiness = Readiness::default();
    spawn_server(args.metrics_bind_address, server::metrics_router(registry));
    spawn_server(
        args.health_probe_bind_address,
        server::health_router(readiness.clone()),
    );

    // Leader election: acquire lease before starting the controller
    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("Leader election namespace: {}", ns);
        let elector = LeaderElector::new(client.clone(), &ns);
        elector.acquire().await?;
        Some(Arc::new(elector))
    } else {
        None
    };

    let reconciler = InstanceReconciler::new(
        KubeStore::new(client.clone()),
        KubeEventSink::new(client.clone()),
        metrics,
        config,
    );
    let namespace = Some(args.namespace.clone()).filter(|ns| !ns.is_empty());
    let controller = Arc::new(InstanceController::new(client, namespace, reconciler));

    let controller_handle = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move {
            if let Err(e) = controller.run().await {
                error!("{} controller error: {}", controller.name(), e);
            }
        })
    };
    readiness.set_ready();

    // Periodic lease renewal (no-op future when leader election is disabled)
    let elector_for_renew = elector.clone();
    let renew_handle = tokio::spawn(async move {
        match elector_for_renew {
            Some(e) => loop {
                tokio::time::sleep(e.renew_interval()).await;
                match e.renew().await {
                    Ok(true) => {}
                    Ok(false) => {
                        error!("Lost leader lease");
                        break;
                    }
                    Err(err) => {
                        error!("Failed to renew leader lease: {}", err);
                        break;
                    }
                }
            },
            None => std::future::pending::<()>().await,
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = controller_handle => {
            if let Err(e) = result {
                error!("Instance controller task failed: {}", e);
            }
        }
        _ = renew_handle => {
            error!("Leader lease lost, initiating shutdown");
        }
    }

    // Release the lease before exiting so a standby replica can take over immediately
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("Instance Operator shutting down");
    Ok(())
}

fn spawn_server(addr: SocketAddr, router: axum::Router) {
    tokio::spawn(async move {
        if let Err(e) = server::serve(addr, router).await {
            error!(address = %addr, "HTTP endpoint failed: {}", e);
        }
    });
}
