//! Runtime configuration of the Instance reconciler
//!
//! Built once from the command line in `main` and handed to the reconciler.

use crate::error::{OperatorError, Result};
use std::collections::{BTreeMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;

/// Default annotation carrying the IP assigned to a LoadBalancer service
pub const DEFAULT_IP_ANNOTATION_KEY: &str = "metallb.universe.tf/loadBalancerIPs";

/// Everything the reconciler needs besides the store
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub service_urls: ServiceUrls,
    pub container_images: ContainerImages,
    pub public_exposure: PublicExposureConfig,
    /// Labels a namespace must carry for its instances to be reconciled;
    /// empty disables the check
    pub namespace_whitelist: BTreeMap<String, String>,
    pub max_concurrent_reconciles: u16,
    pub reconcile_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            service_urls: ServiceUrls::default(),
            container_images: ContainerImages::default(),
            public_exposure: PublicExposureConfig::default(),
            namespace_whitelist: BTreeMap::new(),
            max_concurrent_reconciles: 8,
            reconcile_timeout: Duration::from_secs(30),
        }
    }
}

/// Public endpoints environments are reachable at
#[derive(Debug, Clone)]
pub struct ServiceUrls {
    /// Host serving the GUI and MyDrive ingresses
    pub website_base_url: String,
    /// oauth2-proxy endpoint protecting standard-mode ingresses
    pub instances_auth_url: String,
}

impl Default for ServiceUrls {
    fn default() -> Self {
        Self {
            website_base_url: "crownlabs.example.com".to_string(),
            instances_auth_url: "https://crownlabs.example.com/app/instances/auth".to_string(),
        }
    }
}

/// Images of the helper containers of container environments
#[derive(Debug, Clone)]
pub struct ContainerImages {
    pub images_tag: String,
    pub xvnc_image: String,
    pub websockify_image: String,
    /// Image and tag of the file browser, versioned independently
    pub mydrive_image_and_tag: String,
    pub content_downloader_image: String,
}

impl Default for ContainerImages {
    fn default() -> Self {
        Self {
            images_tag: "latest".to_string(),
            xvnc_image: "crownlabs/tigervnc".to_string(),
            websockify_image: "crownlabs/websockify".to_string(),
            mydrive_image_and_tag: "filebrowser/filebrowser:v2.27.0".to_string(),
            content_downloader_image: "crownlabs/content-downloader".to_string(),
        }
    }
}

impl ContainerImages {
    pub fn xvnc(&self) -> String {
        format!("{}:{}", self.xvnc_image, self.images_tag)
    }

    pub fn websockify(&self) -> String {
        format!("{}:{}", self.websockify_image, self.images_tag)
    }

    pub fn content_downloader(&self) -> String {
        format!("{}:{}", self.content_downloader_image, self.images_tag)
    }
}

/// Settings of the LoadBalancer services used for public exposure
#[derive(Debug, Clone)]
pub struct PublicExposureConfig {
    /// IPs that may be assigned, without duplicates
    pub ip_pool: Vec<IpAddr>,
    /// Annotations added to every LoadBalancer service
    pub common_annotations: BTreeMap<String, String>,
    /// Annotation carrying the assigned IP
    pub ip_annotation_key: String,
}

impl Default for PublicExposureConfig {
    fn default() -> Self {
        Self {
            ip_pool: Vec::new(),
            common_annotations: BTreeMap::new(),
            ip_annotation_key: DEFAULT_IP_ANNOTATION_KEY.to_string(),
        }
    }
}

impl PublicExposureConfig {
    /// Builds the configuration from the raw command-line values.
    pub fn from_raw(ip_pool: &str, annotations: &str, ip_annotation_key: &str) -> Result<Self> {
        if ip_annotation_key.trim().is_empty() {
            return Err(OperatorError::Configuration(
                "the public exposure IP annotation key cannot be empty".to_string(),
            ));
        }
        Ok(Self {
            ip_pool: parse_ip_pool(ip_pool)?,
            common_annotations: parse_annotations(annotations)?,
            ip_annotation_key: ip_annotation_key.trim().to_string(),
        })
    }

    /// Whether `ip` (as written in a service annotation) belongs to the pool.
    pub fn contains(&self, ip: &str) -> bool {
        ip.parse::<IpAddr>()
            .map(|ip| self.ip_pool.contains(&ip))
            .unwrap_or(false)
    }
}

/// Parses `key1=val1,key2=val2` into a map.
///
/// Keys and values are trimmed; an entry without `=` or with an empty key is
/// rejected. An empty input yields an empty map.
pub fn parse_annotations(raw: &str) -> Result<BTreeMap<String, String>> {
    let mut annotations = BTreeMap::new();
    if raw.trim().is_empty() {
        return Ok(annotations);
    }

    for pair in raw.split(',') {
        let (key, value) = pair.trim().split_once('=').ok_or_else(|| {
            OperatorError::Configuration(format!("invalid annotation format: {}", pair))
        })?;
        let key = key.trim();
        if key.is_empty() {
            return Err(OperatorError::Configuration(format!(
                "empty annotation key in: {}",
                pair
            )));
        }
        annotations.insert(key.to_string(), value.trim().to_string());
    }
    Ok(annotations)
}

/// Largest number of addresses a single range or CIDR entry may expand to
const MAX_POOL_ENTRY_SIZE: u128 = 65536;

/// Parses a comma-separated list of IP addresses, `first-last` ranges and
/// CIDR blocks into the addresses they cover, dropping duplicates.
pub fn parse_ip_pool(raw: &str) -> Result<Vec<IpAddr>> {
    let mut pool: Vec<IpAddr> = Vec::new();
    let mut seen: HashSet<IpAddr> = HashSet::new();
    for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        for ip in expand_pool_entry(entry)? {
            if seen.insert(ip) {
                pool.push(ip);
            }
        }
    }
    Ok(pool)
}

fn expand_pool_entry(entry: &str) -> Result<Vec<IpAddr>> {
    let invalid = |reason: String| {
        OperatorError::Configuration(format!(
            "invalid entry '{}' in public exposure pool: {}",
            entry, reason
        ))
    };
    let parse = |raw: &str| raw.trim().parse::<IpAddr>().map_err(|e| invalid(e.to_string()));

    let (first, last) = if let Some((addr, prefix)) = entry.split_once('/') {
        let addr = parse(addr)?;
        let bits: u32 = if addr.is_ipv4() { 32 } else { 128 };
        let prefix: u32 = prefix
            .trim()
            .parse()
            .ok()
            .filter(|p| *p <= bits)
            .ok_or_else(|| invalid(format!("bad prefix length '{}'", prefix)))?;
        let host_bits = bits - prefix;
        let mask = if host_bits >= 128 { u128::MAX } else { (1u128 << host_bits) - 1 };
        let network = ip_to_u128(addr) & !mask;
        (with_value(addr, network), with_value(addr, network | mask))
    } else if let Some((first, last)) = entry.split_once('-') {
        (parse(first)?, parse(last)?)
    } else {
        let ip = parse(entry)?;
        (ip, ip)
    };

    if first.is_ipv4() != last.is_ipv4() {
        return Err(invalid("mixed address families".to_string()));
    }
    let (start, end) = (ip_to_u128(first), ip_to_u128(last));
    if start > end {
        return Err(invalid("range end precedes its start".to_string()));
    }
    if end - start >= MAX_POOL_ENTRY_SIZE {
        return Err(invalid(format!("more than {} addresses", MAX_POOL_ENTRY_SIZE)));
    }
    Ok((start..=end).map(|value| with_value(first, value)).collect())
}

fn ip_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Address of the same family as `like` with numeric value `value`.
fn with_value(like: IpAddr, value: u128) -> IpAddr {
    match like {
        IpAddr::V4(_) => IpAddr::V4(std::net::Ipv4Addr::from(value as u32)),
        IpAddr::V6(_) => IpAddr::V6(std::net::Ipv6Addr::from(value)),
    }
}
