//! Ingresses publishing the environment GUI and the MyDrive file browser

use crate::crd::{EnvironmentMode, Instance};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, IngressBackend, IngressRule, IngressServiceBackend,
    IngressSpec, IngressTLS, ServiceBackendPort,
};
use std::collections::BTreeMap;

pub const INGRESS_GUI_NAME_SUFFIX: &str = "gui";
pub const INGRESS_MY_DRIVE_NAME_SUFFIX: &str = "mydrive";

/// Secret holding the wildcard certificate of the website
pub const INGRESS_DEFAULT_CERTIFICATE_NAME: &str = "crownlabs-ingress-secret";

const MY_DRIVE_PATH_SUFFIX: &str = "mydrive";

const ANNOTATION_REWRITE_TARGET: &str = "nginx.ingress.kubernetes.io/rewrite-target";
const ANNOTATION_READ_TIMEOUT: &str = "nginx.ingress.kubernetes.io/proxy-read-timeout";
const ANNOTATION_SEND_TIMEOUT: &str = "nginx.ingress.kubernetes.io/proxy-send-timeout";
const ANNOTATION_CONFIGURATION_SNIPPET: &str = "nginx.ingress.kubernetes.io/configuration-snippet";
const ANNOTATION_BODY_SIZE: &str = "nginx.ingress.kubernetes.io/proxy-body-size";
const ANNOTATION_MAX_TEMP_FILE_SIZE: &str = "nginx.ingress.kubernetes.io/proxy-max-temp-file-size";
const ANNOTATION_AUTH_URL: &str = "nginx.ingress.kubernetes.io/auth-url";
const ANNOTATION_AUTH_SIGNIN: &str = "nginx.ingress.kubernetes.io/auth-signin";

/// Host serving the environments of the given mode.
pub fn host_name(website_base_url: &str, mode: EnvironmentMode) -> String {
    match mode {
        EnvironmentMode::Standard => website_base_url.to_string(),
        other => format!("{}.{}", other.as_str(), website_base_url),
    }
}

pub fn ingress_spec(host: &str, path: &str, service_name: &str, service_port: &str) -> IngressSpec {
    IngressSpec {
        tls: Some(vec![IngressTLS {
            hosts: Some(vec![host.to_string()]),
            secret_name: Some(INGRESS_DEFAULT_CERTIFICATE_NAME.to_string()),
        }]),
        rules: Some(vec![IngressRule {
            host: Some(host.to_string()),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some(format!("{}(/|$)(.*)", path)),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: service_name.to_string(),
                            port: Some(ServiceBackendPort {
                                name: Some(service_port.to_string()),
                                number: None,
                            }),
                        }),
                        resource: None,
                    },
                }],
            }),
        }]),
        ..Default::default()
    }
}

/// Adds the annotations required by the GUI ingress to `current`.
pub fn gui_annotations(
    current: Option<&BTreeMap<String, String>>,
    path: &str,
) -> BTreeMap<String, String> {
    let mut annotations = current.cloned().unwrap_or_default();
    annotations.insert(ANNOTATION_REWRITE_TARGET.to_string(), "/$2".to_string());
    annotations.insert(ANNOTATION_READ_TIMEOUT.to_string(), "3600".to_string());
    annotations.insert(ANNOTATION_SEND_TIMEOUT.to_string(), "3600".to_string());
    annotations.insert(
        ANNOTATION_CONFIGURATION_SNIPPET.to_string(),
        format!(
            r#"sub_filter '<head>' '<head> <base href="https://$host/{}/index.html">';"#,
            path.trim_start_matches('/')
        ),
    );
    annotations
}

/// Adds the annotations required by the MyDrive ingress to `current`.
pub fn my_drive_annotations(current: Option<&BTreeMap<String, String>>) -> BTreeMap<String, String> {
    let mut annotations = current.cloned().unwrap_or_default();
    annotations.insert(ANNOTATION_BODY_SIZE.to_string(), "0".to_string());
    annotations.insert(ANNOTATION_MAX_TEMP_FILE_SIZE.to_string(), "0".to_string());
    annotations.insert(ANNOTATION_READ_TIMEOUT.to_string(), "600".to_string());
    annotations.insert(ANNOTATION_SEND_TIMEOUT.to_string(), "600".to_string());
    annotations
}

/// Puts the ingress behind the authentication proxy at `auth_url`.
pub fn authentication_annotations(
    mut annotations: BTreeMap<String, String>,
    auth_url: &str,
) -> BTreeMap<String, String> {
    annotations.insert(ANNOTATION_AUTH_URL.to_string(), format!("{}/auth", auth_url));
    annotations.insert(
        ANNOTATION_AUTH_SIGNIN.to_string(),
        format!("{}/start?rd=$escaped_request_uri", auth_url),
    );
    annotations
}

fn instance_uid(instance: &Instance) -> &str {
    instance.metadata.uid.as_deref().unwrap_or_default()
}

pub fn gui_path(instance: &Instance) -> String {
    format!("/{}", instance_uid(instance))
}

pub fn my_drive_path(instance: &Instance) -> String {
    format!("/{}/{}", instance_uid(instance), MY_DRIVE_PATH_SUFFIX)
}

/// URL of the GUI recorded in the instance status.
pub fn gui_status_url(host: &str, instance: &Instance) -> String {
    format!("https://{}/{}/", host, instance_uid(instance))
}

pub fn my_drive_status_url(host: &str, instance: &Instance) -> String {
    format!("https://{}{}", host, my_drive_path(instance))
}
