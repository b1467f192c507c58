//! Label sets applied to instances and to the objects they own

use crate::crd::{Environment, Instance, Template};
use std::collections::BTreeMap;

pub const LABEL_MANAGED_BY_KEY: &str = "crownlabs.polito.it/managed-by";
pub const LABEL_INSTANCE_KEY: &str = "crownlabs.polito.it/instance";
pub const LABEL_WORKSPACE_KEY: &str = "crownlabs.polito.it/workspace";
pub const LABEL_TEMPLATE_KEY: &str = "crownlabs.polito.it/template";
pub const LABEL_TENANT_KEY: &str = "crownlabs.polito.it/tenant";
pub const LABEL_PERSISTENT_KEY: &str = "crownlabs.polito.it/persistent";
pub const LABEL_COMPONENT_KEY: &str = "crownlabs.polito.it/component";
pub const LABEL_METRICS_ENABLED_KEY: &str = "crownlabs.polito.it/metrics-enabled";

pub const LABEL_MANAGED_BY_VALUE: &str = "instance";

/// Returns the labels an Instance should carry given its template, and
/// whether they differ from `current`.
pub fn instance_labels(
    current: Option<&BTreeMap<String, String>>,
    template: &Template,
) -> (BTreeMap<String, String>, bool) {
    let mut labels = current.cloned().unwrap_or_default();
    let mut update = false;
    update |= update_label(&mut labels, LABEL_MANAGED_BY_KEY, LABEL_MANAGED_BY_VALUE);
    update |= update_label(
        &mut labels,
        LABEL_WORKSPACE_KEY,
        &template.spec.workspace_ref.name,
    );
    update |= update_label(
        &mut labels,
        LABEL_TEMPLATE_KEY,
        template.metadata.name.as_deref().unwrap_or_default(),
    );
    update |= update_label(
        &mut labels,
        LABEL_PERSISTENT_KEY,
        persistent_label_value(&template.spec.environment_list),
    );
    (labels, update)
}

/// Adds the ownership labels of `instance` on top of `current`.
pub fn instance_object_labels(
    current: Option<&BTreeMap<String, String>>,
    instance: &Instance,
) -> BTreeMap<String, String> {
    let mut labels = current.cloned().unwrap_or_default();
    labels.insert(LABEL_MANAGED_BY_KEY.to_string(), LABEL_MANAGED_BY_VALUE.to_string());
    labels.insert(LABEL_INSTANCE_KEY.to_string(), instance_name(instance));
    labels.insert(LABEL_TEMPLATE_KEY.to_string(), instance.spec.template.name.clone());
    labels.insert(LABEL_TENANT_KEY.to_string(), instance.spec.tenant.name.clone());
    labels
}

/// Labels selecting the pods (or VMIs) of `instance`.
pub fn instance_selector_labels(instance: &Instance) -> BTreeMap<String, String> {
    BTreeMap::from([
        (LABEL_INSTANCE_KEY.to_string(), instance_name(instance)),
        (LABEL_TEMPLATE_KEY.to_string(), instance.spec.template.name.clone()),
        (LABEL_TENANT_KEY.to_string(), instance.spec.tenant.name.clone()),
    ])
}

/// Marks a service as scrapable by the monitoring stack.
pub fn monitorable_service_labels(mut labels: BTreeMap<String, String>) -> BTreeMap<String, String> {
    labels.insert(LABEL_METRICS_ENABLED_KEY.to_string(), "true".to_string());
    labels
}

fn instance_name(instance: &Instance) -> String {
    instance.metadata.name.clone().unwrap_or_default()
}

fn update_label(labels: &mut BTreeMap<String, String>, key: &str, value: &str) -> bool {
    if labels.get(key).map(String::as_str) == Some(value) {
        return false;
    }
    labels.insert(key.to_string(), value.to_string());
    true
}

fn persistent_label_value(environments: &[Environment]) -> &'static str {
    if environments.iter().any(|e| e.persistent) {
        "true"
    } else {
        "false"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::testing::{environment, instance, template};
    use crate::crd::EnvironmentType;

    #[test]
    fn test_instance_labels_update_detection() {
        let mut tmpl = template(vec![environment(EnvironmentType::Container)]);
        tmpl.spec.environment_list[0].persistent = true;

        let (labels, update) = instance_labels(None, &tmpl);
        assert!(update);
        assert_eq!(labels[LABEL_WORKSPACE_KEY], "netlab");
        assert_eq!(labels[LABEL_TEMPLATE_KEY], "ubuntu");
        assert_eq!(labels[LABEL_PERSISTENT_KEY], "true");

        let (again, update) = instance_labels(Some(&labels), &tmpl);
        assert!(!update);
        assert_eq!(again, labels);
    }

    #[test]
    fn test_object_labels_keep_existing_ones() {
        let inst = instance("lab.1");
        let existing = BTreeMap::from([("custom".to_string(), "x".to_string())]);
        let labels = instance_object_labels(Some(&existing), &inst);
        assert_eq!(labels["custom"], "x");
        assert_eq!(labels[LABEL_INSTANCE_KEY], "lab.1");
        assert_eq!(labels[LABEL_TENANT_KEY], "s123456");
        assert_eq!(labels[LABEL_MANAGED_BY_KEY], "instance");
    }

    #[test]
    fn test_selector_labels() {
        let labels = instance_selector_labels(&instance("lab"));
        assert_eq!(labels.len(), 3);
        assert!(!labels.contains_key(LABEL_MANAGED_BY_KEY));
        let monitored = monitorable_service_labels(labels);
        assert_eq!(monitored[LABEL_METRICS_ENABLED_KEY], "true");
    }
}
