//! Builders of the objects owned by an Instance
//!
//! Everything in this module is pure: functions take the instance and its
//! environment and return specs, names, labels or annotations. Enforcement
//! against the store lives in [`crate::controllers`].

pub mod cloud_init;
pub mod clusters;
pub mod containers;
pub mod ingresses;
pub mod labels;
pub mod load_balancers;
pub mod nfs;
pub mod services;
pub mod virtual_machines;

use crate::crd::Instance;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::Resource;
use rand::seq::SliceRandom;

const NAME_SEPARATOR: &str = "-";

/// Name of the objects owned by `instance`, safe for DNS-style names.
pub fn object_name(instance: &Instance) -> String {
    instance
        .metadata
        .name
        .as_deref()
        .unwrap_or_default()
        .replace('.', NAME_SEPARATOR)
}

pub fn object_name_with_suffix(instance: &Instance, suffix: &str) -> String {
    format!("{}{}{}", object_name(instance), NAME_SEPARATOR, suffix)
}

/// Name and namespace of the main object owned by `instance`.
pub fn object_meta(instance: &Instance) -> ObjectMeta {
    ObjectMeta {
        name: Some(object_name(instance)),
        namespace: instance.metadata.namespace.clone(),
        ..Default::default()
    }
}

pub fn object_meta_with_suffix(instance: &Instance, suffix: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(object_name_with_suffix(instance, suffix)),
        namespace: instance.metadata.namespace.clone(),
        ..Default::default()
    }
}

/// Controller reference pointing at `instance`.
pub fn owner_reference(instance: &Instance) -> OwnerReference {
    OwnerReference {
        api_version: Instance::api_version(&()).to_string(),
        kind: Instance::kind(&()).to_string(),
        name: instance.metadata.name.clone().unwrap_or_default(),
        uid: instance.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Makes `instance` the controller of the object described by `meta`,
/// replacing a stale reference to the same owner.
pub fn set_controller_reference(meta: &mut ObjectMeta, instance: &Instance) {
    let owner = owner_reference(instance);
    let refs = meta.owner_references.get_or_insert_with(Vec::new);
    match refs.iter_mut().find(|r| r.uid == owner.uid) {
        Some(existing) => *existing = owner,
        None => refs.push(owner),
    }
}

const ADJECTIVES: &[&str] = &[
    "agile", "bold", "brave", "bright", "calm", "clever", "cosmic", "eager", "fancy", "gentle",
    "happy", "jolly", "keen", "lively", "lucky", "merry", "mighty", "noble", "proud", "quick",
    "quiet", "rapid", "smart", "sunny", "swift", "tidy", "vivid", "witty",
];

const NOUNS: &[&str] = &[
    "badger", "beaver", "condor", "dolphin", "eagle", "falcon", "ferret", "gecko", "heron",
    "ibex", "jaguar", "koala", "lemur", "lynx", "marmot", "otter", "panda", "puffin", "quokka",
    "raven", "salmon", "tiger", "walrus", "yak", "zebra",
];

/// Random name made of two capitalized words, e.g. "Swift Otter".
pub fn random_pretty_name() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("happy");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("otter");
    format!("{} {}", capitalize(adjective), capitalize(noun))
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}


#[cfg(test)]
mod tests {
    use super::testing::instance;
    use super::*;

    #[test]
    fn test_object_names() {
        let inst = instance("lab.v1.2");
        assert_eq!(object_name(&inst), "lab-v1-2");
        assert_eq!(object_name_with_suffix(&inst, "gui"), "lab-v1-2-gui");
        let meta = object_meta_with_suffix(&inst, "pe");
        assert_eq!(meta.name.as_deref(), Some("lab-v1-2-pe"));
        assert_eq!(meta.namespace.as_deref(), Some("tenant-s123456"));
    }

    #[test]
    fn test_controller_reference_is_idempotent() {
        let inst = instance("lab");
        let mut meta = object_meta(&inst);
        set_controller_reference(&mut meta, &inst);
        set_controller_reference(&mut meta, &inst);
        let refs = meta.owner_references.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].kind, "Instance");
        assert_eq!(refs[0].api_version, "crownlabs.polito.it/v1alpha2");
        assert_eq!(refs[0].controller, Some(true));
    }

    #[test]
    fn test_random_pretty_name() {
        let name = random_pretty_name();
        let words: Vec<&str> = name.split(' ').collect();
        assert_eq!(words.len(), 2);
        assert!(words.iter().all(|w| w.chars().next().unwrap().is_uppercase()));
    }
}
