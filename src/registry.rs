use std::{
    collections::BTreeMap,
    fs,
    path::Path,
    str::FromStr,
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDescriptor {
    pub name: String,
    /// Opaque handle of the backing auto-scaling group.
    pub resource_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
}

impl ClusterDescriptor {
    pub fn new(name: impl Into<String>, resource_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            resource_id: resource_id.into(),
            domain: None,
        }
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }
}

/// `NAME=RESOURCE_ID[@DOMAIN]`, as accepted by `--cluster`.
impl FromStr for ClusterDescriptor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, rest) = s
            .split_once('=')
            .ok_or_else(|| format!("expected NAME=RESOURCE_ID[@DOMAIN], got {s:?}"))?;
        let (resource_id, domain) = match rest.split_once('@') {
            Some((id, domain)) => (id, Some(domain)),
            None => (rest, None),
        };

        let name = name.trim();
        let resource_id = resource_id.trim();
        if name.is_empty() {
            return Err("cluster name is empty".to_string());
        }
        if resource_id.is_empty() {
            return Err(format!("resource id for cluster {name:?} is empty"));
        }

        let mut descriptor = ClusterDescriptor::new(name, resource_id);
        if let Some(domain) = domain.map(str::trim).filter(|d| !d.is_empty()) {
            descriptor = descriptor.with_domain(domain);
        }
        Ok(descriptor)
    }
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    clusters: Vec<ClusterDescriptor>,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterRegistry {
    by_name: BTreeMap<String, ClusterDescriptor>,
    name_by_resource: BTreeMap<String, String>,
}

impl ClusterRegistry {
    pub fn new(descriptors: impl IntoIterator<Item = ClusterDescriptor>) -> anyhow::Result<Self> {
        let mut registry = Self::default();
        for descriptor in descriptors {
            registry.insert(descriptor)?;
        }
        Ok(registry)
    }

    /// Builds the registry from an optional YAML file plus inline descriptors.
    /// Inline descriptors may not shadow file entries.
    pub fn load(
        file: Option<&Path>,
        inline: impl IntoIterator<Item = ClusterDescriptor>,
    ) -> anyhow::Result<Self> {
        let mut descriptors = Vec::new();
        if let Some(path) = file {
            let raw = fs::read_to_string(path)
                .with_context(|| format!("read cluster registry: {}", path.display()))?;
            let parsed: RegistryFile = serde_yaml::from_str(&raw)
                .with_context(|| format!("parse cluster registry: {}", path.display()))?;
            descriptors.extend(parsed.clusters);
        }
        descriptors.extend(inline);

        let registry = Self::new(descriptors)?;
        if registry.is_empty() {
            anyhow::bail!("no clusters configured (use --cluster or --clusters-file)");
        }
        Ok(registry)
    }

    fn insert(&mut self, descriptor: ClusterDescriptor) -> anyhow::Result<()> {
        if self.by_name.contains_key(&descriptor.name) {
            anyhow::bail!("duplicate cluster name: {}", descriptor.name);
        }
        if let Some(existing) = self.name_by_resource.get(&descriptor.resource_id) {
            anyhow::bail!(
                "resource id {} is mapped by both {} and {}",
                descriptor.resource_id,
                existing,
                descriptor.name
            );
        }
        self.name_by_resource
            .insert(descriptor.resource_id.clone(), descriptor.name.clone());
        self.by_name.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ClusterDescriptor> {
        self.by_name.get(name)
    }

    pub fn find_by_resource_id(&self, resource_id: &str) -> Option<&ClusterDescriptor> {
        self.name_by_resource
            .get(resource_id)
            .and_then(|name| self.by_name.get(name))
    }

    pub fn names(&self) -> Vec<String> {
        self.by_name.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ClusterDescriptor> {
        self.by_name.values()
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn parses_inline_descriptor_with_and_without_domain() {
        let plain: ClusterDescriptor = "arma=asg-arma".parse().unwrap();
        assert_eq!(plain, ClusterDescriptor::new("arma", "asg-arma"));

        let with_domain: ClusterDescriptor = " mumble = asg-mumble@voice.example.com".parse().unwrap();
        assert_eq!(
            with_domain,
            ClusterDescriptor::new("mumble", "asg-mumble").with_domain("voice.example.com")
        );
    }

    #[test]
    fn rejects_malformed_inline_descriptor() {
        assert!("arma".parse::<ClusterDescriptor>().is_err());
        assert!("=asg".parse::<ClusterDescriptor>().is_err());
        assert!("arma=".parse::<ClusterDescriptor>().is_err());
    }

    #[test]
    fn rejects_duplicate_names_and_resource_ids() {
        let err = ClusterRegistry::new([
            ClusterDescriptor::new("arma", "asg-1"),
            ClusterDescriptor::new("arma", "asg-2"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("duplicate cluster name"));

        let err = ClusterRegistry::new([
            ClusterDescriptor::new("arma", "asg-1"),
            ClusterDescriptor::new("mumble", "asg-1"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("asg-1"));
    }

    #[test]
    fn resolves_by_name_and_resource_id() {
        let registry = ClusterRegistry::new([
            ClusterDescriptor::new("mumble", "asg-mumble"),
            ClusterDescriptor::new("arma", "asg-arma"),
        ])
        .unwrap();

        assert_eq!(registry.names(), vec!["arma", "mumble"]);
        assert_eq!(registry.get("arma").unwrap().resource_id, "asg-arma");
        assert_eq!(
            registry.find_by_resource_id("asg-mumble").unwrap().name,
            "mumble"
        );
        assert!(registry.get("minecraft").is_none());
        assert!(registry.find_by_resource_id("asg-unknown").is_none());
    }

    #[test]
    fn load_merges_yaml_file_with_inline_descriptors() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("clusters.yaml");
        fs::write(
            &path,
            "clusters:\n  - name: arma\n    resource_id: asg-arma\n    domain: arma.example.com\n",
        )
        .unwrap();

        let registry =
            ClusterRegistry::load(Some(&path), [ClusterDescriptor::new("mumble", "asg-mumble")])
                .unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get("arma").unwrap().domain.as_deref(),
            Some("arma.example.com")
        );
    }

    #[test]
    fn load_without_any_cluster_is_an_error() {
        let err = ClusterRegistry::load(None, []).unwrap_err();
        assert!(err.to_string().contains("no clusters configured"));
    }
}
