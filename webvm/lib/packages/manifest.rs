use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{PackageCategory, PackageStatus, RuntimePackage, ServiceUnit, WebVmResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

static PACKAGE_ID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9._-]*$").ok());

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The remote runtime package manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeManifest {
    /// The manifest version.
    #[serde(default)]
    pub version: String,

    /// When the manifest was generated.
    #[serde(default)]
    pub generated_at: Option<String>,

    /// The catalog entries.
    #[serde(default)]
    pub packages: Vec<ManifestPackage>,
}

/// A catalog entry as published in the manifest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestPackage {
    /// The package id.
    pub id: String,

    /// The display name.
    pub name: String,

    /// A short description.
    #[serde(default)]
    pub description: String,

    /// The package category.
    #[serde(default)]
    pub category: PackageCategory,

    /// The package version.
    pub version: String,

    /// The advisory size in bytes.
    #[serde(default)]
    pub size: u64,

    /// Ids of packages to install first.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Ids of packages that cannot be installed alongside.
    #[serde(default)]
    pub conflicts: Vec<String>,

    /// Where the bundle is fetched from.
    #[serde(default)]
    pub source_url: Option<String>,

    /// Shell commands run after extraction.
    #[serde(default)]
    pub post_install_commands: Vec<String>,

    /// Service units configured after extraction.
    #[serde(default)]
    pub service_units: Vec<ServiceUnit>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RuntimeManifest {
    /// Parses a manifest from JSON.
    pub fn from_slice(bytes: &[u8]) -> WebVmResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl ManifestPackage {
    /// Creates a catalog record in the `available` state.
    pub fn to_package(&self) -> RuntimePackage {
        let mut package = RuntimePackage {
            id: self.id.clone(),
            status: PackageStatus::Available,
            ..Default::default()
        };
        self.apply_to(&mut package);
        package
    }

    /// Overwrites the catalog-sourced fields of `package`, leaving its runtime fields alone.
    pub fn apply_to(&self, package: &mut RuntimePackage) {
        package.name = self.name.clone();
        package.description = self.description.clone();
        package.category = self.category;
        package.version = self.version.clone();
        package.size = self.size;
        package.dependencies = self.dependencies.clone();
        package.conflicts = self.conflicts.clone();
        package.source_url = self.source_url.clone();
        package.post_install_commands = self.post_install_commands.clone();
        package.service_units = self.service_units.clone();
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Returns `true` if `id` is a valid package id: lowercase alphanumerics, `.`, `_` and `-`,
/// starting with an alphanumeric.
pub fn is_valid_package_id(id: &str) -> bool {
    PACKAGE_ID.as_ref().is_some_and(|re| re.is_match(id))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_parses_optional_fields() -> anyhow::Result<()> {
        let manifest = RuntimeManifest::from_slice(
            br#"{
                "version": "1",
                "generatedAt": "2026-01-01T00:00:00Z",
                "packages": [
                    {"id": "nginx", "name": "nginx", "category": "web-server", "version": "1.25.0", "size": 1024},
                    {
                        "id": "nodejs", "name": "Node.js", "description": "JS runtime",
                        "category": "runtime", "version": "20.0.0", "size": 2048,
                        "dependencies": ["nginx"],
                        "sourceUrl": "/runtime-packages/nodejs.tar",
                        "postInstallCommands": ["node --version"],
                        "serviceUnits": [{"name": "node", "enable": true}]
                    }
                ]
            }"#,
        )?;

        assert_eq!(manifest.packages.len(), 2);
        assert!(manifest.packages[0].dependencies.is_empty());
        assert_eq!(manifest.packages[0].category, PackageCategory::WebServer);

        let node = manifest.packages[1].to_package();
        assert_eq!(node.dependencies, vec!["nginx"]);
        assert_eq!(node.status, PackageStatus::Available);
        assert!(node.service_units[0].enable);
        assert!(!node.service_units[0].start);

        Ok(())
    }

    #[test]
    fn test_is_valid_package_id() {
        assert!(is_valid_package_id("nginx"));
        assert!(is_valid_package_id("python3.12"));
        assert!(is_valid_package_id("static-server_2"));
        assert!(!is_valid_package_id(""));
        assert!(!is_valid_package_id("-nginx"));
        assert!(!is_valid_package_id("Nginx"));
        assert!(!is_valid_package_id("../etc"));
    }
}
