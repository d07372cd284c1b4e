use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;

use crate::{WebVmError, WebVmResult};

use super::StatePersistence;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The sub directory bundles are stored in.
pub const BUNDLES_SUBDIR: &str = "bundles";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`StatePersistence`] keeping one JSON file per document under a directory.
///
/// ```text
/// <root>/
/// ├── vm-status.json
/// ├── runtime-packages.json
/// ├── applications.json
/// └── bundles/
///     └── <package-id>.tar
/// ```
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    root: PathBuf,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl JsonFilePersistence {
    /// Creates a store rooted at `root`. The directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root directory.
    pub fn get_root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, name: &str) -> WebVmResult<PathBuf> {
        Ok(self.root.join(format!("{}.json", file_stem(name)?)))
    }

    fn bundle_path(&self, package_id: &str) -> WebVmResult<PathBuf> {
        Ok(self
            .root
            .join(BUNDLES_SUBDIR)
            .join(format!("{}.tar", file_stem(package_id)?)))
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl StatePersistence for JsonFilePersistence {
    async fn read_document(&self, name: &str) -> WebVmResult<Option<String>> {
        let path = self.document_path(name)?;
        match fs::read_to_string(&path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_document(&self, name: &str, contents: String) -> WebVmResult<()> {
        let path = self.document_path(name)?;
        write_atomic(&path, contents.as_bytes()).await
    }

    async fn delete_document(&self, name: &str) -> WebVmResult<()> {
        remove_if_exists(&self.document_path(name)?).await?;
        Ok(())
    }

    async fn save_bundle(&self, package_id: &str, data: Bytes) -> WebVmResult<()> {
        let path = self.bundle_path(package_id)?;
        write_atomic(&path, &data).await?;
        tracing::debug!("saved bundle for {package_id} to {}", path.display());
        Ok(())
    }

    async fn load_bundle(&self, package_id: &str) -> WebVmResult<Option<Bytes>> {
        match fs::read(self.bundle_path(package_id)?).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_bundle(&self, package_id: &str) -> WebVmResult<bool> {
        remove_if_exists(&self.bundle_path(package_id)?).await
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn file_stem(name: &str) -> WebVmResult<&str> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(WebVmError::Validation(format!(
            "invalid persistence key: {name:?}"
        )));
    }
    Ok(name)
}

/// Writes to a sibling temporary file and renames it over `path`.
async fn write_atomic(path: &Path, data: &[u8]) -> WebVmResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> WebVmResult<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::{AppKind, AppStatus, Application, PackageStatus, RuntimePackage};

    use super::*;

    #[test_log::test(tokio::test)]
    async fn test_json_persistence_round_trips_snapshots() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let persistence = JsonFilePersistence::new(dir.path().join("state"));

        assert!(persistence.load_packages().await?.is_none());

        let packages = vec![RuntimePackage {
            id: "nginx".into(),
            name: "nginx".into(),
            version: "1.25.0".into(),
            status: PackageStatus::Installed,
            install_date: Some(Utc::now()),
            ..Default::default()
        }];
        persistence.save_packages(&packages).await?;
        assert_eq!(persistence.load_packages().await?, Some(packages));

        let applications = vec![Application {
            id: "blog".into(),
            name: "Blog".into(),
            kind: AppKind::Static,
            deploy_path: "/opt/supabase/apps/blog/public".into(),
            status: AppStatus::Stopped,
            port: None,
            pid_file: "/opt/supabase/apps/blog/server.pid".into(),
            logs_path: "/opt/supabase/apps/blog/server.log".into(),
            created_at: Utc::now(),
            last_deployed_at: None,
            last_started_at: None,
            error_message: None,
        }];
        persistence.save_applications(&applications).await?;

        let raw = fs::read_to_string(dir.path().join("state/applications.json")).await?;
        assert!(raw.contains("\"lastStartedAt\":null"));
        assert_eq!(persistence.load_applications().await?, Some(applications));

        persistence.clear().await?;
        assert!(persistence.load_applications().await?.is_none());

        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_json_persistence_bundles() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let persistence = JsonFilePersistence::new(dir.path());

        persistence
            .save_bundle("nodejs", Bytes::from_static(b"bundle"))
            .await?;
        assert!(dir.path().join("bundles/nodejs.tar").exists());
        assert_eq!(
            persistence.load_bundle("nodejs").await?,
            Some(Bytes::from_static(b"bundle"))
        );
        assert!(persistence.delete_bundle("nodejs").await?);
        assert!(persistence.load_bundle("nodejs").await?.is_none());

        assert!(persistence
            .save_bundle("../escape", Bytes::new())
            .await
            .is_err());

        Ok(())
    }
}
