use std::{sync::Arc, time::Duration};

use webvm::{
    apps::AppServer,
    bridge::{bootstrap, BootstrapOutcome, EmulatedVm, VmBridge},
    config::WebVmConfig,
    persistence::JsonFilePersistence,
    remote::MemorySource,
    InstallOptions, PackageStatus, RemoveOptions,
};
use webvmfs::{MemoryFileStore, ScopedFileStore};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const MANIFEST_URL: &str = "http://127.0.0.1:5173/runtime-packages/index.json";

const NGINX_URL: &str = "http://127.0.0.1:5173/runtime-packages/nginx.tar";

const NODEJS_URL: &str = "http://127.0.0.1:5173/runtime-packages/nodejs.tar";

const MANIFEST: &str = r#"{
    "version": "1",
    "packages": [
        {
            "id": "nginx",
            "name": "nginx",
            "category": "web-server",
            "version": "1.24.0",
            "sourceUrl": "/runtime-packages/nginx.tar",
            "serviceUnits": [{ "name": "nginx", "enable": true, "start": false }]
        },
        {
            "id": "nodejs",
            "name": "Node.js",
            "category": "runtime",
            "version": "20.11.0",
            "dependencies": ["nginx"],
            "sourceUrl": "/runtime-packages/nodejs.tar",
            "postInstallCommands": ["ln -sf /opt/supabase/runtimes/nodejs/bin/node /usr/bin/node"]
        }
    ]
}"#;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_install_with_dependencies_end_to_end() -> anyhow::Result<()> {
    let state = tempfile::tempdir()?;
    let (server, files, source) = setup(state.path()).await?;

    let result = server
        .install_package("nodejs", InstallOptions::default())
        .await?;
    assert!(result.success);
    assert_eq!(result.installed_packages, vec!["nodejs", "nginx"]);

    for id in ["nginx", "nodejs"] {
        let package = server
            .repository()
            .get_package(id)
            .ok_or_else(|| anyhow::anyhow!("{id} missing from catalog"))?;
        assert_eq!(package.status, PackageStatus::Installed);
    }

    assert_eq!(
        files
            .read("runtime:nodejs", "bin/node")
            .await?
            .into_data(),
        "#!/bin/sh\necho node"
    );
    assert!(files.exists("runtime:nginx", "conf/nginx.conf").await?);

    let status = server.manager().status();
    assert!(status.installed_runtimes.contains("nginx"));
    assert!(status.installed_runtimes.contains("nodejs"));

    // A second install is a warning, not a second download.
    let again = server
        .install_package("nodejs", InstallOptions::default())
        .await?;
    assert!(again.success);
    assert!(!again.warnings.is_empty());
    assert_eq!(source.request_count(NODEJS_URL).await, 1);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_installed_state_survives_restart() -> anyhow::Result<()> {
    let state = tempfile::tempdir()?;
    {
        let (server, _, _) = setup(state.path()).await?;
        server
            .install_package("nginx", InstallOptions::default())
            .await?;
    }

    let (server, _, _) = setup(state.path()).await?;
    let nginx = server
        .repository()
        .get_package("nginx")
        .ok_or_else(|| anyhow::anyhow!("nginx missing from catalog"))?;
    assert_eq!(nginx.status, PackageStatus::Installed);
    assert!(server
        .manager()
        .status()
        .installed_runtimes
        .contains("nginx"));

    let removed = server
        .remove_package("nginx", RemoveOptions::default())
        .await?;
    assert!(removed.success);
    assert_eq!(
        server.repository().get_package("nginx").map(|p| p.status),
        Some(PackageStatus::Available)
    );

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_failed_refresh_keeps_last_catalog() -> anyhow::Result<()> {
    let state = tempfile::tempdir()?;
    let (server, _, source) = setup(state.path()).await?;
    let before = server.repository().get_available_packages();
    assert_eq!(before.len(), 2);

    source.fail(MANIFEST_URL, "connection reset").await;
    assert!(server.repository().refresh_manifest().await.is_err());

    let report = server
        .repository()
        .get_last_error()
        .await
        .ok_or_else(|| anyhow::anyhow!("refresh failure was not recorded"))?;
    assert!(report.message.contains("connection reset"));
    assert_eq!(server.repository().get_available_packages(), before);

    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_snapshot_tracks_catalog_changes() -> anyhow::Result<()> {
    let state = tempfile::tempdir()?;
    let (server, _, _) = setup(state.path()).await?;
    let mut snapshots = server.subscribe();

    server
        .install_package("nginx", InstallOptions::default())
        .await?;

    tokio::time::timeout(
        Duration::from_secs(1),
        snapshots.wait_for(|s| {
            s.packages
                .iter()
                .any(|p| p.id == "nginx" && p.status == PackageStatus::Installed)
        }),
    )
    .await??;

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

async fn setup(
    state: &std::path::Path,
) -> anyhow::Result<(AppServer, Arc<MemoryFileStore>, Arc<MemorySource>)> {
    let source = Arc::new(MemorySource::new());
    source.insert(MANIFEST_URL, MANIFEST).await;
    source
        .insert(
            NGINX_URL,
            tar_bundle(&[("conf/nginx.conf", "worker_processes 1;")])?,
        )
        .await;
    source
        .insert(
            NODEJS_URL,
            tar_bundle(&[("bin/node", "#!/bin/sh\necho node"), ("README.md", "node")])?,
        )
        .await;

    let files = Arc::new(MemoryFileStore::new());
    let bridge = Arc::new(VmBridge::new());
    let outcome = bootstrap(&bridge, None, Arc::new(EmulatedVm::new(files.clone()))).await;
    assert!(matches!(outcome, BootstrapOutcome::Emulated { .. }));

    let config = WebVmConfig::builder()
        .boot_step_delay(Duration::from_millis(1))
        .wake_delay(Duration::from_millis(1))
        .build();

    let server = AppServer::builder()
        .config(config)
        .bridge(bridge)
        .files(files.clone())
        .persistence(Arc::new(JsonFilePersistence::new(state)))
        .remote(source.clone())
        .build()
        .await?;

    Ok((server, files, source))
}

fn tar_bundle(files: &[(&str, &str)]) -> anyhow::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_ustar();
        header.set_size(data.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, data.as_bytes())?;
    }
    Ok(builder.into_inner()?)
}
