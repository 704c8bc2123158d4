use std::future::Future;
use std::path::{Path, PathBuf};

use sd_notify::NotifyState;
use signal_hook::{
    consts::{SIGHUP, SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio::sync::oneshot;

use crate::config::{ConfigError, OrchestroConfig, ProjectRegistry};

/// What should we do when the user stops this program?
///
/// The returned future resolves on the first SIGINT or SIGTERM. Deployed
/// containers are left running.
pub fn handle_shutdown() -> std::io::Result<impl Future<Output = ()> + Send + 'static> {
    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let (tx, rx) = oneshot::channel();

    std::thread::spawn(move || {
        if let Some(signal) = signals.forever().next() {
            log::info!("Received signal {signal}, shutting down");
            let _ = sd_notify::notify(true, &[NotifyState::Stopping]);
            let _ = tx.send(());
        }
    });

    Ok(async move {
        let _ = rx.await;
    })
}

/// Re-reads the config file and swaps the project registry. Runs already
/// in flight keep the configuration they started with.
pub async fn reload_projects(
    config_path: &Path,
    registry: &ProjectRegistry,
) -> Result<usize, ConfigError> {
    let config = OrchestroConfig::load(config_path).await?;
    let count = config.projects.len();
    registry.replace(config.projects);
    Ok(count)
}

pub fn handle_reload(
    config_path: PathBuf,
    registry: ProjectRegistry,
    rt_handle: tokio::runtime::Handle,
) -> std::io::Result<()> {
    let mut signals = Signals::new([SIGHUP])?;

    std::thread::spawn(move || {
        for _ in signals.forever() {
            let _ = sd_notify::notify(true, &[NotifyState::Reloading]);
            match rt_handle.block_on(reload_projects(&config_path, &registry)) {
                Ok(count) => log::info!("Reloaded {count} projects from {config_path:?}"),
                // Keep serving the previous registry
                Err(err) => log::error!("Unable to read new config: {err}"),
            }
            let _ = sd_notify::notify(true, &[NotifyState::Ready]);
        }
    });

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::test_project;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reload_replaces_registry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("orchestro.toml");
        std::fs::write(
            &path,
            r#"
            [[project]]
            id = 5
            name = "docs"
            repo_url = "https://example.com/docs.git"
            "#,
        )
        .unwrap();

        let registry = ProjectRegistry::new(vec![test_project(1)]);
        assert_eq!(reload_projects(&path, &registry).await.unwrap(), 1);
        assert!(registry.get(1).is_none());
        assert_eq!(registry.get(5).map(|p| p.name), Some("docs".to_string()));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_registry() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("orchestro.toml");
        std::fs::write(&path, "[[project]]\nid = \"not a number\"\n").unwrap();

        let registry = ProjectRegistry::new(vec![test_project(1)]);
        assert!(reload_projects(&path, &registry).await.is_err());
        assert!(registry.get(1).is_some());
    }
}
