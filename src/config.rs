use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use serde::Deserialize;

use crate::pipeline::PipelineSettings;
use crate::project::{ProjectConfig, ProjectId};
use crate::vars::{Vars, render_template};

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_daemon_timeout() -> u64 {
    30
}

fn default_build_timeout() -> u64 {
    1800
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Templating error in {0:?}: {1}")]
    Template(PathBuf, minijinja::Error),
    #[error("project id {0} is configured more than once")]
    DuplicateProject(ProjectId),
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestroConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Checkouts live under `<data_dir>/projects/<id>`.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Seconds allowed for a single container daemon call.
    #[serde(default = "default_daemon_timeout")]
    pub daemon_timeout: u64,
    /// Seconds allowed for an image build.
    #[serde(default = "default_build_timeout")]
    pub build_timeout: u64,
    #[serde(default, rename = "project")]
    pub projects: Vec<ProjectConfig>,
}

impl OrchestroConfig {
    fn try_init_from_string(config: &str, path: &Path, vars: &Vars) -> Result<Self, ConfigError> {
        let rendered =
            render_template(config, vars).map_err(|e| ConfigError::Template(path.into(), e))?;
        let config: Self = toml::from_str(&rendered)?;

        let mut seen = HashSet::new();
        for project in &config.projects {
            if !seen.insert(project.id) {
                return Err(ConfigError::DuplicateProject(project.id));
            }
        }
        Ok(config)
    }

    /// Reads the config file and renders it with the vars files found next
    /// to it.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = tokio::fs::read_to_string(path).await?;
        let vars = Vars::load_for(path);
        Self::try_init_from_string(&config, path, &vars)
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            data_dir: self.data_dir.clone(),
            daemon_timeout: Duration::from_secs(self.daemon_timeout),
            build_timeout: Duration::from_secs(self.build_timeout),
        }
    }
}

/// Configured projects by id. Shared between the HTTP handlers and the
/// reload handler.
#[derive(Debug, Clone, Default)]
pub struct ProjectRegistry {
    inner: Arc<RwLock<HashMap<ProjectId, ProjectConfig>>>,
}

impl ProjectRegistry {
    pub fn new(projects: Vec<ProjectConfig>) -> Self {
        let registry = Self::default();
        registry.replace(projects);
        registry
    }

    pub fn get(&self, id: ProjectId) -> Option<ProjectConfig> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.get(&id).cloned()
    }

    /// All projects ordered by id.
    pub fn list(&self) -> Vec<ProjectConfig> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        let mut projects: Vec<_> = inner.values().cloned().collect();
        projects.sort_by_key(|p| p.id);
        projects
    }

    pub fn replace(&self, projects: Vec<ProjectConfig>) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *inner = projects.into_iter().map(|p| (p.id, p)).collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::test_project;

    fn vars(pairs: &[(&str, &str)]) -> Vars {
        let table: String = pairs
            .iter()
            .map(|(k, v)| format!("{k} = \"{v}\"\n"))
            .collect();
        toml::from_str(&table).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config =
            OrchestroConfig::try_init_from_string("", Path::new("orchestro.toml"), &Vars::default())
                .unwrap();
        assert_eq!(config.listen, default_listen());
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert!(config.projects.is_empty());

        let settings = config.pipeline_settings();
        assert_eq!(settings.daemon_timeout, Duration::from_secs(30));
        assert_eq!(settings.build_timeout, Duration::from_secs(1800));
    }

    #[test]
    fn test_projects_with_vars() {
        let input = r#"
            listen = "127.0.0.1:9000"
            data_dir = "/var/lib/orchestro"

            [[project]]
            id = 1
            name = "shop"
            repo_url = "${ shop_repo }"
            build_command = "bun run build"

            [[project.env]]
            key = "STRIPE_KEY"
            value = "${ stripe_key }"

            [[project.volume]]
            host_path = "/srv/shop"
            container_path = "/app/uploads"

            [[project]]
            id = 2
            name = "blog"
            repo_url = "https://example.com/blog.git"
            branch = "release"
            custom_port = 8081
        "#;
        let vars = vars(&[
            ("shop_repo", "https://example.com/shop.git"),
            ("stripe_key", "sk_live"),
        ]);
        let config =
            OrchestroConfig::try_init_from_string(input, Path::new("orchestro.toml"), &vars)
                .unwrap();

        assert_eq!(config.listen.port(), 9000);
        assert_eq!(config.projects.len(), 2);
        let shop = &config.projects[0];
        assert_eq!(shop.repo_url, "https://example.com/shop.git");
        assert_eq!(shop.env_pairs(), vec!["STRIPE_KEY=sk_live".to_string()]);
        assert_eq!(shop.binds(), vec!["/srv/shop:/app/uploads".to_string()]);
        assert_eq!(shop.branch, "main");
        let blog = &config.projects[1];
        assert_eq!(blog.branch, "release");
        assert_eq!(blog.external_port(), Some(8081));
    }

    #[test]
    fn test_missing_var_names_the_file() {
        let err = OrchestroConfig::try_init_from_string(
            "data_dir = \"${ nope }\"",
            Path::new("/etc/orchestro.toml"),
            &Vars::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Template(ref path, _) if path == Path::new("/etc/orchestro.toml")));
    }

    #[test]
    fn test_duplicate_project_ids() {
        let input = r#"
            [[project]]
            id = 1
            name = "a"
            repo_url = "https://example.com/a.git"

            [[project]]
            id = 1
            name = "b"
            repo_url = "https://example.com/b.git"
        "#;
        let err = OrchestroConfig::try_init_from_string(input, Path::new("x.toml"), &Vars::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateProject(1)));
    }

    #[tokio::test]
    async fn test_load_reads_vars_next_to_config() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("orchestro.vars"), "dir = \"/srv/data\"\n").unwrap();
        let path = dir.path().join("orchestro.toml");
        std::fs::write(&path, "data_dir = \"${ dir }\"\n").unwrap();

        let config = OrchestroConfig::load(&path).await.unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/data"));
    }

    #[test]
    fn test_registry_replace() {
        let registry = ProjectRegistry::new(vec![test_project(2), test_project(1)]);
        let ids: Vec<_> = registry.list().iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![1, 2]);

        let shared = registry.clone();
        shared.replace(vec![test_project(3)]);
        assert!(registry.get(1).is_none());
        assert_eq!(registry.get(3).map(|p| p.name), Some("project-3".to_string()));
        assert_eq!(registry.list().len(), 1);
    }
}
