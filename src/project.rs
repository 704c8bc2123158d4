use serde::{Deserialize, Serialize};

/// Projects are keyed by a small numeric id. The default external port
/// and the image tag are both derived from it.
pub type ProjectId = u64;

/// Base of the default external port range (`3000 + project id`).
pub const DEFAULT_PORT_BASE: u64 = 3000;

/// Port the synthesized recipe exposes when none is configured.
pub const DEFAULT_INTERNAL_PORT: u16 = 80;

fn default_branch() -> String {
    "main".to_string()
}

fn default_internal_port() -> u16 {
    DEFAULT_INTERNAL_PORT
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    pub id: ProjectId,
    pub name: String,
    pub repo_url: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Subdirectory of the checkout used as build context.
    #[serde(default)]
    pub root_directory: Option<String>,
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub start_command: Option<String>,
    #[serde(default = "default_internal_port")]
    pub internal_port: u16,
    /// Fixed host port. When unset the port is derived from the id.
    #[serde(default)]
    pub custom_port: Option<u16>,
    /// Recipe text written verbatim instead of synthesizing one.
    #[serde(default)]
    pub custom_recipe: Option<String>,
    #[serde(default, rename = "env")]
    pub env: Vec<EnvEntry>,
    #[serde(default, rename = "volume")]
    pub volumes: Vec<VolumeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EnvEntry {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeEntry {
    pub host_path: String,
    pub container_path: String,
}

impl VolumeEntry {
    /// `host:container` bind as understood by the daemon.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host_path, self.container_path)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

impl ProjectConfig {
    pub fn image_tag(&self) -> String {
        format!("orchestro-p{}", self.id)
    }

    pub fn container_name(&self, deployment_id: u64) -> String {
        format!("orchestro-c{}-{}", self.id, deployment_id)
    }

    /// Host port the container is published on. `None` when the derived
    /// default does not fit in a port number.
    pub fn external_port(&self) -> Option<u16> {
        match self.custom_port {
            Some(port) if port != 0 => Some(port),
            _ => u16::try_from(DEFAULT_PORT_BASE + self.id).ok(),
        }
    }

    pub fn internal_port(&self) -> u16 {
        if self.internal_port == 0 {
            DEFAULT_INTERNAL_PORT
        } else {
            self.internal_port
        }
    }

    pub fn install_command(&self) -> Option<&str> {
        non_empty(&self.install_command)
    }

    pub fn build_command(&self) -> Option<&str> {
        non_empty(&self.build_command)
    }

    pub fn start_command(&self) -> Option<&str> {
        non_empty(&self.start_command)
    }

    /// Recipe text exactly as configured, unless it is blank.
    pub fn custom_recipe(&self) -> Option<&str> {
        self.custom_recipe
            .as_deref()
            .filter(|recipe| !recipe.trim().is_empty())
    }

    pub fn root_directory(&self) -> Option<&str> {
        non_empty(&self.root_directory)
    }

    /// `KEY=value` pairs for the container environment.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|e| format!("{}={}", e.key, e.value))
            .collect()
    }

    pub fn binds(&self) -> Vec<String> {
        self.volumes.iter().map(VolumeEntry::bind).collect()
    }
}

#[cfg(test)]
pub(crate) fn test_project(id: ProjectId) -> ProjectConfig {
    ProjectConfig {
        id,
        name: format!("project-{id}"),
        repo_url: "https://example.com/repo.git".to_string(),
        branch: default_branch(),
        root_directory: None,
        install_command: None,
        build_command: None,
        start_command: None,
        internal_port: DEFAULT_INTERNAL_PORT,
        custom_port: None,
        custom_recipe: None,
        env: Vec::new(),
        volumes: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_port_is_derived_from_id() {
        let project = test_project(7);
        assert_eq!(project.external_port(), Some(3007));
    }

    #[test]
    fn test_custom_port_wins() {
        let mut project = test_project(7);
        project.custom_port = Some(8080);
        assert_eq!(project.external_port(), Some(8080));

        // Zero means "not configured"
        project.custom_port = Some(0);
        assert_eq!(project.external_port(), Some(3007));
    }

    #[test]
    fn test_derived_port_out_of_range() {
        let project = test_project(70_000);
        assert_eq!(project.external_port(), None);
    }

    #[test]
    fn test_blank_commands_are_unset() {
        let mut project = test_project(1);
        project.install_command = Some("   ".to_string());
        project.build_command = Some("bun run build".to_string());
        assert_eq!(project.install_command(), None);
        assert_eq!(project.build_command(), Some("bun run build"));
    }

    #[test]
    fn test_custom_recipe_is_kept_verbatim() {
        let mut project = test_project(1);
        project.custom_recipe = Some("\n".to_string());
        assert_eq!(project.custom_recipe(), None);

        project.custom_recipe = Some("FROM caddy\nCOPY . /srv\n".to_string());
        assert_eq!(project.custom_recipe(), Some("FROM caddy\nCOPY . /srv\n"));
    }

    #[test]
    fn test_names_and_binds() {
        let mut project = test_project(4);
        project.volumes.push(VolumeEntry {
            host_path: "/srv/data".to_string(),
            container_path: "/app/data".to_string(),
        });
        project.env.push(EnvEntry {
            key: "API_KEY".to_string(),
            value: "secret".to_string(),
        });
        assert_eq!(project.image_tag(), "orchestro-p4");
        assert_eq!(project.container_name(9), "orchestro-c4-9");
        assert_eq!(project.binds(), vec!["/srv/data:/app/data".to_string()]);
        assert_eq!(project.env_pairs(), vec!["API_KEY=secret".to_string()]);
    }

    #[test]
    fn test_parse_project_toml() {
        let input = r#"
            id = 3
            name = "blog"
            repo_url = "https://example.com/blog.git"

            [[env]]
            key = "TOKEN"
            value = "abc"

            [[volume]]
            host_path = "/srv/blog"
            container_path = "/app/data"
        "#;
        let project: ProjectConfig = toml::from_str(input).expect("Failed to parse project");
        assert_eq!(project.branch, "main");
        assert_eq!(project.internal_port(), 80);
        assert_eq!(project.env.len(), 1);
        assert_eq!(project.volumes.len(), 1);
    }
}
