use minijinja::Environment;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use crate::config::ConfigError;

/// Key/value pairs available to the config file as `${ name }`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Vars {
    inner: HashMap<String, String>,
}

impl<'de> Deserialize<'de> for Vars {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let inner = HashMap::deserialize(deserializer)?;
        Ok(Self { inner })
    }
}

impl Serialize for Vars {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.inner.serialize(serializer)
    }
}

/// Files that match orchestro.vars | *.orchestro.vars
/// Sorted
fn list_vars_files(search_dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = std::fs::read_dir(search_dir) {
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(file_name) = path.file_name().and_then(|s| s.to_str()) {
                if file_name == "orchestro.vars" || file_name.ends_with(".orchestro.vars") {
                    files.push(path);
                }
            }
        }
    }

    files.sort();
    files
}

/// Directory holding the config file. A bare file name means the
/// current directory.
fn config_dir(config_path: &Path) -> &Path {
    match config_path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

impl Vars {
    fn try_init_from_string(val: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(val)?)
    }

    /// Later sets override earlier ones.
    fn combine(vars: Vec<Self>) -> Self {
        let mut inner = HashMap::new();
        for var_set in vars {
            inner.extend(var_set.inner);
        }
        Self { inner }
    }

    /// Reads every vars file next to `config_path`. Files that cannot be
    /// read or parsed are logged and skipped.
    pub fn load_for(config_path: &Path) -> Self {
        let mut vars = Vec::new();
        for vars_file in list_vars_files(config_dir(config_path)) {
            match std::fs::read_to_string(&vars_file) {
                Ok(content) => match Self::try_init_from_string(&content) {
                    Ok(this_vars) => vars.push(this_vars),
                    Err(e) => log::error!("Error parsing vars file {vars_file:?}: {e}"),
                },
                Err(e) => log::error!("Error reading vars file {vars_file:?}: {e}"),
            }
        }
        Self::combine(vars)
    }
}

/// Renders `${ name }` placeholders. Unknown names are an error.
pub fn render_template(template_str: &str, vars: &Vars) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();

    let syntax = minijinja::syntax::SyntaxConfig::builder()
        .variable_delimiters("${", "}")
        .build()?;

    env.set_syntax(syntax);
    env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);

    let template = env.template_from_str(template_str)?;
    template.render(vars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_vars_parsing() {
        let input = r#"
            var1 = "value1"
            var2 = "value2"
        "#;
        let vars = Vars::try_init_from_string(input).expect("Failed to parse vars");
        assert_eq!(vars.inner.get("var1").map(String::as_str), Some("value1"));
        assert_eq!(vars.inner.get("var2").map(String::as_str), Some("value2"));
    }

    #[test]
    fn test_template_rendering() {
        let mut inner = HashMap::new();
        inner.insert("token".to_string(), "s3cr3t".to_string());
        inner.insert("repo".to_string(), "https://example.com/app.git".to_string());
        let vars = Vars { inner };

        let template = "repo_url = \"${ repo }\"\nvalue = \"${ token }\"";
        let rendered = render_template(template, &vars).expect("Failed to render");

        assert!(rendered.contains("repo_url = \"https://example.com/app.git\""));
        assert!(rendered.contains("value = \"s3cr3t\""));
    }

    #[test]
    fn test_undefined_variable_is_an_error() {
        assert!(render_template("value = \"${ missing }\"", &Vars::default()).is_err());
    }

    #[test]
    fn test_vars_files_are_merged_in_order() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("orchestro.vars"), "a = \"base\"\nb = \"base\"\n").unwrap();
        std::fs::write(dir.path().join("prod.orchestro.vars"), "b = \"prod\"\n").unwrap();
        std::fs::write(dir.path().join("other.vars"), "a = \"ignored\"\n").unwrap();
        std::fs::write(dir.path().join("broken.orchestro.vars"), "not toml").unwrap();

        let vars = Vars::load_for(&dir.path().join("orchestro.toml"));
        assert_eq!(vars.inner.get("a").map(String::as_str), Some("base"));
        // "prod.orchestro.vars" sorts after "orchestro.vars"
        assert_eq!(vars.inner.get("b").map(String::as_str), Some("prod"));
        assert_eq!(vars.inner.len(), 2);
    }

    #[test]
    fn test_bare_config_name_searches_current_dir() {
        assert_eq!(config_dir(Path::new("orchestro.toml")), Path::new("."));
        assert_eq!(config_dir(Path::new("/etc/orchestro/orchestro.toml")), Path::new("/etc/orchestro"));
    }
}
