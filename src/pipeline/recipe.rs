//! Build recipe (Dockerfile) resolution and synthesis.

use std::path::Path;

use minijinja::{Environment, context};

use crate::project::ProjectConfig;

pub const RECIPE_FILE: &str = "Dockerfile";
pub const DEFAULT_INSTALL_COMMAND: &str = "bun install";
pub const DEFAULT_START_COMMAND: &str = "bun run start";

const TEMPLATE: &str = r#"
# Build Stage
FROM oven/bun:latest AS builder
WORKDIR /app
{% for key in env_keys %}ARG {{ key }}
ENV {{ key }}=${{ key }}
{% endfor %}COPY package.json {{ lockfile }} ./
RUN {{ install_command }}
COPY . .
{% if build_command %}RUN {{ build_command }}
{% endif %}
# Production Stage
FROM oven/bun:latest
WORKDIR /app
COPY --from=builder /app ./
EXPOSE {{ internal_port }}
CMD ["sh", "-c", {{ start_command }}]
"#;

#[derive(Debug, thiserror::Error)]
pub enum RecipeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Templating error: {0}")]
    Template(#[from] minijinja::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What happened to the recipe in the build context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipeSource {
    /// The project's own recipe file is used as is.
    Existing,
    /// The project's configured recipe text was written.
    Custom,
    /// A recipe was generated from the project's commands.
    Synthesized,
}

/// Lockfile glob matching the project's naming convention.
pub fn lockfile_pattern(work_dir: &Path) -> &'static str {
    if work_dir.join("bun.lock").exists() {
        "bun.lock*"
    } else {
        "bun.lockb*"
    }
}

pub fn synthesize(project: &ProjectConfig, work_dir: &Path) -> Result<String, RecipeError> {
    let env = Environment::new();
    let template = env.template_from_str(TEMPLATE)?;

    let env_keys: Vec<&str> = project.env.iter().map(|e| e.key.as_str()).collect();
    let start_command =
        serde_json::to_string(project.start_command().unwrap_or(DEFAULT_START_COMMAND))?;

    Ok(template.render(context! {
        env_keys,
        lockfile => lockfile_pattern(work_dir),
        install_command => project.install_command().unwrap_or(DEFAULT_INSTALL_COMMAND),
        build_command => project.build_command(),
        internal_port => project.internal_port(),
        start_command,
    })?)
}

/// Makes sure `work_dir` holds the recipe to build from.
///
/// A configured install or build command forces regeneration even when the
/// repository ships its own recipe.
pub async fn prepare(project: &ProjectConfig, work_dir: &Path) -> Result<RecipeSource, RecipeError> {
    let path = work_dir.join(RECIPE_FILE);

    if let Some(custom) = project.custom_recipe() {
        tokio::fs::write(&path, custom).await?;
        return Ok(RecipeSource::Custom);
    }

    let forced = project.install_command().is_some() || project.build_command().is_some();
    if !forced && tokio::fs::try_exists(&path).await? {
        return Ok(RecipeSource::Existing);
    }

    let content = synthesize(project, work_dir)?;
    tokio::fs::write(&path, content).await?;
    Ok(RecipeSource::Synthesized)
}
