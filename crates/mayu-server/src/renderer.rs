//! Install configuration rendering
//!
//! Documents are MiniJinja templates. Every file in the snippets directory
//! is registered under its file name, so templates can pull them in with
//! `{% include "<name>" %}`. Ignition templates are written as YAML and
//! handed out as compact JSON.

use base64::Engine;
use mayu_common::{Host, Network};
use minijinja::{AutoEscape, Environment};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("cannot read template {path}: {source}")]
    TemplateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template error: {0}")]
    Template(#[from] minijinja::Error),

    #[error("cannot walk files directory: {0}")]
    Files(#[from] walkdir::Error),

    #[error("rendered document is not valid YAML: {0}")]
    Convert(#[from] serde_yaml::Error),

    #[error("cannot encode document as JSON: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// The documents handed to installing machines
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Ignition,
    CloudConfig,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Ignition => f.write_str("ignition"),
            DocumentKind::CloudConfig => f.write_str("cloud"),
        }
    }
}

/// Values available to install configuration templates
#[derive(Debug, Clone, Serialize)]
pub struct RenderContext {
    pub host: Host,
    pub etcd_discovery_url: String,
    pub cluster_network: Network,
    pub mayu_host: String,
    pub mayu_port: u16,
    pub mayu_url: String,
    pub post_boot_url: String,
    pub no_tls: bool,
    /// `templates_env` with the host's overrides merged over it
    pub templates_env: BTreeMap<String, serde_json::Value>,
    /// `<dir>/<file>` to the base64 of the rendered file
    pub files: BTreeMap<String, String>,
}

/// Values available to the first-stage installer script
#[derive(Debug, Clone, Serialize)]
pub struct FirstStageContext {
    pub host_info_helper_url: String,
    pub cloud_config_url: String,
    pub install_image_url: String,
    pub set_installed_url: String,
    pub mayu_url: String,
    pub mayu_version: String,
    pub machine_id: String,
}

/// Turns a host's context into the document a machine installs from
pub trait Renderer: Send + Sync {
    fn render(&self, kind: DocumentKind, ctx: &RenderContext) -> Result<String>;

    fn render_first_stage(&self, ctx: &FirstStageContext) -> Result<String>;
}

/// Template snippets, read once at startup
#[derive(Debug, Clone, Default)]
pub struct SnippetCache {
    snippets: Vec<(String, String)>,
}

impl SnippetCache {
    /// Load every regular file in `dir`. A missing directory has no snippets.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            debug!(dir = %dir.display(), "no template snippets directory");
            return Ok(Self::default());
        }

        let mut snippets = Vec::new();
        for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let source = std::fs::read_to_string(entry.path()).map_err(|source| {
                RenderError::TemplateRead {
                    path: entry.path().to_path_buf(),
                    source,
                }
            })?;
            snippets.push((entry.file_name().to_string_lossy().into_owned(), source));
        }
        debug!(dir = %dir.display(), count = snippets.len(), "loaded template snippets");
        Ok(Self { snippets })
    }

    pub fn insert(&mut self, name: impl Into<String>, source: impl Into<String>) {
        self.snippets.push((name.into(), source.into()));
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.snippets.iter().map(|(name, _)| name.as_str())
    }

    fn environment(&self) -> Result<Environment<'_>> {
        let mut env = Environment::new();
        env.set_keep_trailing_newline(true);
        env.set_auto_escape_callback(|_| AutoEscape::None);
        for (name, source) in &self.snippets {
            env.add_template(name, source)?;
        }
        Ok(env)
    }
}

/// Renders templates read from disk on every request, so edits apply
/// without a restart
pub struct TemplateRenderer {
    ignition: PathBuf,
    cloud_config: PathBuf,
    first_stage: PathBuf,
    files_dir: PathBuf,
    snippets: SnippetCache,
}

impl TemplateRenderer {
    pub fn new(
        ignition: impl Into<PathBuf>,
        cloud_config: impl Into<PathBuf>,
        first_stage: impl Into<PathBuf>,
        files_dir: impl Into<PathBuf>,
        snippets: SnippetCache,
    ) -> Self {
        Self {
            ignition: ignition.into(),
            cloud_config: cloud_config.into(),
            first_stage: first_stage.into(),
            files_dir: files_dir.into(),
            snippets,
        }
    }

    fn render_file<S: Serialize>(&self, path: &Path, ctx: S) -> Result<String> {
        let source = std::fs::read_to_string(path).map_err(|source| RenderError::TemplateRead {
            path: path.to_path_buf(),
            source,
        })?;
        let env = self.snippets.environment()?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(env.render_named_str(&name, &source, ctx)?)
    }

    /// Render every `<files_dir>/<dir>/<file>` with `ctx`, base64 encoded
    fn render_files(&self, ctx: &RenderContext) -> Result<BTreeMap<String, String>> {
        let mut files = BTreeMap::new();
        if !self.files_dir.is_dir() {
            warn!(dir = %self.files_dir.display(), "files directory missing, rendering without files");
            return Ok(files);
        }

        for entry in WalkDir::new(&self.files_dir)
            .min_depth(2)
            .max_depth(2)
            .sort_by_file_name()
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&self.files_dir) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let rendered = self.render_file(entry.path(), ctx)?;
            files.insert(key, base64::engine::general_purpose::STANDARD.encode(rendered));
        }
        Ok(files)
    }
}

impl Renderer for TemplateRenderer {
    fn render(&self, kind: DocumentKind, ctx: &RenderContext) -> Result<String> {
        match kind {
            DocumentKind::Ignition => {
                let mut ctx = ctx.clone();
                ctx.files = self.render_files(&ctx)?;
                let yaml = self.render_file(&self.ignition, &ctx)?;
                yaml_to_json(&yaml)
            }
            DocumentKind::CloudConfig => self.render_file(&self.cloud_config, ctx),
        }
    }

    fn render_first_stage(&self, ctx: &FirstStageContext) -> Result<String> {
        self.render_file(&self.first_stage, ctx)
    }
}

/// Re-encode a YAML document as compact JSON
pub fn yaml_to_json(yaml: &str) -> Result<String> {
    let value: serde_json::Value = serde_yaml::from_str(yaml)?;
    Ok(serde_json::to_string(&value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn context() -> RenderContext {
        let mut host = Host::new("abc123");
        host.assign_internal_addr(Ipv4Addr::new(10, 0, 1, 5));
        let mut templates_env = BTreeMap::new();
        templates_env.insert("cluster_name".to_string(), serde_json::json!("lab"));
        RenderContext {
            host,
            etcd_discovery_url: "http://10.0.1.254:4080/etcd/tok".to_string(),
            cluster_network: Network::default(),
            mayu_host: "10.0.1.254".to_string(),
            mayu_port: 4080,
            mayu_url: "http://10.0.1.254:4080".to_string(),
            post_boot_url: "http://10.0.1.254:4080/admin/host/abc123/boot_complete".to_string(),
            no_tls: true,
            templates_env,
            files: BTreeMap::new(),
        }
    }

    fn write(path: &Path, content: &str) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_yaml_to_json() {
        let json = yaml_to_json("ignition:\n  version: 2.2.0\nstorage:\n  files: []\n").unwrap();
        assert_eq!(json, r#"{"ignition":{"version":"2.2.0"},"storage":{"files":[]}}"#);
        assert!(yaml_to_json("a: [unclosed").is_err());
    }

    #[test]
    fn test_render_ignition_with_snippets_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        write(
            &root.join("ignition.yaml"),
            "ignition:\n  version: 2.2.0\n\
             passwd:\n  hostname: {{ host.Hostname }}\n\
             {% include \"units.yaml\" %}\
             storage:\n  motd: {{ files[\"conf/motd\"] }}\n",
        );
        write(
            &root.join("snippets/units.yaml"),
            "systemd:\n  cluster: {{ templates_env.cluster_name }}\n",
        );
        write(&root.join("files/conf/motd"), "welcome to {{ host.Serial }}");

        let renderer = TemplateRenderer::new(
            root.join("ignition.yaml"),
            root.join("cloud.yaml"),
            root.join("first_stage.sh"),
            root.join("files"),
            SnippetCache::load(root.join("snippets")).unwrap(),
        );
        let json = renderer.render(DocumentKind::Ignition, &context()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["passwd"]["hostname"], "10-0-1-5");
        assert_eq!(value["systemd"]["cluster"], "lab");
        let motd = base64::engine::general_purpose::STANDARD
            .decode(value["storage"]["motd"].as_str().unwrap())
            .unwrap();
        assert_eq!(motd, b"welcome to abc123");
    }

    #[test]
    fn test_render_cloud_config_is_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("cloud.yaml"),
            "#cloud-config\nhostname: {{ host.Hostname }}\n",
        );
        let renderer = TemplateRenderer::new(
            dir.path().join("ignition.yaml"),
            dir.path().join("cloud.yaml"),
            dir.path().join("first_stage.sh"),
            dir.path().join("files"),
            SnippetCache::default(),
        );
        let doc = renderer.render(DocumentKind::CloudConfig, &context()).unwrap();
        assert_eq!(doc, "#cloud-config\nhostname: 10-0-1-5\n");
    }

    #[test]
    fn test_missing_template() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = TemplateRenderer::new(
            dir.path().join("missing.yaml"),
            dir.path().join("missing.yaml"),
            dir.path().join("missing.sh"),
            dir.path().join("files"),
            SnippetCache::default(),
        );
        let err = renderer.render(DocumentKind::Ignition, &context()).unwrap_err();
        assert!(matches!(err, RenderError::TemplateRead { .. }));
    }

    #[test]
    fn test_snippets_missing_dir() {
        let cache = SnippetCache::load("/nonexistent/snippets").unwrap();
        assert_eq!(cache.names().count(), 0);
    }
}
