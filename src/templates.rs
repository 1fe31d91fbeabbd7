use crate::error::ResourceError;
use crate::resource_cache::{EagerCache, TreeLoader};
use handlebars::Handlebars;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub const TEMPLATE_FILE: &str = "contact.html";
const TEMPLATE_NAME: &str = "contact";

/// Values every contact page template can use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TemplateData {
    pub success: bool,
    pub error: String,
}

impl TemplateData {
    pub fn form() -> Self {
        Self::default()
    }

    pub fn success() -> Self {
        Self {
            success: true,
            error: String::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: message.into(),
        }
    }
}

/// A compiled `<domain>/contact.html`.
pub struct TenantTemplate {
    path: String,
    registry: Handlebars<'static>,
}

impl TenantTemplate {
    pub fn compile(path: &str, source: &str) -> Result<Self, handlebars::TemplateError> {
        let mut registry = Handlebars::new();
        registry.register_template_string(TEMPLATE_NAME, source)?;
        Ok(Self {
            path: path.to_string(),
            registry,
        })
    }

    /// Relative path inside the template tree.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn render(&self, data: &TemplateData) -> Result<String, handlebars::RenderError> {
        self.registry.render(TEMPLATE_NAME, data)
    }
}

impl std::fmt::Debug for TenantTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TenantTemplate")
            .field("path", &self.path)
            .finish()
    }
}

/// Walks `<root>/<domain>/contact.html`. Anything else in the tree is ignored.
#[derive(Debug, Clone)]
pub struct TemplateTreeLoader {
    root: PathBuf,
}

impl TemplateTreeLoader {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

impl TreeLoader for TemplateTreeLoader {
    type Resource = TenantTemplate;

    fn load_tree(&self) -> Result<HashMap<String, TenantTemplate>, ResourceError> {
        let mut templates = HashMap::new();
        for entry in std::fs::read_dir(&self.root).map_err(|e| io_error(&self.root, e))? {
            let entry = entry.map_err(|e| io_error(&self.root, e))?;
            if !entry.path().is_dir() {
                continue;
            }

            let domain = entry.file_name().to_string_lossy().to_lowercase();
            let file = entry.path().join(TEMPLATE_FILE);
            if !file.is_file() {
                continue;
            }

            let source = std::fs::read_to_string(&file).map_err(|e| io_error(&file, e))?;
            let relative = format!("{domain}/{TEMPLATE_FILE}");
            let template =
                TenantTemplate::compile(&relative, &source).map_err(|e| ResourceError::Malformed {
                    path: file.clone(),
                    reason: e.to_string(),
                })?;

            log::debug!("Loaded template {relative}");
            templates.insert(domain, template);
        }

        Ok(templates)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ResourceError {
    ResourceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Whole-tree template index, rebuilt on any change.
pub type TemplateCache = EagerCache<TemplateTreeLoader>;
