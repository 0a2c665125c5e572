//! Mock definition catalog.
//!
//! The catalog is built once from a directory of YAML files before the
//! listener starts and is read-only afterwards.

use serde_yaml::Value as YamlValue;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Failure while building the catalog. Always fatal at startup.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("mock directory {} does not exist or is not a directory", .path.display())]
    MissingRoot { path: PathBuf },

    #[error("failed to walk mock directory: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not a valid YAML document: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("{} must contain a YAML mapping at the top level", .path.display())]
    NotAMapping { path: PathBuf },

    #[error("{} has no string `path` field", .path.display())]
    MissingPath { path: PathBuf },
}

/// One mock definition: a request path and the raw template text of the
/// file it was loaded from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockDefinition {
    /// Request path this definition answers, e.g. `/users/123`
    pub path: String,
    /// File name relative to the catalog root, `/`-separated
    pub source: String,
    /// Raw, unexpanded file content
    pub template_source: String,
}

impl MockDefinition {
    pub fn new(
        path: impl Into<String>,
        source: impl Into<String>,
        template_source: impl Into<String>,
    ) -> Self {
        Self {
            path: path.into(),
            source: source.into(),
            template_source: template_source.into(),
        }
    }

    /// Definition stored under the conventional file name for its path.
    pub fn at_conventional_source(
        path: impl Into<String>,
        extension: &str,
        template_source: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let source = conventional_source(&path, extension);
        Self::new(path, source, template_source)
    }
}

/// File name, relative to the catalog root, of the template for `path`.
///
/// `/users/123` with extension `yml` maps to `users/123.yml`.
pub fn conventional_source(path: &str, extension: &str) -> String {
    format!("{}.{}", path.trim_start_matches('/'), extension)
}

/// Ordered, immutable set of mock definitions.
#[derive(Debug, Default)]
pub struct Catalog {
    definitions: Vec<MockDefinition>,
    /// Source file name -> index into `definitions`
    sources: HashMap<String, usize>,
}

impl Catalog {
    /// Build a catalog from already-parsed definitions, keeping their order.
    pub fn from_definitions(definitions: Vec<MockDefinition>) -> Self {
        let mut sources = HashMap::with_capacity(definitions.len());
        for (idx, def) in definitions.iter().enumerate() {
            sources.entry(def.source.clone()).or_insert(idx);
        }
        Self {
            definitions,
            sources,
        }
    }

    /// Load every regular file under `root` as a mock definition.
    ///
    /// Entries are visited depth-first, sorted by file name within each
    /// directory. Dotfiles are loaded too: the template for `/` is `.yml`.
    pub fn load(root: &Path) -> Result<Self, LoadError> {
        if !root.is_dir() {
            return Err(LoadError::MissingRoot {
                path: root.to_path_buf(),
            });
        }

        let mut definitions = Vec::new();
        let walker = WalkDir::new(root)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter();

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let definition = load_definition(root, entry.path())?;
            debug!(path = %definition.path, source = %definition.source, "Loaded mock definition");
            definitions.push(definition);
        }

        let catalog = Self::from_definitions(definitions);
        catalog.warn_shadowed();
        info!(
            root = %root.display(),
            definitions = catalog.len(),
            "Mock catalog loaded"
        );
        Ok(catalog)
    }

    /// Definitions in load order.
    pub fn definitions(&self) -> &[MockDefinition] {
        &self.definitions
    }

    /// Raw template text stored under a root-relative file name.
    pub fn template(&self, source: &str) -> Option<&str> {
        self.sources
            .get(source)
            .map(|&idx| self.definitions[idx].template_source.as_str())
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    fn warn_shadowed(&self) {
        let mut first: HashMap<&str, &str> = HashMap::new();
        for def in &self.definitions {
            if let Some(winner) = first.get(def.path.as_str()) {
                warn!(
                    path = %def.path,
                    shadowed = %def.source,
                    winner = %winner,
                    "Duplicate mock path; first loaded definition wins"
                );
            } else {
                first.insert(&def.path, &def.source);
            }
        }
    }
}

fn load_definition(root: &Path, file: &Path) -> Result<MockDefinition, LoadError> {
    let content = std::fs::read_to_string(file).map_err(|source| LoadError::Read {
        path: file.to_path_buf(),
        source,
    })?;

    let document: YamlValue = serde_yaml::from_str(&content).map_err(|source| LoadError::Parse {
        path: file.to_path_buf(),
        source,
    })?;

    let mapping = document.as_mapping().ok_or_else(|| LoadError::NotAMapping {
        path: file.to_path_buf(),
    })?;

    let path = mapping
        .get("path")
        .and_then(YamlValue::as_str)
        .ok_or_else(|| LoadError::MissingPath {
            path: file.to_path_buf(),
        })?;

    Ok(MockDefinition::new(
        path,
        relative_source(root, file),
        content,
    ))
}

fn relative_source(root: &Path, file: &Path) -> String {
    let relative = file.strip_prefix(root).unwrap_or(file);
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
