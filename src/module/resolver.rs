use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::module::diagnostics::{ModuleError, ModuleResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    /// Canonical absolute path.
    pub path: PathBuf,
    /// Table key: the canonical path, lower-cased.
    pub key: String,
    pub original_specifier: String,
    pub is_entry: bool,
}

impl ResolvedModule {
    fn new(path: PathBuf, original_specifier: &str, is_entry: bool) -> Self {
        let key = path.to_string_lossy().to_lowercase();
        Self {
            path,
            key,
            original_specifier: original_specifier.to_string(),
            is_entry,
        }
    }
}

pub struct ModuleResolver {
    extensions: Vec<String>,
}

impl Default for ModuleResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleResolver {
    pub fn new() -> Self {
        Self {
            extensions: vec![".js".to_string(), ".mjs".to_string()],
        }
    }

    /// Extensions tried, in order, for specifiers without one.
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    /// Resolve the entry module relative to the current directory.
    pub fn resolve_entry(&self, specifier: &str) -> ModuleResult<ResolvedModule> {
        let mut resolved = self.resolve(specifier, None)?;
        resolved.is_entry = true;
        Ok(resolved)
    }

    /// Resolve `specifier` as imported by the module at `importer`.
    pub fn resolve(&self, specifier: &str, importer: Option<&Path>) -> ModuleResult<ResolvedModule> {
        if specifier.is_empty() {
            return Err(ModuleError::unsupported_specifier(specifier.to_string()));
        }

        let path = if let Some(rest) = specifier.strip_prefix("file://") {
            file_url_path(rest)
        } else if Path::new(specifier).is_absolute() {
            PathBuf::from(specifier)
        } else if has_url_scheme(specifier) {
            return Err(ModuleError::unsupported_specifier(specifier.to_string()));
        } else {
            let base = match importer.and_then(Path::parent) {
                Some(dir) => dir.to_path_buf(),
                None => env::current_dir().map_err(|e| {
                    ModuleError::io_error(PathBuf::from("."), e.to_string())
                })?,
            };
            base.join(specifier)
        };
        let path = normalize(&path);

        let mut tried_paths = Vec::new();
        for candidate in self.candidates(&path) {
            tried_paths.push(candidate.display().to_string());
            if candidate.is_file() {
                let canonical = fs::canonicalize(&candidate)
                    .map_err(|e| ModuleError::io_error(candidate.clone(), e.to_string()))?;
                return Ok(ResolvedModule::new(canonical, specifier, false));
            }
        }

        Err(ModuleError::not_found(specifier.to_string(), tried_paths))
    }

    fn candidates(&self, path: &Path) -> Vec<PathBuf> {
        let mut out = vec![path.to_path_buf()];
        if path.extension().is_none() {
            for ext in &self.extensions {
                let mut with_ext = path.as_os_str().to_owned();
                with_ext.push(ext);
                out.push(PathBuf::from(with_ext));
            }
            for ext in &self.extensions {
                out.push(path.join(format!("index{}", ext)));
            }
        }
        out
    }
}

/// `file:///C:/x` and `file:///home/x` both name local paths.
fn file_url_path(rest: &str) -> PathBuf {
    let rest = rest.strip_prefix("localhost").unwrap_or(rest);
    let bytes = rest.as_bytes();
    if bytes.len() > 3 && bytes[0] == b'/' && bytes[2] == b':' && bytes[1].is_ascii_alphabetic() {
        PathBuf::from(&rest[1..])
    } else {
        PathBuf::from(rest)
    }
}

fn has_url_scheme(specifier: &str) -> bool {
    match specifier.find(':') {
        // A single letter before ':' is a drive, not a scheme.
        Some(i) if i > 1 => specifier[..i]
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.'),
        _ => false,
    }
}

/// Lexically fold `.` and `..` components.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
