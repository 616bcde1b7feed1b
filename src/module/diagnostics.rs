use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct SourceLocation {
    pub file: PathBuf,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file.display(), self.line, self.column)
    }
}

#[derive(Debug, Clone)]
pub struct DependencyInfo {
    pub path: PathBuf,
    pub specifier: String,
}

impl DependencyInfo {
    pub fn new(path: PathBuf, specifier: String) -> Self {
        Self { path, specifier }
    }
}

#[derive(Debug, Clone)]
pub enum ModuleErrorKind {
    NotFound {
        specifier: String,
        tried_paths: Vec<String>,
    },
    ParseError {
        message: String,
        line: usize,
        column: usize,
    },
    UnsupportedSpec(String),
    IOError {
        path: PathBuf,
        message: String,
    },
    /// The host failed to evaluate the module body, or a dependency failed.
    EvaluationError {
        path: PathBuf,
        message: String,
    },
}

#[derive(Debug, Clone)]
pub struct ModuleError {
    pub kind: ModuleErrorKind,
    pub source_location: Option<SourceLocation>,
    pub dependency_chain: Vec<DependencyInfo>,
    pub suggestion: Option<String>,
}

impl ModuleError {
    pub fn not_found(specifier: String, tried_paths: Vec<String>) -> Self {
        Self {
            kind: ModuleErrorKind::NotFound { specifier, tried_paths },
            source_location: None,
            dependency_chain: Vec::new(),
            suggestion: Some(
                "Check the file path and ensure the file exists with a supported extension (.js, .mjs)"
                    .to_string(),
            ),
        }
    }

    pub fn parse_error(message: String, file: PathBuf, line: usize, column: usize) -> Self {
        Self {
            kind: ModuleErrorKind::ParseError {
                message,
                line,
                column,
            },
            source_location: Some(SourceLocation { file, line, column }),
            dependency_chain: Vec::new(),
            suggestion: None,
        }
    }

    pub fn unsupported_specifier(spec: String) -> Self {
        Self {
            kind: ModuleErrorKind::UnsupportedSpec(spec),
            source_location: None,
            dependency_chain: Vec::new(),
            suggestion: Some(
                "Use a relative path, an absolute path or a file:// URL".to_string(),
            ),
        }
    }

    pub fn io_error(path: PathBuf, message: String) -> Self {
        Self {
            kind: ModuleErrorKind::IOError { path, message },
            source_location: None,
            dependency_chain: Vec::new(),
            suggestion: None,
        }
    }

    pub fn evaluation_error(path: PathBuf, message: String) -> Self {
        Self {
            kind: ModuleErrorKind::EvaluationError { path, message },
            source_location: None,
            dependency_chain: Vec::new(),
            suggestion: None,
        }
    }

    pub fn with_dependency_chain(mut self, chain: Vec<DependencyInfo>) -> Self {
        self.dependency_chain = chain;
        self
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.kind, ModuleErrorKind::NotFound { .. })
    }
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.kind {
            ModuleErrorKind::NotFound {
                specifier,
                tried_paths,
            } => {
                writeln!(f, "Module '{}' not found", specifier)?;
                if !tried_paths.is_empty() {
                    writeln!(f, "\nAttempted paths:")?;
                    for path in tried_paths {
                        writeln!(f, "  - {}", path)?;
                    }
                }
            }
            ModuleErrorKind::ParseError {
                message,
                line,
                column,
            } => {
                if let Some(ref loc) = self.source_location {
                    writeln!(f, "Parse error at {}", loc)?;
                } else {
                    writeln!(f, "Parse error at line {}, column {}", line, column)?;
                }
                writeln!(f, "{}", message)?;
            }
            ModuleErrorKind::UnsupportedSpec(spec) => {
                writeln!(f, "Unsupported module specifier: '{}'", spec)?;
            }
            ModuleErrorKind::IOError { path, message } => {
                writeln!(f, "IO error reading '{}': {}", path.display(), message)?;
            }
            ModuleErrorKind::EvaluationError { path, message } => {
                writeln!(f, "Error evaluating '{}': {}", path.display(), message)?;
            }
        }

        if !self.dependency_chain.is_empty() {
            writeln!(f, "\nDependency chain:")?;
            for (i, dep) in self.dependency_chain.iter().enumerate() {
                writeln!(
                    f,
                    "  {}. {} (imported as '{}')",
                    i + 1,
                    dep.path.display(),
                    dep.specifier
                )?;
            }
        }

        if let Some(ref suggestion) = self.suggestion {
            writeln!(f, "\nSuggestion: {}", suggestion)?;
        }

        Ok(())
    }
}

impl std::error::Error for ModuleError {}

pub type ModuleResult<T> = Result<T, ModuleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_lists_attempts() {
        let err = ModuleError::not_found("./missing".into(), vec!["/a/missing.js".into()])
            .with_dependency_chain(vec![DependencyInfo::new(
                PathBuf::from("/a/main.js"),
                "./missing".into(),
            )]);
        let text = err.to_string();
        assert!(text.contains("Module './missing' not found"));
        assert!(text.contains("  - /a/missing.js"));
        assert!(text.contains("1. /a/main.js (imported as './missing')"));
        assert!(text.contains("Suggestion:"));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_parse_error_location() {
        let err = ModuleError::parse_error("Unexpected token".into(), PathBuf::from("m.js"), 3, 7);
        assert!(err.to_string().starts_with("Parse error at m.js:3:7"));
    }
}
