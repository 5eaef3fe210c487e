use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read language config directory {dir}: {source}")]
    UnreadableDir {
        dir: String,
        #[source]
        source: std::io::Error,
    },
    #[error("no valid language descriptors found in {0}")]
    Empty(String),
}

/// Optional compile stage for a language. The same substitution tokens as
/// the run stage apply: `{file}`, `{dir}`, `{filename}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Compile-phase wall-clock cap in milliseconds.
    #[serde(default = "default_compile_timeout")]
    pub timeout: u64,
}

fn default_compile_timeout() -> u64 {
    10_000
}

/// Immutable configuration for one language: how to name, optionally
/// compile, and run user source.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguageDescriptor {
    pub name: String,
    pub display_name: String,
    /// Dot-prefixed, e.g. `.py`.
    pub extension: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub command: String,
    pub args: Vec<String>,
    /// Run-phase wall-clock cap in milliseconds.
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compile: Option<CompileSpec>,
}

impl LanguageDescriptor {
    /// Name of the source file written into the workspace.
    pub fn source_file_name(&self) -> String {
        self.filename
            .clone()
            .unwrap_or_else(|| format!("main{}", self.extension))
    }

    fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("missing name".into());
        }
        if self.name.to_lowercase() != self.name {
            return Err(format!("name '{}' must be lowercase", self.name));
        }
        if self.display_name.is_empty() {
            return Err("missing displayName".into());
        }
        if !self.extension.starts_with('.') {
            return Err(format!("extension '{}' must be dot-prefixed", self.extension));
        }
        if self.command.is_empty() {
            return Err("missing command".into());
        }
        if self.timeout == 0 {
            return Err("timeout must be positive".into());
        }
        if let Some(compile) = &self.compile {
            if compile.command.is_empty() {
                return Err("compile.command must not be empty".into());
            }
        }
        Ok(())
    }
}

/// Registry of language descriptors loaded once at startup. Descriptor
/// files that fail to parse or validate are skipped with a logged error so
/// one bad file cannot take the service down. Reload means process restart.
#[derive(Debug, Clone)]
pub struct LanguageRegistry {
    languages: HashMap<String, LanguageDescriptor>,
}

impl LanguageRegistry {
    /// Load every `*.json` descriptor in `dir`, one language per file.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir).map_err(|source| RegistryError::UnreadableDir {
            dir: dir.display().to_string(),
            source,
        })?;

        let mut languages: HashMap<String, LanguageDescriptor> = HashMap::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let descriptor = match fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| {
                    serde_json::from_str::<LanguageDescriptor>(&content).map_err(|e| e.to_string())
                }) {
                Ok(descriptor) => descriptor,
                Err(e) => {
                    error!(file = %path.display(), error = %e, "skipping unreadable language descriptor");
                    continue;
                }
            };
            if let Err(reason) = descriptor.validate() {
                error!(file = %path.display(), reason, "skipping invalid language descriptor");
                continue;
            }
            if languages.contains_key(&descriptor.name) {
                warn!(
                    file = %path.display(),
                    language = %descriptor.name,
                    "skipping duplicate language descriptor"
                );
                continue;
            }
            languages.insert(descriptor.name.clone(), descriptor);
        }

        if languages.is_empty() {
            return Err(RegistryError::Empty(dir.display().to_string()));
        }
        info!(count = languages.len(), "loaded language descriptors");
        Ok(Self { languages })
    }

    pub fn get(&self, name: &str) -> Option<&LanguageDescriptor> {
        self.languages.get(name)
    }

    pub fn is_supported(&self, name: &str) -> bool {
        self.languages.contains_key(name)
    }

    /// All descriptors, sorted by name for stable listings.
    pub fn list(&self) -> Vec<&LanguageDescriptor> {
        let mut all: Vec<_> = self.languages.values().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn names(&self) -> Vec<&str> {
        self.list().into_iter().map(|d| d.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_descriptor(dir: &Path, file: &str, json: &str) {
        fs::write(dir.join(file), json).unwrap();
    }

    const PYTHON: &str = r#"{
        "name": "python",
        "displayName": "Python 3",
        "extension": ".py",
        "command": "python3",
        "args": ["{file}"],
        "timeout": 5000
    }"#;

    const CPP: &str = r#"{
        "name": "cpp",
        "displayName": "C++ (GCC)",
        "extension": ".cpp",
        "command": "{dir}/program",
        "args": [],
        "timeout": 5000,
        "compile": {
            "command": "g++",
            "args": ["-O2", "-o", "{dir}/program", "{file}"],
            "timeout": 15000
        }
    }"#;

    #[test]
    fn loads_valid_descriptors() {
        let tmp = TempDir::new().unwrap();
        write_descriptor(tmp.path(), "python.json", PYTHON);
        write_descriptor(tmp.path(), "cpp.json", CPP);

        let registry = LanguageRegistry::load(tmp.path()).unwrap();
        assert!(registry.is_supported("python"));
        assert!(registry.is_supported("cpp"));
        assert!(!registry.is_supported("brainfuck"));

        let cpp = registry.get("cpp").unwrap();
        assert!(cpp.compile.is_some());
        assert_eq!(cpp.compile.as_ref().unwrap().timeout, 15000);
        assert_eq!(cpp.source_file_name(), "main.cpp");
    }

    #[test]
    fn list_is_sorted_by_name() {
        let tmp = TempDir::new().unwrap();
        write_descriptor(tmp.path(), "python.json", PYTHON);
        write_descriptor(tmp.path(), "cpp.json", CPP);

        let registry = LanguageRegistry::load(tmp.path()).unwrap();
        assert_eq!(registry.names(), vec!["cpp", "python"]);
    }

    #[test]
    fn invalid_descriptor_is_skipped_not_fatal() {
        let tmp = TempDir::new().unwrap();
        write_descriptor(tmp.path(), "python.json", PYTHON);
        write_descriptor(tmp.path(), "broken.json", "{ not json");
        write_descriptor(
            tmp.path(),
            "nodot.json",
            r#"{
                "name": "nodot",
                "displayName": "No Dot",
                "extension": "txt",
                "command": "cat",
                "args": [],
                "timeout": 1000
            }"#,
        );

        let registry = LanguageRegistry::load(tmp.path()).unwrap();
        assert!(registry.is_supported("python"));
        assert!(!registry.is_supported("nodot"));
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn missing_required_field_is_skipped() {
        let tmp = TempDir::new().unwrap();
        write_descriptor(tmp.path(), "python.json", PYTHON);
        // No command.
        write_descriptor(
            tmp.path(),
            "partial.json",
            r#"{"name": "partial", "displayName": "Partial", "extension": ".p", "timeout": 1000}"#,
        );

        let registry = LanguageRegistry::load(tmp.path()).unwrap();
        assert!(!registry.is_supported("partial"));
    }

    #[test]
    fn empty_directory_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            LanguageRegistry::load(tmp.path()),
            Err(RegistryError::Empty(_))
        ));
    }

    #[test]
    fn missing_directory_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope");
        assert!(matches!(
            LanguageRegistry::load(&missing),
            Err(RegistryError::UnreadableDir { .. })
        ));
    }

    #[test]
    fn explicit_filename_overrides_default() {
        let descriptor: LanguageDescriptor = serde_json::from_str(
            r#"{
                "name": "java",
                "displayName": "Java",
                "extension": ".java",
                "filename": "Main.java",
                "command": "java",
                "args": ["-cp", "{dir}", "Main"],
                "timeout": 8000
            }"#,
        )
        .unwrap();
        assert_eq!(descriptor.source_file_name(), "Main.java");
    }
}
