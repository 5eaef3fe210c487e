//! Content-addressed compile cache.
//!
//! Artifacts are keyed by a SHA-256 digest over the language, the compile
//! command line, and the source bytes, so a hit can only ever resurface
//! output of an identical compile. The directory may be shared by several
//! workers on a host without locking: identical keys produce identical
//! artifacts, and the hit predicate requires the layout's marker file, so
//! a partial write is just a miss.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sentinel_common::registry::LanguageDescriptor;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// How a language family lays out its compiled artifacts.
enum ArtifactLayout {
    /// A single executable named `program`.
    Binary,
    /// A tree of class files; `Main.class` marks a complete entry.
    ClassTree,
    /// Transpiler output under `dist/`; `dist/main.js` marks completeness.
    Transpiled,
}

fn layout_for(language: &str) -> Option<ArtifactLayout> {
    match language {
        "c" | "cpp" | "rust" | "go" => Some(ArtifactLayout::Binary),
        "java" | "kotlin" => Some(ArtifactLayout::ClassTree),
        "typescript" => Some(ArtifactLayout::Transpiled),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct CompileCache {
    root: PathBuf,
}

impl Default for CompileCache {
    fn default() -> Self {
        Self::new()
    }
}

impl CompileCache {
    pub fn new() -> Self {
        Self::at(default_root())
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Cache key for a compile of `source` under this descriptor; `None`
    /// for languages without a compile stage.
    pub fn key(descriptor: &LanguageDescriptor, source: &str) -> Option<String> {
        let compile = descriptor.compile.as_ref()?;
        let mut hasher = Sha256::new();
        hasher.update(descriptor.name.as_bytes());
        hasher.update(b"\n");
        hasher.update(compile.command.as_bytes());
        hasher.update(b" ");
        hasher.update(compile.args.join(" ").as_bytes());
        hasher.update(b"\n");
        hasher.update(source.as_bytes());
        Some(hex::encode(hasher.finalize()))
    }

    fn entry_dir(&self, language: &str, key: &str) -> PathBuf {
        self.root.join(language).join(key)
    }

    /// Copy cached artifacts into the workspace. Returns `false` on any
    /// miss, including languages with no cacheable layout; the caller
    /// falls through to a recompile.
    pub fn restore(&self, descriptor: &LanguageDescriptor, key: &str, workspace: &Path) -> bool {
        let Some(layout) = layout_for(&descriptor.name) else {
            return false;
        };
        let entry = self.entry_dir(&descriptor.name, key);
        let restored = match layout {
            ArtifactLayout::Binary => {
                entry.join("program").exists()
                    && fs::copy(entry.join("program"), workspace.join("program")).is_ok()
            }
            ArtifactLayout::ClassTree => {
                entry.join("Main.class").exists() && copy_tree(&entry, workspace).is_ok()
            }
            ArtifactLayout::Transpiled => {
                entry.join("dist").join("main.js").exists()
                    && copy_tree(&entry.join("dist"), &workspace.join("dist")).is_ok()
            }
        };
        if restored {
            debug!(language = %descriptor.name, key, "compile cache hit");
        }
        restored
    }

    /// Publish the workspace's compiled artifacts. Best-effort: a failed
    /// write only costs the next job a recompile.
    pub fn publish(&self, descriptor: &LanguageDescriptor, key: &str, workspace: &Path) {
        let Some(layout) = layout_for(&descriptor.name) else {
            return;
        };
        let entry = self.entry_dir(&descriptor.name, key);
        let published = fs::create_dir_all(&entry).and_then(|_| match layout {
            ArtifactLayout::Binary => {
                fs::copy(workspace.join("program"), entry.join("program")).map(|_| ())
            }
            ArtifactLayout::ClassTree => {
                for item in fs::read_dir(workspace)? {
                    let item = item?;
                    if item.path().extension().is_some_and(|ext| ext == "class") {
                        fs::copy(item.path(), entry.join(item.file_name()))?;
                    }
                }
                Ok(())
            }
            ArtifactLayout::Transpiled => copy_tree(&workspace.join("dist"), &entry.join("dist")),
        });
        match published {
            Ok(()) => debug!(language = %descriptor.name, key, "published compile artifacts"),
            Err(e) => {
                warn!(language = %descriptor.name, key, error = %e, "compile cache publish failed")
            }
        }
    }
}

fn default_root() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\temp\sentinel-cache")
    } else {
        PathBuf::from("/tmp/sentinel-cache")
    }
}

fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sentinel_common::registry::CompileSpec;
    use tempfile::TempDir;

    fn compiled_descriptor(name: &str) -> LanguageDescriptor {
        LanguageDescriptor {
            name: name.to_string(),
            display_name: name.to_uppercase(),
            extension: ".x".to_string(),
            filename: None,
            command: "{dir}/program".to_string(),
            args: vec![],
            timeout: 5000,
            compile: Some(CompileSpec {
                command: "fakecc".to_string(),
                args: vec!["-o".to_string(), "{dir}/program".to_string()],
                timeout: 10_000,
            }),
        }
    }

    fn interpreted_descriptor() -> LanguageDescriptor {
        LanguageDescriptor {
            name: "python".to_string(),
            display_name: "Python 3".to_string(),
            extension: ".py".to_string(),
            filename: None,
            command: "python3".to_string(),
            args: vec!["{file}".to_string()],
            timeout: 5000,
            compile: None,
        }
    }

    #[test]
    fn key_is_deterministic() {
        let descriptor = compiled_descriptor("cpp");
        let a = CompileCache::key(&descriptor, "int main() {}").unwrap();
        let b = CompileCache::key(&descriptor, "int main() {}").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn key_changes_with_source_and_compile_config() {
        let descriptor = compiled_descriptor("cpp");
        let base = CompileCache::key(&descriptor, "int main() {}").unwrap();
        assert_ne!(base, CompileCache::key(&descriptor, "int main() { }").unwrap());

        let mut tweaked = compiled_descriptor("cpp");
        tweaked.compile.as_mut().unwrap().args.push("-O2".to_string());
        assert_ne!(base, CompileCache::key(&tweaked, "int main() {}").unwrap());
    }

    #[test]
    fn interpreted_languages_have_no_key() {
        assert!(CompileCache::key(&interpreted_descriptor(), "print(1)").is_none());
    }

    #[test]
    fn binary_artifacts_round_trip() {
        let cache_dir = TempDir::new().unwrap();
        let cache = CompileCache::at(cache_dir.path());
        let descriptor = compiled_descriptor("cpp");
        let key = CompileCache::key(&descriptor, "int main() {}").unwrap();

        let producer = TempDir::new().unwrap();
        fs::write(producer.path().join("program"), b"\x7fELF fake binary").unwrap();
        cache.publish(&descriptor, &key, producer.path());

        let consumer = TempDir::new().unwrap();
        assert!(cache.restore(&descriptor, &key, consumer.path()));
        assert_eq!(
            fs::read(consumer.path().join("program")).unwrap(),
            b"\x7fELF fake binary"
        );
    }

    #[test]
    fn miss_when_entry_absent() {
        let cache_dir = TempDir::new().unwrap();
        let cache = CompileCache::at(cache_dir.path());
        let descriptor = compiled_descriptor("cpp");
        let workspace = TempDir::new().unwrap();
        assert!(!cache.restore(&descriptor, "0".repeat(64).as_str(), workspace.path()));
    }

    #[test]
    fn class_tree_requires_main_class_marker() {
        let cache_dir = TempDir::new().unwrap();
        let cache = CompileCache::at(cache_dir.path());
        let descriptor = compiled_descriptor("java");
        let key = CompileCache::key(&descriptor, "class Main {}").unwrap();

        let producer = TempDir::new().unwrap();
        fs::write(producer.path().join("Helper.class"), b"cafebabe").unwrap();
        cache.publish(&descriptor, &key, producer.path());

        // No Main.class was produced, so the entry is not a hit.
        let consumer = TempDir::new().unwrap();
        assert!(!cache.restore(&descriptor, &key, consumer.path()));

        fs::write(producer.path().join("Main.class"), b"cafebabe").unwrap();
        cache.publish(&descriptor, &key, producer.path());
        assert!(cache.restore(&descriptor, &key, consumer.path()));
        assert!(consumer.path().join("Helper.class").exists());
        assert!(consumer.path().join("Main.class").exists());
    }

    #[test]
    fn transpiled_dist_tree_round_trips() {
        let cache_dir = TempDir::new().unwrap();
        let cache = CompileCache::at(cache_dir.path());
        let descriptor = compiled_descriptor("typescript");
        let key = CompileCache::key(&descriptor, "console.log(1)").unwrap();

        let producer = TempDir::new().unwrap();
        fs::create_dir_all(producer.path().join("dist/lib")).unwrap();
        fs::write(producer.path().join("dist/main.js"), b"console.log(1)").unwrap();
        fs::write(producer.path().join("dist/lib/util.js"), b"export {}").unwrap();
        cache.publish(&descriptor, &key, producer.path());

        let consumer = TempDir::new().unwrap();
        assert!(cache.restore(&descriptor, &key, consumer.path()));
        assert!(consumer.path().join("dist/main.js").exists());
        assert!(consumer.path().join("dist/lib/util.js").exists());
    }

    #[test]
    fn unknown_families_are_never_cached() {
        let cache_dir = TempDir::new().unwrap();
        let cache = CompileCache::at(cache_dir.path());
        let descriptor = compiled_descriptor("haskell");
        let key = CompileCache::key(&descriptor, "main = print 1").unwrap();

        let producer = TempDir::new().unwrap();
        fs::write(producer.path().join("program"), b"binary").unwrap();
        cache.publish(&descriptor, &key, producer.path());

        let consumer = TempDir::new().unwrap();
        assert!(!cache.restore(&descriptor, &key, consumer.path()));
    }
}
