//! The per-language executor.
//!
//! **Contract:** given a descriptor, source text, optional stdin, and
//! optional test cases, produce an `ExecutionResult`. The executor never
//! returns an error across this boundary - every operational failure
//! (compile error, timeout, output cap, spawn failure) becomes a
//! structured result field, and per-case failures in test-case mode land
//! on that case while the remaining cases still run.
//!
//! **Guarantees:**
//! 1. The workspace directory is destroyed on every exit path.
//! 2. Every child process is terminated before a call returns.
//! 3. Captured stdout and stderr never exceed 1 MiB each.
//! 4. Wall-clock per run is bounded by the descriptor's timeouts.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sentinel_common::registry::LanguageDescriptor;
use sentinel_common::types::{ExecutionResult, RunStatus, TestCase, TestCaseResult};
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::cache::CompileCache;
use crate::process;

/// Workspace directory exclusively owned by one job. The drop guard
/// removes it whatever path the executor takes out.
struct Workspace {
    dir: PathBuf,
}

impl Workspace {
    fn create() -> std::io::Result<Self> {
        let dir = workspace_root().join(Uuid::new_v4().to_string());
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path(&self) -> &Path {
        &self.dir
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "workspace cleanup failed");
        }
    }
}

fn workspace_root() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\temp\code-execution")
    } else {
        PathBuf::from("/tmp/code-execution")
    }
}

/// Expand `{file}`, `{dir}` and `{filename}` in one template string.
fn substitute(template: &str, file: &Path, dir: &Path, filename: &str) -> String {
    template
        .replace("{file}", &file.to_string_lossy())
        .replace("{dir}", &dir.to_string_lossy())
        .replace("{filename}", filename)
}

fn build_argv(
    command: &str,
    args: &[String],
    file: &Path,
    dir: &Path,
    filename: &str,
) -> (String, Vec<String>) {
    let program = substitute(command, file, dir, filename);
    let argv = args
        .iter()
        .map(|arg| substitute(arg, file, dir, filename))
        .collect();
    (program, argv)
}

fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Execute one job. See the module docs for the contract.
pub async fn run(
    descriptor: &LanguageDescriptor,
    code: &str,
    stdin: &str,
    test_cases: Option<&[TestCase]>,
    cache: &CompileCache,
) -> ExecutionResult {
    let started = Instant::now();
    let workspace = match Workspace::create() {
        Ok(workspace) => workspace,
        Err(e) => {
            error!(language = %descriptor.name, error = %e, "failed to allocate workspace");
            return ExecutionResult::failure(format!("Failed to allocate workspace: {e}"), 0);
        }
    };
    // The workspace guard drops here on every path out of execute().
    execute(descriptor, code, stdin, test_cases, cache, &workspace, started).await
}

async fn execute(
    descriptor: &LanguageDescriptor,
    code: &str,
    stdin: &str,
    test_cases: Option<&[TestCase]>,
    cache: &CompileCache,
    workspace: &Workspace,
    started: Instant,
) -> ExecutionResult {
    let filename = descriptor.source_file_name();
    let source_path = workspace.path().join(&filename);
    if let Err(e) = tokio::fs::write(&source_path, code).await {
        return ExecutionResult::failure(
            format!("Failed to write source file: {e}"),
            elapsed_ms(started),
        );
    }

    if let Some(compile) = &descriptor.compile {
        let key = CompileCache::key(descriptor, code);
        let cached = key
            .as_deref()
            .is_some_and(|k| cache.restore(descriptor, k, workspace.path()));
        if !cached {
            let (program, argv) = build_argv(
                &compile.command,
                &compile.args,
                &source_path,
                workspace.path(),
                &filename,
            );
            debug!(language = %descriptor.name, program, "compiling");
            match process::run(
                &program,
                &argv,
                workspace.path(),
                "",
                Duration::from_millis(compile.timeout),
            )
            .await
            {
                Ok(out) if out.exit_code != 0 => {
                    let detail = if out.stderr.is_empty() {
                        out.stdout
                    } else {
                        out.stderr
                    };
                    return ExecutionResult::failure(
                        format!("Compilation failed: {detail}"),
                        elapsed_ms(started),
                    );
                }
                Ok(_) => {
                    if let Some(k) = key.as_deref() {
                        cache.publish(descriptor, k, workspace.path());
                    }
                }
                Err(e) => {
                    return ExecutionResult::failure(
                        format!("Compilation failed: {e}"),
                        elapsed_ms(started),
                    );
                }
            }
        }
    }

    let (program, argv) = build_argv(
        &descriptor.command,
        &descriptor.args,
        &source_path,
        workspace.path(),
        &filename,
    );
    let run_timeout = Duration::from_millis(descriptor.timeout);

    match test_cases {
        None => {
            match process::run(&program, &argv, workspace.path(), stdin, run_timeout).await {
                Ok(out) => ExecutionResult {
                    output: out.stdout,
                    error: out.stderr,
                    execution_time: elapsed_ms(started),
                    status: RunStatus::Success,
                    test_cases: None,
                },
                Err(e) => ExecutionResult::failure(e.to_string(), elapsed_ms(started)),
            }
        }
        Some(cases) => {
            let mut results = Vec::with_capacity(cases.len());
            for case in cases {
                let case_started = Instant::now();
                let outcome =
                    process::run(&program, &argv, workspace.path(), &case.input, run_timeout).await;
                let execution_time = elapsed_ms(case_started);
                results.push(match outcome {
                    Ok(out) => {
                        // The process layer trims stdout; the expected
                        // value is trimmed here so the comparison and the
                        // echoed actualOutput agree.
                        let passed = out.stdout == case.expected.trim();
                        TestCaseResult {
                            input: case.input.clone(),
                            expected: case.expected.clone(),
                            actual_output: out.stdout,
                            passed,
                            error: None,
                            execution_time,
                        }
                    }
                    Err(e) => TestCaseResult {
                        input: case.input.clone(),
                        expected: case.expected.clone(),
                        actual_output: String::new(),
                        passed: false,
                        error: Some(e.to_string()),
                        execution_time,
                    },
                });
            }
            ExecutionResult {
                output: String::new(),
                error: String::new(),
                execution_time: elapsed_ms(started),
                status: RunStatus::Success,
                test_cases: Some(results),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitution_expands_every_token() {
        let file = Path::new("/tmp/ws/main.cpp");
        let dir = Path::new("/tmp/ws");
        let expanded = substitute("{dir}/program < {file} ({filename})", file, dir, "main.cpp");
        assert_eq!(expanded, "/tmp/ws/program < /tmp/ws/main.cpp (main.cpp)");
    }

    #[test]
    fn argv_substitution_covers_command_and_args() {
        let file = Path::new("/tmp/ws/main.cpp");
        let dir = Path::new("/tmp/ws");
        let (program, argv) = build_argv(
            "g++",
            &[
                "-O2".to_string(),
                "-o".to_string(),
                "{dir}/program".to_string(),
                "{file}".to_string(),
            ],
            file,
            dir,
            "main.cpp",
        );
        assert_eq!(program, "g++");
        assert_eq!(argv, vec!["-O2", "-o", "/tmp/ws/program", "/tmp/ws/main.cpp"]);
    }

    #[test]
    fn tokenless_args_pass_through_unchanged() {
        let (program, argv) = build_argv(
            "python3",
            &["-u".to_string()],
            Path::new("/tmp/ws/main.py"),
            Path::new("/tmp/ws"),
            "main.py",
        );
        assert_eq!(program, "python3");
        assert_eq!(argv, vec!["-u"]);
    }

    #[test]
    fn workspace_is_removed_on_drop() {
        let workspace = Workspace::create().unwrap();
        let path = workspace.path().to_path_buf();
        std::fs::write(path.join("main.py"), "print(1)").unwrap();
        assert!(path.exists());
        drop(workspace);
        assert!(!path.exists());
    }

    #[test]
    fn workspaces_are_unique() {
        let a = Workspace::create().unwrap();
        let b = Workspace::create().unwrap();
        assert_ne!(a.path(), b.path());
    }
}
