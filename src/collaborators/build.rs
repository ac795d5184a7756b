// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 deployflow contributors

//! Shell build runner
//!
//! Materializes the source artifact into a work directory and runs the
//! build commands there in a single shell session.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{BuildOutput, BuildRequest, BuildRunner, SOURCE_VERSION};
use crate::errors::{DeployflowError, DeployflowResult};

/// Runs builds as local shell scripts
pub struct ShellBuildRunner {
    work_root: PathBuf,
}

impl ShellBuildRunner {
    /// Create a runner using `work_root` for build directories
    pub fn new(work_root: PathBuf) -> Self {
        Self { work_root }
    }

    /// Runner under `<state_dir>/work`
    pub fn in_state_dir(state_dir: &Path) -> Self {
        Self::new(state_dir.join("work"))
    }

    /// Work directory and exports file of a build
    fn paths(&self, request: &BuildRequest) -> (PathBuf, PathBuf) {
        let run_dir = self.work_root.join(&request.run_id);
        (
            run_dir.join(&request.action),
            run_dir.join(format!("{}.exports", request.action)),
        )
    }

    /// Quote a string for a POSIX shell
    fn shell_quote(value: &str) -> String {
        format!("'{}'", value.replace('\'', "'\\''"))
    }

    /// The build commands, with an exit trap that writes every exported
    /// variable that is set to `exports` as NUL-terminated `name=value`
    /// records. The trap also runs when a command calls `exit`.
    fn script(request: &BuildRequest, exports: &Path) -> String {
        let target = Self::shell_quote(&exports.to_string_lossy());

        let mut script = String::from("__deployflow_exports() {\n");
        script.push_str(&format!("  : > {target}\n"));
        for var in &request.exported_variables {
            script.push_str(&format!(
                "  if [ -n \"${{{var}+x}}\" ]; then printf '%s=%s\\0' '{var}' \"${{{var}}}\" >> {target}; fi\n"
            ));
        }
        script.push_str("}\ntrap __deployflow_exports EXIT\nset -e\n");

        for command in &request.commands {
            script.push_str(command);
            script.push('\n');
        }
        script
    }

    /// Parse the records written by the exit trap.
    ///
    /// A missing file means the trap never ran (e.g. the build replaced it),
    /// which fails the build rather than guessing at values.
    async fn read_exports(
        path: &Path,
        request: &BuildRequest,
    ) -> DeployflowResult<BTreeMap<String, String>> {
        let failed = |reason: String, help: &str| DeployflowError::BuildFailed {
            action: request.action.clone(),
            reason,
            help: Some(help.to_string()),
        };

        let content = match tokio::fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(failed(
                    "exported variables were not recorded".into(),
                    "Do not replace the EXIT trap in build commands",
                ));
            }
            Err(e) => {
                return Err(DeployflowError::FileReadError {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                })
            }
        };

        let mut exports = BTreeMap::new();
        for record in content.split(|b| *b == 0).filter(|r| !r.is_empty()) {
            let record = std::str::from_utf8(record).map_err(|_| {
                failed(
                    "an exported variable is not valid UTF-8".into(),
                    "Exported values must be text",
                )
            })?;
            let Some((name, value)) = record.split_once('=') else {
                continue;
            };
            if !request.exported_variables.iter().any(|v| v == name) {
                continue;
            }
            if value.contains('\n') || value.contains('\r') {
                return Err(failed(
                    format!("exported variable '{}' spans several lines", name),
                    "Exported values must be a single line",
                ));
            }
            exports.insert(name.to_string(), value.to_string());
        }

        Ok(exports)
    }

    async fn materialize(dir: &Path, request: &BuildRequest) -> DeployflowResult<()> {
        if dir.exists() {
            tokio::fs::remove_dir_all(dir).await?;
        }
        tokio::fs::create_dir_all(dir).await?;

        for (relative, content) in &request.source.files {
            let path = dir.join(relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content)
                .await
                .map_err(|e| DeployflowError::FileWriteError {
                    path: path.clone(),
                    error: e.to_string(),
                })?;
        }
        Ok(())
    }

    fn collect_artifacts(
        dir: &Path,
        request: &BuildRequest,
    ) -> DeployflowResult<BTreeMap<String, Vec<u8>>> {
        let mut files = BTreeMap::new();

        for pattern in &request.artifacts {
            let full_pattern = dir.join(pattern).to_string_lossy().to_string();
            let matches: Vec<PathBuf> = glob::glob(&full_pattern)?
                .filter_map(Result::ok)
                .filter(|p| p.is_file())
                .collect();

            if matches.is_empty() {
                return Err(DeployflowError::BuildFailed {
                    action: request.action.clone(),
                    reason: format!("artifact pattern '{}' matched no files", pattern),
                    help: Some("Check the build's artifacts list".into()),
                });
            }

            for path in matches {
                let Ok(relative) = path.strip_prefix(dir) else {
                    continue;
                };
                let key = relative.to_string_lossy().replace('\\', "/");
                let content = std::fs::read(&path).map_err(|e| DeployflowError::FileReadError {
                    path: path.clone(),
                    error: e.to_string(),
                })?;
                files.insert(key, content);
            }
        }

        Ok(files)
    }

    async fn run_build(
        &self,
        dir: &Path,
        exports_path: &Path,
        request: &BuildRequest,
    ) -> DeployflowResult<BuildOutput> {
        Self::materialize(dir, request).await?;
        if exports_path.exists() {
            tokio::fs::remove_file(exports_path).await?;
        }

        let start = Instant::now();

        let mut cmd = Command::new(&request.shell);
        cmd.arg("-c").arg(Self::script(request, exports_path));
        cmd.current_dir(dir);
        cmd.envs(&request.env);
        cmd.env("SOURCE_VERSION", request.source_version());
        if let Some(uri) = &request.repository_uri {
            cmd.env("REPOSITORY_URI", uri);
        }
        if let Some(runtime) = &request.runtime {
            cmd.env("BUILD_RUNTIME", runtime);
        }

        let output = cmd.output().await.map_err(|e| DeployflowError::BuildFailed {
            action: request.action.clone(),
            reason: e.to_string(),
            help: Some(format!("Shell '{}' may not be available", request.shell)),
        })?;

        let duration = start.elapsed();
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            return Err(DeployflowError::build_failed(&request.action, &stderr, exit_code));
        }

        let exports = Self::read_exports(exports_path, request).await?;
        let files = Self::collect_artifacts(dir, request)?;

        debug!(
            action = %request.action,
            source = request.source.metadata(SOURCE_VERSION).unwrap_or("unknown"),
            exports = exports.len(),
            duration_ms = duration.as_millis() as u64,
            "Build finished"
        );

        Ok(BuildOutput {
            exports,
            files,
            stdout,
            duration,
        })
    }
}

#[async_trait]
impl BuildRunner for ShellBuildRunner {
    async fn build(&self, request: &BuildRequest) -> DeployflowResult<BuildOutput> {
        which::which(&request.shell).map_err(|_| DeployflowError::tool_not_found(&request.shell))?;

        let (dir, exports_path) = self.paths(request);
        let result = self.run_build(&dir, &exports_path, request).await;

        // Work files are dropped whether or not the build succeeded
        if dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                warn!(action = %request.action, error = %e, "Could not clean build directory");
            }
        }
        if exports_path.exists() {
            if let Err(e) = tokio::fs::remove_file(&exports_path).await {
                warn!(action = %request.action, error = %e, "Could not remove exports file");
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ArtifactPayload;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn request(commands: &[&str], exported: &[&str], artifacts: &[&str]) -> BuildRequest {
        BuildRequest {
            run_id: "run-1".into(),
            action: "app-build".into(),
            source: ArtifactPayload::new()
                .with_file("src/app.txt", b"hello".to_vec())
                .with_metadata(SOURCE_VERSION, "abc123"),
            commands: commands.iter().map(|c| c.to_string()).collect(),
            shell: "bash".into(),
            runtime: Some("amazonlinux2".into()),
            env: HashMap::new(),
            exported_variables: exported.iter().map(|c| c.to_string()).collect(),
            artifacts: artifacts.iter().map(|c| c.to_string()).collect(),
            repository_uri: Some("registry.local/user-repository".into()),
        }
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(ShellBuildRunner::shell_quote("a b"), "'a b'");
        assert_eq!(ShellBuildRunner::shell_quote("it's"), "'it'\\''s'");
    }

    #[tokio::test]
    async fn test_build_exports_variables() {
        let temp = TempDir::new().unwrap();
        let runner = ShellBuildRunner::new(temp.path().to_path_buf());

        let output = runner
            .build(&request(
                &[
                    "cat src/app.txt",
                    "export imageTag=$SOURCE_VERSION",
                    "echo $REPOSITORY_URI > uri.txt",
                ],
                &["imageTag", "neverSet"],
                &["uri.txt"],
            ))
            .await
            .unwrap();

        assert!(output.stdout.contains("hello"));
        assert_eq!(output.exports.get("imageTag").map(String::as_str), Some("abc123"));
        assert!(!output.exports.contains_key("neverSet"));
        assert_eq!(
            output.files.get("uri.txt").map(Vec::as_slice),
            Some(&b"registry.local/user-repository\n"[..])
        );
    }

    #[tokio::test]
    async fn test_failing_command() {
        let temp = TempDir::new().unwrap();
        let runner = ShellBuildRunner::new(temp.path().to_path_buf());

        let result = runner
            .build(&request(&["echo broken >&2", "exit 3", "echo unreachable"], &[], &[]))
            .await;

        match result {
            Err(DeployflowError::BuildFailed { reason, .. }) => {
                assert!(reason.contains("3"));
                assert!(reason.contains("broken"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let temp = TempDir::new().unwrap();
        let runner = ShellBuildRunner::new(temp.path().to_path_buf());

        let result = runner.build(&request(&["true"], &[], &["out/*.jar"])).await;
        assert!(matches!(result, Err(DeployflowError::BuildFailed { .. })));
    }

    #[tokio::test]
    async fn test_missing_shell() {
        let temp = TempDir::new().unwrap();
        let runner = ShellBuildRunner::new(temp.path().to_path_buf());

        let mut req = request(&["true"], &[], &[]);
        req.shell = "definitely-not-a-shell-xyz".into();
        assert!(matches!(
            runner.build(&req).await,
            Err(DeployflowError::ToolNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_stdout_cannot_export_variables() {
        let temp = TempDir::new().unwrap();
        let runner = ShellBuildRunner::new(temp.path().to_path_buf());

        let output = runner
            .build(&request(
                &["echo 'imageTag=forged'", "printf 'imageTag=forged\\0'"],
                &["imageTag"],
                &[],
            ))
            .await
            .unwrap();

        assert!(output.stdout.contains("imageTag=forged"));
        assert!(!output.exports.contains_key("imageTag"));
    }

    #[tokio::test]
    async fn test_exports_survive_explicit_exit() {
        let temp = TempDir::new().unwrap();
        let runner = ShellBuildRunner::new(temp.path().to_path_buf());

        let output = runner
            .build(&request(
                &["export imageTag=good", "exit 0", "export imageTag=unreachable"],
                &["imageTag"],
                &[],
            ))
            .await
            .unwrap();

        assert_eq!(output.exports.get("imageTag").map(String::as_str), Some("good"));
    }

    #[tokio::test]
    async fn test_multiline_export_fails_build() {
        let temp = TempDir::new().unwrap();
        let runner = ShellBuildRunner::new(temp.path().to_path_buf());

        let result = runner
            .build(&request(&["export imageTag=$'abc\\n123'"], &["imageTag"], &[]))
            .await;

        match result {
            Err(DeployflowError::BuildFailed { reason, .. }) => {
                assert!(reason.contains("imageTag"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_replaced_exit_trap_fails_build() {
        let temp = TempDir::new().unwrap();
        let runner = ShellBuildRunner::new(temp.path().to_path_buf());

        let result = runner
            .build(&request(&["trap - EXIT", "export imageTag=abc"], &["imageTag"], &[]))
            .await;

        assert!(matches!(result, Err(DeployflowError::BuildFailed { .. })));
    }

    #[tokio::test]
    async fn test_work_files_removed_after_failure() {
        let temp = TempDir::new().unwrap();
        let runner = ShellBuildRunner::new(temp.path().to_path_buf());

        let failed = runner.build(&request(&["exit 1"], &["imageTag"], &[])).await;
        assert!(failed.is_err());
        let missing = runner.build(&request(&["true"], &[], &["out/*.jar"])).await;
        assert!(missing.is_err());

        let run_dir = temp.path().join("run-1");
        assert!(!run_dir.join("app-build").exists());
        assert!(!run_dir.join("app-build.exports").exists());
    }
}
