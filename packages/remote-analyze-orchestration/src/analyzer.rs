//! Default analyzer: run an external checker on the extracted part

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, Result};
use crate::worker::{Analyzer, PartContext};

/// Captured checker output, kept next to its results
pub const ANALYZER_LOG: &str = "analyzer.log";

/// Runs `<program> <args..> -b "<build command> <source file>" -o <output dir>`
///
/// The checker's exit status is logged, not enforced: checkers commonly exit
/// non-zero when they report findings. Failing to start it or exceeding the
/// timeout fails the part.
#[derive(Debug, Clone)]
pub struct CommandAnalyzer {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl Default for CommandAnalyzer {
    fn default() -> Self {
        Self::new("CodeChecker", vec!["check".to_string()], Duration::from_secs(3600))
    }
}

impl CommandAnalyzer {
    pub fn new(program: impl Into<String>, args: Vec<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args,
            timeout,
        }
    }

    /// Full argument list for one part
    pub fn command_args(&self, ctx: &PartContext) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("-b".to_string());
        args.push(format!(
            "{} {}",
            ctx.metadata.build_command,
            ctx.source_file.display()
        ));
        args.push("-o".to_string());
        args.push(ctx.output_dir.display().to_string());
        args
    }
}

#[async_trait]
impl Analyzer for CommandAnalyzer {
    async fn analyze(&self, ctx: &PartContext) -> Result<()> {
        let args = self.command_args(ctx);
        debug!("Running {} {:?} for job {} part {}", self.program, args, ctx.job_id, ctx.part);

        let mut command = Command::new(&self.program);
        command
            .args(&args)
            .current_dir(&ctx.sources_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(self.timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(OrchestratorError::AnalyzerFailed(format!(
                    "could not run {}: {}",
                    self.program, e
                )))
            }
            Err(_) => {
                return Err(OrchestratorError::AnalyzerFailed(format!(
                    "{} timed out after {:?}",
                    self.program, self.timeout
                )))
            }
        };

        if !output.status.success() {
            warn!(
                "{} exited with {} for job {} part {}",
                self.program, output.status, ctx.job_id, ctx.part
            );
        }

        let mut log = Vec::with_capacity(output.stdout.len() + output.stderr.len() + 64);
        log.extend_from_slice(format!("exit status: {}\n--- stdout ---\n", output.status).as_bytes());
        log.extend_from_slice(&output.stdout);
        log.extend_from_slice(b"\n--- stderr ---\n");
        log.extend_from_slice(&output.stderr);
        tokio::fs::create_dir_all(&ctx.output_dir).await?;
        tokio::fs::write(ctx.output_dir.join(ANALYZER_LOG), log).await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::BundleMetadata;
    use remote_analyze_storage::JobId;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> PartContext {
        PartContext {
            job_id: JobId::generate(),
            part: 1,
            slot: 0,
            sources_dir: dir.path().to_path_buf(),
            output_dir: dir.path().join("output"),
            source_file: PathBuf::from("/w/part_1/sources-root/src/main.c"),
            metadata: BundleMetadata {
                build_command: "gcc -c -Iinc".to_string(),
                file_path: "/src/main.c".to_string(),
                cached_files: Default::default(),
            },
        }
    }

    #[test]
    fn test_command_args() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);
        let args = CommandAnalyzer::default().command_args(&ctx);

        assert_eq!(args[0], "check");
        assert_eq!(args[1], "-b");
        assert_eq!(args[2], "gcc -c -Iinc /w/part_1/sources-root/src/main.c");
        assert_eq!(args[3], "-o");
        assert_eq!(PathBuf::from(&args[4]), dir.path().join("output"));
    }

    #[tokio::test]
    async fn test_missing_program_fails_permanently() {
        let dir = TempDir::new().unwrap();
        let analyzer = CommandAnalyzer::new(
            "definitely-not-a-checker-binary",
            vec![],
            Duration::from_secs(5),
        );

        let err = analyzer.analyze(&context(&dir)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::AnalyzerFailed(_)));
        assert!(!err.category().is_retryable());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_is_logged() {
        let dir = TempDir::new().unwrap();
        let analyzer = CommandAnalyzer::new("echo", vec!["checked".to_string()], Duration::from_secs(5));
        let ctx = context(&dir);

        analyzer.analyze(&ctx).await.unwrap();
        let log = std::fs::read_to_string(ctx.output_dir.join(ANALYZER_LOG)).unwrap();
        assert!(log.contains("checked -b gcc -c -Iinc"));
    }
}
