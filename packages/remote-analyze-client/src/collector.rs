//! Dependency collection for a compilation unit

use std::path::PathBuf;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::compile_db::CompileUnit;
use crate::error::{ClientError, ClientResult};

/// Lists the files a translation unit depends on
pub trait DependencyCollector: Send + Sync {
    /// Absolute paths of the unit's sources and headers
    fn collect(&self, unit: &CompileUnit) -> ClientResult<Vec<PathBuf>>;
}

/// Runs an external collector, `<program> <args..> -b "<compile command>"`,
/// and reads one path per output line
#[derive(Debug, Clone)]
pub struct CommandCollector {
    program: String,
    args: Vec<String>,
}

impl Default for CommandCollector {
    fn default() -> Self {
        Self::new("tu_collector", Vec::new())
    }
}

impl CommandCollector {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl DependencyCollector for CommandCollector {
    fn collect(&self, unit: &CompileUnit) -> ClientResult<Vec<PathBuf>> {
        let command = unit.full_command();
        debug!("Collecting dependencies of {}", unit.source().display());

        let output = Command::new(&self.program)
            .args(&self.args)
            .arg("-b")
            .arg(&command)
            .current_dir(unit.directory())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| ClientError::collector(&command, format!("cannot run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ClientError::collector(
                &command,
                format!("{} exited with {}: {}", self.program, output.status, stderr.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                let path = PathBuf::from(line);
                if path.is_absolute() {
                    path
                } else {
                    unit.directory().join(path)
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_missing_collector_program() {
        let collector = CommandCollector::new("definitely-not-a-collector", vec![]);
        let unit = CompileUnit::from_command_line("gcc -c a.c", Path::new("/")).unwrap();

        let err = collector.collect(&unit).unwrap_err();
        assert!(matches!(err, ClientError::CollectorFailure { ref command, .. } if command == "gcc -c a.c"));
    }

    #[cfg(unix)]
    #[test]
    fn test_reads_one_path_per_line() {
        // `sh -c '<script>' <argv0> -b <command>` prints two paths
        let collector = CommandCollector::new(
            "sh",
            vec!["-c".into(), "printf '/usr/include/stdio.h\\n\\nlocal.h\\n'".into(), "sh".into()],
        );
        let dir = tempfile::TempDir::new().unwrap();
        let unit = CompileUnit::from_command_line("gcc -c a.c", dir.path()).unwrap();

        let paths = collector.collect(&unit).unwrap();
        assert_eq!(
            paths,
            vec![PathBuf::from("/usr/include/stdio.h"), dir.path().join("local.h")]
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_non_zero_exit_is_failure() {
        let collector = CommandCollector::new("sh", vec!["-c".into(), "exit 3".into(), "sh".into()]);
        let unit = CompileUnit::from_command_line("gcc -c a.c", Path::new("/")).unwrap();

        assert!(matches!(
            collector.collect(&unit),
            Err(ClientError::CollectorFailure { .. })
        ));
    }
}
