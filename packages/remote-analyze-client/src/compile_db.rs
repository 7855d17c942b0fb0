//! Compilation units from a build command or a `compile_commands.json`

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{ClientError, ClientResult};

/// One translation unit: how it is compiled and where
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileUnit {
    directory: PathBuf,
    arguments: Vec<String>,
    source: PathBuf,
}

impl CompileUnit {
    pub fn new(directory: PathBuf, arguments: Vec<String>, source: PathBuf) -> Self {
        let source = if source.is_absolute() {
            source
        } else {
            directory.join(source)
        };
        Self {
            directory,
            arguments,
            source,
        }
    }

    /// Parse a command line whose last word is the compiled file
    ///
    /// Words are split on whitespace; shell quoting is not interpreted.
    pub fn from_command_line(command: &str, directory: &Path) -> ClientResult<Self> {
        let arguments: Vec<String> = command.split_whitespace().map(str::to_string).collect();
        if arguments.len() < 2 {
            return Err(ClientError::config(format!(
                "build command must end with the compiled file: {:?}",
                command
            )));
        }
        let source = PathBuf::from(&arguments[arguments.len() - 1]);
        Ok(Self::new(directory.to_path_buf(), arguments, source))
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Absolute path of the compiled file
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// The complete command, as handed to the dependency collector
    pub fn full_command(&self) -> String {
        self.arguments.join(" ")
    }

    /// The command without its source file argument
    pub fn build_command(&self) -> String {
        let mut removed = false;
        self.arguments
            .iter()
            .filter(|arg| {
                if removed {
                    return true;
                }
                let names_source = Path::new(arg.as_str()) == self.source
                    || self.directory.join(arg.as_str()) == self.source;
                if names_source {
                    removed = true;
                }
                !names_source
            })
            .cloned()
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Deserialize)]
struct CompileCommand {
    directory: PathBuf,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    arguments: Option<Vec<String>>,
    file: PathBuf,
}

/// Read every usable entry of a compilation database
///
/// Entries with neither `command` nor `arguments` are skipped with a warning.
pub fn parse_compile_database(json: &str) -> ClientResult<Vec<CompileUnit>> {
    let entries: Vec<CompileCommand> = serde_json::from_str(json)
        .map_err(|e| ClientError::CompileDatabase(e.to_string()))?;

    let mut units = Vec::with_capacity(entries.len());
    for entry in entries {
        let arguments = match (entry.arguments, entry.command) {
            (Some(arguments), _) if !arguments.is_empty() => arguments,
            (_, Some(command)) if !command.trim().is_empty() => {
                command.split_whitespace().map(str::to_string).collect()
            }
            _ => {
                warn!(
                    "Skipping compilation database entry for {} without a command",
                    entry.file.display()
                );
                continue;
            }
        };
        units.push(CompileUnit::new(entry.directory, arguments, entry.file));
    }
    Ok(units)
}

pub fn load_compile_database(path: &Path) -> ClientResult<Vec<CompileUnit>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        ClientError::CompileDatabase(format!("cannot read {}: {}", path.display(), e))
    })?;
    parse_compile_database(&content)
}
