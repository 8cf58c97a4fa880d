//! Build file format.
//!
//! ```yaml
//! build_context:
//!   base_image: root
//!   work_directory: /app
//! build_steps:
//!   - action: execute_command
//!     description: install curl
//!     command:
//!       - apt-get update
//!       - apt-get install -y curl
//!   - action: copy_files
//!     source: app/
//!     destination: .
//! crate_config:
//!   expose_ports: [8080]
//!   environment_variables:
//!     MODE: production
//! runtime_command: ["./server", "--port", "8080"]
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use shipyard_shared::errors::{ShipyardError, ShipyardResult};

use crate::exec::{RootEnv, join_command};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BuildFile {
    pub build_context: BuildContext,
    #[serde(default)]
    pub build_steps: Vec<BuildStep>,
    #[serde(default)]
    pub crate_config: CrateConfig,
    #[serde(default)]
    pub runtime_command: Option<Vec<String>>,
    #[serde(default)]
    pub runtime_entrypoint: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildContext {
    pub base_image: String,
    #[serde(default = "default_work_directory")]
    pub work_directory: String,
}

fn default_work_directory() -> String {
    "/".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum BuildStep {
    /// Each entry is one command line, run in order.
    ExecuteCommand {
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        description: Option<String>,
    },
    /// Copy `source` (relative to the build context) to `destination`
    /// (absolute, or relative to the work directory) inside the root.
    CopyFiles {
        source: String,
        destination: String,
        #[serde(default)]
        description: Option<String>,
    },
}

impl BuildStep {
    pub fn action(&self) -> &'static str {
        match self {
            BuildStep::ExecuteCommand { .. } => "execute_command",
            BuildStep::CopyFiles { .. } => "copy_files",
        }
    }

    /// One-line summary for progress output.
    pub fn summary(&self) -> String {
        match self {
            BuildStep::ExecuteCommand {
                description: Some(d),
                ..
            }
            | BuildStep::CopyFiles {
                description: Some(d),
                ..
            } => d.clone(),
            BuildStep::ExecuteCommand { command, .. } => command.join(" && "),
            BuildStep::CopyFiles {
                source,
                destination,
                ..
            } => format!("{} -> {}", source, destination),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrateConfig {
    #[serde(default)]
    pub expose_ports: Vec<u16>,
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
}

impl BuildFile {
    pub fn parse(content: &str) -> ShipyardResult<Self> {
        let file: BuildFile = serde_yaml::from_str(content)
            .map_err(|e| ShipyardError::Config(format!("invalid build file: {}", e)))?;
        file.validate()?;
        Ok(file)
    }

    fn validate(&self) -> ShipyardResult<()> {
        if self.build_context.base_image.trim().is_empty() {
            return Err(ShipyardError::Config(
                "build_context.base_image must not be empty".into(),
            ));
        }
        let runtime_len = self.runtime_entrypoint.iter().flatten().count()
            + self.runtime_command.iter().flatten().count();
        if runtime_len == 0 {
            return Err(ShipyardError::Config(
                "build file needs runtime_command or runtime_entrypoint".into(),
            ));
        }
        for (index, step) in self.build_steps.iter().enumerate() {
            if let BuildStep::CopyFiles {
                source,
                destination,
                ..
            } = step
                && (source.trim().is_empty() || destination.trim().is_empty())
            {
                return Err(ShipyardError::Config(format!(
                    "build step {}: copy_files needs source and destination",
                    index + 1
                )));
            }
        }
        Ok(())
    }

    pub fn base_image(&self) -> &str {
        self.build_context.base_image.trim()
    }

    pub fn work_directory(&self) -> &str {
        &self.build_context.work_directory
    }

    /// Work directory and `crate_config` environment, shared by build
    /// steps and the ships running this crate.
    pub fn root_env(&self) -> RootEnv {
        RootEnv::new(self.work_directory())
            .with_vars(self.crate_config.environment_variables.clone())
    }

    /// Entrypoint followed by command, as one command line.
    pub fn runtime_command_line(&self) -> String {
        let args: Vec<&String> = self
            .runtime_entrypoint
            .iter()
            .flatten()
            .chain(self.runtime_command.iter().flatten())
            .collect();
        join_command(&args)
    }
}
