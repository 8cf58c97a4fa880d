use std::path::Path;
use std::sync::Arc;

use shipyard_shared::errors::{ShipyardError, ShipyardResult};

use super::archive::write_archive;
use super::copy::{copy_into_root, resolve_destination};
use super::descriptor::{BuildFile, BuildStep};
use crate::db::{CrateRecord, Database, NewCrate};
use crate::exec::{LogTail, OutputSink, RootExecutor};
use crate::layers;
use crate::overlay::OverlayManager;
use crate::runtime::layout::{RootKind, validate_name};
use shipyard_shared::constants::layers::ROOT_LAYER;

/// Builds crates synchronously in the calling process.
///
/// ```text
/// resolve base ─► mount overlay ─► persist descriptor ─► run steps
///                                                          │
///            unmount ◄─ insert crate ◄─ archive upper ◄────┘
/// ```
///
/// Any failure after the overlay is mounted unwinds everything: the overlay
/// is unmounted, the crate's directories and archive are deleted, and the
/// descriptor is dropped unless another crate shares it.
pub struct CrateBuilder {
    db: Database,
    overlays: OverlayManager,
    executor: Arc<dyn RootExecutor>,
    tail_lines: usize,
}

/// Step failure carrying the 1-based step index.
struct StepError {
    step: usize,
    reason: String,
}

impl CrateBuilder {
    pub fn new(
        db: Database,
        overlays: OverlayManager,
        executor: Arc<dyn RootExecutor>,
        tail_lines: usize,
    ) -> Self {
        Self {
            db,
            overlays,
            executor,
            tail_lines,
        }
    }

    /// Build crate `name` from build file `content`, copying sources from `context`.
    ///
    /// An existing crate or descriptor with the same name is removed first.
    pub fn build(&self, name: &str, content: &str, context: &Path) -> ShipyardResult<CrateRecord> {
        validate_name(RootKind::Crate, name)?;
        if name == ROOT_LAYER {
            return Err(ShipyardError::Config(format!(
                "'{}' is reserved for the root layer",
                ROOT_LAYER
            )));
        }

        if self.db.crates().exists(name)? || self.db.descriptors().get_by_name(name)?.is_some() {
            tracing::info!(crate_name = name, "Replacing existing crate");
            self.remove_crate(name)?;
        }

        let file = BuildFile::parse(content)?;
        let base_chain = layers::resolve(&self.db.crates(), file.base_image())?;

        tracing::info!(
            crate_name = name,
            base = file.base_image(),
            steps = file.build_steps.len(),
            "Starting build"
        );

        self.overlays
            .create_and_mount(RootKind::Crate, name, &base_chain)
            .inspect_err(|_| self.cleanup(name, None))?;

        let descriptor = self
            .db
            .descriptors()
            .insert_or_get(name, content)
            .inspect_err(|_| self.cleanup(name, None))?;

        if let Err(e) = self.run_steps(name, &file, context) {
            tracing::error!(crate_name = name, step = e.step, reason = %e.reason, "Build step failed");
            self.cleanup(name, Some(descriptor.id));
            return Err(ShipyardError::BuildStep {
                step: e.step,
                reason: e.reason,
            });
        }

        let record = self
            .finish(name, &file, descriptor.id)
            .inspect_err(|_| self.cleanup(name, Some(descriptor.id)))?;

        if let Err(e) = self.overlays.unmount(RootKind::Crate, name) {
            tracing::warn!(crate_name = name, error = %e, "Failed to unmount after build");
        }

        tracing::info!(crate_name = name, digest = %record.digest, size = record.size_bytes, "Build complete");
        Ok(record)
    }

    fn run_steps(&self, name: &str, file: &BuildFile, context: &Path) -> Result<(), StepError> {
        let paths = self.overlays.paths(RootKind::Crate, name);
        let env = file.root_env();
        let workdir = env.workdir.as_str();
        let sink = OutputSink::new(
            self.overlays.layout().build_log_dir(name),
            LogTail::new(self.tail_lines),
        );

        let fail = |step: usize, reason: String| StepError { step, reason };

        // work_directory must exist before anything runs in it
        let workdir_rel = resolve_destination("/", workdir).map_err(|e| fail(0, e.to_string()))?;
        std::fs::create_dir_all(paths.merge.join(workdir_rel))
            .map_err(|e| fail(0, format!("create work directory {}: {}", workdir, e)))?;

        for (index, step) in file.build_steps.iter().enumerate() {
            let number = index + 1;
            tracing::info!(crate_name = name, step = number, action = step.action(), "{}", step.summary());

            match step {
                BuildStep::ExecuteCommand { command, .. } => {
                    if command.is_empty() {
                        return Err(fail(number, "execute_command has no commands".into()));
                    }
                    for line in command {
                        let code = self
                            .executor
                            .run_in_root(&paths.merge, &env, line, &sink)
                            .map_err(|e| fail(number, e.to_string()))?;
                        if code != 0 {
                            let err = ShipyardError::CommandFailed {
                                command: line.clone(),
                                code,
                            };
                            return Err(fail(number, err.to_string()));
                        }
                    }
                }
                BuildStep::CopyFiles {
                    source,
                    destination,
                    ..
                } => {
                    copy_into_root(context, source, &paths.merge, workdir, destination)
                        .map_err(|e| fail(number, e.to_string()))?;
                }
            }
            sink.tail.lock().clear();
        }
        Ok(())
    }

    fn finish(&self, name: &str, file: &BuildFile, descriptor_id: i64) -> ShipyardResult<CrateRecord> {
        let layout = self.overlays.layout();
        let paths = self.overlays.paths(RootKind::Crate, name);
        let archive = write_archive(&paths.upper, &layout.archive_path(name))?;

        self.db.crates().insert(&NewCrate {
            name: name.to_string(),
            base_image: file.base_image().to_string(),
            layer_path: paths.upper,
            digest: archive.digest,
            size_bytes: archive.size_bytes,
            descriptor_id,
        })
    }

    /// Best-effort unwind of a failed build.
    fn cleanup(&self, name: &str, descriptor_id: Option<i64>) {
        if let Err(e) = self.overlays.unmount(RootKind::Crate, name) {
            tracing::warn!(crate_name = name, error = %e, "Cleanup: unmount failed");
        }
        if let Err(e) = self.overlays.remove_dirs(RootKind::Crate, name) {
            tracing::warn!(crate_name = name, error = %e, "Cleanup: removing directories failed");
        }
        remove_archive(&self.overlays.layout().archive_path(name));
        if let Some(id) = descriptor_id
            && let Err(e) = self.db.descriptors().delete_if_unreferenced(id)
        {
            tracing::warn!(crate_name = name, error = %e, "Cleanup: removing descriptor failed");
        }
    }

    /// Remove a crate. See [`remove_crate`].
    pub fn remove_crate(&self, name: &str) -> ShipyardResult<()> {
        remove_crate(&self.db, &self.overlays, name)
    }
}

/// Remove a crate: its row, archive, directories and (if unshared) descriptor.
///
/// Refused while ships run it or other crates build on it. Also clears
/// leftovers of an interrupted build that never produced a crate row.
pub fn remove_crate(db: &Database, overlays: &OverlayManager, name: &str) -> ShipyardResult<()> {
    let crates = db.crates();
    let record = crates.get_by_name(name)?;
    let stale_descriptor = db.descriptors().get_by_name(name)?;

    if record.is_none() && stale_descriptor.is_none() {
        return Err(ShipyardError::NotFound(format!("crate '{}'", name)));
    }

    if let Some(record) = &record {
        let ships = crates.ships_referencing(record.id)?;
        if !ships.is_empty() {
            return Err(ShipyardError::InvalidState(format!(
                "crate '{}' is used by ships: {}",
                name,
                ships.join(", ")
            )));
        }
        let children = crates.children_of(name)?;
        if !children.is_empty() {
            return Err(ShipyardError::InvalidState(format!(
                "crate '{}' is the base of: {}",
                name,
                children.join(", ")
            )));
        }
    }

    overlays.unmount(RootKind::Crate, name)?;

    if let Some(record) = &record {
        crates.delete(record.id)?;
        db.descriptors().delete_if_unreferenced(record.descriptor_id)?;
    }
    if let Some(descriptor) = stale_descriptor {
        db.descriptors().delete_if_unreferenced(descriptor.id)?;
    }

    overlays.remove_dirs(RootKind::Crate, name)?;
    remove_archive(&overlays.layout().archive_path(name));

    tracing::info!(crate_name = name, "Removed crate");
    Ok(())
}

fn remove_archive(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(archive = %path.display(), error = %e, "Failed to remove archive"),
    }
}
