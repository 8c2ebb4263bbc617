//! DerivedData resolution.
//!
//! Xcode names each project's DerivedData directory `<Name>-<opaque hash>`,
//! so the name alone is ambiguous when two checkouts share a project name.
//! Each candidate's `info.plist` records the absolute path of the workspace
//! that produced it; that recorded path is the disambiguator.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;
use tracing::debug;

/// A resolved project → DerivedData pairing.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectArtifactLocation {
    pub project_path: PathBuf,
    pub derived_data_dir: PathBuf,
}

impl ProjectArtifactLocation {
    /// `Logs/Build` inside the DerivedData directory.
    pub fn build_logs_dir(&self) -> PathBuf {
        self.derived_data_dir.join("Logs").join("Build")
    }

    /// `Logs/Test` inside the DerivedData directory (result bundles land here).
    pub fn test_logs_dir(&self) -> PathBuf {
        self.derived_data_dir.join("Logs").join("Test")
    }
}

/// Base name used for the `<Name>-` candidate prefix: the project file's stem
/// (`/w/Foo/Foo.xcodeproj` → `Foo`).
fn project_base_name(project_path: &Path) -> Option<String> {
    project_path
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
}

/// Pull `WorkspacePath` out of an `info.plist` without a plist dependency;
/// the file is XML and we only need the one key.
fn recorded_workspace_path(plist: &str) -> Option<PathBuf> {
    // Compiled per call; locator runs once per operation.
    let re = Regex::new(r"<key>WorkspacePath</key>\s*<string>([^<]+)</string>")
        .expect("workspace-path pattern is valid");
    re.captures(plist)
        .map(|caps| PathBuf::from(caps[1].to_string()))
}

/// True when the recorded workspace path identifies the requested project:
/// exact equality, or one path containing the other (a workspace may record
/// the `.xcworkspace` inside the directory the caller passed, or vice versa).
fn paths_correspond(recorded: &Path, requested: &Path) -> bool {
    recorded == requested || recorded.starts_with(requested) || requested.starts_with(recorded)
}

/// Resolve a project path to its DerivedData directory.
///
/// `Ok(None)` means no build has happened yet for this project — not an
/// error. Candidates that cannot be read are skipped; environment noise must
/// not abort the lookup.
pub fn locate_derived_data(
    project_path: &Path,
    derived_data_root: &Path,
) -> Result<Option<ProjectArtifactLocation>> {
    let Some(base) = project_base_name(project_path) else {
        anyhow::bail!(
            "project path has no base name: {}",
            project_path.display()
        );
    };
    let prefix = format!("{base}-");

    if !derived_data_root.is_dir() {
        debug!(root = %derived_data_root.display(), "DerivedData root missing");
        return Ok(None);
    }

    let mut candidates: Vec<PathBuf> = Vec::new();
    let entries = std::fs::read_dir(derived_data_root)
        .with_context(|| format!("failed to list {}", derived_data_root.display()))?;
    for entry in entries {
        let Ok(entry) = entry else { continue };
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with(&prefix) {
            candidates.push(path);
        }
    }
    // Deterministic selection order when several candidates share the prefix.
    candidates.sort();

    for candidate in candidates {
        let plist_path = candidate.join("info.plist");
        let contents = match std::fs::read_to_string(&plist_path) {
            Ok(contents) => contents,
            Err(err) => {
                debug!(
                    candidate = %candidate.display(),
                    error = %err,
                    "skipping candidate without readable info.plist"
                );
                continue;
            }
        };
        let Some(recorded) = recorded_workspace_path(&contents) else {
            debug!(candidate = %candidate.display(), "info.plist has no WorkspacePath");
            continue;
        };
        if paths_correspond(&recorded, project_path) {
            debug!(
                candidate = %candidate.display(),
                recorded = %recorded.display(),
                "DerivedData candidate matched"
            );
            return Ok(Some(ProjectArtifactLocation {
                project_path: project_path.to_path_buf(),
                derived_data_dir: candidate,
            }));
        }
    }

    Ok(None)
}
