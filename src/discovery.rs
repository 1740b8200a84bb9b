//! # Discovery Module
//!
//! Works out where `dotnet pack` left the generated manifest.
//!
//! The layout is fixed: `<project>/obj/Release/<ProjectName>.<version>.nuspec`.
//! When the requested version is not there, the release directory is scanned
//! (one level deep) so the error can list the versions that *were* built.

use std::path::{Path, PathBuf};
use walkdir::WalkDir;
use log::debug;

use crate::transform::PackageProfile;

/// Directory where `dotnet pack` writes its intermediate nuspec files.
pub fn release_dir(profile: &PackageProfile) -> PathBuf {
    Path::new(&profile.project).join("obj").join("Release")
}

/// Path of the generated manifest for `version`.
pub fn manifest_path(profile: &PackageProfile, version: &str) -> PathBuf {
    release_dir(profile).join(format!("{}.{}.nuspec", profile.project, version))
}

/// Extracts the version from a manifest file name such as `ThingsDB.1.0.3.nuspec`.
pub fn version_from_file_name<'a>(profile: &PackageProfile, file_name: &'a str) -> Option<&'a str> {
    let version = file_name
        .strip_prefix(profile.project.as_str())?
        .strip_prefix('.')?
        .strip_suffix(".nuspec")?;
    (!version.is_empty()).then_some(version)
}

/// Lists the `*.nuspec` files directly inside `dir`, sorted.
///
/// A missing or unreadable directory yields an empty list.
pub fn scan_release_dir(dir: &Path) -> Vec<PathBuf> {
    debug!("Scanning directory: {:?}", dir);
    let mut found: Vec<PathBuf> = WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("nuspec")))
        .collect();

    found.sort();
    found
}

/// Versions present among `manifests`, in the order given.
pub fn available_versions(profile: &PackageProfile, manifests: &[PathBuf]) -> Vec<String> {
    manifests
        .iter()
        .filter_map(|p| p.file_name()?.to_str())
        .filter_map(|name| version_from_file_name(profile, name))
        .map(str::to_string)
        .collect()
}
