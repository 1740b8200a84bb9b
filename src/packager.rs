//! # Packager Driver
//!
//! Hands the manifest to `nuget pack` and relays whatever it printed.
//! The exit code is logged but never decides our own exit status.

use std::path::Path;
use anyhow::Result;
use log::{info, warn};

use crate::system::{PackOutput, SystemOps};
use crate::transform::PackageProfile;

/// Arguments for `<packager> pack <manifest> -OutputDirectory <dir>`.
pub fn pack_args(profile: &PackageProfile, manifest: &Path) -> Vec<String> {
    vec![
        "pack".to_string(),
        manifest.to_string_lossy().into_owned(),
        "-OutputDirectory".to_string(),
        profile.output_dir.clone(),
    ]
}

/// Runs the packager on `manifest` and shows its output.
pub fn pack(system: &impl SystemOps, profile: &PackageProfile, manifest: &Path) -> Result<PackOutput> {
    info!("Packing {:?} into {}", manifest, profile.output_dir);
    let output = system.run_packager(&profile.packager, &pack_args(profile, manifest))?;
    report(system, &output);

    if output.success() {
        info!("{} finished", profile.packager);
    } else if let Some(code) = output.status {
        warn!("{} exited with code {}", profile.packager, code);
    } else {
        warn!("{} was terminated by a signal", profile.packager);
    }
    Ok(output)
}

/// Shows stderr (when there is any) before stdout.
pub fn report(system: &impl SystemOps, output: &PackOutput) {
    system.show("");
    if !output.stderr.is_empty() {
        system.show(&output.stderr);
        system.show("");
    }
    system.show(&output.stdout);
}
