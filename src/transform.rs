//! # Transform Logic
//!
//! This module contains the core logic of thingsdb-pack. It is responsible for:
//! 1. Loading the manifest generated by `dotnet pack` and checking its version (`run_build`).
//! 2. Rewriting the metadata into what we publish on nuget.org (`apply_fixups`).
//! 3. Asking the operator before anything is written back in place.
//! 4. Handing the result to the packager, whichever branch was taken.
//!
//! A manifest without `xmlns` on `<package>` has been through here before; in that
//! case nothing is rewritten and the operator decides whether to pack it as is.

use std::path::Path;
use anyhow::{Context, Result, bail};
use log::{debug, info, warn};

use crate::discovery;
use crate::invariant_ppt::assert_invariant;
use crate::nuspec::{Document, Element};
use crate::packager;
use crate::system::{PackOutput, SystemOps};

/// Fixed values for the ThingsDB connector package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageProfile {
    /// Project directory, also the project name used in the nuspec file name.
    pub project: String,
    pub package_id: String,
    pub authors: String,
    pub tags: String,
    /// Icon file name, relative to the working directory.
    pub icon: String,
    pub project_url: String,
    pub repository_url: String,
    pub output_dir: String,
    /// Packaging executable, resolved through `PATH`.
    pub packager: String,
}

impl Default for PackageProfile {
    fn default() -> Self {
        Self {
            project: "ThingsDB".to_string(),
            package_id: "ThingsDB.Connector".to_string(),
            authors: "joente".to_string(),
            tags: "thingsdb database programming connector".to_string(),
            icon: "logo.png".to_string(),
            project_url: "https://github.com/thingsdb/ThingsDB-CSharp/".to_string(),
            repository_url: "https://github.com/thingsdb/ThingsDB-CSharp.git".to_string(),
            output_dir: "ThingsDB/bin/Release/".to_string(),
            packager: "nuget".to_string(),
        }
    }
}

/// What [`apply_fixups`] found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupState {
    /// `xmlns` was present and every fixup was applied.
    Applied,
    /// `xmlns` was already gone; the document was left untouched.
    AlreadyBuilt,
}

/// How a build run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The packager ran. Its exit code does not affect ours.
    Packed(PackOutput),
    /// `--dry-run`: transformed and printed, nothing written or packed.
    DryRun,
    /// The operator declined a confirmation.
    Aborted,
}

/// Fails unless the document is a `<package>` holding both `<metadata>` and `<files>`.
pub fn check_layout(doc: &Document) -> Result<()> {
    if doc.root.name != "package" {
        bail!("element <package> not found (root is <{}>)", doc.root.name);
    }
    doc.root.require_child("metadata")?;
    doc.root.require_child("files")?;
    Ok(())
}

/// Fails unless the manifest's `<version>` text equals `version` exactly.
pub fn check_version(doc: &Document, version: &str) -> Result<()> {
    let found = doc
        .root
        .require_child("metadata")?
        .require_child("version")?
        .text();

    if found != version {
        bail!("Version in nuspec {} is not equal to {}", found, version);
    }
    Ok(())
}

/// Rewrites the generated metadata in place.
///
/// Overwrites `id` and `authors`, drops `licenseUrl` and the generated
/// `repository`, then appends `icon`, `tags`, `projectUrl`, the git
/// `repository` and a `files` entry shipping the icon. An `icon`, `tags` or
/// `projectUrl` already present is dropped before the append, so each ends up
/// there once.
///
/// `icon_src` is the absolute path of the icon file to ship.
pub fn apply_fixups(doc: &mut Document, profile: &PackageProfile, icon_src: &Path) -> Result<FixupState> {
    let package = &mut doc.root;
    if package.remove_attribute("xmlns").is_none() {
        return Ok(FixupState::AlreadyBuilt);
    }

    // Look up `files` before touching anything in `metadata`.
    package.require_child("files")?;

    let metadata = package.require_child_mut("metadata")?;
    metadata.require_child_mut("id")?.set_text(&profile.package_id);
    metadata.require_child_mut("authors")?.set_text(&profile.authors);

    if metadata.remove_children("licenseUrl") == 0 {
        bail!("element <licenseUrl> not found in <metadata>");
    }
    if metadata.remove_children("repository") == 0 {
        bail!("element <repository> not found in <metadata>");
    }

    // nuget rejects repeated metadata fields, so a value set in the csproj gives way to ours.
    for name in ["icon", "tags", "projectUrl"] {
        if metadata.remove_children(name) > 0 {
            debug!("Replacing generated <{}>", name);
        }
    }

    metadata.push_child(Element::new("icon").with_text(&profile.icon));
    metadata.push_child(Element::new("tags").with_text(&profile.tags));
    metadata.push_child(Element::new("projectUrl").with_text(&profile.project_url));
    metadata.push_child(
        Element::new("repository")
            .with_attr("type", "git")
            .with_attr("url", &profile.repository_url),
    );

    let files = package.require_child_mut("files")?;
    files.push_child(
        Element::new("file")
            .with_attr("src", &icon_src.to_string_lossy())
            .with_attr("target", &format!("/{}", profile.icon)),
    );

    check_fixups(doc, profile);
    Ok(FixupState::Applied)
}

/// Post-conditions of a successful [`apply_fixups`].
fn check_fixups(doc: &Document, profile: &PackageProfile) {
    let package = &doc.root;
    assert_invariant(package.attribute("xmlns").is_none(), "package has no xmlns", Some("Transform"));

    let Some(metadata) = package.child("metadata") else {
        assert_invariant(false, "package has metadata", Some("Transform"));
        return;
    };
    assert_invariant(metadata.count_children("licenseUrl") == 0, "metadata has no licenseUrl", Some("Transform"));
    for name in ["icon", "tags", "projectUrl", "repository"] {
        assert_invariant(
            metadata.count_children(name) == 1,
            &format!("metadata has exactly one {}", name),
            Some("Transform"),
        );
    }

    let target = format!("/{}", profile.icon);
    let has_icon_file = package
        .child("files")
        .is_some_and(|files| files.elements().any(|f| f.attribute("target") == Some(target.as_str())));
    assert_invariant(has_icon_file, "files ships the icon", Some("Transform"));
}

/// The full build: fix up the manifest for `version`, then pack it.
///
/// # Returns
///
/// `Ok(Outcome::Aborted)` when the operator declines; errors for a missing or
/// malformed manifest, a version mismatch, or a packager that cannot be started.
pub fn run_build(system: &impl SystemOps, profile: &PackageProfile, version: &str, dry_run: bool) -> Result<Outcome> {
    let path = discovery::manifest_path(profile, version);
    debug!("Using manifest {:?}", path);

    let original = match system.read_manifest(&path) {
        Ok(content) => content,
        Err(e) => {
            let found = discovery::available_versions(profile, &system.list_manifests(&discovery::release_dir(profile)));
            if found.is_empty() {
                return Err(e.context("Run `dotnet pack` first"));
            }
            return Err(e.context(format!("Available versions: {}", found.join(", "))));
        }
    };

    let mut doc = Document::parse(&original).with_context(|| format!("Failed to parse {:?}", path))?;
    check_layout(&doc)?;
    check_version(&doc, version)?;

    let icon_src = system.current_dir()?.join(&profile.icon);
    match apply_fixups(&mut doc, profile, &icon_src)? {
        FixupState::AlreadyBuilt => {
            warn!("Attribute xmlns not found on <package> (most likely the nuspec is already built)");
            if dry_run {
                return Ok(Outcome::DryRun);
            }
            if !system.confirm(&format!("Do you still want to run {}?", profile.packager))? {
                system.show("aborted");
                return Ok(Outcome::Aborted);
            }
        }
        FixupState::Applied => {
            let content = doc.to_pretty_string()?;
            system.show(&content);
            if dry_run {
                info!("Dry run: {:?} left untouched", path);
                return Ok(Outcome::DryRun);
            }
            if !system.confirm("Is the above correct?")? {
                system.show("aborted");
                return Ok(Outcome::Aborted);
            }

            system.write_manifest(&path, &content)?;
            info!("Wrote {:?}", path);
        }
    }

    let output = packager::pack(system, profile, &path)?;
    Ok(Outcome::Packed(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use proptest::prelude::*;
    use quick_xml::escape::escape;
    use crate::invariant_ppt::contract_test;
    use crate::system::MockSystem;

    fn generated(version: &str, id: &str, authors: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<package xmlns="http://schemas.microsoft.com/packaging/2012/06/nuspec.xsd">
  <metadata>
    <id>{id}</id>
    <version>{version}</version>
    <authors>{authors}</authors>
    <requireLicenseAcceptance>false</requireLicenseAcceptance>
    <licenseUrl>https://aka.ms/deprecateLicenseUrl</licenseUrl>
    <description>ThingsDB Connector</description>
    <repository type="git" commit="3f0c1a9" />
  </metadata>
  <files>
    <file src="/build/ThingsDB/bin/Release/net6.0/ThingsDB.dll" target="lib/net6.0/ThingsDB.dll" />
  </files>
</package>"#
        )
    }

    fn manifest(version: &str) -> (PathBuf, String) {
        let profile = PackageProfile::default();
        (discovery::manifest_path(&profile, version), generated(version, "ThingsDB", "ThingsDB"))
    }

    #[test]
    fn test_end_to_end_thingsdb_1_0_3() {
        let (path, original) = manifest("1.0.3");
        let system = MockSystem::with_manifest(&path, &original).answering(&[true]);
        let profile = PackageProfile::default();

        let outcome = run_build(&system, &profile, "1.0.3", false).unwrap();
        assert!(matches!(outcome, Outcome::Packed(ref out) if out.success()));

        let written = system.file(&path).unwrap();
        assert!(written.contains("<id>ThingsDB.Connector</id>"));
        assert!(written.contains("<authors>joente</authors>"));
        assert!(!written.contains("licenseUrl"));
        assert!(!written.contains("xmlns"));
        assert!(!written.contains("commit="));
        assert!(written.contains("<icon>logo.png</icon>"));
        assert!(written.contains("<tags>thingsdb database programming connector</tags>"));
        assert!(written.contains("<projectUrl>https://github.com/thingsdb/ThingsDB-CSharp/</projectUrl>"));
        assert!(written.contains(
            r#"<repository type="git" url="https://github.com/thingsdb/ThingsDB-CSharp.git"/>"#
        ));
        assert!(written.contains(r#"<file src="/work/logo.png" target="/logo.png"/>"#));
        assert!(!written.lines().any(|l| l.trim().is_empty()));

        // The operator reviewed exactly what was written.
        assert_eq!(system.shown.lock().unwrap()[0], written);
        assert_eq!(*system.questions.lock().unwrap(), vec!["Is the above correct?"]);

        assert_eq!(*system.writes.lock().unwrap(), vec![path.clone()]);

        let calls = system.pack_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "nuget");
        assert_eq!(calls[0].1[1], path.to_string_lossy());

        contract_test(
            "end to end",
            &[
                "package has no xmlns",
                "metadata has no licenseUrl",
                "metadata has exactly one icon",
                "metadata has exactly one tags",
                "metadata has exactly one projectUrl",
                "metadata has exactly one repository",
                "files ships the icon",
            ],
        );
    }

    #[test]
    fn test_metadata_order_after_fixups() {
        let (_, original) = manifest("1.0.3");
        let mut doc = Document::parse(&original).unwrap();
        let profile = PackageProfile::default();

        let state = apply_fixups(&mut doc, &profile, Path::new("/work/logo.png")).unwrap();
        assert_eq!(state, FixupState::Applied);

        let names: Vec<&str> = doc
            .root
            .require_child("metadata")
            .unwrap()
            .elements()
            .map(|e| e.name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                "id",
                "version",
                "authors",
                "requireLicenseAcceptance",
                "description",
                "icon",
                "tags",
                "projectUrl",
                "repository"
            ]
        );
        assert_eq!(doc.root.require_child("files").unwrap().count_children("file"), 2);
    }

    #[test]
    fn test_version_mismatch_leaves_file_alone() {
        let profile = PackageProfile::default();
        let path = discovery::manifest_path(&profile, "1.0.4");
        let original = generated("1.0.3", "ThingsDB", "ThingsDB");
        let system = MockSystem::with_manifest(&path, &original).answering(&[true, true]);

        let err = run_build(&system, &profile, "1.0.4", false).unwrap_err();
        assert_eq!(err.to_string(), "Version in nuspec 1.0.3 is not equal to 1.0.4");

        assert_eq!(system.file(&path).unwrap(), original);
        assert!(system.writes.lock().unwrap().is_empty());
        assert!(system.questions.lock().unwrap().is_empty());
        assert!(system.pack_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_already_built_confirmed_still_packs() {
        let (path, original) = manifest("1.0.3");
        let system = MockSystem::with_manifest(&path, &original).answering(&[true, true]);
        let profile = PackageProfile::default();
        run_build(&system, &profile, "1.0.3", false).unwrap();
        let built = system.file(&path).unwrap();

        // Second run over the rewritten manifest.
        let system = MockSystem::with_manifest(&path, &built).answering(&[true]);
        let outcome = run_build(&system, &profile, "1.0.3", false).unwrap();

        assert!(matches!(outcome, Outcome::Packed(_)));
        assert_eq!(system.file(&path).unwrap(), built);
        assert!(system.writes.lock().unwrap().is_empty());
        assert_eq!(
            *system.questions.lock().unwrap(),
            vec!["Do you still want to run nuget?"]
        );
        assert_eq!(system.pack_calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_already_built_declined_aborts_without_packing() {
        let (path, _) = manifest("1.0.3");
        let built = r#"<package><metadata><id>ThingsDB.Connector</id><version>1.0.3</version></metadata><files/></package>"#;
        let system = MockSystem::with_manifest(&path, built).answering(&[false]);

        let outcome = run_build(&system, &PackageProfile::default(), "1.0.3", false).unwrap();
        assert_eq!(outcome, Outcome::Aborted);
        assert_eq!(system.file(&path).unwrap(), built);
        assert!(system.pack_calls.lock().unwrap().is_empty());
        assert_eq!(system.shown_text(), "aborted");
    }

    #[test]
    fn test_review_declined_aborts_without_writing() {
        let (path, original) = manifest("1.0.3");
        let system = MockSystem::with_manifest(&path, &original).answering(&[false]);

        let outcome = run_build(&system, &PackageProfile::default(), "1.0.3", false).unwrap();
        assert_eq!(outcome, Outcome::Aborted);
        assert_eq!(system.file(&path).unwrap(), original);
        assert!(system.writes.lock().unwrap().is_empty());
        assert!(system.pack_calls.lock().unwrap().is_empty());
        assert!(system.shown_text().ends_with("aborted"));
    }

    #[test]
    fn test_dry_run_never_prompts_writes_or_packs() {
        let (path, original) = manifest("1.0.3");
        let system = MockSystem::with_manifest(&path, &original).answering(&[true, true]);

        let outcome = run_build(&system, &PackageProfile::default(), "1.0.3", true).unwrap();
        assert_eq!(outcome, Outcome::DryRun);
        assert!(system.shown_text().contains("<id>ThingsDB.Connector</id>"));
        assert_eq!(system.file(&path).unwrap(), original);
        assert!(system.questions.lock().unwrap().is_empty());
        assert!(system.pack_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_manifest_lists_available_versions() {
        let profile = PackageProfile::default();
        let (path, original) = manifest("1.0.2");
        let system = MockSystem::with_manifest(&path, &original);

        let err = run_build(&system, &profile, "1.0.3", false).unwrap_err();
        assert_eq!(err.to_string(), "Available versions: 1.0.2");
    }

    #[test]
    fn test_missing_license_url_is_a_lookup_failure() {
        let (path, original) = manifest("1.0.3");
        let stripped = original.replace("<licenseUrl>https://aka.ms/deprecateLicenseUrl</licenseUrl>", "");
        let system = MockSystem::with_manifest(&path, &stripped).answering(&[true]);

        let err = run_build(&system, &PackageProfile::default(), "1.0.3", false).unwrap_err();
        assert_eq!(err.to_string(), "element <licenseUrl> not found in <metadata>");
        assert!(system.writes.lock().unwrap().is_empty());
        assert!(system.pack_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_files_is_a_lookup_failure() {
        let mut doc = Document::parse(
            r#"<package xmlns="urn:x"><metadata><id>a</id><version>1</version></metadata></package>"#,
        )
        .unwrap();
        let err = apply_fixups(&mut doc, &PackageProfile::default(), Path::new("/logo.png")).unwrap_err();
        assert_eq!(err.to_string(), "element <files> not found in <package>");
    }

    #[test]
    fn test_generated_icon_and_tags_give_way() {
        let (_, original) = manifest("1.0.3");
        let with_extras = original.replace(
            "<description>",
            "<icon>old.png</icon><tags>old</tags><description>",
        );
        let mut doc = Document::parse(&with_extras).unwrap();
        let profile = PackageProfile::default();

        apply_fixups(&mut doc, &profile, Path::new("/work/logo.png")).unwrap();
        let metadata = doc.root.require_child("metadata").unwrap();
        assert_eq!(metadata.count_children("icon"), 1);
        assert_eq!(metadata.require_child("icon").unwrap().text(), "logo.png");
        assert_eq!(metadata.require_child("tags").unwrap().text(), profile.tags);
    }

    #[test]
    fn test_check_version_is_textual() {
        let doc = Document::parse("<package><metadata><version>1.0.3</version></metadata></package>").unwrap();
        assert!(check_version(&doc, "1.0.3").is_ok());
        assert!(check_version(&doc, "1.0").is_err());

        let padded = Document::parse("<package><metadata><version> 1.0.3 </version></metadata></package>").unwrap();
        let err = check_version(&padded, "1.0.3").unwrap_err();
        assert_eq!(err.to_string(), "Version in nuspec  1.0.3  is not equal to 1.0.3");
    }

    #[test]
    fn test_already_built_without_files_fails_before_prompting() {
        let (path, _) = manifest("1.0.3");
        let built = "<package><metadata><version>1.0.3</version></metadata></package>";
        let system = MockSystem::with_manifest(&path, built).answering(&[true]);

        let err = run_build(&system, &PackageProfile::default(), "1.0.3", false).unwrap_err();
        assert_eq!(err.to_string(), "element <files> not found in <package>");
        assert!(system.questions.lock().unwrap().is_empty());
        assert!(system.pack_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_missing_metadata_fails_before_version_check() {
        let (path, _) = manifest("1.0.3");
        let system = MockSystem::with_manifest(&path, "<package><files/></package>");

        let err = run_build(&system, &PackageProfile::default(), "1.0.3", false).unwrap_err();
        assert_eq!(err.to_string(), "element <metadata> not found in <package>");
    }

    #[test]
    fn test_untouched_text_keeps_its_whitespace() {
        let (path, original) = manifest("1.0.3");
        let description = "  Indented\n  second line  ";
        let padded = original.replace(
            "<description>ThingsDB Connector</description>",
            &format!("<description>{}</description>", description),
        );
        let system = MockSystem::with_manifest(&path, &padded).answering(&[true]);

        run_build(&system, &PackageProfile::default(), "1.0.3", false).unwrap();
        let written = Document::parse(&system.file(&path).unwrap()).unwrap();
        let metadata = written.root.require_child("metadata").unwrap();
        assert_eq!(metadata.require_child("description").unwrap().text(), description);
    }

    proptest! {
        #[test]
        fn test_fixup_structural_delta(
            id in "[A-Za-z][A-Za-z0-9.]{0,20}",
            authors in "[A-Za-z&<>][A-Za-z0-9 &<>]{0,20}[A-Za-z]",
            version in "[0-9]{1,2}\\.[0-9]{1,2}\\.[0-9]{1,2}",
        ) {
            let mut doc = Document::parse(&generated(&version, &id, &escape(authors.as_str()))).unwrap();
            let profile = PackageProfile::default();
            let files_before = doc.root.require_child("files").unwrap().count_children("file");

            let state = apply_fixups(&mut doc, &profile, Path::new("/work/logo.png")).unwrap();
            prop_assert_eq!(state, FixupState::Applied);

            // The serialized form carries the same structure.
            let doc = Document::parse(&doc.to_pretty_string().unwrap()).unwrap();
            let metadata = doc.root.require_child("metadata").unwrap();
            prop_assert_eq!(metadata.require_child("id").unwrap().text(), profile.package_id.clone());
            prop_assert_eq!(metadata.require_child("authors").unwrap().text(), profile.authors.clone());
            prop_assert_eq!(metadata.require_child("version").unwrap().text(), version.clone());
            prop_assert_eq!(metadata.count_children("licenseUrl"), 0);
            for name in ["icon", "tags", "projectUrl", "repository"] {
                prop_assert_eq!(metadata.count_children(name), 1);
            }
            prop_assert_eq!(
                doc.root.require_child("files").unwrap().count_children("file"),
                files_before + 1
            );

            // A second pass sees an already built manifest and changes nothing.
            let mut again = doc.clone();
            prop_assert_eq!(
                apply_fixups(&mut again, &profile, Path::new("/work/logo.png")).unwrap(),
                FixupState::AlreadyBuilt
            );
            prop_assert_eq!(again, doc);
        }

        #[test]
        fn test_version_mismatch_never_writes(
            actual in "[0-9]{1,2}\\.[0-9]{1,2}\\.[0-9]{1,2}",
            requested in "[0-9]{1,2}\\.[0-9]{1,2}\\.[0-9]{1,2}",
        ) {
            prop_assume!(actual != requested);
            let profile = PackageProfile::default();
            let path = discovery::manifest_path(&profile, &requested);
            let system = MockSystem::with_manifest(&path, &generated(&actual, "ThingsDB", "ThingsDB"))
                .answering(&[true, true]);

            prop_assert!(run_build(&system, &profile, &requested, false).is_err());
            prop_assert!(system.writes.lock().unwrap().is_empty());
            prop_assert!(system.pack_calls.lock().unwrap().is_empty());
        }
    }
}
