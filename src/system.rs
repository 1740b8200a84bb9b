use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use anyhow::{Context, Result};
use log::debug;

use crate::discovery;

/// What the packaging executable left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl PackOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Abstraction for host interactions (file system, console, subprocess).
/// This allows us to run the whole build flow against a mock in tests.
pub trait SystemOps {
    /// Read a manifest from disk.
    fn read_manifest(&self, path: &Path) -> Result<String>;

    /// Overwrite a manifest on disk.
    fn write_manifest(&self, path: &Path, content: &str) -> Result<()>;

    /// List the nuspec files directly inside `dir`.
    fn list_manifests(&self, dir: &Path) -> Vec<PathBuf>;

    /// The directory the operator launched us from.
    fn current_dir(&self) -> Result<PathBuf>;

    /// Show text to the operator.
    fn show(&self, text: &str);

    /// Ask a yes/no question. Only answers starting with `y`/`Y` confirm.
    fn confirm(&self, question: &str) -> Result<bool>;

    /// Run the packaging executable to completion, capturing its output.
    fn run_packager(&self, program: &str, args: &[String]) -> Result<PackOutput>;
}

/// Interprets an operator answer.
pub fn is_yes(answer: &str) -> bool {
    answer.trim_start().starts_with(['y', 'Y'])
}

/// The real host (production).
pub struct HostSystem;

impl SystemOps for HostSystem {
    fn read_manifest(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))
    }

    fn write_manifest(&self, path: &Path, content: &str) -> Result<()> {
        std::fs::write(path, content).with_context(|| format!("Failed to write {:?}", path))
    }

    fn list_manifests(&self, dir: &Path) -> Vec<PathBuf> {
        discovery::scan_release_dir(dir)
    }

    fn current_dir(&self) -> Result<PathBuf> {
        std::env::current_dir().context("Failed to determine the current directory")
    }

    fn show(&self, text: &str) {
        println!("{}", text);
    }

    fn confirm(&self, question: &str) -> Result<bool> {
        print!("\n {} (Y/N) ", question);
        io::stdout().flush()?;

        // EOF leaves the answer empty, which declines.
        let mut answer = String::new();
        io::stdin().lock().read_line(&mut answer)?;
        debug!("Operator answered {:?}", answer.trim());
        Ok(is_yes(&answer))
    }

    fn run_packager(&self, program: &str, args: &[String]) -> Result<PackOutput> {
        debug!("Running {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute {} (is it installed and on PATH?)", program))?;

        Ok(PackOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// A Mock System for Testing.
#[cfg(test)]
#[derive(Debug, Default)]
pub struct MockSystem {
    pub files: std::sync::Mutex<std::collections::HashMap<PathBuf, String>>,
    pub writes: std::sync::Mutex<Vec<PathBuf>>,
    pub answers: std::sync::Mutex<std::collections::VecDeque<bool>>,
    pub questions: std::sync::Mutex<Vec<String>>,
    pub shown: std::sync::Mutex<Vec<String>>,
    pub pack_calls: std::sync::Mutex<Vec<(String, Vec<String>)>>,
    pub pack_output: PackOutput,
    pub cwd: PathBuf,
}

#[cfg(test)]
impl MockSystem {
    pub fn with_manifest(path: &Path, content: &str) -> Self {
        let mock = Self {
            cwd: PathBuf::from("/work"),
            pack_output: PackOutput {
                status: Some(0),
                stdout: "Successfully created package.".to_string(),
                stderr: String::new(),
            },
            ..Default::default()
        };
        mock.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), content.to_string());
        mock
    }

    pub fn answering(self, answers: &[bool]) -> Self {
        self.answers.lock().unwrap().extend(answers.iter().copied());
        self
    }

    pub fn file(&self, path: &Path) -> Option<String> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn shown_text(&self) -> String {
        self.shown.lock().unwrap().join("\n")
    }
}

#[cfg(test)]
impl SystemOps for MockSystem {
    fn read_manifest(&self, path: &Path) -> Result<String> {
        self.file(path)
            .ok_or_else(|| anyhow::anyhow!("No such file {:?}", path))
    }

    fn write_manifest(&self, path: &Path, content: &str) -> Result<()> {
        self.writes.lock().unwrap().push(path.to_path_buf());
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), content.to_string());
        Ok(())
    }

    fn list_manifests(&self, dir: &Path) -> Vec<PathBuf> {
        let mut found: Vec<PathBuf> = self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|p| p.parent() == Some(dir))
            .cloned()
            .collect();
        found.sort();
        found
    }

    fn current_dir(&self) -> Result<PathBuf> {
        Ok(self.cwd.clone())
    }

    fn show(&self, text: &str) {
        self.shown.lock().unwrap().push(text.to_string());
    }

    fn confirm(&self, question: &str) -> Result<bool> {
        self.questions.lock().unwrap().push(question.to_string());
        Ok(self.answers.lock().unwrap().pop_front().unwrap_or(false))
    }

    fn run_packager(&self, program: &str, args: &[String]) -> Result<PackOutput> {
        self.pack_calls
            .lock()
            .unwrap()
            .push((program.to_string(), args.to_vec()));
        Ok(self.pack_output.clone())
    }
}
