//! Finding the daemon binary.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::config::Settings;

#[derive(Debug, thiserror::Error)]
pub enum LocateError {
    #[error(
        "{name} not found. To run functionality tests, either:\n\
         \t- provide full path to executable file in BINPATH environment variable, or\n\
         \t- provide directory containing executable '{name}' in BINPATH environment variable, or\n\
         \t- place executable '{name}' in working directory or any directory specified in PATH environment variable.\n\
         Paths searched:{}",
        searched.iter().map(|p| format!("\n\t- {}", p.display())).collect::<String>()
    )]
    NotFound { name: String, searched: Vec<PathBuf> },
}

/// Candidate paths in resolution order.
///
/// `BINPATH` may name the binary itself or its directory; then the current
/// directory; then the bare name, which is looked up on `PATH`.
pub fn candidates(settings: &Settings, cwd: Option<&Path>) -> Vec<PathBuf> {
    let name = &settings.binary_name;
    let mut paths = Vec::new();
    if let Some(binpath) = &settings.binpath {
        paths.push(binpath.clone());
        paths.push(binpath.join(name));
    }
    if let Some(cwd) = cwd {
        paths.push(cwd.join(name));
    }
    paths.push(PathBuf::from(name));
    paths
}

/// Resolve the daemon binary to an absolute path; the first candidate that
/// is an executable file wins.
pub fn locate(settings: &Settings) -> Result<PathBuf, LocateError> {
    let cwd = std::env::current_dir().ok();
    let searched = candidates(settings, cwd.as_deref());
    for candidate in &searched {
        if let Ok(found) = which::which(candidate) {
            let found = std::path::absolute(&found).unwrap_or(found);
            info!(binary = %found.display(), "testing application binary");
            return Ok(found);
        }
    }
    Err(LocateError::NotFound {
        name: settings.binary_name.clone(),
        searched,
    })
}
