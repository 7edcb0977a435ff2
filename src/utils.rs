use anyhow::Result;
use std::path::{Path, PathBuf};
use url::Url;

pub fn get_filename_from_url(url: &Url) -> String {
    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                return filename.to_string();
            }
        }
    }

    // Fallback if no filename found in path
    format!("download_{}", uuid::Uuid::new_v4())
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(|c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_', "_")
}

/// Explicit `--output` wins; otherwise the URL's file name inside `dir`.
pub fn resolve_destination(url: &Url, dir: &Path, output: Option<&Path>) -> Result<PathBuf> {
    let path = match output {
        Some(path) => path.to_path_buf(),
        None => dir.join(sanitize_filename(&get_filename_from_url(url))),
    };
    if path.is_relative() {
        return Ok(std::env::current_dir()?.join(path));
    }
    Ok(path)
}
