#![warn(missing_docs)]
#![warn(clippy::missing_docs_in_private_items)]

use std::{
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use glob::glob;
use which::which;

/// Finds and returns the path to a python interpreter, preferring `python3`.
pub fn python_path() -> Result<OsString> {
    which("python3")
        .or_else(|_| which("python"))
        .map(PathBuf::into_os_string)
        .context("Cannot find a Python interpreter on path (python3 or python)")
}

/// Finds files with the given extension under `root_dir`, descending
/// `search_depth` levels of `**`. Results are sorted.
pub fn find_files(extension: &str, search_depth: u8, root_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut pattern = root_dir.to_path_buf();
    for _ in 0..search_depth {
        pattern.push("**");
    }
    pattern.push(format!("*.{extension}"));

    let pattern = pattern
        .to_str()
        .context("Could not convert root_dir to string")?
        .to_string();

    let mut files: Vec<PathBuf> = glob(&pattern)
        .context("Could not create glob")?
        .filter_map(Result::ok)
        .collect();
    files.sort();
    Ok(files)
}

/// Recursively copies `src` into `dst`, replacing whatever was at `dst`.
pub fn replace_dir(src: &Path, dst: &Path) -> Result<()> {
    if dst.exists() {
        fs::remove_dir_all(dst).with_context(|| format!("Could not delete {}", dst.display()))?;
    }
    copy_dir_all(src, dst)
}

/// Recursively copies the contents of `src` into `dst`.
fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).with_context(|| format!("Could not create {}", dst.display()))?;

    for entry in fs::read_dir(src).with_context(|| format!("Could not read {}", src.display()))? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target).with_context(|| {
                format!("Could not copy {} to {}", entry.path().display(), target.display())
            })?;
        }
    }

    Ok(())
}

/// Truncates `content` to at most `max` bytes on a char boundary, marking the
/// cut.
pub fn truncate(content: &str, max: usize) -> String {
    if content.len() <= max {
        return content.to_string();
    }

    let mut end = max;
    while !content.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[TRUNCATED]", &content[..end])
}

/// Lowercases `name` and collapses every run of non-alphanumeric characters
/// into a single underscore.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() {
            slug.extend(c.to_lowercase());
        } else if !slug.ends_with('_') {
            slug.push('_');
        }
    }
    slug.trim_matches('_').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_punctuation() {
        assert_eq!(slugify("Database description (part 1)"), "database_description_part_1");
        assert_eq!(slugify("  Plots & Figures!"), "plots_figures");
    }

    #[test]
    fn find_files_descends_into_subdirectories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("v1");
        fs::create_dir_all(&nested).expect("mkdir");
        fs::write(nested.join("b.json"), "{}").expect("write");
        fs::write(nested.join("a.json"), "{}").expect("write");
        fs::write(nested.join("notes.txt"), "").expect("write");

        let found = find_files("json", 1, dir.path()).expect("glob");
        let names: Vec<_> = found
            .iter()
            .filter_map(|p| p.file_name()?.to_str())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json"]);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let text = "héllo";
        assert_eq!(truncate(text, 2), "h...[TRUNCATED]");
        assert_eq!(truncate(text, 64), "héllo");
    }
}
