//! Import path resolution
//!
//! Dotted module paths map onto the filesystem. An absolute import
//! `import a.b` is tried against each search root in order as
//! `<root>/a/b.em` then `<root>/a/b/index.em`. A leading `.` makes the
//! import relative to the importing file's directory; each further `..`
//! ascends one level.
//!
//! Search roots, in order: the working directory's `.ember/libs`, any
//! roots named by the `EMBER_PATH` environment variable (colon
//! separated), then `libs/` and `vendor/` beside the interpreter binary.

use std::path::{Path, PathBuf};

pub const SOURCE_EXTENSION: &str = "em";

/// Resolve a dotted import to an absolute source path.
///
/// `relative` is 0 for absolute imports, 1 for a `.` prefix, and one more
/// for every `..` segment.
pub fn resolve_import(
    importer_file: &str,
    parts: &[String],
    relative: usize,
) -> Result<String, String> {
    let joined = parts.join("/");

    if relative > 0 {
        let mut base = Path::new(importer_file)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        for _ in 1..relative {
            base = base
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("/"));
        }
        if let Some(found) = try_root(&base, &joined) {
            return Ok(found);
        }
        return Err(format!(
            "module '{}' not found relative to '{}'",
            parts.join("."),
            importer_file
        ));
    }

    for root in search_roots() {
        if let Some(found) = try_root(&root, &joined) {
            return Ok(found);
        }
    }
    Err(format!("module '{}' not found", parts.join(".")))
}

fn try_root(root: &Path, joined: &str) -> Option<String> {
    let file = root.join(format!("{}.{}", joined, SOURCE_EXTENSION));
    if file.is_file() {
        return Some(absolute(&file));
    }
    let index = root.join(joined).join(format!("index.{}", SOURCE_EXTENSION));
    if index.is_file() {
        return Some(absolute(&index));
    }
    None
}

fn absolute(path: &Path) -> String {
    path.canonicalize()
        .unwrap_or_else(|_| path.to_path_buf())
        .to_string_lossy()
        .into_owned()
}

fn search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();
    if let Ok(cwd) = std::env::current_dir() {
        roots.push(cwd.join(".ember").join("libs"));
    }
    if let Ok(ember_path) = std::env::var("EMBER_PATH") {
        for entry in ember_path.split(':') {
            if !entry.is_empty() {
                roots.push(PathBuf::from(entry));
            }
        }
    }
    if let Ok(exe) = std::env::current_exe()
        && let Some(dir) = exe.parent()
    {
        roots.push(dir.join("libs"));
        roots.push(dir.join("vendor"));
    }
    roots
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_relative_import_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let importer = dir.path().join("main.em");
        fs::write(&importer, "").unwrap();
        fs::write(dir.path().join("util.em"), "").unwrap();

        let parts = vec!["util".to_string()];
        let resolved = resolve_import(importer.to_str().unwrap(), &parts, 1).unwrap();
        assert!(resolved.ends_with("util.em"), "got {}", resolved);
    }

    #[test]
    fn test_relative_index_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let importer = dir.path().join("main.em");
        fs::write(&importer, "").unwrap();
        fs::create_dir(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("pkg").join("index.em"), "").unwrap();

        let parts = vec!["pkg".to_string()];
        let resolved = resolve_import(importer.to_str().unwrap(), &parts, 1).unwrap();
        assert!(resolved.ends_with("index.em"), "got {}", resolved);
    }

    #[test]
    fn test_parent_relative_import() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("sub");
        fs::create_dir(&nested).unwrap();
        let importer = nested.join("main.em");
        fs::write(&importer, "").unwrap();
        fs::write(dir.path().join("shared.em"), "").unwrap();

        let parts = vec!["shared".to_string()];
        let resolved = resolve_import(importer.to_str().unwrap(), &parts, 2).unwrap();
        assert!(resolved.ends_with("shared.em"), "got {}", resolved);
    }

    #[test]
    fn test_missing_module_is_an_error() {
        let parts = vec!["definitely_missing".to_string()];
        assert!(resolve_import("/nonexistent/main.em", &parts, 1).is_err());
    }
}
