//! Filesystem tools - list, read, write, and search/replace under the
//! task workdir
//!
//! Every path resolves against the workdir; anything that escapes it is a
//! workdir violation and performs no I/O. Read/write/replace accept only a
//! closed extension allow-list.

use std::path::{Component, Path, PathBuf};

use tokio::fs;

use super::{ToolOutput, MAX_RESULT_BYTES, MAX_RESULT_LINES};
use crate::tools::truncation;

/// Extensions accepted for read/write/replace.
const ALLOWED_EXTENSIONS: &[&str] = &[
    "txt", "md", "markdown", "json", "yaml", "yml", "toml", "ini", "cfg", "conf", "env", "rs",
    "go", "py", "js", "jsx", "ts", "tsx", "java", "c", "cc", "cpp", "h", "hpp", "cs", "rb", "php",
    "swift", "kt", "sh", "bash", "zsh", "ps1", "bat", "html", "htm", "css", "scss", "xml", "svg",
    "csv", "tsv", "sql", "proto", "lock", "log",
];

/// Resolve `raw` against the workdir, normalising `.` and `..` lexically.
/// Absolute paths are accepted only when they stay inside the workdir.
pub fn resolve_in_workdir(workdir: &Path, raw: &str) -> Result<PathBuf, String> {
    let candidate = PathBuf::from(raw.trim());
    let joined = if candidate.is_absolute() {
        candidate
    } else {
        workdir.join(candidate)
    };

    let mut normalised = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalised.pop() {
                    return Err(format!("workdir violation: {raw}"));
                }
            }
            other => normalised.push(other.as_os_str()),
        }
    }

    if !normalised.starts_with(workdir) {
        return Err(format!("workdir violation: {raw}"));
    }
    Ok(normalised)
}

fn check_extension(path: &Path) -> Result<(), String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext {
        Some(ext) if ALLOWED_EXTENSIONS.contains(&ext.as_str()) => Ok(()),
        Some(ext) => Err(format!(
            "extension '.{ext}' is not in the allowed set for file tools"
        )),
        None => Err("files without an extension are not accessible to file tools".to_string()),
    }
}

/// `path-list-files` - one entry per line, directories suffixed with `/`.
pub async fn list_files(workdir: &Path, raw_path: &str) -> ToolOutput {
    let dir = match resolve_in_workdir(workdir, raw_path) {
        Ok(p) => p,
        Err(e) => return ToolOutput::error(e),
    };

    let mut entries = match fs::read_dir(&dir).await {
        Ok(rd) => rd,
        Err(e) => return ToolOutput::error(format!("cannot list {}: {e}", dir.display())),
    };

    let mut names: Vec<String> = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        let is_dir = entry
            .file_type()
            .await
            .map(|t| t.is_dir())
            .unwrap_or(false);
        names.push(if is_dir { format!("{name}/") } else { name });
    }
    names.sort();

    if names.is_empty() {
        ToolOutput::success("(empty directory)")
    } else {
        ToolOutput::success(names.join("\n"))
    }
}

/// `file-get-content`
pub async fn get_content(workdir: &Path, raw_path: &str) -> ToolOutput {
    let path = match resolve_in_workdir(workdir, raw_path) {
        Ok(p) => p,
        Err(e) => return ToolOutput::error(e),
    };
    if let Err(e) = check_extension(&path) {
        return ToolOutput::error(e);
    }

    match fs::read_to_string(&path).await {
        Ok(content) => {
            ToolOutput::success(truncation::bounded(&content, MAX_RESULT_LINES, MAX_RESULT_BYTES))
        }
        Err(e) => ToolOutput::error(format!("cannot read {}: {e}", path.display())),
    }
}

/// `file-put-content` - full overwrite, parents created on demand.
pub async fn put_content(workdir: &Path, raw_path: &str, data: &str) -> ToolOutput {
    let path = match resolve_in_workdir(workdir, raw_path) {
        Ok(p) => p,
        Err(e) => return ToolOutput::error(e),
    };
    if let Err(e) = check_extension(&path) {
        return ToolOutput::error(e);
    }

    if let Some(parent) = path.parent() {
        if let Err(e) = fs::create_dir_all(parent).await {
            return ToolOutput::error(format!("cannot create {}: {e}", parent.display()));
        }
    }

    match fs::write(&path, data).await {
        Ok(()) => ToolOutput::success(format!("wrote {} bytes to {raw_path}", data.len())),
        Err(e) => ToolOutput::error(format!("cannot write {}: {e}", path.display())),
    }
}

/// One SEARCH/REPLACE block of a `file-replace-text` diff.
#[derive(Debug, PartialEq)]
pub struct DiffBlock {
    pub search: String,
    pub replace: String,
}

const MARKER_SEARCH: &str = "<<<<<<< SEARCH";
const MARKER_SPLIT: &str = "=======";
const MARKER_REPLACE: &str = ">>>>>>> REPLACE";

/// Parse the diff body into ordered blocks. Any missing or misordered
/// marker is a parse error; the caller must not touch the file then.
pub fn parse_diff(diff: &str) -> Result<Vec<DiffBlock>, String> {
    #[derive(PartialEq)]
    enum Phase {
        Outside,
        Search,
        Replace,
    }

    let mut blocks = Vec::new();
    let mut phase = Phase::Outside;
    let mut search: Vec<&str> = Vec::new();
    let mut replace: Vec<&str> = Vec::new();

    for line in diff.lines() {
        match line.trim_end() {
            MARKER_SEARCH => {
                if phase != Phase::Outside {
                    return Err("malformed diff: nested SEARCH marker".to_string());
                }
                phase = Phase::Search;
            }
            MARKER_SPLIT if phase == Phase::Search => {
                phase = Phase::Replace;
            }
            MARKER_REPLACE => {
                if phase != Phase::Replace {
                    return Err("malformed diff: REPLACE marker without separator".to_string());
                }
                blocks.push(DiffBlock {
                    search: search.join("\n"),
                    replace: replace.join("\n"),
                });
                search.clear();
                replace.clear();
                phase = Phase::Outside;
            }
            _ => match phase {
                Phase::Outside => {
                    if !line.trim().is_empty() {
                        return Err("malformed diff: content outside SEARCH/REPLACE block"
                            .to_string());
                    }
                }
                Phase::Search => search.push(line),
                Phase::Replace => replace.push(line),
            },
        }
    }

    if phase != Phase::Outside {
        return Err("malformed diff: unterminated block".to_string());
    }
    if blocks.is_empty() {
        return Err("malformed diff: no SEARCH/REPLACE blocks found".to_string());
    }
    Ok(blocks)
}

/// `file-replace-text` - apply blocks in order, each replacing the first
/// occurrence of its search payload. All-or-nothing: the file is written
/// only after every block matched.
pub async fn replace_text(workdir: &Path, raw_path: &str, diff: &str) -> ToolOutput {
    let path = match resolve_in_workdir(workdir, raw_path) {
        Ok(p) => p,
        Err(e) => return ToolOutput::error(e),
    };
    if let Err(e) = check_extension(&path) {
        return ToolOutput::error(e);
    }

    let blocks = match parse_diff(diff) {
        Ok(b) => b,
        Err(e) => return ToolOutput::error(e),
    };

    let mut content = match fs::read_to_string(&path).await {
        Ok(c) => c,
        Err(e) => return ToolOutput::error(format!("cannot read {}: {e}", path.display())),
    };

    for (idx, block) in blocks.iter().enumerate() {
        match content.find(&block.search) {
            Some(start) => {
                content.replace_range(start..start + block.search.len(), &block.replace);
            }
            None => {
                return ToolOutput::error(format!(
                    "search text of block {} not found in {raw_path}",
                    idx + 1
                ));
            }
        }
    }

    match fs::write(&path, &content).await {
        Ok(()) => ToolOutput::success(format!(
            "applied {} replacement(s) to {raw_path}",
            blocks.len()
        )),
        Err(e) => ToolOutput::error(format!("cannot write {}: {e}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workdir() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    #[test]
    fn absolute_path_outside_workdir_is_rejected() {
        let dir = workdir();
        let err = resolve_in_workdir(dir.path(), "/etc/passwd").unwrap_err();
        assert!(err.contains("workdir violation"));
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let dir = workdir();
        let err = resolve_in_workdir(dir.path(), "../../etc/passwd").unwrap_err();
        assert!(err.contains("workdir violation"));
    }

    #[test]
    fn relative_paths_resolve_inside_workdir() {
        let dir = workdir();
        let path = resolve_in_workdir(dir.path(), "sub/file.txt").expect("resolves");
        assert!(path.starts_with(dir.path()));
    }

    #[test]
    fn dotted_segments_normalise_without_touching_disk() {
        let dir = workdir();
        let path = resolve_in_workdir(dir.path(), "a/./b/../c.txt").expect("resolves");
        assert_eq!(path, dir.path().join("a/c.txt"));
    }

    #[tokio::test]
    async fn disallowed_extension_is_refused() {
        let dir = workdir();
        let out = put_content(dir.path(), "payload.bin", "data").await;
        assert!(out.is_error);
        assert!(out.text.contains("allowed set"));
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = workdir();
        let put = put_content(dir.path(), "notes/hello.md", "# hi\n").await;
        assert!(!put.is_error, "{}", put.text);

        let got = get_content(dir.path(), "notes/hello.md").await;
        assert!(!got.is_error);
        assert_eq!(got.text, "# hi");
    }

    #[test]
    fn diff_with_missing_marker_is_malformed() {
        let diff = "<<<<<<< SEARCH\nold\n=======\nnew";
        assert!(parse_diff(diff).is_err());

        let diff = "old\n=======\nnew\n>>>>>>> REPLACE";
        assert!(parse_diff(diff).is_err());
    }

    #[test]
    fn diff_parses_multiple_blocks_in_order() {
        let diff = "<<<<<<< SEARCH\na\n=======\nb\n>>>>>>> REPLACE\n\
                    <<<<<<< SEARCH\nc\n=======\nd\n>>>>>>> REPLACE";
        let blocks = parse_diff(diff).expect("parses");
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].search, "a");
        assert_eq!(blocks[1].replace, "d");
    }

    #[tokio::test]
    async fn malformed_diff_leaves_file_untouched() {
        let dir = workdir();
        put_content(dir.path(), "code.rs", "fn a() {}\n").await;

        let out = replace_text(dir.path(), "code.rs", "not a diff at all").await;
        assert!(out.is_error);

        let got = get_content(dir.path(), "code.rs").await;
        assert_eq!(got.text, "fn a() {}");
    }

    #[tokio::test]
    async fn replace_applies_first_occurrence_per_block() {
        let dir = workdir();
        put_content(dir.path(), "code.rs", "x = 1;\nx = 1;\n").await;

        let diff = "<<<<<<< SEARCH\nx = 1;\n=======\nx = 2;\n>>>>>>> REPLACE";
        let out = replace_text(dir.path(), "code.rs", diff).await;
        assert!(!out.is_error, "{}", out.text);

        let got = get_content(dir.path(), "code.rs").await;
        assert_eq!(got.text, "x = 2;\nx = 1;");
    }
}
