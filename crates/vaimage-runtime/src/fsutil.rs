//! Synchronous filesystem helpers for working inside a mounted image root.

use regex::Regex;
use std::fs;
use std::io::{self, ErrorKind};
use std::os::unix::fs::{symlink, DirBuilderExt, PermissionsExt};
use std::path::Path;

/// True for anything at `path`, dangling symlinks included.
pub fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// Remove a file, symlink or directory tree. Returns whether anything was removed.
pub fn remove_path(path: &Path) -> io::Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}

/// Rename `from` to `to` when `from` exists. Returns whether a rename happened.
pub fn rename_if_exists(from: &Path, to: &Path) -> io::Result<bool> {
    if !path_exists(from) {
        return Ok(false);
    }
    fs::rename(from, to)?;
    Ok(true)
}

/// Apply ownership when at least one id is given.
pub fn chown(path: &Path, owner: Option<u32>, group: Option<u32>) -> io::Result<()> {
    if owner.is_none() && group.is_none() {
        return Ok(());
    }
    std::os::unix::fs::chown(path, owner, group)
}

/// Create `path` and any missing parents with `mode`, then apply ownership.
/// An existing directory keeps its mode.
pub fn ensure_dir(path: &Path, mode: u32, owner: Option<u32>, group: Option<u32>) -> io::Result<()> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => {
            return Err(io::Error::new(
                ErrorKind::AlreadyExists,
                format!("{} exists but is not a directory", path.display()),
            ))
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            fs::DirBuilder::new().recursive(true).mode(mode).create(path)?;
            // DirBuilder is subject to the umask.
            fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
        }
        Err(e) => return Err(e),
    }
    chown(path, owner, group)
}

/// Copy a regular file's bytes and permission bits.
pub fn copy_file(src: &Path, dst: &Path) -> io::Result<u64> {
    fs::copy(src, dst)
}

/// Recursively copy the entries of `src` into `dst`, creating `dst` if needed.
/// Symlinks are recreated, not followed.
pub fn copy_dir_contents(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_symlink() {
            remove_path(&to)?;
            symlink(fs::read_link(&from)?, &to)?;
        } else if file_type.is_dir() {
            copy_dir_contents(&from, &to)?;
            fs::set_permissions(&to, fs::metadata(&from)?.permissions())?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

/// Replace whatever is at `link` with a symlink pointing to `target`.
/// The target is not required to exist; the parent of `link` must.
pub fn replace_with_symlink(target: &Path, link: &Path) -> io::Result<()> {
    remove_path(link)?;
    symlink(target, link)
}

/// Append `text` on its own line unless the file already contains it.
/// Returns whether the file changed.
pub fn append_if_absent(path: &Path, text: &str) -> io::Result<bool> {
    let mut content = fs::read_to_string(path)?;
    if content.contains(text) {
        return Ok(false);
    }
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    content.push_str(text);
    content.push('\n');
    fs::write(path, content)?;
    Ok(true)
}

/// Apply `pattern` to every line, expanding `$n` groups in `replacement`.
/// A final line without a trailing newline is kept as is. Returns the number
/// of lines that matched.
pub fn replace_lines(path: &Path, pattern: &Regex, replacement: &str) -> io::Result<usize> {
    let content = fs::read_to_string(path)?;
    let mut out = String::with_capacity(content.len());
    let mut matched = 0;
    for line in content.split_inclusive('\n') {
        let (body, newline) = match line.strip_suffix('\n') {
            Some(body) => (body, "\n"),
            None => (line, ""),
        };
        if pattern.is_match(body) {
            matched += 1;
            out.push_str(&pattern.replace_all(body, replacement));
        } else {
            out.push_str(body);
        }
        out.push_str(newline);
    }
    if matched > 0 {
        fs::write(path, out)?;
    }
    Ok(matched)
}
