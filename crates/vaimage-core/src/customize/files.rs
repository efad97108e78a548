use crate::image::within_root;
use crate::CoreError;
use regex::Regex;
use std::path::Path;
use tracing::{debug, info};
use vaimage_runtime::fsutil;
use vaimage_schema::{EditAction, FileEdit};

pub(crate) fn apply(root: &Path, e: &FileEdit) -> Result<(), CoreError> {
    let target = within_root(root, &e.path);
    if !target.is_file() {
        debug!("{} does not exist, edit skipped", target.display());
        return Ok(());
    }
    if e.new_pattern.is_empty() {
        return Err(CoreError::Config(format!(
            "edit of {}: NewPattern is empty",
            e.path
        )));
    }
    let pattern = match e.action {
        EditAction::Append => None,
        EditAction::Replace if e.old_pattern.is_empty() => {
            return Err(CoreError::Config(format!(
                "replace in {}: OldPattern is empty",
                e.path
            )));
        }
        EditAction::Replace => Some(Regex::new(&e.old_pattern).map_err(|source| {
            CoreError::Pattern {
                pattern: e.old_pattern.clone(),
                source,
            }
        })?),
    };

    if let Some(backup) = &e.backup {
        let backup_path = within_root(root, backup);
        fsutil::copy_file(&target, &backup_path).map_err(CoreError::fs("back up", &target))?;
        debug!("backed up {} to {}", target.display(), backup_path.display());
    }

    match pattern {
        None => {
            let changed = fsutil::append_if_absent(&target, &e.new_pattern)
                .map_err(CoreError::fs("append to", &target))?;
            if changed {
                info!("appended to {}", e.path);
            } else {
                debug!("{} already contains the appended text", e.path);
            }
        }
        Some(re) => {
            let lines = fsutil::replace_lines(&target, &re, &e.new_pattern)
                .map_err(CoreError::fs("edit", &target))?;
            info!("{}: replaced {lines} line(s)", e.path);
        }
    }
    Ok(())
}
