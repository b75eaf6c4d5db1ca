use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::TaskError;

/// 把任务产出 (目录或文件) 打包成同级的 `<name>.tar.gz`，返回归档路径
pub fn compress(path: &Path) -> Result<PathBuf, TaskError> {
    if !path.exists() {
        return Err(TaskError::Archive(format!(
            "{} does not exist",
            path.display()
        )));
    }
    let (Some(parent), Some(name)) = (path.parent(), path.file_name()) else {
        return Err(TaskError::Archive(format!(
            "cannot archive {}",
            path.display()
        )));
    };
    let archive = parent.join(format!("{}.tar.gz", name.to_string_lossy()));

    // -C 切到父目录，归档里只保留相对路径

    let output = Command::new("tar")
        .arg("-czf")
        .arg(&archive)
        .arg("-C")
        .arg(parent)
        .arg(name)
        .output()
        .map_err(|e| TaskError::Archive(format!("tar: {}", e)))?;
    if !output.status.success() {
        // 半成品归档不能留下
        if let Err(e) = std::fs::remove_file(&archive) {
            tracing::warn!("Could not remove partial archive {}: {}", archive.display(), e);
        }
        return Err(TaskError::Archive(format!(
            "tar failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    tracing::info!("Compressed {} into {}", path.display(), archive.display());
    Ok(archive)
}
