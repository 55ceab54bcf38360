//! 音频目录批量提交

use std::path::Path;

use anyhow::{Context, Result};
use taskmesh_core::TaskEnvelope;

/// 把目录中的 `*.mp3` 文件按文件名排序后转换为转写任务，索引从0开始
pub fn transcription_tasks(dir: &Path) -> Result<Vec<TaskEnvelope>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("读取音频目录失败: {}", dir.display()))?;

    let mut files = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("读取音频目录失败: {}", dir.display()))?
            .path();
        let is_mp3 = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("mp3"));
        if path.is_file() && is_mp3 {
            files.push(path);
        }
    }
    files.sort();

    Ok(files
        .iter()
        .enumerate()
        .map(|(index, path)| {
            TaskEnvelope::transcription(index as u64, path.to_string_lossy().into_owned())
        })
        .collect())
}
