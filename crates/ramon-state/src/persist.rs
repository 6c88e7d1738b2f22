use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;
use tracing::{debug, warn};

/// 确保父目录存在
fn ensure_parent_dir(path: &Path) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// 原子写入：先写临时文件再 rename
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    ensure_parent_dir(path)?;

    let tmp_path = path.with_extension("tmp");
    {
        let mut tmp = File::create(&tmp_path)?;
        tmp.write_all(data)?;
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;

    debug!(path = %path.display(), size = data.len(), "State file written");
    Ok(())
}

/// 追加一行（记录以换行结束）
pub fn append_line(path: &Path, line: &str) -> io::Result<()> {
    ensure_parent_dir(path)?;

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut record = String::with_capacity(line.len() + 1);
    record.push_str(line);
    record.push('\n');
    file.write_all(record.as_bytes())?;
    file.sync_data()
}

/// 读取追加日志中的完整行
///
/// 崩溃可能留下没有换行结尾的半条记录，读取时将其截断，
/// 保证后续追加不会与残缺记录拼接。
pub fn read_complete_lines(path: &Path) -> io::Result<Vec<String>> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut data = Vec::new();
    file.read_to_end(&mut data)?;

    let complete_len = match data.iter().rposition(|&b| b == b'\n') {
        Some(pos) => pos + 1,
        None => 0,
    };
    if complete_len < data.len() {
        warn!(
            path = %path.display(),
            dropped = data.len() - complete_len,
            "Truncating partial record at end of state log"
        );
        file.set_len(complete_len as u64)?;
    }

    Ok(String::from_utf8_lossy(&data[..complete_len])
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect())
}

/// 冷却时间与滑动窗口的快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub cooldowns: HashMap<String, DateTime<Utc>>,
    pub windows: HashMap<String, Vec<DateTime<Utc>>>,
}

impl StateSnapshot {
    pub fn save(&self, path: &Path) -> ramon_core::Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &data)
            .map_err(|e| ramon_core::RamonError::Persistence(format!("{}: {}", path.display(), e)))
    }

    /// 文件不存在时返回空快照
    pub fn load(path: &Path) -> ramon_core::Result<Self> {
        match fs::read(path) {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(ramon_core::RamonError::Persistence(format!("{}: {}", path.display(), e))),
        }
    }
}
