//! Small-value reads and writes on control filesystems
//!
//! sysfs, cgroupfs and resctrl files hold one short value each. Every access
//! is bounded by [`IO_TIMEOUT`] so a wedged kernel interface cannot stall the
//! control loop.

use crate::error::{QosError, Result};
use std::future::Future;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Upper bound for a single control-file access
pub const IO_TIMEOUT: Duration = Duration::from_secs(5);

async fn bounded<T, F>(path: &Path, fut: F) -> Result<T>
where
    F: Future<Output = std::io::Result<T>>,
{
    match tokio::time::timeout(IO_TIMEOUT, fut).await {
        Ok(result) => result.map_err(|e| QosError::io(path, e)),
        Err(_) => Err(QosError::Timeout {
            what: format!("access to {}", path.display()),
            timeout: IO_TIMEOUT,
        }),
    }
}

/// Read a whole control file
pub async fn read_to_string(path: &Path) -> Result<String> {
    bounded(path, fs::read_to_string(path)).await
}

/// Read the first line of a control file, without its newline
pub async fn read_first_line(path: &Path) -> Result<String> {
    let content = read_to_string(path).await?;
    Ok(content.lines().next().unwrap_or_default().trim().to_string())
}

/// Read and parse the first line of a control file
pub async fn read_value<T>(path: &Path) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let line = read_first_line(path).await?;
    line.parse()
        .map_err(|e: T::Err| QosError::parse(path, format!("{:?}: {}", line, e)))
}

/// Replace the content of a control file with `value`
pub async fn write_value(path: &Path, value: &str) -> Result<()> {
    bounded(path, fs::write(path, value.as_bytes())).await
}

/// Append `value` to a control file without truncating it
///
/// Membership files such as resctrl `tasks` take one id per write.
pub async fn append_value(path: &Path, value: &str) -> Result<()> {
    bounded(path, async {
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(value.as_bytes()).await?;
        file.flush().await
    })
    .await
}

/// List the names of the subdirectories of `path`
pub async fn list_subdirs(path: &Path) -> Result<Vec<String>> {
    bounded(path, async {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    })
    .await
}

/// List every entry name of `path`, including symlinks
pub async fn list_entries(path: &Path) -> Result<Vec<String>> {
    bounded(path, async {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
        names.sort();
        Ok(names)
    })
    .await
}

/// Parse a kernel cpu list such as `0-3,8,10-11`
pub fn parse_cpu_list(list: &str) -> Option<Vec<usize>> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',').filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((start, end)) => {
                let start: usize = start.trim().parse().ok()?;
                let end: usize = end.trim().parse().ok()?;
                if end < start {
                    return None;
                }
                cpus.extend(start..=end);
            }
            None => cpus.push(part.trim().parse().ok()?),
        }
    }
    Some(cpus)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_cpu_list() {
        assert_eq!(parse_cpu_list("0-3"), Some(vec![0, 1, 2, 3]));
        assert_eq!(parse_cpu_list("0"), Some(vec![0]));
        assert_eq!(parse_cpu_list("0-1,4,6-7\n"), Some(vec![0, 1, 4, 6, 7]));
        assert_eq!(parse_cpu_list("3-1"), None);
        assert_eq!(parse_cpu_list("a-b"), None);
    }

    #[tokio::test]
    async fn test_read_and_write_values() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("cpu.cfs_period_us");

        write_value(&path, "100000\n").await.unwrap();
        let period: u64 = read_value(&path).await.unwrap();
        assert_eq!(period, 100000);

        write_value(&path, "-1").await.unwrap();
        let quota: i64 = read_value(&path).await.unwrap();
        assert_eq!(quota, -1);
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let err = read_first_line(&temp_dir.path().join("missing"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_parse_error_names_path() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("physical_package_id");
        write_value(&path, "zero\n").await.unwrap();

        let err = read_value::<u32>(&path).await.unwrap_err();
        assert!(matches!(err, QosError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_append_keeps_previous_values() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tasks");

        append_value(&path, "100\n").await.unwrap();
        append_value(&path, "101\n").await.unwrap();
        assert_eq!(read_to_string(&path).await.unwrap(), "100\n101\n");
    }

    #[tokio::test]
    async fn test_list_subdirs_skips_files() {
        let temp_dir = TempDir::new().unwrap();
        tokio::fs::create_dir(temp_dir.path().join("b")).await.unwrap();
        tokio::fs::create_dir(temp_dir.path().join("a")).await.unwrap();
        tokio::fs::write(temp_dir.path().join("tasks"), "1\n")
            .await
            .unwrap();

        let dirs = list_subdirs(temp_dir.path()).await.unwrap();
        assert_eq!(dirs, vec!["a".to_string(), "b".to_string()]);
    }
}
