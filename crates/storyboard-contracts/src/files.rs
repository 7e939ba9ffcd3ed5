use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{bail, Context};
use serde_json::{Map, Value};
use tempfile::NamedTempFile;

const LOCK_POLL: Duration = Duration::from_millis(5);
const LOCK_WAIT: Duration = Duration::from_secs(10);
/// Holders only keep the lock for one read-modify-write, so an older lock
/// file was left behind by a process that died.
const STALE_LOCK_AGE: Duration = Duration::from_secs(30);

/// Exclusive lock on `<file>.lock`, shared by every process and every
/// in-process handle that opens the same path. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    pub fn acquire(target: &Path) -> anyhow::Result<Self> {
        let path = lock_path(target);
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let started = SystemTime::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self { path });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&path) {
                        let _ = fs::remove_file(&path);
                        continue;
                    }
                    if started.elapsed().unwrap_or_default() > LOCK_WAIT {
                        bail!("timed out waiting for {}", path.display());
                    }
                    thread::sleep(LOCK_POLL);
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("failed creating {}", path.display()))
                }
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn lock_path(target: &Path) -> PathBuf {
    let mut raw = target.as_os_str().to_owned();
    raw.push(".lock");
    PathBuf::from(raw)
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.elapsed().ok())
        .is_some_and(|age| age > STALE_LOCK_AGE)
}

/// Reads a JSON object file. A missing file is an empty object; anything
/// that exists but does not parse as an object is an error.
pub fn read_json_object(path: &Path) -> anyhow::Result<Map<String, Value>> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Map::new()),
        Err(err) => {
            return Err(err).with_context(|| format!("failed reading {}", path.display()))
        }
    };
    let value: Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("{} does not hold a JSON object", path.display()),
    }
}

/// Replaces `path` in one rename so readers see either the old or the new
/// contents, never a partial write.
pub fn write_json_atomic(path: &Path, payload: &Value) -> anyhow::Result<()> {
    let parent = match path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        Some(parent) => parent,
        None => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let mut temp = NamedTempFile::new_in(parent)
        .with_context(|| format!("failed staging write to {}", path.display()))?;
    temp.write_all(serde_json::to_string_pretty(payload)?.as_bytes())?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("failed replacing {}", path.display()))?;
    Ok(())
}
