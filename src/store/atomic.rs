use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static ATOMIC_COUNTER: AtomicU64 = AtomicU64::new(0);
pub(crate) const TEMP_PREFIX: &str = ".vichange.tmp.";

pub fn atomic_write(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut staged = StagedOutput::new();
    staged.stage(path, bytes)?;
    staged.commit()
}

/// A set of stage outputs written to temp files first and renamed into place
/// together. Nothing under the final names changes until `commit`, so a
/// stage that fails midway leaves the previous run's files intact.
#[derive(Debug, Default)]
pub struct StagedOutput {
    entries: Vec<(PathBuf, PathBuf)>,
}

impl StagedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage(&mut self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let parent = parent_dir(path)?;
        fs::create_dir_all(&parent)?;

        let tmp_path = temp_path_in_parent(&parent, path)?;
        let mut tmp_file = create_temp_file(&tmp_path)?;
        let write_result = (|| -> io::Result<()> {
            tmp_file.write_all(bytes)?;
            tmp_file.flush()?;
            tmp_file.sync_all()
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }
        self.entries.push((tmp_path, path.to_path_buf()));
        Ok(())
    }

    pub fn commit(mut self) -> io::Result<()> {
        let entries = std::mem::take(&mut self.entries);
        for (idx, (tmp_path, final_path)) in entries.iter().enumerate() {
            if let Err(err) = rename_overwrite(tmp_path, final_path) {
                for (leftover, _) in &entries[idx..] {
                    let _ = fs::remove_file(leftover);
                }
                return Err(err);
            }
        }
        for (_, final_path) in &entries {
            sync_parent_dir(&parent_dir(final_path)?)?;
        }
        Ok(())
    }
}

impl Drop for StagedOutput {
    fn drop(&mut self) {
        for (tmp_path, _) in &self.entries {
            let _ = fs::remove_file(tmp_path);
        }
    }
}

fn parent_dir(path: &Path) -> io::Result<PathBuf> {
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Ok(PathBuf::from(".")),
        Some(parent) => Ok(parent.to_path_buf()),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("path `{}` has no parent directory", path.display()),
        )),
    }
}

fn create_temp_file(path: &Path) -> io::Result<File> {
    OpenOptions::new().create_new(true).write(true).open(path)
}

fn rename_overwrite(from: &Path, to: &Path) -> io::Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) => {
            if to.exists() {
                fs::remove_file(to)?;
                fs::rename(from, to)
            } else {
                Err(err)
            }
        }
    }
}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> io::Result<()> {
    File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> io::Result<()> {
    Ok(())
}

fn temp_path_in_parent(parent: &Path, final_path: &Path) -> io::Result<PathBuf> {
    let file_name = final_path
        .file_name()
        .and_then(|value| value.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "invalid target filename"))?;
    let epoch_nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|err| io::Error::other(err.to_string()))?
        .as_nanos();
    let counter = ATOMIC_COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp_name = format!(
        "{TEMP_PREFIX}{file_name}.{epoch_nanos}.{}.{}",
        std::process::id(),
        counter
    );
    Ok(parent.join(tmp_name))
}
