use anyhow::{Context, Result, bail};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

const LOCK_FILE_NAME: &str = ".sboforge.lock";
const STATE_FILE_NAME: &str = ".sboforge-session.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionState {
    pid: u32,
    packages: Vec<String>,
    started_at_utc: String,
}

/// Exclusive ownership of a workspace dotdir for the lifetime of one run.
/// The downloads, worker roots and status files are shared state; a second
/// session against the same dotdir fails fast with the owner's details.
#[derive(Debug)]
pub struct SessionGuard {
    lock_file: fs::File,
    state_file: PathBuf,
}

impl SessionGuard {
    pub fn acquire(dotdir: &Path, packages: &[String]) -> Result<Self> {
        fs::create_dir_all(dotdir)
            .with_context(|| format!("creating workspace {}", dotdir.display()))?;
        let lock_path = dotdir.join(LOCK_FILE_NAME);
        let state_file = dotdir.join(STATE_FILE_NAME);
        let mut lock_file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("opening lock file {}", lock_path.display()))?;

        if let Err(err) = lock_file.try_lock_exclusive() {
            if err.kind() == ErrorKind::WouldBlock {
                let owner = load_state(&state_file)
                    .map(|state| {
                        format!("pid={} packages={}", state.pid, state.packages.join(","))
                    })
                    .unwrap_or_else(|_| "unknown".to_string());
                bail!(
                    "workspace {} is already in use: {owner}",
                    dotdir.display()
                );
            }
            return Err(err)
                .with_context(|| format!("acquiring workspace lock {}", lock_path.display()));
        }

        let pid = std::process::id();
        let state = SessionState {
            pid,
            packages: packages.to_vec(),
            started_at_utc: chrono::Utc::now().to_rfc3339(),
        };
        write_state(&state_file, &state)?;

        lock_file
            .set_len(0)
            .with_context(|| format!("truncating lock file {}", lock_path.display()))?;
        writeln!(lock_file, "pid={pid}")
            .with_context(|| format!("writing lock file {}", lock_path.display()))?;

        Ok(Self {
            lock_file,
            state_file,
        })
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.state_file);
        let _ = self.lock_file.unlock();
    }
}

fn load_state(path: &Path) -> Result<SessionState> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading session state {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("parsing session state {}", path.display()))
}

fn write_state(path: &Path, state: &SessionState) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let payload = serde_json::to_vec_pretty(state).context("serializing session state")?;
    fs::write(&tmp, payload)
        .with_context(|| format!("writing session temp state {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("committing session state {}", path.display()))?;
    Ok(())
}
