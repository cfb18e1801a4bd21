use crate::error::IoError;
use berth_supervisor::IoConfig;
use nix::sys::stat::Mode;
use nix::unistd::mkfifo;
use std::path::{Path, PathBuf};
use tracing::debug;

/// The named pipes carrying a task's stdio, in a private directory under the
/// FIFO root.
#[derive(Debug, Clone)]
pub struct FifoSet {
    dir: PathBuf,
    config: IoConfig,
}

impl FifoSet {
    /// Creates `<root>/<unique>/` with `<id>-stdout`, plus `<id>-stdin` when
    /// `stdin` is set and `<id>-stderr` unless `terminal` is.
    pub fn new(root: &Path, id: &str, stdin: bool, terminal: bool) -> Result<Self, IoError> {
        std::fs::create_dir_all(root)?;
        let dir = root.join(uuid::Uuid::new_v4().simple().to_string());
        std::fs::create_dir(&dir)?;

        let set = Self {
            config: IoConfig {
                stdin: stdin.then(|| dir.join(format!("{}-stdin", id))),
                stdout: Some(dir.join(format!("{}-stdout", id))),
                stderr: (!terminal).then(|| dir.join(format!("{}-stderr", id))),
                terminal,
            },
            dir,
        };

        let res = [&set.config.stdin, &set.config.stdout, &set.config.stderr]
            .into_iter()
            .flatten()
            .try_for_each(|path| mkfifo(path.as_path(), Mode::S_IRWXU));
        if let Err(e) = res {
            let _ = std::fs::remove_dir_all(&set.dir);
            return Err(e.into());
        }

        debug!("Created FIFO set for {} in {}", id, set.dir.display());
        Ok(set)
    }

    /// Rebuilds the set of an existing task from the paths it was created
    /// with.
    pub fn from_config(config: IoConfig) -> Self {
        let dir = [&config.stdout, &config.stdin, &config.stderr]
            .into_iter()
            .flatten()
            .find_map(|p| p.parent().map(Path::to_path_buf))
            .unwrap_or_default();
        Self { dir, config }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &IoConfig {
        &self.config
    }

    /// Removes the FIFO directory.
    pub fn close(&self) -> Result<(), IoError> {
        if self.dir.as_os_str().is_empty() {
            return Ok(());
        }
        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
