use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// `<dir>/<process>.pid`, removed again when the guard drops.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn create(dir: &Path, process: &str) -> io::Result<Self> {
        let path = dir.join(format!("{process}.pid"));
        fs::write(&path, format!("{}\n", std::process::id()))?;
        tracing::debug!(path = %path.display(), "pid file written");
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "cannot remove pid file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn written_and_removed() {
        let dir = std::env::temp_dir();
        let name = format!("sedadb-pidfile-test-{}", std::process::id());
        let pid = PidFile::create(&dir, &name).unwrap();
        let path = pid.path().to_path_buf();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
        drop(pid);
        assert!(!path.exists());
    }
}
