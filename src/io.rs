use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
#[error("{action} {}: {source}", .path.display())]
pub struct FileError {
    pub action: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

impl FileError {
    fn logged(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        let err = FileError { action, path: path.to_path_buf(), source };
        tracing::error!("{err}");
        err
    }
}

pub async fn load_text(path: &Path) -> Result<String, FileError> {
    fs::read_to_string(path)
        .await
        .map_err(|e| FileError::logged("failed to load file", path, e))
}

async fn truncate(path: &Path) -> Result<(), FileError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| FileError::logged("failed to create directory", parent, e))?;
    }
    File::create(path)
        .await
        .map(drop)
        .map_err(|e| FileError::logged("failed to initialize file", path, e))
}

/// Create or empty both the output and the log file.
pub async fn initialize_files(output: &Path, log: &Path) -> Result<(), FileError> {
    truncate(output).await?;
    truncate(log).await
}

/// Write one response per line, replacing whatever the file held.
pub async fn save_to_file<S: AsRef<str>>(responses: &[S], output: &Path) -> Result<(), FileError> {
    let mut body = String::new();
    for r in responses {
        body.push_str(r.as_ref());
        body.push('\n');
    }
    fs::write(output, body)
        .await
        .map_err(|e| FileError::logged("failed to save to file", output, e))
}

/// Append-only run log. Owned by a single writer.
pub struct RunLog {
    path: PathBuf,
    file: File,
}

impl RunLog {
    pub async fn open(path: &Path) -> Result<Self, FileError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| FileError::logged("failed to open log file", path, e))?;
        Ok(Self { path: path.to_path_buf(), file })
    }

    pub async fn append(&mut self, line: &str) -> Result<(), FileError> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        self.file
            .write_all(buf.as_bytes())
            .await
            .map_err(|e| FileError::logged("failed to log to file", &self.path, e))?;
        self.file
            .flush()
            .await
            .map_err(|e| FileError::logged("failed to log to file", &self.path, e))
    }
}

pub fn chunk_count_line(n: usize) -> String {
    format!("Number of chunks: {n}")
}

pub fn outcome_line(index: usize, ok: bool) -> String {
    if ok {
        format!("Successfully processed chunk {index}")
    } else {
        format!("Failed to process chunk {index}")
    }
}
