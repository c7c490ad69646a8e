//! Line-delimited JSON alert files.
//!
//! `path` may name one file or a directory; a directory contributes every
//! `*.jsonl` file inside it, in sorted order. Blank lines are ignored and
//! lines that fail to decode or validate are skipped and counted.

use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use crate::core::config::SourceSettings;
use crate::core::errors::{IngestError, Result};
use crate::model::alert::AlertRecord;
use crate::source::{AlertIter, AlertSource};

/// File-backed source.
#[derive(Debug)]
pub struct JsonlSource {
    path: PathBuf,
    files: Vec<PathBuf>,
    next_file: usize,
    current: Option<(PathBuf, BufReader<File>)>,
    line: Vec<u8>,
    skipped: u64,
    connected: bool,
}

impl JsonlSource {
    /// Registry name.
    pub const NAME: &'static str = "jsonl";

    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            files: Vec::new(),
            next_file: 0,
            current: None,
            line: Vec::new(),
            skipped: 0,
            connected: false,
        }
    }

    /// Build from settings; `path` is required.
    pub fn from_settings(settings: &SourceSettings) -> Result<Self> {
        let path = settings
            .path
            .clone()
            .ok_or_else(|| IngestError::InvalidConfig {
                details: "source.path is required for the jsonl source".to_string(),
            })?;
        Ok(Self::new(path))
    }

    /// Files discovered by `connect`.
    #[must_use]
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    fn fetch_error(&self, details: String) -> IngestError {
        IngestError::SourceFetch {
            source_name: Self::NAME.to_string(),
            details,
        }
    }

    /// Read the next raw line into `self.line`, advancing through files as
    /// they run out. Bytes are not decoded here, so only I/O can fail.
    fn next_line(&mut self) -> Option<Result<()>> {
        loop {
            if let Some((path, reader)) = self.current.as_mut() {
                self.line.clear();
                match reader.read_until(b'\n', &mut self.line) {
                    Ok(0) => self.current = None,
                    Ok(_) => return Some(Ok(())),
                    Err(error) => {
                        let details = format!("read {}: {error}", path.display());
                        self.current = None;
                        return Some(Err(self.fetch_error(details)));
                    }
                }
                continue;
            }

            let path = self.files.get(self.next_file)?.clone();
            self.next_file += 1;
            match File::open(&path) {
                Ok(file) => self.current = Some((path, BufReader::new(file))),
                Err(error) => {
                    let details = format!("open {}: {error}", path.display());
                    return Some(Err(self.fetch_error(details)));
                }
            }
        }
    }

    fn next_record(&mut self) -> Option<Result<AlertRecord>> {
        loop {
            if let Err(error) = self.next_line()? {
                return Some(Err(error));
            }
            let Ok(text) = std::str::from_utf8(&self.line) else {
                self.skipped += 1;
                continue;
            };
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            match AlertRecord::from_json(trimmed) {
                Ok(record) => return Some(Ok(record)),
                Err(_) => self.skipped += 1,
            }
        }
    }
}

impl AlertSource for JsonlSource {
    fn source_name(&self) -> &str {
        Self::NAME
    }

    fn connect(&mut self) -> Result<()> {
        let files = discover(&self.path).map_err(|details| IngestError::SourceConnect {
            source_name: Self::NAME.to_string(),
            details,
        })?;
        self.files = files;
        self.next_file = 0;
        self.current = None;
        self.connected = true;
        Ok(())
    }

    fn fetch_alerts(&mut self, limit: Option<u64>) -> Result<AlertIter<'_>> {
        if !self.connected {
            return Err(self.fetch_error("source not connected".to_string()));
        }
        let mut remaining = limit;
        Ok(Box::new(std::iter::from_fn(move || {
            if remaining == Some(0) {
                return None;
            }
            let item = self.next_record()?;
            if let Some(left) = remaining.as_mut() {
                *left -= 1;
            }
            Some(item)
        })))
    }

    fn close(&mut self) {
        self.current = None;
        self.line.clear();
        self.connected = false;
    }

    fn records_skipped(&self) -> u64 {
        self.skipped
    }
}

fn discover(path: &Path) -> std::result::Result<Vec<PathBuf>, String> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.is_dir() {
        return Err(format!("{} does not exist", path.display()));
    }
    let entries = fs::read_dir(path).map_err(|error| format!("{}: {error}", path.display()))?;
    let mut files: Vec<PathBuf> = entries
        .filter_map(std::result::Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "jsonl"))
        .collect();
    files.sort();
    if files.is_empty() {
        return Err(format!("no .jsonl files in {}", path.display()));
    }
    Ok(files)
}
