use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::SourceConfig;
use crate::error::ScanError;

/// Discovers the input files of one source.
pub struct DirectoryScanner {
    input_directory: PathBuf,
    extensions: Vec<String>,
    include: Vec<glob::Pattern>,
    recursive: bool,
}

impl DirectoryScanner {
    pub fn new<P: AsRef<Path>>(input_directory: P) -> Self {
        Self {
            input_directory: input_directory.as_ref().to_path_buf(),
            extensions: Vec::new(),
            include: Vec::new(),
            recursive: false,
        }
    }

    pub fn from_source(source: &SourceConfig) -> Result<Self, ScanError> {
        let mut scanner = Self::new(&source.directory)
            .with_extensions(source.extensions.iter().cloned())
            .recursive(source.recursive);
        for pattern in &source.include {
            scanner = scanner.with_include(pattern)?;
        }
        Ok(scanner)
    }

    pub fn with_extensions<I: IntoIterator<Item = String>>(mut self, extensions: I) -> Self {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
        self
    }

    pub fn with_include(mut self, pattern: &str) -> Result<Self, ScanError> {
        let compiled = glob::Pattern::new(pattern).map_err(|e| ScanError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        self.include.push(compiled);
        Ok(self)
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn input_directory(&self) -> &Path {
        &self.input_directory
    }

    /// Returns matching files in lexical path order.
    pub fn scan(&self) -> Result<Vec<PathBuf>, ScanError> {
        if !self.input_directory.is_dir() {
            return Err(ScanError::MissingDirectory(self.input_directory.clone()));
        }

        let mut walker = WalkDir::new(&self.input_directory).min_depth(1);
        if !self.recursive {
            walker = walker.max_depth(1);
        }

        let mut files = Vec::new();
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) if e.depth() == 0 => {
                    return Err(ScanError::Walk {
                        path: self.input_directory.clone(),
                        source: e,
                    });
                }
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.path();
            if self.accepts(path) {
                debug!("Found input file: {}", path.display());
                files.push(path.to_path_buf());
            }
        }

        files.sort();

        info!(
            "Scanned {} files in {}",
            files.len(),
            self.input_directory.display()
        );
        Ok(files)
    }

    fn accepts(&self, path: &Path) -> bool {
        if !self.extensions.is_empty() {
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .map(str::to_lowercase);
            match ext {
                Some(ext) if self.extensions.contains(&ext) => {}
                _ => return false,
            }
        }

        if !self.include.is_empty() {
            let relative = path.strip_prefix(&self.input_directory).unwrap_or(path);
            if !self.include.iter().any(|p| p.matches_path(relative)) {
                return false;
            }
        }

        true
    }
}
