//! Class-file sources.
//!
//! Class bytes come either from a preloaded in-memory image (the boot
//! classes) or from directory classpath entries scanned at startup. The
//! same lookup backs `Class.getResourceAsStream`.

use crate::error::VmError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_log::log::debug;
use walkdir::WalkDir;

/// Preloaded classes and resources keyed by their classpath-relative name.
#[derive(Default)]
pub struct MemoryImage {
    entries: HashMap<String, Arc<[u8]>>,
}

impl MemoryImage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, bytes: impl Into<Arc<[u8]>>) {
        self.entries.insert(name.into(), bytes.into());
    }

    /// Adds a class by internal name, deriving the `.class` entry name.
    pub fn add_class(&mut self, internal_name: &str, bytes: impl Into<Arc<[u8]>>) {
        self.add(format!("{}.class", internal_name), bytes);
    }

    fn open(&self, name: &str) -> Option<Arc<[u8]>> {
        self.entries.get(name).cloned()
    }
}

struct DirSource {
    root: PathBuf,
    entries: HashMap<String, PathBuf>,
}

impl DirSource {
    fn scan(root: &Path) -> Self {
        let mut entries = HashMap::new();

        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if entry.file_type().is_file() {
                if let Ok(rel) = entry.path().strip_prefix(root) {
                    let name = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    entries.insert(name, entry.path().to_path_buf());
                }
            }
        }

        Self {
            root: root.to_path_buf(),
            entries,
        }
    }

    fn open(&self, name: &str) -> Option<Result<Vec<u8>, VmError>> {
        let path = self.entries.get(name)?;
        Some(std::fs::read(path).map_err(VmError::from))
    }
}

pub struct ClassPath {
    image: MemoryImage,
    dirs: Vec<DirSource>,
}

impl ClassPath {
    pub fn new(image: MemoryImage, dirs: &[PathBuf]) -> Self {
        let dirs = dirs
            .iter()
            .map(|root| {
                debug!("scanning classpath entry {:?}", root);
                DirSource::scan(root)
            })
            .collect();

        Self { image, dirs }
    }

    /// Reads the class file of `name` (internal form).
    pub fn read_class(&self, name: &str) -> Result<Arc<[u8]>, VmError> {
        let entry = format!("{}.class", name);

        if let Some(bytes) = self.image.open(&entry) {
            debug!("class {:?} found in the boot image", name);
            return Ok(bytes);
        }

        for dir in &self.dirs {
            if let Some(bytes) = dir.open(&entry) {
                debug!("class {:?} found under {:?}", name, dir.root);
                return Ok(Arc::from(bytes?));
            }
        }

        Err(VmError::NoClassDefFound(format!("class {} not found", name)))
    }

    /// Streaming read of an arbitrary classpath resource, for
    /// `Class.getResourceAsStream`.
    pub fn read_resource(&self, name: &str) -> Option<Arc<[u8]>> {
        let name = name.trim_start_matches('/');

        if let Some(bytes) = self.image.open(name) {
            return Some(bytes);
        }

        for dir in &self.dirs {
            if let Some(Ok(bytes)) = dir.open(name) {
                return Some(Arc::from(bytes));
            }
        }

        None
    }
}
