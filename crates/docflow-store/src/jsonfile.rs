//! JSON-lines file [`Store`] implementation.
//!
//! Documents are held in an inner [`MemoryStore`] and written through to a
//! JSON-lines file on every mutation. The file is replaced atomically
//! (write to a temporary sibling, then rename).

use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use docflow_types::{Criteria, Document, Query};

use crate::error::{Result, StoreError};
use crate::memory::MemoryStore;
use crate::store::{DocStream, Store};

/// File-backed document store using one JSON object per line.
pub struct JsonFileStore {
    inner: MemoryStore,
    path: PathBuf,
    loaded: AtomicBool,
}

impl JsonFileStore {
    /// Create a store backed by `path` with the default key and
    /// last-updated fields. The file is created on first write.
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            inner: MemoryStore::new(name),
            path: path.into(),
            loaded: AtomicBool::new(false),
        }
    }

    /// Create a store backed by `path` with explicit key and last-updated
    /// fields.
    pub fn with_fields(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        key: impl Into<String>,
        last_updated_field: impl Into<String>,
    ) -> Self {
        Self {
            inner: MemoryStore::with_fields(name, key, last_updated_field),
            path: path.into(),
            loaded: AtomicBool::new(false),
        }
    }

    /// The backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<()> {
        if !self.path.exists() {
            return Ok(());
        }
        let file = fs::File::open(&self.path)?;
        let mut docs = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(&line)?;
            let doc = Document::from_value(value).ok_or_else(|| {
                StoreError::InvalidSpec(format!(
                    "non-object line in {}",
                    self.path.display()
                ))
            })?;
            docs.push(doc);
        }
        if !docs.is_empty() {
            tracing::debug!(
                path = %self.path.display(),
                docs = docs.len(),
                "loaded documents from disk"
            );
            self.inner.update(docs, None)?;
        }
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            for doc in self.inner.dump()? {
                let line = serde_json::to_string(&doc)?;
                writeln!(file, "{line}")?;
            }
            file.flush()?;
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl Store for JsonFileStore {
    fn name(&self) -> String {
        format!("json://{}", self.path.display())
    }

    fn key(&self) -> &str {
        self.inner.key()
    }

    fn last_updated_field(&self) -> &str {
        self.inner.last_updated_field()
    }

    fn connect(&self) -> Result<()> {
        self.inner.connect()?;
        if !self.loaded.swap(true, Ordering::SeqCst) {
            self.load()?;
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }

    fn count(&self, criteria: &Criteria) -> Result<u64> {
        self.inner.count(criteria)
    }

    fn query(&self, query: &Query) -> Result<DocStream> {
        self.inner.query(query)
    }

    fn update(&self, docs: Vec<Document>, key_fields: Option<&[String]>) -> Result<()> {
        self.inner.update(docs, key_fields)?;
        self.persist()
    }

    fn remove_docs(&self, criteria: &Criteria) -> Result<u64> {
        let removed = self.inner.remove_docs(criteria)?;
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    fn ensure_index(&self, field: &str, unique: bool) -> Result<bool> {
        self.inner.ensure_index(field, unique)
    }
}
