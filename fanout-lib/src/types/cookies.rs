use std::io::ErrorKind as IoErrorKind;
use std::{path::PathBuf, sync::Arc};

use crate::{ErrorKind, Result};
use log::info;
use reqwest_cookie_store::{CookieStore as ReqwestCookieStore, CookieStoreMutex};

/// Cookie store shared by every session-bound connection handle, optionally
/// backed by a JSON file.
#[derive(Debug, Clone)]
pub struct CookieJar {
    path: Option<PathBuf>,
    inner: Arc<CookieStoreMutex>,
}

impl Default for CookieJar {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl CookieJar {
    /// An empty jar that is never persisted
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: Arc::new(CookieStoreMutex::new(ReqwestCookieStore::default())),
        }
    }

    /// Load a cookie jar from a JSON file.
    /// A missing file yields an empty jar which is created on [`CookieJar::save`].
    ///
    /// # Errors
    ///
    /// This function will return an error if
    /// - the file exists but cannot be opened or
    /// - the file is not valid JSON
    pub fn load(path: PathBuf) -> Result<Self> {
        match std::fs::File::open(&path).map(std::io::BufReader::new) {
            Ok(reader) => {
                info!("Loading cookies from {}", path.display());
                let store = ReqwestCookieStore::load_json(reader)
                    .map_err(|e| ErrorKind::Cookies(format!("Failed to load cookies: {e}")))?;
                Ok(Self {
                    path: Some(path),
                    inner: Arc::new(CookieStoreMutex::new(store)),
                })
            }
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(Self {
                path: Some(path),
                ..Self::in_memory()
            }),
            Err(e) => Err((path, e).into()),
        }
    }

    /// File the jar is persisted to, if any
    #[must_use]
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    /// Handle to the underlying store, as handed to connection handles
    #[must_use]
    pub fn store(&self) -> Arc<CookieStoreMutex> {
        Arc::clone(&self.inner)
    }

    /// Number of unexpired cookies in the jar
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map_or(0, |store| store.iter_unexpired().count())
    }

    /// Whether the jar holds no unexpired cookies
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Save the jar as JSON, overwriting the file it was loaded from.
    /// In-memory jars are not persisted.
    ///
    /// # Errors
    ///
    /// This function will return an error if
    /// - the cookie store lock is poisoned or
    /// - the file cannot be created or written to
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut file =
            std::fs::File::create(path).map_err(|e| ErrorKind::from((path.clone(), e)))?;
        info!("Saving cookies to {}", path.display());
        self.inner
            .lock()
            .map_err(|e| ErrorKind::Cookies(format!("Failed to lock cookie store: {e}")))?
            .save_json(&mut file)
            .map_err(|e| ErrorKind::Cookies(format!("Failed to save cookies: {e}")))
    }
}

impl PartialEq for CookieJar {
    fn eq(&self, other: &Self) -> bool {
        // Same backing store, or the same file on disk
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.path.is_some() && self.path == other.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    #[test]
    fn test_missing_file_gives_empty_jar() {
        let dir = tempfile::tempdir().unwrap();
        let jar = CookieJar::load(dir.path().join("cookies.json")).unwrap();
        assert!(jar.is_empty());
        assert!(jar.path().is_some());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        let jar = CookieJar::load(path.clone()).unwrap();

        let url = Url::parse("https://example.com/").unwrap();
        jar.store()
            .lock()
            .unwrap()
            .parse("session=abc; Max-Age=3600", &url)
            .unwrap();
        jar.save().unwrap();

        let reloaded = CookieJar::load(path).unwrap();
        assert_eq!(reloaded.len(), 1);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            CookieJar::load(path),
            Err(ErrorKind::Cookies(_))
        ));
    }

    #[test]
    fn test_in_memory_jar_is_not_saved() {
        assert!(CookieJar::in_memory().save().is_ok());
    }
}
