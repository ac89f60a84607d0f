use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PhotoError {
    #[error("invalid photo filename: {0:?}")]
    InvalidName(String),
    #[error("photo already exists: {0}")]
    Exists(String),
    #[error("photo not found: {0}")]
    NotFound(String),
    #[error("photo I/O on {photo_ref}: {source}")]
    Io {
        photo_ref: String,
        #[source]
        source: std::io::Error,
    },
}

/// Storage for enrollment photos.
///
/// A photo reference is an opaque string handed out by [`PhotoStore::save`]
/// and used as the embedding cache key. Callers never parse it.
pub trait PhotoStore: Send + Sync {
    /// Encoded image bytes of a stored photo.
    fn load(&self, photo_ref: &str) -> Result<Vec<u8>, PhotoError>;
    fn exists(&self, photo_ref: &str) -> bool;
    /// Remove a photo. Removing a missing photo is not an error.
    fn delete(&self, photo_ref: &str) -> Result<(), PhotoError>;
    /// Store `bytes` under `filename`, refusing to overwrite. Returns the reference.
    fn save(&self, filename: &str, bytes: &[u8]) -> Result<String, PhotoError>;
    /// Reference a photo saved under `filename` would get.
    fn photo_ref(&self, filename: &str) -> Result<String, PhotoError>;
}

/// Photos as files in one directory; references are full paths.
pub struct FsPhotoStore {
    root: PathBuf,
}

impl FsPhotoStore {
    /// Open the photo directory, creating it if needed.
    pub fn open(root: &Path) -> Result<Self, PhotoError> {
        fs::create_dir_all(root).map_err(|source| PhotoError::Io {
            photo_ref: root.display().to_string(),
            source,
        })?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, filename: &str) -> Result<PathBuf, PhotoError> {
        let plain = !filename.is_empty()
            && filename != "."
            && filename != ".."
            && !filename.contains(['/', '\\', '\0']);
        if !plain {
            return Err(PhotoError::InvalidName(filename.to_string()));
        }
        Ok(self.root.join(filename))
    }
}

impl PhotoStore for FsPhotoStore {
    fn load(&self, photo_ref: &str) -> Result<Vec<u8>, PhotoError> {
        fs::read(photo_ref).map_err(|source| match source.kind() {
            ErrorKind::NotFound => PhotoError::NotFound(photo_ref.to_string()),
            _ => PhotoError::Io {
                photo_ref: photo_ref.to_string(),
                source,
            },
        })
    }

    fn exists(&self, photo_ref: &str) -> bool {
        Path::new(photo_ref).is_file()
    }

    fn delete(&self, photo_ref: &str) -> Result<(), PhotoError> {
        match fs::remove_file(photo_ref) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PhotoError::Io {
                photo_ref: photo_ref.to_string(),
                source,
            }),
        }
    }

    fn save(&self, filename: &str, bytes: &[u8]) -> Result<String, PhotoError> {
        let path = self.path_for(filename)?;
        let photo_ref = path.to_string_lossy().into_owned();
        let io_err = |source| PhotoError::Io {
            photo_ref: photo_ref.clone(),
            source,
        };

        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(PhotoError::Exists(photo_ref));
            }
            Err(e) => return Err(io_err(e)),
        };
        if let Err(e) = file.write_all(bytes).and_then(|()| file.sync_all()) {
            let _ = fs::remove_file(&path);
            return Err(io_err(e));
        }

        tracing::debug!(photo_ref = %photo_ref, bytes = bytes.len(), "photo saved");
        Ok(photo_ref)
    }

    fn photo_ref(&self, filename: &str) -> Result<String, PhotoError> {
        Ok(self.path_for(filename)?.to_string_lossy().into_owned())
    }
}
