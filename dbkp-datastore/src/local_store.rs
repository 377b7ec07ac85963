//! Local filesystem storage backend.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use tokio_util::sync::CancellationToken;

use dbkp_tools::error::{Error, Result};

use crate::object_store::{ObjectStore, META_SIZE_MAX};

const COPY_BLOCK_SIZE: usize = 64 * 1024;

/// Filesystem based object store.
///
/// Writes go to `<name>.tmp` first and become visible with a rename, so
/// concurrent readers and crashes never observe partial objects.
pub struct LocalStore {
    base: PathBuf,
    cancel: CancellationToken,
}

impl LocalStore {
    pub fn open<P: Into<PathBuf>>(base: P, cancel: CancellationToken) -> Result<Self> {
        let base: PathBuf = base.into();
        std::fs::create_dir_all(&base).map_err(|err| {
            Error::Resource(format!("unable to create storage root {base:?} - {err}"))
        })?;
        Ok(Self { base, cancel })
    }

    fn object_path(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name);
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => {
                    return Err(Error::Config(format!(
                        "invalid object name '{name}' - only plain relative paths are allowed"
                    )));
                }
            }
        }
        Ok(self.base.join(relative))
    }

    fn write_atomic(&self, path: &Path, data: &mut dyn Read) -> Result<u64> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp_path = path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let result = (|| -> Result<u64> {
            let mut file = std::fs::File::create(&tmp_path)?;
            let mut buffer = [0u8; COPY_BLOCK_SIZE];
            let mut total: u64 = 0;
            loop {
                if self.cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                let count = match data.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(count) => count,
                    Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => return Err(Error::from_io(err)),
                };
                file.write_all(&buffer[..count])?;
                total += count as u64;
            }
            file.flush()?;
            std::fs::rename(&tmp_path, path)?;
            Ok(total)
        })();

        if result.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        result
    }
}

impl ObjectStore for LocalStore {
    fn save(&self, name: &str, data: &mut dyn Read) -> Result<String> {
        let path = self.object_path(name)?;
        self.write_atomic(&path, data)?;
        Ok(format!("{}/{name}", self.location()))
    }

    fn open(&self, name: &str) -> Result<Box<dyn Read + Send>> {
        let path = self.object_path(name)?;
        let file = std::fs::File::open(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(name.to_string()),
            _ => Error::from_io(err),
        })?;
        Ok(Box::new(std::io::BufReader::new(file)))
    }

    fn exists(&self, name: &str) -> Result<bool> {
        let path = self.object_path(name)?;
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.is_file()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(Error::from_io(err)),
        }
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.object_path(name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(Error::from_io(err)),
        }
    }

    fn put_meta(&self, name: &str, data: &[u8]) -> Result<()> {
        if data.len() > META_SIZE_MAX {
            return Err(Error::Config(format!(
                "metadata object '{name}' exceeds {META_SIZE_MAX} bytes"
            )));
        }
        let path = self.object_path(name)?;
        self.write_atomic(&path, &mut &data[..])?;
        Ok(())
    }

    fn get_meta(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.object_path(name)?;
        std::fs::read(&path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(name.to_string()),
            _ => Error::from_io(err),
        })
    }

    fn list_meta(&self, prefix: &str) -> Result<Vec<String>> {
        let chunk_listing = prefix.starts_with("chunks/") || prefix == "chunks";
        let mut names = Vec::new();

        for entry in walkdir::WalkDir::new(&self.base) {
            let entry = entry
                .map_err(|err| Error::Resource(format!("listing storage failed - {err}")))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(&self.base)
                .expect("walkdir stays under base");
            let name = relative.to_string_lossy().replace('\\', "/");

            if name.ends_with(".tmp") {
                continue;
            }
            if !chunk_listing && name.starts_with("chunks/") {
                continue;
            }
            if name.starts_with(prefix) {
                names.push(name);
            }
        }

        Ok(names)
    }

    fn modified(&self, name: &str) -> Result<Option<SystemTime>> {
        let path = self.object_path(name)?;
        match std::fs::metadata(&path) {
            Ok(meta) => Ok(meta.modified().ok()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(name.to_string()))
            }
            Err(err) => Err(Error::from_io(err)),
        }
    }

    fn location(&self) -> String {
        format!("local://{}", self.base.display())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_store(name: &str) -> (PathBuf, LocalStore) {
        let path = std::env::current_dir()
            .unwrap()
            .join(format!(".testdir-local-{name}"));
        if let Err(_e) = std::fs::remove_dir_all(&path) { /* ignore */ }
        let store = LocalStore::open(&path, CancellationToken::new()).unwrap();
        (path, store)
    }

    #[test]
    fn save_open_delete_cycle() -> Result<()> {
        let (path, store) = test_store("cycle");

        store.save("a.sql", &mut &b"dump contents"[..])?;
        assert!(store.exists("a.sql")?);

        let mut out = Vec::new();
        store.open("a.sql")?.read_to_end(&mut out)?;
        assert_eq!(out, b"dump contents");

        store.delete("a.sql")?;
        assert!(!store.exists("a.sql")?);
        // idempotent
        store.delete("a.sql")?;

        assert!(store.open("missing").unwrap_err().is_not_found());

        std::fs::remove_dir_all(&path).unwrap();
        Ok(())
    }

    #[test]
    fn listing_hides_chunks_and_tmp_files() -> Result<()> {
        let (path, store) = test_store("listing");

        store.put_meta("a.sql.manifest", b"{}")?;
        store.save("chunks/abcd", &mut &b"x"[..])?;
        std::fs::write(path.join("partial.tmp"), b"x")?;

        let mut names = store.list_meta("")?;
        names.sort();
        assert_eq!(names, vec!["a.sql.manifest"]);

        let chunk_names = store.list_meta("chunks/")?;
        assert_eq!(chunk_names, vec!["chunks/abcd"]);

        std::fs::remove_dir_all(&path).unwrap();
        Ok(())
    }

    #[test]
    fn path_escapes_are_rejected() {
        let (path, store) = test_store("escape");
        assert!(matches!(
            store.open("../outside"),
            Err(Error::Config(_))
        ));
        assert!(matches!(
            store.save("/etc/passwd", &mut &b""[..]),
            Err(Error::Config(_))
        ));
        std::fs::remove_dir_all(&path).unwrap();
    }

    #[test]
    fn cancelled_token_aborts_saves() {
        let (path, store) = test_store("cancel");
        store.cancel.cancel();
        assert!(matches!(
            store.save("a", &mut &b"data"[..]),
            Err(Error::Cancelled)
        ));
        assert!(!path.join("a").exists());
        std::fs::remove_dir_all(&path).unwrap();
    }
}
