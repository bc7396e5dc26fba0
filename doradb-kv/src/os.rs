use crate::error::Result;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// File and directory primitives the engine and its callers rely on.
///
/// All calls are synchronous.
pub trait Os: Send + Sync {
    fn exists(&self, path: &Path) -> bool;

    /// Create the directory and any missing parent.
    fn mkdir(&self, path: &Path) -> Result<()>;

    /// Remove an empty directory.
    fn rmdir(&self, path: &Path) -> Result<()>;

    /// List file names (not paths) inside a directory.
    fn dirlist(&self, path: &Path) -> Result<Vec<String>>;

    fn unlink(&self, path: &Path) -> Result<()>;

    fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    fn read(&self, path: &Path) -> Result<Vec<u8>>;

    /// Replace the file content atomically.
    fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    /// Append to the end of file, creating it if absent.
    /// Returns the file length after the write.
    fn append(&self, path: &Path, data: &[u8], sync: bool) -> Result<u64>;
}

/// Os implementation on top of std::fs.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdOs;

impl Os for StdOs {
    #[inline]
    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    #[inline]
    fn mkdir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }

    #[inline]
    fn rmdir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path)?;
        Ok(())
    }

    fn dirlist(&self, path: &Path) -> Result<Vec<String>> {
        let mut names = vec![];
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    #[inline]
    fn unlink(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }

    #[inline]
    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to)?;
        Ok(())
    }

    #[inline]
    fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(fs::read(path)?)
    }

    fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = Path::new(&tmp);
        {
            let mut f = fs::File::create(tmp)?;
            f.write_all(data)?;
            f.sync_data()?;
        }
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn append(&self, path: &Path, data: &[u8], sync: bool) -> Result<u64> {
        let mut f = OpenOptions::new().create(true).append(true).open(path)?;
        f.write_all(data)?;
        if sync {
            f.sync_data()?;
        }
        Ok(f.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_std_os_file_ops() {
        let dir = tempfile::tempdir().unwrap();
        let os = StdOs;
        let sub = dir.path().join("a").join("b");
        os.mkdir(&sub).unwrap();
        assert!(os.exists(&sub));

        let f = sub.join("log.0000000001");
        assert_eq!(os.append(&f, b"abc", false).unwrap(), 3);
        assert_eq!(os.append(&f, b"de", true).unwrap(), 5);
        assert_eq!(os.read(&f).unwrap(), b"abcde");

        let g = sub.join("data");
        os.write(&g, b"snapshot").unwrap();
        assert_eq!(os.read(&g).unwrap(), b"snapshot");
        assert_eq!(
            os.dirlist(&sub).unwrap(),
            vec!["data".to_string(), "log.0000000001".to_string()]
        );

        os.unlink(&f).unwrap();
        os.unlink(&g).unwrap();
        os.rmdir(&sub).unwrap();
        assert!(!os.exists(&sub));
        assert_eq!(os.unlink(&f), Err(crate::error::Error::NoEnt));
    }
}
