use sha2::{Digest, Sha256};
use std::{
    fs,
    fs::File,
    io,
    io::{Read, Write},
    path::{Path, PathBuf},
};

/// Writes compressed archive bytes to a temporary file, hashing them inline
#[derive(Debug)]
pub struct HashingWriter {
    temp_file: Option<File>,
    temp_path: Option<PathBuf>,
    hasher: Sha256,
    size: u64,
}

impl HashingWriter {
    pub fn create(temp_path: PathBuf) -> io::Result<HashingWriter> {
        let temp_file = File::create(&temp_path)?;
        Ok(HashingWriter {
            temp_file: Some(temp_file),
            temp_path: Some(temp_path),
            hasher: Sha256::new(),
            size: 0,
        })
    }

    /// Delete the temporary file backing this writer, if it's still ours
    pub fn remove_temp(&mut self) {
        self.temp_file = None;
        if let Some(path) = self.temp_path.take() {
            if let Err(err) = fs::remove_file(&path) {
                log::warn!("failed to remove temporary archive {:?}, {}", path, err);
            }
        }
    }

    /// Rename the temporary file into place and detach it from this writer
    pub fn rename_temp(&mut self, dest_path: &Path) -> io::Result<()> {
        if let Some(temp_path) = &self.temp_path {
            fs::rename(temp_path, dest_path)?;
            self.temp_path = None;
        }
        Ok(())
    }

    /// Sync to disk and return the hex digest and byte count
    pub fn finalize(&mut self) -> io::Result<(String, u64)> {
        if let Some(file) = self.temp_file.take() {
            file.sync_all()?;
        }
        Ok((format!("{:x}", self.hasher.clone().finalize()), self.size))
    }
}

impl Write for HashingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .temp_file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "archive writer closed"))?;
        let actual_size = file.write(buf)?;
        self.hasher.update(&buf[..actual_size]);
        self.size += actual_size as u64;
        Ok(actual_size)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.temp_file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for HashingWriter {
    fn drop(&mut self) {
        self.remove_temp();
    }
}

/// Hashes everything read through it
pub struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> HashingReader<R> {
    pub fn new(inner: R) -> Self {
        HashingReader {
            inner,
            hasher: Sha256::new(),
        }
    }

    /// Read the rest of the stream and return its hex digest
    pub fn finish(mut self) -> io::Result<String> {
        io::copy(&mut self, &mut io::sink())?;
        Ok(format!("{:x}", self.hasher.finalize()))
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let actual_size = self.inner.read(buf)?;
        self.hasher.update(&buf[..actual_size]);
        Ok(actual_size)
    }
}
