//! Local filesystem transport: a URL is a path, so placement-group members
//! are directories such as `/srv/node1/`.

use super::{RemoteFile, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::File;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default)]
pub struct FsTransport;

impl FsTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for FsTransport {
    async fn open(&self, url: &str) -> Result<Box<dyn RemoteFile>, TransportError> {
        let file = tokio::fs::File::open(url)
            .await
            .map_err(|e| TransportError::io(url, e))?
            .into_std()
            .await;
        Ok(Box::new(FsFile {
            url: url.to_string(),
            file: Mutex::new(Some(Arc::new(file))),
        }))
    }
}

/// An open file read with positioned reads, so concurrent reads of one
/// container never wait on each other.
struct FsFile {
    url: String,
    file: Mutex<Option<Arc<File>>>,
}

impl FsFile {
    fn handle(&self) -> Result<Arc<File>, TransportError> {
        self.file.lock().clone().ok_or_else(|| TransportError::Closed {
            url: self.url.clone(),
        })
    }

    /// Run a blocking operation on the file off the async workers.
    async fn blocking<T, F>(&self, op: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&File) -> std::io::Result<T> + Send + 'static,
    {
        let file = self.handle()?;
        tokio::task::spawn_blocking(move || op(&file))
            .await
            .map_err(|e| TransportError::Io {
                url: self.url.clone(),
                reason: e.to_string(),
            })?
            .map_err(|e| TransportError::io(&self.url, e))
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, offset)? {
            0 => return Err(std::io::ErrorKind::UnexpectedEof.into()),
            n => {
                buf = &mut buf[n..];
                offset += n as u64;
            }
        }
    }
    Ok(())
}

#[async_trait]
impl RemoteFile for FsFile {
    fn url(&self) -> &str {
        &self.url
    }

    async fn size(&self) -> Result<u64, TransportError> {
        self.blocking(|file| Ok(file.metadata()?.len())).await
    }

    async fn read_at(&self, offset: u64, length: usize) -> Result<Bytes, TransportError> {
        let read = self
            .blocking(move |file| {
                let size = file.metadata()?.len();
                if offset > size {
                    return Ok(Err(size));
                }
                let length = length.min((size - offset) as usize);
                let mut buf = vec![0u8; length];
                read_exact_at(file, &mut buf, offset)?;
                Ok(Ok(Bytes::from(buf)))
            })
            .await?;

        read.map_err(|size| TransportError::OutOfRange {
            url: self.url.clone(),
            offset,
            length,
            size,
        })
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.file.lock().take();
        Ok(())
    }
}
