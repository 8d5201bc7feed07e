//! Ephemeral seekable streams.
//!
//! Request bodies arrive as one-shot streams, but some storage operations want to
//! read their input more than once. [`EphemeralFactory::capture`] spools a body into
//! memory, or into a temporary file when a scratch directory is configured, and
//! hands back a seekable [`EphemeralStream`].

use std::io::{self, Cursor, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};

use camino::Utf8PathBuf;
use tempfile::TempPath;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncSeek, AsyncSeekExt, ReadBuf};

/// Chooses where captured streams are spooled.
#[derive(Debug, Clone, Default)]
pub struct EphemeralFactory {
    scratch: Option<Utf8PathBuf>,
}

impl EphemeralFactory {
    /// Spool to files in `scratch`, or to memory when it is `None`.
    pub fn new(scratch: Option<Utf8PathBuf>) -> Self {
        Self { scratch }
    }

    /// Spool everything to memory.
    pub fn memory() -> Self {
        Self::default()
    }

    /// Read `reader` to the end and return a seekable copy positioned at the start.
    ///
    /// The caller owns the result and should [`destroy`](EphemeralStream::destroy) it
    /// once done. Dropping it also releases the backing storage, without reporting
    /// errors.
    #[tracing::instrument(skip(self, reader), fields(scratch = ?self.scratch))]
    pub async fn capture<R>(&self, reader: &mut R) -> io::Result<EphemeralStream>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        match &self.scratch {
            None => {
                let mut buf = Vec::new();
                tokio::io::copy(reader, &mut buf).await?;
                let len = buf.len() as u64;
                Ok(EphemeralStream {
                    backing: Backing::Memory(Cursor::new(buf)),
                    len,
                })
            }
            Some(dir) => {
                let dir = dir.clone();
                let named = tokio::task::spawn_blocking(move || {
                    tempfile::Builder::new().prefix("chunk-").tempfile_in(dir)
                })
                .await
                .map_err(io::Error::other)??;

                let (file, path) = named.into_parts();
                let mut stream = EphemeralStream {
                    backing: Backing::File {
                        file: File::from_std(file),
                        path,
                    },
                    len: 0,
                };

                // The temp file is removed on drop if copying fails part way.
                if let Backing::File { file, .. } = &mut stream.backing {
                    stream.len = tokio::io::copy(reader, file).await?;
                    file.seek(SeekFrom::Start(0)).await?;
                }
                tracing::trace!(bytes = stream.len, "spooled to scratch file");
                Ok(stream)
            }
        }
    }
}

#[derive(Debug)]
enum Backing {
    Memory(Cursor<Vec<u8>>),
    File { file: File, path: TempPath },
}

/// A seekable, single-owner copy of a request body.
#[derive(Debug)]
pub struct EphemeralStream {
    backing: Backing,
    len: u64,
}

impl EphemeralStream {
    /// Total length of the captured content.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True when nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[cfg(test)]
    fn is_file_backed(&self) -> bool {
        matches!(self.backing, Backing::File { .. })
    }

    #[cfg(test)]
    async fn rewind(&mut self) -> io::Result<()> {
        self.seek(SeekFrom::Start(0)).await.map(|_| ())
    }

    /// Release the backing memory or file.
    pub async fn destroy(self) -> io::Result<()> {
        match self.backing {
            Backing::Memory(_) => Ok(()),
            Backing::File { file, path } => {
                drop(file);
                tokio::task::spawn_blocking(move || path.close())
                    .await
                    .map_err(io::Error::other)?
            }
        }
    }
}

impl AsyncRead for EphemeralStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().backing {
            Backing::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
            Backing::File { file, .. } => Pin::new(file).poll_read(cx, buf),
        }
    }
}

impl AsyncSeek for EphemeralStream {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        match &mut self.get_mut().backing {
            Backing::Memory(cursor) => Pin::new(cursor).start_seek(position),
            Backing::File { file, .. } => Pin::new(file).start_seek(position),
        }
    }

    fn poll_complete(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<u64>> {
        match &mut self.get_mut().backing {
            Backing::Memory(cursor) => Pin::new(cursor).poll_complete(cx),
            Backing::File { file, .. } => Pin::new(file).poll_complete(cx),
        }
    }
}
