//! Streaming digest verification.
//!
//! [`DigestVerifier`] wraps an [`AsyncRead`] and hashes everything that passes
//! through it. The size and digest checks run when the inner reader reports end of
//! stream, so a mismatch surfaces as a read error at the point a consumer would
//! otherwise have accepted the content.

use std::error::Error as StdError;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use pin_project::pin_project;
use tokio::io::{AsyncRead, ReadBuf};

use crate::digest::{Digest, Hasher};

/// Declared size meaning "not known up front"; disables the size check.
pub const UNKNOWN_SIZE: u64 = u64::MAX;

/// Verification failure reported at end of stream.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VerifyError {
    /// The stream was shorter or longer than declared.
    #[error("expected {expected} bytes, read {read}")]
    SizeMismatch {
        /// Declared size.
        expected: u64,
        /// Bytes actually read.
        read: u64,
    },

    /// The content hash does not match the declared digest.
    #[error("expected digest {expected}, computed {computed} over {read} bytes")]
    DigestMismatch {
        /// Declared digest.
        expected: Digest,
        /// Digest of the bytes read.
        computed: Digest,
        /// Bytes actually read.
        read: u64,
    },
}

impl VerifyError {
    /// Find a verification failure anywhere in an error's source chain.
    ///
    /// Verification errors travel wrapped in [`io::Error`]s, and often again inside a
    /// storage error. An `io::Error` reports its payload's source rather than the
    /// payload itself, so the payload is visited explicitly.
    pub fn find(error: &(dyn StdError + 'static)) -> Option<VerifyError> {
        let mut current = Some(error);
        while let Some(error) = current {
            if let Some(verify) = error.downcast_ref::<VerifyError>() {
                return Some(verify.clone());
            }
            current = match error.downcast_ref::<io::Error>().and_then(|io| io.get_ref()) {
                Some(inner) => Some(inner as &(dyn StdError + 'static)),
                None => error.source(),
            };
        }
        None
    }
}

impl From<VerifyError> for io::Error {
    fn from(error: VerifyError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, error)
    }
}

/// A reader which verifies size and digest of the content it yields.
#[derive(Debug)]
#[pin_project]
pub struct DigestVerifier<R> {
    #[pin]
    inner: R,
    hasher: Option<Hasher>,
    expected: Digest,
    size: u64,
    read: u64,
}

impl<R> DigestVerifier<R> {
    /// Verify `inner` against `expected`, and against `size` unless it is [`UNKNOWN_SIZE`].
    pub fn new(inner: R, expected: Digest, size: u64) -> Self {
        Self {
            inner,
            hasher: Some(expected.algorithm().hasher()),
            expected,
            size,
            read: 0,
        }
    }

    /// Bytes read so far.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    fn check(expected: &Digest, size: u64, read: u64, hasher: Hasher) -> Result<(), VerifyError> {
        if size != UNKNOWN_SIZE && size != read {
            return Err(VerifyError::SizeMismatch {
                expected: size,
                read,
            });
        }

        let computed = hasher.finalize();
        if &computed != expected {
            return Err(VerifyError::DigestMismatch {
                expected: expected.clone(),
                computed,
                read,
            });
        }
        Ok(())
    }
}

impl<R: AsyncRead> AsyncRead for DigestVerifier<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        let filled = &buf.filled()[before..];

        if !filled.is_empty() {
            *this.read += filled.len() as u64;
            if let Some(hasher) = this.hasher.as_mut() {
                hasher.update(filled);
            }
            return Poll::Ready(Ok(()));
        }

        // End of stream: verify once, then keep reporting EOF.
        match this.hasher.take() {
            Some(hasher) => {
                Self::check(this.expected, *this.size, *this.read, hasher)?;
                tracing::trace!(digest = %this.expected, bytes = *this.read, "verified stream");
                Poll::Ready(Ok(()))
            }
            None => Poll::Ready(Ok(())),
        }
    }
}

/// A reader which holds its content to an exact length.
///
/// Unlike [`DigestVerifier`], an overrun is reported as soon as it is seen rather
/// than at end of stream.
#[derive(Debug)]
#[pin_project]
pub struct LengthVerifier<R> {
    #[pin]
    inner: R,
    size: u64,
    read: u64,
    done: bool,
}

impl<R> LengthVerifier<R> {
    /// Require exactly `size` bytes from `inner`, unless it is [`UNKNOWN_SIZE`].
    pub fn new(inner: R, size: u64) -> Self {
        Self {
            inner,
            size,
            read: 0,
            done: false,
        }
    }
}

impl<R: AsyncRead> AsyncRead for LengthVerifier<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        let filled = (buf.filled().len() - before) as u64;
        *this.read += filled;

        if *this.size == UNKNOWN_SIZE || *this.done {
            return Poll::Ready(Ok(()));
        }
        if *this.read > *this.size || (filled == 0 && *this.read != *this.size) {
            *this.done = true;
            return Poll::Ready(Err(VerifyError::SizeMismatch {
                expected: *this.size,
                read: *this.read,
            }
            .into()));
        }
        Poll::Ready(Ok(()))
    }
}
