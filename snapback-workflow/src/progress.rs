//! Transfer reporter: an [`AsyncRead`] wrapper that reports every read

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use snapback_models::TransferProgress;
use tokio::io::{AsyncRead, ReadBuf};

type Observer = Box<dyn FnMut(TransferProgress) + Send>;

/// Counts bytes as they are read and emits one [`TransferProgress`] per non-empty read
pub struct ProgressReader<R> {
    inner: R,
    moved: u64,
    total: u64,
    observer: Observer,
}

impl<R> ProgressReader<R> {
    pub fn new(inner: R, total: u64, observer: impl FnMut(TransferProgress) + Send + 'static) -> Self {
        Self {
            inner,
            moved: 0,
            total,
            observer: Box::new(observer),
        }
    }

    /// Reporter that writes one log line per read
    pub fn logging(inner: R, total: u64, name: String) -> Self {
        Self::new(inner, total, move |progress| {
            tracing::info!(name = %name, "Uploaded {}", progress);
        })
    }

    pub fn bytes_moved(&self) -> u64 {
        self.moved
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProgressReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;

        let n = buf.filled().len() - before;
        if n > 0 {
            this.moved += n as u64;
            (this.observer)(TransferProgress::new(this.moved, this.total));
        }
        Poll::Ready(Ok(()))
    }
}
