//! Unified byte-stream type for wrapped connections.

use tokio::io::{AsyncRead, AsyncWrite};

/// Anything the pipeline can pump frames over: a raw TCP stream, a TLS
/// stream, or a secure-session stream.
pub trait NetStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> NetStream for T {}

impl std::fmt::Debug for dyn NetStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn NetStream>")
    }
}

/// Owned boxed stream handed from the wrapper to the pipeline.
pub type BoxedStream = Box<dyn NetStream>;
