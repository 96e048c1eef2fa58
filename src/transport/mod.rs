//! Byte-transport abstraction.
//!
//! QLIC runs over any ordered, reliable byte stream and never learns
//! whether the underlying link is Bluetooth-backed or a TCP socket. The
//! [`ByteTransport`] trait is the whole boundary: read bytes, write
//! bytes, and a hint for how much the link comfortably absorbs per
//! transmit.

use std::future::Future;
use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::TcpStream;

use crate::core::DEFAULT_ESTIMATED_TRANSMIT_SIZE;

/// An ordered, reliable byte stream.
///
/// The returned futures are `Send` so a connection can run on any
/// multi-threaded runtime.
pub trait ByteTransport: Send {
    /// Read available bytes into `buf`. Returns 0 at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<usize>> + Send;

    /// Write all of `bytes`.
    fn write_all(&mut self, bytes: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// How many bytes the link comfortably absorbs per transmit interval.
    fn preferred_transmit_size(&self) -> usize {
        DEFAULT_ESTIMATED_TRANSMIT_SIZE
    }
}

/// TCP-backed transport.
#[derive(Debug)]
pub struct TcpLink {
    stream: TcpStream,
    preferred_transmit_size: usize,
}

impl TcpLink {
    /// Connect to a remote endpoint.
    pub async fn connect(addr: &str) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an established TCP stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        Self {
            stream,
            preferred_transmit_size: DEFAULT_ESTIMATED_TRANSMIT_SIZE,
        }
    }

    /// Override the transmit-size hint.
    pub fn with_preferred_transmit_size(mut self, size: usize) -> Self {
        self.preferred_transmit_size = size;
        self
    }
}

impl ByteTransport for TcpLink {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    fn preferred_transmit_size(&self) -> usize {
        self.preferred_transmit_size
    }
}

/// In-memory duplex transport, for tests and same-process links.
#[derive(Debug)]
pub struct DuplexLink {
    stream: DuplexStream,
    preferred_transmit_size: usize,
}

impl DuplexLink {
    /// Create a connected pair of links with the given buffer size.
    pub fn pair(buffer: usize) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(buffer);
        (Self::from_stream(a), Self::from_stream(b))
    }

    /// Wrap one end of a duplex stream.
    pub fn from_stream(stream: DuplexStream) -> Self {
        Self {
            stream,
            preferred_transmit_size: DEFAULT_ESTIMATED_TRANSMIT_SIZE,
        }
    }
}

impl ByteTransport for DuplexLink {
    async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf).await
    }

    async fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await
    }

    fn preferred_transmit_size(&self) -> usize {
        self.preferred_transmit_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplex_roundtrip() {
        let (mut a, mut b) = DuplexLink::pair(1024);
        a.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 16];
        let n = b.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn test_duplex_eof_on_drop() {
        let (a, mut b) = DuplexLink::pair(1024);
        drop(a);

        let mut buf = [0u8; 16];
        assert_eq!(b.read(&mut buf).await.unwrap(), 0);
    }
}
