//! Transport wrappers.
//!
//! Three interchangeable ways to turn a freshly accepted socket into an
//! authenticated stream plus the peer's client identity. Selection is a
//! one-time decision from configuration, so a tagged variant dispatches
//! statically per connection.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use opal_core::ClientId;
use opal_crypto::{aead, session, SessionKeys};
use opal_keystore::{FsKeyStore, KeyKind};

use crate::error::ProxyError;
use crate::stream::BoxedStream;
use crate::tls;

/// Handshake messages are small; anything larger is a protocol violation.
const MAX_HANDSHAKE_FRAME: u32 = 4096;

/// Payload bytes per encrypted session frame.
const SESSION_CHUNK: usize = 16 * 1024;

pub enum TransportWrapper {
    /// No transformation; identity comes from configuration.
    Raw { client_id: ClientId },
    /// Server-side TLS; identity from the peer certificate unless
    /// overridden.
    Tls {
        acceptor: TlsAcceptor,
        client_id_override: Option<ClientId>,
    },
    /// Mutually-authenticated key exchange against keystore keys.
    SecureSession {
        keystore: Arc<FsKeyStore>,
        server_id: Vec<u8>,
    },
}

impl TransportWrapper {
    /// Authenticate an accepted socket. The caller applies the handshake
    /// deadline; on any error the connection is dropped.
    pub async fn wrap(&self, stream: TcpStream) -> Result<(BoxedStream, ClientId), ProxyError> {
        match self {
            TransportWrapper::Raw { client_id } => Ok((Box::new(stream), client_id.clone())),

            TransportWrapper::Tls {
                acceptor,
                client_id_override,
            } => {
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| ProxyError::Handshake(format!("TLS accept: {e}")))?;

                let client_id = match client_id_override {
                    Some(id) => id.clone(),
                    None => {
                        let (_, conn) = tls_stream.get_ref();
                        let peer = conn
                            .peer_certificates()
                            .and_then(|certs| certs.first())
                            .ok_or_else(|| {
                                ProxyError::Handshake(
                                    "no peer certificate to derive client id from".into(),
                                )
                            })?;
                        tls::client_id_from_cert(peer)?
                    }
                };
                Ok((Box::new(tls_stream), client_id))
            }

            TransportWrapper::SecureSession { keystore, server_id } => {
                secure_session_accept(stream, keystore, server_id).await
            }
        }
    }
}

/// Server side of the secure-session handshake.
async fn secure_session_accept(
    mut stream: TcpStream,
    keystore: &Arc<FsKeyStore>,
    server_id: &[u8],
) -> Result<(BoxedStream, ClientId), ProxyError> {
    let hello = read_handshake_frame(&mut stream).await?;
    let (client_id_bytes, client_eph) =
        session::parse_hello(&hello).map_err(|e| ProxyError::Handshake(e.to_string()))?;
    let client_id = ClientId::new(client_id_bytes.clone())
        .map_err(|e| ProxyError::Handshake(format!("peer identity rejected: {e}")))?;

    // Identity must already be provisioned; an unknown peer fails closed
    // before any key material is derived.
    let client_pub_bytes = keystore
        .get_public_key(KeyKind::TransportConnector, &client_id_bytes)
        .map_err(|e| ProxyError::Handshake(format!("unknown peer {client_id}: {e}")))?;
    let client_pub = opal_crypto::keypair::public_from_bytes(&client_pub_bytes)
        .map_err(|e| ProxyError::Handshake(e.to_string()))?;

    let server_secret = keystore
        .get_private_key(KeyKind::TransportServer, server_id)
        .map_err(|e| ProxyError::Handshake(format!("own transport key: {e}")))?;
    let server_pair = opal_crypto::KeyPair::from_secret_bytes(&server_secret)
        .map_err(|e| ProxyError::Handshake(e.to_string()))?;

    let (response, pending) = session::respond(
        server_id,
        server_pair.secret(),
        &client_id_bytes,
        &client_pub,
        &client_eph,
    )
    .map_err(|e| ProxyError::Handshake(e.to_string()))?;
    write_handshake_frame(&mut stream, &response).await?;

    let confirm = read_handshake_frame(&mut stream).await?;
    let keys = pending
        .finish(&confirm)
        .map_err(|e| ProxyError::Handshake(e.to_string()))?;

    let wrapped = SecureSessionStream::server(stream, keys);
    Ok((Box::new(wrapped), client_id))
}

async fn read_handshake_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>, ProxyError> {
    let len = stream.read_u32().await?;
    if len == 0 || len > MAX_HANDSHAKE_FRAME {
        return Err(ProxyError::Handshake(format!("handshake frame of {len} bytes")));
    }
    let mut buf = vec![0u8; len as usize];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_handshake_frame<S: AsyncWrite + Unpin>(
    stream: &mut S,
    payload: &[u8],
) -> Result<(), ProxyError> {
    stream.write_u32(payload.len() as u32).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

// ── Framed AEAD session stream ───────────────────────────────────────────

enum ReadState {
    Len { buf: [u8; 4], filled: usize },
    Frame { buf: Vec<u8>, filled: usize },
}

/// A byte stream carried over length-framed AEAD records.
///
/// Each frame is `u32 length || nonce || ciphertext+tag`, sealed under the
/// direction key with the frame counter as associated data, so frames
/// cannot be dropped, replayed or reordered without tearing the stream.
pub struct SecureSessionStream<S> {
    inner: S,
    send_key: [u8; 32],
    recv_key: [u8; 32],
    send_counter: u64,
    recv_counter: u64,
    read_state: ReadState,
    /// Decrypted bytes not yet handed to the reader.
    plaintext: Vec<u8>,
    plaintext_pos: usize,
    /// Encrypted bytes not yet written to the transport.
    write_buf: Vec<u8>,
    write_pos: usize,
}

impl<S> SecureSessionStream<S> {
    /// Server role: sends on the server-to-client key.
    pub fn server(inner: S, keys: SessionKeys) -> Self {
        Self::new(inner, keys.server_to_client, keys.client_to_server)
    }

    /// Client role: sends on the client-to-server key.
    pub fn client(inner: S, keys: SessionKeys) -> Self {
        Self::new(inner, keys.client_to_server, keys.server_to_client)
    }

    fn new(inner: S, send_key: [u8; 32], recv_key: [u8; 32]) -> Self {
        Self {
            inner,
            send_key,
            recv_key,
            send_counter: 0,
            recv_counter: 0,
            read_state: ReadState::Len { buf: [0; 4], filled: 0 },
            plaintext: Vec::new(),
            plaintext_pos: 0,
            write_buf: Vec::new(),
            write_pos: 0,
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> SecureSessionStream<S> {
    fn poll_flush_write_buf(&mut self, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        while self.write_pos < self.write_buf.len() {
            let n = std::task::ready!(
                Pin::new(&mut self.inner).poll_write(cx, &self.write_buf[self.write_pos..])
            )?;
            if n == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::WriteZero.into()));
            }
            self.write_pos += n;
        }
        self.write_buf.clear();
        self.write_pos = 0;
        Poll::Ready(Ok(()))
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for SecureSessionStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.plaintext_pos < this.plaintext.len() {
                let available = &this.plaintext[this.plaintext_pos..];
                let n = available.len().min(buf.remaining());
                buf.put_slice(&available[..n]);
                this.plaintext_pos += n;
                if this.plaintext_pos == this.plaintext.len() {
                    this.plaintext.clear();
                    this.plaintext_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }

            match &mut this.read_state {
                ReadState::Len { buf: len_buf, filled } => {
                    while *filled < 4 {
                        let mut tmp = ReadBuf::new(&mut len_buf[*filled..]);
                        std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, &mut tmp))?;
                        let n = tmp.filled().len();
                        if n == 0 {
                            // Clean EOF only between frames.
                            if *filled == 0 {
                                return Poll::Ready(Ok(()));
                            }
                            return Poll::Ready(Err(std::io::ErrorKind::UnexpectedEof.into()));
                        }
                        *filled += n;
                    }
                    let len = u32::from_be_bytes(*len_buf) as usize;
                    if len < aead::OVERHEAD || len > SESSION_CHUNK + aead::OVERHEAD {
                        return Poll::Ready(Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "session frame length out of range",
                        )));
                    }
                    this.read_state = ReadState::Frame { buf: vec![0; len], filled: 0 };
                }
                ReadState::Frame { buf: frame_buf, filled } => {
                    while *filled < frame_buf.len() {
                        let mut tmp = ReadBuf::new(&mut frame_buf[*filled..]);
                        std::task::ready!(Pin::new(&mut this.inner).poll_read(cx, &mut tmp))?;
                        let n = tmp.filled().len();
                        if n == 0 {
                            return Poll::Ready(Err(std::io::ErrorKind::UnexpectedEof.into()));
                        }
                        *filled += n;
                    }
                    let aad = this.recv_counter.to_be_bytes();
                    let opened = aead::decrypt(&this.recv_key, frame_buf, &aad).map_err(|_| {
                        std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "session frame failed to authenticate",
                        )
                    })?;
                    this.recv_counter += 1;
                    this.plaintext = opened.to_vec();
                    this.plaintext_pos = 0;
                    this.read_state = ReadState::Len { buf: [0; 4], filled: 0 };
                }
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for SecureSessionStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_flush_write_buf(cx))?;

        let chunk = &data[..data.len().min(SESSION_CHUNK)];
        let aad = this.send_counter.to_be_bytes();
        let sealed = aead::encrypt(&this.send_key, chunk, &aad)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?;
        this.send_counter += 1;

        this.write_buf
            .extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        this.write_buf.extend_from_slice(&sealed);

        // Kick the transport; buffered bytes drain on the next call.
        let _ = this.poll_flush_write_buf(cx)?;
        Poll::Ready(Ok(chunk.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_flush_write_buf(cx))?;
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        std::task::ready!(this.poll_flush_write_buf(cx))?;
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Client side of the secure-session handshake. The proxy itself only
/// accepts sessions; this lives here for the connector and the tests.
pub async fn secure_session_connect<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    client_id: &ClientId,
    client_secret: &opal_crypto::x25519_dalek::StaticSecret,
    server_id: &[u8],
    server_pub: &opal_crypto::x25519_dalek::PublicKey,
) -> Result<SecureSessionStream<S>, ProxyError> {
    let (hello, handshake) = session::initiate(client_id.as_bytes(), server_id)
        .map_err(|e| ProxyError::Handshake(e.to_string()))?;
    write_handshake_frame(&mut stream, &hello).await?;

    let response = read_handshake_frame(&mut stream).await?;
    let (confirm, keys) = handshake
        .finish(client_secret, server_pub, &response)
        .map_err(|e| ProxyError::Handshake(e.to_string()))?;
    write_handshake_frame(&mut stream, &confirm).await?;

    Ok(SecureSessionStream::client(stream, keys))
}
