//! The TLS seam: a record-protocol adapter interface the connection drives.
//!
//! The engine does not ship a cryptographic backend. A [`TlsProvider`]
//! implementation owns the handshake, record parsing, and alert lifecycle;
//! the connection owns the sockets and buffers and reacts to what the
//! provider reports. Ciphertext the socket could not take is buffered
//! inside the provider and flushed on write readiness via
//! [`TlsProvider::send_buffered_data`].
//!
//! Providers never call back into the connection. They write ciphertext
//! through the [`TlsSink`] handed into each call, append decrypted bytes to
//! the connection-owned plaintext buffer, and report lifecycle transitions
//! through [`TlsUpdate`] flags or an [`SslError`]. The connection turns
//! those into the user-facing callbacks on its own terms, outside its
//! state lock.

use std::io::{Error, ErrorKind};
use std::path::PathBuf;

use thiserror::Error as ThisError;

use crate::buffer::Buffer;

/// TLS failure kinds surfaced to the user's SSL-error callback. Any of
/// these forces the connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ThisError)]
pub enum SslError {
    #[error("TLS handshake failed")]
    Handshake,
    #[error("peer certificate validation failed")]
    InvalidCertificate,
    #[error("TLS protocol violation")]
    Protocol,
}

/// Configuration handed to a provider factory.
#[derive(Debug, Clone)]
pub struct TlsPolicy {
    pub hostname: Option<String>,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
    pub ca_path: Option<PathBuf>,
    pub validate_cert: bool,
}

impl TlsPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn with_cert_and_key(
        mut self,
        cert_path: impl Into<PathBuf>,
        key_path: impl Into<PathBuf>,
    ) -> Self {
        self.cert_path = Some(cert_path.into());
        self.key_path = Some(key_path.into());
        self
    }

    pub fn with_ca_path(mut self, ca_path: impl Into<PathBuf>) -> Self {
        self.ca_path = Some(ca_path.into());
        self
    }

    pub fn with_validate_cert(mut self, validate: bool) -> Self {
        self.validate_cert = validate;
        self
    }
}

impl Default for TlsPolicy {
    fn default() -> Self {
        Self {
            hostname: None,
            cert_path: None,
            key_path: None,
            ca_path: None,
            validate_cert: true,
        }
    }
}

/// Lifecycle transitions a provider reports from a receive pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct TlsUpdate {
    /// The handshake just completed; the connection fires its
    /// connection/upgrade callback.
    pub handshake_finished: bool,
    /// The peer sent a close alert; the connection starts a graceful
    /// shutdown.
    pub close_alert: bool,
}

/// The provider's only way to reach the wire: a synchronous raw write on
/// the connection's socket. A short or [`std::io::ErrorKind::WouldBlock`]
/// write means the provider must keep the rest buffered.
pub trait TlsSink {
    fn write_raw(&mut self, data: &[u8]) -> Result<usize, Error>;
}

/// A TLS record-protocol adapter bound to one connection.
pub trait TlsProvider: Send {
    /// Begin the handshake (client hello, or arm the server side).
    fn start_encryption(&mut self, sink: &mut dyn TlsSink) -> Result<(), Error>;

    /// Drain `ciphertext` (the connection's receive buffer), appending any
    /// decrypted bytes to `plaintext` and writing any handshake/alert
    /// ciphertext through `sink`.
    fn recv_data(
        &mut self,
        ciphertext: &mut Buffer,
        plaintext: &mut Buffer,
        sink: &mut dyn TlsSink,
    ) -> Result<TlsUpdate, SslError>;

    /// Encrypt and send application bytes, buffering whatever the socket
    /// does not take. Returns the number of plaintext bytes accepted.
    fn send_data(&mut self, plaintext: &[u8], sink: &mut dyn TlsSink) -> Result<usize, Error>;

    /// Flush previously buffered ciphertext. Returns true once nothing is
    /// left pending.
    fn send_buffered_data(&mut self, sink: &mut dyn TlsSink) -> Result<bool, Error>;

    /// Ciphertext accepted from the application but not yet on the wire.
    fn buffered_data(&self) -> &Buffer;

    /// Send a close alert to the peer.
    fn close(&mut self, sink: &mut dyn TlsSink);
}

/// Build a provider for `policy`.
///
/// No backend is compiled into this crate, so this always fails at
/// runtime; inject an implementation through
/// [`crate::connection::TcpConnection::start_encryption_with`] instead.
pub fn new_tls_provider(
    _policy: &TlsPolicy,
    _is_server: bool,
) -> Result<Box<dyn TlsProvider>, Error> {
    Err(Error::new(
        ErrorKind::Unsupported,
        "no TLS provider is built into this crate",
    ))
}
