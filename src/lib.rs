//! # Description
//!
//! This crate is a readiness-driven TCP connection engine. An
//! [`EventLoop`] owns a set of [`TcpConnection`]s; each connection owns an
//! established nonblocking socket and interleaves inbound byte delivery
//! with an ordered outbound pipeline that mixes in-memory bytes, regular
//! file ranges, pull-driven byte streams, and externally pushed async
//! streams in one FIFO. Bytes reach the wire in exactly the order the
//! `send*` calls were made.
//!
//! # Threading model
//!
//! A connection is pinned to one event loop, and every state transition
//! happens on that loop's thread. The public API may be called from any
//! thread: off-thread calls copy their payload and post a task through the
//! loop's queue, so user callbacks always run on the loop thread and never
//! need their own locking.
//!
//! # Backpressure
//!
//! A send the socket cannot take immediately lands in the connection's
//! write queue and write readiness drains it. Crossing the configured
//! high-water mark fires a notification callback; the rest is native
//! socket buffering.
//!
//! # TLS
//!
//! Encryption is a seam, not a bundled backend: implement [`TlsProvider`]
//! (or inject one from another crate) and the connection routes all bytes
//! through it, delivering decrypted plaintext to the ordinary message
//! callback. Without a provider, `start_encryption` fails at runtime and
//! everything else works in plaintext.
//!
//! # Examples
//!
//! ## An echo server connection
//!
//! The acceptor is left to the caller; hand any established
//! [`std::net::TcpStream`] to the engine:
//!
//! ```no_run
//! use evtcp::{EventLoop, TcpConnection};
//!
//! let mut event_loop = EventLoop::new().unwrap();
//! let handle = event_loop.handle();
//! std::thread::spawn(move || event_loop.run());
//!
//! let listener = std::net::TcpListener::bind("127.0.0.1:4321").unwrap();
//! let (stream, _) = listener.accept().unwrap();
//!
//! let conn = TcpConnection::new(handle, stream).unwrap();
//! conn.set_message_callback(|conn, buf| {
//!     let echoed = buf.read_all();
//!     conn.send(echoed);
//! });
//! conn.set_close_callback(|conn| println!("{} closed", conn.name()));
//! conn.connect_established();
//! ```
//!
//! ## Mixing payload kinds
//!
//! ```no_run
//! # use evtcp::{EventLoop, TcpConnection};
//! # let mut event_loop = EventLoop::new().unwrap();
//! # let handle = event_loop.handle();
//! # std::thread::spawn(move || event_loop.run());
//! # let listener = std::net::TcpListener::bind("127.0.0.1:4321").unwrap();
//! # let (stream, _) = listener.accept().unwrap();
//! let conn = TcpConnection::new(handle, stream).unwrap();
//! conn.connect_established();
//!
//! // header, file body, trailer: delivered in exactly this order
//! conn.send("HEADER\r\n");
//! conn.send_file("/var/data/body.bin", 0, 0);
//! conn.send("TRAILER\r\n");
//!
//! // a push stream fed later, from any thread
//! let mut stream_handle = conn.send_async_stream();
//! stream_handle.send("chunk");
//! stream_handle.close();
//! ```

pub mod buffer;
pub mod channel;
pub mod connection;
pub mod event_loop;
pub mod node;
pub mod socket;
pub mod timing_wheel;
pub mod tls;

pub use buffer::Buffer;
pub use connection::{
    AsyncStreamHandle, ConnStatus, ConnectionCallback, HighWaterMarkCallback, MessageCallback,
    SslErrorCallback, TcpConnection, TcpConnectionPtr,
};
pub use event_loop::{EventLoop, LoopHandle};
pub use node::{BufferNode, StreamProducer, WriteQueue};
pub use socket::Socket;
pub use timing_wheel::TimingWheel;
pub use tls::{new_tls_provider, SslError, TlsPolicy, TlsProvider, TlsSink, TlsUpdate};
