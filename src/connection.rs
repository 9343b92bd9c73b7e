//! The per-connection state machine.
//!
//! A [`TcpConnection`] binds an established socket to one event loop and
//! interleaves inbound byte delivery with an ordered outbound pipeline of
//! [`BufferNode`]s, optionally behind a [`TlsProvider`]. Every mutating
//! operation runs on the owning loop thread: calls arriving from other
//! threads copy their payload and post a task through the [`LoopHandle`].
//!
//! Bytes reach the wire in exactly the order the `send*` calls were made
//! on one thread; across threads, in the order the loop's task queue
//! serialized them. Raw sends coalesce into the tail Memory node of the
//! write queue; file, pull-stream, and async-stream sends each get their
//! own node and are never coalesced.

use std::io::{Error, ErrorKind};
use std::mem;
use std::net::{SocketAddr, TcpStream};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use mio::Token;
use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::Channel;
use crate::event_loop::{lock_ignore_poison, LoopHandle};
use crate::node::{BufferNode, WriteQueue};
use crate::socket::{is_peer_gone, is_would_block, Socket};
use crate::timing_wheel::TimingWheel;
use crate::tls::{new_tls_provider, SslError, TlsPolicy, TlsProvider, TlsSink};

/// Shared handle to a connection; user callbacks receive this.
pub type TcpConnectionPtr = Arc<TcpConnection>;

pub type ConnectionCallback = Arc<dyn Fn(&TcpConnectionPtr) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&TcpConnectionPtr, &mut Buffer) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&TcpConnectionPtr, u64) + Send + Sync>;
pub type SslErrorCallback = Arc<dyn Fn(SslError) + Send + Sync>;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnStatus {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

const DEFAULT_HIGH_WATER_MARK: u64 = 64 * 1024 * 1024;

/// Per-call cap for kernel sendfile, just under the largest count the
/// syscall accepts.
#[cfg(target_os = "linux")]
const MAX_SENDFILE_BYTES: u64 = 0x7fff_f000;

struct TlsState {
    provider: Box<dyn TlsProvider>,
    /// Decrypted bytes not yet delivered to the message callback.
    plaintext: Buffer,
}

struct Inner {
    status: ConnStatus,
    channel: Channel,
    read_buffer: Buffer,
    write_queue: WriteQueue,
    tls: Option<TlsState>,
    on_connection: Option<ConnectionCallback>,
    on_message: Option<MessageCallback>,
    on_write_complete: Option<ConnectionCallback>,
    on_high_water_mark: Option<HighWaterMarkCallback>,
    on_ssl_error: Option<SslErrorCallback>,
    on_close: Option<ConnectionCallback>,
    upgrade_callback: Option<ConnectionCallback>,
    high_water_mark: u64,
    close_on_empty: bool,
    idle_timeout: usize,
    kickoff_entry: Weak<KickoffEntry>,
    timing_wheel: Weak<Mutex<TimingWheel>>,
    last_wheel_refresh: Option<Instant>,
    bytes_received: u64,
    bytes_sent: u64,
}

/// Filed into the loop's timing wheel; dropping the last filed copy means
/// the connection saw no wire activity for its whole idle window.
struct KickoffEntry {
    conn: Weak<TcpConnection>,
}

impl Drop for KickoffEntry {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.upgrade() {
            trace!("idle timeout expired, kicking off {}", conn.name());
            conn.force_close();
        }
    }
}

/// Raw-write sink handed to the TLS provider; every byte it pushes counts
/// toward the connection's sent-byte counter.
struct SocketSink<'a> {
    socket: &'a Socket,
    bytes_sent: &'a mut u64,
}

impl TlsSink for SocketSink<'_> {
    fn write_raw(&mut self, data: &[u8]) -> Result<usize, Error> {
        let n = self.socket.write(data)?;
        *self.bytes_sent += n as u64;
        Ok(n)
    }
}

/// A TCP connection pinned to one event loop.
///
/// Created around an already-established stream (the acceptor or connector
/// lives outside this crate). Nothing happens until
/// [`TcpConnection::connect_established`] schedules the transition to
/// `Connected` on the owning loop.
pub struct TcpConnection {
    loop_handle: LoopHandle,
    token: Token,
    socket: Socket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    name: String,
    self_ref: Weak<TcpConnection>,
    async_seq: AtomicU64,
    inner: Mutex<Inner>,
}

impl TcpConnection {
    /// Bind an established stream to `loop_handle`.
    pub fn new(loop_handle: LoopHandle, stream: TcpStream) -> Result<TcpConnectionPtr, Error> {
        Self::build(loop_handle, stream, None)
    }

    /// Like [`TcpConnection::new`], with encryption active from the first
    /// byte: the handshake starts as soon as the connection is established.
    pub fn new_with_tls(
        loop_handle: LoopHandle,
        stream: TcpStream,
        provider: Box<dyn TlsProvider>,
    ) -> Result<TcpConnectionPtr, Error> {
        Self::build(loop_handle, stream, Some(provider))
    }

    fn build(
        loop_handle: LoopHandle,
        stream: TcpStream,
        provider: Option<Box<dyn TlsProvider>>,
    ) -> Result<TcpConnectionPtr, Error> {
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let socket = Socket::new(stream)?;
        socket.set_keep_alive(true)?;
        let token = loop_handle.next_token();
        let channel = Channel::new(loop_handle.registry_clone()?, token, socket.fd());
        let name = format!("{}--{}", local_addr, peer_addr);
        trace!("new connection: {} -> {}", peer_addr, local_addr);
        Ok(Arc::new_cyclic(|self_ref| TcpConnection {
            loop_handle,
            token,
            socket,
            local_addr,
            peer_addr,
            name,
            self_ref: self_ref.clone(),
            async_seq: AtomicU64::new(0),
            inner: Mutex::new(Inner {
                status: ConnStatus::Connecting,
                channel,
                read_buffer: Buffer::new(),
                write_queue: WriteQueue::new(),
                tls: provider.map(|provider| TlsState {
                    provider,
                    plaintext: Buffer::new(),
                }),
                on_connection: None,
                on_message: None,
                on_write_complete: None,
                on_high_water_mark: None,
                on_ssl_error: None,
                on_close: None,
                upgrade_callback: None,
                high_water_mark: DEFAULT_HIGH_WATER_MARK,
                close_on_empty: false,
                idle_timeout: 0,
                kickoff_entry: Weak::new(),
                timing_wheel: Weak::new(),
                last_wheel_refresh: None,
                bytes_received: 0,
                bytes_sent: 0,
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn status(&self) -> ConnStatus {
        self.lock().status
    }

    pub fn connected(&self) -> bool {
        self.status() == ConnStatus::Connected
    }

    pub fn bytes_received(&self) -> u64 {
        self.lock().bytes_received
    }

    /// Bytes accepted by the raw-write helper (ciphertext under TLS).
    /// Kernel sendfile transfers bypass this counter.
    pub fn bytes_sent(&self) -> u64 {
        self.lock().bytes_sent
    }

    /// Bytes owed to the peer: everything queued plus any ciphertext the
    /// TLS provider is still holding.
    pub fn buffered_bytes(&self) -> u64 {
        let inner = self.lock();
        let tls_pending = inner
            .tls
            .as_ref()
            .map_or(0, |t| t.provider.buffered_data().readable_bytes() as u64);
        inner.write_queue.total_remaining() + tls_pending
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> Result<(), Error> {
        self.socket.set_tcp_no_delay(on)
    }

    pub fn set_connection_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.lock().on_connection = Some(Arc::new(cb));
    }

    pub fn set_message_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, &mut Buffer) + Send + Sync + 'static,
    ) {
        self.lock().on_message = Some(Arc::new(cb));
    }

    pub fn set_write_complete_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static,
    ) {
        self.lock().on_write_complete = Some(Arc::new(cb));
    }

    /// Notify when a single queued node (or the TLS ciphertext backlog)
    /// exceeds `mark` bytes.
    pub fn set_high_water_mark_callback(
        &self,
        cb: impl Fn(&TcpConnectionPtr, u64) + Send + Sync + 'static,
        mark: u64,
    ) {
        let mut inner = self.lock();
        inner.on_high_water_mark = Some(Arc::new(cb));
        inner.high_water_mark = mark;
    }

    pub fn set_ssl_error_callback(&self, cb: impl Fn(SslError) + Send + Sync + 'static) {
        self.lock().on_ssl_error = Some(Arc::new(cb));
    }

    /// The close callback is where owners drop their strong reference; it
    /// fires exactly once, after the connection callback observes the
    /// `Disconnected` state.
    pub fn set_close_callback(&self, cb: impl Fn(&TcpConnectionPtr) + Send + Sync + 'static) {
        self.lock().on_close = Some(Arc::new(cb));
    }

    /// Schedule the Connecting→Connected transition on the owning loop:
    /// the loop's connection table takes a strong reference, read
    /// readiness is enabled, and the TLS handshake (if any) starts.
    pub fn connect_established(&self) {
        let Some(conn) = self.self_ref.upgrade() else {
            return;
        };
        self.loop_handle
            .run_in_loop(move || conn.connect_established_in_loop());
    }

    fn connect_established_in_loop(&self) {
        self.loop_handle.assert_in_loop_thread();
        trace!("connect established: {}", self.name);
        let Some(conn) = self.self_ref.upgrade() else {
            return;
        };
        self.loop_handle.insert_connection(self.token, conn.clone());
        let mut inner = self.lock();
        debug_assert_eq!(inner.status, ConnStatus::Connecting);
        if let Err(err) = inner.channel.enable_reading() {
            error!("failed to enable reading on {}: {}", self.name, err);
        }
        inner.status = ConnStatus::Connected;
        if inner.tls.is_some() {
            let Inner {
                tls, bytes_sent, ..
            } = &mut *inner;
            if let Some(state) = tls.as_mut() {
                let mut sink = SocketSink {
                    socket: &self.socket,
                    bytes_sent,
                };
                if let Err(err) = state.provider.start_encryption(&mut sink) {
                    error!("failed to start TLS handshake on {}: {}", self.name, err);
                }
            }
        } else {
            let cb = inner.on_connection.clone();
            drop(inner);
            if let Some(cb) = cb {
                cb(&conn);
            }
        }
    }

    /// Send raw bytes. Accepts anything byte-like (`&[u8]`, `&str`,
    /// `String`, `Vec<u8>`); off-thread calls copy into an owned buffer
    /// captured by the posted task.
    pub fn send(&self, data: impl AsRef<[u8]>) {
        if self.loop_handle.in_loop_thread() {
            self.send_in_loop(data.as_ref());
        } else {
            let owned = data.as_ref().to_vec();
            let Some(conn) = self.self_ref.upgrade() else {
                return;
            };
            self.loop_handle
                .queue_in_loop(move || conn.send_in_loop(&owned));
        }
    }

    /// Send the readable contents of a [`Buffer`].
    pub fn send_buffer(&self, buf: Buffer) {
        if self.loop_handle.in_loop_thread() {
            self.send_in_loop(buf.peek());
        } else {
            let Some(conn) = self.self_ref.upgrade() else {
                return;
            };
            self.loop_handle
                .queue_in_loop(move || conn.send_in_loop(buf.peek()));
        }
    }

    fn send_in_loop(&self, data: &[u8]) {
        self.loop_handle.assert_in_loop_thread();
        let mut inner = self.lock();
        if inner.status != ConnStatus::Connected {
            warn!("{} is not connected, giving up sending", self.name);
            return;
        }
        self.extend_life(&mut inner);
        let mut sent = 0usize;
        if !inner.channel.is_writing() && inner.write_queue.is_empty() {
            // empty pipeline: try the kernel buffer directly
            match self.write_in_loop(&mut inner, data) {
                Ok(n) => sent = n,
                Err(err) if is_would_block(&err) => {}
                Err(err) if is_peer_gone(&err) => {
                    trace!("peer gone on {}, errno={:?}", self.name, err.raw_os_error());
                    return;
                }
                Err(err) => {
                    error!("unexpected error({}) sending on {}", err, self.name);
                    return;
                }
            }
        }
        let remain = &data[sent..];
        if remain.is_empty() || inner.status != ConnStatus::Connected {
            return;
        }
        inner.write_queue.append_bytes(remain);
        if !inner.channel.is_writing() {
            if let Err(err) = inner.channel.enable_writing() {
                error!("failed to enable writing on {}: {}", self.name, err);
            }
        }
        let hwm_cb = inner.on_high_water_mark.clone();
        let mut notices = Vec::new();
        if hwm_cb.is_some() {
            let tail = inner.write_queue.back_remaining();
            if tail > inner.high_water_mark {
                notices.push(tail);
            }
            if let Some(tls) = inner.tls.as_ref() {
                let pending = tls.provider.buffered_data().readable_bytes() as u64;
                if pending > inner.high_water_mark {
                    notices.push(pending);
                }
            }
        }
        drop(inner);
        if notices.is_empty() {
            return;
        }
        if let (Some(cb), Some(conn)) = (hwm_cb, self.self_ref.upgrade()) {
            for pending in notices {
                cb(&conn, pending);
            }
        }
    }

    /// Queue a range of a regular file. `length == 0` sends from `offset`
    /// to end of file. An unopenable or out-of-range request is dropped
    /// with a log; the connection is unaffected.
    pub fn send_file(&self, path: impl AsRef<Path>, offset: u64, length: u64) {
        let path = path.as_ref();
        let node = BufferNode::file(path, offset, length);
        if !node.available() {
            error!("{} open error, dropping send", path.display());
            return;
        }
        self.send_node(node);
    }

    /// Queue a pull stream: `producer` fills the slice it is given and
    /// returns the byte count, 0 meaning end of stream.
    pub fn send_stream(&self, producer: impl FnMut(&mut [u8]) -> usize + Send + 'static) {
        self.send_node(BufferNode::stream(producer));
    }

    fn send_node(&self, node: BufferNode) {
        if self.loop_handle.in_loop_thread() {
            self.send_node_in_loop(node);
        } else {
            let Some(conn) = self.self_ref.upgrade() else {
                return;
            };
            self.loop_handle
                .queue_in_loop(move || conn.send_node_in_loop(node));
        }
    }

    fn send_node_in_loop(&self, node: BufferNode) {
        self.loop_handle.assert_in_loop_thread();
        let mut inner = self.lock();
        if inner.status != ConnStatus::Connected {
            warn!("{} is not connected, giving up sending", self.name);
            return;
        }
        inner.write_queue.push_node(node);
        if inner.write_queue.len() == 1 {
            // sole entry: kick the drain once instead of waiting for
            // write readiness
            self.send_front_node_in_loop(&mut inner);
        }
    }

    /// Open a push stream: an [`AsyncStreamHandle`] whose `send` calls are
    /// serialized onto this connection behind everything already queued.
    pub fn send_async_stream(&self) -> AsyncStreamHandle {
        let id = self.async_seq.fetch_add(1, Ordering::Relaxed);
        let node = BufferNode::async_stream(id);
        if self.loop_handle.in_loop_thread() {
            self.lock().write_queue.push_node(node);
        } else if let Some(conn) = self.self_ref.upgrade() {
            self.loop_handle.queue_in_loop(move || {
                trace!("pushing async stream node to the write queue");
                conn.lock().write_queue.push_node(node);
            });
        }
        AsyncStreamHandle {
            conn: self.self_ref.clone(),
            id,
            closed: false,
        }
    }

    fn send_async_data_in_loop(&self, id: u64, data: Option<&[u8]>) {
        self.loop_handle.assert_in_loop_thread();
        let mut inner = self.lock();
        if inner.status != ConnStatus::Connected {
            debug!("{} is not connected, giving up sending", self.name);
            return;
        }
        match data {
            Some(bytes) => {
                if bytes.is_empty() {
                    return;
                }
                let head_drained = inner.write_queue.is_front_async(id)
                    && inner
                        .write_queue
                        .front_mut()
                        .map_or(false, |n| n.remaining_bytes() == 0);
                if head_drained {
                    // this node is the drained queue head: write through
                    let n = match self.write_in_loop(&mut inner, bytes) {
                        Ok(n) => n,
                        Err(err) => {
                            if is_would_block(&err) || is_peer_gone(&err) {
                                trace!("async write on {}: {}", self.name, err);
                            } else {
                                error!("async write error on {}: {}", self.name, err);
                            }
                            0
                        }
                    };
                    if n < bytes.len() {
                        if let Some(node) = inner.write_queue.find_async_mut(id) {
                            node.append(&bytes[n..]);
                        }
                        if !inner.channel.is_writing() {
                            if let Err(err) = inner.channel.enable_writing() {
                                error!("failed to enable writing on {}: {}", self.name, err);
                            }
                        }
                    }
                } else if let Some(node) = inner.write_queue.find_async_mut(id) {
                    node.append(bytes);
                } else {
                    debug!("async stream node is gone, dropping {} bytes", bytes.len());
                }
            }
            None => {
                if let Some(node) = inner.write_queue.find_async_mut(id) {
                    node.done();
                }
                if !inner.channel.is_writing() {
                    if let Err(err) = inner.channel.enable_writing() {
                        error!("failed to enable writing on {}: {}", self.name, err);
                    }
                }
            }
        }
    }

    /// Graceful close: drain everything queued, then half-close the write
    /// side and wait for the peer's FIN to finish the teardown.
    pub fn shutdown(&self) {
        let Some(conn) = self.self_ref.upgrade() else {
            return;
        };
        self.loop_handle.run_in_loop(move || conn.shutdown_in_loop());
    }

    fn shutdown_in_loop(&self) {
        self.loop_handle.assert_in_loop_thread();
        let mut inner = self.lock();
        if inner.status != ConnStatus::Connected {
            return;
        }
        let tls_pending = inner
            .tls
            .as_ref()
            .map_or(0, |t| t.provider.buffered_data().readable_bytes());
        if !inner.write_queue.is_empty() || tls_pending != 0 {
            // still data on the way out; the drain performs the close
            inner.close_on_empty = true;
            return;
        }
        if inner.tls.is_some() {
            let Inner {
                tls, bytes_sent, ..
            } = &mut *inner;
            if let Some(state) = tls.as_mut() {
                let mut sink = SocketSink {
                    socket: &self.socket,
                    bytes_sent,
                };
                state.provider.close(&mut sink);
            }
        }
        inner.status = ConnStatus::Disconnecting;
        if !inner.channel.is_writing() {
            if let Err(err) = self.socket.close_write() {
                error!("failed to half-close {}: {}", self.name, err);
            }
        }
    }

    /// Immediate bidirectional teardown; pending outbound data is
    /// abandoned. Safe to call from any thread, idempotent.
    pub fn force_close(&self) {
        let Some(conn) = self.self_ref.upgrade() else {
            return;
        };
        self.loop_handle
            .run_in_loop(move || conn.force_close_in_loop());
    }

    fn force_close_in_loop(&self) {
        self.loop_handle.assert_in_loop_thread();
        {
            let mut inner = self.lock();
            match inner.status {
                ConnStatus::Connected | ConnStatus::Disconnecting => {
                    inner.status = ConnStatus::Disconnecting;
                }
                _ => return,
            }
        }
        self.handle_close();
        let mut inner = self.lock();
        if inner.tls.is_some() {
            let Inner {
                tls, bytes_sent, ..
            } = &mut *inner;
            if let Some(state) = tls.as_mut() {
                let mut sink = SocketSink {
                    socket: &self.socket,
                    bytes_sent,
                };
                state.provider.close(&mut sink);
            }
        }
    }

    /// Upgrade a plaintext connection to TLS using the built-in provider
    /// factory. Fails fast, with no state change, when encryption is
    /// already active (or no provider backend exists).
    pub fn start_encryption(
        &self,
        policy: TlsPolicy,
        is_server: bool,
        upgrade_callback: Option<ConnectionCallback>,
    ) -> Result<(), Error> {
        let provider = new_tls_provider(&policy, is_server)?;
        self.start_encryption_with(provider, upgrade_callback)
    }

    /// Upgrade a plaintext connection to TLS with an injected provider.
    /// Once the handshake finishes, `upgrade_callback` (or the connection
    /// callback) fires.
    pub fn start_encryption_with(
        &self,
        provider: Box<dyn TlsProvider>,
        upgrade_callback: Option<ConnectionCallback>,
    ) -> Result<(), Error> {
        {
            let mut inner = self.lock();
            if inner.tls.is_some() || inner.upgrade_callback.is_some() {
                error!("TLS is already started on {}", self.name);
                return Err(Error::new(
                    ErrorKind::AlreadyExists,
                    "encryption already started",
                ));
            }
            inner.tls = Some(TlsState {
                provider,
                plaintext: Buffer::new(),
            });
            inner.upgrade_callback = upgrade_callback;
        }
        let Some(conn) = self.self_ref.upgrade() else {
            return Ok(());
        };
        self.loop_handle
            .run_in_loop(move || conn.start_tls_handshake_in_loop());
        Ok(())
    }

    fn start_tls_handshake_in_loop(&self) {
        self.loop_handle.assert_in_loop_thread();
        let mut inner = self.lock();
        if inner.status != ConnStatus::Connected {
            // pre-established install: connect_established starts the
            // handshake instead
            return;
        }
        let Inner {
            tls, bytes_sent, ..
        } = &mut *inner;
        if let Some(state) = tls.as_mut() {
            let mut sink = SocketSink {
                socket: &self.socket,
                bytes_sent,
            };
            if let Err(err) = state.provider.start_encryption(&mut sink) {
                error!("failed to start TLS handshake on {}: {}", self.name, err);
            }
        }
    }

    /// Arm (or re-arm) the idle timeout. The connection is forced closed
    /// when `seconds` pass with no wire activity; every read and write
    /// refreshes the expiry, rate-limited to once per second.
    pub fn set_idle_timeout(&self, seconds: usize) {
        let Some(conn) = self.self_ref.upgrade() else {
            return;
        };
        self.loop_handle.run_in_loop(move || {
            let wheel = conn.loop_handle.timing_wheel();
            let mut inner = conn.lock();
            inner.idle_timeout = seconds;
            if seconds == 0 {
                inner.kickoff_entry = Weak::new();
                return;
            }
            let entry = Arc::new(KickoffEntry {
                conn: conn.self_ref.clone(),
            });
            inner.kickoff_entry = Arc::downgrade(&entry);
            inner.timing_wheel = Arc::downgrade(&wheel);
            inner.last_wheel_refresh = Some(Instant::now());
            lock_ignore_poison(&wheel).insert_entry(seconds, entry);
        });
    }

    /// Refresh the timing-wheel entry, at most once per second so heavy
    /// traffic does not churn the wheel on every byte.
    fn extend_life(&self, inner: &mut Inner) {
        if inner.idle_timeout == 0 {
            return;
        }
        let now = Instant::now();
        if let Some(last) = inner.last_wheel_refresh {
            if now.duration_since(last) < Duration::from_secs(1) {
                return;
            }
        }
        inner.last_wheel_refresh = Some(now);
        if let (Some(entry), Some(wheel)) = (
            inner.kickoff_entry.upgrade(),
            inner.timing_wheel.upgrade(),
        ) {
            lock_ignore_poison(&wheel).insert_entry(inner.idle_timeout, entry);
        }
    }

    /// Write through the TLS provider when present, raw otherwise.
    fn write_in_loop(&self, inner: &mut Inner, data: &[u8]) -> Result<usize, Error> {
        let Inner {
            tls,
            bytes_sent,
            channel,
            ..
        } = inner;
        match tls.as_mut() {
            Some(state) => {
                let mut sink = SocketSink {
                    socket: &self.socket,
                    bytes_sent,
                };
                let n = state.provider.send_data(data, &mut sink)?;
                // the provider may consume all plaintext yet hold a
                // ciphertext tail; write readiness drains it
                if !state.provider.buffered_data().is_empty() && !channel.is_writing() {
                    if let Err(err) = channel.enable_writing() {
                        error!("failed to enable writing on {}: {}", self.name, err);
                    }
                }
                Ok(n)
            }
            None => {
                let n = self.socket.write(data)?;
                *bytes_sent += n as u64;
                Ok(n)
            }
        }
    }

    pub(crate) fn handle_read(&self) {
        self.loop_handle.assert_in_loop_thread();
        let mut inner = self.lock();
        if inner.status == ConnStatus::Disconnected {
            return;
        }
        // the poller is edge-triggered: drain the socket until it would
        // block, or the next edge may never come
        let mut total = 0u64;
        let mut saw_eof = false;
        let mut fatal = false;
        loop {
            match inner.read_buffer.read_from_fd(self.socket.fd()) {
                Ok(0) => {
                    // peer closed its side
                    saw_eof = true;
                    break;
                }
                Ok(n) => total += n as u64,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if is_would_block(&err) => break,
                Err(err) if is_peer_gone(&err) => {
                    trace!(
                        "peer gone on fd {}, errno={:?}",
                        self.socket.fd(),
                        err.raw_os_error()
                    );
                    break;
                }
                Err(err) => {
                    error!("read socket error on {}: {}", self.name, err);
                    fatal = true;
                    break;
                }
            }
        }
        if total > 0 {
            inner.bytes_received += total;
            self.extend_life(&mut inner);
            if inner.tls.is_some() {
                self.tls_receive(inner);
            } else if let Some(cb) = inner.on_message.clone() {
                let mut buf = mem::take(&mut inner.read_buffer);
                drop(inner);
                if let Some(conn) = self.self_ref.upgrade() {
                    cb(&conn, &mut buf);
                }
                // unconsumed bytes stay buffered for the next read
                self.lock().read_buffer = buf;
            } else {
                drop(inner);
            }
        } else {
            drop(inner);
        }
        if saw_eof || fatal {
            self.handle_close();
        }
    }

    fn tls_receive<'a>(&'a self, mut inner: MutexGuard<'a, Inner>) {
        let result = {
            let Inner {
                read_buffer,
                tls,
                bytes_sent,
                ..
            } = &mut *inner;
            let Some(state) = tls.as_mut() else {
                return;
            };
            let mut sink = SocketSink {
                socket: &self.socket,
                bytes_sent,
            };
            state
                .provider
                .recv_data(read_buffer, &mut state.plaintext, &mut sink)
        };
        let update = match result {
            Err(ssl_err) => {
                let cb = inner.on_ssl_error.clone();
                drop(inner);
                if let Some(cb) = cb {
                    cb(ssl_err);
                }
                self.force_close();
                return;
            }
            Ok(update) => update,
        };
        if update.handshake_finished {
            let cb = inner
                .upgrade_callback
                .take()
                .or_else(|| inner.on_connection.clone());
            if let Some(cb) = cb {
                drop(inner);
                if let Some(conn) = self.self_ref.upgrade() {
                    cb(&conn);
                }
                inner = self.lock();
            }
        }
        let delivery = if inner
            .tls
            .as_ref()
            .map_or(false, |t| !t.plaintext.is_empty())
        {
            inner.on_message.clone()
        } else {
            None
        };
        if let Some(cb) = delivery {
            let Some(mut buf) = inner.tls.as_mut().map(|t| mem::take(&mut t.plaintext)) else {
                return;
            };
            drop(inner);
            if let Some(conn) = self.self_ref.upgrade() {
                cb(&conn, &mut buf);
            }
            let mut inner = self.lock();
            if let Some(state) = inner.tls.as_mut() {
                state.plaintext = buf;
            }
        } else {
            drop(inner);
        }
        if update.close_alert {
            self.shutdown();
        }
    }

    pub(crate) fn handle_write(&self) {
        self.loop_handle.assert_in_loop_thread();
        let mut inner = self.lock();
        if inner.status == ConnStatus::Disconnected {
            return;
        }
        if !inner.channel.is_writing() {
            error!("write readiness on {} with writing disabled", self.name);
            return;
        }
        self.extend_life(&mut inner);
        {
            let Inner {
                tls, bytes_sent, ..
            } = &mut *inner;
            if let Some(state) = tls.as_mut() {
                let mut sink = SocketSink {
                    socket: &self.socket,
                    bytes_sent,
                };
                match state.provider.send_buffered_data(&mut sink) {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(err) => {
                        if is_would_block(&err) || is_peer_gone(&err) {
                            trace!("flush on {}: {}", self.name, err);
                        } else {
                            error!("flush error on {}: {}", self.name, err);
                        }
                        return;
                    }
                }
            }
        }
        loop {
            let (remaining, open_async) = match inner.write_queue.front_mut() {
                None => break,
                Some(head) => (
                    head.remaining_bytes(),
                    head.is_async() && head.available(),
                ),
            };
            if remaining == 0 {
                if open_async {
                    // drained push stream still open: its producer
                    // re-enables write interest when it has more
                    if let Err(err) = inner.channel.disable_writing() {
                        error!("failed to disable writing on {}: {}", self.name, err);
                    }
                    return;
                }
                inner.write_queue.pop_front();
                continue;
            }
            self.send_front_node_in_loop(&mut inner);
            if inner
                .write_queue
                .front_mut()
                .map_or(0, |n| n.remaining_bytes())
                > 0
            {
                // kernel buffer filled up mid-node
                return;
            }
        }
        let tls_pending = inner
            .tls
            .as_ref()
            .map_or(0, |t| t.provider.buffered_data().readable_bytes());
        if tls_pending > 0 {
            // ciphertext tail still owed: keep write interest until the
            // next readiness flushes it
            return;
        }
        if let Err(err) = inner.channel.disable_writing() {
            error!("failed to disable writing on {}: {}", self.name, err);
        }
        let write_complete = inner.on_write_complete.clone();
        let do_shutdown = inner.close_on_empty;
        drop(inner);
        if let (Some(cb), Some(conn)) = (write_complete, self.self_ref.upgrade()) {
            cb(&conn);
        }
        if do_shutdown {
            self.shutdown();
        }
    }

    /// Drain the queue head as far as the socket allows.
    fn send_front_node_in_loop(&self, inner: &mut Inner) {
        self.loop_handle.assert_in_loop_thread();
        #[cfg(target_os = "linux")]
        {
            let plain_file = inner.tls.is_none()
                && inner.write_queue.front_mut().map_or(false, |n| n.is_file());
            if plain_file {
                self.sendfile_front_in_loop(inner);
                return;
            }
        }
        let inner_ref = &mut *inner;
        let Some(node) = inner_ref.write_queue.front_mut() else {
            return;
        };
        while node.remaining_bytes() > 0 {
            let chunk = node.get_data();
            if chunk.is_empty() {
                // pull stream end-of-stream signal
                node.done();
                break;
            }
            let chunk_len = chunk.len();
            let result = match inner_ref.tls.as_mut() {
                Some(state) => {
                    let mut sink = SocketSink {
                        socket: &self.socket,
                        bytes_sent: &mut inner_ref.bytes_sent,
                    };
                    state.provider.send_data(chunk, &mut sink)
                }
                None => match self.socket.write(chunk) {
                    Ok(n) => {
                        inner_ref.bytes_sent += n as u64;
                        Ok(n)
                    }
                    Err(err) => Err(err),
                },
            };
            match result {
                Ok(n) => {
                    node.retrieve(n);
                    if n < chunk_len {
                        if !inner_ref.channel.is_writing() {
                            if let Err(err) = inner_ref.channel.enable_writing() {
                                error!("failed to enable writing on {}: {}", self.name, err);
                            }
                        }
                        trace!("partial node write on {}, socket buffer full", self.name);
                        return;
                    }
                }
                Err(err) if is_would_block(&err) => {
                    trace!("socket buffer full on {}", self.name);
                    break;
                }
                Err(err) if is_peer_gone(&err) => {
                    trace!("peer gone on {}, errno={:?}", self.name, err.raw_os_error());
                    return;
                }
                Err(err) => {
                    error!("unexpected error({}) sending node on {}", err, self.name);
                    return;
                }
            }
        }
        if !inner_ref.channel.is_writing() {
            if let Err(err) = inner_ref.channel.enable_writing() {
                error!("failed to enable writing on {}: {}", self.name, err);
            }
        }
    }

    /// Kernel zero-copy path for plaintext file nodes.
    #[cfg(target_os = "linux")]
    fn sendfile_front_in_loop(&self, inner: &mut Inner) {
        let inner_ref = &mut *inner;
        let Some(node) = inner_ref.write_queue.front_mut() else {
            return;
        };
        let to_send = node.remaining_bytes();
        if to_send == 0 {
            error!("file node on {} owes no bytes", self.name);
            return;
        }
        let Some(file_fd) = node.file_fd() else {
            return;
        };
        let count = to_send.min(MAX_SENDFILE_BYTES) as usize;
        match self.socket.sendfile(file_fd, count) {
            Ok(0) => {
                error!("sendfile sent 0 bytes on {}", self.name);
            }
            Ok(n) => {
                trace!("sendfile() sent {} bytes on {}", n, self.name);
                node.retrieve(n);
                if !inner_ref.channel.is_writing() {
                    if let Err(err) = inner_ref.channel.enable_writing() {
                        error!("failed to enable writing on {}: {}", self.name, err);
                    }
                }
            }
            Err(err) if is_would_block(&err) => {
                if !inner_ref.channel.is_writing() {
                    if let Err(err) = inner_ref.channel.enable_writing() {
                        error!("failed to enable writing on {}: {}", self.name, err);
                    }
                }
            }
            Err(err) => {
                error!("sendfile error on {}: {}", self.name, err);
                if inner_ref.channel.is_writing() {
                    if let Err(err) = inner_ref.channel.disable_writing() {
                        error!("failed to disable writing on {}: {}", self.name, err);
                    }
                }
            }
        }
    }

    pub(crate) fn handle_close(&self) {
        self.loop_handle.assert_in_loop_thread();
        let (on_connection, on_close) = {
            let mut inner = self.lock();
            if inner.status == ConnStatus::Disconnected {
                return;
            }
            trace!("connection closed, fd={}", self.socket.fd());
            inner.status = ConnStatus::Disconnected;
            if let Err(err) = inner.channel.disable_all() {
                trace!("failed to deregister {}: {}", self.name, err);
            }
            (inner.on_connection.clone(), inner.on_close.clone())
        };
        self.loop_handle.remove_connection(self.token);
        let Some(guard_this) = self.self_ref.upgrade() else {
            return;
        };
        if let Some(cb) = on_connection {
            cb(&guard_this);
        }
        if let Some(cb) = on_close {
            trace!("to call close callback on {}", self.name);
            cb(&guard_this);
        }
    }

    pub(crate) fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(err)) => {
                if is_peer_gone(&err) {
                    trace!("[{}] SO_ERROR = {}", self.name, err);
                } else {
                    error!("[{}] SO_ERROR = {}", self.name, err);
                }
            }
            Ok(None) => {}
            Err(err) => error!("[{}] failed to read SO_ERROR: {}", self.name, err),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for TcpConnection {
    fn drop(&mut self) {
        // a still-connected drop can only mean the owner vanished without
        // closing; send the TLS close alert as the original engine does
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.status == ConnStatus::Connected {
            if let Some(state) = inner.tls.as_mut() {
                let mut sink = SocketSink {
                    socket: &self.socket,
                    bytes_sent: &mut inner.bytes_sent,
                };
                state.provider.close(&mut sink);
            }
        }
    }
}

/// Producer side of a push stream opened with
/// [`TcpConnection::send_async_stream`].
///
/// Bytes pushed here are serialized onto the connection behind everything
/// queued before the stream was opened, and ahead of everything queued
/// after it. Dropping the handle closes the stream.
pub struct AsyncStreamHandle {
    conn: Weak<TcpConnection>,
    id: u64,
    closed: bool,
}

impl AsyncStreamHandle {
    /// Push bytes into the stream. Data is dropped with a debug log when
    /// the stream is closed or the connection is gone.
    pub fn send(&self, data: impl AsRef<[u8]>) {
        if self.closed {
            debug!("async stream is closed, giving up sending");
            return;
        }
        let Some(conn) = self.conn.upgrade() else {
            debug!("connection is gone, giving up sending");
            return;
        };
        if !conn.connected() {
            debug!("connection is not connected, giving up sending");
            return;
        }
        let id = self.id;
        if conn.loop_handle.in_loop_thread() {
            conn.send_async_data_in_loop(id, Some(data.as_ref()));
        } else {
            let owned = data.as_ref().to_vec();
            let task_conn = conn.clone();
            conn.loop_handle
                .queue_in_loop(move || task_conn.send_async_data_in_loop(id, Some(&owned)));
        }
    }

    /// Close the stream; once its buffered bytes drain, the node leaves
    /// the queue and later sends proceed.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let Some(conn) = self.conn.upgrade() else {
            return;
        };
        if !conn.connected() {
            return;
        }
        let id = self.id;
        if conn.loop_handle.in_loop_thread() {
            conn.send_async_data_in_loop(id, None);
        } else {
            let task_conn = conn.clone();
            conn.loop_handle
                .queue_in_loop(move || task_conn.send_async_data_in_loop(id, None));
        }
    }
}

impl Drop for AsyncStreamHandle {
    fn drop(&mut self) {
        self.close();
    }
}
