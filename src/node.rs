//! Outbound buffer nodes and the per-connection write queue.
//!
//! Every outbound byte source (in-memory bytes, a regular-file range, a
//! pull producer, a push producer) is a [`BufferNode`] behind one chunk
//! contract: ask for the next readable chunk with [`BufferNode::get_data`],
//! acknowledge what the socket accepted with [`BufferNode::retrieve`].
//! The [`WriteQueue`] keeps nodes strictly FIFO so bytes reach the wire in
//! submission order no matter which source produced them.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

use tracing::{error, trace};

use crate::buffer::Buffer;

/// Bytes staged from a file or pull producer per chunk.
const STAGING_CHUNK_SIZE: usize = 16 * 1024;

/// Pull producer: fills the destination slice, returns the byte count.
/// Returning 0 signals end of stream.
pub type StreamProducer = Box<dyn FnMut(&mut [u8]) -> usize + Send>;

/// One element of the outbound FIFO.
pub enum BufferNode {
    /// Plain bytes; the queue coalesces consecutive raw sends into one.
    Memory { buffer: Buffer },
    /// A range of a regular file, staged lazily in 16 KiB chunks.
    File(FileNode),
    /// A pull producer drained synchronously until it returns 0.
    Stream(StreamNode),
    /// A push producer fed by an [`crate::connection::AsyncStreamHandle`].
    Async(AsyncNode),
}

pub struct FileNode {
    file: Option<File>,
    staging: Buffer,
    bytes_to_send: u64,
    done: bool,
}

pub struct StreamNode {
    producer: StreamProducer,
    staging: Buffer,
    done: bool,
}

pub struct AsyncNode {
    id: u64,
    buffer: Buffer,
    closed: bool,
}

impl BufferNode {
    /// A fresh, empty memory node.
    pub fn memory() -> Self {
        BufferNode::Memory {
            buffer: Buffer::new(),
        }
    }

    /// A file-range node. Opens, validates, and seeks exactly once.
    ///
    /// `length == 0` means "from `offset` to end of file". A node whose
    /// range does not fit the file (or whose open/seek fails) is born
    /// broken: [`BufferNode::available`] is false and it owes no bytes.
    pub fn file(path: impl AsRef<Path>, offset: u64, length: u64) -> Self {
        let path = path.as_ref();
        let broken = BufferNode::File(FileNode {
            file: None,
            staging: Buffer::new(),
            bytes_to_send: 0,
            done: true,
        });
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(err) => {
                error!("{} open error: {}", path.display(), err);
                return broken;
            }
        };
        let size = match file.metadata() {
            Ok(meta) => meta.len(),
            Err(err) => {
                error!("{} stat error: {}", path.display(), err);
                return broken;
            }
        };
        let bytes_to_send = if length == 0 {
            if offset >= size {
                error!(
                    "the file size is {} bytes, but the offset is {} bytes and the length is {} bytes",
                    size, offset, length
                );
                return broken;
            }
            size - offset
        } else {
            match offset.checked_add(length) {
                Some(end) if end <= size => length,
                _ => {
                    error!(
                        "the file size is {} bytes, but the offset is {} bytes and the length is {} bytes",
                        size, offset, length
                    );
                    return broken;
                }
            }
        };
        if let Err(err) = file.seek(SeekFrom::Start(offset)) {
            error!("{} seek error: {}", path.display(), err);
            return broken;
        }
        BufferNode::File(FileNode {
            file: Some(file),
            staging: Buffer::new(),
            bytes_to_send,
            done: false,
        })
    }

    /// A pull-stream node around `producer`.
    pub fn stream(producer: impl FnMut(&mut [u8]) -> usize + Send + 'static) -> Self {
        BufferNode::Stream(StreamNode {
            producer: Box::new(producer),
            staging: Buffer::new(),
            done: false,
        })
    }

    /// A push-stream node addressed by `id`.
    pub fn async_stream(id: u64) -> Self {
        BufferNode::Async(AsyncNode {
            id,
            buffer: Buffer::new(),
            closed: false,
        })
    }

    /// Bytes still owed to the peer. For pull streams this includes a
    /// sentinel byte while the producer is open: only the producer's
    /// 0-return decides the end, never a size counter.
    pub fn remaining_bytes(&self) -> u64 {
        match self {
            BufferNode::Memory { buffer } => buffer.readable_bytes() as u64,
            BufferNode::File(node) => {
                if node.done {
                    0
                } else {
                    node.bytes_to_send
                }
            }
            BufferNode::Stream(node) => {
                let staged = node.staging.readable_bytes() as u64;
                if node.done {
                    staged
                } else {
                    staged + 1
                }
            }
            BufferNode::Async(node) => node.buffer.readable_bytes() as u64,
        }
    }

    /// Obtain the next chunk to write. An empty slice means "not yet
    /// available"; for pull streams it is the end-of-stream signal and the
    /// caller marks the node [`BufferNode::done`].
    pub fn get_data(&mut self) -> &[u8] {
        match self {
            BufferNode::Memory { buffer } => buffer.peek(),
            BufferNode::File(node) => {
                if node.staging.is_empty() && node.bytes_to_send > 0 {
                    if let Some(file) = node.file.as_mut() {
                        let want = STAGING_CHUNK_SIZE.min(node.bytes_to_send as usize);
                        node.staging.ensure_writable(want);
                        match file.read(&mut node.staging.writable_mut()[..want]) {
                            Ok(0) => trace!("read the end of file"),
                            Ok(n) => node.staging.has_written(n),
                            Err(err) => error!("file node read error: {}", err),
                        }
                    }
                }
                node.staging.peek()
            }
            BufferNode::Stream(node) => {
                if node.staging.is_empty() && !node.done {
                    node.staging.ensure_writable(STAGING_CHUNK_SIZE);
                    let writable = node.staging.writable_mut();
                    let capacity = writable.len();
                    let n = (node.producer)(writable).min(capacity);
                    node.staging.has_written(n);
                }
                node.staging.peek()
            }
            BufferNode::Async(node) => node.buffer.peek(),
        }
    }

    /// Acknowledge `len` bytes consumed from the last [`BufferNode::get_data`]
    /// view (or, for the kernel sendfile path, sent straight from the file).
    pub fn retrieve(&mut self, len: usize) {
        match self {
            BufferNode::Memory { buffer } => buffer.retrieve(len),
            BufferNode::File(node) => {
                node.staging.retrieve(len);
                node.bytes_to_send = node.bytes_to_send.saturating_sub(len as u64);
            }
            BufferNode::Stream(node) => node.staging.retrieve(len),
            BufferNode::Async(node) => node.buffer.retrieve(len),
        }
    }

    /// False when the underlying resource is broken (failed file open) or,
    /// for push streams, the producer has closed its side.
    pub fn available(&self) -> bool {
        match self {
            BufferNode::File(node) => node.file.is_some(),
            BufferNode::Async(node) => !node.closed,
            _ => true,
        }
    }

    /// Terminal mark for stream-like nodes.
    pub fn done(&mut self) {
        match self {
            BufferNode::File(node) => node.done = true,
            BufferNode::Stream(node) => node.done = true,
            BufferNode::Async(node) => node.closed = true,
            BufferNode::Memory { .. } => {}
        }
    }

    /// Append bytes. Only Memory and Async nodes accept input.
    pub fn append(&mut self, bytes: &[u8]) {
        match self {
            BufferNode::Memory { buffer } => buffer.append(bytes),
            BufferNode::Async(node) => node.buffer.append(bytes),
            _ => error!("append() is not supported on this buffer node"),
        }
    }

    pub fn is_memory(&self) -> bool {
        matches!(self, BufferNode::Memory { .. })
    }

    pub fn is_file(&self) -> bool {
        matches!(self, BufferNode::File(_))
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, BufferNode::Stream(_))
    }

    pub fn is_async(&self) -> bool {
        matches!(self, BufferNode::Async(_))
    }

    /// The file descriptor backing a File node, for the kernel sendfile
    /// fast path.
    pub fn file_fd(&self) -> Option<RawFd> {
        match self {
            BufferNode::File(node) => node.file.as_ref().map(|f| f.as_raw_fd()),
            _ => None,
        }
    }

    fn async_id(&self) -> Option<u64> {
        match self {
            BufferNode::Async(node) => Some(node.id),
            _ => None,
        }
    }
}

/// The ordered outbound FIFO of a connection.
///
/// Raw sends coalesce into the tail node when (and only when) the tail is a
/// Memory node, so the queue never holds two consecutive Memory nodes.
/// File, Stream, and Async nodes are never coalesced.
#[derive(Default)]
pub struct WriteQueue {
    nodes: VecDeque<BufferNode>,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn front_mut(&mut self) -> Option<&mut BufferNode> {
        self.nodes.front_mut()
    }

    pub fn pop_front(&mut self) -> Option<BufferNode> {
        self.nodes.pop_front()
    }

    pub fn push_node(&mut self, node: BufferNode) {
        self.nodes.push_back(node);
    }

    /// Append raw bytes at the tail, reusing the tail Memory node when
    /// there is one.
    pub fn append_bytes(&mut self, bytes: &[u8]) {
        match self.nodes.back() {
            Some(node) if node.is_memory() => {}
            _ => self.nodes.push_back(BufferNode::memory()),
        }
        if let Some(tail) = self.nodes.back_mut() {
            tail.append(bytes);
        }
    }

    /// Bytes owed by the tail node (the high-water-mark measure).
    pub fn back_remaining(&self) -> u64 {
        self.nodes.back().map_or(0, BufferNode::remaining_bytes)
    }

    /// True when the queue head is the Async node addressed by `id`.
    pub fn is_front_async(&self, id: u64) -> bool {
        self.nodes.front().and_then(BufferNode::async_id) == Some(id)
    }

    /// Locate the Async node addressed by `id` anywhere in the queue.
    pub fn find_async_mut(&mut self, id: u64) -> Option<&mut BufferNode> {
        self.nodes
            .iter_mut()
            .find(|node| node.async_id() == Some(id))
    }

    /// Total bytes currently owed across all nodes.
    pub fn total_remaining(&self) -> u64 {
        self.nodes.iter().map(BufferNode::remaining_bytes).sum()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Write;

    #[test]
    fn raw_sends_coalesce_into_the_tail_memory_node() {
        let mut queue = WriteQueue::new();
        queue.append_bytes(b"one");
        queue.append_bytes(b"two");
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.front_mut().unwrap().get_data(), b"onetwo");
    }

    #[test]
    fn stream_nodes_break_coalescing() {
        let mut queue = WriteQueue::new();
        queue.append_bytes(b"a");
        queue.push_node(BufferNode::stream(|_| 0));
        queue.append_bytes(b"b");
        queue.append_bytes(b"c");
        assert_eq!(queue.len(), 3);
        // no two consecutive memory nodes
        let kinds: Vec<bool> = {
            let mut kinds = Vec::new();
            while let Some(node) = queue.pop_front() {
                kinds.push(node.is_memory());
            }
            kinds
        };
        assert_eq!(kinds, vec![true, false, true]);
    }

    #[test]
    fn pull_stream_produces_until_zero_return() {
        let mut calls = 0;
        let mut node = BufferNode::stream(move |dst| {
            calls += 1;
            if calls <= 2 {
                dst[..16].fill(b'x');
                16
            } else {
                0
            }
        });
        assert!(node.remaining_bytes() > 0);
        assert_eq!(node.get_data().len(), 16);
        node.retrieve(16);
        assert_eq!(node.get_data().len(), 16);
        node.retrieve(16);
        // third pull yields nothing: caller marks the node done
        assert!(node.get_data().is_empty());
        node.done();
        assert_eq!(node.remaining_bytes(), 0);
    }

    #[test]
    fn file_node_with_bad_range_is_born_broken() {
        let path = std::env::temp_dir().join(format!("evtcp-node-test-{}", std::process::id()));
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&[0u8; 100])
            .unwrap();

        let node = BufferNode::file(&path, 101, 0);
        assert!(!node.available());
        assert_eq!(node.remaining_bytes(), 0);

        let node = BufferNode::file(&path, 50, 51);
        assert!(!node.available());

        let node = BufferNode::file(&path, 50, 0);
        assert!(node.available());
        assert_eq!(node.remaining_bytes(), 50);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn file_node_stages_and_counts_down() {
        let path = std::env::temp_dir().join(format!("evtcp-node-stage-{}", std::process::id()));
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"0123456789")
            .unwrap();

        let mut node = BufferNode::file(&path, 2, 5);
        assert_eq!(node.remaining_bytes(), 5);
        assert_eq!(node.get_data(), b"23456");
        node.retrieve(3);
        assert_eq!(node.remaining_bytes(), 2);
        assert_eq!(node.get_data(), b"56");
        node.retrieve(2);
        assert_eq!(node.remaining_bytes(), 0);

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn async_node_accepts_appends_until_closed() {
        let mut node = BufferNode::async_stream(7);
        assert!(node.available());
        assert_eq!(node.remaining_bytes(), 0);
        node.append(b"data");
        assert_eq!(node.remaining_bytes(), 4);
        node.done();
        assert!(!node.available());
        // closed nodes still drain what they hold
        assert_eq!(node.get_data(), b"data");
        node.retrieve(4);
        assert_eq!(node.remaining_bytes(), 0);
    }
}
