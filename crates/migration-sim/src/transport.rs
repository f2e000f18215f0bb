//! `MemTransport` — an in-memory byte-buffer `Transport` with a
//! configurable bytes-per-window rate limiter (spec.md §6.1, §6.4).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use migration_core::Transport;

struct Inner {
    buffer: VecDeque<u8>,
    window_bytes: u64,
    bytes_this_window: u64,
    error: Option<String>,
}

/// A shared in-memory pipe. Cloning yields a handle to the same underlying
/// buffer (an `Arc<Mutex<..>>`), so a sender-side handle's writes are
/// visible to a receiver-side handle's reads in the same process — this
/// stands in for the real transport's socket pair in single-process tests.
#[derive(Clone)]
pub struct MemTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MemTransport {
    /// An unlimited-rate transport (tests that don't care about throttling).
    pub fn new() -> Self {
        Self::with_rate_limit(u64::MAX)
    }

    /// A transport whose `rate_limited()` flips true once `window_bytes`
    /// have been put since the last [`MemTransport::reset_window`].
    pub fn with_rate_limit(window_bytes: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                buffer: VecDeque::new(),
                window_bytes,
                bytes_this_window: 0,
                error: None,
            })),
        }
    }

    /// Simulate the passage of a rate-limit window (the outer migration
    /// driver's clock tick that the transport uses to refill its budget).
    pub fn reset_window(&self) {
        self.inner.lock().unwrap().bytes_this_window = 0;
    }

    pub fn inject_error(&self, message: impl Into<String>) {
        self.inner.lock().unwrap().error = Some(message.into());
    }

    pub fn bytes_buffered(&self) -> usize {
        self.inner.lock().unwrap().buffer.len()
    }

    fn account(&self, n: u64) {
        self.inner.lock().unwrap().bytes_this_window += n;
    }
}

impl Default for MemTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for MemTransport {
    async fn put_u64_be(&mut self, word: u64) -> anyhow::Result<()> {
        self.inner.lock().unwrap().buffer.extend(word.to_be_bytes());
        self.account(8);
        Ok(())
    }

    async fn put_u8(&mut self, byte: u8) -> anyhow::Result<()> {
        self.inner.lock().unwrap().buffer.push_back(byte);
        self.account(1);
        Ok(())
    }

    async fn put_bytes(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.inner.lock().unwrap().buffer.extend(bytes.iter().copied());
        self.account(bytes.len() as u64);
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn get_u64_be(&mut self) -> anyhow::Result<u64> {
        let mut bytes = [0u8; 8];
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.buffer.len() < 8 {
                anyhow::bail!("truncated stream: expected 8-byte header, got {} bytes", inner.buffer.len());
            }
            for b in bytes.iter_mut() {
                *b = inner.buffer.pop_front().unwrap();
            }
        }
        Ok(u64::from_be_bytes(bytes))
    }

    async fn get_u8(&mut self) -> anyhow::Result<u8> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .buffer
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("truncated stream: expected 1 byte"))
    }

    async fn get_bytes(&mut self, buf: &mut [u8]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.buffer.len() < buf.len() {
            anyhow::bail!(
                "truncated stream: expected {} bytes, got {}",
                buf.len(),
                inner.buffer.len()
            );
        }
        for slot in buf.iter_mut() {
            *slot = inner.buffer.pop_front().unwrap();
        }
        Ok(())
    }

    fn rate_limited(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.bytes_this_window >= inner.window_bytes
    }

    fn rate_limit_window_bytes(&self) -> u64 {
        self.inner.lock().unwrap().window_bytes
    }

    fn error(&self) -> Option<anyhow::Error> {
        self.inner
            .lock()
            .unwrap()
            .error
            .clone()
            .map(anyhow::Error::msg)
    }
}
