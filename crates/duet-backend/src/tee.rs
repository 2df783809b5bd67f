//! One consumer for every child-process stream we read: each chunk goes to a
//! bounded ring buffer, to the console (through `tracing`) and to an optional
//! pattern-matching callback.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

/// Keeps the most recent `capacity` characters pushed into it.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    capacity: usize,
    buf: String,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            buf: String::new(),
        }
    }

    pub fn push(&mut self, chunk: &str) {
        self.buf.push_str(chunk);
        let count = self.buf.chars().count();
        if count > self.capacity {
            let drop = count - self.capacity;
            let cut = self
                .buf
                .char_indices()
                .nth(drop)
                .map(|(i, _)| i)
                .unwrap_or(self.buf.len());
            self.buf.drain(..cut);
        }
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

pub type SharedBuffer = Arc<Mutex<RingBuffer>>;

pub fn shared_buffer(capacity: usize) -> SharedBuffer {
    Arc::new(Mutex::new(RingBuffer::new(capacity)))
}

/// Snapshot of a shared buffer's contents.
pub fn snapshot(buffer: &SharedBuffer) -> String {
    buffer
        .lock()
        .map(|b| b.as_str().to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Echo {
    Off,
    Debug,
    Info,
}

type ChunkCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub struct Tee {
    label: String,
    echo: Echo,
    buffers: Vec<SharedBuffer>,
    on_chunk: Option<ChunkCallback>,
}

impl Tee {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            echo: Echo::Off,
            buffers: Vec::new(),
            on_chunk: None,
        }
    }

    pub fn echo(mut self, echo: Echo) -> Self {
        self.echo = echo;
        self
    }

    /// Also append every chunk to `buffer`. May be called more than once, e.g.
    /// a per-stream buffer plus a combined stdout+stderr one.
    pub fn buffer(mut self, buffer: SharedBuffer) -> Self {
        self.buffers.push(buffer);
        self
    }

    pub fn on_chunk(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_chunk = Some(Arc::new(f));
        self
    }

    /// Consume `reader` until EOF on a background task.
    pub fn spawn<R>(self, reader: R) -> JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        tokio::spawn(self.run(reader))
    }

    pub async fn run<R>(self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut tmp = [0u8; 4096];
        let mut pending: Vec<u8> = Vec::new();
        let mut line = String::new();
        loop {
            let n = match reader.read(&mut tmp).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(label = %self.label, "stream read error: {e}");
                    break;
                }
            };
            pending.extend_from_slice(&tmp[..n]);
            let text = take_utf8(&mut pending);
            if !text.is_empty() {
                self.dispatch(&text, &mut line);
            }
        }
        if !pending.is_empty() {
            let text = String::from_utf8_lossy(&pending).into_owned();
            self.dispatch(&text, &mut line);
        }
        if !line.is_empty() {
            self.emit_line(&line);
        }
    }

    fn dispatch(&self, text: &str, line: &mut String) {
        for buffer in &self.buffers {
            if let Ok(mut b) = buffer.lock() {
                b.push(text);
            }
        }
        if self.echo != Echo::Off {
            for ch in text.chars() {
                if ch == '\n' {
                    self.emit_line(line);
                    line.clear();
                } else {
                    line.push(ch);
                }
            }
        }
        if let Some(f) = &self.on_chunk {
            f(text);
        }
    }

    fn emit_line(&self, line: &str) {
        let line = line.trim_end_matches('\r');
        match self.echo {
            Echo::Off => {}
            Echo::Debug => tracing::debug!(target: "duet::child", "[{}] {}", self.label, line),
            Echo::Info => tracing::info!(target: "duet::child", "[{}] {}", self.label, line),
        }
    }
}

/// Drain the longest valid UTF-8 prefix of `pending`, leaving an incomplete
/// trailing sequence for the next read. Invalid bytes become U+FFFD.
fn take_utf8(pending: &mut Vec<u8>) -> String {
    match std::str::from_utf8(pending) {
        Ok(s) => {
            let out = s.to_string();
            pending.clear();
            out
        }
        Err(e) if e.error_len().is_none() => {
            let valid = e.valid_up_to();
            let out = String::from_utf8_lossy(&pending[..valid]).into_owned();
            pending.drain(..valid);
            out
        }
        Err(_) => {
            let out = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            out
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_keeps_tail() {
        let mut rb = RingBuffer::new(5);
        rb.push("abc");
        rb.push("defg");
        assert_eq!(rb.as_str(), "cdefg");
        rb.push("ü");
        assert_eq!(rb.as_str(), "defgü");
    }

    #[test]
    fn take_utf8_holds_back_split_sequence() {
        let bytes = "hé".as_bytes();
        let mut pending = bytes[..2].to_vec();
        assert_eq!(take_utf8(&mut pending), "h");
        assert_eq!(pending.len(), 1);
        pending.extend_from_slice(&bytes[2..]);
        assert_eq!(take_utf8(&mut pending), "é");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn tee_fans_out_to_buffers_and_callback() {
        let own = shared_buffer(100);
        let combined = shared_buffer(4);
        let seen = Arc::new(Mutex::new(String::new()));
        let seen_cb = seen.clone();
        let tee = Tee::new("test")
            .echo(Echo::Debug)
            .buffer(own.clone())
            .buffer(combined.clone())
            .on_chunk(move |chunk| seen_cb.lock().unwrap().push_str(chunk));

        tee.run(&b"line one\nline two"[..]).await;

        assert_eq!(snapshot(&own), "line one\nline two");
        assert_eq!(snapshot(&combined), " two");
        assert_eq!(seen.lock().unwrap().as_str(), "line one\nline two");
    }
}
