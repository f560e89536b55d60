//! `TaskContext` and `TaskLogger`: the per-invocation collaborator bundle
//! passed to every handler.
//!
//! All callbacks on `TaskContext` are fire-and-await and never surface an
//! error to the handler -- a handler that cannot reach the host should
//! keep running; the next persistent update detects a lost lease.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Severity of a single log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for task_engine_db::models::LogLevel {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => task_engine_db::models::LogLevel::Trace,
            LogLevel::Debug => task_engine_db::models::LogLevel::Debug,
            LogLevel::Info => task_engine_db::models::LogLevel::Info,
            LogLevel::Warn => task_engine_db::models::LogLevel::Warn,
            LogLevel::Error => task_engine_db::models::LogLevel::Error,
        }
    }
}

/// A single buffered log entry, prior to being flushed to the pipe.
#[derive(Debug, Clone)]
pub struct BufferedLogEntry {
    pub level: LogLevel,
    pub message: String,
    pub extra: Option<Value>,
    pub recorded_at: DateTime<Utc>,
}

/// Event emitted by a `TaskContext` callback, consumed by whatever is
/// driving the invocation (the inline engine loop or a worker's host-side
/// proxy).
#[derive(Debug, Clone)]
pub enum ContextEvent {
    Log(Vec<BufferedLogEntry>),
    Progress(Value),
    Heartbeat,
}

/// Bounded ring-buffer logger wrapping the handler's log stream.
///
/// Entries accumulate up to `max_logging_buffer`; once that capacity is
/// reached the oldest `logging_buffer_truncation` entries are dropped and
/// replaced with one synthetic `WARN "truncated N entries"` entry.
/// `flush` drains up to `stream_buffer_size` entries per call.
#[derive(Debug)]
pub struct TaskLogger {
    buffer: VecDeque<BufferedLogEntry>,
    stream_buffer_size: usize,
    max_logging_buffer: usize,
    logging_buffer_truncation: usize,
}

impl TaskLogger {
    pub fn new(
        stream_buffer_size: usize,
        max_logging_buffer: usize,
        logging_buffer_truncation: usize,
    ) -> Self {
        Self {
            buffer: VecDeque::new(),
            stream_buffer_size,
            max_logging_buffer,
            logging_buffer_truncation,
        }
    }

    /// Append one entry, truncating the buffer if it has grown past
    /// `max_logging_buffer`.
    pub fn push(&mut self, level: LogLevel, message: impl Into<String>, extra: Option<Value>) {
        self.buffer.push_back(BufferedLogEntry {
            level,
            message: message.into(),
            extra,
            recorded_at: Utc::now(),
        });

        if self.buffer.len() > self.max_logging_buffer {
            let drop_count = self.logging_buffer_truncation.min(self.buffer.len());
            for _ in 0..drop_count {
                self.buffer.pop_front();
            }
            self.buffer.push_front(BufferedLogEntry {
                level: LogLevel::Warn,
                message: format!("truncated {drop_count} entries"),
                extra: None,
                recorded_at: Utc::now(),
            });
        }
    }

    /// Number of entries currently buffered.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Pop one `stream_buffer_size`-sized chunk off the front of the
    /// buffer if it has reached that threshold, else leave it untouched.
    /// Used to stream eagerly as entries accumulate rather than waiting
    /// for an explicit flush.
    fn take_chunk_if_ready(&mut self) -> Option<Vec<BufferedLogEntry>> {
        let threshold = self.stream_buffer_size.max(1);
        if self.buffer.len() < threshold {
            return None;
        }
        Some(self.buffer.drain(..threshold).collect())
    }

    /// Drain the buffer, calling `pipe` with at most `stream_buffer_size`
    /// entries per call, until the buffer is empty.
    pub async fn flush<F, Fut>(&mut self, mut pipe: F)
    where
        F: FnMut(Vec<BufferedLogEntry>) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let chunk_size = self.stream_buffer_size.max(1);
        while !self.buffer.is_empty() {
            let take = chunk_size.min(self.buffer.len());
            let chunk: Vec<BufferedLogEntry> = self.buffer.drain(..take).collect();
            pipe(chunk).await;
        }
    }
}

/// The collaborator bundle passed to a handler invocation.
///
/// `pipe`, `flush`, `progress`, and `heartbeat` all send a `ContextEvent`
/// over an internal channel and never return an error to the caller;
/// delivery failures (channel closed because the host gave up) are
/// silently absorbed, matching "none throws as part of normal operation".
pub struct TaskContext {
    pub task_id: Uuid,
    pub attempt: i32,
    pub result_cache: Arc<DashMap<String, Value>>,
    events: mpsc::Sender<ContextEvent>,
    logger: tokio::sync::Mutex<TaskLogger>,
    /// Kept so `for_test` contexts (no live receiver) don't panic on send;
    /// production contexts are built with a receiver owned by the caller.
    _events_rx_guard: Option<Arc<mpsc::Receiver<ContextEvent>>>,
}

/// Logging buffer sizing, mirroring the matching fields of `EngineConfig`.
/// Kept as a small bundle so constructors don't grow a three-`usize` tail.
#[derive(Debug, Clone, Copy)]
pub struct LoggingBufferConfig {
    pub stream_buffer_size: usize,
    pub max_logging_buffer: usize,
    pub logging_buffer_truncation: usize,
}

impl Default for LoggingBufferConfig {
    fn default() -> Self {
        Self {
            stream_buffer_size: 20,
            max_logging_buffer: 1_000,
            logging_buffer_truncation: 100,
        }
    }
}

impl TaskContext {
    /// Build a context whose events are observable via the returned
    /// receiver. Used by the inline engine loop and the worker's
    /// result-proxy to wire up pipe/progress/heartbeat handling.
    pub fn new(task_id: Uuid, attempt: i32) -> (Self, mpsc::Receiver<ContextEvent>) {
        Self::with_logging_config(task_id, attempt, Arc::new(DashMap::new()), LoggingBufferConfig::default())
    }

    /// Build a context pre-seeded with an existing result cache (used by
    /// the worker pool to carry forward `resultCache` values merged from a
    /// prior attempt).
    pub fn with_cache(
        task_id: Uuid,
        attempt: i32,
        result_cache: Arc<DashMap<String, Value>>,
    ) -> (Self, mpsc::Receiver<ContextEvent>) {
        Self::with_logging_config(task_id, attempt, result_cache, LoggingBufferConfig::default())
    }

    /// Full constructor: result cache and logging buffer sizing both
    /// explicit. Used by the engine, which resolves these from
    /// `EngineConfig` before building the per-invocation context.
    pub fn with_logging_config(
        task_id: Uuid,
        attempt: i32,
        result_cache: Arc<DashMap<String, Value>>,
        logging: LoggingBufferConfig,
    ) -> (Self, mpsc::Receiver<ContextEvent>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Self {
                task_id,
                attempt,
                result_cache,
                events: tx,
                logger: tokio::sync::Mutex::new(TaskLogger::new(
                    logging.stream_buffer_size,
                    logging.max_logging_buffer,
                    logging.logging_buffer_truncation,
                )),
                _events_rx_guard: None,
            },
            rx,
        )
    }

    /// A context suitable only for unit tests: events are sent into a
    /// channel nobody drains, which is fine since `send` failures are
    /// swallowed.
    pub fn for_test(task_id: Uuid, attempt: i32) -> Self {
        let (ctx, rx) = Self::new(task_id, attempt);
        // Leak the receiver end inside the context so the channel stays
        // open for the lifetime of the test context.
        Self {
            _events_rx_guard: Some(Arc::new(rx)),
            ..ctx
        }
    }

    /// Append one log entry, streaming eagerly once `stream_buffer_size`
    /// entries have accumulated.
    pub async fn log(&self, level: LogLevel, message: impl Into<String>, extra: Option<Value>) {
        let mut logger = self.logger.lock().await;
        logger.push(level, message, extra);
        while let Some(chunk) = logger.take_chunk_if_ready() {
            self.pipe(chunk).await;
        }
    }

    /// Emit buffered log entries toward the host directly, bypassing the
    /// internal logger. Never fails visibly.
    pub async fn pipe(&self, entries: Vec<BufferedLogEntry>) {
        let _ = self.events.send(ContextEvent::Log(entries)).await;
    }

    /// Drain anything still held in the internal logger, regardless of
    /// whether it has reached `stream_buffer_size`, then signal the host.
    pub async fn flush(&self) {
        let mut logger = self.logger.lock().await;
        let events = &self.events;
        logger
            .flush(|chunk| async {
                let _ = events.send(ContextEvent::Log(chunk)).await;
            })
            .await;
    }

    /// Report structured progress.
    pub async fn progress(&self, payload: Value) {
        let _ = self.events.send(ContextEvent::Progress(payload)).await;
    }

    /// Signal liveness; the receiver extends the task's lease.
    pub async fn heartbeat(&self) {
        let _ = self.events.send(ContextEvent::Heartbeat).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logger_flushes_in_chunks() {
        let mut logger = TaskLogger::new(2, 100, 10);
        for i in 0..5 {
            logger.push(LogLevel::Info, format!("msg {i}"), None);
        }
        assert_eq!(logger.len(), 5);
    }

    #[tokio::test]
    async fn logger_flush_drains_fully() {
        let mut logger = TaskLogger::new(2, 100, 10);
        for i in 0..5 {
            logger.push(LogLevel::Info, format!("msg {i}"), None);
        }
        let mut chunks = Vec::new();
        logger
            .flush(|chunk| {
                chunks.push(chunk.len());
                std::future::ready(())
            })
            .await;
        assert!(logger.is_empty());
        assert_eq!(chunks.iter().sum::<usize>(), 5);
        assert!(chunks.iter().all(|&n| n <= 2));
    }

    #[test]
    fn logger_truncates_oldest_entries() {
        let mut logger = TaskLogger::new(10, 3, 2);
        for i in 0..5 {
            logger.push(LogLevel::Info, format!("msg {i}"), None);
        }
        // max_logging_buffer=3: after the 4th push (len=4 > 3) we drop 2
        // oldest and prepend a warning, leaving len=3; after the 5th push
        // len=4 again triggers another truncation down to len=3.
        assert!(logger.len() <= 3);
        let messages: Vec<&str> = logger
            .buffer
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        assert!(messages.iter().any(|m| m.starts_with("truncated")));
    }

    #[test]
    fn stream_buffer_zero_flushes_synchronously() {
        // streamBufferSize = 0 -> every entry flushed as its own call
        // (clamped to chunk size 1).
        let logger = TaskLogger::new(0, 100, 10);
        assert_eq!(logger.stream_buffer_size, 0);
    }

    #[tokio::test]
    async fn context_callbacks_never_panic_without_receiver() {
        let ctx = TaskContext::for_test(Uuid::nil(), 0);
        ctx.heartbeat().await;
        ctx.progress(serde_json::json!({"pct": 50})).await;
        ctx.pipe(vec![]).await;
        ctx.flush().await;
    }

    #[tokio::test]
    async fn result_cache_round_trips() {
        let ctx = TaskContext::for_test(Uuid::nil(), 0);
        ctx.result_cache
            .insert("idempotency-key".to_string(), serde_json::json!(true));
        assert_eq!(
            ctx.result_cache.get("idempotency-key").map(|v| v.clone()),
            Some(serde_json::json!(true))
        );
    }
}
