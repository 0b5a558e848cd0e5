//! Streaming output
//!
//! A generation worker pushes fragments through a bounded channel; the
//! consumer pulls them from a [`TextStream`]. Cancelling (explicitly, through
//! a [`CancelHandle`], or by dropping the stream) wakes a worker blocked on a
//! full buffer and stops it at the next fragment boundary.

use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::backend::{BackendError, StreamControl};

/// Fragments buffered ahead of a slow consumer
pub const DEFAULT_STREAM_BUFFER: usize = 32;

/// Message sent from the generation worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamToken {
    Token(String),
    Done,
    Error(StreamError),
}

/// Terminal failure of a stream. Fragments delivered before it stay valid.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("generation failed mid-stream: {0}")]
    Backend(String),
    #[error("generation worker stopped without finishing the stream")]
    WorkerLost,
}

/// Shared cancellation signal for one stream. Cancelling wakes the worker
/// even while it waits for buffer space.
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl Default for CancelHandle {
    fn default() -> Self {
        let (tx, _) = watch::channel(false);
        Self(Arc::new(tx))
    }
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.0.subscribe()
    }
}

/// Send `token` unless the stream is cancelled first. Returns whether it was
/// delivered.
fn deliver(
    runtime: &Runtime,
    tx: &mpsc::Sender<StreamToken>,
    cancelled: &mut watch::Receiver<bool>,
    token: StreamToken,
) -> bool {
    runtime.block_on(async {
        tokio::select! {
            biased;
            _ = cancelled.wait_for(|c| *c) => false,
            sent = tx.send(token) => sent.is_ok(),
        }
    })
}

/// Incremental generation output. Not restartable.
#[derive(Debug)]
pub struct TextStream {
    request_id: Uuid,
    rx: mpsc::Receiver<StreamToken>,
    cancel: CancelHandle,
    worker: Option<JoinHandle<()>>,
    finished: bool,
}

impl TextStream {
    /// Run `producer` on a dedicated worker thread and stream what it emits.
    ///
    /// The producer receives a sink that returns [`StreamControl::Stop`] once
    /// the stream is cancelled or dropped.
    pub(crate) fn spawn<F>(request_id: Uuid, buffer: usize, producer: F) -> std::io::Result<Self>
    where
        F: FnOnce(&mut dyn FnMut(&str) -> StreamControl) -> Result<(), BackendError>
            + Send
            + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let cancel = CancelHandle::default();
        let mut cancelled = cancel.subscribe();
        let runtime = tokio::runtime::Builder::new_current_thread().build()?;

        let worker = std::thread::Builder::new()
            .name(format!("generation-{}", &request_id.simple().to_string()[..8]))
            .spawn(move || {
                let mut sink = |piece: &str| {
                    if *cancelled.borrow() {
                        return StreamControl::Stop;
                    }
                    let token = StreamToken::Token(piece.to_string());
                    if deliver(&runtime, &tx, &mut cancelled, token) {
                        StreamControl::Continue
                    } else {
                        StreamControl::Stop
                    }
                };
                let result = producer(&mut sink);

                if *cancelled.borrow() {
                    tracing::debug!(%request_id, "Stream cancelled");
                    return;
                }
                let last = match result {
                    Ok(()) => StreamToken::Done,
                    Err(e) => {
                        tracing::warn!(%request_id, "Stream failed: {}", e);
                        StreamToken::Error(StreamError::Backend(e.to_string()))
                    }
                };
                deliver(&runtime, &tx, &mut cancelled, last);
            })?;

        Ok(Self {
            request_id,
            rx,
            cancel,
            worker: Some(worker),
            finished: false,
        })
    }

    pub fn request_id(&self) -> Uuid {
        self.request_id
    }

    /// Handle that cancels this stream from another thread or task
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Stop the stream. No further fragments are delivered.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
        self.finished = true;
    }

    /// Cancel and wait for the worker to release the model
    pub fn cancel_and_wait(mut self) {
        self.cancel();
        self.join_worker();
    }

    fn join_worker(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!(request_id = %self.request_id, "Generation worker panicked");
            }
        }
    }

    /// True once the stream has ended, normally or not
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Next fragment, waiting asynchronously.
    ///
    /// `None` after normal completion or cancellation; an `Err` item is
    /// always the last one.
    pub async fn next(&mut self) -> Option<Result<String, StreamError>> {
        if self.should_stop() {
            return None;
        }
        let token = self.rx.recv().await;
        self.settle(token)
    }

    /// Next fragment, blocking the current thread. Must not be called from
    /// inside an async runtime; use [`TextStream::next`] there.
    pub fn blocking_next(&mut self) -> Option<Result<String, StreamError>> {
        if self.should_stop() {
            return None;
        }
        let token = self.rx.blocking_recv();
        self.settle(token)
    }

    /// Drain the stream into one string, blocking the current thread
    pub fn collect_text(mut self) -> Result<String, StreamError> {
        let mut text = String::new();
        while let Some(fragment) = self.blocking_next() {
            text.push_str(&fragment?);
        }
        Ok(text)
    }

    fn should_stop(&mut self) -> bool {
        if !self.finished && self.cancel.is_cancelled() {
            self.rx.close();
            self.finished = true;
        }
        self.finished
    }

    fn settle(&mut self, token: Option<StreamToken>) -> Option<Result<String, StreamError>> {
        if self.cancel.is_cancelled() {
            self.finished = true;
            self.rx.close();
            return None;
        }
        match token {
            Some(StreamToken::Token(text)) => Some(Ok(text)),
            Some(StreamToken::Done) => {
                self.finished = true;
                None
            }
            Some(StreamToken::Error(e)) => {
                self.finished = true;
                Some(Err(e))
            }
            None => {
                self.finished = true;
                Some(Err(StreamError::WorkerLost))
            }
        }
    }
}

impl Iterator for TextStream {
    type Item = Result<String, StreamError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.blocking_next()
    }
}

/// Dropping an unfinished stream cancels it and waits for the worker, which
/// stops at its next fragment, so the model is free once `drop` returns.
impl Drop for TextStream {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel.cancel();
            self.rx.close();
        }
        self.join_worker();
    }
}

/// Holds back text that could be the start of a stop sequence and reports
/// when one is completed.
#[derive(Debug, Clone, Default)]
pub struct StopMatcher {
    stops: Vec<String>,
    pending: String,
}

impl StopMatcher {
    pub fn new(stops: &[String]) -> Self {
        Self {
            stops: stops.iter().filter(|s| !s.is_empty()).cloned().collect(),
            pending: String::new(),
        }
    }

    /// Feed generated text. Returns the text that is safe to emit and whether
    /// a stop sequence was hit (text from the stop sequence on is dropped).
    pub fn push(&mut self, piece: &str) -> (String, bool) {
        self.pending.push_str(piece);

        let hit = self
            .stops
            .iter()
            .filter_map(|stop| self.pending.find(stop.as_str()))
            .min();
        if let Some(at) = hit {
            let emit = self.pending[..at].to_string();
            self.pending.clear();
            return (emit, true);
        }

        let hold_from = self
            .pending
            .char_indices()
            .map(|(i, _)| i)
            .find(|&i| {
                let suffix = &self.pending[i..];
                self.stops.iter().any(|stop| stop.starts_with(suffix))
            })
            .unwrap_or(self.pending.len());

        let emit = self.pending[..hold_from].to_string();
        self.pending.drain(..hold_from);
        (emit, false)
    }

    /// Text still held back when generation ends without a stop
    pub fn finish(&mut self) -> String {
        std::mem::take(&mut self.pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    /// Emits "x" until told to stop, counting calls and flagging its exit
    fn endless(
        calls: Arc<AtomicUsize>,
        exited: std::sync::mpsc::Sender<()>,
    ) -> impl FnOnce(&mut dyn FnMut(&str) -> StreamControl) -> Result<(), BackendError>
           + Send
           + 'static {
        move |sink| {
            loop {
                calls.fetch_add(1, Ordering::SeqCst);
                if sink("x") == StreamControl::Stop {
                    break;
                }
            }
            let _ = exited.send(());
            Ok(())
        }
    }

    fn wait_until(deadline: Duration, cond: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        cond()
    }

    fn pieces(n: usize) -> impl FnOnce(&mut dyn FnMut(&str) -> StreamControl) -> Result<(), BackendError> {
        move |sink| {
            for i in 0..n {
                if sink(&format!("t{i} ")) == StreamControl::Stop {
                    break;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn test_fragments_arrive_in_order() {
        let stream = TextStream::spawn(Uuid::new_v4(), 2, pieces(5)).unwrap();
        let fragments: Vec<String> = stream.map(|f| f.unwrap()).collect();
        assert_eq!(fragments, vec!["t0 ", "t1 ", "t2 ", "t3 ", "t4 "]);
    }

    #[test]
    fn test_error_is_last_item() {
        let stream = TextStream::spawn(Uuid::new_v4(), 4, |sink| {
            sink("partial");
            Err(BackendError::Generation("out of memory".into()))
        })
        .unwrap();
        let items: Vec<_> = stream.collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok("partial".to_string()));
        assert!(matches!(items[1], Err(StreamError::Backend(_))));
    }

    #[test]
    fn test_cancel_stops_producer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let mut stream = TextStream::spawn(Uuid::new_v4(), 1, move |sink| {
            for _ in 0..10_000 {
                counter.fetch_add(1, Ordering::SeqCst);
                if sink("x") == StreamControl::Stop {
                    return Ok(());
                }
            }
            Ok(())
        })
        .unwrap();

        assert_eq!(stream.blocking_next(), Some(Ok("x".to_string())));
        stream.cancel();
        assert_eq!(stream.blocking_next(), None);
        stream.cancel_and_wait();

        // bounded buffer of one: the producer can be at most a couple of
        // fragments ahead when the cancel lands
        assert!(calls.load(Ordering::SeqCst) < 10);
    }

    #[test]
    fn test_cancel_handle_wakes_worker_blocked_on_full_buffer() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (exited_tx, exited_rx) = std::sync::mpsc::channel();
        let mut stream =
            TextStream::spawn(Uuid::new_v4(), 1, endless(calls.clone(), exited_tx)).unwrap();

        // one fragment buffered, the second send is waiting for space
        assert!(wait_until(Duration::from_secs(5), || calls.load(Ordering::SeqCst) >= 2));

        let handle = stream.cancel_handle();
        std::thread::spawn(move || handle.cancel()).join().unwrap();

        // nobody reads or drops the stream, the worker must still exit
        assert!(exited_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        let calls_at_exit = calls.load(Ordering::SeqCst);
        assert!(stream.cancel_handle().is_cancelled());
        assert_eq!(stream.blocking_next(), None);
        assert_eq!(calls.load(Ordering::SeqCst), calls_at_exit);
    }

    #[test]
    fn test_drop_waits_for_worker() {
        let calls = Arc::new(AtomicUsize::new(0));
        let exited = Arc::new(AtomicBool::new(false));
        let flag = exited.clone();
        let counter = calls.clone();
        let mut stream = TextStream::spawn(Uuid::new_v4(), 1, move |sink| {
            loop {
                counter.fetch_add(1, Ordering::SeqCst);
                if sink("x") == StreamControl::Stop {
                    break;
                }
            }
            flag.store(true, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        assert_eq!(stream.blocking_next(), Some(Ok("x".to_string())));
        drop(stream);
        assert!(exited.load(Ordering::SeqCst));
    }

    #[test]
    fn test_stop_matcher_holds_back_partial_match() {
        let mut matcher = StopMatcher::new(&["</s>".to_string()]);
        assert_eq!(matcher.push("Hello <"), ("Hello ".to_string(), false));
        assert_eq!(matcher.push("/"), (String::new(), false));
        assert_eq!(matcher.push("s> tail"), (String::new(), true));
    }

    #[test]
    fn test_stop_matcher_releases_false_alarm() {
        let mut matcher = StopMatcher::new(&["###".to_string()]);
        assert_eq!(matcher.push("a#"), ("a".to_string(), false));
        assert_eq!(matcher.push("b"), ("#b".to_string(), false));
        assert_eq!(matcher.push("#"), (String::new(), false));
        assert_eq!(matcher.finish(), "#");
    }
}
