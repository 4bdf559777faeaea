use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::firestore::error::{
    failed_precondition, unavailable, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::remote::backoff::ExponentialBackoff;
use crate::firestore::remote::datastore::{
    StreamHandle, StreamingDatastore, StreamingFuture, TokenProviderArc,
};
use crate::firestore::settings::BackoffSettings;
use crate::platform::runtime;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Listen,
    Write,
}

/// Lifecycle of a [`PersistentStream`].
///
/// `Initial` is both the state before the first start and after an explicit
/// stop. A stream that failed sits in `Backoff` until its reconnect delay has
/// elapsed and then goes back to `Starting`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    Starting,
    Open,
    Backoff,
}

pub trait PersistentStreamDelegate: Send + Sync + 'static {
    fn stream_label(&self) -> &'static str;

    /// The stream is open; `stream` may be used to send a handshake.
    fn on_stream_open(
        &self,
        stream: Arc<dyn StreamHandle>,
    ) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// An error closes the stream with that error.
    fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;

    /// The stream closed on its own: `Some` after a failure, `None` after an
    /// idle shutdown. Returns whether the stream should reconnect.
    fn on_stream_close(&self, error: Option<FirestoreError>) -> StreamingFuture<'_, bool>;
}

struct StreamInner {
    state: StreamState,
    /// Bumped on every start and stop so tasks of an older run can tell they are stale.
    generation: u64,
    handle: Option<Arc<dyn StreamHandle>>,
    backoff: ExponentialBackoff,
    /// The last run ended in an error, so the next start waits for the backoff.
    backoff_pending: bool,
    inhibit_backoff: bool,
    idle: bool,
}

/// A reconnecting bidirectional stream.
pub struct PersistentStream<D>
where
    D: PersistentStreamDelegate,
{
    datastore: Arc<dyn StreamingDatastore>,
    token_provider: TokenProviderArc,
    delegate: Arc<D>,
    kind: StreamKind,
    idle_timeout: Duration,
    inner: StdMutex<StreamInner>,
}

impl<D> PersistentStream<D>
where
    D: PersistentStreamDelegate,
{
    pub fn new(
        datastore: Arc<dyn StreamingDatastore>,
        token_provider: TokenProviderArc,
        delegate: Arc<D>,
        kind: StreamKind,
        backoff: BackoffSettings,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            datastore,
            token_provider,
            delegate,
            kind,
            idle_timeout,
            inner: StdMutex::new(StreamInner {
                state: StreamState::Initial,
                generation: 0,
                handle: None,
                backoff: ExponentialBackoff::new(backoff),
                backoff_pending: false,
                inhibit_backoff: false,
                idle: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StreamInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn delegate(&self) -> &Arc<D> {
        &self.delegate
    }

    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == StreamState::Open
    }

    /// Starting, open or waiting to reconnect.
    pub fn is_started(&self) -> bool {
        self.state() != StreamState::Initial
    }

    /// Begins connecting. Does nothing unless the stream is in `Initial`.
    pub fn start(self: &Arc<Self>) {
        let (generation, wait_for_backoff) = {
            let mut inner = self.lock();
            if inner.state != StreamState::Initial {
                return;
            }
            inner.generation += 1;
            inner.idle = false;
            let wait = std::mem::take(&mut inner.backoff_pending);
            inner.state = if wait {
                StreamState::Backoff
            } else {
                StreamState::Starting
            };
            (inner.generation, wait)
        };
        log::debug!("{} stream starting", self.delegate.stream_label());
        let stream = Arc::clone(self);
        runtime::spawn_detached(async move {
            stream.run(generation, wait_for_backoff).await;
        });
    }

    /// Closes the stream without notifying the delegate and resets the
    /// backoff. Late frames from the closed connection are dropped.
    pub fn stop(&self) {
        let handle = {
            let mut inner = self.lock();
            if inner.state == StreamState::Initial {
                return;
            }
            inner.generation += 1;
            inner.state = StreamState::Initial;
            inner.idle = false;
            inner.backoff_pending = false;
            inner.inhibit_backoff = false;
            inner.backoff.reset();
            inner.handle.take()
        };
        log::debug!("{} stream stopped", self.delegate.stream_label());
        close_in_background(handle);
    }

    /// The next reconnect after a failure happens immediately.
    pub fn inhibit_backoff(&self) {
        self.lock().inhibit_backoff = true;
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let handle = {
            let mut inner = self.lock();
            if inner.state != StreamState::Open {
                return Err(failed_precondition(format!(
                    "{} stream is not open",
                    self.delegate.stream_label()
                )));
            }
            inner.idle = false;
            inner.handle.clone()
        };
        match handle {
            Some(handle) => handle.send(payload).await,
            None => Err(failed_precondition("stream has no connection")),
        }
    }

    /// Closes the stream after the idle timeout unless it is used again first.
    pub fn mark_idle(self: &Arc<Self>) {
        let generation = {
            let mut inner = self.lock();
            if inner.state != StreamState::Open || inner.idle {
                return;
            }
            inner.idle = true;
            inner.generation
        };
        let stream = Arc::clone(self);
        let timeout = self.idle_timeout;
        runtime::spawn_detached(async move {
            runtime::sleep(timeout).await;
            stream.close_if_idle(generation).await;
        });
    }

    async fn close_if_idle(&self, generation: u64) {
        let handle = {
            let mut inner = self.lock();
            if inner.generation != generation || !inner.idle || inner.state != StreamState::Open
            {
                return;
            }
            inner.generation += 1;
            inner.state = StreamState::Initial;
            inner.idle = false;
            inner.backoff.reset();
            inner.handle.take()
        };
        log::debug!("{} stream closed after idle timeout", self.delegate.stream_label());
        close_in_background(handle);
        let _ = self.delegate.on_stream_close(None).await;
    }

    fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    fn transition(&self, generation: u64, state: StreamState) -> bool {
        let mut inner = self.lock();
        if inner.generation != generation {
            return false;
        }
        inner.state = state;
        true
    }

    async fn run(&self, generation: u64, mut wait_for_backoff: bool) {
        let label = self.delegate.stream_label();
        loop {
            if wait_for_backoff {
                let delay = {
                    let mut inner = self.lock();
                    if std::mem::take(&mut inner.inhibit_backoff) {
                        Duration::ZERO
                    } else {
                        inner.backoff.next_delay()
                    }
                };
                runtime::sleep(delay).await;
                if !self.transition(generation, StreamState::Starting) {
                    return;
                }
            }
            wait_for_backoff = true;

            let error = match self.connect(generation).await {
                Some(error) => error,
                None => return,
            };
            if !self.is_current(generation) {
                return;
            }

            log::debug!("{label} stream closed with error: {error}");
            let handle = {
                let mut inner = self.lock();
                inner.state = StreamState::Backoff;
                inner.idle = false;
                match error.code {
                    FirestoreErrorCode::ResourceExhausted => inner.backoff.reset_to_max(),
                    FirestoreErrorCode::Unauthenticated => self.token_provider.invalidate_token(),
                    _ => {}
                }
                inner.handle.take()
            };
            close_in_background(handle);

            let restart = self.delegate.on_stream_close(Some(error)).await;
            if !self.is_current(generation) {
                return;
            }
            if !restart {
                let mut inner = self.lock();
                inner.state = StreamState::Initial;
                inner.backoff_pending = true;
                return;
            }
        }
    }

    /// Opens one connection and pumps it. Returns the error that ended it,
    /// or `None` if the stream was stopped in the meantime.
    async fn connect(&self, generation: u64) -> Option<FirestoreError> {
        let token = match self.token_provider.get_token().await {
            Ok(token) => token,
            Err(error) => return Some(error),
        };
        let opened = match self.kind {
            StreamKind::Listen => self.datastore.open_listen_stream(token).await,
            StreamKind::Write => self.datastore.open_write_stream(token).await,
        };
        let handle = match opened {
            Ok(handle) => handle,
            Err(error) => return Some(error),
        };

        {
            let mut inner = self.lock();
            if inner.generation != generation {
                drop(inner);
                close_in_background(Some(handle));
                return None;
            }
            inner.state = StreamState::Open;
            inner.handle = Some(Arc::clone(&handle));
        }
        log::debug!("{} stream open", self.delegate.stream_label());

        if let Err(error) = self.delegate.on_stream_open(Arc::clone(&handle)).await {
            return Some(error);
        }

        loop {
            let frame = handle.next().await;
            if !self.is_current(generation) {
                return None;
            }
            match frame {
                Some(Ok(payload)) => {
                    self.lock().backoff.reset();
                    if let Err(error) = self.delegate.on_stream_message(payload).await {
                        return Some(error);
                    }
                }
                Some(Err(error)) => return Some(error),
                None => return Some(unavailable("stream closed by server")),
            }
        }
    }
}

fn close_in_background(handle: Option<Arc<dyn StreamHandle>>) {
    if let Some(handle) = handle {
        runtime::spawn_detached(async move {
            let _ = handle.close().await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{resource_exhausted, unauthenticated};
    use crate::firestore::remote::datastore::{
        box_stream_future, InMemoryStreamingDatastore, TokenProvider,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingDelegate {
        opens: AtomicUsize,
        messages: StdMutex<Vec<Vec<u8>>>,
        closes: StdMutex<Vec<Option<FirestoreErrorCode>>>,
        restart: AtomicBool,
    }

    impl PersistentStreamDelegate for RecordingDelegate {
        fn stream_label(&self) -> &'static str {
            "test"
        }

        fn on_stream_open(
            &self,
            _stream: Arc<dyn StreamHandle>,
        ) -> StreamingFuture<'_, FirestoreResult<()>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            box_stream_future(async { Ok(()) })
        }

        fn on_stream_message(&self, message: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
            self.messages.lock().unwrap().push(message);
            box_stream_future(async { Ok(()) })
        }

        fn on_stream_close(&self, error: Option<FirestoreError>) -> StreamingFuture<'_, bool> {
            self.closes.lock().unwrap().push(error.map(|e| e.code));
            let restart = self.restart.load(Ordering::SeqCst);
            box_stream_future(async move { restart })
        }
    }

    #[derive(Default)]
    struct CountingTokens {
        invalidations: AtomicUsize,
    }

    #[async_trait]
    impl TokenProvider for CountingTokens {
        async fn get_token(&self) -> FirestoreResult<Option<String>> {
            Ok(Some("token".into()))
        }

        fn invalidate_token(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_backoff() -> BackoffSettings {
        BackoffSettings {
            initial_delay: Duration::from_millis(5),
            backoff_factor: 1.5,
            max_delay: Duration::from_millis(20),
            jitter_factor: 0.0,
        }
    }

    fn stream(
        datastore: &InMemoryStreamingDatastore,
        delegate: Arc<RecordingDelegate>,
        tokens: Arc<CountingTokens>,
        idle_timeout: Duration,
    ) -> Arc<PersistentStream<RecordingDelegate>> {
        Arc::new(PersistentStream::new(
            Arc::new(datastore.clone()),
            tokens,
            delegate,
            StreamKind::Listen,
            fast_backoff(),
            idle_timeout,
        ))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn opens_and_delivers_messages() {
        let datastore = InMemoryStreamingDatastore::new();
        let delegate = Arc::new(RecordingDelegate::default());
        let tokens = Arc::new(CountingTokens::default());
        let stream = stream(&datastore, Arc::clone(&delegate), tokens, Duration::from_secs(60));

        assert_eq!(stream.state(), StreamState::Initial);
        stream.start();
        assert!(stream.is_started());
        let server = datastore.accept_listen().await.expect("stream opened");
        assert_eq!(server.auth_token(), Some("token"));
        wait_until(|| stream.is_open()).await;

        stream.send(b"{}".to_vec()).await.unwrap();
        assert_eq!(server.recv_json().await, Some(json!({})));
        server.send_json(&json!({ "n": 1 })).await.unwrap();
        wait_until(|| delegate.messages.lock().unwrap().len() == 1).await;

        stream.stop();
        assert_eq!(stream.state(), StreamState::Initial);
        assert!(stream.send(b"{}".to_vec()).await.is_err());
        assert!(delegate.closes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reconnects_after_failure_when_delegate_asks() {
        let datastore = InMemoryStreamingDatastore::new();
        let delegate = Arc::new(RecordingDelegate::default());
        delegate.restart.store(true, Ordering::SeqCst);
        let tokens = Arc::new(CountingTokens::default());
        let stream = stream(&datastore, Arc::clone(&delegate), Arc::clone(&tokens), Duration::from_secs(60));
        stream.start();

        let first = datastore.accept_listen().await.unwrap();
        first.fail(unauthenticated("expired")).await;
        let second = datastore.accept_listen().await.expect("reconnected");
        wait_until(|| stream.is_open()).await;
        assert_eq!(delegate.opens.load(Ordering::SeqCst), 2);
        assert_eq!(
            delegate.closes.lock().unwrap().as_slice(),
            &[Some(FirestoreErrorCode::Unauthenticated)]
        );
        assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 1);

        drop(second);
        wait_until(|| delegate.closes.lock().unwrap().len() == 2).await;
        assert_eq!(
            delegate.closes.lock().unwrap()[1],
            Some(FirestoreErrorCode::Unavailable)
        );
        stream.stop();
    }

    #[tokio::test]
    async fn stays_closed_when_delegate_declines() {
        let datastore = InMemoryStreamingDatastore::new();
        datastore.fail_next_open(resource_exhausted("quota"));
        let delegate = Arc::new(RecordingDelegate::default());
        let stream = stream(
            &datastore,
            Arc::clone(&delegate),
            Arc::new(CountingTokens::default()),
            Duration::from_secs(60),
        );
        stream.start();
        wait_until(|| delegate.closes.lock().unwrap().len() == 1).await;
        wait_until(|| !stream.is_started()).await;
        assert_eq!(datastore.listen_streams_opened(), 0);

        // The next start waits out the backoff before connecting again.
        stream.start();
        assert_eq!(stream.state(), StreamState::Backoff);
        assert!(datastore.accept_listen().await.is_some());
        stream.stop();
    }

    #[tokio::test]
    async fn idle_stream_closes_and_notifies() {
        let datastore = InMemoryStreamingDatastore::new();
        let delegate = Arc::new(RecordingDelegate::default());
        let stream = stream(
            &datastore,
            Arc::clone(&delegate),
            Arc::new(CountingTokens::default()),
            Duration::from_millis(20),
        );
        stream.start();
        let server = datastore.accept_listen().await.unwrap();
        wait_until(|| stream.is_open()).await;

        stream.mark_idle();
        wait_until(|| !stream.is_started()).await;
        wait_until(|| server.is_closed()).await;
        assert_eq!(delegate.closes.lock().unwrap().as_slice(), &[None]);
    }

    #[tokio::test]
    async fn sending_cancels_idle_shutdown() {
        let datastore = InMemoryStreamingDatastore::new();
        let delegate = Arc::new(RecordingDelegate::default());
        let stream = stream(
            &datastore,
            Arc::clone(&delegate),
            Arc::new(CountingTokens::default()),
            Duration::from_millis(30),
        );
        stream.start();
        let _server = datastore.accept_listen().await.unwrap();
        wait_until(|| stream.is_open()).await;

        stream.mark_idle();
        stream.send(b"{}".to_vec()).await.unwrap();
        runtime::sleep(Duration::from_millis(60)).await;
        assert!(stream.is_open());
        stream.stop();
    }
}
