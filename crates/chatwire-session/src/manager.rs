//! Session lifecycle: open, wait for readiness, close, reopen.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use chatwire_api::ApiClient;
use chatwire_core::{
    Codec, Connector, Event, Gateway, GatewayError, Handler, HandlerGuard, Identifier, Intents,
};
use chatwire_gateway::WsConnector;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{
    auth::{self, AuthError},
    bridge,
};

/// How long `open` waits for the event loop to exit after its caller gave up.
const CANCEL_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Session error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Failed to construct gateway: {0}")]
    GatewayConstruct(#[source] GatewayError),
    #[error("Session is already closed")]
    AlreadyClosed,
    #[error("Open cancelled before the gateway became ready")]
    OpenCancelled,
    #[error("Gateway event loop terminated before ready{}", fmt_cause(.0))]
    EventLoopTerminated(Option<GatewayError>),
    #[error("Gateway error: {0}")]
    Gateway(#[source] GatewayError),
    #[error("Cannot wait for gateway exit: timed out after {0:?}")]
    CloseTimedOut(Duration),
}

fn fmt_cause(cause: &Option<GatewayError>) -> String {
    cause.as_ref().map(|e| format!(": {e}")).unwrap_or_default()
}

/// A live connection. Both tokens exist exactly as long as the connection.
struct OpenConnection {
    /// Cancels the gateway connection.
    cancel: CancellationToken,
    /// Cancelled by the bridge loop when it exits.
    done: CancellationToken,
    task: JoinHandle<()>,
}

enum Connection {
    Closed,
    Open(OpenConnection),
}

struct SessionState {
    identifier: Identifier,
    gateway: Option<Arc<dyn Gateway>>,
    conn: Connection,
}

/// Lock-free mirror of the identifier's intents.
///
/// Bit 32 records whether any intents were configured; the low 32 bits hold
/// the mask. One word, so readers never see half an update.
struct IntentsMirror(AtomicU64);

const INTENTS_CONFIGURED: u64 = 1 << 32;
const INTENTS_MASK: u64 = 0xFFFF_FFFF;

impl IntentsMirror {
    fn new(intents: Option<Intents>) -> Self {
        let mirror = Self(AtomicU64::new(0));
        mirror.store(intents);
        mirror
    }

    fn store(&self, intents: Option<Intents>) {
        let word = intents.map_or(0, |i| INTENTS_CONFIGURED | u64::from(i.bits()));
        self.0.store(word, Ordering::Release);
    }

    fn has(&self, intents: Intents) -> bool {
        let word = self.0.load(Ordering::Acquire);
        if word & INTENTS_CONFIGURED == 0 {
            return true;
        }
        let bits = u32::try_from(word & INTENTS_MASK).unwrap_or(u32::MAX);
        Intents::from_bits(bits).contains(intents)
    }
}

/// Manages the REST client and the gateway together.
///
/// Decoded gateway events are published to [`Session::handler`]. A session
/// can be opened, closed and reopened any number of times.
pub struct Session {
    api: ApiClient,
    handler: Arc<Handler>,
    connector: Arc<dyn Connector>,
    codec: Codec,
    state: Mutex<SessionState>,
    intents: IntentsMirror,
}

impl Session {
    /// Create a session from a token. Bots should usually prefer
    /// [`Session::with_intents`].
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self::with_identifier(Identifier::new(token))
    }

    /// Create a session that identifies with the given intents.
    #[must_use]
    pub fn with_intents(token: impl Into<String>, intents: Intents) -> Self {
        let mut id = Identifier::new(token);
        id.add_intents(intents);
        Self::with_identifier(id)
    }

    /// Create a bare session for an identifier.
    #[must_use]
    pub fn with_identifier(id: Identifier) -> Self {
        let api = ApiClient::new(id.token.clone());
        let connector = Arc::new(WsConnector::new(api.clone()));
        Self::custom(id, api, Handler::new(), connector)
    }

    /// Create a session around an unopened gateway.
    #[must_use]
    pub fn with_gateway(gateway: Arc<dyn Gateway>, handler: Arc<Handler>) -> Self {
        let id = gateway.identifier();
        let api = ApiClient::new(id.token.clone());
        let connector = Arc::new(WsConnector::new(api.clone()));
        Self::from_parts(id, api, handler, connector, Some(gateway))
    }

    /// Create a session from its parts.
    #[must_use]
    pub fn custom(
        id: Identifier,
        api: ApiClient,
        handler: Arc<Handler>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self::from_parts(id, api, handler, connector, None)
    }

    fn from_parts(
        id: Identifier,
        api: ApiClient,
        handler: Arc<Handler>,
        connector: Arc<dyn Connector>,
        gateway: Option<Arc<dyn Gateway>>,
    ) -> Self {
        Self {
            api,
            handler,
            connector,
            codec: Codec::gateway(),
            intents: IntentsMirror::new(id.intents),
            state: Mutex::new(SessionState {
                identifier: id,
                gateway,
                conn: Connection::Closed,
            }),
        }
    }

    /// Replace the codec used to decode gateway frames. Takes effect on the
    /// next [`Session::open`].
    #[must_use]
    pub fn with_codec(mut self, codec: Codec) -> Self {
        self.codec = codec;
        self
    }

    /// Log in as a user account and create a session for the token.
    ///
    /// `api` is used only for the login exchanges; scope it with
    /// [`ApiClient::with_context`] to bound them. The session gets a fresh
    /// client with the same configuration.
    ///
    /// # Errors
    /// Returns [`AuthError::MfaRequired`] if a 2FA code is needed but `code`
    /// is empty, or the error of the failed exchange.
    pub async fn login(
        api: &ApiClient,
        email: &str,
        password: &str,
        code: &str,
    ) -> Result<Self, AuthError> {
        let token = auth::login(api, email, password, code).await?;
        let api = ApiClient::with_config(token.clone(), api.config().clone());
        let connector = Arc::new(WsConnector::new(api.clone()));
        Ok(Self::custom(Identifier::new(token), api, Handler::new(), connector))
    }

    #[must_use]
    pub const fn api(&self) -> &ApiClient {
        &self.api
    }

    #[must_use]
    pub const fn handler(&self) -> &Arc<Handler> {
        &self.handler
    }

    /// Register an event callback on the session's handler.
    pub fn add_handler<F>(&self, sink: F) -> HandlerGuard
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.handler.add_handler(sink)
    }

    /// Add intents to the identifier and, if one exists, the gateway.
    ///
    /// Intents are sent when identifying; adding them to an open session
    /// only affects the next [`Session::open`].
    pub async fn add_intents(&self, intents: Intents) {
        let mut state = self.state.lock().await;
        state.identifier.add_intents(intents);
        self.intents.store(state.identifier.intents);

        if let Some(gateway) = &state.gateway {
            gateway.add_intents(intents);
        }
    }

    /// Reports whether the session has the given intents.
    ///
    /// If no intents are set, e.g. for a user account, this always returns
    /// true.
    #[must_use]
    pub fn has_intents(&self, intents: Intents) -> bool {
        self.intents.has(intents)
    }

    /// The current gateway, if one was given or constructed by an open.
    pub async fn gateway(&self) -> Option<Arc<dyn Gateway>> {
        self.state.lock().await.gateway.clone()
    }

    /// Whether the session currently holds a connection.
    pub async fn is_open(&self) -> bool {
        matches!(self.state.lock().await.conn, Connection::Open(_))
    }

    /// Borrow the session with a REST client scoped to `cancel`.
    #[must_use]
    pub fn with_context(&self, cancel: CancellationToken) -> SessionView<'_> {
        SessionView {
            session: self,
            api: self.api.with_context(cancel),
        }
    }

    /// Open the gateway and wait until the session is ready or resumed.
    ///
    /// An already open session is closed first. `cancel` only bounds the
    /// wait: once this returns `Ok`, the connection lives until
    /// [`Session::close`].
    ///
    /// # Errors
    /// Returns error if closing the previous connection fails, the gateway
    /// cannot be constructed, `cancel` fires first, or the event loop dies
    /// before readiness.
    pub async fn open(&self, cancel: &CancellationToken) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;

        if matches!(state.conn, Connection::Open(_)) {
            // Left closed on error, so a retry starts fresh.
            self.close_locked(&mut state, None).await?;
        }

        let gateway = if let Some(gateway) = &state.gateway {
            Arc::clone(gateway)
        } else {
            let gateway = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(SessionError::OpenCancelled),
                res = self.connector.connect(&state.identifier) => {
                    res.map_err(SessionError::GatewayConstruct)?
                }
            };
            state.gateway = Some(Arc::clone(&gateway));
            gateway
        };

        let (ready_tx, mut ready_rx) = mpsc::unbounded_channel();
        let listener = self.handler.add_handler(move |ev| {
            if ev.is_ready() {
                let _ = ready_tx.send(());
            }
        });

        // Owned by the session, not derived from `cancel`.
        let conn_cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let frames = gateway.connect(conn_cancel.clone());
        let task = tokio::spawn(bridge::run(
            frames,
            self.codec.clone(),
            Arc::clone(&self.handler),
            done.clone(),
        ));
        state.conn = Connection::Open(OpenConnection {
            cancel: conn_cancel,
            done: done.clone(),
            task,
        });
        tracing::debug!("Gateway started, waiting for ready");

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                listener.remove();
                if let Err(e) = self.close_locked(&mut state, Some(CANCEL_CLOSE_TIMEOUT)).await {
                    tracing::debug!("Error closing cancelled open: {e}");
                }
                Err(SessionError::OpenCancelled)
            }
            Some(()) = ready_rx.recv() => {
                listener.remove();
                tracing::debug!("Gateway ready");
                Ok(())
            }
            () = done.cancelled() => {
                Err(SessionError::EventLoopTerminated(gateway.last_error()))
            }
        }
    }

    /// Close the gateway connection and wait for the event loop to exit.
    ///
    /// # Errors
    /// Returns [`SessionError::AlreadyClosed`] if the session is not open,
    /// or the gateway's last error if the connection ended with one.
    pub async fn close(&self) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        self.close_locked(&mut state, None).await
    }

    async fn close_locked(
        &self,
        state: &mut SessionState,
        wait: Option<Duration>,
    ) -> Result<(), SessionError> {
        let Connection::Open(conn) = std::mem::replace(&mut state.conn, Connection::Closed) else {
            return Err(SessionError::AlreadyClosed);
        };

        conn.cancel.cancel();

        match wait {
            None => conn.done.cancelled().await,
            Some(limit) => {
                if tokio::time::timeout(limit, conn.done.cancelled()).await.is_err() {
                    conn.task.abort();
                    return Err(SessionError::CloseTimedOut(limit));
                }
            }
        }
        tracing::debug!("Gateway closed");

        match state.gateway.as_ref().and_then(|g| g.last_error()) {
            Some(e) => Err(SessionError::Gateway(e)),
            None => Ok(()),
        }
    }
}

/// A session borrowed with its own request-scoped REST client.
///
/// Shares the session's state and gateway. It has no `open` or `close`:
/// the lifecycle belongs to the [`Session`] it borrows.
pub struct SessionView<'a> {
    session: &'a Session,
    api: ApiClient,
}

impl SessionView<'_> {
    /// REST client scoped to this view's context.
    #[must_use]
    pub const fn api(&self) -> &ApiClient {
        &self.api
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<Handler> {
        self.session.handler()
    }

    pub async fn add_intents(&self, intents: Intents) {
        self.session.add_intents(intents).await;
    }

    #[must_use]
    pub fn has_intents(&self, intents: Intents) -> bool {
        self.session.has_intents(intents)
    }

    pub async fn gateway(&self) -> Option<Arc<dyn Gateway>> {
        self.session.gateway().await
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        future::Future,
        sync::{Mutex as StdMutex, atomic::AtomicUsize},
    };

    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::{StreamExt, stream::{self, BoxStream}};
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    const READY: &str =
        r#"{"op":0,"s":1,"t":"READY","d":{"v":10,"user":{"id":"1","username":"bot"},"session_id":"abc"}}"#;
    const RESUMED: &str = r#"{"op":0,"s":2,"t":"RESUMED","d":{}}"#;
    const HELLO: &str = r#"{"op":10,"d":{"heartbeat_interval":41250}}"#;
    const UNKNOWN: &str = r#"{"op":0,"s":2,"t":"SOMETHING_NEW","d":{}}"#;
    const MESSAGE: &str = r#"{"op":0,"s":3,"t":"MESSAGE_CREATE","d":{"id":"5","channel_id":"6","author":{"id":"1","username":"bot"},"content":"hi"}}"#;

    async fn within<F: Future>(fut: F) -> F::Output {
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("timed out")
    }

    /// What a scripted stream does after its frames.
    enum Tail {
        End,
        UntilCancel,
        /// Ignores cancellation.
        Never,
    }

    /// Frames one connection emits.
    struct Script {
        frames: Vec<&'static str>,
        tail: Tail,
    }

    impl Script {
        fn ready() -> Self {
            Self {
                frames: vec![HELLO, READY],
                tail: Tail::UntilCancel,
            }
        }
    }

    struct LiveGuard(Arc<AtomicUsize>);

    impl LiveGuard {
        fn new(live: &Arc<AtomicUsize>) -> Self {
            live.fetch_add(1, Ordering::SeqCst);
            Self(Arc::clone(live))
        }
    }

    impl Drop for LiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct ScriptedGateway {
        identifier: StdMutex<Option<Identifier>>,
        scripts: StdMutex<VecDeque<Script>>,
        live: Arc<AtomicUsize>,
        connects: AtomicUsize,
        last_error: StdMutex<Option<GatewayError>>,
    }

    impl ScriptedGateway {
        fn new(scripts: impl IntoIterator<Item = Script>) -> Arc<Self> {
            Arc::new(Self {
                scripts: StdMutex::new(scripts.into_iter().collect()),
                ..Self::default()
            })
        }

        fn live(&self) -> usize {
            self.live.load(Ordering::SeqCst)
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }
    }

    impl Gateway for ScriptedGateway {
        fn connect(&self, cancel: CancellationToken) -> BoxStream<'static, Bytes> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let script = self
                .scripts
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(Script::ready);
            let live = LiveGuard::new(&self.live);

            let frames = stream::iter(
                script
                    .frames
                    .into_iter()
                    .map(|f| Bytes::from_static(f.as_bytes())),
            );
            let tail = match script.tail {
                Tail::End => stream::empty().boxed(),
                Tail::UntilCancel => stream::once(async move { cancel.cancelled().await })
                    .filter_map(|()| async { None::<Bytes> })
                    .boxed(),
                Tail::Never => stream::pending().boxed(),
            };

            frames
                .chain(tail)
                .map(move |frame| {
                    let _live = &live;
                    frame
                })
                .boxed()
        }

        fn add_intents(&self, intents: Intents) {
            self.identifier
                .lock()
                .unwrap()
                .get_or_insert_with(|| Identifier::new("tok"))
                .add_intents(intents);
        }

        fn last_error(&self) -> Option<GatewayError> {
            self.last_error.lock().unwrap().clone()
        }

        fn identifier(&self) -> Identifier {
            self.identifier
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Identifier::new("tok"))
        }
    }

    struct StaticConnector {
        gateway: Arc<ScriptedGateway>,
        built: AtomicUsize,
    }

    #[async_trait]
    impl Connector for StaticConnector {
        async fn connect(&self, _id: &Identifier) -> Result<Arc<dyn Gateway>, GatewayError> {
            self.built.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::clone(&self.gateway) as Arc<dyn Gateway>)
        }
    }

    struct FailingConnector;

    #[async_trait]
    impl Connector for FailingConnector {
        async fn connect(&self, _id: &Identifier) -> Result<Arc<dyn Gateway>, GatewayError> {
            Err(GatewayError::Connect("no route to gateway".to_string()))
        }
    }

    struct StuckConnector;

    #[async_trait]
    impl Connector for StuckConnector {
        async fn connect(&self, _id: &Identifier) -> Result<Arc<dyn Gateway>, GatewayError> {
            std::future::pending().await
        }
    }

    fn session(gateway: &Arc<ScriptedGateway>) -> Session {
        let connector = Arc::new(StaticConnector {
            gateway: Arc::clone(gateway),
            built: AtomicUsize::new(0),
        });
        Session::custom(Identifier::new("tok"), ApiClient::new("tok"), Handler::new(), connector)
    }

    #[tokio::test]
    async fn test_close_never_opened() {
        let session = Session::new("tok");
        let err = assert_err!(session.close().await);
        assert!(matches!(err, SessionError::AlreadyClosed));
    }

    #[tokio::test]
    async fn test_open_then_close() {
        let gateway = ScriptedGateway::new([Script::ready()]);
        let session = session(&gateway);

        assert_ok!(within(session.open(&CancellationToken::new())).await);
        assert!(session.is_open().await);
        assert_eq!(gateway.live(), 1);

        assert_ok!(within(session.close()).await);
        assert!(!session.is_open().await);
        assert_eq!(gateway.live(), 0);

        let err = assert_err!(session.close().await);
        assert!(matches!(err, SessionError::AlreadyClosed));
    }

    #[tokio::test]
    async fn test_resumed_counts_as_ready() {
        let gateway = ScriptedGateway::new([Script {
            frames: vec![HELLO, RESUMED],
            tail: Tail::UntilCancel,
        }]);
        let session = session(&gateway);

        assert_ok!(within(session.open(&CancellationToken::new())).await);
        assert_ok!(within(session.close()).await);
    }

    #[tokio::test]
    async fn test_reopen_keeps_single_event_loop() {
        let gateway = ScriptedGateway::new([Script::ready(), Script::ready()]);
        let session = session(&gateway);
        let cancel = CancellationToken::new();

        assert_ok!(within(session.open(&cancel)).await);
        assert_ok!(within(session.open(&cancel)).await);

        assert_eq!(gateway.connects(), 2);
        assert_eq!(gateway.live(), 1);
        assert!(session.is_open().await);

        assert_ok!(within(session.close()).await);
        assert_eq!(gateway.live(), 0);
    }

    #[tokio::test]
    async fn test_gateway_constructed_once() {
        let gateway = ScriptedGateway::new([Script::ready(), Script::ready()]);
        let connector = Arc::new(StaticConnector {
            gateway: Arc::clone(&gateway),
            built: AtomicUsize::new(0),
        });
        let session = Session::custom(
            Identifier::new("tok"),
            ApiClient::new("tok"),
            Handler::new(),
            Arc::clone(&connector) as Arc<dyn Connector>,
        );

        assert!(session.gateway().await.is_none());
        assert_ok!(within(session.open(&CancellationToken::new())).await);
        assert_ok!(within(session.close()).await);
        assert_ok!(within(session.open(&CancellationToken::new())).await);

        assert_eq!(connector.built.load(Ordering::SeqCst), 1);
        assert!(session.gateway().await.is_some());
    }

    #[tokio::test]
    async fn test_cancel_before_ready() {
        let gateway = ScriptedGateway::new([
            Script {
                frames: vec![HELLO],
                tail: Tail::UntilCancel,
            },
            Script::ready(),
        ]);
        let session = session(&gateway);

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        };

        let (res, ()) = within(async { tokio::join!(session.open(&cancel), canceller) }).await;
        assert!(matches!(res, Err(SessionError::OpenCancelled)));
        assert!(!session.is_open().await);
        assert_eq!(gateway.live(), 0);

        assert_ok!(within(session.open(&CancellationToken::new())).await);
        assert!(session.is_open().await);
    }

    #[tokio::test]
    async fn test_event_loop_death_before_ready() {
        let gateway = ScriptedGateway::new([Script {
            frames: vec![HELLO],
            tail: Tail::End,
        }]);
        *gateway.last_error.lock().unwrap() = Some(GatewayError::Closed {
            code: 4004,
            reason: "Authentication failed.".to_string(),
        });
        let session = session(&gateway);

        let err = assert_err!(within(session.open(&CancellationToken::new())).await);
        assert!(matches!(
            err,
            SessionError::EventLoopTerminated(Some(GatewayError::Closed { code: 4004, .. }))
        ));

        let err = assert_err!(within(session.close()).await);
        assert!(matches!(err, SessionError::Gateway(GatewayError::Closed { code: 4004, .. })));
    }

    #[tokio::test]
    async fn test_gateway_construct_failure() {
        let session = Session::custom(
            Identifier::new("tok"),
            ApiClient::new("tok"),
            Handler::new(),
            Arc::new(FailingConnector),
        );

        let err = assert_err!(within(session.open(&CancellationToken::new())).await);
        assert!(matches!(err, SessionError::GatewayConstruct(GatewayError::Connect(_))));
        assert!(!session.is_open().await);
    }

    #[tokio::test]
    async fn test_events_reach_handler_in_order() {
        let gateway = ScriptedGateway::new([Script {
            frames: vec![HELLO, READY, UNKNOWN, MESSAGE],
            tail: Tail::UntilCancel,
        }]);
        let session = session(&gateway);
        let (_guard, mut rx) = session.handler().subscribe();

        assert_ok!(within(session.open(&CancellationToken::new())).await);

        assert!(matches!(within(rx.recv()).await, Some(Event::Hello(_))));
        assert!(matches!(within(rx.recv()).await, Some(Event::Ready(_))));
        assert!(matches!(within(rx.recv()).await, Some(Event::BackgroundError(_))));
        match within(rx.recv()).await {
            Some(Event::MessageCreate(msg)) => assert_eq!(msg.0.content, "hi"),
            other => panic!("expected message, got {other:?}"),
        }

        // Only the caller's subscription is left.
        assert_eq!(session.handler().len(), 1);
        assert_ok!(within(session.close()).await);
    }

    #[tokio::test]
    async fn test_intents_mirror() {
        let session = Session::new("tok");
        assert!(session.has_intents(Intents::GUILD_MESSAGES));

        session.add_intents(Intents::GUILDS).await;
        assert!(session.has_intents(Intents::GUILDS));
        assert!(!session.has_intents(Intents::GUILD_MESSAGES));

        let session = Session::with_intents("tok", Intents::DIRECT_MESSAGES);
        assert!(session.has_intents(Intents::DIRECT_MESSAGES));
        assert!(!session.has_intents(Intents::GUILDS));
    }

    #[tokio::test]
    async fn test_add_intents_reaches_gateway() {
        let gateway = ScriptedGateway::new([Script::ready()]);
        let session = session(&gateway);

        assert_ok!(within(session.open(&CancellationToken::new())).await);
        session.add_intents(Intents::MESSAGE_CONTENT).await;

        assert!(gateway.identifier().has_intents(Intents::MESSAGE_CONTENT));
        assert_ok!(within(session.close()).await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_intents_never_torn() {
        let gateway = ScriptedGateway::new([Script::ready()]);
        let session = Arc::new(session(&gateway));
        assert_ok!(within(session.open(&CancellationToken::new())).await);

        let tasks: Vec<_> = (0..16)
            .map(|bit| {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    let intent = Intents::from_bits(1 << bit);
                    session.add_intents(intent).await;
                    for _ in 0..100 {
                        assert!(session.has_intents(intent));
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for task in tasks {
            assert_ok!(task.await);
        }

        let all = Intents::from_bits(0xFFFF);
        assert!(session.has_intents(all));
        assert!(gateway.identifier().has_intents(all));
        assert_ok!(within(session.close()).await);
    }

    #[tokio::test]
    async fn test_with_context_view_shares_state() {
        let gateway = ScriptedGateway::new([Script::ready()]);
        let session = session(&gateway);
        assert_ok!(within(session.open(&CancellationToken::new())).await);

        let cancel = CancellationToken::new();
        let view = session.with_context(cancel);
        assert!(view.gateway().await.is_some());
        assert_eq!(view.api().token(), "tok");

        view.add_intents(Intents::GUILDS).await;
        assert!(session.has_intents(Intents::GUILDS));
        assert!(view.has_intents(Intents::GUILDS));

        assert_ok!(within(session.close()).await);
    }

    #[tokio::test]
    async fn test_with_gateway_uses_given_gateway() {
        let gateway = ScriptedGateway::new([Script::ready()]);
        let session = Session::with_gateway(Arc::clone(&gateway) as Arc<dyn Gateway>, Handler::new());

        assert_ok!(within(session.open(&CancellationToken::new())).await);
        assert_eq!(gateway.connects(), 1);
        assert_ok!(within(session.close()).await);
    }

    #[tokio::test]
    async fn test_reopen_surfaces_previous_close_error() {
        let gateway = ScriptedGateway::new([Script::ready(), Script::ready()]);
        let session = session(&gateway);

        assert_ok!(within(session.open(&CancellationToken::new())).await);
        *gateway.last_error.lock().unwrap() = Some(GatewayError::Closed {
            code: 4000,
            reason: "boom".to_string(),
        });

        let err = assert_err!(within(session.open(&CancellationToken::new())).await);
        assert!(matches!(err, SessionError::Gateway(GatewayError::Closed { code: 4000, .. })));
        assert!(!session.is_open().await);
        assert_eq!(gateway.live(), 0);
        assert_eq!(gateway.connects(), 1);

        // Closed by the failed attempt, so a retry opens cleanly.
        *gateway.last_error.lock().unwrap() = None;
        assert_ok!(within(session.open(&CancellationToken::new())).await);
        assert_eq!(gateway.connects(), 2);
        assert_ok!(within(session.close()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_open_bounds_close_of_stuck_loop() {
        let gateway = ScriptedGateway::new([Script {
            frames: vec![HELLO],
            tail: Tail::Never,
        }]);
        let session = Session::with_gateway(Arc::clone(&gateway) as Arc<dyn Gateway>, Handler::new());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = tokio::time::Instant::now();

        let err = assert_err!(session.open(&cancel).await);
        assert!(matches!(err, SessionError::OpenCancelled));
        assert!(started.elapsed() >= CANCEL_CLOSE_TIMEOUT);
        assert!(!session.is_open().await);

        // The stuck loop was aborted, releasing its stream.
        while gateway.live() > 0 {
            tokio::task::yield_now().await;
        }

        let err = assert_err!(session.close().await);
        assert!(matches!(err, SessionError::AlreadyClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_close_times_out() {
        let gateway = ScriptedGateway::new([Script {
            frames: vec![HELLO, READY],
            tail: Tail::Never,
        }]);
        let session = session(&gateway);
        assert_ok!(session.open(&CancellationToken::new()).await);

        let limit = Duration::from_secs(1);
        let res = {
            let mut state = session.state.lock().await;
            session.close_locked(&mut state, Some(limit)).await
        };
        assert!(matches!(res, Err(SessionError::CloseTimedOut(d)) if d == limit));
        assert!(!session.is_open().await);

        while gateway.live() > 0 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_cancel_while_constructing_gateway() {
        let session = Session::custom(
            Identifier::new("tok"),
            ApiClient::new("tok"),
            Handler::new(),
            Arc::new(StuckConnector),
        );

        let cancel = CancellationToken::new();
        let canceller = {
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            }
        };

        let (res, ()) = within(async { tokio::join!(session.open(&cancel), canceller) }).await;
        assert!(matches!(res, Err(SessionError::OpenCancelled)));
        assert!(session.gateway().await.is_none());
        assert!(!session.is_open().await);
        assert!(session.handler().is_empty());
    }
}
