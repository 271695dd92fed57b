//! Single-shot local HTTP listener acting as the OAuth redirect target.
//!
//! A [`CallbackServer`] is bound once per authorization attempt. The first
//! request on the callback path claims the flow through a compare-and-set on
//! [`FlowState`]; every later request gets a neutral "already handled" page.
//! [`CallbackServer::run`] consumes the server, so the listening socket is
//! closed exactly once on every exit path.

use std::{
    future::Future,
    io::ErrorKind,
    net::{Ipv4Addr, Ipv6Addr},
    sync::{
        Arc,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use {
    axum::{
        Router,
        extract::{Query, State},
        http::{StatusCode, header},
        response::{Html, IntoResponse, Response},
        routing::get,
    },
    serde::Deserialize,
    subtle::ConstantTimeEq,
    tokio::{
        net::TcpListener,
        sync::{Mutex, oneshot},
        task::JoinHandle,
        time::Instant,
    },
    tracing::{debug, info, warn},
};

use crate::error::OAuthError;

/// How long a closing listener may spend finishing its in-flight response.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Lifecycle of one authorization attempt as seen by the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FlowState {
    Listening = 0,
    /// A callback carrying a code was accepted and the exchange is running.
    Exchanging = 1,
    Resolved = 2,
    Rejected = 3,
}

impl FlowState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Listening,
            1 => Self::Exchanging,
            2 => Self::Resolved,
            _ => Self::Rejected,
        }
    }
}

struct FlowCell(AtomicU8);

impl FlowCell {
    fn new() -> Self {
        Self(AtomicU8::new(FlowState::Listening as u8))
    }

    fn get(&self) -> FlowState {
        FlowState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Move `from` → `to`. Returns false if another transition got there first.
    fn transition(&self, from: FlowState, to: FlowState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

/// What the listener accepts and how it answers a successful callback.
#[derive(Debug, Clone)]
pub struct CallbackOptions {
    pub path: String,
    pub expected_state: String,
    /// Redirect target after success; `None` renders the local success page.
    pub success_redirect_url: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

enum CallbackEvent {
    Code {
        code: String,
        reply: oneshot::Sender<Result<(), String>>,
    },
    Failed(OAuthError),
}

struct Shared {
    flow: FlowCell,
    expected_state: String,
    success_redirect_url: Option<String>,
    events: Mutex<Option<oneshot::Sender<CallbackEvent>>>,
}

/// Shutdown signals plus server tasks, one pair per bound socket. Closing is
/// idempotent: both lists are drained on first use, and dropping an unclosed
/// handle aborts the tasks.
#[derive(Default)]
struct ListenerHandle {
    shutdown: Vec<oneshot::Sender<()>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ListenerHandle {
    fn serve(&mut self, listener: TcpListener, app: Router) {
        let addr = listener.local_addr().ok();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                warn!(?addr, error = %e, "OAuth callback server error");
            }
            debug!(?addr, "OAuth callback listener closed");
        });
        self.shutdown.push(shutdown_tx);
        self.tasks.push(task);
    }

    async fn close(mut self) {
        for tx in self.shutdown.drain(..) {
            let _ = tx.send(());
        }
        for mut task in self.tasks.drain(..) {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                warn!("OAuth callback listener did not drain in time, aborting");
                task.abort();
                let _ = task.await;
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        for tx in self.shutdown.drain(..) {
            let _ = tx.send(());
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// A bound, listening OAuth redirect target.
pub struct CallbackServer {
    port: u16,
    shared: Arc<Shared>,
    events: oneshot::Receiver<CallbackEvent>,
    handle: ListenerHandle,
    /// Also answering on `[::1]`, for browsers that resolve `localhost` there.
    ipv6: bool,
}

impl CallbackServer {
    /// Bind the listener on `127.0.0.1`.
    ///
    /// With a preferred port, that port is tried first and an `EADDRINUSE`
    /// falls back to an OS-assigned port. Without one, the port is always
    /// OS-assigned. The same port is then bound on `[::1]` when available,
    /// since redirect URIs name `localhost`.
    pub async fn bind(
        preferred_port: Option<u16>,
        options: CallbackOptions,
    ) -> Result<Self, OAuthError> {
        let listener = bind_listener(preferred_port).await?;
        let port = listener
            .local_addr()
            .map_err(OAuthError::PortBindFailed)?
            .port();

        let (event_tx, event_rx) = oneshot::channel();
        let shared = Arc::new(Shared {
            flow: FlowCell::new(),
            expected_state: options.expected_state,
            success_redirect_url: options.success_redirect_url,
            events: Mutex::new(Some(event_tx)),
        });

        let app = Router::new()
            .route(&options.path, get(handle_callback))
            .fallback(not_found)
            .with_state(Arc::clone(&shared));

        let mut handle = ListenerHandle::default();
        let ipv6 = match TcpListener::bind((Ipv6Addr::LOCALHOST, port)).await {
            Ok(v6) => {
                handle.serve(v6, app.clone());
                true
            },
            Err(e) => {
                debug!(port, error = %e, "OAuth callback not reachable on [::1]");
                false
            },
        };
        handle.serve(listener, app);

        info!(port, ipv6, path = %options.path, "OAuth callback listener started");

        Ok(Self {
            port,
            shared,
            events: event_rx,
            handle,
            ipv6,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> FlowState {
        self.shared.flow.get()
    }

    /// Whether the callback is also reachable on `[::1]`.
    pub fn serves_ipv6(&self) -> bool {
        self.ipv6
    }

    /// Hand the callback's code to `on_code` and close the listener, all
    /// within `timeout`.
    ///
    /// The deadline covers the whole round-trip: waiting for the browser and
    /// the work `on_code` does afterwards. The browser's request stays open
    /// while `on_code` runs; its result decides between the success response
    /// and the error page.
    pub async fn run<T, F, Fut>(self, timeout: Duration, on_code: F) -> Result<T, OAuthError>
    where
        F: FnOnce(String) -> Fut,
        Fut: Future<Output = Result<T, OAuthError>>,
    {
        let Self {
            port,
            shared,
            events,
            handle,
            ..
        } = self;

        let result = receive(port, &shared, events, timeout, on_code).await;
        handle.close().await;
        result
    }
}

async fn bind_listener(preferred_port: Option<u16>) -> Result<TcpListener, OAuthError> {
    if let Some(port) = preferred_port {
        match TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                warn!(port, "preferred OAuth callback port in use, using an ephemeral port");
            },
            Err(e) => return Err(OAuthError::PortBindFailed(e)),
        }
    }
    TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .map_err(OAuthError::PortBindFailed)
}

async fn receive<T, F, Fut>(
    port: u16,
    shared: &Shared,
    events: oneshot::Receiver<CallbackEvent>,
    timeout: Duration,
    on_code: F,
) -> Result<T, OAuthError>
where
    F: FnOnce(String) -> Fut,
    Fut: Future<Output = Result<T, OAuthError>>,
{
    let deadline = Instant::now() + timeout;
    let event = match tokio::time::timeout_at(deadline, events).await {
        Ok(Ok(event)) => event,
        // Handler claimed the flow, then its request was dropped before it
        // reported anything.
        Ok(Err(_)) => {
            warn!(port, "OAuth callback request was abandoned");
            return Err(OAuthError::NoAuthorizationCode);
        },
        Err(_) => {
            shared
                .flow
                .transition(FlowState::Listening, FlowState::Rejected);
            warn!(port, "no OAuth callback received before the timeout");
            return Err(OAuthError::Timeout);
        },
    };

    match event {
        CallbackEvent::Failed(err) => Err(err),
        CallbackEvent::Code { code, reply } => {
            let outcome = match tokio::time::timeout_at(deadline, on_code(code)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    warn!(port, "OAuth token exchange did not finish before the timeout");
                    Err(OAuthError::Timeout)
                },
            };
            let _ = reply.send(outcome.as_ref().map(|_| ()).map_err(ToString::to_string));
            outcome
        },
    }
}

// ── Handlers ────────────────────────────────────────────────────────────────

async fn handle_callback(
    State(shared): State<Arc<Shared>>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if !shared
        .flow
        .transition(FlowState::Listening, FlowState::Exchanging)
    {
        debug!(state = ?shared.flow.get(), "OAuth callback already handled");
        return already_handled();
    }
    let Some(events) = shared.events.lock().await.take() else {
        return already_handled();
    };

    if let Some(error) = params.error {
        warn!(error = %error, "OAuth provider denied authorization");
        return reject(&shared, events, OAuthError::ProviderDeniedAuthorization {
            error,
            description: params.error_description,
        });
    }

    let state_matches = params
        .state
        .as_deref()
        .is_some_and(|s| bool::from(s.as_bytes().ct_eq(shared.expected_state.as_bytes())));
    if !state_matches {
        warn!(
            received = %params.state.as_deref().map(state_prefix).unwrap_or("<none>"),
            "OAuth callback state mismatch"
        );
        return reject(&shared, events, OAuthError::InvalidState);
    }

    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        return reject(&shared, events, OAuthError::NoAuthorizationCode);
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    if events
        .send(CallbackEvent::Code {
            code,
            reply: reply_tx,
        })
        .is_err()
    {
        shared
            .flow
            .transition(FlowState::Exchanging, FlowState::Rejected);
        return error_page("The sign-in attempt is no longer active.");
    }

    match reply_rx.await {
        Ok(Ok(())) => {
            shared
                .flow
                .transition(FlowState::Exchanging, FlowState::Resolved);
            info!("OAuth callback completed");
            success_response(shared.success_redirect_url.as_deref())
        },
        Ok(Err(message)) => {
            shared
                .flow
                .transition(FlowState::Exchanging, FlowState::Rejected);
            error_page(&message)
        },
        Err(_) => {
            shared
                .flow
                .transition(FlowState::Exchanging, FlowState::Rejected);
            error_page("The sign-in attempt was cancelled.")
        },
    }
}

fn reject(
    shared: &Shared,
    events: oneshot::Sender<CallbackEvent>,
    err: OAuthError,
) -> Response {
    shared
        .flow
        .transition(FlowState::Exchanging, FlowState::Rejected);
    let page = error_page(&err.to_string());
    let _ = events.send(CallbackEvent::Failed(err));
    page
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "Not found")
}

fn state_prefix(state: &str) -> &str {
    state.get(..8).unwrap_or(state)
}

// ── Pages ───────────────────────────────────────────────────────────────────

fn success_response(redirect: Option<&str>) -> Response {
    match redirect {
        Some(url) => (StatusCode::FOUND, [(header::LOCATION, url.to_string())]).into_response(),
        None => Html(page(
            "Authorization complete",
            "You can close this window and return to the app.",
        ))
        .into_response(),
    }
}

fn error_page(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Html(page("Authorization failed", message)),
    )
        .into_response()
}

fn already_handled() -> Response {
    Html(page(
        "Already handled",
        "This sign-in request was already processed. You can close this window.",
    ))
    .into_response()
}

fn page(title: &str, message: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>{title}</title></head>
<body style="font-family: system-ui, sans-serif; text-align: center; padding-top: 80px;">
<h2>{title}</h2>
<p>{message}</p>
</body>
</html>"#,
        title = escape_html(title),
        message = escape_html(message),
    )
}

fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}
