//! The session registry: the authoritative map of pairing code → Pair plus
//! the reverse indices needed by the router.
//!
//! All registry state lives behind one mutex. Critical sections touch only
//! the in-memory maps and enqueue at most one already-serialized frame via a
//! non-blocking `try_send`; they never await and never touch a socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, Notify};
use tracing::{debug, info};

use crate::protocol::{BrowserEvent, ErrorCode};
use crate::session::{canonicalize_code, generate_code, generate_session_id};

/// Redraw budget for pairing-code generation before declaring saturation.
const CODE_RETRY_BUDGET: usize = 32;

/// A message queued for a connection's writer task.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Ping,
}

/// Opaque address of a live connection: its writer queue and close signal.
/// Peers are only ever reached through a handle, never through the socket.
#[derive(Clone)]
#[derive(Debug)]
pub struct ConnHandle {
    pub conn_id: String,
    pub tx: mpsc::Sender<Outbound>,
    closing: Arc<AtomicBool>,
    close: Arc<Notify>,
}

impl ConnHandle {
    pub fn new(conn_id: String, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            conn_id,
            tx,
            closing: Arc::new(AtomicBool::new(false)),
            close: Arc::new(Notify::new()),
        }
    }

    /// Ask the connection's tasks to shut the connection down. Idempotent.
    pub fn request_close(&self) {
        self.closing.store(true, Ordering::Release);
        self.close.notify_waiters();
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Resolves once `request_close` has been called. Multiple tasks may
    /// wait on this concurrently; the flag makes the wakeup race-free.
    pub async fn closed(&self) {
        while !self.is_closing() {
            let mut notified = std::pin::pin!(self.close.notified());
            notified.as_mut().enable();
            if self.is_closing() {
                return;
            }
            notified.await;
        }
    }
}

struct Pair {
    code: String,
    session_id: String,
    agent: ConnHandle,
    browser: Option<ConnHandle>,
    created_at: Instant,
    /// `None` while a browser is attached: a joined pair never expires.
    expires_at: Option<Instant>,
}

/// Read-only snapshot of a pair, cloned out of the registry.
#[derive(Clone)]
pub struct PairView {
    pub code: String,
    pub session_id: String,
    pub agent: ConnHandle,
    pub browser: Option<ConnHandle>,
    pub created_at: Instant,
    pub expires_at: Option<Instant>,
}

impl PairView {
    fn of(pair: &Pair) -> Self {
        Self {
            code: pair.code.clone(),
            session_id: pair.session_id.clone(),
            agent: pair.agent.clone(),
            browser: pair.browser.clone(),
            created_at: pair.created_at,
            expires_at: pair.expires_at,
        }
    }
}

/// Result of `create_pair`.
pub struct NewPair {
    pub code: String,
    pub session_id: String,
}

/// Result of a successful `join`/`rejoin`.
#[derive(Debug)]
pub struct JoinedPair {
    pub session_id: String,
    pub agent: ConnHandle,
}

/// A pair torn down because its agent went away (or it expired).
pub struct RemovedPair {
    pub code: String,
    pub session_id: String,
    pub browser: Option<ConnHandle>,
}

/// A pair demoted to awaiting-rejoin because its browser went away.
pub struct BrowserGone {
    pub code: String,
    pub session_id: String,
    pub agent: ConnHandle,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("pairing code space saturated, redraw budget exhausted")]
    CodeSpaceSaturated,
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum JoinError {
    #[error("no session with that code")]
    InvalidCode,
    #[error("that code has expired")]
    ExpiredCode,
    #[error("a browser is already connected to that session")]
    AlreadyJoined,
}

impl JoinError {
    pub fn code(&self) -> ErrorCode {
        match self {
            JoinError::InvalidCode => ErrorCode::InvalidCode,
            JoinError::ExpiredCode => ErrorCode::ExpiredCode,
            JoinError::AlreadyJoined => ErrorCode::AlreadyJoined,
        }
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum RejoinError {
    #[error("no session with that id")]
    NotFound,
    #[error("the agent for that session has disconnected")]
    MacDisconnected,
    #[error("a browser is already connected to that session")]
    AlreadyJoined,
}

impl RejoinError {
    pub fn code(&self) -> ErrorCode {
        match self {
            RejoinError::NotFound => ErrorCode::NotFound,
            RejoinError::MacDisconnected => ErrorCode::MacDisconnected,
            RejoinError::AlreadyJoined => ErrorCode::AlreadyJoined,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    /// code -> Pair
    pairs: HashMap<String, Pair>,
    /// session_id -> code
    by_session: HashMap<String, String>,
    /// agent conn_id -> code
    by_agent: HashMap<String, String>,
    /// browser conn_id -> code
    by_browser: HashMap<String, String>,
    /// session_id -> teardown time, kept one expiry window so a late
    /// `rejoin` can be answered MAC_DISCONNECTED instead of NOT_FOUND
    tombstones: HashMap<String, Instant>,
}

pub struct SessionRegistry {
    inner: Mutex<RegistryInner>,
    expiry: Duration,
}

impl SessionRegistry {
    pub fn new(expiry: Duration) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            expiry,
        }
    }

    /// Register a freshly connected agent: draw a unique code, assign a
    /// session id, insert the pair with an unpaired-expiry deadline.
    pub fn create_pair(&self, agent: ConnHandle) -> Result<NewPair, RegistryError> {
        self.create_pair_at(agent, Instant::now())
    }

    pub(crate) fn create_pair_at(
        &self,
        agent: ConnHandle,
        now: Instant,
    ) -> Result<NewPair, RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let mut code = None;
        for _ in 0..CODE_RETRY_BUDGET {
            let candidate = generate_code();
            if !inner.pairs.contains_key(&candidate) {
                code = Some(candidate);
                break;
            }
            debug!("pairing code collision, redrawing");
        }
        let code = code.ok_or(RegistryError::CodeSpaceSaturated)?;
        let session_id = generate_session_id();

        inner.by_session.insert(session_id.clone(), code.clone());
        inner.by_agent.insert(agent.conn_id.clone(), code.clone());
        inner.pairs.insert(
            code.clone(),
            Pair {
                code: code.clone(),
                session_id: session_id.clone(),
                agent,
                browser: None,
                created_at: now,
                expires_at: Some(now + self.expiry),
            },
        );

        info!(code = %code, session_id = %session_id, "agent registered");
        Ok(NewPair { code, session_id })
    }

    /// Look up a pair by code without touching expiry.
    pub fn get_by_code(&self, code: &str) -> Option<PairView> {
        let inner = self.inner.lock().unwrap();
        inner.pairs.get(code).map(PairView::of)
    }

    pub fn find_by_agent(&self, conn_id: &str) -> Option<PairView> {
        let inner = self.inner.lock().unwrap();
        let code = inner.by_agent.get(conn_id)?;
        inner.pairs.get(code).map(PairView::of)
    }

    pub fn find_by_browser(&self, conn_id: &str) -> Option<PairView> {
        let inner = self.inner.lock().unwrap();
        let code = inner.by_browser.get(conn_id)?;
        inner.pairs.get(code).map(PairView::of)
    }

    pub fn pair_count(&self) -> usize {
        self.inner.lock().unwrap().pairs.len()
    }

    /// Attach a browser to the pair named by `raw_code`.
    ///
    /// On success the `joined` acknowledgement is enqueued on the browser's
    /// own queue inside the critical section, before the handle becomes
    /// visible to the agent's reader, so no forwarded frame can precede it.
    pub fn join(&self, raw_code: &str, browser: ConnHandle) -> Result<JoinedPair, JoinError> {
        self.join_at(raw_code, browser, Instant::now())
    }

    pub(crate) fn join_at(
        &self,
        raw_code: &str,
        browser: ConnHandle,
        now: Instant,
    ) -> Result<JoinedPair, JoinError> {
        let code = canonicalize_code(raw_code).ok_or(JoinError::InvalidCode)?;
        let mut expired_agent: Option<ConnHandle> = None;

        let result = {
            let mut inner = self.inner.lock().unwrap();
            let expired = match inner.pairs.get(&code) {
                None => return Err(JoinError::InvalidCode),
                Some(pair) => matches!(pair.expires_at, Some(at) if now >= at),
            };
            if expired {
                if let Some(pair) = Self::remove_locked(&mut inner, &code, now) {
                    expired_agent = Some(pair.agent);
                }
                Err(JoinError::ExpiredCode)
            } else {
                let pair = inner.pairs.get_mut(&code).expect("pair looked up above");
                if pair.browser.is_some() {
                    Err(JoinError::AlreadyJoined)
                } else {
                    let session_id = pair.session_id.clone();
                    let agent = pair.agent.clone();
                    Self::attach_browser(pair, browser.clone());
                    inner.by_browser.insert(browser.conn_id.clone(), code.clone());
                    Ok(JoinedPair { session_id, agent })
                }
            }
        };

        if let Some(agent) = expired_agent {
            agent.request_close();
        }
        if let Ok(joined) = &result {
            info!(code = %code, session_id = %joined.session_id, "browser joined");
        }
        result
    }

    /// Re-attach a browser to a live pair after a reload.
    pub fn rejoin(&self, session_id: &str, browser: ConnHandle) -> Result<JoinedPair, RejoinError> {
        self.rejoin_at(session_id, browser, Instant::now())
    }

    pub(crate) fn rejoin_at(
        &self,
        session_id: &str,
        browser: ConnHandle,
        now: Instant,
    ) -> Result<JoinedPair, RejoinError> {
        let mut expired_agent: Option<ConnHandle> = None;

        let result = {
            let mut inner = self.inner.lock().unwrap();
            let code = match inner.by_session.get(session_id) {
                Some(code) => code.clone(),
                None => {
                    let recently_dead = matches!(
                        inner.tombstones.get(session_id),
                        Some(&at) if now < at + self.expiry
                    );
                    return Err(if recently_dead {
                        RejoinError::MacDisconnected
                    } else {
                        RejoinError::NotFound
                    });
                }
            };
            let expired = {
                let pair = inner.pairs.get(&code).expect("session index consistent");
                matches!(pair.expires_at, Some(at) if now >= at)
            };
            if expired {
                if let Some(pair) = Self::remove_locked(&mut inner, &code, now) {
                    expired_agent = Some(pair.agent);
                }
                Err(RejoinError::NotFound)
            } else {
                let pair = inner.pairs.get_mut(&code).expect("session index consistent");
                if pair.browser.is_some() {
                    Err(RejoinError::AlreadyJoined)
                } else {
                    let session_id = pair.session_id.clone();
                    let agent = pair.agent.clone();
                    Self::attach_browser(pair, browser.clone());
                    inner.by_browser.insert(browser.conn_id.clone(), code.clone());
                    Ok(JoinedPair { session_id, agent })
                }
            }
        };

        if let Some(agent) = expired_agent {
            agent.request_close();
        }
        if let Ok(joined) = &result {
            info!(session_id = %joined.session_id, "browser rejoined");
        }
        result
    }

    /// Detach a browser: the pair survives awaiting rejoin, with expiry
    /// rearmed to one window from now.
    pub fn disconnect_browser(&self, conn_id: &str) -> Option<BrowserGone> {
        self.disconnect_browser_at(conn_id, Instant::now())
    }

    pub(crate) fn disconnect_browser_at(&self, conn_id: &str, now: Instant) -> Option<BrowserGone> {
        let mut inner = self.inner.lock().unwrap();
        let code = inner.by_browser.remove(conn_id)?;
        let pair = inner.pairs.get_mut(&code)?;
        pair.browser = None;
        pair.expires_at = Some(now + self.expiry);
        info!(code = %code, session_id = %pair.session_id, "browser detached, awaiting rejoin");
        Some(BrowserGone {
            code,
            session_id: pair.session_id.clone(),
            agent: pair.agent.clone(),
        })
    }

    /// Destroy the pair owned by this agent connection. The session id is
    /// tombstoned so a late rejoin learns the agent is gone.
    pub fn remove_pair_by_agent(&self, conn_id: &str) -> Option<RemovedPair> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let code = inner.by_agent.get(conn_id)?.clone();
        let pair = Self::remove_locked(&mut inner, &code, now)?;
        info!(code = %code, session_id = %pair.session_id, "pair removed, agent gone");
        Some(RemovedPair {
            code,
            session_id: pair.session_id,
            browser: pair.browser,
        })
    }

    /// Destroy a pair by code, dropping every reference to it.
    pub fn remove_pair(&self, code: &str) -> Option<RemovedPair> {
        let now = Instant::now();
        let mut inner = self.inner.lock().unwrap();
        let pair = Self::remove_locked(&mut inner, code, now)?;
        Some(RemovedPair {
            code: pair.code,
            session_id: pair.session_id,
            browser: pair.browser,
        })
    }

    /// Remove every browserless pair whose deadline has passed, closing the
    /// parked agent connections, and prune stale tombstones. Returns the
    /// number of pairs removed.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    pub(crate) fn sweep_expired_at(&self, now: Instant) -> usize {
        let mut closed: Vec<ConnHandle> = Vec::new();
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            let dead: Vec<String> = inner
                .pairs
                .values()
                .filter(|p| p.browser.is_none() && matches!(p.expires_at, Some(at) if at < now))
                .map(|p| p.code.clone())
                .collect();
            for code in &dead {
                if let Some(pair) = Self::remove_locked(&mut inner, code, now) {
                    debug!(code = %code, session_id = %pair.session_id, "expired pair swept");
                    closed.push(pair.agent);
                }
            }
            let expiry = self.expiry;
            inner.tombstones.retain(|_, &mut at| now < at + expiry);
            dead.len()
        };
        for agent in closed {
            agent.request_close();
        }
        removed
    }

    /// Ask every live connection to close. Used on process shutdown.
    pub fn close_all(&self) -> usize {
        let handles: Vec<ConnHandle> = {
            let inner = self.inner.lock().unwrap();
            inner
                .pairs
                .values()
                .flat_map(|p| std::iter::once(p.agent.clone()).chain(p.browser.clone()))
                .collect()
        };
        let count = handles.len();
        for handle in handles {
            handle.request_close();
        }
        count
    }

    fn attach_browser(pair: &mut Pair, browser: ConnHandle) {
        let joined = BrowserEvent::Joined {
            session_id: pair.session_id.clone(),
        };
        if let Ok(json) = serde_json::to_string(&joined) {
            let _ = browser.tx.try_send(Outbound::Text(json));
        }
        pair.browser = Some(browser);
        pair.expires_at = None;
    }

    fn remove_locked(inner: &mut RegistryInner, code: &str, now: Instant) -> Option<Pair> {
        let pair = inner.pairs.remove(code)?;
        inner.by_session.remove(&pair.session_id);
        inner.by_agent.remove(&pair.agent.conn_id);
        if let Some(browser) = &pair.browser {
            inner.by_browser.remove(&browser.conn_id);
        }
        inner.tombstones.insert(pair.session_id.clone(), now);
        Some(pair)
    }
}

/// Periodic sweeper task, spawned once per relay.
pub async fn run_sweeper(registry: Arc<SessionRegistry>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let removed = registry.sweep_expired();
        if removed > 0 {
            info!(removed, "swept expired unpaired sessions");
        }
    }
}
