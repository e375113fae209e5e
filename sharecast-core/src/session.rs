//! Session lifecycle and admission control.
//!
//! A [`SessionManager`] owns every session of the host process. Each
//! session holds its invitation codes and its [`BroadcastTransport`]
//! behind a per-session lock; the join path (check code, take one use,
//! persist, register the viewer) runs entirely inside that lock, so two
//! joiners racing for the last use cannot both get in. There is no
//! lock shared across sessions on the join path; the code index only
//! maps a code to its session.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tokio::sync::{Mutex, RwLock, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcast::{BroadcastConfig, BroadcastTransport, FrameSink};
use crate::error::ShareError;
use crate::invite::{CodePolicy, InvitationCode, InviteCode};
use crate::store::{CodeStore, MemoryCodeStore};
use crate::viewer::{DisconnectReason, PhaseTracker, ViewerConnection, ViewerId, ViewerPhase};

// ── SessionId ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── HostRef ──────────────────────────────────────────────────────

/// Identifies the host that owns a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostRef(String);

impl HostRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HostRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── SessionState ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Active,
    Closed,
}

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Concurrent non-closed sessions allowed per host.
    pub max_sessions_per_host: usize,
    /// Streaming viewers allowed per session.
    pub max_viewers: usize,
    /// Policy for codes minted without an explicit one.
    pub code_policy: CodePolicy,
    pub broadcast: BroadcastConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_host: 1,
            max_viewers: 32,
            code_policy: CodePolicy::default(),
            broadcast: BroadcastConfig::default(),
        }
    }
}

/// Per-session overrides for [`SessionManager::create_session_with`].
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Use this code instead of generating one.
    pub code: Option<InviteCode>,
    pub policy: Option<CodePolicy>,
}

// ── ViewerRef / Admission ────────────────────────────────────────

/// A viewer asking to join.
pub struct ViewerRef {
    pub identity: String,
    pub sink: Box<dyn FrameSink>,
    pub phase: PhaseTracker,
}

impl ViewerRef {
    pub fn new(identity: impl Into<String>, sink: impl FrameSink + 'static) -> Self {
        Self {
            identity: identity.into(),
            sink: Box::new(sink),
            phase: PhaseTracker::new(),
        }
    }

    /// Drive an existing tracker instead of a fresh one.
    pub fn with_phase(mut self, phase: PhaseTracker) -> Self {
        self.phase = phase;
        self
    }
}

/// A successful join.
#[derive(Debug, Clone)]
pub struct Admission {
    pub session_id: SessionId,
    pub viewer_id: ViewerId,
    pub phase: watch::Receiver<ViewerPhase>,
}

// ── SessionSummary ───────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub id: SessionId,
    pub host: HostRef,
    pub state: SessionState,
    pub created_at: SystemTime,
    pub viewers: usize,
    pub stalled_viewers: usize,
    pub last_sequence: Option<u64>,
    pub last_keyframe: Option<u64>,
}

// ── Session ──────────────────────────────────────────────────────

struct SessionInner {
    state: SessionState,
    codes: HashMap<InviteCode, InvitationCode>,
}

/// One host's broadcast context.
pub struct Session {
    id: SessionId,
    host: HostRef,
    created_at: SystemTime,
    transport: Arc<BroadcastTransport>,
    cancel: CancellationToken,
    inner: Mutex<SessionInner>,
}

impl Session {
    fn new(id: SessionId, host: HostRef, broadcast: BroadcastConfig) -> Self {
        Self {
            id,
            host,
            created_at: SystemTime::now(),
            transport: Arc::new(BroadcastTransport::new(id, broadcast)),
            cancel: CancellationToken::new(),
            inner: Mutex::new(SessionInner {
                state: SessionState::Created,
                codes: HashMap::new(),
            }),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn host(&self) -> &HostRef {
        &self.host
    }

    pub fn transport(&self) -> Arc<BroadcastTransport> {
        Arc::clone(&self.transport)
    }

    /// Cancelled when the session closes; capture and encode tasks
    /// run under it.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    async fn summary(&self) -> SessionSummary {
        let state = self.state().await;
        let cursor = self.transport.cursor().await;
        SessionSummary {
            id: self.id,
            host: self.host.clone(),
            state,
            created_at: self.created_at,
            viewers: self.transport.viewer_count().await,
            stalled_viewers: self.transport.stalled_count().await,
            last_sequence: cursor.last_sequence,
            last_keyframe: cursor.last_keyframe,
        }
    }
}

// ── SessionManager ───────────────────────────────────────────────

pub struct SessionManager {
    config: SessionConfig,
    store: Arc<dyn CodeStore>,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    /// Code → owning session. Lookup only; code state lives in the session.
    codes: RwLock<HashMap<InviteCode, SessionId>>,
    /// Serialises session creation so the per-host limit holds.
    create_lock: Mutex<()>,
    next_id: AtomicU64,
}

impl SessionManager {
    pub fn new(config: SessionConfig, store: Arc<dyn CodeStore>) -> Self {
        Self {
            config,
            store,
            sessions: RwLock::new(HashMap::new()),
            codes: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Manager backed by a [`MemoryCodeStore`].
    pub fn in_memory(config: SessionConfig) -> Self {
        Self::new(config, Arc::new(MemoryCodeStore::new()))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    pub async fn transport(&self, id: SessionId) -> Option<Arc<BroadcastTransport>> {
        Some(self.session(id).await?.transport())
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Start a session with a generated code under the default policy.
    pub async fn create_session(&self, host: HostRef) -> Result<SessionId, ShareError> {
        self.create_session_with(host, SessionOptions::default()).await
    }

    pub async fn create_session_with(
        &self,
        host: HostRef,
        options: SessionOptions,
    ) -> Result<SessionId, ShareError> {
        let _creating = self.create_lock.lock().await;

        let open = self.open_sessions_for(&host).await;
        if open >= self.config.max_sessions_per_host {
            warn!(%host, open, "session limit reached");
            return Err(ShareError::ResourceExhausted("per-host session limit reached"));
        }

        let id = SessionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let session = Arc::new(Session::new(id, host, self.config.broadcast.clone()));
        let policy = options.policy.unwrap_or(self.config.code_policy);

        let mut inner = session.inner.lock().await;
        let invitation = self.mint_code(id, options.code, &policy).await?;
        let code = invitation.code.clone();
        inner.codes.insert(code.clone(), invitation);
        inner.state = SessionState::Active;
        drop(inner);

        self.sessions.write().await.insert(id, Arc::clone(&session));
        info!(session = %id, host = %session.host, %code, "session active");
        Ok(id)
    }

    /// Close a session: revoke its codes, stop its pipeline and
    /// disconnect every viewer with `SessionClosed`.
    ///
    /// Returns `false` when the session was unknown or already closed.
    pub async fn close_session(&self, id: SessionId) -> bool {
        let Some(session) = self.session(id).await else {
            return false;
        };

        let records = {
            let mut inner = session.inner.lock().await;
            if inner.state == SessionState::Closed {
                return false;
            }
            inner.state = SessionState::Closed;
            inner
                .codes
                .values_mut()
                .map(|c| {
                    c.revoke();
                    c.to_record()
                })
                .collect::<Vec<_>>()
        };
        for record in records {
            if let Err(e) = self.store.update(record).await {
                warn!(session = %id, "revoking code in store failed: {e}");
            }
        }

        session.cancel.cancel();
        let viewers = session.transport.close_all(DisconnectReason::SessionClosed).await;
        info!(session = %id, viewers, "session closed");
        true
    }

    /// Forget closed sessions and delete their codes. Their codes then
    /// report `InvalidCode`.
    pub async fn reap_closed(&self) -> usize {
        let mut closed = Vec::new();
        for session in self.sessions.read().await.values() {
            if session.state().await == SessionState::Closed {
                closed.push(Arc::clone(session));
            }
        }

        for session in &closed {
            self.sessions.write().await.remove(&session.id);
            let codes: Vec<InviteCode> = session.inner.lock().await.codes.keys().cloned().collect();
            let mut index = self.codes.write().await;
            for code in &codes {
                index.remove(code);
            }
            drop(index);
            for code in &codes {
                if let Err(e) = self.store.remove(code).await {
                    warn!(session = %session.id, %code, "removing code from store failed: {e}");
                }
            }
        }
        closed.len()
    }

    // ── Admission ────────────────────────────────────────────────

    /// Validate `code` and admit the viewer.
    ///
    /// The viewer's phase moves to `Authenticating`, then to `Streaming`
    /// on success or to `Disconnected(Rejected(..))` on failure.
    pub async fn validate_and_join(
        &self,
        code: &str,
        viewer: ViewerRef,
    ) -> Result<Admission, ShareError> {
        let ViewerRef {
            identity,
            sink,
            phase,
        } = viewer;
        if phase.current() == ViewerPhase::Connecting {
            phase.apply(ViewerPhase::submit_code)?;
        }

        match self.admit(code, identity, sink, phase.clone()).await {
            Ok((session_id, viewer_id)) => Ok(Admission {
                session_id,
                viewer_id,
                phase: phase.subscribe(),
            }),
            Err(e) => {
                info!(code, "join rejected: {e}");
                let _ = phase.apply(|p| p.reject(e.join_status()));
                Err(e)
            }
        }
    }

    async fn admit(
        &self,
        code: &str,
        identity: String,
        sink: Box<dyn FrameSink>,
        phase: PhaseTracker,
    ) -> Result<(SessionId, ViewerId), ShareError> {
        let code = InviteCode::parse(code)?;
        let session_id = self
            .codes
            .read()
            .await
            .get(&code)
            .copied()
            .ok_or(ShareError::InvalidCode)?;
        let session = self.session(session_id).await.ok_or(ShareError::InvalidCode)?;

        // Critical section: check, take a use, persist, register.
        let mut inner = session.inner.lock().await;
        if inner.state != SessionState::Active {
            return Err(ShareError::SessionClosed);
        }
        let now = SystemTime::now();
        let entry = inner.codes.get_mut(&code).ok_or(ShareError::InvalidCode)?;
        entry.check_at(now)?;
        if session.transport.viewer_count().await >= self.config.max_viewers {
            return Err(ShareError::ResourceExhausted("session viewer limit reached"));
        }

        let uses = entry.consume_at(now)?;
        if let Err(e) = self.store.update(entry.to_record()).await {
            entry.release();
            warn!(session = %session_id, %code, "persisting use count failed: {e}");
            return Err(into_store_error(e));
        }

        match session.transport.register(identity, sink, phase).await {
            Ok(viewer_id) => {
                info!(session = %session_id, viewer = %viewer_id, %code, uses, "viewer admitted");
                Ok((session_id, viewer_id))
            }
            Err(e) => {
                entry.release();
                if let Err(store_err) = self.store.update(entry.to_record()).await {
                    warn!(session = %session_id, %code, "restoring use count failed: {store_err}");
                }
                Err(e)
            }
        }
    }

    /// Disconnect one viewer on its own request.
    pub async fn leave(&self, id: SessionId, viewer: ViewerId) -> bool {
        self.disconnect_viewer(id, viewer, DisconnectReason::ViewerLeft)
            .await
    }

    pub async fn disconnect_viewer(
        &self,
        id: SessionId,
        viewer: ViewerId,
        reason: DisconnectReason,
    ) -> bool {
        match self.session(id).await {
            Some(session) => session.transport.disconnect(viewer, reason).await,
            None => false,
        }
    }

    pub async fn acknowledge(
        &self,
        id: SessionId,
        viewer: ViewerId,
        sequence: u64,
    ) -> Result<(), ShareError> {
        let session = self.session(id).await.ok_or(ShareError::SessionClosed)?;
        session.transport.acknowledge(viewer, sequence).await
    }

    // ── Code management ──────────────────────────────────────────

    /// Make `code` permanently unusable. Revoking twice is a no-op.
    pub async fn revoke_code(&self, code: &InviteCode) -> Result<(), ShareError> {
        let (session, _) = self.owner_of(code).await?;
        let mut inner = session.inner.lock().await;
        let entry = inner.codes.get_mut(code).ok_or(ShareError::InvalidCode)?;
        if entry.revoked {
            return Ok(());
        }
        entry.revoke();
        if let Err(e) = self.store.update(entry.to_record()).await {
            entry.revoked = false;
            return Err(into_store_error(e));
        }
        info!(session = %session.id, %code, "code revoked");
        Ok(())
    }

    /// Mint an additional code for an active session.
    pub async fn issue_code(
        &self,
        id: SessionId,
        policy: Option<CodePolicy>,
    ) -> Result<InviteCode, ShareError> {
        let session = self.session(id).await.ok_or(ShareError::SessionClosed)?;
        let mut inner = session.inner.lock().await;
        if inner.state != SessionState::Active {
            return Err(ShareError::SessionClosed);
        }
        let policy = policy.unwrap_or(self.config.code_policy);
        let invitation = self.mint_code(id, None, &policy).await?;
        let code = invitation.code.clone();
        inner.codes.insert(code.clone(), invitation);
        info!(session = %id, %code, "code issued");
        Ok(code)
    }

    /// Set or clear a code's use limit. A limit below the current use
    /// count fails with `CodeExhausted`.
    pub async fn set_max_uses(
        &self,
        code: &InviteCode,
        max_uses: Option<u32>,
    ) -> Result<(), ShareError> {
        let (session, _) = self.owner_of(code).await?;
        let mut inner = session.inner.lock().await;
        let entry = inner.codes.get_mut(code).ok_or(ShareError::InvalidCode)?;
        let previous = entry.max_uses;
        entry.set_max_uses(max_uses)?;
        if let Err(e) = self.store.update(entry.to_record()).await {
            entry.max_uses = previous;
            return Err(into_store_error(e));
        }
        Ok(())
    }

    pub async fn session_codes(&self, id: SessionId) -> Vec<InvitationCode> {
        let Some(session) = self.session(id).await else {
            return Vec::new();
        };
        let inner = session.inner.lock().await;
        let mut codes: Vec<_> = inner.codes.values().cloned().collect();
        codes.sort_by_key(|c| c.created_at);
        codes
    }

    // ── Introspection ────────────────────────────────────────────

    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions {
            out.push(session.summary().await);
        }
        out.sort_by_key(|s| s.id);
        out
    }

    pub async fn viewers(&self, id: SessionId) -> Vec<ViewerConnection> {
        match self.session(id).await {
            Some(session) => session.transport.viewers().await,
            None => Vec::new(),
        }
    }

    // ── Internal ─────────────────────────────────────────────────

    async fn open_sessions_for(&self, host: &HostRef) -> usize {
        let sessions: Vec<Arc<Session>> = self.sessions.read().await.values().cloned().collect();
        let mut open = 0;
        for session in sessions {
            if &session.host == host && session.state().await != SessionState::Closed {
                open += 1;
            }
        }
        open
    }

    async fn owner_of(&self, code: &InviteCode) -> Result<(Arc<Session>, SessionId), ShareError> {
        let id = self
            .codes
            .read()
            .await
            .get(code)
            .copied()
            .ok_or(ShareError::InvalidCode)?;
        let session = self.session(id).await.ok_or(ShareError::InvalidCode)?;
        Ok((session, id))
    }

    /// Reserve a unique code in the index and persist its record.
    async fn mint_code(
        &self,
        id: SessionId,
        requested: Option<InviteCode>,
        policy: &CodePolicy,
    ) -> Result<InvitationCode, ShareError> {
        let code = {
            let mut index = self.codes.write().await;
            let code = match requested {
                Some(code) if index.contains_key(&code) => {
                    return Err(ShareError::ResourceExhausted("invitation code already in use"));
                }
                Some(code) => code,
                None => loop {
                    let candidate = InviteCode::generate(policy.length);
                    if !index.contains_key(&candidate) {
                        break candidate;
                    }
                },
            };
            index.insert(code.clone(), id);
            code
        };

        let invitation = InvitationCode::new(code, id, policy, SystemTime::now());
        if let Err(e) = self.store.insert(invitation.to_record()).await {
            self.codes.write().await.remove(&invitation.code);
            return Err(into_store_error(e));
        }
        Ok(invitation)
    }
}

fn into_store_error(e: ShareError) -> ShareError {
    match e {
        ShareError::Store(_) => e,
        other => ShareError::Store(other.to_string()),
    }
}

// ── Tests ────────────────────────────────────────────────────────
