//! The single owned session container.
//!
//! Every consumer receives the store by reference (`Arc<SessionStore>`);
//! there is no ambient global. Transitions are synchronous: once a mutating
//! call returns, every later reader observes the new state.

use log::{debug, info, warn};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::DecodeError;
use crate::storage::{PersistPolicy, PersistedSnapshot, SessionPersistence};
use crate::token::TokenCodec;
use crate::types::{Session, TokenPair, User, UserPatch};

/// Source of the current time in epoch seconds
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

/// Wall clock
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Manually driven clock for tests and simulations
#[derive(Debug, Default)]
pub struct FixedClock(AtomicI64);

impl FixedClock {
    pub fn new(now: i64) -> Self {
        Self(AtomicI64::new(now))
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Three-valued login status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Persisted state has not been hydrated yet
    Unknown,
    LoggedIn,
    LoggedOut,
}

/// Published after every committed transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Hydrated(Session),
    Updated(Session),
    Cleared,
}

struct StoreState {
    session: Session,
    hydrated: bool,
    /// Bumped by every credential change
    generation: u64,
    /// Store-clock second the current access token was committed at
    committed_at: Option<i64>,
}

/// セッションストア
pub struct SessionStore {
    state: RwLock<StoreState>,
    events: broadcast::Sender<SessionEvent>,
    persistence: Arc<dyn SessionPersistence>,
    policy: PersistPolicy,
    clock: Arc<dyn Clock>,
}

impl SessionStore {
    pub fn new(persistence: Arc<dyn SessionPersistence>, policy: PersistPolicy) -> Self {
        Self::with_clock(persistence, policy, Arc::new(SystemClock))
    }

    pub fn with_clock(
        persistence: Arc<dyn SessionPersistence>,
        policy: PersistPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: RwLock::new(StoreState {
                session: Session::default(),
                hydrated: false,
                generation: 0,
                committed_at: None,
            }),
            events,
            persistence,
            policy,
            clock,
        }
    }

    /// Receive every transition published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn now(&self) -> i64 {
        self.clock.now()
    }

    pub fn get(&self) -> Session {
        self.state.read().session.clone()
    }

    pub fn access_token(&self) -> Option<String> {
        self.state.read().session.access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.state.read().session.refresh_token.clone()
    }

    pub fn user(&self) -> Option<Arc<User>> {
        self.state.read().session.user.clone()
    }

    /// Changes whenever the credentials are replaced or cleared.
    pub fn generation(&self) -> u64 {
        self.state.read().generation
    }

    /// Generation and refresh token, read together.
    pub(crate) fn refresh_credentials(&self) -> (u64, Option<String>) {
        let state = self.state.read();
        (state.generation, state.session.refresh_token.clone())
    }

    /// Access token and the store-clock second it was committed at, when
    /// it was set through this store (restored tokens carry no age).
    pub(crate) fn access_token_committed(&self) -> Option<(String, Option<i64>)> {
        let state = self.state.read();
        state
            .session
            .access_token
            .clone()
            .map(|token| (token, state.committed_at))
    }

    pub fn is_hydrated(&self) -> bool {
        self.state.read().hydrated
    }

    /// Access token present, well formed and not expired.
    pub fn is_logged_in(&self) -> bool {
        let token = match self.access_token() {
            Some(token) => token,
            None => return false,
        };
        match TokenCodec::decode(&token) {
            Ok(claims) => !TokenCodec::is_expired(&claims, self.clock.now()),
            Err(_) => false,
        }
    }

    pub fn status(&self) -> SessionStatus {
        if !self.is_hydrated() {
            SessionStatus::Unknown
        } else if self.is_logged_in() {
            SessionStatus::LoggedIn
        } else {
            SessionStatus::LoggedOut
        }
    }

    /// Replace the whole session. A malformed access token is rejected and
    /// the store is left unchanged.
    pub fn set_session(
        &self,
        user: User,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Result<Session, DecodeError> {
        TokenCodec::decode(&access_token)?;
        let mut state = self.state.write();
        Ok(self.commit(&mut state, user, access_token, refresh_token))
    }

    /// [`set_session`](Self::set_session), but only while the store is
    /// still at `generation`. Returns `Ok(None)` without writing when the
    /// credentials changed in the meantime.
    pub fn set_session_if(
        &self,
        generation: u64,
        user: User,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Result<Option<Session>, DecodeError> {
        TokenCodec::decode(&access_token)?;
        let mut state = self.state.write();
        if state.generation != generation {
            debug!(
                "Session moved from generation {} to {}, not committing",
                generation, state.generation
            );
            return Ok(None);
        }
        Ok(Some(self.commit(&mut state, user, access_token, refresh_token)))
    }

    /// Drop every credential. Returns `false` when there was nothing to
    /// clear, in which case nothing is published.
    pub fn clear(&self) -> bool {
        let mut state = self.state.write();
        self.clear_locked(&mut state)
    }

    /// [`clear`](Self::clear), but only while the store is still at
    /// `generation`.
    pub fn clear_if(&self, generation: u64) -> bool {
        let mut state = self.state.write();
        if state.generation != generation {
            debug!("Session replaced since generation {}, not clearing", generation);
            return false;
        }
        self.clear_locked(&mut state)
    }

    fn commit(
        &self,
        state: &mut StoreState,
        user: User,
        access_token: String,
        refresh_token: Option<String>,
    ) -> Session {
        state.session = Session {
            access_token: Some(access_token),
            refresh_token,
            user: Some(Arc::new(user)),
        };
        state.hydrated = true;
        state.generation += 1;
        state.committed_at = Some(self.clock.now());
        let session = state.session.clone();
        self.persist(&session);
        let _ = self.events.send(SessionEvent::Updated(session.clone()));
        info!(
            "Session set for user {}",
            session.user.as_ref().map(|u| u.username.as_str()).unwrap_or("?")
        );
        session
    }

    fn clear_locked(&self, state: &mut StoreState) -> bool {
        if state.hydrated && state.session.is_empty() {
            debug!("clear() on an empty session, ignoring");
            return false;
        }
        state.session = Session::default();
        state.hydrated = true;
        state.generation += 1;
        state.committed_at = None;
        if let Err(e) = self.persistence.remove() {
            warn!("Failed to remove persisted session: {}", e);
        }
        let _ = self.events.send(SessionEvent::Cleared);
        info!("Session cleared");
        true
    }

    /// Replace the user with a patched copy. Returns the new user, or `None`
    /// when nobody is logged in.
    pub fn update_user(&self, patch: &UserPatch) -> Option<Arc<User>> {
        let mut state = self.state.write();
        let current = state.session.user.clone()?;
        let next = Arc::new(current.patched(patch));
        state.session.user = Some(next.clone());
        let session = state.session.clone();
        self.persist(&session);
        let _ = self.events.send(SessionEvent::Updated(session));
        Some(next)
    }

    /// Load the persisted snapshot without publishing and without marking
    /// the store hydrated. `carried` are tokens the host obtained elsewhere
    /// (e.g. the credential cookie); they win over persisted ones.
    pub fn restore(&self, carried: Option<TokenPair>) -> Session {
        let snapshot = match self.persistence.load() {
            Ok(snapshot) => snapshot.unwrap_or_default(),
            Err(e) => {
                warn!("Ignoring unreadable persisted session: {}", e);
                PersistedSnapshot::default()
            }
        };

        let tokens = carried.or_else(|| match self.policy {
            PersistPolicy::Full => snapshot.tokens.clone(),
            PersistPolicy::UserOnly => None,
        });

        let session = match tokens {
            Some(pair) => match TokenCodec::decode(&pair.access_token) {
                Ok(claims) => {
                    let user = snapshot.user.clone().or_else(|| {
                        claims
                            .subject
                            .as_deref()
                            .map(|sub| User::new(sub, sub).with_roles(claims.roles.clone()))
                    });
                    match user {
                        Some(user) => Session {
                            access_token: Some(pair.access_token),
                            refresh_token: pair.refresh_token,
                            user: Some(Arc::new(user)),
                        },
                        None => Session {
                            refresh_token: pair.refresh_token,
                            ..Default::default()
                        },
                    }
                }
                Err(e) => {
                    debug!("Discarding undecodable access token on restore: {}", e);
                    Session {
                        refresh_token: pair.refresh_token,
                        ..Default::default()
                    }
                }
            },
            None => Session::default(),
        };

        if session.user.is_none() && snapshot.user.is_some() {
            debug!("Persisted user has no usable credentials, discarding snapshot");
            if let Err(e) = self.persistence.remove() {
                warn!("Failed to remove stale persisted session: {}", e);
            }
        }

        let mut state = self.state.write();
        state.session = session.clone();
        state.generation += 1;
        state.committed_at = None;
        session
    }

    /// Mark hydration complete and publish the restored session.
    pub fn mark_hydrated(&self) {
        let mut state = self.state.write();
        if state.hydrated {
            return;
        }
        state.hydrated = true;
        let _ = self
            .events
            .send(SessionEvent::Hydrated(state.session.clone()));
        debug!("Session store hydrated");
    }

    /// `restore` followed by `mark_hydrated`.
    pub fn hydrate(&self, carried: Option<TokenPair>) -> Session {
        self.restore(carried);
        self.mark_hydrated();
        self.get()
    }

    fn persist(&self, session: &Session) {
        let snapshot = PersistedSnapshot::from_session(session, self.policy);
        if let Err(e) = self.persistence.save(&snapshot) {
            warn!("Failed to persist session: {}", e);
        }
    }
}
