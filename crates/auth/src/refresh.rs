//! Single-flight token refresh.
//!
//! At most one refresh call runs per store. Callers arriving while a cycle
//! is in flight are queued and all observe the cycle's single outcome. The
//! network call runs on its own task so that a cancelled caller never
//! strands the others, and the in-flight state is released on every exit
//! path, including the task being torn down.

use log::{debug, error, info};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

use crate::api::AuthBackend;
use crate::error::RefreshError;
use crate::session::SessionStore;
use crate::types::{AuthResponse, Session};

/// Default bound on a single refresh call
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);

type RefreshOutcome = Result<Session, RefreshError>;

enum RefreshState {
    Idle,
    InFlight {
        waiters: Vec<oneshot::Sender<RefreshOutcome>>,
    },
}

struct Inner {
    state: Mutex<RefreshState>,
    store: Arc<SessionStore>,
    backend: Arc<dyn AuthBackend>,
    timeout: Duration,
    refresh_calls: AtomicU64,
}

/// リフレッシュコーディネーター
#[derive(Clone)]
pub struct RefreshCoordinator {
    inner: Arc<Inner>,
}

impl RefreshCoordinator {
    pub fn new(store: Arc<SessionStore>, backend: Arc<dyn AuthBackend>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(RefreshState::Idle),
                store,
                backend,
                timeout,
                refresh_calls: AtomicU64::new(0),
            }),
        }
    }

    /// Refresh the session, joining the in-flight cycle if there is one.
    pub async fn refresh(&self) -> Result<Session, RefreshError> {
        self.join(None).await
    }

    /// Like [`refresh`](Self::refresh), but when the store's access token is
    /// no longer `observed` (someone already refreshed) the current session
    /// is returned without a network call.
    pub async fn refresh_if_stale(&self, observed: Option<&str>) -> Result<Session, RefreshError> {
        self.join(Some(observed)).await
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(*self.inner.state.lock(), RefreshState::InFlight { .. })
    }

    /// Number of refresh calls started so far
    pub fn refresh_count(&self) -> u64 {
        self.inner.refresh_calls.load(Ordering::SeqCst)
    }

    async fn join(&self, observed: Option<Option<&str>>) -> RefreshOutcome {
        let receiver = {
            let mut state = self.inner.state.lock();
            match &mut *state {
                RefreshState::InFlight { waiters } => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    debug!("Refresh in flight, queued waiter #{}", waiters.len());
                    rx
                }
                RefreshState::Idle => {
                    if let Some(observed) = observed {
                        let current = self.inner.store.access_token();
                        if current.is_some() && current.as_deref() != observed {
                            debug!("Access token already rotated, skipping refresh");
                            return Ok(self.inner.store.get());
                        }
                    }

                    let (generation, refresh_token) = self.inner.store.refresh_credentials();
                    let refresh_token = refresh_token.ok_or(RefreshError::MissingRefreshToken)?;

                    let (tx, rx) = oneshot::channel();
                    *state = RefreshState::InFlight { waiters: vec![tx] };
                    self.inner.refresh_calls.fetch_add(1, Ordering::SeqCst);

                    let inner = self.inner.clone();
                    tokio::spawn(async move { inner.run_cycle(refresh_token, generation).await });
                    rx
                }
            }
        };

        receiver.await.unwrap_or(Err(RefreshError::Interrupted))
    }
}

impl Inner {
    async fn run_cycle(self: Arc<Self>, refresh_token: String, generation: u64) {
        let mut cycle = Cycle {
            inner: self.clone(),
            generation,
            resolved: false,
        };

        info!("Refreshing access token");
        let outcome =
            match tokio::time::timeout(self.timeout, self.backend.refresh(&refresh_token)).await {
                Ok(Ok(response)) => self.apply(response, refresh_token, generation),
                Ok(Err(e)) => Err(RefreshError::from(e)),
                Err(_) => Err(RefreshError::Timeout),
            };

        let outcome = match outcome {
            Err(RefreshError::Superseded) => self.superseded(),
            Err(e) => {
                error!("Token refresh failed: {}", e);
                if self.store.clear_if(generation) || self.store.generation() == generation {
                    Err(e)
                } else {
                    self.superseded()
                }
            }
            ok => ok,
        };

        cycle.resolve(outcome);
    }

    fn apply(&self, response: AuthResponse, previous_refresh: String, generation: u64) -> RefreshOutcome {
        let user = response
            .user()
            .or_else(|| self.store.user().map(|u| (*u).clone()))
            .ok_or_else(|| RefreshError::Rejected("refresh response carried no user".into()))?;

        // ローテーションしないバックエンドでは既存のリフレッシュトークンを使い続ける
        let refresh_token = response.refresh_token.clone().or(Some(previous_refresh));

        self.store
            .set_session_if(generation, user, response.access_token, refresh_token)
            .map_err(|e| RefreshError::Rejected(e.to_string()))?
            .ok_or(RefreshError::Superseded)
    }

    /// Outcome for a cycle whose session was replaced or cleared while it
    /// ran. Waiters get whatever the store holds now.
    fn superseded(&self) -> RefreshOutcome {
        let current = self.store.get();
        if current.access_token.is_some() {
            info!("Session replaced during refresh, handing out the current one");
            Ok(current)
        } else {
            info!("Session cleared during refresh, discarding the result");
            Err(RefreshError::Superseded)
        }
    }

    fn release(&self, outcome: RefreshOutcome) {
        let previous = std::mem::replace(&mut *self.state.lock(), RefreshState::Idle);
        if let RefreshState::InFlight { waiters } = previous {
            debug!("Resolving {} refresh waiter(s)", waiters.len());
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }
}

/// Owns one in-flight cycle; releases it even if the task is torn down.
struct Cycle {
    inner: Arc<Inner>,
    generation: u64,
    resolved: bool,
}

impl Cycle {
    fn resolve(&mut self, outcome: RefreshOutcome) {
        self.resolved = true;
        self.inner.release(outcome);
    }
}

impl Drop for Cycle {
    fn drop(&mut self) {
        if !self.resolved {
            self.inner.store.clear_if(self.generation);
            self.inner.release(Err(RefreshError::Interrupted));
        }
    }
}
