//! Deferred profile creation.
//!
//! A new account has no session until its email is confirmed, so the chosen
//! username is parked in the key-value store at sign-up. The first session
//! seen for that email writes the profile row and removes the parked entry,
//! which makes the upsert happen at most once per sign-up.

use anyhow::Result;
use shared::{require_password, require_username};
use tokio::task::JoinHandle;

use crate::auth::{AuthError, AuthService, AuthSession, ProfileService, SessionEvents, SignUp};
use crate::store::KeyValueStore;

const PENDING_USERNAME_PREFIX: &str = "pending_username_";

fn pending_key(email: &str) -> String {
    format!("{}{}", PENDING_USERNAME_PREFIX, email.trim().to_lowercase())
}

/// Usernames waiting for their account's first session, keyed by email.
pub struct PendingProfiles<K> {
    store: K,
}

impl<K: KeyValueStore> PendingProfiles<K> {
    pub fn new(store: K) -> Self {
        Self { store }
    }

    pub fn stash(&self, email: &str, username: &str) -> Result<()> {
        self.store.set(&pending_key(email), username)
    }

    pub fn get(&self, email: &str) -> Result<Option<String>> {
        self.store.get(&pending_key(email))
    }

    pub fn discard(&self, email: &str) -> Result<()> {
        self.store.remove(&pending_key(email))
    }
}

/// Sign-up form input
#[derive(Debug, Clone, Default)]
pub struct SignUpForm {
    pub email: String,
    pub username: String,
    pub password: String,
    pub confirm: String,
}

/// Validate the form, park the username, then register the account.
///
/// The username is parked before the request goes out so a service that
/// signs the user in immediately already finds it. A failed sign-up takes
/// the entry back out.
pub async fn sign_up<A, K>(auth: &A, pending: &PendingProfiles<K>, form: &SignUpForm) -> Result<SignUp, AuthError>
where
    A: AuthService + ?Sized,
    K: KeyValueStore,
{
    require_username(&form.username)?;
    require_password(&form.password, &form.confirm)?;
    let email = form.email.trim();
    let username = form.username.trim();

    pending.stash(email, username)?;
    match auth.sign_up(email, &form.password, username).await {
        Ok(res) => Ok(res),
        Err(err) => {
            if let Err(e) = pending.discard(email) {
                tracing::warn!("Failed to clear pending username for {}: {}", email, e);
            }
            Err(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileOutcome {
    NoSession,
    NoPendingUpdate,
    PendingApplied { username: String, upserted: bool },
}

pub struct SessionReconciler<P, K> {
    profiles: P,
    pending: PendingProfiles<K>,
}

impl<P: ProfileService, K: KeyValueStore> SessionReconciler<P, K> {
    pub fn new(profiles: P, pending: PendingProfiles<K>) -> Self {
        Self { profiles, pending }
    }

    /// Apply a parked username for this session's email, if one exists.
    /// The entry is removed whether or not the upsert succeeds.
    pub async fn reconcile(&self, session: Option<&AuthSession>) -> ReconcileOutcome {
        let Some(session) = session else {
            return ReconcileOutcome::NoSession;
        };
        let Some(email) = session.email.as_deref().filter(|e| !e.is_empty()) else {
            return ReconcileOutcome::NoPendingUpdate;
        };

        let username = match self.pending.get(email) {
            Ok(Some(username)) => username,
            Ok(None) => return ReconcileOutcome::NoPendingUpdate,
            Err(e) => {
                tracing::warn!("Failed to read pending username: {}", e);
                return ReconcileOutcome::NoPendingUpdate;
            }
        };

        let upserted = match self.profiles.upsert_profile(session, &username).await {
            Ok(()) => {
                tracing::info!("Created profile {} for {}", username, session.user_id);
                true
            }
            Err(e) => {
                tracing::warn!("Profile upsert for {} failed: {}", session.user_id, e);
                false
            }
        };

        if let Err(e) = self.pending.discard(email) {
            tracing::warn!("Failed to clear pending username: {}", e);
        }

        ReconcileOutcome::PendingApplied { username, upserted }
    }

    /// Reconcile the initial session, then every queued change, until the
    /// publisher goes away.
    pub async fn run(self, mut events: SessionEvents) {
        let outcome = self.reconcile(events.initial.as_ref()).await;
        tracing::debug!("Initial session reconciled: {:?}", outcome);

        while let Some(session) = events.changes.recv().await {
            let outcome = self.reconcile(session.as_ref()).await;
            tracing::debug!("Session change reconciled: {:?}", outcome);
        }
    }
}

/// Bring the stored session up to date, then reconcile it and every later
/// change on a background task.
///
/// The task ends once `auth` is dropped; await the handle before exiting.
pub async fn spawn_reconciler<A, P, K>(auth: &A, profiles: P, pending: PendingProfiles<K>) -> JoinHandle<()>
where
    A: AuthService + ?Sized,
    P: ProfileService + 'static,
    K: KeyValueStore + 'static,
{
    // An expired token would make the profile write fail and lose the parked username
    if let Err(e) = auth.get_session().await {
        tracing::warn!("Could not refresh stored session: {}", e);
    }
    let events = auth.subscribe();
    tokio::spawn(SessionReconciler::new(profiles, pending).run(events))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LinkSession;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc;

    #[derive(Clone, Default)]
    struct FakeProfiles {
        calls: Arc<AtomicUsize>,
        usernames: Arc<Mutex<Vec<String>>>,
        tokens: Arc<Mutex<Vec<String>>>,
        fail: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ProfileService for FakeProfiles {
        async fn upsert_profile(&self, session: &AuthSession, username: &str) -> Result<(), AuthError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tokens.lock().unwrap().push(session.access_token.clone());
            if self.fail.load(Ordering::SeqCst) {
                return Err(AuthError::Api("permission denied".to_string()));
            }
            self.usernames.lock().unwrap().push(username.to_string());
            Ok(())
        }
    }

    /// Holds a session in memory; `get_session` swaps in `refreshed` when set
    #[derive(Default)]
    struct FakeAuth {
        reject: bool,
        signups: AtomicUsize,
        current: Mutex<Option<AuthSession>>,
        refreshed: Option<AuthSession>,
        subscribers: Mutex<Vec<mpsc::UnboundedSender<Option<AuthSession>>>>,
    }

    #[async_trait]
    impl AuthService for FakeAuth {
        fn current_session(&self) -> Option<AuthSession> {
            self.current.lock().unwrap().clone()
        }

        fn subscribe(&self) -> SessionEvents {
            let (tx, changes) = mpsc::unbounded_channel();
            self.subscribers.lock().unwrap().push(tx);
            SessionEvents {
                initial: self.current_session(),
                changes,
            }
        }

        async fn get_session(&self) -> Result<Option<AuthSession>, AuthError> {
            if let Some(fresh) = &self.refreshed {
                *self.current.lock().unwrap() = Some(fresh.clone());
            }
            Ok(self.current_session())
        }

        async fn sign_in(&self, _email: &str, _password: &str) -> Result<AuthSession, AuthError> {
            Err(AuthError::NotSignedIn)
        }

        async fn sign_up(&self, email: &str, _password: &str, _username: &str) -> Result<SignUp, AuthError> {
            self.signups.fetch_add(1, Ordering::SeqCst);
            if self.reject {
                return Err(AuthError::Api("User already registered".to_string()));
            }
            Ok(SignUp {
                email: Some(email.to_string()),
                session: None,
            })
        }

        async fn sign_out(&self) -> Result<(), AuthError> {
            Ok(())
        }

        async fn request_password_reset(&self, _email: &str) -> Result<(), AuthError> {
            Ok(())
        }

        async fn update_password(&self, _password: &str) -> Result<(), AuthError> {
            Ok(())
        }

        async fn complete_link(&self, _link: &str) -> Result<LinkSession, AuthError> {
            Err(AuthError::InvalidLink("unsupported".to_string()))
        }
    }

    fn session_for(email: &str) -> AuthSession {
        AuthSession {
            user_id: "u-1".to_string(),
            email: Some(email.to_string()),
            username: None,
            access_token: "at".to_string(),
            refresh_token: None,
            expires_at: None,
        }
    }

    fn reconciler(profiles: FakeProfiles, store: Arc<MemoryStore>) -> SessionReconciler<FakeProfiles, Arc<MemoryStore>> {
        SessionReconciler::new(profiles, PendingProfiles::new(store))
    }

    #[tokio::test]
    async fn test_pending_username_applied_once() {
        let store = Arc::new(MemoryStore::default());
        PendingProfiles::new(store.clone()).stash("a@b.com", "alice").unwrap();
        let profiles = FakeProfiles::default();
        let reconciler = reconciler(profiles.clone(), store.clone());
        let session = session_for("a@b.com");

        let first = reconciler.reconcile(Some(&session)).await;
        assert_eq!(
            first,
            ReconcileOutcome::PendingApplied {
                username: "alice".to_string(),
                upserted: true
            }
        );
        assert_eq!(store.get("pending_username_a@b.com").unwrap(), None);

        let second = reconciler.reconcile(Some(&session)).await;
        assert_eq!(second, ReconcileOutcome::NoPendingUpdate);
        assert_eq!(profiles.calls.load(Ordering::SeqCst), 1);
        assert_eq!(*profiles.usernames.lock().unwrap(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_upsert_still_discards_entry() {
        let store = Arc::new(MemoryStore::default());
        PendingProfiles::new(store.clone()).stash("a@b.com", "alice").unwrap();
        let profiles = FakeProfiles::default();
        profiles.fail.store(true, Ordering::SeqCst);
        let reconciler = reconciler(profiles.clone(), store.clone());

        let outcome = reconciler.reconcile(Some(&session_for("a@b.com"))).await;
        assert_eq!(
            outcome,
            ReconcileOutcome::PendingApplied {
                username: "alice".to_string(),
                upserted: false
            }
        );
        assert_eq!(store.get("pending_username_a@b.com").unwrap(), None);

        reconciler.reconcile(Some(&session_for("a@b.com"))).await;
        assert_eq!(profiles.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_session_and_other_emails_untouched() {
        let store = Arc::new(MemoryStore::default());
        PendingProfiles::new(store.clone()).stash("a@b.com", "alice").unwrap();
        let profiles = FakeProfiles::default();
        let reconciler = reconciler(profiles.clone(), store.clone());

        assert_eq!(reconciler.reconcile(None).await, ReconcileOutcome::NoSession);
        assert_eq!(
            reconciler.reconcile(Some(&session_for("c@d.com"))).await,
            ReconcileOutcome::NoPendingUpdate
        );
        assert_eq!(profiles.calls.load(Ordering::SeqCst), 0);
        assert_eq!(store.get("pending_username_a@b.com").unwrap().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_email_case_is_normalized() {
        let store = Arc::new(MemoryStore::default());
        PendingProfiles::new(store.clone()).stash(" Alice@Example.com", "alice").unwrap();
        let reconciler = reconciler(FakeProfiles::default(), store);

        let outcome = reconciler.reconcile(Some(&session_for("alice@example.com"))).await;
        assert!(matches!(outcome, ReconcileOutcome::PendingApplied { upserted: true, .. }));
    }

    #[tokio::test]
    async fn test_run_applies_initial_and_every_later_session() {
        let store = Arc::new(MemoryStore::default());
        let pending = PendingProfiles::new(store.clone());
        pending.stash("a@b.com", "alice").unwrap();
        pending.stash("c@d.com", "carol").unwrap();
        let profiles = FakeProfiles::default();

        let (tx, changes) = mpsc::unbounded_channel();
        let events = SessionEvents {
            initial: Some(session_for("a@b.com")),
            changes,
        };
        let task = tokio::spawn(reconciler(profiles.clone(), store.clone()).run(events));

        // Published before the task gets to run; none may be skipped
        tx.send(None).unwrap();
        tx.send(Some(session_for("c@d.com"))).unwrap();
        tx.send(Some(session_for("c@d.com"))).unwrap();
        drop(tx);
        task.await.unwrap();

        assert_eq!(
            *profiles.usernames.lock().unwrap(),
            vec!["alice".to_string(), "carol".to_string()]
        );
        assert_eq!(store.get("pending_username_a@b.com").unwrap(), None);
        assert_eq!(store.get("pending_username_c@d.com").unwrap(), None);
    }

    #[tokio::test]
    async fn test_run_sees_initial_session() {
        let store = Arc::new(MemoryStore::default());
        PendingProfiles::new(store.clone()).stash("a@b.com", "alice").unwrap();
        let profiles = FakeProfiles::default();

        let (tx, changes) = mpsc::unbounded_channel();
        let events = SessionEvents {
            initial: Some(session_for("a@b.com")),
            changes,
        };
        drop(tx);
        reconciler(profiles.clone(), store.clone()).run(events).await;

        assert_eq!(profiles.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("pending_username_a@b.com").unwrap(), None);
    }

    #[tokio::test]
    async fn test_spawned_reconciler_uses_refreshed_session() {
        let store = Arc::new(MemoryStore::default());
        let pending = PendingProfiles::new(store.clone());
        pending.stash("a@b.com", "alice").unwrap();
        let profiles = FakeProfiles::default();

        let stale = AuthSession {
            access_token: "stale".to_string(),
            ..session_for("a@b.com")
        };
        let auth = FakeAuth {
            current: Mutex::new(Some(stale)),
            refreshed: Some(AuthSession {
                access_token: "fresh".to_string(),
                ..session_for("a@b.com")
            }),
            ..Default::default()
        };

        let task = spawn_reconciler(&auth, profiles.clone(), pending).await;
        drop(auth);
        task.await.unwrap();

        assert_eq!(*profiles.tokens.lock().unwrap(), vec!["fresh".to_string()]);
        assert_eq!(store.get("pending_username_a@b.com").unwrap(), None);
    }

    #[tokio::test]
    async fn test_spawned_reconciler_follows_changes() {
        let store = Arc::new(MemoryStore::default());
        let pending = PendingProfiles::new(store.clone());
        pending.stash("a@b.com", "alice").unwrap();
        let profiles = FakeProfiles::default();
        let auth = FakeAuth::default();

        let task = spawn_reconciler(&auth, profiles.clone(), pending).await;
        for tx in auth.subscribers.lock().unwrap().iter() {
            tx.send(Some(session_for("a@b.com"))).unwrap();
        }
        drop(auth);
        task.await.unwrap();

        assert_eq!(*profiles.usernames.lock().unwrap(), vec!["alice".to_string()]);
    }

    #[tokio::test]
    async fn test_sign_up_parks_username() {
        let store = Arc::new(MemoryStore::default());
        let pending = PendingProfiles::new(store.clone());
        let auth = FakeAuth::default();
        let form = SignUpForm {
            email: " a@b.com ".to_string(),
            username: " alice ".to_string(),
            password: "secret123".to_string(),
            confirm: "secret123".to_string(),
        };

        let res = sign_up(&auth, &pending, &form).await.unwrap();
        assert_eq!(res.email.as_deref(), Some("a@b.com"));
        assert_eq!(pending.get("a@b.com").unwrap().as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_sign_up_validation_and_rejection() {
        let store = Arc::new(MemoryStore::default());
        let pending = PendingProfiles::new(store.clone());
        let auth = FakeAuth::default();

        let short = SignUpForm {
            email: "a@b.com".to_string(),
            username: "alice".to_string(),
            password: "short".to_string(),
            confirm: "short".to_string(),
        };
        let err = sign_up(&auth, &pending, &short).await.unwrap_err();
        assert_eq!(err.to_string(), "Password must be at least 8 characters");

        let mismatch = SignUpForm {
            password: "secret123".to_string(),
            confirm: "secret124".to_string(),
            ..short.clone()
        };
        assert!(matches!(
            sign_up(&auth, &pending, &mismatch).await,
            Err(AuthError::Validation(_))
        ));
        assert_eq!(auth.signups.load(Ordering::SeqCst), 0);

        let rejecting = FakeAuth {
            reject: true,
            ..Default::default()
        };
        let valid = SignUpForm {
            password: "secret123".to_string(),
            confirm: "secret123".to_string(),
            ..short
        };
        let err = sign_up(&rejecting, &pending, &valid).await.unwrap_err();
        assert_eq!(err.to_string(), "User already registered");
        assert_eq!(pending.get("a@b.com").unwrap(), None);
    }
}
