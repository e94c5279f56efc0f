use crate::config::{get_access_token, AppConfig};
use std::fmt;
use tokio::sync::watch;

#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub user_id: Option<String>,
    pub access_token: String,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("user_id", &self.user_id)
            .field("access_token", &"<redacted>")
            .finish()
    }
}

fn stored_session(cfg: &AppConfig) -> Option<Session> {
    match get_access_token() {
        Ok(access_token) => Some(Session {
            user_id: cfg.user_id.clone(),
            access_token,
        }),
        Err(err) => {
            tracing::debug!(error = %err, "no stored session");
            None
        }
    }
}

pub trait SessionProvider: Send + Sync {
    fn current_session(&self) -> Option<Session>;

    fn subscribe(&self) -> watch::Receiver<Option<Session>>;
}

pub struct SessionStore {
    tx: watch::Sender<Option<Session>>,
}

impl SessionStore {
    pub fn new(initial: Option<Session>) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(stored_session(cfg))
    }

    pub fn reload(&self, cfg: &AppConfig) {
        self.set(stored_session(cfg));
    }

    pub fn set(&self, session: Option<Session>) {
        let signed_in = session.is_some();
        self.tx.send_replace(session);
        tracing::info!(signed_in, "session changed");
    }
}

impl SessionProvider for SessionStore {
    fn current_session(&self) -> Option<Session> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Session>> {
        self.tx.subscribe()
    }
}
