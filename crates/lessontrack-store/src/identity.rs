//! The signed-in learner, as far as this crate cares.
//!
//! Authentication happens elsewhere. The stores only ask whether someone is
//! signed in, under which id, and which display handle the session holds.

use std::sync::{PoisonError, RwLock};

use tracing::debug;

use crate::model::UserId;

/// Read access to the current identity.
pub trait IdentitySource: Send + Sync {
    /// Id of the signed-in user, or `None` when anonymous.
    fn user_id(&self) -> Option<UserId>;

    /// Display handle held by the running session.
    fn handle(&self) -> Option<String>;
}

#[derive(Debug, Clone, Default)]
struct Session {
    user_id: Option<UserId>,
    handle: Option<String>,
}

/// In-process identity updated by whatever drives authentication.
#[derive(Debug, Default)]
pub struct SessionIdentity {
    session: RwLock<Session>,
}

impl SessionIdentity {
    /// Nobody signed in.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn signed_in(user_id: impl Into<UserId>, handle: Option<String>) -> Self {
        let identity = Self::default();
        identity.sign_in(user_id, handle);
        identity
    }

    pub fn sign_in(&self, user_id: impl Into<UserId>, handle: Option<String>) {
        let user_id = user_id.into();
        debug!(user_id, "session signed in");
        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        session.user_id = Some(user_id);
        session.handle = handle;
    }

    pub fn sign_out(&self) {
        let mut session = self.session.write().unwrap_or_else(PoisonError::into_inner);
        *session = Session::default();
        debug!("session signed out");
    }

    /// Replace the handle held by the session, e.g. after a profile edit.
    pub fn set_handle(&self, handle: Option<String>) {
        self.session
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .handle = handle;
    }

    fn snapshot(&self) -> Session {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl IdentitySource for SessionIdentity {
    fn user_id(&self) -> Option<UserId> {
        self.snapshot().user_id.filter(|id| !id.trim().is_empty())
    }

    fn handle(&self) -> Option<String> {
        self.snapshot().handle
    }
}
