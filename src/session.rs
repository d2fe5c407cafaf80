//! Session gating for listener deliveries.

use crate::error::SourceError;
use crate::source::Delivery;
use crate::types::ChangeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Read-only view of the authentication state, owned elsewhere.
pub trait SessionState: Send + Sync {
    fn is_authenticated(&self) -> bool;
}

impl<F> SessionState for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn is_authenticated(&self) -> bool {
        self()
    }
}

/// A settable session flag.
#[derive(Debug, Default)]
pub struct SessionFlag {
    authenticated: AtomicBool,
}

impl SessionFlag {
    pub fn new(authenticated: bool) -> Self {
        Self {
            authenticated: AtomicBool::new(authenticated),
        }
    }

    pub fn signed_in() -> Arc<Self> {
        Arc::new(Self::new(true))
    }

    pub fn sign_in(&self) {
        self.authenticated.store(true, Ordering::SeqCst);
    }

    pub fn sign_out(&self) {
        self.authenticated.store(false, Ordering::SeqCst);
    }
}

impl SessionState for SessionFlag {
    fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }
}

/// Which listener a delivery came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenerRole {
    Driving,
    Dependent,
}

/// Verdict on a delivery.
#[derive(Debug)]
pub enum Admission {
    /// Apply the changes.
    Deliver(ChangeSet),
    /// Signed out or permission revoked: emit empty, stop.
    AuthorizationLoss,
    /// Driving query failed for another reason: surface and stop.
    Fatal(SourceError),
    /// Dependent query failed for another reason: keep stale data.
    Transient(SourceError),
}

/// Classifies every delivery against the session before it is applied.
#[derive(Clone)]
pub struct SessionGuard {
    session: Arc<dyn SessionState>,
}

impl SessionGuard {
    pub fn new(session: Arc<dyn SessionState>) -> Self {
        Self { session }
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_authenticated()
    }

    pub fn admit(&self, role: ListenerRole, delivery: Delivery) -> Admission {
        if !self.session.is_authenticated() {
            return Admission::AuthorizationLoss;
        }
        match delivery {
            Ok(changes) => Admission::Deliver(changes),
            Err(error) if error.is_authorization_loss() => Admission::AuthorizationLoss,
            Err(error) => match role {
                ListenerRole::Driving => Admission::Fatal(error),
                ListenerRole::Dependent => Admission::Transient(error),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(flag: &Arc<SessionFlag>) -> SessionGuard {
        let session: Arc<dyn SessionState> = flag.clone();
        SessionGuard::new(session)
    }

    #[test]
    fn test_signed_out_beats_everything() {
        let flag = SessionFlag::signed_in();
        let guard = guard(&flag);
        flag.sign_out();

        let verdict = guard.admit(ListenerRole::Dependent, Ok(ChangeSet::default()));
        assert!(matches!(verdict, Admission::AuthorizationLoss));

        let verdict = guard.admit(ListenerRole::Driving, Err(SourceError::internal("x")));
        assert!(matches!(verdict, Admission::AuthorizationLoss));
    }

    #[test]
    fn test_permission_denied_is_not_fatal() {
        let guard = guard(&SessionFlag::signed_in());
        for role in [ListenerRole::Driving, ListenerRole::Dependent] {
            let verdict = guard.admit(role, Err(SourceError::permission_denied("rules")));
            assert!(matches!(verdict, Admission::AuthorizationLoss));
        }
    }

    #[test]
    fn test_other_errors_by_role() {
        let guard = guard(&SessionFlag::signed_in());

        let verdict = guard.admit(ListenerRole::Driving, Err(SourceError::unavailable("net")));
        assert!(matches!(verdict, Admission::Fatal(_)));

        let verdict = guard.admit(ListenerRole::Dependent, Err(SourceError::unavailable("net")));
        assert!(matches!(verdict, Admission::Transient(_)));
    }

    #[test]
    fn test_closure_session() {
        let guard = SessionGuard::new(Arc::new(|| true));
        assert!(guard.is_authenticated());
        assert!(matches!(
            guard.admit(ListenerRole::Driving, Ok(ChangeSet::default())),
            Admission::Deliver(_)
        ));
    }
}
