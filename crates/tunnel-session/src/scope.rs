//! Hierarchical cancellation (spec §5): server -> session manager ->
//! connection -> bridge -> forwarder direction. Cancelling a parent
//! cancels every descendant; a descendant can never outlive the scope
//! that spawned it.
//!
//! Grounded in the teacher's `TaskTracker` (abort-on-replace JoinHandle
//! tracking); generalized from a single flat map of abort handles to a
//! tree of `CancellationToken`s so cancellation composes across the
//! whole component hierarchy rather than per-tunnel only.

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Scope {
    token: CancellationToken,
}

impl Scope {
    pub fn root() -> Self {
        Self { token: CancellationToken::new() }
    }

    /// Creates a child scope. Cancelling `self` cancels the child; the
    /// child cannot be cancelled without affecting its own descendants,
    /// but cancelling it never propagates back up.
    pub fn child(&self) -> Self {
        Self { token: self.token.child_token() }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::root()
    }
}
