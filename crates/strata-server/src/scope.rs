//! Hierarchical cancellation scopes.
//!
//! Scopes form a tree: the hub scope at the root, listener and connection
//! scopes beneath it. Cancelling a scope cancels every scope below it;
//! cancelling a child leaves its parent and siblings running.

use futures_util::future::select_all;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Clone, Debug)]
pub struct Scope {
    inner: Arc<ScopeInner>,
}

#[derive(Debug)]
struct ScopeInner {
    name: String,
    cancelled: watch::Sender<bool>,
    parent: Option<Scope>,
}

impl Scope {
    pub fn root(name: impl Into<String>) -> Self {
        Self::with_parent(name.into(), None)
    }

    /// A new scope cancelled together with `self`.
    pub fn child(&self, name: impl Into<String>) -> Self {
        Self::with_parent(name.into(), Some(self.clone()))
    }

    fn with_parent(name: String, parent: Option<Scope>) -> Self {
        let (cancelled, _) = watch::channel(false);
        Self {
            inner: Arc::new(ScopeInner {
                name,
                cancelled,
                parent,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Cancel this scope and everything beneath it. Idempotent.
    pub fn cancel(&self) {
        self.inner.cancelled.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.ancestry().any(|scope| *scope.inner.cancelled.borrow())
    }

    /// Resolves once this scope or any ancestor is cancelled.
    pub async fn cancelled(&self) {
        let waits: Vec<_> = self
            .ancestry()
            .map(|scope| {
                let mut rx = scope.inner.cancelled.subscribe();
                Box::pin(async move {
                    let _ = rx.wait_for(|cancelled| *cancelled).await;
                })
            })
            .collect();
        select_all(waits).await;
    }

    fn ancestry(&self) -> impl Iterator<Item = &Scope> {
        std::iter::successors(Some(self), |scope| scope.inner.parent.as_ref())
    }
}
