use std::future::Future;
use tokio_util::sync::CancellationToken;

/// Returned by [`Context::run`] when the context is cancelled before the
/// wrapped operation completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("context canceled")]
pub struct Cancelled;

/// Per-call context handed to every supervisor operation.
///
/// Carries the namespace and lease the call runs under, plus a cancellation
/// token. Cloning shares the token; [`Context::child`] derives a token that is
/// cancelled together with its parent but can also be cancelled on its own.
#[derive(Debug, Clone, Default)]
pub struct Context {
    namespace: Option<String>,
    lease: Option<String>,
    token: CancellationToken,
}

impl Context {
    pub fn background() -> Self {
        Self::default()
    }

    pub fn child(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            lease: self.lease.clone(),
            token: self.token.child_token(),
        }
    }

    pub fn with_namespace(&self, namespace: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.namespace = Some(namespace.into());
        ctx
    }

    pub fn with_lease(&self, lease: impl Into<String>) -> Self {
        let mut ctx = self.clone();
        ctx.lease = Some(lease.into());
        ctx
    }

    pub fn without_lease(&self) -> Self {
        let mut ctx = self.clone();
        ctx.lease = None;
        ctx
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    pub fn lease(&self) -> Option<&str> {
        self.lease.as_deref()
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

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Drives `fut` to completion unless the context is cancelled first.
    pub async fn run<T, E, F>(&self, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
        E: From<Cancelled>,
    {
        if self.token.is_cancelled() {
            return Err(Cancelled.into());
        }
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Cancelled.into()),
            res = fut => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Cancelled,
    }

    impl From<Cancelled> for TestError {
        fn from(_: Cancelled) -> Self {
            TestError::Cancelled
        }
    }

    #[test]
    fn test_scoping_does_not_leak_into_parent() {
        let root = Context::background().with_namespace("ns");
        let leased = root.with_lease("l1");

        assert_eq!(leased.namespace(), Some("ns"));
        assert_eq!(leased.lease(), Some("l1"));
        assert_eq!(root.lease(), None);
        assert_eq!(leased.without_lease().lease(), None);
    }

    #[test]
    fn test_child_cancelled_with_parent() {
        let parent = Context::background();
        let child = parent.child();
        let sibling = parent.child();

        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
        assert!(!sibling.is_cancelled());

        parent.cancel();
        assert!(sibling.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_returns_cancelled() {
        let ctx = Context::background();
        let waiter = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waiter.cancel();
        });

        let res: Result<(), TestError> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .await;
        assert_eq!(res, Err(TestError::Cancelled));
    }

    #[tokio::test]
    async fn test_run_completes() {
        let ctx = Context::background();
        let res: Result<u32, TestError> = ctx.run(async { Ok(7) }).await;
        assert_eq!(res, Ok(7));
    }
}
