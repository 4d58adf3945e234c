use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use futures::{
    future::{self, BoxFuture, Shared},
    FutureExt,
};
use shared::domain::UserRecord;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;

pub type OperationResult = Result<Option<UserRecord>, SessionError>;

/// An in-flight session request. Every clone observes the same outcome.
#[derive(Clone)]
pub struct PendingOperation {
    id: u64,
    cancel: CancellationToken,
    outcome: Shared<BoxFuture<'static, OperationResult>>,
}

impl PendingOperation {
    pub(crate) fn spawn<F>(id: u64, cancel: CancellationToken, work: F) -> Self
    where
        F: Future<Output = OperationResult> + Send + 'static,
    {
        let task = tokio::spawn(work);
        let outcome = async move {
            match task.await {
                Ok(result) => result,
                Err(err) if err.is_cancelled() => Err(SessionError::Cancelled),
                Err(err) => Err(SessionError::Transport(format!(
                    "session operation task failed: {err}"
                ))),
            }
        }
        .boxed()
        .shared();

        Self {
            id,
            cancel,
            outcome,
        }
    }

    pub(crate) fn settled(id: u64, result: OperationResult) -> Self {
        Self {
            id,
            cancel: CancellationToken::new(),
            outcome: future::ready(result).boxed().shared(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Future for PendingOperation {
    type Output = OperationResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().outcome.poll_unpin(cx)
    }
}

impl fmt::Debug for PendingOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingOperation")
            .field("id", &self.id)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("settled", &self.outcome.peek().is_some())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SessionResponse {
    pub fetch: PendingOperation,
    pub updated: bool,
}

impl SessionResponse {
    pub(crate) fn new(fetch: PendingOperation) -> Self {
        Self {
            fetch,
            updated: false,
        }
    }

    pub(crate) fn updated(fetch: PendingOperation) -> Self {
        Self {
            fetch,
            updated: true,
        }
    }
}
