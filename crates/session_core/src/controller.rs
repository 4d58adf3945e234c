//! Single-flight session controller: a new intent cancels whatever was
//! still in flight, and a superseded operation never touches the store.

use std::{future::Future, sync::Arc};

use parking_lot::Mutex;
use shared::{
    domain::{LoginCredentials, UserRecord},
    protocol::{RegisterUserDetail, SessionIntent, UpdateUserDetail, UserEnvelope},
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    api::UserApi,
    error::SessionError,
    operation::{OperationResult, PendingOperation, SessionResponse},
    store::SessionStore,
};

const RESPONSE_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Anonymous,
    Authenticated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenPolicy {
    Replace,
    Keep,
}

#[derive(Default)]
struct InFlight {
    next_id: u64,
    current: Option<(u64, CancellationToken)>,
}

impl InFlight {
    fn supersede(&mut self) -> u64 {
        if let Some((id, cancel)) = self.current.take() {
            debug!(operation = id, "superseding pending session operation");
            cancel.cancel();
        }
        self.next_id += 1;
        self.next_id
    }
}

struct ControllerInner {
    api: Arc<dyn UserApi>,
    store: Arc<dyn SessionStore>,
    in_flight: Mutex<InFlight>,
    // Held across the transport call so a superseded request is fully
    // dropped before the next one goes out.
    wire: tokio::sync::Mutex<()>,
    responses: broadcast::Sender<SessionResponse>,
}

impl ControllerInner {
    fn begin(&self) -> (u64, CancellationToken) {
        let mut in_flight = self.in_flight.lock();
        let id = in_flight.supersede();
        let cancel = CancellationToken::new();
        in_flight.current = Some((id, cancel.clone()));
        (id, cancel)
    }

    fn begin_settled(&self) -> u64 {
        self.in_flight.lock().supersede()
    }

    async fn call<T>(
        &self,
        cancel: &CancellationToken,
        call: impl Future<Output = Result<T, SessionError>>,
    ) -> Result<T, SessionError> {
        let _wire = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(SessionError::Cancelled),
            guard = self.wire.lock() => guard,
        };
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(SessionError::Cancelled),
            result = call => result,
        }
    }

    /// Runs `apply` against the store if operation `id` is still current,
    /// releasing its slot. A stale operation gets `Cancelled` instead.
    fn complete(
        &self,
        id: u64,
        cancel: &CancellationToken,
        apply: impl FnOnce(&dyn SessionStore) -> OperationResult,
    ) -> OperationResult {
        let mut in_flight = self.in_flight.lock();
        let is_current = matches!(&in_flight.current, Some((current, _)) if *current == id);
        if cancel.is_cancelled() || !is_current {
            debug!(operation = id, "discarding result of superseded session operation");
            return Err(SessionError::Cancelled);
        }
        in_flight.current = None;
        apply(self.store.as_ref())
    }

    fn complete_user_call(
        &self,
        intent: &'static str,
        id: u64,
        cancel: &CancellationToken,
        result: Result<UserEnvelope, SessionError>,
        tokens: TokenPolicy,
    ) -> OperationResult {
        self.complete(id, cancel, |store| {
            let envelope = result?;
            if let Some(errors) = envelope.errors {
                debug!(intent, %errors, "backend rejected session request");
                return Err(SessionError::Application(errors));
            }
            if let Some(user) = &envelope.user {
                store.store_user(user.clone());
                if tokens == TokenPolicy::Replace {
                    store.store_token(&user.token);
                }
                info!(intent, username = %user.username, "session user updated");
            }
            Ok(envelope.user)
        })
    }

    fn complete_current_user(
        &self,
        id: u64,
        cancel: &CancellationToken,
        result: Result<UserEnvelope, SessionError>,
    ) -> OperationResult {
        let result = result.and_then(|envelope| match envelope.errors {
            Some(errors) => Err(SessionError::Application(errors)),
            None => Ok(envelope),
        });
        let outcome = self.complete(id, cancel, |store| match result {
            Ok(envelope) => {
                if let Some(user) = &envelope.user {
                    store.store_user(user.clone());
                    store.store_token(&user.token);
                    info!(username = %user.username, "restored session user");
                }
                Ok(envelope.user)
            }
            Err(err) => {
                if !err.is_cancellation() {
                    store.clear_token();
                }
                Err(err)
            }
        });

        // Current-user lookups never reject once the request was issued.
        match outcome {
            Err(err) if err.is_cancellation() => {
                debug!(operation = id, "current user lookup cancelled");
                Ok(None)
            }
            Err(err) => {
                warn!(error = %err, "failed to fetch current user");
                Ok(None)
            }
            ok => ok,
        }
    }
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<ControllerInner>,
}

impl SessionController {
    pub fn new(api: Arc<dyn UserApi>, store: Arc<dyn SessionStore>) -> Self {
        let (responses, _) = broadcast::channel(RESPONSE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(ControllerInner {
                api,
                store,
                in_flight: Mutex::new(InFlight::default()),
                wire: tokio::sync::Mutex::new(()),
                responses,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionResponse> {
        self.inner.responses.subscribe()
    }

    pub fn state(&self) -> SessionState {
        if self.inner.store.user().is_some() {
            SessionState::Authenticated
        } else {
            SessionState::Anonymous
        }
    }

    pub fn current_user(&self) -> Option<UserRecord> {
        self.inner.store.user()
    }

    pub fn token(&self) -> Option<String> {
        self.inner.store.token()
    }

    pub fn cancel_pending(&self) {
        let mut in_flight = self.inner.in_flight.lock();
        if let Some((id, cancel)) = in_flight.current.take() {
            debug!(operation = id, "cancelling pending session operation");
            cancel.cancel();
        }
    }

    /// Handles one intent. `None` when the intent was ignored.
    pub fn dispatch(&self, intent: SessionIntent) -> Option<SessionResponse> {
        match intent {
            SessionIntent::LoginUser(credentials) => Some(self.login_user(credentials)),
            SessionIntent::RegisterUser(detail) => self.register_user(detail),
            SessionIntent::UpdateUser(detail) => self.update_user(detail),
            SessionIntent::GetUser {} => Some(self.get_user()),
            SessionIntent::LogoutUser {} => Some(self.logout_user()),
        }
    }

    pub fn login_user(&self, credentials: LoginCredentials) -> SessionResponse {
        let (id, cancel) = self.inner.begin();
        let inner = Arc::clone(&self.inner);
        let abort = cancel.clone();
        let fetch = PendingOperation::spawn(id, cancel, async move {
            let auth = inner.store.token();
            let result = inner
                .call(&abort, inner.api.login(&credentials, auth.as_deref()))
                .await;
            inner.complete_user_call("loginUser", id, &abort, result, TokenPolicy::Replace)
        });
        self.publish(SessionResponse::new(fetch))
    }

    pub fn register_user(&self, detail: RegisterUserDetail) -> Option<SessionResponse> {
        let Some(user) = detail.user else {
            debug!("ignoring registerUser intent without user");
            return None;
        };

        let (id, cancel) = self.inner.begin();
        let inner = Arc::clone(&self.inner);
        let abort = cancel.clone();
        let fetch = PendingOperation::spawn(id, cancel, async move {
            let auth = inner.store.token();
            let result = inner
                .call(&abort, inner.api.register(&user, auth.as_deref()))
                .await;
            inner.complete_user_call("registerUser", id, &abort, result, TokenPolicy::Replace)
        });
        Some(self.publish(SessionResponse::new(fetch)))
    }

    pub fn update_user(&self, detail: UpdateUserDetail) -> Option<SessionResponse> {
        let Some(changes) = detail.user else {
            debug!("ignoring updateUser intent without user");
            return None;
        };

        let (id, cancel) = self.inner.begin();
        let inner = Arc::clone(&self.inner);
        let abort = cancel.clone();
        let fetch = PendingOperation::spawn(id, cancel, async move {
            let auth = inner.store.token();
            let result = inner
                .call(&abort, inner.api.update(&changes, auth.as_deref()))
                .await;
            inner.complete_user_call("updateUser", id, &abort, result, TokenPolicy::Keep)
        });
        Some(self.publish(SessionResponse::updated(fetch)))
    }

    pub fn get_user(&self) -> SessionResponse {
        if let Some(user) = self.inner.store.user() {
            let id = self.inner.begin_settled();
            return self.publish(SessionResponse::new(PendingOperation::settled(
                id,
                Ok(Some(user)),
            )));
        }

        let Some(auth) = self.inner.store.token() else {
            let id = self.inner.begin_settled();
            return self.publish(SessionResponse::new(PendingOperation::settled(
                id,
                Err(SessionError::NoToken),
            )));
        };

        let (id, cancel) = self.inner.begin();
        let inner = Arc::clone(&self.inner);
        let abort = cancel.clone();
        let fetch = PendingOperation::spawn(id, cancel, async move {
            let result = inner.call(&abort, inner.api.current_user(&auth)).await;
            inner.complete_current_user(id, &abort, result)
        });
        self.publish(SessionResponse::new(fetch))
    }

    pub fn logout_user(&self) -> SessionResponse {
        let id = self.inner.begin_settled();
        self.inner.store.clear_token();
        self.inner.store.clear_user();
        info!("session cleared");
        self.publish(SessionResponse::new(PendingOperation::settled(
            id,
            Err(SessionError::LoggedOut),
        )))
    }

    /// Starts consuming `intents` in receipt order until the sender side
    /// closes or the returned listener is detached.
    pub fn attach(&self, mut intents: mpsc::Receiver<SessionIntent>) -> IntentListener {
        let controller = self.clone();
        let task = tokio::spawn(async move {
            while let Some(intent) = intents.recv().await {
                debug!(intent = intent.name(), "received session intent");
                controller.dispatch(intent);
            }
            debug!("session intent channel closed");
        });
        IntentListener { task }
    }

    fn publish(&self, response: SessionResponse) -> SessionResponse {
        // Nobody listening is fine; the caller still gets the response.
        let _ = self.inner.responses.send(response.clone());
        response
    }
}

/// Handle to an attached intent loop. Dropping it detaches.
pub struct IntentListener {
    task: JoinHandle<()>,
}

impl IntentListener {
    pub fn is_attached(&self) -> bool {
        !self.task.is_finished()
    }

    pub fn detach(self) {}
}

impl Drop for IntentListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[path = "tests/controller_tests.rs"]
mod tests;
