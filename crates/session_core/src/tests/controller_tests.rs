use super::*;

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Map;
use shared::{
    domain::{NewUser, UserChanges},
    error::ErrorList,
};
use tokio::sync::{broadcast::error::TryRecvError, oneshot};

use crate::store::MemorySessionStore;

type Reply = Result<UserEnvelope, SessionError>;

enum Scripted {
    Now(Reply),
    Wait(oneshot::Receiver<Reply>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Call {
    method: &'static str,
    auth: Option<String>,
}

#[derive(Default)]
struct FakeUserApi {
    replies: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<Call>>,
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeUserApi {
    fn reply(self, reply: Reply) -> Self {
        self.replies.lock().push_back(Scripted::Now(reply));
        self
    }

    fn hold(self) -> (Self, oneshot::Sender<Reply>) {
        let (tx, rx) = oneshot::channel();
        self.replies.lock().push_back(Scripted::Wait(rx));
        (self, tx)
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    async fn respond(&self, method: &'static str, auth: Option<&str>) -> Reply {
        self.calls.lock().push(Call {
            method,
            auth: auth.map(str::to_string),
        });
        let scripted = self.replies.lock().pop_front();

        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_active, Ordering::SeqCst);
        let _guard = ActiveGuard(Arc::clone(&self.active));

        match scripted {
            Some(Scripted::Now(reply)) => reply,
            Some(Scripted::Wait(rx)) => rx
                .await
                .unwrap_or_else(|_| Err(SessionError::Transport("reply dropped".to_string()))),
            None => Err(SessionError::Transport("no scripted reply".to_string())),
        }
    }
}

#[async_trait]
impl UserApi for FakeUserApi {
    async fn login(
        &self,
        _credentials: &LoginCredentials,
        auth: Option<&str>,
    ) -> Result<UserEnvelope, SessionError> {
        self.respond("login", auth).await
    }

    async fn register(
        &self,
        _user: &NewUser,
        auth: Option<&str>,
    ) -> Result<UserEnvelope, SessionError> {
        self.respond("register", auth).await
    }

    async fn update(
        &self,
        _changes: &UserChanges,
        auth: Option<&str>,
    ) -> Result<UserEnvelope, SessionError> {
        self.respond("update", auth).await
    }

    async fn current_user(&self, auth: &str) -> Result<UserEnvelope, SessionError> {
        self.respond("current_user", Some(auth)).await
    }
}

fn user(email: &str, token: &str) -> UserRecord {
    UserRecord {
        email: email.to_string(),
        token: token.to_string(),
        username: email.split('@').next().unwrap_or_default().to_string(),
        bio: None,
        image: None,
        extra: Map::new(),
    }
}

fn credentials() -> LoginCredentials {
    LoginCredentials {
        email: "a@b.com".to_string(),
        password: "x".to_string(),
    }
}

fn new_user() -> NewUser {
    NewUser {
        username: "ab".to_string(),
        email: "a@b.com".to_string(),
        password: "x".to_string(),
    }
}

fn controller_with(
    api: FakeUserApi,
    store: MemorySessionStore,
) -> (SessionController, Arc<FakeUserApi>, Arc<MemorySessionStore>) {
    let api = Arc::new(api);
    let store = Arc::new(store);
    let controller = SessionController::new(api.clone(), store.clone());
    (controller, api, store)
}

#[tokio::test]
async fn login_caches_user_and_token() {
    let returned = user("a@b.com", "t1");
    let (controller, api, store) = controller_with(
        FakeUserApi::default().reply(Ok(UserEnvelope::user(returned.clone()))),
        MemorySessionStore::new(),
    );

    let response = controller.login_user(credentials());
    assert!(!response.updated);
    let resolved = response.fetch.await.expect("login");

    assert_eq!(resolved, Some(returned.clone()));
    assert_eq!(store.user(), Some(returned));
    assert_eq!(store.token().as_deref(), Some("t1"));
    assert_eq!(controller.state(), SessionState::Authenticated);
    assert_eq!(api.calls().len(), 1);
}

#[tokio::test]
async fn get_user_after_login_is_served_from_cache() {
    let returned = user("a@b.com", "t1");
    let (controller, api, _store) = controller_with(
        FakeUserApi::default().reply(Ok(UserEnvelope::user(returned.clone()))),
        MemorySessionStore::new(),
    );

    controller.login_user(credentials()).fetch.await.expect("login");
    let response = controller.get_user();
    let cached = response
        .fetch
        .now_or_never()
        .expect("settled without a request")
        .expect("get");
    assert_eq!(cached, Some(returned));
    assert_eq!(api.calls().len(), 1, "no second network call");
}

#[tokio::test]
async fn register_without_user_is_ignored() {
    let (controller, api, _store) =
        controller_with(FakeUserApi::default(), MemorySessionStore::new());
    let mut responses = controller.subscribe();

    assert!(controller
        .register_user(RegisterUserDetail::default())
        .is_none());
    assert!(controller.update_user(UpdateUserDetail::default()).is_none());
    assert!(controller
        .dispatch(SessionIntent::RegisterUser(RegisterUserDetail::default()))
        .is_none());

    assert!(matches!(responses.try_recv(), Err(TryRecvError::Empty)));
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn register_caches_user_and_token() {
    let returned = user("a@b.com", "t-new");
    let (controller, api, store) = controller_with(
        FakeUserApi::default().reply(Ok(UserEnvelope::user(returned.clone()))),
        MemorySessionStore::new(),
    );

    let response = controller
        .register_user(RegisterUserDetail {
            user: Some(new_user()),
        })
        .expect("response");
    assert_eq!(response.fetch.await.expect("register"), Some(returned));
    assert_eq!(store.token().as_deref(), Some("t-new"));
    assert_eq!(api.calls()[0].method, "register");
}

#[tokio::test]
async fn get_user_without_token_rejects_without_request() {
    let (controller, api, _store) =
        controller_with(FakeUserApi::default(), MemorySessionStore::new());

    let err = controller.get_user().fetch.await.expect_err("must fail");
    assert_eq!(err, SessionError::NoToken);
    assert!(err.to_string().contains("No token found"));
    assert!(api.calls().is_empty());
    assert_eq!(controller.state(), SessionState::Anonymous);
}

#[tokio::test]
async fn get_user_with_token_fetches_and_refreshes_token() {
    let returned = user("a@b.com", "t2");
    let (controller, api, store) = controller_with(
        FakeUserApi::default().reply(Ok(UserEnvelope::user(returned.clone()))),
        MemorySessionStore::with_token("t1"),
    );

    let resolved = controller.get_user().fetch.await.expect("get");
    assert_eq!(resolved, Some(returned.clone()));
    assert_eq!(store.user(), Some(returned));
    assert_eq!(store.token().as_deref(), Some("t2"));
    assert_eq!(
        api.calls(),
        vec![Call {
            method: "current_user",
            auth: Some("t1".to_string()),
        }]
    );
}

#[tokio::test]
async fn get_user_failure_clears_token_and_resolves_empty() {
    let (controller, _api, store) = controller_with(
        FakeUserApi::default().reply(Err(SessionError::Transport("connection reset".into()))),
        MemorySessionStore::with_token("t1"),
    );

    let resolved = controller.get_user().fetch.await.expect("failure is swallowed");
    assert!(resolved.is_none());
    assert!(store.token().is_none());
    assert_eq!(controller.state(), SessionState::Anonymous);
}

#[tokio::test]
async fn cancelled_get_user_keeps_token() {
    let (api, _reply) = FakeUserApi::default().hold();
    let (controller, _api, store) = controller_with(api, MemorySessionStore::with_token("t1"));

    let response = controller.get_user();
    tokio::task::yield_now().await;
    controller.cancel_pending();

    let resolved = response.fetch.await.expect("cancellation is swallowed");
    assert!(resolved.is_none());
    assert_eq!(store.token().as_deref(), Some("t1"));
}

#[tokio::test]
async fn update_replaces_user_but_keeps_token() {
    let mut updated = user("a@b.com", "server-token");
    updated.bio = Some("hello".to_string());
    let (controller, api, store) = controller_with(
        FakeUserApi::default().reply(Ok(UserEnvelope::user(updated.clone()))),
        MemorySessionStore::with_token("t1"),
    );
    store.store_user(user("a@b.com", "t1"));

    let response = controller
        .update_user(UpdateUserDetail {
            user: Some(UserChanges {
                bio: Some("hello".to_string()),
                ..UserChanges::default()
            }),
        })
        .expect("response");
    assert!(response.updated);

    assert_eq!(response.fetch.await.expect("update"), Some(updated.clone()));
    assert_eq!(store.user(), Some(updated));
    assert_eq!(store.token().as_deref(), Some("t1"));
    assert_eq!(api.calls()[0].auth.as_deref(), Some("t1"));
}

#[tokio::test]
async fn error_payload_rejects_and_leaves_session_untouched() {
    let errors = ErrorList::new().with("email or password", "is invalid");
    let (controller, _api, store) = controller_with(
        FakeUserApi::default().reply(Ok(UserEnvelope::errors(errors.clone()))),
        MemorySessionStore::new(),
    );

    let err = controller
        .login_user(credentials())
        .fetch
        .await
        .expect_err("must reject");
    assert_eq!(err, SessionError::Application(errors));
    assert!(store.user().is_none());
    assert!(store.token().is_none());
}

#[tokio::test]
async fn update_error_payload_rejects_and_keeps_cached_user() {
    let errors = ErrorList::new().with("email", "has already been taken");
    let (controller, _api, store) = controller_with(
        FakeUserApi::default().reply(Ok(UserEnvelope::errors(errors.clone()))),
        MemorySessionStore::with_token("t1"),
    );
    let cached = user("a@b.com", "t1");
    store.store_user(cached.clone());

    let response = controller
        .update_user(UpdateUserDetail {
            user: Some(UserChanges {
                email: Some("taken@b.com".to_string()),
                ..UserChanges::default()
            }),
        })
        .expect("response");
    assert!(response.updated);

    let err = response.fetch.await.expect_err("must reject");
    assert_eq!(err, SessionError::Application(errors));
    assert_eq!(controller.token().as_deref(), Some("t1"));
    assert_eq!(controller.current_user(), Some(cached));
    assert_eq!(controller.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn login_transport_failure_is_propagated() {
    let (controller, _api, _store) = controller_with(
        FakeUserApi::default().reply(Err(SessionError::Transport("dns failure".into()))),
        MemorySessionStore::new(),
    );

    let err = controller
        .login_user(credentials())
        .fetch
        .await
        .expect_err("must reject");
    assert_eq!(err, SessionError::Transport("dns failure".into()));
}

#[tokio::test]
async fn logout_clears_session_and_always_rejects() {
    let (controller, api, store) =
        controller_with(FakeUserApi::default(), MemorySessionStore::with_token("t1"));
    store.store_user(user("a@b.com", "t1"));

    let err = controller.logout_user().fetch.await.expect_err("placeholder");
    assert_eq!(err, SessionError::LoggedOut);
    assert_eq!(err.to_string(), "User logged out");
    assert!(store.token().is_none());
    assert!(controller.token().is_none());
    assert!(store.user().is_none());
    assert!(controller.current_user().is_none());
    assert_eq!(controller.state(), SessionState::Anonymous);

    // Logging out again from the anonymous state behaves the same.
    assert_eq!(
        controller.logout_user().fetch.await,
        Err(SessionError::LoggedOut)
    );
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn logout_cancels_pending_login() {
    let (api, reply) = FakeUserApi::default().hold();
    let (controller, _api, store) = controller_with(api, MemorySessionStore::new());

    let login = controller.login_user(credentials());
    tokio::task::yield_now().await;
    let logout = controller.logout_user();

    // The backend answering late must not resurrect the session.
    let _ = reply.send(Ok(UserEnvelope::user(user("a@b.com", "t1"))));

    assert_eq!(login.fetch.await, Err(SessionError::Cancelled));
    assert_eq!(logout.fetch.await, Err(SessionError::LoggedOut));
    assert!(store.token().is_none());
    assert!(store.user().is_none());
    assert_eq!(controller.state(), SessionState::Anonymous);
}

#[tokio::test]
async fn newer_intent_supersedes_older_one() {
    let (api, first_reply) = FakeUserApi::default().hold();
    let second = user("b@c.com", "t2");
    let api = api.reply(Ok(UserEnvelope::user(second.clone())));
    let (controller, api, store) = controller_with(api, MemorySessionStore::new());

    let first = controller.login_user(credentials());
    tokio::task::yield_now().await;
    let second_response = controller.login_user(LoginCredentials {
        email: "b@c.com".to_string(),
        password: "y".to_string(),
    });
    assert!(first.fetch.is_cancelled());
    assert!(second_response.fetch.id() > first.fetch.id());

    assert_eq!(second_response.fetch.await, Ok(Some(second.clone())));
    let _ = first_reply.send(Ok(UserEnvelope::user(user("a@b.com", "t1"))));
    assert_eq!(first.fetch.await, Err(SessionError::Cancelled));

    assert_eq!(store.user(), Some(second));
    assert_eq!(store.token().as_deref(), Some("t2"));
    assert_eq!(api.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn at_most_one_request_is_in_flight() {
    let mut api = FakeUserApi::default();
    let mut senders = Vec::new();
    for _ in 0..8 {
        let (next, tx) = api.hold();
        api = next;
        senders.push(tx);
    }
    let (controller, api, _store) = controller_with(api, MemorySessionStore::new());

    let mut responses = Vec::new();
    for _ in 0..8 {
        responses.push(controller.login_user(credentials()));
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    for tx in senders {
        let _ = tx.send(Ok(UserEnvelope::user(user("a@b.com", "t1"))));
    }

    let last = responses.pop().expect("last");
    for response in responses {
        assert_eq!(response.fetch.await, Err(SessionError::Cancelled));
    }
    assert!(last.fetch.await.expect("last login").is_some());
    assert_eq!(api.peak.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn cancelling_an_operation_directly_settles_it_as_cancelled() {
    let (api, _reply) = FakeUserApi::default().hold();
    let (controller, _api, store) = controller_with(api, MemorySessionStore::new());

    let response = controller.login_user(credentials());
    response.fetch.cancel();

    let err = response.fetch.await.expect_err("cancelled");
    assert!(err.is_cancellation());
    assert!(store.token().is_none());
}

#[tokio::test]
async fn responses_are_broadcast_with_the_same_operation() {
    let returned = user("a@b.com", "t1");
    let (controller, _api, _store) = controller_with(
        FakeUserApi::default().reply(Ok(UserEnvelope::user(returned.clone()))),
        MemorySessionStore::new(),
    );
    let mut responses = controller.subscribe();

    let direct = controller.login_user(credentials());
    let broadcast = responses.recv().await.expect("response event");
    assert_eq!(broadcast.fetch.id(), direct.fetch.id());
    assert!(!broadcast.updated);

    assert_eq!(broadcast.fetch.await, Ok(Some(returned.clone())));
    assert_eq!(direct.fetch.await, Ok(Some(returned)));
}

#[tokio::test]
async fn attached_listener_handles_intents_in_order() {
    let returned = user("a@b.com", "t1");
    let (controller, api, store) = controller_with(
        FakeUserApi::default().reply(Ok(UserEnvelope::user(returned.clone()))),
        MemorySessionStore::new(),
    );
    let mut responses = controller.subscribe();
    let (tx, rx) = mpsc::channel(8);
    let listener = controller.attach(rx);
    assert!(listener.is_attached());

    tx.send(SessionIntent::LoginUser(credentials()))
        .await
        .expect("send login");
    let login = responses.recv().await.expect("login response");
    assert_eq!(login.fetch.await, Ok(Some(returned.clone())));

    tx.send(SessionIntent::RegisterUser(RegisterUserDetail::default()))
        .await
        .expect("send register");
    tx.send(SessionIntent::GetUser {}).await.expect("send get");
    let get = responses.recv().await.expect("get response");
    assert_eq!(get.fetch.await, Ok(Some(returned)));

    tx.send(SessionIntent::LogoutUser {})
        .await
        .expect("send logout");
    let logout = responses.recv().await.expect("logout response");
    assert_eq!(logout.fetch.await, Err(SessionError::LoggedOut));
    assert!(store.token().is_none());
    assert_eq!(api.calls().len(), 1);

    listener.detach();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(tx.send(SessionIntent::GetUser {}).await.is_err());
}
