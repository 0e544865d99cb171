//! End-to-end flows against a mock provider and a virtual clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use keyward_auth::{
    AuthConfig, CallbackFailure, CallbackOutcome, CallbackParams, CallbackRouter,
    DeviceFlowEngine, EndpointConfig, EndpointRegistry, GitHubProviderConfig, ManualClock,
    PollOptions, ProviderClient, SharedCallbacks, UserCallbacks,
};
use keyward_store::{CredentialStore, Database, SqliteSessionRepository};
use serde_json::json;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000, 0).unwrap()
}

fn callback(code: &str, state: &str) -> CallbackParams {
    CallbackParams {
        code: Some(code.to_string()),
        state: Some(state.to_string()),
        ..CallbackParams::default()
    }
}

async fn registry(server: &MockServer, clock: Arc<ManualClock>) -> Arc<EndpointRegistry> {
    let config = AuthConfig {
        endpoints: vec![EndpointConfig {
            id: "linear".to_string(),
            name: "Linear".to_string(),
            issuer: None,
            authorization_url: Some(format!("{}/authorize", server.uri())),
            token_url: Some(format!("{}/token", server.uri())),
            registration_url: None,
            client_id: Some("linear-client".to_string()),
            client_secret: None,
            scope: Some("read".to_string()),
            resource: None,
        }],
        ..AuthConfig::default()
    };
    let db = Database::open_in_memory_migrated().await.unwrap();
    Arc::new(EndpointRegistry::new(
        &config,
        Arc::new(SqliteSessionRepository::new(db)),
        ProviderClient::new(),
        clock,
    ))
}

#[tokio::test]
async fn device_flow_polls_until_token_then_links_account() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/login/device/code"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "device_code": "dc-1",
            "user_code": "WDJB-MJHT",
            "verification_uri": "https://github.com/login/device",
            "expires_in": 900,
            "interval": 5,
        })))
        .expect(1)
        .mount(&server)
        .await;
    for _ in 0..2 {
        Mock::given(method("POST"))
            .and(path("/login/oauth/access_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({ "error": "authorization_pending" })),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
    }
    Mock::given(method("POST"))
        .and(path("/login/oauth/access_token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "abc",
            "token_type": "bearer",
            "scope": "repo",
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/user"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 42,
            "login": "octocat",
        })))
        .mount(&server)
        .await;

    let github = GitHubProviderConfig {
        client_id: Some("gh-client".to_string()),
        client_secret: None,
        scope: "repo".to_string(),
        device_code_url: format!("{}/login/device/code", server.uri()),
        token_url: format!("{}/login/oauth/access_token", server.uri()),
        userinfo_url: format!("{}/user", server.uri()),
    };
    let clock = Arc::new(ManualClock::new(epoch()));
    let store = CredentialStore::new(Database::open_in_memory_migrated().await.unwrap());
    let engine = DeviceFlowEngine::new(github, ProviderClient::new(), store, clock.clone());

    let mut shown = None;
    let result = engine
        .complete_auth("user:u1", |t| shown = Some(t.user_code.clone()), PollOptions::default())
        .await
        .unwrap();

    assert_eq!(shown.as_deref(), Some("WDJB-MJHT"));
    assert_eq!(result.tokens.access_token, "abc");
    assert_eq!(result.identity.login, "octocat");

    let polls = server
        .received_requests()
        .await
        .unwrap()
        .into_iter()
        .filter(|r| r.url.path() == "/login/oauth/access_token")
        .count();
    assert_eq!(polls, 3);
    assert_eq!(clock.sleeps(), vec![Duration::from_secs(5); 3]);

    let credential = engine.status("user:u1").await.unwrap().unwrap();
    assert_eq!(credential.username, "octocat");
    assert_eq!(credential.access_token, "abc");
}

#[tokio::test]
async fn unknown_state_is_rejected_without_exchange() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "access_token": "x" })))
        .expect(0)
        .mount(&server)
        .await;

    let registry = registry(&server, Arc::new(ManualClock::new(epoch()))).await;
    let router = CallbackRouter::new(Arc::new(UserCallbacks(registry)));

    let outcome = router.handle(&callback("C", "S1")).await;
    assert_eq!(outcome, CallbackOutcome::Failure(CallbackFailure::InvalidState));
    assert_eq!(outcome.http_status(), 400);
}

#[tokio::test]
async fn concurrent_users_get_independent_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("code=code-u1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-u1",
            "token_type": "bearer",
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .and(body_string_contains("code=code-u2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "at-u2",
            "token_type": "bearer",
        })))
        .expect(1)
        .mount(&server)
        .await;

    let registry = registry(&server, Arc::new(ManualClock::new(epoch()))).await;
    let manager = registry.per_user("linear").unwrap();

    let (s1, s2) = tokio::join!(
        manager.start_authorization("u1"),
        manager.start_authorization("u2"),
    );
    let (s1, s2) = (s1.unwrap(), s2.unwrap());
    assert_ne!(s1.state, s2.state);

    let router = CallbackRouter::new(Arc::new(UserCallbacks(registry.clone())));
    let (c1, c2) = (callback("code-u1", &s1.state), callback("code-u2", &s2.state));
    let (o1, o2) = tokio::join!(router.handle(&c1), router.handle(&c2));
    assert!(o1.is_success());
    assert!(o2.is_success());

    let t1 = manager.tokens_for_user("u1").await.unwrap().unwrap();
    let t2 = manager.tokens_for_user("u2").await.unwrap().unwrap();
    assert_eq!(t1.access_token, "at-u1");
    assert_eq!(t2.access_token, "at-u2");

    let session = manager.get_session_by_state(&s1.state).await.unwrap().unwrap();
    assert_eq!(session.user_id, "u1");
    assert!(session.consumed);
}

#[tokio::test]
async fn expired_session_reads_as_not_found() {
    let server = MockServer::start().await;
    let clock = Arc::new(ManualClock::new(epoch()));
    let registry = registry(&server, clock.clone()).await;
    let manager = registry.per_user("linear").unwrap();

    let start = manager.start_authorization("u1").await.unwrap();
    assert!(manager.get_session_by_state(&start.state).await.unwrap().is_some());

    clock.advance(Duration::from_secs(601));
    assert!(manager.get_session_by_state(&start.state).await.unwrap().is_none());

    let router = CallbackRouter::new(Arc::new(UserCallbacks(registry.clone())));
    let outcome = router.handle(&callback("late", &start.state)).await;
    assert_eq!(outcome, CallbackOutcome::Failure(CallbackFailure::InvalidState));

    assert_eq!(registry.purge_expired().await.unwrap(), 1);
}

#[tokio::test]
async fn duplicate_callback_redeems_user_state_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access_token": "at-u1" }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let registry = registry(&server, Arc::new(ManualClock::new(epoch()))).await;
    let manager = registry.per_user("linear").unwrap();
    let start = manager.start_authorization("u1").await.unwrap();

    let router = CallbackRouter::new(Arc::new(UserCallbacks(registry.clone())));
    let params = callback("code-u1", &start.state);
    let (a, b) = tokio::join!(router.handle(&params), router.handle(&params));

    assert_eq!(usize::from(a.is_success()) + usize::from(b.is_success()), 1);
    let rejected = if a.is_success() { b } else { a };
    assert_eq!(rejected, CallbackOutcome::Failure(CallbackFailure::InvalidState));
    assert_eq!(
        manager.tokens_for_user("u1").await.unwrap().unwrap().access_token,
        "at-u1"
    );
}

#[tokio::test]
async fn duplicate_callback_redeems_shared_state_once() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access_token": "at-shared" }))
                .set_delay(Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let registry = registry(&server, Arc::new(ManualClock::new(epoch()))).await;
    let start = registry.authorize_shared("linear").await.unwrap();

    let router = CallbackRouter::new(Arc::new(SharedCallbacks(registry.clone())));
    let params = callback("code", &start.state);
    let (a, b) = tokio::join!(router.handle(&params), router.handle(&params));

    assert_eq!(usize::from(a.is_success()) + usize::from(b.is_success()), 1);
    assert_eq!(
        registry.shared_tokens("linear").await.unwrap().unwrap().access_token,
        "at-shared"
    );
}
