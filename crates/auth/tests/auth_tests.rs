use futures_util::future::join_all;
use jsonwebtoken::{encode, EncodingKey, Header};
use portal_session_auth::{
    ApiRequest, AuthBackend, AuthError, AuthOptions, FixedClock, GatewayError, HttpAuthBackend,
    LoginRequest, MemoryPersistence, PersistPolicy, RefreshCoordinator, RequestGateway,
    SessionEvent, SessionStore, User,
};
use reqwest::Client;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const NOW: i64 = 1_700_000_000;

#[derive(Serialize)]
struct Claims<'a> {
    sub: &'a str,
    role: &'a str,
    exp: i64,
}

fn mint(role: &str, exp: i64) -> String {
    encode(
        &Header::default(),
        &Claims {
            sub: "7",
            role,
            exp,
        },
        &EncodingKey::from_secret(b"test-secret"),
    )
    .unwrap()
}

fn setup(
    server: &MockServer,
    access_token: &str,
    refresh_token: Option<&str>,
) -> (Arc<SessionStore>, RequestGateway) {
    let store = Arc::new(SessionStore::with_clock(
        Arc::new(MemoryPersistence::new()),
        PersistPolicy::UserOnly,
        Arc::new(FixedClock::new(NOW)),
    ));
    store
        .set_session(
            User::new("7", "alice").with_roles(["admin"]),
            access_token.to_string(),
            refresh_token.map(str::to_string),
        )
        .unwrap();

    let backend = Arc::new(HttpAuthBackend::new(&server.uri(), Client::new()));
    let coordinator = RefreshCoordinator::new(store.clone(), backend, Duration::from_secs(2));
    let gateway = RequestGateway::new(
        &server.uri(),
        Client::new(),
        store.clone(),
        coordinator,
        AuthOptions::default(),
    );
    (store, gateway)
}

fn refresh_response(access_token: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "accessToken": access_token,
        "refreshToken": "refresh-2",
        "user": {"id": 7, "username": "alice", "roles": ["admin"]}
    }))
}

fn bearer(token: &str) -> String {
    format!("Bearer {}", token)
}

#[tokio::test]
async fn test_login_flat_response() {
    // モックサーバーの起動
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .and(body_json(json!({"username": "bob", "password": "secret"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accessToken": "a",
            "refreshToken": "r",
            "userId": 12,
            "username": "bob",
            "roles": ["employee"]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let backend = HttpAuthBackend::new(&mock_server.uri(), Client::new());
    let response = backend
        .login(&LoginRequest {
            username: "bob".to_string(),
            password: "secret".to_string(),
        })
        .await
        .unwrap();

    assert_eq!(response.access_token, "a");
    let user = response.user().unwrap();
    assert_eq!(user.id, "12");
    assert!(user.roles.contains("employee"));
}

#[tokio::test]
async fn test_login_rejected() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/login"))
        .respond_with(
            ResponseTemplate::new(401).set_body_json(json!({"message": "Bad credentials"})),
        )
        .mount(&mock_server)
        .await;

    let backend = HttpAuthBackend::new(&mock_server.uri(), Client::new());
    let result = backend
        .login(&LoginRequest {
            username: "bob".to_string(),
            password: "wrong".to_string(),
        })
        .await;

    match result {
        Err(AuthError::Rejected { status, message }) => {
            assert_eq!(status.as_u16(), 401);
            assert_eq!(message, "Bad credentials");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_refresh_sends_refresh_token_header() {
    let mock_server = MockServer::start().await;
    let new_token = mint("admin", NOW + 3600);

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .and(header("Refresh-Token", "refresh-1"))
        .respond_with(refresh_response(&new_token))
        .expect(1)
        .mount(&mock_server)
        .await;

    let backend = HttpAuthBackend::new(&mock_server.uri(), Client::new());
    let response = backend.refresh("refresh-1").await.unwrap();

    assert_eq!(response.access_token, new_token);
    assert_eq!(response.refresh_token.as_deref(), Some("refresh-2"));
}

#[tokio::test]
async fn test_logout_and_validate_send_bearer() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/api/auth/logout"))
        .and(header("Authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/auth/validate"))
        .and(header("Authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"valid": false})))
        .expect(1)
        .mount(&mock_server)
        .await;

    let backend = HttpAuthBackend::new(&mock_server.uri(), Client::new());
    backend.logout(Some("tok")).await.unwrap();
    assert!(!backend.validate("tok").await.unwrap().valid);
}

#[tokio::test]
async fn test_server_error_maps_to_server_variant() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/auth/validate"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&mock_server)
        .await;

    let backend = HttpAuthBackend::new(&mock_server.uri(), Client::new());
    match backend.validate("tok").await {
        Err(AuthError::Server { status, message }) => {
            assert_eq!(status.as_u16(), 503);
            assert_eq!(message, "maintenance");
        }
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_gateway_attaches_bearer_and_unwraps_envelope() {
    let mock_server = MockServer::start().await;
    let token = mint("admin", NOW + 3600);

    Mock::given(method("GET"))
        .and(path("/api/departments"))
        .and(header("Authorization", bearer(&token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "statusCode": 200,
            "message": "ok",
            "data": ["sales", "support"]
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (_store, gateway) = setup(&mock_server, &token, Some("refresh-1"));
    let departments: Vec<String> = gateway.get_json("/api/departments").await.unwrap();

    assert_eq!(departments, vec!["sales", "support"]);
}

#[tokio::test]
async fn test_gateway_unauthenticated_request_is_not_recovered() {
    let mock_server = MockServer::start().await;
    let token = mint("admin", NOW + 3600);

    Mock::given(method("GET"))
        .and(path("/api/public/ping"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(refresh_response(&mint("admin", NOW + 7200)))
        .expect(0)
        .mount(&mock_server)
        .await;

    let (store, gateway) = setup(&mock_server, &token, Some("refresh-1"));
    let result = gateway
        .send(ApiRequest::get("/api/public/ping").without_auth())
        .await;

    assert!(matches!(result, Err(GatewayError::Client { status, .. }) if status.as_u16() == 401));
    assert_eq!(store.access_token(), Some(token));
}

#[tokio::test]
async fn test_gateway_refreshes_and_retries_once_on_401() {
    let mock_server = MockServer::start().await;
    let old_token = mint("admin", NOW + 3600);
    let new_token = mint("admin", NOW + 7200);

    Mock::given(method("GET"))
        .and(path("/api/feedback"))
        .and(header("Authorization", bearer(&old_token).as_str()))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/feedback"))
        .and(header("Authorization", bearer(&new_token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .and(header("Refresh-Token", "refresh-1"))
        .respond_with(refresh_response(&new_token))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (store, gateway) = setup(&mock_server, &old_token, Some("refresh-1"));
    let response = gateway.send(ApiRequest::get("/api/feedback")).await.unwrap();

    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(store.access_token(), Some(new_token));
    assert_eq!(store.refresh_token().as_deref(), Some("refresh-2"));
}

#[tokio::test]
async fn test_gateway_treats_invalid_token_code_as_auth_failure() {
    let mock_server = MockServer::start().await;
    let old_token = mint("admin", NOW + 3600);
    let new_token = mint("admin", NOW + 7200);

    Mock::given(method("GET"))
        .and(path("/api/feedback"))
        .and(header("Authorization", bearer(&old_token).as_str()))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": "TOKEN_INVALID",
            "message": "token invalid"
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/feedback"))
        .and(header("Authorization", bearer(&new_token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(refresh_response(&new_token))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (_store, gateway) = setup(&mock_server, &old_token, Some("refresh-1"));
    let response = gateway.send(ApiRequest::get("/api/feedback")).await.unwrap();
    assert_eq!(response.status.as_u16(), 200);
}

#[tokio::test]
async fn test_gateway_gives_up_when_retry_is_still_unauthorized() {
    let mock_server = MockServer::start().await;
    let old_token = mint("admin", NOW + 3600);

    Mock::given(method("GET"))
        .and(path("/api/feedback"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(refresh_response(&mint("admin", NOW + 7200)))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (store, gateway) = setup(&mock_server, &old_token, Some("refresh-1"));
    let result = gateway.send(ApiRequest::get("/api/feedback")).await;

    assert!(matches!(result, Err(GatewayError::Unauthorized)));
    assert!(store.get().is_empty());
}

#[tokio::test]
async fn test_gateway_401_without_refresh_token_clears_session() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/feedback"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&mock_server)
        .await;

    let (store, gateway) = setup(&mock_server, &mint("admin", NOW + 3600), None);
    let result = gateway.send(ApiRequest::get("/api/feedback")).await;

    assert!(matches!(result, Err(GatewayError::Unauthorized)));
    assert!(store.get().is_empty());
}

#[tokio::test]
async fn test_gateway_surfaces_other_errors_without_retry() {
    let mock_server = MockServer::start().await;
    let token = mint("admin", NOW + 3600);

    Mock::given(method("POST"))
        .and(path("/api/feedback"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "message": "title is required",
            "errors": {"title": "required"}
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/reports"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({"message": "boom"})))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(refresh_response(&mint("admin", NOW + 7200)))
        .expect(0)
        .mount(&mock_server)
        .await;

    let (store, gateway) = setup(&mock_server, &token, Some("refresh-1"));

    let request = ApiRequest::post("/api/feedback")
        .json(&json!({"title": ""}))
        .unwrap();
    match gateway.send(request).await {
        Err(GatewayError::Client {
            status,
            message,
            details,
        }) => {
            assert_eq!(status.as_u16(), 422);
            assert_eq!(message, "title is required");
            assert_eq!(details.unwrap()["errors"]["title"], "required");
        }
        other => panic!("unexpected result: {:?}", other),
    }

    match gateway.send(ApiRequest::get("/api/reports")).await {
        Err(GatewayError::Server { status, message }) => {
            assert_eq!(status.as_u16(), 500);
            assert_eq!(message, "boom");
        }
        other => panic!("unexpected result: {:?}", other),
    }

    assert_eq!(store.access_token(), Some(token));
}

#[tokio::test]
async fn test_concurrent_requests_with_expired_token_share_one_refresh() {
    let mock_server = MockServer::start().await;
    let expired = mint("admin", NOW - 5);
    let new_token = mint("admin", NOW + 3600);

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .and(header("Refresh-Token", "refresh-1"))
        .respond_with(refresh_response(&new_token).set_delay(Duration::from_millis(50)))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/feedback"))
        .and(header("Authorization", bearer(&new_token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(5)
        .mount(&mock_server)
        .await;

    let (store, gateway) = setup(&mock_server, &expired, Some("refresh-1"));
    let results = join_all((0..5).map(|_| gateway.send(ApiRequest::get("/api/feedback")))).await;

    for result in results {
        assert_eq!(result.unwrap().status.as_u16(), 200);
    }
    assert_eq!(gateway.coordinator().refresh_count(), 1);
    assert_eq!(store.access_token(), Some(new_token));
}

#[tokio::test]
async fn test_concurrent_requests_with_revoked_refresh_token() {
    let mock_server = MockServer::start().await;
    let expired = mint("admin", NOW - 5);

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(
            ResponseTemplate::new(401)
                .set_body_json(json!({"message": "Invalid refresh token"}))
                .set_delay(Duration::from_millis(50)),
        )
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/feedback"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock_server)
        .await;

    let (store, gateway) = setup(&mock_server, &expired, Some("refresh-1"));
    let mut events = store.subscribe();

    let results = join_all((0..5).map(|_| gateway.send(ApiRequest::get("/api/feedback")))).await;

    for result in results {
        assert!(matches!(result, Err(GatewayError::Unauthorized)));
    }
    assert!(store.get().is_empty());

    let mut cleared = 0;
    while let Ok(event) = events.try_recv() {
        if event == SessionEvent::Cleared {
            cleared += 1;
        }
    }
    assert_eq!(cleared, 1);
}

#[tokio::test]
async fn test_concurrent_401s_with_live_token_share_one_refresh() {
    let mock_server = MockServer::start().await;
    let old_token = mint("admin", NOW + 3600);
    let new_token = mint("admin", NOW + 7200);

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .and(header("Refresh-Token", "refresh-1"))
        .respond_with(refresh_response(&new_token).set_delay(Duration::from_millis(50)))
        .expect(1)
        .mount(&mock_server)
        .await;

    // サーバー側で失効したトークン
    Mock::given(method("GET"))
        .and(path("/api/feedback"))
        .and(header("Authorization", bearer(&old_token).as_str()))
        .respond_with(ResponseTemplate::new(401))
        .expect(5)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/feedback"))
        .and(header("Authorization", bearer(&new_token).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(5)
        .mount(&mock_server)
        .await;

    let (store, gateway) = setup(&mock_server, &old_token, Some("refresh-1"));
    let results = join_all((0..5).map(|_| gateway.send(ApiRequest::get("/api/feedback")))).await;

    for result in results {
        assert_eq!(result.unwrap().status.as_u16(), 200);
    }
    assert_eq!(gateway.coordinator().refresh_count(), 1);
    assert_eq!(store.access_token(), Some(new_token));
    assert_eq!(store.refresh_token().as_deref(), Some("refresh-2"));
}

#[tokio::test]
async fn test_short_lived_tokens_are_not_refreshed_on_every_request() {
    let mock_server = MockServer::start().await;
    let expired = mint("admin", NOW - 5);
    // 有効期限がリフレッシュ窓 (300秒) より短いトークン
    let short_lived = mint("admin", NOW + 240);

    Mock::given(method("POST"))
        .and(path("/api/auth/refresh-token"))
        .respond_with(refresh_response(&short_lived))
        .expect(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/feedback"))
        .and(header("Authorization", bearer(&short_lived).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(5)
        .mount(&mock_server)
        .await;

    let (store, gateway) = setup(&mock_server, &expired, Some("refresh-1"));
    for _ in 0..5 {
        let response = gateway.send(ApiRequest::get("/api/feedback")).await.unwrap();
        assert_eq!(response.status.as_u16(), 200);
    }

    assert_eq!(gateway.coordinator().refresh_count(), 1);
    assert_eq!(store.access_token(), Some(short_lived));
}
