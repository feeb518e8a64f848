use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use bulu::config::{Config, DomainConfig, Node, RateLimit};
use bulu::engine::Engine;
use bulu::middleware::Claims;
use bulu::proxy::GatewayState;
use bulu::ring::{Bucket, HashRing};
use bulu::server::Server;
use bulu::{Error, SlidingWindow};
use http_body_util::BodyExt;
use jsonwebtoken::{encode, EncodingKey, Header};
use tokio::net::TcpListener;
use tower::ServiceExt;

fn node(url: &str, weight: u32) -> Node {
    Node {
        name: url.to_string(),
        url: url.to_string(),
        weight,
    }
}

fn flat_config(urls: &[String]) -> Config {
    Config {
        host: ":0".to_string(),
        pem_path: String::new(),
        key_path: String::new(),
        proto: "http".to_string(),
        jwt_secret: "none".to_string(),
        domains: Vec::new(),
        nodes: urls.iter().map(|u| node(u, 100)).collect(),
        rate_limit: RateLimit::default(),
    }
}

/// A TCP socket that accepts connections, enough to pass health probes.
async fn alive_backend() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    (listener, url)
}

/// An address that refuses connections.
async fn dead_backend() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    drop(listener);
    url
}

/// A real HTTP backend answering every request with `body`.
async fn http_backend(body: &'static str) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    let app = axum::Router::new().fallback(move || async move { body });
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    url
}

// --- hash ring ---------------------------------------------------------

#[test]
fn equal_weights_converge_to_equal_shares() {
    let labels = ["http://10.0.0.1/", "http://10.0.0.2/", "http://10.0.0.3/"];
    let buckets = labels.iter().map(|l| Bucket::new(*l, 100)).collect();
    let ring = HashRing::build(buckets).unwrap();

    let mut counts: HashMap<String, usize> = HashMap::new();
    let samples = 100_000;
    for i in 0..samples {
        let bucket = ring.hash(format!("client-{i}").as_bytes()).unwrap();
        *counts.entry(bucket.label.clone()).or_default() += 1;
    }

    for label in labels {
        let share = counts[label] as f64 / samples as f64;
        assert!(
            (0.25..0.42).contains(&share),
            "share for {label} out of range: {share}"
        );
    }
}

#[test]
fn removing_a_bucket_remaps_only_its_own_keys() {
    let full: Vec<Bucket> = ["http://10.0.0.1/", "http://10.0.0.2/", "http://10.0.0.3/"]
        .iter()
        .map(|l| Bucket::new(*l, 100))
        .collect();
    let reduced: Vec<Bucket> = full[..2].to_vec();

    let before = HashRing::build(full).unwrap();
    let after = HashRing::build(reduced).unwrap();

    let samples = 10_000;
    let mut moved = 0;
    for i in 0..samples {
        let key = format!("client-{i}");
        let old = &before.hash(key.as_bytes()).unwrap().label;
        let new = &after.hash(key.as_bytes()).unwrap().label;
        if old == "http://10.0.0.3/" {
            moved += 1;
        } else {
            // Keys owned by surviving buckets must not move at all.
            assert_eq!(old, new, "key {key} moved off a surviving bucket");
        }
    }

    let fraction = moved as f64 / samples as f64;
    assert!(
        (0.22..0.45).contains(&fraction),
        "remapped fraction {fraction} not proportional to removed weight share"
    );
}

// --- rate limiter ------------------------------------------------------

#[tokio::test]
async fn limiter_enforces_limit_and_recovers_in_real_time() {
    let limiter =
        SlidingWindow::new(Duration::from_millis(200), 3, bulu::algorithms::local_window)
            .unwrap();
    let mut granted = 0;
    for _ in 0..4 {
        if limiter.grant() {
            granted += 1;
        }
    }
    assert_eq!(granted, 3);

    // After the window (and its weighted tail) fully elapses, traffic flows again.
    tokio::time::sleep(Duration::from_millis(450)).await;
    assert!(limiter.grant());
}

// --- engine ------------------------------------------------------------

#[tokio::test]
async fn init_excludes_unreachable_nodes() {
    let (_a, alive_a) = alive_backend().await;
    let (_b, alive_b) = alive_backend().await;
    let dead = dead_backend().await;

    let engine = Engine::new();
    engine
        .init_nodes(&flat_config(&[alive_a.clone(), alive_b.clone(), dead.clone()]))
        .await
        .unwrap();

    for i in 0..50 {
        let target = engine.route("*", format!("client-{i}").as_bytes()).unwrap();
        assert_ne!(target, dead);
        assert!(target == alive_a || target == alive_b);
    }
}

#[tokio::test]
async fn routing_is_sticky_per_key() {
    let (_a, alive_a) = alive_backend().await;
    let (_b, alive_b) = alive_backend().await;

    let engine = Engine::new();
    engine
        .init_nodes(&flat_config(&[alive_a, alive_b]))
        .await
        .unwrap();

    let first = engine.route("*", b"10.1.2.3").unwrap();
    for _ in 0..20 {
        assert_eq!(engine.route("*", b"10.1.2.3").unwrap(), first);
    }
}

#[tokio::test]
async fn init_fails_wholesale_when_a_domain_has_no_reachable_nodes() {
    let (_a, alive) = alive_backend().await;
    let dead = dead_backend().await;

    let engine = Engine::new();
    engine.init_nodes(&flat_config(&[alive.clone()])).await.unwrap();

    // A reload where one domain is fully dead must fail and keep the
    // previous table.
    let mut bad = flat_config(&[alive.clone()]);
    bad.domains = vec![DomainConfig {
        domain: "dead.test".to_string(),
        nodes: vec![node(&dead, 100)],
    }];
    let result = engine.init_nodes(&bad).await;
    assert!(matches!(result, Err(Error::DomainUnavailable(_))));

    // Previous state still routes, and the failed domain was never installed.
    assert_eq!(engine.route("*", b"client").unwrap(), alive);
}

#[tokio::test]
async fn reported_failure_excludes_the_backend_until_reprobed() {
    let (listener_a, alive_a) = alive_backend().await;
    let (_b, alive_b) = alive_backend().await;

    let engine = Engine::new();
    engine
        .init_nodes(&flat_config(&[alive_a.clone(), alive_b.clone()]))
        .await
        .unwrap();

    // Kill A, then report the refusal the proxy would observe.
    let addr_a = listener_a.local_addr().unwrap().to_string();
    drop(listener_a);
    engine.report_failure("*", &addr_a).await;

    for i in 0..50 {
        let target = engine.route("*", format!("client-{i}").as_bytes()).unwrap();
        assert_eq!(target, alive_b, "routed to excluded backend");
    }
}

#[tokio::test]
async fn domain_degrades_when_no_backend_survives_a_rebuild() {
    let (listener_a, alive_a) = alive_backend().await;
    let (listener_b, alive_b) = alive_backend().await;

    let engine = Engine::new();
    engine
        .init_nodes(&flat_config(&[alive_a, alive_b]))
        .await
        .unwrap();

    let addr_a = listener_a.local_addr().unwrap().to_string();
    drop(listener_a);
    drop(listener_b);
    engine.report_failure("*", &addr_a).await;

    assert!(matches!(
        engine.route("*", b"client"),
        Err(Error::NoServiceAlive)
    ));
}

#[tokio::test]
async fn unknown_domain_without_wildcard_is_not_matched() {
    let (_a, alive) = alive_backend().await;
    let mut config = flat_config(&[]);
    config.nodes = Vec::new();
    config.domains = vec![DomainConfig {
        domain: "api.test".to_string(),
        nodes: vec![node(&alive, 100)],
    }];

    let engine = Engine::new();
    engine.init_nodes(&config).await.unwrap();

    assert!(engine.route("api.test", b"client").is_ok());
    assert!(matches!(
        engine.route("other.test", b"client"),
        Err(Error::DomainNotMatched)
    ));
}

#[tokio::test]
async fn concurrent_routing_during_reload_sees_old_or_new_table() {
    let (_a, alive_a) = alive_backend().await;
    let (_b, alive_b) = alive_backend().await;

    let engine = Arc::new(Engine::new());
    engine.init_nodes(&flat_config(&[alive_a.clone()])).await.unwrap();

    let router = {
        let engine = engine.clone();
        let valid = [alive_a.clone(), alive_b.clone()];
        tokio::spawn(async move {
            for i in 0..2_000 {
                let target = engine.route("*", format!("client-{i}").as_bytes()).unwrap();
                assert!(valid.contains(&target), "unexpected target {target}");
            }
        })
    };

    for _ in 0..10 {
        engine.init_nodes(&flat_config(&[alive_b.clone()])).await.unwrap();
        engine.init_nodes(&flat_config(&[alive_a.clone()])).await.unwrap();
    }
    router.await.unwrap();
}

// --- gateway surface ---------------------------------------------------

fn bearer_token(secret: &str, exp_offset_secs: i64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let claims = Claims {
        sub: "tester".to_string(),
        exp: (now + exp_offset_secs).max(0) as u64,
        iat: now as u64,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .unwrap()
}

async fn gateway_router(urls: &[String], jwt_secret: &str, rate_limit: i64) -> axum::Router {
    let mut config = flat_config(urls);
    config.rate_limit.rate_limit = rate_limit;
    let engine = Arc::new(Engine::new());
    engine.init_nodes(&config).await.unwrap();
    Server::router(GatewayState::new(engine, jwt_secret.to_string()))
}

#[tokio::test]
async fn gate_rejects_missing_token() {
    let backend = http_backend("hello").await;
    let app = gateway_router(&[backend], "s3cret", 1_000).await;

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Bearer realm=Restricted"
    );
}

#[tokio::test]
async fn gate_forwards_a_validly_signed_token() {
    let backend = http_backend("hello").await;
    let app = gateway_router(&[backend], "s3cret", 1_000).await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", bearer_token("s3cret", 3_600)),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"hello");
}

#[tokio::test]
async fn gate_rejects_expired_and_missigned_tokens() {
    let backend = http_backend("hello").await;
    let app = gateway_router(&[backend], "s3cret", 1_000).await;

    let expired = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", bearer_token("s3cret", -3_600)),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(expired.status(), StatusCode::UNAUTHORIZED);

    let missigned = app
        .oneshot(
            Request::builder()
                .uri("/")
                .header(
                    header::AUTHORIZATION,
                    format!("Bearer {}", bearer_token("wrong-secret", 3_600)),
                )
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(missigned.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn disabled_gate_forwards_without_credentials() {
    let backend = http_backend("open").await;
    let app = gateway_router(&[backend], "none", 1_000).await;

    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"open");
}

#[tokio::test]
async fn degraded_domain_synthesizes_the_contract_body() {
    let (listener, url) = alive_backend().await;
    let mut config = flat_config(&[url]);
    config.rate_limit.rate_limit = 1_000;
    let engine = Arc::new(Engine::new());
    engine.init_nodes(&config).await.unwrap();

    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    engine.report_failure("*", &addr).await;

    let app = Server::router(GatewayState::new(engine, "none".to_string()));
    let response = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();

    // Deliberately a success status so upstream health checks stay green.
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], br#"{"ok":false,"errMsg":"Bulu no service alive"}"#);
}

#[tokio::test]
async fn admission_limiter_rejects_excess_requests() {
    let backend = http_backend("ok").await;
    let app = gateway_router(&[backend], "none", 1).await;

    let first = app
        .clone()
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app
        .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn proxy_fails_over_to_a_live_backend_on_refused_connection() {
    let backend = http_backend("survivor").await;
    let (doomed_listener, doomed) = alive_backend().await;

    let engine = Arc::new(Engine::new());
    engine
        .init_nodes(&flat_config(&[backend.clone(), doomed.clone()]))
        .await
        .unwrap();
    drop(doomed_listener);

    let app = Server::router(GatewayState::new(engine, "none".to_string()));

    // Whatever bucket each key lands on, every request must come back from
    // the surviving backend after at most one failover.
    for i in 0..10 {
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header("x-forwarded-for", format!("10.0.0.{i}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"survivor");
    }
}

#[tokio::test]
async fn proxy_preserves_method_headers_and_body() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/", listener.local_addr().unwrap());
    let echo = axum::Router::new().fallback(
        |request: Request<Body>| async move {
            let method = request.method().clone();
            let header = request
                .headers()
                .get("x-probe")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            let body = request.into_body().collect().await.unwrap().to_bytes();
            format!("{method} {header} {}", String::from_utf8_lossy(&body))
        },
    );
    tokio::spawn(async move {
        axum::serve(listener, echo).await.unwrap();
    });

    let app = gateway_router(&[url], "none", 1_000).await;
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/echo")
                .header("x-probe", "v1")
                .body(Body::from("payload"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"POST v1 payload");
}

#[tokio::test]
async fn per_domain_limiters_are_independent() {
    let (_a, alive_a) = alive_backend().await;
    let (_b, alive_b) = alive_backend().await;

    let mut config = flat_config(&[]);
    config.nodes = Vec::new();
    config.rate_limit = RateLimit {
        rate_time: Duration::from_secs(1),
        rate_limit: 1,
    };
    config.domains = vec![
        DomainConfig {
            domain: "a.test".to_string(),
            nodes: vec![node(&alive_a, 100)],
        },
        DomainConfig {
            domain: "b.test".to_string(),
            nodes: vec![node(&alive_b, 100)],
        },
    ];

    let engine = Engine::new();
    engine.init_nodes(&config).await.unwrap();

    // Exhausting a.test's quota leaves b.test untouched.
    assert!(engine.admit("a.test").unwrap());
    assert!(!engine.admit("a.test").unwrap());
    assert!(engine.admit("b.test").unwrap());
}
