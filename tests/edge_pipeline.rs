//! End-to-end tests: a real edge server in front of mock origins.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdn_edge::config::schema::{
    CacheRuleConfig, DdosConfig, UpstreamGroupConfig, UpstreamHostConfig,
};
use common::*;

#[tokio::test]
async fn cache_miss_then_hit() {
    let (origin, hits) = start_counting_origin(r#"{"a":1}"#).await;
    let mut config = vhost(free_addr(), origin);
    config.cache.push(CacheRuleConfig {
        file_ext: "json".to_string(),
        time: 60,
        ..Default::default()
    });
    let edge = start_edge(config).await;

    let first = edge.get("/foo.json").await;
    assert_eq!(first.status(), 200);
    assert_eq!(first.headers()["x-cache"], "Miss from edge-test");
    assert_eq!(first.headers()["server"], "cdn-edge");
    assert_eq!(first.text().await.unwrap(), r#"{"a":1}"#);

    edge.tasks.wait_idle().await;

    let second = edge.get("/foo.json").await;
    assert_eq!(second.status(), 200);
    assert_eq!(second.headers()["x-cache"], "Hit from edge-test");
    assert_eq!(second.text().await.unwrap(), r#"{"a":1}"#);
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    edge.stop().await;
}

#[tokio::test]
async fn uncached_paths_always_reach_the_origin() {
    let (origin, hits) = start_counting_origin("dynamic").await;
    let edge = start_edge(vhost(free_addr(), origin)).await;

    for _ in 0..3 {
        let resp = edge.get("/api/items").await;
        assert_eq!(resp.status(), 200);
        assert!(resp.headers().get("x-cache").is_none());
    }
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    edge.stop().await;
}

#[tokio::test]
async fn origin_sees_the_client_address() {
    let origin = start_header_echo_origin("x-forwarded-for").await;
    let edge = start_edge(vhost(free_addr(), origin)).await;

    let resp = edge.get("/whoami").await;
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "127.0.0.1");

    edge.stop().await;
}

#[tokio::test]
async fn unknown_domain_is_not_found() {
    let origin = start_origin("never").await;
    let edge = start_edge(vhost(free_addr(), origin)).await;

    let resp = reqwest::Client::new()
        .get(edge.url("/"))
        .header(reqwest::header::HOST, "unknown.example.org")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);

    edge.stop().await;
}

#[tokio::test]
async fn unreachable_origin_is_bad_gateway() {
    let edge = start_edge(vhost(free_addr(), free_addr())).await;

    let resp = edge.get("/").await;
    assert_eq!(resp.status(), 502);

    edge.stop().await;
}

#[tokio::test]
async fn unhealthy_pool_member_is_evicted() {
    let healthy = start_origin("a").await;
    let failing = start_programmable_origin(|| async { (503, "b".to_string()) }).await;

    let mut config = vhost(free_addr(), healthy);
    config.host[0].ups = Some("web".to_string());
    config.ups.push(UpstreamGroupConfig {
        name: "web".to_string(),
        host: [healthy, failing]
            .iter()
            .map(|addr| UpstreamHostConfig {
                ip: addr.ip().to_string(),
                port: addr.port(),
                weight: 1,
            })
            .collect(),
    });
    let edge = start_edge(config).await;

    // The first request creates the pool and starts its prober.
    let _ = edge.get("/").await;
    tokio::time::sleep(Duration::from_millis(1500)).await;

    for _ in 0..6 {
        let resp = edge.get("/").await;
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "a");
    }

    edge.stop().await;
}

#[tokio::test]
async fn origin_concurrency_is_capped() {
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let origin = {
        let in_flight = in_flight.clone();
        let peak = peak.clone();
        start_programmable_origin(move || {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(200)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                (200, "slow".to_string())
            }
        })
        .await
    };

    let mut config = vhost(free_addr(), origin);
    config.limit.max_concurrent = 2;
    config.limit.timeout = 10;
    let edge = start_edge(config).await;

    let responses =
        futures_util::future::join_all((0..5).map(|i| edge.get_owned(format!("/slow/{i}")))).await;
    for resp in responses {
        assert_eq!(resp.status(), 200);
    }
    let peak = peak.load(Ordering::SeqCst);
    assert!((1..=2).contains(&peak), "peak in-flight was {peak}");

    edge.stop().await;
}

fn redirect_target(body: &str) -> String {
    let start = body.find("location = \"").expect("redirect script") + "location = \"".len();
    let end = body[start..].find('"').expect("closing quote") + start;
    body[start..end].to_string()
}

#[tokio::test]
async fn flood_is_challenged_until_the_token_comes_back() {
    let (origin, hits) = start_counting_origin("content").await;
    let mut config = vhost(free_addr(), origin);
    config.ddos = DdosConfig {
        request: 3,
        rtime: 1,
        stime: 60,
        mode: 10,
        ..Default::default()
    };
    let edge = start_edge(config).await;

    for _ in 0..5 {
        assert_eq!(edge.get("/page").await.text().await.unwrap(), "content");
    }
    let served = hits.load(Ordering::SeqCst);

    // Closing the window over the threshold switches challenging on.
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let challenge = edge.get("/page").await;
    assert_eq!(challenge.status(), 200);
    let body = challenge.text().await.unwrap();
    assert!(body.contains("_l1O0="), "{body}");
    assert_eq!(hits.load(Ordering::SeqCst), served);

    let target = redirect_target(&body);
    let passed = edge.get(&target).await;
    assert_eq!(passed.status(), 200);
    assert_eq!(passed.text().await.unwrap(), "content");

    // Once passed, the client is not challenged again during the hold.
    assert_eq!(edge.get("/page").await.text().await.unwrap(), "content");

    edge.stop().await;
}

#[tokio::test]
async fn text_mode_challenge_blocks_content() {
    let origin = start_origin("content").await;
    let mut config = vhost(free_addr(), origin);
    config.ddos = DdosConfig {
        request: 2,
        rtime: 1,
        stime: 60,
        mode: 2,
        ..Default::default()
    };
    let edge = start_edge(config).await;

    for _ in 0..3 {
        let _ = edge.get("/").await;
    }
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let body = edge.get("/").await.text().await.unwrap();
    assert_eq!(body, "the site was been attacked!");

    edge.stop().await;
}
