mod common;

use std::sync::Arc;
use std::time::Duration;

use arbor_client::{
    CacheConfig, Client, ClientConfig, ClientError, Json, Payload, PushEvent, QueryKind,
};
use arbor_common::wire::WireFormat;
use arbor_common::{Op, Request};
use bytes::Bytes;
use common::{test_config, wait_until, KvStore, MockServer, Reply};
use serde::{Deserialize, Serialize};

fn cached(addr: &str) -> ClientConfig {
    ClientConfig {
        cache: CacheConfig {
            enabled: true,
            stats: true,
            ..CacheConfig::default()
        },
        ..test_config(addr)
    }
}

async fn kv_server() -> (MockServer, Arc<KvStore>) {
    common::init_tracing();
    let store = Arc::new(KvStore::default());
    let server = MockServer::start(store.handler()).await;
    (server, store)
}

#[tokio::test]
async fn safe_set_then_get_is_served_from_cache() {
    let (server, _store) = kv_server().await;
    let client = Client::connect(cached(&server.addr)).await.expect("client");
    let items = client.table::<String>("items").await.expect("table");

    assert_eq!(server.count(Op::RegisterSchema), 1);
    assert_eq!(server.count(Op::Subscribe), 1);

    items.set("sku-42", "lamp".to_string()).await.expect("set");
    assert_eq!(items.get("sku-42").await.unwrap().as_deref(), Some("lamp"));
    assert_eq!(server.count(Op::Get), 0);

    let stats = items.cache_stats().expect("stats enabled");
    assert_eq!(stats.hits, 1);
    client.stop().await;
}

#[tokio::test]
async fn explicit_invalidate_forces_a_fetch() {
    let (server, _store) = kv_server().await;
    let client = Client::connect(cached(&server.addr)).await.expect("client");
    let items = client.table::<String>("items").await.expect("table");

    items.set("k", "v".to_string()).await.unwrap();
    items.invalidate("k");
    assert_eq!(items.get("k").await.unwrap().as_deref(), Some("v"));
    assert_eq!(server.count(Op::Get), 1);

    // The fetched value is cached again.
    items.get("k").await.unwrap();
    assert_eq!(server.count(Op::Get), 1);
    client.stop().await;
}

#[tokio::test]
async fn pushed_invalidation_forces_a_fetch() {
    let (server, store) = kv_server().await;
    let client = Client::connect(cached(&server.addr)).await.expect("client");
    let items = client.table::<String>("items").await.expect("table");
    server.wait_for_sessions(1).await;

    items.set("k", "old".to_string()).await.unwrap();
    store.put(items.target(), "k", "new".to_string().to_payload().unwrap());

    server.push(&PushEvent::new("default", "items", "k"));
    let cache = items.cache().expect("cache").clone();
    assert!(wait_until(Duration::from_secs(2), || cache.is_empty()).await);

    assert_eq!(items.get("k").await.unwrap().as_deref(), Some("new"));
    assert_eq!(server.count(Op::Get), 1);
    assert_eq!(client.metrics().pushes_total, 1);
    client.stop().await;
}

#[tokio::test]
async fn table_wide_push_and_foreign_db_push() {
    let (server, _store) = kv_server().await;
    let client = Client::connect(cached(&server.addr)).await.expect("client");
    let items = client.table::<i64>("items").await.expect("table");
    server.wait_for_sessions(1).await;

    items.set("a", 1).await.unwrap();
    items.set("b", 2).await.unwrap();
    let cache = items.cache().expect("cache").clone();

    server.push(&PushEvent::new("elsewhere", "items", ""));
    server.push(&PushEvent::new("default", "items", ""));
    assert!(wait_until(Duration::from_secs(2), || client.metrics().pushes_total == 2).await);
    assert!(wait_until(Duration::from_secs(2), || cache.is_empty()).await);
    client.stop().await;
}

#[tokio::test]
async fn missing_values_are_not_cached() {
    let (server, _store) = kv_server().await;
    let client = Client::connect(cached(&server.addr)).await.expect("client");
    let items = client.table::<String>("items").await.expect("table");

    assert_eq!(items.get("ghost").await.unwrap(), None);
    assert_eq!(items.get("ghost").await.unwrap(), None);
    assert_eq!(server.count(Op::Get), 2);
    client.stop().await;
}

#[tokio::test]
async fn failed_write_drops_the_optimistic_value() {
    let (server, store) = kv_server().await;
    store.fail_key("bad");
    let client = Client::connect(cached(&server.addr)).await.expect("client");
    let items = client.table::<String>("items").await.expect("table");

    let err = items.set("bad", "v".to_string()).await.unwrap_err();
    assert!(matches!(err, ClientError::Application { status: 500, .. }));
    assert!(items.cache().unwrap().get("bad").is_none());
    client.stop().await;
}

/// Store-backed server whose GET and MGET answers arrive late.
async fn slow_read_server(delay: Duration) -> (MockServer, Arc<KvStore>) {
    common::init_tracing();
    let store = Arc::new(KvStore::default());
    let backing = Arc::clone(&store);
    let server = MockServer::start(Arc::new(move |req: &Request| {
        let response = backing.apply(req);
        match req.op {
            Op::Get | Op::Mget => Reply::After(delay, response),
            _ => Reply::Respond(response),
        }
    }))
    .await;
    (server, store)
}

#[tokio::test]
async fn delete_during_a_fetch_keeps_the_old_value_out_of_the_cache() {
    let (server, store) = slow_read_server(Duration::from_millis(200)).await;
    let client = Client::connect(cached(&server.addr)).await.expect("client");
    let items = client.table::<String>("items").await.expect("table");
    store.put(items.target(), "k", "old".to_string().to_payload().unwrap());

    let reader = items.clone();
    let fetch = tokio::spawn(async move { reader.get("k").await });
    assert!(wait_until(Duration::from_secs(1), || server.count(Op::Get) == 1).await);
    items.delete("k").await.expect("delete");

    // The racing read still answers its caller with what it saw.
    assert_eq!(fetch.await.unwrap().unwrap().as_deref(), Some("old"));
    assert!(items.cache().unwrap().get("k").is_none());
    assert_eq!(items.get("k").await.unwrap(), None);
    assert_eq!(server.count(Op::Get), 2);
    client.stop().await;
}

#[tokio::test]
async fn push_during_get_many_keeps_the_old_values_out_of_the_cache() {
    let (server, store) = slow_read_server(Duration::from_millis(200)).await;
    let client = Client::connect(cached(&server.addr)).await.expect("client");
    let items = client.table::<String>("items").await.expect("table");
    server.wait_for_sessions(1).await;
    for key in ["a", "b"] {
        store.put(items.target(), key, "old".to_string().to_payload().unwrap());
    }

    let reader = items.clone();
    let fetch = tokio::spawn(async move { reader.get_many(&["a", "b"]).await });
    assert!(wait_until(Duration::from_secs(1), || server.count(Op::Mget) == 1).await);
    server.push(&PushEvent::new("default", "items", ""));
    assert!(wait_until(Duration::from_secs(1), || client.metrics().pushes_total == 1).await);

    assert_eq!(fetch.await.unwrap().unwrap().len(), 2);
    assert!(items.cache().unwrap().is_empty());
    client.stop().await;
}

#[tokio::test]
async fn empty_values_are_never_cached() {
    let (server, _store) = kv_server().await;
    let client = Client::connect(cached(&server.addr)).await.expect("client");
    let blobs = client.table::<Bytes>("blobs").await.expect("table");

    blobs.set("k", Bytes::from_static(b"full")).await.unwrap();
    blobs.set("k", Bytes::new()).await.unwrap();
    assert!(blobs.cache().unwrap().get("k").is_none());

    // Cache and server agree that the key reads as missing.
    assert_eq!(blobs.get("k").await.unwrap(), None);
    assert_eq!(server.count(Op::Get), 1);

    blobs
        .set_with_ttl("t", Bytes::new(), Duration::from_secs(30))
        .await
        .unwrap();
    assert!(blobs.cache().unwrap().is_empty());
    client.stop().await;
}

#[tokio::test]
async fn delete_invalidates_and_removes() {
    let (server, store) = kv_server().await;
    let client = Client::connect(cached(&server.addr)).await.expect("client");
    let items = client.table::<bool>("flags").await.expect("table");

    items.set("on", true).await.unwrap();
    assert!(items.exists("on").await.unwrap());
    items.delete("on").await.unwrap();

    assert!(store.value(items.target(), "on").is_none());
    assert!(!items.exists("on").await.unwrap());
    assert_eq!(items.get("on").await.unwrap(), None);
    client.stop().await;
}

#[tokio::test]
async fn get_many_fetches_only_misses_in_one_call() {
    let (server, _store) = kv_server().await;
    let client = Client::connect(cached(&server.addr)).await.expect("client");
    let items = client.table::<String>("items").await.expect("table");

    for key in ["a", "b", "c"] {
        items.set(key, key.to_uppercase()).await.unwrap();
    }
    items.invalidate("b");
    items.invalidate("c");

    let found = items.get_many(&["a", "b", "c", "missing"]).await.unwrap();
    assert_eq!(found.len(), 3);
    assert_eq!(found["b"], "B");
    assert_eq!(server.count(Op::Mget), 1);

    let mget = server
        .requests()
        .into_iter()
        .find(|req| req.op == Op::Mget)
        .unwrap();
    let asked = arbor_common::wire::decode_mget_keys(mget.payload).unwrap();
    assert_eq!(asked, vec!["b", "c", "missing"]);

    // Everything present is cached now.
    items.get_many(&["a", "b", "c"]).await.unwrap();
    assert_eq!(server.count(Op::Mget), 1);
    client.stop().await;
}

#[tokio::test]
async fn batched_gets_share_one_mget() {
    let (server, _store) = kv_server().await;
    let client = Client::connect(test_config(&server.addr)).await.expect("client");
    let items = client.table::<String>("items").await.expect("table");
    items.set("x", "1".into()).await.unwrap();
    items.set("y", "2".into()).await.unwrap();

    let batched = items.with_batch(Duration::from_millis(20));
    let (x, y, z) = tokio::join!(batched.get("x"), batched.get("y"), batched.get("z"));
    assert_eq!(x.unwrap().as_deref(), Some("1"));
    assert_eq!(y.unwrap().as_deref(), Some("2"));
    assert_eq!(z.unwrap(), None);
    assert_eq!(server.count(Op::Mget), 1);
    assert_eq!(server.count(Op::Get), 0);

    // A lone key goes out as a plain GET.
    assert_eq!(batched.get("x").await.unwrap().as_deref(), Some("1"));
    assert_eq!(server.count(Op::Get), 1);
    client.stop().await;
}

#[tokio::test]
async fn ttl_writes_are_prefixed() {
    let (server, store) = kv_server().await;
    let client = Client::connect(test_config(&server.addr)).await.expect("client");
    let items = client.table::<String>("items").await.expect("table");

    items
        .set_with_ttl("session", "token".into(), Duration::from_secs(30))
        .await
        .unwrap();

    let set = server
        .requests()
        .into_iter()
        .find(|req| req.op == Op::Set)
        .unwrap();
    assert!(set.flags.contains(arbor_common::Flags::TTL_PREFIXED));
    assert!(set.flags.contains(arbor_common::Flags::SAFE));
    let (expires_at_ms, _) = arbor_common::wire::split_ttl_payload(set.payload).unwrap();
    assert!(expires_at_ms > 0);
    assert_eq!(
        String::from_payload(store.value(items.target(), "session").unwrap()).unwrap(),
        "token"
    );
    client.stop().await;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Product {
    name: String,
    price: u64,
}

#[tokio::test]
async fn json_values_and_queries() {
    let (server, _store) = kv_server().await;
    let client = Client::connect(cached(&server.addr)).await.expect("client");
    let products = client.table::<Json<Product>>("products").await.expect("table");

    let lamp = Product {
        name: "lamp".into(),
        price: 1200,
    };
    products.set("p1", Json(lamp.clone())).await.unwrap();
    products.invalidate("p1");
    assert_eq!(products.get("p1").await.unwrap().map(Json::into_inner), Some(lamp));

    assert_eq!(products.count(Bytes::from_static(b"{}")).await.unwrap(), 1);

    // Unsupported by the mock: surfaces as an application error and leaves the cache alone.
    let err = products
        .query(QueryKind::Delete, Bytes::from_static(b"{}"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Application { status: 400, .. }));
    assert!(!products.cache().unwrap().is_empty());
    client.stop().await;
}

#[tokio::test]
async fn tables_register_once_and_share_caches() {
    let (server, _store) = kv_server().await;
    let client = Client::connect(cached(&server.addr)).await.expect("client");
    let first = client.table::<String>("items").await.expect("table");
    let second = client.table::<String>("items").await.expect("table");

    assert_eq!(server.count(Op::RegisterSchema), 1);
    assert_eq!(first.target(), second.target());

    first.set("k", "v".into()).await.unwrap();
    assert_eq!(second.get("k").await.unwrap().as_deref(), Some("v"));
    assert_eq!(server.count(Op::Get), 0);
    client.stop().await;
}

#[tokio::test]
async fn legacy_format_skips_registration() {
    common::init_tracing();
    let store = Arc::new(KvStore::default());
    let server = MockServer::start_with(store.handler(), None, WireFormat::Legacy).await;
    let client = Client::connect(ClientConfig {
        wire_format: WireFormat::Legacy,
        ..test_config(&server.addr)
    })
    .await
    .expect("client");
    let items = client.table::<i32>("items").await.expect("table");
    items.set("n", 7).await.unwrap();
    assert_eq!(items.get("n").await.unwrap(), Some(7));
    assert_eq!(server.count(Op::RegisterSchema), 0);
    assert_eq!(items.target(), &arbor_common::TableRef::names("default", "items"));
    client.stop().await;
}

#[tokio::test]
async fn hmac_secret_is_required_when_server_asks() {
    common::init_tracing();
    let store = Arc::new(KvStore::default());
    let server =
        MockServer::start_with(store.handler(), Some("s3cret"), WireFormat::Compact).await;

    let err = Client::connect(test_config(&server.addr)).await.unwrap_err();
    assert!(matches!(err, ClientError::Auth(_)));

    let client = Client::connect(ClientConfig {
        secret: Some("s3cret".into()),
        ..test_config(&server.addr)
    })
    .await
    .expect("authenticated client");
    let items = client.table::<String>("items").await.expect("table");
    items.set("k", "v".into()).await.unwrap();
    assert_eq!(items.get("k").await.unwrap().as_deref(), Some("v"));
    client.stop().await;
}
