use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use apiproxy::cache::{Cache, MemoryCache};
use apiproxy::http::{Method, Request, Response, StatusCode};
use apiproxy::transport::{
    CachingTransport, RoundTrip, TransportError, X_CACHEABLE, X_FROM_CACHE, transport_fn,
};
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use url::Url;

/// Origin double that counts calls and answers with a fixed response.
#[derive(Clone)]
struct Origin {
    calls: Arc<AtomicUsize>,
    status: StatusCode,
    body: &'static str,
}

impl Origin {
    fn new(status: StatusCode, body: &'static str) -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            status,
            body,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl RoundTrip for Origin {
    fn round_trip(
        &self,
        request: Request,
    ) -> apiproxy::transport::BoxFuture<'_, Result<Response, TransportError>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let response = Response::new(self.status)
            .header("Content-Type", "text/plain")
            .header("Set-Cookie", "a=1")
            .header("Set-Cookie", "b=2");
        // Answers to HEAD advertise the length but carry no body.
        let response = if request.method() == &Method::Head {
            response.header("Content-Length", self.body.len().to_string())
        } else {
            response.body(self.body)
        };
        let response = response.with_request(request);
        Box::pin(async move { Ok(response) })
    }
}

fn memory_cache() -> Arc<MemoryCache> {
    Arc::new(MemoryCache::new(Duration::from_secs(60)).unwrap())
}

fn caching(origin: &Origin, cache: Arc<MemoryCache>) -> CachingTransport {
    CachingTransport::new(cache).with_transport(Arc::new(origin.clone()))
}

fn request(method: Method, url: &str) -> Request {
    Request::new(method, Url::parse(url).unwrap())
}

#[tokio::test]
async fn second_get_is_served_from_cache() {
    let origin = Origin::new(StatusCode::OK, "hello");
    let transport = caching(&origin, memory_cache());

    let first = transport
        .round_trip(request(Method::Get, "http://x/a"))
        .await
        .unwrap();
    assert_eq!(first.bytes().as_ref(), b"hello");
    assert_eq!(first.headers().get(X_FROM_CACHE), None);
    assert_eq!(first.headers().get(X_CACHEABLE), Some("1"));
    assert_eq!(origin.calls(), 1);

    let second = transport
        .round_trip(request(Method::Get, "http://x/a"))
        .await
        .unwrap();
    assert_eq!(second.bytes().as_ref(), b"hello");
    assert_eq!(second.headers().get(X_FROM_CACHE), Some("1"));
    assert_eq!(origin.calls(), 1);

    let cookies: Vec<_> = second.headers().get_all("set-cookie").collect();
    assert_eq!(cookies, vec!["a=1", "b=2"]);
    assert_eq!(second.request().unwrap().url().as_str(), "http://x/a");
}

#[tokio::test]
async fn cached_response_survives_a_failing_origin() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let flaky = transport_fn(move |request: Request| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        async move {
            if attempt > 0 {
                return Err(TransportError::Io(std::io::Error::other("origin down")));
            }
            Ok(Response::new(StatusCode::OK)
                .body("first and only")
                .with_request(request))
        }
    });
    let transport = CachingTransport::new(memory_cache()).with_transport(Arc::new(flaky));

    for _ in 0..2 {
        let response = transport
            .round_trip(request(Method::Get, "http://x/flaky"))
            .await
            .unwrap();
        assert_eq!(response.bytes().as_ref(), b"first and only");
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn non_get_methods_bypass_the_cache() {
    let origin = Origin::new(StatusCode::OK, "done");
    let cache = memory_cache();
    let transport = caching(&origin, Arc::clone(&cache));

    for method in [Method::Post, Method::Put, Method::Delete, Method::Patch] {
        let response = transport
            .round_trip(request(method.clone(), "http://x/a"))
            .await
            .unwrap();
        assert_eq!(response.headers().get(X_CACHEABLE), None);
        transport
            .round_trip(request(method, "http://x/a"))
            .await
            .unwrap();
    }

    assert_eq!(origin.calls(), 8);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn range_requests_are_never_looked_up_or_stored() {
    let origin = Origin::new(StatusCode::OK, "full body");
    let cache = memory_cache();
    cache.set(
        "http://x/big",
        Bytes::from_static(b"HTTP/1.1 200 OK\r\nContent-Length: 6\r\n\r\ncached"),
    );
    let transport = caching(&origin, Arc::clone(&cache));

    for _ in 0..2 {
        let ranged = request(Method::Get, "http://x/big").header("Range", "bytes=0-10");
        let response = transport.round_trip(ranged).await.unwrap();
        assert_eq!(response.bytes().as_ref(), b"full body");
        assert_eq!(response.headers().get(X_FROM_CACHE), None);
    }

    assert_eq!(origin.calls(), 2);
    assert_eq!(cache.len(), 1, "the pre-existing entry is untouched");
}

#[tokio::test]
async fn not_modified_is_passed_through_and_not_cached() {
    let origin = Origin::new(StatusCode::NOT_MODIFIED, "");
    let cache = memory_cache();
    let transport = caching(&origin, Arc::clone(&cache));

    for _ in 0..2 {
        let response = transport
            .round_trip(request(Method::Get, "http://x/etag"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_MODIFIED);
        assert_eq!(response.headers().get(X_FROM_CACHE), None);
        assert_eq!(response.headers().get(X_CACHEABLE), None);
    }

    assert_eq!(origin.calls(), 2);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn forward_errors_propagate_unchanged() {
    let failing = transport_fn(|_request: Request| async {
        Err::<Response, _>(TransportError::UnsupportedScheme("gopher".to_owned()))
    });
    let cache = memory_cache();
    let transport = CachingTransport::new(cache.clone()).with_transport(Arc::new(failing));

    let result = transport
        .round_trip(request(Method::Get, "http://x/a"))
        .await;

    assert!(matches!(result, Err(TransportError::UnsupportedScheme(s)) if s == "gopher"));
    assert!(cache.is_empty());
}

#[tokio::test]
async fn if_none_match_is_stripped_before_forwarding() {
    let saw_validator = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&saw_validator);
    let origin = transport_fn(move |request: Request| {
        if request.headers().contains("if-none-match") {
            flag.fetch_add(1, Ordering::SeqCst);
        }
        async move {
            Ok::<_, TransportError>(Response::new(StatusCode::OK).with_request(request))
        }
    });
    let transport = CachingTransport::new(memory_cache()).with_transport(Arc::new(origin));

    let conditional = request(Method::Post, "http://x/a").header("If-None-Match", "\"v1\"");
    transport.round_trip(conditional).await.unwrap();

    assert_eq!(saw_validator.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn head_and_get_are_cached_separately() {
    let origin = Origin::new(StatusCode::OK, "body");
    let cache = memory_cache();
    let transport = caching(&origin, Arc::clone(&cache));

    let head = transport
        .round_trip(request(Method::Head, "http://x/a"))
        .await
        .unwrap();
    assert_eq!(head.headers().get(X_CACHEABLE), Some("1"));

    let get = transport
        .round_trip(request(Method::Get, "http://x/a"))
        .await
        .unwrap();
    assert_eq!(get.headers().get(X_FROM_CACHE), None);
    assert_eq!(get.bytes().as_ref(), b"body");

    assert_eq!(origin.calls(), 2);
    assert_eq!(cache.len(), 2);
}

#[tokio::test]
async fn corrupt_entry_falls_back_to_the_network() {
    let origin = Origin::new(StatusCode::OK, "fresh");
    let cache = memory_cache();
    cache.set("http://x/a", Bytes::from_static(b"\x00\x01 definitely not http"));
    let transport = caching(&origin, Arc::clone(&cache));

    let response = transport
        .round_trip(request(Method::Get, "http://x/a"))
        .await
        .unwrap();

    assert_eq!(response.bytes().as_ref(), b"fresh");
    assert_eq!(origin.calls(), 1);
    let stored = cache.get("http://x/a").expect("entry rewritten");
    assert!(stored.starts_with(b"HTTP/1.1 200 OK\r\n"));
}

#[tokio::test(start_paused = true)]
async fn expired_entries_are_refetched() {
    let origin = Origin::new(StatusCode::OK, "hello");
    let cache = Arc::new(MemoryCache::new(Duration::from_secs(30)).unwrap());
    let transport = caching(&origin, Arc::clone(&cache));

    transport
        .round_trip(request(Method::Get, "http://x/a"))
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;
    let response = transport
        .round_trip(request(Method::Get, "http://x/a"))
        .await
        .unwrap();

    assert_eq!(response.headers().get(X_FROM_CACHE), None);
    assert_eq!(origin.calls(), 2);
}

#[tokio::test]
async fn transports_share_entries_only_through_a_shared_store() {
    let origin = Origin::new(StatusCode::OK, "shared");
    let shared = memory_cache();
    let a = caching(&origin, Arc::clone(&shared));
    let b = caching(&origin, Arc::clone(&shared));
    let isolated = caching(&origin, memory_cache());

    a.round_trip(request(Method::Get, "http://x/s")).await.unwrap();
    let from_b = b.round_trip(request(Method::Get, "http://x/s")).await.unwrap();
    let from_isolated = isolated
        .round_trip(request(Method::Get, "http://x/s"))
        .await
        .unwrap();

    assert_eq!(from_b.headers().get(X_FROM_CACHE), Some("1"));
    assert_eq!(from_isolated.headers().get(X_FROM_CACHE), None);
    assert_eq!(origin.calls(), 2);
}

#[tokio::test]
async fn concurrent_requests_on_distinct_urls() {
    let origin = transport_fn(|request: Request| async move {
        let body = request.path().to_owned();
        Ok::<_, TransportError>(Response::new(StatusCode::OK).body(body).with_request(request))
    });
    let transport = Arc::new(CachingTransport::new(memory_cache()).with_transport(Arc::new(origin)));

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                let url = format!("http://x/item/{i}");
                for _ in 0..3 {
                    let response = transport
                        .round_trip(request(Method::Get, &url))
                        .await
                        .unwrap();
                    assert_eq!(response.bytes().as_ref(), format!("/item/{i}").as_bytes());
                }
            })
        })
        .collect();

    for task in tasks {
        task.await.unwrap();
    }
}

/// Serves `reply` to every connection after reading the request head.
async fn raw_origin(reply: &'static [u8]) -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            let mut head = Vec::new();
            let mut chunk = [0u8; 512];
            while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                head.extend_from_slice(&chunk[..n]);
            }
            stream.write_all(reply).await.unwrap();
            let _ = stream.shutdown().await;
        }
    });
    (format!("http://{addr}"), connections)
}

#[tokio::test]
async fn early_hints_are_not_mistaken_for_the_answer() {
    let (base, connections) = raw_origin(
        b"HTTP/1.1 103 Early Hints\r\nLink: </app.css>; rel=preload\r\n\r\nHTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
    )
    .await;
    let cache = memory_cache();
    let transport = CachingTransport::new(cache.clone());
    let url = format!("{base}/page");

    let first = transport.round_trip(Request::get(&url).unwrap()).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.bytes().as_ref(), b"hello");

    let stored = cache.get(&url).expect("final response stored");
    assert!(stored.starts_with(b"HTTP/1.1 200 OK\r\n"));

    let second = transport.round_trip(Request::get(&url).unwrap()).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers().get(X_FROM_CACHE), Some("1"));
    assert_eq!(second.bytes().as_ref(), b"hello");
    assert_eq!(connections.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn interim_status_from_a_custom_transport_is_not_stored() {
    let origin = Origin::new(StatusCode::CONTINUE, "");
    let cache = memory_cache();
    let transport = caching(&origin, Arc::clone(&cache));

    let response = transport
        .round_trip(request(Method::Get, "http://x/hint"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::CONTINUE);
    assert_eq!(response.headers().get(X_CACHEABLE), None);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn latin1_header_bytes_are_cached_verbatim() {
    let (base, _connections) = raw_origin(
        b"HTTP/1.1 200 OK\r\nContent-Disposition: attachment; filename=\"caf\xe9.txt\"\r\nContent-Length: 2\r\n\r\nok",
    )
    .await;
    let cache = memory_cache();
    let transport = CachingTransport::new(cache.clone());
    let url = format!("{base}/dl");

    transport.round_trip(Request::get(&url).unwrap()).await.unwrap();
    let hit = transport.round_trip(Request::get(&url).unwrap()).await.unwrap();

    let expected = &b"attachment; filename=\"caf\xe9.txt\""[..];
    assert_eq!(hit.headers().get(X_FROM_CACHE), Some("1"));
    assert_eq!(hit.headers().get_bytes("content-disposition"), Some(expected));
    let stored = cache.get(&url).unwrap();
    assert!(!String::from_utf8_lossy(&stored).contains('\u{FFFD}'));
}
