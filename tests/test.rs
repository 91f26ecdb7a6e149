// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! End-to-end exercises of the protocol core over the in-process loopback transport, one
//! registered endpoint standing in for both peers, the way `async-coap-tokio/tests/test.rs`
//! exercises its backend against a real UDP socket pair.

use coap_core::message::{MsgCode, MutableMessage};
use coap_core::observer::Observable;
use coap_core::option::{BLOCK2, URI_HOST};
use coap_core::resource::Resource;
use coap_core::transport::{LoopbackTransport, NullTransport};
use coap_core::{BlockInfo, BlockReconstructor, Client, EndpointManager, Server};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LOOP: &str = "loop";
const NULLS: &str = "null";

fn loop_base_uri() -> coap_core::CoapUri {
    coap_core::CoapUri::parse("loop://127.0.0.1:5683/").unwrap()
}

/// (1) A GET against a server with no handler for the requested path comes back `5.01`.
#[tokio::test]
async fn basic_get_against_no_handler_yields_server_error() {
    let manager = EndpointManager::with_tokio_scheduler();
    manager.register_transport(LOOP, Arc::new(LoopbackTransport::new()), Resource::new());
    let client = Client::new(manager, loop_base_uri());

    let txn = client.new_request_builder(MsgCode::MethodGet).send().await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(1), txn.get_response(None)).await.unwrap().unwrap();
    assert_eq!(response.msg_code(), MsgCode::ServerErrorNotImplemented);
}

/// (2) Resource-tree routing: a leaf hit returns content, an unknown sibling is `4.04`, an
/// intermediate node hit without a trailing slash is `4.00`, and with one matches itself.
#[tokio::test]
async fn resource_tree_routing_matches_the_documented_rule() {
    let manager = EndpointManager::with_tokio_scheduler();
    let server = Server::new(manager.clone());
    server.set_request_handler("hello", |_ctx| {
        let mut b = MutableMessage::new();
        b.set_msg_code(MsgCode::SuccessContent);
        b.append_payload_str("Hello, World!");
        b
    });
    server.set_request_handler("d1/d2", |_ctx| {
        let mut b = MutableMessage::new();
        b.set_msg_code(MsgCode::SuccessContent);
        b
    });
    server.add_local_endpoint(LOOP, Arc::new(LoopbackTransport::new()));

    let client = Client::new(manager, loop_base_uri());

    let get = |path: &'static str| {
        let client = client.clone();
        async move {
            let txn = client.new_request_builder(MsgCode::MethodGet).change_path(path).send().await.unwrap();
            tokio::time::timeout(Duration::from_secs(1), txn.get_response(None)).await.unwrap().unwrap()
        }
    };

    let hello = get("hello").await;
    assert_eq!(hello.msg_code(), MsgCode::SuccessContent);
    assert_eq!(hello.payload_as_str(), Some("Hello, World!"));

    let not_found = get("d1/d3").await;
    assert_eq!(not_found.msg_code(), MsgCode::ClientErrorNotFound);

    let intermediate_bare = get("d1/d2/sub").await;
    assert_eq!(intermediate_bare.msg_code(), MsgCode::ClientErrorNotFound);

    let intermediate_slash = get("d1/d2/").await;
    assert_eq!(intermediate_slash.msg_code(), MsgCode::SuccessContent);
}

/// (3) Pinging an empty CON over `loop://` resolves once the matching RST arrives; pinging
/// over `null://`, which never answers, times out at the caller's own deadline.
#[tokio::test]
async fn ping_resolves_over_loopback_and_times_out_over_null() {
    let manager = EndpointManager::with_tokio_scheduler();
    manager.register_transport(LOOP, Arc::new(LoopbackTransport::new()), Resource::new());
    manager.register_transport(NULLS, Arc::new(NullTransport::new()), Resource::new());

    let loop_client = Client::new(manager.clone(), loop_base_uri());
    assert_eq!(loop_client.ping().await, Ok(()));

    let null_uri = coap_core::CoapUri::parse("null://127.0.0.1:5683/").unwrap();
    let null_client = Client::new(manager, null_uri);
    let result = tokio::time::timeout(Duration::from_millis(500), null_client.ping()).await;
    assert!(result.is_err(), "a null transport never answers, so the caller's own deadline should govern");
}

/// (4) A request routed through a `Proxy-Uri`-carrying proxy selector lands on the proxy's
/// endpoint instead of the original destination, with the direct `Uri-*` options omitted.
#[tokio::test]
async fn proxied_request_reaches_the_proxy_and_reports_proxying_not_supported() {
    let manager = EndpointManager::with_tokio_scheduler();
    let proxy_tree = Resource::new();
    proxy_tree.set_request_handler(|_ctx| {
        let mut b = MutableMessage::new();
        b.set_msg_code(MsgCode::ServerErrorProxyingNotSupported);
        b
    });
    manager.register_transport(LOOP, Arc::new(LoopbackTransport::new()), proxy_tree);

    let base_uri = coap_core::CoapUri::parse("coap://origin.example/widgets").unwrap();
    let client = Client::new(manager, base_uri);
    client.set_proxy_selector(|_uri| coap_core::CoapUri::parse("loop://127.0.0.1:5683/").ok());

    let txn = client.new_request_builder(MsgCode::MethodGet).send().await.unwrap();
    let response = tokio::time::timeout(Duration::from_secs(1), txn.get_response(None)).await.unwrap().unwrap();
    assert_eq!(response.msg_code(), MsgCode::ServerErrorProxyingNotSupported);
    assert_eq!(response.option(URI_HOST), None);
}

/// (5) A ~2.8kB resource body is fetched block-by-block and reassembles to the exact bytes
/// the handler produced, driving `BlockReconstructor` across successive `Block2` requests.
#[tokio::test]
async fn block_wise_get_reassembles_a_multi_kilobyte_body() {
    let body: Vec<u8> = (0..2800).map(|i| (i % 26) as u8 + b'a').collect();
    let expected = body.clone();

    let manager = EndpointManager::with_tokio_scheduler();
    let server = Server::new(manager.clone());
    {
        let body = body.clone();
        server.set_request_handler("lorem", move |_ctx| {
            let mut b = MutableMessage::new();
            b.set_msg_code(MsgCode::SuccessContent);
            b.append_payload_bytes(&body);
            b
        });
    }
    server.add_local_endpoint(LOOP, Arc::new(LoopbackTransport::new()));

    let client = Client::new(manager, loop_base_uri());
    let mut reconstructor = BlockReconstructor::new(Vec::<u8>::new(), BlockInfo::new(0, false, 6).unwrap());

    loop {
        let want = reconstructor.next_block();
        let txn = client
            .new_request_builder(MsgCode::MethodGet)
            .change_path("lorem")
            .add_option(BLOCK2, want)
            .send()
            .await
            .unwrap();
        let response = tokio::time::timeout(Duration::from_secs(1), txn.get_response(None)).await.unwrap().unwrap();
        assert_eq!(response.msg_code(), MsgCode::SuccessContent);
        let got_block = response.option(BLOCK2).expect("block-wise response carries Block2");
        let finished = reconstructor.feed(got_block, response.payload()).unwrap();
        if finished {
            break;
        }
    }

    assert_eq!(reconstructor.into_inner(), expected);
}

/// (6) Observe lifecycle: subscribing yields sequence 0, each server-driven notification
/// bumps the sequence, and cancelling the transaction stops further deliveries.
#[tokio::test]
async fn observe_lifecycle_delivers_then_stops_after_cancel() {
    let manager = EndpointManager::with_tokio_scheduler();
    let server = Server::new(manager.clone());
    let observable = Arc::new(Observable::new());
    server.set_observable("ticks", observable.clone());
    let count = Arc::new(AtomicU32::new(0));
    {
        let count = count.clone();
        server.set_request_handler("ticks", move |_ctx| {
            let mut b = MutableMessage::new();
            b.set_msg_code(MsgCode::SuccessContent);
            b.append_payload_str(&count.load(Ordering::SeqCst).to_string());
            b
        });
    }
    server.add_local_endpoint(LOOP, Arc::new(LoopbackTransport::new()));

    let client = Client::new(manager, loop_base_uri());
    let txn = client.new_request_builder(MsgCode::MethodGet).change_path("ticks").observe().send().await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(1), txn.get_response(None)).await.unwrap().unwrap();
    assert_eq!(first.observe(), Some(0));

    for expected_seq in 1..=2 {
        count.fetch_add(1, Ordering::SeqCst);
        server.notify(LOOP, "ticks", false).await;
        let notification = tokio::time::timeout(Duration::from_secs(1), txn.get_response(None)).await.unwrap().unwrap();
        assert_eq!(notification.observe(), Some(expected_seq));
        assert_eq!(notification.payload_as_str(), Some(expected_seq.to_string().as_str()));
    }

    assert_eq!(observable.get_observer_count(), 1);

    txn.cancel();
    // Let the best-effort unobserve NON actually land before checking the server's side.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(observable.get_observer_count(), 0);

    count.fetch_add(1, Ordering::SeqCst);
    server.notify(LOOP, "ticks", false).await;
    let late = tokio::time::timeout(Duration::from_millis(200), txn.get_response(None)).await;
    assert!(late.is_err() || late.unwrap().is_err(), "a cancelled transaction must not keep receiving notifications");
}
