#[path = "common/mod.rs"]
mod common;

use std::time::Duration;

use common::*;
use overlay_kbr::config::{RecursiveLookupConfig, RpcConfig};
use overlay_kbr::core::Timestamp;
use overlay_kbr::lookup::AbstractLookup;
use overlay_kbr::protocol::{RoutingMode, RpcCall, RpcResponse};
use overlay_kbr::recursive::RecursiveLookup;
use overlay_kbr::rpc::{RpcCorrelator, RpcEvent, RpcRequest};

#[test]
fn response_after_timeout_is_ignored() {
    init_tracing();
    let mut host = ScriptedHost::new(make_handle(0xF0), vec![]);
    let listener = RecordingListener::default();
    let mut lookup = RecursiveLookup::new(
        3,
        RecursiveLookupConfig::default(),
        RoutingMode::SemiRecursive,
        true,
    );
    lookup
        .lookup(&mut host, make_node_id(0x00), 1, 0, 0, Some(listener.boxed()))
        .unwrap();
    let nonce = host.sent[0].nonce;

    assert!(expire(&mut host, &mut lookup, nonce));
    assert_eq!(listener.calls(), 1);
    assert!(!lookup.is_valid());

    deliver(
        &mut host,
        &mut lookup,
        nonce,
        make_handle(0x01),
        find_node_response(true, &[make_handle(0x01)]),
    );
    assert_eq!(listener.calls(), 1);
    assert!(!lookup.is_valid());
    assert!(lookup.result().is_empty());
    assert_eq!(host.rpc.pending(), 0);
}

#[test]
fn duplicate_response_is_reported_once() {
    let mut rpc = RpcCorrelator::new(RpcConfig::default(), 1);
    let node = make_handle(0x10);
    let nonce = rpc.send_call(RpcRequest::to_node(node, RpcCall::Ping, 9), Timestamp::ZERO);

    let now = Timestamp::from_millis(40);
    let first = rpc.on_response(nonce, node, RpcResponse::Pong, 0, now);
    let Some(RpcEvent::Response(reply)) = first else {
        panic!("expected a response event, got {first:?}");
    };
    assert_eq!(reply.listener, 9);
    assert_eq!(reply.rtt, Duration::from_millis(40));

    assert!(rpc.on_response(nonce, node, RpcResponse::Pong, 0, now).is_none());
    assert_eq!(rpc.pending(), 0);
}

#[test]
fn timer_after_response_is_ignored() {
    let mut rpc = RpcCorrelator::new(RpcConfig::default(), 1);
    let node = make_handle(0x10);
    let nonce = rpc.send_call(RpcRequest::to_node(node, RpcCall::Ping, 9), Timestamp::ZERO);
    let deadline = Timestamp::ZERO + RpcConfig::default().udp_timeout;

    assert!(rpc
        .on_response(nonce, node, RpcResponse::Pong, 0, Timestamp::from_millis(5))
        .is_some());
    assert!(rpc.on_timeout(nonce, deadline, deadline).is_none());
}

#[test]
fn cancelled_listener_hears_nothing() {
    let mut rpc = RpcCorrelator::new(RpcConfig::default(), 1);
    let a = make_handle(0x10);
    let b = make_handle(0x11);
    let first = rpc.send_call(RpcRequest::to_node(a, RpcCall::Ping, 4), Timestamp::ZERO);
    let second = rpc.send_call(RpcRequest::to_node(b, RpcCall::Ping, 4), Timestamp::ZERO);
    let other = rpc.send_call(RpcRequest::to_node(b, RpcCall::Ping, 5), Timestamp::ZERO);

    let mut cancelled = rpc.cancel_listener(4);
    cancelled.sort_unstable();
    let mut expected = vec![first, second];
    expected.sort_unstable();
    assert_eq!(cancelled, expected);
    assert!(rpc.contains(other));
    assert!(rpc
        .on_response(first, a, RpcResponse::Pong, 0, Timestamp::ZERO)
        .is_none());
}
