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

//! A hierarchical tree of request handlers, dispatching along successive `Uri-Path` segments.
//!
//! The teacher library never plays the server role (its `receive_loop` is driven by a single
//! closure; see `local_endpoint.rs`'s `ReceiveHandler` and
//! `RespondableInboundContext::respond`), so there is no resource tree to adapt directly. This
//! module instead models each node as a capability record (per spec.md §9 "Polymorphic
//! handlers") offering `request`/`request_check`/`provide_observable`/`link_params`, queried
//! explicitly rather than probed via dynamic typing, and reuses the same `Arc`-of-trait-object
//! callback idiom the rest of this crate gets from the teacher's `response_tracker.rs` and
//! `arc_guard.rs`.

use crate::message::{Message, MsgCode, MutableMessage};
use crate::observer::Observable;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// The inbound request a handler is asked to answer.
pub struct InboundRequest<'a> {
    message: &'a Message,
    remote: SocketAddr,
}

impl<'a> InboundRequest<'a> {
    /// Creates a new inbound request context.
    pub fn new(message: &'a Message, remote: SocketAddr) -> InboundRequest<'a> {
        InboundRequest { message, remote }
    }

    /// Returns the inbound request message.
    pub fn request(&self) -> &Message {
        self.message
    }

    /// Returns the address of the requester.
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

/// A request handler, producing a response message from a request context.
pub type RequestHandler = Arc<dyn Fn(&InboundRequest) -> MutableMessage + Send + Sync>;

/// A pre-flight check run before `request`, e.g. to reject malformed or unauthorized
/// requests before any state-changing work happens.
pub type RequestCheck = Arc<dyn Fn(&InboundRequest) -> Result<(), crate::error::Error> + Send + Sync>;

/// Produces this resource's CoRE Link Format attribute string (RFC 6690), e.g. `title="..."`.
pub type LinkParams = Arc<dyn Fn() -> String + Send + Sync>;

#[derive(Default)]
struct Capabilities {
    request: Option<RequestHandler>,
    request_check: Option<RequestCheck>,
    observable: Option<Arc<Observable>>,
    link_params: Option<LinkParams>,
}

/// One node of the resource tree.
#[derive(Default)]
pub struct Resource {
    children: Mutex<HashMap<String, Arc<Resource>>>,
    capabilities: Mutex<Capabilities>,
}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("children", &self.children.lock().unwrap().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Resource {
    /// Creates an empty resource node with no children and no capabilities.
    pub fn new() -> Arc<Resource> {
        Arc::new(Resource::default())
    }

    /// Attaches `child` under `name`. Overwrites any existing child of the same name.
    pub fn add_child(&self, name: impl Into<String>, child: Arc<Resource>) {
        self.children.lock().unwrap().insert(name.into(), child);
    }

    /// Sets this node's request handler.
    pub fn set_request_handler(&self, handler: impl Fn(&InboundRequest) -> MutableMessage + Send + Sync + 'static) {
        self.capabilities.lock().unwrap().request = Some(Arc::new(handler));
    }

    /// Sets this node's pre-flight request check.
    pub fn set_request_check(
        &self,
        check: impl Fn(&InboundRequest) -> Result<(), crate::error::Error> + Send + Sync + 'static,
    ) {
        self.capabilities.lock().unwrap().request_check = Some(Arc::new(check));
    }

    /// Attaches an [`Observable`] to this node, enabling RFC 7641 subscription.
    pub fn set_observable(&self, observable: Arc<Observable>) {
        self.capabilities.lock().unwrap().observable = Some(observable);
    }

    /// Returns this node's `Observable`, if it has one.
    pub fn observable(&self) -> Option<Arc<Observable>> {
        self.capabilities.lock().unwrap().observable.clone()
    }

    /// Sets this node's Link Format attribute generator.
    pub fn set_link_params(&self, link_params: impl Fn() -> String + Send + Sync + 'static) {
        self.capabilities.lock().unwrap().link_params = Some(Arc::new(link_params));
    }

    /// Returns true if this node has any children (i.e. is an intermediate container).
    pub fn has_children(&self) -> bool {
        !self.children.lock().unwrap().is_empty()
    }

    /// Returns the child named `name`, creating an empty one first if it doesn't exist yet.
    /// Used to build out a resource tree incrementally by path, rather than constructing every
    /// intermediate node up front.
    pub fn get_or_create_child(&self, name: &str) -> Arc<Resource> {
        self.children.lock().unwrap().entry(name.to_string()).or_insert_with(Resource::new).clone()
    }

    fn child(&self, name: &str) -> Option<Arc<Resource>> {
        self.children.lock().unwrap().get(name).cloned()
    }

    fn handle_here(&self, ctx: &InboundRequest) -> MutableMessage {
        let capabilities = self.capabilities.lock().unwrap();
        if let Some(check) = &capabilities.request_check {
            if let Err(_err) = check(ctx) {
                return error_response(MsgCode::ClientErrorBadRequest);
            }
        }
        match &capabilities.request {
            Some(handler) => handler(ctx),
            None => error_response(MsgCode::ServerErrorNotImplemented),
        }
    }

    /// Walks `path` (the request's `Uri-Path` option values, in order) starting from this
    /// node, and produces the response per the routing rule: an exhausted path with a
    /// trailing empty segment (URI ending in `/`) matches the node itself explicitly; a named
    /// segment with no matching child yields `4.04`; a path that lands exactly on an
    /// intermediate (child-bearing) node without a trailing slash yields `4.00`.
    pub fn dispatch(self: &Arc<Self>, path: &[&str], ctx: &InboundRequest) -> MutableMessage {
        match path {
            [] => self.handle_here(ctx),
            [""] => self.handle_here(ctx),
            [head, rest @ ..] => match self.child(head) {
                Some(child) => {
                    if rest.is_empty() {
                        if child.has_children() {
                            error_response(MsgCode::ClientErrorBadRequest)
                        } else {
                            child.handle_here(ctx)
                        }
                    } else {
                        child.dispatch(rest, ctx)
                    }
                }
                None => error_response(MsgCode::ClientErrorNotFound),
            },
        }
    }

    /// Walks `path` using the same routing rule as [`Resource::dispatch`], but returns the
    /// matched node itself rather than invoking its handler. Used to locate the `Observable`
    /// a subscription or notification targets.
    pub fn resolve(self: &Arc<Self>, path: &[&str]) -> Option<Arc<Resource>> {
        match path {
            [] => Some(self.clone()),
            [""] => Some(self.clone()),
            [head, rest @ ..] => match self.child(head) {
                Some(child) => {
                    if rest.is_empty() {
                        if child.has_children() {
                            None
                        } else {
                            Some(child)
                        }
                    } else {
                        child.resolve(rest)
                    }
                }
                None => None,
            },
        }
    }
}

fn error_response(code: MsgCode) -> MutableMessage {
    let mut builder = MutableMessage::new();
    builder.set_msg_code(code);
    builder
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MsgToken, MsgType};

    fn get_request() -> Message {
        let mut builder = MutableMessage::new();
        builder
            .set_msg_type(MsgType::Con)
            .set_msg_code(MsgCode::MethodGet)
            .set_msg_token(MsgToken::new(&[1]).unwrap());
        builder.freeze()
    }

    fn build_tree() -> Arc<Resource> {
        let root = Resource::new();
        let hello = Resource::new();
        hello.set_request_handler(|_ctx| {
            let mut b = MutableMessage::new();
            b.set_msg_code(MsgCode::SuccessContent);
            b.append_payload_str("Hello, World!");
            b
        });
        root.add_child("hello", hello);

        let d1 = Resource::new();
        let d2 = Resource::new();
        d2.set_request_handler(|_ctx| {
            let mut b = MutableMessage::new();
            b.set_msg_code(MsgCode::SuccessContent);
            b
        });
        let d2_leaf = Resource::new();
        d2_leaf.set_request_handler(|_ctx| {
            let mut b = MutableMessage::new();
            b.set_msg_code(MsgCode::SuccessContent);
            b
        });
        d2.add_child("leaf", d2_leaf);
        d1.add_child("d2", d2);
        root.add_child("d1", d1);

        root
    }

    #[test]
    fn root_with_no_handler_is_not_implemented() {
        let root = Resource::new();
        let request = get_request();
        let ctx = InboundRequest::new(&request, "127.0.0.1:1".parse().unwrap());
        let response = root.dispatch(&[], &ctx);
        assert_eq!(response.freeze().msg_code(), MsgCode::ServerErrorNotImplemented);
    }

    #[test]
    fn leaf_resource_hit_returns_its_content() {
        let root = build_tree();
        let request = get_request();
        let ctx = InboundRequest::new(&request, "127.0.0.1:1".parse().unwrap());
        let response = root.dispatch(&["hello"], &ctx).freeze();
        assert_eq!(response.msg_code(), MsgCode::SuccessContent);
        assert_eq!(response.payload_as_str(), Some("Hello, World!"));
    }

    #[test]
    fn unmatched_segment_is_not_found() {
        let root = build_tree();
        let request = get_request();
        let ctx = InboundRequest::new(&request, "127.0.0.1:1".parse().unwrap());
        let response = root.dispatch(&["d1", "d3"], &ctx).freeze();
        assert_eq!(response.msg_code(), MsgCode::ClientErrorNotFound);
    }

    #[test]
    fn intermediate_resource_without_trailing_slash_is_bad_request() {
        let root = build_tree();
        let request = get_request();
        let ctx = InboundRequest::new(&request, "127.0.0.1:1".parse().unwrap());
        let response = root.dispatch(&["d1", "d2"], &ctx).freeze();
        assert_eq!(response.msg_code(), MsgCode::ClientErrorBadRequest);
    }

    #[test]
    fn intermediate_resource_with_trailing_slash_matches_itself() {
        let root = build_tree();
        let request = get_request();
        let ctx = InboundRequest::new(&request, "127.0.0.1:1".parse().unwrap());
        let response = root.dispatch(&["d1", "d2", ""], &ctx).freeze();
        assert_eq!(response.msg_code(), MsgCode::SuccessContent);
    }

    #[test]
    fn get_or_create_child_reuses_an_existing_node() {
        let root = Resource::new();
        let first = root.get_or_create_child("a");
        first.set_request_handler(|_ctx| {
            let mut b = MutableMessage::new();
            b.set_msg_code(MsgCode::SuccessContent);
            b
        });

        let second = root.get_or_create_child("a");
        let request = get_request();
        let ctx = InboundRequest::new(&request, "127.0.0.1:1".parse().unwrap());
        assert_eq!(second.dispatch(&[], &ctx).freeze().msg_code(), MsgCode::SuccessContent);
    }

    #[test]
    fn resolve_finds_the_same_node_dispatch_would_hit() {
        let root = build_tree();
        assert!(root.resolve(&["hello"]).is_some());
        assert!(root.resolve(&["d1", "d3"]).is_none());
        assert!(root.resolve(&["d1", "d2"]).is_none()); // intermediate node, no trailing slash
        assert!(root.resolve(&["d1", "d2", ""]).is_some());
    }
}
