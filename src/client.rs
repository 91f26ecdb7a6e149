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


//! A CoAP client: a [`CoapUri`] base address plus the [`EndpointManager`] used to reach it,
//! and a fluent [`RequestBuilder`] for sending requests through the transaction layer.
//!
//! `CoapUri` has no built-in address resolution (see uri.rs's module doc), so this is the one
//! place that turns a scheme/host/port into a destination the [`Transport`] can actually send
//! to: `loop`/`null` resolve through the registered endpoint's own `local_addr()` (mirroring
//! the self-looping design of [`LoopbackTransport`](crate::transport::LoopbackTransport)),
//! while `coap`/`coaps` resolve via `tokio::net::lookup_host`.

use crate::endpoint::{EndpointManager, LocalEndpoint};
use crate::error::Error;
use crate::message::{Message, MsgCode, MsgToken, MsgType, MutableMessage};
use crate::message_layer::AckOutcome;
use crate::observer::is_fresher;
use crate::option::{OptionKey, OptionValue, OBSERVE, PROXY_URI, URI_HOST, URI_PATH, URI_PORT, URI_QUERY};
use crate::transaction::{KeyToken, TransactionCallback, TransactionTable};
use crate::uri::CoapUri;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Decides, for a given destination URI, whether to go through a proxy. Returning `Some(uri)`
/// redirects both the transport destination and the request's addressing options to `uri`
/// (carrying the original destination in a `Proxy-Uri` option); returning `None` sends
/// directly, per spec.md §4.6.
pub type ProxySelector = Arc<dyn Fn(&CoapUri) -> Option<CoapUri> + Send + Sync>;

/// A CoAP endpoint reached relative to a fixed base URI.
///
/// Holds no connection state of its own: every [`send`](RequestBuilder::send) looks up (or
/// waits on DNS for) a destination address and asks the shared [`EndpointManager`] for the
/// [`LocalEndpoint`] registered under the target scheme, the same way a direct caller of
/// `EndpointManager::register_transport` would.
pub struct Client {
    manager: Arc<EndpointManager>,
    base_uri: CoapUri,
    proxy_selector: Mutex<Option<ProxySelector>>,
    own_transactions: Mutex<Vec<crate::transaction::Transaction>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("base_uri", &self.base_uri.to_string()).finish_non_exhaustive()
    }
}

impl Client {
    /// Creates a client that reaches `base_uri` through endpoints registered on `manager`.
    pub fn new(manager: Arc<EndpointManager>, base_uri: CoapUri) -> Arc<Client> {
        Arc::new(Client {
            manager,
            base_uri,
            proxy_selector: Mutex::new(None),
            own_transactions: Mutex::new(Vec::new()),
        })
    }

    /// Returns the base URI this client was created with.
    pub fn base_uri(&self) -> &CoapUri {
        &self.base_uri
    }

    /// Starts building a request with method `method`, addressed at this client's base URI
    /// (use [`RequestBuilder::change_path`] to target a different path under the same host).
    pub fn new_request_builder(self: &Arc<Self>, method: MsgCode) -> RequestBuilder {
        let mut message = MutableMessage::new();
        message.set_msg_code(method);
        RequestBuilder {
            client: self.clone(),
            uri: self.base_uri.clone(),
            confirmable: true,
            observe_register: false,
            token: None,
            payload: Vec::new(),
            message,
            error: None,
        }
    }

    /// Installs the proxy-selection policy applied to every request sent from this client
    /// from this point forward. See [`ProxySelector`].
    pub fn set_proxy_selector(&self, selector: impl Fn(&CoapUri) -> Option<CoapUri> + Send + Sync + 'static) {
        *self.proxy_selector.lock().unwrap() = Some(Arc::new(selector));
    }

    /// Returns the transactions this client has sent that have not yet finished, cancelling
    /// its bookkeeping of any that have.
    pub fn get_active_transactions(&self) -> Vec<crate::transaction::Transaction> {
        let mut txns = self.own_transactions.lock().unwrap();
        txns.retain(|t| t.is_active());
        txns.clone()
    }

    /// Cancels every transaction this client has outstanding.
    pub fn cancel_all_transactions(&self) {
        for txn in self.own_transactions.lock().unwrap().drain(..) {
            txn.cancel();
        }
    }

    /// Sends an empty confirmable message to the base URI's host and waits for the RST.
    pub async fn ping(&self) -> Result<(), Error> {
        let (endpoint, dest) = resolve_endpoint_and_addr(&self.manager, &self.base_uri).await?;
        endpoint.ping(dest).await
    }
}

/// Forwards transaction-layer callbacks into a response channel (for
/// [`Transaction::get_response`]) and, once one is registered, into a user-supplied
/// [`TransactionCallback`].
struct ResponseForwarder {
    responses_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<Message>>>,
    user_callback: Mutex<Option<Arc<dyn TransactionCallback>>>,
    last_error: Mutex<Option<Error>>,
    /// Epoch against which `last_observe`'s timestamps are measured, so they can be handed to
    /// [`is_fresher`] as plain `Duration`s.
    created_at: Instant,
    /// The `(sequence, arrival time)` of the last `Observe` notification accepted as fresh, per
    /// RFC 7641 §3.4. `None` until the first notification arrives.
    last_observe: Mutex<Option<(u32, Duration)>>,
}

impl ResponseForwarder {
    fn new() -> ResponseForwarder {
        ResponseForwarder {
            responses_tx: Mutex::new(None),
            user_callback: Mutex::new(None),
            last_error: Mutex::new(None),
            created_at: Instant::now(),
            last_observe: Mutex::new(None),
        }
    }

    /// Returns true if `message` should be forwarded: either it carries no `Observe` sequence
    /// at all (an ordinary response), or its sequence is fresher than the last one accepted,
    /// per the RFC 7641 §3.4 comparison. A stale or out-of-order notification is dropped here
    /// so the application and the response channel never see it.
    fn accept(&self, message: &Message) -> bool {
        let Some(seq) = message.observe() else {
            return true;
        };
        let now = self.created_at.elapsed();
        let mut last_observe = self.last_observe.lock().unwrap();
        let fresh = match *last_observe {
            Some((old_seq, old_time)) => is_fresher(old_seq, old_time, seq, now),
            None => true,
        };
        if fresh {
            *last_observe = Some((seq, now));
        }
        fresh
    }
}

impl TransactionCallback for ResponseForwarder {
    fn on_transaction_response(&self, message: &Message) {
        if !self.accept(message) {
            return;
        }
        if let Some(tx) = self.responses_tx.lock().unwrap().as_ref() {
            let _ = tx.send(message.clone());
        }
        if let Some(cb) = self.user_callback.lock().unwrap().as_ref() {
            cb.on_transaction_response(message);
        }
    }

    fn on_transaction_cancelled(&self) {
        *self.last_error.lock().unwrap() = Some(Error::Cancelled);
        if let Some(cb) = self.user_callback.lock().unwrap().as_ref() {
            cb.on_transaction_cancelled();
        }
    }

    fn on_transaction_exception(&self, error: Error) {
        *self.last_error.lock().unwrap() = Some(error);
        if let Some(cb) = self.user_callback.lock().unwrap().as_ref() {
            cb.on_transaction_exception(error);
        }
    }

    fn on_transaction_finished(&self) {
        // Dropping the sender closes the channel, so a pending or future `get_response` call
        // sees `None` (and falls back to `last_error`) instead of hanging forever.
        self.responses_tx.lock().unwrap().take();
        if let Some(cb) = self.user_callback.lock().unwrap().as_ref() {
            cb.on_transaction_finished();
        }
    }
}

/// A live (or recently finished) request/response exchange, returned by
/// [`RequestBuilder::send`].
///
/// Wraps the transaction layer's own [`crate::transaction::Transaction`] handle with the
/// pull-based [`get_response`](Transaction::get_response) a direct caller usually wants, while
/// still allowing a push-based [`TransactionCallback`] to be attached for long-lived
/// observations via [`register_callback`](Transaction::register_callback).
pub struct Transaction {
    inner: crate::transaction::Transaction,
    forwarder: Arc<ResponseForwarder>,
    request: Message,
    responses_rx: tokio::sync::Mutex<tokio::sync::mpsc::UnboundedReceiver<Message>>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction").field("state", &self.inner.state()).finish_non_exhaustive()
    }
}

impl Transaction {
    /// Returns the request message this transaction sent.
    pub fn get_request(&self) -> &Message {
        &self.request
    }

    /// Waits for the next response (or, for an observation, the next notification).
    /// `timeout`, if given, bounds how long to wait; with no pending response and the
    /// transaction already finished, returns immediately with the terminal error.
    pub async fn get_response(&self, timeout: Option<Duration>) -> Result<Message, Error> {
        let mut rx = self.responses_rx.lock().await;
        let recv = async {
            match rx.recv().await {
                Some(message) => Ok(message),
                None => Err(self.forwarder.last_error.lock().unwrap().unwrap_or(Error::NoResponse)),
            }
        };
        match timeout {
            Some(duration) => tokio::time::timeout(duration, recv).await.map_err(|_| Error::TransmitTimeout)?,
            None => recv.await,
        }
    }

    /// Attaches a callback invoked as this transaction progresses, in addition to whatever
    /// `get_response` callers are already waiting. Callbacks run inline on the endpoint's
    /// receive-loop task, the same task that would otherwise just feed `get_response`.
    pub fn register_callback(&self, callback: Arc<dyn TransactionCallback>) {
        *self.forwarder.user_callback.lock().unwrap() = Some(callback);
    }

    /// Returns this transaction's current lifecycle state.
    pub fn state(&self) -> Option<crate::transaction::TransactionState> {
        self.inner.state()
    }

    /// Returns true if this transaction is still active (awaiting a response or observing).
    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Returns true if this transaction was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Cancels the transaction, sending an unobserve request first if it was observing.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Cancels the transaction without sending an unobserve request.
    pub fn cancel_without_unobserve(&self) {
        self.inner.cancel_without_unobserve();
    }
}

/// Builds one outbound request, fluently, before handing it to the transaction layer.
pub struct RequestBuilder {
    client: Arc<Client>,
    uri: CoapUri,
    confirmable: bool,
    observe_register: bool,
    token: Option<MsgToken>,
    payload: Vec<u8>,
    message: MutableMessage,
    /// The first error hit while building this request, surfaced when `send` is called
    /// rather than threading a `Result` through every fluent step.
    error: Option<Error>,
}

impl RequestBuilder {
    /// Replaces the request's path with the segments of `rel_path`, keeping the scheme, host,
    /// and port of the client's base URI.
    pub fn change_path(mut self, rel_path: &str) -> Self {
        self.uri = self.uri.with_path(rel_path);
        self
    }

    /// Adds a typed option to the request.
    pub fn add_option<'a, T>(mut self, key: OptionKey<T>, value: T) -> Self
    where
        T: Into<OptionValue<'a>>,
    {
        if self.error.is_none() {
            if let Err(error) = self.message.insert_option(key, value) {
                self.error = Some(error);
            }
        }
        self
    }

    /// Sets the request's token, overriding the randomly generated default.
    pub fn set_token(mut self, token: MsgToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Sets the request's payload, replacing anything set by a previous call.
    pub fn set_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Sends the request as non-confirmable instead of the default confirmable.
    pub fn non_confirmable(mut self) -> Self {
        self.confirmable = false;
        self
    }

    /// Marks this as an `Observe` registration (RFC 7641 §2): the response establishes a
    /// long-lived transaction fed by every subsequent notification, until cancelled.
    pub fn observe(mut self) -> Self {
        self.observe_register = true;
        self
    }

    /// Resolves a destination, registers a transaction, and sends the request.
    pub async fn send(self) -> Result<Transaction, Error> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let RequestBuilder {
            client,
            uri,
            confirmable,
            observe_register,
            token,
            payload,
            mut message,
            error: _,
        } = self;

        let proxy_target = client
            .proxy_selector
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|selector| selector(&uri));
        let target_uri = proxy_target.as_ref().unwrap_or(&uri);
        let (endpoint, dest) = resolve_endpoint_and_addr(&client.manager, target_uri).await?;

        populate_uri_options(&mut message, &uri, proxy_target.as_ref())?;
        if observe_register {
            message.insert_option(OBSERVE, crate::consts::OBSERVE_REGISTER)?;
        }
        if !payload.is_empty() {
            message.append_payload_bytes(&payload);
        }

        let token = token.unwrap_or_else(|| MsgToken::random(crate::consts::MAX_TOKEN_LEN));
        let mid = endpoint.message_layer().next_msg_id();
        message
            .set_msg_type(if confirmable { MsgType::Con } else { MsgType::Non })
            .set_msg_id(mid)
            .set_msg_token(token);

        let request_message = message.freeze();
        let key: KeyToken = (token, dest);

        let (responses_tx, responses_rx) = tokio::sync::mpsc::unbounded_channel();
        let forwarder = Arc::new(ResponseForwarder {
            responses_tx: Mutex::new(Some(responses_tx)),
            ..ResponseForwarder::new()
        });

        let core_txn = endpoint.transactions().register(key, observe_register, forwarder.clone());

        if observe_register {
            register_unobserve_action(&endpoint, &core_txn, token, dest);
        }

        if confirmable {
            let table: Arc<TransactionTable> = endpoint.transactions().clone();
            let id = core_txn.id();
            endpoint.message_layer().send_confirmable(&request_message, dest, move |outcome| match outcome {
                AckOutcome::Acknowledged(Some(response)) => {
                    table.deliver_response(key, &response);
                }
                AckOutcome::Acknowledged(None) => {
                    // Empty ACK: a separate response will arrive later and is delivered by
                    // the endpoint's receive loop via the same `(token, dest)` key.
                }
                AckOutcome::Reset => table.fail(id, Error::Reset),
                AckOutcome::TimedOut => table.fail(id, Error::TransmitTimeout),
            })?;
        } else {
            endpoint.message_layer().send_non_confirmable(&request_message, dest).await?;
        }

        client.own_transactions.lock().unwrap().push(core_txn.clone());

        Ok(Transaction {
            inner: core_txn,
            forwarder,
            request: request_message,
            responses_rx: tokio::sync::Mutex::new(responses_rx),
        })
    }
}

/// Registers the closure fired if this observation is cancelled while still active: a
/// best-effort, non-confirmable `GET` with `Observe=1`, per RFC 7641 §3.6 ("a client that is
/// no longer interested ... simply forgets the observation" is also valid, but sending the
/// deregistration lets the server drop its subscriber state immediately).
fn register_unobserve_action(
    endpoint: &Arc<LocalEndpoint>,
    core_txn: &crate::transaction::Transaction,
    token: MsgToken,
    dest: SocketAddr,
) {
    let layer = endpoint.message_layer().clone();
    let mut builder = MutableMessage::new();
    builder
        .set_msg_type(MsgType::Non)
        .set_msg_code(MsgCode::MethodGet)
        .set_msg_id(endpoint.message_layer().next_msg_id())
        .set_msg_token(token);
    let _ = builder.insert_option(OBSERVE, crate::consts::OBSERVE_DEREGISTER);
    let unobserve_request = builder.freeze();

    endpoint.transactions().set_unobserve_action(
        core_txn.id(),
        Box::new(move || {
            tokio::spawn(async move {
                let _ = layer.send_non_confirmable(&unobserve_request, dest).await;
            });
        }),
    );
}

/// Populates the request's addressing options from `uri`: `Uri-Host`/`Uri-Port`/`Uri-Path`/
/// `Uri-Query` when sending directly, or a single `Proxy-Uri` carrying the full original URI
/// when `proxy_target` is `Some` (per spec.md §4.6, the direct `Uri-*` options are omitted in
/// that case; the proxy recovers them by parsing `Proxy-Uri` itself).
fn populate_uri_options(message: &mut MutableMessage, uri: &CoapUri, proxy_target: Option<&CoapUri>) -> Result<(), Error> {
    if proxy_target.is_some() {
        message.insert_option(PROXY_URI, uri.to_string().as_str())?;
        return Ok(());
    }

    message.insert_option(URI_HOST, uri.host())?;
    let default_port = if uri.scheme() == "coaps" {
        crate::consts::DEFAULT_PORT_COAP_DTLS
    } else {
        crate::consts::DEFAULT_PORT_COAP_UDP
    };
    if uri.port() != default_port {
        message.insert_option(URI_PORT, uri.port())?;
    }
    for segment in uri.path() {
        message.insert_option(URI_PATH, segment.as_str())?;
    }
    for query in uri.query() {
        message.insert_option(URI_QUERY, query.as_str())?;
    }
    Ok(())
}

/// Resolves `uri` to a destination address and the [`LocalEndpoint`] registered for its
/// scheme. `loop`/`null` endpoints have no real address to look up, so their own
/// `Transport::local_addr()` (the self-loop address for `loop://`, a black hole for
/// `null://`) stands in for it; everything else goes through DNS.
async fn resolve_endpoint_and_addr(
    manager: &Arc<EndpointManager>,
    uri: &CoapUri,
) -> Result<(Arc<LocalEndpoint>, SocketAddr), Error> {
    let endpoint = manager.local_endpoint_for_scheme(uri.scheme()).ok_or(Error::UnsupportedUriScheme)?;

    let dest = match uri.scheme() {
        crate::consts::URI_SCHEME_LOOPBACK | crate::consts::URI_SCHEME_NULL => endpoint.transport().local_addr()?,
        _ => {
            let hostport = format!("{}:{}", uri.host(), uri.port());
            let mut addrs = tokio::net::lookup_host(hostport).await.map_err(|_| Error::HostNotFound)?;
            addrs.next().ok_or(Error::HostNotFound)?
        }
    };

    Ok((endpoint, dest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::URI_SCHEME_LOOPBACK;
    use crate::resource::Resource;
    use crate::transport::LoopbackTransport;
    use std::time::Duration;

    #[tokio::test]
    async fn get_against_no_handler_resource_yields_501() {
        let manager = EndpointManager::with_tokio_scheduler();
        manager.register_transport(URI_SCHEME_LOOPBACK, Arc::new(LoopbackTransport::new()), Resource::new());

        let base_uri = CoapUri::parse("loop://127.0.0.1:5683/").unwrap();
        let client = Client::new(manager, base_uri);

        let txn = client.new_request_builder(MsgCode::MethodGet).send().await.unwrap();
        let response = tokio::time::timeout(Duration::from_secs(1), txn.get_response(None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.msg_code(), MsgCode::ServerErrorNotImplemented);
    }

    #[tokio::test]
    async fn leaf_resource_get_returns_its_content() {
        let manager = EndpointManager::with_tokio_scheduler();
        let root = Resource::new();
        let hello = Resource::new();
        hello.set_request_handler(|_ctx| {
            let mut b = MutableMessage::new();
            b.set_msg_code(MsgCode::SuccessContent);
            b.append_payload_str("Hello, World!");
            b
        });
        root.add_child("hello", hello);
        manager.register_transport(URI_SCHEME_LOOPBACK, Arc::new(LoopbackTransport::new()), root);

        let base_uri = CoapUri::parse("loop://127.0.0.1:5683/").unwrap();
        let client = Client::new(manager, base_uri);

        let txn = client
            .new_request_builder(MsgCode::MethodGet)
            .change_path("hello")
            .send()
            .await
            .unwrap();
        let response = tokio::time::timeout(Duration::from_secs(1), txn.get_response(None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.msg_code(), MsgCode::SuccessContent);
        assert_eq!(response.payload_as_str(), Some("Hello, World!"));
    }

    #[tokio::test]
    async fn client_ping_resolves_over_loopback() {
        let manager = EndpointManager::with_tokio_scheduler();
        manager.register_transport(URI_SCHEME_LOOPBACK, Arc::new(LoopbackTransport::new()), Resource::new());

        let base_uri = CoapUri::parse("loop://127.0.0.1:5683/").unwrap();
        let client = Client::new(manager, base_uri);
        assert_eq!(client.ping().await, Ok(()));
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected_before_any_send() {
        let manager = EndpointManager::with_tokio_scheduler();
        let base_uri = CoapUri::parse("coap://127.0.0.1/").unwrap();
        let client = Client::new(manager, base_uri);

        let result = client.new_request_builder(MsgCode::MethodGet).send().await;
        assert_eq!(result.err(), Some(Error::UnsupportedUriScheme));
    }

    #[tokio::test]
    async fn proxied_request_carries_proxy_uri_and_omits_direct_uri_options() {
        let manager = EndpointManager::with_tokio_scheduler();
        let proxy_resources = Resource::new();
        let observed_request: Arc<Mutex<Option<Message>>> = Arc::new(Mutex::new(None));
        {
            let observed_request = observed_request.clone();
            proxy_resources.set_request_handler(move |ctx| {
                *observed_request.lock().unwrap() = Some(ctx.request().clone());
                let mut b = MutableMessage::new();
                b.set_msg_code(MsgCode::ServerErrorProxyingNotSupported);
                b
            });
        }
        manager.register_transport(URI_SCHEME_LOOPBACK, Arc::new(LoopbackTransport::new()), proxy_resources);

        let base_uri = CoapUri::parse("coap://origin.example/a/b").unwrap();
        let client = Client::new(manager, base_uri);
        client.set_proxy_selector(|_uri| CoapUri::parse("loop://127.0.0.1:5683/").ok());

        let txn = client.new_request_builder(MsgCode::MethodGet).send().await.unwrap();
        let response = tokio::time::timeout(Duration::from_secs(1), txn.get_response(None))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(response.msg_code(), MsgCode::ServerErrorProxyingNotSupported);

        let request = observed_request.lock().unwrap().clone().unwrap();
        assert_eq!(request.option(PROXY_URI), Some("coap://origin.example/a/b"));
        assert_eq!(request.option(URI_HOST), None);
        assert!(request.options().get_all(URI_PATH).next().is_none());
    }

    fn notification(seq: u32) -> Message {
        let mut b = MutableMessage::new();
        b.set_msg_code(MsgCode::SuccessContent);
        b.insert_option(OBSERVE, seq).unwrap();
        b.freeze()
    }

    #[test]
    fn stale_and_out_of_order_notifications_are_dropped() {
        let forwarder = ResponseForwarder::new();
        assert!(forwarder.accept(&notification(5)));
        assert!(forwarder.accept(&notification(6)));
        // A duplicate or reordered older sequence must not replace the last accepted one.
        assert!(!forwarder.accept(&notification(5)));
        assert!(!forwarder.accept(&notification(6)));
        assert!(forwarder.accept(&notification(7)));
    }

    #[test]
    fn plain_responses_without_an_observe_option_are_always_forwarded() {
        let forwarder = ResponseForwarder::new();
        let mut b = MutableMessage::new();
        b.set_msg_code(MsgCode::SuccessContent);
        let plain = b.freeze();
        assert!(forwarder.accept(&plain));
        assert!(forwarder.accept(&plain));
    }
}
