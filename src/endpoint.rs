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

//! Ties a [`Transport`] to the message layer, the transaction table, and a resource tree,
//! and drives the receive loop that feeds inbound datagrams to all three. Mirrors the
//! teacher's `LocalEndpoint`/`receive_loop_arc` split (`local_endpoint.rs`,
//! `receive_as_stream.rs`): one task per registered transport repeatedly calls
//! `transport.receive()` and routes what comes back, rather than requiring callers to drive
//! the loop themselves.

use crate::behavior::BehaviorContext;
use crate::blockwise::{Block1Outcome, BlockwiseRegistry};
use crate::error::Error;
use crate::message::{Message, MsgCode, MsgToken, MsgType, MutableMessage};
use crate::message_layer::{AckOutcome, MessageLayer};
use crate::option::{OptionNumber, BLOCK1, BLOCK2, OBSERVE, URI_PATH};
use crate::resource::{InboundRequest, Resource};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::transaction::TransactionTable;
use crate::transport::Transport;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// The server's self-imposed cap on `Block2` size, independent of what a client requests.
const MAX_BLOCK2_SZX: u8 = 6; // 1024-byte blocks.

/// Inspects (and may veto) every inbound datagram before it reaches dedup/dispatch, e.g. for
/// access logging or simple filtering. Returning `false` silently drops the message.
pub type Interceptor = Arc<dyn Fn(&Message, SocketAddr) -> bool + Send + Sync>;

/// Everything needed to speak CoAP over one registered [`Transport`]: message-layer
/// reliability, token-keyed transaction correlation, the resource tree this endpoint serves
/// (empty for a pure client), and inbound block-wise reassembly state.
pub struct LocalEndpoint {
    scheme: String,
    transport: Arc<dyn Transport>,
    message_layer: Arc<MessageLayer>,
    transactions: Arc<TransactionTable>,
    resources: Arc<Resource>,
    blockwise: BlockwiseRegistry,
    max_block1_size: Mutex<usize>,
    receive_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for LocalEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEndpoint").field("scheme", &self.scheme).finish_non_exhaustive()
    }
}

impl LocalEndpoint {
    /// The URI scheme this endpoint was registered under.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The message layer driving CON/NON/ACK/RST reliability for this endpoint.
    pub fn message_layer(&self) -> &Arc<MessageLayer> {
        &self.message_layer
    }

    /// The token-keyed transaction table for requests sent through this endpoint.
    pub fn transactions(&self) -> &Arc<TransactionTable> {
        &self.transactions
    }

    /// The root of the resource tree this endpoint serves.
    pub fn resources(&self) -> &Arc<Resource> {
        &self.resources
    }

    /// The underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Sets the cap, in bytes, on a reassembled `Block1` request body. Requests exceeding it
    /// are rejected with `4.13 Request Entity Too Large`.
    pub fn set_max_block1_size(&self, bytes: usize) {
        *self.max_block1_size.lock().unwrap() = bytes;
    }

    async fn receive_loop(self: Arc<Self>, interceptor: Mutex<Option<Interceptor>>) {
        loop {
            let datagram = match self.transport.receive().await {
                Ok(datagram) => datagram,
                Err(_) => return,
            };

            let message = match Message::try_from_bytes(&datagram.bytes) {
                Ok(message) => message,
                Err(_) => continue,
            };

            if let Some(cb) = interceptor.lock().unwrap().as_ref() {
                if !cb(&message, datagram.from) {
                    continue;
                }
            }

            self.clone().handle_inbound(message, datagram.from).await;
        }
    }

    async fn handle_inbound(self: Arc<Self>, message: Message, from: SocketAddr) {
        match message.msg_type() {
            MsgType::Ack => {
                let piggybacked = if message.msg_code().is_empty() { None } else { Some(message.clone()) };
                self.message_layer.handle_ack(message.msg_id(), from, piggybacked);
                return;
            }
            MsgType::Rst => {
                self.message_layer.handle_rst(message.msg_id(), from);
                return;
            }
            _ => {}
        }

        if message.msg_code().is_method() {
            self.handle_request(message, from).await;
        } else if !message.msg_code().is_empty() {
            // A separate (non-piggybacked) response or an observe notification.
            if message.is_confirmable() {
                let mut ack = MutableMessage::new();
                ack.set_msg_type(MsgType::Ack).set_msg_id(message.msg_id());
                let _ = self.message_layer.send_empty(&ack.freeze(), from).await;
            }
            self.transactions.deliver_response((message.msg_token(), from), &message);
        } else {
            // Empty CON: a ping. Reply with a matching RST (RFC 7252 §4.3).
            if message.is_confirmable() {
                let mut rst = MutableMessage::new();
                rst.set_msg_type(MsgType::Rst).set_msg_id(message.msg_id());
                let _ = self.message_layer.send_empty(&rst.freeze(), from).await;
            }
        }
    }

    async fn handle_request(self: Arc<Self>, mut message: Message, from: SocketAddr) {
        let dedup = self.message_layer.check_inbound_duplicate(message.msg_id(), from, message.msg_type());
        match dedup {
            crate::dedup::DedupStatus::Fresh => {}
            crate::dedup::DedupStatus::DuplicateInFlight => return,
            crate::dedup::DedupStatus::DuplicateWithResponse(bytes) => {
                let _ = self.transport.send_to(bytes, from).await;
                return;
            }
        }

        let path: Vec<String> = message.options().get_all(URI_PATH).map(String::from).collect();
        let path_refs: Vec<&str> = path.iter().map(String::as_str).collect();
        let path_key = path.join("/");

        if let Some(block1) = message.option(BLOCK1) {
            let cap = *self.max_block1_size.lock().unwrap();
            let key = (from, message.msg_token(), path_key.clone());
            match self.blockwise.feed_block1(key, block1, message.payload(), cap) {
                Ok(Block1Outcome::Continue) => {
                    let mut reply = MutableMessage::new();
                    reply.set_msg_code(MsgCode::SuccessContinue);
                    let _ = reply.insert_option(BLOCK1, block1);
                    self.reply(&mut reply, from, &message).await;
                    return;
                }
                Ok(Block1Outcome::Complete(body)) => {
                    message = replace_payload(&message, body);
                }
                Err(error) => {
                    let code = match error {
                        Error::RequestEntityTooLarge => MsgCode::ClientErrorRequestEntityTooLarge,
                        _ => MsgCode::ClientErrorRequestEntityIncomplete,
                    };
                    let mut reply = MutableMessage::new();
                    reply.set_msg_code(code);
                    self.reply(&mut reply, from, &message).await;
                    return;
                }
            }
        }

        let observe_request = message.observe();
        let resource = self.resources.resolve(&path_refs);

        let mut observe_seq = None;
        if let Some(resource) = &resource {
            if let Some(observable) = resource.observable() {
                match observe_request {
                    Some(crate::consts::OBSERVE_REGISTER) => {
                        observe_seq = Some(observable.subscribe((message.msg_token(), from)));
                    }
                    Some(crate::consts::OBSERVE_DEREGISTER) => {
                        observable.unsubscribe((message.msg_token(), from));
                    }
                    _ => {}
                }
            }
        }

        let ctx = InboundRequest::new(&message, from);
        let mut response = self.resources.dispatch(&path_refs, &ctx);

        if let Some(seq) = observe_seq {
            let _ = response.insert_option(OBSERVE, seq);
        }

        if let Some(block2) = message.option(BLOCK2) {
            let frozen = response.clone().freeze();
            let (chunk, info) = crate::blockwise::block2_chunk(frozen.payload(), block2, MAX_BLOCK2_SZX);
            let mut rebuilt = MutableMessage::new();
            rebuilt.set_msg_code(frozen.msg_code());
            for (number, value) in frozen.options().iter() {
                if number != OptionNumber::BLOCK2 {
                    let _ = rebuilt.insert_option_with_bytes(number, value);
                }
            }
            let _ = rebuilt.insert_option(BLOCK2, info);
            rebuilt.append_payload_bytes(chunk);
            response = rebuilt;
        }

        self.reply(&mut response, from, &message).await;
    }

    /// Finishes building a response to `request`: sets its type (ACK for a CON request, NON
    /// for a NON one), its token, and its message id (the request's own id for an ACK, a
    /// freshly allocated one for a NON reply, since NON responses are independent messages).
    /// Then records the reply bytes for dedup replay and sends them.
    async fn reply(&self, response: &mut MutableMessage, dest: SocketAddr, request: &Message) {
        let reply_type = ack_or_non(request.msg_type());
        let mid = if reply_type == MsgType::Ack { request.msg_id() } else { self.message_layer.next_msg_id() };
        response
            .set_msg_type(reply_type)
            .set_msg_id(mid)
            .set_msg_token(request.msg_token());

        let frozen = response.clone().freeze();
        if let Ok(bytes) = frozen.to_bytes() {
            self.message_layer.store_duplicate_response(request.msg_id(), dest, bytes.clone());
            let _ = self.transport.send_to(bytes, dest).await;
        }
    }

    /// Pushes a notification to every current subscriber of `resource`'s `Observable`,
    /// building the response body the same way a direct `GET` would.
    pub async fn notify(self: &Arc<Self>, resource: &Arc<Resource>, confirmable: bool) {
        let Some(observable) = resource.observable() else { return };
        let seq = observable.next_sequence();

        for (token, addr) in observable.subscriber_keys() {
            let fake_request = {
                let mut builder = MutableMessage::new();
                builder.set_msg_code(MsgCode::MethodGet).set_msg_token(token);
                builder.freeze()
            };
            let ctx = InboundRequest::new(&fake_request, addr);
            let mut notification = resource.dispatch(&[], &ctx);
            let _ = notification.insert_option(OBSERVE, seq);
            notification.set_msg_token(token);

            if confirmable {
                let mid = self.message_layer.next_msg_id();
                notification.set_msg_type(MsgType::Con).set_msg_id(mid);
                let frozen = notification.freeze();
                if let Ok(bytes) = frozen.to_bytes() {
                    let observable = observable.clone();
                    let layer = self.message_layer.clone();
                    let key = (token, addr);
                    let _ = layer.send_confirmable(&frozen, addr, move |outcome| {
                        match outcome {
                            AckOutcome::Acknowledged(_) => {
                                observable.record_notification_success(key);
                            }
                            AckOutcome::Reset => {
                                observable.unsubscribe(key);
                            }
                            AckOutcome::TimedOut => {
                                observable.record_notification_timeout(key);
                            }
                        }
                    });
                }
            } else {
                notification.set_msg_type(MsgType::Non).set_msg_id(self.message_layer.next_msg_id());
                let frozen = notification.freeze();
                if let Ok(bytes) = frozen.to_bytes() {
                    let _ = self.transport.send_to(bytes, addr).await;
                }
            }
        }
    }

    /// Sends a final `5.03 Service Unavailable` to every subscriber and clears the
    /// subscription set, for a resource that is going away.
    pub async fn eject_observers(&self, resource: &Arc<Resource>) {
        let Some(observable) = resource.observable() else { return };
        for (token, addr) in observable.eject_observers() {
            let mut msg = MutableMessage::new();
            msg.set_msg_type(MsgType::Non)
                .set_msg_id(self.message_layer.next_msg_id())
                .set_msg_token(token)
                .set_msg_code(MsgCode::ServerErrorServiceUnavailable);
            if let Ok(bytes) = msg.freeze().to_bytes() {
                let _ = self.transport.send_to(bytes, addr).await;
            }
        }
    }

    /// Sends an empty confirmable message (a "ping") and resolves once it is answered with a
    /// RST (the expected reply to an empty CON per RFC 7252 §4.3) or times out.
    pub fn ping(self: &Arc<Self>, dest: SocketAddr) -> impl std::future::Future<Output = Result<(), Error>> {
        let mid = self.message_layer.next_msg_id();
        let mut msg = MutableMessage::new();
        msg.set_msg_type(MsgType::Con).set_msg_id(mid);
        let layer = self.message_layer.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let send_result = layer.send_confirmable(&msg.freeze(), dest, move |outcome| {
            let _ = tx.send(outcome);
        });
        async move {
            send_result?;
            match rx.await {
                Ok(AckOutcome::Reset) => Ok(()),
                Ok(AckOutcome::TimedOut) => Err(Error::TransmitTimeout),
                Ok(AckOutcome::Acknowledged(_)) => Err(Error::MalformedResponse),
                Err(_) => Err(Error::Cancelled),
            }
        }
    }

    fn shutdown(&self) {
        self.transport.close();
        if let Some(task) = self.receive_task.lock().unwrap().take() {
            task.abort();
        }
        self.transactions.cancel_all(false);
    }
}

fn ack_or_non(request_type: MsgType) -> MsgType {
    if request_type == MsgType::Con {
        MsgType::Ack
    } else {
        MsgType::Non
    }
}

fn replace_payload(message: &Message, payload: Vec<u8>) -> Message {
    let mut builder = MutableMessage::new();
    builder
        .set_msg_type(message.msg_type())
        .set_msg_code(message.msg_code())
        .set_msg_id(message.msg_id())
        .set_msg_token(message.msg_token());
    for (number, value) in message.options().iter() {
        if number != crate::option::OptionNumber::BLOCK1 {
            let _ = builder.insert_option_with_bytes(number, value);
        }
    }
    builder.append_payload_bytes(&payload);
    builder.freeze()
}

/// Owns every registered [`LocalEndpoint`] plus the defaults new ones are created with:
/// a shared [`Scheduler`], a default [`BehaviorContext`], and an optional [`Interceptor`].
pub struct EndpointManager {
    scheduler: Arc<dyn Scheduler>,
    default_behavior: Mutex<BehaviorContext>,
    default_interceptor: Mutex<Option<Interceptor>>,
    endpoints: Mutex<HashMap<String, Arc<LocalEndpoint>>>,
}

impl std::fmt::Debug for EndpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointManager")
            .field("schemes", &self.endpoints.lock().unwrap().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl EndpointManager {
    /// Creates a manager driven by `scheduler`, with no endpoints registered yet.
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Arc<EndpointManager> {
        Arc::new(EndpointManager {
            scheduler,
            default_behavior: Mutex::new(BehaviorContext::default()),
            default_interceptor: Mutex::new(None),
            endpoints: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a manager backed by the ambient Tokio runtime's timers.
    pub fn with_tokio_scheduler() -> Arc<EndpointManager> {
        EndpointManager::new(Arc::new(TokioScheduler::new()))
    }

    /// Returns the default [`BehaviorContext`] newly-registered endpoints are given.
    pub fn get_default_behavior_context(&self) -> BehaviorContext {
        *self.default_behavior.lock().unwrap()
    }

    /// Sets the default [`BehaviorContext`] newly-registered endpoints are given. Endpoints
    /// already registered keep the context they were created with.
    pub fn set_default_behavior_context(&self, behavior: BehaviorContext) {
        *self.default_behavior.lock().unwrap() = behavior;
    }

    /// Returns the current default [`Interceptor`], if one is set.
    pub fn get_default_interceptor(&self) -> Option<Interceptor> {
        self.default_interceptor.lock().unwrap().clone()
    }

    /// Sets the [`Interceptor`] applied to every inbound datagram on endpoints registered
    /// from this point forward.
    pub fn set_default_interceptor(&self, interceptor: impl Fn(&Message, SocketAddr) -> bool + Send + Sync + 'static) {
        *self.default_interceptor.lock().unwrap() = Some(Arc::new(interceptor));
    }

    /// Registers `transport` under `scheme`, serving `resources` as its resource tree (pass
    /// [`Resource::new()`] for a pure client endpoint), and spawns its receive loop.
    pub fn register_transport(
        self: &Arc<Self>,
        scheme: impl Into<String>,
        transport: Arc<dyn Transport>,
        resources: Arc<Resource>,
    ) -> Arc<LocalEndpoint> {
        let scheme = scheme.into();
        let behavior = *self.default_behavior.lock().unwrap();
        let message_layer = MessageLayer::new(transport.clone(), self.scheduler.clone(), behavior);

        let endpoint = Arc::new(LocalEndpoint {
            scheme: scheme.clone(),
            transport,
            message_layer,
            transactions: TransactionTable::new(),
            resources,
            blockwise: BlockwiseRegistry::new(),
            max_block1_size: Mutex::new(64 * 1024),
            receive_task: Mutex::new(None),
        });

        let interceptor = Mutex::new(self.default_interceptor.lock().unwrap().clone());
        let loop_endpoint = endpoint.clone();
        let task = tokio::spawn(async move {
            loop_endpoint.receive_loop(interceptor).await;
        });
        *endpoint.receive_task.lock().unwrap() = Some(task);

        self.endpoints.lock().unwrap().insert(scheme, endpoint.clone());
        endpoint
    }

    /// Returns the endpoint registered for `scheme`, if any.
    pub fn local_endpoint_for_scheme(&self, scheme: &str) -> Option<Arc<LocalEndpoint>> {
        self.endpoints.lock().unwrap().get(scheme).cloned()
    }

    /// Closes every registered endpoint (closing its transport, aborting its receive loop,
    /// and cancelling its outstanding transactions) and shuts down the scheduler.
    pub fn close(&self) {
        for endpoint in self.endpoints.lock().unwrap().values() {
            endpoint.shutdown();
        }
        self.scheduler.shutdown();
    }
}
