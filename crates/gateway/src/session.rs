//! Client session state machine.
//!
//! ```text
//! Connecting --engine connected, id registered--> Open
//! Connecting --connect failed / id collision----> Closed
//! Open --fatal error, engine gone, socket closed--> Closing --> Closed
//! ```
//!
//! A session owns its engine channel and subscriptions. Frames are handled
//! one at a time by the connection task; teardown runs exactly once no
//! matter how many paths ask for it.

use crate::audit::AuditCommand;
use crate::backend::{BackendChannel, PushCallback};
use crate::client::{Outbox, SessionHandle, SessionState};
use crate::dispatcher::{self, Flow};
use crate::error::GatewayError;
use crate::protocol::{RawMessage, ServerMessage};
use crate::server::GatewayContext;
use crate::subscription::SubscriptionRegistry;
use metrics::{counter, gauge};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct Session {
    pub(crate) ctx: Arc<GatewayContext>,
    pub(crate) handle: Arc<SessionHandle>,
    pub(crate) backend: Box<dyn BackendChannel>,
    pub(crate) subscriptions: SubscriptionRegistry,
    /// Last login response, used to find broker wallets.
    pub(crate) user_response: Option<RawMessage>,
    pub(crate) outbox: Outbox,
}

impl Session {
    pub fn new(ctx: Arc<GatewayContext>, remote_addr: impl Into<String>, outbox: Outbox) -> Self {
        let push_outbox = outbox.clone();
        let on_push: PushCallback = Arc::new(move |text: String| {
            push_outbox.send_text(text);
        });
        let backend = ctx.backend.open_channel(Some(on_push));
        Self {
            handle: Arc::new(SessionHandle::new(remote_addr)),
            backend,
            subscriptions: SubscriptionRegistry::new(),
            user_response: None,
            outbox,
            ctx,
        }
    }

    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        self.handle.state()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.handle.connection_id()
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn user_response(&self) -> Option<&RawMessage> {
        self.user_response.as_ref()
    }

    /// Connect to the engine and register. Returns false if the session
    /// went straight to `Closed`.
    pub async fn open(&mut self) -> bool {
        let remote = self.handle.remote_addr().to_string();
        self.ctx.audit.info("CONNECTION_OPEN", &remote);

        let id = match self.backend.connect().await {
            Ok(id) => id,
            Err(e) => {
                warn!("Engine connection for {} failed: {}", remote, e);
                counter!("gateway_backend_errors_total").increment(1);
                self.outbox.send(&GatewayError::from(e).to_server_message());
                self.abort().await;
                return false;
            }
        };

        self.handle.set_connection_id(id.clone());
        if !self.ctx.registry.register(self.handle.clone()) {
            self.outbox.send(&ServerMessage::error(
                "Connection already registered",
                format!("connection id {} is already in use", id),
            ));
            self.abort().await;
            return false;
        }

        self.handle.set_state(SessionState::Open);
        self.ctx
            .audit
            .info("REGISTER_CONNECTION", &connection_record(&remote, &id));
        counter!("gateway_connections_total").increment(1);
        gauge!("gateway_active_connections").set(self.ctx.registry.len() as f64);
        true
    }

    /// Connecting -> Closed without ever registering.
    async fn abort(&mut self) {
        self.backend.close().await;
        self.outbox.close();
        self.handle.set_state(SessionState::Closed);
    }

    /// Process one inbound text frame.
    pub async fn handle_frame(&mut self, text: &str) {
        if self.state() != SessionState::Open {
            debug!("Ignoring frame for {} in state {:?}", self.handle.label(), self.state());
            return;
        }
        if !self.backend.is_connected() {
            self.teardown("trading engine disconnected").await;
            return;
        }
        counter!("gateway_frames_in_total").increment(1);

        match dispatcher::dispatch(self, text).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Teardown(reason)) => self.teardown(&reason).await,
            Err(e) => self.reject(e).await,
        }
    }

    /// Report a fatal error to the client, then tear down.
    pub async fn reject(&mut self, err: GatewayError) {
        if self.state() != SessionState::Open {
            return;
        }
        warn!("Closing {} after error: {}", self.handle.label(), err);
        if matches!(err, GatewayError::Backend(_)) {
            counter!("gateway_backend_errors_total").increment(1);
        }
        self.outbox.send(&err.to_server_message());
        self.teardown(&err.to_string()).await;
    }

    /// Unregister, cancel subscriptions, close the engine channel and the
    /// socket. Only the first call does anything.
    pub async fn teardown(&mut self, reason: &str) {
        if !self.handle.begin_close() {
            return;
        }
        let label = self.handle.label().to_string();
        info!("Closing session {}: {}", label, reason);
        self.ctx.audit.record(AuditCommand::Debug, &label, Some(reason));

        let cancelled = self.subscriptions.cancel_all();
        if cancelled > 0 {
            debug!("Cancelled {} subscriptions for {}", cancelled, label);
        }
        if self.ctx.registry.unregister(&self.handle) {
            let record = connection_record(
                self.handle.remote_addr(),
                self.handle.connection_id().unwrap_or_default(),
            );
            self.ctx.audit.info("UNREGISTER_CONNECTION", &record);
        }
        self.backend.close().await;
        self.outbox.close();
        self.handle.set_state(SessionState::Closed);
        gauge!("gateway_active_connections").set(self.ctx.registry.len() as f64);
    }
}

fn connection_record(remote: &str, connection_id: &str) -> String {
    json!({ "remote_ip": remote, "connection_id": connection_id }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Outbound;
    use crate::testing::{frames, start_test_server, FakeConnector, FakeReply};
    use serde_json::json;

    #[tokio::test]
    async fn test_open_registers_session() {
        let connector = FakeConnector::new();
        let (server, _audit) = start_test_server(connector.clone()).await;
        let ctx = server.context();
        let (outbox, _rx) = Outbox::channel();
        let mut session = Session::new(ctx.clone(), "10.0.0.1", outbox);

        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.open().await);
        assert_eq!(session.state(), SessionState::Open);
        let id = session.connection_id().unwrap().to_string();
        assert!(ctx.registry.contains(&id));
    }

    #[tokio::test]
    async fn test_connection_lifecycle_is_audited() {
        let connector = FakeConnector::new();
        let (server, audit) = start_test_server(connector.clone()).await;
        connector.next_connection_id("conn-7");
        let (outbox, _rx) = Outbox::channel();
        let mut session = Session::new(server.context(), "10.0.0.1", outbox);

        assert!(session.open().await);
        session.teardown("bye").await;

        let lines = audit.lines();
        let find = |suffix: &str| lines.iter().position(|l| l.ends_with(suffix));
        let opened = find("INFO,CONNECTION_OPEN,10.0.0.1").unwrap();
        let registered = find(r#"INFO,REGISTER_CONNECTION,{"connection_id":"conn-7","remote_ip":"10.0.0.1"}"#).unwrap();
        let cause = find("DEBUG,conn-7,bye").unwrap();
        let unregistered =
            find(r#"INFO,UNREGISTER_CONNECTION,{"connection_id":"conn-7","remote_ip":"10.0.0.1"}"#).unwrap();
        assert!(opened < registered && registered < cause && cause < unregistered);
        assert!(!lines.iter().any(|l| l.contains("INFO,conn-7")));
    }

    #[tokio::test]
    async fn test_connect_failure_goes_straight_to_closed() {
        let connector = FakeConnector::new();
        let (server, _audit) = start_test_server(connector.clone()).await;
        connector.fail_next_connect();
        let (outbox, mut rx) = Outbox::channel();
        let mut session = Session::new(server.context(), "10.0.0.1", outbox);

        assert!(!session.open().await);
        assert_eq!(session.state(), SessionState::Closed);
        let got = frames(&mut rx);
        assert_eq!(got[0]["Description"], json!("Error establishing connection with trade"));
        assert!(server.context().registry.is_empty());
    }

    #[tokio::test]
    async fn test_connection_id_collision_is_rejected() {
        let connector = FakeConnector::new();
        let (server, _audit) = start_test_server(connector.clone()).await;
        let ctx = server.context();

        connector.next_connection_id("dup");
        let (first_outbox, _first_rx) = Outbox::channel();
        let mut first = Session::new(ctx.clone(), "10.0.0.1", first_outbox);
        assert!(first.open().await);

        connector.next_connection_id("dup");
        let (outbox, mut rx) = Outbox::channel();
        let mut second = Session::new(ctx.clone(), "10.0.0.2", outbox);
        assert!(!second.open().await);
        assert_eq!(second.state(), SessionState::Closed);
        assert_eq!(frames(&mut rx)[0]["MsgType"], json!("ERROR"));

        let registered = ctx.registry.get("dup").unwrap();
        assert!(Arc::ptr_eq(&registered, first.handle()));
        assert_eq!(first.state(), SessionState::Open);
    }

    #[tokio::test]
    async fn test_rejected_binary_frame_reports_error_and_closes() {
        let connector = FakeConnector::new();
        let (server, _audit) = start_test_server(connector.clone()).await;
        let (outbox, mut rx) = Outbox::channel();
        let mut session = Session::new(server.context(), "10.0.0.1", outbox);
        session.open().await;

        session
            .reject(GatewayError::Protocol("binary frame is not UTF-8".to_string()))
            .await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(server.context().registry.is_empty());

        let got = frames(&mut rx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0]["MsgType"], json!("ERROR"));
        assert_eq!(got[0]["Description"], json!("Invalid message"));
    }

    #[tokio::test]
    async fn test_malformed_frame_tears_down_exactly_once() {
        let connector = FakeConnector::new();
        let (server, _audit) = start_test_server(connector.clone()).await;
        let ctx = server.context();
        let (outbox, mut rx) = Outbox::channel();
        let mut session = Session::new(ctx.clone(), "10.0.0.1", outbox);
        session.open().await;
        let closes_before = connector.close_count();

        session.handle_frame("{not json").await;
        assert_eq!(session.state(), SessionState::Closed);
        session.teardown("socket closed").await;
        session.handle_frame(r#"{"MsgType":"1","TestReqID":"x"}"#).await;

        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        assert_eq!(items.len(), 2);
        match &items[0] {
            Outbound::Frame(text) => assert!(text.contains("Invalid message")),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(items[1], Outbound::Close);
        assert_eq!(connector.close_count(), closes_before + 1);
        assert!(ctx.registry.is_empty());
    }

    #[tokio::test]
    async fn test_engine_disconnect_after_call_tears_down() {
        let connector = FakeConnector::new();
        let (server, _audit) = start_test_server(connector.clone()).await;
        let (outbox, mut rx) = Outbox::channel();
        let mut session = Session::new(server.context(), "10.0.0.1", outbox);
        session.open().await;

        connector.respond_with(|_| FakeReply::Disconnect(Some(r#"{"MsgType":"BF","UserStatus":3}"#.to_string())));
        session.handle_frame(r#"{"MsgType":"BE","Username":"a","Password":"b"}"#).await;

        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(frames(&mut rx)[0]["MsgType"], json!("BF"));
    }

    #[tokio::test]
    async fn test_engine_failure_sends_error_and_closes() {
        let connector = FakeConnector::new();
        let (server, _audit) = start_test_server(connector.clone()).await;
        let (outbox, mut rx) = Outbox::channel();
        let mut session = Session::new(server.context(), "10.0.0.1", outbox);
        session.open().await;

        connector.respond_with(|_| FakeReply::Fail("timed out".to_string()));
        session.handle_frame(r#"{"MsgType":"D","ClOrdID":"1"}"#).await;

        assert_eq!(session.state(), SessionState::Closed);
        let got = frames(&mut rx);
        assert_eq!(got[0]["MsgType"], json!("ERROR"));
        assert_eq!(got[0]["Description"], json!("Invalid message"));
    }

    #[tokio::test]
    async fn test_engine_pushes_reach_client() {
        let connector = FakeConnector::new();
        let (server, _audit) = start_test_server(connector.clone()).await;
        let (outbox, mut rx) = Outbox::channel();
        let mut session = Session::new(server.context(), "10.0.0.1", outbox);
        session.open().await;

        let id = session.connection_id().unwrap().to_string();
        assert!(connector.push(&id, r#"{"MsgType":"8","ExecType":"0"}"#));
        assert_eq!(frames(&mut rx)[0]["MsgType"], json!("8"));
    }
}
