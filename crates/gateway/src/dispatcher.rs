//! Routes a session's inbound frames.
//!
//! Heartbeats, trade history, market data, security status and deposit
//! address requests are answered by the gateway; everything else is
//! forwarded to the engine unchanged and the reply relayed back.

use crate::audit::AuditCommand;
use crate::deposit::{issue_address, resolve_cold_wallet, DepositError};
use crate::error::Result;
use crate::protocol::{
    DepositAddressRequest, HeartbeatReply, HeartbeatRequest, Inbound, InboundFrame,
    MarketDataRequest, RawMessage, RequestId, SecurityStatusRequest, ServerMessage,
    SubscriptionRequestType, TradeHistoryReply, TradeHistoryRequest, MSG_USER_RESPONSE,
    TRADE_HISTORY_COLUMNS,
};
use crate::publisher::{Feed, Publisher};
use crate::session::Session;
use crate::subscription::SubscriptionKind;
use chrono::Utc;
use external_services::TradeFilter;
use metrics::counter;
use tracing::{debug, warn};

/// What the session should do after a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Teardown(String),
}

/// Handle one frame. An `Err` is fatal for the session.
pub async fn dispatch(session: &mut Session, text: &str) -> Result<Flow> {
    let frame = InboundFrame::parse(text)?;
    session.ctx.audit.record(
        AuditCommand::In,
        session.handle.label(),
        Some(&frame.raw.redacted()),
    );

    match frame.kind {
        Inbound::Heartbeat(req) => {
            session.outbox.send(&heartbeat_reply(req));
            Ok(Flow::Continue)
        }
        Inbound::TradeHistory(req) => trade_history(session, req).await,
        Inbound::MarketData(req) => Ok(market_data(session, req)),
        Inbound::SecurityStatus(req) => Ok(security_status(session, req)),
        Inbound::DepositAddress(req) => deposit_address(session, frame.raw, req).await,
        Inbound::Forward => forward(session, frame.raw).await,
    }
}

fn heartbeat_reply(req: HeartbeatRequest) -> ServerMessage {
    ServerMessage::Heartbeat(HeartbeatReply {
        test_req_id: req.test_req_id,
        send_time: Some(req.send_time).filter(|v| !v.is_null()),
        server_timestamp: Utc::now().timestamp_millis(),
    })
}

async fn trade_history(session: &mut Session, req: TradeHistoryRequest) -> Result<Flow> {
    let page_size = req.page_size();
    let offset = req.page().saturating_mul(page_size);
    let filter = TradeFilter::from_value(&req.filter);

    let trades = session
        .ctx
        .store
        .page(
            usize::try_from(page_size).unwrap_or(usize::MAX),
            usize::try_from(offset).unwrap_or(usize::MAX),
            filter.as_ref(),
        )
        .await?;

    let page = req.page();
    session.outbox.send(&ServerMessage::TradeHistory(TradeHistoryReply {
        req_id: req.req_id,
        page,
        page_size,
        columns: TRADE_HISTORY_COLUMNS.to_vec(),
        rows: trades.iter().map(|t| t.history_row()).collect(),
    }));
    Ok(Flow::Continue)
}

fn market_data(session: &mut Session, req: MarketDataRequest) -> Flow {
    let feed = Feed::MarketData {
        market_depth: req.market_depth(),
        entry_types: req.entry_types(),
    };
    handle_subscription(
        session,
        SubscriptionKind::MarketData,
        req.request_type,
        req.req_id,
        &req.instruments,
        feed,
    );
    if !session.backend.is_connected() {
        return Flow::Teardown("trading engine disconnected".to_string());
    }
    Flow::Continue
}

fn security_status(session: &mut Session, req: SecurityStatusRequest) -> Flow {
    handle_subscription(
        session,
        SubscriptionKind::SecurityStatus,
        req.request_type,
        req.req_id,
        &req.instruments,
        Feed::SecurityStatus,
    );
    Flow::Continue
}

fn handle_subscription(
    session: &mut Session,
    kind: SubscriptionKind,
    request_type: SubscriptionRequestType,
    req_id: RequestId,
    instruments: &[String],
    feed: Feed,
) {
    match request_type {
        SubscriptionRequestType::Snapshot => {
            for symbol in instruments {
                let snapshot = match session.ctx.publishers.get(symbol) {
                    Some(publisher) => publisher.snapshot(req_id.clone(), &feed),
                    None => Publisher::empty_snapshot(symbol, req_id.clone(), &feed),
                };
                session.outbox.send(&snapshot);
            }
        }
        SubscriptionRequestType::SnapshotAndUpdates => {
            session.subscriptions.activate(
                kind,
                req_id,
                instruments,
                feed,
                &session.ctx.publishers,
                session.handle.label(),
                &session.outbox,
            );
        }
        SubscriptionRequestType::Cancel => {
            if !session.subscriptions.cancel(kind, &req_id) {
                debug!("No {:?} subscription {} to cancel", kind, req_id);
            }
        }
    }
}


async fn deposit_address(
    session: &mut Session,
    mut raw: RawMessage,
    req: DepositAddressRequest,
) -> Result<Flow> {
    let currency = req.currency.unwrap_or_default();
    let Some(cold_wallet) = resolve_cold_wallet(session.user_response.as_ref(), &currency) else {
        counter!("gateway_deposit_errors_total").increment(1);
        let err = DepositError::WalletUnavailable(currency);
        warn!("Deposit request from {}: {}", session.handle.label(), err);
        session.outbox.send(&ServerMessage::Error(err.reply(req.req_id)));
        return Ok(Flow::Continue);
    };

    let ctx = session.ctx.clone();
    let handle = session.handle.clone();
    ctx.audit.record(
        AuditCommand::Debug,
        handle.label(),
        Some(&format!(
            "requesting {} deposit address from {}",
            currency, ctx.config.payment_processor_url
        )),
    );

    let result = issue_address(
        ctx.issuer.as_ref(),
        &ctx.config.callback_url,
        ctx.config.payment_timeout,
        &cold_wallet,
        &currency,
        handle.closed(),
    )
    .await;

    match result {
        Ok(grant) => {
            counter!("gateway_deposit_addresses_total").increment(1);
            grant.apply(&mut raw);
            forward(session, raw).await
        }
        Err(DepositError::Cancelled) => Ok(Flow::Teardown(
            "session closed during deposit address issuance".to_string(),
        )),
        Err(err) => {
            counter!("gateway_deposit_errors_total").increment(1);
            session.outbox.send(&ServerMessage::Error(err.reply(req.req_id)));
            Ok(Flow::Continue)
        }
    }
}

async fn forward(session: &mut Session, raw: RawMessage) -> Result<Flow> {
    let reply = session.backend.send_message(&raw.to_json()).await?;
    if let Some(reply) = reply {
        if let Ok(msg) = RawMessage::parse(&reply) {
            if msg.msg_type() == MSG_USER_RESPONSE {
                session.user_response = Some(msg);
            }
        }
        session.outbox.send_text(reply);
    }
    if !session.backend.is_connected() {
        return Ok(Flow::Teardown("trading engine closed the connection".to_string()));
    }
    Ok(Flow::Continue)
}
