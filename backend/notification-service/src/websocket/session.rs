/// WebSocket session actors
///
/// `WsSession` drains the connection's outbound queue onto the socket and feeds
/// inbound frames to the protocol handler. `RejectedSession` exists only to
/// send an authentication close code to a socket that was never admitted.
use actix::{Actor, ActorContext, AsyncContext, StreamHandler};
use actix_web::web;
use actix_web_actors::ws::{self, CloseCode, CloseReason};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::connection::{ConnectionId, Frame, FrameReceiver};
use super::messages::error_codes;
use super::protocol::handle_text_frame;
use super::service::RealtimeService;
use crate::auth::{AuthError, Identity};

pub struct WsSession {
    id: ConnectionId,
    identity: Identity,
    service: web::Data<RealtimeService>,
    outbound: Option<FrameReceiver>,
}

impl WsSession {
    pub fn new(
        id: ConnectionId,
        identity: Identity,
        service: web::Data<RealtimeService>,
        outbound: FrameReceiver,
    ) -> Self {
        Self {
            id,
            identity,
            service,
            outbound: Some(outbound),
        }
    }
}

impl Actor for WsSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        if let Some(outbound) = self.outbound.take() {
            ctx.add_stream(UnboundedReceiverStream::new(outbound));
        }
        tracing::debug!(connection_id = %self.id, user_id = %self.identity.user_id, "session started");
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.service.disconnect(self.id);
    }
}

/// Frames queued by the dispatcher, heartbeat or shutdown
impl StreamHandler<Frame> for WsSession {
    fn handle(&mut self, frame: Frame, ctx: &mut Self::Context) {
        match frame {
            Frame::Text(text) => ctx.text(text),
            Frame::Ping => ctx.ping(b""),
            Frame::Close { code, reason } => {
                ctx.close(Some(CloseReason {
                    code: CloseCode::from(code),
                    description: Some(reason),
                }));
                ctx.stop();
            }
        }
    }

    // registry dropped the sender
    fn finished(&mut self, ctx: &mut Self::Context) {
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        match msg {
            Ok(ws::Message::Ping(payload)) => ctx.pong(&payload),
            Ok(ws::Message::Pong(_)) => {
                self.service.registry().mark_alive(self.id);
            }
            Ok(ws::Message::Text(text)) => {
                let outcome =
                    handle_text_frame(self.service.manager(), self.id, &self.identity, &text);
                tracing::trace!(connection_id = %self.id, ?outcome, "client frame handled");
            }
            Ok(ws::Message::Binary(_)) => {
                tracing::warn!(connection_id = %self.id, "binary frames not supported");
                self.service.manager().send_error(
                    self.id,
                    error_codes::UNSUPPORTED_FRAME,
                    "Binary frames are not supported",
                );
            }
            Ok(ws::Message::Close(reason)) => {
                tracing::debug!(connection_id = %self.id, ?reason, "client closed socket");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) | Ok(ws::Message::Nop) => {}
            Err(e) => {
                tracing::warn!(connection_id = %self.id, error = %e, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Upgraded only to be closed with the authentication failure code
pub struct RejectedSession {
    error: AuthError,
}

impl RejectedSession {
    pub fn new(error: AuthError) -> Self {
        Self { error }
    }
}

impl Actor for RejectedSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.close(Some(CloseReason {
            code: CloseCode::from(self.error.close_code()),
            description: Some(self.error.close_reason().to_string()),
        }));
        ctx.stop();
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for RejectedSession {
    fn handle(&mut self, _msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        ctx.stop();
    }
}
