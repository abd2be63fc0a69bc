//! # Translation WebSocket
//!
//! The actor that owns one translation socket.
//!
//! ## Protocol Flow:
//! 1. Client opens `/ws/translation`; a session is registered in CONNECTING
//! 2. Client sends `INIT` with its translation config
//! 3. Client streams binary audio frames; each starts one pipeline
//! 4. Server streams `TEXT_RESULT` / `TRANSLATION` / `AUDIO_RESULT` and a
//!    completion marker back for every frame
//! 5. `CLOSE`, a transport error or the idle reaper ends the session
//!
//! ## Rust Concepts Used:
//! - **Actor Model**: each socket is an actix actor with its own mailbox
//! - **Message Passing**: pipeline tasks running on tokio reach the socket
//!   through [`ActorSink`], which posts [`Outbound`] frames to the actor
//! - **Trait objects**: the session layer only sees `Arc<dyn FrameSink>`,
//!   so it is tested without a real socket

use crate::session::{CloseCode, Connection, FrameSink, OutboundFrame, SessionServices, TransportClosed};
use crate::state::AppState;
use actix::prelude::*;
use actix_web::{web, HttpRequest, HttpResponse, Result as ActixResult};
use actix_web_actors::ws;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// A frame for the socket to write.
#[derive(Message)]
#[rtype(result = "()")]
struct Outbound(OutboundFrame);

/// Frame sink backed by the actor's mailbox. `do_send` ignores the mailbox
/// capacity so a burst of chunk frames is never refused.
struct ActorSink {
    addr: Addr<TranslationSocket>,
    open: Arc<AtomicBool>,
}

impl FrameSink for ActorSink {
    fn send(&self, frame: OutboundFrame) -> Result<(), TransportClosed> {
        if !self.is_open() {
            return Err(TransportClosed);
        }
        self.addr.do_send(Outbound(frame));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.addr.connected()
    }
}

pub struct TranslationSocket {
    services: SessionServices,
    connection: Option<Connection>,
    open: Arc<AtomicBool>,
}

impl TranslationSocket {
    pub fn new(services: SessionServices) -> Self {
        Self {
            services,
            connection: None,
            open: Arc::new(AtomicBool::new(true)),
        }
    }
}

fn ws_close_code(code: CloseCode) -> ws::CloseCode {
    match code {
        CloseCode::Normal => ws::CloseCode::Normal,
        CloseCode::Away => ws::CloseCode::Away,
        CloseCode::Error => ws::CloseCode::Error,
        CloseCode::Policy => ws::CloseCode::Policy,
    }
}

impl Actor for TranslationSocket {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        let sink = Arc::new(ActorSink {
            addr: ctx.address(),
            open: Arc::clone(&self.open),
        });
        self.connection = Some(Connection::open(self.services.clone(), sink));
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(connection) = self.connection.take() {
            info!(session_id = %connection.id(), "WebSocket connection stopped");
            connection.on_closed();
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for TranslationSocket {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let Some(connection) = &self.connection else {
            return;
        };

        match msg {
            Ok(ws::Message::Text(text)) => {
                connection.on_text(&text);
            }
            Ok(ws::Message::Binary(data)) => {
                debug!(session_id = %connection.id(), bytes = data.len(), "Received audio frame");
                connection.on_binary(data.to_vec());
            }
            Ok(ws::Message::Ping(data)) => {
                ctx.pong(&data);
            }
            Ok(ws::Message::Pong(_)) => {
                connection.on_pong();
            }
            Ok(ws::Message::Close(reason)) => {
                info!(session_id = %connection.id(), reason = ?reason, "Client closed the socket");
                ctx.close(reason);
                ctx.stop();
            }
            Ok(ws::Message::Continuation(_)) => {
                warn!(session_id = %connection.id(), "Received unexpected continuation frame");
            }
            Ok(ws::Message::Nop) => {}
            Err(err) => {
                error!(session_id = %connection.id(), error = %err, "WebSocket protocol error");
                connection.on_transport_error(&err.to_string());
                ctx.stop();
            }
        }
    }
}

impl Handler<Outbound> for TranslationSocket {
    type Result = ();

    fn handle(&mut self, msg: Outbound, ctx: &mut Self::Context) {
        match msg.0 {
            OutboundFrame::Text(text) => ctx.text(text),
            OutboundFrame::Ping(payload) => ctx.ping(&payload),
            OutboundFrame::Close { code, reason } => {
                self.open.store(false, Ordering::SeqCst);
                ctx.close(Some(ws::CloseReason {
                    code: ws_close_code(code),
                    description: Some(reason),
                }));
                ctx.stop();
            }
        }
    }
}

/// WebSocket endpoint for `/ws/translation` and `/api/translation`.
pub async fn translation_websocket(
    req: HttpRequest,
    stream: web::Payload,
    state: web::Data<AppState>,
) -> ActixResult<HttpResponse> {
    info!(peer = ?req.connection_info().peer_addr(), "New translation socket request");

    let max_frame_bytes = state.get_config().session.max_frame_bytes;
    let socket = TranslationSocket::new(state.services());

    ws::WsResponseBuilder::new(socket, &req, stream)
        .frame_size(max_frame_bytes)
        .start()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::providers::ProviderRegistry;
    use actix_web::http::StatusCode;
    use actix_web::{test, App};

    fn app_state() -> web::Data<AppState> {
        let config = AppConfig::default();
        let providers = ProviderRegistry::from_config(&config).unwrap();
        web::Data::new(AppState::new(config, providers))
    }

    #[actix_web::test]
    async fn test_close_codes_map_to_websocket_codes() {
        assert_eq!(ws_close_code(CloseCode::Normal), ws::CloseCode::Normal);
        assert_eq!(ws_close_code(CloseCode::Away), ws::CloseCode::Away);
        assert_eq!(ws_close_code(CloseCode::Error), ws::CloseCode::Error);
    }

    #[actix_web::test]
    async fn test_plain_get_is_not_upgraded() {
        let app = test::init_service(
            App::new()
                .app_data(app_state())
                .route("/ws/translation", web::get().to(translation_websocket)),
        )
        .await;

        let req = test::TestRequest::get().uri("/ws/translation").to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[actix_web::test]
    async fn test_handshake_switches_protocols() {
        let app = test::init_service(
            App::new()
                .app_data(app_state())
                .route("/ws/translation", web::get().to(translation_websocket)),
        )
        .await;

        let req = test::TestRequest::get()
            .uri("/ws/translation")
            .insert_header(("upgrade", "websocket"))
            .insert_header(("connection", "upgrade"))
            .insert_header(("sec-websocket-version", "13"))
            .insert_header(("sec-websocket-key", "x3JJHMbDL1EzLkh9GBhXDw=="))
            .to_request();
        let resp = test::call_service(&app, req).await;

        assert_eq!(resp.status(), StatusCode::SWITCHING_PROTOCOLS);
    }
}
