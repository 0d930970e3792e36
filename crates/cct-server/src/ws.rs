use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use cct_core::sdk::{ContentBlock, SdkMessage};
use cct_core::PermissionRequest;

use crate::protocol::{describe_permission_request, status_filter_from_str, InboundMessage, OutboundMessage};
use crate::state::AppState;

const OUTBOUND_BUFFER: usize = 64;

pub async fn agent_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let Some(_guard) = state.try_acquire_connection() else {
        let (mut sink, _) = socket.split();
        let frame = OutboundMessage::Error {
            message: "connection capacity exceeded".into(),
        };
        let _ = send(&mut sink, &frame).await;
        return;
    };

    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<OutboundMessage>(OUTBOUND_BUFFER);

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if send(&mut sink, &frame).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        let Message::Text(text) = msg else {
            if matches!(msg, Message::Close(_)) {
                break;
            }
            continue;
        };

        let inbound: InboundMessage = match serde_json::from_str(&text) {
            Ok(m) => m,
            Err(e) => {
                let _ = outbound_tx
                    .send(OutboundMessage::Error {
                        message: format!("unrecognized frame: {e}"),
                    })
                    .await;
                continue;
            }
        };

        dispatch(inbound, &state, &outbound_tx).await;
    }

    writer.abort();
}

async fn send(
    sink: &mut (impl SinkExt<Message> + Unpin),
    frame: &OutboundMessage,
) -> Result<(), ()> {
    let json = serde_json::to_string(frame).map_err(|_| ())?;
    sink.send(Message::Text(json)).await.map_err(|_| ())
}

async fn dispatch(msg: InboundMessage, state: &AppState, outbound: &mpsc::Sender<OutboundMessage>) {
    match msg {
        InboundMessage::Auth { .. } => {
            let _ = outbound.send(OutboundMessage::AuthSuccess {}).await;
        }

        InboundMessage::CreateSession { session_id, options } => {
            match state.manager.create_session(session_id, options).await {
                Ok(session) => {
                    let _ = outbound
                        .send(OutboundMessage::SessionCreated { session_id, session, status: "created" })
                        .await;
                }
                Err(e) => {
                    let _ = outbound.send(OutboundMessage::Error { message: e.to_string() }).await;
                }
            }
        }

        InboundMessage::SendPrompt { session_id, prompt, content } => {
            let result = if let Some(blocks) = content {
                state.manager.send_prompt_with_content(session_id, blocks).await
            } else {
                state.manager.send_prompt(session_id, prompt.unwrap_or_default()).await
            };

            if let Err(e) = result {
                let _ = outbound
                    .send(OutboundMessage::AgentError { session_id, error: e.to_string() })
                    .await;
                return;
            }

            let Ok(agent) = state.manager.agent_handle(session_id).await else {
                return;
            };

            if agent
                .forwarder_started
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                spawn_permission_forwarder(session_id, agent.permission_channel(), outbound.clone());
            }

            spawn_response_drainer(session_id, agent.response_channel(), outbound.clone());
        }

        InboundMessage::EndSession { session_id } => match state.manager.end_session(session_id).await {
            Ok(()) => {
                let _ = outbound.send(OutboundMessage::SessionEnded { session_id }).await;
            }
            Err(e) => {
                let _ = outbound.send(OutboundMessage::Error { message: e.to_string() }).await;
            }
        },

        InboundMessage::InterruptSession { session_id } => {
            match state.manager.interrupt_session(session_id).await {
                Ok(()) => {
                    let _ = outbound
                        .send(OutboundMessage::SessionInterrupted { session_id })
                        .await;
                }
                Err(e) => {
                    let _ = outbound.send(OutboundMessage::Error { message: e.to_string() }).await;
                }
            }
        }

        InboundMessage::DeleteSession { session_id } => {
            match state.manager.delete_session(session_id).await {
                Ok(()) => {
                    let _ = outbound.send(OutboundMessage::SessionDeleted { session_id }).await;
                }
                Err(e) => {
                    let _ = outbound.send(OutboundMessage::Error { message: e.to_string() }).await;
                }
            }
        }

        InboundMessage::DeleteAllSessions {} => match state.manager.delete_all_sessions().await {
            Ok(count) => {
                let _ = outbound.send(OutboundMessage::AllSessionsDeleted { count }).await;
            }
            Err(e) => {
                let _ = outbound.send(OutboundMessage::Error { message: e.to_string() }).await;
            }
        },

        InboundMessage::KillAllAgents {} => match state.manager.end_all_sessions().await {
            Ok(count) => {
                let _ = outbound.send(OutboundMessage::AgentsKilled { count }).await;
            }
            Err(e) => {
                let _ = outbound.send(OutboundMessage::Error { message: e.to_string() }).await;
            }
        },

        InboundMessage::ListSessions { status } => {
            let filter = status_filter_from_str(status.as_deref());
            match state.manager.list_sessions(filter).await {
                Ok(sessions) => {
                    let _ = outbound.send(OutboundMessage::SessionsList { sessions }).await;
                }
                Err(e) => {
                    let _ = outbound.send(OutboundMessage::Error { message: e.to_string() }).await;
                }
            }
        }

        InboundMessage::LoadMessages { session_id, limit, offset } => {
            match state.manager.load_messages(session_id, limit, offset).await {
                Ok((messages, has_more)) => {
                    let _ = outbound
                        .send(OutboundMessage::MessagesLoaded {
                            session_id,
                            count: messages.len(),
                            limit,
                            offset,
                            has_more,
                            messages,
                        })
                        .await;
                }
                Err(e) => {
                    let _ = outbound.send(OutboundMessage::Error { message: e.to_string() }).await;
                }
            }
        }

        InboundMessage::PermissionResponse {
            session_id,
            permission_id,
            approved,
            updated_input,
            deny_message,
        } => {
            let response = InboundMessage::to_core_permission_response(
                permission_id,
                approved,
                updated_input,
                deny_message,
            );
            let _ = state.manager.submit_permission_response(session_id, response).await;
            let _ = outbound
                .send(OutboundMessage::PermissionAcknowledged { permission_id })
                .await;
        }

        InboundMessage::Ping {} => {
            let _ = outbound.send(OutboundMessage::Pong {}).await;
        }
    }
}

fn spawn_permission_forwarder(
    session_id: Uuid,
    channel: Arc<Mutex<mpsc::Receiver<PermissionRequest>>>,
    outbound: mpsc::Sender<OutboundMessage>,
) {
    tokio::spawn(async move {
        loop {
            let request = {
                let mut rx = channel.lock().await;
                rx.recv().await
            };
            let Some(request) = request else { break };
            let description = describe_permission_request(&request.tool_name, &request.input);
            let frame = OutboundMessage::PermissionRequest {
                session_id,
                permission_id: request.request_id,
                tool: request.tool_name.clone(),
                action: request.tool_name,
                details: request.input,
                description,
            };
            if outbound.send(frame).await.is_err() {
                break;
            }
        }
    });
}

fn spawn_response_drainer(
    session_id: Uuid,
    channel: Arc<Mutex<mpsc::Receiver<SdkMessage>>>,
    outbound: mpsc::Sender<OutboundMessage>,
) {
    tokio::spawn(async move {
        loop {
            let message = {
                let mut rx = channel.lock().await;
                rx.recv().await
            };
            let Some(message) = message else { break };

            if let SdkMessage::System { payload } = &message {
                if payload.get("event").and_then(|v| v.as_str()) == Some("branch_changed") {
                    let git_branch = payload.get("branch").and_then(|v| v.as_str()).map(str::to_string);
                    let _ = outbound
                        .send(OutboundMessage::SessionUpdated { session_id, git_branch })
                        .await;
                    continue;
                }
            }

            if let SdkMessage::Assistant { blocks } = &message {
                for block in blocks {
                    match block {
                        ContentBlock::Thinking { text } => {
                            let _ = outbound
                                .send(OutboundMessage::AgentThinking { session_id, text: text.clone() })
                                .await;
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            let _ = outbound
                                .send(OutboundMessage::AgentToolUse {
                                    session_id,
                                    id: id.clone(),
                                    name: name.clone(),
                                    input: input.clone(),
                                })
                                .await;
                        }
                        _ => {}
                    }
                }
            }

            let is_result = matches!(message, SdkMessage::Result(_));
            let _ = outbound
                .send(OutboundMessage::AgentMessage { session_id, content: message })
                .await;

            if is_result {
                break;
            }
        }
    });
}
