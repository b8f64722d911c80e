//! Per-connection protocol state machine.

use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::bridge::{StreamingBridge, Usage};
use crate::cancel::CancellationController;
use crate::config::{Config, HeartbeatConfig};
use crate::error::{BackendError, ProtocolError};
use crate::heartbeat::HeartbeatMonitor;
use crate::history::{HistoryStore, NewMessage, Role, StoredMessage};
use crate::llm::{BackendFactory, Turn};
use crate::protocol::{ClientFrame, ServerFrame, now_ts};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Ready,
    AwaitingReply,
    Closed,
}

/// The client went away: inbound closed or an outbound send failed.
#[derive(Debug, Error)]
#[error("connection lost")]
pub struct ConnectionLost;

/// Outbound half of the connection plus the ping clock the heartbeat reads.
struct ClientLink {
    frames: mpsc::Sender<ServerFrame>,
    last_ping: watch::Sender<Instant>,
}

impl ClientLink {
    async fn send(&self, frame: ServerFrame) -> Result<(), ConnectionLost> {
        self.frames.send(frame).await.map_err(|_| ConnectionLost)
    }

    async fn pong(&self) -> Result<(), ConnectionLost> {
        self.last_ping.send_replace(Instant::now());
        self.send(ServerFrame::pong()).await
    }

    /// Inbound traffic while a reply is streaming. Only `ping` and `cancel`
    /// are acted on; a second message is turned away.
    async fn while_busy(
        &self,
        raw: Option<String>,
        cancel: &CancellationController,
    ) -> Result<(), ConnectionLost> {
        let raw = raw.ok_or(ConnectionLost)?;
        match ClientFrame::decode(&raw) {
            Ok(ClientFrame::Ping) => self.pong().await,
            Ok(ClientFrame::Cancel) => {
                tracing::debug!("Cancel requested");
                cancel.cancel();
                Ok(())
            }
            Ok(ClientFrame::Message { .. }) => self.send(ServerFrame::error("busy")).await,
            Err(err) => self.send(ServerFrame::error(err)).await,
        }
    }
}

enum Step {
    Delta(Option<Result<String, BackendError>>),
    Inbound(Option<String>),
}

pub struct SessionManager {
    history: HistoryStore,
    bridge: StreamingBridge,
    cancel: CancellationController,
    link: ClientLink,
    heartbeat: HeartbeatConfig,
    context_limit: u32,
    state: SessionState,
}

impl SessionManager {
    pub fn new(
        history: HistoryStore,
        factory: Arc<dyn BackendFactory>,
        frames: mpsc::Sender<ServerFrame>,
        config: &Config,
    ) -> Self {
        let (last_ping, _) = watch::channel(Instant::now());
        Self {
            history,
            bridge: StreamingBridge::new(factory),
            cancel: CancellationController::new(),
            link: ClientLink { frames, last_ping },
            heartbeat: config.heartbeat.clone(),
            context_limit: config.history_context_limit,
            state: SessionState::Ready,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn transition(&mut self, next: SessionState) {
        tracing::debug!(from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }

    /// Drive the connection until `inbound` closes or the client can no
    /// longer be written to.
    pub async fn run(&mut self, mut inbound: mpsc::Receiver<String>) {
        let monitor = HeartbeatMonitor::spawn(
            self.link.frames.clone(),
            self.link.last_ping.subscribe(),
            &self.heartbeat,
        );

        if self.link.send(ServerFrame::ready()).await.is_ok() {
            while let Some(raw) = inbound.recv().await {
                if self.handle_frame(&raw, &mut inbound).await.is_err() {
                    break;
                }
            }
        }

        self.transition(SessionState::Closed);
        monitor.stop().await;
        tracing::debug!("Session closed");
    }

    async fn handle_frame(
        &mut self,
        raw: &str,
        inbound: &mut mpsc::Receiver<String>,
    ) -> Result<(), ConnectionLost> {
        match ClientFrame::decode(raw) {
            Ok(ClientFrame::Ping) => self.link.pong().await,
            // Nothing is streaming, so there is no signal to trip.
            Ok(ClientFrame::Cancel) => self.link.send(ServerFrame::Cancelled).await,
            Ok(ClientFrame::Message { text, session_id }) if self.state == SessionState::Ready => {
                self.handle_message(text, session_id, inbound).await
            }
            Ok(ClientFrame::Message { .. }) => self.link.send(ServerFrame::error("busy")).await,
            Err(err) => {
                if let ProtocolError::UnknownType(Some(kind)) = &err {
                    tracing::debug!(kind = %kind, "Unsupported frame type");
                } else {
                    tracing::debug!(error = %err, "Rejected inbound frame");
                }
                self.link.send(ServerFrame::error(err)).await
            }
        }
    }

    async fn handle_message(
        &mut self,
        text: String,
        session_id: Option<String>,
        inbound: &mut mpsc::Receiver<String>,
    ) -> Result<(), ConnectionLost> {
        let (conversation_id, user_turn) = match self.record_user_turn(session_id.as_deref(), text).await {
            Ok(recorded) => recorded,
            Err(err) => return self.persistence_failed(err).await,
        };
        self.link
            .send(ServerFrame::start(&conversation_id, user_turn.id))
            .await?;

        self.transition(SessionState::AwaitingReply);
        let outcome = self.stream_reply(&conversation_id, inbound).await;
        self.cancel.reset();
        self.transition(SessionState::Ready);

        if outcome.is_err() {
            tracing::info!(conversation_id = %conversation_id, "Connection lost mid-reply, nothing persisted");
        }
        outcome
    }

    async fn record_user_turn(
        &self,
        session_id: Option<&str>,
        text: String,
    ) -> anyhow::Result<(String, StoredMessage)> {
        let conversation_id = self.history.get_or_create(session_id).await?;
        let stored = self
            .history
            .append(&conversation_id, NewMessage::new(Role::User, text, now_ts()))
            .await?;
        Ok((conversation_id, stored))
    }

    async fn stream_reply(
        &mut self,
        conversation_id: &str,
        inbound: &mut mpsc::Receiver<String>,
    ) -> Result<(), ConnectionLost> {
        let turns: Vec<Turn> = match self.history.chronological(conversation_id, self.context_limit).await {
            Ok(messages) => messages.iter().map(Turn::from).collect(),
            Err(err) => return self.persistence_failed(err).await,
        };
        let signal = self.cancel.signal();

        // Opening may block on the backend; keep serving the client meanwhile.
        let opened = {
            let open = self.bridge.generate_stream(&turns, signal.clone());
            tokio::pin!(open);
            loop {
                tokio::select! {
                    res = &mut open => break Some(res),
                    raw = inbound.recv() => {
                        self.link.while_busy(raw, &self.cancel).await?;
                        if signal.is_set() {
                            break None;
                        }
                    }
                }
            }
        };
        let mut stream = match opened {
            Some(Ok(stream)) => stream,
            Some(Err(err)) => return self.backend_failed(conversation_id, err).await,
            None => {
                tracing::info!(conversation_id, "Reply cancelled before first chunk");
                return self.link.send(ServerFrame::Cancelled).await;
            }
        };

        let mut reply = String::new();
        while !signal.is_set() {
            let step = tokio::select! {
                item = stream.next() => Step::Delta(item),
                raw = inbound.recv() => Step::Inbound(raw),
            };
            match step {
                Step::Delta(Some(Ok(delta))) => {
                    reply.push_str(&delta);
                    self.link.send(ServerFrame::chunk(delta)).await?;
                }
                Step::Delta(Some(Err(err))) => return self.backend_failed(conversation_id, err).await,
                Step::Delta(None) => break,
                Step::Inbound(raw) => self.link.while_busy(raw, &self.cancel).await?,
            }
        }

        let usage = stream.usage();
        if signal.is_set() {
            tracing::info!(conversation_id, chunks = usage.completion_tokens, "Reply cancelled");
            return self.link.send(ServerFrame::Cancelled).await;
        }
        self.finish_reply(conversation_id, reply, usage).await
    }

    async fn finish_reply(
        &self,
        conversation_id: &str,
        reply: String,
        usage: Usage,
    ) -> Result<(), ConnectionLost> {
        let message = NewMessage::new(Role::Assistant, reply, now_ts());
        match self.history.append(conversation_id, message).await {
            Ok(stored) => {
                tracing::info!(conversation_id, chunks = usage.completion_tokens, "Reply complete");
                self.link.send(ServerFrame::done(&stored, usage)).await
            }
            Err(err) => self.persistence_failed(err).await,
        }
    }

    async fn backend_failed(&self, conversation_id: &str, err: BackendError) -> Result<(), ConnectionLost> {
        tracing::warn!(conversation_id, error = %err, "Backend stream failed");
        self.link
            .send(ServerFrame::error(format!("backend_error: {err}")))
            .await
    }

    async fn persistence_failed(&self, err: anyhow::Error) -> Result<(), ConnectionLost> {
        tracing::error!(error = ?err, "History store failed, abandoning turn");
        self.link
            .send(ServerFrame::error(format!("persistence_error: {err:#}")))
            .await
    }
}
