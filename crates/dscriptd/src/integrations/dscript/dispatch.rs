//! Event dispatch.
//!
//! The event server calls handlers from its own execution context. Handlers
//! only enqueue the event; a dispatcher task owned by the integration picks it
//! up and routes it against the registries.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::warn;

use super::channel::Topic;
use super::context::DscriptContext;
use super::entity::unique_id;
use super::protocol::EventHandler;
use super::protocol::EventSender;
use super::reconcile::reconcile_board;

/// Sending half handed to the event server. Cloneable, usable from any thread.
#[derive(Clone)]
pub struct EventQueue {
    tx: mpsc::UnboundedSender<EventSender>,
}

impl EventQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventSender>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// A handler that enqueues and returns immediately.
    pub fn handler(&self) -> EventHandler {
        let tx = self.tx.clone();
        Arc::new(move |event: EventSender| {
            if let Err(e) = tx.send(event) {
                debug!("Dispatcher stopped, dropping {} from {}", e.0.topic, e.0.sender);
            }
        })
    }
}

/// Drain the queue.
///
/// State pushes are applied in arrival order. Heartbeat and config events may
/// need a full board setup and run in their own tasks.
pub fn spawn_dispatcher(
    ctx: Arc<DscriptContext>,
    mut rx: mpsc::UnboundedReceiver<EventSender>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event.topic {
                Topic::Heartbeat | Topic::GetConfig => {
                    let ctx = ctx.clone();
                    tokio::spawn(async move { handle_event(&ctx, event).await });
                }
                _ => handle_event(&ctx, event).await,
            }
        }
        debug!("[{}] Event queue closed", ctx.entry_id());
    })
}

pub async fn handle_event(ctx: &Arc<DscriptContext>, event: EventSender) {
    debug!(
        "[{}] {}: handle {} ({})",
        ctx.entry_id(),
        event.sender,
        event.topic,
        event.identifier
    );
    match event.topic {
        Topic::Heartbeat => handle_heartbeat(ctx, &event).await,
        Topic::GetConfig => handle_getconfig(ctx, &event).await,
        _ => handle_state(ctx, &event).await,
    }
}

/// Unknown senders become boards; known ones are marked alive and, with
/// custom firmware, reconciled.
async fn handle_heartbeat(ctx: &Arc<DscriptContext>, event: &EventSender) {
    let Some(board) = ctx.boards().get_by_ip(event.sender).await else {
        debug!("[{}] {}: heartbeat from new board", ctx.entry_id(), event.sender);
        let config = ctx.config();
        ctx.setup_board(event.sender, config.port, config.protocol, &config.aes_key)
            .await;
        return;
    };

    debug!("[{}] {}: heartbeat from {}", ctx.entry_id(), event.sender, board.friendly_name());
    let revived = board.set_available(true);
    if board.custom_firmware() {
        let _ = reconcile_board(ctx, &board).await;
    }
    if revived {
        ctx.publish_board(&board).await;
    }
}

async fn handle_getconfig(ctx: &Arc<DscriptContext>, event: &EventSender) {
    let Some(board) = ctx.boards().get_by_ip(event.sender).await else {
        warn!("[{}] {}: getconfig from unknown board", ctx.entry_id(), event.sender);
        return;
    };
    let _ = reconcile_board(ctx, &board).await;
}

/// Route a channel state push to its entity; pushes nobody claims are dropped.
async fn handle_state(ctx: &Arc<DscriptContext>, event: &EventSender) {
    let Some(kind) = event.topic.channel_kind() else {
        return;
    };
    let Some(board) = ctx.boards().get_by_ip(event.sender).await else {
        warn!("[{}] {}: {} from unknown board", ctx.entry_id(), event.sender, event.topic);
        return;
    };

    let unique_id = unique_id(&board.mac(), kind, event.identifier);
    let Some(entity) = ctx.entities().get_by_unique_id(&board.mac(), &unique_id) else {
        debug!("[{}] {}: no entity {}, dropping push", ctx.entry_id(), event.sender, unique_id);
        return;
    };

    match entity.push(event.value).await {
        Ok(()) => ctx.publish(&entity).await,
        Err(e) => warn!("[{}] {}: push failed: {}", ctx.entry_id(), unique_id, e),
    }
}
