//! Capability reconciliation.
//!
//! After a config refresh the per-kind counts are compared with the previous
//! ones. New indices get entities; indices beyond the new count are stale.

use std::sync::Arc;

use tracing::debug;
use tracing::error;
use tracing::info;

use super::board::Board;
use super::channel::ChannelCounts;
use super::channel::ChannelKind;
use super::context::DscriptContext;
use super::error::Result;
use crate::engine::Entity;

/// Entity-set changes produced by a count comparison.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub added: Vec<(ChannelKind, u32)>,
    pub removed: Vec<(ChannelKind, u32)>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Compare counts before and after a refresh.
pub fn diff(before: &ChannelCounts, after: &ChannelCounts, custom_firmware: bool) -> Reconciliation {
    let mut delta = Reconciliation::default();
    for kind in ChannelKind::ALL {
        let pre = kind.count(before, custom_firmware);
        let post = kind.count(after, custom_firmware);
        if post > pre {
            delta.added.extend((pre + 1..=post).map(|i| (kind, i)));
        } else if post < pre {
            delta.removed.extend((post + 1..=pre).map(|i| (kind, i)));
        }
    }
    delta
}

/// Refresh a board's config and apply the resulting entity changes.
///
/// A failed refresh aborts reconciliation for this board only and does not
/// touch its availability.
pub async fn reconcile_board(ctx: &DscriptContext, board: &Arc<Board>) -> Result<Reconciliation> {
    let (before, after) = match board.refresh_counts().await {
        Ok(counts) => counts,
        Err(e) => {
            error!(
                "[{}] {}: config refresh failed: {}",
                ctx.entry_id(),
                board.friendly_name(),
                e
            );
            return Err(e);
        }
    };

    let delta = diff(&before, &after, board.custom_firmware());
    if delta.is_empty() {
        debug!("[{}] {}: config unchanged", ctx.entry_id(), board.friendly_name());
        return Ok(delta);
    }
    info!(
        "[{}] {}: config changed, {} new and {} stale channels",
        ctx.entry_id(),
        board.friendly_name(),
        delta.added.len(),
        delta.removed.len()
    );

    // Kept stale entities whose channel is back only need a fresh report
    let returning: Vec<_> = delta
        .added
        .iter()
        .filter_map(|&(kind, index)| ctx.entities().get_by_location(board.mac(), kind, index))
        .collect();

    ctx.add_entities(board, &delta.added).await;
    ctx.retire_entities(board, &delta.removed).await;
    for entity in returning {
        debug!("[{}] {}: channel is back", ctx.entry_id(), entity.entity_id());
        if let Err(e) = entity.update().await {
            debug!("[{}] {}: update failed: {}", ctx.entry_id(), entity.unique_id(), e);
        }
        ctx.publish(&entity).await;
    }
    Ok(delta)
}
