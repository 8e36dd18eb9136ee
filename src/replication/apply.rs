//! Applying Responses
//!
//! A response's payload is only trusted after its piggybacked
//! transactions are in the local store. [`apply_response`] enforces that
//! order by handing the payload back only once everything applied.

use super::cursor::ReplicationCursor;
use super::types::Response;
use crate::error::Result;
use crate::store::LocalStore;

/// Cursor describing what `store` has committed
pub async fn current_cursor(
    store: &LocalStore,
    session_id: i64,
    machine_id: i32,
    event_id: i64,
) -> Result<ReplicationCursor> {
    let txs = store.last_committed_txs().await?;
    Ok(ReplicationCursor::new(session_id, machine_id, event_id, txs))
}

/// Apply every piggybacked transaction in order, advance `cursor` and
/// return the payload. Transactions the store already holds are skipped.
pub async fn apply_response<T>(
    store: &LocalStore,
    cursor: &mut ReplicationCursor,
    response: Response<T>,
) -> Result<T> {
    let mut applied = 0usize;
    for entry in &response.transactions {
        if store.apply_transaction(&entry.resource, &entry.tx).await? {
            applied += 1;
        }
        cursor.advance(&entry.resource, entry.tx.tx_id);
    }

    if applied > 0 {
        tracing::debug!("Applied {} of {} received transactions", applied, response.transactions.len());
    }
    Ok(response.payload)
}
