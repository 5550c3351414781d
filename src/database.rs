//! Trigger-metadata store contract.

use crate::error::DatabaseError;
use async_trait::async_trait;

/// The one write the bridge performs against the trigger store: flagging a
/// trigger disabled after a disabling webhook status. Trigger loading and
/// persistence belong to the admin API, not to this crate.
#[async_trait]
pub trait TriggerDatabase: Send + Sync {
    async fn disable_trigger(&self, trigger_id: &str, status_code: u16) -> Result<(), DatabaseError>;
}
