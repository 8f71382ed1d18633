//! Smart-CID: chooses the best-performing caller id for a destination
//! prefix from observed answer-rate statistics.

use crate::db::DatabaseManager;
use crate::error::Result;

/// Digits of the destination phone number used as the prefix key into
/// `callerid_stats`, shared by every `SmartCidGenerator` instance so the
/// dial path and the terminate path key into the same statistics rows.
pub const SMART_CID_PREFIX_LEN: usize = 3;

/// First `len` digits of `phone`, used as the area-prefix key into
/// `callerid_stats`. The project's configured caller id is always the
/// fallback whenever Smart-CID has no candidate, never the other way
/// around.
pub fn destination_prefix(phone: &str, len: usize) -> String {
    phone.chars().take(len).collect()
}

pub struct SmartCidGenerator<'a> {
    db: &'a DatabaseManager,
    prefix_len: usize,
}

impl<'a> SmartCidGenerator<'a> {
    pub fn new(db: &'a DatabaseManager, prefix_len: usize) -> Self {
        Self { db, prefix_len }
    }

    /// Highest-score candidate for `phone`'s prefix, ties broken by fewest
    /// recent attempts. `None` means the caller should fall back to the
    /// project's configured caller id.
    pub async fn candidate(&self, phone: &str) -> Result<Option<String>> {
        let prefix = destination_prefix(phone, self.prefix_len);
        let candidates = self.db.callerid_candidates(&prefix).await?;
        Ok(candidates.into_iter().next().map(|c| c.pattern))
    }

    pub async fn record_attempt(&self, phone: &str, caller_id: &str) -> Result<()> {
        let prefix = destination_prefix(phone, self.prefix_len);
        self.db.record_callerid_attempt(&prefix, caller_id).await
    }

    pub async fn record_answer(&self, phone: &str, caller_id: &str) -> Result<()> {
        let prefix = destination_prefix(phone, self.prefix_len);
        self.db.record_callerid_answer(&prefix, caller_id).await
    }
}
