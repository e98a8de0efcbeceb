use serde::Serialize;

use crate::db::Database;
use crate::error::IngestResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Accounting {
    /// Non-virtual items currently in the catalog.
    pub total_files: i64,
}

impl Accounting {
    pub(crate) async fn load(db: &dyn Database) -> IngestResult<Self> {
        let total_files = db.count_items().await?;
        Ok(Self { total_files })
    }
}
