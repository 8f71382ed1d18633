use sqlx::Row;

use super::DatabaseManager;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct CallerIdStat {
    pub prefix: String,
    pub pattern: String,
    pub attempts: i64,
    pub answers: i64,
    pub score: f64,
}

impl DatabaseManager {
    /// Candidates for a destination prefix, ordered by score descending
    /// then by fewest recent attempts.
    pub async fn callerid_candidates(&self, prefix: &str) -> Result<Vec<CallerIdStat>> {
        let rows = sqlx::query(
            "SELECT prefix, pattern, attempts, answers, score FROM callerid_stats \
             WHERE prefix = ? ORDER BY score DESC, attempts ASC",
        )
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| CallerIdStat {
                prefix: r.get("prefix"),
                pattern: r.get("pattern"),
                attempts: r.get("attempts"),
                answers: r.get("answers"),
                score: r.get("score"),
            })
            .collect())
    }

    pub async fn record_callerid_attempt(&self, prefix: &str, pattern: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO callerid_stats (prefix, pattern, attempts, answers, score) VALUES (?, ?, 1, 0, 0) \
             ON CONFLICT(prefix, pattern) DO UPDATE SET attempts = attempts + 1",
        )
        .bind(prefix)
        .bind(pattern)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_callerid_answer(&self, prefix: &str, pattern: &str) -> Result<()> {
        sqlx::query(
            "UPDATE callerid_stats SET answers = answers + 1, \
             score = CAST(answers + 1 AS REAL) / CAST(attempts AS REAL) \
             WHERE prefix = ? AND pattern = ?",
        )
        .bind(prefix)
        .bind(pattern)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
