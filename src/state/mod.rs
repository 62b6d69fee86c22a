//! Double-buffered slot state store.
//!
//! Exactly two cache generations ("slots") exist. Each is `empty`,
//! `warming` or `ready`; at most one is `ready` and at most one is
//! `warming` at any instant. State lives in the `cache_slots` table and
//! every transition is a single transaction, so a concurrent reader never
//! observes a half-updated pair and two concurrent rebuild triggers cannot
//! both claim a slot.

use sqlx::{Row, SqlitePool};
use time::{Duration, OffsetDateTime};
use tracing::{info, warn};

use crate::error::EngineError;
use crate::infra::db::map_sqlx_error;

/// Identity of one of the two cache slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    One,
    Two,
}

impl SlotId {
    pub fn other(self) -> SlotId {
        match self {
            SlotId::One => SlotId::Two,
            SlotId::Two => SlotId::One,
        }
    }

    pub fn as_i64(self) -> i64 {
        match self {
            SlotId::One => 1,
            SlotId::Two => 2,
        }
    }

    /// Table-name suffix for this slot's physical tables.
    pub fn suffix(self) -> &'static str {
        match self {
            SlotId::One => "1",
            SlotId::Two => "2",
        }
    }

    fn from_i64(value: i64) -> Option<SlotId> {
        match value {
            1 => Some(SlotId::One),
            2 => Some(SlotId::Two),
            _ => None,
        }
    }
}

impl std::fmt::Display for SlotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Empty,
    Warming,
    Ready,
}

impl SlotState {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotState::Empty => "empty",
            SlotState::Warming => "warming",
            SlotState::Ready => "ready",
        }
    }

    fn parse(value: &str) -> Option<SlotState> {
        match value {
            "empty" => Some(SlotState::Empty),
            "warming" => Some(SlotState::Warming),
            "ready" => Some(SlotState::Ready),
            _ => None,
        }
    }
}

/// Observed state of one slot, as used by the warm decision and exposed
/// for operator introspection.
#[derive(Debug, Clone, Copy)]
pub struct SlotStatus {
    pub slot: SlotId,
    pub state: SlotState,
    pub last_warm_up_started_at: Option<OffsetDateTime>,
    pub last_ready_at: Option<OffsetDateTime>,
}

/// Decide which slot the next build should target.
///
/// Inputs are the two slots after stale-warming normalization. Returns
/// `None` while a build is in flight. When both slots are ready the one
/// with the older `last_ready_at` rotates out, so the stalest copy is
/// always refreshed next.
pub fn decide_slot_to_warm(slot1: &SlotStatus, slot2: &SlotStatus) -> Option<SlotId> {
    use SlotState::{Empty, Ready, Warming};

    match (slot1.state, slot2.state) {
        (Warming, _) | (_, Warming) => None,
        (Empty, Empty) | (Empty, Ready) => Some(SlotId::One),
        (Ready, Empty) => Some(SlotId::Two),
        (Ready, Ready) => {
            let first = slot1.last_ready_at.unwrap_or(OffsetDateTime::UNIX_EPOCH);
            let second = slot2.last_ready_at.unwrap_or(OffsetDateTime::UNIX_EPOCH);
            if first <= second {
                Some(SlotId::One)
            } else {
                Some(SlotId::Two)
            }
        }
    }
}

/// Treat a slot stuck in `warming` past the timeout as a crashed build.
pub fn normalize_stale_warming(
    status: &mut SlotStatus,
    now: OffsetDateTime,
    timeout: Duration,
) -> bool {
    if status.state != SlotState::Warming {
        return false;
    }
    let started = match status.last_warm_up_started_at {
        Some(at) => at,
        // A warming slot without a start timestamp cannot be aged out
        // honestly; reset it.
        None => {
            status.state = SlotState::Empty;
            return true;
        }
    };
    if now - started > timeout {
        status.state = SlotState::Empty;
        return true;
    }
    false
}

/// Transactional access to the two-slot state machine.
#[derive(Clone)]
pub struct SlotStore {
    pool: SqlitePool,
    warming_timeout: Duration,
}

impl SlotStore {
    pub fn new(pool: SqlitePool, warming_timeout: Duration) -> Self {
        Self {
            pool,
            warming_timeout,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent bootstrap: create the slot table and seed both slots as
    /// `empty`. Existing rows are left untouched.
    pub async fn install(&self) -> Result<(), EngineError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cache_slots (\
                 slot_id INTEGER PRIMARY KEY CHECK (slot_id IN (1, 2)),\
                 state TEXT NOT NULL,\
                 last_warm_up_started_at TEXT,\
                 last_ready_at TEXT\
             )",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query(
            "INSERT OR IGNORE INTO cache_slots (slot_id, state) VALUES (1, 'empty'), (2, 'empty')",
        )
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    /// Claim the next slot to warm, if any. The decision, the stale-warming
    /// reset and the `warming` mark are applied in one transaction, so two
    /// concurrent triggers cannot both claim a slot.
    pub async fn begin_warming(&self) -> Result<Option<SlotId>, EngineError> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        let Some((mut slot1, mut slot2)) = load_pair(&mut *tx).await? else {
            // Not installed: the system is not ready to build.
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Ok(None);
        };

        for status in [&mut slot1, &mut slot2] {
            if normalize_stale_warming(status, now, self.warming_timeout) {
                warn!(slot = %status.slot, "resetting stale warming slot");
                sqlx::query("UPDATE cache_slots SET state = 'empty' WHERE slot_id = ?")
                    .bind(status.slot.as_i64())
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_error)?;
            }
        }

        let decision = decide_slot_to_warm(&slot1, &slot2);
        if let Some(slot) = decision {
            sqlx::query(
                "UPDATE cache_slots SET state = 'warming', last_warm_up_started_at = ? \
                 WHERE slot_id = ? AND state != 'warming'",
            )
            .bind(now)
            .bind(slot.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            info!(slot = %slot, "slot claimed for warming");
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(decision)
    }

    /// Promote a freshly built slot to `ready` and demote the previously
    /// serving slot, atomically. A concurrent [`Self::serving_slot`] call
    /// sees either the old pair or the new pair, never a gap.
    pub async fn mark_ready(&self, slot: SlotId) -> Result<(), EngineError> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        sqlx::query("UPDATE cache_slots SET state = 'ready', last_ready_at = ? WHERE slot_id = ?")
            .bind(now)
            .bind(slot.as_i64())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        sqlx::query("UPDATE cache_slots SET state = 'empty' WHERE slot_id = ? AND state = 'ready'")
            .bind(slot.other().as_i64())
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        info!(slot = %slot, "slot promoted to ready");
        Ok(())
    }

    /// Reset a failed build's target slot to `empty`. The serving slot is
    /// never touched.
    pub async fn mark_failed(&self, slot: SlotId) -> Result<(), EngineError> {
        sqlx::query("UPDATE cache_slots SET state = 'empty' WHERE slot_id = ? AND state != 'ready'")
            .bind(slot.as_i64())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        warn!(slot = %slot, "slot reset after failed build");
        Ok(())
    }

    /// The slot currently serving queries, or `None` when the cache is
    /// unavailable and callers must degrade.
    pub async fn serving_slot(&self) -> Result<Option<SlotId>, EngineError> {
        let row = sqlx::query("SELECT slot_id FROM cache_slots WHERE state = 'ready' LIMIT 1")
            .fetch_optional(&self.pool)
            .await;
        let row = match row {
            Ok(row) => row,
            // Not installed: nothing can be serving.
            Err(sqlx::Error::Database(err)) if err.message().contains("no such table") => {
                return Ok(None);
            }
            Err(err) => return Err(map_sqlx_error(err)),
        };
        Ok(row
            .map(|row| row.try_get::<i64, _>("slot_id"))
            .transpose()
            .map_err(map_sqlx_error)?
            .and_then(SlotId::from_i64))
    }

    /// Both slots' states and timestamps, for operator dashboards.
    pub async fn slot_overview(&self) -> Result<Vec<SlotStatus>, EngineError> {
        let mut conn = self.pool.acquire().await.map_err(map_sqlx_error)?;
        match load_pair(&mut *conn).await? {
            Some((slot1, slot2)) => Ok(vec![slot1, slot2]),
            None => Ok(vec![]),
        }
    }
}

async fn load_pair(
    conn: &mut sqlx::SqliteConnection,
) -> Result<Option<(SlotStatus, SlotStatus)>, EngineError> {
    let rows = sqlx::query(
        "SELECT slot_id, state, last_warm_up_started_at, last_ready_at \
         FROM cache_slots ORDER BY slot_id",
    )
    .fetch_all(&mut *conn)
    .await;

    let rows = match rows {
        Ok(rows) => rows,
        // Table missing means the store was never installed.
        Err(sqlx::Error::Database(err)) if err.message().contains("no such table") => {
            return Ok(None);
        }
        Err(err) => return Err(map_sqlx_error(err)),
    };
    if rows.len() != 2 {
        return Ok(None);
    }

    let mut statuses = Vec::with_capacity(2);
    for row in rows {
        let slot_id: i64 = row.try_get("slot_id").map_err(map_sqlx_error)?;
        let state: String = row.try_get("state").map_err(map_sqlx_error)?;
        let slot = SlotId::from_i64(slot_id)
            .ok_or_else(|| EngineError::storage(format!("invalid slot id {slot_id}")))?;
        let state = SlotState::parse(&state)
            .ok_or_else(|| EngineError::storage(format!("invalid slot state `{state}`")))?;
        statuses.push(SlotStatus {
            slot,
            state,
            last_warm_up_started_at: row
                .try_get("last_warm_up_started_at")
                .map_err(map_sqlx_error)?,
            last_ready_at: row.try_get("last_ready_at").map_err(map_sqlx_error)?,
        });
    }
    let mut statuses = statuses.into_iter();
    match (statuses.next(), statuses.next()) {
        (Some(slot1), Some(slot2)) => Ok(Some((slot1, slot2))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(slot: SlotId, state: SlotState) -> SlotStatus {
        SlotStatus {
            slot,
            state,
            last_warm_up_started_at: None,
            last_ready_at: None,
        }
    }

    fn status_ready_at(slot: SlotId, ready_at: OffsetDateTime) -> SlotStatus {
        SlotStatus {
            slot,
            state: SlotState::Ready,
            last_warm_up_started_at: None,
            last_ready_at: Some(ready_at),
        }
    }

    #[test]
    fn decision_table() {
        use SlotState::{Empty, Ready, Warming};

        let cases = [
            ((Empty, Empty), Some(SlotId::One)),
            ((Empty, Warming), None),
            ((Empty, Ready), Some(SlotId::One)),
            ((Warming, Empty), None),
            ((Warming, Warming), None),
            ((Warming, Ready), None),
            ((Ready, Empty), Some(SlotId::Two)),
            ((Ready, Warming), None),
        ];
        for ((s1, s2), expected) in cases {
            let got = decide_slot_to_warm(
                &status(SlotId::One, s1),
                &status(SlotId::Two, s2),
            );
            assert_eq!(got, expected, "({s1:?}, {s2:?})");
        }
    }

    #[test]
    fn both_ready_rotates_the_staler_slot() {
        let older = OffsetDateTime::UNIX_EPOCH;
        let newer = older + Duration::hours(1);

        let decision = decide_slot_to_warm(
            &status_ready_at(SlotId::One, newer),
            &status_ready_at(SlotId::Two, older),
        );
        assert_eq!(decision, Some(SlotId::Two));

        let decision = decide_slot_to_warm(
            &status_ready_at(SlotId::One, older),
            &status_ready_at(SlotId::Two, newer),
        );
        assert_eq!(decision, Some(SlotId::One));
    }

    #[test]
    fn both_ready_ties_pick_slot_one() {
        let at = OffsetDateTime::UNIX_EPOCH;
        let decision = decide_slot_to_warm(
            &status_ready_at(SlotId::One, at),
            &status_ready_at(SlotId::Two, at),
        );
        assert_eq!(decision, Some(SlotId::One));
    }

    #[test]
    fn stale_warming_is_normalized() {
        let now = OffsetDateTime::now_utc();
        let mut stuck = SlotStatus {
            slot: SlotId::One,
            state: SlotState::Warming,
            last_warm_up_started_at: Some(now - Duration::hours(3)),
            last_ready_at: None,
        };
        assert!(normalize_stale_warming(&mut stuck, now, Duration::hours(1)));
        assert_eq!(stuck.state, SlotState::Empty);

        let mut fresh = SlotStatus {
            slot: SlotId::Two,
            state: SlotState::Warming,
            last_warm_up_started_at: Some(now - Duration::minutes(5)),
            last_ready_at: None,
        };
        assert!(!normalize_stale_warming(&mut fresh, now, Duration::hours(1)));
        assert_eq!(fresh.state, SlotState::Warming);
    }

    #[test]
    fn warming_without_start_timestamp_is_reset() {
        let now = OffsetDateTime::now_utc();
        let mut status = status(SlotId::One, SlotState::Warming);
        assert!(normalize_stale_warming(&mut status, now, Duration::hours(1)));
        assert_eq!(status.state, SlotState::Empty);
    }
}
