use chrono::{Duration, Utc};
use sqlx::{PgPool, query_as};
use tracing::warn;

use crate::models::DispatchLease;

/// Coordinates which dispatcher instance may process the outbox.
///
/// The lease is a single storage row. Acquiring reads it `FOR UPDATE`
/// inside a transaction, so concurrent acquirers serialize on the row and
/// exactly one of them can win. A holder that dies without releasing is
/// covered by `expires_at`: once it passes, the lease counts as free.
pub struct LeaseManager {
    pool: PgPool,
    lease_duration: Duration,
}

impl LeaseManager {
    /// `lease_duration` must comfortably exceed the worst case cycle time,
    /// otherwise a second dispatcher can start while the first still runs.
    pub fn new(pool: PgPool, lease_duration: Duration) -> Self {
        LeaseManager {
            pool,
            lease_duration,
        }
    }

    /// Tries to take the dispatch lease.
    ///
    /// Returns `Ok(false)` when another dispatcher holds an unexpired
    /// lease; that is the normal case with several instances running and
    /// not an error.
    pub async fn acquire(&self) -> Result<bool, sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let lease = query_as::<_, DispatchLease>(
            r#"
            SELECT id, held, held_at, expires_at
            FROM outbox_lease
            WHERE id = 1
            FOR UPDATE
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;

        let now = Utc::now();
        if lease.held && lease.expires_at.is_some_and(|until| until > now) {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE outbox_lease
            SET held = true, held_at = $1, expires_at = $2
            WHERE id = 1
            "#,
        )
        .bind(now)
        .bind(now + self.lease_duration)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    /// Frees the lease. Releasing an already free lease is a no-op, so a
    /// retried release after a timeout does no harm.
    pub async fn release(&self) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        let lease = query_as::<_, DispatchLease>(
            r#"
            SELECT id, held, held_at, expires_at
            FROM outbox_lease
            WHERE id = 1
            FOR UPDATE
            "#,
        )
        .fetch_one(&mut *tx)
        .await?;

        if !lease.held {
            warn!("The lease is already free.");
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE outbox_lease
            SET held = false, held_at = NULL, expires_at = NULL
            WHERE id = 1
            "#,
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}
