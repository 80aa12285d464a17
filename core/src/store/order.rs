//! Order table queries. Orders are consumed facts from the commerce
//! side; qualification and milestones only ever read them.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::{from_ts, to_ts, ReferralStore};
use crate::{
    error::ReferralResult,
    types::{OrderRecord, COUNTABLE_ORDER_STATUSES, DISQUALIFYING_ORDER_STATUSES},
};

fn status_list(statuses: &[&str]) -> String {
    statuses
        .iter()
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl ReferralStore {
    pub fn insert_order(&self, o: &OrderRecord) -> ReferralResult<()> {
        self.conn().execute(
            "INSERT INTO orders (order_id, user_id, amount, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![&o.order_id, &o.user_id, o.amount, &o.status, to_ts(o.created_at)],
        )?;
        Ok(())
    }

    pub fn get_order(&self, order_id: &str) -> ReferralResult<Option<OrderRecord>> {
        let row = self
            .conn()
            .query_row(
                "SELECT order_id, user_id, amount, status, created_at
                 FROM orders WHERE order_id = ?1",
                params![order_id],
                |row| {
                    Ok(OrderRecord {
                        order_id: row.get(0)?,
                        user_id: row.get(1)?,
                        amount: row.get(2)?,
                        status: row.get(3)?,
                        created_at: from_ts(row.get(4)?),
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    /// Countable orders (delivered or completed) inside the window:
    /// returns (count, spend sum).
    pub fn countable_orders_in_window(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ReferralResult<(i64, f64)> {
        let sql = format!(
            "SELECT COUNT(*), COALESCE(SUM(amount), 0)
             FROM orders
             WHERE user_id = ?1 AND status IN ({})
               AND created_at >= ?2 AND created_at <= ?3",
            status_list(COUNTABLE_ORDER_STATUSES)
        );
        let row = self.conn().query_row(
            &sql,
            params![user_id, to_ts(start), to_ts(end)],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?)),
        )?;
        Ok(row)
    }

    /// Cancelled, returned, and refunded orders inside the window.
    /// These never count toward qualification.
    pub fn disqualifying_order_count_in_window(
        &self,
        user_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> ReferralResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM orders
             WHERE user_id = ?1 AND status IN ({})
               AND created_at >= ?2 AND created_at <= ?3",
            status_list(DISQUALIFYING_ORDER_STATUSES)
        );
        let count: i64 = self.conn().query_row(
            &sql,
            params![user_id, to_ts(start), to_ts(end)],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Lifetime countable order count for a user (milestone input).
    pub fn countable_order_count(&self, user_id: &str) -> ReferralResult<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM orders WHERE user_id = ?1 AND status IN ({})",
            status_list(COUNTABLE_ORDER_STATUSES)
        );
        let count: i64 = self
            .conn()
            .query_row(&sql, params![user_id], |row| row.get(0))?;
        Ok(count)
    }
}
