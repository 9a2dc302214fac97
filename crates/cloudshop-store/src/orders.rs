//! Order book — order persistence and the per-order orchestration lock.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::schema::ORDERS;
use crate::sqlite::{now_rfc3339, DocumentStore};
use crate::types::{BuilderEntry, NewOrder, Order, OrderStatus};
use cloudshop_core::{Error, Result};

#[derive(Clone)]
pub struct OrderBook {
    store: Arc<DocumentStore>,
}

impl OrderBook {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Store a new order. Resource names must be unique within it.
    pub fn create_order(&self, order: &NewOrder) -> Result<String> {
        if order.bundle.trim().is_empty() || order.plan.trim().is_empty() {
            return Err(Error::Validation("order requires bundle and plan".to_string()));
        }
        let mut seen = std::collections::HashSet::new();
        for resource in &order.resources {
            if !seen.insert(resource.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate resource name {} in order",
                    resource.name
                )));
            }
        }

        let id = self.store.insert(ORDERS, serde_json::to_value(order)?)?;
        info!(
            "Order {} placed: bundle={}, plan={}, {} resources",
            id,
            order.bundle,
            order.plan,
            order.resources.len()
        );
        Ok(id)
    }

    /// Place an order for a catalogue entry, starting in `Review`.
    pub fn place(
        &self,
        entry: &BuilderEntry,
        input_fields: BTreeMap<String, String>,
    ) -> Result<String> {
        let region = entry
            .region
            .clone()
            .or_else(|| input_fields.get("region").cloned());
        self.create_order(&NewOrder {
            bundle: entry.bundle.clone(),
            plan: entry.plan.clone(),
            region,
            input_fields,
            resources: entry.resources.clone(),
            status: OrderStatus::Review,
        })
    }

    pub fn get_order(&self, id: &str) -> Result<Order> {
        self.store
            .find_one(ORDERS, &json!({ "_id": id }))?
            .ok_or_else(|| Error::NotFound(format!("order {}", id)))?
            .decode()
    }

    /// Move an order between non-running states (e.g. `Review` → `Submitted`).
    pub fn set_status(&self, id: &str, status: OrderStatus) -> Result<()> {
        if status == OrderStatus::InProgress {
            return Err(Error::Validation(
                "InProgress is only entered by acquiring the order lock".to_string(),
            ));
        }
        let modified = self.store.update_one(
            ORDERS,
            &json!({ "_id": id, "status": { "$ne": OrderStatus::InProgress.as_str() } }),
            json!({ "status": status.as_str() }),
        )?;
        if modified == 0 {
            self.get_order(id)?;
            return Err(Error::AlreadyRunning(id.to_string()));
        }
        Ok(())
    }

    /// Take the orchestration lock by flipping the status to `InProgress`.
    ///
    /// A lock not renewed for longer than `stale_after` is taken over;
    /// otherwise a second caller gets [`Error::AlreadyRunning`].
    pub fn acquire_lock(&self, id: &str, stale_after: Duration) -> Result<(Order, OrderLock)> {
        let token = Uuid::new_v4().to_string();
        let lock = json!({
            "status": OrderStatus::InProgress.as_str(),
            "lockedAt": now_rfc3339(),
            "lockToken": token,
        });

        let modified = self.store.update_one(
            ORDERS,
            &json!({ "_id": id, "status": { "$ne": OrderStatus::InProgress.as_str() } }),
            lock.clone(),
        )?;
        if modified == 0 {
            self.take_over(id, stale_after, lock)?;
        }

        let order = self.get_order(id)?;
        Ok((
            order,
            OrderLock {
                order_id: id.to_string(),
                token,
            },
        ))
    }

    fn take_over(&self, id: &str, stale_after: Duration, lock: Value) -> Result<()> {
        let record = self
            .store
            .find_one(ORDERS, &json!({ "_id": id }))?
            .ok_or_else(|| Error::NotFound(format!("order {}", id)))?;
        let held_since = record.body.get("lockedAt").cloned().unwrap_or(Value::Null);

        let stale = match held_since.as_str().map(DateTime::parse_from_rfc3339) {
            Some(Ok(at)) => {
                let age = Utc::now().signed_duration_since(at.with_timezone(&Utc));
                age.to_std().map(|age| age > stale_after).unwrap_or(false)
            }
            // Locked without a timestamp: nothing to wait for.
            _ => true,
        };
        if !stale {
            return Err(Error::AlreadyRunning(id.to_string()));
        }

        // A renewal between the read and this write moves `lockedAt` and loses us the race.
        let modified = self.store.update_one(
            ORDERS,
            &json!({
                "_id": id,
                "status": OrderStatus::InProgress.as_str(),
                "lockedAt": held_since,
            }),
            lock,
        )?;
        if modified == 0 {
            return Err(Error::AlreadyRunning(id.to_string()));
        }
        warn!("Took over stale orchestration lock on order {}", id);
        Ok(())
    }

    /// Push `lockedAt` forward so a long run is not mistaken for an abandoned one.
    ///
    /// Fails with [`Error::Conflict`] once another run has taken the lock over.
    pub fn renew_lock(&self, lock: &OrderLock) -> Result<()> {
        let modified = self.store.update_one(
            ORDERS,
            &lock.filter(),
            json!({ "lockedAt": now_rfc3339() }),
        )?;
        if modified == 0 {
            return Err(Error::Conflict(format!(
                "orchestration lock on order {} is no longer held",
                lock.order_id
            )));
        }
        Ok(())
    }

    /// Release the lock, leaving the order in `status`.
    ///
    /// Returns `false` without touching the order when the lock was taken
    /// over, so a superseded run cannot overwrite the new run's status.
    pub fn release_lock(&self, lock: &OrderLock, status: OrderStatus) -> Result<bool> {
        let modified = self.store.update_one(
            ORDERS,
            &lock.filter(),
            json!({ "status": status.as_str(), "lockedAt": null, "lockToken": null }),
        )?;
        if modified == 0 {
            warn!(
                "Order {} lock no longer held; not releasing to {:?}",
                lock.order_id, status
            );
        }
        Ok(modified == 1)
    }
}

/// Proof of holding an order's orchestration lock.
#[derive(Debug, Clone)]
pub struct OrderLock {
    pub order_id: String,
    token: String,
}

impl OrderLock {
    fn filter(&self) -> Value {
        json!({
            "_id": self.order_id,
            "status": OrderStatus::InProgress.as_str(),
            "lockToken": self.token,
        })
    }
}
