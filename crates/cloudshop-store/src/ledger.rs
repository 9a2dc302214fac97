//! Job ledger — one job per (order, resource name).
//!
//! The ledger is the source of truth for whether a resource has been created
//! and which outputs it produced. Uniqueness of (orderID, name) is enforced by
//! a unique index, so a second `create_job` for the same pair is a
//! [`Error::Conflict`] rather than a duplicate.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::schema::JOBS;
use crate::sqlite::DocumentStore;
use crate::types::{Job, JobPatch, JobStatus, NewJob};
use cloudshop_core::{Error, Result};

#[derive(Clone)]
pub struct JobLedger {
    store: Arc<DocumentStore>,
}

impl JobLedger {
    pub fn new(store: Arc<DocumentStore>) -> Self {
        Self { store }
    }

    /// Record a new job in `created` state.
    pub fn create_job(&self, job: &NewJob) -> Result<Job> {
        if job.order_id.is_empty() || job.name.is_empty() || job.resource_type.is_empty() {
            return Err(Error::Validation(
                "job requires orderID, name and type".to_string(),
            ));
        }

        let mut body = serde_json::to_value(job)?;
        if let Some(map) = body.as_object_mut() {
            map.insert("status".into(), json!(JobStatus::Created.as_str()));
            map.insert("outputs".into(), Value::Object(Map::new()));
            map.insert("attempts".into(), json!(1));
        }

        let id = self.store.insert(JOBS, body).map_err(|e| match e {
            Error::Conflict(_) => Error::Conflict(format!(
                "job {} already exists for order {}",
                job.name, job.order_id
            )),
            other => other,
        })?;
        info!("Job {} created for {}/{}", id, job.order_id, job.name);

        self.get_job(&id)?
            .ok_or_else(|| Error::Internal(format!("job {} vanished after insert", id)))
    }

    /// Move a `created` job to its terminal state.
    pub fn update_job(&self, id: &str, patch: &JobPatch) -> Result<()> {
        let mut body = Map::new();
        body.insert("status".into(), json!(patch.status.as_str()));
        if let Some(outputs) = &patch.outputs {
            body.insert("outputs".into(), Value::Object(outputs.clone()));
        }
        body.insert(
            "error".into(),
            patch.error.clone().map(Value::String).unwrap_or(Value::Null),
        );

        let modified = self.store.update_one(
            JOBS,
            &json!({ "_id": id, "status": JobStatus::Created.as_str() }),
            Value::Object(body),
        )?;
        if modified == 0 {
            return match self.get_job(id)? {
                None => Err(Error::NotFound(format!("job {}", id))),
                Some(job) => Err(Error::Conflict(format!(
                    "job {} is already {}",
                    id,
                    job.status.as_str()
                ))),
            };
        }

        debug!("Job {} → {}", id, patch.status.as_str());
        Ok(())
    }

    /// Put a failed or abandoned job back into `created` with fresh inputs.
    ///
    /// Compare-and-set on the status and attempt count observed by the caller;
    /// losing the race is a [`Error::Conflict`].
    pub fn restart_job(&self, previous: &Job, job: &NewJob) -> Result<Job> {
        if previous.status == JobStatus::Completed {
            return Err(Error::Conflict(format!(
                "job {} is completed and cannot be restarted",
                previous.id
            )));
        }

        let patch = json!({
            "status": JobStatus::Created.as_str(),
            "type": job.resource_type,
            "api": job.api,
            "region": job.region,
            "inputs": job.inputs,
            "unresolved": job.unresolved,
            "outputs": {},
            "error": null,
            "attempts": previous.attempts + 1,
        });
        let modified = self.store.update_one(
            JOBS,
            &json!({
                "_id": previous.id,
                "status": previous.status.as_str(),
                "attempts": previous.attempts,
            }),
            patch,
        )?;
        if modified == 0 {
            return Err(Error::Conflict(format!(
                "job {} changed while restarting",
                previous.id
            )));
        }

        warn!(
            "Job {} ({}/{}) restarted, attempt {}",
            previous.id,
            previous.order_id,
            previous.name,
            previous.attempts + 1
        );
        self.get_job(&previous.id)?
            .ok_or_else(|| Error::NotFound(format!("job {}", previous.id)))
    }

    /// Job for (order, name), if any.
    pub fn find_job(&self, order_id: &str, name: &str) -> Result<Option<Job>> {
        self.store
            .find_one(JOBS, &json!({ "orderID": order_id, "name": name }))?
            .map(|r| r.decode())
            .transpose()
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.store
            .find_one(JOBS, &json!({ "_id": id }))?
            .map(|r| r.decode())
            .transpose()
    }

    /// All jobs of an order, oldest first.
    pub fn list_jobs(&self, order_id: &str) -> Result<Vec<Job>> {
        self.store
            .find(JOBS, &json!({ "orderID": order_id }))?
            .iter()
            .map(|r| r.decode())
            .collect()
    }
}
