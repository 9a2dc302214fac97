//! Orchestrator — provisions every resource of an order in dependency order.
//!
//! A run takes the order lock, builds the dependency graph from declared
//! parents and output references, then dispatches resources whose
//! dependencies are settled onto spawned tasks, at most `concurrency` at a
//! time. The job ledger decides whether a resource is skipped, resumed or
//! created; a failure blocks everything downstream of it while independent
//! branches keep going.
//!
//! The lock is renewed while the run is in progress. A run whose lock was
//! taken over stops dispatching and leaves the order status to the new holder.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::{Map, Value};
use tokio::task::JoinError;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use cloudshop_core::{Error, OrchestratorSettings, Result};
use cloudshop_store::input::{merge_inputs, referenced_parents};
use cloudshop_store::{
    DocumentStore, Job, JobLedger, JobPatch, JobStatus, NewJob, Order, OrderBook, OrderLock,
    OrderStatus, ResourceRef, ResourceRegistry, ResourceTemplate,
};

use crate::capability::{Capability, CapabilityRequest};
use crate::graph::Dag;
use crate::resolver::resolve;
use crate::types::{OrchestrationReport, ResourceOutcome, ResourceState, RunOptions};

#[derive(Clone)]
pub struct Orchestrator {
    orders: OrderBook,
    registry: ResourceRegistry,
    ledger: JobLedger,
    capability: Arc<dyn Capability>,
    settings: OrchestratorSettings,
    default_region: String,
}

/// One resource with everything resolved at planning time.
struct Planned {
    resource: ResourceRef,
    /// `None` when the registry has no template for the type.
    template: Option<ResourceTemplate>,
    dependencies: Vec<String>,
}

/// A dispatched resource task; dropping it detaches the task.
type Running = BoxFuture<'static, (String, std::result::Result<ResourceOutcome, JoinError>)>;

struct Plan {
    order: Order,
    sequence: Vec<String>,
    resources: HashMap<String, Arc<Planned>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<DocumentStore>,
        capability: Arc<dyn Capability>,
        settings: OrchestratorSettings,
        default_region: impl Into<String>,
    ) -> Self {
        Self {
            orders: OrderBook::new(store.clone()),
            registry: ResourceRegistry::new(store.clone()),
            ledger: JobLedger::new(store),
            capability,
            settings,
            default_region: default_region.into(),
        }
    }

    /// Provision every resource of `order_id`.
    ///
    /// # Errors
    ///
    /// Order-level failures only: [`Error::NotFound`] for a missing order,
    /// [`Error::AlreadyRunning`] when another run holds the lock, and
    /// [`Error::Validation`] / [`Error::DependencyCycle`] for a malformed
    /// graph. Those abort before any capability call. Per-resource failures
    /// are reported in the returned results.
    pub async fn orchestrate(
        &self,
        order_id: &str,
        options: RunOptions,
    ) -> Result<OrchestrationReport> {
        let (order, lock) = self
            .orders
            .acquire_lock(order_id, self.settings.grace_period)?;
        info!(
            "Orchestrating order {} ({} resources)",
            order_id,
            order.resources.len()
        );

        let plan = match self.plan(order) {
            Ok(plan) => plan,
            Err(e) => {
                error!("Order {} cannot be scheduled: {}", order_id, e);
                self.orders.release_lock(&lock, OrderStatus::Failed)?;
                return Err(e);
            }
        };

        let results = self.execute(&plan, &lock, options).await;
        let success = results.iter().all(|r| r.status.is_done());

        let final_status = if success {
            OrderStatus::Completed
        } else {
            OrderStatus::Failed
        };
        if !self.orders.release_lock(&lock, final_status)? {
            error!("Order {} was taken over by another run mid-flight", order_id);
        }
        info!(
            "Order {} finished: {:?} ({} resources)",
            order_id,
            final_status,
            results.len()
        );

        Ok(OrchestrationReport {
            order_id: order_id.to_string(),
            success,
            results,
        })
    }

    /// Look up templates and order resources by their dependencies.
    fn plan(&self, order: Order) -> Result<Plan> {
        let mut names = HashSet::new();
        for resource in &order.resources {
            if !names.insert(resource.name.as_str()) {
                return Err(Error::Validation(format!(
                    "duplicate resource name {} in order {}",
                    resource.name, order.id
                )));
            }
        }

        // `order` only breaks ties; the sort is stable so listing order wins next.
        let mut listed: Vec<&ResourceRef> = order.resources.iter().collect();
        listed.sort_by_key(|r| r.order);

        let mut resources = HashMap::new();
        let mut edges = Vec::with_capacity(listed.len());
        for resource in listed {
            let template = match self.registry.lookup(&resource.resource_type) {
                Ok(template) => Some(template),
                Err(Error::NotFound(_)) => {
                    warn!(
                        "No template for {} ({}) in order {}",
                        resource.name, resource.resource_type, order.id
                    );
                    None
                }
                Err(e) => return Err(e),
            };

            let mut dependencies = resource.parent.clone();
            let inputs = match &template {
                Some(t) => merge_inputs(&t.inputs, &resource.inputs),
                None => resource.inputs.clone(),
            };
            for parent in referenced_parents(&inputs) {
                // References outside the order stay unresolved rather than ordering anything.
                if names.contains(parent.as_str()) && !dependencies.contains(&parent) {
                    dependencies.push(parent);
                }
            }

            edges.push((resource.name.clone(), dependencies.clone()));
            resources.insert(
                resource.name.clone(),
                Arc::new(Planned {
                    resource: resource.clone(),
                    template,
                    dependencies,
                }),
            );
        }

        let dag = Dag::from_dependencies(
            edges
                .iter()
                .map(|(name, deps)| (name.as_str(), deps.iter().map(String::as_str))),
        )?;
        let sequence = dag.toposort()?;

        for planned in resources.values() {
            check_parent_types(planned, &resources);
        }
        debug!("Order {} schedule: {:?}", order.id, sequence);

        Ok(Plan {
            order,
            sequence,
            resources,
        })
    }

    async fn execute(
        &self,
        plan: &Plan,
        lock: &OrderLock,
        options: RunOptions,
    ) -> Vec<ResourceOutcome> {
        let concurrency = self.settings.concurrency.max(1);
        let order = Arc::new(plan.order.clone());
        let mut outcomes: HashMap<String, ResourceOutcome> = HashMap::new();
        let mut dispatched: HashSet<String> = HashSet::new();
        let mut running: FuturesUnordered<Running> = FuturesUnordered::new();

        let mut heartbeat = tokio::time::interval(
            (self.settings.grace_period / 3).max(Duration::from_millis(10)),
        );
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut lock_held = true;

        loop {
            for name in &plan.sequence {
                if dispatched.contains(name) {
                    continue;
                }
                let planned = &plan.resources[name];

                if !lock_held {
                    let mut outcome = ResourceOutcome::new(
                        name,
                        &planned.resource.resource_type,
                        ResourceState::Blocked,
                    );
                    outcome.error = Some("order lock was taken over".to_string());
                    dispatched.insert(name.clone());
                    outcomes.insert(name.clone(), outcome);
                    continue;
                }
                if running.len() >= concurrency {
                    continue;
                }

                let mut settled = true;
                let mut blocked_by = None;
                for dep in &planned.dependencies {
                    match outcomes.get(dep).map(|o| o.status) {
                        None => settled = false,
                        Some(ResourceState::Failed | ResourceState::Blocked) => {
                            blocked_by.get_or_insert_with(|| dep.clone());
                        }
                        Some(_) => {}
                    }
                }

                if let Some(dep) = blocked_by {
                    warn!("{} blocked: dependency {} did not complete", name, dep);
                    let mut outcome = ResourceOutcome::new(
                        name,
                        &planned.resource.resource_type,
                        ResourceState::Blocked,
                    );
                    outcome.error = Some(format!("dependency {} did not complete", dep));
                    dispatched.insert(name.clone());
                    outcomes.insert(name.clone(), outcome);
                    continue;
                }
                if !settled {
                    continue;
                }

                dispatched.insert(name.clone());
                let this = self.clone();
                let order = order.clone();
                let planned = planned.clone();
                let task_name = name.clone();
                let handle =
                    tokio::spawn(async move { this.provision(&order, &planned, options).await });
                running.push(async move { (task_name, handle.await) }.boxed());
            }

            // Dispatch follows topological order, so an idle pass means every
            // resource has been dispatched or blocked.
            if running.is_empty() {
                break;
            }

            tokio::select! {
                finished = running.next() => {
                    if let Some((name, joined)) = finished {
                        let outcome = match joined {
                            Ok(outcome) => outcome,
                            Err(e) => {
                                let err =
                                    Error::Internal(format!("task for {} aborted: {}", name, e));
                                error!("{}", err);
                                ResourceOutcome::new(
                                    &name,
                                    &plan.resources[&name].resource.resource_type,
                                    ResourceState::Failed,
                                )
                                .with_error(&err)
                            }
                        };
                        outcomes.insert(name, outcome);
                    }
                }
                _ = heartbeat.tick() => {}
            }
            if lock_held {
                lock_held = self.renew_lock(lock);
            }
        }

        plan.sequence
            .iter()
            .filter_map(|name| outcomes.remove(name))
            .collect()
    }

    /// Drive one resource to a terminal outcome. Never fails the run.
    async fn provision(
        &self,
        order: &Order,
        planned: &Planned,
        options: RunOptions,
    ) -> ResourceOutcome {
        let resource = &planned.resource;
        let outcome = ResourceOutcome::new(
            &resource.name,
            &resource.resource_type,
            ResourceState::Failed,
        );

        let previous = match self.ledger.find_job(&order.id, &resource.name) {
            Ok(previous) => previous,
            Err(e) => return outcome.with_error(&e),
        };
        if let Some(job) = &previous {
            match job.status {
                JobStatus::Completed => {
                    debug!("{} already completed as job {}", resource.name, job.id);
                    let mut skipped = outcome.with_job(&job.id).with_outputs(job.outputs.clone());
                    skipped.status = ResourceState::Skipped;
                    return skipped;
                }
                JobStatus::Created if !self.is_stale(job) => {
                    info!("{} is in flight as job {}", resource.name, job.id);
                    let mut in_flight = outcome.with_job(&job.id);
                    in_flight.status = ResourceState::InFlight;
                    return in_flight;
                }
                _ => {}
            }
        }

        let parent_outputs = match self.parent_outputs(order, planned) {
            Ok(outputs) => outputs,
            Err(e) => {
                warn!("{} not started: {}", resource.name, e);
                return outcome.with_error(&e);
            }
        };

        let Some(template) = &planned.template else {
            let err = Error::NotFound(format!("resource template {}", resource.resource_type));
            return outcome.with_error(&err);
        };

        let inputs = merge_inputs(&template.inputs, &resource.inputs);
        let resolution = match resolve(
            &inputs,
            &template.field_types,
            &order.input_fields,
            &parent_outputs,
        ) {
            Ok(resolution) => resolution,
            Err(e) => return outcome.with_error(&e),
        };

        let new_job = NewJob {
            order_id: order.id.clone(),
            name: resource.name.clone(),
            resource_type: resource.resource_type.clone(),
            api: template.api.clone(),
            region: order
                .region
                .clone()
                .unwrap_or_else(|| self.default_region.clone()),
            inputs: resolution.inputs.clone(),
            unresolved: resolution.unresolved.clone(),
        };
        let created = match &previous {
            Some(job) => self.ledger.restart_job(job, &new_job),
            None => self.ledger.create_job(&new_job),
        };
        let job = match created {
            Ok(job) => job,
            Err(Error::Conflict(reason)) => {
                info!("{} picked up elsewhere: {}", resource.name, reason);
                let mut in_flight = outcome;
                in_flight.status = ResourceState::InFlight;
                return in_flight;
            }
            Err(e) => return outcome.with_error(&e),
        };
        let outcome = outcome.with_job(&job.id);

        if !resolution.is_complete() && !options.allow_unresolved {
            let err = Error::UnresolvedPlaceholder(resolution.unresolved_expressions());
            warn!("{}: {}", resource.name, err);
            return self.record_failure(&job, outcome, err);
        }

        let request = CapabilityRequest {
            order_id: order.id.clone(),
            name: resource.name.clone(),
            resource_type: resource.resource_type.clone(),
            api: job.api.clone(),
            region: job.region.clone(),
            inputs: resolution.inputs,
        };
        info!(
            "Creating {} ({}) via {} [attempt {}]",
            resource.name, resource.resource_type, request.api, job.attempts
        );

        let limit = self.settings.capability_timeout;
        let result = match tokio::time::timeout(limit, self.capability.create(&request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(limit.as_secs())),
        };

        match result {
            Ok(outputs) => {
                if let Err(e) = self
                    .ledger
                    .update_job(&job.id, &JobPatch::completed(outputs.clone()))
                {
                    return outcome.with_error(&e);
                }
                info!("{} completed as job {}", resource.name, job.id);
                let mut completed = outcome.with_outputs(outputs);
                completed.status = ResourceState::Completed;
                completed
            }
            Err(e) => {
                error!("{} failed: {}", resource.name, e);
                self.record_failure(&job, outcome, e)
            }
        }
    }

    /// Outputs of every dependency, which must all have completed jobs.
    fn parent_outputs(
        &self,
        order: &Order,
        planned: &Planned,
    ) -> Result<HashMap<String, Map<String, Value>>> {
        let mut outputs = HashMap::new();
        for parent in &planned.dependencies {
            match self.ledger.find_job(&order.id, parent)? {
                Some(job) if job.status == JobStatus::Completed => {
                    outputs.insert(parent.clone(), job.outputs);
                }
                Some(job) => {
                    return Err(Error::ParentNotReady {
                        parent: parent.clone(),
                        reason: format!("job {} is {}", job.id, job.status.as_str()),
                    })
                }
                None => {
                    return Err(Error::ParentNotReady {
                        parent: parent.clone(),
                        reason: "no job recorded".to_string(),
                    })
                }
            }
        }
        Ok(outputs)
    }

    /// Keep the order lock fresh; `false` once another run has taken it over.
    fn renew_lock(&self, lock: &OrderLock) -> bool {
        match self.orders.renew_lock(lock) {
            Ok(()) => true,
            Err(e) => {
                error!("Order {} stops dispatching: {}", lock.order_id, e);
                false
            }
        }
    }

    fn record_failure(&self, job: &Job, outcome: ResourceOutcome, err: Error) -> ResourceOutcome {
        if let Err(e) = self.ledger.update_job(&job.id, &JobPatch::failed(err.to_string())) {
            warn!("Could not record failure of job {}: {}", job.id, e);
        }
        outcome.with_error(&err)
    }

    fn is_stale(&self, job: &Job) -> bool {
        Utc::now()
            .signed_duration_since(job.updated_at)
            .to_std()
            .map(|age| age > self.settings.grace_period)
            .unwrap_or(false)
    }
}

/// Template parent types are advisory: warn when no dependency provides one.
fn check_parent_types(planned: &Planned, resources: &HashMap<String, Arc<Planned>>) {
    let Some(template) = &planned.template else {
        return;
    };
    let provided: HashSet<&str> = planned
        .dependencies
        .iter()
        .filter_map(|dep| resources.get(dep))
        .map(|p| p.resource.resource_type.as_str())
        .collect();
    for expected in &template.parent {
        if !provided.contains(expected.as_str()) {
            warn!(
                "{} expects a {} parent but none is declared",
                planned.resource.name, expected
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use cloudshop_store::{InputValue, NewOrder};
    use serde_json::json;

    /// In-process capability that records calls and returns canned outputs.
    #[derive(Default)]
    struct MockCapability {
        calls: Mutex<Vec<CapabilityRequest>>,
        failing: Mutex<HashSet<String>>,
        outputs: HashMap<String, Map<String, Value>>,
        delay: Option<Duration>,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MockCapability {
        fn with_outputs(pairs: &[(&str, Value)]) -> Self {
            Self {
                outputs: pairs
                    .iter()
                    .map(|(name, v)| (name.to_string(), v.as_object().unwrap().clone()))
                    .collect(),
                ..Default::default()
            }
        }

        fn fail(&self, name: &str) {
            self.failing.lock().unwrap().insert(name.to_string());
        }

        fn recover(&self) {
            self.failing.lock().unwrap().clear();
        }

        fn called(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.name.clone())
                .collect()
        }

        fn request(&self, name: &str) -> CapabilityRequest {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.name == name)
                .cloned()
                .unwrap()
        }
    }

    #[async_trait]
    impl Capability for MockCapability {
        async fn create(&self, request: &CapabilityRequest) -> Result<Map<String, Value>> {
            self.calls.lock().unwrap().push(request.clone());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.failing.lock().unwrap().contains(&request.name) {
                return Err(Error::Capability(format!("{} exploded", request.name)));
            }
            Ok(self
                .outputs
                .get(&request.name)
                .cloned()
                .unwrap_or_else(|| {
                    let mut out = Map::new();
                    out.insert("Id".into(), json!(format!("{}-id", request.name)));
                    out
                }))
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        orders: OrderBook,
        ledger: JobLedger,
        registry: ResourceRegistry,
        capability: Arc<MockCapability>,
        _dir: tempfile::TempDir,
    }

    fn harness(capability: MockCapability, settings: OrchestratorSettings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(DocumentStore::open(dir.path().join("cloudshop.db")).unwrap());
        let capability = Arc::new(capability);
        let orchestrator =
            Orchestrator::new(store.clone(), capability.clone(), settings, "us-east-1");
        let registry = ResourceRegistry::new(store.clone());
        for (ty, api, inputs) in [
            (
                "VPC",
                "/api/aws/ec2/create-vpc",
                json!({"CidrBlock": "10.0.0.0/16", "name": "inputFields.sitename"}),
            ),
            (
                "Subnet",
                "/api/aws/ec2/create-subnet",
                json!({"VpcId": "{{vpc.outputs.VpcId}}", "CidrBlock": "10.0.1.0/24"}),
            ),
            ("Generic", "/api/generic", json!({})),
        ] {
            registry
                .register(&ResourceTemplate {
                    id: None,
                    resource_type: ty.to_string(),
                    api: api.to_string(),
                    inputs: InputValue::parse_map(inputs.as_object().unwrap()).unwrap(),
                    parent: Vec::new(),
                    field_types: BTreeMap::new(),
                })
                .unwrap();
        }
        Harness {
            orchestrator,
            orders: OrderBook::new(store.clone()),
            ledger: JobLedger::new(store),
            registry,
            capability,
            _dir: dir,
        }
    }

    fn resource(name: &str, ty: &str, parents: &[&str], inputs: Value) -> ResourceRef {
        ResourceRef {
            name: name.to_string(),
            resource_type: ty.to_string(),
            parent: parents.iter().map(|p| p.to_string()).collect(),
            order: 0,
            inputs: InputValue::parse_map(inputs.as_object().unwrap()).unwrap(),
        }
    }

    fn place(h: &Harness, resources: Vec<ResourceRef>) -> String {
        h.orders
            .create_order(&NewOrder {
                bundle: "starter".into(),
                plan: "basic".into(),
                region: None,
                input_fields: BTreeMap::from([("sitename".to_string(), "acme".to_string())]),
                resources,
                status: OrderStatus::Submitted,
            })
            .unwrap()
    }

    fn vpc_job(order_id: &str) -> NewJob {
        NewJob {
            order_id: order_id.to_string(),
            name: "vpc".into(),
            resource_type: "VPC".into(),
            api: "/api/aws/ec2/create-vpc".into(),
            region: "us-east-1".into(),
            inputs: Map::new(),
            unresolved: Vec::new(),
        }
    }

    fn statuses(report: &OrchestrationReport) -> Vec<(String, ResourceState)> {
        report
            .results
            .iter()
            .map(|r| (r.name.clone(), r.status))
            .collect()
    }

    #[tokio::test]
    async fn test_single_vpc_order() {
        let h = harness(
            MockCapability::with_outputs(&[("vpc", json!({"VpcId": "vpc-123"}))]),
            OrchestratorSettings::default(),
        );
        let order_id = place(&h, vec![resource("vpc", "VPC", &[], json!({}))]);

        let report = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();

        assert!(report.success);
        let vpc = report.outcome("vpc").unwrap();
        assert_eq!(vpc.status, ResourceState::Completed);
        assert_eq!(vpc.outputs.as_ref().unwrap()["VpcId"], "vpc-123");

        let request = h.capability.request("vpc");
        assert_eq!(request.api, "/api/aws/ec2/create-vpc");
        assert_eq!(request.region, "us-east-1");
        assert_eq!(request.inputs["name"], "acme");
        assert_eq!(request.inputs["CidrBlock"], "10.0.0.0/16");
        assert_eq!(request.body()["name"], "acme");

        let job = h.ledger.find_job(&order_id, "vpc").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.outputs["VpcId"], "vpc-123");
        assert_eq!(
            h.orders.get_order(&order_id).unwrap().status,
            OrderStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_output_reference_orders_and_resolves() {
        let h = harness(
            MockCapability::with_outputs(&[("vpc", json!({"VpcId": "vpc-123"}))]),
            OrchestratorSettings::default(),
        );
        // subnet is listed first and only references vpc through its inputs
        let order_id = place(
            &h,
            vec![
                resource("subnet", "Subnet", &[], json!({})),
                resource("vpc", "VPC", &[], json!({})),
            ],
        );

        let report = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();

        assert!(report.success);
        assert_eq!(h.capability.called(), vec!["vpc", "subnet"]);
        assert_eq!(h.capability.request("subnet").inputs["VpcId"], "vpc-123");
        let names: Vec<&str> = report.results.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["vpc", "subnet"]);
    }

    #[tokio::test]
    async fn test_rerun_skips_everything() {
        let h = harness(MockCapability::default(), OrchestratorSettings::default());
        let order_id = place(
            &h,
            vec![
                resource("vpc", "VPC", &[], json!({})),
                resource("subnet", "Subnet", &["vpc"], json!({})),
            ],
        );

        h.orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();
        assert_eq!(h.capability.called().len(), 2);

        let again = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();
        assert!(again.success);
        assert!(again
            .results
            .iter()
            .all(|r| r.status == ResourceState::Skipped));
        assert_eq!(h.capability.called().len(), 2);
        assert_eq!(h.ledger.list_jobs(&order_id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cycle_rejected_before_any_call() {
        let h = harness(MockCapability::default(), OrchestratorSettings::default());
        let order_id = place(
            &h,
            vec![
                resource("a", "Generic", &[], json!({"X": "b.outputs.Id"})),
                resource("b", "Generic", &[], json!({"Y": "{{a.outputs.Id}}"})),
            ],
        );

        let err = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DependencyCycle(_)));
        assert!(h.capability.called().is_empty());
        assert!(h.ledger.list_jobs(&order_id).unwrap().is_empty());
        assert_eq!(
            h.orders.get_order(&order_id).unwrap().status,
            OrderStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_self_reference_rejected() {
        let h = harness(MockCapability::default(), OrchestratorSettings::default());
        let order_id = place(
            &h,
            vec![resource("a", "Generic", &[], json!({"X": "a.outputs.Id"}))],
        );
        let err = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DependencyCycle(_)));
        assert!(h.capability.called().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_parent_is_validation_error() {
        let h = harness(MockCapability::default(), OrchestratorSettings::default());
        let order_id = place(
            &h,
            vec![resource("subnet", "Generic", &["missing"], json!({}))],
        );
        let err = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(h.capability.called().is_empty());
    }

    #[tokio::test]
    async fn test_missing_order() {
        let h = harness(MockCapability::default(), OrchestratorSettings::default());
        let err = h
            .orchestrator
            .orchestrate("nope", RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_failure_blocks_descendants_only() {
        let capability = MockCapability::default();
        capability.fail("subnet");
        let h = harness(capability, OrchestratorSettings::default());
        let order_id = place(
            &h,
            vec![
                resource("vpc", "Generic", &[], json!({})),
                resource("subnet", "Generic", &["vpc"], json!({})),
                resource("sg", "Generic", &["vpc"], json!({})),
                resource("ec2", "Generic", &["subnet", "sg"], json!({})),
                resource("volume", "Generic", &["ec2"], json!({})),
                resource("bucket", "Generic", &[], json!({})),
            ],
        );

        let report = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();

        assert!(!report.success);
        let states: HashMap<String, ResourceState> = statuses(&report).into_iter().collect();
        assert_eq!(states["vpc"], ResourceState::Completed);
        assert_eq!(states["subnet"], ResourceState::Failed);
        assert_eq!(states["sg"], ResourceState::Completed);
        assert_eq!(states["ec2"], ResourceState::Blocked);
        assert_eq!(states["volume"], ResourceState::Blocked);
        assert_eq!(states["bucket"], ResourceState::Completed);

        let subnet = report.outcome("subnet").unwrap();
        assert_eq!(subnet.error_kind.as_deref(), Some("capability"));
        let job = h.ledger.find_job(&order_id, "subnet").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(h.ledger.find_job(&order_id, "ec2").unwrap().is_none());
        assert_eq!(
            h.orders.get_order(&order_id).unwrap().status,
            OrderStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_each_resource_visited_once_after_its_parents() {
        let h = harness(
            MockCapability {
                delay: Some(Duration::from_millis(10)),
                ..Default::default()
            },
            OrchestratorSettings {
                concurrency: 3,
                ..Default::default()
            },
        );
        let order_id = place(
            &h,
            vec![
                resource("vpc", "Generic", &[], json!({})),
                resource("a", "Generic", &["vpc"], json!({})),
                resource("b", "Generic", &["vpc"], json!({})),
                resource("c", "Generic", &["a", "b"], json!({})),
                resource("d", "Generic", &[], json!({})),
            ],
        );

        let report = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();
        assert!(report.success);

        let calls = h.capability.called();
        assert_eq!(calls.len(), 5);
        let unique: HashSet<&String> = calls.iter().collect();
        assert_eq!(unique.len(), 5);
        let pos = |n: &str| calls.iter().position(|c| c == n).unwrap();
        assert!(pos("vpc") < pos("a"));
        assert!(pos("vpc") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("c"));
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let h = harness(
            MockCapability {
                delay: Some(Duration::from_millis(30)),
                ..Default::default()
            },
            OrchestratorSettings {
                concurrency: 2,
                ..Default::default()
            },
        );
        let resources = (0..6)
            .map(|i| resource(&format!("r{}", i), "Generic", &[], json!({})))
            .collect();
        let order_id = place(&h, resources);

        let report = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(h.capability.called().len(), 6);
        assert!(h.capability.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_parent_not_ready_while_created() {
        let h = harness(MockCapability::default(), OrchestratorSettings::default());
        let order_id = place(
            &h,
            vec![
                resource("vpc", "VPC", &[], json!({})),
                resource("subnet", "Subnet", &[], json!({})),
            ],
        );
        // Another run is still creating the vpc
        h.ledger.create_job(&vpc_job(&order_id)).unwrap();

        let report = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();

        assert!(!report.success);
        assert_eq!(
            report.outcome("vpc").unwrap().status,
            ResourceState::InFlight
        );
        let subnet = report.outcome("subnet").unwrap();
        assert_eq!(subnet.status, ResourceState::Failed);
        assert_eq!(subnet.error_kind.as_deref(), Some("parent_not_ready"));
        assert!(h.capability.called().is_empty());
    }

    #[tokio::test]
    async fn test_second_run_is_rejected_while_locked() {
        let h = harness(MockCapability::default(), OrchestratorSettings::default());
        let order_id = place(&h, vec![resource("vpc", "VPC", &[], json!({}))]);
        h.orders
            .acquire_lock(&order_id, Duration::from_secs(900))
            .unwrap();

        let err = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));
        assert!(h.capability.called().is_empty());
    }

    #[tokio::test]
    async fn test_capability_timeout_fails_job() {
        let h = harness(
            MockCapability {
                delay: Some(Duration::from_millis(500)),
                ..Default::default()
            },
            OrchestratorSettings {
                capability_timeout: Duration::from_millis(20),
                ..Default::default()
            },
        );
        let order_id = place(&h, vec![resource("vpc", "VPC", &[], json!({}))]);

        let report = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();
        let vpc = report.outcome("vpc").unwrap();
        assert_eq!(vpc.status, ResourceState::Failed);
        assert_eq!(vpc.error_kind.as_deref(), Some("timeout"));
        let job = h.ledger.find_job(&order_id, "vpc").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_unresolved_placeholder_fails_unless_allowed() {
        let h = harness(MockCapability::default(), OrchestratorSettings::default());
        let order_id = place(
            &h,
            vec![resource(
                "vpc",
                "VPC",
                &[],
                json!({"Owner": "inputFields.owner"}),
            )],
        );

        let report = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();
        let vpc = report.outcome("vpc").unwrap();
        assert_eq!(vpc.status, ResourceState::Failed);
        assert_eq!(vpc.error_kind.as_deref(), Some("unresolved_placeholder"));
        assert!(h.capability.called().is_empty());

        let job = h.ledger.find_job(&order_id, "vpc").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.unresolved[0].key, "Owner");

        let report = h
            .orchestrator
            .orchestrate(
                &order_id,
                RunOptions {
                    allow_unresolved: true,
                },
            )
            .await
            .unwrap();
        assert!(report.success);
        assert!(h.capability.request("vpc").inputs["Owner"].is_null());
    }

    #[tokio::test]
    async fn test_failed_job_is_retried_on_next_run() {
        let capability = MockCapability::default();
        capability.fail("vpc");
        let h = harness(capability, OrchestratorSettings::default());
        let order_id = place(&h, vec![resource("vpc", "VPC", &[], json!({}))]);

        let first = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();
        assert!(!first.success);

        h.capability.recover();
        let second = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();
        assert!(second.success);

        let jobs = h.ledger.list_jobs(&order_id).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Completed);
        assert_eq!(jobs[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_missing_template_is_local_failure() {
        let h = harness(MockCapability::default(), OrchestratorSettings::default());
        let order_id = place(
            &h,
            vec![
                resource("db", "AWS::RDS::DBInstance", &[], json!({})),
                resource("vpc", "VPC", &[], json!({})),
            ],
        );
        assert!(h.registry.lookup("AWS::RDS::DBInstance").is_err());

        let report = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();
        assert!(!report.success);
        let db = report.outcome("db").unwrap();
        assert_eq!(db.status, ResourceState::Failed);
        assert_eq!(db.error_kind.as_deref(), Some("not_found"));
        assert_eq!(
            report.outcome("vpc").unwrap().status,
            ResourceState::Completed
        );
    }

    #[tokio::test]
    async fn test_fresh_created_job_stays_in_flight() {
        let h = harness(MockCapability::default(), OrchestratorSettings::default());
        let order_id = place(&h, vec![resource("vpc", "VPC", &[], json!({}))]);
        h.ledger.create_job(&vpc_job(&order_id)).unwrap();

        let report = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();
        assert!(!report.success);
        assert_eq!(
            report.outcome("vpc").unwrap().status,
            ResourceState::InFlight
        );
        assert!(h.capability.called().is_empty());

        let job = h.ledger.find_job(&order_id, "vpc").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn test_abandoned_created_job_is_restarted() {
        let h = harness(
            MockCapability::with_outputs(&[("vpc", json!({"VpcId": "vpc-123"}))]),
            OrchestratorSettings {
                grace_period: Duration::from_millis(50),
                ..Default::default()
            },
        );
        let order_id = place(&h, vec![resource("vpc", "VPC", &[], json!({}))]);
        h.ledger.create_job(&vpc_job(&order_id)).unwrap();
        // Nobody touches the job for longer than the grace period
        tokio::time::sleep(Duration::from_millis(80)).await;

        let report = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(
            report.outcome("vpc").unwrap().status,
            ResourceState::Completed
        );
        assert_eq!(h.capability.called(), vec!["vpc"]);

        let jobs = h.ledger.list_jobs(&order_id).unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, JobStatus::Completed);
        assert_eq!(jobs[0].attempts, 2);
        assert_eq!(jobs[0].outputs["VpcId"], "vpc-123");
    }

    #[tokio::test]
    async fn test_run_longer_than_grace_period_keeps_its_lock() {
        let h = harness(
            MockCapability {
                delay: Some(Duration::from_millis(60)),
                ..Default::default()
            },
            OrchestratorSettings {
                concurrency: 1,
                grace_period: Duration::from_millis(100),
                ..Default::default()
            },
        );
        let order_id = place(
            &h,
            vec![
                resource("r0", "Generic", &[], json!({})),
                resource("r1", "Generic", &["r0"], json!({})),
                resource("r2", "Generic", &["r1"], json!({})),
            ],
        );

        let first = {
            let orchestrator = h.orchestrator.clone();
            let order_id = order_id.clone();
            tokio::spawn(async move {
                orchestrator
                    .orchestrate(&order_id, RunOptions::default())
                    .await
            })
        };

        // Well past the grace period, with r2 still being created
        tokio::time::sleep(Duration::from_millis(150)).await;
        let err = h
            .orchestrator
            .orchestrate(&order_id, RunOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));

        let report = first.await.unwrap().unwrap();
        assert!(report.success);
        assert_eq!(h.capability.called(), vec!["r0", "r1", "r2"]);
        assert_eq!(
            h.orders.get_order(&order_id).unwrap().status,
            OrderStatus::Completed
        );
    }

    #[tokio::test]
    async fn test_taken_over_run_stops_dispatching() {
        let h = harness(
            MockCapability {
                delay: Some(Duration::from_millis(40)),
                ..Default::default()
            },
            OrchestratorSettings {
                concurrency: 1,
                ..Default::default()
            },
        );
        let order_id = place(
            &h,
            vec![
                resource("r0", "Generic", &[], json!({})),
                resource("r1", "Generic", &["r0"], json!({})),
            ],
        );

        let first = {
            let orchestrator = h.orchestrator.clone();
            let order_id = order_id.clone();
            tokio::spawn(async move {
                orchestrator
                    .orchestrate(&order_id, RunOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // Another holder replaces the lock while r0 is being created
        let (_, _other) = h.orders.acquire_lock(&order_id, Duration::ZERO).unwrap();

        let report = first.await.unwrap().unwrap();
        assert!(!report.success);
        assert_eq!(
            report.outcome("r0").unwrap().status,
            ResourceState::Completed
        );
        let r1 = report.outcome("r1").unwrap();
        assert_eq!(r1.status, ResourceState::Blocked);
        assert_eq!(h.capability.called(), vec!["r0"]);
        // The superseded run leaves the new holder's status alone
        assert_eq!(
            h.orders.get_order(&order_id).unwrap().status,
            OrderStatus::InProgress
        );
    }
}
