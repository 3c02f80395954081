//! Orchestration façade.
//!
//! Collaborators (the cloud transport, the host loop) talk to the agent
//! through this type. Inbound events become opaque JSON work items on the
//! queue; the single worker thread feeds them to the workflow engine.
//! Transport threads never block on the worker: they share only the work
//! queue, the shutdown and cancel flags, and the current-workflow-id cell.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use overair_queue::{WorkItem, WorkQueue, Worker};
use overair_trust::{RootKeyPackage, TrustStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::AgentError;
use crate::types::Deployment;
use crate::workflow::{SharedWorkflowId, WorkflowEngine};

/// Envelope carried on the work queue.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
enum WorkRequest {
    /// A desired-properties document to process.
    Deployment { document: String },
    Cancel { workflow_id: String },
    Tick,
}

/// The running agent: engine + queue + worker + trust store.
pub struct Agent {
    queue: Arc<WorkQueue>,
    worker: Option<Worker>,
    engine: Arc<Mutex<WorkflowEngine>>,
    trust: Arc<Mutex<TrustStore>>,
    shutdown: Arc<AtomicBool>,
    cancel: Arc<AtomicBool>,
    workflow_id: SharedWorkflowId,
}

impl Agent {
    /// Resume any persisted workflow, then start the worker thread.
    pub fn start(mut engine: WorkflowEngine, trust: TrustStore) -> Result<Self, AgentError> {
        engine.resume()?;

        let queue = WorkQueue::bounded(engine.config().work_queue_capacity);
        let cancel = engine.cancel_flag();
        let workflow_id = engine.shared_workflow_id();
        let engine = Arc::new(Mutex::new(engine));
        let shutdown = Arc::new(AtomicBool::new(false));

        let worker_engine = Arc::clone(&engine);
        let worker = Worker::start(
            Arc::clone(&queue),
            Arc::clone(&shutdown),
            move |item| process_item(&worker_engine, item),
        );

        Ok(Self {
            queue,
            worker: Some(worker),
            engine,
            trust: Arc::new(Mutex::new(trust)),
            shutdown,
            cancel,
            workflow_id,
        })
    }

    /// Inbound desired-properties change. Parses eagerly so malformed
    /// documents are rejected on the transport thread, then enqueues.
    pub fn on_desired_properties_changed(&self, json: &str) -> Result<(), AgentError> {
        let deployment = Deployment::from_json(json)?;
        debug!(workflow_id = %deployment.workflow_id, "deployment document accepted");
        self.enqueue(&WorkRequest::Deployment {
            document: json.to_string(),
        })
    }

    /// Request cancellation of a workflow.
    ///
    /// The cancel flag is raised immediately (when the id matches the
    /// in-flight workflow) so a blocked handler observes it; the terminal
    /// transition happens on the worker.
    pub fn cancel(&self, workflow_id: &str) -> Result<(), AgentError> {
        let matches_current = self
            .workflow_id
            .lock()
            .expect("workflow id cell poisoned")
            .as_deref()
            == Some(workflow_id);
        if matches_current {
            self.cancel.store(true, Ordering::Release);
        }
        self.enqueue(&WorkRequest::Cancel {
            workflow_id: workflow_id.to_string(),
        })
    }

    /// Periodic host tick; drives time-based retries.
    pub fn tick(&self) -> Result<(), AgentError> {
        self.enqueue(&WorkRequest::Tick)
    }

    /// Inbound root-key package. Verified and applied inline: trust
    /// updates never touch the worker.
    pub fn on_root_key_package_received(&self, json: &str) -> Result<(), AgentError> {
        let candidate = RootKeyPackage::parse(json)?;
        let mut trust = self.trust.lock().expect("trust store poisoned");
        trust.replace_if_newer(candidate)?;
        info!(
            version = trust.current().protected.version,
            "root key package updated"
        );
        Ok(())
    }

    /// Flip the shutdown flag. The worker drains its current item and
    /// exits; the join happens on drop (or [`Agent::join`]).
    pub fn shutdown(&self) {
        info!("shutdown requested");
        self.shutdown.store(true, Ordering::Release);
    }

    /// Shut down and wait for the worker to exit.
    pub fn join(mut self) {
        self.shutdown();
        if let Some(worker) = self.worker.take() {
            worker.join();
        }
    }

    /// Number of queued work items.
    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    /// Non-blocking idle probe; `false` while the worker holds the engine.
    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && self
                .engine
                .try_lock()
                .map(|engine| engine.is_idle())
                .unwrap_or(false)
    }

    /// Non-blocking probe for a pending reboot request.
    pub fn reboot_requested(&self) -> bool {
        self.engine
            .try_lock()
            .map(|engine| engine.reboot_requested())
            .unwrap_or(false)
    }

    /// Non-blocking probe for a pending agent-restart request.
    pub fn restart_requested(&self) -> bool {
        self.engine
            .try_lock()
            .map(|engine| engine.restart_requested())
            .unwrap_or(false)
    }

    fn enqueue(&self, request: &WorkRequest) -> Result<(), AgentError> {
        let payload = serde_json::to_string(request)
            .map_err(|e| AgentError::Config(format!("failed to encode work item: {e}")))?;
        if self.queue.enqueue(payload) {
            Ok(())
        } else {
            Err(AgentError::TransientIo("work queue full".into()))
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
    }
}

fn process_item(engine: &Arc<Mutex<WorkflowEngine>>, item: WorkItem) {
    let request: WorkRequest = match serde_json::from_str(item.payload()) {
        Ok(request) => request,
        Err(e) => {
            error!("dropping malformed work item: {e}");
            return;
        }
    };
    let mut engine = engine.lock().expect("engine poisoned");
    match request {
        WorkRequest::Deployment { document } => match Deployment::from_json(&document) {
            Ok(deployment) => engine.on_deployment_received(deployment),
            Err(e) => warn!("dropping malformed deployment document: {e}"),
        },
        WorkRequest::Cancel { workflow_id } => engine.cancel(&workflow_id),
        WorkRequest::Tick => {
            engine.tick(chrono::Utc::now().timestamp().max(0) as u64);
        }
    }
}
