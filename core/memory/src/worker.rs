use anyhow::Result;
use companion_schemas::ReconcileRequest;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{error, info, warn};

use crate::database::Database;
use crate::reconciler::Reconciler;

/// Background worker that reconciles conversation excerpts asynchronously.
/// The chat path enqueues and returns immediately; extraction latency never
/// blocks a reply.
pub struct ReconciliationWorker {
    db: Arc<Mutex<Database>>,
    reconciler: Arc<Reconciler>,
    receiver: mpsc::UnboundedReceiver<ReconcileRequest>,
}

impl ReconciliationWorker {
    pub fn new(
        db: Arc<Mutex<Database>>,
        reconciler: Arc<Reconciler>,
        receiver: mpsc::UnboundedReceiver<ReconcileRequest>,
    ) -> Self {
        Self {
            db,
            reconciler,
            receiver,
        }
    }

    /// Worker loop - runs until the channel is closed.
    pub async fn run(mut self) {
        info!("Reconciliation worker started");

        while let Some(request) = self.receiver.recv().await {
            if let Err(e) = self.process(request).await {
                error!("Failed to process reconciliation request: {}", e);
                // One bad request must not stop the worker
            }
        }

        warn!("Reconciliation worker stopped - channel closed");
    }

    async fn process(&self, request: ReconcileRequest) -> Result<()> {
        info!("Reconciling excerpt for {}", request.persona_id);

        let db = self.db.lock().await;

        let persona = match db.get_persona(&request.persona_id)? {
            Some(persona) => persona,
            None => {
                warn!(
                    "Dropping reconciliation for unknown persona {}",
                    request.persona_id
                );
                return Ok(());
            }
        };

        let response = self
            .reconciler
            .reconcile(&db, &persona, &request.excerpt)
            .await?;

        if response.discarded {
            warn!("Extraction batch discarded for {}", request.persona_id);
        } else {
            info!(
                "Reconciled {}: +{} ~{} -{}",
                request.persona_id, response.added, response.updated, response.removed
            );
        }

        Ok(())
    }
}
