//! Fan-out/fan-in batch runner.
//!
//! A batch is `total` copies of one logical operation. Each copy runs as its
//! own job on a [`WorkerPool`] as wide as the batch, so every operation of a
//! batch is in flight at once, limited only by the connection pool. Jobs
//! report `(index, result)` over a channel and the orchestrator waits for all
//! `total` reports before moving on. Results are placed by index, never by
//! arrival order, which is what lets later batches address the documents a
//! create batch made by position.
//!
//! A failing operation is logged with its batch and index and recorded in
//! its slot. It never stops the batch or any other operation in it.
mod report;

use std::{
    io,
    sync::{Arc, mpsc},
    time::Instant,
};

use bson::{DateTime, Document, doc, oid::ObjectId};
use log::{error, info, warn};

pub use report::{BatchReport, IdentifierSet, RunSummary};

use crate::{
    client::{Client, ClientError},
    config::Config,
    pool::Connector,
    protocol::{Action, Envelope, OperationResult},
    thread::WorkerPool,
};

/// What every job of a batch shares.
struct Context<C: Connector> {
    client: Arc<Client<C>>,
    database: String,
    collection: String,
    limit: i64,
}

impl<C: Connector> Context<C> {
    /// Envelope tagged `<batch>-<index>` so the proxy's logs tie it to its task.
    fn envelope(
        &self,
        batch: &str,
        index: usize,
        action: Action,
        document: Document,
    ) -> Envelope {
        Envelope::new(action, &self.database, &self.collection, document)
            .with_correlation_id(format!("{batch}-{index}"))
    }
}

pub struct Orchestrator<C: Connector> {
    ctx: Arc<Context<C>>,
    workers: WorkerPool,
    total: usize,
}

fn settle(outcome: Result<OperationResult, ClientError>) -> OperationResult {
    outcome.unwrap_or_else(OperationResult::from_error)
}

impl<C: Connector + 'static> Orchestrator<C> {
    pub fn new(client: Arc<Client<C>>, config: &Config) -> io::Result<Self> {
        Ok(Self {
            ctx: Arc::new(Context {
                client,
                database: config.database.clone(),
                collection: config.collection.clone(),
                limit: config.limit,
            }),
            workers: WorkerPool::new("batch", config.concurrency.max(1))?,
            total: config.total,
        })
    }

    /// Run every batch in order against one set of freshly created documents.
    pub fn run(&self) -> RunSummary {
        let mut summary = RunSummary::default();

        let (created, ids) = self.create();
        summary.batches.push(created);
        summary.counts.push(("after create", self.count()));

        summary.batches.push(self.retrieve(&ids));
        summary.batches.push(self.retrieve_sorted());
        summary.batches.push(self.update(&ids));
        summary.batches.push(self.update_by_query(&ids));
        summary.batches.push(self.delete(&ids));
        summary.counts.push(("after delete", self.count()));

        summary.identifiers = ids;
        info!(
            "run finished: {} batches, {} failed operations",
            summary.batches.len(),
            summary.failed()
        );
        summary
    }

    /// Create `total` documents; the returned set maps task index to document id.
    pub fn create(&self) -> (BatchReport, IdentifierSet) {
        let report = self.fan_out("crud.create", |index, ctx| {
            let id = ObjectId::new();
            let envelope = ctx.envelope(
                "crud.create",
                index,
                Action::Create,
                doc! { "_id": id, "time": DateTime::now() },
            );

            let mut result = settle(ctx.client.create(envelope));
            if result.is_success() {
                result.identifier = Some(id);
            }
            result
        });

        let ids = IdentifierSet::from(&report);
        info!("created {} of {} documents", ids.populated(), ids.len());
        (report, ids)
    }

    pub fn retrieve(&self, ids: &IdentifierSet) -> BatchReport {
        self.by_identifier("crud.retrieve", ids, |id, _, ctx| {
            ctx.client
                .query(&ctx.database, &ctx.collection, doc! { "_id": id })
        })
    }

    /// Multi-document retrieves, ascending by `_id` on even indices and descending on odd.
    pub fn retrieve_sorted(&self) -> BatchReport {
        self.fan_out("crud.retrieveMultiple", |index, ctx| {
            let order = if index % 2 == 0 { 1 } else { -1 };
            let options = doc! { "sort": { "_id": order }, "limit": ctx.limit };
            settle(ctx.client.query_with_options(
                &ctx.database,
                &ctx.collection,
                doc! {},
                Some(options),
            ))
        })
    }

    pub fn update(&self, ids: &IdentifierSet) -> BatchReport {
        self.by_identifier("crud.update", ids, |id, index, ctx| {
            let document = doc! { "_id": id, "index": index as i64, "modified": DateTime::now() };
            ctx.client
                .update(ctx.envelope("crud.update", index, Action::Update, document))
        })
    }

    /// Updates addressed by a `{filter, update}` pair instead of a bare id.
    pub fn update_by_query(&self, ids: &IdentifierSet) -> BatchReport {
        self.by_identifier("crud.updateByQuery", ids, |id, index, ctx| {
            let document = doc! {
                "filter": { "_id": id },
                "update": { "$set": { "queried": true, "modified": DateTime::now() } },
            };
            ctx.client
                .update(ctx.envelope("crud.updateByQuery", index, Action::Update, document))
        })
    }

    pub fn delete(&self, ids: &IdentifierSet) -> BatchReport {
        self.by_identifier("crud.delete", ids, |id, _, ctx| {
            ctx.client
                .delete(&ctx.database, &ctx.collection, doc! { "_id": id })
        })
    }

    /// Documents currently in the target collection, `None` if the count failed.
    pub fn count(&self) -> Option<i64> {
        match self
            .ctx
            .client
            .count(&self.ctx.database, &self.ctx.collection, doc! {})
        {
            Ok(count) => {
                info!("{}:{} holds {count} documents", self.ctx.database, self.ctx.collection);
                Some(count)
            }
            Err(e) => {
                warn!("crud.count - error counting documents: {e}");
                None
            }
        }
    }

    /// Fan out an operation over the documents in `ids`. Empty slots fail locally.
    fn by_identifier<F>(&self, name: &'static str, ids: &IdentifierSet, op: F) -> BatchReport
    where
        F: Fn(ObjectId, usize, &Context<C>) -> Result<OperationResult, ClientError>
            + Send
            + Sync
            + 'static,
    {
        let ids = Arc::new(ids.clone());
        self.fan_out(name, move |index, ctx| match ids.get(index) {
            Some(id) => settle(op(id, index, ctx)),
            None => OperationResult::from_error(ClientError::MissingIdentifier(index)),
        })
    }

    fn fan_out<F>(&self, name: &'static str, task: F) -> BatchReport
    where
        F: Fn(usize, &Context<C>) -> OperationResult + Send + Sync + 'static,
    {
        let started = Instant::now();
        let task = Arc::new(task);
        let (tx, rx) = mpsc::channel();

        for index in 0..self.total {
            let task = Arc::clone(&task);
            let ctx = Arc::clone(&self.ctx);
            let tx = tx.clone();
            let scheduled = self.workers.execute(move || {
                let _ = tx.send((index, task(index, &ctx)));
            });
            if let Err(e) = scheduled {
                error!("{name} - failed to schedule task {index}: {e}");
            }
        }
        drop(tx);

        let mut slots: Vec<Option<OperationResult>> = (0..self.total).map(|_| None).collect();
        for _ in 0..self.total {
            let Ok((index, result)) = rx.recv() else {
                break;
            };
            if let Some(failure) = result.failure() {
                warn!("{name} - error on document {index}: {failure}");
            }
            slots[index] = Some(result);
        }

        let results: Vec<OperationResult> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    error!("{name} - task {index} never reported");
                    OperationResult::from_error(ClientError::Abandoned(index))
                })
            })
            .collect();

        let report = BatchReport {
            name,
            results,
            elapsed: started.elapsed(),
        };
        info!(
            "{name} - {} of {} succeeded in {:?}",
            report.succeeded(),
            report.total(),
            report.elapsed
        );
        report
    }
}
