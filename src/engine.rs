//! The engine owns every launched job and routes control to them.
//!
//! Jobs are addressed by any unique prefix of their id, so interactive
//! callers can type the first few characters instead of a full uuid.

use std::collections::HashMap;

use log::info;
use tokio::sync::mpsc;

use crate::config::EngineConfig;
use crate::plan::{OperatorId, Workflow, WorkflowError};
use crate::runtime::{
    launch, BreakpointId, BreakpointSpec, JobError, JobEvent, JobHandle, JobId, JobPhase,
};
use crate::tuple::Tuple;

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("invalid workflow: {0}")]
    Workflow(#[from] WorkflowError),
    #[error("no job matches '{0}'")]
    UnknownJob(String),
    #[error("'{0}' matches more than one job, give more of the id")]
    AmbiguousJob(String),
    #[error(transparent)]
    Job(#[from] JobError),
}

pub struct Engine {
    config: EngineConfig,
    jobs: HashMap<JobId, JobHandle>,
}

impl Default for Engine {
    fn default() -> Self {
        Engine::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Engine {
            config,
            jobs: HashMap::new(),
        }
    }

    /// Validates the workflow and launches its topology. The job sits in
    /// [`JobPhase::Created`] until [`Engine::start`] is called.
    pub fn submit(&mut self, workflow: Workflow) -> Result<JobId, EngineError> {
        workflow.validate()?;
        let id = JobId::new();
        let handle = launch(workflow, self.config.clone(), id);
        self.jobs.insert(id, handle);
        info!("job {id} submitted");
        Ok(id)
    }

    pub async fn start(&self, job: &str) -> Result<JobId, EngineError> {
        let id = self.resolve(job)?;
        self.handle(id)?.start().await?;
        info!("job {id} started");
        Ok(id)
    }

    pub fn pause(&self, job: &str) -> Result<JobId, EngineError> {
        let id = self.resolve(job)?;
        self.handle(id)?.pause()?;
        Ok(id)
    }

    pub fn resume(&self, job: &str) -> Result<JobId, EngineError> {
        let id = self.resolve(job)?;
        self.handle(id)?.resume()?;
        Ok(id)
    }

    /// Tears the job down and drops it from the registry.
    pub async fn kill(&mut self, job: &str) -> Result<JobId, EngineError> {
        let id = self.resolve(job)?;
        if let Some(handle) = self.jobs.remove(&id) {
            handle.deactivate().await;
        }
        info!("job {id} killed");
        Ok(id)
    }

    pub async fn add_breakpoint(
        &self,
        job: &str,
        operator: OperatorId,
        spec: BreakpointSpec,
    ) -> Result<BreakpointId, EngineError> {
        let id = self.resolve(job)?;
        Ok(self.handle(id)?.add_breakpoint(operator, spec).await?)
    }

    pub fn phase(&self, job: &str) -> Result<JobPhase, EngineError> {
        let id = self.resolve(job)?;
        Ok(self.handle(id)?.phase())
    }

    /// Snapshot of every registered job, ordered by id for stable listings.
    pub fn jobs(&self) -> Vec<(JobId, JobPhase)> {
        let mut listing: Vec<_> = self.jobs.values().map(|h| (h.id, h.phase())).collect();
        listing.sort_by_key(|(id, _)| id.to_string());
        listing
    }

    /// The terminal tuple stream, available once per job.
    pub fn take_results(
        &mut self,
        job: &str,
    ) -> Result<Option<mpsc::UnboundedReceiver<Tuple>>, EngineError> {
        let id = self.resolve(job)?;
        Ok(self.jobs.get_mut(&id).and_then(|h| h.take_results()))
    }

    /// The lifecycle event stream, available once per job.
    pub fn take_events(
        &mut self,
        job: &str,
    ) -> Result<Option<mpsc::UnboundedReceiver<JobEvent>>, EngineError> {
        let id = self.resolve(job)?;
        Ok(self.jobs.get_mut(&id).and_then(|h| h.take_events()))
    }

    /// Deactivates everything still registered.
    pub async fn shutdown(&mut self) {
        for (_, handle) in self.jobs.drain() {
            handle.deactivate().await;
        }
    }

    fn resolve(&self, prefix: &str) -> Result<JobId, EngineError> {
        let mut matched: Vec<JobId> = self
            .jobs
            .keys()
            .filter(|id| id.to_string().starts_with(prefix))
            .copied()
            .collect();
        match matched.len() {
            0 => Err(EngineError::UnknownJob(prefix.to_string())),
            1 => Ok(matched.remove(0)),
            _ => Err(EngineError::AmbiguousJob(prefix.to_string())),
        }
    }

    fn handle(&self, id: JobId) -> Result<&JobHandle, EngineError> {
        self.jobs
            .get(&id)
            .ok_or_else(|| EngineError::UnknownJob(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use futures::StreamExt;
    use tokio_stream::wrappers::UnboundedReceiverStream;

    use super::*;
    use crate::plan::{OperatorKind, SourceSpec};
    use crate::processor::group_by::Aggregate;
    use crate::tuple::{FieldType, FieldValue, TableId};

    fn engine(dir: &tempfile::TempDir) -> Engine {
        Engine::new(EngineConfig::default().with_spill_dir(dir.path()))
    }

    fn int(tuple: &Tuple, index: usize) -> i64 {
        match tuple.field(index) {
            Some(FieldValue::Int(v)) => *v,
            other => panic!("expected int at {index}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn shuffled_group_by_counts_every_key_once() {
        let rows: Vec<Vec<String>> = (0..100)
            .map(|i| vec![(i % 10).to_string(), format!("item{i}")])
            .collect();
        let mut workflow = Workflow::new();
        let scan = workflow.add_with_parallelism(
            OperatorKind::Scan {
                table: TableId(1),
                types: vec![FieldType::Int, FieldType::String],
                source: SourceSpec::Values(rows),
            },
            Some(3),
        );
        let group = workflow.add_with_parallelism(
            OperatorKind::GroupBy {
                keys: vec![0],
                agg: Aggregate::Count,
            },
            Some(2),
        );
        workflow.connect(scan, group);

        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(&dir);
        let id = engine.submit(workflow).unwrap().to_string();
        let mut results = engine.take_results(&id).unwrap().unwrap();
        let mut events = engine.take_events(&id).unwrap().unwrap();
        engine.start(&id).await.unwrap();

        let mut counts = HashMap::new();
        while let Some(tuple) = results.recv().await {
            counts.insert(int(&tuple, 0), int(&tuple, 1));
        }
        assert_eq!(counts.len(), 10);
        assert!(counts.values().all(|&count| count == 10), "{counts:?}");

        let mut completions = 0;
        while let Some(event) = events.recv().await {
            if matches!(event, JobEvent::Completed) {
                completions += 1;
            }
        }
        assert_eq!(completions, 1);
        assert_eq!(engine.phase(&id).unwrap(), JobPhase::Completed);
    }

    #[tokio::test]
    async fn paused_job_holds_the_stream_until_resumed() {
        let mut workflow = Workflow::new();
        let scan = workflow.add(OperatorKind::Scan {
            table: TableId(1),
            types: vec![FieldType::Int, FieldType::String, FieldType::Int],
            source: SourceSpec::Generate {
                count: 200,
                pace: Some(Duration::from_millis(1)),
            },
        });
        let count = workflow.add(OperatorKind::Count);
        workflow.connect(scan, count);

        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(&dir);
        let id = engine.submit(workflow).unwrap().to_string();
        let mut results = engine.take_results(&id).unwrap().unwrap();
        let mut events = engine.take_events(&id).unwrap().unwrap();
        engine.start(&id).await.unwrap();

        engine.pause(&id).unwrap();
        loop {
            match events.recv().await {
                Some(JobEvent::Paused) => break,
                Some(other) => panic!("expected Paused first, got {other:?}"),
                None => panic!("events closed before the pause settled"),
            }
        }
        assert_eq!(engine.phase(&id).unwrap(), JobPhase::Paused);
        assert!(results.try_recv().is_err());

        engine.resume(&id).unwrap();
        let total = results.recv().await.expect("the job never finished");
        assert_eq!(int(&total, 0), 200);
        assert!(results.recv().await.is_none());

        let mut saw_resumed = false;
        let mut completions = 0;
        while let Some(event) = events.recv().await {
            match event {
                JobEvent::Resumed => saw_resumed = true,
                JobEvent::Completed => completions += 1,
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_resumed);
        assert_eq!(completions, 1);
    }

    #[tokio::test]
    async fn hash_join_pairs_build_and_probe_rows() {
        let users = vec![
            vec!["1".into(), "ada".into()],
            vec!["2".into(), "grace".into()],
            vec!["3".into(), "alan".into()],
        ];
        let orders = vec![
            vec!["10".into(), "1".into()],
            vec!["20".into(), "2".into()],
            vec!["30".into(), "1".into()],
        ];
        let mut workflow = Workflow::new();
        let user_scan = workflow.add(OperatorKind::Scan {
            table: TableId(1),
            types: vec![FieldType::Int, FieldType::String],
            source: SourceSpec::Values(users),
        });
        let order_scan = workflow.add(OperatorKind::Scan {
            table: TableId(2),
            types: vec![FieldType::Int, FieldType::Int],
            source: SourceSpec::Values(orders),
        });
        let join = workflow.add(OperatorKind::HashJoin {
            build_table: TableId(1),
            build_field: 0,
            probe_field: 1,
        });
        workflow.connect(user_scan, join);
        workflow.connect(order_scan, join);

        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(&dir);
        let id = engine.submit(workflow).unwrap().to_string();
        let results = engine.take_results(&id).unwrap().unwrap();
        engine.start(&id).await.unwrap();

        let joined: Vec<Tuple> = UnboundedReceiverStream::new(results).collect().await;
        let mut names = vec![];
        for tuple in &joined {
            assert_eq!(int(tuple, 1), int(tuple, 2));
            match tuple.field(3) {
                Some(FieldValue::String(name)) => names.push(name.clone()),
                other => panic!("expected a name, got {other:?}"),
            }
        }
        names.sort();
        assert_eq!(names, ["ada", "ada", "grace"]);
    }

    #[tokio::test]
    async fn breakpoints_on_unknown_operators_are_rejected() {
        let mut workflow = Workflow::new();
        let scan = workflow.add(OperatorKind::Scan {
            table: TableId(1),
            types: vec![FieldType::Int],
            source: SourceSpec::Values(vec![vec!["1".into()]]),
        });
        let count = workflow.add(OperatorKind::Count);
        workflow.connect(scan, count);

        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(&dir);
        let id = engine.submit(workflow).unwrap().to_string();

        let err = engine
            .add_breakpoint(&id, OperatorId(42), BreakpointSpec::Count { target: 5 })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::Job(JobError::UnknownOperator(OperatorId(42)))
        ));
        engine.kill(&id).await.unwrap();
    }

    #[tokio::test]
    async fn job_prefixes_resolve_uniquely() {
        let simple = || {
            let mut workflow = Workflow::new();
            workflow.add(OperatorKind::Scan {
                table: TableId(1),
                types: vec![FieldType::Int],
                source: SourceSpec::Values(vec![vec!["1".into()]]),
            });
            workflow
        };

        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(&dir);
        let first = engine.submit(simple()).unwrap();
        let second = engine.submit(simple()).unwrap();

        assert_eq!(engine.resolve(&first.to_string()).unwrap(), first);
        assert!(matches!(
            engine.resolve(""),
            Err(EngineError::AmbiguousJob(_))
        ));
        assert!(matches!(
            engine.resolve("not-a-job"),
            Err(EngineError::UnknownJob(_))
        ));
        assert_eq!(engine.jobs().len(), 2);

        engine.kill(&second.to_string()).await.unwrap();
        assert_eq!(engine.jobs().len(), 1);
        engine.shutdown().await;
        assert!(engine.jobs().is_empty());
    }
}
