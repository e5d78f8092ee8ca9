//! Logical job plans: a typed operator list plus directed edges. Everything
//! here is validated synchronously at submission, before any grain spawns;
//! the runtime only ever sees well-formed workflows.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parse_display::Display;

use crate::connector::{DataGenSource, FileSource, TupleSource, ValueSource};
use crate::exchange::sending::ShuffleKey;
use crate::exchange::GrainId;
use crate::processor::count::{CountFinal, CountPartial};
use crate::processor::filter::{CmpOp, Filter};
use crate::processor::group_by::{Aggregate, GroupBy};
use crate::processor::hash_join::HashJoin;
use crate::processor::keyword::KeywordSearch;
use crate::processor::materialize::Materializer;
use crate::processor::scan::ScanCast;
use crate::processor::BoxedProcessor;
use crate::tuple::{FieldType, FieldValue, TableId};

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[display("op{0}")]
pub struct OperatorId(pub u32);

#[derive(Debug, Clone)]
pub enum SourceSpec {
    Values(Vec<Vec<String>>),
    Generate { count: usize, pace: Option<Duration> },
    File(PathBuf),
}

#[derive(Debug, Clone)]
pub enum OperatorKind {
    Scan {
        table: TableId,
        types: Vec<FieldType>,
        source: SourceSpec,
    },
    Filter {
        field: usize,
        op: CmpOp,
        value: FieldValue,
    },
    KeywordSearch {
        field: usize,
        keyword: String,
    },
    Count,
    GroupBy {
        keys: Vec<usize>,
        agg: Aggregate,
    },
    HashJoin {
        build_table: TableId,
        build_field: usize,
        probe_field: usize,
    },
    Materialize {
        partitions: usize,
        key: Option<usize>,
    },
}

impl OperatorKind {
    pub fn name(&self) -> &'static str {
        match self {
            OperatorKind::Scan { .. } => "scan",
            OperatorKind::Filter { .. } => "filter",
            OperatorKind::KeywordSearch { .. } => "keyword",
            OperatorKind::Count => "count",
            OperatorKind::GroupBy { .. } => "group_by",
            OperatorKind::HashJoin { .. } => "hash_join",
            OperatorKind::Materialize { .. } => "materialize",
        }
    }

    fn is_scan(&self) -> bool {
        matches!(self, OperatorKind::Scan { .. })
    }
}

#[derive(Debug, Clone)]
pub struct OperatorSpec {
    pub id: OperatorId,
    pub kind: OperatorKind,
    /// Worker count of the operator's main layer; the engine default
    /// applies when absent.
    pub parallelism: Option<usize>,
}

/// Which sending strategy an edge into this operator must use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkStrategyKind {
    RoundRobin,
    Shuffle(ShuffleKey),
    Stream,
}

/// Worker layout of one operator: worker counts per layer and the strategy
/// wiring consecutive layers together.
pub struct OperatorTopology {
    pub layers: Vec<usize>,
    pub interlink: Vec<LinkStrategyKind>,
}

#[derive(thiserror::Error, Debug)]
pub enum WorkflowError {
    #[error("plan has no operators")]
    Empty,
    #[error("duplicate operator id {0}")]
    DuplicateOperator(OperatorId),
    #[error("edge references unknown operator {0}")]
    UnknownOperator(OperatorId),
    #[error("{0} connects to itself")]
    SelfEdge(OperatorId),
    #[error("scan operator {0} cannot have inputs")]
    ScanWithInputs(OperatorId),
    #[error("{0} ({1}) has no input edge")]
    MissingInput(OperatorId, &'static str),
    #[error("operator graph has a cycle")]
    Cycle,
    #[error("source file not found: {}", .0.display())]
    MissingSource(PathBuf),
}

#[derive(Default)]
pub struct Workflow {
    pub operators: Vec<OperatorSpec>,
    pub edges: Vec<(OperatorId, OperatorId)>,
}

impl Workflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: OperatorKind) -> OperatorId {
        self.add_with_parallelism(kind, None)
    }

    pub fn add_with_parallelism(
        &mut self,
        kind: OperatorKind,
        parallelism: Option<usize>,
    ) -> OperatorId {
        let id = OperatorId(self.operators.len() as u32);
        self.operators.push(OperatorSpec {
            id,
            kind,
            parallelism,
        });
        id
    }

    pub fn connect(&mut self, from: OperatorId, to: OperatorId) {
        self.edges.push((from, to));
    }

    pub fn operator(&self, id: OperatorId) -> Option<&OperatorSpec> {
        self.operators.iter().find(|op| op.id == id)
    }

    pub fn predecessors(&self, id: OperatorId) -> Vec<OperatorId> {
        self.edges
            .iter()
            .filter(|(_, to)| *to == id)
            .map(|(from, _)| *from)
            .collect()
    }

    pub fn successors(&self, id: OperatorId) -> Vec<OperatorId> {
        self.edges
            .iter()
            .filter(|(from, _)| *from == id)
            .map(|(_, to)| *to)
            .collect()
    }

    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.operators.is_empty() {
            return Err(WorkflowError::Empty);
        }
        for (i, op) in self.operators.iter().enumerate() {
            if self.operators[..i].iter().any(|o| o.id == op.id) {
                return Err(WorkflowError::DuplicateOperator(op.id));
            }
        }
        for (from, to) in &self.edges {
            for id in [from, to] {
                if self.operator(*id).is_none() {
                    return Err(WorkflowError::UnknownOperator(*id));
                }
            }
            if from == to {
                return Err(WorkflowError::SelfEdge(*from));
            }
        }
        for op in &self.operators {
            let inputs = self.predecessors(op.id).len();
            if op.kind.is_scan() {
                if inputs > 0 {
                    return Err(WorkflowError::ScanWithInputs(op.id));
                }
                if let OperatorKind::Scan {
                    source: SourceSpec::File(path),
                    ..
                } = &op.kind
                {
                    if !path.exists() {
                        return Err(WorkflowError::MissingSource(path.clone()));
                    }
                }
            } else if inputs == 0 {
                return Err(WorkflowError::MissingInput(op.id, op.kind.name()));
            }
        }
        self.topo_order().map(|_| ())
    }

    /// Kahn's algorithm; upstream operators come first.
    pub fn topo_order(&self) -> Result<Vec<OperatorId>, WorkflowError> {
        let mut in_degree: Vec<usize> = self
            .operators
            .iter()
            .map(|op| self.predecessors(op.id).len())
            .collect();
        let mut ready: Vec<OperatorId> = self
            .operators
            .iter()
            .zip(&in_degree)
            .filter(|(_, d)| **d == 0)
            .map(|(op, _)| op.id)
            .collect();
        let mut order = Vec::with_capacity(self.operators.len());
        while let Some(id) = ready.pop() {
            order.push(id);
            for next in self.successors(id) {
                if let Some(pos) = self.operators.iter().position(|op| op.id == next) {
                    in_degree[pos] -= 1;
                    if in_degree[pos] == 0 {
                        ready.push(next);
                    }
                }
            }
        }
        if order.len() != self.operators.len() {
            return Err(WorkflowError::Cycle);
        }
        Ok(order)
    }
}

/// Aggregates and joins emit fresh tuples; their table ids live above the
/// scan-assigned range so the two can never collide.
pub fn output_table(id: OperatorId) -> TableId {
    TableId(1_000 + id.0)
}

pub fn generate_topology(spec: &OperatorSpec, default_parallelism: usize) -> OperatorTopology {
    let parallelism = spec.parallelism.unwrap_or(default_parallelism).max(1);
    match spec.kind {
        // counting runs as parallel partial counters feeding one adder
        OperatorKind::Count => OperatorTopology {
            layers: vec![parallelism, 1],
            interlink: vec![LinkStrategyKind::RoundRobin],
        },
        _ => OperatorTopology {
            layers: vec![parallelism],
            interlink: vec![],
        },
    }
}

/// Strategy every edge into this operator must use, so co-partitioning is
/// decided by the consumer rather than the producer.
pub fn input_strategy(kind: &OperatorKind) -> LinkStrategyKind {
    match kind {
        OperatorKind::GroupBy { keys, .. } => {
            LinkStrategyKind::Shuffle(ShuffleKey::Field(keys.first().copied().unwrap_or(0)))
        }
        OperatorKind::HashJoin {
            build_table,
            build_field,
            probe_field,
        } => LinkStrategyKind::Shuffle(ShuffleKey::ByTable {
            build: *build_table,
            build_field: *build_field,
            probe_field: *probe_field,
        }),
        _ => LinkStrategyKind::RoundRobin,
    }
}

/// One place that knows which processor runs in which layer of which
/// operator kind.
pub fn build_processor(spec: &OperatorSpec, grain: GrainId, layer: usize, job_dir: &Path) -> BoxedProcessor {
    match &spec.kind {
        OperatorKind::Scan { table, types, .. } => Box::new(ScanCast::new(*table, types.clone())),
        OperatorKind::Filter { field, op, value } => {
            Box::new(Filter::new(*field, *op, value.clone()))
        }
        OperatorKind::KeywordSearch { field, keyword } => {
            Box::new(KeywordSearch::new(*field, keyword.clone()))
        }
        OperatorKind::Count => {
            if layer == 0 {
                Box::new(CountPartial::new(output_table(spec.id)))
            } else {
                Box::new(CountFinal::new(output_table(spec.id)))
            }
        }
        OperatorKind::GroupBy { keys, agg } => {
            Box::new(GroupBy::new(keys.clone(), *agg, output_table(spec.id)))
        }
        OperatorKind::HashJoin {
            build_table,
            build_field,
            probe_field,
        } => Box::new(HashJoin::new(
            *build_table,
            *build_field,
            *probe_field,
            output_table(spec.id),
        )),
        OperatorKind::Materialize { partitions, key } => Box::new(Materializer::new(
            job_dir.to_path_buf(),
            format!("{}_{}", spec.id, grain),
            *partitions,
            *key,
        )),
    }
}

/// Scan partitions each get their own connector instance.
pub fn build_source(
    spec: &OperatorSpec,
    partition: usize,
    partitions: usize,
) -> Option<Box<dyn TupleSource>> {
    let OperatorKind::Scan { table, source, .. } = &spec.kind else {
        return None;
    };
    Some(match source {
        SourceSpec::Values(rows) => Box::new(ValueSource::new(
            *table,
            rows.clone(),
            partition,
            partitions,
        )),
        SourceSpec::Generate { count, pace } => Box::new(DataGenSource::new(
            *table, *count, partition, partitions, *pace,
        )),
        SourceSpec::File(path) => {
            Box::new(FileSource::new(path.clone(), *table, partition, partitions))
        }
    })
}
