//! Stage graph validation and ordering

use std::collections::{HashMap, HashSet, VecDeque};

use super::stage::StageDef;

/// Graph validation errors
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum GraphError {
    /// Workflow has no stages
    #[error("workflow has no stages")]
    Empty,

    /// Two stages share a name
    #[error("duplicate stage name: {0}")]
    DuplicateStage(String),

    /// A dependency references no known stage
    #[error("stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency { stage: String, dependency: String },

    /// The dependency edges contain a cycle
    #[error("dependency cycle involving stages: {0:?}")]
    Cycle(Vec<String>),

    /// Two stages declare the same output key
    #[error("stages '{first}' and '{second}' both declare output key '{key}'")]
    OutputCollision {
        key: String,
        first: String,
        second: String,
    },
}

/// A validated, topologically ordered stage DAG.
#[derive(Debug)]
pub struct StageGraph {
    stages: Vec<StageDef>,
    /// Indices into `stages` in topological order.
    order: Vec<usize>,
    /// Dependency depth per stage (roots are level 0).
    levels: HashMap<String, u32>,
}

impl StageGraph {
    /// Validate and order a set of stages.
    ///
    /// Checks: non-empty, unique names, known dependencies, acyclicity, and
    /// output-key uniqueness across the whole workflow (parallel branches
    /// merge downstream, so any shared key could collide).
    pub fn new(stages: Vec<StageDef>) -> Result<Self, GraphError> {
        if stages.is_empty() {
            return Err(GraphError::Empty);
        }

        let mut index_of = HashMap::new();
        for (i, stage) in stages.iter().enumerate() {
            if index_of.insert(stage.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateStage(stage.name.clone()));
            }
        }

        let mut output_owner: HashMap<&str, &str> = HashMap::new();
        for stage in &stages {
            for key in &stage.outputs {
                if let Some(first) = output_owner.insert(key, &stage.name) {
                    return Err(GraphError::OutputCollision {
                        key: key.clone(),
                        first: first.to_string(),
                        second: stage.name.clone(),
                    });
                }
            }
        }

        // Kahn's algorithm; also yields levels for display and scheduling.
        let mut in_degree = vec![0usize; stages.len()];
        let mut successors: Vec<Vec<usize>> = vec![vec![]; stages.len()];
        for (i, stage) in stages.iter().enumerate() {
            for dep in &stage.depends_on {
                let &j = index_of
                    .get(dep)
                    .ok_or_else(|| GraphError::UnknownDependency {
                        stage: stage.name.clone(),
                        dependency: dep.clone(),
                    })?;
                successors[j].push(i);
                in_degree[i] += 1;
            }
        }

        let mut ready: VecDeque<usize> = (0..stages.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(stages.len());
        let mut levels: HashMap<String, u32> = HashMap::new();

        while let Some(i) = ready.pop_front() {
            let level = stages[i]
                .depends_on
                .iter()
                .filter_map(|d| levels.get(d))
                .max()
                .map(|l| l + 1)
                .unwrap_or(0);
            levels.insert(stages[i].name.clone(), level);
            order.push(i);

            for &succ in &successors[i] {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    ready.push_back(succ);
                }
            }
        }

        if order.len() != stages.len() {
            let ordered: HashSet<usize> = order.iter().copied().collect();
            let cyclic = stages
                .iter()
                .enumerate()
                .filter(|(i, _)| !ordered.contains(i))
                .map(|(_, s)| s.name.clone())
                .collect();
            return Err(GraphError::Cycle(cyclic));
        }

        Ok(Self {
            stages,
            order,
            levels,
        })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Stages in topological order.
    pub fn topo_order(&self) -> impl Iterator<Item = &StageDef> {
        self.order.iter().map(|&i| &self.stages[i])
    }

    /// Dependency depth of a stage (roots are 0).
    pub fn level(&self, stage: &str) -> Option<u32> {
        self.levels.get(stage).copied()
    }

    pub fn get(&self, stage: &str) -> Option<&StageDef> {
        self.stages.iter().find(|s| s.name == stage)
    }
}
