//! Stage registry and dependency resolution
//!
//! The registry holds immutable stage declarations and resolves them into a
//! sequence of concurrency groups via repeated topological layering (Kahn's
//! algorithm over the read/write key relation: stage A depends on stage B
//! when A reads a key B writes). All graph validation happens here, before
//! any stage runs.

use marketflow_core::{Error, Result, Stage};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Registry of declared stages
///
/// Registration is atomic: a stage that would duplicate a name or introduce
/// a dependency cycle is rejected and the registry is left unchanged.
#[derive(Default)]
pub struct StageRegistry {
    stages: Vec<Arc<dyn Stage>>,
}

impl StageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from a stage roster, validating each registration
    pub fn from_stages(stages: impl IntoIterator<Item = Arc<dyn Stage>>) -> Result<Self> {
        let mut registry = Self::new();
        for stage in stages {
            registry.register(stage)?;
        }
        Ok(registry)
    }

    /// Register a stage
    ///
    /// Fails with `DuplicateStage` if the name is taken, or
    /// `DependencyCycle` if the read/write graph would become cyclic.
    pub fn register(&mut self, stage: Arc<dyn Stage>) -> Result<()> {
        let name = &stage.spec().name;
        if self.stages.iter().any(|s| &s.spec().name == name) {
            return Err(Error::DuplicateStage(name.clone()));
        }

        self.stages.push(stage);
        if let Err(err) = self.layering() {
            self.stages.pop();
            return Err(err);
        }
        Ok(())
    }

    /// Look up a stage by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages
            .iter()
            .find(|s| s.spec().name == name)
            .cloned()
    }

    /// Names of all registered stages, in registration order
    pub fn stage_names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.spec().name.clone()).collect()
    }

    /// Number of registered stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Resolve the dependency graph into ordered concurrency groups
    ///
    /// Each group is a set of stages whose dependencies are satisfied by
    /// strictly earlier groups and which share a `concurrency_group` tag.
    /// Groups execute in sequence; stages within one group may execute in
    /// parallel. Two stages in the same group writing the same key are a
    /// configuration error, caught here rather than at run time.
    pub fn resolve_order(&self) -> Result<Vec<Vec<Arc<dyn Stage>>>> {
        let layers = self.layering()?;

        let mut groups = Vec::new();
        for layer in layers {
            // Partition the layer by concurrency group tag, preserving
            // registration order within and across partitions.
            let mut partitions: Vec<(String, Vec<usize>)> = Vec::new();
            for index in layer {
                let tag = &self.stages[index].spec().concurrency_group;
                match partitions.iter_mut().find(|(t, _)| t == tag) {
                    Some((_, members)) => members.push(index),
                    None => partitions.push((tag.clone(), vec![index])),
                }
            }

            for (_, members) in partitions {
                self.check_disjoint_writes(&members)?;
                groups.push(members.iter().map(|&i| Arc::clone(&self.stages[i])).collect());
            }
        }
        Ok(groups)
    }

    /// Kahn layering over stage indices; detects cycles
    fn layering(&self) -> Result<Vec<Vec<usize>>> {
        // key → indices of stages writing it
        let mut writers: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, stage) in self.stages.iter().enumerate() {
            for key in &stage.spec().writes {
                writers.entry(key.as_str()).or_default().push(i);
            }
        }

        // dependents[j] = stages that read something j writes
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.stages.len()];
        let mut indegree: Vec<usize> = vec![0; self.stages.len()];
        for (i, stage) in self.stages.iter().enumerate() {
            let mut deps = HashSet::new();
            for key in &stage.spec().reads {
                for &j in writers.get(key.as_str()).map_or(&[][..], Vec::as_slice) {
                    if j != i {
                        deps.insert(j);
                    }
                }
            }
            indegree[i] = deps.len();
            for j in deps {
                dependents[j].push(i);
            }
        }

        let mut layers = Vec::new();
        let mut placed = 0;
        let mut ready: Vec<usize> = (0..self.stages.len()).filter(|&i| indegree[i] == 0).collect();

        while !ready.is_empty() {
            ready.sort_unstable();
            placed += ready.len();
            let mut next = Vec::new();
            for &i in &ready {
                for &dep in &dependents[i] {
                    indegree[dep] -= 1;
                    if indegree[dep] == 0 {
                        next.push(dep);
                    }
                }
            }
            layers.push(std::mem::replace(&mut ready, next));
        }

        if placed < self.stages.len() {
            let stuck: Vec<&str> = (0..self.stages.len())
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.stages[i].spec().name.as_str())
                .collect();
            return Err(Error::DependencyCycle(stuck.join(", ")));
        }
        Ok(layers)
    }

    /// Reject two same-group stages declaring the same write key
    fn check_disjoint_writes(&self, members: &[usize]) -> Result<()> {
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for &i in members {
            let spec = self.stages[i].spec();
            for key in &spec.writes {
                if let Some(first) = seen.insert(key.as_str(), spec.name.as_str()) {
                    return Err(Error::ConflictingWrites {
                        key: key.clone(),
                        first: first.to_string(),
                        second: spec.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use marketflow_core::{RunConfig, StageSpec, StateUpdate, StateView};

    struct DeclaredStage {
        spec: StageSpec,
    }

    #[async_trait]
    impl Stage for DeclaredStage {
        fn spec(&self) -> &StageSpec {
            &self.spec
        }

        async fn run(&self, _input: &StateView, _config: &RunConfig) -> Result<StateUpdate> {
            Ok(StateUpdate::new())
        }
    }

    fn stage(spec: StageSpec) -> Arc<dyn Stage> {
        Arc::new(DeclaredStage { spec })
    }

    /// The market analysis roster shape: two parallel chains joined by
    /// chart and report stages.
    fn market_registry() -> StageRegistry {
        StageRegistry::from_stages([
            stage(
                StageSpec::new("market_research")
                    .writes(["market_trends", "market_data"])
                    .concurrency_group("research"),
            ),
            stage(
                StageSpec::new("company_analysis")
                    .writes(["company_analysis", "company_tech_data"])
                    .concurrency_group("research"),
            ),
            stage(
                StageSpec::new("consumer_analysis")
                    .reads(["market_trends"])
                    .writes(["consumer_patterns"])
                    .concurrency_group("analysis"),
            ),
            stage(
                StageSpec::new("stock_analysis")
                    .reads(["company_analysis"])
                    .writes(["stock_analysis"])
                    .concurrency_group("analysis"),
            ),
            stage(
                StageSpec::new("chart_generation")
                    .reads(["market_data", "consumer_patterns", "stock_analysis"])
                    .writes(["charts"])
                    .concurrency_group("synthesis"),
            ),
        ])
        .unwrap()
    }

    fn group_names(groups: &[Vec<Arc<dyn Stage>>]) -> Vec<Vec<String>> {
        groups
            .iter()
            .map(|g| g.iter().map(|s| s.spec().name.clone()).collect())
            .collect()
    }

    #[test]
    fn test_resolve_order_is_topological() {
        let registry = market_registry();
        let groups = registry.resolve_order().unwrap();
        let names = group_names(&groups);

        assert_eq!(
            names,
            vec![
                vec!["market_research".to_string(), "company_analysis".to_string()],
                vec!["consumer_analysis".to_string(), "stock_analysis".to_string()],
                vec!["chart_generation".to_string()],
            ]
        );

        // Every stage's dependencies appear in strictly earlier groups.
        let mut produced: HashSet<String> = HashSet::new();
        for group in &groups {
            for member in group {
                for read in &member.spec().reads {
                    if registry.stages.iter().any(|s| s.spec().writes.contains(read)) {
                        assert!(produced.contains(read), "dependency {read} not yet produced");
                    }
                }
            }
            for member in group {
                produced.extend(member.spec().writes.iter().cloned());
            }
        }
    }

    #[test]
    fn test_concurrency_group_tags_split_a_layer() {
        let registry = StageRegistry::from_stages([
            stage(StageSpec::new("a").writes(["ka"]).concurrency_group("g1")),
            stage(StageSpec::new("b").writes(["kb"]).concurrency_group("g2")),
            stage(StageSpec::new("c").writes(["kc"]).concurrency_group("g1")),
        ])
        .unwrap();

        let names = group_names(&registry.resolve_order().unwrap());
        assert_eq!(
            names,
            vec![
                vec!["a".to_string(), "c".to_string()],
                vec!["b".to_string()],
            ]
        );
    }

    #[test]
    fn test_duplicate_stage_rejected() {
        let mut registry = StageRegistry::new();
        registry
            .register(stage(StageSpec::new("market_research").writes(["market_trends"])))
            .unwrap();

        let err = registry
            .register(stage(StageSpec::new("market_research").writes(["other"])))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateStage(_)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_cycle_rejected_atomically() {
        let mut registry = StageRegistry::new();
        registry
            .register(stage(StageSpec::new("a").reads(["kb"]).writes(["ka"])))
            .unwrap();

        let before = registry.stage_names();
        let err = registry
            .register(stage(StageSpec::new("b").reads(["ka"]).writes(["kb"])))
            .unwrap_err();
        assert!(matches!(err, Error::DependencyCycle(_)));
        // Registry unchanged after the failed registration.
        assert_eq!(registry.stage_names(), before);
    }

    #[test]
    fn test_conflicting_writes_in_one_group() {
        let registry = StageRegistry::from_stages([
            stage(StageSpec::new("a").writes(["shared_key"]).concurrency_group("g")),
            stage(StageSpec::new("b").writes(["shared_key"]).concurrency_group("g")),
        ])
        .unwrap();

        let err = registry.resolve_order().unwrap_err();
        assert!(matches!(err, Error::ConflictingWrites { ref key, .. } if key == "shared_key"));
    }

    #[test]
    fn test_self_refinement_is_not_a_cycle() {
        // A stage may read and write the same key (refining its own field).
        let registry = StageRegistry::from_stages([stage(
            StageSpec::new("refiner").reads(["field"]).writes(["field"]),
        )])
        .unwrap();
        assert_eq!(registry.resolve_order().unwrap().len(), 1);
    }
}
