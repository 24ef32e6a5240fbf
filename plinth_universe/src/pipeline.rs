//! Pipeline workflow graph.
//!
//! Each pipeline is an ordered set of mutator nodes assembled into a DAG at
//! deploy time from the nodes' `run_after`/`run_before` declarations. During
//! a run, ready nodes are dispatched onto the shared thread pool; each node
//! notifies its dependants with an atomic countdown and the last dependency
//! wakes them. Checkpoints are zero-work nodes other mutators order
//! themselves against.

use crate::mutator::{ExecuteContext, Mutator};
use crate::DeployError;
use fxhash::FxHashMap;
use parking_lot::Mutex;
use plinth_core::interner::InternedString;
use std::sync::atomic::{AtomicUsize, Ordering};

pub(crate) enum NodeKind {
    Mutator(Mutex<Box<dyn Mutator>>),
    Checkpoint,
}

pub(crate) struct PipelineNode {
    pub name: InternedString,
    pub kind: NodeKind,
}

pub struct Pipeline {
    name: InternedString,
    nodes: Vec<PipelineNode>,
    dependants: Vec<Vec<usize>>,
    dependency_counts: Vec<usize>,
    awaiting: Vec<AtomicUsize>,
}

/// Edge declarations gathered from one node's deploy call.
pub(crate) struct NodeOrdering {
    pub run_after: Vec<InternedString>,
    pub run_before: Vec<InternedString>,
}

impl Pipeline {
    /// Assembles the graph. `orderings[i]` belongs to `nodes[i]`; names that
    /// match no mutator node and no group become checkpoint nodes.
    pub(crate) fn assemble(
        name: InternedString,
        mut nodes: Vec<PipelineNode>,
        orderings: Vec<NodeOrdering>,
        groups: &FxHashMap<InternedString, Vec<usize>>,
    ) -> Result<Pipeline, DeployError> {
        debug_assert_eq!(nodes.len(), orderings.len());

        let mut by_name: FxHashMap<InternedString, usize> = FxHashMap::default();
        for (index, node) in nodes.iter().enumerate() {
            by_name.insert(node.name, index);
        }

        // Resolve a referenced name to the set of node indices it denotes,
        // creating a checkpoint node on first reference to an unknown name.
        let mut resolve = |name: InternedString,
                           nodes: &mut Vec<PipelineNode>,
                           by_name: &mut FxHashMap<InternedString, usize>|
         -> Vec<usize> {
            if let Some(index) = by_name.get(&name) {
                return vec![*index];
            }
            if let Some(members) = groups.get(&name) {
                return members.clone();
            }
            let index = nodes.len();
            nodes.push(PipelineNode {
                name,
                kind: NodeKind::Checkpoint,
            });
            by_name.insert(name, index);
            vec![index]
        };

        let mut edges: Vec<(usize, usize)> = Vec::new();
        for (index, ordering) in orderings.iter().enumerate() {
            for dependency in &ordering.run_after {
                for source in resolve(*dependency, &mut nodes, &mut by_name) {
                    if source != index {
                        edges.push((source, index));
                    }
                }
            }
            for dependant in &ordering.run_before {
                for target in resolve(*dependant, &mut nodes, &mut by_name) {
                    if target != index {
                        edges.push((index, target));
                    }
                }
            }
        }

        edges.sort_unstable();
        edges.dedup();

        let mut dependants = vec![Vec::new(); nodes.len()];
        let mut dependency_counts = vec![0usize; nodes.len()];
        for (source, target) in edges {
            dependants[source].push(target);
            dependency_counts[target] += 1;
        }

        // Kahn pass: every node must be reachable or the declarations cycle.
        let mut remaining = dependency_counts.clone();
        let mut queue: Vec<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(index, _)| index)
            .collect();
        let mut visited = 0;
        while let Some(index) = queue.pop() {
            visited += 1;
            for dependant in &dependants[index] {
                remaining[*dependant] -= 1;
                if remaining[*dependant] == 0 {
                    queue.push(*dependant);
                }
            }
        }
        if visited != nodes.len() {
            return Err(DeployError::PipelineCycle { pipeline: name });
        }

        let awaiting = nodes.iter().map(|_| AtomicUsize::new(0)).collect();
        Ok(Pipeline {
            name,
            nodes,
            dependants,
            dependency_counts,
            awaiting,
        })
    }

    pub fn name(&self) -> InternedString {
        self.name
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Runs every mutator node exactly once, respecting graph edges. Returns
    /// when all nodes and all detached tasks have completed.
    pub fn execute(&self, pool: &rayon::ThreadPool) {
        tracing::trace!(pipeline = self.name.as_str(), "pipeline run started");

        for (index, count) in self.dependency_counts.iter().enumerate() {
            self.awaiting[index].store(*count, Ordering::SeqCst);
        }

        pool.scope(|scope| {
            for (index, count) in self.dependency_counts.iter().enumerate() {
                if *count == 0 {
                    self.spawn_node(scope, index);
                }
            }
        });

        tracing::trace!(pipeline = self.name.as_str(), "pipeline run finished");
    }

    fn spawn_node<'s>(&'s self, scope: &rayon::Scope<'s>, index: usize) {
        scope.spawn(move |scope| self.run_node(scope, index));
    }

    fn run_node<'s>(&'s self, scope: &rayon::Scope<'s>, index: usize) {
        let node = &self.nodes[index];
        if let NodeKind::Mutator(mutator) = &node.kind {
            let context = ExecuteContext {
                scope,
                pipeline: self.name,
                mutator: node.name,
            };
            mutator.lock().execute(&context);
        }

        // Wake dependants whose last dependency just finished.
        for dependant in &self.dependants[index] {
            if self.awaiting[*dependant].fetch_sub(1, Ordering::SeqCst) == 1 {
                self.spawn_node(scope, *dependant);
            }
        }
    }

    pub(crate) fn undeploy(&mut self) {
        for node in &mut self.nodes {
            if let NodeKind::Mutator(mutator) = &mut node.kind {
                mutator.get_mut().undeploy();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    struct OrderProbe {
        order: Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
        after: Vec<&'static str>,
        before: Vec<&'static str>,
    }

    impl Mutator for OrderProbe {
        fn deploy(&mut self, context: &mut crate::mutator::DeployContext<'_>) -> Result<(), DeployError> {
            for name in &self.after {
                context.run_after(name);
            }
            for name in &self.before {
                context.run_before(name);
            }
            Ok(())
        }

        fn execute(&mut self, _context: &ExecuteContext<'_, '_>) {
            self.order.lock().push(self.label);
        }
    }

    fn assemble_probes(probes: Vec<OrderProbe>) -> Pipeline {
        let repository = plinth_core::Repository::new(
            "test",
            plinth_core::RegistryBuilder::new().build(),
        );
        let configurations = FxHashMap::default();

        let mut nodes = Vec::new();
        let mut orderings = Vec::new();
        for probe in probes {
            let name = InternedString::new(probe.label);
            let mut boxed: Box<dyn Mutator> = Box::new(probe);
            let mut context = crate::mutator::DeployContext::new(&repository, &configurations);
            boxed.deploy(&mut context).unwrap();
            orderings.push(NodeOrdering {
                run_after: context.run_after,
                run_before: context.run_before,
            });
            nodes.push(PipelineNode {
                name,
                kind: NodeKind::Mutator(Mutex::new(boxed)),
            });
        }

        Pipeline::assemble(
            InternedString::new("test_pipeline"),
            nodes,
            orderings,
            &FxHashMap::default(),
        )
        .unwrap()
    }

    #[test]
    fn edges_order_execution() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pipeline = assemble_probes(vec![
            OrderProbe {
                order: order.clone(),
                label: "third",
                after: vec!["second"],
                before: vec![],
            },
            OrderProbe {
                order: order.clone(),
                label: "first",
                after: vec![],
                before: vec!["second"],
            },
            OrderProbe {
                order: order.clone(),
                label: "second",
                after: vec![],
                before: vec![],
            },
        ]);

        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        pipeline.execute(&pool);

        let observed = order.lock().clone();
        let position = |label| observed.iter().position(|seen| *seen == label).unwrap();
        assert_eq!(observed.len(), 3);
        assert!(position("first") < position("second"));
        assert!(position("second") < position("third"));
    }

    #[test]
    fn checkpoints_partition_the_graph() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let pipeline = assemble_probes(vec![
            OrderProbe {
                order: order.clone(),
                label: "late",
                after: vec![crate::frame::FRAME_END_CHECKPOINT],
                before: vec![],
            },
            OrderProbe {
                order: order.clone(),
                label: "early",
                after: vec![],
                before: vec![crate::frame::FRAME_END_CHECKPOINT],
            },
        ]);
        assert_eq!(pipeline.node_count(), 3);

        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        pipeline.execute(&pool);

        let observed = order.lock().clone();
        assert_eq!(observed, vec!["early", "late"]);
    }

    #[test]
    fn cycles_are_deployment_errors() {
        let nodes = vec![
            PipelineNode {
                name: InternedString::new("a"),
                kind: NodeKind::Checkpoint,
            },
            PipelineNode {
                name: InternedString::new("b"),
                kind: NodeKind::Checkpoint,
            },
        ];
        let orderings = vec![
            NodeOrdering {
                run_after: vec![InternedString::new("b")],
                run_before: vec![],
            },
            NodeOrdering {
                run_after: vec![InternedString::new("a")],
                run_before: vec![],
            },
        ];

        let result = Pipeline::assemble(
            InternedString::new("cyclic"),
            nodes,
            orderings,
            &FxHashMap::default(),
        );
        assert!(matches!(result, Err(DeployError::PipelineCycle { .. })));
    }

    #[test]
    fn detached_tasks_complete_before_pipeline_returns() {
        struct Detacher {
            counter: Arc<AtomicU32>,
        }

        impl Mutator for Detacher {
            fn execute(&mut self, context: &ExecuteContext<'_, '_>) {
                for _ in 0..16 {
                    let counter = self.counter.clone();
                    context.detach(move || {
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                }
            }
        }

        let counter = Arc::new(AtomicU32::new(0));
        let nodes = vec![PipelineNode {
            name: InternedString::new("detacher"),
            kind: NodeKind::Mutator(Mutex::new(Box::new(Detacher {
                counter: counter.clone(),
            }))),
        }];
        let orderings = vec![NodeOrdering {
            run_after: vec![],
            run_before: vec![],
        }];

        let pipeline = Pipeline::assemble(
            InternedString::new("detached"),
            nodes,
            orderings,
            &FxHashMap::default(),
        )
        .unwrap();

        let pool = rayon::ThreadPoolBuilder::new().num_threads(4).build().unwrap();
        pipeline.execute(&pool);
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }
}
