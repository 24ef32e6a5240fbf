use parking_lot::Mutex;
use plinth_core::prelude::*;
use plinth_core::reflection::StructDescription;
use plinth_core::repository::SingletonWriteQuery;
use plinth_universe::prelude::*;
use std::sync::Arc;

#[derive(Default)]
#[repr(C)]
struct TickCounter {
    ticks: u64,
}

impl Reflected for TickCounter {
    fn type_name() -> InternedString {
        intern("tick_counter")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<TickCounter>("tick_counter")
            .field("ticks", std::mem::offset_of!(TickCounter, ticks), FieldArchetype::U64)
            .build()
    }
}

#[derive(Default)]
#[repr(C)]
struct SimulationConfiguration {
    rate: u32,
    paused: bool,
}

impl Reflected for SimulationConfiguration {
    fn type_name() -> InternedString {
        intern("simulation_configuration")
    }

    fn describe() -> StructDescription {
        StructDescriptionBuilder::for_type::<SimulationConfiguration>("simulation_configuration")
            .field(
                "rate",
                std::mem::offset_of!(SimulationConfiguration, rate),
                FieldArchetype::U32,
            )
            .field(
                "paused",
                std::mem::offset_of!(SimulationConfiguration, paused),
                FieldArchetype::Bool,
            )
            .build()
    }
}

fn registry() -> Arc<Registry> {
    let mut builder = RegistryBuilder::new();
    builder.add_type::<TickCounter>();
    builder.add_type::<SimulationConfiguration>();
    builder.build()
}

struct CountTicks {
    write: Option<SingletonWriteQuery>,
    rate: u32,
    mirror: Arc<std::sync::atomic::AtomicU64>,
}

impl Mutator for CountTicks {
    fn deploy(&mut self, context: &mut DeployContext<'_>) -> Result<(), DeployError> {
        let storage = context.repository.open_singleton(intern("tick_counter"))?;
        self.write = Some(storage.write_query()?);
        self.rate = context
            .configuration::<SimulationConfiguration>(intern("simulation"))
            .map(|configuration| configuration.rate)
            .unwrap_or(1);
        Ok(())
    }

    fn execute(&mut self, _context: &ExecuteContext<'_, '_>) {
        let query = self.write.as_ref().expect("deployed");
        let mut access = query.execute().expect("no competing writer");
        let counter: &mut TickCounter = access.get();
        counter.ticks += self.rate as u64;
        self.mirror
            .store(counter.ticks, std::sync::atomic::Ordering::SeqCst);
    }

    fn undeploy(&mut self) {
        self.write = None;
    }
}

struct Probe {
    label: &'static str,
    order: Arc<Mutex<Vec<&'static str>>>,
    after: Vec<&'static str>,
}

impl Mutator for Probe {
    fn deploy(&mut self, context: &mut DeployContext<'_>) -> Result<(), DeployError> {
        for name in &self.after {
            context.run_after(name);
        }
        Ok(())
    }

    fn execute(&mut self, _context: &ExecuteContext<'_, '_>) {
        self.order.lock().push(self.label);
    }
}

fn simulation_patch(registry: &Registry, rate: u32) -> Patch {
    let mut patch = Patch::new(intern("simulation_configuration"));
    patch
        .set_field(registry, &field_path(&["rate"]), rate)
        .unwrap();
    patch
}

#[test]
fn deploy_update_and_query_configuration() {
    let _ = env_logger::builder().is_test(true).try_init();

    let registry = registry();
    let mirror = Arc::new(std::sync::atomic::AtomicU64::new(0));
    let mut mutators = MutatorRegistry::new();
    {
        let mirror = mirror.clone();
        mutators.register("count_ticks", move || {
            Box::new(CountTicks {
                write: None,
                rate: 0,
                mirror: mirror.clone(),
            })
        });
    }

    let definition = WorldDefinition {
        world_name: intern("root"),
        scheduler_name: intern("single_pipeline"),
        configuration: vec![WorldConfigurationDefinition {
            name: intern("simulation"),
            patch: simulation_patch(&registry, 3),
        }],
        pipelines: vec![PipelineDefinition {
            name: intern("update"),
            mutators: vec![intern("count_ticks")],
            mutator_groups: vec![],
        }],
        children: vec![],
    };

    let schedulers = SchedulerRegistry::new();
    let mut universe =
        Universe::deploy_root(&definition, registry, &mutators, &schedulers).unwrap();

    assert_eq!(
        universe
            .root()
            .configuration::<SimulationConfiguration>(intern("simulation"))
            .map(|configuration| configuration.rate),
        Some(3)
    );

    universe.update();
    universe.update();

    // Two updates at rate three.
    assert_eq!(mirror.load(std::sync::atomic::Ordering::SeqCst), 6);

    universe.undeploy();
}

#[test]
fn groups_expand_and_order_against_members() {
    let _ = env_logger::builder().is_test(true).try_init();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut mutators = MutatorRegistry::new();
    {
        let order = order.clone();
        mutators.register("lead", move || {
            Box::new(Probe {
                label: "lead",
                order: order.clone(),
                after: vec![],
            })
        });
    }
    for (name, label) in [("audit_one", "audit_one"), ("audit_two", "audit_two")] {
        let order = order.clone();
        mutators.register_in_group("audit", name, move || {
            Box::new(Probe {
                label,
                order: order.clone(),
                after: vec!["lead"],
            })
        });
    }
    {
        let order = order.clone();
        mutators.register("tail", move || {
            Box::new(Probe {
                label: "tail",
                order: order.clone(),
                after: vec!["audit"],
            })
        });
    }

    let definition = WorldDefinition {
        world_name: intern("root"),
        scheduler_name: intern("single_pipeline"),
        configuration: vec![],
        pipelines: vec![PipelineDefinition {
            name: intern("update"),
            mutators: vec![intern("lead"), intern("tail")],
            mutator_groups: vec![intern("audit")],
        }],
        children: vec![],
    };

    let schedulers = SchedulerRegistry::new();
    let mut universe = Universe::deploy_root(
        &definition,
        RegistryBuilder::new().build(),
        &mutators,
        &schedulers,
    )
    .unwrap();

    universe.update();

    let observed = order.lock().clone();
    let position = |label: &str| observed.iter().position(|seen| *seen == label).unwrap();
    assert_eq!(observed.len(), 4);
    assert!(position("lead") < position("audit_one"));
    assert!(position("lead") < position("audit_two"));
    assert!(position("audit_one") < position("tail"));
    assert!(position("audit_two") < position("tail"));
}

#[test]
fn children_update_after_parent_pipelines() {
    let _ = env_logger::builder().is_test(true).try_init();

    struct MarkingScheduler {
        order: Arc<Mutex<Vec<&'static str>>>,
        label: &'static str,
    }

    impl WorldScheduler for MarkingScheduler {
        fn update(&mut self, interface: &mut SchedulerInterface<'_>) {
            interface.run_pipeline(intern("update"));
            self.order.lock().push(self.label);
            interface.update_all_children();
        }
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut mutators = MutatorRegistry::new();
    for (name, label) in [("parent_work", "parent_work"), ("child_work", "child_work")] {
        let order = order.clone();
        mutators.register(name, move || {
            Box::new(Probe {
                label,
                order: order.clone(),
                after: vec![],
            })
        });
    }

    let mut schedulers = SchedulerRegistry::new();
    {
        let order = order.clone();
        schedulers.register("marking_parent", move || {
            Box::new(MarkingScheduler {
                order: order.clone(),
                label: "parent_scheduler",
            })
        });
    }

    let definition = WorldDefinition {
        world_name: intern("root"),
        scheduler_name: intern("marking_parent"),
        configuration: vec![],
        pipelines: vec![PipelineDefinition {
            name: intern("update"),
            mutators: vec![intern("parent_work")],
            mutator_groups: vec![],
        }],
        children: vec![WorldDefinition {
            world_name: intern("nested"),
            scheduler_name: intern("single_pipeline"),
            configuration: vec![],
            pipelines: vec![PipelineDefinition {
                name: intern("update"),
                mutators: vec![intern("child_work")],
                mutator_groups: vec![],
            }],
            children: vec![],
        }],
    };

    let mut universe = Universe::deploy_root(
        &definition,
        RegistryBuilder::new().build(),
        &mutators,
        &schedulers,
    )
    .unwrap();

    universe.update();

    let observed = order.lock().clone();
    assert_eq!(observed, vec!["parent_work", "parent_scheduler", "child_work"]);
}

#[test]
fn missing_mutator_is_a_fatal_deploy_error() {
    let definition = WorldDefinition {
        world_name: intern("root"),
        scheduler_name: intern("single_pipeline"),
        configuration: vec![],
        pipelines: vec![PipelineDefinition {
            name: intern("update"),
            mutators: vec![intern("does_not_exist")],
            mutator_groups: vec![],
        }],
        children: vec![],
    };

    let result = Universe::deploy_root(
        &definition,
        RegistryBuilder::new().build(),
        &MutatorRegistry::new(),
        &SchedulerRegistry::new(),
    );
    assert!(matches!(result, Err(DeployError::MissingMutator { .. })));
}

#[test]
fn missing_scheduler_is_a_fatal_deploy_error() {
    let definition = WorldDefinition {
        world_name: intern("root"),
        scheduler_name: intern("not_registered"),
        ..WorldDefinition::default()
    };

    let result = Universe::deploy_root(
        &definition,
        RegistryBuilder::new().build(),
        &MutatorRegistry::new(),
        &SchedulerRegistry::new(),
    );
    assert!(matches!(result, Err(DeployError::MissingScheduler { .. })));
}
