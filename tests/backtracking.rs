mod common;

use common::*;
use proptest::prelude::*;
use rill::FunctionBuilder;
use rill::bytecode::{CallTarget, ExecutableModule, Function, FunctionId, Instruction, SymbolId};
use rill::vm::{
    Cache, ConditionKind, InternalError, Scopes, StepResult, Value, Vm, VmConfig, vm_step,
};

fn store(name: SymbolId, src: u32) -> Instruction {
    Instruction::StoreVar { name, src }
}

fn declare(name: SymbolId, src: u32) -> Instruction {
    Instruction::DeclareVar { name, src }
}

#[test]
fn rollback_restores_prior_values_and_removes_new_names() {
    let mut module = ExecutableModule::default();
    let x = module.intern_symbol("x").unwrap();
    let y = module.intern_symbol("y").unwrap();
    add_entry(
        &mut module,
        Function::new("main", 0, 5).with_code(vec![
            int(0, 1),
            declare(x, 0),
            Instruction::RegionOpen,
            int(1, 2),
            store(x, 1),
            int(2, 5),
            declare(y, 2),
            int(3, 7),
            store(x, 3),
            Instruction::RegionRollback,
            Instruction::LoadVar { dst: 4, name: x },
            Instruction::Return { value: 4 },
        ]),
    );

    let (vm, result) = run(module);
    assert_eq!(result, done(1));
    assert_eq!(vm.global("x"), Some(&Value::Int(1)));
    assert_eq!(vm.global("y"), None);
    assert_eq!(vm.open_regions(), 0);
}

#[test]
fn commit_keeps_every_mutation() {
    let mut module = ExecutableModule::default();
    let x = module.intern_symbol("x").unwrap();
    add_entry(
        &mut module,
        Function::new("main", 0, 2).with_code(vec![
            Instruction::RegionOpen,
            int(0, 2),
            declare(x, 0),
            int(1, 3),
            store(x, 1),
            Instruction::RegionCommit,
            Instruction::Return { value: 1 },
        ]),
    );
    let (vm, result) = run(module);
    assert_eq!(result, done(3));
    assert_eq!(vm.global("x"), Some(&Value::Int(3)));
}

/// Opens an outer region, sets x = 2, opens an inner region, sets x = 3, then finalizes the
/// inner and outer regions with the given instructions.
fn nested(inner: Instruction, outer: Instruction) -> ExecutableModule {
    let mut module = ExecutableModule::default();
    let x = module.intern_symbol("x").unwrap();
    add_entry(
        &mut module,
        Function::new("main", 0, 4).with_code(vec![
            int(0, 1),
            declare(x, 0),
            Instruction::RegionOpen,
            int(1, 2),
            store(x, 1),
            Instruction::RegionOpen,
            int(2, 3),
            store(x, 2),
            inner,
            outer,
            Instruction::LoadVar { dst: 3, name: x },
            Instruction::Return { value: 3 },
        ]),
    );
    module
}

#[test]
fn nested_regions_compose() {
    let (_, result) = run(nested(Instruction::RegionCommit, Instruction::RegionRollback));
    assert_eq!(result, done(1));

    let (_, result) = run(nested(Instruction::RegionRollback, Instruction::RegionCommit));
    assert_eq!(result, done(2));

    let (_, result) = run(nested(Instruction::RegionRollback, Instruction::RegionRollback));
    assert_eq!(result, done(1));

    let (_, result) = run(nested(Instruction::RegionCommit, Instruction::RegionCommit));
    assert_eq!(result, done(3));
}

#[test]
fn finalizing_without_an_open_region_is_fatal() {
    for instr in [Instruction::RegionCommit, Instruction::RegionRollback] {
        let mut module = ExecutableModule::default();
        add_entry(
            &mut module,
            Function::new("main", 0, 1).with_code(vec![
                instr,
                int(0, 0),
                Instruction::Return { value: 0 },
            ]),
        );
        let (_, result) = run(module);
        assert_eq!(
            result,
            StepResult::Trap {
                error: InternalError::NoOpenRegion
            }
        );
    }
}

#[test]
fn a_region_belongs_to_the_frame_that_opened_it() {
    let mut module = ExecutableModule::default();
    add_entry(
        &mut module,
        Function::new("main", 0, 1).with_code(vec![
            Instruction::RegionOpen,
            Instruction::Call {
                dst: Some(0),
                func: CallTarget::Direct(FunctionId(1)),
                args: vec![],
            },
            Instruction::RegionCommit,
            Instruction::Return { value: 0 },
        ]),
    );
    add_function(
        &mut module,
        Function::new("meddler", 0, 1).with_code(vec![
            Instruction::RegionCommit,
            int(0, 0),
            Instruction::Return { value: 0 },
        ]),
    );
    let mut vm =
        Vm::with_config(module, VmConfig::default().with_metrics(true)).expect("vm init");
    assert_eq!(
        vm_step(&mut vm, None),
        StepResult::Trap {
            error: InternalError::RegionMismatch
        }
    );
    assert_eq!(vm.open_regions(), 1);
    assert_eq!(vm.metrics().regions_committed, 0);
}

#[test]
fn returning_with_an_open_region_is_fatal() {
    let mut module = ExecutableModule::default();
    add_entry(
        &mut module,
        Function::new("main", 0, 1).with_code(vec![
            Instruction::Call {
                dst: Some(0),
                func: CallTarget::Direct(FunctionId(1)),
                args: vec![],
            },
            Instruction::Return { value: 0 },
        ]),
    );
    add_function(
        &mut module,
        Function::new("leaky", 0, 1).with_code(vec![
            Instruction::RegionOpen,
            int(0, 0),
            Instruction::Return { value: 0 },
        ]),
    );
    let (_, result) = run(module);
    assert_eq!(
        result,
        StepResult::Trap {
            error: InternalError::UnbalancedRegion {
                function: "leaky".to_string(),
                count: 1
            }
        }
    );
}

#[test]
fn open_region_limit_is_enforced() {
    let mut module = ExecutableModule::default();
    add_entry(
        &mut module,
        Function::new("main", 0, 1).with_code(vec![
            Instruction::RegionOpen,
            Instruction::RegionOpen,
            Instruction::RegionOpen,
            int(0, 0),
            Instruction::Return { value: 0 },
        ]),
    );
    let mut vm = Vm::with_config(module, VmConfig::default().with_max_open_regions(2))
        .expect("vm init");
    assert_eq!(
        vm_step(&mut vm, None),
        StepResult::Trap {
            error: InternalError::RegionLimit { limit: 2 }
        }
    );
}

/// `solve` over the alternatives `gen(3)` yields: each attempt binds `x` and bumps `attempts`
/// inside a region; a failing guard raises `NoSolution`, which rolls the attempt back.
fn solve_module(threshold: i64) -> ExecutableModule {
    let mut module = ExecutableModule::default();
    let x = module.intern_symbol("x").unwrap();
    let attempts = module.intern_symbol("attempts").unwrap();

    let mut b = FunctionBuilder::new("main", 0, 10);
    let next = b.label();
    let attempt = b.label();
    let fail = b.label();
    let ok = b.label();
    let failed = b.label();
    let exhausted = b.label();

    b.emit(int(0, 3))
        .emit(Instruction::CoCreate {
            dst: 1,
            func: FunctionId(1),
            args: vec![0],
        })
        .emit(int(6, threshold))
        .emit(int(7, 0))
        .emit(declare(attempts, 7))
        .emit(int(8, 1));
    b.bind(next).unwrap();
    b.emit(Instruction::CoNext {
        dst: Some(2),
        co: 1,
        out: Some(3),
    });
    b.jump_if(2, attempt, exhausted);

    b.bind(attempt).unwrap();
    b.push_catch(failed, None);
    b.emit(Instruction::RegionOpen)
        .emit(store(x, 3))
        .emit(Instruction::LoadVar {
            dst: 9,
            name: attempts,
        })
        .emit(Instruction::IntAdd { dst: 9, a: 9, b: 8 })
        .emit(store(attempts, 9))
        .emit(Instruction::IntLe { dst: 5, a: 6, b: 3 });
    b.jump_if(5, ok, fail);

    b.bind(fail).unwrap();
    b.emit(Instruction::NoSolution);

    b.bind(ok).unwrap();
    b.emit(Instruction::RegionCommit)
        .emit(Instruction::PopCatch)
        .emit(Instruction::LoadVar { dst: 4, name: x })
        .emit(Instruction::Return { value: 4 });

    b.bind(failed).unwrap();
    b.jump(next);

    b.bind(exhausted).unwrap();
    b.emit(Instruction::NoSolution);

    add_entry(&mut module, b.finish().unwrap());
    add_function(&mut module, counting_generator("gen"));
    module
}

#[test]
fn solve_commits_the_first_alternative_that_passes() {
    let mut vm = Vm::with_config(solve_module(3), VmConfig::default().with_metrics(true))
        .expect("vm init");
    assert_eq!(vm_step(&mut vm, None), done(3));
    assert_eq!(vm.global("x"), Some(&Value::Int(3)));
    // Failed attempts were rolled back, including their counter updates.
    assert_eq!(vm.global("attempts"), Some(&Value::Int(1)));
    assert_eq!(vm.open_regions(), 0);

    let metrics = vm.metrics();
    assert_eq!(metrics.conditions_raised, 2);
    assert_eq!(metrics.conditions_caught, 2);
    assert_eq!(metrics.regions_opened, 3);
    assert_eq!(metrics.regions_committed, 1);
    assert_eq!(metrics.regions_rolled_back, 2);
    // x and attempts, for each of the two failed attempts.
    assert_eq!(metrics.bindings_restored, 4);
}

#[test]
fn solve_without_a_solution_leaves_no_trace() {
    let (vm, result) = run(solve_module(4));
    let StepResult::Uncaught { condition } = result else {
        panic!("expected an uncaught condition, got {result:?}");
    };
    assert_eq!(condition.kind, ConditionKind::NoSolution);
    assert_eq!(vm.global("x"), None);
    assert_eq!(vm.global("attempts"), Some(&Value::Int(0)));
}

#[test]
fn catching_rolls_back_regions_opened_by_unwound_frames() {
    let mut module = ExecutableModule::default();
    let x = module.intern_symbol("x").unwrap();
    let mut main = FunctionBuilder::new("main", 0, 2);
    let handler = main.label();
    main.emit(int(0, 1)).emit(declare(x, 0));
    main.push_catch(handler, Some(1));
    main.emit(Instruction::Call {
        dst: None,
        func: CallTarget::Direct(FunctionId(1)),
        args: vec![],
    })
    .emit(Instruction::PopCatch);
    main.bind(handler).unwrap();
    main.emit(Instruction::LoadVar { dst: 1, name: x })
        .emit(Instruction::Return { value: 1 });
    add_entry(&mut module, main.finish().unwrap());

    add_function(
        &mut module,
        Function::new("speculate", 0, 1).with_code(vec![
            Instruction::RegionOpen,
            int(0, 99),
            store(x, 0),
            Instruction::PushScope,
            Instruction::Throw { value: 0 },
        ]),
    );

    let (vm, result) = run(module);
    assert_eq!(result, done(1));
    assert_eq!(vm.open_regions(), 0);
    assert_eq!(vm.scopes().live(), 1);
}

#[test]
fn catching_rolls_back_regions_opened_after_the_handler() {
    // The region open at installation is committed before the throw; the one opened after the
    // handler must still be undone.
    let mut module = ExecutableModule::default();
    let x = module.intern_symbol("x").unwrap();
    let mut main = FunctionBuilder::new("main", 0, 2);
    let handler = main.label();
    main.emit(Instruction::RegionOpen);
    main.push_catch(handler, None);
    main.emit(Instruction::RegionCommit)
        .emit(Instruction::RegionOpen)
        .emit(int(0, 5))
        .emit(declare(x, 0))
        .emit(Instruction::Throw { value: 0 });
    main.bind(handler).unwrap();
    main.emit(int(1, 0)).emit(Instruction::Return { value: 1 });
    add_entry(&mut module, main.finish().unwrap());

    let mut vm =
        Vm::with_config(module, VmConfig::default().with_metrics(true)).expect("vm init");
    assert_eq!(vm_step(&mut vm, None), done(0));
    assert_eq!(vm.open_regions(), 0);
    assert_eq!(vm.global("x"), None);
    assert_eq!(vm.metrics().regions_committed, 1);
    assert_eq!(vm.metrics().regions_rolled_back, 1);
}

#[test]
fn regions_open_when_the_handler_was_installed_survive_the_catch() {
    let mut module = ExecutableModule::default();
    let x = module.intern_symbol("x").unwrap();
    let mut main = FunctionBuilder::new("main", 0, 2);
    let handler = main.label();
    main.emit(Instruction::RegionOpen)
        .emit(int(0, 1))
        .emit(declare(x, 0));
    main.push_catch(handler, None);
    main.emit(Instruction::Throw { value: 0 });
    main.bind(handler).unwrap();
    main.emit(Instruction::RegionCommit)
        .emit(Instruction::LoadVar { dst: 1, name: x })
        .emit(Instruction::Return { value: 1 });
    add_entry(&mut module, main.finish().unwrap());

    let (vm, result) = run(module);
    assert_eq!(result, done(1));
    assert_eq!(vm.open_regions(), 0);
}

#[test]
fn a_handler_whose_block_was_popped_is_fatal() {
    let mut module = ExecutableModule::default();
    add_entry(
        &mut module,
        Function::new("main", 0, 1).with_code(vec![
            Instruction::Call {
                dst: Some(0),
                func: CallTarget::Direct(FunctionId(1)),
                args: vec![],
            },
            Instruction::Return { value: 0 },
        ]),
    );
    let mut f = FunctionBuilder::new("stale", 0, 1);
    let handler = f.label();
    f.emit(Instruction::PushScope);
    f.push_catch(handler, None);
    f.emit(Instruction::PopScope)
        .emit(int(0, 1))
        .emit(Instruction::Throw { value: 0 });
    f.bind(handler).unwrap();
    f.emit(Instruction::Return { value: 0 });
    add_function(&mut module, f.finish().unwrap());

    let (vm, result) = run(module);
    assert_eq!(
        result,
        StepResult::Trap {
            error: InternalError::DanglingScope
        }
    );
    // Globals and the callee's own container are left intact.
    assert_eq!(vm.scopes().live(), 2);
    assert_eq!(vm.frame_depth(), 2);
}

#[test]
fn finalizing_a_log_twice_is_fatal() {
    let mut scopes = Scopes::new();
    let mut cache = Cache::new();
    cache.commit().unwrap();
    assert_eq!(
        cache.rollback(&mut scopes),
        Err(InternalError::CacheInert { op: "rollback" })
    );

    let mut cache = Cache::new();
    cache.rollback(&mut scopes).unwrap();
    assert_eq!(
        cache.commit(),
        Err(InternalError::CacheInert { op: "commit" })
    );
}

const NAMES: u32 = 4;

proptest! {
    #[test]
    fn rollback_is_exact(
        initial in prop::collection::vec(prop::option::of(-50i64..50), NAMES as usize),
        writes in prop::collection::vec((0..NAMES, -50i64..50), 0..24),
    ) {
        let mut scopes = Scopes::new();
        let scope = scopes.alloc(None).unwrap();
        for (i, value) in initial.iter().enumerate() {
            if let Some(v) = value {
                scopes.set_var(scope, SymbolId(i as u32), Value::Int(*v)).unwrap();
            }
        }
        let snapshot = |scopes: &Scopes| -> Vec<Option<Value>> {
            (0..NAMES)
                .map(|i| scopes.lookup_var(scope, SymbolId(i)).cloned())
                .collect()
        };
        let before = snapshot(&scopes);

        let mut cache = Cache::new();
        for (name, v) in &writes {
            let name = SymbolId(*name);
            let prior = scopes.get(scope).and_then(|s| s.var(name)).cloned();
            cache.save_variable(scope, name, prior);
            scopes.set_var(scope, name, Value::Int(*v)).unwrap();
        }
        cache.rollback(&mut scopes).unwrap();

        prop_assert_eq!(snapshot(&scopes), before);
    }

    #[test]
    fn vm_regions_roll_back_exactly(
        initial in prop::collection::vec(prop::option::of(-50i64..50), NAMES as usize),
        writes in prop::collection::vec((0..NAMES, -50i64..50, any::<bool>()), 0..16),
    ) {
        let mut module = ExecutableModule::default();
        let names: Vec<SymbolId> = (0..NAMES)
            .map(|i| module.intern_symbol(&format!("v{i}")).unwrap())
            .collect();

        let mut code = Vec::new();
        for (i, value) in initial.iter().enumerate() {
            if let Some(v) = value {
                code.push(int(0, *v));
                code.push(declare(names[i], 0));
            }
        }
        code.push(Instruction::RegionOpen);
        for (name, v, redeclare) in &writes {
            code.push(int(0, *v));
            let name = names[*name as usize];
            code.push(if *redeclare { declare(name, 0) } else { store(name, 0) });
        }
        code.push(Instruction::RegionRollback);
        code.push(int(0, 0));
        code.push(Instruction::Return { value: 0 });
        add_entry(&mut module, Function::new("main", 0, 1).with_code(code));

        let (vm, result) = run(module);
        prop_assert_eq!(result, done(0));
        for (i, value) in initial.iter().enumerate() {
            let expected = value.map(Value::Int);
            prop_assert_eq!(vm.global(&format!("v{i}")).cloned(), expected);
        }
    }
}
