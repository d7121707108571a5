use std::rc::Rc;

use rill_bytecode::{ExecutableModule, Instruction, Reg};
use tracing::{debug, warn};

use super::{Flow, StepResult, Vm, VmState};
use crate::dispatch::shape_matches;
use crate::{Condition, ConditionKind, Frame, InternalError, Node, Value};

/// Steps the VM until it completes, runs out of fuel, or stops on an uncaught condition or a
/// fatal error.
///
/// When `fuel` is `Some(n)`, the VM executes at most `n` instructions and returns
/// [`StepResult::Yield`] if fuel is exhausted. Once the VM has stopped, every further call
/// returns the same result.
#[tracing::instrument(level = "trace", skip(vm))]
pub fn vm_step(vm: &mut Vm, fuel: Option<u64>) -> StepResult {
    match &vm.state {
        VmState::Running => {}
        VmState::Done { value } => {
            return StepResult::Done {
                value: value.clone(),
            };
        }
        VmState::Uncaught { condition } => {
            return StepResult::Uncaught {
                condition: condition.clone(),
            };
        }
        VmState::Trapped { error } => {
            return StepResult::Trap {
                error: error.clone(),
            };
        }
    }

    let module = Rc::clone(&vm.module);
    let mut remaining = fuel.unwrap_or(u64::MAX);

    loop {
        if fuel.is_some() && remaining == 0 {
            return StepResult::Yield { remaining_fuel: 0 };
        }

        record_stack_maxima(vm);

        let (func_id, pc) = match vm.frame_mut() {
            Ok(frame) => {
                let pc = frame.pc;
                frame.pc += 1;
                (frame.func, pc)
            }
            Err(error) => return trap(vm, error),
        };
        let Some(func) = module.function(func_id) else {
            return trap(
                vm,
                InternalError::InvalidId {
                    kind: "function",
                    id: func_id.0,
                },
            );
        };
        let Some(instr) = func.code.get(pc) else {
            return trap(
                vm,
                InternalError::FellOffEnd {
                    function: func.name.clone(),
                },
            );
        };

        if fuel.is_some() {
            remaining = remaining.saturating_sub(1);
        }
        if vm.collect_metrics {
            vm.metrics.record(instr);
        }

        match execute(vm, &module, instr) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Done(value)) => {
                debug!(%value, "vm done");
                vm.state = VmState::Done {
                    value: value.clone(),
                };
                return StepResult::Done { value };
            }
            Ok(Flow::Uncaught(condition)) => {
                warn!(condition = %condition.kind, "uncaught condition");
                vm.state = VmState::Uncaught {
                    condition: condition.clone(),
                };
                return StepResult::Uncaught { condition };
            }
            Err(error) => return trap(vm, error),
        }
    }
}

fn execute(
    vm: &mut Vm,
    module: &ExecutableModule,
    instr: &Instruction,
) -> Result<Flow, InternalError> {
    use Instruction as I;

    match instr {
        I::Const { dst, value } => vm.frame_mut()?.write(*dst, Value::from(value))?,
        I::Copy { dst, src } => {
            let frame = vm.frame_mut()?;
            let value = frame.read(*src)?.clone();
            frame.write(*dst, value)?;
        }
        I::Move { dst, src } => {
            let frame = vm.frame_mut()?;
            let value = frame.take(*src)?;
            frame.write(*dst, value)?;
        }

        I::IntAdd { dst, a, b } => int_op(vm.frame_mut()?, *dst, *a, *b, |a, b| {
            Value::Int(a.wrapping_add(b))
        })?,
        I::IntSub { dst, a, b } => int_op(vm.frame_mut()?, *dst, *a, *b, |a, b| {
            Value::Int(a.wrapping_sub(b))
        })?,
        I::IntMul { dst, a, b } => int_op(vm.frame_mut()?, *dst, *a, *b, |a, b| {
            Value::Int(a.wrapping_mul(b))
        })?,
        I::IntLt { dst, a, b } => int_op(vm.frame_mut()?, *dst, *a, *b, |a, b| {
            Value::Bool(a < b)
        })?,
        I::IntLe { dst, a, b } => int_op(vm.frame_mut()?, *dst, *a, *b, |a, b| {
            Value::Bool(a <= b)
        })?,
        I::IntEq { dst, a, b } => int_op(vm.frame_mut()?, *dst, *a, *b, |a, b| {
            Value::Bool(a == b)
        })?,
        I::IntNe { dst, a, b } => int_op(vm.frame_mut()?, *dst, *a, *b, |a, b| {
            Value::Bool(a != b)
        })?,
        I::BoolNot { dst, v } => {
            let frame = vm.frame_mut()?;
            let b = frame.read_bool(*v)?;
            frame.write(*dst, Value::Bool(!b))?;
        }
        I::ValueEq { dst, a, b } => {
            let frame = vm.frame_mut()?;
            let eq = frame.read(*a)? == frame.read(*b)?;
            frame.write(*dst, Value::Bool(eq))?;
        }

        I::MakeNode { dst, ctor, args } => {
            let constructor = module.constructor(*ctor).ok_or(InternalError::InvalidId {
                kind: "constructor",
                id: ctor.0,
            })?;
            if constructor.arity as usize != args.len() {
                return Err(InternalError::ArityMismatch {
                    function: constructor.name.clone(),
                    expected: constructor.arity as usize,
                    got: args.len(),
                });
            }
            let fields = vm.frame()?.read_args(args)?;
            let node = vm.nodes.intern(Node {
                ctor: *ctor,
                args: fields,
            });
            vm.frame_mut()?.write(*dst, Value::Node(node))?;
        }
        I::NodeField { dst, node, idx } => {
            let frame = vm.frame_mut()?;
            let field = match frame.read(*node)? {
                Value::Node(node) => {
                    node.args
                        .get(*idx as usize)
                        .cloned()
                        .ok_or(InternalError::FieldOutOfRange {
                            idx: *idx,
                            arity: node.args.len(),
                        })?
                }
                other => {
                    return Err(InternalError::TypeMismatch {
                        expected: "node",
                        found: other.kind(),
                    });
                }
            };
            frame.write(*dst, field)?;
        }
        I::IsShape { dst, value, ty } => {
            let shape = module.type_shape(*ty).ok_or(InternalError::InvalidId {
                kind: "type",
                id: ty.0,
            })?;
            let frame = vm.frame_mut()?;
            let matches = shape_matches(module, shape, frame.read(*value)?);
            frame.write(*dst, Value::Bool(matches))?;
        }

        I::LoadVar { dst, name } => return vm.load_var(module, *dst, *name),
        I::StoreVar { name, src } => vm.store_var(*name, *src)?,
        I::DeclareVar { name, src } => vm.declare_var(*name, *src)?,
        I::DeclareFunction { name, func } => vm.declare_function(*name, *func)?,
        I::PushScope => vm.push_scope()?,
        I::PopScope => vm.pop_scope()?,

        I::Call { dst, func, args } => return vm.call(module, *dst, *func, args),
        I::Return { value } => {
            let value = vm.frame()?.read(*value)?.clone();
            return vm.do_return(module, value);
        }

        I::CoCreate { dst, func, args } => vm.co_create(module, *dst, *func, args)?,
        I::CoNext { dst, co, out } => vm.co_next(*dst, *co, *out)?,
        I::CoHasNext { dst, co } => {
            let id = vm.frame()?.read_coroutine(*co)?;
            let has_next = vm.co(id)?.has_next();
            vm.frame_mut()?.write(*dst, Value::Bool(has_next))?;
        }
        I::CoCopy { dst, co } => vm.co_copy(*dst, *co)?,
        I::Yield { value } => vm.co_yield(*value)?,

        I::RegionOpen => vm.region_open()?,
        I::RegionCommit => vm.region_close(true)?,
        I::RegionRollback => vm.region_close(false)?,
        I::NoSolution => {
            return vm.raise(module, Condition::new(ConditionKind::NoSolution));
        }

        I::PushCatch { target_pc, dst } => vm.push_catch(*target_pc, *dst)?,
        I::PopCatch => vm.pop_catch()?,
        I::Throw { value } => {
            let value = vm.frame()?.read(*value)?.clone();
            return vm.raise(module, Condition::new(ConditionKind::Thrown(value)));
        }

        I::Jump { target_pc } => vm.frame_mut()?.pc = *target_pc as usize,
        I::JumpIf {
            cond,
            then_pc,
            else_pc,
        } => {
            let frame = vm.frame_mut()?;
            let target = if frame.read_bool(*cond)? {
                *then_pc
            } else {
                *else_pc
            };
            frame.pc = target as usize;
        }
        I::Trap { message } => {
            return Err(InternalError::Trap {
                message: message.clone(),
            });
        }
    }
    Ok(Flow::Continue)
}

fn int_op(
    frame: &mut Frame,
    dst: Reg,
    a: Reg,
    b: Reg,
    op: impl FnOnce(i64, i64) -> Value,
) -> Result<(), InternalError> {
    let a = frame.read_int(a)?;
    let b = frame.read_int(b)?;
    frame.write(dst, op(a, b))
}

fn trap(vm: &mut Vm, error: InternalError) -> StepResult {
    record_stack_maxima(vm);
    warn!(%error, "vm trapped");
    vm.state = VmState::Trapped {
        error: error.clone(),
    };
    StepResult::Trap { error }
}

fn record_stack_maxima(vm: &mut Vm) {
    if !vm.collect_metrics {
        return;
    }
    let depth = vm.frame_depth() as u64;
    vm.metrics.max_frames_len = vm.metrics.max_frames_len.max(depth);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VmConfig;
    use rill_bytecode::{ConstValue, Function, Shape};

    fn module_with_function(code: Vec<Instruction>, reg_count: u32) -> ExecutableModule {
        let mut module = ExecutableModule::default();
        let main = module
            .add_function(Function::new("main", 0, reg_count).with_code(code))
            .unwrap();
        module.entry = main;
        module
    }

    fn int(dst: Reg, n: i64) -> Instruction {
        Instruction::Const {
            dst,
            value: ConstValue::Int(n),
        }
    }

    #[test]
    fn arithmetic_and_branches() {
        // r0 = 0; r1 = 1; r2 = 5; loop { r0 += r1; r1 += 1; if r1 <= r2 continue }
        let module = module_with_function(
            vec![
                int(0, 0),
                int(1, 1),
                int(2, 5),
                int(4, 1),
                Instruction::IntAdd { dst: 0, a: 0, b: 1 },
                Instruction::IntAdd { dst: 1, a: 1, b: 4 },
                Instruction::IntLe { dst: 3, a: 1, b: 2 },
                Instruction::JumpIf {
                    cond: 3,
                    then_pc: 4,
                    else_pc: 8,
                },
                Instruction::Return { value: 0 },
            ],
            5,
        );
        let mut vm = Vm::new(module).expect("vm init");
        assert_eq!(
            vm_step(&mut vm, None),
            StepResult::Done {
                value: Value::Int(15)
            }
        );
    }

    #[test]
    fn fuel_yields_and_resumes() {
        let module = module_with_function(vec![int(0, 1), int(0, 2), Instruction::Return { value: 0 }], 1);
        let mut vm = Vm::new(module).expect("vm init");
        assert_eq!(
            vm_step(&mut vm, Some(2)),
            StepResult::Yield { remaining_fuel: 0 }
        );
        assert_eq!(vm.active_frame().map(|f| f.pc), Some(2));
        assert_eq!(
            vm_step(&mut vm, Some(10)),
            StepResult::Done {
                value: Value::Int(2)
            }
        );
        // Completed VMs keep reporting the same result.
        assert_eq!(
            vm_step(&mut vm, Some(0)),
            StepResult::Done {
                value: Value::Int(2)
            }
        );
    }

    #[test]
    fn falling_off_the_end_is_fatal() {
        let module = module_with_function(vec![int(0, 1)], 1);
        let mut vm =
            Vm::with_config(module, VmConfig::default().without_verification()).expect("vm init");
        let result = vm_step(&mut vm, None);
        assert_eq!(
            result,
            StepResult::Trap {
                error: InternalError::FellOffEnd {
                    function: "main".to_string()
                }
            }
        );
        assert_eq!(vm_step(&mut vm, None), result);
    }

    #[test]
    fn trap_instruction_stops_the_vm() {
        let module = module_with_function(
            vec![Instruction::Trap {
                message: "boom".to_string(),
            }],
            0,
        );
        let mut vm = Vm::new(module).expect("vm init");
        assert_eq!(
            vm_step(&mut vm, None),
            StepResult::Trap {
                error: InternalError::Trap {
                    message: "boom".to_string()
                }
            }
        );
    }

    #[test]
    fn uninitialized_register_read_traps() {
        let module = module_with_function(vec![Instruction::Return { value: 0 }], 1);
        let mut vm = Vm::new(module).expect("vm init");
        assert_eq!(
            vm_step(&mut vm, None),
            StepResult::Trap {
                error: InternalError::UninitializedRegister { reg: 0 }
            }
        );
    }

    #[test]
    fn nodes_are_interned() {
        let mut module = ExecutableModule::default();
        let pair = module.add_constructor("pair", 2).unwrap();
        let main = module
            .add_function(Function::new("main", 0, 5).with_code(vec![
                int(0, 1),
                int(1, 2),
                Instruction::MakeNode {
                    dst: 2,
                    ctor: pair,
                    args: vec![0, 1],
                },
                Instruction::MakeNode {
                    dst: 3,
                    ctor: pair,
                    args: vec![0, 1],
                },
                Instruction::NodeField {
                    dst: 4,
                    node: 3,
                    idx: 1,
                },
                Instruction::Return { value: 2 },
            ]))
            .unwrap();
        module.entry = main;
        let mut vm = Vm::new(module).expect("vm init");
        let StepResult::Done {
            value: Value::Node(node),
        } = vm_step(&mut vm, None)
        else {
            panic!("expected a node");
        };
        assert_eq!(node.args, vec![Value::Int(1), Value::Int(2)]);
        assert_eq!(vm.node_count(), 1);
        // The root frame is gone, but interned nodes are still shared with the table.
        assert!(std::rc::Rc::strong_count(&node) >= 2);
    }

    #[test]
    fn shape_tests_inspect_node_structure() {
        let mut module = ExecutableModule::default();
        let pair = module.add_constructor("pair", 2).unwrap();
        let triple = module.add_constructor("triple", 3).unwrap();
        let one_and_int = module
            .add_type(Shape::Cons {
                ctor: pair,
                args: vec![Shape::Lit(ConstValue::Int(1)), Shape::Int],
            })
            .unwrap();
        let str_first = module
            .add_type(Shape::Cons {
                ctor: pair,
                args: vec![Shape::Str, Shape::Any],
            })
            .unwrap();
        let any_node = module.add_type(Shape::Node).unwrap();
        let main = module
            .add_function(Function::new("main", 0, 7).with_code(vec![
                int(0, 1),
                int(1, 2),
                Instruction::MakeNode {
                    dst: 2,
                    ctor: pair,
                    args: vec![0, 1],
                },
                Instruction::IsShape {
                    dst: 3,
                    value: 2,
                    ty: one_and_int,
                },
                Instruction::IsShape {
                    dst: 4,
                    value: 2,
                    ty: str_first,
                },
                Instruction::IsShape {
                    dst: 5,
                    value: 0,
                    ty: any_node,
                },
                Instruction::MakeNode {
                    dst: 6,
                    ctor: triple,
                    args: vec![3, 4, 5],
                },
                Instruction::Return { value: 6 },
            ]))
            .unwrap();
        module.entry = main;
        let mut vm = Vm::new(module).expect("vm init");
        let StepResult::Done { value } = vm_step(&mut vm, None) else {
            panic!("expected completion");
        };
        let node = value.as_node().expect("a node");
        assert_eq!(
            node.args,
            vec![Value::Bool(true), Value::Bool(false), Value::Bool(false)]
        );
    }

    #[test]
    fn metrics_count_instructions_when_enabled() {
        let module = module_with_function(vec![int(0, 1), Instruction::Return { value: 0 }], 1);
        let mut vm =
            Vm::with_config(module, VmConfig::default().with_metrics(true)).expect("vm init");
        vm_step(&mut vm, None);
        let metrics = vm.take_metrics();
        assert_eq!(metrics.executed_instructions, 2);
        assert_eq!(metrics.return_instructions, 1);
        assert_eq!(metrics.max_frames_len, 1);
        assert_eq!(vm.metrics().executed_instructions, 0);
    }
}
