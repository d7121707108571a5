#![allow(dead_code)]

use rill::FunctionBuilder;
use rill::bytecode::{ConstValue, ExecutableModule, Function, FunctionId, Instruction, Reg};
use rill::vm::{StepResult, Value, Vm, vm_step};

pub fn int(dst: Reg, n: i64) -> Instruction {
    Instruction::Const {
        dst,
        value: ConstValue::Int(n),
    }
}

pub fn add_function(module: &mut ExecutableModule, func: Function) -> FunctionId {
    module.add_function(func).expect("add function")
}

pub fn add_entry(module: &mut ExecutableModule, func: Function) -> FunctionId {
    let id = add_function(module, func);
    module.entry = id;
    id
}

pub fn done(value: impl Into<Value>) -> StepResult {
    StepResult::Done {
        value: value.into(),
    }
}

pub fn run(module: ExecutableModule) -> (Vm, StepResult) {
    let mut vm = Vm::new(module).expect("vm init");
    let result = vm_step(&mut vm, None);
    (vm, result)
}

/// `gen(n)` yields `1..=n`, then finishes.
pub fn counting_generator(name: &str) -> Function {
    let mut b = FunctionBuilder::new(name, 1, 4);
    let top = b.label();
    let body = b.label();
    let end = b.label();
    b.emit(int(1, 1)).emit(int(2, 1));
    b.bind(top).expect("bind");
    b.emit(Instruction::IntLe { dst: 3, a: 1, b: 0 });
    b.jump_if(3, body, end);
    b.bind(body).expect("bind");
    b.emit(Instruction::Yield { value: Some(1) });
    b.emit(Instruction::IntAdd { dst: 1, a: 1, b: 2 });
    b.jump(top);
    b.bind(end).expect("bind");
    b.emit(Instruction::Return { value: 1 });
    b.finish().expect("finish")
}
