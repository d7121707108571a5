use std::collections::BTreeMap;

use crate::{
    CallTarget, ConstValue, ConstructorId, ExecutableModule, Function, FunctionId, Instruction,
    Reg, Shape, SymbolId, TypeId,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("verify error: {message}")]
pub struct VerifyError {
    pub message: String,
}

fn fail<T>(message: String) -> Result<T, VerifyError> {
    Err(VerifyError { message })
}

pub fn verify_module(module: &ExecutableModule) -> Result<(), VerifyError> {
    // Entry validity.
    if (module.entry.0 as usize) >= module.functions.len() {
        return fail(format!(
            "entry function id {} out of range (functions={})",
            module.entry.0,
            module.functions.len()
        ));
    }

    // Recompute name -> id maps and ensure they match the stored ones.
    let mut expected_function_ids = BTreeMap::new();
    for (idx, func) in module.functions.iter().enumerate() {
        if expected_function_ids
            .insert(func.name.clone(), FunctionId(idx as u32))
            .is_some()
        {
            return fail(format!("duplicate function name `{}`", func.name));
        }
    }
    if expected_function_ids != module.function_ids {
        return fail("function_ids map does not match functions table".to_string());
    }

    let mut expected_constructor_ids = BTreeMap::new();
    for (idx, ctor) in module.constructors.iter().enumerate() {
        if expected_constructor_ids
            .insert(ctor.name.clone(), ConstructorId(idx as u32))
            .is_some()
        {
            return fail(format!("duplicate constructor name `{}`", ctor.name));
        }
    }
    if expected_constructor_ids != module.constructor_ids {
        return fail("constructor_ids map does not match constructors table".to_string());
    }

    let mut expected_symbol_ids = BTreeMap::new();
    for (idx, name) in module.symbols.iter().enumerate() {
        if expected_symbol_ids
            .insert(name.clone(), SymbolId(idx as u32))
            .is_some()
        {
            return fail(format!("duplicate symbol `{name}`"));
        }
    }
    if expected_symbol_ids != module.symbol_ids {
        return fail("symbol_ids map does not match symbols table".to_string());
    }

    for (idx, shape) in module.types.iter().enumerate() {
        verify_shape(module, shape, &format!("type #{idx}"))?;
    }

    for func in &module.functions {
        verify_function(module, func)?;
    }

    Ok(())
}

fn verify_function(module: &ExecutableModule, func: &Function) -> Result<(), VerifyError> {
    if func.param_count > func.reg_count {
        return fail(format!(
            "function `{}` has param_count {} > reg_count {}",
            func.name, func.param_count, func.reg_count
        ));
    }
    if func.params.len() != func.param_count as usize {
        return fail(format!(
            "function `{}` declares {} parameter shapes for {} parameters",
            func.name,
            func.params.len(),
            func.param_count
        ));
    }
    for shape in &func.params {
        verify_shape(module, shape, &format!("function `{}` params", func.name))?;
    }

    // The front end must terminate every code unit explicitly.
    match func.code.last() {
        None => return fail(format!("function `{}` has an empty body", func.name)),
        Some(last) if !last.is_terminator() => {
            return fail(format!(
                "function `{}` can fall off the end of its code",
                func.name
            ));
        }
        Some(_) => {}
    }

    let code_len: u32 = func.code.len().try_into().map_err(|_| VerifyError {
        message: format!("function `{}` instruction stream too large", func.name),
    })?;

    for (pc, inst) in func.code.iter().enumerate() {
        verify_instruction(module, func, pc as u32, code_len, inst)?;
    }
    Ok(())
}

fn verify_shape(module: &ExecutableModule, shape: &Shape, context: &str) -> Result<(), VerifyError> {
    match shape {
        Shape::Lit(ConstValue::Function(id)) => verify_function_id(module, *id, context),
        Shape::Cons { ctor, args } => {
            let Some(decl) = module.constructor(*ctor) else {
                return fail(format!("{context}: invalid constructor id {}", ctor.0));
            };
            if decl.arity as usize != args.len() {
                return fail(format!(
                    "{context}: shape for `{}` has {} fields but arity is {}",
                    decl.name,
                    args.len(),
                    decl.arity
                ));
            }
            for arg in args {
                verify_shape(module, arg, context)?;
            }
            Ok(())
        }
        Shape::Any
        | Shape::Unit
        | Shape::Bool
        | Shape::Int
        | Shape::Str
        | Shape::Function
        | Shape::Coroutine
        | Shape::Node
        | Shape::Lit(_) => Ok(()),
    }
}

fn verify_reg(reg_count: u32, reg: Reg, context: &str) -> Result<(), VerifyError> {
    if reg >= reg_count {
        return fail(format!(
            "{context}: reg {reg} out of range (reg_count={reg_count})"
        ));
    }
    Ok(())
}

fn verify_regs(reg_count: u32, regs: &[Reg], context: &str) -> Result<(), VerifyError> {
    for reg in regs {
        verify_reg(reg_count, *reg, context)?;
    }
    Ok(())
}

fn verify_pc(code_len: u32, pc: u32, context: &str) -> Result<(), VerifyError> {
    if pc >= code_len {
        return fail(format!("{context}: pc {pc} out of range (code_len={code_len})"));
    }
    Ok(())
}

fn verify_function_id(
    module: &ExecutableModule,
    id: FunctionId,
    context: &str,
) -> Result<(), VerifyError> {
    if module.function(id).is_none() {
        return fail(format!("{context}: invalid function id {}", id.0));
    }
    Ok(())
}

fn verify_symbol(module: &ExecutableModule, id: SymbolId, context: &str) -> Result<(), VerifyError> {
    if module.symbol(id).is_none() {
        return fail(format!("{context}: invalid symbol id {}", id.0));
    }
    Ok(())
}

fn verify_type(module: &ExecutableModule, id: TypeId, context: &str) -> Result<(), VerifyError> {
    if module.type_shape(id).is_none() {
        return fail(format!("{context}: invalid type id {}", id.0));
    }
    Ok(())
}

fn verify_arity(
    module: &ExecutableModule,
    callee: FunctionId,
    args: &[Reg],
    context: &str,
) -> Result<(), VerifyError> {
    verify_function_id(module, callee, context)?;
    let Some(func) = module.function(callee) else {
        return fail(format!("{context}: invalid function id {}", callee.0));
    };
    if func.param_count as usize != args.len() {
        return fail(format!(
            "{context}: `{}` expects {} args but got {}",
            func.name,
            func.param_count,
            args.len()
        ));
    }
    Ok(())
}

fn verify_instruction(
    module: &ExecutableModule,
    func: &Function,
    pc: u32,
    code_len: u32,
    inst: &Instruction,
) -> Result<(), VerifyError> {
    let here = format!("function `{}` pc {pc}", func.name);
    let reg_count = func.reg_count;

    match inst {
        Instruction::Const { dst, value } => {
            verify_reg(reg_count, *dst, &format!("{here}: const dst"))?;
            if let ConstValue::Function(id) = value {
                verify_function_id(module, *id, &here)?;
            }
        }
        Instruction::Copy { dst, src } | Instruction::Move { dst, src } => {
            verify_reg(reg_count, *dst, &format!("{here}: dst"))?;
            verify_reg(reg_count, *src, &format!("{here}: src"))?;
        }
        Instruction::IntAdd { dst, a, b }
        | Instruction::IntSub { dst, a, b }
        | Instruction::IntMul { dst, a, b }
        | Instruction::IntLt { dst, a, b }
        | Instruction::IntLe { dst, a, b }
        | Instruction::IntEq { dst, a, b }
        | Instruction::IntNe { dst, a, b }
        | Instruction::ValueEq { dst, a, b } => {
            verify_regs(reg_count, &[*dst, *a, *b], &here)?;
        }
        Instruction::BoolNot { dst, v } => verify_regs(reg_count, &[*dst, *v], &here)?,
        Instruction::MakeNode { dst, ctor, args } => {
            verify_reg(reg_count, *dst, &format!("{here}: dst"))?;
            verify_regs(reg_count, args, &format!("{here}: node field"))?;
            let Some(decl) = module.constructor(*ctor) else {
                return fail(format!("{here}: invalid constructor id {}", ctor.0));
            };
            if decl.arity as usize != args.len() {
                return fail(format!(
                    "{here}: constructor `{}` expects {} fields but got {}",
                    decl.name,
                    decl.arity,
                    args.len()
                ));
            }
        }
        Instruction::NodeField { dst, node, idx: _ } => {
            verify_regs(reg_count, &[*dst, *node], &here)?;
        }
        Instruction::IsShape { dst, value, ty } => {
            verify_regs(reg_count, &[*dst, *value], &here)?;
            verify_type(module, *ty, &here)?;
        }
        Instruction::LoadVar { dst: reg, name }
        | Instruction::StoreVar { name, src: reg }
        | Instruction::DeclareVar { name, src: reg } => {
            verify_reg(reg_count, *reg, &here)?;
            verify_symbol(module, *name, &here)?;
        }
        Instruction::DeclareFunction { name, func: callee } => {
            verify_symbol(module, *name, &here)?;
            verify_function_id(module, *callee, &here)?;
        }
        Instruction::PushScope
        | Instruction::PopScope
        | Instruction::RegionOpen
        | Instruction::RegionCommit
        | Instruction::RegionRollback
        | Instruction::NoSolution
        | Instruction::PopCatch
        | Instruction::Trap { .. } => {}
        Instruction::Call {
            dst,
            func: target,
            args,
        } => {
            if let Some(dst) = dst {
                verify_reg(reg_count, *dst, &format!("{here}: call dst"))?;
            }
            verify_regs(reg_count, args, &format!("{here}: call arg"))?;
            match target {
                CallTarget::Direct(callee) => verify_arity(module, *callee, args, &here)?,
                CallTarget::Overloaded(name) => verify_symbol(module, *name, &here)?,
            }
        }
        Instruction::Return { value } => verify_reg(reg_count, *value, &here)?,
        Instruction::CoCreate {
            dst,
            func: callee,
            args,
        } => {
            verify_reg(reg_count, *dst, &format!("{here}: dst"))?;
            verify_regs(reg_count, args, &format!("{here}: coroutine arg"))?;
            verify_arity(module, *callee, args, &here)?;
        }
        Instruction::CoNext { dst, co, out } => {
            verify_reg(reg_count, *co, &here)?;
            for reg in dst.iter().chain(out.iter()) {
                verify_reg(reg_count, *reg, &here)?;
            }
        }
        Instruction::CoHasNext { dst, co } | Instruction::CoCopy { dst, co } => {
            verify_regs(reg_count, &[*dst, *co], &here)?;
        }
        Instruction::Yield { value } => {
            if let Some(value) = value {
                verify_reg(reg_count, *value, &here)?;
            }
        }
        Instruction::PushCatch { target_pc, dst } => {
            verify_pc(code_len, *target_pc, &format!("{here}: catch target"))?;
            if let Some(dst) = dst {
                verify_reg(reg_count, *dst, &here)?;
            }
        }
        Instruction::Throw { value } => verify_reg(reg_count, *value, &here)?,
        Instruction::Jump { target_pc } => verify_pc(code_len, *target_pc, &here)?,
        Instruction::JumpIf {
            cond,
            then_pc,
            else_pc,
        } => {
            verify_reg(reg_count, *cond, &here)?;
            verify_pc(code_len, *then_pc, &format!("{here}: then"))?;
            verify_pc(code_len, *else_pc, &format!("{here}: else"))?;
        }
    }
    Ok(())
}
