//! A small assembler for hand-built bytecode functions.
//!
//! Jump targets are written against [`Label`]s and patched to program counters by
//! [`FunctionBuilder::finish`].

use rill_bytecode::{Function, Instruction, Reg, Shape};

/// A forward- or backward-referencable code position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("label {0} was never bound in `{1}`")]
    UnboundLabel(usize, String),
    #[error("label {0} bound twice in `{1}`")]
    ReboundLabel(usize, String),
    #[error("function `{0}` is too large (pc overflow)")]
    PcOverflow(String),
}

#[derive(Clone, Copy, Debug)]
enum PcPatch {
    Jump {
        instr_index: usize,
        target: Label,
    },
    JumpIf {
        instr_index: usize,
        then_label: Label,
        else_label: Label,
    },
    Catch {
        instr_index: usize,
        target: Label,
    },
}

#[derive(Debug)]
pub struct FunctionBuilder {
    func: Function,
    labels: Vec<Option<u32>>,
    patches: Vec<PcPatch>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, param_count: u32, reg_count: u32) -> Self {
        Self {
            func: Function::new(name, param_count, reg_count),
            labels: Vec::new(),
            patches: Vec::new(),
        }
    }

    pub fn params(mut self, params: Vec<Shape>) -> Self {
        self.func.params = params;
        self
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Binds `label` to the next emitted instruction.
    pub fn bind(&mut self, label: Label) -> Result<&mut Self, BuildError> {
        let pc = self.pc()?;
        match self.labels.get_mut(label.0) {
            Some(slot) if slot.is_none() => *slot = Some(pc),
            _ => return Err(BuildError::ReboundLabel(label.0, self.func.name.clone())),
        }
        Ok(self)
    }

    pub fn emit(&mut self, instr: Instruction) -> &mut Self {
        self.func.code.push(instr);
        self
    }

    pub fn jump(&mut self, target: Label) -> &mut Self {
        self.patches.push(PcPatch::Jump {
            instr_index: self.func.code.len(),
            target,
        });
        self.emit(Instruction::Jump { target_pc: 0 })
    }

    pub fn jump_if(&mut self, cond: Reg, then_label: Label, else_label: Label) -> &mut Self {
        self.patches.push(PcPatch::JumpIf {
            instr_index: self.func.code.len(),
            then_label,
            else_label,
        });
        self.emit(Instruction::JumpIf {
            cond,
            then_pc: 0,
            else_pc: 0,
        })
    }

    /// Installs a catch handler that continues at `target` with the condition value in `dst`.
    pub fn push_catch(&mut self, target: Label, dst: Option<Reg>) -> &mut Self {
        self.patches.push(PcPatch::Catch {
            instr_index: self.func.code.len(),
            target,
        });
        self.emit(Instruction::PushCatch { target_pc: 0, dst })
    }

    fn pc(&self) -> Result<u32, BuildError> {
        self.func
            .code
            .len()
            .try_into()
            .map_err(|_| BuildError::PcOverflow(self.func.name.clone()))
    }

    fn resolve(&self, label: Label) -> Result<u32, BuildError> {
        self.labels
            .get(label.0)
            .copied()
            .flatten()
            .ok_or_else(|| BuildError::UnboundLabel(label.0, self.func.name.clone()))
    }

    pub fn finish(mut self) -> Result<Function, BuildError> {
        for patch in std::mem::take(&mut self.patches) {
            match patch {
                PcPatch::Jump {
                    instr_index,
                    target,
                } => {
                    let pc = self.resolve(target)?;
                    if let Some(Instruction::Jump { target_pc }) = self.func.code.get_mut(instr_index)
                    {
                        *target_pc = pc;
                    }
                }
                PcPatch::JumpIf {
                    instr_index,
                    then_label,
                    else_label,
                } => {
                    let then_target = self.resolve(then_label)?;
                    let else_target = self.resolve(else_label)?;
                    if let Some(Instruction::JumpIf {
                        then_pc, else_pc, ..
                    }) = self.func.code.get_mut(instr_index)
                    {
                        *then_pc = then_target;
                        *else_pc = else_target;
                    }
                }
                PcPatch::Catch {
                    instr_index,
                    target,
                } => {
                    let pc = self.resolve(target)?;
                    if let Some(Instruction::PushCatch { target_pc, .. }) =
                        self.func.code.get_mut(instr_index)
                    {
                        *target_pc = pc;
                    }
                }
            }
        }
        Ok(self.func)
    }
}
