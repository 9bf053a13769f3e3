// SPDX-License-Identifier: CEPL-1.0
//! Single-pass SPIR-V scan for the storage buffers a shader binds.
//!
//! Only what the binder needs is collected: the entry point's execution
//! model, `DescriptorSet`/`Binding` decorations and `OpVariable`
//! declarations. Everything lives in descriptor set 0 with at most 32 slots.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::binding::ShaderStages;

pub const SPIRV_MAGIC: u32 = 0x0723_0203;
const HEADER_WORDS: usize = 5;

const OP_ENTRY_POINT: u32 = 15;
const OP_VARIABLE: u32 = 59;
const OP_DECORATE: u32 = 71;

const DECORATION_BINDING: u32 = 33;
const DECORATION_DESCRIPTOR_SET: u32 = 34;

const STORAGE_CLASS_UNIFORM: u32 = 2;
const STORAGE_CLASS_PUSH_CONSTANT: u32 = 9;
const STORAGE_CLASS_STORAGE_BUFFER: u32 = 12;

pub const MAX_BINDINGS: u32 = 32;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ShaderStage {
    Vertex,
    Fragment,
    Compute,
    Task,
    Mesh,
}

impl ShaderStage {
    fn from_execution_model(model: u32) -> Option<Self> {
        Some(match model {
            0 => ShaderStage::Vertex,
            4 => ShaderStage::Fragment,
            5 => ShaderStage::Compute,
            5267 | 5364 => ShaderStage::Task,
            5268 | 5365 => ShaderStage::Mesh,
            _ => return None,
        })
    }

    pub fn flag(self) -> ShaderStages {
        match self {
            ShaderStage::Vertex => ShaderStages::VERTEX,
            ShaderStage::Fragment => ShaderStages::FRAGMENT,
            ShaderStage::Compute => ShaderStages::COMPUTE,
            ShaderStage::Task => ShaderStages::TASK,
            ShaderStage::Mesh => ShaderStages::MESH,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShaderInterface {
    pub stage: ShaderStage,
    /// Bit `i` set iff binding `i` is a storage buffer used by this shader.
    pub storage_buffers: u32,
    pub push_constants: bool,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReflectError {
    #[error("shader binary is {0} bytes, not a whole number of words")]
    Misaligned(usize),
    #[error("shader binary is shorter than its header")]
    TooShort,
    #[error("bad SPIR-V magic {0:#010x}")]
    BadMagic(u32),
    #[error("instruction at word {offset} has zero length")]
    ZeroLength { offset: usize },
    #[error("instruction at word {offset} runs past the end of the module")]
    Truncated { offset: usize },
    #[error("id {id} exceeds the module bound {bound}")]
    IdOutOfBounds { id: u32, bound: u32 },
    #[error("unsupported execution model {0}")]
    UnsupportedExecutionModel(u32),
    #[error("module has no entry point")]
    MissingEntryPoint,
    #[error("module declares entry points for more than one stage")]
    MultipleStages,
    #[error("binding {binding} uses descriptor set {set}; only set 0 is supported")]
    NonZeroSet { binding: u32, set: u32 },
    #[error("binding {0} is out of range (max {MAX_BINDINGS})")]
    BindingOutOfRange(u32),
    #[error("binding {0} is declared twice")]
    DuplicateBinding(u32),
    #[error("buffer variable %{0} has no binding decoration")]
    MissingBinding(u32),
}

#[derive(Clone, Copy, Default)]
struct Id {
    variable_class: Option<u32>,
    set: Option<u32>,
    binding: Option<u32>,
}

pub fn reflect_bytes(bytes: &[u8]) -> Result<ShaderInterface, ReflectError> {
    if bytes.len() % 4 != 0 {
        return Err(ReflectError::Misaligned(bytes.len()));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    reflect(&words)
}

pub fn reflect(code: &[u32]) -> Result<ShaderInterface, ReflectError> {
    if code.len() < HEADER_WORDS {
        return Err(ReflectError::TooShort);
    }
    if code[0] != SPIRV_MAGIC {
        return Err(ReflectError::BadMagic(code[0]));
    }

    let bound = code[3];
    let mut ids: BTreeMap<u32, Id> = BTreeMap::new();
    let lookup = |id: u32| -> Result<u32, ReflectError> {
        if id >= bound {
            return Err(ReflectError::IdOutOfBounds { id, bound });
        }
        Ok(id)
    };

    let mut stage: Option<ShaderStage> = None;
    let mut offset = HEADER_WORDS;
    while offset < code.len() {
        let opcode = code[offset] & 0xffff;
        let word_count = (code[offset] >> 16) as usize;
        if word_count == 0 {
            return Err(ReflectError::ZeroLength { offset });
        }
        if offset + word_count > code.len() {
            return Err(ReflectError::Truncated { offset });
        }
        let insn = &code[offset..offset + word_count];

        match opcode {
            OP_ENTRY_POINT if word_count >= 2 => {
                let model = insn[1];
                let s = ShaderStage::from_execution_model(model)
                    .ok_or(ReflectError::UnsupportedExecutionModel(model))?;
                match stage {
                    Some(prev) if prev != s => return Err(ReflectError::MultipleStages),
                    _ => stage = Some(s),
                }
            }
            OP_DECORATE if word_count >= 4 => {
                let entry = ids.entry(lookup(insn[1])?).or_default();
                match insn[2] {
                    DECORATION_DESCRIPTOR_SET => entry.set = Some(insn[3]),
                    DECORATION_BINDING => entry.binding = Some(insn[3]),
                    _ => {}
                }
            }
            OP_VARIABLE if word_count >= 4 => {
                ids.entry(lookup(insn[2])?).or_default().variable_class = Some(insn[3]);
            }
            _ => {}
        }

        offset += word_count;
    }

    let stage = stage.ok_or(ReflectError::MissingEntryPoint)?;
    let mut storage_buffers = 0u32;
    let mut push_constants = false;

    for (&id, info) in &ids {
        match info.variable_class {
            Some(STORAGE_CLASS_UNIFORM) | Some(STORAGE_CLASS_STORAGE_BUFFER) => {
                let binding = info.binding.ok_or(ReflectError::MissingBinding(id))?;
                let set = info.set.unwrap_or(0);
                if set != 0 {
                    return Err(ReflectError::NonZeroSet { binding, set });
                }
                if binding >= MAX_BINDINGS {
                    return Err(ReflectError::BindingOutOfRange(binding));
                }
                if storage_buffers & (1 << binding) != 0 {
                    return Err(ReflectError::DuplicateBinding(binding));
                }
                storage_buffers |= 1 << binding;
            }
            Some(STORAGE_CLASS_PUSH_CONSTANT) => push_constants = true,
            _ => {}
        }
    }

    Ok(ShaderInterface { stage, storage_buffers, push_constants })
}
