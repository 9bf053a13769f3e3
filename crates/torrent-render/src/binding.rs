// SPDX-License-Identifier: CEPL-1.0
//! Descriptor layout planning for push-descriptor update templates.
//!
//! A [`BindingLayout`] is the union of the storage-buffer slots of every
//! shader in a pipeline. Template entry `k` reads element `k` of a dense
//! client array whose order is ascending slot order; [`DescriptorArray`]
//! is the only way to produce such an array.

use bitflags::bitflags;
use thiserror::Error;

use crate::reflect::{ShaderInterface, MAX_BINDINGS};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX   = 1 << 0;
        const FRAGMENT = 1 << 1;
        const COMPUTE  = 1 << 2;
        const TASK     = 1 << 3;
        const MESH     = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotBinding {
    pub binding: u32,
    pub stages: ShaderStages,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TemplateEntry {
    pub binding: u32,
    /// Index into the dense descriptor array.
    pub index: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BindingLayout {
    slots: Vec<SlotBinding>,
    mask: u32,
    push_constant_stages: ShaderStages,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BindingError {
    #[error("binding {0} is not part of this layout")]
    UnknownSlot(u32),
    #[error("binding {0} was supplied twice")]
    DuplicateSlot(u32),
    #[error("binding {0} was never supplied")]
    MissingSlot(u32),
    #[error("descriptor array was built for mask {found:#x}, layout expects {expected:#x}")]
    LayoutMismatch { expected: u32, found: u32 },
}

impl BindingLayout {
    pub fn from_shaders(shaders: &[&ShaderInterface]) -> Self {
        let mut stages = [ShaderStages::empty(); MAX_BINDINGS as usize];
        let mut mask = 0u32;
        let mut push_constant_stages = ShaderStages::empty();

        for shader in shaders {
            mask |= shader.storage_buffers;
            for (slot, stage) in stages.iter_mut().enumerate() {
                if shader.storage_buffers & (1 << slot) != 0 {
                    *stage |= shader.stage.flag();
                }
            }
            if shader.push_constants {
                push_constant_stages |= shader.stage.flag();
            }
        }

        let slots = (0..MAX_BINDINGS)
            .filter(|b| mask & (1 << b) != 0)
            .map(|binding| SlotBinding { binding, stages: stages[binding as usize] })
            .collect();

        BindingLayout { slots, mask, push_constant_stages }
    }

    pub fn slots(&self) -> &[SlotBinding] {
        &self.slots
    }

    pub fn mask(&self) -> u32 {
        self.mask
    }

    pub fn stages(&self) -> ShaderStages {
        self.slots
            .iter()
            .fold(self.push_constant_stages, |acc, s| acc | s.stages)
    }

    /// Stages that declare a push-constant block; empty means no range.
    pub fn push_constant_stages(&self) -> ShaderStages {
        self.push_constant_stages
    }

    pub fn template_entries(&self) -> impl Iterator<Item = TemplateEntry> + '_ {
        self.slots
            .iter()
            .enumerate()
            .map(|(index, s)| TemplateEntry { binding: s.binding, index })
    }

    pub fn descriptors<D>(&self) -> DescriptorArrayBuilder<'_, D> {
        DescriptorArrayBuilder {
            layout: self,
            items: std::array::from_fn(|_| None),
            error: None,
        }
    }
}

/// Collects descriptors keyed by binding slot. Errors are deferred to
/// [`DescriptorArrayBuilder::finish`]; the first one wins.
pub struct DescriptorArrayBuilder<'a, D> {
    layout: &'a BindingLayout,
    items: [Option<D>; MAX_BINDINGS as usize],
    error: Option<BindingError>,
}

impl<D> DescriptorArrayBuilder<'_, D> {
    pub fn bind(mut self, binding: u32, descriptor: D) -> Self {
        if self.error.is_some() {
            return self;
        }
        if binding >= MAX_BINDINGS || self.layout.mask & (1 << binding) == 0 {
            self.error = Some(BindingError::UnknownSlot(binding));
            return self;
        }
        let slot = &mut self.items[binding as usize];
        if slot.is_some() {
            self.error = Some(BindingError::DuplicateSlot(binding));
        } else {
            *slot = Some(descriptor);
        }
        self
    }

    pub fn finish(mut self) -> Result<DescriptorArray<D>, BindingError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let mut dense = Vec::with_capacity(self.layout.slots.len());
        for slot in &self.layout.slots {
            let d = self.items[slot.binding as usize]
                .take()
                .ok_or(BindingError::MissingSlot(slot.binding))?;
            dense.push(d);
        }
        Ok(DescriptorArray { items: dense, mask: self.layout.mask })
    }
}

/// Dense descriptors in template order, tagged with the slot mask they were
/// checked against.
#[derive(Clone, Debug)]
pub struct DescriptorArray<D> {
    items: Vec<D>,
    mask: u32,
}

impl<D> DescriptorArray<D> {
    pub fn check(&self, layout: &BindingLayout) -> Result<&[D], BindingError> {
        if self.mask != layout.mask {
            return Err(BindingError::LayoutMismatch { expected: layout.mask, found: self.mask });
        }
        Ok(&self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reflect::ShaderStage;

    fn iface(stage: ShaderStage, storage_buffers: u32, push_constants: bool) -> ShaderInterface {
        ShaderInterface { stage, storage_buffers, push_constants }
    }

    fn cluster_layout() -> BindingLayout {
        let task = iface(ShaderStage::Task, 0b0011, true);
        let mesh = iface(ShaderStage::Mesh, 0b1111, true);
        let frag = iface(ShaderStage::Fragment, 0, false);
        BindingLayout::from_shaders(&[&task, &mesh, &frag])
    }

    #[test]
    fn union_of_masks_with_or_of_stages() {
        let layout = cluster_layout();
        assert_eq!(layout.mask(), 0b1111);
        assert_eq!(
            layout.slots()[0],
            SlotBinding { binding: 0, stages: ShaderStages::TASK | ShaderStages::MESH }
        );
        assert_eq!(layout.slots()[3].stages, ShaderStages::MESH);
        assert_eq!(layout.push_constant_stages(), ShaderStages::TASK | ShaderStages::MESH);
    }

    #[test]
    fn template_indexes_are_dense_even_with_gaps() {
        let vs = iface(ShaderStage::Vertex, 0b1001, true);
        let layout = BindingLayout::from_shaders(&[&vs]);
        let entries: Vec<_> = layout.template_entries().collect();
        assert_eq!(
            entries,
            vec![
                TemplateEntry { binding: 0, index: 0 },
                TemplateEntry { binding: 3, index: 1 },
            ]
        );
    }

    #[test]
    fn builder_orders_by_slot_regardless_of_call_order() {
        let vs = iface(ShaderStage::Vertex, 0b1001, false);
        let layout = BindingLayout::from_shaders(&[&vs]);
        let arr = layout.descriptors().bind(3, "vertices").bind(0, "draws").finish().unwrap();
        assert_eq!(arr.check(&layout).unwrap(), &["draws", "vertices"]);
    }

    #[test]
    fn builder_rejects_unknown_duplicate_and_missing_slots() {
        let layout = cluster_layout();
        assert_eq!(
            layout.descriptors().bind(5, 0u8).finish().unwrap_err(),
            BindingError::UnknownSlot(5)
        );
        assert_eq!(
            layout.descriptors().bind(1, 0u8).bind(1, 1).finish().unwrap_err(),
            BindingError::DuplicateSlot(1)
        );
        assert_eq!(
            layout.descriptors().bind(0, 0u8).bind(1, 1).bind(3, 3).finish().unwrap_err(),
            BindingError::MissingSlot(2)
        );
        assert_eq!(
            layout.descriptors().bind(40, 0u8).finish().unwrap_err(),
            BindingError::UnknownSlot(40)
        );
    }

    #[test]
    fn array_from_another_layout_is_refused() {
        let vs = iface(ShaderStage::Vertex, 0b1001, false);
        let small = BindingLayout::from_shaders(&[&vs]);
        let arr = small.descriptors().bind(0, 1u32).bind(3, 2).finish().unwrap();
        assert_eq!(
            arr.check(&cluster_layout()).unwrap_err(),
            BindingError::LayoutMismatch { expected: 0b1111, found: 0b1001 }
        );
    }
}
