//! Runtime homes of global names, and the resolver lowering uses to
//! reach them.
//!
//! Compiled functions live behind a one-word slot cell holding their code
//! address, so callers compiled before the definition (forward references,
//! recursion) pick it up once the slot is written. Compiled values live in
//! a cell holding the value itself.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use kiln_codegen::{GlobalRef, GlobalResolver, Layouts, LowLevelOp};
use kiln_common::Ty;
use kiln_rt::{kiln_rt_unbound, GlobalRegion};
use kiln_typeck::{GlobalKind, TypeEnv, TypeRegistry};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum GlobalSlot {
    /// Cell holding a function's code address.
    Function { cell: u64 },
    /// Region cell holding a compiled value.
    Value { cell: u64 },
    /// Host-owned cell, read on every use.
    HostCell { addr: u64 },
    /// Host function entry.
    Extern { addr: u64 },
}

impl GlobalSlot {
    fn to_ref(self) -> GlobalRef {
        match self {
            GlobalSlot::Function { cell } => GlobalRef::Slot { addr: cell },
            GlobalSlot::Value { cell } => GlobalRef::Cell { addr: cell },
            GlobalSlot::HostCell { addr } => GlobalRef::Cell { addr },
            GlobalSlot::Extern { addr } => GlobalRef::Extern { addr },
        }
    }
}

enum Undo {
    Insert { name: String, previous: Option<GlobalSlot> },
    Write { cell: u64, previous: u64 },
}

#[derive(Default)]
pub(crate) struct Globals {
    slots: FxHashMap<String, GlobalSlot>,
    undo: Vec<Undo>,
}

fn read_cell(cell: u64) -> u64 {
    // SAFETY: cells are region words handed out by `alloc_cell`; the region
    // outlives the table.
    unsafe { *(cell as *const u64) }
}

fn write_cell(cell: u64, value: u64) {
    // SAFETY: as for `read_cell`. Nothing else writes these words.
    unsafe { *(cell as *mut u64) = value }
}

impl Globals {
    pub(crate) fn get(&self, name: &str) -> Option<GlobalSlot> {
        self.slots.get(name).copied()
    }

    pub(crate) fn insert(&mut self, name: &str, slot: GlobalSlot) {
        let previous = self.slots.insert(name.to_string(), slot);
        self.undo.push(Undo::Insert {
            name: name.to_string(),
            previous,
        });
    }

    fn alloc_cell(region: &GlobalRegion, value: u64) -> u64 {
        let cell = region.alloc_words(1) as u64;
        write_cell(cell, value);
        cell
    }

    /// The slot cell of function `name`, created pointing at the unbound
    /// stub when it does not exist yet.
    pub(crate) fn function_cell(&mut self, name: &str, region: &GlobalRegion) -> u64 {
        if let Some(GlobalSlot::Function { cell }) = self.get(name) {
            return cell;
        }
        let cell = Self::alloc_cell(region, kiln_rt_unbound as usize as u64);
        tracing::trace!(name, cell, "allocated function slot");
        self.insert(name, GlobalSlot::Function { cell });
        cell
    }

    /// Point the slot of `name` at `code`.
    pub(crate) fn bind_function(&mut self, name: &str, region: &GlobalRegion, code: u64) -> u64 {
        let cell = self.function_cell(name, region);
        self.undo.push(Undo::Write {
            cell,
            previous: read_cell(cell),
        });
        write_cell(cell, code);
        cell
    }

    pub(crate) fn bind_value(&mut self, name: &str, region: &GlobalRegion, word: u64) {
        let cell = Self::alloc_cell(region, word);
        self.insert(name, GlobalSlot::Value { cell });
    }

    pub(crate) fn mark(&self) -> usize {
        self.undo.len()
    }

    pub(crate) fn rollback_to(&mut self, mark: usize) {
        while self.undo.len() > mark {
            match self.undo.pop() {
                Some(Undo::Insert { name, previous }) => match previous {
                    Some(slot) => {
                        self.slots.insert(name, slot);
                    }
                    None => {
                        self.slots.remove(&name);
                    }
                },
                Some(Undo::Write { cell, previous }) => write_cell(cell, previous),
                None => break,
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }
}

/// The [`GlobalResolver`] handed to lowering: a borrow of the parts of the
/// compiler that decide where a global lives.
pub(crate) struct Linker<'c> {
    pub(crate) registry: &'c TypeRegistry,
    pub(crate) env: &'c TypeEnv,
    pub(crate) globals: &'c mut Globals,
    pub(crate) ops: &'c FxHashMap<String, Arc<dyn LowLevelOp>>,
    pub(crate) region: &'c GlobalRegion,
}

impl GlobalResolver for Linker<'_> {
    fn resolve_global(&mut self, name: &str, ty: &Ty) -> Option<GlobalRef> {
        let binding = self.env.lookup_global(name)?;
        match &binding.kind {
            GlobalKind::Op => self.ops.get(name).cloned().map(GlobalRef::Op),
            GlobalKind::Value | GlobalKind::Extern => self.globals.get(name).map(GlobalSlot::to_ref),
            GlobalKind::Forward => match self.globals.get(name) {
                Some(slot) => Some(slot.to_ref()),
                None if Layouts::new(self.registry).is_function(ty) => Some(GlobalRef::Slot {
                    addr: self.globals.function_cell(name, self.region),
                }),
                None => Some(GlobalRef::Unbound),
            },
            GlobalKind::Poly(_) | GlobalKind::ClassMember(_) => None,
        }
    }

    fn region(&self) -> u64 {
        self.region as *const GlobalRegion as u64
    }

    fn store_words(&mut self, words: &[u64]) -> u64 {
        self.region.store_words(words) as u64
    }
}
