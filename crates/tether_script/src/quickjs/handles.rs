// handles.rs - Persistent slots grouped into strictly nested regions
//
// Every slot keeps its JS value alive until the region that owns it closes.
// Slots created while no region is open belong to the base region, which only
// engine teardown releases. Handle ids are never reused, so a stale handle is
// simply missing instead of aliasing a newer value.

use crate::engine::{EngineError, EngineResult, EngineStatus, RawScope, RawValue};
use rquickjs::{Persistent, Value};
use std::collections::HashMap;

pub(crate) type Slot = Persistent<Value<'static>>;

struct Region {
    id: u64,
    escapable: bool,
    escaped: bool,
    handles: Vec<u64>,
}

pub(crate) struct HandleTable {
    slots: HashMap<u64, Slot>,
    base: Vec<u64>,
    regions: Vec<Region>,
    next_handle: u64,
    next_region: u64,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            slots: HashMap::new(),
            base: Vec::new(),
            regions: Vec::new(),
            next_handle: 1,
            next_region: 1,
        }
    }

    pub fn insert(&mut self, slot: Slot) -> RawValue {
        let id = self.next_handle;
        self.next_handle += 1;
        self.slots.insert(id, slot);
        match self.regions.last_mut() {
            Some(region) => region.handles.push(id),
            None => self.base.push(id),
        }
        RawValue(id)
    }

    pub fn get(&self, raw: RawValue) -> EngineResult<Slot> {
        self.slots.get(&raw.0).cloned().ok_or_else(|| stale(raw))
    }

    pub fn open(&mut self, escapable: bool) -> RawScope {
        let id = self.next_region;
        self.next_region += 1;
        self.regions.push(Region {
            id,
            escapable,
            escaped: false,
            handles: Vec::new(),
        });
        RawScope(id)
    }

    /// Close the innermost region. The released slots are handed back so the
    /// caller can drop them outside any borrow of this table.
    pub fn close(&mut self, scope: RawScope) -> EngineResult<Vec<Slot>> {
        match self.regions.pop() {
            Some(region) if region.id == scope.0 => Ok(self.release(&region.handles)),
            Some(region) => {
                let innermost = region.id;
                self.regions.push(region);
                Err(EngineError::new(
                    EngineStatus::HandleScopeMismatch,
                    format!("handle scope {} closed while {innermost} is innermost", scope.0),
                ))
            }
            None => Err(EngineError::new(
                EngineStatus::HandleScopeMismatch,
                format!("handle scope {} closed with no scope open", scope.0),
            )),
        }
    }

    /// Close every region opened after `scope`, then `scope` itself. Returns
    /// how many regions were left open above it, plus the released slots.
    pub fn unwind_to(&mut self, scope: RawScope) -> (usize, Vec<Slot>) {
        let Some(pos) = self.regions.iter().rposition(|r| r.id == scope.0) else {
            return (0, Vec::new());
        };
        let leaked = self.regions.len() - pos - 1;
        let closed: Vec<Region> = self.regions.drain(pos..).collect();
        let released = closed
            .iter()
            .flat_map(|region| region.handles.iter())
            .filter_map(|id| self.slots.remove(id))
            .collect();
        (leaked, released)
    }

    pub fn escape(&mut self, scope: RawScope, raw: RawValue) -> EngineResult<RawValue> {
        let pos = self
            .regions
            .iter()
            .rposition(|r| r.id == scope.0)
            .ok_or_else(|| {
                EngineError::new(
                    EngineStatus::HandleScopeMismatch,
                    format!("handle scope {} is not open", scope.0),
                )
            })?;
        let region = &self.regions[pos];
        if !region.escapable {
            return Err(EngineError::new(
                EngineStatus::InvalidArg,
                format!("handle scope {} is not escapable", scope.0),
            ));
        }
        if region.escaped {
            return Err(EngineError::new(
                EngineStatus::EscapeCalledTwice,
                format!("handle scope {} already escaped a value", scope.0),
            ));
        }
        let slot = if raw.is_undefined_sentinel() {
            None
        } else {
            Some(self.get(raw)?)
        };
        self.regions[pos].escaped = true;
        let Some(slot) = slot else {
            return Ok(RawValue::UNDEFINED);
        };

        let id = self.next_handle;
        self.next_handle += 1;
        self.slots.insert(id, slot);
        match pos.checked_sub(1) {
            Some(parent) => self.regions[parent].handles.push(id),
            None => self.base.push(id),
        }
        Ok(RawValue(id))
    }

    pub fn open_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn live(&self) -> usize {
        self.slots.len()
    }

    /// Forget every region and hand back every slot.
    pub fn clear(&mut self) -> Vec<Slot> {
        self.regions.clear();
        self.base.clear();
        self.slots.drain().map(|(_, slot)| slot).collect()
    }

    fn release(&mut self, ids: &[u64]) -> Vec<Slot> {
        ids.iter().filter_map(|id| self.slots.remove(id)).collect()
    }
}

fn stale(raw: RawValue) -> EngineError {
    EngineError::new(
        EngineStatus::InvalidArg,
        format!("handle {:#x} does not belong to an open handle scope", raw.0),
    )
}
