// handles.rs - Handle table with strictly nested regions
//
// Handles are allocated on a stack. A region remembers the stack height at
// open and truncates back to it at close; every reused slot bumps its
// generation so stale handles are detected instead of aliasing new values.

use super::object::Val;
use crate::engine::{EngineError, EngineResult, EngineStatus, RawScope, RawValue};

struct Slot {
    generation: u32,
    val: Option<Val>,
}

struct Region {
    id: u64,
    base: usize,
    escape_slot: Option<usize>,
    escaped: bool,
}

pub(crate) struct HandleStack {
    slots: Vec<Slot>,
    len: usize,
    regions: Vec<Region>,
    next_region: u64,
}

impl HandleStack {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
            regions: Vec::new(),
            next_region: 1,
        }
    }

    pub fn alloc(&mut self, val: Val) -> RawValue {
        let index = self.len;
        if index < self.slots.len() {
            let slot = &mut self.slots[index];
            slot.generation = slot.generation.wrapping_add(1).max(1);
            slot.val = Some(val);
        } else {
            self.slots.push(Slot {
                generation: 1,
                val: Some(val),
            });
        }
        self.len += 1;
        encode(index, self.slots[index].generation)
    }

    pub fn get(&self, raw: RawValue) -> EngineResult<Val> {
        if raw.is_undefined_sentinel() {
            return Ok(Val::Undefined);
        }
        let (index, generation) = decode(raw);
        match self.slots.get(index) {
            Some(slot) if index < self.len && slot.generation == generation => {
                slot.val.clone().ok_or_else(|| stale(raw))
            }
            _ => Err(stale(raw)),
        }
    }

    pub fn open(&mut self, escapable: bool) -> RawScope {
        let escape_slot = if escapable {
            self.alloc(Val::Undefined);
            Some(self.len - 1)
        } else {
            None
        };
        let id = self.next_region;
        self.next_region += 1;
        self.regions.push(Region {
            id,
            base: self.len,
            escape_slot,
            escaped: false,
        });
        RawScope(id)
    }

    pub fn close(&mut self, scope: RawScope) -> EngineResult<()> {
        match self.regions.last() {
            Some(top) if top.id == scope.0 => {}
            Some(top) => {
                return Err(EngineError::new(
                    EngineStatus::HandleScopeMismatch,
                    format!(
                        "handle scope {} closed while {} is innermost",
                        scope.0, top.id
                    ),
                ))
            }
            None => {
                return Err(EngineError::new(
                    EngineStatus::HandleScopeMismatch,
                    format!("handle scope {} closed with no scope open", scope.0),
                ))
            }
        }
        if let Some(region) = self.regions.pop() {
            self.truncate(region.base);
        }
        Ok(())
    }

    /// Close every region opened after `scope`, then `scope` itself.
    pub fn unwind_to(&mut self, scope: RawScope) -> usize {
        let Some(pos) = self.regions.iter().rposition(|r| r.id == scope.0) else {
            return 0;
        };
        let leaked = self.regions.len() - pos - 1;
        let base = self.regions[pos].base;
        self.regions.truncate(pos);
        self.truncate(base);
        leaked
    }

    pub fn escape(&mut self, scope: RawScope, raw: RawValue) -> EngineResult<RawValue> {
        let val = self.get(raw)?;
        let region = self
            .regions
            .iter_mut()
            .find(|r| r.id == scope.0)
            .ok_or_else(|| {
                EngineError::new(
                    EngineStatus::HandleScopeMismatch,
                    format!("handle scope {} is not open", scope.0),
                )
            })?;
        let slot_index = region.escape_slot.ok_or_else(|| {
            EngineError::new(
                EngineStatus::InvalidArg,
                format!("handle scope {} is not escapable", scope.0),
            )
        })?;
        if region.escaped {
            return Err(EngineError::new(
                EngineStatus::EscapeCalledTwice,
                format!("handle scope {} already escaped a value", scope.0),
            ));
        }
        region.escaped = true;
        let slot = &mut self.slots[slot_index];
        slot.val = Some(val);
        Ok(encode(slot_index, slot.generation))
    }

    pub fn open_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn live(&self) -> usize {
        self.len
    }

    pub fn values(&self) -> impl Iterator<Item = &Val> {
        self.slots[..self.len].iter().filter_map(|s| s.val.as_ref())
    }

    fn truncate(&mut self, base: usize) {
        for slot in &mut self.slots[base..self.len] {
            slot.val = None;
        }
        self.len = base;
    }
}

fn encode(index: usize, generation: u32) -> RawValue {
    RawValue(((generation as u64) << 32) | (index as u64 + 1))
}

fn decode(raw: RawValue) -> (usize, u32) {
    let index = (raw.0 & 0xFFFF_FFFF) as usize;
    (index.wrapping_sub(1), (raw.0 >> 32) as u32)
}

fn stale(raw: RawValue) -> EngineError {
    EngineError::new(
        EngineStatus::InvalidArg,
        format!("handle {:#x} does not belong to an open handle scope", raw.0),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_close_releases_handles_and_detects_stale() {
        let mut stack = HandleStack::new();
        let outer = stack.alloc(Val::Number(1.0));
        let scope = stack.open(false);
        let inner = stack.alloc(Val::Number(2.0));
        stack.close(scope).unwrap();

        assert!(matches!(stack.get(outer), Ok(Val::Number(n)) if n == 1.0));
        assert!(stack.get(inner).is_err());

        // Slot reuse must not resurrect the old handle
        let reused = stack.alloc(Val::Number(3.0));
        assert_ne!(reused, inner);
        assert!(stack.get(inner).is_err());
    }

    #[test]
    fn test_escape_survives_close_once() {
        let mut stack = HandleStack::new();
        let scope = stack.open(true);
        let value = stack.alloc(Val::Bool(true));
        let escaped = stack.escape(scope, value).unwrap();
        assert_eq!(
            stack.escape(scope, value).unwrap_err().status,
            EngineStatus::EscapeCalledTwice
        );
        stack.close(scope).unwrap();

        assert!(matches!(stack.get(escaped), Ok(Val::Bool(true))));
        assert!(stack.get(value).is_err());
    }

    #[test]
    fn test_non_lifo_close_is_rejected() {
        let mut stack = HandleStack::new();
        let a = stack.open(false);
        let _b = stack.open(false);
        assert_eq!(
            stack.close(a).unwrap_err().status,
            EngineStatus::HandleScopeMismatch
        );
        assert_eq!(stack.unwind_to(a), 1);
        assert_eq!(stack.open_regions(), 0);
    }
}
