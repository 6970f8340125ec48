//! The modification (interceptor) system: nine transition points a
//! callback can tap, matching `spec.md §4.10`. Every derived primitive in
//! `derived.rs` (timeout, killer, future, force-stop) is built entirely out
//! of these.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::error::CoroError;
use crate::task::TaskRef;

/// One of the nine points in a task's lifecycle a modification can observe.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(usize)]
pub enum ModifKind {
    Call = 0,
    Schedule = 1,
    Exit = 2,
    Leave = 3,
    Enter = 4,
    WaitIo = 5,
    UnwaitIo = 6,
    WaitSem = 7,
    UnwaitSem = 8,
}

pub const NUM_MODIF_KINDS: usize = 9;
pub(crate) const ALL_KINDS: [ModifKind; NUM_MODIF_KINDS] = [
    ModifKind::Call,
    ModifKind::Schedule,
    ModifKind::Exit,
    ModifKind::Leave,
    ModifKind::Enter,
    ModifKind::WaitIo,
    ModifKind::UnwaitIo,
    ModifKind::WaitSem,
    ModifKind::UnwaitSem,
];

/// Whether a modification follows a task across a `call` (sub-task await)
/// or a `schedule` (fresh top-level task), or both, or neither.
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct ModifFlags {
    pub on_call: bool,
    pub on_schedule: bool,
}

impl ModifFlags {
    pub const NONE: ModifFlags = ModifFlags { on_call: false, on_schedule: false };
    pub const CALL: ModifFlags = ModifFlags { on_call: true, on_schedule: false };
    pub const SCHEDULE: ModifFlags = ModifFlags { on_call: false, on_schedule: true };
    pub const BOTH: ModifFlags = ModifFlags { on_call: true, on_schedule: true };
}

/// A callback attached to a [`ModifKind`]. `Notify` variants (exit/leave/
/// enter) ignore their return value, matching `spec.md`'s "return value
/// ignored" note for those three points.
pub enum Callback {
    Transition(Rc<dyn Fn(&TaskRef) -> Result<(), CoroError>>),
    Notify(Rc<dyn Fn(&TaskRef)>),
    Io(Rc<dyn Fn(&TaskRef, &mut crate::reactor::IoMask) -> Result<(), CoroError>>),
    Sem(Rc<dyn Fn(&TaskRef, usize) -> Result<(), CoroError>>),
}

/// One registered modification: a callback plus its inheritance flags. The
/// `id` gives callbacks stable identity for the de-duplication `spec.md
/// §4.10` requires when merging a parent's inheritable set into a child.
pub struct ModifEntry {
    pub id: usize,
    pub kind: ModifKind,
    pub flags: ModifFlags,
    pub callback: Callback,
}

/// A shareable, clonable reference to one registered modification.
#[derive(Clone)]
pub struct ModifHandle(pub(crate) Rc<ModifEntry>);

impl fmt::Debug for ModifHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModifHandle(#{}, {:?})", self.0.id, self.0.kind)
    }
}

impl PartialEq for ModifHandle {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

fn next_modif_id() -> usize {
    use std::sync::atomic::{AtomicUsize, Ordering};
    static NEXT: AtomicUsize = AtomicUsize::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Registers a transition-style callback (Call or Schedule).
pub fn create_modif(
    kind: ModifKind,
    flags: ModifFlags,
    cbk: impl Fn(&TaskRef) -> Result<(), CoroError> + 'static,
) -> ModifHandle {
    ModifHandle(Rc::new(ModifEntry {
        id: next_modif_id(),
        kind,
        flags,
        callback: Callback::Transition(Rc::new(cbk)),
    }))
}

/// Registers a notify-style callback (Exit, Leave, Enter).
pub fn create_notify_modif(
    kind: ModifKind,
    flags: ModifFlags,
    cbk: impl Fn(&TaskRef) + 'static,
) -> ModifHandle {
    ModifHandle(Rc::new(ModifEntry { id: next_modif_id(), kind, flags, callback: Callback::Notify(Rc::new(cbk)) }))
}

/// Registers a Wait-IO/Unwait-IO callback.
pub fn create_io_modif(
    kind: ModifKind,
    flags: ModifFlags,
    cbk: impl Fn(&TaskRef, &mut crate::reactor::IoMask) -> Result<(), CoroError> + 'static,
) -> ModifHandle {
    ModifHandle(Rc::new(ModifEntry { id: next_modif_id(), kind, flags, callback: Callback::Io(Rc::new(cbk)) }))
}

/// Registers a Wait-Sem/Unwait-Sem callback. The `usize` is the waiter's
/// stable handle within the semaphore's FIFO.
pub fn create_sem_modif(
    kind: ModifKind,
    flags: ModifFlags,
    cbk: impl Fn(&TaskRef, usize) -> Result<(), CoroError> + 'static,
) -> ModifHandle {
    ModifHandle(Rc::new(ModifEntry { id: next_modif_id(), kind, flags, callback: Callback::Sem(Rc::new(cbk)) }))
}

/// A named set of modifications, used to attach a group (e.g. a killer
/// pack) to a task in one call.
#[derive(Clone, Default)]
pub struct ModifPack(pub Vec<ModifHandle>);

impl ModifPack {
    pub fn new() -> Self {
        ModifPack(Vec::new())
    }

    pub fn push(&mut self, handle: ModifHandle) {
        self.0.push(handle);
    }
}

/// Per-task table of attached modifications, one vector per transition
/// point (`spec.md`'s "array of nine vectors").
#[derive(Default)]
pub struct ModifTable {
    pub(crate) slots: RefCell<[Vec<Rc<ModifEntry>>; NUM_MODIF_KINDS]>,
}

impl ModifTable {
    pub fn new() -> Self {
        ModifTable { slots: RefCell::new(Default::default()) }
    }

    pub fn add(&self, handle: &ModifHandle) {
        let mut slots = self.slots.borrow_mut();
        let bucket = &mut slots[handle.0.kind as usize];
        if !bucket.iter().any(|e| Rc::ptr_eq(e, &handle.0)) {
            bucket.push(handle.0.clone());
        }
    }

    pub fn add_pack(&self, pack: &ModifPack) {
        for h in &pack.0 {
            self.add(h);
        }
    }

    pub fn remove(&self, handle: &ModifHandle) {
        let mut slots = self.slots.borrow_mut();
        slots[handle.0.kind as usize].retain(|e| !Rc::ptr_eq(e, &handle.0));
    }

    /// Builds the child table for a new subtask: inheritable entries from
    /// `parent` that carry the matching flag, deduplicated by identity,
    /// plus anything already explicitly attached to `child`.
    pub fn inherit_from(parent: &ModifTable, on_call: bool) -> ModifTable {
        let child = ModifTable::new();
        child.graft_from(parent, on_call);
        child
    }

    /// Merges `parent`'s inheritable entries into `self` in place, for the
    /// case where the child's table already exists by the time its caller
    /// is known (every task is constructed before it has a caller).
    pub(crate) fn graft_from(&self, parent: &ModifTable, on_call: bool) {
        let parent_slots = parent.slots.borrow();
        let mut self_slots = self.slots.borrow_mut();
        for kind in ALL_KINDS {
            for entry in &parent_slots[kind as usize] {
                let inherits = if on_call { entry.flags.on_call } else { entry.flags.on_schedule };
                if inherits && !self_slots[kind as usize].iter().any(|e| Rc::ptr_eq(e, entry)) {
                    self_slots[kind as usize].push(entry.clone());
                }
            }
        }
    }

    /// Runs every Call/Schedule callback for `kind`, aborting at the first
    /// error (`spec.md`: "Failure aborts the transition").
    pub fn run_transition(&self, kind: ModifKind, task: &TaskRef) -> Result<(), CoroError> {
        let entries: Vec<_> = self.slots.borrow()[kind as usize].clone();
        for entry in entries {
            if let Callback::Transition(f) = &entry.callback {
                f(task)?;
            }
        }
        Ok(())
    }

    /// Runs every Exit/Leave/Enter callback for `kind`; return values are
    /// ignored per `spec.md`.
    pub fn run_notify(&self, kind: ModifKind, task: &TaskRef) {
        let entries: Vec<_> = self.slots.borrow()[kind as usize].clone();
        for entry in entries {
            if let Callback::Notify(f) = &entry.callback {
                f(task);
            }
        }
    }

    pub fn run_io(
        &self,
        kind: ModifKind,
        task: &TaskRef,
        mask: &mut crate::reactor::IoMask,
    ) -> Result<(), CoroError> {
        let entries: Vec<_> = self.slots.borrow()[kind as usize].clone();
        for entry in entries {
            if let Callback::Io(f) = &entry.callback {
                f(task, mask)?;
            }
        }
        Ok(())
    }

    pub fn run_sem(&self, kind: ModifKind, task: &TaskRef, waiter_id: usize) -> Result<(), CoroError> {
        let entries: Vec<_> = self.slots.borrow()[kind as usize].clone();
        for entry in entries {
            if let Callback::Sem(f) = &entry.callback {
                f(task, waiter_id)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{dummy_task_ref_for_modif_tests, TaskId};
    use std::cell::Cell;

    fn dummy_task_ref() -> TaskRef {
        dummy_task_ref_for_modif_tests(TaskId(0))
    }

    #[test]
    fn inherited_modif_crosses_into_child() {
        let parent = ModifTable::new();
        let handle = create_modif(ModifKind::Call, ModifFlags::CALL, |_| Ok(()));
        parent.add(&handle);

        let child = ModifTable::inherit_from(&parent, true);
        assert_eq!(child.slots.borrow()[ModifKind::Call as usize].len(), 1);
    }

    #[test]
    fn schedule_only_modif_does_not_inherit_on_call() {
        let parent = ModifTable::new();
        let handle = create_modif(ModifKind::Call, ModifFlags::SCHEDULE, |_| Ok(()));
        parent.add(&handle);

        let child = ModifTable::inherit_from(&parent, true);
        assert!(child.slots.borrow()[ModifKind::Call as usize].is_empty());
    }

    #[test]
    fn duplicate_add_is_deduplicated() {
        let table = ModifTable::new();
        let handle = create_modif(ModifKind::Call, ModifFlags::NONE, |_| Ok(()));
        table.add(&handle);
        table.add(&handle);
        assert_eq!(table.slots.borrow()[ModifKind::Call as usize].len(), 1);
    }

    #[test]
    fn transition_failure_aborts_remaining_callbacks() {
        let table = ModifTable::new();
        let ran = Rc::new(Cell::new(0));
        let ran2 = ran.clone();
        table.add(&create_modif(ModifKind::Call, ModifFlags::NONE, move |_| {
            ran2.set(ran2.get() + 1);
            Err(CoroError::ModifRejected)
        }));
        let ran3 = ran.clone();
        table.add(&create_modif(ModifKind::Call, ModifFlags::NONE, move |_| {
            ran3.set(ran3.get() + 1);
            Ok(())
        }));
        let task = dummy_task_ref();
        let result = table.run_transition(ModifKind::Call, &task);
        assert!(result.is_err());
        assert_eq!(ran.get(), 1);
    }
}
