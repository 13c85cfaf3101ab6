//! Finalization.
//!
//! Sweep retags finalizable cells as zombies and chains them onto the
//! deferred list; the drain runs outside the collector, executing the
//! deferred free hook and then every user callable in registration
//! order. A callable that fails is dropped and the next one still runs.
//! The deferred head is swapped atomically so callables registered
//! while a drain is running queue for the next one.

use std::sync::atomic::Ordering;

use log::debug;

use crate::cell::{Cell, DataFree, Kind, FL_FINALIZE, FL_SINGLETON, KIND_ID_MAX};
use crate::error::Error;
use crate::objspace::{FinalizerEntry, FinalizerFn, FinalizerList, ObjectSpace};
use crate::pages::{marked_in_bitmap, page_header_of, CELL_SIZE};
use crate::value::{Value, FIXNUM_FLAG, Q_FALSE, Q_NIL, Q_TRUE};

/// Deferred hook releasing the retained state of an open file.
pub(crate) unsafe fn free_open_file(fptr: *mut libc::c_void) {
    drop(Box::from_raw(fptr as *mut crate::cell::OpenFile));
}

unsafe fn reverse_zombie_chain(mut p: *mut Cell) -> *mut Cell {
    let mut prev: *mut Cell = std::ptr::null_mut();
    while !p.is_null() {
        let next = (*p).free.next;
        (*p).free.next = prev;
        prev = p;
        p = next;
    }
    prev
}

impl ObjectSpace {
    /// Register a callable to run after `obj` becomes unreachable.
    pub fn define_finalizer(&mut self, obj: Value, func: FinalizerFn) -> Result<(), Error> {
        self.define_finalizer_full(obj, 0, Vec::new(), func)
    }

    /// Full form: capture the host safe level and pin heap values the
    /// callable depends on (they are marked with the table).
    pub fn define_finalizer_full(
        &mut self,
        obj: Value,
        safe_level: u32,
        pins: Vec<Value>,
        func: FinalizerFn,
    ) -> Result<(), Error> {
        if obj.special_const_p() {
            return Err(Error::CannotFinalize);
        }
        unsafe {
            obj.cell_mut().fl_set(FL_FINALIZE);
        }
        let list = self
            .finalizer_table
            .entry(obj.0)
            .or_insert_with(FinalizerList::default);
        list.borrow_mut().push(FinalizerEntry {
            safe_level,
            pins,
            func,
        });
        Ok(())
    }

    /// Remove all finalizers for `obj`.
    pub fn undefine_finalizer(&mut self, obj: Value) {
        if obj.special_const_p() {
            return;
        }
        self.finalizer_table.remove(&obj.0);
        unsafe {
            obj.cell_mut().fl_unset(FL_FINALIZE);
        }
    }

    /// Share `obj`'s finalizer list with `dest` (used by the host's
    /// clone/dup paths).
    pub fn copy_finalizer(&mut self, dest: Value, obj: Value) {
        if obj.special_const_p() || dest.special_const_p() {
            return;
        }
        unsafe {
            if !obj.cell_ref().fl_test(FL_FINALIZE) {
                return;
            }
        }
        if let Some(list) = self.finalizer_table.get(&obj.0) {
            let shared = list.clone();
            self.finalizer_table.insert(dest.0, shared);
        }
        unsafe {
            dest.cell_mut().fl_set(FL_FINALIZE);
        }
    }

    pub fn finalizer_defined(&self, obj: Value) -> bool {
        self.finalizer_table.contains_key(&obj.0)
    }

    /// Run `obj`'s finalizer list, entry by entry, dropping failures.
    fn run_finalizer(&mut self, obj: Value, table: FinalizerList) {
        let objid = self.id_of(obj);
        let len = table.borrow().len();
        for i in 0..len {
            let result = {
                let mut entries = table.borrow_mut();
                let entry = &mut entries[i];
                (entry.func)(self, objid)
            };
            if let Err(err) = result {
                debug!("finalizer for {:?} failed: {}", objid, err);
            }
        }
    }

    /// Complete one zombie: run the deferred free hook, then the user
    /// callables, and drop the table entry.
    unsafe fn run_final(&mut self, p: *mut Cell) {
        self.heap.final_num = self.heap.final_num.saturating_sub(1);
        (*p).basic.klass = Q_FALSE;

        match (*p).data.dfree {
            DataFree::Skip => {}
            DataFree::Dealloc => {
                let data = (*p).data.data;
                if !data.is_null() {
                    self.xfree(data as *mut u8);
                }
            }
            DataFree::Call(f) => {
                let data = (*p).data.data;
                if !data.is_null() {
                    f(data);
                }
            }
        }

        let obj = Value::of_cell(p);
        if let Some(table) = self.finalizer_table.remove(&obj.0) {
            self.run_finalizer(obj, table);
        }
    }

    /// Finalize a chain of zombies. Cells from released pages only
    /// decrement their page's limit; the rest go back to freelists.
    pub(crate) unsafe fn finalize_list(&mut self, mut p: *mut Cell) {
        while !p.is_null() {
            let tmp = (*p).free.next;
            self.run_final(p);
            if !(*p).fl_test(FL_SINGLETON) {
                self.add_cell_local_freelist(p);
                if !self.is_lazy_sweeping() {
                    self.heap.live_num = self.heap.live_num.saturating_sub(1);
                }
            } else {
                // page already released from the heap lists: only the
                // header accounting remains
                (*page_header_of(p)).limit -= 1;
            }
            p = tmp;
        }
    }

    /// Drain every queued zombie. The atomic swap makes cells deferred
    /// during the drain queue for the next call. Sweep pushes at the
    /// head, so the chain is reversed first to finalize in the order
    /// the cells were condemned.
    pub(crate) fn finalize_deferred_drain(&mut self) {
        loop {
            let head = self
                .deferred_final_list
                .swap(std::ptr::null_mut(), Ordering::SeqCst);
            if head.is_null() {
                break;
            }
            let head = unsafe { reverse_zombie_chain(head) };
            unsafe { self.finalize_list(head) };
        }
    }

    /// Host entry point: drain zombies unless a drain is already in
    /// progress.
    pub fn finalize_deferred(&mut self) {
        if self.finalizing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.finalize_deferred_drain();
        self.finalizing.store(false, Ordering::SeqCst);
    }

    /// Shutdown path: drain zombies, force every registered finalizer,
    /// then run data/file release hooks for whatever still lives on the
    /// heap (skipping cells the host exempts).
    pub fn call_finalizer_at_exit(&mut self) {
        self.rest_sweep();
        self.finalize_deferred_drain();

        if self.finalizing.swap(true, Ordering::SeqCst) {
            return;
        }

        // force-run finalizers, including any registered by finalizers
        while !self.finalizer_table.is_empty() {
            let keys: Vec<usize> = self.finalizer_table.keys().copied().collect();
            for key in keys {
                if let Some(table) = self.finalizer_table.remove(&key) {
                    self.run_finalizer(Value(key), table);
                }
            }
        }

        // release hooks are part of collection
        self.during_gc = true;
        let mut final_list: *mut Cell = std::ptr::null_mut();
        let headers = self.heap.sorted.clone();
        for header in headers {
            unsafe {
                let mut p = (*header).start;
                while p < (*header).end {
                    let v = Value::of_cell(p);
                    let skip = self.at_exit_skip.map(|f| f(self, v)).unwrap_or(false);
                    if (*p).kind_p(Kind::Data) && !(*p).data.data.is_null() && !skip {
                        let dfree = if (*p).typed_data_p() {
                            match (*p).data_type() {
                                Some(typ) => typ.dfree,
                                None => DataFree::Skip,
                            }
                        } else {
                            (*p).data.dfree
                        };
                        match dfree {
                            DataFree::Skip => {}
                            DataFree::Dealloc => {
                                let data = (*p).data.data;
                                (*p).set_flags(0);
                                self.xfree(data as *mut u8);
                            }
                            DataFree::Call(f) => {
                                self.make_deferred(p, f);
                                (*p).free.next = final_list;
                                final_list = p;
                            }
                        }
                    } else if (*p).kind_p(Kind::File) && !(*p).file.fptr.is_null() && !skip {
                        self.make_io_deferred(p);
                        (*p).free.next = final_list;
                        final_list = p;
                    }
                    p = p.add(1);
                }
            }
        }
        self.during_gc = false;

        if !final_list.is_null() {
            unsafe { self.finalize_list(final_list) };
        }

        self.finalizer_table.clear();
        self.finalizing.store(false, Ordering::SeqCst);
    }

    // -- object ids --------------------------------------------------------

    /// Stable identifier for `obj`: immediates map to themselves,
    /// symbols to a reserved congruence class, heap objects to their
    /// address with the low tag bit set.
    pub fn id_of(&self, obj: Value) -> Value {
        if obj.symbol_p() {
            return Value((obj.symbol_id() * CELL_SIZE + (4 << 2)) | FIXNUM_FLAG);
        }
        if obj.special_const_p() {
            return obj;
        }
        Value(obj.0 | FIXNUM_FLAG)
    }

    fn is_id_value(&self, ptr: usize) -> bool {
        if !self.heap.is_pointer_to_heap(ptr as *const libc::c_void) {
            return false;
        }
        let cell = unsafe { &*(ptr as *const Cell) };
        if cell.kind_raw() > KIND_ID_MAX {
            return false;
        }
        !cell.kind_p(Kind::IClass)
    }

    fn is_dead_object(&self, ptr: usize) -> bool {
        if !self.is_lazy_sweeping() || unsafe { marked_in_bitmap(ptr as *const Cell) } {
            return false;
        }
        // unmarked and on a page still awaiting sweep: condemned
        let mut page = self.heap.sweep_pages;
        while !page.is_null() {
            unsafe {
                let header = (*page).header;
                if ptr >= (*header).start as usize && ptr < (*header).end as usize {
                    return true;
                }
                page = (*page).next;
            }
        }
        false
    }

    fn is_live_object(&self, ptr: usize) -> bool {
        let cell = unsafe { &*(ptr as *const Cell) };
        if cell.flags() == 0 {
            return false;
        }
        if cell.klass() == Q_FALSE {
            return false;
        }
        !self.is_dead_object(ptr)
    }

    /// Recover the object behind an id produced by [`Self::id_of`].
    /// Fails for words that are not ids and for reclaimed objects.
    pub fn id_to_ref(&mut self, id: Value) -> Result<Value, Error> {
        if id == Q_TRUE || id == Q_FALSE || id == Q_NIL {
            return Ok(id);
        }
        if !id.fixnum_p() {
            return Err(Error::NotIdValue(id.0));
        }
        let ptr = id.0 ^ FIXNUM_FLAG;
        if ptr % CELL_SIZE == (4 << 2) {
            return Ok(Value::symbol(ptr / CELL_SIZE));
        }
        if !self.is_id_value(ptr) {
            return Err(Error::NotIdValue(ptr));
        }
        if !self.is_live_object(ptr) {
            return Err(Error::RecycledObject(ptr));
        }
        Ok(Value(ptr))
    }
}
