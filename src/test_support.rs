//! Shared fixtures for the unit tests: tiny object spaces, cell
//! constructors for the kinds the collector traverses, and a collection
//! helper that narrows the conservative stack window so test-frame
//! locals do not retain garbage.

use crate::cell::{
    ClassExt, Kind, NodeKind, NodeSlot, OpenFile, RNode, ValueTable, FL_EMBED, NODE_TYPESHIFT,
};
use crate::config::GcConfig;
use crate::objspace::ObjectSpace;
use crate::pages::CELLS_PER_PAGE;
use crate::value::{Q_NIL, Value};

pub fn small_space() -> Box<ObjectSpace> {
    space_with_pages(1)
}

pub fn space_with_pages(pages: usize) -> Box<ObjectSpace> {
    let config = GcConfig {
        initial_heap_min_slots: pages * CELLS_PER_PAGE,
        initial_free_min: 10,
        ..GcConfig::default()
    };
    ObjectSpace::new(config).unwrap()
}

/// Burn through the callee-saved register file so stale references from
/// earlier test code do not survive into a conservative scan.
#[inline(never)]
pub fn scramble_registers() -> u64 {
    let mut lanes = [1u64, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37];
    std::hint::black_box(&mut lanes);
    for round in 0..4u32 {
        for i in 0..lanes.len() {
            lanes[i] = lanes[i]
                .wrapping_mul(0x9e37_79b9_7f4a_7c15)
                .rotate_left((round + i as u32) % 63);
        }
    }
    std::hint::black_box(lanes.iter().copied().fold(0, u64::wrapping_add))
}

/// Overwrite the stack region just below the current frame, where
/// stale spills of caller registers could otherwise survive into the
/// scan window.
#[inline(never)]
pub fn clobber_stack() {
    let mut spoil = [0usize; 512];
    std::hint::black_box(&mut spoil);
    for word in spoil.iter_mut() {
        *word = 0;
    }
    std::hint::black_box(&spoil);
}

/// Full collection with the stack scan window narrowed to the collector
/// frames, so locals of the calling test are not treated as roots.
pub fn collect_narrow(os: &mut ObjectSpace) {
    scramble_registers();
    clobber_stack();
    let base = 0usize;
    os.set_stack_base(&base);
    assert!(os.garbage_collect());
}

/// A reference that the conservative scan cannot recognize: the low tag
/// bit makes the word an immediate. Tests hold doomed objects across a
/// collection in this form.
pub fn disguise(v: Value) -> usize {
    v.0 | 1
}

pub fn undisguise(bits: usize) -> Value {
    Value(bits & !1)
}

pub fn alloc_string(os: &mut ObjectSpace, s: &str) -> Value {
    assert!(s.len() <= crate::cell::STR_EMBED_LEN_MAX);
    let cell = os.new_cell().unwrap();
    unsafe {
        (*cell).setup(Kind::String, Q_NIL);
        let body = &mut (*cell).string.body.ary;
        body[..s.len()].copy_from_slice(s.as_bytes());
    }
    Value::of_cell(cell)
}

/// Array with an out-of-line element buffer from the tracked allocator.
pub fn alloc_array(os: &mut ObjectSpace, elems: &[Value]) -> Value {
    let buf = os
        .xmalloc2(elems.len().max(1), std::mem::size_of::<Value>())
        .unwrap() as *mut Value;
    let cell = os.new_cell().unwrap();
    unsafe {
        std::ptr::copy_nonoverlapping(elems.as_ptr(), buf, elems.len());
        (*cell).setup(Kind::Array, Q_NIL);
        (*cell).array.body.heap.len = elems.len();
        (*cell).array.body.heap.aux.capa = elems.len();
        (*cell).array.body.heap.ptr = buf;
    }
    Value::of_cell(cell)
}

pub fn alloc_hash(os: &mut ObjectSpace, pairs: &[(Value, Value)], ifnone: Value) -> Value {
    let mut tbl = ValueTable::new();
    for &(k, v) in pairs {
        tbl.insert(k, v);
    }
    let cell = os.new_cell().unwrap();
    unsafe {
        (*cell).setup(Kind::Hash, Q_NIL);
        (*cell).hash.tbl = Box::into_raw(Box::new(tbl));
        (*cell).hash.iter_lvl = 0;
        (*cell).hash.ifnone = ifnone;
    }
    Value::of_cell(cell)
}

pub fn alloc_class(os: &mut ObjectSpace, superclass: Value) -> Value {
    let cell = os.new_cell().unwrap();
    unsafe {
        (*cell).setup(Kind::Class, Q_NIL);
        (*cell).klass.ext = Box::into_raw(Box::new(ClassExt::new(superclass)));
    }
    Value::of_cell(cell)
}

pub fn class_ext(class: Value) -> *mut ClassExt {
    unsafe { (*class.as_cell()).klass.ext }
}

pub fn alloc_node(os: &mut ObjectSpace, kind: NodeKind, u1: Value, u2: Value, u3: Value) -> Value {
    let cell = os.new_cell().unwrap();
    unsafe {
        (*cell).node = RNode {
            flags: Kind::Node as usize | ((kind as usize) << NODE_TYPESHIFT),
            reserved: 0,
            u1: NodeSlot { value: u1 },
            u2: NodeSlot { value: u2 },
            u3: NodeSlot { value: u3 },
        };
    }
    Value::of_cell(cell)
}

/// Plain object with embedded (empty) instance variables.
pub fn alloc_object(os: &mut ObjectSpace) -> Value {
    let cell = os.new_cell().unwrap();
    unsafe {
        (*cell).setup(Kind::Object, Q_NIL);
        (*cell).fl_set(FL_EMBED);
        (*cell).object.body.ary = [Q_NIL; 3];
    }
    Value::of_cell(cell)
}

/// Doomed object handle: allocated, then handed back only in disguised
/// form so nothing the scan can see retains it.
#[inline(never)]
pub fn alloc_doomed_object(os: &mut ObjectSpace) -> usize {
    let v = alloc_object(os);
    let bits = disguise(v);
    scramble_registers();
    bits
}

pub fn alloc_file(os: &mut ObjectSpace) -> Value {
    let cell = os.new_cell().unwrap();
    unsafe {
        (*cell).setup(Kind::File, Q_NIL);
        (*cell).file.fptr = Box::into_raw(Box::new(OpenFile::new(-1)));
    }
    Value::of_cell(cell)
}

/// Allocate until only a small margin of free cells remains.
pub fn fill_heap_with_garbage(os: &mut ObjectSpace) {
    let n = os.heap_slots().saturating_sub(os.heap.live_num + 50);
    for _ in 0..n {
        let _ = alloc_string(os, "g");
    }
}

pub fn sweep_list_len(os: &ObjectSpace) -> usize {
    let mut n = 0;
    let mut page = os.heap.sweep_pages;
    while !page.is_null() {
        n += 1;
        unsafe {
            page = (*page).next;
        }
    }
    n
}
