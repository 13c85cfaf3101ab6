//! Root scanning and marking.
//!
//! The mark phase enumerates the root set (host hooks, finalizer pins,
//! the machine context, pinned addresses and values), then drains the
//! mark stack, enumerating children per kind tag. The machine context
//! scan is conservative: every word in the saved register file and on
//! the thread stack that passes the heap filter is treated as a
//! reference. Long linear chains (superclass links, string sharing) are
//! followed in place instead of growing the stack: each kind's last
//! child continues the enumeration loop directly.

use log::debug;

use crate::cell::{Kind, NodeKind, FL_EXIVAR, ELTS_SHARED};
use crate::error::bug;
use crate::objspace::ObjectSpace;
use crate::pages::{mark_in_bitmap, marked_in_bitmap};
use crate::value::Value;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub(crate) const SAVED_REGISTER_WORDS: usize = 7;

        /// Spill the callee-saved register file (and the stack pointer)
        /// into `buf`. A reference held only in a register must land
        /// somewhere the conservative scan can see it.
        #[inline(never)]
        fn save_machine_registers(buf: &mut [usize; SAVED_REGISTER_WORDS]) {
            unsafe {
                core::arch::asm!(
                    "mov [{p}], rbx",
                    "mov [{p} + 8], rbp",
                    "mov [{p} + 16], rsp",
                    "mov [{p} + 24], r12",
                    "mov [{p} + 32], r13",
                    "mov [{p} + 40], r14",
                    "mov [{p} + 48], r15",
                    p = in(reg) buf.as_mut_ptr(),
                    options(nostack),
                );
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        pub(crate) const SAVED_REGISTER_WORDS: usize = 13;

        #[inline(never)]
        fn save_machine_registers(buf: &mut [usize; SAVED_REGISTER_WORDS]) {
            unsafe {
                core::arch::asm!(
                    "stp x19, x20, [{p}]",
                    "stp x21, x22, [{p}, #16]",
                    "stp x23, x24, [{p}, #32]",
                    "stp x25, x26, [{p}, #48]",
                    "stp x27, x28, [{p}, #64]",
                    "stp x29, x30, [{p}, #80]",
                    "mov {tmp}, sp",
                    "str {tmp}, [{p}, #96]",
                    p = in(reg) buf.as_mut_ptr(),
                    tmp = out(reg) _,
                    options(nostack),
                );
            }
        }
    } else {
        // No spill on this target; references in registers are expected
        // to also live in stack frames the scan covers.
        pub(crate) const SAVED_REGISTER_WORDS: usize = 1;

        #[inline(never)]
        fn save_machine_registers(_buf: &mut [usize; SAVED_REGISTER_WORDS]) {}
    }
}

/// Address of a local: a safe under-approximation of the current stack
/// pointer, taken inside the frame that wants to bound the scan.
#[inline(always)]
fn approximate_stack_pointer() -> *const usize {
    let mut result = std::ptr::null();
    result = &result as *const _ as *const usize;
    result
}

impl ObjectSpace {
    /// Record a reference. The caller guarantees `v` is either a
    /// special constant or a pointer to a cell of this object space;
    /// feed untrusted words through [`ObjectSpace::mark_maybe`] instead.
    ///
    /// # Safety
    /// `v` must satisfy the contract above; an arbitrary word here reads
    /// through an arbitrary pointer.
    pub unsafe fn mark(&mut self, v: Value) {
        if v.special_const_p() {
            return;
        }
        let p = v.as_cell();
        if (*p).free_p() {
            return;
        }
        if marked_in_bitmap(p) {
            return;
        }
        mark_in_bitmap(p);
        self.heap.live_num += 1;
        self.mark_stack.push(v);
    }

    /// Conservative variant: `v` may be any word; only marked when it
    /// passes the heap membership filter.
    pub fn mark_maybe(&mut self, v: Value) {
        if self.heap.is_pointer_to_heap(v.0 as *const libc::c_void) {
            unsafe { self.mark(v) };
        }
    }

    /// Scan `n` words starting at `x` as potential references.
    pub(crate) fn mark_locations_array(&mut self, x: *const Value, n: usize) {
        for i in 0..n {
            let v = unsafe { *x.add(i) };
            self.mark_maybe(v);
        }
    }

    /// Scan the half-open word range `[start, end)`.
    pub fn mark_locations(&mut self, start: *const Value, end: *const Value) {
        if end <= start {
            return;
        }
        let n = unsafe { end.offset_from(start) } as usize;
        self.mark_locations_array(start, n);
    }

    /// Capture the register file and scan it together with the machine
    /// stack between the registered base and the live stack pointer.
    #[inline(never)]
    pub(crate) fn mark_current_machine_context(&mut self) {
        let mut save_regs = [0usize; SAVED_REGISTER_WORDS];
        save_machine_registers(&mut save_regs);
        self.mark_locations_array(save_regs.as_ptr() as *const Value, save_regs.len());

        if self.stack_base.is_null() {
            return;
        }
        let stack_start = self.stack_base as *const Value;
        let stack_end = approximate_stack_pointer() as *const Value;
        // growth-direction aware: order the bounds at runtime
        let (lo, hi) = if stack_end < stack_start {
            (stack_end, stack_start)
        } else {
            (stack_start, unsafe { stack_end.add(1) })
        };
        self.mark_locations(lo, hi);
    }

    /// Pins registered alongside finalizer callables; the table itself
    /// holds host closures, not heap values.
    fn mark_finalizer_table(&mut self) {
        let pins: Vec<Value> = self
            .finalizer_table
            .values()
            .flat_map(|list| {
                list.borrow()
                    .iter()
                    .flat_map(|entry| entry.pins.clone())
                    .collect::<Vec<Value>>()
            })
            .collect();
        for v in pins {
            unsafe { self.mark(v) };
        }
    }

    /// The stop-the-world mark phase.
    pub(crate) fn gc_marks(&mut self) {
        self.heap.live_num = 0;
        self.count += 1;
        debug!("mark phase: cycle {}", self.count);

        if let Some(hook) = self.vm_hook.take() {
            hook(self);
            self.vm_hook = Some(hook);
        }

        self.mark_finalizer_table();
        self.mark_current_machine_context();

        let hooks = std::mem::take(&mut self.root_hooks);
        for hook in &hooks {
            hook(self);
        }
        self.root_hooks = hooks;

        let globals = self.global_list.clone();
        for addr in globals {
            let v = unsafe { *addr };
            self.mark_maybe(v);
        }

        let pinned = self.mark_object_ary.clone();
        for v in pinned {
            unsafe { self.mark(v) };
        }

        self.gc_mark_stacked_objects();

        self.stats.live_after_last_mark_phase = self.heap.live_num;
        debug!("mark phase: {} live", self.heap.live_num);
    }

    /// Drain the mark stack, then trim its chunk cache.
    pub(crate) fn gc_mark_stacked_objects(&mut self) {
        while let Some(v) = self.mark_stack.pop() {
            unsafe { self.mark_children(v) };
        }
        self.mark_stack.shrink_cache();
    }

    /// Enumerate the children of `v`, which is already marked. The last
    /// child of each kind re-enters the loop instead of being pushed.
    pub(crate) unsafe fn mark_children(&mut self, v: Value) {
        let mut v = v;
        let mut first = true;
        loop {
            if !first {
                // the tail-continued child goes through the same gate
                // as `mark`
                if v.special_const_p() {
                    return;
                }
                if (*v.as_cell()).free_p() {
                    return;
                }
                if marked_in_bitmap(v.as_cell()) {
                    return;
                }
                mark_in_bitmap(v.as_cell());
                self.heap.live_num += 1;
            }
            first = false;

            let cell = v.cell_ref();
            if cell.fl_test(FL_EXIVAR) {
                if let Some(hook) = self.generic_ivar_mark {
                    hook(self, v);
                }
            }

            if cell.kind_p(Kind::Node) {
                let node = &cell.node;
                match node.nd_type() {
                    Some(
                        NodeKind::If
                        | NodeKind::For
                        | NodeKind::Iter
                        | NodeKind::When
                        | NodeKind::Masgn
                        | NodeKind::Rescue
                        | NodeKind::Resbody
                        | NodeKind::Class
                        | NodeKind::BlockPass,
                    ) => {
                        self.mark(node.u2.value);
                        self.mark(node.u1.value);
                        v = node.u3.value;
                        continue;
                    }
                    Some(
                        NodeKind::Block
                        | NodeKind::Optblock
                        | NodeKind::Array
                        | NodeKind::Dstr
                        | NodeKind::Dxstr
                        | NodeKind::Dregx
                        | NodeKind::DregxOnce
                        | NodeKind::Ensure
                        | NodeKind::Call
                        | NodeKind::Defs
                        | NodeKind::OpAsgn1
                        | NodeKind::Args,
                    ) => {
                        self.mark(node.u1.value);
                        v = node.u3.value;
                        continue;
                    }
                    Some(
                        NodeKind::Super
                        | NodeKind::Fcall
                        | NodeKind::Defn
                        | NodeKind::ArgsAux,
                    ) => {
                        v = node.u3.value;
                        continue;
                    }
                    Some(
                        NodeKind::While
                        | NodeKind::Until
                        | NodeKind::And
                        | NodeKind::Or
                        | NodeKind::Case
                        | NodeKind::Sclass
                        | NodeKind::Dot2
                        | NodeKind::Dot3
                        | NodeKind::Flip2
                        | NodeKind::Flip3
                        | NodeKind::Match2
                        | NodeKind::Match3
                        | NodeKind::OpAsgnOr
                        | NodeKind::OpAsgnAnd
                        | NodeKind::Module
                        | NodeKind::Alias
                        | NodeKind::Valias
                        | NodeKind::Argscat,
                    ) => {
                        self.mark(node.u1.value);
                        v = node.u2.value;
                        continue;
                    }
                    Some(
                        NodeKind::Gasgn
                        | NodeKind::Lasgn
                        | NodeKind::Dasgn
                        | NodeKind::DasgnCurr
                        | NodeKind::Iasgn
                        | NodeKind::Iasgn2
                        | NodeKind::Cvasgn
                        | NodeKind::Colon3
                        | NodeKind::OptN
                        | NodeKind::Evstr
                        | NodeKind::Undef
                        | NodeKind::Postexe,
                    ) => {
                        v = node.u2.value;
                        continue;
                    }
                    Some(
                        NodeKind::Hash
                        | NodeKind::Lit
                        | NodeKind::Str
                        | NodeKind::Xstr
                        | NodeKind::Defined
                        | NodeKind::Match
                        | NodeKind::Return
                        | NodeKind::Break
                        | NodeKind::Next
                        | NodeKind::Yield
                        | NodeKind::Colon2
                        | NodeKind::Splat
                        | NodeKind::ToAry,
                    ) => {
                        v = node.u1.value;
                        continue;
                    }
                    Some(NodeKind::Scope | NodeKind::Cdecl | NodeKind::OptArg) => {
                        self.mark(node.u3.value);
                        v = node.u2.value;
                        continue;
                    }
                    Some(NodeKind::Alloca) => {
                        // embedded word array: conservative scan
                        self.mark_locations_array(node.u1.argv as *const Value, node.u3.cnt);
                        v = node.u2.value;
                        continue;
                    }
                    Some(
                        NodeKind::Zarray
                        | NodeKind::Zsuper
                        | NodeKind::Vcall
                        | NodeKind::Gvar
                        | NodeKind::Lvar
                        | NodeKind::Dvar
                        | NodeKind::Ivar
                        | NodeKind::Cvar
                        | NodeKind::NthRef
                        | NodeKind::BackRef
                        | NodeKind::Redo
                        | NodeKind::Retry
                        | NodeKind::SelfNode
                        | NodeKind::NilNode
                        | NodeKind::TrueNode
                        | NodeKind::FalseNode
                        | NodeKind::Errinfo
                        | NodeKind::BlockArg,
                    ) => return,
                    // unlisted sub-kind: treat all three slots as
                    // possible references
                    None => {
                        self.mark_maybe(node.u1.value);
                        self.mark_maybe(node.u2.value);
                        self.mark_maybe(node.u3.value);
                        return;
                    }
                }
                // nodes carry no class
            }

            self.mark(cell.klass());
            match cell.kind() {
                Some(Kind::IClass) | Some(Kind::Class) | Some(Kind::Module) => {
                    let ext = cell.klass.ext;
                    if ext.is_null() {
                        return;
                    }
                    for &(_, val) in (*ext).m_tbl.entries.iter() {
                        self.mark(val);
                    }
                    for &(_, val) in (*ext).iv_tbl.entries.iter() {
                        self.mark(val);
                    }
                    for &(_, val) in (*ext).const_tbl.entries.iter() {
                        self.mark(val);
                    }
                    v = (*ext).superclass;
                    continue;
                }

                Some(Kind::Array) => {
                    if cell.fl_test(ELTS_SHARED) {
                        v = cell.ary_shared();
                        continue;
                    }
                    for &e in cell.ary_elems() {
                        self.mark(e);
                    }
                    return;
                }

                Some(Kind::Hash) => {
                    let tbl = cell.hash.tbl;
                    if !tbl.is_null() {
                        for &(key, val) in (*tbl).entries.iter() {
                            self.mark(key);
                            self.mark(val);
                        }
                    }
                    v = cell.hash.ifnone;
                    continue;
                }

                Some(Kind::String) => {
                    if cell.str_shared_p() {
                        v = cell.str_shared();
                        continue;
                    }
                    return;
                }

                Some(Kind::Data) => {
                    if cell.typed_data_p() {
                        if let Some(typ) = cell.data_type() {
                            if let Some(dmark) = typ.dmark {
                                dmark(cell.typeddata.data, self);
                            }
                        }
                    } else if let Some(dmark) = cell.data.dmark {
                        dmark(cell.data.data, self);
                    }
                    return;
                }

                Some(Kind::Object) => {
                    for &iv in cell.obj_ivars() {
                        self.mark(iv);
                    }
                    return;
                }

                Some(Kind::File) => {
                    let fptr = cell.file.fptr;
                    if !fptr.is_null() {
                        self.mark((*fptr).pathv);
                        self.mark((*fptr).tied_io_for_writing);
                        self.mark((*fptr).writeconv_asciicompat);
                        self.mark((*fptr).writeconv_pre_ecopts);
                        self.mark((*fptr).ecopts);
                        self.mark((*fptr).write_lock);
                    }
                    return;
                }

                Some(Kind::Regexp) => {
                    v = cell.regexp.src;
                    continue;
                }

                Some(Kind::Float) | Some(Kind::Bignum) | Some(Kind::Zombie) => return,

                Some(Kind::Match) => {
                    self.mark(cell.match_.regexp);
                    if cell.match_.str.test() {
                        v = cell.match_.str;
                        continue;
                    }
                    return;
                }

                Some(Kind::Rational) => {
                    self.mark(cell.rational.num);
                    v = cell.rational.den;
                    continue;
                }

                Some(Kind::Complex) => {
                    self.mark(cell.complex.real);
                    v = cell.complex.imag;
                    continue;
                }

                Some(Kind::Struct) => {
                    for &member in cell.struct_members() {
                        self.mark(member);
                    }
                    return;
                }

                _ => {
                    bug!(
                        "mark_children(): unknown data type {:#x}({:p}) {}",
                        cell.kind_raw(),
                        v.as_cell(),
                        if self.heap.is_pointer_to_heap(v.0 as *const libc::c_void) {
                            "corrupted object"
                        } else {
                            "non object"
                        }
                    );
                }
            }
        }
    }
}
