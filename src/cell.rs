//! Managed cell layout.
//!
//! Every managed object occupies one fixed-size [`Cell`]: a tagged union
//! whose size is the largest of all kind payloads. The first word of
//! every variant is the `flags` word; `flags == 0` means the cell is
//! free and doubles as the freelist link variant. The low five bits of a
//! nonzero flags word are the kind tag.

use bit_field::BitField;
use libc::c_void;
use static_assertions::const_assert;
use std::mem::{offset_of, size_of};
use strum_macros::FromRepr;

use crate::objspace::ObjectSpace;
use crate::value::Value;

/// Kind tag mask in the flags word.
pub const KIND_MASK: usize = 0x1f;
/// Size of kind-indexed count tables.
pub const KIND_COUNT: usize = KIND_MASK + 1;

pub const FL_FINALIZE: usize = 1 << 7;
pub const FL_TAINT: usize = 1 << 8;
pub const FL_UNTRUSTED: usize = 1 << 9;
pub const FL_EXIVAR: usize = 1 << 10;
pub const FL_FREEZE: usize = 1 << 11;

pub const FL_USHIFT: usize = 12;
pub const FL_USER0: usize = 1 << 12;
pub const FL_USER1: usize = 1 << 13;
pub const FL_USER2: usize = 1 << 14;
pub const FL_USER3: usize = 1 << 15;

/// Doubles as the "freeing page" sentinel on deferred zombies.
pub const FL_SINGLETON: usize = FL_USER0;

/// Objects and arrays store small bodies inline when this is set;
/// strings invert the meaning (set = out-of-line body).
pub const FL_EMBED: usize = FL_USER1;
pub const STR_NOEMBED: usize = FL_USER1;
/// Array or string body is shared with another object.
pub const ELTS_SHARED: usize = FL_USER2;
/// String body is tied to an association (kept alive through `shared`).
pub const STR_ASSOC: usize = FL_USER3;

const ARY_EMBED_LEN_RANGE: std::ops::Range<usize> = 15..17;
const STRUCT_EMBED_LEN_RANGE: std::ops::Range<usize> = 13..15;

pub const OBJ_EMBED_LEN_MAX: usize = 3;
pub const ARY_EMBED_LEN_MAX: usize = 3;
pub const STR_EMBED_LEN_MAX: usize = 3 * size_of::<usize>() - 1;
pub const STRUCT_EMBED_LEN_MAX: usize = 3;

/// Node sub-kind sits above the user-flag area of the flags word.
pub const NODE_TYPESHIFT: usize = 16;
pub const NODE_TYPEMASK: usize = 0x7f;

/// Kind tags. The numeric values participate in flag arithmetic and in
/// the object-id validity check, so they are fixed, not compiler-chosen.
#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, FromRepr)]
pub enum Kind {
    None = 0x00,
    Object = 0x01,
    Class = 0x02,
    Module = 0x03,
    Float = 0x04,
    String = 0x05,
    Regexp = 0x06,
    Array = 0x07,
    Hash = 0x08,
    Struct = 0x09,
    Bignum = 0x0a,
    File = 0x0b,
    Data = 0x0c,
    Match = 0x0d,
    Complex = 0x0e,
    Rational = 0x0f,
    Nil = 0x11,
    True = 0x12,
    False = 0x13,
    Symbol = 0x14,
    Fixnum = 0x15,
    Undef = 0x1b,
    Node = 0x1c,
    IClass = 0x1d,
    Zombie = 0x1e,
}

/// Largest kind value that denotes an object-id-addressable cell.
pub const KIND_ID_MAX: usize = Kind::Fixnum as usize;

// ---------------------------------------------------------------------------
// per-kind payloads

#[repr(C)]
#[derive(Copy, Clone)]
pub struct FreeCell {
    pub flags: usize,
    pub next: *mut Cell,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct Basic {
    pub flags: usize,
    pub klass: Value,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct ObjHeap {
    pub niv: usize,
    pub ivptr: *mut Value,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union ObjectBody {
    pub heap: ObjHeap,
    pub ary: [Value; OBJ_EMBED_LEN_MAX],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RObject {
    pub basic: Basic,
    pub body: ObjectBody,
}

/// Out-of-line class state. Owned by the class cell, reclaimed by sweep.
pub struct ClassExt {
    pub m_tbl: ValueTable,
    pub iv_tbl: ValueTable,
    pub const_tbl: ValueTable,
    pub superclass: Value,
}

impl ClassExt {
    pub fn new(superclass: Value) -> ClassExt {
        ClassExt {
            m_tbl: ValueTable::new(),
            iv_tbl: ValueTable::new(),
            const_tbl: ValueTable::new(),
            superclass,
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RClass {
    pub basic: Basic,
    pub ext: *mut ClassExt,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RFloat {
    pub basic: Basic,
    pub value: f64,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union StrAux {
    pub capa: usize,
    pub shared: Value,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct StrHeap {
    pub len: usize,
    pub ptr: *mut u8,
    pub aux: StrAux,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union StringBody {
    pub heap: StrHeap,
    pub ary: [u8; STR_EMBED_LEN_MAX + 1],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RString {
    pub basic: Basic,
    pub body: StringBody,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union AryAux {
    pub capa: usize,
    pub shared: Value,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct AryHeap {
    pub len: usize,
    pub aux: AryAux,
    pub ptr: *mut Value,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union ArrayBody {
    pub heap: AryHeap,
    pub ary: [Value; ARY_EMBED_LEN_MAX],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RArray {
    pub basic: Basic,
    pub body: ArrayBody,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RRegexp {
    pub basic: Basic,
    /// Compiled pattern, owned by the host regexp engine; released with
    /// the tracked allocator.
    pub ptr: *mut c_void,
    pub src: Value,
    pub usecnt: usize,
}

/// Insertion-ordered table of value pairs, used for hash entries and for
/// the method/ivar/const tables hanging off class cells.
#[derive(Default)]
pub struct ValueTable {
    pub entries: Vec<(Value, Value)>,
}

impl ValueTable {
    pub fn new() -> ValueTable {
        ValueTable { entries: Vec::new() }
    }

    pub fn insert(&mut self, key: Value, value: Value) {
        self.entries.push((key, value));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Heap-allocate a table for embedding in a cell payload.
    pub fn boxed() -> *mut ValueTable {
        Box::into_raw(Box::new(ValueTable::new()))
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RHash {
    pub basic: Basic,
    pub tbl: *mut ValueTable,
    pub iter_lvl: usize,
    pub ifnone: Value,
}

/// Child-enumeration callback supplied by data payload owners. Receives
/// the payload and the object space so it can feed references back
/// through `mark` / `mark_maybe`.
pub type MarkFn = unsafe fn(*mut c_void, &mut ObjectSpace);
/// Payload release hook, run during sweep or deferred finalization.
pub type FreeFn = unsafe fn(*mut c_void);
/// Optional byte attribution for reporting.
pub type SizeFn = unsafe fn(*mut c_void) -> usize;

/// How a data payload is released.
#[repr(usize)]
#[derive(Copy, Clone)]
pub enum DataFree {
    /// The payload is not owned by this cell.
    Skip,
    /// Release through the tracked allocator during sweep.
    Dealloc,
    /// Run a custom hook; the cell becomes a zombie and the hook runs
    /// with the deferred finalizers, outside the collector.
    Call(FreeFn),
}

/// Typed-data vtable. Must be `'static`: sweep re-reads the free hook
/// from it after the object is already condemned.
pub struct DataType {
    pub wrap_struct_name: &'static str,
    pub dmark: Option<MarkFn>,
    pub dfree: DataFree,
    pub dsize: Option<SizeFn>,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RData {
    pub basic: Basic,
    /// 0 here; discriminates against `RTypedData` which overlays 1.
    pub typed_flag: usize,
    /// Same offset in both data layouts, so sweep can test it without
    /// knowing which one it is looking at.
    pub data: *mut c_void,
    pub dmark: Option<MarkFn>,
    pub dfree: DataFree,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RTypedData {
    pub basic: Basic,
    /// Always 1; see `RData::typed_flag`.
    pub typed_flag: usize,
    pub data: *mut c_void,
    pub typ: *const DataType,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct StructHeap {
    pub len: usize,
    pub ptr: *mut Value,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union StructBody {
    pub heap: StructHeap,
    pub ary: [Value; STRUCT_EMBED_LEN_MAX],
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RStruct {
    pub basic: Basic,
    pub body: StructBody,
}

pub type BDigit = u32;

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RBignum {
    pub basic: Basic,
    pub sign: usize,
    pub len: usize,
    pub digits: *mut BDigit,
}

/// Retained state of an open file, referenced from a file cell. The
/// value-typed fields are enumerated as children during marking.
pub struct OpenFile {
    pub fd: i32,
    pub pathv: Value,
    pub tied_io_for_writing: Value,
    pub writeconv_asciicompat: Value,
    pub writeconv_pre_ecopts: Value,
    pub ecopts: Value,
    pub write_lock: Value,
}

impl OpenFile {
    pub fn new(fd: i32) -> OpenFile {
        OpenFile {
            fd,
            pathv: crate::value::Q_NIL,
            tied_io_for_writing: crate::value::Q_NIL,
            writeconv_asciicompat: crate::value::Q_NIL,
            writeconv_pre_ecopts: crate::value::Q_NIL,
            ecopts: crate::value::Q_NIL,
            write_lock: crate::value::Q_NIL,
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RFile {
    pub basic: Basic,
    pub fptr: *mut OpenFile,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub union NodeSlot {
    pub value: Value,
    pub node: *mut Cell,
    pub cnt: usize,
    pub argv: *mut Value,
    pub tbl: *mut c_void,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RNode {
    pub flags: usize,
    pub reserved: usize,
    pub u1: NodeSlot,
    pub u2: NodeSlot,
    pub u3: NodeSlot,
}

impl RNode {
    #[inline(always)]
    pub fn nd_type_raw(&self) -> usize {
        (self.flags >> NODE_TYPESHIFT) & NODE_TYPEMASK
    }

    #[inline(always)]
    pub fn nd_type(&self) -> Option<NodeKind> {
        NodeKind::from_repr(self.nd_type_raw())
    }
}

/// AST node sub-kinds. The marker classifies these into slot groups; an
/// out-of-range tag falls back to conservative treatment of all three
/// slots.
#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, FromRepr)]
pub enum NodeKind {
    Block = 0,
    If,
    For,
    Iter,
    When,
    Masgn,
    Rescue,
    Resbody,
    Class,
    BlockPass,
    Optblock,
    Array,
    Dstr,
    Dxstr,
    Dregx,
    DregxOnce,
    Ensure,
    Call,
    Defs,
    OpAsgn1,
    Args,
    Super,
    Fcall,
    Defn,
    ArgsAux,
    While,
    Until,
    And,
    Or,
    Case,
    Sclass,
    Dot2,
    Dot3,
    Flip2,
    Flip3,
    Match2,
    Match3,
    OpAsgnOr,
    OpAsgnAnd,
    Module,
    Alias,
    Valias,
    Argscat,
    Gasgn,
    Lasgn,
    Dasgn,
    DasgnCurr,
    Iasgn,
    Iasgn2,
    Cvasgn,
    Colon3,
    OptN,
    Evstr,
    Undef,
    Postexe,
    Hash,
    Lit,
    Str,
    Xstr,
    Defined,
    Match,
    Return,
    Break,
    Next,
    Yield,
    Colon2,
    Splat,
    ToAry,
    Scope,
    Cdecl,
    OptArg,
    Zarray,
    Zsuper,
    Vcall,
    Gvar,
    Lvar,
    Dvar,
    Ivar,
    Cvar,
    NthRef,
    BackRef,
    Redo,
    Retry,
    SelfNode,
    NilNode,
    TrueNode,
    FalseNode,
    Errinfo,
    BlockArg,
    Alloca,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RMatch {
    pub basic: Basic,
    pub str: Value,
    /// Host match-region block, released with the tracked allocator.
    pub rmatch: *mut c_void,
    pub regexp: Value,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RRational {
    pub basic: Basic,
    pub num: Value,
    pub den: Value,
}

#[repr(C)]
#[derive(Copy, Clone)]
pub struct RComplex {
    pub basic: Basic,
    pub real: Value,
    pub imag: Value,
}

// ---------------------------------------------------------------------------
// the cell itself

#[repr(C)]
#[derive(Copy, Clone)]
pub union Cell {
    pub free: FreeCell,
    pub basic: Basic,
    pub object: RObject,
    pub klass: RClass,
    pub flonum: RFloat,
    pub string: RString,
    pub array: RArray,
    pub regexp: RRegexp,
    pub hash: RHash,
    pub data: RData,
    pub typeddata: RTypedData,
    pub rstruct: RStruct,
    pub bignum: RBignum,
    pub file: RFile,
    pub node: RNode,
    pub match_: RMatch,
    pub rational: RRational,
    pub complex: RComplex,
}

// The typed_flag discriminator only works if both data layouts agree on
// its position, and every variant must lead with the flags word.
const_assert!(offset_of!(RData, typed_flag) == offset_of!(RTypedData, typed_flag));
const_assert!(offset_of!(RData, data) == offset_of!(RTypedData, data));
const_assert!(offset_of!(FreeCell, flags) == 0);
const_assert!(offset_of!(Basic, flags) == 0);
const_assert!(offset_of!(RNode, flags) == 0);
const_assert!(size_of::<Cell>() % size_of::<usize>() == 0);

impl Cell {
    /// Every variant leads with the flags word, so reading it through
    /// the free variant is always defined.
    #[inline(always)]
    pub fn flags(&self) -> usize {
        unsafe { self.free.flags }
    }

    #[inline(always)]
    pub fn set_flags(&mut self, flags: usize) {
        self.free.flags = flags;
    }

    #[inline(always)]
    pub fn free_p(&self) -> bool {
        self.flags() == 0
    }

    #[inline(always)]
    pub fn kind_raw(&self) -> usize {
        self.flags() & KIND_MASK
    }

    #[inline(always)]
    pub fn kind(&self) -> Option<Kind> {
        Kind::from_repr(self.kind_raw())
    }

    #[inline(always)]
    pub fn kind_p(&self, kind: Kind) -> bool {
        self.kind_raw() == kind as usize
    }

    #[inline(always)]
    pub fn fl_test(&self, mask: usize) -> bool {
        self.flags() & mask != 0
    }

    #[inline(always)]
    pub fn fl_set(&mut self, mask: usize) {
        let flags = self.flags();
        self.set_flags(flags | mask);
    }

    #[inline(always)]
    pub fn fl_unset(&mut self, mask: usize) {
        let flags = self.flags();
        self.set_flags(flags & !mask);
    }

    /// Initialize the cell header for a freshly allocated object.
    #[inline(always)]
    pub fn setup(&mut self, kind: Kind, klass: Value) {
        self.basic = Basic {
            flags: kind as usize,
            klass,
        };
    }

    #[inline(always)]
    pub fn klass(&self) -> Value {
        unsafe { self.basic.klass }
    }

    #[inline(always)]
    pub fn free_next(&self) -> *mut Cell {
        debug_assert!(self.free_p());
        unsafe { self.free.next }
    }

    /// Thread the cell onto a freelist: zero flags, link `next`.
    #[inline(always)]
    pub fn make_free(&mut self, next: *mut Cell) {
        self.free = FreeCell { flags: 0, next };
    }

    /// Rewrite the kind tag in place, keeping the other flag bits.
    #[inline(always)]
    pub fn retag(&mut self, kind: Kind) {
        let flags = self.flags();
        self.set_flags((flags & !KIND_MASK) | kind as usize);
    }

    // -- object ------------------------------------------------------------

    pub fn obj_ivars(&self) -> &[Value] {
        unsafe {
            if self.fl_test(FL_EMBED) {
                &self.object.body.ary
            } else {
                let h = &self.object.body.heap;
                if h.ivptr.is_null() {
                    &[]
                } else {
                    std::slice::from_raw_parts(h.ivptr, h.niv)
                }
            }
        }
    }

    // -- array -------------------------------------------------------------

    #[inline(always)]
    pub fn ary_embed_p(&self) -> bool {
        self.fl_test(FL_EMBED)
    }

    pub fn ary_embed_len(&self) -> usize {
        self.flags().get_bits(ARY_EMBED_LEN_RANGE)
    }

    pub fn ary_set_embed_len(&mut self, len: usize) {
        debug_assert!(len <= ARY_EMBED_LEN_MAX);
        let mut flags = self.flags();
        flags.set_bits(ARY_EMBED_LEN_RANGE, len);
        self.set_flags(flags);
    }

    pub fn ary_elems(&self) -> &[Value] {
        unsafe {
            if self.ary_embed_p() {
                &self.array.body.ary[..self.ary_embed_len()]
            } else {
                let h = &self.array.body.heap;
                if h.ptr.is_null() {
                    &[]
                } else {
                    std::slice::from_raw_parts(h.ptr, h.len)
                }
            }
        }
    }

    #[inline(always)]
    pub fn ary_shared(&self) -> Value {
        debug_assert!(self.fl_test(ELTS_SHARED));
        unsafe { self.array.body.heap.aux.shared }
    }

    // -- string ------------------------------------------------------------

    #[inline(always)]
    pub fn str_shared_p(&self) -> bool {
        self.fl_test(STR_NOEMBED) && self.fl_test(ELTS_SHARED | STR_ASSOC)
    }

    #[inline(always)]
    pub fn str_shared(&self) -> Value {
        debug_assert!(self.str_shared_p());
        unsafe { self.string.body.heap.aux.shared }
    }

    // -- struct ------------------------------------------------------------

    pub fn struct_embed_len(&self) -> usize {
        self.flags().get_bits(STRUCT_EMBED_LEN_RANGE)
    }

    pub fn struct_set_embed_len(&mut self, len: usize) {
        debug_assert!(len <= STRUCT_EMBED_LEN_MAX);
        let mut flags = self.flags();
        flags.set_bits(STRUCT_EMBED_LEN_RANGE, len);
        self.set_flags(flags);
    }

    pub fn struct_members(&self) -> &[Value] {
        unsafe {
            let embed = self.struct_embed_len();
            if embed != 0 {
                &self.rstruct.body.ary[..embed]
            } else {
                let h = &self.rstruct.body.heap;
                if h.ptr.is_null() {
                    &[]
                } else {
                    std::slice::from_raw_parts(h.ptr, h.len)
                }
            }
        }
    }

    // -- data --------------------------------------------------------------

    #[inline(always)]
    pub fn typed_data_p(&self) -> bool {
        debug_assert!(self.kind_p(Kind::Data) || self.kind_p(Kind::Zombie));
        unsafe { self.data.typed_flag == 1 }
    }

    pub fn data_type(&self) -> Option<&'static DataType> {
        if self.typed_data_p() {
            unsafe { self.typeddata.typ.as_ref() }
        } else {
            None
        }
    }

    /// Bytes attributed to a typed-data payload, when the vtable reports.
    pub fn data_memsize(&self) -> usize {
        match self.data_type() {
            Some(typ) => match typ.dsize {
                Some(dsize) => unsafe { dsize(self.typeddata.data) },
                None => 0,
            },
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{Q_NIL, Value};

    fn zeroed_cell() -> Cell {
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn zeroed_cell_is_free() {
        let cell = zeroed_cell();
        assert!(cell.free_p());
        assert_eq!(cell.kind_raw(), Kind::None as usize);
    }

    #[test]
    fn setup_tags_kind_and_class() {
        let mut cell = zeroed_cell();
        cell.setup(Kind::Object, Q_NIL);
        assert!(!cell.free_p());
        assert_eq!(cell.kind(), Some(Kind::Object));
        assert_eq!(cell.klass(), Q_NIL);
    }

    #[test]
    fn flag_set_and_unset() {
        let mut cell = zeroed_cell();
        cell.setup(Kind::String, Q_NIL);
        cell.fl_set(FL_FINALIZE);
        assert!(cell.fl_test(FL_FINALIZE));
        cell.fl_unset(FL_FINALIZE);
        assert!(!cell.fl_test(FL_FINALIZE));
        assert_eq!(cell.kind(), Some(Kind::String));
    }

    #[test]
    fn retag_preserves_flag_bits() {
        let mut cell = zeroed_cell();
        cell.setup(Kind::Data, Q_NIL);
        cell.fl_set(FL_FINALIZE | FL_EXIVAR);
        cell.retag(Kind::Zombie);
        assert_eq!(cell.kind(), Some(Kind::Zombie));
        assert!(cell.fl_test(FL_FINALIZE));
        assert!(cell.fl_test(FL_EXIVAR));
    }

    #[test]
    fn freelist_link_round_trip() {
        let mut a = zeroed_cell();
        let mut b = zeroed_cell();
        let bp = &mut b as *mut Cell;
        a.make_free(bp);
        assert!(a.free_p());
        assert_eq!(a.free_next(), bp);
    }

    #[test]
    fn embedded_array_len_bits() {
        let mut cell = zeroed_cell();
        cell.setup(Kind::Array, Q_NIL);
        cell.fl_set(FL_EMBED);
        cell.ary_set_embed_len(2);
        unsafe {
            cell.array.body.ary = [Value::fixnum(1), Value::fixnum(2), Q_NIL];
        }
        assert_eq!(cell.ary_embed_len(), 2);
        assert_eq!(cell.ary_elems(), &[Value::fixnum(1), Value::fixnum(2)]);
        assert_eq!(cell.kind(), Some(Kind::Array));
    }

    #[test]
    fn struct_embed_len_bits() {
        let mut cell = zeroed_cell();
        cell.setup(Kind::Struct, Q_NIL);
        cell.struct_set_embed_len(3);
        assert_eq!(cell.struct_embed_len(), 3);
        assert_eq!(cell.kind(), Some(Kind::Struct));
    }

    #[test]
    fn node_type_bits() {
        let mut cell = zeroed_cell();
        cell.node = RNode {
            flags: Kind::Node as usize | ((NodeKind::Scope as usize) << NODE_TYPESHIFT),
            reserved: 0,
            u1: NodeSlot { cnt: 0 },
            u2: NodeSlot { cnt: 0 },
            u3: NodeSlot { cnt: 0 },
        };
        assert_eq!(cell.kind(), Some(Kind::Node));
        unsafe {
            assert_eq!(cell.node.nd_type(), Some(NodeKind::Scope));
        }
    }

    #[test]
    fn typed_flag_discriminates_data_layouts() {
        let mut plain = zeroed_cell();
        plain.data = RData {
            basic: Basic {
                flags: Kind::Data as usize,
                klass: Q_NIL,
            },
            typed_flag: 0,
            dmark: None,
            dfree: DataFree::Skip,
            data: std::ptr::null_mut(),
        };
        assert!(!plain.typed_data_p());

        static TYPE: DataType = DataType {
            wrap_struct_name: "probe",
            dmark: None,
            dfree: DataFree::Skip,
            dsize: None,
        };
        let mut typed = zeroed_cell();
        typed.typeddata = RTypedData {
            basic: Basic {
                flags: Kind::Data as usize,
                klass: Q_NIL,
            },
            typed_flag: 1,
            typ: &TYPE,
            data: std::ptr::null_mut(),
        };
        assert!(typed.typed_data_p());
        assert_eq!(typed.data_type().unwrap().wrap_struct_name, "probe");
    }

    #[test]
    fn kind_from_repr_rejects_holes() {
        assert_eq!(Kind::from_repr(0x10), None);
        assert_eq!(Kind::from_repr(0x1f), None);
        assert_eq!(Kind::from_repr(Kind::Zombie as usize), Some(Kind::Zombie));
    }
}
