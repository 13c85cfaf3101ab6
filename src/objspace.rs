//! The object space.
//!
//! One `ObjectSpace` owns every managed cell of a runtime instance: the
//! heap pages, the mark stack, the pressure counters, the finalizer
//! machinery and the collection policy. The host runtime owns the value
//! and passes it explicitly to every entry point; cross-thread callers
//! must hold the host's global lock before touching it.

use std::collections::HashMap;
use std::io::Write;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr};

use log::debug;

use crate::cell::{
    Cell, DataFree, DataType, Kind, MarkFn, NodeSlot, RNode, KIND_COUNT, NODE_TYPESHIFT,
};
use crate::config::{GcConfig, LogTarget};
use crate::error::{bug, Error};
use crate::mark_stack::MarkStack;
use crate::pages::{Heap, CELLS_PER_PAGE};
use crate::profile::Profiler;
use crate::util::{elapsed_musecs, rusage_time};
use crate::value::Value;

/// Tracked-allocator counters: the malloc pressure signal.
pub struct MallocParams {
    pub limit: usize,
    pub increase: usize,
    #[cfg(feature = "exact_malloc_size")]
    pub allocated_size: usize,
    #[cfg(feature = "exact_malloc_size")]
    pub allocations: usize,
}

/// Per-cycle and lifetime statistics, maintained when statistics
/// collection is enabled and reported to the GC data file when verbose.
#[derive(Default)]
pub struct GcStatistics {
    pub enabled: bool,
    pub verbose: bool,
    pub processed: usize,
    pub freed_objects: usize,
    pub zombies: usize,
    pub free_counts: [usize; KIND_COUNT],
    pub live_counts: [usize; KIND_COUNT],
    pub live_after_last_mark_phase: usize,
    /// Microseconds of user time spent collecting.
    pub gc_time_accumulator: u64,
    pub gc_time_accumulator_before_gc: u64,
    pub gc_collections: usize,
    pub gc_allocated_size: u64,
    pub gc_num_allocations: u64,
}

/// Counter snapshot returned by [`ObjectSpace::stat`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcStat {
    pub count: usize,
    pub heap_used: usize,
    pub heap_length: usize,
    pub heap_increment: usize,
    pub heap_live_num: usize,
    pub heap_free_num: usize,
    pub heap_final_num: usize,
}

/// Per-kind census returned by [`ObjectSpace::count_objects`].
#[derive(Clone, Debug, Default)]
pub struct ObjectCensus {
    pub total: usize,
    pub free: usize,
    pub counts: [usize; KIND_COUNT],
}

/// Auxiliary root source registered by the host (interned-symbol
/// tables, encoding tables, global variable tables, and the like).
pub type RootHook = Box<dyn Fn(&mut ObjectSpace)>;

/// A user finalizer callable. Runs outside the collector with the
/// object id of the reclaimed object; failures are dropped.
pub type FinalizerFn = Box<dyn FnMut(&mut ObjectSpace, Value) -> Result<(), Error>>;

pub struct FinalizerEntry {
    /// Host safe level captured at registration.
    pub safe_level: u32,
    /// Heap values the callable keeps alive (marked with the table).
    pub pins: Vec<Value>,
    pub func: FinalizerFn,
}

/// Finalizer lists are shared, not cloned, when a finalizer is copied
/// to another object.
pub type FinalizerList = std::rc::Rc<std::cell::RefCell<Vec<FinalizerEntry>>>;

pub struct ObjectSpace {
    pub(crate) malloc_params: MallocParams,
    pub(crate) heap: Heap,
    pub(crate) config: GcConfig,

    pub(crate) dont_gc: bool,
    pub(crate) dont_lazy_sweep: bool,
    pub(crate) during_gc: bool,
    pub(crate) gc_stress: bool,
    pub(crate) finalizing: AtomicBool,

    pub(crate) finalizer_table: HashMap<usize, FinalizerList>,
    pub(crate) deferred_final_list: AtomicPtr<Cell>,

    pub(crate) mark_stack: MarkStack,
    pub(crate) global_list: Vec<*const Value>,
    pub(crate) mark_object_ary: Vec<Value>,
    pub(crate) vm_hook: Option<RootHook>,
    pub(crate) root_hooks: Vec<RootHook>,
    pub(crate) generic_ivar_mark: Option<fn(&mut ObjectSpace, Value)>,
    pub(crate) generic_ivar_free: Option<fn(&mut ObjectSpace, Value)>,
    /// Cells exempted from the at-exit data/file free pass (the host's
    /// threads, mutexes, fibers).
    pub(crate) at_exit_skip: Option<fn(&ObjectSpace, Value) -> bool>,

    /// Hot end of the machine stack, registered by the host thread.
    pub(crate) stack_base: *const libc::c_void,

    /// Completed collection cycles.
    pub(crate) count: usize,
    pub(crate) stats: GcStatistics,
    pub(crate) live_objects: u64,
    pub(crate) allocated_objects: u64,

    pub(crate) data_file: LogTarget,
    pub(crate) profiler: Profiler,
}

impl ObjectSpace {
    /// Build an object space and materialize the configured minimum
    /// heap. The caller should follow up with `set_stack_base` from the
    /// host thread's outermost frame.
    pub fn new(config: GcConfig) -> Result<Box<ObjectSpace>, Error> {
        let data_file = LogTarget::from_config(&config);
        let mut os = Box::new(ObjectSpace {
            malloc_params: MallocParams {
                limit: config.initial_malloc_limit,
                increase: 0,
                #[cfg(feature = "exact_malloc_size")]
                allocated_size: 0,
                #[cfg(feature = "exact_malloc_size")]
                allocations: 0,
            },
            heap: Heap::new(),
            dont_gc: false,
            dont_lazy_sweep: false,
            during_gc: false,
            gc_stress: false,
            finalizing: AtomicBool::new(false),
            finalizer_table: HashMap::new(),
            deferred_final_list: AtomicPtr::new(ptr::null_mut()),
            mark_stack: MarkStack::new(),
            global_list: Vec::new(),
            mark_object_ary: Vec::new(),
            vm_hook: None,
            root_hooks: Vec::new(),
            generic_ivar_mark: None,
            generic_ivar_free: None,
            at_exit_skip: None,
            stack_base: ptr::null(),
            count: 0,
            stats: GcStatistics {
                verbose: config.verbose_gc_stats,
                ..GcStatistics::default()
            },
            live_objects: 0,
            allocated_objects: 0,
            data_file,
            profiler: Profiler::new(),
            config,
        });
        os.init_heap()?;
        Ok(os)
    }

    /// `new` with parameters read (and cleared) from the environment.
    pub fn from_env() -> Result<Box<ObjectSpace>, Error> {
        ObjectSpace::new(GcConfig::from_env())
    }

    fn init_heap(&mut self) -> Result<(), Error> {
        let pages = (self.config.initial_heap_min_slots / CELLS_PER_PAGE).max(1);
        self.add_pages(pages)?;
        self.profiler.invoke_time = rusage_time();
        Ok(())
    }

    pub(crate) fn add_pages(&mut self, add: usize) -> Result<(), Error> {
        self.heap.reserve_sorted(self.heap.used() + add);
        for _ in 0..add {
            if let Err(err) = self.heap.assign_page() {
                self.during_gc = false;
                return Err(err);
            }
        }
        self.heap.increment = 0;
        Ok(())
    }

    /// Register the cold end of the host thread's machine stack; the
    /// conservative scan covers the words between here and the live
    /// stack pointer at mark time.
    pub fn set_stack_base<T>(&mut self, addr: *const T) {
        self.stack_base = addr as *const libc::c_void;
    }

    pub fn set_vm_root_marker(&mut self, hook: RootHook) {
        self.vm_hook = Some(hook);
    }

    pub fn add_root_hook(&mut self, hook: RootHook) {
        self.root_hooks.push(hook);
    }

    pub fn set_generic_ivar_hooks(
        &mut self,
        mark: fn(&mut ObjectSpace, Value),
        free: fn(&mut ObjectSpace, Value),
    ) {
        self.generic_ivar_mark = Some(mark);
        self.generic_ivar_free = Some(free);
    }

    pub fn set_at_exit_skip(&mut self, skip: fn(&ObjectSpace, Value) -> bool) {
        self.at_exit_skip = Some(skip);
    }

    // -- allocation fast path ----------------------------------------------

    #[inline(always)]
    pub(crate) fn has_free_object(&self) -> bool {
        self.heap.has_free_cell()
    }

    /// Hand out one zeroed cell. The caller must fill in the kind tag
    /// and payload before the next allocation can trigger a collection.
    pub fn new_cell(&mut self) -> Result<*mut Cell, Error> {
        if self.during_gc {
            self.dont_gc = true;
            bug!("object allocation during garbage collection phase");
        }

        if self.gc_stress {
            if !self.garbage_collect() {
                self.during_gc = false;
                return Err(Error::OutOfMemory);
            }
        }

        if !self.has_free_object() {
            // sweep toward a free cell; if the collector could not run
            // (disabled, or growth failed) there may still be none
            if !self.gc_lazy_sweep() || !self.has_free_object() {
                self.during_gc = false;
                return Err(Error::OutOfMemory);
            }
        }

        let free_page = self.heap.free_pages;
        let obj = unsafe {
            let obj = (*free_page).freelist;
            (*free_page).freelist = (*obj).free_next();
            if (*free_page).freelist.is_null() {
                self.heap.unlink_free_page(free_page);
            }
            ptr::write_bytes(obj, 0, 1);
            obj
        };
        self.live_objects += 1;
        self.allocated_objects += 1;
        self.heap.live_num += 1;
        Ok(obj)
    }

    /// Allocate an AST node cell with the sub-kind tag and three slots.
    pub fn new_node(
        &mut self,
        node_kind: usize,
        u1: NodeSlot,
        u2: NodeSlot,
        u3: NodeSlot,
    ) -> Result<*mut Cell, Error> {
        let n = self.new_cell()?;
        unsafe {
            (*n).node = RNode {
                flags: Kind::Node as usize | (node_kind << NODE_TYPESHIFT),
                reserved: 0,
                u1,
                u2,
                u3,
            };
        }
        Ok(n)
    }

    /// Wrap an opaque payload with explicit mark and free hooks.
    pub fn new_data(
        &mut self,
        klass: Value,
        data: *mut libc::c_void,
        dmark: Option<MarkFn>,
        dfree: DataFree,
    ) -> Result<Value, Error> {
        let cell = self.new_cell()?;
        unsafe {
            (*cell).setup(Kind::Data, klass);
            (*cell).data.typed_flag = 0;
            (*cell).data.dmark = dmark;
            (*cell).data.dfree = dfree;
            (*cell).data.data = data;
        }
        Ok(Value::of_cell(cell))
    }

    /// Wrap an opaque payload through a static vtable.
    pub fn new_typed_data(
        &mut self,
        klass: Value,
        data: *mut libc::c_void,
        typ: &'static DataType,
    ) -> Result<Value, Error> {
        let cell = self.new_cell()?;
        unsafe {
            (*cell).setup(Kind::Data, klass);
            (*cell).typeddata.typed_flag = 1;
            (*cell).typeddata.typ = typ;
            (*cell).typeddata.data = data;
        }
        Ok(Value::of_cell(cell))
    }

    // -- pinned roots ------------------------------------------------------

    /// Keep whatever `addr` points at alive across collections, until
    /// unregistered. Registering one address twice requires two
    /// unregistrations.
    pub fn register_root(&mut self, addr: *const Value) {
        self.global_list.push(addr);
    }

    /// First-match removal, mirroring registration stacking.
    pub fn unregister_root(&mut self, addr: *const Value) {
        if let Some(pos) = self.global_list.iter().position(|&a| a == addr) {
            self.global_list.remove(pos);
        }
    }

    /// Pin a value itself (interned-symbol style: no address escapes).
    pub fn register_mark_object(&mut self, obj: Value) {
        self.mark_object_ary.push(obj);
    }

    // -- control surface ---------------------------------------------------

    /// Allow collection again. Returns true if it was disabled.
    pub fn enable(&mut self) -> bool {
        let old = self.dont_gc;
        self.dont_gc = false;
        old
    }

    /// Suppress collection (the slow path grows the heap instead).
    /// Returns true if it was already disabled.
    pub fn disable(&mut self) -> bool {
        let old = self.dont_gc;
        self.dont_gc = true;
        old
    }

    pub fn stress(&self) -> bool {
        self.gc_stress
    }

    /// Collect on every allocation opportunity. Debugging aid.
    pub fn set_stress(&mut self, stress: bool) {
        self.gc_stress = stress;
    }

    /// Completed collection cycles since startup.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Force a full collection, then drain finalizers and return empty
    /// pages to the OS.
    pub fn start(&mut self) {
        self.garbage_collect();
        if !self.finalizing.load(std::sync::atomic::Ordering::SeqCst) {
            self.finalize_deferred_drain();
        }
        self.heap.free_unused_pages();
    }

    /// Counter snapshot. Completes any sweep in progress first so the
    /// numbers are not mid-cycle.
    pub fn stat(&mut self) -> GcStat {
        self.rest_sweep();
        GcStat {
            count: self.count,
            heap_used: self.heap.used(),
            heap_length: self.heap.length,
            heap_increment: self.heap.increment,
            heap_live_num: self.heap.live_num,
            heap_free_num: self.heap.free_num,
            heap_final_num: self.heap.final_num,
        }
    }

    /// Total cell capacity of the heap.
    pub fn heap_slots(&self) -> usize {
        self.heap.heap_size
    }

    /// Cells available for allocation without growing.
    pub fn free_count(&self) -> usize {
        self.heap.heap_size.saturating_sub(self.heap.live_num)
    }

    /// Cells that survived the most recent mark phase.
    pub fn live_after_last_mark_phase(&self) -> usize {
        self.stats.live_after_last_mark_phase
    }

    pub fn live_objects(&self) -> u64 {
        self.live_objects
    }

    pub fn allocated_objects(&self) -> u64 {
        self.allocated_objects
    }

    pub fn during_gc(&self) -> bool {
        self.during_gc
    }

    /// Conservative membership test, exposed for the host.
    pub fn is_pointer_to_heap(&self, p: *const libc::c_void) -> bool {
        self.heap.is_pointer_to_heap(p)
    }

    pub fn malloc_growth(&self) -> usize {
        self.malloc_params.increase
    }

    pub fn malloc_limit(&self) -> usize {
        self.malloc_params.limit
    }

    pub fn profiler(&mut self) -> &mut Profiler {
        &mut self.profiler
    }

    // -- statistics switches -----------------------------------------------

    pub fn enable_stats(&mut self) -> bool {
        let old = self.stats.enabled;
        self.stats.enabled = true;
        old
    }

    pub fn disable_stats(&mut self) -> bool {
        let old = self.stats.enabled;
        self.stats.enabled = false;
        old
    }

    pub fn clear_stats(&mut self) {
        self.stats.gc_collections = 0;
        self.stats.gc_time_accumulator = 0;
        self.stats.gc_time_accumulator_before_gc = 0;
        self.stats.gc_allocated_size = 0;
        self.stats.gc_num_allocations = 0;
    }

    pub fn enable_trace(&mut self) -> bool {
        let old = self.stats.verbose;
        self.stats.verbose = true;
        old
    }

    pub fn disable_trace(&mut self) -> bool {
        let old = self.stats.verbose;
        self.stats.verbose = false;
        old
    }

    pub fn allocated_size(&self) -> u64 {
        self.stats.gc_allocated_size
    }

    pub fn num_allocations(&self) -> u64 {
        self.stats.gc_num_allocations
    }

    /// Collection time accumulated while statistics were enabled, in
    /// microseconds.
    pub fn gc_time(&self) -> u64 {
        self.stats.gc_time_accumulator
    }

    pub fn collections(&self) -> usize {
        self.stats.gc_collections
    }

    // -- data file ---------------------------------------------------------

    /// Append a free-form line to the GC data file.
    pub fn log(&mut self, msg: &str) {
        let _ = writeln!(self.data_file, "{}", msg);
    }

    /// Switch the data file; `None` reverts to standard error. Returns
    /// false if the file could not be opened (the old target stays).
    pub fn log_file(&mut self, path: Option<std::path::PathBuf>) -> bool {
        match path {
            None => {
                self.data_file = LogTarget::Stderr;
                true
            }
            Some(path) => match std::fs::File::create(&path) {
                Ok(f) => {
                    self.data_file = LogTarget::File(f);
                    true
                }
                Err(_) => false,
            },
        }
    }

    /// Flush buffered log output; call before forking so the child does
    /// not replay it.
    pub fn before_fork(&mut self) {
        let _ = self.data_file.flush();
    }

    /// Reset logging and statistics in a forked child.
    pub fn after_fork(&mut self) {
        self.disable_stats();
        self.clear_stats();
        self.disable_trace();
        self.data_file = LogTarget::Stderr;
    }

    /// Write one line per page to the data file.
    pub fn dump(&mut self) {
        for (i, &header) in self.heap.sorted.iter().enumerate() {
            let limit = unsafe { (*header).limit };
            let _ = writeln!(self.data_file, "HEAP[{:2}]: size={:7}", i, limit);
        }
    }

    /// Per-kind census of every cell slot in the heap.
    pub fn count_objects(&mut self) -> ObjectCensus {
        let mut census = ObjectCensus::default();
        for &header in &self.heap.sorted {
            unsafe {
                let mut p = (*header).start;
                while p < (*header).end {
                    if (*p).flags() != 0 {
                        census.counts[(*p).kind_raw()] += 1;
                    } else {
                        census.free += 1;
                    }
                    p = p.add(1);
                }
                census.total += (*header).limit;
            }
        }
        census
    }

    /// Walk every live cell. Lazy sweeping is completed first and kept
    /// off for the duration so the callback never sees a dead cell.
    pub fn each_object<F: FnMut(&mut ObjectSpace, *mut Cell)>(&mut self, mut f: F) {
        self.rest_sweep();
        self.dont_lazy_sweep = true;
        let headers = self.heap.sorted.clone();
        for header in headers {
            unsafe {
                let mut p = (*header).start;
                while p < (*header).end {
                    if (*p).flags() != 0 {
                        f(self, p);
                    }
                    p = p.add(1);
                }
            }
        }
        self.dont_lazy_sweep = false;
    }

    // -- growth policy -----------------------------------------------------

    pub(crate) fn set_heaps_increment(&mut self) {
        let used = self.heap.used();
        let next = (used as f64 * self.config.heap_slots_growth_factor) as usize;
        let next = next.max(used + self.config.heap_pages_increment);
        self.heap.increment = next - used;
        self.heap.reserve_sorted(next);
    }

    pub(crate) fn heaps_increment(&mut self) -> bool {
        if self.heap.increment > 0 {
            match self.heap.assign_page() {
                Ok(()) => {
                    self.heap.increment -= 1;
                    true
                }
                Err(_) => {
                    self.during_gc = false;
                    false
                }
            }
        } else {
            false
        }
    }

    pub(crate) fn ready_to_gc(&mut self) -> bool {
        if self.dont_gc || self.during_gc {
            if !self.has_free_object() {
                if !self.heaps_increment() {
                    self.set_heaps_increment();
                    self.heaps_increment();
                }
            }
            return false;
        }
        true
    }

    // -- collection driver -------------------------------------------------

    /// Full stop-the-world mark followed by a complete sweep. Returns
    /// false only when the heap has not been initialized.
    pub(crate) fn garbage_collect(&mut self) -> bool {
        if self.heap.sorted.is_empty() {
            return false;
        }
        if !self.ready_to_gc() {
            return true;
        }

        debug!("garbage_collect: cycle {}", self.count + 1);
        let prof = self.prof_timer_start();

        self.rest_sweep();

        let mark_clock = if self.stats.enabled {
            self.stats.gc_time_accumulator_before_gc = self.stats.gc_time_accumulator;
            self.stats.gc_collections += 1;
            rusage_time()
        } else {
            0.0
        };

        self.during_gc = true;
        self.gc_marks();

        if self.stats.enabled {
            self.stats.gc_time_accumulator += elapsed_musecs(mark_clock);
        }

        self.gc_sweep();
        self.prof_timer_stop(prof, true);
        true
    }

    /// Collect when the pressure counters demand it; otherwise no-op.
    /// Used by the tracked allocator.
    pub(crate) fn rescue_gc(&mut self) -> bool {
        if self.dont_gc {
            return true;
        }
        self.garbage_collect()
    }

    // -- tracked general allocator ------------------------------------------

    fn malloc_prepare(&mut self, size: usize) -> Result<usize, Error> {
        if (size as isize) < 0 {
            return Err(Error::NegativeAllocation("allocation size"));
        }
        #[allow(unused_mut)]
        let mut size = if size == 0 { 1 } else { size };
        #[cfg(feature = "exact_malloc_size")]
        {
            size += std::mem::size_of::<usize>();
        }

        // count the request up front: a collection triggered here sees
        // the pressure that caused it, and resets the counter
        self.malloc_params.increase += size;
        if self.gc_stress || self.malloc_params.increase > self.malloc_params.limit {
            self.rescue_gc();
        }
        Ok(size)
    }

    fn malloc_fixup(&mut self, mem: *mut u8, size: usize) -> *mut u8 {
        #[allow(unused_mut)]
        let mut mem = mem;
        #[cfg(feature = "exact_malloc_size")]
        {
            self.malloc_params.allocated_size += size;
            self.malloc_params.allocations += 1;
            unsafe {
                *(mem as *mut usize) = size;
                mem = mem.add(std::mem::size_of::<usize>());
            }
        }
        if self.stats.enabled {
            self.stats.gc_allocated_size += size as u64;
            self.stats.gc_num_allocations += 1;
        }
        mem
    }

    /// General allocation with pressure accounting. On failure, one
    /// rescue collection and a retry before giving up.
    pub fn xmalloc(&mut self, size: usize) -> Result<*mut u8, Error> {
        let size = self.malloc_prepare(size)?;
        let mut mem = unsafe { libc::malloc(size) } as *mut u8;
        if mem.is_null() {
            if self.rescue_gc() {
                mem = unsafe { libc::malloc(size) } as *mut u8;
            }
            if mem.is_null() {
                return Err(Error::OutOfMemory);
            }
        }
        Ok(self.malloc_fixup(mem, size))
    }

    /// `n * size` with overflow checking.
    pub fn xmalloc2(&mut self, n: usize, size: usize) -> Result<*mut u8, Error> {
        let len = n
            .checked_mul(size)
            .ok_or(Error::SizeOverflow("malloc"))?;
        self.xmalloc(len)
    }

    /// Zeroed counted allocation.
    pub fn xcalloc(&mut self, count: usize, elsize: usize) -> Result<*mut u8, Error> {
        let size = count
            .checked_mul(elsize)
            .ok_or(Error::SizeOverflow("calloc"))?;
        let size = self.malloc_prepare(size)?;
        let mut mem = unsafe { libc::calloc(1, size) } as *mut u8;
        if mem.is_null() {
            if self.rescue_gc() {
                mem = unsafe { libc::calloc(1, size) } as *mut u8;
            }
            if mem.is_null() {
                return Err(Error::OutOfMemory);
            }
        }
        Ok(self.malloc_fixup(mem, size))
    }

    pub fn xrealloc(&mut self, ptr_: *mut u8, size: usize) -> Result<*mut u8, Error> {
        if (size as isize) < 0 {
            return Err(Error::NegativeAllocation("re-allocation size"));
        }
        if ptr_.is_null() {
            return self.xmalloc(size);
        }
        if size == 0 {
            self.xfree(ptr_);
            return Ok(ptr::null_mut());
        }
        if self.gc_stress {
            self.rescue_gc();
        }

        #[allow(unused_mut)]
        let mut size = size;
        #[allow(unused_mut)]
        let mut ptr_ = ptr_;
        #[cfg(feature = "exact_malloc_size")]
        {
            size += std::mem::size_of::<usize>();
            unsafe {
                ptr_ = ptr_.sub(std::mem::size_of::<usize>());
                self.malloc_params.allocated_size -= *(ptr_ as *mut usize);
            }
        }

        let mut mem = unsafe { libc::realloc(ptr_ as *mut libc::c_void, size) } as *mut u8;
        if mem.is_null() {
            if self.rescue_gc() {
                mem = unsafe { libc::realloc(ptr_ as *mut libc::c_void, size) } as *mut u8;
            }
            if mem.is_null() {
                return Err(Error::OutOfMemory);
            }
        }
        self.malloc_params.increase += size;

        #[cfg(feature = "exact_malloc_size")]
        {
            self.malloc_params.allocated_size += size;
            unsafe {
                *(mem as *mut usize) = size;
                mem = mem.add(std::mem::size_of::<usize>());
            }
        }
        Ok(mem)
    }

    pub fn xfree(&mut self, ptr_: *mut u8) {
        if ptr_.is_null() {
            return;
        }
        #[allow(unused_mut)]
        let mut ptr_ = ptr_;
        #[cfg(feature = "exact_malloc_size")]
        {
            unsafe {
                ptr_ = ptr_.sub(std::mem::size_of::<usize>());
                let size = *(ptr_ as *mut usize);
                if size != 0 {
                    self.malloc_params.allocated_size -= size;
                    self.malloc_params.allocations -= 1;
                }
            }
        }
        unsafe { libc::free(ptr_ as *mut libc::c_void) };
    }
}

// `ObjectSpace` carries raw pointers into its own pages; it is tied to
// the host thread and never handed across threads (see the concurrency
// contract in the crate docs).
