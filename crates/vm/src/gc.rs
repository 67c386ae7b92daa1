//! Garbage-collected heap.
//!
//! Mark-and-sweep over a slot vector with a free list. Execution contexts,
//! block environments, containers, modules and exceptions all live here;
//! `home`/`creation`/`sender` links between contexts and closures form
//! cycles, which is exactly why they are heap indices traced by the
//! collector instead of owning pointers.
//!
//! # Design
//!
//! Objects are allocated from a vector with a free list for slot reuse.
//! Collection marks everything reachable from the root set with a worklist,
//! then sweeps unmarked slots back onto the free list. The interpreter
//! refreshes the root set and calls `maybe_collect` at send boundaries,
//! its one safe point.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::rc::Rc;

use crate::code::{CompiledCode, MethodEntry};
use crate::symbol::Symbol;
use crate::value::Value;

/// Raw index into the heap. Used for type-erased operations.
pub type RawGcPtr = u32;

/// A typed pointer to a GC-managed object.
///
/// A lightweight handle (just a u32 index) into the heap. The type
/// parameter gives compile-time safety; GcPtr is Copy because it is only
/// an index.
pub struct GcPtr<T> {
    index: RawGcPtr,
    _marker: PhantomData<*const T>,
}

// Manually implement Copy and Clone to avoid T: Copy bounds
impl<T> Copy for GcPtr<T> {}

impl<T> Clone for GcPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> GcPtr<T> {
    /// Create a new GcPtr from a raw index.
    ///
    /// The index must point to a valid object of type T in the heap.
    pub(crate) fn from_raw(index: RawGcPtr) -> Self {
        Self {
            index,
            _marker: PhantomData,
        }
    }

    /// Get the raw index for this pointer.
    pub fn as_raw(&self) -> RawGcPtr {
        self.index
    }

    /// Check if two pointers point to the same object.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> fmt::Debug for GcPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GcPtr({})", self.index)
    }
}

impl<T> PartialEq for GcPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}

impl<T> Eq for GcPtr<T> {}

impl<T> std::hash::Hash for GcPtr<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}

/// A GC-managed mutable string.
#[derive(Clone, Debug, PartialEq)]
pub struct GcString {
    pub data: String,
}

/// A GC-managed tuple (fixed-length indexed container).
#[derive(Clone, Debug)]
pub struct GcTuple {
    pub fields: Vec<Value>,
}

/// A GC-managed array (growable).
#[derive(Clone, Debug)]
pub struct GcArray {
    pub items: Vec<Value>,
}

/// An ordinary object: a class, named instance variables, and indexed
/// field storage for the field-access opcodes.
#[derive(Clone, Debug)]
pub struct GcInstance {
    pub class: GcPtr<GcModule>,
    pub ivars: HashMap<Symbol, Value>,
    pub fields: Vec<Value>,
    /// Singleton method holder, created lazily by `open_metaclass`.
    pub metaclass: Option<GcPtr<GcModule>>,
}

/// A class or module: method table, constant table, ancestry link.
///
/// Classes and modules share this struct; `is_class` distinguishes them.
/// Modules are process-wide and registered as permanent roots, so they are
/// never collected during a run.
#[derive(Clone, Debug)]
pub struct GcModule {
    pub name: Symbol,
    pub methods: HashMap<Symbol, MethodEntry>,
    pub constants: HashMap<Symbol, Value>,
    pub superclass: Option<GcPtr<GcModule>>,
    pub metaclass: Option<GcPtr<GcModule>>,
    pub is_class: bool,
}

/// A guest exception object.
#[derive(Clone, Debug)]
pub struct GcException {
    pub class: Option<GcPtr<GcModule>>,
    pub message: String,
}

/// A closure: a block body plus the captured enclosing-context links.
///
/// `home` is the nearest enclosing *method* context (the non-local return
/// target, even across nested blocks); `creation` is the immediately
/// enclosing context (the start of depth-indexed variable walks).
#[derive(Clone, Debug)]
pub struct GcBlockEnv {
    pub code: Rc<CompiledCode>,
    pub home: GcPtr<GcContext>,
    pub creation: GcPtr<GcContext>,
}

/// One call frame: instruction pointer, operand stack, locals, receiver,
/// and the frame-chain links. Block-flavoured contexts carry the
/// environment they were activated from.
#[derive(Clone, Debug)]
pub struct GcContext {
    pub code: Rc<CompiledCode>,
    pub ip: usize,
    pub stack: Vec<Value>,
    pub locals: Vec<Value>,
    pub self_value: Value,
    pub block: Value,
    /// Number of arguments actually passed (explicit + splat-expanded).
    pub argcount: usize,
    pub sender: Option<GcPtr<GcContext>>,
    /// Present only for block invocations.
    pub env: Option<GcPtr<GcBlockEnv>>,
    /// Call-chain depth, for overflow detection.
    pub depth: usize,
}

/// The type of a heap object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObjectType {
    String,
    Tuple,
    Array,
    Instance,
    Module,
    Exception,
    BlockEnv,
    Context,
}

/// A heap object with GC metadata.
#[derive(Clone)]
pub struct GcObject {
    /// The actual data
    pub data: HeapData,
    /// Mark bit for garbage collection
    pub marked: bool,
    /// Size estimate in bytes (for memory pressure tracking)
    pub size: usize,
}

/// The data stored in a heap object.
#[derive(Clone, Debug)]
pub enum HeapData {
    String(GcString),
    Tuple(GcTuple),
    Array(GcArray),
    Instance(GcInstance),
    Module(GcModule),
    Exception(GcException),
    BlockEnv(GcBlockEnv),
    Context(GcContext),
}

fn value_pointers(values: &[Value]) -> impl Iterator<Item = RawGcPtr> + '_ {
    values.iter().filter_map(|v| v.gc_pointer())
}

impl HeapData {
    /// Get the type of this heap data.
    pub fn object_type(&self) -> ObjectType {
        match self {
            HeapData::String(_) => ObjectType::String,
            HeapData::Tuple(_) => ObjectType::Tuple,
            HeapData::Array(_) => ObjectType::Array,
            HeapData::Instance(_) => ObjectType::Instance,
            HeapData::Module(_) => ObjectType::Module,
            HeapData::Exception(_) => ObjectType::Exception,
            HeapData::BlockEnv(_) => ObjectType::BlockEnv,
            HeapData::Context(_) => ObjectType::Context,
        }
    }

    /// Get all GC pointers contained in this heap data.
    pub fn gc_pointers(&self) -> Vec<RawGcPtr> {
        match self {
            HeapData::String(_) => vec![],
            HeapData::Tuple(t) => value_pointers(&t.fields).collect(),
            HeapData::Array(a) => value_pointers(&a.items).collect(),
            HeapData::Instance(inst) => {
                let mut ptrs = vec![inst.class.as_raw()];
                ptrs.extend(inst.ivars.values().filter_map(|v| v.gc_pointer()));
                ptrs.extend(value_pointers(&inst.fields));
                if let Some(meta) = inst.metaclass {
                    ptrs.push(meta.as_raw());
                }
                ptrs
            }
            HeapData::Module(m) => {
                let mut ptrs = Vec::new();
                ptrs.extend(m.constants.values().filter_map(|v| v.gc_pointer()));
                if let Some(sup) = m.superclass {
                    ptrs.push(sup.as_raw());
                }
                if let Some(meta) = m.metaclass {
                    ptrs.push(meta.as_raw());
                }
                ptrs
            }
            HeapData::Exception(e) => e.class.iter().map(|c| c.as_raw()).collect(),
            HeapData::BlockEnv(env) => vec![env.home.as_raw(), env.creation.as_raw()],
            HeapData::Context(ctx) => {
                let mut ptrs: Vec<RawGcPtr> = value_pointers(&ctx.stack).collect();
                ptrs.extend(value_pointers(&ctx.locals));
                ptrs.extend(ctx.self_value.gc_pointer());
                ptrs.extend(ctx.block.gc_pointer());
                if let Some(sender) = ctx.sender {
                    ptrs.push(sender.as_raw());
                }
                if let Some(env) = ctx.env {
                    ptrs.push(env.as_raw());
                }
                // Lexical scope modules are registry roots already, but
                // trace them anyway so a context never holds a dead module.
                ptrs.extend(ctx.code.scope.iter().map(|m| m.as_raw()));
                ptrs
            }
        }
    }

    /// Estimate the size of this object in bytes.
    pub fn estimate_size(&self) -> usize {
        let val = std::mem::size_of::<Value>();
        match self {
            HeapData::String(s) => std::mem::size_of::<GcString>() + s.data.len(),
            HeapData::Tuple(t) => std::mem::size_of::<GcTuple>() + t.fields.len() * val,
            HeapData::Array(a) => std::mem::size_of::<GcArray>() + a.items.len() * val,
            HeapData::Instance(i) => {
                std::mem::size_of::<GcInstance>()
                    + i.fields.len() * val
                    + i.ivars.len() * (std::mem::size_of::<Symbol>() + val)
            }
            HeapData::Module(m) => {
                std::mem::size_of::<GcModule>()
                    + m.methods.len() * (std::mem::size_of::<Symbol>() + std::mem::size_of::<MethodEntry>())
                    + m.constants.len() * (std::mem::size_of::<Symbol>() + val)
            }
            HeapData::Exception(e) => std::mem::size_of::<GcException>() + e.message.len(),
            HeapData::BlockEnv(_) => std::mem::size_of::<GcBlockEnv>(),
            HeapData::Context(c) => {
                std::mem::size_of::<GcContext>() + (c.stack.capacity() + c.locals.len()) * val
            }
        }
    }
}

impl fmt::Debug for GcObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcObject")
            .field("data", &self.data)
            .field("marked", &self.marked)
            .field("size", &self.size)
            .finish()
    }
}

/// Statistics about GC activity.
#[derive(Clone, Debug, Default)]
pub struct GcStats {
    /// Number of collections performed
    pub collections: u64,
    /// Total objects allocated
    pub total_allocated: u64,
    /// Total objects freed
    pub total_freed: u64,
    /// Total bytes allocated
    pub total_bytes_allocated: u64,
    /// Total bytes freed
    pub total_bytes_freed: u64,
    /// Peak number of live objects
    pub peak_objects: usize,
}

/// Configuration for the garbage collector.
#[derive(Clone, Debug)]
pub struct GcConfig {
    /// Initial capacity of the heap (number of objects)
    pub initial_capacity: usize,
    /// Bytes allocated before triggering collection
    pub gc_threshold: usize,
    /// Growth factor when heap needs to expand
    pub growth_factor: f64,
    /// Whether to print debug info during collection
    pub debug: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            initial_capacity: 1024,
            gc_threshold: 1024 * 1024, // 1MB
            growth_factor: 2.0,
            debug: false,
        }
    }
}

/// A garbage-collected heap. One per task.
pub struct Heap {
    /// Storage for all objects
    objects: Vec<Option<GcObject>>,
    /// Free list (indices of available slots)
    free_list: Vec<RawGcPtr>,
    /// Root set (indices that should not be collected)
    roots: Vec<RawGcPtr>,
    /// Permanent roots (module registry); survive `set_roots`.
    permanent_roots: Vec<RawGcPtr>,
    /// Bytes allocated since last collection
    bytes_since_gc: usize,
    /// Configuration
    config: GcConfig,
    /// Statistics
    stats: GcStats,
}

impl Heap {
    /// Create a new heap with default configuration.
    pub fn new() -> Self {
        Self::with_config(GcConfig::default())
    }

    /// Create a new heap with custom configuration.
    pub fn with_config(config: GcConfig) -> Self {
        Self {
            objects: Vec::with_capacity(config.initial_capacity),
            free_list: Vec::new(),
            roots: Vec::new(),
            permanent_roots: Vec::new(),
            bytes_since_gc: 0,
            config,
            stats: GcStats::default(),
        }
    }

    /// Get the current configuration.
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Get GC statistics.
    pub fn stats(&self) -> &GcStats {
        &self.stats
    }

    /// Get the number of live objects.
    pub fn live_objects(&self) -> usize {
        self.objects.iter().filter(|o| o.is_some()).count()
    }

    /// Get the total heap capacity.
    pub fn capacity(&self) -> usize {
        self.objects.len()
    }

    /// Allocate a new object on the heap.
    fn alloc(&mut self, data: HeapData) -> RawGcPtr {
        let size = data.estimate_size();
        let obj = GcObject {
            data,
            marked: false,
            size,
        };

        self.stats.total_allocated += 1;
        self.stats.total_bytes_allocated += size as u64;
        self.bytes_since_gc += size;

        // Reuse a free slot when possible
        let index = if let Some(free_idx) = self.free_list.pop() {
            self.objects[free_idx as usize] = Some(obj);
            free_idx
        } else {
            let idx = self.objects.len() as RawGcPtr;
            self.objects.push(Some(obj));
            idx
        };

        let live = self.live_objects();
        if live > self.stats.peak_objects {
            self.stats.peak_objects = live;
        }

        index
    }

    /// Allocate a string.
    pub fn alloc_string(&mut self, s: String) -> GcPtr<GcString> {
        GcPtr::from_raw(self.alloc(HeapData::String(GcString { data: s })))
    }

    /// Allocate a tuple.
    pub fn alloc_tuple(&mut self, fields: Vec<Value>) -> GcPtr<GcTuple> {
        GcPtr::from_raw(self.alloc(HeapData::Tuple(GcTuple { fields })))
    }

    /// Allocate an array.
    pub fn alloc_array(&mut self, items: Vec<Value>) -> GcPtr<GcArray> {
        GcPtr::from_raw(self.alloc(HeapData::Array(GcArray { items })))
    }

    /// Allocate an instance of a class.
    pub fn alloc_instance(&mut self, class: GcPtr<GcModule>, field_count: usize) -> GcPtr<GcInstance> {
        let data = HeapData::Instance(GcInstance {
            class,
            ivars: HashMap::new(),
            fields: vec![Value::Nil; field_count],
            metaclass: None,
        });
        GcPtr::from_raw(self.alloc(data))
    }

    /// Allocate a class or module shell.
    pub fn alloc_module(
        &mut self,
        name: Symbol,
        superclass: Option<GcPtr<GcModule>>,
        is_class: bool,
    ) -> GcPtr<GcModule> {
        let data = HeapData::Module(GcModule {
            name,
            methods: HashMap::new(),
            constants: HashMap::new(),
            superclass,
            metaclass: None,
            is_class,
        });
        GcPtr::from_raw(self.alloc(data))
    }

    /// Allocate an exception.
    pub fn alloc_exception(
        &mut self,
        class: Option<GcPtr<GcModule>>,
        message: String,
    ) -> GcPtr<GcException> {
        GcPtr::from_raw(self.alloc(HeapData::Exception(GcException { class, message })))
    }

    /// Allocate a block environment.
    pub fn alloc_block_env(
        &mut self,
        code: Rc<CompiledCode>,
        home: GcPtr<GcContext>,
        creation: GcPtr<GcContext>,
    ) -> GcPtr<GcBlockEnv> {
        let data = HeapData::BlockEnv(GcBlockEnv {
            code,
            home,
            creation,
        });
        GcPtr::from_raw(self.alloc(data))
    }

    /// Allocate an execution context.
    pub fn alloc_context(&mut self, ctx: GcContext) -> GcPtr<GcContext> {
        GcPtr::from_raw(self.alloc(HeapData::Context(ctx)))
    }

    /// Get an object by raw pointer.
    pub fn get(&self, ptr: RawGcPtr) -> Option<&GcObject> {
        self.objects.get(ptr as usize).and_then(|o| o.as_ref())
    }

    /// Get a mutable reference to an object.
    pub fn get_mut(&mut self, ptr: RawGcPtr) -> Option<&mut GcObject> {
        self.objects.get_mut(ptr as usize).and_then(|o| o.as_mut())
    }

    /// Get a typed reference to string data.
    pub fn get_string(&self, ptr: GcPtr<GcString>) -> Option<&GcString> {
        match self.get(ptr.as_raw())?.data {
            HeapData::String(ref s) => Some(s),
            _ => None,
        }
    }

    /// Get a mutable reference to string data.
    pub fn get_string_mut(&mut self, ptr: GcPtr<GcString>) -> Option<&mut GcString> {
        match self.get_mut(ptr.as_raw())?.data {
            HeapData::String(ref mut s) => Some(s),
            _ => None,
        }
    }

    /// Get a typed reference to tuple data.
    pub fn get_tuple(&self, ptr: GcPtr<GcTuple>) -> Option<&GcTuple> {
        match self.get(ptr.as_raw())?.data {
            HeapData::Tuple(ref t) => Some(t),
            _ => None,
        }
    }

    /// Get a mutable reference to tuple data.
    pub fn get_tuple_mut(&mut self, ptr: GcPtr<GcTuple>) -> Option<&mut GcTuple> {
        match self.get_mut(ptr.as_raw())?.data {
            HeapData::Tuple(ref mut t) => Some(t),
            _ => None,
        }
    }

    /// Get a typed reference to array data.
    pub fn get_array(&self, ptr: GcPtr<GcArray>) -> Option<&GcArray> {
        match self.get(ptr.as_raw())?.data {
            HeapData::Array(ref a) => Some(a),
            _ => None,
        }
    }

    /// Get a mutable reference to array data.
    pub fn get_array_mut(&mut self, ptr: GcPtr<GcArray>) -> Option<&mut GcArray> {
        match self.get_mut(ptr.as_raw())?.data {
            HeapData::Array(ref mut a) => Some(a),
            _ => None,
        }
    }

    /// Get a typed reference to an instance.
    pub fn get_instance(&self, ptr: GcPtr<GcInstance>) -> Option<&GcInstance> {
        match self.get(ptr.as_raw())?.data {
            HeapData::Instance(ref i) => Some(i),
            _ => None,
        }
    }

    /// Get a mutable reference to an instance.
    pub fn get_instance_mut(&mut self, ptr: GcPtr<GcInstance>) -> Option<&mut GcInstance> {
        match self.get_mut(ptr.as_raw())?.data {
            HeapData::Instance(ref mut i) => Some(i),
            _ => None,
        }
    }

    /// Get a typed reference to a module.
    pub fn get_module(&self, ptr: GcPtr<GcModule>) -> Option<&GcModule> {
        match self.get(ptr.as_raw())?.data {
            HeapData::Module(ref m) => Some(m),
            _ => None,
        }
    }

    /// Get a mutable reference to a module.
    pub fn get_module_mut(&mut self, ptr: GcPtr<GcModule>) -> Option<&mut GcModule> {
        match self.get_mut(ptr.as_raw())?.data {
            HeapData::Module(ref mut m) => Some(m),
            _ => None,
        }
    }

    /// Get a typed reference to an exception.
    pub fn get_exception(&self, ptr: GcPtr<GcException>) -> Option<&GcException> {
        match self.get(ptr.as_raw())?.data {
            HeapData::Exception(ref e) => Some(e),
            _ => None,
        }
    }

    /// Get a typed reference to a block environment.
    pub fn get_block_env(&self, ptr: GcPtr<GcBlockEnv>) -> Option<&GcBlockEnv> {
        match self.get(ptr.as_raw())?.data {
            HeapData::BlockEnv(ref b) => Some(b),
            _ => None,
        }
    }

    /// Get a typed reference to a context.
    pub fn get_context(&self, ptr: GcPtr<GcContext>) -> Option<&GcContext> {
        match self.get(ptr.as_raw())?.data {
            HeapData::Context(ref c) => Some(c),
            _ => None,
        }
    }

    /// Get a mutable reference to a context.
    pub fn get_context_mut(&mut self, ptr: GcPtr<GcContext>) -> Option<&mut GcContext> {
        match self.get_mut(ptr.as_raw())?.data {
            HeapData::Context(ref mut c) => Some(c),
            _ => None,
        }
    }

    /// Add a root to the root set.
    pub fn add_root(&mut self, ptr: RawGcPtr) {
        if !self.roots.contains(&ptr) {
            self.roots.push(ptr);
        }
    }

    /// Remove a root from the root set.
    pub fn remove_root(&mut self, ptr: RawGcPtr) {
        self.roots.retain(|&r| r != ptr);
    }

    /// Register a permanent root (modules, core classes). Permanent roots
    /// survive `set_roots` and are never collected.
    pub fn add_permanent_root(&mut self, ptr: RawGcPtr) {
        if !self.permanent_roots.contains(&ptr) {
            self.permanent_roots.push(ptr);
        }
    }

    /// Replace the transient root set (the interpreter does this at each
    /// safe point with the active context chain).
    pub fn set_roots(&mut self, roots: Vec<RawGcPtr>) {
        self.roots = roots;
    }

    /// Get the current transient roots.
    pub fn roots(&self) -> &[RawGcPtr] {
        &self.roots
    }

    /// Check if we should trigger a collection.
    pub fn should_collect(&self) -> bool {
        self.bytes_since_gc >= self.config.gc_threshold
    }

    /// Force a garbage collection.
    pub fn collect(&mut self) {
        self.stats.collections += 1;
        log::debug!(
            "gc: collection #{} starting, {} live objects, {} bytes since last",
            self.stats.collections,
            self.live_objects(),
            self.bytes_since_gc
        );
        if self.config.debug {
            eprintln!(
                "[GC] Starting collection #{}, {} live objects, {} bytes since last GC",
                self.stats.collections,
                self.live_objects(),
                self.bytes_since_gc
            );
        }

        self.mark_phase();
        let freed = self.sweep_phase();

        log::debug!("gc: freed {} objects, {} now live", freed, self.live_objects());
        if self.config.debug {
            eprintln!(
                "[GC] Collection complete, freed {} objects, {} now live",
                freed,
                self.live_objects()
            );
        }
        self.bytes_since_gc = 0;
    }

    /// Mark phase: mark all reachable objects starting from roots.
    fn mark_phase(&mut self) {
        for obj in self.objects.iter_mut().flatten() {
            obj.marked = false;
        }

        let mut worklist: Vec<RawGcPtr> = self.roots.clone();
        worklist.extend(self.permanent_roots.iter().copied());

        while let Some(ptr) = worklist.pop() {
            if let Some(obj) = self.objects.get_mut(ptr as usize).and_then(|o| o.as_mut()) {
                if !obj.marked {
                    obj.marked = true;
                    worklist.extend(obj.data.gc_pointers());
                }
            }
        }
    }

    /// Sweep phase: free unmarked objects.
    fn sweep_phase(&mut self) -> usize {
        let mut freed = 0u64;
        let mut bytes_freed = 0usize;

        for i in 0..self.objects.len() {
            if let Some(ref obj) = self.objects[i] {
                if !obj.marked {
                    bytes_freed += obj.size;
                    freed += 1;
                    self.objects[i] = None;
                    self.free_list.push(i as RawGcPtr);
                }
            }
        }

        self.stats.total_freed += freed;
        self.stats.total_bytes_freed += bytes_freed as u64;

        freed as usize
    }

    /// Collect if threshold exceeded, otherwise do nothing.
    pub fn maybe_collect(&mut self) {
        if self.should_collect() {
            self.collect();
        }
    }
}

impl Default for Heap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_access() {
        let mut heap = Heap::new();
        let s = heap.alloc_string("hello".to_string());
        assert_eq!(heap.get_string(s).unwrap().data, "hello");

        let t = heap.alloc_tuple(vec![Value::Fixnum(1), Value::Str(s)]);
        assert_eq!(heap.get_tuple(t).unwrap().fields.len(), 2);
    }

    #[test]
    fn test_collect_frees_unrooted() {
        let mut heap = Heap::new();
        let a = heap.alloc_string("kept".to_string());
        let _b = heap.alloc_string("dropped".to_string());
        heap.add_root(a.as_raw());
        heap.collect();
        assert_eq!(heap.live_objects(), 1);
        assert_eq!(heap.get_string(a).unwrap().data, "kept");
    }

    #[test]
    fn test_mark_traces_through_containers() {
        let mut heap = Heap::new();
        let inner = heap.alloc_string("inner".to_string());
        let tuple = heap.alloc_tuple(vec![Value::Str(inner)]);
        let array = heap.alloc_array(vec![Value::Tuple(tuple)]);
        heap.add_root(array.as_raw());
        heap.collect();
        assert_eq!(heap.live_objects(), 3);
        assert_eq!(heap.get_string(inner).unwrap().data, "inner");
    }

    #[test]
    fn test_free_list_reuse() {
        let mut heap = Heap::new();
        let a = heap.alloc_string("a".to_string());
        let raw = a.as_raw();
        heap.collect(); // no roots, slot freed
        let b = heap.alloc_string("b".to_string());
        assert_eq!(b.as_raw(), raw);
    }

    #[test]
    fn test_maybe_collect_honors_threshold() {
        let config = GcConfig {
            gc_threshold: 100,
            ..Default::default()
        };
        let mut heap = Heap::with_config(config);

        for _ in 0..50 {
            let _ptr = heap.alloc_string("garbage".to_string());
        }
        let before = heap.stats().collections;
        heap.maybe_collect();
        assert_eq!(heap.stats().collections, before + 1);

        // Under threshold: a no-op.
        heap.maybe_collect();
        assert_eq!(heap.stats().collections, before + 1);
    }

    #[test]
    fn test_permanent_roots_survive_set_roots() {
        let mut heap = Heap::new();
        let mut table = crate::symbol::SymbolTable::new();
        let name = table.intern("Thing");
        let m = heap.alloc_module(name, None, true);
        heap.add_permanent_root(m.as_raw());
        heap.set_roots(vec![]);
        heap.collect();
        assert!(heap.get_module(m).is_some());
    }
}
