//! The shared execution environment modules are loaded into.
//!
//! An [`Environment`] owns the merged sequences of signatures,
//! functions, tables, memories and globals contributed by every
//! module loaded so far, the istream buffer their code was emitted
//! into, and a name registry used to resolve imports. Translation
//! borrows the environment exclusively and appends to these
//! sequences; a failed translation truncates them back to the
//! [`EnvironmentMark`] taken before it started.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::mem;

use cranelift_entity::EntityRef;

use crate::error::{Error, Result};
use crate::indices::{
    EnvFuncIndex, EnvGlobalIndex, EnvMemoryIndex, EnvSigIndex, EnvTableIndex, ModuleIndex,
};
use crate::istream::IstreamOffset;
use crate::types::{ExternalKind, FuncSignature, Limits, Value, ValueType, WASM_PAGE_SIZE};

/// A function provided by the embedder. Receives its signature and
/// the argument values; returns the result values or an error
/// message.
pub type HostFuncCallback =
    Box<dyn Fn(&FuncSignature, &[Value]) -> std::result::Result<Vec<Value>, String>>;

/// A function whose body was translated from a module.
pub struct DefinedFunc {
    /// The function's environment-wide signature.
    pub sig_index: EnvSigIndex,
    /// Entry offset into the istream; `None` until the body has been
    /// translated.
    pub offset: Option<IstreamOffset>,
    /// Number of local declaration runs in the body.
    pub local_decl_count: u32,
    /// Total number of locals, not counting parameters.
    pub local_count: u32,
    /// Parameter types followed by local types, in declaration order.
    pub param_and_local_types: Vec<ValueType>,
}

impl DefinedFunc {
    pub(crate) fn new(sig_index: EnvSigIndex) -> DefinedFunc {
        DefinedFunc {
            sig_index,
            offset: None,
            local_decl_count: 0,
            local_count: 0,
            param_and_local_types: Vec::new(),
        }
    }
}

/// A function whose body is a host callback.
pub struct HostFunc {
    /// Name of the host module the function was imported from.
    pub module_name: String,
    /// Field name it was imported as.
    pub field_name: String,
    /// The function's environment-wide signature.
    pub sig_index: EnvSigIndex,
    /// The callback the import delegate installed.
    pub callback: Option<HostFuncCallback>,
}

/// A function in the environment: translated bytecode or a host
/// callback.
pub enum Func {
    Defined(DefinedFunc),
    Host(HostFunc),
}

impl Func {
    /// The function's environment-wide signature.
    pub fn sig_index(&self) -> EnvSigIndex {
        match self {
            Func::Defined(f) => f.sig_index,
            Func::Host(f) => f.sig_index,
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self, Func::Host(_))
    }

    pub fn as_defined(&self) -> Option<&DefinedFunc> {
        match self {
            Func::Defined(f) => Some(f),
            Func::Host(_) => None,
        }
    }

    pub(crate) fn as_defined_mut(&mut self) -> Option<&mut DefinedFunc> {
        match self {
            Func::Defined(f) => Some(f),
            Func::Host(_) => None,
        }
    }
}

/// A typed global variable.
pub struct Global {
    /// Current value; also carries the global's type.
    pub value: Value,
    /// Whether the global may be written.
    pub mutable: bool,
}

/// A table of function references.
pub struct Table {
    /// Element limits the table was created with.
    pub limits: Limits,
    /// One slot per element up to the initial size; `None` until an
    /// element segment fills the slot.
    pub func_indexes: Vec<Option<EnvFuncIndex>>,
}

impl Table {
    /// An empty table sized to the initial limit.
    pub fn new(limits: Limits) -> Table {
        Table {
            limits,
            func_indexes: vec![None; limits.initial as usize],
        }
    }
}

/// A linear memory.
#[derive(Default)]
pub struct Memory {
    /// Page limits the memory was created with.
    pub page_limits: Limits,
    /// The memory's contents, sized to the initial limit.
    pub data: Vec<u8>,
}

impl Memory {
    /// A zeroed memory sized to the initial limit.
    pub fn new(page_limits: Limits) -> Memory {
        Memory {
            page_limits,
            data: vec![0; page_limits.initial as usize * WASM_PAGE_SIZE as usize],
        }
    }
}

/// One entry of a module's export list. `index` is an environment
/// index in the index space selected by `kind`.
#[derive(Clone, Debug)]
pub struct Export {
    pub name: String,
    pub kind: ExternalKind,
    pub index: u32,
}

/// One entry of a module's import list.
#[derive(Clone, Debug)]
pub struct Import {
    pub module_name: String,
    pub field_name: String,
    /// The resolved kind; `None` until resolution reaches the
    /// kind-specific part of the import entry.
    pub kind: Option<ExternalKind>,
}

/// Supplies the contents of a host module's imports as modules under
/// translation request them.
///
/// Each callback receives the import record and the freshly created
/// environment slot to populate. An `Err` is reported through the
/// translation's error channel and aborts the load.
pub trait HostImportDelegate {
    fn import_func(
        &mut self,
        import: &Import,
        sig: &FuncSignature,
        func: &mut HostFunc,
    ) -> std::result::Result<(), String>;

    fn import_table(
        &mut self,
        import: &Import,
        table: &mut Table,
    ) -> std::result::Result<(), String>;

    fn import_memory(
        &mut self,
        import: &Import,
        memory: &mut Memory,
    ) -> std::result::Result<(), String>;

    fn import_global(
        &mut self,
        import: &Import,
        global: &mut Global,
    ) -> std::result::Result<(), String>;
}

pub(crate) enum ModuleKind {
    Defined {
        start_func: Option<EnvFuncIndex>,
        istream_start: IstreamOffset,
        istream_end: IstreamOffset,
    },
    Host {
        delegate: Box<dyn HostImportDelegate>,
    },
}

/// A module known to the environment: either translated from a
/// binary, or a host module whose contents the embedder supplies on
/// demand.
pub struct Module {
    pub(crate) exports: Vec<Export>,
    pub(crate) export_map: HashMap<String, usize>,
    pub(crate) imports: Vec<Import>,
    /// The module's table, if it defined or imported one.
    pub table_index: Option<EnvTableIndex>,
    /// The module's memory, if it defined or imported one.
    pub memory_index: Option<EnvMemoryIndex>,
    pub(crate) kind: ModuleKind,
}

impl Module {
    pub(crate) fn defined(istream_start: IstreamOffset) -> Module {
        Module {
            exports: Vec::new(),
            export_map: HashMap::new(),
            imports: Vec::new(),
            table_index: None,
            memory_index: None,
            kind: ModuleKind::Defined {
                start_func: None,
                istream_start,
                istream_end: istream_start,
            },
        }
    }

    pub(crate) fn host(delegate: Box<dyn HostImportDelegate>) -> Module {
        Module {
            exports: Vec::new(),
            export_map: HashMap::new(),
            imports: Vec::new(),
            table_index: None,
            memory_index: None,
            kind: ModuleKind::Host { delegate },
        }
    }

    pub fn is_host(&self) -> bool {
        matches!(self.kind, ModuleKind::Host { .. })
    }

    /// The module's exports, in declaration order.
    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    /// The module's imports, in declaration order.
    pub fn imports(&self) -> &[Import] {
        &self.imports
    }

    /// Looks up an export by name.
    pub fn export(&self, name: &str) -> Option<&Export> {
        self.export_map.get(name).map(|&i| &self.exports[i])
    }

    /// The environment index of the module's start function, if the
    /// module declared one.
    pub fn start_func(&self) -> Option<EnvFuncIndex> {
        match self.kind {
            ModuleKind::Defined { start_func, .. } => start_func,
            ModuleKind::Host { .. } => None,
        }
    }

    /// The istream range the module's code occupies, for translated
    /// modules.
    pub fn istream_range(&self) -> Option<(IstreamOffset, IstreamOffset)> {
        match self.kind {
            ModuleKind::Defined {
                istream_start,
                istream_end,
                ..
            } => Some((istream_start, istream_end)),
            ModuleKind::Host { .. } => None,
        }
    }

    pub(crate) fn set_start_func(&mut self, index: EnvFuncIndex) {
        if let ModuleKind::Defined { start_func, .. } = &mut self.kind {
            *start_func = Some(index);
        }
    }

    pub(crate) fn set_istream_end(&mut self, end: IstreamOffset) {
        if let ModuleKind::Defined { istream_end, .. } = &mut self.kind {
            *istream_end = end;
        }
    }

    /// Drops exports that point past the marked sequence sizes and
    /// rebuilds the name map. A failed translation may have appended
    /// exports to a pre-existing host module; those refer to slots
    /// the rollback is about to discard.
    fn trim_exports(&mut self, mark: &EnvironmentMark) {
        self.exports.retain(|export| match export.kind {
            ExternalKind::Func => (export.index as usize) < mark.funcs,
            ExternalKind::Table => (export.index as usize) < mark.tables,
            ExternalKind::Memory => (export.index as usize) < mark.memories,
            ExternalKind::Global => (export.index as usize) < mark.globals,
        });
        self.export_map.clear();
        for (i, export) in self.exports.iter().enumerate() {
            self.export_map.insert(export.name.clone(), i);
        }
    }

    /// Appends an export, rejecting duplicate names.
    pub(crate) fn append_export(
        &mut self,
        kind: ExternalKind,
        index: u32,
        name: &str,
    ) -> Result<()> {
        match self.export_map.entry(name.to_string()) {
            Entry::Occupied(_) => Err(Error::link(format!("duplicate export \"{name}\""))),
            Entry::Vacant(entry) => {
                entry.insert(self.exports.len());
                self.exports.push(Export {
                    name: name.to_string(),
                    kind,
                    index,
                });
                Ok(())
            }
        }
    }
}

/// Sizes of the environment's sequences at a point in time. Resetting
/// to a mark discards everything added after it was taken.
#[derive(Copy, Clone, Debug)]
pub struct EnvironmentMark {
    sigs: usize,
    funcs: usize,
    tables: usize,
    memories: usize,
    globals: usize,
    modules: usize,
    istream: usize,
}

/// The shared execution environment.
pub struct Environment {
    pub(crate) sigs: Vec<FuncSignature>,
    pub(crate) funcs: Vec<Func>,
    pub(crate) tables: Vec<Table>,
    pub(crate) memories: Vec<Memory>,
    pub(crate) globals: Vec<Global>,
    pub(crate) modules: Vec<Module>,
    pub(crate) registered: HashMap<String, ModuleIndex>,
    pub(crate) istream: Vec<u8>,
}

impl Environment {
    pub fn new() -> Environment {
        Environment {
            sigs: Vec::new(),
            funcs: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            modules: Vec::new(),
            registered: HashMap::new(),
            istream: Vec::new(),
        }
    }

    pub fn sig(&self, index: EnvSigIndex) -> &FuncSignature {
        &self.sigs[index.index()]
    }

    pub fn func(&self, index: EnvFuncIndex) -> &Func {
        &self.funcs[index.index()]
    }

    pub fn table(&self, index: EnvTableIndex) -> &Table {
        &self.tables[index.index()]
    }

    pub fn memory(&self, index: EnvMemoryIndex) -> &Memory {
        &self.memories[index.index()]
    }

    pub fn global(&self, index: EnvGlobalIndex) -> &Global {
        &self.globals[index.index()]
    }

    pub fn module(&self, index: ModuleIndex) -> &Module {
        &self.modules[index.index()]
    }

    pub fn num_sigs(&self) -> usize {
        self.sigs.len()
    }

    pub fn num_funcs(&self) -> usize {
        self.funcs.len()
    }

    pub fn num_tables(&self) -> usize {
        self.tables.len()
    }

    pub fn num_memories(&self) -> usize {
        self.memories.len()
    }

    pub fn num_globals(&self) -> usize {
        self.globals.len()
    }

    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    /// The istream buffer translated modules execute from.
    pub fn istream(&self) -> &[u8] {
        &self.istream
    }

    /// Makes a module resolvable by name for subsequent imports.
    pub fn register_module(&mut self, name: impl Into<String>, index: ModuleIndex) {
        self.registered.insert(name.into(), index);
    }

    /// Looks up a registered module by name.
    pub fn registered_module(&self, name: &str) -> Option<ModuleIndex> {
        self.registered.get(name).copied()
    }

    /// Creates an empty host module, registers it under `name`, and
    /// returns its index. Its contents are materialised by `delegate`
    /// as other modules import from it.
    pub fn append_host_module(
        &mut self,
        name: impl Into<String>,
        delegate: Box<dyn HostImportDelegate>,
    ) -> ModuleIndex {
        let index = ModuleIndex::new(self.modules.len());
        self.modules.push(Module::host(delegate));
        self.registered.insert(name.into(), index);
        index
    }

    /// Records the current sizes of all environment-owned sequences.
    pub fn mark(&self) -> EnvironmentMark {
        EnvironmentMark {
            sigs: self.sigs.len(),
            funcs: self.funcs.len(),
            tables: self.tables.len(),
            memories: self.memories.len(),
            globals: self.globals.len(),
            modules: self.modules.len(),
            istream: self.istream.len(),
        }
    }

    /// Discards everything added since `mark` was taken, including
    /// name registrations that point at discarded modules.
    pub fn reset_to_mark(&mut self, mark: EnvironmentMark) {
        self.sigs.truncate(mark.sigs);
        self.funcs.truncate(mark.funcs);
        self.tables.truncate(mark.tables);
        self.memories.truncate(mark.memories);
        self.globals.truncate(mark.globals);
        self.registered.retain(|_, index| index.index() < mark.modules);
        self.modules.truncate(mark.modules);
        for module in &mut self.modules {
            module.trim_exports(&mark);
        }
        self.istream.truncate(mark.istream);
    }

    pub(crate) fn take_istream(&mut self) -> Vec<u8> {
        mem::take(&mut self.istream)
    }

    pub(crate) fn host_delegate_mut(
        &mut self,
        index: ModuleIndex,
    ) -> Option<&mut dyn HostImportDelegate> {
        match &mut self.modules.get_mut(index.index())?.kind {
            ModuleKind::Host { delegate } => Some(delegate.as_mut()),
            ModuleKind::Defined { .. } => None,
        }
    }
}

impl Default for Environment {
    fn default() -> Environment {
        Environment::new()
    }
}
