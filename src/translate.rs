//! Translation of decoded modules into interpreter bytecode.
//!
//! The translation is done in one pass, event by event, with three
//! concerns interleaved: every operator is checked against the Wasm
//! stack discipline, module-local indices are linked to the shared
//! [`Environment`], and bytecode is emitted into the istream as the
//! operators stream past. Two data structures carry the control flow:
//! the label stack holds one entry per open `block`/`loop`/`if` scope
//! (plus the implicit function scope), and the fixup tables remember
//! the istream slots of branches whose target offset is not known yet
//! — branches to the end of an open scope, keyed by the scope's
//! position from the outermost open label, and calls to functions
//! whose body has not been seen, keyed by defined-function index.
//!
//! Mutations of environment-owned tables and memories are deferred:
//! element and data segment edits are staged in side lists and
//! applied only once the whole module has decoded successfully, so a
//! late validation error cannot leave the environment partially
//! initialized. The [`translate_module`] driver pairs this with a
//! snapshot of the environment's sequence lengths, truncating back to
//! it if anything fails.

use std::iter;
use std::mem;

use cranelift_entity::{EntityRef, PrimaryMap};

use crate::binary_reader::{read_binary, BinaryReaderDelegate};
use crate::environment::{
    DefinedFunc, Environment, Func, Global, HostFunc, Import, Memory, Module, Table,
};
use crate::error::{Error, Result};
use crate::indices::{
    DefinedFuncIndex, EnvFuncIndex, EnvGlobalIndex, EnvMemoryIndex, EnvSigIndex, EnvTableIndex,
    FuncIndex, GlobalIndex, ModuleIndex, TypeIndex,
};
use crate::istream::{IstreamOffset, IstreamWriter, INVALID_ISTREAM_OFFSET};
use crate::opcode::Opcode;
use crate::typecheck::{LabelKind, TypeChecker};
use crate::types::{ExternalKind, FuncSignature, Limits, Value, ValueType};

/// Byte size of one `br_table` entry: branch offset (u32), drop count
/// (u32) and keep count (u8).
const BR_TABLE_ENTRY_SIZE: u32 = 9;

/// Translates one binary module into `env`.
///
/// On success the environment contains the new module, its code is
/// appended to the istream, and any element/data segments have been
/// applied; the returned index addresses the module in the
/// environment. On failure the environment is reset to the state it
/// had when the call was made.
pub fn translate_module(env: &mut Environment, data: &[u8]) -> Result<ModuleIndex> {
    let mark = env.mark();
    let istream_start = env.istream.len() as IstreamOffset;
    let module_index = ModuleIndex::new(env.modules.len());
    env.modules.push(Module::defined(istream_start));

    let buf = env.take_istream();
    let mut translator = Translator::new(env, module_index, buf);
    let result = read_binary(data, &mut translator);
    let (buf, istream_end) = translator.finish();
    env.istream = buf;

    match result {
        Ok(()) => {
            env.istream.truncate(istream_end as usize);
            env.modules[module_index.index()].set_istream_end(istream_end);
            log::debug!(
                "translated module: {} bytes of istream at offset {istream_start:#x}",
                istream_end - istream_start
            );
            Ok(module_index)
        }
        Err(err) => {
            env.reset_to_mark(mark);
            log::debug!("translation failed, rolled back: {err}");
            Err(err)
        }
    }
}

/// One open control scope. `offset` is the target of backward
/// branches into this scope (loops only); `fixup_offset` is the
/// pending forward-branch slot an `if`/`else` still has to patch.
struct Label {
    offset: Option<IstreamOffset>,
    fixup_offset: Option<IstreamOffset>,
}

/// A staged element-segment write: `table[dst] = func`.
struct ElemSegmentInfo {
    table: EnvTableIndex,
    dst: u32,
    func: EnvFuncIndex,
}

/// A staged data-segment write: `memory[dst..] = data`.
struct DataSegmentInfo {
    memory: EnvMemoryIndex,
    dst: u32,
    data: Vec<u8>,
}

/// Where the import currently being processed resolved to.
enum ResolvedImport {
    /// A host module will materialise the entity on demand.
    Host { module: ModuleIndex },
    /// An export of a previously loaded module.
    Native { kind: ExternalKind, index: u32 },
}

/// Per-function translation state, kept out of the environment until
/// the body completes.
struct CurrentFunc {
    env_index: EnvFuncIndex,
    param_and_local_types: Vec<ValueType>,
    local_decl_count: u32,
    local_count: u32,
}

struct Translator<'env> {
    env: &'env mut Environment,
    module_index: ModuleIndex,
    typechecker: TypeChecker,
    label_stack: Vec<Label>,
    /// Pending call-site slots per defined function, patched when the
    /// function's body begins.
    func_fixups: PrimaryMap<DefinedFuncIndex, Vec<IstreamOffset>>,
    /// Pending branch slots per open-scope position (0 = the implicit
    /// function scope), patched when the scope ends.
    depth_fixups: Vec<Vec<IstreamOffset>>,
    writer: IstreamWriter,
    sig_index_mapping: PrimaryMap<TypeIndex, EnvSigIndex>,
    func_index_mapping: PrimaryMap<FuncIndex, EnvFuncIndex>,
    global_index_mapping: PrimaryMap<GlobalIndex, EnvGlobalIndex>,
    num_func_imports: u32,
    num_global_imports: u32,
    elem_segment_infos: Vec<ElemSegmentInfo>,
    data_segment_infos: Vec<DataSegmentInfo>,
    /// Scratch value shared by the initializer-expression events.
    init_expr_value: Option<Value>,
    /// Next table slot an element-segment function index lands in.
    table_offset: u32,
    resolved_import: Option<ResolvedImport>,
    current_func: Option<CurrentFunc>,
}

impl<'env> Translator<'env> {
    fn new(env: &'env mut Environment, module_index: ModuleIndex, buf: Vec<u8>) -> Self {
        Translator {
            env,
            module_index,
            typechecker: TypeChecker::new(),
            label_stack: Vec::new(),
            func_fixups: PrimaryMap::new(),
            depth_fixups: Vec::new(),
            writer: IstreamWriter::new(buf),
            sig_index_mapping: PrimaryMap::new(),
            func_index_mapping: PrimaryMap::new(),
            global_index_mapping: PrimaryMap::new(),
            num_func_imports: 0,
            num_global_imports: 0,
            elem_segment_infos: Vec::new(),
            data_segment_infos: Vec::new(),
            init_expr_value: None,
            table_offset: 0,
            resolved_import: None,
            current_func: None,
        }
    }

    /// Releases the istream buffer and the offset translation ended
    /// at.
    fn finish(self) -> (Vec<u8>, IstreamOffset) {
        let end = self.writer.current_offset();
        (self.writer.into_buffer(), end)
    }

    fn module(&self) -> &Module {
        &self.env.modules[self.module_index.index()]
    }

    fn module_mut(&mut self) -> &mut Module {
        &mut self.env.modules[self.module_index.index()]
    }

    fn cur_func(&self) -> Result<&CurrentFunc> {
        self.current_func
            .as_ref()
            .ok_or_else(|| Error::validation("operator outside a function body"))
    }

    fn cur_func_mut(&mut self) -> Result<&mut CurrentFunc> {
        self.current_func
            .as_mut()
            .ok_or_else(|| Error::validation("operator outside a function body"))
    }

    fn import_record(&self, index: u32) -> Result<Import> {
        self.module()
            .imports
            .get(index as usize)
            .cloned()
            .ok_or_else(|| Error::validation(format!("import {index} out of order")))
    }

    fn take_resolved_import(&mut self) -> Result<ResolvedImport> {
        self.resolved_import
            .take()
            .ok_or_else(|| Error::validation("import events out of order"))
    }

    /* ------------------------ index linking ------------------------ */

    fn sig_env_index(&self, index: TypeIndex) -> Result<EnvSigIndex> {
        self.sig_index_mapping.get(index).copied().ok_or_else(|| {
            Error::validation(format!(
                "invalid type index: {} (max {})",
                index.index(),
                self.sig_index_mapping.len()
            ))
        })
    }

    fn func_env_index(&self, index: FuncIndex) -> Result<EnvFuncIndex> {
        self.func_index_mapping.get(index).copied().ok_or_else(|| {
            Error::validation(format!(
                "invalid func_index: {} (max {})",
                index.index(),
                self.func_index_mapping.len()
            ))
        })
    }

    fn global_env_index(&self, index: GlobalIndex) -> Result<EnvGlobalIndex> {
        self.global_index_mapping.get(index).copied().ok_or_else(|| {
            Error::validation(format!(
                "invalid global_index: {} (max {})",
                index.index(),
                self.global_index_mapping.len()
            ))
        })
    }

    fn defined_func_index(&self, index: FuncIndex) -> Result<DefinedFuncIndex> {
        index
            .index()
            .checked_sub(self.num_func_imports as usize)
            .map(DefinedFuncIndex::new)
            .ok_or_else(|| {
                Error::validation(format!("function {} is an import", index.index()))
            })
    }

    /* ------------------------- emission --------------------------- */

    fn emit_opcode(&mut self, opcode: Opcode) {
        self.writer.emit_u8(opcode as u8);
    }

    fn emit_drop_keep(&mut self, drop: u32, keep: u8) {
        debug_assert_ne!(drop, u32::MAX);
        debug_assert!(keep <= 1);
        if drop > 0 {
            if drop == 1 && keep == 0 {
                self.emit_opcode(Opcode::Drop);
            } else {
                self.emit_opcode(Opcode::DropKeep);
                self.writer.emit_u32(drop);
                self.writer.emit_u8(keep);
            }
        }
    }

    /// Emits a branch-target slot. A known offset is written
    /// directly; an unknown one records a fixup against the target
    /// scope, keyed by its position from the outermost open label.
    fn emit_br_offset(&mut self, depth: u32, offset: Option<IstreamOffset>) {
        match offset {
            Some(offset) => self.writer.emit_u32(offset),
            None => {
                let slot = self.label_stack.len() - 1 - depth as usize;
                if slot >= self.depth_fixups.len() {
                    self.depth_fixups.resize_with(slot + 1, Vec::new);
                }
                self.depth_fixups[slot].push(self.writer.current_offset());
                self.writer.emit_u32(INVALID_ISTREAM_OFFSET);
            }
        }
    }

    /// Drop and keep counts for a branch to the label `depth` steps
    /// out: a branch keeps the target's result values (none for a
    /// loop) and drops whatever else the scope pushed above the
    /// target's entry height. In dead code nothing is dropped.
    fn get_br_drop_keep_count(&self, depth: u32) -> Result<(u32, u8)> {
        let label = self.typechecker.label(depth)?;
        let keep = if label.kind == LabelKind::Loop {
            0
        } else {
            label.sig.len() as u8
        };
        let drop = if self.typechecker.is_unreachable() {
            0
        } else {
            let avail = (self.typechecker.type_stack_size() - label.type_stack_limit) as u32;
            avail.saturating_sub(keep as u32)
        };
        Ok((drop, keep))
    }

    /// Return is a branch to the implicit function label that also
    /// drops the parameters and locals still on the value stack.
    fn get_return_drop_keep_count(&self) -> Result<(u32, u8)> {
        let depth = (self.label_stack.len().saturating_sub(1)) as u32;
        let (drop, keep) = self.get_br_drop_keep_count(depth)?;
        let locals = self.cur_func()?.param_and_local_types.len() as u32;
        Ok((drop + locals, keep))
    }

    fn emit_br(&mut self, depth: u32, drop: u32, keep: u8) -> Result<()> {
        self.emit_drop_keep(drop, keep);
        self.emit_opcode(Opcode::Br);
        let offset = self.get_label(depth)?.offset;
        self.emit_br_offset(depth, offset);
        Ok(())
    }

    fn emit_br_table_offset(&mut self, depth: u32) -> Result<()> {
        let (drop, keep) = self.get_br_drop_keep_count(depth)?;
        let offset = self.get_label(depth)?.offset;
        self.emit_br_offset(depth, offset);
        self.writer.emit_u32(drop);
        self.writer.emit_u8(keep);
        Ok(())
    }

    /// Patches every branch waiting on the innermost open scope to
    /// the current offset.
    fn fixup_top_label(&mut self) {
        let offset = self.writer.current_offset();
        let top = match self.label_stack.len().checked_sub(1) {
            Some(top) => top,
            None => return,
        };
        if top >= self.depth_fixups.len() {
            return;
        }
        let fixups = mem::take(&mut self.depth_fixups[top]);
        for fixup in fixups {
            self.writer.patch_u32(fixup, offset);
        }
    }

    /// Emits a call-target slot, recording a fixup if the function's
    /// body has not been translated yet.
    fn emit_func_offset(&mut self, func_index: FuncIndex) -> Result<()> {
        let env_index = self.func_env_index(func_index)?;
        let offset = match &self.env.funcs[env_index.index()] {
            Func::Defined(func) => func.offset,
            Func::Host(_) => {
                return Err(Error::validation("host function has no istream offset"));
            }
        };
        match offset {
            Some(offset) => self.writer.emit_u32(offset),
            None => {
                let defined = self.defined_func_index(func_index)?;
                let slot = self.writer.current_offset();
                self.func_fixups
                    .get_mut(defined)
                    .ok_or_else(|| {
                        Error::validation(format!(
                            "invalid func_index: {} (max {})",
                            func_index.index(),
                            self.func_index_mapping.len()
                        ))
                    })?
                    .push(slot);
                self.writer.emit_u32(INVALID_ISTREAM_OFFSET);
            }
        }
        Ok(())
    }

    /* ------------------------ label stack ------------------------- */

    fn push_label(&mut self, offset: Option<IstreamOffset>, fixup: Option<IstreamOffset>) {
        self.label_stack.push(Label {
            offset,
            fixup_offset: fixup,
        });
    }

    fn pop_label(&mut self) {
        self.label_stack.pop();
        // the fixup table may be shorter than the label stack, so
        // only trim the tail that actually exists
        if self.depth_fixups.len() > self.label_stack.len() {
            self.depth_fixups.truncate(self.label_stack.len());
        }
    }

    fn get_label(&self, depth: u32) -> Result<&Label> {
        let len = self.label_stack.len();
        len.checked_sub(1 + depth as usize)
            .and_then(|i| self.label_stack.get(i))
            .ok_or_else(|| Error::validation(format!("invalid depth: {depth} (max {len})")))
    }

    fn top_label_mut(&mut self) -> Result<&mut Label> {
        self.label_stack
            .last_mut()
            .ok_or_else(|| Error::validation("label stack empty"))
    }

    /* -------------------------- checks ---------------------------- */

    fn check_local(&self, local_index: u32) -> Result<()> {
        let max = self.cur_func()?.param_and_local_types.len() as u32;
        if local_index >= max {
            return Err(Error::validation(format!(
                "invalid local_index: {local_index} (max {max})"
            )));
        }
        Ok(())
    }

    fn check_has_memory(&self, opcode: Opcode) -> Result<EnvMemoryIndex> {
        self.module().memory_index.ok_or_else(|| {
            Error::validation(format!(
                "{} requires an imported or defined memory",
                opcode.name()
            ))
        })
    }

    fn check_align(&self, alignment_log2: u32, natural_alignment: u32) -> Result<()> {
        if alignment_log2 >= 32 || (1u32 << alignment_log2) > natural_alignment {
            return Err(Error::validation(format!(
                "alignment must not be larger than natural alignment ({natural_alignment})"
            )));
        }
        Ok(())
    }

    fn check_import_kind(
        import: &Import,
        actual: ExternalKind,
        expected: ExternalKind,
    ) -> Result<()> {
        if actual != expected {
            return Err(Error::link(format!(
                "expected import \"{}.{}\" to have kind {expected}, not {actual}",
                import.module_name, import.field_name
            )));
        }
        Ok(())
    }

    fn check_import_limits(declared: &Limits, actual: &Limits) -> Result<()> {
        if actual.initial < declared.initial {
            return Err(Error::link(format!(
                "actual size ({}) smaller than declared ({})",
                actual.initial, declared.initial
            )));
        }
        if let Some(declared_max) = declared.max {
            match actual.max {
                None => {
                    return Err(Error::link(format!(
                        "max size (unspecified) larger than declared ({declared_max})"
                    )));
                }
                Some(actual_max) if actual_max > declared_max => {
                    return Err(Error::link(format!(
                        "max size ({actual_max}) larger than declared ({declared_max})"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    /// The interpreter addresses locals relative to the top of the
    /// value stack, counting the parameters and locals that sit below
    /// the operand region.
    fn translate_local_index(&self, local_index: u32) -> Result<u32> {
        let func = self.cur_func()?;
        Ok(
            (self.typechecker.type_stack_size() + func.param_and_local_types.len()) as u32
                - local_index,
        )
    }
}

impl BinaryReaderDelegate for Translator<'_> {
    fn on_type_count(&mut self, count: u32) -> Result<()> {
        for _ in 0..count {
            let env_index = EnvSigIndex::new(self.env.sigs.len());
            self.env.sigs.push(FuncSignature::default());
            self.sig_index_mapping.push(env_index);
        }
        Ok(())
    }

    fn on_type(
        &mut self,
        index: TypeIndex,
        params: &[ValueType],
        results: &[ValueType],
    ) -> Result<()> {
        let env_index = self.sig_env_index(index)?;
        let sig = &mut self.env.sigs[env_index.index()];
        sig.params.extend_from_slice(params);
        sig.results.extend_from_slice(results);
        Ok(())
    }

    fn on_import_count(&mut self, _count: u32) -> Result<()> {
        Ok(())
    }

    fn on_import(&mut self, _index: u32, module_name: &str, field_name: &str) -> Result<()> {
        self.resolved_import = None;
        let module_index = match self.env.registered.get(module_name) {
            Some(index) => *index,
            None => {
                return Err(Error::link(format!(
                    "unknown import module \"{module_name}\""
                )));
            }
        };

        let imported = &self.env.modules[module_index.index()];
        let resolved = match imported.export(field_name) {
            // a previous import may already have materialised this
            // field of a host module; reuse its slot
            Some(export) => ResolvedImport::Native {
                kind: export.kind,
                index: export.index,
            },
            None if imported.is_host() => ResolvedImport::Host {
                module: module_index,
            },
            None => {
                return Err(Error::link(format!(
                    "unknown module field \"{field_name}\""
                )));
            }
        };

        let kind = match &resolved {
            ResolvedImport::Native { kind, .. } => Some(*kind),
            ResolvedImport::Host { .. } => None,
        };
        self.module_mut().imports.push(Import {
            module_name: module_name.to_string(),
            field_name: field_name.to_string(),
            kind,
        });
        self.resolved_import = Some(resolved);
        Ok(())
    }

    fn on_import_func(&mut self, import_index: u32, sig_index: TypeIndex) -> Result<()> {
        let sig_env = self.sig_env_index(sig_index)?;
        let resolved = self.take_resolved_import()?;
        let mut import = self.import_record(import_index)?;

        let func_env_index = match resolved {
            ResolvedImport::Host { module } => {
                import.kind = Some(ExternalKind::Func);
                let mut func = HostFunc {
                    module_name: import.module_name.clone(),
                    field_name: import.field_name.clone(),
                    sig_index: sig_env,
                    callback: None,
                };
                let sig = self.env.sigs[sig_env.index()].clone();
                let delegate = self
                    .env
                    .host_delegate_mut(module)
                    .ok_or_else(|| Error::validation("import resolved to a non-host module"))?;
                delegate.import_func(&import, &sig, &mut func).map_err(|msg| Error::link(msg))?;
                if func.callback.is_none() {
                    return Err(Error::link(format!(
                        "host import \"{}.{}\" did not provide a callback",
                        import.module_name, import.field_name
                    )));
                }
                let env_index = EnvFuncIndex::new(self.env.funcs.len());
                self.env.funcs.push(Func::Host(func));
                self.env.modules[module.index()].append_export(
                    ExternalKind::Func,
                    env_index.index() as u32,
                    &import.field_name,
                )?;
                env_index
            }
            ResolvedImport::Native { kind, index } => {
                Self::check_import_kind(&import, kind, ExternalKind::Func)?;
                let env_index = EnvFuncIndex::new(index as usize);
                let actual_sig = self
                    .env
                    .funcs
                    .get(env_index.index())
                    .ok_or_else(|| Error::validation("export index out of range"))?
                    .sig_index();
                if self.env.sigs[actual_sig.index()] != self.env.sigs[sig_env.index()] {
                    return Err(Error::link("import signature mismatch"));
                }
                env_index
            }
        };

        self.module_mut().imports[import_index as usize].kind = Some(ExternalKind::Func);
        self.func_index_mapping.push(func_env_index);
        self.num_func_imports += 1;
        Ok(())
    }

    fn on_import_table(&mut self, import_index: u32, limits: Limits) -> Result<()> {
        if self.module().table_index.is_some() {
            return Err(Error::validation("only one table allowed"));
        }
        let resolved = self.take_resolved_import()?;
        let import = self.import_record(import_index)?;

        let table_env_index = match resolved {
            ResolvedImport::Host { module } => {
                let mut table = Table::new(limits);
                let delegate = self
                    .env
                    .host_delegate_mut(module)
                    .ok_or_else(|| Error::validation("import resolved to a non-host module"))?;
                delegate.import_table(&import, &mut table).map_err(|msg| Error::link(msg))?;
                Self::check_import_limits(&limits, &table.limits)?;
                let env_index = EnvTableIndex::new(self.env.tables.len());
                self.env.tables.push(table);
                self.env.modules[module.index()].append_export(
                    ExternalKind::Table,
                    env_index.index() as u32,
                    &import.field_name,
                )?;
                env_index
            }
            ResolvedImport::Native { kind, index } => {
                Self::check_import_kind(&import, kind, ExternalKind::Table)?;
                let env_index = EnvTableIndex::new(index as usize);
                let table = self
                    .env
                    .tables
                    .get(env_index.index())
                    .ok_or_else(|| Error::validation("export index out of range"))?;
                Self::check_import_limits(&limits, &table.limits)?;
                env_index
            }
        };

        self.module_mut().imports[import_index as usize].kind = Some(ExternalKind::Table);
        self.module_mut().table_index = Some(table_env_index);
        Ok(())
    }

    fn on_import_memory(&mut self, import_index: u32, limits: Limits) -> Result<()> {
        if self.module().memory_index.is_some() {
            return Err(Error::validation("only one memory allowed"));
        }
        let resolved = self.take_resolved_import()?;
        let import = self.import_record(import_index)?;

        let memory_env_index = match resolved {
            ResolvedImport::Host { module } => {
                let mut memory = Memory::default();
                let delegate = self
                    .env
                    .host_delegate_mut(module)
                    .ok_or_else(|| Error::validation("import resolved to a non-host module"))?;
                delegate.import_memory(&import, &mut memory).map_err(|msg| Error::link(msg))?;
                Self::check_import_limits(&limits, &memory.page_limits)?;
                let env_index = EnvMemoryIndex::new(self.env.memories.len());
                self.env.memories.push(memory);
                self.env.modules[module.index()].append_export(
                    ExternalKind::Memory,
                    env_index.index() as u32,
                    &import.field_name,
                )?;
                env_index
            }
            ResolvedImport::Native { kind, index } => {
                Self::check_import_kind(&import, kind, ExternalKind::Memory)?;
                let env_index = EnvMemoryIndex::new(index as usize);
                let memory = self
                    .env
                    .memories
                    .get(env_index.index())
                    .ok_or_else(|| Error::validation("export index out of range"))?;
                Self::check_import_limits(&limits, &memory.page_limits)?;
                env_index
            }
        };

        self.module_mut().imports[import_index as usize].kind = Some(ExternalKind::Memory);
        self.module_mut().memory_index = Some(memory_env_index);
        Ok(())
    }

    fn on_import_global(&mut self, import_index: u32, ty: ValueType, mutable: bool) -> Result<()> {
        let resolved = self.take_resolved_import()?;
        let import = self.import_record(import_index)?;

        let global_env_index = match resolved {
            ResolvedImport::Host { module } => {
                let mut global = Global {
                    value: Value::default_of(ty),
                    mutable,
                };
                let delegate = self
                    .env
                    .host_delegate_mut(module)
                    .ok_or_else(|| Error::validation("import resolved to a non-host module"))?;
                delegate.import_global(&import, &mut global).map_err(|msg| Error::link(msg))?;
                let env_index = EnvGlobalIndex::new(self.env.globals.len());
                self.env.globals.push(global);
                self.env.modules[module.index()].append_export(
                    ExternalKind::Global,
                    env_index.index() as u32,
                    &import.field_name,
                )?;
                env_index
            }
            ResolvedImport::Native { kind, index } => {
                Self::check_import_kind(&import, kind, ExternalKind::Global)?;
                let env_index = EnvGlobalIndex::new(index as usize);
                let global = self
                    .env
                    .globals
                    .get(env_index.index())
                    .ok_or_else(|| Error::validation("export index out of range"))?;
                if global.value.ty() != ty || global.mutable != mutable {
                    return Err(Error::link(format!(
                        "global import type mismatch in \"{}.{}\"",
                        import.module_name, import.field_name
                    )));
                }
                env_index
            }
        };

        self.module_mut().imports[import_index as usize].kind = Some(ExternalKind::Global);
        self.global_index_mapping.push(global_env_index);
        self.num_global_imports += 1;
        Ok(())
    }

    fn on_function_count(&mut self, count: u32) -> Result<()> {
        let base = self.env.funcs.len();
        for i in 0..count as usize {
            self.func_index_mapping.push(EnvFuncIndex::new(base + i));
            self.func_fixups.push(Vec::new());
        }
        Ok(())
    }

    fn on_function(&mut self, _index: FuncIndex, sig_index: TypeIndex) -> Result<()> {
        let sig_env = self.sig_env_index(sig_index)?;
        self.env.funcs.push(Func::Defined(DefinedFunc::new(sig_env)));
        Ok(())
    }

    fn on_table(&mut self, _index: u32, limits: Limits) -> Result<()> {
        if self.module().table_index.is_some() {
            return Err(Error::validation("only one table allowed"));
        }
        let env_index = EnvTableIndex::new(self.env.tables.len());
        self.env.tables.push(Table::new(limits));
        self.module_mut().table_index = Some(env_index);
        Ok(())
    }

    fn on_memory(&mut self, _index: u32, limits: Limits) -> Result<()> {
        if self.module().memory_index.is_some() {
            return Err(Error::validation("only one memory allowed"));
        }
        let env_index = EnvMemoryIndex::new(self.env.memories.len());
        self.env.memories.push(Memory::new(limits));
        self.module_mut().memory_index = Some(env_index);
        Ok(())
    }

    fn on_global_count(&mut self, count: u32) -> Result<()> {
        let base = self.env.globals.len();
        for i in 0..count as usize {
            self.global_index_mapping.push(EnvGlobalIndex::new(base + i));
            self.env.globals.push(Global {
                value: Value::I32(0),
                mutable: false,
            });
        }
        Ok(())
    }

    fn begin_global(&mut self, index: GlobalIndex, ty: ValueType, mutable: bool) -> Result<()> {
        let env_index = self.global_env_index(index)?;
        let global = &mut self.env.globals[env_index.index()];
        global.value = Value::default_of(ty);
        global.mutable = mutable;
        self.init_expr_value = None;
        Ok(())
    }

    fn end_global_init_expr(&mut self, index: GlobalIndex) -> Result<()> {
        let env_index = self.global_env_index(index)?;
        let declared = self.env.globals[env_index.index()].value.ty();
        let value = match self.init_expr_value {
            Some(value) if value.ty() == declared => value,
            Some(value) => {
                return Err(Error::validation(format!(
                    "type mismatch in global, expected {declared} but got {}",
                    value.ty()
                )));
            }
            None => {
                return Err(Error::validation(format!(
                    "type mismatch in global, expected {declared} but got void"
                )));
            }
        };
        self.env.globals[env_index.index()].value = value;
        Ok(())
    }

    fn on_init_expr_i32_const(&mut self, value: u32) -> Result<()> {
        self.init_expr_value = Some(Value::I32(value));
        Ok(())
    }

    fn on_init_expr_i64_const(&mut self, value: u64) -> Result<()> {
        self.init_expr_value = Some(Value::I64(value));
        Ok(())
    }

    fn on_init_expr_f32_const(&mut self, value_bits: u32) -> Result<()> {
        self.init_expr_value = Some(Value::F32(value_bits));
        Ok(())
    }

    fn on_init_expr_f64_const(&mut self, value_bits: u64) -> Result<()> {
        self.init_expr_value = Some(Value::F64(value_bits));
        Ok(())
    }

    fn on_init_expr_get_global(&mut self, global_index: GlobalIndex) -> Result<()> {
        if global_index.index() as u32 >= self.num_global_imports {
            return Err(Error::link(
                "initializer expression can only reference an imported global",
            ));
        }
        let env_index = self.global_env_index(global_index)?;
        let global = &self.env.globals[env_index.index()];
        if global.mutable {
            return Err(Error::link(
                "initializer expression cannot reference a mutable global",
            ));
        }
        self.init_expr_value = Some(global.value);
        Ok(())
    }

    fn on_export(
        &mut self,
        _index: u32,
        kind: ExternalKind,
        item_index: u32,
        name: &str,
    ) -> Result<()> {
        let env_index = match kind {
            ExternalKind::Func => self
                .func_env_index(FuncIndex::from_u32(item_index))?
                .index() as u32,
            ExternalKind::Table => self
                .module()
                .table_index
                .ok_or_else(|| Error::validation("module does not have a table to export"))?
                .index() as u32,
            ExternalKind::Memory => self
                .module()
                .memory_index
                .ok_or_else(|| Error::validation("module does not have a memory to export"))?
                .index() as u32,
            ExternalKind::Global => {
                let env_index = self.global_env_index(GlobalIndex::from_u32(item_index))?;
                if self.env.globals[env_index.index()].mutable {
                    return Err(Error::link("mutable globals cannot be exported"));
                }
                env_index.index() as u32
            }
        };
        self.module_mut().append_export(kind, env_index, name)
    }

    fn on_start_function(&mut self, func_index: FuncIndex) -> Result<()> {
        let env_index = self.func_env_index(func_index)?;
        let sig_index = self.env.funcs[env_index.index()].sig_index();
        let sig = &self.env.sigs[sig_index.index()];
        if !sig.params.is_empty() {
            return Err(Error::validation("start function must be nullary"));
        }
        if !sig.results.is_empty() {
            return Err(Error::validation("start function must not return anything"));
        }
        self.module_mut().set_start_func(env_index);
        Ok(())
    }

    fn end_elem_segment_init_expr(&mut self, _index: u32) -> Result<()> {
        match self.init_expr_value {
            Some(Value::I32(offset)) => {
                self.table_offset = offset;
                Ok(())
            }
            Some(value) => Err(Error::validation(format!(
                "type mismatch in elem segment, expected i32 but got {}",
                value.ty()
            ))),
            None => Err(Error::validation(
                "type mismatch in elem segment, expected i32 but got void",
            )),
        }
    }

    fn on_elem_segment_function_index(
        &mut self,
        _index: u32,
        func_index: FuncIndex,
    ) -> Result<()> {
        let table_index = self
            .module()
            .table_index
            .ok_or_else(|| Error::validation("element segment requires a table"))?;
        let table_size = self.env.tables[table_index.index()].func_indexes.len();
        let dst = self.table_offset;
        if dst as usize >= table_size {
            return Err(Error::validation(format!(
                "elem segment offset is out of bounds: {dst} >= max value {table_size}"
            )));
        }
        let func = self.func_env_index(func_index)?;
        self.elem_segment_infos.push(ElemSegmentInfo {
            table: table_index,
            dst,
            func,
        });
        self.table_offset += 1;
        Ok(())
    }

    fn on_data_segment_data(&mut self, _index: u32, data: &[u8]) -> Result<()> {
        let memory_index = self
            .module()
            .memory_index
            .ok_or_else(|| Error::validation("data segment requires a memory"))?;
        let address = match self.init_expr_value {
            Some(Value::I32(address)) => address,
            Some(value) => {
                return Err(Error::validation(format!(
                    "type mismatch in data segment, expected i32 but got {}",
                    value.ty()
                )));
            }
            None => {
                return Err(Error::validation(
                    "type mismatch in data segment, expected i32 but got void",
                ));
            }
        };
        let memory_size = self.env.memories[memory_index.index()].data.len() as u64;
        let end_address = u64::from(address) + data.len() as u64;
        if end_address > memory_size {
            return Err(Error::validation(format!(
                "data segment is out of bounds: [{address}, {end_address}) >= max value \
                 {memory_size}"
            )));
        }
        if !data.is_empty() {
            self.data_segment_infos.push(DataSegmentInfo {
                memory: memory_index,
                dst: address,
                data: data.to_vec(),
            });
        }
        Ok(())
    }

    fn begin_function_body(&mut self, index: FuncIndex) -> Result<()> {
        let env_index = self.func_env_index(index)?;
        let defined_index = self.defined_func_index(index)?;
        let offset = self.writer.current_offset();

        let sig_index = {
            let func = self.env.funcs[env_index.index()]
                .as_defined_mut()
                .ok_or_else(|| Error::validation("function body for an imported function"))?;
            func.offset = Some(offset);
            func.sig_index
        };
        log::trace!(
            "translating function {} at istream offset {offset:#x}",
            index.index()
        );

        self.depth_fixups.clear();
        self.label_stack.clear();

        // resolve calls that were emitted before this body was seen
        let fixups = mem::take(
            self.func_fixups
                .get_mut(defined_index)
                .ok_or_else(|| Error::validation("function body without declaration"))?,
        );
        for fixup in fixups {
            self.writer.patch_u32(fixup, offset);
        }

        let sig = &self.env.sigs[sig_index.index()];
        let params = sig.params.clone();
        let results = sig.results.clone();
        self.current_func = Some(CurrentFunc {
            env_index,
            param_and_local_types: params,
            local_decl_count: 0,
            local_count: 0,
        });

        self.typechecker.begin_function(&results);
        // implicit function label; a branch to it is a return
        self.push_label(None, None);
        Ok(())
    }

    fn on_local_decl_count(&mut self, count: u32) -> Result<()> {
        self.cur_func_mut()?.local_decl_count = count;
        Ok(())
    }

    fn on_local_decl(&mut self, decl_index: u32, count: u32, ty: ValueType) -> Result<()> {
        let (is_last, local_count) = {
            let func = self.cur_func_mut()?;
            func.local_count += count;
            for _ in 0..count {
                func.param_and_local_types.push(ty);
            }
            (decl_index + 1 == func.local_decl_count, func.local_count)
        };
        if is_last {
            // reserve interpreter stack space for all locals at once
            self.emit_opcode(Opcode::Alloca);
            self.writer.emit_u32(local_count);
        }
        Ok(())
    }

    fn end_function_body(&mut self, _index: FuncIndex) -> Result<()> {
        self.fixup_top_label();
        let (drop, keep) = self.get_return_drop_keep_count()?;
        self.typechecker.end_function()?;
        self.emit_drop_keep(drop, keep);
        self.emit_opcode(Opcode::Return);
        self.pop_label();

        let finished = self
            .current_func
            .take()
            .ok_or_else(|| Error::validation("function body end without begin"))?;
        let func = self.env.funcs[finished.env_index.index()]
            .as_defined_mut()
            .ok_or_else(|| Error::validation("function body for an imported function"))?;
        func.local_decl_count = finished.local_decl_count;
        func.local_count = finished.local_count;
        func.param_and_local_types = finished.param_and_local_types;
        Ok(())
    }

    /* ---------------------- operator events ----------------------- */

    fn on_unary(&mut self, opcode: Opcode) -> Result<()> {
        self.typechecker.on_unary(opcode)?;
        self.emit_opcode(opcode);
        Ok(())
    }

    fn on_binary(&mut self, opcode: Opcode) -> Result<()> {
        self.typechecker.on_binary(opcode)?;
        self.emit_opcode(opcode);
        Ok(())
    }

    fn on_compare(&mut self, opcode: Opcode) -> Result<()> {
        self.typechecker.on_compare(opcode)?;
        self.emit_opcode(opcode);
        Ok(())
    }

    fn on_convert(&mut self, opcode: Opcode) -> Result<()> {
        self.typechecker.on_convert(opcode)?;
        self.emit_opcode(opcode);
        Ok(())
    }

    fn on_block(&mut self, sig: &[ValueType]) -> Result<()> {
        self.typechecker.on_block(sig)?;
        self.push_label(None, None);
        Ok(())
    }

    fn on_loop(&mut self, sig: &[ValueType]) -> Result<()> {
        self.typechecker.on_loop(sig)?;
        // backward branches re-enter here
        let offset = self.writer.current_offset();
        self.push_label(Some(offset), None);
        Ok(())
    }

    fn on_if(&mut self, sig: &[ValueType]) -> Result<()> {
        self.typechecker.on_if(sig)?;
        self.emit_opcode(Opcode::BrUnless);
        let fixup = self.writer.current_offset();
        self.writer.emit_u32(INVALID_ISTREAM_OFFSET);
        self.push_label(None, Some(fixup));
        Ok(())
    }

    fn on_else(&mut self) -> Result<()> {
        self.typechecker.on_else()?;
        let fixup_cond = {
            let label = self.top_label_mut()?;
            label
                .fixup_offset
                .take()
                .ok_or_else(|| Error::validation("else without matching if"))?
        };
        // terminate the then-branch with a jump to the end, and point
        // the if's conditional branch at the else-branch
        self.emit_opcode(Opcode::Br);
        let fixup = self.writer.current_offset();
        self.top_label_mut()?.fixup_offset = Some(fixup);
        self.writer.emit_u32(INVALID_ISTREAM_OFFSET);
        let offset = self.writer.current_offset();
        self.writer.patch_u32(fixup_cond, offset);
        Ok(())
    }

    fn on_end(&mut self) -> Result<()> {
        let kind = self.typechecker.label(0)?.kind;
        self.typechecker.on_end()?;
        if matches!(kind, LabelKind::If | LabelKind::Else) {
            let offset = self.writer.current_offset();
            let fixup = self.top_label_mut()?.fixup_offset.take();
            if let Some(fixup) = fixup {
                self.writer.patch_u32(fixup, offset);
            }
        }
        self.fixup_top_label();
        self.pop_label();
        Ok(())
    }

    fn on_br(&mut self, depth: u32) -> Result<()> {
        // compute before the typechecker pops the branch operands
        let (drop, keep) = self.get_br_drop_keep_count(depth)?;
        self.typechecker.on_br(depth)?;
        self.emit_br(depth, drop, keep)
    }

    fn on_br_if(&mut self, depth: u32) -> Result<()> {
        self.typechecker.on_br_if(depth)?;
        let (drop, keep) = self.get_br_drop_keep_count(depth)?;
        // flip the condition so a taken br_if can drop values
        self.emit_opcode(Opcode::BrUnless);
        let fixup = self.writer.current_offset();
        self.writer.emit_u32(INVALID_ISTREAM_OFFSET);
        self.emit_br(depth, drop, keep)?;
        let offset = self.writer.current_offset();
        self.writer.patch_u32(fixup, offset);
        Ok(())
    }

    fn on_br_table(&mut self, target_depths: &[u32], default_depth: u32) -> Result<()> {
        self.typechecker.begin_br_table()?;
        self.emit_opcode(Opcode::BrTable);
        self.writer.emit_u32(target_depths.len() as u32);
        let fixup_table = self.writer.current_offset();
        self.writer.emit_u32(INVALID_ISTREAM_OFFSET);
        // not needed by the interpreter, but it makes the stream
        // disassemblable: the data opcode spans the entry table
        self.emit_opcode(Opcode::Data);
        self.writer
            .emit_u32((target_depths.len() as u32 + 1) * BR_TABLE_ENTRY_SIZE);
        let table_start = self.writer.current_offset();
        self.writer.patch_u32(fixup_table, table_start);

        for depth in target_depths.iter().copied().chain(iter::once(default_depth)) {
            self.typechecker.on_br_table_target(depth)?;
            self.emit_br_table_offset(depth)?;
        }

        self.typechecker.end_br_table()?;
        Ok(())
    }

    fn on_call(&mut self, func_index: FuncIndex) -> Result<()> {
        let env_index = self.func_env_index(func_index)?;
        let sig_index = self.env.funcs[env_index.index()].sig_index();
        {
            let sig = &self.env.sigs[sig_index.index()];
            self.typechecker.on_call(&sig.params, &sig.results)?;
        }

        if self.env.funcs[env_index.index()].is_host() {
            self.emit_opcode(Opcode::CallHost);
            self.writer.emit_u32(env_index.index() as u32);
        } else {
            self.emit_opcode(Opcode::Call);
            self.emit_func_offset(func_index)?;
        }
        Ok(())
    }

    fn on_call_indirect(&mut self, sig_index: TypeIndex) -> Result<()> {
        let table_index = self
            .module()
            .table_index
            .ok_or_else(|| Error::validation("found call_indirect operator, but no table"))?;
        let sig_env = self.sig_env_index(sig_index)?;
        {
            let sig = &self.env.sigs[sig_env.index()];
            self.typechecker.on_call_indirect(&sig.params, &sig.results)?;
        }
        self.emit_opcode(Opcode::CallIndirect);
        self.writer.emit_u32(table_index.index() as u32);
        self.writer.emit_u32(sig_env.index() as u32);
        Ok(())
    }

    fn on_drop(&mut self) -> Result<()> {
        self.typechecker.on_drop()?;
        self.emit_opcode(Opcode::Drop);
        Ok(())
    }

    fn on_select(&mut self) -> Result<()> {
        self.typechecker.on_select()?;
        self.emit_opcode(Opcode::Select);
        Ok(())
    }

    fn on_nop(&mut self) -> Result<()> {
        self.emit_opcode(Opcode::Nop);
        Ok(())
    }

    fn on_unreachable(&mut self) -> Result<()> {
        self.typechecker.on_unreachable()?;
        self.emit_opcode(Opcode::Unreachable);
        Ok(())
    }

    fn on_return(&mut self) -> Result<()> {
        let (drop, keep) = self.get_return_drop_keep_count()?;
        self.typechecker.on_return()?;
        self.emit_drop_keep(drop, keep);
        self.emit_opcode(Opcode::Return);
        Ok(())
    }

    fn on_i32_const(&mut self, value: u32) -> Result<()> {
        self.typechecker.on_const(ValueType::I32)?;
        self.emit_opcode(Opcode::I32Const);
        self.writer.emit_u32(value);
        Ok(())
    }

    fn on_i64_const(&mut self, value: u64) -> Result<()> {
        self.typechecker.on_const(ValueType::I64)?;
        self.emit_opcode(Opcode::I64Const);
        self.writer.emit_u64(value);
        Ok(())
    }

    fn on_f32_const(&mut self, value_bits: u32) -> Result<()> {
        self.typechecker.on_const(ValueType::F32)?;
        self.emit_opcode(Opcode::F32Const);
        self.writer.emit_u32(value_bits);
        Ok(())
    }

    fn on_f64_const(&mut self, value_bits: u64) -> Result<()> {
        self.typechecker.on_const(ValueType::F64)?;
        self.emit_opcode(Opcode::F64Const);
        self.writer.emit_u64(value_bits);
        Ok(())
    }

    fn on_get_local(&mut self, local_index: u32) -> Result<()> {
        self.check_local(local_index)?;
        let ty = self.cur_func()?.param_and_local_types[local_index as usize];
        // capture the translated index before the typechecker grows
        // the stack; it is relative to the pre-push height
        let translated = self.translate_local_index(local_index)?;
        self.typechecker.on_get_local(ty)?;
        self.emit_opcode(Opcode::GetLocal);
        self.writer.emit_u32(translated);
        Ok(())
    }

    fn on_set_local(&mut self, local_index: u32) -> Result<()> {
        self.check_local(local_index)?;
        let ty = self.cur_func()?.param_and_local_types[local_index as usize];
        self.typechecker.on_set_local(ty)?;
        let translated = self.translate_local_index(local_index)?;
        self.emit_opcode(Opcode::SetLocal);
        self.writer.emit_u32(translated);
        Ok(())
    }

    fn on_tee_local(&mut self, local_index: u32) -> Result<()> {
        self.check_local(local_index)?;
        let ty = self.cur_func()?.param_and_local_types[local_index as usize];
        self.typechecker.on_tee_local(ty)?;
        let translated = self.translate_local_index(local_index)?;
        self.emit_opcode(Opcode::TeeLocal);
        self.writer.emit_u32(translated);
        Ok(())
    }

    fn on_get_global(&mut self, global_index: GlobalIndex) -> Result<()> {
        let env_index = self.global_env_index(global_index)?;
        let ty = self.env.globals[env_index.index()].value.ty();
        self.typechecker.on_get_global(ty)?;
        self.emit_opcode(Opcode::GetGlobal);
        self.writer.emit_u32(env_index.index() as u32);
        Ok(())
    }

    fn on_set_global(&mut self, global_index: GlobalIndex) -> Result<()> {
        let env_index = self.global_env_index(global_index)?;
        let global = &self.env.globals[env_index.index()];
        if !global.mutable {
            return Err(Error::validation(format!(
                "can't set_global on immutable global at index {}",
                global_index.index()
            )));
        }
        let ty = global.value.ty();
        self.typechecker.on_set_global(ty)?;
        self.emit_opcode(Opcode::SetGlobal);
        self.writer.emit_u32(env_index.index() as u32);
        Ok(())
    }

    fn on_load(&mut self, opcode: Opcode, alignment_log2: u32, offset: u32) -> Result<()> {
        let memory_index = self.check_has_memory(opcode)?;
        let natural = opcode
            .memory_access_size()
            .ok_or_else(|| Error::validation(format!("{} is not a load", opcode.name())))?;
        self.check_align(alignment_log2, natural)?;
        self.typechecker.on_load(opcode)?;
        self.emit_opcode(opcode);
        self.writer.emit_u32(memory_index.index() as u32);
        self.writer.emit_u32(offset);
        Ok(())
    }

    fn on_store(&mut self, opcode: Opcode, alignment_log2: u32, offset: u32) -> Result<()> {
        let memory_index = self.check_has_memory(opcode)?;
        let natural = opcode
            .memory_access_size()
            .ok_or_else(|| Error::validation(format!("{} is not a store", opcode.name())))?;
        self.check_align(alignment_log2, natural)?;
        self.typechecker.on_store(opcode)?;
        self.emit_opcode(opcode);
        self.writer.emit_u32(memory_index.index() as u32);
        self.writer.emit_u32(offset);
        Ok(())
    }

    fn on_current_memory(&mut self) -> Result<()> {
        let memory_index = self.check_has_memory(Opcode::CurrentMemory)?;
        self.typechecker.on_current_memory()?;
        self.emit_opcode(Opcode::CurrentMemory);
        self.writer.emit_u32(memory_index.index() as u32);
        Ok(())
    }

    fn on_grow_memory(&mut self) -> Result<()> {
        let memory_index = self.check_has_memory(Opcode::GrowMemory)?;
        self.typechecker.on_grow_memory()?;
        self.emit_opcode(Opcode::GrowMemory);
        self.writer.emit_u32(memory_index.index() as u32);
        Ok(())
    }

    /// The commit phase: the staged element and data segment edits
    /// are the only writes translation ever performs on environment
    /// tables and memories, and they happen only here.
    fn end_module(&mut self) -> Result<()> {
        for info in self.elem_segment_infos.drain(..) {
            self.env.tables[info.table.index()].func_indexes[info.dst as usize] =
                Some(info.func);
        }
        for info in self.data_segment_infos.drain(..) {
            let memory = &mut self.env.memories[info.memory.index()];
            let dst = info.dst as usize;
            memory.data[dst..dst + info.data.len()].copy_from_slice(&info.data);
        }
        Ok(())
    }
}
