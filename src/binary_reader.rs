//! Streaming decoder for the WebAssembly binary format (MVP subset).
//!
//! The reader walks a byte slice section by section and reports what
//! it finds to a [`BinaryReaderDelegate`]. It checks the binary's
//! framing (magic, section order and sizes, LEB encodings, opcode
//! validity) and bounds attacker-controlled sizes, but performs no
//! linking, type checking or code generation itself; those are the
//! delegate's business. Any event handler may fail, which aborts the
//! read immediately.

use crate::error::{Error, Result};
use crate::indices::{FuncIndex, GlobalIndex, TypeIndex};
use crate::opcode::Opcode;
use crate::types::{ExternalKind, Limits, ValueType, WASM_MAX_PAGES};

const WASM_MAGIC: u32 = 0x6d73_6100; // "\0asm"
const WASM_VERSION: u32 = 1;

const CUSTOM_SECTION: u8 = 0;
const TYPE_SECTION: u8 = 1;
const IMPORT_SECTION: u8 = 2;
const FUNCTION_SECTION: u8 = 3;
const TABLE_SECTION: u8 = 4;
const MEMORY_SECTION: u8 = 5;
const GLOBAL_SECTION: u8 = 6;
const EXPORT_SECTION: u8 = 7;
const START_SECTION: u8 = 8;
const ELEMENT_SECTION: u8 = 9;
const CODE_SECTION: u8 = 10;
const DATA_SECTION: u8 = 11;

// Bounds on sizes a hostile binary could otherwise inflate at will.
const MAX_STRING_BYTES: u32 = 100_000;
const MAX_TABLE_ENTRIES: u32 = 10_000_000;
const MAX_FUNCTION_LOCALS: u32 = 50_000;

/// Receives the semantic events of one module, in binary order.
///
/// Section-level events arrive as a count (where the consumer needs
/// to reserve space) followed by per-entry events; function bodies
/// arrive as begin/local-decl/operator/end sequences; initializer
/// expressions arrive as one event per constant operator between the
/// events of the entity they initialize.
pub trait BinaryReaderDelegate {
    fn on_type_count(&mut self, count: u32) -> Result<()>;
    fn on_type(
        &mut self,
        index: TypeIndex,
        params: &[ValueType],
        results: &[ValueType],
    ) -> Result<()>;

    fn on_import_count(&mut self, count: u32) -> Result<()>;
    fn on_import(&mut self, index: u32, module_name: &str, field_name: &str) -> Result<()>;
    fn on_import_func(&mut self, import_index: u32, sig_index: TypeIndex) -> Result<()>;
    fn on_import_table(&mut self, import_index: u32, limits: Limits) -> Result<()>;
    fn on_import_memory(&mut self, import_index: u32, limits: Limits) -> Result<()>;
    fn on_import_global(
        &mut self,
        import_index: u32,
        ty: ValueType,
        mutable: bool,
    ) -> Result<()>;

    fn on_function_count(&mut self, count: u32) -> Result<()>;
    fn on_function(&mut self, index: FuncIndex, sig_index: TypeIndex) -> Result<()>;

    fn on_table(&mut self, index: u32, limits: Limits) -> Result<()>;
    fn on_memory(&mut self, index: u32, limits: Limits) -> Result<()>;

    fn on_global_count(&mut self, count: u32) -> Result<()>;
    fn begin_global(&mut self, index: GlobalIndex, ty: ValueType, mutable: bool) -> Result<()>;
    fn end_global_init_expr(&mut self, index: GlobalIndex) -> Result<()>;

    fn on_init_expr_i32_const(&mut self, value: u32) -> Result<()>;
    fn on_init_expr_i64_const(&mut self, value: u64) -> Result<()>;
    fn on_init_expr_f32_const(&mut self, value_bits: u32) -> Result<()>;
    fn on_init_expr_f64_const(&mut self, value_bits: u64) -> Result<()>;
    fn on_init_expr_get_global(&mut self, global_index: GlobalIndex) -> Result<()>;

    fn on_export(
        &mut self,
        index: u32,
        kind: ExternalKind,
        item_index: u32,
        name: &str,
    ) -> Result<()>;

    fn on_start_function(&mut self, func_index: FuncIndex) -> Result<()>;

    fn end_elem_segment_init_expr(&mut self, index: u32) -> Result<()>;
    fn on_elem_segment_function_index(&mut self, index: u32, func_index: FuncIndex)
        -> Result<()>;

    fn on_data_segment_data(&mut self, index: u32, data: &[u8]) -> Result<()>;

    fn begin_function_body(&mut self, index: FuncIndex) -> Result<()>;
    fn on_local_decl_count(&mut self, count: u32) -> Result<()>;
    fn on_local_decl(&mut self, decl_index: u32, count: u32, ty: ValueType) -> Result<()>;
    fn end_function_body(&mut self, index: FuncIndex) -> Result<()>;

    fn on_unary(&mut self, opcode: Opcode) -> Result<()>;
    fn on_binary(&mut self, opcode: Opcode) -> Result<()>;
    fn on_compare(&mut self, opcode: Opcode) -> Result<()>;
    fn on_convert(&mut self, opcode: Opcode) -> Result<()>;

    fn on_block(&mut self, sig: &[ValueType]) -> Result<()>;
    fn on_loop(&mut self, sig: &[ValueType]) -> Result<()>;
    fn on_if(&mut self, sig: &[ValueType]) -> Result<()>;
    fn on_else(&mut self) -> Result<()>;
    fn on_end(&mut self) -> Result<()>;

    fn on_br(&mut self, depth: u32) -> Result<()>;
    fn on_br_if(&mut self, depth: u32) -> Result<()>;
    fn on_br_table(&mut self, target_depths: &[u32], default_depth: u32) -> Result<()>;

    fn on_call(&mut self, func_index: FuncIndex) -> Result<()>;
    fn on_call_indirect(&mut self, sig_index: TypeIndex) -> Result<()>;

    fn on_drop(&mut self) -> Result<()>;
    fn on_select(&mut self) -> Result<()>;
    fn on_nop(&mut self) -> Result<()>;
    fn on_unreachable(&mut self) -> Result<()>;
    fn on_return(&mut self) -> Result<()>;

    fn on_i32_const(&mut self, value: u32) -> Result<()>;
    fn on_i64_const(&mut self, value: u64) -> Result<()>;
    fn on_f32_const(&mut self, value_bits: u32) -> Result<()>;
    fn on_f64_const(&mut self, value_bits: u64) -> Result<()>;

    fn on_get_local(&mut self, local_index: u32) -> Result<()>;
    fn on_set_local(&mut self, local_index: u32) -> Result<()>;
    fn on_tee_local(&mut self, local_index: u32) -> Result<()>;
    fn on_get_global(&mut self, global_index: GlobalIndex) -> Result<()>;
    fn on_set_global(&mut self, global_index: GlobalIndex) -> Result<()>;

    fn on_load(&mut self, opcode: Opcode, alignment_log2: u32, offset: u32) -> Result<()>;
    fn on_store(&mut self, opcode: Opcode, alignment_log2: u32, offset: u32) -> Result<()>;
    fn on_current_memory(&mut self) -> Result<()>;
    fn on_grow_memory(&mut self) -> Result<()>;

    fn end_module(&mut self) -> Result<()>;
}

/// Reads one binary module out of `data`, reporting every event to
/// `delegate`.
pub fn read_binary(data: &[u8], delegate: &mut dyn BinaryReaderDelegate) -> Result<()> {
    BinaryReader::new(data).read_module(delegate)
}

struct BinaryReader<'a> {
    bytes: &'a [u8],
    pos: usize,
    num_func_imports: u32,
    num_global_imports: u32,
    num_funcs: u32,
    num_func_bodies: u32,
}

impl<'a> BinaryReader<'a> {
    fn new(bytes: &'a [u8]) -> BinaryReader<'a> {
        BinaryReader {
            bytes,
            pos: 0,
            num_func_imports: 0,
            num_global_imports: 0,
            num_funcs: 0,
            num_func_bodies: 0,
        }
    }

    fn fail(&self, message: impl Into<String>) -> Error {
        Error::invalid(self.pos, message)
    }

    fn at_end(&self) -> bool {
        self.pos == self.bytes.len()
    }

    fn ensure_bytes(&self, len: usize) -> Result<()> {
        if self.bytes.len() - self.pos < len {
            Err(self.fail("unexpected end of file"))
        } else {
            Ok(())
        }
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.ensure_bytes(1)?;
        let byte = self.bytes[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.ensure_bytes(len)?;
        let bytes = &self.bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.read_bytes(8)?;
        let mut buf = [0; 8];
        buf.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(buf))
    }

    fn read_u32_leb128(&mut self) -> Result<u32> {
        let mut result: u64 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 35 {
                return Err(self.fail("malformed LEB128 integer"));
            }
        }
        u32::try_from(result).map_err(|_| self.fail("LEB128 integer out of range"))
    }

    fn read_u64_leb128(&mut self) -> Result<u64> {
        let mut result: u128 = 0;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            result |= u128::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
            if shift >= 70 {
                return Err(self.fail("malformed LEB128 integer"));
            }
        }
        u64::try_from(result).map_err(|_| self.fail("LEB128 integer out of range"))
    }

    fn read_i32_leb128(&mut self) -> Result<i32> {
        let mut result: i32 = 0;
        let mut shift = 0;
        let mut byte;
        loop {
            byte = self.read_u8()?;
            result |= i32::from(byte & 0x7f).wrapping_shl(shift);
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
            if shift >= 35 {
                return Err(self.fail("malformed LEB128 integer"));
            }
        }
        if shift < 32 && byte & 0x40 != 0 {
            result |= (!0i32).wrapping_shl(shift);
        }
        Ok(result)
    }

    fn read_i64_leb128(&mut self) -> Result<i64> {
        let mut result: i64 = 0;
        let mut shift = 0;
        let mut byte;
        loop {
            byte = self.read_u8()?;
            result |= i64::from(byte & 0x7f).wrapping_shl(shift);
            shift += 7;
            if byte & 0x80 == 0 {
                break;
            }
            if shift >= 70 {
                return Err(self.fail("malformed LEB128 integer"));
            }
        }
        if shift < 64 && byte & 0x40 != 0 {
            result |= (!0i64).wrapping_shl(shift);
        }
        Ok(result)
    }

    fn read_str(&mut self) -> Result<&'a str> {
        let len = self.read_u32_leb128()?;
        if len > MAX_STRING_BYTES {
            return Err(self.fail("string size too large"));
        }
        let bytes = self.read_bytes(len as usize)?;
        std::str::from_utf8(bytes).map_err(|_| self.fail("invalid UTF-8 encoding"))
    }

    fn read_value_type(&mut self) -> Result<ValueType> {
        let byte = self.read_u8()?;
        match byte {
            0x7f => Ok(ValueType::I32),
            0x7e => Ok(ValueType::I64),
            0x7d => Ok(ValueType::F32),
            0x7c => Ok(ValueType::F64),
            _ => Err(self.fail(format!("bad value type {byte:#x}"))),
        }
    }

    fn read_mutability(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0x00 => Ok(false),
            0x01 => Ok(true),
            byte => Err(self.fail(format!("global mutability must be 0 or 1, got {byte}"))),
        }
    }

    fn read_limits(&mut self) -> Result<Limits> {
        let flags = self.read_u32_leb128()?;
        let limits = match flags {
            0x00 => Limits::at_least(self.read_u32_leb128()?),
            0x01 => {
                let initial = self.read_u32_leb128()?;
                let max = self.read_u32_leb128()?;
                Limits {
                    initial,
                    max: Some(max),
                }
            }
            _ => return Err(self.fail(format!("bad limits flags {flags:#x}"))),
        };
        if let Some(max) = limits.max {
            if max < limits.initial {
                return Err(self.fail(format!(
                    "max size ({max}) smaller than initial size ({})",
                    limits.initial
                )));
            }
        }
        Ok(limits)
    }

    fn read_table_limits(&mut self) -> Result<Limits> {
        let elem_type = self.read_u8()?;
        if elem_type != 0x70 {
            return Err(self.fail(format!("bad table element type {elem_type:#x}")));
        }
        let limits = self.read_limits()?;
        if limits.initial > MAX_TABLE_ENTRIES {
            return Err(self.fail("table initial size exceeds implementation limit"));
        }
        Ok(limits)
    }

    fn read_memory_limits(&mut self) -> Result<Limits> {
        let limits = self.read_limits()?;
        if limits.initial > WASM_MAX_PAGES || limits.max.map_or(false, |m| m > WASM_MAX_PAGES) {
            return Err(self.fail("memory size exceeds maximum"));
        }
        Ok(limits)
    }

    fn read_module(&mut self, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        let magic = self.read_u32()?;
        if magic != WASM_MAGIC {
            return Err(self.fail("bad magic value"));
        }
        let version = self.read_u32()?;
        if version != WASM_VERSION {
            return Err(self.fail(format!(
                "bad wasm file version {version:#x} (expected {WASM_VERSION:#x})"
            )));
        }

        let mut last_section = CUSTOM_SECTION;
        while !self.at_end() {
            let id = self.read_u8()?;
            let size = self.read_u32_leb128()? as usize;
            self.ensure_bytes(size)?;
            let section_end = self.pos + size;

            if id != CUSTOM_SECTION {
                if id > DATA_SECTION {
                    return Err(self.fail(format!("invalid section id {id}")));
                }
                if id <= last_section {
                    return Err(self.fail(format!("section {id} out of order")));
                }
                last_section = id;
            }

            match id {
                CUSTOM_SECTION => {
                    // Name payloads and the like carry no runtime
                    // semantics in this subset.
                    log::debug!("skipping custom section ({size} bytes)");
                    self.pos = section_end;
                }
                TYPE_SECTION => self.read_type_section(d)?,
                IMPORT_SECTION => self.read_import_section(d)?,
                FUNCTION_SECTION => self.read_function_section(d)?,
                TABLE_SECTION => self.read_table_section(d)?,
                MEMORY_SECTION => self.read_memory_section(d)?,
                GLOBAL_SECTION => self.read_global_section(d)?,
                EXPORT_SECTION => self.read_export_section(d)?,
                START_SECTION => self.read_start_section(d)?,
                ELEMENT_SECTION => self.read_element_section(d)?,
                CODE_SECTION => self.read_code_section(d)?,
                DATA_SECTION => self.read_data_section(d)?,
                _ => return Err(self.fail(format!("invalid section id {id}"))),
            }

            if self.pos != section_end {
                return Err(self.fail(format!("section {id} size mismatch")));
            }
        }

        if self.num_funcs != self.num_func_bodies {
            return Err(self.fail(format!(
                "function signature count != function body count ({} != {})",
                self.num_funcs, self.num_func_bodies
            )));
        }

        d.end_module()
    }

    fn read_type_section(&mut self, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        let count = self.read_u32_leb128()?;
        log::debug!("type section: {count} entries");
        d.on_type_count(count)?;
        for i in 0..count {
            let form = self.read_u8()?;
            if form != 0x60 {
                return Err(self.fail(format!("bad type form {form:#x}")));
            }
            let num_params = self.read_u32_leb128()?;
            self.ensure_bytes(num_params as usize)?;
            let params = (0..num_params)
                .map(|_| self.read_value_type())
                .collect::<Result<Vec<_>>>()?;
            let num_results = self.read_u32_leb128()?;
            if num_results > 1 {
                return Err(self.fail("result count must be 0 or 1"));
            }
            let results = (0..num_results)
                .map(|_| self.read_value_type())
                .collect::<Result<Vec<_>>>()?;
            d.on_type(TypeIndex::from_u32(i), &params, &results)?;
        }
        Ok(())
    }

    fn read_import_section(&mut self, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        let count = self.read_u32_leb128()?;
        log::debug!("import section: {count} entries");
        d.on_import_count(count)?;
        for i in 0..count {
            let module_name = self.read_str()?;
            let field_name = self.read_str()?;
            d.on_import(i, module_name, field_name)?;
            let kind = self.read_u8()?;
            match kind {
                0x00 => {
                    let sig_index = self.read_u32_leb128()?;
                    self.num_func_imports += 1;
                    d.on_import_func(i, TypeIndex::from_u32(sig_index))?;
                }
                0x01 => {
                    let limits = self.read_table_limits()?;
                    d.on_import_table(i, limits)?;
                }
                0x02 => {
                    let limits = self.read_memory_limits()?;
                    d.on_import_memory(i, limits)?;
                }
                0x03 => {
                    let ty = self.read_value_type()?;
                    let mutable = self.read_mutability()?;
                    self.num_global_imports += 1;
                    d.on_import_global(i, ty, mutable)?;
                }
                _ => return Err(self.fail(format!("invalid import kind {kind}"))),
            }
        }
        Ok(())
    }

    fn read_function_section(&mut self, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        let count = self.read_u32_leb128()?;
        log::debug!("function section: {count} entries");
        self.num_funcs = count;
        d.on_function_count(count)?;
        for i in 0..count {
            let sig_index = self.read_u32_leb128()?;
            d.on_function(
                FuncIndex::from_u32(self.num_func_imports + i),
                TypeIndex::from_u32(sig_index),
            )?;
        }
        Ok(())
    }

    fn read_table_section(&mut self, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        let count = self.read_u32_leb128()?;
        log::debug!("table section: {count} entries");
        for i in 0..count {
            let limits = self.read_table_limits()?;
            d.on_table(i, limits)?;
        }
        Ok(())
    }

    fn read_memory_section(&mut self, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        let count = self.read_u32_leb128()?;
        log::debug!("memory section: {count} entries");
        for i in 0..count {
            let limits = self.read_memory_limits()?;
            d.on_memory(i, limits)?;
        }
        Ok(())
    }

    fn read_global_section(&mut self, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        let count = self.read_u32_leb128()?;
        log::debug!("global section: {count} entries");
        d.on_global_count(count)?;
        for i in 0..count {
            let ty = self.read_value_type()?;
            let mutable = self.read_mutability()?;
            // indices are module-local: imported globals come first
            let index = GlobalIndex::from_u32(self.num_global_imports + i);
            d.begin_global(index, ty, mutable)?;
            self.read_init_expr(d)?;
            d.end_global_init_expr(index)?;
        }
        Ok(())
    }

    fn read_init_expr(&mut self, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        let mut seen_op = false;
        loop {
            let byte = self.read_u8()?;
            match byte {
                0x0b => break,
                0x23 => {
                    let index = self.read_u32_leb128()?;
                    d.on_init_expr_get_global(GlobalIndex::from_u32(index))?;
                }
                0x41 => d.on_init_expr_i32_const(self.read_i32_leb128()? as u32)?,
                0x42 => d.on_init_expr_i64_const(self.read_i64_leb128()? as u64)?,
                0x43 => d.on_init_expr_f32_const(self.read_u32()?)?,
                0x44 => d.on_init_expr_f64_const(self.read_u64()?)?,
                _ => {
                    return Err(self.fail(format!(
                        "unexpected opcode in initializer expression: {byte:#x}"
                    )));
                }
            }
            seen_op = true;
        }
        if !seen_op {
            return Err(self.fail("initializer expression cannot be empty"));
        }
        Ok(())
    }

    fn read_export_section(&mut self, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        let count = self.read_u32_leb128()?;
        log::debug!("export section: {count} entries");
        for i in 0..count {
            let name = self.read_str()?;
            let kind = match self.read_u8()? {
                0x00 => ExternalKind::Func,
                0x01 => ExternalKind::Table,
                0x02 => ExternalKind::Memory,
                0x03 => ExternalKind::Global,
                byte => return Err(self.fail(format!("invalid export kind {byte}"))),
            };
            let item_index = self.read_u32_leb128()?;
            d.on_export(i, kind, item_index, name)?;
        }
        Ok(())
    }

    fn read_start_section(&mut self, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        let func_index = self.read_u32_leb128()?;
        d.on_start_function(FuncIndex::from_u32(func_index))
    }

    fn read_element_section(&mut self, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        let count = self.read_u32_leb128()?;
        log::debug!("element section: {count} entries");
        for i in 0..count {
            let table_index = self.read_u32_leb128()?;
            if table_index != 0 {
                return Err(self.fail(format!("table index must be 0, got {table_index}")));
            }
            self.read_init_expr(d)?;
            d.end_elem_segment_init_expr(i)?;
            let num_funcs = self.read_u32_leb128()?;
            self.ensure_bytes(num_funcs as usize)?;
            for _ in 0..num_funcs {
                let func_index = self.read_u32_leb128()?;
                d.on_elem_segment_function_index(i, FuncIndex::from_u32(func_index))?;
            }
        }
        Ok(())
    }

    fn read_code_section(&mut self, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        let count = self.read_u32_leb128()?;
        log::debug!("code section: {count} entries");
        self.num_func_bodies = count;
        for i in 0..count {
            let body_size = self.read_u32_leb128()? as usize;
            self.ensure_bytes(body_size)?;
            let body_end = self.pos + body_size;
            let index = FuncIndex::from_u32(self.num_func_imports + i);
            d.begin_function_body(index)?;
            self.read_local_decls(d)?;
            let mut seen_end = false;
            while self.pos < body_end {
                let byte = self.read_u8()?;
                if byte == 0x0b && self.pos == body_end {
                    seen_end = true;
                    break;
                }
                self.read_operator(byte, d)?;
            }
            if !seen_end {
                return Err(self.fail("function body must end with END opcode"));
            }
            d.end_function_body(index)?;
        }
        Ok(())
    }

    fn read_data_section(&mut self, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        let count = self.read_u32_leb128()?;
        log::debug!("data section: {count} entries");
        for i in 0..count {
            let memory_index = self.read_u32_leb128()?;
            if memory_index != 0 {
                return Err(self.fail(format!("memory index must be 0, got {memory_index}")));
            }
            self.read_init_expr(d)?;
            let len = self.read_u32_leb128()? as usize;
            let data = self.read_bytes(len)?;
            d.on_data_segment_data(i, data)?;
        }
        Ok(())
    }

    fn read_local_decls(&mut self, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        let decl_count = self.read_u32_leb128()?;
        d.on_local_decl_count(decl_count)?;
        let mut total: u32 = 0;
        for i in 0..decl_count {
            let count = self.read_u32_leb128()?;
            let ty = self.read_value_type()?;
            total = total
                .checked_add(count)
                .filter(|&t| t <= MAX_FUNCTION_LOCALS)
                .ok_or_else(|| self.fail("too many locals"))?;
            d.on_local_decl(i, count, ty)?;
        }
        Ok(())
    }

    fn read_block_sig(&mut self) -> Result<Option<ValueType>> {
        let byte = self.read_u8()?;
        if byte == 0x40 {
            return Ok(None);
        }
        // rewind one byte and reuse the value-type decoder
        self.pos -= 1;
        Ok(Some(self.read_value_type()?))
    }

    fn read_operator(&mut self, byte: u8, d: &mut dyn BinaryReaderDelegate) -> Result<()> {
        match byte {
            0x00 => d.on_unreachable(),
            0x01 => d.on_nop(),
            0x02 => {
                let sig = self.read_block_sig()?;
                d.on_block(sig_slice(&sig))
            }
            0x03 => {
                let sig = self.read_block_sig()?;
                d.on_loop(sig_slice(&sig))
            }
            0x04 => {
                let sig = self.read_block_sig()?;
                d.on_if(sig_slice(&sig))
            }
            0x05 => d.on_else(),
            0x0b => d.on_end(),
            0x0c => {
                let depth = self.read_u32_leb128()?;
                d.on_br(depth)
            }
            0x0d => {
                let depth = self.read_u32_leb128()?;
                d.on_br_if(depth)
            }
            0x0e => {
                let num_targets = self.read_u32_leb128()?;
                self.ensure_bytes(num_targets as usize)?;
                let targets = (0..num_targets)
                    .map(|_| self.read_u32_leb128())
                    .collect::<Result<Vec<_>>>()?;
                let default_depth = self.read_u32_leb128()?;
                d.on_br_table(&targets, default_depth)
            }
            0x0f => d.on_return(),
            0x10 => {
                let func_index = self.read_u32_leb128()?;
                d.on_call(FuncIndex::from_u32(func_index))
            }
            0x11 => {
                let sig_index = self.read_u32_leb128()?;
                let reserved = self.read_u32_leb128()?;
                if reserved != 0 {
                    return Err(self.fail("call_indirect reserved value must be 0"));
                }
                d.on_call_indirect(TypeIndex::from_u32(sig_index))
            }
            0x1a => d.on_drop(),
            0x1b => d.on_select(),
            0x20 => {
                let local_index = self.read_u32_leb128()?;
                d.on_get_local(local_index)
            }
            0x21 => {
                let local_index = self.read_u32_leb128()?;
                d.on_set_local(local_index)
            }
            0x22 => {
                let local_index = self.read_u32_leb128()?;
                d.on_tee_local(local_index)
            }
            0x23 => {
                let global_index = self.read_u32_leb128()?;
                d.on_get_global(GlobalIndex::from_u32(global_index))
            }
            0x24 => {
                let global_index = self.read_u32_leb128()?;
                d.on_set_global(GlobalIndex::from_u32(global_index))
            }
            0x28..=0x3e => {
                let alignment_log2 = self.read_u32_leb128()?;
                let offset = self.read_u32_leb128()?;
                let opcode = self.opcode_from_byte(byte)?;
                if byte <= 0x35 {
                    d.on_load(opcode, alignment_log2, offset)
                } else {
                    d.on_store(opcode, alignment_log2, offset)
                }
            }
            0x3f => {
                let reserved = self.read_u32_leb128()?;
                if reserved != 0 {
                    return Err(self.fail("current_memory reserved value must be 0"));
                }
                d.on_current_memory()
            }
            0x40 => {
                let reserved = self.read_u32_leb128()?;
                if reserved != 0 {
                    return Err(self.fail("grow_memory reserved value must be 0"));
                }
                d.on_grow_memory()
            }
            0x41 => {
                let value = self.read_i32_leb128()?;
                d.on_i32_const(value as u32)
            }
            0x42 => {
                let value = self.read_i64_leb128()?;
                d.on_i64_const(value as u64)
            }
            0x43 => {
                let bits = self.read_u32()?;
                d.on_f32_const(bits)
            }
            0x44 => {
                let bits = self.read_u64()?;
                d.on_f64_const(bits)
            }
            0x45..=0xbf => {
                let opcode = self.opcode_from_byte(byte)?;
                match byte {
                    0x45 | 0x50 | 0xa7..=0xbf => d.on_convert(opcode),
                    0x46..=0x4f | 0x51..=0x5a | 0x5b..=0x66 => d.on_compare(opcode),
                    0x67..=0x69 | 0x79..=0x7b | 0x8b..=0x91 | 0x99..=0x9f => d.on_unary(opcode),
                    _ => d.on_binary(opcode),
                }
            }
            _ => Err(self.fail(format!("invalid opcode {byte:#x}"))),
        }
    }

    fn opcode_from_byte(&self, byte: u8) -> Result<Opcode> {
        Opcode::from_u8(byte).ok_or_else(|| self.fail(format!("invalid opcode {byte:#x}")))
    }
}

fn sig_slice(sig: &Option<ValueType>) -> &[ValueType] {
    match sig {
        Some(ty) => std::slice::from_ref(ty),
        None => &[],
    }
}
