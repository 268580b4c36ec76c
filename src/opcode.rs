//! The istream opcode space.
//!
//! Istream opcodes are a single byte. Wasm MVP operators keep their
//! binary numbering so pure arithmetic operators pass through
//! translation unchanged; the interpreter-only opcodes (`alloca`,
//! `br_unless`, `call_host`, `data`, `drop_keep`) live above the MVP
//! range.

use crate::types::ValueType;

macro_rules! define_opcodes {
    ($( $(#[$attr:meta])* $name:ident = $val:literal $text:literal; )*) => {
        /// A single-byte istream opcode.
        #[repr(u8)]
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub enum Opcode {
            $( $(#[$attr])* $name = $val, )*
        }

        impl Opcode {
            /// Decodes an opcode from its byte encoding.
            pub fn from_u8(byte: u8) -> Option<Opcode> {
                match byte {
                    $( $val => Some(Opcode::$name), )*
                    _ => None,
                }
            }

            /// The text-format name of this opcode.
            pub fn name(self) -> &'static str {
                match self {
                    $( Opcode::$name => $text, )*
                }
            }
        }
    };
}

define_opcodes! {
    Unreachable = 0x00 "unreachable";
    Nop = 0x01 "nop";
    Block = 0x02 "block";
    Loop = 0x03 "loop";
    If = 0x04 "if";
    Else = 0x05 "else";
    End = 0x0b "end";
    Br = 0x0c "br";
    BrIf = 0x0d "br_if";
    BrTable = 0x0e "br_table";
    Return = 0x0f "return";
    Call = 0x10 "call";
    CallIndirect = 0x11 "call_indirect";
    Drop = 0x1a "drop";
    Select = 0x1b "select";
    GetLocal = 0x20 "get_local";
    SetLocal = 0x21 "set_local";
    TeeLocal = 0x22 "tee_local";
    GetGlobal = 0x23 "get_global";
    SetGlobal = 0x24 "set_global";
    I32Load = 0x28 "i32.load";
    I64Load = 0x29 "i64.load";
    F32Load = 0x2a "f32.load";
    F64Load = 0x2b "f64.load";
    I32Load8S = 0x2c "i32.load8_s";
    I32Load8U = 0x2d "i32.load8_u";
    I32Load16S = 0x2e "i32.load16_s";
    I32Load16U = 0x2f "i32.load16_u";
    I64Load8S = 0x30 "i64.load8_s";
    I64Load8U = 0x31 "i64.load8_u";
    I64Load16S = 0x32 "i64.load16_s";
    I64Load16U = 0x33 "i64.load16_u";
    I64Load32S = 0x34 "i64.load32_s";
    I64Load32U = 0x35 "i64.load32_u";
    I32Store = 0x36 "i32.store";
    I64Store = 0x37 "i64.store";
    F32Store = 0x38 "f32.store";
    F64Store = 0x39 "f64.store";
    I32Store8 = 0x3a "i32.store8";
    I32Store16 = 0x3b "i32.store16";
    I64Store8 = 0x3c "i64.store8";
    I64Store16 = 0x3d "i64.store16";
    I64Store32 = 0x3e "i64.store32";
    CurrentMemory = 0x3f "current_memory";
    GrowMemory = 0x40 "grow_memory";
    I32Const = 0x41 "i32.const";
    I64Const = 0x42 "i64.const";
    F32Const = 0x43 "f32.const";
    F64Const = 0x44 "f64.const";
    I32Eqz = 0x45 "i32.eqz";
    I32Eq = 0x46 "i32.eq";
    I32Ne = 0x47 "i32.ne";
    I32LtS = 0x48 "i32.lt_s";
    I32LtU = 0x49 "i32.lt_u";
    I32GtS = 0x4a "i32.gt_s";
    I32GtU = 0x4b "i32.gt_u";
    I32LeS = 0x4c "i32.le_s";
    I32LeU = 0x4d "i32.le_u";
    I32GeS = 0x4e "i32.ge_s";
    I32GeU = 0x4f "i32.ge_u";
    I64Eqz = 0x50 "i64.eqz";
    I64Eq = 0x51 "i64.eq";
    I64Ne = 0x52 "i64.ne";
    I64LtS = 0x53 "i64.lt_s";
    I64LtU = 0x54 "i64.lt_u";
    I64GtS = 0x55 "i64.gt_s";
    I64GtU = 0x56 "i64.gt_u";
    I64LeS = 0x57 "i64.le_s";
    I64LeU = 0x58 "i64.le_u";
    I64GeS = 0x59 "i64.ge_s";
    I64GeU = 0x5a "i64.ge_u";
    F32Eq = 0x5b "f32.eq";
    F32Ne = 0x5c "f32.ne";
    F32Lt = 0x5d "f32.lt";
    F32Gt = 0x5e "f32.gt";
    F32Le = 0x5f "f32.le";
    F32Ge = 0x60 "f32.ge";
    F64Eq = 0x61 "f64.eq";
    F64Ne = 0x62 "f64.ne";
    F64Lt = 0x63 "f64.lt";
    F64Gt = 0x64 "f64.gt";
    F64Le = 0x65 "f64.le";
    F64Ge = 0x66 "f64.ge";
    I32Clz = 0x67 "i32.clz";
    I32Ctz = 0x68 "i32.ctz";
    I32Popcnt = 0x69 "i32.popcnt";
    I32Add = 0x6a "i32.add";
    I32Sub = 0x6b "i32.sub";
    I32Mul = 0x6c "i32.mul";
    I32DivS = 0x6d "i32.div_s";
    I32DivU = 0x6e "i32.div_u";
    I32RemS = 0x6f "i32.rem_s";
    I32RemU = 0x70 "i32.rem_u";
    I32And = 0x71 "i32.and";
    I32Or = 0x72 "i32.or";
    I32Xor = 0x73 "i32.xor";
    I32Shl = 0x74 "i32.shl";
    I32ShrS = 0x75 "i32.shr_s";
    I32ShrU = 0x76 "i32.shr_u";
    I32Rotl = 0x77 "i32.rotl";
    I32Rotr = 0x78 "i32.rotr";
    I64Clz = 0x79 "i64.clz";
    I64Ctz = 0x7a "i64.ctz";
    I64Popcnt = 0x7b "i64.popcnt";
    I64Add = 0x7c "i64.add";
    I64Sub = 0x7d "i64.sub";
    I64Mul = 0x7e "i64.mul";
    I64DivS = 0x7f "i64.div_s";
    I64DivU = 0x80 "i64.div_u";
    I64RemS = 0x81 "i64.rem_s";
    I64RemU = 0x82 "i64.rem_u";
    I64And = 0x83 "i64.and";
    I64Or = 0x84 "i64.or";
    I64Xor = 0x85 "i64.xor";
    I64Shl = 0x86 "i64.shl";
    I64ShrS = 0x87 "i64.shr_s";
    I64ShrU = 0x88 "i64.shr_u";
    I64Rotl = 0x89 "i64.rotl";
    I64Rotr = 0x8a "i64.rotr";
    F32Abs = 0x8b "f32.abs";
    F32Neg = 0x8c "f32.neg";
    F32Ceil = 0x8d "f32.ceil";
    F32Floor = 0x8e "f32.floor";
    F32Trunc = 0x8f "f32.trunc";
    F32Nearest = 0x90 "f32.nearest";
    F32Sqrt = 0x91 "f32.sqrt";
    F32Add = 0x92 "f32.add";
    F32Sub = 0x93 "f32.sub";
    F32Mul = 0x94 "f32.mul";
    F32Div = 0x95 "f32.div";
    F32Min = 0x96 "f32.min";
    F32Max = 0x97 "f32.max";
    F32Copysign = 0x98 "f32.copysign";
    F64Abs = 0x99 "f64.abs";
    F64Neg = 0x9a "f64.neg";
    F64Ceil = 0x9b "f64.ceil";
    F64Floor = 0x9c "f64.floor";
    F64Trunc = 0x9d "f64.trunc";
    F64Nearest = 0x9e "f64.nearest";
    F64Sqrt = 0x9f "f64.sqrt";
    F64Add = 0xa0 "f64.add";
    F64Sub = 0xa1 "f64.sub";
    F64Mul = 0xa2 "f64.mul";
    F64Div = 0xa3 "f64.div";
    F64Min = 0xa4 "f64.min";
    F64Max = 0xa5 "f64.max";
    F64Copysign = 0xa6 "f64.copysign";
    I32WrapI64 = 0xa7 "i32.wrap/i64";
    I32TruncSF32 = 0xa8 "i32.trunc_s/f32";
    I32TruncUF32 = 0xa9 "i32.trunc_u/f32";
    I32TruncSF64 = 0xaa "i32.trunc_s/f64";
    I32TruncUF64 = 0xab "i32.trunc_u/f64";
    I64ExtendSI32 = 0xac "i64.extend_s/i32";
    I64ExtendUI32 = 0xad "i64.extend_u/i32";
    I64TruncSF32 = 0xae "i64.trunc_s/f32";
    I64TruncUF32 = 0xaf "i64.trunc_u/f32";
    I64TruncSF64 = 0xb0 "i64.trunc_s/f64";
    I64TruncUF64 = 0xb1 "i64.trunc_u/f64";
    F32ConvertSI32 = 0xb2 "f32.convert_s/i32";
    F32ConvertUI32 = 0xb3 "f32.convert_u/i32";
    F32ConvertSI64 = 0xb4 "f32.convert_s/i64";
    F32ConvertUI64 = 0xb5 "f32.convert_u/i64";
    F32DemoteF64 = 0xb6 "f32.demote/f64";
    F64ConvertSI32 = 0xb7 "f64.convert_s/i32";
    F64ConvertUI32 = 0xb8 "f64.convert_u/i32";
    F64ConvertSI64 = 0xb9 "f64.convert_s/i64";
    F64ConvertUI64 = 0xba "f64.convert_u/i64";
    F64PromoteF32 = 0xbb "f64.promote/f32";
    I32ReinterpretF32 = 0xbc "i32.reinterpret/f32";
    I64ReinterpretF64 = 0xbd "i64.reinterpret/f64";
    F32ReinterpretI32 = 0xbe "f32.reinterpret/i32";
    F64ReinterpretI64 = 0xbf "f64.reinterpret/i64";
    /// Reserves interpreter stack space for a function's locals.
    Alloca = 0xc0 "alloca";
    /// Branches when the popped condition is zero.
    BrUnless = 0xc1 "br_unless";
    /// Calls a host function by environment index.
    CallHost = 0xc2 "call_host";
    /// Marks a run of inline data; purely annotative.
    Data = 0xc3 "data";
    /// Drops `n` values, optionally preserving the top one.
    DropKeep = 0xc4 "drop_keep";
}

impl Opcode {
    /// Natural alignment in bytes of a load or store, or `None` for
    /// opcodes that do not access memory.
    pub fn memory_access_size(self) -> Option<u32> {
        use Opcode::*;
        Some(match self {
            I32Load8S | I32Load8U | I64Load8S | I64Load8U | I32Store8 | I64Store8 => 1,
            I32Load16S | I32Load16U | I64Load16S | I64Load16U | I32Store16 | I64Store16 => 2,
            I32Load | F32Load | I64Load32S | I64Load32U | I32Store | F32Store | I64Store32 => 4,
            I64Load | F64Load | I64Store | F64Store => 8,
            _ => return None,
        })
    }

    /// Operand and result types of the operators whose typing does
    /// not depend on surrounding context: the unary/binary/compare/
    /// convert families, loads, stores and the memory queries.
    pub(crate) fn stack_signature(
        self,
    ) -> Option<(&'static [ValueType], &'static [ValueType])> {
        use crate::types::ValueType::*;
        use Opcode::*;
        Some(match self {
            I32Eqz | I32Clz | I32Ctz | I32Popcnt => (&[I32], &[I32]),
            I32Eq | I32Ne | I32LtS | I32LtU | I32GtS | I32GtU | I32LeS | I32LeU | I32GeS
            | I32GeU | I32Add | I32Sub | I32Mul | I32DivS | I32DivU | I32RemS | I32RemU
            | I32And | I32Or | I32Xor | I32Shl | I32ShrS | I32ShrU | I32Rotl | I32Rotr => {
                (&[I32, I32], &[I32])
            }
            I64Eqz => (&[I64], &[I32]),
            I64Eq | I64Ne | I64LtS | I64LtU | I64GtS | I64GtU | I64LeS | I64LeU | I64GeS
            | I64GeU => (&[I64, I64], &[I32]),
            I64Clz | I64Ctz | I64Popcnt => (&[I64], &[I64]),
            I64Add | I64Sub | I64Mul | I64DivS | I64DivU | I64RemS | I64RemU | I64And | I64Or
            | I64Xor | I64Shl | I64ShrS | I64ShrU | I64Rotl | I64Rotr => (&[I64, I64], &[I64]),
            F32Eq | F32Ne | F32Lt | F32Gt | F32Le | F32Ge => (&[F32, F32], &[I32]),
            F64Eq | F64Ne | F64Lt | F64Gt | F64Le | F64Ge => (&[F64, F64], &[I32]),
            F32Abs | F32Neg | F32Ceil | F32Floor | F32Trunc | F32Nearest | F32Sqrt => {
                (&[F32], &[F32])
            }
            F32Add | F32Sub | F32Mul | F32Div | F32Min | F32Max | F32Copysign => {
                (&[F32, F32], &[F32])
            }
            F64Abs | F64Neg | F64Ceil | F64Floor | F64Trunc | F64Nearest | F64Sqrt => {
                (&[F64], &[F64])
            }
            F64Add | F64Sub | F64Mul | F64Div | F64Min | F64Max | F64Copysign => {
                (&[F64, F64], &[F64])
            }
            I32WrapI64 => (&[I64], &[I32]),
            I32TruncSF32 | I32TruncUF32 | I32ReinterpretF32 => (&[F32], &[I32]),
            I32TruncSF64 | I32TruncUF64 => (&[F64], &[I32]),
            I64ExtendSI32 | I64ExtendUI32 => (&[I32], &[I64]),
            I64TruncSF32 | I64TruncUF32 => (&[F32], &[I64]),
            I64TruncSF64 | I64TruncUF64 | I64ReinterpretF64 => (&[F64], &[I64]),
            F32ConvertSI32 | F32ConvertUI32 | F32ReinterpretI32 => (&[I32], &[F32]),
            F32ConvertSI64 | F32ConvertUI64 => (&[I64], &[F32]),
            F32DemoteF64 => (&[F64], &[F32]),
            F64ConvertSI32 | F64ConvertUI32 => (&[I32], &[F64]),
            F64ConvertSI64 | F64ConvertUI64 | F64ReinterpretI64 => (&[I64], &[F64]),
            F64PromoteF32 => (&[F32], &[F64]),
            I32Load | I32Load8S | I32Load8U | I32Load16S | I32Load16U => (&[I32], &[I32]),
            I64Load | I64Load8S | I64Load8U | I64Load16S | I64Load16U | I64Load32S
            | I64Load32U => (&[I32], &[I64]),
            F32Load => (&[I32], &[F32]),
            F64Load => (&[I32], &[F64]),
            I32Store | I32Store8 | I32Store16 => (&[I32, I32], &[]),
            I64Store | I64Store8 | I64Store16 | I64Store32 => (&[I32, I64], &[]),
            F32Store => (&[I32, F32], &[]),
            F64Store => (&[I32, F64], &[]),
            CurrentMemory => (&[], &[I32]),
            GrowMemory => (&[I32], &[I32]),
            _ => return None,
        })
    }
}
