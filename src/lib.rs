//! A WebAssembly loader for a stack-based interpreter.
//!
//! This crate reads validated WebAssembly binaries and turns them
//! into two things an interpreter needs: a compact little-endian
//! bytecode (the "istream") and the runtime metadata — signatures,
//! functions, tables, memories, globals, exports — that the bytecode
//! refers to. Multiple modules load into one shared [`Environment`]
//! and can import each other's exports by registered name; host
//! modules supply their contents through a [`HostImportDelegate`].
//!
//! Loading is transactional: [`translate_module`] snapshots the
//! environment, streams the binary through the translator, and either
//! commits the new module (including its deferred element- and
//! data-segment writes) or truncates the environment back to the
//! snapshot, leaving it exactly as it was.
//!
//! ```
//! use wasm_interp::{translate_module, Environment};
//!
//! let wasm = wat::parse_str("(module (func (export \"answer\") (result i32) i32.const 42))")?;
//! let mut env = Environment::new();
//! let module = translate_module(&mut env, &wasm)?;
//! assert!(env.module(module).export("answer").is_some());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod binary_reader;
mod environment;
mod error;
mod indices;
mod istream;
mod opcode;
mod translate;
mod typecheck;
mod types;

pub use crate::binary_reader::{read_binary, BinaryReaderDelegate};
pub use crate::environment::{
    DefinedFunc, Environment, EnvironmentMark, Export, Func, Global, HostFunc, HostFuncCallback,
    HostImportDelegate, Import, Memory, Module, Table,
};
pub use crate::error::{Error, Result};
pub use crate::indices::{
    DefinedFuncIndex, EnvFuncIndex, EnvGlobalIndex, EnvMemoryIndex, EnvSigIndex, EnvTableIndex,
    FuncIndex, GlobalIndex, ModuleIndex, TypeIndex,
};
pub use crate::istream::{IstreamOffset, IstreamWriter, INVALID_ISTREAM_OFFSET};
pub use crate::opcode::Opcode;
pub use crate::translate::translate_module;
pub use crate::typecheck::{CheckerLabel, LabelKind, TypeChecker};
pub use crate::types::{
    ExternalKind, FuncSignature, Limits, Value, ValueType, WASM_MAX_PAGES, WASM_PAGE_SIZE,
};
