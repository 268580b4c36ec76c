//! Integration tests driving the public API with modules assembled
//! from text.

mod errors;
mod imports;
mod segments;
mod translate;

use wasm_interp::{translate_module, Environment, ModuleIndex};

/// Translates a module into a fresh environment, panicking on any
/// failure.
pub fn translate(wat: &str) -> (Environment, ModuleIndex) {
    let wasm = wat::parse_str(wat).unwrap();
    let mut env = Environment::new();
    let index = translate_module(&mut env, &wasm).unwrap();
    (env, index)
}

/// Translates a module into an existing environment.
pub fn translate_into(env: &mut Environment, wat: &str) -> wasm_interp::Result<ModuleIndex> {
    let wasm = wat::parse_str(wat).unwrap();
    translate_module(env, &wasm)
}

/// The istream slice occupied by a translated module.
pub fn module_istream(env: &Environment, index: ModuleIndex) -> &[u8] {
    let (start, end) = env.module(index).istream_range().unwrap();
    &env.istream()[start as usize..end as usize]
}

/// Expects translation of `wat` to fail, returning the error message.
pub fn translate_err(wat: &str) -> String {
    let wasm = wat::parse_str(wat).unwrap();
    let mut env = Environment::new();
    let err = translate_module(&mut env, &wasm).unwrap_err();
    err.to_string()
}

pub fn op(opcode: wasm_interp::Opcode) -> u8 {
    opcode as u8
}
