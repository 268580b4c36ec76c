//! Import resolution: native modules, host modules, kind and limit
//! checking.

use crate::{module_istream, op, translate_into};
use wasm_interp::{
    EnvFuncIndex, Environment, FuncSignature, Global, HostFunc, HostImportDelegate, Import,
    Limits, Memory, Opcode, Table, Value,
};

/// A well-behaved host module: installs a callback for every
/// function, accepts tables as created, provides a one-page memory
/// and an i32 global holding 13.
struct TestHost;

impl HostImportDelegate for TestHost {
    fn import_func(
        &mut self,
        _import: &Import,
        _sig: &FuncSignature,
        func: &mut HostFunc,
    ) -> Result<(), String> {
        func.callback = Some(Box::new(|_sig, _args| Ok(Vec::new())));
        Ok(())
    }

    fn import_table(&mut self, _import: &Import, _table: &mut Table) -> Result<(), String> {
        Ok(())
    }

    fn import_memory(&mut self, _import: &Import, memory: &mut Memory) -> Result<(), String> {
        *memory = Memory::new(Limits {
            initial: 1,
            max: Some(2),
        });
        Ok(())
    }

    fn import_global(&mut self, _import: &Import, global: &mut Global) -> Result<(), String> {
        global.value = Value::I32(13);
        Ok(())
    }
}

struct RefusingHost;

impl HostImportDelegate for RefusingHost {
    fn import_func(
        &mut self,
        import: &Import,
        _sig: &FuncSignature,
        _func: &mut HostFunc,
    ) -> Result<(), String> {
        Err(format!("no such function {}", import.field_name))
    }

    fn import_table(&mut self, _import: &Import, _table: &mut Table) -> Result<(), String> {
        Ok(())
    }

    fn import_memory(&mut self, _import: &Import, _memory: &mut Memory) -> Result<(), String> {
        Ok(())
    }

    fn import_global(&mut self, _import: &Import, _global: &mut Global) -> Result<(), String> {
        Ok(())
    }
}

/// Returns Ok but never installs a callback.
struct ForgetfulHost;

impl HostImportDelegate for ForgetfulHost {
    fn import_func(
        &mut self,
        _import: &Import,
        _sig: &FuncSignature,
        _func: &mut HostFunc,
    ) -> Result<(), String> {
        Ok(())
    }

    fn import_table(&mut self, _import: &Import, _table: &mut Table) -> Result<(), String> {
        Ok(())
    }

    fn import_memory(&mut self, _import: &Import, _memory: &mut Memory) -> Result<(), String> {
        Ok(())
    }

    fn import_global(&mut self, _import: &Import, _global: &mut Global) -> Result<(), String> {
        Ok(())
    }
}

fn err_importing(env: &mut Environment, wat: &str) -> String {
    translate_into(env, wat).unwrap_err().to_string()
}

#[test]
fn unknown_import_module() {
    let mut env = Environment::new();
    let message = err_importing(&mut env, r#"(module (import "nowhere" "f" (func)))"#);
    assert!(
        message.contains(r#"unknown import module "nowhere""#),
        "{message}"
    );
}

#[test]
fn unknown_module_field_rolls_back() {
    let mut env = Environment::new();
    let lib = translate_into(&mut env, r#"(module (func (export "present")))"#).unwrap();
    env.register_module("env", lib);
    let mark_funcs = env.num_funcs();
    let mark_modules = env.num_modules();
    let mark_istream = env.istream().len();

    let message = err_importing(&mut env, r#"(module (import "env" "foo" (func)))"#);
    assert!(message.contains(r#"unknown module field "foo""#), "{message}");
    assert_eq!(env.num_funcs(), mark_funcs);
    assert_eq!(env.num_modules(), mark_modules);
    assert_eq!(env.istream().len(), mark_istream);
}

#[test]
fn native_function_import_links_to_the_export() {
    let mut env = Environment::new();
    let lib = translate_into(
        &mut env,
        r#"(module (func (export "answer") (result i32) i32.const 42))"#,
    )
    .unwrap();
    env.register_module("lib", lib);

    let user = translate_into(
        &mut env,
        r#"
        (module
          (import "lib" "answer" (func $answer (result i32)))
          (func (export "run") (result i32) (call $answer)))
        "#,
    )
    .unwrap();

    // the imported function resolves to the library's code, so the
    // call targets its entry point rather than a call_host
    let (lib_start, _) = env.module(lib).istream_range().unwrap();
    let istream = module_istream(&env, user);
    assert_eq!(istream[0], op(Opcode::Call));
    assert_eq!(&istream[1..5], lib_start.to_le_bytes());
}

#[test]
fn import_kind_mismatch() {
    let mut env = Environment::new();
    let lib = translate_into(&mut env, r#"(module (func (export "f")))"#).unwrap();
    env.register_module("lib", lib);

    let message = err_importing(&mut env, r#"(module (import "lib" "f" (global i32)))"#);
    assert!(
        message.contains(r#"expected import "lib.f" to have kind global, not func"#),
        "{message}"
    );
}

#[test]
fn import_signature_mismatch() {
    let mut env = Environment::new();
    let lib = translate_into(&mut env, r#"(module (func (export "f")))"#).unwrap();
    env.register_module("lib", lib);

    let message = err_importing(&mut env, r#"(module (import "lib" "f" (func (param i32))))"#);
    assert!(message.contains("import signature mismatch"), "{message}");
}

#[test]
fn memory_import_checks_limits() {
    let mut env = Environment::new();
    let lib = translate_into(&mut env, r#"(module (memory (export "m") 1 2))"#).unwrap();
    env.register_module("lib", lib);

    let message = err_importing(&mut env, r#"(module (import "lib" "m" (memory 2)))"#);
    assert!(
        message.contains("actual size (1) smaller than declared (2)"),
        "{message}"
    );

    let message = err_importing(&mut env, r#"(module (import "lib" "m" (memory 1 1)))"#);
    assert!(
        message.contains("max size (2) larger than declared (1)"),
        "{message}"
    );

    translate_into(&mut env, r#"(module (import "lib" "m" (memory 1 2)))"#).unwrap();
}

#[test]
fn memory_import_requires_declared_max_to_exist() {
    let mut env = Environment::new();
    let lib = translate_into(&mut env, r#"(module (memory (export "m") 1))"#).unwrap();
    env.register_module("lib", lib);

    let message = err_importing(&mut env, r#"(module (import "lib" "m" (memory 1 4)))"#);
    assert!(
        message.contains("max size (unspecified) larger than declared (4)"),
        "{message}"
    );
}

#[test]
fn global_import_checks_type_and_mutability() {
    let mut env = Environment::new();
    let lib = translate_into(&mut env, r#"(module (global (export "g") i32 (i32.const 7)))"#)
        .unwrap();
    env.register_module("lib", lib);

    let message = err_importing(&mut env, r#"(module (import "lib" "g" (global f32)))"#);
    assert!(message.contains("global import type mismatch"), "{message}");

    let message = err_importing(&mut env, r#"(module (import "lib" "g" (global (mut i32))))"#);
    assert!(message.contains("global import type mismatch"), "{message}");

    translate_into(&mut env, r#"(module (import "lib" "g" (global i32)))"#).unwrap();
}

#[test]
fn imported_global_seeds_initializers() {
    let mut env = Environment::new();
    let lib = translate_into(&mut env, r#"(module (global (export "g") i32 (i32.const 7)))"#)
        .unwrap();
    env.register_module("lib", lib);

    translate_into(
        &mut env,
        r#"
        (module
          (import "lib" "g" (global i32))
          (global i32 (global.get 0)))
        "#,
    )
    .unwrap();

    assert_eq!(env.num_globals(), 2);
    let derived = env.global(wasm_interp::EnvGlobalIndex::from_u32(1));
    assert_eq!(derived.value, Value::I32(7));
}

#[test]
fn initializer_may_not_reference_defined_globals() {
    let mut env = Environment::new();
    let message = err_importing(
        &mut env,
        "(module (global i32 (i32.const 1)) (global i32 (global.get 0)))",
    );
    assert!(
        message.contains("can only reference an imported global"),
        "{message}"
    );
}

#[test]
fn host_imports_materialise_on_demand() {
    let mut env = Environment::new();
    let host = env.append_host_module("host", Box::new(TestHost));

    let module = translate_into(
        &mut env,
        r#"
        (module
          (import "host" "f" (func))
          (import "host" "g" (global i32))
          (func (export "run") (call 0)))
        "#,
    )
    .unwrap();

    // one host function plus the defined one
    assert_eq!(env.num_funcs(), 2);
    assert!(env.func(EnvFuncIndex::from_u32(0)).is_host());
    assert_eq!(env.global(wasm_interp::EnvGlobalIndex::from_u32(0)).value, Value::I32(13));

    // the host module exposes what it materialised
    assert!(env.module(host).export("f").is_some());
    assert!(env.module(host).export("g").is_some());

    // calls to host functions dispatch by environment index
    let istream = module_istream(&env, module);
    assert_eq!(istream[0], op(Opcode::CallHost));
    assert_eq!(&istream[1..5], 0u32.to_le_bytes());
}

#[test]
fn host_import_slots_are_shared() {
    let mut env = Environment::new();
    env.append_host_module("host", Box::new(TestHost));

    translate_into(&mut env, r#"(module (import "host" "f" (func)))"#).unwrap();
    assert_eq!(env.num_funcs(), 1);

    // the second importer resolves through the export the first one
    // created, so no new slot appears
    translate_into(&mut env, r#"(module (import "host" "f" (func)))"#).unwrap();
    assert_eq!(env.num_funcs(), 1);
}

#[test]
fn host_memory_import_checks_limits_too() {
    let mut env = Environment::new();
    env.append_host_module("host", Box::new(TestHost));

    // the host provides one page with max 2; asking for more is a
    // link error
    let message = err_importing(&mut env, r#"(module (import "host" "m" (memory 4)))"#);
    assert!(
        message.contains("actual size (1) smaller than declared (4)"),
        "{message}"
    );

    translate_into(&mut env, r#"(module (import "host" "m2" (memory 1)))"#).unwrap();
}

#[test]
fn host_delegate_errors_become_link_errors() {
    let mut env = Environment::new();
    env.append_host_module("host", Box::new(RefusingHost));

    let message = err_importing(&mut env, r#"(module (import "host" "f" (func)))"#);
    assert!(message.contains("no such function f"), "{message}");
}

#[test]
fn host_function_must_get_a_callback() {
    let mut env = Environment::new();
    env.append_host_module("host", Box::new(ForgetfulHost));

    let message = err_importing(&mut env, r#"(module (import "host" "f" (func)))"#);
    assert!(message.contains("did not provide a callback"), "{message}");
}

#[test]
fn failed_host_import_rolls_back_the_host_exports() {
    let mut env = Environment::new();
    let host = env.append_host_module("host", Box::new(TestHost));

    // the first import materialises, then the second function import
    // fails on signature grounds inside the same module
    let message = err_importing(
        &mut env,
        r#"
        (module
          (import "host" "f" (func))
          (import "host" "f" (func (param i32))))
        "#,
    );
    assert!(message.contains("import signature mismatch"), "{message}");

    // rollback removed both the function slot and the export the
    // failed translation appended to the host module
    assert_eq!(env.num_funcs(), 0);
    assert!(env.module(host).export("f").is_none());
}
