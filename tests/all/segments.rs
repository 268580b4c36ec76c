//! Element and data segments: deferred commit, bounds checking, and
//! rollback on late errors.

use crate::{translate, translate_err, translate_into};
use wasm_interp::{EnvFuncIndex, EnvMemoryIndex, EnvTableIndex, Environment};

#[test]
fn elem_segments_fill_the_table() {
    let (env, _) = translate(
        r#"
        (module
          (table 3 funcref)
          (func $a)
          (func $b)
          (elem (i32.const 1) $a $b))
        "#,
    );

    let table = env.table(EnvTableIndex::from_u32(0));
    assert_eq!(table.func_indexes.len(), 3);
    assert_eq!(table.func_indexes[0], None);
    assert_eq!(table.func_indexes[1], Some(EnvFuncIndex::from_u32(0)));
    assert_eq!(table.func_indexes[2], Some(EnvFuncIndex::from_u32(1)));
}

#[test]
fn data_segments_fill_the_memory() {
    let (env, _) = translate(
        r#"(module (memory 1) (data (i32.const 3) "hi"))"#,
    );

    let memory = env.memory(EnvMemoryIndex::from_u32(0));
    assert_eq!(memory.data.len(), 0x10000);
    assert_eq!(&memory.data[3..5], b"hi");
    assert_eq!(memory.data[5], 0);
}

#[test]
fn elem_segment_out_of_bounds() {
    let message = translate_err(
        r#"
        (module
          (table 1 funcref)
          (func $a)
          (elem (i32.const 5) $a))
        "#,
    );
    assert!(
        message.contains("elem segment offset is out of bounds: 5 >= max value 1"),
        "{message}"
    );
}

#[test]
fn data_segment_out_of_bounds() {
    let message = translate_err(
        r#"(module (memory 1) (data (i32.const 65535) "abc"))"#,
    );
    assert!(message.contains("data segment is out of bounds"), "{message}");
}

#[test]
fn elem_offset_must_be_i32() {
    let message = translate_err(
        r#"
        (module
          (table 1 funcref)
          (func $a)
          (elem (i64.const 0) $a))
        "#,
    );
    assert!(
        message.contains("type mismatch in elem segment, expected i32 but got i64"),
        "{message}"
    );
}

#[test]
fn data_offset_must_be_i32() {
    let message = translate_err(
        r#"(module (memory 1) (data (f32.const 0) "x"))"#,
    );
    assert!(
        message.contains("type mismatch in data segment, expected i32 but got f32"),
        "{message}"
    );
}

#[test]
fn global_initializer_type_must_match() {
    let message = translate_err("(module (global i32 (i64.const 1)))");
    assert!(
        message.contains("type mismatch in global, expected i32 but got i64"),
        "{message}"
    );
}

#[test]
fn staged_elem_writes_are_dropped_on_late_failure() {
    let mut env = Environment::new();
    let lib = translate_into(&mut env, r#"(module (table (export "t") 2 funcref))"#).unwrap();
    env.register_module("lib", lib);

    // the element segment stages a write into the imported table,
    // then the second function body fails to validate
    let wasm = wat::parse_str(
        r#"
        (module
          (import "lib" "t" (table 2 funcref))
          (func $ok)
          (func $bad (result i32) (i32.add (i32.const 1)))
          (elem (i32.const 0) $ok))
        "#,
    )
    .unwrap();
    wasm_interp::translate_module(&mut env, &wasm).unwrap_err();

    // the imported table survives the rollback untouched
    let table = env.table(EnvTableIndex::from_u32(0));
    assert_eq!(table.func_indexes, vec![None, None]);
}

#[test]
fn staged_data_writes_are_dropped_on_partial_failure() {
    let mut env = Environment::new();
    let lib = translate_into(&mut env, r#"(module (memory (export "m") 1))"#).unwrap();
    env.register_module("lib", lib);

    // the first data segment is fine; the second is out of bounds,
    // so neither may become visible
    let message = translate_into(
        &mut env,
        r#"
        (module
          (import "lib" "m" (memory 1))
          (data (i32.const 0) "aa")
          (data (i32.const 65535) "bbb"))
        "#,
    )
    .unwrap_err()
    .to_string();
    assert!(message.contains("data segment is out of bounds"), "{message}");

    let memory = env.memory(EnvMemoryIndex::from_u32(0));
    assert_eq!(&memory.data[0..2], &[0, 0]);
}

#[test]
fn segment_effects_are_visible_after_success() -> anyhow::Result<()> {
    let mut env = Environment::new();
    let lib = translate_into(
        &mut env,
        r#"(module (table (export "t") 1 funcref) (memory (export "m") 1))"#,
    )?;
    env.register_module("lib", lib);

    translate_into(
        &mut env,
        r#"
        (module
          (import "lib" "t" (table 1 funcref))
          (import "lib" "m" (memory 1))
          (func $f)
          (elem (i32.const 0) $f)
          (data (i32.const 10) "ok"))
        "#,
    )?;

    assert_eq!(
        env.table(EnvTableIndex::from_u32(0)).func_indexes[0],
        Some(EnvFuncIndex::from_u32(0))
    );
    assert_eq!(&env.memory(EnvMemoryIndex::from_u32(0)).data[10..12], b"ok");
    Ok(())
}
