//! Structural and linkage error coverage.

use crate::{module_istream, op, translate, translate_err};
use wasm_interp::Opcode;

#[test]
fn call_indirect_needs_a_table() {
    let message = translate_err(
        "(module (type (func)) (func (call_indirect (type 0) (i32.const 0))))",
    );
    assert!(
        message.contains("found call_indirect operator, but no table"),
        "{message}"
    );
}

#[test]
fn call_indirect_emits_table_and_signature() {
    let (env, module) = translate(
        r#"
        (module
          (type (func))
          (table 1 funcref)
          (func (call_indirect (type 0) (i32.const 0))))
        "#,
    );

    let mut expected = vec![op(Opcode::I32Const)];
    expected.extend(0u32.to_le_bytes());
    expected.push(op(Opcode::CallIndirect));
    expected.extend(0u32.to_le_bytes()); // table environment index
    expected.extend(0u32.to_le_bytes()); // signature environment index
    expected.push(op(Opcode::Return));
    assert_eq!(module_istream(&env, module), expected);
}

#[test]
fn loads_require_a_memory() {
    let message = translate_err("(module (func (result i32) (i32.load (i32.const 0))))");
    assert!(
        message.contains("i32.load requires an imported or defined memory"),
        "{message}"
    );
}

#[test]
fn grow_memory_requires_a_memory() {
    let message = translate_err("(module (func (result i32) (memory.grow (i32.const 1))))");
    assert!(
        message.contains("grow_memory requires an imported or defined memory"),
        "{message}"
    );
}

#[test]
fn alignment_may_not_exceed_natural() {
    let message = translate_err(
        "(module (memory 1) (func (result i32) (i32.load8_u align=2 (i32.const 0))))",
    );
    assert!(
        message.contains("alignment must not be larger than natural alignment (1)"),
        "{message}"
    );
}

#[test]
fn natural_alignment_is_accepted() {
    let (env, module) = translate(
        "(module (memory 1) (func (result i64) (i64.load align=8 (i32.const 0))))",
    );
    let istream = module_istream(&env, module);
    assert_eq!(istream[5], op(Opcode::I64Load));
}

#[test]
fn only_one_table_allowed() {
    let message = translate_err("(module (table 1 funcref) (table 1 funcref))");
    assert!(message.contains("only one table allowed"), "{message}");
}

#[test]
fn only_one_memory_allowed() {
    let message = translate_err("(module (memory 1) (memory 1))");
    assert!(message.contains("only one memory allowed"), "{message}");
}

#[test]
fn duplicate_exports_are_rejected() {
    let message = translate_err(
        r#"(module (func) (export "a" (func 0)) (export "a" (func 0)))"#,
    );
    assert!(message.contains(r#"duplicate export "a""#), "{message}");
}

#[test]
fn mutable_globals_cannot_be_exported() {
    let message = translate_err(
        r#"(module (global (export "g") (mut i32) (i32.const 0)))"#,
    );
    assert!(message.contains("mutable globals cannot be exported"), "{message}");
}

#[test]
fn set_global_requires_mutability() {
    let message = translate_err(
        "(module (global i32 (i32.const 0)) (func (global.set 0 (i32.const 1))))",
    );
    assert!(
        message.contains("can't set_global on immutable global at index 0"),
        "{message}"
    );
}

#[test]
fn mutable_globals_can_be_set() {
    let (env, module) = translate(
        "(module (global (mut i32) (i32.const 0)) (func (global.set 0 (i32.const 1))))",
    );

    let mut expected = vec![op(Opcode::I32Const)];
    expected.extend(1u32.to_le_bytes());
    expected.push(op(Opcode::SetGlobal));
    expected.extend(0u32.to_le_bytes());
    expected.push(op(Opcode::Return));
    assert_eq!(module_istream(&env, module), expected);
}

#[test]
fn local_indices_are_bounds_checked() {
    let message = translate_err("(module (func (result i32) (local.get 5)))");
    assert!(message.contains("invalid local_index: 5 (max 0)"), "{message}");
}

#[test]
fn global_indices_are_bounds_checked() {
    let message = translate_err("(module (func (result i32) (global.get 3)))");
    assert!(message.contains("invalid global_index: 3 (max 0)"), "{message}");
}
