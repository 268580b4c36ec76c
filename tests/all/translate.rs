//! End-to-end translation scenarios: emitted istream bytes, function
//! entry points, and the transactional driver.

use crate::{module_istream, op, translate, translate_into, translate_err};
use wasm_interp::{translate_module, EnvFuncIndex, Environment, Func, Opcode};

#[test]
fn empty_module() {
    let (env, module) = translate("(module)");
    assert_eq!(env.num_sigs(), 0);
    assert_eq!(env.num_funcs(), 0);
    assert_eq!(env.num_tables(), 0);
    assert_eq!(env.num_memories(), 0);
    assert_eq!(env.num_globals(), 0);
    assert_eq!(env.num_modules(), 1);
    assert!(env.module(module).exports().is_empty());
    assert_eq!(env.module(module).istream_range(), Some((0, 0)));
}

#[test]
fn const_function() {
    let (env, module) = translate("(module (func (result i32) i32.const 42))");

    let mut expected = vec![op(Opcode::I32Const)];
    expected.extend(42u32.to_le_bytes());
    expected.push(op(Opcode::Return));
    assert_eq!(module_istream(&env, module), expected);

    // no locals, so no alloca; the entry point is the istream base
    let func = env.func(EnvFuncIndex::from_u32(0));
    match func {
        Func::Defined(defined) => {
            assert_eq!(defined.offset, Some(0));
            assert_eq!(defined.local_count, 0);
        }
        Func::Host(_) => panic!("expected a defined function"),
    }
}

#[test]
fn if_without_else_branches_to_end() {
    let (env, module) = translate("(module (func (if (i32.const 1) (then (nop)))))");

    let mut expected = vec![op(Opcode::I32Const)];
    expected.extend(1u32.to_le_bytes());
    expected.push(op(Opcode::BrUnless));
    expected.extend(11u32.to_le_bytes()); // just past the nop
    expected.push(op(Opcode::Nop));
    expected.push(op(Opcode::Return));
    assert_eq!(module_istream(&env, module), expected);
}

#[test]
fn loop_br_is_a_backward_branch() {
    let (env, module) = translate("(module (func (loop (br 0))))");

    // the branch target is known at emit time, so no fixup slot is
    // left behind
    let mut expected = vec![op(Opcode::Br)];
    expected.extend(0u32.to_le_bytes());
    expected.push(op(Opcode::Return));
    assert_eq!(module_istream(&env, module), expected);
}

#[test]
fn call_to_later_function_is_patched() {
    let (env, module) = translate("(module (func (call 1)) (func))");

    let mut expected = vec![op(Opcode::Call)];
    expected.extend(6u32.to_le_bytes()); // function 1's entry
    expected.push(op(Opcode::Return));
    expected.push(op(Opcode::Return));
    assert_eq!(module_istream(&env, module), expected);

    match env.func(EnvFuncIndex::from_u32(1)) {
        Func::Defined(defined) => assert_eq!(defined.offset, Some(6)),
        Func::Host(_) => panic!("expected a defined function"),
    }
}

#[test]
fn locals_reserve_stack_space() {
    let (env, module) = translate("(module (func (local i32 i64) nop))");

    let mut expected = vec![op(Opcode::Alloca)];
    expected.extend(2u32.to_le_bytes());
    expected.push(op(Opcode::Nop));
    expected.push(op(Opcode::DropKeep));
    expected.extend(2u32.to_le_bytes());
    expected.push(0); // keep count
    expected.push(op(Opcode::Return));
    assert_eq!(module_istream(&env, module), expected);
}

#[test]
fn get_local_is_stack_relative() {
    let (env, module) = translate("(module (func (param i32) (result i32) (local.get 0)))");

    let mut expected = vec![op(Opcode::GetLocal)];
    expected.extend(1u32.to_le_bytes());
    expected.push(op(Opcode::DropKeep));
    expected.extend(1u32.to_le_bytes()); // drop the parameter
    expected.push(1); // keep the result
    expected.push(op(Opcode::Return));
    assert_eq!(module_istream(&env, module), expected);
}

#[test]
fn explicit_return_still_gets_trailing_return() {
    let (env, module) = translate("(module (func (result i32) (return (i32.const 1))))");

    let mut expected = vec![op(Opcode::I32Const)];
    expected.extend(1u32.to_le_bytes());
    expected.push(op(Opcode::Return));
    expected.push(op(Opcode::Return));
    assert_eq!(module_istream(&env, module), expected);
}

#[test]
fn memory_operators_carry_memory_index_and_offset() {
    let (env, module) = translate(
        "(module (memory 1) (func (i32.store offset=8 (i32.const 0) (i32.const 7))))",
    );

    let mut expected = vec![op(Opcode::I32Const)];
    expected.extend(0u32.to_le_bytes());
    expected.push(op(Opcode::I32Const));
    expected.extend(7u32.to_le_bytes());
    expected.push(op(Opcode::I32Store));
    expected.extend(0u32.to_le_bytes()); // memory index
    expected.extend(8u32.to_le_bytes()); // static offset
    expected.push(op(Opcode::Return));
    assert_eq!(module_istream(&env, module), expected);
}

#[test]
fn memory_size_and_grow() {
    let (env, module) = translate(
        "(module (memory 1) (func (result i32) (memory.grow (memory.size))))",
    );

    let mut expected = vec![op(Opcode::CurrentMemory)];
    expected.extend(0u32.to_le_bytes());
    expected.push(op(Opcode::GrowMemory));
    expected.extend(0u32.to_le_bytes());
    expected.push(op(Opcode::Return));
    assert_eq!(module_istream(&env, module), expected);
}

#[test]
fn same_module_translates_identically_into_fresh_environments() {
    let wat = r#"
        (module
          (func (export "f") (param i32) (result i32)
            (i32.add (local.get 0) (i32.const 1))))
    "#;
    let (env1, m1) = translate(wat);
    let (env2, m2) = translate(wat);
    assert_eq!(module_istream(&env1, m1), module_istream(&env2, m2));
    assert_eq!(
        env1.module(m1).export("f").map(|e| (e.kind, e.index)),
        env2.module(m2).export("f").map(|e| (e.kind, e.index))
    );
}

#[test]
fn failed_translation_is_invisible_to_the_next_one() {
    let good = r#"(module (func (export "f") (result i32) i32.const 9))"#;

    let mut env1 = Environment::new();
    let bad = wat::parse_str(r#"(module (import "nowhere" "f" (func)))"#).unwrap();
    translate_module(&mut env1, &bad).unwrap_err();
    let m1 = translate_into(&mut env1, good).unwrap();

    let mut env2 = Environment::new();
    let m2 = translate_into(&mut env2, good).unwrap();

    assert_eq!(env1.istream(), env2.istream());
    assert_eq!(env1.num_sigs(), env2.num_sigs());
    assert_eq!(env1.num_funcs(), env2.num_funcs());
    assert_eq!(env1.num_modules(), env2.num_modules());
    assert_eq!(
        module_istream(&env1, m1),
        module_istream(&env2, m2)
    );
}

#[test]
fn exports_resolve_to_new_env_indices() {
    let mut env = Environment::new();
    translate_into(&mut env, r#"(module (func (export "a")))"#).unwrap();
    let funcs_before = env.num_funcs();

    let module = translate_into(&mut env, r#"(module (func (export "b")))"#).unwrap();
    let export = env.module(module).export("b").unwrap();
    assert!(export.index as usize >= funcs_before);
}

#[test]
fn second_module_appends_to_the_istream() {
    let mut env = Environment::new();
    let first = translate_into(&mut env, "(module (func (result i32) i32.const 1))").unwrap();
    let second = translate_into(&mut env, "(module (func (result i32) i32.const 2))").unwrap();

    let (_, first_end) = env.module(first).istream_range().unwrap();
    let (second_start, second_end) = env.module(second).istream_range().unwrap();
    assert_eq!(first_end, second_start);
    assert_eq!(second_end as usize, env.istream().len());
}

#[test]
fn start_function_is_recorded() {
    let (env, module) = translate("(module (func) (start 0))");
    assert_eq!(env.module(module).start_func(), Some(EnvFuncIndex::from_u32(0)));
}

#[test]
fn start_function_must_be_nullary() {
    let message = translate_err("(module (func (param i32)) (start 0))");
    assert!(message.contains("start function must be nullary"), "{message}");
}

#[test]
fn start_function_must_not_return() {
    let message = translate_err("(module (func (result i32) i32.const 1) (start 0))");
    assert!(
        message.contains("start function must not return anything"),
        "{message}"
    );
}
