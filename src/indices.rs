//! Typed index spaces.
//!
//! A module refers to entities with zero-based indices local to the
//! binary; the environment holds the merged sequences of every loaded
//! module and addresses them with its own indices. Keeping the two
//! spaces as distinct types means a module-local index can only reach
//! the environment through one of the translator's mapping tables.

use cranelift_entity::entity_impl;

/// Module-local index into the type section.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct TypeIndex(u32);
entity_impl!(TypeIndex);

/// Module-local function index; imported functions come first.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct FuncIndex(u32);
entity_impl!(FuncIndex);

/// Module-local global index; imported globals come first.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct GlobalIndex(u32);
entity_impl!(GlobalIndex);

/// Index of a function defined (not imported) by the module being
/// translated. Defined function `i` is module function
/// `num_func_imports + i`.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct DefinedFuncIndex(u32);
entity_impl!(DefinedFuncIndex);

/// Environment-wide signature index.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct EnvSigIndex(u32);
entity_impl!(EnvSigIndex);

/// Environment-wide function index.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct EnvFuncIndex(u32);
entity_impl!(EnvFuncIndex);

/// Environment-wide global index.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct EnvGlobalIndex(u32);
entity_impl!(EnvGlobalIndex);

/// Environment-wide table index.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct EnvTableIndex(u32);
entity_impl!(EnvTableIndex);

/// Environment-wide memory index.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct EnvMemoryIndex(u32);
entity_impl!(EnvMemoryIndex);

/// Index of a module within the environment.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct ModuleIndex(u32);
entity_impl!(ModuleIndex);
