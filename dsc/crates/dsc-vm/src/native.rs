//! Native functions.
//!
//! Hosts expose functionality to sheets by registering named functions with
//! socket signatures. The compiler links `CALLC`/`CALLCI` instructions to
//! indices in the registry, and the VM invokes the function synchronously on
//! its own thread. A native function reads its arguments from, and leaves
//! its return values on, the VM stack.

use crate::program::Program;
use crate::vm::Vm;
use dsc_util::NodeDefinition;
use indexmap::IndexMap;

/// The signature of a host-provided function.
///
/// Arguments sit at frame-relative indices `1..=n`. Return values are
/// pushed on top, in reverse declaration order, so the first declared
/// output ends up at the top of the stack. The function must run to
/// completion and must not resume or suspend the VM.
pub type NativeFn = fn(&mut Vm, &mut Program);

/// A native function with its node definition.
#[derive(Clone)]
pub struct NativeFunction {
    pub definition: NodeDefinition,
    pub func: NativeFn,
}

/// The table of native functions a host injects into compilation and
/// linking. Registration order is preserved.
#[derive(Clone, Default)]
pub struct NativeRegistry {
    funcs: IndexMap<String, NativeFunction>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function under its definition's name. A later
    /// registration with the same name replaces the earlier one.
    pub fn register(&mut self, definition: NodeDefinition, func: NativeFn) {
        self.funcs.insert(
            definition.name.clone(),
            NativeFunction { definition, func },
        );
    }

    pub fn get(&self, name: &str) -> Option<&NativeFunction> {
        self.funcs.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &NativeFunction)> {
        self.funcs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dsc_util::meta::socket;
    use dsc_util::DType;

    fn nop(_: &mut Vm, _: &mut Program) {}

    #[test]
    fn test_register_and_get() {
        let mut registry = NativeRegistry::new();
        assert!(registry.is_empty());

        let def = NodeDefinition::new(
            "Square",
            "",
            vec![socket("value", DType::Int), socket("squared", DType::Int)],
            1,
        );
        registry.register(def, nop);

        assert_eq!(registry.len(), 1);
        assert!(registry.get("Square").is_some());
        assert!(registry.get("Cube").is_none());
    }
}
