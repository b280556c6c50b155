//! dsc-gen - Code generation, optimization and linking.
//!
//! Lowers a reduced graph to stack-machine bytecode with a data section and
//! a relocation list, rewrites the bytecode with a handful of peephole
//! passes, and links a sheet tree into a runnable program image.
//!
//! Code generation assumes semantic analysis has succeeded; it does not
//! re-check the graph.

mod bcode;
mod codegen;
mod link;
mod optimize;

pub use bcode::{BCode, LinkTable};
pub use codegen::compile;
pub use link::{link, LinkError};
pub use optimize::{optimize, remove_bytecode};

#[cfg(test)]
mod tests {
    use super::*;
    use dsc_lex::lex;
    use dsc_par::parse;
    use dsc_sem::{IncludeContext, LinkKind, Sheet};
    use dsc_util::Handler;
    use dsc_vm::{NativeRegistry, Vm};
    use std::cell::RefCell;
    use std::io::Write;
    use std::rc::Rc;

    /// Compile a source string all the way to a sheet, panicking on any
    /// diagnostic.
    fn compile_source(source: &str, optimized: bool) -> Sheet {
        let handler = Handler::new();
        let tokens = lex(source, "test.dc", &handler);
        let result = parse(&tokens, "test.dc", &handler);
        assert!(result.success, "{:?}", handler.diagnostics());

        let mut sheet = Sheet::new("test.dc");
        dsc_sem::scan(
            &mut sheet,
            &result.tree,
            &handler,
            &IncludeContext::default(),
        );
        assert!(!handler.has_errors(), "{:?}", handler.diagnostics());

        compile(&mut sheet, false);
        if optimized {
            optimize(&mut sheet);
        }
        sheet
    }

    /// A writer whose contents the test can read back after the VM is done.
    #[derive(Clone, Default)]
    struct Capture(Rc<RefCell<Vec<u8>>>);

    impl Write for Capture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn run_main(sheet: &Sheet) -> String {
        let mut program = link(sheet, &NativeRegistry::new()).expect("links");
        let capture = Capture::default();
        let mut vm = Vm::with_output(Box::new(capture.clone()));
        let main = program.main;
        assert!(vm.run(&mut program, main), "runtime error");
        let bytes = capture.0.borrow().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_hello_world() {
        for optimized in [false, true] {
            let sheet = compile_source("Start~#1; Print(#1, 'Hello, world!');", optimized);
            assert_eq!(run_main(&sheet), "Hello, world!\n");
        }
    }

    #[test]
    fn test_integer_arithmetic() {
        let sheet = compile_source("Start~#1\nAdd(20, 22)~#2\nPrint(#1, #2)\n", true);
        assert_eq!(run_main(&sheet), "42\n");
    }

    #[test]
    fn test_wired_arithmetic_chain() {
        // (10 - 4) * 7 = 42
        let sheet = compile_source(
            "Start~#1\nSubtract(10, 4)~#2\nMultiply(#2, 7)~#3\nPrint(#1, #3)\n",
            true,
        );
        assert_eq!(run_main(&sheet), "42\n");
    }

    #[test]
    fn test_float_division() {
        let sheet = compile_source("Start~#1\nDivide(5, 2)~#2\nPrint(#1, #2)\n", true);
        assert_eq!(run_main(&sheet), "2.5\n");
    }

    #[test]
    fn test_variable_get_and_set() {
        let sheet = compile_source(
            "[Variable(count, Integer, 5)]\n\
             Start~#1\n\
             Set(count, #1, 12)~#2\n\
             count~#3\n\
             Print(#2, #3)\n",
            true,
        );
        assert_eq!(run_main(&sheet), "12\n");
    }

    #[test]
    fn test_string_variable_default() {
        let sheet = compile_source(
            "[Variable(greeting, String, 'hello')]\n\
             Start~#1\n\
             greeting~#2\n\
             Print(#1, #2)\n",
            true,
        );
        assert_eq!(run_main(&sheet), "hello\n");
    }

    #[test]
    fn test_if_then_else() {
        let sheet = compile_source(
            "Start~#1\n\
             MoreThan(3, 2)~#2\n\
             IfThenElse(#1, #2)~#3, #4, #5\n\
             Print(#3, 'yes')\n\
             Print(#4, 'no')\n\
             Print(#5, 'after')\n",
            true,
        );
        assert_eq!(run_main(&sheet), "yes\nafter\n");
    }

    #[test]
    fn test_boolean_ordering_comparison() {
        // Booleans compare through the integer comparator.
        let sheet = compile_source(
            "Start~#1\nLessThan(false, true)~#2\nPrint(#1, #2)\n",
            true,
        );
        assert_eq!(run_main(&sheet), "true\n");
    }

    #[test]
    fn test_string_comparison_chooses_else() {
        let sheet = compile_source(
            "Start~#1\n\
             Equal('abc', 'abcd')~#2\n\
             IfThenElse(#1, #2)~#3, #4, #5\n\
             Print(#3, 'same')\n\
             Print(#4, 'different')\n",
            true,
        );
        assert_eq!(run_main(&sheet), "different\n");
    }

    #[test]
    fn test_for_loop_counts() {
        let sheet = compile_source(
            "Start~#1\n\
             For(#1, 1, 3, 1)~#2, #3, #4\n\
             Print(#2, #3)\n\
             Print(#4, 'done')\n",
            true,
        );
        assert_eq!(run_main(&sheet), "1\n2\n3\ndone\n");
    }

    #[test]
    fn test_while_loop_with_variable() {
        let sheet = compile_source(
            "[Variable(n, Integer, 0)]\n\
             Start~#1\n\
             n~#8\n\
             LessThan(#8, 3)~#2\n\
             While(#1, #2)~#3, #4\n\
             n~#9\n\
             Add(#9, 1)~#5\n\
             Set(n, #3, #5)\n\
             n~#10\n\
             Print(#4, #10)\n",
            true,
        );
        assert_eq!(run_main(&sheet), "3\n");
    }

    #[test]
    fn test_ternary() {
        let sheet = compile_source(
            "Start~#1\n\
             LessThan(1, 2)~#2\n\
             Ternary(#2, 111, 222)~#3\n\
             Print(#1, #3)\n",
            true,
        );
        assert_eq!(run_main(&sheet), "111\n");
    }

    #[test]
    fn test_length() {
        let sheet = compile_source(
            "Start~#1\nLength('hello')~#2\nPrint(#1, #2)\n",
            true,
        );
        assert_eq!(run_main(&sheet), "5\n");
    }

    #[test]
    fn test_function_call() {
        let sheet = compile_source(
            "[Function(Double)]\n\
             [FunctionInput(Double, value, Integer, 0)]\n\
             [FunctionOutput(Double, doubled, Integer)]\n\
             Define(Double)~#1\n\
             Multiply(#1, 2)~#2\n\
             Return(Double, #2)\n\
             Start~#10\n\
             Double(21)~#11\n\
             Print(#10, #11)\n",
            true,
        );
        assert_eq!(run_main(&sheet), "42\n");
    }

    #[test]
    fn test_recursive_factorial() {
        let sheet = compile_source(
            "[Function(Factorial)]\n\
             [FunctionInput(Factorial, n, Integer, 0)]\n\
             [FunctionOutput(Factorial, result, Integer)]\n\
             Define(Factorial)~#1\n\
             LessThanOrEqual(#1, 1)~#2\n\
             Subtract(#1, 1)~#3\n\
             Factorial(#3)~#4\n\
             Multiply(#1, #4)~#5\n\
             Ternary(#2, 1, #5)~#6\n\
             Return(Factorial, #6)\n\
             Start~#10\n\
             Factorial(10)~#11\n\
             Print(#10, #11)\n",
            false,
        );
        assert_eq!(run_main(&sheet), "3628800\n");
    }

    #[test]
    fn test_not_pair_disappears_after_optimization() {
        let source = "Start~#1\n\
                      Not(true)~#2\n\
                      Not(#2)~#3\n\
                      Print(#1, #3)\n";

        let unoptimized = compile_source(source, false);
        let mut optimized = compile_source(source, true);

        // Behaviour is identical either way.
        assert_eq!(run_main(&unoptimized), "true\n");
        assert_eq!(run_main(&optimized), "true\n");

        // After optimization there are no NOT instructions left.
        let nots = dsc_vm::dasm::instructions(&optimized.text)
            .filter(|i| i.opcode == dsc_vm::Opcode::Not)
            .count();
        assert_eq!(nots, 0);

        // And the optimizer is idempotent.
        let once = optimized.text.clone();
        optimize(&mut optimized);
        assert_eq!(optimized.text, once);
    }

    #[test]
    fn test_relocation_records_point_at_full_immediates() {
        let sheet = compile_source("Start~#1; Print(#1, 'Hello, world!');", true);

        for link in &sheet.ins_links {
            // Every relocated instruction still has a full-width immediate.
            let opcode = dsc_vm::Opcode::from_byte(sheet.text[link.ins]).unwrap();
            assert!(matches!(
                opcode.operands(),
                dsc_vm::Operands::Full | dsc_vm::Operands::FullByte
            ));
            assert!(link.link < sheet.links.len());
        }

        // The string literal made it into the link table once.
        let literals = sheet
            .links
            .iter()
            .filter(|l| l.kind == LinkKind::StringLiteral)
            .count();
        assert_eq!(literals, 1);
    }

    #[test]
    fn test_string_literals_are_deduplicated() {
        let sheet = compile_source(
            "Start~#1\nPrint(#1, 'same')~#2\nPrint(#2, 'same')\n",
            false,
        );
        let literals = sheet
            .links
            .iter()
            .filter(|l| l.kind == LinkKind::StringLiteral)
            .count();
        assert_eq!(literals, 1);
    }

    #[test]
    fn test_subroutine_call() {
        let sheet = compile_source(
            "[Subroutine(Shout)]\n\
             [FunctionInput(Shout, message, String, '')]\n\
             Define(Shout)~#1, #2\n\
             Print(#1, #2)~#3\n\
             Return(Shout, #3)\n\
             Start~#10\n\
             Shout(#10, 'hey')\n",
            true,
        );
        assert_eq!(run_main(&sheet), "hey\n");
    }
}
