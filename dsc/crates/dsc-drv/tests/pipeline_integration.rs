//! End-to-end pipeline tests: source text in, observable behaviour out.

use dsc_drv::debug::DebugSession;
use dsc_drv::{
    load_file, load_string, run_function, run_sheet_with_output, CompileOptions,
};
use dsc_sem::Sheet;
use dsc_util::{DType, DValue, Handler, NodeDefinition, SocketMeta};
use dsc_vm::{NativeRegistry, Value};
use std::cell::RefCell;
use std::io::Write;
use std::rc::Rc;

/// A writer whose contents the test reads back once the VM is done.
#[derive(Clone, Default)]
struct Capture(Rc<RefCell<Vec<u8>>>);

impl Capture {
    fn contents(&self) -> String {
        String::from_utf8(self.0.borrow().clone()).unwrap()
    }
}

impl Write for Capture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn compile(source: &str, natives: &NativeRegistry) -> Sheet {
    let handler = Handler::new();
    let sheet = load_string(source, "test.dc", &CompileOptions::default(), natives, &handler);
    assert!(!sheet.has_errors, "{:?}", handler.diagnostics());
    sheet
}

fn run_and_capture(sheet: &Sheet, natives: &NativeRegistry) -> String {
    let capture = Capture::default();
    let ok = run_sheet_with_output(sheet, natives, Box::new(capture.clone())).expect("links");
    assert!(ok, "runtime error");
    capture.contents()
}

#[test]
fn scenario_hello_world() {
    let natives = NativeRegistry::new();
    let sheet = compile("Start~#1; Print(#1, 'Hello, world!');", &natives);
    assert_eq!(run_and_capture(&sheet, &natives), "Hello, world!\n");
}

#[test]
fn scenario_factorial_via_host_api() {
    let natives = NativeRegistry::new();
    let sheet = compile(
        "[Function(Factorial)]\n\
         [FunctionInput(Factorial, n, Integer, 0)]\n\
         [FunctionOutput(Factorial, result, Integer)]\n\
         Define(Factorial)~#1\n\
         LessThanOrEqual(#1, 1)~#2\n\
         Subtract(#1, 1)~#3\n\
         Factorial(#3)~#4\n\
         Multiply(#1, #4)~#5\n\
         Ternary(#2, 1, #5)~#6\n\
         Return(Factorial, #6)\n",
        &natives,
    );

    let results = run_function(&sheet, &natives, "Factorial", &[Value::Int(10)]).unwrap();
    assert_eq!(results, vec![Value::Int(3628800)]);
}

#[test]
fn scenario_quadruple_for_loop() {
    let natives = NativeRegistry::new();
    let sheet = compile(
        "[Function(Double)]\n\
         [FunctionInput(Double, value, Float, 0.0)]\n\
         [FunctionOutput(Double, doubled, Float)]\n\
         [Function(Quadruple)]\n\
         [FunctionInput(Quadruple, value, Float, 0.0)]\n\
         [FunctionOutput(Quadruple, quadrupled, Float)]\n\
         Define(Double)~#1\n\
         Multiply(#1, 2.0)~#2\n\
         Return(Double, #2)\n\
         Define(Quadruple)~#3\n\
         Double(#3)~#4\n\
         Double(#4)~#5\n\
         Return(Quadruple, #5)\n\
         Start~#10\n\
         Print(#10, 'I hope you\\'re ready...')~#11\n\
         For(#11, 1.0, 2.5, 0.5)~#12, #13, #14\n\
         Quadruple(#13)~#15\n\
         Print(#12, #15)\n\
         Print(#14, 'Done!')\n",
        &natives,
    );

    assert_eq!(
        run_and_capture(&sheet, &natives),
        "I hope you're ready...\n4\n6\n8\n10\nDone!\n"
    );
}

#[test]
fn scenario_object_file_round_trip() {
    let natives = NativeRegistry::new();
    let handler = Handler::new();

    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("hello.dc");
    let object_path = dir.path().join("hello.dco");
    std::fs::write(&source_path, "Start~#1; Print(#1, 'Hello, world!');\n").unwrap();

    let ok = dsc_drv::compile_file(&source_path, &object_path, &natives, &handler).unwrap();
    assert!(ok, "{:?}", handler.diagnostics());

    let loaded = load_file(&object_path, &CompileOptions::default(), &natives, &handler).unwrap();
    assert!(!loaded.has_errors, "{:?}", handler.diagnostics());

    assert_eq!(run_and_capture(&loaded, &natives), "Hello, world!\n");
}

#[test]
fn scenario_string_comparison() {
    let natives = NativeRegistry::new();

    // Equal('abc', 'abcd') chooses the else branch.
    let sheet = compile(
        "Start~#1\n\
         Equal('abc', 'abcd')~#2\n\
         IfThenElse(#1, #2)~#3, #4, #5\n\
         Print(#3, 'equal')\n\
         Print(#4, 'not equal')\n",
        &natives,
    );
    assert_eq!(run_and_capture(&sheet, &natives), "not equal\n");

    // Mixing String with Integer in Equal is a compile-time error.
    let handler = Handler::new();
    let sheet = load_string(
        "Start~#1\nEqual('abc', 1)~#2\nIfThen(#1, #2)~#3, #4\nPrint(#3, 'x')\n",
        "bad.dc",
        &CompileOptions::default(),
        &natives,
        &handler,
    );
    assert!(sheet.has_errors);
}

#[test]
fn scenario_not_pairs_are_optimized_away() {
    let natives = NativeRegistry::new();
    let sheet = compile(
        "Start~#1\nNot(false)~#2\nNot(#2)~#3\nPrint(#1, #3)\n",
        &natives,
    );

    assert_eq!(run_and_capture(&sheet, &natives), "false\n");

    let remaining = dsc_vm::dasm::instructions(&sheet.text)
        .filter(|ins| ins.opcode == dsc_vm::Opcode::Not)
        .count();
    assert_eq!(remaining, 0);
}

#[test]
fn includes_share_functions_and_variables() {
    let natives = NativeRegistry::new();
    let handler = Handler::new();

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("lib.dc"),
        "[Variable(shared, Integer, 7)]\n\
         [Function(Triple)]\n\
         [FunctionInput(Triple, value, Integer, 0)]\n\
         [FunctionOutput(Triple, tripled, Integer)]\n\
         Define(Triple)~#1\n\
         Multiply(#1, 3)~#2\n\
         Return(Triple, #2)\n",
    )
    .unwrap();

    let main_path = dir.path().join("main.dc");
    std::fs::write(
        &main_path,
        "[Include('lib.dc')]\n\
         Start~#1\n\
         shared~#2\n\
         Triple(#2)~#3\n\
         Print(#1, #3)\n",
    )
    .unwrap();

    let sheet = load_file(&main_path, &CompileOptions::default(), &natives, &handler).unwrap();
    assert!(!sheet.has_errors, "{:?}", handler.diagnostics());
    assert_eq!(sheet.includes.len(), 1);

    assert_eq!(run_and_capture(&sheet, &natives), "21\n");
}

#[test]
fn circular_includes_are_rejected() {
    let natives = NativeRegistry::new();
    let handler = Handler::new();

    let dir = tempfile::tempdir().unwrap();
    let a_path = dir.path().join("a.dc");
    std::fs::write(&a_path, "[Include('b.dc')]\nStart~#1\nPrint(#1, 'a')\n").unwrap();
    std::fs::write(dir.path().join("b.dc"), "[Include('a.dc')]\n").unwrap();

    let sheet = load_file(&a_path, &CompileOptions::default(), &natives, &handler).unwrap();
    assert!(sheet.has_errors);
}

fn square(vm: &mut dsc_vm::Vm, _program: &mut dsc_vm::Program) {
    let value = vm.get_int(1);
    vm.push_int(value * value);
}

#[test]
fn native_functions_are_callable() {
    let mut natives = NativeRegistry::new();
    natives.register(
        NodeDefinition::new(
            "Square",
            "Square an integer.",
            vec![
                SocketMeta::new("value", "", DType::Int, DValue::Int(0)),
                SocketMeta::new("squared", "", DType::Int, DValue::Int(0)),
            ],
            1,
        ),
        square,
    );

    let sheet = compile("Start~#1\nSquare(5)~#2\nPrint(#1, #2)\n", &natives);
    assert_eq!(run_and_capture(&sheet, &natives), "25\n");
}

#[test]
fn missing_native_fails_to_link() {
    let mut with_native = NativeRegistry::new();
    with_native.register(
        NodeDefinition::new(
            "Square",
            "",
            vec![
                SocketMeta::new("value", "", DType::Int, DValue::Int(0)),
                SocketMeta::new("squared", "", DType::Int, DValue::Int(0)),
            ],
            1,
        ),
        square,
    );

    let sheet = compile("Start~#1\nSquare(5)~#2\nPrint(#1, #2)\n", &with_native);

    // Linking against a registry without the native fails.
    let empty = NativeRegistry::new();
    assert!(dsc_drv::link_sheet(&sheet, &empty).is_err());
}

#[test]
fn debugger_reports_nodes_wires_and_breakpoints() {
    let natives = NativeRegistry::new();
    let handler = Handler::new();
    let sheet = load_string(
        "Start~#1\nAdd(20, 22)~#2\nPrint(#1, #2)\n",
        "debug.dc",
        &CompileOptions::debug(),
        &natives,
        &handler,
    );
    assert!(!sheet.has_errors, "{:?}", handler.diagnostics());

    let activated: Rc<RefCell<Vec<usize>>> = Rc::default();
    let exec_wires: Rc<RefCell<Vec<dsc_sem::Wire>>> = Rc::default();
    let breakpoints: Rc<RefCell<Vec<usize>>> = Rc::default();

    let capture = Capture::default();
    let mut session = DebugSession::new(&sheet, &natives, Box::new(capture.clone())).unwrap();

    // Print is node index 2 (Start, Add, Print).
    session.add_node_breakpoint(2);

    {
        let activated = activated.clone();
        session.hooks.on_node_activated =
            Some(Box::new(move |node| activated.borrow_mut().push(node)));
    }
    {
        let exec_wires = exec_wires.clone();
        session.hooks.on_execution_wire =
            Some(Box::new(move |wire| exec_wires.borrow_mut().push(wire)));
    }
    {
        let breakpoints = breakpoints.clone();
        session.hooks.on_node_breakpoint =
            Some(Box::new(move |node| breakpoints.borrow_mut().push(node)));
    }

    // First continue stops at the Print breakpoint, before any output.
    session.continue_run();
    assert!(!session.is_halted());
    assert_eq!(*breakpoints.borrow(), vec![2]);

    // Continuing again finishes the program.
    session.continue_run();
    assert!(session.is_halted());
    assert_eq!(capture.contents(), "42\n");

    // The Add node and the Print node both activated, and the execution
    // wire from Start was followed.
    assert!(activated.borrow().contains(&1));
    assert!(activated.borrow().contains(&2));
    assert!(!exec_wires.borrow().is_empty());
}

#[test]
fn runtime_division_by_zero_reports_failure() {
    let natives = NativeRegistry::new();
    let handler = Handler::new();
    let sheet = load_string(
        "[Variable(zero, Integer, 0)]\n\
         Start~#1\n\
         zero~#2\n\
         Div(10, #2)~#3\n\
         Print(#1, #3)\n",
        "div.dc",
        &CompileOptions::default(),
        &natives,
        &handler,
    );
    assert!(!sheet.has_errors, "{:?}", handler.diagnostics());

    let capture = Capture::default();
    let ok = run_sheet_with_output(&sheet, &natives, Box::new(capture.clone())).unwrap();
    assert!(!ok);
    assert!(capture.contents().contains("Division by 0"));
}
