// Integration tests for the Moss interpreter.
//
// Each test drives a complete program through the VM and checks the
// captured output or the interpret result. Coverage spans expressions,
// globals and scoping, control flow, functions and closures, classes with
// inheritance, runtime errors, compiler limits, and GC stress.

use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use moss::vm::{InterpretResult, Vm};
use pretty_assertions::assert_eq;

/// Program output sink the test keeps a handle to.
#[derive(Clone, Default)]
struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn run(source: &str) -> (InterpretResult, String) {
    let buffer = SharedBuffer::default();
    let mut vm = Vm::with_output(Box::new(buffer.clone()));
    let result = vm.interpret(source);
    let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
    (result, output)
}

fn run_ok(source: &str) -> String {
    let (result, output) = run(source);
    assert_eq!(result, InterpretResult::Ok, "program did not run cleanly:\n{}", source);
    output
}

// === Expressions ===

#[test]
fn arithmetic_respects_precedence() {
    assert_eq!(run_ok("print 1 + 2 * 3;"), "7\n");
    assert_eq!(run_ok("print (1 + 2) * 3;"), "9\n");
    assert_eq!(run_ok("print 10 - 4 / 2;"), "8\n");
    assert_eq!(run_ok("print -3 + 5;"), "2\n");
}

#[test]
fn number_printing_trims_integral_values() {
    assert_eq!(run_ok("print 2.5;"), "2.5\n");
    assert_eq!(run_ok("print 5 / 2;"), "2.5\n");
    assert_eq!(run_ok("print 4 / 2;"), "2\n");
}

#[test]
fn string_concatenation() {
    assert_eq!(run_ok("var a = \"st\"; var b = \"r\"; print a + b + \"ing\";"), "string\n");
}

#[test]
fn concatenated_strings_are_interned() {
    // Interning makes content equality coincide with identity.
    assert_eq!(run_ok("print \"ab\" == \"a\" + \"b\";"), "true\n");
}

#[test]
fn equality_is_type_aware() {
    assert_eq!(run_ok("print nil == nil;"), "true\n");
    assert_eq!(run_ok("print nil == false;"), "false\n");
    assert_eq!(run_ok("print 0 == false;"), "false\n");
    assert_eq!(run_ok("print 1 == 1;"), "true\n");
    assert_eq!(run_ok("print \"a\" == \"b\";"), "false\n");
    assert_eq!(run_ok("print 1 != 2;"), "true\n");
}

#[test]
fn comparisons_and_not() {
    assert_eq!(run_ok("print 1 < 2;"), "true\n");
    assert_eq!(run_ok("print 2 <= 2;"), "true\n");
    assert_eq!(run_ok("print 1 > 2;"), "false\n");
    assert_eq!(run_ok("print !nil;"), "true\n");
    assert_eq!(run_ok("print !0;"), "false\n");
}

#[test]
fn only_nil_and_false_are_falsy() {
    assert_eq!(run_ok("if (0) print \"t\"; else print \"f\";"), "t\n");
    assert_eq!(run_ok("if (\"\") print \"t\"; else print \"f\";"), "t\n");
    assert_eq!(run_ok("if (nil) print \"t\"; else print \"f\";"), "f\n");
    assert_eq!(run_ok("if (false) print \"t\"; else print \"f\";"), "f\n");
}

#[test]
fn and_or_short_circuit_to_the_deciding_value() {
    assert_eq!(run_ok("print nil or \"yes\";"), "yes\n");
    assert_eq!(run_ok("print \"first\" or \"second\";"), "first\n");
    assert_eq!(run_ok("print false and \"unreached\";"), "false\n");
    assert_eq!(run_ok("print 1 and 2;"), "2\n");
}

#[test]
fn short_circuit_skips_side_effects() {
    let source = "
        fun boom() { print \"boom\"; return true; }
        false and boom();
        true or boom();
        print \"quiet\";
    ";
    assert_eq!(run_ok(source), "quiet\n");
}

// === Globals and scoping ===

#[test]
fn globals_define_assign_and_redefine() {
    assert_eq!(run_ok("var a = 1; print a; a = 2; print a;"), "1\n2\n");
    assert_eq!(run_ok("var a = 1; var a = 2; print a;"), "2\n");
}

#[test]
fn locals_shadow_by_scope() {
    let source = "
        var a = \"global\";
        {
            var a = \"outer\";
            {
                var a = \"inner\";
                print a;
            }
            print a;
        }
        print a;
    ";
    assert_eq!(run_ok(source), "inner\nouter\nglobal\n");
}

#[test]
fn undefined_global_reads_and_writes_are_runtime_errors() {
    assert_eq!(run("print missing;").0, InterpretResult::RuntimeError);
    assert_eq!(run("missing = 1;").0, InterpretResult::RuntimeError);
}

#[test]
fn failed_global_assignment_leaves_no_binding() {
    let mut vm = Vm::with_output(Box::new(io::sink()));
    assert_eq!(vm.interpret("x = 1;"), InterpretResult::RuntimeError);
    // The rolled-back insert must not have defined `x`.
    assert_eq!(vm.interpret("print x;"), InterpretResult::RuntimeError);
}

#[test]
fn reading_a_local_in_its_own_initializer_is_a_compile_error() {
    assert_eq!(run("{ var x = x; }").0, InterpretResult::CompileError);
}

// === Control flow ===

#[test]
fn if_else_branches() {
    assert_eq!(run_ok("if (1 < 2) print \"then\";"), "then\n");
    assert_eq!(run_ok("if (1 > 2) print \"then\"; else print \"else\";"), "else\n");
}

#[test]
fn while_loops() {
    let source = "
        var sum = 0;
        var i = 1;
        while (i <= 5) {
            sum = sum + i;
            i = i + 1;
        }
        print sum;
    ";
    assert_eq!(run_ok(source), "15\n");
}

#[test]
fn for_loops_with_all_clauses() {
    let source = "
        var product = 1;
        for (var i = 1; i <= 4; i = i + 1) {
            product = product * i;
        }
        print product;
    ";
    assert_eq!(run_ok(source), "24\n");
}

#[test]
fn for_loop_clauses_are_optional() {
    let source = "
        var i = 0;
        for (; i < 3;) {
            i = i + 1;
        }
        print i;
    ";
    assert_eq!(run_ok(source), "3\n");
}

#[test]
fn fibonacci_end_to_end() {
    let source = "
        fun fib(n) {
            if (n < 2) return n;
            return fib(n - 1) + fib(n - 2);
        }
        print fib(10);
    ";
    assert_eq!(run_ok(source), "55\n");
}

// === Functions and closures ===

#[test]
fn functions_return_values_and_default_to_nil() {
    assert_eq!(run_ok("fun f() { return 7; } print f();"), "7\n");
    assert_eq!(run_ok("fun f() { } print f();"), "nil\n");
    assert_eq!(run_ok("fun f(a, b) { return a + b; } print f(40, 2);"), "42\n");
}

#[test]
fn function_values_print_by_name() {
    assert_eq!(run_ok("fun f() { } print f;"), "<fn f>\n");
    assert_eq!(run_ok("print clock;"), "<native fn>\n");
}

#[test]
fn closure_keeps_its_upvalue_alive_after_return() {
    let source = "
        fun mk() {
            var x = 1;
            fun g() { x = x + 1; return x; }
            return g;
        }
        var f = mk();
        print f();
        print f();
    ";
    assert_eq!(run_ok(source), "2\n3\n");
}

#[test]
fn sibling_closures_share_one_upvalue() {
    let source = "
        var inc;
        var get;
        {
            var shared = 0;
            fun i() { shared = shared + 1; return shared; }
            fun g() { return shared; }
            inc = i;
            get = g;
        }
        print inc();
        print inc();
        print get();
    ";
    assert_eq!(run_ok(source), "1\n2\n2\n");
}

#[test]
fn open_upvalues_see_writes_from_the_enclosing_scope() {
    let source = "
        var result;
        {
            var x = \"before\";
            fun read() { return x; }
            x = \"after\";
            result = read();
        }
        print result;
    ";
    assert_eq!(run_ok(source), "after\n");
}

#[test]
fn each_call_gets_fresh_upvalues() {
    let source = "
        fun counter() {
            var n = 0;
            fun bump() { n = n + 1; return n; }
            return bump;
        }
        var a = counter();
        var b = counter();
        print a();
        print a();
        print b();
    ";
    assert_eq!(run_ok(source), "1\n2\n1\n");
}

#[test]
fn native_clock_returns_a_number() {
    assert_eq!(run_ok("print clock() >= 0;"), "true\n");
}

// === Classes ===

#[test]
fn classes_and_instances_print_by_name() {
    assert_eq!(run_ok("class Cake { } print Cake;"), "Cake\n");
    assert_eq!(run_ok("class Cake { } print Cake();"), "Cake instance\n");
}

#[test]
fn fields_are_per_instance() {
    let source = "
        class Box { }
        var a = Box();
        var b = Box();
        a.value = 1;
        b.value = 2;
        print a.value;
        print b.value;
    ";
    assert_eq!(run_ok(source), "1\n2\n");
}

#[test]
fn setting_a_field_evaluates_to_the_value() {
    assert_eq!(run_ok("class C { } var c = C(); print c.x = 9;"), "9\n");
}

#[test]
fn methods_bind_this() {
    let source = "
        class Person {
            init(name) { this.name = name; }
            greet() { return \"hi \" + this.name; }
        }
        print Person(\"bob\").greet();
    ";
    assert_eq!(run_ok(source), "hi bob\n");
}

#[test]
fn initializer_arguments_flow_through_call() {
    let source = "
        class C {
            init(x) { this.x = x; }
            get() { return this.x; }
        }
        print C(42).get();
    ";
    assert_eq!(run_ok(source), "42\n");
}

#[test]
fn initializer_returns_the_instance_even_on_early_return() {
    let source = "
        class C {
            init() { this.x = 1; return; }
        }
        print C().x;
    ";
    assert_eq!(run_ok(source), "1\n");
}

#[test]
fn bound_methods_remember_their_receiver() {
    let source = "
        class Person {
            init(name) { this.name = name; }
            greet() { return \"hi \" + this.name; }
        }
        var m = Person(\"ada\").greet;
        print m();
        print m;
    ";
    assert_eq!(run_ok(source), "hi ada\n<fn greet>\n");
}

#[test]
fn fields_shadow_methods() {
    let source = "
        class C {
            m() { return \"method\"; }
        }
        fun f() { return \"field\"; }
        var c = C();
        print c.m();
        c.m = f;
        print c.m();
    ";
    assert_eq!(run_ok(source), "method\nfield\n");
}

#[test]
fn inherited_methods_are_copied_down() {
    let source = "
        class A { greet() { print \"hi\"; } }
        class B < A { }
        B().greet();
    ";
    assert_eq!(run_ok(source), "hi\n");
}

#[test]
fn subclass_methods_override_and_super_reaches_up() {
    let source = "
        class A { m() { return \"A\"; } }
        class B < A { m() { return \"B+\" + super.m(); } }
        print B().m();
    ";
    assert_eq!(run_ok(source), "B+A\n");
}

#[test]
fn super_method_as_a_value() {
    let source = "
        class A { m() { return \"from A\"; } }
        class B < A {
            grab() { return super.m; }
        }
        var m = B().grab();
        print m();
    ";
    assert_eq!(run_ok(source), "from A\n");
}

#[test]
fn inheriting_after_definition_keeps_method_snapshots_separate() {
    let source = "
        class A { m() { return \"A.m\"; } }
        class B < A { m() { return \"B.m\"; } }
        print A().m();
        print B().m();
    ";
    assert_eq!(run_ok(source), "A.m\nB.m\n");
}

// === Runtime errors ===

#[test]
fn arithmetic_type_errors() {
    assert_eq!(run("print 1 + nil;").0, InterpretResult::RuntimeError);
    assert_eq!(run("print 1 + \"a\";").0, InterpretResult::RuntimeError);
    assert_eq!(run("print \"a\" < \"b\";").0, InterpretResult::RuntimeError);
    assert_eq!(run("print -\"a\";").0, InterpretResult::RuntimeError);
}

#[test]
fn only_functions_and_classes_are_callable() {
    assert_eq!(run("var x = 1; x();").0, InterpretResult::RuntimeError);
    assert_eq!(run("\"hello\"();").0, InterpretResult::RuntimeError);
}

#[test]
fn arity_is_checked() {
    assert_eq!(run("fun f(a) { } f();").0, InterpretResult::RuntimeError);
    assert_eq!(run("fun f() { } f(1);").0, InterpretResult::RuntimeError);
    assert_eq!(run("class C { } C(1);").0, InterpretResult::RuntimeError);
}

#[test]
fn property_access_requires_instances() {
    assert_eq!(run("var x = 1; print x.field;").0, InterpretResult::RuntimeError);
    assert_eq!(run("var x = 1; x.field = 2;").0, InterpretResult::RuntimeError);
    assert_eq!(run("class C { } print C().missing;").0, InterpretResult::RuntimeError);
}

#[test]
fn superclass_must_be_a_class() {
    assert_eq!(run("var notclass = 1; class A < notclass { }").0, InterpretResult::RuntimeError);
}

#[test]
fn output_before_a_runtime_error_is_kept() {
    let (result, output) = run("print \"before\"; print 1 + nil; print \"after\";");
    assert_eq!(result, InterpretResult::RuntimeError);
    assert_eq!(output, "before\n");
}

// === Compile errors ===

#[test]
fn statement_level_compile_errors() {
    assert_eq!(run("return 1;").0, InterpretResult::CompileError);
    assert_eq!(run("print this;").0, InterpretResult::CompileError);
    assert_eq!(run("class A < A { }").0, InterpretResult::CompileError);
    assert_eq!(run("class C { init() { return 1; } }").0, InterpretResult::CompileError);
    assert_eq!(run("var a = 1; a + 1 = 2;").0, InterpretResult::CompileError);
    assert_eq!(run("print 1").0, InterpretResult::CompileError);
}

#[test]
fn parser_recovers_and_reports_then_discards_output() {
    // Two statements with errors still produce a single compile-error
    // result and no partial execution.
    let (result, output) = run("print 1; var; print 2;");
    assert_eq!(result, InterpretResult::CompileError);
    assert_eq!(output, "");
}

// === Limits ===

#[test]
fn at_most_255_arguments_and_parameters() {
    let params: Vec<String> = (0..255).map(|i| format!("p{}", i)).collect();
    let args: Vec<String> = (0..255).map(|_| "1".to_string()).collect();
    let fine = format!("fun f({}) {{ return 0; }} print f({});", params.join(", "), args.join(", "));
    assert_eq!(run(&fine).0, InterpretResult::Ok);

    let params: Vec<String> = (0..256).map(|i| format!("p{}", i)).collect();
    let too_many_params = format!("fun f({}) {{ return 0; }}", params.join(", "));
    assert_eq!(run(&too_many_params).0, InterpretResult::CompileError);

    let args: Vec<String> = (0..256).map(|_| "1".to_string()).collect();
    let too_many_args = format!("fun f() {{ return 0; }} f({});", args.join(", "));
    assert_eq!(run(&too_many_args).0, InterpretResult::CompileError);
}

#[test]
fn at_most_255_user_locals_per_function() {
    let fine: String = (0..255).map(|i| format!("var l{} = {};", i, i)).collect();
    assert_eq!(run(&format!("fun f() {{ {} }} f();", fine)).0, InterpretResult::Ok);

    let too_many: String = (0..256).map(|i| format!("var l{} = {};", i, i)).collect();
    assert_eq!(run(&format!("fun f() {{ {} }}", too_many)).0, InterpretResult::CompileError);
}

#[test]
fn jumps_cap_at_16_bit_distances() {
    // A then-branch bigger than 65535 bytes cannot be jumped over.
    let mut body = String::new();
    for _ in 0..14000 {
        body.push_str("x = 1;");
    }
    let source = format!("var x = 0; if (true) {{ {} }}", body);
    assert_eq!(run(&source).0, InterpretResult::CompileError);
}

#[test]
fn at_most_256_upvalues_per_function() {
    // A leaf that captures 254 grandparent locals plus 254 parent locals
    // needs 508 upvalue descriptors. Each enclosing function stays inside
    // the locals cap (slot zero + 254 variables + the nested function).
    let mut source = String::from("fun outer() {\n");
    for i in 0..254 {
        source.push_str(&format!("var g{} = 0;", i));
    }
    source.push_str("fun middle() {\n");
    for i in 0..254 {
        source.push_str(&format!("var p{} = 0;", i));
    }
    source.push_str("fun leaf() {\n");
    for i in 0..254 {
        source.push_str(&format!("g{};", i));
    }
    for i in 0..254 {
        source.push_str(&format!("p{};", i));
    }
    source.push_str("return 0;\n}\nreturn leaf;\n}\nreturn middle;\n}\n");
    assert_eq!(run(&source).0, InterpretResult::CompileError);
}

#[test]
fn too_many_constants_in_one_chunk() {
    let mut source = String::new();
    for i in 0..300 {
        source.push_str(&format!("{}.5;", i * 10));
    }
    assert_eq!(run(&source).0, InterpretResult::CompileError);
}

// === GC behavior ===

#[test]
fn stress_collection_preserves_program_semantics() {
    let source = "
        fun mk(prefix) {
            var count = 0;
            fun next() {
                count = count + 1;
                return prefix + \"-\" + \"x\";
            }
            return next;
        }
        class Node {
            init(label) { this.label = label; }
            describe() { return \"node \" + this.label; }
        }
        var gen = mk(\"item\");
        print gen();
        print gen();
        var n = Node(\"root\");
        print n.describe();
        var sum = 0;
        for (var i = 0; i < 50; i = i + 1) {
            sum = sum + i;
        }
        print sum;
    ";
    let buffer = SharedBuffer::default();
    let mut vm = Vm::with_output(Box::new(buffer.clone()));
    vm.set_gc_stress(true);
    let result = vm.interpret(source);
    let output = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "item-x\nitem-x\nnode root\n1225\n");
}

#[test]
fn stress_collection_keeps_globals_across_lines() {
    let mut vm = Vm::with_output(Box::new(io::sink()));
    vm.set_gc_stress(true);
    assert_eq!(vm.interpret("var greeting = \"hi\" + \" there\";"), InterpretResult::Ok);
    assert_eq!(vm.interpret("fun shout() { return greeting + \"!\"; }"), InterpretResult::Ok);
    assert_eq!(vm.interpret("print shout();"), InterpretResult::Ok);
}

// === Output capture of whole programs ===

#[test]
fn a_small_program_exercising_everything() {
    let source = "
        class Shape {
            init(name) { this.name = name; }
            area() { return 0; }
            describe() { return this.name + \": \" + \"area\"; }
        }
        class Square < Shape {
            init(side) {
                this.name = \"square\";
                this.side = side;
            }
            area() { return this.side * this.side; }
            describe() { return super.describe() + \" computed\"; }
        }
        var shapes = Square(3);
        print shapes.area();
        print shapes.describe();
    ";
    assert_eq!(run_ok(source), "9\nsquare: area computed\n");
}
