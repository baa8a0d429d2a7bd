//! End-to-end interpreter tests: source text in, captured output out.

use ember_runtime::vm::{InterpretResult, Output, Vm, VmOptions};

fn run(source: &str) -> String {
    let mut vm = Vm::new_captured();
    let result = vm.interpret(source, "interpreter_test.em");
    assert_eq!(result, InterpretResult::Ok, "source failed:\n{}", source);
    vm.take_output()
}

fn run_result(source: &str) -> (InterpretResult, String) {
    let mut vm = Vm::new_captured();
    let result = vm.interpret(source, "interpreter_test.em");
    let output = vm.take_output();
    (result, output)
}

#[test]
fn test_arithmetic_precedence() {
    assert_eq!(run("echo 1 + 2 * 3\n"), "7\n");
    assert_eq!(run("echo (1 + 2) * 3\n"), "9\n");
    assert_eq!(run("echo 2 ** 3 ** 2\n"), "512\n");
    assert_eq!(run("echo 7 // 2\n"), "3\n");
    assert_eq!(run("echo -7 // 2\n"), "-4\n");
    assert_eq!(run("echo 7 % 3\n"), "1\n");
    assert_eq!(run("echo -7 % 3\n"), "2\n");
    assert_eq!(run("echo 7 % -3\n"), "-2\n");
}

#[test]
fn test_bitwise_operators() {
    assert_eq!(run("echo 6 & 3\n"), "2\n");
    assert_eq!(run("echo 6 | 3\n"), "7\n");
    assert_eq!(run("echo 6 ^ 3\n"), "5\n");
    assert_eq!(run("echo 1 << 4\n"), "16\n");
    assert_eq!(run("echo 16 >> 2\n"), "4\n");
    assert_eq!(run("echo ~0\n"), "-1\n");
}

#[test]
fn test_for_in_range() {
    let source = "var s = \"\"\nfor i in 0..3 {\ns += to_string(i)\n}\necho s\n";
    assert_eq!(run(source), "012\n");
}

#[test]
fn test_descending_range() {
    let source = "var s = \"\"\nfor i in 3..0 {\ns += to_string(i)\n}\necho s\n";
    assert_eq!(run(source), "321\n");
}

#[test]
fn test_inheritance_with_parent_call() {
    let source = "class A {\nf() { return 1 }\n}\nclass B < A {\nf() { return parent.f() + 1 }\n}\necho B().f()\n";
    assert_eq!(run(source), "2\n");
}

#[test]
fn test_try_catch_finally() {
    let source = "try {\ndie Exception(\"x\")\n} catch Exception as e {\necho e.message\n} finally {\necho \"f\"\n}\n";
    assert_eq!(run(source), "x\nf\n");
}

#[test]
fn test_finally_runs_without_exception() {
    let source = "try {\necho \"body\"\n} finally {\necho \"f\"\n}\necho \"after\"\n";
    assert_eq!(run(source), "body\nf\nafter\n");
}

#[test]
fn test_uncaught_in_finally_only_try_repropagates() {
    let source = "try {\ntry {\ndie Exception(\"inner\")\n} finally {\necho \"cleanup\"\n}\n} catch Exception as e {\necho e.message\n}\n";
    assert_eq!(run(source), "cleanup\ninner\n");
}

#[test]
fn test_dict_insertion_order_and_removal() {
    let source = "var d = {a: 1, b: 2}\nd.remove(\"a\")\necho d.keys()\n";
    assert_eq!(run(source), "[b]\n");
}

#[test]
fn test_dict_keys_order_after_updates() {
    let source = "var d = {a: 1, b: 2, c: 3}\nd.set(\"a\", 9)\nd.remove(\"b\")\nd.set(\"d\", 4)\necho d.keys()\n";
    assert_eq!(run(source), "[a, c, d]\n");
}

#[test]
fn test_variadic_collects_surplus() {
    let source = "def add(...) {\nvar s = 0\nfor x in __args__ {\ns += x\n}\nreturn s\n}\necho add(1, 2, 3, 4)\n";
    assert_eq!(run(source), "10\n");
}

#[test]
fn test_variadic_zero_surplus() {
    let source = "def count(...) {\nreturn __args__.length()\n}\necho count()\n";
    assert_eq!(run(source), "0\n");
}

#[test]
fn test_missing_arguments_fill_with_nil() {
    let source = "def f(a, b) {\nreturn b\n}\necho f(1) == nil\n";
    assert_eq!(run(source), "true\n");
}

#[test]
fn test_closures_capture_by_reference() {
    let source = "def make() {\nvar n = 0\ndef inc() {\nn += 1\nreturn n\n}\nreturn inc\n}\nvar c = make()\nc()\nc()\necho c()\n";
    assert_eq!(run(source), "3\n");
}

#[test]
fn test_two_closures_share_one_upvalue() {
    let source = "def make() {\nvar n = 0\ndef inc() {\nn += 1\nreturn n\n}\ndef get() {\nreturn n\n}\nreturn [inc, get]\n}\nvar pair = make()\npair[0]()\npair[0]()\necho pair[1]()\n";
    assert_eq!(run(source), "2\n");
}

#[test]
fn test_string_interpolation() {
    assert_eq!(run("var x = 10\necho \"val=${x + 1}!\"\n"), "val=11!\n");
    assert_eq!(run("echo \"${1}${2}\"\n"), "12\n");
    assert_eq!(run("var n = \"w\"\necho \"a${n}b${n}c\"\n"), "awbwc\n");
}

#[test]
fn test_string_escapes_roundtrip() {
    assert_eq!(run("echo \"a\\tb\"\n"), "a\tb\n");
    assert_eq!(run("echo \"\\x41\\u00e9\"\n"), "Aé\n");
    assert_eq!(run("echo \"\\$notinterp\"\n"), "$notinterp\n");
}

#[test]
fn test_using_when() {
    let source = "using 2 {\nwhen 1 {\necho \"one\"\n}\nwhen 2 {\necho \"two\"\n}\ndefault {\necho \"other\"\n}\n}\n";
    assert_eq!(run(source), "two\n");
    let strings =
        "using \"b\" {\nwhen \"a\" {\necho 1\n}\nwhen \"b\", \"c\" {\necho 2\n}\n}\necho \"end\"\n";
    assert_eq!(run(strings), "2\nend\n");
    let fallback = "using 9 {\nwhen 1 {\necho 1\n}\ndefault {\necho \"d\"\n}\n}\n";
    assert_eq!(run(fallback), "d\n");
}

#[test]
fn test_while_break_continue() {
    let source = "var i = 0\nvar total = 0\nwhile true {\ni++\nif i > 5 {\nbreak\n}\nif i % 2 == 0 {\ncontinue\n}\ntotal += i\n}\necho total\n";
    assert_eq!(run(source), "9\n");
}

#[test]
fn test_do_while() {
    let source = "var i = 0\ndo {\ni++\n} while i < 3\necho i\n";
    assert_eq!(run(source), "3\n");
}

#[test]
fn test_iter_loop() {
    let source = "var s = \"\"\niter var i = 0; i < 3; i++ {\ns += to_string(i)\n}\necho s\n";
    assert_eq!(run(source), "012\n");
}

#[test]
fn test_break_inside_try_pops_handler() {
    // Breaking out of a try body must not strand its handler on the
    // frame; a later unrelated exception in the same frame has to reach
    // its own catch, not the abandoned one.
    let source = "var log = \"\"\nwhile true {\ntry {\nbreak\n} catch Exception as e {\nlog += \"stale\"\n}\n}\ntry {\ndie Exception(\"ok\")\n} catch Exception as e {\nlog += e.message\n}\necho log\n";
    assert_eq!(run(source), "ok\n");
}

#[test]
fn test_continue_inside_try_pops_handler() {
    let source = "var out = \"\"\nvar i = 0\nwhile i < 3 {\ni++\ntry {\nif i == 2 {\ncontinue\n}\nout += to_string(i)\n} catch Exception as e {\nout += \"stale\"\n}\n}\ntry {\ndie Exception(\"boom\")\n} catch Exception as e {\nout += e.message\n}\necho out\n";
    assert_eq!(run(source), "13boom\n");
}

#[test]
fn test_break_inside_catch_does_not_overpop() {
    // By the time a catch body runs, propagation has already consumed the
    // handler; break from there must not pop an enclosing one.
    let source = "var log = \"\"\ntry {\nwhile true {\ntry {\ndie Exception(\"inner\")\n} catch Exception as e {\nlog += e.message\nbreak\n}\n}\ndie Exception(\"outer\")\n} catch Exception as e {\nlog += e.message\n}\necho log\n";
    assert_eq!(run(source), "innerouter\n");
}

#[test]
fn test_nested_loop_break_stays_inner() {
    let source = "var s = \"\"\nvar i = 0\nwhile i < 2 {\ni++\nvar j = 0\nwhile true {\nj++\nif j == 2 {\nbreak\n}\n}\ns += to_string(j)\n}\necho s\n";
    assert_eq!(run(source), "22\n");
}

#[test]
fn test_ternary_and_nil_coalesce() {
    assert_eq!(run("echo true ? 1 : 2\n"), "1\n");
    assert_eq!(run("echo false ? 1 : 2\n"), "2\n");
    assert_eq!(run("echo nil ?? \"fallback\"\n"), "fallback\n");
    assert_eq!(run("echo \"a\" ?? \"b\"\n"), "a\n");
}

#[test]
fn test_logical_operators_short_circuit() {
    assert_eq!(run("echo true and 5\n"), "5\n");
    assert_eq!(run("echo false and 5\n"), "false\n");
    assert_eq!(run("echo false or 7\n"), "7\n");
    assert_eq!(run("echo 3 or 7\n"), "3\n");
}

#[test]
fn test_truthiness_of_negative_numbers() {
    // Only negative numbers are false; zero is true.
    assert_eq!(run("echo -1 ? \"t\" : \"f\"\n"), "f\n");
    assert_eq!(run("echo 0 ? \"t\" : \"f\"\n"), "t\n");
}

#[test]
fn test_string_concat_boundaries() {
    assert_eq!(run("echo nil + \"x\"\n"), "x\n");
    assert_eq!(run("echo \"x\" + nil\n"), "x\n");
    assert_eq!(run("echo \"n=\" + 1.5\n"), "n=1.5\n");
    assert_eq!(run("echo \"ab\" * 3\n"), "ababab\n");
}

#[test]
fn test_list_operations() {
    assert_eq!(run("echo [1, 2] + [3]\n"), "[1, 2, 3]\n");
    assert_eq!(run("echo [1] * 0\n"), "[]\n");
    assert_eq!(run("echo [1, 2] * 2\n"), "[1, 2, 1, 2]\n");
    assert_eq!(run("var l = [3, 1, 2]\necho l.sort()\n"), "[1, 2, 3]\n");
    assert_eq!(
        run("var l = [1, nil, 2, nil]\necho l.compact()\n"),
        "[1, 2]\n"
    );
    assert_eq!(run("echo [1, 2, 2, 3, 1].unique()\n"), "[1, 2, 3]\n");
    assert_eq!(run("echo [\"a\", \"b\"].join(\"-\")\n"), "a-b\n");
}

#[test]
fn test_list_clone_is_independent() {
    let source = "var a = [1, 2]\nvar b = a.clone()\nb.append(3)\necho a\necho b\n";
    assert_eq!(run(source), "[1, 2]\n[1, 2, 3]\n");
}

#[test]
fn test_indexing_boundaries() {
    assert_eq!(run("var l = [1, 2, 3]\necho l[-3]\n"), "1\n");
    assert_eq!(run("var l = [1, 2, 3]\necho l[2]\n"), "3\n");
    let (result, output) = run_result(
        "var l = [1, 2, 3]\ntry {\necho l[3]\n} catch Exception as e {\necho e.message\n}\n",
    );
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "list index 3 out of range\n");
}

#[test]
fn test_index_assignment() {
    assert_eq!(run("var l = [1, 2]\nl[0] = 9\necho l\n"), "[9, 2]\n");
    assert_eq!(run("var l = [1, 2]\nl[-1] = 5\necho l\n"), "[1, 5]\n");
    assert_eq!(run("var l = [1, 2]\nl[0] += 10\necho l\n"), "[11, 2]\n");
    assert_eq!(
        run("var d = {}\nd[\"k\"] = 1\nd[\"k\"] += 2\necho d\n"),
        "{k: 3}\n"
    );
}

#[test]
fn test_ranged_indexing() {
    assert_eq!(run("echo \"hello\"[1, 3]\n"), "el\n");
    assert_eq!(run("echo \"hello\"[nil, 2]\n"), "he\n");
    assert_eq!(run("echo \"hello\"[3, nil]\n"), "lo\n");
    assert_eq!(run("echo \"hello\"[3, 1]\n"), "\n");
    assert_eq!(run("echo \"hello\"[0, 99]\n"), "hello\n");
    assert_eq!(run("echo [1, 2, 3, 4][1, 3]\n"), "[2, 3]\n");
}

#[test]
fn test_string_methods() {
    assert_eq!(run("echo \"Hello\".upper()\n"), "HELLO\n");
    assert_eq!(run("echo \"Hello\".lower()\n"), "hello\n");
    assert_eq!(run("echo \"a,b,c\".split(\",\")\n"), "[a, b, c]\n");
    assert_eq!(run("echo \"hello\".index_of(\"ll\")\n"), "2\n");
    assert_eq!(run("echo \"hello\".replace(\"l\", \"L\")\n"), "heLLo\n");
    assert_eq!(run("echo \"  x \".trim()\n"), "x\n");
    assert_eq!(run("echo \"5\".lpad(3, \"0\")\n"), "005\n");
    assert_eq!(run("echo \"abc\".length()\n"), "3\n");
    // Codepoint-aware length and indexing.
    assert_eq!(run("echo \"héllo\".length()\n"), "5\n");
    assert_eq!(run("echo \"héllo\"[1]\n"), "é\n");
}

#[test]
fn test_string_iteration() {
    let source = "var s = \"\"\nfor c in \"abc\" {\ns += c\ns += \".\"\n}\necho s\n";
    assert_eq!(run(source), "a.b.c.\n");
}

#[test]
fn test_dict_iteration_two_variables() {
    let source = "var out = \"\"\nfor k, v in {a: 1, b: 2} {\nout += k + \"=\" + v + \";\"\n}\necho out\n";
    assert_eq!(run(source), "a=1;b=2;\n");
}

#[test]
fn test_bytes() {
    assert_eq!(run("echo to_bytes([104, 105]).to_string()\n"), "hi\n");
    assert_eq!(run("var b = to_bytes(\"hi\")\necho b[0]\n"), "104\n");
    assert_eq!(run("var b = to_bytes(\"hi\")\nb[0] = 72\necho b.to_string()\n"), "Hi\n");
    assert_eq!(run("echo to_bytes(\"ab\") + to_bytes(\"cd\")\n"), "(61 62 63 64)\n");
}

#[test]
fn test_class_fields_and_statics() {
    let source = "class C {\nstatic var count = 5\nvar name = \"c\"\nstatic get() {\nreturn C.count\n}\n}\necho C.get()\necho C.count\necho C().name\n";
    assert_eq!(run(source), "5\n5\nc\n");
}

#[test]
fn test_instance_properties_do_not_leak_to_class() {
    let source = "class P {\nvar x = 1\n}\nvar a = P()\nvar b = P()\na.x = 99\necho a.x\necho b.x\n";
    assert_eq!(run(source), "99\n1\n");
}

#[test]
fn test_initializer_and_self() {
    let source = "class Point {\nPoint(x, y) {\nself.x = x\nself.y = y\n}\nsum() {\nreturn self.x + self.y\n}\n}\necho Point(3, 4).sum()\n";
    assert_eq!(run(source), "7\n");
}

#[test]
fn test_inherited_initializer() {
    let source = "class Base {\nBase(v) {\nself.v = v\n}\n}\nclass Child < Base {\n}\necho Child(7).v\n";
    assert_eq!(run(source), "7\n");
}

#[test]
fn test_exception_subclass_catch() {
    let source = "class MyError < Exception {\n}\ntry {\ndie MyError(\"custom\")\n} catch Exception as e {\necho e.message\n}\n";
    assert_eq!(run(source), "custom\n");
}

#[test]
fn test_catch_specific_subclass_misses_others() {
    let source = "class AErr < Exception {\n}\nclass BErr < Exception {\n}\ntry {\ntry {\ndie BErr(\"b\")\n} catch AErr as e {\necho \"wrong\"\n}\n} catch BErr as e {\necho \"right\"\n}\n";
    assert_eq!(run(source), "right\n");
}

#[test]
fn test_private_members() {
    let source = "class S {\n_secret() {\nreturn 41\n}\nopen() {\nreturn self._secret() + 1\n}\n}\necho S().open()\n";
    assert_eq!(run(source), "42\n");
    let (result, _) = run_result("class S {\n_secret() {\nreturn 1\n}\n}\necho S()._secret()\n");
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn test_stack_overflow_is_catchable() {
    let source = "def f() {\nreturn f()\n}\ntry {\nf()\n} catch Exception as e {\necho e.message\n}\n";
    assert_eq!(run(source), "stack overflow\n");
}

#[test]
fn test_division_by_zero_raises() {
    let (result, output) = run_result(
        "try {\necho 1 // 0\n} catch Exception as e {\necho e.message\n}\n",
    );
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "integer division by zero\n");
    let (result, output) = run_result(
        "try {\necho 1 % 0\n} catch Exception as e {\necho e.message\n}\n",
    );
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "modulo by zero\n");
}

#[test]
fn test_assert_statement() {
    assert_eq!(run("assert true\necho \"ok\"\n"), "ok\n");
    let source = "try {\nassert false, \"boom\"\n} catch Exception as e {\necho e.message\n}\n";
    assert_eq!(run(source), "assertion failed: boom\n");
}

#[test]
fn test_undefined_variable_raises() {
    let (result, _) = run_result("echo missing\n");
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn test_unhandled_exception_exits_runtime_error() {
    let (result, output) = run_result("die Exception(\"nope\")\n");
    assert_eq!(result, InterpretResult::RuntimeError);
    assert_eq!(output, "");
}

#[test]
fn test_interning_identity() {
    // Concatenation re-interns: equal bytes, same object identity.
    assert_eq!(run("echo id(\"abc\") == id(\"ab\" + \"c\")\n"), "true\n");
}

#[test]
fn test_int_to_string_roundtrip() {
    assert_eq!(
        run("echo int(to_string(123456789)) == 123456789\n"),
        "true\n"
    );
    assert_eq!(run("echo int(to_string(0)) == 0\n"), "true\n");
}

#[test]
fn test_number_formatting() {
    assert_eq!(run("echo 1 / 4\n"), "0.25\n");
    assert_eq!(run("echo 10 / 2\n"), "5\n");
    assert_eq!(run("echo 1e20\n"), "1e+20\n");
}

#[test]
fn test_gc_stress_survives() {
    let mut vm = Vm::with_options(VmOptions {
        min_heap: Some(4096),
        ..VmOptions::default()
    });
    vm.out = Output::Buffer(Vec::new());
    let source = "var keep = []\niter var i = 0; i < 500; i++ {\nvar garbage = [1, 2, 3] + [4, 5, 6]\nif i % 100 == 0 {\nkeep.append(to_string(i))\n}\n}\necho keep\n";
    let result = vm.interpret(source, "gc_stress_test.em");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(vm.take_output(), "[0, 100, 200, 300, 400]\n");
    assert!(vm.heap.collections > 0, "expected at least one collection");
}

#[test]
fn test_custom_iterable_class() {
    let source = "class Pair {\nPair(a, b) {\nself.a = a\nself.b = b\n}\n@itern(prev) {\nif prev == nil {\nreturn 0\n}\nif prev == 0 {\nreturn 1\n}\nreturn nil\n}\n@iter(key) {\nreturn key == 0 ? self.a : self.b\n}\n}\nvar s = \"\"\nfor x in Pair(\"x\", \"y\") {\ns += x\n}\necho s\n";
    assert_eq!(run(source), "xy\n");
}

#[test]
fn test_bound_method_carries_receiver() {
    let source = "class Greeter {\nGreeter(name) {\nself.name = name\n}\ngreet() {\nreturn \"hi \" + self.name\n}\n}\nvar m = Greeter(\"ann\").greet\necho m()\n";
    assert_eq!(run(source), "hi ann\n");
}

#[test]
fn test_echo_renders_collections() {
    assert_eq!(run("echo [1, \"two\", [3]]\n"), "[1, two, [3]]\n");
    assert_eq!(run("echo {a: 1, b: [2]}\n"), "{a: 1, b: [2]}\n");
    assert_eq!(run("echo 0..3\n"), "0..3\n");
}
