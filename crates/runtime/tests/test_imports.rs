//! Module loader tests: relative imports, selective imports, caching,
//! and the EMBER_PATH search root.

use ember_runtime::vm::{InterpretResult, Vm};
use serial_test::serial;
use std::fs;

fn run_file(dir: &std::path::Path, main: &str) -> (InterpretResult, String) {
    let path = dir.join("main.em");
    fs::write(&path, main).unwrap();
    let mut vm = Vm::new_captured();
    let result = vm.interpret(main, path.to_str().unwrap());
    let output = vm.take_output();
    (result, output)
}

#[test]
fn test_relative_import_binds_module() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("util.em"),
        "def helper() {\nreturn 21\n}\nvar value = 2\n",
    )
    .unwrap();

    let (result, output) = run_file(
        dir.path(),
        "import .util\necho util.helper() * util.value\n",
    );
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "42\n");
}

#[test]
fn test_import_with_alias() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("util.em"), "var value = 9\n").unwrap();

    let (result, output) = run_file(dir.path(), "import .util as u\necho u.value\n");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "9\n");
}

#[test]
fn test_selective_import_ejects_module_binding() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("util.em"),
        "def helper() {\nreturn 7\n}\nvar other = 1\n",
    )
    .unwrap();

    let (result, output) = run_file(
        dir.path(),
        "import .util { helper }\necho helper()\n",
    );
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "7\n");

    // The module binding itself was ejected.
    let (result, _) = run_file(
        dir.path(),
        "import .util { helper }\necho util.other\n",
    );
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn test_import_all() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(
        dir.path().join("util.em"),
        "var a = 1\nvar b = 2\nvar _hidden = 3\n",
    )
    .unwrap();

    let (result, output) = run_file(dir.path(), "import .util { * }\necho a + b\n");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "3\n");

    // Underscore-prefixed members stay private.
    let (result, _) = run_file(dir.path(), "import .util { * }\necho _hidden\n");
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn test_private_member_cannot_be_selected() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("util.em"), "var _hidden = 3\n").unwrap();

    let (result, _) = run_file(dir.path(), "import .util { _hidden }\n");
    assert_eq!(result, InterpretResult::RuntimeError);
}

#[test]
fn test_repeat_import_runs_top_level_once() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("loud.em"), "echo \"loaded\"\nvar x = 1\n").unwrap();
    fs::write(dir.path().join("a.em"), "import .loud\n").unwrap();

    let (result, output) = run_file(
        dir.path(),
        "import .a\nimport .loud\necho loud.x\n",
    );
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "loaded\n1\n");
}

#[test]
fn test_nested_directory_import() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("pkg")).unwrap();
    fs::write(dir.path().join("pkg").join("inner.em"), "var v = 5\n").unwrap();

    let (result, output) = run_file(dir.path(), "import .pkg.inner\necho inner.v\n");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "5\n");
}

#[test]
fn test_index_file_import() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("pkg")).unwrap();
    fs::write(dir.path().join("pkg").join("index.em"), "var v = 11\n").unwrap();

    let (result, output) = run_file(dir.path(), "import .pkg\necho pkg.v\n");
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "11\n");
}

#[test]
fn test_missing_import_is_a_compile_error() {
    let dir = tempfile::tempdir().unwrap();
    let (result, _) = run_file(dir.path(), "import .missing\n");
    assert_eq!(result, InterpretResult::CompileError);
}

#[test]
fn test_circular_import_is_a_compile_error() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("a.em"), "import .b\n").unwrap();
    fs::write(dir.path().join("b.em"), "import .a\n").unwrap();

    let (result, _) = run_file(dir.path(), "import .a\n");
    assert_eq!(result, InterpretResult::CompileError);
}

#[test]
fn test_module_values_are_assignable() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("state.em"), "var counter = 0\n").unwrap();

    let (result, output) = run_file(
        dir.path(),
        "import .state\nstate.counter = 5\necho state.counter\n",
    );
    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "5\n");
}

#[test]
#[serial]
fn test_ember_path_search_root() {
    let libs = tempfile::tempdir().unwrap();
    fs::write(libs.path().join("shared.em"), "var v = 3\n").unwrap();

    let script_dir = tempfile::tempdir().unwrap();
    // Safety: tests in this file run serially; no other thread touches
    // the environment concurrently.
    unsafe { std::env::set_var("EMBER_PATH", libs.path()) };
    let (result, output) = run_file(script_dir.path(), "import shared\necho shared.v\n");
    unsafe { std::env::remove_var("EMBER_PATH") };

    assert_eq!(result, InterpretResult::Ok);
    assert_eq!(output, "3\n");
}
