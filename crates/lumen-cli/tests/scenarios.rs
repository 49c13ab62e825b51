//! End-to-end scenarios A-F (spec.md §8), driven through the `lumen` binary
//! itself rather than the library API, so they also exercise argument
//! parsing and the CLI's error-formatting.

use std::io::Write;

use assert_cmd::Command;
use indoc::indoc;

fn run_script(source: &str) -> assert_cmd::assert::Assert {
    let mut file = tempfile::Builder::new().suffix(".lm").tempfile().unwrap();
    file.write_all(source.as_bytes()).unwrap();
    file.flush().unwrap();

    Command::cargo_bin("lumen")
        .unwrap()
        .arg(file.path())
        .assert()
}

#[test]
fn scenario_a_fibonacci() {
    run_script(indoc! {r#"
        fun fib(n) { if (n<2) return n; return fib(n-1)+fib(n-2) }
        System.writeString_(fib(10).toString)
    "#})
    .success()
    .stdout("55");
}

#[test]
fn scenario_b_inheritance_and_super() {
    run_script(indoc! {r#"
        class A { new() { } greet() { return "a" } }
        class B < A { new() { super() } greet() { return super.greet() + "b" } }
        System.writeString_(B.new().greet())
    "#})
    .success()
    .stdout("ab");
}

#[test]
fn scenario_c_closure_captures_mutable_local() {
    run_script(indoc! {r#"
        fun mk() { var i = 0; return Fn.new { i = i + 1; return i } }
        var f = mk()
        System.writeString_(f().toString + "," + f().toString + "," + f().toString)
    "#})
    .success()
    .stdout("1,2,3");
}

#[test]
fn scenario_d_cooperative_threads() {
    run_script(indoc! {r#"
        var t = Thread.new { Thread.yield(1); Thread.yield(2); return 3 }
        System.writeString_(t.call().toString + t.call().toString + t.call().toString)
    "#})
    .success()
    .stdout("123");
}

#[test]
fn scenario_e_map_and_list() {
    run_script(indoc! {r#"
        var m = { "a": [1,2,3] }
        System.writeString_(m["a"][2].toString)
    "#})
    .success()
    .stdout("3");
}

#[test]
fn scenario_f_break_inside_nested_loop_discards_inner_locals() {
    run_script(indoc! {r#"
        for i in 1..3 { for j in 1..3 { if (j==2) break; System.writeString_(j.toString) } }
    "#})
    .success()
    .stdout("111");
}

#[test]
fn missing_script_file_reports_io_error() {
    Command::cargo_bin("lumen")
        .unwrap()
        .arg("/no/such/file.lm")
        .assert()
        .failure();
}

#[test]
fn compile_error_reports_file_and_line() {
    let assert = run_script(indoc! {r#"
        var x =
    "#})
    .failure();
    let stderr = String::from_utf8(assert.get_output().stderr.clone()).unwrap();
    assert!(stderr.contains(".lm:"), "expected a file:line prefix, got: {stderr}");
}

#[test]
fn runtime_error_reports_message_only_no_file_prefix() {
    let assert = run_script(indoc! {r#"
        System.writeString_(null.foo)
    "#})
    .failure();
    let stderr = String::from_utf8(assert.get_output().stderr.clone()).unwrap();
    assert!(!stderr.contains(".lm:"), "runtime errors must not carry a file:line prefix, got: {stderr}");
}
