use std::io::Write;
use std::process::{Command, Output};

use tempfile::NamedTempFile;

fn orus() -> Command {
    Command::new(env!("CARGO_BIN_EXE_orus"))
}

fn program(source: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".orus").tempfile().expect("create temp file");
    file.write_all(source.as_bytes()).expect("write program");
    file
}

fn run(source: &str, flags: &[&str]) -> Output {
    let file = program(source);
    orus()
        .arg("run")
        .arg(file.path())
        .args(flags)
        .env_remove("ORUS_LOG")
        .env("NO_COLOR", "1")
        .output()
        .expect("failed to run orus")
}

fn stdout(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

fn stderr(out: &Output) -> String {
    String::from_utf8_lossy(&out.stderr).into_owned()
}

const FIB: &str = "
.func main 0
    LOAD_CONST R1, @fib
    LOAD_I32_CONST R2, 20
    CALL_R R1, R2, 1, R3
    RETURN_R R3
.end
.func fib 1
    LOAD_I32_CONST R65, 2
    LT_I32_R R66, R64, R65
    JUMP_IF_NOT_R R66, recurse
    RETURN_R R64
recurse:
    LOAD_I32_CONST R67, 1
    SUB_I32_R R68, R64, R67
    LOAD_CONST R69, @fib
    CALL_R R69, R68, 1, R70
    LOAD_I32_CONST R67, 2
    SUB_I32_R R68, R64, R67
    CALL_R R69, R68, 1, R71
    ADD_I32_R R72, R70, R71
    RETURN_R R72
.end
";

// --- run ---

#[test]
fn run_prints_result() {
    let out = run(FIB, &[]);
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out).trim(), "6765");
}

#[test]
fn void_result_prints_nothing() {
    let out = run(
        r#"
.func main 0
    LOAD_CONST R1, "hello"
    PRINT_R R1
    RETURN_VOID
.end
"#,
        &[],
    );
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "hello\n");
}

#[test]
fn optimized_run_matches_plain_run() {
    let source = "
.func main 0
    LOAD_I32_CONST R192, 5
    MOVE_I32 R64, R192
    MOVE R1, R1
    RETURN_R R64
.end
";
    let plain = run(source, &[]);
    let optimized = run(source, &["--optimize"]);
    assert_eq!(stdout(&plain).trim(), "5");
    assert_eq!(stdout(&optimized).trim(), "5");
}

#[test]
fn stats_are_json_on_stderr() {
    let out = run(
        "
.func main 0
    LOAD_I32_CONST R192, 5
    MOVE_I32 R64, R192
    RETURN_R R64
.end
",
        &["--optimize", "--stats"],
    );
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let v: serde_json::Value = serde_json::from_str(stderr(&out).trim()).expect("stats JSON");
    assert_eq!(v["exec"]["instructions"], 2);
    assert_eq!(v["exec"]["calls"], 1);
    assert_eq!(v["exec"]["errors_raised"], 0);
    assert_eq!(v["gc"]["collections"], 0);
    assert_eq!(v["optimizer"]["load_move_fusions"], 1);
}

#[test]
fn calls_are_counted() {
    let out = run(FIB, &["--stats"]);
    let v: serde_json::Value = serde_json::from_str(stderr(&out).trim()).expect("stats JSON");
    // the entry frame plus every fib invocation
    assert_eq!(v["exec"]["calls"], 21892);
    assert!(v["exec"]["max_frame_depth"].as_u64().unwrap() >= 20);
}

// --- errors ---

#[test]
fn assembly_error_exits_1_with_snippet() {
    let out = run(".func main 0\n    ADD_I32 R1, R2, R3\n.end\n", &[]);
    assert_eq!(out.status.code(), Some(1));
    let err = stderr(&out);
    assert!(err.contains("error: unknown mnemonic 'ADD_I32'"), "stderr: {err}");
    assert!(err.contains("--> 2:5"), "stderr: {err}");
    assert!(err.contains("ADD_I32_R"), "stderr: {err}");
    assert!(!err.contains("\x1b["), "NO_COLOR should disable ANSI: {err}");
}

#[test]
fn assembly_error_as_json() {
    let out = run(".func main 0\n    JUMP nowhere\n.end\n", &["--json"]);
    assert_eq!(out.status.code(), Some(1));
    let v: serde_json::Value = serde_json::from_str(stderr(&out).trim()).expect("diagnostic JSON");
    assert_eq!(v["severity"], "error");
    assert_eq!(v["message"], "label 'nowhere' is used but never defined");
    assert_eq!(v["labels"][0]["line"], 2);
    assert_eq!(v["labels"][0]["col"], 10);
}

#[test]
fn uncaught_error_exits_2() {
    let out = run(
        "
.func main 0
    LOAD_I32_CONST R1, 1
    LOAD_I32_CONST R2, 0
    DIV_I32_R R3, R1, R2
    RETURN_R R3
.end
",
        &["--json"],
    );
    assert_eq!(out.status.code(), Some(2));
    let v: serde_json::Value = serde_json::from_str(stderr(&out).trim()).expect("diagnostic JSON");
    assert_eq!(v["message"], "uncaught RuntimeError: Division by zero");
    assert_eq!(v["labels"][0]["line"], 5);
    assert_eq!(v["labels"][0]["col"], 5);
    assert_eq!(v["error"]["kind"], "RuntimeError");
    assert_eq!(v["error"]["function"], "main");
    assert_eq!(v["error"]["offset"], 8);
    assert_eq!(v["error"]["instruction"], "DIV_I32_R R3, R1, R2");
}

#[test]
fn uncaught_error_shows_bytecode_line() {
    let out = run(
        "
.func main 0
    LOAD_I32_CONST R1, 1
    LOAD_I32_CONST R2, 0
    MOD_I32_R R3, R1, R2
    RETURN_R R3
.end
",
        &[],
    );
    assert_eq!(out.status.code(), Some(2));
    let err = stderr(&out);
    assert!(err.contains("--> 5:5"), "stderr: {err}");
    assert!(err.contains("= RuntimeError main+0008  MOD_I32_R R3, R1, R2  (5:5)"), "stderr: {err}");
}

#[test]
fn caught_error_exits_0() {
    let out = run(
        "
.func main 0
    TRY_BEGIN R10, handler
    LOAD_I32_CONST R1, 2147483647
    INC_I32_R R1
    TRY_END
handler:
    PRINT_R R10
    RETURN_VOID
.end
",
        &[],
    );
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    assert_eq!(stdout(&out), "Error: Integer overflow\n");
}

#[test]
fn missing_file_exits_1() {
    let out = orus().args(["run", "/definitely/not/here.orus"]).output().expect("failed to run orus");
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("cannot read"));
}

#[test]
fn bad_gc_config_is_rejected() {
    let file = program(".func main 0\nRETURN_VOID\n.end\n");
    let out = orus()
        .arg("run")
        .arg(file.path())
        .env("ORUS_GC_GROWTH", "0.5")
        .output()
        .expect("failed to run orus");
    assert_eq!(out.status.code(), Some(1));
    assert!(stderr(&out).contains("ORUS_GC_GROWTH"));
}

// --- disasm ---

#[test]
fn disasm_lists_functions_and_mnemonics() {
    let file = program(FIB);
    let out = orus().arg("disasm").arg(file.path()).output().expect("failed to run orus");
    assert!(out.status.success(), "stderr: {}", stderr(&out));
    let listing = stdout(&out);
    assert!(listing.contains("== main (arity 0) =="), "listing: {listing}");
    assert!(listing.contains("== fib (arity 1) =="), "listing: {listing}");
    assert!(listing.contains("JUMP_IF_NOT_R"), "listing: {listing}");
    assert!(listing.contains("CALL_R"), "listing: {listing}");
}

#[test]
fn disasm_optimize_removes_moves() {
    let source = ".func main 0\n    MOVE R1, R1\n    RETURN_VOID\n.end\n";
    let file = program(source);
    let plain = orus().arg("disasm").arg(file.path()).output().expect("failed to run orus");
    let optimized = orus().args(["disasm", "--optimize"]).arg(file.path()).output().expect("failed to run orus");
    assert!(stdout(&plain).contains("MOVE"));
    assert!(!stdout(&optimized).contains("MOVE"));
    assert!(stdout(&optimized).contains("RETURN_VOID"));
}
