//! Integration tests for `formulate install` and `formulate test`

mod common;

use assert_fs::fixture::ChildPath;
use assert_fs::prelude::*;
use common::{exit_code, formula, stderr, TestProject, WRITE_BIN};
use predicates::prelude::*;

const HELLO_STEPS: &str = r#"
[[install_steps]]
action = "run"
command = "/bin/sh"
args = ["-c", "mkdir -p ${bin} && cp hello.sh ${bin}/hello && chmod +x ${bin}/hello"]

[[test_steps]]
action = "run"
command = "hello"
expect_stdout = "hi"

[[test_steps]]
action = "no_broken_links"
path = "${prefix}"
"#;

fn hello_from_tarball(project: &TestProject) -> String {
    let (archive, sha) = project.tarball("hello-1.0", &[("hello.sh", "#!/bin/sh\necho hi\n")]);
    format!(
        "name = \"hello\"\ndesc = \"Prints a greeting\"\n\n[[variants]]\nlabel = \"stable\"\nversion = \"1.0\"\nurl = \"{}\"\nsha256 = \"{sha}\"\n{HELLO_STEPS}",
        archive.display()
    )
}

#[test]
fn test_install_from_tarball() {
    let project = TestProject::new();
    project.write_formula("hello", &hello_from_tarball(&project));

    let output = project.run(&["install", "hello"]);

    assert_eq!(exit_code(&output), 0, "stderr: {}", stderr(&output));
    let keg = project.keg("hello", "1.0");
    ChildPath::new(keg.join("bin/hello")).assert(predicate::path::is_file());
    ChildPath::new(keg.join("INSTALL_RECEIPT.json")).assert(predicate::str::contains("\"name\": \"hello\""));
    ChildPath::new(project.root().join("opt/hello")).assert(predicate::path::exists());
    // Scratch directories are cleaned up
    let leftovers = std::fs::read_dir(project.root().join("tmp")).map(Iterator::count).unwrap_or(0);
    assert_eq!(leftovers, 0);
}

#[test]
fn test_install_with_verify_and_test_command() {
    let project = TestProject::new();
    project.write_formula("hello", &hello_from_tarball(&project));

    let (code, json) = project.run_json(&["install", "hello", "--verify"]);
    assert_eq!(code, 0, "{json}");
    assert_eq!(json["verification"][0]["passed"], true);

    let (code, json) = project.run_json(&["test", "hello"]);
    assert_eq!(code, 0, "{json}");
    // The existing keg is tested, not rebuilt
    assert_eq!(json["outcomes"][0]["status"], "reused");
    assert_eq!(json["verification"][0]["steps"].as_array().map(Vec::len), Some(2));
}

#[test]
fn test_failing_test_step_exits_3() {
    let project = TestProject::new();
    let doc = hello_from_tarball(&project).replace("expect_stdout = \"hi\"", "expect_stdout = \"bye\"");
    project.write_formula("hello", &doc);

    let output = project.run(&["test", "hello"]);

    assert_eq!(exit_code(&output), 3);
    assert!(stderr(&output).contains("bye"));
    // Verification never removes the install
    assert!(project.keg("hello", "1.0").join("bin/hello").exists());
}

#[test]
fn test_checksum_mismatch_exits_2_without_keg() {
    let project = TestProject::new();
    let doc = hello_from_tarball(&project);
    let sha = doc
        .lines()
        .find_map(|l| l.strip_prefix("sha256 = \""))
        .map(|s| s.trim_end_matches('"').to_string())
        .unwrap();
    project.write_formula("hello", &doc.replace(&sha, &"0".repeat(64)));

    let output = project.run(&["install", "hello"]);

    assert_eq!(exit_code(&output), 2);
    let err = stderr(&output);
    assert!(err.contains("Checksum mismatch"), "stderr: {err}");
    assert!(err.contains(&sha));
    assert!(!project.root().join("Cellar/hello").exists());
}

#[test]
fn test_dependencies_are_installed_first_and_visible() {
    let project = TestProject::new();
    let src = project.source_dir("greet", &[("greeting.txt", "hello from lib")]);
    project.write_formula(
        "libgreet",
        &formula(
            "libgreet",
            &src,
            &[],
            r#"
[[install_steps]]
action = "mkdir"
path = "${share}"

[[install_steps]]
action = "run"
command = "cp"
args = ["greeting.txt", "${share}/greeting.txt"]
"#,
        ),
    );
    project.write_formula(
        "app",
        &formula(
            "app",
            &src,
            &[("libgreet", "runtime")],
            r#"
[[install_steps]]
action = "run"
command = "/bin/sh"
args = ["-c", "mkdir -p ${share} && cp ${opt:libgreet}/share/greeting.txt ${share}/copied.txt"]
"#,
        ),
    );

    let output = project.run(&["install", "app"]);

    assert_eq!(exit_code(&output), 0, "stderr: {}", stderr(&output));
    ChildPath::new(project.keg("app", "1.0").join("share/copied.txt")).assert("hello from lib");
    ChildPath::new(project.keg("app", "1.0").join("INSTALL_RECEIPT.json")).assert(predicate::str::contains("libgreet"));
}

#[test]
fn test_failure_skips_dependents_and_siblings_complete() {
    let project = TestProject::new();
    let src = project.source_dir("src", &[("README", "x")]);
    let failing = "\n[[install_steps]]\naction = \"run\"\ncommand = \"/bin/sh\"\nargs = [\"-c\", \"exit 4\"]\n";
    project.write_formula("a", &formula("a", &src, &[], WRITE_BIN));
    project.write_formula("b", &formula("b", &src, &[("a", "runtime")], failing));
    project.write_formula("c", &formula("c", &src, &[("a", "build")], WRITE_BIN));
    project.write_formula("d", &formula("d", &src, &[("b", "runtime"), ("c", "runtime")], WRITE_BIN));

    let (code, json) = project.run_json(&["install", "d"]);

    assert_eq!(code, 2);
    let status = |name: &str| {
        json["outcomes"]
            .as_array()
            .and_then(|all| all.iter().find(|o| o["name"] == name))
            .map(|o| o["status"].as_str().unwrap_or_default().to_string())
    };
    assert_eq!(status("a").as_deref(), Some("installed"));
    assert_eq!(status("b").as_deref(), Some("failed"));
    assert_eq!(status("c").as_deref(), Some("installed"));
    assert_eq!(status("d").as_deref(), Some("skipped"));

    let b = json["outcomes"].as_array().unwrap().iter().find(|o| o["name"] == "b").unwrap();
    assert!(b["error"].as_str().unwrap().contains("status 4"));
    assert!(project.keg("c", "1.0").exists());
    assert!(!project.keg("b", "1.0").exists());
    assert!(!project.keg("d", "1.0").exists());
}

#[test]
fn test_dangling_symlink_exits_3_and_keeps_keg() {
    let project = TestProject::new();
    let src = project.source_dir("src", &[("README", "x")]);
    let steps = format!(
        "{WRITE_BIN}\n[[install_steps]]\naction = \"symlink\"\ntarget = \"${{lib}}/libmissing.so\"\nlink = \"${{lib}}/libfoo.so\"\n"
    );
    project.write_formula("dangle", &formula("dangle", &src, &[], &steps));

    let output = project.run(&["install", "dangle"]);

    assert_eq!(exit_code(&output), 3);
    assert!(stderr(&output).contains("libfoo.so"));
    assert!(project.keg("dangle", "1.0").join("bin/dangle").exists());
    assert!(project.keg("dangle", "1.0").join("lib/libfoo.so").symlink_metadata().is_ok());
}

#[test]
fn test_unknown_formula_exits_1() {
    let project = TestProject::new();
    let output = project.run(&["install", "nothing-here"]);
    assert_eq!(exit_code(&output), 1);
    assert!(stderr(&output).contains("nothing-here"));
}
