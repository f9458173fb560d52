//! Integration tests for Stagecraft

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::Path;
    use tempfile::TempDir;

    fn stagecraft() -> Command {
        cargo_bin_cmd!("stagecraft")
    }

    /// A small two-stage document whose actions run under `sh`
    fn write_document(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("stages.json");
        std::fs::write(
            &path,
            r#"{
                "stages": [
                    {
                        "name": "compile",
                        "base": "scratch",
                        "args": [{"name": "GREETING", "default": "hello"}],
                        "actions": ["mkdir -p out && printf '${GREETING}' > out/app"],
                        "outputs": ["out/app"]
                    },
                    {
                        "name": "package",
                        "base": "scratch",
                        "actions": ["mkdir -p etc && printf v1 > etc/banner"],
                        "copies": [{"from": "compile", "pattern": "out/app", "dest": "usr/bin"}],
                        "outputs": ["usr/bin/app"]
                    }
                ],
                "targets": ["package"]
            }"#,
        )
        .unwrap();
        path
    }

    #[test]
    fn help_displays() {
        stagecraft()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("Cache-aware build graph evaluator"));
    }

    #[test]
    fn version_displays() {
        stagecraft()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("stagecraft"));
    }

    #[test]
    fn build_composes_target_output() {
        let dir = TempDir::new().unwrap();
        let doc = write_document(dir.path());
        let out = dir.path().join("dist");

        stagecraft()
            .args(["build", "-f"])
            .arg(&doc)
            .arg("--cache-dir")
            .arg(dir.path().join("cache"))
            .arg("--output")
            .arg(&out)
            .assert()
            .success()
            .stdout(predicate::str::contains("compile"))
            .stdout(predicate::str::contains("package"));

        let app = out.join("package").join("usr/bin/app");
        assert_eq!(std::fs::read_to_string(app).unwrap(), "hello");
        let banner = out.join("package").join("etc/banner");
        assert_eq!(std::fs::read_to_string(banner).unwrap(), "v1");
    }

    #[test]
    fn build_honors_arg_override() {
        let dir = TempDir::new().unwrap();
        let doc = write_document(dir.path());
        let out = dir.path().join("dist");

        stagecraft()
            .args(["build", "-f"])
            .arg(&doc)
            .arg("--cache-dir")
            .arg(dir.path().join("cache"))
            .args(["--arg", "GREETING=salve"])
            .arg("--output")
            .arg(&out)
            .assert()
            .success();

        let app = out.join("package").join("usr/bin/app");
        assert_eq!(std::fs::read_to_string(app).unwrap(), "salve");
    }

    #[test]
    fn build_reports_failing_stage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stages.json");
        std::fs::write(
            &path,
            r#"{
                "stages": [
                    {"name": "doomed", "base": "scratch", "actions": ["exit 7"]}
                ],
                "targets": ["doomed"]
            }"#,
        )
        .unwrap();

        stagecraft()
            .args(["build", "-f"])
            .arg(&path)
            .arg("--cache-dir")
            .arg(dir.path().join("cache"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("build failed"));
    }

    #[test]
    fn build_missing_document() {
        stagecraft()
            .args(["build", "-f", "/nonexistent/stages.json"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }

    #[test]
    fn build_rejects_bad_override() {
        let dir = TempDir::new().unwrap();
        let doc = write_document(dir.path());

        stagecraft()
            .args(["build", "-f"])
            .arg(&doc)
            .args(["--arg", "NOEQUALS"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("NAME=VALUE"));
    }

    #[test]
    fn build_json_report() {
        let dir = TempDir::new().unwrap();
        let doc = write_document(dir.path());

        stagecraft()
            .args(["build", "--json", "-f"])
            .arg(&doc)
            .arg("--cache-dir")
            .arg(dir.path().join("cache"))
            .assert()
            .success()
            .stdout(predicate::str::contains("\"succeeded\""));
    }

    #[test]
    fn second_build_hits_cache() {
        let dir = TempDir::new().unwrap();
        let doc = write_document(dir.path());
        let cache = dir.path().join("cache");

        stagecraft()
            .args(["build", "-f"])
            .arg(&doc)
            .arg("--cache-dir")
            .arg(&cache)
            .assert()
            .success();

        // Same document, same cache dir: every stage replays from disk
        stagecraft()
            .args(["build", "-f"])
            .arg(&doc)
            .arg("--cache-dir")
            .arg(&cache)
            .assert()
            .success()
            .stdout(predicate::str::contains("cache-hit"))
            .stdout(predicate::str::contains("0 executed"));
    }

    #[test]
    fn plan_lists_execution_order() {
        let dir = TempDir::new().unwrap();
        let doc = write_document(dir.path());

        stagecraft()
            .args(["plan", "-f"])
            .arg(&doc)
            .arg("--cache-dir")
            .arg(dir.path().join("cache"))
            .assert()
            .success()
            .stdout(predicate::str::contains("Execution plan"))
            .stdout(predicate::str::contains("compile"))
            .stdout(predicate::str::contains("package"));
    }

    #[test]
    fn plan_predicts_cache_state() {
        let dir = TempDir::new().unwrap();
        let doc = write_document(dir.path());
        let cache = dir.path().join("cache");

        // Cold cache: everything is predicted to build
        stagecraft()
            .args(["plan", "-f"])
            .arg(&doc)
            .arg("--cache-dir")
            .arg(&cache)
            .assert()
            .success()
            .stdout(predicate::str::contains("build"))
            .stdout(predicate::str::contains("cached").not());

        stagecraft()
            .args(["build", "-f"])
            .arg(&doc)
            .arg("--cache-dir")
            .arg(&cache)
            .assert()
            .success();

        // Warm cache: the same plan now predicts hits
        stagecraft()
            .args(["plan", "-f"])
            .arg(&doc)
            .arg("--cache-dir")
            .arg(&cache)
            .assert()
            .success()
            .stdout(predicate::str::contains("cached"));
    }

    #[test]
    fn graph_prints_edges() {
        let dir = TempDir::new().unwrap();
        let doc = write_document(dir.path());

        stagecraft()
            .args(["graph", "-f"])
            .arg(&doc)
            .assert()
            .success()
            .stdout(predicate::str::contains("base: scratch"))
            .stdout(predicate::str::contains("copy: compile"));
    }

    #[test]
    fn cycle_is_rejected_before_execution() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("stages.json");
        std::fs::write(
            &path,
            r#"{
                "stages": [
                    {"name": "a", "base": "b"},
                    {"name": "b", "base": "a"}
                ],
                "targets": ["a"]
            }"#,
        )
        .unwrap();

        stagecraft()
            .args(["build", "-f"])
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("cycle"));
    }

    #[test]
    fn missing_target_is_rejected() {
        let dir = TempDir::new().unwrap();
        let doc = write_document(dir.path());

        stagecraft()
            .args(["build", "-f"])
            .arg(&doc)
            .args(["--target", "nonexistent"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not a declared stage"));
    }
}
