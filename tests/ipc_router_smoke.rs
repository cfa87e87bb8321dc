use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_peerassessd");
    let mut child = Command::new(exe)
        .env_remove("PEERASSESSD_TABLE_PREFIX")
        .env_remove("PEERASSESSD_ACADEMIC_YEAR_START_MONTH")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn peerassessd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn read_reply(reader: &mut BufReader<ChildStdout>) -> serde_json::Value {
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let value = read_reply(reader);
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert!(
            code != "not_implemented" || method == "results.assessmentsTakenByUser",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("peerassess-router-smoke");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(
        health
            .get("result")
            .and_then(|r| r.get("version"))
            .and_then(|v| v.as_str()),
        Some(env!("CARGO_PKG_VERSION"))
    );
    let selected = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    assert_eq!(
        selected
            .get("result")
            .and_then(|r| r.get("tablePrefix"))
            .and_then(|v| v.as_str()),
        Some("pa2_")
    );
    assert!(workspace.join("peerassess.sqlite3").is_file());

    let assessment_id = uuid::Uuid::new_v4().to_string();
    let scoped = json!({ "moduleId": 1, "assessmentId": assessment_id, "groupId": "g", "userId": 1 });
    let module = json!({ "moduleId": 1, "userId": 1 });
    let methods = [
        ("3", "results.responses", &scoped),
        ("4", "results.responseCount", &scoped),
        ("5", "results.respondedUsers", &scoped),
        ("6", "results.groupResponseCount", &scoped),
        ("7", "results.groupSummary", &scoped),
        ("8", "results.nonResponders", &scoped),
        ("9", "results.userHasResponded", &scoped),
        ("10", "results.responseCountsByAssessment", &module),
        ("11", "results.memberCountsByAssessment", &module),
        ("12", "results.moduleOverview", &module),
        ("13", "results.assessmentsTakenByUser", &module),
    ];
    for (id, method, params) in methods {
        let _ = request(&mut stdin, &mut reader, id, method, params.clone());
    }

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_methods_and_bad_lines_get_error_replies() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    writeln!(stdin, "{{\"id\": 12").expect("write garbage");
    stdin.flush().expect("flush");
    let garbage = read_reply(&mut reader);
    assert_eq!(garbage.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        garbage
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_json")
    );

    // Blank lines are skipped without a reply; the next request still lines up.
    writeln!(stdin).expect("write blank");
    let payload = json!({ "id": "2", "method": "results.everything", "params": {} });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush");
    let unknown = read_reply(&mut reader);
    assert_eq!(unknown.get("id").and_then(|v| v.as_str()), Some("2"));
    assert_eq!(
        unknown
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    let missing_path = request(&mut stdin, &mut reader, "3", "workspace.select", json!({}));
    assert_eq!(
        missing_path
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("bad_params")
    );

    drop(stdin);
    let _ = child.wait();
}
