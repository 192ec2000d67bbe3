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
    let exe = env!("CARGO_BIN_EXE_gradesheetd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradesheetd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn admin() -> serde_json::Value {
    json!({ "userId": "admin-1", "role": "admin" })
}

fn instructor(user_id: &str) -> serde_json::Value {
    json!({ "userId": user_id, "role": "instructor" })
}

fn student(user_id: &str) -> serde_json::Value {
    json!({ "userId": user_id, "role": "student" })
}

fn request_raw(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    payload: serde_json::Value,
    id: &str,
) -> serde_json::Value {
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    actor: serde_json::Value,
    params: serde_json::Value,
) -> serde_json::Value {
    request_raw(
        stdin,
        reader,
        json!({
            "id": id,
            "method": method,
            "params": params,
            "actor": actor,
        }),
        id,
    )
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    actor: serde_json::Value,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, actor, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

struct Seed {
    course_id: String,
    section_id: String,
    enrollment_id: String,
    student_id: String,
    item_id: String,
}

fn seed(stdin: &mut ChildStdin, reader: &mut BufReader<ChildStdout>) -> Seed {
    let course = request_ok(
        stdin,
        reader,
        "seed-course",
        "courses.create",
        admin(),
        json!({ "code": "FIL110", "name": "Filipino" }),
    );
    let course_id = course["courseId"].as_str().expect("courseId").to_string();

    let section = request_ok(
        stdin,
        reader,
        "seed-section",
        "sections.create",
        admin(),
        json!({
            "courseId": course_id,
            "name": "A",
            "termId": "2026-1",
            "instructorId": "teach-1"
        }),
    );
    let section_id = section["sectionId"].as_str().expect("sectionId").to_string();

    let created = request_ok(
        stdin,
        reader,
        "seed-student",
        "students.create",
        admin(),
        json!({ "lastName": "Reyes", "firstName": "Ana" }),
    );
    let student_id = created["studentId"].as_str().expect("studentId").to_string();
    let enrolled = request_ok(
        stdin,
        reader,
        "seed-enroll",
        "enrollments.create",
        admin(),
        json!({ "sectionId": section_id, "studentId": student_id }),
    );
    let enrollment_id = enrolled["enrollmentId"]
        .as_str()
        .expect("enrollmentId")
        .to_string();

    let criteria = request_ok(
        stdin,
        reader,
        "seed-criteria",
        "criteria.create",
        instructor("teach-1"),
        json!({
            "sectionId": section_id,
            "period": "prelim",
            "name": "Quizzes",
            "percentage": 100.0
        }),
    );
    let item = request_ok(
        stdin,
        reader,
        "seed-item",
        "items.create",
        instructor("teach-1"),
        json!({
            "criteriaId": criteria["criteriaId"].as_str().expect("criteriaId"),
            "name": "Quiz 1",
            "maxScore": 10.0
        }),
    );

    Seed {
        course_id,
        section_id,
        enrollment_id,
        student_id,
        item_id: item["itemId"].as_str().expect("itemId").to_string(),
    }
}

fn score_batch(seed: &Seed, value: serde_json::Value) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(seed.item_id.clone(), value);
    json!({
        "courseId": seed.course_id,
        "enrollmentId": seed.enrollment_id,
        "scores": map
    })
}

#[test]
fn grade_writes_require_the_owning_instructor() {
    let workspace = temp_dir("gradesheet-perm-writes");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        admin(),
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed(&mut stdin, &mut reader);

    let as_student = request(
        &mut stdin,
        &mut reader,
        "w1",
        "scores.record",
        student(&seed.student_id),
        score_batch(&seed, json!(9)),
    );
    assert_eq!(error_code(&as_student), "permission_denied");

    let as_other_instructor = request(
        &mut stdin,
        &mut reader,
        "w2",
        "scores.record",
        instructor("teach-2"),
        score_batch(&seed, json!(9)),
    );
    assert_eq!(error_code(&as_other_instructor), "permission_denied");

    let as_admin = request(
        &mut stdin,
        &mut reader,
        "w3",
        "scores.record",
        admin(),
        score_batch(&seed, json!(9)),
    );
    assert_eq!(error_code(&as_admin), "permission_denied");

    let as_other_criteria = request(
        &mut stdin,
        &mut reader,
        "w4",
        "criteria.create",
        instructor("teach-2"),
        json!({
            "sectionId": seed.section_id,
            "period": "midterm",
            "name": "Exams",
            "percentage": 100.0
        }),
    );
    assert_eq!(error_code(&as_other_criteria), "permission_denied");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn students_read_only_their_own_results() {
    let workspace = temp_dir("gradesheet-perm-reads");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        admin(),
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed(&mut stdin, &mut reader);

    let own = request(
        &mut stdin,
        &mut reader,
        "r1",
        "results.final",
        student(&seed.student_id),
        json!({ "enrollmentId": seed.enrollment_id }),
    );
    assert_eq!(own.get("ok"), Some(&json!(true)));

    let other = request(
        &mut stdin,
        &mut reader,
        "r2",
        "results.final",
        student("someone-else"),
        json!({ "enrollmentId": seed.enrollment_id }),
    );
    assert_eq!(error_code(&other), "permission_denied");

    let sheet = request(
        &mut stdin,
        &mut reader,
        "r3",
        "results.sheet",
        student(&seed.student_id),
        json!({ "sectionId": seed.section_id }),
    );
    assert_eq!(error_code(&sheet), "permission_denied");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn roster_writes_require_admin() {
    let workspace = temp_dir("gradesheet-perm-roster");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        admin(),
        json!({ "path": workspace.to_string_lossy() }),
    );

    let as_instructor = request(
        &mut stdin,
        &mut reader,
        "c1",
        "courses.create",
        instructor("teach-1"),
        json!({ "code": "X", "name": "X" }),
    );
    assert_eq!(error_code(&as_instructor), "permission_denied");

    let as_student = request(
        &mut stdin,
        &mut reader,
        "c2",
        "students.create",
        student("s-1"),
        json!({ "lastName": "A", "firstName": "B" }),
    );
    assert_eq!(error_code(&as_student), "permission_denied");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn missing_actor_is_rejected_on_guarded_methods() {
    let workspace = temp_dir("gradesheet-perm-noactor");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        admin(),
        json!({ "path": workspace.to_string_lossy() }),
    );

    let no_actor = request_raw(
        &mut stdin,
        &mut reader,
        json!({
            "id": "n1",
            "method": "courses.create",
            "params": { "code": "X", "name": "X" }
        }),
        "n1",
    );
    assert_eq!(error_code(&no_actor), "permission_denied");

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn submission_listing_is_scoped_by_role() {
    let workspace = temp_dir("gradesheet-perm-sub");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        admin(),
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed(&mut stdin, &mut reader);

    // Finish the other periods so submission validates.
    for (i, period) in ["midterm", "finals"].iter().enumerate() {
        let _ = request_ok(
            &mut stdin,
            &mut reader,
            &format!("fix-{}", i),
            "criteria.create",
            instructor("teach-1"),
            json!({
                "sectionId": seed.section_id,
                "period": period,
                "name": "Exams",
                "percentage": 100.0
            }),
        );
    }
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "sub",
        "submission.submit",
        instructor("teach-1"),
        json!({
            "courseId": seed.course_id,
            "termId": "2026-1",
            "sectionId": seed.section_id
        }),
    );

    let own = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "submission.list",
        instructor("teach-1"),
        json!({}),
    );
    assert_eq!(own["submissions"].as_array().map(|a| a.len()), Some(1));

    let other = request_ok(
        &mut stdin,
        &mut reader,
        "l2",
        "submission.list",
        instructor("teach-2"),
        json!({}),
    );
    assert_eq!(other["submissions"].as_array().map(|a| a.len()), Some(0));

    let as_student = request(
        &mut stdin,
        &mut reader,
        "l3",
        "submission.list",
        student(&seed.student_id),
        json!({}),
    );
    assert_eq!(error_code(&as_student), "permission_denied");

    drop(stdin);
    let _ = child.wait();
}
