use serde_json::json;
use sha2::{Digest, Sha256};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
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

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    actor: serde_json::Value,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
        "actor": actor,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
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

fn file_sha256(path: &Path) -> String {
    let bytes = std::fs::read(path).expect("read snapshot file");
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

struct Seed {
    course_id: String,
    section_id: String,
}

/// Course with one section, two students, and every period configured to a
/// full 100 with one scored item.
fn seed_submittable_section(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    code: &str,
    weights_total: f64,
) -> Seed {
    let course = request_ok(
        stdin,
        reader,
        "seed-course",
        "courses.create",
        admin(),
        json!({ "code": code, "name": "Seeded Course" }),
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

    let mut enrollment_ids = Vec::new();
    for (i, (last, first)) in [("Reyes", "Ana"), ("Santos", "Ben")].iter().enumerate() {
        let created = request_ok(
            stdin,
            reader,
            &format!("seed-student-{}", i),
            "students.create",
            admin(),
            json!({ "lastName": last, "firstName": first }),
        );
        let student_id = created["studentId"].as_str().expect("studentId");
        let enrolled = request_ok(
            stdin,
            reader,
            &format!("seed-enroll-{}", i),
            "enrollments.create",
            admin(),
            json!({ "sectionId": section_id, "studentId": student_id }),
        );
        enrollment_ids.push(
            enrolled["enrollmentId"]
                .as_str()
                .expect("enrollmentId")
                .to_string(),
        );
    }

    for (pi, period) in ["prelim", "midterm", "finals"].iter().enumerate() {
        let criteria = request_ok(
            stdin,
            reader,
            &format!("seed-criteria-{}", pi),
            "criteria.create",
            instructor("teach-1"),
            json!({
                "sectionId": section_id,
                "period": period,
                "name": "Exams",
                "percentage": weights_total
            }),
        );
        let criteria_id = criteria["criteriaId"].as_str().expect("criteriaId");
        let item = request_ok(
            stdin,
            reader,
            &format!("seed-item-{}", pi),
            "items.create",
            instructor("teach-1"),
            json!({ "criteriaId": criteria_id, "name": "Exam", "maxScore": 100.0 }),
        );
        let item_id = item["itemId"].as_str().expect("itemId").to_string();

        for (ei, enrollment_id) in enrollment_ids.iter().enumerate() {
            let mut batch = serde_json::Map::new();
            batch.insert(item_id.clone(), json!(85));
            let _ = request_ok(
                stdin,
                reader,
                &format!("seed-score-{}-{}", pi, ei),
                "scores.record",
                instructor("teach-1"),
                json!({
                    "courseId": course_id,
                    "enrollmentId": enrollment_id,
                    "scores": batch
                }),
            );
        }
    }

    Seed {
        course_id,
        section_id,
    }
}

#[test]
fn resubmission_updates_in_place_and_snapshot_digest_matches() {
    let workspace = temp_dir("gradesheet-submit-idem");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        admin(),
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed_submittable_section(&mut stdin, &mut reader, "ENG103", 100.0);

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "s1",
        "submission.submit",
        instructor("teach-1"),
        json!({
            "courseId": seed.course_id,
            "termId": "2026-1",
            "sectionId": seed.section_id
        }),
    );
    assert_eq!(first["success"], json!(true));
    let first_at = first["submittedAt"].as_str().expect("submittedAt").to_string();

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "s2",
        "submission.submit",
        instructor("teach-1"),
        json!({
            "courseId": seed.course_id,
            "termId": "2026-1",
            "sectionId": seed.section_id
        }),
    );
    let second_at = second["submittedAt"].as_str().expect("submittedAt").to_string();

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "submission.list",
        admin(),
        json!({}),
    );
    let submissions = listed["submissions"].as_array().expect("submissions");
    assert_eq!(submissions.len(), 1, "resubmission must not duplicate rows");
    assert!(second_at >= first_at);

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "g1",
        "submission.get",
        admin(),
        json!({ "courseId": seed.course_id, "termId": "2026-1" }),
    );
    let record = &got["submission"];
    assert_eq!(record["submittedAt"].as_str(), Some(second_at.as_str()));

    let snapshot_path = record["snapshotPath"].as_str().expect("snapshotPath");
    let snapshot_sha = record["snapshotSha256"].as_str().expect("snapshotSha256");
    let on_disk = PathBuf::from(snapshot_path);
    assert!(on_disk.is_file(), "snapshot csv should exist");
    assert_eq!(file_sha256(&on_disk), snapshot_sha);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn misconfigured_weights_block_submission() {
    let workspace = temp_dir("gradesheet-submit-weights");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        admin(),
        json!({ "path": workspace.to_string_lossy() }),
    );
    // Every period configured to only 95 of the required 100.
    let seed = seed_submittable_section(&mut stdin, &mut reader, "HIS104", 95.0);

    let rejected = request(
        &mut stdin,
        &mut reader,
        "s1",
        "submission.submit",
        instructor("teach-1"),
        json!({
            "courseId": seed.course_id,
            "termId": "2026-1",
            "sectionId": seed.section_id
        }),
    );
    assert_eq!(error_code(&rejected), "validation_failed");

    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "l1",
        "submission.list",
        admin(),
        json!({}),
    );
    assert_eq!(listed["submissions"].as_array().map(|a| a.len()), Some(0));

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn only_the_owning_instructor_may_submit() {
    let workspace = temp_dir("gradesheet-submit-owner");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        admin(),
        json!({ "path": workspace.to_string_lossy() }),
    );
    let seed = seed_submittable_section(&mut stdin, &mut reader, "PHY105", 100.0);

    let rejected = request(
        &mut stdin,
        &mut reader,
        "s1",
        "submission.submit",
        instructor("teach-2"),
        json!({
            "courseId": seed.course_id,
            "termId": "2026-1",
            "sectionId": seed.section_id
        }),
    );
    assert_eq!(error_code(&rejected), "permission_denied");

    drop(stdin);
    let _ = child.wait();
}
