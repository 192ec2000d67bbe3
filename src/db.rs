use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE: &str = "gradesheet.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS courses(
            id TEXT PRIMARY KEY,
            code TEXT NOT NULL,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS sections(
            id TEXT PRIMARY KEY,
            course_id TEXT NOT NULL,
            name TEXT NOT NULL,
            term_id TEXT NOT NULL,
            instructor_id TEXT NOT NULL,
            FOREIGN KEY(course_id) REFERENCES courses(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_course ON sections(course_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_sections_instructor ON sections(instructor_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            student_no TEXT
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            active INTEGER NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(section_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_section ON enrollments(section_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS criteria(
            id TEXT PRIMARY KEY,
            section_id TEXT NOT NULL,
            period TEXT NOT NULL,
            name TEXT NOT NULL,
            percentage REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_criteria_section ON criteria(section_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_criteria_section_period ON criteria(section_id, period)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS assessment_items(
            id TEXT PRIMARY KEY,
            criteria_id TEXT NOT NULL,
            name TEXT NOT NULL,
            max_score REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(criteria_id) REFERENCES criteria(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_assessment_items_criteria ON assessment_items(criteria_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS scores(
            id TEXT PRIMARY KEY,
            enrollment_id TEXT NOT NULL,
            assessment_item_id TEXT NOT NULL,
            raw_value REAL,
            status TEXT NOT NULL,
            updated_at TEXT,
            FOREIGN KEY(enrollment_id) REFERENCES enrollments(id),
            FOREIGN KEY(assessment_item_id) REFERENCES assessment_items(id),
            UNIQUE(enrollment_id, assessment_item_id)
        )",
        [],
    )?;
    ensure_scores_updated_at(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_enrollment ON scores(enrollment_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_scores_item ON scores(assessment_item_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS submissions(
            course_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            instructor_id TEXT NOT NULL,
            section_id TEXT NOT NULL,
            submitted_at TEXT NOT NULL,
            snapshot_path TEXT,
            snapshot_sha256 TEXT,
            PRIMARY KEY(course_id, term_id),
            FOREIGN KEY(course_id) REFERENCES courses(id),
            FOREIGN KEY(section_id) REFERENCES sections(id)
        )",
        [],
    )?;
    ensure_submissions_snapshot_columns(&conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_submissions_section ON submissions(section_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_scores_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "scores", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE scores ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn ensure_submissions_snapshot_columns(conn: &Connection) -> anyhow::Result<()> {
    if !table_has_column(conn, "submissions", "snapshot_path")? {
        conn.execute("ALTER TABLE submissions ADD COLUMN snapshot_path TEXT", [])?;
    }
    if !table_has_column(conn, "submissions", "snapshot_sha256")? {
        conn.execute("ALTER TABLE submissions ADD COLUMN snapshot_sha256 TEXT", [])?;
    }
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
