use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Fixed period weights for the tentative final grade.
pub const PRELIM_WEIGHT: f64 = 30.0;
pub const MIDTERM_WEIGHT: f64 = 30.0;
pub const FINALS_WEIGHT: f64 = 40.0;

/// Displayed percentages top out at 99; 100 is reserved header context.
pub const PERCENT_CAP: f64 = 99.0;
pub const PASS_MARK: f64 = 75.0;

/// Criteria weights must total 100 within this tolerance before a period
/// is trusted.
pub const WEIGHT_SUM_TOLERANCE: f64 = 0.001;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Period {
    Prelim,
    Midterm,
    Finals,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Prelim, Period::Midterm, Period::Finals];

    pub fn as_str(self) -> &'static str {
        match self {
            Period::Prelim => "prelim",
            Period::Midterm => "midterm",
            Period::Finals => "finals",
        }
    }

    pub fn parse(s: &str) -> Option<Period> {
        match s.to_ascii_lowercase().as_str() {
            "prelim" => Some(Period::Prelim),
            "midterm" => Some(Period::Midterm),
            "finals" => Some(Period::Finals),
            _ => None,
        }
    }
}

/// One score cell: a null mark is "ungraded", any numeric value (zero
/// included) is a real graded score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScoreCell {
    Ungraded,
    Graded(f64),
}

/// Half-up 1-decimal rounding used for sheet display values:
/// `Int(10*x + 0.5) / 10`
pub fn round1(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

/// Criteria-level percentage. Resolves only once every item under the
/// criteria carries a graded score; a criteria with no items never resolves.
pub fn criteria_percent(cells: &[(f64, ScoreCell)]) -> Option<f64> {
    let mut possible = 0.0;
    let mut seen = 0.0;
    let mut sum = 0.0;
    for &(max_score, cell) in cells {
        possible += max_score;
        if let ScoreCell::Graded(v) = cell {
            seen += max_score;
            sum += v;
        }
    }
    if seen >= possible && possible > 0.0 {
        Some((sum / possible * 100.0).min(PERCENT_CAP))
    } else {
        None
    }
}

#[derive(Debug, Clone)]
pub struct CriteriaScores {
    pub weight: f64,
    /// (max_score, cell) per item under the criteria.
    pub cells: Vec<(f64, ScoreCell)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodResult {
    pub percentage: Option<f64>,
    pub complete: bool,
}

impl PeriodResult {
    pub const INCOMPLETE: PeriodResult = PeriodResult {
        percentage: None,
        complete: false,
    };
}

/// Combines criteria percentages into a period percentage. The period is
/// complete only when every criteria resolved AND the criteria weights total
/// exactly 100; an under-configured period never yields a number.
pub fn period_result(criteria: &[CriteriaScores]) -> PeriodResult {
    let weight_total: f64 = criteria.iter().map(|c| c.weight).sum();
    if (weight_total - 100.0).abs() > WEIGHT_SUM_TOLERANCE {
        return PeriodResult::INCOMPLETE;
    }

    // Single division at the end keeps maxed scores exactly on the cap.
    let mut acc = 0.0;
    for c in criteria {
        match criteria_percent(&c.cells) {
            Some(p) => acc += p * c.weight,
            None => return PeriodResult::INCOMPLETE,
        }
    }

    PeriodResult {
        percentage: Some((acc / 100.0).min(PERCENT_CAP)),
        complete: true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Remark {
    Passed,
    Failed,
    Incomplete,
    Conditional,
}

/// Percentage-to-LEE lookup: 95+ is 1.00, one tenth per integer point down
/// to 75 (3.00), below 75 drops to 5.00. Integer tenths keep the band
/// values exact.
pub fn resolve_lee(percent: f64) -> f64 {
    let x = percent.round();
    if x >= 95.0 {
        1.0
    } else if x >= PASS_MARK {
        (10.0 + (95.0 - x)) / 10.0
    } else {
        5.0
    }
}

/// Remark rule for period-only print views. Independent of the tentative
/// remark policy in `final_result`; the two must not be cross-applied.
pub fn remark_for_lee(lee: f64) -> Remark {
    if lee <= 3.0 {
        Remark::Passed
    } else if lee < 5.0 {
        Remark::Conditional
    } else {
        Remark::Failed
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalResult {
    pub prelim: Option<f64>,
    pub midterm: Option<f64>,
    pub finals: Option<f64>,
    pub tentative: f64,
    pub lee: Option<f64>,
    pub remark: Remark,
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub needed_remaining_avg: Option<f64>,
}

/// Weighted 30/30/40 combination of the period percentages. A blank period
/// contributes 0 to the sum but blocks a Failed remark: a student is never
/// failed while a period is still outstanding.
pub fn final_result(
    prelim: Option<f64>,
    midterm: Option<f64>,
    finals: Option<f64>,
) -> FinalResult {
    let has_blank = prelim.is_none() || midterm.is_none() || finals.is_none();
    let all_blank = prelim.is_none() && midterm.is_none() && finals.is_none();

    let weighted = prelim.unwrap_or(0.0) * PRELIM_WEIGHT
        + midterm.unwrap_or(0.0) * MIDTERM_WEIGHT
        + finals.unwrap_or(0.0) * FINALS_WEIGHT;
    let tentative = (weighted / 100.0).min(PERCENT_CAP);

    let remark = if all_blank {
        Remark::Incomplete
    } else if tentative >= PASS_MARK {
        Remark::Passed
    } else if has_blank {
        Remark::Incomplete
    } else {
        Remark::Failed
    };

    let lee = if all_blank {
        None
    } else {
        Some(resolve_lee(tentative))
    };

    // Advisory projection only: the average still needed across the blank
    // periods to reach the pass mark. Shown, never persisted.
    let needed_remaining_avg = if has_blank && !all_blank && tentative < PASS_MARK {
        let remaining_weight: f64 = [
            (prelim, PRELIM_WEIGHT),
            (midterm, MIDTERM_WEIGHT),
            (finals, FINALS_WEIGHT),
        ]
        .iter()
        .filter(|(p, _)| p.is_none())
        .map(|(_, w)| *w)
        .sum();
        let needed = (PASS_MARK - tentative) * 100.0 / remaining_weight;
        if needed <= 100.0 {
            Some(needed)
        } else {
            None
        }
    } else {
        None
    };

    FinalResult {
        prelim,
        midterm,
        finals,
        tentative,
        lee,
        remark,
        complete: !has_blank,
        needed_remaining_avg,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CalcError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl CalcError {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            details: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CalcContext<'a> {
    pub conn: &'a Connection,
    pub section_id: &'a str,
}

#[derive(Debug, Clone)]
pub struct ItemDef {
    pub id: String,
    pub name: String,
    pub max_score: f64,
}

#[derive(Debug, Clone)]
pub struct CriteriaDef {
    pub id: String,
    pub name: String,
    pub weight: f64,
    pub items: Vec<ItemDef>,
}

impl CriteriaDef {
    pub fn possible(&self) -> f64 {
        self.items.iter().map(|i| i.max_score).sum()
    }
}

/// Criteria (with their items) per period, in instructor sort order.
pub fn load_section_structure(
    conn: &Connection,
    section_id: &str,
) -> Result<HashMap<Period, Vec<CriteriaDef>>, CalcError> {
    let mut criteria_stmt = conn
        .prepare(
            "SELECT id, period, name, percentage
             FROM criteria
             WHERE section_id = ?
             ORDER BY sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let criteria_rows: Vec<(String, String, String, f64)> = criteria_stmt
        .query_map([section_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut items_stmt = conn
        .prepare(
            "SELECT i.criteria_id, i.id, i.name, i.max_score
             FROM assessment_items i
             JOIN criteria c ON c.id = i.criteria_id
             WHERE c.section_id = ?
             ORDER BY i.sort_order",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let item_rows: Vec<(String, String, String, f64)> = items_stmt
        .query_map([section_id], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let mut items_by_criteria: HashMap<String, Vec<ItemDef>> = HashMap::new();
    for (criteria_id, id, name, max_score) in item_rows {
        items_by_criteria
            .entry(criteria_id)
            .or_default()
            .push(ItemDef {
                id,
                name,
                max_score,
            });
    }

    let mut out: HashMap<Period, Vec<CriteriaDef>> = HashMap::new();
    for (id, period_raw, name, weight) in criteria_rows {
        let Some(period) = Period::parse(&period_raw) else {
            return Err(CalcError::new(
                "db_query_failed",
                format!("criteria {} has unknown period {}", id, period_raw),
            ));
        };
        let items = items_by_criteria.remove(&id).unwrap_or_default();
        out.entry(period).or_default().push(CriteriaDef {
            id,
            name,
            weight,
            items,
        });
    }
    Ok(out)
}

/// Score cells keyed by (enrollment_id, assessment_item_id). Pairs with no
/// row are ungraded.
pub fn load_score_cells(
    conn: &Connection,
    enrollment_ids: &[String],
    item_ids: &[String],
) -> Result<HashMap<(String, String), ScoreCell>, CalcError> {
    let mut out = HashMap::new();
    if enrollment_ids.is_empty() || item_ids.is_empty() {
        return Ok(out);
    }

    let enroll_placeholders = std::iter::repeat("?")
        .take(enrollment_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let item_placeholders = std::iter::repeat("?")
        .take(item_ids.len())
        .collect::<Vec<_>>()
        .join(",");
    let sql = format!(
        "SELECT enrollment_id, assessment_item_id, raw_value, status
         FROM scores
         WHERE enrollment_id IN ({}) AND assessment_item_id IN ({})",
        enroll_placeholders, item_placeholders
    );

    let mut bind_values: Vec<Value> = Vec::with_capacity(enrollment_ids.len() + item_ids.len());
    for id in enrollment_ids {
        bind_values.push(Value::Text(id.clone()));
    }
    for id in item_ids {
        bind_values.push(Value::Text(id.clone()));
    }

    let mut stmt = conn
        .prepare(&sql)
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let rows = stmt
        .query_map(params_from_iter(bind_values), |r| {
            let enrollment_id: String = r.get(0)?;
            let item_id: String = r.get(1)?;
            let raw_value: Option<f64> = r.get(2)?;
            let status: String = r.get(3)?;
            Ok((enrollment_id, item_id, raw_value, status))
        })
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    for row in rows {
        let (enrollment_id, item_id, raw_value, status) =
            row.map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
        let cell = match (status.as_str(), raw_value) {
            ("graded", Some(v)) => ScoreCell::Graded(v),
            _ => ScoreCell::Ungraded,
        };
        out.insert((enrollment_id, item_id), cell);
    }
    Ok(out)
}

fn criteria_scores_for(
    defs: &[CriteriaDef],
    enrollment_id: &str,
    cells: &HashMap<(String, String), ScoreCell>,
) -> Vec<CriteriaScores> {
    defs.iter()
        .map(|c| CriteriaScores {
            weight: c.weight,
            cells: c
                .items
                .iter()
                .map(|i| {
                    let cell = cells
                        .get(&(enrollment_id.to_string(), i.id.clone()))
                        .copied()
                        .unwrap_or(ScoreCell::Ungraded);
                    (i.max_score, cell)
                })
                .collect(),
        })
        .collect()
}

pub fn compute_period_result(
    ctx: &CalcContext<'_>,
    enrollment_id: &str,
    period: Period,
) -> Result<PeriodResult, CalcError> {
    let structure = load_section_structure(ctx.conn, ctx.section_id)?;
    let empty: Vec<CriteriaDef> = Vec::new();
    let defs = structure.get(&period).unwrap_or(&empty);

    let item_ids: Vec<String> = defs
        .iter()
        .flat_map(|c| c.items.iter().map(|i| i.id.clone()))
        .collect();
    let cells = load_score_cells(ctx.conn, &[enrollment_id.to_string()], &item_ids)?;

    Ok(period_result(&criteria_scores_for(
        defs,
        enrollment_id,
        &cells,
    )))
}

pub fn compute_final_result(
    ctx: &CalcContext<'_>,
    enrollment_id: &str,
) -> Result<FinalResult, CalcError> {
    let structure = load_section_structure(ctx.conn, ctx.section_id)?;
    let item_ids: Vec<String> = structure
        .values()
        .flat_map(|defs| defs.iter().flat_map(|c| c.items.iter().map(|i| i.id.clone())))
        .collect();
    let cells = load_score_cells(ctx.conn, &[enrollment_id.to_string()], &item_ids)?;

    let empty: Vec<CriteriaDef> = Vec::new();
    let mut by_period: HashMap<Period, PeriodResult> = HashMap::new();
    for period in Period::ALL {
        let defs = structure.get(&period).unwrap_or(&empty);
        by_period.insert(
            period,
            period_result(&criteria_scores_for(defs, enrollment_id, &cells)),
        );
    }

    Ok(final_result(
        by_period[&Period::Prelim].percentage,
        by_period[&Period::Midterm].percentage,
        by_period[&Period::Finals].percentage,
    ))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetSection {
    pub id: String,
    pub name: String,
    pub course_id: String,
    pub course_code: String,
    pub term_id: String,
    pub instructor_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetCriteria {
    pub id: String,
    pub name: String,
    pub weight: f64,
    pub possible: f64,
    pub item_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetPeriod {
    pub period: Period,
    pub weight_total: f64,
    pub criteria: Vec<SheetCriteria>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetRow {
    pub enrollment_id: String,
    pub student_id: String,
    pub display_name: String,
    pub active: bool,
    pub prelim: Option<f64>,
    pub midterm: Option<f64>,
    pub finals: Option<f64>,
    pub tentative: f64,
    pub lee: Option<f64>,
    pub remark: Remark,
    pub graded_count: i64,
    pub ungraded_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetModel {
    pub section: SheetSection,
    pub periods: Vec<SheetPeriod>,
    pub rows: Vec<SheetRow>,
}

/// The whole-section grade sheet: structure headers plus one computed row
/// per enrollment. Backs the instructor grid view and the submission
/// snapshot; the same engine the per-student queries run.
pub fn compute_section_sheet(ctx: &CalcContext<'_>) -> Result<SheetModel, CalcError> {
    let conn = ctx.conn;
    let section_id = ctx.section_id;

    let section_row: Option<(String, String, String, String, String)> = conn
        .query_row(
            "SELECT s.name, s.course_id, s.term_id, s.instructor_id, c.code
             FROM sections s
             JOIN courses c ON c.id = s.course_id
             WHERE s.id = ?",
            [section_id],
            |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                ))
            },
        )
        .optional()
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let Some((name, course_id, term_id, instructor_id, course_code)) = section_row else {
        return Err(CalcError::new("not_found", "section not found"));
    };

    let mut enroll_stmt = conn
        .prepare(
            "SELECT e.id, e.student_id, st.last_name, st.first_name, e.active
             FROM enrollments e
             JOIN students st ON st.id = e.student_id
             WHERE e.section_id = ?
             ORDER BY st.last_name, st.first_name",
        )
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;
    let enrollments: Vec<(String, String, String, bool)> = enroll_stmt
        .query_map([section_id], |r| {
            let last: String = r.get(2)?;
            let first: String = r.get(3)?;
            Ok((
                r.get(0)?,
                r.get(1)?,
                format!("{}, {}", last, first),
                r.get::<_, i64>(4)? != 0,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| CalcError::new("db_query_failed", e.to_string()))?;

    let structure = load_section_structure(conn, section_id)?;
    let empty: Vec<CriteriaDef> = Vec::new();

    let item_ids: Vec<String> = structure
        .values()
        .flat_map(|defs| defs.iter().flat_map(|c| c.items.iter().map(|i| i.id.clone())))
        .collect();
    let enrollment_ids: Vec<String> = enrollments.iter().map(|e| e.0.clone()).collect();
    let cells = load_score_cells(conn, &enrollment_ids, &item_ids)?;

    let periods: Vec<SheetPeriod> = Period::ALL
        .iter()
        .map(|&period| {
            let defs = structure.get(&period).unwrap_or(&empty);
            SheetPeriod {
                period,
                weight_total: defs.iter().map(|c| c.weight).sum(),
                criteria: defs
                    .iter()
                    .map(|c| SheetCriteria {
                        id: c.id.clone(),
                        name: c.name.clone(),
                        weight: c.weight,
                        possible: c.possible(),
                        item_count: c.items.len(),
                    })
                    .collect(),
            }
        })
        .collect();

    let mut rows: Vec<SheetRow> = Vec::with_capacity(enrollments.len());
    for (enrollment_id, student_id, display_name, active) in &enrollments {
        let mut by_period: HashMap<Period, PeriodResult> = HashMap::new();
        for period in Period::ALL {
            let defs = structure.get(&period).unwrap_or(&empty);
            by_period.insert(
                period,
                period_result(&criteria_scores_for(defs, enrollment_id, &cells)),
            );
        }

        let fin = final_result(
            by_period[&Period::Prelim].percentage,
            by_period[&Period::Midterm].percentage,
            by_period[&Period::Finals].percentage,
        );

        let mut graded_count = 0_i64;
        let mut ungraded_count = 0_i64;
        for item_id in &item_ids {
            match cells.get(&(enrollment_id.clone(), item_id.clone())) {
                Some(ScoreCell::Graded(_)) => graded_count += 1,
                _ => ungraded_count += 1,
            }
        }

        rows.push(SheetRow {
            enrollment_id: enrollment_id.clone(),
            student_id: student_id.clone(),
            display_name: display_name.clone(),
            active: *active,
            prelim: fin.prelim.map(round1),
            midterm: fin.midterm.map(round1),
            finals: fin.finals.map(round1),
            tentative: round1(fin.tentative),
            lee: fin.lee,
            remark: fin.remark,
            graded_count,
            ungraded_count,
        });
    }

    Ok(SheetModel {
        section: SheetSection {
            id: section_id.to_string(),
            name,
            course_id,
            course_code,
            term_id,
            instructor_id,
        },
        periods,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graded(max: f64, v: f64) -> (f64, ScoreCell) {
        (max, ScoreCell::Graded(v))
    }

    fn ungraded(max: f64) -> (f64, ScoreCell) {
        (max, ScoreCell::Ungraded)
    }

    #[test]
    fn round1_is_half_up() {
        assert_eq!(round1(0.0), 0.0);
        assert_eq!(round1(3.54), 3.5);
        assert_eq!(round1(3.55), 3.6);
        assert_eq!(round1(80.5), 80.5);
    }

    #[test]
    fn lee_boundary_table() {
        assert_eq!(resolve_lee(95.0), 1.0);
        assert_eq!(resolve_lee(94.0), 1.1);
        assert_eq!(resolve_lee(85.0), 2.0);
        assert_eq!(resolve_lee(75.0), 3.0);
        assert_eq!(resolve_lee(74.0), 5.0);
        assert_eq!(resolve_lee(0.0), 5.0);
        // Lookup rounds to the nearest integer first.
        assert_eq!(resolve_lee(80.5), 2.4);
        assert_eq!(resolve_lee(94.4), 1.1);
        assert_eq!(resolve_lee(94.5), 1.0);
    }

    #[test]
    fn lee_remark_rule_for_print_views() {
        assert_eq!(remark_for_lee(1.0), Remark::Passed);
        assert_eq!(remark_for_lee(3.0), Remark::Passed);
        assert_eq!(remark_for_lee(3.5), Remark::Conditional);
        assert_eq!(remark_for_lee(4.99), Remark::Conditional);
        assert_eq!(remark_for_lee(5.0), Remark::Failed);
    }

    #[test]
    fn criteria_percent_caps_perfect_scores_at_99() {
        let cells = vec![graded(20.0, 20.0), graded(30.0, 30.0)];
        assert_eq!(criteria_percent(&cells), Some(99.0));
    }

    #[test]
    fn criteria_percent_needs_every_item_graded() {
        let cells = vec![graded(20.0, 15.0), ungraded(30.0)];
        assert_eq!(criteria_percent(&cells), None);
    }

    #[test]
    fn criteria_percent_counts_zero_as_graded() {
        let cells = vec![graded(20.0, 0.0), graded(30.0, 30.0)];
        let p = criteria_percent(&cells).expect("resolves");
        assert!((p - 60.0).abs() < 1e-9);
    }

    #[test]
    fn criteria_without_items_never_resolves() {
        assert_eq!(criteria_percent(&[]), None);
    }

    #[test]
    fn period_requires_weights_to_total_100() {
        // Fully graded with perfect scores, but weights sum to 95.
        let criteria = vec![
            CriteriaScores {
                weight: 60.0,
                cells: vec![graded(50.0, 50.0)],
            },
            CriteriaScores {
                weight: 35.0,
                cells: vec![graded(50.0, 50.0)],
            },
        ];
        assert_eq!(period_result(&criteria), PeriodResult::INCOMPLETE);
    }

    #[test]
    fn period_weight_tolerance_is_tight() {
        let make = |w1: f64| {
            vec![
                CriteriaScores {
                    weight: w1,
                    cells: vec![graded(10.0, 8.0)],
                },
                CriteriaScores {
                    weight: 50.0,
                    cells: vec![graded(10.0, 8.0)],
                },
            ]
        };
        assert!(period_result(&make(50.0005)).complete);
        assert!(!period_result(&make(50.1)).complete);
    }

    #[test]
    fn period_combines_weighted_criteria() {
        let criteria = vec![
            CriteriaScores {
                weight: 40.0,
                cells: vec![graded(50.0, 40.0)], // 80%
            },
            CriteriaScores {
                weight: 60.0,
                cells: vec![graded(20.0, 18.0)], // 90%
            },
        ];
        let r = period_result(&criteria);
        assert!(r.complete);
        let p = r.percentage.expect("complete period has a percentage");
        assert!((p - 86.0).abs() < 1e-9);
    }

    #[test]
    fn period_with_maxed_scores_hits_the_cap_exactly() {
        let criteria = vec![
            CriteriaScores {
                weight: 30.0,
                cells: vec![graded(25.0, 25.0)],
            },
            CriteriaScores {
                weight: 70.0,
                cells: vec![graded(40.0, 40.0)],
            },
        ];
        assert_eq!(period_result(&criteria).percentage, Some(99.0));
    }

    #[test]
    fn empty_period_is_incomplete() {
        assert_eq!(period_result(&[]), PeriodResult::INCOMPLETE);
    }

    #[test]
    fn blank_period_blocks_failed_remark() {
        let fin = final_result(Some(80.0), None, None);
        assert_eq!(fin.tentative, 24.0);
        assert_eq!(fin.remark, Remark::Incomplete);
        assert!(!fin.complete);
        let needed = fin.needed_remaining_avg.expect("projection present");
        assert!((needed - (75.0 - 24.0) * 100.0 / 70.0).abs() < 1e-9);
    }

    #[test]
    fn worked_final_example() {
        let fin = final_result(Some(90.0), Some(85.0), Some(70.0));
        assert_eq!(fin.tentative, 80.5);
        assert_eq!(fin.remark, Remark::Passed);
        assert_eq!(fin.lee, Some(2.4));
        assert!(fin.complete);
        assert_eq!(fin.needed_remaining_avg, None);
    }

    #[test]
    fn all_periods_complete_below_pass_mark_fails() {
        let fin = final_result(Some(70.0), Some(70.0), Some(70.0));
        assert_eq!(fin.tentative, 70.0);
        assert_eq!(fin.remark, Remark::Failed);
        assert_eq!(fin.lee, Some(5.0));
    }

    #[test]
    fn nothing_graded_anywhere_is_incomplete_with_no_lee() {
        let fin = final_result(None, None, None);
        assert_eq!(fin.tentative, 0.0);
        assert_eq!(fin.remark, Remark::Incomplete);
        assert_eq!(fin.lee, None);
        assert_eq!(fin.needed_remaining_avg, None);
    }

    #[test]
    fn maxed_periods_keep_tentative_at_99() {
        let fin = final_result(Some(99.0), Some(99.0), Some(99.0));
        assert_eq!(fin.tentative, 99.0);
        assert_eq!(fin.remark, Remark::Passed);
        assert_eq!(fin.lee, Some(1.0));
    }

    #[test]
    fn unreachable_pass_mark_suppresses_projection() {
        // Prelim complete at 10%: even perfect remaining periods cannot
        // reach 75, so no advisory is shown.
        let fin = final_result(Some(10.0), None, None);
        assert_eq!(fin.remark, Remark::Incomplete);
        assert_eq!(fin.needed_remaining_avg, None);
    }
}
