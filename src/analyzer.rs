use crate::loader::Dataset;
use crate::models::{normalize_level, SchoolKeyer, StudentRecord, TeacherRecord};
use crate::stats::{self, Correlation, CorrelationMethod};
use std::collections::{BTreeMap, BTreeSet};

/// One row of the school-level aggregate: a matched school with the
/// mean teacher literacy and mean student CT over its rows.
#[derive(Debug, Clone)]
pub struct SchoolAggregate {
    pub school_key: String,
    pub ld_mean: f64,
    pub ct_mean: f64,
    pub teacher_rows: usize,
    pub student_rows: usize,
}

/// Per-level means for a single school, joined on the lower-cased
/// level label common to both surveys.
#[derive(Debug, Clone)]
pub struct LevelAggregate {
    pub level: String,
    pub ld_mean: f64,
    pub ct_mean: f64,
}

/// Cross-school correlation restricted to one proficiency level.
/// `correlation` is None when fewer than the minimum number of
/// matched schools remain at that level.
#[derive(Debug, Clone)]
pub struct LevelCorrelation {
    pub level: String,
    pub school_count: usize,
    pub correlation: Option<Correlation>,
    pub aggregates: Vec<SchoolAggregate>,
}

/// Within-school correlation across proficiency levels.
#[derive(Debug, Clone)]
pub struct SchoolLevelCorrelation {
    pub school_key: String,
    pub level_rows: Vec<LevelAggregate>,
    pub correlation: Option<Correlation>,
}

/// Everything a render of the analysis needs, computed fresh from the
/// two source tables.
#[derive(Debug, Clone)]
pub struct CorrelationReport {
    pub matched_schools: Vec<String>,
    pub school_aggregates: Vec<SchoolAggregate>,
    pub overall: Option<Correlation>,
    pub level_correlations: Vec<LevelCorrelation>,
    pub school_level_correlations: Vec<SchoolLevelCorrelation>,
}

#[derive(Debug, Clone, Copy, Default)]
struct GroupStat {
    sum: f64,
    count: usize,
}

impl GroupStat {
    fn mean(&self) -> f64 {
        self.sum / self.count as f64
    }
}

/// Grouped arithmetic mean over any row set. Rows without a usable
/// key or value are skipped, so an empty group is absent from the map
/// rather than present as a zero row. The ordered map gives every
/// downstream join and projection a deterministic iteration order.
fn group_mean<R, I, K, V>(rows: I, key_of: K, value_of: V) -> BTreeMap<String, GroupStat>
where
    I: IntoIterator<Item = R>,
    K: Fn(&R) -> Option<String>,
    V: Fn(&R) -> Option<f64>,
{
    let mut groups: BTreeMap<String, GroupStat> = BTreeMap::new();
    for row in rows {
        let (key, value) = match (key_of(&row), value_of(&row)) {
            (Some(key), Some(value)) => (key, value),
            _ => continue,
        };
        if key.is_empty() {
            continue;
        }
        let stat = groups.entry(key).or_default();
        stat.sum += value;
        stat.count += 1;
    }
    groups
}

/// Project joined aggregate rows to paired series and correlate them.
/// The pairing stays inside the joined rows until this point so the
/// two series can never drift out of row order.
fn project_and_correlate(
    aggregates: &[SchoolAggregate],
    method: CorrelationMethod,
) -> Option<Correlation> {
    let xs: Vec<f64> = aggregates.iter().map(|a| a.ld_mean).collect();
    let ys: Vec<f64> = aggregates.iter().map(|a| a.ct_mean).collect();
    stats::correlate(&xs, &ys, method).ok()
}

pub struct CorrelationAnalyzer {
    keyer: SchoolKeyer,
    levels_of_interest: Option<Vec<String>>,
}

impl CorrelationAnalyzer {
    pub fn new(keyer: SchoolKeyer) -> Self {
        Self {
            keyer,
            levels_of_interest: None,
        }
    }

    /// Restrict the per-level pass to a subset of levels, compared
    /// case-insensitively. None analyzes every level present.
    pub fn with_levels_of_interest(mut self, levels: Option<Vec<String>>) -> Self {
        self.levels_of_interest = levels;
        self
    }

    /// Run the full three-tier analysis.
    pub fn analyze(&self, dataset: &Dataset) -> CorrelationReport {
        let matched_schools = self.matched_keys(&dataset.teachers, &dataset.students);
        let school_aggregates = self.aggregate_schools(&dataset.teachers, &dataset.students);
        let overall = project_and_correlate(&school_aggregates, CorrelationMethod::Spearman);

        let level_correlations = self
            .level_vocabulary(dataset)
            .iter()
            .map(|level| self.level_correlation(dataset, level))
            .collect();

        let school_level_correlations = matched_schools
            .iter()
            .map(|key| self.school_level_correlation(dataset, key))
            .collect();

        CorrelationReport {
            matched_schools,
            school_aggregates,
            overall,
            level_correlations,
            school_level_correlations,
        }
    }

    /// Sorted intersection of the non-empty join keys on both sides.
    pub fn matched_keys(
        &self,
        teachers: &[TeacherRecord],
        students: &[StudentRecord],
    ) -> Vec<String> {
        let teacher_keys: BTreeSet<String> = teachers
            .iter()
            .map(|r| self.keyer.key(Some(r.school_name.as_str())))
            .filter(|k| !k.is_empty())
            .collect();
        let student_keys: BTreeSet<String> = students
            .iter()
            .map(|r| self.keyer.key(Some(r.school_name.as_str())))
            .filter(|k| !k.is_empty())
            .collect();
        teacher_keys.intersection(&student_keys).cloned().collect()
    }

    /// School-level aggregate over the whole dataset.
    pub fn school_aggregates(&self, dataset: &Dataset) -> Vec<SchoolAggregate> {
        self.aggregate_schools(&dataset.teachers, &dataset.students)
    }

    /// Group each side by join key and inner-join the two means: a
    /// school appears only with at least one scored row on each side.
    fn aggregate_schools<'a, T, S>(&self, teachers: T, students: S) -> Vec<SchoolAggregate>
    where
        T: IntoIterator<Item = &'a TeacherRecord>,
        S: IntoIterator<Item = &'a StudentRecord>,
    {
        let teacher_means = group_mean(
            teachers,
            |r| Some(self.keyer.key(Some(r.school_name.as_str()))),
            |r| r.mean_ld_score(),
        );
        let student_means = group_mean(
            students,
            |r| Some(self.keyer.key(Some(r.school_name.as_str()))),
            |r| r.ct_norm_score(),
        );

        teacher_means
            .iter()
            .filter_map(|(key, teacher)| {
                student_means.get(key).map(|student| SchoolAggregate {
                    school_key: key.clone(),
                    ld_mean: teacher.mean(),
                    ct_mean: student.mean(),
                    teacher_rows: teacher.count,
                    student_rows: student.count,
                })
            })
            .collect()
    }

    /// Level labels driving the per-level pass: the teacher survey's
    /// vocabulary (as the source selector shows), narrowed by the
    /// configured levels of interest.
    pub fn level_vocabulary(&self, dataset: &Dataset) -> Vec<String> {
        let mut labels: BTreeMap<String, String> = BTreeMap::new();
        for record in &dataset.teachers {
            if let Some(normalized) = record.level() {
                labels
                    .entry(normalized)
                    .or_insert_with(|| record.level_ld.trim().to_string());
            }
        }
        labels
            .into_values()
            .filter(|label| match &self.levels_of_interest {
                Some(wanted) => wanted
                    .iter()
                    .any(|w| normalize_level(w) == normalize_level(label)),
                None => true,
            })
            .collect()
    }

    /// Cross-school aggregate and correlation restricted to one
    /// level. The matched set is re-derived on the filtered subsets;
    /// a school matched overall may be absent at this level.
    pub fn level_correlation(&self, dataset: &Dataset, level: &str) -> LevelCorrelation {
        let wanted = normalize_level(level);
        let aggregates = match &wanted {
            Some(_) => self.aggregate_schools(
                dataset.teachers.iter().filter(|r| r.level() == wanted),
                dataset.students.iter().filter(|r| r.level() == wanted),
            ),
            None => Vec::new(),
        };
        LevelCorrelation {
            level: level.to_string(),
            school_count: aggregates.len(),
            correlation: project_and_correlate(&aggregates, CorrelationMethod::Spearman),
            aggregates,
        }
    }

    /// Per-level means inside one school, joined case-insensitively
    /// on the level labels both surveys use for that school.
    pub fn school_level_rows(&self, dataset: &Dataset, school_key: &str) -> Vec<LevelAggregate> {
        let teacher_levels = group_mean(
            dataset
                .teachers
                .iter()
                .filter(|r| self.keyer.key(Some(r.school_name.as_str())) == school_key),
            |r| r.level(),
            |r| r.mean_ld_score(),
        );
        let student_levels = group_mean(
            dataset
                .students
                .iter()
                .filter(|r| self.keyer.key(Some(r.school_name.as_str())) == school_key),
            |r| r.level(),
            |r| r.ct_norm_score(),
        );

        teacher_levels
            .iter()
            .filter_map(|(level, teacher)| {
                student_levels.get(level).map(|student| LevelAggregate {
                    level: level.clone(),
                    ld_mean: teacher.mean(),
                    ct_mean: student.mean(),
                })
            })
            .collect()
    }

    /// Within-school correlation across level means. Exploratory: at
    /// most one point per shared level label, so most schools land on
    /// the insufficient-data side unless all levels are present.
    pub fn school_level_correlation(
        &self,
        dataset: &Dataset,
        school_key: &str,
    ) -> SchoolLevelCorrelation {
        let level_rows = self.school_level_rows(dataset, school_key);
        let xs: Vec<f64> = level_rows.iter().map(|r| r.ld_mean).collect();
        let ys: Vec<f64> = level_rows.iter().map(|r| r.ct_mean).collect();
        SchoolLevelCorrelation {
            school_key: school_key.to_string(),
            correlation: stats::correlate(&xs, &ys, CorrelationMethod::Pearson).ok(),
            level_rows,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn teacher(school: &str, mean_ld: &str, level: &str) -> TeacherRecord {
        TeacherRecord {
            school_name: school.to_string(),
            mean_ld: mean_ld.to_string(),
            level_ld: level.to_string(),
            ..Default::default()
        }
    }

    fn student(school: &str, ct_norm: &str, level: &str) -> StudentRecord {
        StudentRecord {
            school_name: school.to_string(),
            ct_norm: ct_norm.to_string(),
            level_ct: level.to_string(),
            ..Default::default()
        }
    }

    fn analyzer() -> CorrelationAnalyzer {
        CorrelationAnalyzer::new(SchoolKeyer::default())
    }

    #[test]
    fn matched_keys_sorted_deduplicated() {
        let teachers = vec![
            teacher("SD BETA", "0.5", "Tinggi"),
            teacher("SD ALPHA", "0.6", "Tinggi"),
            teacher("SD ALPHA", "0.7", "Sedang"),
            teacher("SD GAMMA", "0.4", "Rendah"),
        ];
        let students = vec![
            student("sd alpha", "0.3", "Tinggi"),
            student("SD BETA", "0.4", "Sedang"),
            student("SD DELTA", "0.5", "Tinggi"),
        ];
        let matched = analyzer().matched_keys(&teachers, &students);
        assert_eq!(matched, vec!["sd alpha".to_string(), "sd beta".to_string()]);
    }

    #[test]
    fn matched_keys_symmetric() {
        let names_a = ["SD Alpha", "SD Beta", "SD Gamma"];
        let names_b = ["SD Beta", "SD Delta"];
        let forward = analyzer().matched_keys(
            &names_a.iter().map(|n| teacher(n, "0.5", "Tinggi")).collect::<Vec<_>>(),
            &names_b.iter().map(|n| student(n, "0.5", "Tinggi")).collect::<Vec<_>>(),
        );
        let reverse = analyzer().matched_keys(
            &names_b.iter().map(|n| teacher(n, "0.5", "Tinggi")).collect::<Vec<_>>(),
            &names_a.iter().map(|n| student(n, "0.5", "Tinggi")).collect::<Vec<_>>(),
        );
        assert_eq!(forward, reverse);
        assert_eq!(forward, vec!["sd beta".to_string()]);
    }

    #[test]
    fn blank_school_names_never_match() {
        let teachers = vec![teacher("", "0.5", "Tinggi"), teacher("   ", "0.6", "Tinggi")];
        let students = vec![student("", "0.3", "Tinggi")];
        assert!(analyzer().matched_keys(&teachers, &students).is_empty());
    }

    #[test]
    fn school_aggregate_is_an_inner_join() {
        let dataset = Dataset {
            teachers: vec![
                teacher("SD ALPHA", "0.5", "Tinggi"),
                teacher("SD ONLY TEACHERS", "0.9", "Tinggi"),
            ],
            students: vec![
                student("SD ALPHA", "0.4", "Tinggi"),
                student("SD ONLY STUDENTS", "0.2", "Tinggi"),
            ],
        };
        let aggregates = analyzer().school_aggregates(&dataset);
        let keys: Vec<&str> = aggregates.iter().map(|a| a.school_key.as_str()).collect();
        assert_eq!(keys, vec!["sd alpha"]);
    }

    #[test]
    fn school_aggregate_means_match_hand_computation() {
        let dataset = Dataset {
            teachers: vec![
                teacher("SD ABC", "0.5", "Tinggi"),
                teacher("SD ABC", "0.7", "Sedang"),
                teacher("SD ABC", "0.9", "Rendah"),
            ],
            students: vec![
                student("SD ABC", "0.3", "Tinggi"),
                student("SD ABC", "0.5", "Sedang"),
                student("SD ABC", "0.7", "Rendah"),
            ],
        };
        let aggregates = analyzer().school_aggregates(&dataset);
        assert_eq!(aggregates.len(), 1);
        let row = &aggregates[0];
        assert_eq!(row.school_key, "sd abc");
        assert!((row.ld_mean - 0.7).abs() < 1e-12);
        assert!((row.ct_mean - 0.5).abs() < 1e-12);
        assert_eq!(row.teacher_rows, 3);
        assert_eq!(row.student_rows, 3);
    }

    #[test]
    fn unparseable_scores_are_excluded_from_the_group() {
        let dataset = Dataset {
            teachers: vec![
                teacher("SD ABC", "0.4", "Tinggi"),
                teacher("SD ABC", "n/a", "Tinggi"),
                teacher("SD ABC", "0.8", "Tinggi"),
            ],
            students: vec![student("SD ABC", "0.5", "Tinggi")],
        };
        let aggregates = analyzer().school_aggregates(&dataset);
        assert_eq!(aggregates[0].teacher_rows, 2);
        assert!((aggregates[0].ld_mean - 0.6).abs() < 1e-12);
    }

    #[test]
    fn level_pass_rederives_the_matched_set() {
        // Both schools match overall, but at level Tinggi the second
        // school has teacher rows only.
        let dataset = Dataset {
            teachers: vec![
                teacher("SD ALPHA", "0.5", "Tinggi"),
                teacher("SD BETA", "0.6", "Tinggi"),
            ],
            students: vec![
                student("SD ALPHA", "0.4", "Tinggi"),
                student("SD BETA", "0.3", "Sedang"),
            ],
        };
        let a = analyzer();
        assert_eq!(a.matched_keys(&dataset.teachers, &dataset.students).len(), 2);
        let level = a.level_correlation(&dataset, "Tinggi");
        assert_eq!(level.school_count, 1);
        assert_eq!(level.aggregates[0].school_key, "sd alpha");
        assert!(level.correlation.is_none());
    }

    #[test]
    fn level_filter_is_case_insensitive() {
        let dataset = Dataset {
            teachers: vec![teacher("SD ALPHA", "0.5", "TINGGI")],
            students: vec![student("SD ALPHA", "0.4", "tinggi")],
        };
        let level = analyzer().level_correlation(&dataset, "Tinggi");
        assert_eq!(level.school_count, 1);
    }

    #[test]
    fn within_school_rows_join_levels_case_insensitively() {
        let dataset = Dataset {
            teachers: vec![
                teacher("SD ABC", "0.5", "Tinggi"),
                teacher("SD ABC", "0.4", "SEDANG"),
                teacher("SD ABC", "0.3", "Rendah"),
            ],
            students: vec![
                student("SD ABC", "0.6", "TINGGI"),
                student("SD ABC", "0.5", "sedang"),
                student("SD ABC", "0.2", "rendah"),
            ],
        };
        let rows = analyzer().school_level_rows(&dataset, "sd abc");
        let levels: Vec<&str> = rows.iter().map(|r| r.level.as_str()).collect();
        assert_eq!(levels, vec!["rendah", "sedang", "tinggi"]);
    }

    #[test]
    fn within_school_correlation_needs_three_shared_levels() {
        let mut dataset = Dataset {
            teachers: vec![
                teacher("SD ABC", "0.3", "Rendah"),
                teacher("SD ABC", "0.5", "Sedang"),
            ],
            students: vec![
                student("SD ABC", "0.2", "Rendah"),
                student("SD ABC", "0.4", "Sedang"),
            ],
        };
        let a = analyzer();
        let two = a.school_level_correlation(&dataset, "sd abc");
        assert_eq!(two.level_rows.len(), 2);
        assert!(two.correlation.is_none());

        dataset.teachers.push(teacher("SD ABC", "0.7", "Tinggi"));
        dataset.students.push(student("SD ABC", "0.6", "Tinggi"));
        let three = a.school_level_correlation(&dataset, "sd abc");
        assert_eq!(three.level_rows.len(), 3);
        let correlation = three.correlation.expect("three shared levels");
        assert!((correlation.r - 1.0).abs() < 1e-12);
    }

    #[test]
    fn rows_with_missing_level_are_excluded_from_level_grouping() {
        let dataset = Dataset {
            teachers: vec![
                teacher("SD ABC", "0.5", "Tinggi"),
                teacher("SD ABC", "0.9", ""),
            ],
            students: vec![student("SD ABC", "0.4", "Tinggi")],
        };
        let a = analyzer();
        // The blank-level row still counts toward the school mean,
        let aggregates = a.school_aggregates(&dataset);
        assert_eq!(aggregates[0].teacher_rows, 2);
        // but never toward any level group.
        let rows = a.school_level_rows(&dataset, "sd abc");
        assert_eq!(rows.len(), 1);
        assert!((rows[0].ld_mean - 0.5).abs() < 1e-12);
    }

    #[test]
    fn level_vocabulary_follows_teacher_side_and_interest_filter() {
        let dataset = Dataset {
            teachers: vec![
                teacher("SD A", "0.5", "Tinggi"),
                teacher("SD B", "0.4", "Sedang"),
                teacher("SD C", "0.3", "Rendah"),
                teacher("SD D", "0.2", ""),
            ],
            students: vec![student("SD A", "0.4", "Menengah")],
        };
        let all = analyzer().level_vocabulary(&dataset);
        assert_eq!(all, vec!["Rendah", "Sedang", "Tinggi"]);

        let narrowed = analyzer()
            .with_levels_of_interest(Some(vec!["tinggi".to_string()]))
            .level_vocabulary(&dataset);
        assert_eq!(narrowed, vec!["Tinggi"]);
    }

    #[test]
    fn full_report_assembly() {
        let schools = ["SD A", "SD B", "SD C", "SD D"];
        let ld = ["0.4", "0.5", "0.6", "0.7"];
        let ct = ["0.3", "0.4", "0.5", "0.6"];
        let mut teachers = Vec::new();
        let mut students = Vec::new();
        for i in 0..schools.len() {
            teachers.push(teacher(schools[i], ld[i], "Tinggi"));
            students.push(student(schools[i], ct[i], "Tinggi"));
        }
        let dataset = Dataset { teachers, students };
        let report = analyzer().analyze(&dataset);

        assert_eq!(report.matched_schools.len(), 4);
        assert_eq!(report.school_aggregates.len(), 4);
        let overall = report.overall.expect("four matched schools");
        assert!((overall.r - 1.0).abs() < 1e-12);
        assert_eq!(report.level_correlations.len(), 1);
        assert_eq!(report.level_correlations[0].school_count, 4);
        // One shared level per school: every within-school row is an
        // insufficient-data marker, not a statistic.
        assert_eq!(report.school_level_correlations.len(), 4);
        assert!(report
            .school_level_correlations
            .iter()
            .all(|s| s.correlation.is_none()));
    }
}
