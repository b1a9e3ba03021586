//! Discovery of student submissions and reference solutions.
//!
//! Submissions are named `<student>_A<exercise>.<ext>` where `<ext>` is
//! `py` (the script), `tex` or `pdf` (the write-up). Student ids may carry
//! a `_U<sheet>` suffix that is hidden in labels.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

const SUBMISSION_EXTENSIONS: [&str; 3] = ["py", "tex", "pdf"];

/// Students and exercises found in a submissions folder.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionIndex {
    dir: PathBuf,
    /// Sorted, unique.
    students: Vec<String>,
    /// Highest exercise number seen.
    exercise_count: u32,
}

impl SubmissionIndex {
    /// Scan `dir` for submission files.
    ///
    /// Files that do not follow the naming scheme are logged and skipped.
    pub fn scan(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Cannot read submissions folder {}", dir.display()))?;

        let mut students = BTreeSet::new();
        let mut exercise_count = 0;

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!(error = %e, "Error reading submissions folder entry");
                    continue;
                }
            };

            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_submission = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| SUBMISSION_EXTENSIONS.contains(&ext));
            if !is_submission {
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            match parse_name(&name) {
                Some((student, exercise)) => {
                    students.insert(student.to_string());
                    exercise_count = exercise_count.max(exercise);
                }
                None => warn!(file = %name, "Skipping file that is not named <student>_A<n>"),
            }
        }

        info!(
            dir = %dir.display(),
            students = students.len(),
            exercises = exercise_count,
            "Scanned submissions"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            students: students.into_iter().collect(),
            exercise_count,
        })
    }

    pub fn students(&self) -> &[String] {
        &self.students
    }

    pub const fn exercise_count(&self) -> u32 {
        self.exercise_count
    }

    pub fn contains(&self, student: &str) -> bool {
        self.students.binary_search_by(|s| s.as_str().cmp(student)).is_ok()
    }

    /// Path of the script a student handed in for `exercise`.
    pub fn script_path(&self, student: &str, exercise: u32) -> PathBuf {
        self.file_path(student, exercise, "py")
    }

    /// Path of a companion file (`pdf`, `tex`) of a submission.
    pub fn file_path(&self, student: &str, exercise: u32, extension: &str) -> PathBuf {
        self.dir.join(format!("{student}_A{exercise}.{extension}"))
    }
}

/// Display label for a student id: everything before `_U`.
pub fn label(student: &str) -> &str {
    student.split("_U").next().unwrap_or(student)
}

/// Split `<student>_A<digit>...` into the student id and exercise number.
fn parse_name(name: &str) -> Option<(&str, u32)> {
    let (student, rest) = name.split_once("_A")?;
    let exercise = rest.chars().next()?.to_digit(10)?;
    (!student.is_empty()).then_some((student, exercise))
}

/// Reference solutions (`*.py`) in `dir`, sorted by file name.
///
/// Exercise `n` is the `n`-th entry.
pub fn list_solutions(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot read solutions folder {}", dir.display()))?;

    let mut solutions: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(e) => Some(e.path()),
            Err(e) => {
                warn!(error = %e, "Error reading solutions folder entry");
                None
            }
        })
        .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "py"))
        .collect();
    solutions.sort();

    debug!(dir = %dir.display(), count = solutions.len(), "Listed solutions");
    Ok(solutions)
}

/// Path of the reference solution for `exercise` (1-based).
pub fn solution_for(solutions: &[PathBuf], exercise: usize) -> Option<&Path> {
    exercise
        .checked_sub(1)
        .and_then(|idx| solutions.get(idx))
        .map(PathBuf::as_path)
}
