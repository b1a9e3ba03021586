//! Grade annotations stored inside submission files.
//!
//! A graded submission carries one line matching `== <points> P ==`
//! (usually written as a comment, `# == 7 P ==`); every line after it is
//! reviewer feedback.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{NoExpand, Regex};
use serde::Serialize;
use tracing::{debug, info};

/// Largest score the annotation pattern can hold.
pub const MAX_POINTS: u32 = 99;

#[derive(Debug, thiserror::Error)]
pub enum GradingError {
    #[error("found {count} lines awarding points; fix the file by hand")]
    MultipleAnnotations { count: usize },

    #[error("{points} points cannot be recorded (maximum is {MAX_POINTS})")]
    PointsOutOfRange { points: u32 },

    #[error("invalid annotation pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("cannot access {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Points and feedback currently recorded in a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Annotation {
    pub points: u32,
    pub comments: Vec<String>,
}

fn pattern() -> Result<&'static Regex, GradingError> {
    static PATTERN: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"== (\d{1,2}) P =="))
        .as_ref()
        .map_err(|e| GradingError::Pattern(e.clone()))
}

/// Read the annotation from a submission's source.
///
/// No annotation means zero points and no comments.
pub fn read_annotation(source: &str) -> Result<Annotation, GradingError> {
    let pattern = pattern()?;
    let found: Vec<u32> = pattern
        .captures_iter(source)
        .filter_map(|caps| caps[1].parse().ok())
        .collect();

    match found.as_slice() {
        [] => Ok(Annotation::default()),
        [points] => {
            let comments = source
                .lines()
                .skip_while(|line| !pattern.is_match(line))
                .skip(1)
                .map(str::to_string)
                .collect();
            Ok(Annotation {
                points: *points,
                comments,
            })
        }
        _ => Err(GradingError::MultipleAnnotations { count: found.len() }),
    }
}

/// Record `points` and `comments` in `source`.
///
/// The first annotation line gets the new score and everything after it is
/// replaced by `comments`. Without an annotation, `# == N P ==` is appended
/// after the code.
pub fn apply_grade(source: &str, points: u32, comments: &str) -> Result<String, GradingError> {
    if points > MAX_POINTS {
        return Err(GradingError::PointsOutOfRange { points });
    }
    let pattern = pattern()?;
    let marker = format!("== {points} P ==");

    let lines: Vec<&str> = source.split_inclusive('\n').collect();
    let mut out = String::with_capacity(source.len() + comments.len() + 16);

    if let Some(idx) = lines.iter().position(|line| pattern.is_match(line)) {
        lines[..idx].iter().for_each(|line| out.push_str(line));
        out.push_str(&pattern.replace_all(lines[idx], NoExpand(&marker)));
    } else {
        out.push_str(source);
        out.push_str(&format!("\n# {marker}\n"));
    }

    if !comments.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
    for line in comments.lines() {
        out.push_str(line);
        out.push('\n');
    }

    Ok(out)
}

/// Grade the file at `path` in place and return its new content.
///
/// Files with more than one annotation are left untouched.
pub async fn grade_file(path: &Path, points: u32, comments: &str) -> Result<String, GradingError> {
    let source = read(path).await?;
    let previous = read_annotation(&source)?;
    let updated = apply_grade(&source, points, comments)?;

    tokio::fs::write(path, &updated)
        .await
        .map_err(|source| GradingError::Io {
            path: path.to_path_buf(),
            source,
        })?;

    debug!(previous = previous.points, "Replaced annotation");
    info!(path = %path.display(), points, "Recorded grade");
    Ok(updated)
}

async fn read(path: &Path) -> Result<String, GradingError> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|source| GradingError::Io {
            path: path.to_path_buf(),
            source,
        })
}
