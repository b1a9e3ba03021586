//! MCP server implementation using rmcp.
//!
//! Exposes the execution engine and the grading helpers as MCP tools, so a
//! reviewer's client can page through submissions, look at their output and
//! record grades.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::Config;
use crate::engine::{Engine, ExecutionResult, ScriptRunner};
use crate::grading::{self, GradingError};
use crate::render::{render, Block};
use crate::submissions::{self, SubmissionIndex};

/// MCP server for reviewing and grading submissions.
#[derive(Clone)]
pub struct GradingServer<R: Clone> {
    config: Arc<Config>,
    engine: Engine<R>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the run_script tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RunScriptParams {
    #[schemars(description = "Path of the Python script to run")]
    pub path: String,
}

/// Identifies one submission.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SubmissionParams {
    #[schemars(description = "Student id as returned by list_submissions (e.g. '4711_U3')")]
    pub student: String,

    #[schemars(description = "Exercise number, starting at 1")]
    pub exercise: u32,
}

/// Parameters for the grade_submission tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct GradeParams {
    #[schemars(description = "Student id as returned by list_submissions")]
    pub student: String,

    #[schemars(description = "Exercise number, starting at 1")]
    pub exercise: u32,

    #[schemars(description = "Points to award (0-99)")]
    pub points: u32,

    #[schemars(description = "Feedback, one comment per line; replaces earlier comments")]
    #[serde(default)]
    pub comments: String,
}

/// Parameters for the run_solution tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct SolutionParams {
    #[schemars(description = "Exercise number, starting at 1")]
    pub exercise: usize,
}

#[derive(Debug, Serialize)]
struct StudentEntry<'a> {
    id: &'a str,
    label: &'a str,
}

#[tool_router]
impl<R: ScriptRunner + Clone + 'static> GradingServer<R> {
    /// Create a new grading server.
    pub fn new(config: Config, engine: Engine<R>) -> Self {
        Self {
            config: Arc::new(config),
            engine,
            tool_router: Self::tool_router(),
        }
    }

    /// Run a script and return its printed text interleaved with its plots.
    #[tool(description = "Run a Python script and capture its printed output and matplotlib plots")]
    async fn run_script(
        &self,
        Parameters(params): Parameters<RunScriptParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(path = %params.path, "Running script");
        let result = self.engine.run(Path::new(&params.path)).await;
        Ok(tool_result(Vec::new(), &result))
    }

    /// List students, exercises and reference solutions.
    #[tool(description = "List students and exercises found in the course's submissions folder")]
    async fn list_submissions(&self) -> Result<CallToolResult, McpError> {
        let index = match self.index() {
            Ok(index) => index,
            Err(e) => return Ok(failure(&e)),
        };
        let solutions = submissions::list_solutions(&self.config.course.solutions_dir())
            .unwrap_or_default();

        let students: Vec<_> = index
            .students()
            .iter()
            .map(|id| StudentEntry {
                id,
                label: submissions::label(id),
            })
            .collect();
        let listing = serde_json::json!({
            "students": students,
            "exercises": index.exercise_count(),
            "solutions": solutions
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy())
                .collect::<Vec<_>>(),
        });

        Ok(CallToolResult::success(vec![Content::text(listing.to_string())]))
    }

    /// Show a submission's source, recorded grade and run output.
    #[tool(description = "Show a submission's code, its current grade and comments, and its output")]
    async fn review_submission(
        &self,
        Parameters(params): Parameters<SubmissionParams>,
    ) -> Result<CallToolResult, McpError> {
        let path = self.submission_path(&params.student, params.exercise)?;

        let source = match tokio::fs::read_to_string(&path).await {
            Ok(source) => source,
            Err(e) => {
                return Ok(CallToolResult::error(vec![Content::text(format!(
                    "Error reading file: {e}"
                ))]))
            }
        };

        let grade = match grading::read_annotation(&source) {
            Ok(annotation) => format!(
                "Points: {}\nComments:\n{}",
                annotation.points,
                annotation.comments.join("\n")
            ),
            Err(e) => e.to_string(),
        };

        let result = self.engine.run(&path).await;
        let header = vec![Content::text(source), Content::text(grade)];
        Ok(tool_result(header, &result))
    }

    /// Record points and comments in a submission file.
    #[tool(description = "Record points and comments in a submission file (replaces the previous grade)")]
    async fn grade_submission(
        &self,
        Parameters(params): Parameters<GradeParams>,
    ) -> Result<CallToolResult, McpError> {
        let path = self.submission_path(&params.student, params.exercise)?;

        match grading::grade_file(&path, params.points, &params.comments).await {
            Ok(updated) => {
                info!(student = %params.student, exercise = params.exercise, points = params.points, "Graded submission");
                Ok(CallToolResult::success(vec![
                    Content::text(format!(
                        "Recorded {} points for {} exercise {}",
                        params.points,
                        submissions::label(&params.student),
                        params.exercise
                    )),
                    Content::text(updated),
                ]))
            }
            Err(e @ GradingError::PointsOutOfRange { .. }) => {
                Err(McpError::invalid_params(e.to_string(), None))
            }
            Err(e) => {
                error!(error = %e, "Grading failed");
                Ok(failure(&anyhow::Error::new(e)))
            }
        }
    }

    /// Run the reference solution of an exercise.
    #[tool(description = "Run the reference solution for an exercise")]
    async fn run_solution(
        &self,
        Parameters(params): Parameters<SolutionParams>,
    ) -> Result<CallToolResult, McpError> {
        let solutions = match submissions::list_solutions(&self.config.course.solutions_dir()) {
            Ok(solutions) => solutions,
            Err(e) => return Ok(failure(&e)),
        };
        let path = submissions::solution_for(&solutions, params.exercise).ok_or_else(|| {
            McpError::invalid_params(
                format!(
                    "No solution for exercise {}. Available: 1..={}",
                    params.exercise,
                    solutions.len()
                ),
                None,
            )
        })?;

        let result = self.engine.run(path).await;
        Ok(tool_result(Vec::new(), &result))
    }

    fn index(&self) -> anyhow::Result<SubmissionIndex> {
        SubmissionIndex::scan(&self.config.course.submissions_dir())
    }

    /// Resolve a student/exercise pair to a script path.
    fn submission_path(&self, student: &str, exercise: u32) -> Result<PathBuf, McpError> {
        let index = self
            .index()
            .map_err(|e| McpError::internal_error(format!("{e:#}"), None))?;

        if !index.contains(student) {
            return Err(McpError::invalid_params(
                format!("Unknown student: '{student}'"),
                None,
            ));
        }
        if exercise == 0 || exercise > index.exercise_count() {
            return Err(McpError::invalid_params(
                format!(
                    "Unknown exercise {exercise}. Available: 1..={}",
                    index.exercise_count()
                ),
                None,
            ));
        }
        Ok(index.script_path(student, exercise))
    }
}

/// Turn run output into tool content: text and image items in presentation
/// order after `header`. Faulted runs are flagged as tool errors.
fn tool_result(mut content: Vec<Content>, result: &ExecutionResult) -> CallToolResult {
    content.extend(render(result).into_iter().map(|block| match block {
        Block::Notice(text) | Block::Text(text) | Block::Error(text) => Content::text(text),
        Block::Image(image) => Content::image(image.to_base64(), image.mime_type().to_string()),
    }));

    if result.is_success() {
        CallToolResult::success(content)
    } else {
        CallToolResult::error(content)
    }
}

fn failure(err: &anyhow::Error) -> CallToolResult {
    CallToolResult::error(vec![Content::text(format!("{err:#}"))])
}

#[tool_handler]
impl<R: ScriptRunner + Clone + 'static> ServerHandler for GradingServer<R> {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "scriptgrade".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Review and grade student plotting scripts.\n\
                 Submissions folder: {}\n\
                 \n\
                 Use 'list_submissions' to see students and exercises, \
                 'review_submission' to see code and output, and \
                 'grade_submission' to record points and comments.\n\
                 Scripts run to completion; a script that never ends blocks the run.",
                self.config.course.submissions_dir().display()
            )),
        }
    }
}

/// Serve the grading server over stdio.
pub async fn serve_stdio<R: ScriptRunner + Clone + 'static>(
    config: Config,
    engine: Engine<R>,
) -> anyhow::Result<()> {
    let server = GradingServer::new(config, engine);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
