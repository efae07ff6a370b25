use reviewtask::analyzer::{AnalyzeOptions, Analyzer};
use reviewtask::checkpoint::CheckpointStore;
use reviewtask::config::Config;
use reviewtask::error::OracleError;
use reviewtask::incremental::RunStatus;
use reviewtask::oracle::{Oracle, OracleFuture, OutputShape};
use reviewtask::review::TaskStatus;
use reviewtask::storage::Storage;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::TempDir;

/// Oracle fake keyed on the `comment_id: <n>` line of each request.
///
/// Requests without a comment id (dedupe prompts) get `{"remove": []}`.
#[derive(Default)]
struct FakeOracle {
    responses: Mutex<HashMap<i64, Vec<Result<String, OracleError>>>>,
    calls: Mutex<HashMap<i64, usize>>,
}

impl FakeOracle {
    fn respond(self, comment_id: i64, responses: Vec<Result<String, OracleError>>) -> Self {
        self.responses.lock().unwrap().insert(comment_id, responses);
        self
    }

    fn calls_for(&self, comment_id: i64) -> usize {
        self.calls
            .lock()
            .unwrap()
            .get(&comment_id)
            .copied()
            .unwrap_or(0)
    }

    fn comment_id(request: &str) -> Option<i64> {
        request.lines().find_map(|line| {
            line.strip_prefix("comment_id: ")
                .and_then(|rest| rest.trim().parse().ok())
        })
    }
}

impl Oracle for FakeOracle {
    fn invoke<'a>(&'a self, request: &'a str, _shape: OutputShape) -> OracleFuture<'a> {
        Box::pin(async move {
            let Some(id) = Self::comment_id(request) else {
                return Ok(r#"{"remove": []}"#.to_string());
            };
            let attempt = {
                let mut calls = self.calls.lock().unwrap();
                let count = calls.entry(id).or_default();
                *count += 1;
                *count
            };
            let responses = self.responses.lock().unwrap();
            let script = responses
                .get(&id)
                .ok_or_else(|| OracleError::Process(format!("no script for comment {}", id)))?;
            script
                .get(attempt - 1)
                .or_else(|| script.last())
                .cloned()
                .unwrap_or_else(|| Err(OracleError::Process("empty script".into())))
        })
    }

    fn name(&self) -> &str {
        "fake"
    }
}

fn fast_config() -> Config {
    let mut config = Config::default();
    config.ai_settings.max_retries = 3;
    config.ai_settings.base_delay_ms = 1;
    config.ai_settings.max_delay_ms = 2;
    config
}

fn write_reviews(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("reviews.json");
    std::fs::write(
        &path,
        r#"{"reviews": [{
            "id": 500,
            "author": "alice",
            "state": "CHANGES_REQUESTED",
            "comments": [
                {"id": 1, "file": "src/a.rs", "line": 10, "body": "This unwrap will panic on bad input"},
                {"id": 2, "file": "src/b.rs", "line": 20, "body": "The retry loop never gives up"},
                {"id": 3, "file": "src/c.rs", "line": 30, "body": "Missing test for the empty case"}
            ]
        }]}"#,
    )
    .unwrap();
    path
}

fn options(reviews: PathBuf) -> AnalyzeOptions {
    AnalyzeOptions {
        reviews_file: Some(reviews),
        ..AnalyzeOptions::default()
    }
}

#[tokio::test]
async fn truncated_response_is_recovered_and_rate_limited_comment_is_dropped() {
    let dir = TempDir::new().unwrap();
    let reviews = write_reviews(&dir);
    let oracle = FakeOracle::default()
        .respond(
            1,
            vec![Ok(
                r#"[{"description": "Return an error instead of unwrapping", "priority": "high"}]"#
                    .into(),
            )],
        )
        .respond(
            2,
            vec![Ok(
                r#"[{"description": "Cap the number of retries", "priority": "medium""#.into(),
            )],
        )
        .respond(3, vec![Err(OracleError::RateLimited("slow down".into()))]);

    let analyzer = Analyzer::new(Storage::new(dir.path()), fast_config());
    let report = analyzer.analyze(&oracle, 42, &options(reviews)).await.unwrap();

    assert_eq!(report.status, RunStatus::Incomplete);
    assert_eq!(report.failed, vec![3]);
    assert_eq!(oracle.calls_for(1), 1);
    assert_eq!(oracle.calls_for(2), 1);
    assert_eq!(oracle.calls_for(3), 3);

    let stored = analyzer.storage().load_tasks(42).unwrap();
    let mut descriptions: Vec<&str> = stored
        .tasks
        .iter()
        .map(|t| t.description.as_str())
        .collect();
    descriptions.sort();
    assert_eq!(
        descriptions,
        vec!["Cap the number of retries", "Return an error instead of unwrapping"]
    );
    assert!(stored.tasks.iter().all(|t| t.status == TaskStatus::Todo));

    // Comment 3 is still owed, so the checkpoint survives for the next run.
    let checkpoint = analyzer.storage().load_checkpoint(42).unwrap().unwrap();
    assert_eq!(checkpoint.processed_count(), 2);
}

#[tokio::test]
async fn resumed_run_does_not_reinvoke_committed_comments() {
    let dir = TempDir::new().unwrap();
    let reviews = write_reviews(&dir);
    let scripted = || {
        FakeOracle::default()
            .respond(1, vec![Ok(r#"[{"description": "Task one"}]"#.into())])
            .respond(2, vec![Ok(r#"[{"description": "Task two"}]"#.into())])
            .respond(3, vec![Ok(r#"[{"description": "Task three"}]"#.into())])
    };

    let analyzer = Analyzer::new(Storage::new(dir.path()), fast_config());
    let first_oracle = scripted();
    let interrupted = AnalyzeOptions {
        batch_size: Some(1),
        max_batches: Some(2),
        ..options(reviews.clone())
    };
    let first = analyzer
        .analyze(&first_oracle, 7, &interrupted)
        .await
        .unwrap();
    assert_eq!(first.status, RunStatus::BatchLimit);
    assert_eq!(first.processed, 2);
    assert!(analyzer.storage().has_checkpoint(7));

    let second_oracle = scripted();
    let second = analyzer
        .analyze(&second_oracle, 7, &options(reviews))
        .await
        .unwrap();
    assert!(second.resumed);
    assert_eq!(second.status, RunStatus::Completed);
    assert_eq!(second_oracle.calls_for(1), 0);
    assert_eq!(second_oracle.calls_for(2), 0);
    assert_eq!(second_oracle.calls_for(3), 1);
    assert!(!analyzer.storage().has_checkpoint(7));

    let stored = analyzer.storage().load_tasks(7).unwrap();
    assert_eq!(stored.tasks.len(), 3);
}

#[tokio::test]
async fn rerun_keeps_ids_and_progress() {
    let dir = TempDir::new().unwrap();
    let reviews = write_reviews(&dir);
    let scripted = || {
        FakeOracle::default()
            .respond(1, vec![Ok(r#"[{"description": "Task one"}]"#.into())])
            .respond(2, vec![Ok("[]".into())])
            .respond(3, vec![Ok("No actionable items.".into())])
    };

    let analyzer = Analyzer::new(Storage::new(dir.path()), fast_config());
    analyzer
        .analyze(&scripted(), 9, &options(reviews.clone()))
        .await
        .unwrap();
    let first = analyzer.storage().load_tasks(9).unwrap();
    assert_eq!(first.tasks.len(), 1);

    let path = analyzer.storage().tasks_path(9);
    let mut edited = first.clone();
    edited.tasks[0].status = TaskStatus::Doing;
    std::fs::write(&path, serde_json::to_string_pretty(&edited).unwrap()).unwrap();

    let report = analyzer
        .analyze(&scripted(), 9, &options(reviews))
        .await
        .unwrap();
    assert_eq!(report.merge.added, 0);
    assert_eq!(report.merge.updated, 1);

    let second = analyzer.storage().load_tasks(9).unwrap();
    assert_eq!(second.tasks[0].id, first.tasks[0].id);
    assert_eq!(second.tasks[0].status, TaskStatus::Doing);
}

#[tokio::test]
async fn missing_oracle_is_critical_and_keeps_checkpoint() {
    let dir = TempDir::new().unwrap();
    let reviews = write_reviews(&dir);
    let oracle = FakeOracle::default()
        .respond(1, vec![Ok(r#"[{"description": "Task one"}]"#.into())])
        .respond(
            2,
            vec![Err(OracleError::NotFound {
                command: "claude".into(),
            })],
        )
        .respond(3, vec![Ok("[]".into())]);

    let analyzer = Analyzer::new(Storage::new(dir.path()), fast_config());
    let run = AnalyzeOptions {
        batch_size: Some(1),
        ..options(reviews)
    };
    let err = analyzer.analyze(&oracle, 5, &run).await.unwrap_err();
    let pipeline = err
        .downcast_ref::<reviewtask::error::PipelineError>()
        .unwrap();
    assert!(pipeline.is_critical());
    assert_eq!(oracle.calls_for(2), 1);
    assert_eq!(oracle.calls_for(3), 0);

    let checkpoint = analyzer.storage().load_checkpoint(5).unwrap().unwrap();
    assert_eq!(checkpoint.processed_count(), 1);
}
