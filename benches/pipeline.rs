use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use reviewtask::dedupe::dedupe_lexical;
use reviewtask::identity::task_id;
use reviewtask::oracle::parse::decode_tasks;
use reviewtask::oracle::repair::repair;
use reviewtask::review::{PersistedTask, Priority, TaskStatus};

fn truncated_response(tasks: usize) -> String {
    let mut out = String::from("[");
    for i in 0..tasks {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!(
            r#"{{"description": "Handle error case {i} in the parser", "origin_text": "line {i}", "priority": "medium"}}"#
        ));
    }
    // Cut mid-object, the way a length-limited response ends.
    out.push_str(r#",{"description": "Half writ"#);
    out
}

fn synthetic_tasks(count: usize) -> Vec<PersistedTask> {
    let now = Utc::now();
    (0..count)
        .map(|i| {
            let comment_id = (i / 4) as i64;
            PersistedTask {
                id: task_id(comment_id, i % 4, "body"),
                description: format!("Add a unit test for branch {} of the retry loop", i % 6),
                origin_text: String::new(),
                priority: Priority::Medium,
                source_review_id: 1,
                source_comment_id: comment_id,
                file: "src/retry.rs".to_string(),
                line: i as u32,
                task_index: i % 4,
                status: TaskStatus::Todo,
                created_at: now,
                updated_at: now,
                pr_number: 1,
            }
        })
        .collect()
}

fn bench_repair(c: &mut Criterion) {
    let raw = truncated_response(200);
    c.bench_function("repair_truncated_array", |b| {
        b.iter(|| {
            let repaired = repair(black_box(&raw));
            black_box(repaired.is_ok());
        });
    });

    c.bench_function("decode_truncated_tasks", |b| {
        b.iter(|| {
            let decoded = decode_tasks(black_box(&raw));
            black_box(decoded.map(|d| d.tasks.len()).unwrap_or(0));
        });
    });
}

fn bench_identity(c: &mut Criterion) {
    let body = "Please handle the error returned by open()\r\n and add a test.  ".repeat(20);
    c.bench_function("task_id", |b| {
        b.iter(|| black_box(task_id(black_box(12345), black_box(3), &body)));
    });
}

fn bench_lexical_dedupe(c: &mut Criterion) {
    let tasks = synthetic_tasks(2_000);
    c.bench_function("dedupe_lexical_2000", |b| {
        b.iter(|| {
            let kept = dedupe_lexical(black_box(tasks.clone()), 0.8);
            black_box(kept.len());
        });
    });
}

criterion_group!(pipeline, bench_repair, bench_identity, bench_lexical_dedupe);
criterion_main!(pipeline);
