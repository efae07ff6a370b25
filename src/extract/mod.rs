//! Comment extraction
//!
//! Flattens reviews into an ordered list of `CommentContext`, dropping resolved
//! threads and (optionally) nitpick-only blocks.

pub mod patterns;

use crate::review::{Comment, CommentContext, Review, ReviewRef};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct ExtractOptions {
    pub process_nitpicks: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            process_nitpicks: true,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub contexts: Vec<CommentContext>,
    pub resolved_filtered: usize,
    pub nitpick_filtered: usize,
}

/// A comment thread is resolved when the source says so, or when its body or
/// any reply carries a resolution marker.
pub fn is_resolved(comment: &Comment) -> bool {
    comment.is_resolved
        || patterns::has_resolution_marker(&comment.body)
        || comment
            .replies
            .iter()
            .any(|reply| patterns::has_resolution_marker(&reply.body))
}

pub fn extract_comment_contexts(reviews: &[Review], options: ExtractOptions) -> Extraction {
    let mut out = Extraction::default();

    for review in reviews {
        let review_ref = ReviewRef {
            id: review.id,
            author: review.author.clone(),
            state: review.state.clone(),
        };

        if !review.body.trim().is_empty() {
            let body_comment = Comment {
                id: review.id,
                file: String::new(),
                line: 0,
                body: review.body.clone(),
                author: review.author.clone(),
                created_at: review.submitted_at,
                is_resolved: false,
                replies: Vec::new(),
            };
            consider(&mut out, &review_ref, body_comment, true, options);
        }

        for comment in &review.comments {
            consider(&mut out, &review_ref, comment.clone(), false, options);
        }
    }

    info!(
        contexts = out.contexts.len(),
        resolved_filtered = out.resolved_filtered,
        nitpick_filtered = out.nitpick_filtered,
        "extracted review comments"
    );
    out
}

fn consider(
    out: &mut Extraction,
    review: &ReviewRef,
    comment: Comment,
    from_review_body: bool,
    options: ExtractOptions,
) {
    if is_resolved(&comment) {
        debug!(comment_id = comment.id, "skipping resolved comment");
        out.resolved_filtered += 1;
        return;
    }
    if !options.process_nitpicks {
        if let Some(kind) = patterns::nitpick_kind(&comment.body) {
            debug!(comment_id = comment.id, kind, "skipping nitpick comment");
            out.nitpick_filtered += 1;
            return;
        }
    }
    out.contexts.push(CommentContext {
        review: review.clone(),
        comment,
        from_review_body,
    });
}
