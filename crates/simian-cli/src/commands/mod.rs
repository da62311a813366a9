//! CLI command implementations.

pub mod dead_letters;
pub mod start_batch;
pub mod status;
pub mod sweep;
pub mod wait;

use simian_models::BatchStatus;

/// Human-readable batch counters.
pub fn format_status(batch_id: &str, status: &BatchStatus) -> String {
    format!(
        "Batch {} ({})\n  total:         {}\n  pending:       {}\n  in progress:   {}\n  completed:     {}\n  dead-lettered: {}\n  retried:       {}\n  progress:      {}%",
        batch_id,
        status.state.as_str(),
        status.total,
        status.pending,
        status.in_progress,
        status.completed,
        status.dead_lettered,
        status.retried,
        status.progress_percent(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use simian_models::BatchState;

    #[test]
    fn test_format_status() {
        let status = BatchStatus {
            total: 10,
            pending: 2,
            in_progress: 1,
            completed: 6,
            failed: 1,
            dead_lettered: 1,
            retried: 3,
            state: BatchState::Ready,
        };

        let text = format_status("b1", &status);
        assert!(text.starts_with("Batch b1 (ready)"));
        assert!(text.contains("completed:     6"));
        assert!(text.contains("progress:      70%"));
    }
}
