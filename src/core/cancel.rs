use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Derives a child token that fires when `deadline` elapses or the parent is
/// cancelled, whichever comes first. The watcher task exits as soon as the
/// child fires for any reason.
pub(crate) fn deadline_token(parent: &CancellationToken, deadline: Duration) -> CancellationToken {
    let child = parent.child_token();
    let watcher = child.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = watcher.cancelled() => {}
            _ = tokio::time::sleep(deadline) => watcher.cancel(),
        }
    });
    child
}

/// Combines the client-wide default timeout with a per-call override. Zero
/// disables the default; the override never extends past the default.
pub(crate) fn effective_timeout(
    default_timeout: Duration,
    per_call: Option<Duration>,
) -> Option<Duration> {
    match per_call {
        Some(timeout) if default_timeout.is_zero() => Some(timeout),
        Some(timeout) => Some(timeout.min(default_timeout)),
        None if default_timeout.is_zero() => None,
        None => Some(default_timeout),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::{deadline_token, effective_timeout};

    #[test]
    fn per_call_timeout_never_extends_the_default() {
        assert_eq!(
            effective_timeout(Duration::from_secs(30), Some(Duration::from_millis(50))),
            Some(Duration::from_millis(50))
        );
        assert_eq!(
            effective_timeout(Duration::from_secs(1), Some(Duration::from_secs(5))),
            Some(Duration::from_secs(1))
        );
        assert_eq!(
            effective_timeout(Duration::ZERO, Some(Duration::from_secs(5))),
            Some(Duration::from_secs(5))
        );
        assert_eq!(effective_timeout(Duration::ZERO, None), None);
    }

    #[tokio::test]
    async fn deadline_token_fires_after_the_deadline() {
        let parent = CancellationToken::new();
        let child = deadline_token(&parent, Duration::from_millis(20));
        assert!(!child.is_cancelled());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }

    #[tokio::test]
    async fn deadline_token_tracks_parent_cancellation() {
        let parent = CancellationToken::new();
        let child = deadline_token(&parent, Duration::from_secs(30));
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
