use std::sync::Arc;

use futures::future::join_all;
use parlor_core::ServerMessage;
use tracing::{debug, error, warn};

use crate::session::Session;

/// Outcome of one broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: usize,
}

impl std::ops::AddAssign for FanoutReport {
    fn add_assign(&mut self, other: Self) {
        self.delivered += other.delivered;
        self.failed += other.failed;
    }
}

/// Concurrent delivery of one frame to many sessions.
///
/// The frame is encoded once and queued on every recipient in parallel. A
/// recipient whose queue is closed or stays full past its send timeout is
/// logged and skipped; the others are unaffected.
#[derive(Clone, Copy, Debug, Default)]
pub struct Fanout;

impl Fanout {
    pub fn new() -> Self {
        Self
    }

    pub async fn broadcast(&self, sessions: &[Arc<Session>], message: &ServerMessage) -> FanoutReport {
        if sessions.is_empty() {
            return FanoutReport::default();
        }

        let frame: Arc<str> = match message.to_frame() {
            Ok(frame) => Arc::from(frame),
            Err(e) => {
                error!(kind = message.kind(), error = %e, "failed to encode broadcast");
                return FanoutReport { delivered: 0, failed: sessions.len() };
            }
        };

        let sends = sessions.iter().map(|session| {
            let frame = Arc::clone(&frame);
            async move { (session, session.deliver(frame).await) }
        });

        let mut report = FanoutReport::default();
        for (session, result) in join_all(sends).await {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        session_id = %session.id(),
                        kind = message.kind(),
                        error = %e,
                        "broadcast delivery failed"
                    );
                }
            }
        }

        debug!(
            kind = message.kind(),
            recipients = sessions.len(),
            delivered = report.delivered,
            "broadcast complete"
        );
        report
    }
}
