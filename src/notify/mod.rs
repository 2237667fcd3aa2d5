use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    PlanExpired,
    PlanGranted,
    TrialActivated,
    Banned,
    Unbanned,
}

/// Outbound message for the messaging glue to deliver. The core only ever
/// enqueues these; delivery lives outside this crate.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub user_id: i64,
    pub kind: NotificationKind,
    pub text: String,
}

/// Best-effort fan-out to the messaging glue. `send` never blocks and never
/// fails the state mutation that triggered it; a full queue just drops the
/// message with a warning.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::Sender<Notification>,
}

impl Notifier {
    pub fn channel(depth: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(depth);
        (Self { tx }, rx)
    }

    pub fn send(&self, user_id: i64, kind: NotificationKind, text: impl Into<String>) {
        let note = Notification {
            user_id,
            kind,
            text: text.into(),
        };
        if let Err(err) = self.tx.try_send(note) {
            warn!(user_id, ?kind, "dropping notification: {err}");
        }
    }
}
