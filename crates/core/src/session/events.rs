//! Tracker status text derived from engine events.

use once_cell::sync::Lazy;
use regex_lite::Regex;

use crate::engine::EngineEvent;

/// Message the engine attaches to a download that just completed.
pub const FINISHED_DOWNLOADING: &str = "torrent has finished downloading";

/// Alerts look like `tracker: "<url>" <message>`.
static TRACKER_ALERT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"tracker:\s*".*"\s*(.*)"#).unwrap());

/// The human part of a tracker alert, or an empty string.
pub fn alert_message(raw: &str) -> &str {
    TRACKER_ALERT
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or("")
}

/// Status line for a tracker event, plus the raw message to keep with it.
///
/// `None` for events that do not change tracker status.
pub fn tracker_update(event: &EngineEvent) -> Option<(String, Option<String>)> {
    match event {
        EngineEvent::TrackerAnnounce { .. } => Some(("Announce sent".to_string(), None)),
        EngineEvent::TrackerReply { .. } => Some(("Announce OK".to_string(), None)),
        EngineEvent::TrackerAlert {
            message,
            status_code,
            times_in_row,
            ..
        } => Some((
            format!(
                "Alert: {} (HTTP code={}, times in a row={})",
                alert_message(message),
                status_code,
                times_in_row
            ),
            Some(message.clone()),
        )),
        EngineEvent::TrackerWarning { message, .. } => {
            Some((format!("Warning: {}", message), Some(message.clone())))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SessionHandle;

    #[test]
    fn test_alert_message_extraction() {
        assert_eq!(
            alert_message(r#"tracker: "http://tracker.example/announce" timed out"#),
            "timed out"
        );
        assert_eq!(alert_message("connection refused"), "");
    }

    #[test]
    fn test_tracker_alert_status() {
        let event = EngineEvent::TrackerAlert {
            handle: SessionHandle(1),
            message: r#"tracker: "udp://t.example:80" 404 Not Found"#.to_string(),
            status_code: 404,
            times_in_row: 3,
        };
        let (status, raw) = tracker_update(&event).unwrap();
        assert_eq!(
            status,
            "Alert: 404 Not Found (HTTP code=404, times in a row=3)"
        );
        assert_eq!(raw.as_deref(), Some(r#"tracker: "udp://t.example:80" 404 Not Found"#));
    }

    #[test]
    fn test_announce_reply_and_warning() {
        let handle = SessionHandle(2);
        assert_eq!(
            tracker_update(&EngineEvent::TrackerAnnounce { handle }),
            Some(("Announce sent".to_string(), None))
        );
        assert_eq!(
            tracker_update(&EngineEvent::TrackerReply { handle }),
            Some(("Announce OK".to_string(), None))
        );
        assert_eq!(
            tracker_update(&EngineEvent::TrackerWarning {
                handle,
                message: "interval too short".to_string(),
            }),
            Some((
                "Warning: interval too short".to_string(),
                Some("interval too short".to_string())
            ))
        );
    }

    #[test]
    fn test_non_tracker_events_leave_status_alone() {
        let event = EngineEvent::Finished {
            handle: SessionHandle(1),
            message: FINISHED_DOWNLOADING.to_string(),
        };
        assert_eq!(tracker_update(&event), None);
    }
}
