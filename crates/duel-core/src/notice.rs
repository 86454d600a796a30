//! Transient user-visible notices.
//!
//! At most one notice is shown at a time; posting a new one replaces the
//! old one and restarts the auto-clear deadline.

use crate::clock::millis;
use serde::Serialize;
use std::fmt::{self, Display, Formatter};
use std::time::Duration;

pub const ROLE_RESYNC_NOTICE: &str = "role mis-assignment, auto-corrected, please retry";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NoticeLevel {
    Info,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub text: String,
}

impl Display for Notice {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.level {
            NoticeLevel::Info => write!(f, "{}", self.text),
            NoticeLevel::Error => write!(f, "error: {}", self.text),
        }
    }
}

#[derive(Debug)]
pub struct NoticeBoard {
    ttl: Duration,
    current: Option<(Notice, u64)>,
}

impl NoticeBoard {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, current: None }
    }

    pub fn post(&mut self, level: NoticeLevel, text: impl Into<String>, now_ms: u64) -> Notice {
        let notice = Notice {
            level,
            text: text.into(),
        };
        self.current = Some((notice.clone(), now_ms + millis(self.ttl)));
        notice
    }

    pub fn current(&self) -> Option<&Notice> {
        self.current.as_ref().map(|(n, _)| n)
    }

    /// Clear the notice once its deadline passes. Returns true if it was cleared.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        match self.current {
            Some((_, clear_at)) if now_ms >= clear_at => {
                self.current = None;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notice_clears_after_ttl() {
        let mut board = NoticeBoard::new(Duration::from_secs(4));
        board.post(NoticeLevel::Info, "hello", 1000);

        assert!(!board.poll(4999));
        assert_eq!(board.current().unwrap().text, "hello");
        assert!(board.poll(5000));
        assert!(board.current().is_none());
        assert!(!board.poll(6000));
    }

    #[test]
    fn test_new_notice_restarts_deadline() {
        let mut board = NoticeBoard::new(Duration::from_secs(4));
        board.post(NoticeLevel::Info, "first", 0);
        board.post(NoticeLevel::Error, "second", 3000);

        assert!(!board.poll(4000));
        assert_eq!(board.current().unwrap().to_string(), "error: second");
        assert!(board.poll(7000));
    }
}
