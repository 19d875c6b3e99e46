//! Attendance session state machine for one relay pairing.
//!
//! The tracker never performs I/O. [`AttendanceTracker::plan`] turns a roster
//! snapshot into the steps to execute, and the caller reports each step that
//! succeeded through [`AttendanceTracker::commit`]. A failed step leaves the
//! tracker where it was, so the next snapshot re-plans the same work.

use std::collections::BTreeMap;

use backend_core::{User, display_name_list};
use chrono::{DateTime, TimeDelta, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendancePhase {
    /// No attendance message exists.
    Idle,
    /// A roster message is live and edited as people come and go.
    Active,
    /// The roster emptied and the live message is already marked historical;
    /// only the summary post is outstanding.
    Ending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttendanceStep {
    /// Post a new roster message.
    Start { text: String },
    /// Edit the live roster message in place.
    Update { message_id: String, text: String },
    /// Rewrite the live roster message as a record of the past session.
    MarkHistorical { message_id: String, text: String },
    /// Post the duration and cumulative attendee summary.
    Summarize { text: String },
}

#[derive(Debug, Clone)]
struct Session {
    message_id: String,
    started_at: DateTime<Utc>,
    /// User id → label, as last posted.
    present: BTreeMap<String, String>,
    /// Everyone seen since the session started.
    seen: BTreeMap<String, String>,
    historical_marked: bool,
}

#[derive(Debug, Clone)]
pub struct AttendanceTracker {
    label: String,
    session: Option<Session>,
}

impl AttendanceTracker {
    /// `label` names the watched channel in posted texts.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            session: None,
        }
    }

    pub fn phase(&self) -> AttendancePhase {
        match &self.session {
            None => AttendancePhase::Idle,
            Some(session) if session.historical_marked => AttendancePhase::Ending,
            Some(_) => AttendancePhase::Active,
        }
    }

    /// Id of the live roster message, if a session is running.
    pub fn message_id(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.message_id.as_str())
    }

    /// Steps needed to bring the posted state in line with `users`.
    ///
    /// The gateway's own account never counts as attendance. An unchanged
    /// member set plans nothing, regardless of ordering or label changes.
    pub fn plan(&self, users: &[User], now: DateTime<Utc>) -> Vec<AttendanceStep> {
        let roster = roster(users);

        let Some(session) = &self.session else {
            if roster.is_empty() {
                return Vec::new();
            }
            return vec![self.start(&roster)];
        };

        if session.historical_marked {
            let mut steps = vec![self.summarize(session, now)];
            if !roster.is_empty() {
                steps.push(self.start(&roster));
            }
            return steps;
        }

        if roster.is_empty() {
            return vec![
                AttendanceStep::MarkHistorical {
                    message_id: session.message_id.clone(),
                    text: format!(
                        "Was online in {}: {}",
                        self.label,
                        labels(&session.seen)
                    ),
                },
                self.summarize(session, now),
            ];
        }

        if roster.keys().eq(session.present.keys()) {
            return Vec::new();
        }

        vec![AttendanceStep::Update {
            message_id: session.message_id.clone(),
            text: self.roster_text(&roster),
        }]
    }

    /// Record that `step` was carried out. `posted_id` is the backend id
    /// returned for a `Start`; it is ignored for other steps.
    pub fn commit(
        &mut self,
        step: &AttendanceStep,
        users: &[User],
        posted_id: &str,
        now: DateTime<Utc>,
    ) {
        match step {
            AttendanceStep::Start { .. } => {
                let roster = roster(users);
                self.session = Some(Session {
                    message_id: posted_id.to_owned(),
                    started_at: now,
                    seen: roster.clone(),
                    present: roster,
                    historical_marked: false,
                });
            }
            AttendanceStep::Update { .. } => {
                if let Some(session) = &mut self.session {
                    let roster = roster(users);
                    session.seen.extend(roster.clone());
                    session.present = roster;
                }
            }
            AttendanceStep::MarkHistorical { .. } => {
                if let Some(session) = &mut self.session {
                    session.historical_marked = true;
                }
            }
            AttendanceStep::Summarize { .. } => self.session = None,
        }
    }

    fn start(&self, roster: &BTreeMap<String, String>) -> AttendanceStep {
        AttendanceStep::Start {
            text: self.roster_text(roster),
        }
    }

    fn summarize(&self, session: &Session, now: DateTime<Utc>) -> AttendanceStep {
        AttendanceStep::Summarize {
            text: format!(
                "Session in {} lasted {}. Attended by: {}",
                self.label,
                format_duration(now - session.started_at),
                labels(&session.seen)
            ),
        }
    }

    fn roster_text(&self, roster: &BTreeMap<String, String>) -> String {
        format!("Online in {}: {}", self.label, labels(roster))
    }
}

fn roster(users: &[User]) -> BTreeMap<String, String> {
    users
        .iter()
        .filter(|user| !user.is_self)
        .map(|user| (user.id.clone(), user.label().to_owned()))
        .collect()
}

fn labels(roster: &BTreeMap<String, String>) -> String {
    display_name_list(roster.values().map(String::as_str))
}

/// Compact human duration: `42s`, `5m 03s`, `2h 05m`. Negative spans read
/// as zero.
pub fn format_duration(span: TimeDelta) -> String {
    let total = span.num_seconds().max(0);
    let (hours, minutes, seconds) = (total / 3_600, (total % 3_600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use backend_core::Presence;

    use super::*;

    fn user(id: &str, name: &str) -> User {
        User {
            id: id.to_owned(),
            provider: "mumble".to_owned(),
            alias: name.to_lowercase(),
            display_name: name.to_owned(),
            presence: Presence::Online,
            is_self: false,
        }
    }

    fn at(seconds: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + seconds, 0).expect("timestamp")
    }

    /// Plan, then commit every step as if it succeeded.
    fn drive(
        tracker: &mut AttendanceTracker,
        users: &[User],
        now: DateTime<Utc>,
    ) -> Vec<AttendanceStep> {
        let steps = tracker.plan(users, now);
        for step in &steps {
            tracker.commit(step, users, "$post", now);
        }
        steps
    }

    #[test]
    fn walks_a_full_session() {
        let mut tracker = AttendanceTracker::new("Lobby");
        let alice = user("1", "Alice");
        let bob = user("2", "Bob");

        assert!(drive(&mut tracker, &[], at(0)).is_empty());
        assert_eq!(tracker.phase(), AttendancePhase::Idle);

        assert_eq!(
            drive(&mut tracker, &[alice.clone()], at(0)),
            vec![AttendanceStep::Start {
                text: "Online in Lobby: Alice".to_owned()
            }]
        );
        assert_eq!(tracker.phase(), AttendancePhase::Active);
        assert_eq!(tracker.message_id(), Some("$post"));

        assert_eq!(
            drive(&mut tracker, &[bob.clone(), alice.clone()], at(60)),
            vec![AttendanceStep::Update {
                message_id: "$post".to_owned(),
                text: "Online in Lobby: Alice, Bob".to_owned()
            }]
        );

        assert_eq!(
            drive(&mut tracker, &[alice], at(90)).len(),
            1,
            "bob leaving is an update"
        );

        assert_eq!(
            drive(&mut tracker, &[], at(3_725)),
            vec![
                AttendanceStep::MarkHistorical {
                    message_id: "$post".to_owned(),
                    text: "Was online in Lobby: Alice, Bob".to_owned()
                },
                AttendanceStep::Summarize {
                    text: "Session in Lobby lasted 1h 02m. Attended by: Alice, Bob".to_owned()
                },
            ]
        );
        assert_eq!(tracker.phase(), AttendancePhase::Idle);
        assert_eq!(tracker.message_id(), None);
    }

    #[test]
    fn unchanged_member_set_plans_nothing() {
        let mut tracker = AttendanceTracker::new("Lobby");
        let alice = user("1", "Alice");
        let bob = user("2", "Bob");
        drive(&mut tracker, &[alice.clone(), bob.clone()], at(0));

        assert!(tracker.plan(&[bob.clone(), alice.clone()], at(5)).is_empty());

        let mut renamed = alice;
        renamed.display_name = "Alicia".to_owned();
        assert!(tracker.plan(&[renamed, bob], at(5)).is_empty());
    }

    #[test]
    fn own_account_is_not_attendance() {
        let mut tracker = AttendanceTracker::new("Lobby");
        let mut gateway = user("9", "gateway");
        gateway.is_self = true;

        assert!(drive(&mut tracker, &[gateway.clone()], at(0)).is_empty());
        assert_eq!(
            drive(&mut tracker, &[gateway, user("1", "Alice")], at(0)),
            vec![AttendanceStep::Start {
                text: "Online in Lobby: Alice".to_owned()
            }]
        );
    }

    #[test]
    fn uncommitted_steps_are_planned_again() {
        let mut tracker = AttendanceTracker::new("Lobby");
        let alice = [user("1", "Alice")];

        let first = tracker.plan(&alice, at(0));
        assert_eq!(tracker.plan(&alice, at(1)), first);
        drive(&mut tracker, &alice, at(0));

        let ending = tracker.plan(&[], at(30));
        tracker.commit(&ending[0], &[], "", at(30));
        assert_eq!(tracker.phase(), AttendancePhase::Ending);

        assert_eq!(
            tracker.plan(&[], at(40)),
            vec![AttendanceStep::Summarize {
                text: "Session in Lobby lasted 40s. Attended by: Alice".to_owned()
            }]
        );
    }

    #[test]
    fn returning_members_after_a_half_ended_session_start_fresh() {
        let mut tracker = AttendanceTracker::new("Lobby");
        let alice = [user("1", "Alice")];
        drive(&mut tracker, &alice, at(0));
        let ending = tracker.plan(&[], at(10));
        tracker.commit(&ending[0], &[], "", at(10));

        let steps = drive(&mut tracker, &alice, at(20));
        assert!(matches!(steps[0], AttendanceStep::Summarize { .. }));
        assert!(matches!(steps[1], AttendanceStep::Start { .. }));
        assert_eq!(tracker.phase(), AttendancePhase::Active);
    }

    #[test]
    fn formats_durations() {
        assert_eq!(format_duration(TimeDelta::seconds(42)), "42s");
        assert_eq!(format_duration(TimeDelta::seconds(303)), "5m 03s");
        assert_eq!(format_duration(TimeDelta::seconds(7_500)), "2h 05m");
        assert_eq!(format_duration(TimeDelta::seconds(-5)), "0s");
    }
}
