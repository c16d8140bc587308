//! Upload lifecycle state machine
//!
//! ```text
//! Initial   --StartReceiving--> Receiving
//! Receiving --BeginSave-------> Saving
//! Saving    --EndSave---------> Receiving
//! Saving    --Complete--------> Finished
//! Receiving --Complete--------> Finished   (length declared equal to offset)
//! Initial   --Complete--------> Finished   (zero-length upload)
//! Initial|Receiving --Terminate--> Terminated
//! Initial|Receiving --Expire-----> Expired
//! ```
//!
//! Every state change on an [`UploadRecord`] goes through [`apply`].

use chrono::{DateTime, Utc};

use super::types::{UploadError, UploadRecord, UploadState};

/// Events that move a record between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    StartReceiving,
    BeginSave,
    EndSave,
    Complete,
    Terminate,
    Expire,
}

impl Trigger {
    fn action(&self) -> &'static str {
        match self {
            Self::StartReceiving | Self::BeginSave | Self::EndSave => "write to",
            Self::Complete => "complete",
            Self::Terminate => "terminate",
            Self::Expire => "expire",
        }
    }
}

use Trigger::*;
use UploadState::*;

const TRANSITIONS: &[(UploadState, Trigger, UploadState)] = &[
    (Initial, StartReceiving, Receiving),
    (Receiving, BeginSave, Saving),
    (Saving, EndSave, Receiving),
    (Saving, Complete, Finished),
    (Receiving, Complete, Finished),
    (Initial, Complete, Finished),
    (Initial, Terminate, Terminated),
    (Receiving, Terminate, Terminated),
    (Initial, Expire, Expired),
    (Receiving, Expire, Expired),
];

/// Look up the target state for `trigger` fired in `from`
pub fn next_state(from: UploadState, trigger: Trigger) -> Option<UploadState> {
    TRANSITIONS
        .iter()
        .find(|(state, t, _)| *state == from && *t == trigger)
        .map(|(_, _, to)| *to)
}

/// Fire `trigger` on `record`
///
/// Terminating or expiring a record with a write in flight is a
/// `Conflict`; any other illegal transition is `InvalidState`.
pub fn apply(record: &mut UploadRecord, trigger: Trigger) -> Result<UploadState, UploadError> {
    match next_state(record.state, trigger) {
        Some(to) => {
            tracing::trace!(
                upload_id = %record.id,
                from = %record.state,
                to = %to,
                ?trigger,
                "Upload state transition"
            );
            record.state = to;
            record.updated_at = Utc::now();
            Ok(to)
        }
        None if record.state == Saving && matches!(trigger, Terminate | Expire) => {
            Err(UploadError::Conflict(format!(
                "Unable to {} upload while in state \"{}\"",
                trigger.action(),
                record.state
            )))
        }
        None => Err(UploadError::InvalidState {
            id: record.id,
            state: record.state,
            action: trigger.action(),
        }),
    }
}

/// Guard for operations that mutate a record's content or length
pub fn ensure_writable(record: &UploadRecord, now: DateTime<Utc>) -> Result<(), UploadError> {
    if record.state.is_terminal() {
        return Err(UploadError::InvalidState {
            id: record.id,
            state: record.state,
            action: "write to",
        });
    }

    if record.is_expired(now) {
        return Err(UploadError::InvalidState {
            id: record.id,
            state: Expired,
            action: "write to",
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::metadata::UploadMetadata;
    use crate::upload::types::UploadLength;

    fn record_in(state: UploadState) -> UploadRecord {
        let mut record = UploadRecord::new(UploadLength::Known(10), UploadMetadata::new(), None, None);
        record.state = state;
        record
    }

    #[test]
    fn test_happy_path() {
        let mut record = record_in(Initial);

        assert_eq!(apply(&mut record, StartReceiving).unwrap(), Receiving);
        assert_eq!(apply(&mut record, BeginSave).unwrap(), Saving);
        assert_eq!(apply(&mut record, EndSave).unwrap(), Receiving);
        assert_eq!(apply(&mut record, BeginSave).unwrap(), Saving);
        assert_eq!(apply(&mut record, Complete).unwrap(), Finished);
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        let triggers = [StartReceiving, BeginSave, EndSave, Complete, Terminate, Expire];
        for state in [Finished, Expired, Terminated] {
            for trigger in triggers {
                assert_eq!(next_state(state, trigger), None, "{:?} {:?}", state, trigger);

                let mut record = record_in(state);
                assert!(matches!(
                    apply(&mut record, trigger),
                    Err(UploadError::InvalidState { .. })
                ));
                assert_eq!(record.state, state);
            }
        }
    }

    #[test]
    fn test_terminate_while_saving_conflicts() {
        let mut record = record_in(Saving);
        assert!(matches!(apply(&mut record, Terminate), Err(UploadError::Conflict(_))));
        assert!(matches!(apply(&mut record, Expire), Err(UploadError::Conflict(_))));
        assert_eq!(record.state, Saving);
    }

    #[test]
    fn test_terminate_and_expire_from_open_states() {
        for state in [Initial, Receiving] {
            let mut record = record_in(state);
            assert_eq!(apply(&mut record, Terminate).unwrap(), Terminated);

            let mut record = record_in(state);
            assert_eq!(apply(&mut record, Expire).unwrap(), Expired);
        }
    }

    #[test]
    fn test_cannot_save_from_initial() {
        let mut record = record_in(Initial);
        assert!(matches!(
            apply(&mut record, BeginSave),
            Err(UploadError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_ensure_writable() {
        let now = Utc::now();

        assert!(ensure_writable(&record_in(Receiving), now).is_ok());
        assert!(matches!(
            ensure_writable(&record_in(Finished), now),
            Err(UploadError::InvalidState { state: Finished, .. })
        ));

        let mut expired = record_in(Receiving);
        expired.expires_at = Some(now - chrono::Duration::minutes(1));
        assert!(matches!(
            ensure_writable(&expired, now),
            Err(UploadError::InvalidState { state: Expired, .. })
        ));
    }
}
