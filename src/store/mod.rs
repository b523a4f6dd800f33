pub mod atomic;
pub mod daylog;

pub use daylog::{DayLog, DayLogStore, ParticipantDayRecord, Session, StoreError, day_key};
