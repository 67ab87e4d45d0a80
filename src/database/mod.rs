//! Database Module - SQLite Anrufprotokoll

mod call_log;

pub use call_log::{CallLog, CallRating, CallRecord, DatabaseError};
