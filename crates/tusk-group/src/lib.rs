//! The group layer of TuskDB.
//!
//! A [`Group`] is the root object of a database snapshot: it owns the
//! named tables of the file and the metadata tying them to the persistent
//! heap. It attaches to an on-disk image (or constructs an empty one),
//! presents a mutable namespace of tables, commits changes atomically,
//! replays transaction logs to follow snapshots produced by another
//! writer, and writes compacted copies of the live state.

mod advance;
mod group;
mod top;
mod upgrade;
mod verify;
mod writer;

pub use group::{Group, OpenMode, SizeAggregateControl, TableRef};
pub use top::{HistoryType, LEGAL_TOP_SIZES};
pub use upgrade::get_target_file_format_version_for_session;
pub use writer::{HistoryInfo, TableWriter};
