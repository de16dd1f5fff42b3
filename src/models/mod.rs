// Models module - Database entities and guild snapshots

pub mod guild;
pub mod unverify_record;

pub use guild::{ChannelAccess, MemberSnapshot, Role};
pub use unverify_record::{CreateUnverifyData, UnverifyRecord, UnverifyStatus};
