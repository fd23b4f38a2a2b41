pub mod deserializer;
pub mod message;
pub mod serializer;

/// Longest declared length (in bytes) a name field may carry.
pub const MAX_TEXT_LEN: u32 = 255;

/// Most bets a single batch may declare.
pub const MAX_BATCH_BETS: u32 = 8192;

/// Birthdates travel as exactly this many ASCII bytes ("YYYY-MM-DD").
pub const BIRTHDATE_LEN: usize = 10;
