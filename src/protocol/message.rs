/// Wire values of the single-byte control frames.
pub mod control {
    pub const BATCH_ACCEPTED: u8 = 0x01;
    pub const BATCH_REJECTED: u8 = 0x00;

    pub const MORE_BATCHES: u8 = 0x01;
    pub const NO_MORE_BATCHES: u8 = 0x00;

    pub const READY_FOR_DRAW: u8 = 0x01;
}

/// One bet as an agency submitted it.
///
/// `document` holds the decimal rendering of the 4-byte wire field,
/// `birthdate` is exactly 10 ASCII bytes shaped "YYYY-MM-DD".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bet {
    pub agency: u32,
    pub first_name: String,
    pub last_name: String,
    pub document: String,
    pub birthdate: String,
    pub number: u32,
}

/// Continuation byte the client sends after every acknowledged batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    More,
    Done,
}

/// Readiness byte that follows the last batch.
///
/// unknown values are data, not protocol errors; they just don't count
/// toward the draw barrier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToClient {
    BatchAck { accepted: bool },
    Winners(Vec<Bet>),
}

impl ToClient {
    pub fn accepted() -> Self {
        Self::BatchAck { accepted: true }
    }

    pub fn rejected() -> Self {
        Self::BatchAck { accepted: false }
    }
}
