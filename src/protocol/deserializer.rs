use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use super::{
    message::{control, Bet, Continuation, Readiness},
    BIRTHDATE_LEN, MAX_BATCH_BETS, MAX_TEXT_LEN,
};

#[async_trait]
pub trait Deserialize: Sized {
    type Error;

    // Deserialize a structure from a reader
    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Self, Self::Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum DeserializeError {
    #[error("{0}")]
    Utf(#[from] std::string::FromUtf8Error),

    #[error("{0}")]
    Io(#[from] tokio::io::Error),

    #[error("Declared text length is too long: {0}")]
    TextTooLong(u32),

    #[error("Declared batch size is too large: {0}")]
    BatchTooLarge(u32),

    #[error("Birthdate is not shaped YYYY-MM-DD")]
    InvalidBirthdate,

    #[error("Unknown continuation byte: {0:#04x}")]
    InvalidContinuation(u8),
}

#[async_trait]
impl Deserialize for String {
    type Error = DeserializeError;

    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Self, Self::Error> {
        // check the declared length before allocating anything
        let length = reader.read_u32().await?;
        if length > MAX_TEXT_LEN {
            return Err(DeserializeError::TextTooLong(length));
        }

        let mut raw = vec![0u8; length as usize];
        reader.read_exact(&mut raw).await?;

        let text = String::from_utf8(raw)?;

        Ok(text)
    }
}

#[async_trait]
impl Deserialize for Bet {
    type Error = DeserializeError;

    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Self, Self::Error> {
        let agency = reader.read_u32().await?;
        let first_name = String::deserialize(reader).await?;
        let last_name = String::deserialize(reader).await?;
        let document = reader.read_u32().await?.to_string();

        let mut raw_birthdate = [0u8; BIRTHDATE_LEN];
        reader.read_exact(&mut raw_birthdate).await?;
        if !is_valid_birthdate(&raw_birthdate) {
            return Err(DeserializeError::InvalidBirthdate);
        }
        let birthdate = String::from_utf8(raw_birthdate.to_vec())?;

        let number = reader.read_u32().await?;

        Ok(Self {
            agency,
            first_name,
            last_name,
            document,
            birthdate,
            number,
        })
    }
}

// A whole batch: count followed by that many bet records
#[async_trait]
impl Deserialize for Vec<Bet> {
    type Error = DeserializeError;

    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Self, Self::Error> {
        let count = reader.read_u32().await?;
        if count > MAX_BATCH_BETS {
            return Err(DeserializeError::BatchTooLarge(count));
        }

        let mut bets = Vec::with_capacity(count as usize);
        for _ in 0..count {
            bets.push(Bet::deserialize(reader).await?);
        }

        Ok(bets)
    }
}

#[async_trait]
impl Deserialize for Continuation {
    type Error = DeserializeError;

    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Self, Self::Error> {
        match reader.read_u8().await? {
            control::MORE_BATCHES => Ok(Self::More),
            control::NO_MORE_BATCHES => Ok(Self::Done),
            unknown => Err(DeserializeError::InvalidContinuation(unknown)),
        }
    }
}

#[async_trait]
impl Deserialize for Readiness {
    type Error = DeserializeError;

    async fn deserialize<R: AsyncReadExt + Unpin + Send>(
        reader: &mut R,
    ) -> Result<Self, Self::Error> {
        match reader.read_u8().await? {
            control::READY_FOR_DRAW => Ok(Self::Ready),
            unknown => Ok(Self::NotReady(unknown)),
        }
    }
}

fn is_valid_birthdate(raw: &[u8; BIRTHDATE_LEN]) -> bool {
    raw.iter().enumerate().all(|(idx, byte)| match idx {
        4 | 7 => *byte == b'-',
        _ => byte.is_ascii_digit(),
    })
}
