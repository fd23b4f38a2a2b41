use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{
    message::{control, Bet, ToClient},
    BIRTHDATE_LEN, MAX_TEXT_LEN,
};

#[async_trait]
pub trait Serialize: Sized {
    type Error;

    /// Serialize a structure into a writer
    async fn serialize<W: AsyncWriteExt + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), Self::Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum SerializeError {
    #[error("The input is too long!")]
    TooLong,

    #[error("{0}")]
    Io(#[from] tokio::io::Error),

    #[error("Document does not fit the 4-byte wire field: {0:?}")]
    InvalidDocument(String),

    #[error("Birthdate must be exactly 10 bytes")]
    InvalidBirthdate,
}

#[async_trait]
impl Serialize for &str {
    type Error = SerializeError;

    async fn serialize<W: AsyncWriteExt + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), Self::Error> {
        if self.len() > MAX_TEXT_LEN as usize {
            return Err(SerializeError::TooLong);
        }

        writer.write_u32(self.len() as u32).await?;
        writer.write_all(self.as_bytes()).await?;

        Ok(())
    }
}

// Bet records travel in batches and double as the file-store record format
#[async_trait]
impl Serialize for Bet {
    type Error = SerializeError;

    async fn serialize<W: AsyncWriteExt + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), Self::Error> {
        if self.birthdate.len() != BIRTHDATE_LEN {
            return Err(SerializeError::InvalidBirthdate);
        }

        writer.write_u32(self.agency).await?;
        self.first_name.as_str().serialize(writer).await?;
        self.last_name.as_str().serialize(writer).await?;
        writer.write_u32(wire_document(&self.document)?).await?;
        writer.write_all(self.birthdate.as_bytes()).await?;
        writer.write_u32(self.number).await?;

        Ok(())
    }
}

#[async_trait]
impl Serialize for ToClient {
    type Error = SerializeError;

    async fn serialize<W: AsyncWriteExt + Unpin + Send>(
        &self,
        writer: &mut W,
    ) -> Result<(), Self::Error> {
        match self {
            Self::BatchAck { accepted: true } => writer.write_u8(control::BATCH_ACCEPTED).await?,
            Self::BatchAck { accepted: false } => writer.write_u8(control::BATCH_REJECTED).await?,
            Self::Winners(winners) => {
                writer.write_u32(winners.len() as u32).await?;
                for bet in winners {
                    writer.write_u32(bet.number).await?;
                    writer.write_u32(wire_document(&bet.document)?).await?;
                }
            }
        };

        Ok(())
    }
}

fn wire_document(document: &str) -> Result<u32, SerializeError> {
    document
        .parse()
        .map_err(|_| SerializeError::InvalidDocument(document.to_owned()))
}
