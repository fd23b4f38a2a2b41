use std::{fmt::Debug, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};

use crate::protocol::{
    deserializer::{Deserialize, DeserializeError},
    message::Bet,
    serializer::{Serialize, SerializeError},
};

pub type SharedStore = Arc<dyn BetStore>;

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("{0}")]
    Io(#[from] tokio::io::Error),

    #[error("{0}")]
    Encode(#[from] SerializeError),

    #[error("{0}")]
    Decode(#[from] DeserializeError),
}

/// The narrow persistence surface the rest of the server goes through.
#[async_trait]
pub trait BetStore: Send + Sync + Debug {
    /// Appends a whole batch; either every bet lands or none do.
    async fn append(&self, bets: &[Bet]) -> Result<(), StoreError>;

    /// Returns every persisted bet in append order.
    async fn all(&self) -> Result<Vec<Bet>, StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    bets: Mutex<Vec<Bet>>,
}

#[async_trait]
impl BetStore for MemoryStore {
    async fn append(&self, bets: &[Bet]) -> Result<(), StoreError> {
        self.bets.lock().await.extend_from_slice(bets);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<Bet>, StoreError> {
        Ok(self.bets.lock().await.clone())
    }
}

/// Append-only log of wire-encoded bet records.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }
}

#[async_trait]
impl BetStore for FileStore {
    async fn append(&self, bets: &[Bet]) -> Result<(), StoreError> {
        // encode the whole batch up front so a bad record
        // can't leave half a batch behind in the log
        let mut record = Vec::new();
        for bet in bets {
            bet.serialize(&mut record).await?;
        }

        let mut file = self.file.lock().await;
        file.write_all(&record).await?;
        file.flush().await?;
        file.sync_data().await?;

        Ok(())
    }

    async fn all(&self) -> Result<Vec<Bet>, StoreError> {
        // hold the append lock so the snapshot can't catch a torn batch
        let _file = self.file.lock().await;
        let raw = tokio::fs::read(&self.path).await?;

        let mut reader = raw.as_slice();
        let mut bets = Vec::new();
        while !reader.is_empty() {
            bets.push(Bet::deserialize(&mut reader).await?);
        }

        Ok(bets)
    }
}

#[cfg(test)]
mod tests {
    use super::{BetStore, FileStore, MemoryStore};
    use crate::protocol::message::Bet;

    fn bet(agency: u32, document: &str, number: u32) -> Bet {
        Bet {
            agency,
            first_name: "Ana".into(),
            last_name: "Paz".into(),
            document: document.into(),
            birthdate: "1999-03-17".into(),
            number,
        }
    }

    #[tokio::test]
    async fn memory_store_preserves_append_order() {
        let store = MemoryStore::default();

        store
            .append(&[bet(1, "1111", 100), bet(1, "2222", 200)])
            .await
            .unwrap();
        store.append(&[bet(2, "3333", 300)]).await.unwrap();

        let all = store.all().await.unwrap();
        assert_eq!(
            all,
            vec![bet(1, "1111", 100), bet(1, "2222", 200), bet(2, "3333", 300)]
        );
    }

    #[tokio::test]
    async fn file_store_round_trips_batches() {
        let tempfile = async_tempfile::TempFile::new().await.unwrap();
        let store = FileStore::open(tempfile.file_path().clone()).await.unwrap();

        assert!(store.all().await.unwrap().is_empty());

        store
            .append(&[bet(1, "1111", 100), bet(1, "2222", 200)])
            .await
            .unwrap();
        store.append(&[bet(2, "3333", 300)]).await.unwrap();

        let all = store.all().await.unwrap();
        assert_eq!(
            all,
            vec![bet(1, "1111", 100), bet(1, "2222", 200), bet(2, "3333", 300)]
        );
    }
}
