use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter},
    net::TcpStream,
};

use crate::{
    protocol::{
        deserializer::{Deserialize, DeserializeError},
        message::{Bet, Continuation, Readiness, ToClient},
        serializer::Serialize,
    },
    SharedState,
};

pub async fn handle(mut connection: TcpStream, state: SharedState) -> anyhow::Result<()> {
    let (reader, writer) = connection.split();
    let mut reader = BufReader::new(reader);
    let mut writer = BufWriter::new(writer);

    // the greeting names the agency; a peer that goes away before
    // sending it is a clean disconnect, not a protocol failure
    let agency = match reader.read_u32().await {
        Ok(agency) => agency,
        Err(_) => return Ok(()),
    };
    tracing::info!(agency, "agency connected");

    receive_batches(&mut reader, &mut writer, &state, agency).await?;

    match Readiness::deserialize(&mut reader).await? {
        Readiness::Ready => {}
        Readiness::NotReady(byte) => {
            tracing::info!(agency, byte, "agency declined the draw, closing");
            return Ok(());
        }
    }

    state.lottery.report_ready(agency).await?;
    tracing::info!(agency, "agency is ready for the draw");

    match deliver_winners(&mut writer, &state, agency).await {
        Ok(winner_count) => {
            state.lottery.ack_consumed().await?;
            tracing::info!(agency, winner_count, "winners delivered, closing");
            Ok(())
        }
        Err(err) => {
            // the barrier must not keep counting an agency that died on us
            if let Err(abort_err) = state.lottery.abort_ready(agency).await {
                tracing::warn!(agency, error = %abort_err, "could not withdraw agency from the draw");
            }
            Err(err)
        }
    }
}

// Store-then-acknowledge loop: a batch is only acked after it landed in the
// store. A failed batch gets a FAIL ack and the loop keeps going; a protocol
// violation gets a best-effort FAIL and kills the connection.
async fn receive_batches<R, W>(
    reader: &mut R,
    writer: &mut W,
    state: &SharedState,
    agency: u32,
) -> anyhow::Result<()>
where
    R: AsyncReadExt + Unpin + Send,
    W: AsyncWriteExt + Unpin + Send,
{
    let mut accepted: u64 = 0;
    let mut rejected: u64 = 0;

    loop {
        let bets = match Vec::<Bet>::deserialize(reader).await {
            Ok(bets) => bets,
            Err(DeserializeError::Io(err)) => {
                // peer went away mid-frame, there is nothing left to acknowledge
                return Err(err.into());
            }
            Err(violation) => {
                let _ = send_reply(writer, &ToClient::rejected()).await;
                return Err(violation.into());
            }
        };

        match state.store.append(&bets).await {
            Ok(()) => {
                accepted += bets.len() as u64;
                tracing::debug!(agency, bets = bets.len(), "batch persisted");
                send_reply(writer, &ToClient::accepted()).await?;
            }
            Err(err) => {
                rejected += bets.len() as u64;
                tracing::warn!(agency, error = %err, "failed to persist batch");
                send_reply(writer, &ToClient::rejected()).await?;
            }
        }

        match Continuation::deserialize(reader).await {
            Ok(Continuation::More) => {}
            Ok(Continuation::Done) => break,
            Err(DeserializeError::Io(err)) => return Err(err.into()),
            Err(violation) => {
                let _ = send_reply(writer, &ToClient::rejected()).await;
                return Err(violation.into());
            }
        }
    }

    tracing::info!(agency, accepted, rejected, "finished receiving batches");
    Ok(())
}

async fn deliver_winners<W>(
    writer: &mut W,
    state: &SharedState,
    agency: u32,
) -> anyhow::Result<usize>
where
    W: AsyncWriteExt + Unpin + Send,
{
    let winners = state.lottery.await_winners(agency).await?;
    let winner_count = winners.len();

    send_reply(writer, &ToClient::Winners(winners)).await?;

    Ok(winner_count)
}

async fn send_reply<W>(writer: &mut W, reply: &ToClient) -> anyhow::Result<()>
where
    W: AsyncWriteExt + Unpin + Send,
{
    reply.serialize(writer).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use tokio::{
        net::{TcpListener, TcpStream},
        time::timeout,
    };

    use super::*;
    use crate::{
        lottery::{self, FixedDraw},
        protocol::message::control,
        store::{MemoryStore, SharedStore},
    };

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

    async fn start_server(agencies: u32, winning_number: u32) -> (SocketAddr, SharedStore) {
        let store: SharedStore = Arc::new(MemoryStore::default());
        let lottery = lottery::System::start(
            store.clone(),
            Arc::new(FixedDraw(winning_number)),
            agencies,
        );
        let state = SharedState {
            lottery,
            store: store.clone(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((conn, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle(conn, state.clone()));
            }
        });

        (addr, store)
    }

    // Drives one agency through the whole protocol and returns the
    // (number, document) pairs the server announced as winners.
    async fn run_agency(
        addr: SocketAddr,
        agency: u32,
        bets: Vec<Bet>,
    ) -> anyhow::Result<Vec<(u32, u32)>> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.write_u32(agency).await?;

        let mut batch = Vec::new();
        batch.extend_from_slice(&(bets.len() as u32).to_be_bytes());
        for bet in &bets {
            bet.serialize(&mut batch).await?;
        }
        stream.write_all(&batch).await?;

        let ack = stream.read_u8().await?;
        anyhow::ensure!(ack == control::BATCH_ACCEPTED, "batch was rejected");

        stream.write_u8(control::NO_MORE_BATCHES).await?;
        stream.write_u8(control::READY_FOR_DRAW).await?;

        let count = stream.read_u32().await?;
        let mut winners = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let number = stream.read_u32().await?;
            let document = stream.read_u32().await?;
            winners.push((number, document));
        }

        Ok(winners)
    }

    #[tokio::test]
    async fn two_agencies_run_a_full_round() {
        let (addr, store) = start_server(2, 200).await;

        let agency_one = tokio::spawn(run_agency(
            addr,
            1,
            vec![bet(1, "30904465", 100), bet(1, "31547628", 200)],
        ));
        let agency_two = tokio::spawn(run_agency(addr, 2, vec![bet(2, "32985476", 300)]));

        let winners_one = timeout(Duration::from_secs(2), agency_one)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let winners_two = timeout(Duration::from_secs(2), agency_two)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(winners_one, vec![(200, 31547628)]);
        assert_eq!(winners_two, vec![]);
        assert_eq!(store.all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn oversized_name_length_kills_the_connection() {
        let (addr, store) = start_server(1, 200).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_u32(1).await.unwrap();

        // batch of one bet whose name claims to be 10MB long
        stream.write_u32(1).await.unwrap();
        stream.write_u32(1).await.unwrap();
        stream.write_u32(10_000_000).await.unwrap();

        let ack = stream.read_u8().await.unwrap();
        assert_eq!(ack, control::BATCH_REJECTED);

        // server must have hung up on us without storing anything
        let eof = stream.read_u8().await;
        assert!(eof.is_err());
        assert!(store.all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn declining_agency_is_closed_without_winners() {
        let (addr, store) = start_server(1, 200).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_u32(1).await.unwrap();

        let mut batch = Vec::new();
        batch.extend_from_slice(&1u32.to_be_bytes());
        bet(1, "1111", 100).serialize(&mut batch).await.unwrap();
        stream.write_all(&batch).await.unwrap();

        let ack = stream.read_u8().await.unwrap();
        assert_eq!(ack, control::BATCH_ACCEPTED);

        stream.write_u8(control::NO_MORE_BATCHES).await.unwrap();
        stream.write_u8(0x00).await.unwrap(); // not ready

        // no draw ran for us, the socket just closes
        let eof = timeout(Duration::from_secs(1), stream.read_u8()).await.unwrap();
        assert!(eof.is_err());
        assert_eq!(store.all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn multiple_batches_are_acknowledged_one_by_one() {
        let (addr, store) = start_server(1, 999).await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_u32(1).await.unwrap();

        for (document, number) in [("1111", 100), ("2222", 200)] {
            let mut batch = Vec::new();
            batch.extend_from_slice(&1u32.to_be_bytes());
            bet(1, document, number).serialize(&mut batch).await.unwrap();
            stream.write_all(&batch).await.unwrap();

            let ack = stream.read_u8().await.unwrap();
            assert_eq!(ack, control::BATCH_ACCEPTED);

            if document == "1111" {
                stream.write_u8(control::MORE_BATCHES).await.unwrap();
            }
        }

        stream.write_u8(control::NO_MORE_BATCHES).await.unwrap();
        stream.write_u8(control::READY_FOR_DRAW).await.unwrap();

        // sole agency, so the draw fires immediately; nobody guessed 999
        let count = stream.read_u32().await.unwrap();
        assert_eq!(count, 0);
        assert_eq!(
            store.all().await.unwrap(),
            vec![bet(1, "1111", 100), bet(1, "2222", 200)]
        );
    }
}
