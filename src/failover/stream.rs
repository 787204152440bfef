//! Framed exchange of the failover message over one bidirectional stream.
//!
//! Each exchange writes one frame: a big-endian `u32` length followed by the
//! CBOR encoding of the whole [`FailoverMessage`]. CBOR maps are keyed by
//! field name, so the value survives repeated encode/decode rounds on the
//! same stream with field identity intact, and the tower-file payload rides
//! along without any schema renegotiation. The exchange is strictly
//! half-duplex: a side may encode only after decoding the peer's previous
//! frame.

use {
    super::message::{CreditSample, FailoverMessage},
    crate::{
        cluster::{epoch_credit_delta, ClusterObserver},
        error::{Error, Result},
        style, ProgressBar,
    },
    log::{debug, error},
    solana_pubkey::Pubkey,
    std::time::{Duration, SystemTime},
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};

/// Upper bound on one frame; well above any realistic tower file.
const MAX_FRAME_BYTES: u32 = 256 * 1024 * 1024;

pub struct FailoverStream<W, R> {
    writer: W,
    reader: R,
    pub message: FailoverMessage,
}

impl<W, R> FailoverStream<W, R>
where
    W: AsyncWrite + Unpin + Send,
    R: AsyncRead + Unpin + Send,
{
    pub fn new(writer: W, reader: R) -> Self {
        Self {
            writer,
            reader,
            message: FailoverMessage::default(),
        }
    }

    /// Write the one-byte message type that opens the stream.
    pub async fn write_message_type(&mut self, message_type: u8) -> Result<()> {
        self.writer
            .write_all(&[message_type])
            .await
            .map_err(|err| Error::Protocol(format!("failed to send message type: {err}")))
    }

    /// Read the one-byte message type that opens the stream.
    pub async fn read_message_type(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.reader
            .read_exact(&mut buf)
            .await
            .map_err(|err| Error::Protocol(format!("failed to read message type: {err}")))?;
        Ok(buf[0])
    }

    /// Encode the current message as one frame.
    pub async fn encode(&mut self) -> Result<()> {
        let mut payload = Vec::new();
        ciborium::ser::into_writer(&self.message, &mut payload)
            .map_err(|err| Error::Protocol(format!("failed to encode failover message: {err}")))?;

        let len = u32::try_from(payload.len())
            .map_err(|_| Error::Protocol("failover message too large to frame".to_string()))?;
        self.writer
            .write_all(&len.to_be_bytes())
            .await
            .map_err(|err| Error::Protocol(format!("failed to write frame length: {err}")))?;
        self.writer
            .write_all(&payload)
            .await
            .map_err(|err| Error::Protocol(format!("failed to write frame: {err}")))?;
        self.writer
            .flush()
            .await
            .map_err(|err| Error::Protocol(format!("failed to flush frame: {err}")))?;

        debug!("encoded failover message frame ({len} bytes)");
        Ok(())
    }

    /// Decode the peer's next frame into the current message.
    pub async fn decode(&mut self) -> Result<()> {
        let mut len_buf = [0u8; 4];
        self.reader
            .read_exact(&mut len_buf)
            .await
            .map_err(|err| Error::Protocol(format!("failed to read frame length: {err}")))?;
        let len = u32::from_be_bytes(len_buf);
        if len > MAX_FRAME_BYTES {
            return Err(Error::Protocol(format!(
                "frame of {len} bytes exceeds limit of {MAX_FRAME_BYTES}"
            )));
        }

        let mut payload = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut payload)
            .await
            .map_err(|err| Error::Protocol(format!("failed to read frame: {err}")))?;

        self.message = ciborium::de::from_reader(payload.as_slice())
            .map_err(|err| Error::Protocol(format!("failed to decode failover message: {err}")))?;

        debug!("decoded failover message frame ({len} bytes)");
        Ok(())
    }

    fn active_identity_pubkey(&self) -> Result<Pubkey> {
        self.message
            .active_node_info
            .identities
            .active
            .pubkey
            .parse()
            .map_err(|err| {
                Error::Protocol(format!(
                    "invalid active identity pubkey {}: {err}",
                    self.message.active_node_info.identities.active.pubkey
                ))
            })
    }

    /// Take one credit-rank sample for the active identity and append it.
    pub async fn pull_active_identity_credit_sample(
        &mut self,
        observer: &ClusterObserver,
    ) -> Result<()> {
        let identity_pubkey = self.active_identity_pubkey()?;
        let (account, rank) = observer.credit_ranked_vote_account(&identity_pubkey).await?;

        let sample = CreditSample {
            vote_account_pubkey: account.vote_pubkey.clone(),
            vote_rank: rank,
            credits: epoch_credit_delta(&account),
            timestamp: SystemTime::now(),
        };

        self.message
            .credit_samples
            .entry(identity_pubkey.to_string())
            .or_default()
            .push(sample);
        Ok(())
    }

    /// Take `count` samples spaced `interval` apart, warning whenever two
    /// consecutive samples fail to show a credit increase.
    pub async fn pull_active_identity_credit_samples(
        &mut self,
        observer: &ClusterObserver,
        count: usize,
        interval: Duration,
        progress: &ProgressBar,
    ) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        if count == 1 {
            return self.pull_active_identity_credit_sample(observer).await;
        }

        let identity_pubkey = self.active_identity_pubkey()?.to_string();
        for taken in 1..=count {
            progress.set_message(format!("Pulling vote credit sample {taken} of {count}..."));
            if let Err(err) = self.pull_active_identity_credit_sample(observer).await {
                error!("failed to pull vote credits sample: {err}");
                continue;
            }

            let samples = &self.message.credit_samples[&identity_pubkey];
            if let [.., previous, latest] = samples.as_slice() {
                if latest.credits <= previous.credits {
                    progress.println(style::render_warning(&format!(
                        "Vote credits are not increasing between samples {} and {} - this is not good",
                        taken - 1,
                        taken,
                    )));
                }
            }
            let latest = samples.last().expect("sample was just appended");
            progress.set_message(format!(
                "Pulled vote credit sample {taken} of {count} - credits: {}, rank: {}",
                latest.credits, latest.vote_rank
            ));

            if taken < count {
                tokio::time::sleep(interval).await;
            }
        }
        debug!("pulled {count} vote credit samples");
        Ok(())
    }

    /// Rank change across the collected samples, inverted so improvement is
    /// positive (rank 1 is best). Returns `(change, first, last)`.
    pub fn credit_rank_change(&self) -> Result<(i64, usize, usize)> {
        let identity_pubkey = self.active_identity_pubkey()?.to_string();
        let samples = self
            .message
            .credit_samples
            .get(&identity_pubkey)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let [first, .., last] = samples else {
            return Err(Error::Protocol(
                "not enough vote credit samples to calculate rank change".to_string(),
            ));
        };
        let change = -(last.vote_rank as i64 - first.vote_rank as i64);
        Ok((change, first.vote_rank, last.vote_rank))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::failover::message::{NodeIdentities, NodeIdentity, NodeInfo},
        tokio::io::{duplex, split},
    };

    fn paired_streams() -> (
        FailoverStream<impl AsyncWrite + Unpin + Send, impl AsyncRead + Unpin + Send>,
        FailoverStream<impl AsyncWrite + Unpin + Send, impl AsyncRead + Unpin + Send>,
    ) {
        let (a, b) = duplex(1024 * 1024);
        let (a_read, a_write) = split(a);
        let (b_read, b_write) = split(b);
        (
            FailoverStream::new(a_write, a_read),
            FailoverStream::new(b_write, b_read),
        )
    }

    #[tokio::test]
    async fn test_message_type_round_trip() {
        let (mut client, mut server) = paired_streams();
        client
            .write_message_type(crate::failover::MESSAGE_TYPE_FAILOVER_INITIATE_REQUEST)
            .await
            .unwrap();
        assert_eq!(
            server.read_message_type().await.unwrap(),
            crate::failover::MESSAGE_TYPE_FAILOVER_INITIATE_REQUEST
        );
    }

    #[tokio::test]
    async fn test_encode_decode_is_identity() {
        let (mut client, mut server) = paired_streams();

        client.message.can_proceed = true;
        client.message.is_dry_run = true;
        client.message.failover_start_slot = 12_345;
        client.message.active_node_info = NodeInfo {
            public_ip: "10.0.0.1".to_string(),
            hostname: "node-a".to_string(),
            identities: NodeIdentities {
                active: NodeIdentity {
                    key_file: "/keys/active.json".to_string(),
                    pubkey: Pubkey::new_unique().to_string(),
                },
                passive: NodeIdentity {
                    key_file: "/keys/passive.json".to_string(),
                    pubkey: Pubkey::new_unique().to_string(),
                },
            },
            tower_file: "/ledger/tower.bin".to_string(),
            tower_file_bytes: vec![0xDE, 0xAD, 0xBE, 0xEF],
            tower_file_hash: "xxh3:abcd".to_string(),
            set_identity_command: "agave-validator set-identity passive.json".to_string(),
            client_version: "2.2.1".to_string(),
            app_version: "1.4.2".to_string(),
        };
        client.message.active_set_identity_start = Some(SystemTime::UNIX_EPOCH);
        client
            .message
            .credit_samples
            .entry("identity".to_string())
            .or_default()
            .push(CreditSample {
                vote_account_pubkey: "vote".to_string(),
                vote_rank: 7,
                credits: 420,
                timestamp: SystemTime::UNIX_EPOCH,
            });

        client.encode().await.unwrap();
        server.decode().await.unwrap();
        assert_eq!(server.message, client.message);
    }

    #[tokio::test]
    async fn test_successive_exchanges_preserve_mutations() {
        let (mut client, mut server) = paired_streams();

        client.message.active_node_info.hostname = "node-a".to_string();
        client.encode().await.unwrap();
        server.decode().await.unwrap();

        server.message.passive_node_info.hostname = "node-b".to_string();
        server.message.can_proceed = true;
        server.encode().await.unwrap();
        client.decode().await.unwrap();

        // the client's earlier contribution survived the round trip
        assert_eq!(client.message.active_node_info.hostname, "node-a");
        assert_eq!(client.message.passive_node_info.hostname, "node-b");
        assert!(client.message.can_proceed);
    }

    #[tokio::test]
    async fn test_decode_rejects_oversized_frame() {
        let (mut a, b) = duplex(64);
        let huge = (MAX_FRAME_BYTES + 1).to_be_bytes();
        tokio::io::AsyncWriteExt::write_all(&mut a, &huge).await.unwrap();

        let (b_read, b_write) = split(b);
        let mut stream = FailoverStream::new(b_write, b_read);
        let err = stream.decode().await.unwrap_err();
        assert!(err.to_string().contains("exceeds limit"));
    }

    #[tokio::test]
    async fn test_credit_rank_change_requires_two_samples() {
        let (mut client, _server) = paired_streams();
        let pubkey = Pubkey::new_unique();
        client.message.active_node_info.identities.active.pubkey = pubkey.to_string();
        assert!(client.credit_rank_change().is_err());

        let samples = client
            .message
            .credit_samples
            .entry(pubkey.to_string())
            .or_default();
        samples.push(CreditSample {
            vote_account_pubkey: "vote".to_string(),
            vote_rank: 20,
            credits: 100,
            timestamp: SystemTime::UNIX_EPOCH,
        });
        samples.push(CreditSample {
            vote_account_pubkey: "vote".to_string(),
            vote_rank: 14,
            credits: 220,
            timestamp: SystemTime::UNIX_EPOCH + Duration::from_secs(5),
        });

        // moving from rank 20 to rank 14 is an improvement of 6
        let (change, first, last) = client.credit_rank_change().unwrap();
        assert_eq!((change, first, last), (6, 20, 14));
    }
}
