//! Bidirectional relay between two duplex streams.
//!
//! Each direction runs in its own task. Whichever direction finishes first
//! (EOF or error) shuts down its write side and cancels the other, so the two
//! endpoints always close together.

use crate::error::{TunnelError, TunnelResult};
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::debug;

const COPY_BUF_SIZE: usize = 16 * 1024;

/// Upper bound on flushing a write side that the peer stopped draining.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Bytes moved in each direction by one [`splice`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Copy bytes between `a` and `b` until either side ends.
///
/// Returns after both directions have stopped and every half has been
/// dropped. An I/O error in either direction is reported as
/// [`TunnelError::Relay`] once both tasks have been joined.
pub async fn splice<A, B>(a: A, b: B) -> TunnelResult<RelayStats>
where
    A: AsyncRead + AsyncWrite + Send + 'static,
    B: AsyncRead + AsyncWrite + Send + 'static,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let cancel = CancellationToken::new();

    let forward = tokio::spawn(pump(a_read, b_write, cancel.clone(), "a->b"));
    let backward = tokio::spawn(pump(b_read, a_write, cancel.clone(), "b->a"));

    let (forward, backward) = tokio::join!(forward, backward);
    let a_to_b = joined(forward)?;
    let b_to_a = joined(backward)?;

    Ok(RelayStats { a_to_b, b_to_a })
}

fn joined(res: Result<io::Result<u64>, tokio::task::JoinError>) -> TunnelResult<u64> {
    match res {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(TunnelError::Relay(e)),
        Err(e) => Err(TunnelError::Relay(io::Error::other(e))),
    }
}

async fn pump<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    cancel: CancellationToken,
    direction: &'static str,
) -> io::Result<u64>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let result = copy_until_cancelled(&mut reader, &mut writer, &cancel).await;
    match &result {
        Ok(n) => debug!(direction, bytes = n, "relay direction finished"),
        Err(e) => debug!(direction, error = %e, "relay direction failed"),
    }

    let _ = tokio::time::timeout(SHUTDOWN_GRACE, writer.shutdown()).await;
    cancel.cancel();
    result
}

async fn copy_until_cancelled<R, W>(
    reader: &mut ReadHalf<R>,
    writer: &mut WriteHalf<W>,
    cancel: &CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(total),
            res = reader.read(&mut buf) => res?,
        };
        if n == 0 {
            return Ok(total);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(total),
            res = writer.write_all(&buf[..n]) => res?,
        }
        total += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use tokio::io::duplex;

    fn random_payload(len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        rand::thread_rng().fill_bytes(&mut buf);
        buf
    }

    #[tokio::test]
    async fn relays_both_directions_byte_exact() {
        let (mut a_outer, a_inner) = duplex(1024);
        let (mut b_outer, b_inner) = duplex(1024);
        let relay = tokio::spawn(splice(a_inner, b_inner));

        let up = random_payload(100_000);
        let down = random_payload(37_123);

        let mut got_up = vec![0u8; up.len()];
        let (w, r) = tokio::join!(a_outer.write_all(&up), b_outer.read_exact(&mut got_up));
        w.unwrap();
        r.unwrap();
        assert_eq!(got_up, up);

        let mut got_down = vec![0u8; down.len()];
        let (w, r) = tokio::join!(b_outer.write_all(&down), a_outer.read_exact(&mut got_down));
        w.unwrap();
        r.unwrap();
        assert_eq!(got_down, down);

        drop(a_outer);
        let stats = tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("splice did not return")
            .unwrap()
            .unwrap();
        assert_eq!(
            stats,
            RelayStats {
                a_to_b: up.len() as u64,
                b_to_a: down.len() as u64,
            }
        );
    }

    #[tokio::test]
    async fn empty_stream_closes_cleanly() {
        let (mut a_outer, a_inner) = duplex(64);
        let (mut b_outer, b_inner) = duplex(64);
        let relay = tokio::spawn(splice(a_inner, b_inner));

        a_outer.shutdown().await.unwrap();

        let mut rest = Vec::new();
        b_outer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let stats = tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("splice did not return")
            .unwrap()
            .unwrap();
        assert_eq!(stats, RelayStats::default());
    }

    #[tokio::test]
    async fn closing_one_end_closes_the_other() {
        let (a_outer, a_inner) = duplex(64);
        let (mut b_outer, b_inner) = duplex(64);
        let relay = tokio::spawn(splice(a_inner, b_inner));

        drop(a_outer);

        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), b_outer.read(&mut buf))
            .await
            .expect("far end was not closed")
            .unwrap();
        assert_eq!(n, 0);

        tokio::time::timeout(Duration::from_secs(5), relay)
            .await
            .expect("splice did not return")
            .unwrap()
            .unwrap();
    }
}
