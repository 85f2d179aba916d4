//! Duplex byte pump
//!
//! Copies both directions concurrently. Whichever direction ends first, by
//! EOF or by error, stops the other one and both write halves are shut
//! down, so a silent peer never keeps the pump alive.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Size of the intermediate buffer used by each direction
pub const PUMP_BUFFER_SIZE: usize = 32 * 1024;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpStats {
    pub a_to_b: u64,
    pub b_to_a: u64,
}

/// Whether `err` is the expected shape of a cooperative shutdown race
pub fn is_benign(err: &io::Error) -> bool {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => true,
        _ => {
            let message = err.to_string().to_ascii_lowercase();
            message.contains("closed")
                || message.contains("final size")
                || message.contains("connection lost")
                || message.contains("reset by peer")
        }
    }
}

/// Pump bytes between `a` and `b` until both directions end
///
/// Benign teardown errors are swallowed; anything else is returned.
pub async fn copy<A, B>(a: A, b: B) -> io::Result<PumpStats>
where
    A: AsyncRead + AsyncWrite + Unpin + Send,
    B: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (a_read, a_write) = tokio::io::split(a);
    let (b_read, b_write) = tokio::io::split(b);
    let stop = CancellationToken::new();

    let (forward, backward) = tokio::join!(
        copy_half(a_read, b_write, &stop),
        copy_half(b_read, a_write, &stop),
    );

    let stats = PumpStats {
        a_to_b: forward.as_ref().map(|n| *n).unwrap_or(0),
        b_to_a: backward.as_ref().map(|n| *n).unwrap_or(0),
    };

    for result in [forward, backward] {
        match result {
            Err(e) if !is_benign(&e) => return Err(e),
            Err(e) => trace!("Pump ended with benign error: {}", e),
            Ok(_) => {}
        }
    }

    debug!(a_to_b = stats.a_to_b, b_to_a = stats.b_to_a, "Pump finished");
    Ok(stats)
}

async fn copy_half<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    stop: &CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; PUMP_BUFFER_SIZE];
    let mut total = 0u64;

    let result = loop {
        let n = tokio::select! {
            _ = stop.cancelled() => break Ok(total),
            read = reader.read(&mut buffer) => match read {
                Ok(0) => break Ok(total),
                Ok(n) => n,
                Err(e) => break Err(e),
            },
        };

        tokio::select! {
            _ = stop.cancelled() => break Ok(total),
            written = writer.write_all(&buffer[..n]) => {
                if let Err(e) = written {
                    break Err(e);
                }
            }
        }
        total += n as u64;
    };

    stop.cancel();
    let _ = writer.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    #[test]
    fn test_benign_classification() {
        assert!(is_benign(&io::Error::from(io::ErrorKind::BrokenPipe)));
        assert!(is_benign(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_benign(&io::Error::new(
            io::ErrorKind::Other,
            "connection lost"
        )));
        assert!(is_benign(&io::Error::new(
            io::ErrorKind::Other,
            "stream finished with final size mismatch"
        )));
        assert!(!is_benign(&io::Error::new(
            io::ErrorKind::PermissionDenied,
            "denied"
        )));
    }

    #[tokio::test]
    async fn test_copy_both_directions() {
        let (client, proxy_a) = duplex(1024);
        let (proxy_b, server) = duplex(1024);

        let pump = tokio::spawn(copy(proxy_a, proxy_b));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        client_write.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        server_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        server_write.write_all(b"response!").await.unwrap();
        let mut buf = [0u8; 9];
        client_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response!");

        client_write.shutdown().await.unwrap();
        let mut rest = Vec::new();
        server_read.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        server_write.shutdown().await.unwrap();

        let stats = timeout(Duration::from_secs(2), pump)
            .await
            .expect("pump did not finish")
            .unwrap()
            .unwrap();
        assert_eq!(stats, PumpStats { a_to_b: 7, b_to_a: 9 });
    }

    #[tokio::test]
    async fn test_eof_on_one_side_ends_pump() {
        let (client, proxy_a) = duplex(1024);
        let (proxy_b, server) = duplex(1024);
        let pump = tokio::spawn(copy(proxy_a, proxy_b));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, _server_write) = tokio::io::split(server);

        client_write.write_all(b"GET").await.unwrap();
        client_write.shutdown().await.unwrap();

        // Server stays open but never answers
        let mut request = Vec::new();
        timeout(Duration::from_secs(2), server_read.read_to_end(&mut request))
            .await
            .expect("server never saw EOF")
            .unwrap();
        assert_eq!(request, b"GET");

        let stats = timeout(Duration::from_secs(2), pump)
            .await
            .expect("pump still running after client EOF")
            .unwrap()
            .unwrap();
        assert_eq!(stats, PumpStats { a_to_b: 3, b_to_a: 0 });

        let mut reply = Vec::new();
        client_read.read_to_end(&mut reply).await.unwrap();
        assert!(reply.is_empty());
    }

    #[tokio::test]
    async fn test_blocked_writer_does_not_hold_pump() {
        let (client, proxy_a) = duplex(64);
        let (proxy_b, server) = duplex(64);
        let pump = tokio::spawn(copy(proxy_a, proxy_b));

        let (_client_read, mut client_write) = tokio::io::split(client);
        let (_server_read, mut server_write) = tokio::io::split(server);

        // Nobody reads the client side, so b->a blocks on its write
        tokio::spawn(async move {
            let _ = server_write.write_all(&[7u8; 512]).await;
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        client_write.shutdown().await.unwrap();

        timeout(Duration::from_secs(2), pump)
            .await
            .expect("pump still running with a blocked writer")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_dropped_peer_ends_pump() {
        let (client, proxy_a) = duplex(1024);
        let (proxy_b, server) = duplex(1024);
        let pump = tokio::spawn(copy(proxy_a, proxy_b));

        drop(client);
        drop(server);

        let result = timeout(Duration::from_secs(2), pump)
            .await
            .expect("pump did not finish")
            .unwrap();
        assert!(result.is_ok());
    }
}
