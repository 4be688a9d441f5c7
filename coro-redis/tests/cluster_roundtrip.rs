//! Exercises `ClusterClient` end to end over a real TCP socket and the
//! public API only: topology discovery via `CLUSTER SLOTS`, then routing a
//! command to the slot's primary.

use bytes::Bytes;
use coro_redis::{ClientParams, ClusterClient, ExecuteOpt, RedisValue, SlotOpt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

#[tokio::test]
async fn discovers_topology_and_routes_a_command_to_the_primary() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();

        // CLUSTER SLOTS
        let mut buf = [0u8; 4096];
        let n = sock.read(&mut buf).await.unwrap();
        assert!(n > 0);
        let reply = format!(
            "*1\r\n*3\r\n:0\r\n:16383\r\n*2\r\n$9\r\n127.0.0.1\r\n:{}\r\n",
            addr.port()
        );
        sock.write_all(reply.as_bytes()).await.unwrap();

        // SET foo bar
        let n = sock.read(&mut buf).await.unwrap();
        assert!(n > 0);
        sock.write_all(b"+OK\r\n").await.unwrap();
    });

    let client = ClusterClient::new(
        vec![("127.0.0.1".to_string(), addr.port())],
        ClientParams::new("127.0.0.1", addr.port()),
        2,
        false,
    );

    let command = vec![Bytes::from_static(b"SET"), Bytes::from_static(b"foo"), Bytes::from_static(b"bar")];
    let value = client.execute(&command, ExecuteOpt::write(SlotOpt::KeyIndex(-1))).await.unwrap();
    assert_eq!(value, RedisValue::SimpleString("OK".into()));

    server.await.unwrap();
}
