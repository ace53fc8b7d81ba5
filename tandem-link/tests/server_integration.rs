//! Integration tests over a real WebSocket rendezvous server.

use futures_util::{SinkExt, Stream, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tandem_link::{
    AudioFrame, ConnectionManager, LinkConfig, PeerEvent, RendezvousServer, Role, ServerConfig,
    WsRendezvous,
};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return its URL.
async fn start_test_server() -> String {
    let port = free_port().await;
    let server = RendezvousServer::new(ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
    });
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    sleep(Duration::from_millis(50)).await;
    format!("ws://127.0.0.1:{port}")
}

async fn next_text(
    ws: &mut (impl Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> serde_json::Value {
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame expected")
            .unwrap()
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

#[tokio::test]
async fn test_raw_claim_granted_then_taken() {
    let url = start_test_server().await;

    let (mut first, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    first
        .send(Message::Text(json!({"kind": "claim", "id": "room"}).to_string().into()))
        .await
        .unwrap();
    assert_eq!(next_text(&mut first).await, json!({"kind": "granted", "id": "room"}));

    let (mut second, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    second
        .send(Message::Text(json!({"kind": "claim", "id": "room"}).to_string().into()))
        .await
        .unwrap();
    assert_eq!(next_text(&mut second).await, json!({"kind": "taken", "id": "room"}));
}

#[tokio::test]
async fn test_closing_socket_releases_identity() {
    let url = start_test_server().await;

    let (mut first, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    first
        .send(Message::Text(json!({"kind": "claim", "id": "room"}).to_string().into()))
        .await
        .unwrap();
    next_text(&mut first).await;
    first.close(None).await.unwrap();
    drop(first);

    timeout(Duration::from_secs(2), async {
        loop {
            let (mut again, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
            again
                .send(Message::Text(json!({"kind": "claim", "id": "room"}).to_string().into()))
                .await
                .unwrap();
            if next_text(&mut again).await["kind"] == "granted" {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("identity should be released");
}

#[tokio::test]
async fn test_participants_pair_over_websocket() {
    let url = start_test_server().await;
    let config = LinkConfig::for_testing();

    let a = ConnectionManager::new("HelloTwin", Arc::new(WsRendezvous::new(&url)), config.clone());
    let b = ConnectionManager::new("HelloTwin", Arc::new(WsRendezvous::new(&url)), config);
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    a.start();
    b.start();
    timeout(Duration::from_secs(3), async {
        tokio::join!(a.wait_for_ready(), b.wait_for_ready());
    })
    .await
    .expect("both sides should become ready");

    let mut roles = [a.role().unwrap(), b.role().unwrap()];
    roles.sort_by_key(|r| r.initiates());
    assert_eq!(roles, [Role::Host, Role::Guest]);

    a.send(&json!({"from": "a"})).unwrap();
    b.send(&json!({"from": "b"})).unwrap();

    async fn data(events: &mut tokio::sync::broadcast::Receiver<PeerEvent>) -> serde_json::Value {
        loop {
            if let PeerEvent::RemoteData(v) = events.recv().await.unwrap() {
                return v;
            }
        }
    }
    assert_eq!(
        timeout(Duration::from_secs(2), data(&mut b_events)).await.unwrap(),
        json!({"from": "a"})
    );
    assert_eq!(
        timeout(Duration::from_secs(2), data(&mut a_events)).await.unwrap(),
        json!({"from": "b"})
    );

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn test_media_crosses_the_socket_as_binary() {
    let url = start_test_server().await;
    let config = LinkConfig::for_testing();

    let host = ConnectionManager::new("room", Arc::new(WsRendezvous::new(&url)), config.clone());
    let mut host_events = host.subscribe();
    host.start();
    timeout(Duration::from_secs(2), async {
        while host.role().is_none() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let guest = ConnectionManager::new("room", Arc::new(WsRendezvous::new(&url)), config);
    guest.start();

    timeout(Duration::from_secs(2), async {
        loop {
            if let PeerEvent::PeerStreamEstablished { .. } = host_events.recv().await.unwrap() {
                break;
            }
        }
    })
    .await
    .unwrap();

    // The guest's pump starts on `answered`; retry until a frame lands.
    let mut heard = host.incoming_media();
    let tone = AudioFrame {
        sample_rate: 16_000,
        pcm: (0..160).map(|i| (i * 100) as i16).collect(),
    };
    let received = timeout(Duration::from_secs(2), async {
        loop {
            let _ = guest.media_sender().send(tone.clone());
            if let Ok(Ok(frame)) = timeout(Duration::from_millis(50), heard.recv()).await {
                return frame;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(received, tone);

    host.shutdown();
    guest.shutdown();
}
