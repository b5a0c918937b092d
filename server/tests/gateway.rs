//! Gateway tests over real sockets with a WebSocket client.

use futures::{SinkExt, StreamExt};
use lockgate_server::collab::{InMemoryDeviceRepository, OwnerAuthorizer};
use lockgate_server::transport::{self, CLIENT_PATH, DEVICE_PATH};
use lockgate_server::{ServerConfig, SessionOrchestrator};
use lockgate_shared::{
    codec, AckFrame, ClientFrame, ClientHello, CommandRequest, CommandStatus, DeviceFrame, DeviceHello, LockAction,
    LockState, NotifyFrame, ServerFrame, StatusFrame,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Bind an ephemeral port and serve the gateway on it
async fn boot() -> (String, Arc<SessionOrchestrator>) {
    let devices = Arc::new(InMemoryDeviceRepository::new().with_device("lock-1", "alice", "Front door"));
    let authorizer = Arc::new(OwnerAuthorizer::new(devices.clone()));
    let config = ServerConfig {
        heartbeat_interval: Duration::from_millis(500),
        ..ServerConfig::default()
    };
    let orchestrator = Arc::new(SessionOrchestrator::new(config, devices, authorizer));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(transport::serve(listener, orchestrator.clone()));

    (format!("ws://{}", addr), orchestrator)
}

async fn connect(base: &str, path: &str) -> WsStream {
    let (ws, _) = connect_async(format!("{}{}", base, path)).await.unwrap();
    ws
}

async fn send<T: serde::Serialize>(ws: &mut WsStream, frame: &T) {
    ws.send(Message::Text(codec::encode(frame).unwrap())).await.unwrap();
}

/// Read until a close frame arrives and return its code and reason
async fn expect_close(ws: &mut WsStream) -> (CloseCode, String) {
    loop {
        match timeout(TIMEOUT, ws.next()).await.expect("no close before timeout") {
            Some(Ok(Message::Close(Some(frame)))) => return (frame.code, frame.reason.to_string()),
            Some(Ok(Message::Close(None))) | None => panic!("closed without a close frame"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("socket error before close: {}", e),
        }
    }
}

async fn next_server_frame(ws: &mut WsStream) -> ServerFrame {
    loop {
        match timeout(TIMEOUT, ws.next()).await.expect("no frame before timeout") {
            Some(Ok(Message::Text(text))) => return codec::decode(&text).unwrap(),
            Some(Ok(Message::Close(_))) | None => panic!("device socket closed"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("socket error: {}", e),
        }
    }
}

async fn next_notification(ws: &mut WsStream) -> NotifyFrame {
    loop {
        match timeout(TIMEOUT, ws.next()).await.expect("no frame before timeout") {
            Some(Ok(Message::Text(text))) => return codec::decode(&text).unwrap(),
            Some(Ok(Message::Close(_))) | None => panic!("client socket closed"),
            Some(Ok(_)) => continue,
            Some(Err(e)) => panic!("socket error: {}", e),
        }
    }
}

async fn wait_online(orchestrator: &SessionOrchestrator) {
    timeout(TIMEOUT, async {
        while !orchestrator.state().is_online(&"lock-1".into()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("device never came online");
}

#[tokio::test]
async fn test_unknown_path_rejected_with_404() {
    let (base, _) = boot().await;

    match connect_async(format!("{}/ws/nowhere", base)).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 404),
        other => panic!("expected HTTP 404, got {:?}", other.map(|(_, response)| response.status())),
    }
}

#[tokio::test]
async fn test_first_frame_must_be_hello() {
    let (base, orchestrator) = boot().await;
    let mut ws = connect(&base, DEVICE_PATH).await;

    send(
        &mut ws,
        &DeviceFrame::Status(StatusFrame {
            device_id: "lock-1".into(),
            state: LockState::Unlocked,
            version: 7,
        }),
    )
    .await;

    let (code, _) = expect_close(&mut ws).await;
    assert_eq!(code, CloseCode::Policy);
    assert!(orchestrator.get_state(&"lock-1".into()).is_none());
}

#[tokio::test]
async fn test_silent_socket_closed_after_hello_deadline() {
    let (base, _) = boot().await;
    let mut ws = connect(&base, CLIENT_PATH).await;

    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!((code, reason.as_str()), (CloseCode::Policy, "HELLO expected"));
}

#[tokio::test]
async fn test_unknown_device_hello_closed() {
    let (base, orchestrator) = boot().await;
    let mut ws = connect(&base, DEVICE_PATH).await;

    send(
        &mut ws,
        &DeviceFrame::Hello(DeviceHello {
            device_id: "lock-9".into(),
        }),
    )
    .await;

    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!((code, reason.as_str()), (CloseCode::Policy, "UNKNOWN_DEVICE"));
    assert_eq!(orchestrator.registry().count(), 0);
}

#[tokio::test]
async fn test_repeated_malformed_frames_close_connection() {
    let (base, orchestrator) = boot().await;
    let mut ws = connect(&base, DEVICE_PATH).await;
    send(
        &mut ws,
        &DeviceFrame::Hello(DeviceHello {
            device_id: "lock-1".into(),
        }),
    )
    .await;
    wait_online(&orchestrator).await;

    ws.send(Message::Text("{not json".into())).await.unwrap();
    ws.send(Message::Binary(vec![0xff, 0xfe, 0xfd])).await.unwrap();
    ws.send(Message::Text(r#"{"type":"LAUNCH"}"#.into())).await.unwrap();

    let (code, reason) = expect_close(&mut ws).await;
    assert_eq!((code, reason.as_str()), (CloseCode::Policy, "MALFORMED_FRAME"));

    timeout(TIMEOUT, async {
        while orchestrator.state().is_online(&"lock-1".into()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("device still online after close");
}

#[tokio::test]
async fn test_command_round_trip() {
    let (base, orchestrator) = boot().await;

    let mut device = connect(&base, DEVICE_PATH).await;
    send(
        &mut device,
        &DeviceFrame::Hello(DeviceHello {
            device_id: "lock-1".into(),
        }),
    )
    .await;
    send(
        &mut device,
        &DeviceFrame::Status(StatusFrame {
            device_id: "lock-1".into(),
            state: LockState::Locked,
            version: 4,
        }),
    )
    .await;
    wait_online(&orchestrator).await;

    let mut client = connect(&base, CLIENT_PATH).await;
    send(
        &mut client,
        &ClientFrame::Hello(ClientHello {
            client_id: "alice".into(),
        }),
    )
    .await;
    send(
        &mut client,
        &ClientFrame::Command(CommandRequest {
            request_id: Some("req-1".into()),
            device_id: "lock-1".into(),
            action: LockAction::Unlock,
        }),
    )
    .await;

    let command = match next_server_frame(&mut device).await {
        ServerFrame::Command(command) => command,
        other => panic!("expected COMMAND, got {:?}", other),
    };
    assert_eq!(command.action, LockAction::Unlock);
    send(
        &mut device,
        &DeviceFrame::Ack(AckFrame::ok(command.command_id.clone(), "lock-1".into(), LockState::Unlocked, 5)),
    )
    .await;

    let result = loop {
        if let NotifyFrame::CommandResult(result) = next_notification(&mut client).await {
            break result;
        }
    };
    assert_eq!(result.request_id.as_deref(), Some("req-1"));
    assert_eq!(result.command_id, Some(command.command_id));
    assert_eq!(result.status, CommandStatus::Acked);
    assert_eq!((result.state, result.version), (Some(LockState::Unlocked), Some(5)));

    let snapshot = orchestrator.get_state(&"lock-1".into()).unwrap();
    assert_eq!((snapshot.state, snapshot.version), (LockState::Unlocked, 5));
}
