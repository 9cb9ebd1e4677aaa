use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use nightfall_core::UiCommand;
use nightfall_link::{
    parse_endpoint, LinkConfig, LinkErrorCode, LinkEvent, LinkStatus, LinkView, ReconnectPolicy,
    TelemetryLink,
};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type DeviceSocket = WebSocketStream<TcpStream>;

const WAIT: Duration = Duration::from_secs(5);

async fn device() -> (TcpListener, LinkConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let mut config = LinkConfig::new(parse_endpoint(&addr.to_string()).expect("endpoint"));
    config.reconnect = ReconnectPolicy::Fixed(Duration::from_millis(50));
    config.prediction_timeout = None;
    (listener, config)
}

async fn accept(listener: &TcpListener) -> DeviceSocket {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("accept timeout")
        .expect("accept");
    accept_async(stream).await.expect("handshake")
}

async fn push(ws: &mut DeviceSocket, value: Value) {
    ws.send(Message::Text(value.to_string())).await.expect("device send");
}

async fn next_json(ws: &mut DeviceSocket) -> Value {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("frame timeout")
            .expect("stream open")
            .expect("frame");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("json frame");
        }
    }
}

async fn wait_for<F>(view: &mut watch::Receiver<LinkView>, condition: F) -> LinkView
where
    F: Fn(&LinkView) -> bool,
{
    timeout(WAIT, async {
        loop {
            {
                let current = view.borrow_and_update();
                if condition(&current) {
                    return current.clone();
                }
            }
            view.changed().await.expect("link task alive");
        }
    })
    .await
    .expect("condition not reached")
}

fn drain(events: &mut broadcast::Receiver<LinkEvent>) -> Vec<LinkEvent> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }
    drained
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn telemetry_frames_merge_into_the_view() {
    let (listener, config) = device().await;
    let link = TelemetryLink::spawn(config);
    let mut view = link.watch();
    let mut events = link.subscribe();
    link.connect();

    let mut ws = accept(&listener).await;
    wait_for(&mut view, LinkView::is_connected).await;

    push(
        &mut ws,
        json!({
            "type": "telemetry",
            "ts": Utc::now().timestamp_millis(),
            "sensors": {"front_dist": 31.5, "rear_dist": 80, "gas": 42},
            "state": {"fsm": "PATROL", "autonomous": false, "nav_state": "forward"},
            "server_clients": 1
        }),
    )
    .await;
    ws.send(Message::Text("{not json".to_string()))
        .await
        .expect("device send");
    push(
        &mut ws,
        json!({"type": "telemetry", "motors": {"front_left": 120, "front_right": 118}}),
    )
    .await;
    push(
        &mut ws,
        json!({"type": "status", "role": "front", "status": "online", "msg": "camera ready"}),
    )
    .await;

    let current = wait_for(&mut view, |view| view.stats.msgs_received == 3).await;
    assert_eq!(current.revision, 2);
    assert_eq!(current.telemetry.sensors.gas, 42.0);
    assert_eq!(current.telemetry.motors.front_left, 120);
    assert_eq!(current.telemetry.state.fsm, "PATROL");
    assert_eq!(current.telemetry.server_clients, 1);
    assert!(current.telemetry.last_update.is_some());
    assert_eq!(current.stats.frames_malformed, 1);
    assert!(current.stats.last_latency_ms.is_some());
    assert!(current.stats.connected_since.is_some());

    let events = drain(&mut events);
    assert!(events.contains(&LinkEvent::TelemetryUpdated { revision: 2 }));
    assert!(events.iter().any(|event| matches!(
        event,
        LinkEvent::DeviceStatus { report, .. } if report.role == "front"
    )));

    link.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn commands_reach_the_device_as_ui_cmd_frames() {
    let (listener, config) = device().await;
    let link = TelemetryLink::spawn(config);
    let mut view = link.watch();
    link.connect();

    let mut ws = accept(&listener).await;
    wait_for(&mut view, LinkView::is_connected).await;

    link.send_command(&UiCommand::PidTune {
        kp: 4.0,
        ki: 0.0,
        kd: 1.0,
    });
    link.send_command(&UiCommand::Forward);

    assert_eq!(
        next_json(&mut ws).await,
        json!({"type": "ui_cmd", "cmd": "pid_tune", "kP": 4.0, "kI": 0.0, "kD": 1.0})
    );
    assert_eq!(
        next_json(&mut ws).await,
        json!({"type": "ui_cmd", "cmd": "forward"})
    );

    let current = wait_for(&mut view, |view| view.stats.commands_sent == 2).await;
    assert_eq!(current.stats.commands_dropped, 0);

    link.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn send_while_disconnected_is_dropped_not_queued() {
    let (listener, config) = device().await;
    let link = TelemetryLink::spawn(config);
    let mut view = link.watch();
    let mut events = link.subscribe();

    link.send_ui_cmd("forward", serde_json::Map::new());
    let current = wait_for(&mut view, |view| view.stats.commands_dropped == 1).await;
    assert_eq!(current.stats.commands_sent, 0);
    assert_eq!(current.status, LinkStatus::Disconnected);
    assert!(drain(&mut events)
        .iter()
        .any(|event| matches!(event, LinkEvent::CommandDropped { .. })));

    // The dropped command must not surface once a link opens.
    link.connect();
    let mut ws = accept(&listener).await;
    wait_for(&mut view, LinkView::is_connected).await;
    link.send_command(&UiCommand::Stop);
    assert_eq!(
        next_json(&mut ws).await,
        json!({"type": "ui_cmd", "cmd": "stop"})
    );

    link.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn link_reconnects_after_the_device_closes() {
    let (listener, config) = device().await;
    let link = TelemetryLink::spawn(config);
    let mut view = link.watch();
    let mut events = link.subscribe();
    link.connect();

    let mut first = accept(&listener).await;
    wait_for(&mut view, LinkView::is_connected).await;
    first.close(None).await.expect("device close");
    drop(first);

    wait_for(&mut view, |view| {
        view.status == LinkStatus::Connecting && view.stats.reconnect_attempts == 1
    })
    .await;
    // A connect request while the retry is in flight changes nothing.
    link.connect();

    let _second = accept(&listener).await;
    let current = wait_for(&mut view, |view| {
        view.is_connected() && view.stats.reconnect_attempts == 0
    })
    .await;
    assert!(current.stats.last_error.is_none());

    let visited: Vec<LinkStatus> = drain(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            LinkEvent::StatusChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        visited,
        vec![
            LinkStatus::Connecting,
            LinkStatus::Connected,
            LinkStatus::Disconnected,
            LinkStatus::Connecting,
            LinkStatus::Connected,
        ]
    );

    link.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn refused_connection_records_error_and_keeps_retrying() {
    let (listener, config) = device().await;
    drop(listener);
    let link = TelemetryLink::spawn(config);
    let mut view = link.watch();
    link.connect();

    let current = wait_for(&mut view, |view| view.stats.reconnect_attempts >= 2).await;
    assert_eq!(current.stats.last_error, Some(LinkErrorCode::ConnectFailed));
    assert!(current.stats.connected_since.is_none());

    link.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stalled_handshake_times_out_and_retries() {
    // The listener is never accepted from, so the upgrade request goes unanswered.
    let (listener, mut config) = device().await;
    config.connect_timeout = Duration::from_millis(100);
    let link = TelemetryLink::spawn(config);
    let mut view = link.watch();
    link.connect();

    let current = wait_for(&mut view, |view| view.stats.reconnect_attempts >= 2).await;
    assert_eq!(current.stats.last_error, Some(LinkErrorCode::ConnectFailed));
    assert!(current.stats.connected_since.is_none());

    link.dispose().await;
    drop(listener);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn prediction_clears_once_telemetry_confirms_it() {
    let (listener, config) = device().await;
    let link = TelemetryLink::spawn(config);
    let mut view = link.watch();
    let mut events = link.subscribe();
    link.connect();

    let mut ws = accept(&listener).await;
    wait_for(&mut view, LinkView::is_connected).await;

    link.set_prediction(true);
    let current = wait_for(&mut view, |view| view.predicted_autonomous.is_some()).await;
    assert!(current.effective_autonomous());
    assert!(!current.telemetry.state.autonomous);

    push(
        &mut ws,
        json!({"type": "telemetry", "state": {"fsm": "PATROL", "autonomous": true, "nav_state": "forward"}}),
    )
    .await;
    let current = wait_for(&mut view, |view| view.revision == 1).await;
    assert_eq!(current.predicted_autonomous, None);
    assert!(current.effective_autonomous());

    push(&mut ws, json!({"type": "telemetry", "sensors": {"gas": 12}})).await;
    let current = wait_for(&mut view, |view| view.revision == 2).await;
    assert_eq!(current.predicted_autonomous, None);
    assert!(drain(&mut events).contains(&LinkEvent::PredictionReconciled { value: true }));

    link.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unconfirmed_prediction_expires() {
    let (_listener, mut config) = device().await;
    config.prediction_timeout = Some(Duration::from_millis(100));
    let link = TelemetryLink::spawn(config);
    let mut view = link.watch();
    let mut events = link.subscribe();

    link.set_prediction(true);
    wait_for(&mut view, |view| view.predicted_autonomous == Some(true)).await;
    let current = wait_for(&mut view, |view| view.predicted_autonomous.is_none()).await;
    assert!(!current.effective_autonomous());
    assert!(drain(&mut events).contains(&LinkEvent::PredictionExpired {
        predicted: true,
        confirmed: false,
    }));

    link.dispose().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dispose_closes_the_socket_without_reconnecting() {
    let (listener, config) = device().await;
    let link = TelemetryLink::spawn(config);
    let mut view = link.watch();
    link.connect();

    let mut ws = accept(&listener).await;
    wait_for(&mut view, LinkView::is_connected).await;
    link.dispose().await;

    let closed = timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => return true,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .expect("socket close timeout");
    assert!(closed);

    let final_view = view.borrow().clone();
    assert_eq!(final_view.status, LinkStatus::Disconnected);
    assert!(
        timeout(Duration::from_millis(300), listener.accept())
            .await
            .is_err(),
        "disposed link must not reconnect"
    );
}
