use showbus::config::{BrokerConfig, ElementConfig, Identity, TriggerConfig};
use showbus::element::{ElementPhase, ShowElement};
use showbus::pin::{parse_pattern, BlinkBehavior, MemoryPin, PinState};
use showbus::protocol::{Instruction, ShowCommand};
use showbus::transport::tcp::MAX_FRAME_SIZE;
use showbus::transport::{Hub, Publisher, Subscriber, TcpPublisher, TcpSubscriber, TransportError};
use showbus::trigger::ShowTrigger;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time;

const WAIT_LIMIT: Duration = Duration::from_secs(5);

async fn start_hub() -> (Arc<Hub>, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let hub = Arc::new(Hub::new());
    tokio::spawn(Arc::clone(&hub).serve(listener));
    (hub, addr)
}

async fn recv_payload<S: Subscriber>(subscriber: &mut S) -> Vec<u8> {
    time::timeout(WAIT_LIMIT, subscriber.recv())
        .await
        .expect("timed out waiting for payload")
        .expect("subscription closed")
        .expect("receive failed")
}

#[tokio::test]
async fn test_hub_fans_out_to_every_subscriber() {
    let (hub, addr) = start_hub().await;
    let endpoint = addr.to_string();

    let mut first = TcpSubscriber::connect(&endpoint, "stage").await.unwrap();
    let mut second = TcpSubscriber::connect(&endpoint, "stage").await.unwrap();
    let publisher = TcpPublisher::connect(&endpoint, "stage").await.unwrap();
    assert_eq!(hub.subscriber_count("stage").await, 2);

    let command = ShowCommand::go(Some(1_000));
    publisher.publish(command.encode().unwrap()).await.unwrap();

    assert_eq!(ShowCommand::decode(&recv_payload(&mut first).await).unwrap(), command);
    assert_eq!(ShowCommand::decode(&recv_payload(&mut second).await).unwrap(), command);
}

#[tokio::test]
async fn test_exchanges_are_isolated() {
    let (hub, addr) = start_hub().await;
    let endpoint = addr.to_string();

    let mut left = TcpSubscriber::connect(&endpoint, "stage-left").await.unwrap();
    let mut right = TcpSubscriber::connect(&endpoint, "stage-right").await.unwrap();
    let publisher = TcpPublisher::connect(&endpoint, "stage-left").await.unwrap();
    assert_eq!(publisher.exchange(), "stage-left");
    assert_eq!(right.exchange(), "stage-right");

    publisher.publish(b"left only".to_vec()).await.unwrap();

    assert_eq!(recv_payload(&mut left).await, b"left only".to_vec());
    assert!(time::timeout(Duration::from_millis(100), right.recv()).await.is_err());
    assert_eq!(hub.exchange_names().await, vec!["stage-left".to_string(), "stage-right".to_string()]);
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_commands() {
    let (_hub, addr) = start_hub().await;
    let endpoint = addr.to_string();
    let publisher = TcpPublisher::connect(&endpoint, "stage").await.unwrap();

    publisher.publish(b"before".to_vec()).await.unwrap();
    time::sleep(Duration::from_millis(50)).await;
    let mut late = TcpSubscriber::connect(&endpoint, "stage").await.unwrap();
    publisher.publish(b"after".to_vec()).await.unwrap();

    assert_eq!(recv_payload(&mut late).await, b"after".to_vec());
}

#[tokio::test]
async fn test_connect_to_closed_port_is_unavailable() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let broker = BrokerConfig::new("127.0.0.1", addr.port(), "stage");
    let result = TcpPublisher::from_config(&broker).await;

    match result {
        Err(TransportError::Unavailable { endpoint, .. }) => assert_eq!(endpoint, broker.endpoint()),
        other => panic!("expected Unavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn test_publisher_rejects_bad_frames() {
    let (_hub, addr) = start_hub().await;
    let publisher = TcpPublisher::connect(&addr.to_string(), "stage").await.unwrap();

    assert!(matches!(
        publisher.publish(vec![b'x'; MAX_FRAME_SIZE + 1]).await,
        Err(TransportError::InvalidFrame(_))
    ));
    assert!(matches!(
        publisher.publish(b"two\nlines".to_vec()).await,
        Err(TransportError::InvalidFrame(_))
    ));
}

/// Binds a raw connection as a publisher, the way `TcpPublisher` does.
async fn raw_publisher(addr: SocketAddr, exchange: &str) -> TcpStream {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let hello = format!("{{\"exchange\":\"{exchange}\",\"role\":\"publish\"}}\n");
    stream.write_all(hello.as_bytes()).await.unwrap();

    let mut ack = String::new();
    BufReader::new(&mut stream).read_line(&mut ack).await.unwrap();
    assert_eq!(ack.trim_end(), format!("{{\"bound\":\"{exchange}\"}}"));
    stream
}

#[tokio::test]
async fn test_hub_skips_oversized_line_and_keeps_publisher() {
    let (_hub, addr) = start_hub().await;
    let mut subscriber = TcpSubscriber::connect(&addr.to_string(), "stage").await.unwrap();
    let mut raw = raw_publisher(addr, "stage").await;

    // Several frames' worth of bytes before the newline arrives.
    let flood = vec![b'x'; MAX_FRAME_SIZE * 4];
    raw.write_all(&flood).await.unwrap();
    raw.write_all(b"tail\n").await.unwrap();
    raw.write_all(b"cue-7\n").await.unwrap();

    assert_eq!(recv_payload(&mut subscriber).await, b"cue-7".to_vec());
    assert!(time::timeout(Duration::from_millis(100), subscriber.recv()).await.is_err());
}

#[tokio::test]
async fn test_subscriber_rejects_oversized_line_from_hub() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut binding = String::new();
        BufReader::new(reader).read_line(&mut binding).await.unwrap();
        writer.write_all(b"{\"bound\":\"stage\"}\n").await.unwrap();
        writer.write_all(&vec![b'y'; MAX_FRAME_SIZE + 100]).await.unwrap();
        writer.write_all(b"\nafter\n").await.unwrap();
        time::sleep(WAIT_LIMIT).await;
    });

    let mut subscriber = TcpSubscriber::connect(&addr.to_string(), "stage").await.unwrap();

    let first = time::timeout(WAIT_LIMIT, subscriber.recv()).await.unwrap().unwrap();
    assert!(matches!(first, Err(TransportError::InvalidFrame(_))));
    assert_eq!(recv_payload(&mut subscriber).await, b"after".to_vec());
}

#[tokio::test]
async fn test_publisher_waits_for_hub_to_come_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let broker = BrokerConfig::new("127.0.0.1", addr.port(), "stage");

    let connecting = tokio::spawn(async move { TcpPublisher::connect_retrying(&broker, Duration::from_millis(20)).await });
    time::sleep(Duration::from_millis(100)).await;
    assert!(!connecting.is_finished());

    let hub = Arc::new(Hub::new());
    tokio::spawn(Arc::clone(&hub).serve(TcpListener::bind(addr).await.unwrap()));

    let publisher = time::timeout(WAIT_LIMIT, connecting)
        .await
        .expect("publisher never connected")
        .unwrap()
        .unwrap();
    assert_eq!(publisher.exchange(), "stage");
    assert_eq!(hub.exchange_names().await, vec!["stage".to_string()]);
}

#[tokio::test]
async fn test_element_runs_show_over_tcp() {
    let (_hub, addr) = start_hub().await;
    let broker = BrokerConfig::new("127.0.0.1", addr.port(), "show");

    let behavior = Arc::new(
        BlinkBehavior::new(MemoryPin::new("lamp"), parse_pattern("on:20,off:20,on:20").unwrap())
            .with_idle_period(Duration::from_millis(10)),
    );
    let element = ShowElement::spawn(Identity::new("Lamp", 3), Arc::clone(&behavior), ElementConfig::default());
    element.attach(TcpSubscriber::from_config(&broker).await.unwrap());

    let config = TriggerConfig {
        sync_offset_ms: Some(100),
        ..TriggerConfig::default()
    };
    let trigger = ShowTrigger::new(Identity::new("Desk", 1), TcpPublisher::from_config(&broker).await.unwrap(), &config);

    trigger.send(Instruction::Go).await.unwrap();
    let mut state = element.watch();
    time::timeout(WAIT_LIMIT, state.wait_for(|s| s.stats.sequences_completed == 1))
        .await
        .expect("show never completed")
        .unwrap();

    trigger.send_shutdown().await.unwrap();
    time::timeout(WAIT_LIMIT, element.stopped()).await.expect("element never stopped");

    assert_eq!(element.phase(), ElementPhase::Terminated);
    assert_eq!(behavior.actuator().state().await, PinState::Low);
}
