use async_trait::async_trait;
use showbus::clock::epoch_millis;
use showbus::config::{Identity, TriggerConfig};
use showbus::protocol::{Instruction, ShowCommand};
use showbus::scheduler::{Cue, CueList};
use showbus::transport::{LocalExchange, LocalSubscription, Publisher, Subscriber, TransportError};
use showbus::trigger::{listen, KeyMap, ListenerExit, ShowTrigger, TriggerError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

fn trigger_with_offset(exchange: &LocalExchange, sync_offset_ms: Option<u64>) -> ShowTrigger<showbus::transport::LocalPublisher> {
    let config = TriggerConfig {
        sync_offset_ms,
        ..TriggerConfig::default()
    };
    ShowTrigger::new(Identity::new("Desk", 1), exchange.publisher(), &config)
}

async fn next_command(subscription: &mut LocalSubscription) -> ShowCommand {
    let payload = subscription.recv().await.expect("subscription closed").expect("receive failed");
    ShowCommand::decode(&payload).expect("trigger sent a malformed command")
}

/// Publisher whose broker is down.
struct Unreachable {
    attempts: AtomicUsize,
}

#[async_trait]
impl Publisher for Unreachable {
    async fn publish(&self, _payload: Vec<u8>) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(TransportError::Closed)
    }
}

#[tokio::test]
async fn test_go_carries_sync_offset() {
    let exchange = LocalExchange::new("stage");
    let mut subscription = exchange.subscribe();
    let trigger = trigger_with_offset(&exchange, Some(10_000));

    let before = epoch_millis();
    let sent = trigger.send_go().await.unwrap();
    let after = epoch_millis();

    let received = next_command(&mut subscription).await;
    assert_eq!(received, sent);
    assert_eq!(received.instruction(), Instruction::Go);
    assert!(received.start_time() >= before + 10_000);
    assert!(received.start_time() <= after + 10_000);
}

#[tokio::test]
async fn test_shutdown_ignores_sync_offset() {
    let exchange = LocalExchange::new("stage");
    let mut subscription = exchange.subscribe();
    let trigger = trigger_with_offset(&exchange, Some(10_000));

    let before = epoch_millis();
    trigger.send_shutdown().await.unwrap();
    let received = next_command(&mut subscription).await;

    assert_eq!(received.instruction(), Instruction::Shutdown);
    assert!(received.start_time() >= before);
    assert!(received.start_time() < before + 1_000);
}

#[tokio::test]
async fn test_every_subscriber_receives_the_same_command() {
    let exchange = LocalExchange::new("stage");
    let mut left = exchange.subscribe();
    let mut right = exchange.subscribe();
    let trigger = trigger_with_offset(&exchange, None);

    trigger.send_idle().await.unwrap();

    assert_eq!(next_command(&mut left).await, next_command(&mut right).await);
}

#[tokio::test]
async fn test_publish_failure_surfaces_as_transport_error() {
    let publisher = Unreachable {
        attempts: AtomicUsize::new(0),
    };
    let trigger = ShowTrigger::new(Identity::new("Desk", 1), publisher, &TriggerConfig::default());

    assert!(matches!(trigger.send_go().await, Err(TriggerError::Transport(TransportError::Closed))));
}

#[tokio::test]
async fn test_keyboard_listener_sends_tokens_until_exit() {
    let exchange = LocalExchange::new("stage");
    let mut subscription = exchange.subscribe();
    let trigger = trigger_with_offset(&exchange, None);
    let input: &[u8] = b"go  idle\nbogus SHUTDOWN\nEXIT go\n";

    let exit = listen(&trigger, &KeyMap::default(), input).await.unwrap();

    assert_eq!(exit, ListenerExit::ExitRequested);
    assert_eq!(next_command(&mut subscription).await.instruction(), Instruction::Go);
    assert_eq!(next_command(&mut subscription).await.instruction(), Instruction::Idle);
    assert_eq!(next_command(&mut subscription).await.instruction(), Instruction::Shutdown);
    // Nothing after EXIT was sent
    assert!(time::timeout(Duration::from_millis(50), subscription.recv()).await.is_err());
}

#[tokio::test]
async fn test_keyboard_listener_uses_custom_go_token() {
    let exchange = LocalExchange::new("stage");
    let mut subscription = exchange.subscribe();
    let trigger = trigger_with_offset(&exchange, None);
    let input: &[u8] = b"go\nSPACE\n";

    let exit = listen(&trigger, &KeyMap::new("space"), input).await.unwrap();

    assert_eq!(exit, ListenerExit::InputClosed);
    assert_eq!(next_command(&mut subscription).await.instruction(), Instruction::Go);
    assert!(time::timeout(Duration::from_millis(50), subscription.recv()).await.is_err());
}

#[tokio::test]
async fn test_keyboard_listener_survives_publish_failures() {
    let publisher = Arc::new(Unreachable {
        attempts: AtomicUsize::new(0),
    });
    let trigger = ShowTrigger::new(Identity::new("Desk", 1), Arc::clone(&publisher), &TriggerConfig::default());
    let input: &[u8] = b"GO GO IDLE\n";

    let exit = listen(&trigger, &KeyMap::default(), input).await.unwrap();

    assert_eq!(exit, ListenerExit::InputClosed);
    assert_eq!(publisher.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_cue_list_plays_in_order() {
    let exchange = LocalExchange::new("stage");
    let mut subscription = exchange.subscribe();
    let trigger = trigger_with_offset(&exchange, None);

    let mut cues = CueList::new();
    cues.schedule(Cue::new(3000, Instruction::Shutdown)).unwrap();
    cues.schedule(Cue::new(0, Instruction::Go)).unwrap();
    cues.schedule(Cue {
        at_ms: 1000,
        instruction: Instruction::Idle,
        sync_offset_ms: Some(500),
    })
    .unwrap();

    let started = Instant::now();
    let stats = cues.play(&trigger, CancellationToken::new()).await;

    assert_eq!(stats.total_sent, 3);
    assert_eq!(stats.total_failed, 0);
    assert!(started.elapsed() >= Duration::from_millis(3000));

    assert_eq!(next_command(&mut subscription).await.instruction(), Instruction::Go);
    let idle = next_command(&mut subscription).await;
    assert_eq!(idle.instruction(), Instruction::Idle);
    assert!(idle.start_time() >= epoch_millis() + 400);
    assert_eq!(next_command(&mut subscription).await.instruction(), Instruction::Shutdown);
}

#[tokio::test(start_paused = true)]
async fn test_cue_playback_cancellation() {
    let exchange = LocalExchange::new("stage");
    let trigger = trigger_with_offset(&exchange, None);

    let mut cues = CueList::new();
    cues.schedule(Cue::new(0, Instruction::Go)).unwrap();
    cues.schedule(Cue::new(60_000, Instruction::Idle)).unwrap();
    cues.schedule(Cue::new(120_000, Instruction::Shutdown)).unwrap();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        time::sleep(Duration::from_secs(1)).await;
        canceller.cancel();
    });

    let stats = cues.play(&trigger, cancel).await;

    assert_eq!(stats.total_sent, 1);
    assert_eq!(stats.total_cancelled, 2);
}
