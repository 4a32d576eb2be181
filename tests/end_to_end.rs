use bridgerpc::{
    Client, ClientConfig, ClientError, ConnectionHooks, ConnectionState, Decoder, Encoder,
    MemoryChannel, Message, MetaEvent, ReconnectConfig, Value,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

type Results = Arc<Mutex<Vec<(u64, Result<Value, ClientError>)>>>;

/// Decodes every frame the client wrote so far.
fn written_calls(channel: &MemoryChannel) -> Vec<Message> {
    let mut decoder = Decoder::new();
    channel
        .take_written()
        .iter()
        .flat_map(|chunk| decoder.feed(chunk).collect::<Vec<_>>())
        .map(|message| message.unwrap())
        .collect()
}

fn fast_reconnect() -> ClientConfig {
    ClientConfig::default().with_reconnect(ReconnectConfig {
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
        jitter: false,
        ..Default::default()
    })
}

proptest! {
    #[test]
    fn responses_match_calls_in_any_order(order in Just((0..8u64).collect::<Vec<_>>()).prop_shuffle()) {
        let channel = MemoryChannel::new();
        let client = Client::bridge(channel.clone(), ConnectionHooks::new(), ClientConfig::default()).unwrap();
        let results: Results = Arc::new(Mutex::new(Vec::new()));

        for tag in 0..8u64 {
            let results = results.clone();
            client.call("job", vec![Value::from(tag)], move |result| {
                results.lock().push((tag, result));
            });
        }

        let calls = written_calls(&channel);
        prop_assert_eq!(calls.len(), 8);

        for index in order {
            match &calls[index as usize] {
                Message::Call { id, args, .. } => {
                    let reply = Message::ok(*id, args[0].clone());
                    channel.inject(&Encoder::encode(&reply).unwrap());
                }
                other => prop_assert!(false, "unexpected frame {:?}", other),
            }
        }

        let results = results.lock();
        prop_assert_eq!(results.len(), 8);
        for (tag, result) in results.iter() {
            prop_assert_eq!(result.as_ref().unwrap().as_u64(), Some(*tag));
        }
        prop_assert_eq!(client.pending_count(), 0);
    }
}

#[test]
fn duplicate_response_is_discarded() {
    let channel = MemoryChannel::new();
    let client =
        Client::bridge(channel.clone(), ConnectionHooks::new(), ClientConfig::default()).unwrap();
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();

    client.call("once", vec![], move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let id = written_calls(&channel)[0].id().unwrap();

    let reply = Encoder::encode(&Message::ok(id, Value::Nil)).unwrap();
    channel.inject(&reply);
    channel.inject(&reply);

    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn responses_split_across_chunks() {
    let channel = MemoryChannel::new();
    let client =
        Client::bridge(channel.clone(), ConnectionHooks::new(), ClientConfig::default()).unwrap();
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    for tag in 0..3u64 {
        let results = results.clone();
        client.call("job", vec![], move |result| results.lock().push((tag, result)));
    }

    let mut stream = Vec::new();
    for call in written_calls(&channel) {
        let id = call.id().unwrap();
        stream.extend_from_slice(&Encoder::encode(&Message::ok(id, Value::from(id))).unwrap());
    }
    for byte in stream {
        channel.inject(&[byte]);
    }

    assert_eq!(results.lock().len(), 3);
    assert_eq!(client.pending_count(), 0);
}

#[test]
fn send_while_disconnected_leaves_table_alone() {
    let channel = MemoryChannel::new();
    let client =
        Client::reconnecting(channel.clone(), ConnectionHooks::new(), fast_reconnect());
    client.connect(|_| {});

    let outcome = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    client.call("inflight", vec![], move |result| *slot.lock() = Some(result));
    assert_eq!(client.pending_count(), 1);

    channel.disconnect();
    assert_eq!(*outcome.lock(), Some(Err(ClientError::ConnectionLost)));
    assert_eq!(client.state(), ConnectionState::Disconnected);

    let rejected = Arc::new(Mutex::new(None));
    let slot = rejected.clone();
    client.call("late", vec![], move |result| *slot.lock() = Some(result));

    assert_eq!(*rejected.lock(), Some(Err(ClientError::NotConnected)));
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn reconnecting_pair_recovers_after_loss() {
    let (near, far) = MemoryChannel::pair();
    let connects = Arc::new(AtomicUsize::new(0));
    let counter = connects.clone();
    let hooks = ConnectionHooks::new().with_on_connect(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let client = Client::reconnecting(near.clone(), hooks, fast_reconnect());
    let engine = Client::bridge(far, ConnectionHooks::new(), ClientConfig::default()).unwrap();
    engine.register_incoming_handler("version", |_| Ok(Value::from("1.0.0")));

    client.connect_async().await.unwrap();
    assert_eq!(
        client.call_async("version", vec![]).await,
        Ok(Value::from("1.0.0"))
    );

    near.disconnect();
    assert!(!client.is_connected());

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(client.is_connected());
    assert_eq!(client.generation(), 2);
    assert_eq!(connects.load(Ordering::SeqCst), 2);
    assert_eq!(
        client.call_async("version", vec![]).await,
        Ok(Value::from("1.0.0"))
    );
}

#[tokio::test]
async fn queued_call_completes_after_connect() {
    let (near, far) = MemoryChannel::pair();
    let config = fast_reconnect().with_queue_until_connected(true);
    let client = Client::reconnecting(near, ConnectionHooks::new(), config);
    let engine = Client::bridge(far, ConnectionHooks::new(), ClientConfig::default()).unwrap();
    engine.register_incoming_handler("sum", |args| {
        Ok(Value::from(args.iter().filter_map(Value::as_u64).sum::<u64>()))
    });

    let outcome = Arc::new(Mutex::new(None));
    let slot = outcome.clone();
    client.call("sum", vec![Value::from(1), Value::from(2)], move |result| {
        *slot.lock() = Some(result)
    });
    assert_eq!(client.queued_count(), 1);

    client.connect_async().await.unwrap();

    assert_eq!(*outcome.lock(), Some(Ok(Value::from(3u64))));
}

#[test]
fn engine_reset_restarts_bridge_session() {
    let channel = MemoryChannel::new();
    let resets = Arc::new(AtomicUsize::new(0));
    let counter = resets.clone();
    let hooks = ConnectionHooks::new().with_on_connect(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let client = Client::bridge(channel.clone(), hooks, ClientConfig::default()).unwrap();

    channel.emit_meta(MetaEvent::parse("engine-reset"));
    channel.emit_meta(MetaEvent::parse("engine-reset"));

    assert_eq!(resets.load(Ordering::SeqCst), 2);
    assert_eq!(client.generation(), 3);
    assert!(client.is_connected());
}
