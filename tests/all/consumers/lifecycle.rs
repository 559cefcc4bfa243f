use crate::helpers::{
    eventually, get_consumer_options, get_pool, get_started_consumer, MockFactory,
};
use amq_protocol_types::AMQPValue;
use std::sync::atomic::Ordering;
use std::time::Duration;
use uuid::Uuid;
use warren::consumers::{Consumer, ConsumerError, ConsumerState};

#[tokio::test]
async fn starting_registers_with_prefetch_set_to_the_batch_size() {
    // Arrange
    let factory = MockFactory::new();
    let queue_name = Uuid::new_v4().to_string();
    let options = warren::options::ConsumerOptions {
        batch_size: Some(12),
        priority: Some(7),
        ..get_consumer_options(&queue_name)
    };

    // Act
    let (consumer, channel) = get_started_consumer(&factory, options).await;

    // Assert
    assert!(consumer.started());
    assert_eq!(consumer.state(), ConsumerState::Running);
    assert_eq!(channel.qos(), vec![12]);
    let registrations = channel.registrations();
    assert_eq!(registrations.len(), 1);
    let registration = &registrations[0];
    assert_eq!(registration.queue, queue_name);
    assert!(registration.consumer_tag.starts_with("TestConsumer."));
    assert!(!registration.options.no_ack);
    assert_eq!(
        registration.arguments.inner().get("x-priority"),
        Some(&AMQPValue::LongInt(7))
    );
    // Manual acknowledgement runs on a transient channel with confirms.
    assert!(channel.confirms);
    assert_eq!(consumer.get_consumer_buffer().unwrap().capacity(), 12);
}

#[tokio::test]
async fn starting_twice_registers_once() {
    // Arrange
    let factory = MockFactory::new();
    let (consumer, channel) =
        get_started_consumer(&factory, get_consumer_options("invoices")).await;

    // Act
    consumer.start_consumer().await.unwrap();

    // Assert
    assert_eq!(channel.registrations().len(), 1);
    assert_eq!(factory.channels().len(), 1);
}

#[tokio::test]
async fn a_disabled_consumer_does_not_start() {
    // Arrange
    let factory = MockFactory::new();
    let options = warren::options::ConsumerOptions {
        enabled: Some(false),
        ..get_consumer_options("invoices")
    };
    let consumer = Consumer::with_options(get_pool(&factory).await, options);

    // Act
    consumer.start_consumer().await.unwrap();

    // Assert
    assert!(!consumer.started());
    assert_eq!(factory.active_consumers(), 0);
    assert!(matches!(
        consumer.get_consumer_buffer(),
        Err(ConsumerError::BufferUnavailable)
    ));
}

#[tokio::test]
async fn unknown_consumers_cannot_be_built() {
    // Arrange
    let factory = MockFactory::new();
    let pool = get_pool(&factory).await;

    // Act
    let consumer = Consumer::new(pool, "Nope");

    // Assert
    assert!(matches!(consumer, Err(ConsumerError::UnknownConsumer(name)) if name == "Nope"));
}

#[tokio::test]
async fn auto_ack_consumers_on_pooled_channels_use_plain_channels() {
    // Arrange
    let factory = MockFactory::new();
    let options = warren::options::ConsumerOptions {
        auto_ack: Some(true),
        use_transient_channels: Some(false),
        ..get_consumer_options("audit")
    };

    // Act
    let (_consumer, channel) = get_started_consumer(&factory, options).await;

    // Assert
    assert!(!channel.confirms);
    assert!(channel.registrations()[0].options.no_ack);
}

#[tokio::test]
async fn registration_failures_are_retried_until_they_succeed() {
    // Arrange
    let factory = MockFactory::new();
    let consumer = Consumer::with_options(get_pool(&factory).await, get_consumer_options("q"));
    factory.faults.failing_consumes.store(3, Ordering::Release);

    // Act
    consumer.start_consumer().await.unwrap();

    // Assert
    assert!(consumer.started());
    assert_eq!(factory.active_consumers(), 1);
    // The channel is rebuilt after every failure.
    assert_eq!(factory.channels().len(), 4);
}

#[tokio::test]
async fn starting_gives_up_after_max_start_attempts() {
    // Arrange
    let factory = MockFactory::new();
    let options = warren::options::ConsumerOptions {
        max_start_attempts: Some(2),
        ..get_consumer_options("q")
    };
    let consumer = Consumer::with_options(get_pool(&factory).await, options);
    factory.faults.failing_consumes.store(5, Ordering::Release);

    // Act
    let outcome = consumer.start_consumer().await;

    // Assert
    assert!(matches!(
        outcome,
        Err(ConsumerError::StartRetriesExhausted { attempts: 2 })
    ));
    assert!(!consumer.started());
    assert_eq!(consumer.state(), ConsumerState::Stopped);
}

#[tokio::test]
async fn stopping_aborts_a_start_that_keeps_failing() {
    // Arrange
    let factory = MockFactory::new();
    let consumer = Consumer::with_options(get_pool(&factory).await, get_consumer_options("q"));
    factory.faults.failing_consumes.store(usize::MAX, Ordering::Release);
    let start = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.start_consumer().await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Act
    consumer.stop_consumer(false).await;

    // Assert
    assert!(matches!(
        start.await.unwrap(),
        Err(ConsumerError::StartAborted)
    ));
    assert!(!consumer.started());
    assert_eq!(factory.active_consumers(), 0);
}

#[tokio::test]
async fn a_start_issued_during_another_transition_is_a_no_op() {
    // Arrange
    let factory = MockFactory::new();
    let consumer = Consumer::with_options(get_pool(&factory).await, get_consumer_options("q"));
    factory.faults.failing_consumes.store(5, Ordering::Release);
    let first = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.start_consumer().await }
    });
    eventually(|| consumer.state() == ConsumerState::Starting).await;

    // Act
    consumer.start_consumer().await.unwrap();

    // Assert
    first.await.unwrap().unwrap();
    assert!(consumer.started());
    assert_eq!(factory.active_consumers(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_starts_and_stops_leave_a_consistent_state() {
    for round in 0..20 {
        // Arrange
        let factory = MockFactory::new();
        let consumer =
            Consumer::with_options(get_pool(&factory).await, get_consumer_options("q"));

        // Act
        let mut handles = Vec::new();
        for i in 0..8 {
            let consumer = consumer.clone();
            handles.push(tokio::spawn(async move {
                if (i + round) % 3 == 0 {
                    consumer.stop_consumer(i % 2 == 0).await;
                } else {
                    let _ = consumer.start_consumer().await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // Assert
        for channel in factory.channels() {
            assert!(channel.max_concurrent_consumers() <= 1);
        }
        if consumer.started() {
            assert_eq!(consumer.state(), ConsumerState::Running);
            assert_eq!(factory.active_consumers(), 1);
        } else {
            assert_eq!(consumer.state(), ConsumerState::Stopped);
            assert_eq!(factory.active_consumers(), 0);
        }
    }
}

#[tokio::test]
async fn a_stopped_consumer_can_be_started_again_on_a_fresh_channel() {
    // Arrange
    let factory = MockFactory::new();
    let (consumer, first_channel) =
        get_started_consumer(&factory, get_consumer_options("q")).await;
    let first_id = consumer.channel_id().await.unwrap();
    consumer.stop_consumer(false).await;

    // Act
    consumer.start_consumer().await.unwrap();

    // Assert
    assert!(consumer.started());
    assert_ne!(consumer.channel_id().await.unwrap(), first_id);
    assert_eq!(first_channel.active_consumers(), 0);
    assert_eq!(factory.active_consumers(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_stop_racing_a_failing_start_is_never_lost() {
    for _ in 0..50 {
        // Arrange
        let factory = MockFactory::new();
        let consumer =
            Consumer::with_options(get_pool(&factory).await, get_consumer_options("q"));
        factory
            .faults
            .failing_consumes
            .store(usize::MAX, Ordering::Release);

        // Act
        let start = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start_consumer().await }
        });
        let stop = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.stop_consumer(false).await }
        });

        // Assert
        tokio::time::timeout(Duration::from_secs(2), stop)
            .await
            .expect("the stop never returned")
            .unwrap();
        // A start that only began after the stop keeps retrying until the next one.
        let settled = tokio::time::timeout(Duration::from_secs(2), async {
            while !start.is_finished() {
                consumer.stop_consumer(false).await;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(settled.is_ok(), "the start never gave up");
        let outcome = start.await.unwrap();
        assert!(matches!(outcome, Ok(()) | Err(ConsumerError::StartAborted)));
        assert!(!consumer.started());
        assert_eq!(consumer.state(), ConsumerState::Stopped);
    }
}
