//! End-to-end exercises of the public surface, the way two cooperating
//! processes would use it: separate `Log` handles for the producer and
//! each consumer.

use seglog::{ErrorKind, Log, Position};

fn enable_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

#[test]
fn producer_and_consumers_with_independent_handles() {
    enable_logging();
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("events");

    Log::new(&dir).init().unwrap();
    Log::new(&dir).add_subscriber("alpha", Position::Begin).unwrap();
    Log::new(&dir).add_subscriber("beta", Position::Begin).unwrap();

    let mut writer = Log::new(&dir).open_writer().unwrap();
    for i in 0..10u32 {
        writer.write(format!("event-{i}").as_bytes()).unwrap();
    }
    writer.close().unwrap();

    for subscriber in ["alpha", "beta"] {
        let mut reader = Log::new(&dir).open_reader(subscriber).unwrap();
        let interval = reader.read_interval().unwrap();
        assert_eq!(interval.count, 10);

        let mut id = interval.first;
        for i in 0..10u32 {
            let message = reader.read_message(id).unwrap();
            assert_eq!(message.payload, format!("event-{i}").as_bytes());
            id.marker += 1;
        }
        reader.read_checkpoint(interval.last).unwrap();
        assert_eq!(reader.read_interval().unwrap().count, 0);
    }
}

#[test]
fn subscriber_management() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("events");
    let log = Log::new(&dir);
    log.init().unwrap();

    log.add_subscriber("one", Position::Begin).unwrap();
    log.add_subscriber("two", Position::Begin).unwrap();
    assert_eq!(
        log.add_subscriber("one", Position::Begin).unwrap_err().kind(),
        ErrorKind::SubscriberExists
    );
    assert_eq!(log.list_subscribers().unwrap(), vec!["one", "two"]);

    let mut writer = log.open_writer().unwrap();
    writer.write(b"x").unwrap();
    writer.write(b"y").unwrap();
    writer.close().unwrap();

    let mut reader = log.open_reader("one").unwrap();
    let interval = reader.read_interval().unwrap();
    reader.read_checkpoint(interval.last).unwrap();
    drop(reader);

    // "three" picks up "one"'s position and sees nothing new.
    log.copy_checkpoint("one", "three").unwrap();
    assert_eq!(
        log.get_checkpoint("three").unwrap(),
        log.get_checkpoint("one").unwrap()
    );
    let mut reader = log.open_reader("three").unwrap();
    assert_eq!(reader.read_interval().unwrap().count, 0);
    drop(reader);

    assert!(log.remove_subscriber("three").unwrap());
    assert!(!log.remove_subscriber("three").unwrap());
    assert_eq!(
        log.open_reader("three").unwrap_err().kind(),
        ErrorKind::InvalidSubscriber
    );
}

#[test]
fn init_refuses_an_existing_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("events");
    let log = Log::new(&dir);
    log.init().unwrap();
    assert_eq!(log.init().unwrap_err().kind(), ErrorKind::CreateExists);
}

#[test]
fn clean_drops_segments_a_removed_subscriber_held() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("events");
    let mut log = Log::new(&dir);
    log.set_journal_size(64);
    log.init().unwrap();
    log.add_subscriber("fast", Position::Begin).unwrap();
    log.add_subscriber("slow", Position::Begin).unwrap();

    let mut writer = log.open_writer().unwrap();
    for i in 0..9u32 {
        writer.write(format!("payload{i}").as_bytes()).unwrap();
    }
    writer.close().unwrap();

    // "fast" consumes everything, but "slow" pins the whole history.
    let mut reader = log.open_reader("fast").unwrap();
    loop {
        let interval = reader.read_interval().unwrap();
        if interval.count == 0 {
            break;
        }
        reader.read_checkpoint(interval.last).unwrap();
    }
    drop(reader);
    assert!(dir.join("00000000").exists());
    assert!(dir.join("00000001").exists());

    // Dropping the laggard leaves its segments orphaned; clean reclaims
    // everything below the earliest remaining checkpoint.
    assert!(log.remove_subscriber("slow").unwrap());
    assert!(log.clean().unwrap() >= 2);
    assert!(!dir.join("00000000").exists());
    assert!(!dir.join("00000001").exists());
}

#[test]
fn tail_style_consumption_with_advance_id() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("events");
    let mut log = Log::new(&dir);
    log.set_journal_size(64);
    log.init().unwrap();
    log.add_subscriber("tail", Position::Begin).unwrap();

    let mut writer = Log::new(&dir).open_writer().unwrap();
    for i in 0..7u32 {
        writer.write(format!("chunk-{i:02}").as_bytes()).unwrap();
    }
    writer.close().unwrap();

    let mut reader = log.open_reader("tail").unwrap();
    let mut seen = Vec::new();
    loop {
        let interval = reader.read_interval().unwrap();
        if interval.count == 0 {
            break;
        }
        let mut start = interval.first;
        let mut finish = interval.last;
        let mut cur = start;
        loop {
            seen.push(reader.read_message(cur).unwrap().payload.to_vec());
            if cur == finish {
                break;
            }
            reader.advance_id(cur, &mut start, &mut finish).unwrap();
            cur = start;
        }
        reader.read_checkpoint(finish).unwrap();
    }
    let expect: Vec<Vec<u8>> = (0..7u32)
        .map(|i| format!("chunk-{i:02}").into_bytes())
        .collect();
    assert_eq!(seen, expect);
}
