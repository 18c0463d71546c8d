use tempfile::TempDir;

use crate::{Log, Reader};

pub fn enable_logging() {
    let _ = env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .format_timestamp(None)
        .is_test(true)
        .try_init();
}

/// A `Log` handle on a fresh, not-yet-initialized directory inside `tmp`.
pub fn new_log(tmp: &TempDir) -> Log {
    Log::new(tmp.path().join("log"))
}

/// An initialized log with default options.
pub fn init_log(tmp: &TempDir) -> Log {
    let log = new_log(tmp);
    log.init().unwrap();
    log
}

/// Eight-byte payloads `msg00000`, `msg00001`, …
pub fn payloads(n: usize) -> Vec<Vec<u8>> {
    (0..n).map(|i| format!("msg{i:05}").into_bytes()).collect()
}

/// Read and acknowledge everything currently visible to `reader`.
pub fn drain(reader: &mut Reader) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    loop {
        let interval = reader.read_interval().unwrap();
        if interval.count == 0 {
            break;
        }
        let mut id = interval.first;
        for _ in 0..interval.count {
            out.push(reader.read_message(id).unwrap().payload.to_vec());
            id.marker += 1;
        }
        reader.read_checkpoint(interval.last).unwrap();
    }
    out
}
