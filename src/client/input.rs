//! Local command source.
//!
//! Reading stdin blocks, so it runs on its own thread and feeds a channel
//! that the command loop consumes. The receive loop is never stalled by it.

use std::io::BufRead;

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Commands buffered between the reader thread and the command loop
pub const COMMAND_QUEUE: usize = 32;

/// Spawn a thread that turns stdin lines into commands.
///
/// The channel closes on EOF. If the thread cannot be spawned the returned
/// channel is already closed and the viewer runs view-only.
pub fn spawn_stdin_commands() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let spawned = std::thread::Builder::new()
        .name("srvnc-stdin".into())
        .spawn(move || {
            let sent = read_commands(std::io::stdin().lock(), &tx);
            debug!("stdin closed after {sent} commands");
        });
    if let Err(e) = spawned {
        warn!("stdin reader unavailable: {e}");
    }
    rx
}

/// One command per line, as typed minus the line terminator. Returns how
/// many were queued.
fn read_commands<R: BufRead>(reader: R, tx: &mpsc::Sender<String>) -> usize {
    let mut sent = 0;
    for line in reader.lines() {
        let Ok(line) = line else { break };
        if tx.blocking_send(line).is_err() {
            break;
        }
        sent += 1;
    }
    sent
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_lines_become_commands_verbatim() {
        let (tx, mut rx) = mpsc::channel(8);
        let input = Cursor::new("click:100,200\n\n  key:enter  \r\ntype:a b");
        assert_eq!(read_commands(input, &tx), 4);
        drop(tx);

        assert_eq!(rx.blocking_recv().as_deref(), Some("click:100,200"));
        assert_eq!(rx.blocking_recv().as_deref(), Some(""));
        assert_eq!(rx.blocking_recv().as_deref(), Some("  key:enter  "));
        assert_eq!(rx.blocking_recv().as_deref(), Some("type:a b"));
        assert_eq!(rx.blocking_recv(), None);
    }

    #[test]
    fn test_stops_when_loop_is_gone() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        assert_eq!(read_commands(Cursor::new("a\nb\n"), &tx), 0);
    }
}
