//! Serialized writes to one device
//!
//! The pad firmware drops reports that arrive back to back, so every write to
//! a device goes through a single FIFO task that runs one operation at a time
//! and leaves a minimum gap before the next one. Each operation is
//! acknowledged through its own oneshot channel.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::hid::{SharedConnection, WriteKind};
use super::DriverError;

const WRITE_QUEUE_CAPACITY: usize = 64;

type WriteAck = oneshot::Receiver<Result<(), DriverError>>;

struct WriteOp {
    kind: WriteKind,
    data: Vec<u8>,
    reply: oneshot::Sender<Result<(), DriverError>>,
}

#[derive(Clone)]
pub struct WriteQueueHandle {
    sender: mpsc::Sender<WriteOp>,
}

impl WriteQueueHandle {
    /// Appends a write. Resolves once the operation is queued, not once it
    /// is written; the returned receiver carries the outcome.
    pub async fn enqueue(&self, kind: WriteKind, data: Vec<u8>) -> Result<WriteAck, DriverError> {
        let (reply, ack) = oneshot::channel();
        self.sender
            .send(WriteOp { kind, data, reply })
            .await
            .map_err(|_| DriverError::QueueClosed)?;
        Ok(ack)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

/// Outcome of the writes issued by one device operation.
#[derive(Debug)]
pub struct PendingWrites {
    acks: Vec<WriteAck>,
}

impl PendingWrites {
    pub(crate) fn new(acks: Vec<WriteAck>) -> Self {
        Self { acks }
    }

    pub fn len(&self) -> usize {
        self.acks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.acks.is_empty()
    }

    /// Waits for every write. Returns the first failure; a write discarded
    /// because the device closed counts as [`DriverError::QueueClosed`].
    pub async fn acknowledged(self) -> Result<(), DriverError> {
        let mut outcome = Ok(());
        for ack in self.acks {
            let result = ack.await.unwrap_or(Err(DriverError::QueueClosed));
            if outcome.is_ok() {
                outcome = result;
            }
        }
        outcome
    }
}

pub fn spawn_write_queue(
    connection: SharedConnection,
    min_gap: Duration,
    cancel: CancellationToken,
) -> (WriteQueueHandle, JoinHandle<()>) {
    let (sender, receiver) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let task = tokio::spawn(run_write_queue(connection, receiver, min_gap, cancel));
    (WriteQueueHandle { sender }, task)
}

async fn run_write_queue(
    connection: SharedConnection,
    mut receiver: mpsc::Receiver<WriteOp>,
    min_gap: Duration,
    cancel: CancellationToken,
) {
    debug!("Write queue started with a {:?} gap", min_gap);

    loop {
        let op = tokio::select! {
            _ = cancel.cancelled() => break,
            op = receiver.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };

        let WriteOp { kind, data, reply } = op;
        let handle = connection.clone();
        let result = match tokio::task::spawn_blocking(move || handle.send(kind, &data)).await {
            Ok(result) => result,
            Err(e) => {
                error!("Write task failed: {}", e);
                Err(DriverError::Transport(format!("Write task failed: {}", e)))
            }
        };

        if let Err(e) = &result {
            warn!("{:?} write failed: {}", kind, e);
        }
        let _res = reply.send(result);

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(min_gap) => {}
        }
    }

    receiver.close();
    let mut discarded = 0;
    while receiver.try_recv().is_ok() {
        discarded += 1;
    }
    if discarded > 0 {
        debug!("Discarded {} pending writes", discarded);
    }
    debug!("Write queue stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::hid::mock::{MockHidPort, MockPad};
    use crate::driver::hid::HidPort;
    use crate::protocol::{PadConfigurationReport, ReportCodec};

    fn open_pad() -> (MockPad, SharedConnection) {
        let configuration = PadConfigurationReport {
            sensor_thresholds: vec![10, 20],
            release_threshold: 0.9,
            sensor_to_button_mapping: vec![0, 1],
        };
        let pad = MockPad::new("/dev/hidraw1", ReportCodec::new(2), &configuration, "pad").unwrap();
        let port = MockHidPort::new();
        port.add(pad.clone());
        let connection = SharedConnection::new(port.open(pad.path()).unwrap());
        (pad, connection)
    }

    #[tokio::test]
    async fn writes_run_in_order_with_gap() {
        let (pad, connection) = open_pad();
        let gap = Duration::from_millis(15);
        let (queue, _task) = spawn_write_queue(connection, gap, CancellationToken::new());

        let mut acks = Vec::new();
        for id in [4u8, 5, 3] {
            acks.push(queue.enqueue(WriteKind::Feature, vec![id, 0]).await.unwrap());
        }
        PendingWrites::new(acks).acknowledged().await.unwrap();

        let writes = pad.writes();
        let ids: Vec<u8> = writes.iter().map(|w| w.data[0]).collect();
        assert_eq!(ids, vec![4, 5, 3]);
        for pair in writes.windows(2) {
            assert!(pair[1].at.duration_since(pair[0].at) >= gap);
        }
    }

    #[tokio::test]
    async fn failed_write_is_reported_and_queue_continues() {
        let (pad, connection) = open_pad();
        let (queue, _task) =
            spawn_write_queue(connection, Duration::from_millis(1), CancellationToken::new());

        pad.fail_writes(true);
        let failed = queue.enqueue(WriteKind::Output, vec![3, 0]).await.unwrap();
        assert!(matches!(failed.await.unwrap(), Err(DriverError::Transport(_))));

        pad.fail_writes(false);
        let ok = queue.enqueue(WriteKind::Output, vec![3, 0]).await.unwrap();
        assert!(ok.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn cancelled_queue_rejects_new_writes() {
        let (_pad, connection) = open_pad();
        let cancel = CancellationToken::new();
        let (queue, task) = spawn_write_queue(connection, Duration::from_millis(1), cancel.clone());

        cancel.cancel();
        task.await.unwrap();

        assert!(queue.is_closed());
        assert!(matches!(
            queue.enqueue(WriteKind::Feature, vec![4, 0]).await,
            Err(DriverError::QueueClosed)
        ));
    }

    #[tokio::test]
    async fn cancelling_discards_queued_writes() {
        let (pad, connection) = open_pad();
        let cancel = CancellationToken::new();
        let (queue, task) =
            spawn_write_queue(connection, Duration::from_millis(200), cancel.clone());

        let first = queue.enqueue(WriteKind::Feature, vec![4, 0]).await.unwrap();
        let mut queued = Vec::new();
        for _ in 0..3 {
            queued.push(queue.enqueue(WriteKind::Feature, vec![4, 0]).await.unwrap());
        }
        assert!(first.await.unwrap().is_ok());

        cancel.cancel();
        task.await.unwrap();

        assert_eq!(pad.writes().len(), 1);
        for ack in queued {
            assert!(matches!(
                PendingWrites::new(vec![ack]).acknowledged().await,
                Err(DriverError::QueueClosed)
            ));
        }
    }
}
